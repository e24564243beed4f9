use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::slice::Iter;

use serde::Serialize;

use crate::utils::u32_to_dotted;

/// NO_EXPORT well-known community (RFC 1997)
pub const NO_EXPORT: u32 = 0xFFFF_FF01;
/// NO_ADVERTISE well-known community (RFC 1997)
pub const NO_ADVERTISE: u32 = 0xFFFF_FF02;
/// NO_EXPORT_SUBCONFED well-known community (RFC 1997)
pub const NO_EXPORT_SUBCONFED: u32 = 0xFFFF_FF03;

#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Community {
    STANDARD(u32),
    EXTENDED(u64),
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Community::STANDARD(value) => match *value {
                NO_EXPORT => write!(f, "no-export"),
                NO_ADVERTISE => write!(f, "no-advertise"),
                NO_EXPORT_SUBCONFED => write!(f, "no-export-subconfed"),
                value => write!(f, "{}", u32_to_dotted(value, ':')),
            },
            Community::EXTENDED(value) => write!(f, "{}", ext_community_to_display(*value)),
        }
    }
}

impl TryFrom<&str> for Community {
    type Error = io::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "no-export" => return Ok(Community::STANDARD(NO_EXPORT)),
            "no-advertise" => return Ok(Community::STANDARD(NO_ADVERTISE)),
            "no-export-subconfed" => return Ok(Community::STANDARD(NO_EXPORT_SUBCONFED)),
            _ => (),
        }
        // Parse to list of u32, since we should support 4 byte ASN as a single int
        // (E.g. "42598400100")
        let chunks: Vec<_> = value.split(':').collect();
        match chunks.len() {
            1 => chunks[0]
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid community"))
                .map(|c| Ok(Community::STANDARD(c)))?,
            2 => {
                let (a, b) = (
                    chunks[0].parse::<u32>().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "Invalid community")
                    })?,
                    chunks[1].parse::<u32>().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "Invalid community")
                    })?,
                );
                Ok(Community::STANDARD((a * 65536) + b))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid community",
            )),
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CommunityList(pub Vec<Community>);

impl CommunityList {
    pub fn iter(&self) -> Iter<Community> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Does the list carry the given standard community value?
    pub fn contains(&self, value: u32) -> bool {
        self.0.contains(&Community::STANDARD(value))
    }

    pub fn standard(&self) -> Vec<u32> {
        self.0
            .iter()
            .filter_map(|c| {
                if let Community::STANDARD(comm) = c {
                    Some(*comm)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn extended(&self) -> Vec<u64> {
        self.0
            .iter()
            .filter_map(|c| {
                if let Community::EXTENDED(comm) = c {
                    Some(*comm)
                } else {
                    None
                }
            })
            .collect()
    }
}

impl fmt::Display for CommunityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let communities = self
            .0
            .iter()
            .map(std::string::ToString::to_string)
            .collect::<Vec<String>>()
            .join(" ");
        write!(f, "{}", communities)
    }
}

fn ext_community_to_display(value: u64) -> String {
    let c_type: u16 = ((value >> 48) & 0xff) as u16;
    match c_type {
        // 2-octet AS Specific Extended Community (RFC 4360)
        0x0 => {
            let asn: u16 = ((value >> 32) & 0xffff) as u16;
            let community: u32 = (value & 0xffff_ffff) as u32;
            format!("{}:{}", asn, u32_to_dotted(community, '.'))
        }
        // IPv4 Address Specific Extended Community (RFC 4360)
        0x1 => {
            let addr: u32 = ((value >> 24) & 0xffff_ffff) as u32;
            let asn: u16 = (value & 0xffff) as u16;
            format!("{}:{}", IpAddr::from(addr.to_be_bytes()), asn)
        }
        // 4-octet AS Specific BGP Extended Community (RFC 5668)
        0x2 => {
            let asn: u16 = ((value >> 32) & 0xffff) as u16;
            let addr: u32 = (value & 0xffff_ffff) as u32;
            format!("target:{}:{}", asn, IpAddr::from(addr.to_be_bytes()))
        }
        // Opaque Extended Community (RFC 4360)
        0x3 => format!("opaque:{}", value),
        _ => format!("unknown:{}:{}", c_type, value),
    }
}
