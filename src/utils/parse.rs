use std::error::Error;
use std::fmt;
use std::io;
use std::net::{AddrParseError, IpAddr};
use std::num::ParseIntError;

use bgp_rs::{Prefix, AFI};
use ipnetwork::IpNetwork;

#[derive(Debug)]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: String) -> Self {
        ParseError { reason }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseError: {}", self.reason)
    }
}

impl Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(error: io::Error) -> Self {
        ParseError::new(error.to_string())
    }
}

/// Convert an ASN string to a u32
/// E.g. "65000.100" -> 42598400100
pub fn asn_from_dotted(value: &str) -> std::result::Result<u32, ParseError> {
    // Parse to list of u32, since we should support 4 byte ASN as a single int
    // (E.g. "42598400100")
    let mut chunks = [0; 2];
    let check_for_overflow = value.contains('.');
    // Iterate through chunks in reverse, so if there's no dot (only one number),
    // it will be in the least significant position
    for (i, chunk) in value
        .splitn(2, '.')
        .collect::<Vec<&str>>()
        .into_iter()
        .rev()
        .enumerate()
    {
        let chunk: u32 = chunk
            .parse()
            .map_err(|err| ParseError::new(format!("{} '{}'", err, value)))?;
        if check_for_overflow && chunk > std::u16::MAX as u32 {
            return Err(ParseError::new(format!("Unsupported ASN '{}'", value)));
        }
        chunks[i] = chunk;
    }
    Ok((chunks[1] * 65536) + chunks[0])
}

/// Convert a CIDR prefix (E.g. "192.168.0.0/24") to a bgp_rs::Prefix
pub fn prefix_from_str(prefix: &str) -> std::result::Result<Prefix, ParseError> {
    if let Some(i) = prefix.find('/') {
        let (addr, mask) = prefix.split_at(i);
        let mask = &mask[1..]; // Skip remaining '/'
        let addr: IpAddr = addr
            .parse()
            .map_err(|err: AddrParseError| ParseError::new(format!("{} '{}'", err, prefix)))?;
        let length: u8 = mask
            .parse()
            .map_err(|err: ParseIntError| ParseError::new(format!("{} '{}'", err, prefix)))?;
        let (protocol, octets) = match addr {
            IpAddr::V4(v4) => (AFI::IPV4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (AFI::IPV6, v6.octets().to_vec()),
        };
        Ok(Prefix {
            protocol,
            length,
            prefix: octets,
        })
    } else {
        Err(ParseError {
            reason: format!("Not a valid prefix: '{}'", prefix),
        })
    }
}

pub fn prefix_from_network(network: &IpNetwork) -> Prefix {
    let (protocol, octets) = match network {
        IpNetwork::V4(v4) => (AFI::IPV4, v4.ip().octets().to_vec()),
        IpNetwork::V6(v6) => (AFI::IPV6, v6.ip().octets().to_vec()),
    };
    Prefix {
        protocol,
        length: network.prefix(),
        prefix: octets,
    }
}

/// Convert a wire-facing prefix into the prefix key tables use
pub fn network_from_prefix(prefix: &Prefix) -> Result<IpNetwork, ParseError> {
    let addr = match prefix.protocol {
        AFI::IPV4 => {
            let mut octets = [0u8; 4];
            let len = prefix.prefix.len().min(4);
            octets[..len].clone_from_slice(&prefix.prefix[..len]);
            IpAddr::from(octets)
        }
        AFI::IPV6 => {
            let mut octets = [0u8; 16];
            let len = prefix.prefix.len().min(16);
            octets[..len].clone_from_slice(&prefix.prefix[..len]);
            IpAddr::from(octets)
        }
        _ => {
            return Err(ParseError::new(format!(
                "Unsupported prefix protocol: {:?}",
                prefix.protocol
            )))
        }
    };
    IpNetwork::new(addr, prefix.length)
        .map_err(|err| ParseError::new(format!("{} '{:?}'", err, prefix.prefix)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asn_from_dotted() {
        assert_eq!(asn_from_dotted("100").unwrap(), 100);
        assert_eq!(asn_from_dotted("65000.100").unwrap(), 4259840100);
        assert_eq!(asn_from_dotted("4259840100").unwrap(), 4259840100);
        assert!(asn_from_dotted("4259840100.200").is_err());
        assert!(asn_from_dotted("200.4259840100").is_err());
        assert!(asn_from_dotted("100.200300").is_err());
        assert!(asn_from_dotted("test").is_err());
    }

    #[test]
    fn test_prefix_from_string() {
        let prefix = prefix_from_str("1.1.1.0/24").unwrap();
        assert_eq!(prefix.length, 24);
        assert_eq!(prefix.prefix, [1, 1, 1, 0]);

        let prefix = prefix_from_str("2001:10::2/64").unwrap();
        assert_eq!(prefix.length, 64);
        assert_eq!(
            prefix.prefix,
            [32, 1, 0, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]
        );
    }

    #[test]
    fn test_network_round_trip() {
        let network: IpNetwork = "192.0.2.0/24".parse().unwrap();
        let prefix = prefix_from_network(&network);
        assert_eq!(network_from_prefix(&prefix).unwrap(), network);

        let network: IpNetwork = "2001:db8::/32".parse().unwrap();
        let prefix = prefix_from_network(&network);
        assert_eq!(network_from_prefix(&prefix).unwrap(), network);
    }
}
