use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::Deserialize;
use toml;

use super::DampingConfig;
use crate::families::Family;
use crate::peer::PeerType;

struct Defaults {}

impl Defaults {
    fn enabled() -> bool {
        true
    }

    fn default_local_pref() -> u32 {
        100
    }

    fn families() -> Vec<Family> {
        use bgp_rs::{AFI, SAFI};
        vec![
            Family::new(AFI::IPV4, SAFI::Unicast),
            Family::new(AFI::IPV6, SAFI::Unicast),
        ]
    }

    fn halflife_minutes() -> u64 {
        15
    }

    fn reuse_threshold() -> u32 {
        750
    }

    fn cutoff_threshold() -> u32 {
        2000
    }

    fn max_suppress_minutes() -> u64 {
        60
    }

    fn damping_enabled() -> bool {
        false
    }
}

/// Config (toml) representation of a Peer Config
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerConfigSpec {
    // Peer connection details
    pub(super) remote_ip: IpAddr,
    pub(super) remote_as: u32,
    // The peer's BGP identifier, defaulting to its address
    pub(super) router_id: Option<Ipv4Addr>,

    // ebgp | ibgp | ibgp-client | ebgp-confed; derived from the AS
    // numbers when not given
    #[serde(rename = "type")]
    pub(super) peer_type: Option<String>,

    // Local address on the link to this peer (next-hop rewrites)
    pub(super) local_address: Option<IpAddr>,

    #[serde(default)]
    pub(super) directly_connected: bool,

    // Shared subnet, enables third-party next-hop preservation
    pub(super) subnet: Option<IpNetwork>,

    #[serde(default)]
    pub(super) confederation_peer: bool,

    // AFI/SAFI Families to process for this peer
    #[serde(default = "Defaults::families")]
    pub(super) families: Vec<Family>,

    // Peer is configured and allowed to exchange routes
    #[serde(default = "Defaults::enabled")]
    pub(super) enabled: bool,
}

impl PeerConfigSpec {
    pub(super) fn peer_type(&self, local_as: u32) -> PeerType {
        match self.peer_type.as_deref() {
            Some("ebgp") => PeerType::Ebgp,
            Some("ibgp") => PeerType::Ibgp,
            Some("ibgp-client") => PeerType::IbgpClient,
            Some("ebgp-confed") => PeerType::EbgpConfed,
            _ => {
                if self.remote_as == local_as {
                    PeerType::Ibgp
                } else {
                    PeerType::Ebgp
                }
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct DampingSpec {
    #[serde(default = "Defaults::damping_enabled")]
    pub(super) enabled: bool,
    // Half-lives in minutes, reachable (ok) and unreachable (ng)
    #[serde(default = "Defaults::halflife_minutes")]
    pub(super) halflife_ok: u64,
    #[serde(default = "Defaults::halflife_minutes")]
    pub(super) halflife_ng: u64,
    #[serde(default = "Defaults::reuse_threshold")]
    pub(super) reuse_threshold: u32,
    #[serde(default = "Defaults::cutoff_threshold")]
    pub(super) cutoff_threshold: u32,
    #[serde(default = "Defaults::max_suppress_minutes")]
    pub(super) max_suppress: u64,
}

impl DampingSpec {
    pub(super) fn into_config(self) -> DampingConfig {
        DampingConfig {
            enabled: self.enabled,
            half_life_reachable: Duration::from_secs(self.halflife_ok * 60),
            half_life_unreachable: Duration::from_secs(self.halflife_ng * 60),
            reuse_threshold: self.reuse_threshold,
            cutoff_threshold: self.cutoff_threshold,
            max_suppress: Duration::from_secs(self.max_suppress * 60),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct AggregateSpec {
    pub(super) prefix: IpNetwork,
    #[serde(default)]
    pub(super) brief_mode: bool,
    #[serde(default = "Defaults::enabled")]
    pub(super) enabled: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Global Router-ID
    pub(super) router_id: Ipv4Addr,
    // Global ASN
    pub(super) default_as: u32,
    // Local address used for next-hop rewrites when peers don't override
    pub(super) local_address: Option<IpAddr>,
    // Presence makes this speaker a route reflector
    pub(super) cluster_id: Option<Ipv4Addr>,
    #[serde(default = "Defaults::default_local_pref")]
    pub(super) default_local_pref: u32,
    pub(super) confederation_id: Option<u32>,
    pub(super) damping: Option<DampingSpec>,
    #[serde(default = "Vec::new")]
    pub(super) aggregates: Vec<AggregateSpec>,
    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerConfigSpec>,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: ServerConfigSpec = toml::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
router_id = "10.0.0.1"
default_as = 65001
local_address = "10.0.0.1"
default_local_pref = 100

[damping]
enabled = true
halflife_ok = 15
cutoff_threshold = 2000

[[aggregates]]
prefix = "10.0.0.0/16"
brief_mode = true

[[peers]]
remote_ip = "10.0.0.10"
remote_as = 65010
directly_connected = true
subnet = "10.0.0.0/24"

[[peers]]
remote_ip = "10.0.0.30"
remote_as = 65001
type = "ibgp-client"
families = ["ipv4 unicast", "ipv6 unicast"]
"#;

    #[test]
    fn test_parse_config() {
        let spec: ServerConfigSpec = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(spec.router_id, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(spec.default_as, 65001);
        assert_eq!(spec.peers.len(), 2);

        let ebgp = &spec.peers[0];
        assert_eq!(ebgp.peer_type(spec.default_as), PeerType::Ebgp);
        assert!(ebgp.directly_connected);
        assert!(ebgp.subnet.is_some());

        let client = &spec.peers[1];
        assert_eq!(client.peer_type(spec.default_as), PeerType::IbgpClient);
        assert_eq!(client.families.len(), 2);

        let damping = spec.damping.unwrap().into_config();
        assert!(damping.enabled);
        assert_eq!(damping.half_life_reachable, Duration::from_secs(900));
        assert_eq!(spec.aggregates.len(), 1);
        assert!(spec.aggregates[0].brief_mode);
    }
}
