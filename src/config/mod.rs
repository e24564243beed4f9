mod file;

use std::io::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;

use crate::families::Families;
use crate::peer::{PeerType, RouterInfo};

/// Parse a TOML config file and return a ServerConfig
pub fn from_file(path: &str) -> Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_file(path)?;
    Ok(ServerConfig::from_spec(spec))
}

#[derive(Debug)]
pub struct ServerConfig {
    pub router_id: Ipv4Addr,
    pub default_as: u32,
    /// Local address used as the rewritten next-hop when a peer has no
    /// per-peer override
    pub local_address: IpAddr,
    pub cluster_id: Option<Ipv4Addr>,
    pub default_local_pref: u32,
    pub confederation_id: Option<u32>,
    pub damping: DampingConfig,
    pub aggregates: Vec<AggregateConfig>,
    pub peers: Vec<Arc<PeerConfig>>,
}

impl ServerConfig {
    pub fn router_info(&self) -> RouterInfo {
        RouterInfo {
            local_as: self.default_as,
            bgp_id: self.router_id,
            cluster_id: self.cluster_id,
            default_local_pref: self.default_local_pref,
            confederation_id: self.confederation_id,
        }
    }
}

/// In-Memory Server representation of a Peer config
///   Has missing spec items defaulted to Server values
#[derive(Debug)]
pub struct PeerConfig {
    pub remote_ip: IpAddr,
    pub remote_as: u32,
    /// The peer's BGP identifier (decision tiebreak); learned at OPEN
    /// time in a live session, configurable for static setups
    pub router_id: Ipv4Addr,
    pub peer_type: PeerType,
    pub local_address: IpAddr,
    pub directly_connected: bool,
    /// Shared subnet with the peer, for third-party next-hop
    pub subnet: Option<IpNetwork>,
    pub confederation_peer: bool,
    pub families: Families,
    pub enabled: bool,
}

impl PeerConfig {
    // Is this an eBGP session
    pub fn is_ebgp(&self) -> bool {
        self.peer_type.is_ebgp()
    }
}

/// RFC 2439 parameters, per-AFI/SAFI
#[derive(Clone, Debug)]
pub struct DampingConfig {
    pub enabled: bool,
    /// Decay half-life while the route is reachable
    pub half_life_reachable: Duration,
    /// Decay half-life while suppressed/unreachable
    pub half_life_unreachable: Duration,
    pub reuse_threshold: u32,
    pub cutoff_threshold: u32,
    pub max_suppress: Duration,
}

impl Default for DampingConfig {
    fn default() -> Self {
        DampingConfig {
            enabled: false,
            half_life_reachable: Duration::from_secs(15 * 60),
            half_life_unreachable: Duration::from_secs(15 * 60),
            reuse_threshold: 750,
            cutoff_threshold: 2000,
            max_suppress: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AggregateConfig {
    pub prefix: IpNetwork,
    /// Summarise with an empty AS_PATH + ATOMIC_AGGREGATE instead of
    /// an AS_SET merge
    pub brief_mode: bool,
    pub enabled: bool,
}

impl ServerConfig {
    fn from_spec(spec: file::ServerConfigSpec) -> Self {
        let local_address = spec.local_address.unwrap_or(IpAddr::V4(spec.router_id));
        let peers: Vec<_> = spec
            .peers
            .iter()
            .map(|p| {
                let peer_type = p.peer_type(spec.default_as);
                Arc::new(PeerConfig {
                    remote_ip: p.remote_ip,
                    remote_as: p.remote_as,
                    router_id: p.router_id.unwrap_or_else(|| match p.remote_ip {
                        IpAddr::V4(v4) => v4,
                        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                    }),
                    peer_type,
                    local_address: p.local_address.unwrap_or(local_address),
                    directly_connected: p.directly_connected,
                    subnet: p.subnet,
                    confederation_peer: p.confederation_peer,
                    families: Families::new(p.families.clone()),
                    enabled: p.enabled,
                })
            })
            .collect();

        Self {
            router_id: spec.router_id,
            default_as: spec.default_as,
            local_address,
            cluster_id: spec.cluster_id,
            default_local_pref: spec.default_local_pref,
            confederation_id: spec.confederation_id,
            damping: spec
                .damping
                .map(|d| d.into_config())
                .unwrap_or_default(),
            aggregates: spec
                .aggregates
                .iter()
                .map(|a| AggregateConfig {
                    prefix: a.prefix,
                    brief_mode: a.brief_mode,
                    enabled: a.enabled,
                })
                .collect(),
            peers,
        }
    }
}
