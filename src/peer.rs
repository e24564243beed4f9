use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;

/// Unique identity of a peering within the speaker.
///
/// This stays stable across peering restarts; each restart gets a new
/// generation id instead (see [`Genid`]).
pub type PeerId = u32;

/// Generation id assigned to a peer each time the peering comes up.
/// Messages from a prior incarnation carry the old value and are
/// discriminated downstream (the dump table relies on this).
pub type Genid = u32;

/// Genid for routes not attributable to a peering incarnation
/// (aggregates and other internally sourced state).
pub const GENID_UNKNOWN: Genid = 0;

/// Handle for delivery into the local RIB output branch
pub const LOCAL_RIB_PEER: PeerId = 0;
/// Handle under which self-originated routes enter the pipeline
pub const ORIGINATE_PEER: PeerId = 1;
/// Handle under which recomputed aggregates enter the fanout
pub const AGGREGATION_PEER: PeerId = 2;
/// First id handed out to a configured peering
pub const FIRST_PEER_ID: PeerId = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerType {
    Ebgp,
    Ibgp,
    /// IBGP peer we act as a route reflector for
    IbgpClient,
    EbgpConfed,
    /// The local RIB / originate handles
    Internal,
}

impl PeerType {
    /// Is this peering on the IBGP side of the speaker (including the
    /// local RIB branch)?
    pub fn is_ibgp(self) -> bool {
        matches!(
            self,
            PeerType::Ibgp | PeerType::IbgpClient | PeerType::Internal
        )
    }

    pub fn is_ebgp(self) -> bool {
        matches!(self, PeerType::Ebgp | PeerType::EbgpConfed)
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            PeerType::Ebgp => "EBGP",
            PeerType::Ibgp => "IBGP",
            PeerType::IbgpClient => "IBGP client",
            PeerType::EbgpConfed => "EBGP confed",
            PeerType::Internal => "Internal",
        };
        write!(f, "{}", word)
    }
}

/// Everything the pipeline needs to know about one peering.
///
/// Built at plumbing time from the peer config; tables copy the fields
/// they dispatch on rather than holding a registry reference.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub id: PeerId,
    /// Remote router id (BGP identifier)
    pub bgp_id: Ipv4Addr,
    /// Remote peering address
    pub addr: IpAddr,
    /// Remote AS (the neighbouring AS for MED comparison)
    pub remote_as: u32,
    pub peer_type: PeerType,
    /// Local address on the shared link, used as the rewritten next-hop
    pub local_addr: IpAddr,
    /// Shared subnet with the peer, when directly connected
    pub subnet: Option<IpNetwork>,
    pub directly_connected: bool,
    pub confederation_peer: bool,
}

impl PeerHandle {
    /// Handle for the local RIB output branch
    pub fn local_rib(local_addr: IpAddr) -> Self {
        PeerHandle {
            id: LOCAL_RIB_PEER,
            bgp_id: Ipv4Addr::UNSPECIFIED,
            addr: local_addr,
            remote_as: 0,
            peer_type: PeerType::Internal,
            local_addr,
            subnet: None,
            directly_connected: false,
            confederation_peer: false,
        }
    }

    /// Handle under which the speaker's own routes are injected
    pub fn originate(local_addr: IpAddr) -> Self {
        PeerHandle {
            id: ORIGINATE_PEER,
            ..Self::local_rib(local_addr)
        }
    }

    /// Did the speaker itself originate routes carried under this handle?
    pub fn is_originate(&self) -> bool {
        self.id == ORIGINATE_PEER
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Peer {} {} id={}>", self.addr, self.peer_type, self.id)
    }
}

/// Router-wide identity threaded through table construction
#[derive(Clone, Debug)]
pub struct RouterInfo {
    pub local_as: u32,
    pub bgp_id: Ipv4Addr,
    /// Set when this speaker acts as a route reflector
    pub cluster_id: Option<Ipv4Addr>,
    pub default_local_pref: u32,
    pub confederation_id: Option<u32>,
}

impl RouterInfo {
    pub fn route_reflector(&self) -> bool {
        self.cluster_id.is_some()
    }

    /// Cluster id, defaulting to the BGP identifier (RFC 4456)
    pub fn cluster_id(&self) -> Ipv4Addr {
        self.cluster_id.unwrap_or(self.bgp_id)
    }
}
