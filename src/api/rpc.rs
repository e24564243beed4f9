use std::net::IpAddr;

use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};

#[rpc(server)]
pub trait Api {
    #[method(name = "show_peers")]
    async fn show_peers(&self) -> RpcResult<Vec<PeerInfo>>;

    #[method(name = "show_pipeline")]
    async fn show_pipeline(&self) -> RpcResult<Vec<PipelineInfo>>;

    /// Begin a stable-order walk over one family's route tables
    #[method(name = "create_route_reader")]
    async fn create_route_reader(&self, family: String) -> RpcResult<u32>;

    /// Next route under a reader token; None signals end-of-table
    #[method(name = "read_next")]
    async fn read_next(&self, token: u32) -> RpcResult<Option<RouteEntry>>;

    #[method(name = "drop_route_reader")]
    async fn drop_route_reader(&self, token: u32) -> RpcResult<()>;

    #[method(name = "show_damping")]
    async fn show_damping(&self, family: String) -> RpcResult<Vec<DampingEntry>>;

    #[method(name = "advertise_route")]
    async fn advertise_route(&self, route: RouteSpec) -> RpcResult<()>;

    #[method(name = "withdraw_route")]
    async fn withdraw_route(&self, family: String, prefix: String) -> RpcResult<()>;
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PeerInfo {
    pub peer: String,
    pub peer_type: String,
    pub remote_as: u32,
    pub enabled: bool,
    pub up: bool,
    pub genid: Option<u32>,
    pub msg_received: u64,
    pub uptime: Option<String>,
    pub prefixes_received: usize,
    pub prefixes_damped: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PipelineInfo {
    pub family: String,
    pub peers: usize,
    pub winners: usize,
    pub queue_len: usize,
    pub held_nexthops: usize,
    pub branches: Vec<BranchInfo>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BranchInfo {
    pub peer: u32,
    pub ready: bool,
    pub lag: u64,
    pub dumping: bool,
}

/// Damping history for one prefix
#[derive(Debug, Deserialize, Serialize)]
pub struct DampingEntry {
    pub peer: u32,
    pub prefix: String,
    pub figure_of_merit: u32,
    pub damped: bool,
}

/// One route as the reader walks it
#[derive(Debug, Deserialize, Serialize)]
pub struct RouteEntry {
    pub peer: u32,
    pub prefix: String,
    pub next_hop: Option<IpAddr>,
    pub origin: String,
    pub as_path: String,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub communities: Vec<String>,
    pub winner: bool,
}

/// API input for a route this speaker should originate
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RouteSpec {
    /// Prefix to advertise (E.g. "100.1.0.0/16" or "2620:100:ab::/64")
    pub prefix: String,
    /// Next-hop to reach this prefix
    pub next_hop: IpAddr,
    pub origin: Option<String>,
    #[serde(default = "Vec::new")]
    pub as_path: Vec<String>,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    #[serde(default = "Vec::new")]
    pub communities: Vec<String>,
}
