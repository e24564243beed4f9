mod handler;
mod rpc;

pub use handler::Api;
pub use rpc::{ApiServer, BranchInfo, DampingEntry, PeerInfo, PipelineInfo, RouteEntry, RouteSpec};
