pub mod aggregation;
pub mod damping;
pub mod decision;
pub mod dump;
pub mod fanout;
pub mod filter;
pub mod nexthop;
pub mod rib_in;
pub mod rib_out;

pub use aggregation::AggregationTable;
pub use damping::DampingTable;
pub use decision::DecisionTable;
pub use dump::{DumpTable, DumpTableState};
pub use fanout::{FanoutTable, QueueOp};
pub use filter::{FilterBank, FilterVerdict};
pub use nexthop::NexthopTable;
pub use rib_in::RibInTable;
pub use rib_out::{RibOutTable, SinkStatus, UpdateBuilder, UpdateSink};

use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;

use crate::peer::{Genid, PeerId};
use crate::routes::{RouteMessage, RouteOp, RouteOutcome, SubnetRoute};

/// Which table a node is; dispatch decisions that the original design
/// made via runtime type inspection key off this tag instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableRole {
    RibIn,
    Filter,
    Damping,
    Nexthop,
    Decision,
    Aggregation,
    Fanout,
    Dump,
    RibOut,
}

/// A one-off timer a table asks the scheduler for (damping reuse)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReuseRequest {
    pub net: IpNetwork,
    pub delay: Duration,
}

/// What one table operation produced: the outcome for the caller plus
/// the messages emitted on the downstream edge, in order.
#[derive(Debug, Default)]
pub struct TableOutput {
    pub outcome: Option<RouteOutcome>,
    pub ops: Vec<RouteOp>,
    pub timers: Vec<ReuseRequest>,
}

impl TableOutput {
    pub fn used(op: RouteOp) -> Self {
        TableOutput {
            outcome: Some(RouteOutcome::Used),
            ops: vec![op],
            timers: vec![],
        }
    }

    pub fn outcome(outcome: RouteOutcome) -> Self {
        TableOutput {
            outcome: Some(outcome),
            ops: vec![],
            timers: vec![],
        }
    }

    pub fn pass_through(ops: Vec<RouteOp>) -> Self {
        TableOutput {
            outcome: Some(RouteOutcome::Used),
            ops,
            timers: vec![],
        }
    }
}

/// The contract every route table conforms to.
///
/// The common operations carry one message across one edge of the graph
/// and report what flows out the other side; lifecycle notifications
/// bracket per-peer state. Tables with pull-mode output (the fanout) add
/// inherent methods on top.
pub trait RouteTable {
    fn role(&self) -> TableRole;
    fn name(&self) -> &str;

    fn add_route(&mut self, msg: RouteMessage, now: Instant) -> TableOutput;
    fn replace_route(&mut self, old: RouteMessage, new: RouteMessage, now: Instant)
        -> TableOutput;
    fn delete_route(&mut self, msg: RouteMessage, now: Instant) -> TableOutput;

    /// Same as add, but sourced from a dump table walking a snapshot
    fn route_dump(&mut self, msg: RouteMessage, _dump_peer: PeerId, now: Instant) -> TableOutput {
        self.add_route(msg, now)
    }

    /// Batch boundary; downstream may flush
    fn push(&mut self) -> TableOutput {
        TableOutput::pass_through(vec![RouteOp::Push])
    }

    /// Stateless query, answered by the tables that store routes
    fn lookup_route(&self, _net: &IpNetwork) -> Option<(&Arc<SubnetRoute>, Genid)> {
        None
    }

    /// Downstream no-longer/now references this route (bounds resolver work)
    fn route_used(&mut self, _net: IpNetwork, _peer: PeerId, _in_use: bool) {}

    /// Advisory: a peer already down-and-deleting is relevant to this
    /// table (dump tables mask its stale state)
    fn peering_is_down(&mut self, _peer: PeerId, _genid: Genid) {}

    fn peering_went_down(&mut self, _peer: PeerId, _genid: Genid) -> Vec<RouteOp> {
        vec![]
    }

    fn peering_down_complete(&mut self, _peer: PeerId, _genid: Genid) -> Vec<RouteOp> {
        vec![]
    }

    fn peering_came_up(&mut self, _peer: PeerId, _genid: Genid) {}
}
