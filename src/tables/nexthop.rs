use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use ipnetwork::IpNetwork;
use log::{debug, trace};

use super::{RouteTable, TableOutput, TableRole};
use crate::peer::PeerId;
use crate::routes::{RouteMessage, RouteOp, RouteOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NexthopState {
    /// Asked the RIB, no answer yet
    Pending,
    Resolved { metric: u32 },
    Unreachable,
}

/// Gates route eligibility on next-hop resolution.
///
/// Routes whose next-hop the RIB hasn't resolved are held here and not
/// offered to decision; when resolution state changes, everything held
/// or forwarded against that next-hop is re-announced or withdrawn. The
/// IGP metric stamped on forwarded routes is decision's tiebreaker.
pub struct NexthopTable {
    name: String,
    nexthops: HashMap<IpAddr, NexthopState>,
    /// Held until their next-hop resolves
    parked: BTreeMap<(PeerId, IpNetwork), RouteMessage>,
    parked_by_nh: HashMap<IpAddr, BTreeSet<(PeerId, IpNetwork)>>,
    /// Forwarded downstream, with the metric they were stamped with
    forwarded: BTreeMap<(PeerId, IpNetwork), RouteMessage>,
    forwarded_by_nh: HashMap<IpAddr, BTreeSet<(PeerId, IpNetwork)>>,
    /// Routes some downstream consumer currently references; metric
    /// changes re-announce these only (resolution flips affect all)
    in_use: HashSet<(PeerId, IpNetwork)>,
}

impl NexthopTable {
    pub fn new(name: &str) -> Self {
        NexthopTable {
            name: format!("NexthopTable-{}", name),
            nexthops: HashMap::new(),
            parked: BTreeMap::new(),
            parked_by_nh: HashMap::new(),
            forwarded: BTreeMap::new(),
            forwarded_by_nh: HashMap::new(),
            in_use: HashSet::new(),
        }
    }

    /// Next-hops we still owe the RIB a question about
    pub fn pending_nexthops(&self) -> Vec<IpAddr> {
        self.nexthops
            .iter()
            .filter(|(_, state)| **state == NexthopState::Pending)
            .map(|(nh, _)| *nh)
            .collect()
    }

    pub fn held_count(&self) -> usize {
        self.parked.len()
    }

    fn park(&mut self, nh: IpAddr, msg: RouteMessage) {
        let key = (msg.origin, msg.net());
        self.parked_by_nh.entry(nh).or_default().insert(key);
        self.parked.insert(key, msg);
    }

    fn unpark(&mut self, key: &(PeerId, IpNetwork)) -> Option<RouteMessage> {
        let msg = self.parked.remove(key)?;
        if let Some(nh) = msg.attributes().next_hop() {
            if let Some(set) = self.parked_by_nh.get_mut(&nh) {
                set.remove(key);
                if set.is_empty() {
                    self.parked_by_nh.remove(&nh);
                }
            }
        }
        Some(msg)
    }

    fn record_forwarded(&mut self, nh: IpAddr, msg: RouteMessage) {
        let key = (msg.origin, msg.net());
        self.forwarded_by_nh.entry(nh).or_default().insert(key);
        self.forwarded.insert(key, msg);
    }

    fn drop_forwarded(&mut self, key: &(PeerId, IpNetwork)) -> Option<RouteMessage> {
        let msg = self.forwarded.remove(key)?;
        if let Some(nh) = msg.attributes().next_hop() {
            if let Some(set) = self.forwarded_by_nh.get_mut(&nh) {
                set.remove(key);
                if set.is_empty() {
                    self.forwarded_by_nh.remove(&nh);
                }
            }
        }
        Some(msg)
    }

    fn annotate(msg: &RouteMessage, metric: u32) -> RouteMessage {
        msg.with_route(Arc::new(msg.route.with_metric(metric)))
    }

    /// The RIB answered (or updated) reachability for a next-hop.
    /// Releases parked routes and re-announces in-use forwarded ones
    /// whose metric changed.
    pub fn nexthop_changed(&mut self, nh: IpAddr, metric: u32) -> Vec<RouteOp> {
        let previous = self.nexthops.insert(nh, NexthopState::Resolved { metric });
        let mut ops = vec![];

        // Release everything parked against this next-hop
        let keys: Vec<_> = self
            .parked_by_nh
            .get(&nh)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            if let Some(msg) = self.unpark(&key) {
                debug!("{}: releasing {} via {}", self.name, msg.net(), nh);
                let annotated = Self::annotate(&msg, metric);
                self.record_forwarded(nh, annotated.clone());
                ops.push(RouteOp::Add(annotated));
            }
        }

        // Metric change: re-announce forwarded routes downstream uses
        if let Some(NexthopState::Resolved { metric: old_metric }) = previous {
            if old_metric != metric {
                let keys: Vec<_> = self
                    .forwarded_by_nh
                    .get(&nh)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for key in keys {
                    if !self.in_use.contains(&key) {
                        // Not referenced downstream; re-stamp quietly
                        if let Some(msg) = self.forwarded.get_mut(&key) {
                            *msg = Self::annotate(&msg.clone(), metric);
                        }
                        continue;
                    }
                    if let Some(old_msg) = self.forwarded.get(&key).cloned() {
                        let new_msg = Self::annotate(&old_msg, metric);
                        self.forwarded.insert(key, new_msg.clone());
                        ops.push(RouteOp::Replace(old_msg, new_msg));
                    }
                }
            }
        }
        if !ops.is_empty() {
            ops.push(RouteOp::Push);
        }
        ops
    }

    /// The RIB declared a next-hop unreachable; everything forwarded
    /// against it becomes ineligible and is withdrawn from decision.
    pub fn nexthop_invalid(&mut self, nh: IpAddr) -> Vec<RouteOp> {
        self.nexthops.insert(nh, NexthopState::Unreachable);
        let keys: Vec<_> = self
            .forwarded_by_nh
            .get(&nh)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut ops = vec![];
        for key in keys {
            if let Some(msg) = self.drop_forwarded(&key) {
                debug!("{}: withdrawing {} via dead {}", self.name, msg.net(), nh);
                ops.push(RouteOp::Delete(msg.clone()));
                // Still present upstream; hold it in case the next-hop
                // comes back
                self.park(nh, msg);
            }
        }
        if !ops.is_empty() {
            ops.push(RouteOp::Push);
        }
        ops
    }

    fn resolution(&mut self, nh: IpAddr) -> NexthopState {
        *self.nexthops.entry(nh).or_insert(NexthopState::Pending)
    }
}

impl RouteTable for NexthopTable {
    fn role(&self) -> TableRole {
        TableRole::Nexthop
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        let nh = match msg.attributes().next_hop() {
            Some(nh) => nh,
            // A route with no NEXT_HOP never becomes eligible
            None => return TableOutput::outcome(RouteOutcome::Filtered),
        };
        match self.resolution(nh) {
            NexthopState::Resolved { metric } => {
                let annotated = Self::annotate(&msg, metric);
                self.record_forwarded(nh, annotated.clone());
                TableOutput::used(RouteOp::Add(annotated))
            }
            NexthopState::Pending | NexthopState::Unreachable => {
                trace!("{}: holding {} until {} resolves", self.name, msg.net(), nh);
                self.park(nh, msg);
                TableOutput::outcome(RouteOutcome::Unused)
            }
        }
    }

    fn replace_route(&mut self, _old: RouteMessage, new: RouteMessage, _now: Instant) -> TableOutput {
        // Downstream must see the copy we actually forwarded (with its
        // stamped metric), not the upstream's view of the old route
        let key = (new.origin, new.net());
        let downstream_has_old = self.forwarded.contains_key(&key);
        // Drop whichever copy we were tracking for this (peer, prefix)
        let forwarded_old = self.drop_forwarded(&key);
        self.unpark(&key);

        let nh = match new.attributes().next_hop() {
            Some(nh) => nh,
            None => {
                return match forwarded_old {
                    Some(old_msg) => TableOutput {
                        outcome: Some(RouteOutcome::Filtered),
                        ops: vec![RouteOp::Delete(old_msg)],
                        timers: vec![],
                    },
                    None => TableOutput::outcome(RouteOutcome::Filtered),
                };
            }
        };
        match self.resolution(nh) {
            NexthopState::Resolved { metric } => {
                let annotated = Self::annotate(&new, metric);
                self.record_forwarded(nh, annotated.clone());
                if downstream_has_old {
                    let old_msg = forwarded_old.expect("downstream_has_old");
                    TableOutput::used(RouteOp::Replace(old_msg, annotated))
                } else {
                    TableOutput::used(RouteOp::Add(annotated))
                }
            }
            NexthopState::Pending | NexthopState::Unreachable => {
                self.park(nh, new);
                match forwarded_old {
                    Some(old_msg) => TableOutput {
                        outcome: Some(RouteOutcome::Unused),
                        ops: vec![RouteOp::Delete(old_msg)],
                        timers: vec![],
                    },
                    None => TableOutput::outcome(RouteOutcome::Unused),
                }
            }
        }
    }

    fn delete_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        let key = (msg.origin, msg.net());
        if let Some(forwarded) = self.drop_forwarded(&key) {
            self.in_use.remove(&key);
            return TableOutput::used(RouteOp::Delete(forwarded));
        }
        if self.unpark(&key).is_some() {
            // Never made it downstream
            return TableOutput::outcome(RouteOutcome::Unused);
        }
        TableOutput::outcome(RouteOutcome::Unused)
    }

    fn route_used(&mut self, net: IpNetwork, peer: PeerId, in_use: bool) {
        let key = (peer, net);
        if in_use {
            self.in_use.insert(key);
        } else {
            self.in_use.remove(&key);
        }
    }
}

impl fmt::Display for NexthopTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<NexthopTable nexthops={} held={} forwarded={}>",
            self.nexthops.len(),
            self.parked.len(),
            self.forwarded.len()
        )
    }
}
