mod tasks;

pub use tasks::{Scheduler, Task};

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use log::{debug, info, trace};

use crate::attributes::AttributeList;
use crate::config::{AggregateConfig, DampingConfig};
use crate::families::Family;
use crate::peer::{
    Genid, PeerHandle, PeerId, PeerType, RouterInfo, AGGREGATION_PEER, GENID_UNKNOWN,
    LOCAL_RIB_PEER, ORIGINATE_PEER,
};
use crate::routes::{RouteMessage, RouteOp, SubnetRoute};
use crate::tables::filter::FilterContext;
use crate::tables::{
    AggregationTable, DampingTable, DecisionTable, DumpTable, DumpTableState, FanoutTable,
    FilterBank, FilterVerdict, NexthopTable, RibInTable, RibOutTable, RouteTable, UpdateSink,
};

/// How often the stuck-branch audit runs
const STUCK_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// One peer's ingress half: its RIB-In, input policy, and (for EBGP)
/// flap damping.
struct PeerIngress {
    rib_in: RibInTable,
    filters: FilterBank,
    damping: Option<DampingTable>,
    handle: PeerHandle,
    genid: Genid,
}

/// One branch's egress half: optional dump splice, output policy, and
/// the RIB-Out feeding the peer's send code.
struct PeerEgress {
    dump: Option<DumpTable>,
    filters: FilterBank,
    rib_out: RibOutTable,
}

/// A route read out for management introspection
#[derive(Clone, Debug)]
pub struct RouteReaderEntry {
    pub peer: PeerId,
    pub net: IpNetwork,
    pub attributes: Arc<AttributeList>,
    pub winner: bool,
}

/// Point-in-time pipeline counters for the management surface
#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    pub peers: usize,
    pub winners: usize,
    pub queue_len: usize,
    pub held_nexthops: usize,
    pub branches: Vec<BranchStats>,
}

#[derive(Clone, Debug)]
pub struct BranchStats {
    pub peer: PeerId,
    pub ready: bool,
    pub lag: u64,
    pub dumping: bool,
}

/// One AFI/SAFI's route table graph, plumbed and re-plumbed as peers
/// come and go. Every prefix change enters through a per-peer RIB-In
/// and leaves through the per-branch RIB-Outs; this type owns all the
/// edges in between.
pub struct Pipeline {
    family: Family,
    router: RouterInfo,
    damping_config: DampingConfig,
    ingress: BTreeMap<PeerId, PeerIngress>,
    nexthops: NexthopTable,
    decision: DecisionTable,
    aggregation: AggregationTable,
    fanout: FanoutTable,
    egress: BTreeMap<PeerId, PeerEgress>,
    scheduler: Scheduler,
    /// Peers gone down whose background deletion is still draining
    deleting: BTreeMap<PeerId, Genid>,
    /// Origin-peer facts for filter contexts
    peer_facts: HashMap<PeerId, (PeerType, Ipv4Addr)>,
}

impl Pipeline {
    pub fn new(
        family: Family,
        router: RouterInfo,
        damping_config: DampingConfig,
        aggregates: Vec<AggregateConfig>,
        local_address: IpAddr,
        local_rib_sink: Box<dyn UpdateSink>,
        now: Instant,
    ) -> Self {
        let label = family.to_string().replace(' ', "-");
        let mut pipeline = Pipeline {
            family,
            router: router.clone(),
            damping_config,
            ingress: BTreeMap::new(),
            nexthops: NexthopTable::new(&label),
            decision: DecisionTable::new(&label, router.default_local_pref),
            aggregation: AggregationTable::new(&label, router.clone(), aggregates),
            fanout: FanoutTable::new(&label),
            egress: BTreeMap::new(),
            scheduler: Scheduler::new(),
            deleting: BTreeMap::new(),
            peer_facts: HashMap::new(),
        };

        // The originate handle is a permanent ingress: the speaker's own
        // routes enter the graph through it like any peer's would
        let originate = PeerHandle::originate(local_address);
        pipeline
            .peer_facts
            .insert(ORIGINATE_PEER, (PeerType::Internal, router.bgp_id));
        pipeline
            .peer_facts
            .insert(AGGREGATION_PEER, (PeerType::Internal, router.bgp_id));
        pipeline.ingress.insert(
            ORIGINATE_PEER,
            PeerIngress {
                rib_in: RibInTable::new(ORIGINATE_PEER, GENID_UNKNOWN),
                filters: FilterBank::ingress(&originate, &router),
                damping: None,
                handle: originate.clone(),
                genid: GENID_UNKNOWN,
            },
        );
        pipeline.decision.add_peer(originate);

        // The local RIB is a permanent branch with a peer-shaped egress
        let local_rib = PeerHandle::local_rib(local_address);
        pipeline
            .peer_facts
            .insert(LOCAL_RIB_PEER, (PeerType::Internal, router.bgp_id));
        pipeline.egress.insert(
            LOCAL_RIB_PEER,
            PeerEgress {
                dump: None,
                filters: FilterBank::egress(&local_rib, &router),
                rib_out: RibOutTable::new(LOCAL_RIB_PEER, family, true, local_rib_sink),
            },
        );
        pipeline.fanout.add_branch(LOCAL_RIB_PEER);

        pipeline
            .scheduler
            .schedule_in(now, STUCK_CHECK_INTERVAL, Task::StuckCheck);
        pipeline
    }

    pub fn family(&self) -> Family {
        self.family
    }

    // ------------------------------------------------------------------
    // Peer lifecycle

    /// Plumb a brand new peering (or a returning one under a fresh
    /// genid): ingress chain, decision membership, output branch, and a
    /// dump table to seed the branch with the current table contents.
    pub fn peering_came_up(
        &mut self,
        handle: PeerHandle,
        genid: Genid,
        sink: Box<dyn UpdateSink>,
        now: Instant,
    ) {
        let peer = handle.id;
        info!(
            "{}: peering up {} genid={}",
            self.family, handle.addr, genid
        );
        self.peer_facts
            .insert(peer, (handle.peer_type, handle.bgp_id));

        if self.ingress.contains_key(&peer) {
            let ingress = self.ingress.get_mut(&peer).expect("checked above");
            ingress.rib_in.peering_came_up(peer, genid);
            ingress.filters.bind_genid(genid);
            ingress.genid = genid;
            ingress.handle = handle.clone();
        } else {
            let mut filters = FilterBank::ingress(&handle, &self.router);
            filters.bind_genid(genid);
            let damping = if handle.peer_type.is_ebgp() {
                Some(DampingTable::new(peer, self.damping_config.clone()))
            } else {
                None
            };
            self.ingress.insert(
                peer,
                PeerIngress {
                    rib_in: RibInTable::new(peer, genid),
                    filters,
                    damping,
                    handle: handle.clone(),
                    genid,
                },
            );
        }
        self.decision.add_peer(handle.clone());

        // Output branch, seeded through a dump of everyone else
        let mut out_filters = FilterBank::egress(&handle, &self.router);
        out_filters.bind_genid(genid);
        let rib_out = RibOutTable::new(peer, self.family, handle.peer_type.is_ibgp(), sink);
        let mut sources: Vec<(PeerId, Genid)> = self
            .ingress
            .iter()
            // Peers mid-deletion ride the masked list instead
            .filter(|(id, _)| **id != peer && !self.deleting.contains_key(id))
            .map(|(id, ingress)| (*id, ingress.genid))
            .collect();
        sources.push((AGGREGATION_PEER, GENID_UNKNOWN));
        let deleting: Vec<(PeerId, Genid)> =
            self.deleting.iter().map(|(p, g)| (*p, *g)).collect();
        let dump = DumpTable::new(peer, sources, deleting);
        self.egress.insert(
            peer,
            PeerEgress {
                dump: Some(dump),
                filters: out_filters,
                rib_out,
            },
        );
        self.fanout.add_branch(peer);
        self.scheduler.defer(Task::DumpStep { peer });
    }

    /// The FSM tore the session down: branch off, background deletion
    /// of the peer's contribution begins, bracketed by
    /// peering_went_down / peering_down_complete.
    pub fn peering_went_down(&mut self, peer: PeerId, _now: Instant) {
        let genid = match self.ingress.get_mut(&peer) {
            Some(ingress) => {
                let genid = ingress.genid;
                ingress.rib_in.peering_went_down(peer, genid);
                genid
            }
            None => return,
        };
        info!("{}: peering down peer={} genid={}", self.family, peer, genid);

        // Tear the branch out; a dump in flight for it is suspended
        if let Some(mut egress) = self.egress.remove(&peer) {
            if let Some(dump) = &mut egress.dump {
                dump.suspend();
            }
        }
        if self.fanout.has_branch(peer) {
            self.fanout.remove_branch(peer);
        }

        // Dumps feeding other branches mask the rest of this peer's walk
        for egress in self.egress.values_mut() {
            if let Some(dump) = &mut egress.dump {
                dump.peering_went_down_signal(peer, genid);
            }
        }

        self.deleting.insert(peer, genid);
        self.scheduler.defer(Task::RibInDeletionStep { peer });
    }

    /// Final removal, only valid once the down sequence has fully
    /// drained.
    pub fn delete_peering(&mut self, peer: PeerId) {
        assert!(
            !self.deleting.contains_key(&peer),
            "{}: delete_peering for peer {} before deletion completed",
            self.family,
            peer
        );
        self.ingress.remove(&peer);
        self.decision.remove_peer(peer);
        self.peer_facts.remove(&peer);
        debug!("{}: peer {} unplumbed", self.family, peer);
    }

    /// Advisory from the FSM: this peer was already down and deleting
    /// when some other peer came up (the dump tables track it).
    pub fn peering_is_down_signal(&mut self, peer: PeerId, genid: Genid) {
        self.deleting.insert(peer, genid);
        for egress in self.egress.values_mut() {
            if let Some(dump) = &mut egress.dump {
                dump.peering_is_down_signal(peer, genid);
            }
        }
    }

    // ------------------------------------------------------------------
    // Ingress

    /// A parsed announcement from the FSM for one prefix
    pub fn announce(
        &mut self,
        peer: PeerId,
        net: IpNetwork,
        attributes: Arc<AttributeList>,
        now: Instant,
    ) {
        let (known, ops) = match self.ingress.get_mut(&peer) {
            Some(ingress) => {
                let route = Arc::new(SubnetRoute::new(net, attributes, peer));
                let msg = RouteMessage::new(route, peer, ingress.genid);
                let out = ingress.rib_in.add_route(msg, now);
                (true, out.ops)
            }
            None => (false, vec![]),
        };
        if !known {
            trace!("{}: announce from unknown peer {}", self.family, peer);
            return;
        }
        self.after_ribin(peer, ops, now);
    }

    /// A withdraw from the FSM for one prefix
    pub fn withdraw(&mut self, peer: PeerId, net: IpNetwork, now: Instant) {
        let ops = match self.ingress.get_mut(&peer) {
            Some(ingress) => {
                let route = Arc::new(SubnetRoute::new(
                    net,
                    Arc::new(AttributeList::default()),
                    peer,
                ));
                let msg = RouteMessage::new(route, peer, ingress.genid);
                ingress.rib_in.delete_route(msg, now).ops
            }
            None => vec![],
        };
        self.after_ribin(peer, ops, now);
    }

    /// Batch boundary after one UPDATE's worth of changes
    pub fn push_from_peer(&mut self, _peer: PeerId, now: Instant) {
        self.fanout.enqueue(RouteOp::Push);
        self.drain_ready_branches(now);
    }

    /// Inject one of the speaker's own routes
    pub fn originate(&mut self, net: IpNetwork, attributes: Arc<AttributeList>, now: Instant) {
        self.announce(ORIGINATE_PEER, net, attributes, now);
        self.push_from_peer(ORIGINATE_PEER, now);
    }

    pub fn withdraw_originated(&mut self, net: IpNetwork, now: Instant) {
        self.withdraw(ORIGINATE_PEER, net, now);
        self.push_from_peer(ORIGINATE_PEER, now);
    }

    // ------------------------------------------------------------------
    // Next-hop resolution events (RIB client)

    pub fn nexthop_changed(&mut self, nexthop: IpAddr, metric: u32, now: Instant) {
        let ops = self.nexthops.nexthop_changed(nexthop, metric);
        self.after_nexthop(ops, now);
    }

    pub fn nexthop_invalid(&mut self, nexthop: IpAddr, now: Instant) {
        let ops = self.nexthops.nexthop_invalid(nexthop);
        self.after_nexthop(ops, now);
    }

    /// Next-hops awaiting a RIB answer
    pub fn pending_nexthops(&self) -> Vec<IpAddr> {
        self.nexthops.pending_nexthops()
    }

    // ------------------------------------------------------------------
    // Output flow control

    /// The peer's send queues drained; its branch may pull again
    pub fn output_no_longer_busy(&mut self, peer: PeerId, now: Instant) {
        if let Some(egress) = self.egress.get_mut(&peer) {
            egress.rib_out.output_no_longer_busy();
        }
        if self.fanout.has_branch(peer) && self.fanout.set_ready(peer, true) {
            self.fanout.note_woken(peer, now);
        }
        if self.dump_active(peer) {
            self.scheduler.defer(Task::DumpStep { peer });
        } else {
            self.drain_branch(peer, now);
        }
    }

    // ------------------------------------------------------------------
    // Scheduler pump

    /// Dispatch everything due at `now`. Returns how many tasks ran so
    /// callers can pump until quiescent.
    pub fn run_tasks(&mut self, now: Instant) -> usize {
        let due = self.scheduler.take_due(now);
        let count = due.len();
        for task in due {
            match task {
                Task::RibInDeletionStep { peer } => self.deletion_step(peer, now),
                Task::DumpStep { peer } => self.dump_step(peer, now),
                Task::Undamp { peer, net } => self.undamp(peer, net, now),
                Task::UnplumbDump { peer } => self.unplumb_dump(peer, now),
                Task::StuckCheck => {
                    self.fanout.check_stuck_branches(now);
                    self.scheduler
                        .schedule_in(now, STUCK_CHECK_INTERVAL, Task::StuckCheck);
                }
            }
        }
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn has_deferred_work(&self) -> bool {
        self.scheduler.has_deferred()
    }

    // ------------------------------------------------------------------
    // Introspection

    /// All per-peer stored routes in stable order, with winner flags
    pub fn read_routes(&self) -> Vec<RouteReaderEntry> {
        let mut entries = vec![];
        for (peer, ingress) in &self.ingress {
            for (net, route) in ingress.rib_in.iter() {
                let winner = self
                    .decision
                    .winner(net)
                    .map(|w| w.origin == *peer)
                    .unwrap_or(false);
                entries.push(RouteReaderEntry {
                    peer: *peer,
                    net: *net,
                    attributes: route.attributes.clone(),
                    winner,
                });
            }
        }
        entries
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            peers: self.ingress.len().saturating_sub(1), // minus originate
            winners: self.decision.winner_count(),
            queue_len: self.fanout.queue_len(),
            held_nexthops: self.nexthops.held_count(),
            branches: self
                .fanout
                .branch_peers()
                .into_iter()
                .map(|peer| BranchStats {
                    peer,
                    ready: self.fanout.is_ready(peer),
                    lag: self.fanout.branch_lag(peer).unwrap_or(0),
                    dumping: self.dump_active(peer),
                })
                .collect(),
        }
    }

    pub fn route_count_of_peer(&self, peer: PeerId) -> usize {
        self.ingress
            .get(&peer)
            .map(|ingress| ingress.rib_in.route_count())
            .unwrap_or(0)
    }

    pub fn damped_count_of_peer(&self, peer: PeerId) -> usize {
        self.ingress
            .get(&peer)
            .and_then(|ingress| ingress.damping.as_ref())
            .map(|damping| damping.damped_count())
            .unwrap_or(0)
    }

    /// Per-prefix damping history across all peers (management surface)
    pub fn damping_entries(&self, now: Instant) -> Vec<(PeerId, IpNetwork, u32, bool)> {
        let mut entries = vec![];
        for (peer, ingress) in &self.ingress {
            if let Some(damping) = &ingress.damping {
                for (net, merit, damped) in damping.entries(now) {
                    entries.push((*peer, net, merit, damped));
                }
            }
        }
        entries
    }

    /// Toggle damping; already-damped prefixes keep draining
    pub fn set_damping_enabled(&mut self, enabled: bool) {
        for ingress in self.ingress.values_mut() {
            if let Some(damping) = &mut ingress.damping {
                damping.set_enabled(enabled);
            }
        }
    }

    // ------------------------------------------------------------------
    // Stage plumbing

    fn filter_ctx(&self, origin: PeerId) -> FilterContext {
        let (origin_type, origin_bgp_id) = self
            .peer_facts
            .get(&origin)
            .copied()
            .unwrap_or((PeerType::Internal, Ipv4Addr::UNSPECIFIED));
        FilterContext {
            origin_type,
            origin_bgp_id,
            origin_is_originate: origin == ORIGINATE_PEER,
        }
    }

    /// Run one operation through a filter bank. Replace halves are
    /// filtered independently; losing one degrades the operation.
    fn filter_op(&self, bank_of: PeerId, egress_side: bool, op: RouteOp) -> Option<RouteOp> {
        let bank = if egress_side {
            &self.egress.get(&bank_of)?.filters
        } else {
            &self.ingress.get(&bank_of)?.filters
        };
        match op {
            RouteOp::Add(msg) => {
                let ctx = self.filter_ctx(msg.origin);
                match bank.apply(msg, &ctx) {
                    FilterVerdict::Pass(msg) => Some(RouteOp::Add(msg)),
                    FilterVerdict::Drop => None,
                }
            }
            RouteOp::Delete(msg) => {
                let ctx = self.filter_ctx(msg.origin);
                match bank.apply(msg, &ctx) {
                    FilterVerdict::Pass(msg) => Some(RouteOp::Delete(msg)),
                    FilterVerdict::Drop => None,
                }
            }
            RouteOp::Replace(old, new) => {
                let old_ctx = self.filter_ctx(old.origin);
                let new_ctx = self.filter_ctx(new.origin);
                let old = match bank.apply(old, &old_ctx) {
                    FilterVerdict::Pass(old) => Some(old),
                    FilterVerdict::Drop => None,
                };
                let new = match bank.apply(new, &new_ctx) {
                    FilterVerdict::Pass(new) => Some(new),
                    FilterVerdict::Drop => None,
                };
                match (old, new) {
                    (Some(old), Some(new)) => Some(RouteOp::Replace(old, new)),
                    (None, Some(new)) => Some(RouteOp::Add(new)),
                    (Some(old), None) => Some(RouteOp::Delete(old)),
                    (None, None) => None,
                }
            }
            RouteOp::Push => Some(RouteOp::Push),
        }
    }

    /// RIB-In emitted ops: input filters, then damping, then onward
    fn after_ribin(&mut self, peer: PeerId, ops: Vec<RouteOp>, now: Instant) {
        let mut filtered = Vec::with_capacity(ops.len());
        for op in ops {
            if let Some(op) = self.filter_op(peer, false, op) {
                filtered.push(op);
            }
        }
        self.after_filters(peer, filtered, now);
    }

    fn after_filters(&mut self, peer: PeerId, ops: Vec<RouteOp>, now: Instant) {
        let has_damping = self
            .ingress
            .get(&peer)
            .map(|ingress| ingress.damping.is_some())
            .unwrap_or(false);
        if !has_damping {
            return self.after_damping(peer, ops, now);
        }
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let ingress = self.ingress.get_mut(&peer).expect("checked above");
            let damping = ingress.damping.as_mut().expect("checked above");
            let output = match op {
                RouteOp::Add(msg) => damping.add_route(msg, now),
                RouteOp::Replace(old, new) => damping.replace_route(old, new, now),
                RouteOp::Delete(msg) => damping.delete_route(msg, now),
                RouteOp::Push => {
                    out.push(RouteOp::Push);
                    continue;
                }
            };
            for timer in output.timers {
                self.scheduler
                    .schedule_in(now, timer.delay, Task::Undamp { peer, net: timer.net });
            }
            out.extend(output.ops);
        }
        self.after_damping(peer, out, now);
    }

    fn after_damping(&mut self, _peer: PeerId, ops: Vec<RouteOp>, now: Instant) {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                RouteOp::Add(msg) => out.extend(self.nexthops.add_route(msg, now).ops),
                RouteOp::Replace(old, new) => {
                    out.extend(self.nexthops.replace_route(old, new, now).ops)
                }
                RouteOp::Delete(msg) => out.extend(self.nexthops.delete_route(msg, now).ops),
                RouteOp::Push => out.push(RouteOp::Push),
            }
        }
        self.after_nexthop(out, now);
    }

    fn after_nexthop(&mut self, ops: Vec<RouteOp>, now: Instant) {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                RouteOp::Add(msg) => out.extend(self.decision.add_route(msg, now).ops),
                RouteOp::Replace(old, new) => {
                    out.extend(self.decision.replace_route(old, new, now).ops)
                }
                RouteOp::Delete(msg) => out.extend(self.decision.delete_route(msg, now).ops),
                RouteOp::Push => out.push(RouteOp::Push),
            }
        }
        // Decision's winner churn bounds the resolver's watch set
        for (net, peer, in_use) in self.decision.take_usage_signals() {
            self.nexthops.route_used(net, peer, in_use);
        }
        self.after_decision(out, now);
    }

    fn after_decision(&mut self, ops: Vec<RouteOp>, now: Instant) {
        let mut queued = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                RouteOp::Add(msg) => queued.extend(self.aggregation.add_route(msg, now).ops),
                RouteOp::Replace(old, new) => {
                    queued.extend(self.aggregation.replace_route(old, new, now).ops)
                }
                RouteOp::Delete(msg) => queued.extend(self.aggregation.delete_route(msg, now).ops),
                RouteOp::Push => queued.push(RouteOp::Push),
            }
        }
        for op in queued {
            for peer in self.fanout.enqueue(op) {
                self.fanout.note_woken(peer, now);
            }
        }
        self.drain_ready_branches(now);
    }

    // ------------------------------------------------------------------
    // Branch output

    fn dump_active(&self, peer: PeerId) -> bool {
        self.egress
            .get(&peer)
            .and_then(|egress| egress.dump.as_ref())
            .map(|dump| dump.state() != DumpTableState::Completed)
            .unwrap_or(false)
    }

    fn drain_ready_branches(&mut self, now: Instant) {
        let peers: Vec<PeerId> = self.egress.keys().copied().collect();
        for peer in peers {
            if self.dump_active(peer) {
                // The dump table paces this branch; make sure its walk
                // (and queue drain) is scheduled
                self.scheduler.defer(Task::DumpStep { peer });
            } else {
                self.drain_branch(peer, now);
            }
        }
    }

    /// Pull the branch's queued fanout data through its egress chain
    /// until the queue is empty or the send layer pushes back.
    fn drain_branch(&mut self, peer: PeerId, now: Instant) {
        loop {
            let busy = match self.egress.get(&peer) {
                Some(egress) => egress.rib_out.is_busy(),
                None => return,
            };
            if busy {
                if self.fanout.has_branch(peer) {
                    self.fanout.set_ready(peer, false);
                }
                return;
            }
            if !self.fanout.has_branch(peer) || !self.fanout.is_ready(peer) {
                return;
            }
            let op = match self.fanout.take_next(peer) {
                Some(op) => op,
                None => return,
            };
            // A still-spliced dump table routes live changes around its
            // walk position
            let op = match self.egress.get(&peer).and_then(|egress| egress.dump.as_ref()) {
                Some(dump) => match dump.filter_live(op) {
                    Some(op) => op,
                    None => continue,
                },
                None => op,
            };
            let op = match self.filter_op(peer, true, op) {
                Some(op) => op,
                None => continue,
            };
            self.deliver_to_ribout(peer, op, now);
        }
    }

    fn deliver_to_ribout(&mut self, peer: PeerId, op: RouteOp, now: Instant) {
        let egress = match self.egress.get_mut(&peer) {
            Some(egress) => egress,
            None => return,
        };
        match op {
            RouteOp::Add(msg) => {
                egress.rib_out.add_route(msg, now);
            }
            RouteOp::Replace(old, new) => {
                egress.rib_out.replace_route(old, new, now);
            }
            RouteOp::Delete(msg) => {
                egress.rib_out.delete_route(msg, now);
            }
            RouteOp::Push => {
                egress.rib_out.push();
            }
        }
        if egress.rib_out.is_busy() && self.fanout.has_branch(peer) {
            self.fanout.set_ready(peer, false);
        }
    }

    // ------------------------------------------------------------------
    // Background tasks

    /// One bounded batch of a downed peer's deletes, then yield
    fn deletion_step(&mut self, peer: PeerId, now: Instant) {
        let (mut ops, completed, more) = match self.ingress.get_mut(&peer) {
            Some(ingress) => {
                let (ops, completed) = ingress.rib_in.deletion_step();
                let more = ingress.rib_in.deleting();
                (ops, completed, more)
            }
            None => return,
        };
        if !ops.is_empty() {
            ops.push(RouteOp::Push);
        }
        self.after_ribin(peer, ops, now);
        if let Some(genid) = completed {
            self.peering_down_complete(peer, genid, now);
        }
        if more {
            self.scheduler.defer(Task::RibInDeletionStep { peer });
        }
    }

    /// Everything attributed to (peer, genid) has drained; release the
    /// state pinned by that incarnation.
    fn peering_down_complete(&mut self, peer: PeerId, genid: Genid, _now: Instant) {
        info!(
            "{}: peering down complete peer={} genid={}",
            self.family, peer, genid
        );
        if let Some(ingress) = self.ingress.get_mut(&peer) {
            ingress.filters.release_genid(genid);
        }
        self.deleting.remove(&peer);

        let mut finished: Vec<PeerId> = vec![];
        for (branch, egress) in self.egress.iter_mut() {
            if let Some(dump) = &mut egress.dump {
                if dump.peering_down_complete_signal(peer, genid) {
                    finished.push(*branch);
                }
            }
        }
        for branch in finished {
            self.scheduler.defer(Task::UnplumbDump { peer: branch });
        }
    }

    /// One step of a branch's background dump: drain any queued live
    /// changes first, then hand the branch the next snapshot route.
    fn dump_step(&mut self, peer: PeerId, now: Instant) {
        if !self.dump_active(peer) {
            return;
        }
        if self
            .egress
            .get(&peer)
            .map(|egress| egress.rib_out.is_busy())
            .unwrap_or(true)
        {
            // Resume when the send layer drains
            return;
        }

        // Live queue first, so upstream churn can't build up behind the
        // walk
        self.drain_branch(peer, now);
        if self
            .egress
            .get(&peer)
            .map(|egress| egress.rib_out.is_busy())
            .unwrap_or(true)
        {
            return;
        }

        let (src, cursor, src_genid, complete) = {
            let dump = match self.egress.get(&peer).and_then(|egress| egress.dump.as_ref()) {
                Some(dump) => dump,
                None => return,
            };
            if dump.state() == DumpTableState::WaitingForDeletionCompletion {
                return;
            }
            match dump.current_target() {
                Some((src, cursor, genid)) => (src, cursor, genid, false),
                None => (0, None, 0, true),
            }
        };

        if complete {
            let ready = {
                let dump = self
                    .egress
                    .get_mut(&peer)
                    .and_then(|egress| egress.dump.as_mut())
                    .expect("dump checked above");
                dump.iteration_finished()
            };
            if ready {
                // Never unsplice inside the walk's own dispatch
                self.scheduler.defer(Task::UnplumbDump { peer });
            }
            return;
        }

        // Next snapshot route for the current source
        let next: Option<RouteMessage> = if src == AGGREGATION_PEER {
            self.aggregation
                .announced()
                .filter(|(net, _)| cursor.map(|cursor| **net > cursor).unwrap_or(true))
                .map(|(net, attrs)| {
                    let mut route = SubnetRoute::new(*net, attrs.clone(), AGGREGATION_PEER)
                        .with_metric(0);
                    route.marker = crate::routes::AggregationMarker::EbgpAggregate;
                    RouteMessage::new(Arc::new(route), AGGREGATION_PEER, GENID_UNKNOWN)
                })
                .next()
        } else {
            self.decision.next_winner_of_peer(src, cursor).cloned()
        };

        match next {
            Some(msg) => {
                let net = msg.net();
                let stale = src != AGGREGATION_PEER && msg.genid != src_genid;
                {
                    let dump = self
                        .egress
                        .get_mut(&peer)
                        .and_then(|egress| egress.dump.as_mut())
                        .expect("dump checked above");
                    dump.advance(src, net);
                }
                // Snapshot routes bypass the aggregation table, so its
                // marking is applied here
                let marked = if src == AGGREGATION_PEER {
                    Some(msg)
                } else {
                    let to_ibgp = self
                        .egress
                        .get(&peer)
                        .map(|egress| egress.rib_out.ibgp())
                        .unwrap_or(true);
                    self.aggregation
                        .mark_for_dump(&net, to_ibgp)
                        .map(|marker| msg.with_route(Arc::new(msg.route.with_marker(marker))))
                };
                if let (false, Some(msg)) = (stale, marked) {
                    trace!(
                        "{}: dumping {} from peer {} to peer {}",
                        self.family,
                        net,
                        src,
                        peer
                    );
                    if let Some(op) = self.filter_op(peer, true, RouteOp::Add(msg)) {
                        self.deliver_to_ribout(peer, op, now);
                    }
                    self.deliver_to_ribout(peer, RouteOp::Push, now);
                }
            }
            None => {
                let dump = self
                    .egress
                    .get_mut(&peer)
                    .and_then(|egress| egress.dump.as_mut())
                    .expect("dump checked above");
                dump.finish_current_peer();
            }
        }
        self.scheduler.defer(Task::DumpStep { peer });
    }

    /// A completed dump table rewires the branch back to its plain
    /// egress chain (always deferred, never mid-dispatch).
    fn unplumb_dump(&mut self, peer: PeerId, now: Instant) {
        let completed = self
            .egress
            .get(&peer)
            .and_then(|egress| egress.dump.as_ref())
            .map(|dump| dump.state() == DumpTableState::Completed)
            .unwrap_or(false);
        if !completed {
            return;
        }
        if let Some(egress) = self.egress.get_mut(&peer) {
            let dump = egress.dump.take().expect("checked above");
            info!(
                "{}: dump for peer {} unplumbed after {} routes",
                self.family,
                peer,
                dump.dumped_count()
            );
        }
        // Live flow resumes directly from the fanout
        self.drain_branch(peer, now);
    }

    /// A damped prefix's reuse timer fired
    fn undamp(&mut self, peer: PeerId, net: IpNetwork, now: Instant) {
        let ops = match self
            .ingress
            .get_mut(&peer)
            .and_then(|ingress| ingress.damping.as_mut())
        {
            Some(damping) => damping.reuse_timer_fired(net, now),
            None => return,
        };
        self.after_damping(peer, ops, now);
    }
}
