use std::fmt;
use std::time::Instant;

use ipnetwork::IpNetwork;
use log::{debug, trace};

use super::{RouteTable, TableOutput, TableRole};
use crate::peer::{Genid, PeerId};
use crate::routes::{RouteMessage, RouteOp, RouteOutcome};

/// Lifecycle of a dump table, from splice to unsplice
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpTableState {
    /// Walking the other peers' current routes
    Dumping,
    /// Iteration finished, but a peer that went down mid-dump hasn't
    /// finished its background deletion yet; stay spliced so its
    /// withdraws still reach the branch
    WaitingForDeletionCompletion,
    /// Ready to unsplice (scheduled, never done mid-dispatch)
    Completed,
    /// The fanout is unsplicing us (the peer went away)
    Suspended,
}

/// Per-peer traversal state inside the dump iterator
#[derive(Debug)]
struct PeerDumpState {
    peer: PeerId,
    /// Genid snapshot taken when the dump started; messages under any
    /// other genid are discriminated against this
    genid: Genid,
    /// Last prefix already handed to the new branch
    cursor: Option<IpNetwork>,
    visited_all: bool,
    /// Went down while the dump was live (or was already draining when
    /// it started)
    down: bool,
    down_complete: bool,
}

impl PeerDumpState {
    fn passed(&self, net: &IpNetwork) -> bool {
        self.visited_all || self.cursor.map(|cursor| *net <= cursor).unwrap_or(false)
    }
}

/// Feeds a newly-established branch a consistent snapshot of every
/// other peer's current routes, without stalling live churn.
///
/// Live changes racing the walk are only forwarded when the iterator
/// has already passed their (peer, prefix) — the branch saw the old
/// state, so it must see the change — or when they belong to a newer
/// peering incarnation than the snapshot. Everything else is absorbed;
/// the walk will pick it up in due course.
pub struct DumpTable {
    name: String,
    /// The branch being seeded
    peer: PeerId,
    state: DumpTableState,
    peers: Vec<PeerDumpState>,
    /// Index into `peers` of the peer currently being walked
    current: usize,
    dumped: usize,
}

impl DumpTable {
    /// `peers` are the snapshot sources in walk order with their
    /// genids; `deleting_peers` were already down-and-draining when the
    /// branch came up, so their stale state is masked but their
    /// completion is still awaited.
    pub fn new(
        peer: PeerId,
        peers: Vec<(PeerId, Genid)>,
        deleting_peers: Vec<(PeerId, Genid)>,
    ) -> Self {
        let mut states: Vec<PeerDumpState> = peers
            .into_iter()
            .map(|(peer, genid)| PeerDumpState {
                peer,
                genid,
                cursor: None,
                visited_all: false,
                down: false,
                down_complete: false,
            })
            .collect();
        states.extend(deleting_peers.into_iter().map(|(peer, genid)| PeerDumpState {
            peer,
            genid,
            cursor: None,
            visited_all: false,
            down: true,
            down_complete: false,
        }));
        DumpTable {
            name: format!("DumpTable-{}", peer),
            peer,
            state: DumpTableState::Dumping,
            peers: states,
            current: 0,
            dumped: 0,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> DumpTableState {
        self.state
    }

    pub fn dumped_count(&self) -> usize {
        self.dumped
    }

    /// The peer the walk should pull the next route from
    pub fn current_target(&self) -> Option<(PeerId, Option<IpNetwork>, Genid)> {
        assert_ne!(self.state, DumpTableState::Suspended, "{}: dispatch while suspended", self.name);
        self.peers
            .iter()
            .skip(self.current)
            .find(|state| !state.visited_all && !state.down)
            .map(|state| (state.peer, state.cursor, state.genid))
    }

    /// One route of the current peer has been handed downstream
    pub fn advance(&mut self, peer: PeerId, net: IpNetwork) {
        self.dumped += 1;
        if let Some(state) = self.peers.iter_mut().find(|state| state.peer == peer) {
            state.cursor = Some(net);
        }
    }

    /// The current peer's snapshot is exhausted; move to the next
    pub fn finish_current_peer(&mut self) {
        if let Some(state) = self
            .peers
            .iter_mut()
            .skip(self.current)
            .find(|state| !state.visited_all && !state.down)
        {
            trace!("{}: finished dumping peer {}", self.name, state.peer);
            state.visited_all = true;
        }
        while self.current < self.peers.len()
            && (self.peers[self.current].visited_all || self.peers[self.current].down)
        {
            self.current += 1;
        }
    }

    pub fn iteration_complete(&self) -> bool {
        self.peers
            .iter()
            .all(|state| state.visited_all || state.down)
    }

    pub fn waiting_for_deletion_completion(&self) -> bool {
        self.peers
            .iter()
            .any(|state| state.down && !state.down_complete)
    }

    /// Iteration has ended; settle into the right terminal state.
    /// Returns true when the table is ready to unsplice.
    pub fn iteration_finished(&mut self) -> bool {
        assert!(self.iteration_complete());
        if self.waiting_for_deletion_completion() {
            self.state = DumpTableState::WaitingForDeletionCompletion;
            false
        } else {
            debug!("{}: dump complete after {} routes", self.name, self.dumped);
            self.state = DumpTableState::Completed;
            true
        }
    }

    /// The fanout is detaching this branch; tear down immediately
    pub fn suspend(&mut self) {
        self.state = DumpTableState::Suspended;
    }

    /// Genid guard + position check for one live message
    fn change_is_valid(&self, origin: PeerId, net: &IpNetwork, genid: Genid) -> bool {
        let state = match self.peers.iter().find(|state| state.peer == origin) {
            Some(state) => state,
            // A peer that came up after the dump started; the iterator
            // will never visit it, so its live stream flows
            None => return true,
        };
        if genid > state.genid {
            // Newer incarnation than the snapshot
            return true;
        }
        if genid < state.genid {
            // Older than anything the branch could have seen
            return false;
        }
        state.passed(net)
    }

    fn filter_add(&self, msg: RouteMessage) -> Option<RouteOp> {
        if self.change_is_valid(msg.origin, &msg.net(), msg.genid) {
            Some(RouteOp::Add(msg))
        } else {
            None
        }
    }

    fn filter_delete(&self, msg: RouteMessage) -> Option<RouteOp> {
        if self.change_is_valid(msg.origin, &msg.net(), msg.genid) {
            Some(RouteOp::Delete(msg))
        } else {
            None
        }
    }

    /// Route one live operation around the walk position. Replaces
    /// degrade to add or delete when only one half is ahead of the
    /// iterator.
    pub fn filter_live(&self, op: RouteOp) -> Option<RouteOp> {
        assert_ne!(self.state, DumpTableState::Suspended, "{}: dispatch while suspended", self.name);
        if self.state == DumpTableState::Completed {
            return Some(op);
        }
        match op {
            RouteOp::Add(msg) => self.filter_add(msg),
            RouteOp::Delete(msg) => self.filter_delete(msg),
            RouteOp::Replace(old, new) => {
                let old_valid = self.change_is_valid(old.origin, &old.net(), old.genid);
                let new_valid = self.change_is_valid(new.origin, &new.net(), new.genid);
                match (old_valid, new_valid) {
                    (true, true) => Some(RouteOp::Replace(old, new)),
                    (false, true) => Some(RouteOp::Add(new)),
                    (true, false) => Some(RouteOp::Delete(old)),
                    (false, false) => None,
                }
            }
            RouteOp::Push => Some(RouteOp::Push),
        }
    }

    /// Advisory registration of a peer that was already down and
    /// draining when this dump learned of it: mask its stale state and
    /// await its completion.
    pub fn peering_is_down_signal(&mut self, peer: PeerId, genid: Genid) {
        if self
            .peers
            .iter()
            .any(|state| state.peer == peer && state.genid == genid)
        {
            return;
        }
        self.peers.push(PeerDumpState {
            peer,
            genid,
            cursor: None,
            visited_all: false,
            down: true,
            down_complete: false,
        });
    }

    /// A snapshot peer went down mid-dump. Its undumped remainder is
    /// skipped (the branch never saw it), while already-dumped prefixes
    /// keep their withdraw path open until deletion completes.
    pub fn peering_went_down_signal(&mut self, peer: PeerId, genid: Genid) {
        if let Some(state) = self
            .peers
            .iter_mut()
            .find(|state| state.peer == peer && state.genid == genid)
        {
            debug!("{}: peer {} went down mid-dump", self.name, peer);
            state.down = true;
            state.down_complete = false;
        }
        while self.current < self.peers.len()
            && (self.peers[self.current].visited_all || self.peers[self.current].down)
        {
            self.current += 1;
        }
    }

    /// A downed peer finished draining. Returns true when this was the
    /// last thing the (already finished) walk was waiting for.
    pub fn peering_down_complete_signal(&mut self, peer: PeerId, genid: Genid) -> bool {
        if let Some(state) = self
            .peers
            .iter_mut()
            .find(|state| state.peer == peer && state.genid == genid)
        {
            state.down_complete = true;
        }
        if self.state == DumpTableState::WaitingForDeletionCompletion
            && !self.waiting_for_deletion_completion()
        {
            debug!("{}: last pending deletion finished", self.name);
            self.state = DumpTableState::Completed;
            return true;
        }
        false
    }
}

impl RouteTable for DumpTable {
    fn role(&self) -> TableRole {
        TableRole::Dump
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        match self.filter_live(RouteOp::Add(msg)) {
            Some(op) => TableOutput::used(op),
            None => TableOutput::outcome(RouteOutcome::Unused),
        }
    }

    fn replace_route(&mut self, old: RouteMessage, new: RouteMessage, _now: Instant) -> TableOutput {
        match self.filter_live(RouteOp::Replace(old, new)) {
            Some(op) => TableOutput::used(op),
            None => TableOutput::outcome(RouteOutcome::Unused),
        }
    }

    fn delete_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        match self.filter_live(RouteOp::Delete(msg)) {
            Some(op) => TableOutput::used(op),
            None => TableOutput::outcome(RouteOutcome::Unused),
        }
    }

    fn route_dump(&mut self, msg: RouteMessage, _dump_peer: PeerId, _now: Instant) -> TableOutput {
        // The walk feeding us its snapshot becomes plain adds downstream
        self.advance(msg.origin, msg.net());
        TableOutput::pass_through(vec![RouteOp::Add(msg)])
    }

    fn peering_is_down(&mut self, peer: PeerId, genid: Genid) {
        self.peering_is_down_signal(peer, genid);
    }

    fn peering_went_down(&mut self, peer: PeerId, genid: Genid) -> Vec<RouteOp> {
        self.peering_went_down_signal(peer, genid);
        vec![]
    }

    fn peering_down_complete(&mut self, peer: PeerId, genid: Genid) -> Vec<RouteOp> {
        self.peering_down_complete_signal(peer, genid);
        vec![]
    }
}

impl fmt::Display for DumpTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<DumpTable peer={} state={:?} dumped={}>",
            self.peer, self.state, self.dumped
        )
    }
}
