use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::peer::PeerId;
use crate::routes::{RouteMessage, RouteOp};

/// A branch woken this long ago that still hasn't pulled is wedged;
/// that is a fatal plumbing invariant, not a recoverable state.
pub const STUCK_WAKE_DEADLINE: Duration = Duration::from_secs(20 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOp {
    Add,
    Delete,
    ReplaceOld,
    ReplaceNew,
    Push,
}

#[derive(Clone, Debug)]
struct QueueEntry {
    op: QueueOp,
    /// Route payload; absent for push markers
    msg: Option<RouteMessage>,
    /// Origin peer for the own-peer rule; a push with no origin goes to
    /// every branch
    origin: Option<PeerId>,
}

impl QueueEntry {
    fn skippable_by(&self, peer: PeerId) -> bool {
        self.origin == Some(peer)
    }
}

#[derive(Debug)]
struct BranchState {
    peer: PeerId,
    /// Downstream is willing to take messages
    ready: bool,
    has_queued_data: bool,
    /// Absolute sequence number of the next entry for this branch
    cursor: u64,
    /// Set when we told the branch to pull; cleared when it does
    woken_at: Option<Instant>,
}

/// Single fan-in, many fan-out with per-branch bounded-progress cursors
/// into one shared output queue.
///
/// Everything is enqueued once; each branch drains at its own pace via
/// `take_next`, never seeing routes that originated from its own peer.
/// The queue head is collected as soon as no branch cursor references
/// it, REPLACE pairs always as a unit.
pub struct FanoutTable {
    name: String,
    queue: VecDeque<QueueEntry>,
    /// Sequence number of the entry at the queue front
    head_seq: u64,
    branches: BTreeMap<PeerId, BranchState>,
}

impl FanoutTable {
    pub fn new(name: &str) -> Self {
        FanoutTable {
            name: format!("FanoutTable-{}", name),
            queue: VecDeque::new(),
            head_seq: 0,
            branches: BTreeMap::new(),
        }
    }

    fn tail_seq(&self) -> u64 {
        self.head_seq + self.queue.len() as u64
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn branch_peers(&self) -> Vec<PeerId> {
        self.branches.keys().copied().collect()
    }

    pub fn has_branch(&self, peer: PeerId) -> bool {
        self.branches.contains_key(&peer)
    }

    /// Entries a branch still has to work through
    pub fn branch_lag(&self, peer: PeerId) -> Option<u64> {
        self.branches.get(&peer).map(|branch| {
            if branch.has_queued_data {
                self.tail_seq() - branch.cursor
            } else {
                0
            }
        })
    }

    pub fn add_branch(&mut self, peer: PeerId) {
        debug!("{}: adding branch for peer {}", self.name, peer);
        let tail = self.tail_seq();
        self.branches.insert(
            peer,
            BranchState {
                peer,
                ready: true,
                has_queued_data: false,
                cursor: tail,
                woken_at: None,
            },
        );
    }

    /// Drop a branch, first walking its cursor off the queue so the
    /// head can be collected.
    pub fn remove_branch(&mut self, peer: PeerId) {
        self.skip_entire_queue(peer);
        self.branches.remove(&peer);
        debug!("{}: removed branch for peer {}", self.name, peer);
    }

    /// Flow control from downstream. Returns true when the branch went
    /// ready and has data waiting, i.e. the caller should wake it.
    pub fn set_ready(&mut self, peer: PeerId, ready: bool) -> bool {
        let name = &self.name;
        let branch = self
            .branches
            .get_mut(&peer)
            .unwrap_or_else(|| panic!("{}: no branch for peer {}", name, peer));
        let was_ready = branch.ready;
        branch.ready = ready;
        ready && !was_ready && branch.has_queued_data
    }

    pub fn is_ready(&self, peer: PeerId) -> bool {
        self.branches
            .get(&peer)
            .map(|branch| branch.ready)
            .unwrap_or(false)
    }

    /// Record that the branch has been told to pull
    pub fn note_woken(&mut self, peer: PeerId, now: Instant) {
        if let Some(branch) = self.branches.get_mut(&peer) {
            if branch.woken_at.is_none() {
                branch.woken_at = Some(now);
            }
        }
    }

    /// The stuck-branch deadline is the one hard real-time invariant in
    /// the pipeline.
    pub fn check_stuck_branches(&self, now: Instant) {
        for branch in self.branches.values() {
            if let Some(woken_at) = branch.woken_at {
                let waited = now.saturating_duration_since(woken_at);
                assert!(
                    waited < STUCK_WAKE_DEADLINE,
                    "{}: branch for peer {} woken {}s ago and never pulled",
                    self.name,
                    branch.peer,
                    waited.as_secs()
                );
            }
        }
    }

    /// Queue one logical operation. Returns the ready branches that
    /// went from idle to having data and should be woken.
    pub fn enqueue(&mut self, op: RouteOp) -> Vec<PeerId> {
        let mut entries: Vec<QueueEntry> = vec![];
        // The branch this operation carries nothing for: origin peer of
        // a plain op, or of a same-peer replace. A cross-peer replace
        // has something for everyone (one half degrades at dequeue).
        let excluded: Option<PeerId>;
        match op {
            RouteOp::Add(msg) => {
                let push = msg.push;
                let origin = msg.origin;
                excluded = Some(origin);
                entries.push(QueueEntry {
                    op: QueueOp::Add,
                    origin: Some(origin),
                    msg: Some(msg),
                });
                if push {
                    entries.push(QueueEntry {
                        op: QueueOp::Push,
                        msg: None,
                        origin: Some(origin),
                    });
                }
            }
            RouteOp::Delete(msg) => {
                let push = msg.push;
                let origin = msg.origin;
                excluded = Some(origin);
                entries.push(QueueEntry {
                    op: QueueOp::Delete,
                    origin: Some(origin),
                    msg: Some(msg),
                });
                if push {
                    entries.push(QueueEntry {
                        op: QueueOp::Push,
                        msg: None,
                        origin: Some(origin),
                    });
                }
            }
            RouteOp::Replace(old, new) => {
                let push = new.push;
                let same_origin = old.origin == new.origin;
                excluded = if same_origin { Some(new.origin) } else { None };
                let push_origin = excluded;
                entries.push(QueueEntry {
                    op: QueueOp::ReplaceOld,
                    origin: Some(old.origin),
                    msg: Some(old),
                });
                entries.push(QueueEntry {
                    op: QueueOp::ReplaceNew,
                    origin: Some(new.origin),
                    msg: Some(new),
                });
                if push {
                    // A cross-peer replace pushes everyone
                    entries.push(QueueEntry {
                        op: QueueOp::Push,
                        msg: None,
                        origin: push_origin,
                    });
                }
            }
            // A push crosses peers: an add from one peer may cascade
            // into a delete for another
            RouteOp::Push => {
                excluded = None;
                entries.push(QueueEntry {
                    op: QueueOp::Push,
                    msg: None,
                    origin: None,
                });
            }
        }

        let first_new = self.tail_seq();
        trace!(
            "{}: queueing {:?} from {:?} at seq {}",
            self.name,
            entries[0].op,
            entries[0].origin,
            first_new
        );
        self.queue.extend(entries);

        let mut wake = vec![];
        for branch in self.branches.values_mut() {
            if excluded == Some(branch.peer) {
                continue;
            }
            if !branch.has_queued_data {
                branch.cursor = first_new;
                branch.has_queued_data = true;
                if branch.ready {
                    wake.push(branch.peer);
                }
            }
        }
        self.collect_head();
        wake
    }

    fn entry_at(&self, seq: u64) -> Option<&QueueEntry> {
        self.queue.get((seq - self.head_seq) as usize)
    }

    /// How many entries starting at `seq` carry nothing for this branch
    /// (0 means the entry at `seq` is dispatchable here). A REPLACE
    /// pair is skipped whole only when both halves are the branch's
    /// own; a mixed pair is dispatched and degraded instead.
    fn skip_span(&self, peer: PeerId, seq: u64) -> u64 {
        match self.entry_at(seq) {
            Some(entry) if entry.op == QueueOp::ReplaceOld => {
                let new_entry = self.entry_at(seq + 1).unwrap_or_else(|| {
                    panic!(
                        "{}: REPLACE_OLD at seq {} without REPLACE_NEW",
                        self.name, seq
                    )
                });
                if entry.skippable_by(peer) && new_entry.skippable_by(peer) {
                    2
                } else {
                    0
                }
            }
            Some(entry) if entry.skippable_by(peer) => 1,
            _ => 0,
        }
    }

    /// Dispatch exactly one logical operation to the branch (a REPLACE
    /// pair counts as one). Returns None when nothing is queued for it.
    pub fn take_next(&mut self, peer: PeerId) -> Option<RouteOp> {
        let branch = self.branches.get(&peer)?;
        if !branch.has_queued_data {
            return None;
        }
        let mut cursor = branch.cursor;

        // The cursor may rest on entries this branch must not see
        loop {
            let span = self.skip_span(peer, cursor);
            if span == 0 {
                break;
            }
            cursor += span;
        }

        if self.entry_at(cursor).is_none() {
            // Only skippable entries remained
            let branch = self.branches.get_mut(&peer).expect("branch exists");
            branch.has_queued_data = false;
            branch.woken_at = None;
            self.collect_head();
            return None;
        }
        let op = {
            let entry = self.entry_at(cursor).expect("checked above");
            let op = match entry.op {
                QueueOp::Add => RouteOp::Add(entry.msg.clone().expect("add carries route")),
                QueueOp::Delete => {
                    RouteOp::Delete(entry.msg.clone().expect("delete carries route"))
                }
                QueueOp::ReplaceOld => {
                    let old = entry.msg.clone().expect("replace carries route");
                    let new_entry = self.entry_at(cursor + 1).unwrap_or_else(|| {
                        panic!(
                            "{}: REPLACE_OLD at seq {} without REPLACE_NEW",
                            self.name, cursor
                        )
                    });
                    assert_eq!(
                        new_entry.op,
                        QueueOp::ReplaceNew,
                        "{}: REPLACE_OLD at seq {} followed by {:?}",
                        self.name,
                        cursor,
                        new_entry.op
                    );
                    let new = new_entry.msg.clone().expect("replace carries route");
                    cursor += 1;
                    // A winner moving between peers degrades at the
                    // half that belongs to this branch
                    match (old.origin == peer, new.origin == peer) {
                        (false, false) => RouteOp::Replace(old, new),
                        (true, false) => RouteOp::Add(new),
                        (false, true) => RouteOp::Delete(old),
                        (true, true) => unreachable!("own pair survived skip_span"),
                    }
                }
                QueueOp::ReplaceNew => panic!(
                    "{}: branch cursor for peer {} landed on REPLACE_NEW at seq {}",
                    self.name, peer, cursor
                ),
                QueueOp::Push => RouteOp::Push,
            };
            cursor += 1;
            op
        };

        // Skip past anything that came from this branch's own peer
        loop {
            let span = self.skip_span(peer, cursor);
            if span == 0 {
                break;
            }
            cursor += span;
        }

        let at_end = cursor >= self.tail_seq();
        let branch = self.branches.get_mut(&peer).expect("branch exists");
        branch.cursor = cursor;
        branch.has_queued_data = !at_end;
        branch.woken_at = None;
        self.collect_head();
        Some(op)
    }

    /// Walk a branch's cursor to the end of the queue, collecting as we
    /// go (used before detaching the branch).
    pub fn skip_entire_queue(&mut self, peer: PeerId) {
        if let Some(branch) = self.branches.get_mut(&peer) {
            branch.has_queued_data = false;
            branch.cursor = self.head_seq + self.queue.len() as u64;
            branch.woken_at = None;
        }
        self.collect_head();
    }

    /// Pop entries no branch references anymore. A cursor can never
    /// rest between the halves of a REPLACE pair, so popping the OLD
    /// half implies the NEW half is unreferenced too.
    fn collect_head(&mut self) {
        loop {
            if self.queue.is_empty() {
                return;
            }
            let referenced = self
                .branches
                .values()
                .any(|branch| branch.has_queued_data && branch.cursor <= self.head_seq);
            if referenced {
                return;
            }
            self.queue.pop_front();
            self.head_seq += 1;
        }
    }
}

impl fmt::Display for FanoutTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<FanoutTable branches={} queued={}>",
            self.branches.len(),
            self.queue.len()
        )
    }
}
