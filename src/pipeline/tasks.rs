use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;

use crate::peer::PeerId;

/// Deferred work, always dispatched from the event loop, never from
/// inside another table's call frame. Tasks are plain data so firing is
/// idempotent: a task that no longer applies validates against current
/// state and does nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Task {
    /// One bounded step of a downed peer's background deletion
    RibInDeletionStep { peer: PeerId },
    /// One bounded step of a new peer's background dump
    DumpStep { peer: PeerId },
    /// A damped prefix's reuse timer
    Undamp { peer: PeerId, net: IpNetwork },
    /// Unsplice a completed dump table (deferred deletion)
    UnplumbDump { peer: PeerId },
    /// Periodic stuck-branch audit
    StuckCheck,
}

#[derive(Debug)]
struct TimedTask {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for earliest-first
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

/// The pipeline's slice of the event loop: zero-delay continuations for
/// long-running walks plus one-off timers, drained explicitly with the
/// caller's clock.
#[derive(Debug, Default)]
pub struct Scheduler {
    deferred: VecDeque<Task>,
    timed: BinaryHeap<TimedTask>,
    seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }

    /// Run at the next dispatch boundary
    pub fn defer(&mut self, task: Task) {
        // A walk re-queueing itself shouldn't pile up duplicates
        if !self.deferred.contains(&task) {
            self.deferred.push_back(task);
        }
    }

    /// Run once the delay has elapsed
    pub fn schedule_in(&mut self, now: Instant, delay: Duration, task: Task) {
        self.seq += 1;
        self.timed.push(TimedTask {
            at: now + delay,
            seq: self.seq,
            task,
        });
    }

    /// Everything runnable at `now`, deferred work first
    pub fn take_due(&mut self, now: Instant) -> Vec<Task> {
        let mut due: Vec<Task> = self.deferred.drain(..).collect();
        while let Some(timed) = self.timed.peek() {
            if timed.at > now {
                break;
            }
            due.push(self.timed.pop().expect("peeked").task);
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timed.peek().map(|timed| timed.at)
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.deferred.is_empty() && self.timed.is_empty()
    }
}
