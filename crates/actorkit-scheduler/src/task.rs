// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer task representation.
//!
//! A task owns a type-erased fire closure (receiver + data) and its
//! cancellation handle. Heap entries pair a task with its next deadline;
//! the heap is a min-heap on (deadline, seq).

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::Cancellable;
use crate::scheduled::Scheduled;

type FireFn = Box<dyn Fn(&Cancellable) + Send + Sync>;

/// How a task repeats after it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cadence {
    Once,
    Every(Duration),
}

/// The object kept alive by the heap between firings.
pub(crate) struct TimerTask {
    pub handle: Cancellable,
    pub cadence: Cadence,
    fire: FireFn,
}

impl std::fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerTask")
            .field("id", &self.handle.id())
            .field("cadence", &self.cadence)
            .field("cancelled", &self.handle.is_cancelled())
            .finish()
    }
}

impl TimerTask {
    pub fn new<D>(
        handle: Cancellable,
        cadence: Cadence,
        receiver: Arc<dyn Scheduled<D>>,
        data: D,
    ) -> Arc<Self>
    where
        D: Send + Sync + 'static,
    {
        Arc::new(Self {
            handle,
            cadence,
            fire: Box::new(move |handle| receiver.on_signal(handle, &data)),
        })
    }

    /// Invoke the receiver. Caller guarantees no concurrent call for the
    /// same task (the task is out of the heap while it runs).
    pub fn fire(&self) {
        (self.fire)(&self.handle)
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Next deadline after a firing, if the task repeats.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        match self.cadence {
            Cadence::Once => None,
            Cadence::Every(interval) => Some(now + interval),
        }
    }
}

/// Heap entry. `seq` breaks deadline ties in registration order.
#[derive(Debug)]
pub(crate) struct TimerEntry {
    pub deadline: Instant,
    pub seq: u64,
    pub task: Arc<TimerTask>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so `BinaryHeap` pops the earliest deadline first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
