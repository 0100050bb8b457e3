// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Continuation variants and the deadline race.
//!
//! A continuation is one link of a chain. Map, Consume and FlatMap carry a
//! transform plus an optional sentinel; Otherwise and Recover carry the
//! failure and exception handlers; Forward feeds an inner chain's result
//! back into the outer chain of a flat-map; Scheduled decorates any of them
//! with a deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use actorkit_scheduler::{Cancellable, Scheduled, Scheduler};
use parking_lot::Mutex;

use crate::error::CompletionError;
use crate::root::Root;
use crate::value::{FailedOutcome, Value};

pub(crate) type MapFn = Box<dyn Fn(Value) -> Result<Value, CompletionError> + Send + Sync>;
pub(crate) type ConsumeFn = Box<dyn Fn(&Value) -> Result<(), CompletionError> + Send + Sync>;
pub(crate) type FlatMapFn = Box<dyn Fn(Value) -> Result<Arc<Root>, CompletionError> + Send + Sync>;
pub(crate) type OtherwiseFn = Box<dyn Fn(Value) -> Result<Value, CompletionError> + Send + Sync>;
pub(crate) type RecoverFn = Box<dyn Fn(CompletionError) -> Value + Send + Sync>;

pub(crate) enum Continuation {
    Map {
        transform: MapFn,
        failed_outcome: Option<FailedOutcome>,
    },
    Consume {
        action: ConsumeFn,
        failed_outcome: Option<FailedOutcome>,
    },
    FlatMap {
        transform: FlatMapFn,
        failed_outcome: Option<FailedOutcome>,
    },
    Otherwise(OtherwiseFn),
    Recover(RecoverFn),
    /// Registered on an inner root; resumes `outer` with the inner result.
    /// `race` is the deadline of a timed flat-map still waiting on it.
    Forward {
        outer: Arc<Root>,
        race: Option<Arc<DeadlineRace>>,
    },
    Scheduled(ScheduledContinuation),
}

impl Continuation {
    pub fn kind(&self) -> &'static str {
        match self {
            Continuation::Map { .. } => "map",
            Continuation::Consume { .. } => "consume",
            Continuation::FlatMap { .. } => "flat_map",
            Continuation::Otherwise(_) => "otherwise",
            Continuation::Recover(_) => "recover",
            Continuation::Forward { .. } => "forward",
            Continuation::Scheduled(s) => s.inner.kind(),
        }
    }

    pub fn failed_outcome(&self) -> Option<&FailedOutcome> {
        match self {
            Continuation::Map { failed_outcome, .. }
            | Continuation::Consume { failed_outcome, .. }
            | Continuation::FlatMap { failed_outcome, .. } => failed_outcome.as_ref(),
            Continuation::Scheduled(s) => s.inner.failed_outcome(),
            _ => None,
        }
    }

    /// Forward links belong to one resolution of one outer chain and are
    /// never replayed.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Continuation::Forward { .. })
    }

    /// Prepare for another cycle of a repeatable root.
    pub fn rearm(&self, scheduler: Option<&Scheduler>) {
        if let Continuation::Scheduled(s) = self {
            s.race.reset();
            if let Some(scheduler) = scheduler {
                s.race.arm(scheduler, s.timeout);
            }
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Continuation::Scheduled(s) => f
                .debug_struct("Scheduled")
                .field("inner", &s.inner.kind())
                .field("timeout", &s.timeout)
                .field("race", &s.race.state())
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// A continuation guarded by a deadline.
pub(crate) struct ScheduledContinuation {
    pub inner: Box<Continuation>,
    pub timeout: Duration,
    pub race: Arc<DeadlineRace>,
}

impl ScheduledContinuation {
    /// Wrap `inner` and start its deadline now.
    pub fn arm(
        inner: Continuation,
        timeout: Duration,
        root: &Arc<Root>,
        scheduler: &Scheduler,
    ) -> Self {
        let race = Arc::new(DeadlineRace {
            cell: AtomicU64::new(pack(0, RaceState::Armed)),
            timer: Mutex::new(None),
            root: Arc::downgrade(root),
            failed_outcome: inner.failed_outcome().cloned(),
        });
        race.arm(scheduler, timeout);
        Self {
            inner: Box::new(inner),
            timeout,
            race,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RaceState {
    Armed = 0,
    Executed = 1,
    TimedOut = 2,
}

const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// Race cell word: the arming generation above the race state.
fn pack(generation: u64, state: RaceState) -> u64 {
    (generation << STATE_BITS) | state as u64
}

/// Race between normal execution and the deadline timer. Exactly one side
/// moves the cell out of Armed; the other side sees the loss and does
/// nothing. A timer only competes in the generation it was armed for.
pub(crate) struct DeadlineRace {
    cell: AtomicU64,
    timer: Mutex<Option<Cancellable>>,
    /// The timer must not keep the chain alive.
    root: Weak<Root>,
    failed_outcome: Option<FailedOutcome>,
}

impl DeadlineRace {
    pub fn state(&self) -> RaceState {
        match self.cell.load(Ordering::Acquire) & STATE_MASK {
            0 => RaceState::Armed,
            1 => RaceState::Executed,
            _ => RaceState::TimedOut,
        }
    }

    pub fn generation(&self) -> u64 {
        self.cell.load(Ordering::Acquire) >> STATE_BITS
    }

    /// Execution side, in the current generation. On a win the timer is
    /// cancelled.
    pub fn try_execute(&self) -> bool {
        let won = self.win(self.generation(), RaceState::Executed);
        if won {
            if let Some(timer) = self.timer.lock().take() {
                timer.cancel();
            }
        }
        won
    }

    /// Timer side. Loses unless `generation` is still current.
    pub fn try_time_out(&self, generation: u64) -> bool {
        self.win(generation, RaceState::TimedOut)
    }

    pub fn timed_out(&self) -> bool {
        self.state() == RaceState::TimedOut
    }

    fn win(&self, generation: u64, to: RaceState) -> bool {
        self.cell
            .compare_exchange(
                pack(generation, RaceState::Armed),
                pack(generation, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn arm(self: &Arc<Self>, scheduler: &Scheduler, timeout: Duration) {
        let receiver: Arc<dyn Scheduled<u64>> = self.clone();
        let handle =
            scheduler.schedule_once(receiver, self.generation(), Duration::ZERO, timeout);
        if let Some(stale) = self.timer.lock().replace(handle) {
            stale.cancel();
        }
    }

    /// Start a new generation in Armed. Timers of earlier generations can
    /// no longer win.
    fn reset(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        let _ = self
            .cell
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack((word >> STATE_BITS) + 1, RaceState::Armed))
            });
    }
}

impl Scheduled<u64> for DeadlineRace {
    fn on_signal(&self, _handle: &Cancellable, generation: &u64) {
        if !self.try_time_out(*generation) {
            tracing::trace!(generation, "deadline lost its race");
            return;
        }
        self.timer.lock().take();
        if let Some(root) = self.root.upgrade() {
            root.time_out(self.failed_outcome.as_ref().map(FailedOutcome::value));
        }
    }
}
