// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared root of a chain and its drain loop.
//!
//! Every handle of one chain points at the same root. Continuations are
//! queued on a lock-free FIFO and drained by whichever thread wins the
//! `draining` flag: the resolving producer, a registering thread after
//! resolution, a timer thread after a deadline, or the thread resolving an
//! inner flat-map chain. A thread that loses the flag leaves the work to the
//! holder, which re-checks for late work after releasing it.
//!
//! No lock is held while user code runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use actorkit_scheduler::Scheduler;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::continuation::{
    Continuation, FlatMapFn, OtherwiseFn, RecoverFn, ScheduledContinuation,
};
use crate::error::{catch_panic, CompletionError};
use crate::state::{Phase, PhaseCell};
use crate::value::{FailedOutcome, Value};

pub(crate) struct Root {
    phase: PhaseCell,
    outcome: Mutex<Option<Value>>,
    /// Root-level sentinel, used by `resolve` and by steps without their own.
    declared_failure: Mutex<Option<FailedOutcome>>,
    /// The value that made this cycle fail.
    failure: Mutex<Option<Value>>,
    exception: Mutex<Option<CompletionError>>,
    continuations: SegQueue<Arc<Continuation>>,
    draining: AtomicBool,
    /// Waiting on an inner flat-map chain.
    suspended: AtomicBool,
    otherwise_fired: AtomicBool,
    recover_fired: AtomicBool,
    /// Handlers reached before the chain failed, kept for a later failure
    /// in the same cycle.
    parked_otherwise: Mutex<Option<Arc<Continuation>>>,
    parked_recover: Mutex<Option<Arc<Continuation>>>,
    /// Raised when a drain empties the queue.
    known: Mutex<bool>,
    known_changed: Condvar,
    scheduler: Option<Arc<Scheduler>>,
    replay: Option<Replay>,
}

/// Bookkeeping of a repeatable root.
struct Replay {
    /// Continuations consumed this cycle, in drain order.
    consumed: Mutex<Vec<Arc<Continuation>>>,
    repeating: AtomicBool,
    /// Final phase of the last finished cycle.
    last_phase: Mutex<Option<Phase>>,
    /// Outcome of the last finished cycle.
    last_outcome: Mutex<Option<Value>>,
}

impl Root {
    pub fn pending(scheduler: Option<Arc<Scheduler>>, repeatable: bool) -> Arc<Self> {
        Arc::new(Self::with_phase(Phase::Pending, scheduler, repeatable))
    }

    pub fn resolved(value: Value) -> Arc<Self> {
        let root = Self::with_phase(Phase::Resolved, None, false);
        *root.outcome.lock() = Some(value);
        *root.known.lock() = true;
        Arc::new(root)
    }

    pub fn failed(value: Value, sentinel: FailedOutcome) -> Arc<Self> {
        let root = Self::with_phase(Phase::Failed, None, false);
        *root.outcome.lock() = Some(value.clone());
        *root.failure.lock() = Some(value);
        *root.declared_failure.lock() = Some(sentinel);
        *root.known.lock() = true;
        Arc::new(root)
    }

    pub fn errored(error: CompletionError) -> Arc<Self> {
        let root = Self::with_phase(Phase::Errored, None, false);
        *root.exception.lock() = Some(error);
        *root.known.lock() = true;
        Arc::new(root)
    }

    fn with_phase(phase: Phase, scheduler: Option<Arc<Scheduler>>, repeatable: bool) -> Self {
        Self {
            phase: PhaseCell::new(phase),
            outcome: Mutex::new(None),
            declared_failure: Mutex::new(None),
            failure: Mutex::new(None),
            exception: Mutex::new(None),
            continuations: SegQueue::new(),
            draining: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            otherwise_fired: AtomicBool::new(false),
            recover_fired: AtomicBool::new(false),
            parked_otherwise: Mutex::new(None),
            parked_recover: Mutex::new(None),
            known: Mutex::new(false),
            known_changed: Condvar::new(),
            scheduler,
            replay: repeatable.then(|| Replay {
                consumed: Mutex::new(Vec::new()),
                repeating: AtomicBool::new(false),
                last_phase: Mutex::new(None),
                last_outcome: Mutex::new(None),
            }),
        }
    }

    // ---- queries ----------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Outcome of the cycle in progress.
    pub fn outcome(&self) -> Option<Value> {
        self.outcome.lock().clone()
    }

    /// Outcome of the cycle in progress, or else of the last finished one.
    pub fn latest_outcome(&self) -> Option<Value> {
        self.outcome().or_else(|| {
            self.replay
                .as_ref()
                .and_then(|r| r.last_outcome.lock().clone())
        })
    }

    pub fn exception(&self) -> Option<CompletionError> {
        self.exception.lock().clone()
    }

    pub fn is_known(&self) -> bool {
        *self.known.lock()
    }

    pub fn declare_failure(&self, sentinel: FailedOutcome) {
        *self.declared_failure.lock() = Some(sentinel);
    }

    // ---- producer side ----------------------------------------------------

    /// Publish the producer's value and drain. Ignored unless Pending.
    pub fn resolve(self: &Arc<Self>, value: Value) -> bool {
        if !self.phase.transition(Phase::Pending, Phase::Completing) {
            if self.phase() == Phase::Failed && self.accept_late_value(&value) {
                tracing::debug!("value arrived after the chain failed; handed to otherwise");
                self.drain();
            } else {
                tracing::debug!(phase = ?self.phase(), "resolve ignored; outcome already decided");
            }
            return false;
        }

        *self.outcome.lock() = Some(value.clone());
        let failed = self
            .declared_failure
            .lock()
            .as_ref()
            .is_some_and(|sentinel| sentinel.matches(&value));
        let target = if failed {
            *self.failure.lock() = Some(value);
            Phase::Failed
        } else {
            Phase::Resolved
        };
        // A deadline may have failed the root while we were publishing.
        if !self.phase.transition(Phase::Completing, target) {
            tracing::debug!(phase = ?self.phase(), "root failed while resolving");
        }
        tracing::trace!(failed, "resolved");

        self.drain();
        true
    }

    /// The chain failed before the producer delivered (a deadline, an
    /// expired wait, `fail`). The first value to arrive becomes the failed
    /// value for this cycle. Returns whether `value` was taken.
    fn accept_late_value(&self, value: &Value) -> bool {
        let mut failure = self.failure.lock();
        if failure.is_some() || self.outcome.lock().is_some() {
            return false;
        }
        *failure = Some(value.clone());
        true
    }

    fn has_failed_value(&self) -> bool {
        self.failure.lock().is_some() || self.outcome.lock().is_some()
    }

    /// Force the Failed state and let the otherwise-handler run.
    pub fn fail(self: &Arc<Self>) {
        let current = self.outcome();
        self.fail_and_drain(current);
    }

    /// A deadline elapsed before its step ran.
    pub fn time_out(self: &Arc<Self>, failed_value: Option<Value>) {
        tracing::debug!("deadline elapsed before its step executed");
        self.fail_and_drain(failed_value);
    }

    /// Fail the chain, abandon any flat-map wait, and drain what remains.
    fn fail_and_drain(self: &Arc<Self>, failed_value: Option<Value>) {
        self.mark_failed(failed_value);
        self.suspended.store(false, Ordering::Release);
        self.drain();
    }

    // ---- registration -----------------------------------------------------

    /// Queue a continuation, decorating it with a deadline when asked, and
    /// run it now if the outcome is already known.
    pub fn register(self: &Arc<Self>, continuation: Continuation, timeout: Option<Duration>) {
        let continuation = match (timeout, self.scheduler.as_deref()) {
            (Some(timeout), Some(scheduler)) => Continuation::Scheduled(
                ScheduledContinuation::arm(continuation, timeout, self, scheduler),
            ),
            (Some(timeout), None) => {
                tracing::warn!(
                    ?timeout,
                    kind = continuation.kind(),
                    "no scheduler on this completion; step runs without a deadline"
                );
                continuation
            }
            (None, _) => continuation,
        };
        self.continuations.push(Arc::new(continuation));
        self.drain();
    }

    // ---- drain ------------------------------------------------------------

    pub fn drain(self: &Arc<Self>) {
        loop {
            if !self.is_ready() {
                return;
            }
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.drain_queue();
            self.draining.store(false, Ordering::Release);

            // Work may have arrived while we held the flag.
            if !self.has_pending_work() {
                return;
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.phase().is_terminal() && !self.suspended.load(Ordering::Acquire)
    }

    fn has_pending_work(&self) -> bool {
        self.is_ready() && (!self.continuations.is_empty() || !self.is_known())
    }

    fn drain_queue(self: &Arc<Self>) {
        while !self.suspended.load(Ordering::Acquire) {
            let Some(continuation) = self.continuations.pop() else {
                self.run_parked();
                self.signal_known();
                return;
            };
            if let Some(replay) = &self.replay {
                if continuation.is_replayable() {
                    replay.consumed.lock().push(continuation.clone());
                }
            }
            if self.park(&continuation) {
                continue;
            }
            tracing::trace!(kind = continuation.kind(), phase = ?self.phase(), "drain step");
            self.run(&continuation);
        }
    }

    /// Keep a handler whose trigger has not happened yet. An
    /// otherwise-handler also waits while the chain failed without a value.
    fn park(&self, continuation: &Arc<Continuation>) -> bool {
        let phase = self.phase();
        let slot = match continuation.as_ref() {
            Continuation::Otherwise(_) if phase != Phase::Failed || !self.has_failed_value() => {
                &self.parked_otherwise
            }
            Continuation::Recover(_) if phase != Phase::Errored => &self.parked_recover,
            _ => return false,
        };
        *slot.lock() = Some(continuation.clone());
        true
    }

    /// The queue is empty: give a parked handler its chance.
    fn run_parked(&self) {
        let parked = match self.phase() {
            Phase::Failed => self.parked_otherwise.lock().clone(),
            Phase::Errored => self.parked_recover.lock().clone(),
            _ => None,
        };
        if let Some(handler) = parked {
            tracing::trace!(kind = handler.kind(), "running parked handler");
            match handler.as_ref() {
                Continuation::Otherwise(h) => self.run_otherwise(h),
                Continuation::Recover(h) => self.run_recover(h),
                _ => {}
            }
        }
    }

    fn signal_known(&self) {
        let mut known = self.known.lock();
        *known = true;
        self.known_changed.notify_all();
    }

    fn run(self: &Arc<Self>, continuation: &Continuation) {
        match continuation {
            Continuation::Map {
                transform,
                failed_outcome,
            } => {
                let Some(input) = self.step_input(failed_outcome.as_ref()) else {
                    return;
                };
                match catch_panic(|| transform(input)) {
                    Ok(output) => self.set_outcome(output),
                    Err(e) => self.raise(e),
                }
            }
            Continuation::Consume {
                action,
                failed_outcome,
            } => {
                let Some(input) = self.step_input(failed_outcome.as_ref()) else {
                    return;
                };
                if let Err(e) = catch_panic(|| action(&input)) {
                    self.raise(e);
                }
            }
            Continuation::FlatMap {
                transform,
                failed_outcome,
            } => self.run_flat_map(transform, failed_outcome.as_ref(), None),
            Continuation::Otherwise(handler) => self.run_otherwise(handler),
            Continuation::Recover(handler) => self.run_recover(handler),
            Continuation::Forward { outer, race } => {
                if race.as_ref().map_or(true, |r| r.try_execute()) {
                    outer.resume_from(self);
                }
            }
            Continuation::Scheduled(scheduled) => {
                if let Continuation::FlatMap {
                    transform,
                    failed_outcome,
                } = scheduled.inner.as_ref()
                {
                    // The deadline keeps running while the inner chain is pending.
                    if scheduled.race.timed_out() {
                        return;
                    }
                    self.run_flat_map(transform, failed_outcome.as_ref(), Some(&scheduled.race));
                } else if scheduled.race.try_execute() {
                    self.run(&scheduled.inner);
                } else {
                    tracing::trace!(kind = scheduled.inner.kind(), "step skipped; deadline won");
                }
            }
        }
    }

    /// Input for a map/consume/flat-map step, or `None` when the step must
    /// be skipped. Detects a declared failure on the way in.
    fn step_input(&self, failed_outcome: Option<&FailedOutcome>) -> Option<Value> {
        if self.phase().is_short_circuited() {
            return None;
        }
        let input = self.outcome()?;
        let failed = match failed_outcome {
            Some(sentinel) => sentinel.matches(&input),
            None => self
                .declared_failure
                .lock()
                .as_ref()
                .is_some_and(|sentinel| sentinel.matches(&input)),
        };
        if failed {
            tracing::debug!("step input equals the declared failed outcome");
            self.mark_failed(Some(input));
            return None;
        }
        Some(input)
    }

    fn run_flat_map(
        self: &Arc<Self>,
        transform: &FlatMapFn,
        failed_outcome: Option<&FailedOutcome>,
        race: Option<&Arc<crate::continuation::DeadlineRace>>,
    ) {
        let settle = || race.map_or(true, |r| r.try_execute());

        let Some(input) = self.step_input(failed_outcome) else {
            settle();
            return;
        };
        let inner = match catch_panic(|| transform(input)) {
            Ok(inner) => inner,
            Err(e) => {
                settle();
                self.raise(e);
                return;
            }
        };

        if inner.is_known() {
            if settle() {
                self.adopt(&inner);
            }
            return;
        }

        self.suspended.store(true, Ordering::Release);
        tracing::trace!("suspended on inner completion");
        inner.register(
            Continuation::Forward {
                outer: self.clone(),
                race: race.cloned(),
            },
            None,
        );
    }

    /// Resume after the inner chain of a flat-map delivered.
    fn resume_from(self: &Arc<Self>, inner: &Root) {
        // A deadline may already have failed this chain.
        if !self.phase().is_short_circuited() {
            self.adopt(inner);
        }
        self.suspended.store(false, Ordering::Release);
        self.drain();
    }

    fn adopt(&self, inner: &Root) {
        if let Some(value) = inner.outcome() {
            self.set_outcome(value);
        }
        match inner.phase() {
            Phase::Failed => {
                let failure = inner.failure.lock().clone();
                self.mark_failed(failure);
            }
            Phase::Errored => {
                if let Some(e) = inner.exception() {
                    self.raise(e);
                }
            }
            _ => {}
        }
    }

    fn run_otherwise(&self, handler: &OtherwiseFn) {
        if self.phase() != Phase::Failed {
            return;
        }
        if self
            .otherwise_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let failure = self.failure.lock().clone();
        let Some(value) = failure.or_else(|| self.outcome()) else {
            tracing::debug!("failed without a value yet; otherwise-handler waits");
            self.otherwise_fired.store(false, Ordering::Release);
            return;
        };
        match catch_panic(|| handler(value)) {
            Ok(output) => self.set_outcome(output),
            Err(CompletionError::TypeMismatch { expected }) => {
                tracing::warn!(expected, "failed value does not match the otherwise-handler type");
                // Leave the slot for a handler of the right type.
                self.otherwise_fired.store(false, Ordering::Release);
            }
            Err(e) => self.raise(e),
        }
    }

    fn run_recover(&self, handler: &RecoverFn) {
        if self.phase() != Phase::Errored {
            return;
        }
        if self
            .recover_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Some(error) = self.exception() else {
            return;
        };
        match catch_panic(|| Ok(handler(error))) {
            Ok(output) => self.set_outcome(output),
            Err(e) => {
                tracing::debug!(error = %e, "recover-handler raised");
                *self.exception.lock() = Some(e);
            }
        }
    }

    fn set_outcome(&self, value: Value) {
        *self.outcome.lock() = Some(value);
    }

    fn mark_failed(&self, failure: Option<Value>) {
        if let Some(value) = failure {
            *self.failure.lock() = Some(value);
        }
        self.phase.fail();
    }

    fn raise(&self, error: CompletionError) {
        tracing::debug!(error = %error, "step raised; chain errored");
        *self.exception.lock() = Some(error);
        self.phase.set(Phase::Errored);
    }

    // ---- waiting ----------------------------------------------------------

    /// Block until a drain completes.
    pub fn wait(&self) -> Option<Value> {
        let mut known = self.known.lock();
        while !*known {
            self.known_changed.wait(&mut known);
        }
        drop(known);
        self.outcome()
    }

    /// Block until a drain completes or `timeout` elapses. On timeout the
    /// root is marked Failed and drained, and `None` is returned.
    pub fn wait_timeout(self: &Arc<Self>, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        let mut known = self.known.lock();
        while !*known {
            if self
                .known_changed
                .wait_until(&mut known, deadline)
                .timed_out()
            {
                break;
            }
        }
        let completed = *known;
        drop(known);

        if !completed {
            tracing::debug!(?timeout, "wait timed out; completion marked failed");
            self.fail_and_drain(None);
            return None;
        }
        self.outcome()
    }

    // ---- repeat -----------------------------------------------------------

    pub fn is_repeatable(&self) -> bool {
        self.replay.is_some()
    }

    pub fn last_phase(&self) -> Option<Phase> {
        self.replay.as_ref().and_then(|r| *r.last_phase.lock())
    }

    /// Restore the consumed chain for another cycle. Returns `false` when
    /// the outcome is not known yet, the root is not repeatable, or another
    /// repeat is in progress.
    pub fn repeat(&self) -> bool {
        let Some(replay) = &self.replay else {
            return false;
        };
        if replay
            .repeating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("repeat already in progress; call dropped");
            return false;
        }
        // Checked under the flag: a finished repeat has cleared it.
        if !self.is_known() {
            replay.repeating.store(false, Ordering::Release);
            return false;
        }

        *replay.last_phase.lock() = Some(self.phase());
        *replay.last_outcome.lock() = self.outcome.lock().take();
        self.phase.set(Phase::Pending);
        *self.known.lock() = false;
        self.failure.lock().take();
        self.exception.lock().take();
        self.otherwise_fired.store(false, Ordering::Release);
        self.recover_fired.store(false, Ordering::Release);
        self.suspended.store(false, Ordering::Release);
        self.parked_otherwise.lock().take();
        self.parked_recover.lock().take();

        let consumed = std::mem::take(&mut *replay.consumed.lock());
        let restored = consumed.len();
        for continuation in consumed {
            continuation.rearm(self.scheduler.as_deref());
            self.continuations.push(continuation);
        }
        tracing::trace!(restored, "chain restored for repeat");

        replay.repeating.store(false, Ordering::Release);
        true
    }
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root")
            .field("phase", &self.phase())
            .field("known", &self.is_known())
            .field("queued", &self.continuations.len())
            .field("suspended", &self.suspended.load(Ordering::Relaxed))
            .field("repeatable", &self.is_repeatable())
            .finish()
    }
}
