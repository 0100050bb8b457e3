// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! A completion whose chain re-runs for every resolved value.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use actorkit_scheduler::Scheduler;

use crate::completion::{Completion, StepGuard};
use crate::error::CompletionError;
use crate::root::Root;
use crate::state::CompletionState;

/// A re-triggerable pipeline.
///
/// The chain is installed once. Each `resolve` runs it against the new
/// value and then restores it for the next cycle, so
///
/// ```ignore
/// let r = RepeatableCompletion::<i32>::new();
/// r.and_then(|v| v * 2).and_then_consume(|v| println!("{v}"));
/// r.resolve(5); // prints 10
/// r.resolve(10); // prints 20
/// ```
#[derive(Debug)]
pub struct RepeatableCompletion<T> {
    inner: Completion<T>,
}

impl<T> Clone for RepeatableCompletion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RepeatableCompletion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> RepeatableCompletion<T> {
    pub fn new() -> Self {
        Self::from_root(Root::pending(None, true))
    }

    pub fn pending(scheduler: Arc<Scheduler>) -> Self {
        Self::from_root(Root::pending(Some(scheduler), true))
    }

    fn from_root(root: Arc<Root>) -> Self {
        Self {
            inner: Completion::from_root(root),
        }
    }

    fn wrap<U>(inner: Completion<U>) -> RepeatableCompletion<U> {
        RepeatableCompletion { inner }
    }

    fn root(&self) -> &Arc<Root> {
        self.inner.root()
    }

    pub fn use_failed_outcome_of(&self, value: T) -> &Self
    where
        T: PartialEq,
    {
        self.inner.use_failed_outcome_of(value);
        self
    }

    /// Run the chain against `value`, then restore it for the next value.
    pub fn resolve(&self, value: T) -> &Self {
        self.inner.resolve(value);
        self.repeat();
        self
    }

    /// Restore the chain consumed by the finished cycle. Does nothing until
    /// the outcome is known; a call arriving while another repeat is in
    /// progress is dropped. Returns whether the chain was restored.
    pub fn repeat(&self) -> bool {
        self.root().repeat()
    }

    pub fn fail(&self) {
        self.inner.fail();
    }

    // ---- chain building ---------------------------------------------------

    pub fn and_then<U, F>(&self, f: F) -> RepeatableCompletion<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Self::wrap(self.inner.and_then(f))
    }

    pub fn and_then_timeout<U, F>(&self, timeout: Duration, f: F) -> RepeatableCompletion<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Self::wrap(self.inner.and_then_timeout(timeout, f))
    }

    pub fn and_then_guarded<U, F>(&self, guard: StepGuard<T>, f: F) -> RepeatableCompletion<U>
    where
        T: PartialEq,
        U: Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Self::wrap(self.inner.and_then_guarded(guard, f))
    }

    pub fn and_then_try<U, E, F>(&self, f: F) -> RepeatableCompletion<U>
    where
        U: Send + Sync + 'static,
        E: Display,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        Self::wrap(self.inner.and_then_try(f))
    }

    pub fn and_then_consume<F>(&self, f: F) -> RepeatableCompletion<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self::wrap(self.inner.and_then_consume(f))
    }

    pub fn and_then_consume_guarded<F>(&self, guard: StepGuard<T>, f: F) -> RepeatableCompletion<T>
    where
        T: PartialEq,
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self::wrap(self.inner.and_then_consume_guarded(guard, f))
    }

    pub fn and_then_to<U, F>(&self, f: F) -> RepeatableCompletion<U>
    where
        F: Fn(T) -> Completion<U> + Send + Sync + 'static,
    {
        Self::wrap(self.inner.and_then_to(f))
    }

    pub fn otherwise<F>(&self, f: F) -> RepeatableCompletion<T>
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        Self::wrap(self.inner.otherwise(f))
    }

    pub fn otherwise_consume<F>(&self, f: F) -> RepeatableCompletion<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self::wrap(self.inner.otherwise_consume(f))
    }

    pub fn recover_from<F>(&self, f: F) -> RepeatableCompletion<T>
    where
        F: Fn(CompletionError) -> T + Send + Sync + 'static,
    {
        Self::wrap(self.inner.recover_from(f))
    }

    // ---- queries ----------------------------------------------------------

    /// Outcome of the most recent cycle.
    pub fn outcome(&self) -> Option<T> {
        self.inner.outcome()
    }

    pub fn has_outcome(&self) -> bool {
        self.outcome().is_some()
    }

    /// State of the cycle in progress.
    pub fn state(&self) -> CompletionState {
        self.inner.state()
    }

    /// State the most recent finished cycle ended in.
    pub fn last_state(&self) -> Option<CompletionState> {
        self.root().last_phase().map(|phase| phase.observable())
    }

    /// Whether the cycle in progress, or else the last finished one, failed.
    pub fn has_failed(&self) -> bool {
        self.inner.has_failed()
            || matches!(
                self.last_state(),
                Some(CompletionState::Failed | CompletionState::Errored)
            )
    }

    /// The exception of the cycle in progress, if any.
    pub fn exception(&self) -> Option<CompletionError> {
        self.inner.exception()
    }
}
