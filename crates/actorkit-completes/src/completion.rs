// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The eventual-value handle.

use std::fmt::{self, Display};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use actorkit_scheduler::Scheduler;

use crate::continuation::{Continuation, MapFn};
use crate::error::CompletionError;
use crate::root::Root;
use crate::state::CompletionState;
use crate::value::{erase, view, FailedOutcome, Value};

/// An eventual value of type `T` with chainable continuations.
///
/// Every handle returned by a chain-building call is a typed view of the
/// same root: resolving any handle of the chain resolves the root and runs
/// the whole chain in registration order on the resolving thread. Steps
/// registered after the outcome is known run immediately on the
/// registering thread.
///
/// ```ignore
/// let c = Completion::<i32>::new();
/// let doubled = c.and_then(|v| v * 2).and_then(|v| v + 1);
/// c.resolve(20);
/// assert_eq!(doubled.outcome(), Some(41));
/// ```
pub struct Completion<T> {
    root: Arc<Root>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self::from_root(self.root.clone())
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("type", &std::any::type_name::<T>())
            .field("root", &self.root)
            .finish()
    }
}

impl<T> Completion<T> {
    pub(crate) fn from_root(root: Arc<Root>) -> Self {
        Self {
            root,
            _marker: PhantomData,
        }
    }

    pub(crate) fn root(&self) -> &Arc<Root> {
        &self.root
    }

    fn chain<U>(&self, continuation: Continuation, timeout: Option<Duration>) -> Completion<U> {
        self.root.register(continuation, timeout);
        Completion::from_root(self.root.clone())
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    /// A pending completion without deadline support.
    pub fn new() -> Self {
        Self::from_root(Root::pending(None, false))
    }

    /// A pending completion whose timed steps are enforced by `scheduler`.
    pub fn pending(scheduler: Arc<Scheduler>) -> Self {
        Self::from_root(Root::pending(Some(scheduler), false))
    }

    pub fn resolved(value: T) -> Self {
        Self::from_root(Root::resolved(erase(value)))
    }

    /// Already failed: `value` is both the outcome and the sentinel.
    pub fn failed(value: T) -> Self
    where
        T: PartialEq,
    {
        let sentinel = FailedOutcome::of(value.clone());
        Self::from_root(Root::failed(erase(value), sentinel))
    }

    /// Already errored with `error` captured.
    pub fn errored(error: CompletionError) -> Self {
        Self::from_root(Root::errored(error))
    }

    /// Declare the value that means failure for `resolve` and for every
    /// step that declares no sentinel of its own.
    pub fn use_failed_outcome_of(&self, value: T) -> &Self
    where
        T: PartialEq,
    {
        self.root.declare_failure(FailedOutcome::of(value));
        self
    }

    /// Publish the outcome and run the chain on this thread. Ignored if
    /// the outcome is already decided.
    pub fn resolve(&self, value: T) -> &Self {
        self.root.resolve(erase(value));
        self
    }

    /// Force the failed state; the otherwise-handler runs.
    pub fn fail(&self) {
        self.root.fail();
    }

    // ---- chain building ---------------------------------------------------

    pub fn and_then<U, F>(&self, f: F) -> Completion<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.and_then_with(None, None, f)
    }

    /// Like [`and_then`](Self::and_then), but the chain fails if the step
    /// has not run within `timeout` of registration.
    pub fn and_then_timeout<U, F>(&self, timeout: Duration, f: F) -> Completion<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.and_then_with(Some(timeout), None, f)
    }

    pub fn and_then_guarded<U, F>(&self, guard: StepGuard<T>, f: F) -> Completion<U>
    where
        T: PartialEq,
        U: Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let (timeout, failed_outcome) = guard.split();
        self.and_then_with(timeout, failed_outcome, f)
    }

    fn and_then_with<U, F>(
        &self,
        timeout: Option<Duration>,
        failed_outcome: Option<FailedOutcome>,
        f: F,
    ) -> Completion<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let transform = typed::<T, _>(move |input| Ok(erase(f(input))));
        self.chain(
            Continuation::Map {
                transform,
                failed_outcome,
            },
            timeout,
        )
    }

    /// A fallible step: `Err(e)` errors the chain like a panic would.
    pub fn and_then_try<U, E, F>(&self, f: F) -> Completion<U>
    where
        U: Send + Sync + 'static,
        E: Display,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        let transform = typed::<T, _>(move |input| {
            f(input)
                .map(erase)
                .map_err(|e| CompletionError::Failed(e.to_string()))
        });
        self.chain(
            Continuation::Map {
                transform,
                failed_outcome: None,
            },
            None,
        )
    }

    /// A side effect; the value passes through unchanged.
    pub fn and_then_consume<F>(&self, f: F) -> Completion<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.and_then_consume_with(None, None, f)
    }

    pub fn and_then_consume_guarded<F>(&self, guard: StepGuard<T>, f: F) -> Completion<T>
    where
        T: PartialEq,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let (timeout, failed_outcome) = guard.split();
        self.and_then_consume_with(timeout, failed_outcome, f)
    }

    fn and_then_consume_with<F>(
        &self,
        timeout: Option<Duration>,
        failed_outcome: Option<FailedOutcome>,
        f: F,
    ) -> Completion<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let action = Box::new(move |value: &Value| -> Result<(), CompletionError> {
            let input = value
                .as_ref()
                .downcast_ref::<T>()
                .ok_or_else(CompletionError::type_mismatch::<T>)?;
            f(input);
            Ok(())
        });
        self.chain(
            Continuation::Consume {
                action,
                failed_outcome,
            },
            timeout,
        )
    }

    /// A step producing another completion. The chain continues with the
    /// inner outcome once it is known, on whichever thread delivers it.
    pub fn and_then_to<U, F>(&self, f: F) -> Completion<U>
    where
        F: Fn(T) -> Completion<U> + Send + Sync + 'static,
    {
        self.and_then_to_with(None, None, f)
    }

    pub fn and_then_to_guarded<U, F>(&self, guard: StepGuard<T>, f: F) -> Completion<U>
    where
        T: PartialEq,
        F: Fn(T) -> Completion<U> + Send + Sync + 'static,
    {
        let (timeout, failed_outcome) = guard.split();
        self.and_then_to_with(timeout, failed_outcome, f)
    }

    fn and_then_to_with<U, F>(
        &self,
        timeout: Option<Duration>,
        failed_outcome: Option<FailedOutcome>,
        f: F,
    ) -> Completion<U>
    where
        F: Fn(T) -> Completion<U> + Send + Sync + 'static,
    {
        let transform = Box::new(move |value: Value| -> Result<Arc<Root>, CompletionError> {
            let input = view::<T>(&value).ok_or_else(CompletionError::type_mismatch::<T>)?;
            Ok(f(input).root)
        });
        self.chain(
            Continuation::FlatMap {
                transform,
                failed_outcome,
            },
            timeout,
        )
    }

    /// The failure handler. Receives the failed value; its return becomes
    /// the outcome. Runs at most once per resolution.
    pub fn otherwise<F>(&self, f: F) -> Completion<T>
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let handler = typed::<T, _>(move |input| Ok(erase(f(input))));
        self.chain(Continuation::Otherwise(handler), None)
    }

    pub fn otherwise_consume<F>(&self, f: F) -> Completion<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let handler = Box::new(move |value: Value| -> Result<Value, CompletionError> {
            let failed = value
                .as_ref()
                .downcast_ref::<T>()
                .ok_or_else(CompletionError::type_mismatch::<T>)?;
            f(failed);
            Ok(value)
        });
        self.chain(Continuation::Otherwise(handler), None)
    }

    /// The exception handler. Its return becomes the outcome. Runs at most
    /// once per resolution.
    pub fn recover_from<F>(&self, f: F) -> Completion<T>
    where
        F: Fn(CompletionError) -> T + Send + Sync + 'static,
    {
        let handler = Box::new(move |error: CompletionError| erase(f(error)));
        self.chain(Continuation::Recover(handler), None)
    }

    // ---- waiting ----------------------------------------------------------

    /// Block until the chain has drained and return the outcome, or
    /// `T::default()` if there is none.
    pub fn wait(&self) -> T
    where
        T: Default,
    {
        self.root
            .wait()
            .and_then(|value| view::<T>(&value))
            .unwrap_or_default()
    }

    /// Like [`wait`](Self::wait), bounded by `timeout`. When it elapses the
    /// completion is marked failed and `T::default()` is returned.
    pub fn wait_timeout(&self, timeout: Duration) -> T
    where
        T: Default,
    {
        self.root
            .wait_timeout(timeout)
            .and_then(|value| view::<T>(&value))
            .unwrap_or_default()
    }

    // ---- queries ----------------------------------------------------------

    /// The latest value stored on the chain, if it is a `T`.
    pub fn outcome(&self) -> Option<T> {
        self.root.latest_outcome().and_then(|value| view::<T>(&value))
    }

    pub fn has_outcome(&self) -> bool {
        self.is_completed() && self.outcome().is_some()
    }

    /// True for both a declared failure or timeout and an exception.
    pub fn has_failed(&self) -> bool {
        matches!(
            self.state(),
            CompletionState::Failed | CompletionState::Errored
        )
    }

    /// The chain has drained.
    pub fn is_completed(&self) -> bool {
        self.root.is_known()
    }

    pub fn state(&self) -> CompletionState {
        self.root.phase().observable()
    }

    pub fn exception(&self) -> Option<CompletionError> {
        self.root.exception()
    }
}

/// Wrap a typed step into an erased one, checking the input type.
fn typed<T, F>(f: F) -> MapFn
where
    T: Clone + 'static,
    F: Fn(T) -> Result<Value, CompletionError> + Send + Sync + 'static,
{
    Box::new(move |value: Value| {
        let input = view::<T>(&value).ok_or_else(CompletionError::type_mismatch::<T>)?;
        f(input)
    })
}

/// Optional deadline and sentinel for a single step.
#[derive(Debug, Clone)]
pub struct StepGuard<T> {
    timeout: Option<Duration>,
    failed_outcome: Option<T>,
}

impl<T> Default for StepGuard<T> {
    fn default() -> Self {
        Self {
            timeout: None,
            failed_outcome: None,
        }
    }
}

impl<T: PartialEq + Send + Sync + 'static> StepGuard<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the chain unless the step runs within `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fail the chain if the step's input equals `value`.
    pub fn failed_outcome(mut self, value: T) -> Self {
        self.failed_outcome = Some(value);
        self
    }

    fn split(self) -> (Option<Duration>, Option<FailedOutcome>) {
        (self.timeout, self.failed_outcome.map(FailedOutcome::of))
    }
}

/// Lift a value into an already-decided completion.
pub trait AsCompletion<T> {
    fn as_completion(self) -> Completion<T>;
}

impl<T, E> AsCompletion<T> for Result<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Display,
{
    fn as_completion(self) -> Completion<T> {
        match self {
            Ok(value) => Completion::resolved(value),
            Err(e) => Completion::errored(CompletionError::Failed(e.to_string())),
        }
    }
}
