// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Eventual values with chainable continuations.
//!
//! A [`Completion`] is resolved once by a producer and runs its chain of
//! continuations synchronously on the resolving thread. Failure is declared
//! by value: a step whose input equals its sentinel fails the chain, and
//! so does a deadline that elapses before its step runs. A panicking step
//! errors the chain instead. [`RepeatableCompletion`] re-runs its chain for
//! each new value.
//!
//! Components:
//! - `completion`   — typed handle, chain building, waiting
//! - `repeatable`   — re-triggerable chain
//! - `root`         — shared state and the drain loop
//! - `continuation` — continuation variants and the deadline race
//! - `state`        — lifecycle states
//! - `value`        — erased values and sentinels
//! - `error`        — captured exceptions

pub mod completion;
mod continuation;
pub mod error;
pub mod repeatable;
mod root;
pub mod state;
mod value;

pub use completion::{AsCompletion, Completion, StepGuard};
pub use error::CompletionError;
pub use repeatable::RepeatableCompletion;
pub use state::CompletionState;
