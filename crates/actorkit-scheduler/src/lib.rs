// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer multiplexer for the actorkit runtime.
//!
//! A small pool of timer threads shares one deadline heap. Receivers are
//! signalled once (`schedule_once`) or repeatedly (`schedule`); every
//! registration hands back a [`Cancellable`].
//!
//! Components:
//! - `scheduler` — worker pool, deadline heap, close/shutdown
//! - `scheduled` — receiver trait driven by the scheduler
//! - `cancel`    — idempotent cancellation handle
//! - `task`      — heap entries and the per-task fire closure
//! - `config`    — pool sizing and thread naming
//! - `error`     — construction errors

pub mod cancel;
pub mod config;
pub mod error;
pub mod scheduled;
pub mod scheduler;
mod task;

pub use cancel::Cancellable;
pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use scheduled::Scheduled;
pub use scheduler::Scheduler;
