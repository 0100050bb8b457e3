// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler errors.

/// Errors from starting a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}
