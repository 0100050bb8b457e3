// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.

use std::thread;

/// Sizing and naming for the timer worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SchedulerConfig {
    /// Timer threads sharing the deadline heap. 0 = one per available core.
    pub workers: usize,
    /// Thread name prefix; workers are named `{thread_name}-{id}`.
    pub thread_name: String,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Worker count with the `0 = auto` rule applied.
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(2)
        } else {
            self.workers
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            thread_name: "actorkit-timer".to_string(),
        }
    }
}
