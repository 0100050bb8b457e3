// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cancellation handle for scheduled tasks.
//!
//! AtomicBool flag shared between the caller and the timer heap. Workers
//! check it before firing and again before re-arming a repeating task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle that stops a scheduled task from firing again.
///
/// Cloning shares the same flag. Cancelling never undoes a callback that
/// already ran.
#[derive(Debug, Clone)]
pub struct Cancellable {
    inner: Arc<CancelState>,
}

#[derive(Debug)]
struct CancelState {
    id: u64,
    flag: AtomicBool,
}

impl Cancellable {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(CancelState {
                id,
                flag: AtomicBool::new(false),
            }),
        }
    }

    /// A handle that is cancelled from birth. Returned when scheduling on a
    /// closed scheduler.
    pub(crate) fn cancelled(id: u64) -> Self {
        let handle = Self::new(id);
        handle.inner.flag.store(true, Ordering::Release);
        handle
    }

    /// Cancel the task. Returns `true` only for the call that flipped the
    /// flag; later calls are no-ops. Safe from inside the task's own callback.
    pub fn cancel(&self) -> bool {
        self.inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Scheduler-assigned task id, unique per scheduler.
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}
