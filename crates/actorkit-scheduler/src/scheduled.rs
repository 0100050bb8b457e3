// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Receiver side of the scheduler.

use crate::cancel::Cancellable;

/// Anything the scheduler can signal.
///
/// `handle` is the task's own [`Cancellable`], so a receiver can stop itself
/// from inside the callback. `data` is the value given at schedule time and
/// is handed back on every firing.
pub trait Scheduled<D>: Send + Sync {
    fn on_signal(&self, handle: &Cancellable, data: &D);
}

impl<D, F> Scheduled<D> for F
where
    F: Fn(&Cancellable, &D) + Send + Sync,
{
    fn on_signal(&self, handle: &Cancellable, data: &D) {
        self(handle, data)
    }
}
