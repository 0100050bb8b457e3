// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Exceptions captured from continuation steps.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// What a step raised instead of producing a value.
///
/// Captured on the root, routed to the recover-handler, and reported by
/// `Completion::exception`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("transform panicked: {0}")]
    Panicked(String),
    #[error("transform failed: {0}")]
    Failed(String),
    #[error("outcome is not a {expected}")]
    TypeMismatch { expected: &'static str },
}

impl CompletionError {
    pub(crate) fn type_mismatch<T>() -> Self {
        CompletionError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        }
    }
}

/// Run a step, converting a panic into `CompletionError::Panicked`.
pub(crate) fn catch_panic<R>(
    step: impl FnOnce() -> Result<R, CompletionError>,
) -> Result<R, CompletionError> {
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result,
        Err(payload) => Err(CompletionError::Panicked(panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
