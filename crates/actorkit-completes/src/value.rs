// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Type-erased values flowing through a chain.
//!
//! Every step of a chain shares one root, so values are stored erased and
//! viewed back at the typed boundary of each step.

use std::any::Any;
use std::sync::Arc;

pub(crate) type Value = Arc<dyn Any + Send + Sync>;

pub(crate) fn erase<T: Send + Sync + 'static>(value: T) -> Value {
    Arc::new(value)
}

pub(crate) fn view<T: Clone + 'static>(value: &Value) -> Option<T> {
    value.as_ref().downcast_ref::<T>().cloned()
}

/// Declared sentinel: a value meaning "this is a failure", matched by
/// equality. A value of a different type never matches.
#[derive(Clone)]
pub(crate) struct FailedOutcome {
    value: Value,
    same: fn(&Value, &Value) -> bool,
}

impl FailedOutcome {
    pub fn of<T: PartialEq + Send + Sync + 'static>(value: T) -> Self {
        Self {
            value: erase(value),
            same: same_as::<T>,
        }
    }

    pub fn matches(&self, candidate: &Value) -> bool {
        (self.same)(&self.value, candidate)
    }

    pub fn value(&self) -> Value {
        self.value.clone()
    }
}

impl std::fmt::Debug for FailedOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FailedOutcome(..)")
    }
}

fn same_as<T: PartialEq + 'static>(a: &Value, b: &Value) -> bool {
    match (a.as_ref().downcast_ref::<T>(), b.as_ref().downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
