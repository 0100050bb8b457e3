// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Completion lifecycle states.

use std::sync::atomic::{AtomicU8, Ordering};

/// Observable state of a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// No outcome yet.
    Pending,
    /// Resolved with a value that is not the declared failure.
    Resolved,
    /// Declared failure or timeout.
    Failed,
    /// A step raised an exception.
    Errored,
}

/// Internal phase. `Completing` is held only while a producer publishes
/// its value, and reads as Pending from outside.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Pending = 0,
    Completing = 1,
    Resolved = 2,
    Failed = 3,
    Errored = 4,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Completing,
            2 => Self::Resolved,
            3 => Self::Failed,
            _ => Self::Errored,
        }
    }

    /// Resolved, Failed or Errored: continuations may drain.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::Errored)
    }

    /// Failed or Errored: map/consume/flat-map steps are skipped.
    pub fn is_short_circuited(self) -> bool {
        matches!(self, Self::Failed | Self::Errored)
    }

    pub fn observable(self) -> CompletionState {
        match self {
            Self::Pending | Self::Completing => CompletionState::Pending,
            Self::Resolved => CompletionState::Resolved,
            Self::Failed => CompletionState::Failed,
            Self::Errored => CompletionState::Errored,
        }
    }
}

/// Atomic phase cell. Transitions that must win a race go through
/// compare-exchange.
#[derive(Debug)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new(phase: Phase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    pub fn transition(&self, from: Phase, to: Phase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to Failed from anything but Errored. Returns the prior phase.
    pub fn fail(&self) -> Phase {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                if p == Phase::Errored as u8 {
                    None
                } else {
                    Some(Phase::Failed as u8)
                }
            })
            .unwrap_or_else(|p| p);
        Phase::from_u8(prev)
    }
}
