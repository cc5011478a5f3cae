//! Table-driven validation of state transitions.
//!
//! There are three kinds of transition and each has its own table:
//!
//! - [`TransitionKind::Normal`]: the acyclic happy path
//!   `Synced -> Dirty* -> Converting -> Synced`.
//! - [`TransitionKind::Recovery`]: a failed conversion leaving `Converting`
//!   for the originating dirty side or for `Synced`. Only the recovery
//!   routine requests these.
//! - [`TransitionKind::Rollback`]: restoring a snapshot, which lands on
//!   `Synced` from any state.
//!
//! `Converting -> Dirty*` is never part of the normal table.

use crate::state::SystemState;
use serde::Serialize;

/// The path a transition is requested through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Directly requested transition on the happy path.
    Normal,
    /// Error-recovery transition out of `Converting`.
    Recovery,
    /// Snapshot restore.
    Rollback,
}

/// The verdict of [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionCheck {
    /// Whether the transition may happen.
    pub allowed: bool,
    /// Why it was denied.
    pub reason: Option<&'static str>,
}

impl TransitionCheck {
    const fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    const fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Validates `from -> to` for the given kind. Pure; no side effects.
pub fn validate(kind: TransitionKind, from: SystemState, to: SystemState) -> TransitionCheck {
    use SystemState::*;

    match kind {
        TransitionKind::Normal => match (from, to) {
            (Synced, DirtyA) | (Synced, DirtyB) => TransitionCheck::allow(),
            (DirtyA, Converting) | (DirtyB, Converting) => TransitionCheck::allow(),
            (Converting, Synced) => TransitionCheck::allow(),
            (Converting, DirtyA) | (Converting, DirtyB) => {
                TransitionCheck::deny("leaving a conversion for a dirty side requires recovery")
            }
            (Converting, Converting) => TransitionCheck::deny("a conversion is already in flight"),
            (DirtyA, DirtyB) | (DirtyB, DirtyA) => {
                TransitionCheck::deny("only one side may be dirty at a time")
            }
            (Synced, Converting) => TransitionCheck::deny("nothing to convert while synced"),
            (DirtyA, Synced) | (DirtyB, Synced) => {
                TransitionCheck::deny("a dirty side reaches synced only through a conversion")
            }
            (Synced, Synced) | (DirtyA, DirtyA) | (DirtyB, DirtyB) => {
                TransitionCheck::deny("already in the requested state")
            }
        },
        TransitionKind::Recovery => match (from, to) {
            (Converting, DirtyA) | (Converting, DirtyB) | (Converting, Synced) => {
                TransitionCheck::allow()
            }
            (Converting, Converting) => TransitionCheck::deny("recovery must leave converting"),
            _ => TransitionCheck::deny("recovery only applies to an in-flight conversion"),
        },
        TransitionKind::Rollback => match to {
            Synced => TransitionCheck::allow(),
            DirtyA | DirtyB | Converting => TransitionCheck::deny("rollback always lands on synced"),
        },
    }
}
