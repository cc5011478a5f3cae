//! Engine states, sides and the edit permissions derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two independently editable representations of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The block-structured view.
    A,
    /// The text view.
    B,
}

impl Side {
    /// Returns the opposite side.
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    /// Returns the dirty state that marks this side as temporarily authoritative.
    pub fn dirty_state(self) -> SystemState {
        match self {
            Side::A => SystemState::DirtyA,
            Side::B => SystemState::DirtyB,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("A"),
            Side::B => f.write_str("B"),
        }
    }
}

/// The current state of the synchronization engine.
///
/// Exactly one state holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    /// All representations and the authoritative model agree.
    Synced,
    /// Side A has unsynced edits.
    DirtyA,
    /// Side B has unsynced edits.
    DirtyB,
    /// A conversion attempt is in flight.
    Converting,
}

impl SystemState {
    /// Returns the dirty side, if this is a dirty state.
    pub fn dirty_side(&self) -> Option<Side> {
        match self {
            SystemState::DirtyA => Some(Side::A),
            SystemState::DirtyB => Some(Side::B),
            SystemState::Synced | SystemState::Converting => None,
        }
    }

    /// Returns true if this is one of the dirty states.
    pub fn is_dirty(&self) -> bool {
        self.dirty_side().is_some()
    }

    /// Returns true if a conversion can be started from this state.
    pub fn can_start_sync(&self) -> bool {
        self.is_dirty()
    }

    /// Returns true while a conversion is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, SystemState::Converting)
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemState::Synced => "synced",
            SystemState::DirtyA => "dirty_a",
            SystemState::DirtyB => "dirty_b",
            SystemState::Converting => "converting",
        };
        f.write_str(name)
    }
}

/// Which sides may be edited right now.
///
/// Derived from the state on every call, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EditPermissions {
    /// Side A accepts edits.
    pub side_a_editable: bool,
    /// Side B accepts edits.
    pub side_b_editable: bool,
    /// The user may move focus to the other side.
    pub can_switch_side: bool,
}

impl EditPermissions {
    /// Both sides editable; the resting permissions of `Synced`.
    pub const BOTH: EditPermissions = EditPermissions {
        side_a_editable: true,
        side_b_editable: true,
        can_switch_side: true,
    };

    /// Nothing editable, as while the engine is locked.
    pub const LOCKED: EditPermissions = EditPermissions {
        side_a_editable: false,
        side_b_editable: false,
        can_switch_side: false,
    };

    /// Only `side` is editable.
    pub fn only(side: Side) -> EditPermissions {
        EditPermissions {
            side_a_editable: side == Side::A,
            side_b_editable: side == Side::B,
            can_switch_side: false,
        }
    }

    /// Computes the permissions for `state`.
    ///
    /// `origin` is the side a conversion started from and only matters in
    /// `Converting`, where the originating side stays editable (its edits are
    /// buffered) and the other side is frozen. The engine records the origin
    /// whenever it enters `Converting`; `Converting` without one cannot occur
    /// and yields [`EditPermissions::LOCKED`].
    pub fn for_state(state: SystemState, origin: Option<Side>) -> EditPermissions {
        match (state, origin) {
            (SystemState::Synced, _) => EditPermissions::BOTH,
            (SystemState::DirtyA, _) => EditPermissions::only(Side::A),
            (SystemState::DirtyB, _) => EditPermissions::only(Side::B),
            (SystemState::Converting, Some(side)) => EditPermissions::only(side),
            (SystemState::Converting, None) => EditPermissions::LOCKED,
        }
    }

    /// Returns true if `side` may be edited.
    pub fn allows(&self, side: Side) -> bool {
        match side {
            Side::A => self.side_a_editable,
            Side::B => self.side_b_editable,
        }
    }

    /// Returns true if no side is editable.
    pub fn is_locked(&self) -> bool {
        !self.side_a_editable && !self.side_b_editable
    }
}
