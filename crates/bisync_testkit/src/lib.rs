//! # Bisync Testkit
//!
//! Test utilities for the bisync engine.
//!
//! This crate provides:
//! - A [`Harness`] pairing an engine with a manual clock
//! - Property-based generators of edit sessions using proptest
//! - Invariant checkers run after every step of a session
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bisync_testkit::prelude::*;
//!
//! #[test]
//! fn edit_then_sync() {
//!     let mut h = Harness::new();
//!     h.engine.handle_edit(Side::A, "blocks").unwrap();
//!     h.advance(300);
//!     assert_eq!(h.engine.current_state(), SystemState::Synced);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod invariants;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::invariants::*;
    pub use bisync_engine::{Side, SystemState};
}

pub use fixtures::*;
pub use generators::*;
pub use invariants::*;
