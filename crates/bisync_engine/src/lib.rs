//! # Bisync Engine
//!
//! Synchronization engine keeping two independently editable views of one
//! document consistent through an authoritative intermediate model.
//!
//! This crate provides:
//! - A four-state machine (synced, dirty A, dirty B, converting) with
//!   table-driven transition validation
//! - Debounced sync scheduling, throttled interim feedback and a
//!   single-slot buffer for edits made during a conversion
//! - Conversion attempts through an injected [`Transformer`], with
//!   generation tickets so stale completions are discarded
//! - Error classification and recovery routing with bounded backoff
//! - Bounded, integrity-checked version history with all-or-nothing rollback
//! - An event bus with lowercase dot-separated event names
//! - A tokio host loop in [`driver`]
//!
//! ## Architecture
//!
//! The engine is sans-IO. It never sleeps or spawns; every timer is a
//! deadline against an injected [`Clock`]. The host calls
//! [`SyncEngine::tick`] once [`SyncEngine::next_deadline`] has passed.
//!
//! ```text
//! edit ──► dirty side ──debounce──► converting ──success──► synced + snapshot
//!                                      │
//!                                      ├─ validation ─► dirty side
//!                                      ├─ data ─► retry … ─► dirty side
//!                                      └─ system / timeout ─► last snapshot
//! ```
//!
//! ## Key Invariants
//!
//! - Exactly one state holds at any time
//! - At most one conversion attempt is in flight
//! - `Converting` always resolves to `Synced` or the originating dirty side
//! - Snapshots are only taken on entry to `Synced`
//! - Rollback restores everything or nothing

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod coordinator;
mod document;
pub mod driver;
mod engine;
mod error;
mod events;
mod recovery;
mod retry;
mod state;
pub mod timing;
mod transition;
mod version;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{EngineConfig, RetryConfig, TimingConfig};
pub use coordinator::{
    ConversionCoordinator, ConversionTicket, Dispatch, MockResponse, MockTransformer,
    TransformContext, TransformReport, TransformStats, Transformer,
};
pub use document::{Converted, Document, PendingEdit};
pub use engine::{Completion, EditOutcome, EngineStats, SyncEngine};
pub use error::{ErrorClass, ErrorCode, SyncError, SyncResult, TransformError};
pub use events::{EngineEvent, EventBus, EventKind, EventRecord, ListenerHandle};
pub use recovery::{classify, AttemptBudgets, RecoveryDecision, RecoveryNotice, RecoveryRouter};
pub use retry::{RetryBudget, RetryPolicy};
pub use state::{EditPermissions, Side, SystemState};
pub use timing::ThrottleMode;
pub use transition::{validate, TransitionCheck, TransitionKind};
pub use version::{
    CapturedState, RollbackResult, SnapshotTrigger, VersionId, VersionManager, VersionSnapshot,
};
