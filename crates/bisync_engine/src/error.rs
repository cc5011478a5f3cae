//! Error types for the sync engine.

use crate::recovery::classify;
use crate::state::{Side, SystemState};
use crate::version::VersionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by engine operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        /// Current state.
        from: SystemState,
        /// Attempted target state.
        to: SystemState,
        /// Why the validator denied it.
        reason: &'static str,
    },

    /// The edit is not permitted in the current state.
    #[error("side {side} is not editable while {state}")]
    EditNotPermitted {
        /// Side the edit targeted.
        side: Side,
        /// State at the time of the edit.
        state: SystemState,
    },

    /// Editing is disabled until a version is selected manually.
    #[error("editing is locked until a version is restored")]
    EditingLocked,

    /// A snapshot was requested outside of `Synced`.
    #[error("snapshots are only taken in synced, not {state}")]
    SnapshotRejected {
        /// State at the time of the request.
        state: SystemState,
    },

    /// No snapshot has this id.
    #[error("version {0} not found")]
    VersionNotFound(VersionId),

    /// The version history is empty.
    #[error("no versions recorded")]
    HistoryEmpty,

    /// A snapshot failed its integrity check.
    #[error("version {id} failed its integrity check")]
    SnapshotCorrupted {
        /// Snapshot id.
        id: VersionId,
    },

    /// Snapshot encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine has been shut down.
    #[error("engine is shut down")]
    ShutDown,

    /// A conversion failure surfaced to the caller.
    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl SyncError {
    /// Returns true if the operation may succeed later without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transform(e) => e.retriable,
            SyncError::InvalidStateTransition { .. } => true,
            _ => false,
        }
    }
}

/// The three error classifications and the recovery each implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// The engine or its environment is unreliable; fall back to the last
    /// synced snapshot.
    System,
    /// The input cannot be converted; retry, then fall back to the dirty side.
    Data,
    /// User-correctable problem; stay on the dirty side without retrying.
    Validation,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::System => "system",
            ErrorClass::Data => "data",
            ErrorClass::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// What went wrong during a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No report arrived before the hard deadline.
    Timeout,
    /// The conversion service could not be reached.
    TransportUnavailable,
    /// The converter failed unexpectedly.
    RuntimeFault,
    /// The input is not well formed.
    MalformedInput,
    /// The input does not match the expected schema.
    SchemaMismatch,
    /// The text side does not parse.
    SyntaxError,
    /// No converter accepts this input.
    UnsupportedInput,
    /// The input parses but breaks a user-facing rule.
    ValidationFailed,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::TransportUnavailable => "transport_unavailable",
            ErrorCode::RuntimeFault => "runtime_fault",
            ErrorCode::MalformedInput => "malformed_input",
            ErrorCode::SchemaMismatch => "schema_mismatch",
            ErrorCode::SyntaxError => "syntax_error",
            ErrorCode::UnsupportedInput => "unsupported_input",
            ErrorCode::ValidationFailed => "validation_failed",
        };
        f.write_str(name)
    }
}

/// A failed conversion attempt.
///
/// The class always follows from the code; deserialized errors are
/// reclassified.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TransformErrorRecord")]
#[error("{class} error ({code}): {message}")]
pub struct TransformError {
    class: ErrorClass,
    /// What went wrong.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
    /// Whether another attempt may succeed.
    pub retriable: bool,
}

impl TransformError {
    /// Creates an error, classifying it by code.
    ///
    /// Data errors default to retriable; everything else does not.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let class = classify(code);
        Self {
            class,
            code,
            message: message.into(),
            retriable: class == ErrorClass::Data && code != ErrorCode::UnsupportedInput,
        }
    }

    /// Classification, derived from the code.
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// Overrides whether the error may be retried.
    pub fn with_retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }

    /// The synthetic error injected when a conversion passes its deadline.
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("no conversion report within {}ms", after.as_millis()),
        )
    }

    /// A transient, retriable transport failure.
    pub fn transport_transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportUnavailable, message).with_retriable(true)
    }

    /// A permanent transport failure.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportUnavailable, message)
    }

    /// Malformed input.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedInput, message)
    }

    /// A syntax error in the text side.
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SyntaxError, message)
    }

    /// A user-correctable validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    /// Input no converter accepts.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedInput, message)
    }
}

#[derive(Deserialize)]
struct TransformErrorRecord {
    code: ErrorCode,
    message: String,
    retriable: Option<bool>,
}

impl From<TransformErrorRecord> for TransformError {
    fn from(record: TransformErrorRecord) -> Self {
        let error = TransformError::new(record.code, record.message);
        match record.retriable {
            Some(retriable) => error.with_retriable(retriable),
            None => error,
        }
    }
}
