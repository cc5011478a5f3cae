//! Error classification and recovery routing.
//!
//! Every conversion failure is classified before any state changes, then
//! routed to exactly one [`RecoveryDecision`]:
//!
//! | class      | retry                                   | lands on            |
//! |------------|-----------------------------------------|---------------------|
//! | validation | never                                   | originating dirty   |
//! | data       | backoff, until the data budget runs out | originating dirty   |
//! | system     | once, only for transient errors         | last synced version |
//!
//! The router is pure apart from the budgets and RNG it is handed; the
//! engine applies the decision.

use crate::error::{ErrorClass, ErrorCode, TransformError};
use crate::retry::{RetryBudget, RetryPolicy};
use crate::state::{Side, SystemState};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

/// Maps an error code to its classification.
pub fn classify(code: ErrorCode) -> ErrorClass {
    match code {
        ErrorCode::Timeout | ErrorCode::TransportUnavailable | ErrorCode::RuntimeFault => {
            ErrorClass::System
        }
        ErrorCode::MalformedInput
        | ErrorCode::SchemaMismatch
        | ErrorCode::SyntaxError
        | ErrorCode::UnsupportedInput => ErrorClass::Data,
        ErrorCode::ValidationFailed => ErrorClass::Validation,
    }
}

/// What the engine does about a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Stay in `Converting` and attempt again after `delay`.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// Return to the dirty side without retrying (validation).
    StayDirty {
        /// The originating side.
        side: Side,
    },
    /// Give up and return to the dirty side, keeping the user's edits.
    FallbackToDirty {
        /// The originating side.
        side: Side,
    },
    /// Restore the most recent synced snapshot.
    RollbackToStable,
}

impl RecoveryDecision {
    /// The state this decision lands on, if it leaves `Converting`.
    pub fn target(&self) -> Option<SystemState> {
        match self {
            RecoveryDecision::Retry { .. } => None,
            RecoveryDecision::StayDirty { side } | RecoveryDecision::FallbackToDirty { side } => {
                Some(side.dirty_state())
            }
            RecoveryDecision::RollbackToStable => Some(SystemState::Synced),
        }
    }
}

/// Failure accounting for one conversion, across its attempts.
#[derive(Debug, Clone)]
pub struct AttemptBudgets {
    data: RetryBudget,
    system: RetryBudget,
}

impl AttemptBudgets {
    /// Data failures recorded so far.
    pub fn data_failures(&self) -> u32 {
        self.data.failures()
    }

    /// Transient system failures recorded so far.
    pub fn system_failures(&self) -> u32 {
        self.system.failures()
    }
}

/// Published whenever a recovery route leaves `Converting`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryNotice {
    /// Always `Converting`.
    pub from_state: SystemState,
    /// Where recovery landed.
    pub to_state: SystemState,
    /// Classification of the error that caused it.
    pub classification: ErrorClass,
    /// The error message.
    pub reason: String,
}

/// Routes classified errors to recovery decisions.
#[derive(Debug, Clone)]
pub struct RecoveryRouter {
    data_policy: RetryPolicy,
    system_policy: RetryPolicy,
}

impl RecoveryRouter {
    /// Creates a router from the two backoff policies.
    pub fn new(data_policy: RetryPolicy, system_policy: RetryPolicy) -> Self {
        Self {
            data_policy,
            system_policy,
        }
    }

    /// Fresh budgets for a new conversion.
    pub fn budgets(&self) -> AttemptBudgets {
        AttemptBudgets {
            data: RetryBudget::new(self.data_policy),
            system: RetryBudget::new(self.system_policy),
        }
    }

    /// Decides what to do about `error` for a conversion started from `origin`.
    pub fn route<R: Rng>(
        &self,
        error: &TransformError,
        origin: Side,
        budgets: &mut AttemptBudgets,
        rng: &mut R,
    ) -> RecoveryDecision {
        match error.class() {
            ErrorClass::Validation => RecoveryDecision::StayDirty { side: origin },
            ErrorClass::Data => {
                if !error.retriable {
                    return RecoveryDecision::FallbackToDirty { side: origin };
                }
                match budgets.data.record_failure(rng) {
                    Some(delay) => RecoveryDecision::Retry { delay },
                    None => RecoveryDecision::FallbackToDirty { side: origin },
                }
            }
            ErrorClass::System => {
                if !error.retriable || error.code == ErrorCode::Timeout {
                    return RecoveryDecision::RollbackToStable;
                }
                match budgets.system.record_failure(rng) {
                    Some(delay) => RecoveryDecision::Retry { delay },
                    None => RecoveryDecision::RollbackToStable,
                }
            }
        }
    }

    /// The decision for `error` once no further attempt is allowed, for
    /// instance because the next one would start past the conversion
    /// deadline.
    pub fn give_up(&self, error: &TransformError, origin: Side) -> RecoveryDecision {
        match error.class() {
            ErrorClass::Validation => RecoveryDecision::StayDirty { side: origin },
            ErrorClass::Data => RecoveryDecision::FallbackToDirty { side: origin },
            ErrorClass::System => RecoveryDecision::RollbackToStable,
        }
    }
}
