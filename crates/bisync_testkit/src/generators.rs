//! Property-based test generators using proptest.
//!
//! Generates edit sessions: interleavings of edits, time passing, explicit
//! syncs, scripted transformer behaviour, deferred completions and rollbacks.

use bisync_engine::{ErrorCode, MockResponse, Side, TransformError};
use bytes::Bytes;
use proptest::prelude::*;

/// One step of a generated edit session.
#[derive(Debug, Clone)]
pub enum SessionOp {
    /// Edit a side.
    Edit {
        /// Side edited
        side: Side,
        /// New content
        content: Bytes,
    },
    /// Let time pass and fire due timers.
    Advance {
        /// Milliseconds
        ms: u64,
    },
    /// Start a conversion now.
    TriggerSync,
    /// Script the transformer's next answer.
    Script {
        /// The response queued
        response: MockResponse,
    },
    /// Complete the in-flight attempt, if it was deferred.
    CompleteDeferred {
        /// Report success rather than failure
        succeed: bool,
    },
    /// Restore a snapshot by its position in the history, or the latest.
    Rollback {
        /// Index into the history; `None` for the latest
        index: Option<usize>,
    },
}

/// Strategy for sides.
pub fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::A), Just(Side::B)]
}

/// Strategy for side content.
pub fn content_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..64).prop_map(Bytes::from)
}

/// Strategy for error codes.
pub fn error_code_strategy() -> impl Strategy<Value = ErrorCode> {
    prop_oneof![
        Just(ErrorCode::Timeout),
        Just(ErrorCode::TransportUnavailable),
        Just(ErrorCode::RuntimeFault),
        Just(ErrorCode::MalformedInput),
        Just(ErrorCode::SchemaMismatch),
        Just(ErrorCode::SyntaxError),
        Just(ErrorCode::UnsupportedInput),
        Just(ErrorCode::ValidationFailed),
    ]
}

/// Strategy for transformer errors, including transient system errors.
pub fn transform_error_strategy() -> impl Strategy<Value = TransformError> {
    (error_code_strategy(), any::<bool>()).prop_map(|(code, transient)| {
        let error = TransformError::new(code, format!("generated {code}"));
        if transient && code == ErrorCode::TransportUnavailable {
            error.with_retriable(true)
        } else {
            error
        }
    })
}

/// Strategy for scripted transformer responses.
pub fn mock_response_strategy() -> impl Strategy<Value = MockResponse> {
    prop_oneof![
        2 => Just(MockResponse::Mirror),
        3 => transform_error_strategy().prop_map(MockResponse::Fail),
        2 => Just(MockResponse::Defer),
    ]
}

/// Strategy for time steps, biased towards the engine's timer boundaries.
pub fn advance_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        3 => 0u64..150,
        2 => Just(300u64),
        1 => 100u64..1000,
        1 => Just(5000u64),
    ]
}

/// Strategy for a single session step.
pub fn session_op_strategy() -> impl Strategy<Value = SessionOp> {
    prop_oneof![
        4 => (side_strategy(), content_strategy())
            .prop_map(|(side, content)| SessionOp::Edit { side, content }),
        4 => advance_strategy().prop_map(|ms| SessionOp::Advance { ms }),
        1 => Just(SessionOp::TriggerSync),
        3 => mock_response_strategy().prop_map(|response| SessionOp::Script { response }),
        2 => any::<bool>().prop_map(|succeed| SessionOp::CompleteDeferred { succeed }),
        1 => prop::option::of(0usize..12).prop_map(|index| SessionOp::Rollback { index }),
    ]
}

/// Strategy for a session of `min_ops..max_ops` steps.
pub fn session_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<SessionOp>> {
    prop::collection::vec(session_op_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
