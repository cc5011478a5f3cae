//! Conversion coordination and the transformer contract.

use crate::document::{Converted, Document};
use crate::error::TransformError;
use crate::state::Side;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Identifies one conversion attempt.
///
/// Completions must present the ticket of the current attempt; anything
/// else is stale and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConversionTicket {
    /// Attempt generation, unique per engine.
    pub generation: u64,
    /// Attempt number within the conversion, starting at 1.
    pub attempt: u32,
    /// The side being converted from.
    pub origin: Side,
}

/// What a transformer sees besides its input.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    /// The attempt being made.
    pub ticket: ConversionTicket,
    /// The authoritative model as of the last sync.
    pub model: &'a Bytes,
}

/// Measurements reported by a transformer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    /// Bytes read.
    pub input_bytes: usize,
    /// Bytes produced.
    pub output_bytes: usize,
    /// Time the transformer spent.
    pub elapsed_ms: u64,
}

/// The result of a finished conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformReport {
    /// The converted output or the failure.
    pub outcome: Result<Converted, TransformError>,
    /// Measurements.
    pub stats: TransformStats,
}

impl TransformReport {
    /// A successful report.
    pub fn success(converted: Converted, stats: TransformStats) -> Self {
        Self {
            outcome: Ok(converted),
            stats,
        }
    }

    /// A failed report.
    pub fn failure(error: TransformError, stats: TransformStats) -> Self {
        Self {
            outcome: Err(error),
            stats,
        }
    }

    /// Whether the conversion succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The converted output, if any.
    pub fn result(&self) -> Option<&Converted> {
        self.outcome.as_ref().ok()
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&TransformError> {
        self.outcome.as_ref().err()
    }
}

/// How a transformer answered a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The conversion finished during the call.
    Ready(TransformReport),
    /// The conversion continues elsewhere; its outcome will be reported
    /// through the engine's completion methods with the attempt's ticket.
    Deferred,
}

/// A data-type-specific converter between the two sides.
///
/// Implementations own all parsing and rendering. The engine only decides
/// when they run and what happens with their answer.
pub trait Transformer: Send + Sync {
    /// Returns false if this transformer cannot process `data` at all.
    fn can_handle(&self, data: &Bytes) -> bool {
        let _ = data;
        true
    }

    /// Converts side A content into a model and a side B rendering.
    fn from_side_a_to_side_b(&self, data: &Bytes, context: &TransformContext<'_>) -> Dispatch;

    /// Converts side B content into a model and a side A rendering.
    fn from_side_b_to_side_a(&self, data: &Bytes, context: &TransformContext<'_>) -> Dispatch;
}

/// Calls the transformer for each conversion attempt.
#[derive(Debug)]
pub struct ConversionCoordinator<T: Transformer> {
    transformer: T,
    dispatched: u64,
}

impl<T: Transformer> ConversionCoordinator<T> {
    /// Creates a coordinator around `transformer`.
    pub fn new(transformer: T) -> Self {
        Self {
            transformer,
            dispatched: 0,
        }
    }

    /// The wrapped transformer.
    pub fn transformer(&self) -> &T {
        &self.transformer
    }

    /// Number of dispatches made.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Runs one attempt converting `ticket.origin` of `document`.
    pub fn dispatch(&mut self, ticket: ConversionTicket, document: &Document) -> Dispatch {
        self.dispatched += 1;
        let input = document.side(ticket.origin);

        if !self.transformer.can_handle(input) {
            debug!(origin = %ticket.origin, "transformer cannot handle input");
            return Dispatch::Ready(TransformReport::failure(
                TransformError::unsupported(format!(
                    "no transformer accepts side {} content",
                    ticket.origin
                )),
                TransformStats {
                    input_bytes: input.len(),
                    ..TransformStats::default()
                },
            ));
        }

        let context = TransformContext {
            ticket,
            model: document.model(),
        };
        match ticket.origin {
            Side::A => self.transformer.from_side_a_to_side_b(input, &context),
            Side::B => self.transformer.from_side_b_to_side_a(input, &context),
        }
    }
}

/// A scripted response for [`MockTransformer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Succeed, copying the input into both the model and the other side.
    Mirror,
    /// Succeed with the given output.
    Succeed(Converted),
    /// Fail with the given error.
    Fail(TransformError),
    /// Defer; the caller completes the attempt later.
    Defer,
}

/// A transformer for tests and replays.
///
/// Answers with queued responses in order and mirrors its input once the
/// queue is empty.
#[derive(Debug)]
pub struct MockTransformer {
    responses: Mutex<VecDeque<MockResponse>>,
    calls: Mutex<Vec<(ConversionTicket, Bytes)>>,
    accepts: AtomicBool,
    call_count: AtomicU64,
}

impl MockTransformer {
    /// Creates a mock that mirrors every input.
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            accepts: AtomicBool::new(true),
            call_count: AtomicU64::new(0),
        }
    }

    /// Queues a response.
    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    /// Queues `n` copies of a failure.
    pub fn fail_times(&self, n: usize, error: TransformError) {
        let mut responses = self.responses.lock();
        for _ in 0..n {
            responses.push_back(MockResponse::Fail(error.clone()));
        }
    }

    /// Sets what `can_handle` answers.
    pub fn set_accepts(&self, accepts: bool) {
        self.accepts.store(accepts, Ordering::SeqCst);
    }

    /// Number of conversions requested.
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every conversion requested, with its input.
    pub fn calls(&self) -> Vec<(ConversionTicket, Bytes)> {
        self.calls.lock().clone()
    }

    /// Number of responses still queued.
    pub fn pending_responses(&self) -> usize {
        self.responses.lock().len()
    }

    fn answer(&self, data: &Bytes, context: &TransformContext<'_>) -> Dispatch {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push((context.ticket, data.clone()));

        let response = self.responses.lock().pop_front().unwrap_or(MockResponse::Mirror);
        let stats = TransformStats {
            input_bytes: data.len(),
            output_bytes: data.len(),
            elapsed_ms: 0,
        };
        match response {
            MockResponse::Mirror => Dispatch::Ready(TransformReport::success(
                Converted::new(data.clone(), data.clone()),
                stats,
            )),
            MockResponse::Succeed(converted) => {
                let stats = TransformStats {
                    output_bytes: converted.output.len(),
                    ..stats
                };
                Dispatch::Ready(TransformReport::success(converted, stats))
            }
            MockResponse::Fail(error) => Dispatch::Ready(TransformReport::failure(
                error,
                TransformStats {
                    output_bytes: 0,
                    ..stats
                },
            )),
            MockResponse::Defer => Dispatch::Deferred,
        }
    }
}

impl Default for MockTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for MockTransformer {
    fn can_handle(&self, _data: &Bytes) -> bool {
        self.accepts.load(Ordering::SeqCst)
    }

    fn from_side_a_to_side_b(&self, data: &Bytes, context: &TransformContext<'_>) -> Dispatch {
        self.answer(data, context)
    }

    fn from_side_b_to_side_a(&self, data: &Bytes, context: &TransformContext<'_>) -> Dispatch {
        self.answer(data, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    fn ticket(origin: Side) -> ConversionTicket {
        ConversionTicket {
            generation: 1,
            attempt: 1,
            origin,
        }
    }

    #[test]
    fn mock_mirrors_by_default() {
        let mut coordinator = ConversionCoordinator::new(MockTransformer::new());
        let doc = Document::new("blocks", "text", "model");

        let Dispatch::Ready(report) = coordinator.dispatch(ticket(Side::B), &doc) else {
            panic!("expected a ready report");
        };
        assert!(report.is_success());
        assert_eq!(report.result().unwrap().output, Bytes::from_static(b"text"));
        assert_eq!(coordinator.dispatched(), 1);
        assert_eq!(coordinator.transformer().call_count(), 1);
    }

    #[test]
    fn mock_follows_script() {
        let mock = MockTransformer::new();
        mock.push(MockResponse::Defer);
        mock.push(MockResponse::Fail(TransformError::syntax("line 1")));
        let mut coordinator = ConversionCoordinator::new(mock);
        let doc = Document::default();

        assert_eq!(coordinator.dispatch(ticket(Side::A), &doc), Dispatch::Deferred);
        let Dispatch::Ready(report) = coordinator.dispatch(ticket(Side::A), &doc) else {
            panic!("expected a ready report");
        };
        assert_eq!(report.error().unwrap().class(), ErrorClass::Data);
        assert_eq!(coordinator.transformer().pending_responses(), 0);
    }

    #[test]
    fn unsupported_input_is_reported_without_calling_transformer() {
        let mock = MockTransformer::new();
        mock.set_accepts(false);
        let mut coordinator = ConversionCoordinator::new(mock);

        let Dispatch::Ready(report) = coordinator.dispatch(ticket(Side::A), &Document::default()) else {
            panic!("expected a ready report");
        };
        let error = report.error().unwrap();
        assert_eq!(error.code, crate::error::ErrorCode::UnsupportedInput);
        assert!(!error.retriable);
        assert_eq!(coordinator.transformer().call_count(), 0);
    }

    #[test]
    fn calls_record_ticket_and_input() {
        let mut coordinator = ConversionCoordinator::new(MockTransformer::new());
        let doc = Document::new("a", "b", "m");
        coordinator.dispatch(ticket(Side::A), &doc);

        let calls = coordinator.transformer().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.origin, Side::A);
        assert_eq!(calls[0].1, Bytes::from_static(b"a"));
    }
}
