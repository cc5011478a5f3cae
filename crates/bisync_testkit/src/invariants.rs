//! Invariant checks over generated sessions.
//!
//! [`SessionRunner`] applies [`SessionOp`]s to a [`Harness`] and checks the
//! engine after every step:
//!
//! - permissions are both sides, exactly one side, or (only while locked)
//!   neither
//! - in `Converting` only the originating side is editable
//! - history never exceeds its capacity
//! - a rollback either lands on `Synced` with the snapshot's document or
//!   changes nothing
//! - `Converting` never outlives its `sync_timeout` ([`converting_bound`])

use crate::fixtures::Harness;
use crate::generators::SessionOp;
use bisync_engine::{
    Converted, EditPermissions, EngineConfig, EngineEvent, Side, SystemState, Timestamp,
    TransformError,
};
use std::time::Duration;

/// Slack allowed past the conversion deadline.
pub const DEADLINE_EPSILON: Duration = Duration::from_millis(1);

/// Longest a conversion may stay unresolved under `config`. Retries and
/// their backoff all fall inside the one `sync_timeout` window.
pub fn converting_bound(config: &EngineConfig) -> Duration {
    config.sync_timeout + DEADLINE_EPSILON
}

/// A broken invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Index of the step after which it was detected.
    pub step: usize,
    /// What was wrong.
    pub message: String,
}

/// Applies session steps and records violations.
pub struct SessionRunner {
    /// The harness being driven.
    pub harness: Harness,
    violations: Vec<Violation>,
    cursor: u64,
    converting_since: Option<Timestamp>,
    step: usize,
}

impl SessionRunner {
    /// Creates a runner over a fresh harness.
    pub fn new(harness: Harness) -> Self {
        Self {
            harness,
            violations: Vec::new(),
            cursor: 0,
            converting_since: None,
            step: 0,
        }
    }

    /// Violations found so far.
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Applies every step, then drives timers until idle and checks that
    /// no conversion is left unresolved.
    pub fn run(&mut self, ops: &[SessionOp]) -> &[Violation] {
        for op in ops {
            self.apply(op);
        }
        self.harness.run_until_idle();
        self.check();
        if self.harness.engine.current_state() == SystemState::Converting {
            self.violate("conversion unresolved once every timer has fired");
        }
        &self.violations
    }

    /// Applies one step and checks the invariants.
    pub fn apply(&mut self, op: &SessionOp) {
        match op {
            SessionOp::Edit { side, content } => {
                let allowed = self.harness.engine.edit_permissions().allows(*side);
                let result = self.harness.engine.handle_edit(*side, content.clone());
                if result.is_ok() != allowed {
                    self.violate(format!(
                        "edit on {side} returned {result:?} but permissions said {allowed}"
                    ));
                }
            }
            SessionOp::Advance { ms } => {
                self.harness.advance(*ms);
            }
            SessionOp::TriggerSync => {
                let dirty = self.harness.engine.current_state().is_dirty();
                let result = self.harness.engine.trigger_sync();
                if result.is_ok() && !dirty {
                    self.violate("sync started from a state that is not dirty");
                }
            }
            SessionOp::Script { response } => {
                self.harness.engine.transformer().push(response.clone());
            }
            SessionOp::CompleteDeferred { succeed } => {
                if let Some(ticket) = self.harness.engine.in_flight() {
                    let result = if *succeed {
                        let input = self.harness.engine.document().side(ticket.origin).clone();
                        self.harness
                            .engine
                            .handle_sync_success(ticket, Converted::new(input.clone(), input))
                    } else {
                        self.harness
                            .engine
                            .handle_sync_failed(ticket, TransformError::malformed("deferred failure"))
                    };
                    if let Err(e) = result {
                        self.violate(format!("current completion refused: {e}"));
                    }
                }
            }
            SessionOp::Rollback { index } => self.rollback(*index),
        }
        self.check();
        self.step += 1;
    }

    fn rollback(&mut self, index: Option<usize>) {
        let history = self.harness.engine.history();
        let target = match index {
            Some(i) => history.get(i),
            None => history.last(),
        };
        let Some(target) = target else {
            return;
        };
        let expected = target.captured().document.clone();
        let id = target.id();

        let state_before = self.harness.engine.current_state();
        let document_before = self.harness.engine.document().clone();
        match self.harness.engine.rollback_to_version(index.map(|_| id)) {
            Ok(_) => {
                if self.harness.engine.current_state() != SystemState::Synced {
                    self.violate("rollback did not land on synced");
                }
                if self.harness.engine.document() != &expected {
                    self.violate("rollback restored a different document");
                }
            }
            Err(_) => {
                if self.harness.engine.current_state() != state_before
                    || self.harness.engine.document() != &document_before
                {
                    self.violate("failed rollback changed the engine");
                }
            }
        }
    }

    fn check(&mut self) {
        let engine = &self.harness.engine;
        let state = engine.current_state();
        let permissions = engine.edit_permissions();
        let locked = engine.is_locked();

        let shape_ok = match state {
            _ if locked => permissions == EditPermissions::LOCKED,
            SystemState::Synced => permissions == EditPermissions::BOTH,
            SystemState::DirtyA => permissions == EditPermissions::only(Side::A),
            SystemState::DirtyB => permissions == EditPermissions::only(Side::B),
            SystemState::Converting => {
                engine.last_dirty_side().map(EditPermissions::only) == Some(permissions)
            }
        };
        let message = (!shape_ok).then(|| format!("permissions {permissions:?} in {state}"));

        let capacity = engine.config().max_history;
        let history = engine.history().len();
        let history_message =
            (history > capacity).then(|| format!("history {history} exceeds {capacity}"));

        let now = engine.now();
        let bound = converting_bound(engine.config());
        let records = engine.events().poll(self.cursor, usize::MAX);

        for message in [message, history_message].into_iter().flatten() {
            self.violate(message);
        }

        for record in records {
            self.cursor = record.sequence;
            if let EngineEvent::StateChanged { from, to } = record.event {
                if to == SystemState::Converting {
                    self.converting_since = Some(record.at);
                } else if from == SystemState::Converting {
                    self.converting_since = None;
                }
            }
        }
        if let Some(since) = self.converting_since {
            let elapsed = now.saturating_since(since);
            if elapsed > bound {
                self.violate(format!("converting for {elapsed:?}, bound {bound:?}"));
            }
        }
    }

    fn violate(&mut self, message: impl Into<String>) {
        self.violations.push(Violation {
            step: self.step,
            message: message.into(),
        });
    }
}
