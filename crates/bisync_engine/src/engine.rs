//! The state manager.
//!
//! [`SyncEngine`] owns the current state, the document, every timer, the
//! version history and the event bus. All mutation goes through its
//! operations; collaborators only ever see copies.
//!
//! The engine never sleeps. Hosts call [`SyncEngine::tick`] when
//! [`SyncEngine::next_deadline`] has passed.

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::config::EngineConfig;
use crate::coordinator::{
    ConversionCoordinator, ConversionTicket, Dispatch, TransformStats, Transformer,
};
use crate::document::{Converted, Document, PendingEdit};
use crate::error::{ErrorClass, SyncError, SyncResult, TransformError};
use crate::events::{EngineEvent, EventBus, EventRecord, ListenerHandle};
use crate::recovery::{AttemptBudgets, RecoveryDecision, RecoveryNotice, RecoveryRouter};
use crate::state::{EditPermissions, Side, SystemState};
use crate::timing::{TimerFired, TimingController};
use crate::transition::{self, TransitionKind};
use crate::version::{RollbackResult, SnapshotTrigger, VersionId, VersionManager, VersionSnapshot};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to an accepted edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The edit was written to its side and a sync is scheduled.
    Applied,
    /// The edit was held until the in-flight conversion resolves.
    Buffered {
        /// True if it replaced an earlier buffered edit.
        replaced: bool,
    },
}

/// What happened to a reported conversion outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The outcome belonged to the current attempt and was acted on.
    Applied,
    /// The outcome was stale and ignored.
    Discarded,
}

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    /// Conversions that completed and landed on `Synced`.
    pub syncs_completed: u64,
    /// Failed attempts, including timeouts.
    pub failures: u64,
    /// Attempts that passed their deadline.
    pub timeouts: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Validation recoveries.
    pub validation_recoveries: u64,
    /// Data-error recoveries.
    pub data_recoveries: u64,
    /// System-error recoveries.
    pub system_recoveries: u64,
    /// Snapshot restores, explicit or from recovery.
    pub rollbacks: u64,
    /// Stale completions ignored.
    pub discarded_completions: u64,
    /// Edits refused.
    pub rejected_edits: u64,
    /// The most recent conversion failure.
    pub last_error: Option<TransformError>,
}

impl EngineStats {
    fn record_failure(&mut self, error: &TransformError) {
        self.failures += 1;
        self.last_error = Some(error.clone());
    }

    fn record_recovery(&mut self, class: ErrorClass) {
        match class {
            ErrorClass::Validation => self.validation_recoveries += 1,
            ErrorClass::Data => self.data_recoveries += 1,
            ErrorClass::System => self.system_recoveries += 1,
        }
    }
}

/// The bidirectional synchronization engine.
pub struct SyncEngine<T: Transformer> {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    coordinator: ConversionCoordinator<T>,
    document: Document,
    state: SystemState,
    last_dirty_side: Option<Side>,
    timing: TimingController,
    versions: VersionManager,
    router: RecoveryRouter,
    budgets: AttemptBudgets,
    events: EventBus,
    generation: u64,
    in_flight: Option<ConversionTicket>,
    awaiting_retry: Option<ConversionTicket>,
    deadline: Option<Timestamp>,
    locked: bool,
    rng: StdRng,
    stats: EngineStats,
    shut_down: bool,
}

impl<T: Transformer> SyncEngine<T> {
    /// Creates an engine on the system clock.
    pub fn new(config: EngineConfig, transformer: T, initial: Document) -> SyncResult<Self> {
        Self::with_clock(config, transformer, initial, Arc::new(SystemClock::new()))
    }

    /// Creates an engine on the given clock.
    ///
    /// The engine starts `Synced` with an `init` snapshot of `initial`.
    pub fn with_clock(
        config: EngineConfig,
        transformer: T,
        initial: Document,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let router = RecoveryRouter::new(config.retry.data_policy(), config.retry.system_policy());
        let budgets = router.budgets();
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut engine = Self {
            timing: TimingController::new(&config.timing),
            versions: VersionManager::new(config.max_history),
            events: EventBus::with_max_history(config.max_event_history),
            coordinator: ConversionCoordinator::new(transformer),
            document: initial,
            state: SystemState::Synced,
            last_dirty_side: None,
            router,
            budgets,
            generation: 0,
            in_flight: None,
            awaiting_retry: None,
            deadline: None,
            locked: false,
            rng,
            stats: EngineStats::default(),
            shut_down: false,
            clock,
            config,
        };
        engine.take_snapshot(SnapshotTrigger::Init)?;
        info!("sync engine started");
        Ok(engine)
    }

    // === Accessors ===

    /// The current state.
    pub fn current_state(&self) -> SystemState {
        self.state
    }

    /// Which sides may be edited now.
    pub fn edit_permissions(&self) -> EditPermissions {
        if self.locked {
            return EditPermissions::LOCKED;
        }
        EditPermissions::for_state(self.state, self.last_dirty_side)
    }

    /// The current document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// The dirty side, or the side an unresolved conversion started from.
    pub fn last_dirty_side(&self) -> Option<Side> {
        self.last_dirty_side
    }

    /// True while editing is disabled pending a manual version restore.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The attempt awaiting a completion, if any.
    pub fn in_flight(&self) -> Option<ConversionTicket> {
        self.in_flight
    }

    /// Engine counters.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Snapshot history, oldest first.
    pub fn history(&self) -> Vec<VersionSnapshot> {
        self.versions.history()
    }

    /// The injected transformer.
    pub fn transformer(&self) -> &T {
        self.coordinator.transformer()
    }

    /// The effective configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The event bus, for polling retained events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The engine's clock reading.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // === Subscriptions ===

    /// Registers a listener for every event. Drop the handle to remove it.
    pub fn add_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.events.listen(listener)
    }

    /// Returns a channel receiving every future event.
    pub fn subscribe(&self) -> Receiver<EventRecord> {
        self.events.subscribe()
    }

    // === Operations ===

    /// Records user content for `side`.
    ///
    /// From `Synced` the side becomes dirty; on the dirty side the debounce
    /// restarts. While converting, edits to the originating side are
    /// buffered (last write wins) and the other side is rejected.
    pub fn handle_edit(&mut self, side: Side, content: impl Into<Bytes>) -> SyncResult<EditOutcome> {
        self.ensure_running()?;
        let now = self.clock.now();

        if self.locked {
            self.reject_edit(now, side);
            return Err(SyncError::EditingLocked);
        }
        if !self.edit_permissions().allows(side) {
            self.reject_edit(now, side);
            return Err(SyncError::EditNotPermitted {
                side,
                state: self.state,
            });
        }

        let content = content.into();
        let outcome = match self.state {
            SystemState::Synced => {
                self.transition(TransitionKind::Normal, side.dirty_state())?;
                self.document.set_side(side, content);
                self.last_dirty_side = Some(side);
                self.timing.schedule_sync(now, side);
                EditOutcome::Applied
            }
            SystemState::DirtyA | SystemState::DirtyB => {
                self.document.set_side(side, content);
                self.timing.schedule_sync(now, side);
                EditOutcome::Applied
            }
            SystemState::Converting => {
                let is_override = self.timing.slot().has();
                self.timing.slot_mut().set(PendingEdit {
                    side,
                    content,
                    timestamp: now,
                    is_override,
                });
                debug!(%side, is_override, "edit buffered during conversion");
                self.events
                    .emit(now, EngineEvent::EditPending { side, is_override });
                EditOutcome::Buffered {
                    replaced: is_override,
                }
            }
        };

        if let Some(side) = self.timing.feedback(now, side) {
            self.events.emit(now, EngineEvent::FeedbackInterim { side });
        }
        Ok(outcome)
    }

    /// Starts a conversion of the dirty side immediately.
    ///
    /// Cancels any pending debounce. Only valid from a dirty state. The
    /// conversion must resolve within `sync_timeout` of this call, retries
    /// included.
    pub fn trigger_sync(&mut self) -> SyncResult<ConversionTicket> {
        self.ensure_running()?;
        if self.locked {
            return Err(SyncError::EditingLocked);
        }

        let from = self.state;
        let Some(origin) = from.dirty_side() else {
            let check = transition::validate(TransitionKind::Normal, from, SystemState::Converting);
            return Err(SyncError::InvalidStateTransition {
                from,
                to: SystemState::Converting,
                reason: check.reason.unwrap_or("no dirty side to convert"),
            });
        };

        self.transition(TransitionKind::Normal, SystemState::Converting)?;
        self.timing.cancel_sync();
        self.last_dirty_side = Some(origin);
        self.budgets = self.router.budgets();

        let deadline = self.clock.now() + self.config.sync_timeout;
        self.deadline = Some(deadline);
        self.timing.arm_timeout(deadline);
        self.start_attempt(origin, 1, deadline)
    }

    /// Reports a successful conversion for `ticket`.
    pub fn handle_sync_success(
        &mut self,
        ticket: ConversionTicket,
        converted: Converted,
    ) -> SyncResult<Completion> {
        self.ensure_running()?;
        if !self.is_current(ticket) {
            return Ok(self.discard(ticket));
        }
        self.complete_success(ticket, converted, TransformStats::default())
    }

    /// Reports a failed conversion for `ticket`.
    pub fn handle_sync_failed(
        &mut self,
        ticket: ConversionTicket,
        error: TransformError,
    ) -> SyncResult<Completion> {
        self.ensure_running()?;
        if !self.is_current(ticket) {
            return Ok(self.discard(ticket));
        }
        self.complete_failure(ticket, error)
    }

    /// Restores a snapshot and lands on `Synced`.
    ///
    /// `None` restores the most recent snapshot. Allowed from any state; an
    /// in-flight conversion is invalidated and every timer cancelled. On
    /// error nothing changes.
    pub fn rollback_to_version(&mut self, id: Option<VersionId>) -> SyncResult<RollbackResult> {
        self.ensure_running()?;
        let result = self.versions.rollback(id)?;
        let from = self.state;

        self.generation += 1;
        self.in_flight = None;
        self.awaiting_retry = None;
        self.deadline = None;
        self.timing.cancel_all();
        self.budgets = self.router.budgets();

        self.document = result.document.clone();
        self.last_dirty_side = None;
        self.locked = false;
        self.stats.rollbacks += 1;
        if from != SystemState::Synced {
            self.transition(TransitionKind::Rollback, SystemState::Synced)?;
        }

        info!(version = %result.version, ordinal = result.ordinal, %from, "rolled back");
        self.events.emit(
            self.clock.now(),
            EngineEvent::VersionRolledBack {
                id: result.version,
                ordinal: result.ordinal,
                from,
            },
        );
        Ok(result)
    }

    /// Fires every due timer. Returns how many fired.
    pub fn tick(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }
        let mut fired = 0;
        loop {
            let now = self.clock.now();
            let Some(timer) = self.timing.poll(now) else {
                break;
            };
            fired += 1;
            if let Err(e) = self.on_timer(now, timer) {
                warn!(error = %e, "timer handler failed");
            }
        }
        fired
    }

    /// The next time [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        if self.shut_down {
            return None;
        }
        self.timing.next_deadline()
    }

    /// Cancels every timer, invalidates in-flight work and drops all
    /// listeners. Every later operation returns [`SyncError::ShutDown`].
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.timing.cancel_all();
        self.generation += 1;
        self.in_flight = None;
        self.awaiting_retry = None;
        self.deadline = None;
        self.shut_down = true;
        self.events.close();
        info!(state = %self.state, "sync engine shut down");
    }

    // === Internals ===

    fn ensure_running(&self) -> SyncResult<()> {
        if self.shut_down {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, kind: TransitionKind, to: SystemState) -> SyncResult<()> {
        let from = self.state;
        let check = transition::validate(kind, from, to);
        if !check.allowed {
            return Err(SyncError::InvalidStateTransition {
                from,
                to,
                reason: check.reason.unwrap_or("transition denied"),
            });
        }

        self.state = to;
        debug!(%from, %to, ?kind, "state transition");
        self.events
            .emit(self.clock.now(), EngineEvent::StateChanged { from, to });
        Ok(())
    }

    fn reject_edit(&mut self, now: Timestamp, side: Side) {
        self.stats.rejected_edits += 1;
        debug!(%side, state = %self.state, locked = self.locked, "edit rejected");
        self.events.emit(
            now,
            EngineEvent::EditRejected {
                side,
                state: self.state,
            },
        );
    }

    fn is_current(&self, ticket: ConversionTicket) -> bool {
        self.in_flight == Some(ticket)
    }

    fn discard(&mut self, ticket: ConversionTicket) -> Completion {
        self.stats.discarded_completions += 1;
        debug!(
            generation = ticket.generation,
            current = self.generation,
            "discarding stale completion"
        );
        Completion::Discarded
    }

    fn take_snapshot(&mut self, trigger: SnapshotTrigger) -> SyncResult<()> {
        let now = self.clock.now();
        let snapshot = self
            .versions
            .snapshot(self.state, trigger, &self.document, now)?;
        debug!(ordinal = snapshot.ordinal(), ?trigger, "snapshot taken");
        self.events.emit(
            now,
            EngineEvent::VersionCreated {
                id: snapshot.id(),
                ordinal: snapshot.ordinal(),
                trigger,
            },
        );
        Ok(())
    }

    fn start_attempt(
        &mut self,
        origin: Side,
        attempt: u32,
        deadline: Timestamp,
    ) -> SyncResult<ConversionTicket> {
        self.generation += 1;
        let ticket = ConversionTicket {
            generation: self.generation,
            attempt,
            origin,
        };
        let now = self.clock.now();
        self.in_flight = Some(ticket);

        info!(%origin, generation = ticket.generation, attempt, "conversion started");
        self.events.emit(
            now,
            EngineEvent::SyncStarted {
                origin,
                generation: ticket.generation,
                attempt,
            },
        );

        match self.coordinator.dispatch(ticket, &self.document) {
            Dispatch::Deferred => {}
            Dispatch::Ready(report) => {
                if self.clock.now() >= deadline {
                    self.stats.timeouts += 1;
                    self.complete_failure(ticket, TransformError::timeout(self.config.sync_timeout))?;
                } else {
                    match report.outcome {
                        Ok(converted) => {
                            self.complete_success(ticket, converted, report.stats)?;
                        }
                        Err(error) => {
                            self.complete_failure(ticket, error)?;
                        }
                    }
                }
            }
        }
        Ok(ticket)
    }

    fn complete_success(
        &mut self,
        ticket: ConversionTicket,
        converted: Converted,
        stats: TransformStats,
    ) -> SyncResult<Completion> {
        self.in_flight = None;
        self.deadline = None;
        self.timing.cancel_conversion();

        self.document.apply_conversion(ticket.origin, converted);
        self.transition(TransitionKind::Normal, SystemState::Synced)?;
        self.budgets = self.router.budgets();
        self.last_dirty_side = None;
        self.stats.syncs_completed += 1;

        info!(origin = %ticket.origin, generation = ticket.generation, "conversion completed");
        self.events.emit(
            self.clock.now(),
            EngineEvent::SyncCompleted {
                origin: ticket.origin,
                generation: ticket.generation,
                stats,
            },
        );
        self.take_snapshot(SnapshotTrigger::SyncCompletion)?;

        self.replay_buffered()?;
        Ok(Completion::Applied)
    }

    fn complete_failure(
        &mut self,
        ticket: ConversionTicket,
        error: TransformError,
    ) -> SyncResult<Completion> {
        self.in_flight = None;
        self.stats.record_failure(&error);

        warn!(
            origin = %ticket.origin,
            attempt = ticket.attempt,
            class = %error.class(),
            code = %error.code,
            "conversion failed: {}",
            error.message
        );
        self.events.emit(
            self.clock.now(),
            EngineEvent::SyncFailed {
                origin: ticket.origin,
                classification: error.class(),
                code: error.code,
                message: error.message.clone(),
            },
        );

        let now = self.clock.now();
        let mut decision = self
            .router
            .route(&error, ticket.origin, &mut self.budgets, &mut self.rng);
        if let RecoveryDecision::Retry { delay } = decision {
            if self.deadline.is_none_or(|deadline| now + delay >= deadline) {
                debug!(delay_ms = delay.as_millis() as u64, "no time left for another attempt");
                decision = self.router.give_up(&error, ticket.origin);
            }
        }
        match decision {
            RecoveryDecision::Retry { delay } => {
                let next = ticket.attempt + 1;
                self.stats.retries += 1;
                self.awaiting_retry = Some(ticket);
                self.timing.arm_retry(now + delay);
                debug!(attempt = next, delay_ms = delay.as_millis() as u64, "retry scheduled");
                self.events.emit(
                    now,
                    EngineEvent::SyncRetrying {
                        attempt: next,
                        delay_ms: delay.as_millis() as u64,
                    },
                );
            }
            RecoveryDecision::StayDirty { side } | RecoveryDecision::FallbackToDirty { side } => {
                self.recover_to_dirty(side, &error)?;
            }
            RecoveryDecision::RollbackToStable => {
                self.recover_to_stable(ticket.origin, &error)?;
            }
        }
        Ok(Completion::Applied)
    }

    fn recover_to_dirty(&mut self, side: Side, error: &TransformError) -> SyncResult<()> {
        let to = side.dirty_state();
        self.transition(TransitionKind::Recovery, to)?;
        self.finish_recovery(to, error);
        self.replay_buffered()
    }

    fn recover_to_stable(&mut self, origin: Side, error: &TransformError) -> SyncResult<()> {
        let restored = match self.versions.rollback(None) {
            Ok(restored) => restored,
            Err(e) => return self.lock_editing(origin, error, e),
        };

        self.document = restored.document;
        self.last_dirty_side = None;
        self.timing.cancel_sync();
        self.transition(TransitionKind::Recovery, SystemState::Synced)?;
        self.stats.rollbacks += 1;
        self.finish_recovery(SystemState::Synced, error);

        info!(version = %restored.version, ordinal = restored.ordinal, "restored last synced version");
        self.events.emit(
            self.clock.now(),
            EngineEvent::VersionRolledBack {
                id: restored.version,
                ordinal: restored.ordinal,
                from: SystemState::Converting,
            },
        );
        self.replay_buffered()
    }

    fn lock_editing(
        &mut self,
        origin: Side,
        error: &TransformError,
        cause: SyncError,
    ) -> SyncResult<()> {
        let to = origin.dirty_state();
        self.transition(TransitionKind::Recovery, to)?;
        if let Some(pending) = self.timing.slot_mut().take() {
            self.document.set_side(pending.side, pending.content);
        }
        self.timing.cancel_all();
        self.locked = true;
        self.finish_recovery(to, error);

        let reason = format!("cannot restore last synced version: {cause}");
        error!(%origin, "{reason}; editing locked");
        self.events
            .emit(self.clock.now(), EngineEvent::EditingLocked { reason });
        Ok(())
    }

    fn finish_recovery(&mut self, to: SystemState, error: &TransformError) {
        self.budgets = self.router.budgets();
        self.awaiting_retry = None;
        self.deadline = None;
        self.timing.cancel_conversion();
        self.stats.record_recovery(error.class());

        info!(%to, class = %error.class(), "recovered from failed conversion");
        self.events.emit(
            self.clock.now(),
            EngineEvent::StateRecovered(RecoveryNotice {
                from_state: SystemState::Converting,
                to_state: to,
                classification: error.class(),
                reason: error.message.clone(),
            }),
        );
    }

    fn replay_buffered(&mut self) -> SyncResult<()> {
        if let Some(pending) = self.timing.slot_mut().take() {
            debug!(side = %pending.side, "replaying buffered edit");
            self.handle_edit(pending.side, pending.content)?;
        }
        Ok(())
    }

    fn on_timer(&mut self, now: Timestamp, timer: TimerFired) -> SyncResult<()> {
        match timer {
            TimerFired::SyncTimeout => {
                // The deadline covers the backoff between attempts too.
                if let Some(ticket) = self.in_flight.or(self.awaiting_retry) {
                    self.stats.timeouts += 1;
                    warn!(generation = ticket.generation, "conversion timed out");
                    self.complete_failure(ticket, TransformError::timeout(self.config.sync_timeout))?;
                }
            }
            TimerFired::RetryDue => {
                let previous = self.awaiting_retry.take();
                if let (Some(previous), Some(deadline)) = (previous, self.deadline) {
                    if self.state == SystemState::Converting {
                        self.start_attempt(previous.origin, previous.attempt + 1, deadline)?;
                    }
                }
            }
            TimerFired::Debounced(side) => {
                if self.state == side.dirty_state() && !self.locked {
                    self.trigger_sync()?;
                }
            }
            TimerFired::Feedback(side) => {
                self.events.emit(now, EngineEvent::FeedbackInterim { side });
            }
        }
        Ok(())
    }

    /// Flips a stored checksum so recovery failures can be exercised.
    #[cfg(test)]
    pub(crate) fn corrupt_version(&mut self, id: VersionId) {
        self.versions.corrupt(id);
    }
}

impl<T: Transformer> std::fmt::Debug for SyncEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state)
            .field("last_dirty_side", &self.last_dirty_side)
            .field("generation", &self.generation)
            .field("in_flight", &self.in_flight)
            .field("locked", &self.locked)
            .field("versions", &self.versions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{RetryConfig, TimingConfig};
    use crate::coordinator::{MockResponse, MockTransformer};
    use crate::events::EventKind;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn engine_with(config: EngineConfig) -> (SyncEngine<MockTransformer>, ManualClock) {
        let clock = ManualClock::new();
        let engine = SyncEngine::with_clock(
            config.with_jitter_seed(42),
            MockTransformer::new(),
            Document::new("blocks", "text", "model"),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (engine, clock)
    }

    fn engine() -> (SyncEngine<MockTransformer>, ManualClock) {
        engine_with(EngineConfig::default())
    }

    fn names(engine: &SyncEngine<MockTransformer>) -> Vec<&'static str> {
        engine.events().poll(0, usize::MAX).iter().map(|r| r.name).collect()
    }

    #[test]
    fn starts_synced_with_init_snapshot() {
        let (engine, _) = engine();
        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.edit_permissions(), EditPermissions::BOTH);
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.history()[0].trigger(), SnapshotTrigger::Init);
        assert_eq!(names(&engine), vec!["version.created"]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = SyncEngine::new(
            EngineConfig::default().with_max_history(0),
            MockTransformer::new(),
            Document::default(),
        );
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn edit_marks_side_dirty_and_debounces() {
        let (mut engine, clock) = engine();

        assert_eq!(engine.handle_edit(Side::A, "blocks v2").unwrap(), EditOutcome::Applied);
        assert_eq!(engine.current_state(), SystemState::DirtyA);
        assert_eq!(engine.edit_permissions(), EditPermissions::only(Side::A));
        assert_eq!(engine.document().side(Side::A), &Bytes::from_static(b"blocks v2"));
        assert_eq!(engine.next_deadline(), Some(Timestamp(300)));

        let err = engine.handle_edit(Side::B, "text v2").unwrap_err();
        assert!(matches!(err, SyncError::EditNotPermitted { side: Side::B, .. }));
        assert_eq!(engine.stats().rejected_edits, 1);

        clock.advance_ms(299);
        engine.tick();
        assert_eq!(engine.current_state(), SystemState::DirtyA);

        clock.advance_ms(1);
        engine.tick();
        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.document().side(Side::B), &Bytes::from_static(b"blocks v2"));
        assert_eq!(engine.history().len(), 2);
    }

    #[test]
    fn repeated_edits_restart_debounce() {
        let (mut engine, clock) = engine();
        engine.handle_edit(Side::B, "one").unwrap();
        clock.advance_ms(200);
        engine.handle_edit(Side::B, "two").unwrap();
        clock.advance_ms(200);
        engine.tick();
        assert_eq!(engine.current_state(), SystemState::DirtyB);

        clock.advance_ms(100);
        engine.tick();
        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.transformer().call_count(), 1);
        assert_eq!(engine.document().side(Side::A), &Bytes::from_static(b"two"));
    }

    #[test]
    fn trigger_sync_requires_dirty_state() {
        let (mut engine, _) = engine();
        let err = engine.trigger_sync().unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidStateTransition {
                from: SystemState::Synced,
                to: SystemState::Converting,
                ..
            }
        ));
    }

    #[test]
    fn second_trigger_while_converting_is_refused() {
        let (mut engine, _) = engine();
        engine.transformer().push(MockResponse::Defer);
        engine.handle_edit(Side::A, "x").unwrap();
        engine.trigger_sync().unwrap();

        assert!(engine.trigger_sync().is_err());
        assert_eq!(engine.transformer().call_count(), 1);
    }

    #[test]
    fn deferred_success_lands_on_synced() {
        let (mut engine, clock) = engine();
        engine.transformer().push(MockResponse::Defer);
        engine.handle_edit(Side::A, "blocks v2").unwrap();
        let ticket = engine.trigger_sync().unwrap();
        assert_eq!(engine.current_state(), SystemState::Converting);
        assert_eq!(engine.in_flight(), Some(ticket));

        clock.advance_ms(20);
        let completion = engine
            .handle_sync_success(ticket, Converted::new("model v2", "text v2"))
            .unwrap();
        assert_eq!(completion, Completion::Applied);
        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.document().model(), &Bytes::from_static(b"model v2"));
        assert_eq!(engine.in_flight(), None);
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn stale_completion_is_discarded() {
        let (mut engine, _) = engine();
        engine.transformer().push(MockResponse::Defer);
        engine.handle_edit(Side::A, "x").unwrap();
        let ticket = engine.trigger_sync().unwrap();
        engine.rollback_to_version(None).unwrap();

        let completion = engine
            .handle_sync_success(ticket, Converted::new("m", "o"))
            .unwrap();
        assert_eq!(completion, Completion::Discarded);
        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.document().model(), &Bytes::from_static(b"model"));
        assert_eq!(engine.stats().discarded_completions, 1);
    }

    #[test]
    fn validation_error_stays_dirty_without_retry() {
        let (mut engine, _) = engine();
        engine
            .transformer()
            .push(MockResponse::Fail(TransformError::validation("empty name")));
        engine.handle_edit(Side::B, "bad").unwrap();
        engine.trigger_sync().unwrap();

        assert_eq!(engine.current_state(), SystemState::DirtyB);
        assert_eq!(engine.transformer().call_count(), 1);
        assert_eq!(engine.stats().validation_recoveries, 1);
        assert_eq!(engine.next_deadline(), None);
        assert!(names(&engine).contains(&"state.recovered"));
    }

    #[test]
    fn data_errors_retry_with_backoff_then_fall_back() {
        let config = EngineConfig::default()
            .with_retry(RetryConfig::default().with_jitter_fraction(0.0));
        let (mut engine, clock) = engine_with(config);
        engine.transformer().fail_times(3, TransformError::syntax("line 1"));
        engine.handle_edit(Side::A, "blocks v2").unwrap();
        engine.trigger_sync().unwrap();

        assert_eq!(engine.current_state(), SystemState::Converting);
        assert_eq!(engine.next_deadline(), Some(Timestamp(100)));

        clock.advance_ms(100);
        engine.tick();
        assert_eq!(engine.transformer().call_count(), 2);
        assert_eq!(engine.next_deadline(), Some(Timestamp(300)));

        clock.advance_ms(200);
        engine.tick();
        assert_eq!(engine.transformer().call_count(), 3);
        assert_eq!(engine.current_state(), SystemState::DirtyA);
        assert_eq!(engine.document().side(Side::A), &Bytes::from_static(b"blocks v2"));
        assert_eq!(engine.stats().retries, 2);
        assert_eq!(engine.stats().data_recoveries, 1);
    }

    #[test]
    fn timeout_rolls_back_to_last_snapshot() {
        let (mut engine, clock) = engine();
        engine.transformer().push(MockResponse::Defer);
        engine.handle_edit(Side::B, "text v2").unwrap();
        let ticket = engine.trigger_sync().unwrap();

        clock.advance_ms(4999);
        engine.tick();
        assert_eq!(engine.current_state(), SystemState::Converting);

        clock.advance_ms(1);
        engine.tick();
        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.document(), &Document::new("blocks", "text", "model"));
        assert_eq!(engine.stats().timeouts, 1);
        assert_eq!(engine.stats().system_recoveries, 1);

        let late = engine.handle_sync_success(ticket, Converted::new("m", "o")).unwrap();
        assert_eq!(late, Completion::Discarded);
    }

    #[test]
    fn timeout_fires_during_backoff() {
        let (mut engine, clock) = engine();
        engine.transformer().fail_times(1, TransformError::malformed("bad"));
        engine.handle_edit(Side::B, "text v2").unwrap();
        engine.trigger_sync().unwrap();
        assert_eq!(engine.stats().retries, 1);
        assert_eq!(engine.in_flight(), None);

        clock.advance_ms(6000);
        engine.tick();
        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.document(), &Document::new("blocks", "text", "model"));
        assert_eq!(engine.transformer().call_count(), 1);
        assert_eq!(engine.stats().timeouts, 1);
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn reported_errors_are_routed_by_code() {
        let (mut engine, _) = engine();
        engine.transformer().push(MockResponse::Defer);
        engine.handle_edit(Side::A, "blocks v2").unwrap();
        let ticket = engine.trigger_sync().unwrap();

        let relabelled: TransformError = serde_json::from_str(
            r#"{"class":"system","code":"syntax_error","message":"bad","retriable":false}"#,
        )
        .unwrap();
        engine.handle_sync_failed(ticket, relabelled).unwrap();

        assert_eq!(engine.current_state(), SystemState::DirtyA);
        assert_eq!(engine.document().side(Side::A), &Bytes::from_static(b"blocks v2"));
        assert_eq!(engine.stats().data_recoveries, 1);
        assert_eq!(engine.stats().rollbacks, 0);
    }

    #[test]
    fn late_synchronous_report_counts_as_timeout() {
        struct Slow {
            clock: ManualClock,
        }
        impl Transformer for Slow {
            fn from_side_a_to_side_b(
                &self,
                data: &Bytes,
                _context: &crate::coordinator::TransformContext<'_>,
            ) -> Dispatch {
                self.clock.advance_ms(6000);
                Dispatch::Ready(crate::coordinator::TransformReport::success(
                    Converted::new(data.clone(), data.clone()),
                    TransformStats::default(),
                ))
            }
            fn from_side_b_to_side_a(
                &self,
                data: &Bytes,
                context: &crate::coordinator::TransformContext<'_>,
            ) -> Dispatch {
                self.from_side_a_to_side_b(data, context)
            }
        }

        let clock = ManualClock::new();
        let mut engine = SyncEngine::with_clock(
            EngineConfig::default(),
            Slow {
                clock: clock.clone(),
            },
            Document::new("a", "b", "m"),
            Arc::new(clock.clone()),
        )
        .unwrap();
        engine.handle_edit(Side::A, "a2").unwrap();
        engine.trigger_sync().unwrap();

        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.document().side(Side::A), &Bytes::from_static(b"a"));
        assert_eq!(engine.stats().timeouts, 1);
    }

    #[test]
    fn buffered_edits_keep_only_the_last() {
        let (mut engine, clock) = engine();
        engine.transformer().push(MockResponse::Defer);
        engine.handle_edit(Side::A, "first").unwrap();
        let ticket = engine.trigger_sync().unwrap();

        assert_eq!(
            engine.handle_edit(Side::A, "second").unwrap(),
            EditOutcome::Buffered { replaced: false }
        );
        assert_eq!(
            engine.handle_edit(Side::A, "third").unwrap(),
            EditOutcome::Buffered { replaced: true }
        );
        assert!(engine.handle_edit(Side::B, "other").is_err());

        engine
            .handle_sync_success(ticket, Converted::new("first", "first"))
            .unwrap();
        assert_eq!(engine.current_state(), SystemState::DirtyA);
        assert_eq!(engine.document().side(Side::A), &Bytes::from_static(b"third"));

        clock.advance_ms(300);
        engine.tick();
        assert_eq!(engine.current_state(), SystemState::Synced);
        let calls = engine.transformer().calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, Bytes::from_static(b"third"));
    }

    #[test]
    fn rollback_to_specific_version_from_dirty() {
        let (mut engine, clock) = engine();
        let init = engine.history()[0].id();
        engine.handle_edit(Side::A, "v2").unwrap();
        clock.advance_ms(300);
        engine.tick();
        assert_eq!(engine.history().len(), 2);

        engine.handle_edit(Side::A, "v3").unwrap();
        let result = engine.rollback_to_version(Some(init)).unwrap();
        assert_eq!(result.ordinal, 1);
        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.document(), &Document::new("blocks", "text", "model"));
        assert_eq!(engine.next_deadline(), None);
        assert_eq!(engine.history().len(), 2);
    }

    #[test]
    fn failed_rollback_changes_nothing() {
        let (mut engine, _) = engine();
        engine.handle_edit(Side::A, "v2").unwrap();
        let err = engine.rollback_to_version(Some(VersionId::new())).unwrap_err();
        assert!(matches!(err, SyncError::VersionNotFound(_)));
        assert_eq!(engine.current_state(), SystemState::DirtyA);
        assert_eq!(engine.document().side(Side::A), &Bytes::from_static(b"v2"));
    }

    #[test]
    fn corrupt_snapshot_locks_editing_until_manual_restore() {
        let config = EngineConfig::default().with_max_history(3);
        let (mut engine, _) = engine_with(config);
        let init = engine.history()[0].id();
        engine.handle_edit(Side::A, "v2").unwrap();
        engine.trigger_sync().unwrap();
        let latest = engine.history()[1].id();
        engine.corrupt_version(latest);

        engine
            .transformer()
            .push(MockResponse::Fail(TransformError::transport_fatal("refused")));
        engine.handle_edit(Side::B, "text v3").unwrap();
        engine.trigger_sync().unwrap();

        assert!(engine.is_locked());
        assert_eq!(engine.current_state(), SystemState::DirtyB);
        assert_eq!(engine.edit_permissions(), EditPermissions::LOCKED);
        assert!(matches!(engine.handle_edit(Side::B, "x"), Err(SyncError::EditingLocked)));
        assert!(matches!(engine.trigger_sync(), Err(SyncError::EditingLocked)));
        assert!(engine.rollback_to_version(None).is_err());
        assert!(engine.is_locked());
        assert!(names(&engine).contains(&EventKind::EditingLocked.name()));

        engine.rollback_to_version(Some(init)).unwrap();
        assert!(!engine.is_locked());
        assert_eq!(engine.current_state(), SystemState::Synced);
        assert_eq!(engine.edit_permissions(), EditPermissions::BOTH);
    }

    #[test]
    fn listeners_see_state_changes_until_handle_dropped() {
        let (mut engine, _) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = engine.add_listener(move |record| {
            if let EngineEvent::StateChanged { to, .. } = &record.event {
                sink.lock().push(*to);
            }
        });

        engine.handle_edit(Side::A, "x").unwrap();
        engine.trigger_sync().unwrap();
        drop(handle);
        engine.handle_edit(Side::A, "y").unwrap();

        assert_eq!(
            *seen.lock(),
            vec![SystemState::DirtyA, SystemState::Converting, SystemState::Synced]
        );
    }

    #[test]
    fn interim_feedback_is_throttled() {
        let config = EngineConfig::default()
            .with_timing(TimingConfig::default().with_debounce(Duration::from_secs(1)));
        let (mut engine, clock) = engine_with(config);
        let rx = engine.subscribe();

        engine.handle_edit(Side::A, "1").unwrap();
        clock.advance_ms(10);
        engine.handle_edit(Side::A, "2").unwrap();
        clock.advance_ms(10);
        engine.handle_edit(Side::A, "3").unwrap();
        clock.advance_ms(100);
        engine.tick();

        let feedback = rx
            .try_iter()
            .filter(|r| r.name == "feedback.interim")
            .count();
        assert_eq!(feedback, 2);
        assert_eq!(engine.current_state(), SystemState::DirtyA);
    }

    #[test]
    fn shutdown_stops_everything() {
        let (mut engine, clock) = engine();
        engine.handle_edit(Side::A, "x").unwrap();
        engine.shutdown();

        assert_eq!(engine.next_deadline(), None);
        clock.advance_ms(1000);
        assert_eq!(engine.tick(), 0);
        assert!(matches!(engine.handle_edit(Side::A, "y"), Err(SyncError::ShutDown)));
        assert!(matches!(engine.trigger_sync(), Err(SyncError::ShutDown)));
    }
}
