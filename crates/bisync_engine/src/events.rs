//! Engine notifications.
//!
//! Every state change, conversion outcome, recovery and version operation is
//! published as an [`EngineEvent`]. Each event kind has a fixed lowercase,
//! dot-separated name (`state.changed`, `sync.failed`, ...).
//!
//! Two ways to observe:
//! - [`EventBus::listen`] registers a callback and returns a
//!   [`ListenerHandle`]; dropping the handle (or calling
//!   [`unsubscribe`](ListenerHandle::unsubscribe)) is the only way to
//!   remove it.
//! - [`EventBus::subscribe`] returns a channel receiver; dropping the
//!   receiver unsubscribes it on the next emit.
//!
//! Listeners are invoked on a copy of the registry taken before the first
//! call, so a listener may drop handles (including its own) while being
//! notified.

use crate::clock::Timestamp;
use crate::coordinator::TransformStats;
use crate::error::{ErrorClass, ErrorCode};
use crate::recovery::RecoveryNotice;
use crate::state::{Side, SystemState};
use crate::version::{SnapshotTrigger, VersionId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// `state.changed`
    StateChanged,
    /// `sync.started`
    SyncStarted,
    /// `sync.completed`
    SyncCompleted,
    /// `sync.failed`
    SyncFailed,
    /// `sync.retrying`
    SyncRetrying,
    /// `state.recovered`
    StateRecovered,
    /// `edit.pending`
    EditPending,
    /// `edit.rejected`
    EditRejected,
    /// `feedback.interim`
    FeedbackInterim,
    /// `version.created`
    VersionCreated,
    /// `version.rolledback`
    VersionRolledBack,
    /// `editing.locked`
    EditingLocked,
}

impl EventKind {
    /// Every kind.
    pub const ALL: [EventKind; 12] = [
        EventKind::StateChanged,
        EventKind::SyncStarted,
        EventKind::SyncCompleted,
        EventKind::SyncFailed,
        EventKind::SyncRetrying,
        EventKind::StateRecovered,
        EventKind::EditPending,
        EventKind::EditRejected,
        EventKind::FeedbackInterim,
        EventKind::VersionCreated,
        EventKind::VersionRolledBack,
        EventKind::EditingLocked,
    ];

    /// The published name.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StateChanged => "state.changed",
            EventKind::SyncStarted => "sync.started",
            EventKind::SyncCompleted => "sync.completed",
            EventKind::SyncFailed => "sync.failed",
            EventKind::SyncRetrying => "sync.retrying",
            EventKind::StateRecovered => "state.recovered",
            EventKind::EditPending => "edit.pending",
            EventKind::EditRejected => "edit.rejected",
            EventKind::FeedbackInterim => "feedback.interim",
            EventKind::VersionCreated => "version.created",
            EventKind::VersionRolledBack => "version.rolledback",
            EventKind::EditingLocked => "editing.locked",
        }
    }
}

/// An engine notification with its payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EngineEvent {
    /// The state changed.
    StateChanged {
        /// Previous state.
        from: SystemState,
        /// New state.
        to: SystemState,
    },
    /// A conversion attempt was dispatched.
    SyncStarted {
        /// Side being converted.
        origin: Side,
        /// Attempt generation.
        generation: u64,
        /// Attempt number within the conversion.
        attempt: u32,
    },
    /// A conversion completed and was applied.
    SyncCompleted {
        /// Side that was converted.
        origin: Side,
        /// Attempt generation.
        generation: u64,
        /// Transformer measurements.
        stats: TransformStats,
    },
    /// A conversion attempt failed.
    SyncFailed {
        /// Side being converted.
        origin: Side,
        /// Error classification.
        classification: ErrorClass,
        /// Error code.
        code: ErrorCode,
        /// Error message.
        message: String,
    },
    /// Another attempt is scheduled.
    SyncRetrying {
        /// Number of the upcoming attempt.
        attempt: u32,
        /// Backoff before it.
        delay_ms: u64,
    },
    /// A recovery route left `Converting`.
    StateRecovered(RecoveryNotice),
    /// An edit was buffered during a conversion.
    EditPending {
        /// Side edited.
        side: Side,
        /// True if an earlier buffered edit was replaced.
        is_override: bool,
    },
    /// An edit was refused.
    EditRejected {
        /// Side edited.
        side: Side,
        /// State at the time.
        state: SystemState,
    },
    /// Rate-limited interim feedback for an edited side.
    FeedbackInterim {
        /// Side edited.
        side: Side,
    },
    /// A snapshot was taken.
    VersionCreated {
        /// Snapshot id.
        id: VersionId,
        /// Snapshot ordinal.
        ordinal: u64,
        /// Why it was taken.
        trigger: SnapshotTrigger,
    },
    /// A snapshot was restored.
    VersionRolledBack {
        /// Snapshot id.
        id: VersionId,
        /// Snapshot ordinal.
        ordinal: u64,
        /// State before the rollback.
        from: SystemState,
    },
    /// Editing is disabled until a version is restored manually.
    EditingLocked {
        /// Why.
        reason: String,
    },
}

impl EngineEvent {
    /// The event's kind.
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::StateChanged { .. } => EventKind::StateChanged,
            EngineEvent::SyncStarted { .. } => EventKind::SyncStarted,
            EngineEvent::SyncCompleted { .. } => EventKind::SyncCompleted,
            EngineEvent::SyncFailed { .. } => EventKind::SyncFailed,
            EngineEvent::SyncRetrying { .. } => EventKind::SyncRetrying,
            EngineEvent::StateRecovered(_) => EventKind::StateRecovered,
            EngineEvent::EditPending { .. } => EventKind::EditPending,
            EngineEvent::EditRejected { .. } => EventKind::EditRejected,
            EngineEvent::FeedbackInterim { .. } => EventKind::FeedbackInterim,
            EngineEvent::VersionCreated { .. } => EventKind::VersionCreated,
            EngineEvent::VersionRolledBack { .. } => EventKind::VersionRolledBack,
            EngineEvent::EditingLocked { .. } => EventKind::EditingLocked,
        }
    }

    /// The event's published name.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

/// An event as delivered, with ordering metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Emission order, starting at 1.
    pub sequence: u64,
    /// Published name.
    pub name: &'static str,
    /// Emission time.
    pub at: Timestamp,
    /// The event.
    pub event: EngineEvent,
}

type Listener = Arc<dyn Fn(&EventRecord) + Send + Sync>;
type ListenerRegistry = RwLock<Vec<(u64, Listener)>>;

/// Removes its listener when dropped.
#[must_use = "dropping the handle removes the listener"]
pub struct ListenerHandle {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl ListenerHandle {
    /// Removes the listener now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

/// Fans engine events out to listeners and channel subscribers.
pub struct EventBus {
    listeners: Arc<ListenerRegistry>,
    subscribers: RwLock<Vec<Sender<EventRecord>>>,
    history: RwLock<VecDeque<EventRecord>>,
    max_history: usize,
    next_sequence: AtomicU64,
    next_listener: AtomicU64,
}

impl EventBus {
    /// Creates a bus that keeps the last 256 events.
    pub fn new() -> Self {
        Self::with_max_history(256)
    }

    /// Creates a bus with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
            next_sequence: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Registers a callback for every future event.
    pub fn listen<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push((id, Arc::new(listener)));
        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Returns a receiver for every future event.
    pub fn subscribe(&self) -> Receiver<EventRecord> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes an event.
    pub fn emit(&self, at: Timestamp, event: EngineEvent) -> EventRecord {
        let record = EventRecord {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            name: event.name(),
            at,
            event,
        };

        {
            let mut history = self.history.write();
            history.push_back(record.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        // Send to subscribers (remove disconnected ones)
        self.subscribers
            .write()
            .retain(|tx| tx.send(record.clone()).is_ok());

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&record);
        }

        record
    }

    /// Returns retained events with sequence greater than `cursor`, up to `limit`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<EventRecord> {
        self.history
            .read()
            .iter()
            .filter(|r| r.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Number of channel subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Number of retained events.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Drops every listener and subscriber.
    pub fn close(&self) {
        self.listeners.write().clear();
        self.subscribers.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.subscriber_count())
            .field("history", &self.history_len())
            .finish()
    }
}
