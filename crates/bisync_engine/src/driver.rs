//! Async host loop.
//!
//! A single tokio task owns the [`SyncEngine`]. It sleeps until the engine's
//! next deadline, fires due timers and serves [`DriverHandle`] requests in
//! between. Every request is answered over a oneshot channel, so the engine
//! is never shared and never locked.

use crate::clock::{Clock, Timestamp};
use crate::config::EngineConfig;
use crate::coordinator::{ConversionTicket, Transformer};
use crate::document::{Converted, Document};
use crate::engine::{Completion, EditOutcome, SyncEngine};
use crate::error::{SyncError, SyncResult, TransformError};
use crate::events::EventRecord;
use crate::state::{EditPermissions, Side, SystemState};
use crate::version::{RollbackResult, VersionId};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

const COMMAND_BUFFER: usize = 64;

/// Time on the tokio clock, measured from construction.
///
/// Follows tokio's paused time in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    /// Creates a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// The tokio instant a timestamp corresponds to.
    pub fn instant_at(&self, at: Timestamp) -> Instant {
        self.origin + std::time::Duration::from_millis(at.as_millis())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        let ms = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        Timestamp(ms)
    }
}

/// A request to the driver task.
#[derive(Debug)]
pub enum Command {
    /// [`SyncEngine::handle_edit`].
    Edit {
        /// Side edited.
        side: Side,
        /// New content of that side.
        content: Bytes,
        /// Reply channel.
        reply: oneshot::Sender<SyncResult<EditOutcome>>,
    },
    /// [`SyncEngine::trigger_sync`].
    TriggerSync {
        /// Reply channel.
        reply: oneshot::Sender<SyncResult<ConversionTicket>>,
    },
    /// [`SyncEngine::handle_sync_success`].
    Complete {
        /// Attempt being completed.
        ticket: ConversionTicket,
        /// Conversion output.
        converted: Converted,
        /// Reply channel.
        reply: oneshot::Sender<SyncResult<Completion>>,
    },
    /// [`SyncEngine::handle_sync_failed`].
    Fail {
        /// Attempt being completed.
        ticket: ConversionTicket,
        /// The failure.
        error: TransformError,
        /// Reply channel.
        reply: oneshot::Sender<SyncResult<Completion>>,
    },
    /// [`SyncEngine::rollback_to_version`].
    Rollback {
        /// Version to restore; latest if `None`.
        id: Option<VersionId>,
        /// Reply channel.
        reply: oneshot::Sender<SyncResult<RollbackResult>>,
    },
    /// Reads state and permissions.
    State {
        /// Reply channel.
        reply: oneshot::Sender<(SystemState, EditPermissions)>,
    },
    /// Reads the document.
    Document {
        /// Reply channel.
        reply: oneshot::Sender<Document>,
    },
    /// [`SyncEngine::subscribe`].
    Subscribe {
        /// Reply channel.
        reply: oneshot::Sender<std::sync::mpsc::Receiver<EventRecord>>,
    },
    /// Stops the driver.
    Shutdown,
}

/// Sends requests to a running driver.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    commands: mpsc::Sender<Command>,
}

impl DriverHandle {
    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> SyncResult<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::ShutDown)?;
        response.await.map_err(|_| SyncError::ShutDown)
    }

    /// Records an edit.
    pub async fn edit(&self, side: Side, content: impl Into<Bytes>) -> SyncResult<EditOutcome> {
        let content = content.into();
        self.request(|reply| Command::Edit {
            side,
            content,
            reply,
        })
        .await?
    }

    /// Starts a conversion now.
    pub async fn trigger_sync(&self) -> SyncResult<ConversionTicket> {
        self.request(|reply| Command::TriggerSync { reply }).await?
    }

    /// Reports a deferred conversion's success.
    pub async fn complete(
        &self,
        ticket: ConversionTicket,
        converted: Converted,
    ) -> SyncResult<Completion> {
        self.request(|reply| Command::Complete {
            ticket,
            converted,
            reply,
        })
        .await?
    }

    /// Reports a deferred conversion's failure.
    pub async fn fail(&self, ticket: ConversionTicket, error: TransformError) -> SyncResult<Completion> {
        self.request(|reply| Command::Fail {
            ticket,
            error,
            reply,
        })
        .await?
    }

    /// Restores a version.
    pub async fn rollback(&self, id: Option<VersionId>) -> SyncResult<RollbackResult> {
        self.request(|reply| Command::Rollback { id, reply }).await?
    }

    /// Current state and permissions.
    pub async fn state(&self) -> SyncResult<(SystemState, EditPermissions)> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Current document.
    pub async fn document(&self) -> SyncResult<Document> {
        self.request(|reply| Command::Document { reply }).await
    }

    /// Subscribes to engine events.
    pub async fn subscribe(&self) -> SyncResult<std::sync::mpsc::Receiver<EventRecord>> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    /// Asks the driver to stop. The driver's join handle yields the engine.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Builds an engine on a [`TokioClock`] and runs it on a new task.
///
/// Must be called from within a tokio runtime.
pub fn spawn<T>(
    config: EngineConfig,
    transformer: T,
    initial: Document,
) -> SyncResult<(DriverHandle, JoinHandle<SyncEngine<T>>)>
where
    T: Transformer + 'static,
{
    let clock = TokioClock::new();
    let engine = SyncEngine::with_clock(config, transformer, initial, Arc::new(clock))?;
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let task = tokio::spawn(run(engine, clock, rx));
    Ok((DriverHandle { commands: tx }, task))
}

/// Drives `engine` until a shutdown request arrives or every handle is dropped.
///
/// `clock` must be the clock the engine was built with.
pub async fn run<T: Transformer>(
    mut engine: SyncEngine<T>,
    clock: TokioClock,
    mut commands: mpsc::Receiver<Command>,
) -> SyncEngine<T> {
    loop {
        engine.tick();
        let wake = engine.next_deadline().map(|at| clock.instant_at(at));

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => serve(&mut engine, command),
            },
            _ = sleep_until_deadline(wake) => {}
        }
    }

    debug!("driver stopping");
    engine.shutdown();
    engine
}

async fn sleep_until_deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn serve<T: Transformer>(engine: &mut SyncEngine<T>, command: Command) {
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        Command::Edit {
            side,
            content,
            reply,
        } => {
            let _ = reply.send(engine.handle_edit(side, content));
        }
        Command::TriggerSync { reply } => {
            let _ = reply.send(engine.trigger_sync());
        }
        Command::Complete {
            ticket,
            converted,
            reply,
        } => {
            let _ = reply.send(engine.handle_sync_success(ticket, converted));
        }
        Command::Fail {
            ticket,
            error,
            reply,
        } => {
            let _ = reply.send(engine.handle_sync_failed(ticket, error));
        }
        Command::Rollback { id, reply } => {
            let _ = reply.send(engine.rollback_to_version(id));
        }
        Command::State { reply } => {
            let _ = reply.send((engine.current_state(), engine.edit_permissions()));
        }
        Command::Document { reply } => {
            let _ = reply.send(engine.document().clone());
        }
        Command::Subscribe { reply } => {
            let _ = reply.send(engine.subscribe());
        }
        Command::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{MockResponse, MockTransformer};
    use std::time::Duration;
    use tokio::time::sleep;

    fn initial() -> Document {
        Document::new("blocks", "text", "model")
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_edit_syncs_on_its_own() {
        let (handle, task) = spawn(EngineConfig::default(), MockTransformer::new(), initial()).unwrap();

        handle.edit(Side::A, "blocks v2").await.unwrap();
        let (state, _) = handle.state().await.unwrap();
        assert_eq!(state, SystemState::DirtyA);

        sleep(Duration::from_millis(400)).await;
        let (state, permissions) = handle.state().await.unwrap();
        assert_eq!(state, SystemState::Synced);
        assert_eq!(permissions, EditPermissions::BOTH);
        assert_eq!(
            handle.document().await.unwrap().side(Side::B),
            &Bytes::from_static(b"blocks v2")
        );

        handle.shutdown().await;
        let engine = task.await.unwrap();
        assert_eq!(engine.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_conversion_times_out() {
        let mock = MockTransformer::new();
        mock.push(MockResponse::Defer);
        let (handle, task) = spawn(EngineConfig::default(), mock, initial()).unwrap();

        handle.edit(Side::B, "text v2").await.unwrap();
        let ticket = handle.trigger_sync().await.unwrap();

        sleep(Duration::from_millis(6000)).await;
        let (state, _) = handle.state().await.unwrap();
        assert_eq!(state, SystemState::Synced);
        assert_eq!(handle.document().await.unwrap(), initial());

        let late = handle
            .complete(ticket, Converted::new("m", "o"))
            .await
            .unwrap();
        assert_eq!(late, Completion::Discarded);

        handle.shutdown().await;
        let engine = task.await.unwrap();
        assert_eq!(engine.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_completion_through_handle() {
        let mock = MockTransformer::new();
        mock.push(MockResponse::Defer);
        let (handle, _task) = spawn(EngineConfig::default(), mock, initial()).unwrap();
        let events = handle.subscribe().await.unwrap();

        handle.edit(Side::A, "blocks v2").await.unwrap();
        let ticket = handle.trigger_sync().await.unwrap();
        let done = handle
            .complete(ticket, Converted::new("model v2", "text v2"))
            .await
            .unwrap();
        assert_eq!(done, Completion::Applied);

        let names: Vec<_> = events.try_iter().map(|r| r.name).collect();
        assert!(names.contains(&"sync.started"));
        assert!(names.contains(&"sync.completed"));
        assert!(names.contains(&"version.created"));
    }

    #[tokio::test(start_paused = true)]
    async fn handle_reports_shutdown() {
        let (handle, task) = spawn(EngineConfig::default(), MockTransformer::new(), initial()).unwrap();
        handle.shutdown().await;
        task.await.unwrap();

        assert!(matches!(
            handle.edit(Side::A, "x").await,
            Err(SyncError::ShutDown)
        ));
    }
}
