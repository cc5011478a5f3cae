//! Replay command implementation.
//!
//! Drives an engine on a manual clock through a JSON script:
//!
//! ```json
//! {
//!   "initial": { "side_a": "blocks", "side_b": "text", "model": "model" },
//!   "steps": [
//!     { "at": 0, "op": "edit", "side": "a", "content": "blocks v2" },
//!     { "at": 300, "op": "tick" }
//!   ]
//! }
//! ```
//!
//! Each step first moves the clock to `at` (time never goes back) and fires
//! due timers, then performs its operation. Once the script ends, timers are
//! fired until none is armed.

use bisync_engine::{
    Converted, Document, EngineConfig, EngineStats, ErrorCode, EventRecord, ManualClock,
    MockResponse, MockTransformer, Side, SyncEngine, SyncError, SystemState, Timestamp,
    TransformError,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_DRAIN_ROUNDS: usize = 1000;

/// Command-line overrides of the engine configuration.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    /// Edit debounce in milliseconds.
    pub debounce_ms: Option<u64>,
    /// Conversion timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Version history capacity.
    pub history: Option<usize>,
}

impl Overrides {
    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(ms) = self.debounce_ms {
            config.timing = config.timing.with_debounce(Duration::from_millis(ms));
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_sync_timeout(Duration::from_millis(ms));
        }
        if let Some(history) = self.history {
            config = config.with_max_history(history);
        }
        config
    }
}

/// A replay script.
#[derive(Debug, Deserialize)]
pub struct Script {
    /// Starting document.
    #[serde(default)]
    pub initial: InitialDocument,
    /// Jitter seed, for reproducible backoff.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Timed steps.
    pub steps: Vec<Step>,
}

/// The starting document of a script.
#[derive(Debug, Default, Deserialize)]
pub struct InitialDocument {
    /// Side A content.
    #[serde(default)]
    pub side_a: String,
    /// Side B content.
    #[serde(default)]
    pub side_b: String,
    /// Model content.
    #[serde(default)]
    pub model: String,
}

/// One timed step.
#[derive(Debug, Deserialize)]
pub struct Step {
    /// Milliseconds since the start of the replay.
    pub at: u64,
    /// What to do.
    #[serde(flatten)]
    pub action: Action,
}

/// A step's operation.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    /// Edit a side.
    Edit {
        /// Side edited
        side: Side,
        /// New content of the side
        content: String,
    },
    /// Start a conversion now.
    Sync,
    /// Make the next conversions fail.
    FailNext {
        /// Error code
        code: ErrorCode,
        /// Error message
        #[serde(default)]
        message: String,
        /// Number of failures queued
        #[serde(default = "one")]
        times: usize,
        /// Overrides whether the error is retriable
        #[serde(default)]
        retriable: Option<bool>,
    },
    /// Make the next conversion deferred.
    DeferNext,
    /// Complete the deferred conversion successfully.
    Complete {
        /// New model; defaults to the converted input
        #[serde(default)]
        model: Option<String>,
        /// Rendering for the other side; defaults to the converted input
        #[serde(default)]
        output: Option<String>,
    },
    /// Fail the deferred conversion.
    Fail {
        /// Error code
        code: ErrorCode,
        /// Error message
        #[serde(default)]
        message: String,
    },
    /// Restore a version by ordinal, or the latest.
    Rollback {
        /// Snapshot ordinal
        #[serde(default)]
        ordinal: Option<u64>,
    },
    /// Only fire due timers.
    Tick,
}

fn one() -> usize {
    1
}

/// The outcome of one step.
#[derive(Debug, Serialize)]
pub struct StepOutcome {
    /// When the step ran.
    pub at: Timestamp,
    /// Operation name.
    pub op: &'static str,
    /// Why it was refused, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything a replay produced.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// Every event, in order.
    pub events: Vec<EventRecord>,
    /// Per-step outcomes.
    pub steps: Vec<StepOutcome>,
    /// State after the replay.
    pub final_state: SystemState,
    /// Document after the replay.
    pub document: Document,
    /// Engine counters.
    pub stats: EngineStats,
    /// Snapshot ordinals retained, oldest first.
    pub history: Vec<u64>,
}

/// Runs the replay command.
pub fn run(path: &Path, overrides: &Overrides, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!("Replaying {:?}", path);
    let text = std::fs::read_to_string(path)?;
    let script: Script = serde_json::from_str(&text)?;
    let report = replay(&script, overrides)?;

    match format {
        "json" => {
            for event in &report.events {
                println!("{}", serde_json::to_string(event)?);
            }
            println!("{}", serde_json::to_string(&summary(&report))?);
        }
        _ => print_text_output(&report)?,
    }

    Ok(())
}

/// Replays `script` and collects the results.
pub fn replay(script: &Script, overrides: &Overrides) -> Result<ReplayReport, SyncError> {
    let mut config = overrides.apply(EngineConfig::default());
    if let Some(seed) = script.seed {
        config = config.with_jitter_seed(seed);
    }

    let clock = ManualClock::new();
    let initial = Document::new(
        script.initial.side_a.clone(),
        script.initial.side_b.clone(),
        script.initial.model.clone(),
    );
    let mut engine =
        SyncEngine::with_clock(config, MockTransformer::new(), initial, Arc::new(clock.clone()))?;
    let events = engine.subscribe();
    let mut steps = Vec::with_capacity(script.steps.len());

    for step in &script.steps {
        let at = clock.set(Timestamp(step.at));
        engine.tick();

        let op = step.action.name();
        let error = perform(&mut engine, &step.action).err().map(|e| e.to_string());
        if let Some(error) = &error {
            warn!(%at, op, "step refused: {error}");
        } else {
            debug!(%at, op, "step applied");
        }
        steps.push(StepOutcome { at, op, error });
    }

    for _ in 0..MAX_DRAIN_ROUNDS {
        let Some(at) = engine.next_deadline() else {
            break;
        };
        clock.set(at);
        engine.tick();
    }

    let report = ReplayReport {
        events: events.try_iter().collect(),
        steps,
        final_state: engine.current_state(),
        document: engine.document().clone(),
        stats: engine.stats().clone(),
        history: engine.history().iter().map(|s| s.ordinal()).collect(),
    };
    engine.shutdown();
    Ok(report)
}

/// Why a script step was refused.
#[derive(Debug, Error)]
pub enum StepError {
    /// The engine refused the operation.
    #[error(transparent)]
    Engine(#[from] SyncError),

    /// `complete` or `fail` ran with no conversion awaiting a report.
    #[error("no deferred conversion in flight")]
    NoDeferredConversion,

    /// `rollback` named an ordinal that is not in the history.
    #[error("no retained version with ordinal {0}")]
    UnknownOrdinal(u64),
}

impl Action {
    /// The script name of this operation.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Edit { .. } => "edit",
            Action::Sync => "sync",
            Action::FailNext { .. } => "fail_next",
            Action::DeferNext => "defer_next",
            Action::Complete { .. } => "complete",
            Action::Fail { .. } => "fail",
            Action::Rollback { .. } => "rollback",
            Action::Tick => "tick",
        }
    }
}

fn perform(engine: &mut SyncEngine<MockTransformer>, action: &Action) -> Result<(), StepError> {
    match action {
        Action::Edit { side, content } => {
            engine.handle_edit(*side, content.clone())?;
        }
        Action::Sync => {
            engine.trigger_sync()?;
        }
        Action::FailNext {
            code,
            message,
            times,
            retriable,
        } => {
            let mut error = TransformError::new(*code, message.clone());
            if let Some(retriable) = retriable {
                error = error.with_retriable(*retriable);
            }
            engine.transformer().fail_times(*times, error);
        }
        Action::DeferNext => engine.transformer().push(MockResponse::Defer),
        Action::Complete { model, output } => {
            let ticket = engine.in_flight().ok_or(StepError::NoDeferredConversion)?;
            let input = engine.document().side(ticket.origin).clone();
            let converted = Converted::new(
                model.clone().map(Into::into).unwrap_or_else(|| input.clone()),
                output.clone().map(Into::into).unwrap_or(input),
            );
            engine.handle_sync_success(ticket, converted)?;
        }
        Action::Fail { code, message } => {
            let ticket = engine.in_flight().ok_or(StepError::NoDeferredConversion)?;
            engine.handle_sync_failed(ticket, TransformError::new(*code, message.clone()))?;
        }
        Action::Rollback { ordinal } => {
            let id = match ordinal {
                Some(ordinal) => Some(
                    engine
                        .history()
                        .iter()
                        .find(|s| s.ordinal() == *ordinal)
                        .map(|s| s.id())
                        .ok_or(StepError::UnknownOrdinal(*ordinal))?,
                ),
                None => None,
            };
            engine.rollback_to_version(id)?;
        }
        Action::Tick => {}
    }
    Ok(())
}

#[derive(Serialize)]
struct Summary<'a> {
    final_state: SystemState,
    stats: &'a EngineStats,
    history: &'a [u64],
    refused_steps: usize,
}

fn summary(report: &ReplayReport) -> Summary<'_> {
    Summary {
        final_state: report.final_state,
        stats: &report.stats,
        history: &report.history,
        refused_steps: report.steps.iter().filter(|s| s.error.is_some()).count(),
    }
}

fn print_text_output(report: &ReplayReport) -> Result<(), Box<dyn std::error::Error>> {
    println!("{:>10}  {:>4}  {:<20} PAYLOAD", "TIME", "SEQ", "EVENT");
    println!("{}", "-".repeat(72));

    for record in &report.events {
        let payload = serde_json::to_value(&record.event)?;
        println!(
            "{:>10}  {:>4}  {:<20} {}",
            format!("{}ms", record.at.as_millis()),
            record.sequence,
            record.name,
            payload
        );
    }

    let refused: Vec<_> = report.steps.iter().filter(|s| s.error.is_some()).collect();
    if !refused.is_empty() {
        println!();
        println!("Refused steps:");
        for step in refused {
            println!(
                "  {} {}: {}",
                step.at,
                step.op,
                step.error.as_deref().unwrap_or_default()
            );
        }
    }

    println!();
    println!("Final state: {}", report.final_state);
    println!(
        "Side A: {}",
        String::from_utf8_lossy(report.document.side(Side::A))
    );
    println!(
        "Side B: {}",
        String::from_utf8_lossy(report.document.side(Side::B))
    );
    println!("Model:  {}", String::from_utf8_lossy(report.document.model()));
    println!(
        "Syncs: {}  Failures: {}  Retries: {}  Rollbacks: {}  Discarded: {}",
        report.stats.syncs_completed,
        report.stats.failures,
        report.stats.retries,
        report.stats.rollbacks,
        report.stats.discarded_completions
    );
    println!("Versions: {:?}", report.history);

    Ok(())
}
