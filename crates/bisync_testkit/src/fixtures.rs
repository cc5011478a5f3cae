//! Test fixtures and engine helpers.
//!
//! Provides an engine driven by a manual clock, so tests decide exactly when
//! timers fire.

use bisync_engine::{
    Document, EngineConfig, EventRecord, ManualClock, MockTransformer, SyncEngine, Timestamp,
};
use std::sync::Arc;

/// Upper bound on timer rounds in [`Harness::run_until_idle`].
pub const MAX_IDLE_ROUNDS: usize = 1000;

/// The document every harness starts from.
pub fn sample_document() -> Document {
    Document::new("blocks v1", "text v1", "model v1")
}

/// The default configuration with deterministic jitter.
pub fn test_config() -> EngineConfig {
    EngineConfig::default().with_jitter_seed(0x5eed)
}

/// An engine on a manual clock with a scriptable transformer.
pub struct Harness {
    /// The engine under test.
    pub engine: SyncEngine<MockTransformer>,
    /// The clock the engine reads.
    pub clock: ManualClock,
}

impl Harness {
    /// Creates a harness with [`test_config`] and [`sample_document`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a harness with a custom configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn with_config(config: EngineConfig) -> Self {
        let clock = ManualClock::new();
        let engine = SyncEngine::with_clock(
            config,
            MockTransformer::new(),
            sample_document(),
            Arc::new(clock.clone()),
        )
        .expect("Failed to build engine");
        Self { engine, clock }
    }

    /// Current clock reading.
    pub fn now(&self) -> Timestamp {
        self.engine.now()
    }

    /// Moves time forward by `ms` and fires due timers.
    pub fn advance(&mut self, ms: u64) -> usize {
        self.clock.advance_ms(ms);
        self.engine.tick()
    }

    /// Jumps to `at` and fires due timers.
    pub fn advance_to(&mut self, at: Timestamp) -> usize {
        self.clock.set(at);
        self.engine.tick()
    }

    /// Jumps from deadline to deadline until no timer is armed.
    ///
    /// Returns the number of timers fired. Stops after
    /// [`MAX_IDLE_ROUNDS`] rounds.
    pub fn run_until_idle(&mut self) -> usize {
        let mut fired = 0;
        for _ in 0..MAX_IDLE_ROUNDS {
            let Some(at) = self.engine.next_deadline() else {
                break;
            };
            fired += self.advance_to(at);
        }
        fired
    }

    /// Every retained event, oldest first.
    pub fn events(&self) -> Vec<EventRecord> {
        self.engine.events().poll(0, usize::MAX)
    }

    /// Names of every retained event, oldest first.
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|r| r.name).collect()
    }

    /// Retained events as JSON lines, for transcript comparisons.
    pub fn transcript(&self) -> String {
        self.events()
            .iter()
            .filter_map(|r| serde_json::to_string(r).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for Harness {
    type Target = SyncEngine<MockTransformer>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl std::ops::DerefMut for Harness {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.engine
    }
}
