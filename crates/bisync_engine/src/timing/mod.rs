//! Timing controller.
//!
//! Composes the primitives that decide when things happen:
//! - [`Debounce`]: whether and when a sync attempt starts
//! - [`Throttle`]: rate-limited interim feedback
//! - [`ReplacementSlot`]: the edit that arrived while a conversion was in flight
//! - [`Deadline`]s for the conversion timeout and the retry backoff
//!
//! Nothing here runs on its own. The owner polls with the current time and
//! acts on whatever fired.

mod debounce;
mod slot;
mod throttle;

pub use debounce::Debounce;
pub use slot::ReplacementSlot;
pub use throttle::{Throttle, ThrottleMode};

use crate::clock::Timestamp;
use crate::config::TimingConfig;
use crate::document::PendingEdit;
use crate::state::Side;

/// A one-shot timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Timestamp>,
}

impl Deadline {
    /// Creates a disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) the timer.
    pub fn arm(&mut self, at: Timestamp) {
        self.at = Some(at);
    }

    /// Disarms the timer. Returns true if it was armed.
    pub fn cancel(&mut self) -> bool {
        self.at.take().is_some()
    }

    /// Returns true if the timer is armed.
    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    /// Returns when the timer fires.
    pub fn at(&self) -> Option<Timestamp> {
        self.at
    }

    /// Disarms and returns true if the deadline has passed.
    pub fn fire(&mut self, now: Timestamp) -> bool {
        match self.at {
            Some(at) if now >= at => {
                self.at = None;
                true
            }
            _ => false,
        }
    }
}

/// Which timer fired during a [`TimingController::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerFired {
    /// The in-flight conversion passed its hard deadline.
    SyncTimeout,
    /// The backoff before the next conversion attempt elapsed.
    RetryDue,
    /// The edit quiet period elapsed for this side.
    Debounced(Side),
    /// A trailing interim feedback execution for this side.
    Feedback(Side),
}

/// All engine timers, owned by one engine.
#[derive(Debug)]
pub struct TimingController {
    debounce: Debounce<Side>,
    throttle: Throttle<Side>,
    slot: ReplacementSlot<PendingEdit>,
    timeout: Deadline,
    retry: Deadline,
}

impl TimingController {
    /// Creates a controller from its configuration.
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            debounce: Debounce::new(config.debounce),
            throttle: Throttle::new(config.throttle_interval, config.throttle_mode),
            slot: ReplacementSlot::new(),
            timeout: Deadline::new(),
            retry: Deadline::new(),
        }
    }

    /// The edit debounce.
    pub fn debounce(&self) -> &Debounce<Side> {
        &self.debounce
    }

    /// Arms the debounce for an edit on `side`.
    pub fn schedule_sync(&mut self, now: Timestamp, side: Side) {
        self.debounce.trigger(now, side);
    }

    /// Cancels a scheduled sync.
    pub fn cancel_sync(&mut self) {
        self.debounce.cancel();
    }

    /// Offers interim feedback for `side`; returns it if it should run now.
    pub fn feedback(&mut self, now: Timestamp, side: Side) -> Option<Side> {
        self.throttle.call(now, side)
    }

    /// The buffered edit slot.
    pub fn slot(&self) -> &ReplacementSlot<PendingEdit> {
        &self.slot
    }

    /// Mutable access to the buffered edit slot.
    pub fn slot_mut(&mut self) -> &mut ReplacementSlot<PendingEdit> {
        &mut self.slot
    }

    /// Arms the conversion timeout.
    pub fn arm_timeout(&mut self, at: Timestamp) {
        self.timeout.arm(at);
    }

    /// The conversion timeout.
    pub fn timeout(&self) -> Deadline {
        self.timeout
    }

    /// Arms the retry backoff.
    pub fn arm_retry(&mut self, at: Timestamp) {
        self.retry.arm(at);
    }

    /// Disarms the retry backoff.
    pub fn clear_retry(&mut self) {
        self.retry.cancel();
    }

    /// The retry backoff.
    pub fn retry(&self) -> Deadline {
        self.retry
    }

    /// Fires the most urgent due timer.
    ///
    /// Order matters: a timeout beats a retry, which beats a new debounced
    /// sync, and feedback comes last because it never changes state.
    pub fn poll(&mut self, now: Timestamp) -> Option<TimerFired> {
        if self.timeout.fire(now) {
            return Some(TimerFired::SyncTimeout);
        }
        if self.retry.fire(now) {
            return Some(TimerFired::RetryDue);
        }
        if let Some(side) = self.debounce.poll(now) {
            return Some(TimerFired::Debounced(side));
        }
        self.throttle.poll(now).map(TimerFired::Feedback)
    }

    /// Returns the earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        [
            self.timeout.at(),
            self.retry.at(),
            self.debounce.deadline(),
            self.throttle.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Stops everything tied to the in-flight conversion.
    pub fn cancel_conversion(&mut self) {
        self.timeout.cancel();
        self.retry.cancel();
    }

    /// Cancels every timer and empties the slot.
    pub fn cancel_all(&mut self) {
        self.debounce.cancel();
        self.throttle.cancel();
        self.slot.clear();
        self.timeout.cancel();
        self.retry.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn controller() -> TimingController {
        TimingController::new(&TimingConfig::default())
    }

    #[test]
    fn deadline_fires_once() {
        let mut deadline = Deadline::new();
        deadline.arm(Timestamp(10));
        assert!(!deadline.fire(Timestamp(9)));
        assert!(deadline.fire(Timestamp(10)));
        assert!(!deadline.fire(Timestamp(11)));
    }

    #[test]
    fn poll_prefers_timeout_over_other_timers() {
        let mut timing = controller();
        timing.schedule_sync(Timestamp(0), Side::A);
        timing.arm_retry(Timestamp(100));
        timing.arm_timeout(Timestamp(100));

        let now = Timestamp(1000);
        assert_eq!(timing.poll(now), Some(TimerFired::SyncTimeout));
        assert_eq!(timing.poll(now), Some(TimerFired::RetryDue));
        assert_eq!(timing.poll(now), Some(TimerFired::Debounced(Side::A)));
        assert_eq!(timing.poll(now), None);
    }

    #[test]
    fn next_deadline_is_earliest() {
        let mut timing = controller();
        assert_eq!(timing.next_deadline(), None);

        timing.schedule_sync(Timestamp(0), Side::B);
        timing.arm_timeout(Timestamp(5000));
        assert_eq!(timing.next_deadline(), Some(Timestamp(300)));

        timing.cancel_sync();
        assert_eq!(timing.next_deadline(), Some(Timestamp(5000)));
    }

    #[test]
    fn feedback_is_throttled() {
        let mut timing = controller();
        assert_eq!(timing.feedback(Timestamp(0), Side::A), Some(Side::A));
        assert_eq!(timing.feedback(Timestamp(20), Side::A), None);
        assert_eq!(timing.poll(Timestamp(100)), Some(TimerFired::Feedback(Side::A)));
    }

    #[test]
    fn cancel_all_clears_slot_and_timers() {
        let mut timing = controller();
        timing.schedule_sync(Timestamp(0), Side::A);
        timing.arm_timeout(Timestamp(10));
        timing.slot_mut().set(PendingEdit {
            side: Side::A,
            content: Bytes::from_static(b"x"),
            timestamp: Timestamp(0),
            is_override: false,
        });

        timing.cancel_all();
        assert!(!timing.slot().has());
        assert_eq!(timing.next_deadline(), None);
        assert_eq!(timing.poll(Timestamp(Duration::from_secs(60).as_millis() as u64)), None);
    }
}
