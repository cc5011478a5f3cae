//! Delay-and-coalesce scheduling.

use crate::clock::Timestamp;
use std::time::Duration;

/// A single-timer debounce.
///
/// Every [`trigger`](Debounce::trigger) cancels the pending timer and
/// reschedules it `delay` after the call; only the latest call's data
/// survives. The debounce fires once the caller observes, through
/// [`poll`](Debounce::poll), that the quiet period has elapsed.
#[derive(Debug, Clone)]
pub struct Debounce<T> {
    delay: Duration,
    deadline: Option<Timestamp>,
    data: Option<T>,
}

impl<T> Debounce<T> {
    /// Sets up a debounce with the given quiet period.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
            data: None,
        }
    }

    /// Returns the quiet period.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedules (or reschedules) the timer, replacing any pending data.
    pub fn trigger(&mut self, now: Timestamp, data: T) {
        self.deadline = Some(now + self.delay);
        self.data = Some(data);
    }

    /// Drops the pending timer and its data. Returns the data, if any.
    pub fn cancel(&mut self) -> Option<T> {
        self.deadline = None;
        self.data.take()
    }

    /// Returns true while a timer is scheduled.
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns when the pending timer fires.
    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    /// Fires the timer if its deadline has passed, yielding the latest data.
    pub fn poll(&mut self, now: Timestamp) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.data.take()
            }
            _ => None,
        }
    }
}
