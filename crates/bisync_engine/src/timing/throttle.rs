//! Rate-limited execution for interim, non-authoritative feedback.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When a throttle executes relative to its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleMode {
    /// Execute the first call immediately, drop the rest of the window.
    Leading,
    /// Hold calls and execute the latest one when the window closes.
    Trailing,
    /// Execute the first call immediately and the latest later call when the
    /// window closes.
    Both,
}

impl ThrottleMode {
    fn leading(self) -> bool {
        matches!(self, ThrottleMode::Leading | ThrottleMode::Both)
    }

    fn trailing(self) -> bool {
        matches!(self, ThrottleMode::Trailing | ThrottleMode::Both)
    }
}

/// A throttle over values of type `T`.
///
/// [`call`](Throttle::call) returns the value when it should execute
/// immediately; held trailing values come out of [`poll`](Throttle::poll)
/// once the window closes. A trailing execution opens a new window, so two
/// executions are never closer than `interval`.
#[derive(Debug, Clone)]
pub struct Throttle<T> {
    interval: Duration,
    mode: ThrottleMode,
    window_end: Option<Timestamp>,
    trailing: Option<T>,
}

impl<T> Throttle<T> {
    /// Creates a throttle.
    pub fn new(interval: Duration, mode: ThrottleMode) -> Self {
        Self {
            interval,
            mode,
            window_end: None,
            trailing: None,
        }
    }

    /// Returns the throttle mode.
    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    /// Offers a value. Returns it back if it should execute now.
    pub fn call(&mut self, now: Timestamp, data: T) -> Option<T> {
        let in_window = self.window_end.is_some_and(|end| now < end);

        if in_window {
            if self.mode.trailing() {
                self.trailing = Some(data);
            }
            return None;
        }

        self.window_end = Some(now + self.interval);
        if self.mode.leading() {
            self.trailing = None;
            Some(data)
        } else {
            self.trailing = Some(data);
            None
        }
    }

    /// Returns the held trailing value if its window has closed.
    pub fn poll(&mut self, now: Timestamp) -> Option<T> {
        let end = self.window_end?;
        if now < end {
            return None;
        }

        match self.trailing.take() {
            Some(data) => {
                self.window_end = Some(now + self.interval);
                Some(data)
            }
            None => {
                self.window_end = None;
                None
            }
        }
    }

    /// Returns when a held trailing value becomes due.
    pub fn deadline(&self) -> Option<Timestamp> {
        self.trailing.as_ref().and(self.window_end)
    }

    /// Returns true if a trailing execution is held.
    pub fn is_pending(&self) -> bool {
        self.trailing.is_some()
    }

    /// Drops any held value and closes the window.
    pub fn cancel(&mut self) {
        self.trailing = None;
        self.window_end = None;
    }
}
