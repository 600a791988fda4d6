//! Client-side send throttle.
//!
//! A sliding window over recent send times, pruned on every check. Nothing
//! is persisted; a restart resets the window.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over the limit. The oldest send in the window ages out after `retry_after`.
    Throttled { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone)]
pub struct RateGate {
    sent: VecDeque<Instant>,
    max_sends: usize,
    window: Duration,
}

impl RateGate {
    pub fn new(max_sends: usize, window: Duration) -> Self {
        Self {
            sent: VecDeque::with_capacity(max_sends),
            max_sends,
            window,
        }
    }

    /// Record a send attempt at `now` if the window has room.
    pub fn check(&mut self, now: Instant) -> RateDecision {
        while let Some(&oldest) = self.sent.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }

        if self.sent.len() < self.max_sends {
            self.sent.push_back(now);
            return RateDecision::Allowed;
        }

        let retry_after = self
            .sent
            .front()
            .map(|&oldest| self.window.saturating_sub(now.saturating_duration_since(oldest)))
            .unwrap_or(self.window);
        RateDecision::Throttled { retry_after }
    }

    /// Return the slot taken by the most recent allowed send. Used when the
    /// send was refused further down the pipeline.
    pub fn refund(&mut self) {
        self.sent.pop_back();
    }

    pub fn in_window(&self) -> usize {
        self.sent.len()
    }
}
