//! Fixed-interval retry used by the coordination loops.

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use log::info;

/// Sleep between attempts; attempts are never abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Logs why we are waiting, then sleeps for one interval.
    pub fn pause(&self, context: &str, reason: &dyn Display) {
        info!(
            "{}: {}; retrying in {} ms",
            context,
            reason,
            self.interval.as_millis()
        );
        thread::sleep(self.interval);
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}
