//! Per-surface frame counters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    /// Flips accepted by the backend
    pub submitted: u64,
    /// Flips confirmed by vsync
    pub presented: u64,
    /// Frames lost to backend rejection
    pub dropped: u64,
    /// Times the render path had to wait for a buffer or a pending flip
    pub backpressure_waits: u64,
    /// Longest single backpressure wait, in microseconds
    pub longest_wait_us: u64,
    pub resizes: u64,
    pub teardown_timeouts: u64,
}

impl FrameStats {
    pub(crate) fn record_wait(&mut self, waited: Duration) {
        self.backpressure_waits += 1;
        let us = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        self.longest_wait_us = self.longest_wait_us.max(us);
    }

    /// Flips submitted but not yet confirmed.
    pub fn outstanding(&self) -> u64 {
        self.submitted.saturating_sub(self.presented)
    }
}
