//! Structured latency tracking for wallet round trips and payment middleware
//! hooks (§10.1).

use std::time::Instant;
use tracing::{debug, info};

/// Track latency of an async operation and emit a structured log event.
pub struct LatencyTracker {
    operation: String,
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency for an operation.
    ///
    /// Examples:
    ///   let tracker = LatencyTracker::start("wallet.make_invoice");
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            start: Instant::now(),
        }
    }

    /// Finish tracking and emit a log event with the elapsed time.
    pub fn finish(self) {
        let elapsed_ms = self.start.elapsed().as_millis();
        if elapsed_ms > 1000 {
            info!(operation = %self.operation, elapsed_ms, "slow operation");
        } else {
            debug!(operation = %self.operation, elapsed_ms, "operation complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_does_not_panic_on_fast_or_slow_paths() {
        LatencyTracker::start("test.op").finish();
    }
}
