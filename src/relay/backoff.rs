//! Bounded exponential backoff with jitter, shared by the relay pool's
//! socket-reconnect loop and its publish-retry loop (§4.R).
//!
//! Grounded on the host daemon's `relay::sleep_backoff` (2s -> 4s -> 8s ...
//! capped at 60s), generalized with a configurable base/cap per use site
//! since publish retries (base 250ms, cap 5s) and socket reconnects (base
//! 1s, cap 60s, matching the teacher) use different schedules.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base_ms,
            cap_ms,
            attempt: 0,
        }
    }

    /// Duration for the next attempt, with +/-20% jitter, and advance the
    /// internal attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base_ms.saturating_mul(1u64 << self.attempt.min(20));
        let capped = exp.min(self.cap_ms);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_frac = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis(((capped as f64) * jitter_frac) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_capped_and_monotonic_until_cap() {
        let mut b = Backoff::new(250, 5000);
        let mut prev = Duration::from_millis(0);
        for _ in 0..10 {
            let d = b.next_delay();
            assert!(d.as_millis() as u64 <= (5000f64 * 1.2) as u64);
            prev = d;
        }
        let _ = prev;
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut b = Backoff::new(250, 5000);
        for _ in 0..10 {
            b.next_delay();
        }
        b.reset();
        let d = b.next_delay();
        // first delay after reset should be roughly base_ms (+/-20%)
        assert!(d.as_millis() as u64 <= (250f64 * 1.2) as u64 + 1);
    }
}
