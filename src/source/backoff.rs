//! Retry delays for re-opening a dropped source

use rand::Rng;
use std::time::Duration;

/// Doubling step with "equal jitter": each delay is half the current step
/// plus a random share of the other half, so it lands in `[step/2, step]`.
pub struct Backoff {
    base: Duration,
    max: Duration,
    step: Duration,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        let base = Duration::from_millis(base_ms.max(1));
        let max = Duration::from_millis(max_ms).max(base);
        Self { base, max, step: base }
    }

    pub fn next_delay(&mut self) -> Duration {
        let step = self.step.min(self.max);
        let floor = step / 2;
        let spread = (step - floor).as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=spread);
        self.step = step.saturating_mul(2).min(self.max);
        floor + Duration::from_millis(jitter)
    }

    /// Back to the base step once data flows again
    pub fn reset(&mut self) {
        self.step = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(d: Duration) -> u128 {
        d.as_millis()
    }

    #[test]
    fn test_steps_double_within_jitter_window() {
        let mut backoff = Backoff::new(100, 10_000);
        for step in [100u128, 200, 400, 800] {
            let delay = ms(backoff.next_delay());
            assert!(delay >= step / 2 && delay <= step, "{} outside [{}, {}]", delay, step / 2, step);
        }
    }

    #[test]
    fn test_cap_holds_and_reset_restarts() {
        let mut backoff = Backoff::new(100, 500);
        for _ in 0..70 {
            assert!(ms(backoff.next_delay()) <= 500);
        }
        backoff.reset();
        assert!(ms(backoff.next_delay()) <= 100);
    }

    #[test]
    fn test_cap_below_base_uses_base() {
        let mut backoff = Backoff::new(300, 10);
        let delay = ms(backoff.next_delay());
        assert!((150..=300).contains(&delay));
    }
}
