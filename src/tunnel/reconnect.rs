//! Connector redial schedule: exponential backoff with multiplicative jitter.

use std::time::Duration;

use rand::Rng;

/// `delay = min(max, base * 2^attempt) * jitter(0.5, 1.5)`.
///
/// The attempt counter only resets after a session stayed up for
/// `reset_after`, so a bridge that accepts and immediately drops connectors
/// still sees growing delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    reset_after: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, reset_after: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            reset_after,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay before the next dial; advances the attempt counter.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let jitter: f64 = rng.gen_range(0.5..1.5);
        let delay = self.ceiling(self.attempt).mul_f64(jitter);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Feed back how long the last session stayed ACTIVE.
    pub fn record_session(&mut self, active_for: Duration) {
        if active_for >= self.reset_after {
            self.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn backoff() -> Backoff {
        Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn ceiling_doubles_then_caps() {
        let b = backoff();
        let secs: Vec<u64> = (0..9).map(|a| b.ceiling(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(b.ceiling(200), Duration::from_secs(60));
    }

    #[test]
    fn delays_stay_within_jitter_bounds_and_grow() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut b = backoff();
        for attempt in 0..12 {
            let ceiling = b.ceiling(attempt);
            let delay = b.next_delay(&mut rng);
            assert!(delay >= ceiling.mul_f64(0.5), "attempt {attempt}: {delay:?}");
            assert!(delay <= ceiling.mul_f64(1.5), "attempt {attempt}: {delay:?}");
        }
        assert_eq!(b.attempt(), 12);
        // Lower bound of a later attempt exceeds the upper bound of an early one.
        assert!(b.ceiling(4).mul_f64(0.5) > b.ceiling(1).mul_f64(1.5));
    }

    #[test]
    fn short_sessions_do_not_reset() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut b = backoff();
        b.next_delay(&mut rng);
        b.next_delay(&mut rng);
        b.record_session(Duration::from_secs(5));
        assert_eq!(b.attempt(), 2);
        b.record_session(Duration::from_secs(60));
        assert_eq!(b.attempt(), 0);
    }
}
