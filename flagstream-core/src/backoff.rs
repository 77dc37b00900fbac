use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Doubles the delay on every retry, capped at a maximum.
#[derive(Debug, Clone, Copy)]
pub struct BackoffStrategy {
    max_delay: Duration,
}

impl BackoffStrategy {
    pub fn new(max_delay: Duration) -> Self {
        BackoffStrategy { max_delay }
    }

    fn apply(&self, base: Duration, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        base.checked_mul(factor).unwrap_or(self.max_delay).min(self.max_delay)
    }
}

/// Subtracts a pseudo-random fraction (up to `ratio`) from each delay so
/// that a fleet of clients does not reconnect in lockstep.
#[derive(Debug)]
pub struct JitterStrategy {
    ratio: f64,
    rng: StdRng,
}

impl JitterStrategy {
    pub fn new(ratio: f64) -> Self {
        JitterStrategy { ratio, rng: StdRng::from_os_rng() }
    }

    /// Fixed seed, for deterministic delays in tests.
    pub fn with_seed(ratio: f64, seed: u64) -> Self {
        JitterStrategy { ratio, rng: StdRng::seed_from_u64(seed) }
    }

    fn apply(&mut self, delay: Duration) -> Duration {
        let jitter = self.rng.random::<f64>() * self.ratio * delay.as_secs_f64();
        delay.saturating_sub(Duration::from_secs_f64(jitter))
    }
}

/// Reconnection delay policy for long-lived connections.
///
/// The connection is either "good" or "bad"; asking for the next retry
/// delay implies it just went bad. If it had been good for at least
/// `reset_interval` beforehand, the backoff starts over from the base.
pub struct RetryDelay {
    base_delay: Duration,
    reset_interval: Option<Duration>,
    backoff: Option<BackoffStrategy>,
    jitter: Option<JitterStrategy>,
    retry_count: u32,
    good_since: Option<Instant>,
}

impl RetryDelay {
    pub fn new(
        base_delay: Duration,
        reset_interval: Option<Duration>,
        backoff: Option<BackoffStrategy>,
        jitter: Option<JitterStrategy>,
    ) -> Self {
        RetryDelay {
            base_delay,
            reset_interval,
            backoff,
            jitter,
            retry_count: 0,
            good_since: None,
        }
    }

    /// The standard policy used by the streaming data sources: exponential
    /// backoff to `max_delay`, 50% jitter, counter reset after
    /// `reset_interval` of healthy connection.
    pub fn standard(
        base_delay: Duration,
        max_delay: Duration,
        jitter_ratio: f64,
        reset_interval: Duration,
    ) -> Self {
        RetryDelay::new(
            base_delay,
            Some(reset_interval),
            Some(BackoffStrategy::new(max_delay)),
            Some(JitterStrategy::new(jitter_ratio)),
        )
    }

    /// Computes the delay to wait before the next connection attempt and
    /// transitions the state to "bad".
    pub fn next_retry_delay(&mut self, now: Instant) -> Duration {
        if let (Some(good_since), Some(reset_interval)) = (self.good_since, self.reset_interval)
            && now.duration_since(good_since) >= reset_interval
        {
            self.retry_count = 0;
        }
        self.good_since = None;

        let mut delay = self.base_delay;
        if let Some(backoff) = &self.backoff {
            delay = backoff.apply(delay, self.retry_count);
        }
        self.retry_count += 1;
        if let Some(jitter) = &mut self.jitter {
            delay = jitter.apply(delay);
        }
        delay
    }

    /// Marks the connection healthy as of `time`.
    pub fn set_good_since(&mut self, time: Instant) {
        self.good_since = Some(time);
    }

    /// Replaces the base delay (server retry hint) and restarts the backoff.
    pub fn set_base_delay(&mut self, base_delay: Duration) {
        self.base_delay = base_delay;
        self.retry_count = 0;
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryDelay")
            .field("base_delay", &self.base_delay)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);

    fn without_jitter() -> RetryDelay {
        RetryDelay::new(
            BASE,
            Some(Duration::from_secs(60)),
            Some(BackoffStrategy::new(MAX)),
            None,
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut rd = without_jitter();
        let now = Instant::now();
        assert_eq!(rd.next_retry_delay(now), Duration::from_secs(1));
        assert_eq!(rd.next_retry_delay(now), Duration::from_secs(2));
        assert_eq!(rd.next_retry_delay(now), Duration::from_secs(4));
        assert_eq!(rd.next_retry_delay(now), Duration::from_secs(8));
        assert_eq!(rd.next_retry_delay(now), Duration::from_secs(16));
        assert_eq!(rd.next_retry_delay(now), Duration::from_secs(30));
        assert_eq!(rd.next_retry_delay(now), Duration::from_secs(30));
    }

    #[test]
    fn good_since_resets_after_interval() {
        let mut rd = without_jitter();
        let start = Instant::now();
        rd.next_retry_delay(start);
        rd.next_retry_delay(start);

        rd.set_good_since(start);
        // not yet past the reset interval: backoff continues
        assert_eq!(
            rd.next_retry_delay(start + Duration::from_secs(30)),
            Duration::from_secs(4)
        );

        rd.set_good_since(start);
        // a full minute of healthy connection resets the counter
        assert_eq!(
            rd.next_retry_delay(start + Duration::from_secs(60)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn jitter_subtracts_bounded_fraction() {
        let mut rd = RetryDelay::new(
            BASE,
            None,
            Some(BackoffStrategy::new(MAX)),
            Some(JitterStrategy::with_seed(0.5, 42)),
        );
        for expected_full in [1u64, 2, 4, 8] {
            let full = Duration::from_secs(expected_full);
            let delay = rd.next_retry_delay(Instant::now());
            assert!(delay <= full, "jittered {delay:?} exceeds {full:?}");
            assert!(delay >= full / 2, "jittered {delay:?} below half of {full:?}");
        }
    }

    #[test]
    fn deterministic_with_seed() {
        let mut a = RetryDelay::new(
            BASE,
            None,
            Some(BackoffStrategy::new(MAX)),
            Some(JitterStrategy::with_seed(0.5, 7)),
        );
        let mut b = RetryDelay::new(
            BASE,
            None,
            Some(BackoffStrategy::new(MAX)),
            Some(JitterStrategy::with_seed(0.5, 7)),
        );
        let now = Instant::now();
        for _ in 0..5 {
            assert_eq!(a.next_retry_delay(now), b.next_retry_delay(now));
        }
    }

    #[test]
    fn set_base_delay_restarts_backoff() {
        let mut rd = without_jitter();
        let now = Instant::now();
        rd.next_retry_delay(now);
        rd.next_retry_delay(now);
        rd.set_base_delay(Duration::from_secs(3));
        assert_eq!(rd.next_retry_delay(now), Duration::from_secs(3));
        assert_eq!(rd.next_retry_delay(now), Duration::from_secs(6));
    }
}
