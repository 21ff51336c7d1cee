//! Reconnection backoff: exponential with full jitter.
//!
//! The delay for attempt `n` is drawn uniformly from `[0, min(cap, 1s * 2^n)]`.
//! Reset on a successful handshake; attempts are unbounded.

use std::time::Duration;

use rand::Rng;

/// Initial backoff ceiling.
const INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Maximum backoff ceiling.
const MAX_DELAY: Duration = Duration::from_secs(60);

pub struct Backoff {
    attempt: u32,
    initial: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            initial: INITIAL_DELAY,
            cap: MAX_DELAY,
        }
    }

    /// The ceiling for a given attempt number, before jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let raw = self.initial.saturating_mul(factor.min(u32::MAX as u64) as u32);
        raw.min(self.cap)
    }

    /// Attempts completed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Draw the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let millis = ceiling.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Reset after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_then_caps() {
        let backoff = Backoff::new();
        assert_eq!(backoff.ceiling(0), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(1), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(2), Duration::from_secs(4));
        assert_eq!(backoff.ceiling(5), Duration::from_secs(32));
        assert_eq!(backoff.ceiling(6), Duration::from_secs(60));
        assert_eq!(backoff.ceiling(30), Duration::from_secs(60));
    }

    #[test]
    fn jittered_delay_stays_within_ceiling() {
        let mut backoff = Backoff::new();
        for attempt in 0..10 {
            let ceiling = backoff.ceiling(attempt);
            let delay = backoff.next_delay();
            assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
        }
        assert_eq!(backoff.attempt(), 10);
    }

    #[test]
    fn reset_restarts_the_progression() {
        let mut backoff = Backoff::new();
        for _ in 0..8 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }
}
