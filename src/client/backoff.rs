//! Reconnect backoff with adaptive modifiers.
//!
//! The base schedule is exponential with a configurable ceiling. On top of
//! it: a linear penalty once failures pile up, and a short probe cap when
//! the last success is old enough that the network may have recovered. The
//! final sleep never exceeds the hard ceiling.

use std::time::{Duration, Instant};

/// Smallest base sleep.
const BASE_MIN: Duration = Duration::from_millis(500);
/// Absolute cap on any computed sleep.
const HARD_CEILING: Duration = Duration::from_secs(600);
/// Consecutive failures before the linear penalty kicks in.
const FAILURE_THRESHOLD: u32 = 3;
/// Without a success for this long, probe the network instead of waiting.
const PROBE_WINDOW: Duration = Duration::from_secs(300);
/// Sleep used while probing for recovery.
const PROBE_SLEEP: Duration = Duration::from_secs(5);

/// Per-supervisor backoff state.
#[derive(Debug)]
pub struct Backoff {
    max_interval: Duration,
    attempt: u32,
    consecutive_failures: u32,
    last_success: Option<Instant>,
}

impl Backoff {
    pub fn new(max_interval: Duration) -> Self {
        Self {
            max_interval: max_interval.min(HARD_CEILING),
            attempt: 0,
            consecutive_failures: 0,
            last_success: None,
        }
    }

    /// Attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a connection that stayed up long enough to count.
    pub fn success(&mut self) {
        self.attempt = 0;
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());
    }

    /// Record a failed attempt.
    pub fn failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// The next sleep: exponential base plus the adaptive term.
    pub fn next_sleep(&self) -> Duration {
        let exp = self.attempt.saturating_sub(1).min(30);
        let base = BASE_MIN
            .saturating_mul(1u32 << exp.min(20))
            .min(self.max_interval);

        let mut adaptive = Duration::ZERO;
        if self.consecutive_failures > FAILURE_THRESHOLD {
            adaptive = base
                .saturating_mul(self.consecutive_failures / FAILURE_THRESHOLD)
                .min(HARD_CEILING);
        }
        // no success for a while: cap the wait and probe for recovery
        if let Some(last) = self.last_success {
            if last.elapsed() > PROBE_WINDOW {
                return base.saturating_add(adaptive).min(PROBE_SLEEP);
            }
        }

        base.saturating_add(adaptive).min(HARD_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let mut b = Backoff::new(Duration::from_secs(60));
        b.failure();
        let first = b.next_sleep();
        b.failure();
        let second = b.next_sleep();
        b.failure();
        let third = b.next_sleep();
        assert_eq!(first, Duration::from_millis(500));
        assert_eq!(second, Duration::from_secs(1));
        assert_eq!(third, Duration::from_secs(2));
    }

    #[test]
    fn test_base_capped_by_max_interval() {
        let mut b = Backoff::new(Duration::from_secs(4));
        for _ in 0..20 {
            b.failure();
        }
        // failures beyond the threshold add the linear term, but the total
        // never exceeds the hard ceiling
        assert!(b.next_sleep() <= HARD_CEILING);
        assert!(b.next_sleep() >= Duration::from_secs(4));
    }

    #[test]
    fn test_hard_ceiling() {
        let mut b = Backoff::new(HARD_CEILING);
        for _ in 0..100 {
            b.failure();
        }
        assert!(b.next_sleep() <= HARD_CEILING);
    }

    #[test]
    fn test_success_resets() {
        let mut b = Backoff::new(Duration::from_secs(60));
        for _ in 0..5 {
            b.failure();
        }
        assert!(b.attempt() == 5);
        b.success();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.consecutive_failures(), 0);
        b.failure();
        assert_eq!(b.next_sleep(), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_penalty_after_threshold() {
        let mut b = Backoff::new(Duration::from_secs(2));
        for _ in 0..6 {
            b.failure();
        }
        // base capped at 2s, penalty 2s * (6/3) = 4s
        assert_eq!(b.next_sleep(), Duration::from_secs(6));
    }
}
