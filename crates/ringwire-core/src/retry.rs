//! Category-driven retry with exponential backoff and jitter.
//!
//! Delay for attempt `n` (zero-based):
//!
//! ```text
//! min(initial × multiplier^n, max) × (1 ± jitter)
//! ```
//!
//! with jitter uniform in `[-j, +j]`. PROTOCOL and FATAL failures are
//! never retried; the four remaining categories are per-policy opt-ins.

use std::time::{Duration, Instant};

use crate::error::ErrorCategory;

/// Retry policy. Construct with [`RetryPolicy::new`] and adjust with the
/// builder methods; the defaults retry TRANSIENT, NETWORK, and RESOURCE
/// but not UNKNOWN.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
    /// Cap on the sum of delays across a sequence, when set.
    pub total_cap: Option<Duration>,
    pub retry_transient: bool,
    pub retry_network: bool,
    pub retry_resource: bool,
    pub retry_unknown: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            total_cap: None,
            retry_transient: true,
            retry_network: true,
            retry_resource: true,
            retry_unknown: false,
        }
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn multiplier(mut self, m: f64) -> Self {
        self.multiplier = m;
        self
    }

    pub fn jitter(mut self, j: f64) -> Self {
        self.jitter = j.clamp(0.0, 1.0);
        self
    }

    pub fn total_cap(mut self, d: Duration) -> Self {
        self.total_cap = Some(d);
        self
    }

    pub fn retry_unknown(mut self, yes: bool) -> Self {
        self.retry_unknown = yes;
        self
    }

    /// Whether this policy retries the given category at all.
    pub fn retries(&self, category: ErrorCategory) -> bool {
        match category {
            ErrorCategory::Transient => self.retry_transient,
            ErrorCategory::Network => self.retry_network,
            ErrorCategory::Resource => self.retry_resource,
            ErrorCategory::Unknown => self.retry_unknown,
            ErrorCategory::Protocol | ErrorCategory::Fatal => false,
        }
    }

    /// Jittered delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let spread = if self.jitter > 0.0 {
            // Uniform in [1 - j, 1 + j].
            1.0 - self.jitter + fastrand::f64() * 2.0 * self.jitter
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * spread)
    }
}

/// Mutable bookkeeping for one retry sequence.
#[derive(Debug)]
pub struct RetryContext {
    attempt: u32,
    started: Instant,
    total_delay: Duration,
    last_category: Option<ErrorCategory>,
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryContext {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            started: Instant::now(),
            total_delay: Duration::ZERO,
            last_category: None,
        }
    }

    /// Attempts recorded so far (failures, not tries).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn total_delay(&self) -> Duration {
        self.total_delay
    }

    pub fn last_category(&self) -> Option<ErrorCategory> {
        self.last_category
    }

    pub fn record_failure(&mut self, category: ErrorCategory) {
        self.attempt += 1;
        self.last_category = Some(category);
    }

    /// Consult the policy: may this sequence continue, and with what
    /// delay? `None` means give up.
    pub fn next_delay(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        let category = self.last_category?;
        if !policy.retries(category) {
            return None;
        }
        if self.attempt >= policy.max_attempts {
            return None;
        }
        let delay = policy.delay_for(self.attempt - 1);
        if let Some(cap) = policy.total_cap {
            if self.total_delay + delay > cap {
                return None;
            }
        }
        self.total_delay += delay;
        Some(delay)
    }

    pub fn should_retry(&self, policy: &RetryPolicy) -> bool {
        match self.last_category {
            Some(cat) => policy.retries(cat) && self.attempt < policy.max_attempts,
            None => false,
        }
    }

    /// Restart the sequence (e.g. after a successful reconnect).
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.started = Instant::now();
        self.total_delay = Duration::ZERO;
        self.last_category = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(100))
            .max_delay(Duration::from_secs(30))
            .jitter(0.2)
    }

    #[test]
    fn delays_stay_within_jitter_band() {
        let p = policy();
        for _ in 0..64 {
            let d0 = p.delay_for(0).as_secs_f64() * 1000.0;
            let d1 = p.delay_for(1).as_secs_f64() * 1000.0;
            assert!((80.0..=120.0).contains(&d0), "first delay {} out of band", d0);
            assert!((160.0..=240.0).contains(&d1), "second delay {} out of band", d1);
        }
    }

    #[test]
    fn delay_capped_at_max() {
        let p = RetryPolicy::new(20, Duration::from_millis(100))
            .max_delay(Duration::from_millis(500))
            .jitter(0.0);
        assert_eq!(p.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn two_network_failures_then_success() {
        let p = policy();
        let mut ctx = RetryContext::new();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let failed = attempts <= 2;
            if !failed {
                break;
            }
            ctx.record_failure(ErrorCategory::Network);
            let delay = ctx.next_delay(&p).expect("network failures are retriable");
            let ms = delay.as_secs_f64() * 1000.0;
            match ctx.attempt() {
                1 => assert!((80.0..=120.0).contains(&ms)),
                2 => assert!((160.0..=240.0).contains(&ms)),
                n => panic!("unexpected attempt {}", n),
            }
        }
        assert_eq!(attempts, 3);
    }

    #[test]
    fn protocol_and_fatal_never_retried() {
        let p = policy();
        let mut ctx = RetryContext::new();
        ctx.record_failure(ErrorCategory::Protocol);
        assert_eq!(ctx.next_delay(&p), None);
        ctx.record_failure(ErrorCategory::Fatal);
        assert_eq!(ctx.next_delay(&p), None);
    }

    #[test]
    fn unknown_is_policy_decided() {
        let deny = policy();
        let allow = policy().retry_unknown(true);
        let mut ctx = RetryContext::new();
        ctx.record_failure(ErrorCategory::Unknown);
        assert_eq!(ctx.next_delay(&deny), None);
        assert!(ctx.next_delay(&allow).is_some());
    }

    #[test]
    fn attempts_exhausted() {
        let p = RetryPolicy::new(2, Duration::from_millis(1)).jitter(0.0);
        let mut ctx = RetryContext::new();
        ctx.record_failure(ErrorCategory::Transient);
        assert!(ctx.next_delay(&p).is_some());
        ctx.record_failure(ErrorCategory::Transient);
        assert_eq!(ctx.next_delay(&p), None, "max_attempts reached");
    }

    #[test]
    fn total_cap_stops_sequence() {
        let p = RetryPolicy::new(100, Duration::from_millis(100))
            .jitter(0.0)
            .total_cap(Duration::from_millis(250));
        let mut ctx = RetryContext::new();
        ctx.record_failure(ErrorCategory::Transient);
        assert_eq!(ctx.next_delay(&p), Some(Duration::from_millis(100)));
        ctx.record_failure(ErrorCategory::Transient);
        // 100 + 200 would exceed the 250 ms cap.
        assert_eq!(ctx.next_delay(&p), None);
    }

    #[test]
    fn reset_restarts_sequence() {
        let p = policy();
        let mut ctx = RetryContext::new();
        ctx.record_failure(ErrorCategory::Network);
        ctx.next_delay(&p);
        ctx.reset();
        assert_eq!(ctx.attempt(), 0);
        assert_eq!(ctx.total_delay(), Duration::ZERO);
        assert!(ctx.last_category().is_none());
    }
}
