//! Retry policies with exponential backoff and jitter.
//!
//! A node may carry several policies; when its action fails, the first policy
//! whose predicate matches the error governs that retry. Interrupt control
//! signals are never retried.

use crate::error::GraphError;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether a policy applies to a given error.
#[derive(Clone)]
pub enum RetryOn {
    /// Retry any non-interrupt failure.
    Always,
    /// Retry when the error's display text contains the substring.
    MessageContains(String),
    /// Arbitrary predicate over the error.
    Predicate(Arc<dyn Fn(&GraphError) -> bool + Send + Sync>),
}

impl RetryOn {
    pub fn matches(&self, error: &GraphError) -> bool {
        if error.is_interrupt() {
            return false;
        }
        match self {
            RetryOn::Always => true,
            RetryOn::MessageContains(needle) => error.to_string().contains(needle),
            RetryOn::Predicate(pred) => pred(error),
        }
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryOn::Always => write!(f, "Always"),
            RetryOn::MessageContains(s) => write!(f, "MessageContains({:?})", s),
            RetryOn::Predicate(_) => write!(f, "Predicate(<fn>)"),
        }
    }
}

/// Backoff configuration for retrying a failed node action.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first.
    pub max_attempts: usize,
    /// Initial interval between attempts, in seconds.
    pub initial_interval: f64,
    /// Multiplier applied to the interval after each attempt.
    pub backoff_factor: f64,
    /// Interval cap, in seconds.
    pub max_interval: f64,
    /// Multiply each delay by a uniform factor in [0.5, 1.5].
    pub jitter: bool,
    /// Which errors this policy covers.
    pub retry_on: RetryOn,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
            retry_on: RetryOn::Always,
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Delay before the retry following `attempt` (0-indexed failed attempt):
    /// `min(initial * factor^attempt, max)`, jittered when enabled.
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let base = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_interval);
        let final_delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(final_delay.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Pick the policy governing a retry for `error`: first match wins.
pub fn select_policy<'a>(policies: &'a [RetryPolicy], error: &GraphError) -> Option<&'a RetryPolicy> {
    policies.iter().find(|p| p.retry_on.matches(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::Interrupt;

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, 0.5);
        assert_eq!(policy.backoff_factor, 2.0);
        assert_eq!(policy.max_interval, 128.0);
        assert!(policy.jitter);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(5.0)
            .with_jitter(false);

        assert_eq!(policy.backoff_delay(0).as_secs_f64(), 1.0);
        assert_eq!(policy.backoff_delay(1).as_secs_f64(), 2.0);
        assert_eq!(policy.backoff_delay(2).as_secs_f64(), 4.0);
        assert_eq!(policy.backoff_delay(3).as_secs_f64(), 5.0);
    }

    #[test]
    fn jitter_stays_in_half_to_three_halves() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_jitter(true);

        let base = 4.0;
        for _ in 0..50 {
            let d = policy.backoff_delay(2).as_secs_f64();
            assert!((base * 0.5..=base * 1.5).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn first_matching_policy_governs() {
        let policies = vec![
            RetryPolicy::new(5).with_retry_on(RetryOn::MessageContains("timeout".into())),
            RetryPolicy::new(2).with_retry_on(RetryOn::Always),
        ];

        let timeout_err = GraphError::Execution("upstream timeout".into());
        assert_eq!(select_policy(&policies, &timeout_err).unwrap().max_attempts, 5);

        let other_err = GraphError::Execution("bad payload".into());
        assert_eq!(select_policy(&policies, &other_err).unwrap().max_attempts, 2);
    }

    #[test]
    fn interrupts_never_match() {
        let policies = vec![RetryPolicy::new(3).with_retry_on(RetryOn::Always)];
        let signal = GraphError::Interrupt(Interrupt::new("t:0", serde_json::json!(null)));
        assert!(select_policy(&policies, &signal).is_none());
    }

    #[test]
    fn predicate_policy() {
        let policy = RetryPolicy::new(3).with_retry_on(RetryOn::Predicate(Arc::new(|e| {
            matches!(e, GraphError::Execution(_))
        })));
        assert!(policy.retry_on.matches(&GraphError::Execution("x".into())));
        assert!(!policy.retry_on.matches(&GraphError::Validation("x".into())));
    }
}
