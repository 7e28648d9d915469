use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often and how patiently to retry an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// `None` retries until aborted. The first attempt always runs, so
    /// `Some(0)` behaves like `Some(1)`; rig configs reject it.
    pub max_attempts: Option<u32>,
    /// Delay after the first failure; doubles after each further failure.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn unbounded(backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff,
            max_backoff: backoff,
        }
    }

    pub fn bounded(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff,
            max_backoff: backoff,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.backoff);
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

/// Serializable form of [`RetryPolicy`] used in rig configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Must be at least 1 when set.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: None,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        let backoff = Duration::from_millis(config.backoff_ms);
        Self {
            max_attempts: config.max_attempts,
            backoff,
            max_backoff: Duration::from_millis(config.max_backoff_ms).max(backoff),
        }
    }
}

/// How a [`retry`] loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
    Aborted { attempts: u32 },
}

impl RetryOutcome {
    pub fn attempts(self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts }
            | RetryOutcome::Exhausted { attempts }
            | RetryOutcome::Aborted { attempts } => attempts,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

/// Calls `attempt` (with the 1-based attempt number) until it returns `true`.
///
/// Between failures `wait` is handed the backoff delay; it should block for
/// that long and return `false` to abort the loop (e.g. on kill).
pub fn retry<A, W>(policy: &RetryPolicy, mut attempt: A, mut wait: W) -> RetryOutcome
where
    A: FnMut(u32) -> bool,
    W: FnMut(Duration) -> bool,
{
    let mut n = 0u32;
    loop {
        n += 1;
        if attempt(n) {
            return RetryOutcome::Succeeded { attempts: n };
        }
        if policy.max_attempts.is_some_and(|max| n >= max) {
            return RetryOutcome::Exhausted { attempts: n };
        }
        if !wait(policy.delay_after(n)) {
            return RetryOutcome::Aborted { attempts: n };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_failures() {
        let policy = RetryPolicy::unbounded(Duration::from_millis(10));
        let mut waits = Vec::new();
        let outcome = retry(&policy, |n| n == 3, |d| {
            waits.push(d);
            true
        });
        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 3 });
        assert_eq!(waits.len(), 2);
    }

    #[test]
    fn test_bounded_gives_up() {
        let policy = RetryPolicy::bounded(4, Duration::ZERO);
        let mut calls = 0;
        let outcome = retry(&policy, |_| {
            calls += 1;
            false
        }, |_| true);
        assert_eq!(outcome, RetryOutcome::Exhausted { attempts: 4 });
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::bounded(0, Duration::ZERO);
        let outcome = retry(&policy, |_| false, |_| panic!("no wait after the only attempt"));
        assert_eq!(outcome, RetryOutcome::Exhausted { attempts: 1 });
    }

    #[test]
    fn test_abort_while_waiting() {
        let policy = RetryPolicy::unbounded(Duration::ZERO);
        let mut waits = 0;
        let outcome = retry(&policy, |_| false, |_| {
            waits += 1;
            waits < 5
        });
        assert_eq!(outcome, RetryOutcome::Aborted { attempts: 5 });
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::unbounded(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(350));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(40), Duration::from_millis(350));
    }

    #[test]
    fn test_config_conversion() {
        let policy: RetryPolicy = RetryConfig {
            backoff_ms: 200,
            max_backoff_ms: 50,
            max_attempts: Some(3),
        }
        .into();
        assert_eq!(policy.max_attempts, Some(3));
        // The cap never undercuts the initial backoff.
        assert_eq!(policy.max_backoff, Duration::from_millis(200));
    }
}
