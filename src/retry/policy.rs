use super::classify::SqlStateClassifier;
use crate::connection::config::RetrySettings;
use std::time::Duration;

/// Savepoint name used as the retry boundary unless the policy overrides it.
pub const DEFAULT_SAVEPOINT: &str = "retry_boundary";

/// Exponential backoff between attempts, capped at `max`.
///
/// The default is zero: attempts follow each other immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let cap = self.max.max(self.base);
        let mut delay = self.base;
        for _ in 1..retry {
            delay = delay.saturating_mul(2).min(cap);
            if delay == cap {
                break;
            }
        }
        delay
    }
}

/// How a [`RetryExecutor`](super::RetryExecutor) decides to replay work.
///
/// The default policy retries serialization conflicts forever with no delay;
/// only cancellation stops it.
#[derive(Debug, Clone)]
pub struct RetryPolicy<C = SqlStateClassifier> {
    /// Total attempts allowed, including the first one.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget measured from the start of the first attempt.
    pub max_elapsed: Option<Duration>,
    pub backoff: Backoff,
    /// Name of the retry-boundary savepoint.
    pub savepoint: String,
    pub classifier: C,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_classifier(SqlStateClassifier)
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C> RetryPolicy<C> {
    pub fn with_classifier(classifier: C) -> Self {
        Self {
            max_attempts: None,
            max_elapsed: None,
            backoff: Backoff::default(),
            savepoint: DEFAULT_SAVEPOINT.to_string(),
            classifier,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn max_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = Some(elapsed);
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Backoff::new(base, max);
        self
    }

    pub fn savepoint(mut self, name: impl Into<String>) -> Self {
        self.savepoint = name.into();
        self
    }

    /// Swap the classifier, keeping the budget.
    pub fn classifier<D>(self, classifier: D) -> RetryPolicy<D> {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_elapsed: self.max_elapsed,
            backoff: self.backoff,
            savepoint: self.savepoint,
            classifier,
        }
    }

    /// True when `attempts` completed attempts or `elapsed` exhaust the budget.
    pub fn is_exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.max_elapsed.is_some_and(|max| elapsed >= max)
    }

    pub fn is_bounded(&self) -> bool {
        self.max_attempts.is_some() || self.max_elapsed.is_some()
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        let mut policy = RetryPolicy::new().backoff(
            Duration::from_millis(settings.base_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
        );
        if let Some(attempts) = settings.max_attempts {
            policy = policy.max_attempts(attempts);
        }
        if let Some(ms) = settings.max_elapsed_ms {
            policy = policy.max_elapsed(Duration::from_millis(ms));
        }
        if let Some(name) = settings.savepoint {
            policy = policy.savepoint(name);
        }
        policy
    }
}
