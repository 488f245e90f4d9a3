//! Composable task wrappers
//!
//! ```ignore
//! task(CreateCurationTicket)
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retry(RetryPolicy::from(&config.ticketing.retry))
//!     .do_not_repeat("curation_ticket")
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::errors::TaskError;
use super::task::{Outcome, Task, TaskContext};
use crate::config::RetryConfig;

/* ===================== do_not_repeat ===================== */

/// Runs the inner task at most once per object lifetime.
///
/// The key is recorded in `extra_data.done` once the inner task succeeds, so
/// restarts and replays skip it.
pub struct DoNotRepeat<T> {
    inner: T,
    key: String,
}

#[async_trait]
impl<T: Task> Task for DoNotRepeat<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        if ctx.obj.extra_data.done.contains(&self.key) {
            debug!(workflow_id = %ctx.obj.id, key = %self.key, "do_not_repeat_skipped");
            return Ok(Outcome::Continue);
        }
        let outcome = self.inner.execute(ctx).await?;
        ctx.obj.extra_data.done.insert(self.key.clone());
        Ok(outcome)
    }
}

/* ===================== with_timeout ===================== */

pub struct WithTimeout<T> {
    inner: T,
    timeout: Duration,
}

#[async_trait]
impl<T: Task> Task for WithTimeout<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        match tokio::time::timeout(self.timeout, self.inner.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

/* ===================== with_retry ===================== */

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

/// Retries retryable failures (transient, timeout) with bounded exponential backoff.
pub struct WithRetry<T> {
    inner: T,
    policy: RetryPolicy,
}

#[async_trait]
impl<T: Task> Task for WithRetry<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let mut attempt = 1;
        loop {
            match self.inner.execute(ctx).await {
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        workflow_id = %ctx.obj.id,
                        task = self.inner.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "task_retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/* ===================== logged ===================== */

/// Logs the object's record identifiers around the inner task.
pub struct Logged<T> {
    inner: T,
}

#[async_trait]
impl<T: Task> Task for Logged<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Outcome, TaskError> {
        let before = ctx.obj.extra_data.clone();
        let result = self.inner.execute(ctx).await;
        match &result {
            Ok(outcome) => debug!(
                workflow_id = %ctx.obj.id,
                task = self.inner.name(),
                outcome = outcome.label(),
                extra_data_changed = before != ctx.obj.extra_data,
                "task_logged"
            ),
            Err(err) => debug!(
                workflow_id = %ctx.obj.id,
                task = self.inner.name(),
                error = %err,
                "task_logged"
            ),
        }
        result
    }
}

/* ===================== Extension trait ===================== */

pub trait TaskExt: Task + Sized {
    fn do_not_repeat(self, key: impl Into<String>) -> DoNotRepeat<Self> {
        DoNotRepeat {
            inner: self,
            key: key.into(),
        }
    }

    fn with_timeout(self, timeout: Duration) -> WithTimeout<Self> {
        WithTimeout {
            inner: self,
            timeout,
        }
    }

    fn with_retry(self, policy: RetryPolicy) -> WithRetry<Self> {
        WithRetry {
            inner: self,
            policy,
        }
    }

    fn logged(self) -> Logged<Self> {
        Logged { inner: self }
    }
}

impl<T: Task + Sized> TaskExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
        assert_eq!(policy.delay_after(4), Duration::from_millis(300));
    }

    #[test]
    fn test_policy_from_config_never_zero_attempts() {
        let config = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from(&config).max_attempts, 1);
    }
}
