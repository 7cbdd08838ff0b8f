//! Timeout and bounded retry around a backend
//!
//! Every call runs under [`RetryPolicy::timeout`]; exceeding it yields
//! [`BackendError::Timeout`] and the spawned tool is killed. Transient
//! [`BackendError::Busy`] failures are retried with exponential backoff up to
//! [`RetryPolicy::attempts`] tries. Timeouts are never retried since the
//! outcome of the timed-out call is unknown.

use super::{BackendError, FirewallBackend};
use crate::core::rule::RuleDescriptor;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first
    pub attempts: u32,
    /// Delay before the first retry; doubled for each further retry
    pub base_delay: Duration,
    /// Bound on a single backend call
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX))
    }
}

/// Backend wrapper applying a [`RetryPolicy`] to every call
pub struct Resilient {
    inner: Box<dyn FirewallBackend>,
    policy: RetryPolicy,
}

impl Resilient {
    pub fn new(inner: Box<dyn FirewallBackend>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn call<T, F, Fut>(&self, what: &str, f: F) -> Result<T, BackendError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.policy.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.policy.timeout)),
            };

            match result {
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "{} {what} busy (attempt {attempt}/{attempts}), retrying in {}ms: {err}",
                        self.inner.name(),
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!("{} {what} failed after {attempt} attempt(s): {err}", self.inner.name());
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[async_trait]
impl FirewallBackend for Resilient {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn apply_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError> {
        self.call("apply", || self.inner.apply_rule(rule)).await
    }

    async fn remove_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError> {
        self.call("remove", || self.inner.remove_rule(rule)).await
    }

    async fn list_active(&self) -> Result<Vec<RuleDescriptor>, BackendError> {
        self.call("list", || self.inner.list_active()).await
    }

    async fn persist(&self) -> Result<(), BackendError> {
        self.call("persist", || self.inner.persist()).await
    }
}
