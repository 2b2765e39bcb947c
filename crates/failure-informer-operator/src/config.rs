//! Operator configuration

use crate::error::{OperatorError, Result};
use std::time::Duration;

/// Default delay before retrying after an optimistic-concurrency conflict
pub const DEFAULT_CONFLICT_REQUEUE_MS: u64 = 500;

/// Default delay before re-checking an owner that is not settled yet
pub const DEFAULT_SETTLE_REQUEUE_SECS: u64 = 10;

/// Base delay of the error backoff
pub const DEFAULT_ERROR_REQUEUE_SECS: u64 = 30;

/// Cap of the error backoff
pub const DEFAULT_MAX_ERROR_REQUEUE_SECS: u64 = 600;

/// How long the event loop remembers that an occurrence was correlated
pub const DEFAULT_LEDGER_RETENTION_SECS: u64 = 3600;

/// Typed operator settings handed to every controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches the whole cluster
    pub namespace: Option<String>,
    /// Delay for `Requeue` decisions
    pub conflict_requeue: Duration,
    /// Delay while waiting on dependent state
    pub settle_requeue: Duration,
    /// First error backoff step
    pub error_requeue: Duration,
    /// Largest error backoff step
    pub max_error_requeue: Duration,
    /// Correlation ledger retention
    pub ledger_retention: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            conflict_requeue: Duration::from_millis(DEFAULT_CONFLICT_REQUEUE_MS),
            settle_requeue: Duration::from_secs(DEFAULT_SETTLE_REQUEUE_SECS),
            error_requeue: Duration::from_secs(DEFAULT_ERROR_REQUEUE_SECS),
            max_error_requeue: Duration::from_secs(DEFAULT_MAX_ERROR_REQUEUE_SECS),
            ledger_retention: Duration::from_secs(DEFAULT_LEDGER_RETENTION_SECS),
        }
    }
}

impl OperatorConfig {
    /// Restrict the operator to one namespace. An empty string means all.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = if namespace.is_empty() {
            None
        } else {
            Some(namespace)
        };
        self
    }

    /// Reject settings that would make the controllers spin or stall
    pub fn validate(&self) -> Result<()> {
        if self.conflict_requeue.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "conflict requeue delay must be positive".to_string(),
            ));
        }
        if self.settle_requeue.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "settle requeue delay must be positive".to_string(),
            ));
        }
        if self.error_requeue.is_zero() || self.error_requeue > self.max_error_requeue {
            return Err(OperatorError::InvalidConfig(format!(
                "error requeue {}s must be positive and at most the maximum {}s",
                self.error_requeue.as_secs(),
                self.max_error_requeue.as_secs()
            )));
        }
        if self.ledger_retention.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "ledger retention must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Error backoff for the given retry: doubles from `error_requeue` up to
    /// `max_error_requeue`
    pub fn error_backoff(&self, retries: u32) -> Duration {
        let backoff = self.error_requeue * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
        backoff.min(self.max_error_requeue)
    }
}
