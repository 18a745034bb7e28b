use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    // not found
    #[error("queue item not found")]
    QueueItemNotFound,
    #[error("partition not found")]
    PartitionNotFound,
    #[error("partition garbage collected")]
    PartitionGarbageCollected,
    #[error("shadow partition not found")]
    ShadowPartitionNotFound,
    #[error("backlog not found")]
    BacklogNotFound,
    #[error("backlog garbage collected")]
    BacklogGarbageCollected,

    // contention
    #[error("queue item already leased")]
    QueueItemAlreadyLeased,
    #[error("partition already leased")]
    PartitionAlreadyLeased,
    #[error("shadow partition already leased")]
    ShadowPartitionAlreadyLeased,
    #[error("config lease {0} already held")]
    ConfigAlreadyLeased(String),
    #[error("backlog already leased for normalization")]
    BacklogAlreadyLeasedForNormalization,

    // limits
    #[error("at partition concurrency limit")]
    PartitionConcurrencyLimit,
    #[error("at account concurrency limit")]
    AccountConcurrencyLimit,
    #[error("at system concurrency limit")]
    SystemConcurrencyLimit,
    #[error("at custom concurrency limit for key {0}")]
    CustomKeyConcurrencyLimit(String),
    #[error("throttled on key {key}")]
    Throttled { key: String, retry_at_ms: i64 },
    #[error("singleton item already exists")]
    QueueItemSingletonExists,
    #[error("queue item already exists")]
    QueueItemExists,
    #[error("partition paused")]
    PartitionPaused,

    // input
    #[error("peek exceeded the maximum limit of {0}")]
    PeekMaxExceedsLimits(usize),
    #[error("priority {0} is lower than the minimum")]
    PriorityTooLow(u32),
    #[error("priority {0} is higher than the maximum")]
    PriorityTooHigh(u32),
    #[error("queue shard {0} not found")]
    QueueShardNotFound(String),
    #[error("config lease duration exceeds limits")]
    ConfigLeaseExceedsLimits,

    // lease
    #[error("queue item lease mismatch")]
    QueueItemLeaseMismatch,
    #[error("queue item not leased")]
    QueueItemNotLeased,
    #[error("partition lease expired")]
    PartitionLeaseExpired,
    #[error("shadow partition lease expired")]
    ShadowPartitionLeaseExpired,
    #[error("config lease {0} expired")]
    ConfigLeaseExpired(String),
    #[error("backlog normalization lease expired")]
    BacklogNormalizationLeaseExpired,

    // process control, never surfaced to callers of run
    #[error("no worker capacity")]
    ProcessNoCapacity,
    #[error("stop iterator")]
    ProcessStopIterator,

    #[error("constraint api: {0}")]
    ConstraintApi(String),
    #[error("invalid cron expression {expr}: {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("invalid item: {0}")]
    InvalidItem(String),

    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            QueueError::QueueItemNotFound
                | QueueError::PartitionNotFound
                | QueueError::PartitionGarbageCollected
                | QueueError::ShadowPartitionNotFound
                | QueueError::BacklogNotFound
                | QueueError::BacklogGarbageCollected
        )
    }

    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            QueueError::QueueItemAlreadyLeased
                | QueueError::PartitionAlreadyLeased
                | QueueError::ShadowPartitionAlreadyLeased
                | QueueError::ConfigAlreadyLeased(_)
                | QueueError::BacklogAlreadyLeasedForNormalization
        )
    }

    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            QueueError::PartitionConcurrencyLimit
                | QueueError::AccountConcurrencyLimit
                | QueueError::SystemConcurrencyLimit
                | QueueError::CustomKeyConcurrencyLimit(_)
                | QueueError::Throttled { .. }
                | QueueError::QueueItemSingletonExists
                | QueueError::QueueItemExists
        )
    }

    pub fn is_lease(&self) -> bool {
        matches!(
            self,
            QueueError::QueueItemLeaseMismatch
                | QueueError::QueueItemNotLeased
                | QueueError::PartitionLeaseExpired
                | QueueError::ShadowPartitionLeaseExpired
                | QueueError::ConfigLeaseExpired(_)
                | QueueError::BacklogNormalizationLeaseExpired
        )
    }

    /// Function, account or system limits stop FIFO iteration.
    pub fn is_scope_concurrency_limit(&self) -> bool {
        matches!(
            self,
            QueueError::PartitionConcurrencyLimit
                | QueueError::AccountConcurrencyLimit
                | QueueError::SystemConcurrencyLimit
        )
    }
}

/// Failure reported by a run function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    pub message: String,
    pub retryable: bool,
    /// Explicit next attempt time in unix ms
    pub retry_at_ms: Option<i64>,
    /// Retry without consuming an attempt
    pub always_retryable: bool,
    /// Stop the whole processor
    pub quit: bool,
}

impl RunError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            retry_at_ms: None,
            always_retryable: false,
            quit: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::retryable(message)
        }
    }

    pub fn always_retryable(message: impl Into<String>) -> Self {
        Self {
            always_retryable: true,
            ..Self::retryable(message)
        }
    }

    pub fn quit(message: impl Into<String>) -> Self {
        Self {
            quit: true,
            retryable: false,
            ..Self::retryable(message)
        }
    }

    pub fn with_retry_at(mut self, at_ms: i64) -> Self {
        self.retry_at_ms = Some(at_ms);
        self
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RunError {}

/// Returned by the processor when it stops for a reason other than cancellation.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("run function requested quit: {0}")]
    Quit(RunError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_are_disjoint() {
        let all = [
            QueueError::QueueItemNotFound,
            QueueError::PartitionAlreadyLeased,
            QueueError::CustomKeyConcurrencyLimit("k".into()),
            QueueError::QueueItemLeaseMismatch,
        ];
        for e in &all {
            let n = [e.is_not_found(), e.is_contention(), e.is_limit(), e.is_lease()]
                .iter()
                .filter(|b| **b)
                .count();
            assert_eq!(n, 1, "{e}");
        }
    }

    #[test]
    fn run_error_constructors() {
        assert!(RunError::retryable("x").retryable);
        assert!(!RunError::permanent("x").retryable);
        let always = RunError::always_retryable("x");
        assert!(always.retryable && always.always_retryable);
        assert!(RunError::quit("x").quit);
        assert_eq!(RunError::retryable("x").with_retry_at(5).retry_at_ms, Some(5));
    }
}
