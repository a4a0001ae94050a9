//! Quota gating.
//!
//! The same monthly counter is consulted at three boundaries:
//!
//! 1. user-initiated task creation (`POST /tasks`), which also enforces the
//!    queue limit;
//! 2. worker entry into `dunning_retry` (webhook-enqueued tasks bypass the
//!    ingress gate, so backpressure lands at processing time);
//! 3. the usage reporter, immediately before each meter-event upload.

use recoup_store::{Store, StoreError, models::Merchant};
use serde::Serialize;

/// Current monthly consumption vs. plan limit; also the dashboard's
/// `usage` payload.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct UsageSnapshot {
    pub current: i64,
    pub limit: i64,
}

impl UsageSnapshot {
    pub fn exhausted(&self) -> bool {
        self.current >= self.limit
    }
}

/// Why task creation was denied.
#[derive(Clone, Debug)]
pub enum QuotaDenied {
    MonthlyLimit(UsageSnapshot),
    QueueLimit { queued: i64, limit: i64 },
}

/// The merchant's monthly dunning usage against their plan.
pub async fn monthly_usage(
    store: &Store,
    merchant: &Merchant,
) -> Result<UsageSnapshot, StoreError> {
    let current = store.monthly_dunning_count(merchant.id).await?;
    Ok(UsageSnapshot {
        current,
        limit: merchant.plan().monthly_limit,
    })
}

/// Gate for user-initiated task creation: monthly limit first, then queue
/// depth.
pub async fn check_task_creation(
    store: &Store,
    merchant: &Merchant,
) -> Result<Result<(), QuotaDenied>, StoreError> {
    let usage = monthly_usage(store, merchant).await?;
    if usage.exhausted() {
        return Ok(Err(QuotaDenied::MonthlyLimit(usage)));
    }

    let queued = store.pending_task_count(&merchant.id.to_string()).await?;
    let queue_limit = merchant.plan().queue_limit;
    if queued >= queue_limit {
        return Ok(Err(QuotaDenied::QueueLimit {
            queued,
            limit: queue_limit,
        }));
    }

    Ok(Ok(()))
}
