//! `report_usage`: forward unreported usage to the provider's metered
//! billing, 100 logs at a time, then schedule the next cycle.
//!
//! Reporting is made safe to repeat by deriving the idempotency key from the
//! usage log's primary key (`usage_log_<id>`); the provider deduplicates on
//! its side, so a crash between upload and `mark_usage_reported` costs
//! nothing.

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{Duration, Utc};
use recoup_store::models::{
    MetricType, SYSTEM_MERCHANT_ID, Task, TaskType, UsageLog,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::JobOutcome;
use crate::App;

/// Logs uploaded per cycle.
const BATCH_SIZE: i64 = 100;
/// Gap between cycles, in minutes.
const CYCLE_INTERVAL_MIN: i64 = 5;

pub(super) async fn run(
    app: &App,
    _task: &Task,
) -> anyhow::Result<JobOutcome> {
    let result = run_inner(app).await;

    // The successor is enqueued even when this run failed; the self-
    // scheduling chain must never end while the process lives. If even this
    // insert fails the watchdog resurrects the chain on next startup.
    let successor = app
        .store
        .enqueue_task(
            SYSTEM_MERCHANT_ID,
            TaskType::ReportUsage,
            serde_json::json!({}),
            Utc::now() + Duration::minutes(CYCLE_INTERVAL_MIN),
        )
        .await;
    if let Err(e) = successor {
        error!("Failed to enqueue successor report_usage task: {e:#}");
    }

    result
}

async fn run_inner(app: &App) -> anyhow::Result<JobOutcome> {
    let logs = app
        .store
        .unreported_usage_logs(BATCH_SIZE)
        .await
        .context("Failed to fetch unreported usage logs")?;
    if logs.is_empty() {
        debug!("No unreported usage");
        return Ok(JobOutcome::Completed);
    }

    let total = logs.len();
    let mut by_merchant: BTreeMap<Uuid, Vec<UsageLog>> = BTreeMap::new();
    for log in logs {
        by_merchant.entry(log.merchant_id).or_default().push(log);
    }

    let mut reported: Vec<i64> = Vec::with_capacity(total);
    let mut deferred = 0usize;

    for (merchant_id, logs) in by_merchant {
        let merchant = app
            .store
            .merchant(merchant_id)
            .await
            .context("Failed to load merchant for usage reporting")?;

        // A deleted merchant can't be billed; retain nothing for it.
        let Some(merchant) = merchant else {
            warn!(%merchant_id,
                  "Merchant gone; marking its usage logs reported");
            reported.extend(logs.iter().map(|log| log.id));
            continue;
        };
        // Without a platform customer there is no subscription to meter.
        let Some(customer_id) = &merchant.pp_customer_id else {
            warn!(%merchant_id,
                  "Merchant has no platform customer; marking logs reported");
            reported.extend(logs.iter().map(|log| log.id));
            continue;
        };

        // Re-check quota immediately before upload: over-quota dunning rows
        // are marked reported *without* calling the provider, so they don't
        // wedge the queue and don't bill the merchant past their plan.
        let monthly = app.store.monthly_dunning_count(merchant_id).await?;
        let over_quota = monthly >= merchant.plan().monthly_limit;

        for log in logs {
            if over_quota && log.metric_type == MetricType::DunningEmailSent
            {
                debug!(log_id = log.id, %merchant_id,
                       "Over quota; marking reported without upload");
                reported.push(log.id);
                continue;
            }

            let idempotency_key = format!("usage_log_{}", log.id);
            let upload = app
                .provider
                .post_meter_event(
                    customer_id,
                    log.metric_type.as_str(),
                    log.amount,
                    &idempotency_key,
                )
                .await;

            match upload {
                Ok(()) => reported.push(log.id),
                Err(e) if e.is_idempotency_replay() => {
                    // Safe, but worth surfacing: it means a previous cycle
                    // crashed between upload and mark.
                    warn!(log_id = log.id,
                          "Meter event was already reported: {e}");
                    reported.push(log.id);
                }
                Err(e) if e.is_permanent() => {
                    // Poison pill: this row will never upload. Mark it
                    // reported so it can't block the rest of the queue.
                    error!(log_id = log.id, %merchant_id,
                           "Permanent provider error; isolating row: {e}");
                    reported.push(log.id);
                }
                Err(e) => {
                    // Transient: leave unreported for the next cycle.
                    warn!(log_id = log.id,
                          "Transient provider error; will retry: {e}");
                    deferred += 1;
                }
            }
        }
    }

    app.store
        .mark_usage_reported(&reported)
        .await
        .context("Failed to mark usage logs reported")?;

    info!(
        reported = reported.len(),
        deferred,
        batch = total,
        "Usage reporting cycle finished"
    );
    Ok(JobOutcome::Completed)
}
