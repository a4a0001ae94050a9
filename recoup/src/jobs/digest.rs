//! `send_weekly_digest`: per-merchant weekly summary, self-scheduling.

use anyhow::Context;
use chrono::{Duration, Utc};
use recoup_common::time;
use recoup_store::models::{Merchant, Task, TaskType};
use tracing::{debug, error, info};

use super::JobOutcome;
use crate::{App, email};

pub(super) async fn run(
    app: &App,
    task: &Task,
) -> anyhow::Result<JobOutcome> {
    // A deleted merchant ends its digest chain: no successor is enqueued,
    // and erasure already removed any queued links.
    let merchant = match super::load_task_merchant(app, task).await? {
        Ok(merchant) => merchant,
        Err(outcome) => return Ok(outcome),
    };

    let result = run_inner(app, &merchant).await;

    // Chain the next weekly run even if this one failed.
    let successor = app
        .store
        .enqueue_task(
            &task.merchant_id,
            TaskType::SendWeeklyDigest,
            serde_json::json!({}),
            Utc::now() + Duration::days(7),
        )
        .await;
    if let Err(e) = successor {
        error!(merchant_id = %merchant.id,
               "Failed to enqueue successor digest task: {e:#}");
    }

    result
}

async fn run_inner(
    app: &App,
    merchant: &Merchant,
) -> anyhow::Result<JobOutcome> {
    let Some(to) = &merchant.email else {
        debug!(merchant_id = %merchant.id,
               "Merchant has no email address; skipping digest");
        return Ok(JobOutcome::Completed);
    };

    let since = time::utc_date(Utc::now() - Duration::days(7));
    let totals = app
        .store
        .metric_totals(merchant.id, since)
        .await
        .context("Failed to aggregate digest metrics")?;

    let outgoing =
        email::render_digest(&app.config.email_from, merchant, &totals, to);
    app.email
        .send(&outgoing)
        .await
        .context("Failed to send digest email")?;

    info!(merchant_id = %merchant.id, "Weekly digest sent");
    Ok(JobOutcome::Completed)
}
