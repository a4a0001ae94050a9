//! Startup watchdog: resurrect the self-scheduling task chains.
//!
//! `report_usage` and `send_weekly_digest` each re-enqueue their successor
//! as their final act, forming durable chains. A crash at exactly the wrong
//! moment (or a manual queue wipe) can sever a chain; this bootstrap runs
//! before the worker starts and recreates any missing link with
//! `run_at = now()`.

use anyhow::Context;
use chrono::Utc;
use recoup_store::{
    Store,
    models::{SYSTEM_MERCHANT_ID, TaskType},
};
use tracing::info;

pub async fn bootstrap(store: &Store) -> anyhow::Result<()> {
    // Exactly one pending/running report_usage task under "system".
    let has_reporter = store
        .has_open_task(SYSTEM_MERCHANT_ID, TaskType::ReportUsage)
        .await
        .context("Failed to check for the report_usage singleton")?;
    if !has_reporter {
        store
            .enqueue_task(
                SYSTEM_MERCHANT_ID,
                TaskType::ReportUsage,
                serde_json::json!({}),
                Utc::now(),
            )
            .await
            .context("Failed to recreate the report_usage singleton")?;
        info!("Watchdog recreated the report_usage system task");
    }

    // Every merchant keeps a live weekly-digest chain.
    let mut recreated = 0usize;
    for merchant_id in store
        .merchant_ids()
        .await
        .context("Failed to list merchants")?
    {
        let owner = merchant_id.to_string();
        let has_digest = store
            .has_open_task(&owner, TaskType::SendWeeklyDigest)
            .await?;
        if !has_digest {
            store
                .enqueue_task(
                    &owner,
                    TaskType::SendWeeklyDigest,
                    serde_json::json!({}),
                    Utc::now(),
                )
                .await?;
            recreated += 1;
        }
    }
    if recreated > 0 {
        info!(recreated, "Watchdog recreated weekly digest tasks");
    }

    Ok(())
}
