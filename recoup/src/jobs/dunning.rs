//! `dunning_retry`: attempt to recover one failed renewal invoice.

use anyhow::Context;
use recoup_store::models::{MetricType, Task};
use tracing::{debug, info, warn};

use super::{DunningRetryPayload, JobOutcome};
use crate::{App, email, quota};

pub(super) async fn run(
    app: &App,
    task: &Task,
) -> anyhow::Result<JobOutcome> {
    let payload: DunningRetryPayload = super::parse_payload(task)?;
    let merchant = match super::load_task_merchant(app, task).await? {
        Ok(merchant) => merchant,
        Err(outcome) => return Ok(outcome),
    };

    // Quota backstop. Webhook-enqueued tasks bypass the ingress-time gate,
    // so the monthly limit is enforced here, at processing time. No email
    // and no `dunning_email_sent` log may be produced past the limit.
    let usage = quota::monthly_usage(&app.store, &merchant).await?;
    if usage.exhausted() {
        app.store
            .create_usage_log(merchant.id, &MetricType::QuotaExceeded, 1)
            .await?;
        info!(
            merchant_id = %merchant.id,
            current = usage.current,
            limit = usage.limit,
            "Monthly dunning quota exhausted; failing task"
        );
        return Ok(JobOutcome::Failed(
            "monthly dunning quota exhausted".to_owned(),
        ));
    }

    let Some(account) = &merchant.pp_account_id else {
        return Ok(JobOutcome::Failed(
            "merchant has no connected provider account".to_owned(),
        ));
    };

    let invoice = app
        .provider
        .for_account(account)
        .get_invoice(&payload.invoice_id)
        .await
        .context("Failed to fetch invoice")?;

    if invoice.status.is_settled() {
        debug!(invoice_id = %invoice.id, status = ?invoice.status,
               "Invoice already settled; nothing to recover");
        return Ok(JobOutcome::Completed);
    }
    if invoice.status != recoup_provider::InvoiceStatus::Open {
        debug!(invoice_id = %invoice.id, status = ?invoice.status,
               "Invoice not recoverable in this status");
        return Ok(JobOutcome::Completed);
    }
    if invoice.customer_email.is_none() {
        warn!(invoice_id = %invoice.id,
              "Open invoice has no customer email; cannot send dunning");
        return Ok(JobOutcome::Completed);
    }

    let attempt = payload.attempt_count.unwrap_or(1).clamp(1, 3);

    // The usage log is written *before* the send so that every attempt
    // counts against quota even if the send fails. At-most-once delivery is
    // unachievable; idempotent meter reporting compensates on the billing
    // side. A send failure below leaves the log in place on purpose.
    let log = app
        .store
        .create_usage_log(merchant.id, &MetricType::DunningEmailSent, 1)
        .await?;

    let template = app
        .store
        .email_template(merchant.id, attempt as i32)
        .await?;

    let outgoing = email::render_dunning(
        &app.config.public_url,
        &app.config.email_from,
        &app.link_signer,
        &merchant,
        &invoice,
        attempt,
        template.as_ref(),
        log.id,
    );

    app.email
        .send(&outgoing)
        .await
        .context("Failed to send dunning email")?;

    info!(
        merchant_id = %merchant.id,
        invoice_id = %invoice.id,
        attempt,
        usage_log_id = log.id,
        "Dunning email sent"
    );
    Ok(JobOutcome::Completed)
}
