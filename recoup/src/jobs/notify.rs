//! `notify_action_required`: tell the customer their bank wants SCA / 3DS
//! confirmation for a pending payment.

use anyhow::Context;
use recoup_store::models::{MetricType, Task};
use tracing::{debug, info};

use super::{JobOutcome, NotifyActionRequiredPayload};
use crate::{App, email};

pub(super) async fn run(
    app: &App,
    task: &Task,
) -> anyhow::Result<JobOutcome> {
    let payload: NotifyActionRequiredPayload = super::parse_payload(task)?;
    let merchant = match super::load_task_merchant(app, task).await? {
        Ok(merchant) => merchant,
        Err(outcome) => return Ok(outcome),
    };

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
        debug!(invoice_id = %invoice.id,
               "Invoice settled before the SCA notification went out");
        return Ok(JobOutcome::Completed);
    }

    if invoice.customer_email.is_none() {
        debug!(invoice_id = %invoice.id,
               "No customer email; skipping SCA notification");
        return Ok(JobOutcome::Completed);
    }

    let confirm_url = payload
        .hosted_invoice_url
        .or_else(|| invoice.hosted_invoice_url.clone())
        .unwrap_or_else(|| app.config.public_url.clone());

    let outgoing = email::render_action_required(
        &app.config.email_from,
        &merchant,
        &invoice,
        &confirm_url,
    );
    app.email
        .send(&outgoing)
        .await
        .context("Failed to send action-required email")?;

    let log = app
        .store
        .create_usage_log(merchant.id, &MetricType::DunningEmailSent, 1)
        .await?;

    info!(
        merchant_id = %merchant.id,
        invoice_id = %invoice.id,
        usage_log_id = log.id,
        "Action-required notification sent"
    );
    Ok(JobOutcome::Completed)
}
