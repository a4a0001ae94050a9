//! The four task handlers the worker dispatches on.
//!
//! Payloads are stored as untyped JSON; each handler parses its own payload
//! type at entry and rejects unknown fields. A handler returns
//! [`JobOutcome::Failed`] for expected terminal conditions (quota breach,
//! missing merchant) and `Err` for unexpected ones; the worker maps both to
//! a `failed` status transition, so nothing a handler does can take down the
//! poll loop.

use anyhow::Context;
use recoup_store::models::{Merchant, Task};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::App;

mod digest;
mod dunning;
mod notify;
mod reporter;

/// How a handler finished.
#[derive(Clone, Debug)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

/// Payload of `dunning_retry` tasks.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DunningRetryPayload {
    pub invoice_id: String,
    #[serde(default)]
    pub attempt_count: Option<u32>,
}

/// Payload of `notify_action_required` tasks.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct NotifyActionRequiredPayload {
    pub invoice_id: String,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
}

/// Dispatch a claimed task to its handler.
pub async fn dispatch(app: &App, task: &Task) -> anyhow::Result<JobOutcome> {
    use recoup_store::models::TaskType;
    match task.task_type {
        TaskType::DunningRetry => dunning::run(app, task).await,
        TaskType::NotifyActionRequired => notify::run(app, task).await,
        TaskType::ReportUsage => reporter::run(app, task).await,
        TaskType::SendWeeklyDigest => digest::run(app, task).await,
    }
}

fn parse_payload<T: DeserializeOwned>(task: &Task) -> anyhow::Result<T> {
    serde_json::from_value(task.payload.clone()).with_context(|| {
        format!(
            "Task {} has a malformed {} payload",
            task.id, task.task_type
        )
    })
}

/// Resolve the merchant owning a per-merchant task. `Ok(Err(..))` is the
/// terminal "merchant missing / malformed id" outcome.
async fn load_task_merchant(
    app: &App,
    task: &Task,
) -> anyhow::Result<Result<Merchant, JobOutcome>> {
    let merchant_id = match Uuid::parse_str(&task.merchant_id) {
        Ok(id) => id,
        Err(_) => {
            return Ok(Err(JobOutcome::Failed(format!(
                "task {} has non-uuid merchant id '{}'",
                task.id, task.merchant_id
            ))));
        }
    };

    let merchant = app
        .store
        .merchant(merchant_id)
        .await
        .context("Failed to load task merchant")?;
    Ok(match merchant {
        Some(merchant) => Ok(merchant),
        None => Err(JobOutcome::Failed(format!(
            "merchant {merchant_id} no longer exists"
        ))),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payloads_parse_camel_case() {
        let payload: DunningRetryPayload = serde_json::from_value(
            serde_json::json!({"invoiceId": "in_1", "attemptCount": 2}),
        )
        .unwrap();
        assert_eq!(payload.invoice_id, "in_1");
        assert_eq!(payload.attempt_count, Some(2));

        let payload: NotifyActionRequiredPayload = serde_json::from_value(
            serde_json::json!({
                "invoiceId": "in_2",
                "hostedInvoiceUrl": "https://pay.example/in_2",
            }),
        )
        .unwrap();
        assert_eq!(payload.invoice_id, "in_2");
        assert!(payload.hosted_invoice_url.is_some());
    }

    #[test]
    fn unknown_payload_fields_are_rejected() {
        let result = serde_json::from_value::<DunningRetryPayload>(
            serde_json::json!({"invoiceId": "in_1", "surprise": true}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn attempt_count_is_optional() {
        let payload: DunningRetryPayload =
            serde_json::from_value(serde_json::json!({"invoiceId": "in_1"}))
                .unwrap();
        assert_eq!(payload.attempt_count, None);
    }
}
