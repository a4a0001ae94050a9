//! Row types and the string-backed enums stored in `TEXT` columns.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use recoup_common::plan::{Plan, plan_for};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// The sentinel `tasks.merchant_id` owning singleton system tasks
/// (`report_usage`).
pub const SYSTEM_MERCHANT_ID: &str = "system";

// --- Task enums --- //

/// Task lifecycle. Transitions form the DAG
/// pending -> running -> {completed, failed}; the janitor may reset a stale
/// `running` back to `pending`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(strum::Display, strum::EnumString)]
#[derive(Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The closed set of task types the worker dispatches on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(strum::Display, strum::EnumString)]
#[derive(Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DunningRetry,
    NotifyActionRequired,
    ReportUsage,
    SendWeeklyDigest,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DunningRetry => "dunning_retry",
            Self::NotifyActionRequired => "notify_action_required",
            Self::ReportUsage => "report_usage",
            Self::SendWeeklyDigest => "send_weekly_digest",
        }
    }
}

// --- MetricType --- //

/// Usage log metric types. The column is an open string, so unknown values
/// round-trip through [`MetricType::Other`] instead of erroring.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MetricType {
    DunningEmailSent,
    RecoverySuccess,
    RecoveryFailed,
    TaskRetry,
    TaskScheduled,
    MerchantConnected,
    MerchantDisconnected,
    QuotaExceeded,
    ActionRequiredNotification,
    SubscriptionChurned,
    Other(String),
}

impl MetricType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DunningEmailSent => "dunning_email_sent",
            Self::RecoverySuccess => "recovery_success",
            Self::RecoveryFailed => "recovery_failed",
            Self::TaskRetry => "task_retry",
            Self::TaskScheduled => "task_scheduled",
            Self::MerchantConnected => "merchant_connected",
            Self::MerchantDisconnected => "merchant_disconnected",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ActionRequiredNotification => "action_required_notification",
            Self::SubscriptionChurned => "subscription_churned",
            Self::Other(s) => s,
        }
    }
}

impl FromStr for MetricType {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "dunning_email_sent" => Self::DunningEmailSent,
            "recovery_success" => Self::RecoverySuccess,
            "recovery_failed" => Self::RecoveryFailed,
            "task_retry" => Self::TaskRetry,
            "task_scheduled" => Self::TaskScheduled,
            "merchant_connected" => Self::MerchantConnected,
            "merchant_disconnected" => Self::MerchantDisconnected,
            "quota_exceeded" => Self::QuotaExceeded,
            "action_required_notification" =>
                Self::ActionRequiredNotification,
            "subscription_churned" => Self::SubscriptionChurned,
            other => Self::Other(other.to_owned()),
        })
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MetricType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MetricType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(Self::from_str(&s).expect("Infallible"))
    }
}

// --- Entities --- //

/// A tenant. Token fields are already decrypted (best-effort; see the
/// merchants module) by the time a `Merchant` is handed out.
#[derive(Clone, Debug)]
pub struct Merchant {
    pub id: Uuid,
    pub auth_user_id: Option<String>,
    pub email: Option<String>,
    pub pp_account_id: Option<String>,
    pub pp_customer_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub oauth_state: Option<String>,
    pub tier: String,
    pub subscription_plan_id: String,
    pub billing_country: Option<String>,
    pub billing_address: Option<String>,
    pub from_name: Option<String>,
    pub support_email: Option<String>,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Merchant {
    /// Whether the merchant has a live PP OAuth connection.
    pub fn is_connected(&self) -> bool {
        self.pp_account_id.is_some()
    }

    /// The merchant's quota plan, resolved from its subscription plan id.
    pub fn plan(&self) -> &'static Plan {
        plan_for(&self.subscription_plan_id)
    }
}

/// A unit of queued work.
#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub id: i64,
    pub merchant_id: String,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UsageLog {
    pub id: i64,
    pub merchant_id: Uuid,
    pub metric_type: MetricType,
    pub amount: i64,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub reported_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, sqlx::FromRow, Serialize)]
pub struct EmailTemplate {
    pub merchant_id: Uuid,
    pub retry_attempt: i32,
    pub subject: String,
    pub body: String,
}

/// Aggregated rollup counters over a date range.
#[derive(Clone, Copy, Debug, Default, sqlx::FromRow, Serialize)]
pub struct MetricTotals {
    pub recovered_cents: i64,
    pub emails_sent: i64,
    pub total_opens: i64,
    pub total_clicks: i64,
}

/// Per-status task counts for the dashboard.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct TaskCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn task_enums_roundtrip_snake_case() {
        for (ty, s) in [
            (TaskType::DunningRetry, "dunning_retry"),
            (TaskType::NotifyActionRequired, "notify_action_required"),
            (TaskType::ReportUsage, "report_usage"),
            (TaskType::SendWeeklyDigest, "send_weekly_digest"),
        ] {
            assert_eq!(ty.as_str(), s);
            assert_eq!(ty.to_string(), s);
            assert_eq!(TaskType::from_str(s).unwrap(), ty);
        }

        assert_eq!(TaskStatus::Pending.as_str(), "pending");
        assert_eq!(
            TaskStatus::from_str("completed").unwrap(),
            TaskStatus::Completed
        );
        assert!(TaskType::from_str("reboot_universe").is_err());
    }

    #[test]
    fn metric_type_preserves_unknown_values() {
        let known = MetricType::from_str("dunning_email_sent").unwrap();
        assert_eq!(known, MetricType::DunningEmailSent);

        let unknown = MetricType::from_str("beta_experiment").unwrap();
        assert_eq!(unknown, MetricType::Other("beta_experiment".to_owned()));
        assert_eq!(unknown.as_str(), "beta_experiment");
    }
}
