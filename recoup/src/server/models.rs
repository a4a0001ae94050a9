//! Request / response wire types for the merchant-facing API.

use chrono::{DateTime, Utc};
use recoup_store::models::{
    Merchant, MetricTotals, Task, TaskCounts, TaskStatus, TaskType, UsageLog,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quota::UsageSnapshot;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

// --- Dashboard --- //

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardResponse {
    pub stats: DashboardStats,
    pub recent_tasks: Vec<Task>,
    pub recent_activity: Vec<UsageLog>,
    pub usage: UsageSnapshot,
    pub merchant: MerchantSummary,
}

/// 30-day rollup totals plus queue composition.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    #[serde(flatten)]
    pub totals: MetricTotals,
    pub tasks: TaskCounts,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantSummary {
    pub id: Uuid,
    pub email: Option<String>,
    pub tier: String,
    pub connected: bool,
}

impl From<&Merchant> for MerchantSummary {
    fn from(merchant: &Merchant) -> Self {
        Self {
            id: merchant.id,
            email: merchant.email.clone(),
            tier: merchant.tier.clone(),
            connected: merchant.is_connected(),
        }
    }
}

/// The response whitelist for merchant reads/updates: never tokens, never
/// OAuth state.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantProfile {
    pub id: Uuid,
    pub email: Option<String>,
    pub tier: String,
    pub subscription_plan_id: String,
    pub billing_country: Option<String>,
    pub billing_address: Option<String>,
    pub from_name: Option<String>,
    pub support_email: Option<String>,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Merchant> for MerchantProfile {
    fn from(merchant: &Merchant) -> Self {
        Self {
            id: merchant.id,
            email: merchant.email.clone(),
            tier: merchant.tier.clone(),
            subscription_plan_id: merchant.subscription_plan_id.clone(),
            billing_country: merchant.billing_country.clone(),
            billing_address: merchant.billing_address.clone(),
            from_name: merchant.from_name.clone(),
            support_email: merchant.support_email.clone(),
            brand_color: merchant.brand_color.clone(),
            logo_url: merchant.logo_url.clone(),
            connected: merchant.is_connected(),
            created_at: merchant.created_at,
        }
    }
}

// --- Tasks --- //

#[derive(Deserialize)]
pub struct TasksQuery {
    pub status: Option<TaskStatus>,
}

/// `POST /tasks`. The server forces `status`, `run_at`, and `merchant_id`;
/// clients only pick a (whitelisted) type and payload.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub task_type: TaskType,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// `POST /worker/complete/:id`
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskRequest {
    pub status: TaskStatus,
    /// Recovered revenue to roll up, when the caller knows it.
    #[serde(default)]
    pub recovered_cents: Option<i64>,
}

#[derive(Serialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

// --- Templates --- //

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertTemplateRequest {
    pub retry_attempt: i32,
    pub subject: String,
    pub body: String,
}

// --- Activity --- //

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityQuery {
    pub metric_type: Option<String>,
    pub limit: Option<i64>,
}

// --- OAuth connect --- //

#[derive(Serialize)]
pub struct AuthorizeResponse {
    pub url: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

#[derive(Serialize)]
pub struct ConnectedResponse {
    pub connected: bool,
}

#[derive(Serialize)]
pub struct DisconnectedResponse {
    pub disconnected: bool,
}

// --- Tracking --- //

#[derive(Deserialize)]
pub struct TrackClickQuery {
    pub url: String,
    #[serde(rename = "logId")]
    pub log_id: i64,
    pub sig: String,
}
