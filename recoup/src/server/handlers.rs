//! HTTP handlers for the merchant-facing API, machine endpoints, and
//! tracking links.

pub(crate) use admin::erase_merchant;
pub(crate) use connect::{authorize, callback, disconnect};
pub(crate) use dashboard::dashboard;
pub(crate) use merchants::update_merchant;
pub(crate) use misc::health;
pub(crate) use tasks::{
    create_task, delete_completed, delete_task, get_task, list_tasks,
    retry_task,
};
pub(crate) use templates::upsert_template;
pub(crate) use tracking::{track_click, track_open};
pub(crate) use usage::activity;
pub(crate) use worker_admin::{worker_claim, worker_complete};

mod misc {
    use std::sync::Arc;

    use axum::{Json, extract::State};
    use tracing::instrument;

    use crate::{
        App,
        server::{error::ApiError, models::HealthResponse},
    };

    #[instrument(skip_all, name = "(health)")]
    pub(crate) async fn health(
        State(app): State<Arc<App>>,
    ) -> Result<Json<HealthResponse>, ApiError> {
        app.store.ping().await?;
        Ok(Json(HealthResponse { status: "ok" }))
    }
}

mod dashboard {
    use std::sync::Arc;

    use axum::{Json, extract::State};
    use chrono::{Duration, Utc};
    use recoup_common::time;
    use tracing::instrument;

    use crate::{
        App, quota,
        server::{
            auth::AuthedMerchant,
            error::ApiError,
            models::{DashboardResponse, DashboardStats, MerchantSummary},
        },
    };

    #[instrument(skip_all, name = "(dashboard)")]
    pub(crate) async fn dashboard(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
    ) -> Result<Json<DashboardResponse>, ApiError> {
        let merchant_key = merchant.id.to_string();
        let since = time::utc_date(Utc::now() - Duration::days(30));

        let totals = app.store.metric_totals(merchant.id, since).await?;
        let tasks = app.store.task_counts(&merchant_key).await?;
        let recent_tasks =
            app.store.list_tasks(&merchant_key, None, 5).await?;
        let recent_activity =
            app.store.recent_activity(merchant.id, None, 10).await?;
        let usage = quota::monthly_usage(&app.store, &merchant).await?;

        Ok(Json(DashboardResponse {
            stats: DashboardStats { totals, tasks },
            recent_tasks,
            recent_activity,
            usage,
            merchant: MerchantSummary::from(&merchant),
        }))
    }
}

mod tasks {
    use std::sync::Arc;

    use axum::{
        Json,
        extract::{Path, Query, State},
    };
    use chrono::Utc;
    use recoup_store::models::{MetricType, Task, TaskType};
    use tracing::{info, instrument};

    use crate::{
        App, jobs, quota,
        quota::QuotaDenied,
        server::{
            auth::AuthedMerchant,
            error::ApiError,
            models::{CreateTaskRequest, DeletedResponse, TasksQuery},
        },
    };

    const LIST_LIMIT: i64 = 100;

    #[instrument(skip_all, name = "(list-tasks)")]
    pub(crate) async fn list_tasks(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
        Query(query): Query<TasksQuery>,
    ) -> Result<Json<Vec<Task>>, ApiError> {
        let tasks = app
            .store
            .list_tasks(&merchant.id.to_string(), query.status, LIST_LIMIT)
            .await?;
        Ok(Json(tasks))
    }

    #[instrument(skip_all, name = "(get-task)")]
    pub(crate) async fn get_task(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
        Path(task_id): Path<i64>,
    ) -> Result<Json<Task>, ApiError> {
        app.store
            .task_for_merchant(task_id, &merchant.id.to_string())
            .await?
            .map(Json)
            .ok_or_else(|| ApiError::not_found("no such task"))
    }

    /// Quota-gated; only `dunning_retry` and `notify_action_required` may be
    /// created by merchants, and the server forces `status`, `run_at`, and
    /// `merchant_id` regardless of what the client sent.
    #[instrument(skip_all, name = "(create-task)")]
    pub(crate) async fn create_task(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
        Json(req): Json<CreateTaskRequest>,
    ) -> Result<Json<Task>, ApiError> {
        match quota::check_task_creation(&app.store, &merchant).await? {
            Ok(()) => {}
            Err(QuotaDenied::MonthlyLimit(usage)) => {
                return Err(ApiError::payment_required(format!(
                    "monthly dunning limit reached ({current}/{limit})",
                    current = usage.current,
                    limit = usage.limit,
                )));
            }
            Err(QuotaDenied::QueueLimit { queued, limit }) => {
                return Err(ApiError::too_many_requests(format!(
                    "task queue is full ({queued}/{limit})"
                )));
            }
        }

        let payload = req.payload.unwrap_or_else(|| serde_json::json!({}));
        match req.task_type {
            TaskType::DunningRetry => {
                serde_json::from_value::<jobs::DunningRetryPayload>(
                    payload.clone(),
                )
                .map_err(|e| {
                    ApiError::bad_request(format!("bad payload: {e}"))
                })?;
            }
            TaskType::NotifyActionRequired => {
                serde_json::from_value::<jobs::NotifyActionRequiredPayload>(
                    payload.clone(),
                )
                .map_err(|e| {
                    ApiError::bad_request(format!("bad payload: {e}"))
                })?;
            }
            // System task types are never client-creatable.
            TaskType::ReportUsage | TaskType::SendWeeklyDigest => {
                return Err(ApiError::bad_request(
                    "task type not allowed here",
                ));
            }
        }

        let task = app
            .store
            .enqueue_task(
                &merchant.id.to_string(),
                req.task_type,
                payload,
                Utc::now(),
            )
            .await?;
        info!(merchant_id = %merchant.id, task_id = task.id,
              task_type = %task.task_type, "Merchant created task");
        Ok(Json(task))
    }

    #[instrument(skip_all, name = "(retry-task)")]
    pub(crate) async fn retry_task(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
        Path(task_id): Path<i64>,
    ) -> Result<Json<Task>, ApiError> {
        let merchant_key = merchant.id.to_string();
        let retried = app.store.retry_task(task_id, &merchant_key).await?;
        if !retried {
            return Err(ApiError::not_found("no such task"));
        }

        app.store
            .create_usage_log(merchant.id, &MetricType::TaskRetry, 1)
            .await?;

        let task = app
            .store
            .task_for_merchant(task_id, &merchant_key)
            .await?
            .ok_or_else(|| ApiError::not_found("no such task"))?;
        Ok(Json(task))
    }

    #[instrument(skip_all, name = "(delete-task)")]
    pub(crate) async fn delete_task(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
        Path(task_id): Path<i64>,
    ) -> Result<Json<DeletedResponse>, ApiError> {
        let deleted = app
            .store
            .delete_task(task_id, &merchant.id.to_string())
            .await?;
        if !deleted {
            return Err(ApiError::not_found("no such task"));
        }
        Ok(Json(DeletedResponse { deleted: 1 }))
    }

    #[instrument(skip_all, name = "(delete-completed)")]
    pub(crate) async fn delete_completed(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
    ) -> Result<Json<DeletedResponse>, ApiError> {
        let deleted = app
            .store
            .delete_completed_tasks(&merchant.id.to_string())
            .await?;
        Ok(Json(DeletedResponse { deleted }))
    }
}

mod merchants {
    use std::sync::Arc;

    use axum::{
        Json,
        extract::{Path, State},
    };
    use recoup_store::MerchantSettingsUpdate;
    use tracing::instrument;
    use uuid::Uuid;

    use crate::{
        App,
        server::{
            auth::AuthedMerchant, error::ApiError, models::MerchantProfile,
        },
    };

    fn is_hex_color(value: &str) -> bool {
        value.len() == 7
            && value.starts_with('#')
            && value[1..].chars().all(|c| c.is_ascii_hexdigit())
    }

    /// `PATCH /merchants/:id` - whitelisted fields only; email and tokens
    /// are not settable through this surface.
    #[instrument(skip_all, name = "(update-merchant)")]
    pub(crate) async fn update_merchant(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
        Path(merchant_id): Path<Uuid>,
        Json(update): Json<MerchantSettingsUpdate>,
    ) -> Result<Json<MerchantProfile>, ApiError> {
        if merchant_id != merchant.id {
            return Err(ApiError::forbidden("not your merchant"));
        }

        if let Some(color) = &update.brand_color {
            if !is_hex_color(color) {
                return Err(ApiError::bad_request(
                    "brand_color must be a #rrggbb hex color",
                ));
            }
        }
        if let Some(logo_url) = &update.logo_url {
            if !logo_url.starts_with("https://") {
                return Err(ApiError::bad_request(
                    "logo_url must be an https:// URL",
                ));
            }
        }
        if let Some(support_email) = &update.support_email {
            if !support_email.contains('@') {
                return Err(ApiError::bad_request(
                    "support_email doesn't look like an email address",
                ));
            }
        }

        let updated = app
            .store
            .update_merchant_settings(merchant.id, &update)
            .await?
            .ok_or_else(|| ApiError::not_found("no such merchant"))?;
        Ok(Json(MerchantProfile::from(&updated)))
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn hex_color_validation() {
            assert!(is_hex_color("#1A2b3C"));
            assert!(is_hex_color("#000000"));
            assert!(!is_hex_color("1A2b3C"));
            assert!(!is_hex_color("#1A2b3"));
            assert!(!is_hex_color("#1A2b3CD"));
            assert!(!is_hex_color("#GGGGGG"));
            assert!(!is_hex_color(""));
        }
    }
}

mod templates {
    use std::sync::Arc;

    use axum::{Json, extract::State};
    use recoup_store::models::EmailTemplate;
    use tracing::instrument;

    use crate::{
        App, email,
        server::{
            auth::AuthedMerchant, error::ApiError,
            models::UpsertTemplateRequest,
        },
    };

    const MAX_SUBJECT_LEN: usize = 200;

    /// `POST /email-templates` - the body is sanitized server-side against
    /// the HTML allowlist before it is stored.
    #[instrument(skip_all, name = "(upsert-template)")]
    pub(crate) async fn upsert_template(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
        Json(req): Json<UpsertTemplateRequest>,
    ) -> Result<Json<EmailTemplate>, ApiError> {
        if !(1..=3).contains(&req.retry_attempt) {
            return Err(ApiError::bad_request(
                "retry_attempt must be 1, 2, or 3",
            ));
        }
        if req.subject.is_empty() || req.subject.len() > MAX_SUBJECT_LEN {
            return Err(ApiError::bad_request(format!(
                "subject must be 1..={MAX_SUBJECT_LEN} chars"
            )));
        }

        let body = email::sanitize_template_body(&req.body);
        let template = app
            .store
            .upsert_email_template(
                merchant.id,
                req.retry_attempt,
                &req.subject,
                &body,
            )
            .await?;
        Ok(Json(template))
    }
}

mod usage {
    use std::{str::FromStr, sync::Arc};

    use axum::{
        Json,
        extract::{Query, State},
    };
    use recoup_store::models::{MetricType, UsageLog};
    use tracing::instrument;

    use crate::{
        App,
        server::{
            auth::AuthedMerchant, error::ApiError, models::ActivityQuery,
        },
    };

    const MAX_ACTIVITY: i64 = 100;

    #[instrument(skip_all, name = "(activity)")]
    pub(crate) async fn activity(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
        Query(query): Query<ActivityQuery>,
    ) -> Result<Json<Vec<UsageLog>>, ApiError> {
        let limit = query
            .limit
            .unwrap_or(MAX_ACTIVITY)
            .clamp(1, MAX_ACTIVITY);
        let metric_type = query
            .metric_type
            .as_deref()
            .map(|metric| MetricType::from_str(metric).expect("Infallible"));

        let logs = app
            .store
            .recent_activity(merchant.id, metric_type.as_ref(), limit)
            .await?;
        Ok(Json(logs))
    }
}

mod tracking {
    use std::{net::SocketAddr, sync::Arc};

    use axum::{
        extract::{ConnectInfo, Path, Query, State},
        response::IntoResponse,
    };
    use http::{StatusCode, header};
    use tracing::{debug, instrument, warn};

    use crate::{
        App,
        server::{error::ApiError, models::TrackClickQuery},
    };

    /// A literal 1x1 transparent GIF89a.
    const TRACKING_PIXEL_GIF: &[u8] = &[
        0x47, 0x49, 0x46, 0x38, 0x39, 0x61, // "GIF89a"
        0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, // 1x1, palette follows
        0x00, 0x00, 0x00, 0xff, 0xff, 0xff, // black, white
        0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, // GCE: transparent
        0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00,
        0x00, // image descriptor
        0x02, 0x02, 0x44, 0x01, 0x00, // image data
        0x3b, // trailer
    ];

    /// `GET /track/open/:logId` - unauthenticated by design; serves the
    /// pixel no matter what so probing reveals nothing about log ids.
    #[instrument(skip_all, name = "(track-open)")]
    pub(crate) async fn track_open(
        State(app): State<Arc<App>>,
        Path(log_id): Path<i64>,
    ) -> impl IntoResponse {
        match app.store.record_open(log_id).await {
            Ok(true) => debug!(log_id, "Recorded email open"),
            Ok(false) => debug!(log_id, "Open already recorded or unknown"),
            Err(e) => warn!(log_id, "Failed to record open: {e:#}"),
        }

        (
            [
                (header::CONTENT_TYPE, "image/gif"),
                (header::CACHE_CONTROL, "no-store, max-age=0"),
            ],
            TRACKING_PIXEL_GIF,
        )
    }

    /// `GET /track/click?url&logId&sig` - the HMAC binds the redirect
    /// target to the usage log, so this can't be abused as an open
    /// redirector.
    #[instrument(skip_all, name = "(track-click)")]
    pub(crate) async fn track_click(
        State(app): State<Arc<App>>,
        ConnectInfo(addr): ConnectInfo<SocketAddr>,
        Query(query): Query<TrackClickQuery>,
    ) -> Result<impl IntoResponse, ApiError> {
        if !app
            .link_signer
            .verify(&query.url, query.log_id, &query.sig)
        {
            // Security event: a forged or tampered tracking link.
            warn!(ip = %addr.ip(), log_id = query.log_id,
                  "Rejected tracking link with bad signature");
            return Err(ApiError::forbidden("bad signature"));
        }
        if !query.url.starts_with("https://")
            && !query.url.starts_with("http://")
        {
            return Err(ApiError::bad_request("unsupported redirect scheme"));
        }

        match app.store.record_click(query.log_id).await {
            Ok(_) => {}
            Err(e) => {
                warn!(log_id = query.log_id,
                      "Failed to record click: {e:#}");
            }
        }

        Ok((StatusCode::FOUND, [(header::LOCATION, query.url)]))
    }
}

mod connect {
    use std::sync::Arc;

    use axum::{
        Json,
        extract::{Query, State},
    };
    use recoup_store::models::MetricType;
    use ring::constant_time;
    use tracing::{info, instrument, warn};

    use crate::{
        App,
        server::{
            auth::AuthedMerchant,
            error::ApiError,
            models::{
                AuthorizeResponse, CallbackQuery, ConnectedResponse,
                DisconnectedResponse,
            },
        },
    };

    /// `POST /pp/connect/authorize` - mint a CSRF state, persist it, and
    /// hand back the provider's consent URL.
    #[instrument(skip_all, name = "(connect-authorize)")]
    pub(crate) async fn authorize(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
    ) -> Result<Json<AuthorizeResponse>, ApiError> {
        let state = app.rng.gen_hex::<32>();
        app.store.set_oauth_state(merchant.id, &state).await?;
        let url = app.provider.authorize_url(&state);
        Ok(Json(AuthorizeResponse { url }))
    }

    /// `GET /pp/connect/callback?code&state`
    #[instrument(skip_all, name = "(connect-callback)")]
    pub(crate) async fn callback(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
        Query(query): Query<CallbackQuery>,
    ) -> Result<Json<ConnectedResponse>, ApiError> {
        let expected = merchant
            .oauth_state
            .as_deref()
            .ok_or_else(|| ApiError::forbidden("no connect in progress"))?;
        let state_ok = constant_time::verify_slices_are_equal(
            query.state.as_bytes(),
            expected.as_bytes(),
        )
        .is_ok();
        if !state_ok {
            warn!(merchant_id = %merchant.id,
                  "OAuth callback with mismatched state");
            return Err(ApiError::forbidden("state mismatch"));
        }

        let tokens =
            app.provider.oauth_exchange(&query.code).await.map_err(|e| {
                ApiError::bad_gateway(format!("token exchange failed: {e}"))
            })?;

        app.store
            .connect_merchant(
                merchant.id,
                &tokens.account_id,
                &tokens.access_token,
                tokens.refresh_token.as_deref(),
            )
            .await?;
        app.store
            .create_usage_log(
                merchant.id,
                &MetricType::MerchantConnected,
                1,
            )
            .await?;

        info!(merchant_id = %merchant.id, "Merchant connected to provider");
        Ok(Json(ConnectedResponse { connected: true }))
    }

    /// `POST /pp/disconnect` - ignores any request body; operates on the
    /// session merchant only. Provider-side teardown is best-effort, local
    /// credential wipe is not.
    #[instrument(skip_all, name = "(disconnect)")]
    pub(crate) async fn disconnect(
        State(app): State<Arc<App>>,
        AuthedMerchant(merchant): AuthedMerchant,
    ) -> Result<Json<DisconnectedResponse>, ApiError> {
        if let Some(account) = &merchant.pp_account_id {
            let tenant = app.provider.for_account(account);
            match tenant.list_active_subscriptions().await {
                Ok(subscriptions) => {
                    for subscription in subscriptions.data {
                        if let Err(e) =
                            tenant.cancel_subscription(&subscription.id).await
                        {
                            warn!(merchant_id = %merchant.id,
                                  subscription_id = %subscription.id,
                                  "Best-effort cancel failed: {e}");
                        }
                    }
                }
                Err(e) => warn!(merchant_id = %merchant.id,
                                "Could not list tenant subscriptions: {e}"),
            }

            if let Err(e) = app.provider.oauth_deauthorize(account).await {
                warn!(merchant_id = %merchant.id,
                      "OAuth deauthorize failed: {e}");
            }
        }

        app.store.disconnect_merchant(merchant.id).await?;
        let dropped = app
            .store
            .delete_open_tasks(&merchant.id.to_string())
            .await?;
        app.store
            .create_usage_log(
                merchant.id,
                &MetricType::MerchantDisconnected,
                1,
            )
            .await?;

        info!(merchant_id = %merchant.id, dropped_tasks = dropped,
              "Merchant disconnected");
        Ok(Json(DisconnectedResponse { disconnected: true }))
    }
}

mod admin {
    use std::sync::Arc;

    use axum::{
        Json,
        extract::{Path, State},
    };
    use tracing::{info, instrument};
    use uuid::Uuid;

    use crate::{
        App,
        server::{auth::AdminAuth, error::ApiError},
    };

    /// `DELETE /admin/merchants/:id` - GDPR erasure. Provider-side
    /// subscription teardown must succeed *before* any local delete;
    /// otherwise we'd keep billing a merchant whose data is gone.
    #[instrument(skip_all, name = "(admin-erase)")]
    pub(crate) async fn erase_merchant(
        State(app): State<Arc<App>>,
        _admin: AdminAuth,
        Path(merchant_id): Path<Uuid>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let merchant = app
            .store
            .merchant(merchant_id)
            .await?
            .ok_or_else(|| ApiError::not_found("no such merchant"))?;

        if let Some(account) = &merchant.pp_account_id {
            let tenant = app.provider.for_account(account);
            let subscriptions = tenant
                .list_active_subscriptions()
                .await
                .map_err(|e| {
                    ApiError::bad_gateway(format!(
                        "aborting erasure: cannot list subscriptions: {e}"
                    ))
                })?;
            for subscription in subscriptions.data {
                tenant
                    .cancel_subscription(&subscription.id)
                    .await
                    .map_err(|e| {
                        ApiError::bad_gateway(format!(
                            "aborting erasure: cancel of {} failed: {e}",
                            subscription.id
                        ))
                    })?;
            }
        }

        app.store.erase_merchant(merchant_id).await?;
        info!(%merchant_id, "Erased merchant");
        Ok(Json(serde_json::json!({ "erased": true })))
    }
}

mod worker_admin {
    use std::sync::Arc;

    use axum::{
        Json,
        extract::{Path, State},
    };
    use recoup_store::models::{Task, TaskStatus};
    use tracing::{info, instrument};
    use uuid::Uuid;

    use crate::{
        App,
        server::{
            auth::WorkerAuth, error::ApiError, models::CompleteTaskRequest,
        },
    };

    /// `POST /worker/claim` - external worker replicas claim through the
    /// same skip-locked protocol as the in-process loop.
    #[instrument(skip_all, name = "(worker-claim)")]
    pub(crate) async fn worker_claim(
        State(app): State<Arc<App>>,
        _auth: WorkerAuth,
    ) -> Result<Json<Option<Task>>, ApiError> {
        let task = app.store.claim_next_task().await?;
        Ok(Json(task))
    }

    /// `POST /worker/complete/:id` - record an external worker's outcome.
    /// This is the one path that carries real recovered cents today.
    #[instrument(skip_all, name = "(worker-complete)")]
    pub(crate) async fn worker_complete(
        State(app): State<Arc<App>>,
        _auth: WorkerAuth,
        Path(task_id): Path<i64>,
        Json(req): Json<CompleteTaskRequest>,
    ) -> Result<Json<Task>, ApiError> {
        if !matches!(
            req.status,
            TaskStatus::Completed | TaskStatus::Failed
        ) {
            return Err(ApiError::bad_request(
                "status must be completed or failed",
            ));
        }

        let task = app
            .store
            .task(task_id)
            .await?
            .ok_or_else(|| ApiError::not_found("no such task"))?;

        app.store.update_task_status(task_id, req.status).await?;

        if req.status == TaskStatus::Completed {
            if let (Some(cents), Ok(merchant_id)) = (
                req.recovered_cents,
                Uuid::parse_str(&task.merchant_id),
            ) {
                if cents != 0 {
                    app.store
                        .add_recovered_cents(merchant_id, cents)
                        .await?;
                }
            }
        }

        info!(task_id, status = %req.status, "Worker recorded task outcome");
        let task = app
            .store
            .task(task_id)
            .await?
            .ok_or_else(|| ApiError::not_found("no such task"))?;
        Ok(Json(task))
    }
}
