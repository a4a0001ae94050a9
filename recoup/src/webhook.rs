//! Webhook ingress: signature verification, idempotency locking, and event
//! routing.
//!
//! The handler mutates nothing until the event id lock is held; a losing
//! concurrent delivery (the provider retries on non-2xx, and retries race)
//! returns `200 ignored` with no side effects.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    Json,
    extract::{ConnectInfo, State},
};
use bytes::Bytes;
use chrono::Utc;
use http::HeaderMap;
use recoup_common::plan::FREE_PLAN_ID;
use recoup_provider::webhook::{
    Event, InvoiceObject, SIGNATURE_HEADER, SubscriptionObject,
};
use recoup_store::models::{Merchant, MetricType, TaskType};
use tracing::{debug, info, warn};

use crate::{App, server::error::ApiError};

/// Per-IP fixed-window limit on webhook deliveries.
const RATE_LIMIT_MAX: u32 = 5;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// The invoice billing reason in scope for recovery: renewals only.
const BILLING_REASON_RENEWAL: &str = "subscription_cycle";

// --- Retry schedule --- //

/// Dunning retry delay by provider attempt count: 1 -> 3d, 2 -> 5d,
/// 3 -> 7d, anything else -> 7d. Offsets are wall-clock from ingress time.
pub(crate) fn retry_delay(attempt_count: u32) -> chrono::Duration {
    match attempt_count {
        1 => chrono::Duration::days(3),
        2 => chrono::Duration::days(5),
        _ => chrono::Duration::days(7),
    }
}

// --- Rate limiting --- //

/// Process-local fixed-window rate limiter. This is throttling, not
/// coordination: replicas each enforce their own window, which is fine for
/// abuse protection.
pub(crate) struct RateLimiter {
    max: u32,
    window: Duration,
    state: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    pub(crate) fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn for_webhooks() -> Self {
        Self::new(RATE_LIMIT_MAX, RATE_LIMIT_WINDOW)
    }

    /// Record a hit from `ip`; returns false when over the limit.
    pub(crate) fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().expect("Rate limiter poisoned");

        // Drop expired windows so the map doesn't grow without bound.
        state.retain(|_, (start, _)| now.duration_since(*start) < self.window);

        let (start, count) = state.entry(ip).or_insert((now, 0));
        if now.duration_since(*start) >= self.window {
            *start = now;
            *count = 0;
        }
        *count += 1;
        *count <= self.max
    }
}

// --- Routing --- //

/// What the ingress decided to do with an event. Pure decision; the handler
/// performs the side effects after the idempotency lock is held.
#[derive(Clone, Debug)]
pub(crate) enum Route {
    /// Renewal failed: enqueue a dunning retry on the attempt schedule.
    ScheduleDunning { account: String, invoice: InvoiceObject },
    /// SCA / 3DS required: notify the customer immediately.
    NotifyActionRequired { account: String, invoice: InvoiceObject },
    /// A tenant's subscriber churned.
    RecordChurn { account: String },
    /// Platform-side subscription lifecycle: sync the merchant's plan.
    SyncPlan { subscription: SubscriptionObject },
    /// Sentinel recovery-success path (amount parked at zero).
    RecordRecovery { account: String, invoice: InvoiceObject },
    Ignore(&'static str),
}

pub(crate) fn route_event(event: &Event) -> Route {
    match event.event_type.as_str() {
        "invoice.payment_failed" => {
            let Some(account) = event.account.clone() else {
                return Route::Ignore("invoice event without tenant account");
            };
            let invoice: InvoiceObject = match event.object() {
                Ok(invoice) => invoice,
                Err(_) => return Route::Ignore("malformed invoice object"),
            };
            // Only renewals are in scope for recovery; first charges,
            // updates, and manual invoices are the merchant's own flows.
            if invoice.billing_reason.as_deref()
                != Some(BILLING_REASON_RENEWAL)
            {
                return Route::Ignore("billing reason out of scope");
            }
            Route::ScheduleDunning { account, invoice }
        }
        "invoice.payment_action_required" => {
            let Some(account) = event.account.clone() else {
                return Route::Ignore("invoice event without tenant account");
            };
            match event.object() {
                Ok(invoice) =>
                    Route::NotifyActionRequired { account, invoice },
                Err(_) => Route::Ignore("malformed invoice object"),
            }
        }
        "invoice.payment_succeeded" => {
            let Some(account) = event.account.clone() else {
                return Route::Ignore("invoice event without tenant account");
            };
            match event.object() {
                Ok(invoice) => Route::RecordRecovery { account, invoice },
                Err(_) => Route::Ignore("malformed invoice object"),
            }
        }
        "customer.subscription.deleted" => match event.account.clone() {
            Some(account) => Route::RecordChurn { account },
            None => Route::Ignore("churn event without tenant account"),
        },
        "customer.subscription.created"
        | "customer.subscription.updated" => {
            // Trust boundary: subscription events carrying a tenant account
            // id describe the *tenant's* subscribers and must never mutate
            // platform billing state.
            if event.account.is_some() {
                return Route::Ignore("tenant-side subscription event");
            }
            match event.object() {
                Ok(subscription) => Route::SyncPlan { subscription },
                Err(_) =>
                    Route::Ignore("malformed subscription object"),
            }
        }
        _ => Route::Ignore("unhandled event type"),
    }
}

// --- Handler --- //

/// `POST /webhooks/pp`
pub(crate) async fn handle(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !app.webhook_rate_limiter.allow(addr.ip()) {
        warn!(ip = %addr.ip(), "Webhook rate limit exceeded");
        return Err(ApiError::too_many_requests("rate limit exceeded"));
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("missing signature header"))?;

    if let Err(e) =
        app.webhook_verifier.verify(signature, &body, Utc::now())
    {
        // Security event: either misconfiguration or someone probing us.
        warn!(ip = %addr.ip(), "Webhook signature rejected: {e}");
        return Err(ApiError::bad_request("invalid signature"));
    }

    let event = Event::parse(&body)
        .map_err(|_| ApiError::bad_request("malformed event body"))?;

    // First writer wins; everyone else must not touch anything.
    let lock_acquired = app.store.attempt_event_lock(&event.id).await?;
    if !lock_acquired {
        debug!(event_id = %event.id, "Duplicate event delivery ignored");
        return Ok(Json(serde_json::json!({ "ignored": true })));
    }

    match route_event(&event) {
        Route::ScheduleDunning { account, invoice } => {
            let Some(merchant) =
                merchant_for_account(&app, &account).await?
            else {
                return Ok(Json(serde_json::json!({ "ignored": true })));
            };

            let attempt = invoice.attempt_count.unwrap_or(1);
            let run_at = Utc::now() + retry_delay(attempt);
            let task = app
                .store
                .enqueue_task(
                    &merchant.id.to_string(),
                    TaskType::DunningRetry,
                    serde_json::json!({
                        "invoiceId": invoice.id,
                        "attemptCount": attempt,
                    }),
                    run_at,
                )
                .await?;
            app.store
                .create_usage_log(
                    merchant.id,
                    &MetricType::TaskScheduled,
                    1,
                )
                .await?;

            info!(
                event_id = %event.id,
                merchant_id = %merchant.id,
                task_id = task.id,
                invoice_id = %invoice.id,
                attempt,
                %run_at,
                "Scheduled dunning retry"
            );
        }
        Route::NotifyActionRequired { account, invoice } => {
            let Some(merchant) =
                merchant_for_account(&app, &account).await?
            else {
                return Ok(Json(serde_json::json!({ "ignored": true })));
            };

            app.store
                .enqueue_task(
                    &merchant.id.to_string(),
                    TaskType::NotifyActionRequired,
                    serde_json::json!({
                        "invoiceId": invoice.id,
                        "hostedInvoiceUrl": invoice.hosted_invoice_url,
                    }),
                    Utc::now(),
                )
                .await?;
            app.store
                .create_usage_log(
                    merchant.id,
                    &MetricType::ActionRequiredNotification,
                    1,
                )
                .await?;

            info!(event_id = %event.id, merchant_id = %merchant.id,
                  invoice_id = %invoice.id,
                  "Enqueued action-required notification");
        }
        Route::RecordChurn { account } => {
            let Some(merchant) =
                merchant_for_account(&app, &account).await?
            else {
                return Ok(Json(serde_json::json!({ "ignored": true })));
            };
            app.store
                .create_usage_log(
                    merchant.id,
                    &MetricType::SubscriptionChurned,
                    1,
                )
                .await?;
            info!(event_id = %event.id, merchant_id = %merchant.id,
                  "Recorded subscriber churn");
        }
        Route::SyncPlan { subscription } => {
            sync_plan(&app, &event.id, &subscription).await?;
        }
        Route::RecordRecovery { account, invoice } => {
            let Some(merchant) =
                merchant_for_account(&app, &account).await?
            else {
                return Ok(Json(serde_json::json!({ "ignored": true })));
            };
            app.store
                .create_usage_log(
                    merchant.id,
                    &MetricType::RecoverySuccess,
                    1,
                )
                .await?;
            // Amount intentionally parked at zero until the recovery-amount
            // semantics are settled; see the worker-complete endpoint for
            // the path that does carry cents today.
            app.store.add_recovered_cents(merchant.id, 0).await?;
            info!(event_id = %event.id, merchant_id = %merchant.id,
                  invoice_id = %invoice.id, "Recorded recovery success");
        }
        Route::Ignore(reason) => {
            debug!(event_id = %event.id, reason, "Ignoring event");
            return Ok(Json(serde_json::json!({ "ignored": true })));
        }
    }

    Ok(Json(serde_json::json!({ "received": true })))
}

async fn merchant_for_account(
    app: &App,
    account: &str,
) -> Result<Option<Merchant>, ApiError> {
    let merchant = app.store.merchant_by_pp_account(account).await?;
    if merchant.is_none() {
        warn!(account, "Event for unknown connected account");
    }
    Ok(merchant)
}

/// Platform subscription lifecycle: active/trialing pins the merchant to
/// the subscribed price; anything else demotes to the free plan.
async fn sync_plan(
    app: &App,
    event_id: &str,
    subscription: &SubscriptionObject,
) -> Result<(), ApiError> {
    let Some(customer) = &subscription.customer else {
        debug!(event_id, "Subscription event without customer; ignoring");
        return Ok(());
    };

    let plan_id = match subscription.status.as_str() {
        "active" | "trialing" => subscription
            .price
            .as_ref()
            .map(|price| price.id.as_str())
            .unwrap_or(FREE_PLAN_ID),
        _ => FREE_PLAN_ID,
    };

    let updated =
        app.store.set_plan_by_pp_customer(customer, plan_id).await?;
    if updated {
        info!(event_id, customer, plan_id, "Synced merchant plan");
    } else {
        debug!(event_id, customer, "No merchant for platform customer");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_schedule_matches_attempt_counts() {
        assert_eq!(retry_delay(1), chrono::Duration::days(3));
        assert_eq!(retry_delay(2), chrono::Duration::days(5));
        assert_eq!(retry_delay(3), chrono::Duration::days(7));
        assert_eq!(retry_delay(4), chrono::Duration::days(7));
        assert_eq!(retry_delay(0), chrono::Duration::days(7));
    }

    #[test]
    fn rate_limiter_enforces_fixed_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let other: IpAddr = "203.0.113.8".parse().unwrap();

        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
        // Other IPs have their own window.
        assert!(limiter.allow(other));
    }

    #[test]
    fn rate_limiter_window_resets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.allow(ip));
    }

    fn event(json: serde_json::Value) -> Event {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn renewal_failure_schedules_dunning() {
        let event = event(serde_json::json!({
            "id": "evt_1",
            "type": "invoice.payment_failed",
            "account": "acct_A",
            "data": {"object": {
                "id": "in_1",
                "billing_reason": "subscription_cycle",
                "attempt_count": 1,
            }},
        }));
        match route_event(&event) {
            Route::ScheduleDunning { account, invoice } => {
                assert_eq!(account, "acct_A");
                assert_eq!(invoice.id, "in_1");
                assert_eq!(invoice.attempt_count, Some(1));
            }
            other => panic!("expected ScheduleDunning, got {other:?}"),
        }
    }

    #[test]
    fn non_renewal_billing_reasons_are_ignored() {
        let event = event(serde_json::json!({
            "id": "evt_2",
            "type": "invoice.payment_failed",
            "account": "acct_A",
            "data": {"object": {
                "id": "in_1",
                "billing_reason": "subscription_create",
            }},
        }));
        assert!(matches!(route_event(&event), Route::Ignore(_)));
    }

    #[test]
    fn tenant_side_subscription_events_never_sync_plans() {
        let event = event(serde_json::json!({
            "id": "evt_3",
            "type": "customer.subscription.updated",
            "account": "acct_A",
            "data": {"object": {
                "id": "sub_1",
                "status": "active",
                "customer": "cus_1",
                "price": {"id": "price_scale"},
            }},
        }));
        assert!(matches!(route_event(&event), Route::Ignore(_)));
    }

    #[test]
    fn platform_subscription_events_sync_plans() {
        let event = event(serde_json::json!({
            "id": "evt_4",
            "type": "customer.subscription.updated",
            "data": {"object": {
                "id": "sub_1",
                "status": "active",
                "customer": "cus_1",
                "price": {"id": "price_growth"},
            }},
        }));
        match route_event(&event) {
            Route::SyncPlan { subscription } => {
                assert_eq!(subscription.customer.as_deref(), Some("cus_1"));
                assert_eq!(subscription.price.unwrap().id, "price_growth");
            }
            other => panic!("expected SyncPlan, got {other:?}"),
        }
    }

    #[test]
    fn action_required_and_churn_route() {
        {
            let event = event(serde_json::json!({
                "id": "evt_5",
                "type": "invoice.payment_action_required",
                "account": "acct_B",
                "data": {"object": {
                    "id": "in_9",
                    "hosted_invoice_url": "https://pay.example/in_9",
                }},
            }));
            assert!(matches!(
                route_event(&event),
                Route::NotifyActionRequired { .. }
            ));
        }

        let event = event(serde_json::json!({
            "id": "evt_6",
            "type": "customer.subscription.deleted",
            "account": "acct_B",
            "data": {"object": {"id": "sub_2", "status": "canceled"}},
        }));
        assert!(matches!(route_event(&event), Route::RecordChurn { .. }));
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let event = event(serde_json::json!({
            "id": "evt_7",
            "type": "charge.refunded",
            "data": {"object": {}},
        }));
        assert!(matches!(route_event(&event), Route::Ignore(_)));
    }
}
