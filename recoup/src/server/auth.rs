//! Request authentication extractors.
//!
//! The authentication provider fronts this service and injects an opaque
//! user id (and optionally an email) on every authenticated request. The
//! [`AuthedMerchant`] extractor resolves that identity to a merchant row,
//! auto-provisioning a FREE-plan merchant on first contact.
//!
//! Worker-admin and admin endpoints authenticate with shared secrets
//! compared in constant time.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use chrono::Utc;
use http::request::Parts;
use recoup_store::models::{Merchant, TaskType};
use ring::constant_time;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::{App, server::error::ApiError};

/// Set by the auth provider on every authenticated request.
const AUTH_USER_HEADER: &str = "x-auth-user-id";
/// Optional; also set by the auth provider.
const AUTH_EMAIL_HEADER: &str = "x-auth-email";

/// Shared-secret headers for machine endpoints.
const WORKER_SECRET_HEADER: &str = "x-worker-secret";
const ADMIN_KEY_HEADER: &str = "x-admin-key";

fn header<'p>(parts: &'p Parts, name: &str) -> Option<&'p str> {
    parts.headers.get(name).and_then(|value| value.to_str().ok())
}

/// Timing-safe comparison of a presented secret against the configured one.
fn secrets_match(presented: &str, expected: &str) -> bool {
    constant_time::verify_slices_are_equal(
        presented.as_bytes(),
        expected.as_bytes(),
    )
    .is_ok()
}

// --- AuthedMerchant --- //

/// The merchant bound to the authenticated user, provisioned on demand.
pub struct AuthedMerchant(pub Merchant);

impl FromRequestParts<Arc<App>> for AuthedMerchant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        app: &Arc<App>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, AUTH_USER_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing auth identity"))?
            .to_owned();
        let email = header(parts, AUTH_EMAIL_HEADER).map(str::to_owned);

        let (merchant, created) = app
            .store
            .provision_merchant(&user_id, email.as_deref())
            .await?;

        if created {
            info!(merchant_id = %merchant.id,
                  "Auto-provisioned merchant on first authenticated request");
            // Start the merchant's weekly digest chain right away instead of
            // waiting for the next restart's watchdog pass.
            app.store
                .enqueue_task(
                    &merchant.id.to_string(),
                    TaskType::SendWeeklyDigest,
                    serde_json::json!({}),
                    Utc::now(),
                )
                .await?;
        } else {
            debug!(merchant_id = %merchant.id, "Resolved merchant");
        }

        Ok(Self(merchant))
    }
}

// --- WorkerAuth --- //

/// Proof that the request presented the worker shared secret.
pub struct WorkerAuth;

impl FromRequestParts<Arc<App>> for WorkerAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        app: &Arc<App>,
    ) -> Result<Self, Self::Rejection> {
        let presented = header(parts, WORKER_SECRET_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing worker secret"))?;
        let expected = app.config.worker_secret.expose_secret();
        if !secrets_match(presented, expected) {
            return Err(ApiError::unauthorized("bad worker secret"));
        }
        Ok(Self)
    }
}

// --- AdminAuth --- //

/// Proof that the request presented the admin key.
pub struct AdminAuth;

impl FromRequestParts<Arc<App>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        app: &Arc<App>,
    ) -> Result<Self, Self::Rejection> {
        let presented = header(parts, ADMIN_KEY_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing admin key"))?;
        let expected = app.config.admin_key.expose_secret();
        if !secrets_match(presented, expected) {
            return Err(ApiError::unauthorized("bad admin key"));
        }
        Ok(Self)
    }
}
