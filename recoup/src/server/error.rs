//! The API error type and its HTTP mapping.
//!
//! Every handler returns `Result<_, ApiError>`; the [`IntoResponse`] impl
//! produces the JSON error body. Internal errors are logged with their full
//! context chain and sanitized to a bare "Internal Server Error" outside of
//! dev.

use std::sync::OnceLock;

use axum::{Json, response::IntoResponse};
use http::StatusCode;
use recoup_common::env::DeployEnv;
use recoup_store::StoreError;
use serde::Serialize;
use tracing::{error, warn};

/// The deploy environment, set once at startup; gates 500-message
/// sanitization.
static DEPLOY_ENV: OnceLock<DeployEnv> = OnceLock::new();

pub fn set_deploy_env(deploy_env: DeployEnv) {
    let _ = DEPLOY_ENV.set(deploy_env);
}

fn is_dev() -> bool {
    DEPLOY_ENV.get().copied().unwrap_or(DeployEnv::Dev).is_dev()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ApiErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    /// Monthly quota exhausted.
    PaymentRequired,
    /// Queue overflow / rate limit.
    TooManyRequests,
    /// An upstream dependency failed in a way we must not paper over.
    BadGateway,
    Internal,
}

impl ApiErrorKind {
    fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::BadGateway => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub msg: String,
}

/// The JSON error body sent over the wire.
#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    msg: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest,
            msg: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized,
            msg: msg.into(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Forbidden,
            msg: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::NotFound,
            msg: msg.into(),
        }
    }

    pub fn payment_required(msg: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::PaymentRequired,
            msg: msg.into(),
        }
    }

    pub fn too_many_requests(msg: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::TooManyRequests,
            msg: msg.into(),
        }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::BadGateway,
            msg: msg.into(),
        }
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        Self {
            kind: ApiErrorKind::Internal,
            msg: format!("{err:#}"),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.kind.status();

        let msg = match self.kind {
            ApiErrorKind::Internal => {
                // Log the full chain; clients outside dev get a sanitized
                // message.
                error!("Internal API error: {msg}", msg = self.msg);
                if is_dev() {
                    self.msg
                } else {
                    "Internal Server Error".to_owned()
                }
            }
            _ => {
                warn!(status = %status, "API error: {msg}", msg = self.msg);
                self.msg
            }
        };

        let body = ErrorBody {
            code: status.as_u16(),
            msg,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(
            ApiError::bad_request("x").kind.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::payment_required("x").kind.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ApiError::too_many_requests("x").kind.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::bad_gateway("x").kind.status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
