//! Provider error taxonomy.
//!
//! The reporter and the worker need to tell three outcomes apart:
//!
//! - **transient** (network, 5xx, rate limit): leave the unit of work alone
//!   and let the next cycle retry it;
//! - **permanent** (4xx, `invalid_request`, `resource_*`): the request will
//!   never succeed, so the offending unit is marked done to isolate the
//!   poison pill;
//! - **idempotency replay** (`idempotency_key_in_use`): the work already
//!   landed on a previous attempt, which counts as success.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport-level failure: connect, timeout, body read, TLS.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-success status.
    #[error("provider returned {status}{}: {message}", code_suffix(.code))]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
}

fn code_suffix(code: &Option<String>) -> String {
    match code {
        Some(code) => format!(" ({code})"),
        None => String::new(),
    }
}

impl ProviderError {
    /// Worth retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
        }
    }

    /// Will never succeed; callers should isolate the offending unit.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Http(_) => false,
            Self::Api { status, code, .. } => {
                let client_error =
                    (400..500).contains(status) && *status != 429;
                let permanent_code = code.as_deref().is_some_and(|code| {
                    code == "invalid_request_error"
                        || code.starts_with("resource_")
                });
                client_error || permanent_code
            }
        }
    }

    /// The idempotency key was already consumed: a previous attempt landed.
    /// Check this *before* [`is_permanent`](Self::is_permanent); a replay is
    /// also a 4xx.
    pub fn is_idempotency_replay(&self) -> bool {
        matches!(
            self,
            Self::Api { code: Some(code), .. }
                if code == "idempotency_key_in_use"
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn api(status: u16, code: Option<&str>) -> ProviderError {
        ProviderError::Api {
            status,
            code: code.map(str::to_owned),
            message: "test".to_owned(),
        }
    }

    #[test]
    fn server_errors_and_rate_limits_are_transient() {
        assert!(api(500, None).is_transient());
        assert!(api(503, None).is_transient());
        assert!(api(429, Some("rate_limit")).is_transient());
        assert!(!api(500, None).is_permanent());
        assert!(!api(429, None).is_permanent());
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(api(400, Some("invalid_request_error")).is_permanent());
        assert!(api(404, Some("resource_missing")).is_permanent());
        assert!(api(422, None).is_permanent());
        assert!(!api(400, None).is_transient());
    }

    #[test]
    fn idempotency_replay_is_detected_before_permanence() {
        let replay = api(400, Some("idempotency_key_in_use"));
        assert!(replay.is_idempotency_replay());
        // Also reads as permanent, which is why callers check replay first.
        assert!(replay.is_permanent());
        assert!(!api(400, Some("resource_missing")).is_idempotency_replay());
    }
}
