//! REST client for the payment provider (PP).
//!
//! Two scopes exist:
//!
//! - the **platform** client authenticates as us and is used for meter
//!   events, OAuth token exchange, and deauthorization;
//! - a **tenant-scoped** client ([`ProviderClient::for_account`]) adds the
//!   `PP-Account` header so invoice and subscription calls run against the
//!   merchant's connected account.
//!
//! All calls run under a bounded timeout; a timeout surfaces as a transient
//! [`ProviderError`] and is tolerated by the callers' retry paths.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::debug;

pub mod webhook;

mod error;
mod types;

pub use error::ProviderError;
pub use types::{
    Invoice, InvoiceStatus, OAuthTokens, Subscription, SubscriptionList,
};

/// Outbound calls to the provider (and our email gateway) must not hang the
/// worker; 10s is comfortably above the provider's p99.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Header selecting the connected account a call is scoped to.
const ACCOUNT_HEADER: &str = "pp-account";
/// Header carrying the caller-supplied idempotency key.
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub client_id: String,
    pub secret_key: SecretString,
}

/// Body of the provider's error envelope: `{"error": {code, message}}`.
#[derive(serde::Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    secret_key: SecretString,
    /// `Some` for tenant-scoped clients.
    account: Option<String>,
}

impl ProviderClient {
    /// Build the platform-scoped client.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            client_id: config.client_id.clone(),
            secret_key: config.secret_key.clone(),
            account: None,
        })
    }

    /// A tenant-scoped clone of this client. Shares the connection pool.
    pub fn for_account(&self, pp_account_id: &str) -> Self {
        Self {
            account: Some(pp_account_id.to_owned()),
            ..self.clone()
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(self.secret_key.expose_secret());
        if let Some(account) = &self.account {
            builder = builder.header(ACCOUNT_HEADER, account);
        }
        builder
    }

    /// Send the request and decode a success body, or classify the failure.
    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ProviderError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        // Pull code/message out of the error envelope if there is one.
        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&body)
        {
            Ok(envelope) => (
                envelope.error.code,
                envelope.error.message.unwrap_or(body),
            ),
            Err(_) => (None, body),
        };
        Err(ProviderError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    // --- Invoices (tenant-scoped) --- //

    pub async fn get_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Invoice, ProviderError> {
        debug!(%invoice_id, "Fetching invoice");
        self.send(
            self.request(
                reqwest::Method::GET,
                &format!("/v1/invoices/{invoice_id}"),
            ),
        )
        .await
    }

    // --- Metered billing (platform-scoped) --- //

    /// Push one meter event for a platform customer. The idempotency key
    /// makes duplicate uploads harmless.
    pub async fn post_meter_event(
        &self,
        customer_id: &str,
        event_name: &str,
        value: i64,
        idempotency_key: &str,
    ) -> Result<(), ProviderError> {
        debug!(%customer_id, event_name, value, "Posting meter event");
        let _: serde_json::Value = self
            .send(
                self.request(reqwest::Method::POST, "/v1/billing/meter_events")
                    .header(IDEMPOTENCY_HEADER, idempotency_key)
                    .json(&serde_json::json!({
                        "event_name": event_name,
                        "customer_id": customer_id,
                        "value": value,
                    })),
            )
            .await?;
        Ok(())
    }

    // --- OAuth (platform-scoped) --- //

    pub async fn oauth_exchange(
        &self,
        code: &str,
    ) -> Result<OAuthTokens, ProviderError> {
        self.send(
            self.request(reqwest::Method::POST, "/v1/oauth/token").json(
                &serde_json::json!({
                    "grant_type": "authorization_code",
                    "client_id": self.client_id,
                    "code": code,
                }),
            ),
        )
        .await
    }

    pub async fn oauth_deauthorize(
        &self,
        pp_account_id: &str,
    ) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .send(
                self.request(reqwest::Method::POST, "/v1/oauth/deauthorize")
                    .json(&serde_json::json!({
                        "client_id": self.client_id,
                        "account_id": pp_account_id,
                    })),
            )
            .await?;
        Ok(())
    }

    /// The provider-hosted OAuth consent URL the merchant is sent to.
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/oauth/authorize?response_type=code\
             &client_id={}&scope=read_write&state={state}",
            self.base_url, self.client_id,
        )
    }

    // --- Subscriptions (tenant-scoped) --- //

    pub async fn list_active_subscriptions(
        &self,
    ) -> Result<SubscriptionList, ProviderError> {
        self.send(self.request(
            reqwest::Method::GET,
            "/v1/subscriptions?status=active",
        ))
        .await
    }

    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .send(self.request(
                reqwest::Method::DELETE,
                &format!("/v1/subscriptions/{subscription_id}"),
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn client() -> ProviderClient {
        ProviderClient::new(&ProviderConfig {
            base_url: "https://api.pp.example/".to_owned(),
            client_id: "ca_test".to_owned(),
            secret_key: SecretString::new("sk_test_123".to_owned()),
        })
        .unwrap()
    }

    #[test]
    fn base_url_is_normalized() {
        let client = client();
        assert_eq!(client.base_url, "https://api.pp.example");
    }

    #[test]
    fn authorize_url_carries_state_and_client_id() {
        let url = client().authorize_url("deadbeef");
        assert!(url.starts_with("https://api.pp.example/oauth/authorize?"));
        assert!(url.contains("client_id=ca_test"));
        assert!(url.contains("state=deadbeef"));
    }

    #[test]
    fn for_account_scopes_without_mutating_parent() {
        let platform = client();
        let tenant = platform.for_account("acct_A");
        assert_eq!(tenant.account.as_deref(), Some("acct_A"));
        assert!(platform.account.is_none());
    }
}
