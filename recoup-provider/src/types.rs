//! Wire types for the subset of the provider API we call.

use serde::Deserialize;

/// An invoice fetched via the tenant-scoped client.
#[derive(Clone, Debug, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub status: InvoiceStatus,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub attempt_count: Option<u32>,
}

fn default_currency() -> String {
    "usd".to_owned()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
    /// Forward-compat: statuses this build doesn't know about.
    #[serde(other)]
    Unknown,
}

impl InvoiceStatus {
    /// Nothing left to recover: the invoice was settled or written off.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Paid | Self::Void)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionList {
    pub data: Vec<Subscription>,
}

/// Response to the OAuth authorization-code exchange.
#[derive(Clone, Debug, Deserialize)]
pub struct OAuthTokens {
    pub account_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invoice_parses_with_sparse_fields() {
        let invoice: Invoice = serde_json::from_str(
            r#"{"id": "in_123", "status": "open"}"#,
        )
        .unwrap();
        assert_eq!(invoice.id, "in_123");
        assert_eq!(invoice.status, InvoiceStatus::Open);
        assert_eq!(invoice.customer_email, None);
        assert_eq!(invoice.currency, "usd");
        assert!(!invoice.status.is_settled());
    }

    #[test]
    fn unknown_invoice_status_does_not_fail_parsing() {
        let invoice: Invoice = serde_json::from_str(
            r#"{"id": "in_1", "status": "some_future_status"}"#,
        )
        .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Unknown);
    }

    #[test]
    fn settled_statuses() {
        assert!(InvoiceStatus::Paid.is_settled());
        assert!(InvoiceStatus::Void.is_settled());
        assert!(!InvoiceStatus::Open.is_settled());
        assert!(!InvoiceStatus::Uncollectible.is_settled());
    }
}
