//! Webhook signature verification and event envelope parsing.
//!
//! The provider signs each delivery with a header of the form
//! `t=<unix-seconds>,v1=<hex-hmac>[,v1=<hex-hmac>...]` where the HMAC-SHA256
//! is computed over `"{t}.{raw_body}"` with the shared webhook secret.
//! Multiple `v1` entries appear during secret rotation; any one matching
//! accepts the delivery. The timestamp bounds replay of captured deliveries.

use chrono::{DateTime, Utc};
use ring::hmac;
use serde::Deserialize;
use thiserror::Error;

/// Header carrying the signature on `POST /webhooks/pp`.
pub const SIGNATURE_HEADER: &str = "pp-signature";

/// Maximum allowed skew between the signature timestamp and our clock.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Timestamp,
    #[error("no signature matched the payload")]
    Mismatch,
}

/// Verifies webhook signatures against the configured shared secret.
pub struct WebhookVerifier {
    key: hmac::Key,
}

impl WebhookVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    pub fn verify(
        &self,
        header: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();

        for part in header.split(',') {
            let (key, value) =
                part.trim().split_once('=').ok_or(SignatureError::Malformed)?;
            match key {
                "t" => {
                    let t = value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::Malformed)?;
                    timestamp = Some(t);
                }
                "v1" => {
                    let sig = hex::decode(value)
                        .map_err(|_| SignatureError::Malformed)?;
                    candidates.push(sig);
                }
                // Ignore unknown schemes (e.g. deprecated v0 entries).
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
        if candidates.is_empty() {
            return Err(SignatureError::Malformed);
        }

        let skew = (now.timestamp() - timestamp).abs();
        if skew > TIMESTAMP_TOLERANCE_SECS {
            return Err(SignatureError::Timestamp);
        }

        // signed payload := "{t}.{raw_body}"
        let mut signed = Vec::with_capacity(24 + body.len());
        signed.extend_from_slice(timestamp.to_string().as_bytes());
        signed.push(b'.');
        signed.extend_from_slice(body);

        // ring::hmac::verify is constant-time.
        let matched = candidates
            .iter()
            .any(|sig| hmac::verify(&self.key, &signed, sig).is_ok());
        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Produce a valid header for `body` at `at`. For tests and local tools.
    pub fn sign(&self, body: &[u8], at: DateTime<Utc>) -> String {
        let t = at.timestamp();
        let mut signed = Vec::with_capacity(24 + body.len());
        signed.extend_from_slice(t.to_string().as_bytes());
        signed.push(b'.');
        signed.extend_from_slice(body);
        let tag = hmac::sign(&self.key, &signed);
        format!("t={t},v1={}", hex::encode(tag.as_ref()))
    }
}

// --- Event envelope --- //

/// The parsed webhook envelope. `data.object` stays untyped until the router
/// has decided which typed object to extract.
#[derive(Clone, Debug, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// The connected (tenant) account that originated the event, if any.
    /// Its presence is a trust boundary: tenant-side subscription events
    /// must never mutate platform billing state.
    #[serde(default)]
    pub account: Option<String>,
    pub data: EventData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl Event {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Deserialize `data.object` as a typed payload.
    pub fn object<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.object.clone())
    }
}

/// `data.object` of `invoice.*` events.
#[derive(Clone, Debug, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub attempt_count: Option<u32>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
}

/// `data.object` of `customer.subscription.*` events.
#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub price: Option<PriceRef>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

#[cfg(test)]
mod test {
    use super::*;

    const SECRET: &[u8] = b"whsec_test_secret";

    #[test]
    fn valid_signature_verifies() {
        let verifier = WebhookVerifier::new(SECRET);
        let body = br#"{"id":"evt_1","type":"invoice.payment_failed"}"#;
        let now = Utc::now();
        let header = verifier.sign(body, now);
        verifier.verify(&header, body, now).unwrap();
    }

    #[test]
    fn rotated_secrets_accept_any_matching_v1() {
        let old = WebhookVerifier::new(b"whsec_old");
        let new = WebhookVerifier::new(SECRET);
        let body = b"{}";
        let now = Utc::now();

        // Header carries signatures from both secrets during rotation.
        let t = now.timestamp();
        let old_sig = old.sign(body, now);
        let new_sig = new.sign(body, now);
        let old_hex = old_sig.split("v1=").nth(1).unwrap();
        let new_hex = new_sig.split("v1=").nth(1).unwrap();
        let header = format!("t={t},v1={old_hex},v1={new_hex}");

        new.verify(&header, body, now).unwrap();
        old.verify(&header, body, now).unwrap();
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let other = WebhookVerifier::new(b"whsec_other");
        let body = b"{}";
        let now = Utc::now();
        let header = other.sign(body, now);
        assert_eq!(
            verifier.verify(&header, body, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let now = Utc::now();
        let header = verifier.sign(b"{}", now);
        assert_eq!(
            verifier.verify(&header, b"{ }", now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let body = b"{}";
        let then = Utc::now() - chrono::Duration::seconds(600);
        let header = verifier.sign(body, then);
        assert_eq!(
            verifier.verify(&header, body, Utc::now()),
            Err(SignatureError::Timestamp)
        );
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let now = Utc::now();
        for header in [
            "",
            "t=abc,v1=00",
            "v1=00",
            "t=123",
            "t=123,v1=not-hex",
        ] {
            assert_eq!(
                verifier.verify(header, b"{}", now),
                Err(SignatureError::Malformed),
                "header {header:?} should be malformed"
            );
        }
    }

    #[test]
    fn envelope_and_objects_parse() {
        let body = br#"{
            "id": "evt_1",
            "type": "invoice.payment_failed",
            "account": "acct_A",
            "data": {
                "object": {
                    "id": "in_1",
                    "billing_reason": "subscription_cycle",
                    "attempt_count": 1
                }
            }
        }"#;
        let event = Event::parse(body).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "invoice.payment_failed");
        assert_eq!(event.account.as_deref(), Some("acct_A"));

        let invoice: InvoiceObject = event.object().unwrap();
        assert_eq!(invoice.id, "in_1");
        assert_eq!(invoice.billing_reason.as_deref(), Some("subscription_cycle"));
        assert_eq!(invoice.attempt_count, Some(1));

        let sub_body = br#"{
            "id": "evt_2",
            "type": "customer.subscription.updated",
            "data": {
                "object": {
                    "id": "sub_1",
                    "status": "active",
                    "customer": "cus_9",
                    "price": {"id": "price_growth"}
                }
            }
        }"#;
        let event = Event::parse(sub_body).unwrap();
        assert_eq!(event.account, None);
        let sub: SubscriptionObject = event.object().unwrap();
        assert_eq!(sub.status, "active");
        assert_eq!(sub.price.unwrap().id, "price_growth");
    }
}
