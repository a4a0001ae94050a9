//! The email gateway client and the dunning / notification / digest
//! rendering pipeline.
//!
//! Rendering never trusts its inputs: template bodies are sanitized against
//! a fixed HTML allowlist when merchants save them, and values substituted
//! for the `{{customer_name}}` / `{{amount}}` / `{{update_url}}` tokens are
//! escaped on the way into HTML.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, bail};
use async_trait::async_trait;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use recoup_common::hmac::LinkSigner;
use recoup_provider::{Invoice, REQUEST_TIMEOUT};
use recoup_store::models::{EmailTemplate, Merchant, MetricTotals};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

/// Header that threads the owning merchant through the gateway for
/// suppression-list and bounce attribution.
const ENTITY_REF_HEADER: &str = "x-entity-ref-id";

/// An email handed to the gateway.
#[derive(Clone, Debug)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    /// Merchant id, sent as `X-Entity-Ref-ID`.
    pub merchant_ref: String,
}

#[derive(Clone, Debug)]
pub struct SendReceipt {
    pub id: String,
}

/// Seam to the email delivery gateway, mockable in tests.
#[async_trait]
pub trait EmailApi: Send + Sync {
    async fn send(&self, email: &OutgoingEmail)
    -> anyhow::Result<SendReceipt>;
}

// --- HTTP gateway client --- //

pub struct HttpEmailGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    accepted: Option<bool>,
    id: String,
}

impl HttpEmailGateway {
    pub fn new(
        base_url: &str,
        api_key: SecretString,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build email gateway client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }
}

#[async_trait]
impl EmailApi for HttpEmailGateway {
    async fn send(
        &self,
        email: &OutgoingEmail,
    ) -> anyhow::Result<SendReceipt> {
        let url = format!("{}/emails", self.base_url);
        let response = self
            .http
            .post(url)
            .bearer_auth(self.api_key.expose_secret())
            .header(ENTITY_REF_HEADER, &email.merchant_ref)
            .json(&serde_json::json!({
                "from": email.from,
                "to": email.to,
                "subject": email.subject,
                "html": email.html,
                "text": email.text,
            }))
            .send()
            .await
            .context("Email gateway request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Email gateway returned {status}: {body}");
        }

        let parsed: SendResponse = response
            .json()
            .await
            .context("Email gateway returned malformed response")?;
        if parsed.accepted == Some(false) {
            bail!("Email gateway did not accept the message");
        }

        debug!(gateway_id = %parsed.id, "Email accepted by gateway");
        Ok(SendReceipt { id: parsed.id })
    }
}

// --- Template sanitization --- //

/// Stand-in for `{{update_url}}` while sanitizing: ammonia drops `href`
/// values that aren't valid https URLs, which would eat the token.
const URL_TOKEN_SENTINEL: &str = "https://token.invalid/update-url";

fn allowlist_builder() -> ammonia::Builder<'static> {
    let mut builder = ammonia::Builder::default();
    builder
        .tags(HashSet::from([
            "a", "b", "br", "div", "em", "h1", "h2", "h3", "i", "li", "ol",
            "p", "span", "strong", "ul",
        ]))
        .generic_attributes(HashSet::new())
        .tag_attributes(HashMap::from([("a", HashSet::from(["href"]))]))
        .url_schemes(HashSet::from(["https"]))
        .link_rel(Some("noopener noreferrer"));
    builder
}

/// Sanitize a merchant-provided template body against the fixed allowlist,
/// preserving the `{{update_url}}` token through ammonia's URL filtering.
pub fn sanitize_template_body(body: &str) -> String {
    let swapped = body.replace("{{update_url}}", URL_TOKEN_SENTINEL);
    let cleaned = allowlist_builder().clean(&swapped).to_string();
    cleaned.replace(URL_TOKEN_SENTINEL, "{{update_url}}")
}

// --- Rendering --- //

/// `$12.34` / `€12.34` / `12.34 SEK`
pub fn format_amount(cents: i64, currency: &str) -> String {
    let major = cents / 100;
    let minor = (cents % 100).abs();
    match currency.to_ascii_lowercase().as_str() {
        "usd" => format!("${major}.{minor:02}"),
        "eur" => format!("\u{20ac}{major}.{minor:02}"),
        "gbp" => format!("\u{a3}{major}.{minor:02}"),
        other => {
            format!("{major}.{minor:02} {}", other.to_ascii_uppercase())
        }
    }
}

/// `GET /track/open/:logId`
pub fn open_url(public_url: &str, log_id: i64) -> String {
    format!("{public_url}/track/open/{log_id}")
}

/// `GET /track/click?url=..&logId=..&sig=..`, signed over the raw target.
pub fn click_url(
    public_url: &str,
    signer: &LinkSigner,
    target: &str,
    log_id: i64,
) -> String {
    let sig = signer.sign(target, log_id);
    let encoded = utf8_percent_encode(target, NON_ALPHANUMERIC);
    format!("{public_url}/track/click?url={encoded}&logId={log_id}&sig={sig}")
}

fn sender(merchant: &Merchant, from_addr: &str) -> String {
    match &merchant.from_name {
        Some(name) => format!("{name} <{from_addr}>"),
        None => from_addr.to_owned(),
    }
}

fn substitute_tokens(
    body: &str,
    customer_name: &str,
    amount: &str,
    update_url: &str,
) -> String {
    body.replace("{{customer_name}}", customer_name)
        .replace("{{amount}}", amount)
        .replace("{{update_url}}", update_url)
}

fn default_dunning_subject(attempt: u32) -> String {
    match attempt {
        1 => "Your payment didn't go through".to_owned(),
        2 => "Reminder: please update your payment method".to_owned(),
        _ => "Final notice: your subscription is at risk".to_owned(),
    }
}

fn default_dunning_body() -> &'static str {
    "<p>Hi {{customer_name}},</p>\
     <p>We couldn't collect your payment of {{amount}}. This usually means \
     the card on file expired or was declined.</p>\
     <p><a href=\"{{update_url}}\">Update your payment method</a> to keep \
     your subscription active.</p>"
}

/// Render the dunning email for one retry attempt. The merchant's custom
/// template for this attempt wins over the default.
pub fn render_dunning(
    public_url: &str,
    from_addr: &str,
    signer: &LinkSigner,
    merchant: &Merchant,
    invoice: &Invoice,
    attempt: u32,
    template: Option<&EmailTemplate>,
    log_id: i64,
) -> OutgoingEmail {
    let customer_name =
        invoice.customer_name.as_deref().unwrap_or("there");
    let amount = format_amount(invoice.amount_due, &invoice.currency);
    let target_url = invoice
        .hosted_invoice_url
        .clone()
        .unwrap_or_else(|| public_url.to_owned());
    let tracked_url = click_url(public_url, signer, &target_url, log_id);

    let (subject, body) = match template {
        Some(template) => (template.subject.clone(), template.body.clone()),
        None => (
            default_dunning_subject(attempt),
            default_dunning_body().to_owned(),
        ),
    };

    let html_body = substitute_tokens(
        &body,
        &ammonia::clean_text(customer_name),
        &ammonia::clean_text(&amount),
        &tracked_url,
    );
    let pixel = open_url(public_url, log_id);
    let html = format!(
        "{html_body}\
         <img src=\"{pixel}\" width=\"1\" height=\"1\" alt=\"\"/>"
    );

    let text = format!(
        "Hi {customer_name},\n\n\
         We couldn't collect your payment of {amount}. Update your payment \
         method to keep your subscription active:\n\n{target_url}\n"
    );

    let to = invoice
        .customer_email
        .clone()
        .expect("Caller checked customer_email is present");

    OutgoingEmail {
        from: sender(merchant, from_addr),
        to,
        subject,
        html,
        text,
        merchant_ref: merchant.id.to_string(),
    }
}

/// Render the SCA / 3DS "action required" notification.
pub fn render_action_required(
    from_addr: &str,
    merchant: &Merchant,
    invoice: &Invoice,
    confirm_url: &str,
) -> OutgoingEmail {
    let customer_name =
        invoice.customer_name.as_deref().unwrap_or("there");
    let amount = format_amount(invoice.amount_due, &invoice.currency);

    let html = format!(
        "<p>Hi {name},</p>\
         <p>Your bank needs you to confirm a payment of {amount_html}.</p>\
         <p><a href=\"{confirm_url}\">Confirm your payment</a></p>",
        name = ammonia::clean_text(customer_name),
        amount_html = ammonia::clean_text(&amount),
    );
    let text = format!(
        "Hi {customer_name},\n\n\
         Your bank needs you to confirm a payment of {amount}:\n\n\
         {confirm_url}\n"
    );

    let to = invoice
        .customer_email
        .clone()
        .expect("Caller checked customer_email is present");

    OutgoingEmail {
        from: sender(merchant, from_addr),
        to,
        subject: "Action required: confirm your payment".to_owned(),
        html,
        text,
        merchant_ref: merchant.id.to_string(),
    }
}

/// Render the weekly operator digest from the last-7-day rollups.
pub fn render_digest(
    from_addr: &str,
    merchant: &Merchant,
    totals: &MetricTotals,
    to: &str,
) -> OutgoingEmail {
    let recovered =
        format_amount(totals.recovered_cents, "usd");
    let html = format!(
        "<h2>Your weekly recovery digest</h2>\
         <ul>\
         <li>Recovered revenue: {recovered}</li>\
         <li>Dunning emails sent: {emails}</li>\
         <li>Opens: {opens}</li>\
         <li>Clicks: {clicks}</li>\
         </ul>",
        emails = totals.emails_sent,
        opens = totals.total_opens,
        clicks = totals.total_clicks,
    );
    let text = format!(
        "Your weekly recovery digest\n\n\
         Recovered revenue: {recovered}\n\
         Dunning emails sent: {emails}\n\
         Opens: {opens}\n\
         Clicks: {clicks}\n",
        emails = totals.emails_sent,
        opens = totals.total_opens,
        clicks = totals.total_clicks,
    );

    OutgoingEmail {
        from: from_addr.to_owned(),
        to: to.to_owned(),
        subject: "Your weekly recovery digest".to_owned(),
        html,
        text,
        merchant_ref: merchant.id.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitize_strips_scripts_and_event_handlers() {
        let dirty = "<p onclick=\"steal()\">Hi</p>\
                     <script>alert(1)</script>\
                     <img src=\"https://evil.example/x.png\"/>";
        let clean = sanitize_template_body(dirty);
        assert!(!clean.contains("script"));
        assert!(!clean.contains("onclick"));
        assert!(!clean.contains("img"));
        assert!(clean.contains("<p>Hi</p>"));
    }

    #[test]
    fn sanitize_preserves_tokens_including_href() {
        let body = "<p>{{customer_name}} owes {{amount}}</p>\
                    <a href=\"{{update_url}}\">Update</a>";
        let clean = sanitize_template_body(body);
        assert!(clean.contains("{{customer_name}}"));
        assert!(clean.contains("{{amount}}"));
        assert!(clean.contains("href=\"{{update_url}}\""));
    }

    #[test]
    fn sanitize_drops_non_https_links() {
        let body = "<a href=\"javascript:alert(1)\">x</a>\
                    <a href=\"http://insecure.example\">y</a>";
        let clean = sanitize_template_body(body);
        assert!(!clean.contains("javascript:"));
        assert!(!clean.contains("http://insecure.example"));
    }

    #[test]
    fn amount_formatting() {
        assert_eq!(format_amount(1234, "usd"), "$12.34");
        assert_eq!(format_amount(1234, "USD"), "$12.34");
        assert_eq!(format_amount(50, "eur"), "\u{20ac}0.50");
        assert_eq!(format_amount(99_00, "gbp"), "\u{a3}99.00");
        assert_eq!(format_amount(1000, "sek"), "10.00 SEK");
    }

    #[test]
    fn click_url_signature_verifies() {
        let signer = LinkSigner::new(b"secret");
        let target = "https://pay.example.com/invoice?id=1&x=2";
        let url = click_url("https://app.recoup.dev", &signer, target, 7);

        assert!(url.starts_with("https://app.recoup.dev/track/click?url="));
        assert!(url.contains("logId=7"));

        // The sig query param must verify against the *raw* target.
        let sig = url.split("sig=").nth(1).unwrap();
        assert!(signer.verify(target, 7, sig));
    }

    #[test]
    fn token_substitution_escapes_html() {
        let body = "<p>{{customer_name}}: {{amount}}</p>";
        let out = substitute_tokens(
            body,
            &ammonia::clean_text("<b>Bob</b>"),
            &ammonia::clean_text("$1.00"),
            "https://x.example",
        );
        assert!(!out.contains("<b>"));
        assert!(out.contains("Bob"));
    }
}
