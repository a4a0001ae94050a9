//! Per-merchant dunning email templates, keyed by retry attempt (1..=3).

use uuid::Uuid;

use crate::{Result, Store, models::EmailTemplate};

impl Store {
    /// Insert or replace the template for one retry attempt. The body must
    /// already be sanitized by the caller.
    pub async fn upsert_email_template(
        &self,
        merchant_id: Uuid,
        retry_attempt: i32,
        subject: &str,
        body: &str,
    ) -> Result<EmailTemplate> {
        let template = sqlx::query_as::<_, EmailTemplate>(
            "INSERT INTO email_templates \
                 (merchant_id, retry_attempt, subject, body) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (merchant_id, retry_attempt) DO UPDATE \
             SET subject = EXCLUDED.subject, body = EXCLUDED.body \
             RETURNING merchant_id, retry_attempt, subject, body",
        )
        .bind(merchant_id)
        .bind(retry_attempt)
        .bind(subject)
        .bind(body)
        .fetch_one(self.pool())
        .await?;
        Ok(template)
    }

    pub async fn email_template(
        &self,
        merchant_id: Uuid,
        retry_attempt: i32,
    ) -> Result<Option<EmailTemplate>> {
        let template = sqlx::query_as::<_, EmailTemplate>(
            "SELECT merchant_id, retry_attempt, subject, body \
             FROM email_templates \
             WHERE merchant_id = $1 AND retry_attempt = $2",
        )
        .bind(merchant_id)
        .bind(retry_attempt)
        .fetch_optional(self.pool())
        .await?;
        Ok(template)
    }
}
