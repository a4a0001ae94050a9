//! The usage ledger and its atomic daily rollup.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use recoup_common::time;
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    Result, Store,
    models::{MetricType, MetricTotals, UsageLog},
};

const USAGE_COLUMNS: &str = "id, merchant_id, metric_type, amount, \
                             opened_at, clicked_at, created_at, reported_at";

#[derive(FromRow)]
struct UsageLogRow {
    id: i64,
    merchant_id: Uuid,
    metric_type: String,
    amount: i64,
    opened_at: Option<DateTime<Utc>>,
    clicked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    reported_at: Option<DateTime<Utc>>,
}

impl From<UsageLogRow> for UsageLog {
    fn from(row: UsageLogRow) -> Self {
        Self {
            id: row.id,
            merchant_id: row.merchant_id,
            metric_type: MetricType::from_str(&row.metric_type)
                .expect("Infallible"),
            amount: row.amount,
            opened_at: row.opened_at,
            clicked_at: row.clicked_at,
            created_at: row.created_at,
            reported_at: row.reported_at,
        }
    }
}

impl Store {
    /// Insert a usage log row and, in the same transaction, upsert today's
    /// `daily_metrics` rollup. `emails_sent` is incremented by `amount` iff
    /// the metric is `dunning_email_sent`; on a `(merchant_id, metric_date)`
    /// collision counters are ADDed, never overwritten. Observers see both
    /// writes or neither.
    pub async fn create_usage_log(
        &self,
        merchant_id: Uuid,
        metric_type: &MetricType,
        amount: i64,
    ) -> Result<UsageLog> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query_as::<_, UsageLogRow>(&format!(
            "INSERT INTO usage_logs (merchant_id, metric_type, amount) \
             VALUES ($1, $2, $3) \
             RETURNING {USAGE_COLUMNS}"
        ))
        .bind(merchant_id)
        .bind(metric_type.as_str())
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        let emails_sent = match metric_type {
            MetricType::DunningEmailSent => amount,
            _ => 0,
        };
        // recovered_cents is incremented by 0 here; recovery amounts flow in
        // through `add_recovered_cents`.
        sqlx::query(
            "INSERT INTO daily_metrics \
                 (merchant_id, metric_date, recovered_cents, emails_sent) \
             VALUES ($1, $2, 0, $3) \
             ON CONFLICT (merchant_id, metric_date) DO UPDATE \
             SET emails_sent = daily_metrics.emails_sent \
                 + EXCLUDED.emails_sent",
        )
        .bind(merchant_id)
        .bind(time::utc_date(Utc::now()))
        .bind(emails_sent)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UsageLog::from(row))
    }

    /// Sum of `dunning_email_sent` amounts since the first of the current
    /// month. Drives quota gating; non-decreasing within a calendar month.
    pub async fn monthly_dunning_count(
        &self,
        merchant_id: Uuid,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM usage_logs \
             WHERE merchant_id = $1 \
               AND metric_type = 'dunning_email_sent' \
               AND created_at >= $2",
        )
        .bind(merchant_id)
        .bind(time::month_start(Utc::now()))
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// The oldest unreported usage logs, up to `limit`.
    pub async fn unreported_usage_logs(
        &self,
        limit: i64,
    ) -> Result<Vec<UsageLog>> {
        let rows = sqlx::query_as::<_, UsageLogRow>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_logs \
             WHERE reported_at IS NULL \
             ORDER BY id ASC \
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(UsageLog::from).collect())
    }

    /// Stamp `reported_at` on the given logs. The `IS NULL` guard preserves
    /// the invariant that `reported_at` transitions null -> timestamp at most
    /// once.
    pub async fn mark_usage_reported(&self, log_ids: &[i64]) -> Result<u64> {
        if log_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE usage_logs SET reported_at = now() \
             WHERE id = ANY($1) AND reported_at IS NULL",
        )
        .bind(log_ids)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// First open of a tracked email: stamp `opened_at` and bump today's
    /// rollup. Repeat opens are no-ops. Returns whether a first open landed.
    pub async fn record_open(&self, log_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let merchant_id: Option<Uuid> = sqlx::query_scalar(
            "UPDATE usage_logs SET opened_at = now() \
             WHERE id = $1 AND opened_at IS NULL \
             RETURNING merchant_id",
        )
        .bind(log_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(merchant_id) = merchant_id else {
            tx.commit().await?;
            return Ok(false);
        };

        sqlx::query(
            "INSERT INTO daily_metrics (merchant_id, metric_date, total_opens) \
             VALUES ($1, $2, 1) \
             ON CONFLICT (merchant_id, metric_date) DO UPDATE \
             SET total_opens = daily_metrics.total_opens + 1",
        )
        .bind(merchant_id)
        .bind(time::utc_date(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// First click analog of [`record_open`](Self::record_open).
    pub async fn record_click(&self, log_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let merchant_id: Option<Uuid> = sqlx::query_scalar(
            "UPDATE usage_logs SET clicked_at = now() \
             WHERE id = $1 AND clicked_at IS NULL \
             RETURNING merchant_id",
        )
        .bind(log_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(merchant_id) = merchant_id else {
            tx.commit().await?;
            return Ok(false);
        };

        sqlx::query(
            "INSERT INTO daily_metrics \
                 (merchant_id, metric_date, total_clicks) \
             VALUES ($1, $2, 1) \
             ON CONFLICT (merchant_id, metric_date) DO UPDATE \
             SET total_clicks = daily_metrics.total_clicks + 1",
        )
        .bind(merchant_id)
        .bind(time::utc_date(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Add recovered revenue to today's rollup. The webhook sentinel passes
    /// zero until product fixes the recovery-amount semantics; the
    /// worker-complete endpoint passes an explicit amount.
    pub async fn add_recovered_cents(
        &self,
        merchant_id: Uuid,
        cents: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_metrics \
                 (merchant_id, metric_date, recovered_cents) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (merchant_id, metric_date) DO UPDATE \
             SET recovered_cents = daily_metrics.recovered_cents \
                 + EXCLUDED.recovered_cents",
        )
        .bind(merchant_id)
        .bind(time::utc_date(Utc::now()))
        .bind(cents)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Aggregate rollup counters for `metric_date >= since`.
    pub async fn metric_totals(
        &self,
        merchant_id: Uuid,
        since: NaiveDate,
    ) -> Result<MetricTotals> {
        let totals = sqlx::query_as::<_, MetricTotals>(
            "SELECT \
                 COALESCE(SUM(recovered_cents), 0)::BIGINT AS recovered_cents, \
                 COALESCE(SUM(emails_sent), 0)::BIGINT AS emails_sent, \
                 COALESCE(SUM(total_opens), 0)::BIGINT AS total_opens, \
                 COALESCE(SUM(total_clicks), 0)::BIGINT AS total_clicks \
             FROM daily_metrics \
             WHERE merchant_id = $1 AND metric_date >= $2",
        )
        .bind(merchant_id)
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(totals)
    }

    /// Most recent usage logs, optionally filtered by metric type.
    pub async fn recent_activity(
        &self,
        merchant_id: Uuid,
        metric_type: Option<&MetricType>,
        limit: i64,
    ) -> Result<Vec<UsageLog>> {
        let rows = match metric_type {
            Some(metric) => {
                sqlx::query_as::<_, UsageLogRow>(&format!(
                    "SELECT {USAGE_COLUMNS} FROM usage_logs \
                     WHERE merchant_id = $1 AND metric_type = $2 \
                     ORDER BY created_at DESC \
                     LIMIT $3"
                ))
                .bind(merchant_id)
                .bind(metric.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, UsageLogRow>(&format!(
                    "SELECT {USAGE_COLUMNS} FROM usage_logs \
                     WHERE merchant_id = $1 \
                     ORDER BY created_at DESC \
                     LIMIT $2"
                ))
                .bind(merchant_id)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(rows.into_iter().map(UsageLog::from).collect())
    }
}
