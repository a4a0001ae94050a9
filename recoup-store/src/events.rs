//! The idempotency ledger for external webhook events.

use chrono::{DateTime, Utc};

use crate::{Result, Store};

impl Store {
    /// Attempt to acquire the processing lock for an external event id.
    ///
    /// Returns true iff this caller was the first writer. A conflicting
    /// insert is not an error; it resolves as "lock not acquired", and the
    /// loser must not perform any side effects. There is no separate "mark
    /// processed" step; the insert is the commit point.
    pub async fn attempt_event_lock(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO processed_events (event_id) VALUES ($1) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Janitor: drop ledger rows processed before `cutoff`. The retention
    /// window must exceed the provider's webhook retry horizon.
    pub async fn prune_processed_events(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM processed_events WHERE processed_at < $1",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
