//! The durable store: single source of truth for merchants, the task queue,
//! the usage ledger, the idempotency ledger, daily rollups, and templates.
//!
//! Every multi-statement invariant (queue claim, usage insert + rollup,
//! merchant erasure) commits as one transaction. Other components never see
//! partial state.
//!
//! The two cross-process coordination primitives both live here:
//!
//! - [`Store::claim_next_task`]: `FOR UPDATE SKIP LOCKED` claim, at most one
//!   claimant per task across any number of worker replicas.
//! - [`Store::attempt_event_lock`]: first-writer-wins insert into the
//!   processed-events ledger; the insert *is* the commit point.

use std::{sync::Arc, time::Duration};

use recoup_common::aes::TokenCipher;
use sqlx::{PgPool, postgres::PgPoolOptions};
use thiserror::Error;

pub mod models;

mod events;
mod merchants;
mod tasks;
mod templates;
mod usage;

pub use merchants::MerchantSettingsUpdate;

/// Max connections in the shared pool. All components (HTTP handlers, worker,
/// janitor, reporter) draw from this pool.
const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the durable store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    cipher: Arc<TokenCipher>,
}

impl Store {
    /// Connect to Postgres and run pending migrations.
    pub async fn connect(
        database_url: &str,
        cipher: Arc<TokenCipher>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, cipher })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool, cipher: Arc<TokenCipher>) -> Self {
        Self { pool, cipher }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn cipher(&self) -> &TokenCipher {
        &self.cipher
    }

    /// Liveness probe for `/health`.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
