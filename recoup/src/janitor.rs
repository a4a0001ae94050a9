//! The janitor: self-healing sweeps on startup and every 10 minutes.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use recoup_common::{shutdown::Shutdown, task::NamedTask};
use recoup_store::Store;
use tracing::{Instrument, debug, info, info_span, warn};

/// Time between sweeps (the first runs immediately on start).
const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// A `running` task older than this is presumed orphaned by a dead worker.
const ZOMBIE_TIMEOUT_MIN: i64 = 10;
/// Idempotency ledger retention. Must exceed the provider's webhook retry
/// horizon, or a late retry would be re-processed.
const EVENT_RETENTION_DAYS: i64 = 7;

pub struct Janitor {
    store: Store,
    shutdown: Shutdown,
}

impl Janitor {
    pub fn spawn(store: Store, shutdown: Shutdown) -> NamedTask<()> {
        let janitor = Self { store, shutdown };
        NamedTask::spawn("(janitor)", async move {
            janitor.run().instrument(info_span!("(janitor)")).await
        })
    }

    async fn run(self) {
        info!("Janitor started");
        loop {
            self.sweep().await;
            tokio::select! {
                biased;
                () = self.shutdown.recv() => break,
                () = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }
        }
        info!("Janitor stopped");
    }

    /// Zombie rescue first, then event pruning, in that order.
    async fn sweep(&self) {
        let zombie_cutoff =
            Utc::now() - chrono::Duration::minutes(ZOMBIE_TIMEOUT_MIN);
        match self.store.rescue_zombie_tasks(zombie_cutoff).await {
            Ok(0) => debug!("No zombie tasks"),
            Ok(rescued) => info!(rescued, "Rescued zombie tasks"),
            Err(e) => warn!("Zombie rescue failed: {e:#}"),
        }

        let event_cutoff =
            Utc::now() - chrono::Duration::days(EVENT_RETENTION_DAYS);
        match self.store.prune_processed_events(event_cutoff).await {
            Ok(0) => debug!("No processed events to prune"),
            Ok(pruned) => info!(pruned, "Pruned aged processed events"),
            Err(e) => warn!("Event pruning failed: {e:#}"),
        }
    }
}
