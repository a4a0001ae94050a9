//! The worker: one cooperative poll loop per process replica.
//!
//! The loop claims ready tasks via the store's skip-locked protocol, so any
//! number of replicas can run concurrently with no other coordination.
//! Handler outcomes (including panics-as-errors from `anyhow`) become
//! `completed` / `failed` transitions; nothing bubbles into the loop itself.

use std::{sync::Arc, time::Duration};

use recoup_common::{shutdown::Shutdown, task::NamedTask};
use recoup_store::models::{Task, TaskStatus};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{App, jobs, jobs::JobOutcome};

/// Brief yield between tasks when the queue has work, so one busy tenant
/// can't starve the runtime.
const YIELD_AFTER_WORK: Duration = Duration::from_millis(100);
/// Idle poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(1);
/// Backoff after an unexpected error around the claim itself.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct Worker {
    app: Arc<App>,
    shutdown: Shutdown,
}

impl Worker {
    pub fn spawn(app: Arc<App>, shutdown: Shutdown) -> NamedTask<()> {
        let worker = Self { app, shutdown };
        NamedTask::spawn("(worker)", async move {
            worker.run().instrument(info_span!("(worker)")).await
        })
    }

    async fn run(self) {
        info!("Worker started");
        loop {
            let sleep = self.tick().await;
            tokio::select! {
                biased;
                () = self.shutdown.recv() => break,
                () = tokio::time::sleep(sleep) => {}
            }
        }
        info!("Worker stopped");
    }

    /// One poll iteration; returns how long to sleep before the next.
    async fn tick(&self) -> Duration {
        match self.app.store.claim_next_task().await {
            Ok(Some(task)) => {
                self.process(task).await;
                YIELD_AFTER_WORK
            }
            Ok(None) => IDLE_POLL,
            Err(e) => {
                warn!("Failed to claim next task, backing off: {e:#}");
                CLAIM_ERROR_BACKOFF
            }
        }
    }

    async fn process(&self, task: Task) {
        let task_id = task.id;
        let task_type = task.task_type;
        debug!(task_id, %task_type, merchant_id = %task.merchant_id,
               "Processing task");

        let status = match jobs::dispatch(&self.app, &task).await {
            Ok(JobOutcome::Completed) => {
                debug!(task_id, %task_type, "Task completed");
                TaskStatus::Completed
            }
            Ok(JobOutcome::Failed(reason)) => {
                warn!(task_id, %task_type, "Task failed: {reason}");
                TaskStatus::Failed
            }
            Err(e) => {
                warn!(task_id, %task_type, "Task errored: {e:#}");
                TaskStatus::Failed
            }
        };

        if let Err(e) =
            self.app.store.update_task_status(task_id, status).await
        {
            // The task stays `running`; the janitor's zombie rescue will
            // resurrect it after the lease window.
            error!(task_id, "Failed to record task outcome: {e:#}");
        }
    }
}
