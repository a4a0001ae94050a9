//! Structured task concurrency and shutdown for our long-lived service tasks.
//!
//! Every long-lived task (worker, janitor, HTTP server) is spawned as a
//! [`NamedTask`] and joined by [`try_join_and_shutdown`]. If any of them
//! finishes before a shutdown was requested, that's a partial failure and we
//! shut the whole process down rather than limp along.

use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{StreamExt, stream::FuturesUnordered};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, warn};

use crate::shutdown::Shutdown;

/// Errors that can occur when joining [`NamedTask`]s.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Task finished prematurely: {name}")]
    PrematureFinish { name: Cow<'static, str> },
    #[error("Some tasks failed to finish on time: {hung_tasks:?}")]
    Hung { hung_tasks: Vec<String> },
}

/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// (1) propagates panics instead of swallowing them, and
/// (2) carries a task name for debuggability.
///
/// `#[must_use]` ensures spawned tasks are joined or explicitly detached.
#[must_use]
pub struct NamedTask<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> NamedTask<T> {
    /// Spawns a named task which inherits the current tracing span.
    #[inline]
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> NamedTask<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        let span = tracing::Span::current();
        Self {
            task: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Drop the handle so the task continues running in the background.
    /// Use sparingly; detached tasks can't propagate panics.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T> Future for NamedTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(val) => Ok(val),
            Err(join_err) => match join_err.try_into_panic() {
                // Propagate panics in spawned tasks to the poller.
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}

/// Wraps a [`NamedTask`] so its [`Future`] output includes the task name,
/// letting the join helper report *which* task finished or hung.
struct Tracked(NamedTask<()>);

impl Tracked {
    #[inline]
    fn name(&self) -> &str {
        self.0.name()
    }
}

impl Future for Tracked {
    type Output = (Cow<'static, str>, Result<(), JoinError>);

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let name = self.0.name.clone();
        Pin::new(&mut self.0).poll(cx).map(|result| (name, result))
    }
}

/// Polls all static tasks until a shutdown signal is observed, then waits up
/// to `shutdown_timeout` for every task to complete.
///
/// # Errors
///
/// - If a task finishes before the shutdown signal, the signal is sent and an
///   error is returned (after the remaining tasks have been joined).
/// - If some tasks hang past the shutdown timeout, an error is returned.
pub async fn try_join_and_shutdown(
    static_tasks: Vec<NamedTask<()>>,
    shutdown: Shutdown,
    shutdown_timeout: Duration,
) -> Result<(), Error> {
    if static_tasks.is_empty() {
        shutdown.recv().await;
        return Ok(());
    }

    let mut tasks = static_tasks
        .into_iter()
        .map(Tracked)
        .collect::<FuturesUnordered<_>>();

    let mut result = Ok(());

    loop {
        tokio::select! {
            // Mitigate possible select! race after a shutdown signal is sent
            biased;
            () = shutdown.recv() => break,
            Some((name, _joined)) = tasks.next() => {
                result = Err(Error::PrematureFinish { name });
                shutdown.send();
                break;
            }
        }
    }

    let shutdown_timeout_fut = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(shutdown_timeout_fut);

    while !tasks.is_empty() {
        tokio::select! {
            Some((name, joined)) = tasks.next() => match joined {
                Ok(()) => debug!("Task '{name}' finished"),
                Err(join_err) =>
                    warn!("Task '{name}' errored during shutdown: {join_err:#}"),
            },
            () = &mut shutdown_timeout_fut => {
                let hung_tasks = tasks
                    .iter()
                    .map(|task| task.name().to_owned())
                    .collect::<Vec<_>>();
                return Err(Error::Hung { hung_tasks });
            }
        }
    }

    info!("All tasks finished");
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn joins_after_shutdown_signal() {
        let shutdown = Shutdown::new();
        let task = {
            let shutdown = shutdown.clone();
            NamedTask::spawn("waiter", async move { shutdown.recv().await })
        };
        shutdown.send();
        try_join_and_shutdown(vec![task], shutdown, Duration::from_secs(1))
            .await
            .expect("tasks should join cleanly");
    }

    #[tokio::test]
    async fn premature_finish_is_an_error() {
        let shutdown = Shutdown::new();
        let task = NamedTask::spawn("early-exit", async {});
        let result = try_join_and_shutdown(
            vec![task],
            shutdown.clone(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(Error::PrematureFinish { .. })));
        // The helper triggers a shutdown so siblings wind down too.
        assert!(shutdown.try_recv());
    }
}
