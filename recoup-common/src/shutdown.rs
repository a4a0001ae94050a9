use std::sync::Arc;

use tokio::sync::Semaphore;

/// Synchronization utility which broadcasts a signal to all consumers *once*,
/// used for graceful shutdown.
///
/// - Multi-producer and multi-consumer - simply clone to get another handle.
/// - Consumers can observe signals that were sent before they subscribed
///   (unlike [`tokio::sync::broadcast`]).
/// - It is safe to send the signal multiple times.
///
/// The implementation uses the fact that [`Semaphore::acquire`] on a
/// semaphore with 0 permits only returns once the semaphore has been closed:
/// closing the semaphore is "send", an [`AcquireError`] is "recv".
///
/// [`AcquireError`]: tokio::sync::AcquireError
#[derive(Clone, Debug)]
pub struct Shutdown {
    inner: Arc<Semaphore>,
}

impl Shutdown {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Send the shutdown signal, waking all actors blocked in [`recv`].
    ///
    /// [`recv`]: Shutdown::recv
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the shutdown signal. Returns immediately if the signal was
    /// already sent.
    pub async fn recv(&self) {
        self.inner
            .acquire()
            .await
            .map(|_| ())
            .expect_err("Shouldn't have been able to acquire a permit");
    }

    /// [`recv`](Self::recv), but takes ownership of the handle. Useful for
    /// graceful shutdown APIs requiring `impl Future<Output = ()> + 'static`.
    pub async fn recv_owned(self) {
        self.recv().await
    }

    /// Immediately returns whether the signal has been sent.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn send_then_recv_resolves() {
        let shutdown = Shutdown::new();
        shutdown.send();
        // Sending twice is fine.
        shutdown.send();
        tokio::time::timeout(Duration::from_secs(1), shutdown.recv())
            .await
            .expect("recv should resolve after send");
    }

    #[tokio::test]
    async fn late_subscriber_observes_signal() {
        let shutdown = Shutdown::new();
        shutdown.send();
        let late = shutdown.clone();
        tokio::time::timeout(Duration::from_secs(1), late.recv())
            .await
            .expect("late clone should still observe the signal");
    }
}
