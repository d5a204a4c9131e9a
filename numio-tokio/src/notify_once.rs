use std::sync::Arc;

use tokio::sync::Semaphore;

/// Synchronization utility which delivers a notification to all consumers
/// *once*, most commonly used as the process shutdown signal.
///
/// - Multi-producer and multi-consumer: clone to get another handle.
/// - Every clone observes the signal at most once; fresh clones can still
///   observe a signal that was sent before they were created (unlike
///   [`tokio::sync::broadcast`]).
/// - Sending more than once is harmless.
///
/// Implementation: a [`Semaphore`] with zero permits. [`Semaphore::acquire`]
/// on such a semaphore returns only once the semaphore is closed, so closing
/// it is "send" and observing the `AcquireError` is "recv".
#[derive(Debug)]
pub struct NotifyOnce {
    inner: Arc<Semaphore>,
    observed: bool,
}

impl NotifyOnce {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
            observed: false,
        }
    }

    /// Send the signal, waking every handle currently waiting in
    /// [`recv`](Self::recv).
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the signal.
    ///
    /// NOTE: if this handle has already observed the signal, the returned
    /// future never resolves. Select on something else as well.
    pub async fn recv(&mut self) {
        if self.observed {
            std::future::pending().await
        } else {
            self.inner
                .acquire()
                .await
                .map(|_| ())
                .expect_err("0-permit semaphore acquired before close");
            self.observed = true;
        }
    }

    /// Waits for the signal, taking ownership of the handle. Useful for
    /// graceful shutdown APIs requiring `impl Future<Output = ()> + 'static`.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Whether the signal has been sent. Does not consume the signal for a
    /// later call to [`recv`](Self::recv).
    #[must_use]
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Clone for NotifyOnce {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            // Every clone gets its own chance to observe the signal.
            observed: false,
        }
    }
}

#[cfg(test)]
mod test {
    use tokio_test::{assert_pending, assert_ready};

    use super::*;

    #[test]
    fn multiple_sends_dont_panic() {
        let shutdown = NotifyOnce::new();
        shutdown.send();
        shutdown.send();
    }

    #[test]
    fn each_handle_observes_once() {
        let shutdown1 = NotifyOnce::new();
        let mut shutdown2 = shutdown1.clone();

        let mut recv1 = tokio_test::task::spawn(shutdown2.recv());
        assert_pending!(recv1.poll());

        shutdown1.send();

        assert!(recv1.is_woken());
        assert_ready!(recv1.poll());
        drop(recv1);

        // The same handle never yields twice.
        let mut recv2 = tokio_test::task::spawn(shutdown2.recv());
        assert_pending!(recv2.poll());
        shutdown1.send();
        assert_pending!(recv2.poll());
        drop(recv2);

        // But a fresh clone still observes the (already sent) signal.
        let shutdown3 = shutdown2.clone();
        assert!(shutdown3.try_recv());
        let mut recv3 = tokio_test::task::spawn(shutdown3.recv_owned());
        assert_ready!(recv3.poll());
    }
}
