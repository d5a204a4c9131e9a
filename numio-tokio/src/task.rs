use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, warn};

use crate::notify_once::NotifyOnce;

/// Errors that can occur when joining [`NxTask`]s.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Static task finished prematurely: {name}")]
    PrematureFinish { name: Cow<'static, str> },
    #[error("Some tasks failed to finish on time: {hung_tasks:?}")]
    Hung { hung_tasks: Vec<String> },
}

/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// 1. propagates panics instead of swallowing them, and
/// 2. is `#[must_use]`, so every spawned task is either joined or explicitly
///    [`detach`](NxTask::detach)ed.
///
/// Tasks carry a name for debuggability; [`NxTask::logged`] instruments the
/// handle so its outcome is logged when it finishes.
#[must_use]
pub struct NxTask<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> NxTask<T> {
    /// Spawns a named task which inherits the current tracing span.
    /// This is generally what you want to use.
    #[inline]
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> NxTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        Self::spawn_with_span(name, tracing::Span::current(), future)
    }

    /// Spawns a named task under a custom span. Pass
    /// `info_span!(parent: None, ..)` to detach from the current span.
    #[inline]
    pub fn spawn_with_span<F>(
        name: impl Into<Cow<'static, str>>,
        span: tracing::Span,
        future: F,
    ) -> NxTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        NxTask {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Drop the handle, letting the task run on in the background. The
    /// output (and any panic) can no longer be observed, so use sparingly.
    #[inline]
    pub fn detach(self) {
        drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Instrument this task so its outcome is logged when it finishes. The
    /// output of the returned future is the task name.
    #[inline]
    pub fn logged(self) -> LoggedTask<T> {
        LoggedTask(self)
    }
}

impl<T> Future for NxTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = result.map_err(|join_err| {
            match join_err.try_into_panic() {
                // Propagate panics inside the task to the poller.
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => join_err,
            }
        });

        Poll::Ready(result)
    }
}

/// A [`Future`] wrapping [`NxTask`] so its result is logged when it
/// finishes. The inner `T` is discarded; the output is the task name.
pub struct LoggedTask<T>(NxTask<T>);

impl<T> LoggedTask<T> {
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl<T> Future for LoggedTask<T> {
    type Output = Cow<'static, str>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            let name = self.0.name.clone();
            match &result {
                Ok(_) => info!("Task '{name}' finished"),
                Err(e) if e.is_cancelled() =>
                    warn!("Task '{name}' cancelled"),
                Err(e) => error!("Task '{name}' join error: {e:#}"),
            }
            name
        })
    }
}

/// The standard way numio processes run their tasks to completion.
///
/// - "static" tasks are expected to run for the whole program lifetime. If
///   one finishes early, a shutdown is triggered so the process fails as a
///   unit instead of limping along partially.
/// - "ephemeral" tasks (sent over `eph_tasks_rx`) may finish at any time.
/// - All handles are polled, so panics propagate.
/// - After the shutdown signal, waits up to `shutdown_timeout` for all
///   remaining tasks to drain; anything still running is reported hung.
pub async fn try_join_tasks_and_shutdown(
    static_tasks: Vec<NxTask<()>>,
    mut eph_tasks_rx: mpsc::Receiver<NxTask<()>>,
    mut shutdown: NotifyOnce,
    shutdown_timeout: Duration,
) -> Result<(), Error> {
    if static_tasks.is_empty() {
        shutdown.recv().await;
        return Ok(());
    }

    let mut static_tasks = static_tasks
        .into_iter()
        .map(NxTask::logged)
        .collect::<FuturesUnordered<_>>();
    let mut ephemeral_tasks = FuturesUnordered::new();

    let mut result = Ok(());

    loop {
        tokio::select! {
            // Mitigate a possible select! race after a shutdown signal.
            biased;
            () = shutdown.recv() => break,
            Some(task) = eph_tasks_rx.recv() => {
                debug!("Received ephemeral task: {name}", name = task.name());
                ephemeral_tasks.push(task.logged());
            }
            Some(name) = ephemeral_tasks.next() => {
                debug!("Ephemeral task finished: {name}");
            }
            Some(name) = static_tasks.next() => {
                // A static task finished prematurely. Record the error,
                // trigger shutdown, then drain the rest below.
                result = Err(Error::PrematureFinish { name });
                break shutdown.send();
            }
        }
    }

    let mut all_tasks = static_tasks
        .into_iter()
        .chain(ephemeral_tasks)
        .collect::<FuturesUnordered<_>>();

    let timeout = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(timeout);

    while !all_tasks.is_empty() {
        tokio::select! {
            Some(_name) = all_tasks.next() => (),
            () = &mut timeout => {
                let hung_tasks = all_tasks
                    .iter()
                    .map(|task| task.name().to_owned())
                    .collect::<Vec<_>>();
                return Err(Error::Hung { hung_tasks });
            }
        }
    }

    result
}

/// [`try_join_tasks_and_shutdown`], logging any error. Useful when the
/// callsite needs a `Future<Output = ()> + Send + 'static`.
pub async fn join_tasks_and_shutdown(
    name: &str,
    static_tasks: Vec<NxTask<()>>,
    eph_tasks_rx: mpsc::Receiver<NxTask<()>>,
    shutdown: NotifyOnce,
    shutdown_timeout: Duration,
) {
    let result = try_join_tasks_and_shutdown(
        static_tasks,
        eph_tasks_rx,
        shutdown,
        shutdown_timeout,
    )
    .await;

    match result {
        Ok(()) => info!("{name} tasks finished."),
        Err(e) => error!("{name} tasks errored: {e:#}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn premature_static_finish_is_an_error() {
        let shutdown = NotifyOnce::new();
        let (_eph_tx, eph_rx) = mpsc::channel(1);
        let tasks = vec![NxTask::spawn("early-exit", async {})];

        let result = try_join_tasks_and_shutdown(
            tasks,
            eph_rx,
            shutdown,
            Duration::from_secs(1),
        )
        .await;

        match result {
            Err(Error::PrematureFinish { name }) =>
                assert_eq!(name, "early-exit"),
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_shutdown_drains_tasks() {
        let shutdown = NotifyOnce::new();
        let mut task_shutdown = shutdown.clone();
        let (_eph_tx, eph_rx) = mpsc::channel(1);
        let tasks = vec![NxTask::spawn("worker", async move {
            task_shutdown.recv().await;
        })];

        shutdown.send();
        try_join_tasks_and_shutdown(
            tasks,
            eph_rx,
            shutdown,
            Duration::from_secs(1),
        )
        .await
        .expect("Should have shut down cleanly");
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn panics_propagate_through_join() {
        let task = NxTask::spawn("panicky", async { panic!("boom") });
        let _ = task.await;
    }
}
