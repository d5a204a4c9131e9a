//! Buffered, batch-flushed audit records.
//!
//! Hot paths (the poller, queue workers) emit an audit record per step;
//! writing each one straight through would double their I/O. Records are
//! buffered in memory and flushed as a batch when the buffer fills or the
//! flush interval passes, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use numio_tokio::notify_once::NotifyOnce;
use numio_tokio::task::NxTask;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::models::AuditRecord;
use crate::traits::AuditSink;

const BUFFER_CAPACITY: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Backpressure bound on the in-flight channel.
const CHANNEL_CAPACITY: usize = 1024;

/// Cheap cloneable handle for emitting audit records.
#[derive(Clone)]
pub struct AuditWriter {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditWriter {
    /// Spawns the flush task and returns the writer handle plus the task
    /// (join it at shutdown to drain the tail).
    pub fn spawn(
        sink: Arc<dyn AuditSink>,
        mut shutdown: NotifyOnce,
    ) -> (Self, NxTask<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(CHANNEL_CAPACITY);

        let task = NxTask::spawn("audit-flusher", async move {
            let mut buffer: Vec<AuditRecord> =
                Vec::with_capacity(BUFFER_CAPACITY);
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    maybe_record = rx.recv() => match maybe_record {
                        Some(record) => {
                            buffer.push(record);
                            if buffer.len() >= BUFFER_CAPACITY {
                                flush(&sink, &mut buffer).await;
                            }
                        }
                        // All writers dropped.
                        None => break,
                    },
                    _ = ticker.tick() => {
                        flush(&sink, &mut buffer).await;
                    }
                    () = shutdown.recv() => break,
                }
            }

            // Drain whatever is still queued, then flush the tail.
            while let Ok(record) = rx.try_recv() {
                buffer.push(record);
            }
            flush(&sink, &mut buffer).await;
        });

        (Self { tx }, task)
    }

    /// Emit one record. Non-blocking; drops (with a warning) if the
    /// channel is full, since audit must never stall the hot path.
    pub fn record(&self, record: AuditRecord) {
        if let Err(e) = self.tx.try_send(record) {
            warn!("Audit channel full; dropping record: {e}");
        }
    }
}

async fn flush(sink: &Arc<dyn AuditSink>, buffer: &mut Vec<AuditRecord>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let len = batch.len();
    if let Err(e) = sink.write_batch(batch).await {
        // Audit is best-effort: log and move on rather than re-buffer.
        error!("Failed to flush {len} audit records: {e}");
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::store::memory::MemStore;

    #[tokio::test]
    async fn records_flush_on_shutdown() {
        let store = Arc::new(MemStore::new());
        let shutdown = NotifyOnce::new();
        let (writer, task) =
            AuditWriter::spawn(store.clone(), shutdown.clone());

        for i in 0..10 {
            writer.record(AuditRecord::new(
                "poll",
                format!("number:{i}"),
                json!({"step": "test"}),
            ));
        }

        shutdown.send();
        task.await.unwrap();

        let records = store.audit_records();
        assert_eq!(records.len(), 10);
        assert_eq!(records[0].category, "poll");
    }

    #[tokio::test]
    async fn full_buffer_flushes_early() {
        let store = Arc::new(MemStore::new());
        let shutdown = NotifyOnce::new();
        let (writer, task) =
            AuditWriter::spawn(store.clone(), shutdown.clone());

        for i in 0..(BUFFER_CAPACITY + 5) {
            writer.record(AuditRecord::new(
                "poll",
                format!("number:{i}"),
                json!({}),
            ));
        }

        // The first full buffer flushes without waiting for shutdown.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if store.audit_records().len() >= BUFFER_CAPACITY {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Buffer should have flushed early");

        shutdown.send();
        task.await.unwrap();
        assert_eq!(store.audit_records().len(), BUFFER_CAPACITY + 5);
    }
}
