//! The durable job queue and cron scheduler.
//!
//! Jobs live in the relational store (one small dedicated pool in
//! production, per the session-mode pooler). The scheduler keeps its cron
//! entries in memory, registered once at worker startup, and publishes a
//! job whenever an entry comes due. Consumption happens through
//! [`JobQueue::work_batch`], which drives a handler over one claimed
//! batch with the standard retry policy.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::id::JobId;
use common::time::TimestampMs;
use numio_api_core::error::ApiError;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::audit::AuditWriter;
use crate::models::{AuditRecord, Job};
use crate::traits::{PublishOpts, QueueStatus, QueueStore};

/// Well-known queue names.
pub const PROVIDER_SYNC: &str = "provider-sync";
pub const SCHEDULED_SYNC: &str = "scheduled-sync";
pub const LIFECYCLE_CLEANUP: &str = "lifecycle-cleanup";
pub const PAYMENT_RECONCILE: &str = "payment-reconcile";
pub const NOTIFICATION_DELIVERY: &str = "notification-delivery";
pub const WEBHOOK_PROCESSING: &str = "webhook-processing";
pub const MASTER_WORKER: &str = "master-worker";

/// Attempts before a job fails permanently.
const MAX_JOB_RETRIES: u32 = 5;

/// A queue consumer.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    audit: AuditWriter,
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>, audit: AuditWriter) -> Self {
        Self { store, audit }
    }

    pub async fn publish(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: PublishOpts,
    ) -> Result<JobId, ApiError> {
        Ok(self.store.publish(queue, payload, opts).await?)
    }

    pub async fn status(
        &self,
        queue: &str,
    ) -> Result<QueueStatus, ApiError> {
        Ok(self.store.status(queue).await?)
    }

    /// Claims one batch from `queue` and runs `handler` over it.
    /// Failed jobs retry with exponential backoff up to the retry
    /// ceiling, then fail permanently with an audit record. Returns how
    /// many jobs were handled (successfully or not).
    #[instrument(skip(self, handler), name = "(queue-work)")]
    pub async fn work_batch(
        &self,
        queue: &str,
        batch: usize,
        handler: &dyn JobHandler,
    ) -> Result<u64, ApiError> {
        let now = TimestampMs::now();
        let jobs = self.store.fetch(queue, batch, now).await?;
        let mut handled = 0u64;

        for job in jobs {
            handled += 1;
            match handler.handle(&job).await {
                Ok(()) => self.store.complete(job.id).await?,
                Err(e) => {
                    let attempt = job.retry_count + 1;
                    if attempt >= MAX_JOB_RETRIES {
                        warn!(
                            "Job {} on '{queue}' failed permanently: {e:#}",
                            job.id,
                        );
                        self.store
                            .fail(job.id, format!("{e:#}"), None)
                            .await?;
                        self.audit.record(AuditRecord::new(
                            "job",
                            format!("{queue}:{}", job.id),
                            json!({
                                "step": "failed_permanently",
                                "error": format!("{e:#}"),
                            }),
                        ));
                        metrics::counter!("queue_jobs_failed_total")
                            .increment(1);
                    } else {
                        let delay = common::backoff::iter_with_initial_wait_ms(
                            1_000,
                        )
                        .nth(job.retry_count as usize)
                        .unwrap_or(Duration::from_secs(32));
                        self.store
                            .fail(
                                job.id,
                                format!("{e:#}"),
                                Some(now.saturating_add(delay)),
                            )
                            .await?;
                    }
                }
            }
        }
        Ok(handled)
    }
}

// --- Cron scheduling --- //

struct CronEntry {
    queue: String,
    schedule: cron::Schedule,
    payload: serde_json::Value,
    last_fired: Mutex<Option<DateTime<Utc>>>,
}

/// In-memory cron registrations driving queue publishes. Entries are
/// registered once at worker startup; the worker calls
/// [`Scheduler::tick`] once a minute.
pub struct Scheduler {
    queue: JobQueue,
    entries: Vec<CronEntry>,
}

impl Scheduler {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            entries: Vec::new(),
        }
    }

    /// Registers a cron entry. Expressions use the 6-field
    /// (seconds-first) form, e.g. `0 */10 * * * *`.
    pub fn schedule(
        &mut self,
        queue: &str,
        cron_expr: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        let schedule = cron::Schedule::from_str(cron_expr)
            .map_err(|e| anyhow::anyhow!("Bad cron '{cron_expr}': {e}"))?;
        info!("Scheduled '{queue}' at '{cron_expr}'");
        self.entries.push(CronEntry {
            queue: queue.to_owned(),
            schedule,
            payload,
            last_fired: Mutex::new(None),
        });
        Ok(())
    }

    /// Publishes a job for every entry that has come due since its last
    /// firing. Returns how many fired.
    pub async fn tick(&self, now: TimestampMs) -> Result<u64, ApiError> {
        let now_utc = Utc
            .timestamp_millis_opt(now.as_i64())
            .single()
            .unwrap_or_else(Utc::now);
        let mut fired = 0u64;

        for entry in &self.entries {
            let due = {
                let last = entry.last_fired.lock().unwrap();
                // On first tick, anchor to "now" so a restart doesn't
                // replay a backlog of missed firings.
                let anchor = last.unwrap_or(
                    now_utc - chrono::Duration::seconds(60),
                );
                entry
                    .schedule
                    .after(&anchor)
                    .next()
                    .is_some_and(|next| next <= now_utc)
            };
            if due {
                self.queue
                    .publish(
                        &entry.queue,
                        entry.payload.clone(),
                        PublishOpts::default(),
                    )
                    .await?;
                *entry.last_fired.lock().unwrap() = Some(now_utc);
                fired += 1;
            }
        }
        Ok(fired)
    }
}

/// The outbound webhook deliverer: consumes `notification-delivery`
/// jobs, POSTing each signed payload to the subscriber with the
/// escalating retry schedule (1, 5, 15, 60, 360 minutes).
pub mod deliver;
/// The master worker tick.
pub mod master;

#[cfg(test)]
mod test {
    use numio_tokio::notify_once::NotifyOnce;

    use super::*;
    use crate::store::memory::MemStore;

    struct FlakyHandler {
        fail_times: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            use std::sync::atomic::Ordering;
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("transient");
            }
            Ok(())
        }
    }

    fn queue(store: &Arc<MemStore>) -> JobQueue {
        let (audit, _task) =
            AuditWriter::spawn(store.clone(), NotifyOnce::new());
        JobQueue::new(store.clone(), audit)
    }

    #[tokio::test]
    async fn failed_jobs_retry_with_delay_then_dead_letter() {
        let store = Arc::new(MemStore::new());
        let q = queue(&store);
        q.publish("t", json!({}), PublishOpts::default())
            .await
            .unwrap();

        let handler = FlakyHandler {
            fail_times: u32::MAX.into(),
        };

        // First attempt fails: the job goes back to pending with a
        // start_after in the future, so an immediate re-fetch sees
        // nothing.
        let handled = q.work_batch("t", 10, &handler).await.unwrap();
        assert_eq!(handled, 1);
        let due_now = store
            .fetch("t", 10, TimestampMs::now())
            .await
            .unwrap();
        assert!(due_now.is_empty());
        assert_eq!(q.status("t").await.unwrap().pending, 1);

        // Exhaust the remaining attempts (claiming past the delay).
        for _ in 1..MAX_JOB_RETRIES {
            let jobs =
                store.fetch("t", 10, TimestampMs::MAX).await.unwrap();
            for job in jobs {
                assert!(handler.handle(&job).await.is_err());
                let retry_at = (job.retry_count + 1 < MAX_JOB_RETRIES)
                    .then_some(TimestampMs::MIN);
                store.fail(job.id, "x".into(), retry_at).await.unwrap();
            }
        }

        let status = q.status("t").await.unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 0);
    }

    #[tokio::test]
    async fn work_batch_completes_jobs() {
        let store = Arc::new(MemStore::new());
        let q = queue(&store);
        q.publish("t", json!({"n": 1}), PublishOpts::default())
            .await
            .unwrap();
        q.publish("t", json!({"n": 2}), PublishOpts::default())
            .await
            .unwrap();

        let handler = FlakyHandler {
            fail_times: 0.into(),
        };
        let handled = q.work_batch("t", 10, &handler).await.unwrap();
        assert_eq!(handled, 2);

        let status = q.status("t").await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.active, 0);
        assert_eq!(status.failed, 0);
    }

    #[tokio::test]
    async fn scheduler_fires_due_entries_once() {
        let store = Arc::new(MemStore::new());
        let mut scheduler = Scheduler::new(queue(&store));
        // Every second.
        scheduler
            .schedule("beat", "* * * * * *", json!({}))
            .unwrap();

        let t0 = TimestampMs::now();
        let fired = scheduler.tick(t0).await.unwrap();
        assert_eq!(fired, 1);

        // Immediately re-ticking at the same instant fires nothing new.
        let fired = scheduler.tick(t0).await.unwrap();
        assert_eq!(fired, 0);

        // A tick a few seconds later fires again.
        let later = t0.saturating_add(Duration::from_secs(3));
        let fired = scheduler.tick(later).await.unwrap();
        assert_eq!(fired, 1);

        let status = queue(&store).status("beat").await.unwrap();
        assert_eq!(status.pending, 2);
    }

    #[tokio::test]
    async fn bad_cron_rejected() {
        let store = Arc::new(MemStore::new());
        let mut scheduler = Scheduler::new(queue(&store));
        assert!(scheduler.schedule("x", "not a cron", json!({})).is_err());
    }
}
