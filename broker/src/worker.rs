//! The queue worker process.
//!
//! Owns the cron scheduler and every queue consumer. The master worker
//! itself is queue-driven: a cron entry publishes a `master-worker` job
//! each minute, and the handler re-publishes immediately while any
//! bucket did work (turbo).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::id::ActivationId;
use common::time::TimestampMs;
use numio_core::config_engine::{UpstreamSms, UpstreamStatus};
use numio_core::models::Job;
use numio_core::queue::{
    self, JobHandler, Scheduler,
};
use numio_core::traits::PublishOpts;
use numio_tokio::notify_once::NotifyOnce;
use serde_json::json;
use tracing::{info, warn};

use crate::context::AppContext;

const WORK_BATCH: usize = 20;
const IDLE_TICK: Duration = Duration::from_secs(1);

/// The worker loop: register crons, seed the master job, then drain the
/// queues until shutdown.
pub async fn run(
    ctx: Arc<AppContext>,
    mut shutdown: NotifyOnce,
) -> anyhow::Result<()> {
    let mut scheduler = Scheduler::new(ctx.queue.clone());
    // Cron format is seconds-first.
    scheduler.schedule(
        queue::SCHEDULED_SYNC,
        "0 0 0 * * *",
        json!({}),
    )?;
    scheduler.schedule(
        queue::LIFECYCLE_CLEANUP,
        "0 */10 * * * *",
        json!({}),
    )?;
    scheduler.schedule(
        queue::PAYMENT_RECONCILE,
        "0 */15 * * * *",
        json!({}),
    )?;
    scheduler.schedule(queue::MASTER_WORKER, "0 * * * * *", json!({}))?;
    scheduler.schedule(OUTBOX_PURGE, "0 0 * * * *", json!({}))?;

    // Kick the master immediately rather than waiting out the first
    // minute.
    ctx.queue
        .publish(queue::MASTER_WORKER, json!({}), PublishOpts::default())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let provider_sync = ProviderSyncHandler { ctx: ctx.clone() };
    let scheduled_sync = ScheduledSyncHandler { ctx: ctx.clone() };
    let cleanup = LifecycleCleanupHandler { ctx: ctx.clone() };
    let reconcile = PaymentReconcileHandler { ctx: ctx.clone() };
    let webhooks = WebhookProcessingHandler { ctx: ctx.clone() };
    let master = MasterWorkerHandler { ctx: ctx.clone() };
    let purge = OutboxPurgeHandler { ctx: ctx.clone() };

    info!("Worker running");
    loop {
        if shutdown.try_recv() {
            break;
        }

        if let Err(e) = scheduler.tick(TimestampMs::now()).await {
            warn!("Scheduler tick failed: {e}");
        }

        let batches: [(&str, &dyn JobHandler); 7] = [
            (queue::PROVIDER_SYNC, &provider_sync),
            (queue::SCHEDULED_SYNC, &scheduled_sync),
            (queue::LIFECYCLE_CLEANUP, &cleanup),
            (queue::PAYMENT_RECONCILE, &reconcile),
            (queue::WEBHOOK_PROCESSING, &webhooks),
            (queue::MASTER_WORKER, &master),
            (OUTBOX_PURGE, &purge),
        ];

        let mut handled = 0u64;
        for (queue_name, handler) in batches {
            match ctx
                .queue
                .work_batch(queue_name, WORK_BATCH, handler)
                .await
            {
                Ok(n) => handled += n,
                Err(e) => warn!("Queue '{queue_name}' failed: {e}"),
            }
        }

        if handled == 0 {
            tokio::select! {
                () = shutdown.recv() => break,
                () = tokio::time::sleep(IDLE_TICK) => (),
            }
        }
    }
    info!("Worker stopped");
    Ok(())
}

const OUTBOX_PURGE: &str = "outbox-purge";

// --- Handlers --- //

struct ProviderSyncHandler {
    ctx: Arc<AppContext>,
}

#[async_trait]
impl JobHandler for ProviderSyncHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        // Two payload shapes share this queue: an activation id means an
        // acquisition retry; a provider slug means a single-provider
        // sync.
        if let Some(activation_id) =
            job.payload.get("activation_id").and_then(|v| v.as_i64())
        {
            let activation = self
                .ctx
                .manager
                .activation(ActivationId(activation_id))
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            self.ctx
                .manager
                .run_provider_acquisition(activation)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            return Ok(());
        }

        if let Some(slug) =
            job.payload.get("provider_slug").and_then(|v| v.as_str())
        {
            let config = self
                .ctx
                .provider_store
                .get_by_slug(slug)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?
                .ok_or_else(|| {
                    anyhow::anyhow!("Unknown provider {slug}")
                })?;
            self.ctx
                .syncer
                .sync_provider(config)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            return Ok(());
        }

        let summary = self
            .ctx
            .syncer
            .sync_all()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        info!(
            "Provider sync: {}/{} providers, {} offers",
            summary.succeeded, summary.providers, summary.offers_written,
        );
        Ok(())
    }
}

struct ScheduledSyncHandler {
    ctx: Arc<AppContext>,
}

#[async_trait]
impl JobHandler for ScheduledSyncHandler {
    async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
        let summary = self
            .ctx
            .syncer
            .sync_all()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        // Integrity pass rides on the daily sync: prune disabled
        // providers' offers and orphaned icon assets.
        let all_configs = self
            .ctx
            .provider_store
            .list_active()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let live_icons: HashSet<String> = self
            .ctx
            .catalog
            .list_offers(None, None, false)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .into_iter()
            .filter_map(|offer| offer.icon_url)
            .collect();
        self.ctx
            .syncer
            .integrity_pass(&all_configs, None, &live_icons)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        info!(
            "Scheduled sync done: {}/{} providers",
            summary.succeeded, summary.providers,
        );
        Ok(())
    }
}

struct LifecycleCleanupHandler {
    ctx: Arc<AppContext>,
}

#[async_trait]
impl JobHandler for LifecycleCleanupHandler {
    async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
        let now = TimestampMs::now();
        let expired = self
            .ctx
            .manager
            .expire_due(now, 200)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let reservations = self
            .ctx
            .catalog
            .expire_pending_reservations(now, vec![])
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let stale = self
            .ctx
            .manager
            .fail_stale_reserved(now, 100)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        info!(
            "Cleanup: {expired} numbers expired, {reservations} \
             reservations released, {stale} stale purchases failed",
        );
        Ok(())
    }
}

struct PaymentReconcileHandler {
    ctx: Arc<AppContext>,
}

#[async_trait]
impl JobHandler for PaymentReconcileHandler {
    async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
        let refunded = self
            .ctx
            .manager
            .reconcile_refunds(200)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        if refunded > 0 {
            info!("Reconciled {refunded} refunds");
        }
        Ok(())
    }
}

struct WebhookProcessingHandler {
    ctx: Arc<AppContext>,
}

#[async_trait]
impl JobHandler for WebhookProcessingHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let slug = job
            .payload
            .get("provider_slug")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing provider_slug"))?;
        let upstream_id = job
            .payload
            .get("provider_activation_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                anyhow::anyhow!("Missing provider_activation_id")
            })?;

        let Some(adapter) = self.ctx.registry.get(slug) else {
            anyhow::bail!("No adapter for {slug}");
        };
        let provider_id = adapter.config().id;

        let Some(activation) = self
            .ctx
            .activation_store
            .find_by_provider_ref(provider_id, upstream_id)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?
        else {
            // A webhook for an activation we never created; note and ack.
            warn!("Webhook for unknown activation {slug}/{upstream_id}");
            return Ok(());
        };
        let Some(number_id) = activation.number_id else {
            warn!("Webhook for numberless activation {}", activation.id);
            return Ok(());
        };
        let number = self
            .ctx
            .number_store
            .get(number_id)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        // Ingest pushed messages through the same validation/dedup path
        // the poller uses.
        let messages: Vec<UpstreamSms> = job
            .payload
            .get("messages")
            .and_then(|v| v.as_array())
            .map(|raw| {
                raw.iter()
                    .filter_map(|m| {
                        Some(UpstreamSms {
                            id: m.get("id")?.as_str()?.to_owned(),
                            sender: m
                                .get("sender")
                                .and_then(|s| s.as_str())
                                .unwrap_or_default()
                                .to_owned(),
                            text: m.get("text")?.as_str()?.to_owned(),
                            received_at: m
                                .get("received_at")
                                .and_then(|t| t.as_i64())
                                .and_then(|ms| {
                                    TimestampMs::try_from_i64(ms).ok()
                                }),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let inserted = self
            .ctx
            .poller
            .ingest_messages(&number, &messages)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        if inserted > 0 {
            self.ctx
                .manager
                .mark_received(activation.id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }

        let status: Option<UpstreamStatus> = job
            .payload
            .get("status")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        if let Some(
            status @ (UpstreamStatus::Completed | UpstreamStatus::Cancelled),
        ) = status
        {
            self.ctx
                .manager
                .apply_upstream_terminal(number.id, status)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        Ok(())
    }
}

struct MasterWorkerHandler {
    ctx: Arc<AppContext>,
}

#[async_trait]
impl JobHandler for MasterWorkerHandler {
    async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
        let tick = self.ctx.master.tick().await;
        if tick.did_work() {
            // Turbo: more is probably queued right behind this tick.
            self.ctx
                .queue
                .publish(
                    queue::MASTER_WORKER,
                    json!({}),
                    PublishOpts::default(),
                )
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        Ok(())
    }
}

struct OutboxPurgeHandler {
    ctx: Arc<AppContext>,
}

#[async_trait]
impl JobHandler for OutboxPurgeHandler {
    async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
        let purged = self
            .ctx
            .outbox_dispatcher
            .purge()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        if purged > 0 {
            info!("Purged {purged} outbox rows");
        }
        Ok(())
    }
}
