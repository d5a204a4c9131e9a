//! The master worker tick.
//!
//! One tick runs the four housekeeping buckets in sequence (outbox
//! dispatch, inbox polling, notification delivery, reservation cleanup)
//! and reports per-bucket counts. The worker loop re-invokes the tick
//! immediately while any bucket did work (turbo mode) and falls back to
//! the idle delay otherwise.

use std::sync::Arc;
use std::time::Duration;

use common::time::TimestampMs;
use numio_api_core::error::ApiError;
use numio_tokio::notify_once::NotifyOnce;
use tracing::{info, instrument, warn};

use crate::activation::ActivationManager;
use crate::inbox::InboxPoller;
use crate::outbox::OutboxDispatcher;
use crate::queue::deliver::NotificationDeliverer;
use crate::queue::{JobQueue, NOTIFICATION_DELIVERY};
use crate::traits::CatalogStore;

/// What one master tick accomplished.
#[derive(Clone, Copy, Debug, Default)]
pub struct MasterTick {
    pub outbox_dispatched: u64,
    pub numbers_polled: u64,
    pub notifications_delivered: u64,
    pub reservations_expired: u64,
    pub numbers_expired: u64,
    pub refunds_reconciled: u64,
}

impl MasterTick {
    /// Whether anything at all happened; drives turbo re-invocation.
    pub fn did_work(&self) -> bool {
        self.outbox_dispatched
            + self.numbers_polled
            + self.notifications_delivered
            + self.reservations_expired
            + self.numbers_expired
            + self.refunds_reconciled
            > 0
    }
}

pub struct MasterWorker {
    outbox: Arc<OutboxDispatcher>,
    poller: Arc<InboxPoller>,
    deliverer: Arc<NotificationDeliverer>,
    queue: JobQueue,
    catalog: Arc<dyn CatalogStore>,
    manager: ActivationManager,
}

impl MasterWorker {
    pub fn new(
        outbox: Arc<OutboxDispatcher>,
        poller: Arc<InboxPoller>,
        deliverer: Arc<NotificationDeliverer>,
        queue: JobQueue,
        catalog: Arc<dyn CatalogStore>,
        manager: ActivationManager,
    ) -> Self {
        Self {
            outbox,
            poller,
            deliverer,
            queue,
            catalog,
            manager,
        }
    }

    /// One sequential pass over all buckets. Individual bucket failures
    /// are logged and don't starve the others.
    #[instrument(skip(self), name = "(master-tick)")]
    pub async fn tick(&self) -> MasterTick {
        let mut tick = MasterTick::default();
        let now = TimestampMs::now();

        match self.outbox.tick().await {
            Ok(n) => tick.outbox_dispatched = n,
            Err(e) => warn!("Outbox bucket failed: {e}"),
        }

        match self.poller.tick().await {
            Ok(outcome) => tick.numbers_polled = outcome.polled,
            Err(e) => warn!("Inbox bucket failed: {e}"),
        }

        match self
            .queue
            .work_batch(NOTIFICATION_DELIVERY, 20, self.deliverer.as_ref())
            .await
        {
            Ok(n) => tick.notifications_delivered = n,
            Err(e) => warn!("Notification bucket failed: {e}"),
        }

        tick.reservations_expired =
            match self.catalog.expire_pending_reservations(now, vec![]).await
            {
                Ok(n) => n,
                Err(e) => {
                    warn!("Reservation cleanup failed: {e}");
                    0
                }
            };

        match self.manager.expire_due(now, 100).await {
            Ok(n) => tick.numbers_expired = n,
            Err(e) => warn!("Expiry bucket failed: {e}"),
        }
        match self.manager.reconcile_refunds(100).await {
            Ok(n) => tick.refunds_reconciled = n,
            Err(e) => warn!("Refund reconcile failed: {e}"),
        }

        tick
    }

    /// The worker loop: tick, then either re-invoke immediately (turbo)
    /// or sleep the idle delay; cancellable between steps.
    pub async fn run(
        &self,
        idle_delay: Duration,
        mut shutdown: NotifyOnce,
    ) -> Result<(), ApiError> {
        info!("Master worker running");
        loop {
            if shutdown.try_recv() {
                break;
            }
            let tick = self.tick().await;
            if tick.did_work() {
                // Turbo: more work is likely queued right behind.
                continue;
            }
            tokio::select! {
                () = shutdown.recv() => break,
                () = tokio::time::sleep(idle_delay) => (),
            }
        }
        info!("Master worker stopped");
        Ok(())
    }
}

/// The default idle delay between master ticks.
pub const MASTER_IDLE_DELAY: Duration = Duration::from_secs(5);
