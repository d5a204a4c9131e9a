//! Outbound webhook delivery.
//!
//! Consumes `notification-delivery` jobs: each payload names a
//! subscriber URL, a signing secret, and the event body. Deliveries are
//! signed the same way we verify inbound webhooks (HMAC-SHA256 over
//! `"{ts}.{body}"`). Failures re-publish with the escalating schedule
//! (1, 5, 15, 60, 360 minutes); after the fifth attempt the job is dead.

use async_trait::async_trait;
use common::time::TimestampMs;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::WEBHOOK_DELIVERY_TIMEOUT;
use crate::models::Job;
use crate::queue::{JobHandler, JobQueue, NOTIFICATION_DELIVERY};
use crate::traits::PublishOpts;
use crate::webhook;

#[derive(Deserialize)]
struct DeliveryPayload {
    url: String,
    secret: String,
    event_type: String,
    body: serde_json::Value,
    #[serde(default)]
    attempt: u32,
}

pub struct NotificationDeliverer {
    http: reqwest::Client,
    queue: JobQueue,
}

impl NotificationDeliverer {
    pub fn new(http: reqwest::Client, queue: JobQueue) -> Self {
        Self { http, queue }
    }

    async fn deliver(
        &self,
        payload: &DeliveryPayload,
    ) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&serde_json::json!({
            "type": payload.event_type,
            "payload": payload.body,
        }))?;
        let ts = TimestampMs::now().as_i64() / 1000;
        let signature = webhook::sign(payload.secret.as_bytes(), ts, &body);

        let response = self
            .http
            .post(&payload.url)
            .header(webhook::SIGNATURE_HEADER, signature)
            .header(webhook::TIMESTAMP_HEADER, ts.to_string())
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(WEBHOOK_DELIVERY_TIMEOUT)
            .send()
            .await?;

        anyhow::ensure!(
            response.status().is_success(),
            "Subscriber answered HTTP {}",
            response.status(),
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for NotificationDeliverer {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: DeliveryPayload =
            serde_json::from_value(job.payload.clone())?;

        match self.deliver(&payload).await {
            Ok(()) => {
                debug!(
                    "Delivered '{}' to {}",
                    payload.event_type, payload.url,
                );
                metrics::counter!(
                    "webhook_deliveries_total", "status" => "ok"
                )
                .increment(1);
                Ok(())
            }
            Err(e) => {
                metrics::counter!(
                    "webhook_deliveries_total", "status" => "error"
                )
                .increment(1);
                // Drive the escalating schedule ourselves: each failed
                // attempt re-publishes with the next delay, and the
                // original job completes. Out of schedule => dead.
                match common::backoff::webhook_delivery_delay(
                    payload.attempt,
                ) {
                    Some(delay) => {
                        warn!(
                            "Delivery to {} failed (attempt {}): {e:#}; \
                             retrying in {delay:?}",
                            payload.url, payload.attempt,
                        );
                        let mut next = job.payload.clone();
                        next["attempt"] =
                            serde_json::json!(payload.attempt + 1);
                        self.queue
                            .publish(
                                NOTIFICATION_DELIVERY,
                                next,
                                PublishOpts {
                                    start_after: Some(
                                        TimestampMs::now()
                                            .saturating_add(delay),
                                    ),
                                    correlation_id: job.correlation_id,
                                },
                            )
                            .await
                            .map_err(|e| anyhow::anyhow!("{e}"))?;
                        Ok(())
                    }
                    None => anyhow::bail!(
                        "Delivery to {} exhausted its schedule: {e:#}",
                        payload.url,
                    ),
                }
            }
        }
    }
}
