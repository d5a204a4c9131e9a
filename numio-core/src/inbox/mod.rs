//! The inbox poller.
//!
//! Each tick selects due numbers and polls their upstream state under a
//! per-number distributed lock, with bounded concurrency. New SMS are
//! validated, deduplicated, persisted with code extraction, and fanned
//! out; upstream state changes reconcile through the activation manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::time::TimestampMs;
use futures::StreamExt;
use numio_api_core::error::ApiError;
use numio_tokio::notify_once::NotifyOnce;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::activation::ActivationManager;
use crate::audit::AuditWriter;
use crate::config_engine::{
    ProviderRegistry, StatusPoll, UpstreamSms, UpstreamStatus,
};
use crate::constants;
use crate::events::EventPublisher;
use crate::models::{AuditRecord, Number};
use crate::traits::{
    LockStore, NewSmsMessage, NumberStore, PollBookkeeping, RateLimiter,
    SmsStore,
};

/// Code extraction and content sanitation.
pub mod extract;
/// The adaptive poll schedule.
pub mod schedule;

/// A number polled this often in its first minutes is being hammered by
/// something; surface it instead of amplifying.
const POLL_COUNT_ANOMALY: u32 = 200;
/// Messages claiming to be from this far in the future are rejected.
const FUTURE_SLACK: Duration = Duration::from_secs(60);

/// What one poll attempt did, for the tick counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickOutcome {
    pub polled: u64,
    pub skipped_locked: u64,
    pub messages_ingested: u64,
    pub errors: u64,
}

pub struct InboxPoller {
    numbers: Arc<dyn NumberStore>,
    sms: Arc<dyn SmsStore>,
    manager: ActivationManager,
    providers: Arc<ProviderRegistry>,
    locks: Arc<dyn LockStore>,
    rate: Arc<dyn RateLimiter>,
    publisher: EventPublisher,
    audit: AuditWriter,
    shutdown: NotifyOnce,
}

impl InboxPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        numbers: Arc<dyn NumberStore>,
        sms: Arc<dyn SmsStore>,
        manager: ActivationManager,
        providers: Arc<ProviderRegistry>,
        locks: Arc<dyn LockStore>,
        rate: Arc<dyn RateLimiter>,
        publisher: EventPublisher,
        audit: AuditWriter,
        shutdown: NotifyOnce,
    ) -> Self {
        Self {
            numbers,
            sms,
            manager,
            providers,
            locks,
            rate,
            publisher,
            audit,
            shutdown,
        }
    }

    /// One poll tick: select due numbers, poll each under its lock with
    /// bounded concurrency, return counters.
    #[instrument(skip(self), name = "(inbox-tick)")]
    pub async fn tick(&self) -> Result<TickOutcome, ApiError> {
        let now = TimestampMs::now();
        let due = self
            .numbers
            .due_for_poll(
                now,
                constants::POLL_EXPIRY_SLACK,
                constants::POLL_MAX_ERRORS,
                constants::POLL_BATCH_SIZE,
            )
            .await?;

        let polled = AtomicU64::new(0);
        let skipped = AtomicU64::new(0);
        let ingested = AtomicU64::new(0);
        let errors = AtomicU64::new(0);

        futures::stream::iter(due)
            .for_each_concurrent(constants::POLL_CONCURRENCY, |number| {
                let counters = (&polled, &skipped, &ingested, &errors);
                async move {
                    // On shutdown: no new polls start; in-flight ones
                    // finish on their own time.
                    if self.shutdown.try_recv() {
                        return;
                    }
                    match self.poll_one(number).await {
                        PollResult::Polled { new_messages } => {
                            counters.0.fetch_add(1, Ordering::Relaxed);
                            counters
                                .2
                                .fetch_add(new_messages, Ordering::Relaxed);
                        }
                        PollResult::SkippedLocked => {
                            counters.1.fetch_add(1, Ordering::Relaxed);
                        }
                        PollResult::Errored => {
                            counters.3.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;

        let outcome = TickOutcome {
            polled: polled.into_inner(),
            skipped_locked: skipped.into_inner(),
            messages_ingested: ingested.into_inner(),
            errors: errors.into_inner(),
        };
        metrics::counter!("inbox_polls_total").increment(outcome.polled);
        metrics::counter!("inbox_messages_ingested_total")
            .increment(outcome.messages_ingested);
        Ok(outcome)
    }

    async fn poll_one(&self, number: Number) -> PollResult {
        let lock_key = format!("poll:lock:{}", number.id);
        let guard = match self
            .locks
            .try_acquire(&lock_key, constants::POLL_LOCK_TTL)
            .await
        {
            Ok(Some(guard)) => guard,
            // Held elsewhere: a skip, not an error.
            Ok(None) => return PollResult::SkippedLocked,
            Err(e) => {
                warn!("Lock acquire failed for {lock_key}: {e}");
                return PollResult::Errored;
            }
        };

        let result = self.poll_locked(&number).await;

        if let Err(e) = self.locks.release(guard).await {
            warn!("Lock release failed for {lock_key}: {e}");
        }

        match result {
            Ok(new_messages) => PollResult::Polled { new_messages },
            Err(e) => {
                warn!("Poll failed for number {}: {e}", number.id);
                self.record_outcome(&number, None, true).await;
                PollResult::Errored
            }
        }
    }

    /// The body of one poll, executed while holding the number's lock.
    async fn poll_locked(
        &self,
        number: &Number,
    ) -> Result<u64, ApiError> {
        let now = TimestampMs::now();

        // Per-number rate limit (sliding window), then per-provider.
        let number_key = format!("rate:poll:num:{}", number.id);
        let decision = self
            .rate
            .check(
                &number_key,
                constants::POLL_RATE_PER_MIN,
                Duration::from_secs(60),
            )
            .await?;
        if !decision.allowed {
            debug!("Number {} poll rate-limited", number.id);
            self.record_outcome(number, None, false).await;
            return Ok(0);
        }
        let provider_key = format!("rate:poll:provider:{}", number.provider_id);
        let decision = self
            .rate
            .check(
                &provider_key,
                constants::SYNC_RATE_PER_MIN,
                Duration::from_secs(60),
            )
            .await?;
        if !decision.allowed {
            debug!(
                "Provider {} poll rate-limited",
                number.provider_id,
            );
            self.record_outcome(number, None, false).await;
            return Ok(0);
        }

        // Anomaly: absurd poll count for a short-lived activation.
        let age = now.saturating_duration_since(number.created_at);
        if number.poll_count > POLL_COUNT_ANOMALY
            && age < Duration::from_secs(600)
        {
            self.audit.record(AuditRecord::new(
                "poll",
                format!("number:{}", number.id),
                json!({
                    "step": "anomaly",
                    "poll_count": number.poll_count,
                }),
            ));
            metrics::counter!("inbox_poll_anomalies_total").increment(1);
        }

        let activation =
            self.manager_activation(number).await?;
        let Some(upstream_id) =
            activation.provider_activation_id.as_deref()
        else {
            // Nothing to poll yet.
            self.record_outcome(number, None, false).await;
            return Ok(0);
        };
        let adapter = self
            .providers
            .get(&activation.provider_slug)
            .ok_or_else(|| {
                ApiError::new(
                    numio_api_core::error::ErrorKind::ProviderUnavailable,
                    format!("No adapter for {}", activation.provider_slug),
                )
            })?;

        let poll: StatusPoll = adapter
            .status(upstream_id)
            .await
            .map_err(ApiError::from)?;

        // Validate, dedup, persist, extract.
        let new_messages =
            self.ingest_messages(number, &poll.messages).await?;

        // State reconciliation.
        match poll.status {
            UpstreamStatus::Received if new_messages > 0 => {
                self.manager.mark_received(number.activation_id).await?;
            }
            UpstreamStatus::Completed | UpstreamStatus::Cancelled => {
                self.manager
                    .apply_upstream_terminal(number.id, poll.status)
                    .await?;
            }
            _ => (),
        }

        self.audit.record(AuditRecord::new(
            "poll",
            format!("number:{}", number.id),
            json!({
                "step": "polled",
                "status": format!("{:?}", poll.status),
                "new_messages": new_messages,
            }),
        ));

        self.record_outcome(number, Some(new_messages), false).await;
        Ok(new_messages)
    }

    /// Validates and persists a batch of upstream messages, publishing a
    /// fan-out event per accepted message. Returns how many were new.
    pub async fn ingest_messages(
        &self,
        number: &Number,
        messages: &[UpstreamSms],
    ) -> Result<u64, ApiError> {
        if messages.is_empty() {
            return Ok(0);
        }
        let now = TimestampMs::now();
        let mut batch = Vec::with_capacity(messages.len());

        for message in messages {
            let content = extract::sanitize(&message.text);
            if content.is_empty() {
                continue;
            }
            let received_at = message.received_at.unwrap_or(now);

            // Timing anomalies: before the number existed, or from the
            // future.
            if received_at < number.created_at
                || received_at > now.saturating_add(FUTURE_SLACK)
            {
                self.audit.record(AuditRecord::new(
                    "poll",
                    format!("number:{}", number.id),
                    json!({
                        "step": "rejected_timing",
                        "received_at": received_at.as_i64(),
                    }),
                ));
                continue;
            }

            let hash = extract::content_hash(&content);
            let extraction =
                extract::extract_code(&number.service, &content);
            let sender = extract::sanitize(&message.sender);

            batch.push(NewSmsMessage {
                id: format!("{}_{}", number.id, message.id),
                number_id: number.id,
                fingerprint: format!("{sender}:{hash}"),
                sender,
                content,
                code: extraction.as_ref().map(|e| e.code.clone()),
                confidence: extraction.as_ref().map(|e| e.confidence),
                received_at,
                content_hash: hash,
            });
        }

        let inserted = self
            .sms
            .insert_batch(batch, constants::SMS_DEDUP_WINDOW)
            .await?;

        for message in &inserted {
            let _ = self
                .publisher
                .publish_user(
                    number.user_id,
                    "sms.received",
                    json!({
                        "number_id": number.id.0,
                        "sender": message.sender,
                        "code": message.code,
                        "received_at": message.received_at.as_i64(),
                    }),
                    None,
                )
                .await;
        }
        Ok(inserted.len() as u64)
    }

    async fn manager_activation(
        &self,
        number: &Number,
    ) -> Result<crate::models::Activation, ApiError> {
        Ok(self.manager.activation(number.activation_id).await?)
    }

    /// Writes the post-attempt bookkeeping: error counts and the next
    /// adaptive poll time.
    async fn record_outcome(
        &self,
        number: &Number,
        new_messages: Option<u64>,
        errored: bool,
    ) {
        let now = TimestampMs::now();
        let error_count = if errored {
            number.error_count + 1
        } else {
            0
        };

        // Approximate "time since first SMS" from whether this number has
        // any messages at all.
        let since_first_sms = match new_messages {
            Some(n) if n > 0 => Some(Duration::ZERO),
            _ => match self.sms.count_for_number(number.id).await {
                Ok(0) | Err(_) => None,
                Ok(_) => number
                    .last_polled_at
                    .map(|at| now.saturating_duration_since(at)),
            },
        };

        let delay = schedule::next_poll_delay(schedule::PollContext {
            age: now.saturating_duration_since(number.created_at),
            since_first_sms,
            errored,
        });

        if error_count >= constants::POLL_MAX_ERRORS {
            warn!(
                "Number {} stalled after {error_count} consecutive errors",
                number.id,
            );
            metrics::counter!("inbox_numbers_stalled_total").increment(1);
            self.audit.record(AuditRecord::new(
                "poll",
                format!("number:{}", number.id),
                json!({ "step": "stalled" }),
            ));
        }

        let result = self
            .numbers
            .record_poll(
                number.id,
                PollBookkeeping {
                    status: None,
                    error_count,
                    next_poll_at: now.saturating_add(delay),
                    last_polled_at: now,
                    poll_count: number.poll_count + 1,
                },
            )
            .await;
        if let Err(e) = result {
            warn!("Poll bookkeeping failed for {}: {e}", number.id);
        }
    }
}

enum PollResult {
    Polled { new_messages: u64 },
    SkippedLocked,
    Errored,
}

#[cfg(test)]
mod test {
    use common::id::{CountryCode, ServiceSlug, UserId};
    use common::money::Amount;

    use super::*;
    use crate::store::memory::MemStore;
    use crate::traits::NewNumber;

    async fn seed_number(store: &Arc<MemStore>) -> Number {
        use crate::traits::NumberStore;
        store
            .create(NewNumber {
                user_id: UserId(1),
                activation_id: common::id::ActivationId(1),
                provider_id: common::id::ProviderId(1),
                phone_number: "+15551230000".to_owned(),
                service: ServiceSlug::new("tg").unwrap(),
                country: CountryCode::new("us").unwrap(),
                price: Amount::from_major(100),
                expires_at: TimestampMs::MAX,
                next_poll_at: TimestampMs::MIN,
            })
            .await
            .unwrap()
    }

    fn upstream_sms(id: &str, text: &str) -> UpstreamSms {
        UpstreamSms {
            id: id.to_owned(),
            sender: "TG".to_owned(),
            text: text.to_owned(),
            received_at: None,
        }
    }

    struct TestPoller {
        store: Arc<MemStore>,
        poller: InboxPoller,
        _audit_task: numio_tokio::task::NxTask<()>,
    }

    async fn test_poller() -> TestPoller {
        let store = Arc::new(MemStore::new());
        let ledger = crate::ledger::LedgerService::new(store.clone());
        let publisher = EventPublisher::new(
            store.clone(),
            store.clone(),
            "test",
        );
        let (audit, audit_task) = AuditWriter::spawn(
            store.clone(),
            NotifyOnce::new(),
        );
        let registry = Arc::new(ProviderRegistry::empty());
        let manager = ActivationManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            ledger,
            registry.clone(),
            publisher.clone(),
            audit.clone(),
        );
        let poller = InboxPoller::new(
            store.clone(),
            store.clone(),
            manager,
            registry,
            store.clone(),
            store.clone(),
            publisher,
            audit,
            NotifyOnce::new(),
        );
        TestPoller {
            store,
            poller,
            _audit_task: audit_task,
        }
    }

    /// Same composite id, or same content hash within the
    /// window, inserts exactly one row.
    #[tokio::test]
    async fn ingest_dedups() {
        let t = test_poller().await;
        let number = seed_number(&t.store).await;

        let first = t
            .poller
            .ingest_messages(
                &number,
                &[
                    upstream_sms("m1", "Your code is 842193"),
                    // Same composite id.
                    upstream_sms("m1", "Your code is 842193"),
                    // Different id, same content within the window.
                    upstream_sms("m2", "Your code is 842193"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(first, 1);

        // Replaying the same upstream batch inserts nothing.
        let second = t
            .poller
            .ingest_messages(
                &number,
                &[upstream_sms("m1", "Your code is 842193")],
            )
            .await
            .unwrap();
        assert_eq!(second, 0);

        let stored = t.store.list_for_number(number.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].code.as_deref(), Some("842193"));
        assert!(stored[0].confidence.unwrap() >= 0.8);
    }

    #[tokio::test]
    async fn ingest_rejects_timing_anomalies() {
        let t = test_poller().await;
        let number = seed_number(&t.store).await;

        let mut message = upstream_sms("m1", "code 1234");
        // Timestamped long before the number existed.
        message.received_at = Some(TimestampMs::MIN);
        let accepted = t
            .poller
            .ingest_messages(&number, &[message])
            .await
            .unwrap();
        assert_eq!(accepted, 0);

        let mut message = upstream_sms("m2", "code 1234");
        message.received_at = Some(TimestampMs::MAX);
        let accepted = t
            .poller
            .ingest_messages(&number, &[message])
            .await
            .unwrap();
        assert_eq!(accepted, 0);
    }

    #[tokio::test]
    async fn accepted_messages_fan_out() {
        let t = test_poller().await;
        let number = seed_number(&t.store).await;

        t.poller
            .ingest_messages(
                &number,
                &[upstream_sms("m1", "Your code is 842193")],
            )
            .await
            .unwrap();

        let events = t.store.published_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "sms.received");
        assert_eq!(events[0].room, "user:1");
        assert_eq!(events[0].payload["code"], "842193");
    }
}
