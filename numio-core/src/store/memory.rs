//! A single in-process implementation of every seam trait.
//!
//! Backs unit tests and the end-to-end scenario tests. Semantics mirror
//! the Postgres implementation: the mutex plays the role of the row
//! locks, so anything that must be transactional there is a single
//! locked section here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::id::{
    ActivationId, CountryCode, IdempotencyKey, JobId, LedgerTxId, NumberId,
    OfferId, OutboxEventId, ProviderId, ReservationId, ServiceSlug, UserId,
};
use common::money::{Amount, SignedAmount};
use common::time::TimestampMs;
use numio_api_core::models::{
    CountryAggregateRow, EventEnvelope, ServiceAggregateRow, ServiceSort,
};
use numio_api_core::types::{
    ActivationState, NumberStatus, PageRequest, WalletTransaction,
};
use numio_tokio::events_bus::EventsBus;
use uuid::Uuid;

use crate::config_engine::ProviderConfig;
use crate::models::{
    Activation, ActivationPatch, AuditRecord, Job, JobState, NewOffer,
    NewOutboxEvent, Number, Offer, OfferReservation, OutboxEvent,
    ProviderCountry, ProviderService, ReservationState, SmsMessage,
    SyncStatus, Wallet, WebhookEvent,
};
use crate::traits::{
    ActivationStore, AuditSink, CatalogStore, EventTransport, KvCache,
    LedgerApplied, LedgerMutation, LockGuard, LockStore, NewActivation,
    NewNumber, NewSmsMessage, NumberStore, OutboxStats, OutboxStore,
    PollBookkeeping, ProviderStore, PublishOpts, QueueStatus, QueueStore,
    RateDecision, RateLimiter, SmsStore, StoreError, WalletStore,
    WebhookStore,
};

#[derive(Default)]
struct State {
    // Wallets & ledger.
    wallets: HashMap<UserId, Wallet>,
    ledger: Vec<WalletTransaction>,
    ledger_by_key: HashMap<String, LedgerTxId>,
    next_tx_id: i64,

    // Activations & numbers.
    activations: HashMap<ActivationId, Activation>,
    next_activation_id: i64,
    numbers: HashMap<NumberId, Number>,
    next_number_id: i64,

    // SMS.
    sms: Vec<SmsMessage>,
    sms_ids: HashSet<String>,

    // Catalogue.
    offers: HashMap<OfferId, Offer>,
    offer_index: HashMap<(i64, String, String, String), OfferId>,
    next_offer_id: i64,
    reservations: HashMap<ReservationId, OfferReservation>,
    next_reservation_id: i64,
    service_aggregates: Vec<ServiceAggregateRow>,
    country_aggregates: HashMap<String, Vec<CountryAggregateRow>>,

    // Providers.
    provider_configs: HashMap<ProviderId, ProviderConfig>,
    provider_countries: HashMap<ProviderId, Vec<ProviderCountry>>,
    provider_services: HashMap<ProviderId, Vec<ProviderService>>,
    provider_sync: HashMap<ProviderId, (SyncStatus, Option<String>)>,
    provider_balances: HashMap<ProviderId, (Amount, TimestampMs)>,
    provider_metadata_synced: HashMap<ProviderId, TimestampMs>,

    // Outbox & webhooks.
    outbox: Vec<OutboxEvent>,
    next_outbox_id: i64,
    webhook_keys: HashSet<String>,
    webhooks: Vec<WebhookEvent>,

    // Queue.
    jobs: Vec<Job>,
    next_job_id: i64,

    // Locks / cache / rate limits.
    locks: HashMap<String, (String, Instant)>,
    kv: HashMap<String, (String, Instant)>,
    rate: HashMap<String, VecDeque<Instant>>,

    // Event transport.
    streams: HashMap<UserId, VecDeque<(String, EventEnvelope)>>,
    stream_seq: u64,
    published: Vec<EventEnvelope>,

    // Audit.
    audit: Vec<AuditRecord>,
}

pub struct MemStore {
    state: Mutex<State>,
    /// Mirrors the Redis pub/sub channel for in-process subscribers.
    global_bus: EventsBus<EventEnvelope>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            global_bus: EventsBus::new(),
        }
    }

    /// In-process stand-in for subscribing to `events:global`.
    pub fn global_bus(&self) -> &EventsBus<EventEnvelope> {
        &self.global_bus
    }

    /// Everything published so far, for test assertions.
    pub fn published_events(&self) -> Vec<EventEnvelope> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.state.lock().unwrap().audit.clone()
    }

    pub fn put_provider_config(&self, config: ProviderConfig) {
        let mut state = self.state.lock().unwrap();
        state.provider_configs.insert(config.id, config);
    }

    /// Raw outbox contents, for test assertions.
    pub fn outbox_rows(&self) -> Vec<OutboxEvent> {
        self.state.lock().unwrap().outbox.clone()
    }

    fn append_outbox(state: &mut State, events: Vec<NewOutboxEvent>) {
        let now = TimestampMs::now();
        for event in events {
            state.next_outbox_id += 1;
            state.outbox.push(OutboxEvent {
                id: OutboxEventId(state.next_outbox_id),
                aggregate_type: event.aggregate_type,
                aggregate_id: event.aggregate_id,
                event_type: event.event_type,
                payload: event.payload,
                processed: false,
                retry_count: 0,
                processed_at: None,
                error: None,
                created_at: now,
            });
        }
    }

    fn wallet_entry(state: &mut State, user_id: UserId) -> &mut Wallet {
        state.wallets.entry(user_id).or_insert_with(|| Wallet {
            user_id,
            balance: Amount::ZERO,
            reserved: Amount::ZERO,
            updated_at: TimestampMs::now(),
        })
    }
}

// --- WalletStore --- //

#[async_trait]
impl WalletStore for MemStore {
    async fn wallet(&self, user_id: UserId) -> Result<Wallet, StoreError> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::wallet_entry(&mut state, user_id).clone())
    }

    async fn apply(
        &self,
        mutation: LedgerMutation,
    ) -> Result<LedgerApplied, StoreError> {
        let mut state = self.state.lock().unwrap();

        // Idempotent replay: return the stored row verbatim.
        if let Some(key) = &mutation.idempotency_key {
            if let Some(tx_id) = state.ledger_by_key.get(key.as_str()) {
                let tx = state
                    .ledger
                    .iter()
                    .find(|tx| tx.id == *tx_id)
                    .cloned()
                    .ok_or_else(|| {
                        StoreError::Internal(
                            "Dangling idempotency key".to_owned(),
                        )
                    })?;
                let wallet =
                    Self::wallet_entry(&mut state, mutation.user_id);
                return Ok(LedgerApplied {
                    tx,
                    balance: wallet.balance,
                    reserved: wallet.reserved,
                    replayed: true,
                });
            }
        }

        let wallet = Self::wallet_entry(&mut state, mutation.user_id);

        if let Some(required) = mutation.require_available {
            let available = wallet.available();
            if available < required {
                return Err(StoreError::InsufficientFunds);
            }
        }

        let new_balance = wallet
            .balance
            .to_signed()
            .checked_add(mutation.amount)
            .and_then(|sum| sum.to_unsigned().ok())
            .ok_or_else(|| {
                StoreError::Conflict("Balance underflow".to_owned())
            })?;
        let new_reserved = wallet
            .reserved
            .to_signed()
            .checked_add(mutation.reserved_delta)
            .and_then(|sum| sum.to_unsigned().ok())
            .ok_or_else(|| {
                StoreError::Conflict("Reserved underflow".to_owned())
            })?;

        wallet.balance = new_balance;
        wallet.reserved = new_reserved;
        wallet.updated_at = TimestampMs::now();
        let (balance, reserved) = (wallet.balance, wallet.reserved);

        state.next_tx_id += 1;
        let tx = WalletTransaction {
            id: LedgerTxId(state.next_tx_id),
            user_id: mutation.user_id,
            amount: mutation.amount,
            kind: mutation.kind,
            description: mutation.description,
            idempotency_key: mutation.idempotency_key.clone(),
            created_at: TimestampMs::now(),
        };
        if let Some(key) = &mutation.idempotency_key {
            state
                .ledger_by_key
                .insert(key.as_str().to_owned(), tx.id);
        }
        state.ledger.push(tx.clone());

        Ok(LedgerApplied {
            tx,
            balance,
            reserved,
            replayed: false,
        })
    }

    async fn transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<(Vec<WalletTransaction>, u64), StoreError> {
        let state = self.state.lock().unwrap();
        let page = page.clamped();
        let mut rows: Vec<_> = state
            .ledger
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|tx| std::cmp::Reverse(tx.id.0));
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect();
        Ok((items, total))
    }

    async fn sum_ledger(
        &self,
        user_id: UserId,
    ) -> Result<SignedAmount, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ledger
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .map(|tx| tx.amount)
            .sum())
    }
}

// --- ActivationStore --- //

#[async_trait]
impl ActivationStore for MemStore {
    async fn create(
        &self,
        new: NewActivation,
    ) -> Result<Activation, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.next_activation_id += 1;
        let now = TimestampMs::now();
        let activation = Activation {
            id: ActivationId(state.next_activation_id),
            user_id: new.user_id,
            provider_id: new.provider_id,
            provider_slug: new.provider_slug,
            price: new.price,
            idempotency_key: new.idempotency_key,
            reserved_tx: new.reserved_tx,
            captured_tx: None,
            refund_tx: None,
            state: ActivationState::Reserved,
            service: new.service,
            country: new.country,
            operator_id: new.operator_id,
            provider_activation_id: None,
            phone_number: None,
            expires_at: new.expires_at,
            number_id: None,
            reservation_id: new.reservation_id,
            created_at: now,
            updated_at: now,
        };
        state.activations.insert(activation.id, activation.clone());
        Ok(activation)
    }

    async fn get(&self, id: ActivationId) -> Result<Activation, StoreError> {
        self.state
            .lock()
            .unwrap()
            .activations
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> Result<Option<Activation>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .activations
            .values()
            .find(|a| {
                a.user_id == user_id
                    && a.idempotency_key.as_ref() == Some(key)
            })
            .cloned())
    }

    async fn find_by_provider_ref(
        &self,
        provider_id: ProviderId,
        provider_activation_id: &str,
    ) -> Result<Option<Activation>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .activations
            .values()
            .find(|a| {
                a.provider_id == provider_id
                    && a.provider_activation_id.as_deref()
                        == Some(provider_activation_id)
            })
            .cloned())
    }

    async fn transition(
        &self,
        id: ActivationId,
        from: ActivationState,
        to: ActivationState,
        patch: ActivationPatch,
        events: Vec<NewOutboxEvent>,
    ) -> Result<Activation, StoreError> {
        let mut state = self.state.lock().unwrap();
        let activation = state
            .activations
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        if activation.state != from {
            return Err(StoreError::Conflict(format!(
                "Activation {id} is {:?}, not {from:?}",
                activation.state,
            )));
        }

        activation.state = to;
        activation.updated_at = TimestampMs::now();
        if let Some(tx) = patch.captured_tx {
            activation.captured_tx = Some(tx);
        }
        if let Some(tx) = patch.refund_tx {
            activation.refund_tx = Some(tx);
        }
        if let Some(pid) = patch.provider_activation_id {
            activation.provider_activation_id = Some(pid);
        }
        if let Some(phone) = patch.phone_number {
            activation.phone_number = Some(phone);
        }
        if let Some(number_id) = patch.number_id {
            activation.number_id = Some(number_id);
        }
        if let Some(expires_at) = patch.expires_at {
            activation.expires_at = expires_at;
        }
        let updated = activation.clone();

        Self::append_outbox(&mut state, events);
        Ok(updated)
    }

    async fn list_refundable(
        &self,
        limit: usize,
    ) -> Result<Vec<Activation>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .activations
            .values()
            .filter(|a| a.state.is_refundable())
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.id.0);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_stale_reserved(
        &self,
        older_than: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Activation>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .activations
            .values()
            .filter(|a| {
                a.state == ActivationState::Reserved
                    && a.created_at < older_than
            })
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.id.0);
        rows.truncate(limit);
        Ok(rows)
    }
}

// --- NumberStore --- //

#[async_trait]
impl NumberStore for MemStore {
    async fn create(&self, new: NewNumber) -> Result<Number, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.next_number_id += 1;
        let number = Number {
            id: NumberId(state.next_number_id),
            user_id: new.user_id,
            activation_id: new.activation_id,
            provider_id: new.provider_id,
            phone_number: new.phone_number,
            status: NumberStatus::Active,
            service: new.service,
            country: new.country,
            price: new.price,
            expires_at: new.expires_at,
            error_count: 0,
            next_poll_at: new.next_poll_at,
            last_polled_at: None,
            poll_count: 0,
            created_at: TimestampMs::now(),
        };
        state.numbers.insert(number.id, number.clone());
        Ok(number)
    }

    async fn get(&self, id: NumberId) -> Result<Number, StoreError> {
        self.state
            .lock()
            .unwrap()
            .numbers
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        status: Option<NumberStatus>,
        page: PageRequest,
    ) -> Result<(Vec<Number>, u64), StoreError> {
        let state = self.state.lock().unwrap();
        let page = page.clamped();
        let mut rows: Vec<_> = state
            .numbers
            .values()
            .filter(|n| n.user_id == user_id)
            .filter(|n| status.is_none_or(|s| n.status == s))
            .cloned()
            .collect();
        rows.sort_by_key(|n| std::cmp::Reverse(n.id.0));
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect();
        Ok((items, total))
    }

    async fn due_for_poll(
        &self,
        now: TimestampMs,
        slack: Duration,
        max_errors: u32,
        limit: usize,
    ) -> Result<Vec<Number>, StoreError> {
        let state = self.state.lock().unwrap();
        let horizon = now.saturating_add(slack);
        let mut rows: Vec<_> = state
            .numbers
            .values()
            .filter(|n| {
                matches!(
                    n.status,
                    NumberStatus::Active | NumberStatus::Received
                ) && n.error_count < max_errors
                    && n.expires_at > horizon
                    && n.next_poll_at <= now
            })
            .cloned()
            .collect();
        // Received-first (drain likely inboxes), then oldest first.
        rows.sort_by_key(|n| {
            (n.status != NumberStatus::Received, n.created_at, n.id.0)
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_expired(
        &self,
        now: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Number>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .numbers
            .values()
            .filter(|n| !n.status.is_terminal() && n.expires_at <= now)
            .cloned()
            .collect();
        rows.sort_by_key(|n| n.id.0);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn record_poll(
        &self,
        id: NumberId,
        bookkeeping: PollBookkeeping,
    ) -> Result<Number, StoreError> {
        let mut state = self.state.lock().unwrap();
        let number =
            state.numbers.get_mut(&id).ok_or(StoreError::NotFound)?;

        if let Some(status) = bookkeeping.status {
            // Terminal statuses never regress.
            if number.status.is_terminal() && number.status != status {
                return Err(StoreError::Conflict(format!(
                    "Number {id} is terminal ({:?})",
                    number.status,
                )));
            }
            number.status = status;
        }
        number.error_count = bookkeeping.error_count;
        number.next_poll_at = bookkeeping.next_poll_at;
        number.last_polled_at = Some(bookkeeping.last_polled_at);
        number.poll_count = bookkeeping.poll_count;
        Ok(number.clone())
    }
}

// --- SmsStore --- //

#[async_trait]
impl SmsStore for MemStore {
    async fn insert_batch(
        &self,
        messages: Vec<NewSmsMessage>,
        dedup_window: Duration,
    ) -> Result<Vec<SmsMessage>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut inserted = Vec::new();

        for new in messages {
            if state.sms_ids.contains(&new.id) {
                continue;
            }
            let window_dup = state.sms.iter().any(|existing| {
                existing.number_id == new.number_id
                    && existing.content_hash == new.content_hash
                    && existing
                        .received_at
                        .saturating_duration_since(new.received_at)
                        .min(
                            new.received_at.saturating_duration_since(
                                existing.received_at,
                            ),
                        )
                        <= dedup_window
            });
            if window_dup {
                continue;
            }

            let message = SmsMessage {
                id: new.id.clone(),
                number_id: new.number_id,
                sender: new.sender,
                content: new.content,
                code: new.code,
                confidence: new.confidence,
                received_at: new.received_at,
                content_hash: new.content_hash,
                fingerprint: new.fingerprint,
            };
            state.sms_ids.insert(new.id);
            state.sms.push(message.clone());
            inserted.push(message);
        }
        Ok(inserted)
    }

    async fn list_for_number(
        &self,
        number_id: NumberId,
    ) -> Result<Vec<SmsMessage>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .sms
            .iter()
            .filter(|m| m.number_id == number_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.received_at);
        Ok(rows)
    }

    async fn count_for_number(
        &self,
        number_id: NumberId,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sms
            .iter()
            .filter(|m| m.number_id == number_id)
            .count() as u64)
    }
}

// --- CatalogStore --- //

#[async_trait]
impl CatalogStore for MemStore {
    async fn upsert_offers(
        &self,
        provider_id: ProviderId,
        batch: Vec<NewOffer>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let config = state.provider_configs.get(&provider_id).cloned();
        let (slug, display_name, priority) = match &config {
            Some(c) => (c.slug.clone(), c.display_name.clone(), c.priority),
            None => (format!("provider-{provider_id}"), String::new(), 100),
        };

        let now = TimestampMs::now();
        let mut written = 0u64;
        for new in batch {
            let key = (
                provider_id.0,
                new.country.as_str().to_owned(),
                new.service.as_str().to_owned(),
                new.operator_id.clone(),
            );
            let offer_id = match state.offer_index.get(&key) {
                Some(id) => *id,
                None => {
                    state.next_offer_id += 1;
                    let id = OfferId(state.next_offer_id);
                    state.offer_index.insert(key, id);
                    id
                }
            };
            let offer = Offer {
                id: offer_id,
                provider_id,
                provider_slug: slug.clone(),
                display_name: display_name.clone(),
                country: new.country,
                country_name: new.country_name,
                flag_url: new.flag_url,
                service: new.service,
                service_name: new.service_name,
                icon_url: new.icon_url,
                operator_id: new.operator_id,
                raw_cost: new.raw_cost,
                sell_price: new.sell_price,
                stock: new.stock,
                deleted: false,
                last_sync_at: now,
                provider_priority: priority,
            };
            state.offers.insert(offer_id, offer);
            written += 1;
        }
        Self::append_outbox(&mut state, events);
        Ok(written)
    }

    async fn get_offer(&self, id: OfferId) -> Result<Offer, StoreError> {
        self.state
            .lock()
            .unwrap()
            .offers
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_offers(
        &self,
        provider_id: Option<ProviderId>,
        country: Option<&CountryCode>,
        include_deleted: bool,
    ) -> Result<Vec<Offer>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .offers
            .values()
            .filter(|o| provider_id.is_none_or(|p| o.provider_id == p))
            .filter(|o| country.is_none_or(|c| o.country == *c))
            .filter(|o| include_deleted || !o.deleted)
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.id.0);
        Ok(rows)
    }

    async fn best_offer(
        &self,
        country: &CountryCode,
        service: &ServiceSlug,
        provider_slug: Option<&str>,
    ) -> Result<Option<Offer>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .offers
            .values()
            .filter(|o| {
                !o.deleted
                    && o.stock > 0
                    && o.country == *country
                    && o.service == *service
                    && provider_slug
                        .is_none_or(|slug| o.provider_slug == slug)
            })
            .min_by_key(|o| (o.sell_price, o.provider_priority, o.id.0))
            .cloned())
    }

    async fn reserve_stock(
        &self,
        offer_id: OfferId,
        quantity: u32,
        expires_at: TimestampMs,
        events: Vec<NewOutboxEvent>,
    ) -> Result<OfferReservation, StoreError> {
        let mut state = self.state.lock().unwrap();
        let offer = state
            .offers
            .get_mut(&offer_id)
            .ok_or(StoreError::NotFound)?;
        if offer.deleted || offer.stock < u64::from(quantity) {
            return Err(StoreError::InsufficientStock);
        }
        offer.stock -= u64::from(quantity);

        state.next_reservation_id += 1;
        let reservation = OfferReservation {
            id: ReservationId(state.next_reservation_id),
            offer_id,
            activation_id: None,
            state: ReservationState::Pending,
            quantity,
            expires_at,
            created_at: TimestampMs::now(),
        };
        state
            .reservations
            .insert(reservation.id, reservation.clone());
        Self::append_outbox(&mut state, events);
        Ok(reservation)
    }

    async fn confirm_reservation(
        &self,
        id: ReservationId,
        activation_id: ActivationId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let reservation = state
            .reservations
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        if reservation.state != ReservationState::Pending {
            return Err(StoreError::Conflict(format!(
                "Reservation {id} is {:?}",
                reservation.state,
            )));
        }
        reservation.state = ReservationState::Confirmed;
        reservation.activation_id = Some(activation_id);
        Ok(())
    }

    async fn cancel_reservation(
        &self,
        id: ReservationId,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let reservation = state
            .reservations
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        if reservation.state != ReservationState::Pending {
            return Err(StoreError::Conflict(format!(
                "Reservation {id} is {:?}",
                reservation.state,
            )));
        }
        reservation.state = ReservationState::Cancelled;
        let (offer_id, quantity) =
            (reservation.offer_id, reservation.quantity);
        if let Some(offer) = state.offers.get_mut(&offer_id) {
            offer.stock += u64::from(quantity);
        }
        Self::append_outbox(&mut state, events);
        Ok(())
    }

    async fn get_reservation(
        &self,
        id: ReservationId,
    ) -> Result<OfferReservation, StoreError> {
        self.state
            .lock()
            .unwrap()
            .reservations
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn release_reservation(
        &self,
        id: ReservationId,
        events: Vec<NewOutboxEvent>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let reservation = state
            .reservations
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        if reservation.state != ReservationState::Confirmed {
            return Ok(false);
        }
        reservation.state = ReservationState::Expired;
        let (offer_id, quantity) =
            (reservation.offer_id, reservation.quantity);
        if let Some(offer) = state.offers.get_mut(&offer_id) {
            offer.stock += u64::from(quantity);
        }
        Self::append_outbox(&mut state, events);
        Ok(true)
    }

    async fn expire_pending_reservations(
        &self,
        now: TimestampMs,
        events: Vec<NewOutboxEvent>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let expired_ids: Vec<ReservationId> = state
            .reservations
            .values()
            .filter(|r| {
                r.state == ReservationState::Pending && r.expires_at <= now
            })
            .map(|r| r.id)
            .collect();

        for id in &expired_ids {
            let reservation = state.reservations.get_mut(id).unwrap();
            reservation.state = ReservationState::Expired;
            let (offer_id, quantity) =
                (reservation.offer_id, reservation.quantity);
            if let Some(offer) = state.offers.get_mut(&offer_id) {
                offer.stock += u64::from(quantity);
            }
        }
        if !expired_ids.is_empty() {
            Self::append_outbox(&mut state, events);
        }
        Ok(expired_ids.len() as u64)
    }

    async fn prune_provider_offers(
        &self,
        provider_id: ProviderId,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut pruned = 0u64;
        let mut events = Vec::new();
        for offer in state.offers.values_mut() {
            if offer.provider_id == provider_id && !offer.deleted {
                offer.deleted = true;
                pruned += 1;
                events.push(NewOutboxEvent::new(
                    "offer",
                    offer.id,
                    "offer.deleted",
                    serde_json::json!({ "offer_id": offer.id.0 }),
                ));
            }
        }
        Self::append_outbox(&mut state, events);
        Ok(pruned)
    }

    async fn refresh_aggregates(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = TimestampMs::now();

        let live = state
            .offers
            .values()
            .filter(|o| !o.deleted && o.stock > 0)
            .cloned()
            .collect::<Vec<_>>();

        // Service rollups.
        let mut by_service: HashMap<String, Vec<&Offer>> = HashMap::new();
        for offer in &live {
            by_service
                .entry(offer.service.as_str().to_owned())
                .or_default()
                .push(offer);
        }
        let mut service_rows = Vec::with_capacity(by_service.len());
        for (slug, offers) in &by_service {
            let countries: HashSet<&str> = offers
                .iter()
                .map(|o| o.country.as_str())
                .collect();
            let providers: HashSet<i64> =
                offers.iter().map(|o| o.provider_id.0).collect();
            service_rows.push(ServiceAggregateRow {
                service_slug: ServiceSlug::new(slug)
                    .map_err(StoreError::internal)?,
                service_name: offers[0].service_name.clone(),
                icon_url: offers
                    .iter()
                    .find_map(|o| o.icon_url.clone()),
                lowest_price: offers
                    .iter()
                    .map(|o| o.sell_price)
                    .min()
                    .unwrap_or(Amount::ZERO),
                total_stock: offers.iter().map(|o| o.stock).sum(),
                country_count: countries.len() as u64,
                provider_count: providers.len() as u64,
                last_updated_at: now,
            });
        }
        service_rows.sort_by(|a, b| a.service_slug.cmp(&b.service_slug));
        state.service_aggregates = service_rows;

        // Country rollups per service.
        let mut country_rows: HashMap<String, Vec<CountryAggregateRow>> =
            HashMap::new();
        for (slug, offers) in &by_service {
            let mut by_country: HashMap<&str, Vec<&&Offer>> =
                HashMap::new();
            for offer in offers {
                by_country
                    .entry(offer.country.as_str())
                    .or_default()
                    .push(offer);
            }
            let mut rows = Vec::with_capacity(by_country.len());
            for (country, offers) in by_country {
                let providers: HashSet<i64> =
                    offers.iter().map(|o| o.provider_id.0).collect();
                rows.push(CountryAggregateRow {
                    country_code: CountryCode::new(country)
                        .map_err(StoreError::internal)?,
                    country_name: offers[0].country_name.clone(),
                    flag_url: offers
                        .iter()
                        .find_map(|o| o.flag_url.clone()),
                    lowest_price: offers
                        .iter()
                        .map(|o| o.sell_price)
                        .min()
                        .unwrap_or(Amount::ZERO),
                    total_stock: offers.iter().map(|o| o.stock).sum(),
                    provider_count: providers.len() as u64,
                });
            }
            rows.sort_by(|a, b| a.country_code.cmp(&b.country_code));
            country_rows.insert(slug.clone(), rows);
        }
        state.country_aggregates = country_rows;
        Ok(())
    }

    async fn service_aggregates(
        &self,
        sort: ServiceSort,
        page: PageRequest,
    ) -> Result<(Vec<ServiceAggregateRow>, u64), StoreError> {
        let state = self.state.lock().unwrap();
        let page = page.clamped();
        let mut rows = state.service_aggregates.clone();
        match sort {
            ServiceSort::Name =>
                rows.sort_by(|a, b| a.service_name.cmp(&b.service_name)),
            ServiceSort::Price =>
                rows.sort_by_key(|r| r.lowest_price),
            ServiceSort::Stock =>
                rows.sort_by_key(|r| std::cmp::Reverse(r.total_stock)),
        }
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect();
        Ok((items, total))
    }

    async fn country_aggregates(
        &self,
        service: &ServiceSlug,
    ) -> Result<Vec<CountryAggregateRow>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .country_aggregates
            .get(service.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

// --- ProviderStore --- //

#[async_trait]
impl ProviderStore for MemStore {
    async fn list_active(&self) -> Result<Vec<ProviderConfig>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut configs: Vec<_> = state
            .provider_configs
            .values()
            .filter(|c| c.active)
            .cloned()
            .collect();
        configs.sort_by_key(|c| c.priority);
        Ok(configs)
    }

    async fn get_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<ProviderConfig>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .provider_configs
            .values()
            .find(|c| c.slug == slug)
            .cloned())
    }

    async fn upsert_countries(
        &self,
        provider_id: ProviderId,
        rows: Vec<ProviderCountry>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let existing =
            state.provider_countries.entry(provider_id).or_default();
        for row in rows {
            match existing
                .iter_mut()
                .find(|r| r.external_id == row.external_id)
            {
                Some(slot) => *slot = row,
                None => existing.push(row),
            }
        }
        Ok(())
    }

    async fn upsert_services(
        &self,
        provider_id: ProviderId,
        rows: Vec<ProviderService>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let existing =
            state.provider_services.entry(provider_id).or_default();
        for row in rows {
            match existing
                .iter_mut()
                .find(|r| r.external_id == row.external_id)
            {
                Some(slot) => *slot = row,
                None => existing.push(row),
            }
        }
        Ok(())
    }

    async fn countries(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<ProviderCountry>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .provider_countries
            .get(&provider_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn services(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<ProviderService>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .provider_services
            .get(&provider_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_sync_status(
        &self,
        provider_id: ProviderId,
        status: SyncStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.provider_sync.insert(provider_id, (status, error));
        Ok(())
    }

    async fn set_balance(
        &self,
        provider_id: ProviderId,
        balance: Amount,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.provider_balances.insert(provider_id, (balance, at));
        Ok(())
    }

    async fn set_metadata_synced(
        &self,
        provider_id: ProviderId,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.provider_metadata_synced.insert(provider_id, at);
        Ok(())
    }

    async fn last_metadata_sync(
        &self,
        provider_id: ProviderId,
    ) -> Result<Option<TimestampMs>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.provider_metadata_synced.get(&provider_id).copied())
    }
}

// --- OutboxStore --- //

#[async_trait]
impl OutboxStore for MemStore {
    async fn append(
        &self,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::append_outbox(&mut state, events);
        Ok(())
    }

    async fn fetch_unprocessed(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .outbox
            .iter()
            .filter(|e| !e.processed && e.retry_count < max_retries)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processed(
        &self,
        ids: Vec<OutboxEventId>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = TimestampMs::now();
        for event in state.outbox.iter_mut() {
            if ids.contains(&event.id) {
                event.processed = true;
                event.processed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: OutboxEventId,
        error: String,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(event) =
            state.outbox.iter_mut().find(|e| e.id == id)
        {
            event.retry_count += 1;
            event.error = Some(error);
        }
        Ok(())
    }

    async fn purge_processed(
        &self,
        older_than: TimestampMs,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let before = state.outbox.len();
        state.outbox.retain(|e| {
            !(e.processed
                && e.processed_at.is_some_and(|at| at < older_than))
        });
        Ok((before - state.outbox.len()) as u64)
    }

    async fn stats(
        &self,
        max_retries: u32,
    ) -> Result<OutboxStats, StoreError> {
        let state = self.state.lock().unwrap();
        let now = TimestampMs::now();
        let pending: Vec<_> = state
            .outbox
            .iter()
            .filter(|e| !e.processed && e.retry_count < max_retries)
            .collect();
        Ok(OutboxStats {
            pending_count: pending.len() as u64,
            oldest_pending_age: pending
                .iter()
                .map(|e| now.saturating_duration_since(e.created_at))
                .max(),
            dlq_count: state
                .outbox
                .iter()
                .filter(|e| !e.processed && e.retry_count >= max_retries)
                .count() as u64,
        })
    }
}

// --- WebhookStore --- //

#[async_trait]
impl WebhookStore for MemStore {
    async fn record(
        &self,
        event: WebhookEvent,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.webhook_keys.insert(event.idempotency_key.clone()) {
            return Ok(false);
        }
        state.webhooks.push(event);
        Ok(true)
    }
}

// --- QueueStore --- //

#[async_trait]
impl QueueStore for MemStore {
    async fn publish(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: PublishOpts,
    ) -> Result<JobId, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.next_job_id += 1;
        let job = Job {
            id: JobId(state.next_job_id),
            queue: queue.to_owned(),
            payload,
            state: JobState::Pending,
            retry_count: 0,
            start_after: opts
                .start_after
                .unwrap_or_else(TimestampMs::now),
            correlation_id: opts.correlation_id,
            created_at: TimestampMs::now(),
        };
        let id = job.id;
        state.jobs.push(job);
        Ok(id)
    }

    async fn fetch(
        &self,
        queue: &str,
        batch: usize,
        now: TimestampMs,
    ) -> Result<Vec<Job>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut claimed = Vec::new();
        for job in state.jobs.iter_mut() {
            if claimed.len() >= batch {
                break;
            }
            if job.queue == queue
                && job.state == JobState::Pending
                && job.start_after <= now
            {
                job.state = JobState::Active;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: JobId) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            job.state = JobState::Completed;
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: JobId,
        _error: String,
        retry_at: Option<TimestampMs>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            match retry_at {
                Some(at) => {
                    job.state = JobState::Pending;
                    job.retry_count += 1;
                    job.start_after = at;
                }
                None => job.state = JobState::Failed,
            }
        }
        Ok(())
    }

    async fn status(&self, queue: &str) -> Result<QueueStatus, StoreError> {
        let state = self.state.lock().unwrap();
        let mut status = QueueStatus::default();
        for job in state.jobs.iter().filter(|j| j.queue == queue) {
            match job.state {
                JobState::Pending => status.pending += 1,
                JobState::Active => status.active += 1,
                JobState::Failed => status.failed += 1,
                JobState::Completed => (),
            }
        }
        Ok(status)
    }
}

// --- LockStore / KvCache / RateLimiter --- //

#[async_trait]
impl LockStore for MemStore {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if let Some((_token, expiry)) = state.locks.get(key) {
            if *expiry > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        state
            .locks
            .insert(key.to_owned(), (token.clone(), now + ttl));
        Ok(Some(LockGuard {
            key: key.to_owned(),
            token,
        }))
    }

    async fn release(&self, guard: LockGuard) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some((token, _)) = state.locks.get(&guard.key) {
            if *token == guard.token {
                state.locks.remove(&guard.key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvCache for MemStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.kv.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() =>
                Ok(Some(value.clone())),
            Some(_) => {
                state.kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.kv.insert(
            key.to_owned(),
            (value.to_owned(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.kv.remove(key);
        Ok(())
    }
}

#[async_trait]
impl RateLimiter for MemStore {
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let hits = state.rate.entry(key.to_owned()).or_default();
        while hits
            .front()
            .is_some_and(|first| now.duration_since(*first) > window)
        {
            hits.pop_front();
        }
        if hits.len() as u32 >= limit {
            let retry_after = hits
                .front()
                .map(|first| window.saturating_sub(now.duration_since(*first)));
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                retry_after,
            });
        }
        hits.push_back(now);
        Ok(RateDecision {
            allowed: true,
            remaining: limit - hits.len() as u32,
            retry_after: None,
        })
    }
}

// --- EventTransport --- //

#[async_trait]
impl EventTransport for MemStore {
    async fn publish_global(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.published.push(envelope.clone());
        drop(state);
        self.global_bus.notify(envelope.clone());
        Ok(())
    }

    async fn append_user_stream(
        &self,
        user_id: UserId,
        envelope: &EventEnvelope,
        maxlen: usize,
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.stream_seq += 1;
        let entry_id = format!("{}-{}", envelope.ts.as_i64(), state.stream_seq);
        let stream = state.streams.entry(user_id).or_default();
        stream.push_back((entry_id.clone(), envelope.clone()));
        while stream.len() > maxlen {
            stream.pop_front();
        }
        Ok(entry_id)
    }

    async fn read_user_stream(
        &self,
        user_id: UserId,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, EventEnvelope)>, StoreError> {
        let state = self.state.lock().unwrap();
        let Some(stream) = state.streams.get(&user_id) else {
            return Ok(Vec::new());
        };
        let entries: Vec<_> = match after_id {
            None => stream.iter().cloned().collect(),
            Some(after) => stream
                .iter()
                .skip_while(|(id, _)| id.as_str() != after)
                .skip(1)
                .cloned()
                .collect(),
        };
        Ok(entries.into_iter().take(limit).collect())
    }
}

// --- AuditSink --- //

#[async_trait]
impl AuditSink for MemStore {
    async fn write_batch(
        &self,
        records: Vec<AuditRecord>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.audit.extend(records);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = Arc::new(MemStore::new());
        let guard = store
            .try_acquire("poll:lock:1", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("First acquire succeeds");

        assert!(
            store
                .try_acquire("poll:lock:1", Duration::from_secs(60))
                .await
                .unwrap()
                .is_none(),
            "Second acquire must be refused",
        );

        store.release(guard).await.unwrap();
        assert!(store
            .try_acquire("poll:lock:1", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn stale_release_token_is_ignored() {
        let store = Arc::new(MemStore::new());
        let guard = store
            .try_acquire("k", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        // TTL elapses; someone else takes the lock.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store
            .try_acquire("k", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        // The stale guard must not free the new holder's lock.
        store.release(guard).await.unwrap();
        assert!(store
            .try_acquire("k", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        store.release(second).await.unwrap();
    }

    #[tokio::test]
    async fn reservation_stock_restored_exactly_once() {
        let store = Arc::new(MemStore::new());
        store
            .upsert_offers(
                ProviderId(1),
                vec![crate::models::NewOffer {
                    country: CountryCode::new("us").unwrap(),
                    country_name: "United States".to_owned(),
                    flag_url: None,
                    service: ServiceSlug::new("tg").unwrap(),
                    service_name: "Telegram".to_owned(),
                    icon_url: None,
                    operator_id: "default".to_owned(),
                    raw_cost: Amount::from_major(1),
                    sell_price: Amount::from_major(2),
                    stock: 3,
                }],
                vec![],
            )
            .await
            .unwrap();
        let offer = store
            .best_offer(
                &CountryCode::new("us").unwrap(),
                &ServiceSlug::new("tg").unwrap(),
                None,
            )
            .await
            .unwrap()
            .unwrap();

        let past = TimestampMs::try_from_i64(1).unwrap();
        let reservation = store
            .reserve_stock(offer.id, 1, past, vec![])
            .await
            .unwrap();
        assert_eq!(store.get_offer(offer.id).await.unwrap().stock, 2);

        // Expire restores the stock once.
        let expired = store
            .expire_pending_reservations(TimestampMs::now(), vec![])
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(store.get_offer(offer.id).await.unwrap().stock, 3);

        // A second sweep is a no-op.
        let expired = store
            .expire_pending_reservations(TimestampMs::now(), vec![])
            .await
            .unwrap();
        assert_eq!(expired, 0);
        assert_eq!(store.get_offer(offer.id).await.unwrap().stock, 3);

        // And a cancel of the now-EXPIRED reservation conflicts rather
        // than double-restoring.
        assert!(store
            .cancel_reservation(reservation.id, vec![])
            .await
            .is_err());
    }
}
