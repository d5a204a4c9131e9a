//! Seam traits between domain services and persistence.
//!
//! Repositories return plain domain records; the domain never sees SQL or
//! Redis. Production wiring uses the Postgres / Redis / search
//! implementations in [`crate::store`]; tests use the in-memory doubles.
//!
//! Methods that the spec requires to be transactional with an outbox
//! write (offer upserts, activation transitions) take the outbox rows as
//! an argument and co-commit them.

use std::time::Duration;

use async_trait::async_trait;
use common::id::{
    ActivationId, CountryCode, IdempotencyKey, NumberId, OfferId,
    OutboxEventId, ProviderId, ReservationId, ServiceSlug, UserId,
};
use common::money::{Amount, SignedAmount};
use common::time::TimestampMs;
use numio_api_core::models::{
    CountryAggregateRow, EventEnvelope, ServiceAggregateRow, ServiceSort,
};
use numio_api_core::types::{
    NumberStatus, PageRequest, TxKind, WalletTransaction,
};
use uuid::Uuid;

use crate::config_engine::ProviderConfig;
use crate::models::{
    Activation, ActivationPatch, AuditRecord, Job, NewOffer,
    NewOutboxEvent, Number, Offer, OfferReservation, OutboxEvent,
    ProviderCountry, ProviderService, SmsMessage, SyncStatus, Wallet,
    WebhookEvent,
};

/// Store-level failures, translated to API errors at the app layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Insufficient stock")]
    InsufficientStock,
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<StoreError> for numio_api_core::error::ApiError {
    fn from(e: StoreError) -> Self {
        use numio_api_core::error::ErrorKind;
        let kind = match &e {
            StoreError::NotFound => ErrorKind::NotFound,
            StoreError::InsufficientFunds => ErrorKind::InsufficientFunds,
            StoreError::InsufficientStock => ErrorKind::OutOfStock,
            StoreError::Conflict(_)
            | StoreError::Unavailable(_)
            | StoreError::Internal(_) => ErrorKind::SystemDb,
        };
        Self::new(kind, e.to_string())
    }
}

// --- Wallet --- //

/// One atomic ledger mutation: wallet row lock, optional availability
/// check, one appended row, reserved-delta update. All or nothing.
#[derive(Clone, Debug)]
pub struct LedgerMutation {
    pub user_id: UserId,
    pub amount: SignedAmount,
    pub kind: TxKind,
    pub description: String,
    pub idempotency_key: Option<IdempotencyKey>,
    /// Applied to the wallet's `reserved` column.
    pub reserved_delta: SignedAmount,
    /// When set, the mutation fails with [`StoreError::InsufficientFunds`]
    /// unless `balance - reserved >= this` (checked under the row lock).
    pub require_available: Option<Amount>,
}

/// The result of a ledger mutation.
#[derive(Clone, Debug)]
pub struct LedgerApplied {
    pub tx: WalletTransaction,
    pub balance: Amount,
    pub reserved: Amount,
    /// True when the idempotency key matched an existing row and nothing
    /// new was written.
    pub replayed: bool,
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Fetches (creating on first touch) a user's wallet.
    async fn wallet(&self, user_id: UserId) -> Result<Wallet, StoreError>;

    /// Applies one ledger mutation atomically. Re-invocation with a known
    /// idempotency key returns the stored row verbatim.
    async fn apply(
        &self,
        mutation: LedgerMutation,
    ) -> Result<LedgerApplied, StoreError>;

    async fn transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<(Vec<WalletTransaction>, u64), StoreError>;

    /// `Σ transactions.amount` straight from the ledger. The audit
    /// invariant is `wallet.balance == sum_ledger(user)`.
    async fn sum_ledger(
        &self,
        user_id: UserId,
    ) -> Result<SignedAmount, StoreError>;
}

// --- Activations --- //

#[derive(Clone, Debug)]
pub struct NewActivation {
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub provider_slug: String,
    pub price: Amount,
    pub idempotency_key: Option<IdempotencyKey>,
    pub reserved_tx: Option<common::id::LedgerTxId>,
    pub service: ServiceSlug,
    pub country: CountryCode,
    pub operator_id: String,
    pub expires_at: TimestampMs,
    pub reservation_id: Option<ReservationId>,
}

#[async_trait]
pub trait ActivationStore: Send + Sync {
    async fn create(
        &self,
        new: NewActivation,
    ) -> Result<Activation, StoreError>;

    async fn get(&self, id: ActivationId) -> Result<Activation, StoreError>;

    async fn find_by_idempotency_key(
        &self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> Result<Option<Activation>, StoreError>;

    async fn find_by_provider_ref(
        &self,
        provider_id: ProviderId,
        provider_activation_id: &str,
    ) -> Result<Option<Activation>, StoreError>;

    /// Atomically moves an activation from `from` to `to`, applying the
    /// patch and co-committing `events`. Fails with
    /// [`StoreError::Conflict`] when the stored state is not `from`
    /// (someone else won the race); the caller re-reads and re-decides.
    async fn transition(
        &self,
        id: ActivationId,
        from: numio_api_core::types::ActivationState,
        to: numio_api_core::types::ActivationState,
        patch: ActivationPatch,
        events: Vec<NewOutboxEvent>,
    ) -> Result<Activation, StoreError>;

    /// Activations sitting in a refundable state, for reconciliation.
    async fn list_refundable(
        &self,
        limit: usize,
    ) -> Result<Vec<Activation>, StoreError>;

    /// RESERVED activations created before `older_than`: acquisition
    /// retries that never resolved, awaiting compensation.
    async fn list_stale_reserved(
        &self,
        older_than: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Activation>, StoreError>;
}

// --- Numbers --- //

#[derive(Clone, Debug)]
pub struct NewNumber {
    pub user_id: UserId,
    pub activation_id: ActivationId,
    pub provider_id: ProviderId,
    pub phone_number: String,
    pub service: ServiceSlug,
    pub country: CountryCode,
    pub price: Amount,
    pub expires_at: TimestampMs,
    pub next_poll_at: TimestampMs,
}

/// Fields the poller updates after each attempt.
#[derive(Clone, Debug)]
pub struct PollBookkeeping {
    pub status: Option<NumberStatus>,
    pub error_count: u32,
    pub next_poll_at: TimestampMs,
    pub last_polled_at: TimestampMs,
    pub poll_count: u32,
}

#[async_trait]
pub trait NumberStore: Send + Sync {
    async fn create(&self, new: NewNumber) -> Result<Number, StoreError>;

    async fn get(&self, id: NumberId) -> Result<Number, StoreError>;

    async fn list_for_user(
        &self,
        user_id: UserId,
        status: Option<NumberStatus>,
        page: PageRequest,
    ) -> Result<(Vec<Number>, u64), StoreError>;

    /// The poller's selection query: live numbers with
    /// `error_count < max_errors`, `expires_at > now + slack`,
    /// `next_poll_at <= now`; received-first, then oldest-created.
    async fn due_for_poll(
        &self,
        now: TimestampMs,
        slack: Duration,
        max_errors: u32,
        limit: usize,
    ) -> Result<Vec<Number>, StoreError>;

    /// Live numbers whose `expires_at` has passed, for the cleanup tick.
    async fn list_expired(
        &self,
        now: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Number>, StoreError>;

    /// Writes poll bookkeeping. A `status` change is rejected with
    /// [`StoreError::Conflict`] if the stored status is terminal
    /// (terminal statuses never regress).
    async fn record_poll(
        &self,
        id: NumberId,
        bookkeeping: PollBookkeeping,
    ) -> Result<Number, StoreError>;
}

// --- SMS --- //

#[derive(Clone, Debug)]
pub struct NewSmsMessage {
    /// Composite id `{number_id}_{upstream_id}`.
    pub id: String,
    pub number_id: NumberId,
    pub sender: String,
    pub content: String,
    pub code: Option<String>,
    pub confidence: Option<f32>,
    pub received_at: TimestampMs,
    pub content_hash: String,
    pub fingerprint: String,
}

#[async_trait]
pub trait SmsStore: Send + Sync {
    /// Batch insert, skipping duplicates: composite-id collisions and
    /// same (number, content_hash) within `dedup_window`. Returns the
    /// messages actually inserted.
    async fn insert_batch(
        &self,
        messages: Vec<NewSmsMessage>,
        dedup_window: Duration,
    ) -> Result<Vec<SmsMessage>, StoreError>;

    async fn list_for_number(
        &self,
        number_id: NumberId,
    ) -> Result<Vec<SmsMessage>, StoreError>;

    async fn count_for_number(
        &self,
        number_id: NumberId,
    ) -> Result<u64, StoreError>;
}

// --- Catalogue --- //

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Upserts one chunk of offers for a provider, co-committing one
    /// `offer.upserted` outbox event for the batch. Returns rows written.
    async fn upsert_offers(
        &self,
        provider_id: ProviderId,
        batch: Vec<NewOffer>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<u64, StoreError>;

    async fn get_offer(&self, id: OfferId) -> Result<Offer, StoreError>;

    /// Offer listing for the outbox dispatcher's index refreshes.
    async fn list_offers(
        &self,
        provider_id: Option<ProviderId>,
        country: Option<&CountryCode>,
        include_deleted: bool,
    ) -> Result<Vec<Offer>, StoreError>;

    /// The purchase router's pick: cheapest in-stock offer for
    /// (country, service), optionally pinned to one provider; ties broken
    /// by provider priority (lower wins).
    async fn best_offer(
        &self,
        country: &CountryCode,
        service: &ServiceSlug,
        provider_slug: Option<&str>,
    ) -> Result<Option<Offer>, StoreError>;

    /// Creates a PENDING reservation, decrementing stock atomically.
    /// Fails with [`StoreError::InsufficientStock`] when stock is short.
    async fn reserve_stock(
        &self,
        offer_id: OfferId,
        quantity: u32,
        expires_at: TimestampMs,
        events: Vec<NewOutboxEvent>,
    ) -> Result<OfferReservation, StoreError>;

    /// PENDING -> CONFIRMED; stock stays decremented.
    async fn confirm_reservation(
        &self,
        id: ReservationId,
        activation_id: ActivationId,
    ) -> Result<(), StoreError>;

    /// PENDING -> CANCELLED; restores stock exactly once.
    async fn cancel_reservation(
        &self,
        id: ReservationId,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError>;

    async fn get_reservation(
        &self,
        id: ReservationId,
    ) -> Result<OfferReservation, StoreError>;

    /// CONFIRMED -> EXPIRED, restoring stock exactly once. Used when a
    /// sold-but-unused activation is voided (expiry, cancellation) and
    /// its number goes back on the shelf. Returns whether stock moved.
    async fn release_reservation(
        &self,
        id: ReservationId,
        events: Vec<NewOutboxEvent>,
    ) -> Result<bool, StoreError>;

    /// Expires overdue PENDING reservations, restoring stock exactly
    /// once per reservation. Returns how many were expired.
    async fn expire_pending_reservations(
        &self,
        now: TimestampMs,
        events: Vec<NewOutboxEvent>,
    ) -> Result<u64, StoreError>;

    /// Logically deletes all of a provider's offers (provider disabled or
    /// resync), emitting `offer.deleted` events.
    async fn prune_provider_offers(
        &self,
        provider_id: ProviderId,
    ) -> Result<u64, StoreError>;

    /// Recomputes ServiceAggregate / CountryAggregate rollups from
    /// non-deleted, positive-stock pricing.
    async fn refresh_aggregates(&self) -> Result<(), StoreError>;

    async fn service_aggregates(
        &self,
        sort: ServiceSort,
        page: PageRequest,
    ) -> Result<(Vec<ServiceAggregateRow>, u64), StoreError>;

    async fn country_aggregates(
        &self,
        service: &ServiceSlug,
    ) -> Result<Vec<CountryAggregateRow>, StoreError>;
}

// --- Providers --- //

#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn list_active(&self) -> Result<Vec<ProviderConfig>, StoreError>;

    async fn get_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<ProviderConfig>, StoreError>;

    async fn upsert_countries(
        &self,
        provider_id: ProviderId,
        rows: Vec<ProviderCountry>,
    ) -> Result<(), StoreError>;

    async fn upsert_services(
        &self,
        provider_id: ProviderId,
        rows: Vec<ProviderService>,
    ) -> Result<(), StoreError>;

    async fn countries(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<ProviderCountry>, StoreError>;

    async fn services(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<ProviderService>, StoreError>;

    async fn set_sync_status(
        &self,
        provider_id: ProviderId,
        status: SyncStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn set_balance(
        &self,
        provider_id: ProviderId,
        balance: Amount,
        at: TimestampMs,
    ) -> Result<(), StoreError>;

    async fn set_metadata_synced(
        &self,
        provider_id: ProviderId,
        at: TimestampMs,
    ) -> Result<(), StoreError>;

    async fn last_metadata_sync(
        &self,
        provider_id: ProviderId,
    ) -> Result<Option<TimestampMs>, StoreError>;
}

// --- Outbox --- //

#[derive(Clone, Debug, Default)]
pub struct OutboxStats {
    pub pending_count: u64,
    /// Age of the oldest unprocessed event.
    pub oldest_pending_age: Option<Duration>,
    pub dlq_count: u64,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Appends events outside any domain transaction. Domain writes that
    /// must co-commit go through their own store methods instead.
    async fn append(
        &self,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError>;

    /// `processed = false AND retry_count < max_retries ORDER BY id ASC`.
    async fn fetch_unprocessed(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn mark_processed(
        &self,
        ids: Vec<OutboxEventId>,
    ) -> Result<(), StoreError>;

    async fn mark_failed(
        &self,
        id: OutboxEventId,
        error: String,
    ) -> Result<(), StoreError>;

    async fn purge_processed(
        &self,
        older_than: TimestampMs,
    ) -> Result<u64, StoreError>;

    async fn stats(&self, max_retries: u32)
    -> Result<OutboxStats, StoreError>;
}

// --- Webhook inbox --- //

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Records a raw webhook; returns `false` when the idempotency key
    /// was already seen (redelivery).
    async fn record(
        &self,
        event: WebhookEvent,
    ) -> Result<bool, StoreError>;
}

// --- Queue --- //

#[derive(Clone, Debug, Default)]
pub struct PublishOpts {
    pub start_after: Option<TimestampMs>,
    pub correlation_id: Option<Uuid>,
}

#[derive(Clone, Debug, Default)]
pub struct QueueStatus {
    pub pending: u64,
    pub active: u64,
    pub failed: u64,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn publish(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: PublishOpts,
    ) -> Result<common::id::JobId, StoreError>;

    /// Claims up to `batch` due jobs (pending, `start_after <= now`),
    /// marking them active. Claimed jobs are invisible to other workers.
    async fn fetch(
        &self,
        queue: &str,
        batch: usize,
        now: TimestampMs,
    ) -> Result<Vec<Job>, StoreError>;

    async fn complete(
        &self,
        id: common::id::JobId,
    ) -> Result<(), StoreError>;

    /// Failure with an optional retry. `retry_at: None` fails the job
    /// permanently.
    async fn fail(
        &self,
        id: common::id::JobId,
        error: String,
        retry_at: Option<TimestampMs>,
    ) -> Result<(), StoreError>;

    async fn status(&self, queue: &str) -> Result<QueueStatus, StoreError>;
}

// --- Locks, cache, rate limits --- //

/// A held distributed lock. Release explicitly; the TTL covers crashes.
#[derive(Clone, Debug)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Non-blocking acquire. `None` means someone else holds the lock;
    /// callers treat that as a skip, not an error.
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, StoreError>;

    /// Releases only if `guard.token` still owns the lock.
    async fn release(&self, guard: LockGuard) -> Result<(), StoreError>;
}

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Clone, Debug)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Option<Duration>,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Sliding-window check: has `key` made fewer than `limit` calls in
    /// the trailing `window`? Allowed calls are counted immediately.
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, StoreError>;
}

// --- Event transport --- //

#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Publish to the global pub/sub channel (`events:global`).
    async fn publish_global(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<(), StoreError>;

    /// Append to the user's bounded replay stream
    /// (`events:stream:user:{id}`), returning the stream entry id.
    async fn append_user_stream(
        &self,
        user_id: UserId,
        envelope: &EventEnvelope,
        maxlen: usize,
    ) -> Result<String, StoreError>;

    /// Read the user's stream after `after_id` (exclusive); `None` reads
    /// from the start. Used for replay on reconnect.
    async fn read_user_stream(
        &self,
        user_id: UserId,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, EventEnvelope)>, StoreError>;
}

// --- Audit --- //

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_batch(
        &self,
        records: Vec<AuditRecord>,
    ) -> Result<(), StoreError>;
}
