//! Domain entities.
//!
//! Plain records returned by repositories. Activation and Number reference
//! each other by id only; resolving either side always goes back through a
//! store, so no two mutable handles to the same entity can coexist.

use common::id::{
    ActivationId, CountryCode, IdempotencyKey, JobId, LedgerTxId, NumberId,
    OfferId, OutboxEventId, ProviderId, ReservationId, ServiceSlug, UserId,
};
use common::money::Amount;
use common::time::TimestampMs;
use numio_api_core::models::NumberView;
use numio_api_core::types::{ActivationState, NumberStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Wallet --- //

/// A user's wallet. `balance` is denormalized from the ledger; the ledger
/// remains the source of truth and the two are reconciled in tests via
/// `WalletStore::sum_ledger`.
#[derive(Clone, Debug, PartialEq)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance: Amount,
    pub reserved: Amount,
    pub updated_at: TimestampMs,
}

impl Wallet {
    /// Funds available for new debits or reservations.
    pub fn available(&self) -> Amount {
        self.balance.checked_sub(self.reserved).unwrap_or(Amount::ZERO)
    }
}

// --- Activation --- //

/// One record per purchase attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct Activation {
    pub id: ActivationId,
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub provider_slug: String,
    /// Price at time of reservation. Later offer repricing never changes
    /// what this activation settles at.
    pub price: Amount,
    pub idempotency_key: Option<IdempotencyKey>,
    pub reserved_tx: Option<LedgerTxId>,
    pub captured_tx: Option<LedgerTxId>,
    pub refund_tx: Option<LedgerTxId>,
    pub state: ActivationState,
    pub service: ServiceSlug,
    pub country: CountryCode,
    pub operator_id: String,
    /// The upstream provider's activation id, once acquired.
    pub provider_activation_id: Option<String>,
    pub phone_number: Option<String>,
    pub expires_at: TimestampMs,
    pub number_id: Option<NumberId>,
    pub reservation_id: Option<ReservationId>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

/// The mutable fields an activation state transition may set.
#[derive(Clone, Debug, Default)]
pub struct ActivationPatch {
    pub captured_tx: Option<LedgerTxId>,
    pub refund_tx: Option<LedgerTxId>,
    pub provider_activation_id: Option<String>,
    pub phone_number: Option<String>,
    pub number_id: Option<NumberId>,
    pub expires_at: Option<TimestampMs>,
}

// --- Number --- //

/// The materialized counterpart of an active activation, denormalized for
/// fast listing and poll selection.
#[derive(Clone, Debug, PartialEq)]
pub struct Number {
    pub id: NumberId,
    pub user_id: UserId,
    pub activation_id: ActivationId,
    pub provider_id: ProviderId,
    /// E.164.
    pub phone_number: String,
    pub status: NumberStatus,
    pub service: ServiceSlug,
    pub country: CountryCode,
    pub price: Amount,
    pub expires_at: TimestampMs,
    pub error_count: u32,
    pub next_poll_at: TimestampMs,
    pub last_polled_at: Option<TimestampMs>,
    pub poll_count: u32,
    pub created_at: TimestampMs,
}

impl Number {
    pub fn to_view(&self, state: ActivationState) -> NumberView {
        NumberView {
            id: self.id,
            activation_id: self.activation_id,
            phone_number: self.phone_number.clone(),
            status: self.status,
            activation_state: state,
            service_code: self.service.clone(),
            country_code: self.country.clone(),
            price: self.price,
            expires_at: self.expires_at,
            created_at: self.created_at,
        }
    }
}

// --- SMS --- //

/// One received SMS, append-only per number.
#[derive(Clone, Debug, PartialEq)]
pub struct SmsMessage {
    /// Composite id: `{number_id}_{upstream_message_id}`.
    pub id: String,
    pub number_id: NumberId,
    pub sender: String,
    pub content: String,
    pub code: Option<String>,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: Option<f32>,
    pub received_at: TimestampMs,
    /// Hex SHA-256 of the sanitized content, for windowed dedup.
    pub content_hash: String,
    /// `{sender}:{content_hash}`, kept for operator forensics.
    pub fingerprint: String,
}

// --- Catalogue --- //

/// The (provider, country, service, operator) pricing tuple: the unit of
/// the catalogue.
#[derive(Clone, Debug, PartialEq)]
pub struct Offer {
    pub id: OfferId,
    pub provider_id: ProviderId,
    pub provider_slug: String,
    pub display_name: String,
    pub country: CountryCode,
    pub country_name: String,
    pub flag_url: Option<String>,
    pub service: ServiceSlug,
    pub service_name: String,
    pub icon_url: Option<String>,
    pub operator_id: String,
    pub raw_cost: Amount,
    /// Denormalized: `f(raw_cost, provider margin, currency norm)`.
    pub sell_price: Amount,
    pub stock: u64,
    pub deleted: bool,
    pub last_sync_at: TimestampMs,
    /// Provider priority, denormalized for purchase routing (lower wins).
    pub provider_priority: u32,
}

/// A row to upsert during price sync; identity is
/// (provider, country, service, operator).
#[derive(Clone, Debug)]
pub struct NewOffer {
    pub country: CountryCode,
    pub country_name: String,
    pub flag_url: Option<String>,
    pub service: ServiceSlug,
    pub service_name: String,
    pub icon_url: Option<String>,
    pub operator_id: String,
    pub raw_cost: Amount,
    pub sell_price: Amount,
    pub stock: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Pending,
    Confirmed,
    Expired,
    Cancelled,
}

/// A soft hold against an offer's stock while a purchase is in flight.
/// Stock is decremented at creation and restored exactly once on
/// EXPIRED / CANCELLED.
#[derive(Clone, Debug, PartialEq)]
pub struct OfferReservation {
    pub id: ReservationId,
    pub offer_id: OfferId,
    pub activation_id: Option<ActivationId>,
    pub state: ReservationState,
    pub quantity: u32,
    pub expires_at: TimestampMs,
    pub created_at: TimestampMs,
}

// --- Provider metadata rows --- //

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderCountry {
    pub provider_id: ProviderId,
    pub external_id: String,
    pub code: CountryCode,
    pub name: String,
    pub flag_url: Option<String>,
    pub last_sync_at: TimestampMs,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderService {
    pub provider_id: ProviderId,
    pub external_id: String,
    pub slug: ServiceSlug,
    pub name: String,
    pub icon_url: Option<String>,
    pub last_sync_at: TimestampMs,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Failed,
}

// --- Outbox --- //

#[derive(Clone, Debug, PartialEq)]
pub struct OutboxEvent {
    /// Strictly increasing; consumers process in ascending order.
    pub id: OutboxEventId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub retry_count: u32,
    pub processed_at: Option<TimestampMs>,
    pub error: Option<String>,
    pub created_at: TimestampMs,
}

/// An outbox row to append inside the same transaction as a domain write.
#[derive(Clone, Debug)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: &str,
        aggregate_id: impl ToString,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.to_owned(),
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.to_owned(),
            payload,
        }
    }
}

// --- Webhooks --- //

/// A raw upstream webhook, stored before processing and keyed by its
/// idempotency key so redeliveries are no-ops.
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookEvent {
    pub idempotency_key: String,
    pub provider_slug: String,
    pub payload: serde_json::Value,
    pub received_at: TimestampMs,
}

// --- Queue --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub retry_count: u32,
    pub start_after: TimestampMs,
    pub correlation_id: Option<Uuid>,
    pub created_at: TimestampMs,
}

// --- Audit --- //

/// A structured audit record. Buffered and batch-flushed; see
/// [`crate::audit`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: TimestampMs,
    /// e.g. `poll`, `sync`, `wallet`, `job`.
    pub category: String,
    /// e.g. `number:17`, `provider:acme`.
    pub subject: String,
    pub detail: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        category: &str,
        subject: impl ToString,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            ts: TimestampMs::now(),
            category: category.to_owned(),
            subject: subject.to_string(),
            detail,
        }
    }
}
