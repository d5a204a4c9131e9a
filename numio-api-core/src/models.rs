//! Request / response DTOs for the public HTTP API.
//!
//! Handlers deserialize these from query strings / JSON bodies and
//! serialize them back out; the domain never sees raw `serde_json`.

use common::id::{
    ActivationId, CountryCode, IdempotencyKey, NumberId, ServiceSlug, UserId,
};
use common::money::Amount;
use common::time::TimestampMs;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    ActivationState, DEFAULT_PAGE_LIMIT, NumberStatus, PageRequest,
    WalletTransaction,
};

// --- Wallet --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub wallet_id: UserId,
    pub balance: Amount,
    pub reserved: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopupRequest {
    pub amount: Amount,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopupResponse {
    pub new_balance: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionsPage {
    pub transactions: Vec<WalletTransaction>,
    pub total: u64,
}

// --- Search --- //

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SearchServicesParams {
    pub q: Option<String>,
    // Flattening `PageRequest` here breaks urlencoded number parsing,
    // so the page fields stay inline.
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub sort: Option<ServiceSort>,
}

impl SearchServicesParams {
    pub fn page_request(&self) -> PageRequest {
        PageRequest {
            page: self.page.unwrap_or(1),
            limit: self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSort {
    Name,
    Price,
    Stock,
}

/// A service rollup row: "telegram is available in 42 countries from $0.12".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceAggregateRow {
    pub service_slug: ServiceSlug,
    pub service_name: String,
    pub icon_url: Option<String>,
    pub lowest_price: Amount,
    pub total_stock: u64,
    pub country_count: u64,
    pub provider_count: u64,
    pub last_updated_at: TimestampMs,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchCountriesParams {
    pub service: ServiceSlug,
    pub q: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CountryAggregateRow {
    pub country_code: CountryCode,
    pub country_name: String,
    pub flag_url: Option<String>,
    pub lowest_price: Amount,
    pub total_stock: u64,
    pub provider_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CountriesResponse {
    pub countries: Vec<CountryAggregateRow>,
    pub total: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchProvidersParams {
    pub service: ServiceSlug,
    pub country: CountryCode,
}

/// One purchasable offer as shown on the provider-picker screen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfferRow {
    pub provider: String,
    pub display_name: String,
    pub operator_id: String,
    pub price: Amount,
    pub stock: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvidersResponse {
    pub providers: Vec<OfferRow>,
    pub total: u64,
}

// --- Numbers --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub country_code: CountryCode,
    pub service_code: ServiceSlug,
    /// Pin a specific provider; otherwise the cheapest in-stock offer wins.
    pub provider_slug: Option<String>,
    pub idempotency_key: IdempotencyKey,
}

/// The user-facing view of a purchased number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NumberView {
    pub id: NumberId,
    pub activation_id: ActivationId,
    pub phone_number: String,
    pub status: NumberStatus,
    pub activation_state: ActivationState,
    pub service_code: ServiceSlug,
    pub country_code: CountryCode,
    pub price: Amount,
    pub expires_at: TimestampMs,
    pub created_at: TimestampMs,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PurchaseResponse {
    pub number: NumberView,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MyNumbersParams {
    pub status: Option<NumberStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl MyNumbersParams {
    pub fn page_request(&self) -> PageRequest {
        PageRequest {
            page: self.page.unwrap_or(1),
            limit: self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NumbersPage {
    pub numbers: Vec<NumberView>,
    pub total: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub refund_amount: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub number: NumberView,
}

// --- SMS --- //

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmsMessageView {
    pub sender: String,
    pub content: String,
    pub code: Option<String>,
    /// Extraction confidence in `[0, 1]`, hundredths.
    pub confidence: Option<f32>,
    pub received_at: TimestampMs,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SmsListResponse {
    pub status: NumberStatus,
    pub messages: Vec<SmsMessageView>,
}

// --- Event fan-out --- //

/// The versioned envelope published for every observable state change.
///
/// `payload` is validated against the event type's registered schema before
/// publish; unknown types are rejected at the publisher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Envelope version. Always `1`.
    pub v: u8,
    pub event_id: Uuid,
    /// Epoch millis at publish time.
    pub ts: TimestampMs,
    /// Dotted event name, e.g. `sms.received`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Fan-out scope, e.g. `user:42` or `order:7`.
    pub room: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default)]
    pub meta: EventMeta,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let envelope = EventEnvelope {
            v: 1,
            event_id: Uuid::nil(),
            ts: TimestampMs::try_from_i64(1_700_000_000_000).unwrap(),
            event_type: "sms.received".to_owned(),
            room: "user:42".to_owned(),
            payload: serde_json::json!({"code": "842193"}),
            seq: None,
            meta: EventMeta::default(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "sms.received");
        assert_eq!(json["room"], "user:42");
        assert!(json.get("seq").is_none());
    }

    #[test]
    fn purchase_request_parses() {
        let req: PurchaseRequest = serde_json::from_str(
            r#"{
                "country_code": "US",
                "service_code": "tg",
                "idempotency_key": "k1"
            }"#,
        )
        .unwrap();
        // Codes normalize to lowercase on the way in.
        assert_eq!(req.country_code.as_str(), "us");
        assert_eq!(req.service_code.as_str(), "tg");
        assert!(req.provider_slug.is_none());
    }
}
