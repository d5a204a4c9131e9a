//! The declarative provider adapter engine.
//!
//! A [`ProviderConfig`] describes an upstream SMS-activation API as data:
//! per-operation endpoint templates plus response-mapping specs. One
//! [`DeclarativeAdapter`] implementation services every such provider; a
//! handful of legacy providers whose metadata doesn't fit the declarative
//! engine get a [`legacy`] adapter implementing the same capability set.
//!
//! [`DeclarativeAdapter`]: adapter::DeclarativeAdapter

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::id::{CountryCode, ProviderId, ServiceSlug};
use common::money::Amount;
use common::time::TimestampMs;
use numio_api_core::error::{ApiError, ErrorKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config_engine::mapping::ResponseMapping;

/// The live HTTP adapter for declaratively-configured providers.
pub mod adapter;
/// Per-provider-tier circuit breakers.
pub mod breaker;
/// Short-lived caches with stale-while-revalidate semantics.
pub mod cache;
/// Adapters for providers that predate the declarative engine.
pub mod legacy;
/// Response-mapping AST and evaluator.
pub mod mapping;
/// Endpoint template resolution and credential injection.
pub mod template;

// --- Provider configuration --- //

/// How credentials are injected into upstream requests.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    /// No authentication.
    None,
    /// `?{name}=<key>`
    QueryParam { name: String },
    /// `{name}: <key>`
    Header { name: String },
    /// `Authorization: Bearer <key>`
    Bearer,
}

/// How upstream costs are converted into display currency before margin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NormalizationMode {
    /// Provider currency is the display currency; no conversion.
    Direct,
    /// Effective rate inferred from real deposits:
    /// `deposit_received / deposit_spent`, then the system points rate.
    SmartAuto {
        deposit_received: Decimal,
        deposit_spent: Decimal,
    },
    /// Operator-supplied fixed rate.
    Manual { rate: Decimal },
}

/// The operations a provider adapter can be asked to perform.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    GetCountries,
    GetServices,
    GetPrices,
    GetNumber,
    GetStatus,
    SetStatus,
    CancelNumber,
    GetBalance,
}

/// One operation's HTTP shape. Values may contain `{slot}` templates; see
/// [`template`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    #[serde(default = "EndpointSpec::default_method")]
    pub method: String,
    /// Path relative to the provider base URL, e.g.
    /// `/stubs/handler_api.php`.
    pub path: String,
    /// Query parameters; values are templated.
    #[serde(default)]
    pub query: Vec<(String, String)>,
    /// Extra headers; values are templated.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl EndpointSpec {
    fn default_method() -> String {
        "GET".to_owned()
    }
}

/// A provider's full declarative configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    /// Stable slug, e.g. `acme-sms`.
    pub slug: String,
    pub display_name: String,
    pub base_url: String,
    pub auth: AuthMode,
    /// Credentials; rotated on upstream rate limits.
    pub api_keys: Vec<String>,
    pub endpoints: HashMap<Operation, EndpointSpec>,
    pub mappings: HashMap<Operation, ResponseMapping>,
    /// ISO currency code of upstream prices.
    pub currency: String,
    /// Multiplier applied to normalized raw cost; always >= 1.0.
    pub price_multiplier: Decimal,
    /// Fixed markup added after the multiplier.
    pub fixed_markup: Amount,
    pub normalization: NormalizationMode,
    /// Metadata must go through the legacy adapter path.
    #[serde(default)]
    pub legacy_metadata: bool,
    pub active: bool,
    /// Lower is higher priority when routing purchases.
    pub priority: u32,
    /// HMAC secret for inbound webhooks, if the provider pushes SMS.
    pub webhook_secret: Option<String>,
    /// Optional source-IP allowlist for inbound webhooks.
    #[serde(default)]
    pub webhook_allowed_ips: Vec<IpAddr>,
    /// Consecutive failures before the circuit breaker opens.
    #[serde(default = "ProviderConfig::default_breaker_threshold")]
    pub breaker_threshold: u32,
}

impl ProviderConfig {
    fn default_breaker_threshold() -> u32 {
        5
    }
}

// --- Normalized outputs --- //

#[derive(Clone, Debug, PartialEq)]
pub struct Country {
    pub external_id: String,
    pub code: CountryCode,
    pub name: String,
    pub flag_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceInfo {
    pub external_id: String,
    pub slug: ServiceSlug,
    pub name: String,
    pub icon_url: Option<String>,
}

/// One normalized price row: (country, service, operator?, cost, count).
#[derive(Clone, Debug, PartialEq)]
pub struct PriceRow {
    pub country: CountryCode,
    pub service: ServiceSlug,
    pub operator: Option<String>,
    /// Raw upstream cost, pre-normalization.
    pub cost: Amount,
    pub count: u64,
}

/// A successfully acquired number.
#[derive(Clone, Debug, PartialEq)]
pub struct Acquired {
    pub activation_id: String,
    pub phone_number: String,
    /// Upstream price at acquisition, when reported.
    pub price: Option<Amount>,
}

/// Canonical upstream activation statuses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatus {
    Pending,
    Received,
    Completed,
    Cancelled,
    /// Anything a status mapping doesn't recognize.
    Unknown,
}

impl UpstreamStatus {
    pub fn from_canonical(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "received" => Self::Received,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamSms {
    /// The upstream message id, unique per activation.
    pub id: String,
    pub sender: String,
    pub text: String,
    pub received_at: Option<TimestampMs>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusPoll {
    pub status: UpstreamStatus,
    pub messages: Vec<UpstreamSms>,
}

/// A parsed inbound webhook.
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookPayload {
    pub provider_activation_id: String,
    pub status: Option<UpstreamStatus>,
    pub messages: Vec<UpstreamSms>,
    /// Sender-asserted timestamp, unix seconds.
    pub ts: Option<i64>,
}

/// The result of webhook signature verification.
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookVerdict {
    pub valid: bool,
    pub error: Option<String>,
    /// Drift between the asserted timestamp and our clock.
    pub time_drift: Option<Duration>,
}

// --- Errors --- //

/// Typed upstream failures. HTTP 4xx with known textual error codes map to
/// specific variants; 5xx and transport errors are `Unavailable`.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("No numbers in stock")]
    OutOfStock,
    #[error("Unknown or unsupported service")]
    BadService,
    #[error("Provider rejected our API key")]
    BadKey,
    #[error("Provider rate limited us")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Provider call timed out")]
    Timeout,
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    #[error("Provider response unusable: {0}")]
    BadResponse(String),
    #[error("Circuit breaker is open")]
    BreakerOpen,
    #[error("Operation not configured for this provider")]
    NotConfigured,
}

impl ProviderError {
    /// Maps an upstream textual error code to a typed error, if known.
    pub fn from_upstream_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "NO_NUMBERS" | "NO_NUMBER" => Some(Self::OutOfStock),
            "BAD_SERVICE" | "WRONG_SERVICE" => Some(Self::BadService),
            "BAD_KEY" | "BAD_TOKEN" | "INVALID_KEY" => Some(Self::BadKey),
            "NO_BALANCE" =>
                Some(Self::Unavailable("Provider balance empty".to_owned())),
            _ => None,
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        let kind = match &err {
            ProviderError::OutOfStock => ErrorKind::OutOfStock,
            ProviderError::BadService => ErrorKind::BadService,
            ProviderError::BadKey => ErrorKind::BadKey,
            ProviderError::RateLimited { .. } =>
                ErrorKind::ProviderRatelimited,
            ProviderError::Timeout => ErrorKind::ProviderTimeout,
            ProviderError::Unavailable(_) | ProviderError::BreakerOpen =>
                ErrorKind::ProviderUnavailable,
            ProviderError::BadResponse(_) => ErrorKind::ProviderBadResponse,
            ProviderError::NotConfigured => ErrorKind::BadService,
        };
        ApiError::new(kind, err.to_string())
    }
}

// --- The provider capability set --- //

/// Everything the rest of the system can ask of a provider, whether it's
/// driven by the declarative engine or a legacy adapter.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    async fn countries(&self) -> Result<Vec<Country>, ProviderError>;

    async fn services(
        &self,
        country: Option<&CountryCode>,
    ) -> Result<Vec<ServiceInfo>, ProviderError>;

    async fn prices(
        &self,
        country: Option<&CountryCode>,
        service: Option<&ServiceSlug>,
    ) -> Result<Vec<PriceRow>, ProviderError>;

    async fn acquire_number(
        &self,
        country: &CountryCode,
        service: &ServiceSlug,
        operator: Option<&str>,
    ) -> Result<Acquired, ProviderError>;

    async fn status(
        &self,
        provider_activation_id: &str,
    ) -> Result<StatusPoll, ProviderError>;

    async fn set_status(
        &self,
        provider_activation_id: &str,
        next: UpstreamStatus,
    ) -> Result<(), ProviderError>;

    async fn cancel_number(
        &self,
        provider_activation_id: &str,
    ) -> Result<(), ProviderError>;

    async fn balance(&self) -> Result<Amount, ProviderError>;

    fn parse_webhook(
        &self,
        raw: &[u8],
    ) -> Result<WebhookPayload, ProviderError>;

    fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &http::HeaderMap,
        source_ip: IpAddr,
    ) -> WebhookVerdict;
}

/// Process-wide registry of provider adapters, built once by the
/// orchestrator from the active [`ProviderConfig`]s.
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderApi>>,
}

impl ProviderRegistry {
    pub fn build(
        configs: Vec<ProviderConfig>,
        http: reqwest::Client,
    ) -> Self {
        let mut adapters: HashMap<String, Arc<dyn ProviderApi>> =
            HashMap::new();
        for config in configs {
            let slug = config.slug.clone();
            let adapter: Arc<dyn ProviderApi> = if config.legacy_metadata {
                Arc::new(legacy::LegacyTextAdapter::new(
                    config,
                    http.clone(),
                ))
            } else {
                Arc::new(adapter::DeclarativeAdapter::new(
                    config,
                    http.clone(),
                ))
            };
            adapters.insert(slug, adapter);
        }
        Self { adapters }
    }

    /// An empty registry; adapters are added with [`Self::insert`].
    /// Used by tests to inject stub providers.
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn insert(&mut self, slug: &str, adapter: Arc<dyn ProviderApi>) {
        self.adapters.insert(slug.to_owned(), adapter);
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn ProviderApi>> {
        self.adapters.get(slug).cloned()
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&str, &Arc<dyn ProviderApi>)> {
        self.adapters.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn upstream_code_mapping() {
        assert_eq!(
            ProviderError::from_upstream_code("NO_NUMBERS"),
            Some(ProviderError::OutOfStock),
        );
        assert_eq!(
            ProviderError::from_upstream_code("bad_service"),
            Some(ProviderError::BadService),
        );
        assert_eq!(ProviderError::from_upstream_code("WAT"), None);
    }

    #[test]
    fn provider_error_to_api_error_kinds() {
        let api: ApiError = ProviderError::OutOfStock.into();
        assert_eq!(api.kind, ErrorKind::OutOfStock);
        let api: ApiError = ProviderError::BreakerOpen.into();
        assert_eq!(api.kind, ErrorKind::ProviderUnavailable);
    }
}
