//! The live HTTP adapter for declaratively-configured providers.
//!
//! One implementation services every provider whose API fits the
//! declarative model: resolve the operation's endpoint template, fire the
//! request under the provider's circuit breaker, evaluate the configured
//! response mapping, and convert the mapped rows into typed domain values.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::id::{CountryCode, ServiceSlug};
use common::money::Amount;
use numio_tokio::task::NxTask;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config_engine::breaker::CircuitBreaker;
use crate::config_engine::cache::{Lookup, SwrCache};
use crate::config_engine::mapping::{MappedRow, ResponseBody};
use crate::config_engine::{
    Acquired, Country, Operation, PriceRow, ProviderApi, ProviderConfig,
    ProviderError, ServiceInfo, StatusPoll, UpstreamSms, UpstreamStatus,
    WebhookPayload, WebhookVerdict, template,
};
use crate::constants;
use crate::webhook;

/// Credentials plus their per-key rate-limit cooldowns. An upstream 429
/// cools down the (provider, credential) pair and rotates to the next key.
struct CredentialPool {
    keys: Vec<String>,
    cooldown_until: Mutex<Vec<Option<Instant>>>,
}

impl CredentialPool {
    fn new(mut keys: Vec<String>) -> Self {
        // Unauthenticated providers still need one (empty) slot so the
        // rotation machinery has something to hand out.
        if keys.is_empty() {
            keys.push(String::new());
        }
        let cooldowns = vec![None; keys.len()];
        Self {
            keys,
            cooldown_until: Mutex::new(cooldowns),
        }
    }

    /// The first credential not currently cooling down.
    fn pick(&self) -> Option<(usize, String)> {
        let now = Instant::now();
        let cooldowns = self.cooldown_until.lock().unwrap();
        self.keys.iter().enumerate().find_map(|(idx, key)| {
            match cooldowns[idx] {
                Some(until) if until > now => None,
                _ => Some((idx, key.clone())),
            }
        })
    }

    fn cooldown(&self, idx: usize, duration: Duration) {
        let mut cooldowns = self.cooldown_until.lock().unwrap();
        cooldowns[idx] = Some(Instant::now() + duration);
    }

    /// Soonest time any credential becomes available again.
    fn min_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.cooldown_until
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|until| until.saturating_duration_since(now))
            .min()
    }
}

struct Inner {
    config: ProviderConfig,
    http: reqwest::Client,
    breaker: CircuitBreaker,
    creds: CredentialPool,
    price_cache: SwrCache<(String, String), Vec<PriceRow>>,
    country_cache: SwrCache<(), Vec<Country>>,
    service_cache: SwrCache<String, Vec<ServiceInfo>>,
}

pub struct DeclarativeAdapter {
    inner: Arc<Inner>,
}

impl DeclarativeAdapter {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        let breaker = CircuitBreaker::new(
            format!("provider:{}", config.slug),
            config.breaker_threshold,
            CircuitBreaker::DEFAULT_COOLDOWN,
        );
        let creds = CredentialPool::new(config.api_keys.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                http,
                breaker,
                creds,
                price_cache: SwrCache::new(
                    4096,
                    constants::PRICE_CACHE_TTL,
                ),
                country_cache: SwrCache::new(
                    4,
                    constants::METADATA_MAX_AGE,
                ),
                service_cache: SwrCache::new(
                    256,
                    constants::METADATA_MAX_AGE,
                ),
            }),
        }
    }
}

impl Inner {
    /// Per-operation deadline. The poller's status calls get a longer
    /// budget than the default.
    fn timeout_for(op: Operation) -> Duration {
        match op {
            Operation::GetStatus => constants::PROVIDER_STATUS_TIMEOUT,
            _ => constants::DEFAULT_EXTERNAL_TIMEOUT,
        }
    }

    /// Resolves, fires, and maps one configured operation.
    async fn call(
        &self,
        op: Operation,
        vars: &HashMap<&str, String>,
    ) -> Result<Vec<MappedRow>, ProviderError> {
        let spec = self
            .config
            .endpoints
            .get(&op)
            .ok_or(ProviderError::NotConfigured)?;
        let mapping = self
            .config
            .mappings
            .get(&op)
            .ok_or(ProviderError::NotConfigured)?;

        self.breaker
            .run(async {
                // At most one attempt per credential; an upstream 429
                // rotates to the next key.
                for _ in 0..self.creds.keys.len().max(1) {
                    let (cred_idx, api_key) =
                        self.creds.pick().ok_or_else(|| {
                            ProviderError::RateLimited {
                                retry_after: self.creds.min_remaining(),
                            }
                        })?;

                    let resolved = template::resolve(
                        &self.config.base_url,
                        spec,
                        &self.config.auth,
                        &api_key,
                        vars,
                    )
                    .map_err(|e| {
                        ProviderError::BadResponse(format!(
                            "Bad endpoint template: {e}"
                        ))
                    })?;

                    match self.send(op, resolved).await? {
                        SendOutcome::RateLimited { retry_after } => {
                            let cooldown = retry_after
                                .unwrap_or(Duration::from_secs(60));
                            debug!(
                                provider = %self.config.slug,
                                ?cooldown,
                                "Upstream 429; rotating credential",
                            );
                            self.creds.cooldown(cred_idx, cooldown);
                            continue;
                        }
                        SendOutcome::Body(body) => {
                            sniff_upstream_error(&body)?;
                            return mapping.eval(&body).map_err(|e| {
                                ProviderError::BadResponse(e.to_string())
                            });
                        }
                    }
                }
                Err(ProviderError::RateLimited {
                    retry_after: self.creds.min_remaining(),
                })
            })
            .await
    }

    async fn send(
        &self,
        op: Operation,
        resolved: template::ResolvedRequest,
    ) -> Result<SendOutcome, ProviderError> {
        let mut request = self
            .http
            .request(resolved.method, &resolved.url)
            .timeout(Self::timeout_for(op));
        for (name, value) in &resolved.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Unavailable(format!("{e}"))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = parse_retry_after(&response);
            // The header usually wins; fall back to a textual
            // `retry in Ns` hint in the body.
            let body = response.text().await.unwrap_or_default();
            let retry_after =
                retry_after.or_else(|| parse_retry_hint(&body));
            return Ok(SendOutcome::RateLimited { retry_after });
        }

        let is_json = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));

        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_4xx(&text));
        }
        if status.is_server_error() {
            return Err(ProviderError::Unavailable(format!(
                "Upstream HTTP {status}"
            )));
        }

        let bytes = response.bytes().await.map_err(|e| {
            ProviderError::Unavailable(format!("Body read failed: {e}"))
        })?;

        let body = if is_json {
            serde_json::from_slice::<Value>(&bytes)
                .map(ResponseBody::Json)
                .map_err(|e| {
                    ProviderError::BadResponse(format!("Bad JSON: {e}"))
                })?
        } else {
            ResponseBody::Text(
                String::from_utf8_lossy(&bytes).into_owned(),
            )
        };
        Ok(SendOutcome::Body(body))
    }

    async fn fetch_prices(
        &self,
        country: Option<&CountryCode>,
        service: Option<&ServiceSlug>,
    ) -> Result<Vec<PriceRow>, ProviderError> {
        let vars = HashMap::from([
            (
                "country",
                country.map(|c| c.as_str().to_owned()).unwrap_or_default(),
            ),
            (
                "service",
                service.map(|s| s.as_str().to_owned()).unwrap_or_default(),
            ),
        ]);
        let rows = self.call(Operation::GetPrices, &vars).await?;
        rows.iter()
            .map(|row| row_to_price(row, country, service))
            .collect()
    }

    async fn fetch_countries(&self) -> Result<Vec<Country>, ProviderError> {
        let rows =
            self.call(Operation::GetCountries, &HashMap::new()).await?;
        rows.iter().map(row_to_country).collect()
    }

    async fn fetch_services(
        &self,
        country: Option<&CountryCode>,
    ) -> Result<Vec<ServiceInfo>, ProviderError> {
        let vars = HashMap::from([(
            "country",
            country.map(|c| c.as_str().to_owned()).unwrap_or_default(),
        )]);
        let rows = self.call(Operation::GetServices, &vars).await?;
        rows.iter().map(row_to_service).collect()
    }
}

enum SendOutcome {
    Body(ResponseBody),
    RateLimited { retry_after: Option<Duration> },
}

#[async_trait]
impl ProviderApi for DeclarativeAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.inner.config
    }

    async fn countries(&self) -> Result<Vec<Country>, ProviderError> {
        let inner = &self.inner;
        match inner.country_cache.get(&()) {
            Lookup::Fresh(countries) => Ok(countries),
            Lookup::Stale(countries) => {
                let task_inner = inner.clone();
                NxTask::<()>::spawn(
                    format!("revalidate-countries-{}", inner.config.slug),
                    async move {
                        if let Ok(fresh) = task_inner.fetch_countries().await
                        {
                            task_inner.country_cache.insert((), fresh);
                        }
                    },
                )
                .detach();
                Ok(countries)
            }
            Lookup::Miss => {
                let countries = inner.fetch_countries().await?;
                inner.country_cache.insert((), countries.clone());
                Ok(countries)
            }
        }
    }

    async fn services(
        &self,
        country: Option<&CountryCode>,
    ) -> Result<Vec<ServiceInfo>, ProviderError> {
        let inner = &self.inner;
        let key = country.map(|c| c.as_str().to_owned()).unwrap_or_default();
        match inner.service_cache.get(&key) {
            Lookup::Fresh(services) => Ok(services),
            Lookup::Stale(services) => {
                let task_inner = inner.clone();
                let country = country.cloned();
                NxTask::<()>::spawn(
                    format!("revalidate-services-{}", inner.config.slug),
                    async move {
                        let fresh = task_inner
                            .fetch_services(country.as_ref())
                            .await;
                        if let Ok(fresh) = fresh {
                            let key = country
                                .map(|c| c.as_str().to_owned())
                                .unwrap_or_default();
                            task_inner.service_cache.insert(key, fresh);
                        }
                    },
                )
                .detach();
                Ok(services)
            }
            Lookup::Miss => {
                let services = inner.fetch_services(country).await?;
                inner.service_cache.insert(key, services.clone());
                Ok(services)
            }
        }
    }

    async fn prices(
        &self,
        country: Option<&CountryCode>,
        service: Option<&ServiceSlug>,
    ) -> Result<Vec<PriceRow>, ProviderError> {
        let inner = &self.inner;
        let key = (
            country.map(|c| c.as_str().to_owned()).unwrap_or_default(),
            service.map(|s| s.as_str().to_owned()).unwrap_or_default(),
        );
        match inner.price_cache.get(&key) {
            Lookup::Fresh(prices) => Ok(prices),
            Lookup::Stale(prices) => {
                let task_inner = inner.clone();
                let country = country.cloned();
                let service = service.cloned();
                NxTask::<()>::spawn(
                    format!("revalidate-prices-{}", inner.config.slug),
                    async move {
                        let fresh = task_inner
                            .fetch_prices(country.as_ref(), service.as_ref())
                            .await;
                        if let Ok(fresh) = fresh {
                            let key = (
                                country
                                    .map(|c| c.as_str().to_owned())
                                    .unwrap_or_default(),
                                service
                                    .map(|s| s.as_str().to_owned())
                                    .unwrap_or_default(),
                            );
                            task_inner.price_cache.insert(key, fresh);
                        }
                    },
                )
                .detach();
                Ok(prices)
            }
            Lookup::Miss => {
                let prices =
                    inner.fetch_prices(country, service).await?;
                inner.price_cache.insert(key, prices.clone());
                Ok(prices)
            }
        }
    }

    async fn acquire_number(
        &self,
        country: &CountryCode,
        service: &ServiceSlug,
        operator: Option<&str>,
    ) -> Result<Acquired, ProviderError> {
        let vars = HashMap::from([
            ("country", country.as_str().to_owned()),
            ("service", service.as_str().to_owned()),
            ("operator", operator.unwrap_or_default().to_owned()),
        ]);
        let rows = self.inner.call(Operation::GetNumber, &vars).await?;
        let row = rows.first().ok_or_else(|| {
            ProviderError::BadResponse("Empty number response".to_owned())
        })?;
        row_to_acquired(row)
    }

    async fn status(
        &self,
        provider_activation_id: &str,
    ) -> Result<StatusPoll, ProviderError> {
        let vars = HashMap::from([(
            "activation_id",
            provider_activation_id.to_owned(),
        )]);
        let rows = self.inner.call(Operation::GetStatus, &vars).await?;
        let row = rows.first().ok_or_else(|| {
            ProviderError::BadResponse("Empty status response".to_owned())
        })?;
        Ok(row_to_status(row))
    }

    async fn set_status(
        &self,
        provider_activation_id: &str,
        next: UpstreamStatus,
    ) -> Result<(), ProviderError> {
        let status = match next {
            UpstreamStatus::Pending => "pending",
            UpstreamStatus::Received => "received",
            UpstreamStatus::Completed => "completed",
            UpstreamStatus::Cancelled => "cancelled",
            UpstreamStatus::Unknown =>
                return Err(ProviderError::BadResponse(
                    "Refusing to push an unknown status".to_owned(),
                )),
        };
        let vars = HashMap::from([
            ("activation_id", provider_activation_id.to_owned()),
            ("status", status.to_owned()),
        ]);
        self.inner.call(Operation::SetStatus, &vars).await?;
        Ok(())
    }

    async fn cancel_number(
        &self,
        provider_activation_id: &str,
    ) -> Result<(), ProviderError> {
        let vars = HashMap::from([(
            "activation_id",
            provider_activation_id.to_owned(),
        )]);
        self.inner.call(Operation::CancelNumber, &vars).await?;
        Ok(())
    }

    async fn balance(&self) -> Result<Amount, ProviderError> {
        let rows =
            self.inner.call(Operation::GetBalance, &HashMap::new()).await?;
        let row = rows.first().ok_or_else(|| {
            ProviderError::BadResponse("Empty balance response".to_owned())
        })?;
        let value = row.get("value").or_else(|| row.get("balance"));
        value
            .and_then(value_to_amount)
            .ok_or_else(|| {
                ProviderError::BadResponse(
                    "Balance is not a number".to_owned(),
                )
            })
    }

    fn parse_webhook(
        &self,
        raw: &[u8],
    ) -> Result<WebhookPayload, ProviderError> {
        webhook::parse_payload(raw).map_err(|e| {
            ProviderError::BadResponse(format!("Bad webhook payload: {e}"))
        })
    }

    fn verify_webhook(
        &self,
        raw_body: &[u8],
        headers: &http::HeaderMap,
        source_ip: IpAddr,
    ) -> WebhookVerdict {
        let config = &self.inner.config;
        let Some(secret) = config.webhook_secret.as_deref() else {
            return WebhookVerdict {
                valid: false,
                error: Some("Provider has no webhook secret".to_owned()),
                time_drift: None,
            };
        };
        webhook::verify_signature(
            secret.as_bytes(),
            raw_body,
            headers,
            source_ip,
            &config.webhook_allowed_ips,
        )
    }
}

// --- Upstream error classification --- //

/// Maps a 4xx body onto a typed error.
fn classify_4xx(body: &str) -> ProviderError {
    let trimmed = body.trim();
    if let Some(err) = ProviderError::from_upstream_code(trimmed) {
        return err;
    }
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) {
        for key in ["error", "code", "message"] {
            if let Some(Value::String(code)) = obj.get(key) {
                if let Some(err) = ProviderError::from_upstream_code(code) {
                    return err;
                }
            }
        }
    }
    ProviderError::Unavailable(format!(
        "Upstream rejected request: {}",
        &trimmed[..trimmed.len().min(128)],
    ))
}

/// Some upstreams report errors with HTTP 200 and a bare textual code.
fn sniff_upstream_error(body: &ResponseBody) -> Result<(), ProviderError> {
    let text = match body {
        ResponseBody::Text(text) => text.trim(),
        ResponseBody::Json(Value::String(s)) => s.trim(),
        ResponseBody::Json(_) => return Ok(()),
    };
    if text.len() <= 32 {
        if let Some(err) = ProviderError::from_upstream_code(text) {
            return Err(err);
        }
    }
    Ok(())
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Parses a textual `retry in Ns` hint.
fn parse_retry_hint(body: &str) -> Option<Duration> {
    let re = regex::Regex::new(r"(?i)retry\s+in\s+(\d+)\s*s").unwrap();
    let captures = re.captures(body)?;
    captures[1].parse::<u64>().ok().map(Duration::from_secs)
}

// --- Row converters --- //

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_amount(value: &Value) -> Option<Amount> {
    let decimal = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_u64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64().and_then(Decimal::from_f64)
            }
        }
        Value::String(s) => s.trim().parse::<Decimal>().ok(),
        _ => None,
    }?;
    Amount::try_from_decimal(decimal).ok()
}

fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) =>
            n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn str_field(row: &MappedRow, name: &str) -> Option<String> {
    row.get(name).and_then(value_to_string).filter(|s| !s.is_empty())
}

fn row_to_country(row: &MappedRow) -> Result<Country, ProviderError> {
    let bad = |what: &str| {
        ProviderError::BadResponse(format!("Country row missing {what}"))
    };
    let code_raw = str_field(row, "code")
        .or_else(|| str_field(row, "country"))
        .ok_or_else(|| bad("code"))?;
    let code = CountryCode::new(&code_raw)
        .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
    let external_id =
        str_field(row, "id").unwrap_or_else(|| code_raw.clone());
    let name = str_field(row, "name").unwrap_or_else(|| code_raw.clone());
    Ok(Country {
        external_id,
        code,
        name,
        flag_url: str_field(row, "flag"),
    })
}

fn row_to_service(row: &MappedRow) -> Result<ServiceInfo, ProviderError> {
    let bad = |what: &str| {
        ProviderError::BadResponse(format!("Service row missing {what}"))
    };
    let slug_raw = str_field(row, "slug")
        .or_else(|| str_field(row, "service"))
        .or_else(|| str_field(row, "code"))
        .ok_or_else(|| bad("slug"))?;
    let slug = ServiceSlug::normalize(&slug_raw)
        .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
    let external_id =
        str_field(row, "id").unwrap_or_else(|| slug_raw.clone());
    let name = str_field(row, "name").unwrap_or_else(|| slug_raw.clone());
    Ok(ServiceInfo {
        external_id,
        slug,
        name,
        icon_url: str_field(row, "icon"),
    })
}

/// Converts a mapped price row, falling back to the request's own country
/// and service arguments when the upstream response omits them.
fn row_to_price(
    row: &MappedRow,
    req_country: Option<&CountryCode>,
    req_service: Option<&ServiceSlug>,
) -> Result<PriceRow, ProviderError> {
    let bad = |what: &str| {
        ProviderError::BadResponse(format!("Price row missing {what}"))
    };

    let country = match str_field(row, "country") {
        Some(code) => CountryCode::new(&code)
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?,
        None => req_country.cloned().ok_or_else(|| bad("country"))?,
    };
    let service = match str_field(row, "service") {
        Some(slug) => ServiceSlug::normalize(&slug)
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?,
        None => req_service.cloned().ok_or_else(|| bad("service"))?,
    };
    let cost = row
        .get("cost")
        .or_else(|| row.get("price"))
        .and_then(value_to_amount)
        .ok_or_else(|| bad("cost"))?;
    let count = row
        .get("count")
        .or_else(|| row.get("stock"))
        .and_then(value_to_u64)
        .unwrap_or(0);

    Ok(PriceRow {
        country,
        service,
        operator: str_field(row, "operator"),
        cost,
        count,
    })
}

fn row_to_acquired(row: &MappedRow) -> Result<Acquired, ProviderError> {
    let bad = |what: &str| {
        ProviderError::BadResponse(format!("Number row missing {what}"))
    };
    let activation_id = str_field(row, "activation_id")
        .or_else(|| str_field(row, "id"))
        .ok_or_else(|| bad("activation_id"))?;
    let phone_number = str_field(row, "phone")
        .or_else(|| str_field(row, "number"))
        .ok_or_else(|| bad("phone"))?;
    Ok(Acquired {
        activation_id,
        phone_number,
        price: row.get("price").and_then(value_to_amount),
    })
}

fn row_to_status(row: &MappedRow) -> StatusPoll {
    let status = str_field(row, "status")
        .map(|s| UpstreamStatus::from_canonical(&s))
        .unwrap_or(UpstreamStatus::Unknown);

    let mut messages = Vec::new();
    if let Some(Value::Array(raw_messages)) =
        row.get("messages").or_else(|| row.get("sms"))
    {
        for (idx, raw) in raw_messages.iter().enumerate() {
            let Some(obj) = raw.as_object() else { continue };
            let text = obj
                .get("text")
                .or_else(|| obj.get("content"))
                .or_else(|| obj.get("message"))
                .and_then(value_to_string)
                .unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            messages.push(UpstreamSms {
                id: obj
                    .get("id")
                    .and_then(value_to_string)
                    .unwrap_or_else(|| format!("idx{idx}")),
                sender: obj
                    .get("sender")
                    .or_else(|| obj.get("from"))
                    .and_then(value_to_string)
                    .unwrap_or_default(),
                text,
                received_at: None,
            });
        }
    } else if let Some(code) = str_field(row, "code") {
        // Text-protocol upstreams often return just the OTP code; surface
        // it as a synthetic message so extraction still has something to
        // chew on.
        messages.push(UpstreamSms {
            id: "code".to_owned(),
            sender: String::new(),
            text: code,
            received_at: None,
        });
    }

    if messages.is_empty()
        && matches!(status, UpstreamStatus::Received)
    {
        warn!("Upstream reports 'received' but sent no messages");
    }

    StatusPoll { status, messages }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> MappedRow {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn price_row_conversion() {
        let mapped = row(json!({
            "country": "US", "service": "Telegram",
            "cost": "1.50", "count": 10, "operator": "mts",
        }));
        let price = row_to_price(&mapped, None, None).unwrap();
        assert_eq!(price.country.as_str(), "us");
        assert_eq!(price.service.as_str(), "telegram");
        assert_eq!(price.cost.to_string(), "1.50");
        assert_eq!(price.count, 10);
        assert_eq!(price.operator.as_deref(), Some("mts"));

        // Falls back to the request arguments when the row omits them.
        let mapped = row(json!({"price": 2.0, "count": 5}));
        let country = CountryCode::new("gb").unwrap();
        let service = ServiceSlug::new("whatsapp").unwrap();
        let price =
            row_to_price(&mapped, Some(&country), Some(&service)).unwrap();
        assert_eq!(price.country.as_str(), "gb");
        assert_eq!(price.service.as_str(), "whatsapp");

        let mapped = row(json!({"count": 5}));
        assert!(row_to_price(&mapped, Some(&country), Some(&service)).is_err());
    }

    #[test]
    fn acquired_and_status_conversion() {
        let mapped = row(json!({
            "activation_id": 12345, "phone": "+15551230000",
        }));
        let acquired = row_to_acquired(&mapped).unwrap();
        assert_eq!(acquired.activation_id, "12345");
        assert_eq!(acquired.phone_number, "+15551230000");

        let mapped = row(json!({
            "status": "received",
            "messages": [
                {"id": "m1", "sender": "TG", "text": "Your code is 842193"},
                {"bogus": true},
            ],
        }));
        let poll = row_to_status(&mapped);
        assert_eq!(poll.status, UpstreamStatus::Received);
        assert_eq!(poll.messages.len(), 1);
        assert_eq!(poll.messages[0].sender, "TG");

        let mapped = row(json!({"status": "weird"}));
        assert_eq!(row_to_status(&mapped).status, UpstreamStatus::Unknown);
    }

    #[test]
    fn retry_hint_parsing() {
        assert_eq!(
            parse_retry_hint("rate limited, retry in 17s"),
            Some(Duration::from_secs(17)),
        );
        assert_eq!(
            parse_retry_hint("RETRY IN 5 s please"),
            Some(Duration::from_secs(5)),
        );
        assert_eq!(parse_retry_hint("no hint here"), None);
    }

    #[test]
    fn error_sniffing() {
        let body = ResponseBody::Text("NO_NUMBERS".to_owned());
        assert_eq!(
            sniff_upstream_error(&body),
            Err(ProviderError::OutOfStock),
        );
        let body = ResponseBody::Text("ACCESS_NUMBER:1:2".to_owned());
        assert_eq!(sniff_upstream_error(&body), Ok(()));

        assert_eq!(classify_4xx("BAD_KEY"), ProviderError::BadKey);
        assert_eq!(
            classify_4xx(r#"{"error": "BAD_SERVICE"}"#),
            ProviderError::BadService,
        );
        assert!(matches!(
            classify_4xx("weird failure"),
            ProviderError::Unavailable(_),
        ));
    }

    #[test]
    fn credential_pool_rotation() {
        let pool =
            CredentialPool::new(vec!["k1".to_owned(), "k2".to_owned()]);
        assert_eq!(pool.pick().unwrap(), (0, "k1".to_owned()));

        pool.cooldown(0, Duration::from_secs(60));
        assert_eq!(pool.pick().unwrap(), (1, "k2".to_owned()));

        pool.cooldown(1, Duration::from_secs(60));
        assert!(pool.pick().is_none());
        assert!(pool.min_remaining().unwrap() <= Duration::from_secs(60));
    }
}
