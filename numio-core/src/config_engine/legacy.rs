//! Adapters for providers that predate the declarative engine.
//!
//! A few long-tail upstreams speak the classic `handler_api.php` text
//! protocol and publish metadata in a shape the declarative engine can't
//! express (a dictionary keyed by numeric id with per-language names).
//! They're flagged `legacy_metadata` in their config and served by this
//! adapter, which implements the exact same capability set.

use std::net::IpAddr;

use async_trait::async_trait;
use common::id::{CountryCode, ServiceSlug};
use common::money::Amount;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::config_engine::breaker::CircuitBreaker;
use crate::config_engine::{
    Acquired, Country, PriceRow, ProviderApi, ProviderConfig, ProviderError,
    ServiceInfo, StatusPoll, UpstreamSms, UpstreamStatus, WebhookPayload,
    WebhookVerdict,
};
use crate::constants;
use crate::webhook;

pub struct LegacyTextAdapter {
    config: ProviderConfig,
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl LegacyTextAdapter {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        let breaker = CircuitBreaker::new(
            format!("provider:{}", config.slug),
            config.breaker_threshold,
            CircuitBreaker::DEFAULT_COOLDOWN,
        );
        Self {
            config,
            http,
            breaker,
        }
    }

    fn api_key(&self) -> &str {
        self.config
            .api_keys
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Fires `?action=<action>&api_key=..&<extra>` and returns the raw
    /// body text.
    async fn action(
        &self,
        action: &str,
        extra: &[(&str, &str)],
    ) -> Result<String, ProviderError> {
        self.breaker
            .run(async {
                let mut query: Vec<(&str, &str)> = vec![
                    ("action", action),
                    ("api_key", self.api_key()),
                ];
                query.extend(
                    extra.iter().filter(|(_, v)| !v.is_empty()).copied(),
                );

                let response = self
                    .http
                    .get(&self.config.base_url)
                    .query(&query)
                    .timeout(constants::DEFAULT_EXTERNAL_TIMEOUT)
                    .send()
                    .await
                    .map_err(|e| {
                        if e.is_timeout() {
                            ProviderError::Timeout
                        } else {
                            ProviderError::Unavailable(format!("{e}"))
                        }
                    })?;

                let status = response.status();
                if status.is_server_error() {
                    return Err(ProviderError::Unavailable(format!(
                        "Upstream HTTP {status}"
                    )));
                }
                let text = response.text().await.map_err(|e| {
                    ProviderError::Unavailable(format!(
                        "Body read failed: {e}"
                    ))
                })?;

                let trimmed = text.trim();
                if let Some(err) =
                    ProviderError::from_upstream_code(trimmed)
                {
                    return Err(err);
                }
                Ok(trimmed.to_owned())
            })
            .await
    }
}

#[async_trait]
impl ProviderApi for LegacyTextAdapter {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn countries(&self) -> Result<Vec<Country>, ProviderError> {
        let body = self.action("getCountries", &[]).await?;
        parse_legacy_countries(&body)
    }

    async fn services(
        &self,
        country: Option<&CountryCode>,
    ) -> Result<Vec<ServiceInfo>, ProviderError> {
        let country_arg = country.map(|c| c.as_str()).unwrap_or_default();
        let body = self
            .action("getServices", &[("country", country_arg)])
            .await?;
        parse_legacy_services(&body)
    }

    async fn prices(
        &self,
        country: Option<&CountryCode>,
        service: Option<&ServiceSlug>,
    ) -> Result<Vec<PriceRow>, ProviderError> {
        let country_arg = country.map(|c| c.as_str()).unwrap_or_default();
        let service_arg = service.map(|s| s.as_str()).unwrap_or_default();
        let body = self
            .action(
                "getPrices",
                &[("country", country_arg), ("service", service_arg)],
            )
            .await?;
        parse_legacy_prices(&body)
    }

    async fn acquire_number(
        &self,
        country: &CountryCode,
        service: &ServiceSlug,
        operator: Option<&str>,
    ) -> Result<Acquired, ProviderError> {
        let body = self
            .action(
                "getNumber",
                &[
                    ("country", country.as_str()),
                    ("service", service.as_str()),
                    ("operator", operator.unwrap_or_default()),
                ],
            )
            .await?;
        parse_access_number(&body)
    }

    async fn status(
        &self,
        provider_activation_id: &str,
    ) -> Result<StatusPoll, ProviderError> {
        let body = self
            .action("getStatus", &[("id", provider_activation_id)])
            .await?;
        Ok(parse_legacy_status(&body))
    }

    async fn set_status(
        &self,
        provider_activation_id: &str,
        next: UpstreamStatus,
    ) -> Result<(), ProviderError> {
        // The classic numeric status codes: 1 = ready, 6 = complete,
        // 8 = cancel.
        let code = match next {
            UpstreamStatus::Pending => "1",
            UpstreamStatus::Completed => "6",
            UpstreamStatus::Cancelled => "8",
            UpstreamStatus::Received | UpstreamStatus::Unknown =>
                return Err(ProviderError::BadResponse(
                    "Legacy protocol can't push this status".to_owned(),
                )),
        };
        self.action(
            "setStatus",
            &[("id", provider_activation_id), ("status", code)],
        )
        .await?;
        Ok(())
    }

    async fn cancel_number(
        &self,
        provider_activation_id: &str,
    ) -> Result<(), ProviderError> {
        self.set_status(provider_activation_id, UpstreamStatus::Cancelled)
            .await
    }

    async fn balance(&self) -> Result<Amount, ProviderError> {
        let body = self.action("getBalance", &[]).await?;
        parse_access_balance(&body)
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
        let Some(secret) = self.config.webhook_secret.as_deref() else {
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
            &self.config.webhook_allowed_ips,
        )
    }
}

// --- Text protocol parsers --- //

/// `ACCESS_NUMBER:<id>:<phone>`
fn parse_access_number(body: &str) -> Result<Acquired, ProviderError> {
    let mut parts = body.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("ACCESS_NUMBER"), Some(id), Some(phone))
            if !id.is_empty() && !phone.is_empty() =>
            Ok(Acquired {
                activation_id: id.to_owned(),
                phone_number: phone.to_owned(),
                price: None,
            }),
        _ => Err(ProviderError::BadResponse(format!(
            "Unexpected getNumber reply: {body}"
        ))),
    }
}

/// `STATUS_WAIT_CODE` | `STATUS_OK:<code>` | `STATUS_CANCEL` | ...
fn parse_legacy_status(body: &str) -> StatusPoll {
    let (head, rest) = match body.split_once(':') {
        Some((head, rest)) => (head, Some(rest)),
        None => (body, None),
    };
    let status = match head {
        "STATUS_WAIT_CODE" | "STATUS_WAIT_RETRY" => UpstreamStatus::Pending,
        "STATUS_OK" | "STATUS_WAIT_RESEND" => UpstreamStatus::Received,
        "ACCESS_ACTIVATION" | "STATUS_FINISH" => UpstreamStatus::Completed,
        "ACCESS_CANCEL" | "STATUS_CANCEL" => UpstreamStatus::Cancelled,
        _ => UpstreamStatus::Unknown,
    };
    let messages = match (status, rest) {
        (UpstreamStatus::Received, Some(code)) if !code.is_empty() =>
            vec![UpstreamSms {
                id: format!("code-{code}"),
                sender: String::new(),
                text: code.to_owned(),
                received_at: None,
            }],
        _ => Vec::new(),
    };
    StatusPoll { status, messages }
}

/// `ACCESS_BALANCE:<amount>`
fn parse_access_balance(body: &str) -> Result<Amount, ProviderError> {
    let amount = body
        .strip_prefix("ACCESS_BALANCE:")
        .and_then(|raw| raw.trim().parse::<Decimal>().ok())
        .and_then(|dec| Amount::try_from_decimal(dec).ok());
    amount.ok_or_else(|| {
        ProviderError::BadResponse(format!(
            "Unexpected getBalance reply: {body}"
        ))
    })
}

/// `{"0": {"id": 0, "eng": "Russia", "iso": "ru", ...}, ...}`
fn parse_legacy_countries(body: &str) -> Result<Vec<Country>, ProviderError> {
    let json: Value = serde_json::from_str(body).map_err(|e| {
        ProviderError::BadResponse(format!("Bad countries JSON: {e}"))
    })?;
    let object = json.as_object().ok_or_else(|| {
        ProviderError::BadResponse("Countries is not an object".to_owned())
    })?;

    let mut countries = Vec::with_capacity(object.len());
    for (external_id, entry) in object {
        let Some(iso) = entry.get("iso").and_then(Value::as_str) else {
            continue;
        };
        let Ok(code) = CountryCode::new(iso) else { continue };
        let name = entry
            .get("eng")
            .or_else(|| entry.get("name"))
            .and_then(Value::as_str)
            .unwrap_or(iso)
            .to_owned();
        countries.push(Country {
            external_id: external_id.clone(),
            code,
            name,
            flag_url: None,
        });
    }
    Ok(countries)
}

/// `{"tg": "Telegram", "wa": "WhatsApp"}` or
/// `{"tg": {"name": "Telegram"}}`
fn parse_legacy_services(
    body: &str,
) -> Result<Vec<ServiceInfo>, ProviderError> {
    let json: Value = serde_json::from_str(body).map_err(|e| {
        ProviderError::BadResponse(format!("Bad services JSON: {e}"))
    })?;
    let object = json.as_object().ok_or_else(|| {
        ProviderError::BadResponse("Services is not an object".to_owned())
    })?;

    let mut services = Vec::with_capacity(object.len());
    for (external_id, entry) in object {
        let name = match entry {
            Value::String(name) => name.clone(),
            Value::Object(fields) => fields
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(external_id)
                .to_owned(),
            _ => continue,
        };
        let Ok(slug) = ServiceSlug::normalize(external_id) else {
            continue;
        };
        services.push(ServiceInfo {
            external_id: external_id.clone(),
            slug,
            name,
            icon_url: None,
        });
    }
    Ok(services)
}

/// `{"<country>": {"<service>": {"cost": 1.5, "count": 10}}}`
fn parse_legacy_prices(body: &str) -> Result<Vec<PriceRow>, ProviderError> {
    let json: Value = serde_json::from_str(body).map_err(|e| {
        ProviderError::BadResponse(format!("Bad prices JSON: {e}"))
    })?;
    let object = json.as_object().ok_or_else(|| {
        ProviderError::BadResponse("Prices is not an object".to_owned())
    })?;

    let mut rows = Vec::new();
    for (country_raw, services) in object {
        let Ok(country) = CountryCode::new(country_raw) else { continue };
        let Some(services) = services.as_object() else { continue };
        for (service_raw, price_info) in services {
            let Ok(service) = ServiceSlug::normalize(service_raw) else {
                continue;
            };
            let cost = price_info
                .get("cost")
                .or_else(|| price_info.get("price"))
                .and_then(|v| match v {
                    Value::Number(n) =>
                        n.as_f64().map(|f| f.to_string()),
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .and_then(|s| s.parse::<Decimal>().ok())
                .and_then(|d| Amount::try_from_decimal(d).ok());
            let Some(cost) = cost else { continue };
            let count = price_info
                .get("count")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            rows.push(PriceRow {
                country: country.clone(),
                service,
                operator: None,
                cost,
                count,
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn access_number() {
        let acquired =
            parse_access_number("ACCESS_NUMBER:12345:+15551230000").unwrap();
        assert_eq!(acquired.activation_id, "12345");
        assert_eq!(acquired.phone_number, "+15551230000");
        assert!(parse_access_number("NO_NUMBERS").is_err());
        assert!(parse_access_number("ACCESS_NUMBER:").is_err());
    }

    #[test]
    fn status_replies() {
        let poll = parse_legacy_status("STATUS_WAIT_CODE");
        assert_eq!(poll.status, UpstreamStatus::Pending);
        assert!(poll.messages.is_empty());

        let poll = parse_legacy_status("STATUS_OK:842193");
        assert_eq!(poll.status, UpstreamStatus::Received);
        assert_eq!(poll.messages[0].text, "842193");

        let poll = parse_legacy_status("ACCESS_CANCEL");
        assert_eq!(poll.status, UpstreamStatus::Cancelled);

        let poll = parse_legacy_status("SOMETHING_ELSE");
        assert_eq!(poll.status, UpstreamStatus::Unknown);
    }

    #[test]
    fn balance_reply() {
        let balance = parse_access_balance("ACCESS_BALANCE:42.17").unwrap();
        assert_eq!(balance.to_string(), "42.17");
        assert!(parse_access_balance("ACCESS_BALANCE:abc").is_err());
    }

    #[test]
    fn metadata_parsing() {
        let countries = parse_legacy_countries(
            r#"{"0": {"id": 0, "eng": "Russia", "iso": "ru"},
                "187": {"id": 187, "eng": "United States", "iso": "us"}}"#,
        )
        .unwrap();
        assert_eq!(countries.len(), 2);
        assert!(countries.iter().any(|c| c.code.as_str() == "us"
            && c.external_id == "187"));

        let services = parse_legacy_services(
            r#"{"tg": "Telegram", "wa": {"name": "WhatsApp"}}"#,
        )
        .unwrap();
        assert_eq!(services.len(), 2);

        let prices = parse_legacy_prices(
            r#"{"us": {"tg": {"cost": 1.5, "count": 10},
                       "wa": {"cost": 2.0, "count": 0}}}"#,
        )
        .unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].service.as_str(), "tg");
    }
}
