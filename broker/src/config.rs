//! Environment configuration.
//!
//! One [`Config::from_env`] call at process start validates everything;
//! nothing else in the codebase reads the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use common::money::Amount;
use numio_core::catalogue::PricingPolicy;
use numio_core::outbox::WebhookSubscriber;
use rust_decimal::Decimal;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    /// Session-mode pooler for queue maintenance; falls back to
    /// `database_url`.
    pub direct_url: Option<String>,
    pub redis_url: String,
    pub search_host: String,
    pub search_api_key: String,
    pub jwt_secret: String,
    pub csrf_secret: String,
    /// 32-byte hex key used by the (out-of-core) admin flows to seal
    /// provider credentials at rest; validated here so a misconfigured
    /// deployment fails at boot, not at first use.
    pub encryption_key: [u8; 32],
    pub bind_addr: SocketAddr,
    pub socket_bind_addr: SocketAddr,
    pub pricing: PricingPolicy,
    pub provider_balance_watermark: Option<Amount>,
    pub webhook_subscriber: Option<WebhookSubscriber>,
    /// Icon assets live under this fixed path.
    pub icon_dir: Option<PathBuf>,
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("Missing env var {name}"))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let encryption_key_hex = required("ENCRYPTION_KEY")?;
        let encryption_key = parse_hex_32(&encryption_key_hex)
            .context("ENCRYPTION_KEY must be 32 bytes of hex")?;

        let bind_addr = optional("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_owned())
            .parse::<SocketAddr>()
            .context("Bad BIND_ADDR")?;
        let socket_bind_addr = optional("SOCKET_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8081".to_owned())
            .parse::<SocketAddr>()
            .context("Bad SOCKET_BIND_ADDR")?;

        let points_enabled = optional("POINTS_ENABLED")
            .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));
        let points_rate = match optional("POINTS_RATE") {
            Some(raw) => Decimal::from_str(&raw)
                .context("Bad POINTS_RATE")?,
            None => Decimal::ONE,
        };

        let provider_balance_watermark =
            match optional("PROVIDER_BALANCE_WATERMARK") {
                Some(raw) => Some(
                    Decimal::from_str(&raw)
                        .ok()
                        .and_then(|d| Amount::try_from_decimal(d).ok())
                        .context("Bad PROVIDER_BALANCE_WATERMARK")?,
                ),
                None => None,
            };

        let webhook_subscriber = match (
            optional("WEBHOOK_SUBSCRIBER_URL"),
            optional("WEBHOOK_SUBSCRIBER_SECRET"),
        ) {
            (Some(url), Some(secret)) =>
                Some(WebhookSubscriber { url, secret }),
            (Some(_), None) => anyhow::bail!(
                "WEBHOOK_SUBSCRIBER_URL set without \
                 WEBHOOK_SUBSCRIBER_SECRET"
            ),
            _ => None,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            direct_url: optional("DIRECT_URL"),
            redis_url: required("REDIS_URL")?,
            search_host: required("SEARCH_HOST")?,
            search_api_key: required("SEARCH_API_KEY")?,
            jwt_secret: required("JWT_SECRET")?,
            csrf_secret: required("CSRF_SECRET")?,
            encryption_key,
            bind_addr,
            socket_bind_addr,
            pricing: PricingPolicy {
                points_enabled,
                points_rate,
            },
            provider_balance_watermark,
            webhook_subscriber,
            icon_dir: optional("ICON_DIR").map(PathBuf::from),
        })
    }
}

fn parse_hex_32(hex: &str) -> anyhow::Result<[u8; 32]> {
    anyhow::ensure!(hex.len() == 64, "Expected 64 hex chars");
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .context("Bad hex digit")?;
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_key_parsing() {
        let hex = "ab".repeat(32);
        let key = parse_hex_32(&hex).unwrap();
        assert_eq!(key[0], 0xab);
        assert!(parse_hex_32("abcd").is_err());
        assert!(parse_hex_32(&"zz".repeat(32)).is_err());
    }
}
