//! Inbound webhook verification and parsing.
//!
//! Providers that push SMS sign their deliveries with
//! HMAC-SHA256 over `"{timestamp}.{body}"`, hex-encoded in a header.
//! Verification checks the timestamp tolerance first (cheap), then the
//! signature in constant time, then the optional source-IP allowlist.
//! Invalid deliveries bump an anomaly counter and turn into 401s at the
//! transport layer.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use common::time::TimestampMs;
use ring::hmac;
use serde_json::Value;

use crate::config_engine::{
    UpstreamSms, UpstreamStatus, WebhookPayload, WebhookVerdict,
};
use crate::constants::WEBHOOK_TOLERANCE;

/// Default header carrying the hex HMAC signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
/// Default header carrying the sender-asserted unix-seconds timestamp.
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Derives the idempotency key for an inbound webhook:
/// `{provider_slug}:{activation_id}:{ts}`.
pub fn idempotency_key(
    provider_slug: &str,
    provider_activation_id: &str,
    ts: i64,
) -> String {
    format!("{provider_slug}:{provider_activation_id}:{ts}")
}

/// Verifies an inbound webhook delivery.
pub fn verify_signature(
    secret: &[u8],
    raw_body: &[u8],
    headers: &http::HeaderMap,
    source_ip: IpAddr,
    allowed_ips: &[IpAddr],
) -> WebhookVerdict {
    let invalid = |error: &str, drift: Option<Duration>| {
        metrics::counter!("webhook_invalid_total").increment(1);
        WebhookVerdict {
            valid: false,
            error: Some(error.to_owned()),
            time_drift: drift,
        }
    };

    if !allowed_ips.is_empty() && !allowed_ips.contains(&source_ip) {
        return invalid("Source IP not in allowlist", None);
    }

    let Some(ts) = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    else {
        return invalid("Missing or bad timestamp header", None);
    };

    let now_secs = TimestampMs::now().as_i64() / 1000;
    let drift = Duration::from_secs(now_secs.abs_diff(ts));
    if drift > WEBHOOK_TOLERANCE {
        return invalid("Timestamp outside tolerance", Some(drift));
    }

    let Some(signature_hex) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return invalid("Missing signature header", Some(drift));
    };
    let Ok(signature) = hex_decode(signature_hex) else {
        return invalid("Signature is not hex", Some(drift));
    };

    // HMAC-SHA256 over "{timestamp}.{body}". ring's verify is
    // constant-time.
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut message = ts.to_string().into_bytes();
    message.push(b'.');
    message.extend_from_slice(raw_body);

    match hmac::verify(&key, &message, &signature) {
        Ok(()) => WebhookVerdict {
            valid: true,
            error: None,
            time_drift: Some(drift),
        },
        Err(_) => invalid("Signature mismatch", Some(drift)),
    }
}

/// Computes the signature a sender would attach. Used by tests and by the
/// outbound webhook deliverer, which signs with the subscriber's secret.
pub fn sign(secret: &[u8], ts: i64, raw_body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut message = ts.to_string().into_bytes();
    message.push(b'.');
    message.extend_from_slice(raw_body);
    hex_encode(hmac::sign(&key, &message).as_ref())
}

/// Parses a provider webhook body into the normalized payload. Providers
/// vary in field naming; this accepts the common shapes.
pub fn parse_payload(raw: &[u8]) -> anyhow::Result<WebhookPayload> {
    let json: Value =
        serde_json::from_slice(raw).context("Webhook body is not JSON")?;
    let obj = json
        .as_object()
        .context("Webhook body is not a JSON object")?;

    let provider_activation_id = ["activation_id", "activationId", "id"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .context("Webhook is missing the activation id")?;

    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .map(UpstreamStatus::from_canonical);

    let ts = obj.get("ts").or_else(|| obj.get("timestamp")).and_then(
        |v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        },
    );

    let mut messages = Vec::new();
    let raw_messages = match obj.get("messages").or_else(|| obj.get("sms")) {
        Some(Value::Array(arr)) => arr.as_slice(),
        _ => &[],
    };
    for (idx, raw_msg) in raw_messages.iter().enumerate() {
        let Some(msg) = raw_msg.as_object() else { continue };
        let text = ["text", "content", "message"]
            .iter()
            .find_map(|k| msg.get(*k))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        messages.push(UpstreamSms {
            id: msg
                .get("id")
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .unwrap_or_else(|| format!("wh{idx}")),
            sender: msg
                .get("sender")
                .or_else(|| msg.get("from"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            text: text.to_owned(),
            received_at: msg
                .get("received_at")
                .and_then(Value::as_i64)
                .and_then(|ms| TimestampMs::try_from_i64(ms).ok()),
        });
    }

    Ok(WebhookPayload {
        provider_activation_id,
        status,
        messages,
        ts,
    })
}

// --- hex --- //

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(hex: &str) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(hex.len() % 2 == 0, "Odd-length hex");
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .context("Bad hex digit")
        })
        .collect()
}

#[cfg(test)]
mod test {
    use http::HeaderValue;

    use super::*;

    const SECRET: &[u8] = b"whsec_test";

    fn signed_headers(ts: i64, body: &[u8]) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            TIMESTAMP_HEADER,
            HeaderValue::from_str(&ts.to_string()).unwrap(),
        );
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign(SECRET, ts, body)).unwrap(),
        );
        headers
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"id": "A1", "status": "received"}"#;
        let ts = TimestampMs::now().as_i64() / 1000;
        let headers = signed_headers(ts, body);

        let verdict =
            verify_signature(SECRET, body, &headers, localhost(), &[]);
        assert!(verdict.valid, "{verdict:?}");
        assert!(verdict.time_drift.unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn tampered_body_rejected() {
        let body = br#"{"id": "A1"}"#;
        let ts = TimestampMs::now().as_i64() / 1000;
        let headers = signed_headers(ts, body);

        let verdict = verify_signature(
            SECRET,
            br#"{"id": "A2"}"#,
            &headers,
            localhost(),
            &[],
        );
        assert!(!verdict.valid);
        assert_eq!(verdict.error.as_deref(), Some("Signature mismatch"));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let body = b"{}";
        let ts = TimestampMs::now().as_i64() / 1000 - 600;
        let headers = signed_headers(ts, body);

        let verdict =
            verify_signature(SECRET, body, &headers, localhost(), &[]);
        assert!(!verdict.valid);
        assert!(verdict.time_drift.unwrap() >= Duration::from_secs(600));
    }

    #[test]
    fn ip_allowlist_enforced() {
        let body = b"{}";
        let ts = TimestampMs::now().as_i64() / 1000;
        let headers = signed_headers(ts, body);
        let allowed: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap()];

        let verdict =
            verify_signature(SECRET, body, &headers, localhost(), &allowed);
        assert!(!verdict.valid);

        let verdict = verify_signature(
            SECRET,
            body,
            &headers,
            "10.0.0.1".parse().unwrap(),
            &allowed,
        );
        assert!(verdict.valid);
    }

    #[test]
    fn payload_parsing() {
        let payload = parse_payload(
            br#"{
                "activation_id": "A1",
                "status": "received",
                "ts": 1700000000,
                "messages": [
                    {"id": "m1", "sender": "TG", "text": "code 842193"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(payload.provider_activation_id, "A1");
        assert_eq!(payload.status, Some(UpstreamStatus::Received));
        assert_eq!(payload.ts, Some(1_700_000_000));
        assert_eq!(payload.messages.len(), 1);

        assert!(parse_payload(b"not json").is_err());
        assert!(parse_payload(b"{}").is_err());
    }

    #[test]
    fn idempotency_key_shape() {
        assert_eq!(
            idempotency_key("acme", "A1", 1_700_000_000),
            "acme:A1:1700000000",
        );
    }
}
