//! Inbound provider webhooks.
//!
//! Providers that push SMS POST here. The flow: verify the HMAC
//! signature (401 on mismatch), parse, dedup on the derived idempotency
//! key, and enqueue a `webhook-processing` job; ingestion itself happens
//! on the worker so a slow database never blocks the provider's
//! delivery pipeline.

use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use http::{HeaderMap, StatusCode};
use numio_api_core::error::{ApiError, ErrorKind};
use numio_core::models::WebhookEvent;
use numio_core::traits::PublishOpts;
use numio_core::webhook;
use serde_json::json;
use tracing::{debug, warn};

use crate::context::AppContext;

pub async fn inbound(
    State(ctx): State<Arc<AppContext>>,
    Path(provider_slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let adapter = ctx.registry.get(&provider_slug).ok_or_else(|| {
        ApiError::not_found(format!("Unknown provider {provider_slug}"))
    })?;

    let source_ip = forwarded_ip(&headers);
    let verdict = adapter.verify_webhook(&body, &headers, source_ip);
    if !verdict.valid {
        warn!(
            "Webhook signature rejected for {provider_slug}: {:?}",
            verdict.error,
        );
        return Err(ApiError::new(
            ErrorKind::AuthInvalid,
            "Webhook signature verification failed",
        ));
    }

    let payload = adapter.parse_webhook(&body).map_err(ApiError::from)?;

    let ts = payload
        .ts
        .unwrap_or(common::time::TimestampMs::now().as_i64() / 1000);
    let key = webhook::idempotency_key(
        &provider_slug,
        &payload.provider_activation_id,
        ts,
    );

    let fresh = ctx
        .webhook_store
        .record(WebhookEvent {
            idempotency_key: key,
            provider_slug: provider_slug.clone(),
            payload: serde_json::from_slice(&body)
                .unwrap_or(serde_json::Value::Null),
            received_at: common::time::TimestampMs::now(),
        })
        .await?;
    if !fresh {
        // Redelivery: already recorded and queued.
        debug!("Duplicate webhook from {provider_slug}; acking");
        return Ok(StatusCode::NO_CONTENT);
    }

    ctx.queue
        .publish(
            numio_core::queue::WEBHOOK_PROCESSING,
            json!({
                "provider_slug": provider_slug,
                "provider_activation_id": payload.provider_activation_id,
                "status": payload.status,
                "messages": payload
                    .messages
                    .iter()
                    .map(|m| json!({
                        "id": m.id,
                        "sender": m.sender,
                        "text": m.text,
                        "received_at":
                            m.received_at.map(|t| t.as_i64()),
                    }))
                    .collect::<Vec<_>>(),
            }),
            PublishOpts::default(),
        )
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Best-effort client address: the first hop of `x-forwarded-for`, then
/// `x-real-ip`, then loopback (direct connections behind our own LB).
fn forwarded_ip(headers: &HeaderMap) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| {
            headers.get("x-real-ip").and_then(|v| v.to_str().ok())
        })
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}
