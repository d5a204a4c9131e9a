//! The HTTP API server: routes, middleware, and the handler modules.
//!
//! Handlers translate domain results into wire DTOs and domain errors
//! into the error envelope; no business logic lives here.

use std::sync::Arc;

use axum::Router;
use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use http::HeaderValue;
use http::request::Parts;
use numio_api::auth::{self, TokenAuthority};
use numio_api::trace::{CORRELATION_ID_HEADER, TRACE_ID_HEADER, TraceId};
use numio_api_core::error::{ApiError, ErrorKind};

use crate::context::AppContext;

pub mod numbers;
pub mod search;
pub mod wallet;
pub mod webhooks;

/// Per-client request budget: calls per minute.
const RATE_LIMIT_PER_MIN: u32 = 120;

/// Builds the public API router.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Wallet.
        .route("/wallet/balance", get(wallet::balance))
        .route("/wallet/topup", post(wallet::topup))
        .route("/wallet/transactions", get(wallet::transactions))
        // Search.
        .route("/search/services", get(search::services))
        .route("/search/countries", get(search::countries))
        .route("/search/providers", get(search::providers))
        // Numbers.
        .route("/numbers/purchase", post(numbers::purchase))
        .route("/numbers/my", get(numbers::my_numbers))
        .route("/numbers/{id}", get(numbers::detail))
        .route("/numbers/{id}/cancel", post(numbers::cancel))
        .route("/numbers/{id}/complete", post(numbers::complete))
        .route("/sms/{number_id}", get(numbers::sms_for_number))
        // Inbound provider webhooks (signature-authed, no bearer).
        .route("/webhooks/{provider_slug}", post(webhooks::inbound))
        // Operational.
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            rate_limit_layer,
        ))
        .layer(middleware::from_fn(csrf_layer))
        .layer(middleware::from_fn(correlation_layer))
        .with_state(ctx)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Prometheus exposition.
async fn metrics_text(
    State(ctx): State<Arc<AppContext>>,
) -> Result<String, ApiError> {
    match &ctx.metrics {
        Some(handle) => Ok(handle.render()),
        None => Err(ApiError::new(
            ErrorKind::SystemUnknown,
            "Metrics recorder not installed",
        )),
    }
}

// --- Middleware --- //

/// Echo (or mint) a correlation id on every response so support can tie
/// a user report to the logs.
async fn correlation_layer(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(TraceId::from_header_value)
        .unwrap_or_else(TraceId::generate);

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(CORRELATION_ID_HEADER, trace_id.to_header_value());
    response
}

/// CSRF double-submit on every mutating request.
async fn csrf_layer(request: Request, next: Next) -> Response {
    let mutating = matches!(
        request.method().as_str(),
        "POST" | "PUT" | "PATCH" | "DELETE",
    );
    // Provider webhooks are signature-authed machine traffic; the
    // browser token dance doesn't apply.
    let exempt = request.uri().path().starts_with("/webhooks/");

    if mutating && !exempt {
        if let Err(e) = auth::verify_double_submit(request.headers()) {
            return e.into_response();
        }
    }
    next.run(request).await
}

/// Sliding-window rate limit per caller, with the standard headers.
async fn rate_limit_layer(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    let key = rate_key(&request);
    let decision = match ctx
        .rate
        .check(
            &key,
            RATE_LIMIT_PER_MIN,
            std::time::Duration::from_secs(60),
        )
        .await
    {
        Ok(decision) => decision,
        // A broken limiter store must not take the API down.
        Err(e) => {
            tracing::warn!("Rate limiter unavailable: {e}");
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        let retry_secs = decision
            .retry_after
            .map(|d| d.as_secs().max(1))
            .unwrap_or(60);
        let mut response = ApiError::new(
            ErrorKind::AuthRatelimited,
            "Too many requests",
        )
        .into_response();
        let headers = response.headers_mut();
        headers.insert(
            "Retry-After",
            HeaderValue::from_str(&retry_secs.to_string()).unwrap(),
        );
        headers.insert(
            "X-RateLimit-Limit",
            HeaderValue::from_str(&RATE_LIMIT_PER_MIN.to_string())
                .unwrap(),
        );
        headers.insert(
            "X-RateLimit-Remaining",
            HeaderValue::from_static("0"),
        );
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "X-RateLimit-Limit",
        HeaderValue::from_str(&RATE_LIMIT_PER_MIN.to_string()).unwrap(),
    );
    headers.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from_str(&decision.remaining.to_string()).unwrap(),
    );
    response
}

/// Rate-limit key: the bearer token when present (per user), otherwise
/// the forwarded client address.
fn rate_key(request: &Request) -> String {
    if let Ok(token) = auth::parse_bearer(request.headers()) {
        // Hash-free: tokens are opaque and high-entropy already.
        return format!("rate:api:tok:{token}");
    }
    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_owned();
    format!("rate:api:ip:{ip}")
}

// --- Auth extractor --- //

/// The authenticated caller, extracted from the bearer JWT.
pub struct AuthedUser(pub common::id::UserId);

impl FromRequestParts<Arc<AppContext>> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &Arc<AppContext>,
    ) -> Result<Self, Self::Rejection> {
        let user_id =
            verify_bearer(&ctx.token_authority, &parts.headers)?;
        Ok(Self(user_id))
    }
}

fn verify_bearer(
    authority: &TokenAuthority,
    headers: &http::HeaderMap,
) -> Result<common::id::UserId, ApiError> {
    let token = auth::parse_bearer(headers)?;
    let claims =
        authority.verify(token, common::time::TimestampMs::now())?;
    Ok(claims.sub)
}
