//! Axum server scaffolding.
//!
//! - [`spawn_server_task`] serves a [`Router`] with a fallback handler,
//!   backpressure, load shedding, concurrency limits, server-side timeouts
//!   and graceful shutdown.
//! - [`NxJson`] / [`NxQuery`] extractors reject malformed input with the
//!   standard error envelope instead of axum's plaintext rejections.
//!
//! [`Router`]: axum::Router

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::response::IntoResponse;
use http::StatusCode;
use http::request::Parts;
use numio_api_core::axum_helpers::build_json_response;
use numio_api_core::error::{ApiError, ErrorKind};
use numio_tokio::notify_once::NotifyOnce;
use numio_tokio::task::NxTask;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tower::ServiceBuilder;
use tracing::info;

/// The grace period during which new connections are refused and existing
/// connections get to finish before the server future resolves.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(3);
/// The maximum time we'll wait for a server to complete shutdown.
pub const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
common::const_assert!(
    SHUTDOWN_GRACE_PERIOD.as_secs() < SERVER_SHUTDOWN_TIMEOUT.as_secs()
);

/// A configuration object for the tower middleware applied to a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerConfig {
    /// Maximum request body size in bytes ([`None`] to disable).
    pub body_limit: Option<usize>,
    /// Whether to shed load when the service has reached capacity.
    pub load_shed: bool,
    /// Request buffer size ([`None`] to disable).
    pub buffer_size: Option<usize>,
    /// Maximum number of in-flight requests ([`None`] to disable).
    pub concurrency: Option<usize>,
    /// Server-side handling timeout ([`None`] to disable).
    pub handling_timeout: Option<Duration>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            body_limit: Some(16384),
            load_shed: true,
            buffer_size: Some(4096),
            concurrency: Some(4096),
            handling_timeout: Some(Duration::from_secs(15)),
        }
    }
}

/// Binds a TCP listener on `addr` and spawns a task serving `router` with
/// the standard middleware and a graceful shutdown wired to `shutdown`.
/// Returns the spawned task and the actual bound address.
pub async fn spawn_server_task(
    addr: SocketAddr,
    router: Router,
    layer_config: LayerConfig,
    server_name: &'static str,
    shutdown: NotifyOnce,
) -> anyhow::Result<(NxTask<()>, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {server_name} on {addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("Could not get local address")?;

    let router = apply_layers(router, layer_config);

    let task = NxTask::spawn(format!("{server_name} server"), async move {
        info!("{server_name} listening on {local_addr}");
        let serve_fut = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.recv_owned().await;
                // Give in-flight connections a moment before the serve
                // future resolves and the process tears down clients.
                tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
            });
        if let Err(e) = serve_fut.await {
            tracing::error!("{server_name} server errored: {e:#}");
        }
    });

    Ok((task, local_addr))
}

/// Applies the standard middleware stack to a router:
/// fallback 404, body limit, load shed, buffer, concurrency limit, timeout.
pub fn apply_layers(router: Router, config: LayerConfig) -> Router {
    let LayerConfig {
        body_limit,
        load_shed,
        buffer_size,
        concurrency,
        handling_timeout,
    } = config;

    let mut router = router.fallback(fallback_404);

    if let Some(limit) = body_limit {
        router = router.layer(axum::extract::DefaultBodyLimit::max(limit));
    }

    // tower's load-shed / timeout services are fallible; HandleErrorLayer
    // converts their errors back into responses. The route's own (infallible)
    // error is mapped to a boxed error first so both arms of the `Either`
    // produced by each `option_layer` share the same error type.
    let middleware = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_middleware_error))
        .option_layer(load_shed.then(tower::load_shed::LoadShedLayer::new))
        .option_layer(buffer_size.map(tower::buffer::BufferLayer::new))
        .option_layer(
            concurrency.map(tower::limit::ConcurrencyLimitLayer::new),
        )
        .option_layer(handling_timeout.map(tower::timeout::TimeoutLayer::new))
        .map_err(Into::<tower::BoxError>::into);

    router.layer(middleware)
}

async fn fallback_404() -> ApiError {
    ApiError::new(ErrorKind::NotFound, "Unknown path")
}

async fn handle_middleware_error(error: tower::BoxError) -> ApiError {
    if error.is::<tower::load_shed::error::Overloaded>() {
        ApiError::new(ErrorKind::AuthRatelimited, "Server is at capacity")
    } else if error.is::<tower::timeout::error::Elapsed>() {
        ApiError::new(ErrorKind::ProviderTimeout, "Request handling timed out")
    } else {
        ApiError::new(
            ErrorKind::SystemUnknown,
            format!("Middleware error: {error:#}"),
        )
    }
}

// --- Extractors --- //

/// Like [`axum::Json`], but rejections are numio error envelopes. Also an
/// [`IntoResponse`] for success bodies.
#[derive(Debug)]
pub struct NxJson<T>(pub T);

impl<T, S> FromRequest<S> for NxJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(
        req: Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

impl<T: Serialize> IntoResponse for NxJson<T> {
    fn into_response(self) -> axum::response::Response {
        build_json_response(StatusCode::OK, &self.0)
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    let kind = match &rejection {
        JsonRejection::MissingJsonContentType(_) =>
            ErrorKind::ValidationMissing,
        _ => ErrorKind::ValidationInvalid,
    };
    ApiError::new(kind, format!("Bad request body: {rejection}"))
}

/// Like [`axum::extract::Query`], but rejections are numio error envelopes.
#[derive(Debug)]
pub struct NxQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for NxQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        match axum::extract::Query::<T>::from_request_parts(parts, state)
            .await
        {
            Ok(axum::extract::Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(query_rejection(rejection)),
        }
    }
}

fn query_rejection(rejection: QueryRejection) -> ApiError {
    ApiError::new(
        ErrorKind::ValidationInvalid,
        format!("Bad query string: {rejection}"),
    )
}

#[cfg(test)]
mod test {
    use axum::routing::get;

    use super::*;

    async fn ping() -> &'static str {
        "pong"
    }

    #[tokio::test]
    async fn server_binds_and_shuts_down() {
        let router = Router::new().route("/ping", get(ping));
        let shutdown = NotifyOnce::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));

        let (task, local_addr) = spawn_server_task(
            addr,
            router,
            LayerConfig::default(),
            "test",
            shutdown.clone(),
        )
        .await
        .unwrap();
        assert_ne!(local_addr.port(), 0);

        shutdown.send();
        tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, task)
            .await
            .expect("Server should shut down promptly")
            .expect("Server task shouldn't panic");
    }
}
