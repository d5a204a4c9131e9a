use std::borrow::Cow;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use numio_api_core::error::{ApiError, ErrorKind, ErrorResponse};
use reqwest::IntoUrl;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::trace::{self, TraceId};

/// Most internal and upstream calls should finish well within this.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// Avoid `Method::` prefix. Associated constants can't be imported.
pub const GET: Method = Method::GET;
pub const PUT: Method = Method::PUT;
pub const POST: Method = Method::POST;
pub const DELETE: Method = Method::DELETE;

/// A generic `RestClient` which conforms to numio's API conventions:
/// JSON bodies, the `{error: {code, message}}` error envelope, and a trace
/// id header on every request.
#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    /// The process this client is being called from, e.g. "broker-api".
    from: Cow<'static, str>,
    /// The process this client is calling, e.g. "search".
    to: &'static str,
}

impl RestClient {
    /// Builds a new [`RestClient`] with safe defaults.
    ///
    /// `from` and `to` succinctly name the caller and callee so requests
    /// from this client can be told apart from other clients in the same
    /// process. `from` is also propagated via the user agent header.
    pub fn new(from: impl Into<Cow<'static, str>>, to: &'static str) -> Self {
        fn inner(from: Cow<'static, str>, to: &'static str) -> RestClient {
            let client = RestClient::client_builder(&from)
                .build()
                .expect("Failed to build reqwest Client");
            RestClient { client, from, to }
        }
        inner(from.into(), to)
    }

    /// A [`reqwest::ClientBuilder`] with numio defaults set.
    pub fn client_builder(from: impl AsRef<str>) -> reqwest::ClientBuilder {
        fn inner(from: &str) -> reqwest::ClientBuilder {
            reqwest::Client::builder()
                .user_agent(from)
                .timeout(API_REQUEST_TIMEOUT)
        }
        inner(from.as_ref())
    }

    /// Construct a [`RestClient`] from an existing [`reqwest::Client`],
    /// e.g. one with a custom timeout.
    pub fn from_inner(
        client: reqwest::Client,
        from: impl Into<Cow<'static, str>>,
        to: &'static str,
    ) -> Self {
        Self {
            client,
            from: from.into(),
            to,
        }
    }

    // --- RequestBuilder helpers --- //

    #[inline]
    pub fn get<U, T>(&self, url: U, data: &T) -> reqwest::RequestBuilder
    where
        U: IntoUrl,
        T: Serialize + ?Sized,
    {
        self.builder(GET, url).query(data)
    }

    #[inline]
    pub fn post<U, T>(&self, url: U, data: &T) -> reqwest::RequestBuilder
    where
        U: IntoUrl,
        T: Serialize + ?Sized,
    {
        self.builder(POST, url).json(data)
    }

    #[inline]
    pub fn put<U, T>(&self, url: U, data: &T) -> reqwest::RequestBuilder
    where
        U: IntoUrl,
        T: Serialize + ?Sized,
    {
        self.builder(PUT, url).json(data)
    }

    #[inline]
    pub fn delete<U>(&self, url: U) -> reqwest::RequestBuilder
    where
        U: IntoUrl,
    {
        self.builder(DELETE, url)
    }

    /// A clean slate [`reqwest::RequestBuilder`] for non-standard requests.
    pub fn builder(
        &self,
        method: Method,
        url: impl IntoUrl,
    ) -> reqwest::RequestBuilder {
        self.client.request(method, url)
    }

    // --- Request send/recv --- //

    /// Sends the built HTTP request and JSON-deserializes the response body.
    pub async fn send<T: DeserializeOwned>(
        &self,
        request_builder: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let bytes = self.send_no_deserialize(request_builder).await?;
        Self::json_deserialize(bytes)
    }

    /// Sends the HTTP request, but *doesn't* JSON-deserialize the response.
    pub async fn send_no_deserialize(
        &self,
        request_builder: reqwest::RequestBuilder,
    ) -> Result<Bytes, ApiError> {
        let request = request_builder.build().map_err(build_error)?;
        self.send_inner(request, TraceId::generate()).await
    }

    /// Sends the built HTTP request, retrying up to `retries` times with
    /// exponential backoff, then JSON-deserializes the response body.
    ///
    /// If an attempt yields an error kind in `stop_kinds`, we immediately
    /// stop retrying and return that error.
    pub async fn send_with_retries<T: DeserializeOwned>(
        &self,
        request_builder: reqwest::RequestBuilder,
        retries: usize,
        stop_kinds: &[ErrorKind],
    ) -> Result<T, ApiError> {
        let request = request_builder.build().map_err(build_error)?;
        let trace_id = TraceId::generate();

        let mut backoff_durations = common::backoff::get_backoff_iter();

        // Do the 'retries' first.
        for _ in 0..retries {
            // The request body is cheaply cloneable; `try_clone` only
            // returns `None` for streamed bodies, which we never use here.
            let request_clone = match request.try_clone() {
                Some(clone) => clone,
                None => break,
            };

            match self.send_inner(request_clone, trace_id).await {
                Ok(bytes) => return Self::json_deserialize(bytes),
                Err(err) if stop_kinds.contains(&err.kind) =>
                    return Err(err),
                Err(_) => (),
            }

            tokio::time::sleep(backoff_durations.next().unwrap()).await;
        }

        // Out of retries; the 'main' attempt gets the original request.
        let bytes = self.send_inner(request, trace_id).await?;
        Self::json_deserialize(bytes)
    }

    // `send_inner` intentionally uses zero generics in its signature to
    // minimize code bloat.
    async fn send_inner(
        &self,
        mut request: reqwest::Request,
        trace_id: TraceId,
    ) -> Result<Bytes, ApiError> {
        let start = tokio::time::Instant::now();
        let (from, to) = (&self.from, self.to);
        debug!(target: trace::TARGET, %from, %to, %trace_id, "New client request");

        match request
            .headers_mut()
            .try_insert(trace::TRACE_ID_HEADER, trace_id.to_header_value())
        {
            Ok(_) => (),
            Err(e) => warn!(target: trace::TARGET, "Header map full?: {e:#}"),
        }

        // Send the request, await the response headers.
        let resp = self.client.execute(request).await.map_err(|e| {
            let req_time_ms = start.elapsed().as_millis();
            warn!(
                target: trace::TARGET,
                %trace_id, %req_time_ms,
                "Done (error)(sending): {e:#}",
            );
            send_error(e)
        })?;

        let status = resp.status();
        if status.is_success() {
            let bytes = resp.bytes().await.map_err(|e| {
                warn!(
                    target: trace::TARGET,
                    %trace_id,
                    "Done (error)(receiving): {e:#}",
                );
                send_error(e)
            })?;
            let req_time_ms = start.elapsed().as_millis();
            debug!(target: trace::TARGET, %trace_id, %req_time_ms, "Done (success)");
            Ok(bytes)
        } else {
            // HTTP error => decode the numio error envelope.
            let error = resp
                .json::<ErrorResponse>()
                .await
                .map(ApiError::from)
                .unwrap_or_else(|e| {
                    ApiError::new(
                        ErrorKind::ProviderBadResponse,
                        format!("Non-envelope error response: {e:#}"),
                    )
                });
            let req_time_ms = start.elapsed().as_millis();
            warn!(
                target: trace::TARGET,
                %trace_id,
                %req_time_ms,
                status = %status.as_u16(),
                "Done (error)(response): {error}",
            );
            Err(error)
        }
    }

    /// JSON-deserializes the REST response bytes.
    fn json_deserialize<T: DeserializeOwned>(
        bytes: Bytes,
    ) -> Result<T, ApiError> {
        serde_json::from_slice::<T>(&bytes).map_err(|err| {
            let mut msg = format!("JSON deserialization failed: {err:#}");
            // In debug, append the response body to the error msg.
            if cfg!(any(debug_assertions, test)) {
                let resp_msg = String::from_utf8_lossy(&bytes);
                msg.push_str(&format!(": '{resp_msg}'"));
            }
            ApiError::new(ErrorKind::ProviderBadResponse, msg)
        })
    }
}

fn build_error(e: reqwest::Error) -> ApiError {
    ApiError::new(
        ErrorKind::SystemUnknown,
        format!("Error building HTTP request: {e:#}"),
    )
}

fn send_error(e: reqwest::Error) -> ApiError {
    let kind = if e.is_timeout() {
        ErrorKind::ProviderTimeout
    } else {
        ErrorKind::ProviderUnavailable
    };
    ApiError::new(kind, format!("{e:#}"))
}
