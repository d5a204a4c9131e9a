use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::error::{ErrorBody, ErrorKind, ErrorResponse, ToHttpStatus};

/// Constructs a JSON [`http::Response<axum::body::Body>`] from the data and
/// status code. If serialization fails for some reason (very unlikely), log
/// and return an [`ErrorResponse`] with [`ErrorKind::SystemUnknown`].
pub fn build_json_response(
    status: StatusCode,
    data: &impl Serialize,
) -> http::Response<axum::body::Body> {
    /// Most of the logic goes in this monomorphic fn to prevent binary
    /// bloat.
    fn inner(
        status: StatusCode,
        try_json_bytes: Result<Vec<u8>, serde_json::Error>,
    ) -> http::Response<axum::body::Body> {
        let (status, json_bytes) = match try_json_bytes {
            Ok(jb) => (status, jb),
            Err(e) => {
                let msg = format!("Couldn't serialize response: {e:#}");
                error!(target: "http", "{msg}");
                let kind = ErrorKind::SystemUnknown;
                let err_resp = ErrorResponse {
                    error: ErrorBody {
                        code: kind.to_code().to_owned(),
                        message: msg,
                    },
                };
                let json_bytes = serde_json::to_vec(&err_resp)
                    .expect("Serializing ErrorResponse really shouldn't fail");
                (kind.to_http_status(), json_bytes)
            }
        };

        let bytes = bytes::Bytes::from(json_bytes);
        let http_body = http_body_util::Full::new(bytes);
        let axum_body = axum::body::Body::new(http_body);

        http::Response::builder()
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .status(status)
            .body(axum_body)
            .expect("All operations here should be infallible")
    }

    inner(status, serde_json::to_vec(data))
}
