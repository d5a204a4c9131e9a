//! The serializable API error envelope and the stable error taxonomy
//! returned by all numio services.

// Deny suspicious match names that are probably non-existent variants.
#![deny(non_snake_case)]

use std::fmt;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Associated constants can't be imported.
pub const CLIENT_400_BAD_REQUEST: StatusCode = StatusCode::BAD_REQUEST;
pub const CLIENT_401_UNAUTHORIZED: StatusCode = StatusCode::UNAUTHORIZED;
pub const CLIENT_402_PAYMENT_REQUIRED: StatusCode =
    StatusCode::PAYMENT_REQUIRED;
pub const CLIENT_403_FORBIDDEN: StatusCode = StatusCode::FORBIDDEN;
pub const CLIENT_404_NOT_FOUND: StatusCode = StatusCode::NOT_FOUND;
pub const CLIENT_409_CONFLICT: StatusCode = StatusCode::CONFLICT;
pub const CLIENT_429_TOO_MANY_REQUESTS: StatusCode =
    StatusCode::TOO_MANY_REQUESTS;
pub const SERVER_500_INTERNAL_SERVER_ERROR: StatusCode =
    StatusCode::INTERNAL_SERVER_ERROR;
pub const SERVER_502_BAD_GATEWAY: StatusCode = StatusCode::BAD_GATEWAY;

/// The JSON-serialized representation of every error sent across the wire.
/// It is the only error struct clients ever see; everything else converts
/// to / from it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// The `{code, message}` pair inside an [`ErrorResponse`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// A stable machine-readable code, e.g. `OUT_OF_STOCK`.
    pub code: String,
    /// A safe human-readable message. Never contains internal details.
    pub message: String,
}

/// A trait to get the HTTP status code for a given error.
pub trait ToHttpStatus {
    fn to_http_status(&self) -> StatusCode;
}

/// This macro takes the error kind enum declaration and generates the
/// conversion plumbing: `KINDS`, `to_code` / `from_code`, doc-string
/// messages, and the std trait impls.
///
/// - Codes are stable strings; never rename one.
/// - Doc strings on the variants become [`ErrorKind::to_msg`] and the
///   [`fmt::Display`] impl.
/// - Unrecognized codes decode to [`ErrorKind::SystemUnknown`] so that an
///   old client can always represent an error from a newer server.
macro_rules! api_error_kind {
    {
        $(#[$enum_meta:meta])*
        pub enum $error_kind_name:ident {
            $(
                // use the doc string for the error message
                $( #[doc = $item_msg:literal] )*
                $item_name:ident = $item_code:literal
            ),* $(,)?
        }
    } => {
        $(#[$enum_meta])*
        pub enum $error_kind_name {
            $(
                $( #[doc = $item_msg] )*
                $item_name
            ),*
        }

        impl $error_kind_name {
            /// An array of all known error kind variants.
            pub const KINDS: &'static [Self] = &[
                $( Self::$item_name, )*
            ];

            /// Returns the variant name of this error kind.
            pub fn to_name(self) -> &'static str {
                match self {
                    $( Self::$item_name => stringify!($item_name), )*
                }
            }

            /// Returns the human-readable message for this error kind,
            /// i.e. the variant's doc string.
            pub fn to_msg(self) -> &'static str {
                let kind_msg = match self {
                    $( Self::$item_name => concat!($( $item_msg, )*), )*
                };
                kind_msg.trim_start()
            }

            /// Returns the stable wire code for this error kind.
            pub fn to_code(self) -> &'static str {
                match self {
                    $( Self::$item_name => $item_code, )*
                }
            }

            /// Returns the error kind for a raw wire code. Infallible:
            /// unrecognized codes map to [`Self::SystemUnknown`].
            pub fn from_code(code: &str) -> Self {
                // this deny attr makes duplicate codes a compile error : )
                #[deny(unreachable_patterns)]
                match code {
                    $( $item_code => Self::$item_name, )*
                    _ => Self::SystemUnknown,
                }
            }
        }

        impl Default for $error_kind_name {
            fn default() -> Self {
                Self::SystemUnknown
            }
        }

        impl fmt::Display for $error_kind_name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // No ':' because the ApiError Display impl adds it.
                write!(f, "{}", (*self).to_msg())
            }
        }
    }
}

api_error_kind! {
    /// Every error kind a numio service can return. Codes are stable.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub enum ErrorKind {
        // --- Auth --- //

        /// Authentication token is invalid
        AuthInvalid = "AUTH_INVALID",
        /// Authentication token has expired
        AuthExpired = "AUTH_EXPIRED",
        /// Not authorized to access this resource
        AuthForbidden = "AUTH_FORBIDDEN",
        /// Too many authentication attempts
        AuthRatelimited = "AUTH_RATELIMITED",

        // --- Validation --- //

        /// Request failed validation
        ValidationInvalid = "VALIDATION_INVALID",
        /// Required field is missing
        ValidationMissing = "VALIDATION_MISSING",
        /// Resource not found
        NotFound = "NOT_FOUND",
        /// Idempotency key was reused with a different request
        IdempotencyMismatch = "IDEMPOTENCY_MISMATCH",

        // --- Upstream providers --- //

        /// Provider is unavailable
        ProviderUnavailable = "PROVIDER_UNAVAILABLE",
        /// Provider request timed out
        ProviderTimeout = "PROVIDER_TIMEOUT",
        /// Provider returned a malformed response
        ProviderBadResponse = "PROVIDER_BAD_RESPONSE",
        /// Provider rate limit exceeded
        ProviderRatelimited = "PROVIDER_RATELIMITED",
        /// No numbers in stock for this selection
        OutOfStock = "OUT_OF_STOCK",
        /// Unknown or unsupported service
        BadService = "BAD_SERVICE",
        /// Provider rejected our API credentials
        BadKey = "BAD_KEY",

        // --- Wallet --- //

        /// Insufficient wallet balance
        InsufficientFunds = "INSUFFICIENT_FUNDS",
        /// Wallet transaction failed
        WalletTxFailed = "WALLET_TX_FAILED",
        /// Payment failed
        PaymentFailed = "PAYMENT_FAILED",

        // --- Activations --- //

        /// SMS activation failed
        SmsActivationFailed = "SMS_ACTIVATION_FAILED",
        /// Number is no longer available
        SmsNumberUnavailable = "SMS_NUMBER_UNAVAILABLE",
        /// Activation is not refundable in its current state
        NotRefundable = "NOT_REFUNDABLE",

        // --- System --- //

        /// Database error
        SystemDb = "SYSTEM_DB",
        /// Cache error
        SystemCache = "SYSTEM_CACHE",
        /// Queue error
        SystemQueue = "SYSTEM_QUEUE",
        /// Internal error
        SystemUnknown = "SYSTEM_UNKNOWN",
    }
}

impl ToHttpStatus for ErrorKind {
    fn to_http_status(&self) -> StatusCode {
        use ErrorKind::*;
        match self {
            AuthInvalid => CLIENT_401_UNAUTHORIZED,
            AuthExpired => CLIENT_401_UNAUTHORIZED,
            AuthForbidden => CLIENT_403_FORBIDDEN,
            AuthRatelimited => CLIENT_429_TOO_MANY_REQUESTS,

            ValidationInvalid => CLIENT_400_BAD_REQUEST,
            ValidationMissing => CLIENT_400_BAD_REQUEST,
            NotFound => CLIENT_404_NOT_FOUND,
            IdempotencyMismatch => CLIENT_409_CONFLICT,

            ProviderUnavailable => SERVER_502_BAD_GATEWAY,
            ProviderTimeout => SERVER_502_BAD_GATEWAY,
            ProviderBadResponse => SERVER_502_BAD_GATEWAY,
            ProviderRatelimited => CLIENT_429_TOO_MANY_REQUESTS,
            OutOfStock => CLIENT_409_CONFLICT,
            BadService => CLIENT_400_BAD_REQUEST,
            // Our upstream credentials, not the caller's fault.
            BadKey => SERVER_502_BAD_GATEWAY,

            InsufficientFunds => CLIENT_402_PAYMENT_REQUIRED,
            WalletTxFailed => SERVER_500_INTERNAL_SERVER_ERROR,
            PaymentFailed => CLIENT_402_PAYMENT_REQUIRED,

            SmsActivationFailed => SERVER_502_BAD_GATEWAY,
            SmsNumberUnavailable => CLIENT_404_NOT_FOUND,
            NotRefundable => CLIENT_409_CONFLICT,

            SystemDb => SERVER_500_INTERNAL_SERVER_ERROR,
            SystemCache => SERVER_500_INTERNAL_SERVER_ERROR,
            SystemQueue => SERVER_500_INTERNAL_SERVER_ERROR,
            SystemUnknown => SERVER_500_INTERNAL_SERVER_ERROR,
        }
    }
}

/// The operational error type returned by every numio API surface.
///
/// Carries an [`ErrorKind`] plus a safe contextual message. Non-operational
/// errors (programming bugs) should be logged with full detail and then
/// surfaced as [`ErrorKind::SystemUnknown`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Error)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    /// Shorthand for a [`ErrorKind::ValidationInvalid`] error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationInvalid, msg)
    }

    /// Shorthand for a [`ErrorKind::NotFound`] error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    /// Log this error and get its HTTP [`StatusCode`].
    pub fn log_and_status(&self) -> StatusCode {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!("{self}");
        } else if status.is_client_error() {
            tracing::warn!("{self}");
        } else {
            // All other statuses are unexpected. Log these at error.
            tracing::error!("Unexpected status {status} for error: {self}");
        }
        status
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind_msg = self.kind.to_msg();
        if self.msg.is_empty() {
            write!(f, "{kind_msg}")
        } else {
            let msg = &self.msg;
            write!(f, "{kind_msg}: {msg}")
        }
    }
}

impl ToHttpStatus for ApiError {
    fn to_http_status(&self) -> StatusCode {
        self.kind.to_http_status()
    }
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::new(),
        }
    }
}

impl From<ErrorResponse> for ApiError {
    fn from(err_resp: ErrorResponse) -> Self {
        let ErrorBody { code, message } = err_resp.error;
        Self {
            kind: ErrorKind::from_code(&code),
            msg: message,
        }
    }
}

impl From<ApiError> for ErrorResponse {
    fn from(api_error: ApiError) -> Self {
        let message = api_error.to_string();
        Self {
            error: ErrorBody {
                code: api_error.kind.to_code().to_owned(),
                message,
            },
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> http::Response<axum::body::Body> {
        // Server-side errors are logged here, since the error has been
        // converted to an `http::Response` by the time axum's layers can
        // see it.
        let status = self.log_and_status();
        let error_response = ErrorResponse::from(self);
        crate::axum_helpers::build_json_response(status, &error_response)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_roundtrip_for_all_kinds() {
        for kind in ErrorKind::KINDS {
            assert_eq!(ErrorKind::from_code(kind.to_code()), *kind);
        }
    }

    #[test]
    fn codes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for kind in ErrorKind::KINDS {
            assert!(seen.insert(kind.to_code()), "dup: {kind:?}");
        }
    }

    #[test]
    fn unknown_code_falls_back() {
        assert_eq!(
            ErrorKind::from_code("DEFINITELY_NOT_A_CODE"),
            ErrorKind::SystemUnknown,
        );
    }

    #[test]
    fn envelope_wire_shape() {
        let err = ApiError::new(ErrorKind::OutOfStock, "us/telegram");
        let resp = ErrorResponse::from(err);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["code"], "OUT_OF_STOCK");
        assert_eq!(
            json["error"]["message"],
            "No numbers in stock for this selection: us/telegram",
        );
    }

    #[test]
    fn statuses_stay_in_documented_range() {
        for kind in ErrorKind::KINDS {
            let status = kind.to_http_status().as_u16();
            assert!(
                matches!(
                    status,
                    400 | 401 | 402 | 403 | 404 | 409 | 429 | 500 | 502
                ),
                "{kind:?} => {status}",
            );
        }
    }
}
