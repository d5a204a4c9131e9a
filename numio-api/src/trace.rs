//! Request trace ids.
//!
//! Every client request carries an `x-numio-trace-id` header; servers echo
//! it back as `x-correlation-id` so support can match a user report to the
//! server logs.

use std::fmt::{self, Display};

use http::HeaderValue;
use http::header::HeaderName;
use uuid::Uuid;

pub const TRACE_ID_HEADER: HeaderName =
    HeaderName::from_static("x-numio-trace-id");
pub const CORRELATION_ID_HEADER: HeaderName =
    HeaderName::from_static("x-correlation-id");

/// Log target for request/response events.
pub const TARGET: &str = "http";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceId(Uuid);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_header_value(value: &HeaderValue) -> Option<Self> {
        let s = value.to_str().ok()?;
        Uuid::parse_str(s).ok().map(Self)
    }

    pub fn to_header_value(self) -> HeaderValue {
        HeaderValue::from_str(&self.0.to_string())
            .expect("UUIDs are always valid header values")
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_value_roundtrip() {
        let trace_id = TraceId::generate();
        let value = trace_id.to_header_value();
        assert_eq!(TraceId::from_header_value(&value), Some(trace_id));
    }
}
