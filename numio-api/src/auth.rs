//! Authentication primitives for the API server.
//!
//! - Bearer JWTs (HS256). The login service (an external collaborator)
//!   mints tokens; this module verifies them and extracts the user id.
//! - CSRF double-submit: mutating requests must carry the same token in
//!   the `csrf_token` cookie and the `x-csrf-token` header.
//!
//! All comparisons of secret material are constant-time via `ring`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::id::UserId;
use common::rng::Crng;
use common::time::TimestampMs;
use http::HeaderMap;
use http::header::{AUTHORIZATION, COOKIE};
use numio_api_core::error::{ApiError, ErrorKind};
use ring::hmac;
use serde::{Deserialize, Serialize};

/// The header carrying the CSRF double-submit token.
pub const CSRF_HEADER: &str = "x-csrf-token";
/// The cookie carrying the CSRF double-submit token.
pub const CSRF_COOKIE: &str = "csrf_token";

const JWT_HEADER_B64: &str = // {"alg":"HS256","typ":"JWT"}
    "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9";

/// The claims numio issues and verifies. Anything else in the token is
/// ignored.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// The authenticated user.
    pub sub: UserId,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Signs and verifies HS256 bearer tokens with the shared `JWT_SECRET`.
#[derive(Clone)]
pub struct TokenAuthority {
    key: hmac::Key,
}

impl TokenAuthority {
    pub fn new(jwt_secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, jwt_secret),
        }
    }

    /// Mints a token. Only used by tests and tooling; production tokens
    /// come from the login collaborator, which shares the secret.
    pub fn sign(&self, claims: &Claims) -> String {
        let payload = serde_json::to_vec(claims)
            .expect("Claims serialization can't fail");
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let message = format!("{JWT_HEADER_B64}.{payload_b64}");
        let tag = hmac::sign(&self.key, message.as_bytes());
        let tag_b64 = URL_SAFE_NO_PAD.encode(tag.as_ref());
        format!("{message}.{tag_b64}")
    }

    /// Verifies a bearer token and returns its claims.
    ///
    /// Errors: [`ErrorKind::AuthInvalid`] on any structural or signature
    /// problem, [`ErrorKind::AuthExpired`] when `exp` has passed.
    pub fn verify(
        &self,
        token: &str,
        now: TimestampMs,
    ) -> Result<Claims, ApiError> {
        let invalid =
            |msg: &str| ApiError::new(ErrorKind::AuthInvalid, msg.to_owned());

        let mut parts = token.split('.');
        let (header_b64, payload_b64, tag_b64) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(h), Some(p), Some(t), None) => (h, p, t),
            _ => return Err(invalid("Token is not three dot-joined parts")),
        };

        // Only our own fixed header is acceptable; in particular this
        // rejects `alg: none` and algorithm-confusion tokens outright.
        if header_b64 != JWT_HEADER_B64 {
            let header_bytes = URL_SAFE_NO_PAD
                .decode(header_b64)
                .map_err(|_| invalid("Unparseable token header"))?;
            #[derive(Deserialize)]
            struct Header {
                alg: String,
            }
            let header: Header = serde_json::from_slice(&header_bytes)
                .map_err(|_| invalid("Unparseable token header"))?;
            if header.alg != "HS256" {
                return Err(invalid("Unsupported token algorithm"));
            }
        }

        let message_len = header_b64.len() + 1 + payload_b64.len();
        let message = &token.as_bytes()[..message_len];
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| invalid("Unparseable token signature"))?;
        hmac::verify(&self.key, message, &tag)
            .map_err(|_| invalid("Bad token signature"))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| invalid("Unparseable token payload"))?;
        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|_| invalid("Unparseable token claims"))?;

        let now_secs = now.as_i64() / 1000;
        if claims.exp <= now_secs {
            return Err(ApiError::new(
                ErrorKind::AuthExpired,
                "Token has expired",
            ));
        }

        Ok(claims)
    }
}

/// Extracts the bearer token from an `Authorization` header.
pub fn parse_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| {
            ApiError::new(ErrorKind::AuthInvalid, "Missing Authorization")
        })?
        .to_str()
        .map_err(|_| {
            ApiError::new(ErrorKind::AuthInvalid, "Bad Authorization header")
        })?;
    value.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::new(ErrorKind::AuthInvalid, "Expected a Bearer token")
    })
}

/// Mints a fresh CSRF token: 32 random bytes, hex-encoded.
pub fn mint_csrf_token(rng: &mut impl Crng) -> String {
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Verifies the CSRF double-submit pair on a mutating request: the
/// `csrf_token` cookie and the `x-csrf-token` header must both be present
/// and equal. Comparison is constant-time.
pub fn verify_double_submit(headers: &HeaderMap) -> Result<(), ApiError> {
    let forbidden = |msg: &str| {
        ApiError::new(ErrorKind::AuthForbidden, msg.to_owned())
    };

    let header_token = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| forbidden("Missing CSRF header"))?;

    let cookie_token = cookie_value(headers, CSRF_COOKIE)
        .ok_or_else(|| forbidden("Missing CSRF cookie"))?;

    // A short token means a broken client, not an attack, but reject it
    // all the same.
    if header_token.len() < 32 {
        return Err(forbidden("CSRF token too short"));
    }

    ring::constant_time::verify_slices_are_equal(
        header_token.as_bytes(),
        cookie_token.as_bytes(),
    )
    .map_err(|_| forbidden("CSRF token mismatch"))
}

/// Finds a cookie value in the `Cookie` header(s).
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get_all(COOKIE).iter().find_map(|value| {
        let value = value.to_str().ok()?;
        value.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then_some(v)
        })
    })
}

#[cfg(test)]
mod test {
    use common::rng::SysRng;
    use http::HeaderValue;

    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new(b"test-jwt-secret-test-jwt-secret!")
    }

    fn claims(exp: i64) -> Claims {
        Claims {
            sub: UserId(42),
            iat: 1_700_000_000,
            exp,
        }
    }

    #[test]
    fn sign_verify_roundtrip() {
        let authority = authority();
        let now = TimestampMs::try_from_i64(1_700_000_500_000).unwrap();
        let token = authority.sign(&claims(1_700_001_000));
        let verified = authority.verify(&token, now).unwrap();
        assert_eq!(verified.sub, UserId(42));
    }

    #[test]
    fn expired_token_rejected() {
        let authority = authority();
        let now = TimestampMs::try_from_i64(1_700_001_000_001).unwrap();
        let token = authority.sign(&claims(1_700_001_000));
        let err = authority.verify(&token, now).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
    }

    #[test]
    fn tampered_token_rejected() {
        let authority = authority();
        let now = TimestampMs::try_from_i64(1_700_000_500_000).unwrap();
        let token = authority.sign(&claims(1_700_001_000));

        // Flip the user id in the payload.
        let mut parts: Vec<&str> = token.split('.').collect();
        let evil_claims = Claims {
            sub: UserId(1337),
            ..claims(1_700_001_000)
        };
        let evil_payload = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&evil_claims).unwrap());
        parts[1] = &evil_payload;
        let tampered = parts.join(".");

        let err = authority.verify(&tampered, now).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthInvalid);
    }

    #[test]
    fn wrong_key_rejected() {
        let other = TokenAuthority::new(b"some-other-secret-entirely-here!");
        let now = TimestampMs::try_from_i64(1_700_000_500_000).unwrap();
        let token = other.sign(&claims(1_700_001_000));
        assert!(authority().verify(&token, now).is_err());
    }

    #[test]
    fn csrf_double_submit() {
        let mut rng = SysRng::new();
        let token = mint_csrf_token(&mut rng);

        let mut headers = HeaderMap::new();
        headers.insert(
            CSRF_HEADER,
            HeaderValue::from_str(&token).unwrap(),
        );
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("a=b; csrf_token={token}"))
                .unwrap(),
        );
        verify_double_submit(&headers).unwrap();

        // Mismatched header fails.
        headers.insert(
            CSRF_HEADER,
            HeaderValue::from_str(&mint_csrf_token(&mut rng)).unwrap(),
        );
        let err = verify_double_submit(&headers).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthForbidden);
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert!(parse_bearer(&headers).is_err());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );
        assert_eq!(parse_bearer(&headers).unwrap(), "abc.def.ghi");
    }
}
