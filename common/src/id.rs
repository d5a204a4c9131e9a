//! Typed identifiers.
//!
//! Row ids are `i64` newtypes (Postgres `BIGSERIAL`). String-valued keys
//! carry their normalization invariant in the type: a [`CountryCode`] or
//! [`ServiceSlug`] that exists is always lowercase and well-formed, so
//! lookups never need to re-normalize.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Declares an `i64`-backed id newtype with the standard impls.
macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[derive(Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            #[inline]
            pub fn to_i64(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            #[inline]
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }
    };
}

row_id!(UserId);
row_id!(ProviderId);
row_id!(ActivationId);
row_id!(NumberId);
row_id!(LedgerTxId);
row_id!(OfferId);
row_id!(ReservationId);
row_id!(OutboxEventId);
row_id!(JobId);

/// A caller-supplied key which makes a mutation replay-safe.
///
/// Globally unique when present; 1..=128 visible ASCII characters.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> anyhow::Result<Self> {
        let key = key.into();
        anyhow::ensure!(
            !key.is_empty() && key.len() <= 128,
            "Idempotency key must be 1..=128 bytes"
        );
        anyhow::ensure!(
            key.bytes().all(|b| (0x21..=0x7e).contains(&b)),
            "Idempotency key must be visible ASCII"
        );
        Ok(Self(key))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for IdempotencyKey {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<'de> Deserialize<'de> for IdempotencyKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// A lowercase ISO-style country code, e.g. `us` or `gb`. Some upstreams
/// use numeric codes (`"0"`, `"187"`); those are accepted verbatim.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct CountryCode(String);

impl CountryCode {
    pub fn new(code: impl AsRef<str>) -> anyhow::Result<Self> {
        let code = code.as_ref().trim().to_ascii_lowercase();
        anyhow::ensure!(
            !code.is_empty() && code.len() <= 5,
            "Country code must be 1..=5 bytes: {code:?}"
        );
        anyhow::ensure!(
            code.chars().all(|c| c.is_ascii_alphanumeric()),
            "Country code must be alphanumeric: {code:?}"
        );
        Ok(Self(code))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CountryCode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<'de> Deserialize<'de> for CountryCode {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// A lowercase service slug, e.g. `telegram` or `tata-1mg`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct ServiceSlug(String);

impl ServiceSlug {
    pub fn new(slug: impl AsRef<str>) -> anyhow::Result<Self> {
        let slug = slug.as_ref().trim().to_ascii_lowercase();
        anyhow::ensure!(
            !slug.is_empty() && slug.len() <= 64,
            "Service slug must be 1..=64 bytes: {slug:?}"
        );
        anyhow::ensure!(
            slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'),
            "Service slug must be alphanumeric or '-': {slug:?}"
        );
        Ok(Self(slug))
    }

    /// Normalizes a free-form upstream service name into a slug:
    /// lowercased, non-alphanumerics collapsed to single dashes.
    pub fn normalize(name: &str) -> anyhow::Result<Self> {
        let mut slug = String::with_capacity(name.len());
        let mut prev_dash = true;
        for c in name.trim().chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
                prev_dash = false;
            } else if !prev_dash {
                slug.push('-');
                prev_dash = true;
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        slug.truncate(64);
        Self::new(slug)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ServiceSlug {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Display for ServiceSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<'de> Deserialize<'de> for ServiceSlug {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn country_code_normalizes_case() {
        assert_eq!(CountryCode::new(" US ").unwrap().as_str(), "us");
        assert_eq!(CountryCode::new("187").unwrap().as_str(), "187");
        assert!(CountryCode::new("").is_err());
        assert!(CountryCode::new("toolong").is_err());
        assert!(CountryCode::new("u s").is_err());
    }

    #[test]
    fn service_slug_normalize() {
        assert_eq!(
            ServiceSlug::normalize("Tata 1mg").unwrap().as_str(),
            "tata-1mg",
        );
        assert_eq!(
            ServiceSlug::normalize("  Telegram!! ").unwrap().as_str(),
            "telegram",
        );
        assert!(ServiceSlug::normalize("!!!").is_err());
    }

    #[test]
    fn idempotency_key_bounds() {
        assert!(IdempotencyKey::new("k1").is_ok());
        assert!(IdempotencyKey::new("").is_err());
        assert!(IdempotencyKey::new("a".repeat(129)).is_err());
        assert!(IdempotencyKey::new("with space").is_err());
    }
}
