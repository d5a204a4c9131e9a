//! Verification-code extraction.
//!
//! Tries service-specific patterns first, then generic "code is ..."
//! phrasing, then a bare 4-8 digit fallback. Confidence reflects which
//! tier matched.

use std::sync::LazyLock;

use common::id::ServiceSlug;
use regex::Regex;

use crate::constants::SMS_MAX_CONTENT_LEN;

#[derive(Clone, Debug, PartialEq)]
pub struct Extraction {
    pub code: String,
    /// In `[0, 1]`.
    pub confidence: f32,
}

struct ServicePattern {
    service: &'static str,
    regex: &'static LazyLock<Regex>,
}

macro_rules! service_regex {
    ($name:ident, $pattern:literal) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new($pattern).expect("Pattern is checked in tests")
        });
    };
}

// The high-traffic services get dedicated patterns; everything else goes
// through the generic tiers.
service_regex!(TELEGRAM_RE, r"(?i)telegram code:?\s*(\d{5,6})");
service_regex!(WHATSAPP_RE, r"(?i)whatsapp code:?\s*(\d{3})-?(\d{3})");
service_regex!(GOOGLE_RE, r"(?i)G-(\d{6})");
service_regex!(INSTAGRAM_RE, r"(?i)(\d{6})\s+is your instagram code");
service_regex!(FACEBOOK_RE, r"(?i)(\d{5,8})\s+is your facebook");

static SERVICE_PATTERNS: &[ServicePattern] = &[
    ServicePattern {
        service: "telegram",
        regex: &TELEGRAM_RE,
    },
    ServicePattern {
        service: "whatsapp",
        regex: &WHATSAPP_RE,
    },
    ServicePattern {
        service: "google",
        regex: &GOOGLE_RE,
    },
    ServicePattern {
        service: "instagram",
        regex: &INSTAGRAM_RE,
    },
    ServicePattern {
        service: "facebook",
        regex: &FACEBOOK_RE,
    },
];

service_regex!(
    GENERIC_PHRASE_RE,
    r"(?i)(?:code|pin|otp|password)(?:\s+is)?[:\s]+(\d{4,8})\b"
);
service_regex!(FALLBACK_RE, r"\b(\d{4,8})\b");

/// Extracts a verification code from sanitized SMS content.
pub fn extract_code(
    service: &ServiceSlug,
    content: &str,
) -> Option<Extraction> {
    // Tier 1: a pattern dedicated to this service.
    for pattern in SERVICE_PATTERNS {
        if pattern.service != service.as_str() {
            continue;
        }
        if let Some(captures) = pattern.regex.captures(content) {
            let code = captures
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str())
                .collect::<String>();
            return Some(Extraction {
                code,
                confidence: 0.95,
            });
        }
    }

    // Tier 2: generic "code is NNNN" phrasing.
    if let Some(captures) = GENERIC_PHRASE_RE.captures(content) {
        return Some(Extraction {
            code: captures[1].to_owned(),
            confidence: 0.85,
        });
    }

    // Tier 3: any standalone 4-8 digit run.
    FALLBACK_RE.captures(content).map(|captures| Extraction {
        code: captures[1].to_owned(),
        confidence: 0.6,
    })
}

/// Sanitizes raw SMS content: strips control characters, collapses the
/// length to the cap.
pub fn sanitize(content: &str) -> String {
    let mut out: String = content
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect();
    out.truncate(SMS_MAX_CONTENT_LEN);
    out
}

/// Hex SHA-256 of sanitized content, the windowed-dedup key.
pub fn content_hash(content: &str) -> String {
    let digest = ring::digest::digest(
        &ring::digest::SHA256,
        content.as_bytes(),
    );
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn slug(s: &str) -> ServiceSlug {
        ServiceSlug::new(s).unwrap()
    }

    #[test]
    fn service_specific_patterns() {
        let extraction = extract_code(
            &slug("telegram"),
            "Telegram code: 84219. Do not share it.",
        )
        .unwrap();
        assert_eq!(extraction.code, "84219");
        assert!(extraction.confidence >= 0.9);

        // WhatsApp's split format glues back together.
        let extraction = extract_code(
            &slug("whatsapp"),
            "WhatsApp code: 842-193",
        )
        .unwrap();
        assert_eq!(extraction.code, "842193");

        let extraction =
            extract_code(&slug("google"), "G-482913 is your code").unwrap();
        assert_eq!(extraction.code, "482913");
    }

    #[test]
    fn generic_phrase_tier() {
        // S4's message: no tg-specific pattern matches, but the phrase
        // tier does, with confidence >= 0.8.
        let extraction =
            extract_code(&slug("tg"), "Your code is 842193").unwrap();
        assert_eq!(extraction.code, "842193");
        assert!(extraction.confidence >= 0.8);
    }

    #[test]
    fn fallback_tier() {
        let extraction =
            extract_code(&slug("unknown-app"), "Use 4821 to log in")
                .unwrap();
        assert_eq!(extraction.code, "4821");
        assert!(extraction.confidence < 0.8);

        assert_eq!(
            extract_code(&slug("unknown-app"), "no digits here"),
            None,
        );
        // Too short / too long runs don't count.
        assert_eq!(extract_code(&slug("x"), "pin 123"), None);
        assert_eq!(extract_code(&slug("x"), "ref 123456789"), None);
    }

    #[test]
    fn sanitize_strips_control_chars() {
        let dirty = "code\u{0000} is\u{0007} 1234\nok";
        assert_eq!(sanitize(dirty), "code is 1234\nok");

        let long = "x".repeat(SMS_MAX_CONTENT_LEN + 100);
        assert_eq!(sanitize(&long).len(), SMS_MAX_CONTENT_LEN);
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let h1 = content_hash("Your code is 842193");
        let h2 = content_hash("Your code is 842193");
        let h3 = content_hash("Your code is 000000");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }
}
