//! Endpoint template resolution.
//!
//! Endpoint specs carry `{slot}` templates in their path, query values and
//! header values. Slots are substituted from operation arguments plus the
//! selected credential; credential injection itself depends on the
//! provider's [`AuthMode`].

use std::collections::HashMap;

use http::Method;

use crate::config_engine::{AuthMode, EndpointSpec};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Unknown template slot '{{{0}}}'")]
    UnknownSlot(String),
    #[error("Unclosed template slot in '{0}'")]
    UnclosedSlot(String),
    #[error("Invalid HTTP method '{0}'")]
    BadMethod(String),
}

/// A fully resolved upstream request, ready to hand to the HTTP client.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Substitutes `{slot}`s in `template` from `vars`.
///
/// Unknown slots are an error: a provider config referencing a slot the
/// operation doesn't supply is misconfigured, and silently sending the
/// literal `{service}` upstream would be worse.
pub fn substitute(
    template: &str,
    vars: &HashMap<&str, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| TemplateError::UnclosedSlot(template.to_owned()))?;
        let slot = &after[..end];
        let value = vars
            .get(slot)
            .ok_or_else(|| TemplateError::UnknownSlot(slot.to_owned()))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolves an endpoint spec into a concrete request.
///
/// - `vars` holds the operation arguments (`country`, `service`, ...).
///   Optional arguments should be present with an empty value; query
///   parameters that resolve to an empty value are dropped entirely.
/// - The credential is exposed as the `api_key` slot *and* injected per
///   the provider's auth mode.
pub fn resolve(
    base_url: &str,
    spec: &EndpointSpec,
    auth: &AuthMode,
    api_key: &str,
    vars: &HashMap<&str, String>,
) -> Result<ResolvedRequest, TemplateError> {
    let mut vars = vars.clone();
    vars.insert("api_key", api_key.to_owned());

    let method = spec
        .method
        .parse::<Method>()
        .map_err(|_| TemplateError::BadMethod(spec.method.clone()))?;

    let path = substitute(&spec.path, &vars)?;
    let mut url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/'),
    );

    let mut query_pairs: Vec<(String, String)> = Vec::new();
    for (name, value_template) in &spec.query {
        let value = substitute(value_template, &vars)?;
        if !value.is_empty() {
            query_pairs.push((name.clone(), value));
        }
    }
    if let AuthMode::QueryParam { name } = auth {
        query_pairs.push((name.clone(), api_key.to_owned()));
    }
    if !query_pairs.is_empty() {
        let encoded = serde_urlencoded_like(&query_pairs);
        url.push('?');
        url.push_str(&encoded);
    }

    let mut headers: Vec<(String, String)> = Vec::new();
    for (name, value_template) in &spec.headers {
        headers.push((name.clone(), substitute(value_template, &vars)?));
    }
    match auth {
        AuthMode::None | AuthMode::QueryParam { .. } => (),
        AuthMode::Header { name } =>
            headers.push((name.clone(), api_key.to_owned())),
        AuthMode::Bearer => headers
            .push(("Authorization".to_owned(), format!("Bearer {api_key}"))),
    }

    Ok(ResolvedRequest {
        method,
        url,
        headers,
    })
}

/// Minimal application/x-www-form-urlencoded encoding for query strings.
/// Keys in provider configs are plain identifiers; values get the full
/// percent-encoding treatment.
fn serde_urlencoded_like(pairs: &[(String, String)]) -> String {
    fn encode(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for byte in s.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_'
                | b'.' | b'~' => out.push(byte as char),
                b' ' => out.push('+'),
                _ => out.push_str(&format!("%{byte:02X}")),
            }
        }
        out
    }
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod test {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs
            .iter()
            .map(|(k, v)| (*k, (*v).to_owned()))
            .collect()
    }

    #[test]
    fn substitution() {
        let vars = vars(&[("country", "us"), ("service", "tg")]);
        assert_eq!(
            substitute("/prices/{country}/{service}", &vars).unwrap(),
            "/prices/us/tg",
        );
        assert_eq!(substitute("/static", &vars).unwrap(), "/static");
        assert!(matches!(
            substitute("/x/{missing}", &vars),
            Err(TemplateError::UnknownSlot(slot)) if slot == "missing"
        ));
        assert!(matches!(
            substitute("/x/{oops", &vars),
            Err(TemplateError::UnclosedSlot(_))
        ));
    }

    #[test]
    fn resolve_with_query_auth() {
        let spec = EndpointSpec {
            method: "GET".to_owned(),
            path: "/stubs/handler_api.php".to_owned(),
            query: vec![
                ("action".to_owned(), "getNumber".to_owned()),
                ("country".to_owned(), "{country}".to_owned()),
                ("operator".to_owned(), "{operator}".to_owned()),
            ],
            headers: vec![],
        };
        let auth = AuthMode::QueryParam {
            name: "api_key".to_owned(),
        };
        // Absent optional args resolve to empty and get dropped.
        let vars = vars(&[("country", "us"), ("operator", "")]);

        let resolved =
            resolve("https://api.example.com/", &spec, &auth, "sekret", &vars)
                .unwrap();
        assert_eq!(resolved.method, Method::GET);
        assert_eq!(
            resolved.url,
            "https://api.example.com/stubs/handler_api.php\
             ?action=getNumber&country=us&api_key=sekret",
        );
        assert!(resolved.headers.is_empty());
    }

    #[test]
    fn resolve_with_header_and_bearer_auth() {
        let spec = EndpointSpec {
            method: "POST".to_owned(),
            path: "/v1/activations/{activation_id}/cancel".to_owned(),
            query: vec![],
            headers: vec![(
                "x-client".to_owned(),
                "numio".to_owned(),
            )],
        };
        let vars = vars(&[("activation_id", "A99")]);

        let auth = AuthMode::Header {
            name: "x-api-key".to_owned(),
        };
        let resolved =
            resolve("https://api.example.com", &spec, &auth, "k1", &vars)
                .unwrap();
        assert_eq!(
            resolved.url,
            "https://api.example.com/v1/activations/A99/cancel",
        );
        assert!(resolved
            .headers
            .contains(&("x-api-key".to_owned(), "k1".to_owned())));

        let resolved =
            resolve("https://api.example.com", &spec, &AuthMode::Bearer, "k1", &vars)
                .unwrap();
        assert!(resolved
            .headers
            .contains(&("Authorization".to_owned(), "Bearer k1".to_owned())));
    }

    #[test]
    fn query_values_are_percent_encoded() {
        let spec = EndpointSpec {
            method: "GET".to_owned(),
            path: "/q".to_owned(),
            query: vec![("name".to_owned(), "{name}".to_owned())],
            headers: vec![],
        };
        let vars = vars(&[("name", "a b&c")]);
        let resolved =
            resolve("https://x.test", &spec, &AuthMode::None, "", &vars)
                .unwrap();
        assert_eq!(resolved.url, "https://x.test/q?name=a+b%26c");
    }
}
