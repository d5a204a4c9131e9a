//! A thin Meilisearch REST client implementing [`SearchIndex`].
//!
//! Talks to the engine's HTTP API directly with the shared reqwest
//! client; only the handful of endpoints the offer index needs.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::constants::DEFAULT_EXTERNAL_TIMEOUT;
use crate::search::{
    OfferDoc, OfferQuery, SearchError, SearchIndex, ServiceAliases,
};

const INDEX_UID: &str = "offers";

pub struct MeiliIndex {
    http: reqwest::Client,
    host: String,
    api_key: String,
}

impl MeiliIndex {
    pub fn new(
        http: reqwest::Client,
        host: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            host: host.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
        }
    }

    fn request(
        &self,
        method: http::Method,
        path: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.host))
            .bearer_auth(&self.api_key)
            .timeout(DEFAULT_EXTERNAL_TIMEOUT)
    }

    async fn expect_ok(
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, SearchError> {
        let response = response
            .map_err(|e| SearchError::Unavailable(format!("{e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            let detail = format!(
                "HTTP {status}: {}",
                &body[..body.len().min(256)],
            );
            if status.is_client_error() {
                Err(SearchError::Rejected(detail))
            } else {
                Err(SearchError::Unavailable(detail))
            }
        }
    }
}

#[async_trait]
impl SearchIndex for MeiliIndex {
    async fn ensure_settings(&self) -> Result<(), SearchError> {
        // Create the index if needed; 409 (already exists) is fine.
        let create = self
            .request(http::Method::POST, "/indexes")
            .json(&json!({ "uid": INDEX_UID, "primaryKey": "id" }))
            .send()
            .await;
        match Self::expect_ok(create).await {
            Ok(_) | Err(SearchError::Rejected(_)) => (),
            Err(e) => return Err(e),
        }

        let synonyms: serde_json::Map<String, serde_json::Value> =
            ServiceAliases::builtin()
                .synonym_groups()
                .into_iter()
                .flat_map(|group| {
                    let group_clone = group.clone();
                    group.into_iter().map(move |word| {
                        let others: Vec<&String> = group_clone
                            .iter()
                            .filter(|w| **w != word)
                            .collect();
                        (word, json!(others))
                    })
                })
                .collect();

        let settings = json!({
            "searchableAttributes": [
                "serviceName", "serviceSlug", "countryName",
                "countryCode", "provider", "displayName",
            ],
            "filterableAttributes": [
                "serviceSlug", "serviceName", "countryCode",
                "countryName", "provider", "operatorId", "price",
                "stock", "lastSyncedAt",
            ],
            "rankingRules": [
                "words", "typo", "proximity", "attribute", "sort",
                "exactness", "stock:desc", "lastSyncedAt:desc",
            ],
            "synonyms": synonyms,
            "stopWords": ["the", "a", "an"],
        });

        let response = self
            .request(
                http::Method::PATCH,
                &format!("/indexes/{INDEX_UID}/settings"),
            )
            .json(&settings)
            .send()
            .await;
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn upsert(&self, docs: &[OfferDoc]) -> Result<(), SearchError> {
        if docs.is_empty() {
            return Ok(());
        }
        let response = self
            .request(
                http::Method::POST,
                &format!("/indexes/{INDEX_UID}/documents"),
            )
            .json(docs)
            .send()
            .await;
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), SearchError> {
        if ids.is_empty() {
            return Ok(());
        }
        let response = self
            .request(
                http::Method::POST,
                &format!("/indexes/{INDEX_UID}/documents/delete-batch"),
            )
            .json(ids)
            .send()
            .await;
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn search(
        &self,
        query: &OfferQuery,
    ) -> Result<Vec<OfferDoc>, SearchError> {
        let mut filters: Vec<String> = Vec::new();
        if let Some(slug) = &query.service_slug {
            filters.push(format!("serviceSlug = '{slug}'"));
        }
        if let Some(code) = &query.country_code {
            filters.push(format!("countryCode = '{code}'"));
        }

        let body = json!({
            "q": query.q.clone().unwrap_or_default(),
            "filter": filters.join(" AND "),
            "limit": if query.limit == 0 { 20 } else { query.limit },
        });

        let response = self
            .request(
                http::Method::POST,
                &format!("/indexes/{INDEX_UID}/search"),
            )
            .json(&body)
            .send()
            .await;
        let response = Self::expect_ok(response).await?;

        #[derive(Deserialize)]
        struct SearchResponse {
            hits: Vec<OfferDoc>,
        }
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Unavailable(format!("{e}")))?;
        Ok(parsed.hits)
    }
}
