//! The offer search layer.
//!
//! Offers are indexed as flat documents in an external search engine
//! (Meilisearch over REST in production, an in-memory engine in tests)
//! behind the [`SearchIndex`] seam. Aggregate queries group the matching
//! offers into service / country / provider views, with a short response
//! cache in front of the service aggregates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::id::{CountryCode, ServiceSlug};
use common::money::Amount;
use common::time::TimestampMs;
use numio_api_core::error::{ApiError, ErrorKind};
use numio_api_core::models::{
    CountryAggregateRow, OfferRow, ServiceAggregateRow, ServiceSort,
};
use numio_api_core::types::{PageRequest, Paginated};
use serde::{Deserialize, Serialize};

use crate::config_engine::cache::{Lookup, SwrCache};
use crate::constants::PRICE_CACHE_TTL;
use crate::models::Offer;
use crate::traits::CatalogStore;

/// The Meilisearch REST client.
pub mod client;
/// In-memory index for tests.
pub mod memory;

/// One indexed offer document. Wire keys are camelCase to match the
/// index's attribute configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDoc {
    /// Primary key: normalized lowercase, non-alphanumerics stripped;
    /// includes the operator.
    pub id: String,
    pub provider: String,
    pub display_name: String,
    pub country_code: String,
    pub country_name: String,
    pub flag_url: Option<String>,
    pub service_slug: String,
    pub service_name: String,
    pub icon_url: Option<String>,
    pub operator_id: String,
    pub external_operator: Option<String>,
    pub price: Amount,
    pub stock: u64,
    pub last_synced_at: TimestampMs,
}

impl OfferDoc {
    /// Builds the normalized primary key for an offer.
    pub fn document_id(
        provider_slug: &str,
        country: &CountryCode,
        service: &ServiceSlug,
        operator: &str,
    ) -> String {
        let raw = format!("{provider_slug}{country}{service}{operator}");
        raw.chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    pub fn from_offer(offer: &Offer) -> Self {
        Self {
            id: Self::document_id(
                &offer.provider_slug,
                &offer.country,
                &offer.service,
                &offer.operator_id,
            ),
            provider: offer.provider_slug.clone(),
            display_name: offer.display_name.clone(),
            country_code: offer.country.as_str().to_owned(),
            country_name: offer.country_name.clone(),
            flag_url: offer.flag_url.clone(),
            service_slug: offer.service.as_str().to_owned(),
            service_name: offer.service_name.clone(),
            icon_url: offer.icon_url.clone(),
            operator_id: offer.operator_id.clone(),
            external_operator: None,
            price: offer.sell_price,
            stock: offer.stock,
            last_synced_at: offer.last_sync_at,
        }
    }
}

/// A filtered index query. `q` is typo-tolerant full text; the rest are
/// exact filters.
#[derive(Clone, Debug, Default)]
pub struct OfferQuery {
    pub q: Option<String>,
    pub service_slug: Option<String>,
    pub country_code: Option<String>,
    pub limit: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Search engine unavailable: {0}")]
    Unavailable(String),
    #[error("Search engine rejected the request: {0}")]
    Rejected(String),
}

impl From<SearchError> for ApiError {
    fn from(e: SearchError) -> Self {
        ApiError::new(ErrorKind::SystemCache, e.to_string())
    }
}

/// The search-engine seam.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Idempotent settings push: searchable / filterable / ranking /
    /// synonyms / stop words. Called at warm-up.
    async fn ensure_settings(&self) -> Result<(), SearchError>;

    async fn upsert(&self, docs: &[OfferDoc]) -> Result<(), SearchError>;

    async fn delete(&self, ids: &[String]) -> Result<(), SearchError>;

    async fn search(
        &self,
        query: &OfferQuery,
    ) -> Result<Vec<OfferDoc>, SearchError>;
}

// --- Service aliasing --- //

/// One canonical service entry in the override table.
#[derive(Clone, Debug)]
pub struct ServiceOverride {
    pub canonical: &'static str,
    pub display_name: &'static str,
    pub icon_url: Option<&'static str>,
    pub aliases: &'static [&'static str],
}

/// The service-name override table, applied both at indexing time
/// (slug / display-name rewrite) and at query time (alias resolution).
pub struct ServiceAliases {
    by_alias: HashMap<&'static str, &'static ServiceOverride>,
}

static OVERRIDES: &[ServiceOverride] = &[
    ServiceOverride {
        canonical: "telegram",
        display_name: "Telegram",
        icon_url: Some("/icons/telegram.svg"),
        aliases: &["tg"],
    },
    ServiceOverride {
        canonical: "whatsapp",
        display_name: "WhatsApp",
        icon_url: Some("/icons/whatsapp.svg"),
        aliases: &["wa", "wapp"],
    },
    ServiceOverride {
        canonical: "tata-1mg",
        display_name: "Tata 1mg",
        icon_url: None,
        aliases: &["bby", "1mg"],
    },
    ServiceOverride {
        canonical: "google",
        display_name: "Google / Gmail",
        icon_url: Some("/icons/google.svg"),
        aliases: &["gmail", "go"],
    },
];

impl Default for ServiceAliases {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ServiceAliases {
    pub fn builtin() -> Self {
        let mut by_alias = HashMap::new();
        for entry in OVERRIDES {
            by_alias.insert(entry.canonical, entry);
            for alias in entry.aliases {
                by_alias.insert(*alias, entry);
            }
        }
        Self { by_alias }
    }

    /// Resolves an alias (or canonical slug) to its canonical slug.
    pub fn resolve(&self, slug: &ServiceSlug) -> ServiceSlug {
        match self.by_alias.get(slug.as_str()) {
            Some(entry) => ServiceSlug::new(entry.canonical)
                .expect("Override table slugs are valid"),
            None => slug.clone(),
        }
    }

    /// The display name / icon rewrite for indexing, if configured.
    pub fn display(
        &self,
        slug: &ServiceSlug,
    ) -> Option<(&'static str, Option<&'static str>)> {
        self.by_alias
            .get(slug.as_str())
            .map(|e| (e.display_name, e.icon_url))
    }

    /// Synonym groups for the index settings.
    pub fn synonym_groups(&self) -> Vec<Vec<String>> {
        OVERRIDES
            .iter()
            .map(|entry| {
                std::iter::once(entry.canonical)
                    .chain(entry.aliases.iter().copied())
                    .map(str::to_owned)
                    .collect()
            })
            .collect()
    }
}

// --- Aggregate queries --- //

type ServicePage = (Vec<ServiceAggregateRow>, u64);

pub struct SearchService {
    index: Arc<dyn SearchIndex>,
    catalog: Arc<dyn CatalogStore>,
    aliases: ServiceAliases,
    /// Service-aggregate responses, cached 60 s keyed by
    /// (query-hash, page, sort).
    aggregate_cache: SwrCache<String, ServicePage>,
}

impl SearchService {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            index,
            catalog,
            aliases: ServiceAliases::builtin(),
            aggregate_cache: SwrCache::new(1024, PRICE_CACHE_TTL),
        }
    }

    pub fn aliases(&self) -> &ServiceAliases {
        &self.aliases
    }

    /// Service list with aggregates. Query mode ranks by index relevance;
    /// otherwise the requested sort applies.
    pub async fn search_services(
        &self,
        q: Option<&str>,
        sort: ServiceSort,
        page: PageRequest,
    ) -> Result<Paginated<ServiceAggregateRow>, ApiError> {
        let page = page.clamped();
        let cache_key = format!(
            "{}|{:?}|{}|{}",
            q.unwrap_or_default(),
            sort,
            page.page,
            page.limit,
        );
        if let Lookup::Fresh(cached) | Lookup::Stale(cached) =
            self.aggregate_cache.get(&cache_key)
        {
            let (items, total) = cached;
            return Ok(Paginated {
                items,
                total,
                page: page.page,
                limit: page.limit,
            });
        }

        let (items, total) = match q.filter(|q| !q.trim().is_empty()) {
            // Query mode: relevance order comes from the index; group
            // the matching offers into service rows, preserving the
            // index's ranking.
            Some(q) => {
                let docs = self
                    .index
                    .search(&OfferQuery {
                        q: Some(q.to_owned()),
                        limit: 1000,
                        ..Default::default()
                    })
                    .await?;
                let rows = group_services(&docs);
                let total = rows.len() as u64;
                let items = rows
                    .into_iter()
                    .skip(page.offset() as usize)
                    .take(page.limit as usize)
                    .collect();
                (items, total)
            }
            // Browse mode: precomputed aggregates straight from the
            // store.
            None => self.catalog.service_aggregates(sort, page).await?,
        };

        self.aggregate_cache
            .insert(cache_key, (items.clone(), total));
        Ok(Paginated {
            items,
            total,
            page: page.page,
            limit: page.limit,
        })
    }

    /// Countries where a service is available, grouped with per-country
    /// rollups.
    pub async fn search_countries(
        &self,
        service: &ServiceSlug,
        q: Option<&str>,
    ) -> Result<Vec<CountryAggregateRow>, ApiError> {
        let canonical = self.aliases.resolve(service);
        let docs = self
            .index
            .search(&OfferQuery {
                service_slug: Some(canonical.as_str().to_owned()),
                limit: 5000,
                ..Default::default()
            })
            .await?;

        let mut rows = group_countries(&docs);
        if let Some(q) = q.filter(|q| !q.trim().is_empty()) {
            let needle = q.trim().to_ascii_lowercase();
            rows.retain(|row| {
                row.country_name.to_ascii_lowercase().contains(&needle)
                    || row.country_code.as_str().contains(&needle)
            });
        }
        Ok(rows)
    }

    /// Individual offers for (service, country): price asc, stock desc.
    pub async fn search_providers(
        &self,
        service: &ServiceSlug,
        country: &CountryCode,
    ) -> Result<Vec<OfferRow>, ApiError> {
        let canonical = self.aliases.resolve(service);
        let mut docs = self
            .index
            .search(&OfferQuery {
                service_slug: Some(canonical.as_str().to_owned()),
                country_code: Some(country.as_str().to_owned()),
                limit: 1000,
                ..Default::default()
            })
            .await?;

        docs.sort_by(|a, b| {
            a.price
                .cmp(&b.price)
                .then(b.stock.cmp(&a.stock))
        });
        Ok(docs
            .into_iter()
            .map(|doc| OfferRow {
                provider: doc.provider,
                display_name: doc.display_name,
                operator_id: doc.operator_id,
                price: doc.price,
                stock: doc.stock,
            })
            .collect())
    }
}

/// Groups offer docs into service rows, first-seen order preserved.
fn group_services(docs: &[OfferDoc]) -> Vec<ServiceAggregateRow> {
    let mut order: Vec<&str> = Vec::new();
    let mut by_service: HashMap<&str, Vec<&OfferDoc>> = HashMap::new();
    for doc in docs {
        if !by_service.contains_key(doc.service_slug.as_str()) {
            order.push(&doc.service_slug);
        }
        by_service
            .entry(&doc.service_slug)
            .or_default()
            .push(doc);
    }

    order
        .into_iter()
        .filter_map(|slug| {
            let docs = by_service.get(slug)?;
            let countries: std::collections::HashSet<&str> =
                docs.iter().map(|d| d.country_code.as_str()).collect();
            let providers: std::collections::HashSet<&str> =
                docs.iter().map(|d| d.provider.as_str()).collect();
            Some(ServiceAggregateRow {
                service_slug: ServiceSlug::new(slug).ok()?,
                service_name: docs[0].service_name.clone(),
                icon_url: docs.iter().find_map(|d| d.icon_url.clone()),
                lowest_price: docs
                    .iter()
                    .map(|d| d.price)
                    .min()
                    .unwrap_or(Amount::ZERO),
                total_stock: docs.iter().map(|d| d.stock).sum(),
                country_count: countries.len() as u64,
                provider_count: providers.len() as u64,
                last_updated_at: docs
                    .iter()
                    .map(|d| d.last_synced_at)
                    .max()
                    .unwrap_or(TimestampMs::MIN),
            })
        })
        .collect()
}

/// Groups offer docs into country rows, cheapest-first.
fn group_countries(docs: &[OfferDoc]) -> Vec<CountryAggregateRow> {
    let mut by_country: HashMap<&str, Vec<&OfferDoc>> = HashMap::new();
    for doc in docs {
        by_country
            .entry(&doc.country_code)
            .or_default()
            .push(doc);
    }

    let mut rows: Vec<CountryAggregateRow> = by_country
        .into_iter()
        .filter_map(|(code, docs)| {
            let providers: std::collections::HashSet<&str> =
                docs.iter().map(|d| d.provider.as_str()).collect();
            Some(CountryAggregateRow {
                country_code: CountryCode::new(code).ok()?,
                country_name: docs[0].country_name.clone(),
                flag_url: docs.iter().find_map(|d| d.flag_url.clone()),
                lowest_price: docs
                    .iter()
                    .map(|d| d.price)
                    .min()
                    .unwrap_or(Amount::ZERO),
                total_stock: docs.iter().map(|d| d.stock).sum(),
                provider_count: providers.len() as u64,
            })
        })
        .collect();
    rows.sort_by_key(|row| row.lowest_price);
    rows
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::search::memory::MemoryIndex;
    use crate::store::memory::MemStore;

    fn doc(
        provider: &str,
        country: &str,
        service: &str,
        price: u64,
        stock: u64,
    ) -> OfferDoc {
        OfferDoc {
            id: OfferDoc::document_id(
                provider,
                &CountryCode::new(country).unwrap(),
                &ServiceSlug::new(service).unwrap(),
                "default",
            ),
            provider: provider.to_owned(),
            display_name: provider.to_uppercase(),
            country_code: country.to_owned(),
            country_name: country.to_uppercase(),
            flag_url: None,
            service_slug: service.to_owned(),
            service_name: service.to_uppercase(),
            icon_url: None,
            operator_id: "default".to_owned(),
            external_operator: None,
            price: Amount::from_major(price),
            stock,
            last_synced_at: TimestampMs::now(),
        }
    }

    async fn service_with(docs: Vec<OfferDoc>) -> SearchService {
        let index = Arc::new(MemoryIndex::new());
        index.upsert(&docs).await.unwrap();
        SearchService::new(index, Arc::new(MemStore::new()))
    }

    #[test]
    fn document_id_normalizes() {
        assert_eq!(
            OfferDoc::document_id(
                "Acme-SMS",
                &CountryCode::new("US").unwrap(),
                &ServiceSlug::new("tata-1mg").unwrap(),
                "op_1",
            ),
            "acmesmsustata1mgop1",
        );
    }

    #[test]
    fn alias_resolution() {
        let aliases = ServiceAliases::builtin();
        let resolve = |s: &str| {
            aliases.resolve(&ServiceSlug::new(s).unwrap())
        };
        assert_eq!(resolve("tg").as_str(), "telegram");
        assert_eq!(resolve("bby").as_str(), "tata-1mg");
        assert_eq!(resolve("telegram").as_str(), "telegram");
        assert_eq!(resolve("never-heard-of-it").as_str(), "never-heard-of-it");
    }

    #[tokio::test]
    async fn providers_sorted_price_asc_stock_desc() {
        let service = service_with(vec![
            doc("p1", "us", "telegram", 3, 10),
            doc("p2", "us", "telegram", 1, 2),
            doc("p3", "us", "telegram", 1, 9),
            doc("p4", "gb", "telegram", 1, 50),
        ])
        .await;

        // Querying by the alias resolves to the canonical slug.
        let rows = service
            .search_providers(
                &ServiceSlug::new("tg").unwrap(),
                &CountryCode::new("us").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].provider, "p3"); // price 1, stock 9
        assert_eq!(rows[1].provider, "p2"); // price 1, stock 2
        assert_eq!(rows[2].provider, "p1"); // price 3
    }

    #[tokio::test]
    async fn countries_grouped_and_filtered() {
        let service = service_with(vec![
            doc("p1", "us", "telegram", 3, 10),
            doc("p2", "us", "telegram", 2, 5),
            doc("p1", "gb", "telegram", 1, 7),
        ])
        .await;

        let rows = service
            .search_countries(&ServiceSlug::new("telegram").unwrap(), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        // Cheapest country first.
        assert_eq!(rows[0].country_code.as_str(), "gb");
        let us = &rows[1];
        assert_eq!(us.provider_count, 2);
        assert_eq!(us.total_stock, 15);
        assert_eq!(us.lowest_price, Amount::from_major(2));

        let filtered = service
            .search_countries(
                &ServiceSlug::new("telegram").unwrap(),
                Some("gb"),
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn query_mode_groups_index_hits() {
        let service = service_with(vec![
            doc("p1", "us", "telegram", 3, 10),
            doc("p1", "us", "viber", 2, 4),
        ])
        .await;

        let page = service
            .search_services(
                Some("telegram"),
                ServiceSort::Name,
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].service_slug.as_str(), "telegram");

        // Typo tolerance comes from the engine; the memory index models
        // a one-edit tolerance.
        let page = service
            .search_services(
                Some("telegrm"),
                ServiceSort::Name,
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }
}
