//! The provider sync pipeline.
//!
//! For each active provider: refresh metadata (with 24 h reuse and a
//! sanity check on the cached rows), fetch the balance, sync prices
//! country by country through a rate-limited bounded-concurrency sweep,
//! refresh the aggregates, and run the integrity pass. Per-provider
//! failures mark that provider failed and move on; the multi-provider
//! loop never aborts.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::id::{CountryCode, ProviderId};
use common::money::Amount;
use common::time::TimestampMs;
use futures::StreamExt;
use numio_api_core::error::ApiError;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::audit::AuditWriter;
use crate::catalogue::price::{self, Margin, PricingPolicy};
use crate::config_engine::{
    ProviderApi, ProviderConfig, ProviderRegistry,
};
use crate::constants;
use crate::models::{
    AuditRecord, NewOffer, NewOutboxEvent, ProviderCountry,
    ProviderService, SyncStatus,
};
use crate::traits::{
    CatalogStore, OutboxStore, ProviderStore, RateLimiter,
};

#[derive(Clone, Debug, Default)]
pub struct SyncSummary {
    pub providers: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub offers_written: u64,
}

#[derive(Clone)]
pub struct ProviderSyncer {
    providers: Arc<dyn ProviderStore>,
    catalog: Arc<dyn CatalogStore>,
    outbox: Arc<dyn OutboxStore>,
    registry: Arc<ProviderRegistry>,
    rate: Arc<dyn RateLimiter>,
    policy: PricingPolicy,
    audit: AuditWriter,
    /// Emits a `provider.balance_low` audit signal under this.
    balance_watermark: Option<Amount>,
}

impl ProviderSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: Arc<dyn ProviderStore>,
        catalog: Arc<dyn CatalogStore>,
        outbox: Arc<dyn OutboxStore>,
        registry: Arc<ProviderRegistry>,
        rate: Arc<dyn RateLimiter>,
        policy: PricingPolicy,
        audit: AuditWriter,
        balance_watermark: Option<Amount>,
    ) -> Self {
        Self {
            providers,
            catalog,
            outbox,
            registry,
            rate,
            policy,
            audit,
            balance_watermark,
        }
    }

    /// Syncs every active provider. Individual failures are recorded on
    /// the provider row and never abort the loop.
    #[instrument(skip(self), name = "(sync-all)")]
    pub async fn sync_all(&self) -> Result<SyncSummary, ApiError> {
        let configs = self.providers.list_active().await?;
        let mut summary = SyncSummary {
            providers: configs.len() as u64,
            ..Default::default()
        };

        for config in configs {
            let provider_id = config.id;
            let slug = config.slug.clone();
            match self.sync_provider(config).await {
                Ok(offers) => {
                    summary.succeeded += 1;
                    summary.offers_written += offers;
                    self.providers
                        .set_sync_status(
                            provider_id,
                            SyncStatus::Success,
                            None,
                        )
                        .await?;
                    self.outbox
                        .append(vec![NewOutboxEvent::new(
                            "provider",
                            provider_id,
                            "provider.synced",
                            json!({
                                "provider_id": provider_id.0,
                                "offers": offers,
                            }),
                        )])
                        .await?;
                }
                Err(e) => {
                    warn!("Sync failed for provider {slug}: {e}");
                    summary.failed += 1;
                    self.providers
                        .set_sync_status(
                            provider_id,
                            SyncStatus::Failed,
                            Some(e.to_string()),
                        )
                        .await?;
                }
            }
        }

        // Aggregates reflect whatever subset of providers succeeded.
        self.catalog.refresh_aggregates().await?;
        metrics::gauge!("catalogue_sync_failed_providers")
            .set(summary.failed as f64);
        Ok(summary)
    }

    /// Full pipeline for one provider. Returns offers written.
    #[instrument(skip(self, config), fields(slug = %config.slug))]
    pub async fn sync_provider(
        &self,
        config: ProviderConfig,
    ) -> Result<u64, ApiError> {
        self.providers
            .set_sync_status(config.id, SyncStatus::Syncing, None)
            .await?;

        let adapter =
            self.registry.get(&config.slug).ok_or_else(|| {
                ApiError::new(
                    numio_api_core::error::ErrorKind::ProviderUnavailable,
                    format!("No adapter for {}", config.slug),
                )
            })?;

        let margin = Margin {
            multiplier: config.price_multiplier,
            fixed_markup: config.fixed_markup,
            normalization: config.normalization.clone(),
        };
        margin.validate().map_err(|e| {
            ApiError::new(
                numio_api_core::error::ErrorKind::ValidationInvalid,
                e.to_string(),
            )
        })?;

        // 1. Metadata (24 h reuse + sanity check).
        self.sync_metadata(&config, adapter.as_ref()).await?;

        // 2. Balance.
        self.sync_balance(&config, adapter.as_ref()).await;

        // 3. Prices, country by country.
        let offers_written =
            self.sync_prices(&config, adapter.clone(), &margin).await?;

        Ok(offers_written)
    }

    async fn sync_metadata(
        &self,
        config: &ProviderConfig,
        adapter: &dyn ProviderApi,
    ) -> Result<(), ApiError> {
        let now = TimestampMs::now();
        let fresh_enough = self
            .providers
            .last_metadata_sync(config.id)
            .await?
            .is_some_and(|at| {
                now.saturating_duration_since(at)
                    < constants::METADATA_MAX_AGE
            });
        if fresh_enough {
            let cached = self.providers.countries(config.id).await?;
            if !cached.is_empty() && cached.iter().all(country_row_sane) {
                return Ok(());
            }
            // Cached rows are junk; fall through to a refetch.
        }

        let countries = adapter.countries().await.map_err(ApiError::from)?;
        let services =
            adapter.services(None).await.map_err(ApiError::from)?;

        let country_rows: Vec<ProviderCountry> = countries
            .into_iter()
            .map(|c| ProviderCountry {
                provider_id: config.id,
                external_id: c.external_id,
                code: c.code,
                name: c.name,
                flag_url: c.flag_url,
                last_sync_at: now,
            })
            .filter(country_row_sane)
            .collect();
        let service_rows: Vec<ProviderService> = services
            .into_iter()
            .map(|s| ProviderService {
                provider_id: config.id,
                external_id: s.external_id,
                slug: s.slug,
                name: s.name,
                icon_url: s.icon_url,
                last_sync_at: now,
            })
            .collect();

        info!(
            "Provider {} metadata: {} countries, {} services",
            config.slug,
            country_rows.len(),
            service_rows.len(),
        );
        self.providers
            .upsert_countries(config.id, country_rows)
            .await?;
        self.providers
            .upsert_services(config.id, service_rows)
            .await?;
        self.providers.set_metadata_synced(config.id, now).await?;
        Ok(())
    }

    /// Balance fetch is advisory: failures are logged, never fatal.
    async fn sync_balance(
        &self,
        config: &ProviderConfig,
        adapter: &dyn ProviderApi,
    ) {
        match adapter.balance().await {
            Ok(balance) => {
                let _ = self
                    .providers
                    .set_balance(config.id, balance, TimestampMs::now())
                    .await;
                if let Some(watermark) = self.balance_watermark {
                    if balance < watermark {
                        warn!(
                            "Provider {} balance low: {balance}",
                            config.slug,
                        );
                        metrics::counter!("provider_balance_low_total")
                            .increment(1);
                        self.audit.record(AuditRecord::new(
                            "sync",
                            format!("provider:{}", config.slug),
                            json!({
                                "step": "balance_low",
                                "balance": balance,
                            }),
                        ));
                    }
                }
            }
            Err(e) =>
                warn!("Balance fetch failed for {}: {e}", config.slug),
        }
    }

    async fn sync_prices(
        &self,
        config: &ProviderConfig,
        adapter: Arc<dyn ProviderApi>,
        margin: &Margin,
    ) -> Result<u64, ApiError> {
        let countries = self.providers.countries(config.id).await?;
        let services = self.providers.services(config.id).await?;
        let country_names: HashMap<String, (String, Option<String>)> =
            countries
                .iter()
                .map(|c| {
                    (
                        c.code.as_str().to_owned(),
                        (c.name.clone(), c.flag_url.clone()),
                    )
                })
                .collect();
        let service_names: HashMap<String, (String, Option<String>)> =
            services
                .iter()
                .map(|s| {
                    (
                        s.slug.as_str().to_owned(),
                        (s.name.clone(), s.icon_url.clone()),
                    )
                })
                .collect();

        let written = AtomicU64::new(0);
        let rate_key = format!("rate:sync:{}", config.slug);

        futures::stream::iter(countries)
            .for_each_concurrent(constants::SYNC_CONCURRENCY, |country| {
                let adapter = adapter.clone();
                let written = &written;
                let rate_key = &rate_key;
                let country_names = &country_names;
                let service_names = &service_names;
                async move {
                    // Respect the per-provider request budget; on limit,
                    // wait out the window rather than dropping the
                    // country.
                    loop {
                        match self
                            .rate
                            .check(
                                rate_key,
                                constants::SYNC_RATE_PER_MIN,
                                Duration::from_secs(60),
                            )
                            .await
                        {
                            Ok(decision) if decision.allowed => break,
                            Ok(decision) => {
                                tokio::time::sleep(
                                    decision
                                        .retry_after
                                        .unwrap_or(Duration::from_secs(1)),
                                )
                                .await;
                            }
                            Err(e) => {
                                warn!("Rate check failed: {e}");
                                break;
                            }
                        }
                    }

                    match self
                        .sync_country(
                            config,
                            adapter.as_ref(),
                            margin,
                            &country.code,
                            country_names,
                            service_names,
                        )
                        .await
                    {
                        Ok(count) => {
                            written.fetch_add(count, Ordering::Relaxed);
                        }
                        // Per-country errors are logged and skipped.
                        Err(e) => warn!(
                            "Price sync failed for {}/{}: {e}",
                            config.slug, country.code,
                        ),
                    }
                }
            })
            .await;

        Ok(written.into_inner())
    }

    async fn sync_country(
        &self,
        config: &ProviderConfig,
        adapter: &dyn ProviderApi,
        margin: &Margin,
        country: &CountryCode,
        country_names: &HashMap<String, (String, Option<String>)>,
        service_names: &HashMap<String, (String, Option<String>)>,
    ) -> Result<u64, ApiError> {
        let rows = adapter
            .prices(Some(country), None)
            .await
            .map_err(ApiError::from)?;

        let mut offers = Vec::with_capacity(rows.len());
        for row in rows {
            // Zero stock never reaches the catalogue.
            if row.count == 0 {
                continue;
            }
            let sell = match price::sell_price(
                row.cost,
                margin,
                &self.policy,
            ) {
                Ok(sell) => sell,
                Err(e) => {
                    warn!(
                        "Unpriceable row {}/{}/{}: {e}",
                        config.slug, row.country, row.service,
                    );
                    continue;
                }
            };
            let (country_name, flag_url) = country_names
                .get(row.country.as_str())
                .cloned()
                .unwrap_or_else(|| {
                    (row.country.as_str().to_uppercase(), None)
                });
            let (service_name, icon_url) = service_names
                .get(row.service.as_str())
                .cloned()
                .unwrap_or_else(|| {
                    (row.service.as_str().to_owned(), None)
                });

            offers.push(NewOffer {
                country: row.country,
                country_name,
                flag_url,
                service: row.service,
                service_name,
                icon_url,
                operator_id: row
                    .operator
                    .unwrap_or_else(|| "default".to_owned()),
                raw_cost: row.cost,
                sell_price: sell,
                stock: row.count,
            });
        }

        let mut written = 0u64;
        for chunk in offers.chunks(constants::OFFER_CHUNK_SIZE) {
            written += self
                .catalog
                .upsert_offers(
                    config.id,
                    chunk.to_vec(),
                    vec![NewOutboxEvent::new(
                        "offer",
                        format!("{}:{}", config.slug, country),
                        "offer.upserted",
                        json!({
                            "provider_id": config.id.0,
                            "country": country.as_str(),
                            "count": chunk.len(),
                        }),
                    )],
                )
                .await?;
        }
        Ok(written)
    }

    /// Integrity pass: prune offers of disabled providers and remove icon
    /// assets nothing references anymore.
    #[instrument(skip(self, all_configs, icon_dir), name = "(integrity)")]
    pub async fn integrity_pass(
        &self,
        all_configs: &[ProviderConfig],
        icon_dir: Option<&Path>,
        live_icon_urls: &HashSet<String>,
    ) -> Result<u64, ApiError> {
        let mut pruned = 0u64;
        for config in all_configs.iter().filter(|c| !c.active) {
            pruned += self
                .catalog
                .prune_provider_offers(config.id)
                .await?;
        }

        if let Some(dir) = icon_dir {
            if let Err(e) = remove_orphan_icons(dir, live_icon_urls).await {
                warn!("Icon cleanup failed: {e:#}");
            }
        }
        Ok(pruned)
    }
}

/// The metadata sanity check: junk rows (codes as names, "Unknown",
/// whitespace-ridden codes) force a refetch instead of being served.
fn country_row_sane(row: &ProviderCountry) -> bool {
    let code = row.code.as_str();
    let name = row.name.trim();
    !name.is_empty()
        && !name.eq_ignore_ascii_case("unknown")
        && !name.eq_ignore_ascii_case(code)
        && !code.contains(char::is_whitespace)
        && code.len() <= 5
}

/// Deletes files under `dir` whose names aren't referenced by any live
/// icon URL.
async fn remove_orphan_icons(
    dir: &Path,
    live_icon_urls: &HashSet<String>,
) -> anyhow::Result<()> {
    let live_names: HashSet<&str> = live_icon_urls
        .iter()
        .filter_map(|url| url.rsplit('/').next())
        .collect();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !live_names.contains(name) {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!("Couldn't remove orphan icon {name}: {e}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::IpAddr;

    use async_trait::async_trait;
    use common::id::ServiceSlug;
    use numio_tokio::notify_once::NotifyOnce;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::config_engine::{
        Acquired, AuthMode, Country, NormalizationMode, PriceRow,
        ProviderError, ServiceInfo, StatusPoll, UpstreamStatus,
        WebhookPayload, WebhookVerdict,
    };
    use crate::store::memory::MemStore;

    struct CatalogueStub {
        config: ProviderConfig,
        prices: HashMap<String, Vec<PriceRow>>,
    }

    #[async_trait]
    impl ProviderApi for CatalogueStub {
        fn config(&self) -> &ProviderConfig {
            &self.config
        }
        async fn countries(&self) -> Result<Vec<Country>, ProviderError> {
            Ok(vec![
                Country {
                    external_id: "187".to_owned(),
                    code: CountryCode::new("us").unwrap(),
                    name: "United States".to_owned(),
                    flag_url: None,
                },
                Country {
                    external_id: "16".to_owned(),
                    code: CountryCode::new("gb").unwrap(),
                    name: "United Kingdom".to_owned(),
                    flag_url: None,
                },
            ])
        }
        async fn services(
            &self,
            _country: Option<&CountryCode>,
        ) -> Result<Vec<ServiceInfo>, ProviderError> {
            Ok(vec![ServiceInfo {
                external_id: "tg".to_owned(),
                slug: ServiceSlug::new("tg").unwrap(),
                name: "Telegram".to_owned(),
                icon_url: None,
            }])
        }
        async fn prices(
            &self,
            country: Option<&CountryCode>,
            _service: Option<&ServiceSlug>,
        ) -> Result<Vec<PriceRow>, ProviderError> {
            Ok(self
                .prices
                .get(country.unwrap().as_str())
                .cloned()
                .unwrap_or_default())
        }
        async fn acquire_number(
            &self,
            _country: &CountryCode,
            _service: &ServiceSlug,
            _operator: Option<&str>,
        ) -> Result<Acquired, ProviderError> {
            Err(ProviderError::OutOfStock)
        }
        async fn status(
            &self,
            _id: &str,
        ) -> Result<StatusPoll, ProviderError> {
            Ok(StatusPoll {
                status: UpstreamStatus::Pending,
                messages: vec![],
            })
        }
        async fn set_status(
            &self,
            _id: &str,
            _next: UpstreamStatus,
        ) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn cancel_number(
            &self,
            _id: &str,
        ) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn balance(&self) -> Result<Amount, ProviderError> {
            Ok(Amount::from_major(42))
        }
        fn parse_webhook(
            &self,
            _raw: &[u8],
        ) -> Result<WebhookPayload, ProviderError> {
            Err(ProviderError::NotConfigured)
        }
        fn verify_webhook(
            &self,
            _raw_body: &[u8],
            _headers: &http::HeaderMap,
            _source_ip: IpAddr,
        ) -> WebhookVerdict {
            WebhookVerdict {
                valid: false,
                error: None,
                time_drift: None,
            }
        }
    }

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            id: ProviderId(1),
            slug: "acme".to_owned(),
            display_name: "Acme SMS".to_owned(),
            base_url: "http://acme.test".to_owned(),
            auth: AuthMode::None,
            api_keys: vec![],
            endpoints: Default::default(),
            mappings: Default::default(),
            currency: "USD".to_owned(),
            price_multiplier: dec!(1.5),
            fixed_markup: Amount::try_from_decimal(dec!(0.10)).unwrap(),
            normalization: NormalizationMode::Direct,
            legacy_metadata: false,
            active: true,
            priority: 1,
            webhook_secret: None,
            webhook_allowed_ips: vec![],
            breaker_threshold: 5,
        }
    }

    fn price_row(country: &str, cost: rust_decimal::Decimal, count: u64) -> PriceRow {
        PriceRow {
            country: CountryCode::new(country).unwrap(),
            service: ServiceSlug::new("tg").unwrap(),
            operator: None,
            cost: Amount::try_from_decimal(cost).unwrap(),
            count,
        }
    }

    #[tokio::test]
    async fn full_sync_writes_offers_and_aggregates() {
        let store = Arc::new(MemStore::new());
        let config = test_config();
        store.put_provider_config(config.clone());

        let mut prices = HashMap::new();
        prices.insert(
            "us".to_owned(),
            vec![price_row("us", dec!(1.00), 10), price_row("us", dec!(2), 0)],
        );
        prices.insert("gb".to_owned(), vec![price_row("gb", dec!(2.00), 5)]);

        let mut registry = ProviderRegistry::empty();
        registry.insert(
            "acme",
            Arc::new(CatalogueStub {
                config: config.clone(),
                prices,
            }),
        );

        let (audit, _task) =
            AuditWriter::spawn(store.clone(), NotifyOnce::new());
        let syncer = ProviderSyncer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(registry),
            store.clone(),
            PricingPolicy::default(),
            audit,
            None,
        );

        let summary = syncer.sync_all().await.unwrap();
        assert_eq!(summary.providers, 1);
        assert_eq!(summary.succeeded, 1);
        // The zero-stock row is filtered.
        assert_eq!(summary.offers_written, 2);

        // Margin applied: 1.00 * 1.5 + 0.10 = 1.60.
        let offer = store
            .best_offer(
                &CountryCode::new("us").unwrap(),
                &ServiceSlug::new("tg").unwrap(),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            offer.sell_price,
            Amount::try_from_decimal(dec!(1.60)).unwrap(),
        );
        assert_eq!(offer.stock, 10);
        assert_eq!(offer.service_name, "Telegram");
        assert_eq!(offer.country_name, "United States");

        // Aggregates were refreshed.
        let (aggregates, total) = store
            .service_aggregates(
                numio_api_core::models::ServiceSort::Name,
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(aggregates[0].country_count, 2);
        assert_eq!(aggregates[0].total_stock, 15);

        // One offer.upserted outbox event per batch + provider.synced.
        let outbox = store.outbox_rows();
        assert_eq!(
            outbox
                .iter()
                .filter(|e| e.event_type == "offer.upserted")
                .count(),
            2,
        );
        assert!(outbox.iter().any(|e| e.event_type == "provider.synced"));
    }

    #[tokio::test]
    async fn provider_failure_does_not_abort_loop() {
        let store = Arc::new(MemStore::new());
        let good = test_config();
        let mut bad = test_config();
        bad.id = ProviderId(2);
        bad.slug = "broken".to_owned();
        store.put_provider_config(good.clone());
        store.put_provider_config(bad.clone());

        let mut prices = HashMap::new();
        prices.insert("us".to_owned(), vec![price_row("us", dec!(1), 3)]);

        // Only the good provider has an adapter; "broken" fails with no
        // adapter registered.
        let mut registry = ProviderRegistry::empty();
        registry.insert(
            "acme",
            Arc::new(CatalogueStub {
                config: good.clone(),
                prices,
            }),
        );

        let (audit, _task) =
            AuditWriter::spawn(store.clone(), NotifyOnce::new());
        let syncer = ProviderSyncer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(registry),
            store.clone(),
            PricingPolicy::default(),
            audit,
            None,
        );

        let summary = syncer.sync_all().await.unwrap();
        assert_eq!(summary.providers, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.offers_written, 1);
    }

    #[test]
    fn sanity_check_rejects_junk_rows() {
        let now = TimestampMs::now();
        let sane = ProviderCountry {
            provider_id: ProviderId(1),
            external_id: "187".to_owned(),
            code: CountryCode::new("us").unwrap(),
            name: "United States".to_owned(),
            flag_url: None,
            last_sync_at: now,
        };
        assert!(country_row_sane(&sane));

        let mut junk = sane.clone();
        junk.name = "Unknown".to_owned();
        assert!(!country_row_sane(&junk));

        let mut junk = sane.clone();
        junk.name = "us".to_owned();
        assert!(!country_row_sane(&junk));
    }
}
