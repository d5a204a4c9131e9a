//! Process-wide context.
//!
//! The DB pool, Redis client, search client, and queue are singletons
//! initialized here, by the orchestrator, and nowhere else; request
//! handlers only ever receive them through the context. Boot order:
//! validate env -> warm DB -> warm Redis -> warm search -> wire services.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use numio_api::auth::TokenAuthority;
use numio_core::activation::ActivationManager;
use numio_core::audit::AuditWriter;
use numio_core::catalogue::ProviderSyncer;
use numio_core::config_engine::ProviderRegistry;
use numio_core::events::EventPublisher;
use numio_core::inbox::InboxPoller;
use numio_core::ledger::LedgerService;
use numio_core::outbox::OutboxDispatcher;
use numio_core::queue::deliver::NotificationDeliverer;
use numio_core::queue::master::MasterWorker;
use numio_core::queue::JobQueue;
use numio_core::search::client::MeiliIndex;
use numio_core::search::{SearchIndex, SearchService};
use numio_core::store::memory::MemStore;
use numio_core::store::postgres::PgStore;
use numio_core::store::redis::RedisStore;
use numio_core::traits::{
    ActivationStore, CatalogStore, EventTransport, KvCache, LockStore,
    NumberStore, OutboxStore, ProviderStore, QueueStore, RateLimiter,
    SmsStore, WalletStore, WebhookStore,
};
use numio_tokio::notify_once::NotifyOnce;
use numio_tokio::task::NxTask;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::Config;

/// Everything a process needs, wired once at boot.
pub struct AppContext {
    pub token_authority: TokenAuthority,
    pub ledger: LedgerService,
    pub manager: ActivationManager,
    pub search: SearchService,
    pub syncer: ProviderSyncer,
    pub poller: Arc<InboxPoller>,
    pub outbox_dispatcher: Arc<OutboxDispatcher>,
    pub master: Arc<MasterWorker>,
    pub queue: JobQueue,
    pub publisher: EventPublisher,
    pub registry: Arc<ProviderRegistry>,
    pub audit: AuditWriter,
    pub shutdown: NotifyOnce,
    pub metrics: Option<PrometheusHandle>,

    // Raw store handles for handlers that don't go through a service.
    pub wallet_store: Arc<dyn WalletStore>,
    pub activation_store: Arc<dyn ActivationStore>,
    pub number_store: Arc<dyn NumberStore>,
    pub sms_store: Arc<dyn SmsStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub provider_store: Arc<dyn ProviderStore>,
    pub webhook_store: Arc<dyn WebhookStore>,
    pub outbox_store: Arc<dyn OutboxStore>,
    pub queue_store: Arc<dyn QueueStore>,
    pub locks: Arc<dyn LockStore>,
    pub rate: Arc<dyn RateLimiter>,
    pub kv: Arc<dyn KvCache>,
    pub transport: Arc<dyn EventTransport>,
    pub index: Arc<dyn SearchIndex>,
}

/// Stores grouped for wiring; every field may point at the same object.
struct Backing {
    wallet: Arc<dyn WalletStore>,
    activation: Arc<dyn ActivationStore>,
    number: Arc<dyn NumberStore>,
    sms: Arc<dyn SmsStore>,
    catalog: Arc<dyn CatalogStore>,
    provider: Arc<dyn ProviderStore>,
    webhook: Arc<dyn WebhookStore>,
    outbox: Arc<dyn OutboxStore>,
    queue: Arc<dyn QueueStore>,
    audit_sink: Arc<dyn numio_core::traits::AuditSink>,
    locks: Arc<dyn LockStore>,
    rate: Arc<dyn RateLimiter>,
    kv: Arc<dyn KvCache>,
    transport: Arc<dyn EventTransport>,
}

impl AppContext {
    /// Production wiring: Postgres + Redis + Meilisearch.
    pub async fn build(
        config: &Config,
        process: &'static str,
    ) -> anyhow::Result<(Arc<Self>, Vec<NxTask<()>>)> {
        // Warm DB.
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
            .context("Could not connect to Postgres")?;
        let queue_pool = match &config.direct_url {
            Some(url) => Some(
                PgPoolOptions::new()
                    // Small dedicated session-mode pool for the queue.
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("Could not connect to DIRECT_URL")?,
            ),
            None => None,
        };
        let pg = Arc::new(PgStore::new(pool, queue_pool));
        pg.migrate().await.context("Migrations failed")?;
        info!("Postgres warmed");

        // Warm Redis. Connection failures here are tolerated (build
        // phases run without a Redis); the manager reconnects on demand.
        let redis = match RedisStore::connect(&config.redis_url).await {
            Ok(redis) => {
                if let Err(e) = redis.ping().await {
                    warn!("Redis ping failed (continuing): {e}");
                }
                info!("Redis warmed");
                Arc::new(redis)
            }
            Err(e) => {
                anyhow::bail!("Could not connect to Redis: {e}");
            }
        };

        // Warm search.
        let http = reqwest::Client::builder()
            .user_agent(format!("numio-{process}"))
            .build()
            .context("Could not build HTTP client")?;
        let index: Arc<dyn SearchIndex> = Arc::new(MeiliIndex::new(
            http.clone(),
            config.search_host.clone(),
            config.search_api_key.clone(),
        ));
        if let Err(e) = index.ensure_settings().await {
            warn!("Search settings push failed (continuing): {e}");
        } else {
            info!("Search warmed");
        }

        let backing = Backing {
            wallet: pg.clone(),
            activation: pg.clone(),
            number: pg.clone(),
            sms: pg.clone(),
            catalog: pg.clone(),
            provider: pg.clone(),
            webhook: pg.clone(),
            outbox: pg.clone(),
            queue: pg.clone(),
            audit_sink: pg.clone(),
            locks: redis.clone(),
            rate: redis.clone(),
            kv: redis.clone(),
            transport: redis.clone(),
        };

        Self::wire(config, process, http, index, backing, None).await
    }

    /// Test / local wiring: everything in memory. Pass a registry of
    /// stub adapters to script provider behavior.
    pub async fn with_memory_stores(
        config: &Config,
        store: Arc<MemStore>,
        index: Arc<dyn SearchIndex>,
        registry: Option<Arc<ProviderRegistry>>,
    ) -> anyhow::Result<(Arc<Self>, Vec<NxTask<()>>)> {
        let http = reqwest::Client::new();
        let backing = Backing {
            wallet: store.clone(),
            activation: store.clone(),
            number: store.clone(),
            sms: store.clone(),
            catalog: store.clone(),
            provider: store.clone(),
            webhook: store.clone(),
            outbox: store.clone(),
            queue: store.clone(),
            audit_sink: store.clone(),
            locks: store.clone(),
            rate: store.clone(),
            kv: store.clone(),
            transport: store.clone(),
        };
        Self::wire(config, "test", http, index, backing, registry).await
    }

    async fn wire(
        config: &Config,
        process: &'static str,
        http: reqwest::Client,
        index: Arc<dyn SearchIndex>,
        backing: Backing,
        registry_override: Option<Arc<ProviderRegistry>>,
    ) -> anyhow::Result<(Arc<Self>, Vec<NxTask<()>>)> {
        let shutdown = NotifyOnce::new();
        let mut tasks = Vec::new();

        // Metrics recorder; at most one per process.
        let metrics = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Metrics recorder not installed: {e}");
                None
            }
        };

        let (audit, audit_task) =
            AuditWriter::spawn(backing.audit_sink.clone(), shutdown.clone());
        tasks.push(audit_task);

        let registry = match registry_override {
            Some(registry) => registry,
            None => Arc::new(ProviderRegistry::build(
                backing.provider.list_active().await.map_err(|e| {
                    anyhow::anyhow!("Could not load providers: {e}")
                })?,
                http.clone(),
            )),
        };
        info!("Loaded {} provider adapters", registry.len());

        let token_authority =
            TokenAuthority::new(config.jwt_secret.as_bytes());
        let ledger = LedgerService::new(backing.wallet.clone());
        let publisher = EventPublisher::new(
            backing.transport.clone(),
            backing.kv.clone(),
            process,
        );
        let queue = JobQueue::new(backing.queue.clone(), audit.clone());

        let manager = ActivationManager::new(
            backing.activation.clone(),
            backing.number.clone(),
            backing.catalog.clone(),
            backing.sms.clone(),
            ledger.clone(),
            registry.clone(),
            publisher.clone(),
            audit.clone(),
        );

        let search =
            SearchService::new(index.clone(), backing.catalog.clone());

        let syncer = ProviderSyncer::new(
            backing.provider.clone(),
            backing.catalog.clone(),
            backing.outbox.clone(),
            registry.clone(),
            backing.rate.clone(),
            config.pricing.clone(),
            audit.clone(),
            config.provider_balance_watermark,
        );

        let poller = Arc::new(InboxPoller::new(
            backing.number.clone(),
            backing.sms.clone(),
            manager.clone(),
            registry.clone(),
            backing.locks.clone(),
            backing.rate.clone(),
            publisher.clone(),
            audit.clone(),
            shutdown.clone(),
        ));

        let outbox_dispatcher = Arc::new(OutboxDispatcher::new(
            backing.outbox.clone(),
            backing.catalog.clone(),
            index.clone(),
            backing.queue.clone(),
            audit.clone(),
            config.webhook_subscriber.clone(),
        ));

        let deliverer = Arc::new(NotificationDeliverer::new(
            http.clone(),
            queue.clone(),
        ));
        let master = Arc::new(MasterWorker::new(
            outbox_dispatcher.clone(),
            poller.clone(),
            deliverer,
            queue.clone(),
            backing.catalog.clone(),
            manager.clone(),
        ));

        let context = Arc::new(Self {
            token_authority,
            ledger,
            manager,
            search,
            syncer,
            poller,
            outbox_dispatcher,
            master,
            queue,
            publisher,
            registry,
            audit,
            shutdown,
            metrics,
            wallet_store: backing.wallet,
            activation_store: backing.activation,
            number_store: backing.number,
            sms_store: backing.sms,
            catalog: backing.catalog,
            provider_store: backing.provider,
            webhook_store: backing.webhook,
            outbox_store: backing.outbox,
            queue_store: backing.queue,
            locks: backing.locks,
            rate: backing.rate,
            kv: backing.kv,
            transport: backing.transport,
            index,
        });
        Ok((context, tasks))
    }
}
