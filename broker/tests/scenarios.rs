//! End-to-end scenarios driven through the app layer against the
//! in-memory stores, with a scripted provider standing in for the
//! upstream.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use broker::config::Config;
use broker::context::AppContext;
use broker::server::{AuthedUser, numbers, wallet};
use common::id::{CountryCode, IdempotencyKey, ProviderId, ServiceSlug, UserId};
use common::money::Amount;
use common::time::TimestampMs;
use numio_api::server::NxJson;
use numio_api_core::error::ErrorKind;
use numio_api_core::models::{PurchaseRequest, TopupRequest};
use numio_api_core::types::{
    ActivationState, NumberStatus, PageRequest, TxKind,
};
use numio_core::catalogue::PricingPolicy;
use numio_core::config_engine::mapping::{
    FieldRule, ResponseBody, ResponseMapping,
};
use numio_core::config_engine::{
    Acquired, AuthMode, Country, NormalizationMode, PriceRow, ProviderApi,
    ProviderConfig, ProviderError, ProviderRegistry, ServiceInfo,
    StatusPoll, UpstreamSms, UpstreamStatus, WebhookPayload,
    WebhookVerdict,
};
use numio_core::models::NewOffer;
use numio_core::search::memory::MemoryIndex;
use numio_core::store::memory::MemStore;
use numio_core::traits::{
    ActivationStore, CatalogStore, LockStore, NumberStore,
    PollBookkeeping, SmsStore, WalletStore,
};
use rust_decimal_macros::dec;
use serde_json::json;

// --- Scripted provider --- //

struct ScriptedProvider {
    config: ProviderConfig,
    acquisitions: Mutex<VecDeque<Result<Acquired, ProviderError>>>,
    statuses: Mutex<VecDeque<StatusPoll>>,
    status_calls: AtomicU32,
}

impl ScriptedProvider {
    fn config(slug: &str) -> ProviderConfig {
        ProviderConfig {
            id: ProviderId(1),
            slug: slug.to_owned(),
            display_name: "Provider One".to_owned(),
            base_url: "http://p1.test".to_owned(),
            auth: AuthMode::None,
            api_keys: vec![],
            endpoints: Default::default(),
            mappings: Default::default(),
            currency: "USD".to_owned(),
            price_multiplier: dec!(1),
            fixed_markup: Amount::ZERO,
            normalization: NormalizationMode::Direct,
            legacy_metadata: false,
            active: true,
            priority: 1,
            webhook_secret: None,
            webhook_allowed_ips: vec![],
            breaker_threshold: 5,
        }
    }
}

#[async_trait]
impl ProviderApi for ScriptedProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }
    async fn countries(&self) -> Result<Vec<Country>, ProviderError> {
        Ok(vec![])
    }
    async fn services(
        &self,
        _country: Option<&CountryCode>,
    ) -> Result<Vec<ServiceInfo>, ProviderError> {
        Ok(vec![])
    }
    async fn prices(
        &self,
        _country: Option<&CountryCode>,
        _service: Option<&ServiceSlug>,
    ) -> Result<Vec<PriceRow>, ProviderError> {
        Ok(vec![])
    }
    async fn acquire_number(
        &self,
        _country: &CountryCode,
        _service: &ServiceSlug,
        _operator: Option<&str>,
    ) -> Result<Acquired, ProviderError> {
        self.acquisitions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ProviderError::OutOfStock))
    }
    async fn status(&self, _id: &str) -> Result<StatusPoll, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StatusPoll {
                status: UpstreamStatus::Pending,
                messages: vec![],
            }))
    }
    async fn set_status(
        &self,
        _id: &str,
        _next: UpstreamStatus,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
    async fn cancel_number(&self, _id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
    async fn balance(&self) -> Result<Amount, ProviderError> {
        Ok(Amount::from_major(1000))
    }
    fn parse_webhook(
        &self,
        raw: &[u8],
    ) -> Result<WebhookPayload, ProviderError> {
        numio_core::webhook::parse_payload(raw)
            .map_err(|e| ProviderError::BadResponse(e.to_string()))
    }
    fn verify_webhook(
        &self,
        _raw_body: &[u8],
        _headers: &http::HeaderMap,
        _source_ip: IpAddr,
    ) -> WebhookVerdict {
        WebhookVerdict {
            valid: true,
            error: None,
            time_drift: None,
        }
    }
}

// --- Harness --- //

struct Env {
    store: Arc<MemStore>,
    ctx: Arc<AppContext>,
    provider: Arc<ScriptedProvider>,
}

fn test_config() -> Config {
    Config {
        database_url: String::new(),
        direct_url: None,
        redis_url: String::new(),
        search_host: String::new(),
        search_api_key: String::new(),
        jwt_secret: "test-jwt-secret".to_owned(),
        csrf_secret: "test-csrf-secret".to_owned(),
        encryption_key: [0u8; 32],
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        socket_bind_addr: "127.0.0.1:0".parse().unwrap(),
        pricing: PricingPolicy::default(),
        provider_balance_watermark: None,
        webhook_subscriber: None,
        icon_dir: None,
    }
}

async fn env_with(
    acquisitions: Vec<Result<Acquired, ProviderError>>,
    statuses: Vec<StatusPoll>,
) -> Env {
    let store = Arc::new(MemStore::new());
    let index = Arc::new(MemoryIndex::new());

    let provider = Arc::new(ScriptedProvider {
        config: ScriptedProvider::config("p1"),
        acquisitions: Mutex::new(acquisitions.into()),
        statuses: Mutex::new(statuses.into()),
        status_calls: AtomicU32::new(0),
    });
    store.put_provider_config(provider.config.clone());

    let mut registry = ProviderRegistry::empty();
    registry.insert("p1", provider.clone());

    let (ctx, _tasks) = AppContext::with_memory_stores(
        &test_config(),
        store.clone(),
        index,
        Some(Arc::new(registry)),
    )
    .await
    .unwrap();

    // Seed: offer (us, tg, default, price 100, stock 3).
    store
        .upsert_offers(
            ProviderId(1),
            vec![NewOffer {
                country: CountryCode::new("us").unwrap(),
                country_name: "United States".to_owned(),
                flag_url: None,
                service: ServiceSlug::new("tg").unwrap(),
                service_name: "Telegram".to_owned(),
                icon_url: None,
                operator_id: "default".to_owned(),
                raw_cost: Amount::from_major(80),
                sell_price: Amount::from_major(100),
                stock: 3,
            }],
            vec![],
        )
        .await
        .unwrap();

    // Seed: user u1 with balance 500.
    let env = Env {
        store,
        ctx,
        provider,
    };
    topup(&env, "seed", 500).await;
    env
}

const U1: UserId = UserId(1);

async fn topup(env: &Env, key: &str, amount: u64) {
    wallet::topup(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxJson(TopupRequest {
            amount: Amount::from_major(amount),
            idempotency_key: IdempotencyKey::new(key).unwrap(),
        }),
    )
    .await
    .unwrap();
}

fn purchase_request(key: &str) -> PurchaseRequest {
    PurchaseRequest {
        country_code: CountryCode::new("us").unwrap(),
        service_code: ServiceSlug::new("tg").unwrap(),
        provider_slug: None,
        idempotency_key: IdempotencyKey::new(key).unwrap(),
    }
}

fn ok_number() -> Result<Acquired, ProviderError> {
    Ok(Acquired {
        activation_id: "A1".to_owned(),
        phone_number: "+15551230000".to_owned(),
        price: None,
    })
}

async fn offer_stock(env: &Env) -> u64 {
    env.store
        .get_offer(common::id::OfferId(1))
        .await
        .unwrap()
        .stock
}

async fn make_due_for_poll(env: &Env, number_id: common::id::NumberId) {
    let number =
        NumberStore::get(env.store.as_ref(), number_id).await.unwrap();
    env.store
        .record_poll(
            number_id,
            PollBookkeeping {
                status: None,
                error_count: number.error_count,
                next_poll_at: TimestampMs::MIN,
                last_polled_at: TimestampMs::now(),
                poll_count: number.poll_count,
            },
        )
        .await
        .unwrap();
}

// --- Scenarios --- //

/// Happy-path purchase: reserve, acquire, capture.
#[tokio::test]
async fn happy_path_purchase() {
    let env = env_with(vec![ok_number()], vec![]).await;

    let response = numbers::purchase(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxJson(purchase_request("k1")),
    )
    .await
    .unwrap();
    let view = &response.0.number;
    assert_eq!(view.phone_number, "+15551230000");
    assert_eq!(view.status, NumberStatus::Active);
    assert_eq!(view.activation_state, ActivationState::Active);

    let balance = wallet::balance(State(env.ctx.clone()), AuthedUser(U1))
        .await
        .unwrap();
    assert_eq!(balance.0.balance, Amount::from_major(400));
    assert_eq!(balance.0.reserved, Amount::ZERO);

    assert_eq!(offer_stock(&env).await, 2);
    let offer_updates = env
        .store
        .outbox_rows()
        .into_iter()
        .filter(|e| e.event_type == "offer.updated")
        .count();
    assert_eq!(offer_updates, 1);
}

/// Replaying the same idempotency key changes nothing.
#[tokio::test]
async fn idempotent_replay() {
    let env = env_with(vec![ok_number()], vec![]).await;

    let first = numbers::purchase(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxJson(purchase_request("k1")),
    )
    .await
    .unwrap();
    let ledger_before = env
        .store
        .transactions(U1, PageRequest::default())
        .await
        .unwrap()
        .1;

    let replay = numbers::purchase(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxJson(purchase_request("k1")),
    )
    .await
    .unwrap();
    assert_eq!(replay.0.number.id, first.0.number.id);
    assert_eq!(replay.0.number.phone_number, first.0.number.phone_number);

    let ledger_after = env
        .store
        .transactions(U1, PageRequest::default())
        .await
        .unwrap()
        .1;
    assert_eq!(ledger_before, ledger_after);
    assert_eq!(offer_stock(&env).await, 2);
}

/// Out of stock rejects before any money moves.
#[tokio::test]
async fn out_of_stock() {
    let env = env_with(vec![], vec![]).await;
    // Drain stock.
    let offer = env
        .store
        .get_offer(common::id::OfferId(1))
        .await
        .unwrap();
    env.store
        .reserve_stock(offer.id, 3, TimestampMs::MAX, vec![])
        .await
        .unwrap();

    let err = numbers::purchase(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxJson(purchase_request("k1")),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::OutOfStock);

    // Only the seed topup in the ledger; balance untouched.
    let (rows, total) = env
        .store
        .transactions(U1, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].kind, TxKind::Topup);
    let balance = wallet::balance(State(env.ctx.clone()), AuthedUser(U1))
        .await
        .unwrap();
    assert_eq!(balance.0.balance, Amount::from_major(500));
}

/// The poller ingests a received SMS and reconciles state.
#[tokio::test]
async fn sms_received_reconciles_state() {
    let env = env_with(
        vec![ok_number()],
        vec![StatusPoll {
            status: UpstreamStatus::Received,
            messages: vec![UpstreamSms {
                id: "m1".to_owned(),
                sender: "TG".to_owned(),
                text: "Your code is 842193".to_owned(),
                received_at: None,
            }],
        }],
    )
    .await;

    let purchased = numbers::purchase(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxJson(purchase_request("k1")),
    )
    .await
    .unwrap();
    let number_id = purchased.0.number.id;
    let activation_id = purchased.0.number.activation_id;

    make_due_for_poll(&env, number_id).await;
    let outcome = env.ctx.poller.tick().await.unwrap();
    assert_eq!(outcome.polled, 1);
    assert_eq!(outcome.messages_ingested, 1);

    // Message persisted with the extracted code.
    let messages = env.store.list_for_number(number_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].code.as_deref(), Some("842193"));
    assert!(messages[0].confidence.unwrap() >= 0.8);

    // Number and activation both moved to received.
    let number =
        NumberStore::get(env.store.as_ref(), number_id).await.unwrap();
    assert_eq!(number.status, NumberStatus::Received);
    let activation =
        ActivationStore::get(env.store.as_ref(), activation_id)
            .await
            .unwrap();
    assert_eq!(activation.state, ActivationState::Received);

    // Funds were captured at acquisition.
    assert!(activation.captured_tx.is_some());
    let (rows, _) = env
        .store
        .transactions(U1, PageRequest::default())
        .await
        .unwrap();
    assert!(rows.iter().any(|tx| tx.kind == TxKind::ActivationCommit));

    // And the fan-out reached the user's room.
    let events = env.store.published_events();
    let sms_events: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "sms.received")
        .collect();
    assert_eq!(sms_events.len(), 1);
    assert_eq!(sms_events[0].room, "user:1");
}

/// Expiry with an empty inbox refunds the wallet and restores stock.
#[tokio::test]
async fn expiry_refunds() {
    let env = env_with(vec![ok_number()], vec![]).await;

    let purchased = numbers::purchase(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxJson(purchase_request("k1")),
    )
    .await
    .unwrap();
    let number_id = purchased.0.number.id;
    let activation_id = purchased.0.number.activation_id;

    // Clock passes expires_at; the cleanup tick runs.
    let processed = env
        .ctx
        .manager
        .expire_due(TimestampMs::MAX, 10)
        .await
        .unwrap();
    assert_eq!(processed, 1);

    let number =
        NumberStore::get(env.store.as_ref(), number_id).await.unwrap();
    assert_eq!(number.status, NumberStatus::Expired);
    let activation =
        ActivationStore::get(env.store.as_ref(), activation_id)
            .await
            .unwrap();
    assert_eq!(activation.state, ActivationState::Refunded);

    let balance = wallet::balance(State(env.ctx.clone()), AuthedUser(U1))
        .await
        .unwrap();
    assert_eq!(balance.0.balance, Amount::from_major(500));
    assert_eq!(offer_stock(&env).await, 3);

    // Outbox trail: the stock restore and the refund.
    let outbox = env.store.outbox_rows();
    assert!(
        outbox
            .iter()
            .filter(|e| e.event_type == "offer.updated")
            .count()
            >= 2
    );
    assert!(outbox.iter().any(|e| e.event_type == "activation.refunded"));

    // Audit trail includes the lifecycle step.
    env.ctx.shutdown.send();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let audits = env.store.audit_records();
    assert!(audits.iter().any(|a| a.category == "lifecycle"));
}

/// Response-mapping determinism on the classic nested price dictionary.
#[test]
fn response_mapping_determinism() {
    let mapping = ResponseMapping::JsonDictionary {
        depth: None,
        fields: [
            ("country", "$parentKey"),
            ("service", "$key"),
            ("cost", "price"),
            ("count", "count"),
        ]
        .into_iter()
        .map(|(name, rule)| {
            (name.to_owned(), rule.parse::<FieldRule>().unwrap())
        })
        .collect(),
    };
    let body = ResponseBody::Json(json!({
        "us": {
            "tg": {"price": 1.5, "count": 10},
            "wa": {"price": 2.0, "count": 5},
        }
    }));

    let rows = mapping.eval(&body).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["country"], "us");
    assert_eq!(rows[0]["service"], "tg");
    assert_eq!(rows[0]["cost"], json!(1.5));
    assert_eq!(rows[0]["count"], json!(10));
    assert_eq!(rows[1]["country"], "us");
    assert_eq!(rows[1]["service"], "wa");
    assert_eq!(rows[1]["cost"], json!(2.0));
    assert_eq!(rows[1]["count"], json!(5));
}

/// A held poll lock means the poller never calls upstream.
#[tokio::test]
async fn poll_lock_exclusivity() {
    let env = env_with(vec![ok_number()], vec![]).await;
    let purchased = numbers::purchase(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxJson(purchase_request("k1")),
    )
    .await
    .unwrap();
    let number_id = purchased.0.number.id;
    make_due_for_poll(&env, number_id).await;

    // Someone else holds the number's lock.
    let guard = env
        .store
        .try_acquire(
            &format!("poll:lock:{number_id}"),
            std::time::Duration::from_secs(60),
        )
        .await
        .unwrap()
        .unwrap();

    let outcome = env.ctx.poller.tick().await.unwrap();
    assert_eq!(outcome.polled, 0);
    assert_eq!(outcome.skipped_locked, 1);
    assert_eq!(env.provider.status_calls.load(Ordering::SeqCst), 0);

    // Released: the next tick polls exactly once.
    env.store.release(guard).await.unwrap();
    make_due_for_poll(&env, number_id).await;
    let outcome = env.ctx.poller.tick().await.unwrap();
    assert_eq!(outcome.polled, 1);
    assert_eq!(env.provider.status_calls.load(Ordering::SeqCst), 1);
}

/// The numbers listing and SMS endpoints agree with the poller's work.
#[tokio::test]
async fn listing_and_sms_endpoints() {
    let env = env_with(
        vec![ok_number()],
        vec![StatusPoll {
            status: UpstreamStatus::Received,
            messages: vec![UpstreamSms {
                id: "m1".to_owned(),
                sender: "TG".to_owned(),
                text: "Your code is 842193".to_owned(),
                received_at: None,
            }],
        }],
    )
    .await;

    let purchased = numbers::purchase(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxJson(purchase_request("k1")),
    )
    .await
    .unwrap();
    let number_id = purchased.0.number.id;
    make_due_for_poll(&env, number_id).await;
    env.ctx.poller.tick().await.unwrap();

    use numio_api::server::NxQuery;
    let page = numbers::my_numbers(
        State(env.ctx.clone()),
        AuthedUser(U1),
        NxQuery(numio_api_core::models::MyNumbersParams::default()),
    )
    .await
    .unwrap();
    assert_eq!(page.0.total, 1);
    assert_eq!(page.0.numbers[0].status, NumberStatus::Received);

    let sms = numbers::sms_for_number(
        State(env.ctx.clone()),
        AuthedUser(U1),
        axum::extract::Path(number_id.to_i64()),
    )
    .await
    .unwrap();
    assert_eq!(sms.0.messages.len(), 1);
    assert_eq!(sms.0.messages[0].code.as_deref(), Some("842193"));

    // Another user can't see it.
    let err = numbers::detail(
        State(env.ctx.clone()),
        AuthedUser(UserId(2)),
        axum::extract::Path(number_id.to_i64()),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}
