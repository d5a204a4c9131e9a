//! The canonical Postgres store.
//!
//! One implementation of every relational seam trait over a shared
//! [`PgPool`]. Transactionality rules:
//!
//! - Ledger mutations run in one transaction holding the wallet row lock.
//! - Activation transitions are a single compare-state-and-set UPDATE,
//!   co-committing their outbox rows.
//! - Queue fetches use `FOR UPDATE SKIP LOCKED` so concurrent workers
//!   never double-claim.
//!
//! Timestamps are stored as unix-millisecond BIGINTs, money as NUMERIC.

use std::time::Duration;

use async_trait::async_trait;
use common::id::{
    ActivationId, CountryCode, IdempotencyKey, JobId, LedgerTxId, NumberId,
    OfferId, OutboxEventId, ProviderId, ReservationId, ServiceSlug, UserId,
};
use common::money::{Amount, SignedAmount};
use common::time::TimestampMs;
use numio_api_core::models::{
    CountryAggregateRow, ServiceAggregateRow, ServiceSort,
};
use numio_api_core::types::{
    ActivationState, NumberStatus, PageRequest, WalletTransaction,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::config_engine::ProviderConfig;
use crate::models::{
    Activation, ActivationPatch, AuditRecord, Job, JobState, NewOffer,
    NewOutboxEvent, Number, Offer, OfferReservation, OutboxEvent,
    ProviderCountry, ProviderService, ReservationState, SmsMessage,
    SyncStatus, Wallet, WebhookEvent,
};
use crate::traits::{
    ActivationStore, AuditSink, CatalogStore, LedgerApplied,
    LedgerMutation, NewActivation, NewNumber, NewSmsMessage, NumberStore,
    OutboxStats, OutboxStore, PollBookkeeping, ProviderStore, PublishOpts,
    QueueStatus, QueueStore, SmsStore, StoreError, WalletStore,
    WebhookStore,
};

pub struct PgStore {
    pool: PgPool,
    /// Small session-mode pool dedicated to queue maintenance
    /// (`DIRECT_URL`); falls back to the main pool when not configured.
    queue_pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool, queue_pool: Option<PgPool>) -> Self {
        let queue_pool = queue_pool.unwrap_or_else(|| pool.clone());
        Self { pool, queue_pool }
    }

    /// Applies the schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../migrations/0001_init.sql");
        // Naive statement split is fine: the schema contains no
        // procedural bodies.
        for statement in schema.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn append_outbox_tx(
        tx: &mut Transaction<'_, Postgres>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError> {
        let now = TimestampMs::now().as_i64();
        for event in events {
            sqlx::query(
                "INSERT INTO outbox_events \
                 (aggregate_type, aggregate_id, event_type, payload, \
                  created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&event.aggregate_type)
            .bind(&event.aggregate_id)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") =>
            StoreError::Conflict(db.message().to_owned()),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) =>
            StoreError::Unavailable(e.to_string()),
        _ => StoreError::Internal(e.to_string()),
    }
}

fn ts(ms: i64) -> Result<TimestampMs, StoreError> {
    TimestampMs::try_from_i64(ms).map_err(StoreError::internal)
}

fn amount(decimal: Decimal) -> Result<Amount, StoreError> {
    Amount::try_from_decimal(decimal).map_err(StoreError::internal)
}

fn parse_enum<T: serde::de::DeserializeOwned>(
    raw: &str,
) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_owned()))
        .map_err(StoreError::internal)
}

fn enum_str<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

// --- Row mappers --- //

fn map_tx(row: &PgRow) -> Result<WalletTransaction, StoreError> {
    let key: Option<String> =
        row.try_get("idempotency_key").map_err(db_err)?;
    Ok(WalletTransaction {
        id: LedgerTxId(row.try_get("id").map_err(db_err)?),
        user_id: UserId(row.try_get("user_id").map_err(db_err)?),
        amount: SignedAmount::from_decimal(
            row.try_get("amount").map_err(db_err)?,
        ),
        kind: parse_enum(row.try_get::<String, _>("kind").map_err(db_err)?.as_str())?,
        description: row.try_get("description").map_err(db_err)?,
        idempotency_key: key
            .map(IdempotencyKey::new)
            .transpose()
            .map_err(StoreError::internal)?,
        created_at: ts(row.try_get("created_at").map_err(db_err)?)?,
    })
}

fn map_activation(row: &PgRow) -> Result<Activation, StoreError> {
    let state: String = row.try_get("state").map_err(db_err)?;
    let key: Option<String> =
        row.try_get("idempotency_key").map_err(db_err)?;
    Ok(Activation {
        id: ActivationId(row.try_get("id").map_err(db_err)?),
        user_id: UserId(row.try_get("user_id").map_err(db_err)?),
        provider_id: ProviderId(row.try_get("provider_id").map_err(db_err)?),
        provider_slug: row.try_get("provider_slug").map_err(db_err)?,
        price: amount(row.try_get("price").map_err(db_err)?)?,
        idempotency_key: key
            .map(IdempotencyKey::new)
            .transpose()
            .map_err(StoreError::internal)?,
        reserved_tx: row
            .try_get::<Option<i64>, _>("reserved_tx")
            .map_err(db_err)?
            .map(LedgerTxId),
        captured_tx: row
            .try_get::<Option<i64>, _>("captured_tx")
            .map_err(db_err)?
            .map(LedgerTxId),
        refund_tx: row
            .try_get::<Option<i64>, _>("refund_tx")
            .map_err(db_err)?
            .map(LedgerTxId),
        state: parse_enum::<ActivationState>(&state)?,
        service: ServiceSlug::new(
            row.try_get::<String, _>("service").map_err(db_err)?,
        )
        .map_err(StoreError::internal)?,
        country: CountryCode::new(
            row.try_get::<String, _>("country").map_err(db_err)?,
        )
        .map_err(StoreError::internal)?,
        operator_id: row.try_get("operator_id").map_err(db_err)?,
        provider_activation_id: row
            .try_get("provider_activation_id")
            .map_err(db_err)?,
        phone_number: row.try_get("phone_number").map_err(db_err)?,
        expires_at: ts(row.try_get("expires_at").map_err(db_err)?)?,
        number_id: row
            .try_get::<Option<i64>, _>("number_id")
            .map_err(db_err)?
            .map(NumberId),
        reservation_id: row
            .try_get::<Option<i64>, _>("reservation_id")
            .map_err(db_err)?
            .map(ReservationId),
        created_at: ts(row.try_get("created_at").map_err(db_err)?)?,
        updated_at: ts(row.try_get("updated_at").map_err(db_err)?)?,
    })
}

fn map_number(row: &PgRow) -> Result<Number, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Number {
        id: NumberId(row.try_get("id").map_err(db_err)?),
        user_id: UserId(row.try_get("user_id").map_err(db_err)?),
        activation_id: ActivationId(
            row.try_get("activation_id").map_err(db_err)?,
        ),
        provider_id: ProviderId(row.try_get("provider_id").map_err(db_err)?),
        phone_number: row.try_get("phone_number").map_err(db_err)?,
        status: parse_enum::<NumberStatus>(&status)?,
        service: ServiceSlug::new(
            row.try_get::<String, _>("service").map_err(db_err)?,
        )
        .map_err(StoreError::internal)?,
        country: CountryCode::new(
            row.try_get::<String, _>("country").map_err(db_err)?,
        )
        .map_err(StoreError::internal)?,
        price: amount(row.try_get("price").map_err(db_err)?)?,
        expires_at: ts(row.try_get("expires_at").map_err(db_err)?)?,
        error_count: row
            .try_get::<i32, _>("error_count")
            .map_err(db_err)? as u32,
        next_poll_at: ts(row.try_get("next_poll_at").map_err(db_err)?)?,
        last_polled_at: row
            .try_get::<Option<i64>, _>("last_polled_at")
            .map_err(db_err)?
            .map(ts)
            .transpose()?,
        poll_count: row.try_get::<i32, _>("poll_count").map_err(db_err)?
            as u32,
        created_at: ts(row.try_get("created_at").map_err(db_err)?)?,
    })
}

fn map_offer(row: &PgRow) -> Result<Offer, StoreError> {
    Ok(Offer {
        id: OfferId(row.try_get("id").map_err(db_err)?),
        provider_id: ProviderId(row.try_get("provider_id").map_err(db_err)?),
        provider_slug: row.try_get("provider_slug").map_err(db_err)?,
        display_name: row.try_get("display_name").map_err(db_err)?,
        country: CountryCode::new(
            row.try_get::<String, _>("country").map_err(db_err)?,
        )
        .map_err(StoreError::internal)?,
        country_name: row.try_get("country_name").map_err(db_err)?,
        flag_url: row.try_get("flag_url").map_err(db_err)?,
        service: ServiceSlug::new(
            row.try_get::<String, _>("service").map_err(db_err)?,
        )
        .map_err(StoreError::internal)?,
        service_name: row.try_get("service_name").map_err(db_err)?,
        icon_url: row.try_get("icon_url").map_err(db_err)?,
        operator_id: row.try_get("operator_id").map_err(db_err)?,
        raw_cost: amount(row.try_get("raw_cost").map_err(db_err)?)?,
        sell_price: amount(row.try_get("sell_price").map_err(db_err)?)?,
        stock: row.try_get::<i64, _>("stock").map_err(db_err)?.max(0)
            as u64,
        deleted: row.try_get("deleted").map_err(db_err)?,
        last_sync_at: ts(row.try_get("last_sync_at").map_err(db_err)?)?,
        provider_priority: row
            .try_get::<i32, _>("provider_priority")
            .map_err(db_err)? as u32,
    })
}

fn map_job(row: &PgRow) -> Result<Job, StoreError> {
    let state: String = row.try_get("state").map_err(db_err)?;
    Ok(Job {
        id: JobId(row.try_get("id").map_err(db_err)?),
        queue: row.try_get("queue").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        state: parse_enum::<JobState>(&state)?,
        retry_count: row
            .try_get::<i32, _>("retry_count")
            .map_err(db_err)? as u32,
        start_after: ts(row.try_get("start_after").map_err(db_err)?)?,
        correlation_id: row
            .try_get::<Option<Uuid>, _>("correlation_id")
            .map_err(db_err)?,
        created_at: ts(row.try_get("created_at").map_err(db_err)?)?,
    })
}

// --- WalletStore --- //

#[async_trait]
impl WalletStore for PgStore {
    async fn wallet(&self, user_id: UserId) -> Result<Wallet, StoreError> {
        sqlx::query(
            "INSERT INTO wallets (user_id, balance, reserved, updated_at) \
             VALUES ($1, 0, 0, $2) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.0)
        .bind(TimestampMs::now().as_i64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            "SELECT user_id, balance, reserved, updated_at \
             FROM wallets WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Wallet {
            user_id,
            balance: amount(row.try_get("balance").map_err(db_err)?)?,
            reserved: amount(row.try_get("reserved").map_err(db_err)?)?,
            updated_at: ts(row.try_get("updated_at").map_err(db_err)?)?,
        })
    }

    async fn apply(
        &self,
        mutation: LedgerMutation,
    ) -> Result<LedgerApplied, StoreError> {
        // Ensure the wallet row exists before locking it.
        self.wallet(mutation.user_id).await?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Idempotent replay: the key is globally unique.
        if let Some(key) = &mutation.idempotency_key {
            let existing = sqlx::query(
                "SELECT * FROM wallet_transactions \
                 WHERE idempotency_key = $1",
            )
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if let Some(row) = existing {
                let stored = map_tx(&row)?;
                let wallet_row = sqlx::query(
                    "SELECT balance, reserved FROM wallets \
                     WHERE user_id = $1",
                )
                .bind(mutation.user_id.0)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                tx.commit().await.map_err(db_err)?;
                return Ok(LedgerApplied {
                    tx: stored,
                    balance: amount(
                        wallet_row.try_get("balance").map_err(db_err)?,
                    )?,
                    reserved: amount(
                        wallet_row.try_get("reserved").map_err(db_err)?,
                    )?,
                    replayed: true,
                });
            }
        }

        // Row lock serializes all ledger activity per wallet.
        let wallet_row = sqlx::query(
            "SELECT balance, reserved FROM wallets \
             WHERE user_id = $1 FOR UPDATE",
        )
        .bind(mutation.user_id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let balance =
            amount(wallet_row.try_get("balance").map_err(db_err)?)?;
        let reserved =
            amount(wallet_row.try_get("reserved").map_err(db_err)?)?;

        if let Some(required) = mutation.require_available {
            let available =
                balance.checked_sub(reserved).unwrap_or(Amount::ZERO);
            if available < required {
                return Err(StoreError::InsufficientFunds);
            }
        }

        let new_balance = balance
            .to_signed()
            .checked_add(mutation.amount)
            .and_then(|sum| sum.to_unsigned().ok())
            .ok_or_else(|| {
                StoreError::Conflict("Balance underflow".to_owned())
            })?;
        let new_reserved = reserved
            .to_signed()
            .checked_add(mutation.reserved_delta)
            .and_then(|sum| sum.to_unsigned().ok())
            .ok_or_else(|| {
                StoreError::Conflict("Reserved underflow".to_owned())
            })?;

        let now = TimestampMs::now().as_i64();
        let tx_row = sqlx::query(
            "INSERT INTO wallet_transactions \
             (user_id, amount, kind, description, idempotency_key, \
              created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING *",
        )
        .bind(mutation.user_id.0)
        .bind(mutation.amount.decimal())
        .bind(mutation.kind.as_str())
        .bind(&mutation.description)
        .bind(mutation.idempotency_key.as_ref().map(|k| k.as_str()))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "UPDATE wallets SET balance = $2, reserved = $3, \
             updated_at = $4 WHERE user_id = $1",
        )
        .bind(mutation.user_id.0)
        .bind(new_balance.decimal())
        .bind(new_reserved.decimal())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(LedgerApplied {
            tx: map_tx(&tx_row)?,
            balance: new_balance,
            reserved: new_reserved,
            replayed: false,
        })
    }

    async fn transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<(Vec<WalletTransaction>, u64), StoreError> {
        let page = page.clamped();
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM wallet_transactions WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let rows = sqlx::query(
            "SELECT * FROM wallet_transactions WHERE user_id = $1 \
             ORDER BY id DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id.0)
        .bind(page.limit as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows
            .iter()
            .map(map_tx)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, total.max(0) as u64))
    }

    async fn sum_ledger(
        &self,
        user_id: UserId,
    ) -> Result<SignedAmount, StoreError> {
        let sum: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(amount) FROM wallet_transactions \
             WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(SignedAmount::from_decimal(
            sum.unwrap_or(Decimal::ZERO),
        ))
    }
}

// --- ActivationStore --- //

#[async_trait]
impl ActivationStore for PgStore {
    async fn create(
        &self,
        new: NewActivation,
    ) -> Result<Activation, StoreError> {
        let now = TimestampMs::now().as_i64();
        let row = sqlx::query(
            "INSERT INTO activations \
             (user_id, provider_id, provider_slug, price, \
              idempotency_key, reserved_tx, state, service, country, \
              operator_id, expires_at, reservation_id, created_at, \
              updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 'RESERVED', $7, $8, $9, \
                     $10, $11, $12, $12) \
             RETURNING *",
        )
        .bind(new.user_id.0)
        .bind(new.provider_id.0)
        .bind(&new.provider_slug)
        .bind(new.price.decimal())
        .bind(new.idempotency_key.as_ref().map(|k| k.as_str()))
        .bind(new.reserved_tx.map(|t| t.0))
        .bind(new.service.as_str())
        .bind(new.country.as_str())
        .bind(&new.operator_id)
        .bind(new.expires_at.as_i64())
        .bind(new.reservation_id.map(|r| r.0))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        map_activation(&row)
    }

    async fn get(&self, id: ActivationId) -> Result<Activation, StoreError> {
        let row = sqlx::query("SELECT * FROM activations WHERE id = $1")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        map_activation(&row)
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> Result<Option<Activation>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM activations \
             WHERE user_id = $1 AND idempotency_key = $2",
        )
        .bind(user_id.0)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_activation).transpose()
    }

    async fn find_by_provider_ref(
        &self,
        provider_id: ProviderId,
        provider_activation_id: &str,
    ) -> Result<Option<Activation>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM activations \
             WHERE provider_id = $1 AND provider_activation_id = $2",
        )
        .bind(provider_id.0)
        .bind(provider_activation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_activation).transpose()
    }

    async fn transition(
        &self,
        id: ActivationId,
        from: ActivationState,
        to: ActivationState,
        patch: ActivationPatch,
        events: Vec<NewOutboxEvent>,
    ) -> Result<Activation, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Compare-state-and-set; zero rows means someone else won.
        let row = sqlx::query(
            "UPDATE activations SET \
               state = $3, \
               captured_tx = COALESCE($4, captured_tx), \
               refund_tx = COALESCE($5, refund_tx), \
               provider_activation_id = \
                   COALESCE($6, provider_activation_id), \
               phone_number = COALESCE($7, phone_number), \
               number_id = COALESCE($8, number_id), \
               expires_at = COALESCE($9, expires_at), \
               updated_at = $10 \
             WHERE id = $1 AND state = $2 \
             RETURNING *",
        )
        .bind(id.0)
        .bind(enum_str(&from))
        .bind(enum_str(&to))
        .bind(patch.captured_tx.map(|t| t.0))
        .bind(patch.refund_tx.map(|t| t.0))
        .bind(patch.provider_activation_id)
        .bind(patch.phone_number)
        .bind(patch.number_id.map(|n| n.0))
        .bind(patch.expires_at.map(|t| t.as_i64()))
        .bind(TimestampMs::now().as_i64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Err(StoreError::Conflict(format!(
                "Activation {id} is not {from:?}"
            )));
        };

        Self::append_outbox_tx(&mut tx, events).await?;
        tx.commit().await.map_err(db_err)?;
        map_activation(&row)
    }

    async fn list_refundable(
        &self,
        limit: usize,
    ) -> Result<Vec<Activation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM activations \
             WHERE state IN ('FAILED', 'CANCELLED', 'EXPIRED', 'TIMEOUT') \
             ORDER BY id ASC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_activation).collect()
    }

    async fn list_stale_reserved(
        &self,
        older_than: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Activation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM activations \
             WHERE state = 'RESERVED' AND created_at < $1 \
             ORDER BY id ASC LIMIT $2",
        )
        .bind(older_than.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_activation).collect()
    }
}

// --- NumberStore --- //

#[async_trait]
impl NumberStore for PgStore {
    async fn create(&self, new: NewNumber) -> Result<Number, StoreError> {
        let row = sqlx::query(
            "INSERT INTO numbers \
             (user_id, activation_id, provider_id, phone_number, status, \
              service, country, price, expires_at, next_poll_at, \
              created_at) \
             VALUES ($1, $2, $3, $4, 'active', $5, $6, $7, $8, $9, $10) \
             RETURNING *",
        )
        .bind(new.user_id.0)
        .bind(new.activation_id.0)
        .bind(new.provider_id.0)
        .bind(&new.phone_number)
        .bind(new.service.as_str())
        .bind(new.country.as_str())
        .bind(new.price.decimal())
        .bind(new.expires_at.as_i64())
        .bind(new.next_poll_at.as_i64())
        .bind(TimestampMs::now().as_i64())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        map_number(&row)
    }

    async fn get(&self, id: NumberId) -> Result<Number, StoreError> {
        let row = sqlx::query("SELECT * FROM numbers WHERE id = $1")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        map_number(&row)
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        status: Option<NumberStatus>,
        page: PageRequest,
    ) -> Result<(Vec<Number>, u64), StoreError> {
        let page = page.clamped();
        let status = status.map(|s| s.as_str().to_owned());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM numbers \
             WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2)",
        )
        .bind(user_id.0)
        .bind(&status)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let rows = sqlx::query(
            "SELECT * FROM numbers \
             WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY id DESC LIMIT $3 OFFSET $4",
        )
        .bind(user_id.0)
        .bind(&status)
        .bind(page.limit as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows
            .iter()
            .map(map_number)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, total.max(0) as u64))
    }

    async fn due_for_poll(
        &self,
        now: TimestampMs,
        slack: Duration,
        max_errors: u32,
        limit: usize,
    ) -> Result<Vec<Number>, StoreError> {
        let horizon = now.saturating_add(slack);
        let rows = sqlx::query(
            "SELECT * FROM numbers \
             WHERE status IN ('active', 'received') \
               AND error_count < $1 \
               AND expires_at > $2 \
               AND next_poll_at <= $3 \
             ORDER BY (status <> 'received'), created_at ASC, id ASC \
             LIMIT $4",
        )
        .bind(max_errors as i32)
        .bind(horizon.as_i64())
        .bind(now.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_number).collect()
    }

    async fn list_expired(
        &self,
        now: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Number>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM numbers \
             WHERE status IN ('active', 'received') AND expires_at <= $1 \
             ORDER BY id ASC LIMIT $2",
        )
        .bind(now.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_number).collect()
    }

    async fn record_poll(
        &self,
        id: NumberId,
        bookkeeping: PollBookkeeping,
    ) -> Result<Number, StoreError> {
        let status = bookkeeping.status.map(|s| s.as_str().to_owned());
        // Status changes are refused once terminal: the WHERE arm keeps
        // terminal rows untouched, surfacing a conflict below.
        let row = sqlx::query(
            "UPDATE numbers SET \
               status = COALESCE($2, status), \
               error_count = $3, \
               next_poll_at = $4, \
               last_polled_at = $5, \
               poll_count = $6 \
             WHERE id = $1 \
               AND ($2::TEXT IS NULL \
                    OR status IN ('active', 'received') \
                    OR status = $2) \
             RETURNING *",
        )
        .bind(id.0)
        .bind(&status)
        .bind(bookkeeping.error_count as i32)
        .bind(bookkeeping.next_poll_at.as_i64())
        .bind(bookkeeping.last_polled_at.as_i64())
        .bind(bookkeeping.poll_count as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => map_number(&row),
            None => Err(StoreError::Conflict(format!(
                "Number {id} is terminal"
            ))),
        }
    }
}

// --- SmsStore --- //

#[async_trait]
impl SmsStore for PgStore {
    async fn insert_batch(
        &self,
        messages: Vec<NewSmsMessage>,
        dedup_window: Duration,
    ) -> Result<Vec<SmsMessage>, StoreError> {
        let window_ms = dedup_window.as_millis() as i64;
        let mut inserted = Vec::new();

        for message in messages {
            // Composite-id uniqueness rides on the primary key; the
            // content-hash window check runs in the same statement.
            let row = sqlx::query(
                "INSERT INTO sms_messages \
                 (id, number_id, sender, content, code, confidence, \
                  received_at, content_hash, fingerprint) \
                 SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9 \
                 WHERE NOT EXISTS ( \
                     SELECT 1 FROM sms_messages \
                     WHERE number_id = $2 AND content_hash = $8 \
                       AND ABS(received_at - $7) <= $10) \
                 ON CONFLICT (id) DO NOTHING \
                 RETURNING *",
            )
            .bind(&message.id)
            .bind(message.number_id.0)
            .bind(&message.sender)
            .bind(&message.content)
            .bind(&message.code)
            .bind(message.confidence)
            .bind(message.received_at.as_i64())
            .bind(&message.content_hash)
            .bind(&message.fingerprint)
            .bind(window_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = row {
                inserted.push(map_sms(&row)?);
            }
        }
        Ok(inserted)
    }

    async fn list_for_number(
        &self,
        number_id: NumberId,
    ) -> Result<Vec<SmsMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sms_messages WHERE number_id = $1 \
             ORDER BY received_at ASC",
        )
        .bind(number_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_sms).collect()
    }

    async fn count_for_number(
        &self,
        number_id: NumberId,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sms_messages WHERE number_id = $1",
        )
        .bind(number_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count.max(0) as u64)
    }
}

fn map_sms(row: &PgRow) -> Result<SmsMessage, StoreError> {
    Ok(SmsMessage {
        id: row.try_get("id").map_err(db_err)?,
        number_id: NumberId(row.try_get("number_id").map_err(db_err)?),
        sender: row.try_get("sender").map_err(db_err)?,
        content: row.try_get("content").map_err(db_err)?,
        code: row.try_get("code").map_err(db_err)?,
        confidence: row.try_get("confidence").map_err(db_err)?,
        received_at: ts(row.try_get("received_at").map_err(db_err)?)?,
        content_hash: row.try_get("content_hash").map_err(db_err)?,
        fingerprint: row.try_get("fingerprint").map_err(db_err)?,
    })
}

// --- CatalogStore --- //

#[async_trait]
impl CatalogStore for PgStore {
    async fn upsert_offers(
        &self,
        provider_id: ProviderId,
        batch: Vec<NewOffer>,
        events: Vec<NewOutboxEvent>,
    ) -> Result<u64, StoreError> {
        let provider = sqlx::query(
            "SELECT slug, config->>'display_name' AS display_name, \
                    priority \
             FROM providers WHERE id = $1",
        )
        .bind(provider_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let (slug, display_name, priority) = match provider {
            Some(row) => (
                row.try_get::<String, _>("slug").map_err(db_err)?,
                row.try_get::<Option<String>, _>("display_name")
                    .map_err(db_err)?
                    .unwrap_or_default(),
                row.try_get::<i32, _>("priority").map_err(db_err)?,
            ),
            None => (format!("provider-{provider_id}"), String::new(), 100),
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = TimestampMs::now().as_i64();
        let mut written = 0u64;

        for offer in &batch {
            sqlx::query(
                "INSERT INTO provider_pricing \
                 (provider_id, provider_slug, display_name, country, \
                  country_name, flag_url, service, service_name, \
                  icon_url, operator_id, raw_cost, sell_price, stock, \
                  deleted, last_sync_at, provider_priority) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, \
                         $12, $13, FALSE, $14, $15) \
                 ON CONFLICT (provider_id, country, service, operator_id) \
                 DO UPDATE SET \
                   raw_cost = EXCLUDED.raw_cost, \
                   sell_price = EXCLUDED.sell_price, \
                   stock = EXCLUDED.stock, \
                   deleted = FALSE, \
                   country_name = EXCLUDED.country_name, \
                   service_name = EXCLUDED.service_name, \
                   flag_url = EXCLUDED.flag_url, \
                   icon_url = EXCLUDED.icon_url, \
                   last_sync_at = EXCLUDED.last_sync_at",
            )
            .bind(provider_id.0)
            .bind(&slug)
            .bind(&display_name)
            .bind(offer.country.as_str())
            .bind(&offer.country_name)
            .bind(&offer.flag_url)
            .bind(offer.service.as_str())
            .bind(&offer.service_name)
            .bind(&offer.icon_url)
            .bind(&offer.operator_id)
            .bind(offer.raw_cost.decimal())
            .bind(offer.sell_price.decimal())
            .bind(offer.stock as i64)
            .bind(now)
            .bind(priority)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            written += 1;
        }

        Self::append_outbox_tx(&mut tx, events).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(written)
    }

    async fn get_offer(&self, id: OfferId) -> Result<Offer, StoreError> {
        let row =
            sqlx::query("SELECT * FROM provider_pricing WHERE id = $1")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        map_offer(&row)
    }

    async fn list_offers(
        &self,
        provider_id: Option<ProviderId>,
        country: Option<&CountryCode>,
        include_deleted: bool,
    ) -> Result<Vec<Offer>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM provider_pricing \
             WHERE ($1::BIGINT IS NULL OR provider_id = $1) \
               AND ($2::TEXT IS NULL OR country = $2) \
               AND ($3 OR NOT deleted) \
             ORDER BY id ASC",
        )
        .bind(provider_id.map(|p| p.0))
        .bind(country.map(|c| c.as_str().to_owned()))
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_offer).collect()
    }

    async fn best_offer(
        &self,
        country: &CountryCode,
        service: &ServiceSlug,
        provider_slug: Option<&str>,
    ) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM provider_pricing \
             WHERE country = $1 AND service = $2 AND NOT deleted \
               AND stock > 0 \
               AND ($3::TEXT IS NULL OR provider_slug = $3) \
             ORDER BY sell_price ASC, provider_priority ASC, id ASC \
             LIMIT 1",
        )
        .bind(country.as_str())
        .bind(service.as_str())
        .bind(provider_slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(map_offer).transpose()
    }

    async fn reserve_stock(
        &self,
        offer_id: OfferId,
        quantity: u32,
        expires_at: TimestampMs,
        events: Vec<NewOutboxEvent>,
    ) -> Result<OfferReservation, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let updated = sqlx::query(
            "UPDATE provider_pricing SET stock = stock - $2 \
             WHERE id = $1 AND NOT deleted AND stock >= $2",
        )
        .bind(offer_id.0)
        .bind(quantity as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::InsufficientStock);
        }

        let row = sqlx::query(
            "INSERT INTO offer_reservations \
             (offer_id, state, quantity, expires_at, created_at) \
             VALUES ($1, 'PENDING', $2, $3, $4) RETURNING *",
        )
        .bind(offer_id.0)
        .bind(quantity as i32)
        .bind(expires_at.as_i64())
        .bind(TimestampMs::now().as_i64())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        Self::append_outbox_tx(&mut tx, events).await?;
        tx.commit().await.map_err(db_err)?;
        map_reservation(&row)
    }

    async fn confirm_reservation(
        &self,
        id: ReservationId,
        activation_id: ActivationId,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE offer_reservations \
             SET state = 'CONFIRMED', activation_id = $2 \
             WHERE id = $1 AND state = 'PENDING'",
        )
        .bind(id.0)
        .bind(activation_id.0)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "Reservation {id} is not PENDING"
            )));
        }
        Ok(())
    }

    async fn cancel_reservation(
        &self,
        id: ReservationId,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError> {
        self.finish_reservation(id, "PENDING", "CANCELLED", events)
            .await
            .and_then(|released| {
                if released {
                    Ok(())
                } else {
                    Err(StoreError::Conflict(format!(
                        "Reservation {id} is not PENDING"
                    )))
                }
            })
    }

    async fn get_reservation(
        &self,
        id: ReservationId,
    ) -> Result<OfferReservation, StoreError> {
        let row =
            sqlx::query("SELECT * FROM offer_reservations WHERE id = $1")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        map_reservation(&row)
    }

    async fn release_reservation(
        &self,
        id: ReservationId,
        events: Vec<NewOutboxEvent>,
    ) -> Result<bool, StoreError> {
        self.finish_reservation(id, "CONFIRMED", "EXPIRED", events)
            .await
    }

    async fn expire_pending_reservations(
        &self,
        now: TimestampMs,
        events: Vec<NewOutboxEvent>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            "UPDATE offer_reservations SET state = 'EXPIRED' \
             WHERE state = 'PENDING' AND expires_at <= $1 \
             RETURNING offer_id, quantity",
        )
        .bind(now.as_i64())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for row in &rows {
            let offer_id: i64 = row.try_get("offer_id").map_err(db_err)?;
            let quantity: i32 = row.try_get("quantity").map_err(db_err)?;
            sqlx::query(
                "UPDATE provider_pricing SET stock = stock + $2 \
                 WHERE id = $1",
            )
            .bind(offer_id)
            .bind(quantity as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if !rows.is_empty() {
            Self::append_outbox_tx(&mut tx, events).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    async fn prune_provider_offers(
        &self,
        provider_id: ProviderId,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query(
            "UPDATE provider_pricing SET deleted = TRUE \
             WHERE provider_id = $1 AND NOT deleted RETURNING id",
        )
        .bind(provider_id.0)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let events = rows
            .iter()
            .map(|row| -> Result<NewOutboxEvent, StoreError> {
                let id: i64 = row.try_get("id").map_err(db_err)?;
                Ok(NewOutboxEvent::new(
                    "offer",
                    id,
                    "offer.deleted",
                    serde_json::json!({ "offer_id": id }),
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::append_outbox_tx(&mut tx, events).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    async fn refresh_aggregates(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = TimestampMs::now().as_i64();

        sqlx::query("DELETE FROM service_aggregates")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO service_aggregates \
             (service_slug, service_name, icon_url, lowest_price, \
              total_stock, country_count, provider_count, \
              last_updated_at) \
             SELECT service, MIN(service_name), MIN(icon_url), \
                    MIN(sell_price), SUM(stock), \
                    COUNT(DISTINCT country), \
                    COUNT(DISTINCT provider_id), $1 \
             FROM provider_pricing \
             WHERE NOT deleted AND stock > 0 \
             GROUP BY service",
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM country_aggregates")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO country_aggregates \
             (service_slug, country_code, country_name, flag_url, \
              lowest_price, total_stock, provider_count) \
             SELECT service, country, MIN(country_name), MIN(flag_url), \
                    MIN(sell_price), SUM(stock), \
                    COUNT(DISTINCT provider_id) \
             FROM provider_pricing \
             WHERE NOT deleted AND stock > 0 \
             GROUP BY service, country",
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn service_aggregates(
        &self,
        sort: ServiceSort,
        page: PageRequest,
    ) -> Result<(Vec<ServiceAggregateRow>, u64), StoreError> {
        let page = page.clamped();
        let order = match sort {
            ServiceSort::Name => "service_name ASC",
            ServiceSort::Price => "lowest_price ASC",
            ServiceSort::Stock => "total_stock DESC",
        };

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM service_aggregates")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM service_aggregates \
             ORDER BY {order} LIMIT $1 OFFSET $2",
        ))
        .bind(page.limit as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let items = rows
            .iter()
            .map(map_service_aggregate)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, total.max(0) as u64))
    }

    async fn country_aggregates(
        &self,
        service: &ServiceSlug,
    ) -> Result<Vec<CountryAggregateRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM country_aggregates WHERE service_slug = $1 \
             ORDER BY lowest_price ASC",
        )
        .bind(service.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_country_aggregate).collect()
    }
}

impl PgStore {
    /// Shared body of cancel/release: move a reservation out of
    /// `from_state`, restoring its stock exactly once. Returns whether
    /// stock moved.
    async fn finish_reservation(
        &self,
        id: ReservationId,
        from_state: &str,
        to_state: &str,
        events: Vec<NewOutboxEvent>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "UPDATE offer_reservations SET state = $3 \
             WHERE id = $1 AND state = $2 \
             RETURNING offer_id, quantity",
        )
        .bind(id.0)
        .bind(from_state)
        .bind(to_state)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(false);
        };
        let offer_id: i64 = row.try_get("offer_id").map_err(db_err)?;
        let quantity: i32 = row.try_get("quantity").map_err(db_err)?;
        sqlx::query(
            "UPDATE provider_pricing SET stock = stock + $2 WHERE id = $1",
        )
        .bind(offer_id)
        .bind(quantity as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        Self::append_outbox_tx(&mut tx, events).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }
}

fn map_reservation(row: &PgRow) -> Result<OfferReservation, StoreError> {
    let state: String = row.try_get("state").map_err(db_err)?;
    Ok(OfferReservation {
        id: ReservationId(row.try_get("id").map_err(db_err)?),
        offer_id: OfferId(row.try_get("offer_id").map_err(db_err)?),
        activation_id: row
            .try_get::<Option<i64>, _>("activation_id")
            .map_err(db_err)?
            .map(ActivationId),
        state: parse_enum::<ReservationState>(&state)?,
        quantity: row.try_get::<i32, _>("quantity").map_err(db_err)?
            as u32,
        expires_at: ts(row.try_get("expires_at").map_err(db_err)?)?,
        created_at: ts(row.try_get("created_at").map_err(db_err)?)?,
    })
}

fn map_service_aggregate(
    row: &PgRow,
) -> Result<ServiceAggregateRow, StoreError> {
    Ok(ServiceAggregateRow {
        service_slug: ServiceSlug::new(
            row.try_get::<String, _>("service_slug").map_err(db_err)?,
        )
        .map_err(StoreError::internal)?,
        service_name: row.try_get("service_name").map_err(db_err)?,
        icon_url: row.try_get("icon_url").map_err(db_err)?,
        lowest_price: amount(
            row.try_get("lowest_price").map_err(db_err)?,
        )?,
        total_stock: row
            .try_get::<i64, _>("total_stock")
            .map_err(db_err)?
            .max(0) as u64,
        country_count: row
            .try_get::<i64, _>("country_count")
            .map_err(db_err)?
            .max(0) as u64,
        provider_count: row
            .try_get::<i64, _>("provider_count")
            .map_err(db_err)?
            .max(0) as u64,
        last_updated_at: ts(
            row.try_get("last_updated_at").map_err(db_err)?
        )?,
    })
}

fn map_country_aggregate(
    row: &PgRow,
) -> Result<CountryAggregateRow, StoreError> {
    Ok(CountryAggregateRow {
        country_code: CountryCode::new(
            row.try_get::<String, _>("country_code").map_err(db_err)?,
        )
        .map_err(StoreError::internal)?,
        country_name: row.try_get("country_name").map_err(db_err)?,
        flag_url: row.try_get("flag_url").map_err(db_err)?,
        lowest_price: amount(
            row.try_get("lowest_price").map_err(db_err)?,
        )?,
        total_stock: row
            .try_get::<i64, _>("total_stock")
            .map_err(db_err)?
            .max(0) as u64,
        provider_count: row
            .try_get::<i64, _>("provider_count")
            .map_err(db_err)?
            .max(0) as u64,
    })
}

// --- ProviderStore --- //

#[async_trait]
impl ProviderStore for PgStore {
    async fn list_active(&self) -> Result<Vec<ProviderConfig>, StoreError> {
        let rows = sqlx::query(
            "SELECT config FROM providers WHERE active \
             ORDER BY priority ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let config: serde_json::Value =
                    row.try_get("config").map_err(db_err)?;
                serde_json::from_value(config)
                    .map_err(StoreError::internal)
            })
            .collect()
    }

    async fn get_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<ProviderConfig>, StoreError> {
        let row =
            sqlx::query("SELECT config FROM providers WHERE slug = $1")
                .bind(slug)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(|row| {
            let config: serde_json::Value =
                row.try_get("config").map_err(db_err)?;
            serde_json::from_value(config).map_err(StoreError::internal)
        })
        .transpose()
    }

    async fn upsert_countries(
        &self,
        provider_id: ProviderId,
        rows: Vec<ProviderCountry>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO provider_countries \
                 (provider_id, external_id, code, name, flag_url, \
                  last_sync_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (provider_id, external_id) DO UPDATE SET \
                   code = EXCLUDED.code, name = EXCLUDED.name, \
                   flag_url = EXCLUDED.flag_url, \
                   last_sync_at = EXCLUDED.last_sync_at",
            )
            .bind(provider_id.0)
            .bind(&row.external_id)
            .bind(row.code.as_str())
            .bind(&row.name)
            .bind(&row.flag_url)
            .bind(row.last_sync_at.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn upsert_services(
        &self,
        provider_id: ProviderId,
        rows: Vec<ProviderService>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                "INSERT INTO provider_services \
                 (provider_id, external_id, slug, name, icon_url, \
                  last_sync_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (provider_id, external_id) DO UPDATE SET \
                   slug = EXCLUDED.slug, name = EXCLUDED.name, \
                   icon_url = EXCLUDED.icon_url, \
                   last_sync_at = EXCLUDED.last_sync_at",
            )
            .bind(provider_id.0)
            .bind(&row.external_id)
            .bind(row.slug.as_str())
            .bind(&row.name)
            .bind(&row.icon_url)
            .bind(row.last_sync_at.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn countries(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<ProviderCountry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM provider_countries WHERE provider_id = $1",
        )
        .bind(provider_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(ProviderCountry {
                    provider_id,
                    external_id: row
                        .try_get("external_id")
                        .map_err(db_err)?,
                    code: CountryCode::new(
                        row.try_get::<String, _>("code").map_err(db_err)?,
                    )
                    .map_err(StoreError::internal)?,
                    name: row.try_get("name").map_err(db_err)?,
                    flag_url: row.try_get("flag_url").map_err(db_err)?,
                    last_sync_at: ts(
                        row.try_get("last_sync_at").map_err(db_err)?
                    )?,
                })
            })
            .collect()
    }

    async fn services(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<ProviderService>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM provider_services WHERE provider_id = $1",
        )
        .bind(provider_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(ProviderService {
                    provider_id,
                    external_id: row
                        .try_get("external_id")
                        .map_err(db_err)?,
                    slug: ServiceSlug::new(
                        row.try_get::<String, _>("slug").map_err(db_err)?,
                    )
                    .map_err(StoreError::internal)?,
                    name: row.try_get("name").map_err(db_err)?,
                    icon_url: row.try_get("icon_url").map_err(db_err)?,
                    last_sync_at: ts(
                        row.try_get("last_sync_at").map_err(db_err)?
                    )?,
                })
            })
            .collect()
    }

    async fn set_sync_status(
        &self,
        provider_id: ProviderId,
        status: SyncStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE providers SET sync_status = $2, sync_error = $3 \
             WHERE id = $1",
        )
        .bind(provider_id.0)
        .bind(enum_str(&status))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_balance(
        &self,
        provider_id: ProviderId,
        balance: Amount,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE providers SET balance = $2, last_balance_sync = $3 \
             WHERE id = $1",
        )
        .bind(provider_id.0)
        .bind(balance.decimal())
        .bind(at.as_i64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_metadata_synced(
        &self,
        provider_id: ProviderId,
        at: TimestampMs,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE providers SET last_metadata_sync = $2 WHERE id = $1",
        )
        .bind(provider_id.0)
        .bind(at.as_i64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn last_metadata_sync(
        &self,
        provider_id: ProviderId,
    ) -> Result<Option<TimestampMs>, StoreError> {
        let value: Option<i64> = sqlx::query_scalar(
            "SELECT last_metadata_sync FROM providers WHERE id = $1",
        )
        .bind(provider_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .flatten();
        value.map(ts).transpose()
    }
}

// --- OutboxStore --- //

#[async_trait]
impl OutboxStore for PgStore {
    async fn append(
        &self,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::append_outbox_tx(&mut tx, events).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn fetch_unprocessed(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM outbox_events \
             WHERE NOT processed AND retry_count < $1 \
             ORDER BY id ASC LIMIT $2",
        )
        .bind(max_retries as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_outbox).collect()
    }

    async fn mark_processed(
        &self,
        ids: Vec<OutboxEventId>,
    ) -> Result<(), StoreError> {
        let ids: Vec<i64> = ids.into_iter().map(|id| id.0).collect();
        sqlx::query(
            "UPDATE outbox_events SET processed = TRUE, \
             processed_at = $2 WHERE id = ANY($1)",
        )
        .bind(&ids)
        .bind(TimestampMs::now().as_i64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: OutboxEventId,
        error: String,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_events \
             SET retry_count = retry_count + 1, error = $2 \
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn purge_processed(
        &self,
        older_than: TimestampMs,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM outbox_events \
             WHERE processed AND processed_at < $1",
        )
        .bind(older_than.as_i64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn stats(
        &self,
        max_retries: u32,
    ) -> Result<OutboxStats, StoreError> {
        let row = sqlx::query(
            "SELECT \
               COUNT(*) FILTER (WHERE NOT processed \
                                  AND retry_count < $1) AS pending, \
               COUNT(*) FILTER (WHERE NOT processed \
                                  AND retry_count >= $1) AS dlq, \
               MIN(created_at) FILTER (WHERE NOT processed \
                                         AND retry_count < $1) AS oldest \
             FROM outbox_events",
        )
        .bind(max_retries as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let pending: i64 = row.try_get("pending").map_err(db_err)?;
        let dlq: i64 = row.try_get("dlq").map_err(db_err)?;
        let oldest: Option<i64> = row.try_get("oldest").map_err(db_err)?;

        Ok(OutboxStats {
            pending_count: pending.max(0) as u64,
            oldest_pending_age: oldest
                .map(ts)
                .transpose()?
                .map(|at| {
                    TimestampMs::now().saturating_duration_since(at)
                }),
            dlq_count: dlq.max(0) as u64,
        })
    }
}

fn map_outbox(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    Ok(OutboxEvent {
        id: OutboxEventId(row.try_get("id").map_err(db_err)?),
        aggregate_type: row.try_get("aggregate_type").map_err(db_err)?,
        aggregate_id: row.try_get("aggregate_id").map_err(db_err)?,
        event_type: row.try_get("event_type").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        processed: row.try_get("processed").map_err(db_err)?,
        retry_count: row
            .try_get::<i32, _>("retry_count")
            .map_err(db_err)? as u32,
        processed_at: row
            .try_get::<Option<i64>, _>("processed_at")
            .map_err(db_err)?
            .map(ts)
            .transpose()?,
        error: row.try_get("error").map_err(db_err)?,
        created_at: ts(row.try_get("created_at").map_err(db_err)?)?,
    })
}

// --- WebhookStore --- //

#[async_trait]
impl WebhookStore for PgStore {
    async fn record(
        &self,
        event: WebhookEvent,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO webhook_events \
             (idempotency_key, provider_slug, payload, received_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(&event.idempotency_key)
        .bind(&event.provider_slug)
        .bind(&event.payload)
        .bind(event.received_at.as_i64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

// --- QueueStore --- //

#[async_trait]
impl QueueStore for PgStore {
    async fn publish(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: PublishOpts,
    ) -> Result<JobId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO jobs \
             (queue, payload, state, start_after, correlation_id, \
              created_at) \
             VALUES ($1, $2, 'pending', $3, $4, $5) RETURNING id",
        )
        .bind(queue)
        .bind(&payload)
        .bind(
            opts.start_after
                .unwrap_or_else(TimestampMs::now)
                .as_i64(),
        )
        .bind(opts.correlation_id)
        .bind(TimestampMs::now().as_i64())
        .fetch_one(&self.queue_pool)
        .await
        .map_err(db_err)?;
        Ok(JobId(id))
    }

    async fn fetch(
        &self,
        queue: &str,
        batch: usize,
        now: TimestampMs,
    ) -> Result<Vec<Job>, StoreError> {
        // SKIP LOCKED keeps concurrent workers from double-claiming.
        let rows = sqlx::query(
            "UPDATE jobs SET state = 'active' \
             WHERE id IN ( \
               SELECT id FROM jobs \
               WHERE queue = $1 AND state = 'pending' \
                 AND start_after <= $2 \
               ORDER BY id ASC LIMIT $3 \
               FOR UPDATE SKIP LOCKED) \
             RETURNING *",
        )
        .bind(queue)
        .bind(now.as_i64())
        .bind(batch as i64)
        .fetch_all(&self.queue_pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_job).collect()
    }

    async fn complete(&self, id: JobId) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET state = 'completed' WHERE id = $1")
            .bind(id.0)
            .execute(&self.queue_pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn fail(
        &self,
        id: JobId,
        error: String,
        retry_at: Option<TimestampMs>,
    ) -> Result<(), StoreError> {
        match retry_at {
            Some(at) => {
                sqlx::query(
                    "UPDATE jobs SET state = 'pending', \
                     retry_count = retry_count + 1, start_after = $2 \
                     WHERE id = $1",
                )
                .bind(id.0)
                .bind(at.as_i64())
                .execute(&self.queue_pool)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query(
                    "UPDATE jobs SET state = 'failed' WHERE id = $1",
                )
                .bind(id.0)
                .execute(&self.queue_pool)
                .await
                .map_err(db_err)?;
            }
        }
        // The error text rides in the audit trail; jobs keep only state.
        let _ = error;
        Ok(())
    }

    async fn status(&self, queue: &str) -> Result<QueueStatus, StoreError> {
        let row = sqlx::query(
            "SELECT \
               COUNT(*) FILTER (WHERE state = 'pending') AS pending, \
               COUNT(*) FILTER (WHERE state = 'active') AS active, \
               COUNT(*) FILTER (WHERE state = 'failed') AS failed \
             FROM jobs WHERE queue = $1",
        )
        .bind(queue)
        .fetch_one(&self.queue_pool)
        .await
        .map_err(db_err)?;

        Ok(QueueStatus {
            pending: row
                .try_get::<i64, _>("pending")
                .map_err(db_err)?
                .max(0) as u64,
            active: row
                .try_get::<i64, _>("active")
                .map_err(db_err)?
                .max(0) as u64,
            failed: row
                .try_get::<i64, _>("failed")
                .map_err(db_err)?
                .max(0) as u64,
        })
    }
}

// --- AuditSink --- //

#[async_trait]
impl AuditSink for PgStore {
    async fn write_batch(
        &self,
        records: Vec<AuditRecord>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for record in records {
            sqlx::query(
                "INSERT INTO audit_records (ts, category, subject, \
                 detail) VALUES ($1, $2, $3, $4)",
            )
            .bind(record.ts.as_i64())
            .bind(&record.category)
            .bind(&record.subject)
            .bind(&record.detail)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }
}
