//! Ledger-backed wallet operations.
//!
//! The ledger is append-only; a wallet's balance is `Σ amounts` over its
//! rows. Every operation here compiles down to exactly one
//! [`LedgerMutation`], which the store applies atomically under the
//! wallet row lock. Reservation bookkeeping:
//!
//! - `reserve` appends a negative `activation_reserve` row *and* bumps
//!   `reserved`, so held funds are excluded from the available balance on
//!   both axes until settled.
//! - `commit` clears `reserved` and pins the debit with a zero-amount
//!   `activation_commit` row (the money already left at reserve time;
//!   the row is the audit anchor for the capture).
//! - `rollback` is the exact inverse of `reserve`.
//! - `refund` credits the wallet back after a voided activation.

use std::sync::Arc;

use common::id::{ActivationId, IdempotencyKey, UserId};
use common::money::{Amount, SignedAmount};
use numio_api_core::error::{ApiError, ErrorKind};
use numio_api_core::types::{PageRequest, TxKind, WalletTransaction};
use tracing::instrument;

use crate::models::Wallet;
use crate::traits::{LedgerApplied, LedgerMutation, StoreError, WalletStore};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Amount must be positive")]
    NonPositiveAmount,
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Idempotency key reused with a different request")]
    IdempotencyMismatch,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InsufficientFunds => Self::InsufficientFunds,
            other => Self::Store(other),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NonPositiveAmount =>
                ApiError::new(ErrorKind::ValidationInvalid, e.to_string()),
            LedgerError::InsufficientFunds =>
                ApiError::new(ErrorKind::InsufficientFunds, ""),
            LedgerError::IdempotencyMismatch =>
                ApiError::new(ErrorKind::IdempotencyMismatch, ""),
            LedgerError::Store(StoreError::NotFound) =>
                ApiError::new(ErrorKind::NotFound, "No such wallet"),
            LedgerError::Store(store) =>
                ApiError::new(ErrorKind::WalletTxFailed, store.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct LedgerService {
    wallet_store: Arc<dyn WalletStore>,
}

impl LedgerService {
    pub fn new(wallet_store: Arc<dyn WalletStore>) -> Self {
        Self { wallet_store }
    }

    pub async fn wallet(
        &self,
        user_id: UserId,
    ) -> Result<Wallet, LedgerError> {
        Ok(self.wallet_store.wallet(user_id).await?)
    }

    pub async fn transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<(Vec<WalletTransaction>, u64), LedgerError> {
        Ok(self.wallet_store.transactions(user_id, page).await?)
    }

    /// Appends a positive row.
    #[instrument(skip(self), name = "(ledger-credit)")]
    pub async fn credit(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: TxKind,
        description: &str,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<LedgerApplied, LedgerError> {
        ensure_positive(amount)?;
        self.apply_checked(LedgerMutation {
            user_id,
            amount: amount.to_signed(),
            kind,
            description: description.to_owned(),
            idempotency_key,
            reserved_delta: SignedAmount::ZERO,
            require_available: None,
        })
        .await
    }

    /// Appends a negative row; fails with
    /// [`LedgerError::InsufficientFunds`] when
    /// `balance - reserved < amount`.
    #[instrument(skip(self), name = "(ledger-debit)")]
    pub async fn debit(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: TxKind,
        description: &str,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<LedgerApplied, LedgerError> {
        ensure_positive(amount)?;
        self.apply_checked(LedgerMutation {
            user_id,
            amount: amount.to_signed_neg(),
            kind,
            description: description.to_owned(),
            idempotency_key,
            reserved_delta: SignedAmount::ZERO,
            require_available: Some(amount),
        })
        .await
    }

    /// Holds funds for an activation: negative `activation_reserve` row
    /// plus a matching `reserved` increment.
    #[instrument(skip(self), name = "(ledger-reserve)")]
    pub async fn reserve(
        &self,
        user_id: UserId,
        amount: Amount,
        description: &str,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<LedgerApplied, LedgerError> {
        ensure_positive(amount)?;
        self.apply_checked(LedgerMutation {
            user_id,
            amount: amount.to_signed_neg(),
            kind: TxKind::ActivationReserve,
            description: description.to_owned(),
            idempotency_key,
            reserved_delta: amount.to_signed(),
            require_available: Some(amount),
        })
        .await
    }

    /// Clears the reservation and makes the debit permanent. Idempotent
    /// on `idempotency_key`.
    #[instrument(skip(self), name = "(ledger-commit)")]
    pub async fn commit(
        &self,
        user_id: UserId,
        amount: Amount,
        activation_id: ActivationId,
        idempotency_key: IdempotencyKey,
    ) -> Result<LedgerApplied, LedgerError> {
        ensure_positive(amount)?;
        self.apply_checked(LedgerMutation {
            user_id,
            // The balance moved at reserve time; this row anchors the
            // capture in the audit trail.
            amount: SignedAmount::ZERO,
            kind: TxKind::ActivationCommit,
            description: format!("Capture for activation {activation_id}"),
            idempotency_key: Some(idempotency_key),
            reserved_delta: amount.to_signed_neg(),
            require_available: None,
        })
        .await
    }

    /// Inverse of [`reserve`](Self::reserve): positive row restoring the
    /// balance, `reserved` decremented.
    #[instrument(skip(self), name = "(ledger-rollback)")]
    pub async fn rollback(
        &self,
        user_id: UserId,
        amount: Amount,
        activation_id: ActivationId,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<LedgerApplied, LedgerError> {
        ensure_positive(amount)?;
        self.apply_checked(LedgerMutation {
            user_id,
            amount: amount.to_signed(),
            kind: TxKind::ActivationReserve,
            description: format!(
                "Rollback reserve for activation {activation_id}"
            ),
            idempotency_key,
            reserved_delta: amount.to_signed_neg(),
            require_available: None,
        })
        .await
    }

    /// Credits the wallet for a voided activation.
    #[instrument(skip(self), name = "(ledger-refund)")]
    pub async fn refund(
        &self,
        user_id: UserId,
        amount: Amount,
        activation_id: ActivationId,
        idempotency_key: IdempotencyKey,
    ) -> Result<LedgerApplied, LedgerError> {
        ensure_positive(amount)?;
        self.apply_checked(LedgerMutation {
            user_id,
            amount: amount.to_signed(),
            kind: TxKind::Refund,
            description: format!("Refund for activation {activation_id}"),
            idempotency_key: Some(idempotency_key),
            reserved_delta: SignedAmount::ZERO,
            require_available: None,
        })
        .await
    }

    /// Applies the mutation, enforcing that an idempotent replay actually
    /// matches the stored row (a reused key with a different amount or
    /// kind is a caller bug, surfaced as a conflict).
    async fn apply_checked(
        &self,
        mutation: LedgerMutation,
    ) -> Result<LedgerApplied, LedgerError> {
        let expect_amount = mutation.amount;
        let expect_kind = mutation.kind;
        let applied = self.wallet_store.apply(mutation).await?;
        if applied.replayed
            && (applied.tx.amount != expect_amount
                || applied.tx.kind != expect_kind)
        {
            return Err(LedgerError::IdempotencyMismatch);
        }
        Ok(applied)
    }
}

/// Reservations settle through commit/rollback; the commit row itself is
/// zero, so "positive" here means the *operation* amount.
fn ensure_positive(amount: Amount) -> Result<(), LedgerError> {
    if amount.is_zero() {
        Err(LedgerError::NonPositiveAmount)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use proptest::collection::vec;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::store::memory::MemStore;

    fn service() -> (Arc<MemStore>, LedgerService) {
        let store = Arc::new(MemStore::new());
        let ledger = LedgerService::new(store.clone());
        (store, ledger)
    }

    fn amt(v: rust_decimal::Decimal) -> Amount {
        Amount::try_from_decimal(v).unwrap()
    }

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::new(s).unwrap()
    }

    async fn audit(store: &Arc<MemStore>, user: UserId) {
        let wallet = store.wallet(user).await.unwrap();
        let sum = store.sum_ledger(user).await.unwrap();
        assert_eq!(
            wallet.balance.to_signed(),
            sum,
            "balance != Σ ledger",
        );
    }

    #[tokio::test]
    async fn reserve_commit_flow() {
        let (store, ledger) = service();
        let user = UserId(1);

        ledger
            .credit(user, amt(dec!(500)), TxKind::Topup, "seed", None)
            .await
            .unwrap();

        let reserved = ledger
            .reserve(user, amt(dec!(100)), "activation", None)
            .await
            .unwrap();
        assert_eq!(reserved.balance, amt(dec!(400)));
        assert_eq!(reserved.reserved, amt(dec!(100)));
        audit(&store, user).await;

        let committed = ledger
            .commit(user, amt(dec!(100)), ActivationId(7), key("c1"))
            .await
            .unwrap();
        assert_eq!(committed.balance, amt(dec!(400)));
        assert_eq!(committed.reserved, Amount::ZERO);
        audit(&store, user).await;
    }

    #[tokio::test]
    async fn reserve_rollback_restores() {
        let (store, ledger) = service();
        let user = UserId(1);
        ledger
            .credit(user, amt(dec!(500)), TxKind::Topup, "seed", None)
            .await
            .unwrap();
        ledger
            .reserve(user, amt(dec!(120)), "activation", None)
            .await
            .unwrap();

        let rolled = ledger
            .rollback(user, amt(dec!(120)), ActivationId(7), None)
            .await
            .unwrap();
        assert_eq!(rolled.balance, amt(dec!(500)));
        assert_eq!(rolled.reserved, Amount::ZERO);
        audit(&store, user).await;
    }

    #[tokio::test]
    async fn insufficient_funds() {
        let (_store, ledger) = service();
        let user = UserId(1);
        ledger
            .credit(user, amt(dec!(50)), TxKind::Topup, "seed", None)
            .await
            .unwrap();

        let err = ledger
            .reserve(user, amt(dec!(100)), "activation", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds));

        // Reserved funds also count against availability.
        ledger
            .reserve(user, amt(dec!(30)), "activation", None)
            .await
            .unwrap();
        let err = ledger
            .debit(user, amt(dec!(15)), TxKind::ManualAdjust, "adj", None)
            .await
            .unwrap_err();
        // balance 20, reserved 30 => available 0.
        assert!(matches!(err, LedgerError::InsufficientFunds));
    }

    #[tokio::test]
    async fn idempotent_replay_returns_stored_row() {
        let (store, ledger) = service();
        let user = UserId(1);

        let first = ledger
            .credit(
                user,
                amt(dec!(500)),
                TxKind::Topup,
                "topup",
                Some(key("t1")),
            )
            .await
            .unwrap();
        assert!(!first.replayed);

        let replay = ledger
            .credit(
                user,
                amt(dec!(500)),
                TxKind::Topup,
                "topup",
                Some(key("t1")),
            )
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.tx.id, first.tx.id);
        assert_eq!(replay.balance, amt(dec!(500)));

        // Exactly one row exists.
        let (txs, total) = store
            .transactions(user, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(txs.len(), 1);

        // Same key, different amount: conflict.
        let err = ledger
            .credit(
                user,
                amt(dec!(999)),
                TxKind::Topup,
                "topup",
                Some(key("t1")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyMismatch));
    }

    /// Wallet integrity: `balance == Σ ledger` after any sequence of
    /// operations, whatever subset of them succeeds.
    #[test]
    fn balance_always_equals_ledger_sum() {
        #[derive(Clone, Debug)]
        enum Op {
            Credit(u32),
            Debit(u32),
            Reserve(u32),
            Commit,
            Rollback,
            Refund(u32),
        }

        let op_strategy = prop_oneof![
            (1u32..500).prop_map(Op::Credit),
            (1u32..500).prop_map(Op::Debit),
            (1u32..500).prop_map(Op::Reserve),
            Just(Op::Commit),
            Just(Op::Rollback),
            (1u32..500).prop_map(Op::Refund),
        ];

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        proptest!(ProptestConfig::with_cases(64), |(
            ops in vec(op_strategy, 1..40),
        )| {
            runtime.block_on(async {
                let (store, ledger) = service();
                let user = UserId(1);
                // Track our own view of outstanding reservations so
                // commit/rollback amounts are sensible.
                let mut outstanding: Vec<Amount> = Vec::new();
                let mut counter = 0u32;

                for op in ops {
                    counter += 1;
                    let k = key(&format!("k{counter}"));
                    match op {
                        Op::Credit(v) => {
                            let _ = ledger
                                .credit(
                                    user,
                                    amt(v.into()),
                                    TxKind::Topup,
                                    "t",
                                    Some(k),
                                )
                                .await;
                        }
                        Op::Debit(v) => {
                            let _ = ledger
                                .debit(
                                    user,
                                    amt(v.into()),
                                    TxKind::ManualAdjust,
                                    "d",
                                    Some(k),
                                )
                                .await;
                        }
                        Op::Reserve(v) => {
                            if ledger
                                .reserve(user, amt(v.into()), "r", Some(k))
                                .await
                                .is_ok()
                            {
                                outstanding.push(amt(v.into()));
                            }
                        }
                        Op::Commit =>
                            if let Some(v) = outstanding.pop() {
                                ledger
                                    .commit(user, v, ActivationId(1), k)
                                    .await
                                    .unwrap();
                            },
                        Op::Rollback =>
                            if let Some(v) = outstanding.pop() {
                                ledger
                                    .rollback(
                                        user,
                                        v,
                                        ActivationId(1),
                                        Some(k),
                                    )
                                    .await
                                    .unwrap();
                            },
                        Op::Refund(v) => {
                            let _ = ledger
                                .refund(user, amt(v.into()), ActivationId(1), k)
                                .await;
                        }
                    }

                    let wallet = store.wallet(user).await.unwrap();
                    let sum = store.sum_ledger(user).await.unwrap();
                    prop_assert_eq!(wallet.balance.to_signed(), sum);
                    prop_assert!(wallet.balance >= Amount::ZERO);
                    prop_assert!(wallet.reserved >= Amount::ZERO);
                }
                Ok(())
            })?;
        });
    }
}
