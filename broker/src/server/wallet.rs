//! Wallet handlers.

use std::sync::Arc;

use axum::extract::State;
use numio_api::server::{NxJson, NxQuery};
use numio_api_core::error::ApiError;
use numio_api_core::models::{
    BalanceResponse, TopupRequest, TopupResponse, TransactionsPage,
};
use numio_api_core::types::{PageRequest, TxKind};
use serde_json::json;

use crate::context::AppContext;
use crate::server::AuthedUser;

pub async fn balance(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user_id): AuthedUser,
) -> Result<NxJson<BalanceResponse>, ApiError> {
    let wallet = ctx.ledger.wallet(user_id).await?;
    Ok(NxJson(BalanceResponse {
        wallet_id: wallet.user_id,
        balance: wallet.balance,
        reserved: wallet.reserved,
    }))
}

pub async fn topup(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user_id): AuthedUser,
    NxJson(req): NxJson<TopupRequest>,
) -> Result<NxJson<TopupResponse>, ApiError> {
    let applied = ctx
        .ledger
        .credit(
            user_id,
            req.amount,
            TxKind::Topup,
            "Wallet topup",
            Some(req.idempotency_key),
        )
        .await?;

    if !applied.replayed {
        let _ = ctx
            .publisher
            .publish_user(
                user_id,
                "wallet.updated",
                json!({ "balance": applied.balance }),
                None,
            )
            .await;
    }

    Ok(NxJson(TopupResponse {
        new_balance: applied.balance,
    }))
}

pub async fn transactions(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user_id): AuthedUser,
    NxQuery(page): NxQuery<PageRequest>,
) -> Result<NxJson<TransactionsPage>, ApiError> {
    let (transactions, total) =
        ctx.ledger.transactions(user_id, page).await?;
    Ok(NxJson(TransactionsPage {
        transactions,
        total,
    }))
}
