//! Number purchase and lifecycle handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use common::id::NumberId;
use numio_api::server::{NxJson, NxQuery};
use numio_api_core::error::ApiError;
use numio_api_core::models::{
    CancelResponse, CompleteResponse, MyNumbersParams, NumberView,
    NumbersPage, PurchaseRequest, PurchaseResponse, SmsListResponse,
    SmsMessageView,
};
use numio_core::activation::manager;
use numio_core::models::Number;

use crate::context::AppContext;
use crate::server::AuthedUser;

pub async fn purchase(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user_id): AuthedUser,
    NxJson(req): NxJson<PurchaseRequest>,
) -> Result<NxJson<PurchaseResponse>, ApiError> {
    let outcome = ctx
        .manager
        .purchase(manager::PurchaseRequest {
            user_id,
            country: req.country_code,
            service: req.service_code,
            provider_slug: req.provider_slug,
            idempotency_key: req.idempotency_key,
        })
        .await?;

    Ok(NxJson(PurchaseResponse {
        number: outcome.number.to_view(outcome.activation.state),
    }))
}

pub async fn my_numbers(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user_id): AuthedUser,
    NxQuery(params): NxQuery<MyNumbersParams>,
) -> Result<NxJson<NumbersPage>, ApiError> {
    let (numbers, total) = ctx
        .number_store
        .list_for_user(user_id, params.status, params.page_request())
        .await?;

    let mut views = Vec::with_capacity(numbers.len());
    for number in &numbers {
        views.push(view_of(&ctx, number).await?);
    }
    Ok(NxJson(NumbersPage {
        numbers: views,
        total,
    }))
}

pub async fn detail(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<i64>,
) -> Result<NxJson<NumberView>, ApiError> {
    let number = owned_number(&ctx, user_id, NumberId(id)).await?;
    Ok(NxJson(view_of(&ctx, &number).await?))
}

pub async fn cancel(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<i64>,
) -> Result<NxJson<CancelResponse>, ApiError> {
    let refund_amount =
        ctx.manager.cancel(user_id, NumberId(id)).await?;
    Ok(NxJson(CancelResponse { refund_amount }))
}

pub async fn complete(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<i64>,
) -> Result<NxJson<CompleteResponse>, ApiError> {
    let (activation, number) =
        ctx.manager.complete(user_id, NumberId(id)).await?;
    Ok(NxJson(CompleteResponse {
        number: number.to_view(activation.state),
    }))
}

pub async fn sms_for_number(
    State(ctx): State<Arc<AppContext>>,
    AuthedUser(user_id): AuthedUser,
    Path(number_id): Path<i64>,
) -> Result<NxJson<SmsListResponse>, ApiError> {
    let number =
        owned_number(&ctx, user_id, NumberId(number_id)).await?;
    let messages = ctx.sms_store.list_for_number(number.id).await?;

    Ok(NxJson(SmsListResponse {
        status: number.status,
        messages: messages
            .into_iter()
            .map(|m| SmsMessageView {
                sender: m.sender,
                content: m.content,
                code: m.code,
                confidence: m.confidence,
                received_at: m.received_at,
            })
            .collect(),
    }))
}

// --- Helpers --- //

async fn owned_number(
    ctx: &AppContext,
    user_id: common::id::UserId,
    id: NumberId,
) -> Result<Number, ApiError> {
    let number = ctx.number_store.get(id).await.map_err(|e| match e {
        numio_core::traits::StoreError::NotFound =>
            ApiError::not_found("No such number"),
        other => other.into(),
    })?;
    if number.user_id != user_id {
        // Don't leak other users' numbers.
        return Err(ApiError::not_found("No such number"));
    }
    Ok(number)
}

async fn view_of(
    ctx: &AppContext,
    number: &Number,
) -> Result<NumberView, ApiError> {
    let activation =
        ctx.manager.activation(number.activation_id).await?;
    Ok(number.to_view(activation.state))
}
