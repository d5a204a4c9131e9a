//! The activation manager.
//!
//! Every activation state change in the system goes through this type.
//! Each flow follows the same staging: validate the transition with
//! [`ActivationState::can_transition`], apply the ledger side first
//! (idempotency-keyed, so crashes between stages are safe to replay),
//! then commit the state transition, then publish fan-out events.

use std::sync::Arc;

use common::id::{NumberId, UserId};
use common::money::Amount;
use common::time::TimestampMs;
use numio_api_core::error::{ApiError, ErrorKind};
use numio_api_core::types::{ActivationState, NumberStatus};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::activation::{commit_key, refund_key, rollback_key};
use crate::audit::AuditWriter;
use crate::config_engine::{ProviderError, ProviderRegistry};
use crate::constants;
use crate::events::EventPublisher;
use crate::ledger::LedgerService;
use crate::models::{
    Activation, ActivationPatch, AuditRecord, NewOutboxEvent, Number,
};
use crate::traits::{
    ActivationStore, CatalogStore, NewActivation, NewNumber, NumberStore,
    PollBookkeeping, SmsStore, StoreError,
};

/// A completed (or replayed) purchase.
#[derive(Clone, Debug)]
pub struct PurchaseOutcome {
    pub activation: Activation,
    pub number: Number,
    pub replayed: bool,
}

#[derive(Clone, Debug)]
pub struct PurchaseRequest {
    pub user_id: UserId,
    pub country: common::id::CountryCode,
    pub service: common::id::ServiceSlug,
    pub provider_slug: Option<String>,
    pub idempotency_key: common::id::IdempotencyKey,
}

#[derive(Clone)]
pub struct ActivationManager {
    activations: Arc<dyn ActivationStore>,
    numbers: Arc<dyn NumberStore>,
    catalog: Arc<dyn CatalogStore>,
    sms: Arc<dyn SmsStore>,
    ledger: LedgerService,
    providers: Arc<ProviderRegistry>,
    publisher: EventPublisher,
    audit: AuditWriter,
}

impl ActivationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        activations: Arc<dyn ActivationStore>,
        numbers: Arc<dyn NumberStore>,
        catalog: Arc<dyn CatalogStore>,
        sms: Arc<dyn SmsStore>,
        ledger: LedgerService,
        providers: Arc<ProviderRegistry>,
        publisher: EventPublisher,
        audit: AuditWriter,
    ) -> Self {
        Self {
            activations,
            numbers,
            catalog,
            sms,
            ledger,
            providers,
            publisher,
            audit,
        }
    }

    // --- Purchase --- //

    /// Reserve funds + stock, acquire a number upstream, capture.
    ///
    /// Idempotent on the request key: a replay returns the stored outcome
    /// without touching the ledger or the catalogue again.
    #[instrument(skip(self, req), name = "(purchase)")]
    pub async fn purchase(
        &self,
        req: PurchaseRequest,
    ) -> Result<PurchaseOutcome, ApiError> {
        // Replay?
        if let Some(existing) = self
            .activations
            .find_by_idempotency_key(req.user_id, &req.idempotency_key)
            .await?
        {
            return self.replay_purchase(existing).await;
        }

        // Route to the cheapest in-stock offer.
        let offer = self
            .catalog
            .best_offer(
                &req.country,
                &req.service,
                req.provider_slug.as_deref(),
            )
            .await?
            .ok_or_else(|| {
                ApiError::new(
                    ErrorKind::OutOfStock,
                    format!("{}/{}", req.country, req.service),
                )
            })?;

        // Hold one unit of stock.
        let now = TimestampMs::now();
        let reservation = self
            .catalog
            .reserve_stock(
                offer.id,
                1,
                now.saturating_add(constants::RESERVATION_TTL),
                vec![NewOutboxEvent::new(
                    "offer",
                    offer.id,
                    "offer.updated",
                    json!({ "offer_id": offer.id.0 }),
                )],
            )
            .await
            .map_err(|e| match e {
                StoreError::InsufficientStock => ApiError::new(
                    ErrorKind::OutOfStock,
                    format!("{}/{}", req.country, req.service),
                ),
                other => other.into(),
            })?;

        // Hold the funds. The purchase key itself keys the reserve row:
        // ledger keys are global, and this key is never reused for any
        // other wallet mutation.
        let reserved = match self
            .ledger
            .reserve(
                req.user_id,
                offer.sell_price,
                &format!("Reserve for {}/{}", req.country, req.service),
                Some(req.idempotency_key.clone()),
            )
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                // Give the stock back before surfacing the error.
                let _ = self
                    .catalog
                    .cancel_reservation(
                        reservation.id,
                        vec![NewOutboxEvent::new(
                            "offer",
                            offer.id,
                            "offer.updated",
                            json!({ "offer_id": offer.id.0 }),
                        )],
                    )
                    .await;
                return Err(e.into());
            }
        };

        let activation = self
            .activations
            .create(NewActivation {
                user_id: req.user_id,
                provider_id: offer.provider_id,
                provider_slug: offer.provider_slug.clone(),
                price: offer.sell_price,
                idempotency_key: Some(req.idempotency_key),
                reserved_tx: Some(reserved.tx.id),
                service: req.service.clone(),
                country: req.country.clone(),
                operator_id: offer.operator_id.clone(),
                expires_at: now.saturating_add(constants::ACTIVATION_TTL),
                reservation_id: Some(reservation.id),
            })
            .await?;

        self.audit.record(AuditRecord::new(
            "purchase",
            format!("activation:{}", activation.id),
            json!({
                "step": "reserved",
                "offer": offer.id.0,
                "price": activation.price,
            }),
        ));

        self.run_provider_acquisition(activation).await
    }

    /// The second half of a purchase: acquire upstream and capture, or
    /// fail and compensate. Re-invocable: only acts on RESERVED
    /// activations, so the queue retry path and the inline path can't
    /// double-fire.
    #[instrument(
        skip(self, activation),
        fields(activation_id = %activation.id),
        name = "(acquire)"
    )]
    pub async fn run_provider_acquisition(
        &self,
        activation: Activation,
    ) -> Result<PurchaseOutcome, ApiError> {
        if activation.state != ActivationState::Reserved {
            return self.replay_purchase(activation).await;
        }

        let adapter = self
            .providers
            .get(&activation.provider_slug)
            .ok_or_else(|| {
                ApiError::new(
                    ErrorKind::ProviderUnavailable,
                    format!("No adapter for {}", activation.provider_slug),
                )
            })?;

        let acquired = adapter
            .acquire_number(
                &activation.country,
                &activation.service,
                (activation.operator_id != "default")
                    .then_some(activation.operator_id.as_str()),
            )
            .await;

        match acquired {
            Ok(acquired) => {
                let now = TimestampMs::now();
                let number = self
                    .numbers
                    .create(NewNumber {
                        user_id: activation.user_id,
                        activation_id: activation.id,
                        provider_id: activation.provider_id,
                        phone_number: acquired.phone_number.clone(),
                        service: activation.service.clone(),
                        country: activation.country.clone(),
                        price: activation.price,
                        expires_at: activation.expires_at,
                        next_poll_at: now
                            .saturating_add(constants::FIRST_POLL_DELAY),
                    })
                    .await?;

                // Capture: clear the reservation, pin the debit.
                let committed = self
                    .ledger
                    .commit(
                        activation.user_id,
                        activation.price,
                        activation.id,
                        commit_key(activation.id),
                    )
                    .await?;

                let updated = self
                    .activations
                    .transition(
                        activation.id,
                        ActivationState::Reserved,
                        ActivationState::Active,
                        ActivationPatch {
                            captured_tx: Some(committed.tx.id),
                            provider_activation_id: Some(
                                acquired.activation_id.clone(),
                            ),
                            phone_number: Some(
                                acquired.phone_number.clone(),
                            ),
                            number_id: Some(number.id),
                            ..Default::default()
                        },
                        vec![],
                    )
                    .await?;

                if let Some(reservation_id) = updated.reservation_id {
                    self.catalog
                        .confirm_reservation(reservation_id, updated.id)
                        .await?;
                }

                metrics::counter!("purchases_total", "outcome" => "ok")
                    .increment(1);
                let _ = self
                    .publisher
                    .publish_user(
                        updated.user_id,
                        "number.purchased",
                        json!({
                            "number_id": number.id.0,
                            "phone_number": number.phone_number,
                            "service": number.service.as_str(),
                            "country": number.country.as_str(),
                        }),
                        None,
                    )
                    .await;
                info!(
                    "Purchased number {} via {}",
                    number.phone_number, updated.provider_slug,
                );

                Ok(PurchaseOutcome {
                    activation: updated,
                    number,
                    replayed: false,
                })
            }
            // Transient upstream trouble: keep the reservation and hand
            // the acquisition to the queue for a retry. The caller still
            // sees the error; a replay of the same idempotency key picks
            // up whatever the retry achieved.
            Err(provider_err) if provider_err.trips_breaker() => {
                let _ = self
                    .activations
                    .transition(
                        activation.id,
                        ActivationState::Reserved,
                        ActivationState::Reserved,
                        ActivationPatch::default(),
                        vec![NewOutboxEvent::new(
                            "activation",
                            activation.id,
                            "provider_request",
                            json!({ "activation_id": activation.id.0 }),
                        )],
                    )
                    .await;
                metrics::counter!(
                    "purchases_total", "outcome" => "deferred"
                )
                .increment(1);
                Err(provider_err.into())
            }
            Err(provider_err) => {
                self.fail_reserved(activation, &provider_err).await?;
                metrics::counter!(
                    "purchases_total", "outcome" => "failed"
                )
                .increment(1);
                Err(provider_err.into())
            }
        }
    }

    /// Compensates RESERVED activations whose acquisition retries never
    /// resolved: rollback + FAILED, exactly like an inline failure.
    #[instrument(skip(self), name = "(fail-stale-reserved)")]
    pub async fn fail_stale_reserved(
        &self,
        now: TimestampMs,
        limit: usize,
    ) -> Result<u64, ApiError> {
        let cutoff = now.saturating_sub(constants::STALE_RESERVED_AGE);
        let stale = self
            .activations
            .list_stale_reserved(cutoff, limit)
            .await?;
        let mut failed = 0u64;
        for activation in stale {
            self.fail_reserved(
                activation,
                &ProviderError::Timeout,
            )
            .await?;
            failed += 1;
        }
        Ok(failed)
    }

    /// Compensates a RESERVED activation whose provider call failed:
    /// rollback the held funds, release the stock, park it in FAILED.
    async fn fail_reserved(
        &self,
        activation: Activation,
        cause: &ProviderError,
    ) -> Result<(), ApiError> {
        warn!(
            "Provider acquisition failed for activation {}: {cause}",
            activation.id,
        );
        let rolled_back = self
            .ledger
            .rollback(
                activation.user_id,
                activation.price,
                activation.id,
                Some(rollback_key(activation.id)),
            )
            .await?;

        self.activations
            .transition(
                activation.id,
                ActivationState::Reserved,
                ActivationState::Failed,
                ActivationPatch {
                    // The rollback row is this activation's compensation;
                    // recording it here keeps the refund reconciler away.
                    refund_tx: Some(rolled_back.tx.id),
                    ..Default::default()
                },
                vec![],
            )
            .await?;

        if let Some(reservation_id) = activation.reservation_id {
            if let Ok(reservation) =
                self.catalog.get_reservation(reservation_id).await
            {
                let _ = self
                    .catalog
                    .cancel_reservation(
                        reservation_id,
                        vec![NewOutboxEvent::new(
                            "offer",
                            reservation.offer_id,
                            "offer.updated",
                            json!({ "offer_id": reservation.offer_id.0 }),
                        )],
                    )
                    .await;
            }
        }

        self.audit.record(AuditRecord::new(
            "purchase",
            format!("activation:{}", activation.id),
            json!({ "step": "failed", "cause": cause.to_string() }),
        ));
        Ok(())
    }

    /// Replays a previously-seen purchase key.
    async fn replay_purchase(
        &self,
        activation: Activation,
    ) -> Result<PurchaseOutcome, ApiError> {
        match activation.number_id {
            Some(number_id) => {
                let number = self.numbers.get(number_id).await?;
                Ok(PurchaseOutcome {
                    activation,
                    number,
                    replayed: true,
                })
            }
            None if activation.state == ActivationState::Reserved => {
                // Crashed between reserve and acquire; resume.
                Box::pin(self.run_provider_acquisition(activation)).await
            }
            None => Err(ApiError::new(
                ErrorKind::SmsActivationFailed,
                format!(
                    "Purchase previously failed ({})",
                    activation.state.as_str(),
                ),
            )),
        }
    }

    // --- User actions --- //

    /// Cancel an active number and refund the wallet.
    #[instrument(skip(self), name = "(cancel-number)")]
    pub async fn cancel(
        &self,
        user_id: UserId,
        number_id: NumberId,
    ) -> Result<Amount, ApiError> {
        let (number, activation) =
            self.load_owned(user_id, number_id).await?;

        if !ActivationState::can_transition(
            activation.state,
            ActivationState::Cancelled,
        ) {
            return Err(ApiError::new(
                ErrorKind::NotRefundable,
                format!("Activation is {}", activation.state.as_str()),
            ));
        }

        // Best-effort upstream cancel; our state is authoritative.
        if let (Some(adapter), Some(upstream_id)) = (
            self.providers.get(&activation.provider_slug),
            activation.provider_activation_id.as_deref(),
        ) {
            if let Err(e) = adapter.cancel_number(upstream_id).await {
                warn!("Upstream cancel failed (continuing): {e}");
            }
        }

        self.set_number_status(&number, NumberStatus::Cancelled).await?;
        let cancelled = self
            .activations
            .transition(
                activation.id,
                activation.state,
                ActivationState::Cancelled,
                ActivationPatch::default(),
                vec![],
            )
            .await?;

        let refunded = self.settle_refund(cancelled).await?;
        Ok(refunded)
    }

    /// Mark a received number as completed (funds stay captured).
    #[instrument(skip(self), name = "(complete-number)")]
    pub async fn complete(
        &self,
        user_id: UserId,
        number_id: NumberId,
    ) -> Result<(Activation, Number), ApiError> {
        let (number, activation) =
            self.load_owned(user_id, number_id).await?;

        if activation.state != ActivationState::Received {
            return Err(ApiError::new(
                ErrorKind::ValidationInvalid,
                format!(
                    "Only RECEIVED activations can be completed, not {}",
                    activation.state.as_str(),
                ),
            ));
        }

        if let (Some(adapter), Some(upstream_id)) = (
            self.providers.get(&activation.provider_slug),
            activation.provider_activation_id.as_deref(),
        ) {
            if let Err(e) = adapter
                .set_status(
                    upstream_id,
                    crate::config_engine::UpstreamStatus::Completed,
                )
                .await
            {
                warn!("Upstream completion push failed (continuing): {e}");
            }
        }

        let number =
            self.set_number_status(&number, NumberStatus::Completed).await?;
        let completed = self
            .activations
            .transition(
                activation.id,
                ActivationState::Received,
                ActivationState::Completed,
                ActivationPatch::default(),
                vec![],
            )
            .await?;

        let _ = self
            .publisher
            .publish_user(
                user_id,
                "number.updated",
                json!({
                    "number_id": number.id.0,
                    "status": number.status.as_str(),
                }),
                None,
            )
            .await;

        Ok((completed, number))
    }

    // --- Poller-facing transitions --- //

    /// First SMS arrived: ACTIVE -> RECEIVED, on both the activation and
    /// its number. Races (e.g. with a concurrent cancel) are tolerated
    /// as no-ops.
    pub async fn mark_received(
        &self,
        activation_id: common::id::ActivationId,
    ) -> Result<(), ApiError> {
        let activation = self.activations.get(activation_id).await?;
        if activation.state != ActivationState::Active {
            return Ok(());
        }
        match self
            .activations
            .transition(
                activation_id,
                ActivationState::Active,
                ActivationState::Received,
                ActivationPatch::default(),
                vec![],
            )
            .await
        {
            Ok(updated) => {
                if let Some(number_id) = updated.number_id {
                    let number = self.numbers.get(number_id).await?;
                    if number.status == NumberStatus::Active {
                        self.set_number_status(
                            &number,
                            NumberStatus::Received,
                        )
                        .await?;
                    }
                }
                let _ = self
                    .publisher
                    .publish_user(
                        updated.user_id,
                        "activation.updated",
                        json!({
                            "activation_id": updated.id.0,
                            "state": updated.state.as_str(),
                        }),
                        None,
                    )
                    .await;
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Upstream reported a terminal status for a live number. Empty
    /// inbox => EXPIRED (or CANCELLED for an upstream cancel) + refund;
    /// non-empty inbox => COMPLETED, no refund. Terminal numbers are
    /// left alone: late upstream reports never regress local state.
    pub async fn apply_upstream_terminal(
        &self,
        number_id: NumberId,
        upstream: crate::config_engine::UpstreamStatus,
    ) -> Result<(), ApiError> {
        let number = self.numbers.get(number_id).await?;
        if number.status.is_terminal() {
            return Ok(());
        }
        let activation =
            self.activations.get(number.activation_id).await?;
        let inbox_count = self.sms.count_for_number(number.id).await?;

        if inbox_count > 0 {
            self.set_number_status(&number, NumberStatus::Completed)
                .await?;
            let mut state = activation.state;
            if state == ActivationState::Active {
                match self
                    .activations
                    .transition(
                        activation.id,
                        ActivationState::Active,
                        ActivationState::Received,
                        ActivationPatch::default(),
                        vec![],
                    )
                    .await
                {
                    Ok(a) => state = a.state,
                    Err(StoreError::Conflict(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
            if state == ActivationState::Received {
                match self
                    .activations
                    .transition(
                        activation.id,
                        ActivationState::Received,
                        ActivationState::Completed,
                        ActivationPatch::default(),
                        vec![],
                    )
                    .await
                {
                    Ok(_) => (),
                    Err(StoreError::Conflict(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        } else {
            use crate::config_engine::UpstreamStatus;
            let (number_status, target) = match upstream {
                UpstreamStatus::Cancelled => (
                    NumberStatus::Cancelled,
                    ActivationState::Cancelled,
                ),
                _ =>
                    (NumberStatus::Expired, ActivationState::Expired),
            };
            if !ActivationState::can_transition(activation.state, target)
            {
                return Ok(());
            }
            self.set_number_status(&number, number_status).await?;
            let moved = match self
                .activations
                .transition(
                    activation.id,
                    activation.state,
                    target,
                    ActivationPatch::default(),
                    vec![],
                )
                .await
            {
                Ok(a) => a,
                Err(StoreError::Conflict(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            self.settle_refund(moved).await?;
        }
        Ok(())
    }

    // --- Lifecycle workers --- //

    /// Expires overdue live numbers. Empty inbox => EXPIRED + refund;
    /// non-empty => COMPLETED, funds kept.
    #[instrument(skip(self), name = "(expire-due)")]
    pub async fn expire_due(
        &self,
        now: TimestampMs,
        limit: usize,
    ) -> Result<u64, ApiError> {
        let expired = self.numbers.list_expired(now, limit).await?;
        let mut processed = 0u64;

        for number in expired {
            let activation =
                self.activations.get(number.activation_id).await?;
            let inbox_count =
                self.sms.count_for_number(number.id).await?;

            if inbox_count == 0 {
                // The predicate gates every transition, here included:
                // an activation whose funds were already captured as
                // delivered has no legal edge to EXPIRED.
                if !ActivationState::can_transition(
                    activation.state,
                    ActivationState::Expired,
                ) {
                    continue;
                }
                self.set_number_status(&number, NumberStatus::Expired)
                    .await?;
                let expired_activation = match self
                    .activations
                    .transition(
                        activation.id,
                        activation.state,
                        ActivationState::Expired,
                        ActivationPatch::default(),
                        vec![],
                    )
                    .await
                {
                    Ok(a) => a,
                    // Someone else settled it first.
                    Err(StoreError::Conflict(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                self.settle_refund(expired_activation).await?;
            } else {
                // Had traffic: deliverable, so the sale stands.
                self.set_number_status(&number, NumberStatus::Completed)
                    .await?;
                let mut state = activation.state;
                if state == ActivationState::Active {
                    state = self
                        .activations
                        .transition(
                            activation.id,
                            ActivationState::Active,
                            ActivationState::Received,
                            ActivationPatch::default(),
                            vec![],
                        )
                        .await?
                        .state;
                }
                if state == ActivationState::Received {
                    self.activations
                        .transition(
                            activation.id,
                            ActivationState::Received,
                            ActivationState::Completed,
                            ActivationPatch::default(),
                            vec![],
                        )
                        .await?;
                }
            }

            self.audit.record(AuditRecord::new(
                "lifecycle",
                format!("number:{}", number.id),
                json!({
                    "step": "expired",
                    "inbox_count": inbox_count,
                }),
            ));
            processed += 1;
        }
        Ok(processed)
    }

    /// Refund reconciliation: any refundable activation with captured
    /// funds and no compensation yet gets refunded.
    #[instrument(skip(self), name = "(reconcile-refunds)")]
    pub async fn reconcile_refunds(
        &self,
        limit: usize,
    ) -> Result<u64, ApiError> {
        let candidates = self.activations.list_refundable(limit).await?;
        let mut refunded = 0u64;
        for activation in candidates {
            if activation.refund_tx.is_some() {
                continue;
            }
            if activation.captured_tx.is_some() {
                self.settle_refund(activation).await?;
                refunded += 1;
            } else if activation.reserved_tx.is_some() {
                // Never captured (crash between reserve and acquire):
                // roll the reserve back and park as compensated.
                let rolled_back = self
                    .ledger
                    .rollback(
                        activation.user_id,
                        activation.price,
                        activation.id,
                        Some(rollback_key(activation.id)),
                    )
                    .await?;
                self.activations
                    .transition(
                        activation.id,
                        activation.state,
                        activation.state, // no state change
                        ActivationPatch {
                            refund_tx: Some(rolled_back.tx.id),
                            ..Default::default()
                        },
                        vec![],
                    )
                    .await
                    .ok();
                refunded += 1;
            }
        }
        Ok(refunded)
    }

    /// Refunds a refundable activation: refund row, stock restore,
    /// transition to REFUNDED, fan-out. Idempotent via the refund key.
    async fn settle_refund(
        &self,
        activation: Activation,
    ) -> Result<Amount, ApiError> {
        debug_assert!(activation.state.is_refundable());
        if !ActivationState::can_transition(
            activation.state,
            ActivationState::Refunded,
        ) {
            return Err(ApiError::new(
                ErrorKind::NotRefundable,
                format!("Activation is {}", activation.state.as_str()),
            ));
        }

        let refunded = self
            .ledger
            .refund(
                activation.user_id,
                activation.price,
                activation.id,
                refund_key(activation.id),
            )
            .await?;

        // Put the unit back on the shelf.
        if let Some(reservation_id) = activation.reservation_id {
            if let Ok(reservation) =
                self.catalog.get_reservation(reservation_id).await
            {
                let _ = self
                    .catalog
                    .release_reservation(
                        reservation_id,
                        vec![NewOutboxEvent::new(
                            "offer",
                            reservation.offer_id,
                            "offer.updated",
                            json!({ "offer_id": reservation.offer_id.0 }),
                        )],
                    )
                    .await;
            }
        }

        let updated = self
            .activations
            .transition(
                activation.id,
                activation.state,
                ActivationState::Refunded,
                ActivationPatch {
                    refund_tx: Some(refunded.tx.id),
                    ..Default::default()
                },
                vec![NewOutboxEvent::new(
                    "activation",
                    activation.id,
                    "activation.refunded",
                    json!({
                        "activation_id": activation.id.0,
                        "amount": activation.price,
                    }),
                )],
            )
            .await?;

        metrics::counter!("refunds_total").increment(1);
        let _ = self
            .publisher
            .publish_user(
                updated.user_id,
                "activation.refunded",
                json!({
                    "activation_id": updated.id.0,
                    "amount": updated.price,
                }),
                None,
            )
            .await;
        let _ = self
            .publisher
            .publish_user(
                updated.user_id,
                "wallet.updated",
                json!({ "balance": refunded.balance }),
                None,
            )
            .await;

        self.audit.record(AuditRecord::new(
            "wallet",
            format!("activation:{}", updated.id),
            json!({ "step": "refunded", "amount": updated.price }),
        ));
        Ok(updated.price)
    }

    // --- Helpers --- //

    /// Read-only activation lookup for collaborating workers.
    pub async fn activation(
        &self,
        id: common::id::ActivationId,
    ) -> Result<Activation, ApiError> {
        Ok(self.activations.get(id).await?)
    }

    async fn load_owned(
        &self,
        user_id: UserId,
        number_id: NumberId,
    ) -> Result<(Number, Activation), ApiError> {
        let number = self.numbers.get(number_id).await.map_err(|e| {
            match e {
                StoreError::NotFound =>
                    ApiError::not_found("No such number"),
                other => other.into(),
            }
        })?;
        if number.user_id != user_id {
            // Don't leak existence of other users' numbers.
            return Err(ApiError::not_found("No such number"));
        }
        let activation =
            self.activations.get(number.activation_id).await?;
        Ok((number, activation))
    }

    async fn set_number_status(
        &self,
        number: &Number,
        status: NumberStatus,
    ) -> Result<Number, ApiError> {
        Ok(self
            .numbers
            .record_poll(
                number.id,
                PollBookkeeping {
                    status: Some(status),
                    error_count: number.error_count,
                    next_poll_at: number.next_poll_at,
                    last_polled_at: TimestampMs::now(),
                    poll_count: number.poll_count,
                },
            )
            .await?)
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::net::IpAddr;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use common::id::{CountryCode, IdempotencyKey, ServiceSlug};
    use numio_api_core::types::TxKind;
    use numio_tokio::notify_once::NotifyOnce;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::config_engine::{
        Acquired, AuthMode, Country, NormalizationMode, PriceRow,
        ProviderApi, ProviderConfig, ServiceInfo, StatusPoll,
        UpstreamStatus, WebhookPayload, WebhookVerdict,
    };
    use crate::models::NewOffer;
    use crate::store::memory::MemStore;
    use crate::traits::{CatalogStore, WalletStore};
    // For disambiguating same-named trait methods on MemStore.
    use crate::traits::{ActivationStore, NumberStore};

    /// A scriptable provider double.
    struct StubProvider {
        config: ProviderConfig,
        acquisitions: Mutex<VecDeque<Result<Acquired, ProviderError>>>,
    }

    impl StubProvider {
        fn new(
            slug: &str,
            acquisitions: Vec<Result<Acquired, ProviderError>>,
        ) -> Self {
            Self {
                config: ProviderConfig {
                    id: common::id::ProviderId(1),
                    slug: slug.to_owned(),
                    display_name: slug.to_owned(),
                    base_url: "http://stub.test".to_owned(),
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
                },
                acquisitions: Mutex::new(acquisitions.into()),
            }
        }
    }

    #[async_trait]
    impl ProviderApi for StubProvider {
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
            Ok(Amount::ZERO)
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

    struct Harness {
        store: Arc<MemStore>,
        manager: ActivationManager,
        _audit_task: numio_tokio::task::NxTask<()>,
    }

    async fn harness(
        acquisitions: Vec<Result<Acquired, ProviderError>>,
    ) -> Harness {
        let store = Arc::new(MemStore::new());
        let mut registry = ProviderRegistry::empty();
        registry
            .insert("p1", Arc::new(StubProvider::new("p1", acquisitions)));

        // Seed the provider config + one offer: us/tg @ 100, stock 3.
        let stub = StubProvider::new("p1", vec![]);
        store.put_provider_config(stub.config.clone());
        store
            .upsert_offers(
                common::id::ProviderId(1),
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

        let ledger = LedgerService::new(store.clone());
        let publisher = crate::events::EventPublisher::new(
            store.clone(),
            store.clone(),
            "test",
        );
        let (audit, audit_task) =
            AuditWriter::spawn(store.clone(), NotifyOnce::new());

        let manager = ActivationManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            ledger.clone(),
            Arc::new(registry),
            publisher,
            audit,
        );

        // Seed wallet: 500.
        ledger
            .credit(
                UserId(1),
                Amount::from_major(500),
                TxKind::Topup,
                "seed",
                None,
            )
            .await
            .unwrap();

        Harness {
            store,
            manager,
            _audit_task: audit_task,
        }
    }

    fn purchase_req(key: &str) -> PurchaseRequest {
        PurchaseRequest {
            user_id: UserId(1),
            country: CountryCode::new("us").unwrap(),
            service: ServiceSlug::new("tg").unwrap(),
            provider_slug: None,
            idempotency_key: IdempotencyKey::new(key).unwrap(),
        }
    }

    fn ok_acquired() -> Result<Acquired, ProviderError> {
        Ok(Acquired {
            activation_id: "A1".to_owned(),
            phone_number: "+15551230000".to_owned(),
            price: None,
        })
    }

    async fn offer_stock(store: &Arc<MemStore>) -> u64 {
        store
            .get_offer(common::id::OfferId(1))
            .await
            .unwrap()
            .stock
    }

    /// Happy path purchase.
    #[tokio::test]
    async fn happy_path_purchase() {
        let h = harness(vec![ok_acquired()]).await;

        let outcome =
            h.manager.purchase(purchase_req("k1")).await.unwrap();
        assert!(!outcome.replayed);
        assert_eq!(outcome.activation.state, ActivationState::Active);
        assert_eq!(outcome.number.phone_number, "+15551230000");
        assert_eq!(outcome.number.status, NumberStatus::Active);

        let wallet = h.store.wallet(UserId(1)).await.unwrap();
        assert_eq!(wallet.balance, Amount::from_major(400));
        assert_eq!(wallet.reserved, Amount::ZERO);
        assert_eq!(offer_stock(&h.store).await, 2);

        let outbox = h.store.outbox_rows();
        let offer_updates: Vec<_> = outbox
            .iter()
            .filter(|e| e.event_type == "offer.updated")
            .collect();
        assert_eq!(offer_updates.len(), 1);
    }

    /// Idempotent replay.
    #[tokio::test]
    async fn idempotent_replay() {
        let h = harness(vec![ok_acquired()]).await;

        let first = h.manager.purchase(purchase_req("k1")).await.unwrap();
        let ledger_rows_before = h
            .store
            .transactions(UserId(1), Default::default())
            .await
            .unwrap()
            .1;

        let replay = h.manager.purchase(purchase_req("k1")).await.unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.activation.id, first.activation.id);
        assert_eq!(replay.number.id, first.number.id);

        let ledger_rows_after = h
            .store
            .transactions(UserId(1), Default::default())
            .await
            .unwrap()
            .1;
        assert_eq!(ledger_rows_before, ledger_rows_after);
        assert_eq!(offer_stock(&h.store).await, 2);
    }

    /// Out of stock.
    #[tokio::test]
    async fn out_of_stock() {
        let h = harness(vec![]).await;
        // Drain the stock.
        let offer = h
            .store
            .best_offer(
                &CountryCode::new("us").unwrap(),
                &ServiceSlug::new("tg").unwrap(),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        h.store
            .reserve_stock(offer.id, 3, TimestampMs::MAX, vec![])
            .await
            .unwrap();

        let err =
            h.manager.purchase(purchase_req("k1")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfStock);

        // No ledger rows beyond the seed topup; wallet unchanged.
        let (_, total) = h
            .store
            .transactions(UserId(1), Default::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        let wallet = h.store.wallet(UserId(1)).await.unwrap();
        assert_eq!(wallet.balance, Amount::from_major(500));
    }

    /// A definitive provider failure compensates fully: rollback + stock
    /// restored.
    #[tokio::test]
    async fn provider_failure_compensates() {
        let h = harness(vec![Err(ProviderError::OutOfStock)]).await;

        let err =
            h.manager.purchase(purchase_req("k1")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfStock);

        let wallet = h.store.wallet(UserId(1)).await.unwrap();
        assert_eq!(wallet.balance, Amount::from_major(500));
        assert_eq!(wallet.reserved, Amount::ZERO);
        assert_eq!(offer_stock(&h.store).await, 3);
    }

    /// Transient provider trouble defers: the activation stays RESERVED
    /// with a provider_request outbox row, and the stale-reserved sweep
    /// eventually compensates if no retry lands.
    #[tokio::test]
    async fn transient_failure_defers_then_compensates() {
        let h = harness(vec![Err(ProviderError::Unavailable(
            "boom".to_owned(),
        ))])
        .await;

        let err =
            h.manager.purchase(purchase_req("k1")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderUnavailable);

        // Still reserved, funds still held, retry queued via outbox.
        let wallet = h.store.wallet(UserId(1)).await.unwrap();
        assert_eq!(wallet.balance, Amount::from_major(400));
        assert_eq!(wallet.reserved, Amount::from_major(100));
        assert!(h
            .store
            .outbox_rows()
            .iter()
            .any(|e| e.event_type == "provider_request"));

        // Stale sweep (cutoff in the far future => everything is stale).
        let failed = h
            .manager
            .fail_stale_reserved(TimestampMs::MAX, 10)
            .await
            .unwrap();
        assert_eq!(failed, 1);

        let wallet = h.store.wallet(UserId(1)).await.unwrap();
        assert_eq!(wallet.balance, Amount::from_major(500));
        assert_eq!(wallet.reserved, Amount::ZERO);
        assert_eq!(offer_stock(&h.store).await, 3);
    }

    /// Cancel refunds and restores stock.
    #[tokio::test]
    async fn cancel_refunds() {
        let h = harness(vec![ok_acquired()]).await;
        let outcome =
            h.manager.purchase(purchase_req("k1")).await.unwrap();

        let refund = h
            .manager
            .cancel(UserId(1), outcome.number.id)
            .await
            .unwrap();
        assert_eq!(refund, Amount::from_major(100));

        let wallet = h.store.wallet(UserId(1)).await.unwrap();
        assert_eq!(wallet.balance, Amount::from_major(500));
        assert_eq!(offer_stock(&h.store).await, 3);

        let activation =
            ActivationStore::get(h.store.as_ref(), outcome.activation.id)
                .await
                .unwrap();
        assert_eq!(activation.state, ActivationState::Refunded);
        assert!(activation.refund_tx.is_some());

        // Cancelling again: the number is terminal now.
        let err = h
            .manager
            .cancel(UserId(1), outcome.number.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotRefundable);
    }

    /// Expiry with an empty inbox refunds; with traffic it completes.
    #[tokio::test]
    async fn expiry_paths() {
        let h = harness(vec![ok_acquired(), ok_acquired()]).await;
        let first = h.manager.purchase(purchase_req("k1")).await.unwrap();
        let second =
            h.manager.purchase(purchase_req("k2")).await.unwrap();
        assert_eq!(offer_stock(&h.store).await, 1);

        // Second number got an SMS.
        use crate::traits::SmsStore;
        h.store
            .insert_batch(
                vec![crate::traits::NewSmsMessage {
                    id: format!("{}_m1", second.number.id),
                    number_id: second.number.id,
                    sender: "TG".to_owned(),
                    content: "code 842193".to_owned(),
                    code: Some("842193".to_owned()),
                    confidence: Some(0.9),
                    received_at: TimestampMs::now(),
                    content_hash: "h1".to_owned(),
                    fingerprint: "TG:h1".to_owned(),
                }],
                std::time::Duration::from_secs(10),
            )
            .await
            .unwrap();
        h.manager
            .mark_received(second.activation.id)
            .await
            .unwrap();

        // Clock passes expiry.
        let after_expiry = TimestampMs::MAX;
        let processed =
            h.manager.expire_due(after_expiry, 10).await.unwrap();
        assert_eq!(processed, 2);

        // First: refunded, stock restored.
        let a1 = ActivationStore::get(h.store.as_ref(), first.activation.id)
            .await
            .unwrap();
        assert_eq!(a1.state, ActivationState::Refunded);
        let n1 = NumberStore::get(h.store.as_ref(), first.number.id)
            .await
            .unwrap();
        assert_eq!(n1.status, NumberStatus::Expired);

        // Second: completed, no refund.
        let a2 =
            ActivationStore::get(h.store.as_ref(), second.activation.id)
                .await
                .unwrap();
        assert_eq!(a2.state, ActivationState::Completed);
        assert!(a2.refund_tx.is_none());

        // 500 - 100 (kept sale) = 400.
        let wallet = h.store.wallet(UserId(1)).await.unwrap();
        assert_eq!(wallet.balance, Amount::from_major(400));
        // First unit restored; second stays sold.
        assert_eq!(offer_stock(&h.store).await, 2);

        // The refund emitted both an offer.updated and an
        // activation.refunded outbox event.
        let outbox = h.store.outbox_rows();
        assert!(outbox
            .iter()
            .any(|e| e.event_type == "activation.refunded"));
    }

    /// Ledger <-> activation consistency across the main flows.
    #[tokio::test]
    async fn terminal_states_have_matching_ledger_rows() {
        let h = harness(vec![
            ok_acquired(),
            Err(ProviderError::OutOfStock),
        ])
        .await;

        let ok = h.manager.purchase(purchase_req("k1")).await.unwrap();
        let _ = h.manager.purchase(purchase_req("k2")).await.unwrap_err();
        h.manager.cancel(UserId(1), ok.number.id).await.unwrap();

        let (rows, _) = h
            .store
            .transactions(UserId(1), Default::default())
            .await
            .unwrap();

        // Refunded activation: exactly one refund row matching price.
        let refund_sum: common::money::SignedAmount = rows
            .iter()
            .filter(|tx| tx.kind == TxKind::Refund)
            .map(|tx| tx.amount)
            .sum();
        assert_eq!(
            refund_sum.to_unsigned().unwrap(),
            Amount::from_major(100),
        );

        // Failed activation: exactly one rollback (positive
        // activation_reserve) row.
        let rollbacks = rows
            .iter()
            .filter(|tx| {
                tx.kind == TxKind::ActivationReserve
                    && !tx.amount.is_negative()
            })
            .count();
        assert_eq!(rollbacks, 1);

        // And wallet integrity holds at rest.
        let wallet = h.store.wallet(UserId(1)).await.unwrap();
        let sum = h.store.sum_ledger(UserId(1)).await.unwrap();
        assert_eq!(wallet.balance.to_signed(), sum);
    }
}
