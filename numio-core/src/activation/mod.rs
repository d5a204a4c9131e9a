//! The activation state machine.
//!
//! State predicates ([`ActivationState::can_transition`],
//! [`ActivationState::is_refundable`]) live next to the enum in
//! `numio-api-core`; this module holds the manager that drives every
//! transition through them, coordinating the ledger, the catalogue, the
//! provider registry, and event fan-out.
//!
//! [`ActivationState::can_transition`]: numio_api_core::types::ActivationState::can_transition
//! [`ActivationState::is_refundable`]: numio_api_core::types::ActivationState::is_refundable

use common::id::{ActivationId, IdempotencyKey};

pub mod manager;

pub use manager::ActivationManager;

/// The ledger idempotency key for capturing an activation's funds.
pub fn commit_key(id: ActivationId) -> IdempotencyKey {
    IdempotencyKey::new(format!("activation:{id}:commit"))
        .expect("Derived keys are always valid")
}

/// The ledger idempotency key for refunding an activation.
pub fn refund_key(id: ActivationId) -> IdempotencyKey {
    IdempotencyKey::new(format!("activation:{id}:refund"))
        .expect("Derived keys are always valid")
}

/// The ledger idempotency key for rolling back a never-captured reserve.
pub fn rollback_key(id: ActivationId) -> IdempotencyKey {
    IdempotencyKey::new(format!("activation:{id}:rollback"))
        .expect("Derived keys are always valid")
}
