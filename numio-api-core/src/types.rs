//! Wire enums and records shared between the HTTP API and the domain.

use common::id::{IdempotencyKey, LedgerTxId, UserId};
use common::money::SignedAmount;
use common::time::TimestampMs;
#[cfg(any(test, feature = "test-utils"))]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};
use strum::VariantArray;

// --- Activation lifecycle --- //

/// The lifecycle state of a single number purchase.
///
/// The transition graph is fixed; [`ActivationState::can_transition`] is the
/// only authority on which moves are legal and every mutation path goes
/// through it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize, VariantArray)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationState {
    /// Funds are held; no upstream number yet.
    Reserved,
    /// Upstream number acquired; funds captured; polling for SMS.
    Active,
    /// At least one SMS has arrived.
    Received,
    /// User finalized the activation.
    Completed,
    /// User cancelled before receiving an SMS.
    Cancelled,
    /// The activation window elapsed with no SMS.
    Expired,
    /// Upstream reported a timeout.
    Timeout,
    /// The provider call failed; nothing was acquired.
    Failed,
    /// Funds were returned to the wallet.
    Refunded,
}

impl ActivationState {
    /// Whether a transition `from -> to` is legal.
    ///
    /// Reconciliation to [`Refunded`](Self::Refunded) is only legal from
    /// refundable states, so the refund policy is part of the graph.
    pub fn can_transition(from: Self, to: Self) -> bool {
        use ActivationState::*;
        matches!(
            (from, to),
            (Reserved, Active)
                | (Reserved, Failed)
                | (Active, Received)
                | (Active, Expired)
                | (Active, Cancelled)
                | (Active, Timeout)
                | (Received, Completed)
                | (Cancelled, Refunded)
                | (Expired, Refunded)
                | (Timeout, Refunded)
                | (Failed, Refunded)
        )
    }

    /// Whether funds held for an activation in this state can be returned.
    pub fn is_refundable(self) -> bool {
        use ActivationState::*;
        matches!(self, Failed | Cancelled | Expired | Timeout)
    }

    /// Whether this state admits no further transitions at all.
    pub fn is_final(self) -> bool {
        use ActivationState::*;
        matches!(self, Completed | Refunded)
    }

    /// Whether the activation is still live (polling / usable).
    pub fn is_live(self) -> bool {
        use ActivationState::*;
        matches!(self, Reserved | Active | Received)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "RESERVED",
            Self::Active => "ACTIVE",
            Self::Received => "RECEIVED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
            Self::Timeout => "TIMEOUT",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }
}

/// The listing status of a number, denormalized from its activation for
/// fast dashboard queries.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize, VariantArray)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum NumberStatus {
    Active,
    Received,
    Completed,
    Cancelled,
    Expired,
    Timeout,
}

impl NumberStatus {
    /// Terminal statuses never regress: once a number is e.g. `completed`,
    /// a late upstream poll cannot move it back to `received`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active | Self::Received)
    }

    /// The number status mirroring an activation state, if the activation
    /// has progressed far enough to have a number at all.
    pub fn from_activation(state: ActivationState) -> Option<Self> {
        use ActivationState::*;
        match state {
            Reserved | Failed | Refunded => None,
            Active => Some(Self::Active),
            Received => Some(Self::Received),
            Completed => Some(Self::Completed),
            Cancelled => Some(Self::Cancelled),
            Expired => Some(Self::Expired),
            Timeout => Some(Self::Timeout),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Received => "received",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Timeout => "timeout",
        }
    }
}

// --- Wallet ledger --- //

/// The kind of a wallet ledger row.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize, VariantArray)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Topup,
    ActivationReserve,
    ActivationCommit,
    Refund,
    ManualAdjust,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topup => "topup",
            Self::ActivationReserve => "activation_reserve",
            Self::ActivationCommit => "activation_commit",
            Self::Refund => "refund",
            Self::ManualAdjust => "manual_adjust",
        }
    }
}

/// One append-only wallet ledger row. Never updated or deleted; a wallet's
/// balance is the sum of its rows' `amount`s.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: LedgerTxId,
    pub user_id: UserId,
    /// Signed fixed-point delta applied to the balance.
    pub amount: SignedAmount,
    pub kind: TxKind,
    pub description: String,
    /// Globally unique when present; replays return the stored row.
    pub idempotency_key: Option<IdempotencyKey>,
    pub created_at: TimestampMs,
}

// --- Pagination --- //

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// A 1-based page request. Out-of-range values are clamped, not rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default = "PageRequest::default_page")]
    pub page: u32,
    #[serde(default = "PageRequest::default_limit")]
    pub limit: u32,
}

impl PageRequest {
    fn default_page() -> u32 {
        1
    }

    fn default_limit() -> u32 {
        DEFAULT_PAGE_LIMIT
    }

    /// The page with clamps applied. Always call this before use.
    pub fn clamped(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    /// The number of rows to skip.
    pub fn offset(self) -> u64 {
        let this = self.clamped();
        u64::from(this.page - 1) * u64::from(this.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// A page of results plus the total row count.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[cfg(test)]
mod test {
    use proptest::arbitrary::any;
    use proptest::{prop_assert, proptest};
    use strum::VariantArray;

    use super::*;

    /// Walk every (from, to) pair and pin down the graph's global shape.
    #[test]
    fn transition_graph_shape() {
        use ActivationState as S;

        // Final states admit no outgoing transitions.
        for from in S::VARIANTS {
            if from.is_final() {
                for to in S::VARIANTS {
                    assert!(!S::can_transition(*from, *to));
                }
            }
        }

        // No self-transitions anywhere.
        for state in S::VARIANTS {
            assert!(!S::can_transition(*state, *state));
        }

        // Refunds only come out of refundable states.
        for from in S::VARIANTS {
            if S::can_transition(*from, S::Refunded) {
                assert!(from.is_refundable(), "{from:?}");
            }
        }

        // Non-refundable delivered states never reach Refunded.
        assert!(!S::can_transition(S::Received, S::Refunded));
        assert!(!S::can_transition(S::Completed, S::Refunded));
    }

    #[test]
    fn no_regression_from_terminal_number_status() {
        proptest!(|(status in any::<NumberStatus>())| {
            if status.is_terminal() {
                prop_assert!(status != NumberStatus::Active);
                prop_assert!(status != NumberStatus::Received);
            }
        })
    }

    #[test]
    fn page_request_clamps() {
        let req = PageRequest { page: 0, limit: 0 }.clamped();
        assert_eq!(req.page, 1);
        assert_eq!(req.limit, 1);

        let req = PageRequest {
            page: 3,
            limit: 10_000,
        };
        assert_eq!(req.clamped().limit, MAX_PAGE_LIMIT);
        assert_eq!(req.offset(), 200);
    }

    #[test]
    fn activation_state_serde_is_screaming() {
        let json = serde_json::to_string(&ActivationState::Reserved).unwrap();
        assert_eq!(json, "\"RESERVED\"");
        let json = serde_json::to_string(&NumberStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
        let json = serde_json::to_string(&TxKind::ActivationReserve).unwrap();
        assert_eq!(json, "\"activation_reserve\"");
    }
}
