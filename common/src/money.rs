//! Money newtypes which maintain some useful internal invariants.
//!
//! All wallet and price math in numio runs on [`rust_decimal::Decimal`];
//! binary floats are never used for money. Two flavors:
//!
//! - [`Amount`]: a non-negative amount in major display-currency units.
//!   Balances, prices and costs are always [`Amount`]s.
//! - [`SignedAmount`]: a signed ledger delta. Wallet transactions are
//!   append-only signed rows; a balance is the sum of its deltas.
//!
//! Note that we don't impl `From<f64>` or similar because calling code must
//! be explicit about where a decimal value comes from. To parse user input,
//! use `Decimal::from_str` and then [`Amount::try_from_decimal`].

use std::fmt::{self, Display};
use std::iter::Sum;
use std::ops::{Add, Neg, Sub};

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};

/// Errors that can occur when attempting to construct an [`Amount`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Amount is negative")]
    Negative,
    #[error("Amount is too large")]
    TooLarge,
}

/// A non-negative amount of display currency.
///
/// Properties:
///
/// - The contained value is non-negative.
/// - The contained value is no greater than [`Amount::MAX`].
/// - Arithmetic is checked; the `Add`/`Sub` operators panic on violation and
///   should only be used where the invariant is already known to hold.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct Amount(Decimal);

impl Amount {
    /// An [`Amount`] of zero.
    pub const ZERO: Self = Self(dec!(0));

    /// The maximum [`Amount`] this type can represent. One trillion major
    /// units is far beyond any wallet or catalogue price we will ever see,
    /// and staying well below `Decimal`'s limits keeps intermediate
    /// multiplications (rate conversion, margins) exact.
    pub const MAX: Self = Self(dec!(1_000_000_000_000));

    // --- Constructors --- //

    /// Construct an [`Amount`] from a whole number of major units.
    #[inline]
    pub fn from_major(units: u64) -> Self {
        Self(Decimal::from(units))
    }

    /// Construct an [`Amount`] from any [`Decimal`] value.
    #[inline]
    pub fn try_from_decimal(value: Decimal) -> Result<Self, Error> {
        Self::try_from_inner(value)
    }

    // --- Getters --- //

    /// Returns the contained [`Decimal`].
    #[inline]
    pub fn decimal(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    // --- Rounding policies --- //

    /// Round half-up to two decimal places. The standard display rounding.
    pub fn round_half_up_2(self) -> Self {
        Self(self.0.round_dp_with_strategy(
            2,
            RoundingStrategy::MidpointAwayFromZero,
        ))
    }

    /// Round *up* to two decimal places. Used when points display is
    /// enabled so sub-unit remainders are never given away.
    pub fn round_up_2(self) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(2, RoundingStrategy::AwayFromZero),
        )
    }

    /// Round *down* to two decimal places.
    pub fn round_down_2(self) -> Self {
        Self(self.0.round_dp_with_strategy(2, RoundingStrategy::ToZero))
    }

    // --- Checked arithmetic --- //

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_add(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_sub(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    // Amount * scalar => Amount
    pub fn checked_mul(self, rhs: Decimal) -> Option<Self> {
        let inner = self.0.checked_mul(rhs)?;
        Self::try_from_inner(inner).ok()
    }

    // Amount / scalar => Amount
    pub fn checked_div(self, rhs: Decimal) -> Option<Self> {
        let inner = self.0.checked_div(rhs)?;
        Self::try_from_inner(inner).ok()
    }

    /// This amount as a positive ledger delta.
    #[inline]
    pub fn to_signed(self) -> SignedAmount {
        SignedAmount(self.0)
    }

    /// This amount as a negative ledger delta.
    #[inline]
    pub fn to_signed_neg(self) -> SignedAmount {
        SignedAmount(-self.0)
    }

    /// Checks all internal invariants, returning [`Self`] if all were OK.
    #[inline]
    fn try_from_inner(inner: Decimal) -> Result<Self, Error> {
        if inner.is_sign_negative() && !inner.is_zero() {
            Err(Error::Negative)
        } else if inner > Self::MAX.0 {
            Err(Error::TooLarge)
        } else {
            Ok(Self(inner))
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner: Decimal = Deserialize::deserialize(deserializer)?;
        Self::try_from_inner(inner).map_err(serde::de::Error::custom)
    }
}

impl Display for Amount {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Delegate to Decimal's Display impl which respects `std::fmt`
        // syntax.
        Decimal::fmt(&self.0, f)
    }
}

impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self::try_from_inner(self.0 + rhs.0).expect("Overflowed")
    }
}

impl Sub for Amount {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self::try_from_inner(self.0 - rhs.0).expect("Underflowed")
    }
}

/// A signed ledger delta. Unlike [`Amount`], this type carries no
/// non-negativity invariant; it exists so wallet transaction rows can be
/// summed without intermediate conversions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[derive(Serialize, Deserialize)]
pub struct SignedAmount(Decimal);

impl SignedAmount {
    pub const ZERO: Self = Self(dec!(0));

    /// Wraps any [`Decimal`]; there is no invariant to enforce.
    #[inline]
    pub const fn from_decimal(decimal: Decimal) -> Self {
        Self(decimal)
    }

    #[inline]
    pub fn decimal(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    /// The magnitude of this delta as an [`Amount`].
    pub fn abs(self) -> Result<Amount, Error> {
        Amount::try_from_decimal(self.0.abs())
    }

    /// Converts to an [`Amount`], failing if this delta is negative.
    pub fn to_unsigned(self) -> Result<Amount, Error> {
        Amount::try_from_decimal(self.0)
    }
}

impl From<Amount> for SignedAmount {
    #[inline]
    fn from(amount: Amount) -> Self {
        amount.to_signed()
    }
}

impl Neg for SignedAmount {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl Add for SignedAmount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for SignedAmount {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Sum for SignedAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc + x)
    }
}

impl Display for SignedAmount {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Decimal::fmt(&self.0, f)
    }
}

// --- Tests and test infra --- //

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::arbitrary::{Arbitrary, any};
    use proptest::strategy::{BoxedStrategy, Strategy};

    use super::*;

    impl Arbitrary for Amount {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            // Cents-granular values cover everything the ledger sees.
            any::<u32>()
                .prop_map(|cents| {
                    Amount(Decimal::new(i64::from(cents), 2))
                })
                .boxed()
        }
    }

    impl Arbitrary for SignedAmount {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (any::<i32>())
                .prop_map(|cents| {
                    SignedAmount(Decimal::new(i64::from(cents), 2))
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::arbitrary::any;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn rounding_policies() {
        let amount = Amount::try_from_decimal(dec!(1.005)).unwrap();
        assert_eq!(amount.round_half_up_2(), Amount(dec!(1.01)));
        assert_eq!(amount.round_up_2(), Amount(dec!(1.01)));
        assert_eq!(amount.round_down_2(), Amount(dec!(1.00)));

        let amount = Amount::try_from_decimal(dec!(2.001)).unwrap();
        assert_eq!(amount.round_half_up_2(), Amount(dec!(2.00)));
        // Points mode never gives away the sub-unit remainder.
        assert_eq!(amount.round_up_2(), Amount(dec!(2.01)));
    }

    #[test]
    fn rejects_negative_and_huge() {
        assert!(Amount::try_from_decimal(dec!(-0.01)).is_err());
        assert!(Amount::try_from_decimal(dec!(0)).is_ok());
        assert!(
            Amount::try_from_decimal(Amount::MAX.0 + dec!(0.01)).is_err()
        );
    }

    #[test]
    fn signed_roundtrips() {
        proptest!(|(amount in any::<Amount>())| {
            prop_assert_eq!(amount.to_signed().to_unsigned().unwrap(), amount);
            let neg = amount.to_signed_neg();
            prop_assert!(neg == SignedAmount::ZERO || neg.is_negative());
            prop_assert_eq!(neg.abs().unwrap(), amount);
        })
    }

    #[test]
    fn sum_of_deltas_matches_checked_arithmetic() {
        proptest!(|(
            amount1 in any::<Amount>(),
            amount2 in any::<Amount>(),
        )| {
            let sum: SignedAmount = [
                amount1.to_signed(),
                amount2.to_signed(),
                amount1.to_signed_neg(),
            ]
            .into_iter()
            .sum();
            prop_assert_eq!(sum.to_unsigned().unwrap(), amount2);
        })
    }

    #[test]
    fn add_sub_inverse() {
        proptest!(|(
            amount1 in any::<Amount>(),
            amount2 in any::<Amount>(),
        )| {
            let (greater, lesser) = if amount1 >= amount2 {
                (amount1, amount2)
            } else {
                (amount2, amount1)
            };

            let diff = greater - lesser;
            prop_assert_eq!(greater, lesser + diff);

            let checked_diff = greater.checked_sub(lesser).unwrap();
            prop_assert_eq!(
                greater,
                lesser.checked_add(checked_diff).unwrap()
            );
            if greater > lesser {
                prop_assert!(lesser.checked_sub(greater).is_none());
            }
        })
    }
}
