//! The price engine.
//!
//! All arithmetic is fixed-point [`Decimal`]; the sell price of an offer
//! is `round2(normalized_raw_cost * multiplier + fixed_markup)`, where
//! normalization converts the provider's currency into display units and
//! the rounding policy depends on the points mode: points display rounds
//! *up* (sub-unit remainders are never given away), plain currency
//! rounds half-up.

use common::money::Amount;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config_engine::NormalizationMode;

#[derive(Debug, thiserror::Error)]
pub enum PriceError {
    #[error("Provider margin configuration is invalid: {0}")]
    BadMargin(String),
    #[error("Normalization rate is invalid: {0}")]
    BadRate(String),
    #[error("Price arithmetic overflowed")]
    Overflow,
}

/// Process-wide pricing knobs, resolved from the environment once at
/// startup.
#[derive(Clone, Debug, PartialEq)]
pub struct PricingPolicy {
    /// Display prices in points (ceiling rounding) instead of currency.
    pub points_enabled: bool,
    /// Display-units per currency-unit when points are enabled.
    pub points_rate: Decimal,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            points_enabled: false,
            points_rate: dec!(1),
        }
    }
}

/// One provider's margin configuration, validated at load time.
#[derive(Clone, Debug, PartialEq)]
pub struct Margin {
    pub multiplier: Decimal,
    pub fixed_markup: Amount,
    pub normalization: NormalizationMode,
}

impl Margin {
    pub fn validate(&self) -> Result<(), PriceError> {
        if self.multiplier < dec!(1) {
            return Err(PriceError::BadMargin(format!(
                "multiplier {} < 1.0",
                self.multiplier,
            )));
        }
        if let NormalizationMode::SmartAuto {
            deposit_received,
            deposit_spent,
        } = &self.normalization
        {
            if deposit_spent.is_zero() || *deposit_received <= dec!(0) {
                return Err(PriceError::BadRate(
                    "smart-auto deposits must be positive".to_owned(),
                ));
            }
        }
        if let NormalizationMode::Manual { rate } = &self.normalization {
            if *rate <= dec!(0) {
                return Err(PriceError::BadRate(format!(
                    "manual rate {rate} <= 0"
                )));
            }
        }
        Ok(())
    }

    /// The effective currency conversion rate for this provider.
    fn rate(&self, policy: &PricingPolicy) -> Result<Decimal, PriceError> {
        let base = match &self.normalization {
            NormalizationMode::Direct => dec!(1),
            NormalizationMode::SmartAuto {
                deposit_received,
                deposit_spent,
            } => deposit_received
                .checked_div(*deposit_spent)
                .ok_or(PriceError::Overflow)?,
            NormalizationMode::Manual { rate } => *rate,
        };
        // Points display layers the system rate on top.
        if policy.points_enabled {
            base.checked_mul(policy.points_rate)
                .ok_or(PriceError::Overflow)
        } else {
            Ok(base)
        }
    }
}

/// Computes the sell price for a raw upstream cost.
pub fn sell_price(
    raw_cost: Amount,
    margin: &Margin,
    policy: &PricingPolicy,
) -> Result<Amount, PriceError> {
    let rate = margin.rate(policy)?;
    let normalized = raw_cost
        .checked_mul(rate)
        .ok_or(PriceError::Overflow)?;
    let priced = normalized
        .checked_mul(margin.multiplier)
        .and_then(|p| p.checked_add(margin.fixed_markup))
        .ok_or(PriceError::Overflow)?;

    Ok(if policy.points_enabled {
        priced.round_up_2()
    } else {
        priced.round_half_up_2()
    })
}

/// The 0.1% buffer [`max_profitable_cost`] applies against upstream price
/// jitter between sync and purchase.
const JITTER_BUFFER: Decimal = dec!(0.999);

/// The reverse safety function: the maximum upstream raw cost that stays
/// profitable given a price we already sold at. Rounded *down*; selling
/// at a loss is the one mistake this engine must never make.
pub fn max_profitable_cost(
    sold_price: Amount,
    margin: &Margin,
    policy: &PricingPolicy,
) -> Result<Amount, PriceError> {
    let rate = margin.rate(policy)?;
    let before_markup = sold_price
        .checked_sub(margin.fixed_markup)
        .unwrap_or(Amount::ZERO);
    let raw = before_markup
        .checked_div(margin.multiplier)
        .and_then(|c| c.checked_div(rate))
        .and_then(|c| c.checked_mul(JITTER_BUFFER))
        .ok_or(PriceError::Overflow)?;
    Ok(raw.round_down_2())
}

#[cfg(test)]
mod test {
    use super::*;

    fn amt(d: Decimal) -> Amount {
        Amount::try_from_decimal(d).unwrap()
    }

    fn margin(multiplier: Decimal, markup: Decimal) -> Margin {
        Margin {
            multiplier,
            fixed_markup: amt(markup),
            normalization: NormalizationMode::Direct,
        }
    }

    #[test]
    fn direct_pricing() {
        let policy = PricingPolicy::default();
        let m = margin(dec!(1.5), dec!(0.10));
        // 1.00 * 1.5 + 0.10 = 1.60
        assert_eq!(
            sell_price(amt(dec!(1.00)), &m, &policy).unwrap(),
            amt(dec!(1.60)),
        );
        // Half-up at the third decimal: 0.333 * 1.5 + 0.10 = 0.5995 ->
        // 0.60
        assert_eq!(
            sell_price(amt(dec!(0.333)), &m, &policy).unwrap(),
            amt(dec!(0.60)),
        );
    }

    #[test]
    fn points_mode_rounds_up() {
        let policy = PricingPolicy {
            points_enabled: true,
            points_rate: dec!(10),
        };
        let m = margin(dec!(1), dec!(0));
        // 0.111 * 10 = 1.11 exactly; 0.1111 * 10 = 1.111 -> ceil 1.12.
        assert_eq!(
            sell_price(amt(dec!(0.111)), &m, &policy).unwrap(),
            amt(dec!(1.11)),
        );
        assert_eq!(
            sell_price(amt(dec!(0.1111)), &m, &policy).unwrap(),
            amt(dec!(1.12)),
        );
    }

    #[test]
    fn smart_auto_rate() {
        let policy = PricingPolicy::default();
        let m = Margin {
            multiplier: dec!(1.2),
            fixed_markup: Amount::ZERO,
            // Deposited 90 units upstream for 100 display units:
            // rate = 100/90.
            normalization: NormalizationMode::SmartAuto {
                deposit_received: dec!(100),
                deposit_spent: dec!(90),
            },
        };
        // 9 * (100/90) * 1.2 = 12.
        assert_eq!(
            sell_price(amt(dec!(9)), &m, &policy).unwrap(),
            amt(dec!(12.00)),
        );
    }

    #[test]
    fn reverse_safety_is_conservative() {
        let policy = PricingPolicy::default();
        let m = margin(dec!(1.5), dec!(0.10));

        let sold = sell_price(amt(dec!(1.00)), &m, &policy).unwrap();
        let max_cost = max_profitable_cost(sold, &m, &policy).unwrap();

        // The bound sits just under the original cost (jitter buffer,
        // floor rounding)...
        assert!(max_cost <= amt(dec!(1.00)), "{max_cost}");
        // ...but not absurdly under.
        assert!(max_cost >= amt(dec!(0.98)), "{max_cost}");

        // Anything at or under the bound re-sells without a loss.
        let resell = sell_price(max_cost, &m, &policy).unwrap();
        assert!(resell <= sold);
    }

    #[test]
    fn margin_validation() {
        assert!(margin(dec!(1), dec!(0)).validate().is_ok());
        assert!(margin(dec!(0.9), dec!(0)).validate().is_err());

        let bad = Margin {
            multiplier: dec!(1),
            fixed_markup: Amount::ZERO,
            normalization: NormalizationMode::SmartAuto {
                deposit_received: dec!(10),
                deposit_spent: dec!(0),
            },
        };
        assert!(bad.validate().is_err());

        let bad = Margin {
            multiplier: dec!(1),
            fixed_markup: Amount::ZERO,
            normalization: NormalizationMode::Manual { rate: dec!(0) },
        };
        assert!(bad.validate().is_err());
    }
}
