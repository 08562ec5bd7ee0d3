//! Fixed-Point Units
//!
//! Every monetary decision in the venue is made in exact integer arithmetic.
//! The scales are fixed by the settlement contract:
//! - token amounts   : 1e18 (`Amount`)
//! - USD per token   : 1e12 (`Price`)
//! - USD             : 1e6  (`Usd`)
//! - basis points    : 1e4  (`Bp`) - leverage, fee rates, margin ratios
//!
//! `rust_decimal` appears only at the telemetry/display boundary.

use rust_decimal::Decimal;

/// Token amount scaled by 1e18.
pub type Amount = i128;

/// USD-per-token price scaled by 1e12.
pub type Price = i64;

/// USD value scaled by 1e6.
pub type Usd = i64;

/// Basis points. 10_000 = 100% (or 1x for leverage).
pub type Bp = i64;

/// Scale of `Amount`.
pub const AMOUNT_SCALE: i128 = 1_000_000_000_000_000_000;

/// Scale of `Price`.
pub const PRICE_SCALE: i64 = 1_000_000_000_000;

/// Scale of `Usd`.
pub const USD_SCALE: i64 = 1_000_000;

/// Basis-point precision. Leverage of 10_000 is 1x.
pub const PRECISION: Bp = 10_000;

/// Combined divisor taking `Amount * Price` down to `Usd`:
/// 1e18 * 1e12 / 1e24 = 1e6.
const NOTIONAL_DIVISOR: i128 = 1_000_000_000_000_000_000_000_000;

// ============================================================================
// Core arithmetic
// ============================================================================

/// Notional value of `size` tokens at `price`, in USD 1e6.
pub fn notional_usd(size: Amount, price: Price) -> Usd {
    (size * price as i128 / NOTIONAL_DIVISOR) as Usd
}

/// Margin required for a notional at the given leverage.
pub fn margin_usd(notional: Usd, leverage_bp: Bp) -> Usd {
    (notional as i128 * PRECISION as i128 / leverage_bp as i128) as Usd
}

/// Fee on a notional at `fee_bp` basis points.
pub fn fee_usd(notional: Usd, fee_bp: Bp) -> Usd {
    (notional as i128 * fee_bp as i128 / PRECISION as i128) as Usd
}

/// Signed price PnL for one side of a pair. `direction` is +1 for long,
/// -1 for short. Does not include fees.
pub fn price_pnl_usd(direction: i64, size: Amount, entry: Price, mark: Price) -> Usd {
    (direction as i128 * size * (mark as i128 - entry as i128) / NOTIONAL_DIVISOR) as Usd
}

/// Leverage implied by a notional over its collateral, in basis points.
pub fn implied_leverage_bp(notional: Usd, collateral: Usd) -> Bp {
    if collateral <= 0 {
        return 0;
    }
    (notional as i128 * PRECISION as i128 / collateral as i128) as Bp
}

/// Volume-weighted average of two (price, size) legs.
pub fn weighted_entry_price(p1: Price, s1: Amount, p2: Price, s2: Amount) -> Price {
    let total = s1 + s2;
    if total == 0 {
        return 0;
    }
    ((p1 as i128 * s1 + p2 as i128 * s2) / total) as Price
}

// ============================================================================
// Risk arithmetic
// ============================================================================

/// Effective maintenance-margin ratio in basis points.
///
/// Capped at half the inverse leverage so the liquidation price always lies
/// strictly on the losing side of entry.
pub fn effective_mmr_bp(base_mmr_bp: Bp, leverage_bp: Bp) -> Bp {
    let inverse_leverage = PRECISION as i128 * PRECISION as i128 / leverage_bp as i128;
    base_mmr_bp.min((inverse_leverage / 2) as Bp)
}

/// Liquidation price for one side of a pair.
///
/// long:  entry * (1 - 1/leverage + mmr)
/// short: entry * (1 + 1/leverage - mmr)
pub fn liquidation_price(entry: Price, leverage_bp: Bp, mmr_bp: Bp, is_long: bool) -> Price {
    let inverse_leverage = PRECISION as i128 * PRECISION as i128 / leverage_bp as i128;
    let shift = inverse_leverage - mmr_bp as i128;
    let factor = if is_long {
        PRECISION as i128 - shift
    } else {
        PRECISION as i128 + shift
    };
    (entry as i128 * factor / PRECISION as i128) as Price
}

/// Bankruptcy price: where collateral is exactly consumed (MMR = 0).
pub fn bankruptcy_price(entry: Price, leverage_bp: Bp, is_long: bool) -> Price {
    liquidation_price(entry, leverage_bp, 0, is_long)
}

/// Margin ratio in basis points under the "higher is worse" convention:
/// maintenance_margin / equity. Non-positive equity saturates well past the
/// liquidation threshold.
pub fn margin_ratio_bp(maintenance_margin: Usd, equity: Usd) -> Bp {
    if equity <= 0 {
        return Bp::MAX;
    }
    (maintenance_margin as i128 * PRECISION as i128 / equity as i128) as Bp
}

/// Return on equity in basis points.
pub fn roe_bp(pnl: Usd, collateral: Usd) -> Bp {
    if collateral <= 0 {
        return 0;
    }
    (pnl as i128 * PRECISION as i128 / collateral as i128) as Bp
}

/// ADL score: max(0, pnl / collateral) * leverage, in basis points.
/// Profitable, highly levered positions rank first.
pub fn adl_score_bp(pnl: Usd, collateral: Usd, leverage_bp: Bp) -> Bp {
    if pnl <= 0 || collateral <= 0 {
        return 0;
    }
    (pnl as i128 * leverage_bp as i128 / collateral as i128) as Bp
}

/// Scale a quantity by a ratio expressed in basis points (10_000 = 1.0).
pub fn apply_ratio(value: i128, ratio_bp: Bp) -> i128 {
    value * ratio_bp as i128 / PRECISION as i128
}

// ============================================================================
// Telemetry conversions
// ============================================================================

/// USD 1e6 to a display Decimal.
pub fn usd_to_decimal(value: Usd) -> Decimal {
    Decimal::from_i128_with_scale(value as i128, 6)
}

/// Price 1e12 to a display Decimal.
pub fn price_to_decimal(value: Price) -> Decimal {
    Decimal::from_i128_with_scale(value as i128, 12)
}

/// Amount 1e18 to a display Decimal.
pub fn amount_to_decimal(value: Amount) -> Decimal {
    Decimal::from_i128_with_scale(value, 18)
}

/// Basis points to a display Decimal fraction (10_000 -> 1.0).
pub fn bp_to_decimal(value: Bp) -> Decimal {
    Decimal::from_i128_with_scale(value as i128, 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notional_round_numbers() {
        // 1 token at 1.00 USD = 1 USD
        assert_eq!(notional_usd(AMOUNT_SCALE, PRICE_SCALE), USD_SCALE);
        // 3 tokens at 0.50 USD = 1.5 USD
        assert_eq!(notional_usd(3 * AMOUNT_SCALE, PRICE_SCALE / 2), 1_500_000);
    }

    #[test]
    fn test_margin_at_leverage() {
        let notional = 100 * USD_SCALE;
        // 1x leverage: full notional
        assert_eq!(margin_usd(notional, PRECISION), notional);
        // 20x leverage: 5%
        assert_eq!(margin_usd(notional, 20 * PRECISION), 5 * USD_SCALE);
    }

    #[test]
    fn test_price_pnl_sign() {
        let size = AMOUNT_SCALE;
        let entry = PRICE_SCALE;
        let up = PRICE_SCALE + PRICE_SCALE / 10;

        assert_eq!(price_pnl_usd(1, size, entry, up), 100_000); // long +0.10
        assert_eq!(price_pnl_usd(-1, size, entry, up), -100_000); // short -0.10
        assert_eq!(price_pnl_usd(1, size, entry, entry), 0);
    }

    #[test]
    fn test_effective_mmr_capped_by_leverage() {
        // 20x: inverse leverage is 500bp, cap is 250bp, base 200bp stands
        assert_eq!(effective_mmr_bp(200, 20 * PRECISION), 200);
        // 50x: inverse leverage is 200bp, cap is 100bp, base 200bp is cut
        assert_eq!(effective_mmr_bp(200, 50 * PRECISION), 100);
        // mmr must stay below inverse leverage for every leverage >= 1x
        for lev in [PRECISION, 2 * PRECISION, 20 * PRECISION, 100 * PRECISION] {
            let mmr = effective_mmr_bp(200, lev);
            assert!((mmr as i128) < PRECISION as i128 * PRECISION as i128 / lev as i128);
        }
    }

    #[test]
    fn test_liquidation_price_sides() {
        let entry = PRICE_SCALE; // 1.00
        let lev = 20 * PRECISION;
        let mmr = effective_mmr_bp(200, lev);

        let long_liq = liquidation_price(entry, lev, mmr, true);
        let short_liq = liquidation_price(entry, lev, mmr, false);

        // 1 - 0.05 + 0.02 = 0.97 / 1 + 0.05 - 0.02 = 1.03
        assert_eq!(long_liq, 970_000_000_000);
        assert_eq!(short_liq, 1_030_000_000_000);
        assert!(long_liq < entry);
        assert!(short_liq > entry);
    }

    #[test]
    fn test_bankruptcy_past_liquidation() {
        let entry = PRICE_SCALE;
        let lev = 20 * PRECISION;
        let mmr = effective_mmr_bp(200, lev);

        // long 20x: bankruptcy at 0.95, below the 0.97 liquidation trigger
        assert_eq!(bankruptcy_price(entry, lev, true), 950_000_000_000);
        assert!(bankruptcy_price(entry, lev, true) < liquidation_price(entry, lev, mmr, true));
        assert!(bankruptcy_price(entry, lev, false) > liquidation_price(entry, lev, mmr, false));
    }

    #[test]
    fn test_margin_ratio_saturates_on_bankrupt_equity() {
        assert_eq!(margin_ratio_bp(1_000_000, 0), Bp::MAX);
        assert_eq!(margin_ratio_bp(1_000_000, -5), Bp::MAX);
        // maintenance 2, equity 4 -> 5000bp
        assert_eq!(margin_ratio_bp(2_000_000, 4_000_000), 5_000);
    }

    #[test]
    fn test_weighted_entry_price() {
        let p = weighted_entry_price(PRICE_SCALE, AMOUNT_SCALE, 2 * PRICE_SCALE, AMOUNT_SCALE);
        assert_eq!(p, PRICE_SCALE * 3 / 2);
    }

    #[test]
    fn test_adl_score_only_for_winners() {
        assert_eq!(adl_score_bp(-1, 1_000_000, 20 * PRECISION), 0);
        assert_eq!(adl_score_bp(0, 1_000_000, 20 * PRECISION), 0);
        // pnl == collateral at 20x -> 200_000bp
        assert_eq!(adl_score_bp(1_000_000, 1_000_000, 20 * PRECISION), 200_000);
    }

    #[test]
    fn test_apply_ratio() {
        assert_eq!(apply_ratio(100, 5_000), 50);
        assert_eq!(apply_ratio(3 * AMOUNT_SCALE, PRECISION), 3 * AMOUNT_SCALE);
    }

    #[test]
    fn test_telemetry_conversions() {
        use rust_decimal_macros::dec;
        assert_eq!(usd_to_decimal(1_500_000), dec!(1.500000));
        assert_eq!(price_to_decimal(950_000_000_000), dec!(0.950000000000));
        assert_eq!(bp_to_decimal(200), dec!(0.0200));
    }
}
