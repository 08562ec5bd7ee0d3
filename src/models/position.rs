//! Position Model
//!
//! Positions are stored as paired positions: one long trader and one short
//! trader bound to the same size and entry. Per-side risk fields are derived
//! by the risk engine each tick and kept separate from the pair core, which
//! only the matching/position path mutates.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::order::Side;
use super::units::{Amount, Bp, Price, Usd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Active,
    Closed,
    Liquidated,
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairStatus::Active => write!(f, "active"),
            PairStatus::Closed => write!(f, "closed"),
            PairStatus::Liquidated => write!(f, "liquidated"),
        }
    }
}

/// Take-profit / stop-loss attachment for one side of a pair.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TpSl {
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
}

impl TpSl {
    pub fn is_empty(&self) -> bool {
        self.take_profit.is_none() && self.stop_loss.is_none()
    }
}

// ============================================================================
// Pair
// ============================================================================

/// A paired position. Created by a match, lives until closed or liquidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pair {
    pub id: Uuid,
    /// Ledger-assigned identity, authoritative once reconciled.
    pub ledger_pair_id: Option<u64>,
    pub symbol: String,
    pub long_trader: String,
    pub short_trader: String,
    pub size: Amount,
    pub entry_price: Price,
    pub long_collateral: Usd,
    pub short_collateral: Usd,
    pub long_leverage_bp: Bp,
    pub short_leverage_bp: Bp,
    pub long_open_fee: Usd,
    pub short_open_fee: Usd,
    /// Per-symbol funding index captured at open, per side.
    pub entry_funding_index_long: i64,
    pub entry_funding_index_short: i64,
    /// Net funding paid (positive) or received (negative), per side.
    pub acc_funding_long: Usd,
    pub acc_funding_short: Usd,
    pub long_tp_sl: TpSl,
    pub short_tp_sl: TpSl,
    pub status: PairStatus,
    pub open_time: i64,
    pub updated_at: i64,
}

impl Pair {
    pub fn is_active(&self) -> bool {
        self.status == PairStatus::Active
    }

    /// The side a trader holds in this pair, if any.
    pub fn side_of(&self, trader: &str) -> Option<Side> {
        if self.long_trader == trader {
            Some(Side::Long)
        } else if self.short_trader == trader {
            Some(Side::Short)
        } else {
            None
        }
    }

    pub fn trader_of(&self, side: Side) -> &str {
        match side {
            Side::Long => &self.long_trader,
            Side::Short => &self.short_trader,
        }
    }

    pub fn collateral_of(&self, side: Side) -> Usd {
        match side {
            Side::Long => self.long_collateral,
            Side::Short => self.short_collateral,
        }
    }

    pub fn leverage_of(&self, side: Side) -> Bp {
        match side {
            Side::Long => self.long_leverage_bp,
            Side::Short => self.short_leverage_bp,
        }
    }

    pub fn open_fee_of(&self, side: Side) -> Usd {
        match side {
            Side::Long => self.long_open_fee,
            Side::Short => self.short_open_fee,
        }
    }

    pub fn tp_sl_of(&self, side: Side) -> TpSl {
        match side {
            Side::Long => self.long_tp_sl,
            Side::Short => self.short_tp_sl,
        }
    }
}

// ============================================================================
// Derived risk fields
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classification thresholds on the "higher is worse" margin ratio.
    pub fn classify(margin_ratio_bp: Bp) -> RiskLevel {
        if margin_ratio_bp >= 10_000 {
            RiskLevel::Critical
        } else if margin_ratio_bp >= 8_000 {
            RiskLevel::High
        } else if margin_ratio_bp >= 5_000 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Per-side risk vector recomputed on every risk tick. Written only by the
/// risk engine; read by streams and queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRisk {
    pub pair_id: Uuid,
    pub trader: String,
    pub symbol: String,
    pub side: Side,
    pub size: Amount,
    pub entry_price: Price,
    pub mark_price: Price,
    pub notional: Usd,
    pub collateral: Usd,
    pub leverage_bp: Bp,
    pub unrealized_pnl: Usd,
    /// collateral + unrealized_pnl
    pub equity: Usd,
    pub effective_mmr_bp: Bp,
    pub maintenance_margin: Usd,
    pub margin_ratio_bp: Bp,
    pub roe_bp: Bp,
    pub liquidation_price: Price,
    pub bankruptcy_price: Price,
    pub break_even_price: Price,
    pub adl_score_bp: Bp,
    /// 1..=5 quintile among positive scores, 0 when unranked.
    pub adl_rank: u8,
    pub risk_level: RiskLevel,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE};
    use chrono::Utc;

    fn test_pair() -> Pair {
        let now = Utc::now().timestamp_millis();
        Pair {
            id: Uuid::new_v4(),
            ledger_pair_id: None,
            symbol: "PEPEUSD".to_string(),
            long_trader: "0xlong".to_string(),
            short_trader: "0xshort".to_string(),
            size: AMOUNT_SCALE,
            entry_price: PRICE_SCALE,
            long_collateral: 50_000,
            short_collateral: 100_000,
            long_leverage_bp: 200_000,
            short_leverage_bp: 100_000,
            long_open_fee: 500,
            short_open_fee: 500,
            entry_funding_index_long: 0,
            entry_funding_index_short: 0,
            acc_funding_long: 0,
            acc_funding_short: 0,
            long_tp_sl: TpSl::default(),
            short_tp_sl: TpSl::default(),
            status: PairStatus::Active,
            open_time: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_side_of() {
        let pair = test_pair();
        assert_eq!(pair.side_of("0xlong"), Some(Side::Long));
        assert_eq!(pair.side_of("0xshort"), Some(Side::Short));
        assert_eq!(pair.side_of("0xother"), None);
    }

    #[test]
    fn test_per_side_accessors() {
        let pair = test_pair();
        assert_eq!(pair.collateral_of(Side::Long), 50_000);
        assert_eq!(pair.collateral_of(Side::Short), 100_000);
        assert_eq!(pair.leverage_of(Side::Long), 200_000);
        assert_eq!(pair.trader_of(Side::Short), "0xshort");
    }

    #[test]
    fn test_risk_level_thresholds() {
        assert_eq!(RiskLevel::classify(0), RiskLevel::Low);
        assert_eq!(RiskLevel::classify(4_999), RiskLevel::Low);
        assert_eq!(RiskLevel::classify(5_000), RiskLevel::Medium);
        assert_eq!(RiskLevel::classify(8_000), RiskLevel::High);
        assert_eq!(RiskLevel::classify(10_000), RiskLevel::Critical);
        assert_eq!(RiskLevel::classify(Bp::MAX), RiskLevel::Critical);
    }

    #[test]
    fn test_tp_sl_empty() {
        let mut tp_sl = TpSl::default();
        assert!(tp_sl.is_empty());
        tp_sl.take_profit = Some(PRICE_SCALE);
        assert!(!tp_sl.is_empty());
    }
}
