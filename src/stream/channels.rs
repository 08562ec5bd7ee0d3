//! Stream Channel Definitions
//!
//! Channels a subscriber can name, and the event payloads pushed on them.
//! Deltas on a channel are delivered in commit order; ordering across
//! channels is not guaranteed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::Side;
use crate::models::position::PositionRisk;
use crate::models::units::{Amount, Bp, Price, Usd};

/// Subscription channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// orderbook:{symbol}
    Orderbook(String),
    /// trades:{symbol}
    Trades(String),
    /// risk:{trader}
    TraderRisk(String),
    /// risk:global
    GlobalRisk,
    /// events
    Events,
}

impl Channel {
    pub fn parse(channel_str: &str) -> Option<Self> {
        if channel_str == "events" {
            return Some(Channel::Events);
        }
        if channel_str == "risk:global" {
            return Some(Channel::GlobalRisk);
        }
        let parts: Vec<&str> = channel_str.splitn(2, ':').collect();
        match parts.as_slice() {
            ["orderbook", symbol] => Some(Channel::Orderbook(symbol.to_string())),
            ["trades", symbol] => Some(Channel::Trades(symbol.to_string())),
            ["risk", trader] => Some(Channel::TraderRisk(trader.to_string())),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Channel::Orderbook(symbol) => format!("orderbook:{}", symbol),
            Channel::Trades(symbol) => format!("trades:{}", symbol),
            Channel::TraderRisk(trader) => format!("risk:{}", trader),
            Channel::GlobalRisk => "risk:global".to_string(),
            Channel::Events => "events".to_string(),
        }
    }
}

// ============================================================================
// Event payloads
// ============================================================================

/// Per-symbol funding summary for the global risk stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSummary {
    pub symbol: String,
    pub funding_rate_bp: Bp,
    pub next_funding_time: i64,
}

/// Liquidation-queue head entry for the global risk stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationQueueEntry {
    pub pair_id: Uuid,
    pub trader: String,
    pub symbol: String,
    pub side: Side,
    pub margin_ratio_bp: Bp,
    pub urgency_bp: Bp,
}

/// Global risk snapshot pushed on `risk:global`.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalRiskSnapshot {
    pub insurance_total: Usd,
    pub insurance_by_symbol: Vec<(String, Usd)>,
    pub liquidation_queue_len: usize,
    pub liquidation_queue_head: Vec<LiquidationQueueEntry>,
    pub funding: Vec<FundingSummary>,
    pub timestamp: i64,
}

/// Per-trader risk snapshot pushed on `risk:{trader}`.
#[derive(Debug, Clone, Serialize)]
pub struct TraderRiskSnapshot {
    pub trader: String,
    pub positions: Vec<PositionRisk>,
    pub timestamp: i64,
}

/// Throttled risk-engine publications.
#[derive(Debug, Clone)]
pub enum RiskStreamUpdate {
    Global(GlobalRiskSnapshot),
    Trader(TraderRiskSnapshot),
}

/// Venue events pushed on `events`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VenueEvent {
    AdlTriggered {
        pair_id: Uuid,
        trader: String,
        symbol: String,
        side: Side,
        reduced_size: Amount,
        extracted_pnl: Usd,
        timestamp: i64,
    },
    Liquidation {
        pair_id: Uuid,
        trader: String,
        symbol: String,
        side: Side,
        mark_price: Price,
        liquidator_fee: Usd,
        insurance_contribution: Usd,
        timestamp: i64,
    },
    TpslTriggered {
        pair_id: Uuid,
        trader: String,
        symbol: String,
        side: Side,
        trigger_price: Price,
        is_take_profit: bool,
        timestamp: i64,
    },
    TpslExecuted {
        pair_id: Uuid,
        trader: String,
        symbol: String,
        timestamp: i64,
    },
    PositionClosed {
        pair_id: Uuid,
        symbol: String,
        exit_price: Price,
        long_pnl: Usd,
        short_pnl: Usd,
        timestamp: i64,
    },
    PartialClose {
        pair_id: Uuid,
        symbol: String,
        closed_size: Amount,
        exit_price: Price,
        timestamp: i64,
    },
    MarginUpdated {
        pair_id: Uuid,
        trader: String,
        side: Side,
        collateral: Usd,
        leverage_bp: Bp,
        timestamp: i64,
    },
    BalanceUpdate {
        trader: String,
        available: Usd,
        used_margin: Usd,
        frozen_margin: Usd,
        timestamp: i64,
    },
    FundingSettlement {
        symbol: String,
        rate_bp: Bp,
        pairs_settled: usize,
        timestamp: i64,
    },
    RiskAlert {
        pair_id: Uuid,
        trader: String,
        symbol: String,
        side: Side,
        margin_ratio_bp: Bp,
        level: crate::models::position::RiskLevel,
        timestamp: i64,
    },
    /// Safety event: ADL queue exhausted with uncovered deficit. Not a
    /// normal operating state.
    Insolvency {
        symbol: String,
        uncovered_deficit: Usd,
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse_round_trip() {
        for name in [
            "orderbook:DOGEUSD",
            "trades:PEPEUSD",
            "risk:0xabc",
            "risk:global",
            "events",
        ] {
            let channel = Channel::parse(name).unwrap();
            assert_eq!(channel.name(), name);
        }
    }

    #[test]
    fn test_channel_parse_rejects_unknown() {
        assert!(Channel::parse("klines").is_none());
        assert!(Channel::parse("orderbook").is_none());
    }

    #[test]
    fn test_risk_global_is_not_trader_channel() {
        assert_eq!(Channel::parse("risk:global"), Some(Channel::GlobalRisk));
        assert_eq!(
            Channel::parse("risk:globalx"),
            Some(Channel::TraderRisk("globalx".to_string()))
        );
    }

    #[test]
    fn test_event_serialization_tags() {
        let event = VenueEvent::Insolvency {
            symbol: "DOGEUSD".to_string(),
            uncovered_deficit: 5,
            timestamp: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "insolvency");
    }
}
