//! Matching Engine Types
//!
//! Shared types and DTOs for the matching engine.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::error::RejectReason;
use crate::models::order::{Order, Side};
use crate::models::units::{price_to_decimal, Amount, Bp, Price, Usd};

// ============================================================================
// Price Level
// ============================================================================

/// Book price level. Prices are already exact 1e12 integers, so the level is
/// the price itself; the newtype pins ordering and keeps map keys honest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceLevel(Price);

impl PriceLevel {
    pub fn new(price: Price) -> Self {
        PriceLevel(price)
    }

    pub fn price(&self) -> Price {
        self.0
    }
}

impl Ord for PriceLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Book entries
// ============================================================================

/// A resting order's footprint in the book. The full order lives in the
/// engine's order map; the entry carries what matching needs.
#[derive(Debug, Clone)]
pub struct OrderEntry {
    pub id: Uuid,
    pub trader: String,
    /// `None` for a resting market order (prices at the reference mark).
    pub price: Option<Price>,
    pub remaining: Amount,
    pub created_at: i64,
}

// ============================================================================
// Matches & trades
// ============================================================================

/// The event of two orders crossing. Ephemeral: lives in the pending-match
/// queue until the ledger acknowledges it. Carries the exact per-side
/// collateral and fee the engine moved, so the pair builder and the ledger
/// batch see the same numbers the balances saw.
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub id: Uuid,
    pub symbol: String,
    pub long_order_id: Uuid,
    pub short_order_id: Uuid,
    pub long_trader: String,
    pub short_trader: String,
    pub long_nonce: u64,
    pub short_nonce: u64,
    pub price: Price,
    pub size: Amount,
    /// Which side took liquidity.
    pub taker_side: Side,
    pub long_collateral: Usd,
    pub short_collateral: Usd,
    pub long_fee: Usd,
    pub short_fee: Usd,
    pub long_leverage_bp: Bp,
    pub short_leverage_bp: Bp,
    pub timestamp: i64,
}

/// Trade event for broadcasting on `trades:{symbol}`.
#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    pub id: Uuid,
    pub symbol: String,
    pub price: Price,
    pub size: Amount,
    pub side: Side,
    pub long_trader: String,
    pub short_trader: String,
    pub timestamp: i64,
}

impl TradeEvent {
    pub fn from_match(m: &Match) -> Self {
        Self {
            id: m.id,
            symbol: m.symbol.clone(),
            price: m.price,
            size: m.size,
            side: m.taker_side,
            long_trader: m.long_trader.clone(),
            short_trader: m.short_trader.clone(),
            timestamp: m.timestamp,
        }
    }
}

// ============================================================================
// Submit result
// ============================================================================

/// Result of `submit`. Policy-level terminations (FOK unfillable, post-only
/// would cross, IOC residual) come back as a terminal order plus `rejection`;
/// validation failures never get this far.
#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub order: Order,
    pub matches: Vec<Match>,
    pub rejection: Option<RejectReason>,
}

// ============================================================================
// Depth
// ============================================================================

/// Aggregated depth snapshot for `orderbook:{symbol}`.
#[derive(Debug, Clone, Serialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    /// (price, size) levels, best first; decimal-rendered for subscribers.
    pub longs: Vec<[String; 2]>,
    pub shorts: Vec<[String; 2]>,
    pub last_price: Option<Price>,
    pub timestamp: i64,
}

pub fn render_level(price: Price, size: Amount) -> [String; 2] {
    [
        price_to_decimal(price).normalize().to_string(),
        crate::models::units::amount_to_decimal(size)
            .normalize()
            .to_string(),
    ]
}
