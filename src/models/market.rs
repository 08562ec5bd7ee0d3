//! Market Model
//!
//! Per-symbol market statistics, insurance funds and the append-only
//! settlement log.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::units::{Amount, Bp, Price, Usd};

// ============================================================================
// Market stats
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStats {
    pub symbol: String,
    /// Cumulative signed funding rate, basis points.
    pub funding_index: i64,
    /// Current per-interval funding rate, basis points.
    pub funding_rate_bp: Bp,
    pub last_funding_time: i64,
    pub next_funding_time: i64,
    pub long_oi: Amount,
    pub short_oi: Amount,
    pub last_price: Price,
    pub mark_price: Price,
    pub spot_index_price: Option<Price>,
    pub high_24h: Price,
    pub low_24h: Price,
    pub volume_24h: Amount,
    pub updated_at: i64,
}

impl MarketStats {
    pub fn new(symbol: &str, now_ms: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            funding_index: 0,
            funding_rate_bp: 0,
            last_funding_time: now_ms,
            next_funding_time: now_ms,
            long_oi: 0,
            short_oi: 0,
            last_price: 0,
            mark_price: 0,
            spot_index_price: None,
            high_24h: 0,
            low_24h: 0,
            volume_24h: 0,
            updated_at: now_ms,
        }
    }

    /// Fold a trade into the rolling stats and refresh the mark.
    pub fn record_trade(&mut self, price: Price, size: Amount, now_ms: i64) {
        self.last_price = price;
        self.mark_price = price;
        if price > self.high_24h {
            self.high_24h = price;
        }
        if self.low_24h == 0 || price < self.low_24h {
            self.low_24h = price;
        }
        self.volume_24h += size;
        self.updated_at = now_ms;
    }

    /// Book imbalance in basis points: (long_oi - short_oi) / total.
    pub fn oi_imbalance_bp(&self) -> Bp {
        let total = self.long_oi + self.short_oi;
        if total == 0 {
            return 0;
        }
        ((self.long_oi - self.short_oi) * 10_000 / total) as Bp
    }
}

// ============================================================================
// Insurance fund
// ============================================================================

/// Pool funded from liquidation residuals; first recourse for bankruptcies.
/// The balance never goes negative; an underfunded draw reports the shortfall.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsuranceFund {
    pub balance: Usd,
    pub total_contributions: Usd,
    pub total_payouts: Usd,
}

impl InsuranceFund {
    pub fn with_balance(balance: Usd) -> Self {
        Self {
            balance,
            ..Default::default()
        }
    }

    pub fn contribute(&mut self, amount: Usd) {
        debug_assert!(amount >= 0);
        self.balance += amount;
        self.total_contributions += amount;
    }

    /// Draw up to `amount`; returns what was actually drawn.
    pub fn payout(&mut self, amount: Usd) -> Usd {
        debug_assert!(amount >= 0);
        let drawn = amount.min(self.balance);
        self.balance -= drawn;
        self.total_payouts += drawn;
        drawn
    }
}

// ============================================================================
// Settlement log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Deposit,
    Withdraw,
    SettlePnl,
    FundingFee,
    Liquidation,
    MarginAdd,
    MarginRemove,
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementKind::Deposit => "deposit",
            SettlementKind::Withdraw => "withdraw",
            SettlementKind::SettlePnl => "settle_pnl",
            SettlementKind::FundingFee => "funding_fee",
            SettlementKind::Liquidation => "liquidation",
            SettlementKind::MarginAdd => "margin_add",
            SettlementKind::MarginRemove => "margin_remove",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnchainStatus {
    Pending,
    Success,
    Failed,
}

/// Append-only audit record. Written before acknowledgement for
/// ledger-reconciled entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementLogEntry {
    pub id: Uuid,
    pub kind: SettlementKind,
    pub trader: String,
    pub symbol: Option<String>,
    /// Signed 1e6 USD.
    pub amount: Usd,
    pub balance_before: Usd,
    pub balance_after: Usd,
    pub onchain_status: OnchainStatus,
    pub txn_ref: Option<String>,
    pub proof: Option<serde_json::Value>,
    pub created_at: i64,
}
