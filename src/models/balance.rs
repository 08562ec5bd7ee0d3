//! Balance Model
//!
//! Per-trader margin accounting. The single-path lifecycle is:
//! debit `available` at submit -> move the filled fraction from
//! `frozen_margin` to `used_margin` -> release at close/cancel.
//! `available >= 0` is enforced at write time, not display time.

use serde::{Deserialize, Serialize};

use super::units::Usd;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    pub trader: String,
    pub available: Usd,
    /// Collateral of open positions.
    pub used_margin: Usd,
    /// Margin + fee locked under resting orders.
    pub frozen_margin: Usd,
    pub updated_at: i64,
}

/// Raised when a debit would take `available` negative.
#[derive(Debug, thiserror::Error)]
#[error("insufficient balance: available {available}, required {required}")]
pub struct InsufficientBalance {
    pub available: Usd,
    pub required: Usd,
}

impl Balance {
    pub fn new(trader: &str) -> Self {
        Self {
            trader: trader.to_string(),
            ..Default::default()
        }
    }

    pub fn total(&self) -> Usd {
        self.available + self.used_margin + self.frozen_margin
    }

    /// Lock margin + fee for a newly accepted order.
    pub fn freeze(&mut self, total: Usd, now_ms: i64) -> Result<(), InsufficientBalance> {
        if total > self.available {
            return Err(InsufficientBalance {
                available: self.available,
                required: total,
            });
        }
        self.available -= total;
        self.frozen_margin += total;
        self.updated_at = now_ms;
        Ok(())
    }

    /// Move the filled fraction of an order's lock into position margin.
    /// `margin` goes to `used_margin`; `fee` leaves the account entirely.
    pub fn fill(&mut self, margin: Usd, fee: Usd, now_ms: i64) {
        let moved = (margin + fee).min(self.frozen_margin);
        self.frozen_margin -= moved;
        self.used_margin += margin;
        self.updated_at = now_ms;
    }

    /// Return the unfilled fraction of an order's lock to `available`.
    pub fn release_frozen(&mut self, total: Usd, now_ms: i64) {
        let released = total.min(self.frozen_margin);
        self.frozen_margin -= released;
        self.available += released;
        self.updated_at = now_ms;
    }

    /// Release position margin on close/liquidation and settle realized PnL.
    /// A realized loss is already bounded by collateral upstream; the credit
    /// back to `available` is clamped at zero.
    pub fn settle_position(&mut self, collateral: Usd, realized_pnl: Usd, now_ms: i64) {
        let released = collateral.min(self.used_margin);
        self.used_margin -= released;
        self.available += (released + realized_pnl).max(0);
        self.updated_at = now_ms;
    }

    /// Ledger-sourced credit (deposit).
    pub fn credit(&mut self, amount: Usd, now_ms: i64) {
        self.available += amount;
        self.updated_at = now_ms;
    }

    /// Ledger-sourced debit (withdrawal). Fails rather than going negative.
    pub fn debit(&mut self, amount: Usd, now_ms: i64) -> Result<(), InsufficientBalance> {
        if amount > self.available {
            return Err(InsufficientBalance {
                available: self.available,
                required: amount,
            });
        }
        self.available -= amount;
        self.updated_at = now_ms;
        Ok(())
    }
}
