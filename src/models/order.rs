//! Order Model
//!
//! Engine-owned orders plus the signed intents that create and cancel them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::units::{Amount, Bp, Price, Usd};

/// Position side. Perp orders open exposure long or short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short. Used in signed PnL arithmetic.
    pub fn direction(&self) -> i64 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl OrderType {
    /// Conditional orders live in the trigger sets, never on the book.
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderType::StopLoss | OrderType::TakeProfit | OrderType::TrailingStop
        )
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
            OrderType::StopLoss => write!(f, "stop_loss"),
            OrderType::TakeProfit => write!(f, "take_profit"),
            OrderType::TrailingStop => write!(f, "trailing_stop"),
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good Till Cancel
    GTC,
    /// Immediate or Cancel
    IOC,
    /// Fill or Kill
    FOK,
    /// Good Till Date (deadline-bounded)
    GTD,
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::GTC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Triggered,
    Expired,
}

impl OrderStatus {
    /// Terminal statuses are sinks of the status DAG; the order leaves the
    /// book and cannot transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Triggered => "triggered",
            OrderStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Order
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub client_order_id: Option<String>,
    pub trader: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub post_only: bool,
    pub size: Amount,
    pub filled_size: Amount,
    pub avg_fill_price: Price,
    pub total_fill_value: i128,
    pub leverage_bp: Bp,
    /// Limit price; `None` for market orders.
    pub price: Option<Price>,
    pub trigger_price: Option<Price>,
    pub deadline: i64,
    pub nonce: u64,
    pub signature: String,
    pub status: OrderStatus,
    /// Margin locked from `available` at acceptance.
    pub locked_margin: Usd,
    /// Fee locked from `available` at acceptance.
    pub locked_fee: Usd,
    /// Margin already moved to `used_margin` by fills.
    pub moved_margin: Usd,
    /// Fee already charged by fills.
    pub moved_fee: Usd,
    pub last_fill_price: Option<Price>,
    pub last_fill_size: Option<Amount>,
    pub last_fill_time: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    pub fn remaining_size(&self) -> Amount {
        self.size - self.filled_size
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Pending | OrderStatus::PartiallyFilled
        )
    }

    /// Record a fill, maintaining the size-weighted average price and the
    /// running fill value. Transitions to `Filled` when the size is consumed.
    pub fn apply_fill(&mut self, price: Price, size: Amount, now_ms: i64) {
        debug_assert!(self.filled_size + size <= self.size);

        self.total_fill_value += size * price as i128;
        self.filled_size += size;
        if self.filled_size > 0 {
            self.avg_fill_price = (self.total_fill_value / self.filled_size) as Price;
        }

        self.last_fill_price = Some(price);
        self.last_fill_size = Some(size);
        self.last_fill_time = Some(now_ms);
        self.updated_at = now_ms;

        self.status = if self.filled_size >= self.size {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    /// Fraction of the order still unfilled, in basis points.
    pub fn unfilled_ratio_bp(&self) -> Bp {
        if self.size == 0 {
            return 0;
        }
        (self.remaining_size() * super::units::PRECISION as i128 / self.size) as Bp
    }

    /// Locked margin not yet consumed by fills.
    pub fn remaining_locked_margin(&self) -> Usd {
        self.locked_margin - self.moved_margin
    }

    /// Locked fee not yet charged by fills.
    pub fn remaining_locked_fee(&self) -> Usd {
        self.locked_fee - self.moved_fee
    }
}

// ============================================================================
// Signed intents (canonical fields; wire encoding lives with the transport)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub trader: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub post_only: bool,
    pub size: Amount,
    pub leverage_bp: Bp,
    /// 0 means market.
    pub price: Price,
    pub trigger_price: Option<Price>,
    pub deadline: i64,
    pub nonce: u64,
    pub signature: String,
    pub client_order_id: Option<String>,
}

impl OrderIntent {
    pub fn limit_price(&self) -> Option<Price> {
        if self.price == 0 {
            None
        } else {
            Some(self.price)
        }
    }

    /// Materialize the engine-owned order for an accepted intent.
    pub fn into_order(self, id: Uuid) -> Order {
        let now = Utc::now().timestamp_millis();
        let price = self.limit_price();
        Order {
            id,
            client_order_id: self.client_order_id,
            trader: self.trader,
            symbol: self.symbol,
            side: self.side,
            order_type: self.order_type,
            time_in_force: self.time_in_force,
            reduce_only: self.reduce_only,
            post_only: self.post_only,
            size: self.size,
            filled_size: 0,
            avg_fill_price: 0,
            total_fill_value: 0,
            leverage_bp: self.leverage_bp,
            price,
            trigger_price: self.trigger_price,
            deadline: self.deadline,
            nonce: self.nonce,
            signature: self.signature,
            status: OrderStatus::Pending,
            locked_margin: 0,
            locked_fee: 0,
            moved_margin: 0,
            moved_fee: 0,
            last_fill_price: None,
            last_fill_size: None,
            last_fill_time: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelIntent {
    pub trader: String,
    pub order_id: Uuid,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseIntent {
    pub trader: String,
    pub pair_id: Uuid,
    /// 10_000 = full close.
    pub ratio_bp: Bp,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpSlIntent {
    pub trader: String,
    pub pair_id: Uuid,
    pub take_profit_price: Option<Price>,
    pub stop_loss_price: Option<Price>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE};

    fn test_intent() -> OrderIntent {
        OrderIntent {
            trader: "0xabc".to_string(),
            symbol: "DOGEUSD".to_string(),
            side: Side::Long,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::GTC,
            reduce_only: false,
            post_only: false,
            size: 2 * AMOUNT_SCALE,
            leverage_bp: 100_000,
            price: PRICE_SCALE,
            trigger_price: None,
            deadline: i64::MAX,
            nonce: 7,
            signature: String::new(),
            client_order_id: None,
        }
    }

    #[test]
    fn test_fill_tracks_weighted_average() {
        let mut order = test_intent().into_order(Uuid::new_v4());

        order.apply_fill(PRICE_SCALE, AMOUNT_SCALE, 1);
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.avg_fill_price, PRICE_SCALE);

        order.apply_fill(PRICE_SCALE / 2, AMOUNT_SCALE, 2);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, PRICE_SCALE * 3 / 4);
        assert_eq!(order.remaining_size(), 0);
    }

    #[test]
    fn test_unfilled_ratio() {
        let mut order = test_intent().into_order(Uuid::new_v4());
        assert_eq!(order.unfilled_ratio_bp(), 10_000);

        order.apply_fill(PRICE_SCALE, AMOUNT_SCALE, 1);
        assert_eq!(order.unfilled_ratio_bp(), 5_000);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::Triggered.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_market_price_is_none() {
        let mut intent = test_intent();
        intent.order_type = OrderType::Market;
        intent.price = 0;
        assert_eq!(intent.limit_price(), None);
    }

    #[test]
    fn test_conditional_types() {
        assert!(OrderType::StopLoss.is_conditional());
        assert!(OrderType::TrailingStop.is_conditional());
        assert!(!OrderType::Limit.is_conditional());
    }
}
