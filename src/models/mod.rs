pub mod balance;
pub mod market;
pub mod order;
pub mod position;
pub mod units;

pub use balance::Balance;
pub use market::{InsuranceFund, MarketStats, OnchainStatus, SettlementKind, SettlementLogEntry};
pub use order::{
    CancelIntent, CloseIntent, Order, OrderIntent, OrderStatus, OrderType, Side, TimeInForce,
    TpSlIntent,
};
pub use position::{Pair, PairStatus, PositionRisk, RiskLevel, TpSl};
