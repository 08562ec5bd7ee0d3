//! Order Matching Engine Module
//!
//! Price/time-priority matching for perp order flow.
//!
//! # Architecture
//!
//! ```text
//! Signed Intent
//!   ↓ validate (deadline, nonce, signature, funds)
//! MatchingEngine
//!   ├→ Orderbook (per symbol, single lock per critical section)
//!   ├→ Balance legs (debit at submit, move at fill, release at cancel)
//!   ├→ Pending-match queue (ledger settlement)
//!   └→ Trade / depth / order broadcasts
//! ```
//!
//! Conditional (TP/SL/trailing) intents never reach this module directly;
//! the trigger service converts them to market orders when they fire.

mod engine;
mod orderbook;
mod types;

pub use engine::{EngineConfig, MatchingEngine};
pub use orderbook::{BookInner, MakerFill, Orderbook};
pub use types::*;
