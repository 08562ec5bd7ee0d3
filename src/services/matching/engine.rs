//! Matching Engine
//!
//! Accepts signed order intents, owns per-symbol books, produces matches
//! under price/time priority and applies the balance legs of every fill
//! inside the book's critical section. Pair formation happens downstream off
//! the emitted matches.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::orderbook::{MakerFill, Orderbook};
use super::types::{render_level, DepthSnapshot, Match, OrderEntry, SubmitResult, TradeEvent};
use crate::auth::SignatureVerifier;
use crate::error::{CoreError, RejectReason};
use crate::models::order::{
    CancelIntent, Order, OrderIntent, OrderStatus, OrderType, Side, TimeInForce,
};
use crate::models::units::{fee_usd, margin_usd, notional_usd, Amount, Bp, Usd, PRECISION};
use crate::state::{PendingMatch, VenueState};

const RECENT_TRADES_CAP: usize = 1_000;

/// Engine tunables, sliced out of `AppConfig` at boot.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub taker_fee_bp: Bp,
    pub maker_fee_bp: Bp,
    pub min_order_size: Amount,
    pub max_leverage_bp: Bp,
}

pub struct MatchingEngine {
    state: Arc<VenueState>,
    verifier: Arc<dyn SignatureVerifier>,
    config: EngineConfig,
    books: DashMap<String, Arc<Orderbook>>,
    orders: DashMap<Uuid, Order>,
    recent_trades: DashMap<String, VecDeque<TradeEvent>>,
    trade_tx: broadcast::Sender<TradeEvent>,
    depth_tx: broadcast::Sender<DepthSnapshot>,
    order_tx: broadcast::Sender<Order>,
}

impl MatchingEngine {
    pub fn new(
        state: Arc<VenueState>,
        verifier: Arc<dyn SignatureVerifier>,
        config: EngineConfig,
    ) -> Self {
        let books = DashMap::new();
        let recent_trades = DashMap::new();
        let orders = DashMap::new();
        for symbol in state.symbols() {
            books.insert(symbol.clone(), Arc::new(Orderbook::new(symbol.clone())));
            recent_trades.insert(symbol, VecDeque::new());
        }
        let (trade_tx, _) = broadcast::channel(4_096);
        let (depth_tx, _) = broadcast::channel(1_024);
        let (order_tx, _) = broadcast::channel(4_096);
        Self {
            state,
            verifier,
            config,
            books,
            orders,
            recent_trades,
            trade_tx,
            depth_tx,
            order_tx,
        }
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<TradeEvent> {
        self.trade_tx.subscribe()
    }

    pub fn subscribe_depth(&self) -> broadcast::Receiver<DepthSnapshot> {
        self.depth_tx.subscribe()
    }

    pub fn subscribe_orders(&self) -> broadcast::Receiver<Order> {
        self.order_tx.subscribe()
    }

    // ========================================================================
    // Submit
    // ========================================================================

    /// Validate and execute an order intent. Policy-level terminations
    /// (post-only cross, FOK unfillable) return a terminal order with zero
    /// side effects; validation failures return an error and touch nothing.
    pub fn submit(&self, intent: OrderIntent) -> Result<SubmitResult, CoreError> {
        self.submit_impl(intent, true)
    }

    /// Entry point for fired trigger orders: signature and nonce were
    /// consumed when the conditional order was registered.
    pub fn submit_prevalidated(&self, intent: OrderIntent) -> Result<SubmitResult, CoreError> {
        self.submit_impl(intent, false)
    }

    fn submit_impl(&self, intent: OrderIntent, check_auth: bool) -> Result<SubmitResult, CoreError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        if intent.order_type.is_conditional() {
            // Conditional intents are registered in the trigger sets and only
            // reach the engine after transformation into market orders.
            return Err(CoreError::Invariant(
                "conditional order routed to the matching engine".to_string(),
            ));
        }

        let book = self
            .books
            .get(&intent.symbol)
            .map(|e| e.clone())
            .ok_or(CoreError::Rejected(RejectReason::SymbolUnknown))?;

        if intent.deadline <= now.timestamp() {
            return Err(CoreError::Rejected(RejectReason::Expired));
        }
        if intent.size < self.config.min_order_size {
            return Err(CoreError::Rejected(RejectReason::SizeBelowMinimum));
        }
        if intent.leverage_bp < PRECISION || intent.leverage_bp > self.config.max_leverage_bp {
            return Err(CoreError::Rejected(RejectReason::MaxLeverageExceeded));
        }
        if intent.order_type == OrderType::Market && intent.post_only {
            return Err(CoreError::Rejected(RejectReason::PostOnlyWouldCross));
        }

        if check_auth {
            self.verifier
                .verify_order(&intent)
                .map_err(|_| CoreError::Rejected(RejectReason::BadSignature))?;
            self.state.check_nonce(&intent.trader, intent.nonce)?;
        }

        if self.state.is_degraded() && !intent.reduce_only {
            return Err(CoreError::Rejected(RejectReason::VenueDegraded));
        }

        if intent.reduce_only {
            self.check_reduce_only(&intent)?;
        }

        // Margin is locked on the limit price, or the reference mark for
        // market orders.
        let mark = self.state.mark_price(&intent.symbol).unwrap_or(0);
        let basis_price = intent.limit_price().unwrap_or(mark);
        if basis_price <= 0 {
            // market order on a symbol that has never printed a reference
            return Err(CoreError::Rejected(RejectReason::SymbolUnknown));
        }
        let basis_notional = notional_usd(intent.size, basis_price);
        let lock_margin = margin_usd(basis_notional, intent.leverage_bp);
        let lock_fee = fee_usd(basis_notional, self.config.taker_fee_bp);

        let trader = intent.trader.clone();
        let symbol = intent.symbol.clone();
        let order_id = Uuid::new_v4();
        let mut order = intent.into_order(order_id);

        // ---------------- critical section ----------------
        let mut inner = book.lock();

        if order.post_only && inner.would_cross(order.side, order.price) {
            order.status = OrderStatus::Canceled;
            debug!(order_id = %order_id, trader = %trader, "post-only order would cross");
            return Ok(SubmitResult {
                order,
                matches: Vec::new(),
                rejection: Some(RejectReason::PostOnlyWouldCross),
            });
        }

        if order.time_in_force == TimeInForce::FOK {
            // Simulate the full walk first; only an affirmative result may
            // mutate the book.
            let fillable = inner.fillable_size(order.side, order.price, order.size);
            if fillable < order.size {
                order.status = OrderStatus::Canceled;
                debug!(order_id = %order_id, trader = %trader, "FOK unfillable");
                return Ok(SubmitResult {
                    order,
                    matches: Vec::new(),
                    rejection: Some(RejectReason::FokUnfillable),
                });
            }
        }

        // Debit must precede any visible commitment of the order.
        self.state
            .try_freeze(&trader, lock_margin + lock_fee, now_ms)
            .map_err(|_| CoreError::Rejected(RejectReason::InsufficientFunds))?;
        order.locked_margin = lock_margin;
        order.locked_fee = lock_fee;
        if check_auth {
            self.state.commit_nonce(&trader, order.nonce);
        }

        let fills = inner.match_take(order.side, order.price, order.size, mark);
        let matches = self.apply_fills(&mut order, &fills, now_ms);

        // Time-in-force handling for the residual.
        if order.remaining_size() > 0 {
            match order.time_in_force {
                TimeInForce::IOC => {
                    self.release_residual(&mut order, now_ms);
                    order.status = OrderStatus::Canceled;
                }
                TimeInForce::FOK => {
                    // fillability was proven above
                    debug_assert!(false, "FOK left a residual after an affirmative simulation");
                    self.release_residual(&mut order, now_ms);
                    order.status = OrderStatus::Canceled;
                }
                TimeInForce::GTC | TimeInForce::GTD => {
                    inner.add(
                        order.side,
                        OrderEntry {
                            id: order.id,
                            trader: order.trader.clone(),
                            price: order.price,
                            remaining: order.remaining_size(),
                            created_at: order.created_at,
                        },
                    );
                }
            }
        }

        let depth = self.depth_snapshot_locked(&symbol, &inner, 20);
        drop(inner);
        // ---------------- end critical section ----------------

        self.orders.insert(order.id, order.clone());
        let _ = self.order_tx.send(order.clone());
        let _ = self.depth_tx.send(depth);

        info!(
            order_id = %order.id,
            trader = %order.trader,
            symbol = %symbol,
            status = %order.status,
            matches = matches.len(),
            "order processed"
        );

        Ok(SubmitResult {
            order,
            matches,
            rejection: None,
        })
    }

    /// Reduce-only gate: the trader must hold an opposite-side position in
    /// the symbol at least as large as the order.
    fn check_reduce_only(&self, intent: &OrderIntent) -> Result<(), CoreError> {
        let opposite = self
            .state
            .position_of(&intent.trader, &intent.symbol, intent.side.opposite());
        match opposite {
            Some(pair) if pair.size >= intent.size => Ok(()),
            _ => {
                if self
                    .state
                    .position_of(&intent.trader, &intent.symbol, intent.side)
                    .is_some()
                {
                    Err(CoreError::Rejected(RejectReason::ReduceOnlyWrongSide))
                } else {
                    Err(CoreError::Rejected(RejectReason::ReduceOnlyNoPosition))
                }
            }
        }
    }

    /// Apply maker fills to both orders and both balances, emit matches and
    /// trades, and enqueue the matches for ledger settlement.
    fn apply_fills(&self, taker: &mut Order, fills: &[MakerFill], now_ms: i64) -> Vec<Match> {
        let mut matches = Vec::with_capacity(fills.len());

        for fill in fills {
            let notional = notional_usd(fill.size, fill.price);

            // Taker leg: margin and fee move capped by what is still locked.
            let taker_margin = margin_usd(notional, taker.leverage_bp)
                .min(taker.remaining_locked_margin());
            let taker_fee =
                fee_usd(notional, self.config.taker_fee_bp).min(taker.remaining_locked_fee());
            self.state.with_balance_mut(&taker.trader, |b| {
                b.fill(taker_margin, taker_fee, now_ms)
            });
            taker.moved_margin += taker_margin;
            taker.moved_fee += taker_fee;
            taker.apply_fill(fill.price, fill.size, now_ms);

            // Maker leg.
            let mut maker_margin = 0;
            let mut maker_fee = 0;
            let mut maker_leverage = PRECISION;
            let mut maker_nonce = 0;
            if let Some(mut maker) = self.orders.get_mut(&fill.maker_id) {
                maker_margin = margin_usd(notional, maker.leverage_bp)
                    .min(maker.remaining_locked_margin());
                maker_fee =
                    fee_usd(notional, self.config.maker_fee_bp).min(maker.remaining_locked_fee());
                maker_leverage = maker.leverage_bp;
                maker_nonce = maker.nonce;
                self.state.with_balance_mut(&maker.trader, |b| {
                    b.fill(maker_margin, maker_fee, now_ms)
                });
                maker.moved_margin += maker_margin;
                maker.moved_fee += maker_fee;
                maker.apply_fill(fill.price, fill.size, now_ms);
                if maker.status == OrderStatus::Filled {
                    let surplus = maker.remaining_locked_margin() + maker.remaining_locked_fee();
                    if surplus > 0 {
                        self.release_surplus(&maker.trader, surplus, now_ms);
                        maker.moved_margin = maker.locked_margin;
                        maker.moved_fee = maker.locked_fee;
                    }
                }
                let _ = self.order_tx.send(maker.clone());
            } else {
                warn!(maker_id = %fill.maker_id, "maker order missing from order map");
            }

            let (long_order_id, short_order_id) = match taker.side {
                Side::Long => (taker.id, fill.maker_id),
                Side::Short => (fill.maker_id, taker.id),
            };
            let (long_trader, short_trader) = match taker.side {
                Side::Long => (taker.trader.clone(), fill.maker_trader.clone()),
                Side::Short => (fill.maker_trader.clone(), taker.trader.clone()),
            };
            let (long_collateral, short_collateral, long_fee, short_fee) = match taker.side {
                Side::Long => (taker_margin, maker_margin, taker_fee, maker_fee),
                Side::Short => (maker_margin, taker_margin, maker_fee, taker_fee),
            };
            let (long_leverage, short_leverage) = match taker.side {
                Side::Long => (taker.leverage_bp, maker_leverage),
                Side::Short => (maker_leverage, taker.leverage_bp),
            };
            let (long_nonce, short_nonce) = match taker.side {
                Side::Long => (taker.nonce, maker_nonce),
                Side::Short => (maker_nonce, taker.nonce),
            };

            let m = Match {
                id: Uuid::new_v4(),
                symbol: taker.symbol.clone(),
                long_order_id,
                short_order_id,
                long_trader,
                short_trader,
                long_nonce,
                short_nonce,
                price: fill.price,
                size: fill.size,
                taker_side: taker.side,
                long_collateral,
                short_collateral,
                long_fee,
                short_fee,
                long_leverage_bp: long_leverage,
                short_leverage_bp: short_leverage,
                timestamp: now_ms,
            };

            self.state.with_market_mut(&taker.symbol, |stats| {
                stats.record_trade(fill.price, fill.size, now_ms)
            });

            self.state.push_pending(PendingMatch {
                match_id: m.id,
                pair_id: Uuid::nil(), // bound by the pair builder
                symbol: m.symbol.clone(),
                long_trader: m.long_trader.clone(),
                short_trader: m.short_trader.clone(),
                long_nonce: m.long_nonce,
                short_nonce: m.short_nonce,
                price: m.price,
                size: m.size,
                timestamp: m.timestamp,
            });

            let trade = TradeEvent::from_match(&m);
            if let Some(mut recent) = self.recent_trades.get_mut(&m.symbol) {
                recent.push_back(trade.clone());
                if recent.len() > RECENT_TRADES_CAP {
                    recent.pop_front();
                }
            }
            let _ = self.trade_tx.send(trade);

            matches.push(m);
        }

        if taker.status == OrderStatus::Filled {
            let surplus = taker.remaining_locked_margin() + taker.remaining_locked_fee();
            if surplus > 0 {
                self.release_surplus(&taker.trader, surplus, now_ms);
                taker.moved_margin = taker.locked_margin;
                taker.moved_fee = taker.locked_fee;
            }
        }

        matches
    }

    fn release_residual(&self, order: &mut Order, now_ms: i64) {
        let residual = order.remaining_locked_margin() + order.remaining_locked_fee();
        if residual > 0 {
            self.state
                .with_balance_mut(&order.trader, |b| b.release_frozen(residual, now_ms));
            order.moved_margin = order.locked_margin;
            order.moved_fee = order.locked_fee;
        }
    }

    fn release_surplus(&self, trader: &str, surplus: Usd, now_ms: i64) {
        self.state
            .with_balance_mut(trader, |b| b.release_frozen(surplus, now_ms));
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    /// Cancel a resting order and refund the unfilled fraction of its lock.
    pub fn cancel(&self, intent: &CancelIntent) -> Result<Order, CoreError> {
        self.verifier
            .verify_cancel(intent)
            .map_err(|_| CoreError::Rejected(RejectReason::BadSignature))?;

        let now_ms = Utc::now().timestamp_millis();
        let mut order = self
            .orders
            .get(&intent.order_id)
            .map(|e| e.clone())
            .ok_or(CoreError::OrderNotFound(intent.order_id))?;

        if order.trader != intent.trader {
            return Err(CoreError::NotOwner(intent.order_id));
        }
        if order.status.is_terminal() {
            return Err(CoreError::NotCancelable(intent.order_id));
        }

        let book = self
            .books
            .get(&order.symbol)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::SymbolNotFound(order.symbol.clone()))?;

        let depth = {
            let mut inner = book.lock();
            inner.remove(order.id);
            self.release_residual(&mut order, now_ms);
            order.status = OrderStatus::Canceled;
            order.updated_at = now_ms;
            self.depth_snapshot_locked(&order.symbol, &inner, 20)
        };

        self.orders.insert(order.id, order.clone());
        let _ = self.order_tx.send(order.clone());
        let _ = self.depth_tx.send(depth);
        info!(order_id = %order.id, trader = %order.trader, "order canceled");
        Ok(order)
    }

    /// Expire GTD orders whose deadline has passed. Returns how many expired.
    pub fn expire_due(&self, now_s: i64) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| {
                o.is_open() && o.time_in_force == TimeInForce::GTD && o.deadline <= now_s
            })
            .map(|o| o.clone())
            .collect();

        let mut expired = 0;
        for mut order in due {
            let Some(book) = self.books.get(&order.symbol).map(|e| e.clone()) else {
                continue;
            };
            let depth = {
                let mut inner = book.lock();
                inner.remove(order.id);
                self.release_residual(&mut order, now_ms);
                order.status = OrderStatus::Expired;
                order.updated_at = now_ms;
                self.depth_snapshot_locked(&order.symbol, &inner, 20)
            };
            self.orders.insert(order.id, order.clone());
            let _ = self.order_tx.send(order.clone());
            let _ = self.depth_tx.send(depth);
            expired += 1;
        }
        if expired > 0 {
            info!(expired, "expired GTD orders");
        }
        expired
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Re-enter a recovered open order onto its book. Used by rehydration
    /// before ingress opens; no validation, the order was accepted in a
    /// previous run.
    pub fn restore_order(&self, order: Order) {
        if order.is_open() && !order.order_type.is_conditional() {
            if let Some(book) = self.books.get(&order.symbol) {
                let mut inner = book.lock();
                inner.add(
                    order.side,
                    OrderEntry {
                        id: order.id,
                        trader: order.trader.clone(),
                        price: order.price,
                        remaining: order.remaining_size(),
                        created_at: order.created_at,
                    },
                );
            }
        }
        self.orders.insert(order.id, order);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_depth(&self, symbol: &str, levels: usize) -> Result<DepthSnapshot, CoreError> {
        let book = self
            .books
            .get(symbol)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::SymbolNotFound(symbol.to_string()))?;
        let inner = book.lock();
        Ok(self.depth_snapshot_locked(symbol, &inner, levels))
    }

    fn depth_snapshot_locked(
        &self,
        symbol: &str,
        inner: &super::orderbook::BookInner,
        levels: usize,
    ) -> DepthSnapshot {
        let longs = inner
            .depth(Side::Long, levels)
            .into_iter()
            .map(|(p, s)| render_level(p, s))
            .collect();
        let shorts = inner
            .depth(Side::Short, levels)
            .into_iter()
            .map(|(p, s)| render_level(p, s))
            .collect();
        DepthSnapshot {
            symbol: symbol.to_string(),
            longs,
            shorts,
            last_price: self.state.market(symbol).map(|m| m.last_price).filter(|p| *p > 0),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn get_order(&self, order_id: Uuid) -> Option<Order> {
        self.orders.get(&order_id).map(|e| e.clone())
    }

    pub fn get_user_orders(&self, trader: &str, status: Option<OrderStatus>) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| o.trader == trader && status.map_or(true, |s| o.status == s))
            .map(|o| o.clone())
            .collect();
        orders.sort_by_key(|o| std::cmp::Reverse(o.created_at));
        orders
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|o| o.is_open())
            .map(|o| o.clone())
            .collect()
    }

    pub fn get_trades(&self, symbol: &str, limit: usize) -> Vec<TradeEvent> {
        self.recent_trades
            .get(symbol)
            .map(|q| q.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAllVerifier;
    use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE, USD_SCALE};

    fn setup() -> (Arc<VenueState>, MatchingEngine) {
        let state = Arc::new(VenueState::new(
            &["MEMEUSD".to_string()],
            10_000 * USD_SCALE,
            1_000,
        ));
        // seed a reference mark of 1.00
        state.with_market_mut("MEMEUSD", |m| m.record_trade(PRICE_SCALE, 0, 0));
        let engine = MatchingEngine::new(
            state.clone(),
            Arc::new(AllowAllVerifier),
            EngineConfig {
                taker_fee_bp: 5,
                maker_fee_bp: 2,
                min_order_size: AMOUNT_SCALE / 100,
                max_leverage_bp: 1_000_000,
            },
        );
        (state, engine)
    }

    fn fund(state: &VenueState, trader: &str, usd: i64) {
        state.with_balance_mut(trader, |b| b.credit(usd * USD_SCALE, 0));
    }

    fn intent(trader: &str, side: Side, price_cents: i64, size: Amount, nonce: u64) -> OrderIntent {
        OrderIntent {
            trader: trader.to_string(),
            symbol: "MEMEUSD".to_string(),
            side,
            order_type: if price_cents == 0 {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            time_in_force: TimeInForce::GTC,
            reduce_only: false,
            post_only: false,
            size,
            leverage_bp: 100_000, // 10x
            price: PRICE_SCALE * price_cents / 100,
            trigger_price: None,
            deadline: i64::MAX / 2,
            nonce,
            signature: String::new(),
            client_order_id: None,
        }
    }

    #[test]
    fn test_price_time_priority_scenario() {
        // Longs A@0.90, B@0.95, C@0.92; short D@0.90 matches B at 0.95.
        let (state, engine) = setup();
        for t in ["A", "B", "C", "D"] {
            fund(&state, t, 1_000);
        }

        engine.submit(intent("A", Side::Long, 90, AMOUNT_SCALE, 0)).unwrap();
        engine.submit(intent("B", Side::Long, 95, AMOUNT_SCALE, 0)).unwrap();
        engine.submit(intent("C", Side::Long, 92, AMOUNT_SCALE, 0)).unwrap();

        let result = engine.submit(intent("D", Side::Short, 90, AMOUNT_SCALE, 1)).unwrap();
        assert_eq!(result.matches.len(), 1);
        let m = &result.matches[0];
        assert_eq!(m.price, PRICE_SCALE * 95 / 100);
        assert_eq!(m.size, AMOUNT_SCALE);
        assert_eq!(m.long_trader, "B");
        assert_eq!(m.short_trader, "D");
        assert_eq!(result.order.status, OrderStatus::Filled);

        // A and C still rest with aggregate size 2e18
        let depth = engine.get_depth("MEMEUSD", 10).unwrap();
        assert_eq!(depth.longs.len(), 2);
        assert_eq!(state.pending_len(), 1);
    }

    #[test]
    fn test_partial_fill_continues() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);
        fund(&state, "B", 1_000);

        engine.submit(intent("A", Side::Long, 100, 3 * AMOUNT_SCALE, 0)).unwrap();
        let result = engine.submit(intent("B", Side::Short, 100, AMOUNT_SCALE, 0)).unwrap();

        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].price, PRICE_SCALE);

        let a_orders = engine.get_user_orders("A", None);
        assert_eq!(a_orders[0].status, OrderStatus::PartiallyFilled);
        assert_eq!(a_orders[0].filled_size, AMOUNT_SCALE);

        let depth = engine.get_depth("MEMEUSD", 10).unwrap();
        assert_eq!(depth.longs.len(), 1);
        assert_eq!(depth.longs[0][1], "2");
    }

    #[test]
    fn test_post_only_would_cross_rejects_without_mutation() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);
        fund(&state, "B", 1_000);

        engine.submit(intent("A", Side::Short, 100, AMOUNT_SCALE, 0)).unwrap();
        let before = state.balance("B");

        let mut po = intent("B", Side::Long, 100, AMOUNT_SCALE, 0);
        po.post_only = true;
        let result = engine.submit(po).unwrap();

        assert_eq!(result.rejection, Some(RejectReason::PostOnlyWouldCross));
        assert_eq!(result.order.status, OrderStatus::Canceled);
        assert!(result.matches.is_empty());

        let after = state.balance("B");
        assert_eq!(before.available, after.available);
        assert_eq!(before.frozen_margin, after.frozen_margin);
        // the resting short is untouched
        let depth = engine.get_depth("MEMEUSD", 10).unwrap();
        assert_eq!(depth.shorts.len(), 1);
    }

    #[test]
    fn test_fok_unfillable_is_atomic() {
        let (state, engine) = setup();
        for t in ["A", "B", "C"] {
            fund(&state, t, 1_000);
        }

        engine.submit(intent("A", Side::Short, 100, AMOUNT_SCALE, 0)).unwrap();
        engine.submit(intent("B", Side::Short, 102, AMOUNT_SCALE, 0)).unwrap();

        let before = state.balance("C");
        let mut fok = intent("C", Side::Long, 100, 2 * AMOUNT_SCALE, 0);
        fok.time_in_force = TimeInForce::FOK;
        let result = engine.submit(fok).unwrap();

        assert_eq!(result.rejection, Some(RejectReason::FokUnfillable));
        assert_eq!(result.order.status, OrderStatus::Canceled);
        assert!(result.matches.is_empty());
        assert_eq!(state.balance("C").available, before.available);

        let depth = engine.get_depth("MEMEUSD", 10).unwrap();
        assert_eq!(depth.shorts.len(), 2);
    }

    #[test]
    fn test_fok_fillable_fills_fully() {
        let (state, engine) = setup();
        for t in ["A", "B", "C"] {
            fund(&state, t, 1_000);
        }

        engine.submit(intent("A", Side::Short, 100, AMOUNT_SCALE, 0)).unwrap();
        engine.submit(intent("B", Side::Short, 102, AMOUNT_SCALE, 0)).unwrap();

        let mut fok = intent("C", Side::Long, 102, 2 * AMOUNT_SCALE, 0);
        fok.time_in_force = TimeInForce::FOK;
        let result = engine.submit(fok).unwrap();

        assert!(result.rejection.is_none());
        assert_eq!(result.matches.len(), 2);
        assert_eq!(result.order.status, OrderStatus::Filled);
    }

    #[test]
    fn test_ioc_cancels_residual() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);
        fund(&state, "B", 1_000);

        engine.submit(intent("A", Side::Short, 100, AMOUNT_SCALE, 0)).unwrap();

        let mut ioc = intent("B", Side::Long, 100, 2 * AMOUNT_SCALE, 0);
        ioc.time_in_force = TimeInForce::IOC;
        let result = engine.submit(ioc).unwrap();

        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.order.status, OrderStatus::Canceled);
        assert_eq!(result.order.filled_size, AMOUNT_SCALE);

        // nothing rests on the long side
        let depth = engine.get_depth("MEMEUSD", 10).unwrap();
        assert!(depth.longs.is_empty());
    }

    #[test]
    fn test_market_order_empty_book_rests_gtc() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);

        let result = engine.submit(intent("A", Side::Long, 0, AMOUNT_SCALE, 0)).unwrap();
        assert!(result.matches.is_empty());
        assert_eq!(result.order.status, OrderStatus::Pending);
    }

    #[test]
    fn test_submit_then_cancel_round_trips_balances() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);
        let before = state.balance("A");

        let result = engine.submit(intent("A", Side::Long, 90, AMOUNT_SCALE, 0)).unwrap();
        assert!(state.balance("A").frozen_margin > 0);

        engine
            .cancel(&CancelIntent {
                trader: "A".to_string(),
                order_id: result.order.id,
                signature: String::new(),
            })
            .unwrap();

        let after = state.balance("A");
        assert_eq!(after.available, before.available);
        assert_eq!(after.frozen_margin, 0);
    }

    #[test]
    fn test_partial_fill_then_cancel_releases_unfilled_fraction() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);
        fund(&state, "B", 1_000);

        let result = engine.submit(intent("A", Side::Long, 100, 2 * AMOUNT_SCALE, 0)).unwrap();
        engine.submit(intent("B", Side::Short, 100, AMOUNT_SCALE, 0)).unwrap();

        engine
            .cancel(&CancelIntent {
                trader: "A".to_string(),
                order_id: result.order.id,
                signature: String::new(),
            })
            .unwrap();

        let bal = state.balance("A");
        assert_eq!(bal.frozen_margin, 0);
        // half the lock became position margin, half the fee was charged
        let notional = notional_usd(AMOUNT_SCALE, PRICE_SCALE);
        assert_eq!(bal.used_margin, margin_usd(notional, 100_000));
    }

    #[test]
    fn test_nonce_reuse_rejected() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);

        engine.submit(intent("A", Side::Long, 90, AMOUNT_SCALE, 7)).unwrap();
        let err = engine.submit(intent("A", Side::Long, 91, AMOUNT_SCALE, 7)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Rejected(RejectReason::BadNonce)
        ));
    }

    #[test]
    fn test_expired_deadline_rejected() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);

        let mut stale = intent("A", Side::Long, 90, AMOUNT_SCALE, 0);
        stale.deadline = 1;
        let err = engine.submit(stale).unwrap_err();
        assert!(matches!(err, CoreError::Rejected(RejectReason::Expired)));
    }

    #[test]
    fn test_insufficient_funds_rejected() {
        let (state, engine) = setup();
        fund(&state, "A", 1); // 1 USD, far below 10% margin of 1 token @ 0.90

        let err = engine
            .submit(intent("A", Side::Long, 90, 100 * AMOUNT_SCALE, 0))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Rejected(RejectReason::InsufficientFunds)
        ));
        // a rejected debit leaves no trace
        assert_eq!(state.balance("A").frozen_margin, 0);
    }

    #[test]
    fn test_degraded_mode_rejects_opening_orders() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);

        for i in 0..1_001 {
            state.push_pending(crate::state::PendingMatch {
                match_id: Uuid::new_v4(),
                pair_id: Uuid::nil(),
                symbol: "MEMEUSD".to_string(),
                long_trader: "x".into(),
                short_trader: "y".into(),
                long_nonce: i,
                short_nonce: i,
                price: 1,
                size: 1,
                timestamp: 0,
            });
        }
        assert!(state.is_degraded());

        let err = engine.submit(intent("A", Side::Long, 90, AMOUNT_SCALE, 0)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Rejected(RejectReason::VenueDegraded)
        ));
    }

    #[test]
    fn test_gtd_expiry_sweep() {
        let (state, engine) = setup();
        fund(&state, "A", 1_000);

        let mut gtd = intent("A", Side::Long, 90, AMOUNT_SCALE, 0);
        gtd.time_in_force = TimeInForce::GTD;
        gtd.deadline = Utc::now().timestamp() + 1;
        let result = engine.submit(gtd).unwrap();

        assert_eq!(engine.expire_due(Utc::now().timestamp() + 10), 1);
        let order = engine.get_order(result.order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Expired);
        assert_eq!(state.balance("A").frozen_margin, 0);
    }
}
