//! Risk Engine
//!
//! Timer-driven global revaluation. Each tick takes a consistent snapshot of
//! active pairs, recomputes every derived per-side risk field (this engine is
//! the single writer of those fields), rebuilds the liquidation and ADL
//! queues, evaluates pair-attached TP/SL, drains liquidations against the
//! tick-start ADL snapshot, and publishes throttled risk snapshots.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::order::{Order, Side};
use crate::models::position::{Pair, PositionRisk, RiskLevel};
use crate::models::units::{
    adl_score_bp, bankruptcy_price, effective_mmr_bp, liquidation_price, margin_ratio_bp,
    notional_usd, price_pnl_usd, roe_bp, Bp, Price,
};
use crate::services::adl::AdlService;
use crate::services::liquidation::LiquidationService;
use crate::services::position::PositionService;
use crate::services::trigger_orders::TriggerOrdersService;
use crate::state::VenueState;
use crate::stream::channels::{
    FundingSummary, GlobalRiskSnapshot, LiquidationQueueEntry, RiskStreamUpdate,
    TraderRiskSnapshot, VenueEvent,
};

/// Liquidation threshold on the margin ratio, basis points.
const LIQUIDATION_THRESHOLD_BP: Bp = 10_000;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub tick_ms: u64,
    pub broadcast_min_interval_ms: u64,
    pub base_mmr_bp: Bp,
    /// Cap on liquidations drained in a single tick.
    pub liquidation_high_water: usize,
}

/// What a tick did; the runtime submits the fired trigger orders afterwards.
#[derive(Debug, Default)]
pub struct TickReport {
    pub positions_revalued: usize,
    pub liquidations: usize,
    pub tpsl_closed: usize,
    pub fired_trigger_orders: Vec<Order>,
    pub elapsed_ms: u64,
    pub slow: bool,
}

pub struct RiskEngine {
    state: Arc<VenueState>,
    positions: Arc<PositionService>,
    liquidation: Arc<LiquidationService>,
    adl: Arc<AdlService>,
    trigger_orders: Arc<TriggerOrdersService>,
    event_tx: broadcast::Sender<VenueEvent>,
    risk_tx: broadcast::Sender<RiskStreamUpdate>,
    config: RiskConfig,
    last_broadcast_ms: AtomicI64,
}

impl RiskEngine {
    pub fn new(
        state: Arc<VenueState>,
        positions: Arc<PositionService>,
        liquidation: Arc<LiquidationService>,
        adl: Arc<AdlService>,
        trigger_orders: Arc<TriggerOrdersService>,
        event_tx: broadcast::Sender<VenueEvent>,
        config: RiskConfig,
    ) -> Self {
        let (risk_tx, _) = broadcast::channel(1_024);
        Self {
            state,
            positions,
            liquidation,
            adl,
            trigger_orders,
            event_tx,
            risk_tx,
            config,
            last_broadcast_ms: AtomicI64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RiskStreamUpdate> {
        self.risk_tx.subscribe()
    }

    /// One logical tick. Never overlaps itself: the runtime drives this from
    /// a delayed interval and starts the next tick only after this returns.
    pub fn tick(&self) -> TickReport {
        let started = Instant::now();
        let now_ms = Utc::now().timestamp_millis();
        let mut report = TickReport::default();

        // 1+2. Revalue every active position and classify.
        let pairs = self.state.active_pairs();
        let mut risks: Vec<PositionRisk> = Vec::with_capacity(pairs.len() * 2);
        for pair in &pairs {
            let Some(mark) = self.state.mark_price(&pair.symbol) else {
                continue;
            };
            for side in [Side::Long, Side::Short] {
                match self.revalue_side(pair, side, mark, now_ms) {
                    Ok(risk) => risks.push(risk),
                    Err(reason) => {
                        // a broken position must not abort the tick
                        error!(
                            pair_id = %pair.id,
                            side = %side,
                            reason,
                            "position revaluation failed, flagged and skipped"
                        );
                    }
                }
            }
        }
        report.positions_revalued = risks.len();

        // 4. ADL queues are snapshotted now; liquidations later in this tick
        // deleverage against this snapshot.
        let ranks = self.adl.rebuild(&risks);
        for risk in &mut risks {
            risk.adl_rank = ranks.get(&(risk.pair_id, risk.side)).copied().unwrap_or(0);
        }

        // Alerts on transitions into high/critical, then publish derived
        // fields (single-writer).
        for risk in &risks {
            let previous = self
                .state
                .risk_of(risk.pair_id, risk.side)
                .map(|r| r.risk_level);
            if risk.risk_level >= RiskLevel::High && previous != Some(risk.risk_level) {
                let _ = self.event_tx.send(VenueEvent::RiskAlert {
                    pair_id: risk.pair_id,
                    trader: risk.trader.clone(),
                    symbol: risk.symbol.clone(),
                    side: risk.side,
                    margin_ratio_bp: risk.margin_ratio_bp,
                    level: risk.risk_level,
                    timestamp: now_ms,
                });
            }
            self.state.put_risk(risk.clone());
        }

        // 3. Liquidation queue, most distressed first.
        let mut liquidation_queue: Vec<&PositionRisk> = risks
            .iter()
            .filter(|r| r.margin_ratio_bp >= LIQUIDATION_THRESHOLD_BP)
            .collect();
        liquidation_queue.sort_by(|a, b| b.margin_ratio_bp.cmp(&a.margin_ratio_bp));

        // 5+6. Drain liquidations first (bounded per tick, against the
        // tick-start ADL snapshot), then TP/SL, then conditional orders.
        let mut seen_pairs: Vec<Uuid> = Vec::new();
        for risk in liquidation_queue
            .iter()
            .take(self.config.liquidation_high_water)
        {
            // one liquidation per pair: the counterparty exits with it
            if seen_pairs.contains(&risk.pair_id) {
                continue;
            }
            match self.liquidation.liquidate(risk) {
                Ok(_) => {
                    seen_pairs.push(risk.pair_id);
                    report.liquidations += 1;
                }
                Err(crate::error::CoreError::PairNotActive(_)) => {}
                Err(e) => {
                    error!(pair_id = %risk.pair_id, error = %e, "liquidation failed");
                }
            }
        }

        // Pair-attached TP/SL: a fired level closes the whole position at
        // market.
        report.tpsl_closed = self.evaluate_tp_sl(&pairs, now_ms);

        // Standalone conditional orders fire on the tick's mark.
        for symbol in self.state.symbols() {
            if let Some(mark) = self.state.mark_price(&symbol) {
                report
                    .fired_trigger_orders
                    .extend(self.trigger_orders.evaluate(&symbol, mark));
            }
        }

        // 7. Throttled stream publication.
        self.maybe_broadcast(&risks, now_ms);

        let elapsed = started.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        report.slow = report.elapsed_ms > self.config.tick_ms;
        metrics::histogram!(crate::metrics::RISK_TICK_MS).record(report.elapsed_ms as f64);
        if report.slow {
            metrics::counter!(crate::metrics::RISK_SLOW_TICKS).increment(1);
            warn!(
                elapsed_ms = report.elapsed_ms,
                cadence_ms = self.config.tick_ms,
                "slow risk tick"
            );
        }
        report
    }

    /// Derived fields for one side of a pair.
    fn revalue_side(
        &self,
        pair: &Pair,
        side: Side,
        mark: Price,
        now_ms: i64,
    ) -> Result<PositionRisk, &'static str> {
        let collateral = pair.collateral_of(side);
        let leverage = pair.leverage_of(side);
        if collateral <= 0 || leverage <= 0 || pair.size <= 0 {
            return Err("non-positive collateral, leverage or size");
        }

        let notional = notional_usd(pair.size, mark);
        let open_fee = pair.open_fee_of(side);
        let pnl = price_pnl_usd(side.direction(), pair.size, pair.entry_price, mark) - open_fee;
        let equity = collateral + pnl;
        let mmr = effective_mmr_bp(self.config.base_mmr_bp, leverage);
        let maintenance =
            (notional as i128 * mmr as i128 / crate::models::units::PRECISION as i128) as i64;
        let ratio = margin_ratio_bp(maintenance, equity);
        let is_long = side == Side::Long;

        // fee recovered at: entry +- open_fee spread over size
        // (usd 1e6 * 1e24 / amount 1e18 lands on the 1e12 price scale)
        let fee_offset =
            (open_fee as i128 * 1_000_000_000_000_000_000_000_000 / pair.size) as Price;
        let break_even = pair.entry_price + side.direction() * fee_offset;

        Ok(PositionRisk {
            pair_id: pair.id,
            trader: pair.trader_of(side).to_string(),
            symbol: pair.symbol.clone(),
            side,
            size: pair.size,
            entry_price: pair.entry_price,
            mark_price: mark,
            notional,
            collateral,
            leverage_bp: leverage,
            unrealized_pnl: pnl,
            equity,
            effective_mmr_bp: mmr,
            maintenance_margin: maintenance,
            margin_ratio_bp: ratio,
            roe_bp: roe_bp(pnl, collateral),
            liquidation_price: liquidation_price(pair.entry_price, leverage, mmr, is_long),
            bankruptcy_price: bankruptcy_price(pair.entry_price, leverage, is_long),
            break_even_price: break_even,
            adl_score_bp: adl_score_bp(pnl, collateral, leverage),
            adl_rank: 0,
            risk_level: RiskLevel::classify(ratio),
            updated_at: now_ms,
        })
    }

    /// Fire pair-attached TP/SL levels against the current mark. Returns how
    /// many positions closed.
    fn evaluate_tp_sl(&self, pairs: &[Pair], now_ms: i64) -> usize {
        let mut closed = 0;
        for pair in pairs {
            let Some(mark) = self.state.mark_price(&pair.symbol) else {
                continue;
            };
            for side in [Side::Long, Side::Short] {
                let tp_sl = pair.tp_sl_of(side);
                let tp_hit = tp_sl.take_profit.map_or(false, |tp| match side {
                    Side::Long => mark >= tp,
                    Side::Short => mark <= tp,
                });
                let sl_hit = tp_sl.stop_loss.map_or(false, |sl| match side {
                    Side::Long => mark <= sl,
                    Side::Short => mark >= sl,
                });
                if !tp_hit && !sl_hit {
                    continue;
                }
                let trader = pair.trader_of(side).to_string();
                let trigger_price = if tp_hit {
                    tp_sl.take_profit.unwrap()
                } else {
                    tp_sl.stop_loss.unwrap()
                };
                let _ = self.event_tx.send(VenueEvent::TpslTriggered {
                    pair_id: pair.id,
                    trader: trader.clone(),
                    symbol: pair.symbol.clone(),
                    side,
                    trigger_price,
                    is_take_profit: tp_hit,
                    timestamp: now_ms,
                });
                match self
                    .positions
                    .close(pair.id, None, crate::models::units::PRECISION)
                {
                    Ok(_) => {
                        closed += 1;
                        let _ = self.event_tx.send(VenueEvent::TpslExecuted {
                            pair_id: pair.id,
                            trader,
                            symbol: pair.symbol.clone(),
                            timestamp: now_ms,
                        });
                        info!(pair_id = %pair.id, tp = tp_hit, "tp/sl executed");
                        break; // the pair is gone, skip the other side
                    }
                    Err(crate::error::CoreError::PairNotActive(_)) => {}
                    Err(e) => {
                        error!(pair_id = %pair.id, error = %e, "tp/sl close failed");
                    }
                }
            }
        }
        closed
    }

    /// Publish global and per-trader snapshots, rate-limited.
    fn maybe_broadcast(&self, risks: &[PositionRisk], now_ms: i64) {
        let last = self.last_broadcast_ms.load(Ordering::Relaxed);
        if now_ms - last < self.config.broadcast_min_interval_ms as i64 {
            return;
        }
        self.last_broadcast_ms.store(now_ms, Ordering::Relaxed);

        let insurance_by_symbol: Vec<(String, i64)> = self
            .state
            .symbols()
            .into_iter()
            .filter_map(|s| self.state.insurance(&s).map(|f| (s, f.balance)))
            .collect();
        let insurance_total = insurance_by_symbol.iter().map(|(_, b)| b).sum::<i64>()
            + self.state.global_insurance().balance;

        let mut head: Vec<LiquidationQueueEntry> = risks
            .iter()
            .filter(|r| r.margin_ratio_bp >= LIQUIDATION_THRESHOLD_BP)
            .map(|r| LiquidationQueueEntry {
                pair_id: r.pair_id,
                trader: r.trader.clone(),
                symbol: r.symbol.clone(),
                side: r.side,
                margin_ratio_bp: r.margin_ratio_bp,
                urgency_bp: r.margin_ratio_bp.saturating_sub(LIQUIDATION_THRESHOLD_BP),
            })
            .collect();
        head.sort_by(|a, b| b.margin_ratio_bp.cmp(&a.margin_ratio_bp));
        let queue_len = head.len();
        head.truncate(10);

        let funding = self
            .state
            .symbols()
            .into_iter()
            .filter_map(|s| {
                self.state.market(&s).map(|m| FundingSummary {
                    symbol: s,
                    funding_rate_bp: m.funding_rate_bp,
                    next_funding_time: m.next_funding_time,
                })
            })
            .collect();

        let _ = self.risk_tx.send(RiskStreamUpdate::Global(GlobalRiskSnapshot {
            insurance_total,
            insurance_by_symbol,
            liquidation_queue_len: queue_len,
            liquidation_queue_head: head,
            funding,
            timestamp: now_ms,
        }));

        let mut by_trader: HashMap<String, Vec<PositionRisk>> = HashMap::new();
        for risk in risks {
            by_trader
                .entry(risk.trader.clone())
                .or_default()
                .push(risk.clone());
        }
        for (trader, positions) in by_trader {
            let _ = self.risk_tx.send(RiskStreamUpdate::Trader(TraderRiskSnapshot {
                trader,
                positions,
                timestamp: now_ms,
            }));
        }
    }

    /// Timer loop. Ticks never overlap; an overrunning tick delays the next
    /// one instead. Fired conditional orders re-enter the matching engine as
    /// market orders.
    pub async fn run(
        self: Arc<Self>,
        matching: Arc<crate::services::matching::MatchingEngine>,
    ) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_ms = self.config.tick_ms, "risk engine started");
        loop {
            interval.tick().await;
            let engine = self.clone();
            // the tick body is synchronous and non-suspending
            let report = tokio::task::block_in_place(move || engine.tick());
            for order in report.fired_trigger_orders {
                let order_id = order.id;
                match matching.submit_prevalidated(fired_intent(order)) {
                    Ok(result) => {
                        for m in &result.matches {
                            self.positions.apply_match(m);
                        }
                    }
                    Err(e) => {
                        warn!(order_id = %order_id, error = %e, "fired trigger order rejected");
                    }
                }
            }
        }
    }
}

/// A fired conditional order re-enters `submit` as a market intent.
pub fn fired_intent(order: Order) -> crate::models::order::OrderIntent {
    crate::models::order::OrderIntent {
        trader: order.trader,
        symbol: order.symbol,
        side: order.side,
        order_type: crate::models::order::OrderType::Market,
        time_in_force: order.time_in_force,
        reduce_only: order.reduce_only,
        post_only: false,
        size: order.size,
        leverage_bp: order.leverage_bp,
        price: 0,
        trigger_price: None,
        deadline: order.deadline,
        nonce: order.nonce,
        signature: order.signature,
        client_order_id: order.client_order_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAllVerifier;
    use crate::models::position::{PairStatus, TpSl};
    use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE, USD_SCALE, PRECISION};

    struct Fixture {
        state: Arc<VenueState>,
        engine: RiskEngine,
    }

    fn fixture(insurance_seed: i64) -> Fixture {
        let state = Arc::new(VenueState::new(
            &["MEMEUSD".to_string()],
            insurance_seed,
            1_000,
        ));
        state.with_market_mut("MEMEUSD", |m| m.record_trade(PRICE_SCALE, 0, 0));
        let (event_tx, _) = broadcast::channel(1_024);
        let positions = Arc::new(PositionService::new(
            state.clone(),
            event_tx.clone(),
            5,
            200,
            1_000_000,
        ));
        let adl = Arc::new(AdlService::new(state.clone(), event_tx.clone()));
        let liquidation = Arc::new(LiquidationService::new(
            state.clone(),
            event_tx.clone(),
            adl.clone(),
            1_000,
        ));
        let trigger_orders = Arc::new(TriggerOrdersService::new(
            state.clone(),
            Arc::new(AllowAllVerifier),
        ));
        let engine = RiskEngine::new(
            state.clone(),
            positions,
            liquidation,
            adl,
            trigger_orders,
            event_tx,
            RiskConfig {
                tick_ms: 100,
                broadcast_min_interval_ms: 0,
                base_mmr_bp: 200,
                liquidation_high_water: 100,
            },
        );
        Fixture { state, engine }
    }

    fn open_pair(state: &VenueState, leverage_bp: i64) -> Uuid {
        let notional = USD_SCALE; // 1 token @ 1.00
        let collateral = notional * PRECISION / leverage_bp;
        let pair = Pair {
            id: Uuid::new_v4(),
            ledger_pair_id: None,
            symbol: "MEMEUSD".to_string(),
            long_trader: "long".to_string(),
            short_trader: "short".to_string(),
            size: AMOUNT_SCALE,
            entry_price: PRICE_SCALE,
            long_collateral: collateral,
            short_collateral: collateral,
            long_leverage_bp: leverage_bp,
            short_leverage_bp: leverage_bp,
            long_open_fee: 0,
            short_open_fee: 0,
            entry_funding_index_long: 0,
            entry_funding_index_short: 0,
            acc_funding_long: 0,
            acc_funding_short: 0,
            long_tp_sl: TpSl::default(),
            short_tp_sl: TpSl::default(),
            status: PairStatus::Active,
            open_time: 0,
            updated_at: 0,
        };
        for t in ["long", "short"] {
            state.with_balance_mut(t, |b| {
                b.credit(2 * collateral, 0);
                b.freeze(collateral, 0).unwrap();
                b.fill(collateral, 0, 0);
            });
        }
        let id = pair.id;
        state.insert_pair(pair);
        state.adjust_open_interest("MEMEUSD", AMOUNT_SCALE);
        id
    }

    #[test]
    fn test_tick_derives_risk_fields() {
        let f = fixture(10_000 * USD_SCALE);
        let pair_id = open_pair(&f.state, 200_000); // 20x

        let report = f.engine.tick();
        assert_eq!(report.positions_revalued, 2);
        assert_eq!(report.liquidations, 0);

        let long = f.state.risk_of(pair_id, Side::Long).unwrap();
        assert_eq!(long.mark_price, PRICE_SCALE);
        // mark == entry, zero open fee: pnl 0
        assert_eq!(long.unrealized_pnl, 0);
        assert_eq!(long.effective_mmr_bp, 200);
        assert_eq!(long.liquidation_price, PRICE_SCALE * 97 / 100);
        assert_eq!(long.bankruptcy_price, PRICE_SCALE * 95 / 100);
        assert_eq!(long.risk_level, RiskLevel::Low);

        let short = f.state.risk_of(pair_id, Side::Short).unwrap();
        assert_eq!(short.liquidation_price, PRICE_SCALE * 103 / 100);
    }

    #[test]
    fn test_tick_liquidates_distressed_position() {
        let f = fixture(10_000 * USD_SCALE);
        let pair_id = open_pair(&f.state, 200_000);

        // mark 0.965: long margin ratio past 10_000bp
        f.state
            .with_market_mut("MEMEUSD", |m| m.record_trade(PRICE_SCALE * 965 / 1000, 0, 1));
        let report = f.engine.tick();

        assert_eq!(report.liquidations, 1);
        assert_eq!(
            f.state.pair(pair_id).unwrap().status,
            PairStatus::Liquidated
        );
        // residual flowed into the symbol insurance fund
        assert!(f.state.insurance("MEMEUSD").unwrap().balance > 10_000 * USD_SCALE);
    }

    #[test]
    fn test_tick_healthy_position_untouched() {
        let f = fixture(0);
        let pair_id = open_pair(&f.state, 20_000); // 2x, lots of headroom

        f.state
            .with_market_mut("MEMEUSD", |m| m.record_trade(PRICE_SCALE * 95 / 100, 0, 1));
        let report = f.engine.tick();

        assert_eq!(report.liquidations, 0);
        assert_eq!(f.state.pair(pair_id).unwrap().status, PairStatus::Active);
        let long = f.state.risk_of(pair_id, Side::Long).unwrap();
        assert_eq!(long.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_tp_sl_fires_and_closes() {
        let f = fixture(0);
        let pair_id = open_pair(&f.state, 20_000);
        f.state.with_pair_mut(pair_id, |p| {
            p.long_tp_sl = TpSl {
                take_profit: Some(PRICE_SCALE * 11 / 10),
                stop_loss: None,
            };
        });

        // below TP: nothing
        let report = f.engine.tick();
        assert_eq!(report.tpsl_closed, 0);

        f.state
            .with_market_mut("MEMEUSD", |m| m.record_trade(PRICE_SCALE * 12 / 10, 0, 1));
        let report = f.engine.tick();
        assert_eq!(report.tpsl_closed, 1);
        assert_eq!(f.state.pair(pair_id).unwrap().status, PairStatus::Closed);
    }

    #[test]
    fn test_adl_ranks_written_to_derived_fields() {
        let f = fixture(0);
        let pair_id = open_pair(&f.state, 20_000);

        // shorts profit as mark falls
        f.state
            .with_market_mut("MEMEUSD", |m| m.record_trade(PRICE_SCALE * 9 / 10, 0, 1));
        f.engine.tick();

        let short = f.state.risk_of(pair_id, Side::Short).unwrap();
        assert!(short.unrealized_pnl > 0);
        assert_eq!(short.adl_rank, 1);
        let long = f.state.risk_of(pair_id, Side::Long).unwrap();
        assert_eq!(long.adl_rank, 0);
    }

    #[test]
    fn test_risk_broadcast_throttles() {
        let f = fixture(0);
        open_pair(&f.state, 20_000);
        let mut rx = f.engine.subscribe();

        f.engine.tick();
        assert!(matches!(
            rx.try_recv(),
            Ok(RiskStreamUpdate::Global(_)) | Ok(RiskStreamUpdate::Trader(_))
        ));
    }
}
