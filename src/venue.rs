//! Venue Composition Root
//!
//! Wires state, services, streams, mirror and ledger together; exposes the
//! intent entry points and the query surface; spawns the cooperating tasks.
//! Ingress stays closed until rehydration and startup reconciliation finish.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::auth::SignatureVerifier;
use crate::config::AppConfig;
use crate::error::{CoreError, RejectReason};
use crate::ledger::LedgerClient;
use crate::mirror::MirrorStore;
use crate::models::market::{InsuranceFund, MarketStats, SettlementLogEntry};
use crate::models::order::{
    CancelIntent, CloseIntent, Order, OrderIntent, OrderStatus, TpSlIntent,
};
use crate::models::position::PositionRisk;
use crate::models::units::{Amount, Price};
use crate::services::adl::AdlService;
use crate::services::funding::{FundingConfig, FundingService};
use crate::services::kline::{Kline, KlineInterval, KlineService};
use crate::services::liquidation::LiquidationService;
use crate::services::matching::{
    DepthSnapshot, EngineConfig, MatchingEngine, SubmitResult, TradeEvent,
};
use crate::services::oracle::{SpotFeedConfig, SpotIndexService};
use crate::services::position::{CloseOutcome, PositionService};
use crate::services::risk::{RiskConfig, RiskEngine};
use crate::services::settlement::{BatchSubmitter, LedgerReconciler, SubmitterConfig};
use crate::services::trigger_orders::TriggerOrdersService;
use crate::state::{NonceMode, VenueState};
use crate::stream::channels::{Channel, RiskStreamUpdate, VenueEvent};
use crate::stream::hub::{StreamHub, StreamMessage, Subscription};

pub struct Venue {
    pub config: AppConfig,
    pub state: Arc<VenueState>,
    pub engine: Arc<MatchingEngine>,
    pub positions: Arc<PositionService>,
    pub risk: Arc<RiskEngine>,
    pub adl: Arc<AdlService>,
    pub liquidation: Arc<LiquidationService>,
    pub funding: Arc<FundingService>,
    pub trigger_orders: Arc<TriggerOrdersService>,
    pub klines: Arc<KlineService>,
    pub oracle: Arc<SpotIndexService>,
    pub submitter: Arc<BatchSubmitter>,
    pub reconciler: Arc<LedgerReconciler>,
    pub hub: Arc<StreamHub>,
    pub mirror: Arc<MirrorStore>,
    pub ledger: Arc<dyn LedgerClient>,
    pub event_tx: broadcast::Sender<VenueEvent>,
    ingress_open: AtomicBool,
}

impl Venue {
    pub fn build(
        config: AppConfig,
        ledger: Arc<dyn LedgerClient>,
        mirror: Arc<MirrorStore>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Arc<Self> {
        let state = Arc::new(VenueState::new(
            &config.symbols,
            config.insurance_fund_initial_balance_per_symbol,
            config.pending_match_high_water,
        ));
        let (event_tx, _) = broadcast::channel(8_192);

        let engine = Arc::new(MatchingEngine::new(
            state.clone(),
            verifier.clone(),
            EngineConfig {
                taker_fee_bp: config.taker_fee_bp,
                maker_fee_bp: config.maker_fee_bp,
                min_order_size: config.min_order_size,
                max_leverage_bp: config.max_leverage_bp,
            },
        ));
        let positions = Arc::new(PositionService::new(
            state.clone(),
            event_tx.clone(),
            config.taker_fee_bp,
            config.base_mmr_bp,
            config.max_leverage_bp,
        ));
        let adl = Arc::new(AdlService::new(state.clone(), event_tx.clone()));
        let liquidation = Arc::new(LiquidationService::new(
            state.clone(),
            event_tx.clone(),
            adl.clone(),
            config.liquidation_fee_bp,
        ));
        let trigger_orders = Arc::new(TriggerOrdersService::new(state.clone(), verifier));
        let funding = Arc::new(FundingService::new(
            state.clone(),
            event_tx.clone(),
            FundingConfig {
                base_interval_ms: config.funding_base_interval_ms,
                min_interval_ms: config.funding_min_interval_ms,
                max_rate_bp: config.max_funding_rate_bp,
                volatile_max_rate_bp: config.volatile_max_funding_rate_bp,
                volatile_symbols: config.volatile_symbols.clone(),
                sample_window: config.price_sample_window,
            },
        ));
        let risk = Arc::new(RiskEngine::new(
            state.clone(),
            positions.clone(),
            liquidation.clone(),
            adl.clone(),
            trigger_orders.clone(),
            event_tx.clone(),
            RiskConfig {
                tick_ms: config.risk_tick_ms,
                broadcast_min_interval_ms: config.risk_broadcast_min_interval_ms,
                base_mmr_bp: config.base_mmr_bp,
                liquidation_high_water: config.liquidation_high_water,
            },
        ));
        let oracle = Arc::new(SpotIndexService::new(
            state.clone(),
            funding.clone(),
            SpotFeedConfig {
                endpoint: config.spot_feed_url.clone(),
                sync_interval_ms: config.spot_sync_interval_ms,
                request_timeout_ms: 5_000,
            },
        ));
        let submitter = Arc::new(BatchSubmitter::new(
            state.clone(),
            ledger.clone(),
            SubmitterConfig {
                interval_ms: config.batch_submit_interval_ms,
                max_batch: config.batch_max_size,
                attempt_timeout_ms: config.ledger_submit_timeout_ms,
                backoff_base_ms: config.ledger_backoff_base_ms,
                backoff_cap_ms: config.ledger_backoff_cap_ms,
            },
        ));
        let reconciler = Arc::new(LedgerReconciler::new(
            state.clone(),
            ledger.clone(),
            mirror.clone(),
            event_tx.clone(),
        ));
        let hub = Arc::new(StreamHub::new(
            state.clone(),
            engine.clone(),
            config.risk_broadcast_min_interval_ms,
        ));
        let klines = Arc::new(KlineService::new());

        Arc::new(Self {
            config,
            state,
            engine,
            positions,
            risk,
            adl,
            liquidation,
            funding,
            trigger_orders,
            klines,
            oracle,
            submitter,
            reconciler,
            hub,
            mirror,
            ledger,
            event_tx,
            ingress_open: AtomicBool::new(false),
        })
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Rehydrate from the mirror (market stats -> balances -> positions ->
    /// open orders), reconcile against the ledger, then open ingress.
    pub async fn startup(&self) -> Result<(), CoreError> {
        for stats in self.mirror.load_markets().await {
            self.state.restore_market(stats);
        }
        for balance in self.mirror.load_balances().await {
            self.state.restore_balance(balance);
        }
        let pairs = self.mirror.load_pairs().await;
        let pair_count = pairs.len();
        for pair in pairs {
            if pair.is_active() {
                self.state.insert_pair(pair);
            }
        }
        let orders = self.mirror.load_orders().await;
        let mut restored_orders = 0;
        for order in orders {
            if order.is_open() {
                self.engine.restore_order(order);
                restored_orders += 1;
            }
        }
        info!(pair_count, restored_orders, "state rehydrated from mirror");

        self.reconciler.startup_scan().await?;
        self.open_ingress();
        Ok(())
    }

    pub fn open_ingress(&self) {
        self.ingress_open.store(true, Ordering::SeqCst);
        info!("ingress open");
    }

    pub fn is_ingress_open(&self) -> bool {
        self.ingress_open.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Intent entry points
    // ========================================================================

    pub fn submit_order(&self, intent: OrderIntent) -> Result<SubmitResult, CoreError> {
        if !self.is_ingress_open() {
            return Err(CoreError::Rejected(RejectReason::VenueDegraded));
        }
        if intent.order_type.is_conditional() {
            let order = self.trigger_orders.register(intent)?;
            return Ok(SubmitResult {
                order,
                matches: Vec::new(),
                rejection: None,
            });
        }
        let result = self.engine.submit(intent);
        match &result {
            Ok(ok) => {
                metrics::counter!(crate::metrics::ORDERS_SUBMITTED).increment(1);
                metrics::counter!(crate::metrics::MATCHES_TOTAL)
                    .increment(ok.matches.len() as u64);
                for m in &ok.matches {
                    self.positions.apply_match(m);
                }
                metrics::gauge!(crate::metrics::PENDING_MATCH_QUEUE)
                    .set(self.state.pending_len() as f64);
            }
            Err(_) => {
                metrics::counter!(crate::metrics::ORDERS_REJECTED).increment(1);
            }
        }
        result
    }

    pub fn cancel_order(&self, intent: &CancelIntent) -> Result<Order, CoreError> {
        // cancels stay accepted in degraded mode and before ingress opens
        match self.engine.cancel(intent) {
            Err(CoreError::OrderNotFound(_)) => {
                self.trigger_orders.cancel(intent.order_id, &intent.trader)
            }
            other => other,
        }
    }

    pub async fn close_position(&self, intent: &CloseIntent) -> Result<CloseOutcome, CoreError> {
        let log_mark = self.state.settlement_len();
        let outcome = self
            .positions
            .close(intent.pair_id, Some(&intent.trader), intent.ratio_bp)?;
        // settlement-log entries are durable before the caller hears back
        if self.mirror.is_available() {
            for entry in self.state.settlement_range(log_mark) {
                if let Err(e) = self.mirror.persist_settlement(&entry).await {
                    warn!(entry_id = %entry.id, error = %e, "settlement entry backlogged");
                }
            }
        }
        // the events worker pushes the ledger close leg off PositionClosed
        Ok(outcome)
    }

    pub fn set_tp_sl(&self, intent: &TpSlIntent) -> Result<(), CoreError> {
        self.positions.set_tp_sl(
            intent.pair_id,
            &intent.trader,
            intent.take_profit_price,
            intent.stop_loss_price,
        )
    }

    pub fn set_nonce_mode(&self, trader: &str, mode: NonceMode) {
        self.state.set_nonce_mode(trader, mode);
    }

    // ========================================================================
    // Query surface
    // ========================================================================

    pub fn get_depth(&self, symbol: &str, levels: usize) -> Result<DepthSnapshot, CoreError> {
        self.engine.get_depth(symbol, levels)
    }

    pub fn get_user_orders(&self, trader: &str, status: Option<OrderStatus>) -> Vec<Order> {
        let mut orders = self.engine.get_user_orders(trader, status);
        orders.extend(
            self.trigger_orders
                .user_orders(trader)
                .into_iter()
                .filter(|o| status.map_or(true, |s| o.status == s)),
        );
        orders
    }

    pub fn get_trades(&self, symbol: &str, limit: usize) -> Vec<TradeEvent> {
        self.engine.get_trades(symbol, limit)
    }

    pub fn get_user_positions(&self, trader: &str) -> Vec<PositionRisk> {
        self.state.risk_of_trader(trader)
    }

    pub fn get_balance(&self, trader: &str) -> crate::models::Balance {
        self.state.balance(trader)
    }

    pub fn get_funding(&self, symbol: &str) -> Option<(i64, i64, i64)> {
        self.state
            .market(symbol)
            .map(|m| (m.funding_rate_bp, m.funding_index, m.next_funding_time))
    }

    pub fn get_klines(&self, symbol: &str, interval: KlineInterval, limit: usize) -> Vec<Kline> {
        self.klines.get_klines(symbol, interval, limit)
    }

    pub fn get_stats(&self, symbol: &str) -> Option<MarketStats> {
        self.state.market(symbol)
    }

    /// Resting liquidation prices aggregated by level, worst-first per side.
    pub fn get_liquidation_map(&self, symbol: &str) -> Vec<(Price, Amount)> {
        let mut map: BTreeMap<Price, Amount> = BTreeMap::new();
        for risk in self.state.risk_snapshot() {
            if risk.symbol == symbol {
                *map.entry(risk.liquidation_price).or_default() += risk.size;
            }
        }
        map.into_iter().collect()
    }

    pub fn get_insurance_fund(&self, symbol: Option<&str>) -> Option<InsuranceFund> {
        match symbol {
            Some(symbol) => self.state.insurance(symbol),
            None => Some(self.state.global_insurance()),
        }
    }

    pub fn get_settlement_log(&self, trader: Option<&str>, limit: usize) -> Vec<SettlementLogEntry> {
        self.state.settlement_entries(trader, limit)
    }

    pub fn subscribe(&self, channel: Channel) -> Subscription {
        self.hub.subscribe(channel)
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Spawn every cooperating task. Call once after `startup`.
    pub fn spawn_tasks(self: &Arc<Self>) {
        // risk engine loop (fires triggers back into the engine)
        tokio::spawn(self.risk.clone().run(self.engine.clone()));

        // ledger submitter + reconciler
        tokio::spawn(self.submitter.clone().run());
        tokio::spawn(self.reconciler.clone().run());

        // spot index sync
        tokio::spawn(self.oracle.clone().run());

        // funding scheduler
        {
            let venue = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(
                    venue.config.funding_check_interval_ms,
                ));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    venue.funding.run_once(Utc::now().timestamp_millis());
                    for symbol in venue.state.symbols() {
                        venue.funding.refresh_rate(&symbol);
                        // keep the settlement contract's view current
                        if let Some(stats) = venue.state.market(&symbol) {
                            if stats.mark_price > 0 {
                                if let Err(e) = venue
                                    .ledger
                                    .update_price(&symbol, stats.mark_price)
                                    .await
                                {
                                    warn!(symbol = %symbol, error = %e, "ledger price push failed");
                                }
                            }
                            if let Err(e) = venue
                                .ledger
                                .update_funding_rate(&symbol, stats.funding_rate_bp)
                                .await
                            {
                                warn!(symbol = %symbol, error = %e, "ledger funding push failed");
                            }
                        }
                    }
                }
            });
        }

        // GTD expiry sweep
        {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    engine.expire_due(Utc::now().timestamp());
                }
            });
        }

        // trade fan-out: streams, klines, market mirror
        {
            let venue = self.clone();
            let mut rx = self.engine.subscribe_trades();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(trade) => {
                            venue.klines.process_trade(
                                &trade.symbol,
                                trade.price,
                                trade.size,
                                trade.timestamp,
                            );
                            venue.hub.publish(
                                &Channel::Trades(trade.symbol.clone()),
                                StreamMessage::Trade(trade),
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged = n, "trade fan-out lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        // depth fan-out
        {
            let hub = self.hub.clone();
            let mut rx = self.engine.subscribe_depth();
            tokio::spawn(async move {
                while let Ok(depth) = rx.recv().await {
                    hub.publish(
                        &Channel::Orderbook(depth.symbol.clone()),
                        StreamMessage::Depth(depth),
                    );
                }
            });
        }

        // order persistence (best-effort mirror writes)
        {
            let mirror = self.mirror.clone();
            let mut rx = self.engine.subscribe_orders();
            tokio::spawn(async move {
                while let Ok(order) = rx.recv().await {
                    mirror.persist_order(&order).await;
                }
            });
        }

        // venue events fan-out + ledger legs for forced closes
        {
            let venue = self.clone();
            let mut rx = self.event_tx.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    match &event {
                        VenueEvent::Liquidation { pair_id, .. } => {
                            let ledger_id = venue
                                .state
                                .pair(*pair_id)
                                .and_then(|p| p.ledger_pair_id);
                            if let Some(ledger_id) = ledger_id {
                                if let Err(e) = venue.ledger.liquidate(ledger_id).await {
                                    error!(ledger_pair_id = ledger_id, error = %e, "ledger liquidation failed");
                                }
                            }
                            metrics::counter!(crate::metrics::LIQUIDATIONS_TOTAL).increment(1);
                        }
                        VenueEvent::PositionClosed {
                            pair_id,
                            exit_price,
                            ..
                        } => {
                            let ledger_id = venue
                                .state
                                .pair(*pair_id)
                                .and_then(|p| p.ledger_pair_id);
                            if let Some(ledger_id) = ledger_id {
                                if let Err(e) =
                                    venue.ledger.close_pair(ledger_id, *exit_price).await
                                {
                                    error!(ledger_pair_id = ledger_id, error = %e, "ledger close failed");
                                }
                            }
                        }
                        VenueEvent::AdlTriggered { .. } => {
                            metrics::counter!(crate::metrics::ADL_EVENTS_TOTAL).increment(1);
                        }
                        _ => {}
                    }
                    venue
                        .hub
                        .publish(&Channel::Events, StreamMessage::Event(event));
                }
            });
        }

        // risk snapshots fan-out
        {
            let hub = self.hub.clone();
            let mut rx = self.risk.subscribe();
            tokio::spawn(async move {
                while let Ok(update) = rx.recv().await {
                    match update {
                        RiskStreamUpdate::Global(snapshot) => {
                            hub.publish(&Channel::GlobalRisk, StreamMessage::GlobalRisk(snapshot));
                        }
                        RiskStreamUpdate::Trader(snapshot) => {
                            hub.publish(
                                &Channel::TraderRisk(snapshot.trader.clone()),
                                StreamMessage::TraderRisk(snapshot),
                            );
                        }
                    }
                }
            });
        }

        // periodic mirror sync + backlog flush
        {
            let venue = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(5));
                let mut settlement_watermark = 0usize;
                loop {
                    interval.tick().await;
                    for entry in venue.state.settlement_range(settlement_watermark) {
                        if venue.mirror.persist_settlement(&entry).await.is_ok() {
                            settlement_watermark += 1;
                        } else {
                            break;
                        }
                    }
                    for balance in venue.state.balances_snapshot() {
                        venue.mirror.persist_balance(&balance).await;
                    }
                    for pair in venue.state.active_pairs() {
                        venue.mirror.persist_pair(&pair).await;
                    }
                    for symbol in venue.state.symbols() {
                        if let Some(stats) = venue.state.market(&symbol) {
                            venue.mirror.persist_market(&stats).await;
                            if let Some(fund) = venue.state.insurance(&symbol) {
                                metrics::gauge!(
                                    crate::metrics::INSURANCE_BALANCE,
                                    "symbol" => symbol.clone()
                                )
                                .set(fund.balance as f64);
                            }
                        }
                    }
                    venue.mirror.flush_backlog().await;
                    metrics::gauge!(crate::metrics::MIRROR_BACKLOG)
                        .set(venue.mirror.backlog_len() as f64);
                }
            });
        }

        info!("venue tasks spawned");
    }
}
