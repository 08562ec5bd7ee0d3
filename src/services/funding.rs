//! Funding-Rate Engine
//!
//! Premium/interest funding with an order-book-imbalance fallback, a
//! volatility-driven settlement interval, and batched per-position
//! settlement into balances and accumulators.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::market::{OnchainStatus, SettlementKind, SettlementLogEntry};
use crate::models::order::Side;
use crate::models::units::{notional_usd, Bp, Price, Usd, PRECISION};
use crate::state::VenueState;
use crate::stream::channels::VenueEvent;

/// Interest component per interval: 0.01%.
const INTEREST_BP: i128 = 1;
/// Clamp on (interest - premium): +-0.05%.
const INTEREST_PREMIUM_CLAMP_BP: i128 = 5;
/// Minimum reference-price samples before volatility shortens the interval.
const MIN_VOLATILITY_SAMPLES: usize = 10;

#[derive(Debug, Clone)]
pub struct FundingConfig {
    pub base_interval_ms: u64,
    pub min_interval_ms: u64,
    /// Per-symbol clamp resolver output; wired from `AppConfig`.
    pub max_rate_bp: Bp,
    pub volatile_max_rate_bp: Bp,
    pub volatile_symbols: Vec<String>,
    pub sample_window: usize,
}

impl FundingConfig {
    fn max_rate_for(&self, symbol: &str) -> Bp {
        if self.volatile_symbols.iter().any(|s| s == symbol) {
            self.volatile_max_rate_bp
        } else {
            self.max_rate_bp
        }
    }
}

pub struct FundingService {
    state: Arc<VenueState>,
    event_tx: broadcast::Sender<VenueEvent>,
    config: FundingConfig,
    /// Rolling reference-price window per symbol, volatility input.
    samples: RwLock<HashMap<String, VecDeque<Price>>>,
}

impl FundingService {
    pub fn new(
        state: Arc<VenueState>,
        event_tx: broadcast::Sender<VenueEvent>,
        config: FundingConfig,
    ) -> Self {
        Self {
            state,
            event_tx,
            config,
            samples: RwLock::new(HashMap::new()),
        }
    }

    /// Record a reference-price sample (spot sync cadence).
    pub fn record_reference_price(&self, symbol: &str, price: Price) {
        if price <= 0 {
            return;
        }
        let mut samples = self.samples.write();
        let window = samples.entry(symbol.to_string()).or_default();
        window.push_back(price);
        while window.len() > self.config.sample_window {
            window.pop_front();
        }
    }

    // ========================================================================
    // Rate
    // ========================================================================

    /// Premium/interest rate, clamped per symbol. Falls back to order-book
    /// imbalance when no spot index is available.
    pub fn compute_rate(&self, symbol: &str) -> Bp {
        let Some(stats) = self.state.market(symbol) else {
            return 0;
        };
        let max_rate = self.config.max_rate_for(symbol);

        let raw = match (stats.spot_index_price, stats.mark_price) {
            (Some(spot), mark) if spot > 0 && mark > 0 => {
                let premium =
                    (mark as i128 - spot as i128) * PRECISION as i128 / spot as i128;
                let counterweight = (INTEREST_BP - premium)
                    .clamp(-INTEREST_PREMIUM_CLAMP_BP, INTEREST_PREMIUM_CLAMP_BP);
                premium + counterweight
            }
            _ => stats.oi_imbalance_bp() as i128 / 100,
        };

        raw.clamp(-(max_rate as i128), max_rate as i128) as Bp
    }

    /// Settlement interval scaled by realized reference-price volatility:
    /// sigma above 5% pins the minimum, a 1..5% band interpolates linearly,
    /// quieter markets use the base interval.
    pub fn dynamic_interval_ms(&self, symbol: &str) -> u64 {
        let sigma_pct = self.volatility_pct(symbol);
        let base = self.config.base_interval_ms;
        let min = self.config.min_interval_ms;
        if sigma_pct > 5.0 {
            min
        } else if sigma_pct > 1.0 {
            let t = (sigma_pct - 1.0) / 4.0;
            base - ((base - min) as f64 * t) as u64
        } else {
            base
        }
    }

    /// stddev/mean of the sample window, in percent. Telemetry-grade float
    /// arithmetic; this drives cadence, never a monetary amount.
    fn volatility_pct(&self, symbol: &str) -> f64 {
        let samples = self.samples.read();
        let Some(window) = samples.get(symbol) else {
            return 0.0;
        };
        if window.len() < MIN_VOLATILITY_SAMPLES {
            return 0.0;
        }
        let n = window.len() as f64;
        let mean = window.iter().map(|p| *p as f64).sum::<f64>() / n;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance = window
            .iter()
            .map(|p| {
                let d = *p as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        variance.sqrt() / mean * 100.0
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// Settle every symbol whose funding time has arrived. Returns how many
    /// symbols settled.
    pub fn run_once(&self, now_ms: i64) -> usize {
        let mut settled = 0;
        for symbol in self.state.symbols() {
            let due = self
                .state
                .market(&symbol)
                .map(|s| now_ms >= s.next_funding_time)
                .unwrap_or(false);
            if due {
                self.settle_symbol(&symbol, now_ms);
                settled += 1;
            }
        }
        settled
    }

    fn settle_symbol(&self, symbol: &str, now_ms: i64) {
        let rate = self.compute_rate(symbol);
        let Some(mark) = self.state.mark_price(symbol) else {
            // nothing has traded; just roll the clock forward
            self.roll_schedule(symbol, rate, now_ms);
            return;
        };

        let pairs: Vec<_> = self
            .state
            .active_pairs()
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .collect();

        let mut settled_pairs = 0;
        for pair in &pairs {
            let payment = (notional_usd(pair.size, mark) as i128 * rate.unsigned_abs() as i128
                / PRECISION as i128) as Usd;
            if payment == 0 || rate == 0 {
                continue;
            }
            // rate > 0: longs pay shorts; rate < 0: shorts pay longs
            let (payer_side, payer, recipient) = if rate > 0 {
                (Side::Long, pair.long_trader.clone(), pair.short_trader.clone())
            } else {
                (Side::Short, pair.short_trader.clone(), pair.long_trader.clone())
            };

            // available >= 0 is enforced at write time: a drained payer pays
            // what it has.
            let paid = self.state.with_balance_mut(&payer, |b| {
                let paid = payment.min(b.available);
                b.available -= paid;
                b.updated_at = now_ms;
                paid
            });
            self.state.with_balance_mut(&recipient, |b| b.credit(paid, now_ms));

            self.state.with_pair_mut(pair.id, |p| match payer_side {
                Side::Long => {
                    p.acc_funding_long += paid;
                    p.acc_funding_short -= paid;
                }
                Side::Short => {
                    p.acc_funding_short += paid;
                    p.acc_funding_long -= paid;
                }
            });

            for (trader, amount) in [(&payer, -paid), (&recipient, paid)] {
                let balance = self.state.balance(trader);
                self.state.append_settlement(SettlementLogEntry {
                    id: Uuid::new_v4(),
                    kind: SettlementKind::FundingFee,
                    trader: trader.to_string(),
                    symbol: Some(symbol.to_string()),
                    amount,
                    balance_before: balance.available - amount,
                    balance_after: balance.available,
                    onchain_status: OnchainStatus::Pending,
                    txn_ref: None,
                    proof: Some(serde_json::json!({ "pair_id": pair.id, "rate_bp": rate })),
                    created_at: now_ms,
                });
            }
            settled_pairs += 1;
        }

        self.roll_schedule(symbol, rate, now_ms);
        let _ = self.event_tx.send(VenueEvent::FundingSettlement {
            symbol: symbol.to_string(),
            rate_bp: rate,
            pairs_settled: settled_pairs,
            timestamp: now_ms,
        });
        info!(symbol, rate_bp = rate, settled_pairs, "funding settled");
    }

    fn roll_schedule(&self, symbol: &str, rate: Bp, now_ms: i64) {
        let interval = self.dynamic_interval_ms(symbol) as i64;
        self.state.with_market_mut(symbol, |stats| {
            stats.funding_rate_bp = rate;
            stats.funding_index += rate as i64;
            stats.last_funding_time = now_ms;
            stats.next_funding_time = now_ms + interval;
            stats.updated_at = now_ms;
        });
        debug!(symbol, rate_bp = rate, interval_ms = interval, "funding schedule rolled");
    }

    /// Refresh the published rate without settling (between settlements).
    pub fn refresh_rate(&self, symbol: &str) {
        let rate = self.compute_rate(symbol);
        self.state.with_market_mut(symbol, |stats| {
            stats.funding_rate_bp = rate;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::position::{Pair, PairStatus, TpSl};
    use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE, USD_SCALE};

    fn config() -> FundingConfig {
        FundingConfig {
            base_interval_ms: 3_600_000,
            min_interval_ms: 900_000,
            max_rate_bp: 75,
            volatile_max_rate_bp: 300,
            volatile_symbols: vec!["VOLUSD".to_string()],
            sample_window: 120,
        }
    }

    fn setup() -> (Arc<VenueState>, FundingService) {
        let state = Arc::new(VenueState::new(
            &["MEMEUSD".to_string(), "VOLUSD".to_string()],
            0,
            1_000,
        ));
        let (event_tx, _) = broadcast::channel(256);
        let service = FundingService::new(state.clone(), event_tx, config());
        (state, service)
    }

    #[test]
    fn test_rate_premium_plus_interest() {
        let (state, service) = setup();
        // mark 1.002, spot 1.000: premium 20bp, counterweight clamps to -5
        state.with_market_mut("MEMEUSD", |m| {
            m.mark_price = PRICE_SCALE * 1002 / 1000;
            m.spot_index_price = Some(PRICE_SCALE);
        });
        assert_eq!(service.compute_rate("MEMEUSD"), 15);
    }

    #[test]
    fn test_rate_small_premium_uses_interest() {
        let (state, service) = setup();
        // mark == spot: premium 0, rate = interest = 1bp
        state.with_market_mut("MEMEUSD", |m| {
            m.mark_price = PRICE_SCALE;
            m.spot_index_price = Some(PRICE_SCALE);
        });
        assert_eq!(service.compute_rate("MEMEUSD"), 1);
    }

    #[test]
    fn test_rate_clamped_per_symbol() {
        let (state, service) = setup();
        for symbol in ["MEMEUSD", "VOLUSD"] {
            // mark 1.10 vs spot 1.00: premium 1000bp, far past any clamp
            state.with_market_mut(symbol, |m| {
                m.mark_price = PRICE_SCALE * 11 / 10;
                m.spot_index_price = Some(PRICE_SCALE);
            });
        }
        assert_eq!(service.compute_rate("MEMEUSD"), 75);
        assert_eq!(service.compute_rate("VOLUSD"), 300);
    }

    #[test]
    fn test_rate_imbalance_fallback() {
        let (state, service) = setup();
        state.with_market_mut("MEMEUSD", |m| {
            m.mark_price = PRICE_SCALE;
            m.spot_index_price = None;
            m.long_oi = 3 * AMOUNT_SCALE;
            m.short_oi = AMOUNT_SCALE;
        });
        // imbalance 5000bp -> 50bp
        assert_eq!(service.compute_rate("MEMEUSD"), 50);
    }

    #[test]
    fn test_dynamic_interval_bands() {
        let (_state, service) = setup();

        // fewer than 10 samples: base interval
        for _ in 0..5 {
            service.record_reference_price("MEMEUSD", PRICE_SCALE);
        }
        assert_eq!(service.dynamic_interval_ms("MEMEUSD"), 3_600_000);

        // flat window: still base
        for _ in 0..15 {
            service.record_reference_price("MEMEUSD", PRICE_SCALE);
        }
        assert_eq!(service.dynamic_interval_ms("MEMEUSD"), 3_600_000);

        // wild window: minimum
        for i in 0..20 {
            let p = if i % 2 == 0 {
                PRICE_SCALE
            } else {
                PRICE_SCALE * 13 / 10
            };
            service.record_reference_price("VOLUSD", p);
        }
        assert_eq!(service.dynamic_interval_ms("VOLUSD"), 900_000);
    }

    #[test]
    fn test_settlement_longs_pay_shorts_on_positive_rate() {
        let (state, service) = setup();
        state.with_market_mut("MEMEUSD", |m| {
            m.record_trade(PRICE_SCALE, 0, 0);
            m.spot_index_price = Some(PRICE_SCALE * 99 / 100); // mark above spot
            m.next_funding_time = 0;
        });

        let pair = Pair {
            id: Uuid::new_v4(),
            ledger_pair_id: None,
            symbol: "MEMEUSD".to_string(),
            long_trader: "payer".to_string(),
            short_trader: "earner".to_string(),
            size: 100 * AMOUNT_SCALE,
            entry_price: PRICE_SCALE,
            long_collateral: 10 * USD_SCALE,
            short_collateral: 10 * USD_SCALE,
            long_leverage_bp: 100_000,
            short_leverage_bp: 100_000,
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
        state.with_balance_mut("payer", |b| b.credit(10 * USD_SCALE, 0));
        let pair_id = pair.id;
        state.insert_pair(pair);

        assert_eq!(service.run_once(1_000), 1); // only MEMEUSD is due

        // premium ~101bp clamps to 75bp: payment = 100 USD notional * 0.75%
        let rate = state.market("MEMEUSD").unwrap().funding_rate_bp;
        assert_eq!(rate, 75);
        let expected = (100 * USD_SCALE) * 75 / 10_000;
        assert_eq!(state.balance("payer").available, 10 * USD_SCALE - expected);
        assert_eq!(state.balance("earner").available, expected);

        let pair = state.pair(pair_id).unwrap();
        assert_eq!(pair.acc_funding_long, expected);
        assert_eq!(pair.acc_funding_short, -expected);

        // schedule rolled forward and index accrued
        let stats = state.market("MEMEUSD").unwrap();
        assert!(stats.next_funding_time > 1_000);
        assert_eq!(stats.funding_index, 75);
    }

    #[test]
    fn test_settlement_not_due_is_noop() {
        let (state, service) = setup();
        state.with_market_mut("MEMEUSD", |m| {
            m.next_funding_time = i64::MAX;
        });
        state.with_market_mut("VOLUSD", |m| {
            m.next_funding_time = i64::MAX;
        });
        assert_eq!(service.run_once(1_000), 0);
    }
}
