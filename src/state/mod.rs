//! Venue State
//!
//! The logically centralized state every task cooperates on. Concurrency
//! discipline: the matching path is the writer for balances it debits and for
//! pair identity; the risk engine is the single writer of derived risk
//! fields; the reconciler is the single writer for ledger-sourced
//! transitions. Readers take consistent per-entry snapshots.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::error::RejectReason;
use crate::models::balance::{Balance, InsufficientBalance};
use crate::models::market::{InsuranceFund, MarketStats, SettlementLogEntry};
use crate::models::position::{Pair, PositionRisk};
use crate::models::order::Side;
use crate::models::units::{Amount, Price, Usd};

// ============================================================================
// Nonce registry
// ============================================================================

/// Replay protection mode, trader-selectable and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonceMode {
    /// Any unused nonce is accepted; the ledger de-duplicates.
    Tolerant,
    /// The next accepted nonce must be exactly counter + 1.
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceState {
    pub mode: NonceMode,
    pub used: HashSet<u64>,
    pub counter: u64,
}

impl Default for NonceState {
    fn default() -> Self {
        Self {
            mode: NonceMode::Tolerant,
            used: HashSet::new(),
            counter: 0,
        }
    }
}

impl NonceState {
    fn check(&self, nonce: u64) -> bool {
        match self.mode {
            NonceMode::Tolerant => !self.used.contains(&nonce),
            NonceMode::Sequential => nonce == self.counter + 1,
        }
    }

    fn commit(&mut self, nonce: u64) {
        self.used.insert(nonce);
        if nonce > self.counter {
            self.counter = nonce;
        }
    }
}

// ============================================================================
// Pending matches
// ============================================================================

/// A match awaiting ledger settlement. Ephemeral: dropped from the queue once
/// the ledger acknowledges the batch containing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMatch {
    pub match_id: Uuid,
    pub pair_id: Uuid,
    pub symbol: String,
    pub long_trader: String,
    pub short_trader: String,
    pub long_nonce: u64,
    pub short_nonce: u64,
    pub price: Price,
    pub size: Amount,
    pub timestamp: i64,
}

// ============================================================================
// Venue state
// ============================================================================

pub struct VenueState {
    balances: DashMap<String, Balance>,
    pairs: DashMap<Uuid, Pair>,
    /// ledger pair id -> local pair id
    ledger_pairs: DashMap<u64, Uuid>,
    /// Derived per-side risk, risk-engine single-writer.
    risk: DashMap<(Uuid, Side), PositionRisk>,
    markets: DashMap<String, MarketStats>,
    insurance: DashMap<String, InsuranceFund>,
    global_insurance: Mutex<InsuranceFund>,
    nonces: DashMap<String, NonceState>,
    settlement_log: RwLock<Vec<SettlementLogEntry>>,
    pending_matches: Mutex<VecDeque<PendingMatch>>,
    pending_high_water: usize,
    degraded: AtomicBool,
}

impl VenueState {
    pub fn new(symbols: &[String], insurance_seed: Usd, pending_high_water: usize) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let markets = DashMap::new();
        let insurance = DashMap::new();
        for symbol in symbols {
            markets.insert(symbol.clone(), MarketStats::new(symbol, now));
            insurance.insert(symbol.clone(), InsuranceFund::with_balance(insurance_seed));
        }
        Self {
            balances: DashMap::new(),
            pairs: DashMap::new(),
            ledger_pairs: DashMap::new(),
            risk: DashMap::new(),
            markets,
            insurance,
            global_insurance: Mutex::new(InsuranceFund::default()),
            nonces: DashMap::new(),
            settlement_log: RwLock::new(Vec::new()),
            pending_matches: Mutex::new(VecDeque::new()),
            pending_high_water,
            degraded: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Symbols & markets
    // ------------------------------------------------------------------

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.markets.contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.markets.iter().map(|e| e.key().clone()).collect()
    }

    pub fn market(&self, symbol: &str) -> Option<MarketStats> {
        self.markets.get(symbol).map(|e| e.clone())
    }

    pub fn with_market_mut<R>(
        &self,
        symbol: &str,
        f: impl FnOnce(&mut MarketStats) -> R,
    ) -> Option<R> {
        self.markets.get_mut(symbol).map(|mut e| f(&mut e))
    }

    pub fn mark_price(&self, symbol: &str) -> Option<Price> {
        self.markets
            .get(symbol)
            .map(|e| e.mark_price)
            .filter(|p| *p > 0)
    }

    /// Restore a market snapshot during rehydration.
    pub fn restore_market(&self, stats: MarketStats) {
        self.markets.insert(stats.symbol.clone(), stats);
    }

    // ------------------------------------------------------------------
    // Balances
    // ------------------------------------------------------------------

    pub fn balance(&self, trader: &str) -> Balance {
        self.balances
            .get(trader)
            .map(|e| e.clone())
            .unwrap_or_else(|| Balance::new(trader))
    }

    /// Serialized per-trader balance mutation.
    pub fn with_balance_mut<R>(&self, trader: &str, f: impl FnOnce(&mut Balance) -> R) -> R {
        let mut entry = self
            .balances
            .entry(trader.to_string())
            .or_insert_with(|| Balance::new(trader));
        f(&mut entry)
    }

    pub fn try_freeze(&self, trader: &str, total: Usd, now_ms: i64) -> Result<(), InsufficientBalance> {
        self.with_balance_mut(trader, |b| b.freeze(total, now_ms))
    }

    pub fn restore_balance(&self, balance: Balance) {
        self.balances.insert(balance.trader.clone(), balance);
    }

    pub fn balances_snapshot(&self) -> Vec<Balance> {
        self.balances.iter().map(|e| e.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Nonces
    // ------------------------------------------------------------------

    pub fn check_nonce(&self, trader: &str, nonce: u64) -> Result<(), RejectReason> {
        let entry = self.nonces.entry(trader.to_string()).or_default();
        if entry.check(nonce) {
            Ok(())
        } else {
            Err(RejectReason::BadNonce)
        }
    }

    pub fn commit_nonce(&self, trader: &str, nonce: u64) {
        self.nonces.entry(trader.to_string()).or_default().commit(nonce);
    }

    pub fn set_nonce_mode(&self, trader: &str, mode: NonceMode) {
        self.nonces.entry(trader.to_string()).or_default().mode = mode;
    }

    pub fn nonce_mode(&self, trader: &str) -> NonceMode {
        self.nonces
            .get(trader)
            .map(|e| e.mode)
            .unwrap_or(NonceMode::Tolerant)
    }

    // ------------------------------------------------------------------
    // Pairs
    // ------------------------------------------------------------------

    pub fn insert_pair(&self, pair: Pair) {
        if let Some(ledger_id) = pair.ledger_pair_id {
            self.ledger_pairs.insert(ledger_id, pair.id);
        }
        self.pairs.insert(pair.id, pair);
    }

    pub fn pair(&self, id: Uuid) -> Option<Pair> {
        self.pairs.get(&id).map(|e| e.clone())
    }

    pub fn pair_by_ledger_id(&self, ledger_id: u64) -> Option<Pair> {
        let id = self.ledger_pairs.get(&ledger_id).map(|e| *e)?;
        self.pair(id)
    }

    pub fn with_pair_mut<R>(&self, id: Uuid, f: impl FnOnce(&mut Pair) -> R) -> Option<R> {
        self.pairs.get_mut(&id).map(|mut e| f(&mut e))
    }

    pub fn bind_ledger_pair(&self, id: Uuid, ledger_id: u64) {
        if let Some(mut pair) = self.pairs.get_mut(&id) {
            pair.ledger_pair_id = Some(ledger_id);
            self.ledger_pairs.insert(ledger_id, id);
        }
    }

    pub fn remove_pair(&self, id: Uuid) -> Option<Pair> {
        let (_, pair) = self.pairs.remove(&id)?;
        if let Some(ledger_id) = pair.ledger_pair_id {
            self.ledger_pairs.remove(&ledger_id);
        }
        self.risk.remove(&(id, Side::Long));
        self.risk.remove(&(id, Side::Short));
        Some(pair)
    }

    /// Consistent snapshot of active pairs for the risk tick.
    pub fn active_pairs(&self) -> Vec<Pair> {
        self.pairs
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.clone())
            .collect()
    }

    pub fn pairs_of(&self, trader: &str) -> Vec<Pair> {
        self.pairs
            .iter()
            .filter(|e| e.side_of(trader).is_some())
            .map(|e| e.clone())
            .collect()
    }

    /// Same-side active position of a trader in a symbol, if any. Used for
    /// merge-on-open and reduce-only checks.
    pub fn position_of(&self, trader: &str, symbol: &str, side: Side) -> Option<Pair> {
        self.pairs
            .iter()
            .find(|e| {
                e.is_active() && e.symbol == symbol && e.side_of(trader) == Some(side)
            })
            .map(|e| e.clone())
    }

    pub fn adjust_open_interest(&self, symbol: &str, delta: Amount) {
        if let Some(mut stats) = self.markets.get_mut(symbol) {
            stats.long_oi += delta;
            stats.short_oi += delta;
        }
    }

    // ------------------------------------------------------------------
    // Derived risk (risk-engine single-writer)
    // ------------------------------------------------------------------

    pub fn put_risk(&self, risk: PositionRisk) {
        self.risk.insert((risk.pair_id, risk.side), risk);
    }

    pub fn risk_of(&self, pair_id: Uuid, side: Side) -> Option<PositionRisk> {
        self.risk.get(&(pair_id, side)).map(|e| e.clone())
    }

    pub fn risk_of_trader(&self, trader: &str) -> Vec<PositionRisk> {
        self.risk
            .iter()
            .filter(|e| e.trader == trader)
            .map(|e| e.clone())
            .collect()
    }

    pub fn risk_snapshot(&self) -> Vec<PositionRisk> {
        self.risk.iter().map(|e| e.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Insurance funds
    // ------------------------------------------------------------------

    pub fn insurance(&self, symbol: &str) -> Option<InsuranceFund> {
        self.insurance.get(symbol).map(|e| e.clone())
    }

    pub fn with_insurance_mut<R>(
        &self,
        symbol: &str,
        f: impl FnOnce(&mut InsuranceFund) -> R,
    ) -> Option<R> {
        self.insurance.get_mut(symbol).map(|mut e| f(&mut e))
    }

    pub fn global_insurance(&self) -> InsuranceFund {
        self.global_insurance.lock().clone()
    }

    pub fn with_global_insurance_mut<R>(&self, f: impl FnOnce(&mut InsuranceFund) -> R) -> R {
        f(&mut self.global_insurance.lock())
    }

    // ------------------------------------------------------------------
    // Settlement log
    // ------------------------------------------------------------------

    pub fn append_settlement(&self, entry: SettlementLogEntry) {
        self.settlement_log.write().push(entry);
    }

    pub fn settlement_entries(&self, trader: Option<&str>, limit: usize) -> Vec<SettlementLogEntry> {
        let log = self.settlement_log.read();
        log.iter()
            .rev()
            .filter(|e| trader.map_or(true, |t| e.trader == t))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn settlement_len(&self) -> usize {
        self.settlement_log.read().len()
    }

    /// Entries appended at or after `from`, in append order. Drained by the
    /// mirror persistence watermark.
    pub fn settlement_range(&self, from: usize) -> Vec<SettlementLogEntry> {
        let log = self.settlement_log.read();
        log.get(from..).map(|s| s.to_vec()).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Pending-match queue & backpressure
    // ------------------------------------------------------------------

    /// Enqueue a match for ledger settlement. Matches are always accepted;
    /// crossing the high-water mark flips the venue into degraded mode.
    pub fn push_pending(&self, m: PendingMatch) {
        let mut queue = self.pending_matches.lock();
        queue.push_back(m);
        if queue.len() > self.pending_high_water && !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                queue_len = queue.len(),
                high_water = self.pending_high_water,
                "pending-match queue over high water, entering degraded mode"
            );
        }
    }

    /// Peek at most `max` matches from the head without removing them.
    /// The submitter confirms with `ack_pending` only after the ledger accepts.
    pub fn peek_pending(&self, max: usize) -> Vec<PendingMatch> {
        let queue = self.pending_matches.lock();
        queue.iter().take(max).cloned().collect()
    }

    /// Drop `count` confirmed matches from the head and re-evaluate
    /// backpressure. Draining below half the high-water mark leaves degraded
    /// mode.
    pub fn ack_pending(&self, count: usize) {
        let mut queue = self.pending_matches.lock();
        for _ in 0..count {
            queue.pop_front();
        }
        if queue.len() <= self.pending_high_water / 2
            && self.degraded.swap(false, Ordering::SeqCst)
        {
            tracing::info!(queue_len = queue.len(), "pending-match queue drained, leaving degraded mode");
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending_matches.lock().len()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Invariant audit (used by tests and the invariant alarm)
    // ------------------------------------------------------------------

    /// Per-symbol aggregate long size equals aggregate short size (each pair
    /// carries both sides), and the published open interest agrees with the
    /// pair store: long_oi + short_oi = 2 x total pair size.
    pub fn audit_pair_symmetry(&self) -> Result<(), String> {
        for symbol in self.symbols() {
            let mut total: Amount = 0;
            for pair in self.pairs.iter().filter(|p| p.is_active() && p.symbol == symbol) {
                total += pair.size;
            }
            let Some(stats) = self.market(&symbol) else {
                continue;
            };
            if stats.long_oi != stats.short_oi {
                return Err(format!(
                    "symbol {}: long_oi {} != short_oi {}",
                    symbol, stats.long_oi, stats.short_oi
                ));
            }
            if stats.long_oi + stats.short_oi != 2 * total {
                return Err(format!(
                    "symbol {}: open interest {} diverges from pair size {}",
                    symbol,
                    stats.long_oi + stats.short_oi,
                    total
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> VenueState {
        VenueState::new(&["DOGEUSD".to_string()], 1_000_000, 4)
    }

    fn test_pair() -> Pair {
        use crate::models::position::{PairStatus, TpSl};
        use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE};
        Pair {
            id: Uuid::new_v4(),
            ledger_pair_id: None,
            symbol: "DOGEUSD".to_string(),
            long_trader: "0xlong".to_string(),
            short_trader: "0xshort".to_string(),
            size: AMOUNT_SCALE,
            entry_price: PRICE_SCALE,
            long_collateral: 50_000,
            short_collateral: 50_000,
            long_leverage_bp: 200_000,
            short_leverage_bp: 200_000,
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
        }
    }

    #[test]
    fn test_nonce_tolerant_forbids_reuse() {
        let s = state();
        assert!(s.check_nonce("0xa", 5).is_ok());
        s.commit_nonce("0xa", 5);
        assert_eq!(s.check_nonce("0xa", 5), Err(RejectReason::BadNonce));
        // out-of-order is fine in tolerant mode
        assert!(s.check_nonce("0xa", 3).is_ok());
    }

    #[test]
    fn test_nonce_sequential_requires_next() {
        let s = state();
        s.set_nonce_mode("0xa", NonceMode::Sequential);
        assert_eq!(s.check_nonce("0xa", 3), Err(RejectReason::BadNonce));
        assert!(s.check_nonce("0xa", 1).is_ok());
        s.commit_nonce("0xa", 1);
        assert!(s.check_nonce("0xa", 2).is_ok());
        assert_eq!(s.check_nonce("0xa", 1), Err(RejectReason::BadNonce));
    }

    #[test]
    fn test_degraded_mode_hysteresis() {
        let s = state();
        for i in 0..5 {
            s.push_pending(PendingMatch {
                match_id: Uuid::new_v4(),
                pair_id: Uuid::new_v4(),
                symbol: "DOGEUSD".to_string(),
                long_trader: "a".into(),
                short_trader: "b".into(),
                long_nonce: i,
                short_nonce: i,
                price: 1,
                size: 1,
                timestamp: 0,
            });
        }
        assert!(s.is_degraded());

        s.ack_pending(3);
        assert!(!s.is_degraded());
        assert_eq!(s.pending_len(), 2);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let s = state();
        s.push_pending(PendingMatch {
            match_id: Uuid::new_v4(),
            pair_id: Uuid::new_v4(),
            symbol: "DOGEUSD".to_string(),
            long_trader: "a".into(),
            short_trader: "b".into(),
            long_nonce: 0,
            short_nonce: 0,
            price: 1,
            size: 1,
            timestamp: 0,
        });
        assert_eq!(s.peek_pending(10).len(), 1);
        assert_eq!(s.pending_len(), 1);
        s.ack_pending(1);
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn test_ledger_pair_binding() {
        let s = state();
        let pair = test_pair();
        let id = pair.id;
        s.insert_pair(pair);

        s.bind_ledger_pair(id, 42);
        assert_eq!(s.pair_by_ledger_id(42).unwrap().id, id);

        s.remove_pair(id);
        assert!(s.pair_by_ledger_id(42).is_none());
    }
}
