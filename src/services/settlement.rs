//! Batch Submitter & Ledger Reconciler
//!
//! The submitter drains the pending-match queue into bounded, ordered
//! batches with exactly one submission in flight, retrying forever with
//! capped exponential backoff. The reconciler consumes ledger events and is
//! the single writer for ledger-sourced balance and position transitions;
//! its writes are durable in the mirror before acknowledgement.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ledger::{LedgerClient, LedgerEvent, LedgerEventEnvelope};
use crate::mirror::MirrorStore;
use crate::models::market::{OnchainStatus, SettlementKind, SettlementLogEntry};
use crate::models::position::{Pair, PairStatus, TpSl};
use crate::models::units::{implied_leverage_bp, notional_usd};
use crate::state::VenueState;
use crate::stream::channels::VenueEvent;

// ============================================================================
// Batch submitter
// ============================================================================

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub interval_ms: u64,
    pub max_batch: usize,
    pub attempt_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

pub struct BatchSubmitter {
    state: Arc<VenueState>,
    ledger: Arc<dyn LedgerClient>,
    config: SubmitterConfig,
    in_flight: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl BatchSubmitter {
    pub fn new(
        state: Arc<VenueState>,
        ledger: Arc<dyn LedgerClient>,
        config: SubmitterConfig,
    ) -> Self {
        Self {
            state,
            ledger,
            config,
            in_flight: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// One submission attempt. Exactly one batch is in flight at any time;
    /// a concurrent call is a no-op. Returns how many matches were
    /// acknowledged.
    pub async fn submit_once(&self) -> usize {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let submitted = self.submit_inner().await;
        self.in_flight.store(false, Ordering::SeqCst);
        submitted
    }

    async fn submit_inner(&self) -> usize {
        let batch = self.state.peek_pending(self.config.max_batch);
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();
        let now = Utc::now().timestamp_millis();

        let call = self.ledger.settle_batch(batch.clone());
        let result = tokio::time::timeout(
            Duration::from_millis(self.config.attempt_timeout_ms),
            call,
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.state.ack_pending(count);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                for m in &batch {
                    self.state.append_settlement(SettlementLogEntry {
                        id: Uuid::new_v4(),
                        kind: SettlementKind::SettlePnl,
                        trader: m.long_trader.clone(),
                        symbol: Some(m.symbol.clone()),
                        amount: 0,
                        balance_before: 0,
                        balance_after: 0,
                        onchain_status: OnchainStatus::Success,
                        txn_ref: None,
                        proof: Some(serde_json::json!({
                            "match_id": m.match_id,
                            "size": m.size.to_string(),
                            "price": m.price,
                        })),
                        created_at: now,
                    });
                }
                metrics::counter!(crate::metrics::LEDGER_BATCHES).increment(1);
                info!(count, "batch settled on ledger");
                count
            }
            Ok(Err(e)) => {
                // matches stay queued; the next tick retries the same batch
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::counter!(crate::metrics::LEDGER_BATCH_FAILURES).increment(1);
                error!(count, failures, error = %e, "ledger batch submission failed");
                0
            }
            Err(_) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::counter!(crate::metrics::LEDGER_BATCH_FAILURES).increment(1);
                error!(count, failures, "ledger batch submission timed out");
                0
            }
        }
    }

    fn backoff_delay(&self) -> Duration {
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures == 0 {
            return Duration::from_millis(0);
        }
        let exp = failures.min(16);
        let delay = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exp.saturating_sub(1))
            .min(self.config.backoff_cap_ms);
        Duration::from_millis(delay)
    }

    /// Timer-driven drain: the base cadence, the size threshold, and the
    /// failure backoff compose here.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_ms = self.config.interval_ms,
            max_batch = self.config.max_batch,
            "batch submitter started"
        );
        loop {
            let backoff = self.backoff_delay();
            if backoff > Duration::from_millis(0) {
                tokio::time::sleep(backoff).await;
            } else if self.state.pending_len() < self.config.max_batch {
                tokio::time::sleep(Duration::from_millis(self.config.interval_ms)).await;
            }
            // a full batch drains immediately
            self.submit_once().await;
        }
    }
}

// ============================================================================
// Ledger reconciler
// ============================================================================

pub struct LedgerReconciler {
    state: Arc<VenueState>,
    ledger: Arc<dyn LedgerClient>,
    mirror: Arc<MirrorStore>,
    event_tx: broadcast::Sender<VenueEvent>,
    seen: parking_lot::Mutex<std::collections::HashSet<Uuid>>,
}

impl LedgerReconciler {
    pub fn new(
        state: Arc<VenueState>,
        ledger: Arc<dyn LedgerClient>,
        mirror: Arc<MirrorStore>,
        event_tx: broadcast::Sender<VenueEvent>,
    ) -> Self {
        Self {
            state,
            ledger,
            mirror,
            event_tx,
            seen: parking_lot::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Boot-time scan: seed the position store from ledger-active pairs
    /// before ingress opens.
    pub async fn startup_scan(&self) -> Result<usize, crate::error::CoreError> {
        let pairs = self
            .ledger
            .list_active_pairs()
            .await
            .map_err(|e| crate::error::CoreError::LedgerUnavailable(e.to_string()))?;
        let mut seeded = 0;
        for lp in pairs {
            if self.state.pair_by_ledger_id(lp.pair_id).is_some() {
                continue;
            }
            self.upsert_ledger_pair(lp.pair_id, &lp.long, &lp.short, &lp.symbol, lp.size, lp.entry_price);
            seeded += 1;
        }
        info!(seeded, "startup reconciliation complete");
        Ok(seeded)
    }

    /// Consume the ledger event stream. Single writer for ledger-sourced
    /// transitions.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.ledger.subscribe_events();
        info!("ledger reconciler started");
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if let Err(e) = self.apply(envelope).await {
                        error!(error = %e, "reconciliation halted on event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "reconciler lagged ledger events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("ledger event stream closed, reconciler stopping");
                    break;
                }
            }
        }
    }

    /// Apply one event, idempotent on event id.
    pub async fn apply(&self, envelope: LedgerEventEnvelope) -> Result<(), crate::error::CoreError> {
        if !self.seen.lock().insert(envelope.event_id) {
            debug!(event_id = %envelope.event_id, "duplicate ledger event ignored");
            return Ok(());
        }
        if self.mirror.is_event_reconciled(&envelope.event_id).await {
            debug!(event_id = %envelope.event_id, "event already reconciled in a prior run");
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();

        match &envelope.event {
            LedgerEvent::Deposited { user, amount }
            | LedgerEvent::DepositedFor { user, amount, .. } => {
                self.credit(user, *amount, SettlementKind::Deposit, now).await?;
            }
            LedgerEvent::Withdrawn { user, amount } => {
                let before = self.state.balance(user).available;
                let debited = self.state.with_balance_mut(user, |b| {
                    let debited = (*amount).min(b.available);
                    b.available -= debited;
                    b.updated_at = now;
                    debited
                });
                if debited < *amount {
                    // the relayer checked funds; a shortfall here means our
                    // view diverged from the ledger
                    error!(
                        user = %user,
                        amount,
                        debited,
                        "withdrawal exceeds local balance, state divergence"
                    );
                }
                self.log_and_persist(user, -debited, SettlementKind::Withdraw, before, now)
                    .await?;
            }
            LedgerEvent::PairOpened {
                pair_id,
                long,
                short,
                symbol,
                size,
                entry_price,
            } => {
                self.bind_or_upsert(*pair_id, long, short, symbol, *size, *entry_price);
            }
            LedgerEvent::PairClosed { pair_id, .. } => {
                if let Some(pair) = self.state.pair_by_ledger_id(*pair_id) {
                    if pair.status == PairStatus::Active {
                        // a close the core did not originate: trust the ledger
                        warn!(ledger_pair_id = pair_id, "ledger closed a locally active pair");
                        self.state.with_pair_mut(pair.id, |p| {
                            p.status = PairStatus::Closed;
                            p.updated_at = now;
                        });
                    }
                } else {
                    // unknown pair close is idempotent-safe: nothing to free
                    debug!(ledger_pair_id = pair_id, "pair_closed for unknown pair dropped");
                }
            }
            LedgerEvent::Liquidated { pair_id, .. } => {
                if let Some(pair) = self.state.pair_by_ledger_id(*pair_id) {
                    if pair.status == PairStatus::Active {
                        warn!(ledger_pair_id = pair_id, "ledger liquidated a locally active pair");
                        self.state.with_pair_mut(pair.id, |p| {
                            p.status = PairStatus::Liquidated;
                            p.updated_at = now;
                        });
                    }
                }
            }
        }

        // durable before acknowledgement
        if self.mirror.is_available() {
            self.mirror
                .mark_event_reconciled(&envelope.event_id)
                .await
                .map_err(|e| crate::error::CoreError::MirrorUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    async fn credit(
        &self,
        user: &str,
        amount: i64,
        kind: SettlementKind,
        now: i64,
    ) -> Result<(), crate::error::CoreError> {
        let before = self.state.balance(user).available;
        self.state.with_balance_mut(user, |b| b.credit(amount, now));
        self.log_and_persist(user, amount, kind, before, now).await
    }

    async fn log_and_persist(
        &self,
        user: &str,
        amount: i64,
        kind: SettlementKind,
        before: i64,
        now: i64,
    ) -> Result<(), crate::error::CoreError> {
        let balance = self.state.balance(user);
        let entry = SettlementLogEntry {
            id: Uuid::new_v4(),
            kind,
            trader: user.to_string(),
            symbol: None,
            amount,
            balance_before: before,
            balance_after: balance.available,
            onchain_status: OnchainStatus::Success,
            txn_ref: None,
            proof: None,
            created_at: now,
        };
        self.state.append_settlement(entry.clone());
        if self.mirror.is_available() {
            self.mirror
                .persist_settlement(&entry)
                .await
                .map_err(|e| crate::error::CoreError::MirrorUnavailable(e.to_string()))?;
            self.mirror
                .persist_balance_durable(&balance)
                .await
                .map_err(|e| crate::error::CoreError::MirrorUnavailable(e.to_string()))?;
        }
        let _ = self.event_tx.send(VenueEvent::BalanceUpdate {
            trader: user.to_string(),
            available: balance.available,
            used_margin: balance.used_margin,
            frozen_margin: balance.frozen_margin,
            timestamp: now,
        });
        Ok(())
    }

    /// Bind the ledger id to the matching local pair, or upsert with the
    /// ledger's identity as authoritative.
    fn bind_or_upsert(
        &self,
        ledger_pair_id: u64,
        long: &str,
        short: &str,
        symbol: &str,
        size: i128,
        entry_price: i64,
    ) {
        if self.state.pair_by_ledger_id(ledger_pair_id).is_some() {
            return;
        }
        let local = self.state.pairs_of(long).into_iter().find(|p| {
            p.is_active()
                && p.ledger_pair_id.is_none()
                && p.symbol == symbol
                && p.long_trader == long
                && p.short_trader == short
        });
        match local {
            Some(pair) => {
                self.state.bind_ledger_pair(pair.id, ledger_pair_id);
                debug!(ledger_pair_id, local = %pair.id, "pair bound to ledger identity");
            }
            None => {
                self.upsert_ledger_pair(ledger_pair_id, long, short, symbol, size, entry_price);
            }
        }
    }

    fn upsert_ledger_pair(
        &self,
        ledger_pair_id: u64,
        long: &str,
        short: &str,
        symbol: &str,
        size: i128,
        entry_price: i64,
    ) {
        let now = Utc::now().timestamp_millis();
        // collateral is not part of the ledger view; seed at 1x until the
        // owning flow updates it
        let notional = notional_usd(size, entry_price);
        let pair = Pair {
            id: Uuid::new_v4(),
            ledger_pair_id: Some(ledger_pair_id),
            symbol: symbol.to_string(),
            long_trader: long.to_string(),
            short_trader: short.to_string(),
            size,
            entry_price,
            long_collateral: notional,
            short_collateral: notional,
            long_leverage_bp: implied_leverage_bp(notional, notional),
            short_leverage_bp: implied_leverage_bp(notional, notional),
            long_open_fee: 0,
            short_open_fee: 0,
            entry_funding_index_long: 0,
            entry_funding_index_short: 0,
            acc_funding_long: 0,
            acc_funding_short: 0,
            long_tp_sl: TpSl::default(),
            short_tp_sl: TpSl::default(),
            status: PairStatus::Active,
            open_time: now,
            updated_at: now,
        };
        info!(ledger_pair_id, symbol, "pair upserted from ledger");
        self.state.insert_pair(pair);
    }
}
