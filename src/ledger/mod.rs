//! Settlement-Ledger Collaborator
//!
//! The core talks to the on-chain settlement layer through this narrow RPC
//! surface and consumes its event stream. The production client lives with
//! the relayer; `InMemoryLedger` backs tests and local runs.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::units::{Amount, Bp, Price, Usd};
use crate::state::PendingMatch;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger rejected the call: {0}")]
    Rejected(String),

    #[error("ledger call timed out")]
    Timeout,
}

/// Events published by the settlement contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Deposited {
        user: String,
        amount: Usd,
    },
    DepositedFor {
        user: String,
        relayer: String,
        token: String,
        amount: Usd,
    },
    Withdrawn {
        user: String,
        amount: Usd,
    },
    PairOpened {
        pair_id: u64,
        long: String,
        short: String,
        symbol: String,
        size: Amount,
        entry_price: Price,
    },
    PairClosed {
        pair_id: u64,
        exit_price: Price,
        long_pnl: Usd,
        short_pnl: Usd,
    },
    Liquidated {
        pair_id: u64,
        liquidated_trader: String,
        liquidator: String,
        reward: Usd,
    },
}

/// Event plus the id reconciliation de-duplicates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEventEnvelope {
    pub event_id: Uuid,
    pub event: LedgerEvent,
}

/// RPC surface of the settlement contract.
pub trait LedgerClient: Send + Sync {
    fn update_price(&self, symbol: &str, price: Price)
        -> BoxFuture<'static, Result<(), LedgerError>>;

    fn update_funding_rate(
        &self,
        symbol: &str,
        rate_bp: Bp,
    ) -> BoxFuture<'static, Result<(), LedgerError>>;

    /// Submit a batch of matches. Must be idempotent on (trader, nonce):
    /// resubmitting an already-settled match never duplicates ledger state.
    fn settle_batch(
        &self,
        matches: Vec<PendingMatch>,
    ) -> BoxFuture<'static, Result<(), LedgerError>>;

    fn close_pair(
        &self,
        ledger_pair_id: u64,
        exit_price: Price,
    ) -> BoxFuture<'static, Result<(), LedgerError>>;

    fn liquidate(&self, ledger_pair_id: u64) -> BoxFuture<'static, Result<(), LedgerError>>;

    /// One-shot scan of ledger-active pairs, used to seed the position store
    /// at boot before ingress opens.
    fn list_active_pairs(&self) -> BoxFuture<'static, Result<Vec<LedgerPair>, LedgerError>>;

    fn subscribe_events(&self) -> broadcast::Receiver<LedgerEventEnvelope>;
}

/// Ledger-side view of an open pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPair {
    pub pair_id: u64,
    pub long: String,
    pub short: String,
    pub symbol: String,
    pub size: Amount,
    pub entry_price: Price,
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct InMemoryInner {
    next_pair_id: u64,
    /// (trader, nonce) pairs the ledger has settled; the de-duplicator.
    settled_nonces: HashSet<(String, u64)>,
    open_pairs: Vec<LedgerPair>,
    /// When set, the next N calls fail; exercises the retry path.
    fail_calls: u32,
    pub settle_calls: u32,
}

/// Deterministic stand-in for the settlement contract.
pub struct InMemoryLedger {
    inner: Mutex<InMemoryInner>,
    event_tx: broadcast::Sender<LedgerEventEnvelope>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        let (event_tx, _) = broadcast::channel(4_096);
        Self {
            inner: Mutex::new(InMemoryInner::default()),
            event_tx,
        }
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` RPC calls fail.
    pub fn fail_next(&self, n: u32) {
        self.inner.lock().fail_calls = n;
    }

    pub fn settle_calls(&self) -> u32 {
        self.inner.lock().settle_calls
    }

    /// Push an external event (deposit/withdraw) as the chain would.
    pub fn emit(&self, event: LedgerEvent) -> Uuid {
        let event_id = Uuid::new_v4();
        let _ = self.event_tx.send(LedgerEventEnvelope { event_id, event });
        event_id
    }

    fn check_fail(inner: &mut InMemoryInner) -> Result<(), LedgerError> {
        if inner.fail_calls > 0 {
            inner.fail_calls -= 1;
            return Err(LedgerError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl LedgerClient for InMemoryLedger {
    fn update_price(
        &self,
        _symbol: &str,
        _price: Price,
    ) -> BoxFuture<'static, Result<(), LedgerError>> {
        let result = Self::check_fail(&mut self.inner.lock());
        Box::pin(async move { result })
    }

    fn update_funding_rate(
        &self,
        _symbol: &str,
        _rate_bp: Bp,
    ) -> BoxFuture<'static, Result<(), LedgerError>> {
        let result = Self::check_fail(&mut self.inner.lock());
        Box::pin(async move { result })
    }

    fn settle_batch(
        &self,
        matches: Vec<PendingMatch>,
    ) -> BoxFuture<'static, Result<(), LedgerError>> {
        let result = {
            let mut inner = self.inner.lock();
            inner.settle_calls += 1;
            match Self::check_fail(&mut inner) {
                Err(e) => Err(e),
                Ok(()) => {
                    for m in &matches {
                        let long_key = (m.long_trader.clone(), m.long_nonce);
                        let short_key = (m.short_trader.clone(), m.short_nonce);
                        // idempotent on (trader, nonce)
                        if inner.settled_nonces.contains(&long_key)
                            && inner.settled_nonces.contains(&short_key)
                        {
                            continue;
                        }
                        inner.settled_nonces.insert(long_key);
                        inner.settled_nonces.insert(short_key);
                        inner.next_pair_id += 1;
                        let pair_id = inner.next_pair_id;
                        inner.open_pairs.push(LedgerPair {
                            pair_id,
                            long: m.long_trader.clone(),
                            short: m.short_trader.clone(),
                            symbol: m.symbol.clone(),
                            size: m.size,
                            entry_price: m.price,
                        });
                        let event = LedgerEvent::PairOpened {
                            pair_id: inner.next_pair_id,
                            long: m.long_trader.clone(),
                            short: m.short_trader.clone(),
                            symbol: m.symbol.clone(),
                            size: m.size,
                            entry_price: m.price,
                        };
                        let _ = self.event_tx.send(LedgerEventEnvelope {
                            event_id: Uuid::new_v4(),
                            event,
                        });
                    }
                    Ok(())
                }
            }
        };
        Box::pin(async move { result })
    }

    fn list_active_pairs(&self) -> BoxFuture<'static, Result<Vec<LedgerPair>, LedgerError>> {
        let result = {
            let mut inner = self.inner.lock();
            Self::check_fail(&mut inner).map(|_| inner.open_pairs.clone())
        };
        Box::pin(async move { result })
    }

    fn close_pair(
        &self,
        ledger_pair_id: u64,
        exit_price: Price,
    ) -> BoxFuture<'static, Result<(), LedgerError>> {
        let result = {
            let mut inner = self.inner.lock();
            let r = Self::check_fail(&mut inner);
            if r.is_ok() {
                inner.open_pairs.retain(|p| p.pair_id != ledger_pair_id);
            }
            r
        };
        if result.is_ok() {
            let _ = self.event_tx.send(LedgerEventEnvelope {
                event_id: Uuid::new_v4(),
                event: LedgerEvent::PairClosed {
                    pair_id: ledger_pair_id,
                    exit_price,
                    long_pnl: 0,
                    short_pnl: 0,
                },
            });
        }
        Box::pin(async move { result })
    }

    fn liquidate(&self, ledger_pair_id: u64) -> BoxFuture<'static, Result<(), LedgerError>> {
        let result = Self::check_fail(&mut self.inner.lock());
        if result.is_ok() {
            let _ = self.event_tx.send(LedgerEventEnvelope {
                event_id: Uuid::new_v4(),
                event: LedgerEvent::Liquidated {
                    pair_id: ledger_pair_id,
                    liquidated_trader: String::new(),
                    liquidator: String::new(),
                    reward: 0,
                },
            });
        }
        Box::pin(async move { result })
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LedgerEventEnvelope> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(trader_suffix: u64) -> PendingMatch {
        PendingMatch {
            match_id: Uuid::new_v4(),
            pair_id: Uuid::nil(),
            symbol: "MEMEUSD".to_string(),
            long_trader: format!("long-{}", trader_suffix),
            short_trader: format!("short-{}", trader_suffix),
            long_nonce: trader_suffix,
            short_nonce: trader_suffix,
            price: 1_000_000_000_000,
            size: 1_000_000_000_000_000_000,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_settle_batch_emits_pair_opened() {
        let ledger = InMemoryLedger::new();
        let mut rx = ledger.subscribe_events();

        ledger.settle_batch(vec![pending(1)]).await.unwrap();
        let envelope = rx.try_recv().unwrap();
        assert!(matches!(
            envelope.event,
            LedgerEvent::PairOpened { pair_id: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_settle_batch_idempotent_on_nonce() {
        let ledger = InMemoryLedger::new();
        let mut rx = ledger.subscribe_events();

        let m = pending(1);
        ledger.settle_batch(vec![m.clone()]).await.unwrap();
        ledger.settle_batch(vec![m]).await.unwrap();

        assert!(rx.try_recv().is_ok());
        // the resubmission created no second pair
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next(1);
        assert!(ledger.settle_batch(vec![pending(1)]).await.is_err());
        assert!(ledger.settle_batch(vec![pending(1)]).await.is_ok());
        assert_eq!(ledger.settle_calls(), 2);
    }
}
