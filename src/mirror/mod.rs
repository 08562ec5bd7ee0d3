//! Durable Mirror
//!
//! Key-value mirror of venue state for crash survivability. Writes are
//! best-effort asynchronous except settlement-log and ledger-reconciled
//! writes, which must land before acknowledgement. When Redis is away the
//! venue keeps serving from memory and a backlog retries.

mod keys;
mod redis_client;

pub use keys::MirrorKey;
pub use redis_client::{RedisClient, RedisConfig};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::balance::Balance;
use crate::models::market::{MarketStats, SettlementLogEntry};
use crate::models::order::Order;
use crate::models::position::Pair;

const BACKLOG_CAP: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror unavailable: {0}")]
    Unavailable(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A deferred write: (index set, member key or empty, key, json value).
#[derive(Debug, Clone)]
struct PendingWrite {
    index: Option<(&'static str, String)>,
    key: String,
    value: String,
}

pub struct MirrorStore {
    redis: Option<Arc<RedisClient>>,
    backlog: Mutex<VecDeque<PendingWrite>>,
}

impl MirrorStore {
    /// Connect, degrading gracefully when Redis is unreachable.
    pub async fn connect(url: &str) -> Self {
        match RedisClient::from_url(url).await {
            Ok(client) => {
                info!("mirror connected at {}", url);
                Self {
                    redis: Some(Arc::new(client)),
                    backlog: Mutex::new(VecDeque::new()),
                }
            }
            Err(e) => {
                warn!("mirror unavailable ({}), serving from memory", e);
                Self {
                    redis: None,
                    backlog: Mutex::new(VecDeque::new()),
                }
            }
        }
    }

    /// A store with no backing Redis; every write goes to the backlog.
    pub fn disconnected() -> Self {
        Self {
            redis: None,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.redis.is_some()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Best-effort write; failures land in the retry backlog.
    async fn write_soft<T: Serialize>(
        &self,
        index: Option<(&'static str, String)>,
        key: String,
        value: &T,
    ) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "mirror value failed to serialize");
                return;
            }
        };
        if let Err(e) = self.write_raw(&index, &key, &json).await {
            warn!(key, error = %e, "mirror write failed, backlogged");
            self.push_backlog(PendingWrite { index, key, value: json });
        }
    }

    /// Durable write; the caller must not acknowledge until this returns Ok.
    async fn write_hard<T: Serialize>(
        &self,
        index: Option<(&'static str, String)>,
        key: String,
        value: &T,
    ) -> Result<(), MirrorError> {
        let json = serde_json::to_string(value)?;
        self.write_raw(&index, &key, &json)
            .await
            .map_err(|e| MirrorError::Unavailable(e.to_string()))
    }

    async fn write_raw(
        &self,
        index: &Option<(&'static str, String)>,
        key: &str,
        json: &str,
    ) -> Result<(), redis::RedisError> {
        let Some(redis) = &self.redis else {
            return Err(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "mirror disconnected",
            )));
        };
        redis.set(key, json).await?;
        if let Some((index_key, member)) = index {
            redis.sadd(index_key, member).await?;
        }
        Ok(())
    }

    fn push_backlog(&self, write: PendingWrite) {
        let mut backlog = self.backlog.lock();
        if backlog.len() >= BACKLOG_CAP {
            backlog.pop_front();
        }
        backlog.push_back(write);
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    /// Retry the deferred writes. Called on a timer by the runtime.
    pub async fn flush_backlog(&self) -> usize {
        let drained: Vec<PendingWrite> = {
            let mut backlog = self.backlog.lock();
            backlog.drain(..).collect()
        };
        if drained.is_empty() {
            return 0;
        }
        let mut flushed = 0;
        for write in drained {
            match self.write_raw(&write.index, &write.key, &write.value).await {
                Ok(()) => flushed += 1,
                Err(_) => self.push_backlog(write),
            }
        }
        if flushed > 0 {
            info!(flushed, "mirror backlog flushed");
        }
        flushed
    }

    // ------------------------------------------------------------------
    // Typed persistence
    // ------------------------------------------------------------------

    pub async fn persist_pair(&self, pair: &Pair) {
        self.write_soft(
            Some((MirrorKey::pairs_index(), pair.id.to_string())),
            MirrorKey::pair(&pair.id),
            pair,
        )
        .await;
    }

    pub async fn persist_order(&self, order: &Order) {
        self.write_soft(
            Some((MirrorKey::orders_index(), order.id.to_string())),
            MirrorKey::order(&order.id),
            order,
        )
        .await;
    }

    pub async fn persist_balance(&self, balance: &Balance) {
        self.write_soft(
            Some((MirrorKey::balances_index(), balance.trader.clone())),
            MirrorKey::balance(&balance.trader),
            balance,
        )
        .await;
    }

    pub async fn persist_market(&self, stats: &MarketStats) {
        self.write_soft(
            Some((MirrorKey::markets_index(), stats.symbol.clone())),
            MirrorKey::market(&stats.symbol),
            stats,
        )
        .await;
    }

    /// Settlement-log writes are durable before acknowledgement.
    pub async fn persist_settlement(&self, entry: &SettlementLogEntry) -> Result<(), MirrorError> {
        self.write_hard(
            Some((MirrorKey::settlements_index(), entry.id.to_string())),
            MirrorKey::settlement(&entry.id),
            entry,
        )
        .await
    }

    /// Durable balance write for ledger-reconciled transitions.
    pub async fn persist_balance_durable(&self, balance: &Balance) -> Result<(), MirrorError> {
        self.write_hard(
            Some((MirrorKey::balances_index(), balance.trader.clone())),
            MirrorKey::balance(&balance.trader),
            balance,
        )
        .await
    }

    /// Record a reconciled ledger event id (idempotence across restarts).
    pub async fn mark_event_reconciled(&self, event_id: &Uuid) -> Result<(), MirrorError> {
        self.write_hard(None, MirrorKey::reconciled_event(event_id), &true)
            .await
    }

    pub async fn is_event_reconciled(&self, event_id: &Uuid) -> bool {
        let Some(redis) = &self.redis else {
            return false;
        };
        matches!(
            redis.get(&MirrorKey::reconciled_event(event_id)).await,
            Ok(Some(_))
        )
    }

    // ========================================================================
    // Rehydration
    // ========================================================================

    async fn load_indexed<T: DeserializeOwned>(
        &self,
        index_key: &str,
        key_of: impl Fn(&str) -> String,
    ) -> Vec<T> {
        let Some(redis) = &self.redis else {
            return Vec::new();
        };
        let members = match redis.smembers(index_key).await {
            Ok(members) => members,
            Err(e) => {
                warn!(index_key, error = %e, "mirror index unreadable");
                return Vec::new();
            }
        };
        let mut values = Vec::with_capacity(members.len());
        for member in members {
            match redis.get(&key_of(&member)).await {
                Ok(Some(json)) => match serde_json::from_str(&json) {
                    Ok(value) => values.push(value),
                    Err(e) => warn!(member, error = %e, "mirror value corrupt, skipped"),
                },
                Ok(None) => {}
                Err(e) => warn!(member, error = %e, "mirror read failed, skipped"),
            }
        }
        values
    }

    pub async fn load_markets(&self) -> Vec<MarketStats> {
        self.load_indexed(MirrorKey::markets_index(), |s| MirrorKey::market(s))
            .await
    }

    pub async fn load_balances(&self) -> Vec<Balance> {
        self.load_indexed(MirrorKey::balances_index(), |s| MirrorKey::balance(s))
            .await
    }

    pub async fn load_pairs(&self) -> Vec<Pair> {
        self.load_indexed(MirrorKey::pairs_index(), |s| {
            MirrorKey::pair(&s.parse().unwrap_or(Uuid::nil()))
        })
        .await
    }

    pub async fn load_orders(&self) -> Vec<Order> {
        self.load_indexed(MirrorKey::orders_index(), |s| {
            MirrorKey::order(&s.parse().unwrap_or(Uuid::nil()))
        })
        .await
    }
}
