//! Streaming Fan-out Hub
//!
//! Pull-from-server streams: a subscriber names a channel, receives an
//! immediate snapshot, then deltas in commit order. Buffers are bounded per
//! subscriber; a subscriber that cannot keep up is dropped. Risk pushes are
//! throttled per subscriber.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::channels::{Channel, GlobalRiskSnapshot, TraderRiskSnapshot, VenueEvent};
use crate::services::matching::{DepthSnapshot, MatchingEngine, TradeEvent};
use crate::state::VenueState;

const SUBSCRIBER_BUFFER: usize = 256;

/// Everything a subscriber can receive.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum StreamMessage {
    Depth(DepthSnapshot),
    Trade(TradeEvent),
    TraderRisk(TraderRiskSnapshot),
    GlobalRisk(GlobalRiskSnapshot),
    Event(VenueEvent),
}

struct SubscriberHandle {
    id: u64,
    tx: mpsc::Sender<StreamMessage>,
    last_risk_push_ms: AtomicI64,
}

pub struct Subscription {
    pub channel: Channel,
    /// Immediate state snapshot, when the channel has one.
    pub snapshot: Option<StreamMessage>,
    pub receiver: mpsc::Receiver<StreamMessage>,
}

pub struct StreamHub {
    state: Arc<VenueState>,
    engine: Arc<MatchingEngine>,
    subscribers: DashMap<Channel, Vec<SubscriberHandle>>,
    next_id: AtomicU64,
    risk_min_interval_ms: i64,
}

impl StreamHub {
    pub fn new(
        state: Arc<VenueState>,
        engine: Arc<MatchingEngine>,
        risk_min_interval_ms: u64,
    ) -> Self {
        Self {
            state,
            engine,
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            risk_min_interval_ms: risk_min_interval_ms as i64,
        }
    }

    // ========================================================================
    // Subscribe
    // ========================================================================

    pub fn subscribe(&self, channel: Channel) -> Subscription {
        let (tx, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(channel.clone())
            .or_default()
            .push(SubscriberHandle {
                id,
                tx,
                last_risk_push_ms: AtomicI64::new(0),
            });
        let snapshot = self.snapshot_for(&channel);
        debug!(channel = %channel.name(), subscriber = id, "stream subscription opened");
        Subscription {
            channel,
            snapshot,
            receiver,
        }
    }

    fn snapshot_for(&self, channel: &Channel) -> Option<StreamMessage> {
        match channel {
            Channel::Orderbook(symbol) => self
                .engine
                .get_depth(symbol, 20)
                .ok()
                .map(StreamMessage::Depth),
            Channel::Trades(symbol) => self
                .engine
                .get_trades(symbol, 1)
                .into_iter()
                .next()
                .map(StreamMessage::Trade),
            Channel::TraderRisk(trader) => Some(StreamMessage::TraderRisk(TraderRiskSnapshot {
                trader: trader.clone(),
                positions: self.state.risk_of_trader(trader),
                timestamp: Utc::now().timestamp_millis(),
            })),
            Channel::GlobalRisk | Channel::Events => None,
        }
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.subscribers
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Push a delta to every subscriber of a channel, in commit order.
    /// Subscribers whose buffers are full are dropped rather than allowed to
    /// stall the publisher.
    pub fn publish(&self, channel: &Channel, message: StreamMessage) {
        let Some(mut subs) = self.subscribers.get_mut(channel) else {
            return;
        };
        let throttle = matches!(
            channel,
            Channel::TraderRisk(_) | Channel::GlobalRisk
        );
        let now = Utc::now().timestamp_millis();

        subs.retain(|sub| {
            if throttle {
                let last = sub.last_risk_push_ms.load(Ordering::Relaxed);
                if now - last < self.risk_min_interval_ms {
                    return true; // throttled, keep subscriber
                }
            }
            match sub.tx.try_send(message.clone()) {
                Ok(()) => {
                    if throttle {
                        sub.last_risk_push_ms.store(now, Ordering::Relaxed);
                    }
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    info!(
                        channel = %channel.name(),
                        subscriber = sub.id,
                        "slow stream subscriber dropped"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAllVerifier;
    use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE, USD_SCALE};
    use crate::services::matching::EngineConfig;

    fn setup() -> (Arc<VenueState>, Arc<MatchingEngine>, StreamHub) {
        let state = Arc::new(VenueState::new(
            &["MEMEUSD".to_string()],
            USD_SCALE,
            1_000,
        ));
        state.with_market_mut("MEMEUSD", |m| m.record_trade(PRICE_SCALE, 0, 0));
        let engine = Arc::new(MatchingEngine::new(
            state.clone(),
            Arc::new(AllowAllVerifier),
            EngineConfig {
                taker_fee_bp: 5,
                maker_fee_bp: 2,
                min_order_size: AMOUNT_SCALE / 100,
                max_leverage_bp: 1_000_000,
            },
        ));
        let hub = StreamHub::new(state.clone(), engine.clone(), 0);
        (state, engine, hub)
    }

    #[tokio::test]
    async fn test_subscribe_gets_snapshot_then_deltas() {
        let (_state, engine, hub) = setup();

        let mut sub = hub.subscribe(Channel::Orderbook("MEMEUSD".to_string()));
        assert!(matches!(sub.snapshot, Some(StreamMessage::Depth(_))));

        let depth = engine.get_depth("MEMEUSD", 5).unwrap();
        hub.publish(
            &Channel::Orderbook("MEMEUSD".to_string()),
            StreamMessage::Depth(depth),
        );
        assert!(matches!(
            sub.receiver.try_recv(),
            Ok(StreamMessage::Depth(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped() {
        let (_state, engine, hub) = setup();
        let channel = Channel::Trades("MEMEUSD".to_string());
        let sub = hub.subscribe(channel.clone());
        assert_eq!(hub.subscriber_count(&channel), 1);

        // never drained: overflow the bounded buffer
        let _ = engine;
        let trade = TradeEvent {
            id: uuid::Uuid::new_v4(),
            symbol: "MEMEUSD".to_string(),
            price: PRICE_SCALE,
            size: AMOUNT_SCALE,
            side: crate::models::order::Side::Long,
            long_trader: "a".to_string(),
            short_trader: "b".to_string(),
            timestamp: 0,
        };
        for _ in 0..(SUBSCRIBER_BUFFER + 1) {
            hub.publish(&channel, StreamMessage::Trade(trade.clone()));
        }
        assert_eq!(hub.subscriber_count(&channel), 0);
        drop(sub);
    }

    #[tokio::test]
    async fn test_risk_throttling() {
        let (state, engine, _) = setup();
        let hub = StreamHub::new(state, engine, 10_000);
        let channel = Channel::GlobalRisk;
        let mut sub = hub.subscribe(channel.clone());

        let snapshot = GlobalRiskSnapshot {
            insurance_total: 0,
            insurance_by_symbol: Vec::new(),
            liquidation_queue_len: 0,
            liquidation_queue_head: Vec::new(),
            funding: Vec::new(),
            timestamp: 0,
        };
        hub.publish(&channel, StreamMessage::GlobalRisk(snapshot.clone()));
        hub.publish(&channel, StreamMessage::GlobalRisk(snapshot));

        // first push lands, second is throttled
        assert!(sub.receiver.try_recv().is_ok());
        assert!(sub.receiver.try_recv().is_err());
        assert_eq!(hub.subscriber_count(&channel), 1);
    }

    #[tokio::test]
    async fn test_trader_risk_snapshot_on_subscribe() {
        let (_state, _engine, hub) = setup();
        let sub = hub.subscribe(Channel::TraderRisk("0xabc".to_string()));
        match sub.snapshot {
            Some(StreamMessage::TraderRisk(snapshot)) => {
                assert_eq!(snapshot.trader, "0xabc");
                assert!(snapshot.positions.is_empty());
            }
            other => panic!("unexpected snapshot: {:?}", other.is_some()),
        }
    }
}
