//! Trigger Orders Service
//!
//! Conditional orders (stop-loss, take-profit, trailing stop) never rest on
//! the book. They live in per-symbol price-indexed sets and convert into
//! market orders when the mark crosses their trigger. Funds are checked and
//! locked at fire time, when the market order enters the engine.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::SignatureVerifier;
use crate::error::{CoreError, RejectReason};
use crate::models::order::{Order, OrderIntent, OrderStatus, OrderType, Side};
use crate::models::units::Price;
use crate::state::VenueState;

#[derive(Default)]
struct TriggerSets {
    /// Fire when mark >= price.
    above: BTreeMap<Price, BTreeSet<Uuid>>,
    /// Fire when mark <= price.
    below: BTreeMap<Price, BTreeSet<Uuid>>,
    /// Trailing distance per trailing-stop order.
    trailing: HashMap<Uuid, Price>,
    last_mark: Option<Price>,
}

/// Which set an order arms, given its side and type.
fn arms_above(side: Side, order_type: OrderType) -> bool {
    match (side, order_type) {
        (Side::Long, OrderType::StopLoss) => true,
        (Side::Long, OrderType::TakeProfit) => false,
        (Side::Long, OrderType::TrailingStop) => true,
        (Side::Short, OrderType::StopLoss) => false,
        (Side::Short, OrderType::TakeProfit) => true,
        (Side::Short, OrderType::TrailingStop) => false,
        _ => unreachable!("only conditional types are registered"),
    }
}

pub struct TriggerOrdersService {
    state: Arc<VenueState>,
    verifier: Arc<dyn SignatureVerifier>,
    orders: DashMap<Uuid, Order>,
    sets: DashMap<String, Mutex<TriggerSets>>,
}

impl TriggerOrdersService {
    pub fn new(state: Arc<VenueState>, verifier: Arc<dyn SignatureVerifier>) -> Self {
        let sets = DashMap::new();
        for symbol in state.symbols() {
            sets.insert(symbol, Mutex::new(TriggerSets::default()));
        }
        Self {
            state,
            verifier,
            orders: DashMap::new(),
            sets,
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Validate and arm a conditional intent.
    pub fn register(&self, intent: OrderIntent) -> Result<Order, CoreError> {
        if !intent.order_type.is_conditional() {
            return Err(CoreError::Invariant(
                "non-conditional order routed to the trigger service".to_string(),
            ));
        }
        let trigger = intent
            .trigger_price
            .filter(|p| *p > 0)
            .ok_or(CoreError::Rejected(RejectReason::TpslInvalid))?;
        let sets = self
            .sets
            .get(&intent.symbol)
            .ok_or(CoreError::Rejected(RejectReason::SymbolUnknown))?;
        if intent.deadline <= Utc::now().timestamp() {
            return Err(CoreError::Rejected(RejectReason::Expired));
        }
        self.verifier
            .verify_order(&intent)
            .map_err(|_| CoreError::Rejected(RejectReason::BadSignature))?;
        self.state.check_nonce(&intent.trader, intent.nonce)?;
        self.state.commit_nonce(&intent.trader, intent.nonce);

        let order = intent.into_order(Uuid::new_v4());
        let mut guard = sets.lock();
        if order.order_type == OrderType::TrailingStop {
            let mark = guard.last_mark.or_else(|| self.state.mark_price(&order.symbol));
            let distance = mark.map(|m| (trigger - m).abs()).unwrap_or(0);
            guard.trailing.insert(order.id, distance);
        }
        let set = if arms_above(order.side, order.order_type) {
            &mut guard.above
        } else {
            &mut guard.below
        };
        set.entry(trigger).or_default().insert(order.id);
        drop(guard);

        self.orders.insert(order.id, order.clone());
        debug!(order_id = %order.id, trigger, "conditional order armed");
        Ok(order)
    }

    /// Disarm a conditional order.
    pub fn cancel(&self, order_id: Uuid, trader: &str) -> Result<Order, CoreError> {
        let mut order = self
            .orders
            .get(&order_id)
            .map(|e| e.clone())
            .ok_or(CoreError::OrderNotFound(order_id))?;
        if order.trader != trader {
            return Err(CoreError::NotOwner(order_id));
        }
        if order.status != OrderStatus::Pending {
            return Err(CoreError::NotCancelable(order_id));
        }

        self.disarm(&order);
        order.status = OrderStatus::Canceled;
        order.updated_at = Utc::now().timestamp_millis();
        self.orders.insert(order_id, order.clone());
        Ok(order)
    }

    fn disarm(&self, order: &Order) {
        if let Some(sets) = self.sets.get(&order.symbol) {
            let mut guard = sets.lock();
            let Some(trigger) = order.trigger_price else {
                return;
            };
            let set = if arms_above(order.side, order.order_type) {
                &mut guard.above
            } else {
                &mut guard.below
            };
            if let Some(ids) = set.get_mut(&trigger) {
                ids.remove(&order.id);
                if ids.is_empty() {
                    set.remove(&trigger);
                }
            }
            guard.trailing.remove(&order.id);
        }
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Range-scan for newly triggerable orders at the new mark, ratcheting
    /// trailing stops first. Fired orders come back transformed into market
    /// orders, ready for `submit_prevalidated`.
    pub fn evaluate(&self, symbol: &str, new_mark: Price) -> Vec<Order> {
        let Some(sets) = self.sets.get(symbol) else {
            return Vec::new();
        };
        let mut guard = sets.lock();
        guard.last_mark = Some(new_mark);

        self.ratchet_trailing(&mut guard, new_mark);

        let mut fired_ids: Vec<Uuid> = Vec::new();
        // above-set: everything with trigger <= mark fires
        let crossed: Vec<Price> = guard
            .above
            .range(..=new_mark)
            .map(|(p, _)| *p)
            .collect();
        for price in crossed {
            if let Some(ids) = guard.above.remove(&price) {
                fired_ids.extend(ids);
            }
        }
        // below-set: everything with trigger >= mark fires
        let crossed: Vec<Price> = guard
            .below
            .range(new_mark..)
            .map(|(p, _)| *p)
            .collect();
        for price in crossed {
            if let Some(ids) = guard.below.remove(&price) {
                fired_ids.extend(ids);
            }
        }
        for id in &fired_ids {
            guard.trailing.remove(id);
        }
        drop(guard);

        let now = Utc::now().timestamp_millis();
        let mut fired = Vec::with_capacity(fired_ids.len());
        for id in fired_ids {
            if let Some(mut order) = self.orders.get_mut(&id) {
                order.status = OrderStatus::Triggered;
                order.updated_at = now;
                let mut market = order.clone();
                market.order_type = OrderType::Market;
                market.price = None;
                info!(order_id = %id, symbol, mark = new_mark, "conditional order fired");
                fired.push(market);
            }
        }
        fired
    }

    /// Trailing stops follow favorable mark moves at their armed distance.
    fn ratchet_trailing(&self, guard: &mut TriggerSets, mark: Price) {
        let updates: Vec<(Uuid, Price, Price)> = guard
            .trailing
            .iter()
            .filter_map(|(id, distance)| {
                let order = self.orders.get(id)?;
                let current = order.trigger_price?;
                let ratcheted = match order.side {
                    // long trailing stop chases the mark down
                    Side::Long => current.min(mark + distance),
                    // short trailing stop chases the mark up
                    Side::Short => current.max(mark - distance),
                };
                (ratcheted != current).then_some((*id, current, ratcheted))
            })
            .collect();

        for (id, old_trigger, new_trigger) in updates {
            let Some(mut order) = self.orders.get_mut(&id) else {
                continue;
            };
            let above = arms_above(order.side, order.order_type);
            let set = if above { &mut guard.above } else { &mut guard.below };
            if let Some(ids) = set.get_mut(&old_trigger) {
                ids.remove(&id);
                if ids.is_empty() {
                    set.remove(&old_trigger);
                }
            }
            set.entry(new_trigger).or_default().insert(id);
            order.trigger_price = Some(new_trigger);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_order(&self, order_id: Uuid) -> Option<Order> {
        self.orders.get(&order_id).map(|e| e.clone())
    }

    pub fn user_orders(&self, trader: &str) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|o| o.trader == trader)
            .map(|o| o.clone())
            .collect()
    }

    pub fn armed_count(&self, symbol: &str) -> usize {
        self.sets
            .get(symbol)
            .map(|s| {
                let guard = s.lock();
                guard.above.values().map(|v| v.len()).sum::<usize>()
                    + guard.below.values().map(|v| v.len()).sum::<usize>()
            })
            .unwrap_or(0)
    }
}
