//! Orderbook Implementation
//!
//! One book per symbol, long and short sides. Resting market orders sort
//! before any limit maker on their side; limit makers follow strict
//! price/time priority. All mutation happens under the book's single lock,
//! which the engine holds for the duration of submit/cancel.

use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use super::types::{OrderEntry, PriceLevel};
use crate::models::order::Side;
use crate::models::units::{Amount, Price};

/// One maker fill produced by a matching walk.
#[derive(Debug, Clone)]
pub struct MakerFill {
    pub maker_id: Uuid,
    pub maker_trader: String,
    /// Maker's resting price; the reference mark for resting market makers.
    pub price: Price,
    pub size: Amount,
    /// True when this fill fully consumed the maker.
    pub maker_done: bool,
}

pub struct Orderbook {
    pub symbol: String,
    inner: Mutex<BookInner>,
}

impl Orderbook {
    pub fn new(symbol: String) -> Self {
        Self {
            symbol,
            inner: Mutex::new(BookInner::default()),
        }
    }

    /// Exclusive access for the engine's critical section.
    pub fn lock(&self) -> MutexGuard<'_, BookInner> {
        self.inner.lock()
    }
}

#[derive(Default)]
pub struct BookInner {
    /// Resting market orders, time priority.
    long_market: VecDeque<OrderEntry>,
    short_market: VecDeque<OrderEntry>,
    long_limits: BTreeMap<PriceLevel, VecDeque<OrderEntry>>,
    short_limits: BTreeMap<PriceLevel, VecDeque<OrderEntry>>,
    /// order id -> (side, level); `None` level means the market queue.
    index: HashMap<Uuid, (Side, Option<PriceLevel>)>,
}

impl BookInner {
    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, order_id: &Uuid) -> bool {
        self.index.contains_key(order_id)
    }

    /// Rest an order on its side of the book.
    pub fn add(&mut self, side: Side, entry: OrderEntry) {
        let level = entry.price.map(PriceLevel::new);
        self.index.insert(entry.id, (side, level));
        match (side, level) {
            (Side::Long, None) => self.long_market.push_back(entry),
            (Side::Short, None) => self.short_market.push_back(entry),
            (Side::Long, Some(level)) => {
                self.long_limits.entry(level).or_default().push_back(entry)
            }
            (Side::Short, Some(level)) => {
                self.short_limits.entry(level).or_default().push_back(entry)
            }
        }
    }

    /// Remove an order wherever it rests.
    pub fn remove(&mut self, order_id: Uuid) -> Option<OrderEntry> {
        let (side, level) = self.index.remove(&order_id)?;
        let queue = match (side, level) {
            (Side::Long, None) => &mut self.long_market,
            (Side::Short, None) => &mut self.short_market,
            (Side::Long, Some(level)) => self.long_limits.get_mut(&level)?,
            (Side::Short, Some(level)) => self.short_limits.get_mut(&level)?,
        };
        let pos = queue.iter().position(|o| o.id == order_id)?;
        let entry = queue.remove(pos);
        if queue.is_empty() {
            if let Some(level) = level {
                match side {
                    Side::Long => self.long_limits.remove(&level),
                    Side::Short => self.short_limits.remove(&level),
                };
            }
        }
        entry
    }

    pub fn best_price(&self, side: Side) -> Option<Price> {
        match side {
            Side::Long => self.long_limits.keys().next_back().map(|l| l.price()),
            Side::Short => self.short_limits.keys().next().map(|l| l.price()),
        }
    }

    fn has_market_makers(&self, side: Side) -> bool {
        match side {
            Side::Long => !self.long_market.is_empty(),
            Side::Short => !self.short_market.is_empty(),
        }
    }

    /// Would a taker at `limit_price` (`None` = market) cross the opposing
    /// side right now? Used for post-only admission.
    pub fn would_cross(&self, taker_side: Side, limit_price: Option<Price>) -> bool {
        let maker_side = taker_side.opposite();
        if self.has_market_makers(maker_side) {
            return true;
        }
        let Some(best) = self.best_price(maker_side) else {
            return false;
        };
        match limit_price {
            None => true,
            Some(limit) => match taker_side {
                Side::Long => limit >= best,
                Side::Short => limit <= best,
            },
        }
    }

    /// Total size fillable for a taker without mutating the book. FOK
    /// admission runs this exact walk first; only an affirmative answer is
    /// allowed to mutate.
    pub fn fillable_size(&self, taker_side: Side, limit_price: Option<Price>, want: Amount) -> Amount {
        let mut fillable: Amount = 0;
        self.walk_makers(taker_side, limit_price, |entry| {
            fillable += entry.remaining;
            fillable < want
        });
        fillable.min(want)
    }

    /// Execute a matching walk, consuming maker size up to `amount`.
    /// `mark_price` prices fills against resting market makers.
    pub fn match_take(
        &mut self,
        taker_side: Side,
        limit_price: Option<Price>,
        mut amount: Amount,
        mark_price: Price,
    ) -> Vec<MakerFill> {
        let mut fills = Vec::new();
        let maker_side = taker_side.opposite();

        // Market makers first: they sort before any limit maker.
        let market_queue = match maker_side {
            Side::Long => &mut self.long_market,
            Side::Short => &mut self.short_market,
        };
        while amount > 0 {
            let Some(maker) = market_queue.front_mut() else {
                break;
            };
            let size = amount.min(maker.remaining);
            maker.remaining -= size;
            amount -= size;
            let maker_done = maker.remaining == 0;
            fills.push(MakerFill {
                maker_id: maker.id,
                maker_trader: maker.trader.clone(),
                price: mark_price,
                size,
                maker_done,
            });
            if maker_done {
                let id = maker.id;
                market_queue.pop_front();
                self.index.remove(&id);
            }
        }

        // Then limit levels in price priority.
        let levels: Vec<PriceLevel> = match maker_side {
            Side::Short => self.short_limits.keys().cloned().collect(),
            Side::Long => self.long_limits.keys().rev().cloned().collect(),
        };

        for level in levels {
            if amount == 0 {
                break;
            }
            if !crosses(taker_side, limit_price, level.price()) {
                break;
            }
            let limits = match maker_side {
                Side::Long => &mut self.long_limits,
                Side::Short => &mut self.short_limits,
            };
            let Some(queue) = limits.get_mut(&level) else {
                continue;
            };
            while amount > 0 {
                let Some(maker) = queue.front_mut() else {
                    break;
                };
                let size = amount.min(maker.remaining);
                maker.remaining -= size;
                amount -= size;
                let maker_done = maker.remaining == 0;
                fills.push(MakerFill {
                    maker_id: maker.id,
                    maker_trader: maker.trader.clone(),
                    price: level.price(),
                    size,
                    maker_done,
                });
                if maker_done {
                    let id = maker.id;
                    queue.pop_front();
                    self.index.remove(&id);
                }
            }
            if queue.is_empty() {
                limits.remove(&level);
            }
        }

        fills
    }

    /// Price/time-priority traversal of the maker side. The visitor returns
    /// `false` to stop early. Market makers are visited first.
    fn walk_makers(
        &self,
        taker_side: Side,
        limit_price: Option<Price>,
        mut visit: impl FnMut(&OrderEntry) -> bool,
    ) {
        let maker_side = taker_side.opposite();
        let market_queue = match maker_side {
            Side::Long => &self.long_market,
            Side::Short => &self.short_market,
        };
        for entry in market_queue {
            if !visit(entry) {
                return;
            }
        }

        let visit_level = |level: &PriceLevel,
                           queue: &VecDeque<OrderEntry>,
                           visit: &mut dyn FnMut(&OrderEntry) -> bool|
         -> bool {
            if !crosses(taker_side, limit_price, level.price()) {
                return false;
            }
            for entry in queue {
                if !visit(entry) {
                    return false;
                }
            }
            true
        };

        match maker_side {
            Side::Short => {
                for (level, queue) in self.short_limits.iter() {
                    if !visit_level(level, queue, &mut visit) {
                        return;
                    }
                }
            }
            Side::Long => {
                for (level, queue) in self.long_limits.iter().rev() {
                    if !visit_level(level, queue, &mut visit) {
                        return;
                    }
                }
            }
        }
    }

    /// Aggregated (price, size) levels, best first. Resting market orders
    /// carry no price and are not part of the depth view.
    pub fn depth(&self, side: Side, levels: usize) -> Vec<(Price, Amount)> {
        let aggregate = |queue: &VecDeque<OrderEntry>| -> Amount {
            queue.iter().map(|o| o.remaining).sum()
        };
        match side {
            Side::Long => self
                .long_limits
                .iter()
                .rev()
                .take(levels)
                .map(|(level, queue)| (level.price(), aggregate(queue)))
                .collect(),
            Side::Short => self
                .short_limits
                .iter()
                .take(levels)
                .map(|(level, queue)| (level.price(), aggregate(queue)))
                .collect(),
        }
    }

    /// Total resting size on a side, market orders included.
    pub fn side_size(&self, side: Side) -> Amount {
        let (market_queue, limits) = match side {
            Side::Long => (&self.long_market, &self.long_limits),
            Side::Short => (&self.short_market, &self.short_limits),
        };
        let market: Amount = market_queue.iter().map(|o| o.remaining).sum();
        let limit: Amount = limits.values().flatten().map(|o| o.remaining).sum();
        market + limit
    }
}

/// Cross condition: taker is market, or prices overlap long >= short.
fn crosses(taker_side: Side, taker_limit: Option<Price>, maker_price: Price) -> bool {
    match taker_limit {
        None => true,
        Some(limit) => match taker_side {
            Side::Long => limit >= maker_price,
            Side::Short => limit <= maker_price,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE};

    fn entry(id: Uuid, trader: &str, price: Option<Price>, remaining: Amount, t: i64) -> OrderEntry {
        OrderEntry {
            id,
            trader: trader.to_string(),
            price,
            remaining,
            created_at: t,
        }
    }

    fn price(cents: i64) -> Price {
        PRICE_SCALE * cents / 100
    }

    #[test]
    fn test_price_time_priority() {
        // Longs rest at 0.90, 0.95, 0.92; a short taker at 0.90 must hit the
        // best long (0.95) first.
        let book = Orderbook::new("X".into());
        let mut inner = book.lock();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        inner.add(Side::Long, entry(a, "A", Some(price(90)), AMOUNT_SCALE, 1));
        inner.add(Side::Long, entry(b, "B", Some(price(95)), AMOUNT_SCALE, 2));
        inner.add(Side::Long, entry(c, "C", Some(price(92)), AMOUNT_SCALE, 3));

        let fills = inner.match_take(Side::Short, Some(price(90)), AMOUNT_SCALE, price(100));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].maker_id, b);
        assert_eq!(fills[0].price, price(95));
        assert_eq!(fills[0].size, AMOUNT_SCALE);
        assert!(fills[0].maker_done);

        // A and C remain, aggregate long size 2e18
        assert_eq!(inner.side_size(Side::Long), 2 * AMOUNT_SCALE);
        assert!(!inner.contains(&b));
    }

    #[test]
    fn test_time_priority_within_level() {
        let book = Orderbook::new("X".into());
        let mut inner = book.lock();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        inner.add(Side::Short, entry(first, "A", Some(price(100)), AMOUNT_SCALE, 1));
        inner.add(Side::Short, entry(second, "B", Some(price(100)), AMOUNT_SCALE, 2));

        let fills = inner.match_take(Side::Long, Some(price(100)), AMOUNT_SCALE, price(100));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].maker_id, first);
    }

    #[test]
    fn test_partial_fill_leaves_residual() {
        let book = Orderbook::new("X".into());
        let mut inner = book.lock();

        let maker = Uuid::new_v4();
        inner.add(Side::Long, entry(maker, "A", Some(price(100)), 3 * AMOUNT_SCALE, 1));

        let fills = inner.match_take(Side::Short, Some(price(100)), AMOUNT_SCALE, price(100));
        assert_eq!(fills.len(), 1);
        assert!(!fills[0].maker_done);
        assert_eq!(inner.side_size(Side::Long), 2 * AMOUNT_SCALE);
        assert!(inner.contains(&maker));
    }

    #[test]
    fn test_market_makers_fill_first_at_mark() {
        let book = Orderbook::new("X".into());
        let mut inner = book.lock();

        let market_maker = Uuid::new_v4();
        let limit_maker = Uuid::new_v4();
        inner.add(Side::Short, entry(market_maker, "M", None, AMOUNT_SCALE, 5));
        inner.add(Side::Short, entry(limit_maker, "L", Some(price(90)), AMOUNT_SCALE, 1));

        let fills = inner.match_take(Side::Long, Some(price(95)), 2 * AMOUNT_SCALE, price(97));
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].maker_id, market_maker);
        assert_eq!(fills[0].price, price(97)); // reference mark
        assert_eq!(fills[1].maker_id, limit_maker);
        assert_eq!(fills[1].price, price(90)); // maker's price
    }

    #[test]
    fn test_no_cross_no_fill() {
        let book = Orderbook::new("X".into());
        let mut inner = book.lock();

        inner.add(Side::Short, entry(Uuid::new_v4(), "A", Some(price(102)), AMOUNT_SCALE, 1));

        let fills = inner.match_take(Side::Long, Some(price(100)), AMOUNT_SCALE, price(100));
        assert!(fills.is_empty());
        assert_eq!(inner.side_size(Side::Short), AMOUNT_SCALE);
    }

    #[test]
    fn test_fillable_size_simulation_does_not_mutate() {
        let book = Orderbook::new("X".into());
        let mut inner = book.lock();

        inner.add(Side::Short, entry(Uuid::new_v4(), "A", Some(price(100)), AMOUNT_SCALE, 1));
        inner.add(Side::Short, entry(Uuid::new_v4(), "B", Some(price(102)), AMOUNT_SCALE, 2));

        // FOK long 2e18 @ 1.00: only 1e18 is at acceptable prices
        let fillable = inner.fillable_size(Side::Long, Some(price(100)), 2 * AMOUNT_SCALE);
        assert_eq!(fillable, AMOUNT_SCALE);

        // the simulation left the book untouched
        assert_eq!(inner.side_size(Side::Short), 2 * AMOUNT_SCALE);
        assert_eq!(inner.order_count(), 2);

        // at 1.02 the walk reaches both levels
        let fillable = inner.fillable_size(Side::Long, Some(price(102)), 2 * AMOUNT_SCALE);
        assert_eq!(fillable, 2 * AMOUNT_SCALE);
    }

    #[test]
    fn test_would_cross() {
        let book = Orderbook::new("X".into());
        let mut inner = book.lock();

        inner.add(Side::Short, entry(Uuid::new_v4(), "A", Some(price(100)), AMOUNT_SCALE, 1));

        assert!(inner.would_cross(Side::Long, Some(price(100))));
        assert!(inner.would_cross(Side::Long, Some(price(101))));
        assert!(!inner.would_cross(Side::Long, Some(price(99))));
        assert!(inner.would_cross(Side::Long, None));
        // nothing rests on the long side
        assert!(!inner.would_cross(Side::Short, Some(price(100))));
    }

    #[test]
    fn test_cancel_removes_and_empties_level() {
        let book = Orderbook::new("X".into());
        let mut inner = book.lock();

        let id = Uuid::new_v4();
        inner.add(Side::Long, entry(id, "A", Some(price(90)), AMOUNT_SCALE, 1));
        assert_eq!(inner.order_count(), 1);

        let removed = inner.remove(id).unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(inner.order_count(), 0);
        assert_eq!(inner.best_price(Side::Long), None);
        assert!(inner.remove(id).is_none());
    }

    #[test]
    fn test_depth_aggregates_by_level() {
        let book = Orderbook::new("X".into());
        let mut inner = book.lock();

        inner.add(Side::Long, entry(Uuid::new_v4(), "A", Some(price(90)), AMOUNT_SCALE, 1));
        inner.add(Side::Long, entry(Uuid::new_v4(), "B", Some(price(90)), 2 * AMOUNT_SCALE, 2));
        inner.add(Side::Long, entry(Uuid::new_v4(), "C", Some(price(92)), AMOUNT_SCALE, 3));

        let depth = inner.depth(Side::Long, 10);
        assert_eq!(depth.len(), 2);
        // best first
        assert_eq!(depth[0], (price(92), AMOUNT_SCALE));
        assert_eq!(depth[1], (price(90), 3 * AMOUNT_SCALE));
    }
}
