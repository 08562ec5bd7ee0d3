//! Position & Balance Service
//!
//! Converts matches into paired positions, merges same-counterparty exposure,
//! services close and margin intents, and validates TP/SL attachments.
//! Liquidation has its own service; this module never touches the insurance
//! funds.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, RejectReason};
use crate::models::market::{OnchainStatus, SettlementKind, SettlementLogEntry};
use crate::models::order::Side;
use crate::models::position::{Pair, PairStatus, TpSl};
use crate::models::units::{
    apply_ratio, effective_mmr_bp, fee_usd, implied_leverage_bp, liquidation_price, notional_usd,
    price_pnl_usd, weighted_entry_price, Bp, Price, Usd, PRECISION,
};
use crate::services::matching::Match;
use crate::state::VenueState;
use crate::stream::channels::VenueEvent;

/// Result of a close, returned so the caller can schedule the ledger leg.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub pair_id: Uuid,
    pub symbol: String,
    pub exit_price: Price,
    pub closed_size: i128,
    pub long_pnl: Usd,
    pub short_pnl: Usd,
    pub full_close: bool,
}

pub struct PositionService {
    state: Arc<VenueState>,
    event_tx: broadcast::Sender<VenueEvent>,
    close_fee_bp: Bp,
    base_mmr_bp: Bp,
    max_leverage_bp: Bp,
}

impl PositionService {
    pub fn new(
        state: Arc<VenueState>,
        event_tx: broadcast::Sender<VenueEvent>,
        close_fee_bp: Bp,
        base_mmr_bp: Bp,
        max_leverage_bp: Bp,
    ) -> Self {
        Self {
            state,
            event_tx,
            close_fee_bp,
            base_mmr_bp,
            max_leverage_bp,
        }
    }

    // ========================================================================
    // Pair formation
    // ========================================================================

    /// Fold a match into the position store: merge into an existing pair
    /// between the same counterparties, or open a new one. Returns the pair
    /// the match settled into.
    pub fn apply_match(&self, m: &Match) -> Uuid {
        let now = Utc::now().timestamp_millis();

        let existing = self.state.pairs_of(&m.long_trader).into_iter().find(|p| {
            p.is_active()
                && p.symbol == m.symbol
                && p.long_trader == m.long_trader
                && p.short_trader == m.short_trader
        });

        let pair_id = if let Some(pair) = existing {
            self.state.with_pair_mut(pair.id, |p| {
                p.entry_price = weighted_entry_price(p.entry_price, p.size, m.price, m.size);
                p.size += m.size;
                p.long_collateral += m.long_collateral;
                p.short_collateral += m.short_collateral;
                p.long_open_fee += m.long_fee;
                p.short_open_fee += m.short_fee;
                let notional = notional_usd(p.size, p.entry_price);
                p.long_leverage_bp = implied_leverage_bp(notional, p.long_collateral);
                p.short_leverage_bp = implied_leverage_bp(notional, p.short_collateral);
                p.updated_at = now;
            });
            debug!(pair_id = %pair.id, symbol = %m.symbol, "merged match into existing pair");
            pair.id
        } else {
            let (entry_long, entry_short) = self
                .state
                .market(&m.symbol)
                .map(|stats| (stats.funding_index, stats.funding_index))
                .unwrap_or((0, 0));
            let pair = Pair {
                id: Uuid::new_v4(),
                ledger_pair_id: None,
                symbol: m.symbol.clone(),
                long_trader: m.long_trader.clone(),
                short_trader: m.short_trader.clone(),
                size: m.size,
                entry_price: m.price,
                long_collateral: m.long_collateral,
                short_collateral: m.short_collateral,
                long_leverage_bp: m.long_leverage_bp,
                short_leverage_bp: m.short_leverage_bp,
                long_open_fee: m.long_fee,
                short_open_fee: m.short_fee,
                entry_funding_index_long: entry_long,
                entry_funding_index_short: entry_short,
                acc_funding_long: 0,
                acc_funding_short: 0,
                long_tp_sl: TpSl::default(),
                short_tp_sl: TpSl::default(),
                status: PairStatus::Active,
                open_time: now,
                updated_at: now,
            };
            let id = pair.id;
            self.state.insert_pair(pair);
            debug!(pair_id = %id, symbol = %m.symbol, "opened pair from match");
            id
        };

        self.state.adjust_open_interest(&m.symbol, m.size);
        self.emit_balance(&m.long_trader, now);
        self.emit_balance(&m.short_trader, now);
        pair_id
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close `ratio_bp` of a pair at the current mark. Both sides settle:
    /// realized PnL is zero-sum before fees, and the closed fraction of each
    /// side's collateral is released.
    pub fn close(
        &self,
        pair_id: Uuid,
        caller: Option<&str>,
        ratio_bp: Bp,
    ) -> Result<CloseOutcome, CoreError> {
        if ratio_bp <= 0 || ratio_bp > PRECISION {
            return Err(CoreError::Rejected(RejectReason::TpslInvalid));
        }
        let pair = self.state.pair(pair_id).ok_or(CoreError::PairNotFound(pair_id))?;
        if !pair.is_active() {
            return Err(CoreError::PairNotActive(pair_id));
        }
        if let Some(caller) = caller {
            if pair.side_of(caller).is_none() {
                return Err(CoreError::NotOwner(pair_id));
            }
        }
        let mark = self
            .state
            .mark_price(&pair.symbol)
            .ok_or_else(|| CoreError::SymbolNotFound(pair.symbol.clone()))?;

        let now = Utc::now().timestamp_millis();
        let closed_size = apply_ratio(pair.size, ratio_bp);
        let full_close = ratio_bp == PRECISION;
        let close_notional = notional_usd(closed_size, mark);
        let close_fee = fee_usd(close_notional, self.close_fee_bp);

        let long_price_pnl = price_pnl_usd(1, closed_size, pair.entry_price, mark);
        let short_price_pnl = -long_price_pnl;
        let long_pnl = long_price_pnl - close_fee;
        let short_pnl = short_price_pnl - close_fee;

        let long_released = apply_ratio(pair.long_collateral as i128, ratio_bp) as Usd;
        let short_released = apply_ratio(pair.short_collateral as i128, ratio_bp) as Usd;

        self.settle_side(&pair.long_trader, long_released, long_pnl, pair_id, &pair.symbol, now);
        self.settle_side(&pair.short_trader, short_released, short_pnl, pair_id, &pair.symbol, now);

        if full_close {
            self.state.with_pair_mut(pair_id, |p| {
                p.size = 0;
                p.long_collateral = 0;
                p.short_collateral = 0;
                p.status = PairStatus::Closed;
                p.updated_at = now;
            });
        } else {
            self.state.with_pair_mut(pair_id, |p| {
                p.size -= closed_size;
                p.long_collateral -= long_released;
                p.short_collateral -= short_released;
                p.updated_at = now;
            });
        }
        self.state.adjust_open_interest(&pair.symbol, -closed_size);

        let event = if full_close {
            VenueEvent::PositionClosed {
                pair_id,
                symbol: pair.symbol.clone(),
                exit_price: mark,
                long_pnl,
                short_pnl,
                timestamp: now,
            }
        } else {
            VenueEvent::PartialClose {
                pair_id,
                symbol: pair.symbol.clone(),
                closed_size,
                exit_price: mark,
                timestamp: now,
            }
        };
        let _ = self.event_tx.send(event);

        info!(
            pair_id = %pair_id,
            symbol = %pair.symbol,
            ratio_bp,
            long_pnl,
            short_pnl,
            "pair closed"
        );

        Ok(CloseOutcome {
            pair_id,
            symbol: pair.symbol,
            exit_price: mark,
            closed_size,
            long_pnl,
            short_pnl,
            full_close,
        })
    }

    fn settle_side(
        &self,
        trader: &str,
        released: Usd,
        pnl: Usd,
        pair_id: Uuid,
        symbol: &str,
        now: i64,
    ) {
        let before = self.state.balance(trader).available;
        self.state
            .with_balance_mut(trader, |b| b.settle_position(released, pnl, now));
        let after = self.state.balance(trader).available;
        self.state.append_settlement(SettlementLogEntry {
            id: Uuid::new_v4(),
            kind: SettlementKind::SettlePnl,
            trader: trader.to_string(),
            symbol: Some(symbol.to_string()),
            amount: pnl,
            balance_before: before,
            balance_after: after,
            onchain_status: OnchainStatus::Pending,
            txn_ref: None,
            proof: Some(serde_json::json!({ "pair_id": pair_id })),
            created_at: now,
        });
        self.emit_balance(trader, now);
    }

    // ========================================================================
    // Margin add / remove
    // ========================================================================

    pub fn add_margin(&self, pair_id: Uuid, trader: &str, amount: Usd) -> Result<(), CoreError> {
        if amount <= 0 {
            return Err(CoreError::Rejected(RejectReason::InsufficientFunds));
        }
        let pair = self.state.pair(pair_id).ok_or(CoreError::PairNotFound(pair_id))?;
        if !pair.is_active() {
            return Err(CoreError::PairNotActive(pair_id));
        }
        let side = pair.side_of(trader).ok_or(CoreError::NotOwner(pair_id))?;
        let now = Utc::now().timestamp_millis();

        self.state
            .with_balance_mut(trader, |b| {
                b.debit(amount, now)?;
                b.used_margin += amount;
                Ok::<(), crate::models::balance::InsufficientBalance>(())
            })
            .map_err(|_| CoreError::Rejected(RejectReason::InsufficientFunds))?;

        let (collateral, leverage) = self
            .state
            .with_pair_mut(pair_id, |p| {
                let notional = notional_usd(p.size, p.entry_price);
                match side {
                    Side::Long => {
                        p.long_collateral += amount;
                        p.long_leverage_bp = implied_leverage_bp(notional, p.long_collateral);
                        (p.long_collateral, p.long_leverage_bp)
                    }
                    Side::Short => {
                        p.short_collateral += amount;
                        p.short_leverage_bp = implied_leverage_bp(notional, p.short_collateral);
                        (p.short_collateral, p.short_leverage_bp)
                    }
                }
            })
            .ok_or(CoreError::PairNotFound(pair_id))?;

        self.log_margin_change(SettlementKind::MarginAdd, trader, &pair.symbol, amount, now);
        let _ = self.event_tx.send(VenueEvent::MarginUpdated {
            pair_id,
            trader: trader.to_string(),
            side,
            collateral,
            leverage_bp: leverage,
            timestamp: now,
        });
        self.emit_balance(trader, now);
        Ok(())
    }

    /// Remove collateral. Refused when the side would leave the low-risk
    /// band: the post-removal margin ratio must stay below the high-risk
    /// threshold.
    pub fn remove_margin(&self, pair_id: Uuid, trader: &str, amount: Usd) -> Result<(), CoreError> {
        if amount <= 0 {
            return Err(CoreError::Rejected(RejectReason::InsufficientFunds));
        }
        let pair = self.state.pair(pair_id).ok_or(CoreError::PairNotFound(pair_id))?;
        if !pair.is_active() {
            return Err(CoreError::PairNotActive(pair_id));
        }
        let side = pair.side_of(trader).ok_or(CoreError::NotOwner(pair_id))?;
        let mark = self
            .state
            .mark_price(&pair.symbol)
            .ok_or_else(|| CoreError::SymbolNotFound(pair.symbol.clone()))?;
        let now = Utc::now().timestamp_millis();

        let collateral = pair.collateral_of(side);
        if amount >= collateral {
            return Err(CoreError::Rejected(RejectReason::InsufficientFunds));
        }
        let collateral_after = collateral - amount;
        let notional = notional_usd(pair.size, pair.entry_price);
        let leverage_after = implied_leverage_bp(notional, collateral_after);
        if leverage_after > self.max_leverage_bp {
            return Err(CoreError::Rejected(RejectReason::MaxLeverageExceeded));
        }
        let pnl = price_pnl_usd(side.direction(), pair.size, pair.entry_price, mark)
            - pair.open_fee_of(side);
        let equity_after = collateral_after + pnl;
        let mmr = effective_mmr_bp(self.base_mmr_bp, leverage_after);
        let maintenance = fee_usd(notional_usd(pair.size, mark), mmr);
        let ratio = crate::models::units::margin_ratio_bp(maintenance, equity_after);
        if ratio >= 8_000 {
            return Err(CoreError::Rejected(RejectReason::InsufficientFunds));
        }

        self.state.with_pair_mut(pair_id, |p| match side {
            Side::Long => {
                p.long_collateral = collateral_after;
                p.long_leverage_bp = leverage_after;
            }
            Side::Short => {
                p.short_collateral = collateral_after;
                p.short_leverage_bp = leverage_after;
            }
        });
        self.state.with_balance_mut(trader, |b| {
            b.used_margin -= amount;
            b.available += amount;
        });

        self.log_margin_change(SettlementKind::MarginRemove, trader, &pair.symbol, -amount, now);
        let _ = self.event_tx.send(VenueEvent::MarginUpdated {
            pair_id,
            trader: trader.to_string(),
            side,
            collateral: collateral_after,
            leverage_bp: leverage_after,
            timestamp: now,
        });
        self.emit_balance(trader, now);
        Ok(())
    }

    // ========================================================================
    // TP/SL
    // ========================================================================

    /// Attach or replace TP/SL levels on the caller's side of a pair.
    ///
    /// Validity: long TP above entry, long SL below entry but above the
    /// liquidation price; mirrored for short.
    pub fn set_tp_sl(
        &self,
        pair_id: Uuid,
        trader: &str,
        take_profit: Option<Price>,
        stop_loss: Option<Price>,
    ) -> Result<(), CoreError> {
        let pair = self.state.pair(pair_id).ok_or(CoreError::PairNotFound(pair_id))?;
        if !pair.is_active() {
            return Err(CoreError::PairNotActive(pair_id));
        }
        let side = pair.side_of(trader).ok_or(CoreError::NotOwner(pair_id))?;

        let leverage = pair.leverage_of(side);
        let mmr = effective_mmr_bp(self.base_mmr_bp, leverage);
        let liq = liquidation_price(pair.entry_price, leverage, mmr, side == Side::Long);

        let valid = match side {
            Side::Long => {
                take_profit.map_or(true, |tp| tp > pair.entry_price)
                    && stop_loss.map_or(true, |sl| sl < pair.entry_price && sl > liq)
            }
            Side::Short => {
                take_profit.map_or(true, |tp| tp < pair.entry_price)
                    && stop_loss.map_or(true, |sl| sl > pair.entry_price && sl < liq)
            }
        };
        if !valid {
            return Err(CoreError::Rejected(RejectReason::TpslInvalid));
        }

        self.state.with_pair_mut(pair_id, |p| {
            let slot = match side {
                Side::Long => &mut p.long_tp_sl,
                Side::Short => &mut p.short_tp_sl,
            };
            slot.take_profit = take_profit;
            slot.stop_loss = stop_loss;
        });
        debug!(pair_id = %pair_id, trader = %trader, "tp/sl updated");
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn log_margin_change(
        &self,
        kind: SettlementKind,
        trader: &str,
        symbol: &str,
        amount: Usd,
        now: i64,
    ) {
        let balance = self.state.balance(trader);
        self.state.append_settlement(SettlementLogEntry {
            id: Uuid::new_v4(),
            kind,
            trader: trader.to_string(),
            symbol: Some(symbol.to_string()),
            amount,
            balance_before: balance.available + amount,
            balance_after: balance.available,
            onchain_status: OnchainStatus::Pending,
            txn_ref: None,
            proof: None,
            created_at: now,
        });
    }

    fn emit_balance(&self, trader: &str, now: i64) {
        let balance = self.state.balance(trader);
        let _ = self.event_tx.send(VenueEvent::BalanceUpdate {
            trader: trader.to_string(),
            available: balance.available,
            used_margin: balance.used_margin,
            frozen_margin: balance.frozen_margin,
            timestamp: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE, USD_SCALE};

    fn setup() -> (Arc<VenueState>, PositionService) {
        let state = Arc::new(VenueState::new(
            &["MEMEUSD".to_string()],
            10_000 * USD_SCALE,
            1_000,
        ));
        state.with_market_mut("MEMEUSD", |m| m.record_trade(PRICE_SCALE, 0, 0));
        let (event_tx, _) = broadcast::channel(256);
        let service = PositionService::new(state.clone(), event_tx, 5, 200, 1_000_000);
        (state, service)
    }

    fn funded_match(state: &VenueState, size: i128, price: Price) -> Match {
        // emulate the engine's balance legs for a clean position-store test
        let notional = notional_usd(size, price);
        let collateral = crate::models::units::margin_usd(notional, 100_000);
        for trader in ["L", "S"] {
            state.with_balance_mut(trader, |b| {
                b.credit(collateral * 2, 0);
                b.freeze(collateral, 0).unwrap();
                b.fill(collateral, 0, 0);
            });
        }
        Match {
            id: Uuid::new_v4(),
            symbol: "MEMEUSD".to_string(),
            long_order_id: Uuid::new_v4(),
            short_order_id: Uuid::new_v4(),
            long_trader: "L".to_string(),
            short_trader: "S".to_string(),
            long_nonce: 0,
            short_nonce: 0,
            price,
            size,
            taker_side: Side::Long,
            long_collateral: collateral,
            short_collateral: collateral,
            long_fee: 0,
            short_fee: 0,
            long_leverage_bp: 100_000,
            short_leverage_bp: 100_000,
            timestamp: 0,
        }
    }

    #[test]
    fn test_apply_match_opens_pair() {
        let (state, service) = setup();
        let m = funded_match(&state, AMOUNT_SCALE, PRICE_SCALE);

        let pair_id = service.apply_match(&m);
        let pair = state.pair(pair_id).unwrap();
        assert_eq!(pair.size, AMOUNT_SCALE);
        assert_eq!(pair.entry_price, PRICE_SCALE);
        assert_eq!(pair.long_trader, "L");
        assert_eq!(pair.status, PairStatus::Active);

        let stats = state.market("MEMEUSD").unwrap();
        assert_eq!(stats.long_oi, AMOUNT_SCALE);
        assert_eq!(stats.short_oi, AMOUNT_SCALE);
    }

    #[test]
    fn test_apply_match_merges_same_counterparties() {
        let (state, service) = setup();
        let first = funded_match(&state, AMOUNT_SCALE, PRICE_SCALE);
        let second = funded_match(&state, AMOUNT_SCALE, 2 * PRICE_SCALE);

        let id1 = service.apply_match(&first);
        let id2 = service.apply_match(&second);
        assert_eq!(id1, id2);

        let pair = state.pair(id1).unwrap();
        assert_eq!(pair.size, 2 * AMOUNT_SCALE);
        // volume-weighted entry: (1.00 + 2.00) / 2
        assert_eq!(pair.entry_price, PRICE_SCALE * 3 / 2);
        assert!(state.audit_pair_symmetry().is_ok());
    }

    #[test]
    fn test_full_close_is_zero_sum_before_fees() {
        let (state, service) = setup();
        let m = funded_match(&state, AMOUNT_SCALE, PRICE_SCALE);
        let pair_id = service.apply_match(&m);

        // mark moves to 1.20: long +0.20, short -0.20
        state.with_market_mut("MEMEUSD", |s| s.record_trade(PRICE_SCALE * 12 / 10, 0, 1));

        let outcome = service.close(pair_id, None, PRECISION).unwrap();
        assert!(outcome.full_close);
        assert_eq!(outcome.long_pnl + outcome.short_pnl, -2 * fee_usd(
            notional_usd(AMOUNT_SCALE, PRICE_SCALE * 12 / 10),
            5,
        ));

        let pair = state.pair(pair_id).unwrap();
        assert_eq!(pair.status, PairStatus::Closed);
        assert_eq!(pair.size, 0);

        let stats = state.market("MEMEUSD").unwrap();
        assert_eq!(stats.long_oi, 0);
    }

    #[test]
    fn test_partial_close_scales_linearly() {
        let (state, service) = setup();
        let m = funded_match(&state, 2 * AMOUNT_SCALE, PRICE_SCALE);
        let pair_id = service.apply_match(&m);
        let collateral_before = state.pair(pair_id).unwrap().long_collateral;

        let outcome = service.close(pair_id, Some("L"), PRECISION / 2).unwrap();
        assert!(!outcome.full_close);
        assert_eq!(outcome.closed_size, AMOUNT_SCALE);

        let pair = state.pair(pair_id).unwrap();
        assert_eq!(pair.status, PairStatus::Active);
        assert_eq!(pair.size, AMOUNT_SCALE);
        assert_eq!(pair.long_collateral, collateral_before / 2);
    }

    #[test]
    fn test_close_requires_party() {
        let (state, service) = setup();
        let m = funded_match(&state, AMOUNT_SCALE, PRICE_SCALE);
        let pair_id = service.apply_match(&m);

        let err = service.close(pair_id, Some("stranger"), PRECISION).unwrap_err();
        assert!(matches!(err, CoreError::NotOwner(_)));

        service.close(pair_id, Some("L"), PRECISION).unwrap();
        let err = service.close(pair_id, Some("L"), PRECISION).unwrap_err();
        assert!(matches!(err, CoreError::PairNotActive(_)));
    }

    #[test]
    fn test_margin_add_lowers_leverage() {
        let (state, service) = setup();
        let m = funded_match(&state, AMOUNT_SCALE, PRICE_SCALE);
        let pair_id = service.apply_match(&m);
        state.with_balance_mut("L", |b| b.credit(USD_SCALE, 0));

        let leverage_before = state.pair(pair_id).unwrap().long_leverage_bp;
        service.add_margin(pair_id, "L", 50_000).unwrap();

        let pair = state.pair(pair_id).unwrap();
        assert!(pair.long_leverage_bp < leverage_before);
        assert_eq!(pair.long_collateral, m.long_collateral + 50_000);
    }

    #[test]
    fn test_margin_remove_bounded_by_risk() {
        let (state, service) = setup();
        let m = funded_match(&state, AMOUNT_SCALE, PRICE_SCALE);
        let pair_id = service.apply_match(&m);

        // removing nearly all collateral must be refused
        let collateral = state.pair(pair_id).unwrap().long_collateral;
        let err = service.remove_margin(pair_id, "L", collateral - 1).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Rejected(RejectReason::MaxLeverageExceeded)
        ));

        // a modest removal within the risk band is fine
        service.remove_margin(pair_id, "L", collateral / 10).unwrap();
        let pair = state.pair(pair_id).unwrap();
        assert_eq!(pair.long_collateral, collateral - collateral / 10);
    }

    #[test]
    fn test_tp_sl_validity_long() {
        let (state, service) = setup();
        let m = funded_match(&state, AMOUNT_SCALE, PRICE_SCALE);
        let pair_id = service.apply_match(&m);

        // long TP must be above entry
        let err = service
            .set_tp_sl(pair_id, "L", Some(PRICE_SCALE * 9 / 10), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Rejected(RejectReason::TpslInvalid)));

        // long SL must sit between liquidation and entry; 10x entry 1.00
        // puts liquidation at 0.92
        let err = service
            .set_tp_sl(pair_id, "L", None, Some(PRICE_SCALE * 90 / 100))
            .unwrap_err();
        assert!(matches!(err, CoreError::Rejected(RejectReason::TpslInvalid)));

        service
            .set_tp_sl(
                pair_id,
                "L",
                Some(PRICE_SCALE * 12 / 10),
                Some(PRICE_SCALE * 95 / 100),
            )
            .unwrap();
        let pair = state.pair(pair_id).unwrap();
        assert_eq!(pair.long_tp_sl.take_profit, Some(PRICE_SCALE * 12 / 10));
        assert_eq!(pair.long_tp_sl.stop_loss, Some(PRICE_SCALE * 95 / 100));
    }

    #[test]
    fn test_tp_sl_validity_short() {
        let (state, service) = setup();
        let m = funded_match(&state, AMOUNT_SCALE, PRICE_SCALE);
        let pair_id = service.apply_match(&m);

        // short TP must be below entry
        let err = service
            .set_tp_sl(pair_id, "S", Some(PRICE_SCALE * 11 / 10), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Rejected(RejectReason::TpslInvalid)));

        service
            .set_tp_sl(
                pair_id,
                "S",
                Some(PRICE_SCALE * 8 / 10),
                Some(PRICE_SCALE * 105 / 100),
            )
            .unwrap();
    }
}
