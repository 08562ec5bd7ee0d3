//! Liquidation Service
//!
//! Closes distressed positions at mark. Residual collateral funds the
//! liquidator fee and the symbol insurance fund; bankruptcies draw the
//! symbol fund, then the global fund, then auto-deleverage the winning side.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::market::{OnchainStatus, SettlementKind, SettlementLogEntry};
use crate::models::order::Side;
use crate::models::position::{PairStatus, PositionRisk};
use crate::models::units::{price_pnl_usd, Bp, Usd, PRECISION};
use crate::services::adl::AdlService;
use crate::state::VenueState;
use crate::stream::channels::VenueEvent;

#[derive(Debug, Clone)]
pub struct LiquidationOutcome {
    pub pair_id: Uuid,
    pub trader: String,
    pub bankrupt: bool,
    pub liquidator_fee: Usd,
    pub insurance_contribution: Usd,
    pub insurance_drawn: Usd,
    pub adl_extracted: Usd,
    pub uncovered: Usd,
}

pub struct LiquidationService {
    state: Arc<VenueState>,
    event_tx: broadcast::Sender<VenueEvent>,
    adl: Arc<AdlService>,
    liquidation_fee_bp: Bp,
}

impl LiquidationService {
    pub fn new(
        state: Arc<VenueState>,
        event_tx: broadcast::Sender<VenueEvent>,
        adl: Arc<AdlService>,
        liquidation_fee_bp: Bp,
    ) -> Self {
        Self {
            state,
            event_tx,
            adl,
            liquidation_fee_bp,
        }
    }

    /// Liquidate the distressed side of a pair at the current mark. The whole
    /// pair exits: the counterparty settles its mirror PnL.
    pub fn liquidate(&self, risk: &PositionRisk) -> Result<LiquidationOutcome, CoreError> {
        let pair = self
            .state
            .pair(risk.pair_id)
            .ok_or(CoreError::PairNotFound(risk.pair_id))?;
        if pair.status != PairStatus::Active {
            return Err(CoreError::PairNotActive(risk.pair_id));
        }
        let mark = self
            .state
            .mark_price(&pair.symbol)
            .ok_or_else(|| CoreError::SymbolNotFound(pair.symbol.clone()))?;
        let now = Utc::now().timestamp_millis();

        let side = risk.side;
        let trader = pair.trader_of(side).to_string();
        let counter_side = side.opposite();
        let counter_trader = pair.trader_of(counter_side).to_string();

        let collateral = pair.collateral_of(side);
        let counter_collateral = pair.collateral_of(counter_side);
        let pnl = price_pnl_usd(side.direction(), pair.size, pair.entry_price, mark);
        let counter_pnl = -pnl;
        let residual = collateral + pnl;

        let mut outcome = LiquidationOutcome {
            pair_id: pair.id,
            trader: trader.clone(),
            bankrupt: residual < 0,
            liquidator_fee: 0,
            insurance_contribution: 0,
            insurance_drawn: 0,
            adl_extracted: 0,
            uncovered: 0,
        };

        if residual >= 0 {
            // Normal liquidation: the liquidated side's collateral absorbs
            // the loss; what remains splits into the liquidator fee and the
            // symbol insurance fund.
            let fee = (residual as i128 * self.liquidation_fee_bp as i128
                / PRECISION as i128) as Usd;
            let contribution = residual - fee;
            self.state
                .with_insurance_mut(&pair.symbol, |f| f.contribute(contribution));
            outcome.liquidator_fee = fee;
            outcome.insurance_contribution = contribution;
        } else {
            // Bankruptcy: mark moved past the bankruptcy price before the
            // position could be closed. Cover the hole: symbol fund, global
            // fund, then ADL against the winning side.
            let mut deficit = -residual;
            let drawn_symbol = self
                .state
                .with_insurance_mut(&pair.symbol, |f| f.payout(deficit))
                .unwrap_or(0);
            deficit -= drawn_symbol;
            let drawn_global = if deficit > 0 {
                self.state.with_global_insurance_mut(|f| f.payout(deficit))
            } else {
                0
            };
            deficit -= drawn_global;
            outcome.insurance_drawn = drawn_symbol + drawn_global;

            if deficit > 0 {
                let before = deficit;
                let uncovered = self.adl.deleverage(&pair.symbol, counter_side, deficit);
                outcome.adl_extracted = before - uncovered;
                outcome.uncovered = uncovered;
                if uncovered > 0 {
                    warn!(
                        pair_id = %pair.id,
                        symbol = %pair.symbol,
                        uncovered,
                        "liquidation left an uncovered deficit"
                    );
                }
            }
        }

        // Liquidated side: collateral fully consumed, nothing returned.
        let before = self.state.balance(&trader).available;
        self.state
            .with_balance_mut(&trader, |b| b.settle_position(collateral, -collateral, now));
        let after = self.state.balance(&trader).available;
        self.state.append_settlement(SettlementLogEntry {
            id: Uuid::new_v4(),
            kind: SettlementKind::Liquidation,
            trader: trader.clone(),
            symbol: Some(pair.symbol.clone()),
            amount: -collateral,
            balance_before: before,
            balance_after: after,
            onchain_status: OnchainStatus::Pending,
            txn_ref: None,
            proof: Some(serde_json::json!({ "pair_id": pair.id, "mark": mark })),
            created_at: now,
        });

        // Counterparty exits with its mirror PnL; an uncovered deficit caps
        // the payout at what was actually funded.
        let funded_counter_pnl = counter_pnl - outcome.uncovered;
        self.state.with_balance_mut(&counter_trader, |b| {
            b.settle_position(counter_collateral, funded_counter_pnl, now)
        });

        self.state.with_pair_mut(pair.id, |p| {
            p.size = 0;
            p.long_collateral = 0;
            p.short_collateral = 0;
            p.status = PairStatus::Liquidated;
            p.updated_at = now;
        });
        self.state.adjust_open_interest(&pair.symbol, -pair.size);

        let _ = self.event_tx.send(VenueEvent::Liquidation {
            pair_id: pair.id,
            trader: trader.clone(),
            symbol: pair.symbol.clone(),
            side,
            mark_price: mark,
            liquidator_fee: outcome.liquidator_fee,
            insurance_contribution: outcome.insurance_contribution,
            timestamp: now,
        });
        info!(
            pair_id = %pair.id,
            trader = %trader,
            symbol = %pair.symbol,
            bankrupt = outcome.bankrupt,
            "position liquidated"
        );

        Ok(outcome)
    }
}
