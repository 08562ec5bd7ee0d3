//! Auto-Deleveraging Service
//!
//! Maintains per-symbol, per-side queues of profitable positions ranked by
//! ADL score, and reduces them to cover losses the insurance funds cannot.
//! Queues are rebuilt at the start of each risk tick; liquidations within a
//! tick deleverage against that snapshot.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::order::Side;
use crate::models::position::{PairStatus, PositionRisk};
use crate::models::units::{Amount, Bp, Usd, PRECISION};
use crate::state::VenueState;
use crate::stream::channels::VenueEvent;

/// One deleverageable position in a queue, score-descending.
#[derive(Debug, Clone)]
pub struct AdlCandidate {
    pub pair_id: Uuid,
    pub side: Side,
    pub trader: String,
    pub size: Amount,
    pub collateral: Usd,
    pub pnl: Usd,
    pub equity: Usd,
    pub adl_score_bp: Bp,
}

pub struct AdlService {
    state: Arc<VenueState>,
    event_tx: broadcast::Sender<VenueEvent>,
    queues: RwLock<HashMap<(String, Side), Vec<AdlCandidate>>>,
}

impl AdlService {
    pub fn new(state: Arc<VenueState>, event_tx: broadcast::Sender<VenueEvent>) -> Self {
        Self {
            state,
            event_tx,
            queues: RwLock::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Queue maintenance
    // ========================================================================

    /// Rebuild every queue from this tick's risk vectors. Returns the
    /// quintile rank (1..=5) per queued position for the risk engine to fold
    /// back into the derived fields.
    pub fn rebuild(&self, risks: &[PositionRisk]) -> HashMap<(Uuid, Side), u8> {
        let mut queues: HashMap<(String, Side), Vec<AdlCandidate>> = HashMap::new();
        for risk in risks {
            if risk.unrealized_pnl <= 0 {
                continue;
            }
            queues
                .entry((risk.symbol.clone(), risk.side))
                .or_default()
                .push(AdlCandidate {
                    pair_id: risk.pair_id,
                    side: risk.side,
                    trader: risk.trader.clone(),
                    size: risk.size,
                    collateral: risk.collateral,
                    pnl: risk.unrealized_pnl,
                    equity: risk.equity,
                    adl_score_bp: risk.adl_score_bp,
                });
        }

        let mut ranks = HashMap::new();
        for queue in queues.values_mut() {
            queue.sort_by(|a, b| b.adl_score_bp.cmp(&a.adl_score_bp));
            let len = queue.len();
            for (idx, candidate) in queue.iter().enumerate() {
                // quintile of the positive-score population, 1 = first in line
                let rank = (idx * 5 / len) as u8 + 1;
                ranks.insert((candidate.pair_id, candidate.side), rank);
            }
        }

        *self.queues.write() = queues;
        ranks
    }

    pub fn queue(&self, symbol: &str, side: Side) -> Vec<AdlCandidate> {
        self.queues
            .read()
            .get(&(symbol.to_string(), side))
            .cloned()
            .unwrap_or_default()
    }

    // ========================================================================
    // Deleveraging
    // ========================================================================

    /// Cover `deficit` by reducing profitable `winning_side` positions in
    /// score order. Each candidate forfeits up to `min(deficit, pnl)` of
    /// unrealized profit; the reduced fraction of the pair closes at mark for
    /// both counterparties. Returns the deficit still uncovered when the
    /// queue is exhausted.
    pub fn deleverage(&self, symbol: &str, winning_side: Side, mut deficit: Usd) -> Usd {
        if deficit <= 0 {
            return 0;
        }
        let queue = self.queue(symbol, winning_side);
        let now = Utc::now().timestamp_millis();

        for candidate in queue {
            if deficit <= 0 {
                break;
            }
            // the snapshot may be stale: skip pairs that already closed
            let Some(pair) = self.state.pair(candidate.pair_id) else {
                continue;
            };
            if pair.status != PairStatus::Active || pair.size == 0 {
                continue;
            }

            let extracted = deficit.min(candidate.pnl).min(candidate.equity);
            if extracted <= 0 || candidate.pnl <= 0 {
                continue;
            }
            let fraction_bp = ((extracted as i128 * PRECISION as i128
                + candidate.pnl as i128
                - 1)
                / candidate.pnl as i128) as Bp;
            let fraction_bp = fraction_bp.min(PRECISION);
            let reduced_size = pair.size * fraction_bp as i128 / PRECISION as i128;

            self.reduce_pair(&pair.id, candidate.side, fraction_bp, extracted, now);
            deficit -= extracted;

            let _ = self.event_tx.send(VenueEvent::AdlTriggered {
                pair_id: candidate.pair_id,
                trader: candidate.trader.clone(),
                symbol: symbol.to_string(),
                side: candidate.side,
                reduced_size,
                extracted_pnl: extracted,
                timestamp: now,
            });
            info!(
                pair_id = %candidate.pair_id,
                trader = %candidate.trader,
                extracted,
                "position auto-deleveraged"
            );
        }

        if deficit > 0 {
            warn!(symbol, deficit, "ADL queue exhausted with uncovered deficit");
            let _ = self.event_tx.send(VenueEvent::Insolvency {
                symbol: symbol.to_string(),
                uncovered_deficit: deficit,
                timestamp: now,
            });
        }
        deficit
    }

    /// Partially close a pair at mark with the winner's profit on the closed
    /// fraction confiscated. No close fees on forced reductions.
    fn reduce_pair(&self, pair_id: &Uuid, winning_side: Side, fraction_bp: Bp, confiscated: Usd, now: i64) {
        let Some(pair) = self.state.pair(*pair_id) else {
            return;
        };
        let Some(mark) = self.state.mark_price(&pair.symbol) else {
            return;
        };

        let closed_size = pair.size * fraction_bp as i128 / PRECISION as i128;
        let long_released =
            (pair.long_collateral as i128 * fraction_bp as i128 / PRECISION as i128) as Usd;
        let short_released =
            (pair.short_collateral as i128 * fraction_bp as i128 / PRECISION as i128) as Usd;

        let long_pnl =
            crate::models::units::price_pnl_usd(1, closed_size, pair.entry_price, mark);
        let short_pnl = -long_pnl;

        let (winner_trader, loser_trader, winner_released, loser_released, winner_pnl, loser_pnl) =
            match winning_side {
                Side::Long => (
                    &pair.long_trader,
                    &pair.short_trader,
                    long_released,
                    short_released,
                    long_pnl,
                    short_pnl,
                ),
                Side::Short => (
                    &pair.short_trader,
                    &pair.long_trader,
                    short_released,
                    long_released,
                    short_pnl,
                    long_pnl,
                ),
            };

        self.state.with_balance_mut(winner_trader, |b| {
            b.settle_position(winner_released, winner_pnl - confiscated, now)
        });
        self.state.with_balance_mut(loser_trader, |b| {
            b.settle_position(loser_released, loser_pnl, now)
        });

        let full = fraction_bp >= PRECISION;
        self.state.with_pair_mut(*pair_id, |p| {
            if full {
                p.size = 0;
                p.long_collateral = 0;
                p.short_collateral = 0;
                p.status = PairStatus::Closed;
            } else {
                p.size -= closed_size;
                p.long_collateral -= long_released;
                p.short_collateral -= short_released;
            }
            p.updated_at = now;
        });
        self.state.adjust_open_interest(&pair.symbol, -closed_size);
    }
}
