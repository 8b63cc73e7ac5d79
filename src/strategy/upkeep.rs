//! Keeper upkeep planning.
//!
//! `plan_upkeep` is a pure function of a ledger/leg snapshot, so the
//! priority ladder is unit-testable without live legs. Each planned action
//! makes bounded progress; keepers loop `perform_upkeep` until nothing is
//! planned.

use rust_decimal::Decimal;
use serde::Serialize;

use super::orchestrator::{deleverage_size_delta, excess_collateral, StrategyStatus};
use crate::config::StrategyConfig;
use crate::utils::decimal::{relative_deviation, round_up_to_step};

/// Everything the planner looks at, gathered by the engine in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UpkeepSnapshot {
    pub status: StrategyStatus,
    pub paused: bool,
    pub stopped: bool,
    pub current_leverage: Decimal,
    pub position_size_in_tokens: Decimal,
    pub position_net_balance: Decimal,
    pub spot_exposure: Decimal,
    pub product_price: Decimal,
    pub idle_assets: Decimal,
    pub reserved_execution_cost: Decimal,
    pub outstanding_backlog: Decimal,
    pub hedge_needs_keep: bool,
    /// Effective minimum deutilization order (config floor or the hedge
    /// leg's venue minimum, whichever is larger).
    pub min_deutilize_size: Decimal,
}

/// One bounded maintenance step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum UpkeepAction {
    /// Leverage breached the safety margin: shed size unconditionally.
    EmergencyDeleverage { size_delta_in_tokens: Decimal },
    /// Stopped or shut down with a live position: drain everything.
    FullDeutilize,
    /// Leverage above the band: shed size back to target.
    RebalanceDown { size_delta_in_tokens: Decimal },
    /// Leverage below the band: return excess collateral.
    RebalanceUp { collateral_delta: Decimal },
    /// Spot exposure and hedge size drifted apart: resize the hedge.
    HedgeDeviation {
        size_delta_in_tokens: Decimal,
        increase: bool,
    },
    /// Venue-side maintenance on the hedge leg.
    Keep,
    /// The backlog that reserved execution cost has drained.
    ClearReservedExecutionCost,
}

impl UpkeepAction {
    pub fn name(&self) -> &'static str {
        match self {
            UpkeepAction::EmergencyDeleverage { .. } => "EmergencyDeleverage",
            UpkeepAction::FullDeutilize => "FullDeutilize",
            UpkeepAction::RebalanceDown { .. } => "RebalanceDown",
            UpkeepAction::RebalanceUp { .. } => "RebalanceUp",
            UpkeepAction::HedgeDeviation { .. } => "HedgeDeviation",
            UpkeepAction::Keep => "Keep",
            UpkeepAction::ClearReservedExecutionCost => "ClearReservedExecutionCost",
        }
    }
}

/// What the operator should move next, in asset terms. At most one side is
/// ever non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PendingUtilizations {
    pub utilization: Decimal,
    pub deutilization: Decimal,
    /// The deutilization amount means "close everything".
    pub full_deutilization: bool,
}

impl PendingUtilizations {
    pub fn none() -> Self {
        Self {
            utilization: Decimal::ZERO,
            deutilization: Decimal::ZERO,
            full_deutilization: false,
        }
    }
}

/// Evaluate the priority ladder. Position-changing actions (1–5) require an
/// idle orchestrator; maintenance (6–7) is evaluated regardless.
pub fn plan_upkeep(snap: &UpkeepSnapshot, config: &StrategyConfig) -> Option<UpkeepAction> {
    if snap.paused {
        return None;
    }

    let idle_status = snap.status == StrategyStatus::Idle;
    let has_position = snap.position_size_in_tokens > Decimal::ZERO;

    if idle_status && has_position {
        // 1. Safety margin breach: unconditional, even with zero idle
        //    assets, even if it jumps the withdrawal queue.
        if snap.current_leverage >= config.safe_margin_leverage {
            let delta = bounded_size_delta(snap, config);
            if delta > Decimal::ZERO {
                return Some(UpkeepAction::EmergencyDeleverage {
                    size_delta_in_tokens: delta,
                });
            }
        }
    }

    if idle_status
        && snap.stopped
        && (has_position
            || snap.spot_exposure > Decimal::ZERO
            || snap.position_net_balance > Decimal::ZERO)
    {
        // 2. Stopped with anything still deployed: drain it all.
        return Some(UpkeepAction::FullDeutilize);
    }

    if idle_status && has_position {
        // 3. Ordinary rebalance down.
        if snap.current_leverage > config.max_leverage {
            let delta = bounded_size_delta(snap, config);
            if delta > Decimal::ZERO {
                return Some(UpkeepAction::RebalanceDown {
                    size_delta_in_tokens: delta,
                });
            }
        }

        // 4. Rebalance up: return collateral the band no longer needs.
        if snap.current_leverage < config.min_leverage {
            let excess = excess_collateral(
                snap.position_size_in_tokens,
                snap.position_net_balance,
                snap.product_price,
                config.target_leverage,
            );
            if excess > Decimal::ZERO {
                return Some(UpkeepAction::RebalanceUp {
                    collateral_delta: excess,
                });
            }
        }
    }

    // 5. Hedge size drifted away from spot exposure.
    if idle_status && snap.spot_exposure > Decimal::ZERO {
        let deviation =
            relative_deviation(snap.position_size_in_tokens, snap.spot_exposure);
        if deviation > config.hedge_deviation_threshold {
            let diff = (snap.spot_exposure - snap.position_size_in_tokens).abs();
            return Some(UpkeepAction::HedgeDeviation {
                size_delta_in_tokens: diff,
                increase: snap.position_size_in_tokens < snap.spot_exposure,
            });
        }
    }

    // 6. Leg-specific maintenance.
    if snap.hedge_needs_keep {
        return Some(UpkeepAction::Keep);
    }

    // 7. Release the execution-cost reservation once its backlog drained.
    if snap.reserved_execution_cost > Decimal::ZERO
        && snap.outstanding_backlog == Decimal::ZERO
    {
        return Some(UpkeepAction::ClearReservedExecutionCost);
    }

    None
}

/// Size reduction toward target leverage, capped per call so one upkeep step
/// only makes bounded progress.
fn bounded_size_delta(snap: &UpkeepSnapshot, config: &StrategyConfig) -> Decimal {
    let full = deleverage_size_delta(
        snap.position_size_in_tokens,
        snap.position_net_balance,
        snap.product_price,
        config.target_leverage,
    );
    let step_cap = snap.position_size_in_tokens * config.max_rebalance_step_pct;
    full.min(step_cap)
}

/// Compute what utilize/deutilize the operator owes, in asset terms.
pub fn compute_pending_utilizations(
    snap: &UpkeepSnapshot,
    config: &StrategyConfig,
    total_assets: Decimal,
) -> PendingUtilizations {
    if snap.paused || snap.status != StrategyStatus::Idle {
        return PendingUtilizations::none();
    }

    let idle_available =
        (snap.idle_assets - snap.reserved_execution_cost).max(Decimal::ZERO);
    let returnable =
        snap.spot_exposure * snap.product_price + snap.position_net_balance.max(Decimal::ZERO);

    // Deutilization owed: cover the backlog beyond idle, or shrink the
    // position while leverage sits above the band.
    let backlog_shortfall = (snap.outstanding_backlog - idle_available).max(Decimal::ZERO);
    let deleverage_assets = if snap.position_size_in_tokens > Decimal::ZERO
        && snap.current_leverage > config.max_leverage
    {
        deleverage_size_delta(
            snap.position_size_in_tokens,
            snap.position_net_balance,
            snap.product_price,
            config.target_leverage,
        ) * snap.product_price
    } else {
        Decimal::ZERO
    };

    let mut deutilization = backlog_shortfall.max(deleverage_assets);
    if snap.stopped {
        deutilization = returnable;
    }

    if deutilization > Decimal::ZERO {
        // Round up to the hedge leg's minimum order rather than leaving an
        // unservable remainder.
        if deutilization < snap.min_deutilize_size {
            deutilization = round_up_to_step(deutilization, snap.min_deutilize_size);
        }
        // At or beyond what the legs hold, the answer is "close everything".
        if deutilization >= returnable {
            return PendingUtilizations {
                utilization: Decimal::ZERO,
                deutilization: returnable,
                full_deutilization: true,
            };
        }
        return PendingUtilizations {
            utilization: Decimal::ZERO,
            deutilization,
            full_deutilization: false,
        };
    }

    if snap.stopped || snap.outstanding_backlog > Decimal::ZERO {
        return PendingUtilizations::none();
    }

    // Utilization: idle after reservations, capped per call to bound price
    // impact and leverage overshoot (forces multi-step ramping).
    let cap = config.max_utilize_pct * total_assets;
    PendingUtilizations {
        utilization: idle_available.min(cap),
        deutilization: Decimal::ZERO,
        full_deutilization: false,
    }
}
