//! The utilize/deutilize state machine.
//!
//! The orchestrator holds no handles to the legs: the engine performs leg
//! I/O and reports the outcomes here, so every transition is a deterministic
//! function of explicit inputs and can be unit-tested without live legs.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::StrategyConfig;
use crate::error::StrategyError;
use crate::legs::AdjustPositionResult;

/// Orchestration status. Only the matching leg callback returns an in-flight
/// status to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StrategyStatus {
    Idle,
    AwaitingFinalUtilization,
    Deutilizing,
}

/// Amount selector for deutilization; `All` closes both legs entirely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeutilizeAmount {
    Exact(Decimal),
    All,
}

/// The single in-flight adjustment slot, holding the issued intent.
///
/// Not a queue, by design: a second order in either direction is rejected
/// until the completion clears this slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum PendingAdjustment {
    Increase {
        /// Idle assets pulled from the vault for this utilization.
        assets: Decimal,
        size_delta_in_tokens: Decimal,
        collateral_delta: Decimal,
    },
    Decrease {
        size_delta_in_tokens: Decimal,
        collateral_delta: Decimal,
        /// Spot sale proceeds held until the hedge side confirms.
        held_proceeds: Decimal,
        full_close: bool,
        /// Set when this decrease was issued to bring leverage down.
        deleverage: bool,
    },
}

/// A validated, settled adjustment for the engine to apply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Settlement {
    Increase {
        assets: Decimal,
        collateral_delta: Decimal,
    },
    Decrease {
        /// Held spot proceeds plus the collateral the hedge leg released.
        returned_assets: Decimal,
        full_close: bool,
    },
}

/// Split a utilization amount `a` into spot notional and hedge collateral so
/// that post-settlement hedge notional matches spot notional at the target
/// leverage: `s = a·L/(L+1)`, `c = a − s`.
pub fn split_utilization(amount: Decimal, target_leverage: Decimal) -> (Decimal, Decimal) {
    let spot_notional = amount * target_leverage / (target_leverage + Decimal::ONE);
    (spot_notional, amount - spot_notional)
}

/// Position size reduction (in tokens) bringing leverage back to target when
/// the freed notional is returned to the vault and net balance is untouched:
/// `(S − Δ)·p = L·NB  ⇒  Δ = S − L·NB/p`.
pub fn deleverage_size_delta(
    size_in_tokens: Decimal,
    net_balance: Decimal,
    price: Decimal,
    target_leverage: Decimal,
) -> Decimal {
    if price <= Decimal::ZERO || size_in_tokens <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let keep = (target_leverage * net_balance / price).max(Decimal::ZERO);
    (size_in_tokens - keep).clamp(Decimal::ZERO, size_in_tokens)
}

/// Collateral beyond what the target leverage requires for the current
/// position size: `NB − S·p/L`.
pub fn excess_collateral(
    size_in_tokens: Decimal,
    net_balance: Decimal,
    price: Decimal,
    target_leverage: Decimal,
) -> Decimal {
    if target_leverage <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let required = size_in_tokens * price / target_leverage;
    (net_balance - required).clamp(Decimal::ZERO, net_balance)
}

/// The strategy state machine.
#[derive(Debug, Clone)]
pub struct StrategyOrchestrator {
    config: StrategyConfig,
    status: StrategyStatus,
    pending: Option<PendingAdjustment>,
    processing_rebalance_down: bool,
    paused: bool,
    stopped: bool,
}

impl StrategyOrchestrator {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            status: StrategyStatus::Idle,
            pending: None,
            processing_rebalance_down: false,
            paused: false,
            stopped: false,
        }
    }

    // ---- views -----------------------------------------------------------

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn status(&self) -> StrategyStatus {
        self.status
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn processing_rebalance_down(&self) -> bool {
        self.processing_rebalance_down
    }

    pub fn pending(&self) -> Option<&PendingAdjustment> {
        self.pending.as_ref()
    }

    /// Collateral currently in flight toward the hedge leg.
    pub fn pending_increase_collateral(&self) -> Decimal {
        match self.pending {
            Some(PendingAdjustment::Increase { collateral_delta, .. }) => collateral_delta,
            _ => Decimal::ZERO,
        }
    }

    /// Collateral currently in flight out of the hedge leg.
    pub fn pending_decrease_collateral(&self) -> Decimal {
        match self.pending {
            Some(PendingAdjustment::Decrease { collateral_delta, .. }) => collateral_delta,
            _ => Decimal::ZERO,
        }
    }

    /// Assets owned by the strategy but not yet visible in either leg:
    /// collateral in transit on an increase, held sale proceeds on a
    /// decrease.
    pub fn in_flight_assets(&self) -> Decimal {
        match self.pending {
            Some(PendingAdjustment::Increase { collateral_delta, .. }) => collateral_delta,
            Some(PendingAdjustment::Decrease { held_proceeds, .. }) => held_proceeds,
            None => Decimal::ZERO,
        }
    }

    // ---- admission checks ------------------------------------------------

    pub fn ensure_can_utilize(&self) -> Result<(), StrategyError> {
        if self.paused || self.stopped {
            return Err(StrategyError::StrategyPaused);
        }
        match (&self.pending, self.status) {
            (None, StrategyStatus::Idle) => Ok(()),
            (Some(PendingAdjustment::Increase { .. }), _) => Err(StrategyError::AlreadyPending),
            _ => Err(StrategyError::StatusNotIdle),
        }
    }

    /// Deutilize stays available while stopped: stopping is exactly a forced
    /// full deutilization.
    pub fn ensure_can_deutilize(&self) -> Result<(), StrategyError> {
        if self.paused {
            return Err(StrategyError::StrategyPaused);
        }
        match (&self.pending, self.status) {
            (None, StrategyStatus::Idle) => Ok(()),
            (Some(PendingAdjustment::Decrease { .. }), _) => Err(StrategyError::AlreadyPending),
            _ => Err(StrategyError::StatusNotIdle),
        }
    }

    // ---- transitions -----------------------------------------------------

    /// Record an issued utilization. Caller has run `ensure_can_utilize` and
    /// placed both leg orders.
    pub fn record_utilize(
        &mut self,
        assets: Decimal,
        size_delta_in_tokens: Decimal,
        collateral_delta: Decimal,
    ) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(PendingAdjustment::Increase {
            assets,
            size_delta_in_tokens,
            collateral_delta,
        });
        self.status = StrategyStatus::AwaitingFinalUtilization;
    }

    /// Record an issued deutilization or deleverage decrease.
    pub fn record_deutilize(
        &mut self,
        size_delta_in_tokens: Decimal,
        collateral_delta: Decimal,
        held_proceeds: Decimal,
        full_close: bool,
        deleverage: bool,
    ) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(PendingAdjustment::Decrease {
            size_delta_in_tokens,
            collateral_delta,
            held_proceeds,
            full_close,
            deleverage,
        });
        if deleverage {
            self.processing_rebalance_down = true;
        }
        self.status = StrategyStatus::Deutilizing;
    }

    /// Validate and clear the in-flight slot against an arriving completion.
    ///
    /// A direction mismatch is an invariant fault: the slot is kept for
    /// inspection, the strategy latches paused, and recovery is an explicit
    /// operator action.
    pub fn apply_callback(
        &mut self,
        result: &AdjustPositionResult,
    ) -> Result<Settlement, StrategyError> {
        let pending = self.pending.ok_or(StrategyError::NoActiveRequest)?;

        let settlement = match pending {
            PendingAdjustment::Increase {
                assets,
                collateral_delta,
                ..
            } if result.is_increase => Settlement::Increase {
                assets,
                collateral_delta,
            },
            PendingAdjustment::Decrease {
                held_proceeds,
                full_close,
                ..
            } if !result.is_increase => Settlement::Decrease {
                returned_assets: held_proceeds + result.executed_collateral_delta,
                full_close,
            },
            _ => {
                self.paused = true;
                return Err(StrategyError::InvalidCallback);
            }
        };

        self.pending = None;
        self.processing_rebalance_down = false;
        self.status = StrategyStatus::Idle;
        Ok(settlement)
    }

    // ---- circuit breaker -------------------------------------------------

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Operator recovery from a pause latch. Does not touch the pending
    /// slot; a still-mismatched completion will latch again.
    pub fn unpause(&mut self) {
        self.paused = false;
    }

    /// Halt new utilization and drive the position to full deutilization
    /// via the keeper.
    pub fn stop(&mut self) {
        self.stopped = true;
    }
}
