//! Strategy orchestration.
//!
//! Contains the pure state machine driving both legs:
//! - utilize/deutilize lifecycle with one in-flight adjustment slot
//! - callback validation against the issued intent
//! - the keeper upkeep planner and pending-utilization computation

mod orchestrator;
mod upkeep;

pub use orchestrator::{
    deleverage_size_delta, excess_collateral, split_utilization, DeutilizeAmount,
    PendingAdjustment, Settlement, StrategyOrchestrator, StrategyStatus,
};
pub use upkeep::{
    compute_pending_utilizations, plan_upkeep, PendingUtilizations, UpkeepAction, UpkeepSnapshot,
};
