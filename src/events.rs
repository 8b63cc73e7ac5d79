//! Structured events emitted on every vault and strategy state transition.
//!
//! Events are serialized to JSON and written through `tracing` so operators
//! and log-driven workflows can consume them without scraping free-form
//! messages.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

/// Vault-side ledger events.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum VaultEvent {
    Deposited {
        owner: String,
        assets: Decimal,
        shares: Decimal,
    },
    WithdrawRequested {
        key: u64,
        owner: String,
        requested_assets: Decimal,
        instant_assets: Decimal,
        is_prioritized: bool,
    },
    WithdrawClaimed {
        key: u64,
        owner: String,
        assets: Decimal,
    },
    WatermarkAdvanced {
        prioritized: Decimal,
        ordinary: Decimal,
        to_idle: Decimal,
    },
    FeesAccrued {
        management_shares: Decimal,
        performance_shares: Decimal,
        high_water_mark: Decimal,
    },
    StatusChanged {
        status: String,
    },
}

/// Strategy-side orchestration events.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum StrategyEvent {
    Utilized {
        assets: Decimal,
        spot_notional: Decimal,
        collateral_delta: Decimal,
    },
    Deutilized {
        assets: Decimal,
        collateral_delta: Decimal,
        full_close: bool,
    },
    AdjustmentSettled {
        is_increase: bool,
        returned_assets: Decimal,
    },
    UpkeepPerformed {
        action: String,
    },
    EmergencyDeleverage {
        leverage: Decimal,
        size_delta_tokens: Decimal,
    },
    InvariantFault {
        detail: String,
    },
    StatusChanged {
        status: String,
    },
}

/// Envelope stamping an event with its emission time.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord<E: Serialize> {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: E,
}

impl VaultEvent {
    /// Emit as a structured log record for workflow parsing.
    pub fn emit(&self, now: DateTime<Utc>) {
        let record = EventRecord { timestamp: now, event: self.clone() };
        let json = serde_json::to_string(&record).unwrap_or_default();
        info!(target: "vault_event", "VAULT_EVENT: {}", json);
    }
}

impl StrategyEvent {
    /// Emit as a structured log record for workflow parsing.
    ///
    /// Invariant faults are warnings; everything else is informational.
    pub fn emit(&self, now: DateTime<Utc>) {
        let record = EventRecord { timestamp: now, event: self.clone() };
        let json = serde_json::to_string(&record).unwrap_or_default();
        match self {
            StrategyEvent::InvariantFault { .. } | StrategyEvent::EmergencyDeleverage { .. } => {
                warn!(target: "strategy_event", "STRATEGY_EVENT: {}", json)
            }
            _ => info!(target: "strategy_event", "STRATEGY_EVENT: {}", json),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = VaultEvent::Deposited {
            owner: "alice".to_string(),
            assets: dec!(1000),
            shares: dec!(1000),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Deposited\""));
        assert!(json.contains("\"owner\":\"alice\""));
    }

    #[test]
    fn test_record_envelope_flattens_event() {
        let record = EventRecord {
            timestamp: Utc::now(),
            event: StrategyEvent::UpkeepPerformed { action: "RebalanceUp".to_string() },
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"timestamp\""));
        assert!(json.contains("\"type\":\"UpkeepPerformed\""));
    }
}
