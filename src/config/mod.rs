//! Configuration management for the basis vault.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Vault asset/product naming and fee parameters
    #[serde(default)]
    pub vault: VaultConfig,
    /// Strategy leverage band and utilization parameters
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Keeper loop parameters
    #[serde(default)]
    pub keeper: KeeperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Symbol of the deposit asset (vault denomination)
    #[serde(default = "default_asset_symbol")]
    pub asset_symbol: String,
    /// Symbol of the spot product held by the strategy
    #[serde(default = "default_product_symbol")]
    pub product_symbol: String,
    /// Account credited with fee shares
    #[serde(default = "default_fee_recipient")]
    pub fee_recipient: String,
    /// Annual management fee rate (0.0-1.0)
    #[serde(default = "default_management_fee_rate")]
    pub management_fee_rate: Decimal,
    /// Performance fee rate on profit above the hurdle (0.0-1.0)
    #[serde(default = "default_performance_fee_rate")]
    pub performance_fee_rate: Decimal,
    /// Annual hurdle rate grown into the high-water mark (0.0-1.0)
    #[serde(default = "default_hurdle_rate")]
    pub hurdle_rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Leverage targeted by utilize/deutilize sizing
    #[serde(default = "default_target_leverage")]
    pub target_leverage: Decimal,
    /// Lower edge of the no-action leverage band
    #[serde(default = "default_min_leverage")]
    pub min_leverage: Decimal,
    /// Upper edge of the no-action leverage band
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    /// Leverage at which deleveraging becomes unconditional
    #[serde(default = "default_safe_margin_leverage")]
    pub safe_margin_leverage: Decimal,
    /// Per-call utilization cap as a fraction of TVL (forces multi-step ramps)
    #[serde(default = "default_max_utilize_pct")]
    pub max_utilize_pct: Decimal,
    /// Minimum deutilization order in asset terms (hedge leg minimum)
    #[serde(default = "default_min_deutilize_size")]
    pub min_deutilize_size: Decimal,
    /// Per-call cap on rebalance size as a fraction of position notional
    #[serde(default = "default_max_rebalance_step_pct")]
    pub max_rebalance_step_pct: Decimal,
    /// Spot-vs-hedge size drift that triggers a correction (0.0-1.0)
    #[serde(default = "default_hedge_deviation_threshold")]
    pub hedge_deviation_threshold: Decimal,
    /// Idle assets reserved for leg execution costs while a backlog drains
    #[serde(default = "default_execution_cost_buffer")]
    pub execution_cost_buffer: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Seconds between keeper evaluations
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Safety bound on perform_upkeep calls per keeper cycle
    #[serde(default = "default_max_upkeep_iterations")]
    pub max_upkeep_iterations: u32,
}

// Default value functions
fn default_asset_symbol() -> String {
    "USDC".to_string()
}

fn default_product_symbol() -> String {
    "ETH".to_string()
}

fn default_fee_recipient() -> String {
    "treasury".to_string()
}

fn default_management_fee_rate() -> Decimal {
    Decimal::new(2, 2) // 0.02 (2%/yr)
}

fn default_performance_fee_rate() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_hurdle_rate() -> Decimal {
    Decimal::new(5, 2) // 0.05 (5%/yr)
}

fn default_target_leverage() -> Decimal {
    Decimal::new(2, 0) // 2.0x
}

fn default_min_leverage() -> Decimal {
    Decimal::new(17, 1) // 1.7x
}

fn default_max_leverage() -> Decimal {
    Decimal::new(23, 1) // 2.3x
}

fn default_safe_margin_leverage() -> Decimal {
    Decimal::new(3, 0) // 3.0x
}

fn default_max_utilize_pct() -> Decimal {
    Decimal::new(25, 2) // 0.25 of TVL per utilize call
}

fn default_min_deutilize_size() -> Decimal {
    Decimal::new(10, 0) // 10 asset units
}

fn default_max_rebalance_step_pct() -> Decimal {
    Decimal::new(25, 2) // 0.25 of position notional per upkeep step
}

fn default_hedge_deviation_threshold() -> Decimal {
    Decimal::new(2, 2) // 0.02 (2% size drift)
}

fn default_execution_cost_buffer() -> Decimal {
    Decimal::new(5, 0) // 5 asset units reserved per drain episode
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_upkeep_iterations() -> u32 {
    10
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("BV"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.strategy.min_leverage >= Decimal::ONE,
            "min_leverage must be at least 1"
        );

        anyhow::ensure!(
            self.strategy.min_leverage <= self.strategy.target_leverage
                && self.strategy.target_leverage <= self.strategy.max_leverage
                && self.strategy.max_leverage < self.strategy.safe_margin_leverage,
            "leverage band must satisfy min <= target <= max < safe_margin"
        );

        anyhow::ensure!(
            self.strategy.max_utilize_pct > Decimal::ZERO
                && self.strategy.max_utilize_pct <= Decimal::ONE,
            "max_utilize_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.strategy.max_rebalance_step_pct > Decimal::ZERO
                && self.strategy.max_rebalance_step_pct <= Decimal::ONE,
            "max_rebalance_step_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.vault.management_fee_rate >= Decimal::ZERO
                && self.vault.management_fee_rate < Decimal::ONE,
            "management_fee_rate must be in [0, 1)"
        );

        anyhow::ensure!(
            self.vault.performance_fee_rate >= Decimal::ZERO
                && self.vault.performance_fee_rate < Decimal::ONE,
            "performance_fee_rate must be in [0, 1)"
        );

        anyhow::ensure!(
            !self.vault.fee_recipient.is_empty(),
            "fee_recipient must not be empty"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault: VaultConfig::default(),
            strategy: StrategyConfig::default(),
            keeper: KeeperConfig::default(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            asset_symbol: default_asset_symbol(),
            product_symbol: default_product_symbol(),
            fee_recipient: default_fee_recipient(),
            management_fee_rate: default_management_fee_rate(),
            performance_fee_rate: default_performance_fee_rate(),
            hurdle_rate: default_hurdle_rate(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            target_leverage: default_target_leverage(),
            min_leverage: default_min_leverage(),
            max_leverage: default_max_leverage(),
            safe_margin_leverage: default_safe_margin_leverage(),
            max_utilize_pct: default_max_utilize_pct(),
            min_deutilize_size: default_min_deutilize_size(),
            max_rebalance_step_pct: default_max_rebalance_step_pct(),
            hedge_deviation_threshold: default_hedge_deviation_threshold(),
            execution_cost_buffer: default_execution_cost_buffer(),
        }
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_upkeep_iterations: default_max_upkeep_iterations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_leverage_band_rejected() {
        let mut config = Config::default();
        config.strategy.max_leverage = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_safe_margin_must_exceed_max() {
        let mut config = Config::default();
        config.strategy.safe_margin_leverage = config.strategy.max_leverage;
        assert!(config.validate().is_err());
    }
}
