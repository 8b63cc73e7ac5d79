//! Management and performance fee accrual.
//!
//! Both fees accrue lazily on any mutating vault call and are minted as
//! shares to the fee recipient. The high-water mark itself grows by the
//! hurdle rate pro-rated for elapsed time, so a single timestamp keeps
//! previews idempotent with actual accrual.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::VaultConfig;
use crate::utils::decimal::{safe_div, year_fraction};

/// Result of one accrual step, previewed or applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeeAccrual {
    pub management_shares: Decimal,
    pub performance_shares: Decimal,
    pub new_high_water_mark: Decimal,
}

/// Lazily-accrued fee state.
#[derive(Debug, Clone, Serialize)]
pub struct FeeState {
    /// Assets-per-share level above which performance fees are due.
    pub high_water_mark: Decimal,
    pub last_accrual: DateTime<Utc>,
    pub management_fee_rate: Decimal,
    pub performance_fee_rate: Decimal,
    pub hurdle_rate: Decimal,
}

impl FeeState {
    pub fn new(config: &VaultConfig, genesis: DateTime<Utc>) -> Self {
        Self {
            high_water_mark: Decimal::ONE,
            last_accrual: genesis,
            management_fee_rate: config.management_fee_rate,
            performance_fee_rate: config.performance_fee_rate,
            hurdle_rate: config.hurdle_rate,
        }
    }

    /// Compute the accrual due at `now` without mutating state.
    ///
    /// Management shares dilute first; the performance fee is charged on the
    /// post-management share price against the hurdle-grown mark. The mark
    /// resets to that price, so the dilution from minting the performance
    /// shares is never charged twice.
    pub fn preview(
        &self,
        now: DateTime<Utc>,
        total_assets: Decimal,
        total_supply: Decimal,
    ) -> FeeAccrual {
        let dt = year_fraction(self.last_accrual, now);

        let management_shares = total_supply * self.management_fee_rate * dt;
        let supply_after_management = total_supply + management_shares;

        let grown_mark = self.high_water_mark * (Decimal::ONE + self.hurdle_rate * dt);

        if supply_after_management == Decimal::ZERO {
            return FeeAccrual {
                management_shares: Decimal::ZERO,
                performance_shares: Decimal::ZERO,
                new_high_water_mark: grown_mark,
            };
        }

        let price = total_assets / supply_after_management;
        if price <= grown_mark || self.performance_fee_rate == Decimal::ZERO {
            return FeeAccrual {
                management_shares,
                performance_shares: Decimal::ZERO,
                new_high_water_mark: grown_mark,
            };
        }

        let profit = (price - grown_mark) * supply_after_management;
        let fee_assets = profit * self.performance_fee_rate;
        let performance_shares = safe_div(fee_assets, price);

        FeeAccrual {
            management_shares,
            performance_shares,
            new_high_water_mark: price,
        }
    }

    /// Apply the accrual due at `now`. Equals the preview exactly.
    pub fn accrue(
        &mut self,
        now: DateTime<Utc>,
        total_assets: Decimal,
        total_supply: Decimal,
    ) -> FeeAccrual {
        let accrual = self.preview(now, total_assets, total_supply);
        self.high_water_mark = accrual.new_high_water_mark;
        if now > self.last_accrual {
            self.last_accrual = now;
        }
        accrual
    }
}
