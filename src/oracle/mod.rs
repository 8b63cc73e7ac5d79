//! Price oracle capability.
//!
//! The core consumes prices and conversions; freshness and staleness are the
//! oracle implementation's responsibility.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::utils::decimal::safe_div;

/// Trait for price sources quoting assets in vault-denomination terms.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Price of one unit of `asset` in the vault's deposit asset.
    async fn price(&self, asset: &str) -> anyhow::Result<Decimal>;

    /// Convert `amount` of `from` into units of `to`.
    async fn convert(&self, from: &str, to: &str, amount: Decimal) -> anyhow::Result<Decimal>;
}

/// Deterministic in-memory oracle for simulation and tests.
///
/// Prices are set explicitly; unknown assets are an error rather than a
/// silent zero.
pub struct FixedOracle {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl FixedOracle {
    pub fn new() -> Self {
        Self {
            prices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set or update the quoted price for an asset.
    pub async fn set_price(&self, asset: &str, price: Decimal) {
        self.prices.write().await.insert(asset.to_string(), price);
    }
}

impl Default for FixedOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Oracle for FixedOracle {
    async fn price(&self, asset: &str) -> anyhow::Result<Decimal> {
        self.prices
            .read()
            .await
            .get(asset)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no price configured for {asset}"))
    }

    async fn convert(&self, from: &str, to: &str, amount: Decimal) -> anyhow::Result<Decimal> {
        let from_price = self.price(from).await?;
        let to_price = self.price(to).await?;
        Ok(amount * safe_div(from_price, to_price))
    }
}
