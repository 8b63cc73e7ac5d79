//! Deterministic mock legs for simulation and tests.
//!
//! The mock hedge leg mirrors the async settlement model of a real perp
//! venue: `adjust_position` only parks the order, and a separate
//! `settle_next` call applies it and produces the completion payload that a
//! venue would deliver out-of-band.

use super::traits::{AdjustPositionParams, AdjustPositionResult, HedgeLeg, SpotLeg, SwapKind};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Simulated spot leg holding product exposure, filling swaps at a set price.
pub struct MockSpotLeg {
    exposure: Arc<RwLock<Decimal>>,
    price: Arc<RwLock<Decimal>>,
    /// Swap fee applied to every fill (0.0005 = 5 bps).
    fee_rate: Decimal,
}

impl MockSpotLeg {
    pub fn new(price: Decimal) -> Self {
        Self {
            exposure: Arc::new(RwLock::new(Decimal::ZERO)),
            price: Arc::new(RwLock::new(price)),
            fee_rate: dec!(0.0005),
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Update the simulated fill price.
    pub async fn set_price(&self, price: Decimal) {
        *self.price.write().await = price;
    }
}

#[async_trait]
impl SpotLeg for MockSpotLeg {
    async fn buy(
        &self,
        asset_amount: Decimal,
        kind: SwapKind,
        _swap_data: &[u8],
    ) -> anyhow::Result<Decimal> {
        anyhow::ensure!(asset_amount > Decimal::ZERO, "zero buy amount");
        let price = *self.price.read().await;
        anyhow::ensure!(price > Decimal::ZERO, "no spot price set");

        let product_out = asset_amount * (Decimal::ONE - self.fee_rate) / price;
        *self.exposure.write().await += product_out;

        debug!(%asset_amount, %product_out, ?kind, "mock spot buy filled");
        Ok(product_out)
    }

    async fn sell(
        &self,
        product_amount: Decimal,
        kind: SwapKind,
        _swap_data: &[u8],
    ) -> anyhow::Result<Decimal> {
        anyhow::ensure!(product_amount > Decimal::ZERO, "zero sell amount");
        let price = *self.price.read().await;

        let mut exposure = self.exposure.write().await;
        anyhow::ensure!(
            *exposure >= product_amount,
            "sell exceeds exposure: have {}, need {}",
            *exposure,
            product_amount
        );
        *exposure -= product_amount;

        let asset_out = product_amount * (Decimal::ONE - self.fee_rate) * price;
        debug!(%product_amount, %asset_out, ?kind, "mock spot sell filled");
        Ok(asset_out)
    }

    async fn exposure(&self) -> Decimal {
        *self.exposure.read().await
    }
}

#[derive(Debug, Default)]
struct HedgePosition {
    size_in_tokens: Decimal,
    net_balance: Decimal,
    mark_price: Decimal,
    unclaimed_funding: Decimal,
    pending: Option<(u64, AdjustPositionParams)>,
}

/// Simulated leveraged short with a single in-flight order slot.
pub struct MockHedgeLeg {
    position: Arc<RwLock<HedgePosition>>,
    order_id_counter: AtomicU64,
    min_order_size: Decimal,
    keep_threshold: Decimal,
}

impl MockHedgeLeg {
    pub fn new(mark_price: Decimal) -> Self {
        let position = HedgePosition {
            mark_price,
            ..Default::default()
        };
        Self {
            position: Arc::new(RwLock::new(position)),
            order_id_counter: AtomicU64::new(1),
            min_order_size: dec!(10),
            keep_threshold: dec!(1),
        }
    }

    pub fn with_min_order_size(mut self, min: Decimal) -> Self {
        self.min_order_size = min;
        self
    }

    /// Move the mark price, applying short-position PnL to the net balance.
    pub async fn set_mark_price(&self, price: Decimal) {
        let mut pos = self.position.write().await;
        let pnl = (pos.mark_price - price) * pos.size_in_tokens;
        pos.net_balance += pnl;
        pos.mark_price = price;
    }

    /// Accrue funding owed to the position (claimed via `keep`).
    pub async fn accrue_funding(&self, amount: Decimal) {
        self.position.write().await.unclaimed_funding += amount;
    }

    /// Apply the parked order and return the completion payload the venue
    /// would deliver. `None` if nothing is in flight.
    pub async fn settle_next(&self) -> Option<AdjustPositionResult> {
        let mut pos = self.position.write().await;
        let (order_id, params) = pos.pending.take()?;

        if params.is_increase {
            pos.size_in_tokens += params.size_delta_in_tokens;
            pos.net_balance += params.collateral_delta_amount;
        } else {
            pos.size_in_tokens -= params.size_delta_in_tokens;
            pos.net_balance -= params.collateral_delta_amount;
        }

        debug!(
            order_id,
            size = %pos.size_in_tokens,
            net_balance = %pos.net_balance,
            "mock hedge order settled"
        );

        Some(AdjustPositionResult {
            order_id,
            is_increase: params.is_increase,
            executed_size_delta_in_tokens: params.size_delta_in_tokens,
            executed_collateral_delta: params.collateral_delta_amount,
        })
    }

    /// Drop the parked order without applying it. Used to simulate a venue
    /// delivering a corrupted or mismatched completion.
    pub async fn discard_pending(&self) -> Option<AdjustPositionParams> {
        self.position.write().await.pending.take().map(|(_, p)| p)
    }
}

#[async_trait]
impl HedgeLeg for MockHedgeLeg {
    async fn adjust_position(&self, params: AdjustPositionParams) -> anyhow::Result<u64> {
        let mut pos = self.position.write().await;
        anyhow::ensure!(pos.pending.is_none(), "adjustment already pending");

        if !params.is_increase {
            anyhow::ensure!(
                params.collateral_delta_amount <= pos.net_balance,
                "collateral withdrawal exceeds net balance: have {}, need {}",
                pos.net_balance,
                params.collateral_delta_amount
            );
            anyhow::ensure!(
                params.size_delta_in_tokens <= pos.size_in_tokens,
                "size decrease exceeds position: have {}, need {}",
                pos.size_in_tokens,
                params.size_delta_in_tokens
            );
        }

        let order_id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        pos.pending = Some((order_id, params));
        Ok(order_id)
    }

    async fn position_size_in_tokens(&self) -> Decimal {
        self.position.read().await.size_in_tokens
    }

    async fn position_net_balance(&self) -> Decimal {
        self.position.read().await.net_balance
    }

    async fn current_leverage(&self) -> Decimal {
        let pos = self.position.read().await;
        if pos.size_in_tokens == Decimal::ZERO {
            return Decimal::ZERO;
        }
        if pos.net_balance <= Decimal::ZERO {
            // Collateral wiped out; report an unmistakably critical level.
            return Decimal::MAX;
        }
        pos.size_in_tokens * pos.mark_price / pos.net_balance
    }

    async fn need_keep(&self) -> bool {
        self.position.read().await.unclaimed_funding >= self.keep_threshold
    }

    async fn keep(&self) -> anyhow::Result<Decimal> {
        let mut pos = self.position.write().await;
        let claimed = pos.unclaimed_funding;
        pos.unclaimed_funding = Decimal::ZERO;
        pos.net_balance += claimed;
        Ok(claimed)
    }

    fn min_order_size(&self) -> Decimal {
        self.min_order_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spot_round_trip_charges_fees() {
        let spot = MockSpotLeg::new(dec!(2000));
        let product = spot.buy(dec!(2000), SwapKind::Direct, &[]).await.unwrap();
        assert_eq!(product, dec!(0.9995));
        assert_eq!(spot.exposure().await, product);

        let asset = spot.sell(product, SwapKind::Direct, &[]).await.unwrap();
        assert!(asset < dec!(2000));
        assert_eq!(spot.exposure().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_sell_beyond_exposure_rejected() {
        let spot = MockSpotLeg::new(dec!(2000));
        assert!(spot.sell(dec!(1), SwapKind::Direct, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_hedge_orders_settle_asynchronously() {
        let hedge = MockHedgeLeg::new(dec!(2000));
        let order_id = hedge
            .adjust_position(AdjustPositionParams {
                size_delta_in_tokens: dec!(1),
                collateral_delta_amount: dec!(1000),
                is_increase: true,
            })
            .await
            .unwrap();

        // Nothing applied until settlement.
        assert_eq!(hedge.position_size_in_tokens().await, Decimal::ZERO);

        let result = hedge.settle_next().await.unwrap();
        assert_eq!(result.order_id, order_id);
        assert!(result.is_increase);
        assert_eq!(hedge.position_size_in_tokens().await, dec!(1));
        assert_eq!(hedge.position_net_balance().await, dec!(1000));
        assert_eq!(hedge.current_leverage().await, dec!(2));
    }

    #[tokio::test]
    async fn test_second_order_rejected_while_pending() {
        let hedge = MockHedgeLeg::new(dec!(2000));
        let params = AdjustPositionParams {
            size_delta_in_tokens: dec!(1),
            collateral_delta_amount: dec!(1000),
            is_increase: true,
        };
        hedge.adjust_position(params).await.unwrap();
        assert!(hedge.adjust_position(params).await.is_err());
    }

    #[tokio::test]
    async fn test_short_pnl_on_price_move() {
        let hedge = MockHedgeLeg::new(dec!(2000));
        hedge
            .adjust_position(AdjustPositionParams {
                size_delta_in_tokens: dec!(1),
                collateral_delta_amount: dec!(1000),
                is_increase: true,
            })
            .await
            .unwrap();
        hedge.settle_next().await.unwrap();

        // Price up 500: a 1-token short loses 500 of collateral.
        hedge.set_mark_price(dec!(2500)).await;
        assert_eq!(hedge.position_net_balance().await, dec!(500));
        assert_eq!(hedge.current_leverage().await, dec!(5));
    }

    #[tokio::test]
    async fn test_keep_claims_funding() {
        let hedge = MockHedgeLeg::new(dec!(2000));
        hedge.accrue_funding(dec!(0.5)).await;
        assert!(!hedge.need_keep().await);
        hedge.accrue_funding(dec!(0.7)).await;
        assert!(hedge.need_keep().await);

        let claimed = hedge.keep().await.unwrap();
        assert_eq!(claimed, dec!(1.2));
        assert_eq!(hedge.position_net_balance().await, dec!(1.2));
        assert!(!hedge.need_keep().await);
    }

    #[tokio::test]
    async fn test_collateral_withdrawal_validated_up_front() {
        let hedge = MockHedgeLeg::new(dec!(2000));
        let err = hedge
            .adjust_position(AdjustPositionParams {
                size_delta_in_tokens: Decimal::ZERO,
                collateral_delta_amount: dec!(100),
                is_increase: false,
            })
            .await;
        assert!(err.is_err());
    }
}
