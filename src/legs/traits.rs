//! Venue-agnostic capability traits for the two legs of the basis trade.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Execution venue selector for spot swaps, opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapKind {
    /// Swap directly against the leg's native pool.
    Direct,
    /// Route through an external aggregator using caller-supplied calldata.
    Aggregated,
}

/// Order issued to the hedge leg.
///
/// A single adjustment may change position size, collateral, or both;
/// `is_increase` fixes the direction for the whole order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustPositionParams {
    /// Position size change in product tokens.
    pub size_delta_in_tokens: Decimal,
    /// Collateral posted (increase) or withdrawn (decrease), in asset terms.
    pub collateral_delta_amount: Decimal,
    pub is_increase: bool,
}

/// Asynchronous completion payload for a previously issued adjustment.
///
/// Delivered out-of-band by the hedge venue once the order settles; the
/// orchestrator validates it against the stored intent before applying it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustPositionResult {
    pub order_id: u64,
    pub is_increase: bool,
    /// Size change actually executed, in product tokens.
    pub executed_size_delta_in_tokens: Decimal,
    /// Collateral actually posted or released, in asset terms.
    pub executed_collateral_delta: Decimal,
}

/// Spot side: swaps between the deposit asset and the underlying product.
#[async_trait]
pub trait SpotLeg: Send + Sync {
    /// Swap `asset_amount` of the deposit asset into product.
    /// Returns the product amount received.
    async fn buy(&self, asset_amount: Decimal, kind: SwapKind, swap_data: &[u8])
        -> anyhow::Result<Decimal>;

    /// Swap `product_amount` of product back into the deposit asset.
    /// Returns the asset amount received.
    async fn sell(&self, product_amount: Decimal, kind: SwapKind, swap_data: &[u8])
        -> anyhow::Result<Decimal>;

    /// Settled product exposure held by this leg, in product tokens.
    async fn exposure(&self) -> Decimal;
}

/// Hedge side: a leveraged short position, settled asynchronously.
#[async_trait]
pub trait HedgeLeg: Send + Sync {
    /// Issue an adjustment order. Returns the order id; completion arrives
    /// later as an [`AdjustPositionResult`] payload.
    async fn adjust_position(&self, params: AdjustPositionParams) -> anyhow::Result<u64>;

    /// Short position size, in product tokens.
    async fn position_size_in_tokens(&self) -> Decimal;

    /// Net collateral backing the position, in asset terms.
    async fn position_net_balance(&self) -> Decimal;

    /// Position notional divided by net collateral; zero with no position.
    async fn current_leverage(&self) -> Decimal;

    /// Whether venue-side maintenance (funding claim, collateral true-up)
    /// has accumulated past the leg's threshold.
    async fn need_keep(&self) -> bool;

    /// Perform venue-side maintenance. Returns the amount trued up.
    async fn keep(&self) -> anyhow::Result<Decimal>;

    /// Minimum adjustment order the venue accepts, in asset terms.
    fn min_order_size(&self) -> Decimal;
}
