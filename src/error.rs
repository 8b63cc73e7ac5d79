//! Typed errors for the vault ledger and strategy orchestrator.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by vault ledger operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VaultError {
    /// Deposit would mint zero shares (share-price inflation guard).
    #[error("deposit would mint zero shares")]
    ZeroShares,

    /// Zero-asset deposit or withdrawal request.
    #[error("zero asset amount")]
    ZeroAssets,

    /// Claim attempted before the watermark covers the request.
    #[error("withdraw request not yet executed")]
    RequestNotExecuted,

    /// Claim attempted on an already-claimed request.
    #[error("withdraw request already claimed")]
    RequestAlreadyClaimed,

    /// Claim attempted by an account that does not own the request.
    #[error("claimer {caller} does not own request held by {owner}")]
    UnauthorizedClaimer { caller: String, owner: String },

    /// No withdraw request exists under this key.
    #[error("unknown withdraw request key {0}")]
    UnknownRequest(u64),

    /// Account holds fewer shares than the redeem asks to burn.
    #[error("insufficient shares: have {available}, need {requested}")]
    InsufficientShares {
        requested: Decimal,
        available: Decimal,
    },

    /// Deposits and mints are rejected while paused.
    #[error("vault is paused")]
    VaultPaused,

    /// Deposits and mints are rejected permanently after shutdown.
    #[error("vault is shut down")]
    VaultShutdown,
}

/// Errors raised by strategy orchestration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    /// A same-direction adjustment is already in flight.
    #[error("adjustment already pending")]
    AlreadyPending,

    /// The orchestrator is not idle, so no new adjustment may be issued.
    #[error("strategy status is not idle")]
    StatusNotIdle,

    /// Utilize called with a zero amount.
    #[error("zero amount utilization")]
    ZeroAmountUtilization,

    /// Utilize asks for more than the vault's unreserved idle assets.
    #[error("insufficient idle balance for utilize: have {available}, need {requested}")]
    InsufficientIdleBalanceForUtilize {
        requested: Decimal,
        available: Decimal,
    },

    /// Deutilize asks to withdraw more collateral than the hedge leg holds.
    #[error("insufficient collateral balance: have {available}, need {requested}")]
    InsufficientCollateralBalance {
        requested: Decimal,
        available: Decimal,
    },

    /// Deutilize asks to sell more product than the spot leg holds.
    #[error("insufficient product balance for deutilize: have {available}, need {requested}")]
    InsufficientProductBalanceForDeutilize {
        requested: Decimal,
        available: Decimal,
    },

    /// A settlement callback arrived that does not match the issued intent.
    /// The strategy latches paused; recovery is an operator action.
    #[error("callback does not match the pending adjustment")]
    InvalidCallback,

    /// A settlement callback arrived with nothing in flight.
    #[error("no active adjustment to settle")]
    NoActiveRequest,

    /// New utilize/deutilize rejected while paused or stopped.
    #[error("strategy is paused")]
    StrategyPaused,

    /// The spot leg rejected a swap.
    #[error("spot leg rejected swap: {0}")]
    SpotLegFailure(String),

    /// The hedge leg rejected an adjustment order.
    #[error("hedge leg rejected adjustment: {0}")]
    HedgeLegFailure(String),

    /// The oracle could not price the asset.
    #[error("oracle failure: {0}")]
    OracleFailure(String),
}

/// Unified error surface for engine entry points, which touch both ledgers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
}
