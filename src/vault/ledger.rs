//! Share accounting and the withdrawal-request ledger.
//!
//! The ledger is a plain deterministic state machine: every method runs to
//! completion, takes the current time and a snapshot of strategy-held assets
//! as explicit arguments, and performs no I/O. The engine sequences leg
//! calls around it.
//!
//! Asset buckets:
//! - `idle_assets` — free assets, available for utilization or instant
//!   payout of withdrawal requests.
//! - `claimable_assets` — assets already consumed by a watermark advance and
//!   reserved for executed-but-unclaimed requests. Shares backing them are
//!   burned, so they are excluded from `total_assets`.
//! - strategy assets — whatever the legs (plus in-flight orders) hold,
//!   reported by the engine per call.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use super::fees::{FeeAccrual, FeeState};
use super::requests::{Consumption, WithdrawRequest, WithdrawalLedger};
use crate::config::VaultConfig;
use crate::error::VaultError;

/// Vault lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VaultStatus {
    Active,
    /// Deposits and mints rejected; withdrawals and claims still served.
    Paused,
    /// Terminal: like paused, but never reactivated.
    Shutdown,
}

/// Result of a withdraw/redeem request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutcome {
    pub burned_shares: Decimal,
    /// Total asset value owed for the burned shares.
    pub value: Decimal,
    /// Portion paid immediately from idle assets.
    pub instant_assets: Decimal,
    /// Key of the queued request for the shortfall, if any.
    pub request_key: Option<u64>,
}

/// Point-in-time ledger view used by invariant checks: snapshots are taken
/// strictly before and after a state-changing call and compared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub total_assets: Decimal,
    pub total_supply: Decimal,
    pub share_price: Decimal,
    pub idle_assets: Decimal,
    pub claimable_assets: Decimal,
    pub processed_withdraw_assets: Decimal,
    pub prioritized_processed_withdraw_assets: Decimal,
}

/// The vault's share and withdrawal ledger.
#[derive(Debug, Clone)]
pub struct VaultLedger {
    status: VaultStatus,
    balances: HashMap<String, Decimal>,
    total_supply: Decimal,
    idle_assets: Decimal,
    claimable_assets: Decimal,
    withdrawals: WithdrawalLedger,
    requests: HashMap<u64, WithdrawRequest>,
    next_request_key: u64,
    unclaimed_requests: u64,
    reserved_execution_cost: Decimal,
    execution_cost_buffer: Decimal,
    fees: FeeState,
    fee_recipient: String,
    prioritized_accounts: HashSet<String>,
    paid_out_assets: Decimal,
}

impl VaultLedger {
    pub fn new(config: &VaultConfig, execution_cost_buffer: Decimal, genesis: DateTime<Utc>) -> Self {
        Self {
            status: VaultStatus::Active,
            balances: HashMap::new(),
            total_supply: Decimal::ZERO,
            idle_assets: Decimal::ZERO,
            claimable_assets: Decimal::ZERO,
            withdrawals: WithdrawalLedger::new(),
            requests: HashMap::new(),
            next_request_key: 1,
            unclaimed_requests: 0,
            reserved_execution_cost: Decimal::ZERO,
            execution_cost_buffer,
            fees: FeeState::new(config, genesis),
            fee_recipient: config.fee_recipient.clone(),
            prioritized_accounts: HashSet::new(),
            paid_out_assets: Decimal::ZERO,
        }
    }

    // ---- views -----------------------------------------------------------

    pub fn status(&self) -> VaultStatus {
        self.status
    }

    /// Assets backing live shares: idle plus strategy holdings, minus the
    /// queued backlog whose shares are already burned.
    pub fn total_assets(&self, strategy_assets: Decimal) -> Decimal {
        let gross = self.idle_assets + strategy_assets - self.withdrawals.outstanding_total();
        gross.max(Decimal::ZERO)
    }

    pub fn share_price(&self, strategy_assets: Decimal) -> Decimal {
        if self.total_supply == Decimal::ZERO {
            Decimal::ONE
        } else {
            self.total_assets(strategy_assets) / self.total_supply
        }
    }

    /// Multiplication before division keeps whole-supply conversions exact.
    pub fn convert_to_shares(&self, assets: Decimal, strategy_assets: Decimal) -> Decimal {
        let total_assets = self.total_assets(strategy_assets);
        if self.total_supply == Decimal::ZERO || total_assets == Decimal::ZERO {
            assets
        } else {
            assets * self.total_supply / total_assets
        }
    }

    pub fn convert_to_assets(&self, shares: Decimal, strategy_assets: Decimal) -> Decimal {
        if self.total_supply == Decimal::ZERO {
            shares
        } else {
            shares * self.total_assets(strategy_assets) / self.total_supply
        }
    }

    pub fn preview_redeem(&self, shares: Decimal, strategy_assets: Decimal) -> Decimal {
        self.convert_to_assets(shares, strategy_assets)
    }

    pub fn total_supply(&self) -> Decimal {
        self.total_supply
    }

    pub fn balance_of(&self, owner: &str) -> Decimal {
        self.balances.get(owner).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn idle_assets(&self) -> Decimal {
        self.idle_assets
    }

    pub fn claimable_assets(&self) -> Decimal {
        self.claimable_assets
    }

    pub fn paid_out_assets(&self) -> Decimal {
        self.paid_out_assets
    }

    pub fn withdrawals(&self) -> &WithdrawalLedger {
        &self.withdrawals
    }

    pub fn request(&self, key: u64) -> Option<&WithdrawRequest> {
        self.requests.get(&key)
    }

    pub fn reserved_execution_cost(&self) -> Decimal {
        self.reserved_execution_cost
    }

    /// Idle assets net of the execution-cost reservation.
    pub fn utilizable_idle(&self) -> Decimal {
        (self.idle_assets - self.reserved_execution_cost).max(Decimal::ZERO)
    }

    pub fn high_water_mark(&self) -> Decimal {
        self.fees.high_water_mark
    }

    pub fn last_fee_accrual(&self) -> DateTime<Utc> {
        self.fees.last_accrual
    }

    pub fn snapshot(&self, strategy_assets: Decimal) -> LedgerSnapshot {
        LedgerSnapshot {
            total_assets: self.total_assets(strategy_assets),
            total_supply: self.total_supply,
            share_price: self.share_price(strategy_assets),
            idle_assets: self.idle_assets,
            claimable_assets: self.claimable_assets,
            processed_withdraw_assets: self.withdrawals.processed_withdraw_assets,
            prioritized_processed_withdraw_assets: self
                .withdrawals
                .prioritized_processed_withdraw_assets,
        }
    }

    // ---- prioritization --------------------------------------------------

    pub fn add_prioritized_account(&mut self, owner: &str) {
        self.prioritized_accounts.insert(owner.to_string());
    }

    pub fn is_prioritized(&self, owner: &str) -> bool {
        self.prioritized_accounts.contains(owner)
    }

    // ---- fees ------------------------------------------------------------

    /// Accrue fees lazily. Called at the top of every mutating entry point;
    /// also callable directly so previews stay idempotent with accrual.
    pub fn accrue_fees(&mut self, now: DateTime<Utc>, strategy_assets: Decimal) -> FeeAccrual {
        let total_assets = self.total_assets(strategy_assets);
        let accrual = self.fees.accrue(now, total_assets, self.total_supply);
        let minted = accrual.management_shares + accrual.performance_shares;
        if minted > Decimal::ZERO {
            *self
                .balances
                .entry(self.fee_recipient.clone())
                .or_insert(Decimal::ZERO) += minted;
            self.total_supply += minted;
        }
        accrual
    }

    pub fn next_management_fee_shares(
        &self,
        now: DateTime<Utc>,
        strategy_assets: Decimal,
    ) -> Decimal {
        self.fees
            .preview(now, self.total_assets(strategy_assets), self.total_supply)
            .management_shares
    }

    pub fn next_performance_fee_shares(
        &self,
        now: DateTime<Utc>,
        strategy_assets: Decimal,
    ) -> Decimal {
        self.fees
            .preview(now, self.total_assets(strategy_assets), self.total_supply)
            .performance_shares
    }

    // ---- deposits --------------------------------------------------------

    /// Deposit `assets`, minting shares at the current price. Under a
    /// withdrawal backlog the incoming assets advance the prioritized then
    /// ordinary watermark before any remainder becomes idle.
    pub fn deposit(
        &mut self,
        owner: &str,
        assets: Decimal,
        now: DateTime<Utc>,
        strategy_assets: Decimal,
    ) -> Result<(Decimal, Consumption), VaultError> {
        self.ensure_deposits_open()?;
        if assets <= Decimal::ZERO {
            return Err(VaultError::ZeroAssets);
        }
        self.accrue_fees(now, strategy_assets);

        let shares = self.convert_to_shares(assets, strategy_assets);
        if shares <= Decimal::ZERO {
            return Err(VaultError::ZeroShares);
        }

        self.mint_shares(owner, shares);
        let consumed = self.route_incoming_assets(assets);
        Ok((shares, consumed))
    }

    /// Mint an exact share amount, pulling the corresponding assets.
    pub fn mint(
        &mut self,
        owner: &str,
        shares: Decimal,
        now: DateTime<Utc>,
        strategy_assets: Decimal,
    ) -> Result<(Decimal, Consumption), VaultError> {
        self.ensure_deposits_open()?;
        if shares <= Decimal::ZERO {
            return Err(VaultError::ZeroShares);
        }
        self.accrue_fees(now, strategy_assets);

        let assets = self.convert_to_assets(shares, strategy_assets);
        if assets <= Decimal::ZERO {
            return Err(VaultError::ZeroAssets);
        }

        self.mint_shares(owner, shares);
        let consumed = self.route_incoming_assets(assets);
        Ok((assets, consumed))
    }

    // ---- withdrawals -----------------------------------------------------

    /// Burn shares worth exactly `assets` and withdraw them: instantly from
    /// idle where possible, queueing the shortfall.
    pub fn request_withdraw(
        &mut self,
        owner: &str,
        receiver: &str,
        assets: Decimal,
        now: DateTime<Utc>,
        strategy_assets: Decimal,
    ) -> Result<RequestOutcome, VaultError> {
        if assets <= Decimal::ZERO {
            return Err(VaultError::ZeroAssets);
        }
        self.accrue_fees(now, strategy_assets);

        let shares = self.convert_to_shares(assets, strategy_assets);
        if shares <= Decimal::ZERO {
            return Err(VaultError::ZeroShares);
        }
        self.withdraw_inner(owner, receiver, shares, assets, now)
    }

    /// Burn an exact share amount and withdraw its current value.
    pub fn request_redeem(
        &mut self,
        owner: &str,
        receiver: &str,
        shares: Decimal,
        now: DateTime<Utc>,
        strategy_assets: Decimal,
    ) -> Result<RequestOutcome, VaultError> {
        if shares <= Decimal::ZERO {
            return Err(VaultError::ZeroShares);
        }
        self.accrue_fees(now, strategy_assets);

        let assets = self.convert_to_assets(shares, strategy_assets);
        if assets <= Decimal::ZERO {
            return Err(VaultError::ZeroAssets);
        }
        self.withdraw_inner(owner, receiver, shares, assets, now)
    }

    fn withdraw_inner(
        &mut self,
        owner: &str,
        receiver: &str,
        shares: Decimal,
        value: Decimal,
        now: DateTime<Utc>,
    ) -> Result<RequestOutcome, VaultError> {
        let balance = self.balance_of(owner);
        if balance < shares {
            return Err(VaultError::InsufficientShares {
                requested: shares,
                available: balance,
            });
        }

        self.burn_shares(owner, shares);

        let instant = self.idle_assets.min(value);
        self.idle_assets -= instant;
        self.paid_out_assets += instant;

        let shortfall = value - instant;
        let request_key = if shortfall > Decimal::ZERO {
            let prioritized = self.is_prioritized(owner);
            let cumulative = self.withdrawals.append(shortfall, prioritized);

            let key = self.next_request_key;
            self.next_request_key += 1;
            self.unclaimed_requests += 1;
            self.requests.insert(
                key,
                WithdrawRequest {
                    owner: owner.to_string(),
                    receiver: receiver.to_string(),
                    requested_assets: shortfall,
                    acc_requested_withdraw_assets: cumulative,
                    request_timestamp: now,
                    is_prioritized: prioritized,
                    is_claimed: false,
                },
            );
            // Draining this backlog will need a leg order; hold back its
            // execution cost from future utilization until it clears.
            self.reserved_execution_cost = self.execution_cost_buffer;
            Some(key)
        } else {
            None
        };

        Ok(RequestOutcome {
            burned_shares: shares,
            value,
            instant_assets: instant,
            request_key,
        })
    }

    /// Pay out an executed request.
    pub fn claim(&mut self, key: u64, caller: &str) -> Result<Decimal, VaultError> {
        let request = self
            .requests
            .get_mut(&key)
            .ok_or(VaultError::UnknownRequest(key))?;

        if request.is_claimed {
            return Err(VaultError::RequestAlreadyClaimed);
        }
        if request.owner != caller {
            return Err(VaultError::UnauthorizedClaimer {
                caller: caller.to_string(),
                owner: request.owner.clone(),
            });
        }
        if !self
            .withdrawals
            .is_covered(request.acc_requested_withdraw_assets, request.is_prioritized)
        {
            return Err(VaultError::RequestNotExecuted);
        }

        let mut payout = request.requested_assets.min(self.claimable_assets);
        // The claim that empties both queues sweeps residual dust rather
        // than stranding it.
        if self.withdrawals.fully_drained() && self.unclaimed_requests == 1 {
            payout = self.claimable_assets;
        }

        request.is_claimed = true;
        self.unclaimed_requests -= 1;
        self.claimable_assets -= payout;
        self.paid_out_assets += payout;
        Ok(payout)
    }

    // ---- strategy-side hooks ---------------------------------------------

    /// Assets pulled into the strategy by utilize. Caller has validated the
    /// amount against `utilizable_idle`.
    pub fn on_utilize(&mut self, amount: Decimal) {
        self.idle_assets -= amount;
    }

    /// Confirmed settlement returning assets from the strategy. The single
    /// consumption policy applies: prioritized watermark, ordinary
    /// watermark, then idle.
    pub fn on_assets_returned(&mut self, amount: Decimal) -> Consumption {
        self.route_incoming_assets(amount)
    }

    /// The strategy closed both legs entirely: whatever arrived is all the
    /// backlog will ever see. Residual outstanding amounts are marked
    /// processed so claims settle against the (possibly short) pool instead
    /// of waiting for assets that cannot come.
    pub fn on_strategy_drained(&mut self) -> Decimal {
        self.withdrawals.force_complete()
    }

    pub fn clear_reserved_execution_cost(&mut self) {
        self.reserved_execution_cost = Decimal::ZERO;
    }

    // ---- circuit breaker -------------------------------------------------

    pub fn pause(&mut self) {
        if self.status == VaultStatus::Active {
            self.status = VaultStatus::Paused;
        }
    }

    pub fn unpause(&mut self) {
        if self.status == VaultStatus::Paused {
            self.status = VaultStatus::Active;
        }
    }

    pub fn shutdown(&mut self) {
        self.status = VaultStatus::Shutdown;
    }

    // ---- internals -------------------------------------------------------

    fn ensure_deposits_open(&self) -> Result<(), VaultError> {
        match self.status {
            VaultStatus::Active => Ok(()),
            VaultStatus::Paused => Err(VaultError::VaultPaused),
            VaultStatus::Shutdown => Err(VaultError::VaultShutdown),
        }
    }

    fn mint_shares(&mut self, owner: &str, shares: Decimal) {
        *self
            .balances
            .entry(owner.to_string())
            .or_insert(Decimal::ZERO) += shares;
        self.total_supply += shares;
    }

    fn burn_shares(&mut self, owner: &str, shares: Decimal) {
        if let Some(balance) = self.balances.get_mut(owner) {
            *balance -= shares;
        }
        self.total_supply -= shares;
    }

    fn route_incoming_assets(&mut self, amount: Decimal) -> Consumption {
        let consumed = self.withdrawals.on_assets_available(amount);
        self.claimable_assets += consumed.to_prioritized + consumed.to_ordinary;
        self.idle_assets += consumed.remainder;
        consumed
    }
}
