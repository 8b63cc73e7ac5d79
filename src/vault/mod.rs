//! Vault ledger: share accounting, withdrawal-request queues, fee accrual.

mod fees;
mod ledger;
mod requests;

pub use fees::{FeeAccrual, FeeState};
pub use ledger::{LedgerSnapshot, RequestOutcome, VaultLedger, VaultStatus};
pub use requests::{Consumption, WithdrawRequest, WithdrawalLedger};
