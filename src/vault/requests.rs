//! Withdrawal-request bookkeeping: two FIFO cumulative ledgers (ordinary and
//! prioritized) sharing one pool of returned assets.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

/// Tolerance for watermark coverage. Leg fills round in the venue's favor
/// by fractions far below one asset unit; without a dust margin a request
/// could sit permanently one billionth short of claimable.
const COVERAGE_DUST: Decimal = dec!(0.000001);

/// A queued withdrawal. Created when idle assets cannot cover a request,
/// flagged claimed on payout, never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct WithdrawRequest {
    pub owner: String,
    pub receiver: String,
    /// Asset amount still owed after the instant idle payout.
    pub requested_assets: Decimal,
    /// The class accumulator's value at creation; the request is claimable
    /// once its class watermark reaches this.
    pub acc_requested_withdraw_assets: Decimal,
    pub request_timestamp: DateTime<Utc>,
    pub is_prioritized: bool,
    pub is_claimed: bool,
}

/// How one settlement tranche was consumed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    pub to_prioritized: Decimal,
    pub to_ordinary: Decimal,
    pub remainder: Decimal,
}

/// Both cumulative request/processed watermark pairs.
///
/// All four counters are monotone. This type is the single point deciding
/// who gets paid first from arriving assets: the prioritized watermark
/// advances fully up to availability before the ordinary one sees anything.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WithdrawalLedger {
    pub acc_requested_withdraw_assets: Decimal,
    pub processed_withdraw_assets: Decimal,
    pub prioritized_acc_requested_withdraw_assets: Decimal,
    pub prioritized_processed_withdraw_assets: Decimal,
}

impl WithdrawalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a queued amount to its class accumulator; returns the
    /// cumulative total the new request must wait for.
    pub fn append(&mut self, amount: Decimal, prioritized: bool) -> Decimal {
        if prioritized {
            self.prioritized_acc_requested_withdraw_assets += amount;
            self.prioritized_acc_requested_withdraw_assets
        } else {
            self.acc_requested_withdraw_assets += amount;
            self.acc_requested_withdraw_assets
        }
    }

    /// Consume an arriving settlement tranche: prioritized watermark first
    /// and fully up to availability, then ordinary, remainder returned to
    /// the caller (it becomes idle).
    pub fn on_assets_available(&mut self, amount: Decimal) -> Consumption {
        let mut available = amount;

        let prioritized_due = self.outstanding_prioritized();
        let to_prioritized = available.min(prioritized_due);
        self.prioritized_processed_withdraw_assets += to_prioritized;
        available -= to_prioritized;

        let ordinary_due = self.outstanding_ordinary();
        let to_ordinary = available.min(ordinary_due);
        self.processed_withdraw_assets += to_ordinary;
        available -= to_ordinary;

        // A residual below the dust threshold can never be settled by a
        // further order; absorb it so the backlog reads as drained.
        let residual = self.outstanding_total();
        if residual > Decimal::ZERO && residual <= COVERAGE_DUST {
            self.force_complete();
        }

        Consumption {
            to_prioritized,
            to_ordinary,
            remainder: available,
        }
    }

    /// Mark all outstanding requests processed even though the matching
    /// assets never arrived. Used when the strategy has fully drained and
    /// nothing more can ever settle: claims are then paid from whatever the
    /// pool holds instead of waiting forever. Returns the forced amount.
    pub fn force_complete(&mut self) -> Decimal {
        let forced = self.outstanding_total();
        self.prioritized_processed_withdraw_assets =
            self.prioritized_acc_requested_withdraw_assets;
        self.processed_withdraw_assets = self.acc_requested_withdraw_assets;
        forced
    }

    /// Whether the class watermark covers a request created at cumulative
    /// total `acc_requested`.
    pub fn is_covered(&self, acc_requested: Decimal, prioritized: bool) -> bool {
        if prioritized {
            self.prioritized_processed_withdraw_assets + COVERAGE_DUST >= acc_requested
        } else {
            self.processed_withdraw_assets + COVERAGE_DUST >= acc_requested
        }
    }

    pub fn outstanding_prioritized(&self) -> Decimal {
        self.prioritized_acc_requested_withdraw_assets
            - self.prioritized_processed_withdraw_assets
    }

    pub fn outstanding_ordinary(&self) -> Decimal {
        self.acc_requested_withdraw_assets - self.processed_withdraw_assets
    }

    /// Total queued assets not yet matched by settlement.
    pub fn outstanding_total(&self) -> Decimal {
        self.outstanding_prioritized() + self.outstanding_ordinary()
    }

    /// Both watermarks caught up with their accumulators.
    pub fn fully_drained(&self) -> bool {
        self.outstanding_total() == Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_prioritized_consumed_before_ordinary() {
        let mut ledger = WithdrawalLedger::new();
        ledger.append(dec!(500), false);
        ledger.append(dec!(200), true);

        // Tranche smaller than the ordinary request but covering the
        // prioritized one: only the prioritized watermark moves.
        let consumed = ledger.on_assets_available(dec!(250));
        assert_eq!(consumed.to_prioritized, dec!(200));
        assert_eq!(consumed.to_ordinary, dec!(50));
        assert_eq!(consumed.remainder, Decimal::ZERO);

        assert!(ledger.is_covered(dec!(200), true));
        assert!(!ledger.is_covered(dec!(500), false));
    }

    #[test]
    fn test_remainder_after_full_drain() {
        let mut ledger = WithdrawalLedger::new();
        ledger.append(dec!(100), false);

        let consumed = ledger.on_assets_available(dec!(130));
        assert_eq!(consumed.to_ordinary, dec!(100));
        assert_eq!(consumed.remainder, dec!(30));
        assert!(ledger.fully_drained());
    }

    #[test]
    fn test_watermarks_monotone_across_sequence() {
        let mut ledger = WithdrawalLedger::new();
        let mut last_processed = Decimal::ZERO;
        let mut last_prioritized = Decimal::ZERO;

        let script: &[(Decimal, bool, Decimal)] = &[
            (dec!(100), false, dec!(40)),
            (dec!(50), true, dec!(60)),
            (dec!(0), false, dec!(10)),
            (dec!(25), true, dec!(200)),
        ];
        for &(queued, prioritized, tranche) in script {
            if queued > Decimal::ZERO {
                ledger.append(queued, prioritized);
            }
            ledger.on_assets_available(tranche);

            assert!(ledger.processed_withdraw_assets >= last_processed);
            assert!(ledger.prioritized_processed_withdraw_assets >= last_prioritized);
            assert!(ledger.processed_withdraw_assets <= ledger.acc_requested_withdraw_assets);
            assert!(
                ledger.prioritized_processed_withdraw_assets
                    <= ledger.prioritized_acc_requested_withdraw_assets
            );
            last_processed = ledger.processed_withdraw_assets;
            last_prioritized = ledger.prioritized_processed_withdraw_assets;
        }
        assert!(ledger.fully_drained());
    }

    #[test]
    fn test_coverage_tolerates_fill_rounding_dust() {
        let mut ledger = WithdrawalLedger::new();
        ledger.append(dec!(100), false);

        // A fill one billionth short still covers the request; a materially
        // short one does not.
        ledger.on_assets_available(dec!(99.999999999));
        assert!(ledger.is_covered(dec!(100), false));

        let mut short = WithdrawalLedger::new();
        short.append(dec!(100), false);
        short.on_assets_available(dec!(99.9));
        assert!(!short.is_covered(dec!(100), false));
    }

    #[test]
    fn test_sub_dust_residual_absorbed_as_drained() {
        let mut ledger = WithdrawalLedger::new();
        ledger.append(dec!(100), false);
        ledger.on_assets_available(dec!(99.9999999));
        assert!(ledger.fully_drained());
    }

    #[test]
    fn test_no_double_spend_of_one_tranche() {
        let mut ledger = WithdrawalLedger::new();
        ledger.append(dec!(300), true);
        ledger.append(dec!(300), false);

        let consumed = ledger.on_assets_available(dec!(400));
        assert_eq!(
            consumed.to_prioritized + consumed.to_ordinary + consumed.remainder,
            dec!(400)
        );
        assert_eq!(ledger.outstanding_total(), dec!(200));
    }
}
