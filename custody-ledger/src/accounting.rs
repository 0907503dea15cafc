//! Deposits, withdrawals, fees and the deposit pause switch

use crate::engine::{checked_add, mul_div, transfer_failed, LedgerCore};
use crate::types::{Amount, Bps, EventKind, Principal, Role, BPS_DENOMINATOR};
use crate::version::Operation;
use crate::yield_accrual::accrued_yield;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Outcome of a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositReceipt {
    /// Gross amount pulled from the depositor
    pub amount: Amount,
    /// Fee retained by the ledger
    pub fee: Amount,
    /// Amount credited to the balance
    pub net: Amount,
}

/// `floor(amount * fee_bps / 10000)`
pub fn compute_fee(amount: Amount, fee_bps: Bps) -> Result<Amount> {
    if fee_bps > BPS_DENOMINATOR {
        return Err(Error::Validation(format!(
            "fee {} bps exceeds {}",
            fee_bps, BPS_DENOMINATOR
        )));
    }
    mul_div(amount, fee_bps, BPS_DENOMINATOR as u128)
}

pub(crate) fn validate_bps(value: Bps, what: &str) -> Result<()> {
    if value > BPS_DENOMINATOR {
        return Err(Error::Validation(format!(
            "{} must be at most {} bps, got {}",
            what, BPS_DENOMINATOR, value
        )));
    }
    Ok(())
}

impl LedgerCore {
    /// Pull `amount` from `principal` and credit it net of the deposit fee
    pub(crate) async fn deposit(
        &self,
        principal: &Principal,
        amount: Amount,
    ) -> Result<DepositReceipt> {
        let mut txn = self.begin()?;
        txn.require(Operation::Deposit)?;
        principal.validate()?;

        if amount == 0 {
            return Err(Error::Validation("deposit amount must be positive".to_string()));
        }
        if txn.global().deposits_paused {
            warn!(principal = %principal, amount, "Deposit rejected, deposits paused");
            return Err(Error::Paused);
        }

        let fee = compute_fee(amount, txn.global().deposit_fee_bps)?;
        let net = amount - fee;
        if net == 0 {
            return Err(Error::Validation(format!(
                "deposit of {} is consumed entirely by the fee",
                amount
            )));
        }

        let now = txn.now();
        let yield_active = txn.version().supports(Operation::AccruedYield);
        let rate = txn.global().yield_rate_bps;
        let account = txn.account(principal)?.clone();

        let pending_yield = if yield_active && self.config.credit_pending_yield_on_deposit {
            accrued_yield(account.balance, rate, account.yield_baseline, now)?
        } else {
            0
        };
        let credit = checked_add(net, pending_yield, "deposit credit")?;
        let fees = checked_add(txn.global().collected_fees, fee, "collected fees")?;

        txn.credit(principal, credit)?;
        txn.global_mut().collected_fees = fees;
        if yield_active {
            // unclaimed yield is discarded unless credited above
            txn.account_mut(principal)?.yield_baseline = now;
        }

        if pending_yield > 0 {
            txn.emit(principal.clone(), EventKind::YieldClaimed { amount: pending_yield });
        }
        txn.emit(principal.clone(), EventKind::Deposited { amount, fee, net });

        // nothing is staged in storage until the pull has succeeded
        if let Err(e) = self.provider.pull(principal, amount).await {
            warn!(principal = %principal, amount, error = %e, "Deposit pull failed");
            self.metrics.record_transfer_failure();
            return Err(transfer_failed(e));
        }

        if let Err(cause) = self.commit(txn) {
            return Err(self.refund_pull(principal, amount, cause).await);
        }
        info!(principal = %principal, amount, fee, net, "Deposit credited");

        Ok(DepositReceipt { amount, fee, net })
    }

    /// Return a pulled deposit whose credit could not be committed
    async fn refund_pull(&self, principal: &Principal, amount: Amount, cause: Error) -> Error {
        warn!(principal = %principal, amount, error = %cause, "Deposit not recorded, refunding");

        if let Err(refund) = self.provider.push(principal, amount).await {
            self.metrics.record_transfer_failure();
            error!(
                principal = %principal,
                amount,
                error = %refund,
                "Refund of unrecorded deposit failed"
            );
            return Error::InvariantViolation(format!(
                "deposit of {} by {} pulled but not recorded ({}) and refund failed ({})",
                amount, principal, cause, refund
            ));
        }
        cause
    }

    /// Debit `amount` and push it to `principal`
    pub(crate) async fn withdraw(&self, principal: &Principal, amount: Amount) -> Result<()> {
        let mut txn = self.begin()?;
        txn.require(Operation::Withdraw)?;

        if amount == 0 {
            return Err(Error::Validation("withdrawal amount must be positive".to_string()));
        }

        txn.debit(principal, amount)?;
        txn.emit(principal.clone(), EventKind::Withdrawn { amount });

        let undo = self.commit(txn)?;
        self.push_or_revert(principal, amount, undo).await?;

        info!(principal = %principal, amount, "Withdrawal completed");
        Ok(())
    }

    /// Change the deposit fee
    pub(crate) fn set_deposit_fee(&self, admin: &Principal, fee_bps: Bps) -> Result<()> {
        let mut txn = self.begin()?;
        txn.require(Operation::SetDepositFee)?;
        self.auth.require_role(admin, Role::Admin)?;
        validate_bps(fee_bps, "deposit fee")?;

        txn.global_mut().deposit_fee_bps = fee_bps;
        txn.emit(
            admin.clone(),
            EventKind::DepositFeeUpdated {
                deposit_fee_bps: fee_bps,
            },
        );
        self.commit(txn)?;

        info!(admin = %admin, fee_bps, "Deposit fee updated");
        Ok(())
    }

    /// Pause (`true`) or resume (`false`) deposits; repeating the current state is a no-op
    pub(crate) fn set_deposits_paused(&self, pauser: &Principal, paused: bool) -> Result<()> {
        let mut txn = self.begin()?;
        txn.require(if paused {
            Operation::PauseDeposits
        } else {
            Operation::UnpauseDeposits
        })?;
        self.auth.require_role(pauser, Role::Pauser)?;

        if txn.global().deposits_paused == paused {
            return Ok(());
        }

        txn.global_mut().deposits_paused = paused;
        let kind = if paused {
            EventKind::DepositsPaused
        } else {
            EventKind::DepositsUnpaused
        };
        txn.emit(pauser.clone(), kind);
        self.commit(txn)?;

        info!(pauser = %pauser, paused, "Deposit pause switched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::Metrics;
    use crate::schema::SchemaRegistry;
    use crate::storage::Storage;
    use crate::transfer::{AssetTransferProvider, InMemoryTransferProvider};
    use crate::types::AssetId;
    use crate::Config;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        core: LedgerCore,
        storage: Arc<Storage>,
        provider: Arc<InMemoryTransferProvider>,
        _temp: TempDir,
    }

    fn create_test_core() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let provider = Arc::new(InMemoryTransferProvider::new());
        let core = LedgerCore::new(
            storage.clone(),
            SchemaRegistry::builtin(),
            provider.clone(),
            Arc::new(ManualClock::starting_at(1_700_000_000)),
            Metrics::new().unwrap(),
            config.ledger.clone(),
        )
        .unwrap();
        core.initialize(AssetId::new("USDC").unwrap(), &Principal::new("admin"), 500)
            .unwrap();

        Fixture {
            core,
            storage,
            provider,
            _temp: temp_dir,
        }
    }

    fn balance(core: &LedgerCore, principal: &Principal) -> Amount {
        core.begin().unwrap().account(principal).unwrap().balance
    }

    #[test]
    fn test_compute_fee() {
        assert_eq!(compute_fee(1000, 500).unwrap(), 50);
        assert_eq!(compute_fee(1000, 0).unwrap(), 0);
        assert_eq!(compute_fee(1000, 10_000).unwrap(), 1000);
        assert_eq!(compute_fee(19, 500).unwrap(), 0);
        assert_eq!(compute_fee(u64::MAX, 10_000).unwrap(), u64::MAX);
    }

    #[test]
    fn test_compute_fee_rejects_rate_above_scale() {
        assert!(matches!(compute_fee(1000, 10_001), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_bps() {
        assert!(validate_bps(10_000, "fee").is_ok());
        let err = validate_bps(10_001, "yield rate").unwrap_err();
        assert!(err.to_string().contains("yield rate"));
    }

    #[tokio::test]
    async fn test_unrecorded_deposit_is_refunded() {
        let f = create_test_core();
        let alice = Principal::new("alice");
        f.provider.fund(&alice, 1_000);

        f.storage.set_fail_commits(true);
        let err = f.core.deposit(&alice, 1_000).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        f.storage.set_fail_commits(false);

        assert_eq!(f.provider.wallet_balance(&alice), 1_000);
        assert_eq!(f.provider.custody_balance(), 0);
        assert_eq!(balance(&f.core, &alice), 0);
        assert_eq!(f.core.check_conservation().unwrap(), 0);
        assert!(f.core.events_for(&alice).unwrap().is_empty());

        // the ledger keeps working once storage recovers
        let receipt = f.core.deposit(&alice, 1_000).await.unwrap();
        assert_eq!(receipt.net, 950);
        assert_eq!(balance(&f.core, &alice), 950);
    }

    #[tokio::test]
    async fn test_failed_refund_is_an_invariant_violation() {
        let f = create_test_core();
        let alice = Principal::new("alice");
        f.provider.fund(&alice, 1_000);

        f.storage.set_fail_commits(true);
        f.provider.set_fail_pushes(true);
        let err = f.core.deposit(&alice, 1_000).await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(f.core.metrics.transfer_failures.get(), 1);

        // the asset is stranded in custody and the ledger records nothing
        f.storage.set_fail_commits(false);
        assert_eq!(f.provider.custody_balance(), 1_000);
        assert_eq!(balance(&f.core, &alice), 0);

        // a manual refund through the provider settles it
        f.provider.set_fail_pushes(false);
        f.provider.push(&alice, 1_000).await.unwrap();
        assert_eq!(f.provider.wallet_balance(&alice), 1_000);
    }
}
