//! Two-phase delayed withdrawals and the emergency bypass
//!
//! ```text
//!  None --request--> Requested --execute (delay elapsed)--> None
//!                     |    ^
//!                     +----+ request again (supersedes)
//!
//!  any --emergency_withdraw--> None, balance 0
//! ```

use crate::engine::LedgerCore;
use crate::types::{
    Amount, EventKind, Principal, Role, WithdrawalRequest, MAX_WITHDRAWAL_DELAY_SECS,
};
use crate::version::Operation;
use crate::{Error, Result};
use tracing::info;

impl LedgerCore {
    /// Record a withdrawal intent; replaces any pending one
    pub(crate) fn request_withdrawal(&self, principal: &Principal, amount: Amount) -> Result<()> {
        let mut txn = self.begin()?;
        txn.require(Operation::RequestWithdrawal)?;

        if amount == 0 {
            return Err(Error::Validation("withdrawal amount must be positive".to_string()));
        }

        let now = txn.now();
        let account = txn.account_mut(principal)?;
        if amount > account.balance {
            return Err(Error::InsufficientBalance {
                principal: principal.clone(),
                requested: amount,
                available: account.balance,
            });
        }

        let superseded = account.pending_withdrawal.map(|r| r.amount);
        account.pending_withdrawal = Some(WithdrawalRequest {
            amount,
            requested_at: now,
        });
        txn.emit(
            principal.clone(),
            EventKind::WithdrawalRequested { amount, superseded },
        );
        self.commit(txn)?;

        match superseded {
            Some(previous) => {
                info!(principal = %principal, amount, previous, "Withdrawal request superseded")
            }
            None => info!(principal = %principal, amount, "Withdrawal requested"),
        }
        Ok(())
    }

    /// Pay out the pending request once its delay has elapsed
    pub(crate) async fn execute_withdrawal(&self, principal: &Principal) -> Result<Amount> {
        let mut txn = self.begin()?;
        txn.require(Operation::ExecuteWithdrawal)?;

        let now = txn.now();
        let delay = txn.global().withdrawal_delay_secs;
        let request = txn
            .account(principal)?
            .pending_withdrawal
            .ok_or_else(|| Error::NoPendingWithdrawal(principal.clone()))?;

        let ready_at = request.ready_at(delay);
        if now < ready_at {
            return Err(Error::DelayNotElapsed { ready_at, now });
        }

        // a direct withdraw may have shrunk the balance since the request
        txn.debit(principal, request.amount)?;
        txn.account_mut(principal)?.pending_withdrawal = None;
        txn.emit(
            principal.clone(),
            EventKind::WithdrawalExecuted {
                amount: request.amount,
            },
        );

        let undo = self.commit(txn)?;
        self.push_or_revert(principal, request.amount, undo).await?;

        info!(principal = %principal, amount = request.amount, "Delayed withdrawal executed");
        Ok(request.amount)
    }

    /// Withdraw the whole balance now, dropping any pending request
    pub(crate) async fn emergency_withdraw(&self, principal: &Principal) -> Result<Amount> {
        let mut txn = self.begin()?;
        txn.require(Operation::EmergencyWithdraw)?;

        let amount = txn.account(principal)?.balance;
        if amount == 0 {
            return Err(Error::Validation(format!("{} has no balance to withdraw", principal)));
        }

        txn.debit(principal, amount)?;
        txn.account_mut(principal)?.pending_withdrawal = None;
        txn.emit(principal.clone(), EventKind::EmergencyWithdrawal { amount });

        let undo = self.commit(txn)?;
        self.push_or_revert(principal, amount, undo).await?;

        info!(principal = %principal, amount, "Emergency withdrawal completed");
        Ok(amount)
    }

    /// Change the delay between request and execution
    pub(crate) fn set_withdrawal_delay(&self, admin: &Principal, delay_secs: u64) -> Result<()> {
        let mut txn = self.begin()?;
        txn.require(Operation::SetWithdrawalDelay)?;
        self.auth.require_role(admin, Role::Admin)?;

        if delay_secs > MAX_WITHDRAWAL_DELAY_SECS {
            return Err(Error::Validation(format!(
                "withdrawal delay must be at most {}s, got {}",
                MAX_WITHDRAWAL_DELAY_SECS, delay_secs
            )));
        }

        txn.global_mut().withdrawal_delay_secs = delay_secs;
        txn.emit(
            admin.clone(),
            EventKind::WithdrawalDelayUpdated {
                withdrawal_delay_secs: delay_secs,
            },
        );
        self.commit(txn)?;

        info!(admin = %admin, delay_secs, "Withdrawal delay updated");
        Ok(())
    }

    /// Pending request of `principal`
    pub(crate) fn pending_withdrawal(
        &self,
        principal: &Principal,
    ) -> Result<Option<WithdrawalRequest>> {
        let mut txn = self.begin()?;
        Ok(txn.account(principal)?.pending_withdrawal)
    }
}
