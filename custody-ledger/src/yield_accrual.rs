//! Time-based yield accrual
//!
//! Yield is an internal credit at a configured annual rate. It accrues on the
//! current balance from the account's baseline and is never moved in from
//! outside; custody must hold enough of the asset to honor it on withdrawal.

use crate::accounting::validate_bps;
use crate::engine::LedgerCore;
use crate::types::{
    Amount, Bps, EventKind, Principal, Role, Timestamp, BPS_DENOMINATOR, SECONDS_PER_YEAR,
};
use crate::version::Operation;
use crate::{Error, Result};
use tracing::info;

/// `floor(balance * rate_bps * (now - baseline) / (SECONDS_PER_YEAR * 10000))`
///
/// Zero when the account never accrued, holds nothing, or the rate is zero.
pub fn accrued_yield(
    balance: Amount,
    rate_bps: Bps,
    baseline: Timestamp,
    now: Timestamp,
) -> Result<Amount> {
    if baseline == 0 || balance == 0 || rate_bps == 0 {
        return Ok(0);
    }

    let elapsed = now.saturating_sub(baseline) as u128;
    let numerator = (balance as u128)
        .checked_mul(rate_bps as u128)
        .and_then(|v| v.checked_mul(elapsed))
        .ok_or_else(|| {
            Error::Overflow(format!(
                "yield on {} at {} bps over {}s",
                balance, rate_bps, elapsed
            ))
        })?;

    let accrued = numerator / (SECONDS_PER_YEAR as u128 * BPS_DENOMINATOR as u128);
    Amount::try_from(accrued)
        .map_err(|_| Error::Overflow(format!("accrued yield {} does not fit 64 bits", accrued)))
}

impl LedgerCore {
    /// Yield `principal` could claim right now
    pub(crate) fn accrued_yield(&self, principal: &Principal) -> Result<Amount> {
        let mut txn = self.begin()?;
        txn.require(Operation::AccruedYield)?;

        let now = txn.now();
        let rate = txn.global().yield_rate_bps;
        let account = txn.account(principal)?;
        accrued_yield(account.balance, rate, account.yield_baseline, now)
    }

    /// Credit pending yield to the balance and restart accrual
    pub(crate) fn claim_yield(&self, principal: &Principal) -> Result<Amount> {
        let mut txn = self.begin()?;
        txn.require(Operation::ClaimYield)?;

        let now = txn.now();
        let rate = txn.global().yield_rate_bps;
        let account = txn.account(principal)?;
        let amount = accrued_yield(account.balance, rate, account.yield_baseline, now)?;
        if amount == 0 {
            return Err(Error::Validation(format!("no yield accrued for {}", principal)));
        }

        txn.credit(principal, amount)?;
        txn.account_mut(principal)?.yield_baseline = now;
        txn.emit(principal.clone(), EventKind::YieldClaimed { amount });
        self.commit(txn)?;

        info!(principal = %principal, amount, "Yield claimed");
        Ok(amount)
    }

    /// Change the annual yield rate
    pub(crate) fn set_yield_rate(&self, admin: &Principal, rate_bps: Bps) -> Result<()> {
        let mut txn = self.begin()?;
        txn.require(Operation::SetYieldRate)?;
        self.auth.require_role(admin, Role::Admin)?;
        validate_bps(rate_bps, "yield rate")?;

        txn.global_mut().yield_rate_bps = rate_bps;
        txn.emit(
            admin.clone(),
            EventKind::YieldRateUpdated {
                yield_rate_bps: rate_bps,
            },
        );
        self.commit(txn)?;

        info!(admin = %admin, rate_bps, "Yield rate updated");
        Ok(())
    }
}
