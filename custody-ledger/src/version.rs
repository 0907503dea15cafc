//! Ledger versions and their operation sets
//!
//! Each version activates every operation of the versions before it plus the
//! ones it introduces. The storage side of a version lives in
//! [`crate::schema`]; the field initializers that must run when a version is
//! first activated live here.

use crate::types::GlobalState;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployed ledger generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LedgerVersion {
    /// Deposits, fees, withdrawals, pause, roles
    V1,
    /// Adds yield accrual
    V2,
    /// Adds two-phase delayed withdrawals and the emergency bypass
    V3,
}

impl LedgerVersion {
    /// Version activated by `initialize`
    pub const GENESIS: LedgerVersion = LedgerVersion::V1;

    /// All versions in release order
    pub const ALL: [LedgerVersion; 3] = [LedgerVersion::V1, LedgerVersion::V2, LedgerVersion::V3];

    /// Numeric version as stored in the global record
    pub fn number(&self) -> u64 {
        match self {
            LedgerVersion::V1 => 1,
            LedgerVersion::V2 => 2,
            LedgerVersion::V3 => 3,
        }
    }

    /// Whether `operation` is part of this version's operation set
    pub fn supports(&self, operation: Operation) -> bool {
        *self >= operation.introduced_in()
    }

    /// Fail with `UnsupportedOperation` unless `operation` is active
    pub fn require(&self, operation: Operation) -> Result<()> {
        if self.supports(operation) {
            Ok(())
        } else {
            Err(Error::UnsupportedOperation {
                operation,
                version: *self,
            })
        }
    }

    /// Versions strictly after `self` up to and including `target`
    pub fn steps_to(&self, target: LedgerVersion) -> impl Iterator<Item = LedgerVersion> {
        let from = *self;
        Self::ALL
            .into_iter()
            .filter(move |v| *v > from && *v <= target)
    }

    /// Give the fields introduced by this version their starting values
    pub fn initialize_fields(&self, state: &mut GlobalState, default_withdrawal_delay_secs: u64) {
        match self {
            LedgerVersion::V1 => {}
            LedgerVersion::V2 => state.yield_rate_bps = 0,
            LedgerVersion::V3 => state.withdrawal_delay_secs = default_withdrawal_delay_secs,
        }
    }
}

impl TryFrom<u64> for LedgerVersion {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            1 => Ok(LedgerVersion::V1),
            2 => Ok(LedgerVersion::V2),
            3 => Ok(LedgerVersion::V3),
            other => Err(Error::SchemaConflict(format!("unknown ledger version {}", other))),
        }
    }
}

impl fmt::Display for LedgerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// Version-gated ledger operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Deposit
    Deposit,
    /// Immediate withdrawal
    Withdraw,
    /// Change the deposit fee
    SetDepositFee,
    /// Pause deposits
    PauseDeposits,
    /// Resume deposits
    UnpauseDeposits,
    /// Grant a role
    GrantRole,
    /// Revoke a role
    RevokeRole,
    /// Switch versions
    Upgrade,
    /// Change the yield rate
    SetYieldRate,
    /// Read pending yield
    AccruedYield,
    /// Credit pending yield
    ClaimYield,
    /// Phase one of a delayed withdrawal
    RequestWithdrawal,
    /// Phase two of a delayed withdrawal
    ExecuteWithdrawal,
    /// Full withdrawal bypassing the delay
    EmergencyWithdraw,
    /// Change the withdrawal delay
    SetWithdrawalDelay,
}

impl Operation {
    /// First version whose operation set contains this operation
    pub fn introduced_in(&self) -> LedgerVersion {
        match self {
            Operation::Deposit
            | Operation::Withdraw
            | Operation::SetDepositFee
            | Operation::PauseDeposits
            | Operation::UnpauseDeposits
            | Operation::GrantRole
            | Operation::RevokeRole
            | Operation::Upgrade => LedgerVersion::V1,
            Operation::SetYieldRate | Operation::AccruedYield | Operation::ClaimYield => {
                LedgerVersion::V2
            }
            Operation::RequestWithdrawal
            | Operation::ExecuteWithdrawal
            | Operation::EmergencyWithdraw
            | Operation::SetWithdrawalDelay => LedgerVersion::V3,
        }
    }

    /// snake_case name for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Deposit => "deposit",
            Operation::Withdraw => "withdraw",
            Operation::SetDepositFee => "set_deposit_fee",
            Operation::PauseDeposits => "pause_deposits",
            Operation::UnpauseDeposits => "unpause_deposits",
            Operation::GrantRole => "grant_role",
            Operation::RevokeRole => "revoke_role",
            Operation::Upgrade => "upgrade",
            Operation::SetYieldRate => "set_yield_rate",
            Operation::AccruedYield => "accrued_yield",
            Operation::ClaimYield => "claim_yield",
            Operation::RequestWithdrawal => "request_withdrawal",
            Operation::ExecuteWithdrawal => "execute_withdrawal",
            Operation::EmergencyWithdraw => "emergency_withdraw",
            Operation::SetWithdrawalDelay => "set_withdrawal_delay",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
