//! Asset Transfer Provider
//!
//! The ledger only records balances; moving the underlying asset in and out
//! of custody is delegated to a provider. Every call may fail, and the ledger
//! treats any failure as fatal to the operation that made it.

use crate::types::{Amount, Principal};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// External collaborator that moves value into and out of custody
#[async_trait]
pub trait AssetTransferProvider: Send + Sync {
    /// Move `amount` from `principal` into custody
    async fn pull(&self, principal: &Principal, amount: Amount) -> Result<()>;

    /// Move `amount` from custody to `principal`
    async fn push(&self, principal: &Principal, amount: Amount) -> Result<()>;
}

/// In-process provider backed by external wallet balances
///
/// Pulls fail when the wallet is short, pushes fail when custody is short.
/// Failures can also be forced, which is how tests exercise rollback paths.
#[derive(Debug, Default)]
pub struct InMemoryTransferProvider {
    wallets: DashMap<Principal, Amount>,
    custody: Mutex<Amount>,
    fail_pulls: AtomicBool,
    fail_pushes: AtomicBool,
}

impl InMemoryTransferProvider {
    /// Create empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an external wallet
    pub fn fund(&self, principal: &Principal, amount: Amount) {
        *self.wallets.entry(principal.clone()).or_insert(0) += amount;
    }

    /// Add asset to custody without a depositor (e.g. to back credited yield)
    pub fn fund_custody(&self, amount: Amount) {
        *self.custody.lock() += amount;
    }

    /// External wallet balance
    pub fn wallet_balance(&self, principal: &Principal) -> Amount {
        self.wallets.get(principal).map(|w| *w).unwrap_or(0)
    }

    /// Asset held in custody
    pub fn custody_balance(&self) -> Amount {
        *self.custody.lock()
    }

    /// Force every pull to fail
    pub fn set_fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    /// Force every push to fail
    pub fn set_fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AssetTransferProvider for InMemoryTransferProvider {
    async fn pull(&self, principal: &Principal, amount: Amount) -> Result<()> {
        if self.fail_pulls.load(Ordering::SeqCst) {
            warn!(principal = %principal, amount, "Simulated pull failure");
            return Err(Error::TransferFailed("pull rejected by provider".to_string()));
        }

        let mut wallet = self.wallets.entry(principal.clone()).or_insert(0);
        if *wallet < amount {
            return Err(Error::TransferFailed(format!(
                "wallet of {} holds {}, cannot pull {}",
                principal, *wallet, amount
            )));
        }

        let mut custody = self.custody.lock();
        *custody = custody
            .checked_add(amount)
            .ok_or_else(|| Error::TransferFailed("custody balance overflow".to_string()))?;
        *wallet -= amount;

        debug!(principal = %principal, amount, "Pulled into custody");
        Ok(())
    }

    async fn push(&self, principal: &Principal, amount: Amount) -> Result<()> {
        if self.fail_pushes.load(Ordering::SeqCst) {
            warn!(principal = %principal, amount, "Simulated push failure");
            return Err(Error::TransferFailed("push rejected by provider".to_string()));
        }

        // wallet before custody, same lock order as pull
        let mut wallet = self.wallets.entry(principal.clone()).or_insert(0);
        let mut custody = self.custody.lock();
        if *custody < amount {
            return Err(Error::TransferFailed(format!(
                "custody holds {}, cannot push {}",
                *custody, amount
            )));
        }

        *wallet = wallet
            .checked_add(amount)
            .ok_or_else(|| Error::TransferFailed("wallet balance overflow".to_string()))?;
        *custody -= amount;

        debug!(principal = %principal, amount, "Pushed out of custody");
        Ok(())
    }
}
