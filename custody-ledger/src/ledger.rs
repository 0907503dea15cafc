//! Main ledger orchestration layer
//!
//! This module ties together storage, the schema registry, the transfer
//! provider and the actor into the public custody API.
//!
//! # Example
//!
//! ```no_run
//! use custody_ledger::{AssetId, Config, InMemoryTransferProvider, Ledger, Principal};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> custody_ledger::Result<()> {
//!     let provider = Arc::new(InMemoryTransferProvider::new());
//!     let ledger = Ledger::open(Config::default(), provider).await?;
//!
//!     let admin = Principal::new("treasury");
//!     ledger.initialize(AssetId::new("USDC")?, admin, 500).await?;
//!
//!     // let receipt = ledger.deposit(Principal::new("alice"), 1_000).await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    accounting::DepositReceipt,
    actor::{spawn_ledger_actor, LedgerHandle, LedgerMessage},
    clock::{Clock, SystemClock},
    engine::LedgerCore,
    metrics::Metrics,
    schema::SchemaRegistry,
    storage::{Storage, StorageStats},
    transfer::AssetTransferProvider,
    types::{
        Account, Amount, AssetId, Bps, GlobalState, LedgerEvent, Principal, Role, WithdrawalRequest,
    },
    version::LedgerVersion,
    Config, Error, Result,
};
use std::sync::Arc;

/// Main ledger interface
///
/// Cheap to clone; every clone talks to the same actor.
#[derive(Debug, Clone)]
pub struct Ledger {
    /// Actor handle for all operations and reads
    handle: LedgerHandle,

    /// Metrics of this instance
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration, the system clock and the built-in layouts
    pub async fn open(config: Config, provider: Arc<dyn AssetTransferProvider>) -> Result<Self> {
        Self::open_with(
            config,
            provider,
            Arc::new(SystemClock::new()),
            SchemaRegistry::builtin(),
        )
        .await
    }

    /// Open ledger with an explicit clock and schema registry
    pub async fn open_with(
        config: Config,
        provider: Arc<dyn AssetTransferProvider>,
        clock: Arc<dyn Clock>,
        registry: SchemaRegistry,
    ) -> Result<Self> {
        config.validate()?;

        // Open storage
        let storage = Arc::new(Storage::open(&config)?);

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let core = LedgerCore::new(
            storage,
            registry,
            provider,
            clock,
            metrics.clone(),
            config.ledger.clone(),
        )?;

        // Spawn actor
        let handle = spawn_ledger_actor(core, config.ledger.mailbox_capacity);

        tracing::info!(
            service = %config.service_name,
            data_dir = ?config.data_dir,
            "Custody ledger opened"
        );

        Ok(Self {
            handle,
            metrics,
            config,
        })
    }

    /// One-time setup: activate the genesis version and give `admin` every role
    pub async fn initialize(
        &self,
        asset: AssetId,
        admin: Principal,
        deposit_fee_bps: Bps,
    ) -> Result<()> {
        self.handle
            .call(|response| LedgerMessage::Initialize {
                asset,
                admin,
                deposit_fee_bps,
                response,
            })
            .await
    }

    // Accounting

    /// Pull `amount` from `principal` and credit it net of the deposit fee
    pub async fn deposit(&self, principal: Principal, amount: Amount) -> Result<DepositReceipt> {
        self.handle
            .call(|response| LedgerMessage::Deposit {
                principal,
                amount,
                response,
            })
            .await
    }

    /// Debit `amount` from `principal` and push it out of custody
    pub async fn withdraw(&self, principal: Principal, amount: Amount) -> Result<()> {
        self.handle
            .call(|response| LedgerMessage::Withdraw {
                principal,
                amount,
                response,
            })
            .await
    }

    /// Change the deposit fee (Admin)
    pub async fn set_deposit_fee(&self, admin: Principal, fee_bps: Bps) -> Result<()> {
        self.handle
            .call(|response| LedgerMessage::SetDepositFee {
                admin,
                fee_bps,
                response,
            })
            .await
    }

    /// Reject deposits until unpaused (Pauser)
    pub async fn pause_deposits(&self, pauser: Principal) -> Result<()> {
        self.handle
            .call(|response| LedgerMessage::SetDepositsPaused {
                pauser,
                paused: true,
                response,
            })
            .await
    }

    /// Accept deposits again (Pauser)
    pub async fn unpause_deposits(&self, pauser: Principal) -> Result<()> {
        self.handle
            .call(|response| LedgerMessage::SetDepositsPaused {
                pauser,
                paused: false,
                response,
            })
            .await
    }

    /// Balance of `principal` (0 for unknown principals)
    pub async fn balance_of(&self, principal: Principal) -> Result<Amount> {
        Ok(self.account(principal).await?.balance)
    }

    /// Sum of all balances
    pub async fn total_deposits(&self) -> Result<Amount> {
        Ok(self.global_state().await?.total_deposits)
    }

    /// Current global record
    pub async fn global_state(&self) -> Result<GlobalState> {
        self.handle
            .call(|response| LedgerMessage::GetGlobalState { response })
            .await
    }

    /// Account of `principal` as seen by the active version
    pub async fn account(&self, principal: Principal) -> Result<Account> {
        self.handle
            .call(|response| LedgerMessage::GetAccount {
                principal,
                response,
            })
            .await
    }

    // Roles

    /// Grant `role` to `account` (Admin); false when already held
    pub async fn grant_role(
        &self,
        admin: Principal,
        account: Principal,
        role: Role,
    ) -> Result<bool> {
        self.handle
            .call(|response| LedgerMessage::GrantRole {
                admin,
                account,
                role,
                response,
            })
            .await
    }

    /// Revoke `role` from `account` (Admin); false when not held
    pub async fn revoke_role(
        &self,
        admin: Principal,
        account: Principal,
        role: Role,
    ) -> Result<bool> {
        self.handle
            .call(|response| LedgerMessage::RevokeRole {
                admin,
                account,
                role,
                response,
            })
            .await
    }

    /// Whether `principal` holds `role`
    pub async fn has_role(&self, principal: Principal, role: Role) -> Result<bool> {
        self.handle
            .call(|response| LedgerMessage::HasRole {
                principal,
                role,
                response,
            })
            .await
    }

    /// Current holders of `role`
    pub async fn role_members(&self, role: Role) -> Result<Vec<Principal>> {
        self.handle
            .call(|response| LedgerMessage::RoleMembers { role, response })
            .await
    }

    // Yield (v2)

    /// Change the annual yield rate (Admin)
    pub async fn set_yield_rate(&self, admin: Principal, rate_bps: Bps) -> Result<()> {
        self.handle
            .call(|response| LedgerMessage::SetYieldRate {
                admin,
                rate_bps,
                response,
            })
            .await
    }

    /// Yield `principal` could claim now
    pub async fn accrued_yield(&self, principal: Principal) -> Result<Amount> {
        self.handle
            .call(|response| LedgerMessage::AccruedYield {
                principal,
                response,
            })
            .await
    }

    /// Credit accrued yield to the balance
    pub async fn claim_yield(&self, principal: Principal) -> Result<Amount> {
        self.handle
            .call(|response| LedgerMessage::ClaimYield {
                principal,
                response,
            })
            .await
    }

    // Delayed withdrawals (v3)

    /// Record a withdrawal intent, replacing any pending one
    pub async fn request_withdrawal(&self, principal: Principal, amount: Amount) -> Result<()> {
        self.handle
            .call(|response| LedgerMessage::RequestWithdrawal {
                principal,
                amount,
                response,
            })
            .await
    }

    /// Execute the pending request once the delay has elapsed
    pub async fn execute_withdrawal(&self, principal: Principal) -> Result<Amount> {
        self.handle
            .call(|response| LedgerMessage::ExecuteWithdrawal {
                principal,
                response,
            })
            .await
    }

    /// Withdraw the whole balance now, ignoring the delay
    pub async fn emergency_withdraw(&self, principal: Principal) -> Result<Amount> {
        self.handle
            .call(|response| LedgerMessage::EmergencyWithdraw {
                principal,
                response,
            })
            .await
    }

    /// Change the withdrawal delay (Admin)
    pub async fn set_withdrawal_delay(&self, admin: Principal, delay_secs: u64) -> Result<()> {
        self.handle
            .call(|response| LedgerMessage::SetWithdrawalDelay {
                admin,
                delay_secs,
                response,
            })
            .await
    }

    /// Pending request of `principal`
    pub async fn pending_withdrawal(
        &self,
        principal: Principal,
    ) -> Result<Option<WithdrawalRequest>> {
        self.handle
            .call(|response| LedgerMessage::PendingWithdrawal {
                principal,
                response,
            })
            .await
    }

    // Versions

    /// Activate `target` (Upgrader)
    pub async fn upgrade(&self, principal: Principal, target: LedgerVersion) -> Result<()> {
        self.handle
            .call(|response| LedgerMessage::Upgrade {
                principal,
                target,
                response,
            })
            .await
    }

    /// Active version
    pub async fn active_version(&self) -> Result<LedgerVersion> {
        self.handle
            .call(|response| LedgerMessage::ActiveVersion { response })
            .await
    }

    // Audit

    /// Events concerning `principal`, oldest first
    pub async fn events_for(&self, principal: Principal) -> Result<Vec<LedgerEvent>> {
        self.handle
            .call(|response| LedgerMessage::EventsFor {
                principal,
                response,
            })
            .await
    }

    /// Check that balances sum to `total_deposits`; returns the total
    pub async fn check_conservation(&self) -> Result<Amount> {
        self.handle
            .call(|response| LedgerMessage::CheckConservation { response })
            .await
    }

    /// Approximate storage statistics
    pub async fn stats(&self) -> Result<StorageStats> {
        self.handle
            .call(|response| LedgerMessage::Stats { response })
            .await
    }

    /// Metrics of this instance
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration the ledger was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shutdown ledger; returns once storage is closed
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await
    }
}
