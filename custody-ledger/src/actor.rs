//! Actor-based concurrency for the ledger
//!
//! Single-writer pattern using a Tokio actor:
//! - One task owns the ledger core and runs one message at a time
//! - An operation runs to completion, including its awaited transfer, before
//!   the next message is taken, so no two operations interleave
//! - Reads go through the same mailbox and never see a half-applied operation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Ledger (public API)                   │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                    │
//! │         Sends messages to actor mailbox               │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │   LedgerCore: Txn -> WriteSet -> provider call        │
//! │                       │                               │
//! │                       ▼                               │
//! │           Storage::commit (one WriteBatch)            │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::accounting::DepositReceipt;
use crate::engine::LedgerCore;
use crate::storage::StorageStats;
use crate::types::{
    Account, Amount, AssetId, Bps, GlobalState, LedgerEvent, Principal, Role, WithdrawalRequest,
};
use crate::version::{LedgerVersion, Operation};
use crate::{Error, ErrorKind, Result};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Message sent to the ledger actor
pub(crate) enum LedgerMessage {
    Initialize {
        asset: AssetId,
        admin: Principal,
        deposit_fee_bps: Bps,
        response: Reply<()>,
    },
    Deposit {
        principal: Principal,
        amount: Amount,
        response: Reply<DepositReceipt>,
    },
    Withdraw {
        principal: Principal,
        amount: Amount,
        response: Reply<()>,
    },
    SetDepositFee {
        admin: Principal,
        fee_bps: Bps,
        response: Reply<()>,
    },
    SetDepositsPaused {
        pauser: Principal,
        paused: bool,
        response: Reply<()>,
    },
    GrantRole {
        admin: Principal,
        account: Principal,
        role: Role,
        response: Reply<bool>,
    },
    RevokeRole {
        admin: Principal,
        account: Principal,
        role: Role,
        response: Reply<bool>,
    },
    SetYieldRate {
        admin: Principal,
        rate_bps: Bps,
        response: Reply<()>,
    },
    ClaimYield {
        principal: Principal,
        response: Reply<Amount>,
    },
    RequestWithdrawal {
        principal: Principal,
        amount: Amount,
        response: Reply<()>,
    },
    ExecuteWithdrawal {
        principal: Principal,
        response: Reply<Amount>,
    },
    EmergencyWithdraw {
        principal: Principal,
        response: Reply<Amount>,
    },
    SetWithdrawalDelay {
        admin: Principal,
        delay_secs: u64,
        response: Reply<()>,
    },
    Upgrade {
        principal: Principal,
        target: LedgerVersion,
        response: Reply<()>,
    },

    // Reads
    HasRole {
        principal: Principal,
        role: Role,
        response: Reply<bool>,
    },
    RoleMembers {
        role: Role,
        response: Reply<Vec<Principal>>,
    },
    AccruedYield {
        principal: Principal,
        response: Reply<Amount>,
    },
    PendingWithdrawal {
        principal: Principal,
        response: Reply<Option<WithdrawalRequest>>,
    },
    GetGlobalState {
        response: Reply<GlobalState>,
    },
    GetAccount {
        principal: Principal,
        response: Reply<Account>,
    },
    ActiveVersion {
        response: Reply<LedgerVersion>,
    },
    EventsFor {
        principal: Principal,
        response: Reply<Vec<LedgerEvent>>,
    },
    CheckConservation {
        response: Reply<Amount>,
    },
    Stats {
        response: Reply<StorageStats>,
    },

    /// Stop after the current message; confirmed once storage is released
    Shutdown { response: oneshot::Sender<()> },
}

/// Actor that processes ledger messages
pub(crate) struct LedgerActor {
    core: LedgerCore,
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl LedgerActor {
    /// Create new actor
    pub(crate) fn new(core: LedgerCore, mailbox: mpsc::Receiver<LedgerMessage>) -> Self {
        Self { core, mailbox }
    }

    /// Run the actor event loop
    pub(crate) async fn run(mut self) {
        let mut shutdown = None;

        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown { response } => {
                    shutdown = Some(response);
                    break;
                }
                msg => self.handle_message(msg).await,
            }
        }

        // release the RocksDB handle before confirming
        drop(self);
        info!("Ledger actor stopped");

        if let Some(response) = shutdown {
            let _ = response.send(());
        }
    }

    /// Handle a single message
    async fn handle_message(&self, msg: LedgerMessage) {
        let core = &self.core;

        match msg {
            LedgerMessage::Initialize {
                asset,
                admin,
                deposit_fee_bps,
                response,
            } => {
                let started = Instant::now();
                let result = core.initialize(asset, &admin, deposit_fee_bps);
                self.observe("initialize", started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::Deposit {
                principal,
                amount,
                response,
            } => {
                let started = Instant::now();
                let result = core.deposit(&principal, amount).await;
                self.observe(Operation::Deposit.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::Withdraw {
                principal,
                amount,
                response,
            } => {
                let started = Instant::now();
                let result = core.withdraw(&principal, amount).await;
                self.observe(Operation::Withdraw.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::SetDepositFee {
                admin,
                fee_bps,
                response,
            } => {
                let started = Instant::now();
                let result = core.set_deposit_fee(&admin, fee_bps);
                self.observe(Operation::SetDepositFee.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::SetDepositsPaused {
                pauser,
                paused,
                response,
            } => {
                let started = Instant::now();
                let result = core.set_deposits_paused(&pauser, paused);
                let operation = if paused {
                    Operation::PauseDeposits
                } else {
                    Operation::UnpauseDeposits
                };
                self.observe(operation.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::GrantRole {
                admin,
                account,
                role,
                response,
            } => {
                let started = Instant::now();
                let result = core.grant_role(&admin, &account, role);
                self.observe(Operation::GrantRole.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::RevokeRole {
                admin,
                account,
                role,
                response,
            } => {
                let started = Instant::now();
                let result = core.revoke_role(&admin, &account, role);
                self.observe(Operation::RevokeRole.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::SetYieldRate {
                admin,
                rate_bps,
                response,
            } => {
                let started = Instant::now();
                let result = core.set_yield_rate(&admin, rate_bps);
                self.observe(Operation::SetYieldRate.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::ClaimYield {
                principal,
                response,
            } => {
                let started = Instant::now();
                let result = core.claim_yield(&principal);
                self.observe(Operation::ClaimYield.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::RequestWithdrawal {
                principal,
                amount,
                response,
            } => {
                let started = Instant::now();
                let result = core.request_withdrawal(&principal, amount);
                self.observe(Operation::RequestWithdrawal.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::ExecuteWithdrawal {
                principal,
                response,
            } => {
                let started = Instant::now();
                let result = core.execute_withdrawal(&principal).await;
                self.observe(Operation::ExecuteWithdrawal.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::EmergencyWithdraw {
                principal,
                response,
            } => {
                let started = Instant::now();
                let result = core.emergency_withdraw(&principal).await;
                self.observe(Operation::EmergencyWithdraw.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::SetWithdrawalDelay {
                admin,
                delay_secs,
                response,
            } => {
                let started = Instant::now();
                let result = core.set_withdrawal_delay(&admin, delay_secs);
                self.observe(Operation::SetWithdrawalDelay.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::Upgrade {
                principal,
                target,
                response,
            } => {
                let started = Instant::now();
                let result = core.upgrade(&principal, target);
                self.observe(Operation::Upgrade.as_str(), started, &result);
                let _ = response.send(result);
            }

            LedgerMessage::HasRole {
                principal,
                role,
                response,
            } => {
                let _ = response.send(core.auth.has_role(&principal, role));
            }

            LedgerMessage::RoleMembers { role, response } => {
                let _ = response.send(core.role_members(role));
            }

            LedgerMessage::AccruedYield {
                principal,
                response,
            } => {
                let _ = response.send(core.accrued_yield(&principal));
            }

            LedgerMessage::PendingWithdrawal {
                principal,
                response,
            } => {
                let _ = response.send(core.pending_withdrawal(&principal));
            }

            LedgerMessage::GetGlobalState { response } => {
                let _ = response.send(core.begin().map(|txn| txn.global().clone()));
            }

            LedgerMessage::GetAccount {
                principal,
                response,
            } => {
                let result = core.begin().and_then(|mut txn| {
                    let account = txn.account(&principal)?.clone();
                    Ok(account)
                });
                let _ = response.send(result);
            }

            LedgerMessage::ActiveVersion { response } => {
                let _ = response.send(core.active_version());
            }

            LedgerMessage::EventsFor {
                principal,
                response,
            } => {
                let _ = response.send(core.events_for(&principal));
            }

            LedgerMessage::CheckConservation { response } => {
                let _ = response.send(core.check_conservation());
            }

            LedgerMessage::Stats { response } => {
                let _ = response.send(core.storage.get_stats());
            }

            LedgerMessage::Shutdown { .. } => {
                // Handled in main loop
            }
        }
    }

    /// Record outcome and latency of a state-changing operation
    fn observe<T>(&self, operation: &str, started: Instant, result: &Result<T>) {
        let elapsed = started.elapsed().as_secs_f64();
        let outcome = match result {
            Ok(_) => {
                debug!(operation, elapsed, "Operation applied");
                "ok"
            }
            Err(e) => {
                let kind = e.kind();
                if kind == ErrorKind::Internal {
                    error!(operation, error = %e, "Operation failed");
                } else {
                    warn!(operation, error = %e, "Operation rejected");
                }
                kind.as_str()
            }
        };
        self.core
            .metrics
            .record_operation(operation, outcome, elapsed);
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub(crate) struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub(crate) fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    /// Send a message built around a fresh reply channel and await the reply
    pub(crate) async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> LedgerMessage) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor and wait until it has released storage
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LedgerMessage::Shutdown { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Actor stopped without confirming".to_string()))
    }
}

/// Spawn the ledger actor
pub(crate) fn spawn_ledger_actor(core: LedgerCore, mailbox_capacity: usize) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity); // Bounded channel for backpressure
    let actor = LedgerActor::new(core, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}
