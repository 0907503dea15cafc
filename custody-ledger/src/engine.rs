//! Transactional core shared by the operation modules
//!
//! An operation stages its reads and writes in a [`Txn`]: records are loaded
//! with the active layout, mutated as typed values, and turned into a forward
//! [`WriteSet`] plus the compensating one that restores the prior bytes. The
//! forward set is committed as one batch; the compensating set is only used
//! when an outbound transfer fails after commit.

use crate::auth::AuthorizationGate;
use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::metrics::Metrics;
use crate::schema::{Record, SchemaRegistry, SchemaVersion};
use crate::storage::{Storage, WriteSet};
use crate::transfer::AssetTransferProvider;
use crate::types::{Account, Amount, EventKind, GlobalState, LedgerEvent, Principal, Timestamp};
use crate::version::{LedgerVersion, Operation};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// State and collaborators owned by the ledger actor
pub(crate) struct LedgerCore {
    pub(crate) storage: Arc<Storage>,
    pub(crate) registry: SchemaRegistry,
    pub(crate) provider: Arc<dyn AssetTransferProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) auth: AuthorizationGate,
    pub(crate) metrics: Metrics,
    pub(crate) config: LedgerConfig,
}

impl fmt::Debug for LedgerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerCore")
            .field("storage", &self.storage)
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LedgerCore {
    /// Assemble the core and check the stored schema against the registry
    pub(crate) fn new(
        storage: Arc<Storage>,
        registry: SchemaRegistry,
        provider: Arc<dyn AssetTransferProvider>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        config: LedgerConfig,
    ) -> Result<Self> {
        let core = Self {
            auth: AuthorizationGate::new(storage.clone()),
            storage,
            registry,
            provider,
            clock,
            metrics,
            config,
        };
        core.verify_stored_schema()?;
        Ok(core)
    }

    /// The persisted layout of the active version must be the one this build ships
    fn verify_stored_schema(&self) -> Result<()> {
        let Some((global, _, _)) = self.load_global()? else {
            return Ok(());
        };
        if !global.initialized {
            return Ok(());
        }

        let expected = self.registry.get(global.schema_version)?;
        let stored = self
            .storage
            .get_schema(global.schema_version)?
            .ok_or_else(|| {
                Error::SchemaConflict(format!(
                    "no stored schema for active version {}",
                    global.schema_version
                ))
            })?;

        if stored.fingerprint() != expected.fingerprint() {
            return Err(Error::SchemaConflict(format!(
                "stored schema for {} ({}) differs from this build ({})",
                global.schema_version,
                stored.fingerprint(),
                expected.fingerprint()
            )));
        }

        self.metrics.set_total_deposits(global.total_deposits);
        debug!(version = %global.schema_version, "Stored schema verified");
        Ok(())
    }

    /// Decode the global record: version from the genesis layout, then the rest
    pub(crate) fn load_global(&self) -> Result<Option<(GlobalState, SchemaVersion, Vec<u8>)>> {
        let Some(raw) = self.storage.get_global_raw()? else {
            return Ok(None);
        };

        let genesis = self.registry.genesis()?;
        let stored = Record::from_bytes(&genesis.global, &raw)?;
        let version = GlobalState::decode(&genesis.global, &stored)?.schema_version;

        let schema = self.registry.get(version)?.clone();
        let record = Record::from_bytes(&schema.global, &raw)?;
        Ok(Some((GlobalState::decode(&schema.global, &record)?, schema, raw)))
    }

    /// Start an operation against the initialized ledger
    pub(crate) fn begin(&self) -> Result<Txn> {
        let (global, schema, raw) = self.load_global()?.ok_or(Error::NotInitialized)?;
        if !global.initialized {
            return Err(Error::NotInitialized);
        }

        let global_record = Record::from_bytes(&schema.global, &raw)?;
        Ok(Txn {
            storage: self.storage.clone(),
            schema,
            now: self.clock.now(),
            global_initial: global.clone(),
            global,
            global_record,
            global_before: raw,
            accounts: BTreeMap::new(),
            events: Vec::new(),
            writes: WriteSet::default(),
        })
    }

    /// Commit a staged operation, returning its compensating write set
    pub(crate) fn commit(&self, txn: Txn) -> Result<WriteSet> {
        let staged = txn.into_writes()?;
        self.storage.commit(&staged.forward)?;
        self.metrics.set_total_deposits(staged.total_deposits);
        Ok(staged.undo)
    }

    /// Push `amount` to `principal` after its debit was committed
    ///
    /// On provider failure the debit is undone with `undo` and the operation
    /// reports `TransferFailed`.
    pub(crate) async fn push_or_revert(
        &self,
        principal: &Principal,
        amount: Amount,
        undo: WriteSet,
    ) -> Result<()> {
        let Err(cause) = self.provider.push(principal, amount).await else {
            return Ok(());
        };

        warn!(principal = %principal, amount, error = %cause, "Push failed, reverting debit");
        self.metrics.record_transfer_failure();

        if let Err(rollback) = self.storage.commit(&undo) {
            error!(
                principal = %principal,
                amount,
                error = %rollback,
                "Rollback after failed push did not apply"
            );
            return Err(Error::InvariantViolation(format!(
                "debit of {} for {} committed but push failed ({}) and rollback failed ({})",
                amount, principal, cause, rollback
            )));
        }

        // the gauge tracks committed state, which is the pre-operation state again
        if let Some((global, _, _)) = self.load_global()? {
            self.metrics.set_total_deposits(global.total_deposits);
        }
        Err(transfer_failed(cause))
    }

    /// Sum of account balances must equal `total_deposits`
    pub(crate) fn check_conservation(&self) -> Result<Amount> {
        let txn = self.begin()?;
        let layout = &txn.schema.account;

        let mut sum: u128 = 0;
        for (_, raw) in self.storage.account_records()? {
            sum += Account::decode(layout, &Record::from_bytes(layout, &raw)?).balance as u128;
        }

        let total = txn.global.total_deposits;
        if sum != total as u128 {
            return Err(Error::InvariantViolation(format!(
                "account balances sum to {}, total_deposits is {}",
                sum, total
            )));
        }
        Ok(total)
    }

    /// Audit trail of `principal`
    pub(crate) fn events_for(&self, principal: &Principal) -> Result<Vec<LedgerEvent>> {
        let mut events = self.storage.events_for(principal)?;
        events.sort_by_key(|e| (e.timestamp, e.event_id));
        Ok(events)
    }
}

/// Provider errors of any kind surface as `TransferFailed`
pub(crate) fn transfer_failed(err: Error) -> Error {
    match err {
        Error::TransferFailed(_) => err,
        other => Error::TransferFailed(other.to_string()),
    }
}

/// `value * numerator / denominator` rounded down, in 128 bits
pub(crate) fn mul_div(value: u64, numerator: u64, denominator: u128) -> Result<Amount> {
    let product = (value as u128)
        .checked_mul(numerator as u128)
        .ok_or_else(|| Error::Overflow(format!("{} * {}", value, numerator)))?;
    let quotient = product
        .checked_div(denominator)
        .ok_or_else(|| Error::Overflow("division by zero".to_string()))?;
    Amount::try_from(quotient)
        .map_err(|_| Error::Overflow(format!("{} does not fit 64 bits", quotient)))
}

/// `a + b`, failing instead of wrapping
pub(crate) fn checked_add(a: Amount, b: Amount, what: &str) -> Result<Amount> {
    a.checked_add(b)
        .ok_or_else(|| Error::Overflow(format!("{} would exceed {}", what, Amount::MAX)))
}

struct StagedAccount {
    account: Account,
    initial: Account,
    record: Record,
    before: Option<Vec<u8>>,
}

struct StagedWrites {
    forward: WriteSet,
    undo: WriteSet,
    total_deposits: Amount,
}

/// Working copy of one operation
pub(crate) struct Txn {
    storage: Arc<Storage>,
    schema: SchemaVersion,
    now: Timestamp,
    global: GlobalState,
    global_initial: GlobalState,
    global_record: Record,
    global_before: Vec<u8>,
    accounts: BTreeMap<Principal, StagedAccount>,
    events: Vec<LedgerEvent>,
    writes: WriteSet,
}

impl Txn {
    /// Operation time
    pub(crate) fn now(&self) -> Timestamp {
        self.now
    }

    /// Active version
    pub(crate) fn version(&self) -> LedgerVersion {
        self.global.schema_version
    }

    /// Fail unless `operation` is part of the active version
    pub(crate) fn require(&self, operation: Operation) -> Result<()> {
        self.version().require(operation)
    }

    pub(crate) fn global(&self) -> &GlobalState {
        &self.global
    }

    pub(crate) fn global_mut(&mut self) -> &mut GlobalState {
        &mut self.global
    }

    /// Switch the layout used to encode records (version activation)
    pub(crate) fn activate_schema(&mut self, schema: SchemaVersion) {
        self.writes.publish_schema(schema.clone());
        self.schema = schema;
    }

    pub(crate) fn writes_mut(&mut self) -> &mut WriteSet {
        &mut self.writes
    }

    /// Account of `principal`, zeroed when it has no record yet
    pub(crate) fn account(&mut self, principal: &Principal) -> Result<&Account> {
        Ok(&self.stage(principal)?.account)
    }

    pub(crate) fn account_mut(&mut self, principal: &Principal) -> Result<&mut Account> {
        Ok(&mut self.stage(principal)?.account)
    }

    fn stage(&mut self, principal: &Principal) -> Result<&mut StagedAccount> {
        if !self.accounts.contains_key(principal) {
            let before = self.storage.get_account_raw(principal)?;
            let record = match &before {
                Some(bytes) => Record::from_bytes(&self.schema.account, bytes)?,
                None => Record::zeroed(&self.schema.account),
            };
            let account = Account::decode(&self.schema.account, &record);
            self.accounts.insert(
                principal.clone(),
                StagedAccount {
                    initial: account.clone(),
                    account,
                    record,
                    before,
                },
            );
        }

        self.accounts
            .get_mut(principal)
            .ok_or_else(|| Error::InvariantViolation(format!("account {} not staged", principal)))
    }

    /// Add `amount` to the balance of `principal` and to the total
    pub(crate) fn credit(&mut self, principal: &Principal, amount: Amount) -> Result<()> {
        let balance = checked_add(self.account(principal)?.balance, amount, "balance")?;
        let total = checked_add(self.global.total_deposits, amount, "total deposits")?;
        self.account_mut(principal)?.balance = balance;
        self.global.total_deposits = total;
        Ok(())
    }

    /// Take `amount` from the balance of `principal` and from the total
    pub(crate) fn debit(&mut self, principal: &Principal, amount: Amount) -> Result<()> {
        let available = self.account(principal)?.balance;
        if amount > available {
            return Err(Error::InsufficientBalance {
                principal: principal.clone(),
                requested: amount,
                available,
            });
        }
        let total = self.global.total_deposits.checked_sub(amount).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "debit of {} exceeds total deposits {}",
                amount, self.global.total_deposits
            ))
        })?;

        self.account_mut(principal)?.balance = available - amount;
        self.global.total_deposits = total;
        Ok(())
    }

    /// Record an audit event at operation time
    pub(crate) fn emit(&mut self, principal: Principal, kind: EventKind) {
        self.events.push(LedgerEvent::new(
            principal,
            kind,
            self.now,
            self.global.schema_version,
        ));
    }

    fn into_writes(self) -> Result<StagedWrites> {
        let Txn {
            schema,
            global,
            global_initial,
            mut global_record,
            global_before,
            accounts,
            events,
            writes: mut forward,
            ..
        } = self;
        let mut undo = WriteSet::default();

        if global != global_initial {
            global.encode_into(&schema.global, &mut global_record)?;
            forward.put_global(global_record.to_bytes());
            undo.put_global(global_before);
        }

        for (principal, staged) in accounts {
            if staged.account == staged.initial {
                continue;
            }
            let mut record = staged.record;
            staged.account.encode_into(&schema.account, &mut record)?;
            forward.put_account(principal.clone(), Some(record.to_bytes()));
            undo.put_account(principal, staged.before);
        }

        for event in events {
            undo.remove_event(event.clone());
            forward.append_event(event);
        }

        Ok(StagedWrites {
            forward,
            undo,
            total_deposits: global.total_deposits,
        })
    }
}
