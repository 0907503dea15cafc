//! One-time setup and version switches
//!
//! `initialize` publishes the genesis layout. `upgrade` validates the stored
//! layout of the active version against the target's, runs the field
//! initializers of every version it passes, and activates the target in the
//! same batch. Account records are never rewritten: fields a version adds
//! read as zero from the reserved slots until first written.

use crate::accounting::validate_bps;
use crate::engine::LedgerCore;
use crate::schema::{validate_migration, Record};
use crate::storage::WriteSet;
use crate::types::{AssetId, Bps, EventKind, GlobalState, LedgerEvent, Principal, Role};
use crate::version::{LedgerVersion, Operation};
use crate::{Error, Result};
use tracing::{info, warn};

impl LedgerCore {
    /// Activate the genesis version, owned by `admin`
    pub(crate) fn initialize(
        &self,
        asset: AssetId,
        admin: &Principal,
        deposit_fee_bps: Bps,
    ) -> Result<()> {
        if let Some((global, _, _)) = self.load_global()? {
            if global.initialized {
                warn!(admin = %admin, "Rejected second initialization");
                return Err(Error::Reinitialization(format!(
                    "ledger already initialized at {}",
                    global.schema_version
                )));
            }
        }

        admin.validate()?;
        validate_bps(deposit_fee_bps, "deposit fee")?;

        let genesis = self.registry.genesis()?.clone();
        genesis.global.check_well_formed("global")?;
        genesis.account.check_well_formed("account")?;

        let version = genesis.version;
        let now = self.clock.now();
        let global = GlobalState {
            initialized: true,
            schema_version: version,
            asset: Some(asset.clone()),
            total_deposits: 0,
            deposit_fee_bps,
            deposits_paused: false,
            collected_fees: 0,
            yield_rate_bps: 0,
            withdrawal_delay_secs: 0,
        };
        let mut record = Record::zeroed(&genesis.global);
        global.encode_into(&genesis.global, &mut record)?;

        let mut writes = WriteSet::default();
        writes.put_global(record.to_bytes());
        writes.publish_schema(genesis);
        writes.append_event(LedgerEvent::new(
            admin.clone(),
            EventKind::Initialized {
                asset: asset.clone(),
                deposit_fee_bps,
            },
            now,
            version,
        ));
        for role in Role::ALL {
            writes.grant_role(role, admin.clone());
            writes.append_event(LedgerEvent::new(
                admin.clone(),
                EventKind::RoleGranted {
                    role,
                    account: admin.clone(),
                },
                now,
                version,
            ));
        }

        self.storage.commit(&writes)?;
        self.metrics.set_total_deposits(0);

        info!(asset = %asset, admin = %admin, deposit_fee_bps, %version, "Ledger initialized");
        Ok(())
    }

    /// Switch the active version to `target`
    pub(crate) fn upgrade(&self, principal: &Principal, target: LedgerVersion) -> Result<()> {
        let mut txn = self.begin()?;
        txn.require(Operation::Upgrade)?;
        self.auth.require_role(principal, Role::Upgrader)?;

        let from = txn.version();
        if target == from {
            return Err(Error::Reinitialization(format!("{} is already active", target)));
        }
        if target < from {
            return Err(Error::SchemaConflict(format!(
                "downgrade from {} to {} would drop fields",
                from, target
            )));
        }

        let active = self.storage.get_schema(from)?.ok_or_else(|| {
            Error::SchemaConflict(format!("no stored schema for active version {}", from))
        })?;
        let next = self.registry.get(target)?.clone();
        if let Err(e) = validate_migration(&active, &next) {
            warn!(from = %from, to = %target, error = %e, "Upgrade rejected");
            return Err(e);
        }

        let default_delay = self.config.default_withdrawal_delay_secs;
        for step in from.steps_to(target) {
            step.initialize_fields(txn.global_mut(), default_delay);
        }
        txn.global_mut().schema_version = target;
        txn.activate_schema(next);
        txn.emit(principal.clone(), EventKind::Upgraded { from, to: target });
        self.commit(txn)?;

        info!(principal = %principal, from = %from, to = %target, "Ledger upgraded");
        Ok(())
    }

    /// Version whose operation set is active
    pub(crate) fn active_version(&self) -> Result<LedgerVersion> {
        Ok(self.begin()?.version())
    }
}
