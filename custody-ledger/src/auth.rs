//! Role-based authorization
//!
//! Every gated operation calls [`AuthorizationGate::require_role`] before it
//! touches state. Membership lives in the `roles` column family; there is no
//! superuser outside of it.

use crate::engine::{LedgerCore, Txn};
use crate::storage::Storage;
use crate::types::{EventKind, Principal, Role};
use crate::version::Operation;
use crate::{Error, Result};
use std::sync::Arc;

/// Role membership store
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    storage: Arc<Storage>,
}

impl AuthorizationGate {
    /// Create gate over storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Whether `principal` holds `role`
    pub fn has_role(&self, principal: &Principal, role: Role) -> Result<bool> {
        self.storage.has_role(role, principal)
    }

    /// Fail with `Authorization` unless `principal` holds `role`
    pub fn require_role(&self, principal: &Principal, role: Role) -> Result<()> {
        if self.has_role(principal, role)? {
            Ok(())
        } else {
            tracing::warn!(principal = %principal, role = %role, "Authorization denied");
            Err(Error::Authorization {
                principal: principal.clone(),
                role,
            })
        }
    }

    /// Stage a grant; returns false when `account` already holds the role
    pub(crate) fn grant_role(
        &self,
        txn: &mut Txn,
        admin: &Principal,
        account: &Principal,
        role: Role,
    ) -> Result<bool> {
        self.require_role(admin, Role::Admin)?;
        account.validate()?;

        if self.has_role(account, role)? {
            return Ok(false);
        }

        txn.writes_mut().grant_role(role, account.clone());
        txn.emit(
            account.clone(),
            EventKind::RoleGranted {
                role,
                account: account.clone(),
            },
        );
        Ok(true)
    }

    /// Stage a revocation; returns false when `account` does not hold the role
    pub(crate) fn revoke_role(
        &self,
        txn: &mut Txn,
        admin: &Principal,
        account: &Principal,
        role: Role,
    ) -> Result<bool> {
        self.require_role(admin, Role::Admin)?;

        if !self.has_role(account, role)? {
            return Ok(false);
        }

        txn.writes_mut().revoke_role(role, account.clone());
        txn.emit(
            account.clone(),
            EventKind::RoleRevoked {
                role,
                account: account.clone(),
            },
        );
        Ok(true)
    }
}

impl LedgerCore {
    /// Grant `role` to `account`; false when it was already held
    pub(crate) fn grant_role(
        &self,
        admin: &Principal,
        account: &Principal,
        role: Role,
    ) -> Result<bool> {
        let mut txn = self.begin()?;
        txn.require(Operation::GrantRole)?;

        let granted = self.auth.grant_role(&mut txn, admin, account, role)?;
        if granted {
            self.commit(txn)?;
            tracing::info!(admin = %admin, account = %account, role = %role, "Role granted");
        }
        Ok(granted)
    }

    /// Revoke `role` from `account`; false when it was not held
    pub(crate) fn revoke_role(
        &self,
        admin: &Principal,
        account: &Principal,
        role: Role,
    ) -> Result<bool> {
        let mut txn = self.begin()?;
        txn.require(Operation::RevokeRole)?;

        let revoked = self.auth.revoke_role(&mut txn, admin, account, role)?;
        if revoked {
            self.commit(txn)?;
            tracing::info!(admin = %admin, account = %account, role = %role, "Role revoked");
        }
        Ok(revoked)
    }

    /// Current holders of `role`
    pub(crate) fn role_members(&self, role: Role) -> Result<Vec<Principal>> {
        self.storage.role_members(role)
    }
}
