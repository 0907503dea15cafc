//! Core types for the custody ledger
//!
//! Amounts are integers in the asset's smallest unit, rates are basis points
//! and timestamps are unix seconds. Typed records ([`Account`],
//! [`GlobalState`]) are decoded from and encoded into slot records through a
//! [`RecordLayout`], so a record only ever carries the fields its schema knows.

use crate::schema::{fields, Record, RecordLayout};
use crate::version::LedgerVersion;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Amount in the asset's smallest unit
pub type Amount = u64;

/// Basis points (1/10000)
pub type Bps = u64;

/// Unix timestamp in seconds
pub type Timestamp = u64;

/// Basis-points scale
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Seconds in a (non-leap) year, the yield accrual period
pub const SECONDS_PER_YEAR: u64 = 365 * 86_400;

/// Upper bound for the withdrawal delay (30 days)
pub const MAX_WITHDRAWAL_DELAY_SECS: u64 = 30 * 86_400;

/// Maximum encoded length of an [`AssetId`]
pub const ASSET_ID_MAX_LEN: usize = 32;

/// Identity that holds a balance and invokes operations
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    /// Create new principal
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject identities that cannot own an account
    pub fn validate(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(Error::Validation("principal must not be empty".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the single custodied asset (e.g. a token symbol or address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetId(String);

impl AssetId {
    /// Create asset id, at most 32 bytes, non-empty, no NUL bytes
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > ASSET_ID_MAX_LEN || id.contains('\0') {
            return Err(Error::Validation(format!(
                "asset id must be 1..={} bytes without NUL",
                ASSET_ID_MAX_LEN
            )));
        }
        Ok(Self(id))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pack into four little-endian slots, zero padded
    pub(crate) fn to_words(&self) -> [u64; 4] {
        let mut bytes = [0u8; ASSET_ID_MAX_LEN];
        bytes[..self.0.len()].copy_from_slice(self.0.as_bytes());
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *word = u64::from_le_bytes(buf);
        }
        words
    }

    /// Unpack from slots; all-zero slots decode to `None`
    pub(crate) fn from_words(words: &[u64]) -> Result<Option<Self>> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        if end == 0 {
            return Ok(None);
        }
        let id = String::from_utf8(bytes[..end].to_vec())
            .map_err(|e| Error::Storage(format!("corrupt asset id: {}", e)))?;
        Ok(Some(Self(id)))
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named permission bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    /// Configuration and role management
    Admin = 1,
    /// May trigger version switches
    Upgrader = 2,
    /// May pause and unpause deposits
    Pauser = 3,
}

impl Role {
    /// All roles recognized by the ledger
    pub const ALL: [Role; 3] = [Role::Admin, Role::Upgrader, Role::Pauser];

    /// Role name
    pub fn name(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Upgrader => "UPGRADER",
            Role::Pauser => "PAUSER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Pending, delayed withdrawal intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Requested amount (> 0)
    pub amount: Amount,
    /// Request time
    pub requested_at: Timestamp,
}

impl WithdrawalRequest {
    /// Earliest time the request may be executed under `delay_secs`
    pub fn ready_at(&self, delay_secs: u64) -> Timestamp {
        self.requested_at.saturating_add(delay_secs)
    }
}

/// Per-principal account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Balance in smallest units
    pub balance: Amount,
    /// Start of the current yield accrual window (0 = never accrued)
    pub yield_baseline: Timestamp,
    /// Outstanding withdrawal request
    pub pending_withdrawal: Option<WithdrawalRequest>,
}

impl Account {
    /// Decode from a record; fields missing from the layout read as zero
    pub fn decode(layout: &RecordLayout, record: &Record) -> Self {
        let pending_amount = record.get(layout, fields::PENDING_AMOUNT);
        let pending_withdrawal = (pending_amount > 0).then(|| WithdrawalRequest {
            amount: pending_amount,
            requested_at: record.get(layout, fields::PENDING_REQUESTED_AT),
        });

        Self {
            balance: record.get(layout, fields::BALANCE),
            yield_baseline: record.get(layout, fields::YIELD_BASELINE),
            pending_withdrawal,
        }
    }

    /// Encode into a record, touching only the fields the layout defines
    pub fn encode_into(&self, layout: &RecordLayout, record: &mut Record) -> Result<()> {
        let (pending_amount, pending_at) = self
            .pending_withdrawal
            .map(|r| (r.amount, r.requested_at))
            .unwrap_or((0, 0));

        record.set(layout, fields::BALANCE, self.balance)?;
        record.set_if_present(layout, fields::YIELD_BASELINE, self.yield_baseline)?;
        record.set_if_present(layout, fields::PENDING_AMOUNT, pending_amount)?;
        record.set_if_present(layout, fields::PENDING_REQUESTED_AT, pending_at)?;
        Ok(())
    }
}

/// Process-wide ledger configuration and aggregates, owned by one ledger instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalState {
    /// One-time setup done
    pub initialized: bool,
    /// Active version
    pub schema_version: LedgerVersion,
    /// Custodied asset
    pub asset: Option<AssetId>,
    /// Sum of all account balances
    pub total_deposits: Amount,
    /// Deposit fee
    pub deposit_fee_bps: Bps,
    /// Deposits paused flag
    pub deposits_paused: bool,
    /// Fees retained by the ledger
    pub collected_fees: Amount,
    /// Annual yield rate (V2)
    pub yield_rate_bps: Bps,
    /// Two-phase withdrawal delay (V3)
    pub withdrawal_delay_secs: u64,
}

impl GlobalState {
    /// Decode from a record
    pub fn decode(layout: &RecordLayout, record: &Record) -> Result<Self> {
        let raw_version = record.get(layout, fields::SCHEMA_VERSION);
        let schema_version = if raw_version == 0 {
            LedgerVersion::GENESIS
        } else {
            LedgerVersion::try_from(raw_version)?
        };

        Ok(Self {
            initialized: record.get(layout, fields::INITIALIZED) != 0,
            schema_version,
            asset: AssetId::from_words(&record.get_words(layout, fields::ASSET))?,
            total_deposits: record.get(layout, fields::TOTAL_DEPOSITS),
            deposit_fee_bps: record.get(layout, fields::DEPOSIT_FEE_BPS),
            deposits_paused: record.get(layout, fields::DEPOSITS_PAUSED) != 0,
            collected_fees: record.get(layout, fields::COLLECTED_FEES),
            yield_rate_bps: record.get(layout, fields::YIELD_RATE_BPS),
            withdrawal_delay_secs: record.get(layout, fields::WITHDRAWAL_DELAY_SECS),
        })
    }

    /// Encode into a record, touching only the fields the layout defines
    pub fn encode_into(&self, layout: &RecordLayout, record: &mut Record) -> Result<()> {
        let asset = self.asset.as_ref().map(AssetId::to_words).unwrap_or([0; 4]);

        record.set(layout, fields::INITIALIZED, self.initialized as u64)?;
        record.set(layout, fields::SCHEMA_VERSION, self.schema_version.number())?;
        record.set_words(layout, fields::ASSET, &asset)?;
        record.set(layout, fields::TOTAL_DEPOSITS, self.total_deposits)?;
        record.set(layout, fields::DEPOSIT_FEE_BPS, self.deposit_fee_bps)?;
        record.set(layout, fields::DEPOSITS_PAUSED, self.deposits_paused as u64)?;
        record.set(layout, fields::COLLECTED_FEES, self.collected_fees)?;
        record.set_if_present(layout, fields::YIELD_RATE_BPS, self.yield_rate_bps)?;
        record.set_if_present(layout, fields::WITHDRAWAL_DELAY_SECS, self.withdrawal_delay_secs)?;
        Ok(())
    }
}

/// Audit event appended alongside every state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Unique event ID (UUIDv7 for time-ordering)
    pub event_id: Uuid,
    /// Principal the event concerns
    pub principal: Principal,
    /// What happened
    pub kind: EventKind,
    /// Event time
    pub timestamp: Timestamp,
    /// Version active when the event was recorded
    pub schema_version: LedgerVersion,
}

impl LedgerEvent {
    /// Create new event
    pub fn new(
        principal: Principal,
        kind: EventKind,
        timestamp: Timestamp,
        schema_version: LedgerVersion,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            principal,
            kind,
            timestamp,
            schema_version,
        }
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Ledger initialized
    Initialized {
        /// Custodied asset
        asset: AssetId,
        /// Initial deposit fee
        deposit_fee_bps: Bps,
    },
    /// Deposit credited
    Deposited {
        /// Gross amount pulled
        amount: Amount,
        /// Retained fee
        fee: Amount,
        /// Credited amount
        net: Amount,
    },
    /// Immediate withdrawal
    Withdrawn {
        /// Amount pushed
        amount: Amount,
    },
    /// Deposit fee changed
    DepositFeeUpdated {
        /// New fee
        deposit_fee_bps: Bps,
    },
    /// Deposits paused
    DepositsPaused,
    /// Deposits resumed
    DepositsUnpaused,
    /// Role granted to `account`
    RoleGranted {
        /// Role
        role: Role,
        /// Grantee
        account: Principal,
    },
    /// Role revoked from `account`
    RoleRevoked {
        /// Role
        role: Role,
        /// Former holder
        account: Principal,
    },
    /// Yield rate changed
    YieldRateUpdated {
        /// New rate
        yield_rate_bps: Bps,
    },
    /// Yield credited to the balance
    YieldClaimed {
        /// Credited amount
        amount: Amount,
    },
    /// Withdrawal requested
    WithdrawalRequested {
        /// Requested amount
        amount: Amount,
        /// Amount of the request this one replaced
        superseded: Option<Amount>,
    },
    /// Delayed withdrawal executed
    WithdrawalExecuted {
        /// Amount pushed
        amount: Amount,
    },
    /// Full balance withdrawn bypassing the delay
    EmergencyWithdrawal {
        /// Amount pushed
        amount: Amount,
    },
    /// Withdrawal delay changed
    WithdrawalDelayUpdated {
        /// New delay
        withdrawal_delay_secs: u64,
    },
    /// Version switch
    Upgraded {
        /// Previous version
        from: LedgerVersion,
        /// New version
        to: LedgerVersion,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;

    #[test]
    fn test_asset_id_words() {
        let asset = AssetId::new("USDC").unwrap();
        let words = asset.to_words();
        assert_eq!(AssetId::from_words(&words).unwrap(), Some(asset));
        assert_eq!(AssetId::from_words(&[0; 4]).unwrap(), None);

        let full = AssetId::new("x".repeat(32)).unwrap();
        assert_eq!(AssetId::from_words(&full.to_words()).unwrap(), Some(full));
    }

    #[test]
    fn test_asset_id_rejects_bad_input() {
        assert!(AssetId::new("").is_err());
        assert!(AssetId::new("x".repeat(33)).is_err());
        assert!(AssetId::new("a\0b").is_err());
    }

    #[test]
    fn test_principal_validate() {
        assert!(Principal::new("alice").validate().is_ok());
        assert!(Principal::new("  ").validate().is_err());
    }

    #[test]
    fn test_v1_account_ignores_later_fields() {
        let registry = SchemaRegistry::builtin();
        let v1 = registry.get(LedgerVersion::V1).unwrap();
        let v3 = registry.get(LedgerVersion::V3).unwrap();

        let mut record = Record::zeroed(&v3.account);
        let account = Account {
            balance: 500,
            yield_baseline: 42,
            pending_withdrawal: Some(WithdrawalRequest {
                amount: 100,
                requested_at: 7,
            }),
        };
        account.encode_into(&v3.account, &mut record).unwrap();

        let seen_by_v1 = Account::decode(&v1.account, &record);
        assert_eq!(seen_by_v1.balance, 500);
        assert_eq!(seen_by_v1.yield_baseline, 0);
        assert_eq!(seen_by_v1.pending_withdrawal, None);

        // V1 code writing its view back leaves the V3 fields intact
        let mut updated = seen_by_v1;
        updated.balance = 400;
        updated.encode_into(&v1.account, &mut record).unwrap();
        let back = Account::decode(&v3.account, &record);
        assert_eq!(back.balance, 400);
        assert_eq!(back.yield_baseline, 42);
        assert_eq!(back.pending_withdrawal.unwrap().amount, 100);
    }

    #[test]
    fn test_v1_cannot_persist_v2_field() {
        let registry = SchemaRegistry::builtin();
        let v1 = registry.get(LedgerVersion::V1).unwrap();
        let mut record = Record::zeroed(&v1.account);
        let account = Account {
            balance: 1,
            yield_baseline: 99,
            pending_withdrawal: None,
        };
        let err = account.encode_into(&v1.account, &mut record).unwrap_err();
        assert!(err.to_string().contains("yield_baseline"));
    }

    #[test]
    fn test_withdrawal_ready_at() {
        let request = WithdrawalRequest {
            amount: 10,
            requested_at: u64::MAX - 1,
        };
        assert_eq!(request.ready_at(100), u64::MAX);
    }
}
