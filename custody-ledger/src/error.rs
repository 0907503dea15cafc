//! Error types for the custody ledger

use crate::types::{Amount, Principal, Role, Timestamp};
use crate::version::{LedgerVersion, Operation};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input or out-of-range configuration
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller lacks the role an operation requires
    #[error("Authorization error: {principal} lacks role {role}")]
    Authorization {
        /// Caller
        principal: Principal,
        /// Missing role
        role: Role,
    },

    /// Requested amount exceeds the recorded balance
    #[error("Insufficient balance for {principal}: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Account owner
        principal: Principal,
        /// Requested amount
        requested: Amount,
        /// Current balance
        available: Amount,
    },

    /// Deposits are paused
    #[error("Deposits are paused")]
    Paused,

    /// Withdrawal delay has not elapsed yet
    #[error("Withdrawal delay not elapsed: ready at {ready_at}, now {now}")]
    DelayNotElapsed {
        /// Earliest execution time
        ready_at: Timestamp,
        /// Current time
        now: Timestamp,
    },

    /// No pending withdrawal request for the principal
    #[error("No pending withdrawal for {0}")]
    NoPendingWithdrawal(Principal),

    /// One-time setup attempted twice
    #[error("Reinitialization error: {0}")]
    Reinitialization(String),

    /// Destructive or inconsistent schema change
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    /// Asset Transfer Provider failure
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Operation not part of the active version's operation set
    #[error("Operation {operation} is not supported by ledger {version}")]
    UnsupportedOperation {
        /// Requested operation
        operation: Operation,
        /// Active version
        version: LedgerVersion,
    },

    /// Ledger has not been initialized
    #[error("Ledger is not initialized")]
    NotInitialized,

    /// Arithmetic result does not fit the stored width
    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    /// Invariant violation (conservation, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification, used for matching and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Validation`]
    Validation,
    /// See [`Error::Authorization`]
    Authorization,
    /// See [`Error::InsufficientBalance`]
    InsufficientBalance,
    /// See [`Error::Paused`]
    Paused,
    /// See [`Error::DelayNotElapsed`]
    DelayNotElapsed,
    /// See [`Error::NoPendingWithdrawal`]
    NoPendingWithdrawal,
    /// See [`Error::Reinitialization`]
    Reinitialization,
    /// See [`Error::SchemaConflict`]
    SchemaConflict,
    /// See [`Error::TransferFailed`]
    TransferFailed,
    /// See [`Error::UnsupportedOperation`]
    UnsupportedOperation,
    /// See [`Error::NotInitialized`]
    NotInitialized,
    /// See [`Error::Overflow`]
    Overflow,
    /// Storage, serialization, concurrency, configuration and IO failures
    Internal,
}

impl ErrorKind {
    /// Stable label for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::Paused => "paused",
            ErrorKind::DelayNotElapsed => "delay_not_elapsed",
            ErrorKind::NoPendingWithdrawal => "no_pending_withdrawal",
            ErrorKind::Reinitialization => "reinitialization",
            ErrorKind::SchemaConflict => "schema_conflict",
            ErrorKind::TransferFailed => "transfer_failed",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::Overflow => "overflow",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Authorization { .. } => ErrorKind::Authorization,
            Error::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Error::Paused => ErrorKind::Paused,
            Error::DelayNotElapsed { .. } => ErrorKind::DelayNotElapsed,
            Error::NoPendingWithdrawal(_) => ErrorKind::NoPendingWithdrawal,
            Error::Reinitialization(_) => ErrorKind::Reinitialization,
            Error::SchemaConflict(_) => ErrorKind::SchemaConflict,
            Error::TransferFailed(_) => ErrorKind::TransferFailed,
            Error::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            Error::NotInitialized => ErrorKind::NotInitialized,
            Error::Overflow(_) => ErrorKind::Overflow,
            Error::InvariantViolation(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Concurrency(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
