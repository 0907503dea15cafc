//! Custody Ledger
//!
//! Single-asset custody ledger with deposit fees, time-based yield and
//! delayed two-phase withdrawals, whose record layout evolves across versions
//! without moving or discarding stored data.
//!
//! # Architecture
//!
//! - **Versioned Records**: Fixed-size slot records; versions only append fields
//! - **Single Writer**: One actor task runs every operation to completion
//! - **Atomic Batches**: Each operation commits one RocksDB write batch
//! - **Compensation**: A failed outbound transfer restores the prior records
//!
//! # Invariants
//!
//! - Conservation: Σ(balances) == total_deposits after every operation
//! - Append-only layouts: a field keeps its offset and width forever
//! - Bit-identical migration: upgrades never rewrite existing fields
//! - All-or-nothing: a failed operation leaves no state change and no event

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accounting;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod schema;
pub mod storage;
pub mod transfer;
pub mod types;
pub mod version;
pub mod yield_accrual;

mod actor;
mod engine;
mod upgrade;
mod withdrawal;

// Re-exports
pub use accounting::{compute_fee, DepositReceipt};
pub use auth::AuthorizationGate;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use ledger::Ledger;
pub use schema::{validate_migration, RecordLayout, SchemaRegistry, SchemaVersion};
pub use storage::Storage;
pub use transfer::{AssetTransferProvider, InMemoryTransferProvider};
pub use types::{
    Account, Amount, AssetId, Bps, EventKind, GlobalState, LedgerEvent, Principal, Role,
    Timestamp, WithdrawalRequest,
};
pub use version::{LedgerVersion, Operation};
pub use yield_accrual::accrued_yield;
