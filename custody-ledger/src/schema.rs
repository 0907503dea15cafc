//! Versioned record layouts
//!
//! Every stored record (the global record and one record per account) is a
//! fixed number of 64-bit slots. A [`RecordLayout`] names the slots a version
//! uses; the rest of the record is a reserved pool that later versions consume
//! by appending fields. [`validate_migration`] is the mechanical check that a
//! new layout only appends:
//!
//! ```text
//!  v1  | initialized | schema_version | asset x4 | ... | collected_fees | reserved (22)
//!  v2  | initialized | schema_version | asset x4 | ... | yield_rate_bps | reserved (21)
//! ```
//!
//! Because offsets never move, code for any version can read any record
//! written by a later one, and writes only touch the slots the writer knows.

use crate::version::LedgerVersion;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Bytes per slot
pub const SLOT_BYTES: usize = 8;

/// Slot budget of the global record
pub const GLOBAL_RECORD_SLOTS: u32 = 32;

/// Slot budget of an account record
pub const ACCOUNT_RECORD_SLOTS: u32 = 8;

/// Field names shared by layouts and typed records
pub mod fields {
    /// Global: one-time setup flag
    pub const INITIALIZED: &str = "initialized";
    /// Global: active version number
    pub const SCHEMA_VERSION: &str = "schema_version";
    /// Global: custodied asset id (4 slots)
    pub const ASSET: &str = "asset";
    /// Global: sum of balances
    pub const TOTAL_DEPOSITS: &str = "total_deposits";
    /// Global: deposit fee
    pub const DEPOSIT_FEE_BPS: &str = "deposit_fee_bps";
    /// Global: pause flag
    pub const DEPOSITS_PAUSED: &str = "deposits_paused";
    /// Global: retained fees
    pub const COLLECTED_FEES: &str = "collected_fees";
    /// Global: yield rate (v2)
    pub const YIELD_RATE_BPS: &str = "yield_rate_bps";
    /// Global: withdrawal delay (v3)
    pub const WITHDRAWAL_DELAY_SECS: &str = "withdrawal_delay_secs";

    /// Account: balance
    pub const BALANCE: &str = "balance";
    /// Account: yield baseline (v2)
    pub const YIELD_BASELINE: &str = "yield_baseline";
    /// Account: pending withdrawal amount (v3)
    pub const PENDING_AMOUNT: &str = "pending_amount";
    /// Account: pending withdrawal request time (v3)
    pub const PENDING_REQUESTED_AT: &str = "pending_requested_at";
}

/// One stored field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name
    pub name: String,
    /// First slot
    pub offset: u32,
    /// Number of slots
    pub width: u32,
}

impl FieldDescriptor {
    /// Create new descriptor
    pub fn new(name: impl Into<String>, offset: u32, width: u32) -> Self {
        Self {
            name: name.into(),
            offset,
            width,
        }
    }
}

/// Ordered field list plus reserved padding for one record kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    /// Fields in slot order
    pub fields: Vec<FieldDescriptor>,
    /// Reserved slots after the last field
    pub reserved: u32,
}

impl RecordLayout {
    /// Lay out `(name, width)` pairs contiguously and reserve the rest of `total_slots`
    pub fn packed(spec: &[(&str, u32)], total_slots: u32) -> Self {
        let mut offset = 0;
        let fields = spec
            .iter()
            .map(|(name, width)| {
                let field = FieldDescriptor::new(*name, offset, *width);
                offset += width;
                field
            })
            .collect();

        Self {
            fields,
            reserved: total_slots.saturating_sub(offset),
        }
    }

    /// Slots used by fields
    pub fn used_slots(&self) -> u32 {
        self.fields.last().map(|f| f.offset + f.width).unwrap_or(0)
    }

    /// Fields plus reserved padding
    pub fn total_slots(&self) -> u32 {
        self.used_slots() + self.reserved
    }

    /// Encoded record size in bytes
    pub fn record_len(&self) -> usize {
        self.total_slots() as usize * SLOT_BYTES
    }

    /// Look up a field
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Layout with `extra` appended, consuming reserved padding
    pub fn extend(&self, extra: &[(&str, u32)]) -> Self {
        let mut next = self.clone();
        for (name, width) in extra {
            let offset = next.used_slots();
            next.fields.push(FieldDescriptor::new(*name, offset, *width));
            next.reserved = next.reserved.saturating_sub(*width);
        }
        next
    }

    /// Offsets contiguous from zero, non-zero widths, unique names
    pub fn check_well_formed(&self, record: &str) -> Result<()> {
        let mut expected = 0;
        let mut seen = HashSet::new();

        for field in &self.fields {
            if field.width == 0 {
                return Err(Error::SchemaConflict(format!(
                    "{} field `{}` has zero width",
                    record, field.name
                )));
            }
            if field.offset != expected {
                return Err(Error::SchemaConflict(format!(
                    "{} field `{}` at offset {} leaves a gap or overlap (expected {})",
                    record, field.name, field.offset, expected
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::SchemaConflict(format!(
                    "{} field `{}` declared twice",
                    record, field.name
                )));
            }
            expected += field.width;
        }

        Ok(())
    }
}

/// Storage layout of one ledger generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Ledger version this layout belongs to
    pub version: LedgerVersion,
    /// Global record layout
    pub global: RecordLayout,
    /// Account record layout
    pub account: RecordLayout,
}

impl SchemaVersion {
    /// SHA-256 over the canonical layout, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.number().to_be_bytes());
        for (tag, layout) in [(b'g', &self.global), (b'a', &self.account)] {
            hasher.update([tag]);
            for field in &layout.fields {
                hasher.update((field.name.len() as u32).to_be_bytes());
                hasher.update(field.name.as_bytes());
                hasher.update(field.offset.to_be_bytes());
                hasher.update(field.width.to_be_bytes());
            }
            hasher.update(layout.reserved.to_be_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Check that `new` only appends to `old`
///
/// Every field of `old` must appear in `new` at the same position, offset and
/// width, and both layouts must keep the same total slot budget. Pure: no
/// side effects and no business decisions.
pub fn validate_migration(old: &SchemaVersion, new: &SchemaVersion) -> Result<()> {
    validate_layout("global", &old.global, &new.global)?;
    validate_layout("account", &old.account, &new.account)
}

fn validate_layout(record: &str, old: &RecordLayout, new: &RecordLayout) -> Result<()> {
    old.check_well_formed(record)?;
    new.check_well_formed(record)?;

    for (index, field) in old.fields.iter().enumerate() {
        let Some(candidate) = new.fields.get(index) else {
            return Err(Error::SchemaConflict(format!(
                "{} field `{}` missing from new layout",
                record, field.name
            )));
        };

        if candidate.name != field.name {
            let detail = match new.field(&field.name) {
                Some(moved) => format!("moved from offset {} to {}", field.offset, moved.offset),
                None => "removed".to_string(),
            };
            return Err(Error::SchemaConflict(format!(
                "{} field `{}` {}",
                record, field.name, detail
            )));
        }

        if candidate.offset != field.offset || candidate.width != field.width {
            return Err(Error::SchemaConflict(format!(
                "{} field `{}` changed from {}+{} to {}+{}",
                record, field.name, field.offset, field.width, candidate.offset, candidate.width
            )));
        }
    }

    if old.total_slots() != new.total_slots() {
        return Err(Error::SchemaConflict(format!(
            "{} record size changed from {} to {} slots",
            record,
            old.total_slots(),
            new.total_slots()
        )));
    }

    Ok(())
}

/// Published layouts by version
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    versions: BTreeMap<LedgerVersion, SchemaVersion>,
}

impl SchemaRegistry {
    /// Layouts shipped with this crate
    pub fn builtin() -> Self {
        let global_v1 = RecordLayout::packed(
            &[
                (fields::INITIALIZED, 1),
                (fields::SCHEMA_VERSION, 1),
                (fields::ASSET, 4),
                (fields::TOTAL_DEPOSITS, 1),
                (fields::DEPOSIT_FEE_BPS, 1),
                (fields::DEPOSITS_PAUSED, 1),
                (fields::COLLECTED_FEES, 1),
            ],
            GLOBAL_RECORD_SLOTS,
        );
        let account_v1 = RecordLayout::packed(&[(fields::BALANCE, 1)], ACCOUNT_RECORD_SLOTS);

        let global_v2 = global_v1.extend(&[(fields::YIELD_RATE_BPS, 1)]);
        let account_v2 = account_v1.extend(&[(fields::YIELD_BASELINE, 1)]);

        let global_v3 = global_v2.extend(&[(fields::WITHDRAWAL_DELAY_SECS, 1)]);
        let account_v3 =
            account_v2.extend(&[(fields::PENDING_AMOUNT, 1), (fields::PENDING_REQUESTED_AT, 1)]);

        Self::from_versions([
            SchemaVersion {
                version: LedgerVersion::V1,
                global: global_v1,
                account: account_v1,
            },
            SchemaVersion {
                version: LedgerVersion::V2,
                global: global_v2,
                account: account_v2,
            },
            SchemaVersion {
                version: LedgerVersion::V3,
                global: global_v3,
                account: account_v3,
            },
        ])
    }

    /// Registry from arbitrary layouts, without validation
    ///
    /// Compatibility is checked when a version is activated, so a broken
    /// release is rejected at upgrade time rather than here.
    pub fn from_versions(versions: impl IntoIterator<Item = SchemaVersion>) -> Self {
        Self {
            versions: versions.into_iter().map(|s| (s.version, s)).collect(),
        }
    }

    /// Layout of `version`
    pub fn get(&self, version: LedgerVersion) -> Result<&SchemaVersion> {
        self.versions
            .get(&version)
            .ok_or_else(|| Error::SchemaConflict(format!("no schema published for {}", version)))
    }

    /// Layout activated by `initialize`
    pub fn genesis(&self) -> Result<&SchemaVersion> {
        self.get(LedgerVersion::GENESIS)
    }

    /// Validate every successive pair of published layouts
    pub fn validate_chain(&self) -> Result<()> {
        let schemas: Vec<&SchemaVersion> = self.versions.values().collect();
        for pair in schemas.windows(2) {
            validate_migration(pair[0], pair[1])?;
        }
        Ok(())
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Raw fixed-size record: `total_slots` little-endian 64-bit slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    slots: Vec<u64>,
}

impl Record {
    /// All-zero record sized for `layout`
    pub fn zeroed(layout: &RecordLayout) -> Self {
        Self {
            slots: vec![0; layout.total_slots() as usize],
        }
    }

    /// Decode stored bytes; the length must match the layout's budget
    pub fn from_bytes(layout: &RecordLayout, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != layout.record_len() {
            return Err(Error::SchemaConflict(format!(
                "stored record is {} bytes, layout expects {}",
                bytes.len(),
                layout.record_len()
            )));
        }

        let slots = bytes
            .chunks_exact(SLOT_BYTES)
            .map(|chunk| {
                let mut buf = [0u8; SLOT_BYTES];
                buf.copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();

        Ok(Self { slots })
    }

    /// Encode to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.slots.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// First slot of `name`, or zero when the layout does not define it
    pub fn get(&self, layout: &RecordLayout, name: &str) -> u64 {
        layout
            .field(name)
            .and_then(|f| self.slots.get(f.offset as usize).copied())
            .unwrap_or(0)
    }

    /// All slots of `name`, empty when the layout does not define it
    pub fn get_words(&self, layout: &RecordLayout, name: &str) -> Vec<u64> {
        layout
            .field(name)
            .and_then(|f| {
                let start = f.offset as usize;
                self.slots.get(start..start + f.width as usize)
            })
            .map(<[u64]>::to_vec)
            .unwrap_or_default()
    }

    /// Write a single-slot field defined by `layout`
    pub fn set(&mut self, layout: &RecordLayout, name: &str, value: u64) -> Result<()> {
        self.set_words(layout, name, &[value])
    }

    /// Write `name` when the layout has it; a non-zero value for an unknown field is an error
    pub fn set_if_present(&mut self, layout: &RecordLayout, name: &str, value: u64) -> Result<()> {
        match layout.field(name) {
            Some(_) => self.set(layout, name, value),
            None if value == 0 => Ok(()),
            None => Err(Error::SchemaConflict(format!(
                "field `{}` is not part of this layout",
                name
            ))),
        }
    }

    /// Write a multi-slot field defined by `layout`
    pub fn set_words(&mut self, layout: &RecordLayout, name: &str, words: &[u64]) -> Result<()> {
        let field = layout.field(name).ok_or_else(|| {
            Error::SchemaConflict(format!("field `{}` is not part of this layout", name))
        })?;

        if words.len() != field.width as usize {
            return Err(Error::SchemaConflict(format!(
                "field `{}` is {} slots wide, got {}",
                name,
                field.width,
                words.len()
            )));
        }

        let start = field.offset as usize;
        let target = self
            .slots
            .get_mut(start..start + words.len())
            .ok_or_else(|| Error::SchemaConflict(format!("field `{}` exceeds record", name)))?;
        target.copy_from_slice(words);
        Ok(())
    }
}
