//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `global` - The global slot record (single key)
//! - `accounts` - Account slot records (key: principal)
//! - `roles` - Role membership (key: role || principal)
//! - `schemas` - Activated schema layouts (key: version number)
//! - `events` - Append-only audit log (key: event_id)
//! - `indices` - Principal → event index (key: len || principal || event_id)
//!
//! Every ledger operation lands as one [`WriteSet`], committed as a single
//! RocksDB `WriteBatch`.

use crate::{
    error::{Error, Result},
    schema::SchemaVersion,
    types::{LedgerEvent, Principal, Role},
    version::LedgerVersion,
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::fmt;
use uuid::Uuid;

/// Column family names
const CF_GLOBAL: &str = "global";
const CF_ACCOUNTS: &str = "accounts";
const CF_ROLES: &str = "roles";
const CF_SCHEMAS: &str = "schemas";
const CF_EVENTS: &str = "events";
const CF_INDICES: &str = "indices";

const GLOBAL_KEY: &[u8] = b"state";

/// Batched mutations of one operation
///
/// Account entries carry `None` to delete a record, which is how a rollback
/// removes an account that did not exist before the operation.
#[derive(Debug, Default, Clone)]
pub struct WriteSet {
    global: Option<Vec<u8>>,
    accounts: Vec<(Principal, Option<Vec<u8>>)>,
    roles: Vec<(Role, Principal, bool)>,
    schemas: Vec<SchemaVersion>,
    appended_events: Vec<LedgerEvent>,
    removed_events: Vec<LedgerEvent>,
}

impl WriteSet {
    /// Replace the global record
    pub fn put_global(&mut self, bytes: Vec<u8>) {
        self.global = Some(bytes);
    }

    /// Replace (`Some`) or delete (`None`) an account record
    pub fn put_account(&mut self, principal: Principal, bytes: Option<Vec<u8>>) {
        self.accounts.push((principal, bytes));
    }

    /// Add `principal` to `role`
    pub fn grant_role(&mut self, role: Role, principal: Principal) {
        self.roles.push((role, principal, true));
    }

    /// Remove `principal` from `role`
    pub fn revoke_role(&mut self, role: Role, principal: Principal) {
        self.roles.push((role, principal, false));
    }

    /// Persist an activated schema
    pub fn publish_schema(&mut self, schema: SchemaVersion) {
        self.schemas.push(schema);
    }

    /// Append an audit event
    pub fn append_event(&mut self, event: LedgerEvent) {
        self.appended_events.push(event);
    }

    /// Drop a previously appended event (compensating writes only)
    pub fn remove_event(&mut self, event: LedgerEvent) {
        self.removed_events.push(event);
    }

    /// Nothing to write
    pub fn is_empty(&self) -> bool {
        self.global.is_none()
            && self.accounts.is_empty()
            && self.roles.is_empty()
            && self.schemas.is_empty()
            && self.appended_events.is_empty()
            && self.removed_events.is_empty()
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,

    #[cfg(test)]
    fail_commits: std::sync::atomic::AtomicBool,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_GLOBAL, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_ROLES, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_SCHEMAS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_lookup()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB record store");

        Ok(Self {
            db,
            #[cfg(test)]
            fail_commits: std::sync::atomic::AtomicBool::new(false),
        })
    }

    // Column family options

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        // Records are small and read on every operation, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_lookup() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Records

    /// Raw global record
    pub fn get_global_raw(&self) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(CF_GLOBAL)?;
        Ok(self.db.get_cf(cf, GLOBAL_KEY)?)
    }

    /// Raw account record
    pub fn get_account_raw(&self, principal: &Principal) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        Ok(self.db.get_cf(cf, principal.as_str().as_bytes())?)
    }

    /// All raw account records, in key order
    pub fn account_records(&self) -> Result<Vec<(Principal, Vec<u8>)>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut records = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let principal = String::from_utf8(key.to_vec())
                .map_err(|e| Error::Storage(format!("corrupt account key: {}", e)))?;
            records.push((Principal::new(principal), value.to_vec()));
        }

        Ok(records)
    }

    // Roles

    /// Role membership check
    pub fn has_role(&self, role: Role, principal: &Principal) -> Result<bool> {
        let cf = self.cf_handle(CF_ROLES)?;
        Ok(self.db.get_cf(cf, Self::role_key(role, principal))?.is_some())
    }

    /// Current holders of `role`
    pub fn role_members(&self, role: Role) -> Result<Vec<Principal>> {
        let cf = self.cf_handle(CF_ROLES)?;
        let prefix = [role as u8];
        let mut members = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let principal = String::from_utf8(key[1..].to_vec())
                .map_err(|e| Error::Storage(format!("corrupt role key: {}", e)))?;
            members.push(Principal::new(principal));
        }

        Ok(members)
    }

    // Schemas

    /// Stored layout of an activated version
    pub fn get_schema(&self, version: LedgerVersion) -> Result<Option<SchemaVersion>> {
        let cf = self.cf_handle(CF_SCHEMAS)?;
        match self.db.get_cf(cf, version.number().to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // Events

    /// Get event by ID
    pub fn get_event(&self, event_id: Uuid) -> Result<Option<LedgerEvent>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        match self.db.get_cf(cf, event_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Events concerning `principal`, oldest first
    pub fn events_for(&self, principal: &Principal) -> Result<Vec<LedgerEvent>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = Self::index_prefix(principal);
        let mut events = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }

            let id_bytes: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| Error::Storage("corrupt event index key".to_string()))?;
            let event_id = Uuid::from_bytes(id_bytes);

            let event = self
                .get_event(event_id)?
                .ok_or_else(|| Error::Storage(format!("indexed event {} missing", event_id)))?;
            events.push(event);
        }

        Ok(events)
    }

    // Batch operations (atomic)

    /// Apply a write set in one atomic batch
    pub fn commit(&self, writes: &WriteSet) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }

        #[cfg(test)]
        {
            if self.fail_commits.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Storage("injected write failure".to_string()));
            }
        }

        let mut batch = WriteBatch::default();

        if let Some(global) = &writes.global {
            batch.put_cf(self.cf_handle(CF_GLOBAL)?, GLOBAL_KEY, global);
        }

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        for (principal, record) in &writes.accounts {
            let key = principal.as_str().as_bytes();
            match record {
                Some(bytes) => batch.put_cf(cf_accounts, key, bytes),
                None => batch.delete_cf(cf_accounts, key),
            }
        }

        let cf_roles = self.cf_handle(CF_ROLES)?;
        for (role, principal, granted) in &writes.roles {
            let key = Self::role_key(*role, principal);
            if *granted {
                batch.put_cf(cf_roles, &key, b"");
            } else {
                batch.delete_cf(cf_roles, &key);
            }
        }

        let cf_schemas = self.cf_handle(CF_SCHEMAS)?;
        for schema in &writes.schemas {
            let value = bincode::serialize(schema)?;
            batch.put_cf(cf_schemas, schema.version.number().to_be_bytes(), &value);
        }

        let cf_events = self.cf_handle(CF_EVENTS)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;
        for event in &writes.appended_events {
            let value = bincode::serialize(event)?;
            batch.put_cf(cf_events, event.event_id.as_bytes(), &value);
            batch.put_cf(cf_indices, Self::index_key(&event.principal, event.event_id), b"");
        }
        for event in &writes.removed_events {
            batch.delete_cf(cf_events, event.event_id.as_bytes());
            batch.delete_cf(cf_indices, Self::index_key(&event.principal, event.event_id));
        }

        self.db.write(batch)?;

        tracing::debug!(
            accounts = writes.accounts.len(),
            events = writes.appended_events.len(),
            "Write set committed"
        );

        Ok(())
    }

    /// Make every non-empty commit fail
    #[cfg(test)]
    pub(crate) fn set_fail_commits(&self, fail: bool) {
        self.fail_commits
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    // Key helpers

    fn role_key(role: Role, principal: &Principal) -> Vec<u8> {
        let mut key = vec![role as u8];
        key.extend_from_slice(principal.as_str().as_bytes());
        key
    }

    fn index_prefix(principal: &Principal) -> Vec<u8> {
        let bytes = principal.as_str().as_bytes();
        let mut key = (bytes.len() as u32).to_be_bytes().to_vec();
        key.extend_from_slice(bytes);
        key
    }

    fn index_key(principal: &Principal, event_id: Uuid) -> Vec<u8> {
        let mut key = Self::index_prefix(principal);
        key.extend_from_slice(event_id.as_bytes());
        key
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let total_accounts = self.approximate_count(self.cf_handle(CF_ACCOUNTS)?)?;
        let total_events = self.approximate_count(self.cf_handle(CF_EVENTS)?)?;

        Ok(StorageStats {
            total_accounts,
            total_events,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate number of account records
    pub total_accounts: u64,
    /// Approximate number of events
    pub total_events: u64,
}
