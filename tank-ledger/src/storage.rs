//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `entries` - Ledger entries (key: tank_id || event_ts || sequence)
//! - `events` - Recorded transfer/intake events (key: tenant_id || event_ts || sequence)
//! - `indices` - Secondary indices (event -> entries, event -> log key, tenant -> entries)
//! - `meta` - Sequence counter
//!
//! Big-endian timestamps and sequences make a forward scan over one tank's
//! prefix yield entries in `(event_timestamp, sequence)` order.
//!
//! All writes go through a [`UnitOfWork`]: a `WriteBatch` plus an in-memory
//! overlay, so reads inside the unit see its own staged writes. Committing
//! is one atomic RocksDB write; dropping the unit discards everything.

use crate::{
    error::{Error, Result},
    types::{EntryId, EventId, LedgerEntry, LoggedEvent, SourceEventRecord, TankId, TenantId},
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Column family names
const CF_ENTRIES: &str = "entries";
const CF_EVENTS: &str = "events";
const CF_INDICES: &str = "indices";
const CF_META: &str = "meta";

/// Index key prefixes
const IDX_EVENT_ENTRY: u8 = b'E';
const IDX_EVENT_LOG: u8 = b'L';
const IDX_TENANT_ENTRY: u8 = b'T';

const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    next_sequence: AtomicU64,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("next_sequence", &self.next_sequence.load(Ordering::SeqCst))
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let next_sequence = {
            let cf = db
                .cf_handle(CF_META)
                .ok_or_else(|| Error::Storage(format!("Column family {} not found", CF_META)))?;
            match db.get_cf(cf, META_NEXT_SEQUENCE)? {
                Some(bytes) => decode_u64(&bytes)?,
                None => 1,
            }
        };

        tracing::info!(path = ?path, next_sequence, "Opened tank ledger store");

        Ok(Self {
            db: Arc::new(db),
            next_sequence: AtomicU64::new(next_sequence),
        })
    }

    // Column family options

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        // Entries are scanned per tank on every composition query
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Collect `(key, value)` pairs under a prefix
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut items = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push((key, value));
        }
        Ok(items)
    }

    // Entry reads (committed state only)

    /// Entries for a tank with `event_timestamp <= as_of`, ordered by (timestamp, sequence)
    pub fn entries_for_tank(
        &self,
        tank: TankId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let prefix = tank.as_bytes();
        let bound = as_of.map(timestamp_key_clamped);

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(bound) = bound {
                if key.len() >= 24 && key[16..24] > bound[..] {
                    break;
                }
            }
            entries.push(bincode::deserialize::<LedgerEntry>(&value)?);
        }

        Ok(entries)
    }

    /// Get one entry by its storage key
    fn get_entry_by_key(&self, key: &[u8]) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Committed entries derived from an event
    pub fn entries_for_event(&self, event: EventId) -> Result<Vec<LedgerEntry>> {
        let mut prefix = vec![IDX_EVENT_ENTRY];
        prefix.extend_from_slice(event.as_bytes());
        self.resolve_entry_index(&prefix)
    }

    /// All committed entries of a tenant
    pub fn entries_for_tenant(&self, tenant: TenantId) -> Result<Vec<LedgerEntry>> {
        let mut prefix = vec![IDX_TENANT_ENTRY];
        prefix.extend_from_slice(tenant.as_bytes());
        self.resolve_entry_index(&prefix)
    }

    fn resolve_entry_index(&self, prefix: &[u8]) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for (key, _) in self.scan_prefix(CF_INDICES, prefix)? {
            let entry_key = &key[prefix.len()..];
            match self.get_entry_by_key(entry_key)? {
                Some(entry) => entries.push(entry),
                None => {
                    tracing::warn!(index_key = ?key, "Dangling ledger index entry");
                }
            }
        }
        Ok(entries)
    }

    // Event log reads

    /// Look up a recorded event
    pub fn find_event(&self, event: EventId) -> Result<Option<LoggedEvent>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let log_key = match self.db.get_cf(cf_indices, event_log_index_key(event))? {
            Some(key) => key,
            None => return Ok(None),
        };

        let cf_events = self.cf_handle(CF_EVENTS)?;
        match self.db.get_cf(cf_events, &log_key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get a recorded event or fail
    pub fn get_event(&self, event: EventId) -> Result<LoggedEvent> {
        self.find_event(event)?
            .ok_or_else(|| Error::EventNotFound(event.to_string()))
    }

    /// Recorded events of a tenant, ordered by (event_timestamp, sequence)
    pub fn events_for_tenant(&self, tenant: TenantId) -> Result<Vec<LoggedEvent>> {
        self.scan_prefix(CF_EVENTS, tenant.as_bytes())?
            .into_iter()
            .map(|(_, value)| bincode::deserialize(&value).map_err(Error::from))
            .collect()
    }

    /// Tenants with at least one recorded event
    pub fn tenants_with_events(&self) -> Result<Vec<TenantId>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let mut tenants = BTreeSet::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() >= 16 {
                let bytes: [u8; 16] = key[..16]
                    .try_into()
                    .map_err(|_| Error::Storage("Malformed event key".to_string()))?;
                tenants.insert(TenantId::from_uuid(uuid::Uuid::from_bytes(bytes)));
            }
        }
        Ok(tenants.into_iter().collect())
    }

    /// Next sequence number to be handed out
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Start a unit of work
    pub fn begin(&self) -> UnitOfWork<'_> {
        UnitOfWork {
            storage: self,
            batch: WriteBatch::default(),
            staged: Vec::new(),
            removed: HashSet::new(),
            staged_events: HashMap::new(),
            removed_events: HashSet::new(),
            next_sequence: self.next_sequence(),
            appended: 0,
        }
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("Tank ledger store closed");
        Ok(())
    }
}

/// Staged writes over committed state
pub struct UnitOfWork<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
    staged: Vec<LedgerEntry>,
    removed: HashSet<EntryId>,
    staged_events: HashMap<EventId, LoggedEvent>,
    removed_events: HashSet<EventId>,
    next_sequence: u64,
    appended: usize,
}

impl std::fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("staged", &self.staged.len())
            .field("removed", &self.removed.len())
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

impl UnitOfWork<'_> {
    /// Entries for a tank as this unit sees them, ordered by (timestamp, sequence)
    pub fn entries_for_tank(
        &self,
        tank: TankId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .storage
            .entries_for_tank(tank, as_of)?
            .into_iter()
            .filter(|e| !self.removed.contains(&e.id))
            .collect();

        entries.extend(
            self.staged
                .iter()
                .filter(|e| e.tank == tank && as_of.map_or(true, |t| e.event_timestamp <= t))
                .cloned(),
        );
        entries.sort_by_key(LedgerEntry::order_key);
        Ok(entries)
    }

    /// Stage an entry, assigning its sequence
    pub fn append_entry(&mut self, mut entry: LedgerEntry) -> Result<EntryId> {
        entry.sequence = self.take_sequence();
        let key = entry_key(&entry)?;
        let value = bincode::serialize(&entry)?;

        let cf_entries = self.storage.cf_handle(CF_ENTRIES)?;
        self.batch.put_cf(cf_entries, &key, &value);

        let cf_indices = self.storage.cf_handle(CF_INDICES)?;
        if let Some(source) = entry.source_event {
            self.batch
                .put_cf(cf_indices, event_entry_index_key(source.id(), &key), b"");
        }
        self.batch
            .put_cf(cf_indices, tenant_entry_index_key(entry.tenant, &key), b"");

        tracing::debug!(
            entry_id = %entry.id,
            tank = %entry.tank,
            delta = %entry.delta_volume,
            key = %entry.composition_key,
            "Ledger entry staged"
        );

        let id = entry.id;
        self.staged.push(entry);
        self.appended += 1;
        Ok(id)
    }

    /// Stage an event in the log, assigning its creation order
    pub fn record_event(&mut self, event: SourceEventRecord) -> Result<LoggedEvent> {
        let id = event.id();
        if self.event_exists(id)? {
            return Err(Error::Validation(format!("Event {} already recorded", id)));
        }

        let logged = LoggedEvent {
            sequence: self.take_sequence(),
            event,
        };
        let key = event_log_key(&logged)?;

        let cf_events = self.storage.cf_handle(CF_EVENTS)?;
        self.batch
            .put_cf(cf_events, &key, bincode::serialize(&logged)?);
        let cf_indices = self.storage.cf_handle(CF_INDICES)?;
        self.batch.put_cf(cf_indices, event_log_index_key(id), &key);

        self.removed_events.remove(&id);
        self.staged_events.insert(id, logged.clone());
        Ok(logged)
    }

    /// Look up an event as this unit sees it
    pub fn find_event(&self, event: EventId) -> Result<Option<LoggedEvent>> {
        if let Some(logged) = self.staged_events.get(&event) {
            return Ok(Some(logged.clone()));
        }
        if self.removed_events.contains(&event) {
            return Ok(None);
        }
        self.storage.find_event(event)
    }

    /// Whether an event is recorded
    pub fn event_exists(&self, event: EventId) -> Result<bool> {
        Ok(self.find_event(event)?.is_some())
    }

    /// Whether any live entry references the event
    pub fn has_entries_for_event(&self, event: EventId) -> Result<bool> {
        if self
            .staged
            .iter()
            .any(|e| e.source_event.map(|s| s.id()) == Some(event))
        {
            return Ok(true);
        }
        Ok(self
            .storage
            .entries_for_event(event)?
            .iter()
            .any(|e| !self.removed.contains(&e.id)))
    }

    /// Stage deletion of every entry derived from an event
    pub fn delete_entries_for_event(&mut self, event: EventId) -> Result<usize> {
        let committed: Vec<LedgerEntry> = self
            .storage
            .entries_for_event(event)?
            .into_iter()
            .filter(|e| !self.removed.contains(&e.id))
            .collect();
        let staged = self.take_staged(|e| e.source_event.map(|s| s.id()) == Some(event));

        self.delete_entries(committed.iter().chain(staged.iter()))
    }

    /// Stage deletion of every entry of a tenant
    pub fn clear_tenant(&mut self, tenant: TenantId) -> Result<usize> {
        let committed: Vec<LedgerEntry> = self
            .storage
            .entries_for_tenant(tenant)?
            .into_iter()
            .filter(|e| !self.removed.contains(&e.id))
            .collect();
        let staged = self.take_staged(|e| e.tenant == tenant);

        self.delete_entries(committed.iter().chain(staged.iter()))
    }

    /// Stage deletion of an event and, by cascade, its entries
    pub fn delete_event(&mut self, event: EventId) -> Result<usize> {
        let logged = self
            .find_event(event)?
            .ok_or_else(|| Error::EventNotFound(event.to_string()))?;
        let deleted = self.delete_entries_for_event(event)?;

        let key = event_log_key(&logged)?;
        let cf_events = self.storage.cf_handle(CF_EVENTS)?;
        self.batch.delete_cf(cf_events, &key);
        let cf_indices = self.storage.cf_handle(CF_INDICES)?;
        self.batch.delete_cf(cf_indices, event_log_index_key(event));

        self.staged_events.remove(&event);
        self.removed_events.insert(event);
        Ok(deleted)
    }

    /// Entries staged so far (not yet committed)
    pub fn staged_entries(&self) -> &[LedgerEntry] {
        &self.staged
    }

    /// Number of entries appended in this unit
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Atomically persist everything staged
    pub fn commit(mut self) -> Result<usize> {
        let cf_meta = self.storage.cf_handle(CF_META)?;
        self.batch
            .put_cf(cf_meta, META_NEXT_SEQUENCE, self.next_sequence.to_be_bytes());

        self.storage.db.write(self.batch)?;
        self.storage
            .next_sequence
            .store(self.next_sequence, Ordering::SeqCst);

        tracing::debug!(entries = self.appended, "Unit of work committed");
        Ok(self.appended)
    }

    /// Discard everything staged
    pub fn rollback(self) {
        tracing::debug!(entries = self.appended, "Unit of work rolled back");
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn take_staged(&mut self, pred: impl Fn(&LedgerEntry) -> bool) -> Vec<LedgerEntry> {
        let (taken, kept): (Vec<_>, Vec<_>) = self.staged.drain(..).partition(|e| pred(e));
        self.staged = kept;
        taken
    }

    fn delete_entries<'e>(&mut self, entries: impl Iterator<Item = &'e LedgerEntry>) -> Result<usize> {
        let cf_entries = self.storage.cf_handle(CF_ENTRIES)?;
        let cf_indices = self.storage.cf_handle(CF_INDICES)?;

        let mut count = 0;
        for entry in entries {
            let key = entry_key(entry)?;
            self.batch.delete_cf(cf_entries, &key);
            if let Some(source) = entry.source_event {
                self.batch
                    .delete_cf(cf_indices, event_entry_index_key(source.id(), &key));
            }
            self.batch
                .delete_cf(cf_indices, tenant_entry_index_key(entry.tenant, &key));
            self.removed.insert(entry.id);
            count += 1;
        }
        Ok(count)
    }
}

// Key helpers

/// Order-preserving encoding of a timestamp
fn timestamp_key(ts: DateTime<Utc>) -> Result<[u8; 8]> {
    let nanos = ts.timestamp_nanos_opt().ok_or_else(|| {
        Error::Validation(format!("Timestamp {} outside representable range", ts))
    })?;
    Ok(((nanos as u64) ^ (1 << 63)).to_be_bytes())
}

/// Like [`timestamp_key`], saturating out-of-range bounds
fn timestamp_key_clamped(ts: DateTime<Utc>) -> [u8; 8] {
    let nanos = ts
        .timestamp_nanos_opt()
        .unwrap_or(if ts.timestamp() < 0 { i64::MIN } else { i64::MAX });
    ((nanos as u64) ^ (1 << 63)).to_be_bytes()
}

fn entry_key(entry: &LedgerEntry) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(entry.tank.as_bytes());
    key.extend_from_slice(&timestamp_key(entry.event_timestamp)?);
    key.extend_from_slice(&entry.sequence.to_be_bytes());
    Ok(key)
}

fn event_log_key(logged: &LoggedEvent) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(logged.event.tenant().as_bytes());
    key.extend_from_slice(&timestamp_key(logged.event.event_timestamp())?);
    key.extend_from_slice(&logged.sequence.to_be_bytes());
    Ok(key)
}

fn event_entry_index_key(event: EventId, entry_key: &[u8]) -> Vec<u8> {
    let mut key = vec![IDX_EVENT_ENTRY];
    key.extend_from_slice(event.as_bytes());
    key.extend_from_slice(entry_key);
    key
}

fn tenant_entry_index_key(tenant: TenantId, entry_key: &[u8]) -> Vec<u8> {
    let mut key = vec![IDX_TENANT_ENTRY];
    key.extend_from_slice(tenant.as_bytes());
    key.extend_from_slice(entry_key);
    key
}

fn event_log_index_key(event: EventId) -> Vec<u8> {
    let mut key = vec![IDX_EVENT_LOG];
    key.extend_from_slice(event.as_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage("Malformed sequence counter".to_string()))?;
    Ok(u64::from_be_bytes(arr))
}
