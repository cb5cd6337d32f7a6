//! RocksDB-backed persistent dashboard store.
//!
//! Column families:
//! - `dashboards` - Current dashboard per user (LZ4 compressed JSON, keyed by user_id)
//! - `backups`    - Snapshots (LZ4 compressed JSON, keyed by dashboard_id:sequence)
//! - `devices`    - Device sync records (LZ4 compressed JSON, keyed by dashboard_id:device_id)
//!
//! Values are JSON rather than bincode because widget payloads are
//! schemaless and need a self-describing format.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use dashsync_core::registry::sort_by_recent_sync;
use dashsync_core::{
    now_millis, Backup, BackupKind, ConflictEntry, Dashboard, DashboardData, DeviceSyncRecord,
};

use super::{CasResult, DashboardStore, DeviceRegistry, StoreError};

/// Column family names.
const CF_DASHBOARDS: &str = "dashboards";
const CF_BACKUPS: &str = "backups";
const CF_DEVICES: &str = "devices";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DASHBOARDS, CF_BACKUPS, CF_DEVICES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dashsync_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl StoreConfig {
    /// Config at `path` with production defaults.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// RocksDB-backed dashboard store and device registry.
///
/// Every mutation of a user's dashboard is one atomic write batch, taken
/// under that user's write lock. Reads go straight to RocksDB.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode - concurrency via locks)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Per-user write locks
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes read-modify-write on device records
    device_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened dashboard store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            user_locks: Mutex::new(HashMap::new()),
            device_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DASHBOARDS => {
                // One hot key per user
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BACKUPS => {
                // Append-mostly, scanned by dashboard prefix
                opts.set_max_write_buffer_number(4);
            }
            CF_DEVICES => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Force a flush of memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Dashboards ───────────────────────────────────────────────────

    fn read_dashboard(&self, user_id: &str) -> Result<Option<Dashboard>, StoreError> {
        let cf = self.cf(CF_DASHBOARDS)?;
        match self.db.get_cf(&cf, user_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require_dashboard(&self, user_id: &str) -> Result<Dashboard, StoreError> {
        self.read_dashboard(user_id)?
            .ok_or_else(|| StoreError::NotFound(format!("dashboard for user {user_id}")))
    }

    fn put_dashboard(&self, batch: &mut WriteBatch, dashboard: &Dashboard) -> Result<(), StoreError> {
        let cf = self.cf(CF_DASHBOARDS)?;
        batch.put_cf(&cf, dashboard.user_id.as_bytes(), encode_value(dashboard)?);
        Ok(())
    }

    // ─── Backups ──────────────────────────────────────────────────────

    /// Highest backup sequence stored for a dashboard, 0 when none.
    fn last_sequence(&self, dashboard_id: Uuid) -> Result<u64, StoreError> {
        let cf = self.cf(CF_BACKUPS)?;
        let seek = Self::backup_key(dashboard_id, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&seek, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.len() == 24 && &key[..16] == dashboard_id.as_bytes() {
                    Ok(read_u64(&key[16..24]))
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    /// All backups of a dashboard with their keys, highest sequence first.
    fn backups_of(&self, dashboard_id: Uuid) -> Result<Vec<(Box<[u8]>, Backup)>, StoreError> {
        let cf = self.cf(CF_BACKUPS)?;
        let seek = Self::backup_key(dashboard_id, u64::MAX);

        let mut backups = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&seek, Direction::Reverse));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != dashboard_id.as_bytes() {
                break;
            }
            let backup: Backup = decode_value(&value)?;
            backups.push((key, backup));
        }

        Ok(backups)
    }

    /// Stage a snapshot of `dashboard` and stamp its `last_backup_at`.
    fn stage_backup(
        &self,
        batch: &mut WriteBatch,
        dashboard: &mut Dashboard,
        kind: &BackupKind,
        now_ms: u64,
    ) -> Result<Backup, StoreError> {
        let cf = self.cf(CF_BACKUPS)?;
        let last_sequence = self.last_sequence(dashboard.id)?;
        let backup = Backup::capture(dashboard, kind, last_sequence, now_ms);
        batch.put_cf(
            &cf,
            Self::backup_key(dashboard.id, backup.sequence),
            encode_value(&backup)?,
        );
        dashboard.last_backup_at = Some(now_ms);
        Ok(backup)
    }

    // ─── Devices ──────────────────────────────────────────────────────

    fn read_device(&self, key: &[u8]) -> Result<Option<DeviceSyncRecord>, StoreError> {
        let cf = self.cf(CF_DEVICES)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_device(&self, key: &[u8], record: &DeviceSyncRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_DEVICES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, key, encode_value(record)?);
        self.commit(batch)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn user_lock(&self, user_id: &str) -> Result<UserLock<'_>, StoreError> {
        let mut locks = self.user_locks.lock().map_err(poisoned)?;
        let lock = locks.entry(user_id.to_string()).or_default().clone();
        Ok(UserLock {
            store: self,
            user_id: user_id.to_string(),
            lock,
        })
    }

    /// Build a backup key: dashboard_id (16 bytes) + sequence (8 bytes big-endian).
    fn backup_key(dashboard_id: Uuid, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(dashboard_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    /// Build a device key: dashboard_id (16 bytes) + device_id (utf-8).
    fn device_key(dashboard_id: Uuid, device_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + device_id.len());
        key.extend_from_slice(dashboard_id.as_bytes());
        key.extend_from_slice(device_id.as_bytes());
        key
    }
}

impl DashboardStore for RocksStore {
    fn load(&self, user_id: &str) -> Result<Dashboard, StoreError> {
        if let Some(dashboard) = self.read_dashboard(user_id)? {
            return Ok(dashboard);
        }

        let lock = self.user_lock(user_id)?;
        let _guard = lock.lock().map_err(poisoned)?;
        if let Some(dashboard) = self.read_dashboard(user_id)? {
            return Ok(dashboard);
        }

        let dashboard = Dashboard::new_default(user_id, now_millis());
        let mut batch = WriteBatch::default();
        self.put_dashboard(&mut batch, &dashboard)?;
        self.commit(batch)?;
        log::debug!("Created default dashboard for {user_id}");
        Ok(dashboard)
    }

    fn get(&self, user_id: &str) -> Result<Option<Dashboard>, StoreError> {
        self.read_dashboard(user_id)
    }

    fn compare_and_swap(
        &self,
        user_id: &str,
        expected_version: u64,
        data: DashboardData,
    ) -> Result<CasResult, StoreError> {
        let lock = self.user_lock(user_id)?;
        let _guard = lock.lock().map_err(poisoned)?;

        let mut dashboard = self.require_dashboard(user_id)?;
        if dashboard.version != expected_version {
            return Ok(CasResult {
                version: dashboard.version,
                applied: false,
            });
        }

        let version = dashboard.apply(data, now_millis());
        let mut batch = WriteBatch::default();
        self.put_dashboard(&mut batch, &dashboard)?;
        self.commit(batch)?;
        Ok(CasResult {
            version,
            applied: true,
        })
    }

    fn force_set(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, StoreError> {
        let lock = self.user_lock(user_id)?;
        let _guard = lock.lock().map_err(poisoned)?;

        let mut dashboard = self.require_dashboard(user_id)?;
        dashboard.apply(data, now_millis());
        let mut batch = WriteBatch::default();
        self.put_dashboard(&mut batch, &dashboard)?;
        self.commit(batch)?;
        Ok(dashboard)
    }

    fn replace(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, StoreError> {
        let lock = self.user_lock(user_id)?;
        let _guard = lock.lock().map_err(poisoned)?;

        let now = now_millis();
        let dashboard = match self.read_dashboard(user_id)? {
            Some(mut existing) => {
                existing.apply(data, now);
                existing
            }
            None => Dashboard::with_data(user_id, data, now),
        };

        let mut batch = WriteBatch::default();
        self.put_dashboard(&mut batch, &dashboard)?;
        self.commit(batch)?;
        Ok(dashboard)
    }

    fn create_backup(&self, user_id: &str, kind: BackupKind) -> Result<Backup, StoreError> {
        let lock = self.user_lock(user_id)?;
        let _guard = lock.lock().map_err(poisoned)?;

        let mut dashboard = self.require_dashboard(user_id)?;
        let mut batch = WriteBatch::default();
        let backup = self.stage_backup(&mut batch, &mut dashboard, &kind, now_millis())?;
        self.put_dashboard(&mut batch, &dashboard)?;
        self.commit(batch)?;
        Ok(backup)
    }

    fn list_backups(&self, user_id: &str, limit: usize) -> Result<Vec<Backup>, StoreError> {
        let dashboard = self.require_dashboard(user_id)?;
        Ok(self
            .backups_of(dashboard.id)?
            .into_iter()
            .map(|(_, backup)| backup)
            .take(limit)
            .collect())
    }

    fn restore_backup(&self, user_id: &str, backup_id: Uuid) -> Result<Dashboard, StoreError> {
        let lock = self.user_lock(user_id)?;
        let _guard = lock.lock().map_err(poisoned)?;

        let mut dashboard = self.require_dashboard(user_id)?;
        let target = self
            .backups_of(dashboard.id)?
            .into_iter()
            .map(|(_, backup)| backup)
            .find(|backup| backup.id == backup_id)
            .ok_or_else(|| StoreError::NotFound(format!("backup {backup_id}")))?;

        let now = now_millis();
        let mut batch = WriteBatch::default();
        self.stage_backup(&mut batch, &mut dashboard, &BackupKind::PreRestore, now)?;
        dashboard.apply(target.data, now);
        self.put_dashboard(&mut batch, &dashboard)?;
        self.commit(batch)?;

        log::info!(
            "Restored backup {backup_id} (v{}) for {user_id} as v{}",
            target.version,
            dashboard.version
        );
        Ok(dashboard)
    }

    fn delete_backup(&self, user_id: &str, backup_id: Uuid) -> Result<(), StoreError> {
        let lock = self.user_lock(user_id)?;
        let _guard = lock.lock().map_err(poisoned)?;

        let not_found = || StoreError::NotFound(format!("backup {backup_id}"));
        let dashboard = self.read_dashboard(user_id)?.ok_or_else(not_found)?;
        let (key, _) = self
            .backups_of(dashboard.id)?
            .into_iter()
            .find(|(_, backup)| backup.id == backup_id)
            .ok_or_else(not_found)?;

        let cf = self.cf(CF_BACKUPS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, &key);
        self.commit(batch)
    }

    fn purge_backups_before(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let cf = self.cf(CF_BACKUPS)?;

        // user_id -> expired backup keys
        let mut expired: HashMap<String, Vec<Box<[u8]>>> = HashMap::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let backup: Backup = match decode_value(&value) {
                Ok(backup) => backup,
                Err(e) => {
                    log::warn!("Skipping unreadable backup entry {}: {e}", hex_key(&key));
                    continue;
                }
            };
            if backup.created_at < cutoff_ms {
                expired.entry(backup.user_id).or_default().push(key);
            }
        }

        let mut count = 0usize;
        for (user_id, keys) in expired {
            let lock = self.user_lock(&user_id)?;
            let _guard = lock.lock().map_err(poisoned)?;

            let mut batch = WriteBatch::default();
            for key in &keys {
                batch.delete_cf(&cf, key);
            }
            match self.commit(batch) {
                Ok(()) => count += keys.len(),
                Err(e) => log::warn!("Failed to purge {} backups of {user_id}: {e}", keys.len()),
            }
        }
        Ok(count)
    }
}

impl DeviceRegistry for RocksStore {
    fn upsert(
        &self,
        dashboard_id: Uuid,
        user_id: &str,
        device_id: &str,
        device_name: Option<&str>,
        sync_version: u64,
    ) -> Result<DeviceSyncRecord, StoreError> {
        let _guard = self.device_lock.lock().map_err(poisoned)?;

        let now = now_millis();
        let key = Self::device_key(dashboard_id, device_id);
        let record = match self.read_device(&key)? {
            Some(mut record) => {
                record.touch(device_name, sync_version, now);
                record
            }
            None => {
                DeviceSyncRecord::new(dashboard_id, user_id, device_id, device_name, sync_version, now)
            }
        };
        self.write_device(&key, &record)?;
        Ok(record)
    }

    fn record_conflict(
        &self,
        dashboard_id: Uuid,
        user_id: &str,
        device_id: &str,
        entry: ConflictEntry,
    ) -> Result<(), StoreError> {
        let _guard = self.device_lock.lock().map_err(poisoned)?;

        let key = Self::device_key(dashboard_id, device_id);
        let mut record = self.read_device(&key)?.unwrap_or_else(|| {
            DeviceSyncRecord::new(dashboard_id, user_id, device_id, None, 0, entry.resolved_at)
        });
        record.conflicts.push(entry);
        self.write_device(&key, &record)
    }

    fn remove(&self, dashboard_id: Uuid, device_id: &str) -> Result<bool, StoreError> {
        let _guard = self.device_lock.lock().map_err(poisoned)?;

        let key = Self::device_key(dashboard_id, device_id);
        if self.read_device(&key)?.is_none() {
            return Ok(false);
        }

        let cf = self.cf(CF_DEVICES)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, &key);
        self.commit(batch)?;
        Ok(true)
    }

    fn list(&self, dashboard_id: Uuid) -> Result<Vec<DeviceSyncRecord>, StoreError> {
        let cf = self.cf(CF_DEVICES)?;
        let prefix: &[u8] = dashboard_id.as_bytes();

        let mut records: Vec<DeviceSyncRecord> = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            records.push(decode_value(&value)?);
        }

        sort_by_recent_sync(&mut records);
        Ok(records)
    }
}

/// Handle on one user's write lock. Dropping the last handle removes the
/// user's entry from the lock map.
struct UserLock<'a> {
    store: &'a RocksStore,
    user_id: String,
    lock: Arc<Mutex<()>>,
}

impl std::ops::Deref for UserLock<'_> {
    type Target = Mutex<()>;

    fn deref(&self) -> &Mutex<()> {
        &self.lock
    }
}

impl Drop for UserLock<'_> {
    fn drop(&mut self) {
        let Ok(mut locks) = self.store.user_locks.lock() else {
            return;
        };
        // The map's copy plus this one
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.user_id);
        }
    }
}

/// JSON encode, then LZ4 compress with a size prefix.
fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let json =
        serde_json::to_vec(value).map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

fn hex_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Unavailable(format!("lock poisoned: {e}"))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
