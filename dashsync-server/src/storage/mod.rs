//! Versioned document store and device registry.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  load / CAS / forceSet  ┌──────────────────────────────┐
//! │ SyncEngine  │ ──────────────────────► │ DashboardStore               │
//! │ (per-user   │                         │  MemoryStore | RocksStore    │
//! │  lock)      │ ──────────────────────► │ DeviceRegistry               │
//! └─────────────┘  upsert / conflicts     └──────────────┬───────────────┘
//!                                                        │ RocksDB column families
//!                                         ┌──────────────┴───────────────┐
//!                                         │ CF "dashboards" - aggregate  │
//!                                         │ CF "backups"    - snapshots  │
//!                                         │ CF "devices"    - sync state │
//!                                         └──────────────────────────────┘
//! ```
//!
//! Every write for a single user is atomic: the in-memory engine holds the
//! user's slot lock, the RocksDB engine commits one write batch.

#[cfg(test)]
pub(crate) mod faulty;
pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use uuid::Uuid;

use dashsync_core::{
    Backup, BackupKind, ConflictEntry, Dashboard, DashboardData, DeviceSyncRecord, SyncError,
};

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasResult {
    /// New version when applied, otherwise the version found in the store.
    pub version: u64,
    pub applied: bool,
}

/// Persistence contract for dashboards and their backup history.
pub trait DashboardStore: Send + Sync {
    /// Current dashboard, creating the default one on first access.
    fn load(&self, user_id: &str) -> Result<Dashboard, StoreError>;

    /// Current dashboard without creating one.
    fn get(&self, user_id: &str) -> Result<Option<Dashboard>, StoreError>;

    /// Write `data` only if the stored version equals `expected_version`.
    fn compare_and_swap(
        &self,
        user_id: &str,
        expected_version: u64,
        data: DashboardData,
    ) -> Result<CasResult, StoreError>;

    /// Write `data` unconditionally, still advancing the version by one.
    /// Returns the dashboard as written.
    fn force_set(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, StoreError>;

    /// Create at version 1, or overwrite an existing dashboard as version+1.
    fn replace(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, StoreError>;

    /// Snapshot the current content and stamp `last_backup_at`.
    fn create_backup(&self, user_id: &str, kind: BackupKind) -> Result<Backup, StoreError>;

    /// Newest first, at most `limit`.
    fn list_backups(&self, user_id: &str, limit: usize) -> Result<Vec<Backup>, StoreError>;

    /// Snapshot the current state as "pre-restore", then overwrite it with
    /// the backup's content as version+1. All or nothing.
    fn restore_backup(&self, user_id: &str, backup_id: Uuid) -> Result<Dashboard, StoreError>;

    fn delete_backup(&self, user_id: &str, backup_id: Uuid) -> Result<(), StoreError>;

    /// Drop every backup created before `cutoff_ms`. Returns how many went.
    fn purge_backups_before(&self, cutoff_ms: u64) -> Result<usize, StoreError>;
}

/// Persistence contract for per-device sync status.
pub trait DeviceRegistry: Send + Sync {
    fn upsert(
        &self,
        dashboard_id: Uuid,
        user_id: &str,
        device_id: &str,
        device_name: Option<&str>,
        sync_version: u64,
    ) -> Result<DeviceSyncRecord, StoreError>;

    fn record_conflict(
        &self,
        dashboard_id: Uuid,
        user_id: &str,
        device_id: &str,
        entry: ConflictEntry,
    ) -> Result<(), StoreError>;

    /// Returns whether a record existed.
    fn remove(&self, dashboard_id: Uuid, device_id: &str) -> Result<bool, StoreError>;

    /// Most recent `last_sync_at` first.
    fn list(&self, dashboard_id: Uuid) -> Result<Vec<DeviceSyncRecord>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Dashboard, backup or device not found
    NotFound(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Store temporarily unusable (poisoned lock, shutting down)
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(what) => write!(f, "Not found: {what}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => SyncError::NotFound(what),
            other => SyncError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("backup 1".into());
        assert!(err.to_string().contains("Not found"));

        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
    }

    #[test]
    fn test_store_error_maps_to_sync_error() {
        let not_found: SyncError = StoreError::NotFound("x".into()).into();
        assert_eq!(not_found, SyncError::NotFound("x".into()));

        let unavailable: SyncError = StoreError::DatabaseError("io".into()).into();
        assert!(matches!(unavailable, SyncError::Unavailable(_)));
    }
}
