//! Store double that fails selected operations on demand.

use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use dashsync_core::{Backup, BackupKind, ConflictEntry, Dashboard, DashboardData, DeviceSyncRecord};

use super::{CasResult, DashboardStore, DeviceRegistry, MemoryStore, StoreError};

/// Wraps a [`MemoryStore`]; every switch starts off.
#[derive(Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    pub fail_create_backup: AtomicBool,
    pub fail_cas: AtomicBool,
    fail_load_after_write: AtomicBool,
    written: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads keep working until the next successful write, then fail.
    pub fn fail_loads_after_next_write(&self) {
        self.written.store(false, Ordering::SeqCst);
        self.fail_load_after_write.store(true, Ordering::SeqCst);
    }

    fn down(what: &str) -> StoreError {
        StoreError::Unavailable(format!("{what} failed"))
    }
}

impl DashboardStore for FaultyStore {
    fn load(&self, user_id: &str) -> Result<Dashboard, StoreError> {
        if self.fail_load_after_write.load(Ordering::SeqCst) && self.written.load(Ordering::SeqCst) {
            return Err(Self::down("load"));
        }
        self.inner.load(user_id)
    }

    fn get(&self, user_id: &str) -> Result<Option<Dashboard>, StoreError> {
        self.inner.get(user_id)
    }

    fn compare_and_swap(
        &self,
        user_id: &str,
        expected_version: u64,
        data: DashboardData,
    ) -> Result<CasResult, StoreError> {
        if self.fail_cas.load(Ordering::SeqCst) {
            return Err(Self::down("compare_and_swap"));
        }
        let result = self.inner.compare_and_swap(user_id, expected_version, data)?;
        if result.applied {
            self.written.store(true, Ordering::SeqCst);
        }
        Ok(result)
    }

    fn force_set(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, StoreError> {
        let dashboard = self.inner.force_set(user_id, data)?;
        self.written.store(true, Ordering::SeqCst);
        Ok(dashboard)
    }

    fn replace(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, StoreError> {
        let dashboard = self.inner.replace(user_id, data)?;
        self.written.store(true, Ordering::SeqCst);
        Ok(dashboard)
    }

    fn create_backup(&self, user_id: &str, kind: BackupKind) -> Result<Backup, StoreError> {
        if self.fail_create_backup.load(Ordering::SeqCst) {
            return Err(Self::down("create_backup"));
        }
        self.inner.create_backup(user_id, kind)
    }

    fn list_backups(&self, user_id: &str, limit: usize) -> Result<Vec<Backup>, StoreError> {
        self.inner.list_backups(user_id, limit)
    }

    fn restore_backup(&self, user_id: &str, backup_id: Uuid) -> Result<Dashboard, StoreError> {
        self.inner.restore_backup(user_id, backup_id)
    }

    fn delete_backup(&self, user_id: &str, backup_id: Uuid) -> Result<(), StoreError> {
        self.inner.delete_backup(user_id, backup_id)
    }

    fn purge_backups_before(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        self.inner.purge_backups_before(cutoff_ms)
    }
}

impl DeviceRegistry for FaultyStore {
    fn upsert(
        &self,
        dashboard_id: Uuid,
        user_id: &str,
        device_id: &str,
        device_name: Option<&str>,
        sync_version: u64,
    ) -> Result<DeviceSyncRecord, StoreError> {
        self.inner
            .upsert(dashboard_id, user_id, device_id, device_name, sync_version)
    }

    fn record_conflict(
        &self,
        dashboard_id: Uuid,
        user_id: &str,
        device_id: &str,
        entry: ConflictEntry,
    ) -> Result<(), StoreError> {
        self.inner
            .record_conflict(dashboard_id, user_id, device_id, entry)
    }

    fn remove(&self, dashboard_id: Uuid, device_id: &str) -> Result<bool, StoreError> {
        self.inner.remove(dashboard_id, device_id)
    }

    fn list(&self, dashboard_id: Uuid) -> Result<Vec<DeviceSyncRecord>, StoreError> {
        self.inner.list(dashboard_id)
    }
}
