//! In-memory store used by tests and by the daemon when no data
//! directory is configured.
//!
//! Each user owns one slot behind its own mutex, so writes for one user are
//! serialized while other users proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use dashsync_core::registry::sort_by_recent_sync;
use dashsync_core::{
    now_millis, Backup, BackupKind, ConflictEntry, Dashboard, DashboardData, DeviceSyncRecord,
};

use super::{CasResult, DashboardStore, DeviceRegistry, StoreError};

#[derive(Default)]
struct UserSlot {
    dashboard: Option<Dashboard>,
    /// Creation order
    backups: Vec<Backup>,
}

impl UserSlot {
    fn dashboard_mut(&mut self, user_id: &str) -> Result<&mut Dashboard, StoreError> {
        self.dashboard
            .as_mut()
            .ok_or_else(|| StoreError::NotFound(format!("dashboard for user {user_id}")))
    }

    fn last_sequence(&self) -> u64 {
        self.backups.iter().map(|b| b.sequence).max().unwrap_or(0)
    }

    /// Append a snapshot of the current dashboard.
    fn snapshot(&mut self, user_id: &str, kind: &BackupKind, now_ms: u64) -> Result<Backup, StoreError> {
        let last_sequence = self.last_sequence();
        let dashboard = self.dashboard_mut(user_id)?;
        let backup = Backup::capture(dashboard, kind, last_sequence, now_ms);
        dashboard.last_backup_at = Some(now_ms);
        self.backups.push(backup.clone());
        Ok(backup)
    }
}

/// Volatile dashboard store and device registry.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, Arc<Mutex<UserSlot>>>>,
    devices: RwLock<HashMap<(Uuid, String), DeviceSyncRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the slot for `user_id`.
    fn slot(&self, user_id: &str) -> Result<Arc<Mutex<UserSlot>>, StoreError> {
        // Fast path: read lock
        {
            let users = self.users.read().map_err(poisoned)?;
            if let Some(slot) = users.get(user_id) {
                return Ok(slot.clone());
            }
        }

        // Slow path: write lock, double-check
        let mut users = self.users.write().map_err(poisoned)?;
        Ok(users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserSlot::default())))
            .clone())
    }

    /// Slot for `user_id` if one was ever created. Never inserts.
    fn lookup(&self, user_id: &str) -> Result<Option<Arc<Mutex<UserSlot>>>, StoreError> {
        Ok(self.users.read().map_err(poisoned)?.get(user_id).cloned())
    }

    /// Slot for `user_id`, or `NotFound` when the user has none.
    fn existing_slot(&self, user_id: &str) -> Result<Arc<Mutex<UserSlot>>, StoreError> {
        self.lookup(user_id)?
            .ok_or_else(|| StoreError::NotFound(format!("dashboard for user {user_id}")))
    }

    fn all_slots(&self) -> Result<Vec<Arc<Mutex<UserSlot>>>, StoreError> {
        Ok(self.users.read().map_err(poisoned)?.values().cloned().collect())
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.users.read().map(|users| users.len()).unwrap_or(0)
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Unavailable(format!("lock poisoned: {e}"))
}

fn lock(slot: &Mutex<UserSlot>) -> Result<MutexGuard<'_, UserSlot>, StoreError> {
    slot.lock().map_err(poisoned)
}

fn backup_not_found(backup_id: Uuid) -> StoreError {
    StoreError::NotFound(format!("backup {backup_id}"))
}

impl DashboardStore for MemoryStore {
    fn load(&self, user_id: &str) -> Result<Dashboard, StoreError> {
        let slot = self.slot(user_id)?;
        let mut slot = lock(&slot)?;
        let dashboard = slot
            .dashboard
            .get_or_insert_with(|| Dashboard::new_default(user_id, now_millis()));
        Ok(dashboard.clone())
    }

    fn get(&self, user_id: &str) -> Result<Option<Dashboard>, StoreError> {
        match self.lookup(user_id)? {
            Some(slot) => Ok(lock(&slot)?.dashboard.clone()),
            None => Ok(None),
        }
    }

    fn compare_and_swap(
        &self,
        user_id: &str,
        expected_version: u64,
        data: DashboardData,
    ) -> Result<CasResult, StoreError> {
        let slot = self.existing_slot(user_id)?;
        let mut slot = lock(&slot)?;
        let dashboard = slot.dashboard_mut(user_id)?;

        if dashboard.version != expected_version {
            return Ok(CasResult {
                version: dashboard.version,
                applied: false,
            });
        }

        let version = dashboard.apply(data, now_millis());
        Ok(CasResult {
            version,
            applied: true,
        })
    }

    fn force_set(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, StoreError> {
        let slot = self.existing_slot(user_id)?;
        let mut slot = lock(&slot)?;
        let dashboard = slot.dashboard_mut(user_id)?;
        dashboard.apply(data, now_millis());
        Ok(dashboard.clone())
    }

    fn replace(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, StoreError> {
        let slot = self.slot(user_id)?;
        let mut slot = lock(&slot)?;
        let now = now_millis();
        match slot.dashboard.as_mut() {
            Some(dashboard) => {
                dashboard.apply(data, now);
                Ok(dashboard.clone())
            }
            None => {
                let dashboard = Dashboard::with_data(user_id, data, now);
                slot.dashboard = Some(dashboard.clone());
                Ok(dashboard)
            }
        }
    }

    fn create_backup(&self, user_id: &str, kind: BackupKind) -> Result<Backup, StoreError> {
        let slot = self.existing_slot(user_id)?;
        let mut slot = lock(&slot)?;
        slot.snapshot(user_id, &kind, now_millis())
    }

    fn list_backups(&self, user_id: &str, limit: usize) -> Result<Vec<Backup>, StoreError> {
        let slot = self.existing_slot(user_id)?;
        let slot = lock(&slot)?;
        if slot.dashboard.is_none() {
            return Err(StoreError::NotFound(format!("dashboard for user {user_id}")));
        }
        let mut backups = slot.backups.clone();
        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        backups.truncate(limit);
        Ok(backups)
    }

    fn restore_backup(&self, user_id: &str, backup_id: Uuid) -> Result<Dashboard, StoreError> {
        let slot = self
            .lookup(user_id)?
            .ok_or_else(|| backup_not_found(backup_id))?;
        let mut slot = lock(&slot)?;

        let target = slot
            .backups
            .iter()
            .find(|b| b.id == backup_id)
            .map(|b| b.data.clone())
            .ok_or_else(|| backup_not_found(backup_id))?;

        let now = now_millis();
        slot.snapshot(user_id, &BackupKind::PreRestore, now)?;
        let dashboard = slot.dashboard_mut(user_id)?;
        dashboard.apply(target, now);
        Ok(dashboard.clone())
    }

    fn delete_backup(&self, user_id: &str, backup_id: Uuid) -> Result<(), StoreError> {
        let slot = self
            .lookup(user_id)?
            .ok_or_else(|| backup_not_found(backup_id))?;
        let mut slot = lock(&slot)?;
        let before = slot.backups.len();
        slot.backups.retain(|b| b.id != backup_id);
        if slot.backups.len() == before {
            return Err(backup_not_found(backup_id));
        }
        Ok(())
    }

    fn purge_backups_before(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let mut removed = 0;
        for slot in self.all_slots()? {
            let mut slot = lock(&slot)?;
            let before = slot.backups.len();
            slot.backups.retain(|b| b.created_at >= cutoff_ms);
            removed += before - slot.backups.len();
        }
        Ok(removed)
    }
}

impl DeviceRegistry for MemoryStore {
    fn upsert(
        &self,
        dashboard_id: Uuid,
        user_id: &str,
        device_id: &str,
        device_name: Option<&str>,
        sync_version: u64,
    ) -> Result<DeviceSyncRecord, StoreError> {
        let now = now_millis();
        let mut devices = self.devices.write().map_err(poisoned)?;
        let record = devices
            .entry((dashboard_id, device_id.to_string()))
            .and_modify(|r| r.touch(device_name, sync_version, now))
            .or_insert_with(|| {
                DeviceSyncRecord::new(dashboard_id, user_id, device_id, device_name, sync_version, now)
            });
        Ok(record.clone())
    }

    fn record_conflict(
        &self,
        dashboard_id: Uuid,
        user_id: &str,
        device_id: &str,
        entry: ConflictEntry,
    ) -> Result<(), StoreError> {
        let mut devices = self.devices.write().map_err(poisoned)?;
        devices
            .entry((dashboard_id, device_id.to_string()))
            .or_insert_with(|| {
                DeviceSyncRecord::new(dashboard_id, user_id, device_id, None, 0, entry.resolved_at)
            })
            .conflicts
            .push(entry);
        Ok(())
    }

    fn remove(&self, dashboard_id: Uuid, device_id: &str) -> Result<bool, StoreError> {
        let mut devices = self.devices.write().map_err(poisoned)?;
        Ok(devices.remove(&(dashboard_id, device_id.to_string())).is_some())
    }

    fn list(&self, dashboard_id: Uuid) -> Result<Vec<DeviceSyncRecord>, StoreError> {
        let devices = self.devices.read().map_err(poisoned)?;
        let mut records: Vec<DeviceSyncRecord> = devices
            .values()
            .filter(|r| r.dashboard_id == dashboard_id)
            .cloned()
            .collect();
        sort_by_recent_sync(&mut records);
        Ok(records)
    }
}
