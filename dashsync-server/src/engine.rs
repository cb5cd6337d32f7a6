//! The sync engine: versioned mutations of a user's dashboard.
//!
//! ```text
//! submit_update ──► lock(user) ──► load ──► arbitrate ──┬─► Conflict (no write)
//!                                                      │
//!                                                      └─► backup? ──► CAS ──► registry
//! ```
//!
//! Mutations for one user run under that user's async mutex, so the whole
//! load → arbitrate → backup → write sequence is linearizable per user.
//! Reads skip the lock. Backup and registry failures are logged and never
//! fail the mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use dashsync_core::{
    arbitrate, now_millis, Backup, BackupKind, BackupScheduler, ConflictEntry, ConflictReport,
    Dashboard, DashboardData, DeviceSyncRecord, Resolution, ResolutionData, SyncError, Verdict,
    DEFAULT_BACKUP_CADENCE,
};

use crate::storage::{DashboardStore, DeviceRegistry, MemoryStore};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Versions between automatic backups
    pub backup_cadence: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_cadence: DEFAULT_BACKUP_CADENCE,
        }
    }
}

/// Result of submitting an update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Accepted {
        version: u64,
        synced_at: u64,
        data: DashboardData,
    },
    /// Nothing was written.
    Conflict(ConflictReport),
}

/// One async mutex per user id. Entries are dropped as soon as no task
/// holds or waits for them.
#[derive(Default)]
pub struct UserLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub async fn acquire(&self, user_id: &str) -> UserGuard<'_> {
        let lock = self
            .map()
            .entry(user_id.to_string())
            .or_default()
            .clone();
        UserGuard {
            locks: self,
            user_id: user_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Users with a live entry.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to one user's mutations.
pub struct UserGuard<'a> {
    locks: &'a UserLocks,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.map();
        // Only the map's own handle left: nobody holds or awaits it
        if map
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.user_id);
        }
    }
}

/// Applies device and request-surface mutations to the store.
pub struct SyncEngine {
    store: Arc<dyn DashboardStore>,
    registry: Arc<dyn DeviceRegistry>,
    scheduler: BackupScheduler,
    locks: UserLocks,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DashboardStore>,
        registry: Arc<dyn DeviceRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler: BackupScheduler::new(config.backup_cadence),
            locks: UserLocks::default(),
        }
    }

    /// Engine over a fresh in-memory store, used for both roles.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(store.clone(), store, EngineConfig::default())
    }

    pub fn store(&self) -> &Arc<dyn DashboardStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    // ─── Device sessions ──────────────────────────────────────────────

    /// Bind a device to the user's dashboard, creating the default one on
    /// first contact.
    pub async fn authenticate(
        &self,
        user_id: &str,
        device_id: &str,
        device_name: Option<&str>,
    ) -> Result<Dashboard, SyncError> {
        if device_id.trim().is_empty() {
            return Err(SyncError::Validation("deviceId is required".into()));
        }

        let dashboard = self.store.load(user_id)?;
        self.touch_device(&dashboard, device_id, device_name, dashboard.version);
        log::info!(
            "Device {device_id} authenticated for {user_id} at v{}",
            dashboard.version
        );
        Ok(dashboard)
    }

    /// Apply `data` if `version` is the stored version.
    pub async fn submit_update(
        &self,
        user_id: &str,
        device_id: &str,
        device_name: Option<&str>,
        data: DashboardData,
        version: u64,
    ) -> Result<UpdateOutcome, SyncError> {
        data.validate()?;

        let _guard = self.locks.acquire(user_id).await;
        let current = self.store.load(user_id)?;

        if let Verdict::Conflict { kind, server_version } = arbitrate(version, current.version) {
            log::info!(
                "Conflict ({kind:?}) for {user_id} from {device_id}: submitted v{version}, stored v{server_version}"
            );
            return Ok(UpdateOutcome::Conflict(conflict_report(&current, version, data)));
        }

        self.maybe_backup(&current);

        let cas = self
            .store
            .compare_and_swap(user_id, current.version, data.clone())?;
        if !cas.applied {
            let latest = self.store.load(user_id)?;
            return Ok(UpdateOutcome::Conflict(conflict_report(&latest, version, data)));
        }

        self.touch_device(&current, device_id, device_name, cas.version);
        log::info!("Accepted update for {user_id} from {device_id}: v{}", cas.version);

        Ok(UpdateOutcome::Accepted {
            version: cas.version,
            synced_at: now_millis(),
            data,
        })
    }

    /// Apply the payload a device chose for a conflict, without a version
    /// check. The version still advances by one.
    pub async fn resolve_conflict(
        &self,
        user_id: &str,
        device_id: &str,
        device_name: Option<&str>,
        resolution: Resolution,
        payloads: &ResolutionData,
    ) -> Result<Dashboard, SyncError> {
        let chosen = payloads.select(resolution)?.clone();
        chosen.validate()?;

        let _guard = self.locks.acquire(user_id).await;
        let current = self.store.load(user_id)?;
        self.maybe_backup(&current);

        let dashboard = self.store.force_set(user_id, chosen)?;
        let version = dashboard.version;

        let entry = ConflictEntry {
            local_value: payloads.local.clone(),
            server_value: payloads.server.clone(),
            resolution,
            resolved_at: now_millis(),
        };
        if let Err(e) = self
            .registry
            .record_conflict(current.id, user_id, device_id, entry)
        {
            log::warn!("Failed to record conflict for {user_id}/{device_id}: {e}");
        }
        self.touch_device(&current, device_id, device_name, version);

        log::info!("Conflict for {user_id} resolved as {resolution} by {device_id}: v{version}");
        Ok(dashboard)
    }

    // ─── Request surface ──────────────────────────────────────────────

    pub fn current(&self, user_id: &str) -> Result<Dashboard, SyncError> {
        Ok(self.store.load(user_id)?)
    }

    /// Create at version 1 or overwrite as version+1.
    pub async fn replace(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, SyncError> {
        data.validate()?;
        let _guard = self.locks.acquire(user_id).await;
        if let Some(existing) = self.store.get(user_id)? {
            self.maybe_backup(&existing);
        }
        Ok(self.store.replace(user_id, data)?)
    }

    /// Unconditional update with backup cadence.
    pub async fn update(&self, user_id: &str, data: DashboardData) -> Result<Dashboard, SyncError> {
        data.validate()?;
        let _guard = self.locks.acquire(user_id).await;
        let current = self.store.load(user_id)?;
        self.maybe_backup(&current);
        Ok(self.store.force_set(user_id, data)?)
    }

    pub async fn create_backup(
        &self,
        user_id: &str,
        description: Option<String>,
    ) -> Result<Backup, SyncError> {
        let _guard = self.locks.acquire(user_id).await;
        self.store.load(user_id)?;
        Ok(self
            .store
            .create_backup(user_id, BackupKind::Manual(description))?)
    }

    pub fn list_backups(&self, user_id: &str, limit: usize) -> Result<Vec<Backup>, SyncError> {
        Ok(self.store.list_backups(user_id, limit)?)
    }

    pub async fn restore_backup(&self, user_id: &str, backup_id: Uuid) -> Result<Dashboard, SyncError> {
        let _guard = self.locks.acquire(user_id).await;
        Ok(self.store.restore_backup(user_id, backup_id)?)
    }

    pub async fn delete_backup(&self, user_id: &str, backup_id: Uuid) -> Result<(), SyncError> {
        let _guard = self.locks.acquire(user_id).await;
        Ok(self.store.delete_backup(user_id, backup_id)?)
    }

    /// Device records of the user's dashboard, with its current version.
    pub fn list_devices(&self, user_id: &str) -> Result<(Vec<DeviceSyncRecord>, u64), SyncError> {
        let dashboard = self.store.load(user_id)?;
        let devices = self.registry.list(dashboard.id)?;
        Ok((devices, dashboard.version))
    }

    pub fn remove_device(&self, user_id: &str, device_id: &str) -> Result<(), SyncError> {
        let Some(dashboard) = self.store.get(user_id)? else {
            return Err(SyncError::NotFound(format!("device {device_id}")));
        };
        if self.registry.remove(dashboard.id, device_id)? {
            Ok(())
        } else {
            Err(SyncError::NotFound(format!("device {device_id}")))
        }
    }

    /// Drop backups older than the retention window.
    pub fn purge_expired_backups(&self, now_ms: u64) -> Result<usize, SyncError> {
        let removed = self
            .store
            .purge_backups_before(dashsync_core::backup::retention_cutoff(now_ms))?;
        if removed > 0 {
            log::info!("Purged {removed} expired backups");
        }
        Ok(removed)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Snapshot the pre-mutation state when the cadence says so.
    fn maybe_backup(&self, dashboard: &Dashboard) {
        if !self.scheduler.should_snapshot(dashboard) {
            return;
        }
        match self
            .store
            .create_backup(&dashboard.user_id, BackupKind::Automatic)
        {
            Ok(backup) => log::debug!(
                "Automatic backup #{} of {} at v{}",
                backup.sequence,
                dashboard.user_id,
                backup.version
            ),
            Err(e) => log::warn!("Automatic backup for {} failed: {e}", dashboard.user_id),
        }
    }

    fn touch_device(
        &self,
        dashboard: &Dashboard,
        device_id: &str,
        device_name: Option<&str>,
        version: u64,
    ) {
        if let Err(e) = self.registry.upsert(
            dashboard.id,
            &dashboard.user_id,
            device_id,
            device_name,
            version,
        ) {
            log::warn!(
                "Failed to update device record {}/{device_id}: {e}",
                dashboard.user_id
            );
        }
    }
}

fn conflict_report(current: &Dashboard, submitted: u64, local: DashboardData) -> ConflictReport {
    ConflictReport {
        local_version: submitted,
        server_version: current.version,
        server_data: current.data(),
        local_data: local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::faulty::FaultyStore;
    use crate::storage::StoreError;
    use dashsync_core::{Settings, Tab};
    use std::sync::atomic::Ordering;

    fn data(tab: &str) -> DashboardData {
        DashboardData::new(vec![Tab::new(tab, tab)], Settings::default())
    }

    /// Registry whose every write fails.
    struct BrokenRegistry;

    impl DeviceRegistry for BrokenRegistry {
        fn upsert(
            &self,
            _: Uuid,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: u64,
        ) -> Result<DeviceSyncRecord, StoreError> {
            Err(StoreError::Unavailable("registry down".into()))
        }

        fn record_conflict(&self, _: Uuid, _: &str, _: &str, _: ConflictEntry) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("registry down".into()))
        }

        fn remove(&self, _: Uuid, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("registry down".into()))
        }

        fn list(&self, _: Uuid) -> Result<Vec<DeviceSyncRecord>, StoreError> {
            Err(StoreError::Unavailable("registry down".into()))
        }
    }

    #[tokio::test]
    async fn test_authenticate_creates_and_registers() {
        let engine = SyncEngine::in_memory();
        let dash = engine.authenticate("alice", "laptop", Some("Laptop")).await.unwrap();
        assert_eq!(dash.version, 1);

        let (devices, version) = engine.list_devices("alice").unwrap();
        assert_eq!(version, 1);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_name, "Laptop");
        assert_eq!(devices[0].sync_version, 1);
    }

    #[tokio::test]
    async fn test_authenticate_requires_device_id() {
        let engine = SyncEngine::in_memory();
        assert!(matches!(
            engine.authenticate("alice", "  ", None).await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_increments_and_backs_up_first_mutation() {
        let engine = SyncEngine::in_memory();
        engine.authenticate("alice", "laptop", None).await.unwrap();

        let outcome = engine
            .submit_update("alice", "laptop", None, data("a"), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Accepted { version: 2, .. }));

        let backups = engine.list_backups("alice", 50).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].version, 1);
        assert!(backups[0].is_automatic);
        assert_eq!(engine.current("alice").unwrap().tabs[0].id, "a");
    }

    #[tokio::test]
    async fn test_stale_update_conflicts_without_write() {
        let engine = SyncEngine::in_memory();
        engine.authenticate("alice", "laptop", None).await.unwrap();
        engine.submit_update("alice", "laptop", None, data("a"), 1).await.unwrap();

        let outcome = engine
            .submit_update("alice", "phone", None, data("b"), 1)
            .await
            .unwrap();
        match outcome {
            UpdateOutcome::Conflict(report) => {
                assert_eq!(report.local_version, 1);
                assert_eq!(report.server_version, 2);
                assert_eq!(report.server_data.tabs[0].id, "a");
                assert_eq!(report.local_data.tabs[0].id, "b");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let current = engine.current("alice").unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.tabs[0].id, "a");
    }

    #[tokio::test]
    async fn test_ahead_update_conflicts() {
        let engine = SyncEngine::in_memory();
        engine.authenticate("alice", "laptop", None).await.unwrap();

        let outcome = engine
            .submit_update("alice", "laptop", None, data("a"), 7)
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Conflict(_)));
        assert_eq!(engine.current("alice").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_invalid_update_rejected() {
        let engine = SyncEngine::in_memory();
        let mut bad = data("a");
        bad.settings.grid_cols = 3;
        assert!(matches!(
            engine.submit_update("alice", "laptop", None, bad, 1).await,
            Err(SyncError::Validation(_))
        ));
        assert!(engine.store().get("alice").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backup_cadence() {
        let engine = SyncEngine::in_memory();
        engine.authenticate("alice", "laptop", None).await.unwrap();

        for v in 1..=10 {
            let outcome = engine
                .submit_update("alice", "laptop", None, data(&format!("t{v}")), v)
                .await
                .unwrap();
            assert!(matches!(outcome, UpdateOutcome::Accepted { .. }));
        }

        assert_eq!(engine.current("alice").unwrap().version, 11);
        let versions: Vec<u64> = engine
            .list_backups("alice", 50)
            .unwrap()
            .iter()
            .map(|b| b.version)
            .collect();
        assert_eq!(versions, vec![10, 1]);
    }

    #[tokio::test]
    async fn test_resolve_local_records_conflict() {
        let engine = SyncEngine::in_memory();
        engine.authenticate("alice", "laptop", None).await.unwrap();
        engine.submit_update("alice", "phone", None, data("server"), 1).await.unwrap();

        let payloads = ResolutionData {
            local: Some(data("local")),
            server: Some(data("server")),
            merged: None,
        };
        let dash = engine
            .resolve_conflict("alice", "laptop", None, Resolution::Local, &payloads)
            .await
            .unwrap();
        assert_eq!(dash.version, 3);
        assert_eq!(dash.tabs[0].id, "local");

        let (devices, _) = engine.list_devices("alice").unwrap();
        let laptop = devices.iter().find(|d| d.device_id == "laptop").unwrap();
        assert_eq!(laptop.conflicts.len(), 1);
        assert_eq!(laptop.conflicts[0].resolution, Resolution::Local);
        assert_eq!(laptop.sync_version, 3);
    }

    #[tokio::test]
    async fn test_resolve_server_still_bumps_version() {
        let engine = SyncEngine::in_memory();
        engine.authenticate("alice", "laptop", None).await.unwrap();
        let payloads = ResolutionData {
            local: None,
            server: Some(data("same")),
            merged: None,
        };
        let dash = engine
            .resolve_conflict("alice", "laptop", None, Resolution::Server, &payloads)
            .await
            .unwrap();
        assert_eq!(dash.version, 2);
    }

    #[tokio::test]
    async fn test_resolve_manual_without_merge_is_invalid() {
        let engine = SyncEngine::in_memory();
        engine.authenticate("alice", "laptop", None).await.unwrap();
        let payloads = ResolutionData {
            local: Some(data("l")),
            server: None,
            merged: None,
        };
        assert!(matches!(
            engine
                .resolve_conflict("alice", "laptop", None, Resolution::Manual, &payloads)
                .await,
            Err(SyncError::Validation(_))
        ));
        assert_eq!(engine.current("alice").unwrap().version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_accept_exactly_one() {
        let engine = Arc::new(SyncEngine::in_memory());
        engine.authenticate("alice", "d0", None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .submit_update("alice", &format!("d{i}"), None, data(&format!("t{i}")), 1)
                    .await
                    .unwrap()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), UpdateOutcome::Accepted { .. }) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(engine.current("alice").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_registry_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(store, Arc::new(BrokenRegistry), EngineConfig::default());

        engine.authenticate("alice", "laptop", None).await.unwrap();
        let outcome = engine
            .submit_update("alice", "laptop", None, data("a"), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Accepted { version: 2, .. }));

        let payloads = ResolutionData {
            local: Some(data("b")),
            ..ResolutionData::default()
        };
        let dash = engine
            .resolve_conflict("alice", "laptop", None, Resolution::Local, &payloads)
            .await
            .unwrap();
        assert_eq!(dash.version, 3);
    }

    #[tokio::test]
    async fn test_request_surface_mutations() {
        let engine = SyncEngine::in_memory();

        let created = engine.replace("bob", data("one")).await.unwrap();
        assert_eq!(created.version, 1);
        let updated = engine.update("bob", data("two")).await.unwrap();
        assert_eq!(updated.version, 2);

        let manual = engine.create_backup("bob", Some("before three".into())).await.unwrap();
        assert_eq!(manual.change_description, "before three");
        assert!(!manual.is_automatic);

        engine.update("bob", data("three")).await.unwrap();
        let restored = engine.restore_backup("bob", manual.id).await.unwrap();
        assert_eq!(restored.tabs[0].id, "two");
        assert_eq!(restored.version, 4);

        engine.delete_backup("bob", manual.id).await.unwrap();
        assert!(matches!(
            engine.restore_backup("bob", manual.id).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_device() {
        let engine = SyncEngine::in_memory();
        engine.authenticate("alice", "laptop", None).await.unwrap();

        engine.remove_device("alice", "laptop").unwrap();
        assert!(matches!(
            engine.remove_device("alice", "laptop"),
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            engine.remove_device("nobody", "laptop"),
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_expired_backups() {
        let engine = SyncEngine::in_memory();
        engine.authenticate("alice", "laptop", None).await.unwrap();
        engine.create_backup("alice", None).await.unwrap();

        assert_eq!(engine.purge_expired_backups(now_millis()).unwrap(), 0);
        let far_future = now_millis() + dashsync_core::BACKUP_RETENTION_MS + 1_000;
        assert_eq!(engine.purge_expired_backups(far_future).unwrap(), 1);
    }

    fn faulty_engine() -> (Arc<FaultyStore>, SyncEngine) {
        let store = Arc::new(FaultyStore::new());
        let engine = SyncEngine::new(store.clone(), store.clone(), EngineConfig::default());
        (store, engine)
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_fail_update() {
        let (store, engine) = faulty_engine();
        engine.authenticate("alice", "laptop", None).await.unwrap();
        store.fail_create_backup.store(true, Ordering::SeqCst);

        // First mutation is due for an automatic backup
        let outcome = engine
            .submit_update("alice", "laptop", None, data("a"), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Accepted { version: 2, .. }));
        assert_eq!(engine.current("alice").unwrap().tabs[0].id, "a");
        assert!(engine.list_backups("alice", 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_leaves_version() {
        let (store, engine) = faulty_engine();
        engine.authenticate("alice", "laptop", None).await.unwrap();
        store.fail_cas.store(true, Ordering::SeqCst);

        assert!(matches!(
            engine.submit_update("alice", "laptop", None, data("a"), 1).await,
            Err(SyncError::Unavailable(_))
        ));
        assert_eq!(engine.current("alice").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_resolution_reports_written_dashboard_without_reload() {
        let (store, engine) = faulty_engine();
        engine.authenticate("alice", "laptop", None).await.unwrap();
        store.fail_loads_after_next_write();

        let payloads = ResolutionData {
            local: Some(data("mine")),
            ..ResolutionData::default()
        };
        let dash = engine
            .resolve_conflict("alice", "laptop", None, Resolution::Local, &payloads)
            .await
            .unwrap();
        assert_eq!(dash.version, 2);
        assert_eq!(dash.tabs[0].id, "mine");
        assert_eq!(store.get("alice").unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_update_reports_written_dashboard_without_reload() {
        let (store, engine) = faulty_engine();
        engine.replace("bob", data("one")).await.unwrap();
        store.fail_loads_after_next_write();

        let updated = engine.update("bob", data("two")).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.tabs[0].id, "two");
        assert!(engine.current("bob").is_err());
        assert_eq!(store.get("bob").unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_user_locks_are_released() {
        let engine = SyncEngine::in_memory();
        for user in ["alice", "bob", "carol"] {
            engine.authenticate(user, "laptop", None).await.unwrap();
            engine
                .submit_update(user, "laptop", None, data("a"), 1)
                .await
                .unwrap();
        }
        engine.create_backup("alice", None).await.unwrap();
        assert!(engine.locks.is_empty());

        let held = engine.locks.acquire("alice").await;
        assert_eq!(engine.locks.len(), 1);
        drop(held);
        assert!(engine.locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_user_lock_still_excludes_while_contended() {
        let locks = Arc::new(UserLocks::default());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("alice").await;
                let inside = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(inside, 0);
                tokio::task::yield_now().await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(locks.is_empty());
    }
}
