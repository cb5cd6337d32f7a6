//! Request/response surface over the sync engine.
//!
//! Every operation acts on the caller's own dashboard, identified by the
//! authenticated user id. Mutations are pushed to the caller's live
//! sessions as `dashboard_synced`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use dashsync_core::{
    BackupSummary, Dashboard, DashboardData, DeviceSyncRecord, Settings, SyncError, Tab,
};

use crate::auth::UserDirectory;
use crate::broadcast::{Broadcaster, Recipients};
use crate::engine::SyncEngine;
use crate::protocol::{DashboardSyncedBody, ServerMessage};

/// Backups returned when the caller gives no limit.
pub const DEFAULT_BACKUP_LIMIT: usize = 50;

/// Devices synced against the caller's dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListing {
    pub devices: Vec<DeviceSyncRecord>,
    pub current_version: u64,
}

/// What anyone may see of a public dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicDashboard {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub tabs: Vec<Tab>,
    pub settings: Settings,
}

pub struct DashboardService {
    engine: Arc<SyncEngine>,
    broadcaster: Arc<Broadcaster>,
    directory: Arc<dyn UserDirectory>,
}

impl DashboardService {
    pub fn new(
        engine: Arc<SyncEngine>,
        broadcaster: Arc<Broadcaster>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            engine,
            broadcaster,
            directory,
        }
    }

    /// Current dashboard, created on first access.
    pub fn get_dashboard(&self, user_id: &str) -> Result<Dashboard, SyncError> {
        self.engine.current(user_id)
    }

    /// Create the dashboard or overwrite it as a new version.
    pub async fn put_dashboard(
        &self,
        user_id: &str,
        data: DashboardData,
    ) -> Result<Dashboard, SyncError> {
        let dashboard = self.engine.replace(user_id, data).await?;
        self.push(&dashboard).await;
        Ok(dashboard)
    }

    pub async fn update_dashboard(
        &self,
        user_id: &str,
        data: DashboardData,
    ) -> Result<Dashboard, SyncError> {
        let dashboard = self.engine.update(user_id, data).await?;
        self.push(&dashboard).await;
        Ok(dashboard)
    }

    pub fn list_backups(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<BackupSummary>, SyncError> {
        let backups = self
            .engine
            .list_backups(user_id, limit.unwrap_or(DEFAULT_BACKUP_LIMIT))?;
        Ok(backups.iter().map(|b| b.summary()).collect())
    }

    pub async fn create_backup(
        &self,
        user_id: &str,
        description: Option<String>,
    ) -> Result<BackupSummary, SyncError> {
        let backup = self.engine.create_backup(user_id, description).await?;
        log::info!("Manual backup #{} for {user_id}", backup.sequence);
        Ok(backup.summary())
    }

    pub async fn restore_backup(
        &self,
        user_id: &str,
        backup_id: Uuid,
    ) -> Result<Dashboard, SyncError> {
        let dashboard = self.engine.restore_backup(user_id, backup_id).await?;
        self.push(&dashboard).await;
        Ok(dashboard)
    }

    pub async fn delete_backup(&self, user_id: &str, backup_id: Uuid) -> Result<(), SyncError> {
        self.engine.delete_backup(user_id, backup_id).await
    }

    pub fn list_devices(&self, user_id: &str) -> Result<DeviceListing, SyncError> {
        let (devices, current_version) = self.engine.list_devices(user_id)?;
        Ok(DeviceListing {
            devices,
            current_version,
        })
    }

    pub fn remove_device(&self, user_id: &str, device_id: &str) -> Result<(), SyncError> {
        self.engine.remove_device(user_id, device_id)
    }

    /// Read-only view of another user's dashboard, if they made it public.
    pub fn public_dashboard(&self, username: &str) -> Result<PublicDashboard, SyncError> {
        let profile = self
            .directory
            .find_by_username(username)
            .ok_or_else(|| SyncError::NotFound(format!("user {username}")))?;
        if !profile.is_public {
            return Err(SyncError::Unauthorized(format!(
                "dashboard of {username} is private"
            )));
        }

        let dashboard = self
            .engine
            .store()
            .get(&profile.user_id)?
            .ok_or_else(|| SyncError::NotFound(format!("dashboard of {username}")))?;

        Ok(PublicDashboard {
            username: profile.username,
            display_name: profile.display_name,
            tabs: dashboard.tabs,
            settings: dashboard.settings,
        })
    }

    async fn push(&self, dashboard: &Dashboard) {
        let synced = ServerMessage::DashboardSynced(DashboardSyncedBody {
            data: dashboard.data(),
            version: dashboard.version,
            updated_by: None,
            conflict_resolved: false,
        });
        if let Err(e) = self
            .broadcaster
            .notify(&dashboard.user_id, Recipients::All, &synced)
            .await
        {
            log::warn!("Broadcast to {} failed: {e}", dashboard.user_id);
        }
    }
}
