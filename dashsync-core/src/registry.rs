//! Per-device sync status records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arbiter::Resolution;
use crate::model::DashboardData;

pub const UNKNOWN_DEVICE_NAME: &str = "Unknown device";

/// One adjudicated conflict, kept for the device's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub local_value: Option<DashboardData>,
    pub server_value: Option<DashboardData>,
    pub resolution: Resolution,
    pub resolved_at: u64,
}

/// Sync status of one device against one dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncRecord {
    pub dashboard_id: Uuid,
    pub user_id: String,
    pub device_id: String,
    pub device_name: String,
    pub last_sync_at: u64,
    /// Highest dashboard version this device has confirmed.
    pub sync_version: u64,
    #[serde(default)]
    pub conflicts: Vec<ConflictEntry>,
}

impl DeviceSyncRecord {
    pub fn new(
        dashboard_id: Uuid,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        device_name: Option<&str>,
        sync_version: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            dashboard_id,
            user_id: user_id.into(),
            device_id: device_id.into(),
            device_name: normalize_device_name(device_name),
            last_sync_at: now_ms,
            sync_version,
            conflicts: Vec::new(),
        }
    }

    /// Refresh after a sync. The confirmed version never moves backwards and
    /// a missing name keeps the stored one.
    pub fn touch(&mut self, device_name: Option<&str>, sync_version: u64, now_ms: u64) {
        if let Some(name) = device_name.filter(|n| !n.trim().is_empty()) {
            self.device_name = name.to_string();
        }
        self.sync_version = self.sync_version.max(sync_version);
        self.last_sync_at = now_ms;
    }
}

fn normalize_device_name(name: Option<&str>) -> String {
    match name {
        Some(n) if !n.trim().is_empty() => n.to_string(),
        _ => UNKNOWN_DEVICE_NAME.to_string(),
    }
}

/// Sort records newest sync first.
pub fn sort_by_recent_sync(records: &mut [DeviceSyncRecord]) {
    records.sort_by(|a, b| b.last_sync_at.cmp(&a.last_sync_at));
}
