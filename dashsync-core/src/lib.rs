//! # dashsync-core - dashboard model and versioning rules
//!
//! Pure, transport-free building blocks of the dashboard sync engine:
//!
//! - [`model`] - Dashboard aggregate (tabs, widgets, settings, version)
//! - [`arbiter`] - version comparison and conflict resolution choice
//! - [`backup`] - backup snapshots and the cadence scheduler
//! - [`registry`] - per-device sync status records
//! - [`error`] - error taxonomy shared by every layer

pub mod arbiter;
pub mod backup;
pub mod error;
pub mod model;
pub mod registry;

pub use arbiter::{
    arbitrate, ConflictKind, ConflictReport, Resolution, ResolutionData, Verdict,
};
pub use backup::{
    Backup, BackupKind, BackupScheduler, BackupSummary, BACKUP_RETENTION_MS,
    DEFAULT_BACKUP_CADENCE,
};
pub use error::SyncError;
pub use model::{
    Background, BackgroundKind, Dashboard, DashboardData, Settings, Tab, Widget, WidgetType,
};
pub use registry::{ConflictEntry, DeviceSyncRecord};

use std::time::SystemTime;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
