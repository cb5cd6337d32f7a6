//! Backup snapshots and the policy that decides when to take them.
//!
//! Automatic snapshots capture the state *before* a mutation is applied:
//! the very first mutation of a dashboard, and every mutation made while
//! the version sits on a multiple of the cadence.
//!
//! ```text
//! version:  1   2 …  9  10  11 … 19  20
//! backup:   ✓ (first)    ✓            ✓
//! ```
//!
//! History is pruned by age only.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Dashboard, DashboardData};

/// Versions between automatic snapshots.
pub const DEFAULT_BACKUP_CADENCE: u64 = 10;

/// Backups older than this are garbage-collected (90 days).
pub const BACKUP_RETENTION_MS: u64 = 90 * 24 * 60 * 60 * 1000;

pub const AUTOMATIC_DESCRIPTION: &str = "Automatic backup";
pub const MANUAL_DESCRIPTION: &str = "Manual backup";
pub const PRE_RESTORE_DESCRIPTION: &str = "pre-restore";

/// What triggered a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupKind {
    /// Cadence-driven, taken by the scheduler.
    Automatic,
    /// User-requested, with an optional description.
    Manual(Option<String>),
    /// Forced immediately before a restore.
    PreRestore,
}

impl BackupKind {
    pub fn is_automatic(&self) -> bool {
        !matches!(self, BackupKind::Manual(_))
    }

    pub fn description(&self) -> String {
        match self {
            BackupKind::Automatic => AUTOMATIC_DESCRIPTION.to_string(),
            BackupKind::Manual(Some(text)) if !text.trim().is_empty() => text.clone(),
            BackupKind::Manual(_) => MANUAL_DESCRIPTION.to_string(),
            BackupKind::PreRestore => PRE_RESTORE_DESCRIPTION.to_string(),
        }
    }
}

/// Immutable snapshot of a dashboard's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub id: Uuid,
    pub dashboard_id: Uuid,
    pub user_id: String,
    pub data: DashboardData,
    /// Dashboard version that was captured.
    pub version: u64,
    /// Per-dashboard ordinal, starting at 1.
    pub sequence: u64,
    pub change_description: String,
    pub is_automatic: bool,
    pub created_at: u64,
}

impl Backup {
    /// Capture `dashboard` as the backup following `last_sequence`.
    pub fn capture(dashboard: &Dashboard, kind: &BackupKind, last_sequence: u64, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            dashboard_id: dashboard.id,
            user_id: dashboard.user_id.clone(),
            data: dashboard.data(),
            version: dashboard.version,
            sequence: last_sequence + 1,
            change_description: kind.description(),
            is_automatic: kind.is_automatic(),
            created_at: now_ms,
        }
    }

    pub fn summary(&self) -> BackupSummary {
        BackupSummary {
            id: self.id,
            version: self.version,
            sequence: self.sequence,
            change_description: self.change_description.clone(),
            is_automatic: self.is_automatic,
            created_at: self.created_at,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.created_at < retention_cutoff(now_ms)
    }
}

/// Listing view of a backup, without the captured content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub id: Uuid,
    pub version: u64,
    pub sequence: u64,
    pub change_description: String,
    pub is_automatic: bool,
    pub created_at: u64,
}

/// Oldest `created_at` that is still within the retention window.
pub fn retention_cutoff(now_ms: u64) -> u64 {
    now_ms.saturating_sub(BACKUP_RETENTION_MS)
}

/// Cadence policy for automatic snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupScheduler {
    cadence: u64,
}

impl Default for BackupScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_BACKUP_CADENCE)
    }
}

impl BackupScheduler {
    /// A cadence of 0 is treated as 1 (snapshot before every mutation).
    pub fn new(cadence: u64) -> Self {
        Self {
            cadence: cadence.max(1),
        }
    }

    pub fn cadence(&self) -> u64 {
        self.cadence
    }

    /// Whether the pre-mutation state of `dashboard` should be snapshotted.
    pub fn should_snapshot(&self, dashboard: &Dashboard) -> bool {
        dashboard.last_backup_at.is_none() || dashboard.version % self.cadence == 0
    }
}
