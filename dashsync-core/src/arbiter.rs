//! Conflict arbitration for optimistic, whole-document concurrency.
//!
//! The arbiter only compares version numbers. It never looks at tabs,
//! widgets or settings, and it never merges.
//!
//! ```text
//! submitted <  current  → Conflict(Stale)   device missed an update
//! submitted == current  → Accept(current+1)
//! submitted >  current  → Conflict(Ahead)   device claims a version the store never issued
//! ```

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::model::DashboardData;

/// Why a submission could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Stale,
    Ahead,
}

/// Outcome of comparing a submitted version against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept { new_version: u64 },
    Conflict { kind: ConflictKind, server_version: u64 },
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }
}

/// Decide whether a submission made against `submitted` applies on top of
/// a store currently at `current`.
pub fn arbitrate(submitted: u64, current: u64) -> Verdict {
    use std::cmp::Ordering;

    match submitted.cmp(&current) {
        Ordering::Equal => Verdict::Accept {
            new_version: current + 1,
        },
        Ordering::Less => Verdict::Conflict {
            kind: ConflictKind::Stale,
            server_version: current,
        },
        Ordering::Greater => {
            log::warn!("Submitted version {submitted} is ahead of stored version {current}");
            Verdict::Conflict {
                kind: ConflictKind::Ahead,
                server_version: current,
            }
        }
    }
}

/// Everything a device needs to adjudicate a rejected update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub local_version: u64,
    pub server_version: u64,
    pub server_data: DashboardData,
    pub local_data: DashboardData,
}

/// The device's adjudication of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep what the device submitted.
    Local,
    /// Keep what the server had.
    Server,
    /// Use an explicitly merged payload.
    Manual,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Local => write!(f, "local"),
            Resolution::Server => write!(f, "server"),
            Resolution::Manual => write!(f, "manual"),
        }
    }
}

/// Candidate payloads sent along with a resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<DashboardData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<DashboardData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<DashboardData>,
}

impl ResolutionData {
    /// Pick the payload named by `resolution`, without comparing anything.
    pub fn select(&self, resolution: Resolution) -> Result<&DashboardData, SyncError> {
        let chosen = match resolution {
            Resolution::Local => self.local.as_ref(),
            Resolution::Server => self.server.as_ref(),
            Resolution::Manual => self.merged.as_ref(),
        };
        chosen.ok_or_else(|| {
            SyncError::Validation(format!("resolution '{resolution}' is missing its payload"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Settings, Tab};

    fn data(tab: &str) -> DashboardData {
        DashboardData::new(vec![Tab::new(tab, tab)], Settings::default())
    }

    #[test]
    fn test_equal_version_accepts() {
        assert_eq!(arbitrate(5, 5), Verdict::Accept { new_version: 6 });
        assert!(arbitrate(1, 1).is_accept());
    }

    #[test]
    fn test_stale_version_conflicts() {
        assert_eq!(
            arbitrate(3, 6),
            Verdict::Conflict {
                kind: ConflictKind::Stale,
                server_version: 6
            }
        );
    }

    #[test]
    fn test_ahead_version_conflicts() {
        let verdict = arbitrate(9, 4);
        assert_eq!(
            verdict,
            Verdict::Conflict {
                kind: ConflictKind::Ahead,
                server_version: 4
            }
        );
        assert!(!verdict.is_accept());
    }

    #[test]
    fn test_accepted_versions_step_by_one() {
        let mut current = 1;
        for _ in 0..50 {
            match arbitrate(current, current) {
                Verdict::Accept { new_version } => {
                    assert_eq!(new_version, current + 1);
                    current = new_version;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(current, 51);
    }

    #[test]
    fn test_select_each_resolution() {
        let payloads = ResolutionData {
            local: Some(data("local")),
            server: Some(data("server")),
            merged: Some(data("merged")),
        };
        assert_eq!(payloads.select(Resolution::Local).unwrap().tabs[0].id, "local");
        assert_eq!(payloads.select(Resolution::Server).unwrap().tabs[0].id, "server");
        assert_eq!(payloads.select(Resolution::Manual).unwrap().tabs[0].id, "merged");
    }

    #[test]
    fn test_select_missing_payload() {
        let payloads = ResolutionData {
            local: Some(data("local")),
            ..ResolutionData::default()
        };
        let err = payloads.select(Resolution::Manual).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_resolution_wire_names() {
        let parsed: Resolution = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(parsed, Resolution::Manual);
        assert_eq!(serde_json::to_string(&Resolution::Local).unwrap(), "\"local\"");
    }
}
