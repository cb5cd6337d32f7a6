//! Error taxonomy for dashboard sync operations.
//!
//! A version conflict is deliberately absent: it is an expected outcome
//! that the caller must act on, not a failure.

/// Errors surfaced to callers of the sync engine and request surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No dashboard, backup or device exists for the given id.
    NotFound(String),
    /// Identity mismatch or missing session authentication.
    Unauthorized(String),
    /// Malformed or rule-breaking payload.
    Validation(String),
    /// Persistence layer unavailable; the mutation did not apply.
    Unavailable(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotFound(what) => write!(f, "Not found: {what}"),
            SyncError::Unauthorized(why) => write!(f, "Unauthorized: {why}"),
            SyncError::Validation(why) => write!(f, "Validation failed: {why}"),
            SyncError::Unavailable(why) => write!(f, "Store unavailable: {why}"),
        }
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert!(SyncError::NotFound("backup x".into()).to_string().contains("backup x"));
        assert!(SyncError::Unauthorized("no session".into())
            .to_string()
            .starts_with("Unauthorized"));
    }
}
