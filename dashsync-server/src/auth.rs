//! Identity collaborators: bearer tokens and public user profiles.
//!
//! Both are trusted external services. The static implementations back
//! the daemon and tests.

use std::collections::HashMap;

use dashsync_core::SyncError;

/// Resolves a bearer credential to a user id.
pub trait Authenticator: Send + Sync {
    /// `None` when the token is unknown.
    fn verify(&self, token: &str) -> Option<String>;
}

/// Fixed token → user id table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }

    /// Parse `token=user,token=user`. Blank entries are skipped.
    pub fn parse(spec: &str) -> Result<Self, SyncError> {
        let mut auth = Self::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('=') {
                Some((token, user)) if !token.trim().is_empty() && !user.trim().is_empty() => {
                    auth.tokens
                        .insert(token.trim().to_string(), user.trim().to_string());
                }
                _ => {
                    return Err(SyncError::Validation(format!(
                        "token entry '{entry}' is not token=user"
                    )))
                }
            }
        }
        Ok(auth)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn verify(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

/// Extract the token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Public-facing profile of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    /// Whether the dashboard may be fetched by anyone
    pub is_public: bool,
}

/// Looks up profiles by username.
pub trait UserDirectory: Send + Sync {
    fn find_by_username(&self, username: &str) -> Option<UserProfile>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticUserDirectory {
    profiles: HashMap<String, UserProfile>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: UserProfile) -> Self {
        self.profiles.insert(profile.username.clone(), profile);
        self
    }
}

impl UserDirectory for StaticUserDirectory {
    fn find_by_username(&self, username: &str) -> Option<UserProfile> {
        self.profiles.get(username).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_tokens() {
        let auth = StaticTokenAuthenticator::new().with_token("t1", "alice");
        assert_eq!(auth.verify("t1"), Some("alice".to_string()));
        assert_eq!(auth.verify("t2"), None);
    }

    #[test]
    fn test_parse_tokens() {
        let auth = StaticTokenAuthenticator::parse("a=alice, b=bob,").unwrap();
        assert_eq!(auth.len(), 2);
        assert_eq!(auth.verify("b"), Some("bob".to_string()));

        assert!(StaticTokenAuthenticator::parse("").unwrap().is_empty());
        assert!(StaticTokenAuthenticator::parse("broken").is_err());
        assert!(StaticTokenAuthenticator::parse("=alice").is_err());
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer"), None);
        assert_eq!(bearer_token("Bearer  "), None);
    }

    #[test]
    fn test_directory_lookup() {
        let dir = StaticUserDirectory::new().with_profile(UserProfile {
            user_id: "u1".into(),
            username: "alice".into(),
            display_name: None,
            is_public: true,
        });
        assert!(dir.find_by_username("alice").unwrap().is_public);
        assert!(dir.find_by_username("bob").is_none());
    }
}
