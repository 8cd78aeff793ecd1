use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Result of a pre-pull token check. The coordinator refuses to fetch
/// anything without a valid token.
#[derive(Debug, Clone)]
pub struct TokenStatus {
    pub is_valid: bool,
    pub needs_reauth: bool,
    pub access_token: Option<String>,
}

impl TokenStatus {
    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            needs_reauth: true,
            access_token: None,
        }
    }
}

pub trait TokenValidator: Send + Sync {
    fn validate(&self) -> Result<TokenStatus>;
}

#[derive(Debug, Deserialize)]
struct StoredToken {
    access_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Reads the bearer token the OAuth flow left on disk. Refreshing expired
/// tokens is the job of that flow, not ours; an expired token simply means
/// the user has to reconnect.
pub struct FileTokenValidator {
    path: PathBuf,
}

impl FileTokenValidator {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The raw token for building the API client. Empty when not signed in.
    pub fn access_token(&self) -> String {
        self.validate()
            .ok()
            .and_then(|status| status.access_token)
            .unwrap_or_default()
    }
}

impl TokenValidator for FileTokenValidator {
    fn validate(&self) -> Result<TokenStatus> {
        if !self.path.exists() {
            debug!("No token file at {}", self.path.display());
            return Ok(TokenStatus::invalid());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read token file {}", self.path.display()))?;
        let token: StoredToken = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse token file {}", self.path.display()))?;

        if token.access_token.is_empty() {
            return Ok(TokenStatus::invalid());
        }
        if let Some(expires_at) = token.expires_at {
            if expires_at <= Utc::now() {
                debug!("Token expired at {}", expires_at);
                return Ok(TokenStatus::invalid());
            }
        }

        Ok(TokenStatus {
            is_valid: true,
            needs_reauth: false,
            access_token: Some(token.access_token),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_missing_file_needs_reauth() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FileTokenValidator::new(dir.path().join("token.json"));
        let status = validator.validate().unwrap();
        assert!(!status.is_valid);
        assert!(status.needs_reauth);
    }

    #[test]
    fn test_valid_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        fs::write(&path, r#"{"access_token": "abc123"}"#).unwrap();

        let status = FileTokenValidator::new(path).validate().unwrap();
        assert!(status.is_valid);
        assert_eq!(status.access_token.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let expired = Utc::now() - Duration::hours(1);
        fs::write(
            &path,
            format!(r#"{{"access_token": "abc123", "expires_at": "{}"}}"#, expired.to_rfc3339()),
        )
        .unwrap();

        let status = FileTokenValidator::new(path).validate().unwrap();
        assert!(!status.is_valid);
    }
}
