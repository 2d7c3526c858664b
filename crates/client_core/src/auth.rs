use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::{UserId, UserSummary};
use tracing::warn;

/// Supplies the bearer token used for the socket and REST calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn missing() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Option<String> {
        self.token.clone().filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredUser {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl StoredUser {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

/// Re-reads the JSON user record on every lookup.
pub struct StoredSession {
    path: PathBuf,
}

impl StoredSession {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<StoredUser>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read session file '{}'", self.path.display())
                })
            }
        };
        let user = serde_json::from_str(&raw).with_context(|| {
            format!("invalid session record in '{}'", self.path.display())
        })?;
        Ok(Some(user))
    }

    pub async fn user(&self) -> Result<UserSummary> {
        self.load()
            .await?
            .map(|user| user.summary())
            .ok_or_else(|| anyhow!("User not authenticated"))
    }
}

#[async_trait]
impl TokenProvider for StoredSession {
    async fn bearer_token(&self) -> Option<String> {
        match self.load().await {
            Ok(user) => user
                .and_then(|user| user.token)
                .filter(|token| !token.is_empty()),
            Err(error) => {
                warn!(path = %self.path.display(), %error, "auth: unreadable session record");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn temp_session_path(tag: &str) -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("chat_client_{tag}_{suffix}.json"))
    }

    #[tokio::test]
    async fn reads_token_and_profile_from_session_file() {
        let path = temp_session_path("session");
        std::fs::write(
            &path,
            r#"{"id":7,"username":"bob","email":"bob@example.com","token":"abc123"}"#,
        )
        .expect("write session");

        let session = StoredSession::new(&path);
        assert_eq!(session.bearer_token().await.as_deref(), Some("abc123"));
        let user = session.user().await.expect("user");
        assert_eq!(user.id, UserId::new("7"));
        assert_eq!(user.username, "bob");

        std::fs::remove_file(path).expect("cleanup");
    }

    #[tokio::test]
    async fn missing_file_means_no_token() {
        let session = StoredSession::new(temp_session_path("absent"));
        assert!(session.bearer_token().await.is_none());
        assert!(session.user().await.is_err());
    }

    #[tokio::test]
    async fn empty_token_is_treated_as_missing() {
        let path = temp_session_path("empty");
        std::fs::write(&path, r#"{"id":"1","username":"ann","token":""}"#).expect("write");

        assert!(StoredSession::new(&path).bearer_token().await.is_none());
        assert!(StaticTokenProvider::new("").bearer_token().await.is_none());
        assert!(StaticTokenProvider::missing().bearer_token().await.is_none());

        std::fs::remove_file(path).expect("cleanup");
    }
}
