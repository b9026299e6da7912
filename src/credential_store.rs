//! Durable storage for the OAuth credential

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CleanerError, Result};
use crate::state::write_atomic;

/// A refreshable access credential
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Credential {
    /// True when the credential expires within `margin` from now
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at - margin <= Utc::now()
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Persistence for the single credential record.
///
/// Implementations never fail on malformed content: anything that cannot
/// be decoded is reported as absent.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credential>>;
    async fn save(&self, credential: &Credential) -> Result<()>;
    /// Remove the record. Succeeds when nothing is stored.
    async fn clear(&self) -> Result<()>;
}

/// JSON file store with owner-only permissions
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credential>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CleanerError::StorageError(format!(
                    "Failed to read {:?}: {}",
                    self.path, e
                )))
            }
        };

        if content.trim().is_empty() {
            tracing::warn!("Token file {:?} is empty, treating as absent", self.path);
            return Ok(None);
        }

        match serde_json::from_str::<Credential>(&content) {
            Ok(credential) if !credential.access_token.is_empty() => Ok(Some(credential)),
            Ok(_) => {
                tracing::warn!("Token file {:?} has no access token, treating as absent", self.path);
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Token file {:?} is malformed ({}), treating as absent", self.path, e);
                Ok(None)
            }
        }
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let json = serde_json::to_vec_pretty(credential)?;
        write_atomic(&self.path, &json, true)
            .await
            .map_err(|e| CleanerError::StorageError(format!("Failed to write {:?}: {}", self.path, e)))?;
        tracing::debug!("Saved credential to {:?}", self.path);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::info!("Removed credential at {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CleanerError::StorageError(format!(
                "Failed to remove {:?}: {}",
                self.path, e
            ))),
        }
    }
}
