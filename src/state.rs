use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{CleanerError, Result};
use crate::tasks::{ResumePoint, TaskSnapshot};

const JOURNAL_VERSION: u32 = 1;

/// Write `bytes` to a temp file next to `path`, fsync, then rename over `path`.
/// With `owner_only` the file is created with mode 0600 on Unix.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8], owner_only: bool) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        if owner_only {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = owner_only;

    let result = async {
        let mut file = options.open(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// On-disk layout of the task journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalFile {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<TaskSnapshot>,
    #[serde(default)]
    pub resume: BTreeMap<String, ResumePoint>,
}

impl Default for JournalFile {
    fn default() -> Self {
        Self {
            version: JOURNAL_VERSION,
            saved_at: Utc::now(),
            tasks: Vec::new(),
            resume: BTreeMap::new(),
        }
    }
}

/// JSON journal of task snapshots, used to report and resume work
/// across restarts
#[derive(Debug)]
pub struct TaskJournal {
    path: PathBuf,
    // Held while a snapshot is built and written, so writes land in snapshot order
    write_lock: tokio::sync::Mutex<()>,
}

impl TaskJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, file: &JournalFile) -> Result<()> {
        self.save_with(|| file.clone()).await
    }

    /// Build the journal contents under the write lock and write them.
    /// A writer that snapshots later always writes later.
    pub async fn save_with<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce() -> JournalFile,
    {
        let _guard = self.write_lock.lock().await;
        let mut file = build();
        file.saved_at = Utc::now();
        let json = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &json, false)
            .await
            .map_err(|e| CleanerError::StateError(format!("Failed to write journal {:?}: {}", self.path, e)))?;
        tracing::debug!("Saved task journal ({} tasks) to {:?}", file.tasks.len(), self.path);
        Ok(())
    }

    /// Load the journal. A missing or unreadable journal yields an empty one.
    pub async fn load(&self) -> Result<JournalFile> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No existing task journal found, starting fresh");
                return Ok(JournalFile::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<JournalFile>(&json) {
            Ok(file) if file.version == JOURNAL_VERSION => {
                tracing::info!(
                    "Loaded task journal: {} tasks, {} resumable",
                    file.tasks.len(),
                    file.resume.len()
                );
                Ok(file)
            }
            Ok(file) => {
                tracing::warn!("Ignoring task journal with unknown version {}", file.version);
                Ok(JournalFile::default())
            }
            Err(e) => {
                tracing::warn!("Task journal {:?} is corrupt ({}), starting fresh", self.path, e);
                Ok(JournalFile::default())
            }
        }
    }
}
