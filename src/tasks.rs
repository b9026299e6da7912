//! Process-wide table of background tasks and their progress

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{CleanerError, Result};
use crate::state::{JournalFile, TaskJournal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Done,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error | TaskStatus::Cancelled)
    }
}

/// One remote item that could not be processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: String,
    pub code: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(id: impl Into<String>, code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn from_error(id: impl Into<String>, error: &CleanerError) -> Self {
        Self::new(id, error.code(), error.to_string())
    }
}

/// Immutable copy of a task's state as seen by pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub kind: String,
    pub run_id: String,
    pub status: TaskStatus,
    /// Items completed successfully
    pub processed: usize,
    /// Unknown until the candidate listing finishes
    pub total: Option<usize>,
    pub failures: Vec<ItemFailure>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the process stopped while this task was running
    #[serde(default)]
    pub interrupted: bool,
}

impl TaskSnapshot {
    fn new(kind: &str) -> Self {
        let now = Utc::now();
        Self {
            kind: kind.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            status: TaskStatus::Running,
            processed: 0,
            total: None,
            failures: Vec::new(),
            message: None,
            result: None,
            error: None,
            version: 0,
            started_at: now,
            updated_at: now,
            finished_at: None,
            interrupted: false,
        }
    }

    /// Human-readable progress line, e.g. "processed 150 of 250, 100 failed"
    pub fn summary(&self) -> String {
        let mut line = match self.total {
            Some(total) => format!("processed {} of {}", self.processed, total),
            None => format!("processed {}", self.processed),
        };
        if !self.failures.is_empty() {
            line.push_str(&format!(", {} failed", self.failures.len()));
        }
        line
    }

    /// Share of items with a final outcome, successes and failures alike
    pub fn progress_percent(&self) -> Option<u8> {
        match self.total {
            Some(0) => Some(100),
            Some(total) => {
                let settled = (self.processed + self.failures.len()).min(total);
                Some(((settled * 100) / total) as u8)
            }
            None => None,
        }
    }
}

/// Incremental change applied by the task's owning driver
#[derive(Debug, Clone, Default)]
pub struct TaskDelta {
    processed: usize,
    total: Option<usize>,
    failures: Vec<ItemFailure>,
    message: Option<String>,
    result: Option<serde_json::Value>,
}

impl TaskDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(mut self, count: usize) -> Self {
        self.processed = count;
        self
    }

    pub fn total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn failures(mut self, failures: Vec<ItemFailure>) -> Self {
        self.failures = failures;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// How a run ended
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(Option<serde_json::Value>),
    Failed(String),
    Cancelled(Option<serde_json::Value>),
}

/// Remaining work recorded for a mutation task so it can be resumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub request: serde_json::Value,
    pub remaining: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ResumePoint {
    pub fn new(request: serde_json::Value, remaining: Vec<String>) -> Self {
        Self {
            request,
            remaining,
            recorded_at: Utc::now(),
        }
    }
}

struct TaskEntry {
    state: Mutex<TaskSnapshot>,
    cancel: CancellationToken,
    resume: Mutex<Option<ResumePoint>>,
}

impl TaskEntry {
    fn new(snapshot: TaskSnapshot, resume: Option<ResumePoint>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(snapshot),
            cancel: CancellationToken::new(),
            resume: Mutex::new(resume),
        })
    }
}

/// Owner's reference to a running task
#[derive(Clone)]
pub struct TaskHandle {
    kind: String,
    run_id: String,
    entry: Arc<TaskEntry>,
}

impl TaskHandle {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.entry.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.entry.state.lock().clone()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("kind", &self.kind)
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Table of tasks keyed by kind. At most one task per kind runs at a time.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
    journal: Option<TaskJournal>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// In-memory registry without persistence
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            journal: None,
        }
    }

    /// Registry backed by a journal. Tasks that were running when the
    /// journal was written come back as idle and interrupted.
    pub async fn with_journal(journal: TaskJournal) -> Result<Self> {
        let file = journal.load().await?;
        let mut resume = file.resume;
        let mut tasks = HashMap::new();

        for mut snapshot in file.tasks {
            if snapshot.status == TaskStatus::Running {
                snapshot.status = TaskStatus::Idle;
                snapshot.interrupted = true;
                snapshot.message = Some("interrupted by shutdown".to_string());
                tracing::info!("Task '{}' was interrupted, {}", snapshot.kind, snapshot.summary());
            }
            let point = resume.remove(&snapshot.kind);
            tasks.insert(snapshot.kind.clone(), TaskEntry::new(snapshot, point));
        }

        Ok(Self {
            tasks: RwLock::new(tasks),
            journal: Some(journal),
        })
    }

    /// Register a new run of `kind`, replacing any finished entry
    pub fn start(&self, kind: &str) -> Result<TaskHandle> {
        let mut tasks = self.tasks.write();
        if let Some(existing) = tasks.get(kind) {
            if existing.state.lock().status == TaskStatus::Running {
                return Err(CleanerError::Conflict {
                    kind: kind.to_string(),
                });
            }
        }

        let snapshot = TaskSnapshot::new(kind);
        let run_id = snapshot.run_id.clone();
        let entry = TaskEntry::new(snapshot, None);
        tasks.insert(kind.to_string(), Arc::clone(&entry));

        tracing::info!("Started task '{}' (run {})", kind, run_id);
        Ok(TaskHandle {
            kind: kind.to_string(),
            run_id,
            entry,
        })
    }

    pub fn get(&self, kind: &str) -> Option<TaskSnapshot> {
        let entry = self.tasks.read().get(kind).cloned()?;
        let snapshot = entry.state.lock().clone();
        Some(snapshot)
    }

    pub fn list(&self) -> Vec<TaskSnapshot> {
        let entries: Vec<Arc<TaskEntry>> = self.tasks.read().values().cloned().collect();
        let mut snapshots: Vec<TaskSnapshot> = entries.iter().map(|e| e.state.lock().clone()).collect();
        snapshots.sort_by(|a, b| a.kind.cmp(&b.kind));
        snapshots
    }

    /// Apply a delta. Returns false when the task is already terminal.
    pub fn update(&self, handle: &TaskHandle, delta: TaskDelta) -> bool {
        let mut state = handle.entry.state.lock();
        if state.status.is_terminal() {
            tracing::debug!("Ignoring update to finished task '{}'", handle.kind);
            return false;
        }

        if let Some(total) = delta.total {
            state.total = Some(total);
        }
        state.processed += delta.processed;
        if let Some(total) = state.total {
            state.processed = state.processed.min(total);
        }
        state.failures.extend(delta.failures);
        if delta.message.is_some() {
            state.message = delta.message;
        }
        if delta.result.is_some() {
            state.result = delta.result;
        }
        state.version += 1;
        state.updated_at = Utc::now();
        true
    }

    /// Move the task to a terminal state and freeze its result
    pub async fn finish(&self, handle: &TaskHandle, outcome: TaskOutcome) -> TaskSnapshot {
        let completed = matches!(outcome, TaskOutcome::Completed(_));
        let snapshot = {
            let mut state = handle.entry.state.lock();
            if state.status.is_terminal() {
                return state.clone();
            }

            match outcome {
                TaskOutcome::Completed(result) => {
                    let all_failed = state.processed == 0 && !state.failures.is_empty();
                    if all_failed {
                        state.status = TaskStatus::Error;
                        state.error = Some(format!("all {} items failed", state.failures.len()));
                    } else {
                        state.status = TaskStatus::Done;
                    }
                    if result.is_some() {
                        state.result = result;
                    }
                }
                TaskOutcome::Failed(error) => {
                    state.status = TaskStatus::Error;
                    state.error = Some(error);
                }
                TaskOutcome::Cancelled(result) => {
                    state.status = TaskStatus::Cancelled;
                    if result.is_some() {
                        state.result = result;
                    }
                }
            }

            let now = Utc::now();
            state.message = Some(state.summary());
            state.version += 1;
            state.updated_at = now;
            state.finished_at = Some(now);
            state.clone()
        };

        // Interrupted work stays resumable
        if completed {
            *handle.entry.resume.lock() = None;
        }

        tracing::info!(
            "Task '{}' finished with status {:?}: {}",
            snapshot.kind,
            snapshot.status,
            snapshot.summary()
        );
        if let Err(e) = self.persist().await {
            tracing::warn!("Failed to persist task journal: {}", e);
        }
        snapshot
    }

    /// Request cooperative cancellation. Returns true if a running task was signalled.
    pub fn cancel(&self, kind: &str) -> bool {
        let Some(entry) = self.tasks.read().get(kind).cloned() else {
            return false;
        };
        if entry.state.lock().status != TaskStatus::Running {
            return false;
        }
        entry.cancel.cancel();
        tracing::info!("Cancellation requested for task '{}'", kind);
        true
    }

    /// Drop every entry that is not running
    pub async fn clear_finished(&self) {
        self.tasks
            .write()
            .retain(|_, entry| entry.state.lock().status == TaskStatus::Running);
        if let Err(e) = self.persist().await {
            tracing::warn!("Failed to persist task journal: {}", e);
        }
    }

    pub fn set_resume_point(&self, handle: &TaskHandle, point: Option<ResumePoint>) {
        *handle.entry.resume.lock() = point;
    }

    pub fn resume_point(&self, kind: &str) -> Option<ResumePoint> {
        let entry = self.tasks.read().get(kind).cloned()?;
        let point = entry.resume.lock().clone();
        point
    }

    /// Write every task and resume point to the journal, if one is attached
    pub async fn persist(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };

        journal.save_with(|| self.journal_file()).await
    }

    fn journal_file(&self) -> JournalFile {
        let entries: Vec<Arc<TaskEntry>> = self.tasks.read().values().cloned().collect();
        let mut file = JournalFile::default();
        for entry in entries {
            let snapshot = entry.state.lock().clone();
            if let Some(point) = entry.resume.lock().clone() {
                file.resume.insert(snapshot.kind.clone(), point);
            }
            file.tasks.push(snapshot);
        }
        file.tasks.sort_by(|a, b| a.kind.cmp(&b.kind));
        file
    }
}
