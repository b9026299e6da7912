//! The operations the surrounding application calls: authorization,
//! sign-out and the task lifecycle

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::auth::{load_application_secret, GoogleOAuthClient, OAuthBackend};
use crate::client::{GmailConnector, MailboxConnector};
use crate::config::Config;
use crate::credential_store::{CredentialStore, FileCredentialStore};
use crate::drivers::mutations::{self, LabelRequest, MarkReadRequest, MutationPlan, SenderRequest};
use crate::drivers::scan::{self, ScanRequest};
use crate::drivers::senders::{self, SenderScanRequest};
use crate::drivers::DriverContext;
use crate::error::{CleanerError, Result};
use crate::executor::{BatchExecutor, BatchSettings};
use crate::rate_limiter::QuotaRateLimiter;
use crate::session::{AuthorizationStarted, AuthorizationStatus, SessionManager, SessionSettings};
use crate::state::TaskJournal;
use crate::tasks::{TaskHandle, TaskOutcome, TaskRegistry, TaskSnapshot};

/// A bulk operation and its parameters, e.g.
/// `{"kind": "delete", "senders": ["news@example.com"]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskRequest {
    Scan(ScanRequest),
    SenderScan(SenderScanRequest),
    Delete(SenderRequest),
    Archive(SenderRequest),
    MarkRead(MarkReadRequest),
    MarkImportant(SenderRequest),
    Label(LabelRequest),
}

impl TaskRequest {
    /// Registry key; one running task per kind
    pub fn kind(&self) -> &'static str {
        match self {
            TaskRequest::Scan(_) => scan::TASK_KIND,
            TaskRequest::SenderScan(_) => senders::TASK_KIND,
            TaskRequest::Delete(_) => mutations::DELETE_KIND,
            TaskRequest::Archive(_) => mutations::ARCHIVE_KIND,
            TaskRequest::MarkRead(_) => mutations::MARK_READ_KIND,
            TaskRequest::MarkImportant(_) => mutations::MARK_IMPORTANT_KIND,
            TaskRequest::Label(_) => mutations::LABEL_KIND,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TaskRequest::Scan(r) => r.validate(),
            TaskRequest::SenderScan(r) => r.validate(),
            TaskRequest::Delete(r) | TaskRequest::Archive(r) | TaskRequest::MarkImportant(r) => r.validate(),
            TaskRequest::MarkRead(r) => r.validate(),
            TaskRequest::Label(r) => r.validate(),
        }
    }

    fn mutation_plan(&self) -> Option<MutationPlan> {
        match self {
            TaskRequest::Scan(_) | TaskRequest::SenderScan(_) => None,
            TaskRequest::Delete(r) => Some(MutationPlan::trash(r)),
            TaskRequest::Archive(r) => Some(MutationPlan::archive(r)),
            TaskRequest::MarkRead(r) => Some(MutationPlan::mark_read(r)),
            TaskRequest::MarkImportant(r) => Some(MutationPlan::mark_important(r)),
            TaskRequest::Label(r) => Some(MutationPlan::label(r)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStarted {
    pub task_id: String,
    pub kind: String,
}

pub struct CleanerService {
    config: Config,
    session: Arc<SessionManager>,
    registry: Arc<TaskRegistry>,
    executor: Arc<BatchExecutor>,
}

impl CleanerService {
    pub fn new(config: Config, session: Arc<SessionManager>, registry: Arc<TaskRegistry>) -> Self {
        let limiter = QuotaRateLimiter::per_second(config.execution.quota_units_per_second);
        let executor = BatchExecutor::new(BatchSettings::from_config(&config.execution)).with_limiter(limiter);
        Self {
            config,
            session,
            registry,
            executor: Arc::new(executor),
        }
    }

    /// Wire the production collaborators: token file, OAuth client secret,
    /// Gmail connector and task journal
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.auth.data_dir).await?;

        let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(config.token_path()));
        let oauth: Option<Arc<dyn OAuthBackend>> = match load_application_secret(&config.credentials_path()).await? {
            Some(secret) => Some(Arc::new(GoogleOAuthClient::new(secret)?)),
            None => {
                info!(
                    "No OAuth client secret found at {}, sign-in is unavailable",
                    config.credentials_path().display()
                );
                None
            }
        };
        let connector: Arc<dyn MailboxConnector> =
            Arc::new(GmailConnector::new(config.execution.max_concurrent_batches)?);

        let session = Arc::new(SessionManager::new(
            store,
            oauth,
            connector,
            SessionSettings::from_config(&config.auth),
        ));
        let registry = Arc::new(TaskRegistry::with_journal(TaskJournal::new(config.journal_path())).await?);

        Ok(Self::new(config, session, registry))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub async fn authorization_status(&self) -> AuthorizationStatus {
        self.session.authorization_status().await
    }

    pub async fn begin_authorization(&self) -> Result<AuthorizationStarted> {
        self.session.begin_authorization().await
    }

    /// Sign out and drop finished task entries. Running tasks keep going
    /// against their existing client.
    pub async fn sign_out(&self) -> Result<()> {
        let signed_out = self.session.sign_out().await;
        self.registry.clear_finished().await;
        signed_out
    }

    /// Validate, obtain a session, register the task and run it in the
    /// background. Returns as soon as the task is registered.
    pub async fn start_task(&self, request: TaskRequest) -> Result<TaskStarted> {
        self.launch(request, None).await
    }

    /// Restart an interrupted or cancelled mutation over the messages it
    /// had not processed yet
    pub async fn resume_task(&self, kind: &str) -> Result<TaskStarted> {
        let point = self.registry.resume_point(kind).ok_or_else(|| {
            CleanerError::ValidationError(format!("Nothing to resume for '{}'", kind))
        })?;
        let request: TaskRequest = serde_json::from_value(point.request)?;
        if request.kind() != kind {
            return Err(CleanerError::StateError(format!(
                "Resume point for '{}' holds a '{}' request",
                kind,
                request.kind()
            )));
        }
        info!("Resuming '{}' with {} messages left", kind, point.remaining.len());
        self.launch(request, Some(point.remaining)).await
    }

    pub fn task_status(&self, kind: &str) -> Option<TaskSnapshot> {
        self.registry.get(kind)
    }

    pub fn list_tasks(&self) -> Vec<TaskSnapshot> {
        self.registry.list()
    }

    /// Advisory; takes effect at the next batch boundary
    pub fn cancel_task(&self, kind: &str) -> bool {
        self.registry.cancel(kind)
    }

    async fn launch(&self, request: TaskRequest, preset: Option<Vec<String>>) -> Result<TaskStarted> {
        request.validate()?;
        let session = self.session.get_session().await?;
        let request_json = serde_json::to_value(&request)?;
        let handle = self.registry.start(request.kind())?;

        let ctx = DriverContext::new(
            Arc::clone(session.client()),
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            &self.config.execution,
        );
        let started = TaskStarted {
            task_id: handle.run_id().to_string(),
            kind: handle.kind().to_string(),
        };

        let worker_ctx = ctx.clone();
        let worker_handle = handle.clone();
        let worker = tokio::spawn(async move {
            drive(&worker_ctx, &worker_handle, &request, request_json, preset).await
        });

        tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Task '{}' worker stopped abnormally: {}", handle.kind(), e);
                    TaskOutcome::Failed(format!("worker stopped abnormally: {}", e))
                }
            };
            ctx.registry.finish(&handle, outcome).await;
        });

        Ok(started)
    }
}

async fn drive(
    ctx: &DriverContext,
    handle: &TaskHandle,
    request: &TaskRequest,
    request_json: serde_json::Value,
    preset: Option<Vec<String>>,
) -> TaskOutcome {
    match request {
        TaskRequest::Scan(r) => scan::run(ctx, handle, r).await,
        TaskRequest::SenderScan(r) => senders::run(ctx, handle, r).await,
        _ => match request.mutation_plan() {
            Some(plan) => mutations::run(ctx, handle, &plan, request_json, preset).await,
            None => TaskOutcome::Failed(format!("'{}' is not a mutation", request.kind())),
        },
    }
}
