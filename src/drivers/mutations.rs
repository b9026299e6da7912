//! Label mutations over listed messages: trash, archive, mark read,
//! mark important, apply or remove a label

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{dedupe_ids, DriverContext};
use crate::client::MailboxClient;
use crate::error::{CleanerError, Result};
use crate::executor::{BatchOperation, ItemResult};
use crate::models::{validate_sender, QueryFilters};
use crate::rate_limiter::QuotaCost;
use crate::tasks::{ItemFailure, ResumePoint, TaskDelta, TaskHandle, TaskOutcome};

pub const DELETE_KIND: &str = "delete";
pub const ARCHIVE_KIND: &str = "archive";
pub const MARK_READ_KIND: &str = "mark-read";
pub const MARK_IMPORTANT_KIND: &str = "mark-important";
pub const LABEL_KIND: &str = "label";

pub const LABEL_TRASH: &str = "TRASH";
pub const LABEL_INBOX: &str = "INBOX";
pub const LABEL_UNREAD: &str = "UNREAD";
pub const LABEL_IMPORTANT: &str = "IMPORTANT";

fn validate_senders(senders: &[String]) -> Result<()> {
    if senders.is_empty() {
        return Err(CleanerError::ValidationError("No senders specified".to_string()));
    }
    senders.iter().try_for_each(|s| validate_sender(s))
}

/// Targets messages from a list of senders (addresses or domains)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRequest {
    pub senders: Vec<String>,
    #[serde(default)]
    pub filters: QueryFilters,
}

impl SenderRequest {
    pub fn validate(&self) -> Result<()> {
        validate_senders(&self.senders)?;
        self.filters.validate()
    }
}

fn default_mark_read_count() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadRequest {
    #[serde(default = "default_mark_read_count")]
    pub count: usize,
    #[serde(default)]
    pub filters: QueryFilters,
}

impl MarkReadRequest {
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(CleanerError::ValidationError(
                "Count must be greater than 0".to_string(),
            ));
        }
        self.filters.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRequest {
    pub label_id: String,
    /// Narrows removal to messages carrying the label
    #[serde(default)]
    pub label_name: Option<String>,
    #[serde(default)]
    pub remove: bool,
    pub senders: Vec<String>,
    #[serde(default)]
    pub filters: QueryFilters,
}

impl LabelRequest {
    pub fn validate(&self) -> Result<()> {
        if self.label_id.trim().is_empty() {
            return Err(CleanerError::ValidationError("No label specified".to_string()));
        }
        validate_senders(&self.senders)?;
        self.filters.validate()
    }
}

/// What to list and which labels to change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationPlan {
    pub kind: &'static str,
    pub base_query: String,
    pub senders: Vec<String>,
    pub filters: QueryFilters,
    pub limit: Option<usize>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl MutationPlan {
    fn for_senders(kind: &'static str, request: &SenderRequest, base_query: &str) -> Self {
        Self {
            kind,
            base_query: base_query.to_string(),
            senders: request.senders.iter().map(|s| s.trim().to_string()).collect(),
            filters: request.filters.clone(),
            limit: None,
            add_labels: Vec::new(),
            remove_labels: Vec::new(),
        }
    }

    pub fn trash(request: &SenderRequest) -> Self {
        let mut plan = Self::for_senders(DELETE_KIND, request, "");
        plan.add_labels.push(LABEL_TRASH.to_string());
        plan
    }

    pub fn archive(request: &SenderRequest) -> Self {
        let mut plan = Self::for_senders(ARCHIVE_KIND, request, "in:inbox");
        plan.remove_labels.push(LABEL_INBOX.to_string());
        plan
    }

    pub fn mark_important(request: &SenderRequest) -> Self {
        let mut plan = Self::for_senders(MARK_IMPORTANT_KIND, request, "");
        plan.add_labels.push(LABEL_IMPORTANT.to_string());
        plan
    }

    pub fn mark_read(request: &MarkReadRequest) -> Self {
        Self {
            kind: MARK_READ_KIND,
            base_query: "is:unread".to_string(),
            senders: Vec::new(),
            filters: request.filters.clone(),
            limit: Some(request.count),
            add_labels: Vec::new(),
            remove_labels: vec![LABEL_UNREAD.to_string()],
        }
    }

    pub fn label(request: &LabelRequest) -> Self {
        let sender_request = SenderRequest {
            senders: request.senders.clone(),
            filters: request.filters.clone(),
        };
        let label_id = request.label_id.trim().to_string();
        if request.remove {
            let base = match &request.label_name {
                Some(name) if !name.trim().is_empty() => format!("label:{}", quote_label(name.trim())),
                _ => String::new(),
            };
            let mut plan = Self::for_senders(LABEL_KIND, &sender_request, &base);
            plan.remove_labels.push(label_id);
            plan
        } else {
            let mut plan = Self::for_senders(LABEL_KIND, &sender_request, "");
            plan.add_labels.push(label_id);
            plan
        }
    }

    /// One query per sender, or a single query when the plan has no senders.
    /// The sender is returned alongside so listing failures can be attributed.
    pub fn queries(&self) -> Vec<(Option<String>, String)> {
        if self.senders.is_empty() {
            return vec![(None, self.filters.apply(&self.base_query))];
        }
        self.senders
            .iter()
            .map(|sender| {
                let base = format!("from:{} {}", sender, self.base_query);
                (Some(sender.clone()), self.filters.apply(&base))
            })
            .collect()
    }
}

fn quote_label(name: &str) -> String {
    if name.contains(char::is_whitespace) {
        format!("\"{}\"", name.replace('"', ""))
    } else {
        name.to_string()
    }
}

/// `batchModify` as a batch operation. The call either applies to every id
/// or fails for all of them.
pub struct MessageMutation {
    client: Arc<dyn MailboxClient>,
    name: String,
    add_labels: Vec<String>,
    remove_labels: Vec<String>,
}

impl MessageMutation {
    pub fn new(client: Arc<dyn MailboxClient>, plan: &MutationPlan) -> Self {
        Self {
            client,
            name: plan.kind.to_string(),
            add_labels: plan.add_labels.clone(),
            remove_labels: plan.remove_labels.clone(),
        }
    }
}

#[async_trait]
impl BatchOperation for MessageMutation {
    type Output = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn quota_cost(&self, _batch_len: usize) -> QuotaCost {
        QuotaCost::Modify
    }

    async fn apply(&self, ids: &[String]) -> Vec<ItemResult<()>> {
        match self
            .client
            .batch_modify(ids, &self.add_labels, &self.remove_labels)
            .await
        {
            Ok(()) => ids.iter().map(|id| ItemResult::success(id.clone(), ())).collect(),
            Err(e) => ItemResult::all_failed(ids, &e),
        }
    }
}

fn mutation_result(affected: usize, failed: usize, not_processed: usize) -> serde_json::Value {
    serde_json::json!({
        "affected": affected,
        "failed": failed,
        "not_processed": not_processed,
    })
}

/// List the plan's candidates, deduplicated. A sender whose listing fails
/// is recorded as a failure; a plan without senders fails outright.
async fn list_candidates(
    ctx: &DriverContext,
    handle: &TaskHandle,
    plan: &MutationPlan,
) -> Result<(Vec<String>, Vec<ItemFailure>)> {
    let mut ids = Vec::new();
    let mut failures = Vec::new();

    for (sender, query) in plan.queries() {
        if handle.is_cancelled() {
            break;
        }
        let limit = plan.limit.map(|limit| limit.saturating_sub(ids.len()));
        if limit == Some(0) {
            break;
        }

        match ctx.collect_ids(&query, limit, handle.cancellation()).await {
            Ok(found) => {
                ctx.registry.update(
                    handle,
                    TaskDelta::new().message(format!(
                        "Found {} emails{}",
                        found.len(),
                        sender.as_deref().map(|s| format!(" from {}", s)).unwrap_or_default()
                    )),
                );
                ids.extend(found);
            }
            Err(e) => match sender {
                Some(sender) => {
                    warn!("Listing messages from {} failed: {}", sender, e);
                    failures.push(ItemFailure::from_error(sender, &e));
                }
                None => return Err(e),
            },
        }
    }

    Ok((dedupe_ids(ids), failures))
}

/// Run a mutation. `preset` replaces listing with a known id list, used
/// when resuming an interrupted run. `request` is recorded in the resume
/// point so the run can be restarted later.
pub async fn run(
    ctx: &DriverContext,
    handle: &TaskHandle,
    plan: &MutationPlan,
    request: serde_json::Value,
    preset: Option<Vec<String>>,
) -> TaskOutcome {
    let ids = match preset {
        Some(ids) => {
            info!("Resuming '{}' with {} remaining messages", plan.kind, ids.len());
            dedupe_ids(ids)
        }
        None => {
            ctx.registry.update(handle, TaskDelta::new().message("Finding emails..."));
            match list_candidates(ctx, handle, plan).await {
                Ok((ids, failures)) => {
                    if !failures.is_empty() {
                        ctx.registry.update(handle, TaskDelta::new().failures(failures));
                    }
                    ids
                }
                Err(e) => return TaskOutcome::Failed(e.to_string()),
            }
        }
    };

    if handle.is_cancelled() {
        return TaskOutcome::Cancelled(None);
    }
    ctx.registry.update(
        handle,
        TaskDelta::new()
            .total(ids.len())
            .message(format!("Processing {} emails...", ids.len())),
    );
    if ids.is_empty() {
        return TaskOutcome::Completed(Some(mutation_result(0, 0, 0)));
    }

    ctx.registry
        .set_resume_point(handle, Some(ResumePoint::new(request.clone(), ids.clone())));
    if let Err(e) = ctx.registry.persist().await {
        warn!("Failed to persist task journal: {}", e);
    }

    let op = MessageMutation::new(Arc::clone(&ctx.client), plan);
    let mut unsettled: HashSet<String> = ids.iter().cloned().collect();
    let (checkpoint_tx, mut checkpoint_rx) = mpsc::unbounded_channel::<()>();

    let outcome = {
        let registry = &ctx.registry;
        let interval = ctx.checkpoint_interval;
        let order = &ids;
        let request = &request;
        let unsettled = &mut unsettled;
        let mut since_checkpoint = 0usize;

        let execute = ctx.executor.run(ids.clone(), &op, handle.cancellation(), move |report| {
            for (id, _) in &report.successes {
                unsettled.remove(id);
            }
            for failure in &report.failures {
                unsettled.remove(&failure.id);
            }
            since_checkpoint += report.successes.len() + report.failures.len();

            registry.update(
                handle,
                TaskDelta::new()
                    .processed(report.successes.len())
                    .failures(report.failures),
            );

            if since_checkpoint >= interval {
                since_checkpoint = 0;
                let remaining = order.iter().filter(|id| unsettled.contains(*id)).cloned().collect();
                registry.set_resume_point(handle, Some(ResumePoint::new(request.clone(), remaining)));
                let _ = checkpoint_tx.send(());
            }
        });

        let checkpoints = async {
            while checkpoint_rx.recv().await.is_some() {
                if let Err(e) = registry.persist().await {
                    warn!("Failed to persist checkpoint: {}", e);
                }
            }
        };

        let (outcome, ()) = tokio::join!(execute, checkpoints);
        outcome
    };

    let result = mutation_result(outcome.succeeded, outcome.failed, outcome.remaining.len());
    if outcome.cancelled {
        let remaining: Vec<String> = ids.into_iter().filter(|id| unsettled.contains(id)).collect();
        info!("'{}' cancelled with {} messages left", plan.kind, remaining.len());
        ctx.registry
            .set_resume_point(handle, Some(ResumePoint::new(request, remaining)));
        TaskOutcome::Cancelled(Some(result))
    } else {
        TaskOutcome::Completed(Some(result))
    }
}
