//! Bulk operations built on the session, registry and batch executor.
//!
//! Every driver is the same pipeline: list candidate ids, optionally fetch
//! their metadata, then batch-apply a change, reporting into its task.

pub mod mutations;
pub mod scan;
pub mod senders;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::MailboxClient;
use crate::config::ExecutionConfig;
use crate::error::Result;
use crate::executor::{BatchExecutor, BatchOperation, ItemResult, RetryPolicy, RunOutcome};
use crate::models::MessageMetadata;
use crate::rate_limiter::QuotaCost;
use crate::tasks::{TaskDelta, TaskHandle, TaskRegistry};

/// Largest page the list endpoint accepts
pub const MAX_PAGE_SIZE: u32 = 500;

pub type IdPageStream = Pin<Box<dyn Stream<Item = Result<Vec<String>>> + Send>>;

/// Everything a driver needs to run one task
#[derive(Clone)]
pub struct DriverContext {
    pub client: Arc<dyn MailboxClient>,
    pub registry: Arc<TaskRegistry>,
    pub executor: Arc<BatchExecutor>,
    pub list_retry: RetryPolicy,
    pub page_size: u32,
    pub checkpoint_interval: usize,
}

impl DriverContext {
    pub fn new(
        client: Arc<dyn MailboxClient>,
        registry: Arc<TaskRegistry>,
        executor: Arc<BatchExecutor>,
        config: &ExecutionConfig,
    ) -> Self {
        Self {
            client,
            registry,
            list_retry: executor.settings().retry,
            executor,
            page_size: config.page_size.clamp(1, MAX_PAGE_SIZE),
            checkpoint_interval: config.checkpoint_interval.max(1),
        }
    }

    /// Pages of ids matching `query`, at most `limit` in total.
    /// Each page request is retried on transient errors; the stream ends
    /// after the first error it yields.
    pub fn list_pages(&self, query: String, limit: Option<usize>) -> IdPageStream {
        let client = Arc::clone(&self.client);
        let retry = self.list_retry;
        let page_size = self.page_size;

        Box::pin(stream! {
            let mut page_token: Option<String> = None;
            let mut listed = 0usize;

            loop {
                let max_results = match limit {
                    Some(limit) => (limit - listed).min(page_size as usize) as u32,
                    None => page_size,
                };
                if max_results == 0 {
                    break;
                }

                let token = page_token.clone();
                let page = retry
                    .run("list messages", || {
                        client.list_message_ids_page(&query, token.as_deref(), max_results)
                    })
                    .await;

                match page {
                    Ok(page) => {
                        let mut ids = page.ids;
                        if let Some(limit) = limit {
                            ids.truncate(limit - listed);
                        }
                        listed += ids.len();
                        debug!("Listed {} ids for '{}' ({} so far)", ids.len(), query, listed);

                        page_token = page.next_page_token;
                        let exhausted = ids.is_empty() || page_token.is_none();
                        if !ids.is_empty() {
                            yield Ok(ids);
                        }
                        if exhausted {
                            break;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }

    /// Collect ids for `query`. Stops early, keeping what was listed, when
    /// `cancel` fires between pages.
    pub async fn collect_ids(
        &self,
        query: &str,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut pages = self.list_pages(query.to_string(), limit);
        let mut ids = Vec::new();
        while let Some(page) = pages.next().await {
            ids.extend(page?);
            if cancel.is_cancelled() {
                break;
            }
        }
        Ok(ids)
    }

    /// Fetch metadata for `ids` through the executor, reporting each batch
    /// into the task
    pub async fn fetch_metadata(
        &self,
        handle: &TaskHandle,
        ids: Vec<String>,
    ) -> (Vec<MessageMetadata>, RunOutcome) {
        let op = FetchMetadata {
            client: Arc::clone(&self.client),
        };
        let mut fetched = Vec::with_capacity(ids.len());
        let registry = Arc::clone(&self.registry);

        let outcome = self
            .executor
            .run(ids, &op, handle.cancellation(), |report| {
                let succeeded = report.successes.len();
                fetched.extend(report.successes.into_iter().map(|(_, metadata)| metadata));
                registry.update(
                    handle,
                    TaskDelta::new()
                        .processed(succeeded)
                        .failures(report.failures)
                        .message(format!("Fetched {} messages", fetched.len())),
                );
            })
            .await;

        info!(
            "Fetched metadata for {} of {} messages",
            outcome.succeeded, outcome.total
        );
        (fetched, outcome)
    }
}

/// Metadata fetch as a batch operation
pub struct FetchMetadata {
    client: Arc<dyn MailboxClient>,
}

#[async_trait]
impl BatchOperation for FetchMetadata {
    type Output = MessageMetadata;

    fn name(&self) -> &str {
        "fetch metadata"
    }

    fn quota_cost(&self, batch_len: usize) -> QuotaCost {
        QuotaCost::gets(batch_len)
    }

    async fn apply(&self, ids: &[String]) -> Vec<ItemResult<MessageMetadata>> {
        self.client
            .get_messages(ids)
            .await
            .into_iter()
            .map(|(id, result)| match result {
                Ok(metadata) => ItemResult::success(id, metadata),
                Err(e) => ItemResult::from_error(id, &e),
            })
            .collect()
    }
}

/// Keep the first occurrence of every id
pub fn dedupe_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
