//! Sender scan: group messages by sender address to pick bulk-delete targets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::DriverContext;
use crate::error::{CleanerError, Result};
use crate::models::{MessageMetadata, QueryFilters};
use crate::tasks::{TaskDelta, TaskHandle, TaskOutcome};

pub const TASK_KIND: &str = "sender-scan";
const MAX_SUBJECTS: usize = 3;

fn default_limit() -> usize {
    1000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderScanRequest {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub filters: QueryFilters,
}

impl Default for SenderScanRequest {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            filters: QueryFilters::default(),
        }
    }
}

impl SenderScanRequest {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(CleanerError::ValidationError(
                "Limit must be greater than 0".to_string(),
            ));
        }
        self.filters.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderSummary {
    pub email: String,
    pub name: String,
    pub count: usize,
    pub total_size: u64,
    pub subjects: Vec<String>,
    pub first_date: Option<DateTime<Utc>>,
    pub last_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct SenderAggregator {
    by_sender: HashMap<String, SenderSummary>,
}

impl SenderAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message: &MessageMetadata) {
        if message.sender_email.is_empty() {
            return;
        }
        let email = message.sender_email.to_lowercase();
        let entry = self
            .by_sender
            .entry(email.clone())
            .or_insert_with(|| SenderSummary {
                email,
                name: String::new(),
                count: 0,
                total_size: 0,
                subjects: Vec::new(),
                first_date: None,
                last_date: None,
            });

        entry.count += 1;
        entry.total_size += message.size_estimate;
        if !message.sender_name.is_empty() {
            entry.name = message.sender_name.clone();
        }
        if entry.subjects.len() < MAX_SUBJECTS {
            entry.subjects.push(message.subject.clone());
        }
        if let Some(date) = message.date {
            entry.first_date = Some(entry.first_date.map_or(date, |d| d.min(date)));
            entry.last_date = Some(entry.last_date.map_or(date, |d| d.max(date)));
        }
    }

    pub fn len(&self) -> usize {
        self.by_sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sender.is_empty()
    }

    pub fn into_sorted(self) -> Vec<SenderSummary> {
        let mut senders: Vec<SenderSummary> = self.by_sender.into_values().collect();
        senders.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.email.cmp(&b.email)));
        senders
    }
}

fn sender_result(aggregator: SenderAggregator, scanned: usize) -> serde_json::Value {
    serde_json::json!({
        "scanned": scanned,
        "senders": aggregator.into_sorted(),
    })
}

pub async fn run(ctx: &DriverContext, handle: &TaskHandle, request: &SenderScanRequest) -> TaskOutcome {
    let query = request.filters.apply("");
    ctx.registry.update(handle, TaskDelta::new().message("Fetching emails..."));

    let ids = match ctx
        .collect_ids(&query, Some(request.limit), handle.cancellation())
        .await
    {
        Ok(ids) => ids,
        Err(e) => return TaskOutcome::Failed(e.to_string()),
    };
    if handle.is_cancelled() {
        return TaskOutcome::Cancelled(None);
    }
    if ids.is_empty() {
        ctx.registry
            .update(handle, TaskDelta::new().total(0).message("No emails found"));
        return TaskOutcome::Completed(Some(sender_result(SenderAggregator::new(), 0)));
    }

    ctx.registry.update(
        handle,
        TaskDelta::new()
            .total(ids.len())
            .message(format!("Scanning {} emails...", ids.len())),
    );

    let (messages, outcome) = ctx.fetch_metadata(handle, ids).await;
    let mut aggregator = SenderAggregator::new();
    for message in &messages {
        aggregator.add(message);
    }
    ctx.registry.update(
        handle,
        TaskDelta::new().message(format!("Found {} senders", aggregator.len())),
    );

    let result = sender_result(aggregator, messages.len());
    if outcome.cancelled {
        TaskOutcome::Cancelled(Some(result))
    } else {
        TaskOutcome::Completed(Some(result))
    }
}
