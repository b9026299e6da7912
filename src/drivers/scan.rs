//! Newsletter scan: group messages carrying an unsubscribe header by sender domain

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use super::DriverContext;
use crate::error::{CleanerError, Result};
use crate::models::{MessageMetadata, QueryFilters};
use crate::tasks::{TaskDelta, TaskHandle, TaskOutcome};

pub const TASK_KIND: &str = "scan";
const MAX_SUBJECTS: usize = 3;

static ANGLE_BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^>]+)>").unwrap());

fn default_limit() -> usize {
    500
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub filters: QueryFilters,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            filters: QueryFilters::default(),
        }
    }
}

impl ScanRequest {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(CleanerError::ValidationError(
                "Limit must be greater than 0".to_string(),
            ));
        }
        self.filters.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnsubscribeMethod {
    /// RFC 8058 one-click POST
    OneClick,
    Link,
    Mailto,
}

/// Pick the unsubscribe target from the headers: the first https link,
/// otherwise the first mailto.
pub fn parse_unsubscribe(header: &str, post_header: Option<&str>) -> Option<(String, UnsubscribeMethod)> {
    let mut candidates: Vec<&str> = ANGLE_BRACKETED
        .captures_iter(header)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
        .collect();
    if candidates.is_empty() {
        candidates = header.split(',').map(str::trim).collect();
    }

    let one_click = post_header.map(|p| !p.trim().is_empty()).unwrap_or(false);

    if let Some(link) = candidates.iter().find(|c| c.starts_with("https://")) {
        let method = if one_click {
            UnsubscribeMethod::OneClick
        } else {
            UnsubscribeMethod::Link
        };
        return Some((link.to_string(), method));
    }
    candidates
        .iter()
        .find(|c| c.to_lowercase().starts_with("mailto:"))
        .map(|m| (m.to_string(), UnsubscribeMethod::Mailto))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub domain: String,
    pub sender: String,
    pub email: String,
    pub link: String,
    pub method: UnsubscribeMethod,
    pub count: usize,
    pub subjects: Vec<String>,
    pub first_date: Option<DateTime<Utc>>,
    pub last_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct SubscriptionAggregator {
    by_domain: HashMap<String, Subscription>,
}

impl SubscriptionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the message has no usable unsubscribe header
    pub fn add(&mut self, message: &MessageMetadata) -> bool {
        let Some(header) = &message.list_unsubscribe else {
            return false;
        };
        let Some((link, method)) = parse_unsubscribe(header, message.list_unsubscribe_post.as_deref()) else {
            return false;
        };

        let domain = if message.sender_domain.is_empty() {
            message.sender_email.clone()
        } else {
            message.sender_domain.clone()
        };

        let entry = self
            .by_domain
            .entry(domain.clone())
            .or_insert_with(|| Subscription {
                domain,
                sender: String::new(),
                email: String::new(),
                link: String::new(),
                method,
                count: 0,
                subjects: Vec::new(),
                first_date: None,
                last_date: None,
            });

        entry.count += 1;
        entry.link = link;
        entry.method = method;
        entry.sender = message.sender_name.clone();
        entry.email = message.sender_email.clone();
        if entry.subjects.len() < MAX_SUBJECTS {
            entry.subjects.push(message.subject.clone());
        }
        if let Some(date) = message.date {
            entry.first_date = Some(entry.first_date.map_or(date, |d| d.min(date)));
            entry.last_date = Some(entry.last_date.map_or(date, |d| d.max(date)));
        }
        true
    }

    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }

    /// Most frequent first
    pub fn into_sorted(self) -> Vec<Subscription> {
        let mut subscriptions: Vec<Subscription> = self.by_domain.into_values().collect();
        subscriptions.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.domain.cmp(&b.domain)));
        subscriptions
    }
}

fn scan_result(aggregator: SubscriptionAggregator, scanned: usize) -> serde_json::Value {
    serde_json::json!({
        "scanned": scanned,
        "subscriptions": aggregator.into_sorted(),
    })
}

pub async fn run(ctx: &DriverContext, handle: &TaskHandle, request: &ScanRequest) -> TaskOutcome {
    let query = request.filters.apply("");
    ctx.registry
        .update(handle, TaskDelta::new().message("Fetching email list..."));

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
        return TaskOutcome::Completed(Some(scan_result(SubscriptionAggregator::new(), 0)));
    }

    ctx.registry.update(
        handle,
        TaskDelta::new()
            .total(ids.len())
            .message(format!("Found {} emails. Scanning...", ids.len())),
    );

    let (messages, outcome) = ctx.fetch_metadata(handle, ids).await;
    let mut aggregator = SubscriptionAggregator::new();
    for message in &messages {
        aggregator.add(message);
    }
    info!(
        "Scan found {} subscriptions in {} messages",
        aggregator.len(),
        messages.len()
    );

    let result = scan_result(aggregator, messages.len());
    if outcome.cancelled {
        TaskOutcome::Cancelled(Some(result))
    } else {
        TaskOutcome::Completed(Some(result))
    }
}
