//! Gmail API access behind a narrow, capability-limited trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use google_gmail1::{
    api::{BatchModifyMessagesRequest, Message},
    hyper_rustls, hyper_util, Gmail,
};
use std::sync::Arc;
use tracing::debug;

use crate::credential_store::Credential;
use crate::error::{CleanerError, Result};
use crate::models::{MessageMetadata, METADATA_HEADERS};

const MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// One page of a message listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// What the task engine needs from the mailbox: paginated listing,
/// batched metadata fetch and batched label mutation.
///
/// `batch_modify` must be idempotent: re-applying a change to messages
/// that already carry it is not an error.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    async fn list_message_ids_page(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<MessagePage>;

    /// Fetch metadata for each id. Every id gets its own outcome.
    async fn get_messages(&self, ids: &[String]) -> Vec<(String, Result<MessageMetadata>)>;

    async fn batch_modify(
        &self,
        ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()>;

    /// Address of the signed-in account
    async fn profile_email(&self) -> Result<String>;
}

/// Builds a client bound to one credential
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self, credential: &Credential) -> Result<Arc<dyn MailboxClient>>;
}

/// Production client over the generated Gmail hub.
///
/// The hub is handed a fixed access token, so a new client is built
/// whenever the session refreshes its credential.
pub struct GmailMailboxClient {
    hub: GmailHub,
    fetch_concurrency: usize,
}

impl GmailMailboxClient {
    pub fn new(hub: GmailHub, fetch_concurrency: usize) -> Self {
        Self {
            hub,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    async fn get_one(&self, id: &str) -> Result<MessageMetadata> {
        let mut call = self.hub.users().messages_get("me", id).format("metadata");
        for header in METADATA_HEADERS {
            call = call.add_metadata_headers(header);
        }
        let (_, msg) = call.add_scope(MODIFY_SCOPE).doit().await?;
        parse_message_metadata(msg)
    }
}

#[async_trait]
impl MailboxClient for GmailMailboxClient {
    async fn list_message_ids_page(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<MessagePage> {
        let mut call = self
            .hub
            .users()
            .messages_list("me")
            .max_results(max_results)
            .include_spam_trash(false);

        if !query.is_empty() {
            call = call.q(query);
        }
        if let Some(token) = page_token {
            call = call.page_token(token);
        }

        let (_, response) = call.add_scope(MODIFY_SCOPE).doit().await?;

        let ids: Vec<String> = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        debug!("Listed {} message ids for query '{}'", ids.len(), query);

        Ok(MessagePage {
            ids,
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn get_messages(&self, ids: &[String]) -> Vec<(String, Result<MessageMetadata>)> {
        stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let result = self.get_one(&id).await;
                (id, result)
            })
            .buffer_unordered(self.fetch_concurrency)
            .collect()
            .await
    }

    async fn batch_modify(
        &self,
        ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let request = BatchModifyMessagesRequest {
            ids: Some(ids.to_vec()),
            add_label_ids: (!add_label_ids.is_empty()).then(|| add_label_ids.to_vec()),
            remove_label_ids: (!remove_label_ids.is_empty()).then(|| remove_label_ids.to_vec()),
        };

        self.hub
            .users()
            .messages_batch_modify(request, "me")
            .add_scope(MODIFY_SCOPE)
            .doit()
            .await?;
        Ok(())
    }

    async fn profile_email(&self) -> Result<String> {
        let (_, profile) = self.hub.users().get_profile("me").doit().await?;
        profile
            .email_address
            .ok_or_else(|| CleanerError::ApiError("Profile has no email address".to_string()))
    }
}

/// Builds Gmail hubs over a shared TLS connector
#[derive(Clone)]
pub struct GmailConnector {
    https: hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    fetch_concurrency: usize,
}

impl GmailConnector {
    pub fn new(fetch_concurrency: usize) -> Result<Self> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| CleanerError::NetworkError(format!("Failed to load TLS roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            https,
            fetch_concurrency,
        })
    }
}

#[async_trait]
impl MailboxConnector for GmailConnector {
    async fn connect(&self, credential: &Credential) -> Result<Arc<dyn MailboxClient>> {
        // Use HTTP/1 for compatibility (HTTP/2 is default but HTTP/1 works better with google-gmail1)
        let http = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(self.https.clone());
        let hub = Gmail::new(http, credential.access_token.clone());
        Ok(Arc::new(GmailMailboxClient::new(hub, self.fetch_concurrency)))
    }
}

/// Parse Gmail API Message into our MessageMetadata structure
fn parse_message_metadata(msg: Message) -> Result<MessageMetadata> {
    let id = msg
        .id
        .ok_or_else(|| CleanerError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let headers = msg
        .payload
        .as_ref()
        .and_then(|p| p.headers.as_ref())
        .ok_or_else(|| CleanerError::InvalidMessageFormat(format!("Message {} has no headers", id)))?;

    let mut sender_email = String::new();
    let mut sender_name = String::new();
    let mut subject = String::new();
    let mut date = None;
    let mut list_unsubscribe = None;
    let mut list_unsubscribe_post = None;

    for header in headers {
        if let (Some(name), Some(value)) = (&header.name, &header.value) {
            match name.to_lowercase().as_str() {
                "from" => {
                    if let Some((name_part, email_part)) = parse_email_header(value) {
                        sender_name = name_part;
                        sender_email = email_part;
                    } else {
                        sender_email = value.trim().to_string();
                    }
                }
                "subject" => subject = value.clone(),
                "date" => date = parse_date(value),
                "list-unsubscribe" => list_unsubscribe = Some(value.clone()),
                "list-unsubscribe-post" => list_unsubscribe_post = Some(value.clone()),
                _ => {}
            }
        }
    }

    let sender_email = sender_email.to_lowercase();
    let sender_domain = sender_email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_string())
        .unwrap_or_else(|| sender_email.clone());

    Ok(MessageMetadata {
        id,
        sender_email,
        sender_name,
        sender_domain,
        subject,
        date,
        size_estimate: msg.size_estimate.map(|s| s.max(0) as u64).unwrap_or(0),
        list_unsubscribe,
        list_unsubscribe_post,
        labels: msg.label_ids.unwrap_or_default(),
    })
}

/// Parse email header in "Name <email@example.com>" format
fn parse_email_header(header: &str) -> Option<(String, String)> {
    let start = header.find('<')?;
    let end = header[start..].find('>')? + start;
    let name = header[..start].trim().trim_matches('"').to_string();
    let email = header[start + 1..end].trim().to_string();
    Some((name, email))
}

/// Parse RFC 2822 date string, falling back to RFC 3339
fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    // Some senders append a zone comment such as "(UTC)"
    let trimmed = date_str.split(" (").next().unwrap_or(date_str).trim();
    DateTime::parse_from_rfc2822(trimmed)
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePart, MessagePartHeader};

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn message(headers: Vec<MessagePartHeader>) -> Message {
        Message {
            id: Some("m1".to_string()),
            size_estimate: Some(2048),
            label_ids: Some(vec!["INBOX".to_string(), "UNREAD".to_string()]),
            payload: Some(MessagePart {
                headers: Some(headers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_email_header() {
        let result = parse_email_header("John Doe <john@example.com>");
        assert_eq!(result, Some(("John Doe".to_string(), "john@example.com".to_string())));

        let result = parse_email_header("\"Jane Smith\" <jane@example.com>");
        assert_eq!(result, Some(("Jane Smith".to_string(), "jane@example.com".to_string())));

        assert_eq!(parse_email_header("plain@example.com"), None);
        assert_eq!(parse_email_header("broken <no-close"), None);
    }

    #[test]
    fn test_parse_date() {
        assert!(parse_date("Mon, 24 Nov 2025 10:30:00 +0000").is_some());
        assert!(parse_date("Mon, 24 Nov 2025 10:30:00 +0000 (UTC)").is_some());
        assert!(parse_date("2025-11-24T10:30:00Z").is_some());
        assert!(parse_date("yesterday").is_none());
    }

    #[test]
    fn test_parse_message_metadata() {
        let msg = message(vec![
            header("From", "Deals <Offers@Shop.Example.com>"),
            header("Subject", "50% off"),
            header("Date", "Tue, 02 Jan 2024 08:00:00 +0000"),
            header("List-Unsubscribe", "<https://shop.example.com/u?x=1>"),
            header("List-Unsubscribe-Post", "List-Unsubscribe=One-Click"),
        ]);

        let metadata = parse_message_metadata(msg).unwrap();
        assert_eq!(metadata.id, "m1");
        assert_eq!(metadata.sender_name, "Deals");
        assert_eq!(metadata.sender_email, "offers@shop.example.com");
        assert_eq!(metadata.sender_domain, "shop.example.com");
        assert_eq!(metadata.subject, "50% off");
        assert_eq!(metadata.size_estimate, 2048);
        assert!(metadata.date.is_some());
        assert!(metadata.list_unsubscribe_post.is_some());
        assert_eq!(metadata.labels.len(), 2);
    }

    #[test]
    fn test_parse_message_without_headers() {
        let msg = Message {
            id: Some("m2".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            parse_message_metadata(msg),
            Err(CleanerError::InvalidMessageFormat(_))
        ));
    }
}
