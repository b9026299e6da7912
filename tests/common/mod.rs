//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use gmail_cleaner::auth::OAuthBackend;
use gmail_cleaner::client::{MailboxClient, MailboxConnector, MessagePage};
use gmail_cleaner::config::Config;
use gmail_cleaner::credential_store::{Credential, CredentialStore};
use gmail_cleaner::error::{CleanerError, Result};
use gmail_cleaner::models::MessageMetadata;
use gmail_cleaner::service::CleanerService;
use gmail_cleaner::session::{SessionManager, SessionSettings};
use gmail_cleaner::tasks::{TaskRegistry, TaskSnapshot};
use mockall::mock;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const GOOD_CODE: &str = "good-code";

/// Credential expiring `expires_in_secs` from now
pub fn credential(expires_in_secs: i64) -> Credential {
    Credential {
        access_token: format!("access-{}", uuid::Uuid::new_v4().simple()),
        refresh_token: Some("refresh-token".to_string()),
        expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
        scopes: vec!["https://www.googleapis.com/auth/gmail.modify".to_string()],
    }
}

pub fn ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}{:03}", prefix, i)).collect()
}

pub fn create_test_message(id: &str, sender: &str, subject: &str) -> MessageMetadata {
    let domain = sender.split('@').nth(1).unwrap_or("example.com").to_string();
    MessageMetadata {
        id: id.to_string(),
        sender_email: sender.to_string(),
        sender_name: "Test Sender".to_string(),
        sender_domain: domain,
        subject: subject.to_string(),
        date: Some(Utc::now()),
        size_estimate: 2048,
        list_unsubscribe: None,
        list_unsubscribe_post: None,
        labels: vec!["INBOX".to_string()],
    }
}

pub fn create_newsletter_message(id: &str, sender: &str) -> MessageMetadata {
    let mut message = create_test_message(id, sender, "Weekly Newsletter");
    let domain = message.sender_domain.clone();
    message.list_unsubscribe = Some(format!("<https://{}/unsubscribe>, <mailto:leave@{}>", domain, domain));
    message
}

// ============================================================================
// Credential store
// ============================================================================

/// In-memory store that counts writes
#[derive(Default)]
pub struct MemoryStore {
    pub record: Mutex<Option<Credential>>,
    pub saves: AtomicUsize,
    pub clears: AtomicUsize,
}

impl MemoryStore {
    pub fn with(credential: Option<Credential>) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(credential),
            ..Default::default()
        })
    }

    pub fn stored(&self) -> Option<Credential> {
        self.record.lock().clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load(&self) -> Result<Option<Credential>> {
        Ok(self.record.lock().clone())
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.record.lock() = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        *self.record.lock() = None;
        Ok(())
    }
}

mock! {
    pub Store {}

    #[async_trait::async_trait]
    impl CredentialStore for Store {
        async fn load(&self) -> Result<Option<Credential>>;
        async fn save(&self, credential: &Credential) -> Result<()>;
        async fn clear(&self) -> Result<()>;
    }
}

// ============================================================================
// OAuth provider
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehaviour {
    Succeed,
    Revoked,
    Unavailable,
}

pub struct FakeOAuth {
    pub refreshes: AtomicUsize,
    pub exchanges: AtomicUsize,
    pub refresh_delay: Duration,
    pub behaviour: Mutex<RefreshBehaviour>,
}

impl FakeOAuth {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(refresh_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            refreshes: AtomicUsize::new(0),
            exchanges: AtomicUsize::new(0),
            refresh_delay,
            behaviour: Mutex::new(RefreshBehaviour::Succeed),
        })
    }

    pub fn set_behaviour(&self, behaviour: RefreshBehaviour) {
        *self.behaviour.lock() = behaviour;
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OAuthBackend for FakeOAuth {
    fn authorization_url(&self, state: &str, redirect_uri: &str, _scopes: &[String]) -> Result<String> {
        let mut url = url::Url::parse("https://accounts.example.test/o/oauth2/auth")
            .map_err(|e| CleanerError::ConfigError(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<Credential> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if code == GOOD_CODE {
            Ok(credential(3600))
        } else {
            Err(CleanerError::InvalidGrant("bad authorization code".to_string()))
        }
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<Credential> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let behaviour = *self.behaviour.lock();
        match behaviour {
            RefreshBehaviour::Succeed => {
                let mut fresh = credential(3600);
                fresh.refresh_token = None;
                Ok(fresh)
            }
            RefreshBehaviour::Revoked => Err(CleanerError::InvalidGrant("Token has been revoked".to_string())),
            RefreshBehaviour::Unavailable => Err(CleanerError::ServerError {
                status: 503,
                message: "backend unavailable".to_string(),
            }),
        }
    }
}

/// Split a URL produced by [`FakeOAuth`] into (state, redirect port)
pub fn handshake_params(authorization_url: &str) -> (String, u16) {
    let url = url::Url::parse(authorization_url).unwrap();
    let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
    let redirect = url::Url::parse(&pairs["redirect_uri"]).unwrap();
    (pairs["state"].clone(), redirect.port().unwrap())
}

/// Send one raw request to the callback listener and return the response
pub async fn send_callback(port: u16, target: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", target);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

// ============================================================================
// Mailbox
// ============================================================================

/// In-memory mailbox: listing by exact query, metadata by id, label changes
/// recorded per message
#[derive(Default)]
pub struct FakeMailbox {
    pub queries: Mutex<HashMap<String, Vec<String>>>,
    pub failing_queries: Mutex<HashSet<String>>,
    pub metadata: Mutex<HashMap<String, MessageMetadata>>,
    pub missing: Mutex<HashSet<String>>,
    /// A batch containing any of these ids fails with a 503
    pub failing_ids: Mutex<HashSet<String>>,
    pub modify_delay: Mutex<Duration>,
    pub modify_calls: Mutex<Vec<Vec<String>>>,
    pub labels: Mutex<HashMap<String, HashSet<String>>>,
    pub list_calls: AtomicUsize,
    pub profile: Mutex<Option<String>>,
    /// Connecting a client for this mailbox fails while set
    pub refuse_connect: AtomicBool,
}

impl FakeMailbox {
    pub fn new() -> Arc<Self> {
        let mailbox = Self::default();
        *mailbox.profile.lock() = Some("user@example.com".to_string());
        Arc::new(mailbox)
    }

    pub fn add_query(&self, query: &str, ids: Vec<String>) {
        self.queries.lock().insert(query.to_string(), ids);
    }

    pub fn add_message(&self, message: MessageMetadata) {
        self.metadata.lock().insert(message.id.clone(), message);
    }

    pub fn fail_ids(&self, ids: &[String]) {
        self.failing_ids.lock().extend(ids.iter().cloned());
    }

    pub fn set_modify_delay(&self, delay: Duration) {
        *self.modify_delay.lock() = delay;
    }

    pub fn modify_call_count(&self) -> usize {
        self.modify_calls.lock().len()
    }

    /// Ids that currently carry `label`
    pub fn with_label(&self, label: &str) -> HashSet<String> {
        self.labels
            .lock()
            .iter()
            .filter(|(_, labels)| labels.contains(label))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn without_label(&self, label: &str) -> HashSet<String> {
        self.labels
            .lock()
            .iter()
            .filter(|(_, labels)| !labels.contains(label))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    async fn list_message_ids_page(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<MessagePage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_queries.lock().contains(query) {
            return Err(CleanerError::Forbidden(format!("listing '{}' denied", query)));
        }

        let all = self.queries.lock().get(query).cloned().unwrap_or_default();
        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + max_results as usize).min(all.len());
        let next_page_token = if end < all.len() { Some(end.to_string()) } else { None };
        Ok(MessagePage {
            ids: all[start.min(end)..end].to_vec(),
            next_page_token,
        })
    }

    async fn get_messages(&self, ids: &[String]) -> Vec<(String, Result<MessageMetadata>)> {
        let metadata = self.metadata.lock();
        let missing = self.missing.lock();
        ids.iter()
            .map(|id| {
                let result = if missing.contains(id) {
                    Err(CleanerError::MessageNotFound(id.clone()))
                } else {
                    Ok(metadata
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| create_test_message(id, "someone@example.com", "Hello")))
                };
                (id.clone(), result)
            })
            .collect()
    }

    async fn batch_modify(&self, ids: &[String], add: &[String], remove: &[String]) -> Result<()> {
        self.modify_calls.lock().push(ids.to_vec());
        let delay = *self.modify_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if ids.iter().any(|id| self.failing_ids.lock().contains(id)) {
            return Err(CleanerError::ServerError {
                status: 503,
                message: "backend error".to_string(),
            });
        }

        let mut labels = self.labels.lock();
        for id in ids {
            let entry = labels
                .entry(id.clone())
                .or_insert_with(|| ["INBOX".to_string(), "UNREAD".to_string()].into_iter().collect());
            for label in add {
                entry.insert(label.clone());
            }
            for label in remove {
                entry.remove(label);
            }
        }
        Ok(())
    }

    async fn profile_email(&self) -> Result<String> {
        self.profile
            .lock()
            .clone()
            .ok_or_else(|| CleanerError::Forbidden("profile unavailable".to_string()))
    }
}

pub struct FakeConnector {
    pub mailbox: Arc<FakeMailbox>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(mailbox: Arc<FakeMailbox>) -> Arc<Self> {
        Arc::new(Self {
            mailbox,
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MailboxConnector for FakeConnector {
    async fn connect(&self, _credential: &Credential) -> Result<Arc<dyn MailboxClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.mailbox.refuse_connect.load(Ordering::SeqCst) {
            return Err(CleanerError::NetworkError("connection refused".to_string()));
        }
        Ok(self.mailbox.clone())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub fn test_settings() -> SessionSettings {
    SessionSettings {
        scopes: vec!["https://www.googleapis.com/auth/gmail.modify".to_string()],
        bind_host: "127.0.0.1".to_string(),
        redirect_host: "127.0.0.1".to_string(),
        port: 0,
        external_port: None,
        callback_timeout: Duration::from_secs(5),
        refresh_margin: ChronoDuration::minutes(5),
        web_auth: false,
    }
}

pub fn session_manager(
    store: Arc<dyn CredentialStore>,
    oauth: Option<Arc<FakeOAuth>>,
    mailbox: Arc<FakeMailbox>,
    settings: SessionSettings,
) -> Arc<SessionManager> {
    let oauth = oauth.map(|o| o as Arc<dyn OAuthBackend>);
    Arc::new(SessionManager::new(store, oauth, FakeConnector::new(mailbox), settings))
}

/// Fast retries and small batches
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.execution.batch_size = 100;
    config.execution.max_concurrent_batches = 1;
    config.execution.max_attempts = 3;
    config.execution.retry_base_delay_ms = 1;
    config.execution.retry_max_delay_secs = 1;
    config.execution.quota_units_per_second = 100_000;
    config
}

pub struct Harness {
    pub service: CleanerService,
    pub mailbox: Arc<FakeMailbox>,
    pub store: Arc<MemoryStore>,
    pub oauth: Arc<FakeOAuth>,
}

/// Signed-in service over a fake mailbox
pub fn signed_in_service(config: Config) -> Harness {
    signed_in_service_with_registry(config, Arc::new(TaskRegistry::new()))
}

pub fn signed_in_service_with_registry(config: Config, registry: Arc<TaskRegistry>) -> Harness {
    let mailbox = FakeMailbox::new();
    let store = MemoryStore::with(Some(credential(3600)));
    let oauth = FakeOAuth::new();
    let session = session_manager(store.clone(), Some(oauth.clone()), mailbox.clone(), test_settings());
    Harness {
        service: CleanerService::new(config, session, registry),
        mailbox,
        store,
        oauth,
    }
}

/// Poll until `kind` reaches a terminal state
pub async fn wait_for_terminal(service: &CleanerService, kind: &str) -> TaskSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(snapshot) = service.task_status(kind) {
            if snapshot.status.is_terminal() {
                return snapshot;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "task '{}' did not finish", kind);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `kind` has at least `processed` successes
pub async fn wait_for_progress(service: &CleanerService, kind: &str, processed: usize) -> TaskSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(snapshot) = service.task_status(kind) {
            if snapshot.processed >= processed {
                return snapshot;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "task '{}' made no progress", kind);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
