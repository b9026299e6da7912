//! Gmail Cleaner
//!
//! Bulk mailbox cleanup (newsletter scan, delete, archive, label, mark
//! read/important) built around two long-lived components: the
//! authenticated session and the background task engine.
//!
//! # Overview
//!
//! - **Authentication**: OAuth2 redirect handshake with a local callback
//!   listener, credential persistence and single-flight token refresh
//! - **Tasks**: one running task per kind, versioned progress snapshots for
//!   pollers, cooperative cancellation and a resumable journal
//! - **Batching**: capped batches issued concurrently under a quota
//!   limiter, with per-item outcomes and bounded retry of transient errors
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_cleaner::{config::Config, service::{CleanerService, TaskRequest}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     gmail_cleaner::auth::install_crypto_provider();
//!     let config = Config::load_with_env("config.toml".as_ref()).await?;
//!     let service = CleanerService::from_config(config).await?;
//!
//!     let request: TaskRequest = serde_json::from_str(r#"{"kind": "scan", "limit": 200}"#)?;
//!     let started = service.start_task(request).await?;
//!     println!("started {}", started.task_id);
//!
//!     if let Some(snapshot) = service.task_status("scan") {
//!         println!("{}", snapshot.summary());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth client secret loading, code exchange and refresh
//! - [`callback`] - Local listener for the OAuth redirect
//! - [`credential_store`] - Durable credential storage
//! - [`session`] - Session state machine
//! - [`client`] - Mailbox API capability and its Gmail implementation
//! - [`rate_limiter`] - Quota-unit token bucket
//! - [`executor`] - Batched execution with retry
//! - [`tasks`] - Task registry
//! - [`state`] - Task journal and atomic file writes
//! - [`drivers`] - Scan and mutation drivers
//! - [`service`] - Facade used by the CLI
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`models`] - Message metadata and query filters

pub mod auth;
pub mod callback;
pub mod cli;
pub mod client;
pub mod config;
pub mod credential_store;
pub mod drivers;
pub mod error;
pub mod executor;
pub mod models;
pub mod rate_limiter;
pub mod service;
pub mod session;
pub mod state;
pub mod tasks;

pub use error::{CleanerError, Result};

pub use client::{MailboxClient, MailboxConnector, MessagePage};
pub use config::Config;
pub use credential_store::{Credential, CredentialStore, FileCredentialStore};
pub use executor::{BatchExecutor, BatchOperation, BatchSettings, ItemOutcome, ItemResult, RetryPolicy, RunOutcome};
pub use models::{MessageMetadata, QueryFilters};
pub use service::{CleanerService, TaskRequest, TaskStarted};
pub use session::{AuthPhase, AuthorizationStatus, Session, SessionManager, SessionSettings};
pub use tasks::{ItemFailure, TaskHandle, TaskOutcome, TaskRegistry, TaskSnapshot, TaskStatus};
