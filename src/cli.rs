//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Result;
use crate::service::CleanerService;
use crate::session::AuthorizationStatus;
use crate::tasks::{TaskSnapshot, TaskStatus};

/// How often a watched task is polled
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "gmail-cleaner")]
#[command(version = "0.1.0")]
#[command(about = "Bulk Gmail cleanup: scan, unsubscribe, delete, archive, label", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in with Google
    Auth {
        /// Sign out first, then sign in again
        #[arg(long)]
        force: bool,
    },

    /// Show sign-in state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget the stored credential
    SignOut,

    /// Start a task and follow its progress, e.g.
    /// '{"kind": "archive", "senders": ["news@example.com"]}'
    Run {
        /// Task request as JSON
        request: String,
    },

    /// Resume an interrupted or cancelled task
    Resume {
        /// Task kind, e.g. "delete"
        kind: String,
    },

    /// List known tasks
    Tasks {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write an example configuration file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share a MultiProgress with the log writer so log lines print above the bars
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let bar_style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Switch a spinner to a bar once the total is known
    pub fn promote_to_bar(&self, pb: &ProgressBar, len: u64) {
        pb.set_length(len);
        pb.set_style(self.bar_style.clone());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `kind` until it reaches a terminal state, drawing progress.
/// Ctrl-C requests cooperative cancellation and keeps polling until the
/// task stops.
pub async fn watch_task(service: &CleanerService, kind: &str, reporter: &ProgressReporter) -> Result<Option<TaskSnapshot>> {
    let pb = reporter.add_spinner(&format!("Starting {}...", kind));
    let mut has_bar = false;
    let mut last_version = None;
    let mut cancel_requested = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let Some(snapshot) = service.task_status(kind) else {
            pb.finish_and_clear();
            return Ok(None);
        };

        if last_version != Some(snapshot.version) {
            last_version = Some(snapshot.version);
            if let Some(total) = snapshot.total {
                if !has_bar {
                    reporter.promote_to_bar(&pb, total as u64);
                    has_bar = true;
                }
                pb.set_position((snapshot.processed + snapshot.failures.len()).min(total) as u64);
            }
            if let Some(message) = &snapshot.message {
                pb.set_message(message.clone());
            }
        }

        if snapshot.status.is_terminal() {
            pb.finish_and_clear();
            return Ok(Some(snapshot));
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            signal = &mut ctrl_c, if !cancel_requested => {
                if let Err(e) = signal {
                    warn!("Could not listen for Ctrl-C: {}", e);
                }
                cancel_requested = true;
                if service.cancel_task(kind) {
                    pb.set_message("Cancelling after the current batches...");
                    info!("Cancellation requested for '{}'", kind);
                }
            }
        }
    }
}

pub fn print_status(status: &AuthorizationStatus) {
    println!("\n========================================");
    println!("Authorization");
    println!("========================================");
    println!("State: {:?}", status.phase);
    println!("Signed in: {}", if status.authenticated { "yes" } else { "no" });
    if let Some(principal) = &status.principal {
        println!("Account: {}", principal);
    }
    if status.needs_setup {
        println!("Setup needed: add credentials.json or set GOOGLE_CREDENTIALS");
    }
    if let Some(url) = &status.pending_auth_url {
        println!("Waiting for sign-in at: {}", url);
    }
    if let Some(error) = &status.last_error {
        println!("Last error: {}", error);
    }
    println!("========================================");
}

pub fn print_snapshot(snapshot: &TaskSnapshot, detailed: bool) {
    let status = match snapshot.status {
        TaskStatus::Idle if snapshot.interrupted => "interrupted",
        TaskStatus::Idle => "idle",
        TaskStatus::Running => "running",
        TaskStatus::Done => "done",
        TaskStatus::Error => "error",
        TaskStatus::Cancelled => "cancelled",
    };
    println!("{:<16} {:<12} {}", snapshot.kind, status, snapshot.summary());
    if let Some(error) = &snapshot.error {
        println!("{:<16} error: {}", "", error);
    }
    if detailed && !snapshot.failures.is_empty() {
        for failure in snapshot.failures.iter().take(20) {
            println!("  - {} [{}] {}", failure.id, failure.code, failure.reason);
        }
        if snapshot.failures.len() > 20 {
            println!("  ... and {} more", snapshot.failures.len() - 20);
        }
    }
}
