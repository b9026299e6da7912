use anyhow::{Context, Result};
use clap::Parser;
use gmail_cleaner::auth::install_crypto_provider;
use gmail_cleaner::cli::{self, Cli, Commands, ProgressReporter};
use gmail_cleaner::config::Config;
use gmail_cleaner::error::CleanerError;
use gmail_cleaner::service::{CleanerService, TaskRequest};
use gmail_cleaner::tasks::TaskStatus;
use indicatif::MultiProgress;
use parking_lot::Mutex;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: MultiProgress,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self.buffer.lock();
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: MultiProgress,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(self.multi.clone())
    }
}

fn init_logging(cli: &Cli, multi: &MultiProgress) {
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gmail_cleaner=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gmail_cleaner=info,warn"))
    };

    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(MultiProgressMakeWriter { multi: multi.clone() })
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        eprintln!("\nFor help, run: gmail-cleaner --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    install_crypto_provider();

    let cli = Cli::parse();
    let multi = MultiProgress::new();
    init_logging(&cli, &multi);

    if let Commands::InitConfig { output, force } = &cli.command {
        if output.exists() && !force {
            return Err(CleanerError::ConfigError(format!(
                "Configuration file already exists at {:?}. Use --force to overwrite.",
                output
            ))
            .into());
        }
        Config::create_example(output).await?;
        println!("Created example configuration file at: {:?}", output);
        return Ok(());
    }

    let config = Config::load_with_env(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let service = CleanerService::from_config(config).await?;
    let reporter = ProgressReporter::with_multi_progress(multi);

    match cli.command {
        Commands::Auth { force } => {
            if force {
                service.sign_out().await?;
            }
            let status = service.authorization_status().await;
            if status.authenticated {
                println!("Already signed in as {}", status.principal.unwrap_or_default());
                return Ok(());
            }

            let spinner = reporter.add_spinner("Waiting for the authorization callback...");
            let signed_in = service.session().authorize_interactive().await;
            spinner.finish_and_clear();
            signed_in?;

            let status = service.authorization_status().await;
            if !status.authenticated {
                return Err(CleanerError::AuthorizationError(
                    status
                        .last_error
                        .unwrap_or_else(|| "authorization did not complete".to_string()),
                )
                .into());
            }
            println!(
                "Signed in as {}",
                status.principal.unwrap_or_else(|| "Unknown".to_string())
            );
            Ok(())
        }

        Commands::Status { json } => {
            let status = service.authorization_status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                cli::print_status(&status);
            }
            Ok(())
        }

        Commands::SignOut => {
            service.sign_out().await?;
            println!("Signed out");
            Ok(())
        }

        Commands::Run { request } => {
            let request: TaskRequest = serde_json::from_str(&request).context("parsing task request")?;
            let kind = request.kind();
            let started = service.start_task(request).await?;
            println!("Started '{}' (task {})", started.kind, started.task_id);
            finish_watch(&service, kind, &reporter).await
        }

        Commands::Resume { kind } => {
            let started = service.resume_task(&kind).await?;
            println!("Resumed '{}' (task {})", started.kind, started.task_id);
            finish_watch(&service, &kind, &reporter).await
        }

        Commands::Tasks { json } => {
            let tasks = service.list_tasks();
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("No tasks recorded.");
            } else {
                for snapshot in &tasks {
                    cli::print_snapshot(snapshot, false);
                }
            }
            Ok(())
        }

        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn finish_watch(service: &CleanerService, kind: &str, reporter: &ProgressReporter) -> Result<()> {
    let Some(snapshot) = cli::watch_task(service, kind, reporter).await? else {
        return Ok(());
    };

    println!("\n========================================");
    cli::print_snapshot(&snapshot, true);
    if let Some(result) = &snapshot.result {
        println!("----------------------------------------");
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    println!("========================================");

    match snapshot.status {
        TaskStatus::Error => {
            let reason = snapshot.error.clone().unwrap_or_else(|| snapshot.summary());
            Err(anyhow::anyhow!("task '{}' failed: {}", kind, reason))
        }
        TaskStatus::Cancelled => {
            println!("Cancelled. Run `gmail-cleaner resume {}` to continue.", kind);
            Ok(())
        }
        _ => Ok(()),
    }
}
