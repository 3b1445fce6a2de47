//! Workbox
//!
//! Sandboxed work-directory file service.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use workbox_daemon::config::Config;
use workbox_daemon::executor::{AnyExecutor, LocalExecutor};
use workbox_daemon::files::{FileOps, FileService, UploadRejection};
use workbox_daemon::ipc::{get_socket_path, serve, IpcServer};
use workbox_daemon::protocol::messages::{UploadOutcome, UploadResult};

/// Workbox - sandboxed work-directory file service.
#[derive(Parser, Debug)]
#[command(name = "workbox")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Host the execution environment on a Unix socket
    Serve {
        /// Socket path (defaults to the configured or runtime-dir socket)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// List a directory inside the sandbox
    Ls {
        /// Directory to list (defaults to the sandbox root)
        #[arg(default_value = "")]
        path: String,
    },

    /// Describe a path inside the sandbox
    Info {
        /// Path to describe
        path: String,
    },

    /// Upload local files into a sandbox directory
    Upload {
        /// Target directory inside the sandbox
        target_dir: String,

        /// Local files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Upload base64 content as a single file
    UploadB64 {
        /// Target directory inside the sandbox
        target_dir: String,

        /// Name to store the file under
        filename: String,

        /// Base64 content (read from stdin when omitted)
        content: Option<String>,
    },

    /// Delete a file or directory inside the sandbox
    Rm {
        /// Path to delete
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;

    match cli.command {
        Commands::Serve { socket } => run_server(&config, socket).await,
        command => run_operation(&config, command).await,
    }
}

async fn run_server(config: &Config, socket: Option<PathBuf>) -> anyhow::Result<()> {
    let socket = socket
        .or_else(|| config.daemon.socket_path.clone())
        .unwrap_or_else(get_socket_path);

    let service = FileService::from_config(config).context("Invalid sandbox roots")?;
    let executor = LocalExecutor::new(service);
    let server = IpcServer::bind(&socket)
        .await
        .with_context(|| format!("Failed to bind {}", socket.display()))?;

    tracing::info!(
        socket = %socket.display(),
        root = %config.sandbox.root.display(),
        "Execution environment listening"
    );

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(serve(server, executor, shutdown.clone()));

    wait_for_shutdown_signal().await?;
    shutdown.cancel();
    server_task.await.context("Server task failed")?;

    if let Err(e) = std::fs::remove_file(&socket) {
        tracing::debug!(socket = %socket.display(), error = %e, "Socket already gone");
    }
    Ok(())
}

async fn run_operation(config: &Config, command: Commands) -> anyhow::Result<()> {
    let ops = FileOps::from_config(config).context("Invalid sandbox roots")?;
    if let AnyExecutor::Remote(remote) = ops.executor() {
        tracing::debug!(socket = %remote.socket_path().display(), "Using remote execution");
    }

    match command {
        Commands::Ls { path } => {
            let listing = ops.list(&path).await?;
            print_json(&listing)
        }
        Commands::Info { path } => print_json(&ops.info(&path).await),
        Commands::Upload { target_dir, files } => {
            let mut outcomes = Vec::with_capacity(files.len());
            for path in &files {
                let outcome = match open_upload(path) {
                    Ok((filename, mut file)) => {
                        ops.save_reader(&target_dir, &filename, &mut file).await
                    }
                    Err(failed) => failed,
                };
                outcomes.push(outcome);
            }
            report_uploads(UploadResult { outcomes })
        }
        Commands::UploadB64 {
            target_dir,
            filename,
            content,
        } => {
            let content = match content {
                Some(content) => content,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read base64 content from stdin")?;
                    buf
                }
            };
            let outcome = ops.save_base64(&target_dir, &filename, &content).await;
            report_uploads(UploadResult {
                outcomes: vec![outcome],
            })
        }
        Commands::Rm { path } => {
            let result = ops.delete(&path).await;
            print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Serve { .. } => anyhow::bail!("serve is not a file operation"),
    }
}

fn report_uploads(result: UploadResult) -> anyhow::Result<()> {
    print_json(&result)?;
    if result.failed().count() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

/// Open a local upload source, or the failed outcome to report for it.
fn open_upload(path: &Path) -> Result<(String, std::fs::File), UploadOutcome> {
    let filename = match file_name(path) {
        Ok(name) => name,
        Err(e) => {
            let reason = UploadRejection::Unreadable(e.to_string());
            return Err(UploadOutcome::failed(path.display().to_string(), reason.to_string()));
        }
    };
    match std::fs::File::open(path) {
        Ok(file) => Ok((filename, file)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to open upload source");
            let reason = UploadRejection::Unreadable(e.to_string());
            Err(UploadOutcome::failed(filename, reason.to_string()))
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}
