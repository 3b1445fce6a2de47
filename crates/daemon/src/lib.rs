//! # Workbox Daemon Library
//!
//! Sandboxed file operations over a work directory: listing, inspection,
//! uploads and deletion, all confined to a set of allowed roots.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     FileOps (boundary layer)                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │                 Executor: Local | Remote (IPC)               │
//! ├──────────────────────────────────────────────────────────────┤
//! │                         FileService                          │
//! │  ┌───────────────┐  ┌───────────────┐  ┌──────────────────┐  │
//! │  │ AllowedRoots  │  │  UploadGuard  │  │ DirectoryLister  │  │
//! │  └───────────────┘  └───────────────┘  └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use workbox_daemon::{Config, FileOps};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let ops = FileOps::from_config(&config)?;
//!
//!     let listing = ops.list("$WORK_DIR").await?;
//!     for entry in listing.entries {
//!         println!("{}", entry.name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`files`]: Path confinement, upload checks, listing and the file service
//! - [`executor`]: Local and remote execution of file operations
//! - [`ipc`]: Unix socket transport for the remote execution environment

pub mod config;
pub mod executor;
pub mod files;
pub mod ipc;

pub use protocol;

pub use config::{Config, ConfigError, ExecutionMode};
pub use executor::{AnyExecutor, Executor, ExecutorError, LocalExecutor, RemoteExecutor};
pub use files::{
    AllowedRoots, DirectoryLister, FileOps, FileOpsError, FileService, PathRejection,
    UploadGuard, UploadRejection, ValidatedPath,
};
