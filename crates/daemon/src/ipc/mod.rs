//! Unix Domain Socket transport for the remote execution environment.
//!
//! The boundary layer and the execution environment exchange framed
//! MessagePack [`Envelope`](protocol::Envelope)s over a local socket. Each
//! request carries a sequence number that its response echoes.
//!
//! ## Socket Path
//!
//! The socket path follows the XDG Base Directory Specification:
//! - Primary: `$XDG_RUNTIME_DIR/workbox/exec.sock`
//! - Fallback: `/tmp/workbox-$UID/exec.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use protocol::messages::{Message, Ping};
//! use workbox_daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     let reply = client.call(Message::Ping(Ping { timestamp: 0 })).await?;
//!     println!("{}", reply.name());
//!     Ok(())
//! }
//! ```

mod client;
mod server;

pub use client::IpcClient;
pub use server::{serve, IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Get the socket path used by the execution environment.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/workbox/exec.sock`
/// 2. Otherwise: `/tmp/workbox-$UID/exec.sock`
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("workbox").join("exec.sock")
        }
        _ => {
            // Get UID by checking metadata of a file we own
            let uid = std::fs::metadata("/proc/self")
                .map(|m| m.uid())
                .unwrap_or(0);
            PathBuf::from(format!("/tmp/workbox-{uid}")).join("exec.sock")
        }
    }
}
