//! IPC server hosting the execution environment.
//!
//! The server listens on a Unix socket and answers each framed request with a
//! framed response produced by the in-process executor.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use bytes::{Buf, BytesMut};
use protocol::messages::{ErrorCode, ErrorMessage, Message};
use protocol::{Envelope, FrameCodec, ProtocolError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::executor::LocalExecutor;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A server that listens for connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created as needed and a stale socket file at
    /// the path is removed first. The socket is made owner-only.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        Ok(Self { listener })
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

/// A framed connection carrying envelopes in both directions.
pub struct IpcConnection {
    reader: ReadHalf<UnixStream>,
    writer: WriteHalf<UnixStream>,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl IpcConnection {
    pub(super) fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: read_half,
            writer: write_half,
            codec: FrameCodec::new(),
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Read the next envelope.
    ///
    /// Returns `None` if the peer disconnected cleanly between frames.
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, IpcError> {
        loop {
            if let Some((envelope, used)) = self.codec.try_decode_envelope(&self.buffer)? {
                self.buffer.advance(used);
                return Ok(Some(envelope));
            }

            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(IpcError::Closed)
                };
            }
        }
    }

    /// Send an envelope.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), IpcError> {
        let bytes = self.codec.encode_envelope(envelope)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame or envelope could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed the connection mid-frame or before answering.
    #[error("peer closed connection")]
    Closed,

    /// A response did not answer the outstanding request.
    #[error("sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u64, got: u64 },

    /// No response arrived in time.
    #[error("operation timed out")]
    Timeout,
}

/// Accept connections and answer requests until `shutdown` is cancelled.
///
/// Connections are served concurrently; in-flight requests are allowed to
/// finish before this returns.
pub async fn serve(server: IpcServer, executor: LocalExecutor, shutdown: CancellationToken) {
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = server.accept() => match accepted {
                Ok(conn) => {
                    debug!("Accepted execution connection");
                    tracker.spawn(handle_connection(conn, executor.clone(), shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
        }
    }

    tracker.close();
    tracker.wait().await;
    info!("Execution server stopped");
}

async fn handle_connection(
    mut conn: IpcConnection,
    executor: LocalExecutor,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = conn.read_envelope() => next,
        };

        let envelope = match next {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(IpcError::Protocol(ProtocolError::VersionMismatch { expected, got })) => {
                warn!(expected, got, "Rejecting peer with mismatched protocol version");
                let reply = Message::Error(ErrorMessage {
                    code: ErrorCode::VersionMismatch,
                    message: format!("protocol version {got} not supported, expected {expected}"),
                    recoverable: false,
                });
                let _ = conn.send_envelope(&Envelope::new(0, reply)).await;
                break;
            }
            Err(e) => {
                warn!(error = %e, "Dropping execution connection");
                break;
            }
        };

        let sequence = envelope.sequence;
        let request = envelope.payload.name();
        let response = match executor.execute(envelope.payload).await {
            Ok(response) => response,
            Err(e) => {
                warn!(sequence, request, error = %e, "Request failed");
                Message::Error(ErrorMessage {
                    code: ErrorCode::InternalError,
                    message: e.to_string(),
                    recoverable: true,
                })
            }
        };
        debug!(sequence, request, response = response.name(), "Handled request");

        if let Err(e) = conn.send_envelope(&Envelope::new(sequence, response)).await {
            warn!(sequence, error = %e, "Failed to send response");
            break;
        }
    }
}
