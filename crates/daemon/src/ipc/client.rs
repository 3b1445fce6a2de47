//! IPC client used by the remote executor.
//!
//! Requests are sent one at a time; each waits for the response carrying its
//! sequence number.

use std::path::Path;
use std::time::Duration;

use protocol::messages::{Message, Ping};
use protocol::Envelope;
use tokio::net::UnixStream;

use super::server::{IpcConnection, IpcError};

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// A client for the execution environment socket.
pub struct IpcClient {
    conn: IpcConnection,
    timeout: Duration,
    next_sequence: u64,
}

impl IpcClient {
    /// Connect to the execution environment at the specified socket path.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(
            stream,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        ))
    }

    /// Connect with a timeout that also applies to every later request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| IpcError::Timeout)??;
        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        Self {
            conn: IpcConnection::new(stream),
            timeout,
            next_sequence: 1,
        }
    }

    /// Set the timeout for requests.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for its response.
    pub async fn call(&mut self, request: Message) -> Result<Message, IpcError> {
        tokio::time::timeout(self.timeout, self.call_internal(request))
            .await
            .map_err(|_| IpcError::Timeout)?
    }

    async fn call_internal(&mut self, request: Message) -> Result<Message, IpcError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.conn
            .send_envelope(&Envelope::new(sequence, request))
            .await?;

        let response = self.conn.read_envelope().await?.ok_or(IpcError::Closed)?;
        if response.sequence != sequence {
            return Err(IpcError::SequenceMismatch {
                expected: sequence,
                got: response.sequence,
            });
        }
        Ok(response.payload)
    }

    /// Check that the execution environment is responsive.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let response = self.call(Message::Ping(Ping { timestamp })).await?;
        Ok(matches!(response, Message::Pong(pong) if pong.timestamp == timestamp))
    }
}
