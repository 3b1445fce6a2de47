//! Where file operations run.
//!
//! Every operation is a [`Message`] request answered by a [`Message`]
//! response, so it can be handled in this process or in a separate
//! execution environment reached over a local socket with the same result.
//! The choice is made once, when an [`AnyExecutor`] is built from
//! configuration.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use protocol::messages::{DirectoryListing, ErrorCode, ErrorMessage, Message, Pong, UploadResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::{Config, ExecutionMode};
use crate::files::{
    AllowedRoots, DirectoryLister, FileOpsError, FileService, PathRejection, UploadGuard,
};
use crate::ipc::{get_socket_path, IpcClient, IpcError};

/// Errors raised while getting a request executed.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The execution environment socket could not be reached.
    #[error("failed to reach execution environment at {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: IpcError,
    },

    /// The request or its response was lost in transit.
    #[error("execution environment request failed: {0}")]
    Transport(#[from] IpcError),

    /// The in-process worker died.
    #[error("execution task failed: {0}")]
    Join(String),
}

/// Something that can execute a request and produce its response.
#[allow(async_fn_in_trait)]
pub trait Executor: Send + Sync {
    /// Execute a single request.
    async fn call(&self, request: Message) -> Result<Message, ExecutorError>;
}

/// Answer a request against `service`.
///
/// This is the whole request surface; both executors end up here.
pub fn dispatch(service: &FileService, request: Message) -> Message {
    match request {
        Message::ListDirectory(req) => match service.list(&req.path) {
            Ok(listing) => Message::DirectoryListing(listing),
            Err(e) => error_message(&e),
        },
        Message::GetFileInfo(req) => Message::FileInfo(service.info(&req.path)),
        Message::SaveUploads(req) => Message::UploadResult(UploadResult {
            outcomes: service.save_batch(&req.target_dir, &req.files),
        }),
        Message::SaveBase64(req) => Message::UploadResult(UploadResult {
            outcomes: vec![service.save_base64(&req.target_dir, &req.filename, &req.content)],
        }),
        Message::DeleteEntry(req) => Message::DeleteResult(service.delete(&req.path)),
        Message::Ping(ping) => Message::Pong(Pong {
            timestamp: ping.timestamp,
        }),
        other => Message::Error(ErrorMessage {
            code: ErrorCode::InvalidRequest,
            message: format!("unsupported request: {}", other.name()),
            recoverable: false,
        }),
    }
}

fn error_message(err: &FileOpsError) -> Message {
    let code = match err {
        FileOpsError::Denied => ErrorCode::AccessDenied,
        FileOpsError::Unavailable(_) => ErrorCode::InternalError,
    };
    Message::Error(ErrorMessage {
        code,
        message: err.to_string(),
        recoverable: false,
    })
}

// ============================================================================
// Local
// ============================================================================

/// Runs requests in this process on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    service: Arc<FileService>,
}

impl LocalExecutor {
    /// Wrap a file service.
    pub fn new(service: FileService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    /// Executor over a single root with default limits.
    pub fn for_root(root: impl AsRef<Path>) -> Result<Self, PathRejection> {
        let roots = AllowedRoots::new([root.as_ref()])?;
        Ok(Self::new(FileService::new(
            roots,
            UploadGuard::default(),
            DirectoryLister::default(),
        )))
    }

    /// The wrapped service.
    pub fn service(&self) -> &FileService {
        &self.service
    }

    /// Execute a request.
    ///
    /// Directory listings are bounded by the lister's timeout even when the
    /// filesystem blocks inside a single `read_dir` or `stat`.
    pub async fn execute(&self, request: Message) -> Result<Message, ExecutorError> {
        let listing = matches!(request, Message::ListDirectory(_));
        let service = Arc::clone(&self.service);
        let handle = tokio::task::spawn_blocking(move || dispatch(&service, request));
        let work = async { handle.await.map_err(|e| ExecutorError::Join(e.to_string())) };

        if listing {
            within_listing_timeout(self.service.lister().timeout(), work).await
        } else {
            work.await
        }
    }
}

/// Wait for a listing, answering with an empty one once `limit` has passed.
///
/// A blocking worker cannot be cancelled; it finishes on its own and its
/// result is discarded.
async fn within_listing_timeout<F>(limit: Duration, work: F) -> Result<Message, ExecutorError>
where
    F: Future<Output = Result<Message, ExecutorError>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                timeout_ms = limit.as_millis() as u64,
                "Directory listing timed out"
            );
            Ok(Message::DirectoryListing(DirectoryListing::empty()))
        }
    }
}

impl Executor for LocalExecutor {
    async fn call(&self, request: Message) -> Result<Message, ExecutorError> {
        self.execute(request).await
    }
}

// ============================================================================
// Remote
// ============================================================================

/// Forwards requests to the execution environment socket.
///
/// One connection is kept open and reused; it is dropped after any transport
/// failure and re-established by the next call.
pub struct RemoteExecutor {
    socket_path: PathBuf,
    timeout: Duration,
    client: Mutex<Option<IpcClient>>,
}

impl RemoteExecutor {
    /// Create an executor for the given socket. No connection is made yet.
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
            client: Mutex::new(None),
        }
    }

    /// The socket this executor talks to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("socket_path", &self.socket_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Executor for RemoteExecutor {
    async fn call(&self, request: Message) -> Result<Message, ExecutorError> {
        let mut guard = self.client.lock().await;

        if guard.is_none() {
            debug!(socket = %self.socket_path.display(), "Connecting to execution environment");
            let client = IpcClient::connect_with_timeout(&self.socket_path, self.timeout)
                .await
                .map_err(|source| ExecutorError::Connect {
                    path: self.socket_path.clone(),
                    source,
                })?;
            *guard = Some(client);
        }

        let Some(client) = guard.as_mut() else {
            return Err(ExecutorError::Transport(IpcError::Closed));
        };

        match client.call(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(socket = %self.socket_path.display(), error = %e, "Execution request failed");
                *guard = None;
                Err(ExecutorError::Transport(e))
            }
        }
    }
}

// ============================================================================
// Selection
// ============================================================================

/// The executor chosen by configuration.
#[derive(Debug)]
pub enum AnyExecutor {
    /// In this process.
    Local(LocalExecutor),
    /// In the execution environment.
    Remote(RemoteExecutor),
}

impl AnyExecutor {
    /// Build the executor selected by `config.execution.mode`.
    pub fn from_config(config: &Config) -> Result<Self, PathRejection> {
        Ok(match config.execution.mode {
            ExecutionMode::Local => {
                AnyExecutor::Local(LocalExecutor::new(FileService::from_config(config)?))
            }
            ExecutionMode::Remote => {
                let socket = config
                    .daemon
                    .socket_path
                    .clone()
                    .unwrap_or_else(get_socket_path);
                AnyExecutor::Remote(RemoteExecutor::new(
                    socket,
                    config.execution.request_timeout(),
                ))
            }
        })
    }

    /// Whether requests leave this process.
    pub fn is_remote(&self) -> bool {
        matches!(self, AnyExecutor::Remote(_))
    }
}

impl Executor for AnyExecutor {
    async fn call(&self, request: Message) -> Result<Message, ExecutorError> {
        match self {
            AnyExecutor::Local(local) => local.call(request).await,
            AnyExecutor::Remote(remote) => remote.call(request).await,
        }
    }
}
