//! Executor-backed file operations for the boundary layer.
//!
//! [`FileOps`] turns each call into a request, hands it to an [`Executor`]
//! and maps the response back into the record the caller expects. Transport
//! failures are folded into those records too, so the boundary layer always
//! has a well-formed answer.

use std::io::{Read, Seek};

use base64::Engine;
use protocol::messages::{
    DeleteEntry, DeleteResult, DirectoryListing, ErrorCode, FileInfo, GetFileInfo, ListDirectory,
    Message, Ping, SaveBase64, SaveUploads, UploadFile, UploadOutcome,
};
use tracing::{debug, warn};

use super::guard::{UploadGuard, UploadRejection};
use super::sandbox::PathRejection;
use super::service::FileOpsError;
use crate::config::{Config, ExecutionMode};
use crate::executor::{AnyExecutor, Executor, ExecutorError};

/// Upper bound on the file payload carried by a single upload request.
///
/// Keeps each request well under the protocol's maximum frame size.
pub const DEFAULT_BATCH_BUDGET: usize = 64 * 1024 * 1024;

/// File operations routed through an executor.
#[derive(Debug)]
pub struct FileOps<E> {
    executor: E,
    guard: UploadGuard,
    precheck: bool,
    batch_budget: usize,
}

impl<E: Executor> FileOps<E> {
    /// Wrap an executor. Uploads are only checked where they execute.
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            guard: UploadGuard::default(),
            precheck: false,
            batch_budget: DEFAULT_BATCH_BUDGET,
        }
    }

    /// Check uploads with `guard` before handing them to the executor.
    ///
    /// Rejected candidates never reach the executor; accepted ones are
    /// checked again on the executing side.
    pub fn with_precheck(mut self, guard: UploadGuard) -> Self {
        self.guard = guard;
        self.precheck = true;
        self
    }

    /// Limit the file payload of each upload request to `budget` bytes.
    ///
    /// Larger batches are split across several requests. A single file over
    /// the budget is sent on its own.
    pub fn with_batch_budget(mut self, budget: usize) -> Self {
        self.batch_budget = budget;
        self
    }

    /// The wrapped executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// The limits applied to streamed sources and prechecked uploads.
    pub fn guard(&self) -> &UploadGuard {
        &self.guard
    }

    /// List a directory.
    pub async fn list(&self, path: &str) -> Result<DirectoryListing, FileOpsError> {
        let request = Message::ListDirectory(ListDirectory {
            path: path.to_string(),
        });
        match self.executor.call(request).await {
            Ok(Message::DirectoryListing(listing)) => Ok(listing),
            Ok(Message::Error(err)) if err.code == ErrorCode::AccessDenied => {
                Err(FileOpsError::Denied)
            }
            Ok(other) => Err(unexpected("ListDirectory", &other)),
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Describe a path. Always returns a record.
    pub async fn info(&self, path: &str) -> FileInfo {
        let request = Message::GetFileInfo(GetFileInfo {
            path: path.to_string(),
        });
        let message = match self.executor.call(request).await {
            Ok(Message::FileInfo(info)) => return info,
            Ok(other) => unexpected("GetFileInfo", &other).to_string(),
            Err(e) => unavailable(e).to_string(),
        };
        FileInfo {
            input_path: path.to_string(),
            message,
            ..FileInfo::default()
        }
    }

    /// Save one in-memory file into `target_dir`.
    pub async fn save(&self, target_dir: &str, file: UploadFile) -> UploadOutcome {
        let filename = file.filename.clone();
        self.save_batch(target_dir, vec![file])
            .await
            .pop()
            .unwrap_or_else(|| UploadOutcome::failed(filename, UploadRejection::Denied.to_string()))
    }

    /// Save several in-memory files into `target_dir`.
    ///
    /// Returns one outcome per file, in the order given.
    pub async fn save_batch(&self, target_dir: &str, files: Vec<UploadFile>) -> Vec<UploadOutcome> {
        let mut outcomes: Vec<Option<UploadOutcome>> = Vec::with_capacity(files.len());
        let mut accepted = Vec::new();

        for file in files {
            match self.precheck(&file.filename, &file.data) {
                Ok(()) => {
                    outcomes.push(None);
                    accepted.push(file);
                }
                Err(reason) => {
                    debug!(filename = %file.filename, reason = %reason, "Upload rejected before dispatch");
                    outcomes.push(Some(UploadOutcome::failed(file.filename, reason.to_string())));
                }
            }
        }

        let mut remote = Vec::with_capacity(accepted.len());
        for batch in split_by_budget(accepted, self.batch_budget) {
            let sent: Vec<String> = batch.iter().map(|f| f.filename.clone()).collect();
            let request = Message::SaveUploads(SaveUploads {
                target_dir: target_dir.to_string(),
                files: batch,
            });
            remote.extend(self.upload_outcomes(request, &sent).await);
        }
        let mut remote = remote.into_iter();

        outcomes
            .into_iter()
            .map(|slot| {
                slot.or_else(|| remote.next())
                    .unwrap_or_else(|| UploadOutcome::failed("", "missing upload outcome"))
            })
            .collect()
    }

    /// Save a streamed file into `target_dir`.
    ///
    /// The stream's size is checked before any of it is read, so an oversized
    /// source is refused without being buffered.
    pub async fn save_reader<R: Read + Seek>(
        &self,
        target_dir: &str,
        filename: &str,
        reader: &mut R,
    ) -> UploadOutcome {
        let size = match self.guard.check_stream(filename, reader) {
            Ok(size) => size,
            Err(reason) => return UploadOutcome::failed(filename, reason.to_string()),
        };

        let mut data = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
        if let Err(e) = reader.take(size).read_to_end(&mut data) {
            warn!(filename = %filename, error = %e, "Failed to read upload source");
            let reason = UploadRejection::Unreadable(e.to_string());
            return UploadOutcome::failed(filename, reason.to_string());
        }

        self.save(
            target_dir,
            UploadFile {
                filename: filename.to_string(),
                data,
            },
        )
        .await
    }

    /// Save a base64-encoded file into `target_dir`.
    pub async fn save_base64(&self, target_dir: &str, filename: &str, content: &str) -> UploadOutcome {
        if self.precheck {
            let checked = base64::engine::general_purpose::STANDARD
                .decode(content.trim())
                .map_err(|_| UploadRejection::InvalidBase64)
                .and_then(|data| self.guard.check_bytes(filename, &data));
            if let Err(reason) = checked {
                debug!(filename = %filename, reason = %reason, "Upload rejected before dispatch");
                return UploadOutcome::failed(filename, reason.to_string());
            }
        }

        let request = Message::SaveBase64(SaveBase64 {
            target_dir: target_dir.to_string(),
            filename: filename.to_string(),
            content: content.to_string(),
        });
        self.upload_outcomes(request, &[filename.to_string()])
            .await
            .pop()
            .unwrap_or_else(|| UploadOutcome::failed(filename, "missing upload outcome"))
    }

    /// Delete a file, a symlink, or a directory tree.
    pub async fn delete(&self, path: &str) -> DeleteResult {
        let request = Message::DeleteEntry(DeleteEntry {
            path: path.to_string(),
        });
        let message = match self.executor.call(request).await {
            Ok(Message::DeleteResult(result)) => return result,
            Ok(other) => unexpected("DeleteEntry", &other).to_string(),
            Err(e) => unavailable(e).to_string(),
        };
        DeleteResult {
            path: path.to_string(),
            success: false,
            message: Some(message),
        }
    }

    /// Whether the executor answers.
    pub async fn ping(&self) -> bool {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        matches!(
            self.executor.call(Message::Ping(Ping { timestamp })).await,
            Ok(Message::Pong(pong)) if pong.timestamp == timestamp
        )
    }

    fn precheck(&self, filename: &str, data: &[u8]) -> Result<(), UploadRejection> {
        if self.precheck {
            self.guard.check_bytes(filename, data)
        } else {
            Ok(())
        }
    }

    /// Send an upload request, producing exactly one outcome per sent file.
    async fn upload_outcomes(&self, request: Message, sent: &[String]) -> Vec<UploadOutcome> {
        let reason = match self.executor.call(request).await {
            Ok(Message::UploadResult(result)) if result.outcomes.len() == sent.len() => {
                return result.outcomes
            }
            Ok(other) => unexpected("SaveUploads", &other).to_string(),
            Err(e) => unavailable(e).to_string(),
        };
        warn!(files = sent.len(), reason = %reason, "Upload dispatch failed");
        sent.iter()
            .map(|name| UploadOutcome::failed(name.as_str(), reason.as_str()))
            .collect()
    }
}

impl FileOps<AnyExecutor> {
    /// Build the facade selected by configuration.
    ///
    /// Both modes apply the configured upload limits to streamed sources.
    /// Remote execution also checks in-memory uploads locally first.
    pub fn from_config(config: &Config) -> Result<Self, PathRejection> {
        let mut ops = Self::new(AnyExecutor::from_config(config)?);
        ops.guard = UploadGuard::new(config.upload.max_size);
        ops.precheck = config.execution.mode == ExecutionMode::Remote;
        Ok(ops)
    }
}

/// Group files into consecutive batches whose payloads fit in `budget`.
fn split_by_budget(files: Vec<UploadFile>, budget: usize) -> Vec<Vec<UploadFile>> {
    let mut batches = Vec::new();
    let mut current: Vec<UploadFile> = Vec::new();
    let mut used = 0usize;

    for file in files {
        let size = file.data.len();
        if !current.is_empty() && used.saturating_add(size) > budget {
            batches.push(std::mem::take(&mut current));
            used = 0;
        }
        used = used.saturating_add(size);
        current.push(file);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn unavailable(err: ExecutorError) -> FileOpsError {
    warn!(error = %err, "Execution environment unavailable");
    FileOpsError::Unavailable(err.to_string())
}

fn unexpected(request: &str, got: &Message) -> FileOpsError {
    let detail = match got {
        Message::Error(err) => format!("{:?}: {}", err.code, err.message),
        other => format!("unexpected {} response to {request}", other.name()),
    };
    warn!(request, detail = %detail, "Unexpected execution response");
    FileOpsError::Unavailable(detail)
}
