//! The file operations core.
//!
//! [`FileService`] composes path confinement, upload admission and directory
//! enumeration into the operations the boundary layer exposes. Every method
//! takes plain request values and returns a structured result; filesystem
//! errors never escape unstructured. Paths in results are relative to the
//! sandbox root; paths under an extra root are reported in full so they can
//! be passed back unchanged.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use protocol::messages::{DeleteResult, DirectoryListing, FileInfo, UploadFile, UploadOutcome};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};

use super::browser::{DirectoryLister, ListingError};
use super::guard::{sanitize_filename, UploadGuard, UploadRejection};
use super::sandbox::{AllowedRoots, PathRejection, ValidatedPath};
use crate::config::Config;

/// Caller-facing text for any path denial.
pub const DENIED_MESSAGE: &str = "Invalid path: access denied";

/// Default request path standing for the sandbox root.
pub const DEFAULT_ROOT_TOKEN: &str = "$WORK_DIR";

const INFO_DENIED_MESSAGE: &str = "Access denied: path outside allowed directories";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Errors returned by facade operations that do not produce a record.
///
/// The `Display` text never includes filesystem detail.
#[derive(Debug, Error)]
pub enum FileOpsError {
    /// The path was refused by the sandbox.
    #[error("Invalid path: access denied")]
    Denied,

    /// The execution environment could not be reached.
    #[error("execution environment unavailable: {0}")]
    Unavailable(String),
}

/// Sandboxed file operations.
#[derive(Debug, Clone)]
pub struct FileService {
    roots: AllowedRoots,
    guard: UploadGuard,
    lister: DirectoryLister,
    root_token: String,
}

impl FileService {
    /// Create a service over the given boundary.
    pub fn new(roots: AllowedRoots, guard: UploadGuard, lister: DirectoryLister) -> Self {
        Self {
            roots,
            guard,
            lister,
            root_token: DEFAULT_ROOT_TOKEN.to_string(),
        }
    }

    /// Build a service from configuration.
    pub fn from_config(config: &Config) -> Result<Self, PathRejection> {
        let roots = AllowedRoots::new(config.sandbox.all_roots())?;
        let guard = UploadGuard::new(config.upload.max_size);
        let lister = DirectoryLister::new(config.listing.max_entries, config.listing.timeout());
        Ok(Self::new(roots, guard, lister).with_root_token(config.sandbox.root_token.clone()))
    }

    /// Use a different token for the sandbox root.
    pub fn with_root_token(mut self, token: impl Into<String>) -> Self {
        self.root_token = token.into();
        self
    }

    /// The sandbox boundary.
    pub fn roots(&self) -> &AllowedRoots {
        &self.roots
    }

    /// The upload admission checks.
    pub fn guard(&self) -> &UploadGuard {
        &self.guard
    }

    /// The directory enumeration limits.
    pub fn lister(&self) -> &DirectoryLister {
        &self.lister
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// List a directory.
    ///
    /// A directory that is missing or cannot be enumerated yields an empty
    /// listing; only a denied path is an error.
    pub fn list(&self, path: &str) -> Result<DirectoryListing, FileOpsError> {
        let dir = self.resolve_request(path)?;

        match self.lister.list(&dir) {
            Ok(entries) => Ok(DirectoryListing {
                entries,
                current_path: dir.relative_string(),
                parent_path: parent_of(&dir),
            }),
            Err(e @ ListingError::TimedOut(_)) => {
                error!(path = %dir.as_path().display(), error = %e, "Directory listing failed");
                Ok(DirectoryListing::empty())
            }
            Err(e) => {
                warn!(path = %dir.as_path().display(), error = %e, "Directory listing failed");
                Ok(DirectoryListing::empty())
            }
        }
    }

    /// Describe a path. Always returns a record.
    pub fn info(&self, path: &str) -> FileInfo {
        let target = match self.resolve_request(path) {
            Ok(target) => target,
            Err(_) => {
                return FileInfo {
                    input_path: path.to_string(),
                    message: INFO_DENIED_MESSAGE.to_string(),
                    ..FileInfo::default()
                }
            }
        };

        let relative = target.relative();
        let mut record = FileInfo {
            input_path: path.to_string(),
            path: target.relative_string(),
            dir_path: relative
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_name: relative
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_ext: relative
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
            ..FileInfo::default()
        };

        let meta = match fs::metadata(target.as_path()) {
            Ok(meta) => meta,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %target.as_path().display(), error = %e, "Failed to stat path");
                }
                record.message = format!("File {path} not found.");
                return record;
            }
        };

        record.exists = true;
        record.is_dir = meta.is_dir();
        record.is_file = meta.is_file();
        record.is_link = self.symlink_at(path).is_some();
        record.size = meta.len();
        record.modified = meta.mtime() as f64 + meta.mtime_nsec() as f64 / 1e9;
        record.created = meta.ctime() as f64 + meta.ctime_nsec() as f64 / 1e9;
        record.permissions = meta.mode();
        record
    }

    // ------------------------------------------------------------------
    // Uploads
    // ------------------------------------------------------------------

    /// Save one in-memory file into `target_dir`.
    pub fn save(&self, target_dir: &str, file: &UploadFile) -> UploadOutcome {
        self.save_batch(target_dir, std::slice::from_ref(file))
            .pop()
            .unwrap_or_else(|| UploadOutcome::failed(&file.filename, DENIED_MESSAGE))
    }

    /// Save several in-memory files into `target_dir`.
    ///
    /// Each file succeeds or fails on its own; one outcome per file, in order.
    pub fn save_batch(&self, target_dir: &str, files: &[UploadFile]) -> Vec<UploadOutcome> {
        let dir = match self.resolve_request(target_dir) {
            Ok(dir) => dir,
            Err(_) => {
                return files
                    .iter()
                    .map(|f| UploadOutcome::failed(&f.filename, DENIED_MESSAGE))
                    .collect()
            }
        };

        files
            .iter()
            .map(|file| {
                let result = self
                    .guard
                    .check_bytes(&file.filename, &file.data)
                    .and_then(|()| self.store(&dir, &file.filename, &mut file.data.as_slice()));
                self.outcome(&file.filename, result)
            })
            .collect()
    }

    /// Save a streamed file into `target_dir`.
    ///
    /// The stream is stored from its current position to its end.
    pub fn save_stream<R: Read + Seek>(
        &self,
        target_dir: &str,
        filename: &str,
        reader: &mut R,
    ) -> UploadOutcome {
        let dir = match self.resolve_request(target_dir) {
            Ok(dir) => dir,
            Err(_) => return UploadOutcome::failed(filename, DENIED_MESSAGE),
        };

        let result = self
            .guard
            .check_stream(filename, reader)
            .and_then(|size| self.store(&dir, filename, &mut reader.take(size)));
        self.outcome(filename, result)
    }

    /// Save a base64-encoded file into `target_dir`.
    ///
    /// Content is decoded before any other check.
    pub fn save_base64(&self, target_dir: &str, filename: &str, content: &str) -> UploadOutcome {
        let data = match base64::engine::general_purpose::STANDARD.decode(content.trim()) {
            Ok(data) => data,
            Err(e) => {
                warn!(filename = %filename, error = %e, "Invalid base64 upload");
                return UploadOutcome::failed(filename, UploadRejection::InvalidBase64.to_string());
            }
        };

        self.save(
            target_dir,
            &UploadFile {
                filename: filename.to_string(),
                data,
            },
        )
    }

    fn outcome(
        &self,
        filename: &str,
        result: Result<(String, String), UploadRejection>,
    ) -> UploadOutcome {
        match result {
            Ok((saved_as, sha256)) => UploadOutcome::saved(filename, saved_as, sha256),
            Err(reason) => {
                warn!(filename = %filename, reason = %reason, "Upload rejected");
                UploadOutcome::failed(filename, reason.to_string())
            }
        }
    }

    /// Write an admitted candidate under its sanitized name.
    ///
    /// Returns the stored name and the hex SHA-256 of the stored bytes.
    fn store(
        &self,
        dir: &ValidatedPath,
        filename: &str,
        reader: &mut dyn Read,
    ) -> Result<(String, String), UploadRejection> {
        let safe = sanitize_filename(filename).ok_or(UploadRejection::InvalidFilename)?;

        let dest = self.roots.validate(dir.as_path().join(&safe)).map_err(|e| {
            warn!(filename = %filename, reason = %e, "Upload destination rejected");
            UploadRejection::Denied
        })?;
        let parent = dest.as_path().parent().ok_or(UploadRejection::Denied)?;

        fs::create_dir_all(parent).map_err(|e| UploadRejection::Storage(e.to_string()))?;

        let temp = parent.join(format!(".{safe}.{:08x}.part", rand::random::<u32>()));
        let written = write_hashed(&temp, reader)
            .and_then(|(size, digest)| fs::rename(&temp, dest.as_path()).map(|()| (size, digest)));

        match written {
            Ok((size, digest)) => {
                let sha256 = hex::encode(digest);
                info!(
                    path = %dest.relative_string(),
                    size,
                    sha256 = %sha256,
                    "Upload saved"
                );
                Ok((safe, sha256))
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(path = ?temp, error = %cleanup, "Failed to cleanup temp file");
                    }
                }
                Err(UploadRejection::Storage(e.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a file, a symlink, or a directory tree.
    pub fn delete(&self, path: &str) -> DeleteResult {
        let failed = |message: String| DeleteResult {
            path: path.to_string(),
            success: false,
            message: Some(message),
        };

        // A link is removed itself, wherever it points.
        let result = if let Some(link) = self.symlink_at(path) {
            fs::remove_file(&link).map(|()| link)
        } else {
            let target = match self.resolve_request(path) {
                Ok(target) => target,
                Err(_) => return failed(DENIED_MESSAGE.to_string()),
            };
            if target.is_root() {
                warn!(path = %target.as_path().display(), "Refusing to delete a sandbox root");
                return failed("Cannot delete a sandbox root".to_string());
            }
            remove_path(target.as_path()).map(|()| target.into_path_buf())
        };

        match result {
            Ok(removed) => {
                info!(path = %removed.display(), "Deleted");
                DeleteResult {
                    path: path.to_string(),
                    success: true,
                    message: None,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                failed(format!("File {path} not found."))
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Delete failed");
                failed(format!("Failed to delete: {e}"))
            }
        }
    }

    // ------------------------------------------------------------------
    // Path handling
    // ------------------------------------------------------------------

    /// Map a request path to a confined path.
    ///
    /// The empty path and the root token mean the sandbox root; a path
    /// starting with the token is taken relative to the root.
    fn resolve_request(&self, path: &str) -> Result<ValidatedPath, FileOpsError> {
        let request = self.strip_token(path);
        let result = if request.is_empty() {
            self.roots.validate(self.roots.primary())
        } else {
            self.roots.resolve(request)
        };

        result.map_err(|rejection| {
            warn!(path = %path, reason = %rejection, "Path denied");
            FileOpsError::Denied
        })
    }

    fn strip_token<'a>(&self, path: &'a str) -> &'a str {
        match path.strip_prefix(self.root_token.as_str()) {
            Some("") => "",
            Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
            _ => path,
        }
    }

    /// The request path as a symlink, if its containing directory is
    /// confined and the final component is a link.
    fn symlink_at(&self, path: &str) -> Option<PathBuf> {
        let request = self.strip_token(path);
        if request.is_empty() {
            return None;
        }
        let lexical = self.roots.primary().join(request);
        let name = lexical.file_name()?;
        let parent = self.roots.validate(lexical.parent()?).ok()?;
        let candidate = parent.as_path().join(name);

        fs::symlink_metadata(&candidate)
            .ok()
            .filter(|m| m.file_type().is_symlink())
            .map(|_| candidate)
    }
}

fn parent_of(dir: &ValidatedPath) -> String {
    if dir.is_root() {
        return String::new();
    }
    dir.relative()
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy `reader` into a new file at `path`, hashing as it goes.
fn write_hashed(path: &Path, reader: &mut dyn Read) -> io::Result<(u64, Vec<u8>)> {
    let mut file: File = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        file.write_all(&buffer[..n])?;
        total += n as u64;
    }

    file.flush()?;
    Ok((total, hasher.finalize().to_vec()))
}
