//! Upload admission checks.
//!
//! Candidates are checked in a fixed order and the first failing rule wins:
//! a non-empty filename, an allow-listed extension, then a size that is
//! neither zero nor above the configured maximum. Nothing is written to disk
//! until a candidate passes.

use std::io::{self, Seek, SeekFrom};

use protocol::messages::FileKind;
use thiserror::Error;

/// Default upload limit (100 MiB).
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 100 * MIB;

const MIB: u64 = 1024 * 1024;

/// Allowed extensions by category, lowercase and without the dot.
pub const ALLOWED_EXTENSIONS: &[(FileKind, &[&str])] = &[
    (
        FileKind::Image,
        &["jpg", "jpeg", "png", "gif", "bmp", "webp", "svg"],
    ),
    (
        FileKind::Code,
        &["py", "js", "ts", "sh", "bash", "html", "css", "json", "yaml", "yml"],
    ),
    (FileKind::Document, &["md", "pdf", "txt", "csv", "xml"]),
    (FileKind::Archive, &["zip", "tar", "gz"]),
];

/// Why an upload candidate was not stored.
///
/// These messages are returned to the caller verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadRejection {
    #[error("Empty filename")]
    EmptyFilename,

    #[error("File type not allowed")]
    TypeNotAllowed,

    #[error("Empty file")]
    EmptyFile,

    #[error("File too large. Maximum size is {max_mib}MB")]
    TooLarge { max_mib: u64 },

    #[error("Could not determine file size: {0}")]
    SizeUnknown(String),

    #[error("Could not read file: {0}")]
    Unreadable(String),

    #[error("Invalid base64 content")]
    InvalidBase64,

    #[error("Invalid filename")]
    InvalidFilename,

    #[error("Invalid path: access denied")]
    Denied,

    #[error("Failed to save file: {0}")]
    Storage(String),
}

/// Admission checks for uploaded files.
#[derive(Debug, Clone, Copy)]
pub struct UploadGuard {
    max_size: u64,
}

impl Default for UploadGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UPLOAD_SIZE)
    }
}

impl UploadGuard {
    /// Create a guard with the given per-file byte limit.
    pub fn new(max_size: u64) -> Self {
        Self { max_size }
    }

    /// The per-file byte limit.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Check a candidate whose size is already known.
    pub fn check(&self, filename: &str, size: u64) -> Result<(), UploadRejection> {
        self.check_name(filename)?;
        self.check_size(size)
    }

    /// Check an in-memory candidate.
    pub fn check_bytes(&self, filename: &str, data: &[u8]) -> Result<(), UploadRejection> {
        self.check(filename, data.len() as u64)
    }

    /// Check a streamed candidate, returning the number of bytes it holds.
    ///
    /// The stream's read position is the same after the call as before it.
    pub fn check_stream<S: Seek>(
        &self,
        filename: &str,
        stream: &mut S,
    ) -> Result<u64, UploadRejection> {
        self.check_name(filename)?;
        let size = probe_stream_len(stream)
            .map_err(|e| UploadRejection::SizeUnknown(e.to_string()))?;
        self.check_size(size)?;
        Ok(size)
    }

    fn check_name(&self, filename: &str) -> Result<(), UploadRejection> {
        if filename.is_empty() {
            return Err(UploadRejection::EmptyFilename);
        }
        if allowed_kind(filename).is_none() {
            return Err(UploadRejection::TypeNotAllowed);
        }
        Ok(())
    }

    fn check_size(&self, size: u64) -> Result<(), UploadRejection> {
        if size == 0 {
            return Err(UploadRejection::EmptyFile);
        }
        if size > self.max_size {
            return Err(UploadRejection::TooLarge {
                max_mib: self.max_size.div_ceil(MIB),
            });
        }
        Ok(())
    }
}

/// Text after the last dot, lowercased.
fn extension(name: &str) -> Option<String> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn allowed_kind(name: &str) -> Option<FileKind> {
    let ext = extension(name)?;
    ALLOWED_EXTENSIONS
        .iter()
        .find(|(_, exts)| exts.contains(&ext.as_str()))
        .map(|(kind, _)| *kind)
}

/// Classify a file name by its extension.
pub fn classify(name: &str) -> FileKind {
    allowed_kind(name).unwrap_or(FileKind::Unknown)
}

/// Bytes between the current position and the end of `stream`.
///
/// Seeks to the end and back; the original position is restored before
/// returning successfully.
pub fn probe_stream_len<S: Seek>(stream: &mut S) -> io::Result<u64> {
    let start = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(start))?;
    Ok(end.saturating_sub(start))
}

/// Reduce a client-supplied filename to a safe single path component.
///
/// Non-ASCII characters are dropped, path separators and whitespace runs
/// become underscores, anything outside `[A-Za-z0-9_.-]` is removed and
/// leading or trailing dots and underscores are stripped. Returns `None` when
/// nothing is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let spaced: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' { ' ' } else { c })
        .collect();

    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');

    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
