//! Protocol message definitions for Workbox.
//!
//! This module defines the request and response records exchanged between the
//! boundary layer and an execution environment. Records are plain values with
//! no host-specific state, so the same request produces the same response
//! whether it is handled in-process or marshalled across a socket. All
//! messages are serialized using MessagePack.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope wrapper for all protocol messages.
///
/// The envelope provides versioning and sequence numbers so a response can be
/// matched to its request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Sequence number; responses echo the request's sequence.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Reject envelopes produced by a peer speaking another version.
    pub fn check_version(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: self.version,
            });
        }
        Ok(())
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Read operations
    /// Request to list a directory.
    ListDirectory(ListDirectory),
    /// Response with a directory listing.
    DirectoryListing(DirectoryListing),
    /// Request metadata for a single path.
    GetFileInfo(GetFileInfo),
    /// Response with path metadata.
    FileInfo(FileInfo),

    // Write operations
    /// Save one or more uploaded files into a directory.
    SaveUploads(SaveUploads),
    /// Save a single base64-encoded file into a directory.
    SaveBase64(SaveBase64),
    /// Per-file outcome of a save request.
    UploadResult(UploadResult),
    /// Request to delete a file or directory.
    DeleteEntry(DeleteEntry),
    /// Outcome of a delete request.
    DeleteResult(DeleteResult),

    // Control messages
    /// Ping for liveness.
    Ping(Ping),
    /// Pong response to ping.
    Pong(Pong),
    /// Error message.
    Error(ErrorMessage),
}

impl Message {
    /// Short name of the message variant, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::ListDirectory(_) => "ListDirectory",
            Message::DirectoryListing(_) => "DirectoryListing",
            Message::GetFileInfo(_) => "GetFileInfo",
            Message::FileInfo(_) => "FileInfo",
            Message::SaveUploads(_) => "SaveUploads",
            Message::SaveBase64(_) => "SaveBase64",
            Message::UploadResult(_) => "UploadResult",
            Message::DeleteEntry(_) => "DeleteEntry",
            Message::DeleteResult(_) => "DeleteResult",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::Error(_) => "Error",
        }
    }
}

// ============================================================================
// Listing
// ============================================================================

/// Request to list a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDirectory {
    /// Path to list, relative to the sandbox root, absolute, or the root token.
    pub path: String,
}

/// A directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirectoryListing {
    /// Folders first, then files.
    pub entries: Vec<FileEntry>,
    /// Listed directory, relative to the sandbox root.
    pub current_path: String,
    /// Parent of `current_path`; empty at the sandbox root.
    pub parent_path: String,
}

impl DirectoryListing {
    /// The listing returned when a directory cannot be enumerated.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// A single entry in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Path relative to the sandbox root.
    pub path: String,
    /// How the entry itself appears on disk.
    pub entry_type: EntryType,
    /// Content classification derived from the extension.
    pub kind: FileKind,
    /// Whether the entry (or its symlink target) is a directory.
    pub is_dir: bool,
    /// Whether the entry is a symbolic link.
    pub is_symlink: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Unix permissions mode.
    pub mode: u32,
    /// Last modified timestamp (Unix epoch seconds).
    pub modified: u64,
    /// Raw link text if this is a symlink.
    pub symlink_target: Option<String>,
}

/// Type of a directory entry as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Content classification of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Raster or vector image.
    Image,
    /// Source code or structured text.
    Code,
    /// Prose or tabular document.
    Document,
    /// Compressed archive.
    Archive,
    /// Directory.
    Folder,
    /// Anything else.
    Unknown,
}

// ============================================================================
// Info
// ============================================================================

/// Request metadata for a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFileInfo {
    /// Path to inspect.
    pub path: String,
}

/// Metadata for a single path.
///
/// Always returned; `exists` and `message` distinguish denied and missing
/// paths from present ones.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path as supplied by the caller.
    pub input_path: String,
    /// Resolved path, relative to the sandbox root.
    pub path: String,
    /// Whether the path exists.
    pub exists: bool,
    /// Whether the path is a directory.
    pub is_dir: bool,
    /// Whether the path is a regular file.
    pub is_file: bool,
    /// Whether the requested path is a symbolic link.
    pub is_link: bool,
    /// Size in bytes.
    pub size: u64,
    /// Modification time (Unix epoch seconds).
    pub modified: f64,
    /// Status change time (Unix epoch seconds).
    pub created: f64,
    /// Raw `st_mode`.
    pub permissions: u32,
    /// Containing directory, relative to the sandbox root.
    pub dir_path: String,
    /// Final path component.
    pub file_name: String,
    /// Extension including the leading dot, or empty.
    pub file_ext: String,
    /// Human-readable note for denied or missing paths.
    pub message: String,
}

// ============================================================================
// Uploads
// ============================================================================

/// A single uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFile {
    /// Filename as supplied by the caller.
    pub filename: String,
    /// File content.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Save uploaded files into a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveUploads {
    /// Target directory.
    pub target_dir: String,
    /// Files to save.
    pub files: Vec<UploadFile>,
}

/// Save a single base64-encoded file into a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveBase64 {
    /// Target directory.
    pub target_dir: String,
    /// Filename as supplied by the caller.
    pub filename: String,
    /// Base64 (standard alphabet) file content.
    pub content: String,
}

/// Outcome for a single uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// Filename as supplied by the caller.
    pub filename: String,
    /// Whether the file was stored.
    pub success: bool,
    /// Reason the file was rejected.
    pub error: Option<String>,
    /// Sanitized name the file was stored under.
    pub saved_as: Option<String>,
    /// SHA-256 of the stored bytes, hex encoded.
    pub sha256: Option<String>,
}

impl UploadOutcome {
    /// A stored file.
    pub fn saved(filename: impl Into<String>, saved_as: impl Into<String>, sha256: String) -> Self {
        Self {
            filename: filename.into(),
            success: true,
            error: None,
            saved_as: Some(saved_as.into()),
            sha256: Some(sha256),
        }
    }

    /// A rejected file.
    pub fn failed(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            success: false,
            error: Some(reason.into()),
            saved_as: None,
            sha256: None,
        }
    }
}

/// Per-file outcomes of a save request, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadResult {
    /// One outcome per submitted file.
    pub outcomes: Vec<UploadOutcome>,
}

impl UploadResult {
    /// Outcomes of stored files.
    pub fn successful(&self) -> impl Iterator<Item = &UploadOutcome> {
        self.outcomes.iter().filter(|o| o.success)
    }

    /// Outcomes of rejected files.
    pub fn failed(&self) -> impl Iterator<Item = &UploadOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    /// Whether every submitted file was rejected.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| !o.success)
    }
}

// ============================================================================
// Delete
// ============================================================================

/// Request to delete a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEntry {
    /// Path to delete.
    pub path: String,
}

/// Outcome of a delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    /// Path as supplied by the caller.
    pub path: String,
    /// Whether the target was removed.
    pub success: bool,
    /// Failure description.
    pub message: Option<String>,
}

// ============================================================================
// Control Messages
// ============================================================================

/// Ping for liveness and latency measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp when ping was sent.
    pub timestamp: u64,
}

/// Pong response to ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Original timestamp from ping.
    pub timestamp: u64,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Whether retrying may succeed.
    pub recoverable: bool,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Path outside the sandbox or unresolvable.
    AccessDenied,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Server-side error.
    InternalError,
    /// Protocol version mismatch.
    VersionMismatch,
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl Envelope {
    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> std::result::Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> std::result::Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_envelope(msg: Message) {
        let envelope = Envelope::new(42, msg);
        let bytes = envelope.to_msgpack().expect("serialization failed");
        let decoded = Envelope::from_msgpack(&bytes).expect("deserialization failed");
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_envelope_version() {
        let envelope = Envelope::new(1, Message::Ping(Ping { timestamp: 12345 }));
        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert!(envelope.check_version().is_ok());
    }

    #[test]
    fn test_envelope_version_mismatch() {
        let mut envelope = Envelope::new(1, Message::Ping(Ping { timestamp: 0 }));
        envelope.version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            envelope.check_version(),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_listing_with_symlink_roundtrip() {
        roundtrip_envelope(Message::DirectoryListing(DirectoryListing {
            entries: vec![
                FileEntry {
                    name: "photos".to_string(),
                    path: "media/photos".to_string(),
                    entry_type: EntryType::Directory,
                    kind: FileKind::Folder,
                    is_dir: true,
                    is_symlink: false,
                    size: 0,
                    mode: 0o40755,
                    modified: 1704067200,
                    symlink_target: None,
                },
                FileEntry {
                    name: "latest log.txt".to_string(),
                    path: "media/latest log.txt".to_string(),
                    entry_type: EntryType::Symlink,
                    kind: FileKind::Document,
                    is_dir: false,
                    is_symlink: true,
                    size: 12,
                    mode: 0o100644,
                    modified: 1704067200,
                    symlink_target: Some("../logs/2024.txt".to_string()),
                },
            ],
            current_path: "media".to_string(),
            parent_path: String::new(),
        }));
    }

    #[test]
    fn test_upload_request_keeps_binary_payload() {
        roundtrip_envelope(Message::SaveUploads(SaveUploads {
            target_dir: "uploads".to_string(),
            files: vec![UploadFile {
                filename: "image.png".to_string(),
                data: vec![0x89, b'P', b'N', b'G', 0x00, 0xff],
            }],
        }));
    }

    #[test]
    fn test_file_info_roundtrip() {
        roundtrip_envelope(Message::FileInfo(FileInfo {
            input_path: "/a0/notes.md".to_string(),
            path: "notes.md".to_string(),
            exists: true,
            is_file: true,
            size: 42,
            modified: 1704067200.5,
            created: 1704067100.25,
            permissions: 0o100644,
            file_name: "notes.md".to_string(),
            file_ext: ".md".to_string(),
            ..FileInfo::default()
        }));
    }

    #[test]
    fn test_message_is_adjacently_tagged() {
        let json = serde_json::to_value(Message::DeleteEntry(DeleteEntry {
            path: "old.txt".to_string(),
        }))
        .unwrap();
        assert_eq!(json["type"], "DeleteEntry");
        assert_eq!(json["data"]["path"], "old.txt");
    }

    #[test]
    fn test_file_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&FileKind::Folder).unwrap(), "\"folder\"");
        assert_eq!(serde_json::to_string(&EntryType::Symlink).unwrap(), "\"symlink\"");
    }

    #[test]
    fn test_upload_result_partitions() {
        let result = UploadResult {
            outcomes: vec![
                UploadOutcome::saved("a.txt", "a.txt", "00".to_string()),
                UploadOutcome::failed("b.exe", "File type not allowed"),
            ],
        };
        assert_eq!(result.successful().count(), 1);
        assert_eq!(result.failed().next().unwrap().filename, "b.exe");
        assert!(!result.all_failed());
        assert!(!UploadResult::default().all_failed());
    }

    #[test]
    fn test_message_name() {
        assert_eq!(Message::Ping(Ping { timestamp: 0 }).name(), "Ping");
        assert_eq!(Message::DirectoryListing(DirectoryListing::empty()).name(), "DirectoryListing");
    }
}
