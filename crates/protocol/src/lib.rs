//! # Workbox Protocol Library
//!
//! Wire types shared by the Workbox boundary layer and its execution
//! environments.
//!
//! ## Overview
//!
//! Every file operation is expressed as a plain request record and answered
//! with a plain response record. The boundary layer never touches the host
//! filesystem directly; it hands a request to an executor, which either
//! handles it in-process or forwards it across a local socket to a daemon
//! that owns the sandboxed work directory.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Request / Response records         │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │        Transport (Unix socket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, FrameCodec, Message};
//! use protocol::messages::ListDirectory;
//!
//! let message = Message::ListDirectory(ListDirectory {
//!     path: "$WORK_DIR".to_string(),
//! });
//! let envelope = Envelope::new(1, message);
//!
//! let codec = FrameCodec::new();
//! let bytes = codec.encode_envelope(&envelope).unwrap();
//! let (decoded, _) = codec.try_decode_envelope(&bytes).unwrap().unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE,
};
pub use messages::{
    DirectoryListing, EntryType, Envelope, ErrorCode, ErrorMessage, FileEntry, FileInfo,
    FileKind, Message, UploadOutcome, UploadResult, PROTOCOL_VERSION,
};
