//! Sandboxed file operations.
//!
//! - [`sandbox`] confines every path to the allowed roots
//! - [`guard`] admits or rejects upload candidates before storage is touched
//! - [`browser`] enumerates a confined directory
//! - [`service`] composes them into list, info, save and delete
//! - [`ops`] runs the same operations through an executor
//!
//! # Security
//!
//! Paths are canonicalized (symlinks included) and compared component by
//! component against each allowed root, so `/a0x` never passes for `/a0`.
//! Upload destinations are validated again after the filename is joined.

pub mod browser;
pub mod guard;
pub mod ops;
pub mod sandbox;
pub mod service;

pub use browser::{DirectoryLister, ListingError};
pub use guard::{classify, sanitize_filename, UploadGuard, UploadRejection};
pub use ops::{FileOps, DEFAULT_BATCH_BUDGET};
pub use sandbox::{AllowedRoots, PathRejection, ValidatedPath};
pub use service::{FileOpsError, FileService};
