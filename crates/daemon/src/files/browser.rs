//! Directory enumeration inside the sandbox.
//!
//! Listings are built from native `read_dir` and per-entry `lstat`/`stat`
//! calls. A single unreadable entry is skipped rather than failing the whole
//! listing, the number of entries is capped, and enumeration gives up once a
//! deadline passes.

use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use protocol::messages::{EntryType, FileEntry, FileKind};
use thiserror::Error;
use tracing::{debug, warn};

use super::guard::classify;
use super::sandbox::ValidatedPath;

/// Default cap on entries per listing.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Default enumeration deadline.
pub const DEFAULT_LISTING_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that abort a whole listing.
#[derive(Debug, Error)]
pub enum ListingError {
    /// The directory itself could not be opened or read.
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Enumeration ran past its deadline.
    #[error("directory listing timed out after {0:?}")]
    TimedOut(Duration),
}

/// Enumerates confined directories.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryLister {
    max_entries: usize,
    timeout: Duration,
}

impl Default for DirectoryLister {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_LISTING_TIMEOUT)
    }
}

impl DirectoryLister {
    /// Create a lister with an entry cap and an enumeration deadline.
    pub fn new(max_entries: usize, timeout: Duration) -> Self {
        Self {
            max_entries,
            timeout,
        }
    }

    /// How long a single listing may take.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// List `dir`, folders first.
    ///
    /// Entry paths are formed like [`ValidatedPath::relative`]. Once
    /// `max_entries` entries have been collected the rest are ignored.
    pub fn list(&self, dir: &ValidatedPath) -> Result<Vec<FileEntry>, ListingError> {
        let deadline = Instant::now() + self.timeout;
        let base = dir.relative();

        let read_dir = fs::read_dir(dir.as_path()).map_err(|source| ListingError::ReadDir {
            path: dir.relative_string(),
            source,
        })?;

        let mut folders = Vec::new();
        let mut files = Vec::new();

        for item in read_dir {
            if Instant::now() >= deadline {
                return Err(ListingError::TimedOut(self.timeout));
            }
            if folders.len() + files.len() >= self.max_entries {
                debug!(
                    path = %dir.relative_string(),
                    max_entries = self.max_entries,
                    "Listing truncated at entry cap"
                );
                break;
            }

            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!(path = %dir.relative_string(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let name = item.file_name().to_string_lossy().into_owned();
            let full = item.path();
            match describe(&full, &name, base) {
                Ok(Some(entry)) if entry.is_dir => folders.push(entry),
                Ok(Some(entry)) => files.push(entry),
                Ok(None) => debug!(name = %name, "Skipping special file"),
                Err(e) => warn!(name = %name, error = %e, "No access to entry, skipping"),
            }
        }

        sort_by_name(&mut folders);
        sort_by_name(&mut files);
        folders.append(&mut files);
        Ok(folders)
    }
}

/// Build the entry for one directory member.
///
/// Returns `Ok(None)` for sockets, FIFOs and device nodes.
fn describe(full: &Path, name: &str, base: &Path) -> std::io::Result<Option<FileEntry>> {
    let link_meta = fs::symlink_metadata(full)?;
    let is_symlink = link_meta.file_type().is_symlink();

    let (meta, symlink_target) = if is_symlink {
        let target = fs::read_link(full)
            .ok()
            .map(|t| t.to_string_lossy().into_owned());
        // A dangling link is still listed, described by the link itself.
        let resolved = fs::metadata(full).unwrap_or(link_meta);
        (resolved, target)
    } else {
        (link_meta, None)
    };

    let is_dir = meta.is_dir();
    if !is_symlink && !is_dir && !meta.is_file() {
        return Ok(None);
    }

    let entry_type = if is_symlink {
        EntryType::Symlink
    } else if is_dir {
        EntryType::Directory
    } else {
        EntryType::File
    };

    Ok(Some(FileEntry {
        name: name.to_string(),
        path: base.join(name).to_string_lossy().into_owned(),
        entry_type,
        kind: if is_dir { FileKind::Folder } else { classify(name) },
        is_dir,
        is_symlink,
        size: if meta.is_file() { meta.len() } else { 0 },
        mode: meta.mode(),
        modified: modified_secs(&meta),
        symlink_target,
    }))
}

fn modified_secs(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sort_by_name(entries: &mut [FileEntry]) {
    entries.sort_by_cached_key(|e| e.name.to_lowercase());
}
