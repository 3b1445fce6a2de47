//! Path confinement.
//!
//! Every path a caller supplies is resolved to a canonical absolute form and
//! checked against a fixed set of allowed roots before any other file
//! operation sees it. Containment is tested component by component, so a
//! sibling such as `/a0-evil` is never mistaken for a child of `/a0`.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Symlinks followed while resolving a single path before giving up.
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Why a path was refused.
///
/// The `Display` text carries the offending path and is meant for
/// operator-facing logs. Callers outside the boundary only ever see a generic
/// denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathRejection {
    #[error("path is empty")]
    Empty,

    #[error("path contains a NUL byte")]
    NulByte,

    #[error("path is not absolute: {}", .0.display())]
    NotAbsolute(PathBuf),

    #[error("too many levels of symbolic links resolving {}", .0.display())]
    SymlinkLoop(PathBuf),

    #[error("path {} is outside allowed directories {roots:?}", path.display())]
    OutsideRoots { path: PathBuf, roots: Vec<PathBuf> },

    #[error("no allowed roots configured")]
    NoRoots,
}

/// The sandbox boundary: an ordered, non-empty set of canonical directories.
///
/// The first root is the sandbox root that relative paths resolve against.
#[derive(Debug, Clone)]
pub struct AllowedRoots {
    roots: Vec<PathBuf>,
}

impl AllowedRoots {
    /// Canonicalize each root once and build the boundary.
    pub fn new<I, P>(roots: I) -> Result<Self, PathRejection>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut canonical = Vec::new();
        for root in roots {
            let root = root.as_ref();
            check_syntax(root)?;
            let resolved = resolve_lenient(root)?;
            if !canonical.contains(&resolved) {
                canonical.push(resolved);
            }
        }

        if canonical.is_empty() {
            return Err(PathRejection::NoRoots);
        }

        tracing::debug!(roots = ?canonical, "Sandbox roots resolved");
        Ok(Self { roots: canonical })
    }

    /// The sandbox root.
    pub fn primary(&self) -> &Path {
        &self.roots[0]
    }

    /// All roots in order.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Confine an absolute path to the boundary.
    pub fn validate(&self, path: impl AsRef<Path>) -> Result<ValidatedPath, PathRejection> {
        let path = path.as_ref();
        check_syntax(path)?;

        let canonical = resolve_lenient(path)?;
        match self.roots.iter().position(|root| canonical.starts_with(root)) {
            Some(index) => Ok(ValidatedPath {
                canonical,
                root: self.roots[index].clone(),
                primary: index == 0,
            }),
            None => Err(PathRejection::OutsideRoots {
                path: path.to_path_buf(),
                roots: self.roots.clone(),
            }),
        }
    }

    /// Join a possibly relative path onto `base`, then confine it.
    ///
    /// Absolute input is validated as-is. Relative input never resolves
    /// against the process working directory.
    pub fn resolve_relative(
        &self,
        path: impl AsRef<Path>,
        base: impl AsRef<Path>,
    ) -> Result<ValidatedPath, PathRejection> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(PathRejection::Empty);
        }
        if path.is_absolute() {
            self.validate(path)
        } else {
            self.validate(base.as_ref().join(path))
        }
    }

    /// Resolve a request path against the sandbox root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<ValidatedPath, PathRejection> {
        self.resolve_relative(path, self.primary())
    }
}

/// A canonical absolute path known to lie inside one of the allowed roots.
///
/// Only [`AllowedRoots`] constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPath {
    canonical: PathBuf,
    root: PathBuf,
    primary: bool,
}

impl ValidatedPath {
    /// The canonical absolute path.
    pub fn as_path(&self) -> &Path {
        &self.canonical
    }

    /// The root this path was matched against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether this path is the matched root itself.
    pub fn is_root(&self) -> bool {
        self.canonical == self.root
    }

    /// Whether the matched root is the sandbox root.
    pub fn in_primary(&self) -> bool {
        self.primary
    }

    /// The path as reported to callers.
    ///
    /// Below the sandbox root this is the path relative to it, empty for the
    /// root itself. Under any other root it is the canonical absolute path,
    /// which resolves back to the same place when passed in again.
    pub fn relative(&self) -> &Path {
        if !self.primary {
            return &self.canonical;
        }
        self.canonical
            .strip_prefix(&self.root)
            .unwrap_or_else(|_| Path::new(""))
    }

    /// [`relative`](Self::relative) as a display string.
    pub fn relative_string(&self) -> String {
        self.relative().to_string_lossy().into_owned()
    }

    /// Consume and return the canonical path.
    pub fn into_path_buf(self) -> PathBuf {
        self.canonical
    }
}

impl AsRef<Path> for ValidatedPath {
    fn as_ref(&self) -> &Path {
        &self.canonical
    }
}

fn check_syntax(path: &Path) -> Result<(), PathRejection> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(PathRejection::Empty);
    }
    if bytes.contains(&0) {
        return Err(PathRejection::NulByte);
    }
    if !path.is_absolute() {
        return Err(PathRejection::NotAbsolute(path.to_path_buf()));
    }
    Ok(())
}

/// Canonicalize without requiring the path to exist.
///
/// Existing components are resolved through symlinks. Anything that cannot be
/// stat'ed (typically a component that does not exist yet) is appended
/// lexically, and a later `..` pops it again.
fn resolve_lenient(path: &Path) -> Result<PathBuf, PathRejection> {
    let mut pending: VecDeque<OsString> = VecDeque::new();
    push_components(&mut pending, path);

    let mut resolved = PathBuf::from("/");
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let candidate = resolved.join(&part);
        let is_link = fs::symlink_metadata(&candidate)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            resolved = candidate;
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(PathRejection::SymlinkLoop(path.to_path_buf()));
        }

        match fs::read_link(&candidate) {
            Ok(target) => {
                if target.is_absolute() {
                    resolved = PathBuf::from("/");
                }
                let mut rest = VecDeque::new();
                push_components(&mut rest, &target);
                rest.append(&mut pending);
                pending = rest;
            }
            Err(_) => resolved = candidate,
        }
    }

    Ok(resolved)
}

fn push_components(out: &mut VecDeque<OsString>, path: &Path) {
    for component in path.components() {
        match component {
            Component::Normal(name) => out.push_back(name.to_os_string()),
            Component::ParentDir => out.push_back(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
}
