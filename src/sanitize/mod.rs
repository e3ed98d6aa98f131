// Identifier and path validation for per-item side effects
//
// Item IDs end up in directory names, branch names and log prefixes, so every
// ID is checked here before a worker is allowed to act on it.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("Identifier is empty")]
    Empty,

    #[error("Identifier contains path traversal: {0:?}")]
    Traversal(String),

    #[error("Identifier is an absolute path: {0:?}")]
    AbsolutePath(String),

    #[error("Identifier starts with a drive letter: {0:?}")]
    DriveLetter(String),

    #[error("Identifier {id:?} contains invalid character {ch:?}")]
    InvalidCharacter { id: String, ch: char },

    #[error("Failed to resolve path {path:?}: {message}")]
    Unresolvable { path: PathBuf, message: String },

    #[error("Path {path:?} escapes base directory {base:?}")]
    OutsideBase { path: PathBuf, base: PathBuf },
}

/// Validate an item identifier.
///
/// Accepts only `[A-Za-z0-9_-]`, and returns the identifier unchanged on success.
pub fn sanitize_identifier(id: &str) -> Result<&str, SanitizeError> {
    if id.is_empty() {
        return Err(SanitizeError::Empty);
    }

    if id.contains("..") {
        return Err(SanitizeError::Traversal(id.to_string()));
    }

    if id.starts_with('/') || id.starts_with('\\') {
        return Err(SanitizeError::AbsolutePath(id.to_string()));
    }

    if has_drive_prefix(id) {
        return Err(SanitizeError::DriveLetter(id.to_string()));
    }

    if let Some(ch) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(SanitizeError::InvalidCharacter {
            id: id.to_string(),
            ch,
        });
    }

    Ok(id)
}

fn has_drive_prefix(id: &str) -> bool {
    let mut chars = id.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
    )
}

/// Resolve `path` and ensure it stays inside `base_dir`.
///
/// Both sides are made absolute and canonical. Symlinks are resolved for every
/// component that exists on disk, including dangling ones; components that do
/// not exist yet are normalized lexically, so a not-yet-created output
/// directory can be checked before it is created. A relative `path` is taken relative to `base_dir`.
/// The base directory itself is accepted.
pub fn sanitize_path(path: &Path, base_dir: &Path) -> Result<PathBuf, SanitizeError> {
    let base = resolve(base_dir)?;
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let resolved = resolve(&joined)?;

    if !resolved.starts_with(&base) {
        log::warn!(
            "[Sanitize] Rejected path {:?} outside of base {:?}",
            resolved,
            base
        );
        return Err(SanitizeError::OutsideBase {
            path: resolved,
            base,
        });
    }

    Ok(resolved)
}

/// Symlinks followed per resolution before giving up (same limit as Linux)
const MAX_SYMLINK_HOPS: usize = 40;

/// Non-strict canonicalization.
///
/// Every component that exists is checked with `symlink_metadata`; a symlink,
/// dangling or not, is replaced by its target and resolution continues inside
/// the target. Components that do not exist are kept as they are, and `..`
/// pops the last resolved component, so a later component that exists again
/// is still checked.
fn resolve(path: &Path) -> Result<PathBuf, SanitizeError> {
    let unresolvable = |e: io::Error| SanitizeError::Unresolvable {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_err(unresolvable)?.join(path)
    };

    let mut pending: VecDeque<PathBuf> = absolute
        .components()
        .map(|c| PathBuf::from(c.as_os_str()))
        .collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(next) = pending.pop_front() {
        match next.components().next() {
            // Pushing a root replaces everything resolved so far
            Some(Component::Prefix(_)) | Some(Component::RootDir) => resolved.push(&next),
            Some(Component::CurDir) | None => {}
            Some(Component::ParentDir) => {
                resolved.pop();
            }
            Some(Component::Normal(part)) => {
                resolved.push(part);
                match fs::symlink_metadata(&resolved) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        hops += 1;
                        if hops > MAX_SYMLINK_HOPS {
                            return Err(unresolvable(io::Error::new(
                                io::ErrorKind::Other,
                                "too many levels of symbolic links",
                            )));
                        }
                        let target = fs::read_link(&resolved).map_err(unresolvable)?;
                        resolved.pop();
                        for component in target.components().rev() {
                            pending.push_front(PathBuf::from(component.as_os_str()));
                        }
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(unresolvable(e)),
                }
            }
        }
    }

    Ok(resolved)
}
