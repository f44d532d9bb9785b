//! Lexical path validation for blob references.
//!
//! Every manifest-relative or archive-relative path passes through
//! [`resolve_within`] before a file handle is opened. The check is purely
//! lexical: no filesystem access, no symlink resolution.

use crate::error::{BackupError, Result};
use std::path::{Component, Path, PathBuf};

/// Lexically normalise a path: drop `.` segments and fold `name/..` pairs.
///
/// Leading `..` segments that cannot be folded are kept, so callers can
/// detect an escape by checking the first component.
pub fn clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(comp),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_os_str()).collect()
}

fn starts_with_parent(path: &Path) -> bool {
    matches!(path.components().next(), Some(Component::ParentDir))
}

/// Resolve `relative` against `base`, rejecting anything that would land
/// outside `base`.
///
/// Backslashes are treated as separators so archive entries written on
/// other platforms cannot smuggle `..\` segments past the check.
pub fn resolve_within(base: &Path, relative: &str) -> Result<PathBuf> {
    if base.as_os_str().is_empty() {
        return Err(BackupError::PathUnsafe("empty base directory".into()));
    }
    if relative.is_empty() {
        return Err(BackupError::PathUnsafe("empty relative path".into()));
    }
    if relative.contains('\0') {
        return Err(BackupError::PathUnsafe(format!("{relative:?} contains NUL")));
    }

    let normalized = relative.replace('\\', "/");
    let cleaned = clean(Path::new(&normalized));

    if cleaned.as_os_str().is_empty() {
        return Err(BackupError::PathUnsafe(format!("{relative:?} resolves to the base directory")));
    }
    if cleaned.has_root() || cleaned.is_absolute() {
        return Err(BackupError::PathUnsafe(format!("{relative:?} is absolute")));
    }
    if starts_with_parent(&cleaned) {
        return Err(BackupError::PathUnsafe(format!("{relative:?} escapes base directory")));
    }

    let base_clean = clean(base);
    let joined = clean(&base_clean.join(&cleaned));
    match joined.strip_prefix(&base_clean) {
        Ok(rest) if !rest.as_os_str().is_empty() && !starts_with_parent(rest) => Ok(joined),
        _ => Err(BackupError::PathUnsafe(format!("{relative:?} escapes base directory"))),
    }
}

/// Whether `relative` would be accepted by [`resolve_within`].
pub fn is_safe(base: &Path, relative: &str) -> bool {
    resolve_within(base, relative).is_ok()
}
