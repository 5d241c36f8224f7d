//! Path confinement
//!
//! Every filesystem path a sandboxed unit touches is resolved to its real
//! location (symlinks followed, `..` removed) and must land inside one of the
//! policy's allowed directories. Paths that do not exist yet are resolved
//! through their deepest existing ancestor, so a dangling tail cannot hide a
//! symlinked parent. Dangling links are followed to their target.

use crate::error::{Error, Result};
use crate::policy::Policy;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Longest symlink chain followed before a path is treated as unresolvable
const MAX_SYMLINK_HOPS: usize = 40;

/// Checks paths against a policy's allowed directories
#[derive(Debug, Clone)]
pub struct PathValidator {
    base: Option<PathBuf>,
    allowed: Option<Vec<PathBuf>>,
}

impl PathValidator {
    /// Build a validator for `policy`
    ///
    /// The allow-list is `allowed_paths`, or `working_dir` when that is empty.
    /// With neither configured, every path is accepted.
    #[must_use]
    pub fn new(policy: &Policy) -> Self {
        let base = policy.working_dir().map(Path::to_path_buf);
        let allowed = policy.effective_allowed_paths().map(|dirs| {
            dirs.iter()
                .map(|dir| {
                    let absolute = absolutize(dir, base.as_deref());
                    resolve(&absolute).unwrap_or(absolute)
                })
                .collect()
        });
        Self { base, allowed }
    }

    /// Whether any confinement is in effect
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.allowed.is_some()
    }

    /// Resolve `path` and verify it lies inside an allowed directory
    ///
    /// Returns the resolved path that callers should use for the actual I/O.
    pub fn validate(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let original = path.as_ref();
        let absolute = absolutize(original, self.base.as_deref());
        let resolved = resolve(&absolute);

        let Some(allowed) = &self.allowed else {
            debug!(path = %original.display(), "no path restrictions configured");
            return Ok(resolved.unwrap_or(absolute));
        };

        if let Some(resolved) = resolved.as_ref() {
            if allowed.iter().any(|dir| resolved.starts_with(dir)) {
                debug!(
                    original = %original.display(),
                    resolved = %resolved.display(),
                    "path validated"
                );
                return Ok(resolved.clone());
            }
        }

        warn!(
            original = %original.display(),
            resolved = ?resolved,
            "path outside allowed directories"
        );
        Err(Error::denied(format!(
            "path \"{}\" is outside allowed directories",
            original.display()
        )))
    }
}

/// Make `path` absolute against `base` (or the process working directory)
fn absolutize(path: &Path, base: Option<&Path>) -> PathBuf {
    if path.is_absolute() {
        return clean(path);
    }
    let base = match base {
        Some(base) if base.is_absolute() => base.to_path_buf(),
        Some(base) => std::env::current_dir().unwrap_or_default().join(base),
        None => std::env::current_dir().unwrap_or_default(),
    };
    clean(&base.join(path))
}

/// Lexically normalize: drop `.` and fold `..` into its parent
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir | Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Follow symlinks through the deepest existing ancestor of `path`
///
/// `None` when the path cannot be resolved: a symlink loop, an unreadable
/// ancestor, or a chain longer than [`MAX_SYMLINK_HOPS`].
fn resolve(path: &Path) -> Option<PathBuf> {
    let mut missing = Vec::new();
    let mut cursor = path.to_path_buf();
    let mut hops = 0;
    loop {
        match cursor.canonicalize() {
            Ok(real) => {
                return Some(
                    missing
                        .iter()
                        .rev()
                        .fold(real, |acc: PathBuf, name| acc.join(name)),
                );
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let is_link = cursor
                    .symlink_metadata()
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false);
                if is_link {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return None;
                    }
                    let target = std::fs::read_link(&cursor).ok()?;
                    let parent = cursor.parent().map(Path::to_path_buf).unwrap_or_default();
                    cursor = clean(&parent.join(target));
                    continue;
                }
                let name = cursor.file_name()?.to_os_string();
                missing.push(name);
                cursor = cursor.parent()?.to_path_buf();
            }
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_clean_folds_parent_dirs() {
        assert_eq!(clean(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(clean(Path::new("/../../etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn test_unrestricted_allows_anything() {
        let validator = PathValidator::new(&Policy::new());
        assert!(!validator.is_restricted());
        assert!(validator.validate("/etc/passwd").is_ok());
    }

    #[test]
    fn test_inside_and_outside() {
        let dir = tempfile::tempdir().unwrap();
        let validator = PathValidator::new(&Policy::new().allow_path(dir.path()));

        let inside = dir.path().join("notes.txt");
        assert!(validator.validate(&inside).is_ok());

        let err = validator.validate("/etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
        assert!(err.to_string().contains("\"/etc/passwd\""));
        assert!(err.to_string().contains("outside allowed directories"));
    }

    #[test]
    fn test_traversal_is_folded_before_check() {
        let dir = tempfile::tempdir().unwrap();
        let validator = PathValidator::new(&Policy::new().allow_path(dir.path()));
        let sneaky = dir.path().join("..").join("..").join("etc").join("passwd");
        assert!(validator.validate(sneaky).is_err());
    }

    #[test]
    fn test_sibling_prefix_is_not_inside() {
        let root = tempfile::tempdir().unwrap();
        let allowed = root.path().join("data");
        let sibling = root.path().join("data-evil");
        std::fs::create_dir_all(&allowed).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();

        let validator = PathValidator::new(&Policy::new().allow_path(&allowed));
        assert!(validator.validate(sibling.join("x")).is_err());
        assert!(validator.validate(allowed.join("x")).is_ok());
    }

    #[test]
    fn test_relative_resolves_against_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let validator = PathValidator::new(&Policy::new().with_working_dir(dir.path()));
        let resolved = validator.validate("sub/file.txt").unwrap();
        assert!(resolved.ends_with("sub/file.txt"));
        assert!(validator.validate("../outside.txt").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), allowed.path().join("link")).unwrap();

        let validator = PathValidator::new(&Policy::new().allow_path(allowed.path()));
        assert!(validator.validate(allowed.path().join("link/secret")).is_err());
        // Nonexistent tail under the symlinked directory
        assert!(validator
            .validate(allowed.path().join("link/new/deeper.txt"))
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_resolves_to_its_target() {
        let allowed = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let validator = PathValidator::new(&Policy::new().allow_path(allowed.path()));

        let escape = allowed.path().join("escape");
        std::os::unix::fs::symlink(outside.path().join("planted.txt"), &escape).unwrap();
        assert!(validator.validate(&escape).is_err());
        // Dangling link used as a directory
        assert!(validator.validate(escape.join("deeper.txt")).is_err());

        let local = allowed.path().join("local");
        std::os::unix::fs::symlink("target.txt", &local).unwrap();
        let resolved = validator.validate(&local).unwrap();
        assert_eq!(
            resolved,
            allowed.path().canonicalize().unwrap().join("target.txt")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_is_denied() {
        let allowed = tempfile::tempdir().unwrap();
        let a = allowed.path().join("a");
        let b = allowed.path().join("b");
        std::os::unix::fs::symlink(&b, &a).unwrap();
        std::os::unix::fs::symlink(&a, &b).unwrap();

        let validator = PathValidator::new(&Policy::new().allow_path(allowed.path()));
        let err = validator.validate(&a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
    }
}
