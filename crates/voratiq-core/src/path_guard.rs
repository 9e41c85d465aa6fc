//! Root-confinement checks used everywhere a path crosses a trust boundary:
//! credential staging destinations, workspace scaffolding, promoted artifacts.
//!
//! Failures here are fatal and surface as [`RunErrorKind::WorkspaceSetup`].

use std::path::Path;

use anyhow::Result;

use crate::error::{RunError, RunErrorKind};

/// Rejects absolute paths, `..` components, backslashes, and null bytes.
pub fn assert_repo_relative(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(RunError::err(
            RunErrorKind::WorkspaceSetup,
            "path must not be empty",
        ));
    }
    if path.contains('\0') {
        return Err(RunError::err(
            RunErrorKind::WorkspaceSetup,
            format!("path contains a null byte: {path}"),
        ));
    }
    if path.contains('\\') {
        return Err(RunError::err(
            RunErrorKind::WorkspaceSetup,
            format!("path must use forward slashes: {path}"),
        ));
    }
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Err(RunError::err(
            RunErrorKind::WorkspaceSetup,
            format!("path must be repo-relative, got absolute path: {path}"),
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(RunError::err(
            RunErrorKind::WorkspaceSetup,
            format!("path must not contain '..': {path}"),
        ));
    }
    Ok(())
}

/// After canonicalization, `candidate` must be a descendant of `root` or equal
/// to it. Neither path needs to exist yet on the filesystem for the prefix
/// check itself, but canonicalization requires existing ancestors, so callers
/// typically call this after creating the enclosing directories.
pub fn assert_within(root: &Path, candidate: &Path) -> Result<()> {
    let root_canon = canonicalize_best_effort(root);
    let candidate_canon = canonicalize_best_effort(candidate);

    if candidate_canon == root_canon || candidate_canon.starts_with(&root_canon) {
        Ok(())
    } else {
        Err(RunError::err(
            RunErrorKind::WorkspaceSetup,
            format!(
                "path {} escapes confinement root {}",
                candidate.display(),
                root.display()
            ),
        ))
    }
}

/// Canonicalize what exists, and lexically append what doesn't, so callers can
/// confinement-check a path whose leaf component has not been created yet.
fn canonicalize_best_effort(path: &Path) -> std::path::PathBuf {
    if let Ok(canon) = path.canonicalize() {
        return canon;
    }
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canon) => {
                let mut result = canon;
                for component in tail.into_iter().rev() {
                    result.push(component);
                }
                return result;
            }
            Err(_) => {
                let Some(parent) = existing.parent() else {
                    return path.to_path_buf();
                };
                if let Some(name) = existing.file_name() {
                    tail.push(name.to_os_string());
                }
                existing = parent;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn repo_relative_accepts_simple_paths() {
        assert!(assert_repo_relative("a/b/c.txt").is_ok());
    }

    #[test]
    fn repo_relative_rejects_absolute() {
        assert!(assert_repo_relative("/etc/passwd").is_err());
    }

    #[test]
    fn repo_relative_rejects_parent_dir() {
        assert!(assert_repo_relative("a/../../etc/passwd").is_err());
    }

    #[test]
    fn repo_relative_rejects_backslash() {
        assert!(assert_repo_relative("a\\b").is_err());
    }

    #[test]
    fn repo_relative_rejects_null_byte() {
        assert!(assert_repo_relative("a\0b").is_err());
    }

    #[test]
    fn within_accepts_descendant() {
        let td = tempdir().expect("tempdir");
        let child = td.path().join("nested");
        std::fs::create_dir_all(&child).expect("mkdir");
        assert!(assert_within(td.path(), &child).is_ok());
    }

    #[test]
    fn within_accepts_root_itself() {
        let td = tempdir().expect("tempdir");
        assert!(assert_within(td.path(), td.path()).is_ok());
    }

    #[test]
    fn within_rejects_escape_via_parent() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("root");
        std::fs::create_dir_all(&root).expect("mkdir");
        let escape = td.path().join("outside");
        std::fs::create_dir_all(&escape).expect("mkdir");
        assert!(assert_within(&root, &escape).is_err());
    }

    #[test]
    fn within_accepts_not_yet_created_leaf() {
        let td = tempdir().expect("tempdir");
        let leaf = td.path().join("not-yet-created.json");
        assert!(assert_within(td.path(), &leaf).is_ok());
    }
}
