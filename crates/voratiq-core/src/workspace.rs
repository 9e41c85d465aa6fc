//! Per-agent workspace scaffolding: the canonical directory layout, the git
//! worktree, linked environment dependencies, and the in-workspace shim.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::{RunError, RunErrorKind};
use crate::git_ops;
use crate::path_guard;
use crate::types::EnvironmentConfig;

/// The fixed directory layout under `.voratiq/runs/sessions/<runId>/<agentId>/`.
pub struct AgentPaths {
    pub agent_root: PathBuf,
    pub sandbox: PathBuf,
    pub runtime: PathBuf,
    pub artifacts: PathBuf,
    pub evals: PathBuf,
    pub workspace: PathBuf,
}

impl AgentPaths {
    pub fn new(runs_dir: &Path, run_id: &str, agent_id: &str) -> Self {
        let agent_root = runs_dir.join("sessions").join(run_id).join(agent_id);
        Self {
            sandbox: agent_root.join("sandbox"),
            runtime: agent_root.join("runtime"),
            artifacts: agent_root.join("artifacts"),
            evals: agent_root.join("evals"),
            workspace: agent_root.join("workspace"),
            agent_root,
        }
    }
}

/// `voratiq/run/<runId>/<agentId>` — the branch each agent's worktree is
/// created on.
pub fn branch_name(run_id: &str, agent_id: &str) -> String {
    format!("voratiq/run/{run_id}/{agent_id}")
}

/// Create the fixed directory tree (everything except the worktree itself,
/// which git creates) and remove any pre-existing `tmp/` left over from a
/// previous, interrupted attempt at the same agent root.
pub fn scaffold(paths: &AgentPaths) -> Result<()> {
    for dir in [&paths.sandbox, &paths.runtime, &paths.artifacts, &paths.evals] {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    remove_pending_tmp(&paths.agent_root)?;
    Ok(())
}

fn remove_pending_tmp(agent_root: &Path) -> Result<()> {
    let tmp = agent_root.join("tmp");
    match fs::remove_dir_all(&tmp) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove stale {}", tmp.display())),
    }
}

/// Create the git worktree at `paths.workspace`, rooted at `base_revision_sha`
/// on a fresh branch. Fails with [`RunErrorKind::WorkspaceSetup`] on any git
/// failure (wrapped from the underlying [`RunErrorKind::GitOperation`]).
pub fn create_worktree(
    repo_root: &Path,
    paths: &AgentPaths,
    run_id: &str,
    agent_id: &str,
    base_revision_sha: &str,
) -> Result<()> {
    let branch = branch_name(run_id, agent_id);
    git_ops::create_worktree(repo_root, &paths.workspace, &branch, base_revision_sha)
        .map_err(|err| wrap_as_workspace_setup(err, "failed to create worktree"))?;
    path_guard::assert_within(&paths.agent_root, &paths.workspace)?;
    Ok(())
}

fn wrap_as_workspace_setup(err: anyhow::Error, context: &str) -> anyhow::Error {
    if RunError::kind_of(&err).is_some() {
        err.context(context.to_string())
    } else {
        RunError::err(RunErrorKind::WorkspaceSetup, format!("{context}: {err}"))
    }
}

/// Bin-directory paths (relative to the worktree) contributed by linked
/// environment dependencies, for the manifest's PATH construction.
#[derive(Debug, Clone, Default)]
pub struct LinkedEnvironment {
    pub node_bin_relatives: Vec<String>,
    pub venv_bin_relative: Option<String>,
}

/// Symlink (falling back to a recursive copy on platforms without symlink
/// support) the repo's declared node `node_modules` directories and python
/// virtualenv into the worktree at matching relative locations.
pub fn link_environment(
    repo_root: &Path,
    paths: &AgentPaths,
    environment: &EnvironmentConfig,
) -> Result<LinkedEnvironment> {
    let mut linked = LinkedEnvironment::default();

    for root in &environment.node_dependency_roots {
        path_guard::assert_repo_relative(root)
            .map_err(|_| RunError::err(RunErrorKind::WorkspaceSetup, format!("invalid node dependency root: {root}")))?;
        let source = repo_root.join(root).join("node_modules");
        if !source.exists() {
            continue;
        }
        let destination_parent = paths.workspace.join(root);
        fs::create_dir_all(&destination_parent).with_context(|| {
            format!("failed to create {}", destination_parent.display())
        })?;
        let destination = destination_parent.join("node_modules");
        link_or_copy(&source, &destination)?;
        linked
            .node_bin_relatives
            .push(format!("{root}/node_modules/.bin"));
    }

    if let Some(venv_path) = &environment.python_venv_path {
        path_guard::assert_repo_relative(venv_path).map_err(|_| {
            RunError::err(
                RunErrorKind::WorkspaceSetup,
                format!("invalid python venv path: {venv_path}"),
            )
        })?;
        let source = repo_root.join(venv_path);
        if source.exists() {
            let destination = paths.workspace.join(venv_path);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            link_or_copy(&source, &destination)?;
            let bin_dir_name = if cfg!(windows) { "Scripts" } else { "bin" };
            linked.venv_bin_relative = Some(format!("{venv_path}/{bin_dir_name}"));
        }
    }

    Ok(linked)
}

#[cfg(unix)]
fn link_or_copy(source: &Path, destination: &Path) -> Result<()> {
    std::os::unix::fs::symlink(source, destination)
        .with_context(|| format!("failed to symlink {} -> {}", destination.display(), source.display()))
}

#[cfg(not(unix))]
fn link_or_copy(source: &Path, destination: &Path) -> Result<()> {
    copy_dir_recursive(source, destination)
}

#[cfg(not(unix))]
fn copy_dir_recursive(source: &Path, destination: &Path) -> Result<()> {
    fs::create_dir_all(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    for entry in fs::read_dir(source)
        .with_context(|| format!("failed to read {}", source.display()))?
    {
        let entry = entry.context("failed to read directory entry")?;
        let target = destination.join(entry.file_name());
        if entry.file_type().context("failed to stat entry")?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy to {}", target.display()))?;
        }
    }
    Ok(())
}

/// Write a marker file inside the worktree that mediates (and documents) the
/// agent's filesystem footprint for later audit; the sandbox launcher
/// consults the sandbox policy for actual enforcement.
pub fn write_shim(paths: &AgentPaths, agent_id: &str) -> Result<()> {
    let shim_path = paths.workspace.join(".voratiq-shim.json");
    let contents = serde_json::json!({
        "agentId": agent_id,
        "note": "Files under this worktree are isolated from the user's working copy; \
                 the sandbox policy in runtime/sandbox.json governs actual write access.",
    });
    fs::write(&shim_path, serde_json::to_string_pretty(&contents)?)
        .with_context(|| format!("failed to write {}", shim_path.display()))?;
    Ok(())
}

/// Remove the entire agent root, used by the cleanup path when scaffolding
/// fails partway through.
pub fn remove_agent_root(paths: &AgentPaths) -> Result<()> {
    match fs::remove_dir_all(&paths.agent_root) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", paths.agent_root.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn branch_name_follows_the_convention() {
        assert_eq!(
            branch_name("20260101-000000-abcde", "alpha"),
            "voratiq/run/20260101-000000-abcde/alpha"
        );
    }

    #[test]
    fn scaffold_creates_expected_directories_and_clears_stale_tmp() {
        let td = tempdir().expect("tempdir");
        let paths = AgentPaths::new(td.path(), "run-1", "alpha");
        fs::create_dir_all(paths.agent_root.join("tmp").join("leftover")).expect("mkdir");

        scaffold(&paths).expect("scaffold");

        assert!(paths.sandbox.is_dir());
        assert!(paths.runtime.is_dir());
        assert!(paths.artifacts.is_dir());
        assert!(paths.evals.is_dir());
        assert!(!paths.agent_root.join("tmp").exists());
    }

    #[test]
    fn link_environment_skips_missing_roots_without_error() {
        let td = tempdir().expect("tempdir");
        let repo_root = td.path().join("repo");
        fs::create_dir_all(&repo_root).expect("mkdir");
        let paths = AgentPaths::new(td.path(), "run-1", "alpha");
        fs::create_dir_all(&paths.workspace).expect("mkdir");

        let environment = EnvironmentConfig {
            node_dependency_roots: vec!["frontend".to_string()],
            python_venv_path: None,
        };
        let linked = link_environment(&repo_root, &paths, &environment).expect("link");
        assert!(linked.node_bin_relatives.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn link_environment_symlinks_existing_node_modules() {
        let td = tempdir().expect("tempdir");
        let repo_root = td.path().join("repo");
        fs::create_dir_all(repo_root.join("frontend/node_modules/.bin")).expect("mkdir");
        let paths = AgentPaths::new(td.path(), "run-1", "alpha");
        fs::create_dir_all(&paths.workspace).expect("mkdir");

        let environment = EnvironmentConfig {
            node_dependency_roots: vec!["frontend".to_string()],
            python_venv_path: None,
        };
        let linked = link_environment(&repo_root, &paths, &environment).expect("link");
        assert_eq!(linked.node_bin_relatives, vec!["frontend/node_modules/.bin"]);
        assert!(paths.workspace.join("frontend/node_modules").exists());
    }

    #[test]
    fn write_shim_produces_valid_json() {
        let td = tempdir().expect("tempdir");
        let paths = AgentPaths::new(td.path(), "run-1", "alpha");
        fs::create_dir_all(&paths.workspace).expect("mkdir");
        write_shim(&paths, "alpha").expect("write shim");
        let content = fs::read_to_string(paths.workspace.join(".voratiq-shim.json")).expect("read");
        let _: serde_json::Value = serde_json::from_str(&content).expect("valid json");
    }
}
