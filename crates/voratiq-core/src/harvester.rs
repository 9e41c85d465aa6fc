//! Post-process sequence run against a finished agent's worktree: stage and
//! commit changes, capture the diff, and scan for leaked credential files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::{RunError, RunErrorKind};
use crate::git_ops;
use crate::types::DiffStatistics;

const KNOWN_CREDENTIAL_SUFFIXES: &[&str] = &[
    ".claude/.credentials.json",
    ".codex/auth.json",
    ".gemini/oauth_creds.json",
];

pub struct HarvestOutcome {
    pub commit_sha: String,
    pub diff_path: PathBuf,
    pub diff_statistics: DiffStatistics,
}

fn matches_known_credential_path(path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    KNOWN_CREDENTIAL_SUFFIXES
        .iter()
        .any(|suffix| path_str.ends_with(suffix))
}

/// Run the full harvest sequence: `add -A`, summary extraction, commit,
/// diff + shortstat capture, and credential-exclusion scan. Every git
/// failure surfaces as [`RunErrorKind::GitOperation`]; workspace-content
/// failures (no changes, empty summary, credential leak) surface as
/// [`RunErrorKind::AgentProcess`] per the agent-failure taxonomy.
pub fn harvest(
    worktree: &Path,
    artifacts_dir: &Path,
    base_revision_sha: &str,
    author_name: &str,
    author_email: &str,
) -> Result<HarvestOutcome> {
    git_ops::add_all(worktree)?;
    if !git_ops::has_staged_changes(worktree)? {
        return Err(RunError::err(
            RunErrorKind::AgentProcess,
            "No workspace changes detected",
        ));
    }

    let summary_path = worktree.join(".summary.txt");
    let summary = fs::read_to_string(&summary_path).unwrap_or_default();
    let trimmed = summary.trim();
    if trimmed.is_empty() {
        return Err(RunError::err(
            RunErrorKind::AgentProcess,
            "Agent process failed. Summary is empty.",
        ));
    }

    fs::create_dir_all(artifacts_dir)
        .with_context(|| format!("failed to create {}", artifacts_dir.display()))?;
    let summary_destination = artifacts_dir.join("summary.txt");
    fs::write(&summary_destination, format!("{trimmed}\n"))
        .with_context(|| format!("failed to write {}", summary_destination.display()))?;
    let _ = fs::remove_file(&summary_path);

    git_ops::add_all(worktree)?;
    if !git_ops::has_staged_changes(worktree)? {
        return Err(RunError::err(
            RunErrorKind::AgentProcess,
            "No workspace changes detected",
        ));
    }

    git_ops::commit(worktree, trimmed, author_name, author_email)?;
    let commit_sha = git_ops::head_sha(worktree)?;

    let diff_path = artifacts_dir.join("diff.patch");
    git_ops::write_diff(worktree, base_revision_sha, &commit_sha, &diff_path)?;
    let diff_statistics = git_ops::shortstat(worktree, base_revision_sha, &commit_sha)?;

    let changed_files = git_ops::changed_files(worktree, base_revision_sha, &commit_sha)?;
    if let Some(leaked) = changed_files.iter().find(|f| matches_known_credential_path(f)) {
        let _ = fs::remove_file(&diff_path);
        return Err(RunError::err(
            RunErrorKind::AgentProcess,
            format!("diff contains a credential file: {}", leaked.display()),
        ));
    }

    Ok(HarvestOutcome {
        commit_sha,
        diff_path,
        diff_statistics,
    })
}
