//! Low-level git subprocess wrapper shared by the workspace builder and the
//! artifact harvester.
//!
//! Every call shells out via `Command::new(git_program())`, where
//! `git_program()` honors a `VORATIQ_GIT_BIN` env override so tests can point
//! at a fake shell-script `git`. Failures become [`RunErrorKind::GitOperation`]
//! carrying the step name.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::error::{RunError, RunErrorKind};
use crate::types::DiffStatistics;

fn git_program() -> String {
    env::var("VORATIQ_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn run(dir: &Path, args: &[&str], step: &str) -> Result<String> {
    let output = Command::new(git_program())
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("failed to execute git {}", args.join(" ")))?;

    if !output.status.success() {
        return Err(RunError::err(
            RunErrorKind::GitOperation,
            format!(
                "{step}: git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// HEAD sha of the repo at `root`, used as the run's fixed `baseRevisionSha`.
pub fn rev_parse_head(root: &Path) -> Result<String> {
    run(root, &["rev-parse", "HEAD"], "rev-parse-head")
}

/// Create a new worktree at `worktree_path` on a fresh `branch`, rooted at
/// `base_revision_sha`.
pub fn create_worktree(
    repo_root: &Path,
    worktree_path: &Path,
    branch: &str,
    base_revision_sha: &str,
) -> Result<()> {
    let worktree_str = worktree_path.to_string_lossy().into_owned();
    run(
        repo_root,
        &[
            "worktree",
            "add",
            "-b",
            branch,
            &worktree_str,
            base_revision_sha,
        ],
        "worktree-add",
    )?;
    Ok(())
}

/// Remove a worktree (and its branch checkout state) from the repo's view.
pub fn remove_worktree(repo_root: &Path, worktree_path: &Path) -> Result<()> {
    let worktree_str = worktree_path.to_string_lossy().into_owned();
    match run(
        repo_root,
        &["worktree", "remove", "--force", &worktree_str],
        "worktree-remove",
    ) {
        Ok(_) => Ok(()),
        Err(err) if !worktree_path.exists() => {
            let _ = err;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// `git add -A` in the worktree.
pub fn add_all(worktree: &Path) -> Result<()> {
    run(worktree, &["add", "-A"], "add-all").map(|_| ())
}

/// True if there are staged changes relative to HEAD.
pub fn has_staged_changes(worktree: &Path) -> Result<bool> {
    let output = Command::new(git_program())
        .args(["diff", "--cached", "--quiet"])
        .current_dir(worktree)
        .status()
        .context("failed to execute git diff --cached --quiet")?;
    // Exit 0 = no differences staged; exit 1 = differences staged.
    Ok(!output.success())
}

/// Commit the staged tree with a deterministic sandbox author identity,
/// bypassing hooks.
pub fn commit(
    worktree: &Path,
    message: &str,
    author_name: &str,
    author_email: &str,
) -> Result<()> {
    run(
        worktree,
        &[
            "-c",
            &format!("user.name={author_name}"),
            "-c",
            &format!("user.email={author_email}"),
            "commit",
            "--no-verify",
            "-m",
            message,
        ],
        "commit",
    )
    .map(|_| ())
}

/// HEAD sha after the harvester's commit.
pub fn head_sha(worktree: &Path) -> Result<String> {
    run(worktree, &["rev-parse", "HEAD"], "rev-parse-head")
}

/// Write the diff from `base..head` to `destination`.
pub fn write_diff(worktree: &Path, base: &str, head: &str, destination: &Path) -> Result<()> {
    let range = format!("{base}..{head}");
    let output = Command::new(git_program())
        .args(["diff", &range])
        .current_dir(worktree)
        .output()
        .context("failed to execute git diff")?;
    if !output.status.success() {
        return Err(RunError::err(
            RunErrorKind::GitOperation,
            format!(
                "diff: git diff {range} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(destination, &output.stdout)
        .with_context(|| format!("failed to write diff to {}", destination.display()))?;
    Ok(())
}

/// `git diff --shortstat base..head`, parsed into structured counts.
pub fn shortstat(worktree: &Path, base: &str, head: &str) -> Result<DiffStatistics> {
    let range = format!("{base}..{head}");
    let raw = run(worktree, &["diff", "--shortstat", &range], "shortstat")?;
    Ok(parse_shortstat(&raw))
}

fn parse_shortstat(raw: &str) -> DiffStatistics {
    let mut stats = DiffStatistics::default();
    for part in raw.split(',') {
        let part = part.trim();
        if let Some(n) = part.strip_suffix(" files changed").or_else(|| part.strip_suffix(" file changed")) {
            stats.files_changed = n.trim().parse().unwrap_or(0);
        } else if let Some(n) = part
            .strip_suffix(" insertions(+)")
            .or_else(|| part.strip_suffix(" insertion(+)"))
        {
            stats.insertions = n.trim().parse().unwrap_or(0);
        } else if let Some(n) = part
            .strip_suffix(" deletions(-)")
            .or_else(|| part.strip_suffix(" deletion(-)"))
        {
            stats.deletions = n.trim().parse().unwrap_or(0);
        }
    }
    stats
}

/// Files touched by `base..head`, used by the credential-exclusion scan.
pub fn changed_files(worktree: &Path, base: &str, head: &str) -> Result<Vec<PathBuf>> {
    let range = format!("{base}..{head}");
    let raw = run(worktree, &["diff", "--name-only", &range], "diff-name-only")?;
    Ok(raw.lines().map(PathBuf::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_shortstat_handles_plural_counts() {
        let stats = parse_shortstat(" 3 files changed, 10 insertions(+), 2 deletions(-)");
        assert_eq!(stats.files_changed, 3);
        assert_eq!(stats.insertions, 10);
        assert_eq!(stats.deletions, 2);
    }

    #[test]
    fn parse_shortstat_handles_singular_counts() {
        let stats = parse_shortstat(" 1 file changed, 1 insertion(+), 1 deletion(-)");
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.deletions, 1);
    }

    #[test]
    fn parse_shortstat_handles_empty_diff() {
        let stats = parse_shortstat("");
        assert_eq!(stats.files_changed, 0);
        assert_eq!(stats.insertions, 0);
        assert_eq!(stats.deletions, 0);
    }
}
