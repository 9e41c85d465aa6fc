//! Executes per-slug shell eval commands against a finished agent's
//! worktree, capturing exit status and output.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use crate::types::{EvalDefinition, EvalResult, EvalStatus};

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Guard temp-directory env vars: only pre-create (and keep) a `TMPDIR`/
/// `TMP`/`TEMP` value when it falls inside one of `trusted_roots`; untrusted
/// absolute entries are unset and reported as a warning.
pub fn guard_temp_dirs(env: &mut BTreeMap<String, String>, trusted_roots: &[PathBuf]) -> Vec<String> {
    let mut warnings = Vec::new();
    for var in ["TMPDIR", "TMP", "TEMP"] {
        let Some(value) = env.get(var).cloned() else {
            continue;
        };
        let path = PathBuf::from(&value);
        let trusted = trusted_roots.iter().any(|root| path.starts_with(root));
        if trusted {
            let _ = std::fs::create_dir_all(&path);
        } else {
            env.remove(var);
            warnings.push(format!(
                "ignored untrusted {var}={value}: outside the allow-listed temp roots"
            ));
        }
    }
    warnings
}

/// Run one eval. A missing/empty command is `skipped` without spawning
/// anything. Returns the result alongside any temp-dir guard warnings, which
/// the caller attaches to the agent's own `warnings` list.
pub fn run_eval(
    eval: &EvalDefinition,
    worktree: &Path,
    base_env: &BTreeMap<String, String>,
    evals_dir: &Path,
    trusted_roots: &[PathBuf],
) -> (EvalResult, Vec<String>) {
    let Some(command) = eval.command.as_ref().filter(|c| !c.trim().is_empty()) else {
        return (
            EvalResult {
                slug: eval.slug.clone(),
                status: EvalStatus::Skipped,
                exit_code: None,
                command: None,
                log_path: None,
                error: None,
            },
            Vec::new(),
        );
    };

    let mut env = base_env.clone();
    let warnings = guard_temp_dirs(&mut env, trusted_roots);

    let log_path = evals_dir.join(format!("{}.log", eval.slug));
    let result = run_and_capture(command, worktree, &env, &log_path);

    let eval_result = match result {
        Ok(exit_code) => EvalResult {
            slug: eval.slug.clone(),
            status: if exit_code == 0 {
                EvalStatus::Succeeded
            } else {
                EvalStatus::Failed
            },
            exit_code: Some(exit_code),
            command: Some(command.clone()),
            log_path: Some(log_path.to_string_lossy().into_owned()),
            error: None,
        },
        Err(e) => EvalResult {
            slug: eval.slug.clone(),
            status: EvalStatus::Errored,
            exit_code: None,
            command: Some(command.clone()),
            log_path: Some(log_path.to_string_lossy().into_owned()),
            error: Some(e.to_string()),
        },
    };
    (eval_result, warnings)
}

fn run_and_capture(
    command: &str,
    worktree: &Path,
    env: &BTreeMap<String, String>,
    log_path: &Path,
) -> Result<i32> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let log_file = File::create(log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let log_file_err = log_file
        .try_clone()
        .with_context(|| format!("failed to duplicate handle for {}", log_path.display()))?;

    let mut cmd = shell_command(command);
    cmd.current_dir(worktree)
        .env_clear()
        .envs(env)
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err));

    let status = cmd
        .status()
        .with_context(|| format!("failed to spawn eval command: {command}"))?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn eval(slug: &str, command: Option<&str>) -> EvalDefinition {
        EvalDefinition {
            slug: slug.to_string(),
            command: command.map(str::to_string),
        }
    }

    #[test]
    fn missing_command_is_skipped() {
        let td = tempdir().expect("tempdir");
        let (result, warnings) = run_eval(&eval("lint", None), td.path(), &BTreeMap::new(), td.path(), &[]);
        assert_eq!(result.status, EvalStatus::Skipped);
        assert!(warnings.is_empty());
    }

    #[test]
    fn successful_command_is_succeeded() {
        let td = tempdir().expect("tempdir");
        let (result, _warnings) = run_eval(
            &eval("lint", Some("exit 0")),
            td.path(),
            &BTreeMap::new(),
            td.path(),
            &[],
        );
        assert_eq!(result.status, EvalStatus::Succeeded);
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn failing_command_is_failed() {
        let td = tempdir().expect("tempdir");
        let (result, _warnings) = run_eval(
            &eval("lint", Some("exit 7")),
            td.path(),
            &BTreeMap::new(),
            td.path(),
            &[],
        );
        assert_eq!(result.status, EvalStatus::Failed);
        assert_eq!(result.exit_code, Some(7));
    }

    #[test]
    fn guard_temp_dirs_keeps_trusted_and_drops_untrusted() {
        let td = tempdir().expect("tempdir");
        let trusted_root = td.path().join("trusted-tmp");
        let mut env = BTreeMap::new();
        env.insert(
            "TMPDIR".to_string(),
            trusted_root.join("sub").to_string_lossy().into_owned(),
        );
        env.insert("TMP".to_string(), "/etc".to_string());

        let warnings = guard_temp_dirs(&mut env, &[trusted_root.clone()]);

        assert!(env.contains_key("TMPDIR"));
        assert!(trusted_root.join("sub").exists());
        assert!(!env.contains_key("TMP"));
        assert_eq!(warnings.len(), 1);
    }
}
