//! Serializes the sandbox launch manifest: binary, argv, prompt/workspace
//! paths, and the merged environment the agent process execs under.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::credentials::EnvAugmentations;
use crate::error::{RunError, RunErrorKind};
use crate::record_store::atomic_write_json;
use crate::types::{AgentDefinition, EnvironmentConfig};
use crate::watchdog::{DEFAULT_SILENCE_TIMEOUT, DEFAULT_WALL_CLOCK_CAP};

#[cfg(unix)]
const PATH_SEP: char = ':';
#[cfg(not(unix))]
const PATH_SEP: char = ';';

/// Watchdog defaults published on the manifest so tests (and operators) can
/// assert on the timeouts actually in force for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDefaults {
    pub silence_timeout_ms: u64,
    pub wall_clock_cap_ms: u64,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            silence_timeout_ms: DEFAULT_SILENCE_TIMEOUT.as_millis() as u64,
            wall_clock_cap_ms: DEFAULT_WALL_CLOCK_CAP.as_millis() as u64,
        }
    }
}

/// `{binary, argv[], promptPath, workspace, env}`, written to
/// `runtime/manifest.json`. `promptPath` and `workspace` are relative to the
/// manifest's directory; the sandbox launcher re-absolutizes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub binary: String,
    pub argv: Vec<String>,
    pub prompt_path: String,
    pub workspace: String,
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime: RuntimeDefaults,
}

/// Inputs needed to build one agent's manifest, beyond the agent definition
/// itself.
pub struct ManifestInputs<'a> {
    pub agent: &'a AgentDefinition,
    pub environment: &'a EnvironmentConfig,
    pub credential_env: &'a EnvAugmentations,
    pub inherited_path: &'a str,
    pub workspace_relative: &'a str,
    pub prompt_relative: &'a str,
    pub venv_bin_relative: Option<&'a str>,
    pub node_bin_relatives: &'a [String],
}

/// Substitute every literal `{{MODEL}}` token in `argv` with `model`.
fn substitute_model(argv: &[String], model: &str) -> Vec<String> {
    argv.iter()
        .map(|arg| arg.replace("{{MODEL}}", model))
        .collect()
}

/// Deduplicating, order-preserving PATH merge using the platform separator.
/// Earlier entries take priority; an entry already present (by exact string)
/// is not repeated later in the list.
pub fn merge_path(prepends: &[String], inherited: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for entry in prepends
        .iter()
        .map(|s| s.as_str())
        .chain(inherited.split(PATH_SEP))
    {
        if entry.is_empty() {
            continue;
        }
        if seen.insert(entry.to_string()) {
            merged.push(entry.to_string());
        }
    }
    merged.join(&PATH_SEP.to_string())
}

/// Build the manifest env: base agent env, then credential-stage env, then
/// `VIRTUAL_ENV`/PATH for a python venv, then PATH for node `.bin`
/// directories, then the agent's inherited PATH.
fn build_env(inputs: &ManifestInputs) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = inputs
        .agent
        .env
        .clone()
        .unwrap_or_default();

    for (k, v) in inputs.credential_env {
        env.insert(k.clone(), v.clone());
    }

    let mut path_prepends = Vec::new();
    if let Some(venv_bin) = inputs.venv_bin_relative {
        env.insert("VIRTUAL_ENV".to_string(), venv_bin_parent(venv_bin));
        path_prepends.push(venv_bin.to_string());
    }
    for node_bin in inputs.node_bin_relatives {
        path_prepends.push(node_bin.clone());
    }

    let existing_path = env.get("PATH").cloned().unwrap_or_default();
    let base_path = if existing_path.is_empty() {
        inputs.inherited_path.to_string()
    } else {
        merge_path(&[existing_path], inputs.inherited_path)
    };
    env.insert("PATH".to_string(), merge_path(&path_prepends, &base_path));
    env
}

fn venv_bin_parent(venv_bin_relative: &str) -> String {
    Path::new(venv_bin_relative)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| venv_bin_relative.to_string())
}

/// Build a manifest for one agent. The environment declarations (node
/// dependency roots / python venv) only contribute PATH entries when the
/// corresponding directory actually exists inside the worktree; callers
/// resolve those relative paths via [`crate::workspace`] before calling this.
pub fn build_manifest(inputs: ManifestInputs) -> Manifest {
    let argv = substitute_model(&inputs.agent.argv, &inputs.agent.model);
    let env = build_env(&inputs);
    let _ = &inputs.environment;
    Manifest {
        binary: inputs.agent.binary.clone(),
        argv,
        prompt_path: inputs.prompt_relative.to_string(),
        workspace: inputs.workspace_relative.to_string(),
        env,
        runtime: RuntimeDefaults::default(),
    }
}

/// Write the manifest to `runtime/manifest.json` under `agent_root`,
/// atomically.
pub fn write_manifest(agent_root: &Path, manifest: &Manifest) -> Result<PathBuf> {
    let path = agent_root.join("runtime").join("manifest.json");
    atomic_write_json(&path, manifest).map_err(|err| {
        RunError::err(
            RunErrorKind::ManifestWrite,
            format!("failed to write manifest at {}: {err:#}", path.display()),
        )
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_agent() -> AgentDefinition {
        AgentDefinition {
            id: "alpha".to_string(),
            provider: "claude".to_string(),
            model: "claude-sonnet".to_string(),
            binary: "/usr/bin/claude".to_string(),
            argv: vec!["--model".to_string(), "{{MODEL}}".to_string()],
            env: None,
        }
    }

    #[test]
    fn substitute_model_replaces_every_occurrence() {
        let argv = vec!["--model".to_string(), "{{MODEL}}".to_string(), "{{MODEL}}-beta".to_string()];
        let result = substitute_model(&argv, "sonnet");
        assert_eq!(result, vec!["--model", "sonnet", "sonnet-beta"]);
    }

    #[test]
    fn merge_path_dedups_and_preserves_order() {
        let merged = merge_path(
            &["/a/bin".to_string(), "/b/bin".to_string()],
            "/b/bin:/c/bin",
        );
        assert_eq!(merged, "/a/bin:/b/bin:/c/bin");
    }

    #[test]
    fn merge_path_is_idempotent() {
        let once = merge_path(&["/a/bin".to_string()], "/b/bin:/c/bin");
        let twice = merge_path(&[], &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn build_manifest_substitutes_model_and_merges_path() {
        let agent = sample_agent();
        let environment = EnvironmentConfig::default();
        let mut credential_env = EnvAugmentations::new();
        credential_env.insert("CLAUDE_CONFIG_DIR".to_string(), "/sandbox/.claude".to_string());

        let inputs = ManifestInputs {
            agent: &agent,
            environment: &environment,
            credential_env: &credential_env,
            inherited_path: "/usr/bin:/bin",
            workspace_relative: "../workspace",
            prompt_relative: "../prompt.md",
            venv_bin_relative: Some("../workspace/.venv/bin"),
            node_bin_relatives: &["../workspace/node_modules/.bin".to_string()],
        };

        let manifest = build_manifest(inputs);
        assert_eq!(manifest.argv, vec!["--model", "claude-sonnet"]);
        assert_eq!(
            manifest.env.get("CLAUDE_CONFIG_DIR").unwrap(),
            "/sandbox/.claude"
        );
        assert!(manifest.env.get("VIRTUAL_ENV").is_some());
        let path = manifest.env.get("PATH").unwrap();
        assert!(path.starts_with("../workspace/.venv/bin"));
        assert!(path.contains("../workspace/node_modules/.bin"));
        assert!(path.contains("/usr/bin"));
    }

    #[test]
    fn write_manifest_tags_failure_as_manifest_write() {
        let td = tempdir().expect("tempdir");
        // `runtime` is a file, not a directory, so creating `runtime/manifest.json`
        // underneath it fails.
        std::fs::write(td.path().join("runtime"), b"not a directory").expect("write");

        let manifest = Manifest {
            binary: "/usr/bin/true".to_string(),
            argv: vec![],
            prompt_path: "../prompt.md".to_string(),
            workspace: "../workspace".to_string(),
            env: BTreeMap::new(),
            runtime: RuntimeDefaults::default(),
        };

        let err = write_manifest(td.path(), &manifest).unwrap_err();
        assert_eq!(RunError::kind_of(&err), Some(RunErrorKind::ManifestWrite));
    }

    proptest::proptest! {
        #[test]
        fn merge_path_is_idempotent_for_arbitrary_entries(
            prepends in proptest::collection::vec("[a-z/]{0,8}", 0..4),
            inherited in "[a-z/:]{0,16}",
        ) {
            let once = merge_path(&prepends, &inherited);
            let twice = merge_path(&[], &once);
            proptest::prop_assert_eq!(once, twice);
        }

        #[test]
        fn merge_path_never_produces_duplicate_entries(
            prepends in proptest::collection::vec("[a-z]{1,6}", 0..4),
            inherited in "[a-z:]{0,16}",
        ) {
            let merged = merge_path(&prepends, &inherited);
            let entries: Vec<&str> = merged.split(PATH_SEP).filter(|s| !s.is_empty()).collect();
            let unique: std::collections::HashSet<&str> = entries.iter().copied().collect();
            proptest::prop_assert_eq!(entries.len(), unique.len());
        }
    }
}
