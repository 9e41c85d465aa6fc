//! Small fixture-style loader for the CLI's own agent roster, eval list, and
//! sandbox policy. Real deployments are expected to bring their own config
//! loader; this one exists so `voratiq run` is runnable end-to-end from a
//! single YAML file without pulling in a full configuration system.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use voratiq_core::config::SandboxPolicy;
use voratiq_core::types::{AgentDefinition, EnvironmentConfig, EvalDefinition};

/// `{agents: [...], evals: [...], environment: {...}, sandbox: {...}}`.
#[derive(Debug, Deserialize)]
pub struct RosterFile {
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub evals: Vec<EvalDefinition>,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub sandbox: SandboxPolicy,
}

/// Load a roster YAML file from `path`.
pub fn load(path: &Path) -> Result<RosterFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read roster file at {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse roster file at {}", path.display()))
}
