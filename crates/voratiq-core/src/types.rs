//! Domain types: agent/eval/environment configuration, the run record, and the
//! versioned index entry that shadows it in `index.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `voratiq.{kind}.v{N}`-style schema tag embedded in every persisted document
/// so a future format change can be detected and rejected cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion(String);

pub const CURRENT_RUN_RECORD_VERSION: &str = "voratiq.record.v1";
pub const CURRENT_INDEX_VERSION: u32 = 1;

impl SchemaVersion {
    pub fn current() -> Self {
        Self(CURRENT_RUN_RECORD_VERSION.to_string())
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 || parts[0] != "voratiq" || !parts[2].starts_with('v') {
            anyhow::bail!("invalid schema version format: {s}");
        }
        parts[2][1..]
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("invalid schema version number in: {s}"))?;
        Ok(Self(s.to_string()))
    }

    pub fn is_supported(&self) -> bool {
        self.0 == CURRENT_RUN_RECORD_VERSION
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::current()
    }
}

/// `{id, provider, model, binary, argv, env?}` — one configured agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub binary: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

/// Repo-relative dependency roots declared for a node/python ecosystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_dependency_roots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_venv_path: Option<String>,
}

/// `{slug, command?}` — a missing/empty command means "skip".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalDefinition {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Errored,
    Aborted,
    Pruned,
}

impl RunStatus {
    /// Terminal statuses are absorbing: a mutation never regresses out of one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::Errored
                | RunStatus::Aborted
                | RunStatus::Pruned
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Succeeded
                | AgentStatus::Failed
                | AgentStatus::Errored
                | AgentStatus::Aborted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Succeeded,
    Failed,
    Errored,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub slug: String,
    pub status: EvalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DiffStatistics {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactFlags {
    #[serde(default)]
    pub diff_attempted: bool,
    #[serde(default)]
    pub diff_captured: bool,
    #[serde(default)]
    pub stdout_captured: bool,
    #[serde(default)]
    pub stderr_captured: bool,
    #[serde(default)]
    pub summary_captured: bool,
}

/// One agent's invocation record within a [`RunRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocationRecord {
    pub agent_id: String,
    pub model: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_statistics: Option<DiffStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactFlags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evals: Option<Vec<EvalResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentInvocationRecord {
    pub fn queued(agent_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            model: model.into(),
            status: AgentStatus::Queued,
            started_at: None,
            completed_at: None,
            commit_sha: None,
            diff_statistics: None,
            artifacts: None,
            evals: None,
            warnings: None,
            error: None,
        }
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.get_or_insert_with(Vec::new).push(warning.into());
    }
}

/// The authoritative per-run document, persisted as `record.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default = "SchemaVersion::current")]
    pub schema_version: SchemaVersion,
    pub run_id: String,
    pub base_revision_sha: String,
    pub spec_path: PathBuf,
    pub root_path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub agents: Vec<AgentInvocationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_status: Option<String>,
}

impl RunRecord {
    pub fn had_agent_failure(&self) -> bool {
        self.agents
            .iter()
            .any(|a| matches!(a.status, AgentStatus::Failed | AgentStatus::Errored))
    }

    pub fn had_eval_failure(&self) -> bool {
        self.agents.iter().any(|a| {
            a.evals.as_ref().is_some_and(|evals| {
                evals
                    .iter()
                    .any(|e| matches!(e.status, EvalStatus::Failed | EvalStatus::Errored))
            })
        })
    }

    /// Lexicographic-by-`agentId` view, independent of completion order, so
    /// rendering and reporting stay stable regardless of which agent finishes
    /// first.
    pub fn agents_sorted(&self) -> Vec<AgentInvocationRecord> {
        let mut agents = self.agents.clone();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }
}

/// `index.json`'s `{runId, createdAt, status}` line item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
}

/// `{version, runs[]}` — the engine-wide run index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndex {
    #[serde(default = "default_index_version")]
    pub version: u32,
    pub runs: Vec<RunIndexEntry>,
}

fn default_index_version() -> u32 {
    CURRENT_INDEX_VERSION
}

impl Default for RunIndex {
    fn default() -> Self {
        Self {
            version: CURRENT_INDEX_VERSION,
            runs: Vec::new(),
        }
    }
}

/// The return value of `execute_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub spec: PathBuf,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub base_revision_sha: String,
    pub agents: Vec<AgentInvocationRecord>,
    pub had_agent_failure: bool,
    pub had_eval_failure: bool,
}
