//! Drives one agent through `queued -> running -> {succeeded, failed, errored,
//! aborted}`, wiring together the workspace, credential, manifest, sandbox,
//! watchdog, chat-preservation, harvest, and eval stages.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::chat;
use crate::config::SandboxPolicy;
use crate::credentials::{CredentialRegistry, ProviderRegistry};
use crate::eval::{self};
use crate::error::{RunError, RunErrorKind};
use crate::harvester;
use crate::hints;
use crate::manifest::{self, Manifest, ManifestInputs};
use crate::record_store::RecordStore;
use crate::renderer::Renderer;
use crate::sandbox;
use crate::types::{
    AgentDefinition, AgentInvocationRecord, AgentStatus, ArtifactFlags, EnvironmentConfig,
    EvalDefinition,
};
use crate::workspace::{self, AgentPaths};

const ABORT_WARNING: &str = "agent aborted: run was terminated";

/// An agent whose workspace, credentials, and manifest are fully prepared and
/// ready to be handed to a scheduler worker.
pub struct PreparedAgent {
    pub agent: AgentDefinition,
    pub provider: String,
    pub paths: AgentPaths,
    pub manifest: Manifest,
}

/// Everything a single agent's lifecycle needs beyond its `PreparedAgent`,
/// shared read-only (or behind interior synchronization) across every worker.
pub struct LifecycleContext {
    pub run_id: String,
    pub base_revision_sha: String,
    pub author_name: String,
    pub author_email: String,
    pub evals: Vec<EvalDefinition>,
    pub trusted_temp_roots: Vec<PathBuf>,
    pub record_store: Arc<RecordStore>,
    pub renderer: Arc<dyn Renderer>,
    pub credential_registry: Arc<CredentialRegistry>,
    pub abort_flag: Arc<AtomicBool>,
}

/// Inputs needed to prepare one agent: workspace, credential staging, and
/// manifest/sandbox-policy writes. Any failure here produces a terminal
/// `failed`/`errored` record and the agent never enters the scheduler pool.
pub struct PrepareInputs<'a> {
    pub repo_root: &'a std::path::Path,
    pub runs_dir: &'a std::path::Path,
    pub run_id: &'a str,
    pub base_revision_sha: &'a str,
    pub spec_content: &'a str,
    pub environment: &'a EnvironmentConfig,
    pub sandbox_policy: &'a SandboxPolicy,
    pub provider_registry: &'a ProviderRegistry,
    pub credential_registry: &'a CredentialRegistry,
}

/// Prepare one agent's workspace, staged credentials, and manifest. On
/// success the agent is ready for [`crate::scheduler::run_agents`]; on
/// failure the caller is responsible for cleaning up any partial workspace
/// via [`workspace::remove_agent_root`] and tearing down any credential that
/// did get staged via `credential_registry.teardown`.
pub fn prepare(agent: &AgentDefinition, inputs: PrepareInputs) -> Result<PreparedAgent> {
    let paths = AgentPaths::new(inputs.runs_dir, inputs.run_id, &agent.id);
    workspace::scaffold(&paths)?;
    workspace::create_worktree(
        inputs.repo_root,
        &paths,
        inputs.run_id,
        &agent.id,
        inputs.base_revision_sha,
    )?;
    let linked = workspace::link_environment(inputs.repo_root, &paths, inputs.environment)?;

    let provider = inputs.provider_registry.get(&agent.provider)?;
    provider.verify()?;
    let staged = provider.stage(&paths.sandbox)?;
    inputs.credential_registry.record(&agent.id, staged.clone());

    let prompt_path = paths.runtime.join("prompt.md");
    std::fs::write(&prompt_path, inputs.spec_content)
        .map_err(|e| RunError::err(RunErrorKind::WorkspaceSetup, format!("failed to write prompt: {e}")))?;

    let inherited_path = std::env::var("PATH").unwrap_or_default();
    let workspace_relative = relative_to(&paths.runtime, &paths.workspace);

    let manifest = manifest::build_manifest(ManifestInputs {
        agent,
        environment: inputs.environment,
        credential_env: &staged.env,
        inherited_path: &inherited_path,
        workspace_relative: &workspace_relative,
        prompt_relative: "prompt.md",
        venv_bin_relative: linked.venv_bin_relative.as_deref(),
        node_bin_relatives: &linked.node_bin_relatives,
    });
    manifest::write_manifest(&paths.agent_root, &manifest)?;
    sandbox::write_sandbox_policy(&paths.agent_root, inputs.sandbox_policy)?;
    workspace::write_shim(&paths, &agent.id)?;

    Ok(PreparedAgent {
        agent: agent.clone(),
        provider: agent.provider.clone(),
        paths,
        manifest,
    })
}

fn relative_to(from_dir: &std::path::Path, target: &std::path::Path) -> String {
    pathdiff(target, from_dir).to_string_lossy().into_owned()
}

/// Minimal relative-path diff: both inputs share the same agent-root ancestor
/// by construction, so a simple common-prefix strip suffices.
fn pathdiff(target: &std::path::Path, from_dir: &std::path::Path) -> PathBuf {
    let target_components: Vec<_> = target.components().collect();
    let from_components: Vec<_> = from_dir.components().collect();
    let common = target_components
        .iter()
        .zip(from_components.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut result = PathBuf::new();
    for _ in common..from_components.len() {
        result.push("..");
    }
    for component in &target_components[common..] {
        result.push(component.as_os_str());
    }
    result
}

fn snapshot_of(record: &crate::types::RunRecord, agent_id: &str) -> Option<AgentInvocationRecord> {
    record.agents.iter().find(|a| a.agent_id == agent_id).cloned()
}

/// Run one prepared agent to completion, publishing snapshots at each state
/// transition. Always returns a terminal [`AgentInvocationRecord`].
pub fn run(prepared: &PreparedAgent, ctx: &LifecycleContext) -> AgentInvocationRecord {
    let agent_id = prepared.agent.id.clone();

    if ctx.abort_flag.load(Ordering::SeqCst) {
        return finish_aborted(prepared, ctx);
    }

    let running = ctx.record_store.rewrite_agent(&ctx.run_id, &agent_id, |a| {
        a.status = AgentStatus::Running;
        a.started_at = Some(Utc::now());
    });
    if let Ok(record) = running {
        if let Some(snapshot) = snapshot_of(&record, &agent_id) {
            ctx.renderer.update(&snapshot);
        }
    }

    let workspace_absolute = prepared.paths.workspace.clone();
    let outcome = sandbox::launch(&prepared.manifest, &prepared.paths.agent_root, &workspace_absolute);

    let mut artifacts = ArtifactFlags {
        diff_attempted: true,
        ..Default::default()
    };

    let (status, error, hint_source) = match &outcome {
        Err(e) => {
            let message = e.to_string();
            (AgentStatus::Failed, Some(message.clone()), message)
        }
        Ok(result) if result.trigger.is_some() => {
            artifacts.stdout_captured = true;
            artifacts.stderr_captured = true;
            let reason = result.trigger.expect("checked is_some").as_str();
            (
                AgentStatus::Failed,
                Some(format!("agent process killed by watchdog: {reason}")),
                reason.to_string(),
            )
        }
        Ok(result) if result.exit_code != Some(0) => {
            artifacts.stdout_captured = true;
            artifacts.stderr_captured = true;
            let combined = read_combined_logs(&prepared.paths.artifacts);
            (
                AgentStatus::Failed,
                Some(format!(
                    "agent process exited with code {:?}",
                    result.exit_code
                )),
                combined,
            )
        }
        Ok(_) => {
            artifacts.stdout_captured = true;
            artifacts.stderr_captured = true;
            (AgentStatus::Succeeded, None, String::new())
        }
    };

    let mut warnings = Vec::new();
    match chat::preserve(&prepared.provider, &prepared.paths.sandbox, &prepared.paths.artifacts) {
        Ok(chat::ChatOutcome::Preserved { warning: Some(w) }) => warnings.push(w),
        Ok(_) => {}
        Err(e) => warnings.push(format!("chat preservation failed: {e}")),
    }

    let claude_hint = if prepared.provider == "claude" {
        hints::claude_reauth_hint(&hint_source)
    } else {
        None
    };
    let error = match (&error, claude_hint) {
        (Some(message), Some(hint)) => Some(format!("{message} ({hint})")),
        (Some(message), None) => Some(message.clone()),
        (None, _) => None,
    };

    let mut final_status = status;
    let mut commit_sha = None;
    let mut diff_statistics = None;
    let mut evals = None;
    let mut harvest_error = error;

    if final_status == AgentStatus::Succeeded {
        match harvester::harvest(
            &prepared.paths.workspace,
            &prepared.paths.artifacts,
            &ctx.base_revision_sha,
            &ctx.author_name,
            &ctx.author_email,
        ) {
            Ok(harvested) => {
                commit_sha = Some(harvested.commit_sha);
                diff_statistics = Some(harvested.diff_statistics);
                artifacts.diff_captured = true;
                artifacts.summary_captured = true;

                let base_env = prepared.manifest.env.clone();
                let mut results = Vec::with_capacity(ctx.evals.len());
                for eval_def in &ctx.evals {
                    let (result, eval_warnings) = eval::run_eval(
                        eval_def,
                        &prepared.paths.workspace,
                        &base_env,
                        &prepared.paths.evals,
                        &ctx.trusted_temp_roots,
                    );
                    warnings.extend(eval_warnings);
                    results.push(result);
                }
                evals = Some(results);
            }
            Err(e) => {
                final_status = AgentStatus::Failed;
                harvest_error = Some(e.to_string());
            }
        }
    }

    if ctx.abort_flag.load(Ordering::SeqCst) && final_status != AgentStatus::Failed {
        final_status = AgentStatus::Aborted;
        warnings.push(ABORT_WARNING.to_string());
        harvest_error = None;
    }

    if let Err(e) = ctx.credential_registry.teardown(&agent_id) {
        warnings.push(format!("credential teardown failed: {e}"));
    }

    let final_record = ctx.record_store.rewrite_agent(&ctx.run_id, &agent_id, |a| {
        a.status = final_status;
        a.completed_at = Some(Utc::now());
        a.commit_sha = commit_sha.clone();
        a.diff_statistics = diff_statistics;
        a.artifacts = Some(artifacts.clone());
        a.evals = evals.clone();
        a.error = harvest_error.clone();
        for warning in &warnings {
            a.push_warning(warning.clone());
        }
    });

    match final_record {
        Ok(record) => snapshot_of(&record, &agent_id).unwrap_or_else(|| {
            fallback_record(&agent_id, &prepared.agent.model, final_status, harvest_error)
        }),
        Err(_) => fallback_record(&agent_id, &prepared.agent.model, final_status, harvest_error),
    }
}

fn finish_aborted(prepared: &PreparedAgent, ctx: &LifecycleContext) -> AgentInvocationRecord {
    let agent_id = prepared.agent.id.clone();
    let _ = ctx.credential_registry.teardown(&agent_id);
    let record = ctx.record_store.rewrite_agent(&ctx.run_id, &agent_id, |a| {
        a.status = AgentStatus::Aborted;
        a.completed_at = Some(Utc::now());
        a.push_warning(ABORT_WARNING);
    });
    match record {
        Ok(record) => snapshot_of(&record, &agent_id).unwrap_or_else(|| {
            fallback_record(&agent_id, &prepared.agent.model, AgentStatus::Aborted, None)
        }),
        Err(_) => fallback_record(&agent_id, &prepared.agent.model, AgentStatus::Aborted, None),
    }
}

fn fallback_record(
    agent_id: &str,
    model: &str,
    status: AgentStatus,
    error: Option<String>,
) -> AgentInvocationRecord {
    let mut record = AgentInvocationRecord::queued(agent_id, model);
    record.status = status;
    record.error = error;
    record
}

fn read_combined_logs(artifacts_dir: &std::path::Path) -> String {
    let stdout = std::fs::read_to_string(artifacts_dir.join("stdout.log")).unwrap_or_default();
    let stderr = std::fs::read_to_string(artifacts_dir.join("stderr.log")).unwrap_or_default();
    format!("{stdout}\n{stderr}")
}

/// Build a terminal failure record for an agent whose preparation stage
/// (workspace, credential staging, or manifest write) raised an error. These
/// agents never reach the scheduler pool.
pub fn prepare_failure_record(
    agent: &AgentDefinition,
    err: &anyhow::Error,
) -> AgentInvocationRecord {
    let status = if RunError::kind_of(err) == Some(RunErrorKind::RunReportInvariant) {
        AgentStatus::Errored
    } else {
        AgentStatus::Failed
    };
    let mut record = AgentInvocationRecord::queued(&agent.id, &agent.model);
    record.status = status;
    record.started_at = Some(Utc::now());
    record.completed_at = Some(Utc::now());
    record.error = Some(format!("{err:#}"));
    record
}
