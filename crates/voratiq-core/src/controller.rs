//! The `execute_run` pipeline: validate inputs, provision a record, prepare
//! and run every agent, then fold preparation failures and execution results
//! into a final [`RunReport`].
//!
//! Collapses what could be separate preflight/publish/resume stages into one
//! call, since voratiq has no separate preflight/publish split at the CLI
//! boundary.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;

use crate::abort;
use crate::config::{self, SandboxPolicy};
use crate::credentials::{CredentialRegistry, ProviderRegistry};
use crate::error::{RunError, RunErrorKind};
use crate::git_ops;
use crate::lifecycle::{self, LifecycleContext, PrepareInputs};
use crate::record_store::RecordStore;
use crate::renderer::Renderer;
use crate::scheduler;
use crate::types::{
    AgentDefinition, AgentInvocationRecord, EnvironmentConfig, EvalDefinition, RunRecord,
    RunReport, RunStatus, SchemaVersion,
};
use crate::workspace::{self, AgentPaths};

/// Everything `execute_run` needs, matching spec §6's engine-level
/// invocation surface.
pub struct ExecuteRunInput {
    pub root: PathBuf,
    pub runs_dir: PathBuf,
    pub spec_absolute_path: PathBuf,
    pub spec_display_path: PathBuf,
    pub agents: Vec<AgentDefinition>,
    pub agent_ids: Option<Vec<String>>,
    pub max_parallel: Option<i64>,
    pub environment: EnvironmentConfig,
    pub evals: Vec<EvalDefinition>,
    pub sandbox_policy: SandboxPolicy,
    pub renderer: Arc<dyn Renderer>,
    pub provider_registry: ProviderRegistry,
}

const DEFAULT_AUTHOR_NAME: &str = "voratiq";
const DEFAULT_AUTHOR_EMAIL: &str = "voratiq@localhost";

/// Run every selected agent against `input.spec_absolute_path` and return the
/// final [`RunReport`]. Only failures before the initial record is persisted
/// abort the whole invocation; everything after that point degrades to
/// per-agent terminal statuses.
pub fn execute_run(input: ExecuteRunInput) -> Result<RunReport> {
    let selected = select_agents(&input.agents, input.agent_ids.as_deref())?;
    let effective_max_parallel = config::effective_max_parallel(input.max_parallel, selected.len())?;
    for agent in &selected {
        input.provider_registry.get(&agent.provider)?;
    }

    let base_revision_sha = git_ops::rev_parse_head(&input.root)?;
    let spec_content = std::fs::read_to_string(&input.spec_absolute_path).with_context(|| {
        format!("failed to read spec at {}", input.spec_absolute_path.display())
    })?;

    let run_id = generate_run_id();
    let created_at = Utc::now();
    let record_store = Arc::new(RecordStore::new(&input.runs_dir));
    record_store.append(RunRecord {
        schema_version: SchemaVersion::current(),
        run_id: run_id.clone(),
        base_revision_sha: base_revision_sha.clone(),
        spec_path: input.spec_display_path.clone(),
        root_path: input.root.clone(),
        created_at,
        deleted_at: None,
        status: RunStatus::Running,
        agents: selected
            .iter()
            .map(|a| AgentInvocationRecord::queued(&a.id, &a.model))
            .collect(),
        apply_status: None,
    })?;

    for agent in &selected {
        if let Some(snapshot) = fetch_agent_snapshot(&record_store, &run_id, &agent.id) {
            input.renderer.update(&snapshot);
        }
    }

    let abort_flag = Arc::new(AtomicBool::new(false));
    let credential_registry = Arc::new(CredentialRegistry::new());
    abort::register(abort::ActiveRun {
        run_id: run_id.clone(),
        record_store: Arc::clone(&record_store),
        credential_registry: Arc::clone(&credential_registry),
        abort_flag: Arc::clone(&abort_flag),
    });

    let mut prepared = Vec::new();
    for agent in &selected {
        let inputs = PrepareInputs {
            repo_root: &input.root,
            runs_dir: &input.runs_dir,
            run_id: &run_id,
            base_revision_sha: &base_revision_sha,
            spec_content: &spec_content,
            environment: &input.environment,
            sandbox_policy: &input.sandbox_policy,
            provider_registry: &input.provider_registry,
            credential_registry: &credential_registry,
        };
        match lifecycle::prepare(agent, inputs) {
            Ok(agent_ready) => prepared.push(agent_ready),
            Err(err) => {
                let failure = lifecycle::prepare_failure_record(agent, &err);
                let _ = record_store.rewrite_agent(&run_id, &agent.id, |a| {
                    a.status = failure.status;
                    a.started_at = failure.started_at;
                    a.completed_at = failure.completed_at;
                    a.error = failure.error.clone();
                });
                input.renderer.update(&failure);
                let _ = credential_registry.teardown(&agent.id);
                let paths = AgentPaths::new(&input.runs_dir, &run_id, &agent.id);
                let _ = workspace::remove_agent_root(&paths);
            }
        }
    }

    let ctx = Arc::new(LifecycleContext {
        run_id: run_id.clone(),
        base_revision_sha: base_revision_sha.clone(),
        author_name: DEFAULT_AUTHOR_NAME.to_string(),
        author_email: DEFAULT_AUTHOR_EMAIL.to_string(),
        evals: input.evals.clone(),
        trusted_temp_roots: vec![input.runs_dir.clone()],
        record_store: Arc::clone(&record_store),
        renderer: Arc::clone(&input.renderer),
        credential_registry: Arc::clone(&credential_registry),
        abort_flag: Arc::clone(&abort_flag),
    });
    scheduler::run_agents(prepared, ctx, effective_max_parallel);

    let final_record = record_store.rewrite(&run_id, |r| {
        let aborted = abort_flag.load(Ordering::SeqCst);
        r.status = if aborted {
            RunStatus::Aborted
        } else if r.had_agent_failure() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
    })?;

    record_store.flush_all()?;
    credential_registry.teardown_all()?;
    abort::clear();

    let report = RunReport {
        run_id,
        spec: input.spec_display_path,
        status: final_record.status,
        created_at,
        base_revision_sha,
        agents: final_record.agents_sorted(),
        had_agent_failure: final_record.had_agent_failure(),
        had_eval_failure: final_record.had_eval_failure(),
    };
    input.renderer.complete(&report);
    Ok(report)
}

fn fetch_agent_snapshot(store: &RecordStore, run_id: &str, agent_id: &str) -> Option<AgentInvocationRecord> {
    store
        .fetch(run_id)
        .ok()
        .and_then(|record| record.agents.into_iter().find(|a| a.agent_id == agent_id))
}

/// Validate the agent roster and, when `agent_ids` is given, filter to that
/// explicit ordered subset. Fails validation on an empty roster, a duplicate
/// `agentId`, or a requested id absent from the roster.
fn select_agents(agents: &[AgentDefinition], agent_ids: Option<&[String]>) -> Result<Vec<AgentDefinition>> {
    if agents.is_empty() {
        return Err(RunError::err(RunErrorKind::Validation, "no agents configured"));
    }

    let mut seen = HashSet::new();
    for agent in agents {
        if !seen.insert(agent.id.as_str()) {
            return Err(RunError::err(
                RunErrorKind::Validation,
                format!("duplicate agentId: {}", agent.id),
            ));
        }
    }

    let selected = match agent_ids {
        None => agents.to_vec(),
        Some(ids) => {
            let mut result = Vec::with_capacity(ids.len());
            for id in ids {
                let agent = agents.iter().find(|a| &a.id == id).ok_or_else(|| {
                    RunError::err(RunErrorKind::Validation, format!("unknown agentId: {id}"))
                })?;
                result.push(agent.clone());
            }
            result
        }
    };

    if selected.is_empty() {
        return Err(RunError::err(RunErrorKind::Validation, "no agents selected"));
    }
    Ok(selected)
}

fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let mut rng = rand::thread_rng();
    let slug: String = (0..5).map(|_| (b'a' + rng.gen_range(0..26u8)) as char).collect();
    format!("{timestamp}-{slug}")
}
