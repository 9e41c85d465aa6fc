use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use voratiq_core::controller::{self, ExecuteRunInput};
use voratiq_core::credentials::ProviderRegistry;
use voratiq_core::hints::claude_reauth_hint;
use voratiq_core::types::RunStatus;

mod progress;
mod roster;

use progress::ConsoleRenderer;

#[derive(Parser, Debug)]
#[command(name = "voratiq", version)]
#[command(about = "Runs a roster of coding agents against a Markdown spec, each in its own isolated git worktree")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the configured agent roster against a spec.
    Run(RunArgs),
    /// Apply one agent's result back onto the working tree. Not implemented here.
    Apply,
    /// Review a run's diffs and eval results. Not implemented here.
    Review,
    /// List recorded runs. Not implemented here.
    List,
    /// Prune old run directories. Not implemented here.
    Prune,
    /// Print or validate a spec file. Not implemented here.
    Spec,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the Markdown spec to run agents against.
    #[arg(long)]
    spec: PathBuf,

    /// Path to the roster YAML describing agents, evals, environment, and
    /// sandbox policy (see `voratiq_cli::roster`).
    #[arg(long, default_value = "voratiq.yaml")]
    roster: PathBuf,

    /// Restrict the run to specific agent ids, preserving the given order.
    /// Repeatable. If omitted, every agent in the roster runs.
    #[arg(long = "agent")]
    agents: Vec<String>,

    /// Maximum number of agents to run concurrently. Defaults to the number
    /// of selected agents.
    #[arg(long)]
    max_parallel: Option<i64>,

    /// Root of the git repository the spec applies to.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Directory holding all run records and worktrees.
    #[arg(long, default_value = ".voratiq/runs")]
    runs_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let outcome = match cli.cmd {
        Commands::Run(args) => run(args),
        Commands::Apply => unimplemented_subcommand("apply"),
        Commands::Review => unimplemented_subcommand("review"),
        Commands::List => unimplemented_subcommand("list"),
        Commands::Prune => unimplemented_subcommand("prune"),
        Commands::Spec => unimplemented_subcommand("spec"),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            render_error(&err);
            std::process::exit(1);
        }
    }
}

fn unimplemented_subcommand(name: &str) -> Result<i32> {
    eprintln!("voratiq {name}: not implemented in this crate");
    Ok(1)
}

fn run(args: RunArgs) -> Result<i32> {
    install_signal_handler();

    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("failed to resolve root {}", args.root.display()))?;
    let spec_absolute_path = root.join(&args.spec);
    if !spec_absolute_path.is_file() {
        anyhow::bail!("spec file not found at {}", spec_absolute_path.display());
    }

    let roster = roster::load(&args.roster)?;
    let runs_dir = if args.runs_dir.is_absolute() {
        args.runs_dir.clone()
    } else {
        root.join(&args.runs_dir)
    };

    let renderer: Arc<dyn voratiq_core::renderer::Renderer> = Arc::new(ConsoleRenderer::new());
    let input = ExecuteRunInput {
        root,
        runs_dir,
        spec_absolute_path,
        spec_display_path: args.spec,
        agents: roster.agents,
        agent_ids: if args.agents.is_empty() { None } else { Some(args.agents) },
        max_parallel: args.max_parallel,
        environment: roster.environment,
        evals: roster.evals,
        sandbox_policy: roster.sandbox,
        renderer,
        provider_registry: ProviderRegistry::with_default_providers(),
    };

    let report = controller::execute_run(input)?;

    let exit_code = if report.status == RunStatus::Aborted || report.had_agent_failure {
        1
    } else {
        0
    };
    Ok(exit_code)
}

/// Install a SIGINT/SIGTERM handler that terminates the active run through
/// the abort registry rather than killing the process outright, so in-flight
/// credentials get torn down and the run record lands in a terminal state.
fn install_signal_handler() {
    let _ = ctrlc::set_handler(|| {
        voratiq_core::abort::terminate_active_run();
    });
}

fn render_error(err: &anyhow::Error) {
    eprintln!("error: {err:#}");
    let combined = format!("{err:#}");
    if let Some(hint) = claude_reauth_hint(&combined) {
        eprintln!("hint: {hint}");
    }
}
