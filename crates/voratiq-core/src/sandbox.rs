//! Spawns the agent process under its manifest, tees stdout/stderr to log
//! files, and polls the watchdog alongside the child's exit status.
//!
//! Grounded on the poll-loop idiom of a timeout-aware subprocess runner
//! (`try_wait` + short sleeps instead of blocking `wait`), extended here to
//! also stream output to disk incrementally rather than buffering it in
//! memory until exit.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::SandboxPolicy;
use crate::error::{RunError, RunErrorKind};
use crate::manifest::Manifest;
use crate::record_store::atomic_write_json;
use crate::watchdog::{TriggerReason, Watchdog};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Write the merged, per-agent sandbox policy to `runtime/sandbox.json`.
pub fn write_sandbox_policy(agent_root: &Path, policy: &SandboxPolicy) -> Result<()> {
    let path = agent_root.join("runtime").join("sandbox.json");
    atomic_write_json(&path, policy)
        .with_context(|| format!("failed to write sandbox policy at {}", path.display()))
}

#[derive(Debug)]
pub struct SandboxOutcome {
    pub exit_code: Option<i32>,
    pub trigger: Option<TriggerReason>,
}

/// Launch `manifest.binary` with `manifest.argv`/`manifest.env`, current
/// directory `workspace_absolute`, tee-ing output to
/// `agent_root/artifacts/{stdout,stderr}.log`. Returns once the child exits
/// or the watchdog forces it to. Log files are always closed before
/// returning, on every exit path.
pub fn launch(
    manifest: &Manifest,
    agent_root: &Path,
    workspace_absolute: &Path,
) -> Result<SandboxOutcome> {
    let artifacts = agent_root.join("artifacts");
    std::fs::create_dir_all(&artifacts)
        .with_context(|| format!("failed to create {}", artifacts.display()))?;
    let stdout_log = artifacts.join("stdout.log");
    let stderr_log = artifacts.join("stderr.log");

    let mut command = Command::new(&manifest.binary);
    command
        .args(&manifest.argv)
        .current_dir(workspace_absolute)
        .env_clear()
        .envs(&manifest.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| {
        RunError::err(
            RunErrorKind::Sandbox,
            format!("failed to spawn {}: {e}", manifest.binary),
        )
    })?;

    let watchdog = Watchdog::new(
        Duration::from_millis(manifest.runtime.silence_timeout_ms),
        Duration::from_millis(manifest.runtime.wall_clock_cap_ms),
    );

    let result = run_with_streams(&mut child, &watchdog, &stdout_log, &stderr_log);

    result
}

fn run_with_streams(
    child: &mut Child,
    watchdog: &Watchdog,
    stdout_log: &Path,
    stderr_log: &Path,
) -> Result<SandboxOutcome> {
    let stdout = child.stdout.take().context("child has no stdout handle")?;
    let stderr = child.stderr.take().context("child has no stderr handle")?;

    let (activity_tx, activity_rx) = mpsc::channel::<()>();
    let stdout_thread = spawn_tee_thread(stdout, stdout_log.to_path_buf(), activity_tx.clone())?;
    let stderr_thread = spawn_tee_thread(stderr, stderr_log.to_path_buf(), activity_tx)?;

    let mut trigger = None;
    let exit_code = loop {
        while activity_rx.try_recv().is_ok() {
            watchdog.touch();
        }

        match child.try_wait().context("failed to poll child process")? {
            Some(status) => break status.code(),
            None => {
                if let Some(reason) = watchdog.check() {
                    trigger = Some(reason);
                    terminate(child);
                    let status = child.wait().context("failed to wait on terminated child")?;
                    break status.code();
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    };

    let _ = stdout_thread.join();
    let _ = stderr_thread.join();

    Ok(SandboxOutcome { exit_code, trigger })
}

fn spawn_tee_thread<R: Read + Send + 'static>(
    mut reader: R,
    log_path: std::path::PathBuf,
    activity: mpsc::Sender<()>,
) -> Result<std::thread::JoinHandle<()>> {
    let mut file = File::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    Ok(std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = file.write_all(&buf[..n]);
                    let _ = activity.send(());
                }
                Err(_) => break,
            }
        }
        let _ = file.sync_all();
    }))
}

/// Polite-then-forceful termination: SIGTERM on unix, with a short grace
/// period before SIGKILL; `Child::kill` (SIGKILL) elsewhere.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    // SAFETY: signal 15 (SIGTERM) requests termination; the child may ignore
    // it, in which case the SIGKILL fallback below forces it.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if std::time::Instant::now() >= deadline => break,
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(_) => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
