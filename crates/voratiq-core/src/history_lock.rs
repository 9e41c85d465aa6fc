//! Exclusive inter-process lock over the run index, with stale-owner
//! detection and exponential backoff on contention.
//!
//! Acquisition creates the lock file with `O_EXCL` semantics; on contention it
//! retries with exponential backoff and jitter via [`voratiq_retry`] until a
//! timeout elapses, reclaiming the lock first if its recorded owner looks
//! stale (old mtime and an owner pid that is absent, self, or not alive).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{RunError, RunErrorKind};

pub const LOCK_FILE_NAME: &str = "history.lock";

/// One-line JSON payload written into the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockPayload {
    pub pid: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A held lock; releases the underlying file on `Drop`.
pub struct HistoryLock {
    path: PathBuf,
}

/// Tuning knobs for [`HistoryLock::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            min_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl HistoryLock {
    /// Acquire the lock at `runs_dir/history.lock`, retrying with exponential
    /// backoff and jitter until `options.timeout` elapses.
    pub fn acquire(runs_dir: &Path, options: LockOptions) -> Result<Self> {
        let path = runs_dir.join(LOCK_FILE_NAME);
        fs::create_dir_all(runs_dir)
            .with_context(|| format!("failed to create runs dir {}", runs_dir.display()))?;

        let retry_config = voratiq_retry::RetryStrategyConfig {
            strategy: voratiq_retry::RetryStrategyType::Exponential,
            max_attempts: u32::MAX,
            base_delay: options.min_backoff,
            max_delay: options.max_backoff,
            jitter: 0.5,
        };

        let deadline = Instant::now() + options.timeout;
        let mut attempt: u32 = 0;

        loop {
            match try_create(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(CreateError::AlreadyExists) => {
                    reclaim_if_stale(&path, options.timeout)?;
                    if Instant::now() >= deadline {
                        return Err(RunError::err(
                            RunErrorKind::HistoryLockTimeout,
                            format!(
                                "timed out acquiring history lock at {} after {:?}",
                                path.display(),
                                options.timeout
                            ),
                        ));
                    }
                    attempt += 1;
                    let delay = voratiq_retry::calculate_delay(&retry_config, attempt);
                    std::thread::sleep(delay.min(deadline.saturating_duration_since(Instant::now())));
                }
                Err(CreateError::Other(err)) => {
                    return Err(err).with_context(|| {
                        format!("failed to create history lock at {}", path.display())
                    });
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HistoryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

enum CreateError {
    AlreadyExists,
    Other(std::io::Error),
}

fn try_create(path: &Path) -> Result<(), CreateError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                CreateError::AlreadyExists
            } else {
                CreateError::Other(e)
            }
        })?;

    let payload = LockPayload {
        pid: std::process::id(),
        created_at: chrono::Utc::now(),
    };
    let json = serde_json::to_string(&payload).expect("lock payload always serializes");
    file.write_all(json.as_bytes())
        .map_err(CreateError::Other)?;
    file.sync_all().map_err(CreateError::Other)?;
    Ok(())
}

/// If the lock file's mtime is older than `2 × timeout` and the recorded
/// owner is absent, self, or not alive (zero-signal probe), unlink it so the
/// next create attempt can succeed.
fn reclaim_if_stale(path: &Path, timeout: Duration) -> Result<()> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("failed to stat history lock"),
    };
    let modified = metadata.modified().context("lock file has no mtime")?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    let grace = timeout.saturating_mul(2);
    if age < grace {
        return Ok(());
    }

    let owner_pid = fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str::<LockPayload>(&content).ok())
        .map(|p| p.pid);

    let stale = match owner_pid {
        None => true,
        Some(pid) => pid == std::process::id() || !process_is_alive(pid),
    };

    if stale {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove stale history lock"),
        }
    } else {
        Ok(())
    }
}

/// Zero-signal existence check: `kill(pid, 0)` on unix, best-effort elsewhere.
#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond checking process existence
    // and permission; it never affects process state.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    true
}
