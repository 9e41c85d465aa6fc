//! Process-global active-run registry consulted by signal handlers.
//!
//! Only one run is ever active per process, so a process-global registry is
//! sufficient here. Registration and clearing are paired the same way a lock
//! guard is acquired and released, just without an RAII guard type, since the
//! registry's lifetime spans the whole run rather than a single scope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::credentials::CredentialRegistry;
use crate::record_store::RecordStore;
use crate::types::{AgentStatus, RunStatus};

const ABORT_WARNING: &str = "agent aborted: run was terminated";

/// Identity and handles for the currently executing run, registered by the
/// run controller for the duration of `execute_run`.
pub struct ActiveRun {
    pub run_id: String,
    pub record_store: Arc<RecordStore>,
    pub credential_registry: Arc<CredentialRegistry>,
    pub abort_flag: Arc<AtomicBool>,
}

static ACTIVE_RUN: Mutex<Option<ActiveRun>> = Mutex::new(None);

/// Register the active run. Replaces any prior registration; the run
/// controller is responsible for calling [`clear`] once it returns.
pub fn register(active: ActiveRun) {
    *ACTIVE_RUN.lock().expect("lock poisoned") = Some(active);
}

/// Clear the registered run. A no-op if nothing is registered.
pub fn clear() {
    *ACTIVE_RUN.lock().expect("lock poisoned") = None;
}

/// Terminate the currently active run, if any: rewrite its record to
/// `aborted`, mark every non-terminal agent `aborted` with a standard
/// warning, flush the record buffer synchronously, tear down all staged
/// credentials, and clear the slot. Returns `false` when no run was
/// registered. `applyStatus` and any already-terminal agent statuses are
/// preserved by the record store's own merge rules.
pub fn terminate_active_run() -> bool {
    let active = ACTIVE_RUN.lock().expect("lock poisoned").take();
    let Some(active) = active else {
        return false;
    };

    active.abort_flag.store(true, Ordering::SeqCst);
    let _ = abort_record(&active);
    let _ = active.record_store.flush_all();
    let _ = active.credential_registry.teardown_all();
    true
}

fn abort_record(active: &ActiveRun) -> Result<()> {
    active.record_store.rewrite(&active.run_id, |record| {
        record.status = RunStatus::Aborted;
        for agent in &mut record.agents {
            if !agent.status.is_terminal() {
                agent.status = AgentStatus::Aborted;
                agent.push_warning(ABORT_WARNING);
            }
        }
    })?;
    Ok(())
}
