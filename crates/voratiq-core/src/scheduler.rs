//! Bounded worker pool driving prepared agents to completion.
//!
//! Each worker repeatedly claims the next unstarted agent index via an
//! atomic counter rather than processing a fixed batch, so a fast agent
//! doesn't sit idle behind a slow one claimed earlier in the same run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::lifecycle::{self, LifecycleContext, PreparedAgent};
use crate::types::AgentInvocationRecord;

/// Run every `PreparedAgent` to completion using `min(limit, agents.len())`
/// worker threads. Results are written into a position-indexed slot (so no
/// lock is held for the duration of an agent's run) and re-sorted by
/// `agentId` before returning, so the final order is independent of
/// completion order.
pub fn run_agents(
    agents: Vec<PreparedAgent>,
    ctx: Arc<LifecycleContext>,
    limit: usize,
) -> Vec<AgentInvocationRecord> {
    if agents.is_empty() {
        return Vec::new();
    }

    let worker_count = limit.min(agents.len()).max(1);
    let agent_count = agents.len();
    let agents = Arc::new(agents);
    let next_index = Arc::new(AtomicUsize::new(0));
    let results: Arc<Mutex<Vec<Option<AgentInvocationRecord>>>> =
        Arc::new(Mutex::new((0..agent_count).map(|_| None).collect()));

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let agents = Arc::clone(&agents);
        let next_index = Arc::clone(&next_index);
        let results = Arc::clone(&results);
        let ctx = Arc::clone(&ctx);
        workers.push(std::thread::spawn(move || loop {
            let index = next_index.fetch_add(1, Ordering::SeqCst);
            if index >= agents.len() {
                break;
            }
            let record = lifecycle::run(&agents[index], &ctx);
            results.lock().expect("lock poisoned")[index] = Some(record);
        }));
    }
    for worker in workers {
        let _ = worker.join();
    }

    let mut records: Vec<AgentInvocationRecord> = Arc::try_unwrap(results)
        .map(|m| m.into_inner().expect("lock poisoned"))
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .collect();
    records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    records
}
