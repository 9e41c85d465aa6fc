//! The progress-reporting seam between the engine and its host (a CLI,
//! a test harness, anything else embedding `execute_run`).

use crate::types::{AgentInvocationRecord, RunReport};

/// Matches the engine-level invocation surface's
/// `renderer: { update(agent-snapshot), complete(report) }`.
pub trait Renderer: Send + Sync {
    fn update(&self, agent: &AgentInvocationRecord);
    fn complete(&self, report: &RunReport);
}

/// A renderer that discards everything; useful for tests and for
/// `execute_run` callers that only care about the returned `RunReport`.
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn update(&self, _agent: &AgentInvocationRecord) {}
    fn complete(&self, _report: &RunReport) {}
}
