//! Tagged error kinds for the run orchestration engine.
//!
//! Every fallible operation in this crate returns `anyhow::Result<T>`. Where the
//! caller (the CLI, or a test) needs to know *which* of the taxonomy's kinds
//! produced a failure, the error is constructed via [`RunError::new`] and
//! attached to the `anyhow::Error` chain; `RunError::kind_of` walks the chain to
//! recover it.

use std::fmt;

use anyhow::Error;

/// The nine error kinds surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunErrorKind {
    Validation,
    WorkspaceSetup,
    Credential,
    ManifestWrite,
    Sandbox,
    AgentProcess,
    GitOperation,
    RunReportInvariant,
    HistoryLockTimeout,
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunErrorKind::Validation => "validation",
            RunErrorKind::WorkspaceSetup => "workspace-setup",
            RunErrorKind::Credential => "credential",
            RunErrorKind::ManifestWrite => "manifest-write",
            RunErrorKind::Sandbox => "sandbox",
            RunErrorKind::AgentProcess => "agent-process",
            RunErrorKind::GitOperation => "git-operation",
            RunErrorKind::RunReportInvariant => "run-report-invariant",
            RunErrorKind::HistoryLockTimeout => "history-lock-timeout",
        };
        f.write_str(s)
    }
}

/// A tagged error: a [`RunErrorKind`] plus a human-readable message.
///
/// Implements `std::error::Error` so it composes with `anyhow::Context`; the
/// kind survives in the error chain and can be recovered with
/// [`RunError::kind_of`].
#[derive(Debug)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an `anyhow::Error` directly from a kind and message.
    pub fn err(kind: RunErrorKind, message: impl Into<String>) -> Error {
        Error::new(Self::new(kind, message))
    }

    /// Walk an error chain looking for the first [`RunError`], returning its kind.
    pub fn kind_of(err: &Error) -> Option<RunErrorKind> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<RunError>())
            .map(|e| e.kind)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RunError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_of_recovers_through_context() {
        let err = Err::<(), _>(RunError::err(RunErrorKind::GitOperation, "commit failed"))
            .context("harvesting artifacts")
            .unwrap_err();

        assert_eq!(RunError::kind_of(&err), Some(RunErrorKind::GitOperation));
        assert!(format!("{err:#}").contains("commit failed"));
    }

    #[test]
    fn kind_of_is_none_for_plain_anyhow_errors() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(RunError::kind_of(&err), None);
    }
}
