//! Error taxonomy for the instrumentation lifecycle.
//!
//! Errors are scoped to a single container: batch drivers catch them, count
//! them, and move on to the next container.

use std::fmt;
use std::path::PathBuf;

use crate::cmd::CmdError;

/// A step of the destructive replace sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Inspect,
    Stop,
    Commit,
    Remove,
    Recreate,
    Persist,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Inspect => "inspect",
            Step::Stop => "stop",
            Step::Commit => "commit",
            Step::Remove => "remove",
            Step::Recreate => "recreate",
            Step::Persist => "persist",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    /// The workload is no longer running.
    High,
}

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to inspect container {container}: {reason}")]
    InspectionFailed { container: String, reason: String },

    #[error("container {0} is already instrumented")]
    AlreadyInstrumented(String),

    #[error("container {0} was not instrumented by this tool")]
    NotInstrumentedByThisTool(String),

    #[error(
        "{step} failed for container {container}: {reason}{}",
        format_remediation(.remediation)
    )]
    MutationFailed {
        container: String,
        step: Step,
        reason: String,
        remediation: Option<String>,
    },

    #[error(
        "no usable recreation command recorded for {container}; its ledger entry was removed. \
         Remove JAVA_TOOL_OPTIONS and MW_* variables from the container manually and restart it"
    )]
    DegradedRestore { container: String },

    #[error("ledger {} is corrupt: {reason}", .path.display())]
    LedgerCorrupt { path: PathBuf, reason: String },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid recreation command: {0}")]
    InvalidCommand(String),

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("cancelled before {0}")]
    Cancelled(Step),

    #[error("{0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_remediation(remediation: &Option<String>) -> String {
    match remediation {
        Some(text) => format!("\n  Remediation: {}", text),
        None => String::new(),
    }
}

impl InjectError {
    pub fn mutation(container: &str, step: Step, cause: impl fmt::Display) -> Self {
        InjectError::MutationFailed {
            container: container.to_string(),
            step,
            reason: cause.to_string(),
            remediation: None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            InjectError::MutationFailed {
                step: Step::Recreate,
                ..
            } => Severity::High,
            _ => Severity::Low,
        }
    }

    /// Expected conditions that a batch reports as skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            InjectError::NotFound(_)
                | InjectError::AlreadyInstrumented(_)
                | InjectError::NotInstrumentedByThisTool(_)
        )
    }
}

impl From<CmdError> for InjectError {
    fn from(err: CmdError) -> Self {
        match err {
            CmdError::Timeout { command, secs } => InjectError::Timeout { command, secs },
            other => InjectError::Runtime(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_recreate_failures_are_high_severity() {
        let recreate = InjectError::mutation("orders", Step::Recreate, "boom");
        let remove = InjectError::mutation("orders", Step::Remove, "boom");
        assert_eq!(recreate.severity(), Severity::High);
        assert_eq!(remove.severity(), Severity::Low);
        assert_eq!(InjectError::NotFound("x".into()).severity(), Severity::Low);
    }

    #[test]
    fn remediation_is_part_of_the_message() {
        let err = InjectError::MutationFailed {
            container: "orders".into(),
            step: Step::Recreate,
            reason: "port in use".into(),
            remediation: Some("docker run -d --name orders acme/orders".into()),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("recreate failed for container orders: port in use"));
        assert!(msg.contains("Remediation: docker run -d --name orders acme/orders"));
    }

    #[test]
    fn timeouts_survive_conversion() {
        let err: InjectError = CmdError::Timeout {
            command: "docker stop x".into(),
            secs: 5,
        }
        .into();
        assert!(matches!(err, InjectError::Timeout { secs: 5, .. }));
    }

    #[test]
    fn skip_classification() {
        assert!(InjectError::AlreadyInstrumented("a".into()).is_skip());
        assert!(InjectError::NotFound("a".into()).is_skip());
        assert!(!InjectError::mutation("a", Step::Stop, "x").is_skip());
    }
}
