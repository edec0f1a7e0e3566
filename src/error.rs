//! Error taxonomy for the staged-mutation pipeline.
//!
//! Every pipeline operation returns `Result<_, PipelineError>`. The
//! variants group into the classes reported by [`PipelineError::kind`];
//! `State` failures are informational no-ops rather than faults.

use crate::verify::VerificationReport;
use std::path::PathBuf;

/// Coarse class of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Policy,
    Validation,
    Io,
    Integrity,
    Conflict,
    State,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Target outside the allow list or matching a deny pattern.
    #[error("Path '{path}' is not allowed: {reason}")]
    PolicyViolation { path: String, reason: String },

    /// The verifier reported blocking diagnostics.
    #[error("Verification failed for '{path}'\n{}", .report.render())]
    Validation {
        path: String,
        report: VerificationReport,
    },

    /// Filesystem failure during stage/backup/apply/rollback.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Staged source missing: {}", .0.display())]
    StagedMissing(PathBuf),

    #[error("Backup file missing: {}", .0.display())]
    BackupMissing(PathBuf),

    /// Post-copy checksum mismatch.
    #[error("Integrity check failed for '{target}': expected {expected}, found {actual}")]
    Integrity {
        target: String,
        expected: String,
        actual: String,
    },

    /// A new iteration was requested while another one is open.
    #[error(
        "Iteration {iteration_id} from {requester} is still pending ({description}); approve or reject it first"
    )]
    Conflict {
        iteration_id: String,
        requester: String,
        description: String,
    },

    /// The current state does not permit the operation.
    #[error("{0}")]
    State(String),

    #[error("No backup matches '{0}'")]
    BackupNotFound(String),

    #[error("Backup id '{query}' is ambiguous: {}", .candidates.join(", "))]
    AmbiguousBackup {
        query: String,
        candidates: Vec<String>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::PolicyViolation { .. } => ErrorKind::Policy,
            PipelineError::Validation { .. } => ErrorKind::Validation,
            PipelineError::Io { .. }
            | PipelineError::StagedMissing(_)
            | PipelineError::BackupMissing(_) => ErrorKind::Io,
            PipelineError::Integrity { .. } => ErrorKind::Integrity,
            PipelineError::Conflict { .. } => ErrorKind::Conflict,
            PipelineError::State(_)
            | PipelineError::BackupNotFound(_)
            | PipelineError::AmbiguousBackup { .. } => ErrorKind::State,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// State failures are reported as notices, not errors.
    pub fn is_informational(&self) -> bool {
        self.kind() == ErrorKind::State
    }

    /// What the user should do about this failure.
    pub fn hint(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Policy => "Choose a path inside the allowed directories.",
            ErrorKind::Validation => "Fix the reported errors and re-submit the file.",
            ErrorKind::Io => "Check permissions and free disk space, then retry.",
            ErrorKind::Integrity => {
                "Inspect the target file and roll back from the backup if needed."
            }
            ErrorKind::Conflict => {
                "Approve or reject the pending iteration before starting another."
            }
            ErrorKind::State => "Check the current status and try again.",
            ErrorKind::Internal => "Inspect the status, then reset the iteration.",
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_failures_are_informational() {
        let err = PipelineError::State("Nothing is pending".to_string());
        assert!(err.is_informational());
        assert_eq!(err.kind(), ErrorKind::State);

        let err = PipelineError::StagedMissing(PathBuf::from("/tmp/x"));
        assert!(!err.is_informational());
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_conflict_message_names_existing_iteration() {
        let err = PipelineError::Conflict {
            iteration_id: "abc".to_string(),
            requester: "alice".to_string(),
            description: "src/a.py".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("abc"));
        assert!(text.contains("alice"));
        assert!(text.contains("src/a.py"));
    }

    #[test]
    fn test_ambiguous_backup_lists_candidates() {
        let err = PipelineError::AmbiguousBackup {
            query: "2024".to_string(),
            candidates: vec!["20240101_000000".to_string(), "20240102_000000".to_string()],
        };
        assert!(err.to_string().contains("20240101_000000, 20240102_000000"));
    }
}
