//! Iteration state machine
//!
//! At most one iteration is live. Transitions:
//!
//! ```text
//! idle ──begin──▶ pending ──approve──▶ approved ──▶ applied ──▶ idle
//!                    │  ▲                   │
//!                    │  └── add_pending     └──fail──▶ error (until reset)
//!                    └──reject──▶ rejected ──▶ idle
//! ```

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Idle,
    Pending,
    Approved,
    Rejected,
    Applied,
    Error,
}

impl IterationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            IterationStatus::Idle => "idle",
            IterationStatus::Pending => "pending",
            IterationStatus::Approved => "approved",
            IterationStatus::Rejected => "rejected",
            IterationStatus::Applied => "applied",
            IterationStatus::Error => "error",
        }
    }
}

impl fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingFile {
    pub target: String,
    pub staged: PathBuf,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub id: String,
    pub status: IterationStatus,
    pub requester: String,
    pub description: String,
    /// Insertion order is apply order
    pub pending: Vec<PendingFile>,
    pub created_at: DateTime<Local>,
    pub error: Option<String>,
}

impl IterationRecord {
    pub fn age(&self) -> Duration {
        (Local::now() - self.created_at).to_std().unwrap_or_default()
    }

    pub fn targets(&self) -> Vec<&str> {
        self.pending.iter().map(|p| p.target.as_str()).collect()
    }
}

#[derive(Debug, Default)]
pub struct IterationState {
    current: Option<IterationRecord>,
}

impl IterationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> IterationStatus {
        self.current
            .as_ref()
            .map(|r| r.status)
            .unwrap_or(IterationStatus::Idle)
    }

    pub fn current(&self) -> Option<&IterationRecord> {
        self.current.as_ref()
    }

    /// Fail fast unless a new iteration could start right now.
    pub fn guard_new(&self) -> Result<()> {
        match &self.current {
            None => Ok(()),
            Some(record) if record.status == IterationStatus::Pending => {
                Err(PipelineError::Conflict {
                    iteration_id: record.id.clone(),
                    requester: record.requester.clone(),
                    description: record.description.clone(),
                })
            }
            Some(record) if record.status == IterationStatus::Error => Err(PipelineError::State(
                format!(
                    "Iteration {} failed ({}); reset before starting another",
                    record.id,
                    record.error.as_deref().unwrap_or("unknown error")
                ),
            )),
            Some(record) => Err(PipelineError::State(format!(
                "Iteration {} is {}; wait for it to finish",
                record.id, record.status
            ))),
        }
    }

    /// Fail fast unless `id` names the open pending iteration.
    pub fn guard_existing(&self, id: &str) -> Result<()> {
        match &self.current {
            Some(record) if record.status == IterationStatus::Pending && record.id == id => Ok(()),
            Some(record) if record.status == IterationStatus::Pending => {
                Err(PipelineError::Conflict {
                    iteration_id: record.id.clone(),
                    requester: record.requester.clone(),
                    description: record.description.clone(),
                })
            }
            _ => Err(PipelineError::State(format!(
                "Iteration {} is not pending; start a new one",
                id
            ))),
        }
    }

    /// idle → pending with the first staged file.
    pub fn begin(
        &mut self,
        requester: &str,
        description: &str,
        file: PendingFile,
    ) -> Result<String> {
        self.guard_new()?;
        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(iteration = id.as_str(), requester, "iteration pending");
        self.current = Some(IterationRecord {
            id: id.clone(),
            status: IterationStatus::Pending,
            requester: requester.to_string(),
            description: description.to_string(),
            pending: vec![file],
            created_at: Local::now(),
            error: None,
        });
        Ok(id)
    }

    /// pending → pending. Re-staging a target keeps its original slot.
    pub fn add_pending(&mut self, id: &str, file: PendingFile) -> Result<()> {
        self.guard_existing(id)?;
        let record = self.pending_mut()?;
        match record.pending.iter_mut().find(|p| p.target == file.target) {
            Some(existing) => *existing = file,
            None => record.pending.push(file),
        }
        tracing::debug!(iteration = id, files = record.pending.len(), "added pending file");
        Ok(())
    }

    /// pending → approved
    pub fn mark_approved(&mut self) -> Result<&IterationRecord> {
        let record = self.pending_mut()?;
        record.status = IterationStatus::Approved;
        tracing::info!(iteration = record.id.as_str(), "iteration approved");
        Ok(record)
    }

    /// approved → applied
    pub fn mark_applied(&mut self) -> Result<()> {
        let record = self.expect_status(IterationStatus::Approved)?;
        record.status = IterationStatus::Applied;
        tracing::info!(iteration = record.id.as_str(), "iteration applied");
        Ok(())
    }

    /// pending → rejected
    pub fn mark_rejected(&mut self) -> Result<&IterationRecord> {
        let record = self.pending_mut()?;
        record.status = IterationStatus::Rejected;
        tracing::info!(iteration = record.id.as_str(), "iteration rejected");
        Ok(record)
    }

    /// pending or approved → error
    pub fn mark_error(&mut self, message: &str) {
        if let Some(record) = self.current.as_mut() {
            if matches!(
                record.status,
                IterationStatus::Pending | IterationStatus::Approved
            ) {
                record.status = IterationStatus::Error;
                record.error = Some(message.to_string());
                tracing::error!(iteration = record.id.as_str(), "iteration failed: {}", message);
            }
        }
    }

    /// applied or rejected → idle
    pub fn finish(&mut self) -> Option<IterationRecord> {
        match self.status() {
            IterationStatus::Applied | IterationStatus::Rejected => self.current.take(),
            _ => None,
        }
    }

    /// Any state → idle. Bookkeeping only; staged files are untouched.
    pub fn reset(&mut self) -> Option<IterationRecord> {
        let previous = self.current.take();
        if let Some(record) = &previous {
            tracing::info!(
                iteration = record.id.as_str(),
                status = %record.status,
                "iteration reset"
            );
        }
        previous
    }

    fn pending_mut(&mut self) -> Result<&mut IterationRecord> {
        self.expect_status(IterationStatus::Pending)
    }

    fn expect_status(&mut self, status: IterationStatus) -> Result<&mut IterationRecord> {
        match self.current.as_mut() {
            Some(record) if record.status == status => Ok(record),
            Some(record) => Err(PipelineError::State(format!(
                "Iteration {} is {}, not {}",
                record.id, record.status, status
            ))),
            None => Err(PipelineError::State(
                "No iteration in progress".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn file(target: &str, summary: &str) -> PendingFile {
        PendingFile {
            target: target.to_string(),
            staged: PathBuf::from(format!("/shadow/{}", target)),
            summary: summary.to_string(),
        }
    }

    #[test]
    fn test_full_approval_cycle() {
        let mut state = IterationState::new();
        assert_eq!(state.status(), IterationStatus::Idle);

        let id = state.begin("alice", "tweak", file("src/a.py", "+1")).unwrap();
        assert_eq!(state.status(), IterationStatus::Pending);
        assert_eq!(state.current().unwrap().id, id);

        state.mark_approved().unwrap();
        state.mark_applied().unwrap();
        let done = state.finish().unwrap();
        assert_eq!(done.status, IterationStatus::Applied);
        assert_eq!(state.status(), IterationStatus::Idle);
    }

    #[test]
    fn test_conflict_leaves_pending_untouched() {
        let mut state = IterationState::new();
        let id = state.begin("alice", "first", file("src/a.py", "+1")).unwrap();

        let err = state.begin("bob", "second", file("src/b.py", "+2")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        match err {
            PipelineError::Conflict {
                iteration_id,
                requester,
                description,
            } => {
                assert_eq!(iteration_id, id);
                assert_eq!(requester, "alice");
                assert_eq!(description, "first");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(state.current().unwrap().targets(), vec!["src/a.py"]);
    }

    #[test]
    fn test_restage_keeps_insertion_slot() {
        let mut state = IterationState::new();
        let id = state.begin("alice", "multi", file("src/a.py", "v1")).unwrap();
        state.add_pending(&id, file("src/b.py", "b")).unwrap();
        state.add_pending(&id, file("src/a.py", "v2")).unwrap();

        let record = state.current().unwrap();
        assert_eq!(record.targets(), vec!["src/a.py", "src/b.py"]);
        assert_eq!(record.pending[0].summary, "v2");
    }

    #[test]
    fn test_add_to_unknown_iteration_conflicts() {
        let mut state = IterationState::new();
        state.begin("alice", "one", file("src/a.py", "")).unwrap();
        let err = state.add_pending("other-id", file("src/b.py", "")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let mut idle = IterationState::new();
        let err = idle.add_pending("x", file("src/b.py", "")).unwrap_err();
        assert!(err.is_informational());
    }

    #[test]
    fn test_reject_cycle() {
        let mut state = IterationState::new();
        state.begin("alice", "nope", file("src/a.py", "")).unwrap();
        state.mark_rejected().unwrap();
        assert_eq!(state.status(), IterationStatus::Rejected);
        assert!(state.finish().is_some());
        assert_eq!(state.status(), IterationStatus::Idle);
    }

    #[test]
    fn test_error_blocks_until_reset() {
        let mut state = IterationState::new();
        state.begin("alice", "boom", file("src/a.py", "")).unwrap();
        state.mark_approved().unwrap();
        state.mark_error("disk full");
        assert_eq!(state.status(), IterationStatus::Error);
        assert!(state.finish().is_none());

        let err = state.begin("bob", "next", file("src/b.py", "")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(err.to_string().contains("disk full"));

        state.reset();
        assert!(state.begin("bob", "next", file("src/b.py", "")).is_ok());
    }

    #[test]
    fn test_invalid_transitions_are_state_failures() {
        let mut state = IterationState::new();
        assert!(state.mark_approved().unwrap_err().is_informational());
        assert!(state.mark_rejected().unwrap_err().is_informational());
        assert!(state.mark_applied().unwrap_err().is_informational());
        assert!(state.reset().is_none());
    }
}
