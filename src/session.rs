//! Pipeline session: the operation set collaborators drive
//!
//! A [`Pipeline`] owns one of each component plus the policy and config.
//! It is constructed explicitly and owned by the caller; nothing here is
//! global.

use crate::config::Config;
use crate::diff::{DiffGenerator, DiffStats};
use crate::error::{PipelineError, Result};
use crate::patcher::{BackupRecord, Patcher, RollbackReport};
use crate::policy::{PathPolicy, TargetPath};
use crate::state::{IterationRecord, IterationState, IterationStatus, PendingFile};
use crate::verify::{SyntaxVerifier, VerificationReport};
use crate::workspace::{ShadowEntry, ShadowStats, ShadowWorkspace};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct ProposeRequest {
    /// `None` starts a new iteration; `Some(id)` adds to the open one
    pub iteration: Option<String>,
    pub requester: String,
    pub description: String,
    pub target: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub iteration_id: String,
    pub target: String,
    pub staged: PathBuf,
    pub is_new_file: bool,
    pub stats: DiffStats,
    /// Full unified diff, empty when diff reports are disabled
    pub diff: String,
    /// `None` when syntax checking is disabled
    pub verification: Option<VerificationReport>,
    pub pending_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileDiff {
    pub target: String,
    pub is_new_file: bool,
    pub stats: DiffStats,
    pub diff: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedFile {
    pub target: String,
    pub backup_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalReport {
    pub iteration_id: String,
    pub reviewer: String,
    /// `Idle` once the batch ran, `Error` after an internal fault
    pub status: IterationStatus,
    pub applied: Vec<AppliedFile>,
    pub failed: Vec<FailedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectReport {
    pub iteration_id: String,
    pub reviewer: String,
    pub discarded: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: IterationStatus,
    pub iteration: Option<IterationRecord>,
    /// Pending longer than the approval timeout
    pub overdue: bool,
    pub staged: Vec<ShadowEntry>,
    /// Staged files no live iteration owns
    pub orphans: Vec<ShadowEntry>,
    pub shadow: ShadowStats,
    pub backup_count: usize,
}

#[derive(Debug)]
pub struct Pipeline {
    config: Config,
    policy: PathPolicy,
    verifier: SyntaxVerifier,
    differ: DiffGenerator,
    workspace: ShadowWorkspace,
    patcher: Patcher,
    state: IterationState,
}

impl Pipeline {
    pub fn open(root: &Path, config: Config) -> Result<Self> {
        let policy = PathPolicy::new(root, &config.security)?;
        let root = policy.root().to_path_buf();

        let workspace = ShadowWorkspace::open(
            &config.iteration.shadow_root(&root),
            config.iteration.shadow_max_age(),
        )?;
        let patcher = Patcher::open(
            &config.iteration.backup_root(&root),
            config.iteration.max_backups,
        )?
        .with_origin_root(&root);

        tracing::info!(
            root = %root.display(),
            staged = workspace.list_staged().len(),
            "pipeline opened"
        );

        Ok(Self {
            differ: DiffGenerator::new(config.iteration.diff_context_lines),
            verifier: SyntaxVerifier::new(),
            state: IterationState::new(),
            config,
            policy,
            workspace,
            patcher,
        })
    }

    pub fn root(&self) -> &Path {
        self.policy.root()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn current(&self) -> Option<&IterationRecord> {
        self.state.current()
    }

    /// Validate, verify and stage one file, opening or extending an iteration.
    pub fn propose(&mut self, request: ProposeRequest) -> Result<StageOutcome> {
        let target = self.policy.check_write(&request.target)?;

        match &request.iteration {
            None => {
                self.state.guard_new()?;
                // Nothing is live, so nothing staged can belong to an iteration.
                self.workspace.expire();
            }
            Some(id) => self.state.guard_existing(id)?,
        }

        let verification = if self.config.iteration.enable_syntax_check {
            let report = self.verifier.verify(&request.content, target.as_str());
            if !report.passed {
                return Err(PipelineError::Validation {
                    path: target.to_string(),
                    report,
                });
            }
            Some(report)
        } else {
            tracing::debug!(file = target.as_str(), "syntax check disabled; skipped");
            None
        };

        let original = read_original(&target)?;
        let staged = self.workspace.stage(target.as_str(), &request.content)?;

        let stats = self
            .differ
            .stats(original.as_deref().unwrap_or(""), &request.content);
        let file = PendingFile {
            target: target.to_string(),
            staged: staged.clone(),
            summary: stats.to_string(),
        };

        let transition = match &request.iteration {
            None => self
                .state
                .begin(&request.requester, &request.description, file),
            Some(id) => self.state.add_pending(id, file).map(|_| id.clone()),
        };
        let iteration_id = match transition {
            Ok(id) => id,
            Err(err) => {
                self.workspace.delete_staged(target.as_str());
                return Err(err);
            }
        };

        let diff = if self.config.iteration.enable_diff_report {
            self.file_diff(&target, original.as_deref(), &request.content)
        } else {
            String::new()
        };

        Ok(StageOutcome {
            iteration_id,
            target: target.to_string(),
            staged,
            is_new_file: original.is_none(),
            stats,
            diff,
            verification,
            pending_count: self.state.current().map(|r| r.pending.len()).unwrap_or(0),
        })
    }

    fn file_diff(&self, target: &TargetPath, original: Option<&str>, modified: &str) -> String {
        let label = target.as_str();
        let original_label = if original.is_some() {
            format!("a/{}", label)
        } else {
            "/dev/null".to_string()
        };
        self.differ.diff(
            original.unwrap_or(""),
            modified,
            &original_label,
            &format!("b/{}", label),
        )
    }

    /// Real-vs-staged diffs for the pending files, optionally only one target.
    pub fn diff(&self, target: Option<&str>) -> Result<Vec<FileDiff>> {
        let record = self
            .state
            .current()
            .filter(|r| r.status == IterationStatus::Pending)
            .ok_or_else(|| PipelineError::State("Nothing is pending".to_string()))?;

        let wanted = match target {
            Some(path) => {
                let checked = self.policy.check_write(path)?;
                if !record.pending.iter().any(|p| p.target == checked.as_str()) {
                    return Err(PipelineError::State(format!(
                        "{} is not part of iteration {}",
                        checked, record.id
                    )));
                }
                Some(checked.to_string())
            }
            None => None,
        };

        let mut diffs = Vec::new();
        for pending in &record.pending {
            if wanted.as_ref().is_some_and(|w| *w != pending.target) {
                continue;
            }
            let target = self.policy.check_write(&pending.target)?;
            let staged = self
                .workspace
                .read_staged(target.as_str())
                .ok_or_else(|| PipelineError::StagedMissing(pending.staged.clone()))?;
            let original = read_original(&target)?;

            diffs.push(FileDiff {
                target: pending.target.clone(),
                is_new_file: original.is_none(),
                stats: self.differ.stats(original.as_deref().unwrap_or(""), &staged),
                diff: self.file_diff(&target, original.as_deref(), &staged),
            });
        }
        Ok(diffs)
    }

    /// Apply every pending file in insertion order.
    ///
    /// Per-file failures (policy, missing staged copy, I/O, checksum) are
    /// reported in the batch and the iteration still completes; failed files
    /// keep their staged copy. Only an internal fault leaves the iteration in
    /// `error` until reset.
    pub fn approve(&mut self, reviewer: &str) -> Result<ApprovalReport> {
        let record = self.state.mark_approved()?.clone();
        tracing::info!(iteration = record.id.as_str(), reviewer, "approval started");

        let mut failed = Vec::new();
        let mut faults = Vec::new();
        let mut eligible = Vec::new();
        let mut items = Vec::new();
        for pending in &record.pending {
            // Re-checked in case the policy changed since staging.
            match self.policy.check_write(&pending.target) {
                Ok(target) => {
                    let staged = self
                        .workspace
                        .staged_path(&pending.target)
                        .unwrap_or_else(|| pending.staged.clone());
                    eligible.push(pending);
                    items.push((staged, target.absolute().to_path_buf()));
                }
                Err(err) => failed.push(FailedFile {
                    target: pending.target.clone(),
                    error: err.to_string(),
                }),
            }
        }

        let batch = self.patcher.apply_batch(&items, false);
        let mut applied = Vec::new();
        for (pending, item) in eligible.into_iter().zip(batch.results) {
            match item.outcome {
                Ok(report) => {
                    self.workspace.delete_staged(&pending.target);
                    applied.push(AppliedFile {
                        target: pending.target.clone(),
                        backup_id: report.backup.map(|b| b.id),
                    });
                }
                Err(err) => {
                    if err.kind() == crate::error::ErrorKind::Internal {
                        faults.push(format!("{}: {}", pending.target, err));
                    }
                    failed.push(FailedFile {
                        target: pending.target.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let completed = if faults.is_empty() {
            self.state.mark_applied()
        } else {
            Err(PipelineError::Internal(faults.join("; ")))
        };
        let status = match completed {
            Ok(()) => {
                self.state.finish();
                if !failed.is_empty() {
                    tracing::warn!(
                        iteration = record.id.as_str(),
                        applied = applied.len(),
                        failed = failed.len(),
                        "approval finished with failed files"
                    );
                }
                IterationStatus::Idle
            }
            Err(err) => {
                self.state.mark_error(&err.to_string());
                IterationStatus::Error
            }
        };

        Ok(ApprovalReport {
            iteration_id: record.id,
            reviewer: reviewer.to_string(),
            status,
            applied,
            failed,
        })
    }

    /// Discard the pending iteration. The real tree is never touched.
    pub fn reject(&mut self, reviewer: &str) -> Result<RejectReport> {
        let record = self.state.mark_rejected()?.clone();
        let discarded: Vec<String> = record
            .pending
            .iter()
            .filter(|p| self.workspace.delete_staged(&p.target))
            .map(|p| p.target.clone())
            .collect();
        self.state.finish();
        tracing::info!(
            iteration = record.id.as_str(),
            reviewer,
            discarded = discarded.len(),
            "iteration discarded"
        );

        Ok(RejectReport {
            iteration_id: record.id,
            reviewer: reviewer.to_string(),
            discarded,
        })
    }

    pub fn status(&self) -> StatusReport {
        let iteration = self.state.current().cloned();
        let owned: Vec<&str> = iteration
            .as_ref()
            .map(|r| r.targets())
            .unwrap_or_default();
        let staged = self.workspace.list_staged();
        let orphans = staged
            .iter()
            .filter(|e| !owned.contains(&e.target.as_str()))
            .cloned()
            .collect();
        let overdue = iteration.as_ref().is_some_and(|r| {
            r.status == IterationStatus::Pending
                && r.age() >= self.config.iteration.approval_timeout()
        });

        StatusReport {
            status: self.state.status(),
            overdue,
            shadow: self.workspace.stats(),
            backup_count: self.patcher.list_backups(None).len(),
            iteration,
            staged,
            orphans,
        }
    }

    /// Forget the iteration from any state. Staged files stay on disk.
    pub fn reset(&mut self) -> Option<IterationRecord> {
        self.state.reset()
    }

    /// Remove every staged file. Refused while an iteration is pending.
    pub fn clear_staged(&mut self) -> Result<usize> {
        if self.state.status() == IterationStatus::Pending {
            return Err(PipelineError::State(
                "An iteration is pending; reject it before clearing staged files".to_string(),
            ));
        }
        Ok(self.workspace.clear_all())
    }

    /// Restore a backup over its origin, taking a pre-rollback backup.
    pub fn rollback(&mut self, backup_id: &str) -> Result<RollbackReport> {
        let record = self.patcher.find_backup(backup_id)?;
        let target = self.policy.check_write(&record.origin)?;
        self.patcher.rollback(&record, target.absolute(), true)
    }

    pub fn list_backups(&self, target: Option<&str>) -> Result<Vec<BackupRecord>> {
        match target {
            Some(path) => {
                let target = self.policy.check_write(path)?;
                Ok(self.patcher.list_backups(Some(target.absolute())))
            }
            None => Ok(self.patcher.list_backups(None)),
        }
    }

    pub fn cleanup_backups(&self) -> Result<usize> {
        self.patcher.cleanup_old_backups(self.patcher.max_backups())
    }

    /// Policy-gated read of a file under the root.
    pub fn read_file(&self, path: &str) -> Result<String> {
        let target = self.policy.check_read(path)?;
        fs::read_to_string(target.absolute())
            .map_err(|e| PipelineError::io(format!("Failed to read {}", target), e))
    }

    /// Dry-run verification; stages nothing.
    pub fn verify(&self, content: &str, filename: &str) -> VerificationReport {
        self.verifier.verify(content, filename)
    }
}

/// Current content of the real file, `None` when it does not exist yet.
fn read_original(target: &TargetPath) -> Result<Option<String>> {
    match fs::read_to_string(target.absolute()) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PipelineError::io(format!("Failed to read {}", target), err)),
    }
}
