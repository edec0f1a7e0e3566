//! Text command surface over a [`Pipeline`]
//!
//! Every outcome, failures included, renders as plain text that says what
//! happened and what to do next.

use crate::diff::truncate_diff;
use crate::error::PipelineError;
use crate::patcher::BackupRecord;
use crate::policy::AdminPolicy;
use crate::session::{Pipeline, ProposeRequest, StageOutcome};
use crate::state::IterationStatus;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

const BACKUP_LIST_LIMIT: usize = 10;

pub const HELP: &str = "\
Commands (leading / optional):
  start <target> <content-file> [description]  stage a file in a new iteration
  stage <target> <content-file>                 add a file to the open iteration
  approve                                       apply the pending iteration
  reject                                        discard the pending iteration
  diff [target]                                 show pending changes
  status                                        show iteration and staging state
  rollback [id]                                 restore a backup (no id lists them)
  backups                                       list backups, newest first
  reset                                         forget the current iteration
  clear                                         remove all staged files
  help                                          show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start {
        target: String,
        content_file: PathBuf,
        description: Option<String>,
    },
    Stage {
        target: String,
        content_file: PathBuf,
    },
    Approve,
    Reject,
    Diff {
        target: Option<String>,
    },
    Status,
    Rollback {
        id: Option<String>,
    },
    Backups,
    Reset,
    Clear,
    Help,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let Some(head) = parts.next() else {
            return Err("Empty command. Type `help` for the command list.".to_string());
        };
        let name = head.trim_start_matches('/').to_lowercase();
        let args: Vec<&str> = parts.collect();

        let command = match (name.as_str(), args.as_slice()) {
            ("start", [target, file, rest @ ..]) => Command::Start {
                target: target.to_string(),
                content_file: PathBuf::from(*file),
                description: (!rest.is_empty()).then(|| rest.join(" ")),
            },
            ("start", _) => {
                return Err("Usage: start <target> <content-file> [description]".to_string())
            }
            ("stage", [target, file]) => Command::Stage {
                target: target.to_string(),
                content_file: PathBuf::from(*file),
            },
            ("stage", _) => return Err("Usage: stage <target> <content-file>".to_string()),
            ("approve", []) => Command::Approve,
            ("reject", []) => Command::Reject,
            ("diff", []) => Command::Diff { target: None },
            ("diff", [target]) => Command::Diff {
                target: Some(target.to_string()),
            },
            ("status", []) => Command::Status,
            ("rollback", []) => Command::Rollback { id: None },
            ("rollback", [id]) => Command::Rollback {
                id: Some(id.to_string()),
            },
            ("backups", []) => Command::Backups,
            ("reset", []) => Command::Reset,
            ("clear", []) => Command::Clear,
            ("help", _) => Command::Help,
            ("approve" | "reject" | "status" | "backups" | "reset" | "clear", _) => {
                return Err(format!("`{}` takes no arguments.", name))
            }
            ("diff", _) => return Err("Usage: diff [target]".to_string()),
            ("rollback", _) => return Err("Usage: rollback [id]".to_string()),
            _ => {
                return Err(format!(
                    "Unknown command `{}`. Type `help` for the command list.",
                    name
                ))
            }
        };
        Ok(command)
    }

    /// Commands that change the real tree or discard work.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::Approve
                | Command::Reject
                | Command::Rollback { id: Some(_) }
                | Command::Reset
                | Command::Clear
        )
    }
}

#[derive(Debug, Clone)]
pub struct CommandContext {
    identity: String,
    admins: AdminPolicy,
    diff_max_lines: usize,
}

impl CommandContext {
    pub fn new(identity: &str, admins: AdminPolicy, diff_max_lines: usize) -> Self {
        Self {
            identity: identity.to_string(),
            admins,
            diff_max_lines,
        }
    }

    /// Parse and run one line.
    pub fn execute_line(&self, pipeline: &mut Pipeline, line: &str) -> String {
        match Command::parse(line) {
            Ok(command) => self.execute(pipeline, command),
            Err(message) => message,
        }
    }

    pub fn execute(&self, pipeline: &mut Pipeline, command: Command) -> String {
        if command.requires_admin() && !self.admins.is_admin(&self.identity) {
            tracing::warn!(
                identity = self.identity.as_str(),
                ?command,
                "refused non-admin command"
            );
            return "Permission denied: this command needs an administrator. \
                    Ask an admin to run it."
                .to_string();
        }

        match command {
            Command::Help => HELP.to_string(),
            Command::Start {
                target,
                content_file,
                description,
            } => {
                let description = description.unwrap_or_else(|| format!("update {}", target));
                self.propose(pipeline, None, target, content_file, description)
            }
            Command::Stage {
                target,
                content_file,
            } => {
                let open = pipeline
                    .current()
                    .filter(|r| r.status == IterationStatus::Pending)
                    .map(|r| (r.id.clone(), r.description.clone()));
                match open {
                    Some((id, description)) => {
                        self.propose(pipeline, Some(id), target, content_file, description)
                    }
                    None => "No iteration is open. Use `start` to begin one.".to_string(),
                }
            }
            Command::Approve => match pipeline.approve(&self.identity) {
                Ok(report) => {
                    let mut out = format!(
                        "Iteration {}: applied {} file(s)",
                        report.iteration_id,
                        report.applied.len()
                    );
                    for file in &report.applied {
                        let _ = match &file.backup_id {
                            Some(id) => write!(out, "\n• {} (backup {})", file.target, id),
                            None => write!(out, "\n• {} (new file)", file.target),
                        };
                    }
                    if report.failed.is_empty() {
                        out.push_str("\nDone. Use `rollback <id>` to undo a file.");
                    } else {
                        for file in &report.failed {
                            write!(out, "\n✗ {}: {}", file.target, file.error).ok();
                        }
                        if report.status == IterationStatus::Error {
                            out.push_str(
                                "\nThe iteration is in an error state. Check `status`, then `reset`.",
                            );
                        } else {
                            out.push_str(
                                "\nFailed files were not changed. Fix the cause and `start` a new iteration for them.",
                            );
                        }
                    }
                    out
                }
                Err(err) => render_error(&err),
            },
            Command::Reject => match pipeline.reject(&self.identity) {
                Ok(report) => format!(
                    "Iteration {} rejected; {} staged file(s) discarded. The source tree was not changed.",
                    report.iteration_id,
                    report.discarded.len()
                ),
                Err(err) => render_error(&err),
            },
            Command::Diff { target } => match pipeline.diff(target.as_deref()) {
                Ok(diffs) => {
                    let mut out = String::new();
                    for file in diffs {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        write!(out, "{} {}", file.target, file.stats).ok();
                        if file.is_new_file {
                            out.push_str(" [new file]");
                        }
                        if !file.diff.is_empty() {
                            out.push('\n');
                            out.push_str(&truncate_diff(&file.diff, self.diff_max_lines));
                        }
                    }
                    out
                }
                Err(err) => render_error(&err),
            },
            Command::Status => render_status(pipeline),
            Command::Rollback { id: None } => match pipeline.list_backups(None) {
                Ok(records) if records.is_empty() => "No backups yet.".to_string(),
                Ok(records) => format!(
                    "{}\nUse `rollback <id>` to restore one.",
                    render_backups(&records)
                ),
                Err(err) => render_error(&err),
            },
            Command::Rollback { id: Some(id) } => match pipeline.rollback(&id) {
                Ok(report) => {
                    let mut out = format!(
                        "Restored {} from backup {}.",
                        report.target.display(),
                        report.restored_from
                    );
                    if let Some(pre) = report.pre_rollback_backup {
                        write!(out, " The replaced version was saved as backup {}.", pre.id).ok();
                    }
                    out
                }
                Err(err) => render_error(&err),
            },
            Command::Backups => match pipeline.list_backups(None) {
                Ok(records) if records.is_empty() => "No backups yet.".to_string(),
                Ok(records) => render_backups(&records),
                Err(err) => render_error(&err),
            },
            Command::Reset => match pipeline.reset() {
                Some(record) => format!(
                    "Iteration {} ({}) forgotten. Staged files were kept; use `clear` to remove them.",
                    record.id, record.status
                ),
                None => "Nothing to reset.".to_string(),
            },
            Command::Clear => match pipeline.clear_staged() {
                Ok(removed) => format!("Removed {} staged file(s).", removed),
                Err(err) => render_error(&err),
            },
        }
    }

    fn propose(
        &self,
        pipeline: &mut Pipeline,
        iteration: Option<String>,
        target: String,
        content_file: PathBuf,
        description: String,
    ) -> String {
        let content = match fs::read_to_string(&content_file) {
            Ok(content) => content,
            Err(err) => {
                return format!(
                    "Could not read {}: {}. Check the path and try again.",
                    content_file.display(),
                    err
                )
            }
        };

        let request = ProposeRequest {
            iteration,
            requester: self.identity.clone(),
            description,
            target,
            content,
        };
        match pipeline.propose(request) {
            Ok(outcome) => self.render_staged(&outcome),
            Err(err) => render_error(&err),
        }
    }

    fn render_staged(&self, outcome: &StageOutcome) -> String {
        let mut out = format!(
            "Staged {}{} (iteration {}, {} file(s) pending)\nChanges: {}",
            outcome.target,
            if outcome.is_new_file { " [new file]" } else { "" },
            outcome.iteration_id,
            outcome.pending_count,
            outcome.stats
        );
        match &outcome.verification {
            Some(report) if report.warning_count() > 0 => {
                write!(out, "\n{}", report.render()).ok();
            }
            Some(_) => out.push_str("\nVerification passed."),
            None => out.push_str("\nVerification skipped (disabled)."),
        }
        if !outcome.diff.is_empty() {
            out.push('\n');
            out.push_str(&truncate_diff(&outcome.diff, self.diff_max_lines));
        }
        out.push_str("\nNext: `approve` to apply, `reject` to discard, or `stage` another file.");
        out
    }
}

fn render_status(pipeline: &Pipeline) -> String {
    let status = pipeline.status();
    let mut out = format!("Status: {}", status.status);
    if let Some(record) = &status.iteration {
        write!(
            out,
            "\nIteration {} by {}: {}",
            record.id, record.requester, record.description
        )
        .ok();
        for file in &record.pending {
            write!(out, "\n• {} {}", file.target, file.summary).ok();
        }
        if let Some(error) = &record.error {
            write!(out, "\nError: {}", error).ok();
        }
        if status.overdue {
            out.push_str("\nThis iteration has waited longer than the approval timeout.");
        }
    }
    if !status.orphans.is_empty() {
        write!(
            out,
            "\n{} staged file(s) not owned by any iteration:",
            status.orphans.len()
        )
        .ok();
        for orphan in &status.orphans {
            write!(out, "\n• {}", orphan.target).ok();
        }
        out.push_str("\nUse `clear` to remove them.");
    }
    write!(
        out,
        "\nShadow: {} file(s), {} byte(s). Backups: {}.",
        status.shadow.file_count, status.shadow.total_bytes, status.backup_count
    )
    .ok();
    out
}

fn render_backups(records: &[BackupRecord]) -> String {
    let mut out = format!("{} backup(s), newest first:", records.len());
    for record in records.iter().take(BACKUP_LIST_LIMIT) {
        write!(
            out,
            "\n• {}  {}  {} byte(s)",
            record.id, record.origin, record.size
        )
        .ok();
    }
    if records.len() > BACKUP_LIST_LIMIT {
        write!(out, "\n… {} more", records.len() - BACKUP_LIST_LIMIT).ok();
    }
    out
}

fn render_error(err: &PipelineError) -> String {
    let label = if err.is_informational() { "Note" } else { "Error" };
    format!("{}: {}\n{}", label, err, err.hint())
}
