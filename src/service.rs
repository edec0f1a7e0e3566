//! Async handle over a [`Pipeline`]
//!
//! Pipeline operations do blocking filesystem work, so each one runs on
//! tokio's blocking pool via `spawn_blocking`. The mutex serializes access;
//! the single-flight guard inside the pipeline still fails fast rather than
//! queueing a second iteration.

use crate::error::{PipelineError, Result};
use crate::patcher::RollbackReport;
use crate::session::{
    ApprovalReport, Pipeline, ProposeRequest, RejectReport, StageOutcome, StatusReport,
};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<Mutex<Pipeline>>,
}

impl PipelineHandle {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            inner: Arc::new(Mutex::new(pipeline)),
        }
    }

    /// Run `f` against the pipeline on the blocking pool.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Pipeline) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut pipeline = inner
                .lock()
                .map_err(|_| PipelineError::Internal("pipeline lock poisoned".to_string()))?;
            f(&mut *pipeline)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("pipeline task failed: {}", e)))?
    }

    pub async fn propose(&self, request: ProposeRequest) -> Result<StageOutcome> {
        self.run(move |p| p.propose(request)).await
    }

    pub async fn approve(&self, reviewer: &str) -> Result<ApprovalReport> {
        let reviewer = reviewer.to_string();
        self.run(move |p| p.approve(&reviewer)).await
    }

    pub async fn reject(&self, reviewer: &str) -> Result<RejectReport> {
        let reviewer = reviewer.to_string();
        self.run(move |p| p.reject(&reviewer)).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.run(|p| Ok(p.status())).await
    }

    pub async fn rollback(&self, backup_id: &str) -> Result<RollbackReport> {
        let backup_id = backup_id.to_string();
        self.run(move |p| p.rollback(&backup_id)).await
    }
}
