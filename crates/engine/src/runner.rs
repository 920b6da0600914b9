//! The hand-off to whatever actually executes playbooks on remote hosts.
//!
//! The engine never runs remote commands itself. It calls
//! [`PlaybookRunner::start`] once an execution is planned and expects the
//! runner to report back through the engine (steps, then a terminal
//! outcome).

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::{DeploymentPlan, DomainError};
use tokio::sync::Mutex;

/// One unit of work for the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerJob {
    pub execution_id: String,
    #[serde(flatten)]
    pub work: RunnerWork,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerWork {
    PlaybookRun {
        playbook_id: String,
        configuration: Value,
        plan: Option<DeploymentPlan>,
    },
    Discovery {
        server_id: String,
        host: String,
        username: String,
    },
}

#[async_trait]
pub trait PlaybookRunner: Send + Sync + 'static {
    /// Accept a job. Must return promptly; the work happens elsewhere.
    async fn start(&self, job: RunnerJob) -> Result<(), DomainError>;

    /// Ask the runner to stop `execution_id` at its next checkpoint.
    ///
    /// Returns `true` when the job was withdrawn before any work began; the
    /// engine then finalizes the cancellation itself. `false` means the
    /// runner owns the job and will report the outcome.
    async fn cancel(&self, execution_id: &str) -> Result<bool, DomainError>;
}

/// A runner that parks jobs until an external worker claims them.
///
/// Workers poll [`QueueRunner::claim`] (exposed over HTTP) and report
/// progress through the engine. A job not yet claimed can be withdrawn.
#[derive(Debug, Default)]
pub struct QueueRunner {
    pending: Mutex<VecDeque<RunnerJob>>,
}

impl QueueRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest unclaimed job, if any.
    pub async fn claim(&self) -> Option<RunnerJob> {
        let job = self.pending.lock().await.pop_front();
        if let Some(job) = &job {
            tracing::info!(execution_id = %job.execution_id, "runner job claimed");
        }
        job
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl PlaybookRunner for QueueRunner {
    async fn start(&self, job: RunnerJob) -> Result<(), DomainError> {
        tracing::debug!(execution_id = %job.execution_id, "runner job queued");
        self.pending.lock().await.push_back(job);
        Ok(())
    }

    async fn cancel(&self, execution_id: &str) -> Result<bool, DomainError> {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|job| job.execution_id != execution_id);
        Ok(pending.len() != before)
    }
}
