//! Tracked units of asynchronous work and their state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Model;
use crate::topology::DeploymentPlan;

/// ```text
/// created -> queued -> running -> completed | failed
///    \         \          \
///     `---------`----------`--> cancelled
/// ```
///
/// `queued -> failed` covers work that could not be planned or handed to the
/// runner. Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Running)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Created | Queued | Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Created => "created",
            ExecutionState::Queued => "queued",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Discovery,
    PlaybookRun,
}

/// What an execution works on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskTarget {
    /// A pinned version of a playbook configuration.
    PlaybookConfiguration { id: String, version: i64 },
    /// A host announcing itself for discovery.
    Server {
        server_id: String,
        host: String,
        username: String,
    },
}

/// Outcome details once an execution is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub reason: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub time_finished: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub kind: TaskKind,
    pub target: TaskTarget,
    pub state: ExecutionState,
    /// Set when cancellation was asked for while the runner owns the work.
    #[serde(default)]
    pub cancel_requested: bool,
    pub plan: Option<DeploymentPlan>,
    pub result: Option<ExecutionResult>,
}

impl Execution {
    pub fn playbook_run(configuration_id: &str, configuration_version: i64) -> Self {
        Self::new(
            TaskKind::PlaybookRun,
            TaskTarget::PlaybookConfiguration {
                id: configuration_id.to_string(),
                version: configuration_version,
            },
        )
    }

    pub fn discovery(server_id: &str, host: &str, username: &str) -> Self {
        Self::new(
            TaskKind::Discovery,
            TaskTarget::Server {
                server_id: server_id.to_string(),
                host: host.to_string(),
                username: username.to_string(),
            },
        )
    }

    fn new(kind: TaskKind, target: TaskTarget) -> Self {
        Self {
            kind,
            target,
            state: ExecutionState::Created,
            cancel_requested: false,
            plan: None,
            result: None,
        }
    }
}

impl Model for Execution {
    const MODEL_NAME: &'static str = "execution";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Ok,
    Skipped,
    Failed,
    Unreachable,
}

/// One task reported by the runner while an execution is running.
/// Append-only: steps are created once and never saved again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub execution_id: String,
    pub name: String,
    pub server_id: Option<String>,
    pub result: StepResult,
    pub error: Option<String>,
    pub time_started: i64,
    pub time_finished: i64,
}

impl Model for ExecutionStep {
    const MODEL_NAME: &'static str = "execution_step";
}
