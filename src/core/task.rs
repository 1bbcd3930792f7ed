//! Task data model for the pipeline DAG.
//!
//! Tasks are immutable descriptions of a unit of work: what kind of effect
//! to perform, with which (possibly templated) configuration, and how to
//! react to failure. Per-run execution state is tracked separately in
//! [`TaskState`] by the scheduler, so one graph can drive many runs.

use crate::collaborators::Notifier;
use crate::template::Template;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Unique, human-chosen name of a task within a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task identifier from a name.
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TaskId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&TaskId> for TaskId {
    fn from(id: &TaskId) -> Self {
        id.clone()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task state within a single run.
///
/// `Pending → Running → {Succeeded, Failed}` or `Pending → Skipped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Not started yet.
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Never executed because an upstream task did not succeed.
    Skipped {
        /// Why the task was skipped.
        reason: String,
    },
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskState {
    /// Check if no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed { .. } | TaskState::Skipped { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskState::Succeeded)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed { error } => write!(f, "failed: {}", error),
            TaskState::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// When a task becomes eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Every upstream task succeeded.
    AllSuccess,
    /// Every upstream task is terminal, whatever the outcome.
    AllDone,
}

impl Default for TriggerRule {
    fn default() -> Self {
        Self::AllSuccess
    }
}

/// Retry policy for a task. The default is a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub retries: u32,
    /// Delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// Total number of attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Poll for files matching a remote pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSpec {
    /// Connection id of the transfer collaborator to list.
    pub connection: String,
    /// Remote glob, e.g. `/Taxi/cmt/*`.
    pub pattern: Template,
    /// Delay between checks.
    pub poke_interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

/// Recursively download a remote directory.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSpec {
    pub connection: String,
    pub source: Template,
    pub dest: Template,
}

/// Run an external command through `sh -c`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShellSpec {
    pub command: Template,
    /// Paths the command writes, published under the given keys on success.
    pub artifacts: BTreeMap<String, Template>,
}

impl ShellSpec {
    pub fn new(command: impl Into<Template>) -> Self {
        Self {
            command: command.into(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Publish `path` under `key` once the command succeeds.
    pub fn artifact(mut self, key: &str, path: impl Into<Template>) -> Self {
        self.artifacts.insert(key.to_string(), path.into());
        self
    }
}

/// Load a delimited file into a destination table.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSpec {
    /// Connection id of the bulk-load collaborator.
    pub connection: String,
    pub csv_path: Template,
    pub table: String,
}

/// What a task does when it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Allocate the run's workspace and publish its `path`.
    CreateWorkspace,
    /// Remove the workspace directory named by `dir`.
    DestroyWorkspace { dir: Template },
    Sensor(SensorSpec),
    Transfer(TransferSpec),
    ShellCommand(ShellSpec),
    BulkLoad(LoadSpec),
}

impl TaskKind {
    /// Short, stable name of the kind for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::CreateWorkspace => "create_workspace",
            TaskKind::DestroyWorkspace { .. } => "destroy_workspace",
            TaskKind::Sensor(_) => "sensor",
            TaskKind::Transfer(_) => "transfer",
            TaskKind::ShellCommand(_) => "shell_command",
            TaskKind::BulkLoad(_) => "bulk_load",
        }
    }

    /// Every template in the kind's configuration.
    pub fn templates(&self) -> Vec<&Template> {
        match self {
            TaskKind::CreateWorkspace => Vec::new(),
            TaskKind::DestroyWorkspace { dir } => vec![dir],
            TaskKind::Sensor(spec) => vec![&spec.pattern],
            TaskKind::Transfer(spec) => vec![&spec.source, &spec.dest],
            TaskKind::ShellCommand(spec) => {
                let mut templates = vec![&spec.command];
                templates.extend(spec.artifacts.values());
                templates
            }
            TaskKind::BulkLoad(spec) => vec![&spec.csv_path],
        }
    }

    /// Teardown tasks run last, after every other task settled.
    pub fn is_teardown(&self) -> bool {
        matches!(self, TaskKind::DestroyWorkspace { .. })
    }
}

/// A single task in the pipeline DAG.
#[derive(Clone)]
pub struct Task {
    /// Unique name of this task.
    pub id: TaskId,
    /// The effect the task performs.
    pub kind: TaskKind,
    /// Retry policy applied by the executor.
    pub retry: RetryPolicy,
    /// Readiness rule applied by the scheduler.
    pub trigger: TriggerRule,
    /// Invoked when the task fails.
    pub on_failure: Option<Arc<dyn Notifier>>,
}

impl Task {
    /// Create a task with default retry policy and trigger rule.
    ///
    /// Teardown kinds default to [`TriggerRule::AllDone`].
    pub fn new(id: &str, kind: TaskKind) -> Self {
        let trigger = if kind.is_teardown() {
            TriggerRule::AllDone
        } else {
            TriggerRule::AllSuccess
        };
        Self {
            id: TaskId::new(id),
            kind,
            retry: RetryPolicy::default(),
            trigger,
            on_failure: None,
        }
    }

    pub fn create_workspace(id: &str) -> Self {
        Self::new(id, TaskKind::CreateWorkspace)
    }

    pub fn destroy_workspace(id: &str, dir: impl Into<Template>) -> Self {
        Self::new(id, TaskKind::DestroyWorkspace { dir: dir.into() })
    }

    pub fn sensor(id: &str, spec: SensorSpec) -> Self {
        Self::new(id, TaskKind::Sensor(spec))
    }

    pub fn transfer(id: &str, spec: TransferSpec) -> Self {
        Self::new(id, TaskKind::Transfer(spec))
    }

    pub fn shell(id: &str, spec: ShellSpec) -> Self {
        Self::new(id, TaskKind::ShellCommand(spec))
    }

    pub fn bulk_load(id: &str, spec: LoadSpec) -> Self {
        Self::new(id, TaskKind::BulkLoad(spec))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerRule) -> Self {
        self.trigger = trigger;
        self
    }

    /// Attach a failure callback.
    pub fn on_failure(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.on_failure = Some(notifier);
        self
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("retry", &self.retry)
            .field("trigger", &self.trigger)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}
