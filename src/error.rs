use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;

/// Crate-level errors: graph construction, configuration and run setup.
///
/// Anything that goes wrong *inside* a task is a [`TaskError`] instead and
/// never escapes the executor as an `Error`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Cycle detected at task: {task}")]
    Cycle { task: TaskId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} references {reference}, which is not one of its upstream tasks")]
    InvalidReference { task: TaskId, reference: String },

    #[error("Invalid template in task {task}: {source}")]
    Template {
        task: TaskId,
        #[source]
        source: ContextError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the run context and the template interpreter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Key {key} already published by task {task}")]
    DuplicateKey { task: TaskId, key: String },

    #[error("Unresolved reference ref({task}, {key})")]
    UnresolvedReference { task: TaskId, key: String },

    #[error("Template syntax error at byte {position} in {template:?}: {reason}")]
    TemplateSyntax {
        template: String,
        position: usize,
        reason: String,
    },
}

/// Why a single task failed.
///
/// The scheduler stores the rendered message on the failed task and hands
/// the error to the failure callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("Sensor timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command exited with {}", exit_description(.0))]
    NonZeroExit(Option<i32>),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Sensor gave up after {failures} consecutive predicate failures: {last_error}")]
    SensorFailures { failures: u32, last_error: String },

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
