//! Failure notification.
//!
//! Notifiers are observers: the scheduler fires them asynchronously when a
//! task fails and only logs their errors. A notifier can never change the
//! outcome of a run.

use crate::core::run::RunId;
use crate::core::task::TaskId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::error;

/// What a notifier is told about a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureNotice {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub cause: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureNotice {
    pub fn new(run_id: RunId, task_id: TaskId, cause: &str) -> Self {
        Self {
            run_id,
            task_id,
            cause: cause.to_string(),
            failed_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification hook failed: {0}")]
    Hook(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives failure notices.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &FailureNotice) -> Result<(), NotifyError>;
}

/// Writes failures to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        error!(
            run = %notice.run_id,
            task = %notice.task_id,
            cause = %notice.cause,
            "task failed"
        );
        Ok(())
    }
}

/// Runs a shell hook for every failure, e.g. a `curl` to a chat webhook.
///
/// The hook sees `CADENCE_RUN_ID`, `CADENCE_TASK_ID` and `CADENCE_CAUSE`
/// in its environment.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(&self.command)
                .env("CADENCE_RUN_ID", notice.run_id.as_str())
                .env("CADENCE_TASK_ID", notice.task_id.as_str())
                .env("CADENCE_CAUSE", &notice.cause)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| NotifyError::Hook(format!("timed out after {:?}", self.timeout)))??;

        if !output.status.success() {
            return Err(NotifyError::Hook(format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
