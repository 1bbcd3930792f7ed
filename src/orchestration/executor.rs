//! Runs a single task's unit of work.
//!
//! The executor resolves a task's templates against the run context, performs
//! the effect for its kind, retries according to its policy and publishes
//! the task's outputs once it succeeds. Every failure is reported as a
//! [`TaskError`] inside the outcome; nothing escapes as a crate error.

use crate::collaborators::Collaborators;
use crate::context::{ContextValue, RunContext};
use crate::core::run::RunId;
use crate::core::task::{LoadSpec, SensorSpec, ShellSpec, Task, TaskId, TaskKind, TransferSpec};
use crate::error::{ContextError, TaskError};
use crate::orchestration::pool::WorkerPool;
use crate::orchestration::sensor::{SensorOutcome, SensorRunner};
use crate::orchestration::workspace::WorkspaceManager;
use crate::template::Template;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Values a task publishes on success, keyed by output name.
pub type Outputs = Vec<(String, ContextValue)>;

/// Structured result of executing one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(Outputs),
    Failure(TaskError),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// When a task actually ran, as opposed to when it was dispatched.
///
/// `started` is the first time the task held a worker slot; `finished` is
/// stamped before the slot of its last attempt is released.
#[derive(Debug, Default)]
pub struct Timing {
    started: OnceLock<DateTime<Utc>>,
    finished: Mutex<Option<DateTime<Utc>>>,
}

impl Timing {
    fn start(&self) {
        self.started.get_or_init(Utc::now);
    }

    fn finish(&self) {
        if let Ok(mut finished) = self.finished.lock() {
            *finished = Some(Utc::now());
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started.get().copied()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished.lock().ok().and_then(|finished| *finished)
    }
}

/// Executes tasks for one run.
pub struct TaskExecutor {
    run_id: RunId,
    context: RunContext,
    workspaces: WorkspaceManager,
    collaborators: Collaborators,
    pool: WorkerPool,
    sensors: SensorRunner,
}

impl TaskExecutor {
    pub fn new(
        run_id: RunId,
        context: RunContext,
        workspaces: WorkspaceManager,
        collaborators: Collaborators,
        pool: WorkerPool,
    ) -> Self {
        Self {
            run_id,
            context,
            workspaces,
            collaborators,
            sensors: SensorRunner::new(pool.clone()),
            pool,
        }
    }

    /// Stop sensors after `limit` consecutive predicate errors.
    pub fn with_sensor_failure_limit(mut self, limit: Option<u32>) -> Self {
        self.sensors = self.sensors.with_max_consecutive_failures(limit);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Execute `task`, retrying failed attempts per its retry policy.
    ///
    /// Cancellation aborts the current attempt (killing any child process)
    /// and any pending retry. Teardown tasks are not cancellable.
    pub async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskOutcome {
        self.execute_tracked(task, cancel, &Timing::default()).await
    }

    /// Like [`execute`](Self::execute), also recording in `timing` when the
    /// task held a worker slot (for sensors, when polling began and ended).
    pub async fn execute_tracked(
        &self,
        task: &Task,
        cancel: &CancellationToken,
        timing: &Timing,
    ) -> TaskOutcome {
        let max_attempts = task.retry.max_attempts();
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() && !task.kind.is_teardown() {
                return TaskOutcome::Failure(TaskError::Cancelled);
            }

            debug!(task = %task.id, kind = task.kind.name(), attempt, "attempt started");
            match self.attempt(task, cancel, timing).await {
                Ok(outputs) => {
                    return match self.publish(&task.id, &outputs).await {
                        Ok(()) => TaskOutcome::Success(outputs),
                        Err(e) => TaskOutcome::Failure(e.into()),
                    };
                }
                Err(TaskError::Cancelled) => return TaskOutcome::Failure(TaskError::Cancelled),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        task = %task.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        backoff = ?task.retry.backoff,
                        "attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(task.retry.backoff) => {}
                        _ = cancel.cancelled() => return TaskOutcome::Failure(TaskError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return TaskOutcome::Failure(e),
            }
        }
    }

    async fn attempt(
        &self,
        task: &Task,
        cancel: &CancellationToken,
        timing: &Timing,
    ) -> Result<Outputs, TaskError> {
        match &task.kind {
            TaskKind::CreateWorkspace => {
                self.working(cancel, timing, self.create_workspace()).await
            }
            TaskKind::DestroyWorkspace { dir } => {
                let _slot = self.pool.acquire().await?;
                timing.start();
                let result = self.destroy_workspace(dir).await;
                timing.finish();
                result
            }
            TaskKind::Sensor(spec) => {
                timing.start();
                let result = self.sense(spec, cancel).await;
                timing.finish();
                result
            }
            TaskKind::Transfer(spec) => self.working(cancel, timing, self.transfer(spec)).await,
            TaskKind::ShellCommand(spec) => {
                self.working(cancel, timing, self.shell(&task.id, spec)).await
            }
            TaskKind::BulkLoad(spec) => self.working(cancel, timing, self.bulk_load(spec)).await,
        }
    }

    /// Run `work` while holding a worker slot, abandoning it on cancellation.
    async fn working<F>(
        &self,
        cancel: &CancellationToken,
        timing: &Timing,
        work: F,
    ) -> Result<Outputs, TaskError>
    where
        F: Future<Output = Result<Outputs, TaskError>>,
    {
        let _slot = self.pool.acquire_until(cancel).await?;
        timing.start();
        let result = tokio::select! {
            result = work => result,
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
        };
        timing.finish();
        result
    }

    async fn publish(&self, task: &TaskId, outputs: &Outputs) -> Result<(), ContextError> {
        for (key, value) in outputs {
            self.context.put(task, key, value.clone()).await?;
        }
        Ok(())
    }

    async fn resolve(&self, template: &Template) -> Result<String, TaskError> {
        Ok(self.context.resolve_template(template).await?)
    }

    async fn create_workspace(&self) -> Result<Outputs, TaskError> {
        let handle = self.workspaces.acquire(&self.run_id).await?;
        Ok(vec![("path".to_string(), ContextValue::Path(handle.path))])
    }

    async fn destroy_workspace(&self, dir: &Template) -> Result<Outputs, TaskError> {
        let path = match self.context.resolve_template(dir).await {
            Ok(path) => PathBuf::from(path),
            Err(ContextError::UnresolvedReference { task, key }) => {
                info!(%task, %key, "workspace was never created, nothing to release");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        self.workspaces.release(&path).await?;
        Ok(Vec::new())
    }

    async fn sense(&self, spec: &SensorSpec, cancel: &CancellationToken) -> Result<Outputs, TaskError> {
        let client = self
            .collaborators
            .transfer(&spec.connection)
            .ok_or_else(|| TaskError::UnknownConnection(spec.connection.clone()))?;
        let pattern = self.resolve(&spec.pattern).await?;
        let found = Arc::new(AtomicUsize::new(0));

        let outcome = self
            .sensors
            .run(
                || {
                    let client = Arc::clone(&client);
                    let pattern = pattern.clone();
                    let found = Arc::clone(&found);
                    async move {
                        let matches = client.list(&pattern).await?;
                        found.store(matches.len(), Ordering::SeqCst);
                        Ok(!matches.is_empty())
                    }
                },
                spec.poke_interval,
                spec.timeout,
                cancel,
            )
            .await;

        match outcome {
            SensorOutcome::Satisfied { polls } => {
                let matches = found.load(Ordering::SeqCst);
                debug!(%pattern, polls, matches, "sensor found files");
                Ok(vec![(
                    "matches".to_string(),
                    ContextValue::Text(matches.to_string()),
                )])
            }
            SensorOutcome::TimedOut { .. } => Err(TaskError::Timeout(spec.timeout)),
            SensorOutcome::Cancelled => Err(TaskError::Cancelled),
            SensorOutcome::FailureLimit {
                failures,
                last_error,
            } => Err(TaskError::SensorFailures {
                failures,
                last_error,
            }),
        }
    }

    async fn transfer(&self, spec: &TransferSpec) -> Result<Outputs, TaskError> {
        let client = self
            .collaborators
            .transfer(&spec.connection)
            .ok_or_else(|| TaskError::UnknownConnection(spec.connection.clone()))?;
        let source = self.resolve(&spec.source).await?;
        let dest = PathBuf::from(self.resolve(&spec.dest).await?);

        let files = client.download(&source, &dest).await?;
        debug!(%source, dest = %dest.display(), files, "download finished");
        Ok(vec![
            ("path".to_string(), ContextValue::Path(dest)),
            ("files".to_string(), ContextValue::Text(files.to_string())),
        ])
    }

    async fn shell(&self, task: &TaskId, spec: &ShellSpec) -> Result<Outputs, TaskError> {
        let command = self.context.resolve_for_shell(&spec.command).await?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .env("CADENCE_RUN_ID", self.run_id.as_str())
            .env("CADENCE_TASK_ID", task.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = self.workspaces.active().await {
            cmd.current_dir(dir);
        }

        debug!(%task, %command, "running command");
        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(%task, status = %output.status, stderr = %stderr.trim(), "command failed");
            return Err(TaskError::NonZeroExit(output.status.code()));
        }

        let mut outputs = Vec::with_capacity(spec.artifacts.len());
        for (key, template) in &spec.artifacts {
            let path = self.resolve(template).await?;
            outputs.push((key.clone(), ContextValue::Path(PathBuf::from(path))));
        }
        Ok(outputs)
    }

    async fn bulk_load(&self, spec: &LoadSpec) -> Result<Outputs, TaskError> {
        let loader = self
            .collaborators
            .loader(&spec.connection)
            .ok_or_else(|| TaskError::UnknownConnection(spec.connection.clone()))?;
        let csv_path = self.resolve(&spec.csv_path).await?;

        let rows = loader.load(Path::new(&csv_path), &spec.table).await?;
        info!(table = %spec.table, rows, "table loaded");
        Ok(vec![("rows".to_string(), ContextValue::Text(rows.to_string()))])
    }
}
