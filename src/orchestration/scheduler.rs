//! Scheduler for parallel task execution.
//!
//! The Scheduler walks the DAG for one run: it dispatches ready tasks onto
//! the worker pool, records every state transition, skips tasks whose
//! upstream can no longer succeed, and drives the run to a terminal status.
//! Teardown tasks are held back until every other task has settled.

use crate::collaborators::FailureNotice;
use crate::core::dag::TaskDAG;
use crate::core::run::{RunId, RunStatus};
use crate::core::task::{Task, TaskId, TaskState};
use crate::error::{Result, TaskError};
use crate::orchestration::executor::{TaskExecutor, TaskOutcome, Timing};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the run reacts to a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the failed task's descendants; unaffected branches keep going.
    #[default]
    ContinueIndependent,
    /// Cancel running work and skip everything still pending.
    StopOnFailure,
}

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskStarted { task_id: TaskId },
    TaskSucceeded { task_id: TaskId },
    TaskFailed { task_id: TaskId, error: String },
    TaskSkipped { task_id: TaskId, reason: String },
    RunFinished { status: RunStatus },
}

/// What happened to one task during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub kind: String,
    #[serde(flatten)]
    pub state: TaskState,
    /// When the task got a worker slot; dispatch time if it never did.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Terminal status of a run plus the record of every task.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: RunStatus,
    pub tasks: BTreeMap<TaskId, TaskRecord>,
}

/// A spawned task reporting back to the scheduling loop.
struct Finished {
    task_id: TaskId,
    timing: Timing,
    outcome: TaskOutcome,
}

/// Drives one run of a DAG to completion.
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::new(dag, executor)?
///     .with_policy(FailurePolicy::ContinueIndependent)
///     .with_events(event_tx);
/// let summary = scheduler.run().await;
/// ```
pub struct Scheduler {
    dag: Arc<TaskDAG>,
    executor: Arc<TaskExecutor>,
    policy: FailurePolicy,
    notify_timeout: Duration,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    cancel: CancellationToken,
    states: HashMap<TaskId, TaskState>,
    records: BTreeMap<TaskId, TaskRecord>,
    notifications: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler for `dag`.
    ///
    /// # Errors
    /// Returns `Error::Cycle` if the graph is not acyclic.
    pub fn new(dag: Arc<TaskDAG>, executor: Arc<TaskExecutor>) -> Result<Self> {
        dag.validate()?;

        let mut states = HashMap::new();
        let mut records = BTreeMap::new();
        for task in dag.all_tasks() {
            states.insert(task.id.clone(), TaskState::Pending);
            records.insert(
                task.id.clone(),
                TaskRecord {
                    kind: task.kind.name().to_string(),
                    state: TaskState::Pending,
                    started_at: None,
                    finished_at: None,
                },
            );
        }

        Ok(Self {
            dag,
            executor,
            policy: FailurePolicy::default(),
            notify_timeout: Duration::from_secs(30),
            event_tx: None,
            cancel: CancellationToken::new(),
            states,
            records,
            notifications: Vec::new(),
        })
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound on how long a failure callback may run.
    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Abort the run when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current state of a task.
    pub fn state(&self, id: &TaskId) -> Option<&TaskState> {
        self.states.get(id)
    }

    /// Run the scheduling loop until every task is terminal.
    pub async fn run(mut self) -> RunSummary {
        let (done_tx, mut done_rx) = mpsc::channel::<Finished>(self.dag.task_count().max(1));
        let work_cancel = self.cancel.child_token();
        let mut active = 0usize;
        let mut aborted = false;
        let mut halt_reason: Option<String> = None;

        info!(run = %self.executor.run_id(), tasks = self.dag.task_count(), "run started");

        loop {
            if aborted || halt_reason.is_some() {
                let reason = halt_reason.clone().unwrap_or_else(|| "run aborted".to_string());
                self.skip_pending_work(&reason);
            }
            self.cascade_skips();
            active += self.dispatch_ready(&done_tx, &work_cancel);

            if active == 0 {
                if !self.dag.all_terminal(&self.states) {
                    self.skip_unreachable();
                }
                break;
            }

            tokio::select! {
                Some(Finished { task_id, timing, outcome }) = done_rx.recv() => {
                    active -= 1;
                    let halt = self.handle_outcome(&task_id, outcome);
                    self.record_timing(&task_id, &timing);
                    if let Some(reason) = halt {
                        if halt_reason.is_none() {
                            warn!(task = %task_id, "stopping run after failure");
                            halt_reason = Some(reason);
                            work_cancel.cancel();
                        }
                    }
                }
                _ = self.cancel.cancelled(), if !aborted => {
                    warn!(run = %self.executor.run_id(), "run cancelled");
                    aborted = true;
                    work_cancel.cancel();
                }
            }
        }

        for notification in std::mem::take(&mut self.notifications) {
            let _ = notification.await;
        }

        let status = self.status(aborted);
        info!(run = %self.executor.run_id(), %status, "run finished");
        self.emit(SchedulerEvent::RunFinished { status });

        RunSummary {
            status,
            tasks: self.records,
        }
    }

    fn status(&self, aborted: bool) -> RunStatus {
        if aborted {
            RunStatus::Aborted
        } else if self.states.values().all(TaskState::is_success) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    /// Ready tasks that may start now.
    ///
    /// A teardown task waits until every task that does not depend on it is
    /// terminal, whatever its own trigger rule says.
    fn dispatchable(&self) -> Vec<Task> {
        self.dag
            .ready_tasks(&self.states)
            .into_iter()
            .filter(|task| !task.kind.is_teardown() || self.others_settled(&task.id))
            .cloned()
            .collect()
    }

    fn others_settled(&self, teardown: &TaskId) -> bool {
        let dependents = self.dag.descendants(teardown);
        self.dag
            .all_tasks()
            .into_iter()
            .filter(|task| &task.id != teardown && !dependents.contains(&task.id))
            .filter(|task| !task.kind.is_teardown())
            .all(|task| self.states[&task.id].is_terminal())
    }

    fn dispatch_ready(
        &mut self,
        done_tx: &mpsc::Sender<Finished>,
        work_cancel: &CancellationToken,
    ) -> usize {
        let ready = self.dispatchable();
        let dispatched = ready.len();

        for task in ready {
            self.set_state(&task.id, TaskState::Running);
            if let Some(record) = self.records.get_mut(&task.id) {
                record.started_at = Some(Utc::now());
            }
            debug!(task = %task.id, kind = task.kind.name(), "task dispatched");
            self.emit(SchedulerEvent::TaskStarted {
                task_id: task.id.clone(),
            });

            let cancel = if task.kind.is_teardown() {
                CancellationToken::new()
            } else {
                work_cancel.clone()
            };
            let executor = Arc::clone(&self.executor);
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let timing = Timing::default();
                let outcome = AssertUnwindSafe(executor.execute_tracked(&task, &cancel, &timing))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        TaskOutcome::Failure(TaskError::Panicked(message))
                    });
                let finished = Finished {
                    task_id: task.id,
                    timing,
                    outcome,
                };
                let _ = done_tx.send(finished).await;
            });
        }

        dispatched
    }

    /// Record a finished task. Returns a halt reason when the failure policy
    /// says the run should stop.
    fn handle_outcome(&mut self, task_id: &TaskId, outcome: TaskOutcome) -> Option<String> {
        if let Some(record) = self.records.get_mut(task_id) {
            record.finished_at = Some(Utc::now());
        }

        match outcome {
            TaskOutcome::Success(outputs) => {
                info!(task = %task_id, outputs = outputs.len(), "task succeeded");
                self.set_state(task_id, TaskState::Succeeded);
                self.emit(SchedulerEvent::TaskSucceeded {
                    task_id: task_id.clone(),
                });
                None
            }
            TaskOutcome::Failure(error) => {
                let message = error.to_string();
                warn!(task = %task_id, error = %message, "task failed");
                self.set_state(
                    task_id,
                    TaskState::Failed {
                        error: message.clone(),
                    },
                );
                self.emit(SchedulerEvent::TaskFailed {
                    task_id: task_id.clone(),
                    error: message.clone(),
                });

                if error == TaskError::Cancelled {
                    return None;
                }
                self.notify_failure(task_id, &message);

                let teardown = self
                    .dag
                    .get_task(task_id)
                    .map(|task| task.kind.is_teardown())
                    .unwrap_or(false);
                (self.policy == FailurePolicy::StopOnFailure && !teardown)
                    .then(|| format!("run stopped after {} failed", task_id))
            }
        }
    }

    /// Fire the task's failure callback without waiting for it.
    fn notify_failure(&mut self, task_id: &TaskId, cause: &str) {
        let Some(notifier) = self.dag.get_task(task_id).and_then(|t| t.on_failure.clone()) else {
            return;
        };
        let notice = FailureNotice::new(self.executor.run_id().clone(), task_id.clone(), cause);
        let timeout = self.notify_timeout;

        self.notifications.push(tokio::spawn(async move {
            match tokio::time::timeout(timeout, notifier.notify(&notice)).await {
                Ok(Ok(())) => debug!(task = %notice.task_id, "failure notification sent"),
                Ok(Err(e)) => {
                    warn!(task = %notice.task_id, error = %e, "failure notification failed")
                }
                Err(_) => warn!(task = %notice.task_id, ?timeout, "failure notification timed out"),
            }
        }));
    }

    /// Skip pending tasks whose upstream failed or was skipped, transitively.
    fn cascade_skips(&mut self) {
        loop {
            let blocked: Vec<(TaskId, TaskId)> = self
                .dag
                .blocked_tasks(&self.states)
                .into_iter()
                .map(|(task, culprit)| (task.id.clone(), culprit.clone()))
                .collect();
            if blocked.is_empty() {
                return;
            }
            for (task_id, culprit) in blocked {
                let reason = match &self.states[&culprit] {
                    TaskState::Failed { .. } => format!("upstream {} failed", culprit),
                    _ => format!("upstream {} was skipped", culprit),
                };
                self.skip(&task_id, reason);
            }
        }
    }

    /// Skip every pending task except teardown, which still has to run.
    fn skip_pending_work(&mut self, reason: &str) {
        let pending: Vec<TaskId> = self
            .dag
            .all_tasks()
            .into_iter()
            .filter(|task| !task.kind.is_teardown())
            .filter(|task| self.states[&task.id] == TaskState::Pending)
            .map(|task| task.id.clone())
            .collect();
        for task_id in pending {
            self.skip(&task_id, reason.to_string());
        }
    }

    /// Nothing is running and nothing can start: skip what is left.
    fn skip_unreachable(&mut self) {
        let pending: Vec<TaskId> = self
            .states
            .iter()
            .filter(|(_, state)| **state == TaskState::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in pending {
            warn!(task = %task_id, "task can never become ready");
            self.skip(&task_id, "unreachable".to_string());
        }
    }

    fn skip(&mut self, task_id: &TaskId, reason: String) {
        debug!(task = %task_id, %reason, "task skipped");
        self.set_state(
            task_id,
            TaskState::Skipped {
                reason: reason.clone(),
            },
        );
        if let Some(record) = self.records.get_mut(task_id) {
            record.finished_at = Some(Utc::now());
        }
        self.emit(SchedulerEvent::TaskSkipped {
            task_id: task_id.clone(),
            reason,
        });
    }

    /// Replace dispatch and completion times with when the task really ran.
    fn record_timing(&mut self, task_id: &TaskId, timing: &Timing) {
        let Some(record) = self.records.get_mut(task_id) else {
            return;
        };
        if let Some(at) = timing.started_at() {
            record.started_at = Some(at);
        }
        if let Some(at) = timing.finished_at() {
            record.finished_at = Some(at);
        }
    }

    fn set_state(&mut self, task_id: &TaskId, state: TaskState) {
        if let Some(record) = self.records.get_mut(task_id) {
            record.state = state.clone();
        }
        self.states.insert(task_id.clone(), state);
    }

    /// Events are best effort; a slow or dropped listener never stalls the run.
    fn emit(&self, event: SchedulerEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event listener gone");
            }
        }
    }
}
