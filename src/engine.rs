//! The engine: registered pipelines and the runs they produced.
//!
//! An `Engine` is an ordinary value. It validates pipelines when they are
//! registered, builds a fresh run context, workspace manager and scheduler
//! for every trigger, and keeps the report of each run it drove.

use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::context::{ContextValue, RunContext};
use crate::core::dag::TaskDAG;
use crate::core::run::{RunId, RunStatus};
use crate::core::task::TaskKind;
use crate::error::{Error, Result};
use crate::orchestration::{
    FailurePolicy, Scheduler, SchedulerEvent, TaskExecutor, TaskRecord, WorkerPool,
    WorkspaceHandle, WorkspaceManager,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Engine-wide settings applied to every run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    pub workspace_root: PathBuf,
    pub notify_timeout: Duration,
    pub sensor_max_consecutive_failures: Option<u32>,
}

impl EngineSettings {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workers: 4,
            failure_policy: FailurePolicy::default(),
            workspace_root: workspace_root.into(),
            notify_timeout: Duration::from_secs(30),
            sensor_max_consecutive_failures: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            workers: config.engine.workers,
            failure_policy: config.engine.failure_policy,
            workspace_root: config.workspace_root()?,
            notify_timeout: Duration::from_secs(config.engine.notify_timeout_secs),
            sensor_max_consecutive_failures: config.engine.sensor_max_consecutive_failures,
        })
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: RunStatus,
    pub triggered_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: BTreeMap<String, TaskRecord>,
    pub context: BTreeMap<String, BTreeMap<String, ContextValue>>,
    pub workspaces: Vec<WorkspaceHandle>,
}

impl RunReport {
    pub fn task(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }
}

/// Owns registered pipelines and drives their runs.
pub struct Engine {
    settings: EngineSettings,
    collaborators: Collaborators,
    pipelines: HashMap<String, Arc<TaskDAG>>,
    history: Vec<RunReport>,
}

impl Engine {
    pub fn new(settings: EngineSettings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            collaborators,
            pipelines: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Register `dag` under `name`, replacing any pipeline of that name.
    ///
    /// # Errors
    /// Fails if the graph has a cycle, a template is malformed or references
    /// a task that is not upstream, or a task uses an unknown connection.
    pub fn register(&mut self, name: &str, dag: TaskDAG) -> Result<()> {
        dag.validate()?;
        dag.validate_references()?;
        self.collaborators.ensure_connections(
            dag.all_tasks()
                .into_iter()
                .filter_map(|task| match &task.kind {
                    TaskKind::Sensor(spec) => Some(spec.connection.as_str()),
                    TaskKind::Transfer(spec) => Some(spec.connection.as_str()),
                    TaskKind::BulkLoad(spec) => Some(spec.connection.as_str()),
                    _ => None,
                }),
        )?;

        info!(pipeline = name, tasks = dag.task_count(), "pipeline registered");
        self.pipelines.insert(name.to_string(), Arc::new(dag));
        Ok(())
    }

    pub fn pipeline(&self, name: &str) -> Option<&TaskDAG> {
        self.pipelines.get(name).map(|dag| dag.as_ref())
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// Reports of every run this engine drove, oldest first.
    pub fn history(&self) -> &[RunReport] {
        &self.history
    }

    /// Run `pipeline` once for a trigger fired at `triggered_at`.
    pub async fn trigger(&mut self, pipeline: &str, triggered_at: DateTime<Utc>) -> Result<RunReport> {
        self.trigger_with(pipeline, triggered_at, CancellationToken::new(), None)
            .await
    }

    /// Run `pipeline` once, aborting when `cancel` fires and reporting
    /// progress on `events`.
    ///
    /// Workspaces still held when the scheduler finishes are released before
    /// this returns, whatever the run status.
    pub async fn trigger_with(
        &mut self,
        pipeline: &str,
        triggered_at: DateTime<Utc>,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<SchedulerEvent>>,
    ) -> Result<RunReport> {
        let dag = self
            .pipelines
            .get(pipeline)
            .cloned()
            .ok_or_else(|| Error::UnknownPipeline(pipeline.to_string()))?;

        let run_id = RunId::from_trigger(pipeline, triggered_at);
        let context = RunContext::new();
        let workspaces = WorkspaceManager::new(&self.settings.workspace_root);
        let executor = TaskExecutor::new(
            run_id.clone(),
            context.clone(),
            workspaces.clone(),
            self.collaborators.clone(),
            WorkerPool::new(self.settings.workers),
        )
        .with_sensor_failure_limit(self.settings.sensor_max_consecutive_failures);

        let mut scheduler = Scheduler::new(dag, Arc::new(executor))?
            .with_policy(self.settings.failure_policy)
            .with_notify_timeout(self.settings.notify_timeout)
            .with_cancel(cancel);
        if let Some(events) = events {
            scheduler = scheduler.with_events(events);
        }

        let started_at = Utc::now();
        info!(run = %run_id, pipeline, "run triggered");
        let summary = scheduler.run().await;
        workspaces.release_all().await;

        let report = RunReport {
            run_id,
            pipeline: pipeline.to_string(),
            status: summary.status,
            triggered_at,
            started_at,
            finished_at: Utc::now(),
            tasks: summary
                .tasks
                .into_iter()
                .map(|(id, record)| (id.to_string(), record))
                .collect(),
            context: context.snapshot().await,
            workspaces: workspaces.handles().await,
        };
        self.history.push(report.clone());
        Ok(report)
    }
}
