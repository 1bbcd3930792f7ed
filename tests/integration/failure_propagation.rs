//! Failure handling across a run: skips, policies and notifications.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cadence::collaborators::{Collaborators, LocalTransfer};
use cadence::core::dag::TaskDAG;
use cadence::core::run::RunStatus;
use cadence::core::task::{SensorSpec, ShellSpec, Task, TaskState};
use cadence::orchestration::FailurePolicy;
use cadence::{Engine, EngineSettings, RunReport};

use crate::fixtures::RecordingNotifier;

struct Harness {
    _temp_dir: TempDir,
    engine: Engine,
    notifier: RecordingNotifier,
}

impl Harness {
    fn new(policy: FailurePolicy) -> Self {
        Self::with_workers(policy, 4)
    }

    fn with_workers(policy: FailurePolicy, workers: usize) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let remote = temp_dir.path().join("remote");
        fs::create_dir_all(remote.join("present")).unwrap();
        fs::write(remote.join("present/upload.csv"), "a,b\n1,2\n").unwrap();

        let mut settings = EngineSettings::new(temp_dir.path().join("workspaces"));
        settings.failure_policy = policy;
        settings.workers = workers;
        let collaborators =
            Collaborators::new().with_transfer("ftp", Arc::new(LocalTransfer::new(&remote)));

        Self {
            _temp_dir: temp_dir,
            engine: Engine::new(settings, collaborators),
            notifier: RecordingNotifier::new(),
        }
    }

    fn task(&self, task: Task) -> Task {
        task.on_failure(Arc::new(self.notifier.clone()))
    }

    fn sensor(&self, id: &str, pattern: &str) -> Task {
        self.task(Task::sensor(
            id,
            SensorSpec {
                connection: "ftp".to_string(),
                pattern: pattern.into(),
                poke_interval: Duration::from_millis(100),
                timeout: Duration::from_millis(300),
            },
        ))
    }

    fn shell(&self, id: &str, command: &str) -> Task {
        self.task(Task::shell(id, ShellSpec::new(command)))
    }

    async fn run(&mut self, dag: TaskDAG) -> RunReport {
        self.engine.register("test", dag).unwrap();
        self.engine.trigger("test", Utc::now()).await.unwrap()
    }
}

fn state<'a>(report: &'a RunReport, id: &str) -> &'a TaskState {
    &report.task(id).unwrap().state
}

#[tokio::test]
async fn test_sensor_timeout_skips_join_and_notifies() {
    let mut h = Harness::new(FailurePolicy::ContinueIndependent);
    let mut dag = TaskDAG::new();
    dag.add_task(h.task(Task::create_workspace("staging"))).unwrap();
    dag.add_task(h.sensor("sensor_a", "/missing/*")).unwrap();
    dag.add_task(h.sensor("sensor_b", "/present/*")).unwrap();
    dag.add_task(h.shell("task_a", "true")).unwrap();
    dag.add_task(h.shell("task_b", "echo b > ref(staging, path)/b.txt"))
        .unwrap();
    dag.add_task(h.shell("join", "true")).unwrap();
    dag.add_task(h.task(Task::destroy_workspace("cleanup", "ref(staging, path)")))
        .unwrap();
    dag.chain(&["staging", "sensor_a", "task_a", "join", "cleanup"])
        .unwrap();
    dag.chain(&["staging", "sensor_b", "task_b", "join"]).unwrap();

    let report = h.run(dag).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(matches!(state(&report, "sensor_a"), TaskState::Failed { .. }));
    assert_eq!(state(&report, "sensor_b"), &TaskState::Succeeded);
    assert_eq!(state(&report, "task_b"), &TaskState::Succeeded);
    assert!(matches!(state(&report, "task_a"), TaskState::Skipped { .. }));
    match state(&report, "join") {
        TaskState::Skipped { reason } => assert!(reason.contains("task_a"), "{}", reason),
        other => panic!("join should be skipped, got {:?}", other),
    }
    assert_eq!(state(&report, "cleanup"), &TaskState::Succeeded);
    assert_eq!(report.workspaces.len(), 1);
    assert!(report.workspaces[0].is_released());

    let notices = h.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].task_id.as_str(), "sensor_a");
    assert!(notices[0].cause.contains("timed out"));
    assert_eq!(notices[0].run_id, report.run_id);
}

#[tokio::test]
async fn test_skip_cascades_through_descendants() {
    let mut h = Harness::new(FailurePolicy::ContinueIndependent);
    let mut dag = TaskDAG::new();
    dag.add_task(h.shell("extract", "exit 3")).unwrap();
    dag.add_task(h.shell("transform", "true")).unwrap();
    dag.add_task(h.shell("load", "true")).unwrap();
    dag.chain(&["extract", "transform", "load"]).unwrap();

    let report = h.run(dag).await;

    match state(&report, "extract") {
        TaskState::Failed { error } => assert!(error.contains("exit code 3"), "{}", error),
        other => panic!("extract should fail, got {:?}", other),
    }
    assert!(matches!(state(&report, "transform"), TaskState::Skipped { .. }));
    match state(&report, "load") {
        TaskState::Skipped { reason } => assert!(reason.contains("transform"), "{}", reason),
        other => panic!("load should be skipped, got {:?}", other),
    }
    // Skipped tasks are not failures and are not reported.
    assert_eq!(h.notifier.failed_tasks(), vec!["extract"]);
}

#[tokio::test]
async fn test_independent_branches_continue() {
    let mut h = Harness::new(FailurePolicy::ContinueIndependent);
    let mut dag = TaskDAG::new();
    dag.add_task(h.shell("broken", "exit 1")).unwrap();
    dag.add_task(h.shell("other", "true")).unwrap();
    dag.add_task(h.shell("after_other", "true")).unwrap();
    dag.chain(&["other", "after_other"]).unwrap();

    let report = h.run(dag).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(state(&report, "other"), &TaskState::Succeeded);
    assert_eq!(state(&report, "after_other"), &TaskState::Succeeded);
}

#[tokio::test]
async fn test_stop_on_failure_cancels_running_work() {
    let mut h = Harness::new(FailurePolicy::StopOnFailure);
    let mut dag = TaskDAG::new();
    dag.add_task(h.shell("broken", "sleep 0.2; exit 1")).unwrap();
    dag.add_task(h.shell("slow", "sleep 30")).unwrap();
    dag.add_task(h.shell("after_slow", "true")).unwrap();
    dag.chain(&["slow", "after_slow"]).unwrap();

    let started = Instant::now();
    let report = h.run(dag).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.status, RunStatus::Failed);
    assert!(matches!(state(&report, "slow"), TaskState::Failed { .. }));
    match state(&report, "after_slow") {
        TaskState::Skipped { reason } => assert!(reason.contains("broken"), "{}", reason),
        other => panic!("after_slow should be skipped, got {:?}", other),
    }
    // Work cancelled by the policy is not a failure of its own.
    assert_eq!(h.notifier.failed_tasks(), vec!["broken"]);
}

#[tokio::test]
async fn test_teardown_runs_after_failure() {
    let mut h = Harness::new(FailurePolicy::ContinueIndependent);
    let mut dag = TaskDAG::new();
    dag.add_task(h.task(Task::create_workspace("staging"))).unwrap();
    dag.add_task(h.shell("work", "exit 1")).unwrap();
    dag.add_task(h.task(Task::destroy_workspace("cleanup", "ref(staging, path)")))
        .unwrap();
    dag.chain(&["staging", "work", "cleanup"]).unwrap();

    let report = h.run(dag).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(state(&report, "cleanup"), &TaskState::Succeeded);
    assert!(report.workspaces[0].is_released());
    assert!(!report.workspaces[0].path.exists());
}

#[tokio::test]
async fn test_worker_limit_serializes_independent_tasks() {
    let mut h = Harness::with_workers(FailurePolicy::ContinueIndependent, 1);
    let mut dag = TaskDAG::new();
    dag.add_task(h.shell("first", "sleep 0.2")).unwrap();
    dag.add_task(h.shell("second", "sleep 0.2")).unwrap();

    let started = Instant::now();
    let report = h.run(dag).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(started.elapsed() >= Duration::from_millis(400));
    let first = report.task("first").unwrap();
    let second = report.task("second").unwrap();
    let (a_start, a_end) = (first.started_at.unwrap(), first.finished_at.unwrap());
    let (b_start, b_end) = (second.started_at.unwrap(), second.finished_at.unwrap());
    assert!(
        a_end <= b_start || b_end <= a_start,
        "first ran {}..{}, second ran {}..{}",
        a_start,
        a_end,
        b_start,
        b_end
    );
}

#[tokio::test]
async fn test_unread_event_listener_does_not_stall_run() {
    let mut h = Harness::new(FailurePolicy::ContinueIndependent);
    let mut dag = TaskDAG::new();
    dag.add_task(h.shell("a", "true")).unwrap();
    dag.add_task(h.shell("b", "true")).unwrap();
    dag.add_task(h.shell("c", "true")).unwrap();
    dag.chain(&["a", "b", "c"]).unwrap();
    h.engine.register("test", dag).unwrap();
    let (tx, _rx) = tokio::sync::mpsc::channel(1);

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        h.engine
            .trigger_with("test", Utc::now(), CancellationToken::new(), Some(tx)),
    )
    .await
    .expect("run should finish without a reader")
    .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
}
