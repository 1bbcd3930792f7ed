//! The weekly taxi-trips pipeline driven end to end.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use cadence::core::run::RunStatus;
use cadence::core::task::TaskState;
use cadence::ContextValue;

use crate::fixtures::TaxiSandbox;

const ALL_TASKS: [&str; 14] = [
    "staging",
    "wait_for_cmt",
    "wait_for_verifone",
    "download_cmt",
    "download_verifone",
    "unzip_cmt",
    "unzip_verifone",
    "merge_and_norm",
    "load_raw",
    "download_hexbins",
    "fuzzy_time_and_loc",
    "anonymize",
    "load_public",
    "cleanup_staging",
];

#[tokio::test]
async fn test_weekly_run_succeeds_end_to_end() {
    let sandbox = TaxiSandbox::new().with_uploads();
    let mut engine = sandbox.engine();

    let report = engine
        .trigger(sandbox.pipeline_name(), Utc::now())
        .await
        .unwrap();

    for id in ALL_TASKS {
        assert_eq!(
            report.task(id).map(|r| &r.state),
            Some(&TaskState::Succeeded),
            "{} should have succeeded",
            id
        );
    }
    assert_eq!(report.status, RunStatus::Succeeded);

    let raw = sandbox.table("taxi_trips").expect("raw table written");
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines[0], "trip_id,fare");
    assert_eq!(lines.len(), 4);
    assert!(raw.contains("cmt-2,8.00"));
    assert!(raw.contains("vf-1,22.75"));

    let public = sandbox.table("taxi_trips_public").expect("public table written");
    assert_eq!(public.lines().count(), 4);

    assert_eq!(report.context["load_raw"]["rows"], ContextValue::from("3"));
    assert_eq!(report.context["wait_for_cmt"]["matches"], ContextValue::from("1"));
    assert!(sandbox.notifier.notices().is_empty());
}

#[tokio::test]
async fn test_workspace_root_with_shell_metacharacters() {
    let sandbox = TaxiSandbox::new()
        .with_workspace_dir("work spaces (it's) & more")
        .with_uploads();
    let mut engine = sandbox.engine();

    let report = engine
        .trigger(sandbox.pipeline_name(), Utc::now())
        .await
        .unwrap();

    for id in ALL_TASKS {
        assert_eq!(
            report.task(id).map(|r| &r.state),
            Some(&TaskState::Succeeded),
            "{} should have succeeded",
            id
        );
    }
    let raw = sandbox.table("taxi_trips").expect("raw table written");
    assert_eq!(raw.lines().count(), 4);
    assert!(report.workspaces[0].path.starts_with(&sandbox.workspaces));
    assert!(sandbox.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn test_exactly_one_workspace_per_run() {
    let sandbox = TaxiSandbox::new().with_uploads();
    let mut engine = sandbox.engine();

    let report = engine
        .trigger(sandbox.pipeline_name(), Utc::now())
        .await
        .unwrap();

    assert_eq!(report.workspaces.len(), 1);
    let workspace = &report.workspaces[0];
    assert!(workspace.is_released());
    assert!(!workspace.path.exists());
    assert!(workspace.path.starts_with(&sandbox.workspaces));
    assert_eq!(
        report.context["staging"]["path"],
        ContextValue::Path(workspace.path.clone())
    );
    assert!(sandbox.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn test_workspace_outlives_every_other_task() {
    let sandbox = TaxiSandbox::new().with_uploads();
    let mut engine = sandbox.engine();

    let report = engine
        .trigger(sandbox.pipeline_name(), Utc::now())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    let workspace = &report.workspaces[0];
    let released_at = workspace.released_at.expect("workspace released");
    let cleanup_started = report
        .task("cleanup_staging")
        .and_then(|r| r.started_at)
        .expect("cleanup started");

    for id in ALL_TASKS {
        let record = report.task(id).unwrap();
        let started = record.started_at.expect("task started");
        let finished = record.finished_at.expect("task finished");
        if id != "staging" {
            assert!(workspace.created_at <= started, "{} started before staging", id);
        }
        if id != "cleanup_staging" {
            assert!(finished <= cleanup_started, "{} finished after cleanup began", id);
            assert!(finished <= released_at, "{} finished after release", id);
        }
    }
}

#[tokio::test]
async fn test_missing_upload_fails_branch_and_still_cleans_up() {
    let sandbox = TaxiSandbox::new();
    sandbox.upload("verifone", "week1.csv", "trip_id,fare\nvf-1,22.75\n");
    let mut engine = sandbox.engine();

    let report = engine
        .trigger(sandbox.pipeline_name(), Utc::now())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    match &report.task("wait_for_cmt").unwrap().state {
        TaskState::Failed { error } => assert!(error.contains("timed out"), "{}", error),
        other => panic!("wait_for_cmt should have failed, got {:?}", other),
    }
    for id in ["wait_for_verifone", "download_verifone", "unzip_verifone", "cleanup_staging"] {
        assert_eq!(report.task(id).unwrap().state, TaskState::Succeeded, "{}", id);
    }
    for id in [
        "download_cmt",
        "unzip_cmt",
        "merge_and_norm",
        "load_raw",
        "download_hexbins",
        "fuzzy_time_and_loc",
        "anonymize",
        "load_public",
    ] {
        let record = report.task(id).unwrap();
        assert!(
            matches!(record.state, TaskState::Skipped { .. }),
            "{} should be skipped, got {:?}",
            id,
            record.state
        );
        assert!(record.started_at.is_none());
    }

    assert_eq!(sandbox.notifier.failed_tasks(), vec!["wait_for_cmt"]);
    assert_eq!(sandbox.notifier.notices()[0].run_id, report.run_id);
    assert!(sandbox.table("taxi_trips").is_none());
    assert!(sandbox.leftover_workspaces().is_empty());
}

#[tokio::test]
async fn test_cancel_mid_run_aborts_and_releases_workspace() {
    let mut sandbox = TaxiSandbox::new();
    sandbox.config.pipeline.sensor_timeout_secs = 60;
    let mut engine = sandbox.engine();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        }
    });

    let started = std::time::Instant::now();
    let report = engine
        .trigger_with(sandbox.pipeline_name(), Utc::now(), cancel, None)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(
        report.task("cleanup_staging").unwrap().state,
        TaskState::Succeeded
    );
    assert!(!report.task("load_raw").unwrap().state.is_success());
    assert!(report.workspaces.iter().all(|w| w.is_released()));
    assert!(sandbox.leftover_workspaces().is_empty());
    assert!(sandbox.notifier.notices().is_empty());
}

#[tokio::test]
async fn test_consecutive_runs_keep_history() {
    let sandbox = TaxiSandbox::new().with_uploads();
    let mut engine = sandbox.engine();

    let first = engine
        .trigger(sandbox.pipeline_name(), Utc::now())
        .await
        .unwrap();
    let second = engine
        .trigger(sandbox.pipeline_name(), Utc::now())
        .await
        .unwrap();

    assert_eq!(engine.history().len(), 2);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.status, RunStatus::Succeeded);
    // Loads append, so the raw table now holds both weeks' rows.
    let raw = sandbox.table("taxi_trips").unwrap();
    assert_eq!(raw.lines().count(), 7);
}
