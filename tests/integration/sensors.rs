//! Sensor timing against the wall clock.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cadence::collaborators::{Collaborators, LocalTransfer};
use cadence::core::dag::TaskDAG;
use cadence::core::run::RunStatus;
use cadence::core::task::{SensorSpec, Task};
use cadence::orchestration::{SensorOutcome, SensorRunner, WorkerPool};
use cadence::{ContextValue, Engine, EngineSettings};

#[tokio::test]
async fn test_sensor_times_out_no_earlier_than_deadline() {
    let runner = SensorRunner::new(WorkerPool::new(1));
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let outcome = runner
        .run(
            || async { Ok(false) },
            Duration::from_secs(1),
            Duration::from_secs(3),
            &cancel,
        )
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(outcome, SensorOutcome::TimedOut { polls } if polls >= 3));
    assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(4500), "{:?}", elapsed);
}

#[tokio::test]
async fn test_sensor_leaves_worker_free_between_polls() {
    let pool = WorkerPool::new(1);
    let runner = SensorRunner::new(pool.clone());
    let cancel = CancellationToken::new();

    let sensing = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            runner
                .run(
                    || async { Ok(false) },
                    Duration::from_millis(500),
                    Duration::from_secs(30),
                    &cancel,
                )
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let slot = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
        .await
        .expect("the only worker should be free while the sensor sleeps")
        .unwrap();
    drop(slot);

    cancel.cancel();
    assert_eq!(sensing.await.unwrap(), SensorOutcome::Cancelled);
}

#[tokio::test]
async fn test_sensor_sees_upload_arriving_mid_wait() {
    let temp_dir = TempDir::new().unwrap();
    let remote = temp_dir.path().join("remote");
    fs::create_dir_all(remote.join("Taxi/cmt")).unwrap();

    let mut dag = TaskDAG::new();
    dag.add_task(Task::sensor(
        "wait_for_cmt",
        SensorSpec {
            connection: "ftp".to_string(),
            pattern: "/Taxi/cmt/*.csv".into(),
            poke_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        },
    ))
    .unwrap();

    let mut engine = Engine::new(
        EngineSettings::new(temp_dir.path().join("workspaces")),
        Collaborators::new().with_transfer("ftp", Arc::new(LocalTransfer::new(&remote))),
    );
    engine.register("wait", dag).unwrap();

    let upload = remote.join("Taxi/cmt/week1.csv");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(700)).await;
        fs::write(upload, "trip_id\n1\n").unwrap();
    });

    let report = engine.trigger("wait", Utc::now()).await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(
        report.context["wait_for_cmt"]["matches"],
        ContextValue::from("1")
    );
}
