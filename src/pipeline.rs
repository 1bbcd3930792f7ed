//! The weekly taxi-trips ETL pipeline.
//!
//! Stage a workspace, wait for both vendors' uploads, download and unzip
//! them, merge and normalise into one CSV, then load the raw data and an
//! anonymised, location-fuzzed copy. The workspace is torn down last
//! whatever happened upstream.
//!
//! Shell commands get every `ref(..)` value as one quoted word; vendor
//! globs are kept in single quotes so the transform program expands them.

use crate::collaborators::Notifier;
use crate::config::PipelineConfig;
use crate::core::dag::TaskDAG;
use crate::core::task::{LoadSpec, RetryPolicy, SensorSpec, ShellSpec, Task, TransferSpec};
use crate::error::Result;
use crate::template::Template;
use std::sync::Arc;
use std::time::Duration;

const STAGING: &str = "ref(staging, path)";

/// Build the taxi-trips graph. Every task reports failures to `notifier`.
pub fn taxi_trips(config: &PipelineConfig, notifier: Arc<dyn Notifier>) -> Result<TaskDAG> {
    let retry = RetryPolicy::new(config.retries, Duration::from_secs(config.retry_delay_secs));
    let program = &config.transform_program;

    let mut tasks = vec![Task::create_workspace("staging")];
    for (vendor, remote) in [("cmt", &config.cmt_path), ("verifone", &config.verifone_path)] {
        tasks.push(Task::sensor(
            &format!("wait_for_{}", vendor),
            SensorSpec {
                connection: config.ftp_connection.clone(),
                pattern: Template::new(&format!("{}/*", remote.trim_end_matches('/'))),
                poke_interval: Duration::from_secs(config.poke_interval_secs),
                timeout: Duration::from_secs(config.sensor_timeout_secs),
            },
        ));
        tasks.push(Task::transfer(
            &format!("download_{}", vendor),
            TransferSpec {
                connection: config.ftp_connection.clone(),
                source: Template::new(remote),
                dest: Template::new(&format!("{}/input/{}", STAGING, vendor)),
            },
        ));
        tasks.push(Task::shell(
            &format!("unzip_{}", vendor),
            ShellSpec::new(
                format!(
                    "for f in ref(download_{v}, path)/*.zip; do [ -e \"$f\" ] || continue; \
                     unzip -o \"$f\" -d ref(download_{v}, path)/; done",
                    v = vendor
                )
                .as_str(),
            ),
        ));
    }

    tasks.push(Task::shell(
        "download_hexbins",
        ShellSpec::new(
            format!(
                "{} {} -O {}/input/hexbins.geojson",
                config.fetch_program, config.hexbins_url, STAGING
            )
            .as_str(),
        )
        .artifact("path", format!("{}/input/hexbins.geojson", STAGING)),
    ));
    tasks.push(Task::shell(
        "merge_and_norm",
        ShellSpec::new(
            format!(
                "{p} normalize --verifone ref(download_verifone, path)'/*.csv' \
                 --cmt ref(download_cmt, path)'/*.csv' > {s}/merged_trips.csv",
                p = program,
                s = STAGING
            )
            .as_str(),
        )
        .artifact("path", format!("{}/merged_trips.csv", STAGING)),
    ));
    tasks.push(Task::bulk_load(
        "load_raw",
        LoadSpec {
            connection: config.warehouse_connection.clone(),
            csv_path: Template::new("ref(merge_and_norm, path)"),
            table: config.raw_table.clone(),
        },
    ));
    tasks.push(Task::shell(
        "fuzzy_time_and_loc",
        ShellSpec::new(
            format!(
                "{p} fuzzy --regions ref(download_hexbins, path) ref(merge_and_norm, path) \
                 > {s}/fuzzied_trips.csv",
                p = program,
                s = STAGING
            )
            .as_str(),
        )
        .artifact("path", format!("{}/fuzzied_trips.csv", STAGING)),
    ));
    tasks.push(Task::shell(
        "anonymize",
        ShellSpec::new(
            format!(
                "{p} anonymize ref(fuzzy_time_and_loc, path) > {s}/anonymized_trips.csv",
                p = program,
                s = STAGING
            )
            .as_str(),
        )
        .artifact("path", format!("{}/anonymized_trips.csv", STAGING)),
    ));
    tasks.push(Task::bulk_load(
        "load_public",
        LoadSpec {
            connection: config.warehouse_connection.clone(),
            csv_path: Template::new("ref(anonymize, path)"),
            table: config.public_table.clone(),
        },
    ));
    tasks.push(Task::destroy_workspace("cleanup_staging", STAGING));

    let mut dag = TaskDAG::new();
    for task in tasks {
        let task = task.on_failure(Arc::clone(&notifier));
        let task = if task.kind.is_teardown() {
            task
        } else {
            task.with_retry(retry)
        };
        dag.add_task(task)?;
    }

    dag.chain(&["staging", "wait_for_cmt", "download_cmt", "unzip_cmt", "merge_and_norm"])?;
    dag.chain(&[
        "staging",
        "wait_for_verifone",
        "download_verifone",
        "unzip_verifone",
        "merge_and_norm",
    ])?;
    dag.chain(&["merge_and_norm", "load_raw", "anonymize"])?;
    dag.chain(&["merge_and_norm", "download_hexbins", "fuzzy_time_and_loc", "anonymize"])?;
    dag.chain(&["anonymize", "load_public", "cleanup_staging"])?;

    Ok(dag)
}
