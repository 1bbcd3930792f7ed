//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A local "remote" directory with vendor uploads
//! - Stub transform and fetch scripts
//! - A notifier that records every failure notice

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use cadence::collaborators::{Collaborators, FailureNotice, Notifier, NotifyError};
use cadence::config::{Config, ConnectionConfig, PipelineConfig};
use cadence::{pipeline, Engine, EngineSettings};

/// Notifier that keeps every notice it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<FailureNotice>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<FailureNotice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn failed_tasks(&self) -> Vec<String> {
        self.notices()
            .into_iter()
            .map(|notice| notice.task_id.to_string())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

const TRANSFORM: &str = r#"#!/bin/sh
set -e
case "$1" in
  normalize)
    header=""
    for glob in "$3" "$5"; do
      dir=$(dirname "$glob")
      for f in "$dir"/$(basename "$glob"); do
        if [ -z "$header" ]; then
          header=$(head -n 1 "$f")
          echo "$header"
        fi
        tail -n +2 "$f"
      done
    done
    ;;
  fuzzy)
    cat "$4"
    ;;
  anonymize)
    cat "$2"
    ;;
  *)
    echo "unknown step $1" >&2
    exit 2
    ;;
esac
"#;

const FETCH: &str = r#"#!/bin/sh
echo '{"type":"FeatureCollection","features":[]}' > "$3"
"#;

/// A complete sandbox for the taxi-trips pipeline: remote uploads, a
/// warehouse directory, a workspace root and stub programs.
pub struct TaxiSandbox {
    pub temp_dir: TempDir,
    pub remote: PathBuf,
    pub warehouse: PathBuf,
    pub workspaces: PathBuf,
    pub notifier: RecordingNotifier,
    pub config: Config,
}

impl TaxiSandbox {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path().to_path_buf();
        let remote = base.join("remote");
        let warehouse = base.join("warehouse");
        let workspaces = base.join("workspaces");
        let bin = base.join("bin");
        fs::create_dir_all(remote.join("Taxi/cmt")).unwrap();
        fs::create_dir_all(remote.join("Taxi/verifone")).unwrap();
        fs::create_dir_all(&bin).unwrap();

        let transform = write_script(&bin, "taxitrips", TRANSFORM);
        let fetch = write_script(&bin, "fetch", FETCH);

        let mut config = Config::default();
        config.engine.workspace_root = Some(workspaces.to_string_lossy().into_owned());
        config.connections.insert(
            "phl-ftp-etl".to_string(),
            ConnectionConfig::Local {
                root: remote.clone(),
            },
        );
        config.connections.insert(
            "phl-warehouse-staging".to_string(),
            ConnectionConfig::TableDir {
                dir: warehouse.clone(),
                delimiter: ',',
            },
        );
        config.pipeline = PipelineConfig {
            transform_program: format!("sh {}", transform.display()),
            fetch_program: format!("sh {}", fetch.display()),
            poke_interval_secs: 1,
            sensor_timeout_secs: 2,
            ..PipelineConfig::default()
        };

        Self {
            temp_dir,
            remote,
            warehouse,
            workspaces,
            notifier: RecordingNotifier::new(),
            config,
        }
    }

    /// Create run workspaces under `<sandbox>/<dir>` instead.
    pub fn with_workspace_dir(mut self, dir: &str) -> Self {
        self.workspaces = self.temp_dir.path().join(dir);
        self.config.engine.workspace_root =
            Some(self.workspaces.to_string_lossy().into_owned());
        self
    }

    /// Drop one upload for each vendor.
    pub fn with_uploads(self) -> Self {
        self.upload(
            "cmt",
            "week1.csv",
            "trip_id,fare\ncmt-1,12.50\ncmt-2,8.00\n",
        );
        self.upload("verifone", "week1.csv", "trip_id,fare\nvf-1,22.75\n");
        self
    }

    pub fn upload(&self, vendor: &str, name: &str, content: &str) {
        fs::write(self.remote.join("Taxi").join(vendor).join(name), content).unwrap();
    }

    /// An engine with the taxi-trips pipeline registered.
    pub fn engine(&self) -> Engine {
        let dag = pipeline::taxi_trips(&self.config.pipeline, Arc::new(self.notifier.clone()))
            .expect("pipeline should build");
        let mut engine = Engine::new(
            EngineSettings::from_config(&self.config).expect("settings"),
            Collaborators::from_config(&self.config),
        );
        engine
            .register(&self.config.pipeline.name, dag)
            .expect("pipeline should register");
        engine
    }

    pub fn pipeline_name(&self) -> &str {
        &self.config.pipeline.name
    }

    pub fn table(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.warehouse.join(format!("{}.csv", name))).ok()
    }

    /// Directories left under the workspace root.
    pub fn leftover_workspaces(&self) -> Vec<PathBuf> {
        match fs::read_dir(&self.workspaces) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

// Run as `sh <path>`, never exec'd directly (ETXTBSY under parallel tests).
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}
