use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::orchestration::FailurePolicy;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Tasks allowed to work at the same time.
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    /// Directory run workspaces are created under. Defaults to
    /// `~/.cadence/workspaces`.
    pub workspace_root: Option<String>,
    pub notify_timeout_secs: u64,
    pub sensor_max_consecutive_failures: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            failure_policy: FailurePolicy::default(),
            workspace_root: None,
            notify_timeout_secs: 30,
            sensor_max_consecutive_failures: None,
        }
    }
}

/// A named connection to an external system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// A local directory standing in for a remote file store.
    Local { root: PathBuf },
    /// A directory of `<table>.csv` files standing in for a warehouse.
    TableDir {
        dir: PathBuf,
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NotifyConfig {
    /// Shell hook run for every failed task.
    pub command: Option<String>,
}

/// Parameters of the taxi-trips pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    pub ftp_connection: String,
    pub warehouse_connection: String,
    pub cmt_path: String,
    pub verifone_path: String,
    pub poke_interval_secs: u64,
    pub sensor_timeout_secs: u64,
    pub raw_table: String,
    pub public_table: String,
    pub transform_program: String,
    pub fetch_program: String,
    pub hexbins_url: String,
    pub retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "etl_taxi_trips_v4".to_string(),
            ftp_connection: "phl-ftp-etl".to_string(),
            warehouse_connection: "phl-warehouse-staging".to_string(),
            cmt_path: "/Taxi/cmt".to_string(),
            verifone_path: "/Taxi/verifone".to_string(),
            poke_interval_secs: 60 * 60 * 12,
            sensor_timeout_secs: 60 * 60 * 24 * 7,
            raw_table: "taxi_trips".to_string(),
            public_table: "taxi_trips_public".to_string(),
            transform_program: "taxitrips.py".to_string(),
            fetch_program: "wget".to_string(),
            hexbins_url: "https://github.com/CityOfPhiladelphia/trip-data-pipeline/raw/master/geo/hexagons_20160919.geojson".to_string(),
            retries: 0,
            retry_delay_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    /// `@hourly`, `@daily` or `@weekly`.
    pub interval: String,
    /// No run fires before this instant.
    pub start_date: Option<DateTime<Utc>>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: "@weekly".to_string(),
            start_date: None,
        }
    }
}

impl Config {
    pub fn cadence_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadence"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("cadence.toml"))
    }

    pub fn workspace_root(&self) -> Result<PathBuf> {
        match &self.engine.workspace_root {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::cadence_dir()?.join("workspaces")),
        }
    }

    /// Load the config at `path`, or the default location when `None`.
    ///
    /// A missing file at the default location yields the defaults; a
    /// missing file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::config_path()?, false),
        };
        debug!(path = %path.display(), "loading config");

        if !path.exists() {
            if explicit {
                return Err(Error::Config(format!("{} does not exist", path.display())));
            }
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }

        let config = Self::parse(&fs::read_to_string(&path)?)?;
        debug!(
            workers = config.engine.workers,
            connections = config.connections.len(),
            policy = ?config.engine.failure_policy,
            "config loaded"
        );
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.engine.workers == 0 {
            return Err(Error::Config("engine.workers must be at least 1".to_string()));
        }
        if self.pipeline.poke_interval_secs == 0 {
            return Err(Error::Config(
                "pipeline.poke_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
