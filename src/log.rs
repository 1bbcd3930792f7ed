//! Logging setup.
//!
//! Everything logs through `tracing` with structured fields. `RUST_LOG`
//! takes precedence; otherwise the level is INFO, or DEBUG when the
//! `--debug` flag or `CADENCE_DEBUG=1` is given.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::Result;

/// Install the global subscriber, writing to `log_file` when given and to
/// stderr otherwise.
pub fn init(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let env_debug = std::env::var("CADENCE_DEBUG").ok();
    let level = default_level(debug, env_debug.as_deref());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init();
        }
    }
    Ok(())
}

fn default_level(flag: bool, env: Option<&str>) -> &'static str {
    let env_debug = env
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if flag || env_debug {
        "debug"
    } else {
        "info"
    }
}
