use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cadence::collaborators::{notifier_from_config, Collaborators};
use cadence::config::Config;
use cadence::core::run::RunStatus;
use cadence::schedule::Schedule;
use cadence::{pipeline, Engine, EngineSettings, Result, RunReport};

/// Cadence - a small workflow engine for scheduled ETL pipelines
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADENCE_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG          Log filter, overrides both")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.cadence/cadence.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Trigger one run of the pipeline now
    Run {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the pipeline graph, its references and its connections
    Validate,

    /// Print the pipeline graph in Graphviz DOT format
    Graph,

    /// Run the pipeline on its configured interval until interrupted
    Schedule {
        /// Wait for the next fire time, run once, then exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    cadence::log::init(cli.debug, cli.log_file.as_deref())?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Graph => {
            let dag = pipeline::taxi_trips(&config.pipeline, notifier_from_config(&config))?;
            print!("{}", dag.to_dot(&config.pipeline.name));
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate => {
            let engine = build_engine(&config)?;
            if let Some(dag) = engine.pipeline(&config.pipeline.name) {
                println!(
                    "{} is valid: {} tasks, {} dependencies",
                    config.pipeline.name,
                    dag.task_count(),
                    dag.dependency_count()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { json } => {
            let mut engine = build_engine(&config)?;
            let cancel = cancel_on_shutdown();
            let report = engine
                .trigger_with(&config.pipeline.name, Utc::now(), cancel, None)
                .await?;
            print_report(&engine, &report, json)?;
            Ok(exit_code(report.status))
        }
        Command::Schedule { once } => {
            let mut engine = build_engine(&config)?;
            let schedule = Schedule::from_config(&config.schedule)?;
            let cancel = cancel_on_shutdown();
            run_schedule(&mut engine, &config.pipeline.name, &schedule, &cancel, once).await
        }
    }
}

fn build_engine(config: &Config) -> Result<Engine> {
    let dag = pipeline::taxi_trips(&config.pipeline, notifier_from_config(config))?;
    let mut engine = Engine::new(
        EngineSettings::from_config(config)?,
        Collaborators::from_config(config),
    );
    engine.register(&config.pipeline.name, dag)?;
    Ok(engine)
}

async fn run_schedule(
    engine: &mut Engine,
    pipeline: &str,
    schedule: &Schedule,
    cancel: &CancellationToken,
    once: bool,
) -> Result<ExitCode> {
    let mut last = ExitCode::SUCCESS;
    loop {
        let next = schedule.next_after(Utc::now())?;
        info!(pipeline, interval = %schedule.interval, %next, "waiting for next run");

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => {
                info!("schedule stopped");
                return Ok(last);
            }
        }

        let report = engine
            .trigger_with(pipeline, next, cancel.clone(), None)
            .await?;
        print_report(engine, &report, false)?;
        last = exit_code(report.status);

        if once || cancel.is_cancelled() {
            return Ok(last);
        }
    }
}

fn print_report(engine: &Engine, report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}  {}", report.run_id, report.status);
    let order = engine
        .pipeline(&report.pipeline)
        .map(|dag| dag.topological_order())
        .transpose()?
        .unwrap_or_default();
    for task in order {
        if let Some(record) = report.task(task.id.as_str()) {
            println!("  {:<22} {}", task.id, record.state);
        }
    }
    Ok(())
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Failed | RunStatus::Aborted => ExitCode::FAILURE,
    }
}

/// A token cancelled on Ctrl-C or SIGTERM.
fn cancel_on_shutdown() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            warn!("shutdown requested, cancelling run");
            cancel.cancel();
        }
    });
    cancel
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
