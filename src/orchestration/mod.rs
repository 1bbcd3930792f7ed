//! Orchestration layer: running one pipeline DAG to completion.
//!
//! The scheduler dispatches ready tasks onto the worker pool, the executor
//! performs each task's effect (using the sensor runner for polling tasks),
//! and the workspace manager owns the run's scratch directories.

mod executor;
mod pool;
mod scheduler;
mod sensor;
mod workspace;

pub use executor::{Outputs, TaskExecutor, TaskOutcome};
pub use pool::{WorkerPool, WorkerSlot};
pub use scheduler::{FailurePolicy, RunSummary, Scheduler, SchedulerEvent, TaskRecord};
pub use sensor::{SensorOutcome, SensorRunner};
pub use workspace::{WorkspaceHandle, WorkspaceManager};
