//! Core domain models for pipeline orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: tasks and the pipeline DAG.

pub mod dag;
pub mod run;
pub mod task;

pub use dag::TaskDAG;
pub use run::{RunId, RunStatus};
pub use task::{
    LoadSpec, RetryPolicy, SensorSpec, ShellSpec, Task, TaskId, TaskKind, TaskState,
    TransferSpec, TriggerRule,
};
