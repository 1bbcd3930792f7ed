pub mod collaborators;
pub mod config;
pub mod context;
pub mod core;
pub mod engine;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod pipeline;
pub mod schedule;
pub mod template;

pub use context::{ContextValue, RunContext};
pub use engine::{Engine, EngineSettings, RunReport};
pub use error::{ContextError, Error, Result, TaskError};
pub use template::{Reference, Template};
