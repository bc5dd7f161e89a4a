//! Workflow Execution Module
//!
//! Everything between a stored workflow and the batch scheduler: the
//! submission engine, the files it writes, and the runtime operations
//! jobscripts call back into while tasks run.
//!
//! # Architecture
//!
//! - [`engine`]: Planning, writing and submitting submissions
//! - [`runtime`]: Per-task coordination through the store
//! - [`commands`]: Command file rendering
//! - [`jobscript`]: Jobscript parameters and renderers
//! - [`scheduler`]: Scheduler command line tools

pub mod commands;
pub mod engine;
pub mod jobscript;
pub mod runtime;
pub mod scheduler;

pub use engine::Engine;
pub use jobscript::{JobScriptParams, JobScriptRenderer, SgeRenderer};
pub use runtime::Runtime;
pub use scheduler::{JobDependency, Scheduler, SchedulerStats, SgeScheduler};
