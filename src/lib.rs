//! ArrayFlow - Multi-Stage Job-Array Workflows
//!
//! Generates, submits and coordinates multi-stage workflows on HPC batch
//! schedulers. Each stage (a command group) runs as a scheduler job array
//! over a set of working directories; stages that share an array range form
//! a scheduler group, and consecutive jobs are chained with scheduler
//! dependencies.
//!
//! # Architecture
//!
//! - [`workflow`]: Definitions, variable resolution and scheduler-group planning
//! - [`execution`]: Submission engine, jobscripts and runtime coordination
//! - [`store`]: Shared transactional store and leases
//! - [`archive`]: Copying working directories to archive locations
//! - [`monitoring`]: Task statistics and reports
//!
//! # Example
//!
//! ```rust,no_run
//! use arrayflow::execution::Engine;
//! use arrayflow::workflow::model::TaskRange;
//! use arrayflow::{load_definition, Config};
//!
//! fn main() -> arrayflow::Result<()> {
//!     let definition = load_definition("workflow.yml")?;
//!
//!     let engine = Engine::open("/data/analysis", &Config::default())?;
//!     let workflow = engine.make_workflow(&definition)?;
//!
//!     // Submit every task of the first scheduler group
//!     engine.submit_workflow(workflow, TaskRange::default())?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod project;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use execution::engine::Engine;
pub use project::Project;
pub use workflow::model::{TaskRange, Workflow};
pub use workflow::parser::{load_definition, WorkflowDefinition};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ArrayFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ArrayFlow");
    }

    #[test]
    fn test_module_exports_task_range() {
        let range = TaskRange::default();
        assert!(range.is_unbounded());
        assert_eq!(range.start, 1);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
