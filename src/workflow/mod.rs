//! Workflow Definition Module
//!
//! Data structures and algorithms describing a workflow before anything
//! runs.
//!
//! # Structure
//!
//! - [`model`]: Persistent entities (Workflow, CommandGroup, Submission, Task, VarValue)
//! - [`parser`]: Definition loading and workflow construction
//! - [`validator`]: Construction-time checks
//! - [`variables`]: Variable resolution inside one directory
//! - [`resolve`]: Variable resolution over a workflow's submissions
//! - [`planner`]: Task multiplicities and scheduler groups

pub mod model;
pub mod parser;
pub mod planner;
pub mod resolve;
pub mod validator;
pub mod variables;

pub use model::{Command, CommandGroup, Nesting, VarDefinition, Workflow};
pub use parser::{build_workflow, load_definition, parse_definition, WorkflowDefinition};
pub use planner::{Multiplicity, Plan, SchedulerGroup};
pub use variables::{extract_variable_names, resolve_variable_values};
