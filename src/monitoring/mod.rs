//! Monitoring Module
//!
//! Reporting on submitted workflows.
//!
//! # Components
//!
//! - [`stats`]: Per-task timing, archive and accounting statistics
//! - [`host`]: Host identification recorded when tasks start

pub mod host;
pub mod stats;

pub use stats::{format_stats, save_stats, workflow_stats, WorkflowStats};
