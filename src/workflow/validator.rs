//! Workflow Validation
//!
//! Checks run once, while a workflow is built:
//! - Exec orders are contiguous from 0 with one group per value
//! - Every group has commands and every command line has text
//! - Referenced variables and parallel modes exist
//! - Derived variables form an acyclic graph (Kahn's algorithm)
//! - Loop, archive and scratch settings point at real things

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};

use super::model::{Command, Workflow};
use crate::config::Delimiters;
use crate::error::{Error, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyWorkflow,
    MixedExecOrders,
    MultipleChannels(usize),
    NonContiguousExecOrders(Vec<usize>),
    EmptyCommands(usize),
    EmptyLine(usize),
    DuplicateVariable(String),
    UnknownParallelMode { group: usize, mode: String },
    UnknownLoopGroup(usize),
    ZeroIterations,
    UnknownArchive { group: usize, archive: usize },
    MissingScratch { group: usize, path: String },
    MultipleDirectoryVariables { group: usize, names: Vec<String> },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no command groups"),
            Self::MixedExecOrders => {
                write!(f, "Either all command groups or none must specify exec_order")
            }
            Self::MultipleChannels(order) => write!(
                f,
                "More than one command group has exec_order {}; only one channel is supported",
                order
            ),
            Self::NonContiguousExecOrders(orders) => write!(
                f,
                "exec_order values must be contiguous from 0, got {:?}",
                orders
            ),
            Self::EmptyCommands(group) => write!(f, "Command group {} has no commands", group),
            Self::EmptyLine(group) => write!(f, "Command group {} has an empty command line", group),
            Self::DuplicateVariable(name) => write!(f, "Variable '{}' is defined twice", name),
            Self::UnknownParallelMode { group, mode } => write!(
                f,
                "Command group {} uses unknown parallel mode '{}'",
                group, mode
            ),
            Self::UnknownLoopGroup(group) => {
                write!(f, "Loop refers to unknown command group {}", group)
            }
            Self::ZeroIterations => write!(f, "Loop max_iterations must be at least 1"),
            Self::UnknownArchive { group, archive } => write!(
                f,
                "Command group {} refers to unknown archive {}",
                group, archive
            ),
            Self::MissingScratch { group, path } => write!(
                f,
                "Alternate scratch '{}' of command group {} is not a directory",
                path, group
            ),
            Self::MultipleDirectoryVariables { group, names } => write!(
                f,
                "Directory of command group {} embeds more than one variable: {:?}",
                group, names
            ),
        }
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err.to_string())
    }
}

/// Resolves user-given exec orders. Groups without any get their position.
pub fn assign_exec_orders(given: &[Option<usize>]) -> Result<Vec<usize>> {
    if given.iter().all(Option::is_none) {
        return Ok((0..given.len()).collect());
    }
    if given.iter().any(Option::is_none) {
        return Err(ValidationError::MixedExecOrders.into());
    }

    let orders: Vec<usize> = given.iter().flatten().copied().collect();
    let mut seen = HashSet::new();
    for order in &orders {
        if !seen.insert(*order) {
            return Err(ValidationError::MultipleChannels(*order).into());
        }
    }

    let mut sorted = orders.clone();
    sorted.sort_unstable();
    if sorted.iter().enumerate().any(|(i, o)| i != *o) {
        return Err(ValidationError::NonContiguousExecOrders(sorted).into());
    }

    Ok(orders)
}

fn has_empty_line(command: &Command) -> bool {
    match command {
        Command::Line { line, .. } => line.trim().is_empty(),
        Command::Subshell { subshell } => subshell.is_empty() || subshell.iter().any(has_empty_line),
    }
}

/// Validates a built workflow.
pub fn validate_workflow(workflow: &Workflow, delims: &Delimiters) -> Result<()> {
    if workflow.command_groups.is_empty() {
        return Err(ValidationError::EmptyWorkflow.into());
    }

    let orders: Vec<Option<usize>> = workflow
        .command_groups
        .iter()
        .map(|g| Some(g.exec_order))
        .collect();
    assign_exec_orders(&orders)?;

    let mut names = HashSet::new();
    for def in &workflow.var_definitions {
        if !names.insert(def.name.as_str()) {
            return Err(ValidationError::DuplicateVariable(def.name.clone()).into());
        }
    }

    for group in &workflow.command_groups {
        if group.commands.is_empty() {
            return Err(ValidationError::EmptyCommands(group.exec_order).into());
        }
        if group.commands.iter().any(has_empty_line) {
            return Err(ValidationError::EmptyLine(group.exec_order).into());
        }

        for name in group.command_variable_names(delims) {
            if workflow.var_definition_by_name(&name).is_none() {
                return Err(Error::UnknownVariable(name));
            }
        }

        for mode in group.parallel_modes() {
            if !workflow.parallel_modes.contains_key(&mode) {
                return Err(ValidationError::UnknownParallelMode {
                    group: group.exec_order,
                    mode,
                }
                .into());
            }
        }

        if let Some(archive) = group.archive {
            if archive >= workflow.archives.len() {
                return Err(ValidationError::UnknownArchive {
                    group: group.exec_order,
                    archive,
                }
                .into());
            }
        }

        if let Some(scratch) = &group.alternate_scratch {
            if !scratch.is_dir() {
                return Err(ValidationError::MissingScratch {
                    group: group.exec_order,
                    path: scratch.display().to_string(),
                }
                .into());
            }
        }
    }

    if workflow.loop_spec.max_iterations == 0 {
        return Err(ValidationError::ZeroIterations.into());
    }
    if let Some(groups) = &workflow.loop_spec.groups {
        for group in groups {
            if workflow.command_group(*group).is_none() {
                return Err(ValidationError::UnknownLoopGroup(*group).into());
            }
        }
    }

    let order = variable_order(workflow, delims)?;
    debug!("Variable resolution order: {:?}", order);

    info!(
        "Workflow valid: {} command group(s), {} variable(s)",
        workflow.command_groups.len(),
        workflow.var_definitions.len()
    );
    Ok(())
}

/// Topologically sorts variable names so dependencies come first.
///
/// Fails on references to undefined variables and on cycles.
pub fn variable_order(workflow: &Workflow, delims: &Delimiters) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<&str>> = HashMap::new();

    for def in &workflow.var_definitions {
        let deps = def.dependencies(delims);
        for dep in &deps {
            if workflow.var_definition_by_name(dep).is_none() {
                return Err(Error::UnknownVariable(format!("{} (used by '{}')", dep, def.name)));
            }
            dependents.entry(dep.clone()).or_default().push(&def.name);
        }
        in_degree.insert(&def.name, deps.len());
    }

    let mut queue: VecDeque<&str> = workflow
        .var_definitions
        .iter()
        .filter(|d| in_degree.get(d.name.as_str()) == Some(&0))
        .map(|d| d.name.as_str())
        .collect();

    let mut sorted: Vec<String> = Vec::new();
    while let Some(current) = queue.pop_front() {
        sorted.push(current.to_string());
        for dependent in dependents.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if sorted.len() != workflow.var_definitions.len() {
        let mut cyclic: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n.to_string())
            .collect();
        cyclic.sort();
        return Err(Error::CyclicVariables(cyclic));
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{CommandGroup, LoopSpec, VarDefId, VarDefinition, WorkflowId};

    fn delims() -> Delimiters {
        Delimiters::default()
    }

    fn workflow(groups: Vec<CommandGroup>, defs: Vec<VarDefinition>) -> Workflow {
        Workflow::new(WorkflowId(0), "/tmp", groups, defs)
    }

    fn dir_var() -> VarDefinition {
        VarDefinition::literal("dir", "")
    }

    #[test]
    fn test_assign_exec_orders() {
        assert_eq!(assign_exec_orders(&[None, None, None]).unwrap(), vec![0, 1, 2]);
        assert_eq!(assign_exec_orders(&[Some(1), Some(0)]).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_exec_orders_single_channel() {
        let err = assign_exec_orders(&[Some(0), Some(0)]).unwrap_err();
        assert!(err.to_string().contains("only one channel"));
    }

    #[test]
    fn test_exec_orders_contiguous() {
        assert!(assign_exec_orders(&[Some(0), Some(2)]).is_err());
        assert!(assign_exec_orders(&[Some(1)]).is_err());
        assert!(assign_exec_orders(&[Some(0), None]).is_err());
    }

    #[test]
    fn test_valid_workflow() {
        let wf = workflow(
            vec![CommandGroup::new(0, vec![Command::line("echo <<x>>")], VarDefId(0))],
            vec![dir_var(), VarDefinition::with_data("x", vec!["1".into()])],
        );
        assert!(validate_workflow(&wf, &delims()).is_ok());
    }

    #[test]
    fn test_empty_workflow() {
        let wf = workflow(Vec::new(), Vec::new());
        assert!(matches!(validate_workflow(&wf, &delims()), Err(Error::Validation(_))));
    }

    #[test]
    fn test_empty_commands_and_lines() {
        let wf = workflow(vec![CommandGroup::new(0, Vec::new(), VarDefId(0))], vec![dir_var()]);
        assert!(validate_workflow(&wf, &delims()).is_err());

        let wf = workflow(
            vec![CommandGroup::new(0, vec![Command::subshell(vec![Command::line("  ")])], VarDefId(0))],
            vec![dir_var()],
        );
        let err = validate_workflow(&wf, &delims()).unwrap_err();
        assert!(err.to_string().contains("empty command line"));
    }

    #[test]
    fn test_unknown_variable() {
        let wf = workflow(
            vec![CommandGroup::new(0, vec![Command::line("run <<missing>>")], VarDefId(0))],
            vec![dir_var()],
        );
        assert!(matches!(
            validate_workflow(&wf, &delims()),
            Err(Error::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_unknown_parallel_mode() {
        let wf = workflow(
            vec![CommandGroup::new(0, vec![Command::parallel("solve", "mpi")], VarDefId(0))],
            vec![dir_var()],
        );
        let err = validate_workflow(&wf, &delims()).unwrap_err();
        assert!(err.to_string().contains("parallel mode 'mpi'"));
    }

    #[test]
    fn test_unknown_loop_group() {
        let wf = workflow(
            vec![CommandGroup::new(0, vec![Command::line("ls")], VarDefId(0))],
            vec![dir_var()],
        )
        .with_loop(LoopSpec {
            max_iterations: 2,
            groups: Some([3].into_iter().collect()),
        });
        assert!(validate_workflow(&wf, &delims()).is_err());
    }

    #[test]
    fn test_unknown_archive() {
        let wf = workflow(
            vec![CommandGroup::new(0, vec![Command::line("ls")], VarDefId(0)).with_archive(0)],
            vec![dir_var()],
        );
        let err = validate_workflow(&wf, &delims()).unwrap_err();
        assert!(err.to_string().contains("unknown archive"));
    }

    #[test]
    fn test_variable_order_dependencies_first() {
        let wf = workflow(
            Vec::new(),
            vec![
                VarDefinition::literal("c", "<<b>>"),
                VarDefinition::literal("b", "<<a>>"),
                VarDefinition::with_data("a", vec!["1".into()]),
            ],
        );
        assert_eq!(variable_order(&wf, &delims()).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_variable_cycle() {
        let wf = workflow(
            Vec::new(),
            vec![
                VarDefinition::literal("a", "<<b>>"),
                VarDefinition::literal("b", "<<a>>"),
                VarDefinition::literal("c", "fixed"),
            ],
        );
        match variable_order(&wf, &delims()) {
            Err(Error::CyclicVariables(names)) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_variable() {
        let wf = workflow(
            vec![CommandGroup::new(0, vec![Command::line("ls")], VarDefId(0))],
            vec![dir_var(), dir_var()],
        );
        assert!(validate_workflow(&wf, &delims()).is_err());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::UnknownParallelMode {
            group: 2,
            mode: "mpi".into(),
        };
        assert_eq!(err.to_string(), "Command group 2 uses unknown parallel mode 'mpi'");
    }
}
