//! Workflow Value Resolution
//!
//! Resolves the variables of one command group for one submission and
//! iteration, storing the results in the workflow's value table:
//! - The directory variable is resolved first, in the workflow root; each
//!   value becomes a directory anchor
//! - Every other variable of the group is resolved inside each anchor's
//!   directory and linked to that anchor
//!
//! Both steps are idempotent: values already present for a
//! `(definition, submission, iteration, directory)` tuple are never
//! resolved again.

use log::debug;

use super::model::{
    CommandGroupSubmission, SubmissionId, VarDefId, VarDefinition, VarValueId, Workflow,
};
use super::planner::{task_multiplicity, Multiplicity};
use super::variables::{coerce_same_length, declared_multiplicity, resolve_variable_values};
use crate::config::Delimiters;
use crate::error::{Error, Result};

/// Definitions named by `names` plus everything they depend on.
pub fn definition_closure<'a>(
    workflow: &'a Workflow,
    names: &[String],
    delims: &Delimiters,
) -> Result<Vec<&'a VarDefinition>> {
    let mut out: Vec<&VarDefinition> = Vec::new();
    let mut pending: Vec<String> = names.to_vec();

    while let Some(name) = pending.pop() {
        if out.iter().any(|d| d.name == name) {
            continue;
        }
        let (_, def) = workflow
            .var_definition_by_name(&name)
            .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
        pending.extend(def.dependencies(delims));
        out.push(def);
    }
    Ok(out)
}

/// Directory anchors of a command group, resolving them if needed.
pub fn resolve_directories(
    workflow: &mut Workflow,
    exec_order: usize,
    submission: SubmissionId,
    iteration: usize,
    delims: &Delimiters,
) -> Result<Vec<VarValueId>> {
    let dir_var = workflow
        .command_group(exec_order)
        .ok_or_else(|| Error::NotFound(format!("command group {}", exec_order)))?
        .directory_var;

    let existing: Vec<VarValueId> = workflow
        .directory_values(dir_var, submission, iteration)
        .iter()
        .map(|v| v.id)
        .collect();
    if !existing.is_empty() {
        return Ok(existing);
    }

    let name = workflow.var_definition(dir_var).name.clone();
    let values = {
        let defs = definition_closure(workflow, &[name.clone()], delims)?;
        let resolved = resolve_variable_values(&defs, &workflow.root, delims)?;
        resolved
            .get(&name)
            .map(|r| r.values.clone())
            .ok_or_else(|| Error::UnresolvedVariable(name.clone()))?
    };

    debug!(
        "Command group {} iteration {}: {} working director(ies)",
        exec_order,
        iteration,
        values.len()
    );
    Ok(workflow.push_directory_values(dir_var, submission, iteration, &values))
}

/// Resolves every variable of a command group under each of its working
/// directories.
///
/// Values that can be resolved are stored even when others cannot; the
/// first unresolvable variable is then reported as
/// [`Error::UnresolvedVariable`].
pub fn resolve_group_values(
    workflow: &mut Workflow,
    exec_order: usize,
    submission: SubmissionId,
    iteration: usize,
    delims: &Delimiters,
) -> Result<()> {
    let directories = resolve_directories(workflow, exec_order, submission, iteration, delims)?;
    let var_ids = workflow.command_group_variables(exec_order, delims)?;
    if var_ids.is_empty() {
        return Ok(());
    }

    let dir_var = workflow
        .command_group(exec_order)
        .ok_or_else(|| Error::NotFound(format!("command group {}", exec_order)))?
        .directory_var;
    let dir_name = workflow.var_definition(dir_var).name.clone();
    let mut unresolved: Option<String> = None;

    for directory in directories {
        let missing: Vec<VarDefId> = var_ids
            .iter()
            .copied()
            .filter(|id| {
                workflow
                    .values_under(*id, submission, iteration, directory)
                    .is_empty()
            })
            .collect();
        if missing.is_empty() {
            continue;
        }

        let dir_value = workflow.var_value(directory).value.clone();
        let found: Vec<(VarDefId, Option<Vec<String>>)> = {
            // The directory variable is visible to the others as a literal.
            let anchor = VarDefinition::literal(dir_name.clone(), dir_value.clone());
            let mut defs: Vec<&VarDefinition> =
                var_ids.iter().map(|id| workflow.var_definition(*id)).collect();
            defs.push(&anchor);

            let resolved = resolve_variable_values(&defs, &workflow.root.join(&dir_value), delims)?;
            missing
                .iter()
                .map(|id| {
                    let name = &workflow.var_definition(*id).name;
                    (*id, resolved.get(name).map(|r| r.values.clone()))
                })
                .collect()
        };

        for (id, values) in found {
            match values {
                Some(values) => workflow.push_var_values(id, submission, iteration, directory, &values),
                None => {
                    if unresolved.is_none() {
                        unresolved = Some(workflow.var_definition(id).name.clone());
                    }
                }
            }
        }
    }

    match unresolved {
        Some(name) => Err(Error::UnresolvedVariable(name)),
        None => Ok(()),
    }
}

/// Normalised variable rows of one working directory.
///
/// Every row holds one value per name; a command group runs its commands
/// once per row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRows {
    pub directory: VarValueId,
    pub names: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Rows for every working directory of a command group, from values that
/// are already stored.
pub fn group_rows(
    workflow: &Workflow,
    exec_order: usize,
    submission: SubmissionId,
    iteration: usize,
    delims: &Delimiters,
) -> Result<Vec<DirectoryRows>> {
    let group = workflow
        .command_group(exec_order)
        .ok_or_else(|| Error::NotFound(format!("command group {}", exec_order)))?;
    let dir_name = &workflow.var_definition(group.directory_var).name;
    let names = group.command_variable_names(delims);

    let directories = workflow.directory_values(group.directory_var, submission, iteration);
    if directories.is_empty() {
        return Err(Error::UnresolvedVariable(dir_name.clone()));
    }

    let mut out = Vec::with_capacity(directories.len());
    for directory in directories {
        let mut lists: Vec<Vec<String>> = Vec::with_capacity(names.len());
        for name in &names {
            if name == dir_name {
                lists.push(vec![directory.value.clone()]);
                continue;
            }
            let (id, _) = workflow
                .var_definition_by_name(name)
                .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
            let values: Vec<String> = workflow
                .values_under(id, submission, iteration, directory.id)
                .iter()
                .map(|v| v.value.clone())
                .collect();
            if values.is_empty() {
                return Err(Error::UnresolvedVariable(name.clone()));
            }
            lists.push(values);
        }

        let context = format!("command group {} directory '{}'", exec_order, directory.value);
        let lists = coerce_same_length(lists, &context)?;
        let len = lists.first().map_or(1, Vec::len);
        let rows = (0..len)
            .map(|i| lists.iter().map(|l| l[i].clone()).collect())
            .collect();

        out.push(DirectoryRows {
            directory: directory.id,
            names: names.clone(),
            rows,
        });
    }
    Ok(out)
}

/// Task multiplicity of a command group for one submission.
///
/// Per directory when the group's values can be resolved now; otherwise
/// the multiplicity declared by the definitions (data lengths, subsets,
/// expected multiplicities).
pub fn group_multiplicity(
    workflow: &mut Workflow,
    exec_order: usize,
    submission: SubmissionId,
    iteration: usize,
    delims: &Delimiters,
) -> Result<Multiplicity> {
    match resolve_group_values(workflow, exec_order, submission, iteration, delims) {
        Ok(()) => {
            let rows = group_rows(workflow, exec_order, submission, iteration, delims)?;
            return Ok(Multiplicity::PerDirectory(
                rows.iter().map(|d| d.rows.len()).collect(),
            ));
        }
        Err(e) if e.is_unresolved() => {
            debug!("Command group {}: {}; using declared multiplicity", exec_order, e);
        }
        Err(e) => return Err(e),
    }

    let is_job_array = workflow
        .command_group(exec_order)
        .map_or(true, |g| g.is_job_array);
    let mut counts = Vec::new();
    for id in workflow.multiplicity_variables(exec_order, delims)? {
        let def = workflow.var_definition(id);
        match declared_multiplicity(def, &workflow.var_definitions, delims)? {
            Some(count) => counts.push(count),
            None if is_job_array => return Err(Error::UnresolvedVariable(def.name.clone())),
            None => return Ok(Multiplicity::Uniform(1)),
        }
    }
    let context = format!("command group {}", exec_order);
    Ok(Multiplicity::Uniform(task_multiplicity(&counts, &context)?))
}

/// Rows assigned to one task.
///
/// Tasks are laid out over directories as in [`Workflow::task_directory`].
/// A job-array task takes one row of its directory; any other task takes
/// every row of its directory.
pub fn task_rows<'a>(
    workflow: &Workflow,
    rows: &'a [DirectoryRows],
    submission: SubmissionId,
    cg_sub: &CommandGroupSubmission,
    iteration: usize,
    order_id: usize,
) -> Result<&'a [Vec<String>]> {
    let is_job_array = workflow
        .command_group(cg_sub.command_group)
        .map_or(true, |g| g.is_job_array);
    let (directory, local) = workflow
        .task_directory(submission, cg_sub, iteration, order_id)
        .ok_or_else(|| Error::NotFound(format!("working directory of task {}", order_id)))?;
    let dir_rows = rows
        .iter()
        .find(|d| d.directory == directory.id)
        .ok_or_else(|| Error::NotFound(format!("rows of directory '{}'", directory.value)))?;

    if !is_job_array || dir_rows.rows.is_empty() {
        return Ok(&dir_rows.rows);
    }

    let row = local % dir_rows.rows.len();
    Ok(&dir_rows.rows[row..=row])
}
