//! Task Planning
//!
//! Computes how many tasks each command group fans out to and groups
//! consecutive command groups into scheduler groups:
//! - Output counts follow the nesting of each group
//! - A `Hold` starts a new scheduler group
//! - Inside a scheduler group every member gets a step size so that all
//!   members share one `1..=max_num_tasks` array declaration

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::model::Nesting;
use super::variables::common_length;
use crate::error::{Error, Result};

/// Tasks a command group contributes per working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    /// Same count in every directory; the directories are not known yet.
    Uniform(usize),
    /// Count for each resolved directory, in directory order.
    PerDirectory(Vec<usize>),
}

impl Multiplicity {
    /// Sum over all directories, when they are known.
    pub fn total(&self) -> Option<usize> {
        match self {
            Self::Uniform(_) => None,
            Self::PerDirectory(counts) => Some(counts.iter().sum()),
        }
    }

    /// The single per-directory count shared by every directory.
    pub fn uniform(&self, context: &str) -> Result<usize> {
        match self {
            Self::Uniform(count) => Ok(*count),
            Self::PerDirectory(counts) => {
                let mut unique = counts.clone();
                unique.dedup();
                match unique.as_slice() {
                    [] => Ok(1),
                    [count] => Ok(*count),
                    _ => Err(Error::mismatch(context, counts.clone())),
                }
            }
        }
    }
}

/// Per-directory task multiplicity from the value counts of a group's
/// variables in that directory.
pub fn task_multiplicity(value_counts: &[usize], context: &str) -> Result<usize> {
    common_length(value_counts, context)
}

/// What the planner needs to know about one command group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupShape {
    pub exec_order: usize,
    pub is_job_array: bool,
    pub nesting: Nesting,
    pub multiplicity: Multiplicity,
    /// Name of the directory variable, for error messages.
    pub directory_var: String,
}

/// Output count of every group, in exec order.
pub fn output_counts(shapes: &[GroupShape]) -> Result<Vec<usize>> {
    let mut counts: Vec<usize> = Vec::with_capacity(shapes.len());

    for shape in shapes {
        let previous = counts.last().copied();
        let context = format!("command group {}", shape.exec_order);

        let count = match shape.nesting {
            Nesting::Nest => {
                let previous = previous.unwrap_or(1);
                if shape.is_job_array {
                    previous * shape.multiplicity.uniform(&context)?
                } else {
                    previous
                }
            }
            Nesting::Hold | Nesting::None => {
                if shape.is_job_array {
                    shape
                        .multiplicity
                        .total()
                        .ok_or_else(|| Error::UnresolvedVariable(shape.directory_var.clone()))?
                } else {
                    1
                }
            }
        };

        if shape.nesting == Nesting::None {
            if let Some(previous) = previous {
                if previous != count {
                    warn!(
                        "Command group {} has {} task(s) but the previous group has {}",
                        shape.exec_order, count, previous
                    );
                }
            }
        }

        debug!("Command group {} output count: {}", shape.exec_order, count);
        counts.push(count);
    }

    Ok(counts)
}

/// Consecutive command groups sharing one scheduler array range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerGroup {
    pub order_id: usize,
    /// Exec orders of the members.
    pub members: Vec<usize>,
    pub output_counts: Vec<usize>,
    pub max_num_tasks: usize,
    pub step_sizes: Vec<usize>,
}

impl SchedulerGroup {
    fn position(&self, exec_order: usize) -> Option<usize> {
        self.members.iter().position(|m| *m == exec_order)
    }

    pub fn step_size(&self, exec_order: usize) -> Option<usize> {
        self.position(exec_order).map(|i| self.step_sizes[i])
    }

    pub fn output_count(&self, exec_order: usize) -> Option<usize> {
        self.position(exec_order).map(|i| self.output_counts[i])
    }

    pub fn contains(&self, exec_order: usize) -> bool {
        self.position(exec_order).is_some()
    }
}

/// Splits groups at every `Hold` and computes step sizes.
pub fn scheduler_groups(shapes: &[GroupShape], counts: &[usize]) -> Result<Vec<SchedulerGroup>> {
    let mut groups: Vec<SchedulerGroup> = Vec::new();

    for (shape, &count) in shapes.iter().zip(counts) {
        let starts_new = groups.is_empty() || shape.nesting == Nesting::Hold;
        if starts_new {
            groups.push(SchedulerGroup {
                order_id: groups.len(),
                members: Vec::new(),
                output_counts: Vec::new(),
                max_num_tasks: 0,
                step_sizes: Vec::new(),
            });
        }
        if let Some(group) = groups.last_mut() {
            group.members.push(shape.exec_order);
            group.output_counts.push(count);
        }
    }

    for group in &mut groups {
        group.max_num_tasks = group.output_counts.iter().copied().max().unwrap_or(0);
        group.step_sizes = group
            .output_counts
            .iter()
            .zip(&group.members)
            .map(|(&count, exec_order)| {
                if count == 0 || group.max_num_tasks % count != 0 {
                    return Err(Error::mismatch(
                        format!(
                            "scheduler group {} (command group {} has {} task(s), group maximum is {})",
                            group.order_id, exec_order, count, group.max_num_tasks
                        ),
                        group.output_counts.clone(),
                    ));
                }
                Ok(group.max_num_tasks / count)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Scheduler group {}: members {:?}, max tasks {}, steps {:?}",
            group.order_id, group.members, group.max_num_tasks, group.step_sizes
        );
    }

    Ok(groups)
}

/// Output counts plus the scheduler groups built from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub output_counts: Vec<usize>,
    pub scheduler_groups: Vec<SchedulerGroup>,
}

impl Plan {
    pub fn build(shapes: &[GroupShape]) -> Result<Self> {
        let output_counts = output_counts(shapes)?;
        let scheduler_groups = scheduler_groups(shapes, &output_counts)?;
        Ok(Self {
            output_counts,
            scheduler_groups,
        })
    }

    pub fn group_of(&self, exec_order: usize) -> Option<&SchedulerGroup> {
        self.scheduler_groups.iter().find(|g| g.contains(exec_order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(exec_order: usize, nesting: Nesting, is_job_array: bool, per_dir: Vec<usize>) -> GroupShape {
        GroupShape {
            exec_order,
            is_job_array,
            nesting,
            multiplicity: Multiplicity::PerDirectory(per_dir),
            directory_var: format!("dir{}", exec_order),
        }
    }

    #[test]
    fn test_hold_ignores_previous_count() {
        for previous in [1, 4, 9] {
            let shapes = vec![
                shape(0, Nesting::None, true, vec![1; previous]),
                shape(1, Nesting::Hold, true, vec![2, 2]),
            ];
            let counts = output_counts(&shapes).unwrap();
            assert_eq!(counts, vec![previous, 4]);
        }
    }

    #[test]
    fn test_nest_non_array_keeps_previous_count() {
        let shapes = vec![
            shape(0, Nesting::None, true, vec![3, 3]),
            shape(1, Nesting::Nest, false, vec![5]),
        ];
        assert_eq!(output_counts(&shapes).unwrap(), vec![6, 6]);
    }

    #[test]
    fn test_nest_array_scales_by_multiplicity() {
        let shapes = vec![
            shape(0, Nesting::None, true, vec![1, 1, 1]),
            GroupShape {
                multiplicity: Multiplicity::Uniform(2),
                ..shape(1, Nesting::Nest, true, vec![])
            },
        ];
        assert_eq!(output_counts(&shapes).unwrap(), vec![3, 6]);
    }

    #[test]
    fn test_nest_array_needs_uniform_multiplicity() {
        let shapes = vec![
            shape(0, Nesting::None, true, vec![1, 1]),
            shape(1, Nesting::Nest, true, vec![1, 2]),
        ];
        assert!(matches!(
            output_counts(&shapes),
            Err(Error::MultiplicityMismatch { .. })
        ));
    }

    #[test]
    fn test_non_array_contributes_one() {
        let shapes = vec![
            shape(0, Nesting::None, false, vec![4, 4]),
            shape(1, Nesting::Hold, false, vec![]),
        ];
        assert_eq!(output_counts(&shapes).unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_unknown_directories_fail() {
        let shapes = vec![GroupShape {
            multiplicity: Multiplicity::Uniform(1),
            ..shape(0, Nesting::None, true, vec![])
        }];
        assert!(output_counts(&shapes).unwrap_err().is_unresolved());
    }

    #[test]
    fn test_step_sizes_divide_max() {
        let shapes = vec![
            shape(0, Nesting::None, true, vec![1, 1, 1, 1]),
            shape(1, Nesting::Nest, false, vec![]),
            shape(2, Nesting::None, false, vec![]),
            shape(3, Nesting::Hold, true, vec![2]),
            shape(4, Nesting::None, true, vec![1]),
        ];
        let plan = Plan::build(&shapes).unwrap();
        assert_eq!(plan.output_counts, vec![4, 4, 1, 2, 1]);
        assert_eq!(plan.scheduler_groups.len(), 2);

        for group in &plan.scheduler_groups {
            for (step, count) in group.step_sizes.iter().zip(&group.output_counts) {
                assert_eq!(step * count, group.max_num_tasks);
            }
        }
        let first = &plan.scheduler_groups[0];
        assert_eq!(first.members, vec![0, 1, 2]);
        assert_eq!(first.step_sizes, vec![1, 1, 4]);
        assert_eq!(plan.group_of(4).unwrap().step_size(4), Some(2));
    }

    #[test]
    fn test_step_size_must_divide() {
        let shapes = vec![
            shape(0, Nesting::None, true, vec![2, 2]),
            shape(1, Nesting::None, true, vec![3]),
        ];
        assert!(matches!(
            Plan::build(&shapes),
            Err(Error::MultiplicityMismatch { .. })
        ));
    }

    #[test]
    fn test_task_multiplicity_rules() {
        assert_eq!(task_multiplicity(&[], "t").unwrap(), 1);
        assert_eq!(task_multiplicity(&[1, 5], "t").unwrap(), 5);
        assert!(task_multiplicity(&[2, 5], "t").is_err());
        assert!(task_multiplicity(&[1, 2, 5], "t").is_err());
    }

    #[test]
    fn test_multiplicity_totals() {
        assert_eq!(Multiplicity::PerDirectory(vec![2, 3]).total(), Some(5));
        assert_eq!(Multiplicity::Uniform(2).total(), None);
        assert_eq!(Multiplicity::PerDirectory(vec![2, 2]).uniform("t").unwrap(), 2);
    }
}
