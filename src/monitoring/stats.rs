//! Task Statistics
//!
//! Collects per-task timings, archive progress and scheduler accounting
//! for reporting, either as serialisable structs or as a text table.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::workflow::model::{
    CommandGroupSubmission, JobId, Submission, TaskArchiveStatus, Workflow, WorkflowId,
};

const DATETIME_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub iteration: usize,
    pub order_id: usize,
    pub scheduler_id: usize,
    pub working_directory: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration: Option<String>,
    pub archive_status: Option<TaskArchiveStatus>,
    pub archive_start_time: Option<String>,
    pub archive_end_time: Option<String>,
    pub archive_duration: Option<String>,
    pub archived_task: Option<usize>,
    pub memory: Option<String>,
    pub hostname: Option<String>,
    pub wallclock: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandGroupStats {
    pub command_group_submission_id: u64,
    pub exec_order: usize,
    pub commands: Vec<String>,
    pub scheduler_job_ids: Vec<JobId>,
    pub tasks: Vec<TaskStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionStats {
    pub submission_id: usize,
    pub created: String,
    pub command_group_submissions: Vec<CommandGroupStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub workflow_id: WorkflowId,
    pub created: String,
    pub submissions: Vec<SubmissionStats>,
}

fn format_time(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|t| t.format(DATETIME_FORMAT).to_string())
}

/// Formats a duration as `H:MM:SS`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn span(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<String> {
    match (start, end) {
        (Some(start), Some(end)) => Some(format_duration(end - start)),
        _ => None,
    }
}

fn command_group_stats(
    workflow: &Workflow,
    submission: &Submission,
    cg_sub: &CommandGroupSubmission,
) -> CommandGroupStats {
    let mut commands = Vec::new();
    if let Some(group) = workflow.command_group(cg_sub.command_group) {
        for command in &group.commands {
            command.for_each_line(&mut |line, _| commands.push(line.to_string()));
        }
    }

    let mut scheduler_job_ids = Vec::new();
    let mut tasks = Vec::new();
    for cgsi in &cg_sub.iterations {
        scheduler_job_ids.extend(cgsi.scheduler_job_id);
        for task in &cgsi.tasks {
            let working_directory = workflow
                .working_directory(submission.id, cg_sub, cgsi.iteration, task.order_id)
                .map(|v| v.value.clone());
            let archive_start = cgsi.archive_start_time(task.order_id);
            let archive_end = cgsi.archive_end_time(task.order_id);
            tasks.push(TaskStats {
                iteration: cgsi.iteration,
                order_id: task.order_id,
                scheduler_id: cg_sub.scheduler_task_id(task.order_id),
                working_directory,
                start_time: format_time(task.start_time),
                end_time: format_time(task.end_time),
                duration: task.duration().map(format_duration),
                archive_status: task.archive_status,
                archive_start_time: format_time(archive_start),
                archive_end_time: format_time(archive_end),
                archive_duration: span(archive_start, archive_end),
                archived_task: task.archived_task,
                memory: task.memory.clone(),
                hostname: task.hostname.clone(),
                wallclock: task.wallclock.clone(),
            });
        }
    }

    CommandGroupStats {
        command_group_submission_id: cg_sub.id.0,
        exec_order: cg_sub.command_group,
        commands,
        scheduler_job_ids,
        tasks,
    }
}

/// Statistics of every task of a workflow.
pub fn workflow_stats(workflow: &Workflow) -> WorkflowStats {
    let submissions = workflow
        .submissions
        .iter()
        .map(|submission| SubmissionStats {
            submission_id: submission.id.0,
            created: submission.created.format(DATETIME_FORMAT).to_string(),
            command_group_submissions: submission
                .command_group_submissions
                .iter()
                .map(|cg_sub| command_group_stats(workflow, submission, cg_sub))
                .collect(),
        })
        .collect();

    WorkflowStats {
        workflow_id: workflow.id,
        created: workflow.created.format(DATETIME_FORMAT).to_string(),
        submissions,
    }
}

fn archive_label(status: Option<TaskArchiveStatus>) -> &'static str {
    match status {
        None => "-",
        Some(TaskArchiveStatus::Pending) => "pending",
        Some(TaskArchiveStatus::Active) => "active",
        Some(TaskArchiveStatus::Complete) => "complete",
    }
}

/// Renders statistics as fixed-width tables, one per command group
/// submission.
pub fn format_stats(stats: &[WorkflowStats], show_task_end: bool) -> String {
    let mut out = String::new();

    for workflow in stats {
        let _ = writeln!(out, "Workflow ID: {}", workflow.workflow_id);
        for submission in &workflow.submissions {
            let _ = writeln!(out, "Submission ID: {}", submission.submission_id);
            for cg in &submission.command_group_submissions {
                let _ = writeln!(
                    out,
                    "Command group submission ID: {}",
                    cg.command_group_submission_id
                );
                out.push_str("Commands:\n");
                for command in &cg.commands {
                    let _ = writeln!(out, "\t{}", command);
                }

                let mut headers = vec!["It.", "#", "SID", "Dir.", "Start"];
                if show_task_end {
                    headers.push("End");
                }
                headers.extend(["Duration", "Archive", "memory", "hostname"]);

                let rows: Vec<Vec<String>> = cg
                    .tasks
                    .iter()
                    .map(|task| {
                        let mut row = vec![
                            task.iteration.to_string(),
                            task.order_id.to_string(),
                            task.scheduler_id.to_string(),
                            task.working_directory.clone().unwrap_or_else(|| "-".into()),
                            task.start_time.clone().unwrap_or_else(|| "pending".into()),
                        ];
                        if show_task_end {
                            row.push(task.end_time.clone().unwrap_or_else(|| "-".into()));
                        }
                        row.push(task.duration.clone().unwrap_or_else(|| "-".into()));
                        row.push(archive_label(task.archive_status).to_string());
                        row.push(task.memory.clone().unwrap_or_else(|| "-".into()));
                        row.push(task.hostname.clone().unwrap_or_else(|| "-".into()));
                        row
                    })
                    .collect();

                out.push_str(&render_table(&headers, &rows));
                out.push('\n');
            }
        }
    }
    out
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let line = |cells: Vec<&str>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = w))
            .collect();
        format!("| {} |\n", padded.join(" | "))
    };
    let rule: String = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut out = rule.clone();
    out.push_str(&line(headers.to_vec()));
    out.push_str(&rule);
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out.push_str(&rule);
    out
}

/// Writes statistics as pretty JSON.
pub fn save_stats(stats: &[WorkflowStats], path: impl AsRef<Path>) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(stats)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{
        Command, CommandGroup, CommandGroupSubmissionId, CommandGroupSubmissionIteration,
        SubmissionId, Task, TaskRange, VarDefId, VarDefinition,
    };
    use crate::workflow::Multiplicity;
    use tempfile::tempdir;

    fn workflow() -> Workflow {
        let mut workflow = Workflow::new(
            WorkflowId(0),
            "/work",
            vec![CommandGroup::new(0, vec![Command::line("solve <<x>>")], VarDefId(0))],
            vec![VarDefinition::literal("dir", ".")],
        );
        workflow.push_directory_values(VarDefId(0), SubmissionId(0), 0, &[".".to_string()]);

        let start = Utc::now();
        let mut done = Task::new(0, true);
        done.start_time = Some(start);
        done.end_time = Some(start + Duration::seconds(125));
        done.memory = Some("1.2G".to_string());
        done.archive_status = Some(TaskArchiveStatus::Complete);

        workflow.submissions.push(Submission {
            id: SubmissionId(0),
            created: start,
            alt_scratch_dir_name: None,
            command_group_submissions: vec![CommandGroupSubmission {
                id: CommandGroupSubmissionId(1),
                command_group: 0,
                task_range: TaskRange::default(),
                multiplicity: Multiplicity::Uniform(2),
                output_count: 2,
                scheduler_group: 0,
                step_size: 1,
                max_num_tasks: 2,
                commands_written: true,
                iterations: vec![CommandGroupSubmissionIteration {
                    iteration: 0,
                    scheduler_job_id: Some(77),
                    stats_job_id: None,
                    working_dirs_written: true,
                    tasks: vec![done, Task::new(1, true)],
                }],
            }],
        });
        workflow
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(125)), "0:02:05");
        assert_eq!(format_duration(Duration::seconds(3_661)), "1:01:01");
        assert_eq!(format_duration(Duration::seconds(-5)), "0:00:00");
    }

    #[test]
    fn test_workflow_stats() {
        let stats = workflow_stats(&workflow());
        let cg = &stats.submissions[0].command_group_submissions[0];

        assert_eq!(cg.commands, vec!["solve <<x>>"]);
        assert_eq!(cg.scheduler_job_ids, vec![77]);
        assert_eq!(cg.tasks.len(), 2);
        assert_eq!(cg.tasks[0].duration.as_deref(), Some("0:02:05"));
        assert_eq!(cg.tasks[0].scheduler_id, 1);
        assert_eq!(cg.tasks[1].scheduler_id, 2);
        assert_eq!(cg.tasks[0].working_directory.as_deref(), Some("."));
        assert!(cg.tasks[1].start_time.is_none());
    }

    #[test]
    fn test_format_stats_table() {
        let text = format_stats(&[workflow_stats(&workflow())], false);
        assert!(text.contains("Workflow ID: 0"));
        assert!(text.contains("Command group submission ID: 1"));
        assert!(text.contains("\tsolve <<x>>"));
        assert!(text.contains("| It. |"));
        assert!(text.contains("pending"));
        assert!(text.contains("complete"));
        assert!(text.contains("1.2G"));
        assert!(!text.contains("| End"));

        let with_end = format_stats(&[workflow_stats(&workflow())], true);
        assert!(with_end.contains("| End"));
    }

    #[test]
    fn test_save_stats_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        save_stats(&[workflow_stats(&workflow())], &path).unwrap();

        let loaded: Vec<WorkflowStats> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded[0].submissions[0].command_group_submissions[0].tasks.len(), 2);
    }
}
