//! Runtime Coordination
//!
//! Operations invoked by jobscripts while tasks run. Many processes, one per
//! scheduler array slot, call these concurrently; they coordinate only
//! through the store.
//!
//! - [`Runtime::write_runtime_files`]: command file (once per command group
//!   submission), working dirs file (once per iteration), alternate scratch
//!   exclusion list (once per task) under the command-writing lease, then
//!   the task's own variable files without any lock
//! - [`Runtime::set_task_start`] / [`Runtime::set_task_end`]: timestamps and
//!   iteration status
//! - [`Runtime::archive_task`] / [`Runtime::root_archive`]: archive copies
//! - [`Runtime::scrape_task_stats`]: scheduler accounting

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use chrono::Utc;
use log::{debug, info, warn};

use super::commands::{write_command_file, CommandFile};
use super::scheduler::Scheduler;
use crate::archive::{execute_with_lock, is_archive_required, ArchiveBackend, ArchiveRequest};
use crate::error::{Error, Result};
use crate::monitoring::host;
use crate::project::Project;
use crate::store::{acquire_lease_unless, snapshot, transact, Database, LeaseKey, RetryPolicy, Store};
use crate::workflow::model::{
    CommandGroup, CommandGroupSubmission, CommandGroupSubmissionId, IterationStatus, SubmissionId,
    Task, TaskArchiveStatus, Workflow, WorkflowId,
};
use crate::workflow::resolve::{group_rows, resolve_group_values, task_rows};

/// Where a command group submission lives.
#[derive(Debug, Clone)]
struct TaskContext {
    workflow: WorkflowId,
    submission: SubmissionId,
    exec_order: usize,
    submit_dir: PathBuf,
    alternate_scratch: bool,
}

fn task_mut(
    db: &mut Database,
    id: CommandGroupSubmissionId,
    task: usize,
    iteration: usize,
) -> Result<&mut Task> {
    db.command_group_submission_mut(id)?
        .iteration_mut(iteration)
        .ok_or_else(|| {
            Error::NotFound(format!(
                "iteration {} of command group submission {}",
                iteration, id
            ))
        })?
        .tasks
        .get_mut(task)
        .ok_or_else(|| Error::NotFound(format!("task {} of command group submission {}", task, id)))
}

fn command_group_of<'a>(workflow: &'a Workflow, cg_sub: &CommandGroupSubmission) -> Result<&'a CommandGroup> {
    workflow
        .command_group(cg_sub.command_group)
        .ok_or_else(|| Error::NotFound(format!("command group {}", cg_sub.command_group)))
}

/// `path` relative to `dir` when it lies inside it (`.` contains everything).
fn relative_inside(path: &Path, dir: &Path) -> Option<PathBuf> {
    if dir.as_os_str().is_empty() || dir == Path::new(".") {
        return Some(path.to_path_buf());
    }
    path.strip_prefix(dir)
        .ok()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// One line per scheduler slot: the working directory of the task running
/// in that slot, or an empty line for slots this group skips.
pub fn working_dirs_content(
    workflow: &Workflow,
    submission: SubmissionId,
    cg_sub: &CommandGroupSubmission,
    iteration: usize,
) -> Result<String> {
    let mut out = String::new();
    for slot in 1..=cg_sub.max_num_tasks {
        if let Some(task) = cg_sub.task_from_scheduler_id(slot) {
            let dir = workflow
                .working_directory(submission, cg_sub, iteration, task)
                .ok_or_else(|| Error::NotFound(format!("working directory of task {}", task)))?;
            out.push_str(&dir.value);
        }
        out.push('\n');
    }
    Ok(out)
}

/// Runtime operations over one project.
pub struct Runtime<'a> {
    store: &'a dyn Store,
    project: &'a Project,
    backend: &'a dyn ArchiveBackend,
    scheduler: &'a dyn Scheduler,
}

impl<'a> Runtime<'a> {
    pub fn new(
        store: &'a dyn Store,
        project: &'a Project,
        backend: &'a dyn ArchiveBackend,
        scheduler: &'a dyn Scheduler,
    ) -> Self {
        Self {
            store,
            project,
            backend,
            scheduler,
        }
    }

    fn retry(&self) -> RetryPolicy {
        self.project.config().command_lock_retry()
    }

    fn load(&self, context: &str) -> Result<Database> {
        snapshot(self.store, &self.retry(), context)
    }

    fn context(&self, db: &Database, id: CommandGroupSubmissionId) -> Result<TaskContext> {
        let (workflow, submission, cg_sub) = db.command_group_submission(id)?;
        let group = command_group_of(workflow, cg_sub)?;
        Ok(TaskContext {
            workflow: workflow.id,
            submission: submission.id,
            exec_order: cg_sub.command_group,
            submit_dir: self.project.submit_dir(workflow.id, submission.id),
            alternate_scratch: group.alternate_scratch.is_some(),
        })
    }

    /// Writes everything a task needs before its commands run.
    pub fn write_runtime_files(
        &self,
        id: CommandGroupSubmissionId,
        task: usize,
        iteration: usize,
    ) -> Result<()> {
        let ctx = self.context(&self.load("write-runtime-files")?, id)?;
        self.resolve_values(&ctx, iteration)?;

        let exclude_path = ctx.alternate_scratch.then(|| {
            ctx.submit_dir
                .join(self.project.alt_scratch_exclude_file_name(ctx.exec_order, task))
        });

        let guard = acquire_lease_unless(
            self.store,
            LeaseKey::CommandWriting(id),
            &self.retry(),
            "write-runtime-files",
            || {
                let db = self.load("write-runtime-files")?;
                let (_, _, cg_sub) = db.command_group_submission(id)?;
                let dirs_written = cg_sub
                    .iteration(iteration)
                    .map_or(false, |i| i.working_dirs_written);
                let excluded = exclude_path.as_ref().map_or(true, |p| p.is_file());
                Ok(cg_sub.commands_written && dirs_written && excluded)
            },
        )?;

        match guard {
            Some(guard) => {
                self.write_locked_files(id, &ctx, task, iteration, exclude_path.as_deref())?;
                guard.release()?;
            }
            None => debug!(
                "Command group submission {}: shared runtime files already written",
                id
            ),
        }

        self.write_variable_files(id, &ctx, task, iteration)
    }

    /// Resolves (and stores) the group's values for this iteration unless
    /// they are already present.
    fn resolve_values(&self, ctx: &TaskContext, iteration: usize) -> Result<()> {
        let delims = &self.project.config().variable_delimiters;
        let db = self.load("resolve-values")?;
        let mut probe = db.workflow(ctx.workflow)?.clone();
        let before = probe.var_values.len();
        resolve_group_values(&mut probe, ctx.exec_order, ctx.submission, iteration, delims)?;
        if probe.var_values.len() == before {
            return Ok(());
        }

        transact(self.store, &self.retry(), "resolve-values", |db| {
            let workflow = db.workflow_mut(ctx.workflow)?;
            resolve_group_values(workflow, ctx.exec_order, ctx.submission, iteration, delims)
        })?;
        info!(
            "Resolved values of command group {} for iteration {}",
            ctx.exec_order, iteration
        );
        Ok(())
    }

    fn write_locked_files(
        &self,
        id: CommandGroupSubmissionId,
        ctx: &TaskContext,
        task: usize,
        iteration: usize,
        exclude_path: Option<&Path>,
    ) -> Result<()> {
        let config = self.project.config();
        let db = self.load("write-runtime-files")?;
        let (workflow, _, cg_sub) = db.command_group_submission(id)?;
        let group = command_group_of(workflow, cg_sub)?;
        let dirs_written = cg_sub
            .iteration(iteration)
            .map_or(false, |i| i.working_dirs_written);

        if !cg_sub.commands_written {
            let names = group.command_variable_names(&config.variable_delimiters);
            let content = CommandFile {
                group,
                parallel_modes: &workflow.parallel_modes,
                variable_names: &names,
                scheduler_group: cg_sub.scheduler_group,
                max_num_tasks: cg_sub.max_num_tasks,
            }
            .render(config, Utc::now())?;
            let path = ctx
                .submit_dir
                .join(self.project.command_file_name(ctx.exec_order));
            write_command_file(&path, &content)?;
            info!("Wrote command file {}", path.display());
        }

        if !dirs_written {
            let content = working_dirs_content(workflow, ctx.submission, cg_sub, iteration)?;
            let path = ctx
                .submit_dir
                .join(self.project.working_dirs_file_name(ctx.exec_order, iteration));
            fs::write(&path, content)?;
            info!("Wrote working directories {}", path.display());
        }

        if let Some(path) = exclude_path {
            if !path.is_file() {
                let dir = workflow
                    .working_directory(ctx.submission, cg_sub, iteration, task)
                    .ok_or_else(|| Error::NotFound(format!("working directory of task {}", task)))?;
                let list = self.exclusion_list(workflow, group, &dir.value);
                fs::write(path, list.join("\n") + "\n")?;
                debug!("Wrote alternate scratch exclusions {}", path.display());
            }
        }

        if !cg_sub.commands_written || !dirs_written {
            transact(self.store, &self.retry(), "write-runtime-files", |db| {
                let cg_sub = db.command_group_submission_mut(id)?;
                cg_sub.commands_written = true;
                let cgsi = cg_sub.iteration_mut(iteration).ok_or_else(|| {
                    Error::NotFound(format!("iteration {} of command group submission {}", iteration, id))
                })?;
                cgsi.working_dirs_written = true;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Paths inside a working directory that must not come back from the
    /// alternate scratch: the project data directory and the scheduler
    /// output and error directories.
    fn exclusion_list(&self, workflow: &Workflow, group: &CommandGroup, dir_value: &str) -> Vec<String> {
        let mut candidates = vec![PathBuf::from(&self.project.config().data_dir_name)];
        candidates.extend(group.output_dir.iter().map(PathBuf::from));
        candidates.extend(group.error_dir.iter().map(PathBuf::from));

        let dir = Path::new(dir_value);
        candidates
            .iter()
            .map(|c| c.strip_prefix(&workflow.root).unwrap_or(c.as_path()))
            .filter_map(|c| relative_inside(c, dir))
            .map(|p| format!("/{}", p.display()))
            .collect()
    }

    fn write_variable_files(
        &self,
        id: CommandGroupSubmissionId,
        ctx: &TaskContext,
        task: usize,
        iteration: usize,
    ) -> Result<()> {
        let delims = &self.project.config().variable_delimiters;
        let db = self.load("write-variable-files")?;
        let (workflow, _, cg_sub) = db.command_group_submission(id)?;

        let rows = group_rows(workflow, ctx.exec_order, ctx.submission, iteration, delims)?;
        let names = match rows.first() {
            Some(first) if !first.names.is_empty() => first.names.clone(),
            _ => return Ok(()),
        };
        let own = task_rows(workflow, &rows, ctx.submission, cg_sub, iteration, task)?;

        let dir = self.project.var_values_dir(
            &ctx.submit_dir,
            cg_sub.scheduler_group,
            iteration,
            &cg_sub.slot_name(task),
        );
        fs::create_dir_all(&dir)?;
        for (idx, name) in names.iter().enumerate() {
            let mut content = String::new();
            for row in own {
                content.push_str(&row[idx]);
                content.push('\n');
            }
            fs::write(dir.join(self.project.variable_file_name(name)), content)?;
        }
        debug!(
            "Task {} iteration {}: wrote {} variable file(s) to {}",
            task,
            iteration,
            names.len(),
            dir.display()
        );
        Ok(())
    }

    /// Records the task's start time and host; the iteration becomes active.
    pub fn set_task_start(&self, id: CommandGroupSubmissionId, task: usize, iteration: usize) -> Result<()> {
        let now = Utc::now();
        let hostname = host::hostname();

        transact(self.store, &self.retry(), "set-task-start", |db| {
            let loc = db.locate(id)?;
            let record = task_mut(db, id, task, iteration)?;
            record.start_time = Some(now);
            if hostname.is_some() {
                record.hostname = hostname.clone();
            }

            let workflow = db.workflow_mut(loc.workflow)?;
            if let Some(iter) = workflow.iterations.get_mut(iteration) {
                if iter.status == IterationStatus::Pending {
                    iter.status = IterationStatus::Active;
                }
            }
            Ok(())
        })?;

        info!(
            "{} Command group submission {}: task {} (iteration {}) started",
            now, id, task, iteration
        );
        Ok(())
    }

    /// Records the task's end time; the iteration completes once every task
    /// of the submission in that iteration has ended.
    pub fn set_task_end(&self, id: CommandGroupSubmissionId, task: usize, iteration: usize) -> Result<()> {
        let now = Utc::now();

        let completed = transact(self.store, &self.retry(), "set-task-end", |db| {
            let loc = db.locate(id)?;
            task_mut(db, id, task, iteration)?.end_time = Some(now);

            let workflow = db.workflow_mut(loc.workflow)?;
            let all_ended = workflow.submissions[loc.submission.0]
                .command_group_submissions
                .iter()
                .filter_map(|c| c.iteration(iteration))
                .all(|i| i.all_ended());
            if !all_ended {
                return Ok(false);
            }
            if let Some(iter) = workflow.iterations.get_mut(iteration) {
                iter.status = IterationStatus::Complete;
            }
            Ok(true)
        })?;

        info!(
            "{} Command group submission {}: task {} (iteration {}) ended",
            now, id, task, iteration
        );
        if completed {
            info!("Iteration {} complete", iteration);
        }
        Ok(())
    }

    /// Archives the task's working directory unless a sibling sharing it
    /// has already started an archive that covers this task's output.
    pub fn archive_task(&self, id: CommandGroupSubmissionId, task: usize, iteration: usize) -> Result<()> {
        let config = self.project.config();
        let delay = config.archive_start_delay();
        if !delay.is_zero() {
            debug!("Waiting {} ms before archiving", delay.as_millis());
            thread::sleep(delay);
        }

        let db = self.load("archive")?;
        let (workflow, submission, cg_sub) = db.command_group_submission(id)?;
        let group = command_group_of(workflow, cg_sub)?;
        let Some(archive_idx) = group.archive else {
            info!("Command group {} has no archive", group.exec_order);
            return Ok(());
        };
        let archive = workflow
            .archives
            .get(archive_idx)
            .ok_or_else(|| Error::NotFound(format!("archive {}", archive_idx)))?;
        let cgsi = cg_sub.iteration(iteration).ok_or_else(|| {
            Error::NotFound(format!("iteration {} of command group submission {}", iteration, id))
        })?;
        let directory = workflow
            .working_directory(submission.id, cg_sub, iteration, task)
            .ok_or_else(|| Error::NotFound(format!("working directory of task {}", task)))?;

        let siblings: Vec<usize> = cgsi
            .tasks
            .iter()
            .map(|t| t.order_id)
            .filter(|t| {
                *t != task
                    && workflow
                        .working_directory(submission.id, cg_sub, iteration, *t)
                        .map_or(false, |d| d.id == directory.id)
            })
            .collect();

        let request = ArchiveRequest {
            key: LeaseKey::ArchiveDirectory {
                workflow: workflow.id,
                archive: archive_idx,
                directory: directory.id,
            },
            source: workflow.root.join(&directory.value),
            destination: archive.destination().join(&directory.value),
            excludes: group.archive_excludes.clone(),
        };

        let started = Utc::now();
        let covered_by = transact(self.store, &self.retry(), "archive", |db| {
            let cgsi = db
                .command_group_submission_mut(id)?
                .iteration_mut(iteration)
                .ok_or_else(|| Error::NotFound(format!("iteration {}", iteration)))?;
            let covered = is_archive_required(cgsi, task, &siblings)?;
            let record = cgsi
                .tasks
                .get_mut(task)
                .ok_or_else(|| Error::NotFound(format!("task {}", task)))?;
            match covered {
                Some(other) => {
                    record.archived_task = Some(other);
                    record.archive_status = Some(TaskArchiveStatus::Complete);
                }
                None => {
                    record.archive_status = Some(TaskArchiveStatus::Active);
                    record.archive_start_time = Some(started);
                }
            }
            Ok(covered)
        })?;

        if let Some(other) = covered_by {
            info!(
                "Task {} archive not required: task {} archive started after it ended",
                task, other
            );
            return Ok(());
        }

        let copied = execute_with_lock(self.store, self.backend, &config.archive_lock_retry(), &request)?;
        let finished = Utc::now();
        transact(self.store, &self.retry(), "archive", |db| {
            let record = task_mut(db, id, task, iteration)?;
            if copied {
                record.archive_end_time = Some(finished);
                record.archive_status = Some(TaskArchiveStatus::Complete);
            } else {
                // siblings must not skip their own archive on account of a failed one
                record.archive_start_time = None;
                record.archive_status = Some(TaskArchiveStatus::Pending);
            }
            Ok(())
        })?;

        if !copied {
            warn!("Task {} archive failed; see previous errors", task);
        }
        Ok(())
    }

    /// Copies the whole workflow directory to the root archive, if any.
    pub fn root_archive(&self, workflow_id: WorkflowId) -> Result<bool> {
        let config = self.project.config();
        let db = self.load("root-archive")?;
        let workflow = db.workflow(workflow_id)?;
        let Some(archive_idx) = workflow.root_archive else {
            debug!("Workflow {} has no root archive", workflow_id);
            return Ok(false);
        };
        let archive = workflow
            .archives
            .get(archive_idx)
            .ok_or_else(|| Error::NotFound(format!("archive {}", archive_idx)))?;

        let mut excludes = workflow.root_archive_excludes.clone();
        excludes.push(config.data_dir_name.clone());
        let request = ArchiveRequest {
            key: LeaseKey::RootArchive {
                workflow: workflow_id,
                archive: archive_idx,
            },
            source: workflow.root.clone(),
            destination: archive.destination(),
            excludes,
        };
        execute_with_lock(self.store, self.backend, &config.archive_lock_retry(), &request)
    }

    /// Stores scheduler accounting for a finished task.
    pub fn scrape_task_stats(&self, id: CommandGroupSubmissionId, task: usize, iteration: usize) -> Result<()> {
        let db = self.load("scrape-stats")?;
        let (_, _, cg_sub) = db.command_group_submission(id)?;
        let job_id = cg_sub
            .iteration(iteration)
            .and_then(|i| i.scheduler_job_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "scheduler job of command group submission {} iteration {}",
                    id, iteration
                ))
            })?;
        let stats = self
            .scheduler
            .scrape_stats(job_id, cg_sub.scheduler_task_id(task))?;

        transact(self.store, &self.retry(), "scrape-stats", |db| {
            let record = task_mut(db, id, task, iteration)?;
            if stats.memory.is_some() {
                record.memory = stats.memory.clone();
            }
            if stats.hostname.is_some() {
                record.hostname = stats.hostname.clone();
            }
            if stats.wallclock.is_some() {
                record.wallclock = stats.wallclock.clone();
            }
            Ok(())
        })?;
        debug!("Task {} stats: {:?}", task, stats);
        Ok(())
    }
}
