//! Workflow Submission Engine
//!
//! The submission side of a project:
//! - Building workflows from definitions, running their pre-commands and
//!   the root archive
//! - Planning submissions: task multiplicities, scheduler groups, tasks for
//!   every iteration
//! - Writing the submit directory (jobscripts, placeholder working-dirs
//!   files, per-slot variable directories) and submitting the jobscripts
//!   with their dependency chain
//! - Cancelling and reporting on submitted workflows

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use rand::Rng;

use super::jobscript::{write_jobscript, JobScriptParams, JobScriptRenderer, SgeRenderer};
use super::runtime::Runtime;
use super::scheduler::{JobDependency, Scheduler, SgeScheduler};
use crate::archive::{ArchiveBackend, LocalBackend};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::monitoring::{format_stats, save_stats, workflow_stats, WorkflowStats};
use crate::project::Project;
use crate::store::{snapshot, transact, FileStore, Store};
use crate::workflow::model::{
    CommandGroupSubmission, CommandGroupSubmissionId, CommandGroupSubmissionIteration, JobId,
    Submission, SubmissionId, Task, TaskRange, Workflow, WorkflowId,
};
use crate::workflow::parser::{build_workflow, WorkflowDefinition};
use crate::workflow::planner::{GroupShape, Plan};
use crate::workflow::resolve::group_multiplicity;

/// Attempts at finding an unused alternate scratch directory name.
const ALT_SCRATCH_NAME_ATTEMPTS: usize = 10;

/// Scheduler slots one jobscript covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub first: usize,
    pub last: usize,
    pub step: usize,
}

/// Slots submitted for a command group.
///
/// The task range applies to the first scheduler group only; it is aligned
/// onto the group's slot grid (`1 + k * step_size`) and capped at
/// `max_num_tasks`. Later scheduler groups always run whole.
pub fn submitted_slots(
    range: &TaskRange,
    scheduler_group: usize,
    step_size: usize,
    max_num_tasks: usize,
) -> Result<SlotRange> {
    if scheduler_group > 0 {
        return Ok(SlotRange {
            first: 1,
            last: max_num_tasks,
            step: step_size,
        });
    }

    let k = (range.start - 1 + step_size - 1) / step_size;
    let first = 1 + k * step_size;
    let last = if range.is_unbounded() {
        max_num_tasks
    } else {
        (range.stop as usize).min(max_num_tasks)
    };
    if first > last {
        return Err(Error::InvalidTaskRange(format!(
            "no tasks between {} and {} (step {}, {} slot(s))",
            range.start, range.stop, step_size, max_num_tasks
        )));
    }
    Ok(SlotRange {
        first,
        last,
        step: step_size * range.step,
    })
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect()
}

/// Dependency of the next submitted job on the previous one.
fn dependency_on(
    previous: Option<(JobId, usize)>,
    scheduler_group: usize,
    first_of_iteration: bool,
    iteration: usize,
) -> Option<JobDependency> {
    let (job, previous_group) = previous?;
    if previous_group != scheduler_group || (first_of_iteration && iteration > 0) {
        Some(JobDependency::AfterAll(job))
    } else {
        Some(JobDependency::AfterArrayElement(job))
    }
}

/// Scheduler job ids recorded after submission.
#[derive(Debug, Clone, Copy)]
struct SubmittedJob {
    id: CommandGroupSubmissionId,
    iteration: usize,
    job: JobId,
    stats_job: Option<JobId>,
}

/// Workflow submission engine.
///
/// Owns the project layout and the collaborators every operation goes
/// through.
///
/// # Example
///
/// ```rust,no_run
/// use arrayflow::execution::Engine;
/// use arrayflow::workflow::parser::load_definition;
/// use arrayflow::workflow::model::TaskRange;
/// use arrayflow::Config;
///
/// fn main() -> arrayflow::Result<()> {
///     let engine = Engine::open("/data/analysis", &Config::default())?;
///     let definition = load_definition("/data/analysis/workflow.yml")?;
///     let workflow = engine.make_workflow(&definition)?;
///     engine.submit_workflow(workflow, TaskRange::default())?;
///     Ok(())
/// }
/// ```
pub struct Engine {
    project: Project,
    store: Arc<dyn Store>,
    scheduler: Arc<dyn Scheduler>,
    renderer: Arc<dyn JobScriptRenderer>,
    backend: Arc<dyn ArchiveBackend>,
}

impl Engine {
    /// Creates an engine with the SGE scheduler and renderer and the local
    /// archive backend.
    pub fn new(project: Project, store: Arc<dyn Store>) -> Self {
        let scheduler = SgeScheduler::new(project.config(), project.root());
        let backend = LocalBackend::new().with_exclude(project.config().data_dir_name.clone());
        Self {
            project,
            store,
            scheduler: Arc::new(scheduler),
            renderer: Arc::new(SgeRenderer::new()),
            backend: Arc::new(backend),
        }
    }

    /// Opens the project at `root` with its file store.
    pub fn open(root: impl Into<PathBuf>, config: &Config) -> Result<Self> {
        let project = Project::new(root, config);
        project.ensure_data_dir()?;
        let store = FileStore::open(project.store_dir())?;
        Ok(Self::new(project, Arc::new(store)))
    }

    pub fn set_scheduler(&mut self, scheduler: Arc<dyn Scheduler>) {
        self.scheduler = scheduler;
    }

    pub fn set_renderer(&mut self, renderer: Arc<dyn JobScriptRenderer>) {
        self.renderer = renderer;
    }

    pub fn set_backend(&mut self, backend: Arc<dyn ArchiveBackend>) {
        self.backend = backend;
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Runtime operations over the same collaborators.
    pub fn runtime(&self) -> Runtime<'_> {
        Runtime::new(
            self.store.as_ref(),
            &self.project,
            self.backend.as_ref(),
            self.scheduler.as_ref(),
        )
    }

    fn config(&self) -> &Config {
        self.project.config()
    }

    fn load(&self, context: &str) -> Result<crate::store::Database> {
        snapshot(self.store.as_ref(), &self.config().command_lock_retry(), context)
    }

    /// Builds a workflow, runs its pre-commands, stores it and copies it to
    /// the root archive.
    pub fn make_workflow(&self, definition: &WorkflowDefinition) -> Result<WorkflowId> {
        self.project.ensure_data_dir()?;
        let next = self.load("make")?.next_workflow_id();
        let built = build_workflow(
            definition,
            next,
            self.project.root(),
            self.config(),
            self.backend.as_ref(),
            Utc::now(),
        )?;

        for command in &definition.pre_commands {
            self.run_pre_command(command)?;
        }

        let id = transact(
            self.store.as_ref(),
            &self.config().command_lock_retry(),
            "make",
            |db| {
                let mut workflow = built.clone();
                workflow.id = db.next_workflow_id();
                let id = workflow.id;
                db.workflows.push(workflow);
                Ok(id)
            },
        )?;
        fs::create_dir_all(self.project.workflow_dir(id))?;
        info!("Created workflow {} in {}", id, self.project.root().display());

        if self.runtime().root_archive(id)? {
            info!("Workflow {} copied to its root archive", id);
        }
        Ok(id)
    }

    fn run_pre_command(&self, command: &str) -> Result<()> {
        info!("Running pre-command: {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.project.root())
            .output()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            if !stdout.trim().is_empty() {
                debug!("Pre-command output:\n{}", stdout);
            }
        } else {
            error!(
                "Pre-command '{}' failed with exit code: {:?}",
                command,
                output.status.code()
            );
            if !stderr.trim().is_empty() {
                error!("stderr:\n{}", stderr);
            }
        }
        Ok(())
    }

    /// Picks a name not yet used under any of the alternate scratch roots.
    fn alt_scratch_name(&self, roots: &[PathBuf]) -> Result<String> {
        for _ in 0..ALT_SCRATCH_NAME_ATTEMPTS {
            let name = random_hex(10);
            if roots.iter().all(|root| !root.join(&name).exists()) {
                return Ok(name);
            }
            debug!("Alternate scratch name {} is taken", name);
        }
        Err(Error::Validation(format!(
            "no free alternate scratch directory name after {} attempts",
            ALT_SCRATCH_NAME_ATTEMPTS
        )))
    }

    /// Plans, writes and submits a new submission of a workflow.
    pub fn submit_workflow(&self, workflow_id: WorkflowId, task_range: TaskRange) -> Result<SubmissionId> {
        let config = self.config();
        let db = self.load("submit")?;
        let workflow = db.workflow(workflow_id)?;

        let mut scratch_roots: Vec<PathBuf> = workflow
            .command_groups
            .iter()
            .filter_map(|g| g.alternate_scratch.clone())
            .collect();
        scratch_roots.dedup();
        let alt_scratch_dir_name = if scratch_roots.is_empty() {
            None
        } else {
            Some(self.alt_scratch_name(&scratch_roots)?)
        };

        let submission_id = transact(
            self.store.as_ref(),
            &config.command_lock_retry(),
            "submit",
            |db| self.plan_submission(db, workflow_id, &task_range, alt_scratch_dir_name.clone()),
        )?;
        info!("Workflow {}: planned submission {}", workflow_id, submission_id);

        let db = self.load("submit")?;
        let workflow = db.workflow(workflow_id)?;
        let submission = workflow
            .submission(submission_id)
            .ok_or_else(|| Error::NotFound(format!("submission {}", submission_id)))?;

        let scripts = self.write_submit_dir(workflow, submission)?;
        let (jobs, outcome) = self.submit_jobs(workflow, submission, &scripts);

        if !jobs.is_empty() {
            transact(
                self.store.as_ref(),
                &config.command_lock_retry(),
                "submit",
                |db| {
                    for job in &jobs {
                        let cgsi = db
                            .command_group_submission_mut(job.id)?
                            .iteration_mut(job.iteration)
                            .ok_or_else(|| Error::NotFound(format!("iteration {}", job.iteration)))?;
                        cgsi.scheduler_job_id = Some(job.job);
                        cgsi.stats_job_id = job.stats_job;
                    }
                    Ok(())
                },
            )?;
        }
        outcome?;

        info!(
            "Workflow {}: submission {} sent {} job(s) to the scheduler",
            workflow_id,
            submission_id,
            jobs.len()
        );
        Ok(submission_id)
    }

    /// Adds a submission to `db`: resolves what can be resolved, computes
    /// scheduler groups and creates tasks for every iteration.
    fn plan_submission(
        &self,
        db: &mut crate::store::Database,
        workflow_id: WorkflowId,
        task_range: &TaskRange,
        alt_scratch_dir_name: Option<String>,
    ) -> Result<SubmissionId> {
        let delims = &self.config().variable_delimiters;
        let workflow = db.workflow_mut(workflow_id)?;
        let submission_id = SubmissionId(workflow.submissions.len());

        let exec_orders: Vec<usize> = workflow.command_groups.iter().map(|g| g.exec_order).collect();
        let mut shapes = Vec::with_capacity(exec_orders.len());
        for &exec_order in &exec_orders {
            let multiplicity = group_multiplicity(workflow, exec_order, submission_id, 0, delims)?;
            let group = workflow
                .command_group(exec_order)
                .ok_or_else(|| Error::NotFound(format!("command group {}", exec_order)))?;
            shapes.push(GroupShape {
                exec_order,
                is_job_array: group.is_job_array,
                nesting: group.nesting,
                multiplicity,
                directory_var: workflow.var_definition(group.directory_var).name.clone(),
            });
        }
        let plan = Plan::build(&shapes)?;

        let loop_iterations: Vec<Vec<usize>> = exec_orders
            .iter()
            .map(|e| workflow.loop_spec.iterations_for(*e))
            .collect();
        let archived: Vec<bool> = workflow.command_groups.iter().map(|g| g.archive.is_some()).collect();

        let mut cg_subs = Vec::with_capacity(shapes.len());
        for (i, shape) in shapes.into_iter().enumerate() {
            let group = plan
                .group_of(shape.exec_order)
                .ok_or_else(|| Error::NotFound(format!("scheduler group of {}", shape.exec_order)))?;
            let output_count = group.output_count(shape.exec_order).unwrap_or(0);
            let step_size = group.step_size(shape.exec_order).unwrap_or(1);

            submitted_slots(task_range, group.order_id, step_size, group.max_num_tasks)?;

            cg_subs.push(CommandGroupSubmission {
                id: CommandGroupSubmissionId(0),
                command_group: shape.exec_order,
                task_range: *task_range,
                multiplicity: shape.multiplicity,
                output_count,
                scheduler_group: group.order_id,
                step_size,
                max_num_tasks: group.max_num_tasks,
                commands_written: false,
                iterations: loop_iterations[i]
                    .iter()
                    .map(|&iteration| CommandGroupSubmissionIteration {
                        iteration,
                        scheduler_job_id: None,
                        stats_job_id: None,
                        working_dirs_written: false,
                        tasks: (0..output_count).map(|t| Task::new(t, archived[i])).collect(),
                    })
                    .collect(),
            });
        }

        for cg_sub in &mut cg_subs {
            cg_sub.id = db.allocate_command_group_submission_id();
        }
        db.workflow_mut(workflow_id)?.submissions.push(Submission {
            id: submission_id,
            created: Utc::now(),
            alt_scratch_dir_name,
            command_group_submissions: cg_subs,
        });
        Ok(submission_id)
    }

    /// Writes jobscripts and placeholder files; returns the work and stats
    /// jobscript paths per command group submission.
    fn write_submit_dir(
        &self,
        workflow: &Workflow,
        submission: &Submission,
    ) -> Result<Vec<(PathBuf, Option<PathBuf>)>> {
        let config = self.config();
        let submit_dir = self.project.submit_dir(workflow.id, submission.id);
        fs::create_dir_all(&submit_dir)?;
        let relative_submit = submit_dir
            .strip_prefix(self.project.root())
            .unwrap_or(submit_dir.as_path())
            .display()
            .to_string();
        let generated = Utc::now();

        let mut scripts = Vec::with_capacity(submission.command_group_submissions.len());
        for cg_sub in &submission.command_group_submissions {
            let exec_order = cg_sub.command_group;
            let group = workflow
                .command_group(exec_order)
                .ok_or_else(|| Error::NotFound(format!("command group {}", exec_order)))?;

            for cgsi in &cg_sub.iterations {
                let placeholder = "\n".repeat(cg_sub.max_num_tasks);
                fs::write(
                    submit_dir.join(self.project.working_dirs_file_name(exec_order, cgsi.iteration)),
                    placeholder,
                )?;
                for task in &cgsi.tasks {
                    fs::create_dir_all(self.project.var_values_dir(
                        &submit_dir,
                        cg_sub.scheduler_group,
                        cgsi.iteration,
                        &cg_sub.slot_name(task.order_id),
                    ))?;
                }
            }

            let alt_scratch_dir = match (&group.alternate_scratch, &submission.alt_scratch_dir_name) {
                (Some(root), Some(name)) => Some(root.join(name)),
                _ => None,
            };
            if let Some(scratch) = &alt_scratch_dir {
                for dir in workflow.directory_values(group.directory_var, submission.id, 0) {
                    fs::create_dir_all(scratch.join(&dir.value))?;
                }
                debug!("Created alternate scratch {}", scratch.display());
            }

            let slots = submitted_slots(
                &cg_sub.task_range,
                cg_sub.scheduler_group,
                cg_sub.step_size,
                cg_sub.max_num_tasks,
            )?;
            let params = JobScriptParams {
                exec_order,
                command_group_submission: cg_sub.id,
                max_num_tasks: cg_sub.max_num_tasks,
                step_size: cg_sub.step_size,
                array_stride: slots.step,
                first_slot: slots.first,
                last_slot: slots.last,
                submit_dir: relative_submit.clone(),
                command_file: self.project.command_file_name(exec_order),
                working_dirs_file: self.project.working_dirs_file_template(exec_order),
                environment_setup: group.environment.clone(),
                scheduler_options: group.scheduler_options.clone(),
                job_name: group.job_name.clone(),
                output_dir: group.output_dir.clone(),
                error_dir: group.error_dir.clone(),
                archive_enabled: group.archive.is_some(),
                alt_scratch_exclude_file: alt_scratch_dir
                    .as_ref()
                    .map(|_| self.project.alt_scratch_exclude_file_template(exec_order)),
                alt_scratch_dir,
                executable: config.executable.clone(),
                task_id_env_var: config.task_id_env_var.clone(),
                iteration_env_var: config.iteration_env_var.clone(),
            };

            let script = submit_dir.join(self.project.jobscript_name(exec_order));
            write_jobscript(&script, &self.renderer.render(&params, generated))?;
            let stats_script = if group.stats {
                let path = submit_dir.join(self.project.stats_jobscript_name(exec_order));
                write_jobscript(&path, &self.renderer.render_stats(&params, generated))?;
                Some(path)
            } else {
                None
            };
            scripts.push((script, stats_script));
        }
        info!("Wrote {} jobscript(s) to {}", scripts.len(), submit_dir.display());
        Ok(scripts)
    }

    /// Submits every (command group, iteration) in iteration-major order.
    /// Jobs submitted before a failure are returned alongside it.
    fn submit_jobs(
        &self,
        workflow: &Workflow,
        submission: &Submission,
        scripts: &[(PathBuf, Option<PathBuf>)],
    ) -> (Vec<SubmittedJob>, Result<()>) {
        let mut jobs = Vec::new();
        let mut previous: Option<(JobId, usize)> = None;

        for iteration in 0..workflow.iterations.len().max(1) {
            let mut first_of_iteration = true;
            for (cg_sub, (script, stats_script)) in submission.command_group_submissions.iter().zip(scripts) {
                if cg_sub.iteration(iteration).is_none() {
                    continue;
                }
                let dependency =
                    dependency_on(previous, cg_sub.scheduler_group, first_of_iteration, iteration);
                first_of_iteration = false;

                let job = match self.scheduler.submit(script, dependency, iteration) {
                    Ok(job) => job,
                    Err(e) => return (jobs, Err(e)),
                };
                let stats_job = match stats_script {
                    Some(path) => {
                        match self
                            .scheduler
                            .submit(path, Some(JobDependency::AfterArrayElement(job)), iteration)
                        {
                            Ok(id) => Some(id),
                            Err(e) => {
                                jobs.push(SubmittedJob {
                                    id: cg_sub.id,
                                    iteration,
                                    job,
                                    stats_job: None,
                                });
                                return (jobs, Err(e));
                            }
                        }
                    }
                    None => None,
                };

                info!(
                    "Command group {} iteration {}: job {} ({:?})",
                    cg_sub.command_group, iteration, job, dependency
                );
                jobs.push(SubmittedJob {
                    id: cg_sub.id,
                    iteration,
                    job,
                    stats_job,
                });
                previous = Some((job, cg_sub.scheduler_group));
            }
        }
        (jobs, Ok(()))
    }

    /// Cancels every known job of a workflow.
    pub fn kill(&self, workflow_id: WorkflowId) -> Result<()> {
        let db = self.load("kill")?;
        let workflow = db.workflow(workflow_id)?;
        let job_ids: Vec<JobId> = workflow
            .submissions
            .iter()
            .flat_map(|s| &s.command_group_submissions)
            .flat_map(|c| &c.iterations)
            .flat_map(|i| i.scheduler_job_id.into_iter().chain(i.stats_job_id))
            .collect();

        if job_ids.is_empty() {
            warn!("Workflow {} has no submitted jobs", workflow_id);
        }
        self.scheduler.cancel(&job_ids)
    }

    /// Statistics of one workflow, or of all of them.
    pub fn stats(&self, workflow_id: Option<WorkflowId>) -> Result<Vec<WorkflowStats>> {
        let db = self.load("stats")?;
        match workflow_id {
            Some(id) => Ok(vec![workflow_stats(db.workflow(id)?)]),
            None => Ok(db.workflows.iter().map(workflow_stats).collect()),
        }
    }

    pub fn formatted_stats(&self, workflow_id: Option<WorkflowId>, show_task_end: bool) -> Result<String> {
        Ok(format_stats(&self.stats(workflow_id)?, show_task_end))
    }

    pub fn save_stats(&self, workflow_id: Option<WorkflowId>, path: impl AsRef<Path>) -> Result<()> {
        save_stats(&self.stats(workflow_id)?, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scheduler::testing::RecordingScheduler;
    use crate::store::MemoryStore;
    use crate::workflow::model::{Command, FileRegex, Nesting};
    use crate::workflow::parser::{CommandGroupDefinition, VariableDefinition};
    use tempfile::tempdir;

    fn engine(root: &Path) -> (Engine, Arc<RecordingScheduler>) {
        let project = Project::new(root, &Config::fast());
        let mut engine = Engine::new(project, Arc::new(MemoryStore::new()));
        let scheduler = Arc::new(RecordingScheduler::new());
        engine.set_scheduler(scheduler.clone());
        (engine, scheduler)
    }

    /// A job array over three directories followed by a single held job.
    fn two_stage_definition(root: &Path) -> WorkflowDefinition {
        for dir in ["run_1", "run_2", "run_3"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        let mut definition = WorkflowDefinition {
            command_groups: vec![
                CommandGroupDefinition::new(vec![Command::line("solve")]).with_directory("<<run>>"),
                CommandGroupDefinition::new(vec![Command::line("collect")])
                    .with_nesting(Nesting::Hold)
                    .with_job_array(false),
            ],
            ..Default::default()
        };
        definition.variables.insert(
            "run".into(),
            VariableDefinition {
                file_regex: Some(FileRegex {
                    pattern: "^run_\\d$".into(),
                    group: 0,
                    is_dir: true,
                    subset: None,
                    expected_multiplicity: None,
                }),
                ..Default::default()
            },
        );
        definition
    }

    #[test]
    fn test_submitted_slots() {
        let all = TaskRange::default();
        assert_eq!(
            submitted_slots(&all, 0, 2, 6).unwrap(),
            SlotRange { first: 1, last: 6, step: 2 }
        );

        let range = TaskRange::parse("2-5").unwrap();
        assert_eq!(
            submitted_slots(&range, 0, 2, 6).unwrap(),
            SlotRange { first: 3, last: 5, step: 2 }
        );
        assert_eq!(
            submitted_slots(&range, 1, 1, 4).unwrap(),
            SlotRange { first: 1, last: 4, step: 1 }
        );

        let stepped = TaskRange::parse("1-6:2").unwrap();
        assert_eq!(submitted_slots(&stepped, 0, 1, 6).unwrap().step, 2);

        let empty = TaskRange::parse("2-2").unwrap();
        assert!(matches!(
            submitted_slots(&empty, 0, 3, 6),
            Err(Error::InvalidTaskRange(_))
        ));
    }

    #[test]
    fn test_dependency_chaining() {
        assert_eq!(dependency_on(None, 0, true, 0), None);
        assert_eq!(
            dependency_on(Some((5, 0)), 0, false, 0),
            Some(JobDependency::AfterArrayElement(5))
        );
        assert_eq!(dependency_on(Some((5, 0)), 1, false, 0), Some(JobDependency::AfterAll(5)));
        assert_eq!(dependency_on(Some((5, 0)), 0, true, 1), Some(JobDependency::AfterAll(5)));
    }

    #[test]
    fn test_random_hex() {
        let name = random_hex(10);
        assert_eq!(name.len(), 10);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_submit_hold_group_waits_for_all() {
        let dir = tempdir().unwrap();
        let (engine, scheduler) = engine(dir.path());
        let workflow_id = engine.make_workflow(&two_stage_definition(dir.path())).unwrap();
        let submission_id = engine.submit_workflow(workflow_id, TaskRange::default()).unwrap();

        let db = engine.load("test").unwrap();
        let submission = db.workflows[0].submission(submission_id).unwrap();
        let first = &submission.command_group_submissions[0];
        let second = &submission.command_group_submissions[1];
        assert_eq!((first.scheduler_group, first.max_num_tasks), (0, 3));
        assert_eq!((second.scheduler_group, second.max_num_tasks), (1, 1));
        assert_eq!(first.iteration(0).unwrap().tasks.len(), 3);

        let submitted = scheduler.submissions();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].dependency, None);
        assert_eq!(submitted[1].dependency, Some(JobDependency::AfterAll(submitted[0].job_id)));
        assert_eq!(first.iteration(0).unwrap().scheduler_job_id, Some(submitted[0].job_id));
        assert_eq!(second.iteration(0).unwrap().scheduler_job_id, Some(submitted[1].job_id));

        let submit_dir = engine.project().submit_dir(workflow_id, submission_id);
        let script = fs::read_to_string(submit_dir.join("js_0.sh")).unwrap();
        assert!(script.contains("#$ -t 1-3:1"));
        assert_eq!(
            fs::read_to_string(submit_dir.join("working_dirs_0_0.txt")).unwrap(),
            "\n\n\n"
        );
        assert!(engine
            .project()
            .var_values_dir(&submit_dir, 0, 0, "3")
            .is_dir());
    }

    #[test]
    fn test_submit_then_run_tasks() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let workflow_id = engine.make_workflow(&two_stage_definition(dir.path())).unwrap();
        let submission_id = engine.submit_workflow(workflow_id, TaskRange::default()).unwrap();

        let db = engine.load("test").unwrap();
        let cg_sub_id = db.workflows[0].submissions[submission_id.0].command_group_submissions[0].id;
        let runtime = engine.runtime();
        for task in 0..3 {
            runtime.write_runtime_files(cg_sub_id, task, 0).unwrap();
        }

        let submit_dir = engine.project().submit_dir(workflow_id, submission_id);
        assert_eq!(
            fs::read_to_string(submit_dir.join("working_dirs_0_0.txt")).unwrap(),
            "run_1\nrun_2\nrun_3\n"
        );
        assert!(submit_dir.join("cmd_0.sh").is_file());
    }

    #[test]
    fn test_stepped_task_range_keeps_task_indices() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let mut definition = two_stage_definition(dir.path());
        for name in ["run_4", "run_5", "run_6"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        definition.command_groups = vec![
            CommandGroupDefinition::new(vec![Command::line("solve <<run>>")]).with_directory("<<run>>"),
        ];
        let workflow_id = engine.make_workflow(&definition).unwrap();
        let submission_id = engine
            .submit_workflow(workflow_id, TaskRange::parse("1-6:2").unwrap())
            .unwrap();

        let submit_dir = engine.project().submit_dir(workflow_id, submission_id);
        let script = fs::read_to_string(submit_dir.join("js_0.sh")).unwrap();
        assert!(script.contains("#$ -t 1-6:2"));
        assert!(script.contains("TASK_IDX=$((($SGE_TASK_ID - 1)/1))"));

        // slot 3 runs task 2
        let db = engine.load("test").unwrap();
        let cg_sub = &db.workflows[0].submissions[submission_id.0].command_group_submissions[0];
        assert_eq!(cg_sub.task_from_scheduler_id(3), Some(2));
        engine.runtime().write_runtime_files(cg_sub.id, 2, 0).unwrap();

        let var_dir = engine.project().var_values_dir(&submit_dir, 0, 0, "3");
        assert_eq!(
            fs::read_to_string(var_dir.join(engine.project().variable_file_name("run"))).unwrap(),
            "run_3\n"
        );
    }

    #[test]
    fn test_kill_cancels_all_jobs() {
        let dir = tempdir().unwrap();
        let (engine, scheduler) = engine(dir.path());
        let workflow_id = engine.make_workflow(&two_stage_definition(dir.path())).unwrap();
        engine.submit_workflow(workflow_id, TaskRange::default()).unwrap();

        engine.kill(workflow_id).unwrap();
        assert_eq!(*scheduler.cancelled.lock().unwrap(), vec![100, 101]);
    }

    #[test]
    fn test_make_workflow_runs_pre_commands() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let mut definition = two_stage_definition(dir.path());
        definition.pre_commands = vec!["mkdir -p results".to_string(), "exit 3".to_string()];

        let id = engine.make_workflow(&definition).unwrap();
        assert_eq!(id, WorkflowId(0));
        assert!(dir.path().join("results").is_dir());
        assert_eq!(engine.make_workflow(&definition).unwrap(), WorkflowId(1));
    }

    #[test]
    fn test_submit_unknown_workflow() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        assert!(matches!(
            engine.submit_workflow(WorkflowId(3), TaskRange::default()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_stats_table() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let workflow_id = engine.make_workflow(&two_stage_definition(dir.path())).unwrap();
        engine.submit_workflow(workflow_id, TaskRange::default()).unwrap();

        let stats = engine.stats(Some(workflow_id)).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].submissions.len(), 1);

        let path = dir.path().join("stats.json");
        engine.save_stats(None, &path).unwrap();
        assert!(path.is_file());
        assert!(!engine.formatted_stats(None, false).unwrap().is_empty());
    }
}
