//! Scheduler Interface
//!
//! Submission, cancellation and accounting through the batch scheduler's
//! command line tools. [`SgeScheduler`] drives `qsub`, `qdel` and `qacct`.

use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::workflow::model::JobId;

/// First integer in `qsub` output, e.g. `Your job-array 123.1-4:1 ("js_0.sh")`.
static JOB_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]+").expect("job id pattern is valid"));

/// `key   value` lines of `qacct` output.
static ACCOUNTING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^([A-Za-z_]+)\s+(.*?)\s*$").expect("accounting pattern is valid"));

/// How a job waits on the previously submitted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDependency {
    /// Wait for every element of the job (`-hold_jid`).
    AfterAll(JobId),
    /// Element *i* waits for element *i* (`-hold_jid_ad`).
    AfterArrayElement(JobId),
}

impl JobDependency {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::AfterAll(id) | Self::AfterArrayElement(id) => *id,
        }
    }
}

/// Accounting data of one finished task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub memory: Option<String>,
    pub hostname: Option<String>,
    pub wallclock: Option<String>,
}

pub trait Scheduler: Send + Sync {
    /// Submits `script`, passing the loop iteration to the job.
    fn submit(
        &self,
        script: &Path,
        dependency: Option<JobDependency>,
        iteration: usize,
    ) -> Result<JobId>;

    fn cancel(&self, job_ids: &[JobId]) -> Result<()>;

    fn scrape_stats(&self, job_id: JobId, task_id: usize) -> Result<SchedulerStats>;
}

/// Sun Grid Engine style command line tools.
#[derive(Debug, Clone)]
pub struct SgeScheduler {
    submit_command: String,
    cancel_command: String,
    accounting_command: String,
    iteration_env_var: String,
    working_dir: PathBuf,
}

impl SgeScheduler {
    /// Submits from `working_dir`, which jobscripts take as their root.
    pub fn new(config: &Config, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            submit_command: config.submit_command.clone(),
            cancel_command: config.cancel_command.clone(),
            accounting_command: config.accounting_command.clone(),
            iteration_env_var: config.iteration_env_var.clone(),
            working_dir: working_dir.into(),
        }
    }

    /// Arguments for the submit command.
    pub fn submit_args(
        &self,
        script: &Path,
        dependency: Option<JobDependency>,
        iteration: usize,
    ) -> Vec<String> {
        let mut args = vec!["-cwd".to_string()];
        match dependency {
            Some(JobDependency::AfterAll(id)) => {
                args.push("-hold_jid".to_string());
                args.push(id.to_string());
            }
            Some(JobDependency::AfterArrayElement(id)) => {
                args.push("-hold_jid_ad".to_string());
                args.push(id.to_string());
            }
            None => {}
        }
        args.push("-v".to_string());
        args.push(format!("{}={}", self.iteration_env_var, iteration));
        args.push(script.display().to_string());
        args
    }

    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| Error::Scheduler(format!("could not run {}: {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Scheduler(format!(
                "{} exited with {:?}: {}",
                program,
                output.status.code(),
                stderr.trim()
            )))
        }
    }
}

/// Extracts the job id from submit command output.
pub fn parse_job_id(output: &str) -> Result<JobId> {
    JOB_ID_PATTERN
        .find(output)
        .and_then(|m| m.as_str().parse::<JobId>().ok())
        .ok_or_else(|| {
            Error::Scheduler(format!(
                "could not find a job id in submit output: '{}'",
                output.trim()
            ))
        })
}

/// Reads memory, host and wallclock from accounting output.
pub fn parse_accounting(output: &str) -> SchedulerStats {
    let mut stats = SchedulerStats::default();
    for caps in ACCOUNTING_LINE.captures_iter(output) {
        let value = caps[2].to_string();
        match &caps[1] {
            "maxvmem" => stats.memory = Some(value),
            "hostname" => stats.hostname = Some(value),
            "ru_wallclock" => stats.wallclock = Some(value),
            _ => {}
        }
    }
    stats
}

impl Scheduler for SgeScheduler {
    fn submit(
        &self,
        script: &Path,
        dependency: Option<JobDependency>,
        iteration: usize,
    ) -> Result<JobId> {
        let args = self.submit_args(script, dependency, iteration);
        let output = self.run(&self.submit_command, &args)?;
        info!("{}", output.trim());
        let id = parse_job_id(&output)?;
        debug!("Submitted {} as job {}", script.display(), id);
        Ok(id)
    }

    fn cancel(&self, job_ids: &[JobId]) -> Result<()> {
        if job_ids.is_empty() {
            info!("No jobs to cancel");
            return Ok(());
        }
        let args: Vec<String> = job_ids.iter().map(|id| id.to_string()).collect();
        match self.run(&self.cancel_command, &args) {
            Ok(output) => {
                info!("{}", output.trim());
                Ok(())
            }
            Err(e) => {
                // jobs that already finished make the cancel command fail
                warn!("Cancel reported: {}", e);
                Ok(())
            }
        }
    }

    fn scrape_stats(&self, job_id: JobId, task_id: usize) -> Result<SchedulerStats> {
        let args = vec![
            "-j".to_string(),
            job_id.to_string(),
            "-t".to_string(),
            task_id.to_string(),
        ];
        let output = self.run(&self.accounting_command, &args)?;
        Ok(parse_accounting(&output))
    }
}
