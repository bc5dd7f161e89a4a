//! Jobscript Rendering
//!
//! The engine only computes [`JobScriptParams`]; a [`JobScriptRenderer`]
//! turns them into a script for one scheduler dialect. [`SgeRenderer`]
//! targets Sun Grid Engine style `#$` directives.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::Result;
use crate::workflow::model::CommandGroupSubmissionId;

/// Everything a jobscript needs to know about one command group submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScriptParams {
    pub exec_order: usize,
    pub command_group_submission: CommandGroupSubmissionId,
    pub max_num_tasks: usize,
    /// Slots per task; maps `$SGE_TASK_ID` back to a task index.
    pub step_size: usize,
    /// Stride of the submitted array, a multiple of `step_size`.
    pub array_stride: usize,
    /// First and last scheduler slot submitted (1-based, inclusive).
    pub first_slot: usize,
    pub last_slot: usize,
    /// Submit directory relative to the workflow root.
    pub submit_dir: String,
    pub command_file: String,
    /// Working dirs file name with the iteration index left as `{}`.
    pub working_dirs_file: String,
    pub environment_setup: Vec<String>,
    pub scheduler_options: BTreeMap<String, String>,
    pub job_name: Option<String>,
    pub output_dir: Option<String>,
    pub error_dir: Option<String>,
    pub archive_enabled: bool,
    /// Alternate scratch root for this submission, if any.
    pub alt_scratch_dir: Option<PathBuf>,
    /// Exclusion list name with the task index left as `{}`.
    pub alt_scratch_exclude_file: Option<String>,
    pub executable: String,
    pub task_id_env_var: String,
    pub iteration_env_var: String,
}

impl JobScriptParams {
    fn runtime_call(&self, subcommand: &str) -> String {
        format!(
            "{} {} -d $ROOT_DIR {} $TASK_IDX ${} >> $LOG_PATH 2>&1",
            self.executable,
            subcommand,
            self.command_group_submission,
            self.iteration_env_var
        )
    }
}

pub trait JobScriptRenderer: Send + Sync {
    /// Script running the commands of one command group.
    fn render(&self, params: &JobScriptParams, generated: DateTime<Utc>) -> String;

    /// Script collecting scheduler statistics for the tasks of `params`.
    fn render_stats(&self, params: &JobScriptParams, generated: DateTime<Utc>) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct SgeRenderer;

impl SgeRenderer {
    pub fn new() -> Self {
        Self
    }

    fn header(&self, params: &JobScriptParams, generated: DateTime<Utc>, what: &str) -> Vec<String> {
        vec![
            "#!/bin/bash --login".to_string(),
            String::new(),
            format!(
                "# --- {} generated by `{}` (version: {}) on {} ---",
                what,
                params.executable,
                crate::VERSION,
                generated.format("%Y.%m.%d at %H:%M:%S")
            ),
            String::new(),
        ]
    }

    fn array_directive(&self, params: &JobScriptParams) -> String {
        format!(
            "#$ -t {}-{}:{}",
            params.first_slot, params.last_slot, params.array_stride
        )
    }

    fn define_dirs(&self, params: &JobScriptParams, log_prefix: &str) -> Vec<String> {
        vec![
            "ROOT_DIR=`pwd`".to_string(),
            format!("SUBMIT_DIR=$ROOT_DIR/{}", params.submit_dir),
            format!(
                "LOG_PATH=$SUBMIT_DIR/{}_{}.${}",
                log_prefix, params.exec_order, params.task_id_env_var
            ),
            format!(
                "TASK_IDX=$(((${} - 1)/{}))",
                params.task_id_env_var, params.step_size
            ),
            format!(
                "{iter}=${{{iter}:-0}}",
                iter = params.iteration_env_var
            ),
        ]
    }
}

impl JobScriptRenderer for SgeRenderer {
    fn render(&self, params: &JobScriptParams, generated: DateTime<Utc>) -> String {
        let mut lines = self.header(params, generated, "jobscript");

        if let Some(name) = &params.job_name {
            lines.push(format!("#$ -N {}", name));
        }
        if let Some(dir) = &params.output_dir {
            lines.push(format!("#$ -o {}", dir));
        }
        if let Some(dir) = &params.error_dir {
            lines.push(format!("#$ -e {}", dir));
        }
        for (key, value) in &params.scheduler_options {
            lines.push(format!("#$ -{} {}", key, value).trim_end().to_string());
        }
        lines.push(String::new());
        lines.push(self.array_directive(params));
        lines.push(String::new());

        lines.extend(self.define_dirs(params, "log"));
        lines.push(String::new());
        lines.push(params.runtime_call("write-runtime-files"));
        lines.push(String::new());

        let wk_dirs = params
            .working_dirs_file
            .replace("{}", &format!("${{{}}}", params.iteration_env_var));
        lines.push(format!(
            "INPUTS_DIR_REL=`sed -n \"${{{}}}p\" $SUBMIT_DIR/{}`",
            params.task_id_env_var, wk_dirs
        ));
        lines.push("INPUTS_DIR=$ROOT_DIR/$INPUTS_DIR_REL".to_string());
        match &params.alt_scratch_dir {
            Some(dir) => lines.push(format!("INPUTS_DIR_SCRATCH={}/$INPUTS_DIR_REL", dir.display())),
            None => lines.push("INPUTS_DIR_SCRATCH=$INPUTS_DIR".to_string()),
        }
        lines.push(String::new());

        lines.push("touch $LOG_PATH".to_string());
        for var in [
            "ROOT_DIR",
            "SUBMIT_DIR",
            params.task_id_env_var.as_str(),
            "TASK_IDX",
            params.iteration_env_var.as_str(),
            "INPUTS_DIR",
            "INPUTS_DIR_SCRATCH",
        ] {
            lines.push(format!(
                "printf \"{0}:\\t ${{{0}}}\\n\" >> $LOG_PATH 2>&1",
                var
            ));
        }
        lines.push(String::new());

        if !params.environment_setup.is_empty() {
            lines.extend(params.environment_setup.iter().cloned());
            lines.push(String::new());
        }

        let has_scratch = params.alt_scratch_dir.is_some();
        if has_scratch {
            lines.push("rsync -av $INPUTS_DIR/ $INPUTS_DIR_SCRATCH >> $LOG_PATH 2>&1".to_string());
            lines.push(String::new());
        }

        lines.push(params.runtime_call("set-task-start"));
        lines.push(String::new());
        lines.push("cd $INPUTS_DIR_SCRATCH".to_string());
        lines.push(format!(". $SUBMIT_DIR/{}", params.command_file));
        lines.push(String::new());
        lines.push(params.runtime_call("set-task-end"));
        lines.push(String::new());

        if has_scratch {
            let exclude = match &params.alt_scratch_exclude_file {
                Some(name) => format!(
                    " --exclude-from=$SUBMIT_DIR/{}",
                    name.replace("{}", "${TASK_IDX}")
                ),
                None => String::new(),
            };
            lines.push(format!(
                "rsync -av{} $INPUTS_DIR_SCRATCH/ $INPUTS_DIR --remove-source-files >> $LOG_PATH 2>&1",
                exclude
            ));
            lines.push(String::new());
        }

        if params.archive_enabled {
            lines.push(params.runtime_call("archive"));
            lines.push(String::new());
        }

        lines.join("\n")
    }

    fn render_stats(&self, params: &JobScriptParams, generated: DateTime<Utc>) -> String {
        let mut lines = self.header(params, generated, "stats jobscript");
        if let Some(name) = &params.job_name {
            lines.push(format!("#$ -N {}_stats", name));
        }
        if let Some(dir) = &params.output_dir {
            lines.push(format!("#$ -o {}", dir));
        }
        if let Some(dir) = &params.error_dir {
            lines.push(format!("#$ -e {}", dir));
        }
        lines.push(String::new());
        lines.push(self.array_directive(params));
        lines.push(String::new());
        lines.extend(self.define_dirs(params, "log_stats"));
        lines.push(String::new());
        lines.push(params.runtime_call("scrape-stats"));
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Writes a jobscript and marks it executable.
pub fn write_jobscript(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }

    debug!("Wrote jobscript {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params() -> JobScriptParams {
        let mut scheduler_options = BTreeMap::new();
        scheduler_options.insert("pe".to_string(), "smp.pe 4".to_string());
        scheduler_options.insert("cwd".to_string(), String::new());
        JobScriptParams {
            exec_order: 1,
            command_group_submission: CommandGroupSubmissionId(7),
            max_num_tasks: 6,
            step_size: 2,
            array_stride: 2,
            first_slot: 1,
            last_slot: 6,
            submit_dir: ".arrayflow/workflow_0/submit_0".to_string(),
            command_file: "cmd_1.sh".to_string(),
            working_dirs_file: "working_dirs_1_{}.txt".to_string(),
            environment_setup: vec!["module load python".to_string()],
            scheduler_options,
            job_name: Some("solve".to_string()),
            output_dir: None,
            error_dir: None,
            archive_enabled: false,
            alt_scratch_dir: None,
            alt_scratch_exclude_file: None,
            executable: "arrayflow".to_string(),
            task_id_env_var: "SGE_TASK_ID".to_string(),
            iteration_env_var: "ITER_IDX".to_string(),
        }
    }

    #[test]
    fn test_render_basic_jobscript() {
        let text = SgeRenderer::new().render(&params(), Utc::now());

        assert!(text.starts_with("#!/bin/bash --login\n"));
        assert!(text.contains("#$ -N solve\n"));
        assert!(text.contains("#$ -cwd\n#$ -pe smp.pe 4\n"));
        assert!(text.contains("#$ -t 1-6:2"));
        assert!(text.contains("SUBMIT_DIR=$ROOT_DIR/.arrayflow/workflow_0/submit_0"));
        assert!(text.contains("TASK_IDX=$((($SGE_TASK_ID - 1)/2))"));
        assert!(text.contains(
            "arrayflow write-runtime-files -d $ROOT_DIR 7 $TASK_IDX $ITER_IDX >> $LOG_PATH 2>&1"
        ));
        assert!(text.contains(
            "INPUTS_DIR_REL=`sed -n \"${SGE_TASK_ID}p\" $SUBMIT_DIR/working_dirs_1_${ITER_IDX}.txt`"
        ));
        assert!(text.contains("INPUTS_DIR_SCRATCH=$INPUTS_DIR\n"));
        assert!(text.contains("module load python\n"));
        assert!(text.contains(". $SUBMIT_DIR/cmd_1.sh"));
        assert!(!text.contains("rsync"));
        assert!(!text.contains("arrayflow archive"));

        let start = text.find("set-task-start").unwrap();
        let source = text.find(". $SUBMIT_DIR/cmd_1.sh").unwrap();
        let end = text.find("set-task-end").unwrap();
        assert!(start < source && source < end);
    }

    #[test]
    fn test_render_stride_wider_than_step() {
        let mut params = params();
        params.step_size = 1;
        params.array_stride = 2;
        let text = SgeRenderer::new().render(&params, Utc::now());

        assert!(text.contains("#$ -t 1-6:2"));
        assert!(text.contains("TASK_IDX=$((($SGE_TASK_ID - 1)/1))"));
    }

    #[test]
    fn test_render_alt_scratch_and_archive() {
        let mut params = params();
        params.archive_enabled = true;
        params.alt_scratch_dir = Some(PathBuf::from("/scratch/abc123"));
        params.alt_scratch_exclude_file = Some("alt_scratch_exclude_1_{}.txt".to_string());
        let text = SgeRenderer::new().render(&params, Utc::now());

        assert!(text.contains("INPUTS_DIR_SCRATCH=/scratch/abc123/$INPUTS_DIR_REL"));
        assert!(text.contains("rsync -av $INPUTS_DIR/ $INPUTS_DIR_SCRATCH"));
        assert!(text.contains(
            "rsync -av --exclude-from=$SUBMIT_DIR/alt_scratch_exclude_1_${TASK_IDX}.txt $INPUTS_DIR_SCRATCH/ $INPUTS_DIR --remove-source-files"
        ));
        assert!(text.contains("arrayflow archive -d $ROOT_DIR 7 $TASK_IDX $ITER_IDX"));

        let end = text.find("set-task-end").unwrap();
        let back = text.find("--remove-source-files").unwrap();
        let archive = text.find("arrayflow archive").unwrap();
        assert!(end < back && back < archive);
    }

    #[test]
    fn test_render_stats_jobscript() {
        let text = SgeRenderer::new().render_stats(&params(), Utc::now());
        assert!(text.contains("#$ -N solve_stats"));
        assert!(text.contains("#$ -t 1-6:2"));
        assert!(text.contains("arrayflow scrape-stats -d $ROOT_DIR 7 $TASK_IDX $ITER_IDX"));
        assert!(!text.contains("cmd_1.sh"));
    }

    #[test]
    fn test_write_jobscript_is_executable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("js_0.sh");
        write_jobscript(&path, "#!/bin/bash\n").unwrap();
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
