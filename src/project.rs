//! Project Layout
//!
//! A project is a root directory plus a data directory inside it that holds
//! the store and every generated file:
//!
//! ```text
//! <root>/.arrayflow/
//!   store/
//!   workflow_<w>/submit_<s>/
//!     js_<exec_order>.sh
//!     js_stats_<exec_order>.sh
//!     cmd_<exec_order>.sh
//!     working_dirs_<exec_order>_<iteration>.txt
//!     alt_scratch_exclude_<exec_order>_<task>.txt
//!     scheduler_group_<g>/var_values/<iteration>/<slot>/var_<name>.txt
//!     output/ error/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::config::Config;
use crate::error::Result;
use crate::workflow::model::{SubmissionId, WorkflowId};

#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    data_dir: PathBuf,
    config: Config,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Self {
        let root = root.into();
        let data_dir = root.join(&config.data_dir_name);
        Self {
            root,
            data_dir,
            config: config.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// Removes every generated file, including the store.
    pub fn clean(&self) -> Result<()> {
        if self.data_dir.exists() {
            fs::remove_dir_all(&self.data_dir)?;
            info!("Removed {}", self.data_dir.display());
        }
        Ok(())
    }

    pub fn workflow_dir(&self, workflow: WorkflowId) -> PathBuf {
        self.data_dir.join(format!("workflow_{}", workflow))
    }

    pub fn submit_dir(&self, workflow: WorkflowId, submission: SubmissionId) -> PathBuf {
        self.workflow_dir(workflow).join(format!("submit_{}", submission))
    }

    pub fn jobscript_name(&self, exec_order: usize) -> String {
        format!("js_{}{}", exec_order, self.config.jobscript_ext)
    }

    pub fn stats_jobscript_name(&self, exec_order: usize) -> String {
        format!("js_stats_{}{}", exec_order, self.config.jobscript_ext)
    }

    pub fn command_file_name(&self, exec_order: usize) -> String {
        format!("cmd_{}{}", exec_order, self.config.jobscript_ext)
    }

    /// Working dirs file name with the iteration index left as `{}`.
    pub fn working_dirs_file_template(&self, exec_order: usize) -> String {
        format!(
            "working_dirs_{}_{{}}{}",
            exec_order, self.config.working_dirs_file_ext
        )
    }

    pub fn working_dirs_file_name(&self, exec_order: usize, iteration: usize) -> String {
        self.working_dirs_file_template(exec_order)
            .replace("{}", &iteration.to_string())
    }

    /// Exclusion list name with the task index left as `{}`.
    pub fn alt_scratch_exclude_file_template(&self, exec_order: usize) -> String {
        format!(
            "{}_{}_{{}}{}",
            self.config.alt_scratch_exclude_name, exec_order, self.config.working_dirs_file_ext
        )
    }

    pub fn alt_scratch_exclude_file_name(&self, exec_order: usize, task: usize) -> String {
        self.alt_scratch_exclude_file_template(exec_order)
            .replace("{}", &task.to_string())
    }

    pub fn scheduler_group_dir(&self, submit_dir: &Path, scheduler_group: usize) -> PathBuf {
        submit_dir.join(format!("scheduler_group_{}", scheduler_group))
    }

    /// Directory holding one scheduler slot's variable files.
    pub fn var_values_dir(
        &self,
        submit_dir: &Path,
        scheduler_group: usize,
        iteration: usize,
        slot: &str,
    ) -> PathBuf {
        self.scheduler_group_dir(submit_dir, scheduler_group)
            .join("var_values")
            .join(iteration.to_string())
            .join(slot)
    }

    pub fn variable_file_name(&self, name: &str) -> String {
        format!("var_{}{}", name, self.config.variable_file_ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_paths() {
        let project = Project::new("/work", &Config::default());
        let submit = project.submit_dir(WorkflowId(0), SubmissionId(2));
        assert_eq!(submit, PathBuf::from("/work/.arrayflow/workflow_0/submit_2"));
        assert_eq!(project.jobscript_name(1), "js_1.sh");
        assert_eq!(project.working_dirs_file_name(1, 0), "working_dirs_1_0.txt");
        assert_eq!(project.working_dirs_file_template(1), "working_dirs_1_{}.txt");
        assert_eq!(
            project.var_values_dir(&submit, 0, 1, "03"),
            PathBuf::from("/work/.arrayflow/workflow_0/submit_2/scheduler_group_0/var_values/1/03")
        );
        assert_eq!(project.variable_file_name("x"), "var_x.txt");
        assert_eq!(
            project.alt_scratch_exclude_file_name(0, 4),
            "alt_scratch_exclude_0_4.txt"
        );
    }

    #[test]
    fn test_clean_removes_data_dir() {
        let dir = tempdir().unwrap();
        let project = Project::new(dir.path(), &Config::default());
        project.ensure_data_dir().unwrap();
        assert!(project.data_dir().exists());
        project.clean().unwrap();
        assert!(!project.data_dir().exists());
        project.clean().unwrap();
    }
}
