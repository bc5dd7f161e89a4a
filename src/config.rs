//! Runtime Configuration
//!
//! Explicit configuration passed to every constructor that needs it.
//! Values are read from an optional `config.yml` in the configuration
//! directory; anything missing falls back to the defaults below.
//!
//! ```yaml
//! variable_delimiters: ["<<", ">>"]
//! command_lock_backoff_ms: 5000
//! archive_lock_backoff_ms: 10000
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::RetryPolicy;

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "ARRAYFLOW_CONFIG_DIR";

/// File name looked up inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "config.yml";

/// Left/right markers around a variable name in templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delimiters(pub String, pub String);

impl Delimiters {
    pub fn left(&self) -> &str {
        &self.0
    }

    pub fn right(&self) -> &str {
        &self.1
    }

    /// Wraps a variable name, e.g. `dir` -> `<<dir>>`.
    pub fn wrap(&self, name: &str) -> String {
        format!("{}{}{}", self.0, name, self.1)
    }
}

impl Default for Delimiters {
    fn default() -> Self {
        Self("<<".to_string(), ">>".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub variable_delimiters: Delimiters,

    /// Name given to the directory variable generated for command groups
    /// whose directory is a literal path (or missing).
    pub default_directory_var_name: String,

    /// Per-project directory holding the store, submit dirs and jobscripts.
    pub data_dir_name: String,

    pub jobscript_ext: String,
    pub variable_file_ext: String,
    pub working_dirs_file_ext: String,
    pub alt_scratch_exclude_name: String,

    /// Scheduler-provided array index, used inside command files.
    pub task_id_env_var: String,
    /// Variable carrying the loop iteration index into a jobscript.
    pub iteration_env_var: String,

    pub submit_command: String,
    pub cancel_command: String,
    pub accounting_command: String,

    /// Program invoked by jobscripts for the runtime subcommands.
    pub executable: String,

    pub command_lock_backoff_ms: u64,
    pub archive_lock_backoff_ms: u64,
    pub archive_start_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            variable_delimiters: Delimiters::default(),
            default_directory_var_name: "__cmd_group_directory".to_string(),
            data_dir_name: ".arrayflow".to_string(),
            jobscript_ext: ".sh".to_string(),
            variable_file_ext: ".txt".to_string(),
            working_dirs_file_ext: ".txt".to_string(),
            alt_scratch_exclude_name: "alt_scratch_exclude".to_string(),
            task_id_env_var: "SGE_TASK_ID".to_string(),
            iteration_env_var: "ITER_IDX".to_string(),
            submit_command: "qsub".to_string(),
            cancel_command: "qdel".to_string(),
            accounting_command: "qacct".to_string(),
            executable: "arrayflow".to_string(),
            command_lock_backoff_ms: 5_000,
            archive_lock_backoff_ms: 10_000,
            archive_start_delay_ms: 10_000,
        }
    }
}

impl Config {
    /// Loads `config.yml` from `config_dir`, or defaults when it is absent.
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self> {
        let path = config_dir.as_ref().join(CONFIG_FILE_NAME);
        if !path.is_file() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolves the configuration directory from the environment.
    pub fn config_dir_from_env() -> PathBuf {
        if let Ok(dir) = env::var(CONFIG_DIR_ENV) {
            return PathBuf::from(dir);
        }
        match env::var("HOME") {
            Ok(home) => Path::new(&home).join(".arrayflow"),
            Err(_) => PathBuf::from(".arrayflow"),
        }
    }

    /// Fixed-interval retry used while waiting for the command-writing lease.
    pub fn command_lock_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.command_lock_backoff_ms))
    }

    /// Fixed-interval retry used while waiting for an archive lease.
    pub fn archive_lock_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.archive_lock_backoff_ms))
    }

    pub fn archive_start_delay(&self) -> Duration {
        Duration::from_millis(self.archive_start_delay_ms)
    }

    /// Configuration with millisecond backoffs, for tests and local runs.
    pub fn fast() -> Self {
        Self {
            command_lock_backoff_ms: 5,
            archive_lock_backoff_ms: 5,
            archive_start_delay_ms: 0,
            ..Self::default()
        }
    }
}
