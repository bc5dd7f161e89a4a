//! Workflow Data Model
//!
//! Persistent entities of a workflow and their relationships:
//!
//! - [`Workflow`] is the root aggregate, owning command groups, variable
//!   definitions, the flat table of resolved [`VarValue`]s, archives,
//!   iterations and submissions.
//! - A [`Submission`] owns one [`CommandGroupSubmission`] per command group,
//!   each of which owns one [`CommandGroupSubmissionIteration`] per loop pass
//!   it takes part in, each of which owns its [`Task`]s.
//!
//! Cross references are plain indices/ids into these tables. In particular a
//! `VarValue` points at the directory value it was resolved under through
//! [`VarValue::directory_value`]; directory values point at themselves.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::planner::Multiplicity;
use super::variables::extract_variable_names;
use crate::config::Delimiters;
use crate::error::{Error, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Index of a workflow in the store.
    WorkflowId(usize)
);
id_type!(
    /// Index into [`Workflow::var_definitions`].
    VarDefId(usize)
);
id_type!(
    /// Index into [`Workflow::var_values`].
    VarValueId(usize)
);
id_type!(
    /// Index into [`Workflow::submissions`].
    SubmissionId(usize)
);
id_type!(
    /// Store-wide identifier handed to jobscripts and the runtime commands.
    CommandGroupSubmissionId(u64)
);

/// Scheduler job identifier.
pub type JobId = u64;

/// How a command group relates to the one before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nesting {
    /// 1:1 passthrough from the previous group.
    #[default]
    None,
    /// Continue each upstream task element-wise.
    Nest,
    /// Barrier: wait for every upstream task. Starts a new scheduler group.
    Hold,
}

/// One entry of a command tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Line {
        line: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parallel_mode: Option<String>,
    },
    Subshell {
        subshell: Vec<Command>,
    },
}

impl Command {
    pub fn line(text: impl Into<String>) -> Self {
        Self::Line {
            line: text.into(),
            parallel_mode: None,
        }
    }

    pub fn parallel(text: impl Into<String>, mode: impl Into<String>) -> Self {
        Self::Line {
            line: text.into(),
            parallel_mode: Some(mode.into()),
        }
    }

    pub fn subshell(children: Vec<Command>) -> Self {
        Self::Subshell { subshell: children }
    }

    /// Visits every line of the tree, depth first.
    pub fn for_each_line<'a>(&'a self, f: &mut dyn FnMut(&'a str, Option<&'a str>)) {
        match self {
            Self::Line {
                line,
                parallel_mode,
            } => f(line, parallel_mode.as_deref()),
            Self::Subshell { subshell } => {
                for child in subshell {
                    child.for_each_line(f);
                }
            }
        }
    }
}

/// Deserializes a command list where each entry is a bare string, a
/// `{line, parallel_mode}` map or a `{subshell: [...]}` map.
pub(crate) fn command_list<'de, D>(deserializer: D) -> std::result::Result<Vec<Command>, D::Error>
where
    D: Deserializer<'de>,
{
    fn convert<E: de::Error>(val: Value) -> std::result::Result<Command, E> {
        match val {
            Value::String(s) => Ok(Command::line(s)),
            Value::Object(mut map) => {
                if let Some(children) = map.remove("subshell") {
                    let Value::Array(items) = children else {
                        return Err(E::custom("subshell must be a list of commands"));
                    };
                    let children = items
                        .into_iter()
                        .map(convert::<E>)
                        .collect::<std::result::Result<Vec<_>, E>>()?;
                    return Ok(Command::subshell(children));
                }
                let line = match map.remove("line") {
                    Some(Value::String(s)) => s,
                    _ => return Err(E::custom("command map needs a 'line' string")),
                };
                let parallel_mode = match map.remove("parallel_mode") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s),
                    Some(_) => return Err(E::custom("parallel_mode must be a string")),
                };
                Ok(Command::Line {
                    line,
                    parallel_mode,
                })
            }
            _ => Err(E::custom("expected a command string or map")),
        }
    }

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.into_iter().map(convert::<D::Error>).collect(),
        other => Ok(vec![convert(other)?]),
    }
}

/// Deserializes a list of scalars (strings or numbers) as strings.
pub(crate) fn scalar_list<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Option::<Value>::deserialize(deserializer)?;
    let Some(val) = val else {
        return Ok(None);
    };
    let items = match val {
        Value::Array(items) => items,
        Value::Null => return Ok(None),
        other => vec![other],
    };
    items
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(de::Error::custom("expected a scalar value in data list")),
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(Some)
}

/// Regex match against entries of the directory being resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRegex {
    pub pattern: String,
    /// Capture group index (0 = first group); the whole match is used when
    /// the pattern has no groups.
    #[serde(default)]
    pub group: usize,
    /// Match directories (recursively, relative posix paths) instead of
    /// the files directly inside the directory.
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_multiplicity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    pub path: String,
}

fn default_template() -> String {
    "{}".to_string()
}

/// A named variable.
///
/// Sources (`data`, `file_regex`, `file_contents`) produce raw values that are
/// formatted through the `value` template, replacing `{}`. A definition whose
/// `value` embeds other variables (`<<name>>`) is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDefinition {
    pub name: String,

    #[serde(default = "default_template")]
    pub value: String,

    #[serde(default, deserialize_with = "scalar_list", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_regex: Option<FileRegex>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_contents: Option<FileContents>,
}

impl VarDefinition {
    /// A definition with a literal (or template) value and no source.
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            data: None,
            file_regex: None,
            file_contents: None,
        }
    }

    pub fn with_data(name: impl Into<String>, data: Vec<String>) -> Self {
        Self {
            data: Some(data),
            ..Self::literal(name, default_template())
        }
    }

    pub fn with_file_regex(name: impl Into<String>, regex: FileRegex) -> Self {
        Self {
            file_regex: Some(regex),
            ..Self::literal(name, default_template())
        }
    }

    pub fn with_file_contents(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            file_contents: Some(FileContents { path: path.into() }),
            ..Self::literal(name, default_template())
        }
    }

    /// Overrides the formatting template.
    pub fn template(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    /// Names of other variables embedded in the template.
    pub fn dependencies(&self, delims: &Delimiters) -> Vec<String> {
        extract_variable_names(&self.value, delims)
    }

    pub fn is_base(&self, delims: &Delimiters) -> bool {
        self.dependencies(delims).is_empty()
    }

    pub fn has_source(&self) -> bool {
        self.data.is_some() || self.file_regex.is_some() || self.file_contents.is_some()
    }
}

/// A named environment/command prefix, e.g. MPI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelMode {
    #[serde(default)]
    pub env: Vec<String>,
    pub command: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootDirectoryName {
    #[default]
    None,
    Parent,
    Datetime,
}

/// A named archive location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub name: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
    #[serde(default)]
    pub root_directory_name: RootDirectoryName,
    #[serde(default)]
    pub root_directory_increment: bool,
    /// Directory name chosen once per workflow (None archives into `path`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_directory: Option<String>,
}

impl Archive {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            host: None,
            cloud_provider: None,
            root_directory_name: RootDirectoryName::None,
            root_directory_increment: false,
            root_directory: None,
        }
    }

    pub fn with_root_directory_name(mut self, naming: RootDirectoryName, increment: bool) -> Self {
        self.root_directory_name = naming;
        self.root_directory_increment = increment;
        self
    }

    /// Destination root for this workflow's archived directories.
    pub fn destination(&self) -> PathBuf {
        match &self.root_directory {
            Some(dir) => self.path.join(dir),
            None => self.path.clone(),
        }
    }
}

/// One job-script unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandGroup {
    pub exec_order: usize,
    pub commands: Vec<Command>,
    pub is_job_array: bool,
    pub nesting: Nesting,
    pub directory_var: VarDefId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<usize>,
    #[serde(default)]
    pub archive_excludes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate_scratch: Option<PathBuf>,
    /// Shell lines run before the commands (module loads etc.).
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub scheduler_options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_dir: Option<String>,
    #[serde(default)]
    pub stats: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
}

impl CommandGroup {
    pub fn new(exec_order: usize, commands: Vec<Command>, directory_var: VarDefId) -> Self {
        Self {
            exec_order,
            commands,
            is_job_array: true,
            nesting: Nesting::None,
            directory_var,
            archive: None,
            archive_excludes: Vec::new(),
            alternate_scratch: None,
            environment: Vec::new(),
            scheduler_options: BTreeMap::new(),
            output_dir: None,
            error_dir: None,
            stats: false,
            job_name: None,
        }
    }

    pub fn with_nesting(mut self, nesting: Nesting) -> Self {
        self.nesting = nesting;
        self
    }

    pub fn with_job_array(mut self, is_job_array: bool) -> Self {
        self.is_job_array = is_job_array;
        self
    }

    pub fn with_archive(mut self, archive: usize) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Distinct variable names referenced by the commands, in first-seen order.
    pub fn command_variable_names(&self, delims: &Delimiters) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for command in &self.commands {
            command.for_each_line(&mut |line, _| {
                for name in extract_variable_names(line, delims) {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            });
        }
        names
    }

    /// Parallel modes referenced by any line.
    pub fn parallel_modes(&self) -> BTreeSet<String> {
        let mut modes = BTreeSet::new();
        for command in &self.commands {
            command.for_each_line(&mut |_, mode| {
                if let Some(mode) = mode {
                    modes.insert(mode.to_string());
                }
            });
        }
        modes
    }
}

fn default_max_iterations() -> usize {
    1
}

/// Loop specification: repeat `groups` (or all groups) `max_iterations` times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSpec {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<BTreeSet<usize>>,
}

impl Default for LoopSpec {
    fn default() -> Self {
        Self {
            max_iterations: 1,
            groups: None,
        }
    }
}

impl LoopSpec {
    pub fn includes(&self, exec_order: usize) -> bool {
        match &self.groups {
            Some(groups) => groups.contains(&exec_order),
            None => true,
        }
    }

    /// Iteration indices a command group takes part in.
    pub fn iterations_for(&self, exec_order: usize) -> Vec<usize> {
        if self.includes(exec_order) {
            (0..self.max_iterations.max(1)).collect()
        } else {
            vec![0]
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    #[default]
    Pending,
    Active,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    pub order_id: usize,
    pub status: IterationStatus,
}

/// One resolved value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarValue {
    pub id: VarValueId,
    pub definition: VarDefId,
    pub submission: SubmissionId,
    pub iteration: usize,
    pub value: String,
    pub order_id: usize,
    /// Directory value this was resolved under; equals `id` for directory values.
    pub directory_value: VarValueId,
}

impl VarValue {
    pub fn is_directory_anchor(&self) -> bool {
        self.directory_value == self.id
    }
}

/// `[start, stop, step]` with `stop = -1` meaning unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRange {
    pub start: usize,
    pub stop: i64,
    pub step: usize,
}

impl Default for TaskRange {
    fn default() -> Self {
        Self {
            start: 1,
            stop: -1,
            step: 1,
        }
    }
}

impl TaskRange {
    /// Parses `all`, `n-m` or `n-m:s`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("all") {
            return Ok(Self::default());
        }

        let (range, step) = match text.split_once(':') {
            Some((range, step)) => (range, Some(step)),
            None => (text, None),
        };
        let (start, stop) = range
            .split_once('-')
            .ok_or_else(|| Error::InvalidTaskRange(format!("expected n-m, got '{}'", text)))?;

        let parse = |s: &str| {
            s.trim()
                .parse::<i64>()
                .map_err(|_| Error::InvalidTaskRange(format!("'{}' is not an integer", s)))
        };
        let values = match step {
            Some(step) => vec![parse(start)?, parse(stop)?, parse(step)?],
            None => vec![parse(start)?, parse(stop)?],
        };
        Self::from_values(&values)
    }

    /// Validates a two or three element range.
    pub fn from_values(values: &[i64]) -> Result<Self> {
        let (start, stop, step) = match values {
            [start, stop] => (*start, *stop, 1),
            [start, stop, step] => (*start, *stop, *step),
            _ => {
                return Err(Error::InvalidTaskRange(format!(
                    "expected two or three values, got {}",
                    values.len()
                )))
            }
        };
        if start < 1 {
            return Err(Error::InvalidTaskRange(format!("start must be >= 1, got {}", start)));
        }
        if stop != -1 && stop < start {
            return Err(Error::InvalidTaskRange(format!(
                "stop ({}) must be >= start ({})",
                stop, start
            )));
        }
        if step < 1 {
            return Err(Error::InvalidTaskRange(format!("step must be >= 1, got {}", step)));
        }
        Ok(Self {
            start: start as usize,
            stop,
            step: step as usize,
        })
    }

    pub fn is_unbounded(&self) -> bool {
        self.stop == -1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskArchiveStatus {
    Pending,
    Active,
    Complete,
}

/// One scheduler-array element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub order_id: usize,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub wallclock: Option<String>,
    #[serde(default)]
    pub archive_status: Option<TaskArchiveStatus>,
    #[serde(default)]
    pub archive_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archive_end_time: Option<DateTime<Utc>>,
    /// Sibling (by order id) whose archive covers this task's output.
    #[serde(default)]
    pub archived_task: Option<usize>,
}

impl Task {
    pub fn new(order_id: usize, archived: bool) -> Self {
        Self {
            order_id,
            start_time: None,
            end_time: None,
            memory: None,
            hostname: None,
            wallclock: None,
            archive_status: archived.then_some(TaskArchiveStatus::Pending),
            archive_start_time: None,
            archive_end_time: None,
            archived_task: None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// The join of a command group submission and an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandGroupSubmissionIteration {
    pub iteration: usize,
    #[serde(default)]
    pub scheduler_job_id: Option<JobId>,
    #[serde(default)]
    pub stats_job_id: Option<JobId>,
    #[serde(default)]
    pub working_dirs_written: bool,
    pub tasks: Vec<Task>,
}

impl CommandGroupSubmissionIteration {
    /// Archive start time of a task, following `archived_task` links.
    pub fn archive_start_time(&self, order_id: usize) -> Option<DateTime<Utc>> {
        let task = self.tasks.get(order_id)?;
        match task.archived_task {
            Some(other) if other != order_id => self.tasks.get(other).and_then(|t| t.archive_start_time),
            _ => task.archive_start_time,
        }
    }

    pub fn archive_end_time(&self, order_id: usize) -> Option<DateTime<Utc>> {
        let task = self.tasks.get(order_id)?;
        match task.archived_task {
            Some(other) if other != order_id => self.tasks.get(other).and_then(|t| t.archive_end_time),
            _ => task.archive_end_time,
        }
    }

    pub fn all_ended(&self) -> bool {
        self.tasks.iter().all(|t| t.end_time.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandGroupSubmission {
    pub id: CommandGroupSubmissionId,
    /// Index of the command group (its exec order).
    pub command_group: usize,
    pub task_range: TaskRange,
    pub multiplicity: Multiplicity,
    pub output_count: usize,
    pub scheduler_group: usize,
    pub step_size: usize,
    pub max_num_tasks: usize,
    #[serde(default)]
    pub commands_written: bool,
    pub iterations: Vec<CommandGroupSubmissionIteration>,
}

impl CommandGroupSubmission {
    pub fn iteration(&self, iteration: usize) -> Option<&CommandGroupSubmissionIteration> {
        self.iterations.iter().find(|i| i.iteration == iteration)
    }

    pub fn iteration_mut(&mut self, iteration: usize) -> Option<&mut CommandGroupSubmissionIteration> {
        self.iterations.iter_mut().find(|i| i.iteration == iteration)
    }

    /// 1-based scheduler array index of a task.
    pub fn scheduler_task_id(&self, order_id: usize) -> usize {
        1 + order_id * self.step_size
    }

    /// Maps a scheduler array index back to a task order id.
    pub fn task_from_scheduler_id(&self, scheduler_id: usize) -> Option<usize> {
        if scheduler_id == 0 || self.step_size == 0 {
            return None;
        }
        let offset = scheduler_id - 1;
        (offset % self.step_size == 0 && offset / self.step_size < self.output_count)
            .then_some(offset / self.step_size)
    }

    /// Width used to zero-pad scheduler slot directories.
    pub fn zero_pad_width(&self) -> usize {
        self.max_num_tasks.to_string().len()
    }

    /// Directory index of a task over `dir_count` directories, with the
    /// task's position among the tasks sharing that directory.
    ///
    /// Per-directory counts that add up to the output count give each
    /// directory a contiguous block of its own size; otherwise directories
    /// are spread evenly over the tasks.
    pub fn task_directory(&self, dir_count: usize, order_id: usize) -> Option<(usize, usize)> {
        if dir_count == 0 || order_id >= self.output_count {
            return None;
        }
        if let Multiplicity::PerDirectory(counts) = &self.multiplicity {
            if counts.len() == dir_count && counts.iter().sum::<usize>() == self.output_count {
                let mut first = 0;
                for (idx, &count) in counts.iter().enumerate() {
                    if order_id < first + count {
                        return Some((idx, order_id - first));
                    }
                    first += count;
                }
                return None;
            }
        }
        let idx = order_id * dir_count / self.output_count;
        let first = (idx * self.output_count + dir_count - 1) / dir_count;
        Some((idx, order_id - first))
    }

    pub fn slot_name(&self, order_id: usize) -> String {
        format!(
            "{:0width$}",
            self.scheduler_task_id(order_id),
            width = self.zero_pad_width()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub alt_scratch_dir_name: Option<String>,
    pub command_group_submissions: Vec<CommandGroupSubmission>,
}

impl Submission {
    pub fn command_group_submission(&self, exec_order: usize) -> Option<&CommandGroupSubmission> {
        self.command_group_submissions
            .iter()
            .find(|c| c.command_group == exec_order)
    }
}

/// Root aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub root: PathBuf,
    pub created: DateTime<Utc>,
    pub command_groups: Vec<CommandGroup>,
    pub var_definitions: Vec<VarDefinition>,
    #[serde(default)]
    pub var_values: Vec<VarValue>,
    #[serde(default)]
    pub archives: Vec<Archive>,
    #[serde(default)]
    pub root_archive: Option<usize>,
    #[serde(default)]
    pub root_archive_excludes: Vec<String>,
    #[serde(default)]
    pub loop_spec: LoopSpec,
    #[serde(default)]
    pub parallel_modes: BTreeMap<String, ParallelMode>,
    #[serde(default)]
    pub iterations: Vec<Iteration>,
    #[serde(default)]
    pub submissions: Vec<Submission>,
}

impl Workflow {
    /// Creates a workflow and pre-creates its iterations.
    pub fn new(
        id: WorkflowId,
        root: impl Into<PathBuf>,
        command_groups: Vec<CommandGroup>,
        var_definitions: Vec<VarDefinition>,
    ) -> Self {
        let mut workflow = Self {
            id,
            root: root.into(),
            created: Utc::now(),
            command_groups,
            var_definitions,
            var_values: Vec::new(),
            archives: Vec::new(),
            root_archive: None,
            root_archive_excludes: Vec::new(),
            loop_spec: LoopSpec::default(),
            parallel_modes: BTreeMap::new(),
            iterations: Vec::new(),
            submissions: Vec::new(),
        };
        workflow.create_iterations();
        workflow
    }

    pub fn with_loop(mut self, loop_spec: LoopSpec) -> Self {
        self.loop_spec = loop_spec;
        self.create_iterations();
        self
    }

    fn create_iterations(&mut self) {
        self.iterations = (0..self.loop_spec.max_iterations.max(1))
            .map(|order_id| Iteration {
                order_id,
                status: IterationStatus::Pending,
            })
            .collect();
    }

    pub fn var_definition(&self, id: VarDefId) -> &VarDefinition {
        &self.var_definitions[id.0]
    }

    pub fn var_definition_by_name(&self, name: &str) -> Option<(VarDefId, &VarDefinition)> {
        self.var_definitions
            .iter()
            .enumerate()
            .find(|(_, d)| d.name == name)
            .map(|(i, d)| (VarDefId(i), d))
    }

    pub fn command_group(&self, exec_order: usize) -> Option<&CommandGroup> {
        self.command_groups.iter().find(|c| c.exec_order == exec_order)
    }

    pub fn submission(&self, id: SubmissionId) -> Option<&Submission> {
        self.submissions.get(id.0)
    }

    pub fn var_value(&self, id: VarValueId) -> &VarValue {
        &self.var_values[id.0]
    }

    /// Directory anchors of a directory variable, ordered.
    pub fn directory_values(
        &self,
        definition: VarDefId,
        submission: SubmissionId,
        iteration: usize,
    ) -> Vec<&VarValue> {
        let mut values: Vec<&VarValue> = self
            .var_values
            .iter()
            .filter(|v| {
                v.definition == definition
                    && v.submission == submission
                    && v.iteration == iteration
                    && v.is_directory_anchor()
            })
            .collect();
        values.sort_by_key(|v| v.order_id);
        values
    }

    /// Values of a definition resolved under one directory value, ordered.
    pub fn values_under(
        &self,
        definition: VarDefId,
        submission: SubmissionId,
        iteration: usize,
        directory: VarValueId,
    ) -> Vec<&VarValue> {
        let mut values: Vec<&VarValue> = self
            .var_values
            .iter()
            .filter(|v| {
                v.definition == definition
                    && v.submission == submission
                    && v.iteration == iteration
                    && v.directory_value == directory
            })
            .collect();
        values.sort_by_key(|v| v.order_id);
        values
    }

    /// Appends directory anchors; each points at itself.
    pub fn push_directory_values(
        &mut self,
        definition: VarDefId,
        submission: SubmissionId,
        iteration: usize,
        values: &[String],
    ) -> Vec<VarValueId> {
        let mut ids = Vec::with_capacity(values.len());
        for (order_id, value) in values.iter().enumerate() {
            let id = VarValueId(self.var_values.len());
            self.var_values.push(VarValue {
                id,
                definition,
                submission,
                iteration,
                value: value.clone(),
                order_id,
                directory_value: id,
            });
            ids.push(id);
        }
        ids
    }

    /// Appends values resolved under `directory`.
    pub fn push_var_values(
        &mut self,
        definition: VarDefId,
        submission: SubmissionId,
        iteration: usize,
        directory: VarValueId,
        values: &[String],
    ) {
        for (order_id, value) in values.iter().enumerate() {
            let id = VarValueId(self.var_values.len());
            self.var_values.push(VarValue {
                id,
                definition,
                submission,
                iteration,
                value: value.clone(),
                order_id,
                directory_value: directory,
            });
        }
    }

    /// Names of variables a command group needs, excluding its directory
    /// variable, in first-seen order: command variables first, then the
    /// variables they depend on.
    pub fn command_group_variables(&self, exec_order: usize, delims: &Delimiters) -> Result<Vec<VarDefId>> {
        let group = self
            .command_group(exec_order)
            .ok_or_else(|| Error::NotFound(format!("command group {}", exec_order)))?;
        let dir_name = &self.var_definition(group.directory_var).name;

        let mut ids: Vec<VarDefId> = Vec::new();
        let mut pending: Vec<String> = group.command_variable_names(delims);
        pending.retain(|n| n != dir_name);

        while let Some(name) = pending.pop() {
            let (id, def) = self
                .var_definition_by_name(&name)
                .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
            if ids.contains(&id) || id == group.directory_var {
                continue;
            }
            ids.push(id);
            pending.extend(def.dependencies(delims));
        }
        ids.sort();
        Ok(ids)
    }

    /// Variables named directly in a command group's commands (excluding the
    /// directory variable). These set the group's task multiplicity.
    pub fn multiplicity_variables(&self, exec_order: usize, delims: &Delimiters) -> Result<Vec<VarDefId>> {
        let group = self
            .command_group(exec_order)
            .ok_or_else(|| Error::NotFound(format!("command group {}", exec_order)))?;
        group
            .command_variable_names(delims)
            .into_iter()
            .map(|name| {
                self.var_definition_by_name(&name)
                    .map(|(id, _)| id)
                    .ok_or(Error::UnknownVariable(name))
            })
            .filter(|id| !matches!(id, Ok(id) if *id == group.directory_var))
            .collect()
    }

    /// Working directory value of a task, as laid out by
    /// [`CommandGroupSubmission::task_directory`].
    pub fn working_directory(
        &self,
        submission: SubmissionId,
        cg_sub: &CommandGroupSubmission,
        iteration: usize,
        order_id: usize,
    ) -> Option<&VarValue> {
        self.task_directory(submission, cg_sub, iteration, order_id)
            .map(|(dir, _)| dir)
    }

    /// Working directory of a task and its position within that directory.
    pub fn task_directory(
        &self,
        submission: SubmissionId,
        cg_sub: &CommandGroupSubmission,
        iteration: usize,
        order_id: usize,
    ) -> Option<(&VarValue, usize)> {
        let group = self.command_group(cg_sub.command_group)?;
        let dirs = self.directory_values(group.directory_var, submission, iteration);
        let (idx, local) = cg_sub.task_directory(dirs.len(), order_id)?;
        dirs.get(idx).map(|dir| (*dir, local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delims() -> Delimiters {
        Delimiters::default()
    }

    #[derive(Deserialize)]
    struct Commands {
        #[serde(deserialize_with = "command_list")]
        commands: Vec<Command>,
    }

    #[test]
    fn test_command_list_shapes() {
        let yaml = r#"
commands:
  - echo hello
  - line: solve <<input>>
    parallel_mode: mpi
  - subshell:
      - cd sub
      - ls
"#;
        let parsed: Commands = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.commands.len(), 3);
        assert_eq!(parsed.commands[0], Command::line("echo hello"));
        assert_eq!(parsed.commands[1], Command::parallel("solve <<input>>", "mpi"));
        assert_eq!(
            parsed.commands[2],
            Command::subshell(vec![Command::line("cd sub"), Command::line("ls")])
        );
    }

    #[test]
    fn test_command_list_rejects_bad_entry() {
        let yaml = "commands:\n  - 42\n";
        assert!(serde_yaml::from_str::<Commands>(yaml).is_err());
    }

    #[test]
    fn test_var_definition_base_and_derived() {
        let base = VarDefinition::with_data("a", vec!["1".into()]);
        let derived = VarDefinition::literal("b", "<<a>>_out");
        assert!(base.is_base(&delims()));
        assert!(!derived.is_base(&delims()));
        assert_eq!(derived.dependencies(&delims()), vec!["a".to_string()]);
    }

    #[test]
    fn test_scalar_data_values() {
        let def: VarDefinition = serde_yaml::from_str("name: n\ndata: [1, 2.5, two]\n").unwrap();
        assert_eq!(
            def.data,
            Some(vec!["1".to_string(), "2.5".to_string(), "two".to_string()])
        );
        assert_eq!(def.value, "{}");
    }

    #[test]
    fn test_command_group_variable_names() {
        let group = CommandGroup::new(
            0,
            vec![
                Command::line("run <<a>> <<b>>"),
                Command::subshell(vec![Command::parallel("post <<a>> <<c>>", "mpi")]),
            ],
            VarDefId(0),
        );
        assert_eq!(group.command_variable_names(&delims()), vec!["a", "b", "c"]);
        assert!(group.parallel_modes().contains("mpi"));
    }

    #[test]
    fn test_loop_iterations_for() {
        let spec = LoopSpec {
            max_iterations: 3,
            groups: Some([1].into_iter().collect()),
        };
        assert_eq!(spec.iterations_for(0), vec![0]);
        assert_eq!(spec.iterations_for(1), vec![0, 1, 2]);
        assert_eq!(LoopSpec::default().iterations_for(5), vec![0]);
    }

    #[test]
    fn test_workflow_precreates_iterations() {
        let workflow = Workflow::new(WorkflowId(0), "/tmp", Vec::new(), Vec::new()).with_loop(LoopSpec {
            max_iterations: 4,
            groups: None,
        });
        assert_eq!(workflow.iterations.len(), 4);
        assert!(workflow
            .iterations
            .iter()
            .all(|i| i.status == IterationStatus::Pending));
    }

    #[test]
    fn test_task_range_parse() {
        assert_eq!(TaskRange::parse("all").unwrap(), TaskRange::default());
        assert_eq!(
            TaskRange::parse("2-10:2").unwrap(),
            TaskRange {
                start: 2,
                stop: 10,
                step: 2
            }
        );
        assert_eq!(TaskRange::parse("1-5").unwrap().step, 1);
        assert!(TaskRange::parse("0-5").is_err());
        assert!(TaskRange::parse("5-2").is_err());
        assert!(TaskRange::parse("1-5:0").is_err());
        assert!(TaskRange::parse("abc").is_err());
        assert!(TaskRange::from_values(&[1, -1]).unwrap().is_unbounded());
    }

    fn cg_sub(output_count: usize, step_size: usize, max_num_tasks: usize) -> CommandGroupSubmission {
        CommandGroupSubmission {
            id: CommandGroupSubmissionId(1),
            command_group: 0,
            task_range: TaskRange::default(),
            multiplicity: Multiplicity::Uniform(1),
            output_count,
            scheduler_group: 0,
            step_size,
            max_num_tasks,
            commands_written: false,
            iterations: Vec::new(),
        }
    }

    #[test]
    fn test_scheduler_task_ids() {
        let sub = cg_sub(3, 4, 12);
        assert_eq!(sub.scheduler_task_id(0), 1);
        assert_eq!(sub.scheduler_task_id(2), 9);
        assert_eq!(sub.task_from_scheduler_id(5), Some(1));
        assert_eq!(sub.task_from_scheduler_id(6), None);
        assert_eq!(sub.task_from_scheduler_id(13), None);
        assert_eq!(sub.slot_name(2), "09");
    }

    #[test]
    fn test_working_directory_distribution() {
        let mut workflow = Workflow::new(
            WorkflowId(0),
            "/tmp",
            vec![CommandGroup::new(0, vec![Command::line("ls")], VarDefId(0))],
            vec![VarDefinition::with_data("d", vec!["a".into(), "b".into()])],
        );
        workflow.push_directory_values(VarDefId(0), SubmissionId(0), 0, &["a".into(), "b".into()]);

        let sub = cg_sub(6, 1, 6);
        let dirs: Vec<String> = (0..6)
            .map(|t| {
                workflow
                    .working_directory(SubmissionId(0), &sub, 0, t)
                    .unwrap()
                    .value
                    .clone()
            })
            .collect();
        assert_eq!(dirs, vec!["a", "a", "a", "b", "b", "b"]);
    }

    #[test]
    fn test_uneven_directory_counts_get_contiguous_blocks() {
        let mut sub = cg_sub(6, 1, 6);
        sub.multiplicity = Multiplicity::PerDirectory(vec![1, 1, 4]);
        let layout: Vec<_> = (0..6).map(|t| sub.task_directory(3, t).unwrap()).collect();
        assert_eq!(layout, vec![(0, 0), (1, 0), (2, 0), (2, 1), (2, 2), (2, 3)]);
        assert_eq!(sub.task_directory(3, 6), None);

        sub.multiplicity = Multiplicity::PerDirectory(vec![0, 2]);
        sub.output_count = 2;
        assert_eq!(sub.task_directory(2, 0), Some((1, 0)));

        // counts from another directory listing fall back to an even spread
        sub.multiplicity = Multiplicity::PerDirectory(vec![1, 1, 4]);
        sub.output_count = 6;
        assert_eq!(sub.task_directory(2, 4), Some((1, 1)));
    }

    #[test]
    fn test_archive_start_time_follows_link() {
        let now = Utc::now();
        let mut cgsi = CommandGroupSubmissionIteration {
            iteration: 0,
            scheduler_job_id: None,
            stats_job_id: None,
            working_dirs_written: false,
            tasks: vec![Task::new(0, true), Task::new(1, true)],
        };
        cgsi.tasks[1].archive_start_time = Some(now);
        cgsi.tasks[0].archived_task = Some(1);
        assert_eq!(cgsi.archive_start_time(0), Some(now));
        assert_eq!(cgsi.archive_end_time(0), None);
    }
}
