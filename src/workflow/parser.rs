//! Workflow Parser
//!
//! Loads workflow definitions from YAML (or JSON) and builds the persistent
//! [`Workflow`] from them.
//!
//! Command group directories are stored internally as variables. A
//! directory that is exactly one variable reference uses that variable; a
//! literal path, a missing directory or a path embedding one variable gets a
//! generated variable of its own.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::{
    command_list, scalar_list, Archive, Command, CommandGroup, FileContents, FileRegex, LoopSpec,
    Nesting, ParallelMode, VarDefId, VarDefinition, Workflow, WorkflowId,
};
use super::validator::{assign_exec_orders, validate_workflow, ValidationError};
use super::variables::extract_variable_names;
use crate::archive::{archive_directory_name, ArchiveBackend};
use crate::config::{Config, Delimiters};
use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

/// One command group as written by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandGroupDefinition {
    #[serde(deserialize_with = "command_list")]
    pub commands: Vec<Command>,

    /// Working directory; a path, a path embedding one variable, or omitted
    /// for the workflow root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_order: Option<usize>,

    #[serde(default)]
    pub nesting: Nesting,

    #[serde(default = "default_true", alias = "job_array")]
    pub is_job_array: bool,

    #[serde(default, alias = "archive_idx", skip_serializing_if = "Option::is_none")]
    pub archive: Option<usize>,

    #[serde(default)]
    pub archive_excludes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate_scratch: Option<PathBuf>,

    /// Environment modules, loaded in sorted order before the commands.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Extra shell lines run before the commands.
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

impl CommandGroupDefinition {
    pub fn new(commands: Vec<Command>) -> Self {
        Self {
            commands,
            directory: None,
            exec_order: None,
            nesting: Nesting::None,
            is_job_array: true,
            archive: None,
            archive_excludes: Vec::new(),
            alternate_scratch: None,
            modules: Vec::new(),
            environment: Vec::new(),
            scheduler_options: BTreeMap::new(),
            output_dir: None,
            error_dir: None,
            stats: false,
            job_name: None,
        }
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_nesting(mut self, nesting: Nesting) -> Self {
        self.nesting = nesting;
        self
    }

    pub fn with_job_array(mut self, is_job_array: bool) -> Self {
        self.is_job_array = is_job_array;
        self
    }
}

/// A variable as written by the user; its name is the map key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, deserialize_with = "scalar_list", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_regex: Option<FileRegex>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_contents: Option<FileContents>,
}

impl VariableDefinition {
    fn into_definition(self, name: &str) -> VarDefinition {
        let mut def = VarDefinition::literal(name, self.value.unwrap_or_else(|| "{}".to_string()));
        def.data = self.data;
        def.file_regex = self.file_regex;
        def.file_contents = self.file_contents;
        def
    }
}

/// A complete workflow definition file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub command_groups: Vec<CommandGroupDefinition>,

    #[serde(default)]
    pub variables: BTreeMap<String, VariableDefinition>,

    #[serde(default)]
    pub archives: Vec<Archive>,

    /// Index into `archives` receiving a copy of the whole workflow
    /// directory when the workflow is made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_archive: Option<usize>,

    #[serde(default)]
    pub root_archive_excludes: Vec<String>,

    #[serde(default, rename = "loop")]
    pub loop_spec: LoopSpec,

    #[serde(default)]
    pub parallel_modes: BTreeMap<String, ParallelMode>,

    /// Shell commands run once when the workflow is made.
    #[serde(default)]
    pub pre_commands: Vec<String>,
}

/// Loads a definition file; `.json` files are read as JSON, anything else
/// as YAML.
///
/// # Example
///
/// ```rust,no_run
/// use arrayflow::workflow::parser::load_definition;
///
/// fn main() -> arrayflow::Result<()> {
///     let definition = load_definition("workflow.yml")?;
///     println!("{} command group(s)", definition.command_groups.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow definition from: {}", path.display());

    let content = fs::read_to_string(path)?;
    debug!("Definition loaded ({} bytes)", content.len());

    let is_json = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        Ok(serde_json::from_str(&content)?)
    } else {
        parse_definition(&content)
    }
}

/// Parses a YAML definition.
pub fn parse_definition(content: &str) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = serde_yaml::from_str(content)?;
    info!(
        "Parsed {} command group(s), {} variable(s)",
        definition.command_groups.len(),
        definition.variables.len()
    );
    Ok(definition)
}

/// Turns a group's `directory` into the id of its directory variable,
/// adding a generated definition when needed.
fn directory_variable(
    directory: Option<&str>,
    exec_order: usize,
    definitions: &mut Vec<VarDefinition>,
    config: &Config,
) -> Result<VarDefId> {
    let delims: &Delimiters = &config.variable_delimiters;
    let text = directory.map(str::trim).filter(|d| !d.is_empty()).unwrap_or(".");
    let names = extract_variable_names(text, delims);

    if names.len() > 1 {
        return Err(ValidationError::MultipleDirectoryVariables {
            group: exec_order,
            names,
        }
        .into());
    }

    if let [name] = names.as_slice() {
        if text == delims.wrap(name) {
            return definitions
                .iter()
                .position(|d| &d.name == name)
                .map(VarDefId)
                .ok_or_else(|| Error::UnknownVariable(name.clone()));
        }
    }

    let generated = format!("{}_{}", config.default_directory_var_name, exec_order);
    debug!(
        "Command group {} directory '{}' stored as variable '{}'",
        exec_order, text, generated
    );
    definitions.push(VarDefinition::literal(generated, text));
    Ok(VarDefId(definitions.len() - 1))
}

/// Builds and validates a workflow from its definition.
///
/// Archive directory names are chosen here, once, by asking `backend`
/// which names are taken.
pub fn build_workflow(
    definition: &WorkflowDefinition,
    id: WorkflowId,
    root: &Path,
    config: &Config,
    backend: &dyn ArchiveBackend,
    now: DateTime<Utc>,
) -> Result<Workflow> {
    let given: Vec<Option<usize>> = definition.command_groups.iter().map(|g| g.exec_order).collect();
    let exec_orders = assign_exec_orders(&given)?;

    let mut var_definitions: Vec<VarDefinition> = definition
        .variables
        .iter()
        .map(|(name, def)| def.clone().into_definition(name))
        .collect();

    let mut command_groups = Vec::with_capacity(definition.command_groups.len());
    for (group_def, exec_order) in definition.command_groups.iter().zip(exec_orders) {
        let directory_var = directory_variable(
            group_def.directory.as_deref(),
            exec_order,
            &mut var_definitions,
            config,
        )?;

        let mut environment: Vec<String> = {
            let mut modules = group_def.modules.clone();
            modules.sort();
            modules.into_iter().map(|m| format!("module load {}", m)).collect()
        };
        environment.extend(group_def.environment.iter().cloned());

        let mut group = CommandGroup::new(exec_order, group_def.commands.clone(), directory_var)
            .with_nesting(group_def.nesting)
            .with_job_array(group_def.is_job_array);
        group.archive = group_def.archive;
        group.archive_excludes = group_def.archive_excludes.clone();
        group.alternate_scratch = group_def.alternate_scratch.clone();
        group.environment = environment;
        group.scheduler_options = group_def.scheduler_options.clone();
        group.output_dir = group_def.output_dir.clone();
        group.error_dir = group_def.error_dir.clone();
        group.stats = group_def.stats;
        group.job_name = group_def.job_name.clone();
        command_groups.push(group);
    }
    command_groups.sort_by_key(|g| g.exec_order);

    if let Some(idx) = definition.root_archive {
        if idx >= definition.archives.len() {
            return Err(Error::Validation(format!(
                "root_archive refers to unknown archive {}",
                idx
            )));
        }
    }

    let mut workflow = Workflow::new(id, root, command_groups, var_definitions)
        .with_loop(definition.loop_spec.clone());
    workflow.created = now;
    workflow.parallel_modes = definition.parallel_modes.clone();
    workflow.root_archive = definition.root_archive;
    workflow.root_archive_excludes = definition.root_archive_excludes.clone();
    workflow.archives = definition.archives.clone();

    validate_workflow(&workflow, &config.variable_delimiters)?;

    for archive in &mut workflow.archives {
        archive.root_directory = archive_directory_name(archive, root, backend, now)?;
    }

    info!(
        "Built workflow {} with {} command group(s)",
        workflow.id,
        workflow.command_groups.len()
    );
    Ok(workflow)
}

/// Saves a definition as YAML.
pub fn save_definition(definition: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<()> {
    let yaml_content = serde_yaml::to_string(definition)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Definition saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::LocalBackend;
    use crate::workflow::model::RootDirectoryName;
    use tempfile::tempdir;

    const FULL_YAML: &str = r#"
pre_commands:
  - mkdir -p results
variables:
  sample:
    data: [a, b, c]
  infile:
    value: "<<sample>>.in"
  run_dir:
    file_regex:
      pattern: '^(run_\d+)$'
      is_dir: true
parallel_modes:
  mpi:
    command: mpirun -np $NSLOTS
loop:
  max_iterations: 2
  groups: [1]
command_groups:
  - commands:
      - prepare <<infile>>
    directory: <<run_dir>>
  - commands:
      - line: solve
        parallel_mode: mpi
    directory: results
    nesting: hold
    job_array: false
    modules: [python, gcc]
    scheduler_options:
      pe: smp.pe 4
"#;

    fn build(definition: &WorkflowDefinition, root: &Path) -> Result<Workflow> {
        build_workflow(
            definition,
            WorkflowId(0),
            root,
            &Config::default(),
            &LocalBackend::new(),
            Utc::now(),
        )
    }

    #[test]
    fn test_parse_full_definition() {
        let definition = parse_definition(FULL_YAML).unwrap();
        assert_eq!(definition.command_groups.len(), 2);
        assert_eq!(definition.variables.len(), 3);
        assert_eq!(definition.loop_spec.max_iterations, 2);
        assert_eq!(definition.pre_commands, vec!["mkdir -p results"]);

        let second = &definition.command_groups[1];
        assert_eq!(second.nesting, Nesting::Hold);
        assert!(!second.is_job_array);
        assert_eq!(second.commands[0], Command::parallel("solve", "mpi"));
        assert_eq!(second.scheduler_options["pe"], "smp.pe 4");
    }

    #[test]
    fn test_build_workflow_normalises_directories() {
        let dir = tempdir().unwrap();
        let definition = parse_definition(FULL_YAML).unwrap();
        let workflow = build(&definition, dir.path()).unwrap();

        let first = &workflow.command_groups[0];
        assert_eq!(workflow.var_definition(first.directory_var).name, "run_dir");

        let second = &workflow.command_groups[1];
        let generated = workflow.var_definition(second.directory_var);
        assert_eq!(generated.name, "__cmd_group_directory_1");
        assert_eq!(generated.value, "results");
        assert_eq!(second.environment, vec!["module load gcc", "module load python"]);
        assert_eq!(workflow.iterations.len(), 2);
    }

    #[test]
    fn test_missing_directory_is_root() {
        let dir = tempdir().unwrap();
        let definition = WorkflowDefinition {
            command_groups: vec![CommandGroupDefinition::new(vec![Command::line("ls")])],
            ..Default::default()
        };
        let workflow = build(&definition, dir.path()).unwrap();
        let def = workflow.var_definition(workflow.command_groups[0].directory_var);
        assert_eq!(def.value, ".");
    }

    #[test]
    fn test_embedded_directory_variable_is_derived() {
        let dir = tempdir().unwrap();
        let mut definition = WorkflowDefinition {
            command_groups: vec![CommandGroupDefinition::new(vec![Command::line("ls")])
                .with_directory("<<sample>>/out")],
            ..Default::default()
        };
        definition.variables.insert(
            "sample".into(),
            VariableDefinition {
                data: Some(vec!["x".into()]),
                ..Default::default()
            },
        );

        let workflow = build(&definition, dir.path()).unwrap();
        let def = workflow.var_definition(workflow.command_groups[0].directory_var);
        assert_eq!(def.name, "__cmd_group_directory_0");
        assert_eq!(def.dependencies(&Delimiters::default()), vec!["sample"]);
    }

    #[test]
    fn test_directory_with_two_variables_rejected() {
        let dir = tempdir().unwrap();
        let definition = WorkflowDefinition {
            command_groups: vec![CommandGroupDefinition::new(vec![Command::line("ls")])
                .with_directory("<<a>>/<<b>>")],
            ..Default::default()
        };
        let err = build(&definition, dir.path()).unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("more than one variable")));
    }

    #[test]
    fn test_exec_orders_sorted() {
        let dir = tempdir().unwrap();
        let mut later = CommandGroupDefinition::new(vec![Command::line("second")]);
        later.exec_order = Some(1);
        let mut earlier = CommandGroupDefinition::new(vec![Command::line("first")]);
        earlier.exec_order = Some(0);

        let definition = WorkflowDefinition {
            command_groups: vec![later, earlier],
            ..Default::default()
        };
        let workflow = build(&definition, dir.path()).unwrap();
        assert_eq!(workflow.command_groups[0].commands[0], Command::line("first"));
        assert_eq!(workflow.command_groups[1].exec_order, 1);
    }

    #[test]
    fn test_archive_directory_resolved_once() {
        let work = tempdir().unwrap();
        let archive_root = tempdir().unwrap();
        let root = work.path().join("run");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(archive_root.path().join("run")).unwrap();

        let mut group = CommandGroupDefinition::new(vec![Command::line("ls")]);
        group.archive = Some(0);
        let definition = WorkflowDefinition {
            command_groups: vec![group],
            archives: vec![Archive::new("backup", archive_root.path())
                .with_root_directory_name(RootDirectoryName::Parent, true)],
            root_archive: Some(0),
            ..Default::default()
        };

        let workflow = build(&definition, &root).unwrap();
        assert_eq!(workflow.archives[0].root_directory.as_deref(), Some("run_1"));
        assert_eq!(workflow.archives[0].destination(), archive_root.path().join("run_1"));
    }

    #[test]
    fn test_root_archive_out_of_range() {
        let dir = tempdir().unwrap();
        let definition = WorkflowDefinition {
            command_groups: vec![CommandGroupDefinition::new(vec![Command::line("ls")])],
            root_archive: Some(2),
            ..Default::default()
        };
        assert!(build(&definition, dir.path()).is_err());
    }

    #[test]
    fn test_load_definition_json_and_yaml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("wf.json");
        fs::write(&json_path, r#"{"command_groups": [{"commands": ["echo hi"]}]}"#).unwrap();
        let definition = load_definition(&json_path).unwrap();
        assert_eq!(definition.command_groups[0].commands[0], Command::line("echo hi"));

        let yaml_path = dir.path().join("wf.yml");
        save_definition(&definition, &yaml_path).unwrap();
        let reloaded = load_definition(&yaml_path).unwrap();
        assert_eq!(reloaded, definition);
    }

    #[test]
    fn test_load_definition_errors() {
        assert!(load_definition("/nonexistent/workflow.yml").is_err());

        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.yml");
        fs::write(&bad, "this is not valid yaml: [[[").unwrap();
        assert!(load_definition(&bad).is_err());
    }
}
