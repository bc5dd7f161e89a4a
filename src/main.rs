//! ArrayFlow CLI Entry Point
//!
//! User commands create, submit and inspect workflows; runtime commands are
//! called by generated jobscripts while tasks run.
//!
//! # Usage
//!
//! ```bash
//! # Create a workflow from a definition
//! arrayflow make workflow.yml
//!
//! # Submit it (all tasks, or a slot range of the first scheduler group)
//! arrayflow submit 0
//! arrayflow submit 0 --task-range 1-10:2
//!
//! # Task statistics
//! arrayflow stats 0 --show-end
//! arrayflow stats --json stats.json
//!
//! # Cancel every job of a workflow
//! arrayflow kill 0
//!
//! # Runtime commands (from jobscripts)
//! arrayflow write-runtime-files -d $ROOT_DIR 7 $TASK_IDX $ITER_IDX
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use arrayflow::workflow::model::{CommandGroupSubmissionId, WorkflowId};
use arrayflow::{load_definition, Config, Engine, Project, TaskRange, APP_NAME, VERSION};

/// Commands called by jobscripts with `<cg-sub-id> <task> <iteration>`.
const RUNTIME_COMMANDS: &[&str] = &[
    "write-runtime-files",
    "set-task-start",
    "set-task-end",
    "archive",
    "scrape-stats",
];

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct CliConfig {
    command: Option<String>,
    args: Vec<String>,
    dir: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    task_range: Option<String>,
    json_path: Option<PathBuf>,
    show_end: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Multi-stage job-array workflows");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: arrayflow [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  make <DEFINITION>          Create a workflow from a YAML/JSON definition");
    println!("  submit <WORKFLOW_ID>       Write jobscripts and submit them");
    println!("  kill <WORKFLOW_ID>         Cancel every scheduler job of a workflow");
    println!("  stats [WORKFLOW_ID]        Show task statistics");
    println!("  root-archive <WORKFLOW_ID> Copy the workflow directory to its root archive");
    println!("  clean                      Remove the project data directory");
    println!();
    println!("Runtime commands (called by jobscripts):");
    for command in RUNTIME_COMMANDS {
        println!("  {:<26} <CG_SUB_ID> <TASK_IDX> <ITER_IDX>", command);
    }
    println!();
    println!("Options:");
    println!("  -d, --dir PATH        Project directory (default: current directory)");
    println!("  --config-dir PATH     Configuration directory (default: $ARRAYFLOW_CONFIG_DIR or ~/.arrayflow)");
    println!("  --task-range RANGE    Slots to submit: all, n-m or n-m:s (submit)");
    println!("  --json PATH           Save statistics as JSON (stats)");
    println!("  --show-end            Include task end times (stats)");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  arrayflow make workflow.yml");
    println!("  arrayflow submit 0 --task-range 1-4");
    println!("  arrayflow -d /data/analysis stats 0");
}

fn option_value(args: &[String], i: usize, option: &str) -> Result<String, String> {
    args.get(i)
        .cloned()
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Parses command-line arguments into a CliConfig struct.
fn parse_arguments(args: &[String]) -> Result<CliConfig, String> {
    let mut config = CliConfig::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--show-end" => {
                config.show_end = true;
            }
            "--dir" | "-d" => {
                i += 1;
                config.dir = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--config-dir" => {
                i += 1;
                config.config_dir = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--task-range" => {
                i += 1;
                config.task_range = Some(option_value(args, i, arg)?);
            }
            "--json" => {
                i += 1;
                config.json_path = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.command.is_none() {
                    config.command = Some(arg.clone());
                } else {
                    config.args.push(arg.clone());
                }
            }
        }
        i += 1;
    }

    Ok(config)
}

fn parse_index(value: &str, what: &str) -> Result<usize, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {}: {}", what, value))
}

/// The single positional argument of a command.
fn single_arg<'a>(cli: &'a CliConfig, name: &str) -> Result<&'a str, String> {
    match cli.args.as_slice() {
        [value] => Ok(value),
        _ => Err(format!("expected exactly one argument: <{}>", name)),
    }
}

/// `<cg-sub-id> <task> <iteration>` of a runtime command.
fn runtime_args(cli: &CliConfig) -> Result<(CommandGroupSubmissionId, usize, usize), String> {
    match cli.args.as_slice() {
        [id, task, iteration] => Ok((
            CommandGroupSubmissionId(parse_index(id, "command group submission id")? as u64),
            parse_index(task, "task index")?,
            parse_index(iteration, "iteration index")?,
        )),
        _ => Err("expected <CG_SUB_ID> <TASK_IDX> <ITER_IDX>".to_string()),
    }
}

fn run_runtime_command(engine: &Engine, command: &str, cli: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (id, task, iteration) = runtime_args(cli)?;
    let runtime = engine.runtime();
    match command {
        "write-runtime-files" => runtime.write_runtime_files(id, task, iteration)?,
        "set-task-start" => runtime.set_task_start(id, task, iteration)?,
        "set-task-end" => runtime.set_task_end(id, task, iteration)?,
        "archive" => runtime.archive_task(id, task, iteration)?,
        "scrape-stats" => runtime.scrape_task_stats(id, task, iteration)?,
        other => return Err(format!("Unknown command: {}", other).into()),
    }
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);

    let Some(command) = cli.command.clone() else {
        print_usage();
        return Err("no command given".into());
    };

    let config_dir = cli.config_dir.clone().unwrap_or_else(Config::config_dir_from_env);
    let config = Config::load(&config_dir)?;
    let root = match &cli.dir {
        Some(dir) if !dir.is_dir() => {
            return Err(format!("Project directory does not exist: {}", dir.display()).into());
        }
        Some(dir) => dir.clone(),
        None => env::current_dir()?,
    };

    if RUNTIME_COMMANDS.contains(&command.as_str()) {
        let engine = Engine::open(&root, &config)?;
        return run_runtime_command(&engine, &command, &cli);
    }

    print_banner();
    info!("Project directory: {}", root.display());

    match command.as_str() {
        "make" => {
            let path = single_arg(&cli, "DEFINITION")?;
            let definition = load_definition(path).map_err(|e| {
                error!("Failed to load definition: {}", e);
                format!("Could not load workflow definition from '{}': {}", path, e)
            })?;
            let engine = Engine::open(&root, &config)?;
            let id = engine.make_workflow(&definition)?;
            println!("{} workflow {}", "Created".green(), id);
        }
        "submit" => {
            let id = WorkflowId(parse_index(single_arg(&cli, "WORKFLOW_ID")?, "workflow id")?);
            let range = match &cli.task_range {
                Some(text) => TaskRange::parse(text)?,
                None => TaskRange::default(),
            };
            let engine = Engine::open(&root, &config)?;
            let submission = engine.submit_workflow(id, range)?;
            println!("{} workflow {} (submission {})", "Submitted".green(), id, submission);
        }
        "kill" => {
            let id = WorkflowId(parse_index(single_arg(&cli, "WORKFLOW_ID")?, "workflow id")?);
            Engine::open(&root, &config)?.kill(id)?;
            println!("{} jobs of workflow {}", "Cancelled".yellow(), id);
        }
        "root-archive" => {
            let id = WorkflowId(parse_index(single_arg(&cli, "WORKFLOW_ID")?, "workflow id")?);
            let engine = Engine::open(&root, &config)?;
            if !engine.runtime().root_archive(id)? {
                println!("Workflow {} has no root archive", id);
            }
        }
        "stats" => {
            let id = match cli.args.as_slice() {
                [] => None,
                [value] => Some(WorkflowId(parse_index(value, "workflow id")?)),
                _ => return Err("expected at most one argument: [WORKFLOW_ID]".into()),
            };
            let engine = Engine::open(&root, &config)?;
            match &cli.json_path {
                Some(path) => {
                    engine.save_stats(id, path)?;
                    println!("Saved statistics to {}", path.display());
                }
                None => println!("{}", engine.formatted_stats(id, cli.show_end)?),
            }
        }
        "clean" => {
            Project::new(&root, &config).clean()?;
            println!("{} {}", "Removed".yellow(), root.join(&config.data_dir_name).display());
        }
        other => return Err(format!("Unknown command: {}", other).into()),
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        std::iter::once("arrayflow")
            .chain(items.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_submit() {
        let cli = parse_arguments(&args(&["-d", "/work", "submit", "0", "--task-range", "1-4"])).unwrap();
        assert_eq!(cli.command.as_deref(), Some("submit"));
        assert_eq!(cli.args, vec!["0"]);
        assert_eq!(cli.dir, Some(PathBuf::from("/work")));
        assert_eq!(cli.task_range.as_deref(), Some("1-4"));
    }

    #[test]
    fn test_parse_runtime_command() {
        let cli = parse_arguments(&args(&["write-runtime-files", "-d", "/work", "7", "2", "0"])).unwrap();
        assert_eq!(
            runtime_args(&cli).unwrap(),
            (CommandGroupSubmissionId(7), 2, 0)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["--dir"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());

        let cli = parse_arguments(&args(&["set-task-end", "7", "x", "0"])).unwrap();
        assert!(runtime_args(&cli).is_err());
    }
}
