//! Command File Rendering
//!
//! A command file is sourced by the jobscript of its command group. It
//! reads one row of variable values per loop pass, one file descriptor per
//! variable file, and runs the group's commands with `<<name>>` replaced by
//! the shell variable `${name}`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::workflow::model::{Command, CommandGroup, ParallelMode};
use crate::workflow::variables::substitute_variable;

/// First file descriptor used for variable files (0-2 are taken).
const FIRST_FD: usize = 3;

/// Inputs needed to render one command file.
#[derive(Debug, Clone)]
pub struct CommandFile<'a> {
    pub group: &'a CommandGroup,
    pub parallel_modes: &'a BTreeMap<String, ParallelMode>,
    /// Variables read per loop pass, in file descriptor order.
    pub variable_names: &'a [String],
    pub scheduler_group: usize,
    pub max_num_tasks: usize,
}

impl<'a> CommandFile<'a> {
    /// Renders the file contents.
    pub fn render(&self, config: &Config, generated: DateTime<Utc>) -> Result<String> {
        let mut lines: Vec<String> = vec![
            format!(
                "# --- commands file generated by `{}` (version: {}) on {} ---",
                config.executable,
                crate::VERSION,
                generated.format("%Y.%m.%d at %H:%M:%S")
            ),
            String::new(),
        ];

        let mut env_lines = Vec::new();
        for mode in self.group.parallel_modes() {
            let mode = self
                .parallel_modes
                .get(&mode)
                .ok_or_else(|| Error::Validation(format!("unknown parallel mode '{}'", mode)))?;
            env_lines.extend(mode.env.iter().cloned());
        }
        if !env_lines.is_empty() {
            lines.extend(env_lines);
            lines.push(String::new());
        }

        if self.variable_names.is_empty() {
            for command in &self.group.commands {
                self.render_command(command, 0, config, &mut lines)?;
            }
            lines.push(String::new());
            return Ok(lines.join("\n"));
        }

        lines.push(format!("MAX_NUM_TASKS={}", self.max_num_tasks));
        lines.push("MAX_NUM_DIGITS=\"${#MAX_NUM_TASKS}\"".to_string());
        lines.push(format!(
            "ZEROPAD_TASK_ID=$(printf \"%0${{MAX_NUM_DIGITS}}d\" ${})",
            config.task_id_env_var
        ));
        lines.push(String::new());
        lines.push("while true".to_string());
        lines.push("do".to_string());

        for (idx, name) in self.variable_names.iter().enumerate() {
            lines.push(format!("\tread -u{} {} || break", FIRST_FD + idx, name));
        }
        lines.push(String::new());

        for command in &self.group.commands {
            self.render_command(command, 1, config, &mut lines)?;
        }
        lines.push(String::new());
        lines.push("done \\".to_string());

        let last = self.variable_names.len() - 1;
        for (idx, name) in self.variable_names.iter().enumerate() {
            let path = format!(
                "$SUBMIT_DIR/scheduler_group_{}/var_values/${}/$ZEROPAD_TASK_ID/var_{}{}",
                self.scheduler_group, config.iteration_env_var, name, config.variable_file_ext
            );
            let cont = if idx == last { "" } else { " \\" };
            lines.push(format!("\t{}< {}{}", FIRST_FD + idx, path, cont));
        }
        lines.push(String::new());

        Ok(lines.join("\n"))
    }

    fn render_command(
        &self,
        command: &Command,
        depth: usize,
        config: &Config,
        lines: &mut Vec<String>,
    ) -> Result<()> {
        let indent = "\t".repeat(depth);
        match command {
            Command::Line {
                line,
                parallel_mode,
            } => {
                let mut text = line.clone();
                for name in self.variable_names {
                    text = substitute_variable(
                        &text,
                        name,
                        &format!("${{{}}}", name),
                        &config.variable_delimiters,
                    );
                }
                match parallel_mode {
                    Some(mode) => {
                        let mode = self.parallel_modes.get(mode).ok_or_else(|| {
                            Error::Validation(format!("unknown parallel mode '{}'", mode))
                        })?;
                        lines.push(format!("{}{} {}", indent, mode.command, text));
                    }
                    None => lines.push(format!("{}{}", indent, text)),
                }
            }
            Command::Subshell { subshell } => {
                lines.push(format!("{}(", indent));
                for child in subshell {
                    self.render_command(child, depth + 1, config, lines)?;
                }
                lines.push(format!("{})", indent));
            }
        }
        Ok(())
    }
}

/// Writes a rendered command file.
pub fn write_command_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    debug!("Wrote command file {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::VarDefId;
    use tempfile::tempdir;

    fn render(group: &CommandGroup, modes: &BTreeMap<String, ParallelMode>, names: &[String]) -> String {
        CommandFile {
            group,
            parallel_modes: modes,
            variable_names: names,
            scheduler_group: 1,
            max_num_tasks: 12,
        }
        .render(&Config::default(), Utc::now())
        .unwrap()
    }

    #[test]
    fn test_render_with_variables() {
        let group = CommandGroup::new(
            0,
            vec![Command::line("solve <<infile>> --n <<n>>")],
            VarDefId(0),
        );
        let names = vec!["infile".to_string(), "n".to_string()];
        let text = render(&group, &BTreeMap::new(), &names);

        assert!(text.contains("MAX_NUM_TASKS=12"));
        assert!(text.contains("ZEROPAD_TASK_ID=$(printf \"%0${MAX_NUM_DIGITS}d\" $SGE_TASK_ID)"));
        assert!(text.contains("\tread -u3 infile || break"));
        assert!(text.contains("\tread -u4 n || break"));
        assert!(text.contains("\tsolve ${infile} --n ${n}"));
        assert!(text.contains(
            "\t3< $SUBMIT_DIR/scheduler_group_1/var_values/$ITER_IDX/$ZEROPAD_TASK_ID/var_infile.txt \\"
        ));
        assert!(text.contains(
            "\t4< $SUBMIT_DIR/scheduler_group_1/var_values/$ITER_IDX/$ZEROPAD_TASK_ID/var_n.txt\n"
        ));
        assert!(text.contains("done \\\n"));
    }

    #[test]
    fn test_render_without_variables() {
        let group = CommandGroup::new(0, vec![Command::line("echo done")], VarDefId(0));
        let text = render(&group, &BTreeMap::new(), &[]);
        assert!(!text.contains("while true"));
        assert!(!text.contains("MAX_NUM_TASKS"));
        assert!(text.contains("\necho done\n"));
    }

    #[test]
    fn test_render_parallel_mode_and_subshell() {
        let group = CommandGroup::new(
            0,
            vec![
                Command::parallel("solver <<x>>", "mpi"),
                Command::subshell(vec![Command::line("cd post"), Command::line("plot <<x>>")]),
            ],
            VarDefId(0),
        );
        let mut modes = BTreeMap::new();
        modes.insert(
            "mpi".to_string(),
            ParallelMode {
                env: vec!["module load mpi".to_string()],
                command: "mpirun -np $NSLOTS".to_string(),
            },
        );
        let names = vec!["x".to_string()];
        let text = render(&group, &modes, &names);

        assert!(text.contains("module load mpi\n"));
        assert!(text.contains("\tmpirun -np $NSLOTS solver ${x}"));
        assert!(text.contains("\t(\n\t\tcd post\n\t\tplot ${x}\n\t)"));
    }

    #[test]
    fn test_unknown_parallel_mode_fails() {
        let group = CommandGroup::new(0, vec![Command::parallel("run", "gpu")], VarDefId(0));
        let result = CommandFile {
            group: &group,
            parallel_modes: &BTreeMap::new(),
            variable_names: &[],
            scheduler_group: 0,
            max_num_tasks: 1,
        }
        .render(&Config::default(), Utc::now());
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_write_command_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("submit/cmd_0.sh");
        write_command_file(&path, "echo hi\n").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "echo hi\n");
    }
}
