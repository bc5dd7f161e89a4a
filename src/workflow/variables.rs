//! Variable Resolution
//!
//! Resolves named variables to ordered value lists inside one directory.
//!
//! - Base variables read their source (static data, a regex over directory
//!   entries, or the lines of a file) and format each match through their
//!   `value` template.
//! - Derived variables embed other variables (`<<name>>`). Their dependencies
//!   are resolved first, all lists are broadcast to a common length, then the
//!   placeholders are substituted position by position.
//!
//! A base variable with nothing to read yields [`Error::UnresolvedVariable`],
//! which callers treat as "retry once more context exists".

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::debug;
use regex::Regex;
use walkdir::WalkDir;

use super::model::VarDefinition;
use crate::config::Delimiters;
use crate::error::{Error, Result};

/// Extracts variable names embedded between delimiters, without duplicates.
///
/// # Example
/// ```
/// use arrayflow::config::Delimiters;
/// use arrayflow::workflow::variables::extract_variable_names;
///
/// let names = extract_variable_names("cp <<src>> <<dst>>/<<src>>", &Delimiters::default());
/// assert_eq!(names, vec!["src", "dst"]);
/// ```
pub fn extract_variable_names(text: &str, delims: &Delimiters) -> Vec<String> {
    let (left, right) = (delims.left(), delims.right());
    let mut names: Vec<String> = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(left) {
        let after = &rest[start + left.len()..];
        let Some(end) = after.find(right) else {
            break;
        };
        let name = &after[..end];
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        rest = &after[end + right.len()..];
    }

    names
}

/// Replaces every `<<name>>` in `text` with `value`.
pub fn substitute_variable(text: &str, name: &str, value: &str, delims: &Delimiters) -> String {
    text.replace(&delims.wrap(name), value)
}

/// Formats a raw source value through a template, replacing `{}`.
pub fn format_template(template: &str, raw: &str) -> String {
    template.replace("{}", raw)
}

/// Length shared by all lists once length-1 lists are broadcast.
///
/// One distinct length is fine; two distinct lengths are fine when the
/// smaller is 1; anything else is a [`Error::MultiplicityMismatch`].
pub fn common_length(lengths: &[usize], context: &str) -> Result<usize> {
    let mut unique: Vec<usize> = lengths.to_vec();
    unique.sort_unstable();
    unique.dedup();

    match unique.as_slice() {
        [] => Ok(1),
        [len] => Ok(*len),
        [1, len] => Ok(*len),
        _ => Err(Error::mismatch(context, lengths.to_vec())),
    }
}

/// Broadcasts length-1 lists to the longest length present.
pub fn coerce_same_length(lists: Vec<Vec<String>>, context: &str) -> Result<Vec<Vec<String>>> {
    let lengths: Vec<usize> = lists.iter().map(Vec::len).collect();
    let len = common_length(&lengths, context)?;

    Ok(lists
        .into_iter()
        .map(|list| {
            if list.len() == len {
                list
            } else {
                list.iter().cycle().take(len).cloned().collect()
            }
        })
        .collect())
}

/// Reads the raw values of one definition inside `directory`.
///
/// Values are formatted through the template and sorted. Definitions with
/// no source yield their template as the single value.
pub fn get_values(definition: &VarDefinition, directory: &Path) -> Result<Vec<String>> {
    let mut values = Vec::new();

    if let Some(file_regex) = &definition.file_regex {
        let pattern = Regex::new(&file_regex.pattern)?;
        let candidates = if file_regex.is_dir {
            relative_directories(directory)
        } else {
            entry_names(directory)?
        };
        for candidate in candidates {
            if let Some(matched) = capture(&pattern, &candidate, file_regex.group) {
                values.push(format_template(&definition.value, &matched));
            }
        }
    } else if let Some(contents) = &definition.file_contents {
        match fs::read_to_string(directory.join(&contents.path)) {
            Ok(text) => values.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| format_template(&definition.value, l)),
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    } else if let Some(data) = &definition.data {
        values.extend(data.iter().map(|d| format_template(&definition.value, d)));
    } else {
        values.push(definition.value.clone());
    }

    if values.is_empty() {
        return Err(Error::UnresolvedVariable(definition.name.clone()));
    }

    values.sort();
    Ok(values)
}

/// Capture `group` of a match; a pattern without groups yields the whole match.
fn capture(pattern: &Regex, text: &str, group: usize) -> Option<String> {
    let caps = pattern.captures(text)?;
    if pattern.captures_len() == 1 {
        return caps.get(0).map(|m| m.as_str().to_string());
    }
    caps.get(group + 1).map(|m| m.as_str().to_string())
}

/// Names of the entries directly inside `directory`. A missing directory
/// has no entries.
fn entry_names(directory: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Every directory below `directory` (itself included, as `.`), as a
/// forward-slash path relative to it.
fn relative_directories(directory: &Path) -> Vec<String> {
    WalkDir::new(directory)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(directory).ok()?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            Some(if parts.is_empty() {
                ".".to_string()
            } else {
                parts.join("/")
            })
        })
        .collect()
}

/// Multiplicity a definition will have, known without touching the
/// filesystem. `None` means it depends on data that may not exist yet.
pub fn declared_multiplicity(
    definition: &VarDefinition,
    all: &[VarDefinition],
    delims: &Delimiters,
) -> Result<Option<usize>> {
    let own = if let Some(data) = &definition.data {
        Some(data.len())
    } else if let Some(file_regex) = &definition.file_regex {
        file_regex
            .subset
            .as_ref()
            .map(Vec::len)
            .or(file_regex.expected_multiplicity)
    } else if definition.file_contents.is_some() {
        None
    } else {
        Some(1)
    };
    let Some(own) = own else {
        return Ok(None);
    };

    let mut lengths = vec![own];
    for name in definition.dependencies(delims) {
        let dep = all
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
        match declared_multiplicity(dep, all, delims)? {
            Some(len) => lengths.push(len),
            None => return Ok(None),
        }
    }
    common_length(&lengths, &format!("variable '{}'", definition.name)).map(Some)
}

/// Values of one resolved variable plus the dependency values used to
/// build it (already broadcast).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedVariable {
    pub values: Vec<String>,
    pub sub_values: BTreeMap<String, Vec<String>>,
}

/// Resolves as many of `definitions` as possible inside `directory`.
///
/// Base variables that cannot be read yet, and derived variables depending
/// on them, are simply absent from the result. A derived variable whose
/// dependency is not among `definitions` is an error.
pub fn resolve_variable_values(
    definitions: &[&VarDefinition],
    directory: &Path,
    delims: &Delimiters,
) -> Result<BTreeMap<String, ResolvedVariable>> {
    let mut resolved: BTreeMap<String, ResolvedVariable> = BTreeMap::new();
    let mut unresolvable: Vec<String> = Vec::new();
    let mut pending: Vec<(&VarDefinition, Vec<String>)> = Vec::new();

    for definition in definitions {
        let deps = definition.dependencies(delims);
        if !deps.is_empty() {
            pending.push((definition, deps));
            continue;
        }
        match get_values(definition, directory) {
            Ok(values) => {
                resolved.insert(
                    definition.name.clone(),
                    ResolvedVariable {
                        values,
                        sub_values: BTreeMap::new(),
                    },
                );
            }
            Err(e) if e.is_unresolved() => unresolvable.push(definition.name.clone()),
            Err(e) => return Err(e),
        }
    }

    for (definition, deps) in &pending {
        if let Some(missing) = deps
            .iter()
            .find(|d| !definitions.iter().any(|def| &def.name == *d))
        {
            return Err(Error::UnknownVariable(format!(
                "{} (used by '{}')",
                missing, definition.name
            )));
        }
    }

    while !pending.is_empty() {
        let before = pending.len();
        let mut still_pending = Vec::new();

        for (definition, deps) in pending {
            if deps.iter().any(|d| unresolvable.contains(d)) {
                unresolvable.push(definition.name.clone());
                continue;
            }
            if !deps.iter().all(|d| resolved.contains_key(d)) {
                still_pending.push((definition, deps));
                continue;
            }

            let values = match get_values(definition, directory) {
                Ok(values) => values,
                Err(e) if e.is_unresolved() => {
                    unresolvable.push(definition.name.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut lists = vec![values];
            lists.extend(deps.iter().map(|d| resolved[d].values.clone()));
            let mut lists =
                coerce_same_length(lists, &format!("variable '{}'", definition.name))?.into_iter();
            let mut values = lists.next().unwrap_or_default();
            let sub_values: BTreeMap<String, Vec<String>> = deps.iter().cloned().zip(lists).collect();

            for (name, subs) in &sub_values {
                for (value, sub) in values.iter_mut().zip(subs) {
                    *value = substitute_variable(value, name, sub, delims);
                }
            }

            debug!("Resolved '{}' to {} value(s)", definition.name, values.len());
            resolved.insert(definition.name.clone(), ResolvedVariable { values, sub_values });
        }

        if still_pending.len() == before {
            let names = still_pending.iter().map(|(d, _)| d.name.clone()).collect();
            return Err(Error::CyclicVariables(names));
        }
        pending = still_pending;
    }

    Ok(resolved)
}
