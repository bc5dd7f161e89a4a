//! Archiving
//!
//! Copies working directories to an archive location once tasks finish.
//!
//! - [`archive_directory_name`] picks the per-workflow directory inside the
//!   archive root, once, when the workflow is made
//! - [`is_archive_required`] skips a task whose output a sibling sharing the
//!   same working directory has already started archiving
//! - [`execute_with_lock`] serialises copies of one directory through a
//!   lease; backend failures are logged and never leave the lease held

pub mod backend;
pub mod glob;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::store::{acquire_lease, LeaseKey, RetryPolicy, Store};
use crate::workflow::model::{Archive, CommandGroupSubmissionIteration, RootDirectoryName};

pub use backend::{ArchiveBackend, LocalBackend};

/// Suffixes tried (`_1` .. `_10`) when the directory name is taken.
pub const MAX_INCREMENT_ATTEMPTS: usize = 10;

/// Chooses the directory inside the archive root for one workflow.
///
/// `None` means archive straight into the root.
pub fn archive_directory_name(
    archive: &Archive,
    workflow_root: &Path,
    backend: &dyn ArchiveBackend,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let base = match archive.root_directory_name {
        RootDirectoryName::None => return Ok(None),
        RootDirectoryName::Parent => workflow_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "workflow directory {} has no name to archive under",
                    workflow_root.display()
                ))
            })?,
        RootDirectoryName::Datetime => now.format("%Y-%m-%d-%H%M%S").to_string(),
    };

    let candidate = archive.path.join(&base);
    if !backend.directory_exists(&candidate)? {
        debug!("Archive '{}' uses directory {}", archive.name, base);
        return Ok(Some(base));
    }
    if !archive.root_directory_increment {
        return Err(Error::ArchiveDirExists(candidate));
    }

    for attempt in 1..=MAX_INCREMENT_ATTEMPTS {
        let name = format!("{}_{}", base, attempt);
        if !backend.directory_exists(&archive.path.join(&name))? {
            info!("Archive '{}': {} exists, using {}", archive.name, base, name);
            return Ok(Some(name));
        }
    }

    Err(Error::ArchiveDirExhausted {
        base,
        attempts: MAX_INCREMENT_ATTEMPTS,
    })
}

/// Decides whether `task` must archive its working directory.
///
/// `siblings` are the order ids of tasks in the same iteration sharing the
/// task's working directory. Returns the sibling whose archive started after
/// this task ended (and so already covers it), or `None` when archiving is
/// required.
pub fn is_archive_required(
    cgsi: &CommandGroupSubmissionIteration,
    task: usize,
    siblings: &[usize],
) -> Result<Option<usize>> {
    let end_time = cgsi
        .tasks
        .get(task)
        .ok_or_else(|| Error::NotFound(format!("task {}", task)))?
        .end_time
        .ok_or_else(|| {
            Error::Validation(format!(
                "task {} has no end time; cannot decide whether to archive",
                task
            ))
        })?;

    for &sibling in siblings {
        if sibling == task {
            continue;
        }
        if let Some(started) = cgsi.archive_start_time(sibling) {
            if started > end_time {
                debug!(
                    "Task {} archive covered by task {} (started {})",
                    task, sibling, started
                );
                return Ok(Some(sibling));
            }
        }
    }
    Ok(None)
}

/// One directory copy guarded by a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub key: LeaseKey,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub excludes: Vec<String>,
}

/// Copies one directory while holding its archive lease.
///
/// Waits (sleeping) while another task archives the same directory. Errors
/// from the backend are logged; the lease is released in every case.
/// Returns whether the copy succeeded.
pub fn execute_with_lock(
    store: &dyn Store,
    backend: &dyn ArchiveBackend,
    retry: &RetryPolicy,
    request: &ArchiveRequest,
) -> Result<bool> {
    let guard = acquire_lease(store, request.key.clone(), retry, "archive")?;

    let copied = match backend.upload(&request.source, &request.destination, &request.excludes) {
        Ok(()) => {
            info!(
                "Archived {} to {}",
                request.source.display(),
                request.destination.display()
            );
            true
        }
        Err(e) => {
            error!("Archive of {} failed: {}", request.source.display(), e);
            false
        }
    };

    guard.release()?;
    Ok(copied)
}
