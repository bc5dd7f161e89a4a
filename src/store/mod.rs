//! Persistence
//!
//! The shared store is the only thing concurrently running task processes
//! have in common. It offers:
//! - Snapshot reads and optimistic commits of the whole [`Database`]
//!   (a moved revision is a `Conflict`, contention is `Busy`)
//! - Leases: insert-unique keys used as mutexes
//!
//! [`transact`] and [`acquire_lease_unless`] are the explicit retry loops
//! built on top of those two primitives.

pub mod file;
pub mod memory;
pub mod retry;

use std::fmt;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::workflow::model::{
    CommandGroupSubmission, CommandGroupSubmissionId, Submission, SubmissionId, VarValueId, Workflow,
    WorkflowId,
};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Someone else committed (or inserted) first.
    #[error("concurrent modification")]
    Conflict,

    /// The store is locked by another writer.
    #[error("store is busy")]
    Busy,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store data: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Conflict and Busy are handled by sleeping and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::Busy)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Keys of the two kinds of mutual exclusion in the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeaseKey {
    /// Held while writing a command group submission's runtime files.
    CommandWriting(CommandGroupSubmissionId),
    /// Held while a working directory is copied to an archive.
    ArchiveDirectory {
        workflow: WorkflowId,
        archive: usize,
        directory: VarValueId,
    },
    /// Held while the whole workflow directory is copied to an archive.
    RootArchive { workflow: WorkflowId, archive: usize },
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandWriting(id) => write!(f, "command-writing-{}", id),
            Self::ArchiveDirectory {
                workflow,
                archive,
                directory,
            } => write!(f, "archive-{}-{}-{}", workflow, archive, directory),
            Self::RootArchive { workflow, archive } => {
                write!(f, "root-archive-{}-{}", workflow, archive)
            }
        }
    }
}

/// Everything the store holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub revision: u64,
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    next_command_group_submission_id: u64,
}

/// Position of a command group submission inside the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandGroupSubmissionLocation {
    pub workflow: WorkflowId,
    pub submission: SubmissionId,
    pub index: usize,
}

impl Database {
    pub fn next_workflow_id(&self) -> WorkflowId {
        WorkflowId(self.workflows.len())
    }

    pub fn allocate_command_group_submission_id(&mut self) -> CommandGroupSubmissionId {
        self.next_command_group_submission_id += 1;
        CommandGroupSubmissionId(self.next_command_group_submission_id)
    }

    pub fn workflow(&self, id: WorkflowId) -> Result<&Workflow> {
        self.workflows
            .get(id.0)
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))
    }

    pub fn workflow_mut(&mut self, id: WorkflowId) -> Result<&mut Workflow> {
        self.workflows
            .get_mut(id.0)
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))
    }

    pub fn locate(&self, id: CommandGroupSubmissionId) -> Result<CommandGroupSubmissionLocation> {
        for workflow in &self.workflows {
            for submission in &workflow.submissions {
                if let Some(index) = submission
                    .command_group_submissions
                    .iter()
                    .position(|c| c.id == id)
                {
                    return Ok(CommandGroupSubmissionLocation {
                        workflow: workflow.id,
                        submission: submission.id,
                        index,
                    });
                }
            }
        }
        Err(Error::NotFound(format!("command group submission {}", id)))
    }

    /// Workflow, submission and command group submission for an id.
    pub fn command_group_submission(
        &self,
        id: CommandGroupSubmissionId,
    ) -> Result<(&Workflow, &Submission, &CommandGroupSubmission)> {
        let loc = self.locate(id)?;
        let workflow = self.workflow(loc.workflow)?;
        let submission = &workflow.submissions[loc.submission.0];
        Ok((workflow, submission, &submission.command_group_submissions[loc.index]))
    }

    pub fn command_group_submission_mut(
        &mut self,
        id: CommandGroupSubmissionId,
    ) -> Result<&mut CommandGroupSubmission> {
        let loc = self.locate(id)?;
        let workflow = self.workflow_mut(loc.workflow)?;
        Ok(&mut workflow.submissions[loc.submission.0].command_group_submissions[loc.index])
    }
}

/// A transactional store shared by every process of a workflow.
pub trait Store: Send + Sync {
    /// Reads a consistent snapshot.
    fn load(&self) -> StoreResult<Database>;

    /// Writes `db` if nobody committed since it was loaded; returns the new
    /// revision. Fails with `Conflict` otherwise.
    fn commit(&self, db: &Database) -> StoreResult<u64>;

    /// Inserts `key` if absent. `false` means the insert conflicted with an
    /// existing holder.
    fn try_acquire_lease(&self, key: &LeaseKey) -> StoreResult<bool>;

    fn release_lease(&self, key: &LeaseKey) -> StoreResult<()>;

    /// Cheap pre-check; the insert in `try_acquire_lease` is authoritative.
    fn is_leased(&self, key: &LeaseKey) -> StoreResult<bool>;
}

/// Reads a snapshot, sleeping while the store is busy.
pub fn snapshot(store: &dyn Store, retry: &RetryPolicy, context: &str) -> Result<Database> {
    loop {
        match store.load() {
            Ok(db) => return Ok(db),
            Err(e) if e.is_retryable() => retry.pause(context, &e),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Load, mutate, commit; retry on Conflict/Busy. `apply` can run more than
/// once so it must only touch the snapshot it is given.
pub fn transact<T>(
    store: &dyn Store,
    retry: &RetryPolicy,
    context: &str,
    mut apply: impl FnMut(&mut Database) -> Result<T>,
) -> Result<T> {
    loop {
        let mut db = snapshot(store, retry, context)?;
        let out = apply(&mut db)?;

        match store.commit(&db) {
            Ok(revision) => {
                debug!("{}: committed revision {}", context, revision);
                return Ok(out);
            }
            Err(e) if e.is_retryable() => retry.pause(context, &e),
            Err(e) => return Err(e.into()),
        }
    }
}

/// A held lease; released on drop if not released explicitly.
pub struct LeaseGuard<'a> {
    store: &'a dyn Store,
    key: LeaseKey,
    released: bool,
}

impl<'a> LeaseGuard<'a> {
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release_lease(&self.key)?;
        debug!("Released lease {}", self.key);
        Ok(())
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.store.release_lease(&self.key) {
            Ok(()) => debug!("Released lease {}", self.key),
            Err(e) => error!("Failed to release lease {}: {}", self.key, e),
        }
    }
}

/// Acquires `key`, sleeping while someone else holds it. Before every
/// attempt `done` is consulted; once it reports the guarded work as already
/// finished the loop gives up and returns `None`.
pub fn acquire_lease_unless<'a>(
    store: &'a dyn Store,
    key: LeaseKey,
    retry: &RetryPolicy,
    context: &str,
    mut done: impl FnMut() -> Result<bool>,
) -> Result<Option<LeaseGuard<'a>>> {
    loop {
        if done()? {
            return Ok(None);
        }

        match store.is_leased(&key) {
            Ok(true) => {
                retry.pause(context, &format!("{} is held", key));
                continue;
            }
            Ok(false) => {}
            Err(e) if e.is_retryable() => {
                retry.pause(context, &e);
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        match store.try_acquire_lease(&key) {
            Ok(true) => {
                debug!("{}: acquired lease {}", context, key);
                return Ok(Some(LeaseGuard {
                    store,
                    key,
                    released: false,
                }));
            }
            Ok(false) => retry.pause(context, &format!("{} was taken concurrently", key)),
            Err(e) if e.is_retryable() => retry.pause(context, &e),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Acquires `key` unconditionally.
pub fn acquire_lease<'a>(
    store: &'a dyn Store,
    key: LeaseKey,
    retry: &RetryPolicy,
    context: &str,
) -> Result<LeaseGuard<'a>> {
    acquire_lease_unless(store, key.clone(), retry, context, || Ok(false))?
        .ok_or_else(|| Error::NotFound(format!("lease {}", key)))
}
