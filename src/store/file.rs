//! File-backed store for processes on a shared filesystem.
//!
//! Layout inside the store directory:
//!
//! ```text
//! db.json          latest committed snapshot
//! commit.lock      present while a commit is in progress
//! leases/<key>     one marker file per held lease
//! ```
//!
//! Both the commit marker and lease markers are created with
//! `create_new`, so an existing file is the insert-uniqueness conflict.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process;

use log::{debug, warn};

use super::{Database, LeaseKey, Store, StoreError, StoreResult};

const DB_FILE: &str = "db.json";
const COMMIT_MARKER: &str = "commit.lock";
const LEASE_DIR: &str = "leases";

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(LEASE_DIR))?;
        debug!("Opened file store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn db_path(&self) -> PathBuf {
        self.dir.join(DB_FILE)
    }

    fn lease_path(&self, key: &LeaseKey) -> PathBuf {
        self.dir.join(LEASE_DIR).join(key.to_string())
    }

    /// Creates `path` exclusively. `Ok(false)` if it already exists.
    fn create_marker(path: &Path) -> StoreResult<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", process::id())?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_marker(path: &Path) -> StoreResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_snapshot(&self, db: &Database) -> StoreResult<()> {
        let tmp = self.dir.join(format!("{}.{}.tmp", DB_FILE, process::id()));
        fs::write(&tmp, serde_json::to_string_pretty(db)?)?;
        fs::rename(&tmp, self.db_path())?;
        Ok(())
    }

    fn commit_locked(&self, db: &Database) -> StoreResult<u64> {
        let current = self.load()?;
        if current.revision != db.revision {
            return Err(StoreError::Conflict);
        }
        let mut next = db.clone();
        next.revision += 1;
        self.write_snapshot(&next)?;
        Ok(next.revision)
    }
}

impl Store for FileStore {
    fn load(&self) -> StoreResult<Database> {
        match fs::read_to_string(self.db_path()) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Database::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, db: &Database) -> StoreResult<u64> {
        let marker = self.dir.join(COMMIT_MARKER);
        if !Self::create_marker(&marker)? {
            return Err(StoreError::Busy);
        }

        let result = self.commit_locked(db);
        if let Err(e) = Self::remove_marker(&marker) {
            warn!("Could not remove commit marker {}: {}", marker.display(), e);
        }
        result
    }

    fn try_acquire_lease(&self, key: &LeaseKey) -> StoreResult<bool> {
        Self::create_marker(&self.lease_path(key))
    }

    fn release_lease(&self, key: &LeaseKey) -> StoreResult<()> {
        Self::remove_marker(&self.lease_path(key))
    }

    fn is_leased(&self, key: &LeaseKey) -> StoreResult<bool> {
        Ok(self.lease_path(key).exists())
    }
}
