//! Archive Backends
//!
//! The archive subsystem only needs three capabilities from a storage
//! location. [`LocalBackend`] provides them for any mounted filesystem.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::WalkDir;

use super::glob::matches_any;
use crate::error::{Error, Result};

pub trait ArchiveBackend: Send + Sync {
    /// Copies `local` recursively into `remote`, skipping entries whose
    /// name matches one of `excludes`.
    fn upload(&self, local: &Path, remote: &Path, excludes: &[String]) -> Result<()>;

    /// Names of the directories directly inside `path`.
    fn list_directories(&self, path: &Path) -> Result<Vec<String>>;

    fn directory_exists(&self, path: &Path) -> Result<bool>;
}

/// Copies between local (or network-mounted) paths.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    always_exclude: Vec<String>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pattern excluded from every upload, e.g. the project data dir.
    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.always_exclude.push(pattern.into());
        self
    }
}

impl ArchiveBackend for LocalBackend {
    fn upload(&self, local: &Path, remote: &Path, excludes: &[String]) -> Result<()> {
        let mut patterns = self.always_exclude.clone();
        patterns.extend(excludes.iter().cloned());

        info!("Archiving {} -> {}", local.display(), remote.display());
        let mut failures: Vec<String> = Vec::new();
        let mut copied = 0usize;

        let walker = WalkDir::new(local).into_iter().filter_entry(|entry| {
            entry.depth() == 0 || !matches_any(&patterns, &entry.file_name().to_string_lossy())
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    failures.push(e.to_string());
                    continue;
                }
            };
            let Ok(rel) = entry.path().strip_prefix(local) else {
                continue;
            };
            let target: PathBuf = remote.join(rel);

            let outcome = if entry.file_type().is_dir() {
                if target.is_dir() {
                    Ok(())
                } else {
                    fs::create_dir_all(&target)
                }
            } else {
                target
                    .parent()
                    .map_or(Ok(()), fs::create_dir_all)
                    .and_then(|_| fs::copy(entry.path(), &target).map(|_| ()))
            };

            match outcome {
                Ok(()) if entry.file_type().is_file() => copied += 1,
                Ok(()) => {}
                Err(e) => {
                    warn!("Could not archive {}: {}", entry.path().display(), e);
                    failures.push(format!("{}: {}", entry.path().display(), e));
                }
            }
        }

        debug!("Archived {} file(s) from {}", copied, local.display());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ArchiveBackend(failures.join("; ")))
        }
    }

    fn list_directories(&self, path: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn directory_exists(&self, path: &Path) -> Result<bool> {
        Ok(path.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_upload_copies_tree_with_excludes() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join("sub/.arrayflow")).unwrap();
        fs::write(src.path().join("a.dat"), "a").unwrap();
        fs::write(src.path().join("scratch.tmp"), "t").unwrap();
        fs::write(src.path().join("sub/b.dat"), "b").unwrap();
        fs::write(src.path().join("sub/.arrayflow/db.json"), "{}").unwrap();

        let backend = LocalBackend::new().with_exclude(".arrayflow");
        let remote = dst.path().join("archive/run");
        backend
            .upload(src.path(), &remote, &["*.tmp".to_string()])
            .unwrap();

        assert_eq!(fs::read_to_string(remote.join("a.dat")).unwrap(), "a");
        assert_eq!(fs::read_to_string(remote.join("sub/b.dat")).unwrap(), "b");
        assert!(!remote.join("scratch.tmp").exists());
        assert!(!remote.join("sub/.arrayflow").exists());
    }

    #[test]
    fn test_upload_overwrites_existing_files() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("a.dat"), "new").unwrap();
        fs::write(dst.path().join("a.dat"), "old").unwrap();

        LocalBackend::new().upload(src.path(), dst.path(), &[]).unwrap();
        assert_eq!(fs::read_to_string(dst.path().join("a.dat")).unwrap(), "new");
    }

    #[test]
    fn test_upload_missing_source_fails() {
        let dst = tempdir().unwrap();
        let result = LocalBackend::new().upload(&dst.path().join("nope"), dst.path(), &[]);
        assert!(matches!(result, Err(Error::ArchiveBackend(_))));
    }

    #[test]
    fn test_list_directories() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("file"), "").unwrap();

        let backend = LocalBackend::new();
        assert_eq!(backend.list_directories(dir.path()).unwrap(), vec!["a", "b"]);
        assert!(backend.list_directories(&dir.path().join("x")).unwrap().is_empty());
        assert!(backend.directory_exists(&dir.path().join("a")).unwrap());
        assert!(!backend.directory_exists(&dir.path().join("file")).unwrap());
    }
}
