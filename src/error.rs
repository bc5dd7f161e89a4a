//! Error Types
//!
//! A single error enum covers workflow construction, variable resolution,
//! runtime coordination and archiving. Store-level concurrency signals live
//! in [`crate::store::StoreError`] and are wrapped here when they escape a
//! retry loop.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A base variable has no source data yet. Callers retry later.
    #[error("variable '{0}' cannot be resolved yet")]
    UnresolvedVariable(String),

    /// Two or more value lists disagree in length and none has length 1.
    #[error("multiplicity mismatch in {context}: lengths {lengths:?}")]
    MultiplicityMismatch { context: String, lengths: Vec<usize> },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("variables form a dependency cycle: {}", .0.join(", "))]
    CyclicVariables(Vec<String>),

    #[error("invalid workflow: {0}")]
    Validation(String),

    #[error("invalid task range: {0}")]
    InvalidTaskRange(String),

    #[error("archive directory already exists: {}", .0.display())]
    ArchiveDirExists(PathBuf),

    #[error("no free archive directory name for '{base}' after {attempts} attempts")]
    ArchiveDirExhausted { base: String, attempts: usize },

    #[error("archive backend failed: {0}")]
    ArchiveBackend(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

impl Error {
    /// True for conditions that mean "try again once more context exists".
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::UnresolvedVariable(_))
    }

    pub(crate) fn mismatch(context: impl Into<String>, lengths: Vec<usize>) -> Self {
        Self::MultiplicityMismatch {
            context: context.into(),
            lengths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_is_retryable() {
        assert!(Error::UnresolvedVariable("x".into()).is_unresolved());
        assert!(!Error::UnknownVariable("x".into()).is_unresolved());
    }

    #[test]
    fn test_error_display() {
        let err = Error::mismatch("variable 'b'", vec![2, 3]);
        assert_eq!(
            err.to_string(),
            "multiplicity mismatch in variable 'b': lengths [2, 3]"
        );

        let err = Error::CyclicVariables(vec!["a".into(), "b".into()]);
        assert!(err.to_string().contains("a, b"));

        let err = Error::ArchiveDirExhausted {
            base: "run".into(),
            attempts: 10,
        };
        assert!(err.to_string().contains("10 attempts"));
    }

    #[test]
    fn test_store_error_wraps() {
        let err: Error = StoreError::Busy.into();
        assert!(matches!(err, Error::Store(StoreError::Busy)));
    }
}
