use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the alignment session.
///
/// `InvalidOption` is raised eagerly while the merged option set is checked,
/// before any stage runs. `InvalidConfig` is raised at call time by the
/// correlator and solver for malformed parameters. `UnderdeterminedSystem`
/// fails a single solve attempt and is handled at review; `UserAborted` is
/// fatal to the whole session.
#[derive(Debug, Error)]
pub enum AlignError {
    #[error("invalid option {key}: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("underdetermined system: {0}")]
    UnderdeterminedSystem(String),

    #[error("session aborted by user")]
    UserAborted,

    #[error("manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("record '{name}': {reason}")]
    Record { name: String, reason: String },

    #[error("plot output failed: {0}")]
    Plot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("report serialization failed: {0}")]
    Report(#[from] serde_json::Error),
}

impl AlignError {
    pub fn invalid_option(key: &str, reason: impl Into<String>) -> Self {
        AlignError::InvalidOption {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn manifest(path: &std::path::Path, reason: impl Into<String>) -> Self {
        AlignError::Manifest {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn record(name: &str, reason: impl Into<String>) -> Self {
        AlignError::Record {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
