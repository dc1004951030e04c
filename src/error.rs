//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds a caller needs to branch on (config validation,
//! storage transience, codec corruption, integrity, retention policy); any
//! other failure is wrapped in [`BackupError::Other`], the same pattern the
//! teacher repo uses for its own `TapeLockError`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("transient storage error: {0}")]
    StorageTransient(String),

    #[error("storage error: {0}")]
    StoragePermanent(String),

    #[error("codec failure for '{path}': {reason}")]
    CodecCorruption { path: String, reason: String },

    #[error("missing object '{key}' referenced by path '{path}'")]
    IntegrityViolation { path: String, key: String },

    #[error("retention policy rejected: {0}")]
    PolicyViolation(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::Other(err.into())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
