//! Error types for the storage, codec and configuration layers.
//!
//! None of these ever reach a caller of the store API; the store logs them and
//! carries on in memory. They exist so adapters can say precisely what went wrong.

use thiserror::Error;

/// Failure reported by a [`Persistence`](crate::storage::Persistence) write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backing medium is disabled, blocked or missing.
    #[error("storage is unavailable: {0}")]
    Unavailable(String),
    /// The medium rejected the write because it is full.
    #[error("storage quota exceeded while writing key '{key}' ({needed} bytes needed, {quota} allowed)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        quota: usize,
    },
    /// Any other rejected write.
    #[error("failed to write key '{key}': {reason}")]
    WriteFailed { key: String, reason: String },
}

/// Failure converting between a value and its stored string form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(String),
    #[error("failed to decode stored value: {0}")]
    Decode(String),
}

/// Configuration could not be loaded or did not match the schema.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error loading configuration: {0}")]
    Extract(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Extract(Box::new(e))
    }
}
