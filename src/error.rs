//! Error types for stashkv.
//!
//! Missing and expired items are not errors: lookups return `Ok(None)` for
//! them. The variants here cover misconfiguration, malformed data and store
//! failures.

use crate::settings::StorageKind;
use std::io;
use thiserror::Error;

/// Result type alias for stashkv operations.
pub type StashResult<T> = Result<T, StashError>;

/// Result type alias for raw store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by [`StorageUtilities`](crate::StorageUtilities).
#[derive(Debug, Error)]
pub enum StashError {
    /// No store is registered for the requested storage kind.
    #[error("storage kind {storage} is not supported in this environment")]
    Configuration {
        /// The storage kind that could not be resolved.
        storage: StorageKind,
    },

    /// A return kind name that is not one of the recognized kinds.
    #[error("return kind '{0}' is not supported")]
    UnsupportedReturnKind(String),

    /// Settings were replaced with an empty or unreadable value.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// A property operation targeted a payload that is not a JSON object.
    #[error("item '{key}' is not a JSON object")]
    NotAnObject {
        /// The prefixed key of the item.
        key: String,
    },

    /// A collection operation targeted a payload that is not a JSON array.
    #[error("item '{key}' is not a collection")]
    NotACollection {
        /// The prefixed key of the item.
        key: String,
    },

    /// A value could not be encoded to or decoded from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors produced by a [`KeyValueStore`](crate::backend::KeyValueStore).
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the backing file failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backing file exists but does not hold a valid store image.
    #[error("corrupt store file: {0}")]
    Corrupt(String),
}
