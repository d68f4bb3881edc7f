//! Error types for LODGE operations

use std::path::PathBuf;
use thiserror::Error;

use crate::CollectionId;

/// Read-side failures from the backing store.
///
/// These are transient from the core's point of view: the cache keeps
/// serving last-known-good data where it has any.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transport failure: {reason}")]
    Transport { reason: String },

    #[error("Backend rejected query on {resource}: {reason}")]
    Backend { resource: String, reason: String },

    #[error("Invalid query: {reason}")]
    Validation { reason: String },

    #[error("Failed to decode rows from {resource}: {reason}")]
    Decode { resource: String, reason: String },
}

/// Write-side failures. These always reach the initiating caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Write rejected for {operation}: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("Write for {operation} resolved without a canonical id")]
    NotPersisted { operation: String },

    #[error("Invalid value for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Mutation key {key} is already in flight with a different result type")]
    KeyConflict { key: String },

    #[error("Mutation {key} was aborted before completing")]
    Aborted { key: String },
}

/// Cache access errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache entry {key} does not hold a value of type {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}

/// Live collection lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectionError {
    #[error("Collection {collection_id} is closed")]
    Closed { collection_id: CollectionId },

    #[error("Initial load of collection {collection_id} failed: {source}")]
    LoadFailed {
        collection_id: CollectionId,
        #[source]
        source: FetchError,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or LODGE_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all LODGE errors.
#[derive(Debug, Error)]
pub enum LodgeError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Collection error: {0}")]
    Collection(#[from] CollectionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for LODGE operations.
pub type LodgeResult<T> = Result<T, LodgeError>;

impl LodgeError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LodgeError::Fetch(FetchError::Transport { .. })
                | LodgeError::Collection(CollectionError::LoadFailed {
                    source: FetchError::Transport { .. },
                    ..
                })
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================
