use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for qdiff harness operations.
///
/// Per-program failures (platform crashes, divergences, timeouts, flaky
/// oracles) are *data* and never travel through this type. `QdiffError` is
/// reserved for faults of the harness itself: unreadable corpora, unwritable
/// stores, bad configuration.
#[derive(Error, Debug)]
pub enum QdiffError {
    // === I/O Errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Store Errors ===
    /// The result store cannot accept writes.
    #[error("result store unwritable at '{path}': {detail}")]
    StoreUnwritable { path: PathBuf, detail: String },

    /// A record with the same key has already been appended.
    #[error("duplicate record: {key}")]
    DuplicateRecord { key: String },

    /// A record requested for read-back does not exist.
    #[error("record not found: {key}")]
    RecordNotFound { key: String },

    // === Corpus Errors ===
    /// Corpus folder does not exist or is not a directory.
    #[error("corpus not found: '{path}'")]
    CorpusNotFound { path: PathBuf },

    /// A program file could not be turned into a statement sequence.
    #[error("invalid program '{program_id}': {detail}")]
    InvalidProgram { program_id: String, detail: String },

    // === Configuration Errors ===
    /// Harness configuration rejected during validation.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    // === Internal Errors ===
    /// Internal invariant violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QdiffError {
    /// Whether this error must stop the whole run.
    ///
    /// Everything that prevents the harness from recording results is fatal;
    /// a duplicate key is a caller bug for that one record and is not.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::StoreUnwritable { .. } | Self::CorpusNotFound { .. }
        )
    }

    /// Whether the operator can likely fix this without code changes.
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CorpusNotFound { .. }
                | Self::InvalidConfig { .. }
                | Self::InvalidProgram { .. }
                | Self::StoreUnwritable { .. }
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::CorpusNotFound { .. } => Some("Check the --corpus path"),
            Self::StoreUnwritable { .. } => {
                Some("Check free disk space and permissions of the corpus folder")
            }
            Self::InvalidConfig { .. } => Some("Fix the harness configuration file"),
            Self::DuplicateRecord { .. } => {
                Some("Resume the run instead of restarting it over existing records")
            }
            _ => None,
        }
    }

    /// Process exit code for the CLIs.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig { .. } => 2,
            Self::CorpusNotFound { .. } | Self::RecordNotFound { .. } => 3,
            Self::InvalidProgram { .. } => 4,
            Self::StoreUnwritable { .. } | Self::DuplicateRecord { .. } => 5,
            Self::Io(_) | Self::Json(_) => 6,
            Self::Internal(_) => 70,
        }
    }

    pub fn config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    pub fn invalid_program(program_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidProgram {
            program_id: program_id.into(),
            detail: detail.into(),
        }
    }

    pub fn store_unwritable(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::StoreUnwritable {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `QdiffError`.
pub type Result<T> = std::result::Result<T, QdiffError>;
