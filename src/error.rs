use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised anywhere inside a pipeline run.
///
/// Workers never let these escape as panics: each one is classified through
/// [`PipelineError::class`] and either counted as a per-unit failure or turned
/// into an abort, depending on the run's [`AbortPolicy`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Opening a database connection failed.
    #[error("failed to open database at {path:?}")]
    Connect {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A statement failed on an otherwise healthy connection.
    #[error("database statement failed: {context}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A source object could not be transformed.
    #[error("malformed object {external_id} ({type_tag}): {reason}")]
    Malformed {
        external_id: String,
        type_tag: String,
        reason: String,
    },

    /// A source line could not be decoded at all.
    #[error("failed to decode source record at line {line}")]
    Decode {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("no transform from EPSG:{from} to EPSG:{to}")]
    UnsupportedSrs { from: u32, to: u32 },

    /// External asset does not exist (the local analogue of an HTTP 404).
    #[error("asset not found: {uri}")]
    AssetNotFound { uri: String },

    #[error("failed to fetch asset {uri}")]
    AssetFetch {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    /// A deferred reference points at an identifier nobody produced.
    #[error("unresolved {kind} reference to {target}")]
    Unresolved { kind: String, target: String },

    #[error("no resolver registered for {kind} references")]
    NoResolver { kind: String },

    /// The output writer rejected a released object.
    #[error("output write failed at sequence {sequence}")]
    Output {
        sequence: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("sequence {sequence} submitted twice or after it was released (next expected {expected})")]
    SequenceReplay { sequence: u64, expected: u64 },

    #[error("failed to serialize output")]
    Serialize(#[source] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("worker pool {0} is closed")]
    PoolClosed(String),

    #[error("worker thread {0} panicked")]
    WorkerPanic(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error categories used to decide between "count and continue" and
/// "abort the run".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Database,
    ConnectionLost,
    Malformed,
    Reference,
    Spatial,
    Output,
    Configuration,
    Internal,
}

impl PipelineError {
    /// Wraps a rusqlite error with a short description of what was attempted.
    pub fn database(context: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Database {
            context: context.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connect { .. } => ErrorClass::ConnectionLost,
            Self::Database { source, .. } => classify_sqlite(source),
            Self::Malformed { .. } | Self::Decode { .. } => ErrorClass::Malformed,
            Self::UnsupportedSrs { .. } => ErrorClass::Spatial,
            Self::AssetNotFound { .. }
            | Self::AssetFetch { .. }
            | Self::Unresolved { .. }
            | Self::NoResolver { .. } => ErrorClass::Reference,
            Self::Output { .. } | Self::Serialize(_) | Self::Io(_) => ErrorClass::Output,
            Self::Config(_) => ErrorClass::Configuration,
            Self::SequenceReplay { .. }
            | Self::PoolClosed(_)
            | Self::WorkerPanic(_)
            | Self::Internal(_) => ErrorClass::Internal,
        }
    }
}

/// Errors that mean the connection itself is gone rather than one statement
/// being bad.
fn classify_sqlite(err: &rusqlite::Error) -> ErrorClass {
    use rusqlite::ErrorCode;

    match err.sqlite_error_code() {
        Some(
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly,
        ) => ErrorClass::ConnectionLost,
        _ => ErrorClass::Database,
    }
}

/// The set of error classes that abort a run.
#[derive(Debug, Clone)]
pub struct AbortPolicy {
    fatal: FxHashSet<ErrorClass>,
}

impl AbortPolicy {
    pub fn new(classes: impl IntoIterator<Item = ErrorClass>) -> Self {
        Self {
            fatal: classes.into_iter().collect(),
        }
    }

    pub fn is_fatal(&self, err: &PipelineError) -> bool {
        self.fatal.contains(&err.class())
    }
}

impl Default for AbortPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_ABORT_CLASSES.iter().copied())
    }
}
