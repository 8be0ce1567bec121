//! Error types for prearchive operations.
//!
//! Callers map these onto their own surface (HTTP status, exit code). The
//! grouping below mirrors how they are expected to react: authorization and
//! not-found errors are terminal for the request, lock contention and busy
//! records are "try again later", sync failures abort the whole operation.

use std::path::PathBuf;

use crate::status::PrearcStatus;
use crate::types::Triple;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PrearcError {
    // ─────────────────────────────────────────────────────────────────────
    // Authorization
    // ─────────────────────────────────────────────────────────────────────
    #[error("User {user} may not modify prearchive data for project {project}")]
    Unauthorized { user: String, project: String },

    // ─────────────────────────────────────────────────────────────────────
    // Not found
    // ─────────────────────────────────────────────────────────────────────
    #[error("No such project: {0}")]
    ProjectNotFound(String),

    #[error("No prearchive session record for {0}")]
    SessionNotFound(Triple),

    #[error("No log entry {id} for {triple}")]
    LogNotFound { triple: Triple, id: String },

    // ─────────────────────────────────────────────────────────────────────
    // Contention
    // ─────────────────────────────────────────────────────────────────────
    #[error("Session file {filename} is locked for {triple}")]
    SessionFileLock { triple: Triple, filename: String },

    #[error("Session {triple} is busy ({status})")]
    SessionBusy { triple: Triple, status: PrearcStatus },

    #[error("Session record {triple} changed underneath us (expected version {expected}, found {found})")]
    StaleRecord {
        triple: Triple,
        expected: u64,
        found: u64,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Build
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to synchronize session {triple}: {source}")]
    SyncFailed {
        triple: Triple,
        #[source]
        source: BoxError,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Input
    // ─────────────────────────────────────────────────────────────────────
    #[error("Not a prearchive timestamp directory: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid {field} name: {value:?}")]
    InvalidPathSegment { field: &'static str, value: String },

    #[error("Expected a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Status {0} has no in-process state")]
    NoShadowState(PrearcStatus),

    // ─────────────────────────────────────────────────────────────────────
    // Infrastructure
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PrearcError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PrearcError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn db(context: impl Into<String>, source: rusqlite::Error) -> Self {
        PrearcError::Database {
            context: context.into(),
            source,
        }
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, PrearcError::Unauthorized { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PrearcError::ProjectNotFound(_)
                | PrearcError::SessionNotFound(_)
                | PrearcError::LogNotFound { .. }
        )
    }

    /// Contention that a caller should treat as "try again later".
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PrearcError::SessionFileLock { .. }
                | PrearcError::SessionBusy { .. }
                | PrearcError::StaleRecord { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PrearcError>;
