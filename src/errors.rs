//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the engine returns [`ArchiveError`]. The
//! variants map onto failure *kinds* rather than module boundaries, so the
//! HTTP layer can translate them into status codes without knowing which
//! subsystem raised them.
//!
//! Propagation policy:
//!
//! - read failures always surface;
//! - write failures roll back their transaction and surface;
//! - per-conversation ingestion failures are logged and skipped, counted on
//!   the import job;
//! - per-block embedding failures are logged, the block is stored without a
//!   vector, and `embeddingFailed` lands in its metadata;
//! - only [`ArchiveError::Fatal`] aborts a pipeline.

use miette::Diagnostic;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error, Diagnostic)]
pub enum ArchiveError {
    /// An owner row, conversation folder, or file path does not exist.
    #[error("not found: {0}")]
    #[diagnostic(code(palimpsest::not_found))]
    NotFound(String),

    /// Malformed JSON, bad UUID, unknown enum value, or a path that escapes
    /// the archive root.
    #[error("invalid input: {0}")]
    #[diagnostic(code(palimpsest::invalid))]
    Invalid(String),

    /// The embedding/summarization backend returned a non-2xx status or an
    /// unparseable payload.
    ///
    /// `context_too_long` marks the subkind that drives the prefix-retry
    /// ladder in the embedding client; once the ladder is exhausted the
    /// caller records the failure instead of aborting.
    #[error("embedding backend error: {message}")]
    #[diagnostic(
        code(palimpsest::backend),
        help("Check that the local model service is running and reachable.")
    )]
    Backend {
        message: String,
        context_too_long: bool,
        /// Suggested wait before retrying, when the backend is unreachable.
        retry_after_ms: Option<u64>,
    },

    /// Uniqueness violation or concurrent-writer conflict.
    #[error("store conflict: {0}")]
    #[diagnostic(code(palimpsest::store::conflict))]
    StoreConflict(String),

    /// The operation observed its cancel flag.
    #[error("operation cancelled")]
    #[diagnostic(code(palimpsest::cancelled))]
    Cancelled,

    /// A per-request deadline elapsed.
    #[error("timed out: {0}")]
    #[diagnostic(code(palimpsest::timeout))]
    Timeout(String),

    /// Soft harvest failure: the corpus could not supply enough quality
    /// results. Harvest itself reports this through `stats.exhausted`; the
    /// variant exists for callers that want a hard gate.
    #[error("not enough quality results")]
    #[diagnostic(code(palimpsest::exhausted))]
    Exhausted,

    /// Schema mismatch or index corruption. The store refuses further
    /// writes once this is raised.
    #[error("fatal store error: {0}")]
    #[diagnostic(
        code(palimpsest::fatal),
        help("The database schema is newer than this build or the index is corrupt.")
    )]
    Fatal(String),

    /// Database-level failure that is not a conflict.
    #[error("storage error: {0}")]
    #[diagnostic(code(palimpsest::store::backend))]
    Storage(String),

    #[error("i/o error: {0}")]
    #[diagnostic(code(palimpsest::io))]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ArchiveError::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        ArchiveError::Invalid(what.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        ArchiveError::Backend {
            message: message.into(),
            context_too_long: false,
            retry_after_ms: None,
        }
    }

    pub fn context_too_long(message: impl Into<String>) -> Self {
        ArchiveError::Backend {
            message: message.into(),
            context_too_long: true,
            retry_after_ms: None,
        }
    }

    /// Backend unreachable: fail fast with a retry-after hint.
    pub fn backend_unreachable(message: impl Into<String>, retry_after_ms: u64) -> Self {
        ArchiveError::Backend {
            message: message.into(),
            context_too_long: false,
            retry_after_ms: Some(retry_after_ms),
        }
    }

    /// Returns `true` for the `ContextTooLong` backend subkind.
    pub fn is_context_too_long(&self) -> bool {
        matches!(
            self,
            ArchiveError::Backend {
                context_too_long: true,
                ..
            }
        )
    }

    /// Only `Fatal` errors abort a whole pipeline run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ArchiveError::Fatal(_))
    }
}

impl From<tokio_rusqlite::Error> for ArchiveError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        let message = err.to_string();
        // SQLite reports uniqueness and FK violations through the constraint
        // family of result codes; the wrapper only exposes the message.
        if message.contains("constraint") || message.contains("UNIQUE") {
            ArchiveError::StoreConflict(message)
        } else {
            ArchiveError::Storage(message)
        }
    }
}

/// `tokio_rusqlite::Connection::call` is generic over the closure's error
/// type and wraps it in `tokio_rusqlite::Error` automatically, so this
/// stands in for the `tokio_rusqlite::Error::Rusqlite` variant constructor
/// older versions exposed.
#[allow(non_snake_case)]
pub(crate) fn Rusqlite(err: tokio_rusqlite::rusqlite::Error) -> tokio_rusqlite::rusqlite::Error {
    err
}

impl From<serde_json::Error> for ArchiveError {
    fn from(err: serde_json::Error) -> Self {
        ArchiveError::Invalid(format!("malformed JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_too_long_subkind_is_detectable() {
        let err = ArchiveError::context_too_long("prompt exceeds context window");
        assert!(err.is_context_too_long());
        assert!(!ArchiveError::backend("boom").is_context_too_long());
    }

    #[test]
    fn only_fatal_aborts() {
        assert!(ArchiveError::Fatal("schema v99".into()).is_fatal());
        assert!(!ArchiveError::Cancelled.is_fatal());
        assert!(!ArchiveError::Timeout("embed".into()).is_fatal());
    }
}
