use thiserror::Error;

use crate::backend;

/// Upload errors.
///
/// Configuration and state errors are returned synchronously by the call that triggered them.
/// Stage errors only surface once a chunk has exhausted its whole retry budget.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid naming inputs or authentication setup, never retried.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An operation invoked out of order or on a terminal session.
    #[error(transparent)]
    State(#[from] StateError),

    /// The backend could not be initialized.
    #[error("backend initialization failed: {0}")]
    Connect(#[source] backend::Error),

    /// A chunk could not be staged within its retry budget.
    #[error("chunk #{index} failed to stage after {attempts} attempts: {source}")]
    Stage {
        index: u64,
        attempts: u32,
        #[source]
        source: backend::Error,
    },

    /// The session has been halted by a chunk that failed permanently.
    #[error("session halted: chunk #{index} failed permanently")]
    Halted { index: u64 },

    /// The final block list was rejected, all chunks were staged.
    #[error("commit of {blocks} blocks failed: {source}")]
    Commit {
        blocks: usize,
        #[source]
        source: backend::Error,
    },

    /// A sequence index does not fit the fixed-width block identifier.
    #[error("block index {0} exceeds the block identifier width")]
    IndexOverflow(u64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required naming input: {0}")]
    MissingNaming(&'static str),
    #[error("revision counter must start at 1")]
    InvalidRevision,
    #[error("no authentication method available")]
    NoAuthMethod,
    #[error("malformed credential url `{url}`: {reason}")]
    MalformedUrl { url: String, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("session has been aborted")]
    Aborted,
    #[error("session is finalizing")]
    Finalizing,
    #[error("session has already been committed")]
    AlreadyCommitted,
    #[error("backend client was never initialized")]
    Uninitialized,
    #[error("no block has been staged, nothing to commit")]
    NothingStaged,
    #[error("empty chunks cannot be staged")]
    EmptyChunk,
}
