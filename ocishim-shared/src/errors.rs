//! Error taxonomy for the execution core.
//!
//! Variants map onto the failure classes callers care about:
//! - `Config`: bad construction parameters, never retried
//! - `NotFound` / `AlreadyExists`: identity problems, returned without side effects
//! - `Runtime`: the external runtime failed or produced unreadable output
//! - `Storage` / `Io`: state directory and stdio/console setup failures

use thiserror::Error;

/// Result alias used across ocishim crates.
pub type ShimResult<T> = Result<T, ShimError>;

#[derive(Debug, Error)]
pub enum ShimError {
    /// Invalid configuration (empty or relative root, bad poll interval).
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown container or process id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A container or process with this id already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// External runtime invocation failed (non-zero exit, bad pid file, bad JSON).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// State directory operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Stdio or console setup failed.
    #[error("io setup error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

impl ShimError {
    /// True for errors that mean "no such container/process".
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShimError::NotFound(_))
    }
}
