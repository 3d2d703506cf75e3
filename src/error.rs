//! Crate-local error type for failures that aren't a bare syscall/IO error:
//! bad configuration, a pipeline wired up wrong, or a malformed upstream
//! protocol response.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no stage named {0:?} registered in the pipeline")]
    UnknownStage(String),

    #[error("malformed fastcgi record: {0}")]
    FastcgiProtocol(String),

    #[error("continuation slot held the wrong type for this stage")]
    ContinuationTypeMismatch,
}

pub type Result<T> = std::result::Result<T, Error>;
