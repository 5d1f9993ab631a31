use std::io;
use std::sync::PoisonError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to read {0}: {1}")]
    Read(String, #[source] io::Error),
    #[error("Failed to write {0}: {1}")]
    Write(String, #[source] io::Error),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Checksum mismatch in {0}")]
    ChecksumMismatch(String),
    #[error("Corruption: {0}")]
    Corruption(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Out of memory allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("Mutex was poisoned")]
    MutexPoisoned,
    #[error("Lock error: {0}")]
    LockError(#[source] io::Error),
    #[error("Background job {0} failed: {1}")]
    JobFailed(&'static str, String),
    #[error("Storage stopped after a fatal error: {0}")]
    Failed(String),
    #[error("Storage is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Fatal errors stop the environment. Everything else is reported to
    /// the caller and leaves the engine usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Read(..)
                | Error::Write(..)
                | Error::InvalidHeader(_)
                | Error::ChecksumMismatch(_)
                | Error::Corruption(_)
                | Error::OutOfMemory(_)
                | Error::MutexPoisoned
                | Error::JobFailed(..)
                | Error::Failed(_)
        )
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}
