//! Engine error taxonomy.
//!
//! Every user-facing operation returns one of these; the engine never aborts
//! the process on a user-facing path. Index-family failures arrive split
//! into their expected and unexpected halves, and each variant maps onto the
//! process exit code a CLI wrapper would report.

use sango_index::IndexError;
use sango_segment::SegmentError;
use sango_wal::WalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("engine is stopped")]
    EngineStopped,

    #[error("no data to search")]
    NoData,

    #[error("no segments to search")]
    NoSegmentsToSearch,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption: {0}")]
    Corruption(String),

    /// A family-expected index failure (parameter validation, resource
    /// limits).
    #[error("index error: {0}")]
    Index(IndexError),

    /// An assertion-style index failure. Non-fatal to the engine.
    #[error("unexpected index error: {0}")]
    IndexUnexpected(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Exit code a CLI wrapper reports for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::InvalidArgument(_) | Error::AlreadyExists(_) | Error::Index(_) => 1,
            Error::NotFound(_) | Error::NoData | Error::NoSegmentsToSearch => 2,
            Error::Io(_) | Error::Corruption(_) => 3,
            Error::Capacity(_) => 4,
            Error::EngineStopped => 5,
            Error::Unsupported(_) | Error::IndexUnexpected(_) | Error::Internal(_) => 99,
        }
    }
}

impl From<IndexError> for Error {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Unsupported(msg) => Error::Unsupported(msg),
            IndexError::Internal(msg) => Error::IndexUnexpected(msg),
            expected => Error::Index(expected),
        }
    }
}

impl From<SegmentError> for Error {
    fn from(err: SegmentError) -> Self {
        match err {
            SegmentError::Io(e) => Error::Io(e),
            SegmentError::Corrupt(msg) => Error::Corruption(msg),
            SegmentError::Meta(e) => Error::Corruption(format!("segment metadata: {e}")),
        }
    }
}

impl From<WalError> for Error {
    fn from(err: WalError) -> Self {
        match err {
            WalError::Io(e) => Error::Io(e),
            WalError::Record(e) => Error::Corruption(format!("WAL record: {e}")),
            WalError::Corruption { file, offset, reason } => Error::Corruption(format!(
                "WAL file {} at offset {offset}: {reason}",
                file.display()
            )),
            WalError::Write(msg) => Error::Io(std::io::Error::other(msg)),
            WalError::Closed => Error::EngineStopped,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Internal(format!("catalog: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
