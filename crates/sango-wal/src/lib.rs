//! Write-ahead log for the sango engine.
//!
//! Append-only, CRC-framed records in rotating numeric files
//! (`0.wal`, `1.wal`, …). A single writer task owns the active file;
//! callers enqueue records and are acked only after their record is fsynced,
//! so a resolved `append` means the record is durable. Startup recovery
//! scans the files in order, tolerates a torn tail on the newest file, and
//! treats damage anywhere else as fatal corruption.

mod record;
mod recovery;
mod writer;

pub use record::{RecordError, WalPayload, WalRecord};
pub use recovery::{RecoveredLog, WalFileInfo};
pub use writer::{Wal, WalConfig};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record error: {0}")]
    Record(#[from] RecordError),

    #[error("corrupt WAL file {file}: {reason} at offset {offset}")]
    Corruption {
        file: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("WAL write failed: {0}")]
    Write(String),

    #[error("WAL is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, WalError>;
