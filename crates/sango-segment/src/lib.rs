//! On-disk segment store.
//!
//! One segment is a directory under
//! `tables/<table>/<partition>/<segment_id>/` holding:
//!
//! - `raw.vec` — `row_count * dim` little-endian f32
//! - `raw.ids` — `row_count` little-endian i64
//! - `blacklist.bits` — packed deletion bitset (absent when nothing deleted)
//! - `index.bin` — serialized index artifact (absent for RAW segments)
//! - `meta.json` — shape and provenance
//!
//! Segment creation is atomic: everything is written into a temp directory
//! beside the target and renamed into place, so a reader only ever sees a
//! whole segment or none.

mod meta;
mod store;

pub use meta::SegmentFileMeta;
pub use store::{SegmentData, SegmentStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt segment: {0}")]
    Corrupt(String),

    #[error("segment metadata error: {0}")]
    Meta(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SegmentError>;
