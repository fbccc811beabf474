//! Vector index families for the sango engine.
//!
//! Every ANN family (flat brute-force, inverted-file, scalar-quantized,
//! product-quantized) implements the [`VectorIndex`] contract so the engine
//! can train, add, search, serialize and reload an index without knowing
//! which family it is talking to. Families are selected by [`IndexKind`] and
//! constructed through [`new_index`] / [`build_index`] / [`load_index`].
//!
//! Distances are squared L2 (ascending) or inner product (descending).
//! Results always contain exactly `nq * k` entries; slots that cannot be
//! filled carry the sentinel pair for the metric.

mod codec;
mod contract;
mod distance;
mod flat;
mod ivf;
mod kmeans;
mod pq;
mod sq8;
mod types;

pub use contract::{build_index, load_index, new_index, Dataset, VectorIndex};
pub use distance::{inner_product, l2_squared};
pub use flat::FlatIndex;
pub use ivf::IvfFlatIndex;
pub use pq::IvfPqIndex;
pub use sq8::IvfSq8Index;
pub use types::{
    Blacklist, IndexKind, IndexParams, Metric, SearchParams, SearchResult, TopK, SENTINEL_ID,
};

/// Error surface of the index layer.
///
/// `InvalidParameter`, `DimensionMismatch`, `NotTrained`, `UnknownId` and
/// `CorruptBlob` are family-expected failures; `Internal` stands in for the
/// assertion-style failures a family cannot recover from. The engine treats
/// both as non-fatal.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index is not trained")]
    NotTrained,

    #[error("id {0} not present in index")]
    UnknownId(i64),

    #[error("corrupt index blob: {0}")]
    CorruptBlob(String),

    #[error("unsupported capability: {0}")]
    Unsupported(String),

    #[error("index failure: {0}")]
    Internal(String),
}

impl IndexError {
    /// True for the failures a family is expected to produce (bad input,
    /// untrained state, torn blob); false for assertion-style failures.
    pub fn is_expected(&self) -> bool {
        !matches!(self, IndexError::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
