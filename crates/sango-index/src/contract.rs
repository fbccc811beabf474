//! The uniform contract every ANN family satisfies.
//!
//! The engine only ever holds a `Box<dyn VectorIndex>`: it trains, adds,
//! searches, serializes and reloads through this trait and never branches on
//! the concrete family. Construction goes through [`new_index`] (empty),
//! [`build_index`] (train + add in one step) or [`load_index`] (from a
//! serialized blob).

use crate::codec;
use crate::flat::FlatIndex;
use crate::ivf::IvfFlatIndex;
use crate::pq::IvfPqIndex;
use crate::sq8::IvfSq8Index;
use crate::types::{Blacklist, IndexKind, IndexParams, Metric, SearchParams, SearchResult};
use crate::{IndexError, Result};
use bytes::Bytes;

/// A borrowed batch of rows: `ids.len()` rows of `dim` floats each.
#[derive(Debug, Clone, Copy)]
pub struct Dataset<'a> {
    pub dim: usize,
    pub ids: &'a [i64],
    pub vectors: &'a [f32],
}

impl<'a> Dataset<'a> {
    pub fn new(dim: usize, ids: &'a [i64], vectors: &'a [f32]) -> Result<Self> {
        if dim == 0 {
            return Err(IndexError::InvalidParameter("dimension must be >= 1".into()));
        }
        if vectors.len() != ids.len() * dim {
            return Err(IndexError::DimensionMismatch {
                expected: ids.len() * dim,
                actual: vectors.len(),
            });
        }
        Ok(Self { dim, ids, vectors })
    }

    pub fn rows(&self) -> usize {
        self.ids.len()
    }

    pub fn row(&self, i: usize) -> &'a [f32] {
        &self.vectors[i * self.dim..(i + 1) * self.dim]
    }
}

/// Uniform interface over the ANN families.
///
/// Stored ids are the caller's `user_id`s, kept verbatim; row positions
/// (insertion order) are what the blacklist masks. `add` is only legal after
/// `train` (`train` is a no-op for FLAT but still required to mark the index
/// trained). `serialize` always emits a CPU blob that round-trips through
/// [`load_index`].
pub trait VectorIndex: Send + Sync {
    fn kind(&self) -> IndexKind;
    fn metric(&self) -> Metric;
    fn dimension(&self) -> usize;
    fn count(&self) -> usize;

    fn train(&mut self, dataset: &Dataset<'_>, params: &IndexParams) -> Result<()>;
    fn add(&mut self, dataset: &Dataset<'_>) -> Result<()>;

    /// Top-k over `queries` (`nq * dim` floats). Exactly `nq * k` output
    /// entries, sentinel-padded, blacklisted rows skipped.
    fn search(&self, queries: &[f32], k: usize, params: &SearchParams) -> Result<SearchResult>;

    /// Like `search`, seeded by ids already stored in this index.
    fn search_by_id(&self, ids: &[i64], k: usize, params: &SearchParams) -> Result<SearchResult> {
        let dim = self.dimension();
        let mut queries = Vec::with_capacity(ids.len() * dim);
        for id in ids {
            let row = self
                .reconstruct(*id)
                .ok_or(IndexError::UnknownId(*id))?;
            queries.extend_from_slice(&row);
        }
        self.search(&queries, k, params)
    }

    /// Recovers (possibly approximately, for quantized families) the stored
    /// vector for the first row carrying `id`.
    fn reconstruct(&self, id: i64) -> Option<Vec<f32>>;

    fn serialize(&self) -> Result<Bytes>;

    fn set_blacklist(&mut self, bits: Blacklist);
    fn get_blacklist(&self) -> &Blacklist;

    /// Clones this index onto a GPU device. This build carries no GPU
    /// support, so the capability is uniformly absent.
    fn copy_to_gpu(
        &self,
        _device_id: usize,
        _params: &IndexParams,
    ) -> Result<Box<dyn VectorIndex>> {
        Err(IndexError::Unsupported(
            "copy_to_gpu on a build without GPU support".into(),
        ))
    }

    fn copy_to_cpu(&self) -> Result<Box<dyn VectorIndex>> {
        Err(IndexError::Unsupported(
            "copy_to_cpu on a CPU-resident index".into(),
        ))
    }
}

/// Creates an empty, untrained index of the given family.
pub fn new_index(kind: IndexKind, metric: Metric, dim: usize) -> Result<Box<dyn VectorIndex>> {
    if dim == 0 {
        return Err(IndexError::InvalidParameter("dimension must be >= 1".into()));
    }
    Ok(match kind {
        IndexKind::Flat => Box::new(FlatIndex::new(metric, dim)),
        IndexKind::IvfFlat => Box::new(IvfFlatIndex::new(metric, dim)),
        IndexKind::IvfSq8 => Box::new(IvfSq8Index::new(metric, dim, false)),
        IndexKind::IvfSq8h => Box::new(IvfSq8Index::new(metric, dim, true)),
        IndexKind::IvfPq => Box::new(IvfPqIndex::new(metric, dim)),
    })
}

/// Train + add in one step, the shape the index-build tick wants.
pub fn build_index(
    kind: IndexKind,
    metric: Metric,
    dataset: &Dataset<'_>,
    params: &IndexParams,
) -> Result<Box<dyn VectorIndex>> {
    let mut index = new_index(kind, metric, dataset.dim)?;
    index.train(dataset, params)?;
    index.add(dataset)?;
    Ok(index)
}

/// Rebuilds an index from a blob produced by `serialize`. The family is
/// recovered from the blob header.
pub fn load_index(blob: &[u8]) -> Result<Box<dyn VectorIndex>> {
    let (header, _) = codec::open_blob(blob)?;
    Ok(match header.kind {
        IndexKind::Flat => Box::new(FlatIndex::load(blob)?),
        IndexKind::IvfFlat => Box::new(IvfFlatIndex::load(blob)?),
        IndexKind::IvfSq8 | IndexKind::IvfSq8h => Box::new(IvfSq8Index::load(blob)?),
        IndexKind::IvfPq => Box::new(IvfPqIndex::load(blob)?),
    })
}
