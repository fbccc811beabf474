//! Flat (brute-force) index.
//!
//! Keeps raw vectors and scans every live row per query. Exact, O(n * dim)
//! per query, and the family the engine falls back to for RAW segments that
//! have no built artifact.

use crate::codec::{self, BlobHeader};
use crate::contract::{Dataset, VectorIndex};
use crate::types::{Blacklist, IndexKind, IndexParams, Metric, SearchParams, SearchResult, TopK};
use crate::{IndexError, Result};
use bytes::Bytes;

pub struct FlatIndex {
    metric: Metric,
    dim: usize,
    ids: Vec<i64>,
    vectors: Vec<f32>,
    trained: bool,
    blacklist: Blacklist,
}

impl FlatIndex {
    pub fn new(metric: Metric, dim: usize) -> Self {
        Self {
            metric,
            dim,
            ids: Vec::new(),
            vectors: Vec::new(),
            trained: false,
            blacklist: Blacklist::default(),
        }
    }

    pub(crate) fn load(blob: &[u8]) -> Result<Self> {
        let (header, mut cursor) = codec::open_blob(blob)?;
        if header.kind != IndexKind::Flat {
            return Err(IndexError::CorruptBlob(format!(
                "expected FLAT blob, found {}",
                header.kind.as_str()
            )));
        }
        let ids = codec::take_i64s(&mut cursor, header.count)?;
        let vectors = codec::take_f32s(&mut cursor, header.count * header.dim)?;
        Ok(Self {
            metric: header.metric,
            dim: header.dim,
            ids,
            vectors,
            trained: true,
            blacklist: Blacklist::default(),
        })
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dim..(i + 1) * self.dim]
    }
}

impl VectorIndex for FlatIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn count(&self) -> usize {
        self.ids.len()
    }

    fn train(&mut self, dataset: &Dataset<'_>, _params: &IndexParams) -> Result<()> {
        // Nothing to learn; train only fixes the dimension.
        if dataset.dim != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: dataset.dim,
            });
        }
        self.trained = true;
        Ok(())
    }

    fn add(&mut self, dataset: &Dataset<'_>) -> Result<()> {
        if !self.trained {
            return Err(IndexError::NotTrained);
        }
        if dataset.dim != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: dataset.dim,
            });
        }
        self.ids.extend_from_slice(dataset.ids);
        self.vectors.extend_from_slice(dataset.vectors);
        Ok(())
    }

    fn search(&self, queries: &[f32], k: usize, _params: &SearchParams) -> Result<SearchResult> {
        if queries.len() % self.dim != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: queries.len(),
            });
        }
        let nq = queries.len() / self.dim;
        let mut ids = Vec::with_capacity(nq * k);
        let mut distances = Vec::with_capacity(nq * k);
        for q in 0..nq {
            let query = &queries[q * self.dim..(q + 1) * self.dim];
            let mut topk = TopK::new(k, self.metric);
            for pos in 0..self.ids.len() {
                if self.blacklist.contains(pos) {
                    continue;
                }
                topk.push(self.ids[pos], self.metric.score(query, self.row(pos)));
            }
            let (q_ids, q_dists) = topk.into_sorted();
            ids.extend(q_ids);
            distances.extend(q_dists);
        }
        Ok(SearchResult { k, ids, distances })
    }

    fn reconstruct(&self, id: i64) -> Option<Vec<f32>> {
        self.ids
            .iter()
            .position(|stored| *stored == id)
            .map(|pos| self.row(pos).to_vec())
    }

    fn serialize(&self) -> Result<Bytes> {
        let mut buf = codec::start_blob(&BlobHeader {
            kind: IndexKind::Flat,
            metric: self.metric,
            dim: self.dim,
            count: self.ids.len(),
        });
        codec::put_i64s(&mut buf, &self.ids);
        codec::put_f32s(&mut buf, &self.vectors);
        Ok(codec::finish_blob(buf))
    }

    fn set_blacklist(&mut self, bits: Blacklist) {
        self.blacklist = bits;
    }

    fn get_blacklist(&self) -> &Blacklist {
        &self.blacklist
    }
}
