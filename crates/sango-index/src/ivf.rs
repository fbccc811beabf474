//! IVF_FLAT: inverted-file index over raw vectors.
//!
//! Training clusters the dataset into `nlist` coarse centroids; each row is
//! assigned to its nearest list. A query ranks the centroids, visits the
//! `nprobe` closest lists and scans their raw vectors exactly.

use crate::codec::{self, BlobHeader};
use crate::contract::{Dataset, VectorIndex};
use crate::kmeans;
use crate::types::{Blacklist, IndexKind, IndexParams, Metric, SearchParams, SearchResult, TopK};
use crate::{IndexError, Result};
use bytes::{Buf, BufMut, Bytes};

pub struct IvfFlatIndex {
    metric: Metric,
    dim: usize,
    /// `nlist * dim` floats; empty until trained.
    centroids: Vec<f32>,
    /// Row positions per inverted list.
    lists: Vec<Vec<u32>>,
    /// Rows in insertion order; positions here are what the blacklist masks.
    ids: Vec<i64>,
    vectors: Vec<f32>,
    blacklist: Blacklist,
}

impl IvfFlatIndex {
    pub fn new(metric: Metric, dim: usize) -> Self {
        Self {
            metric,
            dim,
            centroids: Vec::new(),
            lists: Vec::new(),
            ids: Vec::new(),
            vectors: Vec::new(),
            blacklist: Blacklist::default(),
        }
    }

    fn nlist(&self) -> usize {
        self.lists.len()
    }

    fn trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn row(&self, pos: usize) -> &[f32] {
        &self.vectors[pos * self.dim..(pos + 1) * self.dim]
    }

    pub(crate) fn load(blob: &[u8]) -> Result<Self> {
        let (header, mut cursor) = codec::open_blob(blob)?;
        if header.kind != IndexKind::IvfFlat {
            return Err(IndexError::CorruptBlob(format!(
                "expected IVF_FLAT blob, found {}",
                header.kind.as_str()
            )));
        }
        if cursor.remaining() < 4 {
            return Err(IndexError::CorruptBlob("missing nlist".into()));
        }
        let nlist = cursor.get_u32_le() as usize;
        let centroids = codec::take_f32s(&mut cursor, nlist * header.dim)?;
        let ids = codec::take_i64s(&mut cursor, header.count)?;
        let vectors = codec::take_f32s(&mut cursor, header.count * header.dim)?;

        let mut lists = vec![Vec::new(); nlist];
        for pos in 0..header.count {
            if cursor.remaining() < 4 {
                return Err(IndexError::CorruptBlob("truncated assignments".into()));
            }
            let list = cursor.get_u32_le() as usize;
            if list >= nlist {
                return Err(IndexError::CorruptBlob(format!(
                    "assignment {list} out of {nlist} lists"
                )));
            }
            lists[list].push(pos as u32);
        }
        Ok(Self {
            metric: header.metric,
            dim: header.dim,
            centroids,
            lists,
            ids,
            vectors,
            blacklist: Blacklist::default(),
        })
    }

    fn scan_lists(&self, query: &[f32], k: usize, nprobe: usize) -> (Vec<i64>, Vec<f32>) {
        let ranked = kmeans::rank(&self.centroids, self.dim, query);
        let mut topk = TopK::new(k, self.metric);
        for list in ranked.into_iter().take(nprobe.max(1)) {
            for &pos in &self.lists[list] {
                let pos = pos as usize;
                if self.blacklist.contains(pos) {
                    continue;
                }
                topk.push(self.ids[pos], self.metric.score(query, self.row(pos)));
            }
        }
        topk.into_sorted()
    }
}

impl VectorIndex for IvfFlatIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::IvfFlat
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

    fn train(&mut self, dataset: &Dataset<'_>, params: &IndexParams) -> Result<()> {
        if dataset.dim != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: dataset.dim,
            });
        }
        if dataset.rows() == 0 {
            return Err(IndexError::InvalidParameter(
                "cannot train on an empty dataset".into(),
            ));
        }
        let nlist = params.nlist()?;
        self.centroids = kmeans::train(
            dataset.vectors,
            self.dim,
            nlist,
            kmeans::DEFAULT_ITERATIONS,
            params.seed()?,
        );
        self.lists = vec![Vec::new(); self.centroids.len() / self.dim];
        Ok(())
    }

    fn add(&mut self, dataset: &Dataset<'_>) -> Result<()> {
        if !self.trained() {
            return Err(IndexError::NotTrained);
        }
        if dataset.dim != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: dataset.dim,
            });
        }
        for i in 0..dataset.rows() {
            let pos = self.ids.len() as u32;
            let list = kmeans::nearest(&self.centroids, self.dim, dataset.row(i));
            self.lists[list].push(pos);
            self.ids.push(dataset.ids[i]);
            self.vectors.extend_from_slice(dataset.row(i));
        }
        Ok(())
    }

    fn search(&self, queries: &[f32], k: usize, params: &SearchParams) -> Result<SearchResult> {
        if !self.trained() {
            return Err(IndexError::NotTrained);
        }
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
            let (q_ids, q_dists) = self.scan_lists(
                &queries[q * self.dim..(q + 1) * self.dim],
                k,
                params.nprobe,
            );
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
        if !self.trained() {
            return Err(IndexError::NotTrained);
        }
        let mut buf = codec::start_blob(&BlobHeader {
            kind: IndexKind::IvfFlat,
            metric: self.metric,
            dim: self.dim,
            count: self.ids.len(),
        });
        buf.put_u32_le(self.nlist() as u32);
        codec::put_f32s(&mut buf, &self.centroids);
        codec::put_i64s(&mut buf, &self.ids);
        codec::put_f32s(&mut buf, &self.vectors);

        let mut assignments = vec![0u32; self.ids.len()];
        for (list, members) in self.lists.iter().enumerate() {
            for &pos in members {
                assignments[pos as usize] = list as u32;
            }
        }
        for a in assignments {
            buf.put_u32_le(a);
        }
        Ok(codec::finish_blob(buf))
    }

    fn set_blacklist(&mut self, bits: Blacklist) {
        self.blacklist = bits;
    }

    fn get_blacklist(&self) -> &Blacklist {
        &self.blacklist
    }
}
