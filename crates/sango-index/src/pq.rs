//! IVF_PQ: inverted-file index over product-quantized codes.
//!
//! Vectors are split into `m` sub-spaces; each sub-space gets its own
//! k-means codebook (up to 256 entries, one byte per code). A query
//! precomputes a lookup table of per-sub-space contributions against every
//! codebook entry, then scores candidates with `m` table lookups instead of
//! a full `dim`-float scan.

use crate::codec::{self, BlobHeader};
use crate::contract::{Dataset, VectorIndex};
use crate::distance::{inner_product, l2_squared};
use crate::kmeans;
use crate::types::{Blacklist, IndexKind, IndexParams, Metric, SearchParams, SearchResult, TopK};
use crate::{IndexError, Result};
use bytes::{Buf, BufMut, Bytes};

const MAX_CODEBOOK: usize = 256;

pub struct IvfPqIndex {
    metric: Metric,
    dim: usize,
    centroids: Vec<f32>,
    lists: Vec<Vec<u32>>,
    /// Sub-quantizer count; `dim % m == 0`.
    m: usize,
    /// Codebook entries per sub-space (≤ 256).
    ksub: usize,
    /// `m * ksub * (dim / m)` floats.
    codebooks: Vec<f32>,
    ids: Vec<i64>,
    /// `rows * m` bytes.
    codes: Vec<u8>,
    blacklist: Blacklist,
}

impl IvfPqIndex {
    pub fn new(metric: Metric, dim: usize) -> Self {
        Self {
            metric,
            dim,
            centroids: Vec::new(),
            lists: Vec::new(),
            m: 0,
            ksub: 0,
            codebooks: Vec::new(),
            ids: Vec::new(),
            codes: Vec::new(),
            blacklist: Blacklist::default(),
        }
    }

    fn trained(&self) -> bool {
        !self.codebooks.is_empty()
    }

    fn sub_dim(&self) -> usize {
        self.dim / self.m
    }

    fn codebook_entry(&self, sub: usize, code: usize) -> &[f32] {
        let sub_dim = self.sub_dim();
        let base = (sub * self.ksub + code) * sub_dim;
        &self.codebooks[base..base + sub_dim]
    }

    fn encode_row(&self, row: &[f32]) -> Vec<u8> {
        let sub_dim = self.sub_dim();
        (0..self.m)
            .map(|sub| {
                let slice = &row[sub * sub_dim..(sub + 1) * sub_dim];
                let sub_book = &self.codebooks
                    [sub * self.ksub * sub_dim..(sub + 1) * self.ksub * sub_dim];
                kmeans::nearest(sub_book, sub_dim, slice) as u8
            })
            .collect()
    }

    /// Per-query lookup table: `m * ksub` contributions. Summing one entry
    /// per sub-space yields the (approximate) metric value for a row.
    fn lookup_table(&self, query: &[f32]) -> Vec<f32> {
        let sub_dim = self.sub_dim();
        let mut table = Vec::with_capacity(self.m * self.ksub);
        for sub in 0..self.m {
            let q = &query[sub * sub_dim..(sub + 1) * sub_dim];
            for code in 0..self.ksub {
                let entry = self.codebook_entry(sub, code);
                table.push(match self.metric {
                    Metric::L2 => l2_squared(q, entry),
                    Metric::Ip => inner_product(q, entry),
                });
            }
        }
        table
    }

    fn score_row(&self, table: &[f32], pos: usize) -> f32 {
        let codes = &self.codes[pos * self.m..(pos + 1) * self.m];
        codes
            .iter()
            .enumerate()
            .map(|(sub, &code)| table[sub * self.ksub + code as usize])
            .sum()
    }

    pub(crate) fn load(blob: &[u8]) -> Result<Self> {
        let (header, mut cursor) = codec::open_blob(blob)?;
        if header.kind != IndexKind::IvfPq {
            return Err(IndexError::CorruptBlob(format!(
                "expected IVF_PQ blob, found {}",
                header.kind.as_str()
            )));
        }
        if cursor.remaining() < 12 {
            return Err(IndexError::CorruptBlob("missing pq header".into()));
        }
        let nlist = cursor.get_u32_le() as usize;
        let m = cursor.get_u32_le() as usize;
        let ksub = cursor.get_u32_le() as usize;
        if m == 0 || header.dim % m != 0 || ksub == 0 || ksub > MAX_CODEBOOK {
            return Err(IndexError::CorruptBlob(format!(
                "implausible pq shape m={m} ksub={ksub}"
            )));
        }
        let centroids = codec::take_f32s(&mut cursor, nlist * header.dim)?;
        let codebooks = codec::take_f32s(&mut cursor, m * ksub * (header.dim / m))?;
        let ids = codec::take_i64s(&mut cursor, header.count)?;
        let codes = codec::take_bytes(&mut cursor, header.count * m)?;

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
            m,
            ksub,
            codebooks,
            ids,
            codes,
            blacklist: Blacklist::default(),
        })
    }
}

impl VectorIndex for IvfPqIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::IvfPq
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
        let seed = params.seed()?;
        self.m = params.pq_m(self.dim)?;
        self.ksub = MAX_CODEBOOK.min(dataset.rows());

        self.centroids = kmeans::train(
            dataset.vectors,
            self.dim,
            params.nlist()?,
            kmeans::DEFAULT_ITERATIONS,
            seed,
        );
        self.lists = vec![Vec::new(); self.centroids.len() / self.dim];

        // One codebook per sub-space, trained on that sub-space's slices.
        let sub_dim = self.dim / self.m;
        let mut codebooks = Vec::with_capacity(self.m * self.ksub * sub_dim);
        let mut slice_buf = Vec::with_capacity(dataset.rows() * sub_dim);
        for sub in 0..self.m {
            slice_buf.clear();
            for row in 0..dataset.rows() {
                let v = dataset.row(row);
                slice_buf.extend_from_slice(&v[sub * sub_dim..(sub + 1) * sub_dim]);
            }
            let book = kmeans::train(
                &slice_buf,
                sub_dim,
                self.ksub,
                kmeans::DEFAULT_ITERATIONS,
                seed.wrapping_add(sub as u64 + 1),
            );
            debug_assert_eq!(book.len(), self.ksub * sub_dim);
            codebooks.extend(book);
        }
        self.codebooks = codebooks;
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
            let row = dataset.row(i);
            let pos = self.ids.len() as u32;
            let list = kmeans::nearest(&self.centroids, self.dim, row);
            let codes = self.encode_row(row);
            self.lists[list].push(pos);
            self.ids.push(dataset.ids[i]);
            self.codes.extend(codes);
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
            let query = &queries[q * self.dim..(q + 1) * self.dim];
            let table = self.lookup_table(query);
            let ranked = kmeans::rank(&self.centroids, self.dim, query);
            let mut topk = TopK::new(k, self.metric);
            for list in ranked.into_iter().take(params.nprobe.max(1)) {
                for &pos in &self.lists[list] {
                    let pos = pos as usize;
                    if self.blacklist.contains(pos) {
                        continue;
                    }
                    topk.push(self.ids[pos], self.score_row(&table, pos));
                }
            }
            let (q_ids, q_dists) = topk.into_sorted();
            ids.extend(q_ids);
            distances.extend(q_dists);
        }
        Ok(SearchResult { k, ids, distances })
    }

    fn reconstruct(&self, id: i64) -> Option<Vec<f32>> {
        let pos = self.ids.iter().position(|stored| *stored == id)?;
        let codes = &self.codes[pos * self.m..(pos + 1) * self.m];
        let mut row = Vec::with_capacity(self.dim);
        for (sub, &code) in codes.iter().enumerate() {
            row.extend_from_slice(self.codebook_entry(sub, code as usize));
        }
        Some(row)
    }

    fn serialize(&self) -> Result<Bytes> {
        if !self.trained() {
            return Err(IndexError::NotTrained);
        }
        let mut buf = codec::start_blob(&BlobHeader {
            kind: IndexKind::IvfPq,
            metric: self.metric,
            dim: self.dim,
            count: self.ids.len(),
        });
        buf.put_u32_le((self.centroids.len() / self.dim) as u32);
        buf.put_u32_le(self.m as u32);
        buf.put_u32_le(self.ksub as u32);
        codec::put_f32s(&mut buf, &self.centroids);
        codec::put_f32s(&mut buf, &self.codebooks);
        codec::put_i64s(&mut buf, &self.ids);
        buf.put_slice(&self.codes);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::build_index;
    use crate::load_index;

    fn params(nlist: usize, m: usize) -> IndexParams {
        IndexParams::from_json(serde_json::json!({ "nlist": nlist, "m": m })).unwrap()
    }

    fn clustered_dataset() -> (Vec<i64>, Vec<f32>) {
        // Two well-separated clusters of 8-dim vectors.
        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        for i in 0..30i64 {
            ids.push(i);
            let base = if i < 15 { 0.0 } else { 100.0 };
            for d in 0..8 {
                vectors.push(base + (i % 5) as f32 * 0.1 + d as f32 * 0.01);
            }
        }
        (ids, vectors)
    }

    #[test]
    fn test_rejects_indivisible_m() {
        let ids = [1i64];
        let vectors = [0.0f32; 6];
        let dataset = Dataset::new(6, &ids, &vectors).unwrap();
        let mut index = IvfPqIndex::new(Metric::L2, 6);
        assert!(matches!(
            index.train(&dataset, &params(1, 4)),
            Err(IndexError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_search_lands_in_right_cluster() {
        let (ids, vectors) = clustered_dataset();
        let dataset = Dataset::new(8, &ids, &vectors).unwrap();
        let index = build_index(IndexKind::IvfPq, Metric::L2, &dataset, &params(2, 4)).unwrap();

        let query: Vec<f32> = (0..8).map(|d| 100.0 + d as f32 * 0.01).collect();
        let result = index.search(&query, 5, &SearchParams { nprobe: 2 }).unwrap();
        for id in &result.ids {
            assert!(*id >= 15, "hit {id} came from the wrong cluster");
        }
    }

    #[test]
    fn test_serialize_roundtrip_search_identical() {
        let (ids, vectors) = clustered_dataset();
        let dataset = Dataset::new(8, &ids, &vectors).unwrap();
        let index = build_index(IndexKind::IvfPq, Metric::L2, &dataset, &params(2, 4)).unwrap();

        let blob = index.serialize().unwrap();
        let restored = load_index(&blob).unwrap();
        assert_eq!(restored.kind(), IndexKind::IvfPq);
        assert_eq!(restored.count(), 30);

        let query: Vec<f32> = (0..8).map(|d| d as f32).collect();
        let search = SearchParams { nprobe: 2 };
        assert_eq!(
            index.search(&query, 4, &search).unwrap(),
            restored.search(&query, 4, &search).unwrap()
        );
    }

    #[test]
    fn test_reconstruct_lands_near_original() {
        let (ids, vectors) = clustered_dataset();
        let dataset = Dataset::new(8, &ids, &vectors).unwrap();
        let index = build_index(IndexKind::IvfPq, Metric::L2, &dataset, &params(2, 4)).unwrap();

        let approx = index.reconstruct(20).unwrap();
        let exact = dataset.row(20);
        // Coarse bound: reconstruction must stay in the row's cluster.
        assert!(l2_squared(&approx, exact) < 10.0);
    }
}
