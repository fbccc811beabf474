//! IVF_SQ8: inverted-file index over 8-bit scalar-quantized vectors.
//!
//! Rows are stored as i8 codes with one scale per row (symmetric range,
//! `value ≈ code * scale`), cutting residency to a quarter of IVF_FLAT.
//! Scoring dequantizes on the fly, so results are approximate within
//! quantization error.
//!
//! The same structure backs IVF_SQ8H; the hybrid kind only differs in its
//! (absent in this build) GPU coarse-probe path.

use crate::codec::{self, BlobHeader};
use crate::contract::{Dataset, VectorIndex};
use crate::kmeans;
use crate::types::{Blacklist, IndexKind, IndexParams, Metric, SearchParams, SearchResult, TopK};
use crate::{IndexError, Result};
use bytes::{Buf, BufMut, Bytes};

pub struct IvfSq8Index {
    metric: Metric,
    dim: usize,
    hybrid: bool,
    centroids: Vec<f32>,
    lists: Vec<Vec<u32>>,
    ids: Vec<i64>,
    /// One scale per row.
    scales: Vec<f32>,
    /// `rows * dim` i8 codes.
    codes: Vec<i8>,
    blacklist: Blacklist,
}

fn quantize_row(row: &[f32]) -> (f32, Vec<i8>) {
    let mut max_abs = 0.0f32;
    for &x in row {
        max_abs = max_abs.max(x.abs());
    }
    let scale = if max_abs <= f32::EPSILON {
        1.0
    } else {
        max_abs / 127.0
    };
    let codes = row
        .iter()
        .map(|&x| (x / scale).round().clamp(-127.0, 127.0) as i8)
        .collect();
    (scale, codes)
}

impl IvfSq8Index {
    pub fn new(metric: Metric, dim: usize, hybrid: bool) -> Self {
        Self {
            metric,
            dim,
            hybrid,
            centroids: Vec::new(),
            lists: Vec::new(),
            ids: Vec::new(),
            scales: Vec::new(),
            codes: Vec::new(),
            blacklist: Blacklist::default(),
        }
    }

    fn trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn score_row(&self, query: &[f32], pos: usize) -> f32 {
        let scale = self.scales[pos];
        let codes = &self.codes[pos * self.dim..(pos + 1) * self.dim];
        match self.metric {
            Metric::L2 => {
                let mut sum = 0.0f32;
                for (q, c) in query.iter().zip(codes) {
                    let d = q - *c as f32 * scale;
                    sum += d * d;
                }
                sum
            }
            Metric::Ip => {
                let mut sum = 0.0f32;
                for (q, c) in query.iter().zip(codes) {
                    sum += q * *c as f32 * scale;
                }
                sum
            }
        }
    }

    pub(crate) fn load(blob: &[u8]) -> Result<Self> {
        let (header, mut cursor) = codec::open_blob(blob)?;
        let hybrid = match header.kind {
            IndexKind::IvfSq8 => false,
            IndexKind::IvfSq8h => true,
            other => {
                return Err(IndexError::CorruptBlob(format!(
                    "expected IVF_SQ8 blob, found {}",
                    other.as_str()
                )))
            }
        };
        if cursor.remaining() < 4 {
            return Err(IndexError::CorruptBlob("missing nlist".into()));
        }
        let nlist = cursor.get_u32_le() as usize;
        let centroids = codec::take_f32s(&mut cursor, nlist * header.dim)?;
        let ids = codec::take_i64s(&mut cursor, header.count)?;
        let scales = codec::take_f32s(&mut cursor, header.count)?;
        let codes: Vec<i8> = codec::take_bytes(&mut cursor, header.count * header.dim)?
            .into_iter()
            .map(|b| b as i8)
            .collect();

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
            hybrid,
            centroids,
            lists,
            ids,
            scales,
            codes,
            blacklist: Blacklist::default(),
        })
    }
}

impl VectorIndex for IvfSq8Index {
    fn kind(&self) -> IndexKind {
        if self.hybrid {
            IndexKind::IvfSq8h
        } else {
            IndexKind::IvfSq8
        }
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
        self.centroids = kmeans::train(
            dataset.vectors,
            self.dim,
            params.nlist()?,
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
            let row = dataset.row(i);
            let pos = self.ids.len() as u32;
            let list = kmeans::nearest(&self.centroids, self.dim, row);
            let (scale, codes) = quantize_row(row);
            self.lists[list].push(pos);
            self.ids.push(dataset.ids[i]);
            self.scales.push(scale);
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
            let ranked = kmeans::rank(&self.centroids, self.dim, query);
            let mut topk = TopK::new(k, self.metric);
            for list in ranked.into_iter().take(params.nprobe.max(1)) {
                for &pos in &self.lists[list] {
                    let pos = pos as usize;
                    if self.blacklist.contains(pos) {
                        continue;
                    }
                    topk.push(self.ids[pos], self.score_row(query, pos));
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
        let scale = self.scales[pos];
        Some(
            self.codes[pos * self.dim..(pos + 1) * self.dim]
                .iter()
                .map(|&c| c as f32 * scale)
                .collect(),
        )
    }

    fn serialize(&self) -> Result<Bytes> {
        if !self.trained() {
            return Err(IndexError::NotTrained);
        }
        let mut buf = codec::start_blob(&BlobHeader {
            kind: self.kind(),
            metric: self.metric,
            dim: self.dim,
            count: self.ids.len(),
        });
        buf.put_u32_le((self.centroids.len() / self.dim) as u32);
        codec::put_f32s(&mut buf, &self.centroids);
        codec::put_i64s(&mut buf, &self.ids);
        codec::put_f32s(&mut buf, &self.scales);
        buf.extend(self.codes.iter().map(|&c| c as u8));

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
