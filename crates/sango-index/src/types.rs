//! Shared types: metric, index kind, parameter bags, blacklist bitset and
//! the bounded top-k accumulator used by every family.

use crate::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Sentinel id padded into result slots that hold no real hit.
pub const SENTINEL_ID: i64 = -1;

/// Distance metric. L2 distances are squared and ordered ascending; inner
/// product scores are ordered descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Metric {
    L2,
    Ip,
}

impl Metric {
    /// Distance value for an unfillable result slot.
    pub fn sentinel_distance(self) -> f32 {
        match self {
            Metric::L2 => f32::INFINITY,
            Metric::Ip => f32::NEG_INFINITY,
        }
    }

    /// True if `a` is a strictly better score than `b` under this metric.
    pub fn better(self, a: f32, b: f32) -> bool {
        match self {
            Metric::L2 => a < b,
            Metric::Ip => a > b,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::L2 => "L2",
            Metric::Ip => "IP",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "L2" => Ok(Metric::L2),
            "IP" => Ok(Metric::Ip),
            other => Err(IndexError::InvalidParameter(format!(
                "unknown metric {other:?}"
            ))),
        }
    }

    pub(crate) fn to_tag(self) -> u8 {
        match self {
            Metric::L2 => 0,
            Metric::Ip => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Metric::L2),
            1 => Ok(Metric::Ip),
            other => Err(IndexError::CorruptBlob(format!("bad metric tag {other}"))),
        }
    }
}

/// Index family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexKind {
    Flat,
    IvfFlat,
    IvfSq8,
    /// SQ8 with a GPU-hybrid search path. This build trains and searches it
    /// on CPU; the hybrid path is an unsupported capability.
    IvfSq8h,
    IvfPq,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Flat => "FLAT",
            IndexKind::IvfFlat => "IVF_FLAT",
            IndexKind::IvfSq8 => "IVF_SQ8",
            IndexKind::IvfSq8h => "IVF_SQ8H",
            IndexKind::IvfPq => "IVF_PQ",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "FLAT" => Ok(IndexKind::Flat),
            "IVF_FLAT" => Ok(IndexKind::IvfFlat),
            "IVF_SQ8" => Ok(IndexKind::IvfSq8),
            "IVF_SQ8H" => Ok(IndexKind::IvfSq8h),
            "IVF_PQ" => Ok(IndexKind::IvfPq),
            other => Err(IndexError::InvalidParameter(format!(
                "unknown index kind {other:?}"
            ))),
        }
    }

    pub(crate) fn to_tag(self) -> u8 {
        match self {
            IndexKind::Flat => 0,
            IndexKind::IvfFlat => 1,
            IndexKind::IvfSq8 => 2,
            IndexKind::IvfSq8h => 3,
            IndexKind::IvfPq => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(IndexKind::Flat),
            1 => Ok(IndexKind::IvfFlat),
            2 => Ok(IndexKind::IvfSq8),
            3 => Ok(IndexKind::IvfSq8h),
            4 => Ok(IndexKind::IvfPq),
            other => Err(IndexError::CorruptBlob(format!("bad kind tag {other}"))),
        }
    }
}

/// Build-time parameters: the key-value `extra` bag of an index spec with
/// typed accessors for the keys the families understand. Unknown keys are
/// ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IndexParams {
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl IndexParams {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(extra) => Ok(Self { extra }),
            serde_json::Value::Null => Ok(Self::default()),
            other => Err(IndexError::InvalidParameter(format!(
                "index params must be an object, got {other}"
            ))),
        }
    }

    fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.extra.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| IndexError::InvalidParameter(format!("{key} must be an integer"))),
        }
    }

    /// Number of inverted lists (IVF families). Defaults to 256.
    pub fn nlist(&self) -> Result<usize> {
        let nlist = self.get_usize("nlist")?.unwrap_or(256);
        if nlist == 0 {
            return Err(IndexError::InvalidParameter("nlist must be >= 1".into()));
        }
        Ok(nlist)
    }

    /// Sub-quantizer count for IVF_PQ. Defaults to the largest of
    /// 16/8/4/2/1 that divides the dimension.
    pub fn pq_m(&self, dim: usize) -> Result<usize> {
        match self.get_usize("m")? {
            Some(m) => {
                if m == 0 || dim % m != 0 {
                    return Err(IndexError::InvalidParameter(format!(
                        "m={m} must divide dimension {dim}"
                    )));
                }
                Ok(m)
            }
            None => Ok([16usize, 8, 4, 2, 1]
                .into_iter()
                .find(|m| dim % m == 0)
                .unwrap_or(1)),
        }
    }

    /// Training seed; k-means is deterministic given this.
    pub fn seed(&self) -> Result<u64> {
        match self.extra.get("seed") {
            None => Ok(0x5A4E_474F),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| IndexError::InvalidParameter("seed must be an integer".into())),
        }
    }
}

/// Query-time parameters.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// Inverted lists visited per query (IVF families). Defaults to 16.
    pub nprobe: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self { nprobe: 16 }
    }
}

/// Per-segment deletion mask with copy-on-write sharing.
///
/// Bit `i` masks row position `i` of one segment. Clones share storage;
/// `set` detaches before mutating so a mask handed to another index or an
/// in-flight query never observes later mutations.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    bits: Arc<Vec<u8>>,
    len: usize,
}

impl Blacklist {
    pub fn with_len(len: usize) -> Self {
        Self {
            bits: Arc::new(vec![0u8; len.div_ceil(8)]),
            len,
        }
    }

    /// Rebuilds a mask from its packed on-disk form.
    pub fn from_bytes(bytes: Vec<u8>, len: usize) -> Result<Self> {
        if bytes.len() != len.div_ceil(8) {
            return Err(IndexError::CorruptBlob(format!(
                "blacklist length {} does not cover {} rows",
                bytes.len(),
                len
            )));
        }
        Ok(Self {
            bits: Arc::new(bytes),
            len,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, pos: usize) {
        debug_assert!(pos < self.len);
        let bits = Arc::make_mut(&mut self.bits);
        bits[pos / 8] |= 1 << (pos % 8);
    }

    pub fn contains(&self, pos: usize) -> bool {
        pos < self.len && self.bits[pos / 8] & (1 << (pos % 8)) != 0
    }

    /// Number of masked rows.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// True when no row is masked.
    pub fn is_clear(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }
}

/// One query's search output slice lives at `ids[q*k..(q+1)*k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub k: usize,
    pub ids: Vec<i64>,
    pub distances: Vec<f32>,
}

impl SearchResult {
    pub fn empty(nq: usize, k: usize, metric: Metric) -> Self {
        Self {
            k,
            ids: vec![SENTINEL_ID; nq * k],
            distances: vec![metric.sentinel_distance(); nq * k],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    id: i64,
    distance: f32,
    metric: Metric,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Greater = worse, so the heap root is the candidate to evict.
    fn cmp(&self, other: &Self) -> Ordering {
        let by_distance = match self.metric {
            Metric::L2 => self.distance.total_cmp(&other.distance),
            Metric::Ip => other.distance.total_cmp(&self.distance),
        };
        // Higher id is worse on equal distance, so ties resolve to lower ids.
        by_distance.then_with(|| self.id.cmp(&other.id))
    }
}

/// Bounded best-k accumulator with deterministic tie-breaking (equal
/// distances resolve to the lower id).
pub struct TopK {
    k: usize,
    metric: Metric,
    heap: BinaryHeap<HeapEntry>,
}

impl TopK {
    pub fn new(k: usize, metric: Metric) -> Self {
        Self {
            k,
            metric,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn push(&mut self, id: i64, distance: f32) {
        if self.k == 0 {
            return;
        }
        let entry = HeapEntry {
            id,
            distance,
            metric: self.metric,
        };
        if self.heap.len() < self.k {
            self.heap.push(entry);
        } else if entry < *self.heap.peek().unwrap() {
            self.heap.pop();
            self.heap.push(entry);
        }
    }

    /// Current worst kept distance, if the accumulator is full.
    pub fn threshold(&self) -> Option<f32> {
        if self.heap.len() == self.k {
            self.heap.peek().map(|e| e.distance)
        } else {
            None
        }
    }

    /// Drains into exactly `k` (id, distance) pairs, best first,
    /// sentinel-padded.
    pub fn into_sorted(self) -> (Vec<i64>, Vec<f32>) {
        let metric = self.metric;
        let mut entries = self.heap.into_sorted_vec();
        entries.truncate(self.k);
        let mut ids = Vec::with_capacity(self.k);
        let mut distances = Vec::with_capacity(self.k);
        for e in &entries {
            ids.push(e.id);
            distances.push(e.distance);
        }
        while ids.len() < self.k {
            ids.push(SENTINEL_ID);
            distances.push(metric.sentinel_distance());
        }
        (ids, distances)
    }
}
