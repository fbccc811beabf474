//! In-memory insert staging, one buffer per (table, partition).
//!
//! Rows land here after their WAL record is durable and leave as a whole
//! segment at flush time. Buffered rows are not visible to queries.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Rows staged for one partition.
#[derive(Debug)]
pub(crate) struct PartitionBuffer {
    pub table: String,
    pub partition: String,
    pub dim: usize,
    pub ids: Vec<i64>,
    pub vectors: Vec<f32>,
    /// Highest WAL LSN contributing rows to this buffer.
    pub max_lsn: u64,
    /// When the oldest still-buffered row arrived.
    pub oldest: Instant,
}

impl PartitionBuffer {
    pub fn rows(&self) -> usize {
        self.ids.len()
    }

    pub fn bytes(&self) -> u64 {
        (self.vectors.len() * 4 + self.ids.len() * 8) as u64
    }
}

/// All live buffers plus the global byte count backing the pressure
/// watermark.
#[derive(Default)]
pub(crate) struct BufferSet {
    inner: Mutex<HashMap<(String, String), PartitionBuffer>>,
    total_bytes: AtomicU64,
}

impl BufferSet {
    /// Appends rows, returning (buffer bytes, global bytes) after the push.
    pub fn push(
        &self,
        table: &str,
        partition: &str,
        dim: usize,
        ids: &[i64],
        vectors: &[f32],
        lsn: u64,
    ) -> (u64, u64) {
        let added = (vectors.len() * 4 + ids.len() * 8) as u64;
        let mut inner = self.inner.lock();
        let buffer = inner
            .entry((table.to_string(), partition.to_string()))
            .or_insert_with(|| PartitionBuffer {
                table: table.to_string(),
                partition: partition.to_string(),
                dim,
                ids: Vec::new(),
                vectors: Vec::new(),
                max_lsn: 0,
                oldest: Instant::now(),
            });
        buffer.ids.extend_from_slice(ids);
        buffer.vectors.extend_from_slice(vectors);
        buffer.max_lsn = buffer.max_lsn.max(lsn);
        let buffer_bytes = buffer.bytes();
        let total = self.total_bytes.fetch_add(added, Ordering::Relaxed) + added;
        (buffer_bytes, total)
    }

    /// Drops buffered rows whose id is in `ids`; returns how many went.
    pub fn remove_ids(&self, table: &str, ids: &[i64]) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0usize;
        for buffer in inner.values_mut() {
            if buffer.table != table {
                continue;
            }
            let before = buffer.bytes();
            let dim = buffer.dim;
            let mut keep = 0usize;
            for pos in 0..buffer.ids.len() {
                if ids.contains(&buffer.ids[pos]) {
                    removed += 1;
                    continue;
                }
                if keep != pos {
                    buffer.ids[keep] = buffer.ids[pos];
                    let (dst, src) = (keep * dim, pos * dim);
                    buffer.vectors.copy_within(src..src + dim, dst);
                }
                keep += 1;
            }
            buffer.ids.truncate(keep);
            buffer.vectors.truncate(keep * dim);
            self.total_bytes
                .fetch_sub(before - buffer.bytes(), Ordering::Relaxed);
        }
        removed
    }

    fn detach(&self, buffer: PartitionBuffer) -> PartitionBuffer {
        self.total_bytes.fetch_sub(buffer.bytes(), Ordering::Relaxed);
        buffer
    }

    /// Takes one partition's buffer, if it holds rows.
    pub fn take_partition(&self, table: &str, partition: &str) -> Option<PartitionBuffer> {
        let mut inner = self.inner.lock();
        let key = (table.to_string(), partition.to_string());
        if inner.get(&key).is_none_or(|b| b.rows() == 0) {
            return None;
        }
        inner.remove(&key).map(|b| self.detach(b))
    }

    /// Takes every non-empty buffer of `table` (every table when `None`).
    pub fn take_table(&self, table: Option<&str>) -> Vec<PartitionBuffer> {
        let mut inner = self.inner.lock();
        let keys: Vec<_> = inner
            .keys()
            .filter(|(t, _)| table.is_none_or(|want| t == want))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| inner.remove(&key))
            .filter(|b| b.rows() > 0)
            .map(|b| self.detach(b))
            .collect()
    }

    /// Takes buffers that have been sitting for at least `min_age`.
    pub fn take_aged(&self, min_age: Duration) -> Vec<PartitionBuffer> {
        let mut inner = self.inner.lock();
        let keys: Vec<_> = inner
            .iter()
            .filter(|(_, b)| b.rows() > 0 && b.oldest.elapsed() >= min_age)
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| inner.remove(&key))
            .map(|b| self.detach(b))
            .collect()
    }

    /// Takes the single largest buffer, if any.
    pub fn take_largest(&self) -> Option<PartitionBuffer> {
        let mut inner = self.inner.lock();
        let key = inner
            .iter()
            .filter(|(_, b)| b.rows() > 0)
            .max_by_key(|(_, b)| b.bytes())
            .map(|(k, _)| k.clone())?;
        inner.remove(&key).map(|b| self.detach(b))
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_take() {
        let buffers = BufferSet::default();
        buffers.push("t", "p", 2, &[1, 2], &[0.0, 1.0, 2.0, 3.0], 5);
        buffers.push("t", "p", 2, &[3], &[4.0, 5.0], 6);

        let taken = buffers.take_table(Some("t"));
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].ids, vec![1, 2, 3]);
        assert_eq!(taken[0].max_lsn, 6);
        assert_eq!(buffers.total_bytes(), 0);
    }

    #[test]
    fn test_remove_ids_compacts_rows() {
        let buffers = BufferSet::default();
        buffers.push("t", "p", 2, &[1, 2, 3], &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0], 1);

        assert_eq!(buffers.remove_ids("t", &[2]), 1);
        let taken = buffers.take_table(Some("t"));
        assert_eq!(taken[0].ids, vec![1, 3]);
        assert_eq!(taken[0].vectors, vec![1.0, 1.0, 3.0, 3.0]);
    }

    #[test]
    fn test_remove_ids_scoped_to_table() {
        let buffers = BufferSet::default();
        buffers.push("a", "p", 1, &[1], &[0.0], 1);
        buffers.push("b", "p", 1, &[1], &[0.0], 2);

        assert_eq!(buffers.remove_ids("a", &[1]), 1);
        assert_eq!(buffers.take_table(Some("b"))[0].ids, vec![1]);
    }

    #[test]
    fn test_take_largest() {
        let buffers = BufferSet::default();
        buffers.push("t", "small", 1, &[1], &[0.0], 1);
        buffers.push("t", "big", 1, &[1, 2, 3], &[0.0, 1.0, 2.0], 2);

        let largest = buffers.take_largest().unwrap();
        assert_eq!(largest.partition, "big");
    }

    #[test]
    fn test_take_aged_respects_age() {
        let buffers = BufferSet::default();
        buffers.push("t", "p", 1, &[1], &[0.0], 1);
        assert!(buffers.take_aged(Duration::from_secs(60)).is_empty());
        assert_eq!(buffers.take_aged(Duration::ZERO).len(), 1);
    }
}
