//! Byte-bounded block cache over loaded segments.
//!
//! Entries are whole segments (raw rows plus the deserialized index, when
//! one exists) keyed by segment id. Eviction is least-recently-used with
//! pinning: a guard returned to a query pins its entry, and pinned entries
//! are never evicted. The stock `lru` crate cannot express pin-aware,
//! byte-weighted eviction, so the recency bookkeeping is a tick counter
//! here.
//!
//! An entry larger than the whole cache streams through unpinned (queries
//! must still succeed on an undersized cache); `insert` refuses instead,
//! which is what preloading wants.

use crate::catalog::SegmentInfo;
use crate::{Error, Result};
use parking_lot::Mutex;
use sango_index::{Blacklist, VectorIndex};
use sango_segment::SegmentData;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One loaded segment, immutable once cached. Deletions re-persist the
/// blacklist and invalidate the entry rather than mutating it, so in-flight
/// queries keep the snapshot they pinned.
pub(crate) struct CachedSegment {
    pub info: SegmentInfo,
    pub data: SegmentData,
    pub index: Option<Box<dyn VectorIndex>>,
    pub blacklist: Blacklist,
}

impl CachedSegment {
    fn bytes(&self) -> u64 {
        let index_bytes = self
            .index
            .as_ref()
            .map(|i| (i.count() * (i.dimension() * 4 + 8)) as u64)
            .unwrap_or(0);
        self.data.raw_bytes() + index_bytes + self.blacklist.as_bytes().len() as u64
    }
}

struct Entry {
    value: Arc<CachedSegment>,
    bytes: u64,
    last_used: u64,
    pins: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<u64, Entry>,
    bytes: u64,
    tick: u64,
}

pub(crate) struct BlockCache {
    capacity: u64,
    inner: Arc<Mutex<Inner>>,
}

/// Pinned handle to a cached (or streamed-through) segment. Dropping it
/// releases the pin.
pub(crate) struct CacheGuard {
    inner: Option<Arc<Mutex<Inner>>>,
    id: u64,
    value: Arc<CachedSegment>,
}

impl std::ops::Deref for CacheGuard {
    type Target = CachedSegment;

    fn deref(&self) -> &CachedSegment {
        &self.value
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            let mut inner = inner.lock();
            if let Some(entry) = inner.entries.get_mut(&self.id) {
                entry.pins = entry.pins.saturating_sub(1);
            }
        }
    }
}

impl BlockCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Returns the pinned entry for `id`, loading it with `load` on a miss.
    /// An entry too large for the cache is returned unpinned and uncached.
    pub fn get_or_load(
        &self,
        id: u64,
        load: impl FnOnce() -> Result<CachedSegment>,
    ) -> Result<CacheGuard> {
        if let Some(guard) = self.pin_existing(id) {
            return Ok(guard);
        }
        let value = Arc::new(load()?);
        self.admit(id, value, true)
    }

    /// Loads and caches without pinning; fails with `Capacity` when the
    /// entry cannot be made to fit. Used by table preloading.
    pub fn preload(
        &self,
        id: u64,
        load: impl FnOnce() -> Result<CachedSegment>,
    ) -> Result<()> {
        if self.pin_existing(id).is_some() {
            return Ok(());
        }
        let value = Arc::new(load()?);
        let bytes = value.bytes();
        if bytes > self.capacity {
            return Err(Error::Capacity(format!(
                "segment {id} ({bytes} bytes) exceeds cache capacity {}",
                self.capacity
            )));
        }
        self.admit(id, value, false).map(drop)
    }

    fn pin_existing(&self, id: u64) -> Option<CacheGuard> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(&id)?;
        entry.last_used = tick;
        entry.pins += 1;
        Some(CacheGuard {
            inner: Some(self.inner.clone()),
            id,
            value: entry.value.clone(),
        })
    }

    fn admit(&self, id: u64, value: Arc<CachedSegment>, pin: bool) -> Result<CacheGuard> {
        let bytes = value.bytes();

        // An entry bigger than the whole cache never enters it: hand it
        // straight to the caller and let it die with the guard.
        if bytes > self.capacity {
            debug!(segment = id, bytes, "segment bypasses cache");
            return Ok(CacheGuard {
                inner: None,
                id,
                value,
            });
        }

        let mut inner = self.inner.lock();

        // Lost a race against another loader: reuse theirs.
        if inner.entries.contains_key(&id) {
            drop(inner);
            if let Some(guard) = self.pin_existing(id) {
                return Ok(guard);
            }
            inner = self.inner.lock();
        }

        evict_unpinned(&mut inner, self.capacity.saturating_sub(bytes));

        if inner.bytes + bytes > self.capacity {
            // Everything left is pinned by active queries.
            let pinned_bytes: u64 = inner
                .entries
                .values()
                .filter(|e| e.pins > 0)
                .map(|e| e.bytes)
                .sum();
            return Err(Error::Capacity(format!(
                "cache exhausted: {pinned_bytes} bytes pinned, segment {id} needs {bytes}"
            )));
        }

        inner.tick += 1;
        let tick = inner.tick;
        inner.bytes += bytes;
        inner.entries.insert(
            id,
            Entry {
                value: value.clone(),
                bytes,
                last_used: tick,
                pins: usize::from(pin),
            },
        );
        Ok(CacheGuard {
            inner: pin.then(|| self.inner.clone()),
            id,
            value,
        })
    }

    /// Drops the entry for `id` if present (and unpinned readers keep their
    /// Arc alive independently).
    pub fn invalidate(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(&id) {
            inner.bytes -= entry.bytes;
        }
    }

    /// Evicts unpinned entries until usage is at or below `target`.
    pub fn evict_to(&self, target: u64) {
        let mut inner = self.inner.lock();
        evict_unpinned(&mut inner, target);
    }

    /// (used bytes, entry count).
    pub fn usage(&self) -> (u64, usize) {
        let inner = self.inner.lock();
        (inner.bytes, inner.entries.len())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

fn evict_unpinned(inner: &mut Inner, target: u64) {
    while inner.bytes > target {
        let victim = inner
            .entries
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| *id);
        match victim.and_then(|id| inner.entries.remove(&id).map(|e| (id, e))) {
            Some((id, entry)) => {
                inner.bytes -= entry.bytes;
                debug!(segment = id, bytes = entry.bytes, "cache evicted segment");
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SegmentState;

    fn info(id: u64) -> SegmentInfo {
        SegmentInfo {
            id,
            table: "t".into(),
            partition: "p".into(),
            state: SegmentState::Raw,
            row_count: 0,
            deleted_count: 0,
            size_bytes: 0,
            index_kind: None,
            max_lsn: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn entry(id: u64, rows: usize) -> CachedSegment {
        CachedSegment {
            info: info(id),
            data: SegmentData {
                dim: 2,
                ids: vec![0; rows],
                vectors: vec![0.0; rows * 2],
            },
            index: None,
            blacklist: Blacklist::with_len(rows),
        }
    }

    fn entry_bytes(rows: usize) -> u64 {
        entry(0, rows).bytes()
    }

    #[test]
    fn test_hit_returns_same_arc() {
        let cache = Arc::new(BlockCache::new(1 << 20));
        let a = cache.get_or_load(1, || Ok(entry(1, 4))).unwrap();
        let b = cache.get_or_load(1, || panic!("should be a hit")).unwrap();
        assert!(Arc::ptr_eq(&a.value, &b.value));
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = Arc::new(BlockCache::new(entry_bytes(4) * 2));
        drop(cache.get_or_load(1, || Ok(entry(1, 4))).unwrap());
        drop(cache.get_or_load(2, || Ok(entry(2, 4))).unwrap());
        // Touch 1 so 2 becomes the LRU victim.
        drop(cache.get_or_load(1, || panic!("hit")).unwrap());
        drop(cache.get_or_load(3, || Ok(entry(3, 4))).unwrap());

        let (_, count) = cache.usage();
        assert_eq!(count, 2);
        // 1 must have survived.
        drop(cache.get_or_load(1, || panic!("1 was evicted")).unwrap());
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let cache = Arc::new(BlockCache::new(entry_bytes(4) * 2));
        let pinned = cache.get_or_load(1, || Ok(entry(1, 4))).unwrap();
        drop(cache.get_or_load(2, || Ok(entry(2, 4))).unwrap());
        drop(cache.get_or_load(3, || Ok(entry(3, 4))).unwrap());

        // 1 is pinned, so 2 was the victim.
        assert_eq!(pinned.info.id, 1);
        drop(cache.get_or_load(1, || panic!("pinned entry evicted")).unwrap());
    }

    #[test]
    fn test_oversized_entry_streams_through() {
        let cache = Arc::new(BlockCache::new(64));
        let guard = cache.get_or_load(1, || Ok(entry(1, 1000))).unwrap();
        assert_eq!(guard.data.ids.len(), 1000);
        let (bytes, count) = cache.usage();
        assert_eq!((bytes, count), (0, 0));
    }

    #[test]
    fn test_exhausted_when_all_pinned() {
        let cache = Arc::new(BlockCache::new(entry_bytes(4) + entry_bytes(4) / 2));
        let _pinned = cache.get_or_load(1, || Ok(entry(1, 4))).unwrap();
        let result = cache.get_or_load(2, || Ok(entry(2, 4)));
        assert!(matches!(result, Err(Error::Capacity(_))));
    }

    #[test]
    fn test_preload_rejects_oversized() {
        let cache = Arc::new(BlockCache::new(64));
        assert!(matches!(
            cache.preload(1, || Ok(entry(1, 1000))),
            Err(Error::Capacity(_))
        ));
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let cache = Arc::new(BlockCache::new(1 << 20));
        drop(cache.get_or_load(1, || Ok(entry(1, 4))).unwrap());
        cache.invalidate(1);
        let mut loaded = false;
        drop(
            cache
                .get_or_load(1, || {
                    loaded = true;
                    Ok(entry(1, 4))
                })
                .unwrap(),
        );
        assert!(loaded);
    }
}
