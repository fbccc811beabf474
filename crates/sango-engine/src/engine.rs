//! The engine facade: DDL, ingest, query dispatch and lifecycle.
//!
//! One [`Engine`] value owns its catalog, segment store, block cache, insert
//! buffers, WAL and background scheduler by construction; there is no
//! process-global state. External operations check the running flag first
//! and fail with `EngineStopped` after [`Engine::stop`]; [`Engine::start`]
//! re-enters WAL recovery and brings the scheduler back.

use crate::buffer::{BufferSet, PartitionBuffer};
use crate::cache::{BlockCache, CacheGuard, CachedSegment};
use crate::catalog::{
    now_ms, Catalog, IndexSpec, PartitionInfo, SegmentInfo, SegmentState, TableSchema,
};
use crate::config::EngineConfig;
use crate::executor;
use crate::scheduler::{self, SchedulerHandle};
use crate::sqlite_catalog::SqliteCatalog;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use sango_index::{build_index, load_index, IndexKind, IndexParams, Metric, SearchResult};
use sango_segment::{SegmentData, SegmentFileMeta, SegmentStore};
use sango_wal::{Wal, WalConfig, WalPayload, WalRecord};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Query answers re-use the index layer's result shape: `nq * k` entries,
/// sentinel-padded.
pub type QueryResult = SearchResult;

/// Everything a table exposes through `GetTableInfo`.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: TableSchema,
    pub partitions: Vec<PartitionInfo>,
    pub row_count: usize,
    pub segments: Vec<SegmentInfo>,
}

/// Shared engine state reachable from background tasks and query workers.
pub(crate) struct EngineCore {
    pub config: EngineConfig,
    pub catalog: Arc<dyn Catalog>,
    pub store: SegmentStore,
    pub cache: Arc<BlockCache>,
    pub buffers: BufferSet,
    /// Segments found corrupt at load time; excluded from searches.
    unavailable: Mutex<HashSet<u64>>,
    next_segment_id: AtomicU64,
    next_auto_id: AtomicI64,
    leases: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EngineCore {
    /// Per-table work lease serializing destructive work against DDL.
    pub fn table_lease(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.leases
            .lock()
            .entry(table.to_string())
            .or_default()
            .clone()
    }

    pub fn mark_unavailable(&self, segment_id: u64) {
        self.unavailable.lock().insert(segment_id);
    }

    fn is_unavailable(&self, segment_id: u64) -> bool {
        self.unavailable.lock().contains(&segment_id)
    }

    fn alloc_segment_id(&self) -> u64 {
        self.next_segment_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Materializes a segment from disk: raw files, blacklist, and the
    /// index artifact when one is attached.
    fn read_segment(&self, segment: &SegmentInfo) -> Result<CachedSegment> {
        let dir = self
            .store
            .segment_dir(&segment.table, &segment.partition, segment.id);
        let data = self.store.read_raw(&dir)?;
        let blacklist = self.store.read_blacklist(&dir, data.rows())?;
        let index = match self.store.read_index_blob(&dir)? {
            Some(blob) => {
                let mut index = load_index(&blob)?;
                index.set_blacklist(blacklist.clone());
                Some(index)
            }
            None => None,
        };
        Ok(CachedSegment {
            info: segment.clone(),
            data,
            index,
            blacklist,
        })
    }

    /// Loads a segment through the block cache, pinned for the caller.
    pub fn load_segment(&self, segment: &SegmentInfo) -> Result<CacheGuard> {
        self.cache
            .get_or_load(segment.id, || self.read_segment(segment))
    }

    /// Warms the cache with a segment without pinning it.
    pub fn preload_segment(&self, segment: &SegmentInfo) -> Result<()> {
        self.cache
            .preload(segment.id, || self.read_segment(segment))
    }

    /// Turns one staged buffer into a RAW segment and stamps the WAL with a
    /// flush mark.
    pub async fn flush_buffer(&self, wal: &Wal, buffer: PartitionBuffer) -> Result<u64> {
        if buffer.rows() == 0 {
            return Err(Error::Internal("flush of an empty buffer".into()));
        }
        let schema = self.catalog.describe_table(&buffer.table)?;
        let segment_id = self.alloc_segment_id();
        let data = SegmentData {
            dim: buffer.dim,
            ids: buffer.ids,
            vectors: buffer.vectors,
        };
        let meta = SegmentFileMeta {
            kind: None,
            metric: schema.metric,
            dim: buffer.dim,
            row_count: data.rows(),
            index_file_size: schema.index_file_size,
            created_at: now_ms(),
        };
        let size_bytes =
            self.store
                .write_segment(&buffer.table, &buffer.partition, segment_id, &data, &meta)?;
        self.catalog.register_segment(&SegmentInfo {
            id: segment_id,
            table: buffer.table.clone(),
            partition: buffer.partition.clone(),
            state: SegmentState::Raw,
            row_count: data.rows(),
            deleted_count: 0,
            size_bytes,
            index_kind: None,
            max_lsn: buffer.max_lsn,
            created_at: now_ms(),
            updated_at: now_ms(),
        })?;
        wal.append(
            &buffer.table,
            "",
            WalPayload::FlushMark { segment_id },
        )
        .await?;
        info!(
            table = %buffer.table,
            partition = %buffer.partition,
            segment_id,
            rows = data.rows(),
            "buffer flushed to segment"
        );
        Ok(segment_id)
    }

    /// Concatenates groups of small RAW segments per partition, dropping
    /// blacklisted rows. Returns the number of input segments consumed.
    pub async fn merge_table(&self, table: &str) -> Result<usize> {
        let schema = self.catalog.describe_table(table)?;
        let candidates = self.catalog.files_to_merge(table)?;
        self.merge_groups(&schema, candidates, false)
    }

    /// Compaction entry point: rewrites queryable segments (RAW or INDEXED)
    /// so blacklisted rows are reclaimed; a lone segment qualifies when it
    /// carries deletions.
    pub fn compact_table(&self, schema: &TableSchema) -> Result<usize> {
        let segments: Vec<SegmentInfo> = self
            .catalog
            .table_segments(&schema.name)?
            .into_iter()
            .filter(|s| s.queryable())
            .collect();
        self.merge_groups(schema, segments, true)
    }

    fn merge_groups(
        &self,
        schema: &TableSchema,
        candidates: Vec<SegmentInfo>,
        allow_singletons: bool,
    ) -> Result<usize> {
        let mut by_partition: HashMap<String, Vec<SegmentInfo>> = HashMap::new();
        for segment in candidates {
            if self.is_unavailable(segment.id) {
                continue;
            }
            by_partition
                .entry(segment.partition.clone())
                .or_default()
                .push(segment);
        }

        let mut consumed = 0usize;
        for (partition, mut segments) in by_partition {
            segments.sort_by_key(|s| s.size_bytes);
            let mut group: Vec<SegmentInfo> = Vec::new();
            let mut group_bytes = 0u64;
            let mut pending: Vec<Vec<SegmentInfo>> = Vec::new();
            for segment in segments {
                if group_bytes + segment.size_bytes > schema.index_file_size && !group.is_empty() {
                    pending.push(std::mem::take(&mut group));
                    group_bytes = 0;
                }
                group_bytes += segment.size_bytes;
                group.push(segment);
            }
            if !group.is_empty() {
                pending.push(group);
            }

            for group in pending {
                let worth_it = group.len() >= 2
                    || (allow_singletons && group.iter().any(|s| s.deleted_count > 0));
                if !worth_it {
                    continue;
                }
                consumed += group.len();
                self.merge_one_group(schema, &partition, &group)?;
            }
        }
        Ok(consumed)
    }

    fn merge_one_group(
        &self,
        schema: &TableSchema,
        partition: &str,
        inputs: &[SegmentInfo],
    ) -> Result<()> {
        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        let mut max_lsn = 0u64;
        for input in inputs {
            let dir = self
                .store
                .segment_dir(&input.table, &input.partition, input.id);
            let data = self.store.read_raw(&dir)?;
            let blacklist = self.store.read_blacklist(&dir, data.rows())?;
            for pos in 0..data.rows() {
                if blacklist.contains(pos) {
                    continue;
                }
                ids.push(data.ids[pos]);
                vectors.extend_from_slice(data.row(pos));
            }
            max_lsn = max_lsn.max(input.max_lsn);
        }

        if !ids.is_empty() {
            let segment_id = self.alloc_segment_id();
            let data = SegmentData {
                dim: schema.dim,
                ids,
                vectors,
            };
            let meta = SegmentFileMeta {
                kind: None,
                metric: schema.metric,
                dim: schema.dim,
                row_count: data.rows(),
                index_file_size: schema.index_file_size,
                created_at: now_ms(),
            };
            let size_bytes =
                self.store
                    .write_segment(&schema.name, partition, segment_id, &data, &meta)?;
            self.catalog.register_segment(&SegmentInfo {
                id: segment_id,
                table: schema.name.clone(),
                partition: partition.to_string(),
                state: SegmentState::Raw,
                row_count: data.rows(),
                deleted_count: 0,
                size_bytes,
                index_kind: None,
                max_lsn,
                created_at: now_ms(),
                updated_at: now_ms(),
            })?;
            debug!(
                table = %schema.name,
                partition,
                segment_id,
                inputs = inputs.len(),
                rows = data.rows(),
                "segments merged"
            );
        }

        for input in inputs {
            self.catalog
                .update_segment_state(input.id, SegmentState::ToDelete)?;
            self.cache.invalidate(input.id);
        }
        Ok(())
    }

    /// Builds the configured index over every RAW segment of `table`.
    /// Returns how many segments were promoted to INDEXED.
    pub async fn build_table_index(&self, table: &str) -> Result<usize> {
        let schema = self.catalog.describe_table(table)?;
        let Some(spec) = schema.index.clone() else {
            return Ok(0);
        };
        let mut built = 0usize;
        for segment in self.catalog.files_to_index(table)? {
            if self.is_unavailable(segment.id) {
                continue;
            }
            let dir = self
                .store
                .segment_dir(&segment.table, &segment.partition, segment.id);
            let data = self.store.read_raw(&dir)?;
            if data.rows() == 0 {
                continue;
            }
            // All rows go in, blacklisted ones included, so bitset positions
            // keep lining up with index row positions.
            let dataset = sango_index::Dataset::new(data.dim, &data.ids, &data.vectors)
                .map_err(Error::from)?;
            let index = build_index(spec.kind, schema.metric, &dataset, &spec.params)?;
            let blob = index.serialize()?;
            let size_bytes = self.store.attach_index(&dir, &blob, spec.kind)?;
            self.catalog
                .attach_index(segment.id, spec.kind, size_bytes)?;
            self.cache.invalidate(segment.id);
            built += 1;
            debug!(table, segment = segment.id, kind = spec.kind.as_str(), "segment indexed");
        }
        Ok(built)
    }

    /// Removes TO_DELETE segment directories that have sat quiescent.
    pub fn gc_segments(&self) -> Result<usize> {
        let cutoff = now_ms().saturating_sub(self.config.gc_quiescence.as_millis() as u64);
        let mut removed = 0usize;
        for segment in self.catalog.segments_to_gc(cutoff)? {
            let dir = self
                .store
                .segment_dir(&segment.table, &segment.partition, segment.id);
            self.store.remove_segment(&dir)?;
            self.catalog
                .update_segment_state(segment.id, SegmentState::Deleted)?;
            self.cache.invalidate(segment.id);
            removed += 1;
        }
        Ok(removed)
    }

    /// Applies a deletion to every queryable segment holding any of `ids`:
    /// blacklist bits are set, persisted, and the cache entry dropped.
    fn blacklist_rows(&self, table: &str, ids: &[i64]) -> Result<usize> {
        let mut affected = 0usize;
        for segment in self.catalog.table_segments(table)? {
            if !segment.queryable() || self.is_unavailable(segment.id) {
                continue;
            }
            let dir = self
                .store
                .segment_dir(&segment.table, &segment.partition, segment.id);
            let data = self.store.read_raw(&dir)?;
            let mut blacklist = self.store.read_blacklist(&dir, data.rows())?;
            let mut dirty = false;
            for pos in 0..data.rows() {
                if ids.contains(&data.ids[pos]) && !blacklist.contains(pos) {
                    blacklist.set(pos);
                    dirty = true;
                    affected += 1;
                }
            }
            if dirty {
                self.store.write_blacklist(&dir, &blacklist)?;
                self.catalog
                    .set_deleted_count(segment.id, blacklist.count())?;
                self.cache.invalidate(segment.id);
            }
        }
        Ok(affected)
    }
}

/// The vector database engine.
pub struct Engine {
    core: Arc<EngineCore>,
    running: AtomicBool,
    wal: RwLock<Option<Arc<Wal>>>,
    scheduler: tokio::sync::Mutex<Option<SchedulerHandle>>,
}

impl Engine {
    /// Opens (or creates) an engine at `config.root` and starts it,
    /// running WAL recovery first.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;
        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::open(&config.meta_path())?);
        Self::open_with_catalog(config, catalog).await
    }

    /// Opens the engine against a caller-supplied catalog implementation.
    pub async fn open_with_catalog(
        config: EngineConfig,
        catalog: Arc<dyn Catalog>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;
        let store = SegmentStore::new(&config.root);
        let cache = Arc::new(BlockCache::new(config.cache_capacity));
        let next_segment_id = AtomicU64::new(catalog.max_segment_id()?);
        // Auto-assigned row ids derive from wall time so restarts rarely
        // collide; collisions are legal anyway.
        let next_auto_id = AtomicI64::new((now_ms() as i64) << 20);

        let engine = Self {
            core: Arc::new(EngineCore {
                config,
                catalog,
                store,
                cache,
                buffers: BufferSet::default(),
                unavailable: Mutex::new(HashSet::new()),
                next_segment_id,
                next_auto_id,
                leases: Mutex::new(HashMap::new()),
            }),
            running: AtomicBool::new(false),
            wal: RwLock::new(None),
            scheduler: tokio::sync::Mutex::new(None),
        };
        engine.start().await?;
        Ok(engine)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::EngineStopped)
        }
    }

    fn wal(&self) -> Result<Arc<Wal>> {
        self.wal
            .read()
            .clone()
            .ok_or(Error::EngineStopped)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Brings a stopped engine back up: WAL recovery, replay into the
    /// buffers, a synchronous flush of the replayed rows, then the
    /// background scheduler. Corruption here fails startup.
    pub async fn start(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let core = &self.core;
        let wal_config = WalConfig {
            dir: core.config.wal_dir(),
            max_file_size: core.config.wal_file_size,
            ..Default::default()
        };
        let (wal, recovered) = Wal::open(wal_config).await?;
        let wal = Arc::new(wal);

        let lsn_durable = core.catalog.max_flushed_lsn()?;
        let mut replayed = 0usize;
        for record in recovered.records {
            if record.lsn <= lsn_durable {
                continue;
            }
            self.replay(&record)?;
            replayed += 1;
        }

        // Everything replayed becomes durable segments before the engine
        // accepts traffic again.
        for buffer in core.buffers.take_table(None) {
            core.flush_buffer(&wal, buffer).await?;
        }
        wal.gc(core.catalog.max_flushed_lsn()?)?;

        info!(replayed, lsn_durable, "engine recovery complete");
        let handle = scheduler::spawn(core.clone(), wal.clone());
        *self.scheduler.lock().await = Some(handle);
        *self.wal.write() = Some(wal);
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn replay(&self, record: &WalRecord) -> Result<()> {
        match &record.payload {
            WalPayload::Insert { dim, ids, vectors } => {
                let partition = match self
                    .core
                    .catalog
                    .partition_by_tag(&record.table, &record.partition_tag)?
                {
                    Some(partition) => partition,
                    None => {
                        // Table or partition dropped after the record was
                        // written; the rows have nowhere to go.
                        warn!(
                            table = %record.table,
                            tag = %record.partition_tag,
                            lsn = record.lsn,
                            "skipping replay into missing partition"
                        );
                        return Ok(());
                    }
                };
                self.core.buffers.push(
                    &record.table,
                    &partition.name,
                    *dim as usize,
                    ids,
                    vectors,
                    record.lsn,
                );
            }
            WalPayload::Delete { ids } => {
                if self.core.catalog.has_table(&record.table)? {
                    self.core.buffers.remove_ids(&record.table, ids);
                    self.core.blacklist_rows(&record.table, ids)?;
                }
            }
            WalPayload::FlushMark { .. } => {
                // The catalog already reflects flushed segments.
            }
        }
        Ok(())
    }

    /// Stops the engine: the scheduler drains, buffered inserts are flushed
    /// best-effort, and the WAL closes. Later calls fail `EngineStopped`
    /// until `start`.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.shutdown().await;
        }
        let wal = self.wal.write().take();
        if let Some(wal) = wal {
            for buffer in self.core.buffers.take_table(None) {
                if let Err(err) = self.core.flush_buffer(&wal, buffer).await {
                    warn!(%err, "best-effort flush on stop failed");
                }
            }
            wal.close().await?;
        }
        info!("engine stopped");
        Ok(())
    }

    // ---- DDL ----

    pub async fn create_table(
        &self,
        name: &str,
        dim: usize,
        metric: Metric,
        index_file_size: u64,
    ) -> Result<()> {
        self.ensure_running()?;
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("table name is empty".into()));
        }
        if dim == 0 {
            return Err(Error::InvalidArgument("dimension must be >= 1".into()));
        }
        if index_file_size == 0 {
            return Err(Error::InvalidArgument(
                "index_file_size must be >= 1".into(),
            ));
        }
        self.core.catalog.create_table(&TableSchema {
            name: name.to_string(),
            dim,
            metric,
            index_file_size,
            index: None,
            created_at: now_ms(),
        })
    }

    pub async fn drop_table(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        let lease = self.core.table_lease(name);
        let _guard = lease.lock().await;
        let segments = self.core.catalog.table_segments(name)?;
        self.core.catalog.drop_table(name)?;
        for segment in &segments {
            let dir = self
                .core
                .store
                .segment_dir(&segment.table, &segment.partition, segment.id);
            self.core.store.remove_segment(&dir)?;
            self.core.cache.invalidate(segment.id);
        }
        let _ = std::fs::remove_dir_all(self.core.store.table_dir(name));
        // Staged rows for a dropped table have nowhere to go.
        drop(self.core.buffers.take_table(Some(name)));
        Ok(())
    }

    pub fn describe_table(&self, name: &str) -> Result<TableSchema> {
        self.ensure_running()?;
        self.core.catalog.describe_table(name)
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        self.ensure_running()?;
        self.core.catalog.has_table(name)
    }

    pub fn all_tables(&self) -> Result<Vec<TableSchema>> {
        self.ensure_running()?;
        self.core.catalog.all_tables()
    }

    pub async fn create_partition(&self, table: &str, name: &str, tag: &str) -> Result<()> {
        self.ensure_running()?;
        let tag = tag.trim();
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("partition name is empty".into()));
        }
        if tag.is_empty() {
            return Err(Error::InvalidArgument(
                "partition tag is empty (the default partition already exists)".into(),
            ));
        }
        self.core.catalog.create_partition(table, name, tag)
    }

    pub async fn drop_partition(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        self.drop_partition_segments(name).await
    }

    pub async fn drop_partition_by_tag(&self, table: &str, tag: &str) -> Result<()> {
        self.ensure_running()?;
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(Error::InvalidArgument(
                "the default partition cannot be dropped".into(),
            ));
        }
        let partition = self
            .core
            .catalog
            .partition_by_tag(table, tag)?
            .ok_or_else(|| Error::NotFound(format!("partition tag {tag:?} in table {table:?}")))?;
        self.drop_partition_segments(&partition.name).await
    }

    async fn drop_partition_segments(&self, name: &str) -> Result<()> {
        let mut segments: Vec<SegmentInfo> = Vec::new();
        for table in self.core.catalog.all_tables()? {
            for partition in self.core.catalog.show_partitions(&table.name)? {
                if partition.name == name && partition.tag.is_empty() {
                    return Err(Error::InvalidArgument(
                        "the default partition cannot be dropped".into(),
                    ));
                }
            }
            for segment in self.core.catalog.table_segments(&table.name)? {
                if segment.partition == name {
                    segments.push(segment);
                }
            }
        }
        self.core.catalog.drop_partition(name)?;
        for segment in &segments {
            let dir = self
                .core
                .store
                .segment_dir(&segment.table, &segment.partition, segment.id);
            self.core.store.remove_segment(&dir)?;
            self.core.cache.invalidate(segment.id);
        }
        Ok(())
    }

    pub fn show_partitions(&self, table: &str) -> Result<Vec<PartitionInfo>> {
        self.ensure_running()?;
        self.core.catalog.show_partitions(table)
    }

    // ---- Ingest ----

    /// Inserts a batch. `ids` may be caller-assigned (duplicates are legal)
    /// or `None` for auto-assignment; the ids actually used come back.
    /// Resolves only after the batch's WAL record is fsynced.
    pub async fn insert_vectors(
        &self,
        table: &str,
        tag: &str,
        ids: Option<Vec<i64>>,
        vectors: Vec<f32>,
    ) -> Result<Vec<i64>> {
        self.ensure_running()?;
        let schema = self.core.catalog.describe_table(table)?;
        if vectors.is_empty() {
            return Err(Error::InvalidArgument("empty insert batch".into()));
        }
        if vectors.len() % schema.dim != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} floats do not divide into dim-{} rows",
                vectors.len(),
                schema.dim
            )));
        }
        let rows = vectors.len() / schema.dim;
        let ids = match ids {
            Some(ids) => {
                if ids.len() != rows {
                    return Err(Error::InvalidArgument(format!(
                        "{} ids for {} rows",
                        ids.len(),
                        rows
                    )));
                }
                ids
            }
            None => (0..rows)
                .map(|_| self.core.next_auto_id.fetch_add(1, Ordering::Relaxed))
                .collect(),
        };

        let tag = tag.trim();
        let partition = self
            .core
            .catalog
            .partition_by_tag(table, tag)?
            .ok_or_else(|| Error::NotFound(format!("partition tag {tag:?} in table {table:?}")))?;

        let wal = self.wal()?;
        let lsn = wal
            .append(
                table,
                tag,
                WalPayload::Insert {
                    dim: schema.dim as u32,
                    ids: ids.clone(),
                    vectors: vectors.clone(),
                },
            )
            .await?;

        let (buffer_bytes, total_bytes) =
            self.core
                .buffers
                .push(table, &partition.name, schema.dim, &ids, &vectors, lsn);

        // Flush triggers (a) and (d): per-buffer cap and global pressure.
        if buffer_bytes >= schema.index_file_size {
            if let Some(buffer) = self.core.buffers.take_partition(table, &partition.name) {
                self.core.flush_buffer(&wal, buffer).await?;
            }
        } else if total_bytes >= self.core.config.buffer_watermark {
            if let Some(buffer) = self.core.buffers.take_largest() {
                self.core.flush_buffer(&wal, buffer).await?;
            }
        }

        Ok(ids)
    }

    /// Masks rows by id across buffers and segments. The deletion is
    /// WAL-durable before it is applied.
    pub async fn delete_vectors(&self, table: &str, ids: &[i64]) -> Result<()> {
        self.ensure_running()?;
        if ids.is_empty() {
            return Err(Error::InvalidArgument("empty delete batch".into()));
        }
        if !self.core.catalog.has_table(table)? {
            return Err(Error::NotFound(format!("table {table:?}")));
        }
        let wal = self.wal()?;
        wal.append(
            table,
            "",
            WalPayload::Delete { ids: ids.to_vec() },
        )
        .await?;

        let buffered = self.core.buffers.remove_ids(table, ids);
        let masked = self.core.blacklist_rows(table, ids)?;
        debug!(table, buffered, masked, "vectors deleted");
        Ok(())
    }

    /// Flushes staged rows into segments: the named tables, or every table.
    pub async fn flush(&self, tables: Option<&[String]>) -> Result<()> {
        self.ensure_running()?;
        let wal = self.wal()?;
        let buffers = match tables {
            Some(tables) => {
                let mut out = Vec::new();
                for table in tables {
                    if !self.core.catalog.has_table(table)? {
                        return Err(Error::NotFound(format!("table {table:?}")));
                    }
                    out.extend(self.core.buffers.take_table(Some(table.as_str())));
                }
                out
            }
            None => self.core.buffers.take_table(None),
        };
        for buffer in buffers {
            self.core.flush_buffer(&wal, buffer).await?;
        }
        // Once nothing is staged anywhere, whole WAL files become garbage.
        if self.core.buffers.total_bytes() == 0 {
            wal.gc(self.core.catalog.max_flushed_lsn()?)?;
        }
        Ok(())
    }

    /// Rewrites segments so blacklisted rows stop taking disk, then lets
    /// the GC tick reclaim the inputs.
    pub async fn compact(&self, table: &str) -> Result<()> {
        self.ensure_running()?;
        let schema = self.core.catalog.describe_table(table)?;
        let lease = self.core.table_lease(table);
        let _guard = lease.lock().await;
        self.core.compact_table(&schema)?;
        Ok(())
    }

    // ---- Reads ----

    /// First live row carrying `id`, if any (which one is unspecified when
    /// ids repeat).
    pub async fn get_vector_by_id(&self, table: &str, id: i64) -> Result<Option<Vec<f32>>> {
        self.ensure_running()?;
        let schema = self.core.catalog.describe_table(table)?;
        for (_, segments) in self.core.catalog.files_to_search(&schema.name, &[])? {
            for segment in segments {
                if self.core.is_unavailable(segment.id) {
                    continue;
                }
                let guard = self.core.load_segment(&segment)?;
                for pos in 0..guard.data.rows() {
                    if guard.data.ids[pos] == id && !guard.blacklist.contains(pos) {
                        return Ok(Some(guard.data.row(pos).to_vec()));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Live row ids of one segment.
    pub async fn get_vector_ids(&self, segment_id: u64) -> Result<Vec<i64>> {
        self.ensure_running()?;
        let segment = self
            .core
            .catalog
            .segment(segment_id)?
            .filter(|s| s.queryable())
            .ok_or_else(|| Error::NotFound(format!("segment {segment_id}")))?;
        let guard = self.core.load_segment(&segment)?;
        Ok((0..guard.data.rows())
            .filter(|&pos| !guard.blacklist.contains(pos))
            .map(|pos| guard.data.ids[pos])
            .collect())
    }

    /// Top-k across the partitions matching `tag_patterns` (all partitions
    /// when empty).
    pub async fn query(
        &self,
        table: &str,
        tag_patterns: &[String],
        k: usize,
        params: &serde_json::Value,
        queries: Vec<f32>,
    ) -> Result<QueryResult> {
        self.ensure_running()?;
        let schema = self.core.catalog.describe_table(table)?;
        let nq = self.validate_queries(&schema, k, &queries)?;
        let search_params = executor::parse_search_params(params)?;

        let all_partitions = self.core.catalog.show_partitions(table)?;
        let resolved = executor::resolve_partitions(&all_partitions, tag_patterns);
        if resolved.is_empty() {
            return Err(Error::NoData);
        }
        let names: Vec<String> = if tag_patterns.is_empty() {
            Vec::new()
        } else {
            resolved.iter().map(|p| p.name.clone()).collect()
        };

        let segments: Vec<SegmentInfo> = self
            .core
            .catalog
            .files_to_search(table, &names)?
            .into_iter()
            .flat_map(|(_, segments)| segments)
            .filter(|s| !self.core.is_unavailable(s.id))
            .collect();
        if segments.is_empty() {
            return Err(Error::NoData);
        }

        executor::search_segments(
            &self.core,
            segments,
            Arc::new(queries),
            nq,
            k,
            search_params,
            schema.metric,
        )
        .await
    }

    /// Like `query`, restricted to the given segment ids. Unknown ids are
    /// silently ignored; an empty intersection is an error.
    pub async fn query_by_segment_id(
        &self,
        table: &str,
        segment_ids: &[u64],
        k: usize,
        params: &serde_json::Value,
        queries: Vec<f32>,
    ) -> Result<QueryResult> {
        self.ensure_running()?;
        let schema = self.core.catalog.describe_table(table)?;
        let nq = self.validate_queries(&schema, k, &queries)?;
        let search_params = executor::parse_search_params(params)?;

        let segments: Vec<SegmentInfo> = self
            .core
            .catalog
            .files_to_search(table, &[])?
            .into_iter()
            .flat_map(|(_, segments)| segments)
            .filter(|s| segment_ids.contains(&s.id) && !self.core.is_unavailable(s.id))
            .collect();
        if segments.is_empty() {
            return Err(Error::NoSegmentsToSearch);
        }

        executor::search_segments(
            &self.core,
            segments,
            Arc::new(queries),
            nq,
            k,
            search_params,
            schema.metric,
        )
        .await
    }

    fn validate_queries(
        &self,
        schema: &TableSchema,
        k: usize,
        queries: &[f32],
    ) -> Result<usize> {
        if k == 0 {
            return Err(Error::InvalidArgument("topk must be >= 1".into()));
        }
        if queries.is_empty() {
            return Err(Error::InvalidArgument("empty query batch".into()));
        }
        if queries.len() % schema.dim != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} floats do not divide into dim-{} queries",
                queries.len(),
                schema.dim
            )));
        }
        Ok(queries.len() / schema.dim)
    }

    /// Warms the cache with every queryable segment of `table`.
    /// Best-effort: on cache exhaustion the segments already loaded stay.
    pub async fn preload_table(&self, table: &str) -> Result<()> {
        self.ensure_running()?;
        if !self.core.catalog.has_table(table)? {
            return Err(Error::NotFound(format!("table {table:?}")));
        }
        for (_, segments) in self.core.catalog.files_to_search(table, &[])? {
            for segment in segments {
                if self.core.is_unavailable(segment.id) {
                    continue;
                }
                self.core.preload_segment(&segment)?;
            }
        }
        Ok(())
    }

    // ---- Index DDL ----

    /// Sets the table's index spec and builds it over existing segments
    /// before returning. A changed spec rebuilds everything.
    pub async fn create_index(
        &self,
        table: &str,
        kind: IndexKind,
        params: serde_json::Value,
    ) -> Result<()> {
        self.ensure_running()?;
        let params = IndexParams::from_json(params).map_err(Error::from)?;
        // Parameter sanity up front, not at first background build.
        params.nlist().map_err(Error::from)?;
        let schema = self.core.catalog.describe_table(table)?;
        if kind == IndexKind::IvfPq {
            params.pq_m(schema.dim).map_err(Error::from)?;
        }

        let lease = self.core.table_lease(table);
        let _guard = lease.lock().await;
        self.core
            .catalog
            .set_index(table, Some(&IndexSpec { kind, params }))?;
        // Changing the spec invalidates every built artifact.
        for segment in self.core.catalog.reset_index(table)? {
            let dir = self
                .core
                .store
                .segment_dir(&segment.table, &segment.partition, segment.id);
            self.core.store.detach_index(&dir)?;
            self.core.cache.invalidate(segment.id);
        }
        self.core.build_table_index(table).await?;
        Ok(())
    }

    pub fn describe_index(&self, table: &str) -> Result<Option<IndexSpec>> {
        self.ensure_running()?;
        Ok(self.core.catalog.describe_table(table)?.index)
    }

    /// Clears the index spec and drops every artifact; segments fall back
    /// to raw scans.
    pub async fn drop_index(&self, table: &str) -> Result<()> {
        self.ensure_running()?;
        let lease = self.core.table_lease(table);
        let _guard = lease.lock().await;
        self.core.catalog.set_index(table, None)?;
        for segment in self.core.catalog.reset_index(table)? {
            let dir = self
                .core
                .store
                .segment_dir(&segment.table, &segment.partition, segment.id);
            self.core.store.detach_index(&dir)?;
            self.core.cache.invalidate(segment.id);
        }
        Ok(())
    }

    // ---- Introspection ----

    pub fn get_table_row_count(&self, table: &str) -> Result<usize> {
        self.ensure_running()?;
        if !self.core.catalog.has_table(table)? {
            return Err(Error::NotFound(format!("table {table:?}")));
        }
        self.core.catalog.table_row_count(table)
    }

    pub fn get_table_info(&self, table: &str) -> Result<TableInfo> {
        self.ensure_running()?;
        let schema = self.core.catalog.describe_table(table)?;
        Ok(TableInfo {
            partitions: self.core.catalog.show_partitions(table)?,
            row_count: self.core.catalog.table_row_count(table)?,
            segments: self
                .core
                .catalog
                .table_segments(table)?
                .into_iter()
                .filter(|s| s.queryable())
                .collect(),
            schema,
        })
    }

    /// Total on-disk bytes of live segments.
    pub fn size(&self) -> Result<u64> {
        self.ensure_running()?;
        self.core.catalog.total_size_bytes()
    }
}
