//! Metadata catalog interface.
//!
//! The engine consumes this trait rather than owning table/partition/segment
//! bookkeeping itself; [`crate::sqlite_catalog::SqliteCatalog`] is the
//! shipped implementation. Implementations must provide monotonic read
//! within a process: once a write returns, later reads through the same
//! catalog observe it. `files_to_search` must be computed atomically so two
//! concurrent queries never see half-applied segment sets.

use crate::Result;
use sango_index::{IndexKind, IndexParams, Metric};
use serde::{Deserialize, Serialize};

/// Name of the partition created implicitly with every table (tag "").
pub const DEFAULT_PARTITION_TAG: &str = "";

/// Immutable table attributes plus the (mutable) active index spec.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub dim: usize,
    pub metric: Metric,
    /// Soft cap on merged-segment raw size in bytes.
    pub index_file_size: u64,
    pub index: Option<IndexSpec>,
    pub created_at: u64,
}

/// Active index spec of a table; at most one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub kind: IndexKind,
    pub params: IndexParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionInfo {
    pub table: String,
    /// Internal, unique-per-catalog name.
    pub name: String,
    pub tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Raw,
    Indexed,
    ToDelete,
    Deleted,
}

impl SegmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentState::Raw => "raw",
            SegmentState::Indexed => "indexed",
            SegmentState::ToDelete => "to_delete",
            SegmentState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(SegmentState::Raw),
            "indexed" => Some(SegmentState::Indexed),
            "to_delete" => Some(SegmentState::ToDelete),
            "deleted" => Some(SegmentState::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    pub id: u64,
    pub table: String,
    pub partition: String,
    pub state: SegmentState,
    /// Total rows in the raw files, blacklisted ones included.
    pub row_count: usize,
    /// Rows masked by the blacklist.
    pub deleted_count: usize,
    pub size_bytes: u64,
    pub index_kind: Option<IndexKind>,
    /// Highest WAL LSN reflected in this segment.
    pub max_lsn: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SegmentInfo {
    pub fn live_rows(&self) -> usize {
        self.row_count - self.deleted_count
    }

    /// A segment answers queries iff RAW or INDEXED.
    pub fn queryable(&self) -> bool {
        matches!(self.state, SegmentState::Raw | SegmentState::Indexed)
    }
}

pub trait Catalog: Send + Sync {
    // Tables.
    fn create_table(&self, schema: &TableSchema) -> Result<()>;
    /// Cascades over partitions and segment records.
    fn drop_table(&self, name: &str) -> Result<()>;
    fn describe_table(&self, name: &str) -> Result<TableSchema>;
    fn has_table(&self, name: &str) -> Result<bool>;
    fn all_tables(&self) -> Result<Vec<TableSchema>>;
    fn set_index(&self, table: &str, spec: Option<&IndexSpec>) -> Result<()>;

    // Partitions.
    fn create_partition(&self, table: &str, name: &str, tag: &str) -> Result<()>;
    fn drop_partition(&self, name: &str) -> Result<()>;
    fn drop_partition_by_tag(&self, table: &str, tag: &str) -> Result<()>;
    fn show_partitions(&self, table: &str) -> Result<Vec<PartitionInfo>>;
    fn partition_by_tag(&self, table: &str, tag: &str) -> Result<Option<PartitionInfo>>;

    // Segments.
    fn register_segment(&self, segment: &SegmentInfo) -> Result<()>;
    fn segment(&self, id: u64) -> Result<Option<SegmentInfo>>;
    fn table_segments(&self, table: &str) -> Result<Vec<SegmentInfo>>;
    fn update_segment_state(&self, id: u64, state: SegmentState) -> Result<()>;
    fn attach_index(&self, id: u64, kind: IndexKind, size_bytes: u64) -> Result<()>;
    fn set_deleted_count(&self, id: u64, deleted_count: usize) -> Result<()>;
    /// INDEXED segments of `table` go back to RAW (artifact dropped by the
    /// caller). Returns the affected segments.
    fn reset_index(&self, table: &str) -> Result<Vec<SegmentInfo>>;

    // Scheduler feeds.
    /// RAW segments below the table's `index_file_size`, merge candidates.
    fn files_to_merge(&self, table: &str) -> Result<Vec<SegmentInfo>>;
    /// RAW segments of a table that has an index spec configured.
    fn files_to_index(&self, table: &str) -> Result<Vec<SegmentInfo>>;
    /// Queryable segments grouped by partition. An empty `partitions` slice
    /// means every partition. Computed atomically.
    fn files_to_search(
        &self,
        table: &str,
        partitions: &[String],
    ) -> Result<Vec<(PartitionInfo, Vec<SegmentInfo>)>>;
    /// TO_DELETE segments whose `updated_at` is at or before `cutoff_ms`.
    fn segments_to_gc(&self, cutoff_ms: u64) -> Result<Vec<SegmentInfo>>;

    // Aggregates.
    fn table_row_count(&self, table: &str) -> Result<usize>;
    fn max_segment_id(&self) -> Result<u64>;
    /// Highest WAL LSN reflected by any registered segment.
    fn max_flushed_lsn(&self) -> Result<u64>;
    /// Total on-disk bytes of live (RAW/INDEXED) segments.
    fn total_size_bytes(&self) -> Result<u64>;
}

/// Unix milliseconds.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
