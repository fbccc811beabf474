//! `meta.json` shape.

use sango_index::{IndexKind, Metric};
use serde::{Deserialize, Serialize};

/// Per-segment metadata persisted alongside the raw files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFileMeta {
    /// Index family of `index.bin`; `None` while the segment is RAW.
    pub kind: Option<IndexKind>,
    pub metric: Metric,
    pub dim: usize,
    pub row_count: usize,
    /// The owning table's merged-segment size cap, carried for merge
    /// decisions without a catalog lookup.
    pub index_file_size: u64,
    /// Unix milliseconds.
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_json_roundtrip() {
        let meta = SegmentFileMeta {
            kind: Some(IndexKind::IvfSq8),
            metric: Metric::Ip,
            dim: 128,
            row_count: 4096,
            index_file_size: 1 << 30,
            created_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(serde_json::from_str::<SegmentFileMeta>(&json).unwrap(), meta);
    }

    #[test]
    fn test_raw_segment_has_no_kind() {
        let json = r#"{"kind":null,"metric":"L2","dim":4,"row_count":0,"index_file_size":1024,"created_at":0}"#;
        let meta: SegmentFileMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.kind, None);
    }
}
