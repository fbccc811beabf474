//! Segment read/write paths.

use crate::meta::SegmentFileMeta;
use crate::{Result, SegmentError};
use bytes::{Buf, BufMut, BytesMut};
use sango_index::Blacklist;
use std::path::{Path, PathBuf};
use tracing::debug;

const RAW_VEC: &str = "raw.vec";
const RAW_IDS: &str = "raw.ids";
const BLACKLIST: &str = "blacklist.bits";
const INDEX_BIN: &str = "index.bin";
const META_JSON: &str = "meta.json";

/// A fully-materialized raw segment payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentData {
    pub dim: usize,
    pub ids: Vec<i64>,
    pub vectors: Vec<f32>,
}

impl SegmentData {
    pub fn rows(&self) -> usize {
        self.ids.len()
    }

    pub fn row(&self, pos: usize) -> &[f32] {
        &self.vectors[pos * self.dim..(pos + 1) * self.dim]
    }

    /// Bytes the raw files will occupy on disk.
    pub fn raw_bytes(&self) -> u64 {
        (self.vectors.len() * 4 + self.ids.len() * 8) as u64
    }
}

/// Filesystem layout rooted at the engine's data directory.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join("tables").join(table)
    }

    pub fn segment_dir(&self, table: &str, partition: &str, segment_id: u64) -> PathBuf {
        self.table_dir(table).join(partition).join(segment_id.to_string())
    }

    /// Writes a whole new segment atomically (temp directory + rename).
    /// Returns the on-disk byte size of the segment directory.
    pub fn write_segment(
        &self,
        table: &str,
        partition: &str,
        segment_id: u64,
        data: &SegmentData,
        meta: &SegmentFileMeta,
    ) -> Result<u64> {
        if data.vectors.len() != data.ids.len() * data.dim {
            return Err(SegmentError::Corrupt(format!(
                "{} ids do not cover {} floats at dim {}",
                data.ids.len(),
                data.vectors.len(),
                data.dim
            )));
        }
        let final_dir = self.segment_dir(table, partition, segment_id);
        let parent = final_dir
            .parent()
            .ok_or_else(|| SegmentError::Corrupt("segment dir has no parent".into()))?;
        std::fs::create_dir_all(parent)?;

        let tmp_dir = parent.join(format!(".tmp-{segment_id}"));
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir)?;
        }
        std::fs::create_dir(&tmp_dir)?;

        let mut vec_buf = BytesMut::with_capacity(data.vectors.len() * 4);
        for v in &data.vectors {
            vec_buf.put_f32_le(*v);
        }
        std::fs::write(tmp_dir.join(RAW_VEC), &vec_buf)?;

        let mut id_buf = BytesMut::with_capacity(data.ids.len() * 8);
        for id in &data.ids {
            id_buf.put_i64_le(*id);
        }
        std::fs::write(tmp_dir.join(RAW_IDS), &id_buf)?;

        std::fs::write(tmp_dir.join(META_JSON), serde_json::to_vec_pretty(meta)?)?;

        std::fs::rename(&tmp_dir, &final_dir)?;
        debug!(
            table,
            partition,
            segment_id,
            rows = data.rows(),
            "segment written"
        );
        Ok(dir_size(&final_dir)?)
    }

    pub fn read_meta(&self, dir: &Path) -> Result<SegmentFileMeta> {
        let bytes = std::fs::read(dir.join(META_JSON))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Streams `raw.vec`/`raw.ids` back into memory, validating the shape
    /// against `meta.json`.
    pub fn read_raw(&self, dir: &Path) -> Result<SegmentData> {
        let meta = self.read_meta(dir)?;
        let vec_bytes = std::fs::read(dir.join(RAW_VEC))?;
        let id_bytes = std::fs::read(dir.join(RAW_IDS))?;

        if vec_bytes.len() != meta.row_count * meta.dim * 4 {
            return Err(SegmentError::Corrupt(format!(
                "raw.vec holds {} bytes, expected {}",
                vec_bytes.len(),
                meta.row_count * meta.dim * 4
            )));
        }
        if id_bytes.len() != meta.row_count * 8 {
            return Err(SegmentError::Corrupt(format!(
                "raw.ids holds {} bytes, expected {}",
                id_bytes.len(),
                meta.row_count * 8
            )));
        }

        let mut cursor = &vec_bytes[..];
        let vectors = (0..meta.row_count * meta.dim)
            .map(|_| cursor.get_f32_le())
            .collect();
        let mut cursor = &id_bytes[..];
        let ids = (0..meta.row_count).map(|_| cursor.get_i64_le()).collect();

        Ok(SegmentData {
            dim: meta.dim,
            ids,
            vectors,
        })
    }

    /// Loads the deletion mask; a missing file means nothing is deleted.
    pub fn read_blacklist(&self, dir: &Path, row_count: usize) -> Result<Blacklist> {
        match std::fs::read(dir.join(BLACKLIST)) {
            Ok(bytes) => Blacklist::from_bytes(bytes, row_count)
                .map_err(|e| SegmentError::Corrupt(e.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Blacklist::with_len(row_count))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Persists the deletion mask atomically within the segment directory.
    pub fn write_blacklist(&self, dir: &Path, blacklist: &Blacklist) -> Result<()> {
        let tmp = dir.join(".blacklist.tmp");
        std::fs::write(&tmp, blacklist.as_bytes())?;
        std::fs::rename(&tmp, dir.join(BLACKLIST))?;
        Ok(())
    }

    pub fn read_index_blob(&self, dir: &Path) -> Result<Option<Vec<u8>>> {
        match std::fs::read(dir.join(INDEX_BIN)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Attaches a built index artifact to an existing segment and stamps its
    /// family into `meta.json`. Both writes go through a temp file + rename.
    pub fn attach_index(
        &self,
        dir: &Path,
        blob: &[u8],
        kind: sango_index::IndexKind,
    ) -> Result<u64> {
        let tmp = dir.join(".index.tmp");
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, dir.join(INDEX_BIN))?;

        let mut meta = self.read_meta(dir)?;
        meta.kind = Some(kind);
        let tmp = dir.join(".meta.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&meta)?)?;
        std::fs::rename(&tmp, dir.join(META_JSON))?;
        Ok(dir_size(dir)?)
    }

    /// Drops the artifact (if any) and clears the family stamp, returning
    /// the segment to its RAW shape.
    pub fn detach_index(&self, dir: &Path) -> Result<u64> {
        match std::fs::remove_file(dir.join(INDEX_BIN)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let mut meta = self.read_meta(dir)?;
        meta.kind = None;
        let tmp = dir.join(".meta.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&meta)?)?;
        std::fs::rename(&tmp, dir.join(META_JSON))?;
        Ok(dir_size(dir)?)
    }

    pub fn remove_segment(&self, dir: &Path) -> Result<()> {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn segment_size(&self, dir: &Path) -> Result<u64> {
        dir_size(dir)
    }
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        total += entry?.metadata()?.len();
    }
    Ok(total)
}
