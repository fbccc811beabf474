//! SQLite-backed catalog (`<root>/meta.db`).
//!
//! One connection behind a mutex: every catalog operation is a single
//! critical section, which gives the monotonic-read and atomic-snapshot
//! guarantees of the [`Catalog`] contract without any cross-process
//! coordination (which the contract does not require).

use crate::catalog::{
    now_ms, Catalog, IndexSpec, PartitionInfo, SegmentInfo, SegmentState, TableSchema,
    DEFAULT_PARTITION_TAG,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sango_index::{IndexKind, IndexParams, Metric};
use std::path::Path;

pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tables (
    name            TEXT PRIMARY KEY,
    dim             INTEGER NOT NULL,
    metric          TEXT NOT NULL,
    index_file_size INTEGER NOT NULL,
    index_kind      TEXT,
    index_params    TEXT,
    created_at      INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS partitions (
    name       TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    tag        TEXT NOT NULL,
    UNIQUE (table_name, tag)
);
CREATE TABLE IF NOT EXISTS segments (
    id             INTEGER PRIMARY KEY,
    table_name     TEXT NOT NULL,
    partition_name TEXT NOT NULL,
    state          TEXT NOT NULL,
    row_count      INTEGER NOT NULL,
    deleted_count  INTEGER NOT NULL DEFAULT 0,
    size_bytes     INTEGER NOT NULL,
    index_kind     TEXT,
    max_lsn        INTEGER NOT NULL,
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS segments_by_table ON segments (table_name, state);
";

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_schema(row: &Row<'_>) -> rusqlite::Result<(TableSchema, Option<String>, Option<String>)> {
        Ok((
            TableSchema {
                name: row.get(0)?,
                dim: row.get::<_, i64>(1)? as usize,
                metric: Metric::parse(&row.get::<_, String>(2)?)
                    .unwrap_or(Metric::L2),
                index_file_size: row.get::<_, i64>(3)? as u64,
                index: None,
                created_at: row.get::<_, i64>(6)? as u64,
            },
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn finish_schema(parts: (TableSchema, Option<String>, Option<String>)) -> Result<TableSchema> {
        let (mut schema, kind, params) = parts;
        if let Some(kind) = kind {
            let kind = IndexKind::parse(&kind).map_err(Error::from)?;
            let params = match params {
                Some(json) => IndexParams::from_json(
                    serde_json::from_str(&json)
                        .map_err(|e| Error::Internal(format!("catalog index params: {e}")))?,
                )
                .map_err(Error::from)?,
                None => IndexParams::default(),
            };
            schema.index = Some(IndexSpec { kind, params });
        }
        Ok(schema)
    }

    fn row_to_segment(row: &Row<'_>) -> rusqlite::Result<SegmentInfo> {
        let state: String = row.get(3)?;
        let kind: Option<String> = row.get(7)?;
        Ok(SegmentInfo {
            id: row.get::<_, i64>(0)? as u64,
            table: row.get(1)?,
            partition: row.get(2)?,
            state: SegmentState::parse(&state).unwrap_or(SegmentState::Deleted),
            row_count: row.get::<_, i64>(4)? as usize,
            deleted_count: row.get::<_, i64>(5)? as usize,
            size_bytes: row.get::<_, i64>(6)? as u64,
            index_kind: kind.and_then(|k| IndexKind::parse(&k).ok()),
            max_lsn: row.get::<_, i64>(8)? as u64,
            created_at: row.get::<_, i64>(9)? as u64,
            updated_at: row.get::<_, i64>(10)? as u64,
        })
    }

    fn segments_where(
        conn: &Connection,
        clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<SegmentInfo>> {
        let sql = format!(
            "SELECT id, table_name, partition_name, state, row_count, deleted_count, \
             size_bytes, index_kind, max_lsn, created_at, updated_at FROM segments {clause}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, Self::row_to_segment)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl Catalog for SqliteCatalog {
    fn create_table(&self, schema: &TableSchema) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let exists: Option<String> = tx
            .query_row(
                "SELECT name FROM tables WHERE name = ?1",
                params![schema.name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(Error::AlreadyExists(format!("table {:?}", schema.name)));
        }
        let (kind, params_json) = match &schema.index {
            Some(spec) => (
                Some(spec.kind.as_str().to_string()),
                Some(
                    serde_json::to_string(&spec.params)
                        .map_err(|e| Error::Internal(e.to_string()))?,
                ),
            ),
            None => (None, None),
        };
        tx.execute(
            "INSERT INTO tables (name, dim, metric, index_file_size, index_kind, index_params, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                schema.name,
                schema.dim as i64,
                schema.metric.as_str(),
                schema.index_file_size as i64,
                kind,
                params_json,
                schema.created_at as i64
            ],
        )?;
        // Every table owns a default partition under the empty tag.
        tx.execute(
            "INSERT INTO partitions (name, table_name, tag) VALUES (?1, ?2, ?3)",
            params![
                format!("{}._default", schema.name),
                schema.name,
                DEFAULT_PARTITION_TAG
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let dropped = tx.execute("DELETE FROM tables WHERE name = ?1", params![name])?;
        if dropped == 0 {
            return Err(Error::NotFound(format!("table {name:?}")));
        }
        tx.execute("DELETE FROM partitions WHERE table_name = ?1", params![name])?;
        tx.execute("DELETE FROM segments WHERE table_name = ?1", params![name])?;
        tx.commit()?;
        Ok(())
    }

    fn describe_table(&self, name: &str) -> Result<TableSchema> {
        let conn = self.conn.lock();
        let parts = conn
            .query_row(
                "SELECT name, dim, metric, index_file_size, index_kind, index_params, created_at \
                 FROM tables WHERE name = ?1",
                params![name],
                Self::row_to_schema,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("table {name:?}")))?;
        Self::finish_schema(parts)
    }

    fn has_table(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM tables WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn all_tables(&self) -> Result<Vec<TableSchema>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, dim, metric, index_file_size, index_kind, index_params, created_at \
             FROM tables ORDER BY name",
        )?;
        let rows = stmt.query_map([], Self::row_to_schema)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Self::finish_schema(row?)?);
        }
        Ok(out)
    }

    fn set_index(&self, table: &str, spec: Option<&IndexSpec>) -> Result<()> {
        let conn = self.conn.lock();
        let (kind, params_json) = match spec {
            Some(spec) => (
                Some(spec.kind.as_str().to_string()),
                Some(
                    serde_json::to_string(&spec.params)
                        .map_err(|e| Error::Internal(e.to_string()))?,
                ),
            ),
            None => (None, None),
        };
        let updated = conn.execute(
            "UPDATE tables SET index_kind = ?2, index_params = ?3 WHERE name = ?1",
            params![table, kind, params_json],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("table {table:?}")));
        }
        Ok(())
    }

    fn create_partition(&self, table: &str, name: &str, tag: &str) -> Result<()> {
        let conn = self.conn.lock();
        let table_exists: Option<String> = conn
            .query_row(
                "SELECT name FROM tables WHERE name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        if table_exists.is_none() {
            return Err(Error::NotFound(format!("table {table:?}")));
        }
        match conn.execute(
            "INSERT INTO partitions (name, table_name, tag) VALUES (?1, ?2, ?3)",
            params![name, table, tag],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists(format!(
                    "partition {name:?} (tag {tag:?}) in table {table:?}"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn drop_partition(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let dropped = tx.execute("DELETE FROM partitions WHERE name = ?1", params![name])?;
        if dropped == 0 {
            return Err(Error::NotFound(format!("partition {name:?}")));
        }
        tx.execute(
            "DELETE FROM segments WHERE partition_name = ?1",
            params![name],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn drop_partition_by_tag(&self, table: &str, tag: &str) -> Result<()> {
        let name: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT name FROM partitions WHERE table_name = ?1 AND tag = ?2",
                params![table, tag],
                |row| row.get(0),
            )
            .optional()?
        };
        match name {
            Some(name) => self.drop_partition(&name),
            None => Err(Error::NotFound(format!(
                "partition tag {tag:?} in table {table:?}"
            ))),
        }
    }

    fn show_partitions(&self, table: &str) -> Result<Vec<PartitionInfo>> {
        let conn = self.conn.lock();
        let table_exists: Option<String> = conn
            .query_row(
                "SELECT name FROM tables WHERE name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        if table_exists.is_none() {
            return Err(Error::NotFound(format!("table {table:?}")));
        }
        let mut stmt = conn.prepare(
            "SELECT table_name, name, tag FROM partitions WHERE table_name = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![table], |row| {
            Ok(PartitionInfo {
                table: row.get(0)?,
                name: row.get(1)?,
                tag: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn partition_by_tag(&self, table: &str, tag: &str) -> Result<Option<PartitionInfo>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT table_name, name, tag FROM partitions WHERE table_name = ?1 AND tag = ?2",
                params![table, tag],
                |row| {
                    Ok(PartitionInfo {
                        table: row.get(0)?,
                        name: row.get(1)?,
                        tag: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn register_segment(&self, segment: &SegmentInfo) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO segments (id, table_name, partition_name, state, row_count, deleted_count, \
             size_bytes, index_kind, max_lsn, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                segment.id as i64,
                segment.table,
                segment.partition,
                segment.state.as_str(),
                segment.row_count as i64,
                segment.deleted_count as i64,
                segment.size_bytes as i64,
                segment.index_kind.map(|k| k.as_str()),
                segment.max_lsn as i64,
                segment.created_at as i64,
                segment.updated_at as i64
            ],
        )?;
        Ok(())
    }

    fn segment(&self, id: u64) -> Result<Option<SegmentInfo>> {
        let conn = self.conn.lock();
        Ok(
            Self::segments_where(&conn, "WHERE id = ?1", &[&(id as i64)])?
                .into_iter()
                .next(),
        )
    }

    fn table_segments(&self, table: &str) -> Result<Vec<SegmentInfo>> {
        let conn = self.conn.lock();
        Self::segments_where(&conn, "WHERE table_name = ?1 ORDER BY id", &[&table])
    }

    fn update_segment_state(&self, id: u64, state: SegmentState) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE segments SET state = ?2, updated_at = ?3 WHERE id = ?1",
            params![id as i64, state.as_str(), now_ms() as i64],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("segment {id}")));
        }
        Ok(())
    }

    fn attach_index(&self, id: u64, kind: IndexKind, size_bytes: u64) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE segments SET state = 'indexed', index_kind = ?2, size_bytes = ?3, updated_at = ?4 \
             WHERE id = ?1",
            params![id as i64, kind.as_str(), size_bytes as i64, now_ms() as i64],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("segment {id}")));
        }
        Ok(())
    }

    fn set_deleted_count(&self, id: u64, deleted_count: usize) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE segments SET deleted_count = ?2, updated_at = ?3 WHERE id = ?1",
            params![id as i64, deleted_count as i64, now_ms() as i64],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("segment {id}")));
        }
        Ok(())
    }

    fn reset_index(&self, table: &str) -> Result<Vec<SegmentInfo>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let affected = Self::segments_where(
            &tx,
            "WHERE table_name = ?1 AND state = 'indexed'",
            &[&table],
        )?;
        tx.execute(
            "UPDATE segments SET state = 'raw', index_kind = NULL, updated_at = ?2 \
             WHERE table_name = ?1 AND state = 'indexed'",
            params![table, now_ms() as i64],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    fn files_to_merge(&self, table: &str) -> Result<Vec<SegmentInfo>> {
        let index_file_size = self.describe_table(table)?.index_file_size;
        let conn = self.conn.lock();
        Self::segments_where(
            &conn,
            "WHERE table_name = ?1 AND state = 'raw' AND size_bytes < ?2 ORDER BY size_bytes",
            &[&table, &(index_file_size as i64)],
        )
    }

    fn files_to_index(&self, table: &str) -> Result<Vec<SegmentInfo>> {
        if self.describe_table(table)?.index.is_none() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        Self::segments_where(
            &conn,
            "WHERE table_name = ?1 AND state = 'raw' ORDER BY id",
            &[&table],
        )
    }

    fn files_to_search(
        &self,
        table: &str,
        partitions: &[String],
    ) -> Result<Vec<(PartitionInfo, Vec<SegmentInfo>)>> {
        // Whole snapshot under one connection lock.
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT table_name, name, tag FROM partitions WHERE table_name = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![table], |row| {
            Ok(PartitionInfo {
                table: row.get(0)?,
                name: row.get(1)?,
                tag: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            let partition = row?;
            if !partitions.is_empty() && !partitions.contains(&partition.name) {
                continue;
            }
            let segments = Self::segments_where(
                &conn,
                "WHERE partition_name = ?1 AND state IN ('raw', 'indexed') ORDER BY id",
                &[&partition.name],
            )?;
            out.push((partition, segments));
        }
        Ok(out)
    }

    fn segments_to_gc(&self, cutoff_ms: u64) -> Result<Vec<SegmentInfo>> {
        let conn = self.conn.lock();
        Self::segments_where(
            &conn,
            "WHERE state = 'to_delete' AND updated_at <= ?1",
            &[&(cutoff_ms as i64)],
        )
    }

    fn table_row_count(&self, table: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COALESCE(SUM(row_count - deleted_count), 0) FROM segments \
             WHERE table_name = ?1 AND state IN ('raw', 'indexed')",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn max_segment_id(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let id: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM segments", [], |row| {
            row.get(0)
        })?;
        Ok(id as u64)
    }

    fn max_flushed_lsn(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let lsn: i64 = conn.query_row(
            "SELECT COALESCE(MAX(max_lsn), 0) FROM segments",
            [],
            |row| row.get(0),
        )?;
        Ok(lsn as u64)
    }

    fn total_size_bytes(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM segments WHERE state IN ('raw', 'indexed')",
            [],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(name: &str) -> TableSchema {
        TableSchema {
            name: name.into(),
            dim: 4,
            metric: Metric::L2,
            index_file_size: 1024,
            index: None,
            created_at: now_ms(),
        }
    }

    fn segment(id: u64, table: &str, partition: &str, rows: usize) -> SegmentInfo {
        SegmentInfo {
            id,
            table: table.into(),
            partition: partition.into(),
            state: SegmentState::Raw,
            row_count: rows,
            deleted_count: 0,
            size_bytes: (rows * 4 * 4 + rows * 8) as u64,
            index_kind: None,
            max_lsn: id,
            created_at: now_ms(),
            updated_at: now_ms(),
        }
    }

    #[test]
    fn test_table_lifecycle() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.create_table(&schema("t1")).unwrap();

        assert!(catalog.has_table("t1").unwrap());
        assert_eq!(catalog.describe_table("t1").unwrap().dim, 4);
        assert!(matches!(
            catalog.create_table(&schema("t1")),
            Err(Error::AlreadyExists(_))
        ));

        // The default partition rides along.
        let partitions = catalog.show_partitions("t1").unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].tag, DEFAULT_PARTITION_TAG);

        catalog.drop_table("t1").unwrap();
        assert!(!catalog.has_table("t1").unwrap());
        assert!(matches!(
            catalog.drop_table("t1"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_partition_tag_uniqueness() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.create_table(&schema("t1")).unwrap();
        catalog.create_partition("t1", "t1.p0", "a").unwrap();
        assert!(matches!(
            catalog.create_partition("t1", "t1.p1", "a"),
            Err(Error::AlreadyExists(_))
        ));
        // The same tag on another table is fine.
        catalog.create_table(&schema("t2")).unwrap();
        catalog.create_partition("t2", "t2.p0", "a").unwrap();
    }

    #[test]
    fn test_segment_states_and_row_count() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.create_table(&schema("t1")).unwrap();
        catalog
            .register_segment(&segment(1, "t1", "t1._default", 100))
            .unwrap();
        catalog
            .register_segment(&segment(2, "t1", "t1._default", 50))
            .unwrap();

        assert_eq!(catalog.table_row_count("t1").unwrap(), 150);

        catalog.set_deleted_count(1, 30).unwrap();
        assert_eq!(catalog.table_row_count("t1").unwrap(), 120);

        catalog
            .update_segment_state(2, SegmentState::ToDelete)
            .unwrap();
        assert_eq!(catalog.table_row_count("t1").unwrap(), 70);
        assert_eq!(catalog.max_flushed_lsn().unwrap(), 2);
        assert_eq!(catalog.max_segment_id().unwrap(), 2);
    }

    #[test]
    fn test_files_to_index_requires_spec() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.create_table(&schema("t1")).unwrap();
        catalog
            .register_segment(&segment(1, "t1", "t1._default", 10))
            .unwrap();

        assert!(catalog.files_to_index("t1").unwrap().is_empty());

        catalog
            .set_index(
                "t1",
                Some(&IndexSpec {
                    kind: IndexKind::IvfFlat,
                    params: IndexParams::default(),
                }),
            )
            .unwrap();
        assert_eq!(catalog.files_to_index("t1").unwrap().len(), 1);
    }

    #[test]
    fn test_files_to_search_filters_partitions() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.create_table(&schema("t1")).unwrap();
        catalog.create_partition("t1", "t1.p_a", "a").unwrap();
        catalog
            .register_segment(&segment(1, "t1", "t1._default", 10))
            .unwrap();
        catalog
            .register_segment(&segment(2, "t1", "t1.p_a", 10))
            .unwrap();

        let all = catalog.files_to_search("t1", &[]).unwrap();
        assert_eq!(all.len(), 2);

        let only_a = catalog
            .files_to_search("t1", &["t1.p_a".to_string()])
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].1.len(), 1);
        assert_eq!(only_a[0].1[0].id, 2);
    }

    #[test]
    fn test_reset_index_returns_affected() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.create_table(&schema("t1")).unwrap();
        catalog
            .register_segment(&segment(1, "t1", "t1._default", 10))
            .unwrap();
        catalog.attach_index(1, IndexKind::Flat, 2048).unwrap();

        let affected = catalog.reset_index("t1").unwrap();
        assert_eq!(affected.len(), 1);
        let seg = catalog.segment(1).unwrap().unwrap();
        assert_eq!(seg.state, SegmentState::Raw);
        assert_eq!(seg.index_kind, None);
    }
}
