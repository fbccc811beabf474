//! sango-engine: vector database engine core.
//!
//! Ingests high-dimensional vectors into tag-partitioned tables, stages them
//! through a WAL-backed insert buffer, persists immutable on-disk segments,
//! schedules background merging and index construction, and answers top-k
//! similarity queries by fanning out across partitions and segments.
//!
//! # Architecture
//!
//! ```text
//! Insert ──► WAL append (fsync) ──► insert buffer ──► flush ──► RAW segment
//!                                                                   │
//!                                   scheduler: merge / index-build ─┤
//!                                                                   ▼
//! Query ──► tag-regex partition resolution ──► segment fan-out ──► top-k merge
//!                      (block cache + per-segment ANN index)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sango_engine::{Engine, EngineConfig};
//! use sango_index::Metric;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::open(EngineConfig::new("./data")).await?;
//!     engine.create_table("docs", 4, Metric::L2, 64 << 20).await?;
//!
//!     engine
//!         .insert_vectors("docs", "", Some(vec![1]), vec![0.0, 0.0, 0.0, 0.0])
//!         .await?;
//!     engine.flush(None).await?;
//!
//!     let hits = engine
//!         .query("docs", &[], 1, &serde_json::Value::Null, vec![0.0; 4])
//!         .await?;
//!     assert_eq!(hits.ids[0], 1);
//!
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

mod buffer;
mod cache;
pub mod catalog;
mod config;
mod engine;
mod error;
mod executor;
mod scheduler;
mod sqlite_catalog;

pub use catalog::{
    Catalog, IndexSpec, PartitionInfo, SegmentInfo, SegmentState, TableSchema,
    DEFAULT_PARTITION_TAG,
};
pub use config::EngineConfig;
pub use engine::{Engine, QueryResult, TableInfo};
pub use error::{Error, Result};
pub use sqlite_catalog::SqliteCatalog;

// The vocabulary types callers need alongside the engine.
pub use sango_index::{IndexKind, IndexParams, Metric, SENTINEL_ID};
