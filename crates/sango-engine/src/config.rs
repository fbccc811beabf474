//! Engine configuration.

use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one engine instance. `root` is the only field without a
/// usable default; everything under it (`meta.db`, `wal/`, `tables/`) is
/// laid out by the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data directory.
    pub root: PathBuf,

    /// Force-flush cadence for aged insert buffers (default 1s).
    pub flush_interval: Duration,
    /// Merge-scan cadence (default 2s).
    pub merge_interval: Duration,
    /// Index-build scan cadence (default 2s).
    pub index_interval: Duration,
    /// Cache metrics/eviction cadence (default 5s).
    pub cache_metrics_interval: Duration,
    /// Garbage-collection scan cadence (default 2s).
    pub gc_interval: Duration,
    /// How long a TO_DELETE segment must sit quiescent before its directory
    /// is removed (default 5s).
    pub gc_quiescence: Duration,

    /// Block cache capacity in bytes (default 1 GiB).
    pub cache_capacity: u64,
    /// Fraction of capacity the metrics tick evicts down to (default 0.85).
    pub cache_watermark: f64,

    /// Per-segment search workers (default: hardware concurrency).
    pub search_parallelism: usize,
    /// Background worker cap for scheduler-driven work (default 4).
    pub background_workers: usize,

    /// Global insert-buffer pressure watermark in bytes; crossing it forces
    /// the largest buffers out (default 256 MiB).
    pub buffer_watermark: u64,

    /// WAL file rotation threshold (default 64 MiB).
    pub wal_file_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("sango-data"),
            flush_interval: Duration::from_secs(1),
            merge_interval: Duration::from_secs(2),
            index_interval: Duration::from_secs(2),
            cache_metrics_interval: Duration::from_secs(5),
            gc_interval: Duration::from_secs(2),
            gc_quiescence: Duration::from_secs(5),
            cache_capacity: 1 << 30,
            cache_watermark: 0.85,
            search_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            background_workers: 4,
            buffer_watermark: 256 << 20,
            wal_file_size: 64 << 20,
        }
    }
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(Error::InvalidArgument(
                "flush_interval must be non-zero".into(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(Error::InvalidArgument(
                "cache_capacity must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cache_watermark) {
            return Err(Error::InvalidArgument(
                "cache_watermark must be within [0, 1]".into(),
            ));
        }
        if self.search_parallelism == 0 || self.background_workers == 0 {
            return Err(Error::InvalidArgument(
                "worker pool sizes must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn meta_path(&self) -> PathBuf {
        self.root.join("meta.db")
    }

    pub(crate) fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_cache() {
        let config = EngineConfig {
            cache_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_watermark() {
        let config = EngineConfig {
            cache_watermark: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
