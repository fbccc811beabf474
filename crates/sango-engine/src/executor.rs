//! Query dispatch: partition resolution, per-segment fan-out, top-k merge.

use crate::catalog::{PartitionInfo, SegmentInfo};
use crate::engine::EngineCore;
use crate::{Error, Result};
use regex::Regex;
use sango_index::{Metric, SearchParams, SearchResult, TopK, SENTINEL_ID};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

/// Parses the recognized query-time parameters (`nprobe`; unknown keys are
/// ignored).
pub(crate) fn parse_search_params(params: &serde_json::Value) -> Result<SearchParams> {
    let mut out = SearchParams::default();
    if params.is_null() {
        return Ok(out);
    }
    let Some(map) = params.as_object() else {
        return Err(Error::InvalidArgument(
            "query params must be a JSON object".into(),
        ));
    };
    if let Some(value) = map.get("nprobe") {
        let nprobe = value
            .as_u64()
            .ok_or_else(|| Error::InvalidArgument("nprobe must be an integer".into()))?;
        if nprobe == 0 {
            return Err(Error::InvalidArgument("nprobe must be >= 1".into()));
        }
        out.nprobe = nprobe as usize;
    }
    Ok(out)
}

/// Resolves tag patterns to partitions. An empty pattern list selects every
/// partition; otherwise each pattern matches a partition when it equals the
/// tag verbatim or full-matches it as a regex. The union is duplicate-free.
pub(crate) fn resolve_partitions(
    all: &[PartitionInfo],
    patterns: &[String],
) -> Vec<PartitionInfo> {
    if patterns.is_empty() {
        return all.to_vec();
    }
    let mut out: Vec<PartitionInfo> = Vec::new();
    for pattern in patterns {
        let pattern = pattern.trim();
        let regex = Regex::new(&format!("^(?:{pattern})$")).ok();
        for partition in all {
            if out.iter().any(|p| p.name == partition.name) {
                continue;
            }
            let matched = partition.tag == pattern
                || regex.as_ref().is_some_and(|r| r.is_match(&partition.tag));
            if matched {
                out.push(partition.clone());
            }
        }
    }
    out
}

/// Runs per-segment top-k over `segments` and merges the partial results.
/// Segments load through the block cache and search in parallel, bounded by
/// the query pool size; the merge is order-independent.
pub(crate) async fn search_segments(
    core: &Arc<EngineCore>,
    segments: Vec<SegmentInfo>,
    queries: Arc<Vec<f32>>,
    nq: usize,
    k: usize,
    params: SearchParams,
    metric: Metric,
) -> Result<SearchResult> {
    let semaphore = Arc::new(Semaphore::new(core.config.search_parallelism));
    let mut tasks = Vec::with_capacity(segments.len());

    for segment in segments {
        let core = core.clone();
        let queries = queries.clone();
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::Internal("query pool closed".into()))?;
            search_one_segment(&core, &segment, &queries, k, &params, metric)
        }));
    }

    let mut partials = Vec::with_capacity(tasks.len());
    for task in tasks {
        let outcome = task
            .await
            .map_err(|e| Error::Internal(format!("segment search task: {e}")))?;
        match outcome {
            Ok(Some(partial)) => partials.push(partial),
            // Segment went unavailable mid-query; already logged.
            Ok(None) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(merge_partials(nq, k, metric, &partials))
}

/// One segment's contribution. `None` means the segment was skipped
/// (corrupt and now marked unavailable).
fn search_one_segment(
    core: &Arc<EngineCore>,
    segment: &SegmentInfo,
    queries: &[f32],
    k: usize,
    params: &SearchParams,
    metric: Metric,
) -> Result<Option<SearchResult>> {
    let guard = match core.load_segment(segment) {
        Ok(guard) => guard,
        Err(Error::Corruption(reason)) => {
            // A damaged segment drops out of the search set but never takes
            // the engine down.
            warn!(
                segment = segment.id,
                %reason,
                "segment unavailable, skipping"
            );
            core.mark_unavailable(segment.id);
            return Ok(None);
        }
        Err(other) => return Err(other),
    };

    let result = match &guard.index {
        Some(index) => index.search(queries, k, params)?,
        None => raw_scan(&guard.data, &guard.blacklist, queries, k, metric),
    };
    Ok(Some(result))
}

/// Brute-force top-k over raw rows, for segments with no built artifact.
fn raw_scan(
    data: &sango_segment::SegmentData,
    blacklist: &sango_index::Blacklist,
    queries: &[f32],
    k: usize,
    metric: Metric,
) -> SearchResult {
    let dim = data.dim;
    let nq = queries.len() / dim;
    let mut ids = Vec::with_capacity(nq * k);
    let mut distances = Vec::with_capacity(nq * k);
    for q in 0..nq {
        let query = &queries[q * dim..(q + 1) * dim];
        let mut topk = TopK::new(k, metric);
        for pos in 0..data.rows() {
            if blacklist.contains(pos) {
                continue;
            }
            topk.push(data.ids[pos], metric.score(query, data.row(pos)));
        }
        let (q_ids, q_dists) = topk.into_sorted();
        ids.extend(q_ids);
        distances.extend(q_dists);
    }
    SearchResult { k, ids, distances }
}

/// Merges per-segment results into the final `nq * k` answer. Sentinels are
/// dropped on the way in and re-padded only when fewer than `k` real hits
/// exist.
fn merge_partials(
    nq: usize,
    k: usize,
    metric: Metric,
    partials: &[SearchResult],
) -> SearchResult {
    let mut ids = Vec::with_capacity(nq * k);
    let mut distances = Vec::with_capacity(nq * k);
    for q in 0..nq {
        let mut topk = TopK::new(k, metric);
        for partial in partials {
            let base = q * partial.k;
            for slot in 0..partial.k {
                let id = partial.ids[base + slot];
                if id == SENTINEL_ID {
                    continue;
                }
                topk.push(id, partial.distances[base + slot]);
            }
        }
        let (q_ids, q_dists) = topk.into_sorted();
        ids.extend(q_ids);
        distances.extend(q_dists);
    }
    SearchResult { k, ids, distances }
}
