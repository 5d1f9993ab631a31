use super::cache::{CacheStats, PageCache};
use super::shard::ShardMap;
use crate::error::Result;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StorageMetrics {
    pub shards: usize,
    pub memo_bytes: usize,
    /// Frozen memo chunks and serialized chunks not on disk yet.
    pub pending_chunks: usize,
    pub written_chunks: usize,
    pub jobs_in_flight: usize,
    pub cache: CacheStats,
}

/// Collect metrics from the environment state and log them
pub fn collect_metrics(shards: &ShardMap, cache: &PageCache, jobs_in_flight: usize) -> Result<StorageMetrics> {
    let mut metrics = StorageMetrics {
        shards: shards.len(),
        jobs_in_flight,
        cache: cache.stats()?,
        ..Default::default()
    };
    for shard in shards.values() {
        metrics.memo_bytes += shard.memo().get_size();
        for chunk in shard.chunks() {
            if chunk.is_written() {
                metrics.written_chunks += 1;
            } else {
                metrics.pending_chunks += 1;
            }
        }
    }

    tracing::info!(
        shards = metrics.shards,
        memo_bytes = metrics.memo_bytes,
        pending_chunks = metrics.pending_chunks,
        written_chunks = metrics.written_chunks,
        jobs_in_flight = metrics.jobs_in_flight,
        cache_size = metrics.cache.size,
        cache_pages = metrics.cache.pages,
        cache_hits = metrics.cache.hits,
        cache_misses = metrics.cache.misses,
        cache_evictions = metrics.cache.evictions,
        "Storage metrics"
    );

    Ok(metrics)
}
