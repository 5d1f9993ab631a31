use std::collections::HashSet;
use std::fs;
use std::ops::{Bound, RangeBounds};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::cache::PageCache;
use super::chunk::{Chunk, ChunkParams, CHUNK_DIR};
use super::cursor::{memo_snapshot, Cursor, EntryIter, MemoSource};
use super::jobs::{Completion, Job, JobContext, JobProcessor, LookupHandle};
use super::log::{Log, ARCHIVE_DIR, LOG_DIR};
use super::merger::MergeSpec;
use super::metrics::{self, StorageMetrics};
use super::reader::ChunkReader;
use super::recovery;
use super::shard::{Shard, ShardMap, ShardSpec};
use super::toc::Toc;
use super::types::{ChunkId, ContextId, ShardId, StorageType, TrackId};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;

const LOCK_FILE: &str = "chunkstore.lock";

/// How long shutdown waits for running jobs to reach a checkpoint.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary of one chunk of a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_id: ChunkId,
    pub num_keys: u64,
    pub size: u64,
    pub written: bool,
}

/// The storage environment: shards, the log and the background jobs of one
/// data directory.
///
/// All shard and chunk metadata is owned here and changed only through
/// `&mut self`, by the thread driving the environment. Background jobs
/// report back through completions applied by [`maintain`](Self::maintain)
/// and [`wait_idle`](Self::wait_idle).
///
/// Dropping an environment without [`close`](Self::close) abandons
/// uncommitted writes, like a crash.
pub struct Environment {
    config: StorageConfig,
    params: ChunkParams,
    _lock: FileLock,
    cache: Arc<PageCache>,
    shards: ShardMap,
    log: Log,
    jobs: Option<JobProcessor>,
    next_chunk_id: ChunkId,
    /// An asynchronous commit has not completed yet.
    committing: bool,
    /// Shard and inputs of the running merge.
    merging: Option<((ContextId, ShardId), Vec<ChunkId>)>,
    /// Chunks read or written by running jobs. Their files are never
    /// deleted underneath them.
    busy: HashSet<ChunkId>,
    pruning: HashSet<(TrackId, u64)>,
    failed: OnceLock<String>,
}

impl Environment {
    /// Opens or creates the environment in `config.dir` and recovers it.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;
        fs::create_dir_all(config.dir.join(CHUNK_DIR))?;
        fs::create_dir_all(config.dir.join(LOG_DIR))?;
        if config.archive_log {
            fs::create_dir_all(config.dir.join(ARCHIVE_DIR))?;
        }

        let params = ChunkParams::from_config(&config);
        let cache = PageCache::new(config.max_cache_size);
        let recovered = recovery::recover(&config, &cache)?;
        let jobs = JobProcessor::new(
            config.worker_threads,
            JobContext {
                params: params.clone(),
                cache: Arc::clone(&cache),
                shutting_down: Arc::new(AtomicBool::new(false)),
            },
        )?;

        tracing::info!(
            dir = %config.dir.display(),
            shards = recovered.shards.len(),
            next_chunk_id = recovered.next_chunk_id,
            "Opened storage environment"
        );
        Ok(Self {
            config,
            params,
            _lock: lock,
            cache,
            shards: recovered.shards,
            log: recovered.log,
            jobs: Some(jobs),
            next_chunk_id: recovered.next_chunk_id,
            committing: false,
            merging: None,
            busy: HashSet::new(),
            pruning: HashSet::new(),
            failed: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Creates a shard. `Ok(false)` if the shard already exists.
    pub fn create_shard(&mut self, spec: ShardSpec) -> Result<bool> {
        self.check_failed()?;
        spec.validate()?;
        let key = spec.key();
        if self.shards.contains_key(&key) {
            return Ok(false);
        }
        let memo_id = self.allocate_chunk_id();
        let created_at = self.log.position(spec.track_id);
        tracing::info!(
            context_id = key.0,
            shard_id = key.1,
            track_id = spec.track_id,
            created_at = %created_at,
            "Created shard"
        );
        self.shards.insert(key, Shard::new(spec, memo_id).created_after(created_at));
        let result = self.persist_toc();
        self.guard(result)?;
        Ok(true)
    }

    /// Deletes a shard, its chunk files once no other shard references them
    /// and its track once no other shard writes to it.
    pub fn delete_shard(&mut self, context_id: ContextId, shard_id: ShardId) -> Result<bool> {
        self.check_failed()?;
        let Some(shard) = self.shards.remove(&(context_id, shard_id)) else {
            return Ok(false);
        };
        let result = self.persist_toc();
        self.guard(result)?;

        let candidates = shard
            .chunks()
            .iter()
            .filter(|chunk| chunk.is_written())
            .map(|chunk| (chunk.id(), self.params.chunk_path(chunk.id())))
            .collect();
        self.release_chunks(candidates);

        let track_id = shard.spec().track_id;
        if !self.shards.values().any(|s| s.spec().track_id == track_id) {
            let segments: Vec<(TrackId, u64, PathBuf)> = self
                .log
                .close_track(track_id)
                .into_iter()
                .map(|(segment_id, path)| (track_id, segment_id, path))
                .collect();
            self.prune(segments);
        }
        tracing::info!(context_id = context_id, shard_id = shard_id, "Deleted shard");
        Ok(true)
    }

    /// Moves `[split_key, last_key)` of a shard into new shard
    /// `new_shard_id`. `Ok(false)` if the shard is unknown or the new id
    /// is taken.
    pub fn split_shard(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        new_shard_id: ShardId,
        split_key: &[u8],
    ) -> Result<bool> {
        self.check_failed()?;
        if self.shards.contains_key(&(context_id, new_shard_id)) {
            return Ok(false);
        }
        let memo_id = self.allocate_chunk_id();
        let Some(shard) = self.shards.get_mut(&(context_id, shard_id)) else {
            return Ok(false);
        };
        let split = shard.split(split_key, new_shard_id, memo_id);
        let upper = self.guard(split)?;
        let created_at = self.log.position(upper.spec().track_id);
        let upper = upper.created_after(created_at);
        tracing::info!(
            context_id = context_id,
            shard_id = shard_id,
            new_shard_id = new_shard_id,
            chunks = upper.chunks().len(),
            "Split shard"
        );
        self.shards.insert((context_id, new_shard_id), upper);
        let result = self.persist_toc();
        self.guard(result)?;
        Ok(true)
    }

    pub fn get(&self, context_id: ContextId, shard_id: ShardId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_failed()?;
        let Some(shard) = self.shard_for(context_id, shard_id, key) else {
            return Ok(None);
        };
        self.guard(shard.get(key))
    }

    /// Looks a key up in the memo chunk right away and in the other chunks
    /// on a worker.
    pub fn get_async(&self, context_id: ContextId, shard_id: ShardId, key: &[u8]) -> Result<LookupHandle> {
        self.check_failed()?;
        let Some(shard) = self.shard_for(context_id, shard_id, key) else {
            return Ok(LookupHandle::Ready(None));
        };
        if let Some(value) = shard.memo().get(key) {
            return Ok(LookupHandle::Ready(value.map(<[u8]>::to_vec)));
        }
        let jobs = self.jobs()?;
        Ok(jobs.lookup(shard.chunks().to_vec(), key.to_vec()))
    }

    /// Live pairs of a shard within `range`, in key order. The cursor sees
    /// the shard as it is now; later writes do not show up.
    pub fn scan<R>(&self, context_id: ContextId, shard_id: ShardId, range: R) -> Result<Cursor>
    where
        R: RangeBounds<Vec<u8>>,
    {
        self.check_failed()?;
        let Some(shard) = self.shards.get(&(context_id, shard_id)) else {
            return Ok(Cursor::new(Vec::new()));
        };
        let Some((lower, upper)) = scan_bounds(shard.spec(), &range) else {
            return Ok(Cursor::new(Vec::new()));
        };

        let mut sources: Vec<EntryIter> = Vec::with_capacity(shard.chunks().len() + 1);
        for chunk in shard.chunks() {
            match chunk {
                Chunk::Memo(memo) => sources.push(Box::new(MemoSource::new(Arc::clone(memo), &lower, &upper))),
                Chunk::File(file) => {
                    let reader = ChunkReader::new(Arc::clone(file), &lower, &upper);
                    sources.push(Box::new(self.guard(reader)?));
                }
            }
        }
        sources.push(memo_snapshot(shard.memo(), &lower, &upper));
        Ok(Cursor::new(sources))
    }

    /// `Ok(false)` while a commit is in flight, for an unknown shard or for
    /// a key outside the shard's range.
    pub fn set(&mut self, context_id: ContextId, shard_id: ShardId, key: &[u8], value: &[u8]) -> Result<bool> {
        if value.len() > self.config.max_value_size {
            return Err(Error::InvalidArgument(format!(
                "value of {} bytes exceeds the maximum of {}",
                value.len(),
                self.config.max_value_size
            )));
        }
        self.write(context_id, shard_id, key, Some(value))
    }

    pub fn delete(&mut self, context_id: ContextId, shard_id: ShardId, key: &[u8]) -> Result<bool> {
        self.write(context_id, shard_id, key, None)
    }

    fn write(&mut self, context_id: ContextId, shard_id: ShardId, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        self.check_failed()?;
        if key.is_empty() || key.len() > self.config.max_key_size {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes, allowed are 1 to {}",
                key.len(),
                self.config.max_key_size
            )));
        }
        if self.committing {
            return Ok(false);
        }
        let Some(track_id) = self
            .shard_for(context_id, shard_id, key)
            .map(|shard| shard.spec().track_id)
        else {
            return Ok(false);
        };

        let appended = match value {
            Some(value) => self.log.append_set(track_id, context_id, shard_id, key, value),
            None => self.log.append_delete(track_id, context_id, shard_id, key),
        };
        let position = self.guard(appended)?;

        let chunk_size = self.config.chunk_size;
        let shard = self
            .shards
            .get_mut(&(context_id, shard_id))
            .ok_or_else(|| Error::InvalidState(format!("shard {} vanished", shard_id)))?;
        let applied = match value {
            Some(value) => shard.memo_mut().set(key, value),
            None => shard.memo_mut().delete(key),
        };
        if let Err(e) = applied {
            self.log.undo(track_id);
            return self.guard(Err(e));
        }
        shard.memo_mut().register_log_command(position);

        if shard.spec().storage_type == StorageType::Log {
            let trimmed = shard.trim_memo(chunk_size);
            self.guard(trimmed)?;
        }
        Ok(true)
    }

    /// Makes every write so far durable. With `flush` the log is written
    /// and fsynced before returning; otherwise a background job does it and
    /// writes are rejected until its completion is processed.
    pub fn commit(&mut self, flush: bool) -> Result<()> {
        self.check_failed()?;
        if self.committing {
            if !flush {
                return Ok(());
            }
            let result = self.wait_for_commit();
            self.guard(result)?;
        }
        let result = self.commit_inner(flush);
        self.guard(result)
    }

    fn commit_inner(&mut self, flush: bool) -> Result<()> {
        let sections = self.log.prepare_commit()?;
        if flush {
            for section in &sections {
                section.write()?;
            }
            self.log.rotate()?;
            self.maintain_inner()
        } else {
            if !sections.is_empty() {
                self.committing = true;
                self.jobs_mut()?.submit(Job::Commit { sections });
            }
            self.schedule()
        }
    }

    pub fn is_committing(&self) -> bool {
        self.committing
    }

    fn wait_for_commit(&mut self) -> Result<()> {
        while self.committing {
            let completion = self.jobs_mut()?.wait_completion();
            match completion {
                Some(completion) => self.apply(completion)?,
                None => self.committing = false,
            }
        }
        Ok(())
    }

    /// Applies finished jobs, then starts serializations, a merge and log
    /// pruning as needed.
    pub fn maintain(&mut self) -> Result<()> {
        self.check_failed()?;
        let result = self.maintain_inner();
        self.guard(result)
    }

    fn maintain_inner(&mut self) -> Result<()> {
        self.process_completions_inner()?;
        self.schedule()
    }

    fn schedule(&mut self) -> Result<()> {
        self.schedule_serializations();
        if self.config.merge.enabled && self.merging.is_none() {
            let threshold = self.config.merge.chunk_count_threshold.max(1);
            let candidate = self
                .shards
                .iter()
                .find(|(_, shard)| shard.persisted_chunks().count() >= threshold)
                .map(|(key, _)| *key);
            if let Some((context_id, shard_id)) = candidate {
                self.start_merge(context_id, shard_id, self.config.merge.batch_size)?;
            }
        }
        self.schedule_pruning();
        Ok(())
    }

    /// Applies every completion that is ready without blocking.
    pub fn process_completions(&mut self) -> Result<()> {
        self.check_failed()?;
        let result = self.process_completions_inner();
        self.guard(result)
    }

    fn process_completions_inner(&mut self) -> Result<()> {
        while let Some(completion) = self.jobs_mut()?.try_completion() {
            self.apply(completion)?;
        }
        Ok(())
    }

    /// Blocks until every job, including follow-up jobs, has completed and
    /// been applied.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.check_failed()?;
        let result = self.wait_idle_inner();
        self.guard(result)
    }

    fn wait_idle_inner(&mut self) -> Result<()> {
        while let Some(completion) = self.jobs_mut()?.wait_completion() {
            self.apply(completion)?;
        }
        Ok(())
    }

    /// Serializes the shard's memo chunk now, whatever its size. `Ok(false)`
    /// if the shard is unknown, of log type or its memo chunk is empty.
    pub fn serialize_shard(&mut self, context_id: ContextId, shard_id: ShardId) -> Result<bool> {
        self.check_failed()?;
        let eligible = self.shards.get(&(context_id, shard_id)).is_some_and(|shard| {
            shard.spec().storage_type == StorageType::Default && !shard.memo().is_empty()
        });
        if !eligible {
            return Ok(false);
        }
        self.start_serialize(context_id, shard_id);
        Ok(true)
    }

    /// Merges the oldest `count` written chunks of a shard now. `Ok(false)`
    /// if a merge is running or the shard has no written chunks.
    pub fn merge_shard(&mut self, context_id: ContextId, shard_id: ShardId, count: usize) -> Result<bool> {
        self.check_failed()?;
        let result = self.start_merge(context_id, shard_id, count);
        self.guard(result)
    }

    /// Midpoint key of the shard's largest chunk, for split decisions.
    pub fn shard_midpoint(&self, context_id: ContextId, shard_id: ShardId) -> Option<Vec<u8>> {
        self.shards.get(&(context_id, shard_id))?.midpoint()
    }

    /// Approximate bytes held by a shard.
    pub fn shard_size(&self, context_id: ContextId, shard_id: ShardId) -> Option<u64> {
        self.shards.get(&(context_id, shard_id)).map(Shard::size)
    }

    pub fn shard_spec(&self, context_id: ContextId, shard_id: ShardId) -> Option<&ShardSpec> {
        self.shards.get(&(context_id, shard_id)).map(Shard::spec)
    }

    /// The shard's chunks, oldest first. The active memo chunk is not
    /// included.
    pub fn shard_chunks(&self, context_id: ContextId, shard_id: ShardId) -> Option<Vec<ChunkInfo>> {
        let shard = self.shards.get(&(context_id, shard_id))?;
        Some(
            shard
                .chunks()
                .iter()
                .map(|chunk| ChunkInfo {
                    chunk_id: chunk.id(),
                    num_keys: chunk.num_keys(),
                    size: chunk.size(),
                    written: chunk.is_written(),
                })
                .collect(),
        )
    }

    pub fn collect_metrics(&self) -> Result<StorageMetrics> {
        let in_flight = self.jobs.as_ref().map_or(0, JobProcessor::in_flight);
        metrics::collect_metrics(&self.shards, &self.cache, in_flight)
    }

    /// Commits outstanding writes, waits for all jobs and shuts down.
    pub fn close(mut self) -> Result<()> {
        let result = self.check_failed().and_then(|()| {
            self.commit(true)?;
            self.wait_idle()
        });
        self.shutdown();
        if result.is_ok() {
            tracing::info!(dir = %self.config.dir.display(), "Closed storage environment");
        }
        result
    }

    fn shutdown(&mut self) {
        if let Some(jobs) = self.jobs.take() {
            jobs.shutdown(SHUTDOWN_TIMEOUT);
        }
        if let Err(e) = self.cache.shutdown() {
            tracing::warn!(error = %e, "Failed to shut down page cache");
        }
    }

    fn apply(&mut self, completion: Completion) -> Result<()> {
        match completion {
            Completion::Serialized { chunk } => {
                let chunk_id = chunk.id();
                let mut referenced = false;
                for shard in self.shards.values_mut() {
                    referenced |= shard.replace_chunk(chunk_id, Chunk::File(Arc::clone(&chunk)));
                }
                if referenced {
                    self.jobs_mut()?.submit(Job::Write { chunk });
                } else {
                    self.busy.remove(&chunk_id);
                    tracing::debug!(chunk_id = chunk_id, "Dropping serialized chunk of a deleted shard");
                }
            }
            Completion::Written { chunk_id } => {
                self.busy.remove(&chunk_id);
                let chunk = self
                    .shards
                    .values()
                    .flat_map(|shard| shard.chunks())
                    .find(|chunk| chunk.id() == chunk_id)
                    .and_then(Chunk::as_file)
                    .cloned();
                match chunk {
                    Some(chunk) => {
                        chunk.mark_written()?;
                        self.persist_toc()?;
                    }
                    None => {
                        let path = self.params.chunk_path(chunk_id);
                        self.release_chunks(vec![(chunk_id, path)]);
                    }
                }
            }
            Completion::Merged { inputs, chunk } => {
                let Some((shard_key, _)) = self.merging.take() else {
                    return Err(Error::InvalidState("merge completed while none was running".into()));
                };
                for input in &inputs {
                    self.busy.remove(input);
                }
                let merged_id = chunk.id();
                let replaced = self
                    .shards
                    .get_mut(&shard_key)
                    .is_some_and(|shard| shard.replace_merged(&inputs, Chunk::File(chunk)));
                let mut candidates: Vec<(ChunkId, PathBuf)> = inputs
                    .into_iter()
                    .map(|id| (id, self.params.chunk_path(id)))
                    .collect();
                if replaced {
                    self.persist_toc()?;
                } else {
                    tracing::info!(chunk_id = merged_id, "Discarding merge output of a changed shard");
                    candidates.push((merged_id, self.params.chunk_path(merged_id)));
                }
                self.release_chunks(candidates);
            }
            Completion::Committed { tracks } => {
                self.committing = false;
                tracing::debug!(tracks = ?tracks, "Commit completed");
                self.log.rotate()?;
            }
            Completion::Pruned { segments } => {
                for (track_id, segment_id) in segments {
                    self.pruning.remove(&(track_id, segment_id));
                    self.log.forget(track_id, segment_id);
                }
            }
            Completion::ChunksDeleted { chunk_ids } => {
                tracing::debug!(chunk_ids = ?chunk_ids, "Chunk files deleted");
            }
            Completion::Failed { job, error } => {
                if job == "commit" {
                    self.committing = false;
                }
                if job == "merge" {
                    if let Some((_, inputs)) = self.merging.take() {
                        for input in inputs {
                            self.busy.remove(&input);
                        }
                    }
                }
                match error {
                    Error::ShuttingDown => {
                        tracing::debug!(job = job, "Job stopped for shutdown");
                    }
                    error if error.is_fatal() => return Err(error),
                    error => {
                        tracing::warn!(job = job, error = %error, "Background job failed");
                    }
                }
            }
        }
        Ok(())
    }

    fn schedule_serializations(&mut self) {
        let chunk_size = self.config.chunk_size;
        let due: Vec<(ContextId, ShardId)> = self
            .shards
            .iter()
            .filter(|(_, shard)| {
                shard.spec().storage_type == StorageType::Default
                    && !shard.memo().is_empty()
                    && shard.memo().get_size() >= chunk_size
            })
            .map(|(key, _)| *key)
            .collect();
        for (context_id, shard_id) in due {
            self.start_serialize(context_id, shard_id);
        }
    }

    fn start_serialize(&mut self, context_id: ContextId, shard_id: ShardId) {
        let memo_id = self.allocate_chunk_id();
        let Some(shard) = self.shards.get_mut(&(context_id, shard_id)) else {
            return;
        };
        let use_bloom_filter = shard.spec().use_bloom_filter;
        let memo = shard.freeze_memo(memo_id);
        tracing::debug!(
            chunk_id = memo.chunk_id(),
            shard_id = shard_id,
            size = memo.get_size(),
            "Serializing memo chunk"
        );
        self.busy.insert(memo.chunk_id());
        if let Some(jobs) = self.jobs.as_mut() {
            jobs.submit(Job::Serialize {
                memo,
                use_bloom_filter,
            });
        }
    }

    fn start_merge(&mut self, context_id: ContextId, shard_id: ShardId, count: usize) -> Result<bool> {
        if self.merging.is_some() {
            return Ok(false);
        }
        let Some(shard) = self.shards.get(&(context_id, shard_id)) else {
            return Ok(false);
        };
        let inputs: Vec<_> = shard
            .mergeable_prefix(count.max(1))
            .iter()
            .filter_map(Chunk::as_file)
            .cloned()
            .collect();
        if inputs.is_empty() {
            return Ok(false);
        }
        let spec = shard.spec();
        let (first_key, last_key, use_bloom_filter) =
            (spec.first_key.clone(), spec.last_key.clone(), spec.use_bloom_filter);

        let chunk_id = self.allocate_chunk_id();
        let input_ids: Vec<ChunkId> = inputs.iter().map(|chunk| chunk.id()).collect();
        tracing::debug!(
            shard_id = shard_id,
            chunk_id = chunk_id,
            inputs = ?input_ids,
            "Merging chunks"
        );
        self.busy.extend(input_ids.iter().copied());
        self.merging = Some(((context_id, shard_id), input_ids));
        self.jobs_mut()?.submit(Job::Merge {
            spec: MergeSpec {
                inputs,
                chunk_id,
                first_key,
                last_key,
                use_bloom_filter,
            },
        });
        Ok(true)
    }

    /// Prunes sealed segments no shard of their track depends on.
    fn schedule_pruning(&mut self) {
        let prunable: Vec<(TrackId, u64, PathBuf)> = self
            .log
            .sealed()
            .filter(|segment| !self.pruning.contains(segment))
            .filter(|(track_id, segment_id)| {
                self.log.current_segment_id(*track_id) != Some(*segment_id)
                    && !self.shards.values().any(|shard| {
                        shard.spec().track_id == *track_id && shard.is_backing_log_segment(*segment_id)
                    })
            })
            .map(|(track_id, segment_id)| (track_id, segment_id, self.log.segment_path(track_id, segment_id)))
            .collect();
        self.prune(prunable);
    }

    fn prune(&mut self, segments: Vec<(TrackId, u64, PathBuf)>) {
        if segments.is_empty() {
            return;
        }
        self.pruning
            .extend(segments.iter().map(|(track_id, segment_id, _)| (*track_id, *segment_id)));
        let archive_dir = self.config.archive_log.then(|| self.config.dir.join(ARCHIVE_DIR));
        if let Some(jobs) = self.jobs.as_mut() {
            jobs.submit(Job::Prune {
                segments,
                archive_dir,
            });
        }
    }

    /// Deletes the candidate chunk files that no shard references and no
    /// job uses.
    fn release_chunks(&mut self, candidates: Vec<(ChunkId, PathBuf)>) {
        let chunks: Vec<(ChunkId, PathBuf)> = candidates
            .into_iter()
            .filter(|(chunk_id, _)| {
                !self.busy.contains(chunk_id) && !self.shards.values().any(|shard| shard.references(*chunk_id))
            })
            .collect();
        if chunks.is_empty() {
            return;
        }
        if let Some(jobs) = self.jobs.as_mut() {
            jobs.submit(Job::DeleteChunks { chunks });
        }
    }

    fn persist_toc(&self) -> Result<()> {
        Toc::from_shards(self.shards.values()).write(&self.config.dir)
    }

    fn shard_for(&self, context_id: ContextId, shard_id: ShardId, key: &[u8]) -> Option<&Shard> {
        self.shards
            .get(&(context_id, shard_id))
            .filter(|shard| shard.contains(key))
    }

    fn allocate_chunk_id(&mut self) -> ChunkId {
        let chunk_id = self.next_chunk_id;
        self.next_chunk_id += 1;
        chunk_id
    }

    fn jobs(&self) -> Result<&JobProcessor> {
        self.jobs.as_ref().ok_or(Error::ShuttingDown)
    }

    fn jobs_mut(&mut self) -> Result<&mut JobProcessor> {
        self.jobs.as_mut().ok_or(Error::ShuttingDown)
    }

    fn check_failed(&self) -> Result<()> {
        match self.failed.get() {
            Some(reason) => Err(Error::Failed(reason.clone())),
            None => Ok(()),
        }
    }

    /// Latches fatal errors: the environment refuses all later operations.
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.failed.set(e.to_string()).is_ok() {
                tracing::error!(
                    dir = %self.config.dir.display(),
                    error = %e,
                    "Fatal storage error, stopping environment"
                );
            }
        }
        result
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.jobs.is_some() {
            tracing::warn!(dir = %self.config.dir.display(), "Environment dropped without close");
            self.shutdown();
        }
    }
}

/// Intersects a requested range with a shard's range. Returns inclusive
/// lower and exclusive upper keys, an empty upper meaning unbounded, or
/// `None` if nothing can match.
fn scan_bounds<R: RangeBounds<Vec<u8>>>(spec: &ShardSpec, range: &R) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut lower = match range.start_bound() {
        Bound::Included(key) => key.clone(),
        Bound::Excluded(key) => successor(key),
        Bound::Unbounded => Vec::new(),
    };
    let mut upper = match range.end_bound() {
        Bound::Excluded(key) if key.is_empty() => return None,
        Bound::Excluded(key) => key.clone(),
        Bound::Included(key) => successor(key),
        Bound::Unbounded => Vec::new(),
    };

    if spec.first_key > lower {
        lower = spec.first_key.clone();
    }
    if !spec.last_key.is_empty() && (upper.is_empty() || spec.last_key < upper) {
        upper = spec.last_key.clone();
    }
    if !upper.is_empty() && lower >= upper {
        return None;
    }
    Some((lower, upper))
}

/// The smallest key greater than `key`.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeConfig;
    use crate::storage::log::replay::list_segments;

    fn config(dir: &std::path::Path) -> StorageConfig {
        StorageConfig::new(dir)
            .page_granularity(512)
            .data_page_size(1024)
            .max_key_size(64)
            .max_value_size(1024)
            .max_cache_size(1 << 20)
            .merge(MergeConfig::default().enabled(false))
    }

    fn open_with_shard(config: StorageConfig) -> Result<Environment> {
        let mut env = Environment::open(config)?;
        env.create_shard(ShardSpec::new(1, 1, 1, 1))?;
        Ok(env)
    }

    fn scan_all(env: &Environment, shard_id: ShardId) -> Result<Vec<(String, String)>> {
        env.scan(1, shard_id, ..)?
            .map(|entry| {
                entry.map(|(key, value)| {
                    (
                        String::from_utf8_lossy(&key).into_owned(),
                        String::from_utf8_lossy(&value).into_owned(),
                    )
                })
            })
            .collect()
    }

    #[test]
    fn test_committed_writes_survive_crash() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        assert!(env.set(1, 1, b"a", b"1")?);
        assert!(env.set(1, 1, b"b", b"2")?);
        env.commit(true)?;
        assert!(env.set(1, 1, b"c", b"never committed")?);
        drop(env);

        let env = Environment::open(config(dir.path()))?;
        assert_eq!(env.get(1, 1, b"a")?, Some(b"1".to_vec()));
        assert_eq!(env.get(1, 1, b"b")?, Some(b"2".to_vec()));
        assert_eq!(env.get(1, 1, b"c")?, None);
        env.close()
    }

    #[test]
    fn test_commit_after_pruning_every_segment_survives_crash() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        env.set(1, 1, b"a", b"1")?;
        env.commit(true)?;
        assert!(env.serialize_shard(1, 1)?);
        env.close()?;

        let mut env = Environment::open(config(dir.path()))?;
        env.maintain()?;
        env.wait_idle()?;
        assert!(list_segments(&dir.path().join(LOG_DIR))?.is_empty());
        env.close()?;

        let mut env = Environment::open(config(dir.path()))?;
        assert!(env.set(1, 1, b"b", b"2")?);
        env.commit(true)?;
        drop(env);

        let env = Environment::open(config(dir.path()))?;
        assert_eq!(env.get(1, 1, b"a")?, Some(b"1".to_vec()));
        assert_eq!(env.get(1, 1, b"b")?, Some(b"2".to_vec()));
        env.close()
    }

    #[test]
    fn test_recreated_shard_does_not_replay_deleted_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        assert!(env.create_shard(ShardSpec::new(1, 1, 2, 1))?);
        env.set(1, 1, b"k", b"old")?;
        env.set(1, 2, b"k", b"other")?;
        env.commit(true)?;

        assert!(env.delete_shard(1, 1)?);
        assert!(env.create_shard(ShardSpec::new(1, 1, 1, 1))?);
        assert_eq!(env.get(1, 1, b"k")?, None);
        env.set(1, 1, b"j", b"new")?;
        env.commit(true)?;
        drop(env);

        let env = Environment::open(config(dir.path()))?;
        assert_eq!(env.get(1, 1, b"k")?, None);
        assert_eq!(env.get(1, 1, b"j")?, Some(b"new".to_vec()));
        assert_eq!(env.get(1, 2, b"k")?, Some(b"other".to_vec()));
        env.close()
    }

    #[test]
    fn test_close_commits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        env.set(1, 1, b"k", b"v")?;
        env.close()?;

        let env = Environment::open(config(dir.path()))?;
        assert_eq!(env.get(1, 1, b"k")?, Some(b"v".to_vec()));
        env.close()
    }

    #[test]
    fn test_merging_a_deleted_key_alone_leaves_no_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        env.set(1, 1, b"x", b"1")?;
        env.delete(1, 1, b"x")?;
        env.commit(true)?;

        assert!(env.serialize_shard(1, 1)?);
        env.wait_idle()?;
        let chunks = env.shard_chunks(1, 1).unwrap_or_default();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].written);
        assert_eq!(chunks[0].num_keys, 1);

        assert!(env.merge_shard(1, 1, 1)?);
        env.wait_idle()?;
        let merged = env.shard_chunks(1, 1).unwrap_or_default();
        assert_eq!(merged.len(), 1);
        assert_ne!(merged[0].chunk_id, chunks[0].chunk_id);
        assert_eq!(merged[0].num_keys, 0);
        assert!(!ChunkParams::from_config(env.config())
            .chunk_path(chunks[0].chunk_id)
            .exists());
        assert_eq!(env.get(1, 1, b"x")?, None);
        env.close()
    }

    #[test]
    fn test_replay_does_not_reapply_persisted_commands() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        env.set(1, 1, b"d", b"1")?;
        env.set(1, 1, b"k", b"1")?;
        env.commit(true)?;
        env.serialize_shard(1, 1)?;
        env.wait_idle()?;

        env.delete(1, 1, b"d")?;
        env.set(1, 1, b"k", b"2")?;
        env.commit(true)?;
        drop(env);

        for _ in 0..2 {
            let env = Environment::open(config(dir.path()))?;
            assert_eq!(env.get(1, 1, b"d")?, None);
            assert_eq!(env.get(1, 1, b"k")?, Some(b"2".to_vec()));
            assert_eq!(scan_all(&env, 1)?, vec![("k".to_string(), "2".to_string())]);
            drop(env);
        }
        Ok(())
    }

    #[test]
    fn test_scan_merges_chunks_and_memo() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        for key in ["a", "b", "c", "d"] {
            env.set(1, 1, key.as_bytes(), b"old")?;
        }
        env.commit(true)?;
        env.serialize_shard(1, 1)?;
        env.wait_idle()?;
        env.set(1, 1, b"b", b"new")?;
        env.delete(1, 1, b"c")?;
        env.set(1, 1, b"e", b"new")?;

        let mut cursor = env.scan(1, 1, ..)?;
        // writes after the cursor opened are not visible
        env.set(1, 1, b"f", b"later")?;
        let first = cursor.next().transpose()?;
        assert_eq!(first, Some((b"a".to_vec(), b"old".to_vec())));
        let rest: Vec<Vec<u8>> = cursor.map(|entry| entry.map(|(key, _)| key)).collect::<Result<_>>()?;
        assert_eq!(rest, vec![b"b".to_vec(), b"d".to_vec(), b"e".to_vec()]);

        let bounded: Vec<(Vec<u8>, Vec<u8>)> = env
            .scan(1, 1, b"b".to_vec()..=b"d".to_vec())?
            .collect::<Result<_>>()?;
        assert_eq!(
            bounded,
            vec![(b"b".to_vec(), b"new".to_vec()), (b"d".to_vec(), b"old".to_vec())]
        );
        assert_eq!(env.scan(1, 1, b"x".to_vec()..b"a".to_vec())?.count(), 0);
        assert_eq!(env.scan(1, 9, ..)?.count(), 0);
        env.close()
    }

    #[test]
    fn test_get_async() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        env.set(1, 1, b"on-disk", b"1")?;
        env.commit(true)?;
        env.serialize_shard(1, 1)?;
        env.wait_idle()?;
        env.set(1, 1, b"in-memo", b"2")?;

        assert!(matches!(env.get_async(1, 1, b"in-memo")?, LookupHandle::Ready(_)));
        assert_eq!(env.get_async(1, 1, b"in-memo")?.wait()?, Some(b"2".to_vec()));
        assert_eq!(env.get_async(1, 1, b"on-disk")?.wait()?, Some(b"1".to_vec()));
        assert_eq!(env.get_async(1, 1, b"missing")?.wait()?, None);
        assert_eq!(env.get_async(1, 5, b"on-disk")?.wait()?, None);
        env.close()
    }

    #[test]
    fn test_split_shard_survives_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = Environment::open(config(dir.path()))?;
        env.create_shard(ShardSpec::new(1, 4, 1, 1).range(b"a", b"z"))?;
        for key in ["b", "f", "m", "t"] {
            env.set(1, 1, key.as_bytes(), key.as_bytes())?;
        }
        env.commit(true)?;

        assert!(env.split_shard(1, 1, 2, b"m")?);
        assert!(!env.split_shard(1, 1, 2, b"c")?);
        assert_eq!(env.shard_spec(1, 2).map(|spec| spec.first_key.clone()), Some(b"m".to_vec()));
        assert_eq!(env.get(1, 2, b"t")?, Some(b"t".to_vec()));
        assert_eq!(env.get(1, 1, b"t")?, None);
        assert!(!env.set(1, 1, b"u", b"u")?);
        assert!(env.set(1, 2, b"u", b"u")?);
        env.commit(true)?;
        drop(env);

        let env = Environment::open(config(dir.path()))?;
        assert_eq!(env.get(1, 1, b"f")?, Some(b"f".to_vec()));
        assert_eq!(env.get(1, 2, b"m")?, Some(b"m".to_vec()));
        assert_eq!(env.get(1, 2, b"t")?, Some(b"t".to_vec()));
        assert_eq!(env.get(1, 2, b"u")?, Some(b"u".to_vec()));
        assert_eq!(env.get(1, 1, b"m")?, None);
        env.close()
    }

    #[test]
    fn test_delete_shard_removes_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        env.set(1, 1, b"a", b"1")?;
        env.commit(true)?;
        env.serialize_shard(1, 1)?;
        env.wait_idle()?;
        let chunks = env.shard_chunks(1, 1).unwrap_or_default();
        let path = ChunkParams::from_config(env.config()).chunk_path(chunks[0].chunk_id);
        assert!(path.exists());

        assert!(env.delete_shard(1, 1)?);
        assert!(!env.delete_shard(1, 1)?);
        env.wait_idle()?;
        assert!(!path.exists());
        assert!(list_segments(&dir.path().join(LOG_DIR))?.is_empty());
        assert!(!env.set(1, 1, b"a", b"2")?);
        env.close()?;

        let mut env = Environment::open(config(dir.path()))?;
        assert_eq!(env.get(1, 1, b"a")?, None);
        assert!(env.create_shard(ShardSpec::new(1, 1, 1, 1))?);
        assert!(!env.create_shard(ShardSpec::new(1, 1, 1, 1))?);
        env.close()
    }

    #[test]
    fn test_log_storage_type_drops_smallest_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = Environment::open(config(dir.path()).chunk_size(1024))?;
        env.create_shard(ShardSpec::new(1, 1, 1, 1).storage_type(StorageType::Log))?;
        for i in 0..100u32 {
            env.set(1, 1, format!("{:04}", i).as_bytes(), &[7u8; 64])?;
        }
        env.commit(true)?;
        env.maintain()?;
        env.wait_idle()?;

        assert!(env.shard_size(1, 1).unwrap_or_default() <= 1024);
        assert!(env.shard_chunks(1, 1).unwrap_or_default().is_empty());
        assert_eq!(env.get(1, 1, b"0000")?, None);
        assert_eq!(env.get(1, 1, b"0099")?, Some(vec![7u8; 64]));
        env.close()
    }

    #[test]
    fn test_second_open_is_locked_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Environment::open(config(dir.path()))?;
        assert!(matches!(Environment::open(config(dir.path())), Err(Error::LockError(_))));
        env.close()
    }

    #[test]
    fn test_async_commit_rejects_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        env.set(1, 1, b"a", b"1")?;
        env.commit(false)?;
        assert!(env.is_committing());
        assert!(!env.set(1, 1, b"b", b"2")?);

        env.wait_idle()?;
        assert!(!env.is_committing());
        assert!(env.set(1, 1, b"b", b"2")?);
        env.commit(false)?;
        env.commit(true)?;
        assert!(!env.is_committing());
        drop(env);

        let env = Environment::open(config(dir.path()))?;
        assert_eq!(env.get(1, 1, b"a")?, Some(b"1".to_vec()));
        assert_eq!(env.get(1, 1, b"b")?, Some(b"2".to_vec()));
        env.close()
    }

    #[test]
    fn test_background_maintenance() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path())
            .chunk_size(2048)
            .log_segment_size(4096)
            .merge(MergeConfig::default().chunk_count_threshold(3).batch_size(2));
        let mut env = open_with_shard(config.clone())?;
        for round in 0..8u32 {
            for i in 0..40u32 {
                let key = format!("key{:03}", (i * 7 + round) % 97);
                env.set(1, 1, key.as_bytes(), format!("{:0>100}", round).as_bytes())?;
            }
            env.commit(true)?;
            env.wait_idle()?;
        }
        env.maintain()?;
        env.wait_idle()?;

        let chunks = env.shard_chunks(1, 1).unwrap_or_default();
        assert!(!chunks.is_empty());
        assert!(chunks.len() < 8);
        let segments = list_segments(&dir.path().join(LOG_DIR))?;
        assert!(segments.len() < 8);

        let before = scan_all(&env, 1)?;
        let metrics = env.collect_metrics()?;
        assert_eq!(metrics.shards, 1);
        drop(env);

        let env = Environment::open(config)?;
        assert_eq!(scan_all(&env, 1)?, before);
        env.close()
    }

    #[test]
    fn test_invalid_arguments_are_not_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = open_with_shard(config(dir.path()))?;
        assert!(matches!(env.set(1, 1, &[0u8; 65], b"v"), Err(Error::InvalidArgument(_))));
        assert!(matches!(env.set(1, 1, b"", b"v"), Err(Error::InvalidArgument(_))));
        assert!(matches!(env.set(1, 1, b"k", &[0u8; 1025]), Err(Error::InvalidArgument(_))));
        assert!(env.split_shard(1, 1, 2, b"").is_err());
        assert!(env.set(1, 1, b"k", b"v")?);
        env.close()
    }

    #[test]
    fn test_corrupt_chunk_latches_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let mut env = open_with_shard(config.clone())?;
        env.set(1, 1, b"a", b"1")?;
        env.commit(true)?;
        env.serialize_shard(1, 1)?;
        env.wait_idle()?;

        let params = ChunkParams::from_config(&config);
        let chunks = env.shard_chunks(1, 1).unwrap_or_default();
        let path = params.chunk_path(chunks[0].chunk_id);
        let mut bytes = std::fs::read(&path)?;
        bytes[params.header_page_size + 20] ^= 0xff;
        std::fs::write(&path, bytes)?;

        assert!(matches!(env.get(1, 1, b"a"), Err(Error::ChecksumMismatch(_))));
        assert!(matches!(env.set(1, 1, b"b", b"2"), Err(Error::Failed(_))));
        assert!(matches!(env.close(), Err(Error::Failed(_))));
        Ok(())
    }

    #[test]
    fn test_scan_bounds() {
        let spec = ShardSpec::new(1, 1, 1, 1).range(b"c", b"m");
        assert_eq!(
            scan_bounds(&spec, &(..)),
            Some((b"c".to_vec(), b"m".to_vec()))
        );
        assert_eq!(
            scan_bounds(&spec, &(b"a".to_vec()..=b"e".to_vec())),
            Some((b"c".to_vec(), b"e\0".to_vec()))
        );
        assert_eq!(scan_bounds(&spec, &(b"n".to_vec()..)), None);
        assert_eq!(scan_bounds(&spec, &(..Vec::new())), None);

        let open = ShardSpec::new(1, 1, 1, 1);
        assert_eq!(
            scan_bounds(&open, &(b"k".to_vec()..)),
            Some((b"k".to_vec(), Vec::new()))
        );
    }
}
