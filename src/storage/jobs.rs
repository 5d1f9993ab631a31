//! Background jobs.
//!
//! Long-running work (serializing, writing and merging chunks, writing log
//! sections, pruning segments, deleting chunk files) runs on the blocking
//! pool of a private tokio runtime. Every job reports one [`Completion`]
//! over a channel that the control thread drains; shard and chunk metadata
//! is only ever changed there. Jobs check the shared shutdown flag between
//! records and pages and stop early once it is set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

use super::cache::PageCache;
use super::chunk::{Chunk, ChunkParams, FileChunk, MemoChunk};
use super::log::PendingCommit;
use super::merger::{merge, MergeSpec};
use super::serializer::serialize;
use super::types::{ChunkId, TrackId};
use super::writer::write_image;
use crate::disk;
use crate::error::{Error, Result};

/// Everything a job needs besides its own input.
pub struct JobContext {
    pub params: ChunkParams,
    pub cache: Arc<PageCache>,
    pub shutting_down: Arc<AtomicBool>,
}

#[derive(Debug)]
pub enum Job {
    /// Turn a frozen memo chunk into page images.
    Serialize {
        memo: Arc<MemoChunk>,
        use_bloom_filter: bool,
    },
    /// Persist a serialized file chunk. The control thread marks it
    /// written once the TOC can list it.
    Write { chunk: Arc<FileChunk> },
    Merge { spec: MergeSpec },
    /// Write and fsync framed log sections.
    Commit { sections: Vec<PendingCommit> },
    /// Delete or archive sealed log segments.
    Prune {
        segments: Vec<(TrackId, u64, PathBuf)>,
        archive_dir: Option<PathBuf>,
    },
    DeleteChunks { chunks: Vec<(ChunkId, PathBuf)> },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Serialize { .. } => "serialize",
            Job::Write { .. } => "write",
            Job::Merge { .. } => "merge",
            Job::Commit { .. } => "commit",
            Job::Prune { .. } => "prune",
            Job::DeleteChunks { .. } => "delete-chunks",
        }
    }

    fn run(self, ctx: &JobContext) -> Completion {
        let name = self.name();
        let result = match self {
            Job::Serialize {
                memo,
                use_bloom_filter,
            } => run_serialize(ctx, &memo, use_bloom_filter),
            Job::Write { chunk } => run_write(ctx, &chunk),
            Job::Merge { spec } => run_merge(ctx, spec),
            Job::Commit { sections } => run_commit(sections),
            Job::Prune {
                segments,
                archive_dir,
            } => run_prune(segments, archive_dir),
            Job::DeleteChunks { chunks } => run_delete_chunks(ctx, chunks),
        };
        result.unwrap_or_else(|error| Completion::Failed { job: name, error })
    }
}

#[derive(Debug)]
pub enum Completion {
    /// The chunk is in the serialized state and readable.
    Serialized { chunk: Arc<FileChunk> },
    Written { chunk_id: ChunkId },
    Merged {
        inputs: Vec<ChunkId>,
        chunk: Arc<FileChunk>,
    },
    Committed { tracks: Vec<TrackId> },
    Pruned { segments: Vec<(TrackId, u64)> },
    ChunksDeleted { chunk_ids: Vec<ChunkId> },
    Failed { job: &'static str, error: Error },
}

fn run_serialize(ctx: &JobContext, memo: &Arc<MemoChunk>, use_bloom_filter: bool) -> Result<Completion> {
    let image = serialize(memo, &ctx.params, use_bloom_filter, &ctx.shutting_down)?;
    memo.mark_serialized();
    let path = ctx.params.chunk_path(memo.chunk_id());
    let chunk = FileChunk::from_image(path, image, Arc::clone(&ctx.cache));
    Ok(Completion::Serialized {
        chunk: Arc::new(chunk),
    })
}

fn run_write(ctx: &JobContext, chunk: &Arc<FileChunk>) -> Result<Completion> {
    let image = chunk.image()?.ok_or_else(|| {
        Error::InvalidState(format!("chunk {} is already written", chunk.id()))
    })?;
    if let Err(e) = write_image(chunk.path(), &image, &ctx.shutting_down) {
        if let Err(remove) = disk::remove_file_if_exists(chunk.path()) {
            tracing::warn!(path = %chunk.path().display(), error = %remove, "Failed to remove partial chunk file");
        }
        return Err(e);
    }
    tracing::info!(
        chunk_id = chunk.id(),
        num_keys = chunk.num_keys(),
        size = image.header.file_size(),
        "Wrote chunk"
    );
    Ok(Completion::Written {
        chunk_id: chunk.id(),
    })
}

fn run_merge(ctx: &JobContext, spec: MergeSpec) -> Result<Completion> {
    merge(&spec, &ctx.params, &ctx.shutting_down)?;
    let path = ctx.params.chunk_path(spec.chunk_id);
    let chunk = FileChunk::open(&path, spec.chunk_id, Arc::clone(&ctx.cache))?;
    Ok(Completion::Merged {
        inputs: spec.inputs.iter().map(|chunk| chunk.id()).collect(),
        chunk: Arc::new(chunk),
    })
}

fn run_commit(sections: Vec<PendingCommit>) -> Result<Completion> {
    let mut tracks = Vec::with_capacity(sections.len());
    for section in &sections {
        section.write()?;
        tracks.push(section.track_id);
    }
    Ok(Completion::Committed { tracks })
}

fn run_prune(segments: Vec<(TrackId, u64, PathBuf)>, archive_dir: Option<PathBuf>) -> Result<Completion> {
    let mut pruned = Vec::with_capacity(segments.len());
    if let Some(archive) = &archive_dir {
        std::fs::create_dir_all(archive)?;
    }
    for (track_id, segment_id, path) in segments {
        match &archive_dir {
            Some(archive) => {
                let Some(name) = path.file_name() else {
                    continue;
                };
                std::fs::rename(&path, archive.join(name))
                    .map_err(|e| Error::Write(path.display().to_string(), e))?;
            }
            None => {
                if !disk::remove_file_if_exists(&path)? {
                    tracing::warn!(path = %path.display(), "Log segment already gone");
                }
            }
        }
        tracing::info!(
            track_id = track_id,
            segment_id = segment_id,
            archived = archive_dir.is_some(),
            "Pruned log segment"
        );
        pruned.push((track_id, segment_id));
        if let Some(dir) = path.parent() {
            disk::sync_dir(dir)?;
        }
    }
    Ok(Completion::Pruned { segments: pruned })
}

fn run_delete_chunks(ctx: &JobContext, chunks: Vec<(ChunkId, PathBuf)>) -> Result<Completion> {
    let mut chunk_ids = Vec::with_capacity(chunks.len());
    for (chunk_id, path) in chunks {
        ctx.cache.evict_chunk(chunk_id)?;
        if disk::remove_file_if_exists(&path)? {
            tracing::debug!(chunk_id = chunk_id, "Deleted chunk file");
        } else {
            tracing::warn!(chunk_id = chunk_id, path = %path.display(), "Chunk file already gone");
        }
        chunk_ids.push(chunk_id);
    }
    Ok(Completion::ChunksDeleted { chunk_ids })
}

/// Newest chunk first; a tombstone ends the search.
fn lookup_chunks(chunks: &[Chunk], key: &[u8]) -> Result<Option<Vec<u8>>> {
    for chunk in chunks.iter().rev() {
        if let Some(value) = chunk.get(key)? {
            return Ok(value);
        }
    }
    Ok(None)
}

/// Result of a point lookup that may still be running on a worker.
#[derive(Debug)]
pub enum LookupHandle {
    Ready(Option<Vec<u8>>),
    Pending(oneshot::Receiver<Result<Option<Vec<u8>>>>),
}

impl LookupHandle {
    /// Blocks until the lookup finished. Must not be called from inside
    /// the job runtime.
    pub fn wait(self) -> Result<Option<Vec<u8>>> {
        match self {
            LookupHandle::Ready(value) => Ok(value),
            LookupHandle::Pending(rx) => rx.blocking_recv().map_err(|_| Error::ShuttingDown)?,
        }
    }

    /// Returns the result if it is available, otherwise the handle back.
    pub fn try_take(self) -> std::result::Result<Result<Option<Vec<u8>>>, Self> {
        match self {
            LookupHandle::Ready(value) => Ok(Ok(value)),
            LookupHandle::Pending(mut rx) => match rx.try_recv() {
                Ok(result) => Ok(result),
                Err(oneshot::error::TryRecvError::Empty) => Err(LookupHandle::Pending(rx)),
                Err(oneshot::error::TryRecvError::Closed) => Ok(Err(Error::ShuttingDown)),
            },
        }
    }
}

pub struct JobProcessor {
    runtime: Runtime,
    context: Arc<JobContext>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    in_flight: usize,
}

impl JobProcessor {
    pub fn new(worker_threads: usize, context: JobContext) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(worker_threads.max(1))
            .thread_name("chunkstore-worker")
            .build()?;
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            context: Arc::new(context),
            completions_tx,
            completions_rx,
            in_flight: 0,
        })
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.context
    }

    /// Jobs submitted whose completion has not been received yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_shutting_down(&self) -> bool {
        self.context.shutting_down.load(Ordering::Acquire)
    }

    pub fn submit(&mut self, job: Job) {
        let name = job.name();
        let context = Arc::clone(&self.context);
        let tx = self.completions_tx.clone();
        tracing::debug!(job = name, "Submitting job");

        let handle = self.runtime.spawn_blocking(move || job.run(&context));
        self.runtime.spawn(async move {
            let completion = match handle.await {
                Ok(completion) => completion,
                Err(e) => Completion::Failed {
                    job: name,
                    error: Error::JobFailed(name, e.to_string()),
                },
            };
            // the receiver is gone only while the processor is dropped
            let _ = tx.send(completion);
        });
        self.in_flight += 1;
    }

    /// Runs a point lookup over `chunks`, newest last, on a worker.
    pub fn lookup(&self, chunks: Vec<Chunk>, key: Vec<u8>) -> LookupHandle {
        let (tx, rx) = oneshot::channel();
        self.runtime.spawn_blocking(move || {
            let _ = tx.send(lookup_chunks(&chunks, &key));
        });
        LookupHandle::Pending(rx)
    }

    /// A completion if one is ready.
    pub fn try_completion(&mut self) -> Option<Completion> {
        let completion = self.completions_rx.try_recv().ok()?;
        self.in_flight -= 1;
        Some(completion)
    }

    /// Blocks until the next completion. `None` if no job is in flight.
    pub fn wait_completion(&mut self) -> Option<Completion> {
        if self.in_flight == 0 {
            return None;
        }
        let completion = self.completions_rx.blocking_recv()?;
        self.in_flight -= 1;
        Some(completion)
    }

    /// Signals running jobs to stop and waits for the workers to exit.
    pub fn shutdown(self, timeout: Duration) {
        self.context.shutting_down.store(true, Ordering::Release);
        self.runtime.shutdown_timeout(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::types::LogPosition;

    fn processor(dir: &std::path::Path) -> Result<JobProcessor> {
        let config = StorageConfig::new(dir)
            .page_granularity(512)
            .data_page_size(1024)
            .max_key_size(32);
        let params = ChunkParams::from_config(&config);
        std::fs::create_dir_all(&params.chunk_dir)?;
        JobProcessor::new(
            2,
            JobContext {
                params,
                cache: PageCache::new(1 << 20),
                shutting_down: Arc::new(AtomicBool::new(false)),
            },
        )
    }

    fn memo(chunk_id: ChunkId) -> Result<Arc<MemoChunk>> {
        let mut memo = MemoChunk::new(chunk_id);
        for i in 0..100u32 {
            memo.set(format!("{:03}", i).as_bytes(), &i.to_be_bytes())?;
        }
        memo.register_log_command(LogPosition::new(1, 100));
        Ok(Arc::new(memo))
    }

    #[test]
    fn test_serialize_then_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut jobs = processor(dir.path())?;
        let memo = memo(4)?;

        jobs.submit(Job::Serialize {
            memo: Arc::clone(&memo),
            use_bloom_filter: true,
        });
        let chunk = match jobs.wait_completion() {
            Some(Completion::Serialized { chunk }) => chunk,
            other => panic!("unexpected completion {:?}", other),
        };
        assert!(memo.is_serialized());
        assert!(!chunk.is_written());
        assert_eq!(chunk.get(b"042")?, Some(Some(42u32.to_be_bytes().to_vec())));

        jobs.submit(Job::Write {
            chunk: Arc::clone(&chunk),
        });
        assert!(matches!(
            jobs.wait_completion(),
            Some(Completion::Written { chunk_id: 4 })
        ));
        assert!(!chunk.is_written());
        assert!(chunk.path().exists());
        chunk.mark_written()?;
        assert_eq!(chunk.get(b"042")?, Some(Some(42u32.to_be_bytes().to_vec())));
        assert_eq!(jobs.in_flight(), 0);
        assert!(jobs.wait_completion().is_none());
        jobs.shutdown(Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_failed_job_reports_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut jobs = processor(dir.path())?;
        let memo = memo(1)?;
        let missing = FileChunk::from_image(
            dir.path().join("no-such-dir").join("chunk"),
            serialize(&memo, &jobs.context().params, false, &AtomicBool::new(false))?,
            Arc::clone(&jobs.context().cache),
        );
        jobs.submit(Job::Write {
            chunk: Arc::new(missing),
        });
        match jobs.wait_completion() {
            Some(Completion::Failed { job, error }) => {
                assert_eq!(job, "write");
                assert!(error.is_fatal());
            }
            other => panic!("unexpected completion {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_lookup_runs_on_worker() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let jobs = processor(dir.path())?;
        let chunks = vec![Chunk::Memo(memo(1)?)];
        assert_eq!(
            jobs.lookup(chunks.clone(), b"007".to_vec()).wait()?,
            Some(7u32.to_be_bytes().to_vec())
        );
        assert_eq!(jobs.lookup(chunks, b"zzz".to_vec()).wait()?, None);
        assert_eq!(LookupHandle::Ready(None).wait()?, None);
        Ok(())
    }

    #[test]
    fn test_delete_chunks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut jobs = processor(dir.path())?;
        let path = jobs.context().params.chunk_path(9);
        std::fs::write(&path, b"x")?;
        jobs.submit(Job::DeleteChunks {
            chunks: vec![(9, path.clone()), (10, jobs.context().params.chunk_path(10))],
        });
        assert!(matches!(
            jobs.wait_completion(),
            Some(Completion::ChunksDeleted { ref chunk_ids }) if chunk_ids == &vec![9, 10]
        ));
        assert!(!path.exists());
        Ok(())
    }
}
