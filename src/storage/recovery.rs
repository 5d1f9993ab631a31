//! Crash restart.
//!
//! Rebuilds the shards from the TOC, replays every log track on top of the
//! recovered chunks and removes chunk files no shard references. Any
//! unreadable chunk header, TOC or log section stops recovery: there is no
//! partial mode.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::cache::PageCache;
use super::chunk::{parse_chunk_file_name, Chunk, ChunkParams, FileChunk};
use super::log::replay::{group_by_track, list_segments, read_segment};
use super::log::segment::SEGMENT_HEADER_SIZE;
use super::log::{Log, LogRecord};
use super::serializer::serialize;
use super::shard::{Shard, ShardMap};
use super::toc::Toc;
use super::types::{ChunkId, LogPosition, StorageType, TrackId};
use super::writer::write_image;
use crate::config::StorageConfig;
use crate::disk;
use crate::error::{Error, Result};

/// State handed to the environment after a successful recovery.
#[derive(Debug)]
pub struct Recovered {
    pub shards: ShardMap,
    /// Existing segments are registered as sealed; appends go to fresh
    /// segments.
    pub log: Log,
    pub next_chunk_id: ChunkId,
    pub summary: RecoverySummary,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    pub shards: usize,
    pub chunks: usize,
    pub segments: usize,
    pub applied: usize,
    pub skipped: usize,
    pub chunks_written: usize,
    pub orphans_deleted: usize,
    pub torn_tails: usize,
}

/// Recovers the environment in `config.dir`. The directory layout must
/// exist and be locked by the caller.
pub fn recover(config: &StorageConfig, cache: &Arc<PageCache>) -> Result<Recovered> {
    let params = ChunkParams::from_config(config);
    let toc = Toc::read(&config.dir)?;
    if toc.is_none() {
        tracing::info!(dir = %config.dir.display(), "No TOC found, starting empty");
    }
    let toc = toc.unwrap_or_default();

    let on_disk = list_chunk_files(&params.chunk_dir)?;
    let mut next_chunk_id = toc
        .shards
        .iter()
        .flat_map(|shard| shard.chunk_ids.iter().copied())
        .chain(on_disk.iter().map(|(chunk_id, _)| *chunk_id))
        .max()
        .map_or(1, |max| max + 1);

    let mut summary = RecoverySummary::default();
    let mut opened: HashMap<ChunkId, Arc<FileChunk>> = HashMap::new();
    let mut shards = ShardMap::new();
    for entry in toc.shards {
        let mut chunks = Vec::with_capacity(entry.chunk_ids.len());
        for chunk_id in &entry.chunk_ids {
            let chunk = match opened.entry(*chunk_id) {
                Entry::Occupied(e) => Arc::clone(e.get()),
                Entry::Vacant(e) => {
                    let path = params.chunk_path(*chunk_id);
                    let chunk = FileChunk::open(&path, *chunk_id, Arc::clone(cache))?;
                    Arc::clone(e.insert(Arc::new(chunk)))
                }
            };
            chunks.push(Chunk::File(chunk));
        }

        let key = entry.spec.key();
        let shard = Shard::with_chunks(entry.spec, next_chunk_id, chunks).created_after(entry.created_at);
        next_chunk_id += 1;
        tracing::debug!(
            context_id = key.0,
            shard_id = key.1,
            chunks = shard.chunks().len(),
            watermark = %shard.recovery_position(),
            "Recovered shard"
        );
        if shards.insert(key, shard).is_some() {
            return Err(Error::Corruption(format!(
                "TOC lists shard {}:{} twice",
                key.0, key.1
            )));
        }
    }
    summary.shards = shards.len();
    summary.chunks = opened.len();

    let mut log = Log::new(config);
    // Pruning may have removed every segment of a track. New segments must
    // still be numbered past what the chunks and the TOC already cover.
    for shard in shards.values() {
        let covered = shard.recovery_position().max(shard.created_at());
        log.note_segment(shard.spec().track_id, covered.segment_id);
    }
    let mut replayer = Replayer {
        params: &params,
        cache,
        chunk_size: config.chunk_size,
        flush_interval: config.replay_flush_interval.max(1),
        shards,
        next_chunk_id,
        summary,
        since_flush: 0,
    };
    for (track_id, segments) in group_by_track(list_segments(log.dir())?) {
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == last;
            let segment_summary = read_segment(&segment.path, is_last, |position, record| {
                replayer.apply(track_id, position, record)
            })?;
            replayer.summary.segments += 1;
            tracing::debug!(
                track_id = track_id,
                segment_id = segment.segment_id,
                sections = segment_summary.sections,
                commands = segment_summary.commands,
                "Replayed log segment"
            );

            if segment_summary.torn_tail {
                replayer.summary.torn_tails += 1;
                if segment_summary.valid_len < SEGMENT_HEADER_SIZE as u64 {
                    disk::remove_file_if_exists(&segment.path)
                        .map_err(|e| Error::Write(segment.path.display().to_string(), e))?;
                    continue;
                }
                truncate(&segment.path, segment_summary.valid_len)?;
            }
            log.add_sealed(track_id, segment.segment_id);
        }
    }
    replayer.try_write_chunks()?;

    let Replayer {
        shards,
        next_chunk_id,
        mut summary,
        ..
    } = replayer;

    Toc::from_shards(shards.values()).write(&config.dir)?;

    let referenced: HashSet<ChunkId> = shards
        .values()
        .flat_map(|shard| shard.chunks().iter().map(Chunk::id))
        .collect();
    for (chunk_id, path) in on_disk {
        if referenced.contains(&chunk_id) {
            continue;
        }
        disk::remove_file_if_exists(&path).map_err(|e| Error::Write(path.display().to_string(), e))?;
        tracing::info!(chunk_id = chunk_id, "Deleted unreferenced chunk file");
        summary.orphans_deleted += 1;
    }
    if summary.orphans_deleted > 0 {
        disk::sync_dir(&params.chunk_dir)?;
    }

    tracing::info!(
        shards = summary.shards,
        chunks = summary.chunks,
        segments = summary.segments,
        applied = summary.applied,
        skipped = summary.skipped,
        chunks_written = summary.chunks_written,
        orphans_deleted = summary.orphans_deleted,
        torn_tails = summary.torn_tails,
        next_chunk_id = next_chunk_id,
        "Recovery completed"
    );
    Ok(Recovered {
        shards,
        log,
        next_chunk_id,
        summary,
    })
}

struct Replayer<'a> {
    params: &'a ChunkParams,
    cache: &'a Arc<PageCache>,
    chunk_size: usize,
    flush_interval: usize,
    shards: ShardMap,
    next_chunk_id: ChunkId,
    summary: RecoverySummary,
    since_flush: usize,
}

impl Replayer<'_> {
    fn apply(&mut self, track_id: TrackId, position: LogPosition, record: LogRecord) -> Result<()> {
        let chunk_size = self.chunk_size;
        let Some(shard) = self.resolve(track_id, position, &record) else {
            self.summary.skipped += 1;
            return Ok(());
        };
        if position <= shard.recovery_position() {
            self.summary.skipped += 1;
            return Ok(());
        }

        let memo = shard.memo_mut();
        match &record.value {
            Some(value) => memo.set(&record.key, value)?,
            None => memo.delete(&record.key)?,
        }
        memo.register_log_command(position);
        if shard.spec().storage_type == StorageType::Log {
            shard.trim_memo(chunk_size)?;
        }

        self.summary.applied += 1;
        self.since_flush += 1;
        if self.since_flush >= self.flush_interval {
            self.since_flush = 0;
            self.try_write_chunks()?;
        }
        Ok(())
    }

    /// The shard a logged command belongs to now. A key that left the
    /// original shard's range moved to a split-off shard of the same table
    /// and track. Commands of a deleted shard whose id was reused resolve
    /// to nothing.
    fn resolve(&mut self, track_id: TrackId, position: LogPosition, record: &LogRecord) -> Option<&mut Shard> {
        let key = (record.context_id, record.shard_id);
        let (in_range, table_id) = {
            let shard = self.shards.get(&key)?;
            if shard.spec().track_id != track_id || position <= shard.created_at() {
                return None;
            }
            (shard.contains(&record.key), shard.spec().table_id)
        };
        if in_range {
            return self.shards.get_mut(&key);
        }
        self.shards.values_mut().find(|shard| {
            let spec = shard.spec();
            spec.context_id == record.context_id
                && spec.table_id == table_id
                && spec.track_id == track_id
                && spec.contains(&record.key)
        })
    }

    /// Writes every memo chunk that reached the chunk size, bounding memory
    /// during long replays.
    fn try_write_chunks(&mut self) -> Result<()> {
        let never = AtomicBool::new(false);
        for shard in self.shards.values_mut() {
            if shard.spec().storage_type != StorageType::Default
                || shard.memo().is_empty()
                || shard.memo().get_size() < self.chunk_size
            {
                continue;
            }
            let frozen = shard.freeze_memo(self.next_chunk_id);
            self.next_chunk_id += 1;

            let image = serialize(&frozen, self.params, shard.spec().use_bloom_filter, &never)?;
            let path = self.params.chunk_path(frozen.chunk_id());
            write_image(&path, &image, &never)?;
            let chunk = FileChunk::from_image(path, image, Arc::clone(self.cache));
            chunk.mark_written()?;
            shard.replace_chunk(frozen.chunk_id(), Chunk::File(Arc::new(chunk)));

            tracing::info!(
                chunk_id = frozen.chunk_id(),
                shard_id = shard.spec().shard_id,
                num_keys = frozen.len(),
                "Wrote chunk during replay"
            );
            self.summary.chunks_written += 1;
        }
        Ok(())
    }
}

/// Chunk files in `dir`, including incomplete ones.
fn list_chunk_files(dir: &Path) -> Result<Vec<(ChunkId, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Read(dir.display().to_string(), e)),
    };
    let mut chunks = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(chunk_id) = entry.file_name().to_str().and_then(parse_chunk_file_name) {
            chunks.push((chunk_id, entry.path()));
        }
    }
    chunks.sort();
    Ok(chunks)
}

/// Cuts an interrupted commit off the end of a segment so the segment
/// replays cleanly once it is no longer the newest of its track.
fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| Error::Write(path.display().to_string(), e))?;
    file.set_len(len)
        .and_then(|()| file.sync_all())
        .map_err(|e| Error::Write(path.display().to_string(), e))?;
    tracing::warn!(path = %path.display(), len = len, "Truncated interrupted log commit");
    Ok(())
}
