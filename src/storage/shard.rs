use std::collections::BTreeMap;
use std::sync::Arc;

use super::chunk::{Chunk, MemoChunk};
use super::types::{ChunkId, ContextId, LogPosition, ShardId, StorageType, TableId, TrackId};
use crate::error::{Error, Result};

/// Shards by `(context_id, shard_id)`.
pub type ShardMap = BTreeMap<(ContextId, ShardId), Shard>;

/// Identity and layout of a shard as persisted in the TOC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub context_id: ContextId,
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub track_id: TrackId,
    /// Inclusive lower bound.
    pub first_key: Vec<u8>,
    /// Exclusive upper bound, empty for unbounded.
    pub last_key: Vec<u8>,
    pub use_bloom_filter: bool,
    pub storage_type: StorageType,
}

impl ShardSpec {
    /// A shard covering every key, with bloom filters.
    pub fn new(context_id: ContextId, table_id: TableId, shard_id: ShardId, track_id: TrackId) -> Self {
        Self {
            context_id,
            table_id,
            shard_id,
            track_id,
            first_key: Vec::new(),
            last_key: Vec::new(),
            use_bloom_filter: true,
            storage_type: StorageType::Default,
        }
    }

    pub fn range(mut self, first_key: &[u8], last_key: &[u8]) -> Self {
        self.first_key = first_key.to_vec();
        self.last_key = last_key.to_vec();
        self
    }

    pub fn bloom_filter(mut self, enabled: bool) -> Self {
        self.use_bloom_filter = enabled;
        self
    }

    pub fn storage_type(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    pub fn key(&self) -> (ContextId, ShardId) {
        (self.context_id, self.shard_id)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.first_key.as_slice() && (self.last_key.is_empty() || key < self.last_key.as_slice())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.last_key.is_empty() && self.first_key >= self.last_key {
            return Err(Error::InvalidArgument(format!(
                "shard {} has an empty key range",
                self.shard_id
            )));
        }
        Ok(())
    }
}

/// A shard: the active memo chunk plus its chunk list, oldest first.
#[derive(Debug)]
pub struct Shard {
    spec: ShardSpec,
    memo: MemoChunk,
    chunks: Vec<Chunk>,
    /// Highest log position durable in the persisted chunks. Replay skips
    /// commands at or below it.
    recovery_position: LogPosition,
    /// Commands addressed to this shard id at or below this position were
    /// logged for an earlier shard with the same id.
    created_at: LogPosition,
}

impl Shard {
    pub fn new(spec: ShardSpec, memo_id: ChunkId) -> Self {
        Self {
            spec,
            memo: MemoChunk::new(memo_id),
            chunks: Vec::new(),
            recovery_position: LogPosition::default(),
            created_at: LogPosition::default(),
        }
    }

    /// Rebuilds a shard from the TOC; the watermark is derived from the
    /// chunk headers.
    pub fn with_chunks(spec: ShardSpec, memo_id: ChunkId, chunks: Vec<Chunk>) -> Self {
        let recovery_position = chunks
            .iter()
            .filter_map(Chunk::max_log_position)
            .max()
            .unwrap_or_default();
        Self {
            spec,
            memo: MemoChunk::new(memo_id),
            chunks,
            recovery_position,
            created_at: LogPosition::default(),
        }
    }

    pub fn created_after(mut self, position: LogPosition) -> Self {
        self.created_at = position;
        self
    }

    pub fn spec(&self) -> &ShardSpec {
        &self.spec
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.spec.contains(key)
    }

    pub fn memo(&self) -> &MemoChunk {
        &self.memo
    }

    pub fn memo_mut(&mut self) -> &mut MemoChunk {
        &mut self.memo
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn recovery_position(&self) -> LogPosition {
        self.recovery_position
    }

    pub fn created_at(&self) -> LogPosition {
        self.created_at
    }

    /// Newest first: the memo chunk, then the chunk list backwards. A
    /// tombstone ends the search.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.memo.get(key) {
            return Ok(value.map(<[u8]>::to_vec));
        }
        for chunk in self.chunks.iter().rev() {
            if let Some(value) = chunk.get(key)? {
                return Ok(value);
            }
        }
        Ok(None)
    }

    /// Swaps in a fresh memo chunk and appends the old one to the chunk
    /// list. The frozen chunk is never mutated again.
    pub fn freeze_memo(&mut self, memo_id: ChunkId) -> Arc<MemoChunk> {
        let frozen = Arc::new(std::mem::replace(&mut self.memo, MemoChunk::new(memo_id)));
        self.chunks.push(Chunk::Memo(Arc::clone(&frozen)));
        frozen
    }

    /// Drops the smallest keys of the memo chunk until it fits in `limit`
    /// bytes. Log-type shards use this instead of serialization.
    pub fn trim_memo(&mut self, limit: usize) -> Result<usize> {
        let mut removed = 0;
        while self.memo.get_size() > limit && self.memo.remove_first()? {
            removed += 1;
        }
        Ok(removed)
    }

    /// Replaces chunk `chunk_id` in place, e.g. a frozen memo chunk by its
    /// serialized file chunk. Returns false if the shard does not hold it.
    pub fn replace_chunk(&mut self, chunk_id: ChunkId, chunk: Chunk) -> bool {
        match self.chunks.iter_mut().find(|c| c.id() == chunk_id) {
            Some(slot) => {
                *slot = chunk;
                true
            }
            None => false,
        }
    }

    /// Replaces the merged inputs by the merge output. The inputs must still
    /// be the oldest chunks of the shard.
    pub fn replace_merged(&mut self, inputs: &[ChunkId], merged: Chunk) -> bool {
        let prefix: Vec<ChunkId> = self.chunks.iter().take(inputs.len()).map(Chunk::id).collect();
        if prefix != inputs {
            return false;
        }
        self.chunks.splice(..inputs.len(), std::iter::once(merged));
        true
    }

    /// Written chunks at the head of the list. Only these are recorded in
    /// the TOC: a written chunk newer than an unwritten one must not raise
    /// the watermark past commands that are not durable yet.
    pub fn persisted_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().take_while(|chunk| chunk.is_written())
    }

    pub fn persisted_chunk_ids(&self) -> Vec<ChunkId> {
        self.persisted_chunks().map(Chunk::id).collect()
    }

    /// Whether log segment `segment_id` of the shard's track still holds
    /// commands that are only in memory.
    pub fn is_backing_log_segment(&self, segment_id: u64) -> bool {
        let persisted = self.persisted_chunks().count();
        let pending_min = self.chunks[persisted..]
            .iter()
            .filter_map(Chunk::min_log_segment_id)
            .chain(self.memo.min_log_segment_id())
            .min();
        pending_min.is_some_and(|min| min <= segment_id)
    }

    /// Written chunks at the head of the list, as merge candidates.
    pub fn mergeable_prefix(&self, limit: usize) -> Vec<Chunk> {
        self.persisted_chunks().take(limit).cloned().collect()
    }

    /// Moves `[split_key, last_key)` into a new shard. Both shards keep
    /// referencing the same chunks; merges later drop the keys each shard
    /// no longer covers.
    pub fn split(&mut self, split_key: &[u8], new_shard_id: ShardId, memo_id: ChunkId) -> Result<Shard> {
        if !self.contains(split_key) || split_key == self.spec.first_key.as_slice() {
            return Err(Error::InvalidArgument(format!(
                "split key is not inside shard {}",
                self.spec.shard_id
            )));
        }
        let upper_memo = self.memo.split_off(split_key, memo_id)?;

        let mut spec = self.spec.clone();
        spec.shard_id = new_shard_id;
        spec.first_key = split_key.to_vec();
        self.spec.last_key = split_key.to_vec();

        Ok(Shard {
            spec,
            memo: upper_memo,
            chunks: self.chunks.clone(),
            recovery_position: self.recovery_position,
            created_at: self.created_at,
        })
    }

    /// Midpoint key of the largest file chunk, for split decisions.
    pub fn midpoint(&self) -> Option<Vec<u8>> {
        self.chunks
            .iter()
            .filter_map(Chunk::as_file)
            .filter(|file| file.num_keys() > 0)
            .max_by_key(|file| file.header().file_size())
            .map(|file| file.midpoint().to_vec())
    }

    /// Approximate bytes held by the shard.
    pub fn size(&self) -> u64 {
        self.memo.get_size() as u64 + self.chunks.iter().map(Chunk::size).sum::<u64>()
    }

    pub fn references(&self, chunk_id: ChunkId) -> bool {
        self.memo.chunk_id() == chunk_id || self.chunks.iter().any(|chunk| chunk.id() == chunk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_contains() {
        let spec = ShardSpec::new(1, 1, 1, 1).range(b"b", b"m");
        assert!(spec.contains(b"b"));
        assert!(spec.contains(b"lzzz"));
        assert!(!spec.contains(b"m"));
        assert!(!spec.contains(b"a"));

        let open = ShardSpec::new(1, 1, 1, 1).range(b"m", b"");
        assert!(open.contains(b"\xff\xff"));
        assert!(ShardSpec::new(1, 1, 1, 1).range(b"m", b"a").validate().is_err());
    }

    #[test]
    fn test_get_prefers_newest() -> Result<()> {
        let mut shard = Shard::new(ShardSpec::new(1, 1, 1, 1), 1);
        shard.memo_mut().set(b"a", b"old")?;
        shard.memo_mut().set(b"b", b"old")?;
        shard.freeze_memo(2);
        shard.memo_mut().set(b"a", b"new")?;
        shard.memo_mut().delete(b"b")?;

        assert_eq!(shard.get(b"a")?, Some(b"new".to_vec()));
        assert_eq!(shard.get(b"b")?, None);
        assert_eq!(shard.chunks().len(), 1);
        assert_eq!(shard.memo().chunk_id(), 2);
        Ok(())
    }

    #[test]
    fn test_backing_log_segment() -> Result<()> {
        let mut shard = Shard::new(ShardSpec::new(1, 1, 1, 1), 1);
        assert!(!shard.is_backing_log_segment(1));

        shard.memo_mut().register_log_command(LogPosition::new(3, 1));
        shard.freeze_memo(2);
        shard.memo_mut().register_log_command(LogPosition::new(5, 1));
        assert!(shard.is_backing_log_segment(3));
        assert!(shard.is_backing_log_segment(4));
        assert!(!shard.is_backing_log_segment(2));
        Ok(())
    }

    #[test]
    fn test_trim_memo_drops_smallest_keys() -> Result<()> {
        let spec = ShardSpec::new(1, 1, 1, 1).storage_type(StorageType::Log);
        let mut shard = Shard::new(spec, 1);
        for key in ["d", "a", "c", "b"] {
            shard.memo_mut().set(key.as_bytes(), &[0u8; 100])?;
        }
        let limit = shard.memo().get_size() / 2;
        let removed = shard.trim_memo(limit)?;
        assert!(removed >= 2);
        assert!(shard.memo().get_size() <= limit);
        assert_eq!(shard.memo().last_key(), Some(&b"d"[..]));
        assert_eq!(shard.memo().get(b"a"), None);
        Ok(())
    }

    #[test]
    fn test_replace_merged_requires_prefix() {
        let mut shard = Shard::new(ShardSpec::new(1, 1, 1, 1), 10);
        for id in [11, 12, 13] {
            shard.memo_mut().register_log_command(LogPosition::new(1, id as u32));
            shard.freeze_memo(id);
        }
        let ids: Vec<ChunkId> = shard.chunks().iter().map(Chunk::id).collect();
        assert_eq!(ids, vec![10, 11, 12]);

        let merged = Chunk::Memo(Arc::new(MemoChunk::new(20)));
        assert!(!shard.replace_merged(&[11, 12], merged.clone()));
        assert!(shard.replace_merged(&[10, 11], merged));
        let ids: Vec<ChunkId> = shard.chunks().iter().map(Chunk::id).collect();
        assert_eq!(ids, vec![20, 12]);
        assert!(shard.references(13));
    }

    #[test]
    fn test_split() -> Result<()> {
        let mut shard = Shard::new(ShardSpec::new(1, 7, 1, 3).range(b"a", b"z"), 1);
        for key in ["b", "k", "p", "x"] {
            shard.memo_mut().set(key.as_bytes(), b"v")?;
        }
        shard.freeze_memo(2);
        shard.memo_mut().set(b"q", b"v")?;

        let upper = shard.split(b"p", 2, 3)?;
        assert_eq!(shard.spec().last_key, b"p");
        assert_eq!(upper.spec().first_key, b"p");
        assert_eq!(upper.spec().last_key, b"z");
        assert_eq!(upper.spec().track_id, 3);
        assert_eq!(upper.spec().table_id, 7);
        assert_eq!(upper.memo().get(b"q"), Some(Some(&b"v"[..])));
        assert_eq!(shard.memo().get(b"q"), None);
        assert_eq!(upper.chunks().len(), 1);
        assert!(shard.split(b"a", 9, 9).is_err());
        assert!(shard.split(b"zz", 9, 9).is_err());
        Ok(())
    }
}
