use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use super::arena::{Arena, ArenaHandle};
use crate::error::Result;
use crate::storage::types::{ChunkId, LogPosition};

/// Bookkeeping bytes charged per entry on top of key and value.
const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Clone, Copy)]
enum MemoValue {
    Set(ArenaHandle),
    Delete,
}

/// The mutable in-memory chunk of a shard.
///
/// Keys are ordered by raw byte comparison. Values are packed in an arena;
/// a `Delete` is kept as a tombstone because older chunks may still hold
/// the key. Only the control thread mutates a memo chunk; once it is frozen
/// into a shard's chunk list it is shared read-only.
#[derive(Debug)]
pub struct MemoChunk {
    chunk_id: ChunkId,
    entries: BTreeMap<Vec<u8>, MemoValue>,
    arena: Arena,
    min_log_segment_id: Option<u64>,
    max_log_position: Option<LogPosition>,
    size: usize,
    serialized: AtomicBool,
}

impl MemoChunk {
    pub fn new(chunk_id: ChunkId) -> Self {
        Self {
            chunk_id,
            entries: BTreeMap::new(),
            arena: Arena::new(),
            min_log_segment_id: None,
            max_log_position: None,
            size: 0,
            serialized: AtomicBool::new(false),
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// `Some(None)` is a tombstone, `None` means the chunk knows nothing
    /// about the key.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.entries.get(key).map(|value| self.resolve(value))
    }

    fn resolve(&self, value: &MemoValue) -> Option<&[u8]> {
        match value {
            MemoValue::Set(handle) => Some(self.arena.get(*handle).unwrap_or_default()),
            MemoValue::Delete => None,
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match self.entries.get(key).copied() {
            Some(MemoValue::Set(handle)) => {
                let old_len = self.arena.get(handle).map_or(0, <[u8]>::len);
                let handle = self.arena.overwrite(handle, value)?;
                self.size = self.size - old_len + value.len();
                self.entries.insert(key.to_vec(), MemoValue::Set(handle));
            }
            Some(MemoValue::Delete) => {
                let handle = self.arena.allocate(value)?;
                self.size += value.len();
                self.entries.insert(key.to_vec(), MemoValue::Set(handle));
            }
            None => {
                let handle = self.arena.allocate(value)?;
                self.size += key.len() + value.len() + ENTRY_OVERHEAD;
                self.entries.insert(key.to_vec(), MemoValue::Set(handle));
            }
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        match self.entries.get(key).copied() {
            Some(MemoValue::Set(handle)) => {
                let old_len = self.arena.get(handle).map_or(0, <[u8]>::len);
                self.arena.free(handle)?;
                self.size -= old_len;
                self.entries.insert(key.to_vec(), MemoValue::Delete);
            }
            Some(MemoValue::Delete) => {}
            None => {
                self.size += key.len() + ENTRY_OVERHEAD;
                self.entries.insert(key.to_vec(), MemoValue::Delete);
            }
        }
        Ok(())
    }

    /// Records that the command at `position` has been applied.
    pub fn register_log_command(&mut self, position: LogPosition) {
        self.min_log_segment_id = Some(
            self.min_log_segment_id
                .map_or(position.segment_id, |min| min.min(position.segment_id)),
        );
        self.max_log_position = Some(
            self.max_log_position
                .map_or(position, |max| max.max(position)),
        );
    }

    pub fn min_log_segment_id(&self) -> Option<u64> {
        self.min_log_segment_id
    }

    pub fn max_log_position(&self) -> Option<LogPosition> {
        self.max_log_position
    }

    /// Approximate memory footprint used for the serialization threshold.
    pub fn get_size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.entries.keys().next().map(Vec::as_slice)
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.entries.keys().next_back().map(Vec::as_slice)
    }

    /// Drops the smallest key. Used by log-type shards instead of
    /// serialization.
    pub fn remove_first(&mut self) -> Result<bool> {
        let Some((key, value)) = self.entries.pop_first() else {
            return Ok(false);
        };
        let value_len = match value {
            MemoValue::Set(handle) => {
                let len = self.arena.get(handle).map_or(0, <[u8]>::len);
                self.arena.free(handle)?;
                len
            }
            MemoValue::Delete => 0,
        };
        self.size = self
            .size
            .saturating_sub(key.len() + value_len + ENTRY_OVERHEAD);
        Ok(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_slice(), self.resolve(value)))
    }

    pub fn range<'a>(
        &'a self,
        lower: Bound<&'a [u8]>,
        upper: Bound<&'a [u8]>,
    ) -> impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)> + 'a {
        self.entries
            .range::<[u8], _>((lower, upper))
            .map(|(key, value)| (key.as_slice(), self.resolve(value)))
    }

    /// Moves every entry at or above `key` into a new memo chunk. Both
    /// chunks keep the log range, it is only used as a conservative bound.
    pub fn split_off(&mut self, key: &[u8], chunk_id: ChunkId) -> Result<MemoChunk> {
        let moved = self.entries.split_off(key);
        let mut upper = MemoChunk::new(chunk_id);
        upper.min_log_segment_id = self.min_log_segment_id;
        upper.max_log_position = self.max_log_position;

        for (key, value) in moved {
            match value {
                MemoValue::Set(handle) => {
                    let data = self.arena.get(handle).unwrap_or_default();
                    let len = data.len();
                    upper.set(&key, data)?;
                    self.arena.free(handle)?;
                    self.size = self.size.saturating_sub(key.len() + len + ENTRY_OVERHEAD);
                }
                MemoValue::Delete => {
                    upper.delete(&key)?;
                    self.size = self.size.saturating_sub(key.len() + ENTRY_OVERHEAD);
                }
            }
        }
        Ok(upper)
    }

    pub fn mark_serialized(&self) {
        self.serialized.store(true, Ordering::Release);
    }

    pub fn is_serialized(&self) -> bool {
        self.serialized.load(Ordering::Acquire)
    }
}
