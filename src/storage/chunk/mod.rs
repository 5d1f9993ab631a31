//! Chunks: the memo chunk (mutable, in memory) and the file chunk
//! (immutable, on disk). A shard owns one active memo chunk and an ordered
//! list of [`Chunk`]s, oldest first.

pub mod arena;
pub mod file;
pub mod memo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use file::{ChunkImage, FileChunk};
pub use memo::MemoChunk;

use super::page::header::header_page_size;
use super::types::{ChunkId, LogPosition};
use crate::config::StorageConfig;
use crate::error::Result;

pub const CHUNK_DIR: &str = "chunks";

const CHUNK_FILE_PREFIX: &str = "chunk.";

pub fn chunk_file_name(chunk_id: ChunkId) -> String {
    format!("{}{:020}", CHUNK_FILE_PREFIX, chunk_id)
}

pub fn parse_chunk_file_name(name: &str) -> Option<ChunkId> {
    let digits = name.strip_prefix(CHUNK_FILE_PREFIX)?;
    if digits.len() != 20 {
        return None;
    }
    digits.parse().ok()
}

/// Layout parameters every serializer, writer and merger agrees on.
#[derive(Debug, Clone)]
pub struct ChunkParams {
    pub chunk_dir: PathBuf,
    pub data_page_size: usize,
    pub page_granularity: usize,
    pub header_page_size: usize,
}

impl ChunkParams {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            chunk_dir: config.dir.join(CHUNK_DIR),
            data_page_size: config.data_page_size,
            page_granularity: config.page_granularity,
            header_page_size: header_page_size(config.max_key_size, config.page_granularity),
        }
    }

    pub fn chunk_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.chunk_dir.join(chunk_file_name(chunk_id))
    }
}

#[derive(Debug, Clone)]
pub enum Chunk {
    /// A frozen memo chunk waiting for serialization.
    Memo(Arc<MemoChunk>),
    File(Arc<FileChunk>),
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        match self {
            Chunk::Memo(memo) => memo.chunk_id(),
            Chunk::File(file) => file.id(),
        }
    }

    /// `Some(None)` is a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        match self {
            Chunk::Memo(memo) => Ok(memo.get(key).map(|value| value.map(<[u8]>::to_vec))),
            Chunk::File(file) => file.get(key),
        }
    }

    /// Whether the chunk's contents are durable in a chunk file.
    pub fn is_written(&self) -> bool {
        match self {
            Chunk::Memo(_) => false,
            Chunk::File(file) => file.is_written(),
        }
    }

    pub fn as_file(&self) -> Option<&Arc<FileChunk>> {
        match self {
            Chunk::File(file) => Some(file),
            Chunk::Memo(_) => None,
        }
    }

    pub fn max_log_position(&self) -> Option<LogPosition> {
        match self {
            Chunk::Memo(memo) => memo.max_log_position(),
            Chunk::File(file) => {
                let position = file.header().max_log_position();
                (position != LogPosition::default()).then_some(position)
            }
        }
    }

    pub fn min_log_segment_id(&self) -> Option<u64> {
        match self {
            Chunk::Memo(memo) => memo.min_log_segment_id(),
            Chunk::File(file) => {
                let header = file.header();
                (header.max_log_segment_id != 0).then_some(header.min_log_segment_id)
            }
        }
    }

    pub fn num_keys(&self) -> u64 {
        match self {
            Chunk::Memo(memo) => memo.len() as u64,
            Chunk::File(file) => file.header().num_keys,
        }
    }

    /// Approximate bytes of data held by the chunk.
    pub fn size(&self) -> u64 {
        match self {
            Chunk::Memo(memo) => memo.get_size() as u64,
            Chunk::File(file) => file.header().file_size(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.as_file().map(|file| file.path())
    }
}
