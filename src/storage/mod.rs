//! Chunk-based LSM storage engine.
//!
//! Data is partitioned into shards. Every shard owns one mutable memo chunk
//! and an ordered list of immutable chunks; each write is appended to the
//! log of the shard's track before it reaches the memo chunk.
//!
//! ```text
//!   set/delete                       get/scan
//!       │                               │
//!       ▼                               ▼
//! ┌────────────┐   freeze   ┌──────────────────────────────────┐
//! │ Memo Chunk │──────────► │ Chunk list (oldest first)        │
//! │  (arena)   │            │ Memo ─► Serialized ─► Written    │
//! └────────────┘            └──────────────────────────────────┘
//!       │                               │ merge (oldest prefix)
//!       ▼                               ▼
//! ┌────────────┐            ┌──────────────────────────────────┐
//! │ Log track  │            │ chunks/chunk.<id>                │
//! │ segments   │            │ header │ data… │ index │ bloom   │
//! └────────────┘            └──────────────────────────────────┘
//! ```
//!
//! # Write Path
//! 1. **Log append**: the command is buffered in the open segment of the
//!    shard's track
//! 2. **Memo update**: the memo chunk applies it and records its log position
//! 3. **Commit**: buffered commands are framed into one checksummed section
//!    and fsynced, synchronously or by a background job
//!
//! # Background Work
//! 1. **Serialize**: a memo chunk past the chunk size is frozen, replaced by
//!    a fresh one and turned into page images; it is readable from memory
//! 2. **Write**: the images are written with a placeholder header that is
//!    rewritten last, then the TOC lists the chunk
//! 3. **Merge**: the oldest written chunks of a shard are merged into one,
//!    newest value wins and tombstones are dropped
//! 4. **Prune**: log segments no shard depends on are deleted or archived
//!
//! # Read Path
//! The memo chunk first, then the chunk list newest first. Pages of file
//! chunks go through the shared [`cache::PageCache`].
//!
//! # Recovery
//! The TOC names each shard's written chunks. Their headers give the log
//! position up to which the shard is durable; replay applies only the
//! commands after it.

pub mod cache;
pub mod chunk;
pub mod cursor;
pub mod environment;
pub mod jobs;
pub mod log;
pub mod merger;
pub mod metrics;
pub mod page;
pub mod reader;
pub mod recovery;
pub mod serializer;
pub mod shard;
pub mod toc;
pub mod types;
pub mod writer;

pub use cache::{CacheStats, PageCache};
pub use chunk::{Chunk, FileChunk, MemoChunk};
pub use cursor::Cursor;
pub use environment::{ChunkInfo, Environment};
pub use jobs::LookupHandle;
pub use metrics::StorageMetrics;
pub use shard::ShardSpec;
pub use types::{ChunkId, ContextId, LogPosition, RecordType, ShardId, StorageType, TableId, TrackId};
