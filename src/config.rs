use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the storage environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the TOC, chunk files and log segments
    pub dir: PathBuf,

    /// Memo chunk size that triggers serialization (default: 64MB)
    pub chunk_size: usize,

    /// Target size of a data page before a new one is started (default: 64KB)
    pub data_page_size: usize,

    /// Every page is padded to a multiple of this (default: 4KB)
    pub page_granularity: usize,

    /// Largest accepted key (default: 4KB)
    pub max_key_size: usize,

    /// Largest accepted value (default: 16MB)
    pub max_value_size: usize,

    /// Log segment size that triggers rotation (default: 64MB)
    pub log_segment_size: u64,

    /// Piece size used when writing a log section (default: 64KB)
    pub write_granularity: usize,

    /// Bytes written between intermediate fsyncs of a large commit (default: 16MB)
    pub sync_granularity: usize,

    /// Page cache capacity in bytes (default: 256MB)
    pub max_cache_size: usize,

    /// Merge configuration
    pub merge: MergeConfig,

    /// Number of background worker threads (default: 2)
    pub worker_threads: usize,

    /// Replayed records between opportunistic chunk writes during recovery
    pub replay_flush_interval: usize,

    /// Move unneeded log segments to `archive/` instead of deleting them
    pub archive_log: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Run background merges at all (default: true)
    pub enabled: bool,

    /// Written chunk count at which a shard is merged (default: 4)
    pub chunk_count_threshold: usize,

    /// Oldest chunks combined by one merge job (default: 2)
    pub batch_size: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_count_threshold: 4,
            batch_size: 2,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./chunkstore"),
            chunk_size: 64 * 1024 * 1024,        // 64MB
            data_page_size: 64 * 1024,           // 64KB
            page_granularity: 4 * 1024,          // 4KB
            max_key_size: 4 * 1024,              // 4KB
            max_value_size: 16 * 1024 * 1024,    // 16MB
            log_segment_size: 64 * 1024 * 1024,  // 64MB
            write_granularity: 64 * 1024,        // 64KB
            sync_granularity: 16 * 1024 * 1024,  // 16MB
            max_cache_size: 256 * 1024 * 1024,   // 256MB
            merge: MergeConfig::default(),
            worker_threads: 2,
            replay_flush_interval: 10_000,
            archive_log: false,
        }
    }
}

impl StorageConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the memo chunk serialization threshold
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the target data page size
    pub fn data_page_size(mut self, size: usize) -> Self {
        self.data_page_size = size;
        self
    }

    /// Set the page granularity
    pub fn page_granularity(mut self, size: usize) -> Self {
        self.page_granularity = size;
        self
    }

    /// Set the maximum key size
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.max_key_size = size;
        self
    }

    /// Set the maximum value size
    pub fn max_value_size(mut self, size: usize) -> Self {
        self.max_value_size = size;
        self
    }

    /// Set the log segment rotation threshold
    pub fn log_segment_size(mut self, size: u64) -> Self {
        self.log_segment_size = size;
        self
    }

    /// Set the log write and sync granularity
    pub fn log_granularity(mut self, write: usize, sync: usize) -> Self {
        self.write_granularity = write;
        self.sync_granularity = sync;
        self
    }

    /// Set the page cache capacity
    pub fn max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size;
        self
    }

    /// Configure merge settings
    pub fn merge(mut self, config: MergeConfig) -> Self {
        self.merge = config;
        self
    }

    /// Set the number of background workers
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set how many replayed records pass between opportunistic chunk writes
    pub fn replay_flush_interval(mut self, records: usize) -> Self {
        self.replay_flush_interval = records;
        self
    }

    /// Archive unneeded log segments instead of deleting them
    pub fn archive_log(mut self, enabled: bool) -> Self {
        self.archive_log = enabled;
        self
    }

    /// Checks the knobs the on-disk formats depend on.
    pub fn validate(&self) -> Result<()> {
        if !self.page_granularity.is_power_of_two() || self.page_granularity < 512 {
            return Err(Error::InvalidArgument(format!(
                "page_granularity must be a power of two >= 512, got {}",
                self.page_granularity
            )));
        }
        if self.data_page_size < self.page_granularity {
            return Err(Error::InvalidArgument(format!(
                "data_page_size {} is smaller than page_granularity {}",
                self.data_page_size, self.page_granularity
            )));
        }
        // key lengths are stored as u16 in index and data pages
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "max_key_size must be in 1..={}, got {}",
                u16::MAX,
                self.max_key_size
            )));
        }
        if self.max_value_size > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "max_value_size {} does not fit a u32 length",
                self.max_value_size
            )));
        }
        if self.write_granularity == 0 || self.sync_granularity == 0 {
            return Err(Error::InvalidArgument(
                "log write and sync granularity must be non-zero".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(Error::InvalidArgument("worker_threads must be non-zero".into()));
        }
        if self.merge.batch_size < 1 {
            return Err(Error::InvalidArgument("merge batch_size must be non-zero".into()));
        }
        Ok(())
    }
}

impl MergeConfig {
    /// Enable or disable background merges
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the written chunk count that triggers a merge
    pub fn chunk_count_threshold(mut self, count: usize) -> Self {
        self.chunk_count_threshold = count;
        self
    }

    /// Set how many of the oldest chunks one merge combines
    pub fn batch_size(mut self, count: usize) -> Self {
        self.batch_size = count;
        self
    }
}
