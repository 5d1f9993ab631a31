use std::fmt;

use crate::error::{Error, Result};

pub type ChunkId = u64;
pub type ContextId = u16;
pub type ShardId = u64;
pub type TableId = u64;
pub type TrackId = u64;

/// Record tag shared by data pages and log segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Set = 1,
    Delete = 2,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(RecordType::Set),
            2 => Ok(RecordType::Delete),
            other => Err(Error::Corruption(format!("unknown record type {}", other))),
        }
    }
}

/// Position of a command in a track's log. Segments are numbered from 1 and
/// command ids restart at 1 in every segment, so the derived ordering
/// (segment first) is the append order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition {
    pub segment_id: u64,
    pub command_id: u32,
}

impl LogPosition {
    pub fn new(segment_id: u64, command_id: u32) -> Self {
        Self {
            segment_id,
            command_id,
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.command_id)
    }
}

/// An owned record as produced by chunk readers. `None` is a tombstone.
pub type Entry = (Vec<u8>, Option<Vec<u8>>);

/// How a shard bounds the memory of its memo chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StorageType {
    /// Memo chunks are serialized into file chunks.
    #[default]
    Default = 0,
    /// Memo chunks are never serialized; the smallest keys are dropped instead.
    Log = 1,
}

impl TryFrom<u8> for StorageType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(StorageType::Default),
            1 => Ok(StorageType::Log),
            other => Err(Error::Corruption(format!("unknown storage type {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_position_order() {
        assert!(LogPosition::new(1, 9) < LogPosition::new(2, 1));
        assert!(LogPosition::new(2, 1) < LogPosition::new(2, 2));
        assert_eq!(LogPosition::default(), LogPosition::new(0, 0));
    }

    #[test]
    fn test_tags() {
        assert_eq!(RecordType::try_from(1).ok(), Some(RecordType::Set));
        assert!(RecordType::try_from(7).is_err());
        assert_eq!(StorageType::try_from(1).ok(), Some(StorageType::Log));
    }
}
