//! Table of contents: the durable shard to chunk mapping.
//!
//! ```text
//! size:u32 checksum:u32 version:u32 num_shards:u32
//! per shard:
//!   context_id:u16 table_id:u64 shard_id:u64 track_id:u64
//!   first_key_len:u16 first_key last_key_len:u16 last_key
//!   use_bloom_filter:u8 storage_type:u8
//!   created_segment_id:u64 created_command_id:u32
//!   num_chunks:u32 chunk_id:u64*
//! ```
//!
//! The checksum covers everything after it. A new TOC is written to
//! `toc.new`, fsynced and renamed over `toc`. Reading prefers `toc.new`: if
//! it is complete, the process stopped between the write and the rename.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use super::shard::{Shard, ShardSpec};
use super::types::{ChunkId, LogPosition, StorageType};
use crate::disk;
use crate::error::{Error, Result};
use crate::hasher;

pub const TOC_FILE: &str = "toc";
pub const TOC_NEW_FILE: &str = "toc.new";
pub const TOC_VERSION: u32 = 1;

const TOC_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocShard {
    pub spec: ShardSpec,
    /// Log position of the track when the shard was created.
    pub created_at: LogPosition,
    /// Oldest first.
    pub chunk_ids: Vec<ChunkId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toc {
    pub shards: Vec<TocShard>,
}

impl Toc {
    /// The TOC describing `shards`. Only the written prefix of each chunk
    /// list is recorded.
    pub fn from_shards<'a>(shards: impl IntoIterator<Item = &'a Shard>) -> Self {
        let shards = shards
            .into_iter()
            .map(|shard| TocShard {
                spec: shard.spec().clone(),
                created_at: shard.created_at(),
                chunk_ids: shard.persisted_chunk_ids(),
            })
            .collect();
        Self { shards }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 8];
        buf.write_u32::<LittleEndian>(TOC_VERSION)?;
        buf.write_u32::<LittleEndian>(self.shards.len() as u32)?;
        for shard in &self.shards {
            let spec = &shard.spec;
            buf.write_u16::<LittleEndian>(spec.context_id)?;
            buf.write_u64::<LittleEndian>(spec.table_id)?;
            buf.write_u64::<LittleEndian>(spec.shard_id)?;
            buf.write_u64::<LittleEndian>(spec.track_id)?;
            write_key(&mut buf, &spec.first_key)?;
            write_key(&mut buf, &spec.last_key)?;
            buf.write_u8(u8::from(spec.use_bloom_filter))?;
            buf.write_u8(spec.storage_type as u8)?;
            buf.write_u64::<LittleEndian>(shard.created_at.segment_id)?;
            buf.write_u32::<LittleEndian>(shard.created_at.command_id)?;
            buf.write_u32::<LittleEndian>(shard.chunk_ids.len() as u32)?;
            for chunk_id in &shard.chunk_ids {
                buf.write_u64::<LittleEndian>(*chunk_id)?;
            }
        }

        let size = u32::try_from(buf.len())
            .map_err(|_| Error::InvalidState(format!("TOC of {} bytes", buf.len())))?;
        LittleEndian::write_u32(&mut buf[0..4], size);
        let crc = hasher::checksum(&buf[8..]);
        LittleEndian::write_u32(&mut buf[4..8], crc);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TOC_HEADER_SIZE {
            return Err(Error::Corruption(format!("TOC of {} bytes", buf.len())));
        }
        let size = LittleEndian::read_u32(&buf[0..4]) as usize;
        if size != buf.len() {
            return Err(Error::Corruption(format!(
                "TOC declares {} bytes, file has {}",
                size,
                buf.len()
            )));
        }
        if hasher::checksum(&buf[8..]) != LittleEndian::read_u32(&buf[4..8]) {
            return Err(Error::ChecksumMismatch("TOC".into()));
        }

        let mut cursor = Cursor::new(&buf[8..]);
        let version = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        if version != TOC_VERSION {
            return Err(Error::InvalidHeader(format!("TOC version {}", version)));
        }
        let num_shards = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let mut shards = Vec::new();
        for _ in 0..num_shards {
            let context_id = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
            let table_id = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            let shard_id = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            let track_id = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            let first_key = read_key(&mut cursor)?;
            let last_key = read_key(&mut cursor)?;
            let use_bloom_filter = cursor.read_u8().map_err(truncated)? != 0;
            let storage_type = StorageType::try_from(cursor.read_u8().map_err(truncated)?)?;
            let created_at = LogPosition::new(
                cursor.read_u64::<LittleEndian>().map_err(truncated)?,
                cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            );
            let num_chunks = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
            let chunk_ids = (0..num_chunks)
                .map(|_| cursor.read_u64::<LittleEndian>().map_err(truncated))
                .collect::<Result<Vec<_>>>()?;
            shards.push(TocShard {
                spec: ShardSpec {
                    context_id,
                    table_id,
                    shard_id,
                    track_id,
                    first_key,
                    last_key,
                    use_bloom_filter,
                    storage_type,
                },
                created_at,
                chunk_ids,
            });
        }
        Ok(Self { shards })
    }

    /// Writes `toc.new`, fsyncs it, renames it to `toc` and fsyncs the
    /// directory.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let buf = self.encode()?;
        let new_path = dir.join(TOC_NEW_FILE);
        let path = dir.join(TOC_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&new_path)
            .map_err(|e| toc_write_failed(&new_path, e))?;
        file.write_all(&buf)
            .and_then(|()| file.sync_all())
            .map_err(|e| toc_write_failed(&new_path, e))?;
        drop(file);

        std::fs::rename(&new_path, &path).map_err(|e| toc_write_failed(&path, e))?;
        disk::sync_dir(dir).map_err(|e| toc_write_failed(dir, e))?;

        tracing::debug!(shards = self.shards.len(), bytes = buf.len(), "Wrote TOC");
        Ok(())
    }

    /// Reads the newest valid TOC. `Ok(None)` means the directory has none.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let new_path = dir.join(TOC_NEW_FILE);
        let path = dir.join(TOC_FILE);

        let mut new_failed = None;
        if let Some(buf) = read_file(&new_path)? {
            match Self::decode(&buf) {
                Ok(toc) => {
                    tracing::info!("Using TOC from an interrupted update");
                    return Ok(Some(toc));
                }
                Err(e) => {
                    tracing::warn!(path = %new_path.display(), error = %e, "Ignoring incomplete TOC");
                    new_failed = Some(e);
                }
            }
        }

        match read_file(&path)? {
            Some(buf) => Self::decode(&buf).map(Some).map_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "TOC is unreadable");
                e
            }),
            None => match new_failed {
                Some(e) => Err(e),
                None => Ok(None),
            },
        }
    }
}

fn write_key(buf: &mut Vec<u8>, key: &[u8]) -> Result<()> {
    let len = u16::try_from(key.len())
        .map_err(|_| Error::InvalidArgument(format!("shard key of {} bytes", key.len())))?;
    buf.write_u16::<LittleEndian>(len)?;
    buf.extend_from_slice(key);
    Ok(())
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u16::<LittleEndian>().map_err(truncated)? as usize;
    let mut key = vec![0u8; len];
    cursor.read_exact(&mut key).map_err(truncated)?;
    Ok(key)
}

fn truncated(e: io::Error) -> Error {
    Error::Corruption(format!("truncated TOC: {}", e))
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Read(path.display().to_string(), e)),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| Error::Read(path.display().to_string(), e))?;
    Ok(Some(buf))
}

fn toc_write_failed(path: &Path, error: io::Error) -> Error {
    tracing::error!(
        path = %path.display(),
        free_disk_space = ?disk::free_space(path),
        error = %error,
        "Failed to write TOC"
    );
    Error::Write(path.display().to_string(), error)
}
