//! Log segment writer.
//!
//! A segment file starts with `version:u32, segment_id:u64` and is followed
//! by sections. Appended commands are buffered; a commit frames the buffer
//! as one section `total_length:u64, uncompressed_length:u64, checksum:u32,
//! records` and writes it in `write_granularity` pieces, fsyncing every
//! `sync_granularity` bytes and once at the end.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use super::record::RecordEncoder;
use crate::disk;
use crate::error::{Error, Result};
use crate::hasher;
use crate::storage::types::{ContextId, LogPosition, ShardId, TrackId};

pub const SEGMENT_VERSION: u32 = 1;
pub const SEGMENT_HEADER_SIZE: usize = 12;
pub const SECTION_HEADER_SIZE: usize = 20;

const SEGMENT_FILE_PREFIX: &str = "log.";

pub fn segment_file_name(track_id: TrackId, segment_id: u64) -> String {
    format!("{}{:020}.{:020}", SEGMENT_FILE_PREFIX, track_id, segment_id)
}

pub fn parse_segment_file_name(name: &str) -> Option<(TrackId, u64)> {
    let rest = name.strip_prefix(SEGMENT_FILE_PREFIX)?;
    let (track, segment) = rest.split_once('.')?;
    if track.len() != 20 || segment.len() != 20 {
        return None;
    }
    Some((track.parse().ok()?, segment.parse().ok()?))
}

/// Frames a section around `payload`.
pub(crate) fn encode_section_header(payload: &[u8]) -> Result<[u8; SECTION_HEADER_SIZE]> {
    let mut header = [0u8; SECTION_HEADER_SIZE];
    let mut cursor = &mut header[..];
    cursor.write_u64::<LittleEndian>((SECTION_HEADER_SIZE + payload.len()) as u64)?;
    cursor.write_u64::<LittleEndian>(payload.len() as u64)?;
    cursor.write_u32::<LittleEndian>(hasher::checksum(payload))?;
    Ok(header)
}

#[derive(Debug, Clone, Copy)]
struct UndoPoint {
    buffer_len: usize,
    encoder: RecordEncoder,
}

/// The open segment of one track.
#[derive(Debug)]
pub struct LogSegment {
    track_id: TrackId,
    segment_id: u64,
    path: PathBuf,
    file: Arc<File>,
    /// End of the data handed to commits so far.
    offset: u64,
    buffer: Vec<u8>,
    encoder: RecordEncoder,
    next_command_id: u32,
    buffered_commands: usize,
    undo: Option<UndoPoint>,
    write_granularity: usize,
    sync_granularity: usize,
}

impl LogSegment {
    /// Creates a new segment file and makes its header durable.
    pub fn create(
        dir: &Path,
        track_id: TrackId,
        segment_id: u64,
        write_granularity: usize,
        sync_granularity: usize,
    ) -> Result<Self> {
        let path = dir.join(segment_file_name(track_id, segment_id));
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| log_write_failed(&path, 0, e))?;

        let mut header = [0u8; SEGMENT_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], SEGMENT_VERSION);
        LittleEndian::write_u64(&mut header[4..12], segment_id);
        file.write_all(&header)
            .and_then(|()| file.sync_all())
            .map_err(|e| log_write_failed(&path, 0, e))?;
        disk::sync_dir(dir).map_err(|e| log_write_failed(dir, 0, e))?;

        tracing::debug!(track_id = track_id, segment_id = segment_id, "Created log segment");
        Ok(Self {
            track_id,
            segment_id,
            path,
            file: Arc::new(file),
            offset: SEGMENT_HEADER_SIZE as u64,
            buffer: Vec::new(),
            encoder: RecordEncoder::default(),
            next_command_id: 1,
            buffered_commands: 0,
            undo: None,
            write_granularity: write_granularity.max(1),
            sync_granularity: sync_granularity.max(1),
        })
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Segment size including commands that are not committed yet.
    pub fn size(&self) -> u64 {
        let pending = if self.buffer.is_empty() {
            0
        } else {
            SECTION_HEADER_SIZE + self.buffer.len()
        };
        self.offset + pending as u64
    }

    /// Whether commands are waiting for a commit.
    pub fn is_dirty(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn last_position(&self) -> LogPosition {
        LogPosition::new(self.segment_id, self.next_command_id - 1)
    }

    pub fn buffered_commands(&self) -> usize {
        self.buffered_commands
    }

    pub fn append_set(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        key: &[u8],
        value: &[u8],
    ) -> Result<LogPosition> {
        self.append(context_id, shard_id, key, Some(value))
    }

    pub fn append_delete(&mut self, context_id: ContextId, shard_id: ShardId, key: &[u8]) -> Result<LogPosition> {
        self.append(context_id, shard_id, key, None)
    }

    fn append(
        &mut self,
        context_id: ContextId,
        shard_id: ShardId,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<LogPosition> {
        let undo = UndoPoint {
            buffer_len: self.buffer.len(),
            encoder: self.encoder,
        };
        if let Err(e) = self
            .encoder
            .encode(&mut self.buffer, context_id, shard_id, key, value)
        {
            self.buffer.truncate(undo.buffer_len);
            self.encoder = undo.encoder;
            return Err(e);
        }
        self.undo = Some(undo);
        self.buffered_commands += 1;

        let position = LogPosition::new(self.segment_id, self.next_command_id);
        self.next_command_id += 1;
        Ok(position)
    }

    /// Removes the most recent uncommitted command. Returns false if there
    /// is none.
    pub fn undo(&mut self) -> bool {
        let Some(undo) = self.undo.take() else {
            return false;
        };
        self.buffer.truncate(undo.buffer_len);
        self.encoder = undo.encoder;
        self.buffered_commands -= 1;
        self.next_command_id -= 1;
        true
    }

    /// Frames the buffered commands as a section and hands them out for
    /// writing. Returns `None` when nothing is buffered.
    pub fn prepare_commit(&mut self) -> Result<Option<PendingCommit>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let payload = std::mem::take(&mut self.buffer);
        let header = encode_section_header(&payload)?;
        let mut bytes = Vec::with_capacity(SECTION_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&payload);

        let pending = PendingCommit {
            track_id: self.track_id,
            segment_id: self.segment_id,
            path: self.path.clone(),
            file: Arc::clone(&self.file),
            offset: self.offset,
            bytes,
            commands: self.buffered_commands,
            write_granularity: self.write_granularity,
            sync_granularity: self.sync_granularity,
        };

        self.offset += pending.bytes.len() as u64;
        self.encoder.reset();
        self.undo = None;
        self.buffered_commands = 0;
        Ok(Some(pending))
    }

    /// Writes and fsyncs the buffered commands on the calling thread.
    pub fn commit(&mut self) -> Result<()> {
        match self.prepare_commit()? {
            Some(pending) => pending.write(),
            None => Ok(()),
        }
    }
}

/// A framed section waiting to be written, detached from its segment so a
/// worker can write it.
#[derive(Debug)]
pub struct PendingCommit {
    pub track_id: TrackId,
    pub segment_id: u64,
    path: PathBuf,
    file: Arc<File>,
    offset: u64,
    bytes: Vec<u8>,
    commands: usize,
    write_granularity: usize,
    sync_granularity: usize,
}

impl PendingCommit {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn commands(&self) -> usize {
        self.commands
    }

    pub fn write(&self) -> Result<()> {
        let mut written = 0;
        let mut unsynced = 0;
        for piece in self.bytes.chunks(self.write_granularity) {
            let offset = self.offset + written as u64;
            self.file
                .write_all_at(piece, offset)
                .map_err(|e| log_write_failed(&self.path, offset, e))?;
            written += piece.len();
            unsynced += piece.len();
            if unsynced >= self.sync_granularity && written < self.bytes.len() {
                self.sync(offset)?;
                unsynced = 0;
            }
        }
        self.sync(self.offset)?;

        tracing::trace!(
            track_id = self.track_id,
            segment_id = self.segment_id,
            commands = self.commands,
            bytes = self.bytes.len(),
            "Committed log section"
        );
        Ok(())
    }

    fn sync(&self, offset: u64) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| log_write_failed(&self.path, offset, e))
    }
}

fn log_write_failed(path: &Path, offset: u64, error: std::io::Error) -> Error {
    tracing::error!(
        path = %path.display(),
        offset = offset,
        free_disk_space = ?disk::free_space(path),
        error = %error,
        "Failed to write log segment"
    );
    Error::Write(path.display().to_string(), error)
}
