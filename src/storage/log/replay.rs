//! Reading log segments back during recovery.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use itertools::Itertools;

use super::record::{decode_records, LogRecord};
use super::segment::{parse_segment_file_name, SECTION_HEADER_SIZE, SEGMENT_HEADER_SIZE, SEGMENT_VERSION};
use crate::error::{Error, Result};
use crate::hasher;
use crate::storage::types::{LogPosition, TrackId};

/// A segment file found in the log directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub track_id: TrackId,
    pub segment_id: u64,
    pub path: PathBuf,
}

/// Every segment file in `dir`, ordered by track and segment id.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentFile>> {
    let mut segments = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(segments),
        Err(e) => return Err(Error::Read(dir.display().to_string(), e)),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some((track_id, segment_id)) = name.to_str().and_then(parse_segment_file_name) else {
            continue;
        };
        segments.push(SegmentFile {
            track_id,
            segment_id,
            path: entry.path(),
        });
    }
    segments.sort_by_key(|segment| (segment.track_id, segment.segment_id));
    Ok(segments)
}

/// Groups sorted segments by track, segment ids ascending within a track.
pub fn group_by_track(segments: Vec<SegmentFile>) -> BTreeMap<TrackId, Vec<SegmentFile>> {
    segments
        .into_iter()
        .chunk_by(|segment| segment.track_id)
        .into_iter()
        .map(|(track_id, group)| (track_id, group.collect()))
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    pub sections: usize,
    pub commands: usize,
    /// An interrupted commit was found at the end of the segment.
    pub torn_tail: bool,
    /// Bytes up to the end of the last complete section.
    pub valid_len: u64,
}

/// Calls `visit` for every committed command of a segment, in order.
///
/// A section that runs past the end of the file is an interrupted commit.
/// In the last segment of a track it ends the segment with a warning;
/// anywhere else, and for any checksum mismatch, it is corruption.
pub fn read_segment<F>(path: &Path, is_last: bool, mut visit: F) -> Result<SegmentSummary>
where
    F: FnMut(LogPosition, LogRecord) -> Result<()>,
{
    let file = File::open(path).map_err(|e| Error::Read(path.display().to_string(), e))?;
    let mut reader = BufReader::with_capacity(1 << 20, file);

    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    let got = read_full(&mut reader, &mut header).map_err(|e| Error::Read(path.display().to_string(), e))?;
    if got < SEGMENT_HEADER_SIZE {
        if is_last {
            tracing::warn!(path = %path.display(), "Log segment header incomplete, ignoring segment");
            return Ok(SegmentSummary {
                torn_tail: true,
                ..Default::default()
            });
        }
        return Err(Error::Corruption(format!("{} has no segment header", path.display())));
    }
    let version = LittleEndian::read_u32(&header[0..4]);
    let segment_id = LittleEndian::read_u64(&header[4..12]);
    if version != SEGMENT_VERSION {
        return Err(Error::InvalidHeader(format!(
            "{} has log version {}",
            path.display(),
            version
        )));
    }
    if let Some((_, expected)) = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(parse_segment_file_name)
    {
        if expected != segment_id {
            return Err(Error::Corruption(format!(
                "{} holds segment {}",
                path.display(),
                segment_id
            )));
        }
    }

    let mut summary = SegmentSummary::default();
    let mut command_id: u32 = 0;
    let mut offset = SEGMENT_HEADER_SIZE as u64;
    loop {
        let mut section_header = [0u8; SECTION_HEADER_SIZE];
        let got = read_full(&mut reader, &mut section_header)
            .map_err(|e| Error::Read(path.display().to_string(), e))?;
        if got == 0 {
            break;
        }

        let total_length = LittleEndian::read_u64(&section_header[0..8]);
        let payload_length = LittleEndian::read_u64(&section_header[8..16]);
        let checksum = LittleEndian::read_u32(&section_header[16..20]);
        let torn = got < SECTION_HEADER_SIZE || total_length == 0;
        if !torn && total_length != SECTION_HEADER_SIZE as u64 + payload_length {
            return Err(Error::Corruption(format!(
                "{}: section at {} declares {} bytes with a {} byte payload",
                path.display(),
                offset,
                total_length,
                payload_length
            )));
        }

        let mut payload = Vec::new();
        let complete = !torn && {
            let got = (&mut reader)
                .take(payload_length)
                .read_to_end(&mut payload)
                .map_err(|e| Error::Read(path.display().to_string(), e))?;
            got as u64 == payload_length
        };
        if !complete {
            if is_last {
                tracing::warn!(
                    path = %path.display(),
                    offset = offset,
                    "Ignoring interrupted commit at the end of the log"
                );
                summary.torn_tail = true;
                break;
            }
            return Err(Error::Corruption(format!(
                "{}: truncated section at {} in a sealed segment",
                path.display(),
                offset
            )));
        }

        if hasher::checksum(&payload) != checksum {
            tracing::error!(path = %path.display(), offset = offset, "Log section checksum mismatch");
            return Err(Error::ChecksumMismatch(format!(
                "log section at {} of {}",
                offset,
                path.display()
            )));
        }

        for record in decode_records(&payload)? {
            command_id += 1;
            visit(LogPosition::new(segment_id, command_id), record)?;
            summary.commands += 1;
        }
        summary.sections += 1;
        offset += total_length;
    }
    summary.valid_len = offset;
    Ok(summary)
}

/// Fills `buf` as far as the input allows and returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
