use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{round_up, seal, truncated, verify, PAGE_PREFIX_SIZE};
use crate::error::{Error, Result};
use crate::storage::types::{ChunkId, LogPosition};

pub const HEADER_VERSION: u32 = 1;

const HEADER_TEXT_SIZE: usize = 64;
const HEADER_TEXT: &[u8] = b"chunkstore file chunk";

/// Fixed fields of the header page, including the optional bloom location.
const FIXED_SIZE: usize = PAGE_PREFIX_SIZE + 4 + HEADER_TEXT_SIZE + 8 + 8 + 8 + 4 + 1 + 8 + 8 + 4 + 8 + 4;

/// Size reserved for the header page. It is fixed per configuration so the
/// placeholder written first has exactly the size of the final header.
pub fn header_page_size(max_key_size: usize, granularity: usize) -> usize {
    round_up(FIXED_SIZE + 3 * (2 + max_key_size), granularity)
}

/// The first page of a file chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderPage {
    pub chunk_id: ChunkId,
    pub min_log_segment_id: u64,
    pub max_log_segment_id: u64,
    pub max_log_command_id: u32,
    pub use_bloom_filter: bool,
    pub num_keys: u64,
    pub index_page_offset: u64,
    pub index_page_size: u32,
    pub bloom_page_offset: u64,
    pub bloom_page_size: u32,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
    pub midpoint: Vec<u8>,
}

impl HeaderPage {
    /// Highest log command captured by the chunk.
    pub fn max_log_position(&self) -> LogPosition {
        LogPosition::new(self.max_log_segment_id, self.max_log_command_id)
    }

    /// Total bytes of the chunk file.
    pub fn file_size(&self) -> u64 {
        if self.use_bloom_filter {
            self.bloom_page_offset + u64::from(self.bloom_page_size)
        } else {
            self.index_page_offset + u64::from(self.index_page_size)
        }
    }

    pub fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(page_size);
        buf.resize(PAGE_PREFIX_SIZE, 0);
        buf.write_u32::<LittleEndian>(HEADER_VERSION)?;
        let mut text = [0u8; HEADER_TEXT_SIZE];
        text[..HEADER_TEXT.len()].copy_from_slice(HEADER_TEXT);
        buf.extend_from_slice(&text);
        buf.write_u64::<LittleEndian>(self.chunk_id)?;
        buf.write_u64::<LittleEndian>(self.min_log_segment_id)?;
        buf.write_u64::<LittleEndian>(self.max_log_segment_id)?;
        buf.write_u32::<LittleEndian>(self.max_log_command_id)?;
        buf.write_u8(u8::from(self.use_bloom_filter))?;
        buf.write_u64::<LittleEndian>(self.num_keys)?;
        buf.write_u64::<LittleEndian>(self.index_page_offset)?;
        buf.write_u32::<LittleEndian>(self.index_page_size)?;
        if self.use_bloom_filter {
            buf.write_u64::<LittleEndian>(self.bloom_page_offset)?;
            buf.write_u32::<LittleEndian>(self.bloom_page_size)?;
        }
        for key in [&self.first_key, &self.last_key, &self.midpoint] {
            let len = u16::try_from(key.len()).map_err(|_| {
                Error::InvalidArgument(format!("header key of {} bytes", key.len()))
            })?;
            buf.write_u16::<LittleEndian>(len)?;
            buf.extend_from_slice(key);
        }
        seal(buf, page_size)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let size = verify(buf, "header page")?;
        let mut cursor = Cursor::new(&buf[PAGE_PREFIX_SIZE..size]);
        let err = truncated("header page");

        let version = cursor.read_u32::<LittleEndian>().map_err(&err)?;
        if version != HEADER_VERSION {
            return Err(Error::InvalidHeader(format!(
                "unsupported chunk version {}",
                version
            )));
        }
        let mut text = [0u8; HEADER_TEXT_SIZE];
        cursor.read_exact(&mut text).map_err(&err)?;
        if !text.starts_with(HEADER_TEXT) {
            return Err(Error::InvalidHeader("not a chunk file".into()));
        }

        let mut header = HeaderPage {
            chunk_id: cursor.read_u64::<LittleEndian>().map_err(&err)?,
            min_log_segment_id: cursor.read_u64::<LittleEndian>().map_err(&err)?,
            max_log_segment_id: cursor.read_u64::<LittleEndian>().map_err(&err)?,
            max_log_command_id: cursor.read_u32::<LittleEndian>().map_err(&err)?,
            use_bloom_filter: cursor.read_u8().map_err(&err)? != 0,
            num_keys: cursor.read_u64::<LittleEndian>().map_err(&err)?,
            index_page_offset: cursor.read_u64::<LittleEndian>().map_err(&err)?,
            index_page_size: cursor.read_u32::<LittleEndian>().map_err(&err)?,
            ..Default::default()
        };
        if header.use_bloom_filter {
            header.bloom_page_offset = cursor.read_u64::<LittleEndian>().map_err(&err)?;
            header.bloom_page_size = cursor.read_u32::<LittleEndian>().map_err(&err)?;
        }
        for key in [
            &mut header.first_key,
            &mut header.last_key,
            &mut header.midpoint,
        ] {
            let len = cursor.read_u16::<LittleEndian>().map_err(&err)? as usize;
            key.resize(len, 0);
            cursor.read_exact(key).map_err(&err)?;
        }
        Ok(header)
    }
}
