//! On-disk page formats of a file chunk.
//!
//! Every page starts with `size:u32, checksum:u32` where `size` is the padded
//! length of the page and the CRC-32C checksum covers bytes `[8..size)`. All
//! integers are little-endian. A file chunk is laid out as
//!
//! ```text
//! +--------------------+  offset 0
//! | Header Page        |  fixed size, rewritten last
//! +--------------------+
//! | Data Page 0        |
//! | ...                |
//! | Data Page N        |
//! +--------------------+  index_page_offset
//! | Index Page         |
//! +--------------------+  bloom_page_offset
//! | Bloom Page (opt.)  |
//! +--------------------+
//! ```
//!
//! The index page has one entry per data page: the page's first key and its
//! file offset. The extent of data page `i` runs to the offset of page `i+1`,
//! the last data page ends where the index page begins.

pub mod bloom;
pub mod data;
pub mod header;
pub mod index;

use std::io;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::hasher;

pub use bloom::BloomPage;
pub use data::{DataPage, DataPageBuilder};
pub use header::HeaderPage;
pub use index::{IndexEntry, IndexPage};

/// Length of the `size` and `checksum` prefix shared by every page.
pub const PAGE_PREFIX_SIZE: usize = 8;

/// Cache page index of a chunk's index page. Data pages use their position.
pub const INDEX_PAGE: u32 = u32::MAX;

/// Cache page index of a chunk's bloom page.
pub const BLOOM_PAGE: u32 = u32::MAX - 1;

pub fn round_up(len: usize, granularity: usize) -> usize {
    len.div_ceil(granularity) * granularity
}

/// Pads `buf` with zeros to `padded_len` and stamps the size and checksum.
pub(crate) fn seal(mut buf: Vec<u8>, padded_len: usize) -> Result<Vec<u8>> {
    if buf.len() > padded_len || padded_len > u32::MAX as usize {
        return Err(Error::InvalidState(format!(
            "page of {} bytes does not fit {} bytes",
            buf.len(),
            padded_len
        )));
    }
    buf.resize(padded_len, 0);
    LittleEndian::write_u32(&mut buf[0..4], padded_len as u32);
    let crc = hasher::checksum(&buf[PAGE_PREFIX_SIZE..]);
    LittleEndian::write_u32(&mut buf[4..8], crc);
    Ok(buf)
}

/// Checks the size and checksum prefix and returns the page size.
pub(crate) fn verify(buf: &[u8], what: &str) -> Result<usize> {
    if buf.len() < PAGE_PREFIX_SIZE {
        return Err(Error::Corruption(format!("{} shorter than its prefix", what)));
    }
    let size = LittleEndian::read_u32(&buf[0..4]) as usize;
    if size < PAGE_PREFIX_SIZE || size > buf.len() {
        return Err(Error::Corruption(format!(
            "{} declares size {} but {} bytes are available",
            what,
            size,
            buf.len()
        )));
    }
    let stored = LittleEndian::read_u32(&buf[4..8]);
    if hasher::checksum(&buf[PAGE_PREFIX_SIZE..size]) != stored {
        return Err(Error::ChecksumMismatch(what.to_string()));
    }
    Ok(size)
}

/// A truncated field inside a page whose checksum matched.
pub(crate) fn truncated(what: &'static str) -> impl Fn(io::Error) -> Error {
    move |e| Error::Corruption(format!("{}: {}", what, e))
}

/// A decoded page as held by the page cache.
#[derive(Debug)]
pub enum Page {
    Data(DataPage),
    Index(IndexPage),
    Bloom(BloomPage),
}

impl Page {
    /// Bytes charged against the cache capacity.
    pub fn memory_size(&self) -> usize {
        match self {
            Page::Data(page) => page.memory_size(),
            Page::Index(page) => page.memory_size(),
            Page::Bloom(page) => page.memory_size(),
        }
    }

    /// Gives up the backing buffer so the cache can recycle it.
    pub fn into_buffer(self) -> Vec<u8> {
        match self {
            Page::Data(page) => page.into_buffer(),
            Page::Index(_) => Vec::new(),
            Page::Bloom(page) => page.into_buffer(),
        }
    }

    pub fn as_data(&self) -> Result<&DataPage> {
        match self {
            Page::Data(page) => Ok(page),
            _ => Err(Error::InvalidState("expected a data page".into())),
        }
    }

    pub fn as_index(&self) -> Result<&IndexPage> {
        match self {
            Page::Index(page) => Ok(page),
            _ => Err(Error::InvalidState("expected an index page".into())),
        }
    }

    pub fn as_bloom(&self) -> Result<&BloomPage> {
        match self {
            Page::Bloom(page) => Ok(page),
            _ => Err(Error::InvalidState("expected a bloom page".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn test_seal_and_verify() -> Result<()> {
        let mut buf = vec![0u8; PAGE_PREFIX_SIZE];
        buf.extend_from_slice(b"payload");
        let page = seal(buf, 512)?;
        assert_eq!(page.len(), 512);
        assert_eq!(verify(&page, "test page")?, 512);
        Ok(())
    }

    #[test]
    fn test_verify_detects_flipped_byte() -> Result<()> {
        let mut buf = vec![0u8; PAGE_PREFIX_SIZE];
        buf.extend_from_slice(b"payload");
        let mut page = seal(buf, 512)?;
        page[10] ^= 0xff;
        assert!(matches!(
            verify(&page, "test page"),
            Err(Error::ChecksumMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_verify_rejects_bad_size() {
        let mut page = vec![0u8; 64];
        LittleEndian::write_u32(&mut page[0..4], 128);
        assert!(matches!(verify(&page, "short"), Err(Error::Corruption(_))));
        assert!(matches!(verify(&page[..4], "tiny"), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_seal_rejects_oversized() {
        let buf = vec![0u8; 600];
        assert!(seal(buf, 512).is_err());
    }
}
