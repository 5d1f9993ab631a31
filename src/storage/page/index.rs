use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{round_up, seal, truncated, verify, PAGE_PREFIX_SIZE};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// File offset of the data page.
    pub offset: u64,
    /// First key stored in the data page.
    pub key: Vec<u8>,
}

/// Sparse index over a chunk's data pages, one entry per page, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPage {
    entries: Vec<IndexEntry>,
    key_bytes: usize,
}

impl IndexPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: u64, key: Vec<u8>) {
        self.key_bytes += key.len();
        self.entries.push(IndexEntry { offset, key });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Finds the data page that may contain `key`: the last page whose first
    /// key is not greater than `key`.
    pub fn locate(&self, key: &[u8]) -> Option<usize> {
        match self.entries.binary_search_by(|entry| entry.key.as_slice().cmp(key)) {
            Ok(pos) => Some(pos),
            Err(0) => None,
            Err(pos) => Some(pos - 1),
        }
    }

    /// Page a forward scan starting at `key` begins with. Unlike `locate`,
    /// a key before the first page still maps to page 0.
    pub fn seek(&self, key: &[u8]) -> usize {
        self.locate(key).unwrap_or(0)
    }

    /// Byte range `(offset, len)` of data page `page`. The last page ends
    /// where the index page begins.
    pub fn extent(&self, page: usize, index_page_offset: u64) -> Result<(u64, usize)> {
        let start = self
            .entries
            .get(page)
            .ok_or_else(|| Error::InvalidArgument(format!("data page {} out of range", page)))?
            .offset;
        let end = self
            .entries
            .get(page + 1)
            .map(|entry| entry.offset)
            .unwrap_or(index_page_offset);
        if end <= start {
            return Err(Error::Corruption(format!(
                "data page {} has extent {}..{}",
                page, start, end
            )));
        }
        Ok((start, (end - start) as usize))
    }

    /// Key halfway through the page list, used for split decisions.
    pub fn midpoint(&self) -> Option<&[u8]> {
        self.entries
            .get(self.entries.len() / 2)
            .map(|entry| entry.key.as_slice())
    }

    pub fn memory_size(&self) -> usize {
        self.key_bytes + self.entries.len() * std::mem::size_of::<IndexEntry>()
    }

    pub fn encode(&self, granularity: usize) -> Result<Vec<u8>> {
        let raw_len = PAGE_PREFIX_SIZE + 4 + self.key_bytes + self.entries.len() * 10;
        let mut buf = Vec::with_capacity(round_up(raw_len, granularity));
        buf.resize(PAGE_PREFIX_SIZE, 0);
        buf.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            buf.write_u64::<LittleEndian>(entry.offset)?;
            buf.write_u16::<LittleEndian>(entry.key.len() as u16)?;
            buf.extend_from_slice(&entry.key);
        }
        let padded = round_up(buf.len(), granularity);
        seal(buf, padded)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let size = verify(buf, "index page")?;
        let mut cursor = Cursor::new(&buf[PAGE_PREFIX_SIZE..size]);
        let err = truncated("index page");

        let num_keys = cursor.read_u32::<LittleEndian>().map_err(&err)? as usize;
        let mut page = IndexPage {
            entries: Vec::with_capacity(num_keys),
            key_bytes: 0,
        };
        for _ in 0..num_keys {
            let offset = cursor.read_u64::<LittleEndian>().map_err(&err)?;
            let len = cursor.read_u16::<LittleEndian>().map_err(&err)? as usize;
            let mut key = vec![0u8; len];
            cursor.read_exact(&mut key).map_err(&err)?;
            if let Some(prev) = page.entries.last() {
                if prev.key >= key || prev.offset >= offset {
                    return Err(Error::Corruption("index page entries out of order".into()));
                }
            }
            page.push(offset, key);
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IndexPage {
        let mut index = IndexPage::new();
        index.push(4096, b"b".to_vec());
        index.push(8192, b"f".to_vec());
        index.push(16384, b"m".to_vec());
        index
    }

    #[test]
    fn test_locate() {
        let index = sample();
        assert_eq!(index.locate(b"a"), None);
        assert_eq!(index.locate(b"b"), Some(0));
        assert_eq!(index.locate(b"c"), Some(0));
        assert_eq!(index.locate(b"f"), Some(1));
        assert_eq!(index.locate(b"zzz"), Some(2));
        assert_eq!(index.seek(b"a"), 0);
    }

    #[test]
    fn test_extent() -> Result<()> {
        let index = sample();
        assert_eq!(index.extent(0, 20480)?, (4096, 4096));
        assert_eq!(index.extent(1, 20480)?, (8192, 8192));
        assert_eq!(index.extent(2, 20480)?, (16384, 4096));
        assert!(index.extent(3, 20480).is_err());
        Ok(())
    }

    #[test]
    fn test_encode_decode() -> Result<()> {
        let index = sample();
        let buf = index.encode(512)?;
        assert_eq!(buf.len() % 512, 0);
        assert_eq!(IndexPage::decode(&buf)?, index);
        assert_eq!(index.midpoint(), Some(&b"f"[..]));
        Ok(())
    }

    #[test]
    fn test_empty_index() -> Result<()> {
        let index = IndexPage::new();
        let decoded = IndexPage::decode(&index.encode(512)?)?;
        assert!(decoded.is_empty());
        assert_eq!(decoded.midpoint(), None);
        assert_eq!(decoded.locate(b"x"), None);
        Ok(())
    }

    #[test]
    fn test_unsorted_entries_are_corruption() -> Result<()> {
        let mut index = IndexPage::new();
        index.push(4096, b"m".to_vec());
        index.push(8192, b"b".to_vec());
        let buf = index.encode(512)?;
        assert!(matches!(IndexPage::decode(&buf), Err(Error::Corruption(_))));
        Ok(())
    }
}
