//! Sequential record reader over a file chunk.
//!
//! Data pages are loaded one at a time through the page cache and released
//! as soon as the reader moves past them. After each page the cache is asked
//! to shed unreferenced pages so a long scan or merge does not fill it.

use std::sync::Arc;

use super::cache::PageHandle;
use super::chunk::FileChunk;
use super::page::INDEX_PAGE;
use super::types::Entry;
use crate::error::Result;

pub struct ChunkReader {
    chunk: Arc<FileChunk>,
    num_pages: usize,
    page: usize,
    current: Option<PageHandle>,
    pos: usize,
    /// Key the first loaded page is positioned at.
    seek: Option<Vec<u8>>,
    /// Exclusive upper bound, empty for none.
    upper: Vec<u8>,
    done: bool,
}

impl ChunkReader {
    /// Reads every record with `lower <= key < upper`. An empty `upper`
    /// reads to the end of the chunk.
    pub fn new(chunk: Arc<FileChunk>, lower: &[u8], upper: &[u8]) -> Result<Self> {
        let (num_pages, page) = if chunk.num_keys() == 0 {
            (0, 0)
        } else {
            let index = chunk.load_page(INDEX_PAGE)?;
            let index = index.as_index()?;
            (index.len(), index.seek(lower))
        };
        let done = !upper.is_empty() && lower >= upper;
        Ok(Self {
            chunk,
            num_pages,
            page,
            current: None,
            pos: 0,
            seek: (!lower.is_empty()).then(|| lower.to_vec()),
            upper: upper.to_vec(),
            done,
        })
    }

    /// Reads the whole chunk.
    pub fn full(chunk: Arc<FileChunk>) -> Result<Self> {
        Self::new(chunk, &[], &[])
    }

    pub fn chunk(&self) -> &Arc<FileChunk> {
        &self.chunk
    }

    fn advance(&mut self) -> Result<Option<Entry>> {
        loop {
            if self.current.is_none() {
                if self.page >= self.num_pages {
                    return Ok(None);
                }
                let handle = self.chunk.load_page(self.page as u32)?;
                self.pos = match self.seek.take() {
                    Some(key) => handle.as_data()?.lower_bound(&key),
                    None => 0,
                };
                self.current = Some(handle);
            }
            let Some(handle) = &self.current else {
                return Ok(None);
            };

            let data = handle.as_data()?;
            if self.pos < data.len() {
                let key = data.key(self.pos);
                if !self.upper.is_empty() && key >= self.upper.as_slice() {
                    return Ok(None);
                }
                let entry = (key.to_vec(), data.value(self.pos).map(<[u8]>::to_vec));
                self.pos += 1;
                return Ok(Some(entry));
            }

            self.current = None;
            self.page += 1;
            self.chunk.cache().try_unload_pages()?;
        }
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.advance().transpose();
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
            self.current = None;
        }
        next
    }
}
