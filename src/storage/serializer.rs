//! Turns a frozen memo chunk into file chunk page images.
//!
//! [`ChunkBuilder`] is shared with the merger: it packs sorted records into
//! data pages, builds the index page in lock-step, feeds the bloom filter and
//! finally produces the header. Where the pages go is up to the
//! [`PageSink`]; the serializer keeps them in memory, the merger streams
//! them to a file.

use std::sync::atomic::{AtomicBool, Ordering};

use super::chunk::{ChunkImage, ChunkParams, MemoChunk};
use super::page::bloom::bloom_page_size;
use super::page::{BloomPage, DataPageBuilder, HeaderPage, IndexPage};
use super::types::{ChunkId, LogPosition};
use super::writer::{PageKind, PageSink};
use crate::error::{Error, Result};

/// Records processed between shutdown checks.
pub(crate) const SHUTDOWN_CHECK_INTERVAL: usize = 1024;

pub struct ChunkBuilder {
    chunk_id: ChunkId,
    data_page_size: usize,
    granularity: usize,
    header_page_size: usize,
    page: DataPageBuilder,
    index: IndexPage,
    bloom: Option<BloomPage>,
    offset: u64,
    num_keys: u64,
    first_key: Option<Vec<u8>>,
    last_key: Vec<u8>,
    min_log_segment_id: u64,
    max_log_position: LogPosition,
}

impl ChunkBuilder {
    /// `expected_keys` sizes the bloom filter; `None` builds no bloom page.
    pub fn new(chunk_id: ChunkId, params: &ChunkParams, expected_keys: Option<u64>) -> Self {
        Self {
            chunk_id,
            data_page_size: params.data_page_size,
            granularity: params.page_granularity,
            header_page_size: params.header_page_size,
            page: DataPageBuilder::new(),
            index: IndexPage::new(),
            bloom: expected_keys
                .map(|keys| BloomPage::with_size(bloom_page_size(keys, params.page_granularity))),
            offset: params.header_page_size as u64,
            num_keys: 0,
            first_key: None,
            last_key: Vec::new(),
            min_log_segment_id: 0,
            max_log_position: LogPosition::default(),
        }
    }

    pub fn set_log_range(&mut self, min_log_segment_id: u64, max_log_position: LogPosition) {
        self.min_log_segment_id = min_log_segment_id;
        self.max_log_position = max_log_position;
    }

    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }

    /// Appends a record; keys must be strictly ascending. `None` writes a
    /// tombstone.
    pub fn add<S: PageSink>(&mut self, sink: &mut S, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.first_key.is_some() && key <= self.last_key.as_slice() {
            return Err(Error::InvalidState(format!(
                "chunk {} keys out of order",
                self.chunk_id
            )));
        }
        if !self.page.is_empty()
            && self.page.encoded_len() + DataPageBuilder::record_len(key, value) > self.data_page_size
        {
            self.flush_page(sink)?;
        }

        self.page.add(key, value)?;
        if let Some(bloom) = self.bloom.as_mut() {
            bloom.add(key);
        }
        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_keys += 1;
        Ok(())
    }

    fn flush_page<S: PageSink>(&mut self, sink: &mut S) -> Result<()> {
        let (image, first_key) = self.page.finish(self.granularity)?;
        let len = image.len() as u64;
        self.index.push(self.offset, first_key);
        sink.write_page(PageKind::Data, self.offset, image)?;
        self.offset += len;
        Ok(())
    }

    /// Emits the last data page, the index and bloom pages and the header.
    pub fn finish<S: PageSink>(mut self, sink: &mut S) -> Result<HeaderPage> {
        if !self.page.is_empty() {
            self.flush_page(sink)?;
        }

        let index_page = self.index.encode(self.granularity)?;
        let index_page_offset = self.offset;
        let index_page_size = index_page.len();
        sink.write_page(PageKind::Index, index_page_offset, index_page)?;
        self.offset += index_page_size as u64;

        let (bloom_page_offset, bloom_page_size) = match self.bloom.take() {
            Some(bloom) => {
                let page = bloom.finish()?;
                let (offset, size) = (self.offset, page.len());
                sink.write_page(PageKind::Bloom, offset, page)?;
                self.offset += size as u64;
                (offset, size)
            }
            None => (0, 0),
        };

        let header = HeaderPage {
            chunk_id: self.chunk_id,
            min_log_segment_id: self.min_log_segment_id,
            max_log_segment_id: self.max_log_position.segment_id,
            max_log_command_id: self.max_log_position.command_id,
            use_bloom_filter: bloom_page_size > 0,
            num_keys: self.num_keys,
            index_page_offset,
            index_page_size: index_page_size as u32,
            bloom_page_offset,
            bloom_page_size: bloom_page_size as u32,
            first_key: self.first_key.take().unwrap_or_default(),
            midpoint: self.index.midpoint().map(<[u8]>::to_vec).unwrap_or_default(),
            last_key: std::mem::take(&mut self.last_key),
        };
        let header_page = header.encode(self.header_page_size)?;
        sink.write_header(&header, header_page)?;
        Ok(header)
    }
}

/// Collects page images in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    data_pages: Vec<Vec<u8>>,
    index_page: Vec<u8>,
    bloom_page: Option<Vec<u8>>,
    header: Option<(HeaderPage, Vec<u8>)>,
}

impl MemorySink {
    pub fn into_image(self) -> Result<ChunkImage> {
        let (header, header_page) = self
            .header
            .ok_or_else(|| Error::InvalidState("chunk header was never built".into()))?;
        ChunkImage::new(
            header,
            header_page,
            self.data_pages,
            self.index_page,
            self.bloom_page,
        )
    }
}

impl PageSink for MemorySink {
    fn write_page(&mut self, kind: PageKind, _offset: u64, page: Vec<u8>) -> Result<()> {
        match kind {
            PageKind::Data => self.data_pages.push(page),
            PageKind::Index => self.index_page = page,
            PageKind::Bloom => self.bloom_page = Some(page),
        }
        Ok(())
    }

    fn write_header(&mut self, header: &HeaderPage, page: Vec<u8>) -> Result<()> {
        self.header = Some((header.clone(), page));
        Ok(())
    }
}

/// Serializes a frozen memo chunk. Tombstones are kept: older chunks of the
/// shard may still hold the keys they delete.
pub fn serialize(
    memo: &MemoChunk,
    params: &ChunkParams,
    use_bloom_filter: bool,
    shutting_down: &AtomicBool,
) -> Result<ChunkImage> {
    let expected_keys = use_bloom_filter.then_some(memo.len() as u64);
    let mut builder = ChunkBuilder::new(memo.chunk_id(), params, expected_keys);
    if let (Some(min), Some(max)) = (memo.min_log_segment_id(), memo.max_log_position()) {
        builder.set_log_range(min, max);
    }

    let mut sink = MemorySink::default();
    for (i, (key, value)) in memo.iter().enumerate() {
        if i % SHUTDOWN_CHECK_INTERVAL == 0 && shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        builder.add(&mut sink, key, value)?;
    }
    let header = builder.finish(&mut sink)?;

    tracing::debug!(
        chunk_id = header.chunk_id,
        num_keys = header.num_keys,
        size = header.file_size(),
        "Serialized memo chunk"
    );
    sink.into_image()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::cache::PageCache;
    use crate::storage::chunk::FileChunk;
    use crate::storage::page::{DataPage, INDEX_PAGE};

    fn small_params() -> ChunkParams {
        let config = StorageConfig::new("/unused")
            .page_granularity(512)
            .data_page_size(1024)
            .max_key_size(64);
        ChunkParams::from_config(&config)
    }

    fn sample_memo(n: usize) -> Result<MemoChunk> {
        let mut memo = MemoChunk::new(5);
        for i in 0..n {
            memo.set(format!("key-{:05}", i).as_bytes(), format!("value-{}", i).as_bytes())?;
        }
        memo.delete(b"key-00003")?;
        memo.register_log_command(LogPosition::new(1, 1));
        memo.register_log_command(LogPosition::new(2, 40));
        Ok(memo)
    }

    #[test]
    fn test_serialize_layout() -> Result<()> {
        let params = small_params();
        let memo = sample_memo(200)?;
        let image = serialize(&memo, &params, true, &AtomicBool::new(false))?;

        let header = &image.header;
        assert_eq!(header.chunk_id, 5);
        assert_eq!(header.num_keys, 200);
        assert_eq!(header.first_key, b"key-00000");
        assert_eq!(header.last_key, b"key-00199");
        assert_eq!(header.min_log_segment_id, 1);
        assert_eq!(header.max_log_position(), LogPosition::new(2, 40));
        assert!(header.use_bloom_filter);
        assert!(image.data_pages.len() > 1);

        // pages are contiguous and granularity aligned
        let data_len: usize = image.data_pages.iter().map(Vec::len).sum();
        assert_eq!(
            header.index_page_offset,
            (params.header_page_size + data_len) as u64
        );
        assert_eq!(header.bloom_page_offset, header.index_page_offset + header.index_page_size as u64);
        for page in &image.data_pages {
            assert_eq!(page.len() % 512, 0);
            // only a page holding a single oversized record may exceed the target
            assert!(page.len() <= 1024 || DataPage::decode(page.clone())?.len() == 1);
        }

        let total: usize = image
            .data_pages
            .iter()
            .map(|page| DataPage::decode(page.clone()).map(|p| p.len()))
            .sum::<Result<usize>>()?;
        assert_eq!(total, 200);
        assert!(!header.midpoint.is_empty());
        Ok(())
    }

    #[test]
    fn test_serialized_chunk_is_readable_before_write() -> Result<()> {
        let params = small_params();
        let memo = sample_memo(100)?;
        let image = serialize(&memo, &params, true, &AtomicBool::new(false))?;
        let chunk = FileChunk::from_image(params.chunk_path(5), image, PageCache::new(1 << 20));

        assert!(!chunk.is_written());
        assert_eq!(chunk.get(b"key-00042")?, Some(Some(b"value-42".to_vec())));
        assert_eq!(chunk.get(b"key-00003")?, Some(None));
        assert_eq!(chunk.get(b"key-99999")?, None);
        assert_eq!(chunk.get(b"aaa")?, None);
        assert_eq!(
            chunk.load_page(INDEX_PAGE)?.as_index()?.len(),
            chunk.image()?.map_or(0, |image| image.data_pages.len())
        );
        Ok(())
    }

    #[test]
    fn test_serialized_data_page_decoded_once() -> Result<()> {
        let params = small_params();
        let memo = sample_memo(100)?;
        let image = serialize(&memo, &params, false, &AtomicBool::new(false))?;
        let cache = PageCache::new(1 << 20);
        let chunk = FileChunk::from_image(params.chunk_path(5), image, Arc::clone(&cache));

        let first = chunk.load_page(0)?;
        let second = chunk.load_page(0)?;
        assert!(std::ptr::eq(&*first, &*second));
        assert_eq!(chunk.get(b"key-00001")?, Some(Some(b"value-1".to_vec())));
        assert_eq!(cache.stats()?.size, 0);
        Ok(())
    }

    #[test]
    fn test_serialize_without_bloom() -> Result<()> {
        let params = small_params();
        let memo = sample_memo(10)?;
        let image = serialize(&memo, &params, false, &AtomicBool::new(false))?;
        assert!(!image.header.use_bloom_filter);
        assert!(image.bloom_page.is_none());
        assert_eq!(image.header.file_size(), image.header.index_page_offset + image.header.index_page_size as u64);
        Ok(())
    }

    #[test]
    fn test_empty_memo_serializes_to_empty_chunk() -> Result<()> {
        let params = small_params();
        let image = serialize(&MemoChunk::new(1), &params, true, &AtomicBool::new(false))?;
        assert_eq!(image.header.num_keys, 0);
        assert!(image.data_pages.is_empty());
        assert!(image.header.first_key.is_empty());
        Ok(())
    }

    #[test]
    fn test_shutdown_interrupts_serialization() -> Result<()> {
        let params = small_params();
        let memo = sample_memo(10)?;
        let result = serialize(&memo, &params, true, &AtomicBool::new(true));
        assert!(matches!(result, Err(Error::ShuttingDown)));
        Ok(())
    }

    #[test]
    fn test_builder_rejects_unsorted_keys() -> Result<()> {
        let params = small_params();
        let mut builder = ChunkBuilder::new(1, &params, None);
        let mut sink = MemorySink::default();
        builder.add(&mut sink, b"b", Some(b"1"))?;
        assert!(builder.add(&mut sink, b"a", Some(b"2")).is_err());
        assert!(builder.add(&mut sink, b"b", Some(b"2")).is_err());
        Ok(())
    }
}
