//! Chunk writer.
//!
//! Pages reach disk in a fixed order: an all-zero placeholder header page,
//! the data pages, the index page, the bloom page, fsync, then the real
//! header page at offset 0 and a second fsync. A crash at any point leaves
//! either a complete chunk or a file whose header size is zero, which
//! recovery recognizes as incomplete.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::disk;
use crate::error::{Error, Result};
use crate::storage::chunk::ChunkImage;
use crate::storage::page::HeaderPage;

/// Which part of a chunk a page image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Data,
    Index,
    Bloom,
}

/// Destination of the pages produced by a chunk builder.
pub trait PageSink {
    /// Pages arrive in file order; `offset` is where the page starts.
    fn write_page(&mut self, kind: PageKind, offset: u64, page: Vec<u8>) -> Result<()>;

    /// Called once, after every other page.
    fn write_header(&mut self, header: &HeaderPage, page: Vec<u8>) -> Result<()>;
}

/// Streams a chunk to disk with the two-phase header write.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    pending_header: Option<Vec<u8>>,
}

impl FileSink {
    /// Creates the chunk file and writes the zeroed placeholder header.
    pub fn create(path: &Path, header_page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .map_err(|e| write_failed(path, 0, e))?;
        let mut sink = Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(256 * 1024, file),
            offset: 0,
            pending_header: None,
        };
        sink.append(&vec![0u8; header_page_size])?;
        Ok(sink)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn append(&mut self, page: &[u8]) -> Result<()> {
        self.writer
            .write_all(page)
            .map_err(|e| write_failed(&self.path, self.offset, e))?;
        self.offset += page.len() as u64;
        Ok(())
    }

    /// Fsyncs the pages, then writes the header at offset 0 and fsyncs again.
    pub fn finalize(mut self, header_page: &[u8]) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| write_failed(&self.path, self.offset, e))?;
        let file = self.writer.get_ref();
        file.sync_all()
            .map_err(|e| write_failed(&self.path, self.offset, e))?;

        file.write_all_at(header_page, 0)
            .map_err(|e| write_failed(&self.path, 0, e))?;
        file.sync_all().map_err(|e| write_failed(&self.path, 0, e))?;

        if let Some(dir) = self.path.parent() {
            disk::sync_dir(dir).map_err(|e| write_failed(dir, 0, e))?;
        }
        Ok(())
    }

    /// Finalizes with the header page handed over by the chunk builder.
    pub fn complete(mut self) -> Result<()> {
        let header = self
            .pending_header
            .take()
            .ok_or_else(|| Error::InvalidState("chunk header was never built".into()))?;
        self.finalize(&header)
    }
}

impl PageSink for FileSink {
    fn write_page(&mut self, _kind: PageKind, offset: u64, page: Vec<u8>) -> Result<()> {
        if offset != self.offset {
            return Err(Error::InvalidState(format!(
                "page for offset {} written at {}",
                offset, self.offset
            )));
        }
        self.append(&page)
    }

    fn write_header(&mut self, _header: &HeaderPage, page: Vec<u8>) -> Result<()> {
        // the header is written by finalize once the pages are durable
        self.pending_header = Some(page);
        Ok(())
    }
}

fn write_failed(path: &Path, offset: u64, error: std::io::Error) -> Error {
    tracing::error!(
        path = %path.display(),
        offset = offset,
        free_disk_space = ?disk::free_space(path),
        error = %error,
        "Failed to write chunk file"
    );
    Error::Write(path.display().to_string(), error)
}

/// Writes serialized page images to `path`.
pub fn write_image(path: &Path, image: &ChunkImage, shutting_down: &AtomicBool) -> Result<()> {
    let mut sink = FileSink::create(path, image.header_page.len())?;
    for page in &image.data_pages {
        if shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        sink.append(page)?;
    }
    if sink.offset() != image.header.index_page_offset {
        return Err(Error::InvalidState(format!(
            "index page of chunk {} expected at {}, data ends at {}",
            image.header.chunk_id,
            image.header.index_page_offset,
            sink.offset()
        )));
    }
    sink.append(&image.index_page)?;
    if let Some(bloom) = &image.bloom_page {
        sink.append(bloom)?;
    }
    sink.finalize(&image.header_page)?;

    tracing::debug!(
        chunk_id = image.header.chunk_id,
        num_keys = image.header.num_keys,
        size = image.header.file_size(),
        "Wrote chunk file"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom};
    use std::sync::Arc;

    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::cache::PageCache;
    use crate::storage::chunk::{ChunkParams, FileChunk, MemoChunk};
    use crate::storage::serializer::serialize;

    fn params(dir: &Path) -> ChunkParams {
        let config = StorageConfig::new(dir)
            .page_granularity(512)
            .data_page_size(2048)
            .max_key_size(64);
        let params = ChunkParams::from_config(&config);
        std::fs::create_dir_all(&params.chunk_dir).unwrap();
        params
    }

    fn image(params: &ChunkParams, chunk_id: u64, n: usize) -> Result<ChunkImage> {
        let mut memo = MemoChunk::new(chunk_id);
        for i in 0..n {
            memo.set(format!("k{:04}", i).as_bytes(), &vec![i as u8; 40])?;
        }
        memo.delete(b"k0007")?;
        serialize(&memo, params, true, &AtomicBool::new(false))
    }

    #[test]
    fn test_write_and_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let params = params(dir.path());
        let image = image(&params, 3, 300)?;
        let header = image.header.clone();
        let path = params.chunk_path(3);
        write_image(&path, &image, &AtomicBool::new(false))?;

        assert_eq!(std::fs::metadata(&path)?.len(), header.file_size());
        let chunk = FileChunk::open(&path, 3, PageCache::new(1 << 20))?;
        assert!(chunk.is_written());
        assert_eq!(chunk.header(), &header);
        assert_eq!(chunk.num_data_pages()?, image.data_pages.len());
        assert_eq!(chunk.get(b"k0123")?, Some(Some(vec![123u8; 40])));
        assert_eq!(chunk.get(b"k0007")?, Some(None));
        assert_eq!(chunk.get(b"k9999")?, None);
        Ok(())
    }

    #[test]
    fn test_mark_written_switches_to_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let params = params(dir.path());
        let cache = PageCache::new(1 << 20);
        let path = params.chunk_path(4);
        let chunk = FileChunk::from_image(path.clone(), image(&params, 4, 50)?, Arc::clone(&cache));

        let image = chunk.image()?.ok_or_else(|| Error::InvalidState("no image".into()))?;
        write_image(&path, &image, &AtomicBool::new(false))?;
        chunk.mark_written()?;
        assert!(chunk.image()?.is_none());
        assert_eq!(chunk.get(b"k0042")?, Some(Some(vec![42u8; 40])));
        assert!(cache.stats()?.pages > 0);
        Ok(())
    }

    #[test]
    fn test_unfinished_chunk_is_incomplete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let params = params(dir.path());
        let path = params.chunk_path(5);
        let mut sink = FileSink::create(&path, params.header_page_size)?;
        sink.append(&[7u8; 512])?;
        drop(sink);

        let result = FileChunk::open(&path, 5, PageCache::new(1 << 20));
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
        Ok(())
    }

    #[test]
    fn test_corrupted_data_page_is_detected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let params = params(dir.path());
        let path = params.chunk_path(6);
        write_image(&path, &image(&params, 6, 20)?, &AtomicBool::new(false))?;

        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(params.header_page_size as u64 + 20))?;
        file.write_all(&[0xAB; 4])?;
        drop(file);

        let chunk = FileChunk::open(&path, 6, PageCache::new(1 << 20))?;
        assert!(matches!(chunk.get(b"k0001"), Err(Error::ChecksumMismatch(_))));
        Ok(())
    }

    #[test]
    fn test_wrong_chunk_id_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let params = params(dir.path());
        let path = params.chunk_path(7);
        write_image(&path, &image(&params, 7, 5)?, &AtomicBool::new(false))?;
        assert!(FileChunk::open(&path, 8, PageCache::new(1 << 20)).is_err());
        Ok(())
    }

    #[test]
    fn test_shutdown_aborts_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let params = params(dir.path());
        let path = params.chunk_path(8);
        let result = write_image(&path, &image(&params, 8, 5)?, &AtomicBool::new(true));
        assert!(matches!(result, Err(Error::ShuttingDown)));
        Ok(())
    }
}
