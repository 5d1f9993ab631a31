use std::fmt;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use byteorder::{ByteOrder, LittleEndian};

use crate::disk;
use crate::error::{Error, Result};
use crate::storage::cache::{PageCache, PageHandle};
use crate::storage::page::{
    BloomPage, DataPage, HeaderPage, IndexPage, Page, BLOOM_PAGE, INDEX_PAGE,
};
use crate::storage::types::{ChunkId, LogPosition};

/// Largest header page accepted when opening a chunk file.
const MAX_HEADER_PAGE_SIZE: usize = 1 << 20;

/// Serialized page images of a chunk that is not on disk yet.
#[derive(Debug)]
pub struct ChunkImage {
    pub header: HeaderPage,
    pub header_page: Vec<u8>,
    pub data_pages: Vec<Vec<u8>>,
    pub index_page: Vec<u8>,
    pub bloom_page: Option<Vec<u8>>,
    index: Arc<Page>,
    bloom: Option<Arc<Page>>,
    /// Data pages decoded on first lookup.
    data: Vec<OnceLock<Arc<Page>>>,
}

impl ChunkImage {
    pub fn new(
        header: HeaderPage,
        header_page: Vec<u8>,
        data_pages: Vec<Vec<u8>>,
        index_page: Vec<u8>,
        bloom_page: Option<Vec<u8>>,
    ) -> Result<Self> {
        let index = Arc::new(Page::Index(IndexPage::decode(&index_page)?));
        let bloom = match &bloom_page {
            Some(bloom) => Some(Arc::new(Page::Bloom(BloomPage::decode(bloom.clone())?))),
            None => None,
        };
        let data = data_pages.iter().map(|_| OnceLock::new()).collect();
        Ok(Self {
            header,
            header_page,
            data_pages,
            index_page,
            bloom_page,
            index,
            bloom,
            data,
        })
    }
}

enum ChunkState {
    /// Page images exist only in memory.
    Serialized(Arc<ChunkImage>),
    /// The chunk file is complete; pages load through the cache.
    Written(Arc<File>),
}

/// An immutable chunk made of a header page, data pages, an index page and
/// an optional bloom page.
///
/// The header is kept in memory for the chunk's lifetime. Every other page
/// is loaded on demand through the shared [`PageCache`] and may be evicted
/// independently.
pub struct FileChunk {
    id: ChunkId,
    path: PathBuf,
    header: HeaderPage,
    state: RwLock<ChunkState>,
    cache: Arc<PageCache>,
}

impl fmt::Debug for FileChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChunk")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("num_keys", &self.header.num_keys)
            .field("written", &self.is_written())
            .finish()
    }
}

impl FileChunk {
    /// Wraps freshly serialized page images. The chunk is readable at once
    /// and becomes durable after the writer persisted the images and
    /// [`mark_written`](Self::mark_written) was called.
    pub fn from_image(path: PathBuf, image: ChunkImage, cache: Arc<PageCache>) -> Self {
        Self {
            id: image.header.chunk_id,
            path,
            header: image.header.clone(),
            state: RwLock::new(ChunkState::Serialized(Arc::new(image))),
            cache,
        }
    }

    /// Opens a complete chunk file, reading only its header page.
    pub fn open(path: &Path, chunk_id: ChunkId, cache: Arc<PageCache>) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::Read(path.display().to_string(), e))?;

        let mut prefix = [0u8; 4];
        file.read_exact_at(&mut prefix, 0)
            .map_err(|e| Error::Read(format!("header of {}", path.display()), e))?;
        let size = LittleEndian::read_u32(&prefix) as usize;
        if size == 0 {
            return Err(Error::InvalidHeader(format!(
                "{} is incomplete, its header was never written",
                path.display()
            )));
        }
        if size > MAX_HEADER_PAGE_SIZE {
            return Err(Error::InvalidHeader(format!(
                "{} declares a header page of {} bytes",
                path.display(),
                size
            )));
        }

        let mut buf = vec![0u8; size];
        file.read_exact_at(&mut buf, 0)
            .map_err(|e| Error::Read(format!("header of {}", path.display()), e))?;
        let header = HeaderPage::decode(&buf)?;
        if header.chunk_id != chunk_id {
            return Err(Error::Corruption(format!(
                "{} holds chunk {} instead of {}",
                path.display(),
                header.chunk_id,
                chunk_id
            )));
        }

        let len = file.metadata()?.len();
        if len < header.file_size() {
            return Err(Error::Corruption(format!(
                "{} is {} bytes, its header expects {}",
                path.display(),
                len,
                header.file_size()
            )));
        }

        Ok(Self {
            id: chunk_id,
            path: path.to_path_buf(),
            header,
            state: RwLock::new(ChunkState::Written(Arc::new(file))),
            cache,
        })
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &HeaderPage {
        &self.header
    }

    pub fn num_keys(&self) -> u64 {
        self.header.num_keys
    }

    pub fn first_key(&self) -> &[u8] {
        &self.header.first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.header.last_key
    }

    pub fn midpoint(&self) -> &[u8] {
        &self.header.midpoint
    }

    pub fn max_log_position(&self) -> LogPosition {
        self.header.max_log_position()
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn is_written(&self) -> bool {
        self.state
            .read()
            .map(|state| matches!(*state, ChunkState::Written(_)))
            .unwrap_or(false)
    }

    /// Page images of a chunk that still has to be written.
    pub fn image(&self) -> Result<Option<Arc<ChunkImage>>> {
        match &*self.state.read()? {
            ChunkState::Serialized(image) => Ok(Some(Arc::clone(image))),
            ChunkState::Written(_) => Ok(None),
        }
    }

    /// Switches to reading from disk once the writer finished. The in-memory
    /// images are dropped.
    pub fn mark_written(&self) -> Result<()> {
        let file = File::open(&self.path)
            .map_err(|e| Error::Read(self.path.display().to_string(), e))?;
        *self.state.write()? = ChunkState::Written(Arc::new(file));
        Ok(())
    }

    /// Number of data pages, from the index page.
    pub fn num_data_pages(&self) -> Result<usize> {
        let index = self.load_page(INDEX_PAGE)?;
        Ok(index.as_index()?.len())
    }

    /// Loads a page through the cache. A page that cannot be read or fails
    /// its checksum is fatal for the caller.
    pub fn load_page(&self, page: u32) -> Result<PageHandle> {
        let file = match &*self.state.read()? {
            ChunkState::Written(file) => Arc::clone(file),
            ChunkState::Serialized(image) => return self.image_page(image, page),
        };

        if let Some(handle) = self.cache.acquire((self.id, page))? {
            return Ok(handle);
        }

        let (offset, len) = match page {
            INDEX_PAGE => (
                self.header.index_page_offset,
                self.header.index_page_size as usize,
            ),
            BLOOM_PAGE if self.header.use_bloom_filter => (
                self.header.bloom_page_offset,
                self.header.bloom_page_size as usize,
            ),
            BLOOM_PAGE => {
                return Err(Error::InvalidState(format!(
                    "chunk {} has no bloom page",
                    self.id
                )))
            }
            n => {
                let index = self.load_page(INDEX_PAGE)?;
                index
                    .as_index()?
                    .extent(n as usize, self.header.index_page_offset)?
            }
        };

        let mut buf = self.cache.allocate(len)?;
        file.read_exact_at(&mut buf, offset).map_err(|e| {
            self.load_failed(page, offset, Error::Read(self.path.display().to_string(), e))
        })?;

        let decoded = match page {
            INDEX_PAGE => IndexPage::decode(&buf).map(Page::Index),
            BLOOM_PAGE => BloomPage::decode(buf).map(Page::Bloom),
            _ => DataPage::decode(buf).map(Page::Data),
        }
        .map_err(|e| self.load_failed(page, offset, e))?;

        self.cache.insert((self.id, page), decoded)
    }

    fn image_page(&self, image: &ChunkImage, page: u32) -> Result<PageHandle> {
        match page {
            INDEX_PAGE => Ok(PageHandle::shared(Arc::clone(&image.index))),
            BLOOM_PAGE => image
                .bloom
                .as_ref()
                .map(|bloom| PageHandle::shared(Arc::clone(bloom)))
                .ok_or_else(|| Error::InvalidState(format!("chunk {} has no bloom page", self.id))),
            n => {
                let (Some(buf), Some(slot)) = (image.data_pages.get(n as usize), image.data.get(n as usize)) else {
                    return Err(Error::InvalidArgument(format!("data page {} out of range", n)));
                };
                if let Some(page) = slot.get() {
                    return Ok(PageHandle::shared(Arc::clone(page)));
                }
                let decoded = Arc::new(Page::Data(DataPage::decode(buf.clone())?));
                Ok(PageHandle::shared(Arc::clone(slot.get_or_init(|| decoded))))
            }
        }
    }

    fn load_failed(&self, page: u32, offset: u64, error: Error) -> Error {
        tracing::error!(
            chunk_id = self.id,
            page = page,
            offset = offset,
            path = %self.path.display(),
            free_disk_space = ?disk::free_space(&self.path),
            error = %error,
            "Failed to load chunk page"
        );
        error
    }

    /// Point lookup: bloom page, then index page, then one data page.
    /// `Some(None)` is a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        if self.header.num_keys == 0
            || key < self.header.first_key.as_slice()
            || key > self.header.last_key.as_slice()
        {
            return Ok(None);
        }

        if self.header.use_bloom_filter {
            let bloom = self.load_page(BLOOM_PAGE)?;
            if !bloom.as_bloom()?.check(key) {
                return Ok(None);
            }
        }

        let page = {
            let index = self.load_page(INDEX_PAGE)?;
            match index.as_index()?.locate(key) {
                Some(page) => page,
                None => return Ok(None),
            }
        };

        let data = self.load_page(page as u32)?;
        let found = data
            .as_data()?
            .get(key)
            .map(|value| value.map(<[u8]>::to_vec));
        Ok(found)
    }
}
