use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use tracing::debug;

use crate::error::{Result, SelvaError};

/// Default size of a page in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8192;
/// Default number of pages held in the file store's cache.
pub const DEFAULT_CACHE_SIZE: usize = 1024;
/// Bytes reserved at the end of every page for the checksum footer.
pub const PAGE_CHECKSUM_SIZE: usize = 4;

/// Offset inside a page where the free-chain pointer of a freed page lives.
///
/// Shares the reserved slot in the record-page header so recycled pages
/// come back with a zeroed header.
pub const FREE_LIST_NEXT_OFFSET: usize = 4;

const HEADER_MAGIC: &[u8; 4] = b"SELV";
const HEADER_VERSION: u16 = 1;

/// Identifier of a page within a store. Page 0 is the store header.
pub type PageId = u32;

/// Fixed-size page storage.
///
/// Page size is a configuration constant for the lifetime of a store.
/// Implementations return whole-page buffers on read and require
/// whole-page buffers on write.
pub trait PageStore {
    /// Returns the page size in bytes.
    fn page_size(&self) -> usize;

    /// Reads a full page.
    fn read_page(&mut self, id: PageId) -> Result<Vec<u8>>;

    /// Overwrites a full page.
    fn write_page(&mut self, id: PageId, data: &[u8]) -> Result<()>;

    /// Allocates a page, reusing a freed page when one is available.
    fn allocate_page(&mut self) -> Result<PageId>;

    /// Returns a page to the free pool.
    fn free_page(&mut self, id: PageId) -> Result<()>;

    /// Writes any buffered state back to the underlying medium.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Heap-backed page store for tests and transient indexes.
pub struct MemoryPageStore {
    page_size: usize,
    pages: Vec<Option<Box<[u8]>>>,
    free: Vec<PageId>,
}

impl MemoryPageStore {
    /// Creates a store with the default page size.
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates a store with an explicit page size.
    pub fn with_page_size(page_size: usize) -> Self {
        // Slot 0 mirrors the file store's header page and is never handed out.
        Self {
            page_size,
            pages: vec![None],
            free: Vec::new(),
        }
    }

    fn slot(&mut self, id: PageId) -> Result<&mut Box<[u8]>> {
        self.pages
            .get_mut(id as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| SelvaError::InvalidArgument(format!("page {id} is not allocated")))
    }
}

impl Default for MemoryPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemoryPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&mut self, id: PageId) -> Result<Vec<u8>> {
        Ok(self.slot(id)?.to_vec())
    }

    fn write_page(&mut self, id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(SelvaError::InvalidArgument(
                "page size mismatch on write".into(),
            ));
        }
        self.slot(id)?.copy_from_slice(data);
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<PageId> {
        if let Some(id) = self.free.pop() {
            self.pages[id as usize] = Some(vec![0; self.page_size].into_boxed_slice());
            return Ok(id);
        }
        let id = self.pages.len();
        if id > PageId::MAX as usize {
            return Err(SelvaError::CapacityExhausted(
                "memory store page id space exhausted".into(),
            ));
        }
        self.pages
            .push(Some(vec![0; self.page_size].into_boxed_slice()));
        Ok(id as PageId)
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        let slot = self
            .pages
            .get_mut(id as usize)
            .ok_or_else(|| SelvaError::InvalidArgument(format!("page {id} is not allocated")))?;
        if slot.take().is_none() {
            return Err(SelvaError::InvalidArgument(format!(
                "page {id} freed twice"
            )));
        }
        self.free.push(id);
        Ok(())
    }
}

#[derive(Debug)]
struct CachedPage {
    data: Vec<u8>,
    dirty: bool,
}

/// File-backed page store with a write-back LRU cache.
///
/// Every page carries a crc32 footer over its payload; mismatches on read
/// surface as corruption. Freed pages are chained through their header
/// slot and recycled before the file grows.
#[derive(Debug)]
pub struct FilePageStore {
    file: File,
    page_size: usize,
    cache: LruCache<PageId, CachedPage>,
    file_len: u64,
    free_head: PageId,
}

impl FilePageStore {
    /// Opens or creates a store at `path` with default sizing.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_SIZE)
    }

    /// Opens or creates a store with explicit page and cache sizes.
    pub fn open_with_config(path: &Path, page_size: usize, cache_size: usize) -> Result<Self> {
        if page_size < 64 || page_size > u16::MAX as usize + 1 {
            return Err(SelvaError::InvalidArgument(format!(
                "unsupported page size {page_size}"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let cache_size = NonZeroUsize::new(cache_size)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_SIZE).expect("nonzero default"));
        let mut store = Self {
            file,
            page_size,
            cache: LruCache::new(cache_size),
            file_len,
            free_head: 0,
        };

        if file_len == 0 {
            store.write_header()?;
        } else {
            store.read_header()?;
        }
        Ok(store)
    }

    /// Returns the number of pages the file currently spans.
    pub fn page_count(&self) -> usize {
        if self.file_len == 0 {
            0
        } else {
            ((self.file_len - 1) as usize / self.page_size) + 1
        }
    }

    fn write_header(&mut self) -> Result<()> {
        let mut page = vec![0u8; self.page_size];
        page[0..4].copy_from_slice(HEADER_MAGIC);
        page[4..6].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        page[6..10].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        page[10..14].copy_from_slice(&self.free_head.to_le_bytes());
        seal_page(&mut page);
        self.write_page_to_disk(0, &page)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        let page = self.load_page_bytes(0)?;
        if &page[0..4] != HEADER_MAGIC {
            return Err(SelvaError::Corruption("store header magic mismatch".into()));
        }
        let version = u16::from_le_bytes(page[4..6].try_into().expect("2 bytes"));
        if version != HEADER_VERSION {
            return Err(SelvaError::Corruption(format!(
                "unsupported store version {version}"
            )));
        }
        let on_disk_page_size =
            u32::from_le_bytes(page[6..10].try_into().expect("4 bytes")) as usize;
        if on_disk_page_size != self.page_size {
            return Err(SelvaError::InvalidArgument(format!(
                "store was created with page size {on_disk_page_size}, opened with {}",
                self.page_size
            )));
        }
        self.free_head = u32::from_le_bytes(page[10..14].try_into().expect("4 bytes"));
        Ok(())
    }

    fn evict(&mut self, id: PageId, page: CachedPage) -> Result<()> {
        if page.dirty {
            let mut data = page.data;
            seal_page(&mut data);
            self.write_page_to_disk(id, &data)?;
        }
        Ok(())
    }

    fn insert_cached(&mut self, id: PageId, page: CachedPage) -> Result<()> {
        if let Some((evicted_id, evicted)) = self.cache.push(id, page) {
            if evicted_id != id {
                self.evict(evicted_id, evicted)?;
            }
        }
        Ok(())
    }

    fn write_page_to_disk(&mut self, id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(SelvaError::InvalidArgument(
                "page size mismatch during flush".into(),
            ));
        }
        let offset = page_offset(id, self.page_size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        let end = offset + data.len() as u64;
        if end > self.file_len {
            self.file_len = end;
        }
        Ok(())
    }

    fn load_page_bytes(&mut self, id: PageId) -> Result<Vec<u8>> {
        let offset = page_offset(id, self.page_size)? as usize;
        let mut buf = vec![0u8; self.page_size];
        if (offset as u64) < self.file_len {
            self.file.seek(SeekFrom::Start(offset as u64))?;
            let bytes_read = self.file.read(&mut buf)?;
            if bytes_read < buf.len() {
                buf[bytes_read..].fill(0);
            }
            verify_page(&buf)?;
        }
        Ok(buf)
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&mut self, id: PageId) -> Result<Vec<u8>> {
        if id == 0 {
            return Err(SelvaError::InvalidArgument(
                "page 0 is the store header".into(),
            ));
        }
        if !self.cache.contains(&id) {
            let data = self.load_page_bytes(id)?;
            self.insert_cached(id, CachedPage { data, dirty: false })?;
        }
        Ok(self
            .cache
            .get(&id)
            .expect("page cached above")
            .data
            .clone())
    }

    fn write_page(&mut self, id: PageId, data: &[u8]) -> Result<()> {
        if id == 0 {
            return Err(SelvaError::InvalidArgument(
                "page 0 is the store header".into(),
            ));
        }
        if data.len() != self.page_size {
            return Err(SelvaError::InvalidArgument(
                "page size mismatch on write".into(),
            ));
        }
        if let Some(page) = self.cache.get_mut(&id) {
            page.data.copy_from_slice(data);
            page.dirty = true;
            return Ok(());
        }
        self.insert_cached(
            id,
            CachedPage {
                data: data.to_vec(),
                dirty: true,
            },
        )
    }

    fn allocate_page(&mut self) -> Result<PageId> {
        if self.free_head != 0 {
            let id = self.free_head;
            let freed = self.read_page(id)?;
            self.free_head = u32::from_le_bytes(
                freed[FREE_LIST_NEXT_OFFSET..FREE_LIST_NEXT_OFFSET + 4]
                    .try_into()
                    .expect("4 bytes"),
            );
            let zeroed = vec![0u8; self.page_size];
            self.write_page(id, &zeroed)?;
            debug!(page = id, "recycled freed page");
            return Ok(id);
        }

        if self.file_len % self.page_size as u64 != 0 {
            return Err(SelvaError::Corruption(
                "underlying file length is not page aligned".into(),
            ));
        }
        let id64 = self.file_len / self.page_size as u64;
        if id64 > PageId::MAX as u64 {
            return Err(SelvaError::CapacityExhausted(
                "file store page id space exhausted".into(),
            ));
        }
        let id = id64 as PageId;
        self.file_len = (id64 + 1) * self.page_size as u64;
        self.insert_cached(
            id,
            CachedPage {
                data: vec![0u8; self.page_size],
                dirty: true,
            },
        )?;
        debug!(page = id, "allocated fresh page");
        Ok(id)
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        if id == 0 {
            return Err(SelvaError::InvalidArgument(
                "page 0 is the store header".into(),
            ));
        }
        if id == self.free_head {
            return Err(SelvaError::InvalidArgument(format!(
                "page {id} is already free"
            )));
        }
        let mut page = vec![0u8; self.page_size];
        page[FREE_LIST_NEXT_OFFSET..FREE_LIST_NEXT_OFFSET + 4]
            .copy_from_slice(&self.free_head.to_le_bytes());
        self.write_page(id, &page)?;
        self.free_head = id;
        debug!(page = id, "freed page");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let dirty: Vec<PageId> = self
            .cache
            .iter()
            .filter_map(|(&id, page)| page.dirty.then_some(id))
            .collect();
        for id in dirty {
            let mut data = self
                .cache
                .get(&id)
                .expect("dirty page in cache")
                .data
                .clone();
            seal_page(&mut data);
            self.write_page_to_disk(id, &data)?;
            self.cache.get_mut(&id).expect("dirty page in cache").dirty = false;
        }
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn page_offset(id: PageId, page_size: usize) -> Result<u64> {
    u64::from(id)
        .checked_mul(page_size as u64)
        .ok_or_else(|| SelvaError::InvalidArgument("page offset overflow".into()))
}

fn seal_page(data: &mut [u8]) {
    let payload_end = data.len() - PAGE_CHECKSUM_SIZE;
    let crc = crc32fast::hash(&data[..payload_end]);
    data[payload_end..].copy_from_slice(&crc.to_le_bytes());
}

fn verify_page(data: &[u8]) -> Result<()> {
    let payload_end = data.len() - PAGE_CHECKSUM_SIZE;
    let stored = u32::from_le_bytes(data[payload_end..].try_into().expect("4 bytes"));
    if stored == 0 && data[..payload_end].iter().all(|&b| b == 0) {
        // Never-sealed page read back as zeros.
        return Ok(());
    }
    let computed = crc32fast::hash(&data[..payload_end]);
    if stored != computed {
        return Err(SelvaError::Corruption(format!(
            "page checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn memory_store_allocates_and_recycles() {
        let mut store = MemoryPageStore::with_page_size(256);
        let a = store.allocate_page().expect("allocate");
        let b = store.allocate_page().expect("allocate");
        assert_ne!(a, b);
        store.free_page(a).expect("free");
        let c = store.allocate_page().expect("allocate after free");
        assert_eq!(c, a, "freed page is reused");
        assert!(store.free_page(99).is_err());
    }

    #[test]
    fn memory_store_round_trips_page_data() {
        let mut store = MemoryPageStore::with_page_size(128);
        let id = store.allocate_page().expect("allocate");
        let mut data = vec![0u8; 128];
        data[0..4].copy_from_slice(&[1, 2, 3, 4]);
        store.write_page(id, &data).expect("write");
        assert_eq!(store.read_page(id).expect("read"), data);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let tmp = NamedTempFile::new().expect("temp file");
        let path = tmp.path().to_path_buf();

        let id = {
            let mut store =
                FilePageStore::open_with_config(&path, 512, 8).expect("open store");
            let id = store.allocate_page().expect("allocate");
            let mut data = vec![0u8; 512];
            data[0..4].copy_from_slice(&[9, 8, 7, 6]);
            store.write_page(id, &data).expect("write");
            store.flush().expect("flush");
            id
        };

        let mut store = FilePageStore::open_with_config(&path, 512, 8).expect("reopen store");
        let data = store.read_page(id).expect("read");
        assert_eq!(&data[0..4], &[9, 8, 7, 6]);
    }

    #[test]
    fn file_store_free_list_survives_reopen() {
        let tmp = NamedTempFile::new().expect("temp file");
        let path = tmp.path().to_path_buf();

        let freed = {
            let mut store =
                FilePageStore::open_with_config(&path, 512, 8).expect("open store");
            let a = store.allocate_page().expect("allocate a");
            let _b = store.allocate_page().expect("allocate b");
            store.free_page(a).expect("free a");
            store.flush().expect("flush");
            a
        };

        let mut store = FilePageStore::open_with_config(&path, 512, 8).expect("reopen store");
        let recycled = store.allocate_page().expect("allocate");
        assert_eq!(recycled, freed, "freed page recycled after reopen");
    }

    #[test]
    fn file_store_rejects_page_size_mismatch_on_reopen() {
        let tmp = NamedTempFile::new().expect("temp file");
        let path = tmp.path().to_path_buf();
        {
            let mut store =
                FilePageStore::open_with_config(&path, 512, 8).expect("open store");
            store.flush().expect("flush");
        }
        let err = FilePageStore::open_with_config(&path, 1024, 8).unwrap_err();
        assert!(matches!(err, SelvaError::InvalidArgument(_)));
    }

    #[test]
    fn file_store_detects_torn_page() {
        let tmp = NamedTempFile::new().expect("temp file");
        let path = tmp.path().to_path_buf();

        let id = {
            let mut store =
                FilePageStore::open_with_config(&path, 512, 8).expect("open store");
            let id = store.allocate_page().expect("allocate");
            let mut data = vec![0u8; 512];
            data[10] = 0xAB;
            store.write_page(id, &data).expect("write");
            store.flush().expect("flush");
            id
        };

        // Flip a payload byte behind the store's back.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .expect("open raw");
            file.seek(SeekFrom::Start(id as u64 * 512 + 11)).expect("seek");
            file.write_all(&[0xFF]).expect("corrupt");
        }

        let mut store = FilePageStore::open_with_config(&path, 512, 8).expect("reopen store");
        let err = store.read_page(id).unwrap_err();
        assert!(matches!(err, SelvaError::Corruption(_)));
    }
}
