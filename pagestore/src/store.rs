//! Store facade.
//!
//! A `Store` ties a block file, the page pool, the page allocator and the
//! superblock together, and hands out indexes that share them.
//!
//! # Commit
//!
//! `commit` persists the allocator snapshot into a run of pages, records
//! its location and the root index in the superblock, then flushes the
//! pool. Index pages reach the file on the same flush. There is no log:
//! a crash between commits loses the changes since the last one.

use std::path::Path;
use std::sync::Arc;

use crate::btree::{Btree, BtreeError, IndexMeta, KeyType};
use crate::config::StoreConfig;
use crate::storage::{
    Allocator, AllocatorError, BlockFile, FileError, INITIAL_PAGES, OsFile, PAGE_SIZE_U64,
    PageAllocator, PageId, PagePool, PoolError, PoolStats, Superblock, SuperblockError,
    page_offset,
};

/// An open store.
pub struct Store {
    pool: Arc<PagePool>,
    allocator: Arc<PageAllocator>,
    superblock: Superblock,
}

impl Store {
    /// Create a new store file at `path`.
    ///
    /// The path must not already exist.
    pub fn create(path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        let file = OsFile::create(path)?;
        let store = Self::create_with(Box::new(file), config)?;
        tracing::info!(path = %path.display(), "created store");
        Ok(store)
    }

    /// Open an existing store file.
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        let file = OsFile::open(path)?;
        let store = Self::open_with(Box::new(file), config)?;
        tracing::info!(path = %path.display(), "opened store");
        Ok(store)
    }

    /// Open an existing store or create a new one if it doesn't exist.
    pub fn open_or_create(path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        if path.exists() {
            Self::open(path, config)
        } else {
            Self::create(path, config)
        }
    }

    /// Initialize a store on an empty block file.
    pub fn create_with(file: Box<dyn BlockFile>, config: &StoreConfig) -> Result<Self, StoreError> {
        if !file.is_empty()? {
            return Err(StoreError::Corruption(
                "cannot create a store on a non-empty file".to_string(),
            ));
        }

        let mut store = Self {
            pool: Arc::new(PagePool::new(file, config)),
            allocator: Arc::new(PageAllocator::new(INITIAL_PAGES)),
            superblock: Superblock::new(),
        };
        store.commit()?;
        Ok(store)
    }

    /// Open a store previously committed to `file`.
    pub fn open_with(file: Box<dyn BlockFile>, config: &StoreConfig) -> Result<Self, StoreError> {
        if file.is_empty()? {
            return Err(StoreError::Corruption("store file is empty".to_string()));
        }

        let pool = Arc::new(PagePool::new(file, config));
        let superblock = pool.get_page(0)?.read(Superblock::from_page)?;
        if superblock.allocator_page == 0 || superblock.allocator_pages == 0 {
            return Err(StoreError::Corruption(
                "superblock has no allocator snapshot".to_string(),
            ));
        }

        let extent = superblock.allocator_pages.checked_mul(PAGE_SIZE_U64);
        let snapshot = extent
            .filter(|&extent| superblock.allocator_len <= extent)
            .and_then(|_| usize::try_from(superblock.allocator_len).ok())
            .ok_or_else(|| {
                StoreError::Corruption(format!(
                    "allocator snapshot of {} bytes does not fit {} pages",
                    superblock.allocator_len, superblock.allocator_pages
                ))
            })?;
        let bytes = pool.read_at(page_offset(superblock.allocator_page), snapshot)?;
        let allocator = PageAllocator::from_bytes(&bytes)?;

        tracing::debug!(
            allocated = allocator.allocated_count(),
            total = allocator.total_pages(),
            "loaded allocator snapshot"
        );

        Ok(Self {
            pool,
            allocator: Arc::new(allocator),
            superblock,
        })
    }

    /// The page pool shared by every index of this store.
    #[must_use]
    pub const fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    #[must_use]
    pub const fn allocator(&self) -> &Arc<PageAllocator> {
        &self.allocator
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn shared(&self) -> (Arc<PagePool>, Arc<dyn Allocator>) {
        let allocator: Arc<dyn Allocator> = Arc::clone(&self.allocator) as Arc<dyn Allocator>;
        (Arc::clone(&self.pool), allocator)
    }

    /// Create an empty index with the default page capacity for `key_type`.
    #[must_use]
    pub fn create_index(&self, key_type: KeyType, unique: bool) -> Btree {
        let (pool, allocator) = self.shared();
        Btree::create(pool, allocator, key_type, unique)
    }

    /// Create an empty index whose pages hold at most `max_items` entries.
    pub fn create_index_with_capacity(
        &self,
        key_type: KeyType,
        unique: bool,
        max_items: usize,
    ) -> Result<Btree, StoreError> {
        let (pool, allocator) = self.shared();
        Ok(Btree::create_with_capacity(
            pool, allocator, key_type, unique, max_items,
        )?)
    }

    /// Re-attach an index from metadata saved earlier.
    pub fn open_index(&self, meta: IndexMeta) -> Result<Btree, StoreError> {
        let (pool, allocator) = self.shared();
        Ok(Btree::open(pool, allocator, meta)?)
    }

    /// Record `index` as the root index. Persisted by the next `commit`.
    pub fn set_root_index(&mut self, index: &Btree) {
        self.superblock.root_index = index.meta().to_bytes();
    }

    /// The root index recorded at the last `set_root_index`, if any.
    pub fn root_index(&self) -> Result<Option<Btree>, StoreError> {
        if !self.superblock.has_root_index() {
            return Ok(None);
        }
        let meta = IndexMeta::from_bytes(&self.superblock.root_index)?;
        self.open_index(meta).map(Some)
    }

    /// Persist the allocator state and superblock, then flush every dirty page.
    ///
    /// # Post-conditions
    ///
    /// - The superblock points at a snapshot taken after its own pages were
    ///   allocated, so reopening never hands those pages out again.
    /// - The previous snapshot extent stays allocated until the new
    ///   superblock is in the pool. On an earlier failure the superblock and
    ///   allocator still agree on it.
    #[allow(clippy::cast_possible_truncation)] // snapshot page counts are tiny
    pub fn commit(&mut self) -> Result<(), StoreError> {
        let old_start = self.superblock.allocator_page;
        let old_pages = self.superblock.allocator_pages;

        // Allocating the extent changes the bitmap, so retry until the
        // snapshot taken afterwards fits.
        let mut pages = 1;
        let (start, snapshot) = loop {
            let start = self.allocator.allocate_contiguous(pages);
            let snapshot = self.allocator.to_bytes_releasing(old_start, old_pages);
            let needed = (snapshot.len() as u64).div_ceil(PAGE_SIZE_U64);
            if needed <= pages {
                break (start, snapshot);
            }
            self.allocator.free_contiguous(start, pages);
            pages = needed;
        };

        let mut superblock = self.superblock;
        superblock.allocator_page = start;
        superblock.allocator_pages = pages;
        superblock.allocator_len = snapshot.len() as u64;
        if let Err(e) = self.write_superblock(start, &snapshot, superblock) {
            self.allocator.free_contiguous(start, pages);
            return Err(e);
        }
        self.superblock = superblock;
        if old_pages > 0 {
            self.allocator.free_contiguous(old_start, old_pages);
        }

        self.pool.flush()?;

        tracing::info!(
            allocator_page = start,
            allocator_pages = pages,
            dirty_left = self.pool.dirty_count(),
            "committed store"
        );
        Ok(())
    }

    fn write_superblock(
        &self,
        start: PageId,
        snapshot: &[u8],
        superblock: Superblock,
    ) -> Result<(), StoreError> {
        self.pool.write_at(page_offset(start), snapshot)?;
        self.pool
            .put_page(0)?
            .write(|page| superblock.write_to_page(page));
        Ok(())
    }

    /// Commit, then close the backing file.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.commit()?;
        self.pool.close()?;
        tracing::info!("closed store");
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("superblock", &self.superblock)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur during store operations.
#[derive(Debug)]
pub enum StoreError {
    /// File I/O error.
    File(FileError),
    /// Page pool error.
    Pool(PoolError),
    /// Superblock error.
    Superblock(SuperblockError),
    /// Allocator snapshot error.
    Allocator(AllocatorError),
    /// Index error.
    Btree(BtreeError),
    /// The file does not hold a consistent store.
    Corruption(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(e) => write!(f, "file error: {e}"),
            Self::Pool(e) => write!(f, "pool error: {e}"),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
            Self::Allocator(e) => write!(f, "allocator error: {e}"),
            Self::Btree(e) => write!(f, "index error: {e}"),
            Self::Corruption(msg) => write!(f, "corrupt store: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(e) => Some(e),
            Self::Pool(e) => Some(e),
            Self::Superblock(e) => Some(e),
            Self::Allocator(e) => Some(e),
            Self::Btree(e) => Some(e),
            Self::Corruption(_) => None,
        }
    }
}

impl From<FileError> for StoreError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl From<PoolError> for StoreError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

impl From<SuperblockError> for StoreError {
    fn from(e: SuperblockError) -> Self {
        Self::Superblock(e)
    }
}

impl From<AllocatorError> for StoreError {
    fn from(e: AllocatorError) -> Self {
        Self::Allocator(e)
    }
}

impl From<BtreeError> for StoreError {
    fn from(e: BtreeError) -> Self {
        Self::Btree(e)
    }
}
