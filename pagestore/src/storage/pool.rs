//! Page pool: a pin-counted cache of file pages.
//!
//! Every access to a page goes through the pool. `find` pins the page
//! (loading it from the file on a miss) and hands back a `PinnedPage`; the
//! pin is released when the guard is dropped.
//!
//! # Design
//!
//! - Frames are located through a hash table keyed by page number, with
//!   collisions chained through the frames themselves.
//! - Idle frames (pin count 0) sit on an intrusive LRU list; a miss on a
//!   bounded pool recycles the least recently used idle frame, writing it
//!   back first if it is dirty.
//! - Dirty frames are tracked in a worklist. `flush` writes them in
//!   ascending page order and then syncs the file.
//! - A pool built with capacity 0 never evicts and grows as needed.
//! - All bookkeeping, including file I/O on misses and evictions, happens
//!   under one mutex. Page contents sit behind a per-frame `RwLock`, so the
//!   bytes of a pinned page can be read or written without the pool lock.
//!
//! # Invariants
//!
//! - A frame is on the LRU list iff it holds a page and its pin count is 0.
//! - A frame is in the dirty worklist iff its dirty flag is set.
//! - Pinned frames are never evicted.
//!
//! Callers must not call back into the pool from inside `PinnedPage::read`
//! or `PinnedPage::write` closures.

// Frame indices and hash buckets are usize; page ids are bounded by file size.
#![allow(clippy::cast_possible_truncation)]

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::config::StoreConfig;
use crate::storage::file::{BlockFile, FileError};
use crate::storage::page::{PAGE_SIZE, PAGE_SIZE_U64, Page, PageId, page_of, page_offset};

/// Hash table size for pools that grow on demand.
const INITIAL_UNBOUNDED_BUCKETS: usize = 1024;

/// Statistics about pool activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Lookups satisfied from memory.
    pub hits: u64,
    /// Lookups that had to load the page.
    pub misses: u64,
    /// Frames recycled for another page.
    pub evictions: u64,
    /// Dirty pages written back because their frame was recycled.
    pub dirty_writebacks: u64,
    /// Page reads issued to the file.
    pub page_reads: u64,
    /// Page writes issued to the file.
    pub page_writes: u64,
    /// Completed flushes.
    pub flushes: u64,
}

#[derive(Debug)]
struct Frame {
    page_id: PageId,
    access_count: u32,
    dirty: bool,
    dirty_index: usize,
    next_in_bucket: Option<usize>,
    lru_prev: Option<usize>,
    lru_next: Option<usize>,
}

impl Frame {
    const fn empty() -> Self {
        Self {
            page_id: 0,
            access_count: 0,
            dirty: false,
            dirty_index: 0,
            next_in_bucket: None,
            lru_prev: None,
            lru_next: None,
        }
    }
}

struct PoolState {
    file: Box<dyn BlockFile>,
    frames: Vec<Frame>,
    buffers: Vec<Arc<RwLock<Page>>>,
    buckets: Vec<Option<usize>>,
    free_frames: Vec<usize>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    dirty_pages: Vec<usize>,
    capacity: Option<usize>,
    stats: PoolStats,
    closed: bool,
}

impl PoolState {
    const fn bucket_of(&self, page_id: PageId) -> usize {
        (page_id % self.buckets.len() as u64) as usize
    }

    fn lookup(&self, page_id: PageId) -> Option<usize> {
        let mut cursor = self.buckets[self.bucket_of(page_id)];
        while let Some(i) = cursor {
            if self.frames[i].page_id == page_id {
                return Some(i);
            }
            cursor = self.frames[i].next_in_bucket;
        }
        None
    }

    fn hash_insert(&mut self, i: usize) {
        let bucket = self.bucket_of(self.frames[i].page_id);
        self.frames[i].next_in_bucket = self.buckets[bucket];
        self.buckets[bucket] = Some(i);
    }

    fn hash_remove(&mut self, i: usize) {
        let bucket = self.bucket_of(self.frames[i].page_id);
        let next = self.frames[i].next_in_bucket.take();
        if self.buckets[bucket] == Some(i) {
            self.buckets[bucket] = next;
            return;
        }
        let mut cursor = self.buckets[bucket];
        while let Some(j) = cursor {
            if self.frames[j].next_in_bucket == Some(i) {
                self.frames[j].next_in_bucket = next;
                return;
            }
            cursor = self.frames[j].next_in_bucket;
        }
    }

    fn rehash(&mut self, bucket_count: usize) {
        let mut chained = Vec::with_capacity(self.frames.len());
        for head in &self.buckets {
            let mut cursor = *head;
            while let Some(i) = cursor {
                chained.push(i);
                cursor = self.frames[i].next_in_bucket;
            }
        }
        self.buckets = vec![None; bucket_count];
        for i in chained {
            self.hash_insert(i);
        }
    }

    fn lru_link_head(&mut self, i: usize) {
        self.frames[i].lru_prev = None;
        self.frames[i].lru_next = self.lru_head;
        match self.lru_head {
            Some(head) => self.frames[head].lru_prev = Some(i),
            None => self.lru_tail = Some(i),
        }
        self.lru_head = Some(i);
    }

    fn lru_unlink(&mut self, i: usize) {
        let prev = self.frames[i].lru_prev.take();
        let next = self.frames[i].lru_next.take();
        match prev {
            Some(p) => self.frames[p].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.frames[n].lru_prev = prev,
            None => self.lru_tail = prev,
        }
    }

    fn mark_dirty(&mut self, i: usize) {
        if !self.frames[i].dirty {
            self.frames[i].dirty = true;
            self.frames[i].dirty_index = self.dirty_pages.len();
            self.dirty_pages.push(i);
        }
    }

    fn remove_dirty(&mut self, i: usize) {
        let index = self.frames[i].dirty_index;
        self.dirty_pages.swap_remove(index);
        if let Some(&moved) = self.dirty_pages.get(index) {
            self.frames[moved].dirty_index = index;
        }
        self.frames[i].dirty = false;
    }

    #[allow(clippy::expect_used)] // RwLock poisoning indicates unrecoverable state
    fn write_frame(&mut self, i: usize) -> Result<(), FileError> {
        let offset = page_offset(self.frames[i].page_id);
        let page = self.buffers[i].read().expect("lock poisoned");
        self.file.write(offset, page.as_bytes())?;
        self.stats.page_writes += 1;
        Ok(())
    }

    #[allow(clippy::expect_used)] // RwLock poisoning indicates unrecoverable state
    fn load_frame(&mut self, i: usize, page_id: PageId) -> Result<(), FileError> {
        let mut page = self.buffers[i].write().expect("lock poisoned");
        let n = self.file.read(page_offset(page_id), page.as_bytes_mut())?;
        if n < PAGE_SIZE {
            page.as_bytes_mut()[n..].fill(0);
        }
        self.stats.page_reads += 1;
        Ok(())
    }

    /// Find a frame that can take a new page: a free frame, a fresh frame
    /// while below capacity, or the least recently used idle frame.
    fn acquire_frame(&mut self) -> Result<usize, PoolError> {
        if let Some(i) = self.free_frames.pop() {
            return Ok(i);
        }

        let below_capacity = self.capacity.is_none_or(|cap| self.frames.len() < cap);
        if below_capacity {
            self.frames.push(Frame::empty());
            self.buffers.push(Arc::new(RwLock::new(Page::new())));
            if self.capacity.is_none() && self.frames.len() > self.buckets.len() {
                self.rehash(self.buckets.len() * 2);
            }
            return Ok(self.frames.len() - 1);
        }

        let victim = self.lru_tail.ok_or(PoolError::Exhausted {
            capacity: self.frames.len(),
        })?;
        if self.frames[victim].dirty {
            self.write_frame(victim)?;
            self.remove_dirty(victim);
            self.stats.dirty_writebacks += 1;
            tracing::debug!(page_id = self.frames[victim].page_id, "wrote back evicted page");
        }
        self.lru_unlink(victim);
        self.hash_remove(victim);
        self.stats.evictions += 1;
        Ok(victim)
    }
}

/// A pin-counted page cache over a `BlockFile`.
///
/// # Post-conditions
///
/// - After `flush` returns `Ok`, every page modified through this pool is on
///   the file (and synced when `sync_on_flush` is set).
pub struct PagePool {
    state: Mutex<PoolState>,
    sync_on_flush: bool,
}

impl PagePool {
    /// Create a pool over `file` sized by `config.pool_pages` (0 = unbounded).
    #[must_use]
    pub fn new(file: Box<dyn BlockFile>, config: &StoreConfig) -> Self {
        let capacity = (config.pool_pages > 0).then_some(config.pool_pages);
        let bucket_count = capacity.unwrap_or(INITIAL_UNBOUNDED_BUCKETS);

        Self {
            state: Mutex::new(PoolState {
                file,
                frames: Vec::new(),
                buffers: Vec::new(),
                buckets: vec![None; bucket_count],
                free_frames: Vec::new(),
                lru_head: None,
                lru_tail: None,
                dirty_pages: Vec::new(),
                capacity,
                stats: PoolStats::default(),
                closed: false,
            }),
            sync_on_flush: config.sync_on_flush,
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Pin a page, loading it from the file if it is not cached.
    ///
    /// When `for_write` is set the page is marked dirty right away.
    ///
    /// # Errors
    ///
    /// - `PoolError::Exhausted` if the pool is bounded and every frame is pinned
    /// - `PoolError::File` if loading the page or writing back a victim failed
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn find(&self, page_id: PageId, for_write: bool) -> Result<PinnedPage<'_>, PoolError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        let frame = if let Some(i) = state.lookup(page_id) {
            state.stats.hits += 1;
            if state.frames[i].access_count == 0 {
                state.lru_unlink(i);
            }
            state.frames[i].access_count += 1;
            i
        } else {
            state.stats.misses += 1;
            let i = state.acquire_frame()?;
            if let Err(e) = state.load_frame(i, page_id) {
                state.free_frames.push(i);
                return Err(e.into());
            }
            state.frames[i].page_id = page_id;
            state.frames[i].access_count = 1;
            state.hash_insert(i);
            tracing::trace!(page_id, frame = i, "loaded page");
            i
        };

        if for_write {
            state.mark_dirty(frame);
        }

        Ok(PinnedPage {
            pool: self,
            frame,
            page_id,
            buffer: Arc::clone(&state.buffers[frame]),
        })
    }

    /// Pin a page for reading.
    pub fn get_page(&self, page_id: PageId) -> Result<PinnedPage<'_>, PoolError> {
        self.find(page_id, false)
    }

    /// Pin a page for writing. The page is marked dirty.
    pub fn put_page(&self, page_id: PageId) -> Result<PinnedPage<'_>, PoolError> {
        self.find(page_id, true)
    }

    fn mark_dirty(&self, frame: usize) {
        self.lock().mark_dirty(frame);
    }

    fn unfix(&self, frame: usize) {
        let mut state = self.lock();
        let frame_state = &mut state.frames[frame];
        frame_state.access_count -= 1;
        if frame_state.access_count == 0 {
            state.lru_link_head(frame);
        }
    }

    /// Read `len` bytes starting at byte position `pos`, across page boundaries.
    pub fn read_at(&self, pos: u64, len: usize) -> Result<Vec<u8>, PoolError> {
        let mut out = Vec::with_capacity(len);
        let mut pos = pos;
        while out.len() < len {
            let offset = (pos % PAGE_SIZE_U64) as usize;
            let chunk = (PAGE_SIZE - offset).min(len - out.len());
            let pinned = self.get_page(page_of(pos))?;
            pinned.read(|page| out.extend_from_slice(page.read_bytes(offset, chunk)));
            pos += chunk as u64;
        }
        Ok(out)
    }

    /// Write `bytes` starting at byte position `pos`, across page boundaries.
    pub fn write_at(&self, pos: u64, bytes: &[u8]) -> Result<(), PoolError> {
        let mut written = 0;
        let mut pos = pos;
        while written < bytes.len() {
            let offset = (pos % PAGE_SIZE_U64) as usize;
            let chunk = (PAGE_SIZE - offset).min(bytes.len() - written);
            let pinned = self.put_page(page_of(pos))?;
            pinned.write(|page| page.write_bytes(offset, &bytes[written..written + chunk]));
            written += chunk;
            pos += chunk as u64;
        }
        Ok(())
    }

    /// Write every dirty page to the file in ascending page order, then sync.
    ///
    /// # Post-conditions
    ///
    /// - On success the dirty worklist is empty.
    /// - On a write failure the pages not yet written stay dirty.
    pub fn flush(&self) -> Result<(), PoolError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        let mut dirty = std::mem::take(&mut state.dirty_pages);
        dirty.sort_by_key(|&i| state.frames[i].page_id);

        for (n, &i) in dirty.iter().enumerate() {
            if let Err(e) = state.write_frame(i) {
                for (index, &pending) in dirty[n..].iter().enumerate() {
                    state.frames[pending].dirty_index = index;
                }
                state.dirty_pages = dirty[n..].to_vec();
                return Err(e.into());
            }
            state.frames[i].dirty = false;
        }

        if self.sync_on_flush {
            state.file.sync()?;
        }
        state.stats.flushes += 1;
        tracing::debug!(pages = dirty.len(), "flushed dirty pages");
        Ok(())
    }

    /// Flush and release the backing file.
    pub fn close(&self) -> Result<(), PoolError> {
        self.flush()?;
        let mut state = self.lock();
        state.file.close()?;
        state.closed = true;
        Ok(())
    }

    /// Snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.lock().stats.clone()
    }

    /// Number of pages waiting to be written.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.lock().dirty_pages.len()
    }

    /// Number of frames currently pinned.
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.lock().frames.iter().filter(|f| f.access_count > 0).count()
    }

    /// Whether a page is currently cached.
    #[must_use]
    pub fn is_cached(&self, page_id: PageId) -> bool {
        self.lock().lookup(page_id).is_some()
    }
}

/// A pinned page. The pin is released on drop.
pub struct PinnedPage<'a> {
    pool: &'a PagePool,
    frame: usize,
    page_id: PageId,
    buffer: Arc<RwLock<Page>>,
}

impl PinnedPage<'_> {
    /// The page number this pin refers to.
    #[must_use]
    pub const fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Read the page contents.
    #[allow(clippy::expect_used)] // RwLock poisoning indicates unrecoverable state
    pub fn read<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        let page = self.buffer.read().expect("lock poisoned");
        f(&page)
    }

    /// Modify the page contents.
    ///
    /// The page is marked dirty before and again after `f` runs, so a
    /// `flush` on another thread that writes the old bytes in between
    /// cannot leave the new bytes clean.
    #[allow(clippy::expect_used)] // RwLock poisoning indicates unrecoverable state
    pub fn write<R>(&self, f: impl FnOnce(&mut Page) -> R) -> R {
        self.pool.mark_dirty(self.frame);
        let result = {
            let mut page = self.buffer.write().expect("lock poisoned");
            f(&mut page)
        };
        // Taken after the buffer lock is released: flush locks the pool first.
        self.pool.mark_dirty(self.frame);
        result
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.pool.unfix(self.frame);
    }
}

impl std::fmt::Debug for PinnedPage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("page_id", &self.page_id)
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur during pool operations.
#[derive(Debug)]
pub enum PoolError {
    /// The backing file failed.
    File(FileError),
    /// Every frame of a bounded pool is pinned.
    Exhausted { capacity: usize },
    /// The pool has been closed.
    Closed,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(e) => write!(f, "file error: {e}"),
            Self::Exhausted { capacity } => {
                write!(f, "page pool exhausted: all {capacity} frames are pinned")
            }
            Self::Closed => write!(f, "page pool is closed"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FileError> for PoolError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}
