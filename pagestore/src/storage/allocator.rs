//! Space allocation: whole pages from a bitmap, small objects from quanta.
//!
//! Each bit of the page bitmap represents one page: 0 = free, 1 = used.
//! Page 0 (superblock) is always reserved. When the bitmap runs out of free
//! pages it doubles, since the file grows on the first write past its end.
//!
//! Byte objects up to one page are carved out of shared "blob pages" in
//! 16-byte quanta, tracked by a 256-bit mask per blob page. Larger objects
//! take a contiguous run of whole pages.

// Page IDs are u64 but bitmap indices are usize. On 64-bit systems these are the same size.
#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::storage::page::{PAGE_SIZE, PAGE_SIZE_U64, PageId, page_of, page_offset};

/// Number of bits per byte.
const BITS_PER_BYTE: usize = 8;

/// Allocation granularity inside blob pages.
pub const QUANTUM_SIZE: usize = 16;

/// Quanta per blob page.
const QUANTA_PER_PAGE: usize = PAGE_SIZE / QUANTUM_SIZE;

/// 64-bit words in a blob page mask.
const MASK_WORDS: usize = QUANTA_PER_PAGE / 64;

/// Pages tracked by a fresh allocator.
pub const INITIAL_PAGES: u64 = 64;

type QuantumMask = [u64; MASK_WORDS];

/// Space allocation used by index pages and out-of-line key payloads.
pub trait Allocator: Send + Sync {
    /// Allocate one page.
    fn allocate_page(&self) -> PageId;

    /// Return a page.
    fn free_page(&self, page_id: PageId);

    /// Allocate `size` bytes and return their byte position.
    ///
    /// A zero-sized request returns position 0 and needs no matching free.
    fn allocate(&self, size: usize) -> u64;

    /// Return a byte range obtained from `allocate` with the same `size`.
    fn free(&self, pos: u64, size: usize);
}

#[derive(Debug)]
struct AllocatorState {
    /// The bitmap data (in-memory representation).
    bitmap: Vec<u8>,
    /// Total number of pages being tracked.
    total_pages: u64,
    /// Number of free pages.
    free_count: u64,
    /// Hint for next free page search.
    next_search_hint: u64,
    /// Quantum masks of pages shared by small objects.
    blob_pages: BTreeMap<PageId, QuantumMask>,
}

impl AllocatorState {
    fn new(total_pages: u64) -> Self {
        let total_pages = total_pages.max(1);
        let mut bitmap = vec![0u8; (total_pages as usize).div_ceil(BITS_PER_BYTE)];
        set_bit(&mut bitmap, 0);

        Self {
            bitmap,
            total_pages,
            free_count: total_pages - 1,
            next_search_hint: 1,
            blob_pages: BTreeMap::new(),
        }
    }

    fn try_allocate(&mut self) -> Option<PageId> {
        if self.free_count == 0 {
            return None;
        }

        let candidates = (self.next_search_hint..self.total_pages).chain(0..self.next_search_hint);
        for page_id in candidates {
            if !get_bit(&self.bitmap, page_id as usize) {
                set_bit(&mut self.bitmap, page_id as usize);
                self.free_count -= 1;
                self.next_search_hint = page_id + 1;
                return Some(page_id);
            }
        }

        None
    }

    fn allocate(&mut self) -> PageId {
        loop {
            if let Some(page_id) = self.try_allocate() {
                return page_id;
            }
            self.expand(self.total_pages * 2);
        }
    }

    fn try_allocate_contiguous(&mut self, count: u64) -> Option<PageId> {
        if count > self.free_count {
            return None;
        }

        let mut run_start = 0u64;
        let mut run_length = 0u64;

        for page_id in 0..self.total_pages {
            if get_bit(&self.bitmap, page_id as usize) {
                run_start = page_id + 1;
                run_length = 0;
            } else {
                run_length += 1;
                if run_length >= count {
                    for p in run_start..run_start + count {
                        set_bit(&mut self.bitmap, p as usize);
                    }
                    self.free_count -= count;
                    self.next_search_hint = run_start + count;
                    return Some(run_start);
                }
            }
        }

        None
    }

    fn allocate_contiguous(&mut self, count: u64) -> PageId {
        loop {
            if let Some(start) = self.try_allocate_contiguous(count) {
                return start;
            }
            self.expand((self.total_pages * 2).max(self.total_pages + count));
        }
    }

    fn free(&mut self, page_id: PageId) {
        if page_id == 0 || page_id >= self.total_pages {
            return;
        }

        if get_bit(&self.bitmap, page_id as usize) {
            clear_bit(&mut self.bitmap, page_id as usize);
            self.free_count += 1;
            if page_id < self.next_search_hint {
                self.next_search_hint = page_id;
            }
        }
    }

    fn expand(&mut self, new_total_pages: u64) {
        if new_total_pages <= self.total_pages {
            return;
        }

        let new_bitmap_bytes = (new_total_pages as usize).div_ceil(BITS_PER_BYTE);
        self.bitmap.resize(new_bitmap_bytes, 0);

        self.free_count += new_total_pages - self.total_pages;
        self.total_pages = new_total_pages;
    }

    fn allocate_quanta(&mut self, quanta: usize) -> u64 {
        for (&page_id, mask) in &mut self.blob_pages {
            if let Some(start) = find_free_run(mask, quanta) {
                set_range(mask, start, quanta);
                return page_offset(page_id) + (start * QUANTUM_SIZE) as u64;
            }
        }

        let page_id = self.allocate();
        let mut mask = [0u64; MASK_WORDS];
        set_range(&mut mask, 0, quanta);
        self.blob_pages.insert(page_id, mask);
        page_offset(page_id)
    }

    fn free_quanta(&mut self, pos: u64, quanta: usize) {
        let page_id = page_of(pos);
        let start = (pos % PAGE_SIZE_U64) as usize / QUANTUM_SIZE;
        let Some(mask) = self.blob_pages.get_mut(&page_id) else {
            return;
        };

        clear_range(mask, start, quanta);
        if mask.iter().all(|&word| word == 0) {
            self.blob_pages.remove(&page_id);
            self.free(page_id);
        }
    }
}

/// A thread-safe page and byte allocator.
///
/// # Invariants
///
/// - Page 0 is always allocated.
/// - Every blob page is also marked allocated in the page bitmap.
#[derive(Debug)]
pub struct PageAllocator {
    state: Mutex<AllocatorState>,
}

impl PageAllocator {
    /// Create an allocator for a fresh store. Only page 0 is in use.
    #[must_use]
    pub fn new(total_pages: u64) -> Self {
        Self {
            state: Mutex::new(AllocatorState::new(total_pages)),
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Allocate `count` contiguous pages and return the first.
    pub fn allocate_contiguous(&self, count: u64) -> PageId {
        self.lock().allocate_contiguous(count.max(1))
    }

    /// Free `count` contiguous pages starting at `start`.
    pub fn free_contiguous(&self, start: PageId, count: u64) {
        let mut state = self.lock();
        for page_id in start..start + count {
            state.free(page_id);
        }
    }

    /// Check if a page is allocated.
    #[must_use]
    pub fn is_allocated(&self, page_id: PageId) -> bool {
        let state = self.lock();
        page_id < state.total_pages && get_bit(&state.bitmap, page_id as usize)
    }

    /// Get the number of free pages.
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.lock().free_count
    }

    /// Get the number of pages in use, superblock included.
    #[must_use]
    pub fn allocated_count(&self) -> u64 {
        let state = self.lock();
        state.total_pages - state.free_count
    }

    /// Get the total number of pages being tracked.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.lock().total_pages
    }

    /// Number of pages currently shared by small objects.
    #[must_use]
    pub fn blob_page_count(&self) -> usize {
        self.lock().blob_pages.len()
    }

    /// Serialize the allocator state.
    ///
    /// Layout: `total_pages` u64, bitmap length u64, bitmap bytes, blob page
    /// count u64, then per blob page its id and four mask words, and finally
    /// a CRC32 of everything before it.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_bytes_releasing(0, 0)
    }

    /// Serialize the allocator state as if the `count` pages at `start` were
    /// already free. The live state is left untouched.
    #[must_use]
    pub fn to_bytes_releasing(&self, start: PageId, count: u64) -> Vec<u8> {
        let state = self.lock();
        let mut bitmap = state.bitmap.clone();
        for page_id in start.max(1)..(start + count).min(state.total_pages) {
            clear_bit(&mut bitmap, page_id as usize);
        }

        let mut out = Vec::with_capacity(
            bitmap.len() + state.blob_pages.len() * (8 + MASK_WORDS * 8) + 28,
        );
        out.extend_from_slice(&state.total_pages.to_le_bytes());
        out.extend_from_slice(&(bitmap.len() as u64).to_le_bytes());
        out.extend_from_slice(&bitmap);
        out.extend_from_slice(&(state.blob_pages.len() as u64).to_le_bytes());
        for (page_id, mask) in &state.blob_pages {
            out.extend_from_slice(&page_id.to_le_bytes());
            for word in mask {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        let checksum = crc32fast::hash(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Restore an allocator from `to_bytes` output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AllocatorError> {
        if bytes.len() < 4 {
            return Err(AllocatorError::Truncated);
        }
        let (body, tail) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(AllocatorError::ChecksumMismatch { expected, actual });
        }

        let mut reader = ByteReader { bytes: body, pos: 0 };
        let total_pages = reader.u64()?;
        let bitmap_len = reader.u64()? as usize;
        let bitmap = reader.take(bitmap_len)?.to_vec();
        let blob_count = reader.u64()?;

        let mut blob_pages = BTreeMap::new();
        for _ in 0..blob_count {
            let page_id = reader.u64()?;
            let mut mask = [0u64; MASK_WORDS];
            for word in &mut mask {
                *word = reader.u64()?;
            }
            blob_pages.insert(page_id, mask);
        }

        let used_count: u64 = bitmap.iter().map(|b| u64::from(b.count_ones())).sum();
        let free_count = total_pages.saturating_sub(used_count);
        let next_search_hint = (0..total_pages)
            .find(|&p| !get_bit(&bitmap, p as usize))
            .unwrap_or(total_pages);

        Ok(Self {
            state: Mutex::new(AllocatorState {
                bitmap,
                total_pages,
                free_count,
                next_search_hint,
                blob_pages,
            }),
        })
    }
}

impl Allocator for PageAllocator {
    fn allocate_page(&self) -> PageId {
        self.lock().allocate()
    }

    fn free_page(&self, page_id: PageId) {
        self.lock().free(page_id);
    }

    fn allocate(&self, size: usize) -> u64 {
        if size == 0 {
            return 0;
        }
        let quanta = size.div_ceil(QUANTUM_SIZE);
        let mut state = self.lock();
        if quanta > QUANTA_PER_PAGE {
            let pages = size.div_ceil(PAGE_SIZE) as u64;
            page_offset(state.allocate_contiguous(pages))
        } else {
            state.allocate_quanta(quanta)
        }
    }

    fn free(&self, pos: u64, size: usize) {
        if size == 0 {
            return;
        }
        let quanta = size.div_ceil(QUANTUM_SIZE);
        let mut state = self.lock();
        if quanta > QUANTA_PER_PAGE {
            let start = page_of(pos);
            for page_id in start..start + size.div_ceil(PAGE_SIZE) as u64 {
                state.free(page_id);
            }
        } else {
            state.free_quanta(pos, quanta);
        }
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], AllocatorError> {
        let end = self.pos.checked_add(len).ok_or(AllocatorError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(AllocatorError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u64(&mut self) -> Result<u64, AllocatorError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Errors that can occur when restoring an allocator snapshot.
#[derive(Debug, PartialEq, Eq)]
pub enum AllocatorError {
    /// The snapshot ended early.
    Truncated,
    /// The snapshot checksum does not match its contents.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "allocator snapshot is truncated"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "allocator snapshot checksum mismatch: expected {expected}, got {actual}"
            ),
        }
    }
}

impl std::error::Error for AllocatorError {}

/// Get a bit from the bitmap.
fn get_bit(bitmap: &[u8], index: usize) -> bool {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index >= bitmap.len() {
        return false;
    }

    (bitmap[byte_index] & (1 << bit_index)) != 0
}

/// Set a bit in the bitmap (mark as used).
fn set_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] |= 1 << bit_index;
    }
}

/// Clear a bit in the bitmap (mark as free).
fn clear_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] &= !(1 << bit_index);
    }
}

const fn quantum_used(mask: &QuantumMask, index: usize) -> bool {
    mask[index / 64] & (1 << (index % 64)) != 0
}

fn set_range(mask: &mut QuantumMask, start: usize, len: usize) {
    for index in start..start + len {
        mask[index / 64] |= 1 << (index % 64);
    }
}

fn clear_range(mask: &mut QuantumMask, start: usize, len: usize) {
    for index in start..(start + len).min(QUANTA_PER_PAGE) {
        mask[index / 64] &= !(1 << (index % 64));
    }
}

/// First index of `len` consecutive free quanta.
fn find_free_run(mask: &QuantumMask, len: usize) -> Option<usize> {
    let mut run_start = 0;
    let mut run_length = 0;
    for index in 0..QUANTA_PER_PAGE {
        if quantum_used(mask, index) {
            run_start = index + 1;
            run_length = 0;
        } else {
            run_length += 1;
            if run_length >= len {
                return Some(run_start);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_allocator() {
        let alloc = PageAllocator::new(100);

        assert!(alloc.is_allocated(0));
        assert!(!alloc.is_allocated(1));
        assert_eq!(alloc.free_count(), 99);
        assert_eq!(alloc.allocated_count(), 1);
    }

    #[test]
    fn test_allocate_and_free() {
        let alloc = PageAllocator::new(100);

        let page1 = alloc.allocate_page();
        let page2 = alloc.allocate_page();
        let page3 = alloc.allocate_page();
        assert!(page1 >= 1);

        let free_before = alloc.free_count();
        alloc.free_page(page2);

        assert!(alloc.is_allocated(page1));
        assert!(!alloc.is_allocated(page2));
        assert!(alloc.is_allocated(page3));
        assert_eq!(alloc.free_count(), free_before + 1);

        // Next allocation should reuse page2
        assert_eq!(alloc.allocate_page(), page2);
    }

    #[test]
    fn test_superblock_page_never_freed() {
        let alloc = PageAllocator::new(10);
        alloc.free_page(0);
        assert!(alloc.is_allocated(0));
    }

    #[test]
    fn test_grows_when_full() {
        let alloc = PageAllocator::new(4);
        let pages: Vec<_> = (0..10).map(|_| alloc.allocate_page()).collect();

        assert!(alloc.total_pages() >= 11);
        let mut sorted = pages.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 10);
    }

    #[test]
    fn test_allocate_contiguous() {
        let alloc = PageAllocator::new(8);
        let _ = alloc.allocate_page();
        let hole = alloc.allocate_page();
        let _ = alloc.allocate_page();
        alloc.free_page(hole);

        let start = alloc.allocate_contiguous(5);
        for i in 0..5 {
            assert!(alloc.is_allocated(start + i));
        }
        assert_ne!(start, hole);

        alloc.free_contiguous(start, 5);
        assert!(!alloc.is_allocated(start));
    }

    #[test]
    fn test_small_objects_share_a_page() {
        let alloc = PageAllocator::new(16);

        let a = alloc.allocate(10);
        let b = alloc.allocate(40);
        assert_eq!(page_of(a), page_of(b));
        assert_eq!(b - a, 16);
        assert_eq!(alloc.blob_page_count(), 1);

        alloc.free(a, 10);
        assert!(alloc.is_allocated(page_of(b)));

        // A freed slot is reused by an object that fits.
        assert_eq!(alloc.allocate(16), a);

        alloc.free(a, 16);
        alloc.free(b, 40);
        assert_eq!(alloc.blob_page_count(), 0);
        assert!(!alloc.is_allocated(page_of(b)));
    }

    #[test]
    fn test_large_objects_take_whole_pages() {
        let alloc = PageAllocator::new(16);
        let pos = alloc.allocate(PAGE_SIZE * 2 + 1);

        assert_eq!(pos % PAGE_SIZE_U64, 0);
        let first = page_of(pos);
        for page_id in first..first + 3 {
            assert!(alloc.is_allocated(page_id));
        }

        alloc.free(pos, PAGE_SIZE * 2 + 1);
        assert_eq!(alloc.allocated_count(), 1);
    }

    #[test]
    fn test_zero_sized_objects() {
        let alloc = PageAllocator::new(16);
        assert_eq!(alloc.allocate(0), 0);
        alloc.free(0, 0);
        assert_eq!(alloc.allocated_count(), 1);
    }

    #[test]
    fn test_roundtrip_to_bytes() {
        let alloc = PageAllocator::new(1000);
        for _ in 0..50 {
            alloc.allocate_page();
        }
        let blob = alloc.allocate(100);

        let restored = PageAllocator::from_bytes(&alloc.to_bytes()).expect("restore");

        assert_eq!(restored.total_pages(), alloc.total_pages());
        assert_eq!(restored.free_count(), alloc.free_count());
        assert_eq!(restored.blob_page_count(), 1);
        for i in 0..1000 {
            assert_eq!(
                restored.is_allocated(i),
                alloc.is_allocated(i),
                "mismatch at page {i}"
            );
        }

        // The restored quantum map keeps the blob slot taken.
        assert_ne!(restored.allocate(16), blob);
    }

    #[test]
    fn test_snapshot_releasing_extent() {
        let alloc = PageAllocator::new(64);
        let start = alloc.allocate_contiguous(3);

        let restored =
            PageAllocator::from_bytes(&alloc.to_bytes_releasing(start, 3)).expect("restore");
        for page_id in start..start + 3 {
            assert!(alloc.is_allocated(page_id), "live state keeps page {page_id}");
            assert!(!restored.is_allocated(page_id), "snapshot frees page {page_id}");
        }
        assert_eq!(restored.free_count(), alloc.free_count() + 3);
        assert!(restored.is_allocated(0));
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let alloc = PageAllocator::new(100);
        let mut bytes = alloc.to_bytes();
        bytes[3] ^= 0xFF;
        assert!(matches!(
            PageAllocator::from_bytes(&bytes),
            Err(AllocatorError::ChecksumMismatch { .. })
        ));
        assert_eq!(
            PageAllocator::from_bytes(&[1, 2]).err(),
            Some(AllocatorError::Truncated)
        );
    }

    #[test]
    fn test_bit_operations() {
        let mut bitmap = vec![0u8; 10];

        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 79);
        assert!(get_bit(&bitmap, 0));
        assert!(get_bit(&bitmap, 79));
        assert!(!get_bit(&bitmap, 80));

        clear_bit(&mut bitmap, 0);
        assert!(!get_bit(&bitmap, 0));
        assert!(get_bit(&bitmap, 79));
    }

    #[test]
    fn test_find_free_run() {
        let mut mask = [0u64; MASK_WORDS];
        set_range(&mut mask, 0, 3);
        set_range(&mut mask, 5, 1);
        assert_eq!(find_free_run(&mask, 2), Some(3));
        assert_eq!(find_free_run(&mask, 3), Some(6));
        set_range(&mut mask, 0, QUANTA_PER_PAGE);
        assert_eq!(find_free_run(&mask, 1), None);
    }
}
