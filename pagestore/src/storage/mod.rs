//! Page storage: files, the page pool and space allocation.
//!
//! # File Format
//!
//! A store is a single file of 4KB pages:
//!
//! - Page 0: Superblock (format metadata, allocator snapshot location)
//! - Remaining pages: index pages, shared blob pages, the allocator snapshot
//!
//! # Usage
//!
//! ```
//! use pagestore::StoreConfig;
//! use pagestore::storage::{MemoryFile, PagePool};
//!
//! let pool = PagePool::new(Box::new(MemoryFile::new(0)), &StoreConfig::default());
//!
//! let page = pool.put_page(3).expect("pin page");
//! page.write(|p| p.write_bytes(0, b"hello"));
//! drop(page);
//!
//! pool.flush().expect("flush");
//! assert_eq!(pool.read_at(3 * 4096, 5).expect("read"), b"hello");
//! ```

mod allocator;
mod file;
mod memory;
mod page;
mod pool;
mod superblock;

pub use allocator::{Allocator, AllocatorError, INITIAL_PAGES, PageAllocator, QUANTUM_SIZE};
pub use file::{BlockFile, FileError, OsFile};
pub use memory::{FaultConfig, MemoryFile, MemoryFileStats};
pub use page::{
    PAGE_BITS, PAGE_SIZE, PAGE_SIZE_U64, Page, PageError, PageHeader, PageId, PageType, page_of,
    page_offset,
};
pub use pool::{PagePool, PinnedPage, PoolError, PoolStats};
pub use superblock::{FORMAT_VERSION, MAGIC, ROOT_INDEX_SIZE, Superblock, SuperblockError};
