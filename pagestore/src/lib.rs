#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Embedded page store:
//  - storage: block files, the page pool, the page allocator, the superblock
//  - btree: typed indexes mapping keys to object ids, stored in pool pages
//  - store: ties the two together and commits allocator state to the file
//
// Life of an index update:
// 1. The tree loads the pages on the search path through the pool
// 2. The change is staged on decoded page images
// 3. Each changed page is encoded and written back, marking it dirty
// 4. `Store::commit` flushes dirty pages along with the allocator snapshot

pub mod btree;
pub mod config;
pub mod storage;
mod store;
#[cfg(test)]
mod testing;

pub use config::{ConfigError, StoreConfig};
pub use store::{Store, StoreError};
