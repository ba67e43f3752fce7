//! Shared helpers for unit tests.

use std::sync::{Arc, Once};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::StoreConfig;
use crate::btree::{Btree, KeyType};
use crate::storage::{Allocator, INITIAL_PAGES, MemoryFile, PageAllocator, PagePool};

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "pagestore=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// A page pool over a fresh in-memory file. `pool_pages` of 0 is unbounded.
pub fn memory_pool(pool_pages: usize) -> Arc<PagePool> {
    let config = StoreConfig {
        pool_pages,
        ..StoreConfig::default()
    };
    Arc::new(PagePool::new(Box::new(MemoryFile::new(0)), &config))
}

/// An empty index with the default page capacity.
pub fn memory_index(key_type: KeyType, unique: bool) -> Btree {
    init_tracing();
    let allocator: Arc<dyn Allocator> = Arc::new(PageAllocator::new(INITIAL_PAGES));
    Btree::create(memory_pool(0), allocator, key_type, unique)
}

/// An empty index whose pages hold at most `max_items` entries, so small
/// inputs already produce a multi-level tree.
#[allow(clippy::expect_used)]
pub fn small_index(key_type: KeyType, unique: bool, max_items: usize) -> Btree {
    init_tracing();
    let allocator: Arc<dyn Allocator> = Arc::new(PageAllocator::new(INITIAL_PAGES));
    Btree::create_with_capacity(memory_pool(0), allocator, key_type, unique, max_items)
        .expect("valid page capacity")
}

/// Like `small_index`, over a pool of only `pool_pages` frames, so index
/// operations keep evicting and reloading pages.
#[allow(clippy::expect_used)]
pub fn small_index_bounded(
    key_type: KeyType,
    unique: bool,
    max_items: usize,
    pool_pages: usize,
) -> Btree {
    init_tracing();
    let allocator: Arc<dyn Allocator> = Arc::new(PageAllocator::new(INITIAL_PAGES));
    Btree::create_with_capacity(
        memory_pool(pool_pages),
        allocator,
        key_type,
        unique,
        max_items,
    )
    .expect("valid page capacity")
}
