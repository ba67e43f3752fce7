//! Index page persistence.
//!
//! `NodeStore` is the only place index pages touch the page pool. Every
//! mutation is staged on a decoded `BtreePage` and written back with
//! `store`, which pins the page for writing (marking it dirty), so the
//! page is never left half-modified in the pool. Pins are released before
//! `load` and `store` return.

use std::sync::Arc;

use crate::btree::codec::{self, BlobRef};
use crate::btree::key::KeyType;
use crate::btree::node::BtreePage;
use crate::btree::tree::BtreeError;
use crate::storage::{Allocator, PageId, PagePool};

/// Loads, stores, allocates and frees the pages of one index.
pub struct NodeStore {
    pool: Arc<PagePool>,
    allocator: Arc<dyn Allocator>,
    key_type: KeyType,
    max_items: usize,
}

impl NodeStore {
    #[must_use]
    pub fn new(
        pool: Arc<PagePool>,
        allocator: Arc<dyn Allocator>,
        key_type: KeyType,
        max_items: usize,
    ) -> Self {
        Self {
            pool,
            allocator,
            key_type,
            max_items,
        }
    }

    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    #[must_use]
    pub const fn max_items(&self) -> usize {
        self.max_items
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    #[must_use]
    pub const fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// An empty page image for this index.
    #[must_use]
    pub fn new_page(&self, leaf: bool) -> BtreePage {
        BtreePage::new(self.key_type, self.max_items, leaf)
    }

    /// Read and decode a page, fetching out-of-line key payloads.
    pub fn load(&self, page_id: PageId) -> Result<BtreePage, BtreeError> {
        let pinned = self.pool.get_page(page_id)?;
        let mut node = pinned
            .read(|page| BtreePage::from_page(page, page_id, self.key_type, self.max_items))?;
        drop(pinned);

        if self.key_type.is_out_of_line() {
            for slot in node.slots_mut() {
                if let Some(blob) = slot.blob {
                    let bytes = self.pool.read_at(blob.pos, blob.len as usize)?;
                    slot.key = codec::from_payload(self.key_type, &bytes)?;
                }
            }
        }
        Ok(node)
    }

    /// Encode a page and write it through the pool.
    ///
    /// Blobs released by the page are freed and keys without a blob get one.
    pub fn store(&self, page_id: PageId, node: &mut BtreePage) -> Result<(), BtreeError> {
        for blob in node.take_released() {
            self.free_blob(blob);
        }

        if self.key_type.is_out_of_line() {
            for slot in node.slots_mut() {
                if slot.blob.is_none() {
                    let payload = codec::payload(&slot.key);
                    let pos = self.allocator.allocate(payload.len());
                    self.pool.write_at(pos, &payload)?;
                    slot.blob = Some(BlobRef {
                        pos,
                        len: codec::payload_len(&payload),
                    });
                }
            }
        }

        let pinned = self.pool.put_page(page_id)?;
        pinned.write(|page| node.write_to_page(page))?;
        Ok(())
    }

    /// Reserve a page for a new index page.
    #[must_use]
    pub fn allocate(&self) -> PageId {
        self.allocator.allocate_page()
    }

    /// Return a page and every blob it owns to the allocator.
    pub fn free(&self, page_id: PageId, node: BtreePage) {
        for blob in node.into_blobs() {
            self.free_blob(blob);
        }
        self.allocator.free_page(page_id);
    }

    fn free_blob(&self, blob: BlobRef) {
        self.allocator.free(blob.pos, blob.len as usize);
    }
}
