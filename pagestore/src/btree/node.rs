//! Index page image and serialization.
//!
//! Leaf and internal pages share one layout: `max_items` key slots followed
//! by `max_items` item slots. A leaf holds `n_items` (key, object id) pairs.
//! An internal page holds `n_items` keys and `n_items + 1` child page ids;
//! `keys[i]` is the largest key routed to `children[i]`, and the last child
//! has no key of its own.
//!
//! # Page layout
//!
//! ```text
//! 0..8     page header (type, key type tag in flags, CRC32)
//! 8..10    n_items (u16)
//! 10..12   max_items (u16)
//! 12..16   reserved
//! 16..     key slots (max_items * slot width), then item slots (max_items * 8)
//! ```
//!
//! # Slot ownership
//!
//! Out-of-line keys (strings, raw bytes) own a payload blob. Moving a slot
//! moves the blob with it; `clone_key` produces a key without a blob, which
//! gets a fresh one when the page is stored. Overwriting or clearing a slot
//! queues its blob for release.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::btree::codec::{self, BlobRef};
use crate::btree::key::{Key, KeyType};
use crate::storage::{PAGE_SIZE, Page, PageHeader, PageId, PageType};

/// Node header size after the page header.
const NODE_HEADER_SIZE: usize = 8;

/// Offset where slot data starts.
const DATA_OFFSET: usize = PageHeader::SIZE + NODE_HEADER_SIZE;

/// Bytes available for key and item slots.
pub const NODE_CAPACITY: usize = PAGE_SIZE - DATA_OFFSET;

/// Size of an item slot (object id or child page id).
const ITEM_SIZE: usize = 8;

/// Smallest page capacity an index may be configured with.
pub const MIN_MAX_ITEMS: usize = 4;

/// Number of slots that fit in a page for a key type.
#[must_use]
pub const fn default_max_items(key_type: KeyType) -> usize {
    NODE_CAPACITY / (key_type.slot_width() + ITEM_SIZE)
}

/// A key held in a page slot, with the blob it owns if stored out of line.
#[derive(Debug, Clone)]
pub struct SlotKey {
    pub key: Key,
    pub blob: Option<BlobRef>,
}

impl SlotKey {
    #[must_use]
    pub const fn new(key: Key) -> Self {
        Self { key, blob: None }
    }
}

/// Decoded image of one index page.
#[derive(Debug)]
pub struct BtreePage {
    key_type: KeyType,
    max_items: usize,
    leaf: bool,
    pub n_items: usize,
    keys: Vec<Option<SlotKey>>,
    pub items: Vec<u64>,
    released: Vec<BlobRef>,
}

impl BtreePage {
    #[must_use]
    pub fn new(key_type: KeyType, max_items: usize, leaf: bool) -> Self {
        Self {
            key_type,
            max_items,
            leaf,
            n_items: 0,
            keys: (0..max_items).map(|_| None).collect(),
            items: vec![0; max_items],
            released: Vec::new(),
        }
    }

    /// An empty page of the same type and level.
    #[must_use]
    pub fn sibling(&self) -> Self {
        Self::new(self.key_type, self.max_items, self.leaf)
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.leaf
    }

    #[must_use]
    pub const fn max_items(&self) -> usize {
        self.max_items
    }

    /// Key in slot `i`, if any.
    #[must_use]
    pub fn key(&self, i: usize) -> Option<&Key> {
        self.keys.get(i)?.as_ref().map(|slot| &slot.key)
    }

    /// Key in slot `i`, which must be occupied.
    pub fn key_at(&self, i: usize) -> Result<&Key, NodeError> {
        self.key(i).ok_or(NodeError::MissingKey { slot: i })
    }

    /// Compare `key` with slot `i`. An empty slot sorts after every key.
    #[must_use]
    pub fn compare(&self, key: &Key, i: usize) -> Ordering {
        self.key(i).map_or(Ordering::Less, |item| key.compare(item))
    }

    /// Binary search over slots `0..n`: first slot for which `go_right`
    /// is false.
    pub fn search(&self, n: usize, go_right: impl Fn(Option<&Key>) -> bool) -> usize {
        let (mut l, mut r) = (0, n);
        while l < r {
            let m = (l + r) >> 1;
            if go_right(self.key(m)) {
                l = m + 1;
            } else {
                r = m;
            }
        }
        r
    }

    /// First key slot not less than `key`; `n_items` if there is none.
    #[must_use]
    pub fn lower_bound(&self, key: &Key) -> usize {
        self.search(self.n_items, |item| {
            item.is_some_and(|item| key.compare(item) == Ordering::Greater)
        })
    }

    /// A copy of the key in slot `i` that does not share its blob.
    #[must_use]
    pub fn clone_key(&self, i: usize) -> Option<SlotKey> {
        self.key(i).cloned().map(SlotKey::new)
    }

    /// Remove the key from slot `i`, blob included.
    pub fn take_key(&mut self, i: usize) -> Option<SlotKey> {
        self.keys[i].take()
    }

    /// Replace the key in slot `i`.
    pub fn set_key(&mut self, i: usize, key: Option<SlotKey>) {
        let old = std::mem::replace(&mut self.keys[i], key);
        self.release(old);
    }

    /// Replace slot `i` entirely.
    pub fn put(&mut self, i: usize, key: Option<SlotKey>, item: u64) {
        self.set_key(i, key);
        self.items[i] = item;
    }

    /// Empty slot `i`, returning what it held.
    pub fn take(&mut self, i: usize) -> (Option<SlotKey>, u64) {
        (self.keys[i].take(), std::mem::take(&mut self.items[i]))
    }

    /// Move `len` slots from `src` to `dst` within this page.
    pub fn shift(&mut self, dst: usize, src: usize, len: usize) {
        match dst.cmp(&src) {
            Ordering::Greater => {
                for k in (0..len).rev() {
                    let (key, item) = self.take(src + k);
                    self.put(dst + k, key, item);
                }
            }
            Ordering::Less => {
                for k in 0..len {
                    let (key, item) = self.take(src + k);
                    self.put(dst + k, key, item);
                }
            }
            Ordering::Equal => {}
        }
    }

    /// Move `len` keys down from `src` to `dst` (`dst < src`), leaving items.
    pub fn shift_keys_down(&mut self, dst: usize, src: usize, len: usize) {
        for k in 0..len {
            let key = self.keys[src + k].take();
            self.set_key(dst + k, key);
        }
    }

    /// Move `len` items down from `src` to `dst` (`dst < src`), leaving keys.
    pub fn shift_items_down(&mut self, dst: usize, src: usize, len: usize) {
        self.items.copy_within(src..src + len, dst);
    }

    /// Move `len` slots from another page into this one.
    pub fn move_from(&mut self, dst: usize, other: &mut Self, src: usize, len: usize) {
        for k in 0..len {
            let (key, item) = other.take(src + k);
            self.put(dst + k, key, item);
        }
    }

    /// Empty `len` slots starting at `start`.
    pub fn clear_slots(&mut self, start: usize, len: usize) {
        for i in start..start + len {
            let old = self.keys[i].take();
            self.release(old);
            self.items[i] = 0;
        }
    }

    fn release(&mut self, slot: Option<SlotKey>) {
        if let Some(blob) = slot.and_then(|slot| slot.blob) {
            self.released.push(blob);
        }
    }

    /// Blobs released since the page was loaded.
    pub fn take_released(&mut self) -> Vec<BlobRef> {
        std::mem::take(&mut self.released)
    }

    /// Occupied key slots.
    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut SlotKey> {
        self.keys.iter_mut().flatten()
    }

    /// Every blob the page still owns or has released.
    #[must_use]
    pub fn into_blobs(self) -> Vec<BlobRef> {
        let mut blobs = self.released;
        blobs.extend(self.keys.into_iter().flatten().filter_map(|slot| slot.blob));
        blobs
    }

    /// Number of item slots in use.
    #[must_use]
    pub const fn item_count(&self) -> usize {
        if self.leaf {
            self.n_items
        } else {
            self.n_items + 1
        }
    }

    /// Serialize into a page and seal it with a checksum.
    ///
    /// # Pre-conditions
    ///
    /// - Every out-of-line key in slots `0..n_items` has a blob.
    pub fn write_to_page(&self, page: &mut Page) -> Result<(), NodeError> {
        page.clear();
        let header = PageHeader {
            page_type: if self.leaf {
                PageType::BTreeLeaf
            } else {
                PageType::BTreeInternal
            },
            flags: self.key_type as u8,
            checksum: 0,
        };
        page.write_bytes(0, &header.to_bytes());
        page.write_u16(PageHeader::SIZE, self.n_items as u16);
        page.write_u16(PageHeader::SIZE + 2, self.max_items as u16);

        let width = self.key_type.slot_width();
        for i in 0..self.n_items {
            let slot = self.keys[i]
                .as_ref()
                .ok_or(NodeError::MissingKey { slot: i })?;
            let offset = DATA_OFFSET + i * width;
            let out = &mut page.as_bytes_mut()[offset..offset + width];
            if self.key_type.is_out_of_line() {
                slot.blob
                    .ok_or(NodeError::UnsavedKey { slot: i })?
                    .write(out);
            } else {
                codec::encode_inline(&slot.key, out);
            }
        }

        let items_offset = DATA_OFFSET + self.max_items * width;
        for i in 0..self.item_count() {
            page.write_u64(items_offset + i * ITEM_SIZE, self.items[i]);
        }

        page.seal();
        Ok(())
    }

    /// Decode a page image, verifying header and checksum.
    ///
    /// Out-of-line keys come back as placeholders carrying their blob; the
    /// caller fills in the payloads.
    pub fn from_page(
        page: &Page,
        page_id: PageId,
        key_type: KeyType,
        max_items: usize,
    ) -> Result<Self, NodeError> {
        let header = PageHeader::read_from(page)
            .map_err(|e| NodeError::InvalidHeader(format!("page {page_id}: {e}")))?;

        let actual = page.compute_checksum();
        if header.checksum != actual {
            return Err(NodeError::ChecksumMismatch {
                page_id,
                expected: header.checksum,
                actual,
            });
        }

        if header.flags != key_type as u8 {
            return Err(NodeError::InvalidHeader(format!(
                "page {page_id}: key type tag {} does not match {key_type}",
                header.flags
            )));
        }

        let n_items = usize::from(page.read_u16(PageHeader::SIZE));
        let stored_max = usize::from(page.read_u16(PageHeader::SIZE + 2));
        let leaf = header.page_type == PageType::BTreeLeaf;
        if stored_max != max_items || n_items > max_items || (!leaf && n_items >= max_items) {
            return Err(NodeError::InvalidHeader(format!(
                "page {page_id}: {n_items} items with capacity {stored_max}, expected capacity {max_items}"
            )));
        }

        let mut node = Self::new(key_type, max_items, leaf);
        node.n_items = n_items;

        let width = key_type.slot_width();
        for i in 0..n_items {
            let bytes = page.read_bytes(DATA_OFFSET + i * width, width);
            node.keys[i] = Some(match codec::decode_inline(key_type, bytes) {
                Some(key) => SlotKey::new(key),
                None => SlotKey {
                    key: codec::placeholder(key_type),
                    blob: Some(BlobRef::read(bytes)),
                },
            });
        }

        let items_offset = DATA_OFFSET + max_items * width;
        for i in 0..node.item_count() {
            node.items[i] = page.read_u64(items_offset + i * ITEM_SIZE);
        }

        Ok(node)
    }
}

/// Errors that can occur when decoding or encoding index pages.
#[derive(Debug)]
pub enum NodeError {
    /// The page header or node header is not what the index expects.
    InvalidHeader(String),
    /// Checksum mismatch.
    ChecksumMismatch {
        page_id: PageId,
        expected: u32,
        actual: u32,
    },
    /// An out-of-line string key is not valid UTF-16.
    InvalidString,
    /// A slot that must hold a key is empty.
    MissingKey { slot: usize },
    /// An out-of-line key was written before its payload was saved.
    UnsavedKey { slot: usize },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidHeader(msg) => write!(f, "invalid index page: {msg}"),
            Self::ChecksumMismatch {
                page_id,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch on page {page_id}: expected {expected}, got {actual}"
            ),
            Self::InvalidString => write!(f, "string key is not valid UTF-16"),
            Self::MissingKey { slot } => write!(f, "slot {slot} has no key"),
            Self::UnsavedKey { slot } => write!(f, "slot {slot} key payload was not saved"),
        }
    }
}

impl std::error::Error for NodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(keys: &[i32]) -> BtreePage {
        let mut node = BtreePage::new(KeyType::I32, 8, true);
        for (i, &k) in keys.iter().enumerate() {
            node.put(i, Some(SlotKey::new(Key::I32(k))), 100 + i as u64);
        }
        node.n_items = keys.len();
        node
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(default_max_items(KeyType::I64), NODE_CAPACITY / 16);
        assert_eq!(default_max_items(KeyType::String), NODE_CAPACITY / 20);
        assert!(default_max_items(KeyType::Bool) <= usize::from(u16::MAX));
    }

    #[test]
    fn test_leaf_roundtrip() {
        let node = leaf_with(&[-5, 3, 9]);
        let mut page = Page::new();
        node.write_to_page(&mut page).expect("encode");

        let decoded = BtreePage::from_page(&page, 7, KeyType::I32, 8).expect("decode");
        assert!(decoded.is_leaf());
        assert_eq!(decoded.n_items, 3);
        assert_eq!(decoded.key(0), Some(&Key::I32(-5)));
        assert_eq!(decoded.key(2), Some(&Key::I32(9)));
        assert_eq!(decoded.key(3), None);
        assert_eq!(decoded.items[..3], [100, 101, 102]);
    }

    #[test]
    fn test_internal_roundtrip_keeps_last_child() {
        let mut node = BtreePage::new(KeyType::I32, 8, false);
        node.put(0, Some(SlotKey::new(Key::I32(10))), 5);
        node.put(1, None, 6);
        node.n_items = 1;

        let mut page = Page::new();
        node.write_to_page(&mut page).expect("encode");
        let decoded = BtreePage::from_page(&page, 1, KeyType::I32, 8).expect("decode");

        assert!(!decoded.is_leaf());
        assert_eq!(decoded.items[..2], [5, 6]);
        assert_eq!(decoded.compare(&Key::I32(i32::MAX), 1), Ordering::Less);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut page = Page::new();
        leaf_with(&[1]).write_to_page(&mut page).expect("encode");
        page.write_u8(200, 0xFF);

        assert!(matches!(
            BtreePage::from_page(&page, 9, KeyType::I32, 8),
            Err(NodeError::ChecksumMismatch { page_id: 9, .. })
        ));
    }

    #[test]
    fn test_wrong_key_type_rejected() {
        let mut page = Page::new();
        leaf_with(&[1]).write_to_page(&mut page).expect("encode");
        assert!(matches!(
            BtreePage::from_page(&page, 1, KeyType::I64, 8),
            Err(NodeError::InvalidHeader(_))
        ));
        assert!(matches!(
            BtreePage::from_page(&Page::new(), 1, KeyType::I32, 8),
            Err(NodeError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_lower_bound() {
        let node = leaf_with(&[1, 3, 3, 7]);
        assert_eq!(node.lower_bound(&Key::I32(0)), 0);
        assert_eq!(node.lower_bound(&Key::I32(3)), 1);
        assert_eq!(node.lower_bound(&Key::I32(4)), 3);
        assert_eq!(node.lower_bound(&Key::I32(8)), 4);
    }

    #[test]
    fn test_shift_and_move() {
        let mut node = leaf_with(&[1, 2, 3]);
        node.shift(1, 0, 3);
        assert_eq!(node.key(0), None);
        assert_eq!(node.key(1), Some(&Key::I32(1)));
        assert_eq!(node.key(3), Some(&Key::I32(3)));

        node.shift(0, 1, 3);
        assert_eq!(node.key(0), Some(&Key::I32(1)));
        assert_eq!(node.key(3), None);

        let mut other = node.sibling();
        other.move_from(0, &mut node, 1, 2);
        assert_eq!(other.key(0), Some(&Key::I32(2)));
        assert_eq!(other.items[1], 102);
        assert_eq!(node.key(1), None);
    }

    #[test]
    fn test_overwritten_blob_is_released() {
        let mut node = BtreePage::new(KeyType::String, 4, true);
        let blob = BlobRef { pos: 4096, len: 4 };
        node.put(
            0,
            Some(SlotKey {
                key: Key::from("ab"),
                blob: Some(blob),
            }),
            1,
        );
        node.n_items = 1;

        // A clone never shares the blob.
        assert!(node.clone_key(0).and_then(|slot| slot.blob).is_none());

        node.set_key(0, Some(SlotKey::new(Key::from("cd"))));
        assert_eq!(node.take_released(), vec![blob]);
        assert!(node.take_released().is_empty());
    }

    #[test]
    fn test_unsaved_out_of_line_key_rejected() {
        let mut node = BtreePage::new(KeyType::Raw, 4, true);
        node.put(0, Some(SlotKey::new(Key::Raw(vec![1, 2]))), 1);
        node.n_items = 1;
        assert!(matches!(
            node.write_to_page(&mut Page::new()),
            Err(NodeError::UnsavedKey { slot: 0 })
        ));
    }
}
