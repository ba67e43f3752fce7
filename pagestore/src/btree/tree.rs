//! B-tree engine over typed index pages.
//!
//! # Design
//!
//! All pages of an index have the same capacity `max_items`. Leaves hold
//! (key, object id) entries; internal pages hold separators and child page
//! ids, where `keys[i]` is the largest key routed to `children[i]` and the
//! last child has no separator. Operations recurse from the root with the
//! number of levels remaining: 1 means the page is a leaf.
//!
//! Insert splits a full page at `m = max_items / 2`: the lower `m` slots
//! move to a freshly allocated sibling, and the sibling's last key is
//! promoted to the parent. Remove resolves underflow (fewer than
//! `max_items / 2` keys) by redistributing with a neighbour, or by merging
//! into the underflowing page when both fit in one.
//!
//! # Invariants
//!
//! - Keys within a page are sorted ascending.
//! - Every leaf is at depth `height`.
//! - A non-root leaf holds at least `max_items / 2` entries; a non-root
//!   internal page has at least `max_items / 2` children.
//! - `update_counter` advances on every successful mutation.
//!
//! # Errors
//!
//! Key type and uniqueness checks run before any page is modified, so a
//! rejected insert or a failed remove leaves the tree untouched.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::btree::cursor::{Cursor, Entries, IterationOrder};
use crate::btree::key::{Bound, Key, KeyType, ObjectId};
use crate::btree::node::{self, MIN_MAX_ITEMS, NodeError, SlotKey};
use crate::btree::pages::NodeStore;
use crate::storage::{Allocator, PageId, PagePool, PoolError};

/// Persistent description of an index, enough to re-attach it after reopen.
///
/// Encoded as a fixed 32-byte record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMeta {
    /// Root page, 0 when the index is empty.
    pub root: PageId,
    /// Number of levels, 0 when the index is empty.
    pub height: u32,
    pub key_type: KeyType,
    pub element_count: u64,
    pub unique: bool,
    /// Slots per page.
    pub max_items: u16,
}

/// `IndexMeta` record offsets.
mod offsets {
    pub const ROOT: usize = 0;
    pub const ELEMENT_COUNT: usize = 8;
    pub const HEIGHT: usize = 16;
    pub const KEY_TYPE: usize = 20;
    pub const UNIQUE: usize = 21;
    pub const MAX_ITEMS: usize = 22;
    // 24-31: reserved
}

impl IndexMeta {
    /// Encoded size.
    pub const SIZE: usize = 32;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[offsets::ROOT..offsets::ROOT + 8].copy_from_slice(&self.root.to_le_bytes());
        out[offsets::ELEMENT_COUNT..offsets::ELEMENT_COUNT + 8]
            .copy_from_slice(&self.element_count.to_le_bytes());
        out[offsets::HEIGHT..offsets::HEIGHT + 4].copy_from_slice(&self.height.to_le_bytes());
        out[offsets::KEY_TYPE] = self.key_type as u8;
        out[offsets::UNIQUE] = u8::from(self.unique);
        out[offsets::MAX_ITEMS..offsets::MAX_ITEMS + 2]
            .copy_from_slice(&self.max_items.to_le_bytes());
        out
    }

    /// Decode a record produced by `to_bytes`.
    ///
    /// # Errors
    ///
    /// - `BtreeError::UnsupportedIndexType` if the key type tag is unknown
    /// - `BtreeError::InvalidPageCapacity` if the slot count is out of range
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self, BtreeError> {
        let key_type = KeyType::try_from(bytes[offsets::KEY_TYPE])
            .map_err(BtreeError::UnsupportedIndexType)?;
        let max_items = u16::from_le_bytes([
            bytes[offsets::MAX_ITEMS],
            bytes[offsets::MAX_ITEMS + 1],
        ]);
        check_capacity(key_type, usize::from(max_items))?;

        let mut root = [0u8; 8];
        root.copy_from_slice(&bytes[offsets::ROOT..offsets::ROOT + 8]);
        let mut element_count = [0u8; 8];
        element_count.copy_from_slice(&bytes[offsets::ELEMENT_COUNT..offsets::ELEMENT_COUNT + 8]);
        let mut height = [0u8; 4];
        height.copy_from_slice(&bytes[offsets::HEIGHT..offsets::HEIGHT + 4]);

        Ok(Self {
            root: u64::from_le_bytes(root),
            height: u32::from_le_bytes(height),
            key_type,
            element_count: u64::from_le_bytes(element_count),
            unique: bytes[offsets::UNIQUE] != 0,
            max_items,
        })
    }
}

fn check_capacity(key_type: KeyType, max_items: usize) -> Result<(), BtreeError> {
    if (MIN_MAX_ITEMS..=node::default_max_items(key_type)).contains(&max_items) {
        Ok(())
    } else {
        Err(BtreeError::InvalidPageCapacity(max_items))
    }
}

/// Result of inserting into a subtree.
enum Insertion {
    Done,
    /// The page split: the new lower sibling and its largest key.
    Overflow(SlotKey, PageId),
    Duplicate,
    Overwrite(u64),
}

/// Result of removing from a subtree, with the removed value.
enum Removal {
    Done(u64),
    Underflow(u64),
    NotFound,
}

/// Which entries a scan visits, as seen from inside one page.
trait Scan {
    /// Whether `item` sorts before the first wanted entry. A missing item
    /// is the open end of an internal page.
    fn before_start(&self, item: Option<&Key>) -> bool;

    /// Whether `item` and everything after it is past the last wanted entry.
    fn past_end(&self, item: &Key) -> bool;
}

struct RangeScan<'a> {
    from: Option<&'a Bound>,
    till: Option<&'a Bound>,
}

impl Scan for RangeScan<'_> {
    fn before_start(&self, item: Option<&Key>) -> bool {
        self.from.is_some_and(|from| from.is_below(item))
    }

    fn past_end(&self, item: &Key) -> bool {
        self.till.is_some_and(|till| till.is_above(Some(item)))
    }
}

struct PrefixScan<'a>(&'a Key);

impl Scan for PrefixScan<'_> {
    fn before_start(&self, item: Option<&Key>) -> bool {
        item.is_some_and(|item| item.compare(self.0) == Ordering::Less)
    }

    fn past_end(&self, item: &Key) -> bool {
        item.compare(self.0) == Ordering::Greater && !item.starts_with(self.0)
    }
}

/// A typed B-tree index mapping keys to object ids.
///
/// Writers must be serialized by the caller. Cursors detect concurrent
/// structural changes through the update counter.
pub struct Btree {
    store: NodeStore,
    root: PageId,
    height: u32,
    element_count: u64,
    unique: bool,
    update_counter: u64,
}

impl Btree {
    /// Create an empty index with pages sized for `key_type`.
    #[must_use]
    pub fn create(
        pool: Arc<PagePool>,
        allocator: Arc<dyn Allocator>,
        key_type: KeyType,
        unique: bool,
    ) -> Self {
        let max_items = node::default_max_items(key_type);
        Self::with_store(NodeStore::new(pool, allocator, key_type, max_items), unique)
    }

    /// Create an empty index whose pages hold at most `max_items` entries.
    ///
    /// # Errors
    ///
    /// - `BtreeError::InvalidPageCapacity` if `max_items` is below the
    ///   minimum or does not fit a page for `key_type`
    pub fn create_with_capacity(
        pool: Arc<PagePool>,
        allocator: Arc<dyn Allocator>,
        key_type: KeyType,
        unique: bool,
        max_items: usize,
    ) -> Result<Self, BtreeError> {
        check_capacity(key_type, max_items)?;
        Ok(Self::with_store(
            NodeStore::new(pool, allocator, key_type, max_items),
            unique,
        ))
    }

    /// Re-attach an index from its metadata.
    pub fn open(
        pool: Arc<PagePool>,
        allocator: Arc<dyn Allocator>,
        meta: IndexMeta,
    ) -> Result<Self, BtreeError> {
        let max_items = usize::from(meta.max_items);
        check_capacity(meta.key_type, max_items)?;
        if (meta.root == 0) != (meta.height == 0) {
            return Err(NodeError::InvalidHeader(format!(
                "index root {} does not match height {}",
                meta.root, meta.height
            ))
            .into());
        }
        let mut tree = Self::with_store(
            NodeStore::new(pool, allocator, meta.key_type, max_items),
            meta.unique,
        );
        tree.root = meta.root;
        tree.height = meta.height;
        tree.element_count = meta.element_count;
        Ok(tree)
    }

    const fn with_store(store: NodeStore, unique: bool) -> Self {
        Self {
            store,
            root: 0,
            height: 0,
            element_count: 0,
            unique,
            update_counter: 0,
        }
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.element_count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    /// Number of levels, 0 for an empty index.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.store.key_type()
    }

    #[must_use]
    pub const fn is_unique(&self) -> bool {
        self.unique
    }

    /// Slots per page.
    #[must_use]
    pub const fn max_items(&self) -> usize {
        self.store.max_items()
    }

    /// Counter of successful mutations since the index was attached.
    #[must_use]
    pub const fn update_counter(&self) -> u64 {
        self.update_counter
    }

    pub(crate) const fn root(&self) -> PageId {
        self.root
    }

    pub(crate) const fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Metadata to persist for re-attaching this index.
    #[allow(clippy::cast_possible_truncation)] // capacity is checked against u16 page slots
    #[must_use]
    pub const fn meta(&self) -> IndexMeta {
        IndexMeta {
            root: self.root,
            height: self.height,
            key_type: self.store.key_type(),
            element_count: self.element_count,
            unique: self.unique,
            max_items: self.store.max_items() as u16,
        }
    }

    fn check_key(&self, key: &Key) -> Result<(), BtreeError> {
        if key.key_type() == self.key_type() {
            Ok(())
        } else {
            Err(BtreeError::IncompatibleKeyType {
                expected: self.key_type(),
                actual: key.key_type(),
            })
        }
    }

    /// Add an entry.
    ///
    /// # Errors
    ///
    /// - `BtreeError::KeyNotUnique` if the index is unique and already holds `key`
    /// - `BtreeError::IncompatibleKeyType` if `key` has the wrong type
    pub fn insert(&mut self, key: impl Into<Key>, value: ObjectId) -> Result<(), BtreeError> {
        self.put(key.into(), value, false).map(|_| ())
    }

    /// Add an entry or replace the value of an existing one.
    ///
    /// Returns the replaced value. On a non-unique index the first entry
    /// with an equal key is replaced.
    pub fn set(
        &mut self,
        key: impl Into<Key>,
        value: ObjectId,
    ) -> Result<Option<ObjectId>, BtreeError> {
        self.put(key.into(), value, true)
    }

    fn put(
        &mut self,
        key: Key,
        value: ObjectId,
        overwrite: bool,
    ) -> Result<Option<ObjectId>, BtreeError> {
        self.check_key(&key)?;

        if self.root == 0 {
            self.allocate_root(SlotKey::new(key), value.0, true)?;
        } else {
            match self.insert_into(self.root, &key, value.0, self.height, overwrite)? {
                Insertion::Done => {}
                Insertion::Overflow(separator, sibling) => {
                    self.allocate_root(separator, sibling, false)?;
                    tracing::trace!(root = self.root, height = self.height, "root split");
                }
                Insertion::Duplicate => return Err(BtreeError::KeyNotUnique),
                Insertion::Overwrite(old) => {
                    self.update_counter += 1;
                    return Ok(Some(ObjectId(old)));
                }
            }
        }

        self.element_count += 1;
        self.update_counter += 1;
        Ok(None)
    }

    /// Install a new root holding one entry, or a separator over the old
    /// root and its new lower sibling.
    fn allocate_root(&mut self, key: SlotKey, item: u64, leaf: bool) -> Result<(), BtreeError> {
        let mut root = self.store.new_page(leaf);
        root.put(0, Some(key), item);
        if !leaf {
            root.items[1] = self.root;
        }
        root.n_items = 1;

        let page_id = self.store.allocate();
        self.store.store(page_id, &mut root)?;
        self.root = page_id;
        self.height += 1;
        Ok(())
    }

    fn insert_into(
        &self,
        page_id: PageId,
        key: &Key,
        value: u64,
        height: u32,
        overwrite: bool,
    ) -> Result<Insertion, BtreeError> {
        let mut page = self.store.load(page_id)?;
        let mut n = page.n_items;
        let r = page.lower_bound(key);

        let (new_key, new_item) = if height > 1 {
            match self.insert_into(page.items[r], key, value, height - 1, overwrite)? {
                Insertion::Overflow(separator, sibling) => {
                    n += 1;
                    (separator, sibling)
                }
                other => return Ok(other),
            }
        } else {
            if r < n && page.compare(key, r) == Ordering::Equal {
                if overwrite {
                    let old = std::mem::replace(&mut page.items[r], value);
                    self.store.store(page_id, &mut page)?;
                    return Ok(Insertion::Overwrite(old));
                }
                if self.unique {
                    return Ok(Insertion::Duplicate);
                }
            }
            (SlotKey::new(key.clone()), value)
        };

        let max = page.max_items();
        if n < max {
            page.shift(r + 1, r, n - r);
            page.put(r, Some(new_key), new_item);
            page.n_items += 1;
            self.store.store(page_id, &mut page)?;
            return Ok(Insertion::Done);
        }

        // Full: the lower m slots go to a new sibling.
        let mut sibling = page.sibling();
        let m = max / 2;
        if r < m {
            sibling.move_from(0, &mut page, 0, r);
            sibling.move_from(r + 1, &mut page, r, m - r - 1);
            page.shift(0, m - 1, max - m + 1);
            sibling.put(r, Some(new_key), new_item);
        } else {
            sibling.move_from(0, &mut page, 0, m);
            page.shift(0, m, r - m);
            page.shift(r - m + 1, r, max - r);
            page.put(r - m, Some(new_key), new_item);
        }
        page.clear_slots(max - m + 1, m - 1);

        let separator = if height == 1 {
            page.n_items = max - m + 1;
            sibling.n_items = m;
            sibling.clone_key(m - 1)
        } else {
            page.n_items = max - m;
            sibling.n_items = m - 1;
            sibling.take_key(m - 1)
        }
        .ok_or(NodeError::MissingKey { slot: m - 1 })?;

        let sibling_id = self.store.allocate();
        self.store.store(sibling_id, &mut sibling)?;
        self.store.store(page_id, &mut page)?;
        Ok(Insertion::Overflow(separator, sibling_id))
    }

    /// Remove the entry for `key` from a unique index.
    ///
    /// # Errors
    ///
    /// - `BtreeError::KeyNotUnique` if the index is not unique
    /// - `BtreeError::KeyNotFound` if there is no such entry
    pub fn remove(&mut self, key: impl Into<Key>) -> Result<ObjectId, BtreeError> {
        if !self.unique {
            return Err(BtreeError::KeyNotUnique);
        }
        self.remove_matching(&key.into(), None)
    }

    /// Remove the entry with this exact key and value.
    pub fn remove_entry(&mut self, key: impl Into<Key>, value: ObjectId) -> Result<(), BtreeError> {
        self.remove_matching(&key.into(), Some(value.0)).map(|_| ())
    }

    fn remove_matching(&mut self, key: &Key, value: Option<u64>) -> Result<ObjectId, BtreeError> {
        self.check_key(key)?;
        if self.root == 0 {
            return Err(BtreeError::KeyNotFound);
        }

        let old = match self.remove_from(self.root, key, value, self.height)? {
            Removal::NotFound => return Err(BtreeError::KeyNotFound),
            Removal::Done(old) => old,
            Removal::Underflow(old) => {
                let root = self.store.load(self.root)?;
                if root.n_items == 0 {
                    let new_root = if self.height > 1 { root.items[0] } else { 0 };
                    self.store.free(self.root, root);
                    self.root = new_root;
                    self.height -= 1;
                    tracing::trace!(root = self.root, height = self.height, "root collapsed");
                }
                old
            }
        };

        self.element_count -= 1;
        self.update_counter += 1;
        Ok(ObjectId(old))
    }

    fn remove_from(
        &self,
        page_id: PageId,
        key: &Key,
        value: Option<u64>,
        height: u32,
    ) -> Result<Removal, BtreeError> {
        let mut page = self.store.load(page_id)?;
        let n = page.n_items;
        let mut r = page.lower_bound(key);

        if height == 1 {
            while r < n && page.compare(key, r) == Ordering::Equal {
                if value.is_none_or(|value| page.items[r] == value) {
                    let old = page.items[r];
                    page.set_key(r, None);
                    page.shift(r, r + 1, n - r - 1);
                    page.clear_slots(n - 1, 1);
                    page.n_items = n - 1;
                    self.store.store(page_id, &mut page)?;
                    return Ok(if page.n_items < page.max_items() / 2 {
                        Removal::Underflow(old)
                    } else {
                        Removal::Done(old)
                    });
                }
                r += 1;
            }
            return Ok(Removal::NotFound);
        }

        loop {
            match self.remove_from(page.items[r], key, value, height - 1)? {
                Removal::Underflow(old) => {
                    return Ok(if self.handle_underflow(page_id, &mut page, r, height - 1)? {
                        Removal::Underflow(old)
                    } else {
                        Removal::Done(old)
                    });
                }
                Removal::Done(old) => return Ok(Removal::Done(old)),
                Removal::NotFound => {}
            }
            // Equal keys may continue in the next child only while the
            // separator equals the key.
            if r == n || page.compare(key, r) != Ordering::Equal {
                return Ok(Removal::NotFound);
            }
            r += 1;
        }
    }

    /// Fix child `r` of `page` after it dropped below half capacity.
    ///
    /// `height` is the number of levels below `page`. Returns whether
    /// `page` itself underflows as a result.
    fn handle_underflow(
        &self,
        page_id: PageId,
        page: &mut node::BtreePage,
        r: usize,
        height: u32,
    ) -> Result<bool, BtreeError> {
        let leaf = height == 1;
        let max = page.max_items();
        let n = page.n_items;
        let a_id = page.items[r];
        let mut a = self.store.load(a_id)?;
        let mut an = a.n_items;

        if r < n {
            // Right neighbour.
            let b_id = page.items[r + 1];
            let mut b = self.store.load(b_id)?;
            let mut bn = b.n_items;
            if !leaf {
                a.set_key(an, page.take_key(r));
                an += 1;
                bn += 1;
            }

            if an + bn > max {
                let i = bn - ((an + bn) >> 1);
                a.move_from(an, &mut b, 0, i);
                b.shift(0, i, bn - i);
                let separator = if leaf {
                    a.clone_key(an + i - 1)
                } else {
                    a.take_key(an + i - 1)
                };
                page.set_key(r, separator);
                b.clear_slots(bn - i, i);
                b.n_items -= i;
                a.n_items += i;

                self.store.store(a_id, &mut a)?;
                self.store.store(b_id, &mut b)?;
                self.store.store(page_id, page)?;
                return Ok(false);
            }

            a.move_from(an, &mut b, 0, bn);
            a.n_items += bn;
            if leaf {
                page.set_key(r, None);
            }
            page.shift_keys_down(r, r + 1, n - r - 1);
            page.shift_items_down(r + 1, r + 2, n - r - 1);
            page.items[n] = 0;
            page.n_items = n - 1;

            self.store.store(a_id, &mut a)?;
            self.store.free(b_id, b);
        } else {
            // Left neighbour.
            let b_id = page.items[r - 1];
            let mut b = self.store.load(b_id)?;
            let mut bn = b.n_items;
            if !leaf {
                an += 1;
                bn += 1;
            }

            if an + bn > max {
                let i = bn - ((an + bn) >> 1);
                a.shift(i, 0, an);
                a.move_from(0, &mut b, bn - i, i);
                if !leaf {
                    a.set_key(i - 1, page.take_key(r - 1));
                }
                let separator = if leaf {
                    b.clone_key(bn - i - 1)
                } else {
                    b.take_key(bn - i - 1)
                };
                page.set_key(r - 1, separator);
                b.clear_slots(bn - i, i);
                b.n_items -= i;
                a.n_items += i;

                self.store.store(a_id, &mut a)?;
                self.store.store(b_id, &mut b)?;
                self.store.store(page_id, page)?;
                return Ok(false);
            }

            a.shift(bn, 0, an);
            a.move_from(0, &mut b, 0, bn);
            // The merged page becomes the last child, which has no key.
            if leaf {
                page.set_key(r - 1, None);
            } else {
                a.set_key(bn - 1, page.take_key(r - 1));
            }
            a.n_items += bn;
            page.items[r - 1] = a_id;
            page.items[r] = 0;
            page.n_items = n - 1;

            self.store.store(a_id, &mut a)?;
            self.store.free(b_id, b);
        }

        self.store.store(page_id, page)?;
        Ok(page.n_items < max / 2)
    }

    /// Look up the value for `key`.
    ///
    /// # Errors
    ///
    /// - `BtreeError::KeyNotUnique` if more than one entry has this key
    pub fn get(&self, key: impl Into<Key>) -> Result<Option<ObjectId>, BtreeError> {
        let key = key.into();
        let bound = Bound::inclusive(key);
        let found = self.range(Some(&bound), Some(&bound))?;
        match found.as_slice() {
            [] => Ok(None),
            [value] => Ok(Some(*value)),
            _ => Err(BtreeError::KeyNotUnique),
        }
    }

    /// Values of the entries between two bounds, in key order.
    ///
    /// A missing bound leaves that side open.
    pub fn range(
        &self,
        from: Option<&Bound>,
        till: Option<&Bound>,
    ) -> Result<Vec<ObjectId>, BtreeError> {
        for bound in from.into_iter().chain(till) {
            self.check_key(&bound.key)?;
        }
        let mut out = Vec::new();
        if self.root != 0 {
            self.find(self.root, &RangeScan { from, till }, self.height, &mut out)?;
        }
        Ok(out)
    }

    /// Values of the entries whose key starts with `prefix`, in key order.
    ///
    /// Only string and raw byte indexes support prefixes.
    pub fn prefix_search(&self, prefix: impl Into<Key>) -> Result<Vec<ObjectId>, BtreeError> {
        let prefix = prefix.into();
        self.check_prefix(&prefix)?;
        let mut out = Vec::new();
        if self.root != 0 {
            self.find(self.root, &PrefixScan(&prefix), self.height, &mut out)?;
        }
        Ok(out)
    }

    pub(crate) fn check_prefix(&self, prefix: &Key) -> Result<(), BtreeError> {
        self.check_key(prefix)?;
        if self.key_type().is_out_of_line() {
            Ok(())
        } else {
            Err(BtreeError::IncompatibleKeyType {
                expected: KeyType::String,
                actual: prefix.key_type(),
            })
        }
    }

    /// Every value in key order.
    pub fn to_vec(&self) -> Result<Vec<ObjectId>, BtreeError> {
        self.range(None, None)
    }

    /// Collect the values a scan selects under `page_id`.
    ///
    /// Returns whether the scan may continue into the next page.
    fn find(
        &self,
        page_id: PageId,
        scan: &dyn Scan,
        height: u32,
        out: &mut Vec<ObjectId>,
    ) -> Result<bool, BtreeError> {
        let page = self.store.load(page_id)?;
        let n = page.n_items;
        let mut l = page.search(n, |item| scan.before_start(item));

        if height == 1 {
            while l < n {
                if scan.past_end(page.key_at(l)?) {
                    return Ok(false);
                }
                out.push(ObjectId(page.items[l]));
                l += 1;
            }
            return Ok(true);
        }

        loop {
            if !self.find(page.items[l], scan, height - 1, out)? {
                return Ok(false);
            }
            if l == n {
                return Ok(true);
            }
            if scan.past_end(page.key_at(l)?) {
                return Ok(false);
            }
            l += 1;
        }
    }

    /// Free every page and reset to empty. The index stays usable.
    pub fn clear(&mut self) -> Result<(), BtreeError> {
        if self.root != 0 {
            self.purge(self.root, self.height)?;
            self.root = 0;
            self.height = 0;
            self.element_count = 0;
            self.update_counter += 1;
        }
        Ok(())
    }

    /// Free every page of the index.
    pub fn deallocate(mut self) -> Result<(), BtreeError> {
        self.clear()
    }

    fn purge(&self, page_id: PageId, height: u32) -> Result<(), BtreeError> {
        let page = self.store.load(page_id)?;
        if height > 1 {
            for &child in &page.items[..=page.n_items] {
                self.purge(child, height - 1)?;
            }
        }
        self.store.free(page_id, page);
        Ok(())
    }

    /// A cursor over the entries between two bounds.
    pub fn cursor(
        &self,
        from: Option<Bound>,
        till: Option<Bound>,
        order: IterationOrder,
    ) -> Result<Cursor, BtreeError> {
        for bound in from.iter().chain(till.iter()) {
            self.check_key(&bound.key)?;
        }
        Cursor::new(self, from, till, None, order)
    }

    /// A cursor over every entry.
    pub fn cursor_all(&self, order: IterationOrder) -> Result<Cursor, BtreeError> {
        Cursor::new(self, None, None, None, order)
    }

    /// An ascending cursor over the entries whose key starts with `prefix`.
    pub fn prefix_cursor(&self, prefix: impl Into<Key>) -> Result<Cursor, BtreeError> {
        let prefix = prefix.into();
        self.check_prefix(&prefix)?;
        Cursor::new(
            self,
            Some(Bound::inclusive(prefix.clone())),
            None,
            Some(prefix),
            IterationOrder::Ascending,
        )
    }

    /// Iterate over every entry in ascending key order.
    pub fn entries(&self) -> Result<Entries<'_>, BtreeError> {
        Ok(Entries::new(self, self.cursor_all(IterationOrder::Ascending)?))
    }
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("meta", &self.meta())
            .field("update_counter", &self.update_counter)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur in index operations.
#[derive(Debug)]
pub enum BtreeError {
    /// A key's type does not match the index.
    IncompatibleKeyType { expected: KeyType, actual: KeyType },
    /// A unique index already holds the key, or a lookup matched several
    /// entries, or a unique-only operation was used on a non-unique index.
    KeyNotUnique,
    /// No entry matched.
    KeyNotFound,
    /// The key type tag is not one the index supports.
    UnsupportedIndexType(u8),
    /// The tree changed since the cursor was positioned.
    StaleCursor,
    /// A page capacity outside the supported range.
    InvalidPageCapacity(usize),
    /// Page decoding error.
    Node(NodeError),
    /// Page pool error.
    Pool(PoolError),
}

impl std::fmt::Display for BtreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncompatibleKeyType { expected, actual } => {
                write!(f, "incompatible key type: expected {expected}, got {actual}")
            }
            Self::KeyNotUnique => write!(f, "key is not unique"),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::UnsupportedIndexType(tag) => write!(f, "unsupported index key type: {tag}"),
            Self::StaleCursor => write!(f, "cursor used after the index was modified"),
            Self::InvalidPageCapacity(n) => write!(f, "invalid page capacity: {n}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Pool(e) => write!(f, "pool error: {e}"),
        }
    }
}

impl std::error::Error for BtreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Node(e) => Some(e),
            Self::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NodeError> for BtreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<PoolError> for BtreeError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_index, small_index, small_index_bounded};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn ids(values: &[u64]) -> Vec<ObjectId> {
        values.iter().copied().map(ObjectId).collect()
    }

    /// Walk the whole tree checking ordering, occupancy and depth.
    /// Returns the number of entries.
    fn check_invariants(tree: &Btree) -> u64 {
        fn walk(
            tree: &Btree,
            page_id: PageId,
            height: u32,
            is_root: bool,
            upper: Option<&Key>,
        ) -> u64 {
            let page = tree.store().load(page_id).expect("load page");
            let max = page.max_items();
            assert_eq!(page.is_leaf(), height == 1, "leaf at wrong depth");
            for i in 1..page.n_items {
                let prev = page.key(i - 1).expect("key");
                let next = page.key(i).expect("key");
                assert_ne!(prev.compare(next), Ordering::Greater, "keys out of order");
            }
            if let (Some(upper), Some(last)) = (upper, page.n_items.checked_sub(1)) {
                let last = page.key(last).expect("key");
                assert_ne!(last.compare(upper), Ordering::Greater, "key above separator");
            }
            if height == 1 {
                if !is_root {
                    assert!(page.n_items >= max / 2, "leaf underfull: {}", page.n_items);
                }
                assert!(page.n_items <= max);
                return page.n_items as u64;
            }
            if !is_root {
                assert!(page.n_items + 1 >= max / 2, "internal underfull: {}", page.n_items);
            }
            assert!(page.n_items < max);
            (0..=page.n_items)
                .map(|i| {
                    let bound = if i < page.n_items { page.key(i) } else { upper };
                    walk(tree, page.items[i], height - 1, false, bound)
                })
                .sum()
        }

        if tree.root() == 0 {
            assert_eq!(tree.height(), 0);
            return 0;
        }
        let count = walk(tree, tree.root(), tree.height(), true, None);
        assert_eq!(count, tree.len());
        count
    }

    #[test]
    fn test_insert_and_scan_order() {
        let mut tree = memory_index(KeyType::I32, true);
        for k in [5, 3, 8, 1, 9, 2, 7] {
            tree.insert(k, ObjectId(k as u64)).expect("insert");
        }

        assert_eq!(tree.to_vec().expect("scan"), ids(&[1, 2, 3, 5, 7, 8, 9]));

        let descending: Vec<u64> = {
            let mut cursor = tree.cursor_all(IterationOrder::Descending).expect("cursor");
            let mut out = Vec::new();
            while let Some((_, value)) = cursor.next(&tree).expect("next") {
                out.push(value.0);
            }
            out
        };
        assert_eq!(descending, vec![9, 8, 7, 5, 3, 2, 1]);
    }

    #[test]
    fn test_get_returns_latest_value() {
        let mut tree = memory_index(KeyType::I64, true);
        tree.insert(10i64, ObjectId(1)).expect("insert");
        assert_eq!(tree.set(10i64, ObjectId(2)).expect("set"), Some(ObjectId(1)));
        assert_eq!(tree.set(11i64, ObjectId(3)).expect("set new"), None);

        assert_eq!(tree.get(10i64).expect("get"), Some(ObjectId(2)));
        assert_eq!(tree.get(11i64).expect("get"), Some(ObjectId(3)));
        assert_eq!(tree.get(12i64).expect("get"), None);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_unique_duplicate_rejected_without_change() {
        let mut tree = memory_index(KeyType::U16, true);
        tree.insert(7u16, ObjectId(1)).expect("insert");
        let counter = tree.update_counter();

        assert!(matches!(
            tree.insert(7u16, ObjectId(2)),
            Err(BtreeError::KeyNotUnique)
        ));
        assert_eq!(tree.get(7u16).expect("get"), Some(ObjectId(1)));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.update_counter(), counter);
    }

    #[test]
    fn test_incompatible_key_type() {
        let mut tree = memory_index(KeyType::I32, true);
        assert!(matches!(
            tree.insert(1i64, ObjectId(1)),
            Err(BtreeError::IncompatibleKeyType {
                expected: KeyType::I32,
                actual: KeyType::I64
            })
        ));
        assert!(tree.is_empty());
        assert!(matches!(
            tree.prefix_search(1i32),
            Err(BtreeError::IncompatibleKeyType { .. })
        ));
    }

    #[test]
    fn test_non_unique_equal_keys() {
        let mut tree = small_index(KeyType::I32, false, 4);
        for v in 0..40u64 {
            tree.insert(7, ObjectId(v)).expect("insert");
            tree.insert(3, ObjectId(100 + v)).expect("insert other");
        }
        check_invariants(&tree);

        let exact = Bound::inclusive(7);
        let mut found = tree.range(Some(&exact), Some(&exact)).expect("range");
        found.sort();
        assert_eq!(found, (0..40).map(ObjectId).collect::<Vec<_>>());
        assert!(matches!(tree.get(7), Err(BtreeError::KeyNotUnique)));
        assert!(matches!(tree.remove(7), Err(BtreeError::KeyNotUnique)));
    }

    #[test]
    fn test_remove_entry_with_equal_keys_across_pages() {
        let mut tree = small_index(KeyType::I32, false, 4);
        for v in 0..30u64 {
            tree.insert(1, ObjectId(v)).expect("insert");
        }
        for v in (0..30u64).rev().step_by(2) {
            tree.remove_entry(1, ObjectId(v)).expect("remove entry");
            check_invariants(&tree);
        }
        assert_eq!(tree.len(), 15);
        assert!(matches!(
            tree.remove_entry(1, ObjectId(29)),
            Err(BtreeError::KeyNotFound)
        ));

        let mut rest = tree.to_vec().expect("scan");
        rest.sort();
        assert_eq!(rest, (0..30).step_by(2).map(ObjectId).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_missing_key_leaves_tree_unchanged() {
        let mut tree = small_index(KeyType::I32, true, 4);
        for k in 0..50 {
            tree.insert(k * 2, ObjectId(k as u64)).expect("insert");
        }
        let before = tree.to_vec().expect("scan");
        let meta = tree.meta();

        assert!(matches!(tree.remove(7), Err(BtreeError::KeyNotFound)));
        assert!(matches!(tree.remove(1000), Err(BtreeError::KeyNotFound)));

        assert_eq!(tree.to_vec().expect("scan"), before);
        assert_eq!(tree.meta(), meta);
    }

    #[test]
    fn test_insert_then_remove_restores_empty() {
        let mut tree = memory_index(KeyType::F64, true);
        tree.insert(1.5f64, ObjectId(9)).expect("insert");
        assert_eq!(tree.height(), 1);

        assert_eq!(tree.remove(1.5f64).expect("remove"), ObjectId(9));
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.meta().root, 0);
        assert!(matches!(tree.remove(1.5f64), Err(BtreeError::KeyNotFound)));
    }

    #[test]
    fn test_splits_and_merges_keep_invariants() {
        let mut tree = small_index(KeyType::I64, true, 5);
        let mut rng = StdRng::seed_from_u64(42);
        let mut model = std::collections::BTreeMap::new();

        for _ in 0..2000 {
            let k: i64 = rng.random_range(0..300);
            if rng.random::<f64>() < 0.6 {
                let v = rng.random_range(0..1_000_000u64);
                let old = tree.set(k, ObjectId(v)).expect("set");
                assert_eq!(old, model.insert(k, v).map(ObjectId));
            } else {
                match model.remove(&k) {
                    Some(v) => assert_eq!(tree.remove(k).expect("remove"), ObjectId(v)),
                    None => assert!(matches!(tree.remove(k), Err(BtreeError::KeyNotFound))),
                }
            }
        }

        assert_eq!(check_invariants(&tree), model.len() as u64);
        assert_eq!(
            tree.to_vec().expect("scan"),
            model.values().copied().map(ObjectId).collect::<Vec<_>>()
        );
        for k in model.keys().copied().collect::<Vec<_>>() {
            tree.remove(k).expect("drain");
        }
        assert_eq!(tree.height(), 0);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_bounded_pool_non_unique_strings() {
        let mut tree = small_index_bounded(KeyType::String, false, 4, 3);
        let mut rng = StdRng::seed_from_u64(7);
        let mut model: Vec<(String, u64)> = Vec::new();

        for value in 0..3000u64 {
            if model.is_empty() || rng.random::<f64>() < 0.6 {
                let key = format!("key-{:02}", rng.random_range(0..40u32));
                tree.insert(key.as_str(), ObjectId(value)).expect("insert");
                model.push((key, value));
            } else {
                let (key, value) = model.swap_remove(rng.random_range(0..model.len()));
                tree.remove_entry(key.as_str(), ObjectId(value))
                    .expect("remove entry");
            }
        }

        assert_eq!(check_invariants(&tree), model.len() as u64);
        assert_eq!(tree.store().pool().pinned_count(), 0);
        assert!(tree.store().pool().stats().evictions > 0);

        let mut entries: Vec<(String, u64)> = tree
            .entries()
            .expect("entries")
            .map(|entry| {
                let (key, value) = entry.expect("entry");
                let Key::String(key) = key else {
                    panic!("unexpected key type");
                };
                (key, value.0)
            })
            .collect();
        let keys: Vec<&String> = entries.iter().map(|(key, _)| key).collect();
        assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]), "keys out of order");
        entries.sort();
        model.sort();
        assert_eq!(entries, model);

        for k in 0..40u32 {
            let key = format!("key-{k:02}");
            let want = model.iter().filter(|(m, _)| *m == key).count();
            let exact = Bound::inclusive(key.as_str());
            let found = tree.range(Some(&exact), Some(&exact)).expect("range");
            assert_eq!(found.len(), want, "range {key}");

            let mut cursor = tree
                .cursor(
                    Some(Bound::inclusive(key.as_str())),
                    Some(Bound::inclusive(key.as_str())),
                    IterationOrder::Descending,
                )
                .expect("cursor");
            let mut seen = 0;
            while cursor.next(&tree).expect("next").is_some() {
                seen += 1;
            }
            assert_eq!(seen, want, "descending cursor {key}");
        }
        assert_eq!(tree.store().pool().pinned_count(), 0);
    }

    #[test]
    fn test_single_frame_pool() {
        let mut tree = small_index_bounded(KeyType::String, true, 4, 1);
        for i in 0..200u64 {
            tree.insert(format!("entry-{i:03}").as_str(), ObjectId(i))
                .expect("insert");
        }
        check_invariants(&tree);
        assert_eq!(tree.get("entry-123").expect("get"), Some(ObjectId(123)));
        for i in (0..200u64).step_by(2) {
            tree.remove(format!("entry-{i:03}").as_str()).expect("remove");
        }
        assert_eq!(
            tree.to_vec().expect("scan"),
            (1..200).step_by(2).map(ObjectId).collect::<Vec<_>>()
        );
        assert_eq!(tree.store().pool().pinned_count(), 0);
    }

    #[test]
    fn test_deep_tree_with_even_capacity() {
        let mut tree = small_index(KeyType::I32, true, 4);
        for k in 0..500 {
            tree.insert(k, ObjectId(k as u64)).expect("insert");
            check_invariants(&tree);
        }
        assert!(tree.height() >= 5);

        for k in (0..500).filter(|k| k % 3 != 0) {
            tree.remove(k).expect("remove");
            check_invariants(&tree);
        }
        let expected: Vec<ObjectId> = (0..500).step_by(3).map(ObjectId).collect();
        assert_eq!(tree.to_vec().expect("scan"), expected);
    }

    #[test]
    fn test_range_bounds_at_page_boundaries() {
        let mut tree = small_index(KeyType::U32, true, 4);
        for k in 0..100u32 {
            tree.insert(k, ObjectId(u64::from(k))).expect("insert");
        }

        for lo in [0u32, 1, 2, 3, 4, 15, 16, 17, 63, 98, 99] {
            for hi in [lo, lo + 1, lo + 2, lo + 5, 99] {
                let from = Bound::inclusive(lo);
                let till = Bound::exclusive(hi);
                let got = tree.range(Some(&from), Some(&till)).expect("range");
                let want: Vec<ObjectId> =
                    (lo..hi.min(100)).map(|k| ObjectId(u64::from(k))).collect();
                assert_eq!(got, want, "[{lo}, {hi})");

                let from = Bound::exclusive(lo);
                let till = Bound::inclusive(hi);
                let got = tree.range(Some(&from), Some(&till)).expect("range");
                let want: Vec<ObjectId> =
                    (lo + 1..=hi.min(99)).map(|k| ObjectId(u64::from(k))).collect();
                assert_eq!(got, want, "({lo}, {hi}]");
            }
        }

        let above = Bound::inclusive(150u32);
        assert!(tree.range(Some(&above), None).expect("range").is_empty());
        let below = Bound::exclusive(0u32);
        assert!(tree.range(None, Some(&below)).expect("range").is_empty());
    }

    #[test]
    fn test_prefix_search() {
        let mut tree = memory_index(KeyType::String, true);
        for (i, s) in ["ab", "abc", "abd", "b", "a"].into_iter().enumerate() {
            tree.insert(s, ObjectId(i as u64)).expect("insert");
        }

        assert_eq!(tree.prefix_search("ab").expect("prefix"), ids(&[0, 1, 2]));
        assert_eq!(tree.prefix_search("abc").expect("prefix"), ids(&[1]));
        assert_eq!(tree.prefix_search("").expect("prefix").len(), 5);
        assert!(tree.prefix_search("c").expect("prefix").is_empty());
    }

    #[test]
    fn test_prefix_search_across_pages() {
        let mut tree = small_index(KeyType::String, false, 4);
        let words = ["car", "cart", "carton", "cat", "ca", "cab", "dog", "carp", "c"];
        for (i, word) in words.iter().enumerate() {
            tree.insert(*word, ObjectId(i as u64)).expect("insert");
        }
        check_invariants(&tree);

        let mut got = tree.prefix_search("car").expect("prefix");
        got.sort();
        assert_eq!(got, ids(&[0, 1, 2, 7]));
    }

    #[test]
    fn test_string_keys_survive_page_moves() {
        let mut tree = small_index(KeyType::String, true, 4);
        let keys: Vec<String> = (0..200).map(|i| format!("key-{i:04}")).collect();
        for (i, key) in keys.iter().enumerate() {
            tree.insert(key.as_str(), ObjectId(i as u64)).expect("insert");
        }
        for key in keys.iter().step_by(2) {
            tree.remove(key.as_str()).expect("remove");
        }
        check_invariants(&tree);

        for (i, key) in keys.iter().enumerate() {
            let want = (i % 2 == 1).then_some(ObjectId(i as u64));
            assert_eq!(tree.get(key.as_str()).expect("get"), want, "{key}");
        }
    }

    #[test]
    fn test_extreme_integer_keys_order() {
        let mut tree = memory_index(KeyType::I64, true);
        for (i, k) in [i64::MAX, 0, i64::MIN, -1, 1].into_iter().enumerate() {
            tree.insert(k, ObjectId(i as u64)).expect("insert");
        }
        assert_eq!(tree.to_vec().expect("scan"), ids(&[2, 3, 1, 4, 0]));
    }

    #[test]
    fn test_float_keys_with_nan() {
        let mut tree = memory_index(KeyType::F32, true);
        tree.insert(f32::NAN, ObjectId(1)).expect("insert nan");
        tree.insert(f32::INFINITY, ObjectId(2)).expect("insert inf");
        tree.insert(-0.5f32, ObjectId(3)).expect("insert");

        assert_eq!(tree.to_vec().expect("scan"), ids(&[3, 2, 1]));
        assert_eq!(tree.get(f32::NAN).expect("get nan"), Some(ObjectId(1)));
    }

    #[test]
    fn test_clear_frees_pages() {
        let mut tree = small_index(KeyType::String, true, 4);
        for i in 0..100 {
            tree.insert(format!("entry {i}").as_str(), ObjectId(i)).expect("insert");
        }
        tree.clear().expect("clear");
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);

        tree.insert("again", ObjectId(1)).expect("insert after clear");
        assert_eq!(tree.get("again").expect("get"), Some(ObjectId(1)));
        tree.deallocate().expect("deallocate");
    }

    #[test]
    fn test_meta_roundtrip_and_reopen() {
        let mut tree = small_index(KeyType::Guid, true, 6);
        for i in 0..50u8 {
            tree.insert(Key::Guid([i; 16]), ObjectId(u64::from(i))).expect("insert");
        }
        let meta = tree.meta();
        let decoded = IndexMeta::from_bytes(&meta.to_bytes()).expect("decode meta");
        assert_eq!(decoded, meta);

        let reopened = Btree::open(
            Arc::clone(tree.store().pool()),
            Arc::clone(tree.store().allocator()),
            decoded,
        )
        .expect("reopen");
        assert_eq!(reopened.get(Key::Guid([7; 16])).expect("get"), Some(ObjectId(7)));
        assert_eq!(reopened.len(), 50);
    }

    #[test]
    fn test_invalid_meta_and_capacity() {
        let mut bytes = [0u8; IndexMeta::SIZE];
        bytes[20] = 99;
        assert!(matches!(
            IndexMeta::from_bytes(&bytes),
            Err(BtreeError::UnsupportedIndexType(99))
        ));

        let pool = crate::testing::memory_pool(0);
        let allocator: Arc<dyn Allocator> = Arc::new(crate::storage::PageAllocator::new(8));
        assert!(matches!(
            Btree::create_with_capacity(pool, allocator, KeyType::I32, true, 3),
            Err(BtreeError::InvalidPageCapacity(3))
        ));
    }
}
