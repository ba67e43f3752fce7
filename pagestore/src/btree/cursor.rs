//! Range cursors over an index.
//!
//! A `Cursor` is an external iterator: it keeps a stack of (page, position)
//! frames from the root down to the current leaf and takes the tree as an
//! argument on every step. No page stays pinned between steps; only the
//! decoded image of the current leaf is kept.
//!
//! # Invalidation
//!
//! A cursor records the tree's update counter when it is positioned. Any
//! later mutation makes `next` fail with `BtreeError::StaleCursor` until
//! the cursor is `reset`.
//!
//! Once a bound is passed the cursor is exhausted for good; it does not
//! pick up entries inserted later beyond its position.

use crate::btree::key::{Bound, Key, ObjectId};
use crate::btree::node::BtreePage;
use crate::btree::tree::{Btree, BtreeError};
use crate::storage::PageId;

/// Direction of iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    page_id: PageId,
    pos: usize,
    n_items: usize,
}

/// Position within a range of index entries.
#[derive(Debug)]
pub struct Cursor {
    /// Frames from the root to the current leaf; empty when exhausted.
    stack: Vec<Frame>,
    /// Image of the leaf at the top of the stack.
    leaf: Option<BtreePage>,
    from: Option<Bound>,
    till: Option<Bound>,
    prefix: Option<Key>,
    order: IterationOrder,
    generation: u64,
}

impl Cursor {
    pub(crate) fn new(
        tree: &Btree,
        from: Option<Bound>,
        till: Option<Bound>,
        prefix: Option<Key>,
        order: IterationOrder,
    ) -> Result<Self, BtreeError> {
        let mut cursor = Self {
            stack: Vec::new(),
            leaf: None,
            from,
            till,
            prefix,
            order,
            generation: tree.update_counter(),
        };
        cursor.seek(tree)?;
        Ok(cursor)
    }

    #[must_use]
    pub const fn order(&self) -> IterationOrder {
        self.order
    }

    /// Whether the cursor has no more entries to yield.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.leaf.is_none()
    }

    /// Reposition at the start of the range against the current tree.
    pub fn reset(&mut self, tree: &Btree) -> Result<(), BtreeError> {
        self.generation = tree.update_counter();
        self.seek(tree)
    }

    /// Yield the current entry and advance.
    ///
    /// # Errors
    ///
    /// - `BtreeError::StaleCursor` if the tree changed since the cursor was
    ///   positioned
    pub fn next(&mut self, tree: &Btree) -> Result<Option<(Key, ObjectId)>, BtreeError> {
        if self.generation != tree.update_counter() {
            return Err(BtreeError::StaleCursor);
        }
        let (Some(leaf), Some(frame)) = (&self.leaf, self.stack.last()) else {
            return Ok(None);
        };

        let entry = (leaf.key_at(frame.pos)?.clone(), ObjectId(leaf.items[frame.pos]));
        self.advance(tree)?;
        Ok(Some(entry))
    }

    fn exhaust(&mut self) {
        self.stack.clear();
        self.leaf = None;
    }

    /// Descend from the root to the first entry in iteration order.
    fn seek(&mut self, tree: &Btree) -> Result<(), BtreeError> {
        self.exhaust();
        if tree.height() == 0 {
            return Ok(());
        }

        let mut page_id = tree.root();
        for level in (1..=tree.height()).rev() {
            let page = tree.store().load(page_id)?;
            let n = page.n_items;
            let pos = match (self.order, &self.from, &self.till) {
                (IterationOrder::Ascending, None, _) => 0,
                (IterationOrder::Ascending, Some(from), _) => {
                    page.search(n, |item| from.is_below(item))
                }
                (IterationOrder::Descending, _, None) => n,
                (IterationOrder::Descending, _, Some(till)) => {
                    page.search(n, |item| !till.is_above(item))
                }
            };
            self.stack.push(Frame {
                page_id,
                pos,
                n_items: n,
            });
            if level == 1 {
                self.leaf = Some(page);
            } else {
                page_id = page.items[pos];
            }
        }

        // The leaf position is the first slot past the start of the range.
        let Some(frame) = self.stack.last_mut() else {
            return Ok(());
        };
        match self.order {
            IterationOrder::Ascending if frame.pos == frame.n_items => self.climb(tree)?,
            IterationOrder::Descending if frame.pos == 0 => self.climb(tree)?,
            IterationOrder::Descending => frame.pos -= 1,
            IterationOrder::Ascending => {}
        }
        self.check_end();
        Ok(())
    }

    /// Move to the next leaf entry in iteration order.
    fn advance(&mut self, tree: &Btree) -> Result<(), BtreeError> {
        let Some(frame) = self.stack.last_mut() else {
            return Ok(());
        };
        match self.order {
            IterationOrder::Ascending if frame.pos + 1 < frame.n_items => frame.pos += 1,
            IterationOrder::Descending if frame.pos > 0 => frame.pos -= 1,
            _ => self.climb(tree)?,
        }
        self.check_end();
        Ok(())
    }

    /// Leave the current leaf and descend into the next subtree, or
    /// exhaust the cursor when there is none.
    fn climb(&mut self, tree: &Btree) -> Result<(), BtreeError> {
        self.leaf = None;
        self.stack.pop();

        while let Some(top) = self.stack.last_mut() {
            let next = match self.order {
                IterationOrder::Ascending => (top.pos < top.n_items).then_some(top.pos + 1),
                IterationOrder::Descending => top.pos.checked_sub(1),
            };
            if let Some(pos) = next {
                top.pos = pos;
                let page = tree.store().load(top.page_id)?;
                let levels = tree.height() as usize - self.stack.len();
                return self.descend_edge(tree, page.items[pos], levels);
            }
            self.stack.pop();
        }
        Ok(())
    }

    /// Push the leftmost (ascending) or rightmost (descending) path of the
    /// subtree at `page_id`, which spans `levels` levels.
    fn descend_edge(
        &mut self,
        tree: &Btree,
        mut page_id: PageId,
        levels: usize,
    ) -> Result<(), BtreeError> {
        for level in (1..=levels).rev() {
            let page = tree.store().load(page_id)?;
            let n = page.n_items;
            let pos = match self.order {
                IterationOrder::Ascending => 0,
                IterationOrder::Descending if level == 1 => n.saturating_sub(1),
                IterationOrder::Descending => n,
            };
            self.stack.push(Frame {
                page_id,
                pos,
                n_items: n,
            });
            if level == 1 {
                self.leaf = Some(page);
            } else {
                page_id = page.items[pos];
            }
        }
        Ok(())
    }

    /// Exhaust the cursor if the current entry lies beyond the range.
    fn check_end(&mut self) {
        let (Some(leaf), Some(frame)) = (&self.leaf, self.stack.last()) else {
            return;
        };
        let Some(key) = leaf.key(frame.pos) else {
            self.exhaust();
            return;
        };
        let past = match self.order {
            IterationOrder::Ascending => {
                self.till.as_ref().is_some_and(|till| till.is_above(Some(key)))
                    || self.prefix.as_ref().is_some_and(|prefix| !key.starts_with(prefix))
            }
            IterationOrder::Descending => {
                self.from.as_ref().is_some_and(|from| from.is_below(Some(key)))
            }
        };
        if past {
            self.exhaust();
        }
    }
}

/// Borrowing iterator over a cursor's entries.
///
/// The shared borrow of the tree rules out mutation while iterating.
pub struct Entries<'a> {
    tree: &'a Btree,
    cursor: Cursor,
}

impl<'a> Entries<'a> {
    #[must_use]
    pub const fn new(tree: &'a Btree, cursor: Cursor) -> Self {
        Self { tree, cursor }
    }
}

impl Iterator for Entries<'_> {
    type Item = Result<(Key, ObjectId), BtreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.cursor.next(self.tree).transpose();
        if matches!(item, Some(Err(_))) {
            self.cursor.exhaust();
        }
        item
    }
}
