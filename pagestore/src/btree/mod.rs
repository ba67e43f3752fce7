//! Typed B-tree indexes stored in pool pages.
//!
//! # Structure
//!
//! An index maps keys of one `KeyType` to `ObjectId`s. Pages are either
//! leaves, holding sorted (key, object id) entries, or internal pages,
//! holding separators and child page ids. Fixed-width keys live inside the
//! page; string and raw keys live in separately allocated blobs.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use pagestore::StoreConfig;
//! use pagestore::btree::{Btree, IterationOrder, Key, KeyType, ObjectId};
//! use pagestore::storage::{Allocator, MemoryFile, PageAllocator, PagePool};
//!
//! let pool = Arc::new(PagePool::new(Box::new(MemoryFile::new(0)), &StoreConfig::default()));
//! let allocator: Arc<dyn Allocator> = Arc::new(PageAllocator::new(64));
//! let mut index = Btree::create(pool, allocator, KeyType::String, true);
//!
//! index.insert("ab", ObjectId(1)).expect("insert");
//! index.insert("abc", ObjectId(2)).expect("insert");
//! index.insert("b", ObjectId(3)).expect("insert");
//!
//! assert_eq!(index.get("abc").expect("get"), Some(ObjectId(2)));
//! assert_eq!(index.prefix_search("ab").expect("prefix"), vec![ObjectId(1), ObjectId(2)]);
//!
//! let mut cursor = index.cursor_all(IterationOrder::Descending).expect("cursor");
//! let (key, value) = cursor.next(&index).expect("next").expect("entry");
//! assert_eq!(key, Key::from("b"));
//! assert_eq!(value, ObjectId(3));
//! ```

mod codec;
mod cursor;
mod key;
mod node;
mod pages;
mod tree;

pub use codec::BlobRef;
pub use cursor::{Cursor, Entries, IterationOrder};
pub use key::{Bound, Key, KeyType, ObjectId};
pub use node::{MIN_MAX_ITEMS, NODE_CAPACITY, NodeError, default_max_items};
pub use tree::{Btree, BtreeError, IndexMeta};
