//! Superblock structure and serialization.
//!
//! The superblock occupies page 0 and records where the allocator snapshot
//! lives plus an opaque slot for the root index descriptor.

// PAGE_SIZE is a compile-time constant that fits in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{PAGE_SIZE, Page, PageId};

/// Magic number identifying a store file: "PGSTORE1"
pub const MAGIC: [u8; 8] = *b"PGSTORE1";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Bytes reserved for the root index descriptor.
pub const ROOT_INDEX_SIZE: usize = 32;

/// Page size as u32 for storage in superblock.
const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;

/// Superblock field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const ALLOCATOR_PAGE: usize = 16;
    pub const ALLOCATOR_PAGES: usize = 24;
    pub const ALLOCATOR_LEN: usize = 32;
    pub const ROOT_INDEX: usize = 40;
    // 72-4095: reserved
}

/// The superblock contains all metadata about the store file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version number.
    pub format_version: u32,
    /// Page size in bytes (should always be `PAGE_SIZE`).
    pub page_size: u32,
    /// First page of the allocator snapshot, 0 if none was written yet.
    pub allocator_page: PageId,
    /// Pages reserved for the allocator snapshot.
    pub allocator_pages: u64,
    /// Length of the allocator snapshot in bytes.
    pub allocator_len: u64,
    /// Root index descriptor, all zeros when no root index is set.
    pub root_index: [u8; ROOT_INDEX_SIZE],
}

impl Superblock {
    /// Create a new superblock for a fresh store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: PAGE_SIZE_U32,
            allocator_page: 0,
            allocator_pages: 0,
            allocator_len: 0,
            root_index: [0u8; ROOT_INDEX_SIZE],
        }
    }

    /// Whether a root index descriptor has been recorded.
    #[must_use]
    pub fn has_root_index(&self) -> bool {
        self.root_index.iter().any(|&b| b != 0)
    }

    /// Serialize the superblock into a page.
    pub fn write_to_page(&self, page: &mut Page) {
        page.clear();
        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::PAGE_SIZE, self.page_size);
        page.write_u64(offsets::ALLOCATOR_PAGE, self.allocator_page);
        page.write_u64(offsets::ALLOCATOR_PAGES, self.allocator_pages);
        page.write_u64(offsets::ALLOCATOR_LEN, self.allocator_len);
        page.write_bytes(offsets::ROOT_INDEX, &self.root_index);
    }

    /// Deserialize a superblock from a page.
    pub fn from_page(page: &Page) -> Result<Self, SuperblockError> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(page.read_bytes(offsets::MAGIC, 8));
        if magic != MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let page_size = page.read_u32(offsets::PAGE_SIZE);
        if page_size != PAGE_SIZE_U32 {
            return Err(SuperblockError::InvalidPageSize(page_size));
        }

        let mut root_index = [0u8; ROOT_INDEX_SIZE];
        root_index.copy_from_slice(page.read_bytes(offsets::ROOT_INDEX, ROOT_INDEX_SIZE));

        Ok(Self {
            format_version,
            page_size,
            allocator_page: page.read_u64(offsets::ALLOCATOR_PAGE),
            allocator_pages: page.read_u64(offsets::ALLOCATOR_PAGES),
            allocator_len: page.read_u64(offsets::ALLOCATOR_LEN),
            root_index,
        })
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur when reading a superblock.
#[derive(Debug)]
pub enum SuperblockError {
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Invalid page size.
    InvalidPageSize(u32),
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
        }
    }
}

impl std::error::Error for SuperblockError {}
