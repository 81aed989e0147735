//! B-tree page headers and table cell parsing.
//!
//! ```text
//! ┌──────────────────────────┐
//! │ Page header (8 or 12 B)  │  (12 for interior, 8 for leaf;
//! ├──────────────────────────┤   offset 100 on page 1)
//! │ Cell pointer array       │  (2 bytes per cell)
//! ├──────────────────────────┤
//! │ Unallocated space        │
//! ├──────────────────────────┤
//! │ Cell content area        │  (grows down from the page end)
//! ├──────────────────────────┤
//! │ Reserved region          │
//! └──────────────────────────┘
//! ```

use exhume_error::{ExhumeError, Result};
use exhume_types::PageNumber;
use exhume_types::serial_type::{be_u16, be_u32, read_varint};

use crate::header::DB_HEADER_SIZE;

/// Size of the page header on leaf pages.
pub const LEAF_HEADER_SIZE: usize = 8;
/// Size of the page header on interior pages.
pub const INTERIOR_HEADER_SIZE: usize = 12;

/// The four B-tree page types, identified by the flag byte at the start
/// of the page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    IndexInterior = 0x02,
    TableInterior = 0x05,
    IndexLeaf = 0x0A,
    TableLeaf = 0x0D,
}

impl PageType {
    /// Parse a page type from the flag byte.
    #[must_use]
    pub const fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0x02 => Some(Self::IndexInterior),
            0x05 => Some(Self::TableInterior),
            0x0A => Some(Self::IndexLeaf),
            0x0D => Some(Self::TableLeaf),
            _ => None,
        }
    }

    /// Whether this is an interior (non-leaf) page.
    #[must_use]
    pub const fn is_interior(self) -> bool {
        matches!(self, Self::IndexInterior | Self::TableInterior)
    }

    /// Whether this is a table (rowid-keyed) page.
    #[must_use]
    pub const fn is_table(self) -> bool {
        matches!(self, Self::TableInterior | Self::TableLeaf)
    }

    /// Page header size for this type.
    #[must_use]
    pub const fn header_size(self) -> usize {
        if self.is_interior() {
            INTERIOR_HEADER_SIZE
        } else {
            LEAF_HEADER_SIZE
        }
    }
}

/// Byte offset of the B-tree page header within a page: 100 on page 1
/// (after the file header), 0 everywhere else.
#[must_use]
pub const fn btree_header_offset(page_no: PageNumber) -> usize {
    if page_no.get() == 1 { DB_HEADER_SIZE } else { 0 }
}

/// Parsed B-tree page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreePageHeader {
    pub page_type: PageType,
    /// Offset of the first freeblock on the page, 0 when there are none.
    pub first_freeblock: u16,
    pub cell_count: u16,
    /// Start of the cell content area. The on-disk value 0 means 65536.
    pub cell_content_start: u32,
    pub fragmented_free_bytes: u8,
    /// Right-most child, present on interior pages only.
    pub right_child: Option<PageNumber>,
}

impl BtreePageHeader {
    /// Parse the page header found at `header_offset` in `page`.
    pub fn parse(page: &[u8], header_offset: usize) -> Result<Self> {
        let remaining = page.len().saturating_sub(header_offset);
        if remaining < LEAF_HEADER_SIZE {
            return Err(ExhumeError::Truncated {
                needed: LEAF_HEADER_SIZE,
                available: remaining,
            });
        }
        let h = &page[header_offset..];

        let page_type = PageType::from_flag(h[0]).ok_or_else(|| {
            ExhumeError::bad_page_header(format!("invalid page type flag {:#04x}", h[0]))
        })?;

        let first_freeblock = be_u16(h, 1)?;
        let cell_count = be_u16(h, 3)?;
        let raw_content_start = be_u16(h, 5)?;
        let cell_content_start = if raw_content_start == 0 {
            65536
        } else {
            u32::from(raw_content_start)
        };
        let fragmented_free_bytes = h[7];

        let right_child = if page_type.is_interior() {
            if remaining < INTERIOR_HEADER_SIZE {
                return Err(ExhumeError::Truncated {
                    needed: INTERIOR_HEADER_SIZE,
                    available: remaining,
                });
            }
            let raw = be_u32(h, 8)?;
            Some(PageNumber::new(raw).ok_or_else(|| {
                ExhumeError::bad_page_header("interior page has zero right-child")
            })?)
        } else {
            None
        };

        Ok(Self {
            page_type,
            first_freeblock,
            cell_count,
            cell_content_start,
            fragmented_free_bytes,
            right_child,
        })
    }

    /// Read the cell pointer array that follows this header.
    ///
    /// Offsets are returned in array order (not sorted). Pointers that
    /// fall outside the page are dropped rather than failing the page.
    pub fn cell_pointers(&self, page: &[u8], header_offset: usize) -> Result<Vec<u16>> {
        let array_start = header_offset + self.page_type.header_size();
        let mut pointers = Vec::with_capacity(self.cell_count as usize);
        for i in 0..self.cell_count as usize {
            let ptr = be_u16(page, array_start + 2 * i)?;
            if (ptr as usize) < page.len() {
                pointers.push(ptr);
            }
        }
        Ok(pointers)
    }

    /// Offset of the first byte past the cell pointer array.
    #[must_use]
    pub const fn cell_pointer_array_end(&self, header_offset: usize) -> usize {
        header_offset + self.page_type.header_size() + 2 * self.cell_count as usize
    }
}

// ---------------------------------------------------------------------------
// Local payload split
// ---------------------------------------------------------------------------

/// How a table-leaf cell's payload is split between the page and an
/// overflow chain.
///
/// With usable size U and payload size P: let X = U - 35. If P ≤ X the
/// payload is entirely local. Otherwise let M = ((U-12)·32/255) - 23 and
/// K = M + (P - M) mod (U - 4); the local portion is K if K ≤ X, else M.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPayload {
    /// Bytes stored on the leaf page itself.
    pub local: usize,
    /// Whether a 4-byte overflow page pointer follows the local bytes.
    pub overflows: bool,
}

impl LocalPayload {
    /// Compute the split for a table-leaf cell.
    #[must_use]
    pub fn for_table_leaf(usable_size: u32, payload_len: u64) -> Self {
        let u = u64::from(usable_size);
        let x = u - 35;
        if payload_len <= x {
            return Self {
                local: payload_len as usize,
                overflows: false,
            };
        }
        let m = (u - 12) * 32 / 255 - 23;
        let k = m + (payload_len - m) % (u - 4);
        let local = if k <= x { k } else { m };
        Self {
            local: local as usize,
            overflows: true,
        }
    }

    /// The overflow threshold X = U - 35 for table leaves: payloads at or
    /// under this size are always fully local.
    #[must_use]
    pub const fn table_leaf_threshold(usable_size: u32) -> u64 {
        usable_size as u64 - 35
    }
}

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// A parsed table-leaf cell: `(payload_len varint, rowid varint,
/// payload[..local], [first_overflow u32])`.
#[derive(Debug, Clone)]
pub struct TableLeafCell {
    pub rowid: i64,
    /// Total payload size, including any overflow portion.
    pub payload_len: u64,
    /// Range of the local payload bytes within the page.
    pub local_payload: std::ops::Range<usize>,
    /// First overflow page, present iff the payload spills.
    pub first_overflow: Option<PageNumber>,
}

impl TableLeafCell {
    /// Parse the cell starting at `offset` in `page`.
    #[allow(clippy::cast_possible_wrap)]
    pub fn parse(page: &[u8], offset: usize, usable_size: u32) -> Result<Self> {
        let tail = page.get(offset..).ok_or(ExhumeError::Truncated {
            needed: 1,
            available: 0,
        })?;
        let (payload_len, n1) = read_varint(tail)?;
        let (rowid, n2) = read_varint(&tail[n1..])?;
        let payload_start = offset + n1 + n2;

        let split = LocalPayload::for_table_leaf(usable_size, payload_len);
        let local_end = payload_start + split.local;
        if local_end > page.len() {
            return Err(ExhumeError::Truncated {
                needed: split.local,
                available: page.len().saturating_sub(payload_start),
            });
        }

        let first_overflow = if split.overflows {
            let raw = be_u32(page, local_end)?;
            PageNumber::new(raw)
        } else {
            None
        };

        Ok(Self {
            rowid: varint_to_rowid(rowid),
            payload_len,
            local_payload: payload_start..local_end,
            first_overflow,
        })
    }
}

/// Rowids are varint-encoded two's-complement i64 values.
#[allow(clippy::cast_possible_wrap)]
const fn varint_to_rowid(raw: u64) -> i64 {
    raw as i64
}

/// A parsed table-interior cell: `(left_child u32, rowid varint)`.
#[derive(Debug, Clone, Copy)]
pub struct TableInteriorCell {
    pub left_child: PageNumber,
    pub rowid: i64,
}

impl TableInteriorCell {
    /// Parse the cell starting at `offset` in `page`.
    #[allow(clippy::cast_possible_wrap)]
    pub fn parse(page: &[u8], offset: usize) -> Result<Self> {
        let raw_child = be_u32(page, offset)?;
        let left_child = PageNumber::new(raw_child)
            .ok_or_else(|| ExhumeError::bad_page_header("interior cell has zero child"))?;
        let tail = page.get(offset + 4..).ok_or(ExhumeError::Truncated {
            needed: 1,
            available: 0,
        })?;
        let (rowid, _) = read_varint(tail)?;
        Ok(Self {
            left_child,
            rowid: rowid as i64,
        })
    }
}
