//! The 100-byte database file header.
//!
//! All multi-byte fields are big-endian. Layout:
//!
//! ```text
//! offset  size  field
//!      0    16  magic: "SQLite format 3\0"
//!     16     2  page size (1 means 65536)
//!     18     1  file format write version
//!     19     1  file format read version
//!     20     1  reserved bytes per page
//!     21     1  max embedded payload fraction (64)
//!     22     1  min embedded payload fraction (32)
//!     23     1  leaf payload fraction (32)
//!     24     4  file change counter
//!     28     4  database size in pages
//!     32     4  first freelist trunk page
//!     36     4  freelist page count
//!     40     4  schema cookie
//!     44     4  schema format number
//!     48     4  default page cache size
//!     52     4  largest root b-tree page (nonzero in auto-vacuum files)
//!     56     4  text encoding (1 UTF-8, 2 UTF-16LE, 3 UTF-16BE)
//!     60     4  user version
//!     64     4  incremental-vacuum mode
//!     68     4  application id
//!     72    20  reserved for expansion
//!     92     4  version-valid-for number
//!     96     4  SQLITE_VERSION_NUMBER
//! ```

use exhume_error::{ExhumeError, Result};
use exhume_types::TextEncoding;
use exhume_types::serial_type::be_u32;
use tracing::warn;

/// Size of the file header on page 1.
pub const DB_HEADER_SIZE: usize = 100;

/// The 16-byte magic string identifying the format.
pub const MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Parsed database file header.
#[derive(Debug, Clone)]
pub struct DbHeader {
    /// Page size in bytes; a power of two in [512, 65536].
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    /// Reserved bytes at the end of every page.
    pub reserved_bytes: u8,
    pub max_payload_fraction: u8,
    pub min_payload_fraction: u8,
    pub leaf_payload_fraction: u8,
    pub file_change_counter: u32,
    /// Database size in pages as recorded in the header. May be stale in
    /// files written by very old library versions; see [`Pager`].
    ///
    /// [`Pager`]: crate::pager::Pager
    pub page_count: u32,
    /// First free-list trunk page, or `None` when the free list is empty.
    pub first_freelist_trunk: u32,
    pub freelist_page_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: u32,
    /// Page number of the largest root b-tree page; nonzero iff the file
    /// uses auto-vacuum (and therefore carries pointer-map pages).
    pub largest_root_btree_page: u32,
    pub text_encoding: TextEncoding,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub sqlite_version_number: u32,
}

impl DbHeader {
    /// Parse and validate the first 100 bytes of the file.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < DB_HEADER_SIZE {
            return Err(ExhumeError::bad_file_header(format!(
                "file holds only {} bytes, header needs {}",
                buf.len(),
                DB_HEADER_SIZE
            )));
        }
        if &buf[0..16] != MAGIC {
            return Err(ExhumeError::NotADatabase {
                path: std::path::PathBuf::new(),
            });
        }

        let raw_page_size = u32::from(u16::from_be_bytes([buf[16], buf[17]]));
        let page_size = if raw_page_size == 1 {
            65536
        } else {
            raw_page_size
        };
        if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(ExhumeError::UnsupportedPageSize { size: raw_page_size });
        }

        let reserved_bytes = buf[20];
        if page_size - u32::from(reserved_bytes) < 480 {
            return Err(ExhumeError::bad_file_header(format!(
                "usable page size {} below the format minimum of 480",
                page_size - u32::from(reserved_bytes)
            )));
        }

        let max_payload_fraction = buf[21];
        let min_payload_fraction = buf[22];
        let leaf_payload_fraction = buf[23];
        if (max_payload_fraction, min_payload_fraction, leaf_payload_fraction) != (64, 32, 32) {
            // The format fixes these; other values mean a damaged or
            // exotic file. Recovery can proceed on the standard values.
            warn!(
                max = max_payload_fraction,
                min = min_payload_fraction,
                leaf = leaf_payload_fraction,
                "nonstandard payload fractions in header"
            );
        }

        let text_encoding_raw = be_u32(buf, 56)?;
        let text_encoding = TextEncoding::from_header_value(text_encoding_raw).ok_or_else(|| {
            ExhumeError::bad_file_header(format!("unknown text encoding {text_encoding_raw}"))
        })?;

        Ok(Self {
            page_size,
            write_version: buf[18],
            read_version: buf[19],
            reserved_bytes,
            max_payload_fraction,
            min_payload_fraction,
            leaf_payload_fraction,
            file_change_counter: be_u32(buf, 24)?,
            page_count: be_u32(buf, 28)?,
            first_freelist_trunk: be_u32(buf, 32)?,
            freelist_page_count: be_u32(buf, 36)?,
            schema_cookie: be_u32(buf, 40)?,
            schema_format: be_u32(buf, 44)?,
            default_cache_size: be_u32(buf, 48)?,
            largest_root_btree_page: be_u32(buf, 52)?,
            text_encoding,
            user_version: be_u32(buf, 60)?,
            incremental_vacuum: be_u32(buf, 64)?,
            application_id: be_u32(buf, 68)?,
            version_valid_for: be_u32(buf, 92)?,
            sqlite_version_number: be_u32(buf, 96)?,
        })
    }

    /// Usable bytes per page: `page_size - reserved_bytes`.
    #[must_use]
    pub const fn usable_size(&self) -> u32 {
        self.page_size - self.reserved_bytes as u32
    }

    /// Whether the file uses auto-vacuum and therefore carries ptrmap pages.
    #[must_use]
    pub const fn is_autovacuum(&self) -> bool {
        self.largest_root_btree_page != 0
    }
}
