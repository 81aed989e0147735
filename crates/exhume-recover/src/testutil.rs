//! Hand-assembled database images for unit tests.
//!
//! Pages are built byte-by-byte the way the format lays them out, so the
//! tests exercise the real parsing paths without a SQLite library in the
//! loop.

use std::io::Write;

use exhume_types::serial_type::write_varint;

pub const DB_HEADER_SIZE: usize = 100;
pub const MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Builds a database file from raw pages. Page 1 is implicit: its first
/// 100 bytes are the file header and the rest is caller-supplied.
pub struct DbBuilder {
    page_size: u16,
    /// Body of page 1 past the file header (may be a b-tree page whose
    /// header sits at offset 100).
    page1: Vec<u8>,
    pages: Vec<Vec<u8>>,
    first_freelist_trunk: u32,
    freelist_pages: u32,
    largest_root_btree: u32,
    text_encoding: u32,
}

impl DbBuilder {
    pub fn new(page_size: u16) -> Self {
        let real_size = if page_size == 1 { 65536 } else { page_size as usize };
        Self {
            page_size,
            page1: vec![0u8; real_size],
            pages: Vec::new(),
            first_freelist_trunk: 0,
            freelist_pages: 0,
            largest_root_btree: 0,
            text_encoding: 1,
        }
    }

    /// Replace page 1 wholesale; its first 100 bytes are overwritten with
    /// the file header at build time.
    pub fn page1(mut self, page: Vec<u8>) -> Self {
        assert_eq!(page.len(), self.page1.len());
        self.page1 = page;
        self
    }

    /// Append a page (the first call appends page 2).
    pub fn page(mut self, page: Vec<u8>) -> Self {
        assert_eq!(page.len(), self.page1.len());
        self.pages.push(page);
        self
    }

    pub fn freelist(mut self, first_trunk: u32, total_pages: u32) -> Self {
        self.first_freelist_trunk = first_trunk;
        self.freelist_pages = total_pages;
        self
    }

    pub fn autovacuum(mut self, largest_root: u32) -> Self {
        self.largest_root_btree = largest_root;
        self
    }

    pub fn text_encoding(mut self, encoding: u32) -> Self {
        self.text_encoding = encoding;
        self
    }

    pub fn build(self) -> tempfile::NamedTempFile {
        let page_count = (1 + self.pages.len()) as u32;
        let mut header = vec![0u8; DB_HEADER_SIZE];
        header[0..16].copy_from_slice(MAGIC);
        header[16..18].copy_from_slice(&self.page_size.to_be_bytes());
        header[18] = 1;
        header[19] = 1;
        header[21] = 64;
        header[22] = 32;
        header[23] = 32;
        header[28..32].copy_from_slice(&page_count.to_be_bytes());
        header[32..36].copy_from_slice(&self.first_freelist_trunk.to_be_bytes());
        header[36..40].copy_from_slice(&self.freelist_pages.to_be_bytes());
        header[47] = 1; // schema format 1
        header[52..56].copy_from_slice(&self.largest_root_btree.to_be_bytes());
        header[56..60].copy_from_slice(&self.text_encoding.to_be_bytes());

        let mut first = self.page1;
        first[..DB_HEADER_SIZE].copy_from_slice(&header);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&first).unwrap();
        for page in &self.pages {
            file.write_all(page).unwrap();
        }
        file.flush().unwrap();
        file
    }
}

/// Encode a record payload from `(serial_type, body)` pairs.
pub fn encode_record(fields: &[(u64, &[u8])]) -> Vec<u8> {
    let mut types = Vec::new();
    let mut varint = [0u8; 9];
    for &(serial_type, _) in fields {
        let n = write_varint(&mut varint, serial_type);
        types.extend_from_slice(&varint[..n]);
    }
    let header_len = types.len() as u64 + 1;
    assert!(header_len <= 127, "test records keep a 1-byte header length");
    let mut record = vec![header_len as u8];
    record.extend_from_slice(&types);
    for &(_, body) in fields {
        record.extend_from_slice(body);
    }
    record
}

/// Encode a non-overflowing table-leaf cell.
pub fn encode_cell(rowid: u64, record: &[u8]) -> Vec<u8> {
    let mut cell = Vec::new();
    let mut varint = [0u8; 9];
    let n = write_varint(&mut varint, record.len() as u64);
    cell.extend_from_slice(&varint[..n]);
    let n = write_varint(&mut varint, rowid);
    cell.extend_from_slice(&varint[..n]);
    cell.extend_from_slice(record);
    cell
}

/// Build a table-leaf page holding `cells`, packed downward from the page
/// end the way the format does. `header_offset` is 100 when the page will
/// serve as page 1.
pub fn leaf_page_with_cells_at(
    page_size: usize,
    header_offset: usize,
    cells: &[Vec<u8>],
) -> Vec<u8> {
    let mut page = vec![0u8; page_size];
    page[header_offset] = 0x0D;
    page[header_offset + 3..header_offset + 5]
        .copy_from_slice(&(cells.len() as u16).to_be_bytes());

    let mut content = page_size;
    let mut pointers = Vec::new();
    for cell in cells {
        content -= cell.len();
        page[content..content + cell.len()].copy_from_slice(cell);
        pointers.push(content as u16);
    }
    page[header_offset + 5..header_offset + 7].copy_from_slice(&(content as u16).to_be_bytes());

    let array_start = header_offset + 8;
    for (i, ptr) in pointers.iter().enumerate() {
        page[array_start + 2 * i..array_start + 2 * i + 2].copy_from_slice(&ptr.to_be_bytes());
    }
    page
}

/// Build a table-leaf page at header offset 0.
pub fn leaf_page_with_cells(page_size: usize, cells: &[Vec<u8>]) -> Vec<u8> {
    leaf_page_with_cells_at(page_size, 0, cells)
}

/// Build a table-interior page from `(left_child, rowid)` cells and a
/// right-child pointer.
pub fn interior_page(page_size: usize, cells: &[(u32, u64)], right_child: u32) -> Vec<u8> {
    let mut page = vec![0u8; page_size];
    page[0] = 0x05;
    page[3..5].copy_from_slice(&(cells.len() as u16).to_be_bytes());
    page[8..12].copy_from_slice(&right_child.to_be_bytes());

    let mut content = page_size;
    let mut pointers = Vec::new();
    let mut varint = [0u8; 9];
    for &(child, rowid) in cells {
        let n = write_varint(&mut varint, rowid);
        content -= 4 + n;
        page[content..content + 4].copy_from_slice(&child.to_be_bytes());
        page[content + 4..content + 4 + n].copy_from_slice(&varint[..n]);
        pointers.push(content as u16);
    }
    page[5..7].copy_from_slice(&(content as u16).to_be_bytes());

    for (i, ptr) in pointers.iter().enumerate() {
        page[12 + 2 * i..14 + 2 * i].copy_from_slice(&ptr.to_be_bytes());
    }
    page
}

/// Splice a freeblock chain into a leaf page. `blocks` is a list of
/// `(offset, length)` pairs in ascending offset order; the chain head is
/// written into the page header and each block's `(next, length)` header
/// is written in place, leaving the freed bytes past it untouched.
pub fn install_freeblocks(page: &mut [u8], header_offset: usize, blocks: &[(u16, u16)]) {
    if blocks.is_empty() {
        return;
    }
    page[header_offset + 1..header_offset + 3].copy_from_slice(&blocks[0].0.to_be_bytes());
    for (i, &(offset, length)) in blocks.iter().enumerate() {
        let next = if i + 1 < blocks.len() {
            blocks[i + 1].0
        } else {
            0
        };
        let off = offset as usize;
        page[off..off + 2].copy_from_slice(&next.to_be_bytes());
        page[off + 2..off + 4].copy_from_slice(&length.to_be_bytes());
    }
}

/// A `CREATE TABLE` schema row as it appears in the schema table.
pub fn schema_row_record(name: &str, rootpage: u64, sql: &str) -> Vec<u8> {
    let type_st = 13 + 2 * "table".len() as u64;
    let name_st = 13 + 2 * name.len() as u64;
    let sql_st = 13 + 2 * sql.len() as u64;
    encode_record(&[
        (type_st, b"table"),
        (name_st, name.as_bytes()),
        (name_st, name.as_bytes()),
        (1, &[rootpage as u8]),
        (sql_st, sql.as_bytes()),
    ])
}
