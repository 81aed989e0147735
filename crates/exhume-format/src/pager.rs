//! Read-only, lazily-populated page cache.
//!
//! Pages are read once from the file and cached for the life of the
//! session. The engine is single-threaded, so the cache uses plain
//! interior mutability and hands out cheap `Rc<[u8]>` handles; parsed
//! structures hold those handles rather than copies of page bytes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use exhume_error::{ExhumeError, Result};
use exhume_types::PageNumber;
use tracing::{debug, warn};

use crate::header::{DB_HEADER_SIZE, DbHeader};

/// Read-only page access over a database file.
pub struct Pager {
    file: RefCell<File>,
    header: DbHeader,
    path: PathBuf,
    /// Effective page count: the header value cross-checked against the
    /// file length.
    page_count: u32,
    cache: RefCell<HashMap<PageNumber, Rc<[u8]>>>,
}

impl Pager {
    /// Open `path` read-only, parse and validate the file header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut header_bytes = [0u8; DB_HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(|_| {
            ExhumeError::NotADatabase {
                path: path.to_path_buf(),
            }
        })?;
        let header = DbHeader::parse(&header_bytes).map_err(|err| match err {
            ExhumeError::NotADatabase { .. } => ExhumeError::NotADatabase {
                path: path.to_path_buf(),
            },
            other => other,
        })?;

        let pages_in_file = (file_len / u64::from(header.page_size)) as u32;
        let page_count = if header.page_count == 0 {
            // Ancient files leave the in-header size at zero; fall back to
            // the file length.
            debug!(pages_in_file, "header page count is zero, using file length");
            pages_in_file
        } else if u64::from(header.page_count) * u64::from(header.page_size) > file_len {
            warn!(
                header_pages = header.page_count,
                pages_in_file, "header page count exceeds the file, truncating"
            );
            pages_in_file
        } else {
            header.page_count
        };

        debug!(
            path = %path.display(),
            page_size = header.page_size,
            page_count,
            encoding = %header.text_encoding,
            autovacuum = header.is_autovacuum(),
            "opened database"
        );

        Ok(Self {
            file: RefCell::new(file),
            header,
            path: path.to_path_buf(),
            page_count,
            cache: RefCell::new(HashMap::new()),
        })
    }

    /// The parsed file header.
    #[must_use]
    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    /// The path this pager reads from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Effective number of pages in the file.
    #[must_use]
    pub const fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Usable bytes per page (`page_size - reserved_bytes`).
    #[must_use]
    pub const fn usable_size(&self) -> u32 {
        self.header.usable_size()
    }

    /// Fetch page `n` (1-based), reading it from the file on first access.
    pub fn page(&self, n: PageNumber) -> Result<Rc<[u8]>> {
        if n.get() > self.page_count {
            return Err(ExhumeError::PageOutOfRange {
                page: n.get(),
                page_count: self.page_count,
            });
        }
        if let Some(cached) = self.cache.borrow().get(&n) {
            return Ok(Rc::clone(cached));
        }

        let page_size = self.header.page_size as usize;
        let offset = u64::from(n.get() - 1) * u64::from(self.header.page_size);
        let mut buf = vec![0u8; page_size];
        {
            let mut file = self.file.borrow_mut();
            file.seek(SeekFrom::Start(offset))?;
            let mut filled = 0;
            while filled < page_size {
                let got = file.read(&mut buf[filled..])?;
                if got == 0 {
                    return Err(ExhumeError::ShortRead {
                        page: n.get(),
                        expected: page_size,
                        actual: filled,
                    });
                }
                filled += got;
            }
        }

        let page: Rc<[u8]> = Rc::from(buf.into_boxed_slice());
        self.cache.borrow_mut().insert(n, Rc::clone(&page));
        Ok(page)
    }

    /// Number of pages currently resident in the cache.
    #[must_use]
    pub fn cached_pages(&self) -> usize {
        self.cache.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::tests::test_header_bytes;
    use std::io::Write;

    fn write_db(pages: &[Vec<u8>], page_size: u16) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut first = pages[0].clone();
        let header = test_header_bytes(page_size, pages.len() as u32);
        first[..DB_HEADER_SIZE].copy_from_slice(&header);
        file.write_all(&first).unwrap();
        for page in &pages[1..] {
            file.write_all(page).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_and_caches_pages() {
        let mut p2 = vec![0u8; 512];
        p2[0] = 0xAB;
        let file = write_db(&[vec![0u8; 512], p2], 512);
        let pager = Pager::open(file.path()).unwrap();
        assert_eq!(pager.page_count(), 2);

        let page = pager.page(PageNumber::new(2).unwrap()).unwrap();
        assert_eq!(page.len(), 512);
        assert_eq!(page[0], 0xAB);
        assert_eq!(pager.cached_pages(), 1);

        // Second access served from the cache.
        let again = pager.page(PageNumber::new(2).unwrap()).unwrap();
        assert!(Rc::ptr_eq(&page, &again));
        assert_eq!(pager.cached_pages(), 1);
    }

    #[test]
    fn out_of_range_page() {
        let file = write_db(&[vec![0u8; 512]], 512);
        let pager = Pager::open(file.path()).unwrap();
        let err = pager.page(PageNumber::new(9).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            ExhumeError::PageOutOfRange {
                page: 9,
                page_count: 1
            }
        ));
    }

    #[test]
    fn rejects_non_database_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a database").unwrap();
        assert!(matches!(
            Pager::open(file.path()),
            Err(ExhumeError::NotADatabase { .. })
        ));
    }

    #[test]
    fn stale_header_page_count_is_clamped() {
        // Header claims 50 pages, file holds 2.
        let mut first = vec![0u8; 512];
        first[..DB_HEADER_SIZE].copy_from_slice(&test_header_bytes(512, 50));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&first).unwrap();
        file.write_all(&vec![0u8; 512]).unwrap();
        file.flush().unwrap();

        let pager = Pager::open(file.path()).unwrap();
        assert_eq!(pager.page_count(), 2);
    }
}
