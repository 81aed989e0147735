//! Pointer-map (ptrmap) pages, present in auto-vacuum databases.
//!
//! Each ptrmap page is an array of 5-byte entries `(kind u8, parent u32)`
//! describing the pages that follow it. With J = usable_size / 5 entries
//! per map page, the first ptrmap page is page 2 and covers pages
//! 3 ..= J + 2; subsequent map pages repeat at stride J + 1.

use std::collections::HashMap;

use exhume_error::Result;
use exhume_types::PageNumber;
use exhume_types::serial_type::be_u32;
use tracing::{debug, info, warn};

use crate::pager::Pager;

/// The page kinds recorded in ptrmap entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtrmapKind {
    /// A B-tree root page; the parent field is zero.
    RootPage = 1,
    /// A page on the free-list; the parent field is zero.
    FreePage = 2,
    /// The first page of an overflow chain; parent is the B-tree page
    /// holding the cell.
    OverflowFirst = 3,
    /// A later page of an overflow chain; parent is the previous page in
    /// the chain.
    OverflowLater = 4,
    /// A non-root B-tree page; parent is the parent B-tree page.
    BtreeNonRoot = 5,
}

impl PtrmapKind {
    /// Parse the entry's kind byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::RootPage),
            2 => Some(Self::FreePage),
            3 => Some(Self::OverflowFirst),
            4 => Some(Self::OverflowLater),
            5 => Some(Self::BtreeNonRoot),
            _ => None,
        }
    }
}

/// One ptrmap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrmapEntry {
    pub kind: PtrmapKind,
    /// Parent page, `None` for kinds whose parent field is zero.
    pub parent: Option<PageNumber>,
}

/// The loaded pointer map for a database.
#[derive(Debug, Default)]
pub struct Ptrmap {
    entries: HashMap<u32, PtrmapEntry>,
    map_pages: Vec<PageNumber>,
}

/// Number of entries per ptrmap page.
#[must_use]
pub const fn entries_per_page(usable_size: u32) -> u32 {
    usable_size / 5
}

/// Whether `page` falls on a ptrmap stride position for this geometry.
/// Only meaningful for auto-vacuum files.
#[must_use]
pub fn is_ptrmap_page(page: PageNumber, usable_size: u32) -> bool {
    let n = page.get();
    if n < 2 {
        return false;
    }
    let stride = entries_per_page(usable_size) + 1;
    (n - 2) % stride == 0
}

impl Ptrmap {
    /// Load every ptrmap page of an auto-vacuum database.
    ///
    /// Returns `None` when the header indicates the file carries no
    /// pointer map; queries then degrade at the caller.
    pub fn load(pager: &Pager) -> Result<Option<Self>> {
        if !pager.header().is_autovacuum() {
            debug!("database has no ptrmap pages");
            return Ok(None);
        }

        let usable = pager.usable_size();
        let per_page = entries_per_page(usable);
        let mut map = Self::default();

        let mut map_page_no = 2u32;
        while map_page_no <= pager.page_count() {
            let Some(map_page) = PageNumber::new(map_page_no) else {
                break;
            };
            let page = pager.page(map_page)?;
            map.map_pages.push(map_page);

            for entry_idx in 0..per_page {
                let target = map_page_no + entry_idx + 1;
                if target > pager.page_count() {
                    break;
                }
                let off = (entry_idx as usize) * 5;
                let kind_byte = page[off];
                if kind_byte == 0 {
                    // Entries stop where the map page was never filled in.
                    break;
                }
                let Some(kind) = PtrmapKind::from_byte(kind_byte) else {
                    warn!(page = target, kind = kind_byte, "unknown ptrmap entry kind");
                    continue;
                };
                let parent_raw = be_u32(&page, off + 1)?;
                let parent = PageNumber::new(parent_raw);

                match kind {
                    PtrmapKind::RootPage | PtrmapKind::FreePage => {
                        if parent.is_some() {
                            warn!(
                                page = target,
                                parent = parent_raw,
                                "ptrmap entry carries a parent it should not have"
                            );
                        }
                    }
                    _ => {
                        if parent.is_none() {
                            warn!(page = target, "ptrmap entry is missing its parent");
                        }
                    }
                }

                map.entries.insert(target, PtrmapEntry { kind, parent });
            }

            map_page_no += per_page + 1;
        }

        info!(
            map_pages = map.map_pages.len(),
            entries = map.entries.len(),
            "parsed ptrmap"
        );
        Ok(Some(map))
    }

    /// Look up the kind and parent recorded for `page`.
    ///
    /// Pages 1 and 2 never have entries; neither do ptrmap pages
    /// themselves.
    #[must_use]
    pub fn lookup(&self, page: PageNumber) -> Option<PtrmapEntry> {
        self.entries.get(&page.get()).copied()
    }

    /// The ptrmap pages themselves.
    #[must_use]
    pub fn map_pages(&self) -> &[PageNumber] {
        &self.map_pages
    }

    /// Follow parent pointers from `page` up to the B-tree root that owns
    /// it. Returns `None` when the walk leaves the map or exceeds a sane
    /// depth (corrupt parent loops).
    #[must_use]
    pub fn root_of(&self, page: PageNumber) -> Option<PageNumber> {
        let mut current = page;
        for _ in 0..64 {
            match self.lookup(current)? {
                PtrmapEntry {
                    kind: PtrmapKind::RootPage,
                    ..
                } => return Some(current),
                PtrmapEntry {
                    parent: Some(parent),
                    ..
                } => current = parent,
                PtrmapEntry { parent: None, .. } => return None,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::DB_HEADER_SIZE;
    use crate::header::tests::test_header_bytes;
    use std::io::Write;

    fn build_autovacuum_db(pages: Vec<Vec<u8>>) -> tempfile::NamedTempFile {
        let mut first = pages[0].clone();
        let mut header = test_header_bytes(512, pages.len() as u32);
        // Mark auto-vacuum by recording a largest-root-btree page.
        header[52..56].copy_from_slice(&1u32.to_be_bytes());
        first[..DB_HEADER_SIZE].copy_from_slice(&header);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&first).unwrap();
        for page in &pages[1..] {
            file.write_all(page).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn entry_bytes(kind: u8, parent: u32) -> [u8; 5] {
        let mut e = [0u8; 5];
        e[0] = kind;
        e[1..5].copy_from_slice(&parent.to_be_bytes());
        e
    }

    #[test]
    fn stride_positions() {
        // usable 512 → 102 entries per map page, stride 103.
        assert_eq!(entries_per_page(512), 102);
        let p = |n| PageNumber::new(n).unwrap();
        assert!(is_ptrmap_page(p(2), 512));
        assert!(!is_ptrmap_page(p(3), 512));
        assert!(is_ptrmap_page(p(105), 512));
        assert!(!is_ptrmap_page(p(1), 512));
    }

    #[test]
    fn absent_without_autovacuum() {
        let mut first = vec![0u8; 512];
        first[..DB_HEADER_SIZE].copy_from_slice(&test_header_bytes(512, 1));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&first).unwrap();
        file.flush().unwrap();

        let pager = Pager::open(file.path()).unwrap();
        assert!(Ptrmap::load(&pager).unwrap().is_none());
    }

    #[test]
    fn loads_entries_and_resolves_roots() {
        // Page 2 is the map page; page 3 a root, page 4 its child leaf,
        // page 5 a free page.
        let mut map_page = vec![0u8; 512];
        map_page[0..5].copy_from_slice(&entry_bytes(1, 0)); // page 3: root
        map_page[5..10].copy_from_slice(&entry_bytes(5, 3)); // page 4: non-root, parent 3
        map_page[10..15].copy_from_slice(&entry_bytes(2, 0)); // page 5: free

        let pages = vec![
            vec![0u8; 512],
            map_page,
            vec![0u8; 512],
            vec![0u8; 512],
            vec![0u8; 512],
        ];
        let file = build_autovacuum_db(pages);
        let pager = Pager::open(file.path()).unwrap();
        let ptrmap = Ptrmap::load(&pager).unwrap().unwrap();

        let p = |n| PageNumber::new(n).unwrap();
        assert_eq!(
            ptrmap.lookup(p(3)),
            Some(PtrmapEntry {
                kind: PtrmapKind::RootPage,
                parent: None
            })
        );
        assert_eq!(
            ptrmap.lookup(p(4)),
            Some(PtrmapEntry {
                kind: PtrmapKind::BtreeNonRoot,
                parent: Some(p(3))
            })
        );
        assert_eq!(
            ptrmap.lookup(p(5)),
            Some(PtrmapEntry {
                kind: PtrmapKind::FreePage,
                parent: None
            })
        );
        assert_eq!(ptrmap.lookup(p(1)), None);

        assert_eq!(ptrmap.root_of(p(4)), Some(p(3)));
        assert_eq!(ptrmap.root_of(p(3)), Some(p(3)));
        assert_eq!(ptrmap.root_of(p(5)), None);
    }

    #[test]
    fn zero_kind_stops_entry_scan() {
        let mut map_page = vec![0u8; 512];
        map_page[0..5].copy_from_slice(&entry_bytes(1, 0)); // page 3
        // Entry for page 4 left zeroed; entry for page 5 present but must
        // not be reached.
        map_page[10..15].copy_from_slice(&entry_bytes(2, 0));

        let pages = vec![
            vec![0u8; 512],
            map_page,
            vec![0u8; 512],
            vec![0u8; 512],
            vec![0u8; 512],
        ];
        let file = build_autovacuum_db(pages);
        let pager = Pager::open(file.path()).unwrap();
        let ptrmap = Ptrmap::load(&pager).unwrap().unwrap();

        let p = |n| PageNumber::new(n).unwrap();
        assert!(ptrmap.lookup(p(3)).is_some());
        assert!(ptrmap.lookup(p(4)).is_none());
        assert!(ptrmap.lookup(p(5)).is_none());
    }
}
