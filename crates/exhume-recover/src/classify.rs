//! Assigning every page in the file a role.
//!
//! Roles come from three sources: reachability (B-tree walks from the
//! schema's roots, the free-list chain, overflow pointers in live
//! cells), stride arithmetic (ptrmap pages), and the page-type byte.
//! The sources are cross-checked; disagreement is logged and the
//! reachability-derived role wins.

use std::collections::HashSet;

use exhume_error::Result;
use exhume_format::freelist::Freelist;
use exhume_format::page::{BtreePageHeader, PageType, TableLeafCell, btree_header_offset};
use exhume_format::pager::Pager;
use exhume_format::ptrmap::{Ptrmap, PtrmapKind, is_ptrmap_page};
use exhume_types::PageNumber;
use tracing::{debug, warn};

use crate::btree::walk_table_tree;
use crate::schema::Schema;

/// The role of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageRole {
    TableLeaf,
    TableInterior,
    IndexLeaf,
    IndexInterior,
    PtrMap,
    FreelistTrunk,
    FreelistLeaf,
    Overflow,
    #[default]
    Unknown,
}

/// Page roles for the whole file, indexed by page number.
#[derive(Debug)]
pub struct PageMap {
    roles: Vec<PageRole>,
}

impl PageMap {
    /// Classify every page of the database.
    pub fn build(
        pager: &Pager,
        schema: &Schema,
        freelist: &Freelist,
        ptrmap: Option<&Ptrmap>,
    ) -> Result<Self> {
        let count = pager.page_count() as usize;
        let mut map = Self {
            roles: vec![PageRole::Unknown; count + 1],
        };

        // Ptrmap pages sit at fixed stride positions.
        if pager.header().is_autovacuum() {
            for n in 2..=pager.page_count() {
                let page_no = PageNumber::new(n).expect("n >= 2");
                if is_ptrmap_page(page_no, pager.usable_size()) {
                    map.set(page_no, PageRole::PtrMap);
                }
            }
        }

        // Free-list reachability.
        for &trunk in &freelist.trunks {
            map.set(trunk, PageRole::FreelistTrunk);
        }
        for &leaf in &freelist.leaves {
            map.set(leaf, PageRole::FreelistLeaf);
        }

        // B-tree reachability from the schema root and every table root,
        // plus overflow chains hanging off live cells.
        let mut overflow_heads: Vec<PageNumber> = Vec::new();
        let mut roots: Vec<PageNumber> = vec![PageNumber::ONE];
        roots.extend(schema.tables.iter().map(|t| t.root));
        roots.sort_unstable();
        roots.dedup();
        for root in roots {
            let Ok(tree) = walk_table_tree(pager, root) else {
                continue;
            };
            for &page_no in &tree.interior {
                map.set_checked(pager, page_no, PageRole::TableInterior);
            }
            for &page_no in &tree.leaves {
                map.set_checked(pager, page_no, PageRole::TableLeaf);
                overflow_heads.extend(leaf_overflow_heads(pager, page_no));
            }
        }

        // Chase overflow chains breadth-first.
        let mut seen: HashSet<PageNumber> = HashSet::new();
        let mut queue = overflow_heads;
        while let Some(page_no) = queue.pop() {
            if !seen.insert(page_no) || page_no.get() > pager.page_count() {
                continue;
            }
            map.set(page_no, PageRole::Overflow);
            if let Ok(page) = pager.page(page_no) {
                let next = u32::from_be_bytes([page[0], page[1], page[2], page[3]]);
                if let Some(next) = PageNumber::new(next) {
                    if next.get() <= pager.page_count() {
                        queue.push(next);
                    }
                }
            }
        }

        map.cross_check(pager, ptrmap);
        Ok(map)
    }

    /// The role assigned to `page`.
    #[must_use]
    pub fn role(&self, page: PageNumber) -> PageRole {
        self.roles
            .get(page.get() as usize)
            .copied()
            .unwrap_or(PageRole::Unknown)
    }

    /// Pages holding a given role.
    #[must_use]
    pub fn pages_with_role(&self, role: PageRole) -> Vec<PageNumber> {
        self.roles
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, r)| **r == role)
            .filter_map(|(n, _)| PageNumber::new(n as u32))
            .collect()
    }

    fn set(&mut self, page: PageNumber, role: PageRole) {
        if let Some(slot) = self.roles.get_mut(page.get() as usize) {
            *slot = role;
        }
    }

    /// Set a B-tree role, verifying the page-type byte agrees and the
    /// cell pointers are consistent with the recorded content start.
    fn set_checked(&mut self, pager: &Pager, page_no: PageNumber, role: PageRole) {
        if let Ok(page) = pager.page(page_no) {
            let header_offset = btree_header_offset(page_no);
            let flag = page[header_offset];
            let from_flag = match PageType::from_flag(flag) {
                Some(PageType::TableLeaf) => PageRole::TableLeaf,
                Some(PageType::TableInterior) => PageRole::TableInterior,
                Some(PageType::IndexLeaf) => PageRole::IndexLeaf,
                Some(PageType::IndexInterior) => PageRole::IndexInterior,
                None => PageRole::Unknown,
            };
            if from_flag != role {
                warn!(
                    page = page_no.get(),
                    walk = ?role,
                    flag = ?from_flag,
                    "page-type byte disagrees with b-tree reachability"
                );
            }

            if let Ok(header) = BtreePageHeader::parse(&page, header_offset) {
                if let Ok(pointers) = header.cell_pointers(&page, header_offset) {
                    if let Some(&min) = pointers.iter().min() {
                        if u32::from(min) != header.cell_content_start {
                            warn!(
                                page = page_no.get(),
                                content_start = header.cell_content_start,
                                min_cell_pointer = min,
                                "cell content start disagrees with the smallest cell pointer"
                            );
                        }
                    }
                }
            }
        }
        self.set(page_no, role);
    }

    /// Compare the reachability-derived roles with ptrmap entries.
    fn cross_check(&self, pager: &Pager, ptrmap: Option<&Ptrmap>) {
        let Some(ptrmap) = ptrmap else {
            return;
        };
        for n in 3..=pager.page_count() {
            let page_no = PageNumber::new(n).expect("n >= 3");
            let Some(entry) = ptrmap.lookup(page_no) else {
                continue;
            };
            let role = self.role(page_no);
            let agrees = match entry.kind {
                PtrmapKind::RootPage => matches!(
                    role,
                    PageRole::TableLeaf | PageRole::TableInterior | PageRole::IndexLeaf
                        | PageRole::IndexInterior
                ),
                PtrmapKind::FreePage => {
                    matches!(role, PageRole::FreelistTrunk | PageRole::FreelistLeaf)
                }
                PtrmapKind::OverflowFirst | PtrmapKind::OverflowLater => {
                    matches!(role, PageRole::Overflow)
                }
                PtrmapKind::BtreeNonRoot => matches!(
                    role,
                    PageRole::TableLeaf | PageRole::TableInterior | PageRole::IndexLeaf
                        | PageRole::IndexInterior
                ),
            };
            if !agrees && role != PageRole::Unknown {
                warn!(
                    page = n,
                    ptrmap = ?entry.kind,
                    classified = ?role,
                    "ptrmap disagrees with page classification"
                );
            }
        }
        debug!("cross-checked classification against ptrmap");
    }
}

/// First-overflow pointers of every live cell on a table leaf.
fn leaf_overflow_heads(pager: &Pager, page_no: PageNumber) -> Vec<PageNumber> {
    let mut heads = Vec::new();
    let Ok(page) = pager.page(page_no) else {
        return heads;
    };
    let header_offset = btree_header_offset(page_no);
    let Ok(header) = BtreePageHeader::parse(&page, header_offset) else {
        return heads;
    };
    let Ok(pointers) = header.cell_pointers(&page, header_offset) else {
        return heads;
    };
    for ptr in pointers {
        if let Ok(cell) = TableLeafCell::parse(&page, ptr as usize, pager.usable_size()) {
            if let Some(first) = cell.first_overflow {
                heads.push(first);
            }
        }
    }
    heads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        DbBuilder, encode_cell, leaf_page_with_cells, leaf_page_with_cells_at, schema_row_record,
    };

    fn p(n: u32) -> PageNumber {
        PageNumber::new(n).unwrap()
    }

    #[test]
    fn classifies_leaves_freelist_and_unknown() {
        // Page 1: schema leaf → table t rooted at page 2.
        // Page 2: t's leaf. Page 3: freelist trunk. Page 4: freelist
        // leaf. Page 5: untouched.
        let row = schema_row_record("t", 2, "CREATE TABLE t (a INT)");
        let page1 = leaf_page_with_cells_at(512, 100, &[encode_cell(1, &row)]);

        let mut trunk = vec![0u8; 512];
        trunk[4..8].copy_from_slice(&1u32.to_be_bytes());
        trunk[8..12].copy_from_slice(&4u32.to_be_bytes());

        let db = DbBuilder::new(512)
            .page1(page1)
            .page(leaf_page_with_cells(512, &[])) // page 2
            .page(trunk)                          // page 3
            .page(vec![0u8; 512])                 // page 4
            .page(vec![0u8; 512])                 // page 5
            .freelist(3, 2)
            .build();

        let pager = Pager::open(db.path()).unwrap();
        let schema = Schema::parse(&pager).unwrap();
        let freelist = Freelist::parse(&pager).unwrap();
        let map = PageMap::build(&pager, &schema, &freelist, None).unwrap();

        assert_eq!(map.role(p(1)), PageRole::TableLeaf);
        assert_eq!(map.role(p(2)), PageRole::TableLeaf);
        assert_eq!(map.role(p(3)), PageRole::FreelistTrunk);
        assert_eq!(map.role(p(4)), PageRole::FreelistLeaf);
        assert_eq!(map.role(p(5)), PageRole::Unknown);

        assert_eq!(map.pages_with_role(PageRole::FreelistLeaf), vec![p(4)]);
    }

    #[test]
    fn ptrmap_stride_pages_marked() {
        // Auto-vacuum with 512-byte pages: page 2 is the first map page.
        let db = DbBuilder::new(512)
            .page(vec![0u8; 512]) // page 2: ptrmap
            .page(vec![0u8; 512]) // page 3
            .autovacuum(1)
            .build();
        let pager = Pager::open(db.path()).unwrap();
        let schema = Schema::default();
        let freelist = Freelist::default();
        let map = PageMap::build(&pager, &schema, &freelist, None).unwrap();
        assert_eq!(map.role(p(2)), PageRole::PtrMap);
    }
}
