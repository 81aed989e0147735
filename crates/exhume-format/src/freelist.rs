//! The free-list: trunk pages chaining leaf pages that are no longer part
//! of any B-tree.
//!
//! A trunk page is `(next_trunk u32, leaf_count u32, leaf_page u32 × N)`.
//! Leaf pages carry no structure of their own; their former contents are
//! exactly what the recovery engine wants to scan.

use std::collections::HashSet;

use exhume_error::Result;
use exhume_types::PageNumber;
use exhume_types::serial_type::be_u32;
use tracing::{debug, info, warn};

use crate::pager::Pager;

/// The parsed free-list: trunk pages in chain order and every leaf page
/// they reference.
#[derive(Debug, Default, Clone)]
pub struct Freelist {
    pub trunks: Vec<PageNumber>,
    pub leaves: Vec<PageNumber>,
}

impl Freelist {
    /// Walk the trunk chain from the header's first-free-trunk pointer.
    ///
    /// Damaged chains degrade: a trunk that cannot be read, a cycle, or
    /// an out-of-range leaf pointer ends or narrows the walk with a
    /// warning rather than failing the session.
    pub fn parse(pager: &Pager) -> Result<Self> {
        let mut freelist = Self::default();
        let Some(first) = PageNumber::new(pager.header().first_freelist_trunk) else {
            debug!("database has no freelist trunk page");
            return Ok(freelist);
        };

        let mut seen: HashSet<PageNumber> = HashSet::new();
        let mut next = Some(first);

        while let Some(trunk_no) = next {
            if !seen.insert(trunk_no) {
                warn!(page = trunk_no.get(), "freelist trunk chain cycle");
                break;
            }
            let trunk = match pager.page(trunk_no) {
                Ok(page) => page,
                Err(err) => {
                    warn!(page = trunk_no.get(), error = %err, "unreadable freelist trunk");
                    break;
                }
            };
            freelist.trunks.push(trunk_no);

            let next_trunk = be_u32(&trunk, 0)?;
            let leaf_count = be_u32(&trunk, 4)?;
            // The pointer array cannot extend past the usable area.
            let max_leaves = (pager.usable_size() as usize - 8) / 4;
            let claimed = leaf_count as usize;
            let count = claimed.min(max_leaves);
            if count < claimed {
                warn!(
                    page = trunk_no.get(),
                    claimed,
                    capacity = max_leaves,
                    "freelist trunk claims more leaves than fit on the page"
                );
            }

            for i in 0..count {
                let raw = be_u32(&trunk, 8 + 4 * i)?;
                match PageNumber::new(raw) {
                    Some(leaf) if leaf.get() <= pager.page_count() => {
                        freelist.leaves.push(leaf);
                    }
                    _ => {
                        warn!(
                            trunk = trunk_no.get(),
                            leaf = raw,
                            "freelist leaf pointer out of range"
                        );
                    }
                }
            }

            next = PageNumber::new(next_trunk);
        }

        let total = freelist.trunks.len() + freelist.leaves.len();
        let expected = pager.header().freelist_page_count as usize;
        if total != expected {
            warn!(
                parsed = total,
                header = expected,
                "freelist page count disagrees with the header"
            );
        }
        info!(
            trunks = freelist.trunks.len(),
            leaves = freelist.leaves.len(),
            "parsed freelist"
        );

        Ok(freelist)
    }

    /// Whether `page` sits anywhere on the free-list.
    #[must_use]
    pub fn contains(&self, page: PageNumber) -> bool {
        self.trunks.contains(&page) || self.leaves.contains(&page)
    }
}
