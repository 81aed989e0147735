//! Table B-tree traversal.

use std::collections::{HashSet, VecDeque};

use exhume_error::{ExhumeError, Result};
use exhume_format::page::{BtreePageHeader, PageType, TableInteriorCell, btree_header_offset};
use exhume_format::pager::Pager;
use exhume_types::PageNumber;
use tracing::{debug, warn};

/// Pages visited by a table B-tree walk, leaves in traversal order.
#[derive(Debug, Default, Clone)]
pub struct TableTree {
    pub leaves: Vec<PageNumber>,
    pub interior: Vec<PageNumber>,
    /// Children that were skipped because they were out of range,
    /// already visited, or not table pages.
    pub damaged_children: usize,
}

/// Walk the table B-tree rooted at `root` breadth-first, collecting
/// table-leaf pages in traversal order.
///
/// An unreadable or non-table root fails with
/// [`ExhumeError::CorruptTree`], which callers treat as "skip this
/// table". Damaged interior cells (cycles, out-of-range children, bad
/// child types) are reported, counted, and skipped without ending the
/// walk.
pub fn walk_table_tree(pager: &Pager, root: PageNumber) -> Result<TableTree> {
    let mut tree = TableTree::default();
    let mut visited: HashSet<PageNumber> = HashSet::new();
    let mut queue: VecDeque<PageNumber> = VecDeque::from([root]);

    while let Some(page_no) = queue.pop_front() {
        if !visited.insert(page_no) {
            warn!(root = root.get(), page = page_no.get(), "b-tree cycle");
            tree.damaged_children += 1;
            continue;
        }

        let page = match pager.page(page_no) {
            Ok(page) => page,
            Err(err) if page_no == root => {
                return Err(ExhumeError::corrupt_tree(
                    root.get(),
                    format!("unreadable root: {err}"),
                ));
            }
            Err(err) => {
                warn!(root = root.get(), page = page_no.get(), error = %err, "unreadable b-tree page");
                tree.damaged_children += 1;
                continue;
            }
        };

        let header_offset = btree_header_offset(page_no);
        let header = match BtreePageHeader::parse(&page, header_offset) {
            Ok(header) => header,
            Err(err) if page_no == root => {
                return Err(ExhumeError::corrupt_tree(
                    root.get(),
                    format!("root is not a b-tree page: {err}"),
                ));
            }
            Err(err) => {
                warn!(root = root.get(), page = page_no.get(), error = %err, "not a b-tree page");
                tree.damaged_children += 1;
                continue;
            }
        };

        match header.page_type {
            PageType::TableLeaf => tree.leaves.push(page_no),
            PageType::TableInterior => {
                tree.interior.push(page_no);
                for ptr in header.cell_pointers(&page, header_offset)? {
                    match TableInteriorCell::parse(&page, ptr as usize) {
                        Ok(cell) if cell.left_child.get() <= pager.page_count() => {
                            queue.push_back(cell.left_child);
                        }
                        Ok(cell) => {
                            warn!(
                                root = root.get(),
                                page = page_no.get(),
                                child = cell.left_child.get(),
                                "interior cell child out of range"
                            );
                            tree.damaged_children += 1;
                        }
                        Err(err) => {
                            warn!(root = root.get(), page = page_no.get(), error = %err, "unparseable interior cell");
                            tree.damaged_children += 1;
                        }
                    }
                }
                if let Some(right) = header.right_child {
                    if right.get() <= pager.page_count() {
                        queue.push_back(right);
                    } else {
                        warn!(
                            root = root.get(),
                            page = page_no.get(),
                            child = right.get(),
                            "right child out of range"
                        );
                        tree.damaged_children += 1;
                    }
                }
            }
            other => {
                if page_no == root {
                    return Err(ExhumeError::corrupt_tree(
                        root.get(),
                        format!("root has index page type {other:?}"),
                    ));
                }
                warn!(
                    root = root.get(),
                    page = page_no.get(),
                    page_type = ?other,
                    "non-table page inside a table tree"
                );
                tree.damaged_children += 1;
            }
        }
    }

    debug!(
        root = root.get(),
        leaves = tree.leaves.len(),
        interior = tree.interior.len(),
        damaged = tree.damaged_children,
        "walked table tree"
    );
    Ok(tree)
}
