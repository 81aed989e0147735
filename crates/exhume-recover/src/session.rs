//! The recovery session: one read-only pass over a database that scans
//! freed regions table by table and streams out decoded rows.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use exhume_error::{ExhumeError, Result};
use exhume_format::freelist::Freelist;
use exhume_format::overflow::read_overflow_chain;
use exhume_format::page::{BtreePageHeader, LocalPayload, TableLeafCell, btree_header_offset};
use exhume_format::pager::Pager;
use exhume_format::ptrmap::{Ptrmap, PtrmapKind};
use exhume_format::record::{CarvedExtent, Record, decode_reassembled};
use exhume_types::serial_type::be_u32;
use exhume_types::{Column, PageNumber};
use regex::bytes::RegexBuilder;
use tracing::{debug, info, warn};

use crate::btree::{TableTree, walk_table_tree};
use crate::classify::PageMap;
use crate::freeblock::{FreeRange, scan_freeblocks, unallocated_band};
use crate::heuristics::HeuristicsRegistry;
use crate::schema::{Schema, TableInfo};

/// Where a recovered row's bytes were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSource {
    /// A freeblock on a live table-leaf page.
    Freeblock,
    /// The unallocated band of a live table-leaf page.
    Unallocated,
    /// A page on the free-list.
    FreelistLeaf,
}

impl std::fmt::Display for RowSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Freeblock => write!(f, "freeblock"),
            Self::Unallocated => write!(f, "unallocated"),
            Self::FreelistLeaf => write!(f, "freelist-leaf"),
        }
    }
}

/// One recovered (deleted) row.
#[derive(Debug, Clone)]
pub struct RecoveredRow {
    pub table: String,
    pub source: RowSource,
    pub page: u32,
    /// Offset of the record header within the page.
    pub offset: usize,
    /// Deleted rows lose their rowid with the cell framing; live-decoded
    /// rows keep theirs.
    pub rowid: Option<i64>,
    pub columns: Vec<Column>,
    /// Bytewise identical to a live row of the same table; excluded from
    /// deleted output unless explicitly requested.
    pub likely_live: bool,
}

/// A live (non-deleted) row, decoded through the same record path.
#[derive(Debug, Clone)]
pub struct LiveRow {
    pub rowid: i64,
    pub columns: Vec<Column>,
}

/// Outcome of scanning one table.
#[derive(Debug, Clone, Default)]
pub struct TableReport {
    pub table: String,
    /// False when no heuristic exists for the table.
    pub scanned: bool,
    pub ranges_scanned: usize,
    /// Ranges skipped because every byte was zero (secure-delete).
    pub zeroed_ranges: usize,
    pub candidates: usize,
    pub decode_failures: usize,
    pub affinity_mismatches: usize,
    pub recovered: usize,
    pub likely_live: usize,
}

/// Outcome of a whole run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub tables: Vec<TableReport>,
    /// Tables whose B-tree could not be walked at all.
    pub corrupt_tables: Vec<String>,
}

impl RunReport {
    /// Rows recovered across all tables, not counting likely-live ones.
    #[must_use]
    pub fn total_recovered(&self) -> usize {
        self.tables.iter().map(|t| t.recovered).sum()
    }
}

/// A byte-pattern match from [`Session::grep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrepMatch {
    pub page: u32,
    pub offset: usize,
}

/// A read-only recovery session over one database file.
///
/// Two sessions over the same file are fully independent; nothing is
/// shared and nothing is written.
pub struct Session {
    pager: Pager,
    schema: Schema,
    freelist: Freelist,
    ptrmap: Option<Ptrmap>,
    page_map: PageMap,
    registry: HeuristicsRegistry,
    trees: HashMap<String, TableTree>,
    corrupt_tables: Vec<String>,
    /// Free-list leaf → names of tables it is attributed to.
    freelist_attribution: HashMap<PageNumber, Vec<String>>,
}

impl Session {
    /// Open a database and prepare the page graph: header, schema,
    /// free-list, ptrmap, classification, and per-table B-tree walks.
    pub fn open(path: &Path, registry: HeuristicsRegistry) -> Result<Self> {
        let pager = Pager::open(path)?;
        let schema = Schema::parse(&pager)?;
        let freelist = Freelist::parse(&pager)?;
        let ptrmap = Ptrmap::load(&pager)?;
        let page_map = PageMap::build(&pager, &schema, &freelist, ptrmap.as_ref())?;

        let mut trees = HashMap::new();
        let mut corrupt_tables = Vec::new();
        for table in &schema.tables {
            match walk_table_tree(&pager, table.root) {
                Ok(tree) => {
                    trees.insert(table.name.clone(), tree);
                }
                Err(err) => {
                    warn!(table = %table.name, error = %err, "skipping table with corrupt tree");
                    corrupt_tables.push(table.name.clone());
                }
            }
        }

        let mut session = Self {
            pager,
            schema,
            freelist,
            ptrmap,
            page_map,
            registry,
            trees,
            corrupt_tables,
            freelist_attribution: HashMap::new(),
        };
        let attribution = session.attribute_freelist_leaves();
        session.freelist_attribution = attribution;
        Ok(session)
    }

    /// The recoverable tables: user tables plus the reserved
    /// `sqlite_*` tables (including `sqlite_master` itself).
    #[must_use]
    pub fn tables(&self) -> &[TableInfo] {
        &self.schema.tables
    }

    /// The page classification for this file.
    #[must_use]
    pub fn page_map(&self) -> &PageMap {
        &self.page_map
    }

    /// The pager (page size, header, raw page access).
    #[must_use]
    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Recover deleted rows for every table, streaming each row to
    /// `sink` as it is found.
    pub fn recover_all(&self, sink: &mut dyn FnMut(RecoveredRow)) -> Result<RunReport> {
        let mut report = RunReport {
            tables: Vec::new(),
            corrupt_tables: self.corrupt_tables.clone(),
        };
        for table in &self.schema.tables {
            if self.corrupt_tables.contains(&table.name) {
                continue;
            }
            report.tables.push(self.recover_table(table, sink)?);
        }
        info!(
            recovered = report.total_recovered(),
            tables = report.tables.len(),
            "recovery pass complete"
        );
        Ok(report)
    }

    /// Recover deleted rows for one table.
    pub fn recover_table(
        &self,
        table: &TableInfo,
        sink: &mut dyn FnMut(RecoveredRow),
    ) -> Result<TableReport> {
        let mut report = TableReport {
            table: table.name.clone(),
            ..TableReport::default()
        };

        if !self.registry.has_rules_for(&table.name) {
            warn!(table = %table.name, "no heuristic for table, leaving it unscanned");
            return Ok(report);
        }
        report.scanned = true;

        let Some(tree) = self.trees.get(&table.name) else {
            return Ok(report);
        };

        let live_payloads = self.live_payload_set(tree);
        let mut seen: HashSet<(u32, usize)> = HashSet::new();

        for (page_no, range, source) in self.candidate_regions(table, tree)? {
            let page = self.pager.page(page_no)?;
            let hay = &page[range.start..range.end];
            report.ranges_scanned += 1;

            if hay.iter().all(|&b| b == 0) {
                report.zeroed_ranges += 1;
                continue;
            }

            let Some(candidates) = self.registry.candidates(&table.name, hay) else {
                continue;
            };
            report.candidates += candidates.len();

            let mut next_free = 0usize;
            for cand in candidates {
                if cand < next_free {
                    // Overlaps the record already taken at an earlier
                    // offset; the earlier start wins.
                    continue;
                }
                let (record, consumed, payload) = match self.decode_candidate(hay, cand, table) {
                    Ok(decoded) => decoded,
                    Err(err) if err.is_candidate_noise() => {
                        report.decode_failures += 1;
                        continue;
                    }
                    Err(err) => {
                        warn!(table = %table.name, page = page_no.get(), error = %err, "candidate rejected");
                        report.decode_failures += 1;
                        continue;
                    }
                };

                let mismatches = record
                    .columns
                    .iter()
                    .zip(&table.columns)
                    .filter(|(col, def)| !col.value.compatible_with(def.affinity))
                    .count();
                if mismatches > 0 {
                    debug!(
                        table = %table.name,
                        page = page_no.get(),
                        offset = range.start + cand,
                        mismatches,
                        "recovered row disagrees with declared affinities"
                    );
                    report.affinity_mismatches += mismatches;
                }

                let offset = range.start + cand;
                if !seen.insert((page_no.get(), offset)) {
                    continue;
                }
                next_free = cand + consumed;

                let likely_live = live_payloads.contains(payload.as_slice());
                if likely_live {
                    report.likely_live += 1;
                } else {
                    report.recovered += 1;
                }
                sink(RecoveredRow {
                    table: table.name.clone(),
                    source,
                    page: page_no.get(),
                    offset,
                    rowid: None,
                    columns: record.columns,
                    likely_live,
                });
            }
        }

        if report.ranges_scanned > 0 && report.zeroed_ranges == report.ranges_scanned {
            info!(
                table = %table.name,
                "every freed region is zeroed; secure_delete was likely enabled"
            );
        }
        debug!(
            table = %table.name,
            recovered = report.recovered,
            candidates = report.candidates,
            failures = report.decode_failures,
            "finished table scan"
        );
        Ok(report)
    }

    /// Decode the live rows of a table through the same record decoder
    /// the recovery path uses.
    pub fn live_rows(&self, table: &TableInfo) -> Result<Vec<LiveRow>> {
        let mut rows = Vec::new();
        let Some(tree) = self.trees.get(&table.name) else {
            return Ok(rows);
        };
        for &leaf_no in &tree.leaves {
            let page = self.pager.page(leaf_no)?;
            let header_offset = btree_header_offset(leaf_no);
            let header = BtreePageHeader::parse(&page, header_offset)?;
            for ptr in header.cell_pointers(&page, header_offset)? {
                match self.decode_live_cell(&page, ptr as usize) {
                    Ok((rowid, record)) => rows.push(LiveRow {
                        rowid,
                        columns: record.columns,
                    }),
                    Err(err) => {
                        warn!(page = leaf_no.get(), offset = ptr, error = %err, "undecodable live cell");
                    }
                }
            }
        }
        Ok(rows)
    }

    /// Search freed regions (or, optionally, every page) for a byte
    /// pattern. Matches report the page and the in-page offset.
    pub fn grep(&self, pattern: &str, all_pages: bool) -> Result<Vec<GrepMatch>> {
        let regex = RegexBuilder::new(pattern)
            .unicode(false)
            .build()
            .map_err(|err| ExhumeError::BadPattern {
                table: "<grep>".to_owned(),
                detail: err.to_string(),
            })?;

        let mut matches = Vec::new();
        if all_pages {
            for n in 1..=self.pager.page_count() {
                let page_no = PageNumber::new(n).expect("n >= 1");
                let page = self.pager.page(page_no)?;
                for m in regex.find_iter(&page) {
                    matches.push(GrepMatch {
                        page: n,
                        offset: m.start(),
                    });
                }
            }
            return Ok(matches);
        }

        for (page_no, range) in self.freed_ranges()? {
            let page = self.pager.page(page_no)?;
            for m in regex.find_iter(&page[range.start..range.end]) {
                matches.push(GrepMatch {
                    page: page_no.get(),
                    offset: range.start + m.start(),
                });
            }
        }
        Ok(matches)
    }

    // -- internals ---------------------------------------------------------

    /// Decode the candidate starting at `cand` within `hay`.
    ///
    /// Returns the record, the bytes it consumed from the range, and the
    /// full payload for bytewise comparison against live rows. When the
    /// synthesized payload length exceeds the page's overflow threshold,
    /// the freed cell must have spilled: the local split is recomputed
    /// from the payload length and the trailing 4-byte overflow pointer
    /// is chased.
    fn decode_candidate(
        &self,
        hay: &[u8],
        cand: usize,
        table: &TableInfo,
    ) -> Result<(Record, usize, Vec<u8>)> {
        let buf = &hay[cand..];
        let usable = self.pager.usable_size();
        let encoding = self.pager.header().text_encoding;
        let extent = CarvedExtent::parse(buf, table.arity())?;

        if extent.payload_len <= LocalPayload::table_leaf_threshold(usable) {
            let record = Record::decode_carved(buf, table.arity(), encoding)?;
            let consumed = record.total_len;
            let payload = buf[..consumed].to_vec();
            return Ok((record, consumed, payload));
        }

        let split = LocalPayload::for_table_leaf(usable, extent.payload_len);
        let needed = split.local + 4;
        if buf.len() < needed {
            return Err(ExhumeError::Truncated {
                needed,
                available: buf.len(),
            });
        }
        let first = PageNumber::new(be_u32(buf, split.local)?).ok_or({
            // A zeroed pointer cannot supply the remaining payload.
            ExhumeError::OverflowTruncated {
                got: split.local,
                expected: extent.payload_len as usize,
            }
        })?;
        let payload = read_overflow_chain(
            &buf[..split.local],
            first,
            extent.payload_len,
            usable,
            &mut |n| self.pager.page(n),
        )?;
        let record = decode_reassembled(&payload, table.arity(), encoding)?;
        Ok((record, needed, payload))
    }

    /// Candidate regions for one table: freeblocks and unallocated bands
    /// of its live leaves, then attributed free-list leaves.
    fn candidate_regions(
        &self,
        table: &TableInfo,
        tree: &TableTree,
    ) -> Result<Vec<(PageNumber, FreeRange, RowSource)>> {
        let mut regions = Vec::new();

        for &leaf_no in &tree.leaves {
            let page = self.pager.page(leaf_no)?;
            let header_offset = btree_header_offset(leaf_no);
            let header = BtreePageHeader::parse(&page, header_offset)?;

            match scan_freeblocks(&page, &header, leaf_no, self.pager.usable_size()) {
                Ok(ranges) => {
                    regions.extend(
                        ranges
                            .into_iter()
                            .filter(|r| !r.is_empty())
                            .map(|r| (leaf_no, r, RowSource::Freeblock)),
                    );
                    if let Some(band) = unallocated_band(&header, header_offset, page.len()) {
                        regions.push((leaf_no, band, RowSource::Unallocated));
                    }
                }
                Err(err) => {
                    // Malformed chain: skip the whole page, keep going.
                    warn!(table = %table.name, page = leaf_no.get(), error = %err, "skipping page");
                }
            }
        }

        let usable = self.pager.usable_size() as usize;
        for (&leaf_no, tables) in &self.freelist_attribution {
            if tables.iter().any(|name| *name == table.name) {
                let page = self.pager.page(leaf_no)?;
                regions.push((
                    leaf_no,
                    FreeRange {
                        start: 0,
                        end: usable.min(page.len()),
                    },
                    RowSource::FreelistLeaf,
                ));
            }
        }

        Ok(regions)
    }

    /// Freed ranges across the whole file, for `grep`: freeblocks and
    /// bands of every classified B-tree leaf plus all free-list leaves.
    fn freed_ranges(&self) -> Result<Vec<(PageNumber, FreeRange)>> {
        let mut ranges = Vec::new();
        let usable = self.pager.usable_size();

        for page_no in self.page_map.pages_with_role(crate::PageRole::TableLeaf) {
            let page = self.pager.page(page_no)?;
            let header_offset = btree_header_offset(page_no);
            let Ok(header) = BtreePageHeader::parse(&page, header_offset) else {
                continue;
            };
            if let Ok(blocks) = scan_freeblocks(&page, &header, page_no, usable) {
                ranges.extend(blocks.into_iter().map(|r| (page_no, r)));
                if let Some(band) = unallocated_band(&header, header_offset, page.len()) {
                    ranges.push((page_no, band));
                }
            }
        }
        for &leaf in &self.freelist.leaves {
            let page = self.pager.page(leaf)?;
            ranges.push((
                leaf,
                FreeRange {
                    start: 0,
                    end: (usable as usize).min(page.len()),
                },
            ));
        }
        Ok(ranges)
    }

    /// Payload bytes of every live row in the tree, for duplicate
    /// suppression.
    fn live_payload_set(&self, tree: &TableTree) -> HashSet<Vec<u8>> {
        let mut payloads = HashSet::new();
        for &leaf_no in &tree.leaves {
            let Ok(page) = self.pager.page(leaf_no) else {
                continue;
            };
            let header_offset = btree_header_offset(leaf_no);
            let Ok(header) = BtreePageHeader::parse(&page, header_offset) else {
                continue;
            };
            let Ok(pointers) = header.cell_pointers(&page, header_offset) else {
                continue;
            };
            for ptr in pointers {
                if let Ok(payload) = self.cell_payload(&page, ptr as usize) {
                    payloads.insert(payload);
                }
            }
        }
        payloads
    }

    /// Assemble a live cell's full payload, chasing overflow if needed.
    fn cell_payload(&self, page: &[u8], offset: usize) -> Result<Vec<u8>> {
        let cell = TableLeafCell::parse(page, offset, self.pager.usable_size())?;
        match cell.first_overflow {
            None => Ok(page[cell.local_payload.clone()].to_vec()),
            Some(first) => read_overflow_chain(
                &page[cell.local_payload.clone()],
                first,
                cell.payload_len,
                self.pager.usable_size(),
                &mut |n| self.pager.page(n),
            ),
        }
    }

    fn decode_live_cell(&self, page: &[u8], offset: usize) -> Result<(i64, Record)> {
        let cell = TableLeafCell::parse(page, offset, self.pager.usable_size())?;
        let payload = self.cell_payload(page, offset)?;
        let record = Record::decode(&payload, self.pager.header().text_encoding)?;
        Ok((cell.rowid, record))
    }

    /// Decide which tables each free-list leaf may have belonged to.
    ///
    /// With a ptrmap: stale B-tree entries are followed to their root;
    /// leaves the map labels as former overflow pages are excluded; for
    /// the rest, a freed page that still parses as a table leaf is
    /// matched against table signatures (column count plus affinity),
    /// and attributed when exactly one table fits. Without a ptrmap,
    /// every leaf is attempted against every table.
    fn attribute_freelist_leaves(&self) -> HashMap<PageNumber, Vec<String>> {
        let mut attribution: HashMap<PageNumber, Vec<String>> = HashMap::new();
        let all_tables: Vec<String> =
            self.schema.tables.iter().map(|t| t.name.clone()).collect();

        for &leaf in &self.freelist.leaves {
            let tables = match &self.ptrmap {
                None => all_tables.clone(),
                Some(ptrmap) => match ptrmap.lookup(leaf) {
                    Some(entry)
                        if matches!(
                            entry.kind,
                            PtrmapKind::OverflowFirst | PtrmapKind::OverflowLater
                        ) =>
                    {
                        // Former overflow pages hold payload middles, not
                        // record headers; they are not scanned.
                        debug!(page = leaf.get(), "freelist leaf was an overflow page");
                        Vec::new()
                    }
                    _ => match ptrmap.root_of(leaf).and_then(|root| {
                        self.schema.tables.iter().find(|t| t.root == root)
                    }) {
                        Some(table) => vec![table.name.clone()],
                        None => self.signature_matches(leaf),
                    },
                },
            };
            if !tables.is_empty() {
                attribution.insert(leaf, tables);
            }
        }

        debug!(attributed = attribution.len(), "attributed freelist leaves");
        attribution
    }

    /// Match a freed page's first live record against each table's
    /// column signature; unambiguous single matches win.
    fn signature_matches(&self, leaf: PageNumber) -> Vec<String> {
        let Ok(page) = self.pager.page(leaf) else {
            return Vec::new();
        };
        let Ok(header) = BtreePageHeader::parse(&page, 0) else {
            return Vec::new();
        };
        if header.page_type != exhume_format::page::PageType::TableLeaf {
            return Vec::new();
        }
        let Ok(pointers) = header.cell_pointers(&page, 0) else {
            return Vec::new();
        };
        let Some(&first) = pointers.first() else {
            return Vec::new();
        };
        let Ok((_, record)) = self.decode_live_cell(&page, first as usize) else {
            return Vec::new();
        };

        let matches: Vec<String> = self
            .schema
            .tables
            .iter()
            .filter(|table| {
                record.columns.len() == table.arity()
                    && record
                        .columns
                        .iter()
                        .zip(&table.columns)
                        .all(|(col, def)| col.value.compatible_with(def.affinity))
            })
            .map(|table| table.name.clone())
            .collect();

        match matches.len() {
            0 => {
                debug!(page = leaf.get(), "freed leaf matches no table signature");
                Vec::new()
            }
            1 => matches,
            n => {
                warn!(
                    page = leaf.get(),
                    candidates = n,
                    "freed leaf matches multiple table signatures, leaving it unattributed"
                );
                Vec::new()
            }
        }
    }
}
