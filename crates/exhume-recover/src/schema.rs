//! Reading the schema table and extracting column lists from `CREATE
//! TABLE` text.
//!
//! The schema table is an ordinary table B-tree rooted at page 1 whose
//! rows are `(type, name, tbl_name, rootpage, sql)`. Recovery only needs
//! each user table's root page, column names, and affinity hints, so the
//! SQL is handled with a bracket- and quote-aware splitter rather than a
//! parser.

use exhume_error::{ExhumeError, Result};
use exhume_format::overflow::read_overflow_chain;
use exhume_format::page::{BtreePageHeader, TableLeafCell, btree_header_offset};
use exhume_format::pager::Pager;
use exhume_format::record::Record;
use exhume_types::value::Affinity;
use exhume_types::{PageNumber, Value};
use tracing::{debug, info, warn};

use crate::btree::walk_table_tree;

/// Column lists of the reserved `sqlite_*` tables. `sqlite_master` has
/// no schema row of its own and is registered from this list; the
/// others fall back to it when their DDL resists extraction.
pub const BUILTIN_TABLE_COLUMNS: &[(&str, &[&str])] = &[
    ("sqlite_master", &["type", "name", "tbl_name", "rootpage", "sql"]),
    ("sqlite_sequence", &["name", "seq"]),
    ("sqlite_stat1", &["tbl", "idx", "stat"]),
    ("sqlite_stat2", &["tbl", "idx", "sampleno", "sample"]),
    ("sqlite_stat3", &["tbl", "idx", "nEq", "nLt", "nDLt", "sample"]),
    ("sqlite_stat4", &["tbl", "idx", "nEq", "nLt", "nDLt", "sample"]),
];

/// The fixed column list of a reserved table, if `name` is one.
#[must_use]
pub fn builtin_columns(name: &str) -> Option<&'static [&'static str]> {
    BUILTIN_TABLE_COLUMNS
        .iter()
        .find(|(table, _)| *table == name)
        .map(|(_, columns)| *columns)
}

/// Column definitions for a fixed column list: names only, no declared
/// types.
fn builtin_defs(columns: &[&str]) -> Vec<ColumnDef> {
    columns
        .iter()
        .map(|name| ColumnDef {
            name: (*name).to_owned(),
            decl_type: None,
            affinity: Affinity::Any,
        })
        .collect()
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// The declared type token, when one was present.
    pub decl_type: Option<String>,
    pub affinity: Affinity,
}

/// A recoverable table: name, root page, and declared columns.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub root: PageNumber,
    pub columns: Vec<ColumnDef>,
    pub sql: String,
}

impl TableInfo {
    /// Declared column count.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// Column names in declaration order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// The parsed schema.
#[derive(Debug, Default)]
pub struct Schema {
    /// Recoverable tables sorted by name: the user tables, any reserved
    /// `sqlite_*` tables present in the file, and `sqlite_master`
    /// itself.
    pub tables: Vec<TableInfo>,
    /// Schema rows that existed but could not be used, by name.
    pub skipped: Vec<String>,
}

impl Schema {
    /// Read every `type='table'` row out of the schema B-tree, after
    /// registering `sqlite_master` itself from its fixed column list.
    ///
    /// Rows that fail to decode or whose SQL resists column extraction
    /// are warned about and recorded in `skipped`; they never fail the
    /// run.
    pub fn parse(pager: &Pager) -> Result<Self> {
        let mut schema = Self::default();

        // The schema table itself has no schema row; register it from
        // its fixed column list so its freed regions are recoverable
        // like any other table's.
        if let Some(columns) = builtin_columns("sqlite_master") {
            schema.tables.push(TableInfo {
                name: "sqlite_master".to_owned(),
                root: PageNumber::ONE,
                columns: builtin_defs(columns),
                sql: "CREATE TABLE sqlite_master (type TEXT, name TEXT, tbl_name TEXT, \
                      rootpage INTEGER, sql TEXT)"
                    .to_owned(),
            });
        }

        let tree = walk_table_tree(pager, PageNumber::ONE)?;

        for leaf_no in tree.leaves {
            let page = pager.page(leaf_no)?;
            let header_offset = btree_header_offset(leaf_no);
            let header = BtreePageHeader::parse(&page, header_offset)?;

            for ptr in header.cell_pointers(&page, header_offset)? {
                match read_schema_row(pager, &page, ptr as usize) {
                    Ok(Some(row)) => schema.add_row(pager, row),
                    Ok(None) => {} // not a table row
                    Err(err) => {
                        warn!(page = leaf_no.get(), offset = ptr, error = %err, "undecodable schema row");
                    }
                }
            }
        }

        schema.tables.sort_by(|a, b| a.name.cmp(&b.name));
        info!(
            tables = schema.tables.len(),
            skipped = schema.skipped.len(),
            "parsed schema"
        );
        Ok(schema)
    }

    fn add_row(&mut self, pager: &Pager, row: SchemaRow) {
        let Some(root) = PageNumber::new(row.rootpage).filter(|r| r.get() <= pager.page_count())
        else {
            warn!(table = %row.name, rootpage = row.rootpage, "schema row has unusable root page");
            self.skipped.push(row.name);
            return;
        };
        let columns = match extract_columns(&row.sql) {
            Some(columns) if !columns.is_empty() => columns,
            _ => match builtin_columns(&row.name) {
                Some(builtin) => {
                    debug!(table = %row.name, "using the fixed column list for a reserved table");
                    builtin_defs(builtin)
                }
                None => {
                    warn!(table = %row.name, sql = %row.sql, "could not extract a column list");
                    self.skipped.push(row.name);
                    return;
                }
            },
        };
        debug!(
            table = %row.name,
            root = root.get(),
            columns = columns.len(),
            "found table"
        );
        self.tables.push(TableInfo {
            name: row.name,
            root,
            columns,
            sql: row.sql,
        });
    }

    /// Look up a table by name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name == name)
    }
}

struct SchemaRow {
    name: String,
    rootpage: u32,
    sql: String,
}

/// Decode one schema-table cell. Returns `None` for non-table rows
/// (indexes, views, triggers).
fn read_schema_row(pager: &Pager, page: &[u8], offset: usize) -> Result<Option<SchemaRow>> {
    let cell = TableLeafCell::parse(page, offset, pager.usable_size())?;
    let payload = match cell.first_overflow {
        None => page[cell.local_payload.clone()].to_vec(),
        Some(first) => read_overflow_chain(
            &page[cell.local_payload.clone()],
            first,
            cell.payload_len,
            pager.usable_size(),
            &mut |n| pager.page(n),
        )?,
    };
    let record = Record::decode(&payload, pager.header().text_encoding)?;
    if record.columns.len() < 5 {
        return Err(ExhumeError::bad_record_header(format!(
            "schema row has {} columns",
            record.columns.len()
        )));
    }

    let Value::Text(ref row_type) = record.columns[0].value else {
        return Ok(None);
    };
    if row_type != "table" {
        return Ok(None);
    }
    let Value::Text(ref name) = record.columns[1].value else {
        return Ok(None);
    };
    let rootpage = match record.columns[3].value {
        Value::Integer(n) if n > 0 => u32::try_from(n).unwrap_or(0),
        _ => 0,
    };
    let Value::Text(ref sql) = record.columns[4].value else {
        return Ok(None);
    };

    Ok(Some(SchemaRow {
        name: name.clone(),
        rootpage,
        sql: sql.clone(),
    }))
}

// ---------------------------------------------------------------------------
// CREATE TABLE column extraction
// ---------------------------------------------------------------------------

/// Keywords that open a table-level constraint clause rather than a
/// column definition.
const CONSTRAINT_KEYWORDS: &[&str] = &["PRIMARY", "UNIQUE", "CHECK", "FOREIGN", "CONSTRAINT"];

/// Extract the declared columns from a `CREATE TABLE` statement.
///
/// Finds the outermost parenthesised list, splits it at top-level commas
/// (respecting nested parentheses and quoted identifiers), and takes the
/// first whitespace-delimited token of each entry as the column name and
/// the second as its type hint. Returns `None` when no column list can
/// be located.
#[must_use]
pub fn extract_columns(sql: &str) -> Option<Vec<ColumnDef>> {
    let open = sql.find('(')?;
    let body = balanced_body(&sql[open..])?;

    let mut columns = Vec::new();
    for item in split_top_level(body) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut tokens = tokenize(item);
        let Some(first) = tokens.next() else {
            continue;
        };
        let keyword = first.to_ascii_uppercase();
        if CONSTRAINT_KEYWORDS.iter().any(|k| keyword == *k) {
            continue;
        }
        let name = unquote(&first);
        let decl_type = tokens.next().map(|t| unquote(&t));
        let affinity = decl_type
            .as_deref()
            .map_or(Affinity::Any, Affinity::from_type_name);
        columns.push(ColumnDef {
            name,
            decl_type,
            affinity,
        });
    }
    Some(columns)
}

/// Given a string starting with `(`, return the text inside the matching
/// closing parenthesis.
fn balanced_body(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '[') => quote = Some(']'),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split at commas that are not inside parentheses or quotes.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '[') => quote = Some(']'),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                items.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&s[start..]);
    items
}

/// Iterate whitespace-delimited tokens, keeping quoted identifiers (with
/// any embedded whitespace) intact.
fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    let mut chars = s.char_indices().peekable();
    std::iter::from_fn(move || {
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
            chars.next();
        }
        let (start, first) = *chars.peek()?;
        let close = match first {
            '\'' | '"' | '`' => Some(first),
            '[' => Some(']'),
            _ => None,
        };
        chars.next();
        if let Some(close) = close {
            for (i, c) in chars.by_ref() {
                if c == close {
                    return Some(s[start..=i].to_owned());
                }
            }
            return Some(s[start..].to_owned());
        }
        let mut end = s.len();
        while let Some(&(i, c)) = chars.peek() {
            if c.is_whitespace() {
                end = i;
                break;
            }
            chars.next();
        }
        if chars.peek().is_none() {
            Some(s[start..].to_owned())
        } else {
            Some(s[start..end].to_owned())
        }
    })
}

/// Strip one layer of identifier quoting.
fn unquote(token: &str) -> String {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 {
        let stripped = match (bytes[0], bytes[bytes.len() - 1]) {
            (b'"', b'"') | (b'\'', b'\'') | (b'`', b'`') => Some(&token[1..token.len() - 1]),
            (b'[', b']') => Some(&token[1..token.len() - 1]),
            _ => None,
        };
        if let Some(inner) = stripped {
            return inner.to_owned();
        }
    }
    token.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{DbBuilder, leaf_page_with_cells_at, encode_cell, schema_row_record};

    #[test]
    fn extracts_simple_columns() {
        let cols = extract_columns("CREATE TABLE t (a INT, b TEXT, c)").unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[0].name, "a");
        assert_eq!(cols[0].affinity, Affinity::Integer);
        assert_eq!(cols[1].name, "b");
        assert_eq!(cols[1].affinity, Affinity::Text);
        assert_eq!(cols[2].name, "c");
        assert_eq!(cols[2].decl_type, None);
        assert_eq!(cols[2].affinity, Affinity::Any);
    }

    #[test]
    fn skips_table_level_constraints() {
        let sql = "CREATE TABLE t (id INTEGER, name TEXT, \
                   PRIMARY KEY (id), UNIQUE (name), \
                   CHECK (id > 0), FOREIGN KEY (id) REFERENCES u(id), \
                   CONSTRAINT c1 CHECK (name != ''))";
        let cols = extract_columns(sql).unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "id");
        assert_eq!(cols[1].name, "name");
    }

    #[test]
    fn respects_nested_parens_and_quotes() {
        let sql = "CREATE TABLE t (a DECIMAL(10,5), b VARCHAR(20) DEFAULT 'x,y', \"weird, name\" TEXT)";
        let cols = extract_columns(sql).unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[0].name, "a");
        assert_eq!(cols[0].decl_type.as_deref(), Some("DECIMAL(10,5)"));
        assert_eq!(cols[0].affinity, Affinity::Numeric);
        assert_eq!(cols[1].name, "b");
        assert_eq!(cols[2].name, "weird, name");
        assert_eq!(cols[2].affinity, Affinity::Text);
    }

    #[test]
    fn column_constraints_do_not_add_columns() {
        let sql = "CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT NOT NULL)";
        let cols = extract_columns(sql).unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "id");
        assert_eq!(cols[0].affinity, Affinity::Integer);
    }

    #[test]
    fn bracketed_identifiers() {
        let cols = extract_columns("CREATE TABLE t ([select] INT, `from` TEXT)").unwrap();
        assert_eq!(cols[0].name, "select");
        assert_eq!(cols[1].name, "from");
    }

    #[test]
    fn no_parenthesised_list() {
        assert!(extract_columns("CREATE TABLE t AS SELECT 1").is_none());
    }

    #[test]
    fn parses_schema_from_page_one() {
        // Page 1 carries the schema leaf; page 2 is the table's root.
        let row = schema_row_record("t", 2, "CREATE TABLE t (a INT, b TEXT)");
        let page1 = leaf_page_with_cells_at(512, 100, &[encode_cell(1, &row)]);
        let db = DbBuilder::new(512)
            .page1(page1)
            .page(crate::testutil::leaf_page_with_cells(512, &[]))
            .build();
        let pager = Pager::open(db.path()).unwrap();
        let schema = Schema::parse(&pager).unwrap();
        // The schema table itself is always present alongside the user
        // table.
        assert_eq!(schema.tables.len(), 2);
        let t = schema.table("t").unwrap();
        assert_eq!(t.root.get(), 2);
        assert_eq!(t.arity(), 2);
        assert_eq!(t.column_names(), vec!["a", "b"]);
    }

    #[test]
    fn schema_table_is_registered_with_fixed_columns() {
        let db = DbBuilder::new(512)
            .page1(leaf_page_with_cells_at(512, 100, &[]))
            .build();
        let pager = Pager::open(db.path()).unwrap();
        let schema = Schema::parse(&pager).unwrap();
        let master = schema.table("sqlite_master").unwrap();
        assert_eq!(master.root, PageNumber::ONE);
        assert_eq!(
            master.column_names(),
            vec!["type", "name", "tbl_name", "rootpage", "sql"]
        );
        assert!(master.columns.iter().all(|c| c.affinity == Affinity::Any));
    }

    #[test]
    fn reserved_tables_join_with_their_columns() {
        // sqlite_sequence's own DDL parses; a stats table with an
        // unusable sql column falls back to the fixed list.
        let rows = [
            encode_cell(
                1,
                &schema_row_record("sqlite_sequence", 2, "CREATE TABLE sqlite_sequence(name,seq)"),
            ),
            encode_cell(2, &schema_row_record("sqlite_stat1", 3, "")),
        ];
        let page1 = leaf_page_with_cells_at(512, 100, &rows);
        let db = DbBuilder::new(512)
            .page1(page1)
            .page(crate::testutil::leaf_page_with_cells(512, &[]))
            .page(crate::testutil::leaf_page_with_cells(512, &[]))
            .build();
        let pager = Pager::open(db.path()).unwrap();
        let schema = Schema::parse(&pager).unwrap();

        let sequence = schema.table("sqlite_sequence").unwrap();
        assert_eq!(sequence.column_names(), vec!["name", "seq"]);
        let stat = schema.table("sqlite_stat1").unwrap();
        assert_eq!(stat.column_names(), vec!["tbl", "idx", "stat"]);
        assert!(schema.skipped.is_empty());
    }

    #[test]
    fn bad_rootpage_goes_to_skipped() {
        let row = schema_row_record("ghost", 99, "CREATE TABLE ghost (a)");
        let page1 = leaf_page_with_cells_at(512, 100, &[encode_cell(1, &row)]);
        let db = DbBuilder::new(512).page1(page1).build();
        let pager = Pager::open(db.path()).unwrap();
        let schema = Schema::parse(&pager).unwrap();
        assert!(schema.table("ghost").is_none());
        assert_eq!(schema.skipped, vec!["ghost".to_owned()]);
        // Only the always-present schema table remains.
        assert_eq!(schema.tables.len(), 1);
    }

    #[test]
    fn builtin_columns_lookup() {
        assert_eq!(builtin_columns("sqlite_master").unwrap().len(), 5);
        assert_eq!(
            builtin_columns("sqlite_sequence").unwrap(),
            ["name", "seq"].as_slice()
        );
        assert!(builtin_columns("user_table").is_none());
    }
}
