//! CSV output adapter.
//!
//! Each table's recovered rows become one CSV file (or stdout when a
//! single table is requested). The leading columns identify where the
//! row was carved from; the rest are the table's declared columns.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use exhume_error::{ExhumeError, Result};
use exhume_recover::{RecoveredRow, Session, TableInfo};
use tracing::{info, warn};

use crate::output_dir;

/// Dump recovered rows. Returns the number of rows written (not
/// counting likely-live rows unless they were requested).
pub fn dump(
    session: &Session,
    only_table: Option<&str>,
    include_live: bool,
    output_dir: Option<&Path>,
    db_path: &Path,
) -> Result<usize> {
    if let Some(name) = only_table {
        let Some(table) = session.tables().iter().find(|t| t.name == name) else {
            return Err(ExhumeError::config(format!("no such table: {name}")));
        };
        let rows = collect_rows(session, table, include_live)?;
        write_table(std::io::stdout().lock(), table, &rows)?;
        return Ok(rows.len());
    }

    let out_dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => output_dir::generate(db_path)?,
    };
    if out_dir.exists() {
        return Err(ExhumeError::OutputExists { path: out_dir });
    }
    std::fs::create_dir_all(&out_dir)?;

    let mut total = 0;
    for table in session.tables() {
        let rows = collect_rows(session, table, include_live)?;
        if rows.is_empty() {
            continue;
        }
        let path = out_dir.join(format!("{}.csv", table.name));
        let file = File::create(&path)?;
        write_table(file, table, &rows)?;
        info!(table = %table.name, rows = rows.len(), path = %path.display(), "wrote CSV");
        total += rows.len();
    }
    if total == 0 {
        warn!("no rows recovered, nothing written");
    }
    Ok(total)
}

fn collect_rows(
    session: &Session,
    table: &TableInfo,
    include_live: bool,
) -> Result<Vec<RecoveredRow>> {
    let mut rows = Vec::new();
    let report = session.recover_table(table, &mut |row| {
        if include_live || !row.likely_live {
            rows.push(row);
        }
    })?;
    if !report.scanned {
        warn!(table = %table.name, "table left unscanned (no heuristic)");
    }
    Ok(rows)
}

fn write_table<W: Write>(writer: W, table: &TableInfo, rows: &[RecoveredRow]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);

    let mut header = vec![
        "source".to_owned(),
        "page".to_owned(),
        "offset".to_owned(),
        "rowid".to_owned(),
    ];
    header.extend(table.columns.iter().map(|c| c.name.clone()));
    csv.write_record(&header).map_err(csv_err)?;

    for row in rows {
        let mut record = vec![
            row.source.to_string(),
            row.page.to_string(),
            row.offset.to_string(),
            row.rowid.map(|r| r.to_string()).unwrap_or_default(),
        ];
        record.extend(row.columns.iter().map(|c| c.value.to_display_string()));
        csv.write_record(&record).map_err(csv_err)?;
    }
    csv.flush()?;
    Ok(())
}

fn csv_err(err: csv::Error) -> ExhumeError {
    ExhumeError::Io(std::io::Error::other(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use exhume_recover::RowSource;
    use exhume_types::value::{Affinity, Column};
    use exhume_types::Value;

    fn test_table() -> TableInfo {
        TableInfo {
            name: "t".to_owned(),
            root: exhume_types::PageNumber::new(2).unwrap(),
            columns: vec![
                exhume_recover::ColumnDef {
                    name: "a".to_owned(),
                    decl_type: Some("INT".to_owned()),
                    affinity: Affinity::Integer,
                },
                exhume_recover::ColumnDef {
                    name: "b".to_owned(),
                    decl_type: Some("TEXT".to_owned()),
                    affinity: Affinity::Text,
                },
            ],
            sql: "CREATE TABLE t (a INT, b TEXT)".to_owned(),
        }
    }

    #[test]
    fn writes_header_and_rows() {
        let row = RecoveredRow {
            table: "t".to_owned(),
            source: RowSource::Freeblock,
            page: 2,
            offset: 304,
            rowid: None,
            columns: vec![
                Column {
                    serial_type: 1,
                    value: Value::Integer(2),
                    lossy: false,
                },
                Column {
                    serial_type: 15,
                    value: Value::Text("y".to_owned()),
                    lossy: false,
                },
            ],
            likely_live: false,
        };

        let mut out = Vec::new();
        write_table(&mut out, &test_table(), &[row]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("source,page,offset,rowid,a,b"));
        assert_eq!(lines.next(), Some("freeblock,2,304,,2,y"));
        assert_eq!(lines.next(), None);
    }
}
