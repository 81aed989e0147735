//! The `undelete` adapter: copy the database and re-insert recovered
//! rows through an ordinary SQLite client.
//!
//! The source file is never touched; all inserts go to the copy. Rows
//! that violate a constraint in the copy are skipped with a warning.

use std::path::{Path, PathBuf};

use exhume_error::{ExhumeError, Result};
use exhume_recover::{RecoveredRow, Session, TableInfo};
use exhume_types::Value;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use tracing::{info, warn};

/// Copy the database beside the input and insert every recovered row.
/// Returns the number of rows successfully inserted.
pub fn run(session: &Session, db_path: &Path, output: Option<&Path>) -> Result<usize> {
    let output_path = match output {
        Some(path) => path.to_path_buf(),
        None => default_output_path(db_path),
    };
    if output_path.exists() {
        return Err(ExhumeError::OutputExists { path: output_path });
    }
    std::fs::copy(db_path, &output_path)?;

    let conn = Connection::open(&output_path).map_err(undelete_err)?;
    let mut inserted_total = 0;

    for table in session.tables() {
        let mut rows: Vec<RecoveredRow> = Vec::new();
        session.recover_table(table, &mut |row| {
            if !row.likely_live {
                rows.push(row);
            }
        })?;
        if rows.is_empty() {
            continue;
        }

        inserted_total += insert_rows(&conn, table, &rows)?;
    }

    info!(
        inserted = inserted_total,
        output = %output_path.display(),
        "undelete complete"
    );
    Ok(inserted_total)
}

/// `<db>.undeleted` next to the input.
fn default_output_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".undeleted");
    PathBuf::from(name)
}

fn insert_rows(conn: &Connection, table: &TableInfo, rows: &[RecoveredRow]) -> Result<usize> {
    let placeholders = (1..=table.arity())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO \"{}\" VALUES ({placeholders})",
        table.name.replace('"', "\"\"")
    );
    let mut stmt = conn.prepare(&sql).map_err(undelete_err)?;

    let mut inserted = 0;
    let mut violations = 0;
    for row in rows {
        let params: Vec<SqlValue> = row.columns.iter().map(|c| to_sql_value(&c.value)).collect();
        match stmt.execute(rusqlite::params_from_iter(params)) {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, message))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                violations += 1;
                warn!(
                    table = %table.name,
                    page = row.page,
                    offset = row.offset,
                    detail = message.as_deref().unwrap_or("constraint violation"),
                    "skipping row that violates a constraint"
                );
            }
            Err(err) => {
                warn!(table = %table.name, error = %err, "insert failed, skipping row");
            }
        }
    }
    if violations > 0 {
        warn!(table = %table.name, violations, "rows skipped for constraint violations");
    }
    info!(table = %table.name, inserted, "inserted recovered rows");
    Ok(inserted)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn undelete_err(err: rusqlite::Error) -> ExhumeError {
    ExhumeError::Undelete {
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_is_sibling() {
        assert_eq!(
            default_output_path(Path::new("/tmp/places.sqlite")),
            PathBuf::from("/tmp/places.sqlite.undeleted")
        );
    }

    #[test]
    fn sql_values_roundtrip_types() {
        assert_eq!(to_sql_value(&Value::Null), SqlValue::Null);
        assert_eq!(to_sql_value(&Value::Integer(-3)), SqlValue::Integer(-3));
        assert_eq!(to_sql_value(&Value::Float(0.5)), SqlValue::Real(0.5));
        assert_eq!(
            to_sql_value(&Value::Text("x".to_owned())),
            SqlValue::Text("x".to_owned())
        );
        assert_eq!(
            to_sql_value(&Value::Blob(vec![1, 2])),
            SqlValue::Blob(vec![1, 2])
        );
    }

}
