//! Output directory naming for the `csv` subcommand.

use std::path::{Path, PathBuf};

use exhume_error::{ExhumeError, Result};

/// Derive a fresh output directory beside the database: the file name
/// with dots replaced by underscores, suffixed `_1`..`_10` when taken.
pub fn generate(db_path: &Path) -> Result<PathBuf> {
    let parent = db_path.parent().unwrap_or_else(|| Path::new("."));
    let name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().replace('.', "_"))
        .unwrap_or_else(|| "exhume_out".to_owned());

    let plain = parent.join(&name);
    if !plain.exists() {
        return Ok(plain);
    }
    for suffix in 1..=10 {
        let candidate = parent.join(format!("{name}_{suffix}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(ExhumeError::OutputExists { path: plain })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_name_from_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("places.sqlite");
        let out = generate(&db).unwrap();
        assert_eq!(out, dir.path().join("places_sqlite"));
    }

    #[test]
    fn numbered_suffix_when_taken() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("x.db");
        std::fs::create_dir(dir.path().join("x_db")).unwrap();
        assert_eq!(generate(&db).unwrap(), dir.path().join("x_db_1"));

        std::fs::create_dir(dir.path().join("x_db_1")).unwrap();
        assert_eq!(generate(&db).unwrap(), dir.path().join("x_db_2"));
    }

    #[test]
    fn gives_up_after_ten_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("x.db");
        std::fs::create_dir(dir.path().join("x_db")).unwrap();
        for i in 1..=10 {
            std::fs::create_dir(dir.path().join(format!("x_db_{i}"))).unwrap();
        }
        assert!(matches!(
            generate(&db),
            Err(ExhumeError::OutputExists { .. })
        ));
    }
}
