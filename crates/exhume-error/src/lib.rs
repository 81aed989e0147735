use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for exhume operations.
///
/// Variants are split along the recovery pipeline: file-level failures are
/// fatal, per-structure failures skip the structure, and per-candidate
/// decode failures are expected noise that the orchestrator counts without
/// logging.
#[derive(Error, Debug)]
pub enum ExhumeError {
    // === File / header ===
    /// The file does not start with the SQLite magic string.
    #[error("file is not a database: '{path}'")]
    NotADatabase { path: PathBuf },

    /// The header's page size is not a power of two in [512, 65536].
    #[error("unsupported page size: {size}")]
    UnsupportedPageSize { size: u32 },

    /// The database header failed a structural validity check.
    #[error("database header is malformed: {detail}")]
    BadFileHeader { detail: String },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer bytes than a full page were available at the page's offset.
    #[error("short read on page {page}: expected {expected} bytes, got {actual}")]
    ShortRead {
        page: u32,
        expected: usize,
        actual: usize,
    },

    /// A page number outside [1, page_count] was requested.
    #[error("page {page} out of range (database has {page_count} pages)")]
    PageOutOfRange { page: u32, page_count: u32 },

    // === Page structures ===
    /// A B-tree walk hit a cycle, an invalid page type, or a bad child
    /// pointer. The affected table is skipped.
    #[error("corrupt b-tree under root {root}: {detail}")]
    CorruptTree { root: u32, detail: String },

    /// The intra-page freeblock chain is out of order or escapes the page.
    /// Scanning of the affected page stops.
    #[error("malformed freeblock chain on page {page}: {detail}")]
    MalformedFreeblocks { page: u32, detail: String },

    /// The page's B-tree header is invalid (bad type flag, truncated
    /// header, zero child pointer).
    #[error("bad page header: {detail}")]
    BadPageHeader { detail: String },

    // === Record decoding (candidate noise) ===
    /// The record header length is implausible for the payload.
    #[error("bad record header: {detail}")]
    BadRecordHeader { detail: String },

    /// A buffer ended in the middle of a fixed-width integer or varint.
    #[error("truncated value: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    /// Nine varint bytes were consumed without producing a valid value.
    #[error("varint overflow")]
    VarintOverflow,

    /// A reserved serial type (10 or 11) appeared in a record header.
    #[error("reserved serial type {serial_type} in record header")]
    ReservedSerialType { serial_type: u64 },

    // === Overflow chains ===
    /// The overflow chain ended before supplying the full payload.
    #[error("overflow chain truncated: got {got} of {expected} payload bytes")]
    OverflowTruncated { got: usize, expected: usize },

    /// The overflow chain revisited a page.
    #[error("overflow chain cycle at page {page}")]
    OverflowCycle { page: u32 },

    // === Configuration ===
    /// The heuristics file could not be loaded or is malformed.
    #[error("configuration error: {detail}")]
    Config { detail: String },

    /// A heuristic pattern failed to compile as a byte regex.
    #[error("bad pattern for table \"{table}\": {detail}")]
    BadPattern { table: String, detail: String },

    // === Output adapters ===
    /// Refusing to clobber an existing output file or directory.
    #[error("output path exists: '{path}'")]
    OutputExists { path: PathBuf },

    /// The undelete writer failed inside the SQLite client.
    #[error("undelete failed: {detail}")]
    Undelete { detail: String },
}

impl ExhumeError {
    /// Whether this error is expected per-candidate decode noise.
    ///
    /// Noise errors are counted by the orchestrator but never logged
    /// individually; anything else is worth at least one log line.
    #[must_use]
    pub const fn is_candidate_noise(&self) -> bool {
        matches!(
            self,
            Self::BadRecordHeader { .. }
                | Self::Truncated { .. }
                | Self::VarintOverflow
                | Self::ReservedSerialType { .. }
        )
    }

    /// Whether the failure invalidates the whole run rather than one
    /// table, page, or candidate.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotADatabase { .. }
                | Self::UnsupportedPageSize { .. }
                | Self::BadFileHeader { .. }
                | Self::Io(_)
                | Self::ShortRead { .. }
                | Self::Config { .. }
                | Self::BadPattern { .. }
                | Self::OutputExists { .. }
                | Self::Undelete { .. }
        )
    }

    /// Process exit code for this error (for CLI use).
    ///
    /// Exit codes 0 (rows recovered) and 2 (clean run, nothing recovered)
    /// are decided by the caller from the row count; errors map to 1
    /// except configuration problems, which map to 3.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::BadPattern { .. } => 3,
            _ => 1,
        }
    }

    /// Create a header-validation error.
    pub fn bad_file_header(detail: impl Into<String>) -> Self {
        Self::BadFileHeader {
            detail: detail.into(),
        }
    }

    /// Create a corrupt-tree error.
    pub fn corrupt_tree(root: u32, detail: impl Into<String>) -> Self {
        Self::CorruptTree {
            root,
            detail: detail.into(),
        }
    }

    /// Create a page-header rejection.
    pub fn bad_page_header(detail: impl Into<String>) -> Self {
        Self::BadPageHeader {
            detail: detail.into(),
        }
    }

    /// Create a record-header rejection.
    pub fn bad_record_header(detail: impl Into<String>) -> Self {
        Self::BadRecordHeader {
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `ExhumeError`.
pub type Result<T> = std::result::Result<T, ExhumeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_not_a_database() {
        let err = ExhumeError::NotADatabase {
            path: PathBuf::from("/tmp/x.db"),
        };
        assert_eq!(err.to_string(), "file is not a database: '/tmp/x.db'");
    }

    #[test]
    fn display_short_read() {
        let err = ExhumeError::ShortRead {
            page: 7,
            expected: 4096,
            actual: 100,
        };
        assert_eq!(
            err.to_string(),
            "short read on page 7: expected 4096 bytes, got 100"
        );
    }

    #[test]
    fn candidate_noise_classification() {
        assert!(ExhumeError::VarintOverflow.is_candidate_noise());
        assert!(ExhumeError::Truncated {
            needed: 4,
            available: 1
        }
        .is_candidate_noise());
        assert!(ExhumeError::bad_record_header("header longer than payload")
            .is_candidate_noise());
        assert!(!ExhumeError::OverflowCycle { page: 3 }.is_candidate_noise());
        assert!(!ExhumeError::corrupt_tree(2, "cycle").is_candidate_noise());
    }

    #[test]
    fn fatality() {
        assert!(ExhumeError::UnsupportedPageSize { size: 300 }.is_fatal());
        assert!(ExhumeError::config("bad json").is_fatal());
        assert!(!ExhumeError::MalformedFreeblocks {
            page: 4,
            detail: String::new()
        }
        .is_fatal());
        assert!(!ExhumeError::OverflowTruncated {
            got: 10,
            expected: 20
        }
        .is_fatal());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExhumeError::config("x").exit_code(), 3);
        assert_eq!(
            ExhumeError::BadPattern {
                table: "t".to_owned(),
                detail: "unbalanced".to_owned()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            ExhumeError::NotADatabase {
                path: PathBuf::new()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ExhumeError = io_err.into();
        assert!(matches!(err, ExhumeError::Io(_)));
        assert!(err.is_fatal());
    }
}
