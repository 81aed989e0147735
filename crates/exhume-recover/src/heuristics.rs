//! Per-table byte-pattern heuristics.
//!
//! Deleting a row overwrites the cell's framing (payload length and
//! rowid varints) with freeblock bookkeeping, so the record header's
//! position has to be guessed. A heuristic rule is a byte-level regular
//! expression plus a signed offset: wherever the pattern matches inside
//! a freed range, `match_start + offset` is a candidate record-header
//! start.
//!
//! Rules load from a JSON file in the user's data directory:
//!
//! ```json
//! {
//!   "tables": {
//!     "moz_places": [
//!       { "pattern": "\\x09.\\x01\\x01", "offset": -2 }
//!     ]
//!   }
//! }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use exhume_error::{ExhumeError, Result};
use regex::bytes::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::{debug, warn};

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct HeuristicRule {
    pattern: Regex,
    offset: i64,
}

impl HeuristicRule {
    /// Compile a rule. The pattern is built with Unicode disabled so it
    /// matches raw bytes with no case folding or class widening.
    pub fn new(table: &str, pattern: &str, offset: i64) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .unicode(false)
            .build()
            .map_err(|err| ExhumeError::BadPattern {
                table: table.to_owned(),
                detail: err.to_string(),
            })?;
        Ok(Self {
            pattern: regex,
            offset,
        })
    }

    /// Candidate header starts this rule proposes inside `hay`.
    fn candidates_into(&self, hay: &[u8], out: &mut BTreeSet<usize>) {
        for m in self.pattern.find_iter(hay) {
            let start = m.start() as i64 + self.offset;
            if (0..hay.len() as i64).contains(&start) {
                out.insert(start as usize);
            }
        }
    }
}

/// The loaded rule set: table name → rules.
#[derive(Debug, Default)]
pub struct HeuristicsRegistry {
    tables: HashMap<String, Vec<HeuristicRule>>,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    tables: HashMap<String, Vec<RawRule>>,
    #[serde(flatten)]
    unknown: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawRule {
    pattern: String,
    offset: i64,
}

impl HeuristicsRegistry {
    /// An empty registry: every table reports "no heuristic".
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a registry from JSON text.
    ///
    /// Unknown top-level keys warn and are ignored; a malformed document
    /// or pattern is a fatal configuration error.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)
            .map_err(|err| ExhumeError::config(format!("heuristics file: {err}")))?;
        for key in raw.unknown.keys() {
            warn!(key = %key, "ignoring unknown key in heuristics file");
        }

        let mut tables = HashMap::new();
        for (table, rules) in raw.tables {
            let compiled: Vec<HeuristicRule> = rules
                .iter()
                .map(|rule| HeuristicRule::new(&table, &rule.pattern, rule.offset))
                .collect::<Result<_>>()?;
            debug!(table = %table, rules = compiled.len(), "loaded heuristics");
            tables.insert(table, compiled);
        }
        Ok(Self { tables })
    }

    /// Load from a file path. A missing file is an empty registry.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no heuristics file, starting empty");
                Ok(Self::empty())
            }
            Err(err) => Err(ExhumeError::config(format!(
                "cannot read {}: {err}",
                path.display()
            ))),
        }
    }

    /// Load from the per-user data path (see [`default_config_path`]).
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::empty()),
        }
    }

    /// Whether any rules are registered for `table`.
    #[must_use]
    pub fn has_rules_for(&self, table: &str) -> bool {
        self.tables.get(table).is_some_and(|rules| !rules.is_empty())
    }

    /// Names of all tables with rules.
    #[must_use]
    pub fn tables(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Every candidate header start any of `table`'s rules proposes in
    /// `hay`, deduplicated and ascending. `None` when the table has no
    /// rules at all.
    #[must_use]
    pub fn candidates(&self, table: &str, hay: &[u8]) -> Option<Vec<usize>> {
        let rules = self.tables.get(table)?;
        if rules.is_empty() {
            return None;
        }
        let mut out = BTreeSet::new();
        for rule in rules {
            rule.candidates_into(hay, &mut out);
        }
        Some(out.into_iter().collect())
    }

    /// Register a rule programmatically (tests, ad-hoc runs).
    pub fn insert(&mut self, table: &str, rule: HeuristicRule) {
        self.tables.entry(table.to_owned()).or_default().push(rule);
    }
}

/// The per-user heuristics path: `$XDG_DATA_HOME/exhume/heuristics.json`,
/// falling back to `~/.local/share/exhume/heuristics.json`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
        })?;
    Some(base.join("exhume").join("heuristics.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_are_deduplicated_and_ascending() {
        let mut registry = HeuristicsRegistry::empty();
        registry.insert("t", HeuristicRule::new("t", r"\x03\x01", 0).unwrap());
        registry.insert("t", HeuristicRule::new("t", r"\x03", 0).unwrap());

        let hay = [0x00, 0x03, 0x01, 0xFF, 0x03, 0x01];
        let candidates = registry.candidates("t", &hay).unwrap();
        assert_eq!(candidates, vec![1, 4]);
    }

    #[test]
    fn offset_shifts_candidates() {
        let mut registry = HeuristicsRegistry::empty();
        registry.insert("t", HeuristicRule::new("t", r"\x17", -2).unwrap());
        let hay = [0x00, 0x00, 0x03, 0x01, 0x17];
        assert_eq!(registry.candidates("t", &hay).unwrap(), vec![2]);
    }

    #[test]
    fn out_of_range_candidates_dropped() {
        let mut registry = HeuristicsRegistry::empty();
        registry.insert("t", HeuristicRule::new("t", r"\x41", -5).unwrap());
        // Match at 0 → candidate -5, dropped.
        assert_eq!(registry.candidates("t", b"A").unwrap(), Vec::<usize>::new());
        // Positive offsets past the end are dropped too.
        let mut registry = HeuristicsRegistry::empty();
        registry.insert("t", HeuristicRule::new("t", r"\x41", 3).unwrap());
        assert_eq!(registry.candidates("t", b"AB").unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn no_rules_means_none() {
        let registry = HeuristicsRegistry::empty();
        assert!(registry.candidates("nope", b"anything").is_none());
        assert!(!registry.has_rules_for("nope"));
    }

    #[test]
    fn patterns_match_raw_bytes() {
        // A pattern with a non-ASCII byte must match bytewise, not as a
        // Unicode scalar.
        let rule = HeuristicRule::new("t", r"\xFF\xFE", 0).unwrap();
        let mut out = BTreeSet::new();
        rule.candidates_into(&[0x00, 0xFF, 0xFE], &mut out);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn loads_from_json() {
        let json = r#"{
            "tables": {
                "t": [
                    { "pattern": "^\\x03\\x01\\x17", "offset": 0 },
                    { "pattern": "\\x09", "offset": -1 }
                ]
            }
        }"#;
        let registry = HeuristicsRegistry::from_json(json).unwrap();
        assert!(registry.has_rules_for("t"));
        let candidates = registry
            .candidates("t", &[0x03, 0x01, 0x17, 0x02, 0x79])
            .unwrap();
        assert_eq!(candidates, vec![0]);
    }

    #[test]
    fn unknown_top_level_keys_ignored() {
        let json = r#"{ "tables": {}, "version": 2 }"#;
        let registry = HeuristicsRegistry::from_json(json).unwrap();
        assert!(registry.tables().is_empty());
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = HeuristicsRegistry::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ExhumeError::Config { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn bad_pattern_is_config_error() {
        let json = r#"{ "tables": { "t": [ { "pattern": "(", "offset": 0 } ] } }"#;
        let err = HeuristicsRegistry::from_json(json).unwrap_err();
        assert!(matches!(err, ExhumeError::BadPattern { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let registry =
            HeuristicsRegistry::load_from_path(Path::new("/nonexistent/heuristics.json")).unwrap();
        assert!(registry.tables().is_empty());
    }

    #[test]
    fn anchored_pattern_matches_range_start() {
        // The scenario from the fixture suite: header_length 3, serial
        // types 1 and 23 for an integer plus 5-byte text.
        let mut registry = HeuristicsRegistry::empty();
        registry.insert("t", HeuristicRule::new("t", r"^\x03\x01\x17", 0).unwrap());
        let freed = [0x03, 0x01, 0x17, 0x02, b'y', 0x00, 0x00];
        assert_eq!(registry.candidates("t", &freed).unwrap(), vec![0]);
    }
}
