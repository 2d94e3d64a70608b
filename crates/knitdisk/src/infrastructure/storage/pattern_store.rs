//! PatternStore: pattern files addressed by slot number.
//!
//! The knitting machine asks for patterns by the number the operator keys
//! in, starting at 901.  The store maps those slot numbers to decoded
//! [`PatternFile`]s.
//!
//! Two ways to fill it:
//!
//! - [`PatternStore::register`] – a session store with exactly one entry at
//!   [`SESSION_SLOT`].
//! - [`PatternStore::scan_directory`] – every `*.pat` file in a directory,
//!   sorted by file name, numbered 901, 902, …
//!
//! The emulator reads the store through [`SharedPatternStore`] so a host can
//! register a pattern after the emulator has started listening.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use knit_core::domain::pattern_file::{PatternFile, PatternFileError, PATTERN_EXTENSION};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// The slot a session's pattern is served under.
pub const SESSION_SLOT: u16 = 901;

/// Highest slot number the machine can address.
pub const MAX_SLOT: u16 = 999;

/// A store shared between the emulator task and its host.
pub type SharedPatternStore = Arc<RwLock<PatternStore>>;

/// Errors raised while loading pattern files.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file or directory could not be read.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file is not a valid pattern file.
    #[error("invalid pattern file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: PatternFileError,
    },

    /// More files than the machine has slots.
    #[error("too many pattern files: slots end at {MAX_SLOT}")]
    SlotsExhausted,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct StoredPattern {
    pub slot: u16,
    /// Source file name, kept for logging.
    pub source: String,
    pub file: Arc<PatternFile>,
}

/// In-memory slot → pattern map.
#[derive(Debug, Default)]
pub struct PatternStore {
    entries: BTreeMap<u16, StoredPattern>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the store for sharing with an emulator task.
    pub fn into_shared(self) -> SharedPatternStore {
        Arc::new(RwLock::new(self))
    }

    /// Makes `file` the only entry, under [`SESSION_SLOT`].
    ///
    /// Any previous entry is replaced: a session never holds more than one.
    pub fn register(&mut self, file: PatternFile, source: impl Into<String>) -> u16 {
        let source = source.into();
        info!(
            slot = SESSION_SLOT,
            source = %source,
            bytes = file.payload_len(),
            "registered pattern"
        );
        self.entries.clear();
        self.entries.insert(
            SESSION_SLOT,
            StoredPattern {
                slot: SESSION_SLOT,
                source,
                file: Arc::new(file),
            },
        );
        SESSION_SLOT
    }

    /// Loads every `*.pat` file in `dir`, numbered from [`SESSION_SLOT`] in
    /// file-name order.
    ///
    /// Files that fail to decode are skipped with a warning and do not use up
    /// a slot number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be listed and
    /// [`StoreError::SlotsExhausted`] if there are more than 99 patterns.
    pub fn scan_directory(dir: &Path) -> Result<Self, StoreError> {
        let io_err = |source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let is_pattern = path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(PATTERN_EXTENSION));
            if is_pattern {
                paths.push(path);
            }
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut store = Self::new();
        let mut slot = SESSION_SLOT;
        for path in paths {
            let file = match load_pattern_file(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("skipping {}: {e}", path.display());
                    continue;
                }
            };
            if slot > MAX_SLOT {
                return Err(StoreError::SlotsExhausted);
            }
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            info!(slot, source = %source, "discovered pattern");
            store.entries.insert(
                slot,
                StoredPattern {
                    slot,
                    source,
                    file: Arc::new(file),
                },
            );
            slot += 1;
        }
        Ok(store)
    }

    /// Returns the entry for `slot`, if any.
    pub fn lookup(&self, slot: u16) -> Option<&StoredPattern> {
        self.entries.get(&slot)
    }

    /// Looks up an entry by the name the machine sends (`"901"`).
    pub fn lookup_name(&self, name: &str) -> Option<&StoredPattern> {
        name.trim().parse::<u16>().ok().and_then(|slot| self.lookup(slot))
    }

    /// Entries in ascending slot order.
    pub fn entries(&self) -> impl Iterator<Item = &StoredPattern> {
        self.entries.values()
    }

    /// The entry at `index` in slot order.
    pub fn nth(&self, index: usize) -> Option<&StoredPattern> {
        self.entries.values().nth(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads and decodes one pattern file.
///
/// # Errors
///
/// Returns [`StoreError`] if the file cannot be read or decoded.
pub fn load_pattern_file(path: &Path) -> Result<PatternFile, StoreError> {
    let bytes = std::fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    PatternFile::decode(&bytes).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use knit_core::PatternGrid;

    fn pattern(width: u16, height: u32) -> PatternFile {
        PatternFile::from_grid(&PatternGrid::blank(width, height).unwrap())
    }

    fn write_pattern(dir: &Path, name: &str, file: &PatternFile) {
        std::fs::write(dir.join(name), file.encode()).unwrap();
    }

    // ── register ──────────────────────────────────────────────────────────────

    #[test]
    fn test_new_store_is_empty() {
        let store = PatternStore::new();
        assert!(store.is_empty());
        assert!(store.lookup(SESSION_SLOT).is_none());
    }

    #[test]
    fn test_register_places_pattern_at_901() {
        // Arrange
        let mut store = PatternStore::new();

        // Act
        let slot = store.register(pattern(10, 10), "heart.pat");

        // Assert
        assert_eq!(slot, 901);
        let entry = store.lookup(901).expect("registered");
        assert_eq!(entry.file.width(), 10);
        assert_eq!(entry.source, "heart.pat");
    }

    #[test]
    fn test_register_replaces_previous_entry() {
        let mut store = PatternStore::new();
        store.register(pattern(10, 10), "first.pat");
        store.register(pattern(20, 5), "second.pat");

        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(901).unwrap().file.width(), 20);
    }

    #[test]
    fn test_lookup_name_parses_decimal_slot() {
        let mut store = PatternStore::new();
        store.register(pattern(4, 4), "p.pat");

        assert!(store.lookup_name("901").is_some());
        assert!(store.lookup_name(" 901 ").is_some());
        assert!(store.lookup_name("902").is_none());
        assert!(store.lookup_name("abc").is_none());
        assert!(store.lookup_name("").is_none());
    }

    // ── scan_directory ────────────────────────────────────────────────────────

    #[test]
    fn test_scan_numbers_files_in_name_order() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        write_pattern(dir.path(), "b.pat", &pattern(2, 2));
        write_pattern(dir.path(), "a.pat", &pattern(1, 1));
        write_pattern(dir.path(), "c.pat", &pattern(3, 3));

        // Act
        let store = PatternStore::scan_directory(dir.path()).unwrap();

        // Assert
        let listed: Vec<(u16, &str)> = store
            .entries()
            .map(|e| (e.slot, e.source.as_str()))
            .collect();
        assert_eq!(listed, [(901, "a.pat"), (902, "b.pat"), (903, "c.pat")]);
        assert_eq!(store.lookup(903).unwrap().file.width(), 3);
    }

    #[test]
    fn test_scan_ignores_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        write_pattern(dir.path(), "a.pat", &pattern(1, 1));
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let store = PatternStore::scan_directory(dir.path()).unwrap();

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_scan_skips_corrupt_files_without_using_a_slot() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        write_pattern(dir.path(), "a.pat", &pattern(1, 1));
        std::fs::write(dir.path().join("b.pat"), b"garbage").unwrap();
        write_pattern(dir.path(), "c.pat", &pattern(3, 3));

        // Act
        let store = PatternStore::scan_directory(dir.path()).unwrap();

        // Assert
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup(902).unwrap().source, "c.pat");
    }

    #[test]
    fn test_scan_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = PatternStore::scan_directory(&dir.path().join("missing"));
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }

    #[test]
    fn test_nth_follows_slot_order() {
        let dir = tempfile::tempdir().unwrap();
        write_pattern(dir.path(), "x.pat", &pattern(1, 1));
        write_pattern(dir.path(), "y.pat", &pattern(2, 2));
        let store = PatternStore::scan_directory(dir.path()).unwrap();

        assert_eq!(store.nth(0).unwrap().slot, 901);
        assert_eq!(store.nth(1).unwrap().slot, 902);
        assert!(store.nth(2).is_none());
    }

    #[test]
    fn test_load_pattern_file_reports_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pat");
        std::fs::write(&path, b"KNPT").unwrap();

        assert!(matches!(
            load_pattern_file(&path),
            Err(StoreError::Decode { .. })
        ));
    }
}
