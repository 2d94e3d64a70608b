//! One track of the KH-930's external pattern storage.
//!
//! A track is a 2 KiB snapshot of the machine's non-volatile pattern memory.
//! The knitting machine saves and loads it as two 1 KiB disk sectors.
//!
//! # Memory layout (for beginners)
//!
//! ```text
//! 0x000 ┌──────────────────────────────┐
//!       │ program info entries (7 B)   │  grows forward  ──►
//!       │ ...                          │
//!       │          free memory         │
//!       │ ...                          │
//!       │ pattern data                 │  ◄── grows backward
//! 0x6E0 │ (ends 0x120 before the end)  │
//! 0x700 │ word: end of available mem   │
//! 0x710 │ word: end of program info    │
//! 0x7EA │ selector + pattern number    │
//! 0x800 └──────────────────────────────┘
//! ```
//!
//! "Offsets" are measured backward from the end of the track.  A program
//! info entry is a 2-byte data offset followed by ten BCD digits: rows (3),
//! stitches (3) and pattern number (4).  The last entry is always empty; its
//! pattern number is the next free one.

use thiserror::Error;
use tracing::debug;

/// Size of one track in bytes.
pub const TRACK_SIZE: usize = 0x800;

/// Offset (from the end) at which pattern data ends.
const PATTERN_OFFSET: u16 = 0x0120;
/// Location of the word holding the offset to the end of available memory.
const AVAILABLE_LOC: usize = 0x700;
/// Location of the word holding the offset to the end of program info.
const PGM_INFO_END_LOC: usize = 0x710;
/// Location of the selector / pattern number word.
const SELECTOR_LOC: usize = 0x7EA;
/// Length of one program info entry.
const PGM_INFO_SIZE: usize = 7;

/// First pattern number available for user patterns.
pub const FIRST_PATTERN_NUMBER: u16 = 901;

/// Largest row or stitch count expressible in three BCD digits.
pub const MAX_BCD3: u32 = 999;

/// Largest pattern payload a fresh track accepts: the space between the
/// first program info entry and the pattern area, less the gap byte and the
/// next empty entry.
pub const MAX_PATTERN_LEN: usize =
    TRACK_SIZE - PGM_INFO_SIZE - PATTERN_OFFSET as usize - 1 - PGM_INFO_SIZE;

/// Errors raised while storing a pattern in a track.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackError {
    /// The pattern does not fit in the remaining pattern memory.
    #[error("not enough space in track: pattern needs {needed} bytes, {available} free")]
    NotEnoughSpace { needed: usize, available: usize },

    /// Rows or stitches do not fit in three BCD digits.
    #[error("pattern {rows} rows x {stitches} stitches exceeds the 999 x 999 program info limit")]
    DimensionsTooLarge { rows: u32, stitches: u32 },

    /// Program info entries are not numbered sequentially from 901.
    #[error("pattern numbers in program info are not sequential")]
    NotSequential,

    /// Every program info entry is occupied.
    #[error("no empty program info entry")]
    NoEmptyEntry,

    /// The selector must be 1 (continuous repeat) or 2 (motifs).
    #[error("selector must be 1 or 2, got {0}")]
    InvalidSelector(u8),
}

/// In-memory image of one storage track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    data: Vec<u8>,
}

impl Default for Track {
    fn default() -> Self {
        Self::new()
    }
}

impl Track {
    /// Creates an empty track holding a single empty entry for pattern 901.
    pub fn new() -> Self {
        let mut track = Self {
            data: vec![0u8; TRACK_SIZE],
        };
        track.set_word(AVAILABLE_LOC, PATTERN_OFFSET);
        track.set_word(PGM_INFO_END_LOC, TRACK_SIZE as u16);
        track.add_pgm_entry(FIRST_PATTERN_NUMBER);
        track
    }

    /// Raw track bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes still available for pattern data.
    pub fn free_memory(&self) -> usize {
        usize::from(self.pgm_info_end()).saturating_sub(usize::from(self.available_offset()))
    }

    /// Stores `pattern` (machine-native payload) with its dimensions.
    ///
    /// Returns the pattern number the machine will show for it.
    ///
    /// # Errors
    ///
    /// Returns [`TrackError`] if the pattern does not fit, its dimensions
    /// overflow the BCD fields, or the program info is inconsistent.
    pub fn add_pattern(&mut self, pattern: &[u8], rows: u32, stitches: u32) -> Result<u16, TrackError> {
        if rows > MAX_BCD3 || stitches > MAX_BCD3 {
            return Err(TrackError::DimensionsTooLarge { rows, stitches });
        }
        // Find the first empty entry, checking the numbering on the way.
        let info_end = TRACK_SIZE - self.pgm_info_end() as usize;
        let mut pattern_num = FIRST_PATTERN_NUMBER;
        let mut empty_loc = None;
        for loc in (0..info_end).step_by(PGM_INFO_SIZE) {
            if self.pattern_number_at(loc) != pattern_num {
                return Err(TrackError::NotSequential);
            }
            if self.word(loc) == 0 {
                empty_loc = Some(loc);
                break;
            }
            pattern_num += 1;
        }
        let loc = empty_loc.ok_or(TrackError::NoEmptyEntry)?;

        // The data, the gap byte after it and, when the last entry is used,
        // the next empty entry must all fit between the two regions.
        let appends_entry = loc + PGM_INFO_SIZE == info_end;
        let needed = pattern.len() + 1 + if appends_entry { PGM_INFO_SIZE } else { 0 };
        let available = self.free_memory();
        if needed > available {
            return Err(TrackError::NotEnoughSpace { needed, available });
        }

        let mut offset = self.available_offset();
        let info = program_info(offset, rows, stitches, pattern_num);
        self.set_bytes(loc, &info);

        offset += pattern.len() as u16;
        self.set_bytes(TRACK_SIZE - offset as usize, pattern);
        self.set_word(AVAILABLE_LOC, offset + 1);

        if appends_entry {
            self.add_pgm_entry(pattern_num + 1);
        }

        debug!(
            pattern_num,
            rows,
            stitches,
            bytes = pattern.len(),
            "stored pattern in track"
        );
        Ok(pattern_num)
    }

    /// Records the selector (1 = continuous repeat, 2 = motifs).
    ///
    /// # Errors
    ///
    /// Returns [`TrackError::InvalidSelector`] for any other value.
    pub fn set_selector(&mut self, selector: u8) -> Result<(), TrackError> {
        if !(1..=2).contains(&selector) {
            return Err(TrackError::InvalidSelector(selector));
        }
        let mut nibbles = vec![selector];
        nibbles.extend(to_bcd(0, 3));
        self.set_bytes(SELECTOR_LOC, &pack_nibbles(&nibbles));
        Ok(())
    }

    /// Splits the track into the emulator's sector files for `track_num`.
    ///
    /// Returns `(file name, contents)` pairs: `NN.dat` / `NN.id` for the two
    /// sectors, where `NN = (track_num - 1) * 2` and `NN + 1`.
    pub fn sector_files(&self, track_num: u8) -> Vec<(String, Vec<u8>)> {
        let first_sector = usize::from(track_num.saturating_sub(1)) * 2;
        let half = TRACK_SIZE / 2;

        let mut sector_id = pack_nibbles(&to_bcd(u32::from(track_num), 2));
        sector_id.extend_from_slice(&[0u8; 11]);

        let mut files = Vec::with_capacity(4);
        for (i, chunk) in self.data.chunks(half).enumerate() {
            let name = format!("{:02}", first_sector + i);
            files.push((format!("{name}.dat"), chunk.to_vec()));
            files.push((format!("{name}.id"), sector_id.clone()));
        }
        files
    }

    fn available_offset(&self) -> u16 {
        self.word(AVAILABLE_LOC)
    }

    fn pgm_info_end(&self) -> u16 {
        self.word(PGM_INFO_END_LOC)
    }

    fn add_pgm_entry(&mut self, pattern_num: u16) {
        let info = program_info(0, 0, 0, pattern_num);
        let offset = self.pgm_info_end();
        self.set_bytes(TRACK_SIZE - offset as usize, &info);
        self.set_word(PGM_INFO_END_LOC, offset - PGM_INFO_SIZE as u16);
    }

    /// Pattern number stored in the last three nibbles of the entry at `loc`.
    fn pattern_number_at(&self, loc: usize) -> u16 {
        let entry = &self.data[loc..loc + PGM_INFO_SIZE];
        let last = entry[PGM_INFO_SIZE - 2..].iter();
        let nibbles: Vec<u8> = last.flat_map(|b| [b >> 4, b & 0x0F]).collect();
        nibbles[1..]
            .iter()
            .fold(0u16, |acc, &n| acc * 10 + u16::from(n))
    }

    fn word(&self, loc: usize) -> u16 {
        u16::from_be_bytes([self.data[loc], self.data[loc + 1]])
    }

    fn set_word(&mut self, loc: usize, word: u16) {
        self.set_bytes(loc, &word.to_be_bytes());
    }

    fn set_bytes(&mut self, loc: usize, bytes: &[u8]) {
        self.data[loc..loc + bytes.len()].copy_from_slice(bytes);
    }
}

/// Composes a 7-byte program info entry.
fn program_info(offset: u16, rows: u32, stitches: u32, pattern_num: u16) -> Vec<u8> {
    let mut digits = to_bcd(rows, 3);
    digits.extend(to_bcd(stitches, 3));
    digits.extend(to_bcd(u32::from(pattern_num), 4));
    let mut info = offset.to_be_bytes().to_vec();
    info.extend(pack_nibbles(&digits));
    info
}

/// Decimal digits of `num`, zero-padded to at least `width` digits.
fn to_bcd(num: u32, width: usize) -> Vec<u8> {
    format!("{num:0width$}")
        .bytes()
        .map(|digit| digit - b'0')
        .collect()
}

/// Packs nibbles two per byte, prepending a zero nibble when the count is odd.
fn pack_nibbles(nibbles: &[u8]) -> Vec<u8> {
    let mut padded = Vec::with_capacity(nibbles.len() + 1);
    if nibbles.len() % 2 == 1 {
        padded.push(0);
    }
    padded.extend_from_slice(nibbles);
    padded.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
