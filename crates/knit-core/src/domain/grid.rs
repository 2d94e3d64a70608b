//! Stitch grid and the machine-native pattern encoding.
//!
//! A [`PatternGrid`] is the domain form of a knitting pattern: one row per
//! knitted row, one cell per needle.  A cell is either *on* (the needle is
//! selected and knits the contrast yarn) or *off* (background yarn).
//!
//! # Machine-native payload (for beginners)
//!
//! The knitting machine stores pattern bits very compactly.  The layout
//! produced by [`PatternGrid::to_machine_bytes`] is:
//!
//! ```text
//! row 0:  [pad to nibble][w bits]
//! row 1:  [pad to nibble][w bits]
//! ...
//! whole:  [pad to byte][row 0][row 1]...[row h-1][memo: (h + 1) / 2 zero bytes]
//! ```
//!
//! - Each row is prefixed with `(-w mod 4)` zero bits so every row occupies a
//!   whole number of nibbles (4-bit groups).
//! - The concatenated rows are then prefixed with zero bits until the total
//!   is a multiple of 8.
//! - The machine keeps 4 bits of "memo" data per row after the pattern; we
//!   always store zeros there.
//!
//! Padding goes at the *front* because the machine reads pattern memory
//! backwards from the end of the block.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of needles on the KH-930 bed: the widest pattern it can knit.
pub const MAX_NEEDLES: u16 = 200;

/// Errors raised when building or decoding a [`PatternGrid`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GridError {
    /// Width or height is zero.
    #[error("degenerate grid dimensions {width}x{height}")]
    ZeroDimension { width: u16, height: u32 },

    /// The requested width is wider than the machine bed.
    #[error("grid width {width} exceeds the machine maximum of {MAX_NEEDLES} needles")]
    WidthExceedsMachine { width: u16 },

    /// The cell vector does not contain `width * height` entries.
    #[error("expected {expected} cells, got {actual}")]
    CellCountMismatch { expected: usize, actual: usize },

    /// A machine payload has the wrong length for the declared dimensions.
    #[error("machine payload must be {expected} bytes for these dimensions, got {actual}")]
    PayloadLengthMismatch { expected: usize, actual: usize },
}

/// A rectangular matrix of stitch states, stored row-major from the top row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternGrid {
    width: u16,
    height: u32,
    cells: Vec<bool>,
}

impl PatternGrid {
    /// Creates a grid with every stitch off.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] if a dimension is zero or the width is wider than
    /// [`MAX_NEEDLES`].
    pub fn blank(width: u16, height: u32) -> Result<Self, GridError> {
        validate_dimensions(width, height)?;
        Ok(Self {
            width,
            height,
            cells: vec![false; width as usize * height as usize],
        })
    }

    /// Creates a grid from row-major cells (`true` = stitch on).
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] for invalid dimensions or a cell count that does
    /// not equal `width * height`.
    pub fn from_cells(width: u16, height: u32, cells: Vec<bool>) -> Result<Self, GridError> {
        validate_dimensions(width, height)?;
        let expected = width as usize * height as usize;
        if cells.len() != expected {
            return Err(GridError::CellCountMismatch {
                expected,
                actual: cells.len(),
            });
        }
        Ok(Self {
            width,
            height,
            cells,
        })
    }

    /// Number of stitches per row.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Number of rows.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Returns the stitch at column `x`, row `y`, or `None` when out of range.
    pub fn get(&self, x: u16, y: u32) -> Option<bool> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.cells.get(self.index(x, y)).copied()
    }

    /// Sets the stitch at column `x`, row `y`.  Out-of-range writes are ignored.
    pub fn set(&mut self, x: u16, y: u32, on: bool) {
        if x < self.width && y < self.height {
            let idx = self.index(x, y);
            self.cells[idx] = on;
        }
    }

    /// Iterates over the rows from top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[bool]> {
        self.cells.chunks(self.width as usize)
    }

    /// Number of stitches that are on.
    pub fn count_on(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// Length in bytes of the machine payload for a grid of these dimensions.
    pub fn machine_payload_len(width: u16, height: u32) -> usize {
        pattern_bytes_len(width, height) + memo_len(height)
    }

    /// Encodes the grid into the machine-native payload described in the
    /// module documentation.
    pub fn to_machine_bytes(&self) -> Vec<u8> {
        let row_pad = row_padding(self.width);
        let row_bits = row_pad + self.width as usize;
        let total_bits = row_bits * self.height as usize;
        let pattern_len = total_bits.div_ceil(8);
        let lead_pad = pattern_len * 8 - total_bits;

        let mut out = vec![0u8; pattern_len + memo_len(self.height)];
        let mut bit = lead_pad;
        for row in self.rows() {
            bit += row_pad;
            for &on in row {
                if on {
                    out[bit / 8] |= 0x80 >> (bit % 8);
                }
                bit += 1;
            }
        }
        out
    }

    /// Decodes a machine-native payload back into a grid.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] for invalid dimensions or a payload whose length
    /// does not match them.
    pub fn from_machine_bytes(width: u16, height: u32, payload: &[u8]) -> Result<Self, GridError> {
        validate_dimensions(width, height)?;
        let expected = Self::machine_payload_len(width, height);
        if payload.len() != expected {
            return Err(GridError::PayloadLengthMismatch {
                expected,
                actual: payload.len(),
            });
        }

        let row_pad = row_padding(width);
        let row_bits = row_pad + width as usize;
        let total_bits = row_bits * height as usize;
        let lead_pad = pattern_bytes_len(width, height) * 8 - total_bits;

        let mut cells = Vec::with_capacity(width as usize * height as usize);
        let mut bit = lead_pad;
        for _ in 0..height {
            bit += row_pad;
            for _ in 0..width {
                cells.push(payload[bit / 8] & (0x80 >> (bit % 8)) != 0);
                bit += 1;
            }
        }
        Self::from_cells(width, height, cells)
    }

    fn index(&self, x: u16, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

fn validate_dimensions(width: u16, height: u32) -> Result<(), GridError> {
    if width == 0 || height == 0 {
        return Err(GridError::ZeroDimension { width, height });
    }
    if width > MAX_NEEDLES {
        return Err(GridError::WidthExceedsMachine { width });
    }
    Ok(())
}

/// Zero bits prepended to each row to reach a nibble boundary.
fn row_padding(width: u16) -> usize {
    (4 - width as usize % 4) % 4
}

fn pattern_bytes_len(width: u16, height: u32) -> usize {
    let row_bits = row_padding(width) + width as usize;
    (row_bits * height as usize).div_ceil(8)
}

/// One memo nibble per row, rounded up to whole bytes.
fn memo_len(height: u32) -> usize {
    (height as usize + 1) / 2
}

// ── Tests ─────────────────────────────────────────────────────────────────────
