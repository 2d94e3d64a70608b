//! The on-disk pattern file container.
//!
//! File format:
//! ```text
//! [magic:4 "KNPT"][version:1][reserved:1][width:2][height:4][payload_len:4][checksum:4][payload:N]
//! ```
//! Header size: 20 bytes.  All multi-byte integers are big-endian.  The
//! payload is the machine-native encoding produced by
//! [`PatternGrid::to_machine_bytes`]; the checksum is the wrapping 32-bit sum
//! of the payload bytes.

use thiserror::Error;

use crate::domain::grid::{GridError, PatternGrid};

/// Format tag at the start of every pattern file.
pub const PATTERN_MAGIC: [u8; 4] = *b"KNPT";

/// Current pattern file format version.
pub const PATTERN_FORMAT_VERSION: u8 = 0x01;

/// Size of the fixed header in bytes.
pub const PATTERN_HEADER_SIZE: usize = 20;

/// File extension used for pattern files.
pub const PATTERN_EXTENSION: &str = "pat";

/// Errors raised while decoding a pattern file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternFileError {
    /// Fewer bytes than the fixed header.
    #[error("pattern file truncated: need at least {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// The first four bytes are not [`PATTERN_MAGIC`].
    #[error("not a pattern file (bad format tag)")]
    BadMagic,

    /// The version byte is not supported.
    #[error("unsupported pattern file version: {0}")]
    UnsupportedVersion(u8),

    /// The header's payload length disagrees with the bytes that follow it.
    #[error("payload length mismatch: header says {declared}, file holds {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The stored checksum does not match the payload.
    #[error("checksum mismatch: header says 0x{declared:08X}, payload sums to 0x{computed:08X}")]
    ChecksumMismatch { declared: u32, computed: u32 },

    /// The payload does not describe a valid grid.
    #[error("invalid grid: {0}")]
    Grid(#[from] GridError),
}

/// A serialized [`PatternGrid`] with its header fields.
///
/// A `PatternFile` can only be built from a grid or decoded from bytes, so
/// `payload_len` and `checksum` always describe `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternFile {
    width: u16,
    height: u32,
    checksum: u32,
    payload: Vec<u8>,
}

impl PatternFile {
    /// Serializes `grid` into a new pattern file.
    pub fn from_grid(grid: &PatternGrid) -> Self {
        let payload = grid.to_machine_bytes();
        Self {
            width: grid.width(),
            height: grid.height(),
            checksum: payload_checksum(&payload),
            payload,
        }
    }

    /// Stitches per row.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Number of rows.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Checksum stored in the header.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// The machine-native pattern bytes served to the knitting machine.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Length of the payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Decodes the payload back into a grid.
    ///
    /// # Errors
    ///
    /// Returns [`GridError`] if the payload does not match the dimensions.
    pub fn to_grid(&self) -> Result<PatternGrid, GridError> {
        PatternGrid::from_machine_bytes(self.width, self.height, &self.payload)
    }

    /// Encodes the header followed by the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PATTERN_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&PATTERN_MAGIC);
        buf.push(PATTERN_FORMAT_VERSION);
        buf.push(0x00); // reserved
        buf.extend_from_slice(&self.width.to_be_bytes());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes a complete pattern file.
    ///
    /// # Errors
    ///
    /// Returns [`PatternFileError`] if the header is malformed, the payload
    /// length or checksum does not match, or the payload is not a valid grid
    /// of the declared dimensions.
    pub fn decode(bytes: &[u8]) -> Result<Self, PatternFileError> {
        if bytes.len() < PATTERN_HEADER_SIZE {
            return Err(PatternFileError::Truncated {
                needed: PATTERN_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        if bytes[0..4] != PATTERN_MAGIC {
            return Err(PatternFileError::BadMagic);
        }
        if bytes[4] != PATTERN_FORMAT_VERSION {
            return Err(PatternFileError::UnsupportedVersion(bytes[4]));
        }
        // bytes[5] is reserved – ignored on decode

        let width = u16::from_be_bytes([bytes[6], bytes[7]]);
        let height = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let payload_len = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
        let checksum = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

        let payload = &bytes[PATTERN_HEADER_SIZE..];
        if payload.len() != payload_len {
            return Err(PatternFileError::PayloadLengthMismatch {
                declared: payload_len,
                available: payload.len(),
            });
        }

        let computed = payload_checksum(payload);
        if computed != checksum {
            return Err(PatternFileError::ChecksumMismatch {
                declared: checksum,
                computed,
            });
        }

        // Validates dimensions and the bit layout in one go.
        PatternGrid::from_machine_bytes(width, height, payload)?;

        Ok(Self {
            width,
            height,
            checksum,
            payload: payload.to_vec(),
        })
    }
}

/// Wrapping 32-bit sum of `payload`.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn diagonal_grid() -> PatternGrid {
        let mut grid = PatternGrid::blank(8, 8).unwrap();
        for i in 0..8 {
            grid.set(i, i as u32, true);
        }
        grid
    }

    #[test]
    fn test_encode_starts_with_magic_and_version() {
        let bytes = PatternFile::from_grid(&diagonal_grid()).encode();
        assert_eq!(&bytes[0..4], b"KNPT");
        assert_eq!(bytes[4], PATTERN_FORMAT_VERSION);
    }

    #[test]
    fn test_header_fields_describe_the_payload() {
        // Arrange
        let file = PatternFile::from_grid(&diagonal_grid());

        // Act
        let bytes = file.encode();

        // Assert
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 8);
        assert_eq!(u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 8);
        let declared_len = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
        assert_eq!(declared_len, bytes.len() - PATTERN_HEADER_SIZE);
        let declared_sum = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        assert_eq!(declared_sum, payload_checksum(&bytes[PATTERN_HEADER_SIZE..]));
    }

    #[test]
    fn test_decode_returns_equal_file() {
        let file = PatternFile::from_grid(&diagonal_grid());
        let decoded = PatternFile::decode(&file.encode()).unwrap();
        assert_eq!(decoded, file);
        assert_eq!(decoded.to_grid().unwrap(), diagonal_grid());
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        let result = PatternFile::decode(b"KNPT");
        assert_eq!(
            result,
            Err(PatternFileError::Truncated { needed: PATTERN_HEADER_SIZE, available: 4 })
        );
    }

    #[test]
    fn test_decode_rejects_wrong_magic() {
        let mut bytes = PatternFile::from_grid(&diagonal_grid()).encode();
        bytes[0] = b'X';
        assert_eq!(PatternFile::decode(&bytes), Err(PatternFileError::BadMagic));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = PatternFile::from_grid(&diagonal_grid()).encode();
        bytes[4] = 0x7F;
        assert_eq!(
            PatternFile::decode(&bytes),
            Err(PatternFileError::UnsupportedVersion(0x7F))
        );
    }

    #[test]
    fn test_decode_detects_corrupted_payload() {
        // Arrange: flip one payload bit without touching the header.
        let mut bytes = PatternFile::from_grid(&diagonal_grid()).encode();
        bytes[PATTERN_HEADER_SIZE] ^= 0x01;

        // Act
        let result = PatternFile::decode(&bytes);

        // Assert
        assert!(matches!(result, Err(PatternFileError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_decode_detects_missing_payload_bytes() {
        let mut bytes = PatternFile::from_grid(&diagonal_grid()).encode();
        bytes.pop();
        assert!(matches!(
            PatternFile::decode(&bytes),
            Err(PatternFileError::PayloadLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_is_plain_byte_sum() {
        assert_eq!(payload_checksum(&[]), 0);
        assert_eq!(payload_checksum(&[0x01, 0x02, 0xFF]), 0x102);
    }
}
