//! Binary codec for the disk-drive protocol frames.
//!
//! Wire format:
//! ```text
//! request:  ['Z']['Z'][command:1][length:1][data:length][checksum:1]
//! response: [type:1][length:1][data:length][checksum:1]
//! ```
//! The checksum is the bitwise NOT of the low byte of the sum of the
//! command/type byte, the length byte and every data byte.  Multi-byte
//! integers inside payloads are big-endian.
//!
//! # Decoding from a stream (for beginners)
//!
//! Serial ports deliver bytes in arbitrary pieces, so [`decode_request`]
//! works on a growing buffer.  It either returns a request together with the
//! number of bytes it consumed, asks for more bytes with
//! [`FrameError::Incomplete`], or reports a framing fault.  For faults
//! [`FrameError::discard_len`] tells the caller how many bytes to drop before
//! trying again.

use thiserror::Error;

use crate::protocol::messages::{
    CommandCode, DirectoryEntryInfo, DirectoryRef, DriveStatus, OpenMode, Request, Response,
    ResponseCode, SearchForm, NAK, NAME_FIELD_LEN, PREAMBLE,
};

/// Bytes in a request frame that are not data: preamble, command, length, checksum.
pub const REQUEST_OVERHEAD: usize = 5;

/// Bytes in a response frame that are not data: type, length, checksum.
pub const RESPONSE_OVERHEAD: usize = 3;

/// Largest data field a single frame can carry.
pub const MAX_FRAME_DATA: usize = u8::MAX as usize;

/// Data length of a directory-reference request.
const DIRECTORY_REF_LEN: usize = NAME_FIELD_LEN + 2;

/// Data length of a directory-entry response.
const DIRECTORY_ENTRY_LEN: usize = NAME_FIELD_LEN + 1 + 4 + 1;

/// Attribute byte marking a populated directory entry.
const ATTR_FILE: u8 = b'F';

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ends before the frame does.
    #[error("incomplete frame: need {needed} bytes, got {available}")]
    Incomplete { needed: usize, available: usize },

    /// The buffer does not start with the request preamble.
    #[error("bad preamble; discarding {skip} byte(s)")]
    BadPreamble { skip: usize },

    /// The checksum byte does not match the frame contents.
    ///
    /// `skip` is where decoding should resume.  For requests that is the next
    /// byte after the bad header that could start a frame, so a corrupted
    /// length byte does not swallow frames resent behind it.
    #[error("bad checksum: expected 0x{expected:02X}, got 0x{actual:02X}; discarding {skip} byte(s)")]
    BadChecksum { expected: u8, actual: u8, skip: usize },

    /// The response type byte is not a recognized value.
    #[error("unknown response type: 0x{0:02X}")]
    UnknownResponseType(u8),

    /// The payload could not be parsed for its frame type.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The data field does not fit in a single frame.
    #[error("payload of {len} bytes exceeds the {MAX_FRAME_DATA}-byte frame limit")]
    PayloadTooLarge { len: usize },
}

impl FrameError {
    /// Number of bytes to drop from the front of the receive buffer before
    /// decoding again, or `None` when the caller should wait for more bytes.
    pub fn discard_len(&self) -> Option<usize> {
        match self {
            FrameError::BadPreamble { skip } => Some(*skip),
            FrameError::BadChecksum { skip, .. } => Some(*skip),
            _ => None,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Computes the frame checksum over a type/command byte, the length byte and
/// the data.
pub fn frame_checksum(code: u8, data: &[u8]) -> u8 {
    let sum = data
        .iter()
        .fold(code.wrapping_add(data.len() as u8), |acc, &b| acc.wrapping_add(b));
    !sum
}

/// Encodes a request as the knitting machine would send it.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the data does not fit a frame.
///
/// # Examples
///
/// ```rust
/// use knit_core::protocol::{decode_request, encode_request, Request};
///
/// let bytes = encode_request(&Request::Read).unwrap();
/// let (decoded, consumed) = decode_request(&bytes).unwrap();
/// assert_eq!(decoded, Request::Read);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_request(request: &Request) -> Result<Vec<u8>, FrameError> {
    let data = match request {
        Request::DirectoryRef(dir) => {
            let mut data = name_field(&dir.name);
            data.push(dir.attribute);
            data.push(dir.search as u8);
            data
        }
        Request::Open(mode) => vec![*mode as u8],
        Request::Close
        | Request::Read
        | Request::Status
        | Request::Modify(_)
        | Request::Unsupported { .. } => Vec::new(),
    };
    let body = frame_body(request.command_byte(), &data)?;

    let mut buf = Vec::with_capacity(PREAMBLE.len() + body.len());
    buf.extend_from_slice(&PREAMBLE);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decodes one request from the beginning of `bytes`.
///
/// Returns the request and the number of bytes consumed.  A checksum-valid
/// frame with an unknown command or unusable parameters decodes to
/// [`Request::Unsupported`] so the drive can answer it with a status.
///
/// # Errors
///
/// Returns [`FrameError::Incomplete`] when more bytes are needed, and
/// [`FrameError::BadPreamble`] or [`FrameError::BadChecksum`] for corrupt
/// input.
pub fn decode_request(bytes: &[u8]) -> Result<(Request, usize), FrameError> {
    if let Some(skip) = preamble_mismatch(bytes) {
        return Err(FrameError::BadPreamble { skip });
    }

    let header = PREAMBLE.len() + 2;
    require_len(bytes, header)?;
    let command = bytes[2];
    let len = bytes[3] as usize;
    let frame_len = len + REQUEST_OVERHEAD;
    require_len(bytes, frame_len)?;

    let data = &bytes[header..header + len];
    let actual = bytes[frame_len - 1];
    let expected = frame_checksum(command, data);
    if actual != expected {
        return Err(FrameError::BadChecksum {
            expected,
            actual,
            skip: resync_from(bytes, PREAMBLE.len()),
        });
    }

    Ok((parse_request(command, data), frame_len))
}

/// Encodes a response frame.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if read data exceeds one frame.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, FrameError> {
    let data = match response {
        Response::ReadData(data) => data.clone(),
        Response::DirectoryEntry(entry) => {
            let mut data = name_field(&entry.name);
            data.push(if entry.is_empty() { 0x00 } else { ATTR_FILE });
            data.extend_from_slice(&entry.size.to_be_bytes());
            data.push(entry.free_sectors);
            data
        }
        Response::Status(status) => vec![*status as u8],
    };
    frame_body(response.response_code() as u8, &data)
}

/// Decodes one response from the beginning of `bytes`.
///
/// Used by the machine side of tests and tooling.
///
/// # Errors
///
/// Returns [`FrameError`] if the bytes are incomplete or malformed.
pub fn decode_response(bytes: &[u8]) -> Result<(Response, usize), FrameError> {
    require_len(bytes, 2)?;
    let code = bytes[0];
    let len = bytes[1] as usize;
    let frame_len = len + RESPONSE_OVERHEAD;
    require_len(bytes, frame_len)?;

    let data = &bytes[2..2 + len];
    let actual = bytes[frame_len - 1];
    let expected = frame_checksum(code, data);
    if actual != expected {
        return Err(FrameError::BadChecksum {
            expected,
            actual,
            skip: frame_len,
        });
    }

    let response = match ResponseCode::try_from(code).map_err(|_| FrameError::UnknownResponseType(code))? {
        ResponseCode::ReadData => Response::ReadData(data.to_vec()),
        ResponseCode::DirectoryEntry => {
            if data.len() != DIRECTORY_ENTRY_LEN {
                return Err(FrameError::MalformedPayload(format!(
                    "directory entry must be {DIRECTORY_ENTRY_LEN} bytes, got {}",
                    data.len()
                )));
            }
            let size_at = NAME_FIELD_LEN + 1;
            Response::DirectoryEntry(DirectoryEntryInfo {
                name: parse_name(&data[..NAME_FIELD_LEN]),
                size: u32::from_be_bytes([
                    data[size_at],
                    data[size_at + 1],
                    data[size_at + 2],
                    data[size_at + 3],
                ]),
                free_sectors: data[size_at + 4],
            })
        }
        ResponseCode::Status => {
            let [byte] = data else {
                return Err(FrameError::MalformedPayload(format!(
                    "status must be 1 byte, got {}",
                    data.len()
                )));
            };
            let status = DriveStatus::try_from(*byte).map_err(|_| {
                FrameError::MalformedPayload(format!("unknown status code 0x{byte:02X}"))
            })?;
            Response::Status(status)
        }
    };
    Ok((response, frame_len))
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Returns `Err(Incomplete)` if `bytes` is shorter than `needed`.
fn require_len(bytes: &[u8], needed: usize) -> Result<(), FrameError> {
    if bytes.len() < needed {
        Err(FrameError::Incomplete {
            needed,
            available: bytes.len(),
        })
    } else {
        Ok(())
    }
}

/// Checks the available prefix against the preamble.  On mismatch returns how
/// many bytes to skip: up to the next byte that could start a frame or a NAK.
fn preamble_mismatch(bytes: &[u8]) -> Option<usize> {
    bytes
        .iter()
        .zip(PREAMBLE.iter())
        .position(|(got, want)| got != want)?;
    Some(resync_from(bytes, 1))
}

/// Offset of the first byte at or after `start` that could begin a frame or
/// be a NAK, or `bytes.len()` when there is none.
fn resync_from(bytes: &[u8], start: usize) -> usize {
    bytes
        .get(start..)
        .and_then(|rest| rest.iter().position(|&b| b == PREAMBLE[0] || b == NAK))
        .map_or(bytes.len(), |p| p + start)
}

fn frame_body(code: u8, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    if data.len() > MAX_FRAME_DATA {
        return Err(FrameError::PayloadTooLarge { len: data.len() });
    }
    let mut buf = Vec::with_capacity(data.len() + RESPONSE_OVERHEAD);
    buf.push(code);
    buf.push(data.len() as u8);
    buf.extend_from_slice(data);
    buf.push(frame_checksum(code, data));
    Ok(buf)
}

fn parse_request(command: u8, data: &[u8]) -> Request {
    let unsupported = Request::Unsupported { command };
    let Ok(code) = CommandCode::try_from(command) else {
        return unsupported;
    };
    match code {
        CommandCode::DirectoryRef => {
            if data.len() != DIRECTORY_REF_LEN {
                return unsupported;
            }
            match SearchForm::try_from(data[NAME_FIELD_LEN + 1]) {
                Ok(search) => Request::DirectoryRef(DirectoryRef {
                    name: parse_name(&data[..NAME_FIELD_LEN]),
                    attribute: data[NAME_FIELD_LEN],
                    search,
                }),
                Err(()) => unsupported,
            }
        }
        CommandCode::Open => match data {
            [mode] => OpenMode::try_from(*mode).map_or(unsupported, Request::Open),
            _ => unsupported,
        },
        CommandCode::Close => Request::Close,
        CommandCode::Read => Request::Read,
        CommandCode::Status => Request::Status,
        CommandCode::Write | CommandCode::Delete | CommandCode::Format => Request::Modify(code),
    }
}

/// Space-pads (or truncates) `name` to the fixed name field width.
fn name_field(name: &str) -> Vec<u8> {
    let mut field = vec![b' '; NAME_FIELD_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_FIELD_LEN);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

fn parse_name(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_ref(name: &str, search: SearchForm) -> Request {
        Request::DirectoryRef(DirectoryRef {
            name: name.to_string(),
            attribute: ATTR_FILE,
            search,
        })
    }

    // ── Checksum ──────────────────────────────────────────────────────────────

    #[test]
    fn test_checksum_is_inverted_low_byte_of_sum() {
        // 0x03 + 0x00 = 0x03 → !0x03 = 0xFC
        assert_eq!(frame_checksum(0x03, &[]), 0xFC);
        // 0x12 + 0x01 + 0x3F = 0x52 → 0xAD
        assert_eq!(frame_checksum(0x12, &[0x3F]), 0xAD);
    }

    #[test]
    fn test_checksum_wraps_on_overflow() {
        // 0x10 + 0x02 + 0xFF + 0xFF = 0x210 → low byte 0x10 → 0xEF
        assert_eq!(frame_checksum(0x10, &[0xFF, 0xFF]), 0xEF);
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    #[test]
    fn test_read_request_exact_bytes() {
        let bytes = encode_request(&Request::Read).unwrap();
        assert_eq!(bytes, vec![b'Z', b'Z', 0x03, 0x00, 0xFC]);
    }

    #[test]
    fn test_directory_ref_request_pads_name_with_spaces() {
        // Arrange
        let request = dir_ref("901", SearchForm::ByName);

        // Act
        let bytes = encode_request(&request).unwrap();

        // Assert
        assert_eq!(bytes.len(), REQUEST_OVERHEAD + DIRECTORY_REF_LEN);
        assert_eq!(&bytes[4..7], b"901");
        assert!(bytes[7..4 + NAME_FIELD_LEN].iter().all(|&b| b == b' '));
        assert_eq!(bytes[4 + NAME_FIELD_LEN], ATTR_FILE);
        assert_eq!(bytes[5 + NAME_FIELD_LEN], SearchForm::ByName as u8);
    }

    #[test]
    fn test_decode_request_reports_consumed_length() {
        // Arrange: two frames back to back.
        let mut bytes = encode_request(&dir_ref("901", SearchForm::ByName)).unwrap();
        let first_len = bytes.len();
        bytes.extend(encode_request(&Request::Open(OpenMode::Read)).unwrap());

        // Act
        let (first, n1) = decode_request(&bytes).unwrap();
        let (second, n2) = decode_request(&bytes[n1..]).unwrap();

        // Assert
        assert_eq!(first, dir_ref("901", SearchForm::ByName));
        assert_eq!(n1, first_len);
        assert_eq!(second, Request::Open(OpenMode::Read));
        assert_eq!(n1 + n2, bytes.len());
    }

    #[test]
    fn test_decode_request_waits_for_rest_of_frame() {
        let bytes = encode_request(&dir_ref("901", SearchForm::First)).unwrap();
        for cut in 0..bytes.len() {
            let err = decode_request(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err, FrameError::Incomplete { .. }),
                "cut at {cut} gave {err:?}"
            );
            assert_eq!(err.discard_len(), None);
        }
    }

    #[test]
    fn test_decode_request_rejects_garbage_before_preamble() {
        // Arrange: two junk bytes, then a real frame.
        let mut bytes = vec![0xAA, 0xBB];
        bytes.extend(encode_request(&Request::Status).unwrap());

        // Act
        let err = decode_request(&bytes).unwrap_err();

        // Assert: skipping lands exactly on the frame start.
        assert_eq!(err, FrameError::BadPreamble { skip: 2 });
        let (request, _) = decode_request(&bytes[2..]).unwrap();
        assert_eq!(request, Request::Status);
    }

    #[test]
    fn test_decode_request_lone_z_followed_by_junk_discards_all() {
        assert_eq!(
            decode_request(&[b'Z', 0x00, 0x01]),
            Err(FrameError::BadPreamble { skip: 3 })
        );
    }

    #[test]
    fn test_decode_request_resyncs_on_second_z() {
        // "?ZZ..." – the second byte may start the real frame.
        let mut bytes = vec![0x00];
        bytes.extend(encode_request(&Request::Close).unwrap());
        assert_eq!(decode_request(&bytes), Err(FrameError::BadPreamble { skip: 1 }));
    }

    #[test]
    fn test_decode_request_garbage_stops_before_nak() {
        assert_eq!(
            decode_request(&[0x01, 0x02, NAK]),
            Err(FrameError::BadPreamble { skip: 2 })
        );
    }

    #[test]
    fn test_decode_request_detects_bad_checksum() {
        // Arrange
        let mut bytes = encode_request(&Request::Close).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        // Act
        let err = decode_request(&bytes).unwrap_err();

        // Assert
        assert!(matches!(err, FrameError::BadChecksum { skip: 5, .. }));
        assert_eq!(err.discard_len(), Some(5));
    }

    #[test]
    fn test_bad_checksum_resyncs_on_frame_resent_inside_declared_length() {
        // Arrange: a corrupted length byte claims 40 data bytes, and the
        // machine resends the real frame right behind the broken header.
        let resent = encode_request(&Request::Status).unwrap();
        let mut bytes = vec![b'Z', b'Z', 0x07, 40];
        bytes.extend(&resent);
        bytes.resize(REQUEST_OVERHEAD + 40, 0x00);

        // Act
        let err = decode_request(&bytes).unwrap_err();

        // Assert: decoding resumes at the resent frame, not after 45 bytes.
        let skip = err.discard_len().unwrap();
        assert_eq!(skip, 4);
        let (request, consumed) = decode_request(&bytes[skip..]).unwrap();
        assert_eq!(request, Request::Status);
        assert_eq!(consumed, resent.len());
    }

    #[test]
    fn test_unknown_command_decodes_as_unsupported() {
        let bytes = [b'Z', b'Z', 0x42, 0x00, frame_checksum(0x42, &[])];
        let (request, _) = decode_request(&bytes).unwrap();
        assert_eq!(request, Request::Unsupported { command: 0x42 });
    }

    #[test]
    fn test_short_directory_ref_decodes_as_unsupported() {
        let data = [b'9', b'0', b'1'];
        let mut bytes = vec![b'Z', b'Z', 0x00, data.len() as u8];
        bytes.extend_from_slice(&data);
        bytes.push(frame_checksum(0x00, &data));

        let (request, _) = decode_request(&bytes).unwrap();
        assert_eq!(request, Request::Unsupported { command: 0x00 });
    }

    #[test]
    fn test_write_commands_decode_as_modify() {
        let bytes = encode_request(&Request::Modify(CommandCode::Delete)).unwrap();
        let (request, _) = decode_request(&bytes).unwrap();
        assert_eq!(request, Request::Modify(CommandCode::Delete));
    }

    // ── Responses ─────────────────────────────────────────────────────────────

    #[test]
    fn test_status_response_exact_bytes() {
        let bytes = encode_response(&Response::Status(DriveStatus::EndOfFile)).unwrap();
        assert_eq!(bytes, vec![0x12, 0x01, 0x3F, 0xAD]);
    }

    #[test]
    fn test_directory_entry_response_layout() {
        // Arrange
        let entry = DirectoryEntryInfo {
            name: "901".to_string(),
            size: 0x0102,
            free_sectors: 0,
        };

        // Act
        let bytes = encode_response(&Response::DirectoryEntry(entry.clone())).unwrap();

        // Assert
        assert_eq!(bytes[0], 0x11);
        assert_eq!(bytes[1] as usize, DIRECTORY_ENTRY_LEN);
        assert_eq!(bytes[2 + NAME_FIELD_LEN], b'F');
        assert_eq!(&bytes[3 + NAME_FIELD_LEN..7 + NAME_FIELD_LEN], &[0, 0, 1, 2]);
        let (decoded, n) = decode_response(&bytes).unwrap();
        assert_eq!(decoded, Response::DirectoryEntry(entry));
        assert_eq!(n, bytes.len());
    }

    #[test]
    fn test_empty_directory_entry_has_zero_attribute() {
        let bytes = encode_response(&Response::DirectoryEntry(DirectoryEntryInfo::empty())).unwrap();
        assert_eq!(bytes[2 + NAME_FIELD_LEN], 0x00);
        assert!(bytes[2..2 + NAME_FIELD_LEN].iter().all(|&b| b == b' '));
    }

    #[test]
    fn test_read_data_response_carries_payload() {
        let data: Vec<u8> = (0..128u8).collect();
        let bytes = encode_response(&Response::ReadData(data.clone())).unwrap();
        assert_eq!(bytes.len(), data.len() + RESPONSE_OVERHEAD);
        let (decoded, _) = decode_response(&bytes).unwrap();
        assert_eq!(decoded, Response::ReadData(data));
    }

    #[test]
    fn test_oversized_read_data_is_rejected() {
        let result = encode_response(&Response::ReadData(vec![0; 256]));
        assert_eq!(result, Err(FrameError::PayloadTooLarge { len: 256 }));
    }

    #[test]
    fn test_decode_response_rejects_unknown_type() {
        let bytes = [0x55, 0x00, frame_checksum(0x55, &[])];
        assert_eq!(
            decode_response(&bytes),
            Err(FrameError::UnknownResponseType(0x55))
        );
    }
}
