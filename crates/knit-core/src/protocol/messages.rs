//! Request and response types of the emulated disk-drive protocol.
//!
//! The knitting machine talks to its floppy drive in "operation mode": it
//! sends short checksummed request frames and the drive answers each one
//! with exactly one response frame.  See [`crate::protocol::codec`] for the
//! byte layout.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Two-byte preamble that starts every request frame.
pub const PREAMBLE: [u8; 2] = *b"ZZ";

/// Single byte the machine sends when a response failed validation.
pub const NAK: u8 = 0x15;

/// Width of the name field in directory requests and entries.
pub const NAME_FIELD_LEN: usize = 24;

/// Maximum number of payload bytes returned by one read.
pub const READ_CHUNK_SIZE: usize = 128;

/// Free-sector count reported in directory entries (read-only disk: none).
pub const FREE_SECTORS: u8 = 0;

// ── Command codes ─────────────────────────────────────────────────────────────

/// Request command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandCode {
    DirectoryRef = 0x00,
    Open = 0x01,
    Close = 0x02,
    Read = 0x03,
    Write = 0x04,
    Delete = 0x05,
    Format = 0x06,
    Status = 0x07,
}

impl TryFrom<u8> for CommandCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(CommandCode::DirectoryRef),
            0x01 => Ok(CommandCode::Open),
            0x02 => Ok(CommandCode::Close),
            0x03 => Ok(CommandCode::Read),
            0x04 => Ok(CommandCode::Write),
            0x05 => Ok(CommandCode::Delete),
            0x06 => Ok(CommandCode::Format),
            0x07 => Ok(CommandCode::Status),
            _ => Err(()),
        }
    }
}

/// Response type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseCode {
    ReadData = 0x10,
    DirectoryEntry = 0x11,
    Status = 0x12,
}

impl TryFrom<u8> for ResponseCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x10 => Ok(ResponseCode::ReadData),
            0x11 => Ok(ResponseCode::DirectoryEntry),
            0x12 => Ok(ResponseCode::Status),
            _ => Err(()),
        }
    }
}

/// Status codes carried by a [`Response::Status`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DriveStatus {
    Normal = 0x00,
    FileNotFound = 0x10,
    NoFileName = 0x30,
    ParameterError = 0x36,
    AlreadyOpen = 0x37,
    NotOpen = 0x38,
    EndOfFile = 0x3F,
    WriteProtected = 0x50,
}

impl TryFrom<u8> for DriveStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(DriveStatus::Normal),
            0x10 => Ok(DriveStatus::FileNotFound),
            0x30 => Ok(DriveStatus::NoFileName),
            0x36 => Ok(DriveStatus::ParameterError),
            0x37 => Ok(DriveStatus::AlreadyOpen),
            0x38 => Ok(DriveStatus::NotOpen),
            0x3F => Ok(DriveStatus::EndOfFile),
            0x50 => Ok(DriveStatus::WriteProtected),
            _ => Err(()),
        }
    }
}

// ── Request payloads ──────────────────────────────────────────────────────────

/// How a directory reference selects its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SearchForm {
    /// Look the name up.
    ByName = 0x00,
    /// Start a listing at the first entry.
    First = 0x01,
    /// Continue a listing.
    Next = 0x02,
}

impl TryFrom<u8> for SearchForm {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(SearchForm::ByName),
            0x01 => Ok(SearchForm::First),
            0x02 => Ok(SearchForm::Next),
            _ => Err(()),
        }
    }
}

/// Access mode requested by an open command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpenMode {
    WriteNew = 0x01,
    Append = 0x02,
    Read = 0x03,
}

impl TryFrom<u8> for OpenMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(OpenMode::WriteNew),
            0x02 => Ok(OpenMode::Append),
            0x03 => Ok(OpenMode::Read),
            _ => Err(()),
        }
    }
}

/// A directory reference request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRef {
    /// Entry name with the padding stripped (a slot number such as `"901"`).
    pub name: String,
    /// Attribute byte as sent by the machine.
    pub attribute: u8,
    pub search: SearchForm,
}

/// A decoded request from the knitting machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    DirectoryRef(DirectoryRef),
    Open(OpenMode),
    Close,
    Read,
    Status,
    /// Write, delete or format: recognised but refused on a read-only disk.
    Modify(CommandCode),
    /// A well-formed frame whose command or parameters are not understood.
    Unsupported { command: u8 },
}

impl Request {
    /// Command byte used on the wire for this request.
    pub fn command_byte(&self) -> u8 {
        match self {
            Request::DirectoryRef(_) => CommandCode::DirectoryRef as u8,
            Request::Open(_) => CommandCode::Open as u8,
            Request::Close => CommandCode::Close as u8,
            Request::Read => CommandCode::Read as u8,
            Request::Status => CommandCode::Status as u8,
            Request::Modify(code) => *code as u8,
            Request::Unsupported { command } => *command,
        }
    }
}

// ── Response payloads ─────────────────────────────────────────────────────────

/// One directory entry as returned to the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntryInfo {
    /// Entry name; empty when a listing is exhausted.
    pub name: String,
    /// Size of the file in bytes.
    pub size: u32,
    /// Free sectors left on the disk.
    pub free_sectors: u8,
}

impl DirectoryEntryInfo {
    /// The entry returned when a listing has no more files.
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            size: 0,
            free_sectors: FREE_SECTORS,
        }
    }

    /// Whether this is the end-of-listing marker.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// A response sent back to the knitting machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Up to [`READ_CHUNK_SIZE`] bytes of file data.
    ReadData(Vec<u8>),
    DirectoryEntry(DirectoryEntryInfo),
    Status(DriveStatus),
}

impl Response {
    /// Response type byte used on the wire.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Response::ReadData(_) => ResponseCode::ReadData,
            Response::DirectoryEntry(_) => ResponseCode::DirectoryEntry,
            Response::Status(_) => ResponseCode::Status,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
