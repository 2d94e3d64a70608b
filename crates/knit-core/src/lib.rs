//! # knit-core
//!
//! Shared library for knitdisk containing the stitch-pattern domain model,
//! the pattern file format, the KH-930 track image and the disk-drive
//! protocol codec.
//!
//! It has zero dependencies on the file system, serial ports or image
//! decoders.
//!
//! # Architecture overview (for beginners)
//!
//! knitdisk lets a vintage electronic knitting machine load a pattern made
//! from an ordinary picture.  The machine expects to read patterns from a
//! floppy drive attached to its serial port; knitdisk pretends to be that
//! drive.
//!
//! This crate (`knit-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – Pure pattern logic.  A `PatternGrid` is a matrix of
//!   stitches; a `PatternFile` wraps the grid's machine-native bytes with a
//!   checked header; a `Track` lays patterns out the way the machine stores
//!   them in memory.
//!
//! - **`protocol`** – How bytes travel over the serial link.  Requests from
//!   the machine and responses from the drive are short checksummed frames
//!   that the codec turns into typed Rust values and back.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `knit_core::PatternGrid` instead of `knit_core::domain::grid::PatternGrid`.
pub use domain::grid::{GridError, PatternGrid, MAX_NEEDLES};
pub use domain::pattern_file::{PatternFile, PatternFileError, PATTERN_EXTENSION};
pub use domain::track::{Track, TrackError};
pub use protocol::codec::{decode_request, encode_response, FrameError};
pub use protocol::messages::{Request, Response};
