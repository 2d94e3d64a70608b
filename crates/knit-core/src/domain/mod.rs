//! Domain entities for knitdisk.
//!
//! This module contains pure pattern logic with no infrastructure dependencies.
//!
//! # What lives here? (for beginners)
//!
//! - **`grid`** – the stitch matrix ([`grid::PatternGrid`]) and its compact
//!   machine-native bit encoding.
//! - **`pattern_file`** – the file container ([`pattern_file::PatternFile`])
//!   that wraps an encoded grid with a header so it can be stored on disk and
//!   validated when read back.
//! - **`track`** – a 2 KiB image of the KH-930's pattern memory, the format
//!   the machine itself writes to a real floppy disk.
//!
//! None of these modules touch the file system, the serial port or the
//! image decoder, so they can be tested on any platform without setup.

pub mod grid;
pub mod pattern_file;
pub mod track;
