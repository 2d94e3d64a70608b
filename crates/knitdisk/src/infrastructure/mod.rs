//! Infrastructure layer for knitdisk.
//!
//! Contains OS-facing adapters: serial devices and file-system storage
//! (configuration and pattern files).

pub mod serial;
pub mod storage;
