//! Storage infrastructure: configuration and pattern files.
//!
//! - `config` reads the TOML configuration file, falling back to defaults
//!   when it does not exist yet.
//! - `pattern_store` loads pattern files and exposes them by slot number to
//!   the disk emulator.

pub mod config;
pub mod pattern_store;
