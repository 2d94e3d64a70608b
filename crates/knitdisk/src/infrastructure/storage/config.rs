//! TOML-based configuration for knitdisk.
//!
//! Reads `AppConfig` from the platform-appropriate config file:
//! - Linux:    `$XDG_CONFIG_HOME/knitdisk/config.toml` (or `~/.config/knitdisk/`)
//! - macOS:    `~/Library/Application Support/knitdisk/config.toml`
//! - Windows:  `%APPDATA%\knitdisk\config.toml`
//!
//! or from an explicit path given with `--config`.
//!
//! ```toml
//! log_level = "info"
//!
//! [converter]
//! scale = 1.5
//! machine_width = 60
//! output_dir = "patterns"
//!
//! [serial]
//! device = "/dev/ttyUSB0"
//! baud_rate = 9600
//!
//! [emulator]
//! max_retries = 3
//! idle_timeout_secs = 0
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent from the TOML file, and every
//! section is optional.  A missing file is not an error: the defaults apply.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::convert_image::ConversionSettings;
use crate::application::emulate_disk::EmulatorConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// `tracing` log level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub emulator: EmulatorSection,
}

/// Image conversion defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConverterConfig {
    /// Vertical stretch applied to the row count.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Pattern width in stitches.
    #[serde(default = "default_machine_width")]
    pub machine_width: u16,
    /// Directory that receives converted `.pat` files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// Serial link to the knitting machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Disk emulator tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmulatorSection {
    /// Consecutive framing failures tolerated before the session aborts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds without traffic before the session ends; `0` disables.
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_scale() -> f64 {
    1.5
}
fn default_machine_width() -> u16 {
    60
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("patterns")
}
fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_max_retries() -> u32 {
    3
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            converter: ConverterConfig::default(),
            serial: SerialConfig::default(),
            emulator: EmulatorSection::default(),
        }
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            machine_width: default_machine_width(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for EmulatorSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            idle_timeout_secs: 0,
        }
    }
}

impl ConverterConfig {
    /// Converter settings described by this section.
    pub fn settings(&self) -> ConversionSettings {
        ConversionSettings {
            scale: self.scale,
            machine_width: self.machine_width,
        }
    }
}

impl EmulatorSection {
    /// Emulator settings described by this section.
    pub fn emulator_config(&self) -> EmulatorConfig {
        EmulatorConfig {
            max_retries: self.max_retries,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads `AppConfig` from `path`, or from [`config_file_path`] when `None`.
///
/// Returns `AppConfig::default()` if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let cfg: AppConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Resolves the platform config directory including the `knitdisk` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("knitdisk"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("knitdisk")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("knitdisk"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
