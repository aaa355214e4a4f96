//! Meshlink Settings
//!
//! On-disk configuration for a Meshlink node.
//!
//! ## Features
//!
//! - Node identity, tunnel, relay and proxy settings in one JSON file
//! - Config directory from `MESHLINK_CONFIG_DIR` or `~/.meshlink`
//! - Defaults for every missing field
//!
//! ## Usage
//!
//! ```no_run
//! use meshlink_settings::{default_settings_path, Settings};
//!
//! let mut settings = Settings::load_or_default(&default_settings_path())?;
//! settings.mesh.proxy.listen_port = 1081;
//! settings.save()?;
//! # Ok::<(), meshlink_settings::SettingsError>(())
//! ```

mod settings;

pub use settings::Settings;

use std::path::PathBuf;

use thiserror::Error;

/// Overrides the config directory
pub const CONFIG_DIR_ENV: &str = "MESHLINK_CONFIG_DIR";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// `$MESHLINK_CONFIG_DIR`, else `$HOME/.meshlink`
pub fn default_config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".meshlink")
}

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
