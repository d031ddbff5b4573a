//! Porthole Settings
//!
//! The operator-editable settings document: tenancy context plus the
//! tunnel, pool, discovery, and proxy sections defined in `porthole-core`.
//! Stored as JSON under the per-user config directory; saves go through a
//! temp file and rename so a crash never leaves a torn document behind.

mod config;

pub use config::Settings;

use std::path::PathBuf;

use porthole_keystore::config_dir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings file unreadable: {0}")]
    Unreadable(std::io::Error),

    #[error("Settings file is not valid JSON: {0}")]
    Malformed(serde_json::Error),

    #[error("Settings write failed: {0}")]
    WriteFailed(std::io::Error),

    #[error("No config directory available: {0}")]
    NoConfigDir(#[from] porthole_keystore::KeystoreError),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Where the settings document lives (`<config>/porthole/settings.json`).
pub fn settings_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("settings.json"))
}
