//! Locations under the cairn home directory.

use dirs::home_dir;
use std::path::PathBuf;

/// Returns the cairn home directory, or None if the user's home cannot be resolved.
pub fn try_cairn_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("CAIRN_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".cairn"))
}

/// Returns the cairn home directory (`~/.cairn`).
///
/// Falls back to a relative `.cairn` when neither `CAIRN_HOME` nor a home
/// directory is available.
pub fn cairn_home() -> PathBuf {
    try_cairn_home().unwrap_or_else(|| PathBuf::from(".cairn"))
}

/// Default configuration file: ~/.cairn/config.toml
pub fn config_path() -> PathBuf {
    cairn_home().join("config.toml")
}

/// System database: ~/.cairn/system.db
pub fn db_path() -> PathBuf {
    cairn_home().join("system.db")
}

/// Downloaded artifacts: ~/.cairn/cache
pub fn cache_path() -> PathBuf {
    cairn_home().join("cache")
}

/// Scratch space: ~/.cairn/tmp
pub fn tmp_path() -> PathBuf {
    cairn_home().join("tmp")
}
