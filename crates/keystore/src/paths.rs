use std::path::PathBuf;

use crate::{KeystoreError, Result};

/// Per-user state directory (`~/.local/share/porthole` on Linux).
pub fn state_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
        .map(|d| d.join("porthole"))
        .ok_or(KeystoreError::NoHomeDir)
}

/// Discovery cache directory under the state dir.
pub fn cache_dir() -> Result<PathBuf> {
    Ok(state_dir()?.join("cache"))
}

/// Audit log directory under the state dir.
pub fn audit_dir() -> Result<PathBuf> {
    Ok(state_dir()?.join("audit"))
}

/// Per-user configuration directory (`~/.config/porthole` on Linux).
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("porthole"))
        .ok_or(KeystoreError::NoHomeDir)
}

/// Expand a leading `~` or `~/` to the user's home directory. Paths without
/// a tilde pass through untouched.
pub fn expand_path(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_subdirs() {
        let state = state_dir().unwrap();
        assert!(state.ends_with("porthole"));
        assert_eq!(cache_dir().unwrap(), state.join("cache"));
        assert_eq!(audit_dir().unwrap(), state.join("audit"));
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_path("~/state/cache");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with("state/cache"));
    }

    #[test]
    fn test_expand_passthrough() {
        assert_eq!(expand_path("/tmp/x"), PathBuf::from("/tmp/x"));
        assert_eq!(expand_path("relative/x"), PathBuf::from("relative/x"));
    }
}
