use std::io::Write;
use std::path::{Path, PathBuf};

use porthole_core::config::{DiscoveryConfig, PoolConfig, ProxyConfig, TunnelConfig};
use porthole_core::{ConfigContext, ResourceId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{settings_path, Result, SettingsError};

/// The whole settings document.
///
/// Every section deserializes independently with its own defaults, so a
/// file that names only the knobs the operator cares about stays valid as
/// new sections appear.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Tenancy the tool operates in.
    #[serde(default)]
    pub tenancy_id: Option<ResourceId>,

    /// Home region, the anchor for compartment enumeration.
    #[serde(default)]
    pub home_region: Option<String>,

    /// Tunnel behavior (local port, session ttl, drain).
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// SSH transport pool sizing and health.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Discovery cache and search budgets.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Outbound proxying.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Where this document was loaded from; saves go back there.
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl Settings {
    /// Read the document at `path`. A missing file yields defaults bound to
    /// that path; an unparseable file is an error, never silently replaced.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(raw) => {
                let parsed = serde_json::from_str(&raw).map_err(SettingsError::Malformed)?;
                debug!(path = %path.display(), "settings loaded");
                parsed
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(SettingsError::Unreadable(err)),
        };
        settings.source = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Read from the default location.
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&settings_path()?)
    }

    /// Persist back to where the document came from, or to the default
    /// location for a document built in memory.
    pub fn save(&self) -> Result<()> {
        match &self.source {
            Some(path) => self.save_to(path),
            None => self.save_to(&settings_path()?),
        }
    }

    /// Write the document to `path` through a temp file and rename, the
    /// same discipline the discovery cache uses.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(SettingsError::WriteFailed)?;

        let json = serde_json::to_string_pretty(self).map_err(SettingsError::Malformed)?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(SettingsError::WriteFailed)?;
        tmp.write_all(json.as_bytes())
            .map_err(SettingsError::WriteFailed)?;
        tmp.persist(path)
            .map_err(|e| SettingsError::WriteFailed(e.error))?;

        debug!(path = %path.display(), "settings written");
        Ok(())
    }

    /// Tenancy context for the resolver; `None` until both halves are
    /// configured.
    pub fn context(&self) -> Option<ConfigContext> {
        Some(ConfigContext {
            tenancy_id: self.tenancy_id.clone()?,
            home_region: self.home_region.clone()?,
        })
    }
}
