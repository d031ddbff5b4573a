//! Persistent name -> cluster resolution cache.
//!
//! One JSON object keyed by cluster name, stored at
//! `<state>/cache/discovery.json`. Cross-process safety comes from an
//! advisory lock on a sidecar lock file; in-process readers and writers
//! share an `RwLock`. Mutations rewrite the whole file through a temp file
//! and rename, so readers never observe a torn document.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

/// Endpoint as persisted in a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEndpoint {
    pub ip: String,
    pub port: u16,
}

/// One remembered resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub cluster_id: porthole_core::ResourceId,
    pub region: String,
    pub compartment_id: porthole_core::ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<CachedEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion_id: Option<porthole_core::ResourceId>,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.cached_at < ttl,
            Err(_) => false,
        }
    }
}

type CacheMap = BTreeMap<String, CacheEntry>;

/// File-backed discovery cache with a global TTL.
pub struct DiscoveryCache {
    path: PathBuf,
    ttl: Duration,
    lock: RwLock<()>,
}

impl DiscoveryCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh entry for `name`, or `None` when absent or stale.
    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        self.get_any(name)
            .filter(|e| e.is_fresh(self.ttl, Utc::now()))
    }

    /// Entry regardless of age — the use-stale-on-error fallback. Callers
    /// must treat the result as possibly out of date.
    pub fn get_stale(&self, name: &str) -> Option<CacheEntry> {
        self.get_any(name)
    }

    fn get_any(&self, name: &str) -> Option<CacheEntry> {
        let _shared = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let _flock = self.shared_flock();
        self.read_map().get(name).cloned()
    }

    /// Insert or replace the entry for `entry.name`. The whole file is
    /// rewritten atomically under the exclusive locks.
    pub fn put(&self, entry: CacheEntry) -> Result<()> {
        let _exclusive = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let _flock = self.exclusive_flock()?;
        let mut map = self.read_map();
        map.insert(entry.name.clone(), entry);
        self.write_map(&map)
    }

    /// Drop the entry for `name`, if present.
    pub fn invalidate(&self, name: &str) -> Result<()> {
        let _exclusive = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let _flock = self.exclusive_flock()?;
        let mut map = self.read_map();
        if map.remove(name).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    /// All entries, stale ones included (used by cache inspection).
    pub fn entries(&self) -> Vec<CacheEntry> {
        let _shared = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let _flock = self.shared_flock();
        self.read_map().into_values().collect()
    }

    fn lock_path(&self) -> PathBuf {
        // The data file is replaced by rename on every write; the advisory
        // lock lives on a stable sidecar instead.
        let mut p = self.path.as_os_str().to_owned();
        p.push(".lock");
        PathBuf::from(p)
    }

    fn open_lock_file(&self) -> std::io::Result<File> {
        if let Some(parent) = self.lock_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path())
    }

    fn shared_flock(&self) -> Option<File> {
        let file = self.open_lock_file().ok()?;
        FileExt::lock_shared(&file).ok()?;
        Some(file)
    }

    fn exclusive_flock(&self) -> Result<File> {
        let file = self.open_lock_file()?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    }

    fn read_map(&self) -> CacheMap {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return CacheMap::new(),
        };
        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "discovery cache unreadable, starting empty");
                CacheMap::new()
            }
        }
    }

    fn write_map(&self, map: &CacheMap) -> Result<()> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;

        let json = serde_json::to_string_pretty(map).map_err(std::io::Error::other)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porthole_core::ResourceId;

    fn entry(name: &str, cached_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            name: name.to_string(),
            cluster_id: ResourceId::new("ocid1.cluster.oc1.eu-frankfurt-1.c1"),
            region: "eu-frankfurt-1".into(),
            compartment_id: ResourceId::new("ocid1.compartment.oc1..cmp"),
            endpoint: Some(CachedEndpoint {
                ip: "10.0.0.5".into(),
                port: 6443,
            }),
            bastion_id: Some(ResourceId::new("ocid1.bastion.oc1.eu-frankfurt-1.b1")),
            cached_at,
        }
    }

    fn temp_cache(ttl: Duration) -> (tempfile::TempDir, DiscoveryCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiscoveryCache::new(dir.path().join("cache/discovery.json"), ttl);
        (dir, cache)
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, cache) = temp_cache(Duration::from_secs(3600));
        cache.put(entry("prod", Utc::now())).unwrap();

        let got = cache.get("prod").unwrap();
        assert_eq!(got.region, "eu-frankfurt-1");
        assert_eq!(got.endpoint.as_ref().unwrap().port, 6443);
        assert!(cache.get("staging").is_none());
    }

    #[test]
    fn test_stale_entry_hidden_from_get() {
        let (_dir, cache) = temp_cache(Duration::from_secs(60));
        let old = Utc::now() - chrono::Duration::seconds(120);
        cache.put(entry("prod", old)).unwrap();

        assert!(cache.get("prod").is_none());
        // ... but still reachable through the explicit stale accessor.
        assert!(cache.get_stale("prod").is_some());
    }

    #[test]
    fn test_freshness_boundary() {
        let ttl = Duration::from_secs(3600);
        let now = Utc::now();
        assert!(entry("a", now - chrono::Duration::seconds(3599)).is_fresh(ttl, now));
        assert!(!entry("a", now - chrono::Duration::seconds(3600)).is_fresh(ttl, now));
    }

    #[test]
    fn test_invalidate() {
        let (_dir, cache) = temp_cache(Duration::from_secs(3600));
        cache.put(entry("prod", Utc::now())).unwrap();
        cache.invalidate("prod").unwrap();
        assert!(cache.get_stale("prod").is_none());

        // Invalidating a missing name is a no-op.
        cache.invalidate("missing").unwrap();
    }

    #[test]
    fn test_file_format_keyed_by_name() {
        let (_dir, cache) = temp_cache(Duration::from_secs(3600));
        cache.put(entry("prod", Utc::now())).unwrap();

        let raw = std::fs::read_to_string(cache.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("prod").is_some());
        assert_eq!(value["prod"]["name"], "prod");
        assert_eq!(value["prod"]["endpoint"]["ip"], "10.0.0.5");
        assert!(value["prod"].get("cached_at").is_some());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let (_dir, cache) = temp_cache(Duration::from_secs(3600));
        let mut e = entry("bare", Utc::now());
        e.endpoint = None;
        e.bastion_id = None;
        cache.put(e).unwrap();

        let raw = std::fs::read_to_string(cache.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["bare"].get("endpoint").is_none());
        assert!(value["bare"].get("bastion_id").is_none());
    }

    #[test]
    fn test_corrupt_file_treated_as_empty() {
        let (_dir, cache) = temp_cache(Duration::from_secs(3600));
        std::fs::create_dir_all(cache.path().parent().unwrap()).unwrap();
        std::fs::write(cache.path(), "{ not json").unwrap();

        assert!(cache.get("prod").is_none());
        // A put after corruption recovers the file.
        cache.put(entry("prod", Utc::now())).unwrap();
        assert!(cache.get("prod").is_some());
    }

    #[test]
    fn test_multiple_entries_survive_rewrites() {
        let (_dir, cache) = temp_cache(Duration::from_secs(3600));
        cache.put(entry("prod", Utc::now())).unwrap();
        let mut second = entry("staging", Utc::now());
        second.name = "staging".into();
        cache.put(second).unwrap();

        assert_eq!(cache.entries().len(), 2);
        assert!(cache.get("prod").is_some());
        assert!(cache.get("staging").is_some());
    }
}
