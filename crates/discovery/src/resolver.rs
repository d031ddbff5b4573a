//! Name -> (cluster, bastion, endpoint) resolution.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use porthole_core::{
    Bastion, BastionLifecycle, Classify, Cluster, ConfigContext, DiscoveryConfig, Resolution,
    ResourceId,
};
use porthole_cloud::{CloudApi, CloudError, ClusterSummary};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CachedEndpoint, DiscoveryCache};
use crate::{ResolveError, Result};

/// Caller-supplied narrowing for one resolve call.
#[derive(Debug, Clone, Default)]
pub struct ResolveHints {
    /// Search only this region instead of every subscribed one.
    pub region: Option<String>,
    /// Skip the cache entirely (both lookup and stale fallback).
    pub no_cache: bool,
}

/// Resolves human cluster names against the cloud control plane.
///
/// Compartment enumeration is memoized for the lifetime of the value; the
/// process owns one `Discoverer`, which matches the once-per-process
/// semantics without any global state.
pub struct Discoverer {
    api: Arc<dyn CloudApi>,
    ctx: ConfigContext,
    config: DiscoveryConfig,
    cache: DiscoveryCache,
    /// Preferred bastion name (exact or prefix) from configuration.
    bastion_name: Option<String>,
    compartments: tokio::sync::Mutex<Option<Arc<Vec<ResourceId>>>>,
}

impl Discoverer {
    pub fn new(
        api: Arc<dyn CloudApi>,
        ctx: ConfigContext,
        config: DiscoveryConfig,
        cache: DiscoveryCache,
        bastion_name: Option<String>,
    ) -> Self {
        Self {
            api,
            ctx,
            config,
            cache,
            bastion_name,
            compartments: tokio::sync::Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    /// Resolve `name` to a concrete target. Never retries internally; the
    /// caller decides what to do with a `Transient` failure.
    pub async fn resolve(
        &self,
        name: &str,
        hints: &ResolveHints,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        if !hints.no_cache {
            if let Some(entry) = self.cache.get(name) {
                debug!(name, cluster = %entry.cluster_id, "discovery cache hit");
                match self.materialize(&entry, false, cancel).await {
                    Ok(resolution) => return Ok(resolution),
                    Err(err) => {
                        warn!(name, %err, "cached resolution no longer valid, re-searching");
                        self.cache.invalidate(name)?;
                    }
                }
            }
        }

        let searched = match timeout(
            self.config.resolve_timeout,
            self.search(name, hints, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout),
        };

        match searched {
            Ok(resolution) => {
                self.remember(name, &resolution)?;
                Ok(resolution)
            }
            Err(err) if !hints.no_cache && self.config.use_stale_on_error && err.is_retryable() => {
                self.stale_fallback(name, err, cancel).await
            }
            Err(err) => Err(err),
        }
    }

    async fn stale_fallback(
        &self,
        name: &str,
        original: ResolveError,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        let Some(entry) = self.cache.get_stale(name) else {
            return Err(original);
        };
        warn!(name, "live discovery failed, falling back to stale cache entry");
        match self.materialize(&entry, true, cancel).await {
            Ok(resolution) => Ok(resolution),
            Err(_) => Err(original),
        }
    }

    /// Rebuild a full resolution from a cache entry via cheap by-ID gets.
    async fn materialize(
        &self,
        entry: &CacheEntry,
        stale: bool,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        let cluster = self
            .api
            .get_cluster(&entry.region, &entry.cluster_id, cancel)
            .await?;

        let bastion = match &entry.bastion_id {
            Some(id) => self.api.get_bastion(&entry.region, id, cancel).await?,
            None => self.choose_bastion(&cluster, cancel).await?,
        };

        let endpoint = match &entry.endpoint {
            Some(cached) => cluster
                .endpoints
                .iter()
                .find(|e| e.ip == cached.ip && e.port == cached.port)
                .or_else(|| cluster.preferred_endpoint())
                .cloned(),
            None => cluster.preferred_endpoint().cloned(),
        }
        .ok_or_else(|| ResolveError::NoEndpoint {
            cluster: cluster.id.clone(),
        })?;

        Ok(Resolution {
            cluster,
            bastion,
            endpoint,
            stale,
        })
    }

    async fn search(
        &self,
        name: &str,
        hints: &ResolveHints,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        let regions = match &hints.region {
            Some(region) => vec![region.clone()],
            None => self.api.list_subscribed_regions(cancel).await?,
        };
        let compartments = self.searchable_compartments(cancel).await?;
        debug!(
            name,
            regions = regions.len(),
            compartments = compartments.len(),
            "searching for cluster"
        );

        let region_budget = self.config.region_timeout;
        let tasks = regions.iter().map(|region| {
            let compartments = compartments.clone();
            async move {
                let result = timeout(
                    region_budget,
                    self.search_region(region, name, &compartments, cancel),
                )
                .await;
                (region.clone(), result)
            }
        });

        let mut hits: Vec<ClusterSummary> = Vec::new();
        let mut first_err: Option<ResolveError> = None;
        for (region, outcome) in futures::future::join_all(tasks).await {
            match outcome {
                Err(_) => {
                    warn!(%region, "region search exceeded its budget");
                    first_err.get_or_insert(ResolveError::Timeout);
                }
                Ok(Err(err)) => {
                    warn!(%region, %err, "region search failed");
                    first_err.get_or_insert(err);
                }
                Ok(Ok(mut region_hits)) => hits.append(&mut region_hits),
            }
        }

        let mut seen = HashSet::new();
        hits.retain(|c| seen.insert(c.id.clone()));

        if hits.is_empty() {
            return Err(match first_err {
                Some(err) => err,
                None => ResolveError::NotFound(name.to_string()),
            });
        }
        if hits.len() > 1 {
            return Err(ResolveError::Ambiguous {
                name: name.to_string(),
                candidates: hits,
            });
        }

        let winner = hits.remove(0);
        info!(name, cluster = %winner.id, region = %winner.region, "cluster resolved");

        let cluster = self
            .api
            .get_cluster(&winner.region, &winner.id, cancel)
            .await?;
        let bastion = self.choose_bastion(&cluster, cancel).await?;
        let endpoint = cluster
            .preferred_endpoint()
            .cloned()
            .ok_or_else(|| ResolveError::NoEndpoint {
                cluster: cluster.id.clone(),
            })?;

        Ok(Resolution {
            cluster,
            bastion,
            endpoint,
            stale: false,
        })
    }

    async fn search_region(
        &self,
        region: &str,
        name: &str,
        compartments: &[ResourceId],
        cancel: &CancellationToken,
    ) -> Result<Vec<ClusterSummary>> {
        let mut hits = Vec::new();
        for compartment in compartments {
            let rows = match self.api.list_clusters(region, compartment, cancel).await {
                Ok(rows) => rows,
                // A compartment unknown to this region is simply empty.
                Err(CloudError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            hits.extend(rows.into_iter().filter(|c| c.name.eq_ignore_ascii_case(name)));
        }
        Ok(hits)
    }

    /// Tenancy root plus every descendant compartment, memoized.
    async fn searchable_compartments(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<ResourceId>>> {
        let mut guard = self.compartments.lock().await;
        if let Some(list) = guard.as_ref() {
            return Ok(list.clone());
        }

        let mut all = vec![self.ctx.tenancy_id.clone()];
        let mut queue = vec![self.ctx.tenancy_id.clone()];
        while let Some(parent) = queue.pop() {
            for child in self.api.list_compartments(&parent, cancel).await? {
                queue.push(child.id.clone());
                all.push(child.id);
            }
        }
        debug!(count = all.len(), "compartment tree enumerated");

        let list = Arc::new(all);
        *guard = Some(list.clone());
        Ok(list)
    }

    /// Pick the bastion that will front this cluster's tunnel.
    async fn choose_bastion(
        &self,
        cluster: &Cluster,
        cancel: &CancellationToken,
    ) -> Result<Bastion> {
        let rows = self
            .api
            .list_bastions(&cluster.region, &cluster.compartment_id, cancel)
            .await?;

        match &self.bastion_name {
            Some(wanted) => {
                let matched: Vec<_> = rows
                    .iter()
                    .filter(|b| b.name == *wanted || b.name.starts_with(wanted.as_str()))
                    .collect();
                if matched.is_empty() {
                    return Err(ResolveError::BastionNotFound {
                        name: wanted.clone(),
                        compartment: cluster.compartment_id.clone(),
                    });
                }

                let mut details = Vec::with_capacity(matched.len());
                for row in matched {
                    details.push(self.api.get_bastion(&cluster.region, &row.id, cancel).await?);
                }
                // Prefer ACTIVE, then earliest created_at.
                details.sort_by(|a, b| {
                    let a_active = a.lifecycle == BastionLifecycle::Active;
                    let b_active = b.lifecycle == BastionLifecycle::Active;
                    b_active
                        .cmp(&a_active)
                        .then(a.created_at.cmp(&b.created_at))
                });
                Ok(details.remove(0))
            }
            None => match rows.len() {
                0 => Err(ResolveError::NoBastion {
                    compartment: cluster.compartment_id.clone(),
                }),
                1 => Ok(self
                    .api
                    .get_bastion(&cluster.region, &rows[0].id, cancel)
                    .await?),
                _ => Err(ResolveError::AmbiguousBastion {
                    compartment: cluster.compartment_id.clone(),
                    candidates: rows.into_iter().map(|b| b.id).collect(),
                }),
            },
        }
    }

    fn remember(&self, name: &str, resolution: &Resolution) -> Result<()> {
        self.cache.put(CacheEntry {
            name: name.to_string(),
            cluster_id: resolution.cluster.id.clone(),
            region: resolution.cluster.region.clone(),
            compartment_id: resolution.cluster.compartment_id.clone(),
            endpoint: Some(CachedEndpoint {
                ip: resolution.endpoint.ip.clone(),
                port: resolution.endpoint.port,
            }),
            bastion_id: Some(resolution.bastion.id.clone()),
            cached_at: Utc::now(),
        })
    }
}
