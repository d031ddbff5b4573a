use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use porthole_core::{Bastion, BastionSession, Cluster, ResourceId};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// A compartment node from the tenancy tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compartment {
    pub id: ResourceId,
    pub name: String,
    pub parent_id: Option<ResourceId>,
}

/// Cluster listing row; `get_cluster` fills in endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSummary {
    pub id: ResourceId,
    pub name: String,
    pub region: String,
    pub compartment_id: ResourceId,
}

/// Bastion listing row; `get_bastion` fills in lifecycle and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BastionSummary {
    pub id: ResourceId,
    pub name: String,
    pub compartment_id: ResourceId,
}

/// Everything the bastion service needs to mint a port-forwarding session.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub bastion_id: ResourceId,
    pub target_host: String,
    pub target_port: u16,
    /// One-line OpenSSH public key authorized for this session.
    pub public_key: String,
    pub ttl: Duration,
    pub display_name: String,
}

/// The cloud control-plane capability.
///
/// Every call takes a cancellation token and resolves promptly once it
/// fires. Implementations fully consume any service-side pagination before
/// returning; callers always see complete collections.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn list_subscribed_regions(&self, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// Direct children of `parent` in the compartment tree.
    async fn list_compartments(
        &self,
        parent: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Vec<Compartment>>;

    /// Resolve a `parent/child/grandchild` path from the tenancy root to a
    /// compartment ID.
    async fn resolve_compartment_path(
        &self,
        tenancy: &ResourceId,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<ResourceId>;

    async fn list_clusters(
        &self,
        region: &str,
        compartment: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClusterSummary>>;

    async fn get_cluster(
        &self,
        region: &str,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Cluster>;

    async fn list_bastions(
        &self,
        region: &str,
        compartment: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Vec<BastionSummary>>;

    async fn get_bastion(
        &self,
        region: &str,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Bastion>;

    async fn create_session(
        &self,
        region: &str,
        request: CreateSessionRequest,
        cancel: &CancellationToken,
    ) -> Result<BastionSession>;

    async fn get_session(
        &self,
        region: &str,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<BastionSession>;

    /// Best-effort session teardown; implementations may no-op when the
    /// service has no delete call.
    async fn delete_session(
        &self,
        region: &str,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Ask the credential provider to refresh. Returns `false` when the
    /// implementation exposes no refresh hook; callers then surface the
    /// original authentication failure.
    async fn refresh_credentials(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Timestamp helper shared by implementations and the mock.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}
