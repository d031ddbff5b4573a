//! In-memory [`CloudApi`] used by tests across the workspace.
//!
//! Fixtures are registered up front; fault injection pushes tagged errors
//! onto per-operation queues that fail the next matching call. Session
//! activation is modeled with a configurable delay so poll loops can be
//! exercised for real.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use porthole_core::{Bastion, BastionSession, Cluster, ResourceId, SessionState};
use tokio_util::sync::CancellationToken;

use crate::api::now;
use crate::{
    BastionSummary, CloudApi, CloudError, ClusterSummary, Compartment, CreateSessionRequest,
    Result,
};

struct SessionSlot {
    session: BastionSession,
    created: Instant,
}

#[derive(Default)]
struct State {
    regions: Vec<String>,
    compartments: Vec<Compartment>,
    clusters: Vec<Cluster>,
    bastions: Vec<Bastion>,
    sessions: HashMap<String, SessionSlot>,
    session_activation: Duration,
    ssh_host: String,
    fail_next: HashMap<&'static str, VecDeque<CloudError>>,
    calls: HashMap<&'static str, usize>,
    session_seq: u64,
    refresh_supported: bool,
    credential_refreshes: usize,
}

/// Scriptable in-memory control plane.
pub struct MockCloud {
    state: Mutex<State>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                ssh_host: "bastion-front.mock.example.com".to_string(),
                ..State::default()
            }),
        }
    }

    pub fn add_region(&self, region: &str) {
        self.state.lock().unwrap().regions.push(region.to_string());
    }

    pub fn add_compartment(&self, id: &str, name: &str, parent: Option<&str>) {
        self.state.lock().unwrap().compartments.push(Compartment {
            id: ResourceId::new(id),
            name: name.to_string(),
            parent_id: parent.map(ResourceId::new),
        });
    }

    pub fn add_cluster(&self, cluster: Cluster) {
        self.state.lock().unwrap().clusters.push(cluster);
    }

    pub fn add_bastion(&self, bastion: Bastion) {
        self.state.lock().unwrap().bastions.push(bastion);
    }

    /// Delay before a created session reports ACTIVE. Zero (the default)
    /// activates on the first `get_session`.
    pub fn set_session_activation(&self, delay: Duration) {
        self.state.lock().unwrap().session_activation = delay;
    }

    /// SSH front-end host reported once sessions activate.
    pub fn set_ssh_host(&self, host: &str) {
        self.state.lock().unwrap().ssh_host = host.to_string();
    }

    pub fn set_refresh_supported(&self, supported: bool) {
        self.state.lock().unwrap().refresh_supported = supported;
    }

    /// Queue an error for the next call to `op` (`"list_clusters"`,
    /// `"create_session"`, ...). Multiple queued errors fail successive
    /// calls in order.
    pub fn fail_next(&self, op: &'static str, err: CloudError) {
        self.state
            .lock()
            .unwrap()
            .fail_next
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// How many times `op` has been invoked.
    pub fn calls(&self, op: &str) -> usize {
        *self.state.lock().unwrap().calls.get(op).unwrap_or(&0)
    }

    pub fn sessions_created(&self) -> usize {
        self.state.lock().unwrap().session_seq as usize
    }

    pub fn credential_refreshes(&self) -> usize {
        self.state.lock().unwrap().credential_refreshes
    }

    /// Force a live session into a terminal state (used by failure tests).
    pub fn expire_session(&self, id: &ResourceId) {
        if let Some(slot) = self.state.lock().unwrap().sessions.get_mut(id.as_str()) {
            slot.session.state = SessionState::Expired;
        }
    }

    fn enter(&self, op: &'static str, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CloudError::cancelled());
        }
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = state.fail_next.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn list_subscribed_regions(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.enter("list_subscribed_regions", cancel)?;
        Ok(self.state.lock().unwrap().regions.clone())
    }

    async fn list_compartments(
        &self,
        parent: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Vec<Compartment>> {
        self.enter("list_compartments", cancel)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .compartments
            .iter()
            .filter(|c| c.parent_id.as_ref() == Some(parent))
            .cloned()
            .collect())
    }

    async fn resolve_compartment_path(
        &self,
        tenancy: &ResourceId,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<ResourceId> {
        self.enter("resolve_compartment_path", cancel)?;
        let state = self.state.lock().unwrap();
        let mut parent = tenancy.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let child = state
                .compartments
                .iter()
                .find(|c| c.parent_id.as_ref() == Some(&parent) && c.name == segment)
                .ok_or_else(|| CloudError::NotFound(format!("compartment path {path}")))?;
            parent = child.id.clone();
        }
        Ok(parent)
    }

    async fn list_clusters(
        &self,
        region: &str,
        compartment: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClusterSummary>> {
        self.enter("list_clusters", cancel)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .clusters
            .iter()
            .filter(|c| c.region == region && &c.compartment_id == compartment)
            .map(|c| ClusterSummary {
                id: c.id.clone(),
                name: c.human_name.clone(),
                region: c.region.clone(),
                compartment_id: c.compartment_id.clone(),
            })
            .collect())
    }

    async fn get_cluster(
        &self,
        region: &str,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Cluster> {
        self.enter("get_cluster", cancel)?;
        self.state
            .lock()
            .unwrap()
            .clusters
            .iter()
            .find(|c| &c.id == id && c.region == region)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("cluster {id}")))
    }

    async fn list_bastions(
        &self,
        region: &str,
        compartment: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Vec<BastionSummary>> {
        self.enter("list_bastions", cancel)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .bastions
            .iter()
            .filter(|b| b.region == region && &b.compartment_id == compartment)
            .map(|b| BastionSummary {
                id: b.id.clone(),
                name: b.name.clone(),
                compartment_id: b.compartment_id.clone(),
            })
            .collect())
    }

    async fn get_bastion(
        &self,
        region: &str,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Bastion> {
        self.enter("get_bastion", cancel)?;
        self.state
            .lock()
            .unwrap()
            .bastions
            .iter()
            .find(|b| &b.id == id && b.region == region)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("bastion {id}")))
    }

    async fn create_session(
        &self,
        region: &str,
        request: CreateSessionRequest,
        cancel: &CancellationToken,
    ) -> Result<BastionSession> {
        self.enter("create_session", cancel)?;
        if request.target_port == 0 {
            return Err(CloudError::InvalidArg("target_port must be nonzero".into()));
        }
        let mut state = self.state.lock().unwrap();
        state.session_seq += 1;
        let id = format!(
            "ocid1.bastionsession.oc1.{region}.mock{:08}",
            state.session_seq
        );
        let immediate = state.session_activation.is_zero();
        let session = BastionSession {
            session_id: ResourceId::new(&id),
            bastion_id: request.bastion_id,
            target_host: request.target_host,
            target_port: request.target_port,
            public_key_fingerprint: request.public_key,
            created_at: now(),
            ttl: request.ttl,
            state: SessionState::Creating,
            ssh_host: String::new(),
            ssh_user: id.clone(),
        };
        state.sessions.insert(
            id,
            SessionSlot {
                session: session.clone(),
                created: if immediate {
                    Instant::now() - Duration::from_secs(1)
                } else {
                    Instant::now()
                },
            },
        );
        Ok(session)
    }

    async fn get_session(
        &self,
        _region: &str,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<BastionSession> {
        self.enter("get_session", cancel)?;
        let mut state = self.state.lock().unwrap();
        let ssh_host = state.ssh_host.clone();
        let activation = state.session_activation;
        let slot = state
            .sessions
            .get_mut(id.as_str())
            .ok_or_else(|| CloudError::NotFound(format!("session {id}")))?;
        if slot.session.state == SessionState::Creating && slot.created.elapsed() >= activation {
            slot.session.state = SessionState::Active;
            slot.session.ssh_host = ssh_host;
        }
        Ok(slot.session.clone())
    }

    async fn delete_session(
        &self,
        _region: &str,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.enter("delete_session", cancel)?;
        self.state.lock().unwrap().sessions.remove(id.as_str());
        Ok(())
    }

    async fn refresh_credentials(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.refresh_supported {
            state.credential_refreshes += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
