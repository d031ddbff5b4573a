use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// A cluster API endpoint reachable from inside the private network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Textual IP address (v4 or v6).
    pub ip: String,
    /// 1..=65535; zero is rejected at construction.
    pub port: u16,
    /// Label such as `private` or `public`.
    pub name: String,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            name: name.into(),
        }
    }

    /// `host:port` form used when opening forward channels.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn is_private(&self) -> bool {
        self.name.eq_ignore_ascii_case("private")
    }
}

/// A Kubernetes cluster as discovery sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ResourceId,
    pub human_name: String,
    pub region: String,
    pub compartment_id: ResourceId,
    /// Ordered; the first entry is the default.
    pub endpoints: Vec<Endpoint>,
}

impl Cluster {
    /// Endpoint lookup by label, falling back to the first endpoint on miss.
    pub fn endpoint_named(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .or_else(|| self.endpoints.first())
    }

    /// The endpoint a tunnel should target: prefer private, else whatever
    /// the cluster exposes first.
    pub fn preferred_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.is_private())
            .or_else(|| self.endpoints.first())
    }
}

/// Bastion flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BastionKind {
    Standard,
    Internal,
}

/// Bastion lifecycle as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BastionLifecycle {
    Creating,
    Active,
    Failed,
    Deleting,
    Deleted,
}

impl BastionLifecycle {
    /// Only ACTIVE bastions may host new sessions.
    pub fn can_host_sessions(&self) -> bool {
        matches!(self, BastionLifecycle::Active)
    }
}

/// A bastion host capable of issuing port-forwarding sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bastion {
    pub id: ResourceId,
    pub name: String,
    pub region: String,
    pub compartment_id: ResourceId,
    pub kind: BastionKind,
    pub lifecycle: BastionLifecycle,
    pub created_at: DateTime<Utc>,
}

/// Bastion session state machine.
///
/// `Creating -> Active -> Expired` is the happy path; any state may move to
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Creating,
    Active,
    Failed,
    Expired,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Expired)
    }
}

/// A time- and key-scoped authorization to port-forward through a bastion.
///
/// Invariant: `ssh_host` is non-empty iff `state == Active`. Sessions are
/// single-purpose; one target per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionSession {
    pub session_id: ResourceId,
    pub bastion_id: ResourceId,
    pub target_host: String,
    pub target_port: u16,
    pub public_key_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub ttl: std::time::Duration,
    pub state: SessionState,
    /// SSH front-end host; empty until the session reports ACTIVE.
    pub ssh_host: String,
    pub ssh_user: String,
}

impl BastionSession {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::from_std(self.ttl).unwrap_or_else(|_| Duration::seconds(0))
    }

    /// The margin before expiry at which a replacement should be prepared:
    /// `max(60s, 10% of ttl)`.
    pub fn refresh_margin(&self) -> std::time::Duration {
        std::cmp::max(std::time::Duration::from_secs(60), self.ttl / 10)
    }

    /// The instant at which the supervisor should begin interleaving a
    /// replacement session.
    pub fn refresh_at(&self) -> DateTime<Utc> {
        self.expires_at()
            - Duration::from_std(self.refresh_margin()).unwrap_or_else(|_| Duration::seconds(0))
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_at()
    }

    /// Checks the `ssh_host`/`state` coupling invariant.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            SessionState::Active => !self.ssh_host.is_empty(),
            _ => true,
        }
    }
}

/// Where a resolved tunnel will actually connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub cluster: Cluster,
    pub bastion: Bastion,
    pub endpoint: Endpoint,
    /// True when the entry came from a stale cache via the
    /// use-stale-on-error fallback.
    pub stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn session(ttl_secs: u64) -> BastionSession {
        BastionSession {
            session_id: ResourceId::new("ocid1.bastionsession.oc1.eu-frankfurt-1.s1"),
            bastion_id: ResourceId::new("ocid1.bastion.oc1.eu-frankfurt-1.b1"),
            target_host: "10.0.0.5".into(),
            target_port: 6443,
            public_key_fingerprint: "SHA256:abc".into(),
            created_at: Utc::now(),
            ttl: StdDuration::from_secs(ttl_secs),
            state: SessionState::Active,
            ssh_host: "host.bastion.eu-frankfurt-1.example.com".into(),
            ssh_user: "ocid1.bastionsession.oc1.eu-frankfurt-1.s1".into(),
        }
    }

    #[test]
    fn test_endpoint_authority() {
        let ep = Endpoint::new("10.0.0.5", 6443, "private");
        assert_eq!(ep.authority(), "10.0.0.5:6443");
        assert!(ep.is_private());
    }

    #[test]
    fn test_endpoint_lookup_falls_back_to_first() {
        let cluster = Cluster {
            id: ResourceId::new("ocid1.cluster.oc1.eu-frankfurt-1.c1"),
            human_name: "prod".into(),
            region: "eu-frankfurt-1".into(),
            compartment_id: ResourceId::new("ocid1.compartment.oc1..cmp"),
            endpoints: vec![
                Endpoint::new("10.0.0.5", 6443, "private"),
                Endpoint::new("203.0.113.9", 6443, "public"),
            ],
        };

        assert_eq!(cluster.endpoint_named("public").unwrap().ip, "203.0.113.9");
        assert_eq!(cluster.endpoint_named("missing").unwrap().ip, "10.0.0.5");
        assert_eq!(cluster.preferred_endpoint().unwrap().ip, "10.0.0.5");
    }

    #[test]
    fn test_preferred_endpoint_without_private() {
        let cluster = Cluster {
            id: ResourceId::new("ocid1.cluster.oc1.eu-frankfurt-1.c1"),
            human_name: "prod".into(),
            region: "eu-frankfurt-1".into(),
            compartment_id: ResourceId::new("ocid1.compartment.oc1..cmp"),
            endpoints: vec![Endpoint::new("203.0.113.9", 6443, "public")],
        };
        assert_eq!(cluster.preferred_endpoint().unwrap().name, "public");
    }

    #[test]
    fn test_bastion_lifecycle_hosting() {
        assert!(BastionLifecycle::Active.can_host_sessions());
        assert!(!BastionLifecycle::Creating.can_host_sessions());
        assert!(!BastionLifecycle::Deleted.can_host_sessions());
    }

    #[test]
    fn test_refresh_margin_floor() {
        // 10% of a 5-minute ttl is 30s; the 60s floor wins.
        let s = session(300);
        assert_eq!(s.refresh_margin(), StdDuration::from_secs(60));
    }

    #[test]
    fn test_refresh_margin_percentage() {
        // 10% of a 3-hour ttl beats the floor.
        let s = session(10_800);
        assert_eq!(s.refresh_margin(), StdDuration::from_secs(1_080));
    }

    #[test]
    fn test_needs_refresh_window() {
        let s = session(3600);
        assert!(!s.needs_refresh(s.created_at));
        assert!(s.needs_refresh(s.created_at + Duration::seconds(3541)));
        assert!(s.needs_refresh(s.expires_at()));
    }

    #[test]
    fn test_session_consistency() {
        let mut s = session(3600);
        assert!(s.is_consistent());

        s.ssh_host.clear();
        assert!(!s.is_consistent());

        s.state = SessionState::Creating;
        assert!(s.is_consistent());
    }

    #[test]
    fn test_session_state_terminal() {
        assert!(!SessionState::Creating.is_terminal());
        assert!(!SessionState::Active.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Expired.is_terminal());
    }
}
