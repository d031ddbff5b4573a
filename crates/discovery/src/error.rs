use porthole_core::{Classify, ErrorKind, ResourceId};
use porthole_cloud::{CloudError, ClusterSummary};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("No cluster named '{0}' found in any searched region")]
    NotFound(String),

    #[error("Cluster name '{name}' is ambiguous: {}", candidate_list(.candidates))]
    Ambiguous {
        name: String,
        candidates: Vec<ClusterSummary>,
    },

    #[error("Multiple bastions in compartment {compartment}; set an explicit bastion name: {}", id_list(.candidates))]
    AmbiguousBastion {
        compartment: ResourceId,
        candidates: Vec<ResourceId>,
    },

    #[error("No bastion named '{name}' in compartment {compartment}")]
    BastionNotFound {
        name: String,
        compartment: ResourceId,
    },

    #[error("No bastion available in compartment {compartment}")]
    NoBastion { compartment: ResourceId },

    #[error("Cluster {cluster} exposes no endpoints")]
    NoEndpoint { cluster: ResourceId },

    #[error("Discovery timed out")]
    Timeout,

    #[error("Cache I/O failed: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

fn candidate_list(candidates: &[ClusterSummary]) -> String {
    candidates
        .iter()
        .map(|c| format!("{} ({}/{})", c.id, c.region, c.compartment_id.short()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn id_list(candidates: &[ResourceId]) -> String {
    candidates
        .iter()
        .map(ResourceId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Classify for ResolveError {
    fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::NotFound(_)
            | ResolveError::NoBastion { .. }
            | ResolveError::BastionNotFound { .. }
            | ResolveError::NoEndpoint { .. } => ErrorKind::Resource,
            ResolveError::Ambiguous { .. } | ResolveError::AmbiguousBastion { .. } => {
                ErrorKind::Configuration
            }
            ResolveError::Timeout => ErrorKind::Transient,
            ResolveError::CacheIo(_) => ErrorKind::Internal,
            ResolveError::Cloud(err) => err.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ResolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_message_lists_candidates() {
        let err = ResolveError::Ambiguous {
            name: "staging".into(),
            candidates: vec![
                ClusterSummary {
                    id: ResourceId::new("ocid1.cluster.oc1.eu-frankfurt-1.aaa"),
                    name: "staging".into(),
                    region: "eu-frankfurt-1".into(),
                    compartment_id: ResourceId::new("ocid1.compartment.oc1..team-a"),
                },
                ClusterSummary {
                    id: ResourceId::new("ocid1.cluster.oc1.us-ashburn-1.bbb"),
                    name: "staging".into(),
                    region: "us-ashburn-1".into(),
                    compartment_id: ResourceId::new("ocid1.compartment.oc1..team-b"),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("eu-frankfurt-1"));
        assert!(msg.contains("us-ashburn-1"));
        assert!(msg.contains("ocid1.cluster.oc1.eu-frankfurt-1.aaa"));
    }

    #[test]
    fn test_kinds_drive_retry() {
        assert!(!ResolveError::NotFound("prod".into()).is_retryable());
        assert!(ResolveError::Timeout.is_retryable());
        assert!(ResolveError::Cloud(CloudError::Transient("blip".into())).is_retryable());
        assert!(!ResolveError::Cloud(CloudError::Unauthorized("403".into())).is_retryable());
    }
}
