//! Porthole Cloud Capability
//!
//! The opaque [`CloudApi`] trait is the only door to the cloud control
//! plane: compartment enumeration, cluster and bastion lookup, and bastion
//! session issuance. The real implementation wraps the vendor SDK outside
//! this workspace; everything in-tree programs against the trait, and tests
//! run against [`MockCloud`].

mod api;
mod error;
pub mod mock;

pub use api::{BastionSummary, CloudApi, ClusterSummary, Compartment, CreateSessionRequest};
pub use error::{CloudError, Result};
pub use mock::MockCloud;
