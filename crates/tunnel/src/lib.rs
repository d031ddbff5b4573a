//! Porthole Tunnel Runtime
//!
//! The supervisor ties everything together: resolve the cluster, mint an
//! ephemeral key, open a bastion session, warm a transport pool, bind the
//! local listener, and keep the tunnel healthy until told to stop. Each
//! accepted connection runs as its own forwarder; sessions nearing expiry
//! are replaced with an atomic pool swap while in-flight forwarders drain.

mod error;
mod forwarder;
mod listener;
mod supervisor;

pub use error::{Result, TunnelError};
pub use forwarder::{serve, ForwardOutcome};
pub use listener::bind_local;
pub use supervisor::{TunnelHandle, TunnelOptions, TunnelSupervisor};
