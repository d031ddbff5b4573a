//! Porthole Audit Trail
//!
//! Every tunnel leaves a connect/disconnect/error record in day-rotated
//! JSON-lines files under the state directory. Appends funnel through a
//! single writer task so lines never interleave; the query side reads
//! whole-day files, skips anything malformed, and aggregates per-cluster
//! usage.

mod error;
mod event;
mod query;
mod sink;

pub use error::{AuditError, Result};
pub use event::{next_session_uid, AuditEvent, EventType, TunnelCoords};
pub use query::{query, summary, AuditQuery, ClusterUsage};
pub use sink::AuditSink;
