//! Porthole Discovery
//!
//! Turns a human cluster name into a concrete `(cluster, bastion, endpoint)`
//! triple. Results are remembered in a TTL-bound JSON cache under the state
//! directory so the expensive multi-region sweep only happens on cold
//! lookups; fresh entries short-circuit to cheap by-ID gets.

mod cache;
mod error;
mod resolver;

pub use cache::{CacheEntry, CachedEndpoint, DiscoveryCache};
pub use error::{ResolveError, Result};
pub use resolver::{Discoverer, ResolveHints};
