//! Configuration sections for the tunnel runtime.
//!
//! Every "maybe set" knob from the wire formats is an explicit field with a
//! default applied at construction; components receive whole sections, never
//! loose nullable values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Tenancy-level context threaded explicitly into discovery.
///
/// Constructed once by the supervisor's caller; there is deliberately no
/// process-global registry behind this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigContext {
    pub tenancy_id: ResourceId,
    pub home_region: String,
}

/// Knobs for a single tunnel run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Local port to listen on; 0 asks the OS for an ephemeral port.
    #[serde(default)]
    pub local_port: u16,

    /// Bastion to use when the cluster's compartment hosts several.
    #[serde(default)]
    pub bastion_name: Option<String>,

    /// Requested session lifetime.
    #[serde(default = "default_session_ttl", with = "secs")]
    pub session_ttl: Duration,

    /// How long in-flight forwarders may drain during a refresh or stop.
    #[serde(default = "default_drain_deadline", with = "secs")]
    pub drain_deadline: Duration,

    /// Linger after the first half-close before forcing both sides shut.
    #[serde(default = "default_linger", with = "secs")]
    pub linger: Duration,
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(10_800)
}

fn default_drain_deadline() -> Duration {
    Duration::from_secs(30)
}

fn default_linger() -> Duration {
    Duration::from_secs(5)
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            bastion_name: None,
            session_ttl: default_session_ttl(),
            drain_deadline: default_drain_deadline(),
            linger: default_linger(),
        }
    }
}

/// SSH transport pool sizing and health knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard cap on open transports.
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Transports opened eagerly at init (clamped to `size`).
    #[serde(default = "default_warmup")]
    pub warmup: usize,

    /// Concurrent checkouts allowed per transport.
    #[serde(default = "default_max_uses")]
    pub max_uses_per_conn: usize,

    /// Health probe period; each tick is jittered.
    #[serde(default = "default_probe_interval", with = "secs")]
    pub probe_interval: Duration,

    /// Idle transports beyond this age are pruned down to `warmup`.
    #[serde(default = "default_max_idle", with = "secs")]
    pub max_idle: Duration,

    /// Warm-up must yield at least one usable transport within this window.
    #[serde(default = "default_init_deadline", with = "secs")]
    pub init_deadline: Duration,
}

fn default_pool_size() -> usize {
    4
}

fn default_warmup() -> usize {
    2
}

fn default_max_uses() -> usize {
    8
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_max_idle() -> Duration {
    Duration::from_secs(300)
}

fn default_init_deadline() -> Duration {
    Duration::from_secs(60)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            warmup: default_warmup(),
            max_uses_per_conn: default_max_uses(),
            probe_interval: default_probe_interval(),
            max_idle: default_max_idle(),
            init_deadline: default_init_deadline(),
        }
    }
}

/// Discovery cache and search budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Cache entry lifetime.
    #[serde(default = "default_cache_ttl", with = "secs")]
    pub cache_ttl: Duration,

    /// Overall budget for one `resolve` call.
    #[serde(default = "default_resolve_timeout", with = "secs")]
    pub resolve_timeout: Duration,

    /// Budget for each per-region search task.
    #[serde(default = "default_region_timeout", with = "secs")]
    pub region_timeout: Duration,

    /// Return a stale cache entry when live search fails transiently.
    #[serde(default)]
    pub use_stale_on_error: bool,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(86_400)
}

fn default_resolve_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_region_timeout() -> Duration {
    Duration::from_secs(15)
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            resolve_timeout: default_resolve_timeout(),
            region_timeout: default_region_timeout(),
            use_stale_on_error: false,
        }
    }
}

/// Session poll backoff: initial 2s, factor 2, cap 2min, jitter +/-30%,
/// at most 10 attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial", with = "secs")]
    pub initial: Duration,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_backoff_max", with = "secs")]
    pub max: Duration,

    /// Fractional jitter; 0.3 means +/-30%.
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,

    #[serde(default = "default_backoff_attempts")]
    pub max_attempts: u32,
}

fn default_backoff_initial() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(120)
}

fn default_backoff_jitter() -> f64 {
    0.3
}

fn default_backoff_attempts() -> u32 {
    10
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: default_backoff_initial(),
            multiplier: default_backoff_multiplier(),
            max: default_backoff_max(),
            jitter: default_backoff_jitter(),
            max_attempts: default_backoff_attempts(),
        }
    }
}

/// Outbound proxying for the SSH TCP connection itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `host:port` of a SOCKS5 proxy, when the workstation cannot reach the
    /// bastion front-end directly.
    #[serde(default)]
    pub socks5: Option<String>,
}

/// Durations persist as whole seconds in config files.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
