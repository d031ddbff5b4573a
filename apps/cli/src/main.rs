//! Porthole CLI
//!
//! Query-side commands over the local state directory: audit history,
//! per-cluster usage, discovery cache inspection. Tunnel startup itself is
//! driven by the embedding front-end through `porthole-tunnel`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use porthole_audit::{query, summary, AuditQuery, EventType};
use porthole_discovery::DiscoveryCache;
use porthole_keystore::{audit_dir, cache_dir};
use porthole_settings::Settings;

/// Porthole - authenticated tunnels to private Kubernetes API servers
#[derive(Parser)]
#[command(name = "porthole")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show audit events, oldest first
    Audit {
        /// Filter by cluster name
        #[arg(long)]
        name: Option<String>,

        /// Filter by event type (connect, disconnect, error)
        #[arg(long)]
        kind: Option<String>,

        /// Filter by session uid
        #[arg(long)]
        session_uid: Option<String>,

        /// Only events at or after this RFC3339 timestamp
        #[arg(long)]
        since: Option<String>,

        /// Maximum events to print
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Per-cluster usage summary
    Summary {
        /// Only events at or after this RFC3339 timestamp
        #[arg(long)]
        since: Option<String>,
    },

    /// Show the discovery cache
    Cache {
        /// Remove one entry (or pass 'all' to wipe the cache)
        #[arg(long)]
        clear: Option<String>,
    },
}

fn parse_kind(raw: &str) -> Result<EventType> {
    match raw.to_ascii_lowercase().as_str() {
        "connect" => Ok(EventType::Connect),
        "disconnect" => Ok(EventType::Disconnect),
        "error" => Ok(EventType::Error),
        other => bail!("unknown event type '{other}' (expected connect, disconnect or error)"),
    }
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid RFC3339 timestamp '{raw}'"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    porthole_logging::init(cli.verbose);

    match cli.command {
        Commands::Audit {
            name,
            kind,
            session_uid,
            since,
            limit,
        } => {
            let filter = AuditQuery {
                name,
                kind: kind.as_deref().map(parse_kind).transpose()?,
                since: since.as_deref().map(parse_since).transpose()?,
                session_uid,
                limit: Some(limit),
            };
            let dir = audit_dir().context("resolving audit directory")?;
            for event in query(&dir, &filter)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }

        Commands::Summary { since } => {
            let since = since.as_deref().map(parse_since).transpose()?;
            let dir = audit_dir().context("resolving audit directory")?;
            let rows = summary(&dir, since)?;
            if rows.is_empty() {
                println!("no audit history");
                return Ok(());
            }
            for row in rows {
                println!(
                    "{:<24} connections={:<5} errors={:<4} active={:<3} total={:?} last={}",
                    row.cluster_name,
                    row.total_connections,
                    row.errors,
                    row.active,
                    row.total_duration,
                    row.last_access.to_rfc3339(),
                );
            }
        }

        Commands::Cache { clear } => {
            let settings = Settings::load_or_default()?;
            let path = cache_dir().context("resolving cache directory")?.join("discovery.json");
            let cache = DiscoveryCache::new(path, settings.discovery.cache_ttl);

            match clear.as_deref() {
                Some("all") => {
                    for entry in cache.entries() {
                        cache.invalidate(&entry.name)?;
                    }
                    println!("cache cleared");
                }
                Some(name) => {
                    cache.invalidate(name)?;
                    println!("removed '{name}'");
                }
                None => {
                    let entries = cache.entries();
                    if entries.is_empty() {
                        println!("cache is empty");
                        return Ok(());
                    }
                    let now = Utc::now();
                    for entry in entries {
                        let status = if entry.is_fresh(cache.ttl(), now) {
                            "fresh"
                        } else {
                            "stale"
                        };
                        println!(
                            "{:<24} {:<8} {} ({}) cached {}",
                            entry.name,
                            status,
                            entry.cluster_id,
                            entry.region,
                            entry.cached_at.to_rfc3339(),
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
