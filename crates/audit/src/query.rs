//! Read side of the audit trail.
//!
//! Whole-day files are parsed line by line; malformed lines are skipped so
//! a torn write can never block history. Files are visited in name order,
//! which is chronological by construction.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{AuditEvent, EventType, Result};

/// Default result cap when the caller does not set one.
const DEFAULT_LIMIT: usize = 1000;

/// Filters for [`query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub name: Option<String>,
    pub kind: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub session_uid: Option<String>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(name) = &self.name {
            if !event.cluster_name.eq_ignore_ascii_case(name) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.event_type != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(uid) = &self.session_uid {
            if &event.session_uid != uid {
                return false;
            }
        }
        true
    }
}

/// Per-cluster usage aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterUsage {
    pub cluster_name: String,
    /// CONNECT events seen.
    pub total_connections: usize,
    /// Sum of terminator durations (paired CONNECT/DISCONNECT or ERROR).
    pub total_duration: Duration,
    /// ERROR terminators.
    pub errors: usize,
    pub last_access: DateTime<Utc>,
    /// CONNECTs within the last 24 hours that never terminated — tunnels
    /// still up, or cut down by a crash.
    pub active: usize,
}

/// Read matching events across all day files, oldest first, up to the
/// query's limit.
pub fn query(dir: &Path, filter: &AuditQuery) -> Result<Vec<AuditEvent>> {
    let limit = filter.limit.unwrap_or(DEFAULT_LIMIT);
    let mut events = Vec::new();

    for path in day_files(dir)? {
        if events.len() >= limit {
            break;
        }
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(_) => continue,
        };
        for line in BufReader::new(file).lines() {
            if events.len() >= limit {
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) => {
                    if filter.matches(&event) {
                        events.push(event);
                    }
                }
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping malformed audit line");
                }
            }
        }
    }

    Ok(events)
}

/// Aggregate per-cluster usage over the whole trail (optionally bounded by
/// `since`).
pub fn summary(dir: &Path, since: Option<DateTime<Utc>>) -> Result<Vec<ClusterUsage>> {
    let events = query(
        dir,
        &AuditQuery {
            since,
            limit: Some(usize::MAX),
            ..Default::default()
        },
    )?;

    struct OpenTunnel {
        cluster: String,
        connected_at: DateTime<Utc>,
    }

    let mut usage: BTreeMap<String, ClusterUsage> = BTreeMap::new();
    let mut open: BTreeMap<String, OpenTunnel> = BTreeMap::new();

    for event in &events {
        let entry = usage
            .entry(event.cluster_name.clone())
            .or_insert_with(|| ClusterUsage {
                cluster_name: event.cluster_name.clone(),
                total_connections: 0,
                total_duration: Duration::ZERO,
                errors: 0,
                last_access: event.timestamp,
                active: 0,
            });
        entry.last_access = entry.last_access.max(event.timestamp);

        match event.event_type {
            EventType::Connect => {
                entry.total_connections += 1;
                open.insert(
                    event.session_uid.clone(),
                    OpenTunnel {
                        cluster: event.cluster_name.clone(),
                        connected_at: event.timestamp,
                    },
                );
            }
            EventType::Disconnect | EventType::Error => {
                if event.event_type == EventType::Error {
                    entry.errors += 1;
                }
                if let Some(started) = open.remove(&event.session_uid) {
                    // Prefer the recorded duration; fall back to timestamp
                    // arithmetic for older writers.
                    let nanos = event.duration_ns.unwrap_or_else(|| {
                        (event.timestamp - started.connected_at)
                            .num_nanoseconds()
                            .unwrap_or(0)
                            .max(0) as u64
                    });
                    let cluster_entry = usage
                        .get_mut(&started.cluster)
                        .expect("cluster seen at connect");
                    cluster_entry.total_duration += Duration::from_nanos(nanos);
                }
            }
        }
    }

    // Unterminated CONNECTs within the last day count as live tunnels.
    let active_floor = Utc::now() - chrono::Duration::hours(24);
    for tunnel in open.values() {
        if tunnel.connected_at >= active_floor {
            if let Some(entry) = usage.get_mut(&tunnel.cluster) {
                entry.active += 1;
            }
        }
    }

    Ok(usage.into_values().collect())
}

fn day_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(files),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("audit-") && name.ends_with(".jsonl") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TunnelCoords;
    use crate::AuditSink;

    fn coords(uid: &str, cluster: &str) -> TunnelCoords {
        TunnelCoords {
            session_uid: uid.to_string(),
            cluster_name: cluster.to_string(),
            region: "eu-frankfurt-1".into(),
            bastion_id: "b1".into(),
            local_port: 6443,
            remote_host: "10.0.0.5".into(),
            remote_port: 6443,
        }
    }

    fn at(mut event: AuditEvent, rfc3339: &str) -> AuditEvent {
        event.timestamp = DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc);
        event
    }

    async fn write_events(dir: &Path, events: Vec<AuditEvent>) {
        let (sink, task) = AuditSink::spawn(dir);
        for event in events {
            sink.emit(event).unwrap();
        }
        sink.flush().await.unwrap();
        drop(sink);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_events(
            dir.path(),
            vec![
                at(AuditEvent::connect(&coords("u-1", "prod")), "2026-08-01T08:00:00Z"),
                at(
                    AuditEvent::disconnect(&coords("u-1", "prod"), 60_000_000_000),
                    "2026-08-01T09:00:00Z",
                ),
                at(AuditEvent::connect(&coords("u-2", "staging")), "2026-08-01T10:00:00Z"),
            ],
        )
        .await;

        let all = query(dir.path(), &AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 3);

        let prod = query(
            dir.path(),
            &AuditQuery {
                name: Some("prod".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(prod.len(), 2);

        let connects = query(
            dir.path(),
            &AuditQuery {
                kind: Some(EventType::Connect),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(connects.len(), 2);

        let late = query(
            dir.path(),
            &AuditQuery {
                since: Some(
                    DateTime::parse_from_rfc3339("2026-08-01T09:30:00Z")
                        .unwrap()
                        .with_timezone(&Utc),
                ),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].session_uid, "u-2");

        let by_uid = query(
            dir.path(),
            &AuditQuery {
                session_uid: Some("u-1".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(by_uid.len(), 2);
    }

    #[tokio::test]
    async fn test_limit_applies_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write_events(
            dir.path(),
            vec![
                at(AuditEvent::connect(&coords("u-1", "prod")), "2026-07-31T08:00:00Z"),
                at(AuditEvent::connect(&coords("u-2", "prod")), "2026-08-01T08:00:00Z"),
                at(AuditEvent::connect(&coords("u-3", "prod")), "2026-08-01T09:00:00Z"),
            ],
        )
        .await;

        let limited = query(
            dir.path(),
            &AuditQuery {
                limit: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(limited.len(), 2);
        // Oldest first: the July event leads.
        assert_eq!(limited[0].session_uid, "u-1");
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_events(
            dir.path(),
            vec![at(
                AuditEvent::connect(&coords("u-1", "prod")),
                "2026-08-01T08:00:00Z",
            )],
        )
        .await;

        // Corrupt the file with garbage between valid lines.
        let path = dir.path().join("audit-2026-08-01.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{torn line\n");
        let valid = serde_json::to_string(&at(
            AuditEvent::connect(&coords("u-2", "prod")),
            "2026-08-01T09:00:00Z",
        ))
        .unwrap();
        content.push_str(&valid);
        content.push('\n');
        std::fs::write(&path, content).unwrap();

        let events = query(dir.path(), &AuditQuery::default()).unwrap();
        assert_eq!(events.len(), 2, "iteration must continue past bad lines");
    }

    #[tokio::test]
    async fn test_summary_pairs_and_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        write_events(
            dir.path(),
            vec![
                at(AuditEvent::connect(&coords("u-1", "prod")), "2026-08-01T08:00:00Z"),
                at(
                    AuditEvent::disconnect(&coords("u-1", "prod"), 3_600_000_000_000),
                    "2026-08-01T09:00:00Z",
                ),
                at(AuditEvent::connect(&coords("u-2", "prod")), "2026-08-01T10:00:00Z"),
                at(
                    AuditEvent::error(&coords("u-2", "prod"), 60_000_000_000, "pool died"),
                    "2026-08-01T10:01:00Z",
                ),
                at(AuditEvent::connect(&coords("u-3", "staging")), "2026-08-01T11:00:00Z"),
                at(
                    AuditEvent::disconnect(&coords("u-3", "staging"), 1_000_000_000),
                    "2026-08-01T11:00:01Z",
                ),
            ],
        )
        .await;

        let rows = summary(dir.path(), None).unwrap();
        assert_eq!(rows.len(), 2);

        let prod = rows.iter().find(|r| r.cluster_name == "prod").unwrap();
        assert_eq!(prod.total_connections, 2);
        assert_eq!(prod.errors, 1);
        assert_eq!(
            prod.total_duration,
            Duration::from_secs(3600) + Duration::from_secs(60)
        );
        assert_eq!(prod.active, 0);

        let staging = rows.iter().find(|r| r.cluster_name == "staging").unwrap();
        assert_eq!(staging.total_connections, 1);
        assert_eq!(staging.errors, 0);
    }

    #[tokio::test]
    async fn test_crash_without_disconnect_counts_active() {
        let dir = tempfile::tempdir().unwrap();
        // A CONNECT from "just now" with no terminator, as left behind by a
        // killed process.
        let recent = Utc::now() - chrono::Duration::minutes(5);
        let mut event = AuditEvent::connect(&coords("u-crash", "prod"));
        event.timestamp = recent;
        write_events(dir.path(), vec![event]).await;

        let rows = summary(dir.path(), None).unwrap();
        let prod = rows.iter().find(|r| r.cluster_name == "prod").unwrap();
        assert_eq!(prod.total_connections, 1);
        assert_eq!(prod.active, 1);

        // The pairing query shows the dangling CONNECT.
        let events = query(
            dir.path(),
            &AuditQuery {
                session_uid: Some("u-crash".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Connect);
    }

    #[tokio::test]
    async fn test_ancient_dangling_connect_not_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut event = AuditEvent::connect(&coords("u-old", "prod"));
        event.timestamp = Utc::now() - chrono::Duration::days(3);
        write_events(dir.path(), vec![event]).await;

        let rows = summary(dir.path(), None).unwrap();
        let prod = rows.iter().find(|r| r.cluster_name == "prod").unwrap();
        assert_eq!(prod.active, 0);
    }
}
