use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Connect,
    Disconnect,
    Error,
}

impl EventType {
    /// Terminators end the record that a `connect` opened.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Disconnect | EventType::Error)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Connect => f.write_str("connect"),
            EventType::Disconnect => f.write_str("disconnect"),
            EventType::Error => f.write_str("error"),
        }
    }
}

/// One audit line. Field names and presence rules are part of the on-disk
/// contract: `region`/`bastion_id` are omitted when empty, `duration_ns`
/// appears only on terminators, `error` only on error events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,
    pub session_uid: String,
    pub event_type: EventType,
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bastion_id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared coordinates for all three event constructors.
#[derive(Debug, Clone)]
pub struct TunnelCoords {
    pub session_uid: String,
    pub cluster_name: String,
    pub region: String,
    pub bastion_id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl AuditEvent {
    pub fn connect(coords: &TunnelCoords) -> Self {
        Self::base(coords, EventType::Connect)
    }

    pub fn disconnect(coords: &TunnelCoords, duration_ns: u64) -> Self {
        let mut event = Self::base(coords, EventType::Disconnect);
        event.duration_ns = Some(duration_ns);
        event
    }

    pub fn error(coords: &TunnelCoords, duration_ns: u64, message: impl Into<String>) -> Self {
        let mut event = Self::base(coords, EventType::Error);
        event.duration_ns = Some(duration_ns);
        event.error = Some(message.into());
        event
    }

    fn base(coords: &TunnelCoords, event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            session_uid: coords.session_uid.clone(),
            event_type,
            cluster_name: coords.cluster_name.clone(),
            region: coords.region.clone(),
            bastion_id: coords.bastion_id.clone(),
            local_port: coords.local_port,
            remote_host: coords.remote_host.clone(),
            remote_port: coords.remote_port,
            duration_ns: None,
            error: None,
        }
    }

    /// UTC day bucket this event belongs to, as `YYYY-MM-DD`.
    pub fn day(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }
}

/// Monotonic-per-process, globally unique session correlator. The random
/// prefix keeps uids from different invocations apart; the counter orders
/// them within one process.
pub fn next_session_uid() -> String {
    static PREFIX: OnceLock<String> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    let prefix = PREFIX.get_or_init(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        id[..8].to_string()
    });
    format!("{prefix}-{:06}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// RFC3339 with fixed nanosecond precision, e.g.
/// `2026-08-01T09:30:00.123456789Z`.
mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(uid: &str) -> TunnelCoords {
        TunnelCoords {
            session_uid: uid.to_string(),
            cluster_name: "prod".into(),
            region: "eu-frankfurt-1".into(),
            bastion_id: "ocid1.bastion.oc1.eu-frankfurt-1.b1".into(),
            local_port: 6443,
            remote_host: "10.0.0.5".into(),
            remote_port: 6443,
        }
    }

    #[test]
    fn test_json_field_names() {
        let event = AuditEvent::connect(&coords("u-1"));
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        let obj = value.as_object().unwrap();

        for key in [
            "timestamp",
            "session_uid",
            "event_type",
            "cluster_name",
            "region",
            "bastion_id",
            "local_port",
            "remote_host",
            "remote_port",
        ] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
        assert_eq!(obj["event_type"], "connect");
        // Non-terminal events carry no duration or error.
        assert!(!obj.contains_key("duration_ns"));
        assert!(!obj.contains_key("error"));
    }

    #[test]
    fn test_empty_optionals_omitted() {
        let mut c = coords("u-1");
        c.region = String::new();
        c.bastion_id = String::new();
        let value = serde_json::to_value(AuditEvent::connect(&c)).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("region"));
        assert!(!obj.contains_key("bastion_id"));
    }

    #[test]
    fn test_terminal_fields() {
        let disconnect = AuditEvent::disconnect(&coords("u-1"), 1_500_000_000);
        let value = serde_json::to_value(&disconnect).unwrap();
        assert_eq!(value["event_type"], "disconnect");
        assert_eq!(value["duration_ns"], 1_500_000_000u64);
        assert!(value.get("error").is_none());

        let error = AuditEvent::error(&coords("u-1"), 42, "dial failed");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["event_type"], "error");
        assert_eq!(value["error"], "dial failed");
        assert_eq!(value["duration_ns"], 42);
    }

    #[test]
    fn test_timestamp_nanosecond_format() {
        let event = AuditEvent::connect(&coords("u-1"));
        let value = serde_json::to_value(&event).unwrap();
        let raw = value["timestamp"].as_str().unwrap();
        // 9 fractional digits, Z suffix.
        let frac = raw.split('.').nth(1).unwrap();
        assert_eq!(frac.len(), 10, "expected 9 digits + Z in {raw}");
        assert!(raw.ends_with('Z'));
    }

    #[test]
    fn test_line_round_trip() {
        let original = AuditEvent::error(&coords("u-7"), 987_654_321, "poll cap reached");
        let line = serde_json::to_string(&original).unwrap();
        let parsed: AuditEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_session_uids_monotonic_and_unique() {
        let a = next_session_uid();
        let b = next_session_uid();
        let c = next_session_uid();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a < b && b < c, "uids must sort in issue order: {a} {b} {c}");
    }

    #[test]
    fn test_day_bucket() {
        let mut event = AuditEvent::connect(&coords("u-1"));
        event.timestamp = DateTime::parse_from_rfc3339("2026-03-31T23:59:59.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(event.day(), "2026-03-31");
    }
}
