use serde::{Deserialize, Serialize};

/// Opaque cloud resource identifier.
///
/// IDs are dotted strings shaped like `ocid1.<kind>.<realm>.<region>.<unique>`.
/// Porthole parses them only to extract the region (and the kind, for
/// sanity checks); any other shape is carried around untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resource kind — the second dotted segment (`cluster`, `bastion`, ...).
    /// `None` for IDs that do not follow the dotted shape.
    pub fn kind(&self) -> Option<&str> {
        let seg = self.0.split('.').nth(1)?;
        if seg.is_empty() {
            None
        } else {
            Some(seg)
        }
    }

    /// Region encoded in the ID — the fourth dotted segment. `None` when the
    /// ID has an unknown shape or the segment is empty (some realm-global
    /// IDs leave it blank).
    pub fn region(&self) -> Option<&str> {
        let seg = self.0.split('.').nth(3)?;
        if seg.is_empty() {
            None
        } else {
            Some(seg)
        }
    }

    /// Short suffix for logs, keeping output grep-able without the noise of
    /// a full ID.
    pub fn short(&self) -> &str {
        let unique = self.0.rsplit('.').next().unwrap_or(&self.0);
        let end = unique.len().min(12);
        &unique[..end]
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}
