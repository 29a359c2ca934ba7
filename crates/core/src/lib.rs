//! genlog core types: resource identity, normalized watch events, and the
//! generic-tree accessors the pipeline and read API share.
//!
//! Observed objects are opaque `serde_json::Value` trees end to end; nothing
//! here depends on a typed Kubernetes schema.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Watch event type, spelled the way the watch wire spells it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    #[serde(rename = "ADDED")]
    Added,
    #[serde(rename = "MODIFIED")]
    Modified,
    #[serde(rename = "DELETED")]
    Deleted,
}

/// Process-wide unique key for one watched resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ResourceIdentity {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { kind: kind.into(), name: name.into(), namespace: namespace.into() }
    }

    /// Store list key, `kind/name/namespace`.
    pub fn store_key(&self) -> String {
        format!("{}/{}/{}", self.kind, self.name, self.namespace)
    }

    /// Inverse of [`store_key`](Self::store_key).
    pub fn from_store_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, '/');
        let kind = parts.next()?;
        let name = parts.next()?;
        let namespace = parts.next()?;
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(kind, name, namespace))
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.name, self.namespace)
    }
}

/// One server-side-apply audit record from `metadata.managedFields`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditEntry {
    /// Last write time recorded by the field manager (RFC 3339).
    pub time: Option<String>,
    /// `fieldsV1` document naming the sub-trees this manager owns.
    pub fields: Option<Value>,
}

impl AuditEntry {
    /// True when the entry's field document declares ownership of the
    /// `metadata` or `spec` sub-tree. The check is structural on top-level
    /// keys only: a nested mention of `f:spec` deeper in the document does
    /// not count.
    pub fn declares_metadata_or_spec(&self) -> bool {
        let Some(obj) = self.fields.as_ref().and_then(Value::as_object) else {
            return false;
        };
        obj.keys().any(|k| k == "f:metadata" || k == "f:spec")
    }
}

/// Normalized event flowing from a watch source into the pipeline.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub event_type: EventType,
    pub identity: ResourceIdentity,
    /// Full observed document.
    pub snapshot: Value,
    pub observed_at: DateTime<Utc>,
    pub audit: Vec<AuditEntry>,
}

impl ResourceEvent {
    /// Build an event from an observed document, extracting its audit entries.
    pub fn new(event_type: EventType, identity: ResourceIdentity, snapshot: Value) -> Self {
        let audit = audit_entries(&snapshot);
        Self { event_type, identity, snapshot, observed_at: Utc::now(), audit }
    }
}

/// Parse `metadata.managedFields` into audit entries, preserving order.
pub fn audit_entries(doc: &Value) -> Vec<AuditEntry> {
    let Some(entries) = doc
        .pointer("/metadata/managedFields")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    entries
        .iter()
        .map(|e| AuditEntry {
            time: e.get("time").and_then(Value::as_str).map(str::to_string),
            fields: e.get("fieldsV1").cloned(),
        })
        .collect()
}

/// `metadata.generation`, or 0 when absent or malformed.
pub fn generation(doc: &Value) -> i64 {
    doc.pointer("/metadata/generation")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// `metadata.creationTimestamp` when present and non-empty.
pub fn creation_timestamp(doc: &Value) -> Option<&str> {
    doc.pointer("/metadata/creationTimestamp")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// `time` of the newest audit entry (managedFields is ordered; newest last).
pub fn newest_audit_time(doc: &Value) -> Option<String> {
    doc.pointer("/metadata/managedFields")
        .and_then(Value::as_array)
        .and_then(|entries| entries.last())
        .and_then(|e| e.get("time"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Timestamp attributed to the document's current generation: the newest
/// audit write time once the spec has been revised at least once, the
/// creation timestamp for the first generation, `"unknown"` when the
/// document carries neither.
pub fn version_timestamp(doc: &Value) -> String {
    let fallback = || creation_timestamp(doc).map(str::to_string);
    let ts = if generation(doc) > 1 {
        newest_audit_time(doc).or_else(fallback)
    } else {
        fallback()
    };
    ts.unwrap_or_else(|| "unknown".to_string())
}

/// `metadata.name`, empty when absent.
pub fn object_name(doc: &Value) -> &str {
    doc.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("")
}

/// `metadata.namespace`, empty for cluster-scoped objects.
pub fn object_namespace(doc: &Value) -> &str {
    doc.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or("")
}
