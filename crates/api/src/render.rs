//! YAML rendering of stored snapshots.
//!
//! The only place the generic document tree is shaped for humans: the
//! cleaned document plus a two-line version header.

use genlog_core::{generation, version_timestamp};
use serde_json::{Map, Value};

/// Annotation too verbose to re-serve.
const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Reduce an observed document to its served form: `apiVersion`, `kind`,
/// `metadata` (without `managedFields` and without the last-applied
/// annotation), `spec`, and `status`, all otherwise verbatim.
pub fn clean_document(doc: &Value) -> Value {
    let mut cleaned = Map::new();
    for key in ["apiVersion", "kind"] {
        if let Some(v) = doc.get(key) {
            cleaned.insert(key.to_string(), v.clone());
        }
    }
    if let Some(metadata) = doc.get("metadata").and_then(Value::as_object) {
        let mut meta = metadata.clone();
        meta.remove("managedFields");
        if let Some(annotations) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
            annotations.remove(LAST_APPLIED);
            if annotations.is_empty() {
                meta.remove("annotations");
            }
        }
        cleaned.insert("metadata".to_string(), Value::Object(meta));
    }
    for key in ["spec", "status"] {
        if let Some(v) = doc.get(key) {
            cleaned.insert(key.to_string(), v.clone());
        }
    }
    Value::Object(cleaned)
}

/// Render a snapshot as YAML, prefixed with the version timestamp and
/// generation, separated from the body by a document marker.
pub fn render_snapshot(doc: &Value) -> Result<String, serde_yaml::Error> {
    let body = serde_yaml::to_string(&clean_document(doc))?;
    Ok(format!(
        "timestamp: {}\ngeneration: {}\n---\n{}",
        version_timestamp(doc),
        generation(doc),
        body
    ))
}
