//! Watch sources: one per configured resource kind and namespace scope.
//!
//! Each source primes the pipeline with a bounded list of existing objects,
//! then streams raw watch events. Everything is normalized into
//! [`ResourceEvent`]s before it leaves this crate; the rest of the system
//! never sees the transport.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::StreamExt;
use genlog_config::ResourceEntry;
use genlog_core::{object_name, object_namespace, EventType, ResourceEvent, ResourceIdentity};
use kube::api::{Api, DynamicObject, ListParams, WatchParams};
use kube::core::{ApiResource, WatchEvent};
use kube::Client;
use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn api_for(client: &Client, entry: &ResourceEntry, scope: Option<&str>) -> Api<DynamicObject> {
    let ar = ApiResource {
        group: entry.group.clone(),
        version: entry.version.clone(),
        api_version: entry.api_version(),
        kind: entry.kind.clone(),
        plural: entry.resource.clone(),
    };
    match scope {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
        None => Api::all_with(client.clone(), &ar),
    }
}

/// List responses omit per-item type metadata; stamp it back so stored
/// snapshots round-trip as complete documents.
fn ensure_type_meta(doc: &mut Value, entry: &ResourceEntry) {
    let Some(obj) = doc.as_object_mut() else { return };
    let missing = |v: Option<&Value>| !matches!(v, Some(Value::String(s)) if !s.is_empty());
    if missing(obj.get("apiVersion")) {
        obj.insert("apiVersion".to_string(), Value::String(entry.api_version()));
    }
    if missing(obj.get("kind")) {
        obj.insert("kind".to_string(), Value::String(entry.kind.clone()));
    }
}

/// Normalize one observed object. `None` when the object cannot be
/// serialized or carries no name; the stream continues either way.
fn normalize(entry: &ResourceEntry, event_type: EventType, obj: &DynamicObject) -> Option<ResourceEvent> {
    let mut doc = match serde_json::to_value(obj) {
        Ok(v) => v,
        Err(e) => {
            counter!("watch_decode_errors_total", 1u64);
            warn!(kind = %entry.kind, error = %e, "skipping unserializable object");
            return None;
        }
    };
    ensure_type_meta(&mut doc, entry);
    let name = object_name(&doc);
    if name.is_empty() {
        counter!("watch_decode_errors_total", 1u64);
        warn!(kind = %entry.kind, "skipping object without a name");
        return None;
    }
    let identity = ResourceIdentity::new(entry.kind.clone(), name, object_namespace(&doc));
    Some(ResourceEvent::new(event_type, identity, doc))
}

/// Prime the pipeline with the current contents of the scope. Returns the
/// resource version to resume the watch from.
async fn prime(
    api: &Api<DynamicObject>,
    entry: &ResourceEntry,
    events: &mpsc::Sender<ResourceEvent>,
) -> Result<String> {
    let page_limit = env_u64("GENLOG_PAGE_LIMIT", 500) as u32;
    let mut resume = String::from("0");
    let mut continue_token: Option<String> = None;
    let mut seen = 0usize;
    loop {
        let mut params = ListParams::default();
        if page_limit > 0 {
            params = params.limit(page_limit);
        }
        if let Some(token) = &continue_token {
            params = params.continue_token(token);
        }
        let list = api.list(&params).await.context("listing existing objects")?;
        if let Some(rv) = &list.metadata.resource_version {
            resume = rv.clone();
        }
        continue_token = list.metadata.continue_.clone();
        for obj in &list.items {
            if let Some(event) = normalize(entry, EventType::Added, obj) {
                if events.send(event).await.is_err() {
                    return Ok(resume);
                }
                seen += 1;
            }
        }
        counter!("snapshot_pages_total", 1u64);
        if continue_token.is_none() {
            break;
        }
        tokio::task::yield_now().await;
    }
    info!(kind = %entry.kind, count = seen, "primed existing objects");
    Ok(resume)
}

/// Run one watch source until its queue closes or a watch open fails.
///
/// The initial list feeds ADDED events; the stream then mirrors source event
/// types one to one. A stream that terminates after a successful open is
/// re-opened with bounded exponential backoff; a failed open is reported
/// once and ends the source.
pub async fn run_watch_source(
    client: Client,
    entry: ResourceEntry,
    scope: Option<String>,
    events: mpsc::Sender<ResourceEvent>,
) -> Result<()> {
    let api = api_for(&client, &entry, scope.as_deref());
    info!(kind = %entry.kind, resource = %entry.resource, ns = ?scope, "watch source starting");

    let mut resume = match prime(&api, &entry, &events).await {
        Ok(rv) => rv,
        Err(e) => {
            // Priming is best-effort: the watch itself still observes the
            // scope from the beginning of history.
            warn!(kind = %entry.kind, ns = ?scope, error = %e, "initial list failed");
            String::from("0")
        }
    };

    let backoff_max = env_u64("GENLOG_WATCH_BACKOFF_MAX_SECS", 30);
    let mut backoff: u64 = 1;
    loop {
        let params = WatchParams::default();
        let stream = api
            .watch(&params, &resume)
            .await
            .with_context(|| format!("opening watch for {}", entry.kind))?;
        futures::pin_mut!(stream);
        debug!(kind = %entry.kind, ns = ?scope, resume = %resume, "watch stream opened");

        while let Some(item) = stream.next().await {
            let (event_type, obj) = match item {
                Ok(WatchEvent::Added(o)) => (EventType::Added, o),
                Ok(WatchEvent::Modified(o)) => (EventType::Modified, o),
                Ok(WatchEvent::Deleted(o)) => (EventType::Deleted, o),
                Ok(WatchEvent::Bookmark(b)) => {
                    resume = b.metadata.resource_version.clone();
                    continue;
                }
                Ok(WatchEvent::Error(status)) => {
                    counter!("watch_errors_total", 1u64);
                    warn!(kind = %entry.kind, code = status.code, reason = %status.reason, "watch error event");
                    if status.code == 410 {
                        // Expired resource version: restart from scratch.
                        resume = String::from("0");
                    }
                    break;
                }
                Err(e) => {
                    // One undecodable item must not end the stream.
                    counter!("watch_decode_errors_total", 1u64);
                    warn!(kind = %entry.kind, error = %e, "skipping undecodable watch item");
                    continue;
                }
            };
            if let Some(rv) = &obj.metadata.resource_version {
                resume = rv.clone();
            }
            if let Some(event) = normalize(&entry, event_type, &obj) {
                counter!("watch_events_total", 1u64);
                if events.send(event).await.is_err() {
                    info!(kind = %entry.kind, "event queue closed; stopping watch source");
                    return Ok(());
                }
            }
        }

        counter!("watch_restarts_total", 1u64);
        warn!(kind = %entry.kind, ns = ?scope, backoff_secs = backoff, "watch stream ended; restarting");
        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(backoff_max).max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> ResourceEntry {
        ResourceEntry {
            group: "gateway.networking.k8s.io".to_string(),
            version: "v1".to_string(),
            resource: "httproutes".to_string(),
            kind: "HTTPRoute".to_string(),
            enabled: true,
            namespaces: Vec::new(),
        }
    }

    fn dynamic_obj(name: &str, ns: Option<&str>) -> DynamicObject {
        let ar = ApiResource {
            group: "gateway.networking.k8s.io".to_string(),
            version: "v1".to_string(),
            api_version: "gateway.networking.k8s.io/v1".to_string(),
            kind: "HTTPRoute".to_string(),
            plural: "httproutes".to_string(),
        };
        let mut obj = DynamicObject::new(name, &ar);
        obj.metadata.namespace = ns.map(str::to_string);
        obj.data = json!({"spec": {"rules": []}});
        obj
    }

    #[test]
    fn normalize_builds_identity_from_configured_kind() {
        let ev = normalize(&entry(), EventType::Added, &dynamic_obj("r", Some("default"))).unwrap();
        assert_eq!(ev.identity, ResourceIdentity::new("HTTPRoute", "r", "default"));
        assert_eq!(ev.event_type, EventType::Added);
        assert_eq!(ev.snapshot.pointer("/spec/rules"), Some(&json!([])));
    }

    #[test]
    fn normalize_stamps_missing_type_meta() {
        let ev = normalize(&entry(), EventType::Modified, &dynamic_obj("r", Some("default"))).unwrap();
        assert_eq!(
            ev.snapshot.get("apiVersion").and_then(Value::as_str),
            Some("gateway.networking.k8s.io/v1")
        );
        assert_eq!(ev.snapshot.get("kind").and_then(Value::as_str), Some("HTTPRoute"));
    }

    #[test]
    fn cluster_scoped_objects_get_empty_namespace() {
        let ev = normalize(&entry(), EventType::Added, &dynamic_obj("r", None)).unwrap();
        assert_eq!(ev.identity.namespace, "");
        assert_eq!(ev.identity.store_key(), "HTTPRoute/r/");
    }

    #[test]
    fn ensure_type_meta_preserves_existing_values() {
        let mut doc = json!({"apiVersion": "other/v2", "kind": "Thing", "metadata": {"name": "x"}});
        ensure_type_meta(&mut doc, &entry());
        assert_eq!(doc["apiVersion"], "other/v2");
        assert_eq!(doc["kind"], "Thing");
    }
}
