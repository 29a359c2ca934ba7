//! Declarative configuration of the watched resource set.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One watched resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceEntry {
    pub group: String,
    pub version: String,
    /// Plural resource name on the API server (e.g. `httproutes`).
    pub resource: String,
    pub kind: String,
    pub enabled: bool,
    /// Specific namespaces to watch. Empty or absent means all namespaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

impl ResourceEntry {
    /// `group/version` as the server expects it in `apiVersion`.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// The full watched set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchConfig {
    /// Default namespace hint applied to entries that name no namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub resources: Vec<ResourceEntry>,
}

impl WatchConfig {
    /// Load from a JSON file. The caller decides whether a failure is fatal
    /// or falls back to [`WatchConfig::default_set`].
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: WatchConfig = serde_json::from_slice(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Entries with `enabled: true`, in file order.
    pub fn enabled(&self) -> Vec<&ResourceEntry> {
        self.resources.iter().filter(|r| r.enabled).collect()
    }

    /// Namespace scopes to watch for an entry. `None` means all namespaces.
    ///
    /// The entry's own `namespaces` list wins when non-empty; otherwise the
    /// top-level namespace hint applies as a single scope; otherwise the
    /// entry is watched cluster-wide.
    pub fn scopes(&self, entry: &ResourceEntry) -> Vec<Option<String>> {
        if !entry.namespaces.is_empty() {
            return entry.namespaces.iter().cloned().map(Some).collect();
        }
        match &self.namespace {
            Some(ns) if !ns.is_empty() => vec![Some(ns.clone())],
            _ => vec![None],
        }
    }

    /// Compiled-in fallback covering the gateway and routing CRDs the
    /// production deployment tracks. Used when the config file cannot be
    /// loaded.
    pub fn default_set() -> Self {
        fn entry(group: &str, version: &str, resource: &str, kind: &str) -> ResourceEntry {
            ResourceEntry {
                group: group.to_string(),
                version: version.to_string(),
                resource: resource.to_string(),
                kind: kind.to_string(),
                enabled: true,
                namespaces: Vec::new(),
            }
        }
        Self {
            namespace: Some("default".to_string()),
            resources: vec![
                entry("gateway.networking.k8s.io", "v1", "gateways", "Gateway"),
                entry("gateway.networking.k8s.io", "v1", "httproutes", "HTTPRoute"),
                entry("gateway.envoyproxy.io", "v1alpha1", "envoyproxies", "EnvoyProxy"),
                entry(
                    "gateway.envoyproxy.io",
                    "v1alpha1",
                    "backendtrafficpolicies",
                    "BackendTrafficPolicy",
                ),
                entry("gateway.envoyproxy.io", "v1alpha1", "securitypolicies", "SecurityPolicy"),
                entry(
                    "gateway.envoyproxy.io",
                    "v1alpha1",
                    "clienttrafficpolicies",
                    "ClientTrafficPolicy",
                ),
            ],
        }
    }
}
