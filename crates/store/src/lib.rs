//! Version-log store: the write/read boundary against the ordered-store
//! backend. Keep code tiny and predictable.
//!
//! Per identity the backend holds a list of serialized snapshots, newest
//! first, capped at a fixed length; a set indexes every identity that has at
//! least one snapshot.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use genlog_core::ResourceIdentity;
use metrics::{counter, histogram};
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Redis set holding every identity key with a non-empty version log.
const INDEX_KEY: &str = "genlog:resources";

/// Deadline applied to every backend round-trip.
const OP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("store operation timed out after {0:?}")]
    Deadline(Duration),
    #[error("snapshot serialization: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read/write surface over the per-identity version logs.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Prepend a snapshot to the identity's log, trim the log to the cap,
    /// and register the identity in the index. Atomic per identity.
    async fn append(&self, identity: &ResourceIdentity, snapshot: &Value) -> StoreResult<()>;

    /// The identity's log, newest first. Empty when unknown.
    async fn list(&self, identity: &ResourceIdentity) -> StoreResult<Vec<Value>>;

    /// Every identity with a non-empty log.
    async fn identities(&self) -> StoreResult<Vec<ResourceIdentity>>;

    /// Release transport resources.
    async fn close(&self);
}

async fn with_deadline<T, F>(op: &'static str, fut: F) -> StoreResult<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(OP_DEADLINE, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => {
            counter!("store_errors_total", 1u64, "op" => op);
            Err(StoreError::Backend(e.to_string()))
        }
        Err(_) => {
            counter!("store_errors_total", 1u64, "op" => op);
            Err(StoreError::Deadline(OP_DEADLINE))
        }
    }
}

/// Redis-backed store. One list per identity key (`kind/name/namespace`),
/// head-pushed and trimmed to `max_versions` inside a MULTI block.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    max_versions: usize,
}

impl RedisStore {
    /// Connect and ping. Callers treat a failure here as fatal.
    pub async fn connect(addr: &str, max_versions: usize) -> StoreResult<Self> {
        let url = format!("redis://{}/", addr);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut conn = with_deadline("connect", redis::aio::ConnectionManager::new(client)).await?;
        let _: String = with_deadline("ping", redis::cmd("PING").query_async(&mut conn)).await?;
        debug!(addr, max_versions, "connected to redis");
        Ok(Self { conn, max_versions })
    }
}

#[async_trait]
impl HistoryStore for RedisStore {
    async fn append(&self, identity: &ResourceIdentity, snapshot: &Value) -> StoreResult<()> {
        let started = Instant::now();
        let key = identity.store_key();
        let payload = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(&key, payload)
            .ltrim(&key, 0, self.max_versions as isize - 1)
            .sadd(INDEX_KEY, &key);
        let _: () = with_deadline("append", pipe.query_async(&mut conn)).await?;
        histogram!("store_append_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_appends_total", 1u64);
        Ok(())
    }

    async fn list(&self, identity: &ResourceIdentity) -> StoreResult<Vec<Value>> {
        let started = Instant::now();
        let key = identity.store_key();
        let mut conn = self.conn.clone();
        let raw: Vec<String> = with_deadline(
            "list",
            redis::cmd("LRANGE").arg(&key).arg(0).arg(-1).query_async(&mut conn),
        )
        .await?;
        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<Value>(&item) {
                Ok(v) => out.push(v),
                // A corrupt entry must not hide the rest of the log.
                Err(e) => warn!(key = %key, error = %e, "skipping malformed stored snapshot"),
            }
        }
        histogram!("store_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    async fn identities(&self) -> StoreResult<Vec<ResourceIdentity>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = with_deadline(
            "identities",
            redis::cmd("SMEMBERS").arg(INDEX_KEY).query_async(&mut conn),
        )
        .await?;
        let mut out: Vec<ResourceIdentity> =
            keys.iter().filter_map(|k| ResourceIdentity::from_store_key(k)).collect();
        out.sort_by(|a, b| a.store_key().cmp(&b.store_key()));
        Ok(out)
    }

    async fn close(&self) {
        // The multiplexed connection closes when the last clone drops.
        debug!("redis store closed");
    }
}

/// In-memory store with the same trim and ordering semantics. Used by tests
/// across the workspace.
pub struct MemoryStore {
    logs: std::sync::Mutex<std::collections::HashMap<String, Vec<Value>>>,
    max_versions: usize,
}

impl MemoryStore {
    pub fn new(max_versions: usize) -> Self {
        Self { logs: std::sync::Mutex::new(Default::default()), max_versions }
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, identity: &ResourceIdentity, snapshot: &Value) -> StoreResult<()> {
        let mut logs = self.logs.lock().unwrap();
        let log = logs.entry(identity.store_key()).or_default();
        log.insert(0, snapshot.clone());
        log.truncate(self.max_versions);
        Ok(())
    }

    async fn list(&self, identity: &ResourceIdentity) -> StoreResult<Vec<Value>> {
        let logs = self.logs.lock().unwrap();
        Ok(logs.get(&identity.store_key()).cloned().unwrap_or_default())
    }

    async fn identities(&self) -> StoreResult<Vec<ResourceIdentity>> {
        let logs = self.logs.lock().unwrap();
        let mut out: Vec<ResourceIdentity> =
            logs.keys().filter_map(|k| ResourceIdentity::from_store_key(k)).collect();
        out.sort_by(|a, b| a.store_key().cmp(&b.store_key()));
        Ok(out)
    }

    async fn close(&self) {}
}
