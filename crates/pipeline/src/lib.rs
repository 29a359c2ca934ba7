//! Event pipeline: the single consumer of every watch source.
//!
//! Producers push normalized events into a bounded queue; one worker drains
//! it FIFO, filters status-only churn, deduplicates by generation against the
//! last-seen cache and then the store, commits accepted snapshots, and fans
//! out to side-effect handlers. The worker is the sole owner of the cache and
//! the sole writer to the store.

#![forbid(unsafe_code)]

use genlog_core::{generation, EventType, ResourceEvent};
use genlog_store::HistoryStore;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default bound on the input queue. A full queue blocks producers, which
/// flow-controls the upstream watch transports.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Side-effect consumer invoked synchronously per processed event, with the
/// previously accepted snapshot for the identity when one is cached.
pub type ChangeHandler = Box<dyn Fn(&ResourceEvent, Option<&Value>) + Send + Sync>;

/// Pipeline under construction. Handlers register here; `start` consumes the
/// builder, so registration after the worker is running is unrepresentable.
pub struct Pipeline {
    capacity: usize,
    handlers: Vec<ChangeHandler>,
}

impl Pipeline {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, handlers: Vec::new() }
    }

    pub fn register_handler<H>(&mut self, handler: H)
    where
        H: Fn(&ResourceEvent, Option<&Value>) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Spawn the worker. The returned sender is the pipeline input; the
    /// worker exits once every sender is dropped and the queue is drained.
    pub fn start(self, store: Arc<dyn HistoryStore>) -> (mpsc::Sender<ResourceEvent>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ResourceEvent>(self.capacity);
        let handlers = self.handlers;
        let handle = tokio::spawn(async move {
            let mut last_seen: FxHashMap<String, Value> = FxHashMap::default();
            info!("event pipeline started");
            while let Some(event) = rx.recv().await {
                counter!("pipeline_events_total", 1u64);
                process_event(store.as_ref(), &mut last_seen, &handlers, event).await;
            }
            info!("event queue closed; pipeline stopped");
        });
        (tx, handle)
    }
}

/// One pass of the filter/dedup/commit/fan-out sequence.
async fn process_event(
    store: &dyn HistoryStore,
    last_seen: &mut FxHashMap<String, Value>,
    handlers: &[ChangeHandler],
    event: ResourceEvent,
) {
    let key = event.identity.store_key();

    // Relevance: accept ADDED unconditionally; otherwise require an audit
    // entry declaring the metadata or spec sub-tree. Status-only churn from
    // controllers stops here.
    let relevant = event.event_type == EventType::Added
        || event.audit.iter().any(|e| e.declares_metadata_or_spec());
    if !relevant {
        counter!("pipeline_irrelevant_total", 1u64);
        debug!(identity = %event.identity, "dropping status-only event");
        return;
    }

    // Deletions are never recorded and never evict history; handlers still
    // observe them.
    if event.event_type == EventType::Deleted {
        invoke_handlers(handlers, &event, last_seen.get(&key));
        return;
    }

    // Dedup, cheap check first: the cache survives within a process run,
    // the store scan survives restarts that lose the cache.
    let new_gen = generation(&event.snapshot);
    if let Some(prev) = last_seen.get(&key) {
        if generation(prev) == new_gen {
            counter!("pipeline_dedup_cache_total", 1u64);
            debug!(identity = %event.identity, generation = new_gen, "duplicate generation (cache)");
            return;
        }
    }
    let log = match store.list(&event.identity).await {
        Ok(log) => log,
        Err(e) => {
            counter!("pipeline_store_errors_total", 1u64);
            warn!(identity = %event.identity, error = %e, "store read failed; discarding event");
            return;
        }
    };
    if log.iter().any(|stored| generation(stored) == new_gen) {
        counter!("pipeline_dedup_store_total", 1u64);
        debug!(identity = %event.identity, generation = new_gen, "duplicate generation (store)");
        return;
    }

    // Commit. On failure the event is discarded and the cache left alone so
    // a later observation of the same generation retries against the store.
    if let Err(e) = store.append(&event.identity, &event.snapshot).await {
        counter!("pipeline_store_errors_total", 1u64);
        warn!(identity = %event.identity, error = %e, "store append failed; discarding event");
        return;
    }
    counter!("pipeline_committed_total", 1u64);
    info!(
        identity = %event.identity,
        generation = new_gen,
        event = ?event.event_type,
        "recorded new version"
    );

    invoke_handlers(handlers, &event, last_seen.get(&key));

    last_seen.insert(key, event.snapshot.clone());
}

fn invoke_handlers(handlers: &[ChangeHandler], event: &ResourceEvent, previous: Option<&Value>) {
    for handler in handlers {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event, previous)));
        if outcome.is_err() {
            counter!("pipeline_handler_panics_total", 1u64);
            warn!(identity = %event.identity, "change handler panicked; continuing");
        }
    }
}
