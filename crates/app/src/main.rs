//! genlog supervisor: boots the store, loads the watched set, starts the
//! pipeline, the watch sources, and the read API, then blocks until
//! shutdown.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use genlog_config::{ResourceEntry, WatchConfig};
use genlog_core::EventType;
use genlog_pipeline::{Pipeline, DEFAULT_QUEUE_CAPACITY};
use genlog_store::{HistoryStore, RedisStore};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "genlog", version, about = "Records the spec-version history of watched Kubernetes resources")]
struct Cli {
    /// Path to the resources configuration file
    #[arg(long = "config", default_value = "resources.json")]
    config: String,

    /// Ordered-store backend address (host:port)
    #[arg(long = "redis", default_value = "localhost:6379")]
    redis: String,

    /// Maximum retained versions per resource
    #[arg(long = "max-changes", default_value_t = 100)]
    max_changes: usize,

    /// HTTP port for the read API
    #[arg(long = "port", default_value = "8080")]
    port: String,
}

fn init_tracing() {
    let env = std::env::var("GENLOG_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("GENLOG_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid GENLOG_METRICS_ADDR; expected host:port");
        }
    }
}

/// Production side-effect handlers. Registration happens strictly before the
/// worker starts.
fn register_handlers(pipeline: &mut Pipeline) {
    // Gateways changing shape is operationally interesting on its own.
    pipeline.register_handler(|event, _| {
        if event.identity.kind == "Gateway" && event.event_type == EventType::Modified {
            warn!(
                namespace = %event.identity.namespace,
                name = %event.identity.name,
                "gateway was modified"
            );
        }
    });

    // SecurityPolicy spec edits are worth a louder line than the generic log.
    pipeline.register_handler(|event, previous| {
        if event.identity.kind != "SecurityPolicy" {
            return;
        }
        let spec_changed = match previous {
            Some(prev) => prev.get("spec") != event.snapshot.get("spec"),
            None => event.snapshot.get("spec").is_some(),
        };
        if spec_changed {
            warn!(
                namespace = %event.identity.namespace,
                name = %event.identity.name,
                "security policy spec changed"
            );
        }
    });

    // Generic change log for every recorded modification.
    pipeline.register_handler(|event, _| {
        if event.event_type == EventType::Modified {
            info!(
                kind = %event.identity.kind,
                namespace = %event.identity.namespace,
                name = %event.identity.name,
                "change detected"
            );
        }
    });
}

async fn run(cli: Cli) -> Result<()> {
    // Store first: an unreachable backend is fatal.
    let store: Arc<dyn HistoryStore> = Arc::new(
        RedisStore::connect(&cli.redis, cli.max_changes)
            .await
            .with_context(|| format!("connecting to ordered store at {}", cli.redis))?,
    );

    let config = match WatchConfig::load_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config, "configuration loaded");
            cfg
        }
        Err(e) => {
            warn!(path = %cli.config, error = %e, "config load failed; using compiled-in default set");
            WatchConfig::default_set()
        }
    };
    let enabled: Vec<ResourceEntry> = config.enabled().into_iter().cloned().collect();
    if enabled.is_empty() {
        bail!("no resources enabled in configuration");
    }

    let mut pipeline = Pipeline::new(DEFAULT_QUEUE_CAPACITY);
    register_handlers(&mut pipeline);
    let (events_tx, _worker) = pipeline.start(store.clone());

    let client = kube::Client::try_default().await.context("building kubernetes client")?;
    for entry in enabled {
        for scope in config.scopes(&entry) {
            let client = client.clone();
            let events = events_tx.clone();
            let entry = entry.clone();
            info!(kind = %entry.kind, resource = %entry.resource, ns = ?scope, "starting watch source");
            tokio::spawn(async move {
                let kind = entry.kind.clone();
                if let Err(e) = genlog_watch::run_watch_source(client, entry, scope, events).await {
                    // Dead until process restart; the other sources continue.
                    error!(kind = %kind, error = ?e, "watch source terminated");
                }
            });
        }
    }
    drop(events_tx);

    let app = genlog_api::router(store.clone()).layer(TraceLayer::new_for_http());
    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding read api to {addr}"))?;
    info!(addr = %addr, "read api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("read api server")?;

    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    run(Cli::parse()).await
}
