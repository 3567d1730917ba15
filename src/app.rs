/// Application assembly.
///
/// Wires the store, services, adapter registry, and SSE hub into one
/// process: the singletons are created here at startup and torn down
/// explicitly on shutdown. The binary and the integration tests both go
/// through this module, so the wiring is exercised the same way
/// everywhere.
use crate::adapters::{AdapterConfig, BootstrapAdapter, TcpProbeScanner, VerifierAdapter, Adapter};
use crate::error::{SpecularError, SpecularResult};
use crate::events::{Event, EventBus};
use crate::graph::GraphService;
use crate::http::{create_router, AppState};
use crate::reconcile::Reconciler;
use crate::registry::AdapterRegistry;
use crate::repository::Repository;
use crate::scanner::ScannerService;
use crate::sse::SseHub;
use crate::store::GraphStore;
use crate::truth::TruthService;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Startup configuration, normally produced from the CLI flags.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Database file path; `None` keeps the graph in memory (tests).
    pub db_path: Option<PathBuf>,
    /// Verifier cadence.
    pub poll_interval: Duration,
    /// Whether the bootstrap self-discovery seeds the graph at startup.
    pub bootstrap: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: Some(PathBuf::from("./specularium.db")),
            poll_interval: Duration::from_secs(30),
            bootstrap: true,
        }
    }
}

/// The assembled application.
pub struct App {
    state: AppState,
    registry: Arc<AdapterRegistry>,
    shutdown: CancellationToken,
}

impl App {
    /// Build and start the application: open the store, wire the
    /// services, seed the graph, and start the adapter workers.
    pub async fn start(config: AppConfig) -> SpecularResult<Self> {
        let repo: Arc<GraphStore> = match &config.db_path {
            Some(path) => Arc::new(GraphStore::open(path).await?),
            None => Arc::new(GraphStore::in_memory()),
        };
        let repo: Arc<dyn Repository> = repo;

        let bus = Arc::new(EventBus::new());
        let shutdown = CancellationToken::new();
        let hub = SseHub::spawn(Arc::clone(&bus), &shutdown);

        let truth = Arc::new(TruthService::new(Arc::clone(&repo), Arc::clone(&bus)));
        let graph = Arc::new(GraphService::new(Arc::clone(&repo), Arc::clone(&bus)));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&repo),
            Arc::clone(&truth),
            Arc::clone(&bus),
        ));
        let scanner = Arc::new(ScannerService::new(
            Some(Arc::new(TcpProbeScanner::new())),
            Arc::clone(&repo),
            Arc::clone(&bus),
        ));

        let registry = Arc::new(AdapterRegistry::new(reconciler, Arc::clone(&bus)));
        registry.register(
            Arc::new(VerifierAdapter::new(Arc::clone(&repo))),
            AdapterConfig::default()
                .with_priority(10)
                .with_poll_interval(config.poll_interval),
        )?;

        if config.bootstrap {
            seed_graph(&scanner, &bus).await;
        }

        registry.start(&shutdown).await?;

        let state = AppState {
            graph,
            truth,
            registry: Arc::clone(&registry),
            scanner,
            hub,
            shutdown: shutdown.clone(),
        };
        Ok(Self {
            state,
            registry,
            shutdown,
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the adapter workers and cancel every task. Idempotent.
    pub async fn stop(&self) {
        self.registry.stop().await;
        self.shutdown.cancel();
    }
}

/// Run the bootstrap adapter once and upsert its seed fragment.
///
/// Bootstrap goes through the scanner-style upsert path because, unlike
/// the verifier, it is allowed to create nodes.
async fn seed_graph(scanner: &ScannerService, bus: &EventBus) {
    let bootstrap = BootstrapAdapter::new();
    match bootstrap.sync(&CancellationToken::new()).await {
        Ok(fragment) if !fragment.is_empty() => match scanner.ingest(&fragment).await {
            Ok(stats) => {
                tracing::info!(
                    created = stats.created,
                    updated = stats.updated,
                    "bootstrap seeded the graph"
                );
                bus.publish(Event::graph_updated(json!({
                    "source": "bootstrap",
                    "nodes_discovered": fragment.nodes.len(),
                })));
            }
            Err(err) => tracing::warn!(error = %err, "bootstrap seed failed"),
        },
        Ok(_) => tracing::debug!("bootstrap produced an empty fragment"),
        Err(err) => tracing::warn!(error = %err, "bootstrap discovery failed"),
    }
}

/// Parse a listen address, accepting the `:3000` shorthand for all
/// interfaces.
pub fn parse_listen_addr(text: &str) -> SpecularResult<SocketAddr> {
    let normalized = if text.starts_with(':') {
        format!("0.0.0.0{}", text)
    } else {
        text.to_string()
    };
    normalized
        .parse()
        .map_err(|_| SpecularError::validation(format!("'{}' is not a listen address", text)))
}
