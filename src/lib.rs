//! # Specularium — a live model of your network
//!
//! Specularium maintains a queryable graph of a network — hosts,
//! interfaces, links — by reconciling three independent sources:
//!
//! - **Operator assertions ("truth")** - declared facts that always win
//! - **Imported inventories** - YAML topologies, Ansible inventories
//! - **Active discovery** - subnet scans, periodic re-verification,
//!   passive client registration
//!
//! The reconciliation core merges concurrent, partially-overlapping and
//! sometimes contradictory observations into a single graph while
//! preserving operator-declared facts, recording discrepancies between
//! declared and discovered values, and streaming incremental change
//! events to connected UI clients.
//!
//! ## Quick Start
//!
//! ```ignore
//! use specularium::{App, AppConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     specularium::init_logging();
//!     let app = App::start(AppConfig::default()).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(
//!         listener,
//!         app.router()
//!             .into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Adapters** (`adapters`, `registry`) - discovery sources on a
//!    cadence, one worker task each
//! 2. **Reconcile** (`reconcile`) - per-node diff against persisted state,
//!    writing only deltas
//! 3. **Truth** (`truth`) - assertions and the discrepancy lifecycle
//! 4. **Store** (`store`) - durable graph state behind the
//!    [`repository::Repository`] seam
//! 5. **Events** (`events`, `sse`) - bus fan-out to per-client bounded
//!    queues; slow clients drop frames, never block publishers
//!
//! ## Thread Safety
//!
//! Every service is `Send + Sync` and shared via `Arc`; the store accepts
//! concurrent writers and keeps its invariants under the write lock.

pub mod adapters;
pub mod app;
pub mod codec;
pub mod error;
pub mod events;
pub mod graph;
pub mod http;
pub mod reconcile;
pub mod registry;
pub mod repository;
pub mod scanner;
pub mod sse;
pub mod store;
pub mod truth;
pub mod types;
pub mod values;

// Public API exports
pub use app::{parse_listen_addr, App, AppConfig};
pub use error::{SpecularError, SpecularResult};
pub use events::{Event, EventBus, EventType};
pub use graph::{ClientInfo, GraphService};
pub use reconcile::Reconciler;
pub use registry::{AdapterRegistry, AdapterState, AdapterStatus, SyncAllReport};
pub use repository::{
    DiscrepancyFilter, EdgeFilter, EdgeUpdate, ImportStats, NodeFilter, NodeUpdate, Repository,
};
pub use scanner::ScannerService;
pub use sse::SseHub;
pub use store::GraphStore;
pub use truth::{TruthService, TRUTHABLE_KEYS};
pub use types::{
    Discrepancy, Edge, EdgeType, GraphExport, GraphFragment, HostnameCandidate,
    HostnameInference, ImportStrategy, Node, NodePosition, NodeStatus, NodeTruth, NodeType,
    PropertyMap, Resolution, TruthStatus,
};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{json, Value as JsonValue};

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// This should be called once at application startup. The log level is
/// controlled via the `SPECULARIUM_LOG` environment variable:
///
/// - `SPECULARIUM_LOG=error` - Only errors
/// - `SPECULARIUM_LOG=warn` - Errors and warnings
/// - `SPECULARIUM_LOG=info` - General information (default)
/// - `SPECULARIUM_LOG=debug` - Debug information, including dropped
///   events and skipped nodes
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env("SPECULARIUM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
