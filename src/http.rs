/// HTTP API for Specularium.
///
/// This module provides the RESTful surface over the graph, truth, and
/// discovery services, plus the `/events` SSE stream. Handlers stay thin:
/// they parse, call a service, and map [`SpecularError`] onto a status
/// code with an `{error, details}` JSON body.
///
/// # API Endpoints
///
/// ## Graph
/// - `GET /api/graph` - Full graph (nodes, edges, positions)
/// - `DELETE /api/graph` - Clear the graph
/// - `POST /api/discover` - Trigger all adapters (202)
///
/// ## Nodes / Edges / Positions
/// - `GET|POST /api/nodes`, `GET|PUT|DELETE /api/nodes/:id`
/// - `GET|POST /api/edges`, `GET|PUT|DELETE /api/edges/:id`
/// - `GET|POST /api/positions`, `PUT /api/positions/:node_id`
///
/// ## Import / Export
/// - `POST /api/import/:format?strategy=merge|replace`
/// - `GET /api/export/:format` (attachment)
///
/// ## Truth & Discrepancies
/// - `GET|PUT|DELETE /api/nodes/:id/truth`
/// - `GET /api/nodes/:id/discrepancies`
/// - `GET /api/discrepancies`, `GET /api/discrepancies/:id`
/// - `POST /api/discrepancies/:id/resolve`
///
/// ## Discovery & Live events
/// - `GET /api/adapters` - Registry status
/// - `POST /api/scan` - Sweep a subnet
/// - `POST /api/clients/register` - Passive client registration
/// - `GET /events` - SSE stream
use crate::error::{SpecularError, SpecularResult};
use crate::graph::{ClientInfo, GraphService};
use crate::registry::AdapterRegistry;
use crate::repository::{DiscrepancyFilter, EdgeFilter, EdgeUpdate, NodeFilter, NodeUpdate};
use crate::scanner::ScannerService;
use crate::sse::SseHub;
use crate::truth::TruthService;
use crate::types::{Edge, ImportStrategy, Node, NodePosition, PropertyMap, Resolution};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Everything the handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub graph: Arc<GraphService>,
    pub truth: Arc<TruthService>,
    pub registry: Arc<AdapterRegistry>,
    pub scanner: Arc<ScannerService>,
    pub hub: Arc<SseHub>,
    pub shutdown: CancellationToken,
}

impl IntoResponse for SpecularError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            SpecularError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            SpecularError::Validation { .. } => (StatusCode::BAD_REQUEST, "validation"),
            SpecularError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            SpecularError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
            SpecularError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            SpecularError::Storage(_) | SpecularError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        let body = Json(json!({ "error": kind, "details": self.to_string() }));
        (status, body).into_response()
    }
}

/// Build the router with all routes and the fixed middleware stack.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Graph
        .route("/api/graph", get(handle_get_graph).delete(handle_clear_graph))
        .route("/api/discover", post(handle_discover))
        // Nodes
        .route("/api/nodes", get(handle_list_nodes).post(handle_create_node))
        .route(
            "/api/nodes/:id",
            get(handle_get_node)
                .put(handle_update_node)
                .delete(handle_delete_node),
        )
        // Truth & discrepancies per node
        .route(
            "/api/nodes/:id/truth",
            get(handle_get_truth)
                .put(handle_set_truth)
                .delete(handle_clear_truth),
        )
        .route("/api/nodes/:id/discrepancies", get(handle_node_discrepancies))
        .route("/api/nodes/:id/merge", post(handle_merge_nodes))
        // Edges
        .route("/api/edges", get(handle_list_edges).post(handle_create_edge))
        .route(
            "/api/edges/:id",
            get(handle_get_edge)
                .put(handle_update_edge)
                .delete(handle_delete_edge),
        )
        // Positions
        .route(
            "/api/positions",
            get(handle_list_positions).post(handle_set_positions),
        )
        .route("/api/positions/:node_id", put(handle_set_position))
        // Import / export
        .route("/api/import/:format", post(handle_import))
        .route("/api/export/:format", get(handle_export))
        // Discrepancies
        .route("/api/discrepancies", get(handle_list_discrepancies))
        .route("/api/discrepancies/:id", get(handle_get_discrepancy))
        .route("/api/discrepancies/:id/resolve", post(handle_resolve_discrepancy))
        // Discovery
        .route("/api/adapters", get(handle_list_adapters))
        .route("/api/scan", post(handle_scan))
        // Clients & live events
        .route("/api/clients/register", post(handle_register_client))
        .route("/events", get(handle_events))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}

// Graph

async fn handle_get_graph(
    State(state): State<AppState>,
) -> SpecularResult<Json<crate::types::GraphExport>> {
    Ok(Json(state.graph.graph().await?))
}

async fn handle_clear_graph(State(state): State<AppState>) -> SpecularResult<StatusCode> {
    state.graph.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_discover(State(state): State<AppState>) -> impl IntoResponse {
    let registry = Arc::clone(&state.registry);
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        let report = registry.trigger_sync_all(&cancel).await;
        tracing::info!(
            synced = report.synced,
            changed = report.changed,
            errors = report.errors.len(),
            "manual discovery finished"
        );
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "discovery_triggered" })),
    )
}

// Nodes

async fn handle_list_nodes(
    State(state): State<AppState>,
    Query(filter): Query<NodeFilter>,
) -> SpecularResult<Json<Vec<Node>>> {
    Ok(Json(state.graph.list_nodes(&filter).await?))
}

async fn handle_create_node(
    State(state): State<AppState>,
    Json(node): Json<Node>,
) -> SpecularResult<(StatusCode, Json<Node>)> {
    let node = state.graph.create_node(node).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn handle_get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SpecularResult<Json<Node>> {
    Ok(Json(state.graph.get_node(&id).await?))
}

async fn handle_update_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<NodeUpdate>,
) -> SpecularResult<Json<Node>> {
    Ok(Json(state.graph.update_node(&id, update).await?))
}

async fn handle_delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SpecularResult<StatusCode> {
    state.graph.delete_node(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Truth

#[derive(Debug, Deserialize)]
struct TruthRequest {
    properties: PropertyMap,
    #[serde(default)]
    asserted_by: Option<String>,
}

async fn handle_get_truth(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SpecularResult<Json<crate::types::NodeTruth>> {
    let node = state.graph.get_node(&id).await?;
    node.truth.map(Json).ok_or(SpecularError::NotFound {
        kind: "truth",
        id,
    })
}

async fn handle_set_truth(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TruthRequest>,
) -> SpecularResult<Json<Node>> {
    let operator = request.asserted_by.as_deref().unwrap_or("operator");
    let node = state
        .truth
        .set_truth(&id, request.properties, operator)
        .await?;
    Ok(Json(node))
}

async fn handle_clear_truth(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SpecularResult<Json<Node>> {
    Ok(Json(state.truth.clear_truth(&id).await?))
}

async fn handle_node_discrepancies(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SpecularResult<Json<Vec<crate::types::Discrepancy>>> {
    // 404 for unknown nodes rather than an empty list.
    state.graph.get_node(&id).await?;
    let filter = DiscrepancyFilter {
        node_id: Some(id),
        unresolved_only: false,
    };
    Ok(Json(state.truth.list_discrepancies(&filter).await?))
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    source_id: String,
}

async fn handle_merge_nodes(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<MergeRequest>,
) -> SpecularResult<Json<Node>> {
    Ok(Json(
        state.graph.merge_nodes(&id, &request.source_id).await?,
    ))
}

// Edges

async fn handle_list_edges(
    State(state): State<AppState>,
    Query(filter): Query<EdgeFilter>,
) -> SpecularResult<Json<Vec<Edge>>> {
    Ok(Json(state.graph.list_edges(&filter).await?))
}

async fn handle_create_edge(
    State(state): State<AppState>,
    Json(edge): Json<Edge>,
) -> SpecularResult<(StatusCode, Json<Edge>)> {
    let edge = state.graph.create_edge(edge).await?;
    Ok((StatusCode::CREATED, Json(edge)))
}

async fn handle_get_edge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SpecularResult<Json<Edge>> {
    Ok(Json(state.graph.get_edge(&id).await?))
}

async fn handle_update_edge(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<EdgeUpdate>,
) -> SpecularResult<Json<Edge>> {
    Ok(Json(state.graph.update_edge(&id, update).await?))
}

async fn handle_delete_edge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SpecularResult<StatusCode> {
    state.graph.delete_edge(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Positions

#[derive(Debug, Deserialize)]
struct PositionBody {
    x: f64,
    y: f64,
    #[serde(default)]
    pinned: bool,
}

async fn handle_list_positions(
    State(state): State<AppState>,
) -> SpecularResult<Json<Vec<NodePosition>>> {
    Ok(Json(state.graph.list_positions().await?))
}

async fn handle_set_positions(
    State(state): State<AppState>,
    Json(positions): Json<Vec<NodePosition>>,
) -> SpecularResult<Json<Vec<NodePosition>>> {
    Ok(Json(state.graph.set_positions(positions).await?))
}

async fn handle_set_position(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(body): Json<PositionBody>,
) -> SpecularResult<Json<NodePosition>> {
    let position = NodePosition {
        node_id,
        x: body.x,
        y: body.y,
        pinned: body.pinned,
    };
    Ok(Json(state.graph.set_position(position).await?))
}

// Import / export

#[derive(Debug, Deserialize)]
struct ImportQuery {
    #[serde(default)]
    strategy: Option<ImportStrategy>,
}

async fn handle_import(
    State(state): State<AppState>,
    Path(format): Path<String>,
    Query(query): Query<ImportQuery>,
    body: String,
) -> SpecularResult<Json<crate::repository::ImportStats>> {
    let strategy = query.strategy.unwrap_or_default();
    Ok(Json(state.graph.import(&format, &body, strategy).await?))
}

async fn handle_export(
    State(state): State<AppState>,
    Path(format): Path<String>,
) -> SpecularResult<Response> {
    let doc = state.graph.export(&format).await?;
    Ok((
        [
            (header::CONTENT_TYPE, doc.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", doc.filename),
            ),
        ],
        doc.body,
    )
        .into_response())
}

// Discrepancies

async fn handle_list_discrepancies(
    State(state): State<AppState>,
    Query(filter): Query<DiscrepancyFilter>,
) -> SpecularResult<Json<Vec<crate::types::Discrepancy>>> {
    Ok(Json(state.truth.list_discrepancies(&filter).await?))
}

async fn handle_get_discrepancy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SpecularResult<Json<crate::types::Discrepancy>> {
    state
        .truth
        .get_discrepancy(&id)
        .await?
        .map(Json)
        .ok_or(SpecularError::NotFound {
            kind: "discrepancy",
            id,
        })
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    resolution: Resolution,
}

async fn handle_resolve_discrepancy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> SpecularResult<Json<crate::types::Discrepancy>> {
    Ok(Json(
        state.truth.resolve_discrepancy(&id, request.resolution).await?,
    ))
}

// Discovery

async fn handle_list_adapters(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.statuses())
}

#[derive(Debug, Deserialize)]
struct ScanRequest {
    cidr: String,
}

async fn handle_scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> SpecularResult<Json<serde_json::Value>> {
    let cancel = state.shutdown.child_token();
    let discovered = state.scanner.scan_subnet(&request.cidr, &cancel).await?;
    Ok(Json(json!({ "nodes_discovered": discovered })))
}

// Clients & live events

async fn handle_register_client(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(info): Json<ClientInfo>,
) -> SpecularResult<Json<Node>> {
    Ok(Json(state.graph.register_client(peer.ip(), info).await?))
}

/// Unregisters the SSE client when its response stream is dropped.
struct ClientGuard {
    id: u64,
    hub: Arc<SseHub>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

async fn handle_events(State(state): State<AppState>) -> Response {
    let (id, rx) = state.hub.register().await;
    let guard = ClientGuard {
        id,
        hub: Arc::clone(&state.hub),
    };
    let stream = ReceiverStream::new(rx).map(move |frame| {
        let _keep_alive = &guard;
        Ok::<String, Infallible>(frame)
    });
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
