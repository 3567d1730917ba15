/// Graph mutation service.
///
/// A thin validator and event emitter over the repository: every mutating
/// call that succeeds publishes exactly one event. Import delegates
/// parsing to a codec and applies the fragment atomically; export renders
/// the current graph through the same codecs. Passive client registration
/// (the UI posting its own presence) also lives here, since it is a graph
/// mutation with its own idempotency rules.
use crate::codec::codec_for;
use crate::error::{SpecularError, SpecularResult};
use crate::events::{Event, EventBus};
use crate::repository::{
    EdgeFilter, EdgeUpdate, ImportStats, NodeFilter, NodeUpdate, Repository,
};
use crate::types::{
    node_id_from_ip, segmentum_for, Edge, GraphExport, ImportStrategy, Node, NodePosition,
    NodeStatus, NodeType,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;

/// Self-reported info from a UI client registration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Rendered export, ready to be served as an attachment.
pub struct ExportDocument {
    pub content_type: &'static str,
    pub filename: String,
    pub body: String,
}

pub struct GraphService {
    repo: Arc<dyn Repository>,
    bus: Arc<EventBus>,
}

impl GraphService {
    pub fn new(repo: Arc<dyn Repository>, bus: Arc<EventBus>) -> Self {
        Self { repo, bus }
    }

    /// The whole graph: nodes, edges, positions.
    pub async fn graph(&self) -> SpecularResult<GraphExport> {
        self.repo.export_graph().await
    }

    pub async fn create_node(&self, node: Node) -> SpecularResult<Node> {
        if node.id.trim().is_empty() {
            return Err(SpecularError::validation("node id must not be empty"));
        }
        if node.label.trim().is_empty() {
            return Err(SpecularError::validation("node label must not be empty"));
        }
        let node = self.repo.create_node(node).await?;
        self.bus.publish(Event::node_created(&node));
        Ok(node)
    }

    pub async fn get_node(&self, id: &str) -> SpecularResult<Node> {
        self.repo
            .get_node(id)
            .await?
            .ok_or_else(|| SpecularError::node_not_found(id))
    }

    pub async fn list_nodes(&self, filter: &NodeFilter) -> SpecularResult<Vec<Node>> {
        self.repo.list_nodes(filter).await
    }

    pub async fn update_node(&self, id: &str, update: NodeUpdate) -> SpecularResult<Node> {
        if let Some(ref label) = update.label {
            if label.trim().is_empty() {
                return Err(SpecularError::validation("node label must not be empty"));
            }
        }
        let node = self.repo.update_node(id, update).await?;
        self.bus.publish(Event::node_updated(&node));
        Ok(node)
    }

    pub async fn delete_node(&self, id: &str) -> SpecularResult<()> {
        self.repo.delete_node(id).await?;
        self.bus.publish(Event::node_deleted(id));
        Ok(())
    }

    /// Fold `source_id` into `target_id` (duplicate discoveries of the
    /// same host). Emits `node-updated` for the survivor and
    /// `node-deleted` for the absorbed node.
    pub async fn merge_nodes(&self, target_id: &str, source_id: &str) -> SpecularResult<Node> {
        let merged = self.repo.merge_nodes(target_id, source_id).await?;
        self.bus.publish(Event::node_updated(&merged));
        self.bus.publish(Event::node_deleted(source_id));
        Ok(merged)
    }

    pub async fn create_edge(&self, edge: Edge) -> SpecularResult<Edge> {
        if edge.id.trim().is_empty() {
            return Err(SpecularError::validation("edge id must not be empty"));
        }
        if edge.from_id.trim().is_empty() || edge.to_id.trim().is_empty() {
            return Err(SpecularError::validation("edge endpoints must not be empty"));
        }
        if edge.from_id == edge.to_id {
            return Err(SpecularError::validation("edge endpoints must differ"));
        }
        let edge = self.repo.create_edge(edge).await?;
        self.bus.publish(Event::edge_created(&edge));
        Ok(edge)
    }

    pub async fn get_edge(&self, id: &str) -> SpecularResult<Edge> {
        self.repo.get_edge(id).await?.ok_or(SpecularError::NotFound {
            kind: "edge",
            id: id.to_string(),
        })
    }

    pub async fn list_edges(&self, filter: &EdgeFilter) -> SpecularResult<Vec<Edge>> {
        self.repo.list_edges(filter).await
    }

    pub async fn update_edge(&self, id: &str, update: EdgeUpdate) -> SpecularResult<Edge> {
        let edge = self.repo.update_edge(id, update).await?;
        self.bus.publish(Event::edge_updated(&edge));
        Ok(edge)
    }

    pub async fn delete_edge(&self, id: &str) -> SpecularResult<()> {
        self.repo.delete_edge(id).await?;
        self.bus.publish(Event::edge_deleted(id));
        Ok(())
    }

    pub async fn list_positions(&self) -> SpecularResult<Vec<NodePosition>> {
        self.repo.list_positions().await
    }

    pub async fn set_position(&self, position: NodePosition) -> SpecularResult<NodePosition> {
        let position = self.repo.upsert_position(position).await?;
        self.bus
            .publish(Event::positions_updated(std::slice::from_ref(&position)));
        Ok(position)
    }

    /// Bulk position write; one `positions_updated` event for the batch.
    pub async fn set_positions(
        &self,
        positions: Vec<NodePosition>,
    ) -> SpecularResult<Vec<NodePosition>> {
        let mut written = Vec::with_capacity(positions.len());
        for position in positions {
            written.push(self.repo.upsert_position(position).await?);
        }
        self.bus.publish(Event::positions_updated(&written));
        Ok(written)
    }

    /// Parse `text` with the codec for `format` and apply it. One
    /// `graph-updated` event with counts on success.
    pub async fn import(
        &self,
        format: &str,
        text: &str,
        strategy: ImportStrategy,
    ) -> SpecularResult<ImportStats> {
        let codec = codec_for(format)?;
        let fragment = codec.decode(text)?;
        let stats = self.repo.import_fragment(fragment, strategy).await?;
        tracing::info!(
            format,
            nodes = stats.nodes,
            edges = stats.edges,
            ?strategy,
            "imported topology"
        );
        self.bus.publish(Event::graph_updated(json!({
            "source": "import",
            "format": format,
            "nodes": stats.nodes,
            "edges": stats.edges,
        })));
        Ok(stats)
    }

    /// Render the current graph in the requested format.
    pub async fn export(&self, format: &str) -> SpecularResult<ExportDocument> {
        let codec = codec_for(format)?;
        let export = self.repo.export_graph().await?;
        let body = codec.encode(&export)?;
        Ok(ExportDocument {
            content_type: codec.content_type(),
            filename: format!("specularium-export.{}", codec.file_extension()),
            body,
        })
    }

    /// Remove every graph object. One `graph-updated` event.
    pub async fn clear(&self) -> SpecularResult<()> {
        self.repo.clear_graph().await?;
        self.bus
            .publish(Event::graph_updated(json!({ "cleared": true })));
        Ok(())
    }

    /// Passive client registration.
    ///
    /// The node id derives from the requesting peer address; concurrent
    /// registrations from the same address converge on one node. Existing
    /// nodes get `last_seen` bumped and browser details merged into
    /// `discovered`; unknown peers become `source=client` nodes that are
    /// `verified` from the start — they are demonstrably alive.
    pub async fn register_client(&self, peer: IpAddr, info: ClientInfo) -> SpecularResult<Node> {
        let id = node_id_from_ip(&peer);

        loop {
            let now = Utc::now();
            if let Some(existing) = self.repo.get_node(&id).await? {
                let mut discovered = existing.discovered.clone();
                if let Some(ref user_agent) = info.user_agent {
                    discovered.insert("user_agent".to_string(), json!(user_agent));
                }
                discovered.insert("last_browser_visit".to_string(), json!(now.to_rfc3339()));
                self.repo
                    .update_node_verification(&id, existing.status, None, Some(now), discovered)
                    .await?;
                let node = self.get_node(&id).await?;
                self.bus.publish(Event::node_updated(&node));
                return Ok(node);
            }

            let label = info
                .hostname
                .clone()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| peer.to_string());
            let mut node = Node::new(&id, NodeType::Client, label)
                .with_source("client")
                .with_status(NodeStatus::Verified)
                .with_property("ip", json!(peer.to_string()));
            if let IpAddr::V4(v4) = peer {
                node.properties
                    .insert("segmentum".to_string(), json!(segmentum_for(&v4)));
            }
            if let Some(ref hostname) = info.hostname {
                node.discovered.insert("hostname".to_string(), json!(hostname));
            }
            if let Some(ref user_agent) = info.user_agent {
                node.discovered.insert("user_agent".to_string(), json!(user_agent));
            }
            node.discovered
                .insert("last_browser_visit".to_string(), json!(now.to_rfc3339()));
            node.last_seen = Some(now);

            match self.repo.create_node(node).await {
                Ok(node) => {
                    self.bus.publish(Event::node_created(&node));
                    return Ok(node);
                }
                // A concurrent registration from the same peer created the
                // node first; retry through the update path.
                Err(SpecularError::Conflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::store::GraphStore;
    use crate::types::EdgeType;

    fn service() -> (GraphService, Arc<GraphStore>, Arc<EventBus>) {
        let repo = Arc::new(GraphStore::in_memory());
        let bus = Arc::new(EventBus::new());
        let svc = GraphService::new(repo.clone() as Arc<dyn Repository>, bus.clone());
        (svc, repo, bus)
    }

    #[tokio::test]
    async fn test_node_validation() {
        let (svc, _repo, _bus) = service();
        let err = svc
            .create_node(Node::new("", NodeType::Server, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SpecularError::Validation { .. }));

        let err = svc
            .create_node(Node::new("x", NodeType::Server, " "))
            .await
            .unwrap_err();
        assert!(matches!(err, SpecularError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_self_loop_rejected_before_repo() {
        let (svc, _repo, _bus) = service();
        let err = svc
            .create_edge(Edge::new("e", "a", "a", EdgeType::Physical))
            .await
            .unwrap_err();
        assert!(matches!(err, SpecularError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_mutations_emit_one_event_each() {
        let (svc, _repo, bus) = service();
        let mut rx = bus.subscribe();

        svc.create_node(Node::new("a", NodeType::Server, "a")).await.unwrap();
        svc.create_node(Node::new("b", NodeType::Server, "b")).await.unwrap();
        svc.create_edge(Edge::new("e", "a", "b", EdgeType::Physical))
            .await
            .unwrap();
        svc.delete_edge("e").await.unwrap();
        svc.delete_node("a").await.unwrap();

        let types: Vec<EventType> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                EventType::NodeCreated,
                EventType::NodeCreated,
                EventType::EdgeCreated,
                EventType::EdgeDeleted,
                EventType::NodeDeleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_import_yaml_then_export_json() {
        let (svc, _repo, bus) = service();
        let mut rx = bus.subscribe();

        let text = r#"
nodes:
  - id: a
    type: server
    label: a
  - id: b
    type: switch
    label: b
edges:
  - id: e1
    from_id: a
    to_id: b
    type: physical
"#;
        let stats = svc.import("yaml", text, ImportStrategy::Merge).await.unwrap();
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.edges, 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::GraphUpdated);
        assert_eq!(event.payload["nodes"], json!(2));

        let doc = svc.export("json").await.unwrap();
        assert_eq!(doc.content_type, "application/json");
        let parsed: GraphExport = serde_json::from_str(&doc.body).unwrap();
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.edges.len(), 1);
    }

    #[tokio::test]
    async fn test_register_client_is_idempotent() {
        let (svc, repo, _bus) = service();
        let peer: IpAddr = "192.168.4.20".parse().unwrap();

        let info = ClientInfo {
            hostname: Some("laptop".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        };
        let first = svc.register_client(peer, info.clone()).await.unwrap();
        assert_eq!(first.id, "192-168-4-20");
        assert_eq!(first.node_type, NodeType::Client);
        assert_eq!(first.status, NodeStatus::Verified);
        assert_eq!(first.properties["segmentum"], json!("192.168.4.0/24"));

        let second = svc.register_client(peer, info).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(
            repo.list_nodes(&NodeFilter::default()).await.unwrap().len(),
            1
        );
        assert!(second.discovered.contains_key("last_browser_visit"));
        assert_eq!(second.discovered["user_agent"], json!("Mozilla/5.0"));
    }

    #[tokio::test]
    async fn test_clear_emits_event() {
        let (svc, repo, bus) = service();
        svc.create_node(Node::new("a", NodeType::Server, "a")).await.unwrap();
        let mut rx = bus.subscribe();

        svc.clear().await.unwrap();
        assert!(repo.list_nodes(&NodeFilter::default()).await.unwrap().is_empty());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::GraphUpdated);
        assert_eq!(event.payload["cleared"], json!(true));
    }
}
