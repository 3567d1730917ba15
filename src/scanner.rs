/// Scanner service: subnet sweeps that may invent nodes.
///
/// Unlike the verifier path, scan output is coarse: discovered hosts are
/// upserted directly (verification write when the node exists, create when
/// it does not) and a single aggregated `graph-updated` event is emitted
/// instead of per-node updates. The same upsert path seeds the graph from
/// the bootstrap adapter at startup.
use crate::adapters::SubnetScanner;
use crate::error::{SpecularError, SpecularResult};
use crate::events::{Event, EventBus};
use crate::repository::Repository;
use crate::types::GraphFragment;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Counts from applying a fragment through the upsert path.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertStats {
    pub created: usize,
    pub updated: usize,
}

pub struct ScannerService {
    scanner: Option<Arc<dyn SubnetScanner>>,
    repo: Arc<dyn Repository>,
    bus: Arc<EventBus>,
}

impl ScannerService {
    pub fn new(
        scanner: Option<Arc<dyn SubnetScanner>>,
        repo: Arc<dyn Repository>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { scanner, repo, bus }
    }

    /// Sweep a subnet and upsert what answered.
    ///
    /// Emits one aggregated `graph-updated` event with the discovery
    /// count; per-node events are deliberately not emitted here.
    pub async fn scan_subnet(
        &self,
        cidr: &str,
        cancel: &CancellationToken,
    ) -> SpecularResult<usize> {
        let scanner = self
            .scanner
            .as_ref()
            .ok_or_else(|| SpecularError::Unavailable("no subnet scanner configured".to_string()))?;

        let fragment = scanner.scan(cidr, cancel).await?;
        let discovered = fragment.nodes.len();
        let stats = self.ingest(&fragment).await?;
        tracing::info!(
            cidr,
            discovered,
            created = stats.created,
            updated = stats.updated,
            "subnet scan complete"
        );

        self.bus.publish(Event::graph_updated(json!({
            "source": "scanner",
            "cidr": cidr,
            "nodes_discovered": discovered,
        })));
        Ok(discovered)
    }

    /// Upsert a fragment: existing nodes get a verification write, new
    /// nodes are created as given, edges are added when missing.
    pub async fn ingest(&self, fragment: &GraphFragment) -> SpecularResult<UpsertStats> {
        let mut stats = UpsertStats::default();
        for node in &fragment.nodes {
            if self.repo.get_node(&node.id).await?.is_some() {
                self.repo
                    .update_node_verification(
                        &node.id,
                        node.status,
                        node.last_verified,
                        node.last_seen,
                        node.discovered.clone(),
                    )
                    .await?;
                stats.updated += 1;
            } else {
                self.repo.create_node(node.clone()).await?;
                stats.created += 1;
            }
        }
        for edge in &fragment.edges {
            if self.repo.get_edge(&edge.id).await?.is_none() {
                self.repo.create_edge(edge.clone()).await?;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::store::GraphStore;
    use crate::types::{Node, NodeStatus, NodeType};
    use async_trait::async_trait;

    struct FixedScanner {
        fragment: GraphFragment,
    }

    #[async_trait]
    impl SubnetScanner for FixedScanner {
        async fn scan(
            &self,
            _cidr: &str,
            _cancel: &CancellationToken,
        ) -> SpecularResult<GraphFragment> {
            Ok(self.fragment.clone())
        }
    }

    fn found(id: &str) -> Node {
        let mut node = Node::new(id, NodeType::Server, id)
            .with_source("scanner")
            .with_status(NodeStatus::Verified);
        node.discovered.insert("open_ports".to_string(), json!([22]));
        node
    }

    #[tokio::test]
    async fn test_unconfigured_scanner_is_unavailable() {
        let repo = Arc::new(GraphStore::in_memory());
        let bus = Arc::new(EventBus::new());
        let service = ScannerService::new(None, repo as Arc<dyn Repository>, bus);
        let err = service
            .scan_subnet("10.0.0.0/30", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpecularError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_scan_creates_and_updates_without_per_node_events() {
        let repo = Arc::new(GraphStore::in_memory());
        let bus = Arc::new(EventBus::new());
        // One of the scan results already exists.
        repo.create_node(Node::new("10-0-0-5", NodeType::Server, "known"))
            .await
            .unwrap();

        let scanner = FixedScanner {
            fragment: GraphFragment::new()
                .with_node(found("10-0-0-5"))
                .with_node(found("10-0-0-6")),
        };
        let service = ScannerService::new(
            Some(Arc::new(scanner)),
            repo.clone() as Arc<dyn Repository>,
            bus.clone(),
        );

        let mut rx = bus.subscribe();
        let discovered = service
            .scan_subnet("10.0.0.0/29", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(discovered, 2);

        // The existing node was verified, not recreated; its label stays.
        let known = repo.get_node("10-0-0-5").await.unwrap().unwrap();
        assert_eq!(known.label, "known");
        assert_eq!(known.status, NodeStatus::Verified);
        assert!(repo.get_node("10-0-0-6").await.unwrap().is_some());

        // Exactly one aggregated event.
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::GraphUpdated);
        assert_eq!(event.payload["nodes_discovered"], json!(2));
        assert!(rx.try_recv().is_err());
    }
}
