/// Periodic re-verification of known inventory.
///
/// The verifier never invents nodes. Each cycle it lists the nodes that
/// carry an IP, probes them with bounded concurrency, and reports an
/// observation per node: reachable nodes come back `verified` with their
/// open ports, unreachable ones come back `unreachable`. The observation
/// starts from the node's existing `discovered` map so that keys produced
/// by other sources survive and an unchanged host reconciles silently.
use crate::error::SpecularResult;
use crate::repository::{NodeFilter, Repository};
use crate::types::{GraphFragment, Node, NodeStatus};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::Adapter;

const DEFAULT_VERIFY_PORTS: &[u16] = &[22, 80, 443, 3389, 8080];

/// TCP-probe verifier over known inventory.
pub struct VerifierAdapter {
    repo: Arc<dyn Repository>,
    ports: Vec<u16>,
    probe_timeout: Duration,
    concurrency: usize,
}

impl VerifierAdapter {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            ports: DEFAULT_VERIFY_PORTS.to_vec(),
            probe_timeout: Duration::from_millis(750),
            concurrency: 32,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Build the observation for one node.
    async fn verify_node(&self, node: Node) -> Option<Node> {
        let ip: IpAddr = node.primary_ip()?.parse().ok()?;

        let mut open_ports = Vec::new();
        for &port in &self.ports {
            let addr = SocketAddr::from((ip, port));
            if let Ok(Ok(_)) =
                tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await
            {
                open_ports.push(port);
            }
        }

        let now = Utc::now();
        let mut observed = node;
        observed.discovered.insert("open_ports".to_string(), json!(open_ports));
        if open_ports.is_empty() {
            observed.status = NodeStatus::Unreachable;
            observed.last_verified = Some(now);
            observed.last_seen = None;
        } else {
            observed.status = NodeStatus::Verified;
            observed.last_verified = Some(now);
            observed.last_seen = Some(now);
        }
        Some(observed)
    }
}

#[async_trait]
impl Adapter for VerifierAdapter {
    fn name(&self) -> &str {
        "verifier"
    }

    async fn sync(&self, cancel: &CancellationToken) -> SpecularResult<GraphFragment> {
        let nodes = self.repo.list_nodes(&NodeFilter::default()).await?;
        let candidates: Vec<Node> = nodes
            .into_iter()
            .filter(|n| n.primary_ip().is_some())
            .collect();
        tracing::debug!(candidates = candidates.len(), "verifying inventory");

        let mut probes = stream::iter(candidates)
            .map(|node| self.verify_node(node))
            .buffer_unordered(self.concurrency);

        let mut fragment = GraphFragment::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(observed = fragment.nodes.len(), "verification cancelled");
                    break;
                }
                next = probes.next() => match next {
                    Some(Some(observed)) => fragment.nodes.push(observed),
                    Some(None) => {}
                    None => break,
                },
            }
        }
        Ok(fragment)
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["tcp-probe".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GraphStore;
    use crate::types::NodeType;

    #[tokio::test]
    async fn test_sync_skips_nodes_without_ip() {
        let repo = Arc::new(GraphStore::in_memory());
        repo.create_node(Node::new("no-ip", NodeType::Switch, "no-ip"))
            .await
            .unwrap();

        let verifier = VerifierAdapter::new(repo.clone() as Arc<dyn Repository>)
            .with_probe_timeout(Duration::from_millis(10));
        let fragment = verifier.sync(&CancellationToken::new()).await.unwrap();
        assert!(fragment.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_reachable_loopback_verifies() {
        // A listener on loopback gives the probe something real to hit.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let repo = Arc::new(GraphStore::in_memory());
        let node = Node::new("127-0-0-1", NodeType::Server, "self")
            .with_property("ip", json!("127.0.0.1"));
        repo.create_node(node).await.unwrap();

        let mut verifier = VerifierAdapter::new(repo.clone() as Arc<dyn Repository>)
            .with_probe_timeout(Duration::from_millis(250));
        verifier.ports = vec![port];

        let fragment = verifier.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(fragment.nodes.len(), 1);
        assert_eq!(fragment.nodes[0].status, NodeStatus::Verified);
        assert_eq!(fragment.nodes[0].discovered["open_ports"], json!([port]));
        assert!(fragment.nodes[0].last_seen.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_node_marked() {
        let repo = Arc::new(GraphStore::in_memory());
        // TEST-NET-1 is guaranteed unrouted.
        let node = Node::new("192-0-2-1", NodeType::Server, "dead")
            .with_property("ip", json!("192.0.2.1"));
        repo.create_node(node).await.unwrap();

        let verifier = VerifierAdapter::new(repo.clone() as Arc<dyn Repository>)
            .with_probe_timeout(Duration::from_millis(50));
        let fragment = verifier.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(fragment.nodes.len(), 1);
        assert_eq!(fragment.nodes[0].status, NodeStatus::Unreachable);
        assert!(fragment.nodes[0].last_seen.is_none());
    }
}
