/// The reconcile function: merges discovery output into persistent state.
///
/// Adapters produce [`GraphFragment`]s describing what they observed. For
/// each node the reconciler compares the observation against persisted
/// state and writes only deltas; an identical re-verification produces no
/// write and no event, which is what keeps the UI's physics simulation
/// still between real changes. Changed nodes get a verification write, a
/// best-effort discrepancy check, optional label inference, and exactly
/// one `node-updated` event carrying the full updated node.
///
/// Verification does not invent nodes: a fragment node with no persisted
/// counterpart is skipped with a log line. The scanner path creates nodes;
/// verifiers only operate on known inventory.
use crate::error::{SpecularError, SpecularResult};
use crate::events::{Event, EventBus};
use crate::repository::Repository;
use crate::truth::TruthService;
use crate::types::{extract_short_name, GraphFragment, HostnameInference};
use crate::values::discovered_equal;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Reconciler {
    repo: Arc<dyn Repository>,
    truth: Arc<TruthService>,
    bus: Arc<EventBus>,
}

impl Reconciler {
    pub fn new(repo: Arc<dyn Repository>, truth: Arc<TruthService>, bus: Arc<EventBus>) -> Self {
        Self { repo, truth, bus }
    }

    /// Reconcile one fragment from `source`.
    ///
    /// Returns the number of nodes that actually changed. The token is
    /// checked between nodes; on cancellation the work done so far stays
    /// persisted. Per-node failures are logged and skipped; only storage
    /// failures abort the loop.
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        source: &str,
        fragment: &GraphFragment,
    ) -> SpecularResult<usize> {
        let mut changed = 0usize;

        for observed in &fragment.nodes {
            if cancel.is_cancelled() {
                tracing::debug!(source, changed, "reconcile cancelled mid-fragment");
                return Ok(changed);
            }

            let Some(existing) = self.repo.get_node(&observed.id).await? else {
                tracing::debug!(source, node = %observed.id, "skipping unknown node");
                continue;
            };

            let status_changed = existing.status != observed.status;
            let discovered_changed =
                !discovered_equal(&existing.discovered, &observed.discovered);
            if !status_changed && !discovered_changed {
                continue;
            }

            if let Err(err) = self
                .repo
                .update_node_verification(
                    &observed.id,
                    observed.status,
                    observed.last_verified,
                    observed.last_seen,
                    observed.discovered.clone(),
                )
                .await
            {
                if matches!(err, SpecularError::Storage(_)) {
                    return Err(err);
                }
                tracing::warn!(source, node = %observed.id, error = %err, "verification write failed");
                continue;
            }

            // Best-effort: a failed check never aborts the reconcile.
            if let Err(err) = self
                .truth
                .check_discrepancies(&observed.id, &observed.discovered, source)
                .await
            {
                tracing::warn!(source, node = %observed.id, error = %err, "discrepancy check failed");
            }

            if let Err(err) = self.infer_label(&observed.id, &existing.label, observed).await {
                tracing::warn!(source, node = %observed.id, error = %err, "label inference failed");
            }

            match self.repo.get_node(&observed.id).await? {
                Some(updated) => {
                    self.bus.publish(Event::node_updated(&updated));
                    changed += 1;
                }
                // Deleted underneath us; nothing to announce.
                None => continue,
            }
        }

        tracing::info!(source, total = fragment.nodes.len(), changed, "reconciled fragment");
        Ok(changed)
    }

    /// Propose a label from hostname inference.
    ///
    /// Operator truth on `hostname` always wins over inference, so the
    /// label is only touched when no such truth exists, the inference has
    /// a best candidate, and the derived short name is non-empty and
    /// different from the current label.
    async fn infer_label(
        &self,
        node_id: &str,
        current_label: &str,
        observed: &crate::types::Node,
    ) -> SpecularResult<()> {
        let Some(inference) = HostnameInference::from_discovered(&observed.discovered) else {
            return Ok(());
        };
        let Some(best) = inference.best else {
            return Ok(());
        };
        if self.repo.has_operator_truth_hostname(node_id).await? {
            return Ok(());
        }
        let new_label = extract_short_name(&best.hostname);
        if new_label.is_empty() || new_label == current_label {
            return Ok(());
        }
        tracing::debug!(node = node_id, label = %new_label, "label inferred from hostname");
        self.repo.update_node_label(node_id, &new_label).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::store::GraphStore;
    use crate::types::{
        HostnameCandidate, Node, NodeStatus, NodeType, PropertyMap, HOSTNAME_INFERENCE_KEY,
    };
    use chrono::Utc;
    use serde_json::json;

    struct Fixture {
        repo: Arc<GraphStore>,
        bus: Arc<EventBus>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(GraphStore::in_memory());
        let bus = Arc::new(EventBus::new());
        let truth = Arc::new(TruthService::new(
            repo.clone() as Arc<dyn Repository>,
            bus.clone(),
        ));
        let reconciler = Reconciler::new(repo.clone() as Arc<dyn Repository>, truth, bus.clone());
        Fixture {
            repo,
            bus,
            reconciler,
        }
    }

    fn discovered(pairs: &[(&str, serde_json::Value)]) -> PropertyMap {
        let mut map = PropertyMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        map
    }

    fn observation(id: &str, status: NodeStatus, disc: PropertyMap) -> Node {
        let mut node = Node::new(id, NodeType::Server, id).with_status(status);
        node.discovered = disc;
        node.last_verified = Some(Utc::now());
        node.last_seen = Some(Utc::now());
        node
    }

    #[tokio::test]
    async fn test_unchanged_node_is_silent() {
        let f = fixture();
        let mut seed = Node::new("10-0-0-5", NodeType::Server, "web")
            .with_status(NodeStatus::Verified);
        seed.discovered = discovered(&[("hostname", json!("web"))]);
        f.repo.create_node(seed).await.unwrap();
        let before = f.repo.get_node("10-0-0-5").await.unwrap().unwrap();

        let mut rx = f.bus.subscribe();
        let fragment = GraphFragment::new().with_node(observation(
            "10-0-0-5",
            NodeStatus::Verified,
            discovered(&[("hostname", json!("web"))]),
        ));
        let changed = f
            .reconciler
            .reconcile(&CancellationToken::new(), "verifier", &fragment)
            .await
            .unwrap();

        assert_eq!(changed, 0);
        assert!(rx.try_recv().is_err());
        // No write happened either.
        let after = f.repo.get_node("10-0-0-5").await.unwrap().unwrap();
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_changed_discovery_writes_and_emits() {
        let f = fixture();
        f.repo
            .create_node(Node::new("10-0-0-5", NodeType::Server, "web"))
            .await
            .unwrap();

        let mut rx = f.bus.subscribe();
        let fragment = GraphFragment::new().with_node(observation(
            "10-0-0-5",
            NodeStatus::Verified,
            discovered(&[("hostname", json!("web")), ("os", json!("linux"))]),
        ));
        let changed = f
            .reconciler
            .reconcile(&CancellationToken::new(), "verifier", &fragment)
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::NodeUpdated);
        assert_eq!(event.payload["discovered"]["os"], json!("linux"));

        let node = f.repo.get_node("10-0-0-5").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Verified);
        assert!(node.last_verified.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let f = fixture();
        f.repo
            .create_node(Node::new("n1", NodeType::Server, "n1"))
            .await
            .unwrap();

        let fragment = GraphFragment::new().with_node(observation(
            "n1",
            NodeStatus::Verified,
            discovered(&[("os", json!("linux"))]),
        ));
        let first = f
            .reconciler
            .reconcile(&CancellationToken::new(), "verifier", &fragment)
            .await
            .unwrap();
        assert_eq!(first, 1);
        let state_after_first = f.repo.get_node("n1").await.unwrap().unwrap();

        // The second application is a no-op.
        let second = f
            .reconciler
            .reconcile(&CancellationToken::new(), "verifier", &fragment)
            .await
            .unwrap();
        assert_eq!(second, 0);
        let state_after_second = f.repo.get_node("n1").await.unwrap().unwrap();
        assert_eq!(state_after_first, state_after_second);
    }

    #[tokio::test]
    async fn test_unknown_node_is_skipped() {
        let f = fixture();
        let mut rx = f.bus.subscribe();
        let fragment = GraphFragment::new().with_node(observation(
            "ghost",
            NodeStatus::Verified,
            PropertyMap::new(),
        ));
        let changed = f
            .reconciler
            .reconcile(&CancellationToken::new(), "verifier", &fragment)
            .await
            .unwrap();
        assert_eq!(changed, 0);
        assert!(rx.try_recv().is_err());
        assert!(f.repo.get_node("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_discrepancy_created_during_reconcile() {
        let f = fixture();
        f.repo
            .create_node(Node::new("10-0-0-5", NodeType::Server, "web"))
            .await
            .unwrap();
        let truth = TruthService::new(f.repo.clone() as Arc<dyn Repository>, f.bus.clone());
        truth
            .set_truth(
                "10-0-0-5",
                discovered(&[("hostname", json!("web01"))]),
                "op",
            )
            .await
            .unwrap();

        let fragment = GraphFragment::new().with_node(observation(
            "10-0-0-5",
            NodeStatus::Verified,
            discovered(&[("hostname", json!("web02"))]),
        ));
        f.reconciler
            .reconcile(&CancellationToken::new(), "verifier", &fragment)
            .await
            .unwrap();

        let node = f.repo.get_node("10-0-0-5").await.unwrap().unwrap();
        assert!(node.has_discrepancy);
        let rows = f
            .repo
            .list_discrepancies(&crate::repository::DiscrepancyFilter {
                node_id: Some("10-0-0-5".to_string()),
                unresolved_only: true,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].truth_value, json!("web01"));
        assert_eq!(rows[0].actual_value, json!("web02"));
        assert_eq!(rows[0].source, "verifier");
    }

    fn inference(hostname: &str) -> serde_json::Value {
        HostnameInference {
            candidates: vec![],
            best: Some(HostnameCandidate {
                hostname: hostname.to_string(),
                confidence: 0.9,
                source: "dns".to_string(),
            }),
        }
        .to_value()
    }

    #[tokio::test]
    async fn test_label_inferred_from_hostname() {
        let f = fixture();
        f.repo
            .create_node(Node::new("10-0-0-7", NodeType::Server, "10-0-0-7"))
            .await
            .unwrap();

        let fragment = GraphFragment::new().with_node(observation(
            "10-0-0-7",
            NodeStatus::Verified,
            discovered(&[(HOSTNAME_INFERENCE_KEY, inference("Prod-DB-01.corp"))]),
        ));
        f.reconciler
            .reconcile(&CancellationToken::new(), "verifier", &fragment)
            .await
            .unwrap();

        let node = f.repo.get_node("10-0-0-7").await.unwrap().unwrap();
        assert_eq!(node.label, "prod-db-01");
    }

    #[tokio::test]
    async fn test_operator_truth_hostname_wins_over_inference() {
        let f = fixture();
        f.repo
            .create_node(Node::new("10-0-0-7", NodeType::Server, "db-primary"))
            .await
            .unwrap();
        let truth = TruthService::new(f.repo.clone() as Arc<dyn Repository>, f.bus.clone());
        truth
            .set_truth(
                "10-0-0-7",
                discovered(&[("hostname", json!("db-primary"))]),
                "op",
            )
            .await
            .unwrap();

        let fragment = GraphFragment::new().with_node(observation(
            "10-0-0-7",
            NodeStatus::Verified,
            discovered(&[(HOSTNAME_INFERENCE_KEY, inference("prod-db-01.corp"))]),
        ));
        f.reconciler
            .reconcile(&CancellationToken::new(), "verifier", &fragment)
            .await
            .unwrap();

        let node = f.repo.get_node("10-0-0-7").await.unwrap().unwrap();
        assert_eq!(node.label, "db-primary");
    }

    #[tokio::test]
    async fn test_cancellation_keeps_completed_work() {
        let f = fixture();
        f.repo
            .create_node(Node::new("n1", NodeType::Server, "n1"))
            .await
            .unwrap();
        f.repo
            .create_node(Node::new("n2", NodeType::Server, "n2"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let fragment = GraphFragment::new()
            .with_node(observation("n1", NodeStatus::Verified, PropertyMap::new()))
            .with_node(observation("n2", NodeStatus::Verified, PropertyMap::new()));
        let changed = f
            .reconciler
            .reconcile(&cancel, "verifier", &fragment)
            .await
            .unwrap();
        // Cancelled before the first node.
        assert_eq!(changed, 0);
        let n1 = f.repo.get_node("n1").await.unwrap().unwrap();
        assert_eq!(n1.status, NodeStatus::Unverified);
    }
}
