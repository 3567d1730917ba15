/// Repository contract for durable graph state.
///
/// The reconciliation core depends on this interface, not on a concrete
/// store. Every operation must be safe under concurrent invocation, and
/// referential constraints (edge endpoints exist, deletes cascade) are
/// enforced inside the implementation. [`crate::store::GraphStore`] is the
/// shipped implementation.
use crate::error::SpecularResult;
use crate::types::{
    Discrepancy, Edge, EdgeType, GraphExport, GraphFragment, ImportStrategy, Node, NodePosition,
    NodeStatus, NodeTruth, NodeType, PropertyMap, Resolution,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filter for node listings. Empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFilter {
    #[serde(default, rename = "type")]
    pub node_type: Option<NodeType>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(t) = self.node_type {
            if node.node_type != t {
                return false;
            }
        }
        if let Some(s) = self.status {
            if node.status != s {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if &node.source != source {
                return false;
            }
        }
        if let Some(ref parent) = self.parent_id {
            if node.parent_id.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Filter for edge listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeFilter {
    #[serde(default, rename = "type")]
    pub edge_type: Option<EdgeType>,
    #[serde(default)]
    pub from_id: Option<String>,
    #[serde(default)]
    pub to_id: Option<String>,
}

impl EdgeFilter {
    pub fn matches(&self, edge: &Edge) -> bool {
        if let Some(t) = self.edge_type {
            if edge.edge_type != t {
                return false;
            }
        }
        if let Some(ref from) = self.from_id {
            if &edge.from_id != from {
                return false;
            }
        }
        if let Some(ref to) = self.to_id {
            if &edge.to_id != to {
                return false;
            }
        }
        true
    }
}

/// Filter for discrepancy listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscrepancyFilter {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub unresolved_only: bool,
}

impl DiscrepancyFilter {
    pub fn matches(&self, d: &Discrepancy) -> bool {
        if let Some(ref node_id) = self.node_id {
            if &d.node_id != node_id {
                return false;
            }
        }
        if self.unresolved_only && !d.is_unresolved() {
            return false;
        }
        true
    }
}

/// A partial node update. The id is immutable; unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default, rename = "type")]
    pub node_type: Option<NodeType>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Option<String>>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    /// Replaces the whole properties map when present.
    #[serde(default)]
    pub properties: Option<PropertyMap>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

/// A partial edge update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeUpdate {
    #[serde(default, rename = "type")]
    pub edge_type: Option<EdgeType>,
    #[serde(default)]
    pub properties: Option<PropertyMap>,
}

/// Counts returned by an import.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ImportStats {
    pub nodes: usize,
    pub edges: usize,
}

/// Durable CRUD over nodes, edges, positions, truth, and discrepancies.
#[async_trait]
pub trait Repository: Send + Sync {
    // Nodes
    async fn create_node(&self, node: Node) -> SpecularResult<Node>;
    async fn get_node(&self, id: &str) -> SpecularResult<Option<Node>>;
    async fn list_nodes(&self, filter: &NodeFilter) -> SpecularResult<Vec<Node>>;
    async fn update_node(&self, id: &str, update: NodeUpdate) -> SpecularResult<Node>;
    /// Cascades to the node's edges, position, and discrepancies.
    async fn delete_node(&self, id: &str) -> SpecularResult<()>;

    /// Write exactly the verification columns; everything else (label,
    /// truth, properties) is preserved.
    async fn update_node_verification(
        &self,
        id: &str,
        status: NodeStatus,
        last_verified: Option<DateTime<Utc>>,
        last_seen: Option<DateTime<Utc>>,
        discovered: PropertyMap,
    ) -> SpecularResult<()>;

    /// Per-node check-then-set: the label is written only if it differs.
    async fn update_node_label(&self, id: &str, label: &str) -> SpecularResult<()>;

    /// True iff the node carries operator truth for `hostname`.
    async fn has_operator_truth_hostname(&self, id: &str) -> SpecularResult<bool>;

    // Truth
    /// Sets both `truth` and `truth_status = asserted`.
    async fn set_node_truth(&self, id: &str, truth: NodeTruth) -> SpecularResult<Node>;
    /// Resets `truth_status = none` and `has_discrepancy = false`.
    async fn clear_node_truth(&self, id: &str) -> SpecularResult<Node>;

    // Edges
    async fn create_edge(&self, edge: Edge) -> SpecularResult<Edge>;
    async fn get_edge(&self, id: &str) -> SpecularResult<Option<Edge>>;
    async fn list_edges(&self, filter: &EdgeFilter) -> SpecularResult<Vec<Edge>>;
    async fn update_edge(&self, id: &str, update: EdgeUpdate) -> SpecularResult<Edge>;
    async fn delete_edge(&self, id: &str) -> SpecularResult<()>;

    // Positions
    async fn upsert_position(&self, position: NodePosition) -> SpecularResult<NodePosition>;
    async fn get_position(&self, node_id: &str) -> SpecularResult<Option<NodePosition>>;
    async fn list_positions(&self) -> SpecularResult<Vec<NodePosition>>;

    // Discrepancies
    /// Also sets the node's `has_discrepancy = true`. Rejects a second
    /// unresolved discrepancy for the same `(node_id, property_key)`.
    async fn create_discrepancy(&self, discrepancy: Discrepancy) -> SpecularResult<Discrepancy>;
    async fn get_discrepancy(&self, id: &str) -> SpecularResult<Option<Discrepancy>>;
    async fn list_discrepancies(
        &self,
        filter: &DiscrepancyFilter,
    ) -> SpecularResult<Vec<Discrepancy>>;
    /// Sets `resolved_at` and `resolution`, then recomputes the affected
    /// node's `has_discrepancy` flag.
    async fn resolve_discrepancy(
        &self,
        id: &str,
        resolution: Resolution,
    ) -> SpecularResult<Discrepancy>;

    /// Fold `source_id` into `target_id`: edges are rewired to the target
    /// (rewirings that would self-loop are dropped), missing properties,
    /// discovered values, truth, and position carry over, and the source
    /// node is deleted with its remaining dependents. Returns the merged
    /// target.
    async fn merge_nodes(&self, target_id: &str, source_id: &str) -> SpecularResult<Node>;

    // Bulk
    /// Atomic: on failure nothing is persisted.
    async fn import_fragment(
        &self,
        fragment: GraphFragment,
        strategy: ImportStrategy,
    ) -> SpecularResult<ImportStats>;
    async fn export_graph(&self) -> SpecularResult<GraphExport>;
    /// Removes all graph objects.
    async fn clear_graph(&self) -> SpecularResult<()>;
}
