/// Durable graph store.
///
/// `GraphStore` is the shipped [`Repository`] implementation: the full
/// graph lives in memory behind one `RwLock`, and every mutation is
/// followed by a snapshot of the whole state to a single JSON file. The
/// snapshot is written to a temp file and renamed into place, so a crash
/// mid-write never corrupts the database; on startup the snapshot is
/// replayed into memory. This also makes `import_fragment` atomic: the
/// fragment is validated before any state is touched.
///
/// Referential constraints live here: edge endpoints must exist, deleting
/// a node cascades to its edges, position, and discrepancies, and the
/// `has_discrepancy` flag is recomputed whenever the unresolved set for a
/// node changes.
use crate::error::{SpecularError, SpecularResult};
use crate::repository::{
    DiscrepancyFilter, EdgeFilter, EdgeUpdate, ImportStats, NodeFilter, NodeUpdate, Repository,
};
use crate::types::{
    Discrepancy, Edge, GraphExport, GraphFragment, ImportStrategy, Node, NodePosition, NodeStatus,
    NodeTruth, PropertyMap, Resolution, TruthStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot of the whole graph.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    positions: Vec<NodePosition>,
    discrepancies: Vec<Discrepancy>,
}

/// In-memory graph state. All compound invariants are maintained while the
/// write lock is held.
#[derive(Debug, Default)]
struct GraphState {
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<String, Edge>,
    positions: BTreeMap<String, NodePosition>,
    discrepancies: BTreeMap<String, Discrepancy>,
}

impl GraphState {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            nodes: snapshot.nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            edges: snapshot.edges.into_iter().map(|e| (e.id.clone(), e)).collect(),
            positions: snapshot
                .positions
                .into_iter()
                .map(|p| (p.node_id.clone(), p))
                .collect(),
            discrepancies: snapshot
                .discrepancies
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
            positions: self.positions.values().cloned().collect(),
            discrepancies: self.discrepancies.values().cloned().collect(),
        }
    }

    /// Recompute a node's `has_discrepancy` flag from the unresolved set.
    fn recompute_discrepancy_flag(&mut self, node_id: &str) {
        let has_unresolved = self
            .discrepancies
            .values()
            .any(|d| d.node_id == node_id && d.is_unresolved());
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.has_discrepancy = has_unresolved;
        }
    }

    fn unresolved_exists(&self, node_id: &str, property_key: &str) -> bool {
        self.discrepancies
            .values()
            .any(|d| d.node_id == node_id && d.property_key == property_key && d.is_unresolved())
    }

    /// Remove a node and everything that hangs off it.
    fn cascade_delete_node(&mut self, id: &str) {
        self.nodes.remove(id);
        self.edges.retain(|_, e| e.from_id != id && e.to_id != id);
        self.positions.remove(id);
        self.discrepancies.retain(|_, d| d.node_id != id);
    }
}

/// The shipped repository implementation.
pub struct GraphStore {
    state: RwLock<GraphState>,
    /// Snapshot target; `None` disables persistence (tests).
    path: Option<PathBuf>,
    /// Serializes snapshot writes so a newer state is never overwritten by
    /// an older one.
    io_lock: Mutex<()>,
}

impl GraphStore {
    /// Open a store backed by the given database file, loading the
    /// existing snapshot when there is one.
    pub async fn open(path: impl AsRef<Path>) -> SpecularResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                tracing::info!(
                    path = %path.display(),
                    nodes = snapshot.nodes.len(),
                    edges = snapshot.edges.len(),
                    "loaded graph snapshot"
                );
                GraphState::from_snapshot(snapshot)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => GraphState::default(),
            Err(err) => {
                return Err(SpecularError::Storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    err
                )))
            }
        };

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            io_lock: Mutex::new(()),
        })
    }

    /// A store with persistence disabled; state lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            path: None,
            io_lock: Mutex::new(()),
        }
    }

    /// Snapshot the current state to disk (temp file + rename).
    async fn persist(&self) -> SpecularResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let _guard = self.io_lock.lock().await;

        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec(&state.to_snapshot())?
        };

        let tmp = path.with_extension("db.tmp");
        fs::write(&tmp, &bytes).await.map_err(|e| {
            SpecularError::Storage(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, path).await.map_err(|e| {
            SpecularError::Storage(format!("failed to rename snapshot into place: {}", e))
        })?;
        Ok(())
    }
}

#[async_trait]
impl Repository for GraphStore {
    async fn create_node(&self, node: Node) -> SpecularResult<Node> {
        {
            let mut state = self.state.write().await;
            if state.nodes.contains_key(&node.id) {
                return Err(SpecularError::Conflict {
                    kind: "node",
                    id: node.id,
                });
            }
            state.nodes.insert(node.id.clone(), node.clone());
        }
        self.persist().await?;
        Ok(node)
    }

    async fn get_node(&self, id: &str) -> SpecularResult<Option<Node>> {
        Ok(self.state.read().await.nodes.get(id).cloned())
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> SpecularResult<Vec<Node>> {
        Ok(self
            .state
            .read()
            .await
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect())
    }

    async fn update_node(&self, id: &str, update: NodeUpdate) -> SpecularResult<Node> {
        let node = {
            let mut state = self.state.write().await;
            let node = state
                .nodes
                .get_mut(id)
                .ok_or_else(|| SpecularError::node_not_found(id))?;
            if let Some(node_type) = update.node_type {
                node.node_type = node_type;
            }
            if let Some(label) = update.label {
                node.label = label;
            }
            if let Some(parent_id) = update.parent_id {
                node.parent_id = parent_id;
            }
            if let Some(status) = update.status {
                node.status = status;
            }
            if let Some(properties) = update.properties {
                node.properties = properties;
            }
            if let Some(capabilities) = update.capabilities {
                node.capabilities = capabilities;
            }
            node.updated_at = Utc::now();
            node.clone()
        };
        self.persist().await?;
        Ok(node)
    }

    async fn delete_node(&self, id: &str) -> SpecularResult<()> {
        {
            let mut state = self.state.write().await;
            if !state.nodes.contains_key(id) {
                return Err(SpecularError::node_not_found(id));
            }
            state.cascade_delete_node(id);
        }
        self.persist().await?;
        Ok(())
    }

    async fn update_node_verification(
        &self,
        id: &str,
        status: NodeStatus,
        last_verified: Option<DateTime<Utc>>,
        last_seen: Option<DateTime<Utc>>,
        discovered: PropertyMap,
    ) -> SpecularResult<()> {
        {
            let mut state = self.state.write().await;
            let node = state
                .nodes
                .get_mut(id)
                .ok_or_else(|| SpecularError::node_not_found(id))?;
            node.status = status;
            if last_verified.is_some() {
                node.last_verified = last_verified;
            }
            if last_seen.is_some() {
                node.last_seen = last_seen;
            }
            node.discovered = discovered;
            node.updated_at = Utc::now();
        }
        self.persist().await?;
        Ok(())
    }

    async fn update_node_label(&self, id: &str, label: &str) -> SpecularResult<()> {
        let changed = {
            let mut state = self.state.write().await;
            let node = state
                .nodes
                .get_mut(id)
                .ok_or_else(|| SpecularError::node_not_found(id))?;
            if node.label == label {
                false
            } else {
                node.label = label.to_string();
                node.updated_at = Utc::now();
                true
            }
        };
        if changed {
            self.persist().await?;
        }
        Ok(())
    }

    async fn has_operator_truth_hostname(&self, id: &str) -> SpecularResult<bool> {
        let state = self.state.read().await;
        let node = state
            .nodes
            .get(id)
            .ok_or_else(|| SpecularError::node_not_found(id))?;
        Ok(node
            .truth
            .as_ref()
            .is_some_and(|t| t.properties.contains_key("hostname")))
    }

    async fn set_node_truth(&self, id: &str, truth: NodeTruth) -> SpecularResult<Node> {
        let node = {
            let mut state = self.state.write().await;
            let node = state
                .nodes
                .get_mut(id)
                .ok_or_else(|| SpecularError::node_not_found(id))?;
            node.truth = Some(truth);
            node.truth_status = TruthStatus::Asserted;
            node.updated_at = Utc::now();
            node.clone()
        };
        self.persist().await?;
        Ok(node)
    }

    async fn clear_node_truth(&self, id: &str) -> SpecularResult<Node> {
        let node = {
            let mut state = self.state.write().await;
            let node = state
                .nodes
                .get_mut(id)
                .ok_or_else(|| SpecularError::node_not_found(id))?;
            node.truth = None;
            node.truth_status = TruthStatus::None;
            node.has_discrepancy = false;
            node.updated_at = Utc::now();
            node.clone()
        };
        self.persist().await?;
        Ok(node)
    }

    async fn create_edge(&self, edge: Edge) -> SpecularResult<Edge> {
        {
            let mut state = self.state.write().await;
            if edge.from_id == edge.to_id {
                return Err(SpecularError::validation("edge endpoints must differ"));
            }
            if !state.nodes.contains_key(&edge.from_id) {
                return Err(SpecularError::validation(format!(
                    "edge endpoint '{}' does not exist",
                    edge.from_id
                )));
            }
            if !state.nodes.contains_key(&edge.to_id) {
                return Err(SpecularError::validation(format!(
                    "edge endpoint '{}' does not exist",
                    edge.to_id
                )));
            }
            if state.edges.contains_key(&edge.id) {
                return Err(SpecularError::Conflict {
                    kind: "edge",
                    id: edge.id,
                });
            }
            state.edges.insert(edge.id.clone(), edge.clone());
        }
        self.persist().await?;
        Ok(edge)
    }

    async fn get_edge(&self, id: &str) -> SpecularResult<Option<Edge>> {
        Ok(self.state.read().await.edges.get(id).cloned())
    }

    async fn list_edges(&self, filter: &EdgeFilter) -> SpecularResult<Vec<Edge>> {
        Ok(self
            .state
            .read()
            .await
            .edges
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn update_edge(&self, id: &str, update: EdgeUpdate) -> SpecularResult<Edge> {
        let edge = {
            let mut state = self.state.write().await;
            let edge = state.edges.get_mut(id).ok_or(SpecularError::NotFound {
                kind: "edge",
                id: id.to_string(),
            })?;
            if let Some(edge_type) = update.edge_type {
                edge.edge_type = edge_type;
            }
            if let Some(properties) = update.properties {
                edge.properties = properties;
            }
            edge.clone()
        };
        self.persist().await?;
        Ok(edge)
    }

    async fn delete_edge(&self, id: &str) -> SpecularResult<()> {
        {
            let mut state = self.state.write().await;
            if state.edges.remove(id).is_none() {
                return Err(SpecularError::NotFound {
                    kind: "edge",
                    id: id.to_string(),
                });
            }
        }
        self.persist().await?;
        Ok(())
    }

    async fn upsert_position(&self, position: NodePosition) -> SpecularResult<NodePosition> {
        {
            let mut state = self.state.write().await;
            if !state.nodes.contains_key(&position.node_id) {
                return Err(SpecularError::node_not_found(&position.node_id));
            }
            state
                .positions
                .insert(position.node_id.clone(), position.clone());
        }
        self.persist().await?;
        Ok(position)
    }

    async fn get_position(&self, node_id: &str) -> SpecularResult<Option<NodePosition>> {
        Ok(self.state.read().await.positions.get(node_id).cloned())
    }

    async fn list_positions(&self) -> SpecularResult<Vec<NodePosition>> {
        Ok(self.state.read().await.positions.values().cloned().collect())
    }

    async fn create_discrepancy(&self, discrepancy: Discrepancy) -> SpecularResult<Discrepancy> {
        {
            let mut state = self.state.write().await;
            if !state.nodes.contains_key(&discrepancy.node_id) {
                return Err(SpecularError::node_not_found(&discrepancy.node_id));
            }
            if state.unresolved_exists(&discrepancy.node_id, &discrepancy.property_key) {
                return Err(SpecularError::Conflict {
                    kind: "discrepancy",
                    id: format!("{}/{}", discrepancy.node_id, discrepancy.property_key),
                });
            }
            state
                .discrepancies
                .insert(discrepancy.id.clone(), discrepancy.clone());
            state.recompute_discrepancy_flag(&discrepancy.node_id);
        }
        self.persist().await?;
        Ok(discrepancy)
    }

    async fn get_discrepancy(&self, id: &str) -> SpecularResult<Option<Discrepancy>> {
        Ok(self.state.read().await.discrepancies.get(id).cloned())
    }

    async fn list_discrepancies(
        &self,
        filter: &DiscrepancyFilter,
    ) -> SpecularResult<Vec<Discrepancy>> {
        Ok(self
            .state
            .read()
            .await
            .discrepancies
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn resolve_discrepancy(
        &self,
        id: &str,
        resolution: Resolution,
    ) -> SpecularResult<Discrepancy> {
        let resolved = {
            let mut state = self.state.write().await;
            let discrepancy = state.discrepancies.get_mut(id).ok_or(SpecularError::NotFound {
                kind: "discrepancy",
                id: id.to_string(),
            })?;
            if !discrepancy.is_unresolved() {
                return Err(SpecularError::Conflict {
                    kind: "discrepancy",
                    id: id.to_string(),
                });
            }
            discrepancy.resolved_at = Some(Utc::now());
            discrepancy.resolution = Some(resolution);
            let resolved = discrepancy.clone();
            state.recompute_discrepancy_flag(&resolved.node_id);
            resolved
        };
        self.persist().await?;
        Ok(resolved)
    }

    async fn merge_nodes(&self, target_id: &str, source_id: &str) -> SpecularResult<Node> {
        let merged = {
            let mut state = self.state.write().await;
            if target_id == source_id {
                return Err(SpecularError::validation("cannot merge a node into itself"));
            }
            if !state.nodes.contains_key(target_id) {
                return Err(SpecularError::node_not_found(target_id));
            }
            let Some(source) = state.nodes.get(source_id).cloned() else {
                return Err(SpecularError::node_not_found(source_id));
            };

            // Rewire edges; a rewiring that would self-loop disappears.
            let mut rewired: Vec<Edge> = Vec::new();
            state.edges.retain(|_, edge| {
                let touches_source = edge.from_id == source_id || edge.to_id == source_id;
                if !touches_source {
                    return true;
                }
                let mut edge = edge.clone();
                if edge.from_id == source_id {
                    edge.from_id = target_id.to_string();
                }
                if edge.to_id == source_id {
                    edge.to_id = target_id.to_string();
                }
                if edge.from_id != edge.to_id {
                    rewired.push(edge);
                }
                false
            });
            for edge in rewired {
                state.edges.insert(edge.id.clone(), edge);
            }

            let source_position = state.positions.get(source_id).cloned();

            {
                let target = state
                    .nodes
                    .get_mut(target_id)
                    .ok_or_else(|| SpecularError::node_not_found(target_id))?;
                for (key, value) in &source.properties {
                    target.properties.entry(key.clone()).or_insert_with(|| value.clone());
                }
                for (key, value) in &source.discovered {
                    target.discovered.entry(key.clone()).or_insert_with(|| value.clone());
                }
                for capability in &source.capabilities {
                    if !target.capabilities.contains(capability) {
                        target.capabilities.push(capability.clone());
                    }
                }
                if target.parent_id.is_none() {
                    target.parent_id = source.parent_id.clone();
                }
                if target.truth.is_none() {
                    if let Some(truth) = source.truth.clone() {
                        target.truth = Some(truth);
                        target.truth_status = TruthStatus::Asserted;
                    }
                }
                if target.last_seen < source.last_seen {
                    target.last_seen = source.last_seen;
                }
                if target.last_verified < source.last_verified {
                    target.last_verified = source.last_verified;
                }
                target.updated_at = Utc::now();
            }
            if !state.positions.contains_key(target_id) {
                if let Some(mut position) = source_position {
                    position.node_id = target_id.to_string();
                    state.positions.insert(target_id.to_string(), position);
                }
            }

            state.cascade_delete_node(source_id);
            state.recompute_discrepancy_flag(target_id);
            state
                .nodes
                .get(target_id)
                .cloned()
                .ok_or_else(|| SpecularError::node_not_found(target_id))?
        };
        self.persist().await?;
        Ok(merged)
    }

    async fn import_fragment(
        &self,
        fragment: GraphFragment,
        strategy: ImportStrategy,
    ) -> SpecularResult<ImportStats> {
        let stats = {
            let mut state = self.state.write().await;

            // Validate the whole fragment before touching anything.
            let mut known: std::collections::BTreeSet<&str> = match strategy {
                ImportStrategy::Merge => state.nodes.keys().map(String::as_str).collect(),
                ImportStrategy::Replace => std::collections::BTreeSet::new(),
            };
            for node in &fragment.nodes {
                if node.id.is_empty() {
                    return Err(SpecularError::validation("imported node with empty id"));
                }
                known.insert(node.id.as_str());
            }
            for edge in &fragment.edges {
                if edge.from_id == edge.to_id {
                    return Err(SpecularError::validation(format!(
                        "imported edge '{}' is a self-loop",
                        edge.id
                    )));
                }
                if !known.contains(edge.from_id.as_str()) || !known.contains(edge.to_id.as_str()) {
                    return Err(SpecularError::validation(format!(
                        "imported edge '{}' references an unknown node",
                        edge.id
                    )));
                }
            }

            if strategy == ImportStrategy::Replace {
                state.nodes.clear();
                state.edges.clear();
                state.positions.clear();
                state.discrepancies.clear();
            }

            let stats = ImportStats {
                nodes: fragment.nodes.len(),
                edges: fragment.edges.len(),
            };
            for node in fragment.nodes {
                match state.nodes.get_mut(&node.id) {
                    // Merge keeps runtime columns, takes declarative ones.
                    Some(existing) => {
                        existing.node_type = node.node_type;
                        existing.label = node.label;
                        existing.parent_id = node.parent_id;
                        existing.properties = node.properties;
                        existing.capabilities = node.capabilities;
                        existing.updated_at = Utc::now();
                    }
                    None => {
                        state.nodes.insert(node.id.clone(), node);
                    }
                }
            }
            for edge in fragment.edges {
                state.edges.insert(edge.id.clone(), edge);
            }
            stats
        };
        self.persist().await?;
        Ok(stats)
    }

    async fn export_graph(&self) -> SpecularResult<GraphExport> {
        let state = self.state.read().await;
        Ok(GraphExport {
            nodes: state.nodes.values().cloned().collect(),
            edges: state.edges.values().cloned().collect(),
            positions: state.positions.values().cloned().collect(),
        })
    }

    async fn clear_graph(&self) -> SpecularResult<()> {
        {
            let mut state = self.state.write().await;
            state.nodes.clear();
            state.edges.clear();
            state.positions.clear();
            state.discrepancies.clear();
        }
        self.persist().await?;
        Ok(())
    }
}
