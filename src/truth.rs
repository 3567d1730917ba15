/// Truth assertions and discrepancy lifecycle.
///
/// Operators can declare authoritative values for a subset of a node's
/// properties. Discovery keeps running regardless; when an observation
/// disagrees with an assertion, the service records a [`Discrepancy`]
/// instead of overwriting either side. Correcting the truth to match
/// reality auto-resolves the matching discrepancies.
use crate::error::{SpecularError, SpecularResult};
use crate::events::{Event, EventBus};
use crate::repository::{DiscrepancyFilter, Repository};
use crate::types::{Discrepancy, Node, NodeTruth, PropertyMap, Resolution};
use crate::values::compare_values;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Property keys an operator may assert truth for.
pub const TRUTHABLE_KEYS: &[&str] = &["hostname", "ip", "mac", "role", "label", "segmentum", "os"];

/// Assert/clear truth, compare discovered values against it, and manage
/// discrepancy records.
pub struct TruthService {
    repo: Arc<dyn Repository>,
    bus: Arc<EventBus>,
}

impl TruthService {
    pub fn new(repo: Arc<dyn Repository>, bus: Arc<EventBus>) -> Self {
        Self { repo, bus }
    }

    /// Assert truth for a node.
    ///
    /// Rejects keys outside [`TRUTHABLE_KEYS`]. Unresolved discrepancies
    /// whose observed value now equals the new assertion are auto-resolved
    /// with `updated_truth`. Emits `truth-set` (and `discrepancy-resolved`
    /// for each auto-resolution).
    pub async fn set_truth(
        &self,
        node_id: &str,
        properties: PropertyMap,
        operator: &str,
    ) -> SpecularResult<Node> {
        if self.repo.get_node(node_id).await?.is_none() {
            return Err(SpecularError::node_not_found(node_id));
        }
        for key in properties.keys() {
            if !TRUTHABLE_KEYS.contains(&key.as_str()) {
                return Err(SpecularError::validation(format!(
                    "'{}' is not a truthable property",
                    key
                )));
            }
        }
        if properties.is_empty() {
            return Err(SpecularError::validation("truth requires at least one property"));
        }

        let truth = NodeTruth {
            asserted_by: operator.to_string(),
            asserted_at: Utc::now(),
            properties: properties.clone(),
        };
        self.repo.set_node_truth(node_id, truth).await?;

        // The new assertion may agree with what discovery already reported;
        // those disagreements are no longer real.
        let unresolved = self
            .repo
            .list_discrepancies(&DiscrepancyFilter {
                node_id: Some(node_id.to_string()),
                unresolved_only: true,
            })
            .await?;
        for d in unresolved {
            let Some(asserted) = properties.get(&d.property_key) else {
                continue;
            };
            if compare_values(asserted, &d.actual_value) {
                let resolved = self
                    .repo
                    .resolve_discrepancy(&d.id, Resolution::UpdatedTruth)
                    .await?;
                tracing::info!(
                    node = node_id,
                    key = %d.property_key,
                    "discrepancy auto-resolved by truth update"
                );
                self.bus.publish(Event::discrepancy_resolved(&resolved));
            }
        }

        let node = self
            .repo
            .get_node(node_id)
            .await?
            .ok_or_else(|| SpecularError::node_not_found(node_id))?;
        self.bus.publish(Event::truth_set(&node));
        Ok(node)
    }

    /// Clear a node's truth assertion.
    ///
    /// Discrepancy rows are historical records and stay, but the node's
    /// `has_discrepancy` flag is reset. Emits `truth-cleared`.
    pub async fn clear_truth(&self, node_id: &str) -> SpecularResult<Node> {
        let node = self.repo.clear_node_truth(node_id).await?;
        self.bus.publish(Event::truth_cleared(&node));
        Ok(node)
    }

    /// Compare a discovery observation against the node's truth.
    ///
    /// For each asserted key the observed value is taken from `discovered`,
    /// falling back to the node's operator-set `properties` (so operator-set
    /// IPs still participate). Keys not observed anywhere are skipped. Each
    /// disagreement creates at most one unresolved discrepancy per
    /// `(node, key)` and emits `discrepancy-created`.
    pub async fn check_discrepancies(
        &self,
        node_id: &str,
        discovered: &PropertyMap,
        source: &str,
    ) -> SpecularResult<Vec<Discrepancy>> {
        let Some(node) = self.repo.get_node(node_id).await? else {
            return Err(SpecularError::node_not_found(node_id));
        };
        let Some(truth) = node.truth.as_ref() else {
            return Ok(Vec::new());
        };

        let unresolved = self
            .repo
            .list_discrepancies(&DiscrepancyFilter {
                node_id: Some(node_id.to_string()),
                unresolved_only: true,
            })
            .await?;

        let mut created = Vec::new();
        for (key, truth_value) in &truth.properties {
            let actual = discovered.get(key).or_else(|| node.properties.get(key));
            let Some(actual) = actual else {
                // Not yet observed anywhere.
                continue;
            };
            if compare_values(truth_value, actual) {
                continue;
            }
            if unresolved.iter().any(|d| &d.property_key == key) {
                // Already on record; do not spam.
                continue;
            }

            let discrepancy = Discrepancy {
                id: Uuid::new_v4().to_string(),
                node_id: node_id.to_string(),
                property_key: key.clone(),
                truth_value: truth_value.clone(),
                actual_value: actual.clone(),
                source: source.to_string(),
                detected_at: Utc::now(),
                resolved_at: None,
                resolution: None,
            };
            match self.repo.create_discrepancy(discrepancy).await {
                Ok(d) => {
                    tracing::info!(node = node_id, key = %d.property_key, "discrepancy detected");
                    self.bus.publish(Event::discrepancy_created(&d));
                    created.push(d);
                }
                // A concurrent checker won the race; the invariant holds.
                Err(SpecularError::Conflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(created)
    }

    pub async fn list_discrepancies(
        &self,
        filter: &DiscrepancyFilter,
    ) -> SpecularResult<Vec<Discrepancy>> {
        self.repo.list_discrepancies(filter).await
    }

    pub async fn get_discrepancy(&self, id: &str) -> SpecularResult<Option<Discrepancy>> {
        self.repo.get_discrepancy(id).await
    }

    /// Close out a discrepancy with an audit label. Emits
    /// `discrepancy-resolved`.
    pub async fn resolve_discrepancy(
        &self,
        id: &str,
        resolution: Resolution,
    ) -> SpecularResult<Discrepancy> {
        let resolved = self.repo.resolve_discrepancy(id, resolution).await?;
        self.bus.publish(Event::discrepancy_resolved(&resolved));
        Ok(resolved)
    }
}
