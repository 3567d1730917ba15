/// Core data model for the network graph.
///
/// This module defines the persistent objects (nodes, edges, positions,
/// truth, discrepancies) and the transport objects (fragments, hostname
/// inference) that flow between adapters, the reconciler, and the store.
///
/// Dynamic payloads (`properties`, `discovered`) are heterogeneous maps of
/// JSON values: string | i64 | f64 | bool | list | map. They are compared
/// through the normalization rules in [`crate::values`], never through raw
/// in-memory representations.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::net::{IpAddr, Ipv4Addr};

/// Heterogeneous string → JSON value map used by `properties`, `discovered`
/// and truth assertions.
pub type PropertyMap = serde_json::Map<String, JsonValue>;

/// The key under which adapters embed hostname inference in `discovered`.
pub const HOSTNAME_INFERENCE_KEY: &str = "hostname_inference";

/// Verification state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Known but never probed.
    #[default]
    Unverified,
    /// A probe is currently in flight.
    Verifying,
    /// The last probe reached the node.
    Verified,
    /// The last probe failed to reach the node.
    Unreachable,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Unverified => "unverified",
            NodeStatus::Verifying => "verifying",
            NodeStatus::Verified => "verified",
            NodeStatus::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

/// Whether an operator has asserted truth for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TruthStatus {
    /// No assertion on record.
    #[default]
    None,
    /// An operator assertion is active.
    Asserted,
}

/// Kind of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Server,
    Switch,
    Router,
    Interface,
    Client,
    Gateway,
    Subnet,
    #[default]
    Unknown,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::Server => "server",
            NodeType::Switch => "switch",
            NodeType::Router => "router",
            NodeType::Interface => "interface",
            NodeType::Client => "client",
            NodeType::Gateway => "gateway",
            NodeType::Subnet => "subnet",
            NodeType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Kind of a graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    Physical,
    Logical,
    Wireless,
    Virtual,
    #[default]
    Unknown,
}

/// How an operator closed out a discrepancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The truth record was wrong and has been corrected.
    UpdatedTruth,
    /// The network was wrong and has been fixed.
    FixedReality,
    /// Acknowledged without action.
    Dismissed,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Resolution::UpdatedTruth => "updated_truth",
            Resolution::FixedReality => "fixed_reality",
            Resolution::Dismissed => "dismissed",
        };
        write!(f, "{}", s)
    }
}

/// Strategy for applying an imported fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImportStrategy {
    /// Upsert into the existing graph.
    #[default]
    Merge,
    /// Clear the graph, then insert.
    Replace,
}

/// An operator truth assertion attached to a node.
///
/// Truth covers a subset of a node's logical property set; only keys in
/// [`crate::truth::TRUTHABLE_KEYS`] may appear in `properties`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTruth {
    /// Who made the assertion.
    pub asserted_by: String,
    /// When the assertion was made.
    pub asserted_at: DateTime<Utc>,
    /// The asserted key → value pairs.
    pub properties: PropertyMap,
}

/// A node in the network graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier, typically derived from the primary IP with
    /// dots replaced by dashes. Immutable after creation.
    pub id: String,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    /// Human-readable name shown in the UI.
    #[serde(default)]
    pub label: String,
    /// Optional owning node (interface-of-host).
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Which adapter or operator created this node.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub status: NodeStatus,
    /// Operator-settable properties (ip, role, segmentum, ...).
    #[serde(default)]
    pub properties: PropertyMap,
    /// Adapter-produced observations (hostname, os, ports, inference).
    #[serde(default)]
    pub discovered: PropertyMap,
    #[serde(default)]
    pub truth: Option<NodeTruth>,
    #[serde(default)]
    pub truth_status: TruthStatus,
    /// Derived: true iff at least one unresolved discrepancy references
    /// this node.
    #[serde(default)]
    pub has_discrepancy: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub last_verified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a node with the given identity and defaults everywhere else.
    pub fn new(id: impl Into<String>, node_type: NodeType, label: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            node_type,
            label: label.into(),
            parent_id: None,
            source: String::new(),
            status: NodeStatus::Unverified,
            properties: PropertyMap::new(),
            discovered: PropertyMap::new(),
            truth: None,
            truth_status: TruthStatus::None,
            has_discrepancy: false,
            capabilities: Vec::new(),
            last_verified: None,
            last_seen: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the creating source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the verification status.
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Add an operator-settable property.
    pub fn with_property(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Add a discovered observation.
    pub fn with_discovered(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.discovered.insert(key.into(), value);
        self
    }

    /// The node's primary IP, if one is known.
    ///
    /// Operator-set `properties.ip` wins over `discovered.ip`.
    pub fn primary_ip(&self) -> Option<&str> {
        self.properties
            .get("ip")
            .or_else(|| self.discovered.get("ip"))
            .and_then(|v| v.as_str())
    }
}

/// A link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    #[serde(rename = "type", default)]
    pub edge_type: EdgeType,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        edge_type: EdgeType,
    ) -> Self {
        Self {
            id: id.into(),
            from_id: from_id.into(),
            to_id: to_id.into(),
            edge_type,
            properties: PropertyMap::new(),
        }
    }
}

/// UI placement of a node. One per node; lifetime tied to the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub node_id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub pinned: bool,
}

/// A recorded disagreement between asserted truth and observed reality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: String,
    pub node_id: String,
    pub property_key: String,
    pub truth_value: JsonValue,
    pub actual_value: JsonValue,
    /// The adapter that produced the conflicting observation.
    pub source: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl Discrepancy {
    /// True while the disagreement has not been closed out.
    pub fn is_unresolved(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// A transport bag of nodes and edges produced by an adapter or importer.
///
/// Fragments are never persisted; they are consumed by the reconciler or
/// the import path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphFragment {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// A full graph as handed to codecs for export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphExport {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub positions: Vec<NodePosition>,
}

/// One ranked hostname candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostnameCandidate {
    pub hostname: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Where the candidate came from (dns, snmp, mdns, ...).
    pub source: String,
}

/// Confidence-ranked hostname candidates embedded under
/// `discovered.hostname_inference`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HostnameInference {
    #[serde(default)]
    pub candidates: Vec<HostnameCandidate>,
    #[serde(default)]
    pub best: Option<HostnameCandidate>,
}

impl HostnameInference {
    /// Extract an inference from a dynamic map value.
    ///
    /// Accepts both shapes the value can arrive in: the typed struct
    /// serialized in-process, or a nested map deserialized from JSON.
    pub fn from_value(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Look up and extract the inference from a `discovered` map.
    pub fn from_discovered(discovered: &PropertyMap) -> Option<Self> {
        discovered.get(HOSTNAME_INFERENCE_KEY).and_then(Self::from_value)
    }

    /// Convert to the dynamic form for embedding in `discovered`.
    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Derive a stable node id from an IP address: dots (and colons, for
/// IPv6) become dashes.
pub fn node_id_from_ip(ip: &IpAddr) -> String {
    ip.to_string().replace(['.', ':'], "-")
}

/// The /24 block an IPv4 address belongs to, e.g. `10.0.3.0/24`.
pub fn segmentum_for(ip: &Ipv4Addr) -> String {
    let octets = ip.octets();
    format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
}

/// First DNS label of a hostname, lowercased.
///
/// `"Prod-DB-01.corp.example"` becomes `"prod-db-01"`. Returns an empty
/// string for an empty input.
pub fn extract_short_name(hostname: &str) -> String {
    hostname
        .split('.')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_defaults() {
        let node = Node::new("10-0-0-5", NodeType::Server, "web");
        assert_eq!(node.status, NodeStatus::Unverified);
        assert_eq!(node.truth_status, TruthStatus::None);
        assert!(!node.has_discrepancy);
        assert!(node.truth.is_none());
    }

    #[test]
    fn test_node_id_from_ip() {
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(node_id_from_ip(&ip), "10-0-0-5");

        let ip6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(node_id_from_ip(&ip6), "fe80--1");
    }

    #[test]
    fn test_segmentum() {
        let ip: Ipv4Addr = "192.168.4.77".parse().unwrap();
        assert_eq!(segmentum_for(&ip), "192.168.4.0/24");
    }

    #[test]
    fn test_extract_short_name() {
        assert_eq!(extract_short_name("Prod-DB-01.corp.example"), "prod-db-01");
        assert_eq!(extract_short_name("plain"), "plain");
        assert_eq!(extract_short_name(""), "");
    }

    #[test]
    fn test_primary_ip_prefers_properties() {
        let node = Node::new("n1", NodeType::Server, "n1")
            .with_property("ip", json!("10.0.0.1"))
            .with_discovered("ip", json!("10.0.0.2"));
        assert_eq!(node.primary_ip(), Some("10.0.0.1"));
    }

    #[test]
    fn test_inference_extractor_accepts_both_shapes() {
        let typed = HostnameInference {
            candidates: vec![HostnameCandidate {
                hostname: "web01.corp".to_string(),
                confidence: 0.9,
                source: "dns".to_string(),
            }],
            best: Some(HostnameCandidate {
                hostname: "web01.corp".to_string(),
                confidence: 0.9,
                source: "dns".to_string(),
            }),
        };

        // In-process path: typed struct serialized into the map.
        let from_typed = HostnameInference::from_value(&typed.to_value()).unwrap();
        assert_eq!(from_typed, typed);

        // Wire path: a nested map straight from JSON.
        let raw = json!({
            "candidates": [
                {"hostname": "web01.corp", "confidence": 0.9, "source": "dns"}
            ],
            "best": {"hostname": "web01.corp", "confidence": 0.9, "source": "dns"}
        });
        let from_raw = HostnameInference::from_value(&raw).unwrap();
        assert_eq!(from_raw, typed);
    }

    #[test]
    fn test_node_json_round_trip_is_stable() {
        let node = Node::new("10-0-0-5", NodeType::Server, "web")
            .with_source("verifier")
            .with_property("ip", json!("10.0.0.5"))
            .with_discovered("hostname", json!("web01"));

        let first = serde_json::to_string(&node).unwrap();
        let decoded: Node = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&decoded).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_node_type_defaults_to_unknown() {
        let node: Node =
            serde_json::from_value(json!({"id": "x", "label": "x"})).unwrap();
        assert_eq!(node.node_type, NodeType::Unknown);
    }

    #[test]
    fn test_unrecognized_node_type_is_rejected() {
        let result: Result<Node, _> =
            serde_json::from_value(json!({"id": "x", "type": "toaster", "label": "x"}));
        assert!(result.is_err());
    }
}
