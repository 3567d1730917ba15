/// JSON codec. Scan results arrive in this shape too, so `scan` imports
/// route here.
use super::GraphCodec;
use crate::error::{SpecularError, SpecularResult};
use crate::types::{GraphExport, GraphFragment};

pub struct JsonCodec;

impl GraphCodec for JsonCodec {
    fn format(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn file_extension(&self) -> &'static str {
        "json"
    }

    fn decode(&self, text: &str) -> SpecularResult<GraphFragment> {
        // Accepts both the bare fragment shape and a full export; the
        // positions of an export are not part of a fragment.
        let export: GraphExport = serde_json::from_str(text)
            .map_err(|e| SpecularError::validation(format!("bad JSON topology: {}", e)))?;
        Ok(GraphFragment {
            nodes: export.nodes,
            edges: export.edges,
        })
    }

    fn encode(&self, export: &GraphExport) -> SpecularResult<String> {
        Ok(serde_json::to_string_pretty(export)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Edge, EdgeType, Node, NodeType};

    #[test]
    fn test_json_round_trip() {
        let export = GraphExport {
            nodes: vec![
                Node::new("a", NodeType::Server, "a"),
                Node::new("b", NodeType::Switch, "b"),
            ],
            edges: vec![Edge::new("e1", "a", "b", EdgeType::Physical)],
            positions: vec![],
        };

        let text = JsonCodec.encode(&export).unwrap();
        let fragment = JsonCodec.decode(&text).unwrap();
        assert_eq!(fragment.nodes, export.nodes);
        assert_eq!(fragment.edges, export.edges);
    }

    #[test]
    fn test_decode_bare_fragment() {
        let fragment = JsonCodec
            .decode(r#"{"nodes": [{"id": "x", "type": "server", "label": "x"}]}"#)
            .unwrap();
        assert_eq!(fragment.nodes.len(), 1);
        assert!(fragment.edges.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(JsonCodec.decode("not json").is_err());
    }
}
