/// YAML codec for topology files.
use super::GraphCodec;
use crate::error::{SpecularError, SpecularResult};
use crate::types::{GraphExport, GraphFragment};

pub struct YamlCodec;

impl GraphCodec for YamlCodec {
    fn format(&self) -> &'static str {
        "yaml"
    }

    fn content_type(&self) -> &'static str {
        "application/yaml"
    }

    fn file_extension(&self) -> &'static str {
        "yaml"
    }

    fn decode(&self, text: &str) -> SpecularResult<GraphFragment> {
        let export: GraphExport = serde_yaml::from_str(text)
            .map_err(|e| SpecularError::validation(format!("bad YAML topology: {}", e)))?;
        Ok(GraphFragment {
            nodes: export.nodes,
            edges: export.edges,
        })
    }

    fn encode(&self, export: &GraphExport) -> SpecularResult<String> {
        serde_yaml::to_string(export)
            .map_err(|e| SpecularError::Storage(format!("YAML encode failed: {}", e)))
    }
}
