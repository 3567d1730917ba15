/// Import/export codecs.
///
/// A codec turns text into a [`GraphFragment`] for import and a
/// [`GraphExport`] into text for export. Three formats ship: JSON (also
/// the shape scan results arrive in), YAML, and Ansible-style inventory.
use crate::error::{SpecularError, SpecularResult};
use crate::types::{GraphExport, GraphFragment};

mod inventory;
mod json;
mod yaml;

pub use inventory::InventoryCodec;
pub use json::JsonCodec;
pub use yaml::YamlCodec;

pub trait GraphCodec: Send + Sync {
    /// Format name as used in the HTTP routes.
    fn format(&self) -> &'static str;
    /// MIME type for export responses.
    fn content_type(&self) -> &'static str;
    /// File extension for export attachments.
    fn file_extension(&self) -> &'static str;

    fn decode(&self, text: &str) -> SpecularResult<GraphFragment>;
    fn encode(&self, export: &GraphExport) -> SpecularResult<String>;
}

/// Look up the codec for a route format name.
pub fn codec_for(format: &str) -> SpecularResult<Box<dyn GraphCodec>> {
    match format {
        "json" | "scan" => Ok(Box::new(JsonCodec)),
        "yaml" => Ok(Box::new(YamlCodec)),
        "ansible-inventory" => Ok(Box::new(InventoryCodec)),
        other => Err(SpecularError::validation(format!(
            "unknown format '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_lookup() {
        assert_eq!(codec_for("json").unwrap().format(), "json");
        assert_eq!(codec_for("scan").unwrap().format(), "json");
        assert_eq!(codec_for("yaml").unwrap().format(), "yaml");
        assert_eq!(
            codec_for("ansible-inventory").unwrap().format(),
            "ansible-inventory"
        );
        assert!(codec_for("toml").is_err());
    }
}
