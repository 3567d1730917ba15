/// Ansible-style inventory codec.
///
/// A minimal dialect: `[group]` sections hold one host per line, with
/// optional `key=value` pairs after the name. Groups map to the `role`
/// property, `ansible_host` to the `ip` property. Sections with a
/// qualifier (`[web:vars]`, `[all:children]`) are skipped. Export writes
/// hosts grouped by role, `ungrouped` for the rest.
use super::GraphCodec;
use crate::error::{SpecularError, SpecularResult};
use crate::types::{node_id_from_ip, GraphExport, GraphFragment, Node, NodeType};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::IpAddr;

pub struct InventoryCodec;

impl GraphCodec for InventoryCodec {
    fn format(&self) -> &'static str {
        "ansible-inventory"
    }

    fn content_type(&self) -> &'static str {
        "text/plain"
    }

    fn file_extension(&self) -> &'static str {
        "ini"
    }

    fn decode(&self, text: &str) -> SpecularResult<GraphFragment> {
        let mut fragment = GraphFragment::new();
        let mut group: Option<String> = None;
        let mut skipping_section = false;

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let header = header.strip_suffix(']').ok_or_else(|| {
                    SpecularError::validation(format!(
                        "line {}: unterminated section header",
                        line_no + 1
                    ))
                })?;
                // Vars and children sections carry no hosts.
                skipping_section = header.contains(':');
                group = (!skipping_section).then(|| header.to_string());
                continue;
            }
            if skipping_section {
                continue;
            }

            let mut tokens = line.split_whitespace();
            let name = tokens.next().unwrap_or_default().to_string();
            let mut ip: Option<String> = None;
            let mut extras: Vec<(String, String)> = Vec::new();
            for token in tokens {
                let Some((key, value)) = token.split_once('=') else {
                    return Err(SpecularError::validation(format!(
                        "line {}: expected key=value, got '{}'",
                        line_no + 1,
                        token
                    )));
                };
                if key == "ansible_host" {
                    ip = Some(value.to_string());
                } else {
                    extras.push((key.to_string(), value.to_string()));
                }
            }

            let id = match ip.as_deref().and_then(|v| v.parse::<IpAddr>().ok()) {
                Some(addr) => node_id_from_ip(&addr),
                None => sanitize_id(&name),
            };
            let mut node = Node::new(id, NodeType::Server, &name).with_source("inventory");
            if let Some(ip) = ip {
                node.properties.insert("ip".to_string(), json!(ip));
            }
            if let Some(ref group) = group {
                node.properties.insert("role".to_string(), json!(group));
            }
            for (key, value) in extras {
                node.properties.insert(key, json!(value));
            }
            fragment.nodes.push(node);
        }
        Ok(fragment)
    }

    fn encode(&self, export: &GraphExport) -> SpecularResult<String> {
        let mut groups: BTreeMap<String, Vec<&Node>> = BTreeMap::new();
        for node in &export.nodes {
            let role = node
                .properties
                .get("role")
                .and_then(|v| v.as_str())
                .unwrap_or("ungrouped")
                .to_string();
            groups.entry(role).or_default().push(node);
        }

        let mut out = String::new();
        for (role, nodes) in groups {
            out.push_str(&format!("[{}]\n", role));
            for node in nodes {
                let name = if node.label.is_empty() {
                    &node.id
                } else {
                    &node.label
                };
                out.push_str(name);
                if let Some(ip) = node.primary_ip() {
                    out.push_str(&format!(" ansible_host={}", ip));
                }
                out.push('\n');
            }
            out.push('\n');
        }
        Ok(out)
    }
}

fn sanitize_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_groups_and_hosts() {
        let text = r#"
# production inventory
[web]
web-1 ansible_host=10.0.0.5
web-2 ansible_host=10.0.0.6 env=prod

[db]
db-primary ansible_host=10.0.1.10

[all:vars]
ansible_user=ops
"#;
        let fragment = InventoryCodec.decode(text).unwrap();
        assert_eq!(fragment.nodes.len(), 3);

        let web1 = &fragment.nodes[0];
        assert_eq!(web1.id, "10-0-0-5");
        assert_eq!(web1.label, "web-1");
        assert_eq!(web1.properties["ip"], json!("10.0.0.5"));
        assert_eq!(web1.properties["role"], json!("web"));

        let web2 = &fragment.nodes[1];
        assert_eq!(web2.properties["env"], json!("prod"));

        let db = &fragment.nodes[2];
        assert_eq!(db.properties["role"], json!("db"));
    }

    #[test]
    fn test_decode_host_without_ip_uses_name() {
        let fragment = InventoryCodec.decode("[misc]\nSome.Host\n").unwrap();
        assert_eq!(fragment.nodes[0].id, "some-host");
    }

    #[test]
    fn test_decode_rejects_malformed_pairs() {
        assert!(InventoryCodec.decode("[web]\nhost1 bogus\n").is_err());
        assert!(InventoryCodec.decode("[web\nhost1\n").is_err());
    }

    #[test]
    fn test_encode_then_decode_round_trip() {
        let export = GraphExport {
            nodes: vec![
                Node::new("10-0-0-5", NodeType::Server, "web-1")
                    .with_property("ip", json!("10.0.0.5"))
                    .with_property("role", json!("web")),
                Node::new("10-0-1-10", NodeType::Server, "db-primary")
                    .with_property("ip", json!("10.0.1.10"))
                    .with_property("role", json!("db")),
            ],
            edges: vec![],
            positions: vec![],
        };

        let text = InventoryCodec.encode(&export).unwrap();
        let fragment = InventoryCodec.decode(&text).unwrap();
        assert_eq!(fragment.nodes.len(), 2);

        // Ids derive from the addresses, so they line up with the source.
        let ids: Vec<&str> = fragment.nodes.iter().map(|n| n.id.as_str()).collect();
        assert!(ids.contains(&"10-0-0-5"));
        assert!(ids.contains(&"10-0-1-10"));
        for node in &fragment.nodes {
            assert!(node.properties.contains_key("role"));
        }
    }
}
