/// Initial self-discovery.
///
/// At startup the bootstrap adapter observes the machine it runs on: the
/// primary outbound IPv4 address (routing-table trick, no packets sent)
/// and the local hostname. It produces a seed fragment with the self node,
/// a guessed gateway on `.1` of the local /24, and the edge between them.
/// The seed goes through the scanner-style upsert path, so bootstrap may
/// create nodes.
use crate::error::SpecularResult;
use crate::types::{
    node_id_from_ip, segmentum_for, EdgeType, GraphFragment, HostnameCandidate,
    HostnameInference, Node, NodeStatus, NodeType, Edge, HOSTNAME_INFERENCE_KEY,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::Adapter;

pub struct BootstrapAdapter;

impl BootstrapAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BootstrapAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for BootstrapAdapter {
    fn name(&self) -> &str {
        "bootstrap"
    }

    async fn sync(&self, _cancel: &CancellationToken) -> SpecularResult<GraphFragment> {
        let Some(ip) = primary_ipv4() else {
            tracing::debug!("no routable IPv4 address, bootstrap produces nothing");
            return Ok(GraphFragment::new());
        };

        let now = Utc::now();
        let self_id = node_id_from_ip(&IpAddr::V4(ip));
        let hostname = local_hostname().await;
        let label = hostname.clone().unwrap_or_else(|| ip.to_string());

        let mut self_node = Node::new(&self_id, NodeType::Server, label)
            .with_source("bootstrap")
            .with_status(NodeStatus::Verified)
            .with_property("ip", json!(ip.to_string()))
            .with_property("segmentum", json!(segmentum_for(&ip)))
            .with_discovered("ip", json!(ip.to_string()));
        if let Some(ref hostname) = hostname {
            self_node.discovered.insert("hostname".to_string(), json!(hostname));
            let inference = HostnameInference {
                candidates: vec![HostnameCandidate {
                    hostname: hostname.clone(),
                    confidence: 0.8,
                    source: "bootstrap".to_string(),
                }],
                best: Some(HostnameCandidate {
                    hostname: hostname.clone(),
                    confidence: 0.8,
                    source: "bootstrap".to_string(),
                }),
            };
            self_node
                .discovered
                .insert(HOSTNAME_INFERENCE_KEY.to_string(), inference.to_value());
        }
        self_node.last_verified = Some(now);
        self_node.last_seen = Some(now);

        // Conventional gateway guess for the local /24.
        let octets = ip.octets();
        let gateway_ip = Ipv4Addr::new(octets[0], octets[1], octets[2], 1);
        let mut fragment = GraphFragment::new();
        if gateway_ip != ip {
            let gateway_id = node_id_from_ip(&IpAddr::V4(gateway_ip));
            let gateway = Node::new(&gateway_id, NodeType::Gateway, gateway_ip.to_string())
                .with_source("bootstrap")
                .with_property("ip", json!(gateway_ip.to_string()))
                .with_property("segmentum", json!(segmentum_for(&gateway_ip)));
            let edge = Edge::new(
                format!("{}--{}", self_id, gateway_id),
                &self_id,
                &gateway_id,
                EdgeType::Physical,
            );
            fragment = fragment.with_node(gateway).with_edge(edge);
        }
        Ok(fragment.with_node(self_node))
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["self-discovery".to_string()]
    }
}

/// The IPv4 address the default route would use. Connecting a UDP socket
/// selects a source address without sending anything.
fn primary_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

async fn local_hostname() -> Option<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim().to_string();
        if !name.is_empty() {
            return Some(name);
        }
    }
    match tokio::fs::read_to_string("/etc/hostname").await {
        Ok(contents) => {
            let name = contents.trim().to_string();
            (!name.is_empty()).then_some(name)
        }
        Err(_) => None,
    }
}
