/// Subnet scanning.
///
/// The scanner is the one discovery source allowed to invent nodes: it
/// sweeps an IPv4 range and reports an observation for every address that
/// answered. Probing is plain TCP connect against a small port set with a
/// per-probe timeout and bounded concurrency.
use crate::error::{SpecularError, SpecularResult};
use crate::types::{
    node_id_from_ip, segmentum_for, GraphFragment, Node, NodeStatus, NodeType,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Ports worth knocking on when nothing else is known about a host.
const DEFAULT_PROBE_PORTS: &[u16] = &[22, 80, 443, 3389, 8080];

/// Upper bound on hosts expanded from a CIDR; wider blocks are rejected.
const MAX_HOSTS: usize = 1024;

/// Something that can sweep a subnet and report what answered.
#[async_trait]
pub trait SubnetScanner: Send + Sync {
    async fn scan(
        &self,
        cidr: &str,
        cancel: &CancellationToken,
    ) -> SpecularResult<GraphFragment>;
}

/// TCP-connect subnet scanner.
pub struct TcpProbeScanner {
    ports: Vec<u16>,
    probe_timeout: Duration,
    concurrency: usize,
}

impl TcpProbeScanner {
    pub fn new() -> Self {
        Self {
            ports: DEFAULT_PROBE_PORTS.to_vec(),
            probe_timeout: Duration::from_millis(750),
            concurrency: 64,
        }
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

impl Default for TcpProbeScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubnetScanner for TcpProbeScanner {
    async fn scan(
        &self,
        cidr: &str,
        cancel: &CancellationToken,
    ) -> SpecularResult<GraphFragment> {
        let hosts = expand_cidr(cidr)?;
        tracing::debug!(cidr, hosts = hosts.len(), "scanning subnet");

        let ports = self.ports.clone();
        let timeout = self.probe_timeout;
        let mut probes = stream::iter(hosts)
            .map(|ip| {
                let ports = ports.clone();
                async move { (ip, probe_ports(ip, &ports, timeout).await) }
            })
            .buffer_unordered(self.concurrency);

        let mut fragment = GraphFragment::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(cidr, found = fragment.nodes.len(), "scan cancelled");
                    break;
                }
                next = probes.next() => match next {
                    Some((ip, open_ports)) if !open_ports.is_empty() => {
                        fragment.nodes.push(scanned_node(ip, open_ports));
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        Ok(fragment)
    }
}

fn scanned_node(ip: Ipv4Addr, open_ports: Vec<u16>) -> Node {
    let now = Utc::now();
    let mut node = Node::new(
        node_id_from_ip(&IpAddr::V4(ip)),
        NodeType::Server,
        ip.to_string(),
    )
    .with_source("scanner")
    .with_status(NodeStatus::Verified)
    .with_property("ip", json!(ip.to_string()))
    .with_property("segmentum", json!(segmentum_for(&ip)))
    .with_discovered("ip", json!(ip.to_string()))
    .with_discovered("open_ports", json!(open_ports));
    node.last_verified = Some(now);
    node.last_seen = Some(now);
    node
}

/// Try each port; return the ones that accepted a connection.
async fn probe_ports(ip: Ipv4Addr, ports: &[u16], timeout: Duration) -> Vec<u16> {
    let mut open = Vec::new();
    for &port in ports {
        let addr = SocketAddr::from((ip, port));
        if let Ok(Ok(_)) = tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            open.push(port);
        }
    }
    open
}

/// Expand an IPv4 CIDR into its host addresses (network and broadcast
/// excluded for prefixes shorter than /31).
fn expand_cidr(cidr: &str) -> SpecularResult<Vec<Ipv4Addr>> {
    let (addr_text, prefix_text) = cidr
        .split_once('/')
        .ok_or_else(|| SpecularError::validation(format!("'{}' is not CIDR notation", cidr)))?;
    let addr: Ipv4Addr = addr_text
        .parse()
        .map_err(|_| SpecularError::validation(format!("bad address in '{}'", cidr)))?;
    let prefix: u32 = prefix_text
        .parse()
        .map_err(|_| SpecularError::validation(format!("bad prefix in '{}'", cidr)))?;
    if prefix > 32 {
        return Err(SpecularError::validation(format!("bad prefix in '{}'", cidr)));
    }

    let host_bits = 32 - prefix;
    let total = 1u64 << host_bits;
    let (first, last) = if host_bits <= 1 {
        (0u64, total - 1)
    } else {
        (1u64, total - 2)
    };
    let count = (last - first + 1) as usize;
    if count > MAX_HOSTS {
        return Err(SpecularError::validation(format!(
            "'{}' expands to {} hosts (limit {})",
            cidr, count, MAX_HOSTS
        )));
    }

    let mask = if prefix == 0 { 0 } else { u32::MAX << host_bits };
    let network = u32::from(addr) & mask;
    Ok((first..=last)
        .map(|offset| Ipv4Addr::from(network | offset as u32))
        .collect())
}
