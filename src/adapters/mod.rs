/// Discovery adapter contract.
///
/// An adapter is a discovery source — a verifier, a scanner, a bootstrap
/// probe — that the [`crate::registry::AdapterRegistry`] runs on a cadence.
/// Each adapter exposes a stable name, a cancellable `sync` producing a
/// [`GraphFragment`], and an optional capability set. Sync must return
/// promptly once the token fires, optionally with a partial fragment.
use crate::error::{SpecularError, SpecularResult};
use crate::types::GraphFragment;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod bootstrap;
pub mod scan;
pub mod verifier;

pub use bootstrap::BootstrapAdapter;
pub use scan::{SubnetScanner, TcpProbeScanner};
pub use verifier::VerifierAdapter;

/// A discovery source the registry can schedule.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable name, used for registry ordering and event payloads.
    fn name(&self) -> &str;

    /// Produce a fragment of what this source currently observes.
    async fn sync(&self, cancel: &CancellationToken) -> SpecularResult<GraphFragment>;

    /// What this source can do (ping, arp, snmp, ...).
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Per-adapter scheduling configuration.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub enabled: bool,
    /// Display and trigger order; ties break by name.
    pub priority: i32,
    pub poll_interval: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 0,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl AdapterConfig {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Parse a config interval like `"30s"` or `"5m"`.
pub fn parse_poll_interval(text: &str) -> SpecularResult<Duration> {
    humantime::parse_duration(text)
        .map_err(|e| SpecularError::validation(format!("bad poll interval '{}': {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_poll_interval() {
        assert_eq!(parse_poll_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_poll_interval("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_poll_interval("soon").is_err());
    }
}
