/// Typed events and the in-process publish/subscribe bus.
///
/// Every mutation that the UI cares about is published as an [`Event`] on
/// the [`EventBus`]. The bus fans out to N subscribers, each with its own
/// bounded queue; a slow subscriber never blocks the publisher — when its
/// queue is full the event is dropped for that subscriber and logged.
/// Delivery is therefore at-most-once, FIFO per subscriber, with no
/// ordering guarantee across subscribers.
use crate::types::{Discrepancy, Edge, Node, NodePosition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Default queue depth for each subscriber.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// The closed set of event types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "node-created")]
    NodeCreated,
    #[serde(rename = "node-updated")]
    NodeUpdated,
    #[serde(rename = "node-deleted")]
    NodeDeleted,
    #[serde(rename = "edge-created")]
    EdgeCreated,
    #[serde(rename = "edge-updated")]
    EdgeUpdated,
    #[serde(rename = "edge-deleted")]
    EdgeDeleted,
    #[serde(rename = "graph-updated")]
    GraphUpdated,
    #[serde(rename = "positions_updated")]
    PositionsUpdated,
    #[serde(rename = "discovery-started")]
    DiscoveryStarted,
    #[serde(rename = "discovery-progress")]
    DiscoveryProgress,
    #[serde(rename = "discovery-complete")]
    DiscoveryComplete,
    #[serde(rename = "truth-set")]
    TruthSet,
    #[serde(rename = "truth-cleared")]
    TruthCleared,
    #[serde(rename = "discrepancy-created")]
    DiscrepancyCreated,
    #[serde(rename = "discrepancy-resolved")]
    DiscrepancyResolved,
}

/// A single event as published on the bus and serialized to SSE clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: JsonValue,
}

impl Event {
    pub fn new(event_type: EventType, payload: JsonValue) -> Self {
        Self {
            event_type,
            payload,
        }
    }

    /// Full-node payload; the UI applies it as a per-node patch.
    pub fn node_created(node: &Node) -> Self {
        Self::new(EventType::NodeCreated, json!(node))
    }

    pub fn node_updated(node: &Node) -> Self {
        Self::new(EventType::NodeUpdated, json!(node))
    }

    pub fn node_deleted(id: &str) -> Self {
        Self::new(EventType::NodeDeleted, json!({ "id": id }))
    }

    pub fn edge_created(edge: &Edge) -> Self {
        Self::new(EventType::EdgeCreated, json!(edge))
    }

    pub fn edge_updated(edge: &Edge) -> Self {
        Self::new(EventType::EdgeUpdated, json!(edge))
    }

    pub fn edge_deleted(id: &str) -> Self {
        Self::new(EventType::EdgeDeleted, json!({ "id": id }))
    }

    pub fn graph_updated(payload: JsonValue) -> Self {
        Self::new(EventType::GraphUpdated, payload)
    }

    pub fn positions_updated(positions: &[NodePosition]) -> Self {
        Self::new(EventType::PositionsUpdated, json!(positions))
    }

    pub fn discovery_started(adapter: &str) -> Self {
        Self::new(EventType::DiscoveryStarted, json!({ "adapter": adapter }))
    }

    pub fn discovery_progress(adapter: &str, message: &str) -> Self {
        Self::new(
            EventType::DiscoveryProgress,
            json!({ "adapter": adapter, "message": message }),
        )
    }

    pub fn discovery_complete(adapter: &str, nodes: usize, changed: usize) -> Self {
        Self::new(
            EventType::DiscoveryComplete,
            json!({ "adapter": adapter, "nodes": nodes, "changed": changed }),
        )
    }

    pub fn truth_set(node: &Node) -> Self {
        Self::new(EventType::TruthSet, json!(node))
    }

    pub fn truth_cleared(node: &Node) -> Self {
        Self::new(EventType::TruthCleared, json!(node))
    }

    pub fn discrepancy_created(discrepancy: &Discrepancy) -> Self {
        Self::new(EventType::DiscrepancyCreated, json!(discrepancy))
    }

    pub fn discrepancy_resolved(discrepancy: &Discrepancy) -> Self {
        Self::new(EventType::DiscrepancyResolved, json!(discrepancy))
    }
}

/// Process-wide publish/subscribe primitive.
///
/// The subscriber list is append-only: subscriptions happen during startup
/// wiring and live for the process. Publishing is non-blocking; a full or
/// disconnected subscriber queue drops that subscriber's copy.
pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::Sender<Event>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber with the default queue depth.
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Register a subscriber with an explicit queue depth.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers
            .write()
            .expect("event bus subscriber list poisoned")
            .push(tx);
        rx
    }

    /// Publish an event to every subscriber without blocking.
    pub fn publish(&self, event: Event) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let subscribers = self
            .subscribers
            .read()
            .expect("event bus subscriber list poisoned");
        for (i, tx) in subscribers.iter().enumerate() {
            if let Err(err) = tx.try_send(event.clone()) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::debug!(subscriber = i, event = ?event.event_type, "subscriber queue full, dropping event");
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        tracing::debug!(subscriber = i, event = ?event.event_type, "subscriber gone, dropping event");
                    }
                }
            }
        }
    }

    /// Number of events published so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of per-subscriber drops so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeType;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::NodeUpdated).unwrap(),
            "\"node-updated\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::PositionsUpdated).unwrap(),
            "\"positions_updated\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::DiscrepancyCreated).unwrap(),
            "\"discrepancy-created\""
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let node = crate::types::Node::new("n1", NodeType::Server, "n1");
        bus.publish(Event::node_created(&node));

        assert_eq!(rx1.try_recv().unwrap().event_type, EventType::NodeCreated);
        assert_eq!(rx2.try_recv().unwrap().event_type, EventType::NodeCreated);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe_with_capacity(4);
        let mut fast = bus.subscribe_with_capacity(64);

        let node = crate::types::Node::new("n1", NodeType::Server, "n1");
        for _ in 0..16 {
            bus.publish(Event::node_updated(&node));
        }

        // The slow subscriber kept only its queue depth; the fast one got all.
        let mut slow_count = 0;
        while slow.try_recv().is_ok() {
            slow_count += 1;
        }
        let mut fast_count = 0;
        while fast.try_recv().is_ok() {
            fast_count += 1;
        }
        assert_eq!(slow_count, 4);
        assert_eq!(fast_count, 16);
        assert_eq!(bus.dropped_count(), 12);
    }

    #[tokio::test]
    async fn test_per_subscriber_delivery_is_fifo() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..8 {
            bus.publish(Event::graph_updated(json!({ "seq": i })));
        }
        for i in 0..8 {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.payload["seq"], i);
        }
    }
}
