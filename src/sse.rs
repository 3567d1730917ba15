/// Live-event fan-out to HTTP clients.
///
/// The hub owns the set of connected SSE clients. A single run task
/// serializes the three operations that touch the client set — register,
/// unregister, broadcast — over one command channel, so only that task
/// ever sends on a client's outbound queue. Broadcast marshals the event
/// to its wire form exactly once, then performs a non-blocking send to
/// every client: a slow client loses frames (logged) but keeps its
/// connection. Every 30 seconds a keepalive comment goes out to defeat
/// idle proxies.
use crate::events::{Event, EventBus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound queue depth per client; beyond this, frames are dropped.
const CLIENT_QUEUE_DEPTH: usize = 64;

/// Keepalive comment cadence.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// The wire form of a keepalive comment.
const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

/// Serialize an event into its SSE wire frame.
fn frame(event: &Event) -> String {
    match serde_json::to_string(event) {
        Ok(json) => format!("data: {}\n\n", json),
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize event for SSE");
            String::new()
        }
    }
}

enum HubCommand {
    Register { id: u64, tx: mpsc::Sender<String> },
    Unregister { id: u64 },
    Broadcast { event: Event },
}

/// Handle to the hub's run task.
pub struct SseHub {
    cmd_tx: mpsc::Sender<HubCommand>,
    next_id: AtomicU64,
    clients: Arc<AtomicUsize>,
}

impl SseHub {
    /// Spawn the hub run task and the bus→hub bridge.
    pub fn spawn(bus: Arc<EventBus>, cancel: &CancellationToken) -> Arc<Self> {
        Self::spawn_with_keepalive(bus, cancel, KEEPALIVE_INTERVAL)
    }

    /// As [`SseHub::spawn`], with an explicit keepalive cadence.
    pub fn spawn_with_keepalive(
        bus: Arc<EventBus>,
        cancel: &CancellationToken,
        keepalive: Duration,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let clients = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_hub(cmd_rx, cancel.clone(), keepalive, clients.clone()));

        // Bridge: forward every bus event into the hub's command stream.
        // Subscribing happens here, before the task is spawned, so no
        // event published after `spawn` returns can be missed.
        let mut rx = bus.subscribe();
        let bridge_tx = cmd_tx.clone();
        let bridge_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = bridge_cancel.cancelled() => break,
                    maybe = rx.recv() => match maybe {
                        Some(event) => {
                            if bridge_tx.send(HubCommand::Broadcast { event }).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Arc::new(Self {
            cmd_tx,
            next_id: AtomicU64::new(1),
            clients,
        })
    }

    /// Register a new client; returns its id and the outbound frame queue.
    pub async fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let _ = self.cmd_tx.send(HubCommand::Register { id, tx }).await;
        (id, rx)
    }

    /// Remove a client. Safe to call for ids already gone.
    pub fn unregister(&self, id: u64) {
        let _ = self.cmd_tx.try_send(HubCommand::Unregister { id });
    }

    /// Broadcast an event directly (the bridge normally does this).
    pub async fn broadcast(&self, event: Event) {
        let _ = self.cmd_tx.send(HubCommand::Broadcast { event }).await;
    }

    /// Currently connected client count.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

/// The single task allowed to touch the client set.
async fn run_hub(
    mut cmd_rx: mpsc::Receiver<HubCommand>,
    cancel: CancellationToken,
    keepalive: Duration,
    client_count: Arc<AtomicUsize>,
) {
    let mut clients: HashMap<u64, mpsc::Sender<String>> = HashMap::new();
    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut gone = Vec::new();
                for (&id, tx) in &clients {
                    if let Err(mpsc::error::TrySendError::Closed(_)) =
                        tx.try_send(KEEPALIVE_FRAME.to_string())
                    {
                        gone.push(id);
                    }
                }
                for id in gone {
                    clients.remove(&id);
                    tracing::debug!(client = id, "client gone, removed at keepalive");
                }
                client_count.store(clients.len(), Ordering::Relaxed);
            }
            maybe = cmd_rx.recv() => {
                let Some(cmd) = maybe else { break };
                match cmd {
                    HubCommand::Register { id, tx } => {
                        clients.insert(id, tx);
                        client_count.store(clients.len(), Ordering::Relaxed);
                        tracing::debug!(client = id, total = clients.len(), "SSE client registered");
                    }
                    HubCommand::Unregister { id } => {
                        if clients.remove(&id).is_some() {
                            client_count.store(clients.len(), Ordering::Relaxed);
                            tracing::debug!(client = id, total = clients.len(), "SSE client unregistered");
                        }
                    }
                    HubCommand::Broadcast { event } => {
                        // Serialize exactly once, fan out non-blocking.
                        let wire = frame(&event);
                        if wire.is_empty() {
                            continue;
                        }
                        let mut gone = Vec::new();
                        for (&id, tx) in &clients {
                            match tx.try_send(wire.clone()) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    tracing::debug!(client = id, event = ?event.event_type, "slow SSE client, frame dropped");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    gone.push(id);
                                }
                            }
                        }
                        for id in gone {
                            clients.remove(&id);
                            tracing::debug!(client = id, "client gone, removed at broadcast");
                        }
                        client_count.store(clients.len(), Ordering::Relaxed);
                    }
                }
            }
        }
    }
    // Dropping the senders closes every client stream.
    clients.clear();
    client_count.store(0, Ordering::Relaxed);
    tracing::debug!("SSE hub stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Node, NodeType};
    use serde_json::json;

    async fn settle() {
        // Let the hub's run task process queued commands.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_frames_are_wire_shaped() {
        let node = Node::new("n1", NodeType::Server, "n1");
        let wire = frame(&Event::node_updated(&node));
        assert!(wire.starts_with("data: {"));
        assert!(wire.ends_with("\n\n"));
        let body: serde_json::Value =
            serde_json::from_str(wire.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(body["type"], json!("node-updated"));
    }

    #[tokio::test]
    async fn test_bus_events_reach_registered_clients() {
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let hub = SseHub::spawn(bus.clone(), &cancel);

        let (_id, mut rx) = hub.register().await;
        settle().await;

        bus.publish(Event::graph_updated(json!({"nodes": 3})));
        settle().await;

        let wire = rx.recv().await.unwrap();
        assert!(wire.contains("graph-updated"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_slow_client_drops_but_stays_connected() {
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let hub = SseHub::spawn(bus.clone(), &cancel);

        let (_slow_id, mut slow_rx) = hub.register().await;
        let (_fast_id, mut fast_rx) = hub.register().await;
        settle().await;

        // A consumer drains the fast client while the slow one sits still.
        let drainer = tokio::spawn(async move {
            let mut received = 0usize;
            while let Some(_frame) = fast_rx.recv().await {
                received += 1;
                if received == 200 {
                    break;
                }
            }
            received
        });

        let node = Node::new("n1", NodeType::Server, "n1");
        for _ in 0..200 {
            hub.broadcast(Event::node_updated(&node)).await;
        }

        let fast_received = drainer.await.unwrap();
        assert_eq!(fast_received, 200);

        // The slow client kept at most its queue depth and is still
        // registered.
        let mut slow_received = 0usize;
        while slow_rx.try_recv().is_ok() {
            slow_received += 1;
        }
        assert!(slow_received <= CLIENT_QUEUE_DEPTH);
        assert!(slow_received > 0);
        assert_eq!(hub.client_count(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_keepalive_comments_flow() {
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let hub = SseHub::spawn_with_keepalive(bus, &cancel, Duration::from_millis(30));

        let (_id, mut rx) = hub.register().await;
        let wire = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wire, KEEPALIVE_FRAME);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_disconnected_client_is_removed() {
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let hub = SseHub::spawn(bus, &cancel);

        let (id, rx) = hub.register().await;
        settle().await;
        assert_eq!(hub.client_count(), 1);

        drop(rx);
        hub.unregister(id);
        settle().await;
        assert_eq!(hub.client_count(), 0);
        cancel.cancel();
    }
}
