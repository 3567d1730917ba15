/// Adapter scheduling and dispatch.
///
/// The registry owns the set of named discovery adapters and runs each
/// enabled one on its own long-lived worker task: sleep for the poll
/// interval (or until a manual trigger), sync, hand the fragment to the
/// reconciler, emit progress events, repeat. There is no queue between
/// sync and reconcile — an adapter's next sync cannot start until the
/// previous reconcile returned, which paces adapters naturally under slow
/// storage. A per-adapter in-flight lock keeps at most one sync running
/// even when a manual trigger-all overlaps the worker; manual triggers
/// arriving while the adapter is busy coalesce to a single pending run.
use crate::adapters::{Adapter, AdapterConfig};
use crate::error::{SpecularError, SpecularResult};
use crate::events::{Event, EventBus};
use crate::reconcile::Reconciler;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long `stop` waits for workers before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Where an adapter currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    Idle,
    Syncing,
    Reconciling,
    Stopped,
}

/// Snapshot of one registered adapter, in display order.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub poll_interval: String,
    pub state: AdapterState,
    pub capabilities: Vec<String>,
}

/// Outcome of a trigger-sync-all: errors are collected, never masking the
/// adapters that produced fragments successfully.
#[derive(Debug, Clone, Serialize)]
pub struct SyncAllReport {
    pub synced: usize,
    pub changed: usize,
    pub errors: Vec<String>,
}

struct AdapterEntry {
    adapter: Arc<dyn Adapter>,
    config: AdapterConfig,
    /// Only one sync per adapter is ever in flight.
    in_flight: Mutex<()>,
    /// Manual trigger; `Notify` holds at most one stored permit, which is
    /// exactly the required coalescing.
    trigger: Notify,
}

pub struct AdapterRegistry {
    reconciler: Arc<Reconciler>,
    bus: Arc<EventBus>,
    /// Ordered by (priority, name). Mutated only before `start`.
    entries: RwLock<Vec<Arc<AdapterEntry>>>,
    states: Arc<DashMap<String, AdapterState>>,
    root: StdMutex<Option<CancellationToken>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AdapterRegistry {
    pub fn new(reconciler: Arc<Reconciler>, bus: Arc<EventBus>) -> Self {
        Self {
            reconciler,
            bus,
            entries: RwLock::new(Vec::new()),
            states: Arc::new(DashMap::new()),
            root: StdMutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Register an adapter. Names must be unique; ordering is by
    /// `(priority, name)` and affects display and trigger order only.
    pub fn register(
        &self,
        adapter: Arc<dyn Adapter>,
        config: AdapterConfig,
    ) -> SpecularResult<()> {
        let name = adapter.name().to_string();
        let mut entries = self.entries.write().expect("registry entries poisoned");
        if entries.iter().any(|e| e.adapter.name() == name) {
            return Err(SpecularError::Conflict {
                kind: "adapter",
                id: name,
            });
        }
        self.states.insert(name, AdapterState::Idle);
        entries.push(Arc::new(AdapterEntry {
            adapter,
            config,
            in_flight: Mutex::new(()),
            trigger: Notify::new(),
        }));
        entries.sort_by(|a, b| {
            (a.config.priority, a.adapter.name()).cmp(&(b.config.priority, b.adapter.name()))
        });
        Ok(())
    }

    fn enabled_entries(&self) -> Vec<Arc<AdapterEntry>> {
        self.entries
            .read()
            .expect("registry entries poisoned")
            .iter()
            .filter(|e| e.config.enabled)
            .cloned()
            .collect()
    }

    /// Spawn one worker task per enabled adapter under a child of `root`.
    pub async fn start(&self, root: &CancellationToken) -> SpecularResult<()> {
        let token = {
            let mut guard = self.root.lock().expect("registry root poisoned");
            if guard.is_some() {
                return Err(SpecularError::Storage(
                    "adapter registry already started".to_string(),
                ));
            }
            let token = root.child_token();
            *guard = Some(token.clone());
            token
        };

        let mut workers = self.workers.lock().await;
        for entry in self.enabled_entries() {
            let reconciler = Arc::clone(&self.reconciler);
            let bus = Arc::clone(&self.bus);
            let states = Arc::clone(&self.states);
            let cancel = token.clone();

            workers.push(tokio::spawn(async move {
                let name = entry.adapter.name().to_string();
                tracing::info!(
                    adapter = %name,
                    interval = %humantime::format_duration(entry.config.poll_interval),
                    "adapter worker started"
                );
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(entry.config.poll_interval) => {}
                        _ = entry.trigger.notified() => {}
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    let _ = run_adapter_once(&entry, &reconciler, &bus, &states, &cancel).await;
                }
                states.insert(name.clone(), AdapterState::Stopped);
                tracing::debug!(adapter = %name, "adapter worker stopped");
            }));
        }
        Ok(())
    }

    /// Cancel the root token and await all workers, best-effort within the
    /// shutdown grace period. Idempotent.
    pub async fn stop(&self) {
        let token = {
            let mut guard = self.root.lock().expect("registry root poisoned");
            guard.take()
        };
        let Some(token) = token else {
            return;
        };
        token.cancel();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                tracing::warn!("adapter worker did not stop within the grace period");
            }
        }
    }

    /// Poke one adapter to run outside its cadence. Coalesces while busy.
    pub fn trigger(&self, name: &str) -> SpecularResult<()> {
        let entries = self.entries.read().expect("registry entries poisoned");
        let entry = entries
            .iter()
            .find(|e| e.adapter.name() == name)
            .ok_or(SpecularError::NotFound {
                kind: "adapter",
                id: name.to_string(),
            })?;
        entry.trigger.notify_one();
        Ok(())
    }

    /// Run every enabled adapter concurrently; each sync is bounded by
    /// `cancel`. Returns when all complete or the token fires.
    pub async fn trigger_sync_all(&self, cancel: &CancellationToken) -> SyncAllReport {
        let entries = self.enabled_entries();
        let runs = entries.iter().map(|entry| {
            let reconciler = Arc::clone(&self.reconciler);
            let bus = Arc::clone(&self.bus);
            let states = Arc::clone(&self.states);
            async move {
                let name = entry.adapter.name().to_string();
                tokio::select! {
                    _ = cancel.cancelled() => (name, Err(SpecularError::Unavailable("sync cancelled".to_string()))),
                    result = run_adapter_once(entry, &reconciler, &bus, &states, cancel) => (name, result),
                }
            }
        });

        let mut report = SyncAllReport {
            synced: 0,
            changed: 0,
            errors: Vec::new(),
        };
        for (name, result) in futures::future::join_all(runs).await {
            match result {
                Ok((_, changed)) => {
                    report.synced += 1;
                    report.changed += changed;
                }
                Err(err) => report.errors.push(format!("{}: {}", name, err)),
            }
        }
        report
    }

    /// All registered adapters in display order.
    pub fn statuses(&self) -> Vec<AdapterStatus> {
        self.entries
            .read()
            .expect("registry entries poisoned")
            .iter()
            .map(|entry| {
                let name = entry.adapter.name().to_string();
                let state = self
                    .states
                    .get(&name)
                    .map(|s| *s.value())
                    .unwrap_or(AdapterState::Idle);
                AdapterStatus {
                    name,
                    enabled: entry.config.enabled,
                    priority: entry.config.priority,
                    poll_interval: humantime::format_duration(entry.config.poll_interval)
                        .to_string(),
                    state,
                    capabilities: entry.adapter.capabilities(),
                }
            })
            .collect()
    }
}

/// One full cycle for one adapter: sync, reconcile, events.
///
/// Sync errors are transient by policy: they surface as a
/// `discovery-progress` event and the next tick retries.
async fn run_adapter_once(
    entry: &AdapterEntry,
    reconciler: &Reconciler,
    bus: &EventBus,
    states: &DashMap<String, AdapterState>,
    cancel: &CancellationToken,
) -> SpecularResult<(usize, usize)> {
    let _guard = entry.in_flight.lock().await;
    let name = entry.adapter.name();

    states.insert(name.to_string(), AdapterState::Syncing);
    bus.publish(Event::discovery_started(name));

    let fragment = match entry.adapter.sync(cancel).await {
        Ok(fragment) => fragment,
        Err(err) => {
            states.insert(name.to_string(), AdapterState::Idle);
            tracing::warn!(adapter = name, error = %err, "sync failed");
            bus.publish(Event::discovery_progress(name, &err.to_string()));
            return Err(err);
        }
    };

    states.insert(name.to_string(), AdapterState::Reconciling);
    let total = fragment.nodes.len();
    let changed = match reconciler.reconcile(cancel, name, &fragment).await {
        Ok(changed) => changed,
        Err(err) => {
            states.insert(name.to_string(), AdapterState::Idle);
            tracing::error!(adapter = name, error = %err, "reconcile failed");
            bus.publish(Event::discovery_progress(name, &err.to_string()));
            return Err(err);
        }
    };

    bus.publish(Event::discovery_complete(name, total, changed));
    states.insert(name.to_string(), AdapterState::Idle);
    Ok((total, changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;
    use crate::store::GraphStore;
    use crate::truth::TruthService;
    use crate::types::{GraphFragment, Node, NodeStatus, NodeType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockAdapter {
        name: String,
        syncs: AtomicUsize,
        fail: bool,
        observed: NodeStatus,
    }

    impl MockAdapter {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                syncs: AtomicUsize::new(0),
                fail: false,
                observed: NodeStatus::Verified,
            }
        }

        fn failing(name: &str) -> Self {
            Self {
                fail: true,
                ..Self::new(name)
            }
        }
    }

    #[async_trait]
    impl Adapter for MockAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn sync(&self, _cancel: &CancellationToken) -> SpecularResult<GraphFragment> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SpecularError::Unavailable("probe offline".to_string()));
            }
            let mut node = Node::new("10-0-0-5", NodeType::Server, "web");
            node.status = self.observed;
            node.discovered.insert(
                "sync_count".to_string(),
                serde_json::json!(self.syncs.load(Ordering::SeqCst)),
            );
            Ok(GraphFragment::new().with_node(node))
        }
    }

    fn registry_fixture() -> (AdapterRegistry, Arc<GraphStore>, Arc<EventBus>) {
        let repo = Arc::new(GraphStore::in_memory());
        let bus = Arc::new(EventBus::new());
        let truth = Arc::new(TruthService::new(
            repo.clone() as Arc<dyn Repository>,
            bus.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            repo.clone() as Arc<dyn Repository>,
            truth,
            bus.clone(),
        ));
        (AdapterRegistry::new(reconciler, bus.clone()), repo, bus)
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_names() {
        let (registry, _repo, _bus) = registry_fixture();
        registry
            .register(Arc::new(MockAdapter::new("a")), AdapterConfig::default())
            .unwrap();
        let err = registry
            .register(Arc::new(MockAdapter::new("a")), AdapterConfig::default())
            .unwrap_err();
        assert!(matches!(err, SpecularError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_statuses_ordered_by_priority_then_name() {
        let (registry, _repo, _bus) = registry_fixture();
        registry
            .register(
                Arc::new(MockAdapter::new("zeta")),
                AdapterConfig::default().with_priority(1),
            )
            .unwrap();
        registry
            .register(
                Arc::new(MockAdapter::new("beta")),
                AdapterConfig::default().with_priority(2),
            )
            .unwrap();
        registry
            .register(
                Arc::new(MockAdapter::new("alpha")),
                AdapterConfig::default().with_priority(1),
            )
            .unwrap();

        let names: Vec<String> = registry.statuses().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta", "beta"]);
    }

    #[tokio::test]
    async fn test_worker_polls_and_reconciles() {
        let (registry, repo, _bus) = registry_fixture();
        repo.create_node(Node::new("10-0-0-5", NodeType::Server, "web"))
            .await
            .unwrap();

        let adapter = Arc::new(MockAdapter::new("mock"));
        registry
            .register(
                adapter.clone(),
                AdapterConfig::default().with_poll_interval(Duration::from_millis(20)),
            )
            .unwrap();

        let root = CancellationToken::new();
        registry.start(&root).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        registry.stop().await;

        assert!(adapter.syncs.load(Ordering::SeqCst) >= 2);
        let node = repo.get_node("10-0-0-5").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Verified);
        assert!(node.discovered.contains_key("sync_count"));

        let status = &registry.statuses()[0];
        assert_eq!(status.state, AdapterState::Stopped);
    }

    #[tokio::test]
    async fn test_trigger_sync_all_aggregates_errors() {
        let (registry, repo, bus) = registry_fixture();
        repo.create_node(Node::new("10-0-0-5", NodeType::Server, "web"))
            .await
            .unwrap();

        registry
            .register(Arc::new(MockAdapter::new("good")), AdapterConfig::default())
            .unwrap();
        registry
            .register(
                Arc::new(MockAdapter::failing("bad")),
                AdapterConfig::default(),
            )
            .unwrap();
        registry
            .register(
                Arc::new(MockAdapter::new("off")),
                AdapterConfig::default().disabled(),
            )
            .unwrap();

        let mut rx = bus.subscribe();
        let report = registry.trigger_sync_all(&CancellationToken::new()).await;

        // The failing adapter does not mask the successful one.
        assert_eq!(report.synced, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("bad:"));

        // The disabled adapter never ran.
        let mut started = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.event_type == crate::events::EventType::DiscoveryStarted {
                started.push(event.payload["adapter"].as_str().unwrap().to_string());
            }
        }
        started.sort();
        assert_eq!(started, vec!["bad", "good"]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (registry, _repo, _bus) = registry_fixture();
        registry.stop().await;

        let root = CancellationToken::new();
        registry.start(&root).await.unwrap();
        registry.stop().await;
        registry.stop().await;
    }
}
