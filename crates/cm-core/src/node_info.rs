/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Connectivity-aware node inventory: aggregates static node facts with
//! dynamic service-manager reports, exposes a ready/connected predicate, and
//! fans out change notifications to subscribed listeners.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use cm_model::ident::NodeId;
use cm_model::node::{NodeInfo, NodeState};
use cm_model::{CmError, CmResult};

use cm_storage::node_info::{NodeInfoListener, NodeInfoSourceListener, SmEvent, SmInfo, UnitNodeInfo};
use cm_storage::NodeInfoProvider;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// How long to wait for SM connectivity before a node is considered
    /// ready anyway (with `state=Error`).
    pub sm_connection_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sm_connection_timeout: Duration::from_secs(30),
        }
    }
}

struct Entry {
    info: NodeInfo,
    sm_info: Option<SmInfo>,
    is_connected: bool,
    connect_deadline: Instant,
    has_sm: bool,
}

impl Entry {
    fn ready(&self) -> bool {
        (self.is_connected && (!self.has_sm || self.sm_info.is_some())) || Instant::now() >= self.connect_deadline
    }

    fn project(&self) -> UnitNodeInfo {
        let mut info = self.info.clone();
        if let Some(sm) = &self.sm_info {
            info.declared_resources = sm.declared_resources.clone();
            info.declared_runtimes = sm.declared_runtimes.clone();
        }
        if !self.is_connected && Instant::now() >= self.connect_deadline {
            info.state = NodeState::Error;
        }
        UnitNodeInfo {
            info,
            is_connected: self.is_connected,
        }
    }
}

struct Inner {
    nodes: BTreeMap<NodeId, Entry>,
    listeners: Vec<Arc<dyn NodeInfoListener>>,
    queue: VecDeque<NodeId>,
}

/// The `NodeInfoProvider cache` component. Owns one notification worker; a
/// single [`tokio::sync::Mutex`] protects its state.
pub struct NodeInfoProviderCache {
    config: Config,
    inner: Mutex<Inner>,
    notify_tx: mpsc::UnboundedSender<NodeId>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeId>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NodeInfoProviderCache {
    pub fn new(config: Config) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                nodes: BTreeMap::new(),
                listeners: Vec::new(),
                queue: VecDeque::new(),
            }),
            notify_tx: tx,
            notify_rx: Mutex::new(Some(rx)),
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Registers a node's static facts. `has_sm` marks whether the node
    /// hosts a service manager component (affects readiness semantics).
    pub async fn add_node(&self, info: NodeInfo, has_sm: bool) {
        let node_id = info.node_id.clone();
        let mut inner = self.inner.lock().await;
        inner.nodes.insert(
            node_id.clone(),
            Entry {
                info,
                sm_info: None,
                is_connected: false,
                connect_deadline: Instant::now() + self.config.sm_connection_timeout,
                has_sm,
            },
        );
        drop(inner);
        self.enqueue(node_id).await;
    }

    async fn enqueue(&self, node_id: NodeId) {
        let mut inner = self.inner.lock().await;
        if !inner.queue.contains(&node_id) {
            inner.queue.push_back(node_id.clone());
        }
        drop(inner);
        let _ = self.notify_tx.send(node_id);
    }

    pub async fn start(self: &Arc<Self>) {
        let mut rx_guard = self.notify_rx.lock().await;
        let Some(mut rx) = rx_guard.take() else {
            return;
        };
        drop(rx_guard);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    maybe_id = rx.recv() => {
                        match maybe_id {
                            Some(id) => {
                                this.process_one(&id).await;
                                while let Ok(id) = rx.try_recv() {
                                    this.process_one(&id).await;
                                }
                            }
                            None => break,
                        }
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(this.config.sm_connection_timeout) => {}
                    _ = &mut shutdown_rx => break,
                }
                this.recheck_timeouts().await;
            }
        });
        *self.worker.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn process_one(&self, node_id: &NodeId) {
        let mut inner = self.inner.lock().await;
        inner.queue.retain(|id| id != node_id);
        let Some(entry) = inner.nodes.get(node_id) else {
            return;
        };
        if !entry.ready() {
            return;
        }
        let projected = entry.project();
        let listeners = inner.listeners.clone();
        drop(inner);

        for listener in listeners {
            listener.on_node_info_changed(projected.clone()).await;
        }
    }

    async fn recheck_timeouts(&self) {
        let ids: Vec<NodeId> = {
            let inner = self.inner.lock().await;
            inner
                .nodes
                .iter()
                .filter(|(_, e)| !e.is_connected && Instant::now() >= e.connect_deadline)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.process_one(&id).await;
        }
    }

    pub async fn on_sm_event(&self, node_id: NodeId, event: SmEvent) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.nodes.get_mut(&node_id) {
                match event {
                    SmEvent::Connected => entry.is_connected = true,
                    SmEvent::Disconnected => entry.is_connected = false,
                    SmEvent::InfoReceived(info) => entry.sm_info = Some(info),
                    SmEvent::NodeInfoChanged(info) => entry.info = info,
                }
            }
        }
        self.enqueue(node_id).await;
    }
}

/// Lets the cache subscribe directly to a [`cm_storage::NodeInfoSource`]
/// without an intermediate adapter.
#[async_trait]
impl NodeInfoSourceListener for NodeInfoProviderCache {
    async fn on_sm_event(&self, node_id: NodeId, event: SmEvent) {
        self.on_sm_event(node_id, event).await;
    }
}

#[async_trait]
impl NodeInfoProvider for NodeInfoProviderCache {
    async fn get_all_node_ids(&self) -> CmResult<Vec<NodeId>> {
        Ok(self.inner.lock().await.nodes.keys().cloned().collect())
    }

    async fn get_node_info(&self, node_id: &NodeId) -> CmResult<UnitNodeInfo> {
        self.inner
            .lock()
            .await
            .nodes
            .get(node_id)
            .map(Entry::project)
            .ok_or_else(|| CmError::not_found(format!("node {node_id} not found")))
    }

    async fn subscribe_listener(&self, listener: Arc<dyn NodeInfoListener>) -> CmResult<()> {
        self.inner.lock().await.listeners.push(listener);
        Ok(())
    }

    async fn unsubscribe_listener(&self, listener: &Arc<dyn NodeInfoListener>) -> CmResult<()> {
        let mut inner = self.inner.lock().await;
        inner.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_model::node::NodeState;
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node_info(id: &str) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            node_type: "t".to_string(),
            max_dmips: 100,
            total_ram: 100,
            partitions: Map::new(),
            declared_resources: vec![],
            declared_runtimes: vec![],
            declared_devices: vec![],
            state: NodeState::Online,
        }
    }

    struct CountingListener(Arc<AtomicUsize>);

    #[async_trait]
    impl NodeInfoListener for CountingListener {
        async fn on_node_info_changed(&self, _info: UnitNodeInfo) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn node_without_sm_is_ready_immediately_on_connect() {
        let cache = NodeInfoProviderCache::new(Config {
            sm_connection_timeout: Duration::from_millis(50),
        });
        cache.add_node(node_info("n1"), false).await;
        let count = Arc::new(AtomicUsize::new(0));
        cache
            .subscribe_listener(Arc::new(CountingListener(count.clone())))
            .await
            .unwrap();
        cache.start().await;

        cache.on_sm_event("n1".to_string(), SmEvent::Connected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.stop().await;

        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn unconnected_node_becomes_ready_after_timeout() {
        let cache = NodeInfoProviderCache::new(Config {
            sm_connection_timeout: Duration::from_millis(20),
        });
        cache.add_node(node_info("n1"), true).await;
        cache.start().await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let info = cache.get_node_info(&"n1".to_string()).await.unwrap();
        assert_eq!(info.info.state, NodeState::Error);
        cache.stop().await;
    }
}
