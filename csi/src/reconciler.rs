//! Detects node deletion and prolonged not-ready conditions, enqueueing a
//! reconcile token that triggers cleanup of attachments referencing dead
//! nodes. Shutdown uses the two-stage priority-select
//! pattern: the stop signal is checked before the work channel on every
//! iteration, fixing the class of bug where a worker picks up new work
//! during shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::attachment::{AttachError, AttachmentManager};

/// What triggered a reconcile pass: a plain prune of dead-node attachments,
/// or a full re-derivation of the attachment map from `VolumeAttachment`
/// objects (appliance reconnect, after a blind spell).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileKind {
    Prune,
    Rebuild,
}

/// Cloneable handle used to enqueue a reconcile pass. The channel is
/// buffered to size 1 so bursts of node events dedupe into a single
/// pending reconcile.
#[derive(Clone)]
pub struct ReconcileTrigger(mpsc::Sender<ReconcileKind>);

impl ReconcileTrigger {
    pub fn fire(&self) {
        // try_send, not send: a full channel already has a reconcile
        // pending, so a dropped trigger here is not lost work.
        let _ = self.0.try_send(ReconcileKind::Prune);
    }

    /// Fired when the appliance transport reconnects after a blind spell:
    /// forces a full rebuild of the attachment map before the next prune.
    pub fn fire_rebuild(&self) {
        let _ = self.0.try_send(ReconcileKind::Rebuild);
    }
}

#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// Names of nodes that are either deleted or have been not-ready for
    /// longer than `threshold`.
    async fn list_unhealthy_nodes(&self, threshold: Duration) -> Result<Vec<String>, AttachError>;
}

pub struct NodeWatchReconciler {
    attachments: Arc<AttachmentManager>,
    node_backend: Arc<dyn NodeBackend>,
    stale_node_threshold: Duration,
}

impl NodeWatchReconciler {
    pub fn new(
        attachments: Arc<AttachmentManager>,
        node_backend: Arc<dyn NodeBackend>,
        stale_node_threshold: Duration,
    ) -> (Arc<Self>, ReconcileTrigger, mpsc::Receiver<ReconcileKind>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                attachments,
                node_backend,
                stale_node_threshold,
            }),
            ReconcileTrigger(tx),
            rx,
        )
    }

    #[instrument(skip(self))]
    async fn reconcile(&self, kind: ReconcileKind) {
        if kind == ReconcileKind::Rebuild {
            if let Err(err) = self.attachments.rebuild().await {
                warn!(error = %err, "failed to rebuild attachment map on reconnect");
            }
        }
        self.reconcile_once().await;
    }

    #[instrument(skip(self))]
    async fn reconcile_once(&self) {
        let unhealthy = match self.node_backend.list_unhealthy_nodes(self.stale_node_threshold).await {
            Ok(names) => names,
            Err(err) => {
                warn!(error = %err, "failed to list unhealthy nodes, skipping this pass");
                return;
            }
        };
        for node_id in unhealthy {
            let affected = self.attachments.remove_node(&node_id);
            if !affected.is_empty() {
                info!(node_id, volumes = affected.len(), "removed attachments for dead node");
            }
        }
    }

    /// Drains `work_rx` until `stop_rx` fires, a periodic tick elapses, or
    /// the work channel fires. The stop branch is listed first in every
    /// `select!` and uses `biased` ordering so it always wins ties.
    pub async fn run(
        self: Arc<Self>,
        mut work_rx: mpsc::Receiver<ReconcileKind>,
        mut stop_rx: tokio::sync::oneshot::Receiver<()>,
        tick_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Stage one: check the stop signal on its own before racing it
            // against the work channel below. Folding both checks into a
            // single `select!` let the worker occasionally pick up a new
            // work item in the same poll that also had a pending stop
            // signal; checking stop alone first closes that window.
            if stop_rx.try_recv().is_ok() {
                info!("reconciler stopping before next work item");
                return;
            }

            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    info!("reconciler stopping");
                    return;
                }
                Some(kind) = work_rx.recv() => {
                    self.reconcile(kind).await;
                }
                _ = ticker.tick() => {
                    self.reconcile(ReconcileKind::Prune).await;
                }
            }
        }
    }
}

/// Watches `v1 Node` via `kube::runtime::watcher`, tracking how long each
/// node has been not-ready and which nodes have been deleted.
pub struct KubeNodeBackend {
    client: kube::Client,
    not_ready_since: Mutex<HashMap<String, DateTime<Utc>>>,
    deleted: Mutex<HashSet<String>>,
}

impl KubeNodeBackend {
    pub fn new(client: kube::Client) -> Arc<Self> {
        Arc::new(Self {
            client,
            not_ready_since: Mutex::new(HashMap::new()),
            deleted: Mutex::new(HashSet::new()),
        })
    }

    /// Spawns the watch loop; firing `trigger` on every event so the
    /// reconciler re-evaluates promptly rather than waiting for its next
    /// periodic tick.
    pub fn spawn_watch(self: &Arc<Self>, trigger: ReconcileTrigger) -> tokio::task::JoinHandle<()> {
        use k8s_openapi::api::core::v1::Node;
        use kube::runtime::watcher;
        use kube::Api;

        let this = self.clone();
        tokio::spawn(async move {
            let api: Api<Node> = Api::all(this.client.clone());
            let mut stream = watcher(api, watcher::Config::default()).boxed();
            loop {
                match stream.try_next().await {
                    Ok(Some(watcher::Event::Apply(node))) | Ok(Some(watcher::Event::InitApply(node))) => {
                        this.observe(node);
                        trigger.fire();
                    }
                    Ok(Some(watcher::Event::Delete(node))) => {
                        if let Some(name) = node.metadata.name {
                            this.not_ready_since.lock().remove(&name);
                            this.deleted.lock().insert(name);
                        }
                        trigger.fire();
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(err) => warn!(error = %err, "node watch stream error"),
                }
            }
        })
    }

    fn observe(&self, node: k8s_openapi::api::core::v1::Node) {
        let Some(name) = node.metadata.name else { return };
        self.deleted.lock().remove(&name);
        let ready = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
            .map(|c| c.status == "True")
            .unwrap_or(false);
        let mut map = self.not_ready_since.lock();
        if ready {
            map.remove(&name);
        } else {
            map.entry(name).or_insert_with(Utc::now);
        }
    }
}

#[async_trait]
impl NodeBackend for KubeNodeBackend {
    async fn list_unhealthy_nodes(&self, threshold: Duration) -> Result<Vec<String>, AttachError> {
        let now = Utc::now();
        let mut names: Vec<String> = self.deleted.lock().iter().cloned().collect();
        for (name, since) in self.not_ready_since.lock().iter() {
            let elapsed = now.signed_duration_since(*since).to_std().unwrap_or_default();
            if elapsed >= threshold {
                names.push(name.clone());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub struct FakeNodeBackend(pub Mutex<Vec<String>>);

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl NodeBackend for FakeNodeBackend {
    async fn list_unhealthy_nodes(&self, _threshold: Duration) -> Result<Vec<String>, AttachError> {
        Ok(self.0.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::{AccessMode, FakeClusterBackend};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn reconcile_once_removes_attachments_for_unhealthy_nodes() {
        let backend = Arc::new(FakeClusterBackend::default());
        let attachments = Arc::new(AttachmentManager::new(backend, "rds.csi.example.com", StdDuration::from_secs(30)));
        attachments.publish("pvc-aaa", "node-a", AccessMode::SingleNodeWriter).await.unwrap();

        let node_backend = Arc::new(FakeNodeBackend(Mutex::new(vec!["node-a".to_string()])));
        let (reconciler, _trigger, _rx) =
            NodeWatchReconciler::new(attachments.clone(), node_backend, StdDuration::from_secs(300));

        reconciler.reconcile_once().await;
        assert!(attachments.is_empty());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_before_pending_work() {
        let backend = Arc::new(FakeClusterBackend::default());
        let attachments = Arc::new(AttachmentManager::new(backend, "rds.csi.example.com", StdDuration::from_secs(30)));
        let node_backend = Arc::new(FakeNodeBackend(Mutex::new(vec![])));
        let (reconciler, trigger, rx) =
            NodeWatchReconciler::new(attachments, node_backend, StdDuration::from_secs(300));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        trigger.fire();
        stop_tx.send(()).unwrap();

        // Stop must win even though work is already pending in the channel.
        tokio::time::timeout(
            StdDuration::from_secs(1),
            reconciler.run(rx, stop_rx, StdDuration::from_secs(60)),
        )
        .await
        .expect("reconciler did not stop promptly");
    }
}
