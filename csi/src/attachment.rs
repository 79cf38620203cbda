//! Rebuilds attachment state from the cluster's `VolumeAttachment` objects
//! at startup and on change; enforces single-writer; tracks migration
//! pairs. `VolumeAttachment` objects are authoritative —
//! the in-memory map here is derived, never the other way around. An
//! earlier design derived attachments from persistent-volume annotations;
//! a stale annotation caused a multi-hour outage when a controller
//! restart rebuilt attachments that no longer existed, so
//! annotations here are write-only breadcrumbs, never read back.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error, Clone)]
pub enum AttachError {
    #[error("attachment conflict: {0}")]
    Conflict(String),
    #[error("kubernetes api error: {0}")]
    Cluster(String),
}

impl From<kube::Error> for AttachError {
    fn from(e: kube::Error) -> Self {
        AttachError::Cluster(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AttachError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// RWO, any volume mode.
    SingleNodeWriter,
    /// RWX, block mode only — rejected at the CSI boundary for filesystem
    /// mode before it ever reaches here.
    MultiNodeWriterBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Attached,
    Migrating,
    Detaching,
}

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub volume_id: String,
    pub node_id: String,
    pub state: AttachState,
    pub access_mode: AccessMode,
    pub attached_at: DateTime<Utc>,
    pub migration_partner: Option<String>,
    pub grace_deadline: Option<DateTime<Utc>>,
}

/// Plain view of a cluster `VolumeAttachment`, independent of the
/// `k8s-openapi` type so the in-memory reconstruction logic can be unit
/// tested against a fake backend.
#[derive(Debug, Clone)]
pub struct VolumeAttachmentView {
    pub volume_id: String,
    pub node_id: String,
    pub attached: bool,
    pub attached_at: DateTime<Utc>,
}

/// Seam between the attachment manager and the Kubernetes API, so tests
/// drive reconstruction and annotation logic without a real cluster.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn list_volume_attachments(&self, driver_name: &str) -> Result<Vec<VolumeAttachmentView>>;
    async fn annotate_persistent_volume(&self, pv_name: &str, annotations: HashMap<String, String>) -> Result<()>;
}

pub struct KubeBackend {
    client: kube::Client,
}

impl KubeBackend {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    async fn list_volume_attachments(&self, driver_name: &str) -> Result<Vec<VolumeAttachmentView>> {
        use k8s_openapi::api::storage::v1::VolumeAttachment;

        let api: kube::Api<VolumeAttachment> = kube::Api::all(self.client.clone());
        let list = api.list(&Default::default()).await?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|va| {
                let spec = va.spec;
                if spec.attacher != driver_name {
                    return None;
                }
                let volume_id = spec.source.persistent_volume_name?;
                let node_id = spec.node_name;
                let attached = va.status.map(|s| s.attached).unwrap_or(false);
                let attached_at = va
                    .metadata
                    .creation_timestamp
                    .map(|t| t.0)
                    .unwrap_or_else(Utc::now);
                Some(VolumeAttachmentView {
                    volume_id,
                    node_id,
                    attached,
                    attached_at,
                })
            })
            .collect())
    }

    async fn annotate_persistent_volume(&self, pv_name: &str, annotations: HashMap<String, String>) -> Result<()> {
        use k8s_openapi::api::core::v1::PersistentVolume;
        use kube::api::{Patch, PatchParams};

        let api: kube::Api<PersistentVolume> = kube::Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(pv_name, &PatchParams::apply("rds-csi-plugin"), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

/// Annotation keys written for operator debugging only; never read back.
pub const ANNOTATION_ATTACHED_NODE: &str = "rds.csi/attached-node";
pub const ANNOTATION_ATTACHED_AT: &str = "rds.csi/attached-at";
pub const ANNOTATION_RESET_BREAKER: &str = "reset-circuit-breaker";

pub struct AttachmentManager {
    backend: std::sync::Arc<dyn ClusterBackend>,
    driver_name: String,
    migration_grace: Duration,
    map: Mutex<HashMap<String, Vec<AttachmentRecord>>>,
}

impl AttachmentManager {
    pub fn new(backend: std::sync::Arc<dyn ClusterBackend>, driver_name: impl Into<String>, migration_grace: Duration) -> Self {
        Self {
            backend,
            driver_name: driver_name.into(),
            migration_grace,
            map: Mutex::new(HashMap::new()),
        }
    }

    /// List every `VolumeAttachment` for this driver and rebuild the
    /// in-memory map. Two attached records for the same volume on
    /// different nodes reconstruct a `Migrating` pair, older record as
    /// the source, grace deadline derived from its attach timestamp.
    #[instrument(skip(self))]
    pub async fn rebuild(&self) -> Result<()> {
        let views = self.backend.list_volume_attachments(&self.driver_name).await?;
        let mut by_volume: HashMap<String, Vec<VolumeAttachmentView>> = HashMap::new();
        for view in views.into_iter().filter(|v| v.attached) {
            by_volume.entry(view.volume_id.clone()).or_default().push(view);
        }

        let mut map = self.map.lock();
        map.clear();
        for (volume_id, mut views) in by_volume {
            views.sort_by_key(|v| v.attached_at);
            let records = match views.len() {
                1 => vec![AttachmentRecord {
                    volume_id: volume_id.clone(),
                    node_id: views[0].node_id.clone(),
                    state: AttachState::Attached,
                    access_mode: AccessMode::SingleNodeWriter,
                    attached_at: views[0].attached_at,
                    migration_partner: None,
                    grace_deadline: None,
                }],
                _ => {
                    let source = &views[0];
                    let target = &views[1];
                    let grace_deadline = source.attached_at + self.migration_grace;
                    vec![
                        AttachmentRecord {
                            volume_id: volume_id.clone(),
                            node_id: source.node_id.clone(),
                            state: AttachState::Migrating,
                            access_mode: AccessMode::MultiNodeWriterBlock,
                            attached_at: source.attached_at,
                            migration_partner: Some(target.node_id.clone()),
                            grace_deadline: Some(grace_deadline),
                        },
                        AttachmentRecord {
                            volume_id: volume_id.clone(),
                            node_id: target.node_id.clone(),
                            state: AttachState::Migrating,
                            access_mode: AccessMode::MultiNodeWriterBlock,
                            attached_at: target.attached_at,
                            migration_partner: Some(source.node_id.clone()),
                            grace_deadline: Some(grace_deadline),
                        },
                    ]
                }
            };
            info!(volume_id, records = records.len(), "rebuilt attachment record");
            map.insert(volume_id, records);
        }
        Ok(())
    }

    /// `Publish(volumeID, nodeID, accessMode) -> attachToken`. No I/O
    /// happens inside the map's critical section; the annotation write
    /// happens after the lock is released.
    #[instrument(skip(self))]
    pub async fn publish(&self, volume_id: &str, node_id: &str, access_mode: AccessMode) -> Result<String> {
        let now = Utc::now();
        let outcome = {
            let mut map = self.map.lock();
            let records = map.entry(volume_id.to_string()).or_default();

            if let Some(existing) = records.iter().find(|r| r.node_id == node_id) {
                return Ok(attach_token(volume_id, &existing.node_id));
            }

            match access_mode {
                AccessMode::SingleNodeWriter => match records.len() {
                    0 => {
                        records.push(AttachmentRecord {
                            volume_id: volume_id.to_string(),
                            node_id: node_id.to_string(),
                            state: AttachState::Attached,
                            access_mode,
                            attached_at: now,
                            migration_partner: None,
                            grace_deadline: None,
                        });
                        Ok(())
                    }
                    1 => {
                        let other_attached_at = records[0].attached_at;
                        if now - other_attached_at <= self.migration_grace {
                            let other_node = records[0].node_id.clone();
                            let grace_deadline = other_attached_at + self.migration_grace;
                            records[0].state = AttachState::Migrating;
                            records[0].migration_partner = Some(node_id.to_string());
                            records[0].grace_deadline = Some(grace_deadline);
                            records.push(AttachmentRecord {
                                volume_id: volume_id.to_string(),
                                node_id: node_id.to_string(),
                                state: AttachState::Migrating,
                                access_mode,
                                attached_at: now,
                                migration_partner: Some(other_node.clone()),
                                grace_deadline: Some(grace_deadline),
                            });
                            Ok(())
                        } else {
                            let other_node = records[0].node_id.clone();
                            Err(AttachError::Conflict(format!(
                                "volume {volume_id} already attached to node {other_node}, outside migration grace window"
                            )))
                        }
                    }
                    _ => Err(AttachError::Conflict(format!(
                        "volume {volume_id} already has two attachments"
                    ))),
                },
                AccessMode::MultiNodeWriterBlock => {
                    if records.len() < 2 {
                        records.push(AttachmentRecord {
                            volume_id: volume_id.to_string(),
                            node_id: node_id.to_string(),
                            state: AttachState::Attached,
                            access_mode,
                            attached_at: now,
                            migration_partner: None,
                            grace_deadline: None,
                        });
                        Ok(())
                    } else {
                        Err(AttachError::Conflict(format!(
                            "volume {volume_id} already attached to two nodes"
                        )))
                    }
                }
            }
        };

        outcome?;

        let mut annotations = HashMap::new();
        annotations.insert(ANNOTATION_ATTACHED_NODE.to_string(), node_id.to_string());
        annotations.insert(ANNOTATION_ATTACHED_AT.to_string(), now.to_rfc3339());
        if let Err(err) = self.backend.annotate_persistent_volume(volume_id, annotations).await {
            warn!(volume_id, error = %err, "failed to write informational attachment annotation");
        }

        Ok(attach_token(volume_id, node_id))
    }

    /// Idempotent. Demotes a migration partner back to `Attached` when
    /// its other half detaches.
    #[instrument(skip(self))]
    pub async fn unpublish(&self, volume_id: &str, node_id: &str) -> Result<()> {
        let mut map = self.map.lock();
        if let Some(records) = map.get_mut(volume_id) {
            if let Some(pos) = records.iter().position(|r| r.node_id == node_id) {
                let removed = records.remove(pos);
                if let Some(partner) = removed.migration_partner {
                    if let Some(p) = records.iter_mut().find(|r| r.node_id == partner) {
                        p.state = AttachState::Attached;
                        p.migration_partner = None;
                        p.grace_deadline = None;
                    }
                }
            }
            if records.is_empty() {
                map.remove(volume_id);
            }
        }
        Ok(())
    }

    /// Used by the node-watch reconciler: remove every attachment record
    /// for a node that has been deleted or is stale.
    pub fn remove_node(&self, node_id: &str) -> Vec<String> {
        let mut map = self.map.lock();
        let mut affected = Vec::new();
        map.retain(|volume_id, records| {
            let before = records.len();
            records.retain(|r| r.node_id != node_id);
            if records.len() != before {
                affected.push(volume_id.clone());
            }
            !records.is_empty()
        });
        affected
    }

    pub fn records_for(&self, volume_id: &str) -> Vec<AttachmentRecord> {
        self.map.lock().get(volume_id).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn attach_token(volume_id: &str, node_id: &str) -> String {
    format!("{volume_id}:{node_id}")
}

#[cfg(any(test, feature = "test-util"))]
pub struct FakeClusterBackend {
    pub views: Mutex<Vec<VolumeAttachmentView>>,
    pub annotated: Mutex<HashMap<String, HashMap<String, String>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for FakeClusterBackend {
    fn default() -> Self {
        Self {
            views: Mutex::new(Vec::new()),
            annotated: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl ClusterBackend for FakeClusterBackend {
    async fn list_volume_attachments(&self, _driver_name: &str) -> Result<Vec<VolumeAttachmentView>> {
        Ok(self.views.lock().clone())
    }

    async fn annotate_persistent_volume(&self, pv_name: &str, annotations: HashMap<String, String>) -> Result<()> {
        self.annotated.lock().insert(pv_name.to_string(), annotations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager(grace: Duration) -> (Arc<FakeClusterBackend>, AttachmentManager) {
        let backend = Arc::new(FakeClusterBackend::default());
        let manager = AttachmentManager::new(backend.clone(), "rds.csi.example.com", grace);
        (backend, manager)
    }

    #[tokio::test]
    async fn publish_on_empty_volume_succeeds() {
        let (_backend, manager) = manager(Duration::from_secs(30));
        manager.publish("pvc-aaa", "node-a", AccessMode::SingleNodeWriter).await.unwrap();
        assert_eq!(manager.records_for("pvc-aaa").len(), 1);
    }

    #[tokio::test]
    async fn publish_same_node_is_idempotent() {
        let (_backend, manager) = manager(Duration::from_secs(30));
        manager.publish("pvc-aaa", "node-a", AccessMode::SingleNodeWriter).await.unwrap();
        manager.publish("pvc-aaa", "node-a", AccessMode::SingleNodeWriter).await.unwrap();
        assert_eq!(manager.records_for("pvc-aaa").len(), 1);
    }

    #[tokio::test]
    async fn publish_different_node_outside_grace_fails() {
        let (_backend, manager) = manager(Duration::from_millis(1));
        manager.publish("pvc-aaa", "node-a", AccessMode::SingleNodeWriter).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = manager.publish("pvc-aaa", "node-b", AccessMode::SingleNodeWriter).await.unwrap_err();
        assert!(matches!(err, AttachError::Conflict(_)));
    }

    #[tokio::test]
    async fn publish_different_node_within_grace_creates_migration_pair() {
        let (_backend, manager) = manager(Duration::from_secs(30));
        manager.publish("pvc-aaa", "node-a", AccessMode::SingleNodeWriter).await.unwrap();
        manager.publish("pvc-aaa", "node-b", AccessMode::SingleNodeWriter).await.unwrap();
        let records = manager.records_for("pvc-aaa");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.state == AttachState::Migrating));
    }

    #[tokio::test]
    async fn unpublish_demotes_migration_partner() {
        let (_backend, manager) = manager(Duration::from_secs(30));
        manager.publish("pvc-aaa", "node-a", AccessMode::SingleNodeWriter).await.unwrap();
        manager.publish("pvc-aaa", "node-b", AccessMode::SingleNodeWriter).await.unwrap();
        manager.unpublish("pvc-aaa", "node-a").await.unwrap();
        let records = manager.records_for("pvc-aaa");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, AttachState::Attached);
        assert!(records[0].migration_partner.is_none());
    }

    #[tokio::test]
    async fn unpublish_unknown_attachment_is_a_noop() {
        let (_backend, manager) = manager(Duration::from_secs(30));
        assert!(manager.unpublish("pvc-missing", "node-a").await.is_ok());
    }

    #[tokio::test]
    async fn rwx_block_allows_exactly_two_nodes() {
        let (_backend, manager) = manager(Duration::from_secs(30));
        manager.publish("pvc-aaa", "node-a", AccessMode::MultiNodeWriterBlock).await.unwrap();
        manager.publish("pvc-aaa", "node-b", AccessMode::MultiNodeWriterBlock).await.unwrap();
        let err = manager
            .publish("pvc-aaa", "node-c", AccessMode::MultiNodeWriterBlock)
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::Conflict(_)));
    }

    #[tokio::test]
    async fn rebuild_reconstructs_migration_pair_from_cluster_state() {
        let (backend, manager) = manager(Duration::from_secs(30));
        let now = Utc::now();
        backend.views.lock().push(VolumeAttachmentView {
            volume_id: "pvc-aaa".into(),
            node_id: "node-a".into(),
            attached: true,
            attached_at: now,
        });
        backend.views.lock().push(VolumeAttachmentView {
            volume_id: "pvc-aaa".into(),
            node_id: "node-b".into(),
            attached: true,
            attached_at: now + chrono::Duration::seconds(5),
        });
        manager.rebuild().await.unwrap();
        let records = manager.records_for("pvc-aaa");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.state == AttachState::Migrating));
    }

    #[test]
    fn remove_node_clears_its_records_only() {
        let (_backend, manager) = manager(Duration::from_secs(30));
        {
            let mut map = manager.map.lock();
            map.insert(
                "pvc-aaa".into(),
                vec![AttachmentRecord {
                    volume_id: "pvc-aaa".into(),
                    node_id: "node-a".into(),
                    state: AttachState::Attached,
                    access_mode: AccessMode::SingleNodeWriter,
                    attached_at: Utc::now(),
                    migration_partner: None,
                    grace_deadline: None,
                }],
            );
        }
        let affected = manager.remove_node("node-a");
        assert_eq!(affected, vec!["pvc-aaa".to_string()]);
        assert!(manager.is_empty());
    }
}
