//! Implements the CSI Controller RPCs on top of the appliance client and
//! attachment manager.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node as K8sNode;
use kube::Api;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use appliance::ApplianceClient;

use crate::attachment::{AccessMode as AttachAccessMode, AttachmentManager};
use crate::csi::controller_server::Controller;
use crate::csi::{
    controller_service_capability, volume_capability, AccessMode, ControllerExpandVolumeRequest,
    ControllerExpandVolumeResponse, ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, ListSnapshotsRequest,
    ListSnapshotsResponse, Snapshot, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse,
    Volume, VolumeCapability,
};
use crate::error::DriverError;
use crate::filter::NqnFilter;

/// Is this capability block mode (as opposed to a mounted filesystem)?
pub fn is_block(capability: &VolumeCapability) -> bool {
    matches!(capability.access_type, Some(volume_capability::AccessType::Block(_)))
}

/// RWX (any of the multi-node access modes) requested?
fn is_rwx(access_mode: i32) -> bool {
    matches!(
        AccessMode::try_from(access_mode),
        Ok(AccessMode::MultiNodeReaderOnly)
            | Ok(AccessMode::MultiNodeSingleWriter)
            | Ok(AccessMode::MultiNodeMultiWriter)
    )
}

/// Deterministic FNV-1a hash, used to derive a slot name that always
/// satisfies the appliance's `[A-Za-z0-9_.-]+` charset regardless of what
/// characters the CSI volume name contains.
fn slot_for(name: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("pvc-{hash:016x}")
}

pub struct ControllerService {
    appliance: Arc<ApplianceClient>,
    attachments: Arc<AttachmentManager>,
    kube_client: kube::Client,
    nqn_filter: NqnFilter,
    nvme_target_addr: String,
    nvme_target_port: u16,
}

impl ControllerService {
    pub fn new(
        appliance: Arc<ApplianceClient>,
        attachments: Arc<AttachmentManager>,
        kube_client: kube::Client,
        nqn_filter: NqnFilter,
        nvme_target_addr: String,
        nvme_target_port: u16,
    ) -> Self {
        Self {
            appliance,
            attachments,
            kube_client,
            nqn_filter,
            nvme_target_addr,
            nvme_target_port,
        }
    }

    fn nqn_for(&self, slot: &str) -> String {
        format!("{}{slot}", self.nqn_filter.prefix())
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    #[instrument(skip(self, request))]
    async fn create_volume(&self, request: Request<CreateVolumeRequest>) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        // RWX-block is permitted; RWX-filesystem is rejected here.
        if req
            .volume_capabilities
            .iter()
            .any(|c| !is_block(c) && is_rwx(c.access_mode))
        {
            return Err(DriverError::InvalidArgument("RWX is only supported for block volumes".into()).into());
        }

        let slot = slot_for(&req.name);
        let base_path = req.parameters.get("basePath").cloned();
        let snapshot_src = match req.volume_content_source_id.as_str() {
            "" => None,
            id => Some(id.to_string()),
        };

        let info = self
            .appliance
            .create_volume(&slot, req.required_bytes.max(0) as u64, base_path.as_deref(), snapshot_src.as_deref())
            .await
            .map_err(DriverError::from)?;

        self.appliance.export_nvme(&slot, &self.nqn_for(&slot)).await.map_err(DriverError::from)?;

        info!(slot, volume_id = %info.nqn, "volume created");

        let mut volume_context = std::collections::HashMap::new();
        volume_context.insert("nqn".to_string(), info.nqn.clone());
        volume_context.insert("targetAddr".to_string(), self.nvme_target_addr.clone());
        volume_context.insert("targetPort".to_string(), self.nvme_target_port.to_string());

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: info.size_bytes as i64,
                volume_id: slot,
                volume_context,
            }),
        }))
    }

    #[instrument(skip(self, request))]
    async fn delete_volume(&self, request: Request<DeleteVolumeRequest>) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        self.appliance.unexport_nvme(&req.volume_id).await.map_err(DriverError::from)?;
        self.appliance.delete_volume(&req.volume_id).await.map_err(DriverError::from)?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();

        let nodes: Api<K8sNode> = Api::all(self.kube_client.clone());
        nodes
            .get(&req.node_id)
            .await
            .map_err(|e| DriverError::NotFound(format!("node {}: {e}", req.node_id)))?;

        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| DriverError::InvalidArgument("missing volume_capability".into()))?;
        let access_mode = if is_rwx(capability.access_mode) {
            AttachAccessMode::MultiNodeWriterBlock
        } else {
            AttachAccessMode::SingleNodeWriter
        };

        let token = self
            .attachments
            .publish(&req.volume_id, &req.node_id, access_mode)
            .await
            .map_err(DriverError::from)?;

        let mut publish_context = std::collections::HashMap::new();
        publish_context.insert("attachToken".to_string(), token);
        Ok(Response::new(ControllerPublishVolumeResponse { publish_context }))
    }

    #[instrument(skip(self, request))]
    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.attachments.unpublish(&req.volume_id, &req.node_id).await.map_err(DriverError::from)?;
        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        for capability in &req.volume_capabilities {
            if !is_block(capability) && is_rwx(capability.access_mode) {
                return Ok(Response::new(ValidateVolumeCapabilitiesResponse {
                    confirmed: false,
                    message: "RWX is rejected for filesystem-mode volumes".to_string(),
                }));
            }
        }
        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed: true,
            message: String::new(),
        }))
    }

    #[instrument(skip(self, request))]
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let info = self
            .appliance
            .resize_volume(&req.volume_id, req.required_bytes.max(0) as u64)
            .await
            .map_err(DriverError::from)?;

        let node_expansion_required = !req.volume_capability.as_ref().map(is_block).unwrap_or(false);
        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: info.size_bytes as i64,
            node_expansion_required,
        }))
    }

    #[instrument(skip(self, request))]
    async fn create_snapshot(&self, request: Request<CreateSnapshotRequest>) -> Result<Response<CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        let snap_slot = slot_for(&format!("snap-{}-{}", req.source_volume_id, req.name));
        let snap = self
            .appliance
            .create_snapshot(&req.source_volume_id, &snap_slot)
            .await
            .map_err(DriverError::from)?;
        Ok(Response::new(CreateSnapshotResponse {
            snapshot: Some(Snapshot {
                size_bytes: snap.size_bytes as i64,
                snapshot_id: snap.slot,
                source_volume_id: snap.source_slot,
                ready_to_use: true,
            }),
        }))
    }

    #[instrument(skip(self, request))]
    async fn delete_snapshot(&self, request: Request<DeleteSnapshotRequest>) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        self.appliance.delete_snapshot(&req.snapshot_id).await.map_err(DriverError::from)?;
        Ok(Response::new(DeleteSnapshotResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn list_snapshots(&self, request: Request<ListSnapshotsRequest>) -> Result<Response<ListSnapshotsResponse>, Status> {
        let req = request.into_inner();
        let snaps = self.appliance.list_snapshots("").await.map_err(DriverError::from)?;
        Ok(Response::new(ListSnapshotsResponse {
            entries: snaps
                .into_iter()
                .filter(|s| req.source_volume_id.is_empty() || s.source_slot == req.source_volume_id)
                .map(|s| Snapshot {
                    size_bytes: s.size_bytes as i64,
                    snapshot_id: s.slot,
                    source_volume_id: s.source_slot,
                    ready_to_use: true,
                })
                .collect(),
            next_token: String::new(),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        use controller_service_capability::{rpc, Rpc};
        let rpcs = [
            rpc::Type::CreateDeleteVolume,
            rpc::Type::PublishUnpublishVolume,
            rpc::Type::CreateDeleteSnapshot,
            rpc::Type::ListSnapshots,
            rpc::Type::ExpandVolume,
        ];
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: rpcs
                .into_iter()
                .map(|t| ControllerServiceCapability {
                    r#type: Some(controller_service_capability::Type::Rpc(Rpc { r#type: t as i32 })),
                })
                .collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_for_is_deterministic_and_charset_safe() {
        let a = slot_for("my volume/with slashes");
        let b = slot_for("my volume/with slashes");
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
    }

    #[test]
    fn different_names_produce_different_slots() {
        assert_ne!(slot_for("volume-a"), slot_for("volume-b"));
    }
}
