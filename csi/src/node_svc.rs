//! Implements the CSI Node RPCs: connect/stage/publish and their inverses,
//! plus stale-mount recovery and volume stats.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::statvfs::statvfs;
use parking_lot::Mutex;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use crate::breaker::{BreakerOutcome, CircuitBreaker};
use crate::connector::{ConnectConfig, NvmeConnector, NvmeTarget};
use crate::csi::node_server::Node;
use crate::csi::{
    node_service_capability, volume_capability, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeServiceCapability, NodeStageVolumeRequest, NodeStageVolumeResponse, NodeUnpublishVolumeRequest,
    NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Topology, VolumeCapability,
    VolumeCondition, VolumeUsage,
};
use crate::error::DriverError;
use crate::filter::NqnFilter;
use crate::mount::MountTable;
use crate::resolver::Resolver;
use crate::stale_mount::StaleMountChecker;

use crate::controller_svc::is_block;

const DEVICE_FILE_NAME: &str = "device";
const MAX_VOLUMES_PER_NODE: i64 = 256;
const CONNECT_MAX_RETRIES: u32 = 5;

fn mount_options(capability: &VolumeCapability, readonly: bool) -> (String, Vec<String>) {
    let mut options = vec!["nosuid".to_string(), "nodev".to_string(), "noexec".to_string()];
    let fs_type = match &capability.access_type {
        Some(volume_capability::AccessType::Mount(mount)) => {
            options.extend(mount.mount_flags.iter().cloned());
            mount.fs_type.clone()
        }
        _ => String::new(),
    };
    if readonly {
        options.push("ro".to_string());
    }
    (fs_type, options)
}

pub struct NodeService {
    connector: Arc<NvmeConnector>,
    resolver: Arc<Resolver>,
    mounts: Arc<dyn MountTable>,
    stale_checker: Arc<StaleMountChecker>,
    breaker: Arc<CircuitBreaker>,
    nqn_filter: NqnFilter,
    node_id: String,
    connect_config: ConnectConfig,
    staging_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl NodeService {
    pub fn new(
        connector: Arc<NvmeConnector>,
        resolver: Arc<Resolver>,
        mounts: Arc<dyn MountTable>,
        stale_checker: Arc<StaleMountChecker>,
        breaker: Arc<CircuitBreaker>,
        nqn_filter: NqnFilter,
        node_id: String,
        connect_config: ConnectConfig,
    ) -> Self {
        Self {
            connector,
            resolver,
            mounts,
            stale_checker,
            breaker,
            nqn_filter,
            node_id,
            connect_config,
            staging_locks: Mutex::new(HashMap::new()),
        }
    }

    /// A per-staging-path lock so concurrent Stage/Publish calls for the
    /// same volume serialize their stale-mount recovery.
    fn lock_for(&self, staging_path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.staging_locks
            .lock()
            .entry(staging_path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn nqn_for(&self, volume_id: &str) -> String {
        format!("{}{volume_id}", self.nqn_filter.prefix())
    }

    fn device_file(staging_path: &Path) -> PathBuf {
        staging_path.join(DEVICE_FILE_NAME)
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    #[instrument(skip(self, request))]
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        let staging_path = PathBuf::from(&req.staging_target_path);
        let _guard = self.lock_for(&staging_path).lock_owned().await;

        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| DriverError::InvalidArgument("missing volume_capability".into()))?;

        let nqn = req
            .volume_context
            .get("nqn")
            .cloned()
            .unwrap_or_else(|| self.nqn_for(&req.volume_id));
        let addr = req
            .volume_context
            .get("targetAddr")
            .cloned()
            .ok_or_else(|| DriverError::InvalidArgument("volume_context missing targetAddr".into()))?;
        let port: u16 = req
            .volume_context
            .get("targetPort")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| DriverError::InvalidArgument("volume_context missing targetPort".into()))?;

        let target = NvmeTarget { addr, port, nqn: nqn.clone() };
        let device = self
            .connector
            .connect_with_retry(&target, &self.connect_config, CONNECT_MAX_RETRIES)
            .await
            .map_err(DriverError::from)?;

        if is_block(capability) {
            tokio::fs::create_dir_all(&staging_path).await.map_err(DriverError::from)?;
            let device_file = Self::device_file(&staging_path);
            let device_str = device.to_string_lossy().to_string();
            self.mounts.make_file(&device_file).map_err(DriverError::from)?;
            tokio::fs::write(&device_file, device_str).await.map_err(DriverError::from)?;
            return Ok(Response::new(NodeStageVolumeResponse {}));
        }

        let (fs_type, options) = mount_options(capability, false);
        let mounts = self.mounts.clone();
        let stale_checker = self.stale_checker.clone();
        let nqn_for_breaker = nqn.clone();
        let device_for_breaker = device.clone();
        let staging_for_breaker = staging_path.clone();
        let fs_type_for_breaker = fs_type.clone();
        let options_for_breaker = options.clone();
        let outcome = self
            .breaker
            .call(&req.volume_id, move || async move {
                if mounts.is_likely_mount_point(&staging_for_breaker)? {
                    stale_checker
                        .recover(&staging_for_breaker, &nqn_for_breaker, &fs_type_for_breaker, &options_for_breaker)
                        .await?;
                    return Ok::<(), crate::stale_mount::StaleMountError>(());
                }
                if !mounts.is_formatted(&device_for_breaker).await? {
                    mounts.format(&device_for_breaker, &fs_type_for_breaker).await?;
                }
                tokio::fs::create_dir_all(&staging_for_breaker)
                    .await
                    .map_err(crate::mount::MountError::from)?;
                mounts
                    .mount(&device_for_breaker, &staging_for_breaker, &fs_type_for_breaker, &options_for_breaker)
                    .await?;
                Ok(())
            })
            .await;

        match outcome {
            Ok(()) => {}
            Err(BreakerOutcome::Open) => {
                return Err(DriverError::Unavailable(format!(
                    "circuit breaker open for volume {}",
                    req.volume_id
                ))
                .into());
            }
            Err(BreakerOutcome::OperationFailed(err)) => return Err(DriverError::from(err).into()),
        }

        info!(volume_id = %req.volume_id, device = %device.display(), "volume staged");
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        let staging_path = PathBuf::from(&req.staging_target_path);
        let _guard = self.lock_for(&staging_path).lock_owned().await;

        let device_file = Self::device_file(&staging_path);
        let nqn = self.nqn_for(&req.volume_id);

        if device_file.exists() {
            tokio::fs::remove_file(&device_file).await.map_err(DriverError::from)?;
            tokio::fs::remove_dir_all(&staging_path).await.ok();
        } else if self.mounts.is_likely_mount_point(&staging_path).map_err(DriverError::from)? {
            self.mounts.unmount(&staging_path).await.map_err(DriverError::from)?;
        }

        self.connector.disconnect(&nqn, &self.nqn_filter).await.map_err(DriverError::from)?;
        self.resolver.invalidate(&nqn);

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let staging_path = PathBuf::from(&req.staging_target_path);
        let target_path = PathBuf::from(&req.target_path);
        let _guard = self.lock_for(&staging_path).lock_owned().await;

        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| DriverError::InvalidArgument("missing volume_capability".into()))?;
        let nqn = req.volume_context.get("nqn").cloned().unwrap_or_else(|| self.nqn_for(&req.volume_id));

        if is_block(capability) {
            let device_file = Self::device_file(&staging_path);
            let device_str = tokio::fs::read_to_string(&device_file).await.map_err(DriverError::from)?;
            let device = PathBuf::from(device_str.trim());
            if !device.exists() {
                return Err(DriverError::NotFound(format!("device {} no longer present", device.display())).into());
            }
            self.mounts.make_file(&target_path).map_err(DriverError::from)?;
            let mut options = vec![];
            if req.readonly {
                options.push("ro".to_string());
            }
            self.mounts.bind(&device, &target_path, &options).await.map_err(DriverError::from)?;
            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        let (fs_type, options) = mount_options(capability, req.readonly);
        self.stale_checker
            .recover(&staging_path, &nqn, &fs_type, &options)
            .await
            .map_err(DriverError::from)?;

        tokio::fs::create_dir_all(&target_path).await.map_err(DriverError::from)?;
        self.mounts.bind(&staging_path, &target_path, &options).await.map_err(DriverError::from)?;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let target_path = PathBuf::from(&req.target_path);
        if self.mounts.is_likely_mount_point(&target_path).map_err(DriverError::from)? {
            self.mounts.unmount(&target_path).await.map_err(DriverError::from)?;
        }
        if target_path.is_dir() {
            tokio::fs::remove_dir_all(&target_path).await.ok();
        } else {
            tokio::fs::remove_file(&target_path).await.ok();
        }
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        let volume_path = PathBuf::from(&req.volume_path);
        let nqn = self.nqn_for(&req.volume_id);

        let stale = self
            .stale_checker
            .is_stale(&volume_path, &nqn)
            .await
            .unwrap_or(false);

        let usage = tokio::task::spawn_blocking(move || statvfs(&volume_path))
            .await
            .map_err(|e| DriverError::Internal(e.to_string()))?
            .ok();

        let usage = usage.map(|stats| {
            let block_size = stats.fragment_size() as i64;
            let total = stats.blocks() as i64 * block_size;
            let available = stats.blocks_available() as i64 * block_size;
            VolumeUsage {
                available,
                total,
                used: total - available,
                unit: 1, // BYTES
            }
        });

        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: usage.into_iter().collect(),
            volume_condition: Some(VolumeCondition {
                abnormal: stale,
                message: if stale {
                    "stale mount detected, recovery pending".to_string()
                } else {
                    String::new()
                },
            }),
        }))
    }

    #[instrument(skip(self, request))]
    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let is_block_mode = req.volume_capability.as_ref().map(is_block).unwrap_or(false);
        if is_block_mode {
            return Ok(Response::new(NodeExpandVolumeResponse { capacity_bytes: 0 }));
        }

        let staging_path = PathBuf::from(&req.staging_target_path);
        let volume_path = PathBuf::from(&req.volume_path);
        let nqn = self.nqn_for(&req.volume_id);
        let device = self.resolver.resolve(&nqn).map_err(DriverError::from)?;

        let fs_type = req
            .volume_capability
            .as_ref()
            .and_then(|c| match &c.access_type {
                Some(volume_capability::AccessType::Mount(m)) => Some(m.fs_type.clone()),
                _ => None,
            })
            .unwrap_or_default();

        self.mounts
            .resize_filesystem(&device, if staging_path.as_os_str().is_empty() { &volume_path } else { &staging_path }, &fs_type)
            .await
            .map_err(DriverError::from)?;

        let stats = statvfs(&volume_path).map_err(|e| DriverError::Internal(e.to_string()))?;
        let capacity_bytes = stats.blocks() as i64 * stats.fragment_size() as i64;
        Ok(Response::new(NodeExpandVolumeResponse { capacity_bytes }))
    }

    #[instrument(skip(self, _request))]
    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        use node_service_capability::{rpc, Rpc};
        let rpcs = [rpc::Type::StageUnstageVolume, rpc::Type::GetVolumeStats, rpc::Type::ExpandVolume];
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: rpcs
                .into_iter()
                .map(|t| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(Rpc { r#type: t as i32 })),
                })
                .collect(),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn node_get_info(&self, _request: Request<NodeGetInfoRequest>) -> Result<Response<NodeGetInfoResponse>, Status> {
        let mut segments = HashMap::new();
        segments.insert("topology.rds.csi.example.com/node".to_string(), self.node_id.clone());
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: MAX_VOLUMES_PER_NODE,
            accessible_topology: Some(Topology { segments }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_options_includes_safety_flags_and_readonly() {
        let capability = VolumeCapability {
            access_type: Some(volume_capability::AccessType::Mount(volume_capability::MountVolume {
                fs_type: "ext4".to_string(),
                mount_flags: vec!["noatime".to_string()],
            })),
            access_mode: 1,
        };
        let (fs_type, options) = mount_options(&capability, true);
        assert_eq!(fs_type, "ext4");
        assert!(options.contains(&"nosuid".to_string()));
        assert!(options.contains(&"noatime".to_string()));
        assert!(options.contains(&"ro".to_string()));
    }
}
