//! CSI Identity service: driver metadata and readiness. `Probe` reports
//! ready once the controller has completed its first successful appliance
//! connection, or once the node has validated its NQN filter — whichever
//! this instance is running as.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::csi::identity_server::Identity;
use crate::csi::{
    plugin_capability, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};

pub const DRIVER_NAME: &str = "rds.csi.example.com";

/// Flipped to `true` exactly once, by whichever startup path (controller's
/// first appliance connection, node's NQN filter validation) applies.
#[derive(Clone, Default)]
pub struct ReadinessFlag(Arc<AtomicBool>);

impl ReadinessFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct IdentityService {
    has_controller_capability: bool,
    readiness: ReadinessFlag,
}

impl IdentityService {
    pub fn new(has_controller_capability: bool, readiness: ReadinessFlag) -> Self {
        Self {
            has_controller_capability,
            readiness,
        }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    #[instrument(skip(self, _request))]
    async fn get_plugin_info(&self, _request: Request<GetPluginInfoRequest>) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: git_version::git_version!(fallback = "unknown").to_string(),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let mut capabilities = vec![PluginCapability {
            r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
                r#type: plugin_capability::service::Type::VolumeAccessibilityConstraints as i32,
            })),
        }];
        if self.has_controller_capability {
            capabilities.push(PluginCapability {
                r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
                    r#type: plugin_capability::service::Type::ControllerService as i32,
                })),
            });
        }
        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    #[instrument(skip(self, _request))]
    async fn probe(&self, _request: Request<ProbeRequest>) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse {
            ready: self.readiness.is_ready(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_reports_not_ready_until_marked() {
        let readiness = ReadinessFlag::new();
        let svc = IdentityService::new(true, readiness.clone());
        let resp = svc.probe(Request::new(ProbeRequest {})).await.unwrap();
        assert!(!resp.into_inner().ready);

        readiness.mark_ready();
        let resp = svc.probe(Request::new(ProbeRequest {})).await.unwrap();
        assert!(resp.into_inner().ready);
    }

    #[tokio::test]
    async fn node_instance_omits_controller_capability() {
        let svc = IdentityService::new(false, ReadinessFlag::new());
        let resp = svc
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap();
        let caps = resp.into_inner().capabilities;
        assert_eq!(caps.len(), 1);
    }
}
