//! CSI controller and node plugin for NVMe/TCP volumes served by the RDS
//! storage appliance. See `SPEC_FULL.md` at the repository root.

pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod attachment;
pub mod breaker;
pub mod config;
pub mod connector;
pub mod controller_svc;
pub mod error;
pub mod filter;
pub mod identity;
pub mod mount;
pub mod node_svc;
pub mod reconciler;
pub mod resolver;
pub mod stale_mount;
