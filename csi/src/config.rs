//! Driver configuration: one `clap` derive struct per mode (controller,
//! node), each flag also readable from an environment variable (`clap`'s
//! `env` feature), matching the Helm-templated / ConfigMap-sourced
//! deployment pattern real CSI driver pods use.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::filter::NqnFilter;

#[derive(Parser, Debug)]
#[command(name = "rds-csi-plugin", version = git_version::git_version!(fallback = "unknown"))]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the CSI controller service (single active replica).
    Controller(ControllerArgs),
    /// Run the CSI node service (one instance per kubelet).
    Node(NodeArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    #[arg(long, env = "RDS_CSI_SOCKET", default_value = "/var/lib/kubelet/plugins/rds.csi/csi.sock")]
    pub csi_socket: PathBuf,

    #[arg(long, env = "RDS_ENDPOINT")]
    pub rds_endpoint: String,

    /// Data-plane address nodes use for `nvme connect`; the SSH control
    /// plane and the NVMe/TCP listener are not necessarily the same host.
    #[arg(long, env = "RDS_NVME_ADDR")]
    pub rds_nvme_addr: String,

    #[arg(long, env = "RDS_NVME_PORT", default_value_t = 4420)]
    pub rds_nvme_port: u16,

    #[arg(long, env = "RDS_USER")]
    pub rds_user: String,

    #[arg(long, env = "RDS_SSH_KEY_PATH")]
    pub rds_ssh_key_path: PathBuf,

    #[arg(long, env = "MANAGED_NQN_PREFIX")]
    pub managed_nqn_prefix: String,

    #[arg(long, env = "MIGRATION_GRACE_SECONDS", default_value_t = 30)]
    pub migration_grace_seconds: u64,

    #[arg(long, env = "STALE_NODE_THRESHOLD_SECONDS", default_value_t = 300)]
    pub stale_node_threshold_seconds: u64,

    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECONDS", default_value_t = 30)]
    pub shutdown_timeout_seconds: u64,

    #[arg(long, env = "RDS_CONNECT_TIMEOUT_SECONDS", default_value_t = 10)]
    pub rds_connect_timeout_seconds: u64,

    #[arg(long, env = "RDS_COMMAND_TIMEOUT_SECONDS", default_value_t = 30)]
    pub rds_command_timeout_seconds: u64,
}

impl ControllerArgs {
    pub fn migration_grace(&self) -> Duration {
        Duration::from_secs(self.migration_grace_seconds)
    }

    pub fn stale_node_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_node_threshold_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    #[arg(long, env = "RDS_CSI_SOCKET", default_value = "/var/lib/kubelet/plugins/rds.csi/csi.sock")]
    pub csi_socket: PathBuf,

    #[arg(long, env = "NODE_ID")]
    pub node_id: String,

    #[arg(long, env = "MANAGED_NQN_PREFIX")]
    pub managed_nqn_prefix: String,

    #[arg(long, env = "CIRCUIT_BREAKER_FAILURES", default_value_t = 3)]
    pub circuit_breaker_failures: u32,

    #[arg(long, env = "CIRCUIT_BREAKER_COOLING_SECONDS", default_value_t = 300)]
    pub circuit_breaker_cooling_seconds: u64,

    #[arg(long, env = "NVME_CONNECT_TIMEOUT_SECONDS", default_value_t = 30)]
    pub nvme_connect_timeout_seconds: u64,

    #[arg(long, env = "CTRL_LOSS_TMO", default_value_t = -1)]
    pub ctrl_loss_tmo: i32,

    #[arg(long, env = "RECONNECT_DELAY_SECONDS", default_value_t = 10)]
    pub reconnect_delay_seconds: u64,

    #[arg(long, env = "MOUNT_PARSE_TIMEOUT_SECONDS", default_value_t = 10)]
    pub mount_parse_timeout_seconds: u64,

    #[arg(long, env = "DUPLICATE_MOUNT_THRESHOLD", default_value_t = 100)]
    pub duplicate_mount_threshold: usize,

    #[arg(long, env = "RESOLVER_CACHE_TTL_SECONDS", default_value_t = 10)]
    pub resolver_cache_ttl_seconds: u64,

    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECONDS", default_value_t = 30)]
    pub shutdown_timeout_seconds: u64,

    /// Periodically disconnects managed-prefix subsystems with no backing
    /// device node. Off by default: unsupervised removal of a
    /// kernel-visible subsystem is destructive, so this is opt-in.
    #[arg(long, env = "ENABLE_ORPHAN_CLEANUP", default_value_t = false)]
    pub enable_orphan_cleanup: bool,

    #[arg(long, env = "ORPHAN_SWEEP_INTERVAL_SECONDS", default_value_t = 300)]
    pub orphan_sweep_interval_seconds: u64,
}

impl NodeArgs {
    pub fn circuit_breaker_cooling(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooling_seconds)
    }

    pub fn nvme_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.nvme_connect_timeout_seconds)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }

    pub fn mount_parse_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_parse_timeout_seconds)
    }

    pub fn resolver_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.resolver_cache_ttl_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_interval_seconds)
    }
}

/// Validate and build the NQN filter for either mode. No default is
/// permitted: a missing or malformed prefix is a startup
/// failure (exit code 1), never a silently disabled feature.
pub fn validated_nqn_filter(prefix: &str) -> anyhow::Result<NqnFilter> {
    NqnFilter::new(prefix).map_err(|e| anyhow::anyhow!("invalid managed-nqn-prefix: {e}"))
}
