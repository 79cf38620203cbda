//! Client for the RDS storage appliance's SSH/CLI control plane.
//!
//! The appliance is a RouterOS-based device that exports file-backed disks
//! as NVMe/TCP subsystems. This crate owns command serialization, output
//! parsing, and the reconnecting session that keeps talking to it even
//! through appliance restarts.

pub mod client;
pub mod error;
pub mod parser;
pub mod transport;
pub mod types;

pub use client::ApplianceClient;
pub use error::{ApplianceError, Result};
pub use transport::{CommandRunner, SshConfig, SshTransport};
pub use types::{SlotName, SnapshotInfo, VolumeInfo, MIN_VOLUME_SIZE_BYTES};
