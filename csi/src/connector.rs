//! Connects and disconnects NVMe/TCP subsystems on the node by shelling out
//! to `nvme-cli`, mirroring how the node service in
//! `ndenev-freebsd-csi` shells out to `iscsictl`/`nvmecontrol` and
//! classifies exit status plus stderr text.

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use sysfs::{prefer_stable, Nvme};

use crate::filter::NqnFilter;

#[derive(Debug, Error, Clone)]
pub enum ConnectError {
    #[error("transient nvme-cli failure: {0}")]
    Transient(String),
    #[error("terminal nvme-cli failure: {0}")]
    Terminal(String),
    #[error("namespace for {nqn} did not appear within {timeout:?}")]
    Timeout { nqn: String, timeout: Duration },
}

impl ConnectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, ConnectError>;

#[derive(Debug, Clone)]
pub struct NvmeTarget {
    pub addr: String,
    pub port: u16,
    pub nqn: String,
}

#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub ctrl_loss_tmo: i32,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            ctrl_loss_tmo: -1,
            reconnect_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Classify `nvme-cli` stderr into retryable vs. fail-fast kinds.
/// Anything unrecognized is treated as terminal: retrying a
/// failure mode we can't name risks hammering a permanently broken target.
fn classify(stderr: &str) -> ConnectError {
    let lower = stderr.to_lowercase();
    let terminal = ["authentication failed", "invalid parameter", "not enough space"];
    if terminal.iter().any(|m| lower.contains(m)) {
        return ConnectError::Terminal(stderr.trim().to_string());
    }
    let transient = ["eof", "reset", "no device"];
    if transient.iter().any(|m| lower.contains(m)) {
        return ConnectError::Transient(stderr.trim().to_string());
    }
    ConnectError::Terminal(stderr.trim().to_string())
}

/// Owns the background health-check tasks spawned for active connections.
/// `close()` aborts every one of them; leaked tasks caused test-suite
/// timeouts historically.
pub struct NvmeConnector {
    sysfs: Nvme,
    health_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NvmeConnector {
    pub fn new(sysfs: Nvme) -> Self {
        Self {
            sysfs,
            health_tasks: Mutex::new(Vec::new()),
        }
    }

    #[instrument(skip(self, config), fields(nqn = %target.nqn, target = %target.addr))]
    pub async fn connect(&self, target: &NvmeTarget, config: &ConnectConfig) -> Result<PathBuf> {
        let output = Command::new("nvme")
            .args([
                "connect",
                "-t",
                "tcp",
                "-a",
                &target.addr,
                "-s",
                &target.port.to_string(),
                "-n",
                &target.nqn,
                "--ctrl-loss-tmo",
                &config.ctrl_loss_tmo.to_string(),
                "--reconnect-delay",
                &config.reconnect_delay.as_secs().to_string(),
            ])
            .output()
            .await
            .map_err(|e| ConnectError::Transient(format!("failed to execute nvme connect: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = classify(&stderr);
            warn!(outcome = "failed", error = %err, "nvme connect");
            return Err(err);
        }

        let path = self.wait_for_namespace(&target.nqn, config.connect_timeout).await?;
        info!(outcome = "connected", device = %path.display(), "nvme connect");
        self.spawn_health_check(target.nqn.clone());
        Ok(path)
    }

    async fn wait_for_namespace(&self, nqn: &str, bound: Duration) -> Result<PathBuf> {
        timeout(bound, async {
            loop {
                if let Some(path) = self.lookup_device(nqn) {
                    return path;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await
        .map_err(|_| ConnectError::Timeout {
            nqn: nqn.to_string(),
            timeout: bound,
        })
    }

    fn lookup_device(&self, nqn: &str) -> Option<PathBuf> {
        let controllers = self.sysfs.controllers_for_nqn(nqn).ok()?;
        for controller in controllers {
            let namespaces = self.sysfs.namespaces(&controller.name).ok()?;
            if let Some(ns) = prefer_stable(&namespaces) {
                if self.sysfs.device_node_exists(&ns.name) {
                    return Some(self.sysfs.device_path(&ns.name));
                }
            }
        }
        None
    }

    /// Polls sysfs for the subsystem every 30s and logs if it disappears.
    /// This is diagnostic only — recovery from a vanished device is the
    /// stale-mount checker's job, not the connector's.
    fn spawn_health_check(&self, nqn: String) {
        let sysfs = self.sysfs.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                match sysfs.controllers_for_nqn(&nqn) {
                    Ok(controllers) if controllers.is_empty() => {
                        warn!(nqn = %nqn, "nvme health check: subsystem no longer present");
                    }
                    Err(err) => debug!(nqn = %nqn, error = %err, "nvme health check: scan failed"),
                    _ => {}
                }
            }
        });
        self.health_tasks.lock().push(handle);
    }

    #[instrument(skip(self, config, target))]
    pub async fn connect_with_retry(
        &self,
        target: &NvmeTarget,
        config: &ConnectConfig,
        max_retries: u32,
    ) -> Result<PathBuf> {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(500);
        loop {
            match self.connect(target, config).await {
                Ok(path) => return Ok(path),
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "retrying nvme connect");
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(10));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Idempotent: disconnecting an already-disconnected NQN is success.
    /// Refuses (returns `Ok` without acting) when `nqn` is outside the
    /// managed prefix — this is the one place besides orphan cleanup where
    /// that check is load-bearing.
    #[instrument(skip(self, filter))]
    pub async fn disconnect(&self, nqn: &str, filter: &NqnFilter) -> Result<()> {
        if !filter.matches(nqn) {
            return Ok(());
        }

        let output = Command::new("nvme")
            .args(["disconnect", "-n", nqn])
            .output()
            .await
            .map_err(|e| ConnectError::Transient(format!("failed to execute nvme disconnect: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lower = stderr.to_lowercase();
            if lower.contains("not found") || lower.contains("no such") {
                debug!(nqn, "nvme disconnect: already disconnected");
                return Ok(());
            }
            return Err(classify(&stderr));
        }
        Ok(())
    }

    /// Aborts every health-check task. Must be called on node-plugin
    /// shutdown.
    pub fn close(&self) {
        for handle in self.health_tasks.lock().drain(..) {
            handle.abort();
        }
    }

    /// Disconnects every subsystem under `filter`'s managed prefix whose
    /// sysfs entry has no backing namespace device node. Non-matching
    /// subsystems are skipped with a diagnostic
    /// log, never touched. Best-effort: a scan error on one controller
    /// does not abort the sweep for the rest.
    #[instrument(skip(self, filter))]
    pub async fn sweep_orphans(&self, filter: &NqnFilter) -> Result<Vec<String>> {
        let controllers = self
            .sysfs
            .list_controllers()
            .map_err(|e| ConnectError::Transient(e.to_string()))?;

        let mut cleaned = Vec::new();
        for controller in controllers {
            if !filter.matches(&controller.subsysnqn) {
                debug!(nqn = %controller.subsysnqn, "orphan sweep: outside managed prefix, skipping");
                continue;
            }
            let namespaces = match self.sysfs.namespaces(&controller.name) {
                Ok(ns) => ns,
                Err(err) => {
                    warn!(controller = %controller.name, error = %err, "orphan sweep: namespace scan failed");
                    continue;
                }
            };
            let orphaned = !namespaces.is_empty() && namespaces.iter().all(|ns| !self.sysfs.device_node_exists(&ns.name));
            if !orphaned {
                continue;
            }
            info!(nqn = %controller.subsysnqn, controller = %controller.name, "orphan sweep: disconnecting orphaned subsystem");
            if let Err(err) = self.disconnect(&controller.subsysnqn, filter).await {
                warn!(nqn = %controller.subsysnqn, error = %err, "orphan sweep: disconnect failed");
                continue;
            }
            cleaned.push(controller.subsysnqn);
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_markers() {
        assert!(classify("connect failed: EOF").is_retryable());
        assert!(classify("nvme: reset detected").is_retryable());
        assert!(classify("no device found").is_retryable());
    }

    #[test]
    fn classifies_terminal_markers() {
        assert!(!classify("authentication failed").is_retryable());
        assert!(!classify("invalid parameter: nqn").is_retryable());
        assert!(!classify("not enough space on target").is_retryable());
    }

    #[test]
    fn unrecognized_failure_is_terminal() {
        assert!(!classify("some unexpected kernel panic text").is_retryable());
    }

    #[tokio::test]
    async fn disconnect_outside_managed_prefix_is_skipped() {
        let connector = NvmeConnector::new(Nvme::default());
        let filter = NqnFilter::new("nqn.2024-01.local.rds:pvc-").unwrap();
        // nixos-node1 is outside the prefix: this must return Ok without
        // ever shelling out to `nvme disconnect`, which would fail in the
        // test sandbox since the binary is absent. A non-Ok result here
        // would mean the filter check didn't short-circuit.
        let result = connector
            .disconnect("nqn.2024-01.local.rds:nixos-node1", &filter)
            .await;
        assert!(result.is_ok());
    }
}
