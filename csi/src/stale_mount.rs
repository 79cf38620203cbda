//! Detects and recovers mounts whose backing device was invalidated by
//! NVMe controller renumbering — the hard part of this driver. Resolves
//! by identity (NQN) at every operation instead of trusting a cached
//! device path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::mount::{MountError, MountTable};
use crate::resolver::Resolver;

#[derive(Debug, Error, Clone)]
pub enum StaleMountError {
    #[error("stale-mount recovery exhausted its retry budget: {0}")]
    RetryBudgetExhausted(String),
    #[error("mount is in use, refusing to recover")]
    MountInUse,
    #[error(transparent)]
    Mount(#[from] MountError),
}

pub type Result<T> = std::result::Result<T, StaleMountError>;

/// Abstracts emitting a Kubernetes event describing the recovered
/// transition so tests don't need a live cluster.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn stale_mount_recovered(
        &self,
        staging_path: &Path,
        nqn: &str,
        old_device: Option<&Path>,
        new_device: &Path,
    );
}

pub struct NullEventRecorder;

#[async_trait::async_trait]
impl EventRecorder for NullEventRecorder {
    async fn stale_mount_recovered(&self, _: &Path, _: &str, _: Option<&Path>, _: &Path) {}
}

/// `resolver: None` disables recovery entirely — tests inject this by
/// design, and every method here must tolerate it.
pub struct StaleMountChecker {
    mounts: Arc<dyn MountTable>,
    resolver: Option<Arc<Resolver>>,
    events: Arc<dyn EventRecorder>,
    max_attempts: u32,
}

impl StaleMountChecker {
    pub fn new(
        mounts: Arc<dyn MountTable>,
        resolver: Option<Arc<Resolver>>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            mounts,
            resolver,
            events,
            max_attempts: 5,
        }
    }

    /// Extract the source device from the mount table; stale if that
    /// device no longer exists, or exists but the resolver now reports a
    /// different current path for the same NQN.
    pub async fn is_stale(&self, staging_path: &Path, nqn: &str) -> Result<bool> {
        let Some(resolver) = &self.resolver else {
            return Ok(false);
        };
        let Some(current) = self.mounts.get_mount_device(staging_path).await? else {
            return Ok(false);
        };
        if !current.exists() {
            return Ok(true);
        }
        match resolver.resolve(nqn) {
            Ok(expected) => Ok(expected != current),
            Err(_) => Ok(true),
        }
    }

    /// Recover a stale mount at `staging_path`. On a nil resolver, returns
    /// success without action. Bounded: exponential backoff with jitter,
    /// gives up after a configured number of attempts and surfaces a
    /// transient error rather than blocking the RPC indefinitely.
    pub async fn recover(
        &self,
        staging_path: &Path,
        nqn: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let Some(resolver) = self.resolver.clone() else {
            return Ok(());
        };

        let old_device = self.mounts.get_mount_device(staging_path).await?;

        let mut attempt = 0;
        let mut delay = Duration::from_millis(200);
        loop {
            match self
                .recover_once(staging_path, nqn, fs_type, options, &resolver, old_device.as_deref())
                .await
            {
                Ok(()) => return Ok(()),
                Err(StaleMountError::MountInUse) => return Err(StaleMountError::MountInUse),
                Err(err) if attempt < self.max_attempts => {
                    attempt += 1;
                    warn!(
                        staging_path = %staging_path.display(),
                        nqn,
                        attempt,
                        error = %err,
                        "retrying stale-mount recovery"
                    );
                    tokio::time::sleep(delay + jitter(delay)).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(10));
                }
                Err(err) => return Err(StaleMountError::RetryBudgetExhausted(err.to_string())),
            }
        }
    }

    async fn recover_once(
        &self,
        staging_path: &Path,
        nqn: &str,
        fs_type: &str,
        options: &[String],
        resolver: &Resolver,
        old_device: Option<&Path>,
    ) -> Result<()> {
        if self.mounts.is_likely_mount_point(staging_path)? {
            match self.mounts.force_unmount(staging_path, Duration::from_secs(10)).await {
                Ok(()) => {}
                Err(MountError::MountInUse) => return Err(StaleMountError::MountInUse),
                Err(err) => return Err(err.into()),
            }
        }

        resolver.invalidate(nqn);
        let new_device = resolver
            .resolve(nqn)
            .map_err(|e| StaleMountError::RetryBudgetExhausted(e.to_string()))?;

        self.mounts.mount(&new_device, staging_path, fs_type, options).await?;
        self.events
            .stale_mount_recovered(staging_path, nqn, old_device, &new_device)
            .await;
        info!(
            staging_path = %staging_path.display(),
            nqn,
            device = %new_device.display(),
            "stale mount recovered"
        );
        Ok(())
    }
}

fn jitter(base: Duration) -> Duration {
    let max_ms = (base.as_millis() as u64 / 4).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::FakeMountTable;
    use std::fs;
    use sysfs::Nvme;
    use tempfile::tempdir;

    fn resolver_with_device(nqn: &str, controller: &str, ns: &str) -> (tempfile::TempDir, Resolver) {
        let dir = tempdir().unwrap();
        let class = dir.path().join("sys/class/nvme");
        fs::create_dir_all(class.join(controller)).unwrap();
        fs::write(class.join(controller).join("subsysnqn"), format!("{nqn}\n")).unwrap();
        fs::create_dir_all(class.join(controller).join(ns)).unwrap();
        fs::create_dir_all(dir.path().join("dev")).unwrap();
        fs::write(dir.path().join("dev").join(ns), "").unwrap();
        let nvme = Nvme::new(dir.path().join("sys"), dir.path().join("dev"));
        (dir, Resolver::new(nvme, Duration::from_secs(10)))
    }

    #[tokio::test]
    async fn nil_resolver_disables_detection_and_recovery() {
        let mounts = Arc::new(FakeMountTable::default());
        let checker = StaleMountChecker::new(mounts, None, Arc::new(NullEventRecorder));
        assert!(!checker.is_stale(Path::new("/staging/pvc-aaa"), "nqn.test:pvc-aaa").await.unwrap());
        assert!(checker.recover(Path::new("/staging/pvc-aaa"), "nqn.test:pvc-aaa", "ext4", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn not_mounted_is_not_stale() {
        let mounts = Arc::new(FakeMountTable::default());
        let (_dir, resolver) = resolver_with_device("nqn.test:pvc-aaa", "nvme0", "nvme0n1");
        let checker = StaleMountChecker::new(mounts, Some(Arc::new(resolver)), Arc::new(NullEventRecorder));
        assert!(!checker.is_stale(Path::new("/staging/pvc-aaa"), "nqn.test:pvc-aaa").await.unwrap());
    }

    #[tokio::test]
    async fn mismatched_device_is_stale_and_recoverable() {
        let mounts = Arc::new(FakeMountTable::default());
        let staging = PathBuf::from("/staging/pvc-aaa");
        mounts.mount(Path::new("/dev/nvme0n1"), &staging, "ext4", &[]).await.unwrap();

        // resolver now reports a *different* device for the same nqn, as
        // would happen after a reconnection renumbered the controller.
        let (_dir, resolver) = resolver_with_device("nqn.test:pvc-aaa", "nvme3", "nvme3n1");
        let checker = StaleMountChecker::new(mounts.clone(), Some(Arc::new(resolver)), Arc::new(NullEventRecorder));

        assert!(checker.is_stale(&staging, "nqn.test:pvc-aaa").await.unwrap());
        checker.recover(&staging, "nqn.test:pvc-aaa", "ext4", &[]).await.unwrap();

        let record = mounts.get_mounts().await.unwrap();
        assert_eq!(record.len(), 1);
        assert!(record[0].source.ends_with("nvme3n1"));
    }
}
