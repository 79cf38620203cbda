//! Maps NQN to current `/dev/nvmeXnY`, short-TTL cached, backed by the
//! `sysfs` crate's raw scan. Deliberately synchronous: sysfs
//! reads are cheap enough not to need a worker task, unlike mount-info
//! parsing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use sysfs::{prefer_stable, Nvme};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no device found for nqn {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

struct CacheEntry {
    device: PathBuf,
    observed_at: Instant,
}

/// TTL-cached NQN -> device path resolver. The stale-mount checker and
/// recovery paths are written to tolerate the absence of a `Resolver`
/// entirely (an `Option<Arc<Resolver>>` in their signatures) — tests
/// inject `None` by design rather than a fake of this type.
pub struct Resolver {
    sysfs: Nvme,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl Resolver {
    pub fn new(sysfs: Nvme, ttl: Duration) -> Self {
        Self {
            sysfs,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `nqn` to its current device path. A cache hit within the
    /// TTL is served without touching sysfs; a miss or expired entry
    /// rescans. A subsystem whose sysfs entry exists but exposes no
    /// device node (mid-teardown) is reported as not-found, same as a
    /// subsystem that isn't connected at all.
    pub fn resolve(&self, nqn: &str) -> Result<PathBuf> {
        if let Some(device) = self.cache_hit(nqn) {
            return Ok(device);
        }
        let device = self.scan(nqn)?;
        self.cache.lock().insert(
            nqn.to_string(),
            CacheEntry {
                device: device.clone(),
                observed_at: Instant::now(),
            },
        );
        Ok(device)
    }

    /// Drop any cached entry for `nqn`, forcing the next `resolve` to
    /// rescan. Used by the stale-mount checker once it has determined a
    /// cached path no longer backs the intended subsystem.
    pub fn invalidate(&self, nqn: &str) {
        self.cache.lock().remove(nqn);
    }

    fn cache_hit(&self, nqn: &str) -> Option<PathBuf> {
        let cache = self.cache.lock();
        let entry = cache.get(nqn)?;
        if entry.observed_at.elapsed() > self.ttl {
            trace!(nqn, "resolver cache entry expired");
            return None;
        }
        Some(entry.device.clone())
    }

    fn scan(&self, nqn: &str) -> Result<PathBuf> {
        let controllers = self
            .sysfs
            .controllers_for_nqn(nqn)
            .map_err(|_| ResolveError::NotFound(nqn.to_string()))?;

        for controller in controllers {
            let namespaces = self
                .sysfs
                .namespaces(&controller.name)
                .map_err(|_| ResolveError::NotFound(nqn.to_string()))?;
            if let Some(ns) = prefer_stable(&namespaces) {
                if self.sysfs.device_node_exists(&ns.name) {
                    return Ok(self.sysfs.device_path(&ns.name));
                }
                // sysfs entry present, no /dev node: an orphaned subsystem.
                return Err(ResolveError::NotFound(nqn.to_string()));
            }
        }
        Err(ResolveError::NotFound(nqn.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn fake_sysfs(connected: bool, orphaned: bool) -> (tempfile::TempDir, Nvme) {
        let dir = tempdir().unwrap();
        let class = dir.path().join("sys/class/nvme");
        fs::create_dir_all(dir.path().join("dev")).unwrap();
        if connected {
            fs::create_dir_all(class.join("nvme0")).unwrap();
            fs::write(class.join("nvme0/subsysnqn"), "nqn.test:pvc-aaa\n").unwrap();
            fs::create_dir_all(class.join("nvme0/nvme0n1")).unwrap();
            if !orphaned {
                fs::write(dir.path().join("dev/nvme0n1"), "").unwrap();
            }
        }
        let nvme = Nvme::new(dir.path().join("sys"), dir.path().join("dev"));
        (dir, nvme)
    }

    #[test]
    fn resolves_connected_subsystem() {
        let (_dir, nvme) = fake_sysfs(true, false);
        let resolver = Resolver::new(nvme, Duration::from_secs(10));
        let path = resolver.resolve("nqn.test:pvc-aaa").unwrap();
        assert!(path.ends_with("nvme0n1"));
    }

    #[test]
    fn reports_not_found_for_disconnected_subsystem() {
        let (_dir, nvme) = fake_sysfs(false, false);
        let resolver = Resolver::new(nvme, Duration::from_secs(10));
        assert_eq!(
            resolver.resolve("nqn.test:pvc-missing"),
            Err(ResolveError::NotFound("nqn.test:pvc-missing".into()))
        );
    }

    #[test]
    fn orphaned_subsystem_is_not_found() {
        let (_dir, nvme) = fake_sysfs(true, true);
        let resolver = Resolver::new(nvme, Duration::from_secs(10));
        assert!(resolver.resolve("nqn.test:pvc-aaa").is_err());
    }

    #[test]
    fn cache_serves_within_ttl_after_device_removed() {
        let (dir, nvme) = fake_sysfs(true, false);
        let resolver = Resolver::new(nvme, Duration::from_secs(60));
        let first = resolver.resolve("nqn.test:pvc-aaa").unwrap();
        fs::remove_file(dir.path().join("dev/nvme0n1")).unwrap();
        let second = resolver.resolve("nqn.test:pvc-aaa").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalidate_forces_rescan() {
        let (_dir, nvme) = fake_sysfs(true, false);
        let resolver = Resolver::new(nvme, Duration::from_secs(60));
        resolver.resolve("nqn.test:pvc-aaa").unwrap();
        resolver.invalidate("nqn.test:pvc-aaa");
        assert!(resolver.cache.lock().is_empty());
    }
}
