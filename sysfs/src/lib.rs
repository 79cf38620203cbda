//! Scans kernel sysfs state for NVMe-over-Fabrics controllers and
//! namespaces. Deliberately free of async/gRPC dependencies so it can be
//! exercised in plain synchronous unit tests and reused by both the node
//! and controller binaries.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum SysfsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SysfsError>;

/// One `/sys/class/nvme/nvmeN` controller directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controller {
    /// e.g. "nvme3"
    pub name: String,
    pub subsysnqn: String,
}

/// One namespace block device under a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    /// e.g. "nvme3n1" (stable) or "nvme3c3n1" (controller-path-specific)
    pub name: String,
    /// true for the stable `nvmeXnY` form, false for `nvmeXcYnZ`
    pub stable: bool,
}

impl Namespace {
    fn parse(entry_name: &str, controller: &str) -> Option<Namespace> {
        if !entry_name.starts_with(controller) {
            return None;
        }
        let rest = &entry_name[controller.len()..];
        // stable form: "n<digits>"; controller-specific form: "c<digits>n<digits>"
        if rest.starts_with('n') && rest[1..].chars().all(|c| c.is_ascii_digit()) && !rest.is_empty()
        {
            return Some(Namespace {
                name: entry_name.to_string(),
                stable: true,
            });
        }
        if rest.starts_with('c') {
            if let Some(n_idx) = rest.find('n') {
                if rest[1..n_idx].chars().all(|c| c.is_ascii_digit())
                    && rest[n_idx + 1..].chars().all(|c| c.is_ascii_digit())
                    && n_idx > 1
                {
                    return Some(Namespace {
                        name: entry_name.to_string(),
                        stable: false,
                    });
                }
            }
        }
        None
    }
}

/// Root of the sysfs/devfs trees to scan. Defaults to `/sys` and `/dev`;
/// tests point these at a temporary directory populated with fake entries.
#[derive(Debug, Clone)]
pub struct Nvme {
    sys_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for Nvme {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl Nvme {
    pub fn new(sys_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
        }
    }

    fn class_dir(&self) -> PathBuf {
        self.sys_root.join("class/nvme")
    }

    /// List every NVMe controller currently known to the kernel, regardless
    /// of subsystem NQN. Controllers whose `subsysnqn` attribute cannot be
    /// read (a narrow race with disconnection) are skipped rather than
    /// failing the whole scan.
    pub fn list_controllers(&self) -> Result<Vec<Controller>> {
        let dir = self.class_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SysfsError::Read { path: dir, source }),
        };

        let mut controllers = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("nvme") {
                continue;
            }
            let nqn_path = entry.path().join("subsysnqn");
            match fs::read_to_string(&nqn_path) {
                Ok(content) => controllers.push(Controller {
                    name,
                    subsysnqn: content.trim().to_string(),
                }),
                Err(_) => {
                    trace!(controller = %name, "subsysnqn unreadable, skipping");
                    continue;
                }
            }
        }
        Ok(controllers)
    }

    /// List namespace entries belonging to a controller, in sysfs iteration
    /// order (not meaningfully ordered; callers must pick deterministically
    /// via [`Namespace::stable`]).
    pub fn namespaces(&self, controller: &str) -> Result<Vec<Namespace>> {
        let dir = self.class_dir().join(controller);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SysfsError::Read { path: dir, source }),
        };

        let mut namespaces = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(ns) = Namespace::parse(&name, controller) {
                namespaces.push(ns);
            }
        }
        Ok(namespaces)
    }

    /// Does a device node exist for this namespace name? A subsystem whose
    /// sysfs entry exists but has no `/dev` node is "orphaned" — typically
    /// a namespace mid-teardown.
    pub fn device_node_exists(&self, namespace: &str) -> bool {
        self.dev_root.join(namespace).exists()
    }

    pub fn device_path(&self, namespace: &str) -> PathBuf {
        self.dev_root.join(namespace)
    }

    /// Find every controller whose `subsysnqn` matches `nqn`. In the normal
    /// case this returns at most one entry; during a reconnection race the
    /// kernel may briefly expose two controllers for the same subsystem.
    pub fn controllers_for_nqn(&self, nqn: &str) -> Result<Vec<Controller>> {
        Ok(self
            .list_controllers()?
            .into_iter()
            .filter(|c| c.subsysnqn == nqn)
            .collect())
    }
}

/// Pick the namespace to prefer when a controller exposes more than one
/// entry for what is, on this appliance, always a single-namespace subsystem:
/// the stable `nvmeXnY` name wins over the controller-path-specific
/// `nvmeXcYnZ` name.
pub fn prefer_stable(namespaces: &[Namespace]) -> Option<&Namespace> {
    namespaces
        .iter()
        .find(|ns| ns.stable)
        .or_else(|| namespaces.first())
}

pub fn join_device_path(dev_root: &Path, namespace: &str) -> PathBuf {
    dev_root.join(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn make_fake_sysfs() -> (tempfile::TempDir, Nvme) {
        let dir = tempdir().unwrap();
        let class = dir.path().join("sys/class/nvme");
        fs::create_dir_all(class.join("nvme0")).unwrap();
        fs::write(
            class.join("nvme0/subsysnqn"),
            "nqn.2024-01.local.rds:pvc-aaa\n",
        )
        .unwrap();
        fs::create_dir_all(class.join("nvme0/nvme0n1")).unwrap();
        fs::create_dir_all(dir.path().join("dev")).unwrap();
        fs::write(dir.path().join("dev/nvme0n1"), "").unwrap();

        let nvme = Nvme::new(dir.path().join("sys"), dir.path().join("dev"));
        (dir, nvme)
    }

    #[test]
    fn lists_controller_and_namespace() {
        let (_dir, nvme) = make_fake_sysfs();
        let controllers = nvme.list_controllers().unwrap();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].name, "nvme0");

        let namespaces = nvme.namespaces("nvme0").unwrap();
        assert_eq!(namespaces.len(), 1);
        assert!(namespaces[0].stable);
        assert!(nvme.device_node_exists("nvme0n1"));
    }

    #[test]
    fn missing_class_dir_is_empty_not_error() {
        let dir = tempdir().unwrap();
        let nvme = Nvme::new(dir.path().join("no-sys"), dir.path().join("no-dev"));
        assert_eq!(nvme.list_controllers().unwrap(), Vec::new());
    }

    #[test]
    fn orphaned_namespace_has_no_device_node() {
        let (_dir, nvme) = make_fake_sysfs();
        assert!(!nvme.device_node_exists("nvme0n2"));
    }

    #[test]
    fn prefers_stable_namespace_name() {
        let namespaces = vec![
            Namespace {
                name: "nvme3c3n1".into(),
                stable: false,
            },
            Namespace {
                name: "nvme3n1".into(),
                stable: true,
            },
        ];
        let preferred = prefer_stable(&namespaces).unwrap();
        assert_eq!(preferred.name, "nvme3n1");
    }

    #[test]
    fn namespace_parse_rejects_unrelated_entries() {
        assert!(Namespace::parse("subsysnqn", "nvme0").is_none());
        assert!(Namespace::parse("nvme1n1", "nvme0").is_none());
        assert!(Namespace::parse("nvme0n1", "nvme0").unwrap().stable);
        assert!(!Namespace::parse("nvme0c1n1", "nvme0").unwrap().stable);
    }
}
