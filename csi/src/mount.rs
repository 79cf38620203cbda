//! Mount-table parsing, formatting, mounting, and unmounting. Defined as
//! a capability set (the `MountTable` trait) rather than a concrete type,
//! since that's where polymorphism earns its keep here — tests inject an
//! in-memory fake that tracks calls instead of touching the real kernel.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::mount::{mount as nix_mount, umount2, MntFlags, MsFlags};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone)]
pub enum MountError {
    #[error("mount-info parse exceeded its deadline; check /proc/mounts manually")]
    ParseTimeout,
    #[error("mount storm: {count} entries reference device {device}")]
    MountStorm { device: String, count: usize },
    #[error("mount point is in use, refusing to force-unmount")]
    MountInUse,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("unsupported filesystem: {0}")]
    UnsupportedFilesystem(String),
}

pub type Result<T> = std::result::Result<T, MountError>;

impl From<std::io::Error> for MountError {
    fn from(e: std::io::Error) -> Self {
        MountError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    Resized,
    /// Block volumes: the kernel picks up capacity changes automatically.
    NoNodeExpansionRequired,
}

#[async_trait]
pub trait MountTable: Send + Sync {
    async fn format(&self, device: &Path, fs_type: &str) -> Result<()>;
    async fn is_formatted(&self, device: &Path) -> Result<bool>;
    async fn mount(&self, src: &Path, target: &Path, fs_type: &str, options: &[String]) -> Result<()>;
    async fn bind(&self, src: &Path, target: &Path, options: &[String]) -> Result<()>;
    async fn unmount(&self, target: &Path) -> Result<()>;
    async fn force_unmount(&self, target: &Path, timeout: Duration) -> Result<()>;
    async fn resize_filesystem(&self, device: &Path, target: &Path, fs_type: &str) -> Result<ResizeOutcome>;
    fn is_likely_mount_point(&self, path: &Path) -> Result<bool>;
    fn make_file(&self, path: &Path) -> Result<()>;
    async fn get_mounts(&self) -> Result<Vec<MountRecord>>;
    async fn get_mount_device(&self, path: &Path) -> Result<Option<PathBuf>>;
}

/// Supported filesystems: the two a production block-storage CSI driver is
/// expected to support (ext4/xfs are
/// required for `Format`/`IsFormatted` to mean anything concrete).
const SUPPORTED_FILESYSTEMS: &[&str] = &["ext4", "xfs"];

fn mkfs_binary(fs_type: &str) -> Result<&'static str> {
    match fs_type {
        "ext4" => Ok("mkfs.ext4"),
        "xfs" => Ok("mkfs.xfs"),
        other => Err(MountError::UnsupportedFilesystem(other.to_string())),
    }
}

/// Split a caller-provided options list into kernel mount flags and the
/// filesystem-specific data string passed through to the kernel driver
/// (e.g. `noatime`, `data=ordered`).
fn parse_mount_options(options: &[String]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match opt.as_str() {
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {}
            "bind" => flags |= MsFlags::MS_BIND,
            other => data.push(other.to_string()),
        }
    }
    let data = if data.is_empty() { None } else { Some(data.join(",")) };
    (flags, data)
}

pub struct SystemMountTable {
    parse_timeout: Duration,
    duplicate_mount_threshold: usize,
}

impl SystemMountTable {
    pub fn new(parse_timeout: Duration, duplicate_mount_threshold: usize) -> Self {
        Self {
            parse_timeout,
            duplicate_mount_threshold,
        }
    }

    /// Fail loudly if more than `duplicate_mount_threshold` entries
    /// reference the same source device — an indicator of filesystem
    /// corruption that must never be silently ignored.
    pub fn detect_duplicate_mounts(&self, mounts: &[MountRecord], device: &Path) -> Result<()> {
        let count = mounts.iter().filter(|m| m.source == device).count();
        if count > self.duplicate_mount_threshold {
            return Err(MountError::MountStorm {
                device: device.display().to_string(),
                count,
            });
        }
        Ok(())
    }

    /// Is any process holding an open file under `target`? A narrow,
    /// best-effort check over `/proc/*/fd` rather than a full lsof-style
    /// scan (device-in-use detection this way is unvalidated
    /// against real hardware).
    fn mount_in_use(target: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return false;
        };
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let fd_dir = PathBuf::from(format!("/proc/{pid}/fd"));
            let Ok(fds) = std::fs::read_dir(&fd_dir) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = std::fs::read_link(fd.path()) {
                    if link.starts_with(target) {
                        return true;
                    }
                }
            }
        }
        false
    }
}

#[async_trait]
impl MountTable for SystemMountTable {
    async fn format(&self, device: &Path, fs_type: &str) -> Result<()> {
        let binary = mkfs_binary(fs_type)?;
        let output = Command::new(binary)
            .arg(device)
            .output()
            .await
            .map_err(|e| MountError::CommandFailed(format!("{binary}: {e}")))?;
        if !output.status.success() {
            return Err(MountError::CommandFailed(format!(
                "{binary} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn is_formatted(&self, device: &Path) -> Result<bool> {
        let output = Command::new("blkid")
            .args(["-p", "-o", "value", "-s", "TYPE"])
            .arg(device)
            .output()
            .await
            .map_err(|e| MountError::CommandFailed(format!("blkid: {e}")))?;
        let fs_type = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(!fs_type.is_empty() && SUPPORTED_FILESYSTEMS.contains(&fs_type.as_str()))
    }

    async fn mount(&self, src: &Path, target: &Path, fs_type: &str, options: &[String]) -> Result<()> {
        let src = src.to_path_buf();
        let target = target.to_path_buf();
        let fs_type = fs_type.to_string();
        let options = options.to_vec();
        tokio::task::spawn_blocking(move || {
            let (flags, data) = parse_mount_options(&options);
            nix_mount(
                Some(&src),
                &target,
                Some(fs_type.as_str()),
                flags,
                data.as_deref(),
            )
            .map_err(|e| MountError::CommandFailed(format!("mount {}: {e}", src.display())))
        })
        .await
        .map_err(|e| MountError::Io(e.to_string()))?
    }

    async fn bind(&self, src: &Path, target: &Path, options: &[String]) -> Result<()> {
        let src = src.to_path_buf();
        let target = target.to_path_buf();
        let options = options.to_vec();
        tokio::task::spawn_blocking(move || {
            let (mut flags, data) = parse_mount_options(&options);
            flags |= MsFlags::MS_BIND;
            nix_mount(Some(&src), &target, None::<&str>, flags, data.as_deref())
                .map_err(|e| MountError::CommandFailed(format!("bind mount {}: {e}", src.display())))
        })
        .await
        .map_err(|e| MountError::Io(e.to_string()))?
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            umount2(&target, MntFlags::empty())
                .map_err(|e| MountError::CommandFailed(format!("umount {}: {e}", target.display())))
        })
        .await
        .map_err(|e| MountError::Io(e.to_string()))?
    }

    async fn force_unmount(&self, target: &Path, timeout: Duration) -> Result<()> {
        let normal = tokio::time::timeout(timeout, self.unmount(target)).await;
        match normal {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(_)) | Err(_) => {}
        }

        if Self::mount_in_use(target) {
            warn!(target = %target.display(), "force-unmount refused: mount in use");
            return Err(MountError::MountInUse);
        }

        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            umount2(&target, MntFlags::MNT_DETACH)
                .map_err(|e| MountError::CommandFailed(format!("lazy umount {}: {e}", target.display())))
        })
        .await
        .map_err(|e| MountError::Io(e.to_string()))?
    }

    async fn resize_filesystem(&self, device: &Path, target: &Path, fs_type: &str) -> Result<ResizeOutcome> {
        match fs_type {
            "ext4" => {
                let output = Command::new("resize2fs")
                    .arg(device)
                    .output()
                    .await
                    .map_err(|e| MountError::CommandFailed(format!("resize2fs: {e}")))?;
                if !output.status.success() {
                    return Err(MountError::CommandFailed(format!(
                        "resize2fs failed: {}",
                        String::from_utf8_lossy(&output.stderr)
                    )));
                }
                Ok(ResizeOutcome::Resized)
            }
            "xfs" => {
                let output = Command::new("xfs_growfs")
                    .arg(target)
                    .output()
                    .await
                    .map_err(|e| MountError::CommandFailed(format!("xfs_growfs: {e}")))?;
                if !output.status.success() {
                    return Err(MountError::CommandFailed(format!(
                        "xfs_growfs failed: {}",
                        String::from_utf8_lossy(&output.stderr)
                    )));
                }
                Ok(ResizeOutcome::Resized)
            }
            "" => Ok(ResizeOutcome::NoNodeExpansionRequired),
            other => Err(MountError::UnsupportedFilesystem(other.to_string())),
        }
    }

    fn is_likely_mount_point(&self, path: &Path) -> Result<bool> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let parent = path.parent().unwrap_or(Path::new("/"));
        let parent_meta = std::fs::symlink_metadata(parent)?;
        Ok(meta.dev() != parent_meta.dev())
    }

    fn make_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new().create(true).write(true).open(path)?;
        Ok(())
    }

    async fn get_mounts(&self) -> Result<Vec<MountRecord>> {
        let parse = tokio::task::spawn_blocking(|| {
            proc_mounts::MountList::new()
                .map(|list| {
                    list.iter()
                        .map(|m| MountRecord {
                            source: m.source.clone(),
                            target: m.dest.clone(),
                            fs_type: m.fstype.clone(),
                            options: m.options.clone(),
                        })
                        .collect::<Vec<_>>()
                })
                .map_err(|e| MountError::Io(e.to_string()))
        });

        match tokio::time::timeout(self.parse_timeout, parse).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(MountError::Io(join_err.to_string())),
            Err(_) => {
                debug!("mount-info parse exceeded deadline");
                Err(MountError::ParseTimeout)
            }
        }
    }

    async fn get_mount_device(&self, path: &Path) -> Result<Option<PathBuf>> {
        let mounts = self.get_mounts().await?;
        Ok(mounts
            .into_iter()
            .find(|m| m.target == path)
            .map(|m| m.source))
    }
}

/// In-memory mock used by node-service and stale-mount-checker tests: a
/// fake that tracks calls rather than touching the real kernel.
#[cfg(any(test, feature = "test-util"))]
pub struct FakeMountTable {
    pub mounted: parking_lot::Mutex<HashMap<PathBuf, MountRecord>>,
    pub formatted: parking_lot::Mutex<std::collections::HashSet<PathBuf>>,
    pub calls: parking_lot::Mutex<Vec<String>>,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for FakeMountTable {
    fn default() -> Self {
        Self {
            mounted: parking_lot::Mutex::new(HashMap::new()),
            formatted: parking_lot::Mutex::new(std::collections::HashSet::new()),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl MountTable for FakeMountTable {
    async fn format(&self, device: &Path, _fs_type: &str) -> Result<()> {
        self.calls.lock().push(format!("format {}", device.display()));
        self.formatted.lock().insert(device.to_path_buf());
        Ok(())
    }

    async fn is_formatted(&self, device: &Path) -> Result<bool> {
        Ok(self.formatted.lock().contains(device))
    }

    async fn mount(&self, src: &Path, target: &Path, fs_type: &str, options: &[String]) -> Result<()> {
        self.calls.lock().push(format!("mount {} {}", src.display(), target.display()));
        self.mounted.lock().insert(
            target.to_path_buf(),
            MountRecord {
                source: src.to_path_buf(),
                target: target.to_path_buf(),
                fs_type: fs_type.to_string(),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    async fn bind(&self, src: &Path, target: &Path, options: &[String]) -> Result<()> {
        self.mount(src, target, "bind", options).await
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.calls.lock().push(format!("unmount {}", target.display()));
        self.mounted.lock().remove(target);
        Ok(())
    }

    async fn force_unmount(&self, target: &Path, _timeout: Duration) -> Result<()> {
        self.unmount(target).await
    }

    async fn resize_filesystem(&self, _device: &Path, _target: &Path, fs_type: &str) -> Result<ResizeOutcome> {
        if fs_type.is_empty() {
            Ok(ResizeOutcome::NoNodeExpansionRequired)
        } else {
            Ok(ResizeOutcome::Resized)
        }
    }

    fn is_likely_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.mounted.lock().contains_key(path))
    }

    fn make_file(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn get_mounts(&self) -> Result<Vec<MountRecord>> {
        Ok(self.mounted.lock().values().cloned().collect())
    }

    async fn get_mount_device(&self, path: &Path) -> Result<Option<PathBuf>> {
        Ok(self.mounted.lock().get(path).map(|m| m.source.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_options_into_flags() {
        let (flags, data) = parse_mount_options(&["nosuid".into(), "nodev".into(), "noexec".into()]);
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert!(flags.contains(MsFlags::MS_NOEXEC));
        assert!(data.is_none());
    }

    #[test]
    fn unknown_options_pass_through_as_data() {
        let (_flags, data) = parse_mount_options(&["noatime".into()]);
        assert_eq!(data.as_deref(), Some("noatime"));
    }

    #[test]
    fn duplicate_mount_detection_trips_over_threshold() {
        let table = SystemMountTable::new(Duration::from_secs(10), 2);
        let device = PathBuf::from("/dev/nvme1n1");
        let mounts: Vec<MountRecord> = (0..3)
            .map(|i| MountRecord {
                source: device.clone(),
                target: PathBuf::from(format!("/mnt/{i}")),
                fs_type: "ext4".into(),
                options: vec![],
            })
            .collect();
        assert!(matches!(
            table.detect_duplicate_mounts(&mounts, &device),
            Err(MountError::MountStorm { .. })
        ));
    }

    #[test]
    fn duplicate_mount_detection_passes_under_threshold() {
        let table = SystemMountTable::new(Duration::from_secs(10), 100);
        let device = PathBuf::from("/dev/nvme1n1");
        let mounts = vec![MountRecord {
            source: device.clone(),
            target: PathBuf::from("/mnt/0"),
            fs_type: "ext4".into(),
            options: vec![],
        }];
        assert!(table.detect_duplicate_mounts(&mounts, &device).is_ok());
    }

    #[tokio::test]
    async fn fake_mount_table_tracks_mount_and_unmount() {
        let fake = FakeMountTable::default();
        let src = PathBuf::from("/dev/nvme0n1");
        let target = PathBuf::from("/staging/pvc-aaa");
        fake.mount(&src, &target, "ext4", &[]).await.unwrap();
        assert!(fake.is_likely_mount_point(&target).unwrap());
        fake.unmount(&target).await.unwrap();
        assert!(!fake.is_likely_mount_point(&target).unwrap());
    }
}
