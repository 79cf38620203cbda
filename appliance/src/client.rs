use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::error::{ApplianceError, Result};
use crate::parser;
use crate::transport::CommandRunner;
use crate::types::{SlotName, SnapshotInfo, VolumeInfo, MIN_VOLUME_SIZE_BYTES};

/// High-level RDS appliance operations, built on a `CommandRunner`.
/// Retryable failures are retried with bounded exponential backoff;
/// terminal failures surface immediately.
pub struct ApplianceClient {
    runner: Arc<dyn CommandRunner>,
    max_retries: u32,
}

impl ApplianceClient {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            max_retries: 5,
        }
    }

    async fn run_with_retry(&self, command: &str) -> Result<String> {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(200);
        loop {
            match self.runner.run(command).await {
                Ok(out) => return Ok(out),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "retrying appliance command");
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(5));
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn create_volume(
        &self,
        slot: &str,
        size_bytes: u64,
        base_path: Option<&str>,
        snapshot_src: Option<&str>,
    ) -> Result<VolumeInfo> {
        let slot = SlotName::parse(slot)?;
        if size_bytes < MIN_VOLUME_SIZE_BYTES {
            return Err(ApplianceError::InvalidParameter(format!(
                "requested size {size_bytes} is below the 1 GiB minimum"
            )));
        }

        let mut command = format!("/disk add slot={slot} size={size_bytes}");
        if let Some(base) = base_path {
            command.push_str(&format!(" base-path={base}"));
        }
        if let Some(src) = snapshot_src {
            let src_slot = SlotName::parse(src)?;
            command.push_str(&format!(" restore-from={src_slot}"));
        }

        match self.run_with_retry(&command).await {
            Ok(_) => self.get_volume(slot.as_str()).await,
            Err(ApplianceError::AlreadyExists { slot: existing_slot }) => {
                let existing = self.get_volume(slot.as_str()).await?;
                if existing.size_bytes != size_bytes {
                    return Err(ApplianceError::AlreadyExists { slot: existing_slot });
                }
                Ok(existing)
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_volume(&self, slot: &str) -> Result<()> {
        let slot = SlotName::parse(slot)?;
        let command = format!("/disk remove [find slot={slot}]");
        match self.run_with_retry(&command).await {
            Ok(_) => Ok(()),
            // delete is idempotent: not-found counts as success.
            Err(ApplianceError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self))]
    pub async fn resize_volume(&self, slot: &str, new_size_bytes: u64) -> Result<VolumeInfo> {
        let slot = SlotName::parse(slot)?;
        if new_size_bytes < MIN_VOLUME_SIZE_BYTES {
            return Err(ApplianceError::InvalidParameter(format!(
                "requested size {new_size_bytes} is below the 1 GiB minimum"
            )));
        }
        let command = format!("/disk set [find slot={slot}] size={new_size_bytes}");
        self.run_with_retry(&command).await?;
        self.get_volume(slot.as_str()).await
    }

    #[instrument(skip(self))]
    pub async fn get_volume(&self, slot: &str) -> Result<VolumeInfo> {
        let slot_name = SlotName::parse(slot)?;
        let command = format!("/disk print detail [find slot={slot_name}]");
        let raw = self.run_with_retry(&command).await?;
        let record = parser::parse_single(&raw, slot)?;

        let size_bytes = record
            .get("size")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| ApplianceError::Terminal("disk record missing size".into()))?;
        let nqn = record
            .get("nqn")
            .cloned()
            .ok_or_else(|| ApplianceError::Terminal("disk record missing nqn".into()))?;
        let base_path = record.get("base-path").cloned();

        Ok(VolumeInfo {
            slot: slot.to_string(),
            size_bytes,
            nqn,
            base_path,
        })
    }

    #[instrument(skip(self))]
    pub async fn create_snapshot(&self, src_slot: &str, snap_slot: &str) -> Result<SnapshotInfo> {
        let src = SlotName::parse(src_slot)?;
        let snap = SlotName::parse(snap_slot)?;
        let command = format!("/disk snapshot add source=[find slot={src}] slot={snap}");
        match self.run_with_retry(&command).await {
            Ok(_) | Err(ApplianceError::AlreadyExists { .. }) => {
                let detail = self
                    .run_with_retry(&format!("/disk print detail [find slot={snap}]"))
                    .await?;
                let record = parser::parse_single(&detail, snap_slot)?;
                let size_bytes = record
                    .get("size")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                Ok(SnapshotInfo {
                    slot: snap_slot.to_string(),
                    source_slot: src_slot.to_string(),
                    size_bytes,
                })
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snap_slot: &str) -> Result<()> {
        let snap = SlotName::parse(snap_slot)?;
        let command = format!("/disk snapshot remove [find slot={snap}]");
        match self.run_with_retry(&command).await {
            Ok(_) | Err(ApplianceError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self))]
    pub async fn restore_snapshot(&self, snap_slot: &str, new_slot: &str) -> Result<VolumeInfo> {
        let snap = SlotName::parse(snap_slot)?;
        let new = SlotName::parse(new_slot)?;
        let command = format!("/disk snapshot restore [find slot={snap}] new-slot={new}");
        self.run_with_retry(&command).await?;
        self.get_volume(new_slot).await
    }

    #[instrument(skip(self))]
    pub async fn list_snapshots(&self, prefix: &str) -> Result<Vec<SnapshotInfo>> {
        let command = "/disk snapshot print detail".to_string();
        let raw = self.run_with_retry(&command).await?;
        let records = parser::parse_records(&raw);
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let slot = record.get("slot")?.clone();
                if !prefix.is_empty() && !slot.starts_with(prefix) {
                    return None;
                }
                let source_slot = record.get("source").cloned().unwrap_or_default();
                let size_bytes = record.get("size").and_then(|v| v.parse().ok()).unwrap_or(0);
                Some(SnapshotInfo {
                    slot,
                    source_slot,
                    size_bytes,
                })
            })
            .collect())
    }

    /// Export a volume's disk slot as an NVMe/TCP subsystem with the given
    /// NQN. Idempotent: already-exported is not an error.
    #[instrument(skip(self))]
    pub async fn export_nvme(&self, slot: &str, nqn: &str) -> Result<()> {
        let slot = SlotName::parse(slot)?;
        let command = format!("/nvme/tcp/subsystem export slot={slot} nqn={nqn}");
        match self.run_with_retry(&command).await {
            Ok(_) | Err(ApplianceError::AlreadyExists { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Unexport a volume's NVMe/TCP subsystem. Idempotent.
    #[instrument(skip(self))]
    pub async fn unexport_nvme(&self, slot: &str) -> Result<()> {
        let slot = SlotName::parse(slot)?;
        let command = format!("/nvme/tcp/subsystem remove [find slot={slot}]");
        match self.run_with_retry(&command).await {
            Ok(_) | Err(ApplianceError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeRunner;

    fn client_with(responses: Vec<Result<&str>>) -> (ApplianceClient, Arc<FakeRunner>) {
        let fake = Arc::new(FakeRunner::new());
        for r in responses {
            fake.push(r.map(|s| s.to_string()));
        }
        (ApplianceClient::new(fake.clone()), fake)
    }

    #[tokio::test]
    async fn delete_volume_not_found_is_success() {
        let (client, _) = client_with(vec![Err(ApplianceError::NotFound {
            slot: "pvc-x".into(),
        })]);
        assert!(client.delete_volume("pvc-x").await.is_ok());
    }

    #[tokio::test]
    async fn create_volume_rejects_undersized_request() {
        let (client, _) = client_with(vec![]);
        let err = client
            .create_volume("pvc-x", 1024, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplianceError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn create_volume_rejects_invalid_slot_name() {
        let (client, _) = client_with(vec![]);
        let err = client
            .create_volume("pvc/../x", MIN_VOLUME_SIZE_BYTES, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplianceError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn get_volume_parses_record() {
        let (client, _) = client_with(vec![Ok(
            "0 slot=\"pvc-aaa\" size=1073741824 nqn=\"nqn.2024-01.local.rds:pvc-aaa\"",
        )]);
        let vol = client.get_volume("pvc-aaa").await.unwrap();
        assert_eq!(vol.size_bytes, MIN_VOLUME_SIZE_BYTES);
        assert_eq!(vol.nqn, "nqn.2024-01.local.rds:pvc-aaa");
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let fake = Arc::new(FakeRunner::new());
        fake.push(Err(ApplianceError::TransientTransport("reset".into())));
        fake.push(Ok("0 slot=\"pvc-aaa\" size=1073741824 nqn=\"nqn.x:pvc-aaa\"".to_string()));
        let client = ApplianceClient::new(fake.clone());
        let vol = client.get_volume("pvc-aaa").await.unwrap();
        assert_eq!(vol.slot, "pvc-aaa");
        assert_eq!(fake.invocations.lock().len(), 2);
    }
}
