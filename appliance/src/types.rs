use serde::{Deserialize, Serialize};

/// A disk slot on the RDS appliance, one per CSI volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    pub slot: String,
    pub size_bytes: u64,
    pub nqn: String,
    pub base_path: Option<String>,
}

/// A read-only, copy-on-write clone of a volume's backing file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub slot: String,
    pub source_slot: String,
    pub size_bytes: u64,
}

/// Validated slot name: `[A-Za-z0-9_.-]+`, the appliance's own
/// command-line contract for object names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotName(String);

impl SlotName {
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        if raw.is_empty() || raw.len() > 63 {
            return Err(crate::error::ApplianceError::InvalidParameter(format!(
                "slot name '{raw}' must be 1-63 characters"
            )));
        }
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid {
            return Err(crate::error::ApplianceError::InvalidParameter(format!(
                "slot name '{raw}' contains characters outside [A-Za-z0-9_.-]"
            )));
        }
        Ok(SlotName(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SlotName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Minimum requested capacity the appliance will provision.
pub const MIN_VOLUME_SIZE_BYTES: u64 = 1024 * 1024 * 1024;
