//! Compile-time-unavoidable safety gate: every destructive
//! NVMe operation the driver issues must first pass through here. The same
//! prefix is shared by the connector's disconnect path and the (optional,
//! off-by-default) orphan-cleanup sweep.

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NqnFilterError {
    #[error("managed-nqn-prefix must start with 'nqn.'")]
    MissingNqnScheme,
    #[error("managed-nqn-prefix must contain a ':' separating the naming authority from the unique string")]
    MissingColon,
    #[error("managed-nqn-prefix must be at most 223 octets, got {0}")]
    TooLong(usize),
    #[error("managed-nqn-prefix must not be empty")]
    Empty,
}

/// A validated managed-NQN prefix. Construction is the only way to obtain
/// one, so every holder of an `NqnFilter` is guaranteed to carry a
/// syntactically valid prefix — there is no way to build a filter that
/// silently allows everything.
#[derive(Debug, Clone)]
pub struct NqnFilter {
    prefix: String,
}

impl NqnFilter {
    pub fn new(prefix: &str) -> Result<Self, NqnFilterError> {
        if prefix.is_empty() {
            return Err(NqnFilterError::Empty);
        }
        if !prefix.starts_with("nqn.") {
            return Err(NqnFilterError::MissingNqnScheme);
        }
        if !prefix.contains(':') {
            return Err(NqnFilterError::MissingColon);
        }
        let len = prefix.as_bytes().len();
        if len > 223 {
            return Err(NqnFilterError::TooLong(len));
        }
        Ok(Self {
            prefix: prefix.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Does `nqn` fall under this filter's managed prefix? A non-match is
    /// not an error: callers log at diagnostic level and skip the
    /// operation rather than failing the RPC.
    pub fn matches(&self, nqn: &str) -> bool {
        let matches = nqn.starts_with(&self.prefix);
        if !matches {
            debug!(nqn, prefix = %self.prefix, "nqn outside managed prefix, skipping");
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_scheme() {
        assert!(matches!(
            NqnFilter::new("pvc-prefix"),
            Err(NqnFilterError::MissingNqnScheme)
        ));
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(matches!(
            NqnFilter::new("nqn.2024-01.local.rds"),
            Err(NqnFilterError::MissingColon)
        ));
    }

    #[test]
    fn rejects_too_long() {
        let long = format!("nqn.2024-01.local.rds:{}", "x".repeat(250));
        assert!(matches!(
            NqnFilter::new(&long),
            Err(NqnFilterError::TooLong(_))
        ));
    }

    #[test]
    fn matches_own_prefix_only() {
        let filter = NqnFilter::new("nqn.2024-01.local.rds:pvc-").unwrap();
        assert!(filter.matches("nqn.2024-01.local.rds:pvc-aaa"));
        assert!(!filter.matches("nqn.2024-01.local.rds:nixos-node1"));
    }
}
