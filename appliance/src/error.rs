use thiserror::Error;

/// Classified appliance failure. Every public `appliance` operation returns
/// one of these variants on failure so that callers (the CSI controller
/// service) can map them to gRPC status codes without re-parsing command
/// output.
#[derive(Debug, Error, Clone)]
pub enum ApplianceError {
    #[error("disk slot {slot} not found")]
    NotFound { slot: String },

    #[error("disk slot {slot} already exists")]
    AlreadyExists { slot: String },

    #[error("appliance has insufficient resources: {0}")]
    ResourceExhausted(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("transient appliance transport failure: {0}")]
    TransientTransport(String),

    #[error("terminal appliance failure: {0}")]
    Terminal(String),
}

impl ApplianceError {
    /// Transient failures are worth retrying with backoff; everything else
    /// is either a logic error or a failure the appliance will never
    /// resolve on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplianceError::TransientTransport(_))
    }
}

pub type Result<T> = std::result::Result<T, ApplianceError>;
