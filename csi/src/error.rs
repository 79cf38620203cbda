//! The six-kind error taxonomy, with a deterministic mapping
//! onto gRPC status codes at the CSI boundary. Lower crates (`appliance`,
//! `sysfs`) keep their own narrower error types; they are converted here,
//! at the point they cross into the driver, preserving the sentinel kind.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum DriverError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

impl From<DriverError> for tonic::Status {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotFound(msg) => tonic::Status::not_found(msg),
            DriverError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            DriverError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            DriverError::ResourceExhausted(msg) => tonic::Status::resource_exhausted(msg),
            DriverError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
            DriverError::Unavailable(msg) => tonic::Status::unavailable(msg),
            DriverError::Internal(msg) => tonic::Status::internal(msg),
        }
    }
}

impl From<appliance::ApplianceError> for DriverError {
    fn from(err: appliance::ApplianceError) -> Self {
        use appliance::ApplianceError as A;
        match err {
            A::NotFound { slot } => DriverError::NotFound(format!("slot {slot}")),
            A::AlreadyExists { slot } => DriverError::AlreadyExists(format!("slot {slot}")),
            A::ResourceExhausted(msg) => DriverError::ResourceExhausted(msg),
            A::InvalidParameter(msg) => DriverError::InvalidArgument(msg),
            A::TransientTransport(msg) => {
                DriverError::Unavailable(format!("appliance transport: {msg}"))
            }
            A::Terminal(msg) => DriverError::Internal(msg),
        }
    }
}

impl From<sysfs::SysfsError> for DriverError {
    fn from(err: sysfs::SysfsError) -> Self {
        DriverError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Internal(err.to_string())
    }
}

impl From<kube::Error> for DriverError {
    fn from(err: kube::Error) -> Self {
        DriverError::Unavailable(format!("kubernetes api: {err}"))
    }
}

impl From<crate::connector::ConnectError> for DriverError {
    fn from(err: crate::connector::ConnectError) -> Self {
        use crate::connector::ConnectError as C;
        match err {
            C::Transient(msg) => DriverError::Unavailable(msg),
            C::Timeout { nqn, timeout } => {
                DriverError::Unavailable(format!("timed out waiting for {nqn} after {timeout:?}"))
            }
            C::Terminal(msg) => DriverError::Internal(msg),
        }
    }
}

impl From<crate::resolver::ResolveError> for DriverError {
    fn from(err: crate::resolver::ResolveError) -> Self {
        DriverError::NotFound(err.to_string())
    }
}

impl From<crate::mount::MountError> for DriverError {
    fn from(err: crate::mount::MountError) -> Self {
        use crate::mount::MountError as M;
        match err {
            M::MountInUse => DriverError::FailedPrecondition(err.to_string()),
            M::MountStorm { .. } | M::ParseTimeout => DriverError::Internal(err.to_string()),
            M::UnsupportedFilesystem(_) => DriverError::InvalidArgument(err.to_string()),
            M::Io(_) | M::CommandFailed(_) => DriverError::Internal(err.to_string()),
        }
    }
}

impl From<crate::stale_mount::StaleMountError> for DriverError {
    fn from(err: crate::stale_mount::StaleMountError) -> Self {
        use crate::stale_mount::StaleMountError as S;
        match err {
            S::MountInUse => DriverError::FailedPrecondition(err.to_string()),
            S::RetryBudgetExhausted(_) => DriverError::Unavailable(err.to_string()),
            S::Mount(m) => m.into(),
        }
    }
}

impl From<crate::attachment::AttachError> for DriverError {
    fn from(err: crate::attachment::AttachError) -> Self {
        use crate::attachment::AttachError as A;
        match err {
            A::Conflict(msg) => DriverError::FailedPrecondition(msg),
            A::Cluster(msg) => DriverError::Unavailable(msg),
        }
    }
}
