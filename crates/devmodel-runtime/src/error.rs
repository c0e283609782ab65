//! Error types for runtime operations

use devmodel_driver::DriverError;
use std::time::Duration;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Class of a [`RuntimeError`], for callers that branch on failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ParamInvalid,
    InternalError,
    MemoryAllocationFailure,
    StreamTimeout,
    UnsupportedConfiguration,
    ResourceExhausted,
    ExecutionFailed,
    NotFound,
}

/// Errors that can occur while loading or running a model
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Caller-supplied size, shape, count or option is wrong
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    /// Broken invariant or inconsistent bookkeeping
    #[error("internal error: {0}")]
    Internal(String),

    /// Device memory could not be allocated
    #[error("memory allocation failed: {0}")]
    MemoryAllocation(String),

    /// Synchronization exceeded the configured bound
    #[error("stream synchronization timed out after {timeout:?}")]
    StreamTimeout { timeout: Duration },

    /// Requested combination of placement and options is not supported
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Stream pool cap reached
    #[error("stream pool exhausted: requested {requested} streams with {in_use} of {max} in use")]
    ResourceExhausted { requested: usize, in_use: usize, max: usize },

    /// Device reported a fault status
    #[error("device execution failed with status {code}")]
    ExecutionFailed { code: u32 },

    /// Logical address outside every allocation
    #[error("logical address {addr:#x} is not inside any allocation")]
    AddressNotFound { addr: u64 },

    /// Handle does not name a loaded model
    #[error("unknown model handle {0}")]
    UnknownModel(u64),
}

impl RuntimeError {
    pub fn param_invalid(msg: impl Into<String>) -> Self {
        Self::ParamInvalid(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration(msg.into())
    }

    /// Failure class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ParamInvalid(_) => ErrorKind::ParamInvalid,
            Self::Internal(_) => ErrorKind::InternalError,
            Self::MemoryAllocation(_) => ErrorKind::MemoryAllocationFailure,
            Self::StreamTimeout { .. } => ErrorKind::StreamTimeout,
            Self::UnsupportedConfiguration(_) => ErrorKind::UnsupportedConfiguration,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
            Self::AddressNotFound { .. } | Self::UnknownModel(_) => ErrorKind::NotFound,
        }
    }
}

impl From<DriverError> for RuntimeError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::OutOfMemory { .. } => Self::MemoryAllocation(err.to_string()),
            DriverError::Timeout(timeout) => Self::StreamTimeout { timeout },
            other => Self::Internal(format!("driver: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_map_onto_taxonomy() {
        let oom: RuntimeError = DriverError::OutOfMemory {
            requested: 64,
            available: 0,
        }
        .into();
        assert_eq!(oom.kind(), ErrorKind::MemoryAllocationFailure);

        let timeout: RuntimeError = DriverError::Timeout(Duration::from_millis(5)).into();
        assert_eq!(timeout.kind(), ErrorKind::StreamTimeout);

        let other: RuntimeError = DriverError::InvalidStream(3).into();
        assert_eq!(other.kind(), ErrorKind::InternalError);
        assert!(other.to_string().contains("invalid stream handle: 3"));
    }

    #[test]
    fn lookup_failures_are_not_found() {
        assert_eq!(RuntimeError::AddressNotFound { addr: 0x40 }.kind(), ErrorKind::NotFound);
        assert_eq!(RuntimeError::UnknownModel(9).kind(), ErrorKind::NotFound);
    }
}
