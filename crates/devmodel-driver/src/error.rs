//! Error types for driver operations

use crate::types::MemPlacement;
use std::time::Duration;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors reported by a device driver
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Allocation exceeded the device capacity
    #[error("device out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Address does not fall inside any live allocation
    #[error("invalid device address: {0:#x}")]
    InvalidAddress(u64),

    /// Access crosses the end of its allocation
    #[error("access out of bounds: {addr:#x} + {len} exceeds region of {region_size} bytes")]
    OutOfBounds { addr: u64, len: usize, region_size: usize },

    /// Copy kind does not match where the memory actually lives
    #[error("placement mismatch at {addr:#x}: expected {expected:?}, found {actual:?}")]
    PlacementMismatch {
        addr: u64,
        expected: MemPlacement,
        actual: MemPlacement,
    },

    /// Unknown or destroyed stream
    #[error("invalid stream handle: {0}")]
    InvalidStream(u64),

    /// Unknown or destroyed event
    #[error("invalid event handle: {0}")]
    InvalidEvent(u64),

    /// Work was submitted to a stream that has been aborted and not reset
    #[error("stream {0} was aborted and must be reset")]
    StreamAborted(u64),

    /// Waited on an event that nothing recorded
    #[error("event {0} waited on before being recorded")]
    EventNotRecorded(u64),

    /// Synchronization exceeded its bound
    #[error("synchronization timed out after {0:?}")]
    Timeout(Duration),

    /// Kernel name is not registered
    #[error("unknown kernel: {0}")]
    UnknownKernel(String),

    /// Kernel could not run with the arguments it was given
    #[error("kernel {name} failed: {reason}")]
    KernelFailed { name: String, reason: String },

    /// Failure injected by a test harness
    #[error("injected failure: {0}")]
    Injected(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Create a kernel failure error
    pub fn kernel_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KernelFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is the device running out of memory
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
