//! Device driver boundary for the model execution runtime
//!
//! This crate provides:
//! - **Driver Trait**: the narrow set of device primitives the runtime uses
//! - **Handles and Descriptors**: streams, events, copies, launch ops, statuses
//! - **SimDevice**: a deterministic in-process device for tests and benches
//!
//! # Usage
//!
//! ```rust
//! use devmodel_driver::{CopyDesc, CopyKind, Driver, MemPlacement, SimDevice};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = SimDevice::new();
//! let host = device.malloc(4, MemPlacement::Host)?;
//! let dev = device.malloc(4, MemPlacement::Device)?;
//!
//! device.write(host, &[1, 2, 3, 4])?;
//! device.memcpy(CopyDesc::new(dev, host, 4, CopyKind::HostToDevice))?;
//!
//! let mut out = [0u8; 4];
//! device.read(dev, &mut out)?;
//! assert_eq!(out, [1, 2, 3, 4]);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod sim;
pub mod traits;
pub mod types;

pub use error::{DriverError, Result};
pub use sim::kernels::{KernelContext, KernelFn, KernelOutcome, KernelRegistry};
pub use sim::{SimDevice, SimStats, DEFAULT_DEVICE_CAPACITY};
pub use traits::Driver;
pub use types::{CopyDesc, CopyKind, DeviceStatus, EventHandle, LaunchOp, MemPlacement, StreamHandle};
