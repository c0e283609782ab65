//! Driver trait: the narrow device surface the runtime consumes
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Driver Trait                        │
//! │  - memory: malloc / free / copies (sync, async, batch)   │
//! │  - streams: create / destroy / reset / abort / sync      │
//! │  - events: create / destroy                              │
//! │  - launch: bind_task / execute_bound                     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!              ┌────────┴────────┐
//!              ▼                 ▼
//!        ┌───────────┐     ┌───────────┐
//!        │ SimDevice │     │  vendor   │
//!        │ (in-proc) │     │  runtime  │
//!        └───────────┘     └───────────┘
//! ```
//!
//! # Launch Model
//!
//! Tasks are bound onto streams once, at model load, with
//! [`Driver::bind_task`]. Each invocation replays everything bound to a set
//! of streams with [`Driver::execute_bound`], then waits with
//! [`Driver::synchronize`]. Argument values live in device memory, so
//! rebinding is only needed after [`Driver::abort`] destroyed the bound work.

use crate::error::Result;
use crate::types::{CopyDesc, DeviceStatus, EventHandle, LaunchOp, MemPlacement, StreamHandle};
use std::time::Duration;

/// Device driver primitives
///
/// Implementations are shared across model instances and threads, so every
/// method takes `&self` and synchronizes internally.
pub trait Driver: Send + Sync {
    // ============================================================================================
    // Memory
    // ============================================================================================

    /// Allocate `size` bytes with the given placement and return the base address
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when the placement's capacity is exhausted.
    fn malloc(&self, size: usize, placement: MemPlacement) -> Result<u64>;

    /// Free an allocation by its base address
    fn free(&self, addr: u64) -> Result<()>;

    /// Placement of the allocation containing `addr`
    fn placement_of(&self, addr: u64) -> Result<MemPlacement>;

    /// Synchronous copy; the kind tag must match both placements
    fn memcpy(&self, copy: CopyDesc) -> Result<()>;

    /// Submit several copies as one request
    ///
    /// The default implementation issues them one by one.
    fn memcpy_batch(&self, copies: &[CopyDesc]) -> Result<()> {
        for copy in copies {
            self.memcpy(*copy)?;
        }
        Ok(())
    }

    /// Copy ordered on `stream`
    fn memcpy_async(&self, stream: StreamHandle, copy: CopyDesc) -> Result<()>;

    /// Upload host bytes to `dst`, ordered on `stream`
    fn write_async(&self, stream: StreamHandle, dst: u64, data: &[u8]) -> Result<()>;

    /// Upload host bytes to `dst` immediately
    fn write(&self, dst: u64, data: &[u8]) -> Result<()>;

    /// Download `out.len()` bytes from `src` immediately
    fn read(&self, src: u64, out: &mut [u8]) -> Result<()>;

    // ============================================================================================
    // Streams and Events
    // ============================================================================================

    /// Create a command stream
    fn create_stream(&self) -> Result<StreamHandle>;

    /// Destroy a stream and everything bound to it
    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Drop bound work and clear the aborted state
    fn reset_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Best-effort abort of pending and bound work on `stream`
    fn abort(&self, stream: StreamHandle) -> Result<()>;

    /// Block until queued work completes or `timeout` elapses
    ///
    /// Returns the device status of the completed work. Non-success statuses
    /// are reported here, not as errors.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the bound is exceeded; the work stays queued
    /// until [`Driver::abort`] is called.
    fn synchronize(&self, stream: StreamHandle, timeout: Option<Duration>) -> Result<DeviceStatus>;

    /// Create an event
    fn create_event(&self) -> Result<EventHandle>;

    /// Destroy an event
    fn destroy_event(&self, event: EventHandle) -> Result<()>;

    // ============================================================================================
    // Task Launch
    // ============================================================================================

    /// Bind one task onto `stream`
    ///
    /// `seq` is the task's position in compiled order; replay follows it
    /// across streams.
    fn bind_task(&self, stream: StreamHandle, seq: u64, op: LaunchOp) -> Result<()>;

    /// Queue everything bound to `streams` for execution behind prior work on
    /// `exec_stream`
    fn execute_bound(&self, streams: &[StreamHandle], exec_stream: StreamHandle) -> Result<()>;
}
