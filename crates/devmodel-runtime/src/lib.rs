//! # devmodel-runtime - Compiled Model Execution
//!
//! Loads a compiled task list onto a device and runs it repeatedly with
//! caller-supplied buffers, rewriting only the device arguments whose
//! addresses actually moved.
//!
//! ## Architecture
//!
//! ```text
//! CompiledProgram ──► ZeroCopyClassifier ──► MemAllocationTable ──► ArgsManager
//!                          │                        │                   │
//!                   CopyOnlyRegistry       ActiveBaseAddressMap   device arg table
//!                                                   │                   │
//! Run(inputs, outputs) ──► copy CopyOnly ──► RefreshEngine ──► update_for_execute
//!                                                                       │
//!                     StreamPool ──► TaskDistributor (bound once) ──► execute_bound
//! ```
//!
//! - **Logical allocations**: every address the compiler emitted belongs to
//!   exactly one allocation; physical bases live only in the
//!   [`ActiveBaseAddressMap`].
//! - **Zero-copy binding**: inputs and outputs consumed directly by tasks are
//!   bound to the caller's buffer; the rest are copied through staging.
//! - **Incremental refresh**: the first run writes every argument, later runs
//!   write only the slots of moved allocations, or nothing.
//!
//! ## Example
//!
//! ```rust
//! use devmodel_driver::{Driver, MemPlacement, SimDevice};
//! use devmodel_runtime::{CompiledProgram, DataBuffer, MemoryParams, RefreshPolicy, Runtime};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let program = CompiledProgram::from_json(r#"{
//!     "name": "copy8",
//!     "inputs":  [{ "logical_addr": 4096, "size": 8 }],
//!     "outputs": [{ "logical_addr": 8192, "size": 8 }],
//!     "tasks": [{ "task_id": 0, "stream_id": 0,
//!                 "kind": { "type": "kernel", "name": "copy" },
//!                 "args": [{ "addr": 4096 }, { "addr": 8192 }, { "value": 8 }] }]
//! }"#)?;
//!
//! let device = Arc::new(SimDevice::new());
//! let runtime = Runtime::new(device.clone());
//! let model = runtime.load(&program, MemoryParams::default())?;
//!
//! let input = device.malloc(8, MemPlacement::Device)?;
//! let output = device.malloc(8, MemPlacement::Device)?;
//! device.write(input, &[1, 2, 3, 4, 5, 6, 7, 8])?;
//!
//! let inputs = [DataBuffer::new(input, 8)];
//! let outputs = [DataBuffer::new(output, 8)];
//! let first = runtime.run(model, &inputs, &outputs)?;
//! assert_eq!(first.policy, RefreshPolicy::UpdateAllOneTime);
//! let second = runtime.run(model, &inputs, &outputs)?;
//! assert_eq!(second.policy, RefreshPolicy::NoUpdate);
//!
//! let mut result = [0u8; 8];
//! device.read(output, &mut result)?;
//! assert_eq!(result, [1, 2, 3, 4, 5, 6, 7, 8]);
//! runtime.unload(model)?;
//! # Ok(())
//! # }
//! ```

pub mod allocation;
pub mod args;
pub mod dump;
pub mod error;
pub mod model;
pub mod options;
pub mod program;
pub mod refresh;
pub mod runtime;
pub mod stream_pool;
pub mod task;
pub mod zero_copy;

pub use allocation::{
    ActiveBaseAddressMap, AllocationId, AllocationKind, CopyInfo, IoBinding, LayoutPlan, LogicalAllocation,
    MemAllocationTable,
};
pub use args::{ArgBlockRef, ArgSlot, ArgsManager, ArgsUpdateStats};
pub use dump::{write_layout_dump, LayoutDump};
pub use error::{ErrorKind, Result, RuntimeError};
pub use model::{DataBuffer, ExecState, ModelInstance, ModelStats, PhaseTimings, RunOutcome, RunStatus};
pub use options::{MemoryParams, ModelOptions, RunOptions, StreamPoolConfig};
pub use program::{CompiledProgram, MemoryLayout, RegionDesc, TaskArg, TaskDef, TaskKindDef, TensorDesc};
pub use refresh::{PlacedBuffer, RefreshContext, RefreshEngine, RefreshPolicy, RefreshReport};
pub use runtime::{AsyncWorker, ModelHandle, Runtime};
pub use stream_pool::{StreamLease, StreamPool};
pub use task::{DistributeStats, LaunchTarget, TaskDistributor, TaskKind, TaskRecord, TypeTiming};
pub use zero_copy::{
    audit_copy_only, ArgSlotRef, Classification, CopyOnlyReason, CopyOnlyRegistry, TensorRole, ZeroCopyClassifier,
    ZeroCopyOffset,
};
