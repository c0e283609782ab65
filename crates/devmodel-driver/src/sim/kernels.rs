//! Kernel registry for the simulated device
//!
//! A kernel receives its argument values (already read from the device
//! argument table) and mutable access to device memory. Built-in kernels:
//!
//! | name              | arguments              | effect                                 |
//! |-------------------|------------------------|----------------------------------------|
//! | `copy`            | `src, dst, len`        | byte copy                              |
//! | `add`             | `a, b, out, len`       | bytewise wrapping add                  |
//! | `fill`            | `dst, len, value`      | memset to `value as u8`                |
//! | `store_u64`       | `dst, value`           | write one u64 (shape descriptors)      |
//! | `spin`            | `micros`               | advance simulated device time          |
//! | `end_of_sequence` | -                      | completes with `END_OF_SEQUENCE`       |
//! | `abort_model`     | -                      | completes with `MODEL_ABORT_NORMAL`    |
//! | `fault`           | -                      | completes with `KERNEL_FAULT`          |

use super::memory::SimMemory;
use crate::error::{DriverError, Result};
use crate::types::DeviceStatus;
use std::collections::HashMap;
use std::sync::Arc;

/// What a kernel reports after running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelOutcome {
    /// Finished normally
    Complete,
    /// Finished with a device status; stops the rest of the launch
    Status(DeviceStatus),
}

/// Execution context handed to a kernel
pub struct KernelContext<'a> {
    pub name: &'a str,
    pub args: &'a [u64],
    pub memory: &'a mut SimMemory,
    /// Simulated device time consumed so far in this synchronization, in µs
    pub elapsed_us: &'a mut u64,
}

impl KernelContext<'_> {
    /// Argument `index`, or a kernel failure naming the missing slot
    pub fn arg(&self, index: usize) -> Result<u64> {
        self.args.get(index).copied().ok_or_else(|| {
            DriverError::kernel_failed(self.name, format!("missing argument {index} (got {})", self.args.len()))
        })
    }

    /// Argument `index` as a byte length
    pub fn len_arg(&self, index: usize) -> Result<usize> {
        let value = self.arg(index)?;
        usize::try_from(value).map_err(|_| DriverError::kernel_failed(self.name, format!("length {value} too large")))
    }
}

/// Kernel entry point
pub type KernelFn = Arc<dyn Fn(&mut KernelContext<'_>) -> Result<KernelOutcome> + Send + Sync>;

/// Name → kernel map
#[derive(Clone)]
pub struct KernelRegistry {
    kernels: HashMap<String, KernelFn>,
}

impl KernelRegistry {
    /// Registry holding the built-in kernels
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            kernels: HashMap::new(),
        };
        registry.register("copy", Arc::new(copy_kernel));
        registry.register("add", Arc::new(add_kernel));
        registry.register("fill", Arc::new(fill_kernel));
        registry.register("store_u64", Arc::new(store_u64_kernel));
        registry.register("spin", Arc::new(spin_kernel));
        registry.register("end_of_sequence", Arc::new(end_of_sequence_kernel));
        registry.register("abort_model", Arc::new(abort_model_kernel));
        registry.register("fault", Arc::new(fault_kernel));
        registry
    }

    /// Add or replace a kernel
    pub fn register(&mut self, name: impl Into<String>, kernel: KernelFn) {
        self.kernels.insert(name.into(), kernel);
    }

    /// Look up a kernel
    pub fn get(&self, name: &str) -> Option<KernelFn> {
        self.kernels.get(name).cloned()
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }
}

fn copy_kernel(ctx: &mut KernelContext<'_>) -> Result<KernelOutcome> {
    let (src, dst, len) = (ctx.arg(0)?, ctx.arg(1)?, ctx.len_arg(2)?);
    ctx.memory.copy_within(dst, src, len)?;
    Ok(KernelOutcome::Complete)
}

fn add_kernel(ctx: &mut KernelContext<'_>) -> Result<KernelOutcome> {
    let (a, b, out, len) = (ctx.arg(0)?, ctx.arg(1)?, ctx.arg(2)?, ctx.len_arg(3)?);
    let mut lhs = vec![0u8; len];
    let mut rhs = vec![0u8; len];
    ctx.memory.load_bytes(a, &mut lhs)?;
    ctx.memory.load_bytes(b, &mut rhs)?;
    let sum: Vec<u8> = lhs.iter().zip(&rhs).map(|(x, y)| x.wrapping_add(*y)).collect();
    ctx.memory.store_bytes(out, &sum)?;
    Ok(KernelOutcome::Complete)
}

fn fill_kernel(ctx: &mut KernelContext<'_>) -> Result<KernelOutcome> {
    let (dst, len, value) = (ctx.arg(0)?, ctx.len_arg(1)?, ctx.arg(2)?);
    ctx.memory.store_bytes(dst, &vec![value as u8; len])?;
    Ok(KernelOutcome::Complete)
}

fn store_u64_kernel(ctx: &mut KernelContext<'_>) -> Result<KernelOutcome> {
    let (dst, value) = (ctx.arg(0)?, ctx.arg(1)?);
    ctx.memory.store_bytes(dst, bytemuck::bytes_of(&value))?;
    Ok(KernelOutcome::Complete)
}

fn spin_kernel(ctx: &mut KernelContext<'_>) -> Result<KernelOutcome> {
    *ctx.elapsed_us += ctx.arg(0)?;
    Ok(KernelOutcome::Complete)
}

fn end_of_sequence_kernel(_: &mut KernelContext<'_>) -> Result<KernelOutcome> {
    Ok(KernelOutcome::Status(DeviceStatus::END_OF_SEQUENCE))
}

fn abort_model_kernel(_: &mut KernelContext<'_>) -> Result<KernelOutcome> {
    Ok(KernelOutcome::Status(DeviceStatus::MODEL_ABORT_NORMAL))
}

fn fault_kernel(_: &mut KernelContext<'_>) -> Result<KernelOutcome> {
    Ok(KernelOutcome::Status(DeviceStatus::KERNEL_FAULT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemPlacement;

    fn run(registry: &KernelRegistry, mem: &mut SimMemory, name: &str, args: &[u64]) -> Result<KernelOutcome> {
        let kernel = registry.get(name).unwrap();
        let mut elapsed = 0;
        let mut ctx = KernelContext {
            name,
            args,
            memory: mem,
            elapsed_us: &mut elapsed,
        };
        kernel(&mut ctx)
    }

    #[test]
    fn add_is_bytewise_wrapping() {
        let registry = KernelRegistry::with_builtins();
        let mut mem = SimMemory::new(1 << 16);
        let a = mem.allocate(4, MemPlacement::Device).unwrap();
        let b = mem.allocate(4, MemPlacement::Device).unwrap();
        let out = mem.allocate(4, MemPlacement::Device).unwrap();
        mem.store_bytes(a, &[1, 2, 3, 250]).unwrap();
        mem.store_bytes(b, &[10, 20, 30, 10]).unwrap();

        run(&registry, &mut mem, "add", &[a, b, out, 4]).unwrap();

        let mut result = [0u8; 4];
        mem.load_bytes(out, &mut result).unwrap();
        assert_eq!(result, [11, 22, 33, 4]);
    }

    #[test]
    fn missing_argument_fails_with_kernel_name() {
        let registry = KernelRegistry::with_builtins();
        let mut mem = SimMemory::new(1 << 16);
        let err = run(&registry, &mut mem, "copy", &[1]).unwrap_err();
        assert!(err.to_string().contains("copy"));
    }

    #[test]
    fn signal_kernels_report_status() {
        let registry = KernelRegistry::with_builtins();
        let mut mem = SimMemory::new(1 << 16);
        assert_eq!(
            run(&registry, &mut mem, "end_of_sequence", &[]).unwrap(),
            KernelOutcome::Status(DeviceStatus::END_OF_SEQUENCE)
        );
        assert!(registry.contains("abort_model"));
        assert!(!registry.contains("matmul"));
    }
}
