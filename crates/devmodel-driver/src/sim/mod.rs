//! In-process simulated device
//!
//! Deterministic reference implementation of [`Driver`]. It keeps a real
//! address space ([`SimMemory`]), per-stream bound task lists and a FIFO of
//! queued work. Each queued item belongs to the stream it was submitted on
//! (for launches, the execution stream), and [`Driver::synchronize`] drains
//! only that stream's items:
//!
//! ```text
//! SimDevice
//! ├── SimMemory      - device + host regions, placement-checked copies
//! ├── streams        - bound LaunchOps per stream, aborted flag
//! ├── pending FIFO   - async copies, uploads, replayed launches
//! └── KernelRegistry - named kernels reading args from device memory
//! ```
//!
//! Time is simulated: only the `spin` kernel advances the clock, so timeout
//! behaviour is reproducible in tests without sleeping.

pub mod kernels;
pub mod memory;

use crate::error::{DriverError, Result};
use crate::traits::Driver;
use crate::types::{CopyDesc, CopyKind, DeviceStatus, EventHandle, LaunchOp, MemPlacement, StreamHandle};
use kernels::{KernelContext, KernelFn, KernelOutcome, KernelRegistry};
use memory::SimMemory;
use devmodel_tracing::perf_span;
use devmodel_tracing::performance::record_transfer;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default device capacity: 256 MiB
pub const DEFAULT_DEVICE_CAPACITY: usize = 256 << 20;

/// Counters exposed for tests and diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub h2d_copies: usize,
    pub d2h_copies: usize,
    pub d2d_copies: usize,
    pub h2h_copies: usize,
    pub batch_submissions: usize,
    pub async_writes: usize,
    pub async_write_bytes: usize,
    pub bound_ops: usize,
    pub launches: usize,
    pub aborts: usize,
}

impl SimStats {
    fn count_copy(&mut self, kind: CopyKind) {
        match kind {
            CopyKind::HostToDevice => self.h2d_copies += 1,
            CopyKind::DeviceToHost => self.d2h_copies += 1,
            CopyKind::DeviceToDevice => self.d2d_copies += 1,
            CopyKind::HostToHost => self.h2h_copies += 1,
        }
    }
}

#[derive(Debug, Default)]
struct SimStream {
    bound: Vec<(u64, LaunchOp)>,
    aborted: bool,
}

#[derive(Debug)]
enum PendingOp {
    Launch(LaunchOp),
    Copy(CopyDesc),
    Write { dst: u64, data: Vec<u8> },
}

#[derive(Debug)]
struct Pending {
    /// Stream that owns the op; abort and reset drop it
    stream: u64,
    /// Stream whose synchronize runs it
    queue: u64,
    op: PendingOp,
}

impl Pending {
    fn on(stream: u64, op: PendingOp) -> Self {
        Self { stream, queue: stream, op }
    }

    fn touches(&self, stream: u64) -> bool {
        self.stream == stream || self.queue == stream
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_bind_after: Option<usize>,
    fail_abort: bool,
}

struct SimState {
    memory: SimMemory,
    streams: HashMap<u64, SimStream>,
    events: HashMap<u64, bool>,
    pending: VecDeque<Pending>,
    next_stream: u64,
    next_event: u64,
    faults: FaultPlan,
    stats: SimStats,
}

impl SimState {
    fn stream(&self, handle: StreamHandle) -> Result<&SimStream> {
        self.streams
            .get(&handle.id())
            .ok_or(DriverError::InvalidStream(handle.id()))
    }

    fn live_stream(&mut self, handle: StreamHandle) -> Result<&mut SimStream> {
        let stream = self
            .streams
            .get_mut(&handle.id())
            .ok_or(DriverError::InvalidStream(handle.id()))?;
        if stream.aborted {
            return Err(DriverError::StreamAborted(handle.id()));
        }
        Ok(stream)
    }

    fn check_placements(&self, copy: &CopyDesc) -> Result<()> {
        for (addr, expected) in [
            (copy.src, copy.kind.src_placement()),
            (copy.dst, copy.kind.dst_placement()),
        ] {
            let actual = self.memory.placement_of(addr)?;
            if actual != expected {
                return Err(DriverError::PlacementMismatch { addr, expected, actual });
            }
        }
        Ok(())
    }
}

/// Simulated device implementing [`Driver`]
pub struct SimDevice {
    state: Mutex<SimState>,
    kernels: RwLock<KernelRegistry>,
}

impl SimDevice {
    /// Device with [`DEFAULT_DEVICE_CAPACITY`] bytes of device memory
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEVICE_CAPACITY)
    }

    /// Device with an explicit device-memory capacity
    pub fn with_capacity(device_capacity: usize) -> Self {
        Self {
            state: Mutex::new(SimState {
                memory: SimMemory::new(device_capacity),
                streams: HashMap::new(),
                events: HashMap::new(),
                pending: VecDeque::new(),
                next_stream: 1,
                next_event: 1,
                faults: FaultPlan::default(),
                stats: SimStats::default(),
            }),
            kernels: RwLock::new(KernelRegistry::with_builtins()),
        }
    }

    /// Register an additional kernel
    pub fn register_kernel(&self, name: impl Into<String>, kernel: KernelFn) {
        self.kernels.write().register(name, kernel);
    }

    /// Snapshot of the device counters
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }

    /// Make the bind after `successes` further successful binds fail once
    pub fn inject_bind_failure_after(&self, successes: usize) {
        self.state.lock().faults.fail_bind_after = Some(successes);
    }

    /// Make every abort fail until cleared
    pub fn set_abort_failure(&self, fail: bool) {
        self.state.lock().faults.fail_abort = fail;
    }

    /// Change the device-memory capacity
    pub fn set_device_capacity(&self, capacity: usize) {
        self.state.lock().memory.set_device_capacity(capacity);
    }

    /// Number of live allocations (device and host)
    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.allocation_count()
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Number of tasks bound to `stream`, or `None` for an unknown stream
    pub fn bound_op_count(&self, stream: StreamHandle) -> Option<usize> {
        self.state.lock().streams.get(&stream.id()).map(|s| s.bound.len())
    }

    /// Whether `stream` is in the aborted state
    pub fn is_aborted(&self, stream: StreamHandle) -> bool {
        self.state
            .lock()
            .streams
            .get(&stream.id())
            .is_some_and(|s| s.aborted)
    }

    /// Number of queued, not yet executed work items
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Queued work items that `synchronize(stream)` would run
    pub fn pending_on(&self, stream: StreamHandle) -> usize {
        self.state.lock().pending.iter().filter(|p| p.queue == stream.id()).count()
    }

    fn run_launch(
        &self,
        memory: &mut SimMemory,
        events: &mut HashMap<u64, bool>,
        op: &LaunchOp,
        elapsed_us: &mut u64,
    ) -> Result<KernelOutcome> {
        match op {
            LaunchOp::Kernel { name, args_addr, argc } => {
                let args = memory.load_u64s(*args_addr, *argc)?;
                let kernel = self
                    .kernels
                    .read()
                    .get(name)
                    .ok_or_else(|| DriverError::UnknownKernel(name.clone()))?;
                let mut ctx = KernelContext {
                    name,
                    args: &args,
                    memory,
                    elapsed_us,
                };
                kernel(&mut ctx)
            }
            LaunchOp::IndirectCopy { args_addr } => {
                let triple = memory.load_u64s(*args_addr, 3)?;
                let len = usize::try_from(triple[2])
                    .map_err(|_| DriverError::kernel_failed("memcpy", format!("length {} too large", triple[2])))?;
                memory.copy_within(triple[1], triple[0], len)?;
                Ok(KernelOutcome::Complete)
            }
            LaunchOp::RecordEvent(event) => {
                let recorded = events
                    .get_mut(&event.id())
                    .ok_or(DriverError::InvalidEvent(event.id()))?;
                *recorded = true;
                Ok(KernelOutcome::Complete)
            }
            LaunchOp::WaitEvent(event) => match events.get(&event.id()) {
                Some(true) => Ok(KernelOutcome::Complete),
                Some(false) => Err(DriverError::EventNotRecorded(event.id())),
                None => Err(DriverError::InvalidEvent(event.id())),
            },
        }
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SimDevice {
    fn malloc(&self, size: usize, placement: MemPlacement) -> Result<u64> {
        let addr = self.state.lock().memory.allocate(size, placement)?;
        trace!(addr = format_args!("{addr:#x}"), size, ?placement, "sim_malloc");
        Ok(addr)
    }

    fn free(&self, addr: u64) -> Result<()> {
        self.state.lock().memory.free(addr)
    }

    fn placement_of(&self, addr: u64) -> Result<MemPlacement> {
        self.state.lock().memory.placement_of(addr)
    }

    fn memcpy(&self, copy: CopyDesc) -> Result<()> {
        let start = Instant::now();
        let mut state = self.state.lock();
        state.check_placements(&copy)?;
        state.memory.copy_within(copy.dst, copy.src, copy.len)?;
        state.stats.count_copy(copy.kind);
        record_transfer(copy.len, copy.kind.label(), start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn memcpy_batch(&self, copies: &[CopyDesc]) -> Result<()> {
        let mut state = self.state.lock();
        for copy in copies {
            state.check_placements(copy)?;
        }
        let _span = perf_span!("sim_memcpy_batch", copies = copies.len());
        for copy in copies {
            state.memory.copy_within(copy.dst, copy.src, copy.len)?;
            state.stats.count_copy(copy.kind);
        }
        state.stats.batch_submissions += 1;
        Ok(())
    }

    fn memcpy_async(&self, stream: StreamHandle, copy: CopyDesc) -> Result<()> {
        let mut state = self.state.lock();
        state.live_stream(stream)?;
        state.check_placements(&copy)?;
        state.stats.count_copy(copy.kind);
        state.pending.push_back(Pending::on(stream.id(), PendingOp::Copy(copy)));
        Ok(())
    }

    fn write_async(&self, stream: StreamHandle, dst: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.live_stream(stream)?;
        // Validate the target now so errors surface at submission.
        state.memory.placement_of(dst)?;
        state.stats.async_writes += 1;
        state.stats.async_write_bytes += data.len();
        state.pending.push_back(Pending::on(
            stream.id(),
            PendingOp::Write {
                dst,
                data: data.to_vec(),
            },
        ));
        Ok(())
    }

    fn write(&self, dst: u64, data: &[u8]) -> Result<()> {
        self.state.lock().memory.store_bytes(dst, data)
    }

    fn read(&self, src: u64, out: &mut [u8]) -> Result<()> {
        self.state.lock().memory.load_bytes(src, out)
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        let mut state = self.state.lock();
        let id = state.next_stream;
        state.next_stream += 1;
        state.streams.insert(id, SimStream::default());
        debug!(stream = id, "sim_stream_created");
        Ok(StreamHandle::new(id))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.state.lock();
        state
            .streams
            .remove(&stream.id())
            .ok_or(DriverError::InvalidStream(stream.id()))?;
        state.pending.retain(|p| !p.touches(stream.id()));
        Ok(())
    }

    fn reset_stream(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .streams
            .get_mut(&stream.id())
            .ok_or(DriverError::InvalidStream(stream.id()))?;
        entry.bound.clear();
        entry.aborted = false;
        state.pending.retain(|p| !p.touches(stream.id()));
        Ok(())
    }

    fn abort(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.fail_abort {
            return Err(DriverError::Injected(format!("abort of stream {} failed", stream.id())));
        }
        let entry = state
            .streams
            .get_mut(&stream.id())
            .ok_or(DriverError::InvalidStream(stream.id()))?;
        entry.bound.clear();
        entry.aborted = true;
        state.pending.retain(|p| !p.touches(stream.id()));
        state.stats.aborts += 1;
        warn!(stream = stream.id(), "sim_stream_aborted");
        Ok(())
    }

    fn synchronize(&self, stream: StreamHandle, timeout: Option<Duration>) -> Result<DeviceStatus> {
        let mut guard = self.state.lock();
        guard.stream(stream)?;
        let state = &mut *guard;
        let queue = stream.id();
        let limit_us = timeout.map(|t| t.as_micros() as u64);
        let mut elapsed_us = 0u64;

        loop {
            let Some(pos) = state.pending.iter().position(|p| p.queue == queue) else {
                break;
            };
            let Some(item) = state.pending.remove(pos) else {
                break;
            };
            let outcome = match &item.op {
                PendingOp::Copy(copy) => state
                    .memory
                    .copy_within(copy.dst, copy.src, copy.len)
                    .map(|_| KernelOutcome::Complete),
                PendingOp::Write { dst, data } => state
                    .memory
                    .store_bytes(*dst, data)
                    .map(|_| KernelOutcome::Complete),
                PendingOp::Launch(op) => self.run_launch(&mut state.memory, &mut state.events, op, &mut elapsed_us),
            };

            match outcome {
                Ok(KernelOutcome::Complete) => {}
                Ok(KernelOutcome::Status(status)) => {
                    state.pending.retain(|p| p.queue != queue);
                    debug!(stream = queue, status = status.code(), "sim_launch_signalled");
                    return Ok(status);
                }
                Err(err) => {
                    state.pending.retain(|p| p.queue != queue);
                    return Err(err);
                }
            }

            // Whatever is still queued stays queued until abort.
            if let (Some(limit), Some(t)) = (limit_us, timeout) {
                if elapsed_us > limit {
                    return Err(DriverError::Timeout(t));
                }
            }
        }
        Ok(DeviceStatus::SUCCESS)
    }

    fn create_event(&self) -> Result<EventHandle> {
        let mut state = self.state.lock();
        let id = state.next_event;
        state.next_event += 1;
        state.events.insert(id, false);
        Ok(EventHandle::new(id))
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        self.state
            .lock()
            .events
            .remove(&event.id())
            .map(|_| ())
            .ok_or(DriverError::InvalidEvent(event.id()))
    }

    fn bind_task(&self, stream: StreamHandle, seq: u64, op: LaunchOp) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.faults.fail_bind_after {
            if remaining == 0 {
                state.faults.fail_bind_after = None;
                return Err(DriverError::Injected(format!("bind of task {seq} failed")));
            }
            state.faults.fail_bind_after = Some(remaining - 1);
        }
        match &op {
            LaunchOp::Kernel { name, .. } if !self.kernels.read().contains(name) => {
                return Err(DriverError::UnknownKernel(name.clone()));
            }
            LaunchOp::RecordEvent(event) | LaunchOp::WaitEvent(event) if !state.events.contains_key(&event.id()) => {
                return Err(DriverError::InvalidEvent(event.id()));
            }
            _ => {}
        }
        state.live_stream(stream)?.bound.push((seq, op));
        state.stats.bound_ops += 1;
        Ok(())
    }

    fn execute_bound(&self, streams: &[StreamHandle], exec_stream: StreamHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.live_stream(exec_stream)?;

        let mut ops: Vec<(u64, u64, LaunchOp)> = Vec::new();
        for handle in streams {
            let stream = state.live_stream(*handle)?;
            ops.extend(stream.bound.iter().map(|(seq, op)| (*seq, handle.id(), op.clone())));
        }
        ops.sort_by_key(|(seq, _, _)| *seq);

        for (_, _, op) in &ops {
            if let LaunchOp::RecordEvent(event) | LaunchOp::WaitEvent(event) = op {
                if let Some(recorded) = state.events.get_mut(&event.id()) {
                    *recorded = false;
                }
            }
        }
        for (_, stream, op) in ops {
            state.pending.push_back(Pending {
                stream,
                queue: exec_stream.id(),
                op: PendingOp::Launch(op),
            });
        }
        state.stats.launches += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memcpy_checks_placement_tags() {
        let dev = SimDevice::new();
        let host = dev.malloc(16, MemPlacement::Host).unwrap();
        let device = dev.malloc(16, MemPlacement::Device).unwrap();

        dev.memcpy(CopyDesc::new(device, host, 16, CopyKind::HostToDevice)).unwrap();
        let err = dev
            .memcpy(CopyDesc::new(device, host, 16, CopyKind::DeviceToDevice))
            .unwrap_err();
        assert!(matches!(err, DriverError::PlacementMismatch { .. }));
        assert_eq!(dev.stats().h2d_copies, 1);
    }

    #[test]
    fn bind_failure_is_one_shot() {
        let dev = SimDevice::new();
        let stream = dev.create_stream().unwrap();
        let event = dev.create_event().unwrap();
        dev.inject_bind_failure_after(1);

        dev.bind_task(stream, 0, LaunchOp::RecordEvent(event)).unwrap();
        assert!(matches!(
            dev.bind_task(stream, 1, LaunchOp::RecordEvent(event)),
            Err(DriverError::Injected(_))
        ));
        dev.bind_task(stream, 1, LaunchOp::RecordEvent(event)).unwrap();
        assert_eq!(dev.bound_op_count(stream), Some(2));
    }

    #[test]
    fn aborted_stream_rejects_work_until_reset() {
        let dev = SimDevice::new();
        let stream = dev.create_stream().unwrap();
        let event = dev.create_event().unwrap();
        dev.bind_task(stream, 0, LaunchOp::RecordEvent(event)).unwrap();

        dev.abort(stream).unwrap();
        assert!(dev.is_aborted(stream));
        assert_eq!(dev.bound_op_count(stream), Some(0));
        assert!(matches!(
            dev.execute_bound(&[stream], stream),
            Err(DriverError::StreamAborted(_))
        ));

        dev.reset_stream(stream).unwrap();
        assert!(!dev.is_aborted(stream));
        dev.execute_bound(&[stream], stream).unwrap();
    }

    #[test]
    fn unknown_kernel_rejected_at_bind() {
        let dev = SimDevice::new();
        let stream = dev.create_stream().unwrap();
        let err = dev
            .bind_task(
                stream,
                0,
                LaunchOp::Kernel {
                    name: "conv2d".into(),
                    args_addr: 0,
                    argc: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DriverError::UnknownKernel(_)));
    }
}
