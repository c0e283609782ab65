//! Loaded model instance and its execution state machine
//!
//! ```text
//!            run()
//!   Idle ──► CopyingInput ──► Refreshing ──► Launched ──► Synchronizing ──► CopyingOutput ──► Idle
//!    ▲            │               │             │              │                 │
//!    │            └───────────────┴─────────────┴──────┬───────┴─────────────────┘
//!    │                                                 ▼
//!    └──────────────── recover() ◄──────────── Failed / Aborted (timeout)
//! ```
//!
//! Caller errors (counts, sizes, placement) are detected before the first
//! transition and leave the instance `Idle`. A synchronization timeout
//! aborts the device work and parks the instance in `Aborted`; every later
//! run fails until [`ModelInstance::recover`] re-binds the tasks.

use crate::allocation::{
    ActiveBaseAddressMap, AllocationId, AllocationKind, CopyInfo, IoBinding, MemAllocationTable,
};
use crate::args::{ArgsManager, ArgsUpdateStats};
use crate::dump::{write_layout_dump, LayoutDump};
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::options::{MemoryParams, ModelOptions, RunOptions};
use crate::program::{CompiledProgram, MemoryLayout, TensorDesc};
use crate::refresh::{PlacedBuffer, RefreshContext, RefreshEngine, RefreshPolicy};
use crate::stream_pool::{StreamLease, StreamPool};
use crate::task::{LaunchTarget, TaskDistributor};
use crate::zero_copy::{audit_copy_only, CopyOnlyRegistry, TensorRole, ZeroCopyClassifier, ZeroCopyOffset};
use devmodel_driver::{CopyDesc, CopyKind, DeviceStatus, Driver, DriverError, EventHandle, MemPlacement, StreamHandle};
use devmodel_tracing::perf_span;
use devmodel_tracing::performance::record_refresh;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Execution state of a model instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExecState {
    Idle,
    CopyingInput,
    Refreshing,
    Launched,
    Synchronizing,
    CopyingOutput,
    Failed,
    Aborted,
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::CopyingInput => "copying_input",
            Self::Refreshing => "refreshing",
            Self::Launched => "launched",
            Self::Synchronizing => "synchronizing",
            Self::CopyingOutput => "copying_output",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Completion status of a successful run
///
/// Sequence end and model abort are device signals, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunStatus {
    Success,
    SequenceEnd,
    DeviceAbort,
}

/// Caller buffer in the driver's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBuffer {
    pub addr: u64,
    pub size: usize,
}

impl DataBuffer {
    pub const fn new(addr: u64, size: usize) -> Self {
        Self { addr, size }
    }
}

/// Wall time of each phase, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTimings {
    pub copy_input_us: u64,
    pub refresh_us: u64,
    pub launch_us: u64,
    pub sync_us: u64,
    pub copy_output_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub policy: RefreshPolicy,
    pub args: ArgsUpdateStats,
    /// Bytes produced per output; empty unless the status is `Success`
    pub output_sizes: Vec<usize>,
    pub timings: PhaseTimings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelStats {
    pub runs: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub recoveries: u64,
    pub slots_written: u64,
    pub last_policy: Option<RefreshPolicy>,
    pub policy_counts: BTreeMap<RefreshPolicy, u64>,
}

/// Device memory and events owned by one instance, released on drop
struct DeviceResources {
    driver: Arc<dyn Driver>,
    memory: Vec<u64>,
    events: Vec<EventHandle>,
}

impl DeviceResources {
    fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            memory: Vec::new(),
            events: Vec::new(),
        }
    }

    fn malloc(&mut self, size: u64, placement: MemPlacement) -> Result<u64> {
        let addr = self.driver.malloc(size as usize, placement)?;
        self.memory.push(addr);
        Ok(addr)
    }

    fn adopt(&mut self, addr: u64) {
        self.memory.push(addr);
    }

    fn create_event(&mut self) -> Result<EventHandle> {
        let event = self.driver.create_event()?;
        self.events.push(event);
        Ok(event)
    }
}

impl Drop for DeviceResources {
    fn drop(&mut self) {
        for addr in self.memory.drain(..) {
            if let Err(err) = self.driver.free(addr) {
                warn!(addr = format_args!("{addr:#x}"), error = %err, "failed to free model memory");
            }
        }
        for event in self.events.drain(..) {
            if let Err(err) = self.driver.destroy_event(event) {
                warn!(%event, error = %err, "failed to destroy model event");
            }
        }
    }
}

/// One loaded model
pub struct ModelInstance {
    name: String,
    driver: Arc<dyn Driver>,
    options: ModelOptions,
    memory_params: MemoryParams,
    layout: MemoryLayout,
    table: MemAllocationTable,
    bases: ActiveBaseAddressMap,
    registry: Arc<CopyOnlyRegistry>,
    offsets: Vec<ZeroCopyOffset>,
    copy_infos: Vec<CopyInfo>,
    input_descs: Vec<TensorDesc>,
    output_descs: Vec<TensorDesc>,
    input_bindings: Vec<IoBinding>,
    output_bindings: Vec<IoBinding>,
    owned_bases: Vec<(AllocationId, u64)>,
    host_staging: BTreeMap<AllocationId, u64>,
    refresh: RefreshEngine,
    args: ArgsManager,
    distributor: TaskDistributor,
    lease: StreamLease,
    resources: DeviceResources,
    aborted_stream: Option<StreamHandle>,
    state: ExecState,
    stats: ModelStats,
}

impl ModelInstance {
    /// Build the layout, allocate device memory, lease streams and bind
    /// every task
    ///
    /// Everything allocated here is released again if a later step fails.
    #[tracing::instrument(skip_all, fields(model = %program.name))]
    pub fn load(
        driver: Arc<dyn Driver>,
        pool: &Arc<StreamPool>,
        program: &CompiledProgram,
        memory_params: MemoryParams,
        options: ModelOptions,
    ) -> Result<Self> {
        let started = Instant::now();
        program.validate()?;

        let classification = ZeroCopyClassifier::new(program, &options).classify_all();
        let plan = MemAllocationTable::build(program, &classification.registry, &options)?;
        audit_copy_only(&classification.registry, &plan.table, &plan.copy_infos)?;

        let mut resources = DeviceResources::new(Arc::clone(&driver));
        let mut owned_bases = Vec::new();
        place_regions(
            &mut resources,
            &plan.table,
            AllocationKind::FeatureMap,
            program.layout.feature_map_span(),
            memory_params.feature_map_base.map(|base| (base, Some(memory_params.feature_map_size))),
            &mut owned_bases,
        )?;
        place_regions(
            &mut resources,
            &plan.table,
            AllocationKind::FixedFeatureMap,
            program.layout.fixed_feature_map_span(),
            memory_params.fixed_feature_map_base.map(|base| (base, None)),
            &mut owned_bases,
        )?;
        for id in &plan.staged {
            let size = allocation_size(&plan.table, *id)?;
            owned_bases.push((*id, resources.malloc(size, MemPlacement::Device)?));
        }
        let mut host_staging = BTreeMap::new();
        for binding in &plan.inputs {
            if let IoBinding::HostCopy { id } = binding {
                let size = allocation_size(&plan.table, *id)?;
                host_staging.insert(*id, resources.malloc(size, MemPlacement::Host)?);
            }
        }

        // Owned bases are known now so input copies can target them before
        // the first refresh.
        let mut bases = ActiveBaseAddressMap::new(&plan.table);
        for &(id, base) in &owned_bases {
            bases.set_active_base(id, base)?;
        }

        let args = ArgsManager::new(driver.as_ref(), program, &plan.table)?;
        resources.adopt(args.table_addr());
        for _ in 0..program.event_count {
            resources.create_event()?;
        }
        let lease = pool.acquire(&program.name, program.stream_count as usize)?;
        let distributor = TaskDistributor::new(program, &args)?;
        distributor.distribute_task(&LaunchTarget {
            driver: driver.as_ref(),
            streams: lease.streams(),
            events: &resources.events,
            args: &args,
        })?;

        if let Some(dir) = &options.dump_dir {
            let dump = LayoutDump::new(
                &program.name,
                &plan.table,
                &plan.inputs,
                &plan.outputs,
                &plan.copy_infos,
                &classification.registry,
                &classification.offsets,
            );
            match write_layout_dump(dir, &dump) {
                Ok(path) => debug!(path = %path.display(), "layout dump written"),
                Err(err) => warn!(dir = %dir.display(), error = %err, "failed to write layout dump"),
            }
        }

        info!(
            allocations = plan.table.len(),
            copy_only = classification.registry.len(),
            tasks = program.tasks.len(),
            streams = lease.streams().len(),
            duration_us = started.elapsed().as_micros() as u64,
            "model_loaded"
        );

        let refresh = RefreshEngine::new(
            program.name.clone(),
            options.frozen_input_indices.clone(),
            memory_params.host_zero_copy_reserved,
        );
        Ok(Self {
            name: program.name.clone(),
            driver,
            options,
            memory_params,
            layout: program.layout.clone(),
            table: plan.table,
            bases,
            registry: Arc::new(classification.registry),
            offsets: classification.offsets,
            copy_infos: plan.copy_infos,
            input_descs: program.inputs.clone(),
            output_descs: program.outputs.clone(),
            input_bindings: plan.inputs,
            output_bindings: plan.outputs,
            owned_bases,
            host_staging,
            refresh,
            args,
            distributor,
            lease,
            resources,
            aborted_stream: None,
            state: ExecState::Idle,
            stats: ModelStats::default(),
        })
    }

    /// Run the model once
    ///
    /// # Errors
    ///
    /// - `ParamInvalid` / `UnsupportedConfiguration` before any device work
    /// - `StreamTimeout` after aborting the launch; the instance then needs
    ///   [`Self::recover`]
    /// - `InternalError` when the instance is `Failed` or `Aborted`
    #[tracing::instrument(skip_all, fields(model = %self.name))]
    pub fn run(&mut self, inputs: &[DataBuffer], outputs: &[DataBuffer], run_options: &RunOptions) -> Result<RunOutcome> {
        if self.state != ExecState::Idle {
            return Err(RuntimeError::internal(format!(
                "model {} is {}; recover before running",
                self.name, self.state
            )));
        }
        let placed_inputs = self.check_buffers(TensorRole::Input, inputs)?;
        let placed_outputs = self.check_buffers(TensorRole::Output, outputs)?;
        self.refresh
            .validate_placements(&self.input_bindings, &placed_inputs, &self.output_bindings, &placed_outputs)?;

        let exec_stream = run_options.stream.unwrap_or_else(|| self.lease.exec_stream());
        let _span = perf_span!("model_run", model = self.name.as_str());
        match self.execute(&placed_inputs, &placed_outputs, exec_stream) {
            Ok(outcome) => {
                self.stats.runs += 1;
                self.stats.slots_written += outcome.args.slots_written as u64;
                self.stats.last_policy = Some(outcome.policy);
                *self.stats.policy_counts.entry(outcome.policy).or_default() += 1;
                Ok(outcome)
            }
            Err(err) => {
                self.stats.failures += 1;
                match err.kind() {
                    ErrorKind::StreamTimeout => self.stats.timeouts += 1,
                    ErrorKind::ParamInvalid => self.state = ExecState::Idle,
                    _ => self.transition(ExecState::Failed),
                }
                Err(err)
            }
        }
    }

    /// Re-bind tasks after a timeout or failure and return to `Idle`
    #[tracing::instrument(skip_all, fields(model = %self.name))]
    pub fn recover(&mut self) -> Result<()> {
        match self.state {
            ExecState::Idle => {
                debug!("recover on idle model is a no-op");
                return Ok(());
            }
            ExecState::Failed | ExecState::Aborted => {}
            state => {
                return Err(RuntimeError::internal(format!(
                    "model {} cannot recover while {state}",
                    self.name
                )))
            }
        }

        // Only a timeout abort clears the bound task lists.
        let bindings_lost = self.state == ExecState::Aborted;
        self.distributor.recover(
            &LaunchTarget {
                driver: self.driver.as_ref(),
                streams: self.lease.streams(),
                events: &self.resources.events,
                args: &self.args,
            },
            bindings_lost,
        )?;
        if let Some(stream) = self.aborted_stream.take() {
            if let Err(err) = self.driver.reset_stream(stream) {
                warn!(%stream, error = %err, "failed to reset caller stream");
            }
        }
        self.stats.recoveries += 1;
        self.transition(ExecState::Idle);
        info!("model_recovered");
        Ok(())
    }

    /// Move caller-owned feature-map memory
    ///
    /// The next run rewrites only the argument slots that point into
    /// feature maps.
    pub fn update_feature_map(&mut self, base: u64, size: usize) -> Result<()> {
        if self.memory_params.feature_map_base.is_none() {
            return Err(RuntimeError::unsupported(format!(
                "model {} owns its feature-map memory",
                self.name
            )));
        }
        if self.state != ExecState::Idle {
            return Err(RuntimeError::internal(format!(
                "model {} cannot move feature maps while {}",
                self.name, self.state
            )));
        }
        let (start, span) = self
            .layout
            .feature_map_span()
            .ok_or_else(|| RuntimeError::param_invalid(format!("model {} has no feature maps", self.name)))?;
        if (size as u64) < span {
            return Err(RuntimeError::param_invalid(format!(
                "feature-map memory of {size} bytes is smaller than the {span} bytes required"
            )));
        }

        for (id, owned) in &mut self.owned_bases {
            let Some(allocation) = self.table.get(*id) else { continue };
            if allocation.kind == AllocationKind::FeatureMap {
                *owned = base + (allocation.logical_addr - start);
                self.bases.set_active_base(*id, *owned)?;
            }
        }
        self.memory_params.feature_map_base = Some(base);
        self.memory_params.feature_map_size = size;
        debug!(model = self.name.as_str(), base = format_args!("{base:#x}"), size, "feature map moved");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn stats(&self) -> &ModelStats {
        &self.stats
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// Shared, read-only CopyOnly registry
    pub fn copy_only_registry(&self) -> Arc<CopyOnlyRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn allocation_table(&self) -> &MemAllocationTable {
        &self.table
    }

    pub fn active_bases(&self) -> &ActiveBaseAddressMap {
        &self.bases
    }

    pub fn copy_infos(&self) -> &[CopyInfo] {
        &self.copy_infos
    }

    pub fn input_bindings(&self) -> &[IoBinding] {
        &self.input_bindings
    }

    pub fn output_bindings(&self) -> &[IoBinding] {
        &self.output_bindings
    }

    pub fn zero_copy_offsets(&self) -> &[ZeroCopyOffset] {
        &self.offsets
    }

    pub fn args(&self) -> &ArgsManager {
        &self.args
    }

    pub fn streams(&self) -> &[StreamHandle] {
        self.lease.streams()
    }

    fn transition(&mut self, next: ExecState) {
        trace!(model = self.name.as_str(), from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    fn execute(&mut self, inputs: &[PlacedBuffer], outputs: &[PlacedBuffer], exec_stream: StreamHandle) -> Result<RunOutcome> {
        let mut timings = PhaseTimings::default();

        self.transition(ExecState::CopyingInput);
        let phase = Instant::now();
        self.copy_inputs(inputs, exec_stream)?;
        timings.copy_input_us = elapsed_us(phase);

        self.transition(ExecState::Refreshing);
        let phase = Instant::now();
        let report = self.refresh.refresh(RefreshContext {
            driver: self.driver.as_ref(),
            table: &self.table,
            bases: &mut self.bases,
            input_bindings: &self.input_bindings,
            output_bindings: &self.output_bindings,
            inputs,
            outputs,
            owned_bases: &self.owned_bases,
            host_staging: &self.host_staging,
        })?;
        let args = self
            .args
            .update_for_execute(self.driver.as_ref(), exec_stream, report.policy, &self.bases)?;
        self.refresh.commit(&mut self.bases);
        timings.refresh_us = elapsed_us(phase);
        record_refresh(&self.name, report.policy.label(), args.slots_written, timings.refresh_us);

        self.transition(ExecState::Launched);
        let phase = Instant::now();
        self.driver.execute_bound(self.lease.streams(), exec_stream)?;
        timings.launch_us = elapsed_us(phase);

        self.transition(ExecState::Synchronizing);
        let phase = Instant::now();
        let device_status = match self.driver.synchronize(exec_stream, self.options.exec_timeout) {
            Ok(status) => status,
            Err(DriverError::Timeout(timeout)) => {
                self.abort_after_timeout(exec_stream);
                return Err(RuntimeError::StreamTimeout { timeout });
            }
            Err(err) => return Err(err.into()),
        };
        timings.sync_us = elapsed_us(phase);

        let status = match device_status {
            DeviceStatus::SUCCESS => RunStatus::Success,
            DeviceStatus::END_OF_SEQUENCE => RunStatus::SequenceEnd,
            DeviceStatus::MODEL_ABORT_NORMAL => RunStatus::DeviceAbort,
            other => return Err(RuntimeError::ExecutionFailed { code: other.code() }),
        };

        let mut output_sizes = Vec::new();
        if status == RunStatus::Success {
            self.transition(ExecState::CopyingOutput);
            let phase = Instant::now();
            output_sizes = self.copy_outputs(outputs)?;
            timings.copy_output_us = elapsed_us(phase);
        } else {
            info!(?status, "device signalled completion");
        }

        self.transition(ExecState::Idle);
        Ok(RunOutcome {
            status,
            policy: report.policy,
            args,
            output_sizes,
            timings,
        })
    }

    /// Size and placement checks; nothing on the device is touched
    fn check_buffers(&self, role: TensorRole, buffers: &[DataBuffer]) -> Result<Vec<PlacedBuffer>> {
        let descs = match role {
            TensorRole::Input => &self.input_descs,
            TensorRole::Output => &self.output_descs,
        };
        let label = role.label();
        if buffers.len() != descs.len() {
            return Err(RuntimeError::param_invalid(format!(
                "model {}: expected {} {label}s, got {}",
                self.name,
                descs.len(),
                buffers.len()
            )));
        }

        descs
            .iter()
            .zip(buffers)
            .enumerate()
            .map(|(index, (desc, buffer))| {
                let size = buffer.size as u64;
                if !desc.dynamic && size < desc.size {
                    return Err(RuntimeError::param_invalid(format!(
                        "{label} {index}: buffer holds {size} bytes, {} required",
                        desc.size
                    )));
                }
                if role == TensorRole::Input && size > desc.max_size() {
                    return Err(RuntimeError::param_invalid(format!(
                        "{label} {index}: buffer of {size} bytes exceeds the aligned size {}",
                        desc.max_size()
                    )));
                }
                let placement = self.driver.placement_of(buffer.addr).map_err(|_| {
                    RuntimeError::param_invalid(format!(
                        "{label} {index}: {:#x} is not device-visible memory",
                        buffer.addr
                    ))
                })?;
                Ok(PlacedBuffer {
                    addr: buffer.addr,
                    size: buffer.size,
                    placement,
                })
            })
            .collect()
    }

    fn copy_inputs(&self, inputs: &[PlacedBuffer], exec_stream: StreamHandle) -> Result<()> {
        let threshold = self.options.merge_copy_threshold;
        let mut merged = Vec::new();
        for (binding, buffer) in self.input_bindings.iter().zip(inputs) {
            let IoBinding::Copy(info) = binding else { continue };
            if buffer.size == 0 {
                continue;
            }
            let dst = self.bases.active_base(info.allocation_id)? + info.byte_offset;
            let copy = CopyDesc::new(
                dst,
                buffer.addr,
                buffer.size,
                CopyKind::between(buffer.placement, MemPlacement::Device),
            );
            if buffer.size <= threshold {
                merged.push(copy);
            } else {
                self.driver.memcpy_async(exec_stream, copy)?;
            }
        }
        if !merged.is_empty() {
            trace!(count = merged.len(), "merged input copies");
            self.driver.memcpy_batch(&merged)?;
        }
        Ok(())
    }

    fn copy_outputs(&self, outputs: &[PlacedBuffer]) -> Result<Vec<usize>> {
        let mut sizes = Vec::with_capacity(outputs.len());
        for (index, ((desc, binding), buffer)) in self
            .output_descs
            .iter()
            .zip(&self.output_bindings)
            .zip(outputs)
            .enumerate()
        {
            let produced = match desc.shape_descriptor {
                Some(descriptor) => self.read_shape_descriptor(index, desc, descriptor, buffer)?,
                None if desc.dynamic => buffer.size.min(desc.max_size() as usize),
                None => desc.size as usize,
            };
            if let IoBinding::Copy(info) = binding {
                let src = self.bases.active_base(info.allocation_id)? + info.byte_offset;
                self.driver.memcpy(CopyDesc::new(
                    buffer.addr,
                    src,
                    produced,
                    CopyKind::between(MemPlacement::Device, buffer.placement),
                ))?;
            }
            sizes.push(produced);
        }
        Ok(sizes)
    }

    fn read_shape_descriptor(&self, index: usize, desc: &TensorDesc, descriptor: u64, buffer: &PlacedBuffer) -> Result<usize> {
        let addr = self.bases.physical(&self.table, descriptor)?;
        let mut raw = [0u8; 8];
        self.driver.read(addr, &mut raw)?;
        let produced = u64::from_le_bytes(raw);
        if produced > desc.max_size() {
            return Err(RuntimeError::internal(format!(
                "output {index}: device reported {produced} bytes, more than the aligned size {}",
                desc.max_size()
            )));
        }
        if produced > buffer.size as u64 {
            return Err(RuntimeError::param_invalid(format!(
                "output {index}: {produced} bytes produced but the buffer holds {}",
                buffer.size
            )));
        }
        Ok(produced as usize)
    }

    fn abort_after_timeout(&mut self, exec_stream: StreamHandle) {
        let mut streams = self.lease.streams().to_vec();
        if !streams.contains(&exec_stream) {
            streams.push(exec_stream);
            self.aborted_stream = Some(exec_stream);
        }
        for stream in streams {
            if let Err(err) = self.driver.abort(stream) {
                warn!(model = self.name.as_str(), %stream, error = %err, "abort after timeout failed");
            }
        }
        warn!(model = self.name.as_str(), timeout = ?self.options.exec_timeout, "synchronization timed out, model aborted");
        self.transition(ExecState::Aborted);
    }
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("allocations", &self.table.len())
            .field("copy_only", &self.registry.len())
            .field("lease", &self.lease)
            .finish()
    }
}

/// Give every allocation of `kind` its base inside one contiguous block,
/// either caller-provided or allocated here
fn place_regions(
    resources: &mut DeviceResources,
    table: &MemAllocationTable,
    kind: AllocationKind,
    span: Option<(u64, u64)>,
    external: Option<(u64, Option<usize>)>,
    owned_bases: &mut Vec<(AllocationId, u64)>,
) -> Result<()> {
    let Some((start, len)) = span else { return Ok(()) };
    let base = match external {
        Some((_, Some(size))) if (size as u64) < len => {
            return Err(RuntimeError::param_invalid(format!(
                "{kind:?} memory of {size} bytes is smaller than the {len} bytes required"
            )));
        }
        Some((base, _)) => base,
        None => resources.malloc(len, MemPlacement::Device)?,
    };
    for allocation in table.iter().filter(|a| a.kind == kind) {
        owned_bases.push((allocation.id, base + (allocation.logical_addr - start)));
    }
    Ok(())
}

fn allocation_size(table: &MemAllocationTable, id: AllocationId) -> Result<u64> {
    table
        .get(id)
        .map(|a| a.size)
        .ok_or_else(|| RuntimeError::internal(format!("allocation {id} missing from table")))
}

fn elapsed_us(since: Instant) -> u64 {
    since.elapsed().as_micros() as u64
}
