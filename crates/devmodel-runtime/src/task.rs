//! Task records and ordered distribution onto streams
//!
//! Tasks are bound once at load, in compiled order, each onto its assigned
//! stream with its compiled position as sequence number. Binding is all or
//! nothing: if any task fails, the streams are reset so no partial task list
//! stays behind. After an abort the same records are re-bound by
//! [`TaskDistributor::recover`].

use crate::args::{ArgBlockRef, ArgsManager};
use crate::error::{Result, RuntimeError};
use crate::program::{CompiledProgram, TaskKindDef};
use devmodel_driver::{Driver, EventHandle, LaunchOp, StreamHandle};
use devmodel_tracing::perf_span;
use devmodel_tracing::performance::record_distribution;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Kernel(String),
    Memcpy,
    EventRecord(u32),
    EventWait(u32),
    Collective(String),
}

impl From<&TaskKindDef> for TaskKind {
    fn from(def: &TaskKindDef) -> Self {
        match def {
            TaskKindDef::Kernel { name } => Self::Kernel(name.clone()),
            TaskKindDef::MemcpyAsync => Self::Memcpy,
            TaskKindDef::EventRecord { event } => Self::EventRecord(*event),
            TaskKindDef::EventWait { event } => Self::EventWait(*event),
            TaskKindDef::Collective { name } => Self::Collective(name.clone()),
        }
    }
}

/// Device resources a task is bound against
#[derive(Clone, Copy)]
pub struct LaunchTarget<'a> {
    pub driver: &'a dyn Driver,
    /// Indexed by the program's stream ids
    pub streams: &'a [StreamHandle],
    /// Indexed by the program's event ids
    pub events: &'a [EventHandle],
    pub args: &'a ArgsManager,
}

/// One compiled task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: u32,
    pub stream_id: u32,
    /// Position in compiled order
    pub seq: u64,
    pub argument_block_ref: ArgBlockRef,
    pub kind: TaskKind,
    rebinds: u32,
}

impl TaskRecord {
    pub fn new(task_id: u32, stream_id: u32, seq: u64, argument_block_ref: ArgBlockRef, kind: TaskKind) -> Self {
        Self {
            task_id,
            stream_id,
            seq,
            argument_block_ref,
            kind,
            rebinds: 0,
        }
    }

    /// Bind this task onto its stream
    pub fn distribute(&self, target: &LaunchTarget<'_>) -> Result<()> {
        let stream = *target.streams.get(self.stream_id as usize).ok_or_else(|| {
            RuntimeError::internal(format!("task {}: no stream {}", self.task_id, self.stream_id))
        })?;
        let event = |id: u32| {
            target.events.get(id as usize).copied().ok_or_else(|| {
                RuntimeError::internal(format!("task {}: no event {id}", self.task_id))
            })
        };
        let args_addr = target.args.block_addr(self.argument_block_ref);

        let op = match &self.kind {
            TaskKind::Kernel(name) | TaskKind::Collective(name) => LaunchOp::Kernel {
                name: name.clone(),
                args_addr,
                argc: self.argument_block_ref.count,
            },
            TaskKind::Memcpy => LaunchOp::IndirectCopy { args_addr },
            TaskKind::EventRecord(id) => LaunchOp::RecordEvent(event(*id)?),
            TaskKind::EventWait(id) => LaunchOp::WaitEvent(event(*id)?),
        };
        target
            .driver
            .bind_task(stream, self.seq, op)
            .map_err(|err| RuntimeError::internal(format!("task {}: bind failed: {err}", self.task_id)))
    }

    /// Whether the task can be bound again after an abort
    ///
    /// Collectives coordinate with peers and cannot be replayed alone.
    pub fn is_redistributable(&self) -> bool {
        !matches!(self.kind, TaskKind::Collective(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Kernel(_) => "kernel",
            TaskKind::Memcpy => "memcpy_async",
            TaskKind::EventRecord(_) => "event_record",
            TaskKind::EventWait(_) => "event_wait",
            TaskKind::Collective(_) => "collective",
        }
    }

    /// Times the task was re-bound by recovery
    pub fn rebinds(&self) -> u32 {
        self.rebinds
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeTiming {
    pub count: usize,
    pub total_us: u64,
}

/// Per-task-type timing of one distribution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributeStats {
    pub per_type: BTreeMap<&'static str, TypeTiming>,
    pub total_us: u64,
}

impl DistributeStats {
    pub fn task_count(&self) -> usize {
        self.per_type.values().map(|t| t.count).sum()
    }
}

pub struct TaskDistributor {
    model: String,
    tasks: Vec<TaskRecord>,
}

impl TaskDistributor {
    /// Records for every task of `program`, in compiled order
    pub fn new(program: &CompiledProgram, args: &ArgsManager) -> Result<Self> {
        let tasks = program
            .tasks
            .iter()
            .enumerate()
            .map(|(seq, def)| {
                let block = args.task_block(seq).ok_or_else(|| {
                    RuntimeError::internal(format!("task {}: no argument block", def.task_id))
                })?;
                Ok(TaskRecord::new(def.task_id, def.stream_id, seq as u64, block, (&def.kind).into()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            model: program.name.clone(),
            tasks,
        })
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    /// Bind every task in compiled order; the first failure aborts the call
    /// and leaves the streams empty
    pub fn distribute_task(&self, target: &LaunchTarget<'_>) -> Result<DistributeStats> {
        let all: Vec<usize> = (0..target.streams.len()).collect();
        self.bind_streams(target, &all)
    }

    /// Reset and re-bind every stream whose tasks are all redistributable
    ///
    /// `bindings_lost` says whether the streams were aborted. When they were,
    /// a stream holding a non-redistributable task cannot be restored and the
    /// call fails before any stream is touched. Otherwise such streams keep
    /// the binding they still have.
    pub fn recover(&mut self, target: &LaunchTarget<'_>, bindings_lost: bool) -> Result<DistributeStats> {
        let blocked = self.blocked_streams();
        if bindings_lost && !blocked.is_empty() {
            let describe: Vec<String> = blocked
                .iter()
                .map(|(stream, tasks)| {
                    let ids: Vec<String> = tasks.iter().map(u32::to_string).collect();
                    format!("stream {stream} tasks [{}]", ids.join(", "))
                })
                .collect();
            return Err(RuntimeError::internal(format!(
                "model {}: cannot be redistributed: {}",
                self.model,
                describe.join("; ")
            )));
        }

        let rebind: Vec<usize> = (0..target.streams.len())
            .filter(|i| !blocked.contains_key(&(*i as u32)))
            .collect();
        for &i in &rebind {
            target.driver.reset_stream(target.streams[i])?;
        }
        if !blocked.is_empty() {
            debug!(model = self.model.as_str(), kept = blocked.len(), "streams with collectives keep their binding");
        }
        let stats = self.bind_streams(target, &rebind)?;
        for task in &mut self.tasks {
            if rebind.contains(&(task.stream_id as usize)) {
                task.rebinds += 1;
            }
        }
        Ok(stats)
    }

    /// Stream id → ids of its tasks that cannot be replayed, for every
    /// stream with at least one
    fn blocked_streams(&self) -> BTreeMap<u32, Vec<u32>> {
        let mut blocked: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for task in self.tasks.iter().filter(|t| !t.is_redistributable()) {
            blocked.entry(task.stream_id).or_default().push(task.task_id);
        }
        blocked
    }

    /// Bind, in compiled order, the tasks assigned to `streams` (indices
    /// into `target.streams`)
    fn bind_streams(&self, target: &LaunchTarget<'_>, streams: &[usize]) -> Result<DistributeStats> {
        let selected: Vec<&TaskRecord> = self
            .tasks
            .iter()
            .filter(|t| streams.contains(&(t.stream_id as usize)))
            .collect();
        let _span = perf_span!("distribute_task", tasks = selected.len());
        let mut stats = DistributeStats::default();
        let started = Instant::now();

        for task in selected {
            let start = Instant::now();
            if let Err(err) = task.distribute(target) {
                self.reset_streams(target, streams);
                return Err(err);
            }
            let timing = stats.per_type.entry(task.type_name()).or_default();
            timing.count += 1;
            timing.total_us += start.elapsed().as_micros() as u64;
        }
        stats.total_us = started.elapsed().as_micros() as u64;

        for (task_type, timing) in &stats.per_type {
            record_distribution(task_type, timing.count, timing.total_us);
        }
        debug!(
            model = self.model.as_str(),
            tasks = stats.task_count(),
            streams = streams.len(),
            duration_us = stats.total_us,
            "tasks_distributed"
        );
        Ok(stats)
    }

    fn reset_streams(&self, target: &LaunchTarget<'_>, streams: &[usize]) {
        for stream in streams.iter().filter_map(|&i| target.streams.get(i)) {
            if let Err(err) = target.driver.reset_stream(*stream) {
                warn!(model = self.model.as_str(), %stream, error = %err, "failed to reset stream after distribution failure");
            }
        }
    }
}
