//! Compiled program description consumed at load
//!
//! Produced by the graph compiler and usually shipped as JSON:
//!
//! ```json
//! {
//!   "name": "add2",
//!   "layout": { "feature_maps": [{ "logical_addr": 1048576, "size": 128 }] },
//!   "inputs":  [{ "logical_addr": 65536, "size": 16 }],
//!   "outputs": [{ "logical_addr": 196608, "size": 16 }],
//!   "tasks": [
//!     { "task_id": 0, "stream_id": 0,
//!       "kind": { "type": "kernel", "name": "copy" },
//!       "args": [{ "addr": 65536 }, { "addr": 196608 }, { "value": 16 }] }
//!   ]
//! }
//! ```

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One compiled model: ordered tasks plus the memory layout they assume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub name: String,
    /// Tasks in compiled topological order
    pub tasks: Vec<TaskDef>,
    #[serde(default)]
    pub layout: MemoryLayout,
    #[serde(default)]
    pub inputs: Vec<TensorDesc>,
    #[serde(default)]
    pub outputs: Vec<TensorDesc>,
    #[serde(default = "default_stream_count")]
    pub stream_count: u32,
    #[serde(default)]
    pub event_count: u32,
    /// Flat option map, parsed by `ModelOptions::from_map`
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_stream_count() -> u32 {
    1
}

/// Feature-map regions of the logical address space
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLayout {
    #[serde(default)]
    pub feature_maps: Vec<RegionDesc>,
    #[serde(default)]
    pub fixed_feature_maps: Vec<RegionDesc>,
}

impl MemoryLayout {
    /// `(lowest logical address, total span)` of the feature-map regions
    pub fn feature_map_span(&self) -> Option<(u64, u64)> {
        span_of(&self.feature_maps)
    }

    pub fn fixed_feature_map_span(&self) -> Option<(u64, u64)> {
        span_of(&self.fixed_feature_maps)
    }
}

fn span_of(regions: &[RegionDesc]) -> Option<(u64, u64)> {
    let start = regions.iter().map(|r| r.logical_addr).min()?;
    let end = regions.iter().map(RegionDesc::end).max()?;
    Some((start, end - start))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDesc {
    pub logical_addr: u64,
    pub size: u64,
}

impl RegionDesc {
    pub fn end(&self) -> u64 {
        self.logical_addr.saturating_add(self.size)
    }
}

/// A model input or output tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub logical_addr: u64,
    /// Required byte size for static shapes
    pub size: u64,
    /// Padded size; caller buffers may be up to this large
    #[serde(default)]
    pub aligned_size: Option<u64>,
    /// Shape is only known at run time
    #[serde(default)]
    pub dynamic: bool,
    /// Output must be staged in device memory when memory is reused
    #[serde(default)]
    pub host_staging: bool,
    /// Logical address of an 8-byte byte count written by the device
    #[serde(default)]
    pub shape_descriptor: Option<u64>,
}

impl TensorDesc {
    /// Largest byte size a caller buffer or staging region may have
    pub fn max_size(&self) -> u64 {
        self.aligned_size.unwrap_or(self.size).max(self.size)
    }

    /// `[logical_addr, logical_addr + max_size)` overlaps `[addr, addr + len)`
    pub fn overlaps(&self, addr: u64, len: u64) -> bool {
        self.logical_addr < addr.saturating_add(len) && addr < self.end()
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.logical_addr && addr < self.end()
    }

    pub fn end(&self) -> u64 {
        self.logical_addr.saturating_add(self.max_size())
    }
}

/// One task in compiled order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDef {
    pub task_id: u32,
    pub stream_id: u32,
    pub kind: TaskKindDef,
    #[serde(default)]
    pub args: Vec<TaskArg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKindDef {
    Kernel { name: String },
    /// Device copy; args are `[src addr, dst addr, len value]`
    MemcpyAsync,
    EventRecord { event: u32 },
    EventWait { event: u32 },
    /// Opaque collective, launched like a kernel
    Collective { name: String },
}

impl TaskKindDef {
    /// Short type name for timing and logs
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Kernel { .. } => "kernel",
            Self::MemcpyAsync => "memcpy_async",
            Self::EventRecord { .. } => "event_record",
            Self::EventWait { .. } => "event_wait",
            Self::Collective { .. } => "collective",
        }
    }
}

/// One u64 task argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskArg {
    /// Logical address, relocated to a physical address before launch
    Addr(u64),
    /// Plain scalar
    Value(u64),
}

impl CompiledProgram {
    /// Parse a program from compiler JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RuntimeError::param_invalid(format!("compiled program: {e}")))
    }

    /// Number of argument slots across all tasks
    pub fn total_arg_slots(&self) -> usize {
        self.tasks.iter().map(|t| t.args.len()).sum()
    }

    /// Check ids and regions before anything is allocated
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RuntimeError::param_invalid("compiled program has no name"));
        }
        if self.stream_count == 0 {
            return Err(RuntimeError::param_invalid(format!(
                "model {}: stream_count must be at least 1",
                self.name
            )));
        }

        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.task_id) {
                return Err(RuntimeError::param_invalid(format!("duplicate task id {}", task.task_id)));
            }
            if task.stream_id >= self.stream_count {
                return Err(RuntimeError::param_invalid(format!(
                    "task {}: stream {} out of range ({} streams)",
                    task.task_id, task.stream_id, self.stream_count
                )));
            }
            match &task.kind {
                TaskKindDef::EventRecord { event } | TaskKindDef::EventWait { event } if *event >= self.event_count => {
                    return Err(RuntimeError::param_invalid(format!(
                        "task {}: event {event} out of range ({} events)",
                        task.task_id, self.event_count
                    )));
                }
                TaskKindDef::MemcpyAsync => {
                    let well_formed = matches!(
                        task.args.as_slice(),
                        [TaskArg::Addr(_), TaskArg::Addr(_), TaskArg::Value(_)]
                    );
                    if !well_formed {
                        return Err(RuntimeError::param_invalid(format!(
                            "task {}: memcpy_async expects [src addr, dst addr, len value]",
                            task.task_id
                        )));
                    }
                }
                _ => {}
            }
        }

        for (label, regions) in [
            ("feature map", &self.layout.feature_maps),
            ("fixed feature map", &self.layout.fixed_feature_maps),
        ] {
            for (i, region) in regions.iter().enumerate() {
                if region.size == 0 {
                    return Err(RuntimeError::param_invalid(format!("{label} region {i} is empty")));
                }
                check_range(region.logical_addr, region.size, || format!("{label} region {i}"))?;
            }
        }
        for (role, tensors) in [("input", &self.inputs), ("output", &self.outputs)] {
            for (i, tensor) in tensors.iter().enumerate() {
                if tensor.max_size() == 0 {
                    return Err(RuntimeError::param_invalid(format!("{role} {i} has zero size")));
                }
                check_range(tensor.logical_addr, tensor.max_size(), || format!("{role} {i}"))?;
                if let Some(descriptor) = tensor.shape_descriptor {
                    if !tensor.dynamic {
                        return Err(RuntimeError::param_invalid(format!(
                            "{role} {i} has a shape descriptor but a static shape"
                        )));
                    }
                    check_range(descriptor, 8, || format!("{role} {i} shape descriptor"))?;
                }
            }
        }
        Ok(())
    }
}

/// `[addr, addr + len)` must fit in the logical address space.
fn check_range(addr: u64, len: u64, what: impl FnOnce() -> String) -> Result<()> {
    match addr.checked_add(len) {
        Some(_) => Ok(()),
        None => Err(RuntimeError::param_invalid(format!(
            "{} at {addr:#x} with {len} bytes runs past the end of the address space",
            what()
        ))),
    }
}
