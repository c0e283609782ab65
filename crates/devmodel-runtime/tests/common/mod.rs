//! Shared fixtures for the runtime integration tests

#![allow(dead_code)]

use devmodel_driver::{Driver, MemPlacement, SimDevice};
use devmodel_runtime::{
    CompiledProgram, DataBuffer, MemoryLayout, MemoryParams, ModelHandle, ModelOptions, RegionDesc, Runtime, TaskArg,
    TaskDef, TaskKindDef, TensorDesc,
};
use std::sync::Arc;

pub const FM_BASE: u64 = 0x10_0000;

pub fn init_tracing() {
    devmodel_tracing::init_test_tracing();
}

pub fn tensor(logical_addr: u64, size: u64) -> TensorDesc {
    TensorDesc {
        logical_addr,
        size,
        aligned_size: None,
        dynamic: false,
        host_staging: false,
        shape_descriptor: None,
    }
}

pub fn kernel(task_id: u32, name: &str, args: Vec<TaskArg>) -> TaskDef {
    TaskDef {
        task_id,
        stream_id: 0,
        kind: TaskKindDef::Kernel { name: name.into() },
        args,
    }
}

pub fn program(name: &str, inputs: Vec<TensorDesc>, outputs: Vec<TensorDesc>, tasks: Vec<TaskDef>) -> CompiledProgram {
    CompiledProgram {
        name: name.into(),
        tasks,
        layout: MemoryLayout::default(),
        inputs,
        outputs,
        stream_count: 1,
        event_count: 0,
        options: Default::default(),
    }
}

/// Same program with one feature-map region of `size` bytes at [`FM_BASE`]
pub fn with_feature_map(mut program: CompiledProgram, size: u64) -> CompiledProgram {
    program.layout.feature_maps.push(RegionDesc {
        logical_addr: FM_BASE,
        size,
    });
    program
}

/// Two inputs (16 B, 32 B) summed bytewise into one 16 B output
pub fn add_program() -> CompiledProgram {
    program(
        "add2",
        vec![tensor(0x1_0000, 16), tensor(0x2_0000, 32)],
        vec![tensor(0x3_0000, 16)],
        vec![kernel(
            0,
            "add",
            vec![
                TaskArg::Addr(0x1_0000),
                TaskArg::Addr(0x2_0000),
                TaskArg::Addr(0x3_0000),
                TaskArg::Value(16),
            ],
        )],
    )
}

/// One input copied to one output by a single kernel
pub fn copy_program(name: &str, size: u64) -> CompiledProgram {
    program(
        name,
        vec![tensor(0x1000, size)],
        vec![tensor(0x2000, size)],
        vec![kernel(
            0,
            "copy",
            vec![TaskArg::Addr(0x1000), TaskArg::Addr(0x2000), TaskArg::Value(size)],
        )],
    )
}

pub struct Harness {
    pub device: Arc<SimDevice>,
    pub runtime: Runtime,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let device = Arc::new(SimDevice::new());
        let runtime = Runtime::new(device.clone());
        Self { device, runtime }
    }

    pub fn load(&self, program: &CompiledProgram) -> ModelHandle {
        self.runtime
            .load_with_options(program, MemoryParams::default(), ModelOptions::default())
            .unwrap()
    }

    pub fn load_with(&self, program: &CompiledProgram, memory: MemoryParams, options: ModelOptions) -> ModelHandle {
        self.runtime.load_with_options(program, memory, options).unwrap()
    }

    /// Caller buffer initialised with `bytes`
    pub fn buffer(&self, bytes: &[u8], placement: MemPlacement) -> DataBuffer {
        let addr = self.device.malloc(bytes.len(), placement).unwrap();
        self.device.write(addr, bytes).unwrap();
        DataBuffer::new(addr, bytes.len())
    }

    pub fn device_buffer(&self, bytes: &[u8]) -> DataBuffer {
        self.buffer(bytes, MemPlacement::Device)
    }

    pub fn zeroed(&self, size: usize) -> DataBuffer {
        self.buffer(&vec![0; size], MemPlacement::Device)
    }

    pub fn read(&self, buffer: DataBuffer) -> Vec<u8> {
        let mut out = vec![0u8; buffer.size];
        self.device.read(buffer.addr, &mut out).unwrap();
        out
    }

    pub fn write(&self, buffer: DataBuffer, bytes: &[u8]) {
        self.device.write(buffer.addr, bytes).unwrap();
    }
}

pub fn bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

pub fn bytewise_sum(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y)).collect()
}
