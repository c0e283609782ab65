//! Device argument table
//!
//! Every task argument is one `u64` slot in a single device buffer; a task's
//! arguments are a contiguous block of it. Address arguments are stored as
//! `(allocation id, offset)` and turned into physical addresses from the
//! [`ActiveBaseAddressMap`] whenever the table is refreshed:
//!
//! ```text
//! slot:    0        1        2        3       4 ...
//!        [in0+0 ] [in1+0 ] [out0+0] [16    ] [fm+64 ] ...
//!        └──────── task 0 ─────────────────┘ └ task 1 ...
//! ```
//!
//! A host mirror holds the last values written, so minimal updates only send
//! the slots owned by allocations that moved, coalesced into contiguous runs.

use crate::allocation::{ActiveBaseAddressMap, AllocationId, MemAllocationTable};
use crate::error::{Result, RuntimeError};
use crate::program::{CompiledProgram, TaskArg};
use crate::refresh::RefreshPolicy;
use devmodel_driver::{Driver, MemPlacement, StreamHandle};
use serde::Serialize;
use tracing::trace;

const SLOT_BYTES: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSlot {
    Bound { id: AllocationId, offset: u64 },
    Value(u64),
}

/// `(first_slot, count)` of one task's arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArgBlockRef {
    pub first_slot: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArgsUpdateStats {
    pub policy: RefreshPolicy,
    pub slots_written: usize,
    /// Separate device writes submitted
    pub copies_issued: usize,
}

pub struct ArgsManager {
    slots: Vec<ArgSlot>,
    host: Vec<u64>,
    by_allocation: Vec<Vec<usize>>,
    blocks: Vec<ArgBlockRef>,
    table_addr: u64,
}

impl ArgsManager {
    /// Lay out the slots of every task and allocate the device table
    ///
    /// The device buffer is owned by the caller, see [`Self::table_addr`].
    pub fn new(driver: &dyn Driver, program: &CompiledProgram, table: &MemAllocationTable) -> Result<Self> {
        let mut slots = Vec::with_capacity(program.total_arg_slots());
        let mut blocks = Vec::with_capacity(program.tasks.len());
        let mut by_allocation = vec![Vec::new(); table.len()];

        for task in &program.tasks {
            blocks.push(ArgBlockRef {
                first_slot: slots.len(),
                count: task.args.len(),
            });
            for arg in &task.args {
                let slot = match *arg {
                    TaskArg::Addr(addr) => {
                        let (id, offset) = table.resolve_or_absolute(addr)?;
                        by_allocation[id.index()].push(slots.len());
                        ArgSlot::Bound { id, offset }
                    }
                    TaskArg::Value(value) => ArgSlot::Value(value),
                };
                slots.push(slot);
            }
        }

        let bytes = (slots.len() as u64 * SLOT_BYTES).max(SLOT_BYTES) as usize;
        let table_addr = driver.malloc(bytes, MemPlacement::Device)?;
        Ok(Self {
            host: vec![0; slots.len()],
            slots,
            by_allocation,
            blocks,
            table_addr,
        })
    }

    /// Bring the device table up to date for `policy`
    ///
    /// Writes are ordered on `stream` ahead of the launch.
    pub fn update_for_execute(
        &mut self,
        driver: &dyn Driver,
        stream: StreamHandle,
        policy: RefreshPolicy,
        bases: &ActiveBaseAddressMap,
    ) -> Result<ArgsUpdateStats> {
        let mut stats = ArgsUpdateStats {
            policy,
            ..Default::default()
        };
        let dirty: Vec<usize> = match policy {
            RefreshPolicy::NoUpdate | RefreshPolicy::UpdateHostInput => return Ok(stats),
            RefreshPolicy::UpdateAllOneTime => (0..self.slots.len()).collect(),
            RefreshPolicy::UpdateMinimal => {
                let mut dirty: Vec<usize> = bases
                    .changed_ids()
                    .filter_map(|id| self.by_allocation.get(id.index()))
                    .flatten()
                    .copied()
                    .collect();
                dirty.sort_unstable();
                dirty.dedup();
                dirty
            }
        };

        for &slot in &dirty {
            self.host[slot] = self.resolve_slot(slot, bases)?;
        }
        for run in contiguous_runs(&dirty) {
            let values = &self.host[run.clone()];
            let dst = self.table_addr + run.start as u64 * SLOT_BYTES;
            driver.write_async(stream, dst, bytemuck::cast_slice(values))?;
            trace!(first_slot = run.start, count = run.len(), "argument slots written");
            stats.copies_issued += 1;
        }
        stats.slots_written = dirty.len();
        Ok(stats)
    }

    /// Argument block of the task at `task_index` in compiled order
    pub fn task_block(&self, task_index: usize) -> Option<ArgBlockRef> {
        self.blocks.get(task_index).copied()
    }

    /// Device address of a block's first slot
    pub fn block_addr(&self, block: ArgBlockRef) -> u64 {
        self.table_addr + block.first_slot as u64 * SLOT_BYTES
    }

    /// Last value written for `slot`
    pub fn slot_value(&self, slot: usize) -> Option<u64> {
        self.host.get(slot).copied()
    }

    pub fn slot(&self, slot: usize) -> Option<ArgSlot> {
        self.slots.get(slot).copied()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slots holding addresses inside allocation `id`
    pub fn slots_for(&self, id: AllocationId) -> &[usize] {
        self.by_allocation.get(id.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Device buffer holding the table
    pub fn table_addr(&self) -> u64 {
        self.table_addr
    }

    fn resolve_slot(&self, slot: usize, bases: &ActiveBaseAddressMap) -> Result<u64> {
        match self.slots.get(slot) {
            Some(ArgSlot::Bound { id, offset }) => Ok(bases.active_base(*id)? + offset),
            Some(ArgSlot::Value(value)) => Ok(*value),
            None => Err(RuntimeError::internal(format!("argument slot {slot} out of range"))),
        }
    }
}

/// Split sorted, deduplicated indices into runs of consecutive values
fn contiguous_runs(sorted: &[usize]) -> Vec<std::ops::Range<usize>> {
    let mut runs: Vec<std::ops::Range<usize>> = Vec::new();
    for &index in sorted {
        match runs.last_mut() {
            Some(run) if run.end == index => run.end += 1,
            _ => runs.push(index..index + 1),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationKind;
    use crate::program::{TaskDef, TaskKindDef};
    use devmodel_driver::SimDevice;

    fn program() -> CompiledProgram {
        let task = |task_id, args| TaskDef {
            task_id,
            stream_id: 0,
            kind: TaskKindDef::Kernel { name: "copy".into() },
            args,
        };
        CompiledProgram {
            name: "args".into(),
            tasks: vec![
                task(0, vec![TaskArg::Addr(0x1000), TaskArg::Addr(0x2000), TaskArg::Value(16)]),
                task(1, vec![TaskArg::Addr(0x2008), TaskArg::Addr(0xdead_0000)]),
            ],
            layout: Default::default(),
            inputs: vec![],
            outputs: vec![],
            stream_count: 1,
            event_count: 0,
            options: Default::default(),
        }
    }

    fn setup() -> (SimDevice, MemAllocationTable, ActiveBaseAddressMap, ArgsManager) {
        let device = SimDevice::new();
        let mut table = MemAllocationTable::new();
        table.register(AllocationKind::Input, 0x1000, 16, 0).unwrap();
        table.register(AllocationKind::Output, 0x2000, 16, 0).unwrap();
        table.seal().unwrap();
        let mut bases = ActiveBaseAddressMap::new(&table);
        bases.set_active_base(AllocationId(0), 0xa000).unwrap();
        bases.set_active_base(AllocationId(1), 0xb000).unwrap();
        let args = ArgsManager::new(&device, &program(), &table).unwrap();
        (device, table, bases, args)
    }

    fn device_slots(device: &SimDevice, args: &ArgsManager) -> Vec<u64> {
        let mut bytes = vec![0u8; args.slot_count() * 8];
        device.read(args.table_addr(), &mut bytes).unwrap();
        bytes.chunks_exact(8).map(bytemuck::pod_read_unaligned::<u64>).collect()
    }

    #[test]
    fn blocks_and_slots_follow_task_order() {
        let (_device, _table, _bases, args) = setup();
        assert_eq!(args.slot_count(), 5);
        assert_eq!(args.task_block(1), Some(ArgBlockRef { first_slot: 3, count: 2 }));
        assert_eq!(args.block_addr(args.task_block(1).unwrap()), args.table_addr() + 24);
        assert_eq!(args.slots_for(AllocationId(1)), &[1, 3]);
        // Unknown addresses bind to the sentinel and pass through.
        assert_eq!(
            args.slot(4),
            Some(ArgSlot::Bound {
                id: AllocationId(2),
                offset: 0xdead_0000
            })
        );
    }

    #[test]
    fn full_update_writes_whole_table_once() {
        let (device, _table, bases, mut args) = setup();
        let stream = device.create_stream().unwrap();
        let stats = args
            .update_for_execute(&device, stream, RefreshPolicy::UpdateAllOneTime, &bases)
            .unwrap();
        assert_eq!(stats.slots_written, 5);
        assert_eq!(stats.copies_issued, 1);

        device.synchronize(stream, None).unwrap();
        assert_eq!(device_slots(&device, &args), vec![0xa000, 0xb000, 16, 0xb008, 0xdead_0000]);
    }

    #[test]
    fn minimal_update_touches_only_moved_allocations() {
        let (device, _table, mut bases, mut args) = setup();
        let stream = device.create_stream().unwrap();
        args.update_for_execute(&device, stream, RefreshPolicy::UpdateAllOneTime, &bases)
            .unwrap();
        bases.clear_changes();

        bases.set_active_base(AllocationId(1), 0xc000).unwrap();
        let stats = args
            .update_for_execute(&device, stream, RefreshPolicy::UpdateMinimal, &bases)
            .unwrap();
        // Slots 1 and 3 are not adjacent.
        assert_eq!(stats.slots_written, 2);
        assert_eq!(stats.copies_issued, 2);

        device.synchronize(stream, None).unwrap();
        assert_eq!(device_slots(&device, &args), vec![0xa000, 0xc000, 16, 0xc008, 0xdead_0000]);
        assert_eq!(args.slot_value(3), Some(0xc008));
    }

    #[test]
    fn no_update_and_host_input_write_nothing() {
        let (device, _table, bases, mut args) = setup();
        let stream = device.create_stream().unwrap();
        for policy in [RefreshPolicy::NoUpdate, RefreshPolicy::UpdateHostInput] {
            let stats = args.update_for_execute(&device, stream, policy, &bases).unwrap();
            assert_eq!(stats.slots_written, 0);
        }
        assert_eq!(device.stats().async_writes, 0);
    }

    #[test]
    fn runs_coalesce_adjacent_slots() {
        assert_eq!(contiguous_runs(&[0, 1, 2, 5, 7, 8]), vec![0..3, 5..6, 7..9]);
        assert!(contiguous_runs(&[]).is_empty());
    }
}
