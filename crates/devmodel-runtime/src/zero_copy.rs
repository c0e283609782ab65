//! Zero-copy eligibility of model inputs and outputs
//!
//! A tensor may be bound straight to its task arguments unless one of these
//! holds, in which case it is CopyOnly and data moves through a [`CopyInfo`]
//! region:
//!
//! - no task argument points into it
//! - several outputs share its address (write fan-out)
//! - it overlaps a feature map or another tensor
//! - reusable-memory mode is on and the output needs host-resident staging
//!
//! Classification runs once at load over the compiled task list. The result
//! is a plain value, read-only afterwards and shared without locking.

use crate::allocation::{CopyInfo, MemAllocationTable};
use crate::error::{Result, RuntimeError};
use crate::options::ModelOptions;
use crate::program::{CompiledProgram, TaskArg, TensorDesc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Why a tensor cannot be bound zero-copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CopyOnlyReason {
    NoConsumer,
    FanOut,
    Aliased,
    HostStaging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TensorRole {
    Input,
    Output,
}

impl TensorRole {
    pub fn label(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// One argument slot fed by a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArgSlotRef {
    /// Flat index into the model's argument table
    pub slot: usize,
    /// Byte offset of the argument's address within the tensor
    pub offset: u64,
}

/// Argument slots fed by one input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZeroCopyOffset {
    pub role: TensorRole,
    pub index: usize,
    pub logical_addr: u64,
    pub slots: Vec<ArgSlotRef>,
}

/// Logical addresses that must go through a copy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopyOnlyRegistry {
    entries: BTreeMap<u64, CopyOnlyReason>,
}

impl CopyOnlyRegistry {
    pub fn is_zero_copy(&self, addr: u64) -> bool {
        !self.entries.contains_key(&addr)
    }

    pub fn is_copy_only(&self, addr: u64) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn reason(&self, addr: u64) -> Option<CopyOnlyReason> {
        self.entries.get(&addr).copied()
    }

    /// CopyOnly addresses in ascending order
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn mark(&mut self, addr: u64, reason: CopyOnlyReason) {
        // First reason wins so the result is independent of later checks.
        self.entries.entry(addr).or_insert(reason);
    }
}

/// Result of [`ZeroCopyClassifier::classify_all`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub registry: CopyOnlyRegistry,
    /// Inputs first, then outputs
    pub offsets: Vec<ZeroCopyOffset>,
}

pub struct ZeroCopyClassifier<'a> {
    program: &'a CompiledProgram,
    reuse_memory: bool,
}

impl<'a> ZeroCopyClassifier<'a> {
    pub fn new(program: &'a CompiledProgram, options: &ModelOptions) -> Self {
        Self {
            program,
            reuse_memory: options.reuse_memory,
        }
    }

    /// Classify every input and output
    ///
    /// Deterministic: the same program always yields the same registry.
    pub fn classify_all(&self) -> Classification {
        let offsets = self.collect_offsets();
        let mut registry = CopyOnlyRegistry::default();

        let tensors = self.tensors().collect::<Vec<_>>();
        for (position, (role, index, tensor)) in tensors.iter().enumerate() {
            if let Some(reason) = self.reason_for(*role, tensor, position, &tensors, &offsets[position]) {
                debug!(
                    role = role.label(),
                    index,
                    addr = format_args!("{:#x}", tensor.logical_addr),
                    ?reason,
                    "tensor is copy-only"
                );
                registry.mark(tensor.logical_addr, reason);
            }
        }
        Classification { registry, offsets }
    }

    fn tensors(&self) -> impl Iterator<Item = (TensorRole, usize, &'a TensorDesc)> {
        let inputs = self.program.inputs.iter().enumerate().map(|(i, t)| (TensorRole::Input, i, t));
        let outputs = self.program.outputs.iter().enumerate().map(|(i, t)| (TensorRole::Output, i, t));
        inputs.chain(outputs)
    }

    fn reason_for(
        &self,
        role: TensorRole,
        tensor: &TensorDesc,
        position: usize,
        tensors: &[(TensorRole, usize, &TensorDesc)],
        offsets: &ZeroCopyOffset,
    ) -> Option<CopyOnlyReason> {
        let layout = &self.program.layout;
        let size = tensor.max_size();
        let in_feature_map = layout
            .feature_maps
            .iter()
            .chain(&layout.fixed_feature_maps)
            .any(|r| r.logical_addr < tensor.end() && tensor.logical_addr < r.end());
        if in_feature_map {
            return Some(CopyOnlyReason::Aliased);
        }

        let others = tensors
            .iter()
            .enumerate()
            .filter(|(p, _)| *p != position)
            .map(|(_, other)| other);
        let mut aliased = false;
        for (other_role, _, other) in others {
            if role == TensorRole::Output && *other_role == TensorRole::Output && other.logical_addr == tensor.logical_addr {
                return Some(CopyOnlyReason::FanOut);
            }
            aliased |= other.overlaps(tensor.logical_addr, size);
        }
        if aliased {
            return Some(CopyOnlyReason::Aliased);
        }

        if role == TensorRole::Output && self.reuse_memory && tensor.host_staging {
            return Some(CopyOnlyReason::HostStaging);
        }
        if offsets.slots.is_empty() {
            return Some(CopyOnlyReason::NoConsumer);
        }
        None
    }

    fn collect_offsets(&self) -> Vec<ZeroCopyOffset> {
        let mut offsets: Vec<ZeroCopyOffset> = self
            .tensors()
            .map(|(role, index, tensor)| ZeroCopyOffset {
                role,
                index,
                logical_addr: tensor.logical_addr,
                slots: Vec::new(),
            })
            .collect();
        let tensors = self.tensors().collect::<Vec<_>>();

        let args = self.program.tasks.iter().flat_map(|task| task.args.iter());
        for (slot, arg) in args.enumerate() {
            let TaskArg::Addr(addr) = *arg else { continue };
            for (position, (_, _, tensor)) in tensors.iter().enumerate() {
                if tensor.contains(addr) {
                    offsets[position].slots.push(ArgSlotRef {
                        slot,
                        offset: addr - tensor.logical_addr,
                    });
                }
            }
        }
        offsets
    }
}

/// Check that every CopyOnly address is backed by a [`CopyInfo`] or an
/// allocation
///
/// # Errors
///
/// `InternalError` listing the unaccounted addresses.
pub fn audit_copy_only(registry: &CopyOnlyRegistry, table: &MemAllocationTable, copy_infos: &[CopyInfo]) -> Result<()> {
    let in_copy_info = |addr: u64| {
        copy_infos.iter().any(|info| {
            table
                .get(info.allocation_id)
                .is_some_and(|a| a.logical_addr + info.byte_offset == addr)
        })
    };
    let unaccounted: Vec<String> = registry
        .addresses()
        .filter(|addr| !in_copy_info(*addr) && table.resolve(*addr).is_err())
        .map(|addr| format!("{addr:#x}"))
        .collect();

    if unaccounted.is_empty() {
        Ok(())
    } else {
        Err(RuntimeError::internal(format!(
            "copy-only addresses not backed by any allocation: {}",
            unaccounted.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationId, AllocationKind};
    use crate::program::{MemoryLayout, RegionDesc, TaskDef, TaskKindDef};

    fn tensor(addr: u64, size: u64) -> TensorDesc {
        TensorDesc {
            logical_addr: addr,
            size,
            aligned_size: None,
            dynamic: false,
            host_staging: false,
            shape_descriptor: None,
        }
    }

    fn program(inputs: Vec<TensorDesc>, outputs: Vec<TensorDesc>, args: Vec<TaskArg>) -> CompiledProgram {
        CompiledProgram {
            name: "classify".into(),
            tasks: vec![TaskDef {
                task_id: 0,
                stream_id: 0,
                kind: TaskKindDef::Kernel { name: "copy".into() },
                args,
            }],
            layout: MemoryLayout {
                feature_maps: vec![RegionDesc {
                    logical_addr: 0x10_0000,
                    size: 0x100,
                }],
                fixed_feature_maps: vec![],
            },
            inputs,
            outputs,
            stream_count: 1,
            event_count: 0,
            options: Default::default(),
        }
    }

    #[test]
    fn directly_consumed_tensors_are_zero_copy() {
        let p = program(
            vec![tensor(0x1000, 16)],
            vec![tensor(0x2000, 16)],
            vec![TaskArg::Addr(0x1000), TaskArg::Addr(0x2008), TaskArg::Value(16)],
        );
        let result = ZeroCopyClassifier::new(&p, &ModelOptions::default()).classify_all();
        assert!(result.registry.is_empty());
        assert_eq!(result.offsets[1].slots, vec![ArgSlotRef { slot: 1, offset: 8 }]);
    }

    #[test]
    fn fan_out_feature_map_and_no_consumer_are_copy_only() {
        let p = program(
            vec![tensor(0x10_0010, 16), tensor(0x5000, 8)],
            vec![tensor(0x2000, 16), tensor(0x2000, 16)],
            vec![TaskArg::Addr(0x10_0010), TaskArg::Addr(0x2000)],
        );
        let registry = ZeroCopyClassifier::new(&p, &ModelOptions::default()).classify_all().registry;
        assert_eq!(registry.reason(0x10_0010), Some(CopyOnlyReason::Aliased));
        assert_eq!(registry.reason(0x5000), Some(CopyOnlyReason::NoConsumer));
        assert_eq!(registry.reason(0x2000), Some(CopyOnlyReason::FanOut));
        assert_eq!(registry.addresses().collect::<Vec<_>>(), vec![0x2000, 0x5000, 0x10_0010]);
    }

    #[test]
    fn partial_overlap_is_aliasing() {
        let p = program(
            vec![tensor(0x1000, 32)],
            vec![tensor(0x1010, 32)],
            vec![TaskArg::Addr(0x1000), TaskArg::Addr(0x1010)],
        );
        let registry = ZeroCopyClassifier::new(&p, &ModelOptions::default()).classify_all().registry;
        assert_eq!(registry.reason(0x1000), Some(CopyOnlyReason::Aliased));
        assert_eq!(registry.reason(0x1010), Some(CopyOnlyReason::Aliased));
    }

    #[test]
    fn host_staging_only_applies_when_reusing_memory() {
        let mut out = tensor(0x2000, 16);
        out.host_staging = true;
        let p = program(vec![], vec![out], vec![TaskArg::Addr(0x2000)]);

        let plain = ZeroCopyClassifier::new(&p, &ModelOptions::default()).classify_all();
        assert!(plain.registry.is_zero_copy(0x2000));

        let reuse = ModelOptions {
            reuse_memory: true,
            ..Default::default()
        };
        let staged = ZeroCopyClassifier::new(&p, &reuse).classify_all();
        assert_eq!(staged.registry.reason(0x2000), Some(CopyOnlyReason::HostStaging));
    }

    #[test]
    fn audit_flags_unbacked_addresses() {
        let mut registry = CopyOnlyRegistry::default();
        registry.mark(0x2000, CopyOnlyReason::FanOut);
        registry.mark(0x9000, CopyOnlyReason::NoConsumer);

        let mut table = MemAllocationTable::new();
        table.register(AllocationKind::Output, 0x2000, 16, 0).unwrap();
        table.seal().unwrap();
        let infos = [CopyInfo {
            allocation_id: AllocationId(0),
            byte_offset: 0,
            size: 16,
        }];

        let err = audit_copy_only(&registry, &table, &infos).unwrap_err();
        assert!(err.to_string().contains("0x9000"));
        assert!(!err.to_string().contains("0x2000"));
    }
}
