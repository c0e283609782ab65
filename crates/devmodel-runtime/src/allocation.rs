//! Logical allocation table and active base address map
//!
//! The compiler addresses everything in a logical address space. At load the
//! table carves that space into allocations with dense ids:
//!
//! ```text
//! id:   0 .. F-1      F .. X-1        X .. I-1    I .. O-1     O (= N-1)
//!       FeatureMap    FixedFeatureMap Input       Output       Absolute
//! ```
//!
//! Physical addresses never live in the table. Every run resolves
//! `logical -> (id, offset)` once and reads the id's current base from the
//! [`ActiveBaseAddressMap`]. The Absolute sentinel covers the whole space
//! with base 0, so addresses outside every allocation pass through
//! unchanged.

use crate::error::{Result, RuntimeError};
use crate::options::ModelOptions;
use crate::program::CompiledProgram;
use crate::zero_copy::CopyOnlyRegistry;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Dense index into the allocation table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AllocationId(pub u32);

impl AllocationId {
    /// Never assigned; reaching the refresh path with it is a bug
    pub const INVALID: AllocationId = AllocationId(u32::MAX);

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AllocationKind {
    FeatureMap,
    FixedFeatureMap,
    Input,
    Output,
    Absolute,
}

/// One logical region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogicalAllocation {
    pub id: AllocationId,
    pub logical_addr: u64,
    pub size: u64,
    pub kind: AllocationKind,
    /// Region, input or output index within its kind
    pub role_index: usize,
}

impl LogicalAllocation {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.logical_addr && addr - self.logical_addr < self.size
    }

    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        self.contains(addr) && (addr - self.logical_addr).saturating_add(len) <= self.size
    }

    pub fn overlaps(&self, addr: u64, len: u64) -> bool {
        addr < self.logical_addr.saturating_add(self.size) && self.logical_addr < addr.saturating_add(len)
    }
}

/// Tensor stored inside another allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CopyInfo {
    pub allocation_id: AllocationId,
    pub byte_offset: u64,
    pub size: u64,
}

/// How a model input or output reaches its task arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IoBinding {
    /// Caller buffer bound directly
    ZeroCopy { id: AllocationId },
    /// Bound directly when device-placed; host-placed buffers are copied
    /// into a host staging region first
    HostCopy { id: AllocationId },
    /// Data copied to or from a region of another allocation
    Copy(CopyInfo),
}

impl IoBinding {
    pub fn allocation_id(&self) -> AllocationId {
        match self {
            Self::ZeroCopy { id } | Self::HostCopy { id } => *id,
            Self::Copy(info) => info.allocation_id,
        }
    }
}

/// Flat registry of logical regions; immutable once sealed
#[derive(Debug, Clone, Default)]
pub struct MemAllocationTable {
    entries: Vec<LogicalAllocation>,
    sealed: bool,
}

/// Output of [`MemAllocationTable::build`]
#[derive(Debug, Clone)]
pub struct LayoutPlan {
    pub table: MemAllocationTable,
    pub inputs: Vec<IoBinding>,
    pub outputs: Vec<IoBinding>,
    /// Every `Copy` binding, inputs first
    pub copy_infos: Vec<CopyInfo>,
    /// Input and output allocations that need runtime-owned device staging
    pub staged: Vec<AllocationId>,
}

impl MemAllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table for `program` in fixed kind order and bind every
    /// input and output.
    ///
    /// CopyOnly tensors that fall inside an existing allocation become
    /// [`CopyInfo`] records instead of getting their own id.
    pub fn build(program: &CompiledProgram, registry: &CopyOnlyRegistry, options: &ModelOptions) -> Result<LayoutPlan> {
        let mut table = Self::new();
        for (i, region) in program.layout.feature_maps.iter().enumerate() {
            table.register(AllocationKind::FeatureMap, region.logical_addr, region.size, i)?;
        }
        for (i, region) in program.layout.fixed_feature_maps.iter().enumerate() {
            table.register(AllocationKind::FixedFeatureMap, region.logical_addr, region.size, i)?;
        }

        let mut staged = Vec::new();
        let mut copy_infos = Vec::new();
        let mut bind = |table: &mut Self, kind: AllocationKind, index: usize, addr: u64, size: u64| -> Result<IoBinding> {
            let role = if kind == AllocationKind::Input { "input" } else { "output" };
            if registry.is_zero_copy(addr) {
                let id = table.register(kind, addr, size, index)?;
                if kind == AllocationKind::Input && options.is_host_input(index) {
                    return Ok(IoBinding::HostCopy { id });
                }
                return Ok(IoBinding::ZeroCopy { id });
            }

            let info = match table.containing(addr, size) {
                Some(host) => CopyInfo {
                    allocation_id: host.id,
                    byte_offset: addr - host.logical_addr,
                    size,
                },
                None => {
                    if let Some(other) = table.overlapping(addr, size) {
                        return Err(RuntimeError::unsupported(format!(
                            "{role} {index} at {addr:#x}+{size} partially overlaps allocation {}",
                            other.id
                        )));
                    }
                    let id = table.register(kind, addr, size, index)?;
                    staged.push(id);
                    CopyInfo {
                        allocation_id: id,
                        byte_offset: 0,
                        size,
                    }
                }
            };
            debug!(role, index, allocation_id = %info.allocation_id, offset = info.byte_offset, "copy-only binding");
            copy_infos.push(info);
            Ok(IoBinding::Copy(info))
        };

        let mut inputs = Vec::with_capacity(program.inputs.len());
        for (i, tensor) in program.inputs.iter().enumerate() {
            inputs.push(bind(&mut table, AllocationKind::Input, i, tensor.logical_addr, tensor.max_size())?);
        }
        let mut outputs = Vec::with_capacity(program.outputs.len());
        for (i, tensor) in program.outputs.iter().enumerate() {
            outputs.push(bind(&mut table, AllocationKind::Output, i, tensor.logical_addr, tensor.max_size())?);
        }
        table.seal()?;

        Ok(LayoutPlan {
            table,
            inputs,
            outputs,
            copy_infos,
            staged,
        })
    }

    /// Append an allocation
    ///
    /// # Errors
    ///
    /// `InternalError` when the table is sealed, the kind is `Absolute`
    /// (only [`Self::seal`] adds the sentinel), the size is zero, or the
    /// range overlaps an allocation of the same kind.
    pub fn register(&mut self, kind: AllocationKind, logical_addr: u64, size: u64, role_index: usize) -> Result<AllocationId> {
        if self.sealed {
            return Err(RuntimeError::internal("allocation table is sealed"));
        }
        if kind == AllocationKind::Absolute {
            return Err(RuntimeError::internal("the absolute sentinel is only added by seal"));
        }
        if size == 0 {
            return Err(RuntimeError::internal(format!(
                "{kind:?} allocation {role_index} at {logical_addr:#x} has zero size"
            )));
        }
        if let Some(other) = self
            .entries
            .iter()
            .find(|e| e.kind == kind && e.overlaps(logical_addr, size))
        {
            return Err(RuntimeError::internal(format!(
                "{kind:?} allocation at {logical_addr:#x}+{size} overlaps allocation {}",
                other.id
            )));
        }

        let id = AllocationId(self.entries.len() as u32);
        self.entries.push(LogicalAllocation {
            id,
            logical_addr,
            size,
            kind,
            role_index,
        });
        Ok(id)
    }

    /// Append the Absolute sentinel and freeze the table
    pub fn seal(&mut self) -> Result<AllocationId> {
        if self.sealed {
            return Err(RuntimeError::internal("allocation table sealed twice"));
        }
        let id = AllocationId(self.entries.len() as u32);
        self.entries.push(LogicalAllocation {
            id,
            logical_addr: 0,
            size: u64::MAX,
            kind: AllocationKind::Absolute,
            role_index: 0,
        });
        self.sealed = true;
        Ok(id)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// `logical_addr -> (id, offset)` over the non-sentinel allocations
    pub fn resolve(&self, logical_addr: u64) -> Result<(AllocationId, u64)> {
        self.regions()
            .find(|e| e.contains(logical_addr))
            .map(|e| (e.id, logical_addr - e.logical_addr))
            .ok_or(RuntimeError::AddressNotFound { addr: logical_addr })
    }

    /// Like [`Self::resolve`], falling back to the sentinel with the address
    /// itself as offset
    pub fn resolve_or_absolute(&self, logical_addr: u64) -> Result<(AllocationId, u64)> {
        match self.resolve(logical_addr) {
            Ok(found) => Ok(found),
            Err(_) => {
                let absolute = self
                    .absolute_id()
                    .ok_or_else(|| RuntimeError::internal("allocation table used before seal"))?;
                Ok((absolute, logical_addr))
            }
        }
    }

    pub fn get(&self, id: AllocationId) -> Option<&LogicalAllocation> {
        self.entries.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalAllocation> {
        self.entries.iter()
    }

    /// Id of the sentinel, once sealed
    pub fn absolute_id(&self) -> Option<AllocationId> {
        self.entries
            .last()
            .filter(|e| e.kind == AllocationKind::Absolute)
            .map(|e| e.id)
    }

    fn regions(&self) -> impl Iterator<Item = &LogicalAllocation> {
        self.entries.iter().filter(|e| e.kind != AllocationKind::Absolute)
    }

    fn containing(&self, addr: u64, len: u64) -> Option<&LogicalAllocation> {
        self.regions().find(|e| e.contains_range(addr, len))
    }

    fn overlapping(&self, addr: u64, len: u64) -> Option<&LogicalAllocation> {
        self.regions().find(|e| e.overlaps(addr, len))
    }
}

/// Current physical base of every allocation id, with change tracking
#[derive(Debug, Clone)]
pub struct ActiveBaseAddressMap {
    bases: Vec<Option<u64>>,
    changed: BTreeSet<AllocationId>,
}

impl ActiveBaseAddressMap {
    /// One unset slot per allocation; the sentinel starts at base 0
    pub fn new(table: &MemAllocationTable) -> Self {
        let mut bases = vec![None; table.len()];
        if let Some(absolute) = table.absolute_id() {
            bases[absolute.index()] = Some(0);
        }
        Self {
            bases,
            changed: BTreeSet::new(),
        }
    }

    /// Store `addr` as the base of `id`; returns whether it changed
    pub fn set_active_base(&mut self, id: AllocationId, addr: u64) -> Result<bool> {
        let slot = self
            .bases
            .get_mut(id.index())
            .ok_or_else(|| RuntimeError::internal(format!("allocation id {id} out of range")))?;
        if *slot == Some(addr) {
            return Ok(false);
        }
        *slot = Some(addr);
        self.changed.insert(id);
        Ok(true)
    }

    /// Current base of `id`
    pub fn active_base(&self, id: AllocationId) -> Result<u64> {
        self.bases
            .get(id.index())
            .copied()
            .flatten()
            .ok_or_else(|| RuntimeError::internal(format!("allocation {id} has no active base")))
    }

    /// Physical address of a logical one
    pub fn physical(&self, table: &MemAllocationTable, logical_addr: u64) -> Result<u64> {
        let (id, offset) = table.resolve_or_absolute(logical_addr)?;
        Ok(self.active_base(id)? + offset)
    }

    /// Ids whose base changed since the last [`Self::clear_changes`]
    pub fn changed_ids(&self) -> impl Iterator<Item = AllocationId> + '_ {
        self.changed.iter().copied()
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn clear_changes(&mut self) {
        self.changed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_table() -> MemAllocationTable {
        let mut table = MemAllocationTable::new();
        table.register(AllocationKind::FeatureMap, 0x1000, 0x100, 0).unwrap();
        table.register(AllocationKind::Input, 0x2000, 16, 0).unwrap();
        table.register(AllocationKind::Output, 0x3000, 16, 0).unwrap();
        table.seal().unwrap();
        table
    }

    #[test]
    fn ids_are_dense_with_sentinel_last() {
        let table = sealed_table();
        assert_eq!(table.len(), 4);
        for (i, entry) in table.iter().enumerate() {
            assert_eq!(entry.id.index(), i);
        }
        assert_eq!(table.absolute_id(), Some(AllocationId(3)));
        assert_eq!(table.get(AllocationId(3)).unwrap().size, u64::MAX);
    }

    #[test]
    fn register_rejects_same_kind_overlap_only() {
        let mut table = MemAllocationTable::new();
        table.register(AllocationKind::Input, 0x100, 0x40, 0).unwrap();
        let err = table.register(AllocationKind::Input, 0x120, 0x40, 1).unwrap_err();
        assert!(err.to_string().contains("overlaps allocation 0"));
        // A different kind may share the range.
        table.register(AllocationKind::Output, 0x120, 0x40, 0).unwrap();
    }

    #[test]
    fn sealed_table_rejects_registration() {
        let mut table = sealed_table();
        assert!(table.register(AllocationKind::Input, 0x9000, 8, 1).is_err());
        assert!(table.seal().is_err());
        assert!(MemAllocationTable::new()
            .register(AllocationKind::Absolute, 0, 8, 0)
            .is_err());
    }

    #[test]
    fn resolve_reports_offset_or_not_found() {
        let table = sealed_table();
        assert_eq!(table.resolve(0x1010).unwrap(), (AllocationId(0), 0x10));
        assert_eq!(table.resolve(0x3000).unwrap(), (AllocationId(2), 0));
        assert!(matches!(
            table.resolve(0x3010),
            Err(RuntimeError::AddressNotFound { addr: 0x3010 })
        ));
        assert_eq!(table.resolve_or_absolute(0x3010).unwrap(), (AllocationId(3), 0x3010));
    }

    #[test]
    fn set_active_base_reports_changes_once() {
        let table = sealed_table();
        let mut bases = ActiveBaseAddressMap::new(&table);
        assert!(bases.set_active_base(AllocationId(1), 0xa000).unwrap());
        assert!(!bases.set_active_base(AllocationId(1), 0xa000).unwrap());
        assert!(bases.set_active_base(AllocationId(1), 0xb000).unwrap());
        assert_eq!(bases.changed_ids().collect::<Vec<_>>(), vec![AllocationId(1)]);

        bases.clear_changes();
        assert!(!bases.has_changes());
        assert_eq!(bases.active_base(AllocationId(1)).unwrap(), 0xb000);
    }

    #[test]
    fn physical_relocates_through_the_base() {
        let table = sealed_table();
        let mut bases = ActiveBaseAddressMap::new(&table);
        bases.set_active_base(AllocationId(0), 0x7000_0000).unwrap();
        assert_eq!(bases.physical(&table, 0x1008).unwrap(), 0x7000_0008);
        // Outside every allocation the address passes through.
        assert_eq!(bases.physical(&table, 0x5555).unwrap(), 0x5555);
        // Unset bases are a bookkeeping error.
        assert!(bases.physical(&table, 0x2000).is_err());
    }

    #[test]
    fn invalid_id_is_internal_error() {
        let table = sealed_table();
        let mut bases = ActiveBaseAddressMap::new(&table);
        let err = bases.set_active_base(AllocationId::INVALID, 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InternalError);
    }
}
