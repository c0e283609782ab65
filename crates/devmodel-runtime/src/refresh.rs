//! Per-invocation refresh of allocation bases
//!
//! Each run scans the bindings that may have moved, in a fixed order:
//!
//! ```text
//! inputs ──► outputs ──► owned bases (feature maps, staging)
//!    │          │               │
//!    └──────────┴─── set_active_base(id, addr) ── changed? ──► raise policy
//! ```
//!
//! Host-placed inputs that are host-copy eligible are copied host-to-host
//! into a fixed staging region instead, which never touches argument bytes.
//! The strongest policy seen decides how much of the device argument table
//! gets rewritten before launch.

use crate::allocation::{ActiveBaseAddressMap, AllocationId, AllocationKind, IoBinding, MemAllocationTable};
use crate::error::{Result, RuntimeError};
use crate::zero_copy::TensorRole;
use devmodel_driver::{CopyDesc, CopyKind, Driver, MemPlacement};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Cost tier of a device argument update, cheapest first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RefreshPolicy {
    #[default]
    NoUpdate,
    UpdateHostInput,
    UpdateMinimal,
    UpdateAllOneTime,
}

impl RefreshPolicy {
    pub fn label(self) -> &'static str {
        match self {
            Self::NoUpdate => "no_update",
            Self::UpdateHostInput => "update_host_input",
            Self::UpdateMinimal => "update_minimal",
            Self::UpdateAllOneTime => "update_all_one_time",
        }
    }
}

/// Caller buffer with its resolved placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedBuffer {
    pub addr: u64,
    pub size: usize,
    pub placement: MemPlacement,
}

/// Everything one refresh pass reads or updates
pub struct RefreshContext<'a> {
    pub driver: &'a dyn Driver,
    pub table: &'a MemAllocationTable,
    pub bases: &'a mut ActiveBaseAddressMap,
    pub input_bindings: &'a [IoBinding],
    pub output_bindings: &'a [IoBinding],
    pub inputs: &'a [PlacedBuffer],
    pub outputs: &'a [PlacedBuffer],
    /// Runtime-owned bases: feature maps and device staging regions
    pub owned_bases: &'a [(AllocationId, u64)],
    /// Host staging region of each host-copy input
    pub host_staging: &'a BTreeMap<AllocationId, u64>,
}

/// Outcome of one refresh pass
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefreshReport {
    pub policy: RefreshPolicy,
    /// Policy required by each id whose base changed, in scan order
    pub contributions: Vec<(AllocationId, RefreshPolicy)>,
    pub host_copies: usize,
    pub skipped_frozen: usize,
}

/// Refresh state of one model instance
#[derive(Debug)]
pub struct RefreshEngine {
    model: String,
    first_refresh_done: bool,
    frozen_inputs: BTreeSet<usize>,
    host_zero_copy_reserved: bool,
}

impl RefreshEngine {
    pub fn new(model: impl Into<String>, frozen_inputs: BTreeSet<usize>, host_zero_copy_reserved: bool) -> Self {
        Self {
            model: model.into(),
            first_refresh_done: false,
            frozen_inputs,
            host_zero_copy_reserved,
        }
    }

    /// Policy an allocation requires when its base changes
    ///
    /// # Errors
    ///
    /// `InternalError` for the invalid id, an unknown id, or the Absolute
    /// sentinel, none of which may ever be relocated.
    pub fn policy_for(table: &MemAllocationTable, id: AllocationId) -> Result<RefreshPolicy> {
        if !id.is_valid() {
            return Err(RuntimeError::internal("invalid allocation id reached refresh"));
        }
        let allocation = table
            .get(id)
            .ok_or_else(|| RuntimeError::internal(format!("allocation {id} is not in the table")))?;
        if allocation.kind == AllocationKind::Absolute {
            return Err(RuntimeError::internal(format!(
                "absolute sentinel {id} cannot be relocated"
            )));
        }
        Ok(RefreshPolicy::UpdateMinimal)
    }

    /// Reject host-placed buffers that would be bound directly without
    /// reserved host memory. Runs before anything touches the device.
    pub fn validate_placements(
        &self,
        input_bindings: &[IoBinding],
        inputs: &[PlacedBuffer],
        output_bindings: &[IoBinding],
        outputs: &[PlacedBuffer],
    ) -> Result<()> {
        if self.host_zero_copy_reserved {
            return Ok(());
        }
        let groups = [
            (TensorRole::Input, input_bindings, inputs),
            (TensorRole::Output, output_bindings, outputs),
        ];
        for (role, bindings, buffers) in groups {
            for (index, (binding, buffer)) in bindings.iter().zip(buffers).enumerate() {
                if matches!(binding, IoBinding::ZeroCopy { .. }) && buffer.placement == MemPlacement::Host {
                    return Err(RuntimeError::unsupported(format!(
                        "{} {index} is host-placed but no host memory is reserved for zero-copy binding",
                        role.label()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Scan bindings, move bases, and pick the policy for this run
    ///
    /// The first refresh of an instance always returns `UpdateAllOneTime`.
    pub fn refresh(&mut self, ctx: RefreshContext<'_>) -> Result<RefreshReport> {
        let mut scan = Scan::default();

        for (index, (binding, buffer)) in ctx.input_bindings.iter().zip(ctx.inputs).enumerate() {
            if self.first_refresh_done && self.frozen_inputs.contains(&index) {
                scan.report.skipped_frozen += 1;
                continue;
            }
            match binding {
                IoBinding::HostCopy { id } if buffer.placement == MemPlacement::Host => {
                    let staging = *ctx.host_staging.get(id).ok_or_else(|| {
                        RuntimeError::internal(format!("input {index}: no host staging for allocation {id}"))
                    })?;
                    ctx.driver
                        .memcpy(CopyDesc::new(staging, buffer.addr, buffer.size, CopyKind::HostToHost))?;
                    scan.report.host_copies += 1;
                    scan.raise(RefreshPolicy::UpdateHostInput);
                    scan.set_base(&mut *ctx.bases, ctx.table, *id, staging)?;
                }
                IoBinding::HostCopy { id } | IoBinding::ZeroCopy { id } => {
                    scan.set_base(&mut *ctx.bases, ctx.table, *id, buffer.addr)?;
                }
                IoBinding::Copy(_) => {}
            }
        }

        for (binding, buffer) in ctx.output_bindings.iter().zip(ctx.outputs) {
            if let IoBinding::ZeroCopy { id } | IoBinding::HostCopy { id } = binding {
                scan.set_base(&mut *ctx.bases, ctx.table, *id, buffer.addr)?;
            }
        }

        for &(id, base) in ctx.owned_bases {
            scan.set_base(&mut *ctx.bases, ctx.table, id, base)?;
        }
        // Changes made outside the scan (feature-map updates, a failed
        // previous run) still need their slots rewritten.
        let pending: Vec<AllocationId> = ctx.bases.changed_ids().collect();
        for id in pending {
            scan.contribute(ctx.table, id)?;
        }

        if !self.first_refresh_done {
            scan.raise(RefreshPolicy::UpdateAllOneTime);
        }

        debug!(
            model = self.model.as_str(),
            policy = scan.report.policy.label(),
            changed = scan.report.contributions.len(),
            host_copies = scan.report.host_copies,
            "refresh_scanned"
        );
        Ok(scan.report)
    }

    /// Mark the refresh as applied to the device
    pub fn commit(&mut self, bases: &mut ActiveBaseAddressMap) {
        self.first_refresh_done = true;
        bases.clear_changes();
    }

    /// Whether the next refresh will be the instance's first
    pub fn is_first_refresh(&self) -> bool {
        !self.first_refresh_done
    }
}

#[derive(Default)]
struct Scan {
    report: RefreshReport,
    seen: BTreeSet<AllocationId>,
}

impl Scan {
    fn raise(&mut self, policy: RefreshPolicy) {
        self.report.policy = self.report.policy.max(policy);
    }

    fn set_base(
        &mut self,
        bases: &mut ActiveBaseAddressMap,
        table: &MemAllocationTable,
        id: AllocationId,
        addr: u64,
    ) -> Result<()> {
        // Validates the id before anything is written.
        RefreshEngine::policy_for(table, id)?;
        if bases.set_active_base(id, addr)? {
            trace!(allocation_id = %id, addr = format_args!("{addr:#x}"), "active base changed");
            self.contribute(table, id)?;
        }
        Ok(())
    }

    fn contribute(&mut self, table: &MemAllocationTable, id: AllocationId) -> Result<()> {
        if self.seen.insert(id) {
            let policy = RefreshEngine::policy_for(table, id)?;
            self.report.contributions.push((id, policy));
            self.raise(policy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmodel_driver::SimDevice;

    struct Fixture {
        device: SimDevice,
        table: MemAllocationTable,
        bases: ActiveBaseAddressMap,
        bindings: Vec<IoBinding>,
        staging: BTreeMap<AllocationId, u64>,
    }

    /// Two inputs (ids 0, 1) and the sentinel (id 2)
    fn fixture(input_1: IoBinding) -> Fixture {
        let device = SimDevice::new();
        let mut table = MemAllocationTable::new();
        table.register(AllocationKind::Input, 0x1000, 16, 0).unwrap();
        table.register(AllocationKind::Input, 0x2000, 32, 1).unwrap();
        table.seal().unwrap();
        let bases = ActiveBaseAddressMap::new(&table);
        let mut staging = BTreeMap::new();
        if let IoBinding::HostCopy { id } = input_1 {
            staging.insert(id, device.malloc(32, MemPlacement::Host).unwrap());
        }
        Fixture {
            device,
            table,
            bases,
            bindings: vec![IoBinding::ZeroCopy { id: AllocationId(0) }, input_1],
            staging,
        }
    }

    fn run(engine: &mut RefreshEngine, fx: &mut Fixture, inputs: &[PlacedBuffer]) -> Result<RefreshReport> {
        let report = engine.refresh(RefreshContext {
            driver: &fx.device,
            table: &fx.table,
            bases: &mut fx.bases,
            input_bindings: &fx.bindings,
            output_bindings: &[],
            inputs,
            outputs: &[],
            owned_bases: &[],
            host_staging: &fx.staging,
        })?;
        engine.commit(&mut fx.bases);
        Ok(report)
    }

    fn device_buffer(fx: &Fixture, size: usize) -> PlacedBuffer {
        PlacedBuffer {
            addr: fx.device.malloc(size, MemPlacement::Device).unwrap(),
            size,
            placement: MemPlacement::Device,
        }
    }

    #[test]
    fn first_refresh_is_full_then_idempotent() {
        let mut fx = fixture(IoBinding::ZeroCopy { id: AllocationId(1) });
        let mut engine = RefreshEngine::new("m", BTreeSet::new(), false);
        let inputs = [device_buffer(&fx, 16), device_buffer(&fx, 32)];

        let first = run(&mut engine, &mut fx, &inputs).unwrap();
        assert_eq!(first.policy, RefreshPolicy::UpdateAllOneTime);
        assert_eq!(first.contributions.len(), 2);

        let second = run(&mut engine, &mut fx, &inputs).unwrap();
        assert_eq!(second.policy, RefreshPolicy::NoUpdate);
        assert!(second.contributions.is_empty());
    }

    #[test]
    fn moved_buffer_needs_minimal_update() {
        let mut fx = fixture(IoBinding::ZeroCopy { id: AllocationId(1) });
        let mut engine = RefreshEngine::new("m", BTreeSet::new(), false);
        let mut inputs = [device_buffer(&fx, 16), device_buffer(&fx, 32)];
        run(&mut engine, &mut fx, &inputs).unwrap();

        inputs[1] = device_buffer(&fx, 32);
        let report = run(&mut engine, &mut fx, &inputs).unwrap();
        assert_eq!(report.policy, RefreshPolicy::UpdateMinimal);
        assert_eq!(report.contributions, vec![(AllocationId(1), RefreshPolicy::UpdateMinimal)]);
    }

    #[test]
    fn frozen_inputs_are_skipped_after_first_refresh() {
        let mut fx = fixture(IoBinding::ZeroCopy { id: AllocationId(1) });
        let mut engine = RefreshEngine::new("m", BTreeSet::from([0]), false);
        let mut inputs = [device_buffer(&fx, 16), device_buffer(&fx, 32)];
        run(&mut engine, &mut fx, &inputs).unwrap();

        inputs[0] = device_buffer(&fx, 16);
        let report = run(&mut engine, &mut fx, &inputs).unwrap();
        assert_eq!(report.policy, RefreshPolicy::NoUpdate);
        assert_eq!(report.skipped_frozen, 1);
    }

    #[test]
    fn host_copy_input_stages_without_argument_rewrite() {
        let mut fx = fixture(IoBinding::HostCopy { id: AllocationId(1) });
        let mut engine = RefreshEngine::new("m", BTreeSet::new(), false);
        let host = fx.device.malloc(32, MemPlacement::Host).unwrap();
        fx.device.write(host, &[5u8; 32]).unwrap();
        let inputs = [
            device_buffer(&fx, 16),
            PlacedBuffer {
                addr: host,
                size: 32,
                placement: MemPlacement::Host,
            },
        ];

        run(&mut engine, &mut fx, &inputs).unwrap();
        let report = run(&mut engine, &mut fx, &inputs).unwrap();
        assert_eq!(report.policy, RefreshPolicy::UpdateHostInput);
        assert_eq!(report.host_copies, 1);
        assert!(report.contributions.is_empty());

        let staging = fx.staging[&AllocationId(1)];
        assert_eq!(fx.bases.active_base(AllocationId(1)).unwrap(), staging);
        let mut staged = [0u8; 32];
        fx.device.read(staging, &mut staged).unwrap();
        assert_eq!(staged, [5u8; 32]);
    }

    #[test]
    fn host_zero_copy_needs_reservation() {
        let fx = fixture(IoBinding::ZeroCopy { id: AllocationId(1) });
        let host = PlacedBuffer {
            addr: fx.device.malloc(32, MemPlacement::Host).unwrap(),
            size: 32,
            placement: MemPlacement::Host,
        };
        let inputs = [device_buffer(&fx, 16), host];

        let strict = RefreshEngine::new("m", BTreeSet::new(), false);
        let err = strict.validate_placements(&fx.bindings, &inputs, &[], &[]).unwrap_err();
        assert!(err.to_string().contains("input 1"));

        let reserved = RefreshEngine::new("m", BTreeSet::new(), true);
        reserved.validate_placements(&fx.bindings, &inputs, &[], &[]).unwrap();
    }

    #[test]
    fn sentinel_and_invalid_ids_fail_fast() {
        let fx = fixture(IoBinding::ZeroCopy { id: AllocationId(1) });
        let absolute = fx.table.absolute_id().unwrap();
        assert!(RefreshEngine::policy_for(&fx.table, absolute).is_err());
        assert!(RefreshEngine::policy_for(&fx.table, AllocationId::INVALID).is_err());
        assert_eq!(
            RefreshEngine::policy_for(&fx.table, AllocationId(0)).unwrap(),
            RefreshPolicy::UpdateMinimal
        );
    }

    #[test]
    fn policy_order_follows_cost() {
        assert!(RefreshPolicy::NoUpdate < RefreshPolicy::UpdateHostInput);
        assert!(RefreshPolicy::UpdateHostInput < RefreshPolicy::UpdateMinimal);
        assert!(RefreshPolicy::UpdateMinimal < RefreshPolicy::UpdateAllOneTime);
    }
}
