//! Address-space memory for the simulated device
//!
//! Allocations live in two disjoint address ranges so placement can be told
//! apart from the address alone:
//!
//! ```text
//! 0x0000_1000_0000 ─┐
//!                   │  device regions (bump allocated, 64-byte aligned)
//! 0x7f00_0000_0000 ─┤
//!                   │  host regions (device-visible host memory)
//! ```
//!
//! Every access is resolved to `(region, offset)` and bounds-checked against
//! that single region; accesses never straddle two allocations.

use crate::error::{DriverError, Result};
use crate::types::MemPlacement;
use std::collections::BTreeMap;

const DEVICE_BASE: u64 = 0x0000_1000_0000;
const HOST_BASE: u64 = 0x7f00_0000_0000;

/// Allocation alignment in bytes
pub const ALIGNMENT: u64 = 64;

#[derive(Debug)]
struct Region {
    data: Vec<u8>,
    placement: MemPlacement,
}

/// Bump-allocated regions keyed by base address
#[derive(Debug)]
pub struct SimMemory {
    regions: BTreeMap<u64, Region>,
    next_device: u64,
    next_host: u64,
    device_capacity: usize,
    device_used: usize,
}

impl SimMemory {
    /// Create memory with a device capacity limit in bytes
    pub fn new(device_capacity: usize) -> Self {
        Self {
            regions: BTreeMap::new(),
            next_device: DEVICE_BASE,
            next_host: HOST_BASE,
            device_capacity,
            device_used: 0,
        }
    }

    /// Device bytes still available
    pub fn device_available(&self) -> usize {
        self.device_capacity.saturating_sub(self.device_used)
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.regions.len()
    }

    /// Change the device capacity limit
    pub fn set_device_capacity(&mut self, capacity: usize) {
        self.device_capacity = capacity;
    }

    /// Allocate a zeroed region
    pub fn allocate(&mut self, size: usize, placement: MemPlacement) -> Result<u64> {
        let size = size.max(1);
        if placement == MemPlacement::Device && size > self.device_available() {
            return Err(DriverError::OutOfMemory {
                requested: size,
                available: self.device_available(),
            });
        }

        let cursor = match placement {
            MemPlacement::Device => &mut self.next_device,
            MemPlacement::Host => &mut self.next_host,
        };
        let base = *cursor;
        *cursor = align_up(base + size as u64, ALIGNMENT);

        if placement == MemPlacement::Device {
            self.device_used += size;
        }
        self.regions.insert(
            base,
            Region {
                data: vec![0; size],
                placement,
            },
        );
        Ok(base)
    }

    /// Free a region by its exact base address
    pub fn free(&mut self, base: u64) -> Result<()> {
        let region = self.regions.remove(&base).ok_or(DriverError::InvalidAddress(base))?;
        if region.placement == MemPlacement::Device {
            self.device_used -= region.data.len();
        }
        Ok(())
    }

    /// Placement of the region containing `addr`
    pub fn placement_of(&self, addr: u64) -> Result<MemPlacement> {
        let (_, region) = self.region_containing(addr)?;
        Ok(region.placement)
    }

    /// Load `dest.len()` bytes starting at `addr`
    pub fn load_bytes(&self, addr: u64, dest: &mut [u8]) -> Result<()> {
        let (base, region) = self.region_containing(addr)?;
        let offset = (addr - base) as usize;
        check_bounds(addr, offset, dest.len(), region.data.len())?;
        dest.copy_from_slice(&region.data[offset..offset + dest.len()]);
        Ok(())
    }

    /// Store `src` starting at `addr`
    pub fn store_bytes(&mut self, addr: u64, src: &[u8]) -> Result<()> {
        let (base, len) = {
            let (base, region) = self.region_containing(addr)?;
            (base, region.data.len())
        };
        let offset = (addr - base) as usize;
        check_bounds(addr, offset, src.len(), len)?;
        if let Some(region) = self.regions.get_mut(&base) {
            region.data[offset..offset + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    /// Load `count` u64 values starting at `addr`
    pub fn load_u64s(&self, addr: u64, count: usize) -> Result<Vec<u64>> {
        let len = count.checked_mul(8).ok_or(DriverError::OutOfBounds {
            addr,
            len: usize::MAX,
            region_size: 0,
        })?;
        self.check_range(addr, len)?;
        let mut bytes = vec![0u8; len];
        self.load_bytes(addr, &mut bytes)?;
        Ok(bytes.chunks_exact(8).map(bytemuck::pod_read_unaligned::<u64>).collect())
    }

    /// Copy between two regions (possibly the same one)
    pub fn copy_within(&mut self, dst: u64, src: u64, len: usize) -> Result<()> {
        self.check_range(src, len)?;
        self.check_range(dst, len)?;
        let mut staging = vec![0u8; len];
        self.load_bytes(src, &mut staging)?;
        self.store_bytes(dst, &staging)
    }

    /// `[addr, addr + len)` lies inside one region
    fn check_range(&self, addr: u64, len: usize) -> Result<()> {
        let (base, region) = self.region_containing(addr)?;
        check_bounds(addr, (addr - base) as usize, len, region.data.len())
    }

    fn region_containing(&self, addr: u64) -> Result<(u64, &Region)> {
        let (base, region) = self
            .regions
            .range(..=addr)
            .next_back()
            .ok_or(DriverError::InvalidAddress(addr))?;
        // One past the end is still "inside" for zero-length accesses.
        if addr - *base > region.data.len() as u64 {
            return Err(DriverError::InvalidAddress(addr));
        }
        Ok((*base, region))
    }
}

fn check_bounds(addr: u64, offset: usize, len: usize, region_size: usize) -> Result<()> {
    if offset.checked_add(len).map_or(true, |end| end > region_size) {
        return Err(DriverError::OutOfBounds { addr, len, region_size });
    }
    Ok(())
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut mem = SimMemory::new(1 << 20);
        let a = mem.allocate(10, MemPlacement::Device).unwrap();
        let b = mem.allocate(10, MemPlacement::Device).unwrap();
        assert_eq!(a % ALIGNMENT, 0);
        assert_eq!(b % ALIGNMENT, 0);
        assert!(b >= a + 10);
        let h = mem.allocate(10, MemPlacement::Host).unwrap();
        assert_eq!(mem.placement_of(h).unwrap(), MemPlacement::Host);
        assert_eq!(mem.placement_of(a + 5).unwrap(), MemPlacement::Device);
    }

    #[test]
    fn load_store_roundtrip_at_offset() {
        let mut mem = SimMemory::new(1 << 20);
        let base = mem.allocate(32, MemPlacement::Device).unwrap();
        mem.store_bytes(base + 4, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 5];
        mem.load_bytes(base + 3, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3, 0]);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut mem = SimMemory::new(1 << 20);
        let base = mem.allocate(16, MemPlacement::Device).unwrap();
        let err = mem.store_bytes(base + 12, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, DriverError::OutOfBounds { region_size: 16, .. }));
        assert!(matches!(mem.load_bytes(0x10, &mut [0u8; 1]), Err(DriverError::InvalidAddress(_))));
    }

    #[test]
    fn capacity_limit_reports_out_of_memory() {
        let mut mem = SimMemory::new(100);
        mem.allocate(64, MemPlacement::Device).unwrap();
        let err = mem.allocate(64, MemPlacement::Device).unwrap_err();
        assert!(err.is_out_of_memory());
        // Host memory does not count against the device budget.
        mem.allocate(4096, MemPlacement::Host).unwrap();
    }

    #[test]
    fn free_returns_capacity() {
        let mut mem = SimMemory::new(128);
        let a = mem.allocate(128, MemPlacement::Device).unwrap();
        assert_eq!(mem.device_available(), 0);
        mem.free(a).unwrap();
        assert_eq!(mem.device_available(), 128);
        assert!(mem.free(a).is_err());
    }

    #[test]
    fn huge_copy_length_is_out_of_bounds() {
        let mut mem = SimMemory::new(1 << 10);
        let src = mem.allocate(16, MemPlacement::Device).unwrap();
        let dst = mem.allocate(16, MemPlacement::Device).unwrap();
        let err = mem.copy_within(dst, src, usize::MAX - 8).unwrap_err();
        assert!(matches!(err, DriverError::OutOfBounds { region_size: 16, .. }));
        let err = mem.copy_within(dst + 8, src, 16).unwrap_err();
        assert!(matches!(err, DriverError::OutOfBounds { .. }));
        assert!(mem.load_u64s(src, usize::MAX / 4).is_err());
    }

    #[test]
    fn u64_loads_use_native_layout() {
        let mut mem = SimMemory::new(1 << 10);
        let base = mem.allocate(24, MemPlacement::Device).unwrap();
        let values = [7u64, 0xdead_beef, u64::MAX];
        mem.store_bytes(base, bytemuck::cast_slice(&values)).unwrap();
        assert_eq!(mem.load_u64s(base, 3).unwrap(), values.to_vec());
    }
}
