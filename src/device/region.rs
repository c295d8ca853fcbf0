//! Region Table - device memory mapped on behalf of one handle
//!
//! Device-coherent memory handed to a client is recorded here together with
//! everything needed to free it. The table belongs to exactly one handle and
//! frees every region it holds when released or dropped, so a client that
//! goes away never leaks device memory.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use log::{debug, warn};

use crate::error::{DeviceError, Result};
use crate::types::{PhysAddr, RegionId, VirtAddr};

// ============================================================================
// Device Memory Allocator
// ============================================================================

/// Consistent (DMA-coherent) memory allocator of a device
pub trait DmaAllocator: Send + Sync {
    /// Allocate `size` bytes; `None` when memory is exhausted
    fn alloc_coherent(&self, size: usize) -> Option<(VirtAddr, PhysAddr)>;

    /// Free memory returned by `alloc_coherent`
    fn free_coherent(&self, virt: VirtAddr, phys: PhysAddr, size: usize);
}

// ============================================================================
// Mapped Region
// ============================================================================

/// One allocation mapped into a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// Kernel virtual address
    pub virt: VirtAddr,
    /// Bus address programmed into the device
    pub phys: PhysAddr,
    /// Size in bytes
    pub size: usize,
}

impl MappedRegion {
    pub fn new(virt: VirtAddr, phys: PhysAddr, size: usize) -> Self {
        Self { virt, phys, size }
    }
}

// ============================================================================
// Region Table
// ============================================================================

/// Bounded set of regions owned by one handle
pub struct RegionTable {
    /// Fixed number of slots; `None` is free
    slots: Vec<Option<MappedRegion>>,
    /// Allocator every region came from
    memory: Arc<dyn DmaAllocator>,
}

impl RegionTable {
    pub fn new(capacity: usize, memory: Arc<dyn DmaAllocator>) -> Self {
        Self {
            slots: vec![None; capacity],
            memory,
        }
    }

    /// Store `region` in the first free slot
    ///
    /// On `Full` the region is not recorded; the caller still owns it and
    /// must free it.
    pub fn register(&mut self, region: MappedRegion) -> Result<RegionId> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(DeviceError::Full)?;
        self.slots[slot] = Some(region);
        Ok(RegionId(slot))
    }

    /// Allocate `size` bytes of device memory and record it
    ///
    /// A full table is reported before anything is allocated.
    pub fn allocate(&mut self, size: usize) -> Result<RegionId> {
        if size == 0 {
            return Err(DeviceError::InvalidSize);
        }
        if self.is_full() {
            warn!("mach_dev: region table full ({} slots)", self.capacity());
            return Err(DeviceError::Full);
        }

        let (virt, phys) = self
            .memory
            .alloc_coherent(size)
            .ok_or(DeviceError::AllocFailed { size })?;

        let region = MappedRegion::new(virt, phys, size);
        self.register(region).inspect_err(|_| {
            self.memory.free_coherent(virt, phys, size);
        })
    }

    /// Free every recorded region and clear its slot
    ///
    /// Returns the number of regions freed; a second call frees nothing.
    pub fn release_all(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if let Some(region) = slot.take() {
                if region.virt.is_null() {
                    continue;
                }
                debug!(
                    "mach_dev: free region virt={:#x} phys={:#x} size={}",
                    region.virt, region.phys, region.size
                );
                self.memory
                    .free_coherent(region.virt, region.phys, region.size);
                freed += 1;
            }
        }
        freed
    }

    /// Look up a recorded region
    pub fn get(&self, id: RegionId) -> Option<&MappedRegion> {
        self.slots.get(id.0)?.as_ref()
    }

    /// Iterate over recorded regions
    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &MappedRegion)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|r| (RegionId(i), r)))
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for RegionTable {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl fmt::Debug for RegionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
