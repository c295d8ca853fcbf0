//! Recording collaborators shared by the unit and scenario tests

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::device::{DmaAllocator, TransferCursor, TransferPinner, UserBuffer};
use crate::error::PinError;
use crate::types::{PhysAddr, VirtAddr};

/// (virt, phys, size) of one allocation
pub type Triple = (VirtAddr, PhysAddr, usize);

/// Allocator handing out fake addresses and recording every call
#[derive(Debug, Default)]
pub struct RecordingAllocator {
    next: AtomicU64,
    fail: AtomicBool,
    allocs: Mutex<Vec<Triple>>,
    frees: Mutex<Vec<Triple>>,
}

impl RecordingAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0x10_0000),
            ..Self::default()
        }
    }

    /// Make the next allocation fail
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn allocs(&self) -> Vec<Triple> {
        self.allocs.lock().clone()
    }

    pub fn frees(&self) -> Vec<Triple> {
        self.frees.lock().clone()
    }

    /// Allocations not yet freed
    pub fn outstanding(&self) -> usize {
        let frees = self.frees.lock();
        self.allocs
            .lock()
            .iter()
            .filter(|a| !frees.contains(a))
            .count()
    }
}

impl DmaAllocator for RecordingAllocator {
    fn alloc_coherent(&self, size: usize) -> Option<(VirtAddr, PhysAddr)> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return None;
        }
        let base = self.next.fetch_add(size as u64 + 0x1000, Ordering::SeqCst);
        let (virt, phys) = (VirtAddr(0xffff_0000_0000 + base), PhysAddr(base));
        self.allocs.lock().push((virt, phys, size));
        Some((virt, phys))
    }

    fn free_coherent(&self, virt: VirtAddr, phys: PhysAddr, size: usize) {
        self.frees.lock().push((virt, phys, size));
    }
}

/// Pinner that accepts any non-empty buffer and records pin/unpin calls
#[derive(Debug, Default)]
pub struct RecordingPinner {
    pinned: Mutex<Vec<UserBuffer>>,
    unpinned: Mutex<Vec<UserBuffer>>,
}

impl RecordingPinner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pinned(&self) -> Vec<UserBuffer> {
        self.pinned.lock().clone()
    }

    pub fn unpinned(&self) -> Vec<UserBuffer> {
        self.unpinned.lock().clone()
    }
}

impl TransferPinner for RecordingPinner {
    fn pin_transfer(&self, _cursor: &TransferCursor, buffer: UserBuffer) -> Result<(), PinError> {
        if buffer.len == 0 {
            return Err(PinError::EmptyBuffer);
        }
        if buffer.addr == 0 {
            return Err(PinError::BadAddress(0));
        }
        self.pinned.lock().push(buffer);
        Ok(())
    }

    fn unpin_transfer(&self, cursor: &TransferCursor) {
        if let Some(buffer) = cursor.buffer() {
            self.unpinned.lock().push(buffer);
        }
    }
}
