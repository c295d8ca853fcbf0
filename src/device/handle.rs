//! Handle Context - per-open state of a client
//!
//! Every successful open gets its own context: the minor of the device it
//! talks to, one pinned-buffer cursor per transfer direction and the table
//! of device memory mapped for it. Nothing in here is shared with other
//! handles.

use alloc::sync::Arc;
use core::fmt;
use log::debug;

use crate::device::region::RegionTable;
use crate::error::{PinError, Result};
use crate::types::HandleId;

// ============================================================================
// Handle State
// ============================================================================

/// Lifecycle of a handle; never moves backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u16)]
pub enum HandleState {
    /// Allocated, not yet bound
    #[default]
    Created = 0,
    /// Open and usable
    Active = 1,
    /// Teardown in progress
    Closing = 2,
    /// All resources released
    Destroyed = 3,
}

// ============================================================================
// Transfer Cursors
// ============================================================================

/// Direction of a data transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDir {
    Read,
    Write,
}

/// User buffer taking part in a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserBuffer {
    /// User virtual address
    pub addr: u64,
    /// Length in bytes
    pub len: usize,
}

impl UserBuffer {
    pub fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }
}

/// Pinned-buffer state of one transfer direction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferCursor {
    buffer: Option<UserBuffer>,
}

impl TransferCursor {
    pub const fn new() -> Self {
        Self { buffer: None }
    }

    /// Buffer currently pinned, if any
    pub fn buffer(&self) -> Option<UserBuffer> {
        self.buffer
    }

    pub fn is_pinned(&self) -> bool {
        self.buffer.is_some()
    }

    /// Unpin the buffer if one is pinned; no-op on a clear cursor
    pub fn release(&mut self, pinner: &dyn TransferPinner) -> bool {
        if self.buffer.is_none() {
            return false;
        }
        pinner.unpin_transfer(self);
        self.buffer = None;
        true
    }
}

/// Locks user buffers in memory for the duration of a transfer
pub trait TransferPinner: Send + Sync {
    /// Pin `buffer` for the transfer tracked by `cursor`
    fn pin_transfer(&self, cursor: &TransferCursor, buffer: UserBuffer)
        -> core::result::Result<(), PinError>;

    /// Unpin the buffer recorded in `cursor`
    fn unpin_transfer(&self, cursor: &TransferCursor);
}

// ============================================================================
// Handle Context
// ============================================================================

/// Everything one open handle owns
pub struct HandleContext {
    id: HandleId,
    /// Registry key of the device; never a reference to it
    minor: u32,
    state: HandleState,
    pending_read: TransferCursor,
    pending_write: TransferCursor,
    regions: RegionTable,
    pinner: Arc<dyn TransferPinner>,
}

impl HandleContext {
    /// New context in [`HandleState::Created`] with clear cursors
    pub fn new(
        id: HandleId,
        minor: u32,
        regions: RegionTable,
        pinner: Arc<dyn TransferPinner>,
    ) -> Self {
        Self {
            id,
            minor,
            state: HandleState::Created,
            pending_read: TransferCursor::new(),
            pending_write: TransferCursor::new(),
            regions,
            pinner,
        }
    }

    pub fn activate(&mut self) {
        debug_assert_eq!(self.state, HandleState::Created);
        self.state = HandleState::Active;
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == HandleState::Active
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn regions_mut(&mut self) -> &mut RegionTable {
        &mut self.regions
    }

    pub fn cursor(&self, dir: TransferDir) -> &TransferCursor {
        match dir {
            TransferDir::Read => &self.pending_read,
            TransferDir::Write => &self.pending_write,
        }
    }

    /// Pin `buffer` as the pending transfer for `dir`
    ///
    /// A buffer already pinned for that direction is unpinned first.
    pub fn pin(&mut self, dir: TransferDir, buffer: UserBuffer) -> Result<()> {
        let pinner = Arc::clone(&self.pinner);
        let cursor = match dir {
            TransferDir::Read => &mut self.pending_read,
            TransferDir::Write => &mut self.pending_write,
        };
        cursor.release(&*pinner);
        pinner.pin_transfer(cursor, buffer)?;
        cursor.buffer = Some(buffer);
        Ok(())
    }

    /// Unpin the pending transfer for `dir`; returns whether one was pinned
    pub fn unpin(&mut self, dir: TransferDir) -> bool {
        let pinner = &*self.pinner;
        match dir {
            TransferDir::Read => self.pending_read.release(pinner),
            TransferDir::Write => self.pending_write.release(pinner),
        }
    }

    /// Release everything the handle owns
    ///
    /// Unpins both cursors whether or not their transfers finished, then
    /// frees every mapped region. Never fails; a second call does nothing.
    /// Returns the number of regions freed.
    pub fn teardown(&mut self) -> usize {
        if self.state == HandleState::Destroyed {
            return 0;
        }
        self.state = HandleState::Closing;

        let pinner = &*self.pinner;
        self.pending_read.release(pinner);
        self.pending_write.release(pinner);
        let freed = self.regions.release_all();

        self.state = HandleState::Destroyed;
        debug!(
            "mach_dev[{}]: handle {} destroyed, {} region(s) freed",
            self.minor, self.id, freed
        );
        freed
    }
}

impl Drop for HandleContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for HandleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleContext")
            .field("id", &self.id)
            .field("minor", &self.minor)
            .field("state", &self.state)
            .field("pending_read", &self.pending_read)
            .field("pending_write", &self.pending_write)
            .field("regions", &self.regions)
            .finish()
    }
}
