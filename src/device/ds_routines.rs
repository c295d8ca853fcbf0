//! Device Server Routines
//!
//! The handle-facing surface: attach/detach of devices, open/close of
//! handles and the operations a handle performs between them. Open binds a
//! fresh [`HandleContext`] to a device; close tears it down deterministically
//! (unpin both transfer cursors, free every mapped region) and never fails
//! for a live handle.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, warn};
use spin::Mutex;

use crate::config::DriverConfig;
use crate::device::busy::{BusyToken, OpClass};
use crate::device::dev_hdr::{Device, DeviceRegistry};
use crate::device::handle::{
    HandleContext, HandleState, TransferDir, TransferPinner, UserBuffer,
};
use crate::device::region::{DmaAllocator, MappedRegion, RegionTable};
use crate::error::{DeviceError, Result};
use crate::kern::Scheduler;
use crate::types::{HandleId, RegionId};

type SharedHandle = Arc<Mutex<HandleContext>>;

/// Device server state
///
/// Lock order: registry, then handle table, then a single handle context.
/// The busy gate is entered with none of them held.
pub struct DeviceServer {
    config: DriverConfig,
    registry: Mutex<DeviceRegistry>,
    handles: Mutex<BTreeMap<HandleId, SharedHandle>>,
    sched: Arc<dyn Scheduler>,
    pinner: Arc<dyn TransferPinner>,
    next_handle: AtomicU64,
}

impl DeviceServer {
    pub fn new(
        config: DriverConfig,
        sched: Arc<dyn Scheduler>,
        pinner: Arc<dyn TransferPinner>,
    ) -> Self {
        Self {
            config,
            registry: Mutex::new(DeviceRegistry::new()),
            handles: Mutex::new(BTreeMap::new()),
            sched,
            pinner,
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    // ========================================================================
    // Device attach/detach
    // ========================================================================

    /// Attach a device at `minor`
    pub fn attach(
        &self,
        minor: u32,
        name: &str,
        memory: Arc<dyn DmaAllocator>,
    ) -> Result<Arc<Device>> {
        self.registry.lock().attach(minor, name, memory)
    }

    /// Detach the device at `minor`; refused while handles are open on it
    pub fn detach(&self, minor: u32) -> Result<()> {
        self.registry.lock().detach(minor).map(|_| ())
    }

    /// Device attached at `minor`
    pub fn find_device(&self, minor: u32) -> Option<Arc<Device>> {
        self.registry.lock().find(minor)
    }

    // ========================================================================
    // Open/Close
    // ========================================================================

    /// Open a handle on the device at `minor`
    pub fn open(&self, minor: u32) -> Result<HandleId> {
        // Held across the whole open so detach cannot slip in between
        let registry = self.registry.lock();
        let device = registry.find(minor).ok_or(DeviceError::NoSuchDevice)?;

        let mut handles = self.handles.lock();
        if handles.len() >= self.config.max_handles {
            warn!(
                "mach_dev[{}]: open() refused, {} handles already open",
                minor,
                handles.len()
            );
            return Err(DeviceError::OutOfMemory);
        }

        let id = HandleId(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let regions = RegionTable::new(self.config.max_regions, device.memory());
        let mut ctx = HandleContext::new(id, minor, regions, Arc::clone(&self.pinner));
        ctx.activate();

        handles.insert(id, Arc::new(Mutex::new(ctx)));
        device.opened();

        debug!("mach_dev[{}]: open() -> handle {}", minor, id);
        Ok(id)
    }

    /// Close a handle and release everything it owns
    pub fn close(&self, handle: HandleId) -> Result<()> {
        let shared = self
            .handles
            .lock()
            .remove(&handle)
            .ok_or(DeviceError::BadHandle(handle.0))?;

        // Only this handle's context is touched from here on
        let minor = {
            let mut ctx = shared.lock();
            ctx.teardown();
            ctx.minor()
        };

        if let Some(device) = self.find_device(minor) {
            device.closed();
        }

        debug!("mach_dev[{}]: release() handle {}", minor, handle);
        Ok(())
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Enter an operation of `class` on the handle's device
    ///
    /// Blocks while another holder has any of the bits. With `interruptible`
    /// set a pending signal ends the wait with `Cancelled`.
    pub fn begin_operation(
        &self,
        handle: HandleId,
        class: OpClass,
        interruptible: bool,
    ) -> Result<BusyToken> {
        let minor = self.with_handle(handle, |ctx| ctx.minor())?;
        let device = self.find_device(minor).ok_or(DeviceError::NoSuchDevice)?;

        device.gate().acquire(&*self.sched, class, interruptible)
    }

    /// Leave the operation represented by `token`
    ///
    /// Returns whether the bits were cleared. The gate refuses a token it did
    /// not issue, so a device re-attached at the same minor is never touched.
    pub fn end_operation(&self, handle: HandleId, token: BusyToken) -> bool {
        if !self.handles.lock().contains_key(&handle) {
            warn!(
                "mach_dev[{}]: end_operation on closed handle {}",
                token.minor(),
                handle
            );
        }

        match self.find_device(token.minor()) {
            Some(device) => device.gate().release(&*self.sched, token),
            None => {
                warn!(
                    "mach_dev[{}]: end_operation for detached device, handle {}",
                    token.minor(),
                    handle
                );
                false
            }
        }
    }

    /// Allocate `size` bytes of device memory and record it on the handle
    pub fn map_region(&self, handle: HandleId, size: usize) -> Result<RegionId> {
        let id = self.with_handle(handle, |ctx| ctx.regions_mut().allocate(size))??;
        debug!(
            "mach_dev: handle {} mapped region {} ({} bytes)",
            handle, id.0, size
        );
        Ok(id)
    }

    /// Descriptor of a region mapped on the handle
    pub fn region(&self, handle: HandleId, id: RegionId) -> Result<Option<MappedRegion>> {
        self.with_handle(handle, |ctx| ctx.regions().get(id).copied())
    }

    /// Pin a user buffer as the pending transfer for `dir`
    pub fn pin_transfer(
        &self,
        handle: HandleId,
        dir: TransferDir,
        buffer: UserBuffer,
    ) -> Result<()> {
        self.with_handle(handle, |ctx| ctx.pin(dir, buffer))?
    }

    /// Unpin the pending transfer for `dir`; returns whether one was pinned
    pub fn unpin_transfer(&self, handle: HandleId, dir: TransferDir) -> Result<bool> {
        self.with_handle(handle, |ctx| ctx.unpin(dir))
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Lifecycle state of a live handle
    pub fn handle_state(&self, handle: HandleId) -> Result<HandleState> {
        self.with_handle(handle, |ctx| ctx.state())
    }

    /// Number of open handles across all devices
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Run `f` on an active handle's context
    fn with_handle<R>(
        &self,
        handle: HandleId,
        f: impl FnOnce(&mut HandleContext) -> R,
    ) -> Result<R> {
        let shared = self
            .handles
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(DeviceError::BadHandle(handle.0))?;

        let mut ctx = shared.lock();
        if !ctx.is_active() {
            return Err(DeviceError::BadHandle(handle.0));
        }
        Ok(f(&mut ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::busy::BusyGate;
    use crate::kern::ThreadScheduler;
    use crate::testing::{RecordingAllocator, RecordingPinner};
    use crate::types::{PhysAddr, VirtAddr};

    struct Fixture {
        server: DeviceServer,
        memory: Arc<RecordingAllocator>,
        pinner: Arc<RecordingPinner>,
    }

    fn fixture(config: DriverConfig) -> Fixture {
        let memory = Arc::new(RecordingAllocator::new());
        let pinner = Arc::new(RecordingPinner::new());
        let server = DeviceServer::new(
            config,
            Arc::new(ThreadScheduler::new()),
            pinner.clone(),
        );
        server.attach(0, "exp0", memory.clone()).unwrap();
        Fixture {
            server,
            memory,
            pinner,
        }
    }

    #[test]
    fn test_open_unknown_minor() {
        let f = fixture(DriverConfig::default());
        assert_eq!(f.server.open(5), Err(DeviceError::NoSuchDevice));
        assert_eq!(f.server.open_handles(), 0);
        assert!(f.memory.allocs().is_empty());
    }

    #[test]
    fn test_open_close() {
        let f = fixture(DriverConfig::default());
        let h = f.server.open(0).unwrap();

        assert_eq!(f.server.handle_state(h), Ok(HandleState::Active));
        assert_eq!(f.server.find_device(0).unwrap().open_count(), 1);

        f.server.close(h).unwrap();
        assert_eq!(f.server.handle_state(h), Err(DeviceError::BadHandle(h.0)));
        assert_eq!(f.server.find_device(0).unwrap().open_count(), 0);
        assert_eq!(f.server.close(h), Err(DeviceError::BadHandle(h.0)));
    }

    #[test]
    fn test_handle_limit_is_out_of_memory() {
        let f = fixture(DriverConfig::new().with_max_handles(1));
        let h = f.server.open(0).unwrap();

        assert_eq!(f.server.open(0), Err(DeviceError::OutOfMemory));
        assert_eq!(f.server.open_handles(), 1);
        assert_eq!(f.server.find_device(0).unwrap().open_count(), 1);

        f.server.close(h).unwrap();
        assert!(f.server.open(0).is_ok());
    }

    #[test]
    fn test_close_frees_regions_with_matching_triples() {
        let f = fixture(DriverConfig::default());
        let h = f.server.open(0).unwrap();

        for size in [4096, 8192, 4096] {
            f.server.map_region(h, size).unwrap();
        }
        f.server.close(h).unwrap();

        let mut allocs = f.memory.allocs();
        let mut frees = f.memory.frees();
        allocs.sort();
        frees.sort();
        assert_eq!(frees.len(), 3);
        assert_eq!(allocs, frees);
    }

    #[test]
    fn test_map_region_full_issues_no_alloc() {
        let f = fixture(DriverConfig::new().with_max_regions(2));
        let h = f.server.open(0).unwrap();

        f.server.map_region(h, 4096).unwrap();
        f.server.map_region(h, 4096).unwrap();
        assert_eq!(f.server.map_region(h, 4096), Err(DeviceError::Full));
        assert_eq!(f.memory.allocs().len(), 2);

        f.server.close(h).unwrap();
        assert_eq!(f.memory.outstanding(), 0);
    }

    #[test]
    fn test_region_lookup() {
        let f = fixture(DriverConfig::default());
        let h = f.server.open(0).unwrap();
        let id = f.server.map_region(h, 256).unwrap();

        let region = f.server.region(h, id).unwrap().unwrap();
        assert_eq!(region.size, 256);
        assert_ne!(region.virt, VirtAddr::NULL);
        assert_ne!(region.phys, PhysAddr(0));
        assert_eq!(f.server.region(h, RegionId(9)), Ok(None));
    }

    #[test]
    fn test_close_unpins_both_cursors() {
        let f = fixture(DriverConfig::default());
        let h = f.server.open(0).unwrap();

        let rd = UserBuffer::new(0x7000, 128);
        let wr = UserBuffer::new(0x9000, 256);
        f.server.pin_transfer(h, TransferDir::Read, rd).unwrap();
        f.server.pin_transfer(h, TransferDir::Write, wr).unwrap();

        f.server.close(h).unwrap();
        let unpinned = f.pinner.unpinned();
        assert_eq!(unpinned.len(), 2);
        assert!(unpinned.contains(&rd));
        assert!(unpinned.contains(&wr));
    }

    #[test]
    fn test_unpin_before_close_is_not_repeated() {
        let f = fixture(DriverConfig::default());
        let h = f.server.open(0).unwrap();

        f.server
            .pin_transfer(h, TransferDir::Read, UserBuffer::new(0x7000, 8))
            .unwrap();
        assert_eq!(f.server.unpin_transfer(h, TransferDir::Read), Ok(true));
        assert_eq!(f.server.unpin_transfer(h, TransferDir::Read), Ok(false));

        f.server.close(h).unwrap();
        assert_eq!(f.pinner.unpinned().len(), 1);
    }

    #[test]
    fn test_operations_on_closed_handle() {
        let f = fixture(DriverConfig::default());
        let h = f.server.open(0).unwrap();
        f.server.close(h).unwrap();

        assert_eq!(
            f.server.begin_operation(h, OpClass::READ, false).unwrap_err(),
            DeviceError::BadHandle(h.0)
        );
        assert_eq!(f.server.map_region(h, 16), Err(DeviceError::BadHandle(h.0)));
    }

    #[test]
    fn test_begin_end_operation() {
        let f = fixture(DriverConfig::default());
        let a = f.server.open(0).unwrap();
        let b = f.server.open(0).unwrap();
        let dev = f.server.find_device(0).unwrap();

        let read = f.server.begin_operation(a, OpClass::READ, true).unwrap();
        let write = f.server.begin_operation(b, OpClass::WRITE, true).unwrap();
        assert_eq!(dev.gate().busy(), OpClass::READ | OpClass::WRITE);

        assert!(f.server.end_operation(a, read));
        assert!(f.server.end_operation(b, write));
        assert!(dev.gate().busy().is_empty());
    }

    #[test]
    fn test_end_operation_refuses_token_from_replaced_device() {
        let f = fixture(DriverConfig::default());

        // A gate that used to sit at minor 0 before a detach/attach cycle
        let gone = BusyGate::new(0);
        let stale = gone.try_acquire(OpClass::READ).unwrap();

        let h = f.server.open(0).unwrap();
        let live = f.server.begin_operation(h, OpClass::READ, false).unwrap();
        let dev = f.server.find_device(0).unwrap();

        assert!(!f.server.end_operation(h, stale));
        assert_eq!(dev.gate().busy(), OpClass::READ);

        assert!(f.server.end_operation(h, live));
        assert!(dev.gate().busy().is_empty());
        assert_eq!(gone.busy(), OpClass::READ);
    }

    #[test]
    fn test_detach_policy() {
        let f = fixture(DriverConfig::default());
        let h = f.server.open(0).unwrap();

        assert_eq!(f.server.detach(0), Err(DeviceError::DeviceBusy));
        f.server.close(h).unwrap();
        assert_eq!(f.server.detach(0), Ok(()));
        assert_eq!(f.server.open(0), Err(DeviceError::NoSuchDevice));
    }
}
