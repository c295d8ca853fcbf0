//! Device Header - attached devices and their registry
//!
//! A [`Device`] exists from attach to detach and carries the state shared by
//! all handles opened on it: the busy gate and the device memory allocator.
//! The [`DeviceRegistry`] maps minor numbers to devices; handles keep only
//! the minor and look the device up again when they need it.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use heapless::FnvIndexMap;
use log::{debug, warn};

use crate::config::MAX_DEVICES;
use crate::device::busy::BusyGate;
use crate::device::region::DmaAllocator;
use crate::error::{DeviceError, Result};

// ============================================================================
// Device
// ============================================================================

/// One attached physical unit
pub struct Device {
    /// Minor number (registry key)
    minor: u32,
    /// Device name
    name: String,
    /// Busy mask and wait sets
    gate: BusyGate,
    /// Coherent memory allocator of this unit
    memory: Arc<dyn DmaAllocator>,
    /// Number of open handles
    open_count: AtomicU32,
}

impl Device {
    pub fn new(minor: u32, name: String, memory: Arc<dyn DmaAllocator>) -> Self {
        Self {
            minor,
            name,
            gate: BusyGate::new(minor),
            memory,
            open_count: AtomicU32::new(0),
        }
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gate(&self) -> &BusyGate {
        &self.gate
    }

    /// Allocator for regions mapped on this device
    pub fn memory(&self) -> Arc<dyn DmaAllocator> {
        Arc::clone(&self.memory)
    }

    /// Get open count
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.open_count() > 0
    }

    pub(crate) fn opened(&self) {
        self.open_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn closed(&self) {
        let prev = self.open_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "close without matching open");
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("minor", &self.minor)
            .field("name", &self.name)
            .field("gate", &self.gate)
            .field("open_count", &self.open_count())
            .finish()
    }
}

// ============================================================================
// Device Registry
// ============================================================================

/// Fixed-capacity table of attached devices keyed by minor number
#[derive(Default)]
pub struct DeviceRegistry {
    devices: FnvIndexMap<u32, Arc<Device>, MAX_DEVICES>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: FnvIndexMap::new(),
        }
    }

    /// Attach a device at `minor`
    pub fn attach(
        &mut self,
        minor: u32,
        name: &str,
        memory: Arc<dyn DmaAllocator>,
    ) -> Result<Arc<Device>> {
        if self.devices.contains_key(&minor) {
            return Err(DeviceError::MinorInUse(minor));
        }

        let device = Arc::new(Device::new(minor, String::from(name), memory));
        self.devices
            .insert(minor, Arc::clone(&device))
            .map_err(|_| DeviceError::RegistryFull)?;

        debug!("mach_dev[{}]: attached {}", minor, name);
        Ok(device)
    }

    /// Detach the device at `minor`
    ///
    /// Refused while any handle is open on it or any busy bit is held.
    pub fn detach(&mut self, minor: u32) -> Result<Arc<Device>> {
        let device = self.find(minor).ok_or(DeviceError::NoSuchDevice)?;

        if device.is_open() || !device.gate().busy().is_empty() {
            warn!(
                "mach_dev[{}]: detach refused, {} handle(s) open, busy={:?}",
                minor,
                device.open_count(),
                device.gate().busy()
            );
            return Err(DeviceError::DeviceBusy);
        }

        self.devices.remove(&minor);
        debug!("mach_dev[{}]: detached {}", minor, device.name());
        Ok(device)
    }

    /// Lookup device by minor
    pub fn find(&self, minor: u32) -> Option<Arc<Device>> {
        self.devices.get(&minor).cloned()
    }

    /// List all devices
    pub fn list(&self) -> Vec<Arc<Device>> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
