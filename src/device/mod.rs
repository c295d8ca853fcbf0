//! Device Subsystem
//!
//! Provides the shared-device core:
//! - Device headers and the registry of attached units
//! - Busy gate serializing operations of the same class
//! - Per-handle region tables and transfer cursors
//! - Device server routines (open/close and handle operations)

pub mod busy;
pub mod dev_hdr;
pub mod ds_routines;
pub mod handle;
pub mod region;

pub use busy::{BusyGate, BusyToken, OpClass};
pub use dev_hdr::{Device, DeviceRegistry};
pub use ds_routines::DeviceServer;
pub use handle::{
    HandleContext, HandleState, TransferCursor, TransferDir, TransferPinner, UserBuffer,
};
pub use region::{DmaAllocator, MappedRegion, RegionTable};
