//! Mach_R device core - shared-device busy gate and per-handle resources
//!
//! One physical device is exposed through many independently opened
//! handles. This crate provides the two pieces every such driver needs:
//!
//! - a busy gate that lets unrelated operation classes run concurrently on
//!   the same device while serializing conflicting ones, blocking through
//!   the scheduler instead of spinning
//! - per-handle tracking of device memory mapped into the client, with
//!   teardown at close that frees every region exactly once
//!
//! Register/DMA programming, control-operation dispatch and the page-table
//! side of mapping live in the embedding driver and reach this crate through
//! the collaborator traits in [`device`] and [`kern`].

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

// Standard library replacement for no_std
extern crate alloc;

#[cfg(all(feature = "std", not(test)))]
extern crate std;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Scheduling primitives
pub mod kern;

// Device subsystem
pub mod device;

#[cfg(test)]
mod testing;

pub use config::DriverConfig;
pub use device::{
    BusyToken, Device, DeviceServer, DmaAllocator, HandleState, MappedRegion, OpClass,
    TransferDir, TransferPinner, UserBuffer,
};
pub use error::{DeviceError, PinError, Result};
pub use kern::Scheduler;
pub use types::{HandleId, PhysAddr, RegionId, ThreadId, VirtAddr};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Driver name used in log lines
pub const NAME: &str = "mach_dev";
