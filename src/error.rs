//! Error types for device core operations

use thiserror::Error;

/// Result type for device core operations
pub type Result<T> = core::result::Result<T, DeviceError>;

/// Errors surfaced by the gate, the region table and the handle lifecycle
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// No device attached at the requested minor
    #[error("no such device")]
    NoSuchDevice,

    /// Handle allocation failed during open
    #[error("out of memory")]
    OutOfMemory,

    /// Region table of the handle is exhausted
    #[error("region table full")]
    Full,

    /// The device memory allocator refused the request
    #[error("device memory allocation failed ({size} bytes)")]
    AllocFailed { size: usize },

    /// Interruptible wait interrupted by a signal; the busy mask is untouched
    #[error("wait cancelled by signal")]
    Cancelled,

    /// Unknown or already closed handle
    #[error("bad handle {0}")]
    BadHandle(u64),

    /// Device still has open handles or held busy bits
    #[error("device busy")]
    DeviceBusy,

    /// A device is already attached at this minor
    #[error("minor {0} already in use")]
    MinorInUse(u32),

    /// Registry has no free slot
    #[error("device registry full")]
    RegistryFull,

    /// Zero-length region request
    #[error("invalid region size")]
    InvalidSize,

    /// The pinning collaborator refused a user buffer
    #[error("pin failed: {0}")]
    Pin(#[from] PinError),
}

impl DeviceError {
    /// Whether the caller may simply retry the request
    pub const fn is_retryable(&self) -> bool {
        matches!(self, DeviceError::Cancelled)
    }
}

/// Errors reported by a [`TransferPinner`](crate::device::TransferPinner)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    /// The user address is not mapped or not writable
    #[error("bad user address {0:#x}")]
    BadAddress(u64),

    /// Zero-length buffer
    #[error("empty buffer")]
    EmptyBuffer,

    /// The pages could not be locked in memory
    #[error("cannot lock user pages")]
    NoPages,
}
