//! Driver configuration
//!
//! Compile-time capacities plus the few limits an embedding driver may tune
//! at construction time.

/// Maximum number of attached devices (registry capacity, power of two)
pub const MAX_DEVICES: usize = 8;

/// Default number of region slots per open handle
pub const MAX_REGIONS: usize = 16;

/// Default limit on simultaneously open handles across all devices
pub const MAX_HANDLES: usize = 64;

/// Number of operation classes tracked by the busy gate
pub const OP_CLASSES: usize = 3;

/// Runtime limits for a [`DeviceServer`](crate::device::DeviceServer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Open handles allowed at once; exhausting it fails `open` with `OutOfMemory`
    pub max_handles: usize,
    /// Region slots given to each new handle
    pub max_regions: usize,
}

impl DriverConfig {
    pub const fn new() -> Self {
        Self {
            max_handles: MAX_HANDLES,
            max_regions: MAX_REGIONS,
        }
    }

    pub const fn with_max_handles(mut self, max_handles: usize) -> Self {
        self.max_handles = max_handles;
        self
    }

    pub const fn with_max_regions(mut self, max_regions: usize) -> Self {
        self.max_regions = max_regions;
        self
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.max_handles, MAX_HANDLES);
        assert_eq!(config.max_regions, MAX_REGIONS);
    }

    #[test]
    fn test_builder() {
        let config = DriverConfig::new().with_max_regions(2).with_max_handles(1);
        assert_eq!(config.max_regions, 2);
        assert_eq!(config.max_handles, 1);
    }

    #[test]
    fn test_registry_capacity_is_power_of_two() {
        assert!(MAX_DEVICES.is_power_of_two());
    }
}
