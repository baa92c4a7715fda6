//! PCI configuration access.
//!
//! Only what a driver needs to adopt a discovered function: sized config
//! space reads/writes (so it can probe BARs itself) and the ability to map a
//! BAR's physical range into an [`MmioSpace`].

use std::sync::Arc;

use thiserror::Error;

use crate::mmio::MmioSpace;

#[derive(Debug, Error)]
pub enum PciError {
    #[error("BAR at config offset {offset:#x} is not a memory BAR")]
    NotMemoryBar { offset: u8 },

    #[error("failed to map MMIO range {base:#x}+{len:#x}")]
    MapFailed { base: u64, len: u64 },
}

/// One PCI function, already located by the bus scan.
pub trait PciFunction: Send + Sync {
    fn read_config_u16(&self, offset: u8) -> u16;
    fn write_config_u16(&self, offset: u8, value: u16);
    fn read_config_u32(&self, offset: u8) -> u32;
    fn write_config_u32(&self, offset: u8, value: u32);

    /// Map `len` bytes of physical MMIO starting at `base` into kernel
    /// address space.
    fn map_mmio(&self, base: u64, len: u64) -> Result<Arc<dyn MmioSpace>, PciError>;
}

/// The host's view of the PCI bus.
pub trait PciBus: Send + Sync {
    /// All functions matching a (class, subclass) pair.
    fn find_by_class(&self, class: u8, subclass: u8) -> Vec<Arc<dyn PciFunction>>;
}
