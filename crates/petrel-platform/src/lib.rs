//! Platform seams consumed by petrel device drivers.
//!
//! Drivers in this workspace never touch the host kernel directly; everything
//! they need from it comes through the traits defined here:
//!
//! - [`MmioSpace`]: a mapped memory-mapped I/O window (a PCI BAR).
//! - [`MemoryService`] / [`DmaRegion`]: physically contiguous, page-aligned,
//!   uncached memory for queue rings, staging buffers and PRP lists.
//! - [`InterruptService`] / [`InterruptHandler`]: interrupt vector
//!   assignment and line unmasking.
//! - [`PciBus`] / [`PciFunction`]: configuration-space access and BAR
//!   mapping for discovered functions.
//! - [`BlockDevice`] / [`StorageRegistry`]: the block-storage surface a
//!   driver exports and the registry it plugs into.
//! - [`Clock`]: a time source, so timeout behaviour is testable on virtual
//!   time.
//!
//! Implementations live elsewhere: the kernel provides the real ones, the
//! `petrel-nvme-sim` crate provides simulated ones for the test suites.

pub mod block;
pub mod clock;
pub mod dma;
pub mod irq;
pub mod mmio;
pub mod pci;

pub use block::{BlockDevice, StorageRegistry};
pub use clock::Clock;
pub use dma::{DmaBacking, DmaError, DmaRegion, MemoryService, PAGE_SIZE};
pub use irq::{InterruptHandler, InterruptService};
pub use mmio::MmioSpace;
pub use pci::{PciBus, PciError, PciFunction};
