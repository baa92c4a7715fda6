//! Simulated NVMe controller and platform services for driver testing.
//!
//! The simulation implements the register/doorbell contract a real
//! controller exposes over BAR0 (CAP/VS/CC/CSTS/AQA/ASQ/ACQ, the doorbell
//! array, phase-tagged completions, per-queue INTMS/INTMC masking,
//! level-triggered interrupt delivery), plus the platform services the
//! driver consumes: physical memory with a DMA allocator, an interrupt
//! router, a storage registry and a virtual clock.
//!
//! Command execution is synchronous: a submission doorbell write processes
//! the queue, posts completions and (on a masked-to-pending edge) fires the
//! assigned interrupt handler before the doorbell write returns. Ready and
//! shutdown transitions are driven by virtual time, so CAP.TO handshake
//! behaviour is testable without wall-clock waits.
//!
//! Everything the driver puts on the wire is captured: CSTS polls with
//! timestamps, doorbell writes, and every executed command with its
//! dwords, PRPs and completion status.

mod clock;
mod controller;
mod env;
mod memory;

pub use clock::VirtualClock;
pub use controller::{CapturedCommand, SimConfig, SimController, SimNamespaceConfig, SimStats};
pub use env::{SimInterrupts, SimNvmeDevice, SimPciBus, SimPciFunction, SimRegistry};
pub use memory::SimMemory;
