//! Simulated platform services and the wiring that bundles them with a
//! controller into a ready-to-use test environment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use petrel_platform::{
    BlockDevice, InterruptHandler, InterruptService, MmioSpace, PciBus, PciError, PciFunction,
    StorageRegistry,
};

use crate::clock::VirtualClock;
use crate::controller::{SimConfig, SimController, SimNamespaceConfig};
use crate::memory::SimMemory;

/// BAR0 base the simulated function advertises.
const BAR0_BASE: u64 = 0xF000_0000;
/// BAR0 window length: register file plus a doorbell region.
const BAR0_LEN: u32 = 0x8000;

/// The controller's BAR0 as seen through [`MmioSpace`]. Writes that raise
/// the interrupt level deliver the interrupt synchronously, the way a
/// level-triggered pin fires as soon as the completion is posted.
struct SimBar0 {
    ctrl: Arc<Mutex<SimController>>,
    interrupts: Arc<SimInterrupts>,
    line: u8,
}

impl MmioSpace for SimBar0 {
    fn read_u32(&self, offset: u64) -> u32 {
        self.ctrl.lock().unwrap().mmio_read32(offset)
    }

    fn write_u32(&self, offset: u64, value: u32) {
        // The controller lock is released before delivery so the handler can
        // issue its own register accesses.
        let fire = self.ctrl.lock().unwrap().mmio_write32(offset, value);
        if fire {
            self.interrupts.trigger(self.line);
        }
    }
}

/// Interrupt router: vector assignment, line masking, synchronous delivery.
#[derive(Default)]
pub struct SimInterrupts {
    inner: Mutex<SimInterruptsInner>,
    fired: AtomicU32,
}

#[derive(Default)]
struct SimInterruptsInner {
    handlers: HashMap<u8, Arc<dyn InterruptHandler>>,
    unmasked: Vec<u8>,
}

impl SimInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupts delivered to a handler so far.
    pub fn fired(&self) -> u32 {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn trigger(&self, line: u8) {
        let handler = {
            let inner = self.inner.lock().unwrap();
            if !inner.unmasked.contains(&line) {
                return;
            }
            inner.handlers.get(&line).cloned()
        };
        if let Some(handler) = handler {
            self.fired.fetch_add(1, Ordering::SeqCst);
            handler.handle_interrupt(line);
        }
    }
}

impl InterruptService for SimInterrupts {
    fn assign(&self, vector: u8, handler: Arc<dyn InterruptHandler>) {
        self.inner.lock().unwrap().handlers.insert(vector, handler);
    }

    fn unmask_line(&self, line: u8) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.unmasked.contains(&line) {
            inner.unmasked.push(line);
        }
    }
}

/// Records registered block devices and hands out `prefix0`, `prefix1`, ...
/// names.
#[derive(Default)]
pub struct SimRegistry {
    devices: Mutex<Vec<(String, Arc<dyn BlockDevice>)>>,
}

impl SimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, device)| device.clone())
    }
}

impl StorageRegistry for SimRegistry {
    fn register_device(&self, device: Arc<dyn BlockDevice>, prefix: &str) -> String {
        let mut devices = self.devices.lock().unwrap();
        let index = devices
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .count();
        let name = format!("{prefix}{index}");
        devices.push((name.clone(), device));
        name
    }
}

struct PciConfigState {
    bytes: [u8; 256],
    bar0_probe: bool,
}

/// A PCI function fronting the simulated controller: enough configuration
/// space for identification, command-word writes, BAR sizing via the
/// write-all-ones probe, and BAR0 mapping.
pub struct SimPciFunction {
    state: Mutex<PciConfigState>,
    mmio: Arc<dyn MmioSpace>,
}

impl SimPciFunction {
    fn new(vendor_id: u16, device_id: u16, interrupt_line: u8, mmio: Arc<dyn MmioSpace>) -> Self {
        let mut bytes = [0u8; 256];
        bytes[0x00..0x02].copy_from_slice(&vendor_id.to_le_bytes());
        bytes[0x02..0x04].copy_from_slice(&device_id.to_le_bytes());
        // Class code: mass storage / NVM / NVMe programming interface.
        bytes[0x09] = 0x02;
        bytes[0x0A] = 0x08;
        bytes[0x0B] = 0x01;
        bytes[0x3C] = interrupt_line;
        Self {
            state: Mutex::new(PciConfigState {
                bytes,
                bar0_probe: false,
            }),
            mmio,
        }
    }

    fn class(&self) -> (u8, u8) {
        let state = self.state.lock().unwrap();
        (state.bytes[0x0B], state.bytes[0x0A])
    }

    /// Command register as last written by the driver.
    pub fn command(&self) -> u16 {
        self.read_config_u16(0x04)
    }
}

impl PciFunction for SimPciFunction {
    fn read_config_u16(&self, offset: u8) -> u16 {
        let state = self.state.lock().unwrap();
        let off = offset as usize;
        u16::from_le_bytes(state.bytes[off..off + 2].try_into().unwrap())
    }

    fn write_config_u16(&self, offset: u8, value: u16) {
        let mut state = self.state.lock().unwrap();
        let off = offset as usize;
        state.bytes[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn read_config_u32(&self, offset: u8) -> u32 {
        match offset {
            // BAR0: 64-bit memory BAR; a probe read reports the size mask.
            0x10 => {
                let state = self.state.lock().unwrap();
                if state.bar0_probe {
                    !(BAR0_LEN - 1) & !0xF | 0x4
                } else {
                    BAR0_BASE as u32 | 0x4
                }
            }
            0x14 => (BAR0_BASE >> 32) as u32,
            _ => {
                let state = self.state.lock().unwrap();
                let off = offset as usize;
                u32::from_le_bytes(state.bytes[off..off + 4].try_into().unwrap())
            }
        }
    }

    fn write_config_u32(&self, offset: u8, value: u32) {
        match offset {
            0x10 => {
                self.state.lock().unwrap().bar0_probe = value == 0xFFFF_FFFF;
            }
            0x14 => {}
            _ => {
                let mut state = self.state.lock().unwrap();
                let off = offset as usize;
                state.bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    fn map_mmio(&self, base: u64, len: u64) -> Result<Arc<dyn MmioSpace>, PciError> {
        if base != BAR0_BASE || len != BAR0_LEN as u64 {
            return Err(PciError::MapFailed { base, len });
        }
        Ok(self.mmio.clone())
    }
}

/// A PCI bus populated with simulated functions.
pub struct SimPciBus {
    functions: Vec<Arc<SimPciFunction>>,
}

impl SimPciBus {
    pub fn new(functions: Vec<Arc<SimPciFunction>>) -> Self {
        Self { functions }
    }
}

impl PciBus for SimPciBus {
    fn find_by_class(&self, class: u8, subclass: u8) -> Vec<Arc<dyn PciFunction>> {
        self.functions
            .iter()
            .filter(|function| function.class() == (class, subclass))
            .map(|function| function.clone() as Arc<dyn PciFunction>)
            .collect()
    }
}

/// One simulated controller wired to a full set of platform services.
pub struct SimNvmeDevice {
    ctrl: Arc<Mutex<SimController>>,
    pub memory: SimMemory,
    pub clock: Arc<VirtualClock>,
    pub interrupts: Arc<SimInterrupts>,
    pub registry: Arc<SimRegistry>,
    function: Arc<SimPciFunction>,
}

impl SimNvmeDevice {
    pub fn new(cfg: SimConfig, namespaces: Vec<SimNamespaceConfig>) -> Self {
        let memory = SimMemory::new(cfg.memory_bytes);
        let clock = Arc::new(VirtualClock::new(cfg.clock_step_ms));
        let interrupts = Arc::new(SimInterrupts::new());
        let registry = Arc::new(SimRegistry::new());

        let vendor_id = cfg.vendor_id;
        let device_id = cfg.device_id;
        let line = cfg.interrupt_line;
        let ctrl = Arc::new(Mutex::new(SimController::new(
            cfg,
            namespaces,
            memory.clone(),
            clock.clone(),
        )));

        let bar0: Arc<dyn MmioSpace> = Arc::new(SimBar0 {
            ctrl: ctrl.clone(),
            interrupts: interrupts.clone(),
            line,
        });
        let function = Arc::new(SimPciFunction::new(vendor_id, device_id, line, bar0));

        Self {
            ctrl,
            memory,
            clock,
            interrupts,
            registry,
            function,
        }
    }

    pub fn function(&self) -> Arc<SimPciFunction> {
        self.function.clone()
    }

    pub fn bus(&self) -> SimPciBus {
        SimPciBus::new(vec![self.function.clone()])
    }

    /// Direct access to controller state and capture buffers.
    pub fn controller(&self) -> MutexGuard<'_, SimController> {
        self.ctrl.lock().unwrap()
    }
}
