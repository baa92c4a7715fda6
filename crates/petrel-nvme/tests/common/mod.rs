#![allow(dead_code)] // each test binary uses a different subset

use std::sync::Arc;

use petrel_nvme::{NvmeController, PlatformServices};
use petrel_nvme_sim::{SimNamespaceConfig, SimNvmeDevice};

pub fn services(device: &SimNvmeDevice) -> PlatformServices {
    PlatformServices {
        memory: Arc::new(device.memory.clone()),
        interrupts: device.interrupts.clone(),
        storage: device.registry.clone(),
        clock: device.clock.clone(),
    }
}

/// Discover and fully initialize the single controller of `device`.
pub fn bring_up(device: &SimNvmeDevice) -> NvmeController {
    let mut controllers =
        NvmeController::initialize_available_controllers(&device.bus(), &services(device));
    assert_eq!(controllers.len(), 1, "expected one controller to come up");
    controllers.remove(0)
}

pub fn ns(nsid: u32, blocks: u64, lbads: u8) -> SimNamespaceConfig {
    SimNamespaceConfig {
        nsid,
        blocks,
        lbads,
        attached: false,
    }
}
