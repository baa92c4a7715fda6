//! Controller discovery, bring-up, enumeration and interrupt dispatch.
//!
//! Bring-up happens in two phases. Construction maps the register window and
//! runs the CC/CSTS handshake: shut down and disable if the controller is
//! already running, program the admin queue, then enable and wait for RDY.
//! `initialize` then talks to the controller: identify, create the I/O queue
//! pair, enumerate namespaces and register them with the storage registry.

use std::sync::{Arc, Mutex};

use petrel_platform::{
    Clock, InterruptHandler, InterruptService, MemoryService, PciBus, PciFunction,
    StorageRegistry, PAGE_SIZE,
};

use crate::admin::{AdminQueue, ControllerInfo, NamespaceInfo};
use crate::admin::parse_active_nsid_list;
use crate::cmd::{CNS_ACTIVE_NS_LIST, CNS_CONTROLLER, CNS_NAMESPACE};
use crate::error::{NvmeError, Result};
use crate::io::IoEngine;
use crate::namespace::Namespace;
use crate::pci;
use crate::queue::QueuePair;
use crate::regs::{
    ControllerCaps, RegisterMap, CC_EN, CC_IOCQES_SHIFT, CC_IOSQES_SHIFT, CC_SHN_ABRUPT,
    CC_SHN_MASK, CSTS_CFS, CSTS_RDY, CSTS_SHST_SHIFT, SHST_COMPLETE, SHST_NORMAL,
};

/// Queue depth ceiling; the actual depth is additionally bounded by
/// CAP.MQES.
pub const MAX_QUEUE_DEPTH: u32 = 64;

/// The single I/O queue pair.
const IO_QUEUE_ID: u16 = 1;

/// Explicit handles to the host services the driver consumes.
#[derive(Clone)]
pub struct PlatformServices {
    pub memory: Arc<dyn MemoryService>,
    pub interrupts: Arc<dyn InterruptService>,
    pub storage: Arc<dyn StorageRegistry>,
    pub clock: Arc<dyn Clock>,
}

/// Interrupt-side fan-out: asks every registered queue pair to drain its
/// completion ring. Registered with the interrupt service in place of the
/// controller itself.
pub struct CompletionDispatcher {
    queues: Mutex<Vec<Arc<QueuePair>>>,
}

impl CompletionDispatcher {
    fn new() -> Self {
        Self {
            queues: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, queue: Arc<QueuePair>) {
        self.queues.lock().unwrap().push(queue);
    }
}

impl InterruptHandler for CompletionDispatcher {
    fn handle_interrupt(&self, vector: u8) {
        tracing::trace!(target: "nvme", vector, "controller interrupt");
        // Snapshot the list so a drain never runs under the registration
        // lock.
        let queues: Vec<_> = self.queues.lock().unwrap().clone();
        for queue in queues {
            queue.drain_completions();
        }
    }
}

pub struct NvmeController {
    regs: RegisterMap,
    caps: ControllerCaps,
    queue_depth: u32,
    admin: AdminQueue,
    dispatcher: Arc<CompletionDispatcher>,
    services: PlatformServices,
    cntlid: u16,
    /// Maximum bytes per command from identify MDTS; `None` = no limit.
    max_transfer: Option<usize>,
    engine: Option<Arc<IoEngine>>,
    namespaces: Vec<Arc<Namespace>>,
}

impl NvmeController {
    /// Scan the PCI bus for NVMe controllers (class 01h, subclass 08h) and
    /// bring up each one. Controllers that fail bring-up are logged and
    /// skipped; a machine without NVMe yields an empty list.
    pub fn initialize_available_controllers(
        bus: &dyn PciBus,
        services: &PlatformServices,
    ) -> Vec<NvmeController> {
        let mut controllers = Vec::new();
        for function in bus.find_by_class(pci::CLASS_MASS_STORAGE, pci::SUBCLASS_NVM) {
            let mut controller = match NvmeController::new(function.as_ref(), services.clone()) {
                Ok(controller) => controller,
                Err(err) => {
                    tracing::error!(target: "nvme", %err, "skipping controller");
                    continue;
                }
            };
            controller.attach_interrupt(function.as_ref());
            if let Err(err) = controller.initialize() {
                tracing::error!(target: "nvme", %err, "controller initialization failed");
                continue;
            }
            controllers.push(controller);
        }
        controllers
    }

    /// Phase one: map the registers and run the enable handshake. No admin
    /// commands are issued yet, so this may run before the interrupt line is
    /// attached.
    pub fn new(function: &dyn PciFunction, services: PlatformServices) -> Result<Self> {
        tracing::info!(
            target: "nvme",
            "initializing controller [{:#06x}:{:#06x}]",
            pci::vendor_id(function),
            pci::device_id(function)
        );

        pci::enable(function);
        let mmio = pci::map_bar0(function)?;
        let regs = RegisterMap::new(mmio);

        let version = regs.version();
        tracing::info!(
            target: "nvme",
            major = version >> 16,
            minor = version >> 8 & 0xFF,
            "controller version"
        );

        let caps = ControllerCaps::decode(regs.cap());
        let queue_depth = MAX_QUEUE_DEPTH.min(caps.mqes as u32 + 1);
        tracing::debug!(
            target: "nvme",
            mqes = caps.mqes,
            dstrd = caps.dstrd,
            timeout_ms = caps.timeout_ms,
            mpsmin = caps.mpsmin,
            mpsmax = caps.mpsmax,
            queue_depth,
            "controller capabilities"
        );

        reset_if_needed(&regs, &caps, services.clock.as_ref());

        let admin = AdminQueue::new(
            &regs,
            queue_depth,
            services.memory.clone(),
            services.clock.clone(),
            caps.timeout_ms,
        )?;

        // Round-robin arbitration, 4 KiB pages, NVM command set, 64-byte
        // submission and 16-byte completion entries, enabled.
        let cc = 6 << CC_IOSQES_SHIFT | 4 << CC_IOCQES_SHIFT | CC_EN;
        regs.set_cc(cc);
        wait_for_ready(&regs, &caps, services.clock.as_ref())?;
        tracing::info!(target: "nvme", "controller enabled");

        let dispatcher = Arc::new(CompletionDispatcher::new());
        dispatcher.register(admin.queue().clone());

        Ok(Self {
            regs,
            caps,
            queue_depth,
            admin,
            dispatcher,
            services,
            cntlid: 0,
            max_transfer: None,
            engine: None,
            namespaces: Vec::new(),
        })
    }

    /// Route the function's interrupt line to the completion dispatcher.
    /// Must happen before `initialize`, which busy-waits on interrupt-driven
    /// completions.
    pub fn attach_interrupt(&self, function: &dyn PciFunction) {
        let line = pci::interrupt_line(function);
        self.services
            .interrupts
            .assign(line, self.dispatcher.clone());
        self.services.interrupts.unmask_line(line);
        tracing::debug!(target: "nvme", line, "interrupt line attached");
    }

    /// Phase two: identify the controller, create the I/O queue pair,
    /// enumerate and register namespaces.
    pub fn initialize(&mut self) -> Result<()> {
        let buffer = self.services.memory.map_io(PAGE_SIZE)?;
        buffer.zero();
        let mut data = vec![0u8; PAGE_SIZE];

        self.admin.identify(&buffer, CNS_CONTROLLER, 0)?;
        buffer.read_at(0, &mut data);
        let info = ControllerInfo::parse(&data);
        if info.cntlid == 0 {
            // Some controllers report 0 here, which makes Namespace Attach
            // fail with "invalid controller list"; the non-fatal attach
            // handling covers that.
            tracing::debug!(target: "nvme", "identify reports controller id 0");
        }
        self.cntlid = info.cntlid;
        self.max_transfer = match info.mdts {
            0 => None,
            mdts => Some((1usize << mdts) * self.caps.min_page_size()),
        };
        tracing::info!(
            target: "nvme",
            cntlid = self.cntlid,
            mdts = info.mdts,
            max_transfer = self.max_transfer,
            "identified controller"
        );

        let io_queue = self.admin.create_new_queue(
            &self.regs,
            IO_QUEUE_ID,
            self.queue_depth,
            self.services.clock.clone(),
            self.caps.timeout_ms,
        )?;
        self.dispatcher.register(io_queue.clone());
        let engine = Arc::new(IoEngine::new(
            io_queue,
            self.services.memory.clone(),
            self.max_transfer,
        ));
        self.engine = Some(engine.clone());

        self.admin.identify(&buffer, CNS_ACTIVE_NS_LIST, 0)?;
        buffer.read_at(0, &mut data);
        for nsid in parse_active_nsid_list(&data) {
            self.admin.identify(&buffer, CNS_NAMESPACE, nsid)?;
            buffer.read_at(0, &mut data);
            let ns_info = NamespaceInfo::parse(&data);
            tracing::info!(
                target: "nvme",
                nsid,
                blocks = ns_info.block_count,
                block_size = ns_info.block_size,
                "found namespace"
            );

            let namespace = Arc::new(Namespace::new(
                nsid,
                ns_info.block_count,
                ns_info.block_size,
                engine.clone(),
            ));
            self.admin.attach_namespace(self.cntlid, nsid)?;

            let name = self
                .services
                .storage
                .register_device(namespace.clone(), "nvme");
            tracing::info!(target: "nvme", nsid, name, "registered namespace");
            self.namespaces.push(namespace);
        }

        Ok(())
    }

    pub fn namespaces(&self) -> &[Arc<Namespace>] {
        &self.namespaces
    }

    pub fn cntlid(&self) -> u16 {
        self.cntlid
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    pub fn max_transfer(&self) -> Option<usize> {
        self.max_transfer
    }

    pub fn admin(&self) -> &AdminQueue {
        &self.admin
    }

    /// The I/O command engine, present once `initialize` has run.
    pub fn engine(&self) -> Option<&Arc<IoEngine>> {
        self.engine.as_ref()
    }
}

/// If the controller is already enabled (or faulted), shut it down and clear
/// EN so the admin queue can be reprogrammed. Failures here are logged and
/// bring-up continues; the enable step will report if the controller never
/// recovers.
fn reset_if_needed(regs: &RegisterMap, caps: &ControllerCaps, clock: &dyn Clock) {
    let csts = regs.csts();
    if csts & (CSTS_RDY | CSTS_CFS) == 0 {
        return;
    }

    let shst = csts >> CSTS_SHST_SHIFT & 0x3;
    if shst == SHST_NORMAL || csts & CSTS_CFS != 0 {
        tracing::info!(target: "nvme", csts, "shutting down running controller");
        regs.set_cc(regs.cc() & !CC_SHN_MASK | CC_SHN_ABRUPT);
        clock.sleep_ms(caps.timeout_ms);
        if shutdown_state(regs) != SHST_COMPLETE {
            clock.sleep_ms(caps.timeout_ms);
            if shutdown_state(regs) != SHST_COMPLETE {
                tracing::warn!(target: "nvme", "controller failed to shut down");
            }
        }
    }

    regs.set_cc(regs.cc() & !CC_EN);
    clock.sleep_ms(caps.timeout_ms);
    if regs.csts() & CSTS_RDY != 0 {
        clock.sleep_ms(caps.timeout_ms);
        if regs.csts() & CSTS_RDY != 0 {
            tracing::warn!(target: "nvme", "controller did not leave ready state");
        }
    }
}

fn shutdown_state(regs: &RegisterMap) -> u32 {
    regs.csts() >> CSTS_SHST_SHIFT & 0x3
}

/// Wait for CSTS.RDY after setting CC.EN, within the CAP.TO budget (doubled
/// once before giving up).
fn wait_for_ready(regs: &RegisterMap, caps: &ControllerCaps, clock: &dyn Clock) -> Result<()> {
    clock.sleep_ms(caps.timeout_ms);
    if regs.csts() & CSTS_RDY != 0 {
        return Ok(());
    }
    clock.sleep_ms(caps.timeout_ms);
    if regs.csts() & CSTS_RDY != 0 {
        return Ok(());
    }
    Err(NvmeError::EnableTimeout {
        timeout_ms: caps.timeout_ms,
    })
}
