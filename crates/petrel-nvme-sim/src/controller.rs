//! Simulated NVMe controller: BAR0 register file and command execution.
//!
//! State transitions (ready, shutdown) are driven by a [`VirtualClock`], so
//! the CC/CSTS handshake can be observed at millisecond resolution without
//! real waits. Queue depths, AQA fields and create-queue sizes are taken
//! exactly as the driver writes them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::clock::VirtualClock;
use crate::memory::SimMemory;

const PAGE_SIZE: usize = 4096;
const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;
const PRP_ENTRIES_PER_PAGE: usize = PAGE_SIZE / 8;

const SQE_BYTES: u64 = 64;
const CQE_BYTES: u64 = 16;

// Status codes (generic command set).
const SC_SUCCESS: u8 = 0x00;
const SC_INVALID_OPCODE: u8 = 0x01;
const SC_INVALID_FIELD: u8 = 0x02;
const SC_INVALID_NS: u8 = 0x0B;
const SC_INVALID_QID: u8 = 0x1C;
const SC_NS_ALREADY_ATTACHED: u8 = 0x18;
const SC_LBA_OUT_OF_RANGE: u8 = 0x80;

type Status = (u8, u8); // (sc, sct)
const OK: Status = (SC_SUCCESS, 0);

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub vendor_id: u16,
    pub device_id: u16,
    pub interrupt_line: u8,

    /// CAP.MQES, 0-based.
    pub mqes: u16,
    pub dstrd: u8,
    /// CAP.TO in 500 ms units.
    pub to_units: u8,
    pub mpsmin: u8,
    pub mpsmax: u8,

    /// Identify-controller MDTS; 0 = unlimited.
    pub mdts: u8,
    pub cntlid: u16,

    /// Virtual milliseconds between CC.EN=1 and CSTS.RDY=1.
    pub ready_delay_ms: u64,
    /// Virtual milliseconds between CC.SHN and CSTS.SHST = complete.
    pub shutdown_delay_ms: u64,
    /// Start with the controller already enabled and ready (hot reset
    /// scenarios).
    pub initially_enabled: bool,
    /// Report controller fatal status.
    pub cfs: bool,

    /// Fail Namespace Attach with "invalid field" (not supported).
    pub attach_unsupported: bool,
    /// Execute commands but never post completions (timeout scenarios).
    pub drop_completions: bool,

    pub memory_bytes: usize,
    pub clock_step_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x1DAD,
            device_id: 0x0001,
            interrupt_line: 11,
            mqes: 127,
            dstrd: 0,
            to_units: 8,
            mpsmin: 0,
            mpsmax: 0,
            mdts: 0,
            cntlid: 1,
            ready_delay_ms: 500,
            shutdown_delay_ms: 0,
            initially_enabled: false,
            cfs: false,
            attach_unsupported: false,
            drop_completions: false,
            memory_bytes: 32 << 20,
            clock_step_ms: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimNamespaceConfig {
    pub nsid: u32,
    pub blocks: u64,
    /// log2 of the block size (LBADS of format 0).
    pub lbads: u8,
    /// Already attached to the controller, so a Namespace Attach reports
    /// status 0x18.
    pub attached: bool,
}

struct SimNamespace {
    blocks: u64,
    lbads: u8,
    attached: bool,
    /// Sparse image: written blocks only, unwritten blocks read as zeros.
    data: HashMap<u64, Vec<u8>>,
}

impl SimNamespace {
    fn block_size(&self) -> usize {
        1usize << self.lbads
    }

    fn read_blocks(&self, lba: u64, count: usize) -> Vec<u8> {
        let bs = self.block_size();
        let mut out = vec![0u8; count * bs];
        for i in 0..count {
            if let Some(block) = self.data.get(&(lba + i as u64)) {
                out[i * bs..(i + 1) * bs].copy_from_slice(block);
            }
        }
        out
    }

    fn write_blocks(&mut self, lba: u64, data: &[u8]) {
        let bs = self.block_size();
        for (i, chunk) in data.chunks_exact(bs).enumerate() {
            self.data.insert(lba + i as u64, chunk.to_vec());
        }
    }
}

struct SubQueue {
    size: u32,
    base: u64,
    head: u32,
    tail: u32,
    cqid: u16,
}

struct CplQueue {
    size: u32,
    base: u64,
    head: u32,
    tail: u32,
    phase: bool,
    irq_enabled: bool,
}

/// Everything the driver put on the wire, for scenario assertions.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    /// Virtual timestamps of CSTS reads.
    pub csts_reads: Vec<u64>,
    /// (virtual timestamp, value) of CC writes.
    pub cc_writes: Vec<(u64, u32)>,
    /// (qid, value) of submission tail doorbell writes.
    pub sq_doorbells: Vec<(u16, u32)>,
    /// (qid, value) of completion head doorbell writes.
    pub cq_doorbells: Vec<(u16, u32)>,
    /// Every executed command, in order.
    pub commands: Vec<CapturedCommand>,
}

#[derive(Debug, Clone)]
pub struct CapturedCommand {
    pub qid: u16,
    pub opcode: u8,
    pub cid: u16,
    pub nsid: u32,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub sc: u8,
    pub sct: u8,
}

struct ParsedCommand {
    opc: u8,
    cid: u16,
    nsid: u32,
    prp1: u64,
    prp2: u64,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
}

impl ParsedCommand {
    fn parse(bytes: [u8; 64]) -> Self {
        let dw0 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        Self {
            opc: (dw0 & 0xFF) as u8,
            cid: (dw0 >> 16) as u16,
            nsid: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            prp1: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            prp2: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            cdw10: u32::from_le_bytes(bytes[40..44].try_into().unwrap()),
            cdw11: u32::from_le_bytes(bytes[44..48].try_into().unwrap()),
            cdw12: u32::from_le_bytes(bytes[48..52].try_into().unwrap()),
        }
    }
}

pub struct SimController {
    cfg: SimConfig,
    clock: Arc<VirtualClock>,
    memory: SimMemory,

    cap: u64,
    intms: u32,
    cc: u32,
    aqa: u32,
    asq: u64,
    acq: u64,

    enabled_since: Option<u64>,
    shutdown_since: Option<u64>,

    admin_sq: Option<SubQueue>,
    admin_cq: Option<CplQueue>,
    io_sqs: HashMap<u16, SubQueue>,
    io_cqs: HashMap<u16, CplQueue>,

    namespaces: BTreeMap<u32, SimNamespace>,

    intx_level: bool,
    pub stats: SimStats,
}

impl SimController {
    pub fn new(
        cfg: SimConfig,
        namespaces: Vec<SimNamespaceConfig>,
        memory: SimMemory,
        clock: Arc<VirtualClock>,
    ) -> Self {
        let cap = cfg.mqes as u64
            | (cfg.to_units as u64) << 24
            | (cfg.dstrd as u64) << 32
            | 1u64 << 37 // NVM command set
            | (cfg.mpsmin as u64) << 48
            | (cfg.mpsmax as u64) << 52;

        let namespaces = namespaces
            .into_iter()
            .map(|ns| {
                (
                    ns.nsid,
                    SimNamespace {
                        blocks: ns.blocks,
                        lbads: ns.lbads,
                        attached: ns.attached,
                        data: HashMap::new(),
                    },
                )
            })
            .collect();

        let mut ctrl = Self {
            cc: 0,
            cap,
            intms: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
            enabled_since: None,
            shutdown_since: None,
            admin_sq: None,
            admin_cq: None,
            io_sqs: HashMap::new(),
            io_cqs: HashMap::new(),
            namespaces,
            intx_level: false,
            stats: SimStats::default(),
            cfg,
            clock,
            memory,
        };
        if ctrl.cfg.initially_enabled {
            ctrl.cc = 1;
            ctrl.enabled_since = Some(0);
        }
        ctrl
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn aqa(&self) -> u32 {
        self.aqa
    }

    pub fn asq(&self) -> u64 {
        self.asq
    }

    pub fn acq(&self) -> u64 {
        self.acq
    }

    pub fn is_ready(&self) -> bool {
        self.ready()
    }

    pub fn set_drop_completions(&mut self, drop: bool) {
        self.cfg.drop_completions = drop;
    }

    pub fn attached(&self, nsid: u32) -> bool {
        self.namespaces.get(&nsid).is_some_and(|ns| ns.attached)
    }

    /// Preload or inspect a namespace image directly.
    pub fn write_namespace(&mut self, nsid: u32, lba: u64, data: &[u8]) {
        self.namespaces
            .get_mut(&nsid)
            .expect("unknown namespace")
            .write_blocks(lba, data);
    }

    pub fn read_namespace(&self, nsid: u32, lba: u64, blocks: usize) -> Vec<u8> {
        self.namespaces
            .get(&nsid)
            .expect("unknown namespace")
            .read_blocks(lba, blocks)
    }

    fn ready(&self) -> bool {
        match self.enabled_since {
            Some(at) => self.clock.now() >= at + self.cfg.ready_delay_ms,
            None => false,
        }
    }

    fn shst(&self) -> u32 {
        match self.shutdown_since {
            Some(at) if self.clock.now() >= at + self.cfg.shutdown_delay_ms => 0b10,
            Some(_) => 0b01,
            None => 0b00,
        }
    }

    fn csts(&mut self) -> u32 {
        self.stats.csts_reads.push(self.clock.now());
        let mut csts = 0;
        if self.ready() {
            csts |= 1;
        }
        if self.cfg.cfs {
            csts |= 1 << 1;
        }
        csts | self.shst() << 2
    }

    pub fn mmio_read32(&mut self, offset: u64) -> u32 {
        match offset {
            0x00 => self.cap as u32,
            0x04 => (self.cap >> 32) as u32,
            0x08 => 0x0001_0400, // NVMe 1.4.0
            0x0C => self.intms,
            0x10 => 0, // INTMC is write-only
            0x14 => self.cc,
            0x1C => self.csts(),
            0x24 => self.aqa,
            0x28 => self.asq as u32,
            0x2C => (self.asq >> 32) as u32,
            0x30 => self.acq as u32,
            0x34 => (self.acq >> 32) as u32,
            _ => 0,
        }
    }

    /// Apply a register write. Returns true when the interrupt level rose,
    /// in which case the caller delivers the interrupt.
    pub fn mmio_write32(&mut self, offset: u64, value: u32) -> bool {
        let level_before = self.intx_level;
        match offset {
            0x0C => self.intms |= value,
            0x10 => self.intms &= !value,
            0x14 => self.write_cc(value),
            0x24 if self.cc & 1 == 0 => self.aqa = value,
            0x28 if self.cc & 1 == 0 => {
                self.asq = self.asq & !0xFFFF_FFFF | value as u64;
            }
            0x2C if self.cc & 1 == 0 => {
                self.asq = self.asq & 0xFFFF_FFFF | (value as u64) << 32;
            }
            0x30 if self.cc & 1 == 0 => {
                self.acq = self.acq & !0xFFFF_FFFF | value as u64;
            }
            0x34 if self.cc & 1 == 0 => {
                self.acq = self.acq & 0xFFFF_FFFF | (value as u64) << 32;
            }
            _ if offset >= 0x1000 => self.write_doorbell(offset, value),
            _ => {}
        }
        self.intx_level = self.compute_intx();
        !level_before && self.intx_level
    }

    fn write_cc(&mut self, value: u32) {
        self.stats.cc_writes.push((self.clock.now(), value));

        let was_enabled = self.cc & 1 != 0;
        if value >> 14 & 0x3 != 0 && self.shutdown_since.is_none() {
            self.shutdown_since = Some(self.clock.now());
        }
        self.cc = value;

        let enabled = value & 1 != 0;
        if enabled && !was_enabled {
            self.enable();
        } else if !enabled && was_enabled {
            self.disable();
        }
    }

    fn enable(&mut self) {
        // Admin queue bases must be configured and page aligned; the depths
        // arrive in AQA exactly as the driver wrote them.
        let asqs = self.aqa & 0xFFF;
        let acqs = self.aqa >> 16 & 0xFFF;
        if asqs == 0 || acqs == 0 || self.asq == 0 || self.acq == 0 {
            return;
        }
        if self.asq & PAGE_MASK != 0 || self.acq & PAGE_MASK != 0 {
            return;
        }

        self.admin_sq = Some(SubQueue {
            size: asqs,
            base: self.asq,
            head: 0,
            tail: 0,
            cqid: 0,
        });
        self.admin_cq = Some(CplQueue {
            size: acqs,
            base: self.acq,
            head: 0,
            tail: 0,
            phase: true,
            irq_enabled: true,
        });
        self.io_sqs.clear();
        self.io_cqs.clear();
        self.shutdown_since = None;
        self.enabled_since = Some(self.clock.now());
    }

    fn disable(&mut self) {
        self.enabled_since = None;
        self.admin_sq = None;
        self.admin_cq = None;
        self.io_sqs.clear();
        self.io_cqs.clear();
    }

    fn write_doorbell(&mut self, offset: u64, value: u32) {
        if !self.ready() {
            return;
        }
        let stride = 4u64 << self.cfg.dstrd;
        let index = (offset - 0x1000) / stride;
        let qid = (index / 2) as u16;
        if index % 2 == 1 {
            self.stats.cq_doorbells.push((qid, value));
            if let Some(cq) = self.cq_mut(qid) {
                cq.head = value;
            }
            return;
        }

        self.stats.sq_doorbells.push((qid, value));
        if let Some(sq) = self.sq_mut(qid) {
            sq.tail = value;
        }
        self.process_sq(qid);
    }

    fn sq_mut(&mut self, qid: u16) -> Option<&mut SubQueue> {
        if qid == 0 {
            self.admin_sq.as_mut()
        } else {
            self.io_sqs.get_mut(&qid)
        }
    }

    fn cq_mut(&mut self, qid: u16) -> Option<&mut CplQueue> {
        if qid == 0 {
            self.admin_cq.as_mut()
        } else {
            self.io_cqs.get_mut(&qid)
        }
    }

    fn process_sq(&mut self, qid: u16) {
        loop {
            let (base, head, tail, size, cqid) = match self.sq_mut(qid) {
                Some(sq) => (sq.base, sq.head, sq.tail, sq.size, sq.cqid),
                None => return,
            };
            if head == tail {
                break;
            }

            let mut bytes = [0u8; 64];
            self.memory.read_phys(base + head as u64 * SQE_BYTES, &mut bytes);
            let cmd = ParsedCommand::parse(bytes);

            let (sc, sct, dw0) = if qid == 0 {
                self.execute_admin(&cmd)
            } else {
                self.execute_io(&cmd)
            };

            let new_head = (head + 1) % size;
            if let Some(sq) = self.sq_mut(qid) {
                sq.head = new_head;
            }

            tracing::trace!(
                target: "nvme_sim",
                qid,
                opcode = cmd.opc,
                cid = cmd.cid,
                sc,
                sct,
                "executed command"
            );

            self.stats.commands.push(CapturedCommand {
                qid,
                opcode: cmd.opc,
                cid: cmd.cid,
                nsid: cmd.nsid,
                prp1: cmd.prp1,
                prp2: cmd.prp2,
                cdw10: cmd.cdw10,
                cdw11: cmd.cdw11,
                cdw12: cmd.cdw12,
                sc,
                sct,
            });

            if !self.cfg.drop_completions {
                self.post_completion(cqid, qid, new_head, cmd.cid, (sc, sct), dw0);
            }
        }
    }

    fn post_completion(
        &mut self,
        cqid: u16,
        sq_id: u16,
        sq_head: u32,
        cid: u16,
        status: Status,
        dw0: u32,
    ) {
        let memory = self.memory.clone();
        let cq = match self.cq_mut(cqid) {
            Some(cq) => cq,
            None => return,
        };

        let next_tail = (cq.tail + 1) % cq.size;
        if next_tail == cq.head {
            // Completion queue full; the host is expected to prevent this.
            return;
        }

        let (sc, sct) = status;
        let raw: u16 = (sct as u16) << 9 | (sc as u16) << 1 | cq.phase as u16;
        let mut entry = [0u8; 16];
        entry[0..4].copy_from_slice(&dw0.to_le_bytes());
        entry[8..12].copy_from_slice(&((sq_id as u32) << 16 | sq_head).to_le_bytes());
        entry[12..16].copy_from_slice(&((raw as u32) << 16 | cid as u32).to_le_bytes());
        memory.write_phys(cq.base + cq.tail as u64 * CQE_BYTES, &entry);

        cq.tail = next_tail;
        if cq.tail == 0 {
            cq.phase = !cq.phase;
        }
    }

    fn compute_intx(&self) -> bool {
        let pending = |qid: u16, cq: &CplQueue| {
            cq.head != cq.tail && cq.irq_enabled && self.intms >> qid & 1 == 0
        };
        if let Some(cq) = &self.admin_cq {
            if pending(0, cq) {
                return true;
            }
        }
        self.io_cqs.iter().any(|(qid, cq)| pending(*qid, cq))
    }

    // ---- Admin command set -------------------------------------------------

    fn execute_admin(&mut self, cmd: &ParsedCommand) -> (u8, u8, u32) {
        let (sc, sct) = match cmd.opc {
            0x06 => self.cmd_identify(cmd),
            0x15 => self.cmd_ns_attach(cmd),
            0x05 => self.cmd_create_io_cq(cmd),
            0x01 => self.cmd_create_io_sq(cmd),
            _ => (SC_INVALID_OPCODE, 0),
        };
        (sc, sct, 0)
    }

    fn cmd_identify(&mut self, cmd: &ParsedCommand) -> Status {
        let cns = cmd.cdw10 & 0xFFFF;
        let data = match cns {
            0x01 => self.identify_controller(),
            0x02 => self.identify_active_list(),
            0x00 => match self.identify_namespace(cmd.nsid) {
                Some(data) => data,
                None => return (SC_INVALID_NS, 0),
            },
            _ => return (SC_INVALID_FIELD, 0),
        };
        self.dma_write(cmd.prp1, cmd.prp2, &data)
    }

    fn identify_controller(&self) -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        data[0..2].copy_from_slice(&self.cfg.vendor_id.to_le_bytes());
        data[2..4].copy_from_slice(&self.cfg.vendor_id.to_le_bytes());
        write_ascii_padded(&mut data[4..24], "PTRLSIM000000000001");
        write_ascii_padded(&mut data[24..64], "Petrel simulated NVMe controller");
        write_ascii_padded(&mut data[64..72], "0.1");
        data[77] = self.cfg.mdts;
        data[78..80].copy_from_slice(&self.cfg.cntlid.to_le_bytes());
        data[516..520].copy_from_slice(&(self.namespaces.len() as u32).to_le_bytes());
        data
    }

    fn identify_active_list(&self) -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        for (i, nsid) in self.namespaces.keys().take(PAGE_SIZE / 4).enumerate() {
            data[i * 4..i * 4 + 4].copy_from_slice(&nsid.to_le_bytes());
        }
        data
    }

    fn identify_namespace(&self, nsid: u32) -> Option<Vec<u8>> {
        let ns = self.namespaces.get(&nsid)?;
        let mut data = vec![0u8; PAGE_SIZE];
        data[0..8].copy_from_slice(&ns.blocks.to_le_bytes()); // NSZE
        data[8..16].copy_from_slice(&ns.blocks.to_le_bytes()); // NCAP
        data[16..24].copy_from_slice(&ns.blocks.to_le_bytes()); // NUSE
        data[26] = 0; // FLBAS: format 0
        data[128..132].copy_from_slice(&((ns.lbads as u32) << 16).to_le_bytes()); // LBAF0
        Some(data)
    }

    fn cmd_ns_attach(&mut self, cmd: &ParsedCommand) -> Status {
        if cmd.cdw10 & 0xF != 0 {
            // Only attach (SEL=0) is modelled.
            return (SC_INVALID_FIELD, 0);
        }
        if self.cfg.attach_unsupported {
            return (SC_INVALID_FIELD, 0);
        }

        let mut list = [0u8; 4];
        self.memory.read_phys(cmd.prp1, &mut list);
        let count = u16::from_le_bytes(list[0..2].try_into().unwrap());
        let cntlid = u16::from_le_bytes(list[2..4].try_into().unwrap());
        if count != 1 || cntlid != self.cfg.cntlid {
            return (SC_INVALID_QID, 0);
        }

        match self.namespaces.get_mut(&cmd.nsid) {
            Some(ns) if ns.attached => (SC_NS_ALREADY_ATTACHED, 0),
            Some(ns) => {
                ns.attached = true;
                OK
            }
            None => (SC_INVALID_NS, 0),
        }
    }

    fn cmd_create_io_cq(&mut self, cmd: &ParsedCommand) -> Status {
        let qid = (cmd.cdw10 & 0xFFFF) as u16;
        let size = cmd.cdw10 >> 16;
        if qid == 0 || size == 0 || size > self.cfg.mqes as u32 + 1 {
            return (SC_INVALID_FIELD, 0);
        }
        if cmd.prp1 == 0 || cmd.prp1 & PAGE_MASK != 0 {
            return (SC_INVALID_FIELD, 0);
        }

        self.io_cqs.insert(
            qid,
            CplQueue {
                size,
                base: cmd.prp1,
                head: 0,
                tail: 0,
                phase: true,
                irq_enabled: cmd.cdw11 & 0x2 != 0,
            },
        );
        OK
    }

    fn cmd_create_io_sq(&mut self, cmd: &ParsedCommand) -> Status {
        let qid = (cmd.cdw10 & 0xFFFF) as u16;
        let size = cmd.cdw10 >> 16;
        if qid == 0 || size == 0 || size > self.cfg.mqes as u32 + 1 {
            return (SC_INVALID_FIELD, 0);
        }
        if cmd.prp1 == 0 || cmd.prp1 & PAGE_MASK != 0 {
            return (SC_INVALID_FIELD, 0);
        }

        let cqid = (cmd.cdw11 >> 16) as u16;
        if !self.io_cqs.contains_key(&cqid) {
            return (SC_INVALID_QID, 0);
        }

        self.io_sqs.insert(
            qid,
            SubQueue {
                size,
                base: cmd.prp1,
                head: 0,
                tail: 0,
                cqid,
            },
        );
        OK
    }

    // ---- NVM command set ---------------------------------------------------

    fn execute_io(&mut self, cmd: &ParsedCommand) -> (u8, u8, u32) {
        let (sc, sct) = match cmd.opc {
            0x02 => self.cmd_read(cmd),
            0x01 => self.cmd_write(cmd),
            _ => (SC_INVALID_OPCODE, 0),
        };
        (sc, sct, 0)
    }

    fn rw_extent(&self, cmd: &ParsedCommand) -> Result<(u64, usize, usize), Status> {
        let ns = match self.namespaces.get(&cmd.nsid) {
            Some(ns) => ns,
            None => return Err((SC_INVALID_NS, 0)),
        };
        let slba = (cmd.cdw11 as u64) << 32 | cmd.cdw10 as u64;
        let blocks = (cmd.cdw12 & 0xFFFF) as usize + 1;
        if slba + blocks as u64 > ns.blocks {
            return Err((SC_LBA_OUT_OF_RANGE, 0));
        }
        Ok((slba, blocks, ns.block_size()))
    }

    fn cmd_read(&mut self, cmd: &ParsedCommand) -> Status {
        let (slba, blocks, _) = match self.rw_extent(cmd) {
            Ok(extent) => extent,
            Err(status) => return status,
        };
        let data = self.namespaces[&cmd.nsid].read_blocks(slba, blocks);
        self.dma_write(cmd.prp1, cmd.prp2, &data)
    }

    fn cmd_write(&mut self, cmd: &ParsedCommand) -> Status {
        let (slba, blocks, bs) = match self.rw_extent(cmd) {
            Ok(extent) => extent,
            Err(status) => return status,
        };
        let mut data = vec![0u8; blocks * bs];
        if let Err(status) = self.dma_read(cmd.prp1, cmd.prp2, &mut data) {
            return status;
        }
        self.namespaces
            .get_mut(&cmd.nsid)
            .expect("extent checked")
            .write_blocks(slba, &data);
        OK
    }

    // ---- PRP handling ------------------------------------------------------

    /// Resolve the PRP fields of a command into (address, length) segments,
    /// following the host driver's conventions: one page in PRP1, two pages
    /// in PRP1+PRP2, larger transfers as a chained list with PRP1 = list
    /// base (PRP2 then duplicates the first data pointer).
    fn prp_segments(&self, prp1: u64, prp2: u64, len: usize) -> Result<Vec<(u64, usize)>, Status> {
        let check = |addr: u64| -> Result<(), Status> {
            if addr == 0 || addr & PAGE_MASK != 0 {
                Err((SC_INVALID_FIELD, 0))
            } else {
                Ok(())
            }
        };

        let pages = (len + PAGE_SIZE - 1) / PAGE_SIZE;
        if pages <= 1 {
            check(prp1)?;
            return Ok(vec![(prp1, len)]);
        }
        if pages == 2 {
            check(prp1)?;
            check(prp2)?;
            return Ok(vec![(prp1, PAGE_SIZE), (prp2, len - PAGE_SIZE)]);
        }

        check(prp1)?;
        let mut segments = Vec::with_capacity(pages);
        let mut remaining = len;
        let mut list_addr = prp1;
        'lists: loop {
            for slot in 0..PRP_ENTRIES_PER_PAGE {
                let entry = self
                    .memory
                    .read_phys_u64(list_addr + slot as u64 * 8);
                check(entry)?;
                if slot == PRP_ENTRIES_PER_PAGE - 1 {
                    // Last slot of a list page links onward whenever data
                    // pages remain, and we only get here if they do.
                    list_addr = entry;
                    continue 'lists;
                }
                let chunk = remaining.min(PAGE_SIZE);
                segments.push((entry, chunk));
                remaining -= chunk;
                if remaining == 0 {
                    break 'lists;
                }
            }
        }
        Ok(segments)
    }

    fn dma_write(&self, prp1: u64, prp2: u64, data: &[u8]) -> Status {
        let segments = match self.prp_segments(prp1, prp2, data.len()) {
            Ok(segments) => segments,
            Err(status) => return status,
        };
        let mut offset = 0;
        for (addr, len) in segments {
            self.memory.write_phys(addr, &data[offset..offset + len]);
            offset += len;
        }
        OK
    }

    fn dma_read(&self, prp1: u64, prp2: u64, data: &mut [u8]) -> Result<(), Status> {
        let segments = self.prp_segments(prp1, prp2, data.len())?;
        let mut offset = 0;
        for (addr, len) in segments {
            self.memory.read_phys(addr, &mut data[offset..offset + len]);
            offset += len;
        }
        Ok(())
    }
}

fn write_ascii_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let bytes = s.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}
