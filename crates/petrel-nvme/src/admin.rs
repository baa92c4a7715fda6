//! Admin command set, on queue pair 0.
//!
//! The admin queue is constructed while the controller is disabled; its ring
//! bases go into ASQ/ACQ and its depth into AQA before CC.EN is set. Every
//! operation here is synchronous: build the command, ring the doorbell, wait
//! for the completion, inspect the status.

use std::sync::Arc;

use petrel_platform::{Clock, DmaRegion, MemoryService};

use crate::cmd::{
    Command, Completion, OPC_ADMIN_CREATE_IO_CQ, OPC_ADMIN_CREATE_IO_SQ, OPC_ADMIN_IDENTIFY,
    OPC_ADMIN_NS_ATTACH, SC_INVALID_FIELD, SC_NS_ALREADY_ATTACHED,
};
use crate::error::{NvmeError, Result};
use crate::queue::QueuePair;
use crate::regs::RegisterMap;

/// Result of a Namespace Attach. "Already attached" and "not supported" are
/// ordinary outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    AlreadyAttached,
    Unsupported,
}

pub struct AdminQueue {
    queue: Arc<QueuePair>,
    memory: Arc<dyn MemoryService>,
}

impl AdminQueue {
    /// Build queue pair 0 and program AQA/ASQ/ACQ. Must run while the
    /// controller is disabled; the controller enables afterwards.
    pub fn new(
        regs: &RegisterMap,
        depth: u32,
        memory: Arc<dyn MemoryService>,
        clock: Arc<dyn Clock>,
        timeout_ms: u64,
    ) -> Result<Self> {
        regs.set_aqa(depth << 16 | depth);

        let queue = Arc::new(QueuePair::new(
            regs.clone(),
            0,
            depth,
            memory.as_ref(),
            clock,
            timeout_ms,
        )?);
        regs.set_asq(queue.sq_phys());
        regs.set_acq(queue.cq_phys());

        tracing::info!(target: "nvme::admin", depth, "initialized admin queue");
        Ok(Self { queue, memory })
    }

    pub fn queue(&self) -> &Arc<QueuePair> {
        &self.queue
    }

    fn submit(&self, command: &Command) -> Result<Completion> {
        self.queue.submit_and_wait(command)
    }

    fn submit_expect_success(&self, command: &Command) -> Result<Completion> {
        let entry = self.submit(command)?;
        if entry.is_success() {
            Ok(entry)
        } else {
            tracing::warn!(
                target: "nvme::admin",
                opcode = command.opcode,
                sc = entry.status_code(),
                sct = entry.status_code_type(),
                "admin command failed"
            );
            Err(NvmeError::CommandFailed {
                sc: entry.status_code(),
                sct: entry.status_code_type(),
            })
        }
    }

    /// Identify (opcode 0x06). `buffer` must be a page-aligned 4 KiB region;
    /// `cns` selects the data structure (controller, namespace, active
    /// namespace id list), `nsid` qualifies it where applicable.
    pub fn identify(&self, buffer: &DmaRegion, cns: u16, nsid: u32) -> Result<()> {
        tracing::trace!(target: "nvme::admin", cns, nsid, "identify");
        self.submit_expect_success(&Command {
            opcode: OPC_ADMIN_IDENTIFY,
            nsid,
            prp1: buffer.phys_addr(),
            cdw10: cns as u32,
            ..Default::default()
        })?;
        Ok(())
    }

    /// Namespace Attach (opcode 0x15): attach `nsid` to the controller
    /// identified by `controller_id`. The payload is a controller id list
    /// with one entry.
    pub fn attach_namespace(&self, controller_id: u16, nsid: u32) -> Result<AttachOutcome> {
        let list = self.memory.map_io(petrel_platform::PAGE_SIZE)?;
        list.zero();
        list.write_u16_at(0, 1);
        list.write_u16_at(2, controller_id);

        let entry = self.submit(&Command {
            opcode: OPC_ADMIN_NS_ATTACH,
            nsid,
            prp1: list.phys_addr(),
            cdw10: 0, // attach
            ..Default::default()
        })?;

        match (entry.status_code_type(), entry.status_code()) {
            (0, 0) => Ok(AttachOutcome::Attached),
            (_, SC_NS_ALREADY_ATTACHED) => {
                tracing::info!(target: "nvme::admin", nsid, "namespace already attached");
                Ok(AttachOutcome::AlreadyAttached)
            }
            (_, SC_INVALID_FIELD) => {
                tracing::info!(target: "nvme::admin", nsid, "namespace attach not supported");
                Ok(AttachOutcome::Unsupported)
            }
            (sct, sc) => Err(NvmeError::CommandFailed { sc, sct }),
        }
    }

    fn create_io_completion_queue(&self, qid: u16, depth: u32, cq_phys: u64) -> Result<()> {
        self.submit_expect_success(&Command {
            opcode: OPC_ADMIN_CREATE_IO_CQ,
            prp1: cq_phys,
            cdw10: depth << 16 | qid as u32,
            // Interrupt vector 0, interrupts enabled, physically contiguous.
            cdw11: 1 << 1 | 1,
            ..Default::default()
        })?;
        Ok(())
    }

    fn create_io_submission_queue(&self, qid: u16, depth: u32, sq_phys: u64, cq_id: u16) -> Result<()> {
        self.submit_expect_success(&Command {
            opcode: OPC_ADMIN_CREATE_IO_SQ,
            prp1: sq_phys,
            cdw10: depth << 16 | qid as u32,
            // Completion queue binding, urgent priority, physically
            // contiguous.
            cdw11: (cq_id as u32) << 16 | 3 << 1 | 1,
            ..Default::default()
        })?;
        Ok(())
    }

    /// Allocate an I/O queue pair and announce it to the controller. The
    /// completion queue must exist before the submission queue that
    /// references it.
    pub fn create_new_queue(
        &self,
        regs: &RegisterMap,
        qid: u16,
        depth: u32,
        clock: Arc<dyn Clock>,
        timeout_ms: u64,
    ) -> Result<Arc<QueuePair>> {
        let queue = Arc::new(QueuePair::new(
            regs.clone(),
            qid,
            depth,
            self.memory.as_ref(),
            clock,
            timeout_ms,
        )?);
        self.create_io_completion_queue(qid, depth, queue.cq_phys())?;
        self.create_io_submission_queue(qid, depth, queue.sq_phys(), qid)?;
        tracing::info!(target: "nvme::admin", qid, depth, "created i/o queue pair");
        Ok(queue)
    }
}

/// Fields of the identify-controller data structure the driver consumes.
#[derive(Debug, Clone, Copy)]
pub struct ControllerInfo {
    /// Maximum data transfer size, as a power-of-two multiple of the minimum
    /// page size. 0 means no limit.
    pub mdts: u8,
    /// Controller id, used for Namespace Attach.
    pub cntlid: u16,
}

impl ControllerInfo {
    pub fn parse(data: &[u8]) -> Self {
        Self {
            mdts: data[77],
            cntlid: u16::from_le_bytes(data[78..80].try_into().unwrap()),
        }
    }
}

/// Fields of the identify-namespace data structure the driver consumes.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceInfo {
    pub block_count: u64,
    pub block_size: u32,
}

impl NamespaceInfo {
    pub fn parse(data: &[u8]) -> Self {
        let nsze = u64::from_le_bytes(data[0..8].try_into().unwrap());
        // FLBAS low nibble indexes the LBA format table at byte 128; LBADS
        // sits in bits 16..24 of the entry.
        let format = (data[26] & 0x0F) as usize;
        let entry = u32::from_le_bytes(data[128 + 4 * format..132 + 4 * format].try_into().unwrap());
        let lbads = (entry >> 16 & 0xFF) as u32;
        Self {
            block_count: nsze,
            block_size: 1 << lbads,
        }
    }
}

/// Decode the active namespace id list: non-zero ids, zero-terminated.
pub fn parse_active_nsid_list(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .take_while(|&nsid| nsid != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn controller_info_offsets() {
        let mut data = vec![0u8; 4096];
        data[77] = 5;
        data[78..80].copy_from_slice(&7u16.to_le_bytes());
        let info = ControllerInfo::parse(&data);
        assert_eq!(info.mdts, 5);
        assert_eq!(info.cntlid, 7);
    }

    #[test]
    fn namespace_info_uses_selected_lba_format() {
        let mut data = vec![0u8; 4096];
        data[0..8].copy_from_slice(&1_048_576u64.to_le_bytes());
        data[26] = 0x01; // format index 1
        data[128..132].copy_from_slice(&(9u32 << 16).to_le_bytes()); // 512 B
        data[132..136].copy_from_slice(&(12u32 << 16).to_le_bytes()); // 4 KiB
        let info = NamespaceInfo::parse(&data);
        assert_eq!(info.block_count, 1_048_576);
        assert_eq!(info.block_size, 4096);
    }

    #[test]
    fn active_nsid_list_stops_at_zero() {
        let mut data = vec![0u8; 4096];
        data[0..4].copy_from_slice(&3u32.to_le_bytes());
        data[4..8].copy_from_slice(&5u32.to_le_bytes());
        assert_eq!(parse_active_nsid_list(&data), vec![3, 5]);
    }
}
