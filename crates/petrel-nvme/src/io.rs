//! I/O command engine: read/write splitting, staging buffers, PRP
//! construction.
//!
//! Callers hand in ordinary byte slices; each command gets a freshly
//! allocated page-aligned staging region so the hardware only ever sees
//! page-aligned, physically contiguous transfers. A request larger than the
//! per-command block cap is split into several commands with advancing
//! starting LBAs.

use std::sync::Arc;

use petrel_platform::{DmaRegion, MemoryService, PAGE_SIZE};

use crate::cmd::{Command, OPC_NVM_READ, OPC_NVM_WRITE};
use crate::error::{NvmeError, Result};
use crate::queue::QueuePair;

/// A single NVMe read/write carries a zero-based 16-bit block count.
pub const MAX_BLOCKS_PER_COMMAND: u32 = 1 << 16;

/// Pointers of one 4 KiB PRP-list page. The last slot of a non-final page
/// links to the next page, so it carries one data pointer fewer.
const PRP_ENTRIES_PER_PAGE: usize = PAGE_SIZE / 8;
const PRP_DATA_ENTRIES_PER_PAGE: usize = PRP_ENTRIES_PER_PAGE - 1;

pub struct IoEngine {
    queue: Arc<QueuePair>,
    memory: Arc<dyn MemoryService>,
    /// Maximum bytes per command from identify MDTS; `None` when the
    /// controller reports no limit.
    max_transfer: Option<usize>,
}

impl IoEngine {
    pub fn new(
        queue: Arc<QueuePair>,
        memory: Arc<dyn MemoryService>,
        max_transfer: Option<usize>,
    ) -> Self {
        Self {
            queue,
            memory,
            max_transfer,
        }
    }

    /// Largest block count a single command may carry for this block size.
    pub fn blocks_per_command(&self, block_size: u32) -> u32 {
        per_command_cap(block_size, self.max_transfer)
    }

    /// Read `count` blocks starting at `start_lba` into `buffer`. Returns
    /// the number of blocks read: all of them, or 0 on failure.
    pub fn read(
        &self,
        nsid: u32,
        block_size: u32,
        buffer: &mut [u8],
        start_lba: u64,
        count: u32,
    ) -> u32 {
        if count == 0 {
            return 0;
        }
        if buffer.len() < count as usize * block_size as usize {
            tracing::warn!(target: "nvme", nsid, count, "read buffer smaller than request");
            return 0;
        }

        let per_command = self.blocks_per_command(block_size);
        let mut done = 0u32;
        while done < count {
            let chunk = per_command.min(count - done);
            let offset = done as usize * block_size as usize;
            let bytes = chunk as usize * block_size as usize;
            if let Err(err) = self.read_command(
                nsid,
                block_size,
                start_lba + done as u64,
                chunk,
                &mut buffer[offset..offset + bytes],
            ) {
                tracing::warn!(target: "nvme", nsid, start_lba, count, %err, "read failed");
                return 0;
            }
            done += chunk;
        }
        count
    }

    /// Write `count` blocks starting at `start_lba` from `buffer`. Returns
    /// the number of blocks written: all of them, or 0 on failure.
    pub fn write(
        &self,
        nsid: u32,
        block_size: u32,
        buffer: &[u8],
        start_lba: u64,
        count: u32,
    ) -> u32 {
        if count == 0 {
            return 0;
        }
        if buffer.len() < count as usize * block_size as usize {
            tracing::warn!(target: "nvme", nsid, count, "write buffer smaller than request");
            return 0;
        }

        let per_command = self.blocks_per_command(block_size);
        let mut done = 0u32;
        while done < count {
            let chunk = per_command.min(count - done);
            let offset = done as usize * block_size as usize;
            let bytes = chunk as usize * block_size as usize;
            if let Err(err) = self.write_command(
                nsid,
                block_size,
                start_lba + done as u64,
                chunk,
                &buffer[offset..offset + bytes],
            ) {
                tracing::warn!(target: "nvme", nsid, start_lba, count, %err, "write failed");
                return 0;
            }
            done += chunk;
        }
        count
    }

    fn read_command(
        &self,
        nsid: u32,
        block_size: u32,
        start_lba: u64,
        blocks: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let bytes = blocks as usize * block_size as usize;
        let staging = self.memory.map_io(bytes)?;
        let prp = PrpTransfer::build(self.memory.as_ref(), &staging, bytes)?;

        self.submit_rw(OPC_NVM_READ, nsid, start_lba, blocks, &prp)?;
        staging.read_at(0, out);
        Ok(())
    }

    fn write_command(
        &self,
        nsid: u32,
        block_size: u32,
        start_lba: u64,
        blocks: u32,
        data: &[u8],
    ) -> Result<()> {
        let bytes = blocks as usize * block_size as usize;
        let staging = self.memory.map_io(bytes)?;
        staging.write_at(0, data);
        let prp = PrpTransfer::build(self.memory.as_ref(), &staging, bytes)?;

        self.submit_rw(OPC_NVM_WRITE, nsid, start_lba, blocks, &prp)
    }

    fn submit_rw(
        &self,
        opcode: u8,
        nsid: u32,
        start_lba: u64,
        blocks: u32,
        prp: &PrpTransfer,
    ) -> Result<()> {
        let entry = self.queue.submit_and_wait(&Command {
            opcode,
            nsid,
            prp1: prp.prp1,
            prp2: prp.prp2,
            cdw10: start_lba as u32,
            cdw11: (start_lba >> 32) as u32,
            // Zero-based block count; no protection info, FUA or limited
            // retry.
            cdw12: blocks - 1,
            ..Default::default()
        })?;

        if entry.is_success() {
            Ok(())
        } else {
            Err(NvmeError::CommandFailed {
                sc: entry.status_code(),
                sct: entry.status_code_type(),
            })
        }
    }
}

/// Largest block count a single command may carry: the 16-bit field
/// ceiling, tightened by the MDTS-derived transfer limit when the controller
/// reports one.
pub(crate) fn per_command_cap(block_size: u32, max_transfer: Option<usize>) -> u32 {
    let cap = MAX_BLOCKS_PER_COMMAND as u64;
    let limit = match max_transfer {
        Some(bytes) => (bytes as u64 / block_size as u64).max(1),
        None => cap,
    };
    cap.min(limit) as u32
}

/// PRP pointers for one command, keeping the list region (if any) alive
/// until the command has completed.
pub(crate) struct PrpTransfer {
    pub prp1: u64,
    pub prp2: u64,
    _list: Option<DmaRegion>,
}

impl PrpTransfer {
    /// Describe `bytes` bytes of the page-aligned region `data`:
    /// one page in PRP1 alone, two pages in PRP1+PRP2, anything larger via a
    /// chained PRP list (PRP1 = list base, PRP2 = first data page).
    pub(crate) fn build(
        memory: &dyn MemoryService,
        data: &DmaRegion,
        bytes: usize,
    ) -> Result<Self> {
        let pages = (bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        match pages {
            0 | 1 => Ok(Self {
                prp1: data.phys_addr(),
                prp2: 0,
                _list: None,
            }),
            2 => Ok(Self {
                prp1: data.phys_addr(),
                prp2: data.phys_addr() + PAGE_SIZE as u64,
                _list: None,
            }),
            _ => {
                let list_pages = (pages + PRP_DATA_ENTRIES_PER_PAGE - 1) / PRP_DATA_ENTRIES_PER_PAGE;
                let slots = pages + list_pages - 1;
                let list = memory.map_io(slots * 8)?;
                list.zero();

                for (slot, entry) in
                    prp_list_entries(list.phys_addr(), data.phys_addr(), pages).enumerate()
                {
                    list.write_u64_at(slot * 8, entry);
                }

                Ok(Self {
                    prp1: list.phys_addr(),
                    prp2: data.phys_addr(),
                    _list: Some(list),
                })
            }
        }
    }
}

/// The slot-by-slot contents of a chained PRP list: one pointer per data
/// page, with the last slot of a list page linking to the next list page
/// whenever data pages remain.
pub(crate) fn prp_list_entries(
    list_base: u64,
    data_base: u64,
    data_pages: usize,
) -> impl Iterator<Item = u64> {
    let mut slot = 0usize;
    let mut page = 0usize;
    std::iter::from_fn(move || {
        if page == data_pages {
            return None;
        }
        let entry = if slot % PRP_ENTRIES_PER_PAGE == PRP_ENTRIES_PER_PAGE - 1 {
            let next_list_page = slot / PRP_ENTRIES_PER_PAGE + 1;
            list_base + (next_list_page * PAGE_SIZE) as u64
        } else {
            let entry = data_base + (page * PAGE_SIZE) as u64;
            page += 1;
            entry
        };
        slot += 1;
        Some(entry)
    })
}
