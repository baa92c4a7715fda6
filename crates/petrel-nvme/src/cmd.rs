//! Command and completion wire formats.
//!
//! Submission entries are 64 bytes, completion entries 16 bytes, both
//! little-endian. Entries are encoded to and decoded from byte arrays at the
//! ring boundary; nothing in the driver aliases ring memory as structs.

/// Admin opcodes.
pub const OPC_ADMIN_CREATE_IO_SQ: u8 = 0x01;
pub const OPC_ADMIN_CREATE_IO_CQ: u8 = 0x05;
pub const OPC_ADMIN_IDENTIFY: u8 = 0x06;
pub const OPC_ADMIN_NS_ATTACH: u8 = 0x15;

/// NVM command set opcodes.
pub const OPC_NVM_WRITE: u8 = 0x01;
pub const OPC_NVM_READ: u8 = 0x02;

/// Identify CNS values.
pub const CNS_NAMESPACE: u16 = 0x00;
pub const CNS_CONTROLLER: u16 = 0x01;
pub const CNS_ACTIVE_NS_LIST: u16 = 0x02;

/// Namespace Attach status: namespace already attached.
pub const SC_NS_ALREADY_ATTACHED: u8 = 0x18;
/// Generic status: command not supported.
pub const SC_INVALID_FIELD: u8 = 0x02;

pub const COMMAND_BYTES: usize = 64;
pub const COMPLETION_BYTES: usize = 16;

/// One submission queue entry, in field form. The command identifier is
/// assigned by the queue at slot reservation, not by the builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Command {
    pub opcode: u8,
    pub nsid: u32,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl Command {
    /// Encode with command identifier `cid`. FUSE and PSDT are always zero:
    /// no fused operations, PRP transfers only.
    pub fn encode(&self, cid: u16) -> [u8; COMMAND_BYTES] {
        let mut out = [0u8; COMMAND_BYTES];
        let dw0 = self.opcode as u32 | (cid as u32) << 16;
        out[0..4].copy_from_slice(&dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        // Bytes 8..24: reserved dwords and the metadata pointer, all zero.
        out[24..32].copy_from_slice(&self.prp1.to_le_bytes());
        out[32..40].copy_from_slice(&self.prp2.to_le_bytes());
        out[40..44].copy_from_slice(&self.cdw10.to_le_bytes());
        out[44..48].copy_from_slice(&self.cdw11.to_le_bytes());
        out[48..52].copy_from_slice(&self.cdw12.to_le_bytes());
        out[52..56].copy_from_slice(&self.cdw13.to_le_bytes());
        out[56..60].copy_from_slice(&self.cdw14.to_le_bytes());
        out[60..64].copy_from_slice(&self.cdw15.to_le_bytes());
        out
    }
}

/// One completion queue entry. `raw_status` is DW3[31:16]: phase in bit 0,
/// the 15-bit status field above it.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub dw0: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    raw_status: u16,
}

impl Completion {
    pub fn decode(bytes: [u8; COMPLETION_BYTES]) -> Self {
        let dw0 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let dw2 = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let dw3 = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        Self {
            dw0,
            sq_head: (dw2 & 0xFFFF) as u16,
            sq_id: (dw2 >> 16) as u16,
            cid: (dw3 & 0xFFFF) as u16,
            raw_status: (dw3 >> 16) as u16,
        }
    }

    pub fn phase(&self) -> u8 {
        (self.raw_status & 1) as u8
    }

    /// Status code: low 8 bits of the status field.
    pub fn status_code(&self) -> u8 {
        (self.raw_status >> 1) as u8
    }

    /// Status code type: the 3 bits above the status code.
    pub fn status_code_type(&self) -> u8 {
        (self.raw_status >> 9 & 0x7) as u8
    }

    pub fn is_success(&self) -> bool {
        self.status_code() == 0 && self.status_code_type() == 0
    }
}
