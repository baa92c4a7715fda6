//! Controller register map (BAR0).
//!
//! Offsets and field layouts follow the NVM Express base specification 1.4.
//! All access goes through [`RegisterMap`], a typed view over the mapped
//! window; 64-bit registers are assembled low dword first by the
//! [`MmioSpace`] provided methods.

use std::sync::Arc;

use petrel_platform::MmioSpace;

/// Controller Capabilities (64-bit).
pub const REG_CAP: u64 = 0x00;
/// Version.
pub const REG_VS: u64 = 0x08;
/// Interrupt Mask Set.
pub const REG_INTMS: u64 = 0x0C;
/// Interrupt Mask Clear.
pub const REG_INTMC: u64 = 0x10;
/// Controller Configuration.
pub const REG_CC: u64 = 0x14;
/// Controller Status.
pub const REG_CSTS: u64 = 0x1C;
/// Admin Queue Attributes.
pub const REG_AQA: u64 = 0x24;
/// Admin Submission Queue Base Address (64-bit).
pub const REG_ASQ: u64 = 0x28;
/// Admin Completion Queue Base Address (64-bit).
pub const REG_ACQ: u64 = 0x30;

/// Start of the doorbell array. Stride between adjacent doorbells is
/// `4 << CAP.DSTRD`.
pub const DOORBELL_BASE: u64 = 0x1000;

// CAP fields.
const CAP_MQES_MASK: u64 = 0xFFFF;
const CAP_TO_SHIFT: u64 = 24;
const CAP_DSTRD_SHIFT: u64 = 32;
const CAP_CSS_SHIFT: u64 = 37;
const CAP_MPSMIN_SHIFT: u64 = 48;
const CAP_MPSMAX_SHIFT: u64 = 52;

// CC fields.
pub const CC_EN: u32 = 1 << 0;
pub const CC_CSS_SHIFT: u32 = 4;
pub const CC_MPS_SHIFT: u32 = 7;
pub const CC_AMS_SHIFT: u32 = 11;
pub const CC_SHN_SHIFT: u32 = 14;
pub const CC_SHN_MASK: u32 = 0x3 << CC_SHN_SHIFT;
/// Abrupt shutdown notification.
pub const CC_SHN_ABRUPT: u32 = 0b10 << CC_SHN_SHIFT;
pub const CC_IOSQES_SHIFT: u32 = 16;
pub const CC_IOCQES_SHIFT: u32 = 20;

// CSTS fields.
pub const CSTS_RDY: u32 = 1 << 0;
pub const CSTS_CFS: u32 = 1 << 1;
pub const CSTS_SHST_SHIFT: u32 = 2;
pub const CSTS_SHST_MASK: u32 = 0x3 << CSTS_SHST_SHIFT;
/// Shutdown processing complete.
pub const SHST_COMPLETE: u32 = 0b10;
/// Normal operation (no shutdown requested).
pub const SHST_NORMAL: u32 = 0b00;

/// Decoded CAP register.
#[derive(Debug, Clone, Copy)]
pub struct ControllerCaps {
    /// Maximum queue entries supported, 0-based.
    pub mqes: u16,
    /// Doorbell stride exponent.
    pub dstrd: u8,
    /// Worst-case enable/disable transition time, in milliseconds
    /// (CAP.TO is in 500 ms units).
    pub timeout_ms: u64,
    /// Command sets supported bitmap.
    pub css: u8,
    pub mpsmin: u8,
    pub mpsmax: u8,
}

impl ControllerCaps {
    pub fn decode(cap: u64) -> Self {
        Self {
            mqes: (cap & CAP_MQES_MASK) as u16,
            dstrd: (cap >> CAP_DSTRD_SHIFT & 0xF) as u8,
            timeout_ms: (cap >> CAP_TO_SHIFT & 0xFF) * 500,
            css: (cap >> CAP_CSS_SHIFT & 0xFF) as u8,
            mpsmin: (cap >> CAP_MPSMIN_SHIFT & 0xF) as u8,
            mpsmax: (cap >> CAP_MPSMAX_SHIFT & 0xF) as u8,
        }
    }

    pub fn min_page_size(&self) -> usize {
        1usize << (12 + self.mpsmin)
    }

    pub fn max_page_size(&self) -> usize {
        1usize << (12 + self.mpsmax)
    }
}

/// Which doorbell of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellKind {
    Submission = 0,
    Completion = 1,
}

/// Byte offset of the doorbell for queue `qid`, kind `kind`, doorbell stride
/// exponent `dstrd`.
pub fn doorbell_offset(qid: u16, kind: DoorbellKind, dstrd: u8) -> u64 {
    DOORBELL_BASE + (2 * qid as u64 + kind as u64) * (4u64 << dstrd)
}

/// Typed access to the controller registers.
#[derive(Clone)]
pub struct RegisterMap {
    mmio: Arc<dyn MmioSpace>,
    dstrd: u8,
}

impl RegisterMap {
    pub fn new(mmio: Arc<dyn MmioSpace>) -> Self {
        let dstrd = (mmio.read_u64(REG_CAP) >> CAP_DSTRD_SHIFT & 0xF) as u8;
        Self { mmio, dstrd }
    }

    pub fn cap(&self) -> u64 {
        self.mmio.read_u64(REG_CAP)
    }

    pub fn version(&self) -> u32 {
        self.mmio.read_u32(REG_VS)
    }

    pub fn cc(&self) -> u32 {
        self.mmio.read_u32(REG_CC)
    }

    pub fn set_cc(&self, value: u32) {
        self.mmio.write_u32(REG_CC, value);
    }

    pub fn csts(&self) -> u32 {
        self.mmio.read_u32(REG_CSTS)
    }

    pub fn set_aqa(&self, value: u32) {
        self.mmio.write_u32(REG_AQA, value);
    }

    pub fn set_asq(&self, phys: u64) {
        self.mmio.write_u64(REG_ASQ, phys);
    }

    pub fn set_acq(&self, phys: u64) {
        self.mmio.write_u64(REG_ACQ, phys);
    }

    /// Mask the interrupt of queue `qid` (INTMS bit `1 << qid`).
    pub fn mask_queue_interrupt(&self, qid: u16) {
        self.mmio.write_u32(REG_INTMS, 1 << qid);
    }

    /// Unmask the interrupt of queue `qid` (INTMC bit `1 << qid`).
    pub fn unmask_queue_interrupt(&self, qid: u16) {
        self.mmio.write_u32(REG_INTMC, 1 << qid);
    }

    pub fn ring_submission_doorbell(&self, qid: u16, tail: u32) {
        let offset = doorbell_offset(qid, DoorbellKind::Submission, self.dstrd);
        self.mmio.write_u32(offset, tail);
    }

    pub fn ring_completion_doorbell(&self, qid: u16, head: u32) {
        let offset = doorbell_offset(qid, DoorbellKind::Completion, self.dstrd);
        self.mmio.write_u32(offset, head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn cap_decode() {
        // MQES=127, TO=8 (4 s), DSTRD=2, CSS=1, MPSMIN=0, MPSMAX=4.
        let cap = 127u64 | 8 << CAP_TO_SHIFT | 2 << CAP_DSTRD_SHIFT | 1 << CAP_CSS_SHIFT
            | 4 << CAP_MPSMAX_SHIFT;
        let caps = ControllerCaps::decode(cap);
        assert_eq!(caps.mqes, 127);
        assert_eq!(caps.timeout_ms, 4000);
        assert_eq!(caps.dstrd, 2);
        assert_eq!(caps.css, 1);
        assert_eq!(caps.min_page_size(), 4096);
        assert_eq!(caps.max_page_size(), 1 << 16);
    }

    #[test]
    fn doorbell_offsets_with_zero_stride() {
        assert_eq!(doorbell_offset(0, DoorbellKind::Submission, 0), 0x1000);
        assert_eq!(doorbell_offset(0, DoorbellKind::Completion, 0), 0x1004);
        assert_eq!(doorbell_offset(1, DoorbellKind::Submission, 0), 0x1008);
        assert_eq!(doorbell_offset(1, DoorbellKind::Completion, 0), 0x100C);
    }

    proptest! {
        // Doorbell offset law: 0x1000 + (2q + k) * (4 << DSTRD).
        #[test]
        fn doorbell_offset_law(qid in 0u16..1024, dstrd in 0u8..16, completion in any::<bool>()) {
            let kind = if completion { DoorbellKind::Completion } else { DoorbellKind::Submission };
            let k = completion as u64;
            let expected = 0x1000 + (2 * qid as u64 + k) * (4u64 << dstrd);
            prop_assert_eq!(doorbell_offset(qid, kind, dstrd), expected);
        }
    }
}
