//! Memory-mapped I/O windows.

/// A mapped MMIO window, addressed by byte offset from its base.
///
/// Accesses are whole-register and opaque to the optimiser on the
/// implementation side (the kernel implementation uses volatile loads and
/// stores). 64-bit registers are split into two 32-bit accesses, low dword
/// first, so the same driver code cannot tear on 32-bit hosts.
pub trait MmioSpace: Send + Sync {
    fn read_u32(&self, offset: u64) -> u32;
    fn write_u32(&self, offset: u64, value: u32);

    fn read_u64(&self, offset: u64) -> u64 {
        let lo = self.read_u32(offset) as u64;
        let hi = self.read_u32(offset + 4) as u64;
        hi << 32 | lo
    }

    fn write_u64(&self, offset: u64, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }
}
