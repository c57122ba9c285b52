//! The boundary between the engine and the PCI function it drives.
//!
//! Everything the engine knows about the physical controller goes through [`Hardware`]: 32-bit
//! register access in the system interface window and DMA-able host memory. Interrupt wiring and
//! PCI configuration stay on the other side of this trait.

use mpt_protocol::Register;

use crate::error::DmaError;

/// A block of host memory the controller can reach by bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub bus_addr: u64,
    pub len: usize,
}

impl DmaRegion {
    pub fn end(&self) -> u64 {
        self.bus_addr + self.len as u64
    }

    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.bus_addr && addr + len as u64 <= self.end()
    }
}

pub trait Hardware: Send + Sync {
    fn read_reg(&self, reg: Register) -> u32;
    fn write_reg(&self, reg: Register, value: u32);

    /// Allocates `len` bytes of zeroed DMA memory aligned to `align`.
    fn alloc_dma(&self, len: usize, align: usize) -> Result<DmaRegion, DmaError>;

    fn write_dma(&self, addr: u64, data: &[u8]);
    fn read_dma(&self, addr: u64, buf: &mut [u8]);

    /// Number of address bits the controller's DMA engine can drive.
    fn dma_address_bits(&self) -> u8 {
        32
    }

    /// Last resort after a failed recovery: detach the function from the bus.
    fn remove_device(&self) {}
}
