//! Scatter-gather elements.
//!
//! A simple element is `FlagsLength` (flags in bits 31:24, byte count in 23:0) followed by a 32
//! or 64-bit address. A chain element points at the next chain buffer:
//!
//! ```text
//! byte 0..2   Length (bytes of the next segment)
//! byte 2      NextChainOffset (dwords, offset of the chain element inside the next segment)
//! byte 3      Flags
//! byte 4..    Address (4 or 8 bytes)
//! ```

use bitflags::bitflags;

use crate::header::{ensure_len, read_u16, read_u32, write_u16, write_u32};
use crate::WireError;

bitflags! {
    /// Flag bits of an element, excluding the element type field (bits 5:4).
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct SgeFlags: u8 {
        const LAST_ELEMENT = 0x80;
        const END_OF_BUFFER = 0x40;
        const LOCAL_ADDRESS = 0x08;
        const HOST_TO_IOC = 0x04;
        const ADDRESS_64 = 0x02;
        const END_OF_LIST = 0x01;
    }
}

pub const ELEMENT_TYPE_MASK: u8 = 0x30;
pub const ELEMENT_TYPE_TRANSACTION: u8 = 0x00;
pub const ELEMENT_TYPE_SIMPLE: u8 = 0x10;
pub const ELEMENT_TYPE_CHAIN: u8 = 0x30;

pub const MAX_SGE_LENGTH: u32 = 0x00ff_ffff;

/// Flags that close a list.
pub const TERMINATOR_FLAGS: SgeFlags = SgeFlags::LAST_ELEMENT
    .union(SgeFlags::END_OF_BUFFER)
    .union(SgeFlags::END_OF_LIST);

/// Address width of every element in a list; fixed per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressWidth {
    Sge32,
    Sge64,
}

impl AddressWidth {
    /// Picks the element format for a DMA engine that can address `bits` bits.
    pub fn for_dma_bits(bits: u8) -> Self {
        if bits > 32 {
            AddressWidth::Sge64
        } else {
            AddressWidth::Sge32
        }
    }

    pub const fn simple_size(self) -> usize {
        match self {
            AddressWidth::Sge32 => 8,
            AddressWidth::Sge64 => 12,
        }
    }

    pub const fn chain_size(self) -> usize {
        self.simple_size()
    }

    fn flag(self) -> u8 {
        match self {
            AddressWidth::Sge32 => 0,
            AddressWidth::Sge64 => SgeFlags::ADDRESS_64.bits(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sge {
    Simple {
        flags: SgeFlags,
        length: u32,
        address: u64,
    },
    Chain {
        length: u16,
        next_chain_offset: u8,
        address: u64,
    },
}

impl Sge {
    pub fn simple(flags: SgeFlags, length: u32, address: u64) -> Self {
        Sge::Simple {
            flags,
            length,
            address,
        }
    }

    /// Zero-length element that terminates an otherwise empty list.
    pub fn terminator() -> Self {
        Sge::simple(TERMINATOR_FLAGS, 0, 0)
    }

    pub fn address(&self) -> u64 {
        match *self {
            Sge::Simple { address, .. } | Sge::Chain { address, .. } => address,
        }
    }
}

fn write_address(buf: &mut [u8], width: AddressWidth, address: u64) -> Result<(), WireError> {
    match width {
        AddressWidth::Sge32 => {
            let low = u32::try_from(address).map_err(|_| WireError::AddressTooWide(address))?;
            write_u32(buf, 4, low);
        }
        AddressWidth::Sge64 => {
            write_u32(buf, 4, address as u32);
            write_u32(buf, 8, (address >> 32) as u32);
        }
    }
    Ok(())
}

/// Encodes `sge` at the start of `buf`, returning the number of bytes written.
pub fn encode(buf: &mut [u8], width: AddressWidth, sge: &Sge) -> Result<usize, WireError> {
    let size = width.simple_size();
    ensure_len(buf, size)?;
    match *sge {
        Sge::Simple {
            flags,
            length,
            address,
        } => {
            if length > MAX_SGE_LENGTH {
                return Err(WireError::LengthTooLarge(length));
            }
            let flags = flags.bits() & !SgeFlags::ADDRESS_64.bits() | ELEMENT_TYPE_SIMPLE | width.flag();
            write_u32(buf, 0, ((flags as u32) << 24) | length);
        }
        Sge::Chain {
            length,
            next_chain_offset,
            ..
        } => {
            write_u16(buf, 0, length);
            buf[2] = next_chain_offset;
            buf[3] = ELEMENT_TYPE_CHAIN | width.flag();
        }
    }
    write_address(buf, width, sge.address())?;
    Ok(size)
}

/// Decodes the element at the start of `buf`. The width is taken from the element's own flags.
pub fn decode(buf: &[u8]) -> Result<Sge, WireError> {
    ensure_len(buf, 8)?;
    let flags = buf[3];
    let address = if flags & SgeFlags::ADDRESS_64.bits() != 0 {
        ensure_len(buf, 12)?;
        read_u32(buf, 4) as u64 | ((read_u32(buf, 8) as u64) << 32)
    } else {
        read_u32(buf, 4) as u64
    };
    if flags & ELEMENT_TYPE_MASK == ELEMENT_TYPE_CHAIN {
        return Ok(Sge::Chain {
            length: read_u16(buf, 0),
            next_chain_offset: buf[2],
            address,
        });
    }
    Ok(Sge::Simple {
        flags: SgeFlags::from_bits_truncate(flags & !SgeFlags::ADDRESS_64.bits()),
        length: read_u32(buf, 0) & MAX_SGE_LENGTH,
        address,
    })
}
