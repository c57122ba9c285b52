//! Reply descriptors popped from the reply FIFO.
//!
//! A descriptor with bit 31 set is an address reply: the remaining bits are the reply frame's bus
//! address shifted right by one, so reply frames live below 4 GiB. Anything else is a turbo
//! reply whose type is in bits 30:29.

use crate::{MsgContext, WireError};

pub const ADDRESS_REPLY_BIT: u32 = 0x8000_0000;
pub const TURBO_TYPE_SHIFT: u32 = 29;
pub const TURBO_TYPE_MASK: u32 = 0x3;
pub const TURBO_IO_INDEX_MASK: u32 = 0x3fff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurboReply {
    /// Successful initiator I/O. Carries the original request's context.
    ScsiInitiator { context: MsgContext },
    /// Target-mode command buffer completion.
    ScsiTarget { io_index: u16 },
    Lan { raw: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDescriptor {
    Address { frame_addr: u64 },
    Turbo(TurboReply),
}

impl ReplyDescriptor {
    pub fn decode(raw: u32) -> Result<Self, WireError> {
        if raw & ADDRESS_REPLY_BIT != 0 {
            return Ok(ReplyDescriptor::Address {
                frame_addr: (raw << 1) as u64,
            });
        }
        let turbo = match (raw >> TURBO_TYPE_SHIFT) & TURBO_TYPE_MASK {
            0 => TurboReply::ScsiInitiator {
                context: MsgContext::from_u32(raw),
            },
            1 => TurboReply::ScsiTarget {
                io_index: (raw & TURBO_IO_INDEX_MASK) as u16,
            },
            2 => TurboReply::Lan { raw },
            _ => return Err(WireError::UnknownTurbo(raw)),
        };
        Ok(ReplyDescriptor::Turbo(turbo))
    }

    pub fn encode(&self) -> u32 {
        match *self {
            ReplyDescriptor::Address { frame_addr } => ADDRESS_REPLY_BIT | (frame_addr >> 1) as u32,
            ReplyDescriptor::Turbo(TurboReply::ScsiInitiator { context }) => {
                context.to_u32() & 0x00ff_ffff
            }
            ReplyDescriptor::Turbo(TurboReply::ScsiTarget { io_index }) => {
                (1 << TURBO_TYPE_SHIFT) | (io_index as u32 & TURBO_IO_INDEX_MASK)
            }
            ReplyDescriptor::Turbo(TurboReply::Lan { raw }) => {
                (2 << TURBO_TYPE_SHIFT) | (raw & !(ADDRESS_REPLY_BIT | (3 << TURBO_TYPE_SHIFT)))
            }
        }
    }
}
