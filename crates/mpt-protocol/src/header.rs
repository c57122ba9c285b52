//! The common message header shared by every request and reply frame.
//!
//! Requests:
//!
//! ```text
//! byte 0..2   function specific
//! byte 2      ChainOffset (dwords, 0 = no chain)
//! byte 3      Function
//! byte 4..7   function specific
//! byte 7      MsgFlags
//! byte 8..12  MsgContext (echoed back verbatim by the IOC)
//! ```
//!
//! Replies replace `ChainOffset` with `MsgLength` (dwords) and, for every reply that follows the
//! default layout, carry `IOCStatus` at 14..16 and `IOCLogInfo` at 16..20.

use bitflags::bitflags;

use crate::WireError;

pub const CHAIN_OFFSET_BYTE: usize = 2;
pub const MSG_LENGTH_BYTE: usize = 2;
pub const FUNCTION_BYTE: usize = 3;
pub const MSG_FLAGS_BYTE: usize = 7;
pub const MSG_CONTEXT_OFFSET: usize = 8;
pub const IOC_STATUS_OFFSET: usize = 14;
pub const IOC_LOG_INFO_OFFSET: usize = 16;

/// Size of the default reply (header + status + log info).
pub const DEFAULT_REPLY_SIZE: usize = 20;

/// Message function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Function {
    ScsiIoRequest = 0x00,
    ScsiTaskMgmt = 0x01,
    IocInit = 0x02,
    IocFacts = 0x03,
    Config = 0x04,
    PortFacts = 0x05,
    PortEnable = 0x06,
    EventNotification = 0x07,
    EventAck = 0x08,
    FwDownload = 0x09,
    TargetCmdBufferPost = 0x0a,
    TargetAssist = 0x0b,
    TargetStatusSend = 0x0c,
    TargetModeAbort = 0x0d,
    FwUpload = 0x12,
    RaidAction = 0x15,
    RaidScsiIoPassthrough = 0x16,
    Toolbox = 0x17,
    SmpPassthrough = 0x1a,
    SasIoUnitControl = 0x1b,
    LanSend = 0x20,
    LanReceive = 0x21,
    LanReset = 0x22,
}

impl Function {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::ScsiIoRequest,
            0x01 => Self::ScsiTaskMgmt,
            0x02 => Self::IocInit,
            0x03 => Self::IocFacts,
            0x04 => Self::Config,
            0x05 => Self::PortFacts,
            0x06 => Self::PortEnable,
            0x07 => Self::EventNotification,
            0x08 => Self::EventAck,
            0x09 => Self::FwDownload,
            0x0a => Self::TargetCmdBufferPost,
            0x0b => Self::TargetAssist,
            0x0c => Self::TargetStatusSend,
            0x0d => Self::TargetModeAbort,
            0x12 => Self::FwUpload,
            0x15 => Self::RaidAction,
            0x16 => Self::RaidScsiIoPassthrough,
            0x17 => Self::Toolbox,
            0x1a => Self::SmpPassthrough,
            0x1b => Self::SasIoUnitControl,
            0x20 => Self::LanSend,
            0x21 => Self::LanReceive,
            0x22 => Self::LanReset,
            _ => return None,
        })
    }
}

bitflags! {
    /// `MsgFlags` byte of the common header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct MsgFlags: u8 {
        /// On replies: more replies will follow for the same request frame.
        const CONTINUATION_REPLY = 0x80;
    }
}

/// The 32-bit context carried in every message and echoed back in its reply.
///
/// The low 16 bits hold the request frame index, bits 16..24 the callback index of the consumer
/// that owns the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgContext {
    pub req_idx: u16,
    pub cb_idx: u8,
}

impl MsgContext {
    pub const fn new(req_idx: u16, cb_idx: u8) -> Self {
        MsgContext { req_idx, cb_idx }
    }

    pub const fn to_u32(self) -> u32 {
        (self.req_idx as u32) | ((self.cb_idx as u32) << 16)
    }

    pub const fn from_u32(raw: u32) -> Self {
        MsgContext {
            req_idx: (raw & 0xffff) as u16,
            cb_idx: ((raw >> 16) & 0xff) as u8,
        }
    }
}

pub(crate) fn ensure_len(buf: &[u8], need: usize) -> Result<(), WireError> {
    if buf.len() < need {
        return Err(WireError::Truncated {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Reads the function byte of a request or reply, if the buffer is long enough.
pub fn peek_function(buf: &[u8]) -> Option<u8> {
    buf.get(FUNCTION_BYTE).copied()
}

/// Reads `MsgContext` from a request or reply.
pub fn peek_context(buf: &[u8]) -> Result<MsgContext, WireError> {
    ensure_len(buf, MSG_CONTEXT_OFFSET + 4)?;
    Ok(MsgContext::from_u32(read_u32(buf, MSG_CONTEXT_OFFSET)))
}

/// Overwrites `MsgContext` in a request frame.
pub fn stamp_context(buf: &mut [u8], ctx: MsgContext) {
    write_u32(buf, MSG_CONTEXT_OFFSET, ctx.to_u32());
}

/// Writes the request `ChainOffset` byte (in dwords).
pub fn set_chain_offset(buf: &mut [u8], dwords: u8) {
    buf[CHAIN_OFFSET_BYTE] = dwords;
}

/// Reply length in bytes, decoded from `MsgLength`.
pub fn reply_length_bytes(buf: &[u8]) -> Result<usize, WireError> {
    ensure_len(buf, MSG_LENGTH_BYTE + 1)?;
    Ok(buf[MSG_LENGTH_BYTE] as usize * 4)
}
