//! Request messages issued by the host.
//!
//! Each request has a fixed wire size and encodes with `to_bytes`. `parse` is the inverse and is
//! what a device model uses to read a frame the host posted.

use crate::header::{
    ensure_len, read_u16, read_u32, write_u16, write_u32, CHAIN_OFFSET_BYTE, FUNCTION_BYTE,
    MSG_CONTEXT_OFFSET, MSG_FLAGS_BYTE,
};
use crate::regs::WhoInit;
use crate::sge::{self, AddressWidth, Sge};
use crate::{Function, WireError};

fn header(buf: &mut [u8], function: Function, msg_context: u32) {
    buf[FUNCTION_BYTE] = function as u8;
    write_u32(buf, MSG_CONTEXT_OFFSET, msg_context);
}

fn check(buf: &[u8], function: Function, len: usize) -> Result<u32, WireError> {
    ensure_len(buf, len)?;
    if buf[FUNCTION_BYTE] != function as u8 {
        return Err(WireError::UnexpectedFunction {
            expected: function as u8,
            found: buf[FUNCTION_BYTE],
        });
    }
    Ok(read_u32(buf, MSG_CONTEXT_OFFSET))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IocFactsRequest {
    pub msg_context: u32,
}

impl IocFactsRequest {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        header(&mut buf, Function::IocFacts, self.msg_context);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let msg_context = check(buf, Function::IocFacts, Self::SIZE)?;
        Ok(IocFactsRequest { msg_context })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortFactsRequest {
    pub port_number: u8,
    pub msg_context: u32,
}

impl PortFactsRequest {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        header(&mut buf, Function::PortFacts, self.msg_context);
        buf[6] = self.port_number;
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let msg_context = check(buf, Function::PortFacts, Self::SIZE)?;
        Ok(PortFactsRequest {
            port_number: buf[6],
            msg_context,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortEnableRequest {
    pub port_number: u8,
    pub msg_context: u32,
}

impl PortEnableRequest {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        header(&mut buf, Function::PortEnable, self.msg_context);
        buf[6] = self.port_number;
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let msg_context = check(buf, Function::PortEnable, Self::SIZE)?;
        Ok(PortEnableRequest {
            port_number: buf[6],
            msg_context,
        })
    }
}

/// IOC init. Sizes are negotiated from the facts reply before this is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IocInitRequest {
    pub who_init: WhoInit,
    pub flags: u8,
    pub max_devices: u8,
    pub max_buses: u8,
    pub msg_context: u32,
    pub reply_frame_size: u16,
    pub host_mfa_high_addr: u32,
    pub sense_buffer_high_addr: u32,
    pub reply_fifo_host_signaling_addr: u32,
    pub msg_version: u16,
    pub header_version: u16,
}

impl IocInitRequest {
    pub const SIZE: usize = 44;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        header(&mut buf, Function::IocInit, self.msg_context);
        buf[0] = self.who_init as u8;
        buf[4] = self.flags;
        buf[5] = self.max_devices;
        buf[6] = self.max_buses;
        write_u16(&mut buf, 12, self.reply_frame_size);
        write_u32(&mut buf, 16, self.host_mfa_high_addr);
        write_u32(&mut buf, 20, self.sense_buffer_high_addr);
        write_u32(&mut buf, 24, self.reply_fifo_host_signaling_addr);
        // 28..40: host page buffer SGE, unused.
        write_u16(&mut buf, 40, self.msg_version);
        write_u16(&mut buf, 42, self.header_version);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let msg_context = check(buf, Function::IocInit, Self::SIZE)?;
        Ok(IocInitRequest {
            who_init: WhoInit::from_u8(buf[0]).unwrap_or(WhoInit::NoOne),
            flags: buf[4],
            max_devices: buf[5],
            max_buses: buf[6],
            msg_context,
            reply_frame_size: read_u16(buf, 12),
            host_mfa_high_addr: read_u32(buf, 16),
            sense_buffer_high_addr: read_u32(buf, 20),
            reply_fifo_host_signaling_addr: read_u32(buf, 24),
            msg_version: read_u16(buf, 40),
            header_version: read_u16(buf, 42),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventNotificationRequest {
    pub switch: bool,
    pub msg_context: u32,
}

impl EventNotificationRequest {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        header(&mut buf, Function::EventNotification, self.msg_context);
        buf[0] = self.switch as u8;
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let msg_context = check(buf, Function::EventNotification, Self::SIZE)?;
        Ok(EventNotificationRequest {
            switch: buf[0] != 0,
            msg_context,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventAckRequest {
    pub event: u32,
    pub event_context: u32,
    pub msg_context: u32,
}

impl EventAckRequest {
    pub const SIZE: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        header(&mut buf, Function::EventAck, self.msg_context);
        write_u32(&mut buf, 12, self.event);
        write_u32(&mut buf, 16, self.event_context);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let msg_context = check(buf, Function::EventAck, Self::SIZE)?;
        Ok(EventAckRequest {
            event: read_u32(buf, 12),
            event_context: read_u32(buf, 16),
            msg_context,
        })
    }
}

/// Firmware upload: a transaction context element describing the image followed by one simple
/// element pointing at the host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwUploadRequest {
    pub image_type: u8,
    pub msg_context: u32,
    pub image_offset: u32,
    pub image_size: u32,
    pub buffer: Sge,
}

impl FwUploadRequest {
    pub const IMAGE_TYPE_FW: u8 = 0x01;

    const TCSGE_OFFSET: usize = 12;
    const TCSGE_DETAILS_LENGTH: u8 = 12;
    const SGE_OFFSET: usize = 28;

    pub fn encoded_len(width: AddressWidth) -> usize {
        Self::SGE_OFFSET + width.simple_size()
    }

    pub fn write(&self, buf: &mut [u8], width: AddressWidth) -> Result<usize, WireError> {
        let len = Self::encoded_len(width);
        ensure_len(buf, len)?;
        buf[..len].fill(0);
        header(buf, Function::FwUpload, self.msg_context);
        buf[0] = self.image_type;
        let tc = Self::TCSGE_OFFSET;
        buf[tc + 2] = Self::TCSGE_DETAILS_LENGTH;
        write_u32(buf, tc + 8, self.image_offset);
        write_u32(buf, tc + 12, self.image_size);
        sge::encode(&mut buf[Self::SGE_OFFSET..], width, &self.buffer)?;
        Ok(len)
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let msg_context = check(buf, Function::FwUpload, Self::SGE_OFFSET + 8)?;
        let tc = Self::TCSGE_OFFSET;
        let buffer = sge::decode(&buf[Self::SGE_OFFSET..])?;
        Ok(FwUploadRequest {
            image_type: buf[0],
            msg_context,
            image_offset: read_u32(buf, tc + 8),
            image_size: read_u32(buf, tc + 12),
            buffer,
        })
    }
}

/// Task management task types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskType {
    AbortTask = 0x01,
    AbortTaskSet = 0x02,
    TargetReset = 0x03,
    ResetBus = 0x04,
    LogicalUnitReset = 0x05,
    ClearTaskSet = 0x06,
    QueryTask = 0x07,
    ClearAca = 0x08,
}

impl TaskType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::AbortTask,
            0x02 => Self::AbortTaskSet,
            0x03 => Self::TargetReset,
            0x04 => Self::ResetBus,
            0x05 => Self::LogicalUnitReset,
            0x06 => Self::ClearTaskSet,
            0x07 => Self::QueryTask,
            0x08 => Self::ClearAca,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMgmtRequest {
    pub target_id: u8,
    pub bus: u8,
    pub task_type: TaskType,
    pub msg_context: u32,
    pub lun: [u8; 8],
    /// Context of the request being aborted, for abort-task.
    pub task_msg_context: u32,
}

impl TaskMgmtRequest {
    pub const SIZE: usize = 52;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        header(&mut buf, Function::ScsiTaskMgmt, self.msg_context);
        buf[0] = self.target_id;
        buf[1] = self.bus;
        buf[5] = self.task_type as u8;
        buf[12..20].copy_from_slice(&self.lun);
        write_u32(&mut buf, 48, self.task_msg_context);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let msg_context = check(buf, Function::ScsiTaskMgmt, Self::SIZE)?;
        let mut lun = [0u8; 8];
        lun.copy_from_slice(&buf[12..20]);
        Ok(TaskMgmtRequest {
            target_id: buf[0],
            bus: buf[1],
            task_type: TaskType::from_u8(buf[5]).unwrap_or(TaskType::QueryTask),
            msg_context,
            lun,
            task_msg_context: read_u32(buf, 48),
        })
    }
}

/// RAID action. Only the action data word form is supported; the action data SGE is always
/// written as an empty terminating element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidActionRequest {
    pub action: u8,
    pub volume_id: u8,
    pub volume_bus: u8,
    pub phys_disk_num: u8,
    pub msg_context: u32,
    pub action_data_word: u32,
}

impl RaidActionRequest {
    pub const ACTION_STATUS: u8 = 0x00;
    pub const ACTION_INDICATOR_STRUCT: u8 = 0x01;
    pub const ACTION_QUIESCE_PHYS_IO: u8 = 0x0f;
    pub const ACTION_ENABLE_PHYS_IO: u8 = 0x10;

    const SGE_OFFSET: usize = 20;

    pub fn encoded_len(width: AddressWidth) -> usize {
        Self::SGE_OFFSET + width.simple_size()
    }

    pub fn write(&self, buf: &mut [u8], width: AddressWidth) -> Result<usize, WireError> {
        let len = Self::encoded_len(width);
        ensure_len(buf, len)?;
        buf[..len].fill(0);
        header(buf, Function::RaidAction, self.msg_context);
        buf[0] = self.action;
        buf[4] = self.volume_id;
        buf[5] = self.volume_bus;
        buf[6] = self.phys_disk_num;
        write_u32(buf, 16, self.action_data_word);
        sge::encode(&mut buf[Self::SGE_OFFSET..], width, &Sge::terminator())?;
        Ok(len)
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let msg_context = check(buf, Function::RaidAction, Self::SGE_OFFSET)?;
        Ok(RaidActionRequest {
            action: buf[0],
            volume_id: buf[4],
            volume_bus: buf[5],
            phys_disk_num: buf[6],
            msg_context,
            action_data_word: read_u32(buf, 16),
        })
    }
}

/// `ChainOffset` of any request, in dwords.
pub fn chain_offset(buf: &[u8]) -> Option<u8> {
    buf.get(CHAIN_OFFSET_BYTE).copied()
}

pub fn msg_flags(buf: &[u8]) -> Option<u8> {
    buf.get(MSG_FLAGS_BYTE).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sge::SgeFlags;

    #[test]
    fn ioc_facts_request_layout() {
        let bytes = IocFactsRequest {
            msg_context: 0x0001_0003,
        }
        .to_bytes();
        assert_eq!(bytes, [0, 0, 0, 0x03, 0, 0, 0, 0, 0x03, 0, 0x01, 0]);
    }

    #[test]
    fn ioc_init_layout() {
        let req = IocInitRequest {
            who_init: WhoInit::HostDriver,
            flags: 0,
            max_devices: 255,
            max_buses: 1,
            msg_context: 0,
            reply_frame_size: 80,
            host_mfa_high_addr: 0x1,
            sense_buffer_high_addr: 0x2,
            reply_fifo_host_signaling_addr: 0,
            msg_version: 0x0105,
            header_version: 0x0a00,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes[0], 0x04);
        assert_eq!(bytes[3], Function::IocInit as u8);
        assert_eq!(bytes[5], 255);
        assert_eq!(&bytes[12..14], &80u16.to_le_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_le_bytes());
        assert_eq!(IocInitRequest::parse(&bytes).unwrap(), req);
    }

    #[test]
    fn parse_rejects_other_functions() {
        let bytes = PortEnableRequest {
            port_number: 1,
            msg_context: 9,
        }
        .to_bytes();
        assert_eq!(
            PortFactsRequest::parse(&bytes),
            Err(WireError::UnexpectedFunction {
                expected: Function::PortFacts as u8,
                found: Function::PortEnable as u8,
            })
        );
        assert!(PortEnableRequest::parse(&bytes[..8]).is_err());
    }

    #[test]
    fn fw_upload_places_simple_element_after_context_element() {
        let req = FwUploadRequest {
            image_type: FwUploadRequest::IMAGE_TYPE_FW,
            msg_context: 0,
            image_offset: 0,
            image_size: 0x2000,
            buffer: Sge::simple(
                SgeFlags::LAST_ELEMENT | SgeFlags::END_OF_BUFFER | SgeFlags::END_OF_LIST,
                0x2000,
                0x8000_0000,
            ),
        };
        let mut buf = [0u8; 64];
        let len = req.write(&mut buf, AddressWidth::Sge32).unwrap();
        assert_eq!(len, 36);
        assert_eq!(buf[14], 12);
        assert_eq!(&buf[24..28], &0x2000u32.to_le_bytes());
        assert_eq!(FwUploadRequest::parse(&buf[..len]).unwrap(), req);
    }

    #[test]
    fn task_mgmt_layout() {
        let req = TaskMgmtRequest {
            target_id: 3,
            bus: 0,
            task_type: TaskType::TargetReset,
            msg_context: 0x0002_0001,
            lun: [0, 1, 0, 0, 0, 0, 0, 0],
            task_msg_context: 0,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(bytes[5], 0x03);
        assert_eq!(bytes[13], 1);
        assert_eq!(TaskMgmtRequest::parse(&bytes).unwrap(), req);
    }
}
