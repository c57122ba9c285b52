//! Reply messages returned by the IOC, either through the handshake or as address replies.

use crate::header::{
    ensure_len, read_u16, read_u32, write_u16, write_u32, DEFAULT_REPLY_SIZE, FUNCTION_BYTE,
    IOC_LOG_INFO_OFFSET, IOC_STATUS_OFFSET, MSG_CONTEXT_OFFSET, MSG_FLAGS_BYTE, MSG_LENGTH_BYTE,
};
use crate::{Function, IocStatus, MsgFlags, WireError};

fn write_header(buf: &mut [u8], function: u8, msg_context: u32, status: IocStatus, log_info: u32) {
    buf[MSG_LENGTH_BYTE] = (buf.len() / 4) as u8;
    buf[FUNCTION_BYTE] = function;
    write_u32(buf, MSG_CONTEXT_OFFSET, msg_context);
    write_u16(buf, IOC_STATUS_OFFSET, status.0);
    write_u32(buf, IOC_LOG_INFO_OFFSET, log_info);
}

fn check(buf: &[u8], function: Function, len: usize) -> Result<DefaultReply, WireError> {
    let reply = DefaultReply::parse(buf)?;
    if reply.function != function as u8 {
        return Err(WireError::UnexpectedFunction {
            expected: function as u8,
            found: reply.function,
        });
    }
    ensure_len(buf, len)?;
    Ok(reply)
}

/// The leading 20 bytes every reply shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DefaultReply {
    /// Length of the whole reply in dwords.
    pub msg_length: u8,
    pub function: u8,
    pub msg_flags: MsgFlags,
    pub msg_context: u32,
    pub ioc_status: IocStatus,
    pub log_info: u32,
}

impl DefaultReply {
    pub const SIZE: usize = DEFAULT_REPLY_SIZE;

    pub fn new(function: Function, msg_context: u32, ioc_status: IocStatus) -> Self {
        DefaultReply {
            msg_length: (Self::SIZE / 4) as u8,
            function: function as u8,
            msg_flags: MsgFlags::empty(),
            msg_context,
            ioc_status,
            log_info: 0,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, Self::SIZE)?;
        Ok(DefaultReply {
            msg_length: buf[MSG_LENGTH_BYTE],
            function: buf[FUNCTION_BYTE],
            msg_flags: MsgFlags::from_bits_retain(buf[MSG_FLAGS_BYTE]),
            msg_context: read_u32(buf, MSG_CONTEXT_OFFSET),
            ioc_status: IocStatus(read_u16(buf, IOC_STATUS_OFFSET)),
            log_info: read_u32(buf, IOC_LOG_INFO_OFFSET),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        write_header(
            &mut buf,
            self.function,
            self.msg_context,
            self.ioc_status,
            self.log_info,
        );
        buf[MSG_FLAGS_BYTE] = self.msg_flags.bits();
        buf
    }

    pub fn is_continuation(&self) -> bool {
        self.msg_flags.contains(MsgFlags::CONTINUATION_REPLY)
    }
}

/// IOC facts: the controller's capabilities and current configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IocFactsReply {
    pub msg_version: u16,
    pub header_version: u16,
    pub ioc_number: u8,
    pub msg_context: u32,
    pub ioc_exceptions: u16,
    pub ioc_status: IocStatus,
    pub log_info: u32,
    pub max_chain_depth: u8,
    pub who_init: u8,
    pub block_size: u8,
    pub flags: u8,
    pub reply_queue_depth: u16,
    /// Request frame size in dwords.
    pub request_frame_size: u16,
    pub product_id: u16,
    pub current_host_mfa_high_addr: u32,
    pub global_credits: u16,
    pub number_of_ports: u8,
    /// Non-zero when event notification is already switched on.
    pub event_state: u8,
    pub current_sense_buffer_high_addr: u32,
    pub cur_reply_frame_size: u16,
    pub max_devices: u8,
    pub max_buses: u8,
    pub fw_image_size: u32,
    pub ioc_capabilities: u32,
    pub fw_version: u32,
    pub high_priority_queue_depth: u16,
}

impl IocFactsReply {
    pub const SIZE: usize = 80;

    /// The IOC boots from a host-provided image after every hard reset.
    pub const FLAG_FW_DOWNLOAD_BOOT: u8 = 0x01;

    pub fn fw_download_boot(&self) -> bool {
        self.flags & Self::FLAG_FW_DOWNLOAD_BOOT != 0
    }

    pub fn events_enabled(&self) -> bool {
        self.event_state != 0
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let hdr = check(buf, Function::IocFacts, Self::SIZE)?;
        Ok(IocFactsReply {
            msg_version: read_u16(buf, 0),
            header_version: read_u16(buf, 4),
            ioc_number: buf[6],
            msg_context: hdr.msg_context,
            ioc_exceptions: read_u16(buf, 12),
            ioc_status: hdr.ioc_status,
            log_info: hdr.log_info,
            max_chain_depth: buf[20],
            who_init: buf[21],
            block_size: buf[22],
            flags: buf[23],
            reply_queue_depth: read_u16(buf, 24),
            request_frame_size: read_u16(buf, 26),
            product_id: read_u16(buf, 30),
            current_host_mfa_high_addr: read_u32(buf, 32),
            global_credits: read_u16(buf, 36),
            number_of_ports: buf[38],
            event_state: buf[39],
            current_sense_buffer_high_addr: read_u32(buf, 40),
            cur_reply_frame_size: read_u16(buf, 44),
            max_devices: buf[46],
            max_buses: buf[47],
            fw_image_size: read_u32(buf, 48),
            ioc_capabilities: read_u32(buf, 52),
            fw_version: read_u32(buf, 56),
            high_priority_queue_depth: read_u16(buf, 60),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        write_header(
            &mut buf,
            Function::IocFacts as u8,
            self.msg_context,
            self.ioc_status,
            self.log_info,
        );
        write_u16(&mut buf, 0, self.msg_version);
        write_u16(&mut buf, 4, self.header_version);
        buf[6] = self.ioc_number;
        write_u16(&mut buf, 12, self.ioc_exceptions);
        buf[20] = self.max_chain_depth;
        buf[21] = self.who_init;
        buf[22] = self.block_size;
        buf[23] = self.flags;
        write_u16(&mut buf, 24, self.reply_queue_depth);
        write_u16(&mut buf, 26, self.request_frame_size);
        write_u16(&mut buf, 30, self.product_id);
        write_u32(&mut buf, 32, self.current_host_mfa_high_addr);
        write_u16(&mut buf, 36, self.global_credits);
        buf[38] = self.number_of_ports;
        buf[39] = self.event_state;
        write_u32(&mut buf, 40, self.current_sense_buffer_high_addr);
        write_u16(&mut buf, 44, self.cur_reply_frame_size);
        buf[46] = self.max_devices;
        buf[47] = self.max_buses;
        write_u32(&mut buf, 48, self.fw_image_size);
        write_u32(&mut buf, 52, self.ioc_capabilities);
        write_u32(&mut buf, 56, self.fw_version);
        write_u16(&mut buf, 60, self.high_priority_queue_depth);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortFactsReply {
    pub port_number: u8,
    pub msg_context: u32,
    pub ioc_status: IocStatus,
    pub log_info: u32,
    pub port_type: u8,
    pub max_devices: u16,
    pub port_scsi_id: u16,
    pub protocol_flags: u16,
    pub max_posted_cmd_buffers: u16,
    pub max_persistent_ids: u16,
    pub max_lan_buckets: u16,
    pub max_initiators: u8,
}

impl PortFactsReply {
    pub const SIZE: usize = 40;

    pub const PORT_TYPE_SCSI: u8 = 0x01;
    pub const PORT_TYPE_FC: u8 = 0x10;
    pub const PORT_TYPE_ISCSI: u8 = 0x20;
    pub const PORT_TYPE_SAS: u8 = 0x30;

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let hdr = check(buf, Function::PortFacts, Self::SIZE)?;
        Ok(PortFactsReply {
            port_number: buf[6],
            msg_context: hdr.msg_context,
            ioc_status: hdr.ioc_status,
            log_info: hdr.log_info,
            port_type: buf[21],
            max_devices: read_u16(buf, 22),
            port_scsi_id: read_u16(buf, 24),
            protocol_flags: read_u16(buf, 26),
            max_posted_cmd_buffers: read_u16(buf, 28),
            max_persistent_ids: read_u16(buf, 30),
            max_lan_buckets: read_u16(buf, 32),
            max_initiators: buf[34],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        write_header(
            &mut buf,
            Function::PortFacts as u8,
            self.msg_context,
            self.ioc_status,
            self.log_info,
        );
        buf[6] = self.port_number;
        buf[21] = self.port_type;
        write_u16(&mut buf, 22, self.max_devices);
        write_u16(&mut buf, 24, self.port_scsi_id);
        write_u16(&mut buf, 26, self.protocol_flags);
        write_u16(&mut buf, 28, self.max_posted_cmd_buffers);
        write_u16(&mut buf, 30, self.max_persistent_ids);
        write_u16(&mut buf, 32, self.max_lan_buckets);
        buf[34] = self.max_initiators;
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FwUploadReply {
    pub image_type: u8,
    pub msg_context: u32,
    pub ioc_status: IocStatus,
    pub log_info: u32,
    pub actual_image_size: u32,
}

impl FwUploadReply {
    pub const SIZE: usize = 24;

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let hdr = check(buf, Function::FwUpload, Self::SIZE)?;
        Ok(FwUploadReply {
            image_type: buf[0],
            msg_context: hdr.msg_context,
            ioc_status: hdr.ioc_status,
            log_info: hdr.log_info,
            actual_image_size: read_u32(buf, 20),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        write_header(
            &mut buf,
            Function::FwUpload as u8,
            self.msg_context,
            self.ioc_status,
            self.log_info,
        );
        buf[0] = self.image_type;
        write_u32(&mut buf, 20, self.actual_image_size);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskMgmtReply {
    pub target_id: u8,
    pub bus: u8,
    pub response_code: u8,
    pub task_type: u8,
    pub msg_context: u32,
    pub ioc_status: IocStatus,
    pub log_info: u32,
    pub termination_count: u32,
}

impl TaskMgmtReply {
    pub const SIZE: usize = 24;

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let hdr = check(buf, Function::ScsiTaskMgmt, Self::SIZE)?;
        Ok(TaskMgmtReply {
            target_id: buf[0],
            bus: buf[1],
            response_code: buf[4],
            task_type: buf[5],
            msg_context: hdr.msg_context,
            ioc_status: hdr.ioc_status,
            log_info: hdr.log_info,
            termination_count: read_u32(buf, 20),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        write_header(
            &mut buf,
            Function::ScsiTaskMgmt as u8,
            self.msg_context,
            self.ioc_status,
            self.log_info,
        );
        buf[0] = self.target_id;
        buf[1] = self.bus;
        buf[4] = self.response_code;
        buf[5] = self.task_type;
        write_u32(&mut buf, 20, self.termination_count);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RaidActionReply {
    pub action: u8,
    pub volume_id: u8,
    pub volume_bus: u8,
    pub phys_disk_num: u8,
    pub msg_context: u32,
    pub action_status: u16,
    pub ioc_status: IocStatus,
    pub log_info: u32,
    pub volume_status: u32,
    pub action_data: u32,
}

impl RaidActionReply {
    pub const SIZE: usize = 28;

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let hdr = check(buf, Function::RaidAction, Self::SIZE)?;
        Ok(RaidActionReply {
            action: buf[0],
            volume_id: buf[4],
            volume_bus: buf[5],
            phys_disk_num: buf[6],
            msg_context: hdr.msg_context,
            action_status: read_u16(buf, 12),
            ioc_status: hdr.ioc_status,
            log_info: hdr.log_info,
            volume_status: read_u32(buf, 20),
            action_data: read_u32(buf, 24),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        write_header(
            &mut buf,
            Function::RaidAction as u8,
            self.msg_context,
            self.ioc_status,
            self.log_info,
        );
        buf[0] = self.action;
        buf[4] = self.volume_id;
        buf[5] = self.volume_bus;
        buf[6] = self.phys_disk_num;
        write_u16(&mut buf, 12, self.action_status);
        write_u32(&mut buf, 20, self.volume_status);
        write_u32(&mut buf, 24, self.action_data);
        buf
    }
}
