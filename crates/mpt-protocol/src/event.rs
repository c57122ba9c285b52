//! Asynchronous event notifications.
//!
//! Once event notification is switched on, the IOC answers the original EventNotification
//! request frame with a stream of continuation replies, one per event:
//!
//! ```text
//! byte 0..2   EventDataLength (dwords)
//! byte 2      MsgLength
//! byte 3      Function (0x07)
//! byte 6      AckRequired
//! byte 7      MsgFlags (0x80 while more replies follow)
//! byte 8..12  MsgContext of the original request
//! byte 14..20 IOCStatus, IOCLogInfo
//! byte 20..24 Event
//! byte 24..28 EventContext
//! byte 28..   Data[EventDataLength]
//! ```

use crate::header::{
    ensure_len, read_u16, read_u32, write_u16, write_u32, FUNCTION_BYTE, IOC_LOG_INFO_OFFSET,
    IOC_STATUS_OFFSET, MSG_CONTEXT_OFFSET, MSG_FLAGS_BYTE, MSG_LENGTH_BYTE,
};
use crate::{Function, IocStatus, MsgFlags, WireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventCode {
    None = 0x00,
    LogData = 0x01,
    StateChange = 0x02,
    UnitAttention = 0x03,
    IocBusReset = 0x04,
    ExtBusReset = 0x05,
    Rescan = 0x06,
    LinkStatusChange = 0x07,
    LoopStateChange = 0x08,
    Logout = 0x09,
    EventChange = 0x0a,
    IntegratedRaid = 0x0b,
    ScsiDeviceStatusChange = 0x0c,
    OnBusTimerExpired = 0x0d,
    QueueFull = 0x0e,
    SasDeviceStatusChange = 0x0f,
    SasSes = 0x10,
    PersistentTableFull = 0x11,
    SasPhyLinkStatus = 0x12,
    SasDiscoveryError = 0x13,
    IrResyncUpdate = 0x14,
    Ir2 = 0x15,
    SasDiscovery = 0x16,
    SasBroadcastPrimitive = 0x17,
    LogEntryAdded = 0x21,
}

impl EventCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x00 => Self::None,
            0x01 => Self::LogData,
            0x02 => Self::StateChange,
            0x03 => Self::UnitAttention,
            0x04 => Self::IocBusReset,
            0x05 => Self::ExtBusReset,
            0x06 => Self::Rescan,
            0x07 => Self::LinkStatusChange,
            0x08 => Self::LoopStateChange,
            0x09 => Self::Logout,
            0x0a => Self::EventChange,
            0x0b => Self::IntegratedRaid,
            0x0c => Self::ScsiDeviceStatusChange,
            0x0d => Self::OnBusTimerExpired,
            0x0e => Self::QueueFull,
            0x0f => Self::SasDeviceStatusChange,
            0x10 => Self::SasSes,
            0x11 => Self::PersistentTableFull,
            0x12 => Self::SasPhyLinkStatus,
            0x13 => Self::SasDiscoveryError,
            0x14 => Self::IrResyncUpdate,
            0x15 => Self::Ir2,
            0x16 => Self::SasDiscovery,
            0x17 => Self::SasBroadcastPrimitive,
            0x21 => Self::LogEntryAdded,
            _ => return None,
        })
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::LogData => "Log Data",
            Self::StateChange => "State Change",
            Self::UnitAttention => "Unit Attention",
            Self::IocBusReset => "IOC Bus Reset",
            Self::ExtBusReset => "External Bus Reset",
            Self::Rescan => "Bus Rescan Event",
            Self::LinkStatusChange => "Link Status Change",
            Self::LoopStateChange => "Loop State Change",
            Self::Logout => "Logout",
            Self::EventChange => "Event Change",
            Self::IntegratedRaid => "Integrated Raid",
            Self::ScsiDeviceStatusChange => "SCSI Device Status Change",
            Self::OnBusTimerExpired => "On Bus Timer Expired",
            Self::QueueFull => "Queue Full",
            Self::SasDeviceStatusChange => "SAS Device Status Change",
            Self::SasSes => "SAS SES Event",
            Self::PersistentTableFull => "Persistent Table Full",
            Self::SasPhyLinkStatus => "SAS PHY Link Status",
            Self::SasDiscoveryError => "SAS Discovery Error",
            Self::IrResyncUpdate => "IR Resync Update",
            Self::Ir2 => "IR2",
            Self::SasDiscovery => "SAS Discovery",
            Self::SasBroadcastPrimitive => "SAS Broadcast Primitive",
            Self::LogEntryAdded => "Log Entry Added",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventNotificationReply {
    pub ack_required: bool,
    pub msg_flags: MsgFlags,
    pub msg_context: u32,
    pub ioc_status: IocStatus,
    pub log_info: u32,
    pub event: u32,
    pub event_context: u32,
    pub data: Vec<u32>,
}

impl EventNotificationReply {
    pub const HEADER_SIZE: usize = 28;

    pub fn code(&self) -> Option<EventCode> {
        EventCode::from_u32(self.event)
    }

    pub fn describe(&self) -> &'static str {
        self.code().map_or("Unknown event", EventCode::describe)
    }

    pub fn is_continuation(&self) -> bool {
        self.msg_flags.contains(MsgFlags::CONTINUATION_REPLY)
    }

    /// For `EventChange`: the new event notification state (non-zero means on).
    pub fn new_event_state(&self) -> Option<u8> {
        if self.code() != Some(EventCode::EventChange) {
            return None;
        }
        self.data.first().map(|d| (d & 0xff) as u8)
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.data.len() * 4
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, Self::HEADER_SIZE)?;
        if buf[FUNCTION_BYTE] != Function::EventNotification as u8 {
            return Err(WireError::UnexpectedFunction {
                expected: Function::EventNotification as u8,
                found: buf[FUNCTION_BYTE],
            });
        }
        let data_len = read_u16(buf, 0) as usize;
        ensure_len(buf, Self::HEADER_SIZE + data_len * 4)?;
        let data = (0..data_len)
            .map(|i| read_u32(buf, Self::HEADER_SIZE + i * 4))
            .collect();
        Ok(EventNotificationReply {
            ack_required: buf[6] != 0,
            msg_flags: MsgFlags::from_bits_retain(buf[MSG_FLAGS_BYTE]),
            msg_context: read_u32(buf, MSG_CONTEXT_OFFSET),
            ioc_status: IocStatus(read_u16(buf, IOC_STATUS_OFFSET)),
            log_info: read_u32(buf, IOC_LOG_INFO_OFFSET),
            event: read_u32(buf, 20),
            event_context: read_u32(buf, 24),
            data,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        write_u16(&mut buf, 0, self.data.len() as u16);
        buf[MSG_LENGTH_BYTE] = (buf.len() / 4) as u8;
        buf[FUNCTION_BYTE] = Function::EventNotification as u8;
        buf[6] = self.ack_required as u8;
        buf[MSG_FLAGS_BYTE] = self.msg_flags.bits();
        write_u32(&mut buf, MSG_CONTEXT_OFFSET, self.msg_context);
        write_u16(&mut buf, IOC_STATUS_OFFSET, self.ioc_status.0);
        write_u32(&mut buf, IOC_LOG_INFO_OFFSET, self.log_info);
        write_u32(&mut buf, 20, self.event);
        write_u32(&mut buf, 24, self.event_context);
        for (i, d) in self.data.iter().enumerate() {
            write_u32(&mut buf, Self::HEADER_SIZE + i * 4, *d);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_reply_layout() {
        let reply = EventNotificationReply {
            ack_required: true,
            msg_flags: MsgFlags::CONTINUATION_REPLY,
            msg_context: 0x0001_0002,
            event: EventCode::EventChange as u32,
            event_context: 9,
            data: vec![1],
            ..Default::default()
        };
        let bytes = reply.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..2], &[1, 0]);
        assert_eq!(bytes[2], 8);
        assert_eq!(bytes[3], 0x07);
        assert_eq!(bytes[6], 1);
        assert_eq!(bytes[7], 0x80);
        assert_eq!(&bytes[20..24], &[0x0a, 0, 0, 0]);

        let back = EventNotificationReply::parse(&bytes).unwrap();
        assert_eq!(back, reply);
        assert_eq!(back.new_event_state(), Some(1));
        assert_eq!(back.describe(), "Event Change");
    }

    #[test]
    fn truncated_data_is_rejected() {
        let reply = EventNotificationReply {
            event: EventCode::LogData as u32,
            data: vec![1, 2, 3],
            ..Default::default()
        };
        let bytes = reply.to_bytes();
        assert!(EventNotificationReply::parse(&bytes[..32]).is_err());
        assert_eq!(reply.new_event_state(), None);
    }

    #[test]
    fn unknown_codes() {
        assert_eq!(EventCode::from_u32(0x18), None);
        assert_eq!(EventCode::from_u32(0x21), Some(EventCode::LogEntryAdded));
        let reply = EventNotificationReply {
            event: 0x99,
            ..Default::default()
        };
        assert_eq!(reply.describe(), "Unknown event");
    }
}
