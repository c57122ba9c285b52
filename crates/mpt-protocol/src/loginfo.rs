//! `IOCLogInfo` decoding.
//!
//! The log info word is vendor diagnostic data whose layout depends on the bus the port speaks.
//! Decoding is for logs only; nothing in the engine branches on it.

use crate::reply::PortFactsReply;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusType {
    Spi,
    Fc,
    Sas,
}

impl BusType {
    /// Bus type from the `PortType` field of port facts. Unknown port types fall back to SPI.
    pub fn from_port_type(port_type: u8) -> Self {
        match port_type {
            PortFactsReply::PORT_TYPE_FC => BusType::Fc,
            PortFactsReply::PORT_TYPE_SAS => BusType::Sas,
            _ => BusType::Spi,
        }
    }

    pub fn decoder(self) -> &'static dyn LogInfoDecoder {
        match self {
            BusType::Spi => &SpiLogInfo,
            BusType::Fc => &FcLogInfo,
            BusType::Sas => &SasLogInfo,
        }
    }
}

pub trait LogInfoDecoder: Send + Sync {
    fn decode(&self, log_info: u32) -> String;
}

pub struct SpiLogInfo;

impl LogInfoDecoder for SpiLogInfo {
    fn decode(&self, log_info: u32) -> String {
        let desc = match (log_info & 0x00ff_0000) >> 16 {
            0x01 => "bug! MID not found",
            0x02 => "Parity Error",
            0x03 => "ASYNC Outbound Overrun",
            0x04 => "SYNC Offset Error",
            0x05 => "BM Change",
            0x06 => "Msg In Overflow",
            0x07 => "DMA Error",
            0x08 => "Outbound DMA Overrun",
            0x09 => "Task Management",
            0x0a => "Device Problem",
            0x0b => "Invalid Phase Change",
            0x0c => "Untagged Table Size",
            _ => "Unknown",
        };
        format!("SPI log info {log_info:#010x}: {desc}")
    }
}

pub struct FcLogInfo;

impl LogInfoDecoder for FcLogInfo {
    fn decode(&self, log_info: u32) -> String {
        let desc = match log_info >> 24 {
            0x20 => "FCP Initiator",
            0x21 => "FCP Target",
            0x22 => "LAN",
            0x23 => "MPI Message Layer",
            0x24 => "FC Link",
            0x25 => "Context Manager",
            0x26 => "Invalid Field Offset",
            0x27 => "State Change Info",
            _ => "Unknown",
        };
        format!("FC log info {log_info:#010x}: {desc}")
    }
}

pub struct SasLogInfo;

const SAS_BUS_TYPE: u32 = 0x3;

fn sas_iop_code(code: u8) -> Option<&'static str> {
    Some(match code {
        0x01 => "Invalid SAS Address",
        0x03 => "Invalid Page",
        0x04 => "Diag Message Error",
        0x05 => "Task Terminated",
        0x06 => "Enclosure Management",
        0x07 => "Target Mode",
        _ => return None,
    })
}

fn sas_pl_code(code: u8) -> Option<&'static str> {
    Some(match code {
        0x01 => "Open Failure",
        0x02 => "Invalid Scatter Gather List",
        0x03 => "Wrong Relative Offset or Frame Length",
        0x04 => "Frame Transfer Error",
        0x05 => "Transmit Frame Connected Low",
        0x06 => "SATA Non-NCQ RW Error Bit Set",
        0x07 => "SATA Read Log Receive Data Error",
        0x08 => "SATA NCQ Fail All Commands After Error",
        0x09 => "SATA Error in Receive Set Device Bit FIS",
        0x0a => "Receive Frame Invalid Message",
        0x0b => "Receive Context Message Valid Error",
        0x0c => "Receive Frame Current Frame Error",
        0x0d => "SATA Link Down",
        0x0e => "Discovery SATA Init W IOS",
        0x0f => "Config Invalid Page",
        0x10 => "Discovery SATA Init Timeout",
        0x11 => "Reset",
        0x12 => "Abort",
        0x13 => "IO Not Yet Executed",
        0x14 => "IO Executed",
        0x15 => "Persistent Reservation Out Not Affiliation Owner",
        0x16 => "Open Transmit DMA Abort",
        0x17 => "IO Device Missing Delay Retry",
        0x18 => "IO Cancelled Due to Receive Error",
        0x20 => "Enclosure Management",
        _ => return None,
    })
}

impl LogInfoDecoder for SasLogInfo {
    fn decode(&self, log_info: u32) -> String {
        if log_info >> 28 != SAS_BUS_TYPE {
            return format!("SAS log info {log_info:#010x}: not a SAS log entry");
        }
        let originator = ((log_info >> 24) & 0xf) as u8;
        let code = ((log_info >> 16) & 0xff) as u8;
        let sub_code = (log_info & 0xffff) as u16;
        let (originator_desc, code_desc) = match originator {
            0 => ("IOP", sas_iop_code(code)),
            1 => ("PL", sas_pl_code(code)),
            2 => ("IR", None),
            _ => ("Unknown", None),
        };
        match code_desc {
            Some(desc) => format!(
                "SAS log info {log_info:#010x}: originator {originator_desc}, code {desc}, sub code {sub_code:#06x}"
            ),
            None => format!(
                "SAS log info {log_info:#010x}: originator {originator_desc}, code {code:#04x}, sub code {sub_code:#06x}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spi_codes() {
        assert!(SpiLogInfo.decode(0x0002_0000).contains("Parity Error"));
        assert!(SpiLogInfo.decode(0x00ff_0000).contains("Unknown"));
    }

    #[test]
    fn fc_uses_top_byte() {
        assert!(FcLogInfo.decode(0x2400_1234).contains("FC Link"));
    }

    #[test]
    fn sas_splits_originator_and_code() {
        let text = SasLogInfo.decode(0x3111_0100);
        assert!(text.contains("originator PL"), "{text}");
        assert!(text.contains("Reset"), "{text}");
        assert!(text.contains("0x0100"), "{text}");
        assert!(SasLogInfo.decode(0x1111_0000).contains("not a SAS"));
    }

    #[test]
    fn decoder_follows_port_type() {
        assert_eq!(
            BusType::from_port_type(PortFactsReply::PORT_TYPE_SAS),
            BusType::Sas
        );
        assert_eq!(BusType::from_port_type(PortFactsReply::PORT_TYPE_FC), BusType::Fc);
        assert_eq!(BusType::from_port_type(0x00), BusType::Spi);
        assert!(BusType::Fc.decoder().decode(0x2000_0000).contains("FCP Initiator"));
    }
}
