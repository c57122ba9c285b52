//! `IOCStatus` values carried by every default-layout reply.

use core::fmt;

/// Raw `IOCStatus` word. Bit 15 flags that `IOCLogInfo` holds a valid value; the remaining bits
/// are the status code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IocStatus(pub u16);

impl IocStatus {
    pub const LOG_INFO_AVAILABLE: u16 = 0x8000;
    pub const CODE_MASK: u16 = 0x7fff;

    pub const SUCCESS: u16 = 0x0000;
    pub const INVALID_FUNCTION: u16 = 0x0001;
    pub const BUSY: u16 = 0x0002;
    pub const INVALID_SGL: u16 = 0x0003;
    pub const INTERNAL_ERROR: u16 = 0x0004;
    pub const INSUFFICIENT_RESOURCES: u16 = 0x0006;
    pub const INVALID_FIELD: u16 = 0x0007;
    pub const INVALID_STATE: u16 = 0x0008;
    pub const OP_STATE_NOT_SUPPORTED: u16 = 0x0009;

    pub const CONFIG_INVALID_ACTION: u16 = 0x0020;
    pub const CONFIG_INVALID_TYPE: u16 = 0x0021;
    pub const CONFIG_INVALID_PAGE: u16 = 0x0022;
    pub const CONFIG_INVALID_DATA: u16 = 0x0023;
    pub const CONFIG_NO_DEFAULTS: u16 = 0x0024;
    pub const CONFIG_CANT_COMMIT: u16 = 0x0025;

    pub const SCSI_RECOVERED_ERROR: u16 = 0x0040;
    pub const SCSI_INVALID_BUS: u16 = 0x0041;
    pub const SCSI_INVALID_TARGETID: u16 = 0x0042;
    pub const SCSI_DEVICE_NOT_THERE: u16 = 0x0043;
    pub const SCSI_DATA_OVERRUN: u16 = 0x0044;
    pub const SCSI_DATA_UNDERRUN: u16 = 0x0045;
    pub const SCSI_IO_DATA_ERROR: u16 = 0x0046;
    pub const SCSI_PROTOCOL_ERROR: u16 = 0x0047;
    pub const SCSI_TASK_TERMINATED: u16 = 0x0048;
    pub const SCSI_RESIDUAL_MISMATCH: u16 = 0x0049;
    pub const SCSI_TASK_MGMT_FAILED: u16 = 0x004a;
    pub const SCSI_IOC_TERMINATED: u16 = 0x004b;
    pub const SCSI_EXT_TERMINATED: u16 = 0x004c;

    pub const fn from_code(code: u16) -> Self {
        IocStatus(code & Self::CODE_MASK)
    }

    pub const fn code(self) -> u16 {
        self.0 & Self::CODE_MASK
    }

    pub const fn log_info_available(self) -> bool {
        self.0 & Self::LOG_INFO_AVAILABLE != 0
    }

    pub const fn is_success(self) -> bool {
        self.code() == Self::SUCCESS
    }

    pub fn describe(self) -> &'static str {
        match self.code() {
            Self::SUCCESS => "Success",
            Self::INVALID_FUNCTION => "Invalid Function",
            Self::BUSY => "IOC Busy",
            Self::INVALID_SGL => "Invalid SGL",
            Self::INTERNAL_ERROR => "Internal Error",
            Self::INSUFFICIENT_RESOURCES => "Insufficient Resources",
            Self::INVALID_FIELD => "Invalid Field",
            Self::INVALID_STATE => "Invalid State",
            Self::OP_STATE_NOT_SUPPORTED => "Operation State Not Supported",
            Self::CONFIG_INVALID_ACTION => "Config Page Invalid Action",
            Self::CONFIG_INVALID_TYPE => "Config Page Invalid Type",
            Self::CONFIG_INVALID_PAGE => "Config Page Invalid Page",
            Self::CONFIG_INVALID_DATA => "Config Page Invalid Data",
            Self::CONFIG_NO_DEFAULTS => "Config Page No Defaults",
            Self::CONFIG_CANT_COMMIT => "Config Page Can't Commit",
            Self::SCSI_RECOVERED_ERROR => "Recovered Error",
            Self::SCSI_INVALID_BUS => "Invalid Bus",
            Self::SCSI_INVALID_TARGETID => "Invalid Target ID",
            Self::SCSI_DEVICE_NOT_THERE => "Device Not There",
            Self::SCSI_DATA_OVERRUN => "Data Overrun",
            Self::SCSI_DATA_UNDERRUN => "Data Underrun",
            Self::SCSI_IO_DATA_ERROR => "I/O Data Error",
            Self::SCSI_PROTOCOL_ERROR => "Protocol Error",
            Self::SCSI_TASK_TERMINATED => "Task Terminated",
            Self::SCSI_RESIDUAL_MISMATCH => "Residual Mismatch",
            Self::SCSI_TASK_MGMT_FAILED => "Task Management Failed",
            Self::SCSI_IOC_TERMINATED => "IOC Terminated",
            Self::SCSI_EXT_TERMINATED => "Externally Terminated",
            _ => "Unknown IOCStatus",
        }
    }
}

impl fmt::Debug for IocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IocStatus({:#06x} {})", self.code(), self.describe())
    }
}

impl fmt::Display for IocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#06x})", self.describe(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_info_flag_is_not_part_of_code() {
        let status = IocStatus(0x8000 | IocStatus::SCSI_DEVICE_NOT_THERE);
        assert!(status.log_info_available());
        assert_eq!(status.code(), IocStatus::SCSI_DEVICE_NOT_THERE);
        assert_eq!(status.describe(), "Device Not There");
        assert!(!status.is_success());
        assert!(IocStatus(0x8000).is_success());
    }

    #[test]
    fn unknown_codes_still_describe() {
        assert_eq!(IocStatus(0x0777).describe(), "Unknown IOCStatus");
        assert_eq!(
            IocStatus::from_code(IocStatus::BUSY).to_string(),
            "IOC Busy (0x0002)"
        );
    }
}
