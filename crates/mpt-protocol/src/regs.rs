//! System interface register map and doorbell encoding.
//!
//! Only the registers the message-passing engine touches are described here. Offsets are
//! relative to the start of the IOC's register window; every register is 32 bits wide.

use bitflags::bitflags;

/// Registers of the system interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Doorbell,
    WriteSequence,
    HostDiagnostic,
    TestBase,
    DiagRwData,
    DiagRwAddress,
    HostInterruptStatus,
    HostInterruptMask,
    RequestQueue,
    ReplyQueue,
    HighPriorityQueue,
}

impl Register {
    pub const fn offset(self) -> u32 {
        match self {
            Register::Doorbell => 0x00,
            Register::WriteSequence => 0x04,
            Register::HostDiagnostic => 0x08,
            Register::TestBase => 0x0c,
            Register::DiagRwData => 0x10,
            Register::DiagRwAddress => 0x14,
            Register::HostInterruptStatus => 0x30,
            Register::HostInterruptMask => 0x34,
            Register::RequestQueue => 0x40,
            Register::ReplyQueue => 0x44,
            Register::HighPriorityQueue => 0x48,
        }
    }

    pub fn from_offset(offset: u32) -> Option<Register> {
        Some(match offset {
            0x00 => Register::Doorbell,
            0x04 => Register::WriteSequence,
            0x08 => Register::HostDiagnostic,
            0x0c => Register::TestBase,
            0x10 => Register::DiagRwData,
            0x14 => Register::DiagRwAddress,
            0x30 => Register::HostInterruptStatus,
            0x34 => Register::HostInterruptMask,
            0x40 => Register::RequestQueue,
            0x44 => Register::ReplyQueue,
            0x48 => Register::HighPriorityQueue,
            _ => return None,
        })
    }
}

pub const DOORBELL_STATE_MASK: u32 = 0xf000_0000;
pub const DOORBELL_STATE_SHIFT: u32 = 28;
pub const DOORBELL_ACTIVE: u32 = 0x0800_0000;
pub const DOORBELL_WHO_INIT_MASK: u32 = 0x0700_0000;
pub const DOORBELL_WHO_INIT_SHIFT: u32 = 24;
pub const DOORBELL_DATA_MASK: u32 = 0x0000_ffff;

pub const DOORBELL_FUNCTION_SHIFT: u32 = 24;
pub const DOORBELL_ADD_DWORDS_SHIFT: u32 = 16;

/// Value read back from the reply FIFO when no reply is pending.
pub const REPLY_FIFO_EMPTY: u32 = 0xffff_ffff;

/// Functions that may be written into the doorbell while it is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DoorbellFunction {
    MessageUnitReset = 0x40,
    IoUnitReset = 0x41,
    Handshake = 0x42,
}

impl DoorbellFunction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x40 => Some(Self::MessageUnitReset),
            0x41 => Some(Self::IoUnitReset),
            0x42 => Some(Self::Handshake),
            _ => None,
        }
    }

    /// Doorbell word that starts this function. `dwords` is only meaningful for handshakes.
    pub fn doorbell_word(self, dwords: u8) -> u32 {
        ((self as u32) << DOORBELL_FUNCTION_SHIFT) | ((dwords as u32) << DOORBELL_ADD_DWORDS_SHIFT)
    }
}

/// Controller state reported in doorbell bits 31:28.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IocState {
    Reset,
    Ready,
    Operational,
    Fault,
    Unknown(u8),
}

impl IocState {
    pub fn from_doorbell(doorbell: u32) -> Self {
        match ((doorbell & DOORBELL_STATE_MASK) >> DOORBELL_STATE_SHIFT) as u8 {
            0x0 => IocState::Reset,
            0x1 => IocState::Ready,
            0x2 => IocState::Operational,
            0x4 => IocState::Fault,
            other => IocState::Unknown(other),
        }
    }

    pub fn bits(self) -> u32 {
        let raw: u32 = match self {
            IocState::Reset => 0x0,
            IocState::Ready => 0x1,
            IocState::Operational => 0x2,
            IocState::Fault => 0x4,
            IocState::Unknown(v) => (v & 0xf) as u32,
        };
        raw << DOORBELL_STATE_SHIFT
    }
}

/// Who brought the IOC to its current state (doorbell bits 26:24, IOC init `WhoInit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WhoInit {
    NoOne = 0x00,
    SystemBios = 0x01,
    RomBios = 0x02,
    PciPeer = 0x03,
    HostDriver = 0x04,
    Manufacturer = 0x05,
}

impl WhoInit {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::NoOne,
            0x01 => Self::SystemBios,
            0x02 => Self::RomBios,
            0x03 => Self::PciPeer,
            0x04 => Self::HostDriver,
            0x05 => Self::Manufacturer,
            _ => return None,
        })
    }
}

/// Decoded doorbell register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellStatus {
    pub state: IocState,
    pub active: bool,
    pub who_init: u8,
    pub data: u16,
}

impl DoorbellStatus {
    pub fn decode(raw: u32) -> Self {
        DoorbellStatus {
            state: IocState::from_doorbell(raw),
            active: raw & DOORBELL_ACTIVE != 0,
            who_init: ((raw & DOORBELL_WHO_INIT_MASK) >> DOORBELL_WHO_INIT_SHIFT) as u8,
            data: (raw & DOORBELL_DATA_MASK) as u16,
        }
    }

    /// Fault code, meaningful only when `state == IocState::Fault`.
    pub fn fault_code(&self) -> u16 {
        self.data
    }

    pub fn encode(&self) -> u32 {
        let mut raw = self.state.bits();
        if self.active {
            raw |= DOORBELL_ACTIVE;
        }
        raw |= ((self.who_init as u32) << DOORBELL_WHO_INIT_SHIFT) & DOORBELL_WHO_INIT_MASK;
        raw | self.data as u32
    }
}

bitflags! {
    /// Host interrupt status register.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct HostInterruptStatus: u32 {
        const DOORBELL_INTERRUPT = 1 << 0;
        const REPLY_INTERRUPT = 1 << 3;
        /// Set while the IOC has not yet consumed the last doorbell write.
        const IOP_DOORBELL_STATUS = 1 << 31;
    }
}

bitflags! {
    /// Host interrupt mask register.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct HostInterruptMask: u32 {
        const DOORBELL = 1 << 0;
        const REPLY = 1 << 3;
    }
}

bitflags! {
    /// Host diagnostic register.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct HostDiagnostic: u32 {
        const DIAG_MEM_ENABLE = 1 << 0;
        const DISABLE_ARM = 1 << 1;
        const RESET_ADAPTER = 1 << 2;
        const RESET_HISTORY = 1 << 5;
        /// Diagnostic read/write enable, set once the write sequence has been unlocked.
        const DRWE = 1 << 7;
        const PREVENT_IOC_BOOT = 1 << 9;
        const CLEAR_FLASH_BAD_SIG = 1 << 10;
    }
}

/// Keys that unlock the host diagnostic register, in order.
pub const WRITE_SEQUENCE_KEYS: [u32; 5] = [0x04, 0x0b, 0x02, 0x07, 0x0d];

/// Any value outside the key sequence re-locks the diagnostic register.
pub const WRITE_SEQUENCE_LOCK: u32 = 0xff;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_decode_splits_fields() {
        let raw = 0x2000_0000 | DOORBELL_ACTIVE | (0x4 << 24) | 0x1234;
        let db = DoorbellStatus::decode(raw);
        assert_eq!(db.state, IocState::Operational);
        assert!(db.active);
        assert_eq!(db.who_init, WhoInit::HostDriver as u8);
        assert_eq!(db.data, 0x1234);
        assert_eq!(db.encode(), raw);
    }

    #[test]
    fn unknown_state_is_preserved() {
        assert_eq!(IocState::from_doorbell(0x7000_0000), IocState::Unknown(7));
        assert_eq!(IocState::from_doorbell(0x4000_beef), IocState::Fault);
    }

    #[test]
    fn handshake_doorbell_word_encodes_dword_count() {
        assert_eq!(DoorbellFunction::Handshake.doorbell_word(3), 0x4203_0000);
        assert_eq!(DoorbellFunction::MessageUnitReset.doorbell_word(0), 0x4000_0000);
    }

    #[test]
    fn register_offsets_round_trip() {
        for reg in [
            Register::Doorbell,
            Register::WriteSequence,
            Register::HostDiagnostic,
            Register::DiagRwData,
            Register::DiagRwAddress,
            Register::HostInterruptStatus,
            Register::RequestQueue,
            Register::ReplyQueue,
        ] {
            assert_eq!(Register::from_offset(reg.offset()), Some(reg));
        }
        assert_eq!(Register::from_offset(0x2c), None);
    }
}
