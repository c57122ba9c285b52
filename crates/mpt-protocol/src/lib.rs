//! Wire formats of the Fusion-MPT message passing interface (MPI 1.x).
//!
//! Everything here is plain data: register offsets, doorbell words, message frames and reply
//! descriptors, encoded and decoded byte-exact in little-endian order. No I/O happens in this
//! crate; the engine and the software IOC both build on it.

#![forbid(unsafe_code)]

pub mod descriptor;
pub mod event;
pub mod header;
pub mod loginfo;
pub mod regs;
pub mod reply;
pub mod request;
pub mod sge;
pub mod status;

pub use descriptor::{ReplyDescriptor, TurboReply};
pub use event::{EventCode, EventNotificationReply};
pub use header::{Function, MsgContext, MsgFlags};
pub use loginfo::{BusType, LogInfoDecoder};
pub use regs::{DoorbellFunction, DoorbellStatus, IocState, Register, WhoInit};
pub use reply::{
    DefaultReply, FwUploadReply, IocFactsReply, PortFactsReply, RaidActionReply, TaskMgmtReply,
};
pub use request::{
    EventAckRequest, EventNotificationRequest, FwUploadRequest, IocFactsRequest, IocInitRequest,
    PortEnableRequest, PortFactsRequest, RaidActionRequest, TaskMgmtRequest,
};
pub use sge::{AddressWidth, Sge, SgeFlags};
pub use status::IocStatus;

/// Errors decoding or encoding a wire structure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unexpected function {found:#04x} (expected {expected:#04x})")]
    UnexpectedFunction { expected: u8, found: u8 },

    #[error("turbo reply with unknown type in descriptor {0:#010x}")]
    UnknownTurbo(u32),

    #[error("address {0:#x} does not fit in a 32-bit scatter-gather element")]
    AddressTooWide(u64),

    #[error("scatter-gather length {0:#x} exceeds 24 bits")]
    LengthTooLarge(u32),
}
