use std::time::Duration;

use mpt_protocol::{IocState, IocStatus, WireError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a frame (or the submission path) is not available right now.
///
/// This is a "try again later" answer rather than a failure: callers back off and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Unavailable {
    #[error("controller is not active")]
    Inactive,

    #[error("no free request frames")]
    Exhausted,

    #[error("controller is being reset")]
    Resetting,

    #[error("controller is dead")]
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    #[error("out of DMA memory: requested {len} bytes")]
    OutOfMemory { len: usize },

    #[error("DMA allocation of {len} bytes does not fit below the {bits}-bit limit")]
    AddressRange { len: usize, bits: u8 },
}

/// Failure of a single doorbell handshake exchange. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("doorbell already active")]
    DoorbellBusy,

    #[error("controller did not acknowledge the handshake")]
    NoAck,

    #[error("controller stopped acknowledging at request dword {word}")]
    AckLost { word: usize },

    #[error("timed out waiting for the handshake reply")]
    ReplyTimeout,

    #[error("handshake reply declares an invalid length of {dwords} dwords")]
    BadReplyLength { dwords: u8 },

    #[error("handshake reply function {found:#04x} does not match request function {expected:#04x}")]
    FunctionMismatch { expected: u8, found: u8 },

    #[error("handshake request of {len} bytes is not a whole number of dwords below 1 KiB")]
    BadRequestLength { len: usize },
}

/// Errors that abort a bring-up (or the re-negotiation of a recovery).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BringUpError {
    #[error("controller is operational and owned by a PCI peer")]
    OwnedByPeer,

    #[error("controller reported a {frame_size}-byte request frame; at least {min} bytes are needed")]
    FrameTooSmall { frame_size: usize, min: usize },

    #[error("controller did not reach READY (last state {0:?})")]
    NotReady(IocState),

    #[error("controller faulted with code {0:#06x}")]
    Faulted(u16),

    #[error("hard reset failed: {0}")]
    ResetFailed(&'static str),

    #[error("{step}: {source}")]
    Handshake {
        step: &'static str,
        #[source]
        source: HandshakeError,
    },

    #[error("{step}: controller returned {status} (log info {log_info:#010x})")]
    Status {
        step: &'static str,
        status: IocStatus,
        log_info: u32,
    },

    #[error("{step}: malformed reply: {source}")]
    Decode {
        step: &'static str,
        #[source]
        source: WireError,
    },

    #[error(transparent)]
    Dma(#[from] DmaError),

    #[error("controller did not become OPERATIONAL within {0:?}")]
    OperationalTimeout(Duration),

    #[error("firmware upload returned {actual} bytes, expected {expected}")]
    FirmwareSizeMismatch { expected: u32, actual: u32 },

    #[error("could not enable event notification: {0}")]
    Events(Unavailable),

    #[error("controller is dead")]
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command not issued: {0}")]
    Busy(Unavailable),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("controller was reset while the command was outstanding")]
    ResetOccurred,

    #[error("command failed: {status} (log info {log_info:#010x})")]
    IocStatus { status: IocStatus, log_info: u32 },

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Decode(#[from] WireError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("request of {len} bytes does not fit a {frame_size}-byte frame")]
    RequestTooLarge { len: usize, frame_size: usize },
}

impl From<Unavailable> for CommandError {
    fn from(value: Unavailable) -> Self {
        CommandError::Busy(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("no free chain buffers")]
    Exhausted,

    #[error("address {0:#x} needs 64-bit scatter-gather elements")]
    AddressTooWide(u64),

    #[error("element length {0:#x} exceeds 24 bits")]
    LengthTooLarge(u32),

    #[error("scatter-gather list offset {0} leaves no room in the frame")]
    NoRoom(usize),
}

impl From<WireError> for ChainError {
    fn from(value: WireError) -> Self {
        match value {
            WireError::AddressTooWide(addr) => ChainError::AddressTooWide(addr),
            WireError::LengthTooLarge(len) => ChainError::LengthTooLarge(len),
            _ => ChainError::NoRoom(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
    #[error("frame {0} is already free")]
    DoubleRelease(u16),

    #[error("frame index {0} is outside the arena")]
    OutOfRange(u16),
}

/// A reply (or caller) named a frame that cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context index {index} is beyond the request depth {depth}")]
    OutOfRange { index: u16, depth: u16 },

    #[error("frame {0} is not in use")]
    NotInUse(u16),

    #[error("frame {0} was never submitted to the controller")]
    NotSubmitted(u16),

    #[error("frame {index} is owned by callback {owner}, not {claimed}")]
    WrongOwner { index: u16, owner: u8, claimed: u8 },

    #[error("bus address {0:#x} is not a frame boundary inside the arena")]
    BadAddress(u64),

    #[error("request queues are not allocated")]
    NoQueues,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("all consumer slots are in use")]
    Full,

    #[error("callback index {0} is not registered")]
    NotRegistered(u8),

    #[error("callback index {0} belongs to the engine")]
    Reserved(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Crate-level error, for callers that do not care which layer failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    BringUp(#[from] BringUpError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dma(#[from] DmaError),

    #[error(transparent)]
    Unavailable(#[from] Unavailable),
}
