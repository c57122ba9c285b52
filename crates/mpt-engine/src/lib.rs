//! Host-side message passing engine for Fusion-MPT storage controllers.
//!
//! The engine sits between storage consumers (SCSI, LAN, RAID management, ...) and one or more
//! controllers reached through a [`Hardware`] implementation:
//!
//! - [`FrameArena`] hands out fixed-size request frames and tracks who owns each one.
//! - [`ChainPool`] turns scatter-gather lists into frame-resident and chained elements.
//! - The doorbell [`Handshake`] carries the small configuration exchanges of bring-up.
//! - [`Ioc::process_replies`] drains the reply FIFO and routes each reply to its consumer.
//! - [`Ioc::bring_up`] and [`Ioc::recover`] drive the controller to OPERATIONAL and back after
//!   faults, notifying consumers through reset handlers.
//!
//! Wire formats live in the `mpt-protocol` crate.

#![forbid(unsafe_code)]

mod arena;
mod bringup;
mod chain;
mod config;
mod context;
mod dispatch;
mod error;
mod eventlog;
mod firmware;
mod handshake;
mod hw;
mod ioc;
mod monitor;
mod pending;
mod poll;
mod registry;
mod reset;
mod sync;

pub use arena::{ArenaStats, Frame, FrameArena, FrameGuard, FrameHandle, SlotState, RELEASED_SENTINEL};
pub use bringup::Phase;
pub use chain::{ChainPool, SgEntry};
pub use config::{CompletionMode, IocConfig};
pub use context::ContextIndex;
pub use dispatch::{DispatchStats, ReplyFrame};
pub use error::{
    BringUpError, ChainError, CommandError, ConfigError, ContextError, DmaError, Error,
    HandshakeError, RegistryError, ReleaseError, Result, Unavailable,
};
pub use eventlog::{EventLog, EventRecord};
pub use handshake::{Handshake, MAX_REQUEST_DWORDS};
pub use hw::{DmaRegion, Hardware};
pub use ioc::{Ioc, Sizing};
pub use monitor::MonitorHandle;
pub use pending::{CommandClass, CommandReply};
pub use poll::{poll_until, retry, Expired};
pub use registry::{
    CallbackIndex, ConsumerClass, EventHandler, Registry, ReplyCallback, ResetHandler, ResetPhase,
    MAX_CONSUMERS,
};

#[cfg(test)]
mod proptests;
