//! Reply dispatch.
//!
//! [`Ioc::process_replies`] is the engine's interrupt handler: it pops descriptors off the reply
//! FIFO until it reads empty, resolves each one to the frame that caused it and hands the reply
//! to the frame's owner. Replies are handled strictly in the order the controller posted them;
//! concurrent callers serialize on the dispatch lock.
//!
//! Anything that does not resolve (a turbo type we do not know, a callback index nobody holds, a
//! context pointing at a free frame, an address outside the reply ring) is logged and dropped.
//! No frame is released on behalf of a reply that could not be attributed.

use std::sync::atomic::{AtomicU64, Ordering};

use mpt_protocol::header::{DEFAULT_REPLY_SIZE, MSG_LENGTH_BYTE};
use mpt_protocol::regs::REPLY_FIFO_EMPTY;
use mpt_protocol::{
    DefaultReply, IocStatus, MsgContext, Register, ReplyDescriptor, TurboReply, WireError,
};

use crate::context::ContextIndex;
use crate::ioc::Ioc;
use crate::registry::CallbackIndex;
use crate::sync::lock;

/// A full reply frame copied out of the reply ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    bytes: Vec<u8>,
    header: DefaultReply,
}

impl ReplyFrame {
    /// Wraps raw reply bytes, trimming them to the length the reply declares.
    pub fn parse(mut bytes: Vec<u8>) -> Result<Self, WireError> {
        let header = DefaultReply::parse(&bytes)?;
        let declared = bytes[MSG_LENGTH_BYTE] as usize * 4;
        if declared >= DEFAULT_REPLY_SIZE && declared < bytes.len() {
            bytes.truncate(declared);
        }
        Ok(ReplyFrame { bytes, header })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn header(&self) -> &DefaultReply {
        &self.header
    }

    pub fn function(&self) -> u8 {
        self.header.function
    }

    pub fn ioc_status(&self) -> IocStatus {
        self.header.ioc_status
    }

    pub fn log_info(&self) -> u32 {
        self.header.log_info
    }

    pub fn msg_context(&self) -> MsgContext {
        MsgContext::from_u32(self.header.msg_context)
    }

    pub fn is_continuation(&self) -> bool {
        self.header.is_continuation()
    }
}

/// Counters kept by the dispatcher.
#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    pub(crate) address: AtomicU64,
    pub(crate) turbo: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub address_replies: u64,
    pub turbo_replies: u64,
    pub dropped: u64,
}

impl DispatchCounters {
    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            address_replies: self.address.load(Ordering::Relaxed),
            turbo_replies: self.turbo.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn drop_one(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl Ioc {
    /// Drains the reply FIFO. Returns the number of descriptors read.
    ///
    /// Reply callbacks run on the calling thread with the dispatch lock held; they must not wait
    /// for another command's reply.
    pub fn process_replies(&self) -> usize {
        let _order = lock(&self.dispatch_lock);
        let mut seen = 0;
        loop {
            let raw = self.hw.read_reg(Register::ReplyQueue);
            if raw == REPLY_FIFO_EMPTY {
                break;
            }
            seen += 1;
            self.dispatch_one(raw);
        }
        seen
    }

    fn dispatch_one(&self, raw: u32) {
        match ReplyDescriptor::decode(raw) {
            Err(err) => {
                tracing::error!(ioc = %self.name, raw = format_args!("{raw:#010x}"), %err, "dropping reply descriptor");
                self.counters.drop_one();
            }
            Ok(ReplyDescriptor::Turbo(TurboReply::ScsiInitiator { context })) => {
                self.counters.turbo.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(ioc = %self.name, req_idx = context.req_idx, cb_idx = context.cb_idx, "turbo reply");
                self.complete(context, None);
            }
            Ok(ReplyDescriptor::Turbo(TurboReply::ScsiTarget { io_index })) => {
                self.counters.turbo.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(ioc = %self.name, io_index, "target-mode turbo reply without a consumer");
            }
            Ok(ReplyDescriptor::Turbo(TurboReply::Lan { raw })) => {
                self.counters.turbo.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(ioc = %self.name, raw = format_args!("{raw:#010x}"), "LAN turbo reply without a consumer");
            }
            Ok(ReplyDescriptor::Address { frame_addr }) => self.address_reply(frame_addr),
        }
    }

    fn address_reply(&self, frame_addr: u64) {
        let Some(q) = self.queues.get() else {
            tracing::error!(ioc = %self.name, frame_addr, "address reply before queues exist");
            self.counters.drop_one();
            return;
        };
        let size = q.reply_frame_size;
        let in_ring = q.reply_ring.contains(frame_addr, size)
            && (frame_addr - q.reply_ring.bus_addr) % size as u64 == 0;
        if !in_ring {
            tracing::error!(
                ioc = %self.name,
                frame_addr = format_args!("{frame_addr:#x}"),
                "reply frame outside the reply ring; not re-posted"
            );
            self.counters.drop_one();
            return;
        }
        self.counters.address.fetch_add(1, Ordering::Relaxed);

        let mut bytes = vec![0u8; size];
        self.hw.read_dma(frame_addr, &mut bytes);
        match ReplyFrame::parse(bytes) {
            Ok(reply) => {
                let status = reply.ioc_status();
                if status.log_info_available() {
                    let detail = self.bus_type().decoder().decode(reply.log_info());
                    tracing::warn!(
                        ioc = %self.name,
                        function = reply.function(),
                        %status,
                        log_info = format_args!("{:#010x}", reply.log_info()),
                        %detail,
                        "reply carries log info"
                    );
                } else if !status.is_success() {
                    tracing::debug!(ioc = %self.name, function = reply.function(), %status, "reply status");
                }
                self.complete(reply.msg_context(), Some(&reply));
            }
            Err(err) => {
                tracing::error!(ioc = %self.name, %err, "malformed reply frame dropped");
                self.counters.drop_one();
            }
        }

        self.hw.write_reg(Register::ReplyQueue, frame_addr as u32);
    }

    fn complete(&self, ctx: MsgContext, reply: Option<&ReplyFrame>) {
        let Some(cb) = CallbackIndex::new(ctx.cb_idx) else {
            tracing::warn!(ioc = %self.name, cb_idx = ctx.cb_idx, req_idx = ctx.req_idx, "reply for invalid callback index dropped");
            self.counters.drop_one();
            return;
        };
        let Some(callback) = self.registry.reply_callback(cb) else {
            tracing::warn!(ioc = %self.name, cb_idx = ctx.cb_idx, req_idx = ctx.req_idx, "reply for unregistered consumer dropped");
            self.counters.drop_one();
            return;
        };
        let Some(q) = self.queues.get() else {
            self.counters.drop_one();
            return;
        };

        let index = ContextIndex(ctx.req_idx);
        let release = {
            let mut frame = match q.arena.resolve_submitted(index, cb) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::error!(ioc = %self.name, %err, "reply does not resolve to a frame");
                    self.counters.drop_one();
                    return;
                }
            };
            callback(self, &mut frame, reply)
        };

        if release {
            q.chains.release_for_request(index.0);
            if let Err(err) = q.arena.release(index.0) {
                tracing::warn!(ioc = %self.name, %err, "frame already released by its consumer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpt_protocol::{Function, MsgFlags};

    #[test]
    fn reply_frame_trims_to_declared_length() {
        let mut bytes = DefaultReply::new(Function::PortEnable, 0x0002_0005, IocStatus(0x8002))
            .to_bytes()
            .to_vec();
        bytes.resize(80, 0xee);
        let reply = ReplyFrame::parse(bytes).unwrap();
        assert_eq!(reply.bytes().len(), DEFAULT_REPLY_SIZE);
        assert_eq!(reply.function(), Function::PortEnable as u8);
        assert_eq!(reply.msg_context(), MsgContext::new(5, 2));
        assert!(reply.ioc_status().log_info_available());
        assert!(!reply.is_continuation());
    }

    #[test]
    fn continuation_flag_is_visible() {
        let mut header = DefaultReply::new(Function::EventNotification, 0, IocStatus(0));
        header.msg_flags = MsgFlags::CONTINUATION_REPLY;
        let reply = ReplyFrame::parse(header.to_bytes().to_vec()).unwrap();
        assert!(reply.is_continuation());
    }

    #[test]
    fn short_reply_is_rejected() {
        assert!(ReplyFrame::parse(vec![0; 8]).is_err());
    }
}
