//! Bring-up: taking a controller from whatever state it is in to OPERATIONAL.
//!
//! A pass runs the phases in order (ready, facts, queues, init, firmware, events) and is shared
//! by the first attach, an explicit re-initialization and recovery. Work that only makes sense
//! once (port facts, queue sizing, DMA allocation) is skipped on later passes.

use std::time::Duration;

use mpt_protocol::{
    AddressWidth, DefaultReply, DoorbellFunction, DoorbellStatus, EventAckRequest,
    EventNotificationRequest, IocFactsReply, IocFactsRequest, IocInitRequest, IocState, IocStatus,
    PortEnableRequest, PortFactsReply, PortFactsRequest, Register, TaskMgmtRequest, WhoInit,
    WireError,
};
use mpt_protocol::regs::{HostInterruptMask, DOORBELL_FUNCTION_SHIFT};

use crate::arena::FrameArena;
use crate::chain::ChainPool;
use crate::config::IocConfig;
use crate::error::{BringUpError, DmaError, Unavailable};
use crate::ioc::{Ioc, Queues, Sizing};
use crate::poll::{poll_until, retry};
use crate::sync::lock;

/// Where the controller is in its life cycle, as far as the engine knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Down,
    MakingReady,
    NegotiatingFacts,
    PrimingQueues,
    Initializing,
    UploadingFirmware,
    EnablingEvents,
    Operational,
    Faulted,
    Recovering,
    Dead,
}

const REPLY_SCRATCH: usize = 128;
const DMA_ALIGN: usize = 16;
const FOUR_GIB: u64 = 1 << 32;

/// The largest request the engine itself puts on a frame.
const MIN_FRAME_SIZE: usize = max(
    TaskMgmtRequest::SIZE,
    max(EventNotificationRequest::SIZE, EventAckRequest::SIZE),
);

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Derives queue sizes from the configured caps and what the controller reports.
pub(crate) fn derive_sizing(
    config: &IocConfig,
    facts: &IocFactsReply,
) -> Result<Sizing, BringUpError> {
    fn cap<T: Ord + Copy + Default>(configured: T, reported: T) -> T {
        if reported == T::default() {
            configured
        } else {
            configured.min(reported)
        }
    }
    let frame_size = cap(config.frame_size, facts.request_frame_size as usize * 4);
    if frame_size < MIN_FRAME_SIZE || frame_size % 4 != 0 {
        return Err(BringUpError::FrameTooSmall {
            frame_size,
            min: MIN_FRAME_SIZE,
        });
    }
    Ok(Sizing {
        frame_size,
        request_depth: cap(config.max_request_depth, facts.global_credits),
        reply_depth: cap(config.max_reply_depth, facts.reply_queue_depth),
        reply_frame_size: config.reply_frame_size,
        chain_depth: cap(config.max_chain_depth, facts.max_chain_depth),
    })
}

fn check_status(step: &'static str, status: IocStatus, log_info: u32) -> Result<(), BringUpError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(BringUpError::Status {
            step,
            status,
            log_info,
        })
    }
}

impl Ioc {
    /// Brings the controller to OPERATIONAL. Safe to call on a running controller: it is reset
    /// through the message unit and re-initialized, and frames it held are reclaimed.
    pub fn bring_up(&self) -> Result<(), BringUpError> {
        let _serial = lock(&self.recovery_lock);
        if self.phase() == Phase::Dead {
            return Err(BringUpError::Dead);
        }
        match self.bring_up_pass() {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(ioc = %self.name, %err, "bring-up failed");
                self.set_phase(Phase::Faulted);
                Err(err)
            }
        }
    }

    pub(crate) fn bring_up_pass(&self) -> Result<(), BringUpError> {
        if let Some(q) = self.queues.get() {
            q.arena.set_active(false);
        }

        self.set_phase(Phase::MakingReady);
        self.make_ready()?;

        self.set_phase(Phase::NegotiatingFacts);
        let facts = retry(self.config.facts_retries, self.register_poll(), |attempt| {
            self.get_facts().map_err(|err| {
                tracing::warn!(ioc = %self.name, attempt, %err, "IOC facts failed");
                err
            })
        })?;
        *lock(&self.facts) = Some(facts);
        let sizing = match self.sizing.get() {
            Some(sizing) => *sizing,
            None => {
                let ports = self.get_port_facts(&facts)?;
                *lock(&self.ports) = ports;
                let sizing = derive_sizing(&self.config, &facts)?;
                tracing::info!(
                    ioc = %self.name,
                    frame_size = sizing.frame_size,
                    request_depth = sizing.request_depth,
                    reply_depth = sizing.reply_depth,
                    chain_depth = sizing.chain_depth,
                    "queue sizing"
                );
                *self.sizing.get_or_init(|| sizing)
            }
        };

        self.set_phase(Phase::PrimingQueues);
        let q = self.prime_queues(&facts, sizing)?;
        self.hw.write_reg(
            Register::HostInterruptMask,
            HostInterruptMask::DOORBELL.bits(),
        );

        self.set_phase(Phase::Initializing);
        self.send_ioc_init(&facts, q)?;
        self.wait_operational()?;
        self.enable_ports(&facts)?;
        q.arena.set_active(true);

        if facts.fw_download_boot() && self.cached_firmware().is_none() {
            self.set_phase(Phase::UploadingFirmware);
            self.upload_firmware(&facts, q)?;
        }

        self.set_phase(Phase::EnablingEvents);
        if facts.events_enabled() {
            tracing::debug!(ioc = %self.name, "event notification already on");
        } else {
            self.enable_events(q)?;
        }

        self.set_phase(Phase::Operational);
        self.process_replies();
        Ok(())
    }

    pub(crate) fn register_poll(&self) -> Duration {
        self.config.poll_interval().max(Duration::from_millis(1))
    }

    fn doorbell(&self) -> DoorbellStatus {
        DoorbellStatus::decode(self.hw.read_reg(Register::Doorbell))
    }

    fn make_ready(&self) -> Result<(), BringUpError> {
        let db = self.doorbell();
        if db.active {
            tracing::warn!(ioc = %self.name, "doorbell stuck active; hard reset");
            return self.hard_reset();
        }
        match db.state {
            IocState::Ready => Ok(()),
            IocState::Fault => {
                let code = db.fault_code();
                *lock(&self.last_fault) = Some(code);
                tracing::error!(ioc = %self.name, code = format_args!("{code:#06x}"), "controller faulted; hard reset");
                self.hard_reset()
            }
            IocState::Operational if db.who_init == WhoInit::PciPeer as u8 => {
                Err(BringUpError::OwnedByPeer)
            }
            IocState::Operational => {
                tracing::info!(ioc = %self.name, "controller operational; message unit reset");
                match self.message_unit_reset() {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        tracing::warn!(ioc = %self.name, %err, "message unit reset failed; hard reset");
                        self.hard_reset()
                    }
                }
            }
            IocState::Reset | IocState::Unknown(_) => self.wait_ready(),
        }
    }

    pub(crate) fn ring_doorbell(&self, function: DoorbellFunction) {
        self.hw
            .write_reg(Register::Doorbell, (function as u32) << DOORBELL_FUNCTION_SHIFT);
    }

    fn message_unit_reset(&self) -> Result<(), BringUpError> {
        self.ring_doorbell(DoorbellFunction::MessageUnitReset);
        self.wait_ready()
    }

    /// Waits for READY, nudging the controller along: a message unit reset while it is still
    /// operational, an I/O unit reset while it sits in RESET.
    pub(crate) fn wait_ready(&self) -> Result<(), BringUpError> {
        let mut kicked: Option<IocState> = None;
        let mut last = IocState::Reset;
        let res = poll_until(self.register_poll(), self.config.ready_timeout(), || {
            let db = self.doorbell();
            last = db.state;
            match db.state {
                IocState::Ready => Some(Ok(())),
                IocState::Fault => Some(Err(BringUpError::Faulted(db.fault_code()))),
                IocState::Operational if kicked != Some(IocState::Operational) => {
                    kicked = Some(IocState::Operational);
                    self.ring_doorbell(DoorbellFunction::MessageUnitReset);
                    None
                }
                IocState::Reset if kicked != Some(IocState::Reset) => {
                    kicked = Some(IocState::Reset);
                    self.ring_doorbell(DoorbellFunction::IoUnitReset);
                    None
                }
                _ => None,
            }
        });
        match res {
            Ok(outcome) => outcome,
            Err(_) => Err(BringUpError::NotReady(last)),
        }
    }

    fn handshake_step<T>(
        &self,
        step: &'static str,
        request: &[u8],
        timeout: Duration,
        parse: impl FnOnce(&[u8]) -> Result<T, WireError>,
    ) -> Result<T, BringUpError> {
        let mut reply = [0u8; REPLY_SCRATCH];
        let n = self
            .handshake
            .exchange(self.hw.as_ref(), request, &mut reply, timeout)
            .map_err(|source| BringUpError::Handshake { step, source })?;
        parse(&reply[..n]).map_err(|source| BringUpError::Decode { step, source })
    }

    fn get_facts(&self) -> Result<IocFactsReply, BringUpError> {
        let request = IocFactsRequest { msg_context: 0 }.to_bytes();
        let facts = self.handshake_step(
            "IOC facts",
            &request,
            self.config.facts_timeout(),
            IocFactsReply::parse,
        )?;
        check_status("IOC facts", facts.ioc_status, facts.log_info)?;
        tracing::debug!(
            ioc = %self.name,
            fw_version = format_args!("{:#010x}", facts.fw_version),
            ports = facts.number_of_ports,
            credits = facts.global_credits,
            "IOC facts"
        );
        Ok(facts)
    }

    fn get_port_facts(&self, facts: &IocFactsReply) -> Result<Vec<PortFactsReply>, BringUpError> {
        (0..facts.number_of_ports)
            .map(|port_number| {
                let request = PortFactsRequest {
                    port_number,
                    msg_context: 0,
                }
                .to_bytes();
                let reply = self.handshake_step(
                    "port facts",
                    &request,
                    self.config.facts_timeout(),
                    PortFactsReply::parse,
                )?;
                check_status("port facts", reply.ioc_status, reply.log_info)?;
                tracing::debug!(ioc = %self.name, port = port_number, port_type = reply.port_type, "port facts");
                Ok(reply)
            })
            .collect()
    }

    fn prime_queues(&self, facts: &IocFactsReply, sizing: Sizing) -> Result<&Queues, BringUpError> {
        let q = match self.queues.get() {
            Some(q) => q,
            None => {
                let q = self.allocate_queues(sizing)?;
                self.queues.get_or_init(|| q)
            }
        };

        // Across a message unit reset the controller keeps its event state and the frame it
        // posts events on. A hard reset clears both.
        let retain = if facts.events_enabled() {
            *lock(&self.event_frame)
        } else {
            lock(&self.event_frame).take();
            None
        };
        {
            let _order = lock(&self.dispatch_lock);
            self.reclaim_in_flight(q, retain);
        }

        for i in 0..q.reply_depth as u64 {
            let addr = q.reply_ring.bus_addr + i * q.reply_frame_size as u64;
            self.hw.write_reg(Register::ReplyQueue, addr as u32);
        }
        Ok(q)
    }

    fn allocate_queues(&self, sizing: Sizing) -> Result<Queues, BringUpError> {
        let width = AddressWidth::for_dma_bits(self.hw.dma_address_bits());
        let chain_count =
            (sizing.chain_depth as usize * sizing.request_depth as usize).min(u16::MAX as usize);

        let request = self
            .hw
            .alloc_dma(sizing.frame_size * sizing.request_depth as usize, DMA_ALIGN)?;
        if request.bus_addr / FOUR_GIB != (request.end() - 1) / FOUR_GIB {
            return Err(DmaError::AddressRange {
                len: request.len,
                bits: 32,
            }
            .into());
        }
        let chains = self
            .hw
            .alloc_dma((sizing.frame_size * chain_count).max(DMA_ALIGN), DMA_ALIGN)?;
        let reply_len = sizing.reply_frame_size as usize * sizing.reply_depth as usize;
        let reply = self.hw.alloc_dma(reply_len, DMA_ALIGN)?;
        if reply.end() > FOUR_GIB {
            return Err(DmaError::AddressRange {
                len: reply_len,
                bits: 32,
            }
            .into());
        }
        if width == AddressWidth::Sge32 && (request.end() > FOUR_GIB || chains.end() > FOUR_GIB) {
            return Err(DmaError::AddressRange {
                len: request.len,
                bits: 32,
            }
            .into());
        }

        tracing::info!(
            ioc = %self.name,
            request_base = format_args!("{:#x}", request.bus_addr),
            reply_base = format_args!("{:#x}", reply.bus_addr),
            chains = chain_count,
            ?width,
            "queues allocated"
        );
        Ok(Queues {
            arena: FrameArena::new(request.bus_addr, sizing.frame_size, sizing.request_depth),
            chains: ChainPool::new(
                chains.bus_addr,
                sizing.frame_size,
                chain_count as u16,
                sizing.request_depth,
            ),
            reply_ring: reply,
            reply_depth: sizing.reply_depth,
            reply_frame_size: sizing.reply_frame_size as usize,
            width,
        })
    }

    fn send_ioc_init(&self, facts: &IocFactsReply, q: &Queues) -> Result<(), BringUpError> {
        let request = IocInitRequest {
            who_init: WhoInit::HostDriver,
            flags: 0,
            max_devices: facts.max_devices,
            max_buses: facts.max_buses,
            msg_context: 0,
            reply_frame_size: q.reply_frame_size as u16,
            host_mfa_high_addr: (q.arena.base() >> 32) as u32,
            sense_buffer_high_addr: 0,
            reply_fifo_host_signaling_addr: 0,
            msg_version: facts.msg_version,
            header_version: facts.header_version,
        }
        .to_bytes();
        let reply = self.handshake_step(
            "IOC init",
            &request,
            self.config.init_timeout(),
            DefaultReply::parse,
        )?;
        check_status("IOC init", reply.ioc_status, reply.log_info)
    }

    fn wait_operational(&self) -> Result<(), BringUpError> {
        let bound = self.config.operational_timeout();
        let res = poll_until(self.register_poll(), bound, || {
            let db = self.doorbell();
            match db.state {
                IocState::Operational => Some(Ok(())),
                IocState::Fault => Some(Err(BringUpError::Faulted(db.fault_code()))),
                _ => None,
            }
        });
        match res {
            Ok(outcome) => outcome,
            Err(_) => Err(BringUpError::OperationalTimeout(bound)),
        }
    }

    fn enable_ports(&self, facts: &IocFactsReply) -> Result<(), BringUpError> {
        for port_number in 0..facts.number_of_ports {
            let request = PortEnableRequest {
                port_number,
                msg_context: 0,
            }
            .to_bytes();
            let reply = self.handshake_step(
                "port enable",
                &request,
                self.config.port_enable_timeout(),
                DefaultReply::parse,
            )?;
            check_status("port enable", reply.ioc_status, reply.log_info)?;
        }
        Ok(())
    }

    fn enable_events(&self, q: &Queues) -> Result<(), BringUpError> {
        let handle = q
            .arena
            .acquire(self.base_cb)
            .map_err(BringUpError::Events)?;
        let request = EventNotificationRequest {
            switch: true,
            msg_context: 0,
        }
        .to_bytes();
        let loaded = match q.arena.lock_frame(handle.index()) {
            Some(mut frame) => frame.load(&request),
            None => return Err(BringUpError::Events(Unavailable::Inactive)),
        };
        if loaded.is_err() {
            if let Err(err) = q.arena.release(handle.index()) {
                tracing::warn!(ioc = %self.name, %err, "event frame release");
            }
            return Err(BringUpError::FrameTooSmall {
                frame_size: q.arena.frame_size(),
                min: MIN_FRAME_SIZE,
            });
        }
        *lock(&self.event_frame) = Some(handle.index());
        self.post(q, handle.index());
        tracing::info!(ioc = %self.name, req_idx = handle.index(), "event notification requested");
        Ok(())
    }
}
