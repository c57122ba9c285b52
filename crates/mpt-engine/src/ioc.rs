//! The controller object.
//!
//! An [`Ioc`] owns everything that belongs to one controller: the hardware handle, the request,
//! chain and reply regions (allocated once on the first bring-up and reused across resets), the
//! consumer registry, the handshake lock and the pending command records. Consumers interact
//! with it through frame handles; the engine itself is just another consumer (the base
//! consumer) registered at construction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use mpt_protocol::{
    AddressWidth, BusType, DoorbellStatus, EventAckRequest, EventNotificationReply, Function,
    IocFactsReply, IocState, PortFactsReply, RaidActionReply, RaidActionRequest, Register,
    SgeFlags, TaskMgmtReply, TaskMgmtRequest,
};

use crate::arena::{ArenaStats, Frame, FrameArena, FrameGuard, FrameHandle};
use crate::bringup::Phase;
use crate::chain::{ChainPool, SgEntry};
use crate::config::{CompletionMode, IocConfig};
use crate::context::ContextIndex;
use crate::dispatch::{DispatchCounters, DispatchStats, ReplyFrame};
use crate::error::{
    CommandError, ContextError, HandshakeError, RegistryError, ReleaseError, Result, Unavailable,
};
use crate::eventlog::{EventLog, EventRecord};
use crate::handshake::Handshake;
use crate::hw::{DmaRegion, Hardware};
use crate::pending::{CommandClass, CommandReply, PendingCommand};
use crate::registry::{
    CallbackIndex, ConsumerClass, EventHandler, Registry, ReplyCallback, ResetHandler,
};
use crate::sync::lock;

/// Queue sizes agreed with the controller on the first bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizing {
    pub frame_size: usize,
    pub request_depth: u16,
    pub reply_depth: u16,
    pub reply_frame_size: u16,
    pub chain_depth: u8,
}

pub(crate) struct Queues {
    pub(crate) arena: FrameArena,
    pub(crate) chains: ChainPool,
    pub(crate) reply_ring: DmaRegion,
    pub(crate) reply_depth: u16,
    pub(crate) reply_frame_size: usize,
    pub(crate) width: AddressWidth,
}

pub struct Ioc {
    pub(crate) name: String,
    pub(crate) hw: Arc<dyn Hardware>,
    pub(crate) config: IocConfig,
    pub(crate) registry: Registry,
    pub(crate) base_cb: CallbackIndex,
    pub(crate) queues: OnceLock<Queues>,
    pub(crate) sizing: OnceLock<Sizing>,
    pub(crate) facts: Mutex<Option<IocFactsReply>>,
    pub(crate) ports: Mutex<Vec<PortFactsReply>>,
    pub(crate) handshake: Handshake,
    pub(crate) pending: [PendingCommand; 3],
    pub(crate) dispatch_lock: Mutex<()>,
    pub(crate) recovery_lock: Mutex<()>,
    pub(crate) generation: AtomicU64,
    pub(crate) phase: Mutex<Phase>,
    pub(crate) resetting: AtomicBool,
    pub(crate) events_enabled: AtomicBool,
    pub(crate) event_frame: Mutex<Option<u16>>,
    pub(crate) events: EventLog,
    pub(crate) firmware: Mutex<Option<Arc<[u8]>>>,
    pub(crate) last_fault: Mutex<Option<u16>>,
    pub(crate) counters: DispatchCounters,
    pub(crate) recoveries: AtomicU64,
}

impl Ioc {
    /// Creates a controller object without touching the hardware.
    pub fn new(name: impl Into<String>, hw: Arc<dyn Hardware>, config: IocConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let registry = Registry::new();
        let base: ReplyCallback = Arc::new(Ioc::base_reply);
        let base_cb = registry.register(ConsumerClass::Base, base)?;
        let handshake = Handshake::new(
            name.clone(),
            config.handshake_ack_timeout(),
            config.poll_interval(),
        );
        Ok(Ioc {
            events: EventLog::new(config.event_log_size),
            name,
            hw,
            registry,
            base_cb,
            queues: OnceLock::new(),
            sizing: OnceLock::new(),
            facts: Mutex::new(None),
            ports: Mutex::new(Vec::new()),
            handshake,
            pending: std::array::from_fn(|_| PendingCommand::new()),
            dispatch_lock: Mutex::new(()),
            recovery_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            phase: Mutex::new(Phase::Down),
            resetting: AtomicBool::new(false),
            events_enabled: AtomicBool::new(false),
            event_frame: Mutex::new(None),
            firmware: Mutex::new(None),
            last_fault: Mutex::new(None),
            counters: DispatchCounters::default(),
            recoveries: AtomicU64::new(0),
            config,
        })
    }

    /// Creates the controller object and brings the controller to OPERATIONAL.
    pub fn attach(
        name: impl Into<String>,
        hw: Arc<dyn Hardware>,
        config: IocConfig,
    ) -> Result<Arc<Ioc>> {
        let ioc = Ioc::new(name, hw, config)?;
        ioc.bring_up()?;
        Ok(Arc::new(ioc))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &IocConfig {
        &self.config
    }

    pub fn hardware(&self) -> &Arc<dyn Hardware> {
        &self.hw
    }

    /// Callback index of the engine's own consumer.
    pub fn base_callback(&self) -> CallbackIndex {
        self.base_cb
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    pub(crate) fn set_phase(&self, next: Phase) {
        let mut phase = lock(&self.phase);
        if *phase != next {
            tracing::info!(ioc = %self.name, from = ?*phase, to = ?next, "phase");
            *phase = next;
        }
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }

    /// Controller state as the doorbell reports it right now.
    pub fn ioc_state(&self) -> IocState {
        DoorbellStatus::decode(self.hw.read_reg(Register::Doorbell)).state
    }

    pub fn facts(&self) -> Option<IocFactsReply> {
        *lock(&self.facts)
    }

    pub fn port_facts(&self) -> Vec<PortFactsReply> {
        lock(&self.ports).clone()
    }

    pub fn sizing(&self) -> Option<Sizing> {
        self.sizing.get().copied()
    }

    pub fn address_width(&self) -> Option<AddressWidth> {
        self.queues.get().map(|q| q.width)
    }

    pub fn events_enabled(&self) -> bool {
        self.events_enabled.load(Ordering::Acquire)
    }

    /// Events recorded since attach, oldest first.
    pub fn event_log(&self) -> Vec<EventRecord> {
        self.events.snapshot()
    }

    /// Firmware image uploaded from the controller, if it boots from host memory.
    pub fn cached_firmware(&self) -> Option<Arc<[u8]>> {
        lock(&self.firmware).clone()
    }

    pub fn last_fault(&self) -> Option<u16> {
        *lock(&self.last_fault)
    }

    pub fn arena_stats(&self) -> Option<ArenaStats> {
        self.queues.get().map(|q| q.arena.stats())
    }

    pub fn free_chains(&self) -> Option<usize> {
        self.queues.get().map(|q| q.chains.free_count())
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    pub(crate) fn bus_type(&self) -> BusType {
        lock(&self.ports)
            .first()
            .map_or(BusType::Spi, |p| BusType::from_port_type(p.port_type))
    }

    // Consumers.

    pub fn register(
        &self,
        class: ConsumerClass,
        callback: ReplyCallback,
    ) -> std::result::Result<CallbackIndex, RegistryError> {
        let idx = self.registry.register(class, callback)?;
        tracing::debug!(ioc = %self.name, cb_idx = idx.get(), ?class, "consumer registered");
        Ok(idx)
    }

    pub fn deregister(&self, idx: CallbackIndex) -> std::result::Result<(), RegistryError> {
        if idx == self.base_cb {
            return Err(RegistryError::Reserved(idx.get()));
        }
        self.registry.deregister(idx)
    }

    pub fn set_event_handler(
        &self,
        idx: CallbackIndex,
        handler: Option<EventHandler>,
    ) -> std::result::Result<(), RegistryError> {
        self.registry.set_event_handler(idx, handler)
    }

    pub fn set_reset_handler(
        &self,
        idx: CallbackIndex,
        handler: Option<ResetHandler>,
    ) -> std::result::Result<(), RegistryError> {
        self.registry.set_reset_handler(idx, handler)
    }

    // Frames.

    pub fn acquire_frame(&self, cb: CallbackIndex) -> std::result::Result<FrameHandle, Unavailable> {
        if self.phase() == Phase::Dead {
            return Err(Unavailable::Dead);
        }
        if self.is_resetting() {
            return Err(Unavailable::Resetting);
        }
        let q = self.queues.get().ok_or(Unavailable::Inactive)?;
        q.arena.acquire(cb)
    }

    /// Locks the frame behind `handle` for filling in.
    pub fn frame(&self, handle: FrameHandle) -> std::result::Result<FrameGuard<'_>, ContextError> {
        let q = self.queues.get().ok_or(ContextError::NoQueues)?;
        q.arena
            .resolve_owned(ContextIndex(handle.index()), handle.callback())
    }

    /// Returns a frame and any chain buffers linked to it.
    pub fn release_frame(&self, handle: FrameHandle) -> std::result::Result<(), ReleaseError> {
        let q = self
            .queues
            .get()
            .ok_or(ReleaseError::OutOfRange(handle.index()))?;
        q.chains.release_for_request(handle.index());
        q.arena.release(handle.index())
    }

    /// Writes a scatter-gather list into the frame at byte `offset`. On failure the frame is
    /// released and the command is abandoned.
    pub fn attach_sg(
        &self,
        handle: FrameHandle,
        offset: usize,
        entries: &[SgEntry],
        direction: SgeFlags,
    ) -> std::result::Result<usize, CommandError> {
        let q = self.queues.get().ok_or(ContextError::NoQueues)?;
        let built = {
            let mut frame = self.frame(handle)?;
            q.chains
                .build_sgl(&mut frame, offset, entries, direction, q.width)
        };
        match built {
            Ok(used) => Ok(used),
            Err(err) => {
                tracing::warn!(ioc = %self.name, req_idx = handle.index(), %err, "scatter-gather list abandoned");
                if let Err(release) = self.release_frame(handle) {
                    tracing::warn!(ioc = %self.name, %release, "frame release after chain failure");
                }
                Err(err.into())
            }
        }
    }

    /// Posts the frame to the request FIFO. On `Err` the frame stays with the caller.
    pub fn submit(&self, handle: FrameHandle) -> std::result::Result<(), Unavailable> {
        if self.phase() == Phase::Dead {
            return Err(Unavailable::Dead);
        }
        if self.is_resetting() {
            return Err(Unavailable::Resetting);
        }
        let q = self.queues.get().ok_or(Unavailable::Inactive)?;
        if !q.arena.is_active() {
            return Err(Unavailable::Inactive);
        }
        self.post(q, handle.index());
        Ok(())
    }

    /// Pushes a frame and its chains to DMA memory and rings the request FIFO.
    pub(crate) fn post(&self, q: &Queues, index: u16) {
        let bus_addr = match q.arena.lock_frame(index) {
            Some(frame) => {
                self.hw.write_dma(frame.bus_addr(), frame.as_bytes());
                frame.bus_addr()
            }
            None => return,
        };
        q.chains.flush_to_dma(index, self.hw.as_ref());
        q.arena.mark_submitted(index);
        tracing::trace!(ioc = %self.name, req_idx = index, "request posted");
        self.hw.write_reg(Register::RequestQueue, bus_addr as u32);
    }

    pub fn handshake(
        &self,
        request: &[u8],
        reply: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, HandshakeError> {
        self.handshake.exchange(self.hw.as_ref(), request, reply, timeout)
    }

    // Commands.

    /// Issues `request` on a base frame through the request FIFO and waits for its reply.
    ///
    /// Only one command per class is outstanding; other callers of the same class wait their
    /// turn. A timeout escalates to a controller recovery when `escalate_timeouts` is set.
    pub fn issue_command(
        &self,
        class: CommandClass,
        request: &[u8],
        timeout: Option<Duration>,
    ) -> std::result::Result<CommandReply, CommandError> {
        let timeout = timeout.unwrap_or_else(|| self.config.command_timeout());
        let res = self.issue_on_frame(class, request, timeout);
        self.after_command(&res);
        let reply = res?;
        if !reply.ioc_status.is_success() {
            return Err(CommandError::IocStatus {
                status: reply.ioc_status,
                log_info: reply.log_info,
            });
        }
        Ok(reply)
    }

    fn issue_on_frame(
        &self,
        class: CommandClass,
        request: &[u8],
        timeout: Duration,
    ) -> std::result::Result<CommandReply, CommandError> {
        let record = &self.pending[class.slot()];
        let _issue = record.issue_lock();

        let handle = self.acquire_frame(self.base_cb)?;
        let loaded = self.frame(handle)?.load(request);
        if let Err(err) = loaded {
            self.release_quietly(handle);
            return Err(err);
        }

        record.begin(handle.index());
        if let Err(busy) = self.submit(handle) {
            record.abandon();
            self.release_quietly(handle);
            return Err(busy.into());
        }
        self.wait_for(record, timeout)
    }

    /// Task management goes through the doorbell so that it can overtake queued I/O; its reply
    /// comes back through the reply FIFO.
    pub fn task_management(
        &self,
        request: TaskMgmtRequest,
        timeout: Option<Duration>,
    ) -> std::result::Result<TaskMgmtReply, CommandError> {
        let timeout = timeout.unwrap_or_else(|| self.config.command_timeout());
        let res = self.issue_task_management(request, timeout);
        self.after_command(&res);
        let reply = TaskMgmtReply::parse(&res?.bytes)?;
        if !reply.ioc_status.is_success() {
            return Err(CommandError::IocStatus {
                status: reply.ioc_status,
                log_info: reply.log_info,
            });
        }
        Ok(reply)
    }

    fn issue_task_management(
        &self,
        mut request: TaskMgmtRequest,
        timeout: Duration,
    ) -> std::result::Result<CommandReply, CommandError> {
        let record = &self.pending[CommandClass::TaskManagement.slot()];
        let _issue = record.issue_lock();

        let handle = self.acquire_frame(self.base_cb)?;
        let q = self.queues.get().ok_or(ContextError::NoQueues)?;
        request.msg_context = handle.context().to_u32();
        let bytes = request.to_bytes();
        let loaded = self.frame(handle)?.load(&bytes);
        if let Err(err) = loaded {
            self.release_quietly(handle);
            return Err(err);
        }

        record.begin(handle.index());
        q.arena.mark_submitted(handle.index());
        if let Err(err) = self.handshake.send_only(self.hw.as_ref(), &bytes) {
            record.abandon();
            q.arena.mark_owned(handle.index());
            self.release_quietly(handle);
            return Err(err.into());
        }
        tracing::info!(
            ioc = %self.name,
            task = ?request.task_type,
            target = request.target_id,
            bus = request.bus,
            "task management issued"
        );
        self.wait_for(record, timeout)
    }

    pub fn raid_action(
        &self,
        request: RaidActionRequest,
        timeout: Option<Duration>,
    ) -> std::result::Result<RaidActionReply, CommandError> {
        let width = self
            .address_width()
            .ok_or(CommandError::Busy(Unavailable::Inactive))?;
        let mut bytes = vec![0u8; RaidActionRequest::encoded_len(width)];
        request.write(&mut bytes, width)?;
        let reply = self.issue_command(CommandClass::Internal, &bytes, timeout)?;
        let reply = RaidActionReply::parse(&reply.bytes)?;
        Ok(reply)
    }

    fn wait_for(
        &self,
        record: &PendingCommand,
        timeout: Duration,
    ) -> std::result::Result<CommandReply, CommandError> {
        match self.config.completion {
            CompletionMode::Polled => {
                let slice = self.config.poll_interval().max(Duration::from_millis(1));
                record.wait(timeout, slice, || {
                    self.process_replies();
                })
            }
            CompletionMode::External => record.wait(timeout, timeout, || {}),
        }
    }

    fn after_command(&self, res: &std::result::Result<CommandReply, CommandError>) {
        if let Err(CommandError::Timeout(after)) = res {
            if self.config.escalate_timeouts {
                tracing::warn!(ioc = %self.name, ?after, "command timed out; recovering controller");
                if let Err(err) = self.recover("command timeout") {
                    tracing::error!(ioc = %self.name, %err, "recovery after command timeout failed");
                }
            } else {
                tracing::warn!(ioc = %self.name, ?after, "command timed out; frame stays with the controller");
            }
        }
    }

    fn release_quietly(&self, handle: FrameHandle) {
        if let Err(err) = self.release_frame(handle) {
            tracing::warn!(ioc = %self.name, %err, "frame release failed");
        }
    }

    // The base consumer.

    fn base_reply(ioc: &Ioc, frame: &mut Frame, reply: Option<&ReplyFrame>) -> bool {
        let index = frame.index();
        if let Some(reply) = reply {
            if reply.function() == Function::EventNotification as u8 {
                return ioc.handle_event(index, reply);
            }
            if reply.function() == Function::EventAck as u8 {
                return true;
            }
        }

        let command = match reply {
            Some(r) => CommandReply {
                bytes: r.bytes().to_vec(),
                ioc_status: r.ioc_status(),
                log_info: r.log_info(),
            },
            None => CommandReply::turbo(),
        };
        let waiting = ioc
            .pending
            .iter()
            .find(|record| record.pending_frame() == Some(index));
        match waiting {
            Some(record) => {
                record.complete_if_matches(index, command);
            }
            None => {
                tracing::debug!(ioc = %ioc.name, req_idx = index, function = frame.function(), "unsolicited reply on a base frame");
            }
        }
        true
    }

    fn handle_event(&self, index: u16, reply: &ReplyFrame) -> bool {
        let event = match EventNotificationReply::parse(reply.bytes()) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(ioc = %self.name, %err, "malformed event notification");
                return !reply.is_continuation();
            }
        };
        tracing::info!(
            ioc = %self.name,
            event = event.describe(),
            code = format_args!("{:#04x}", event.event),
            context = event.event_context,
            ack = event.ack_required,
            "event"
        );
        self.events.push(EventRecord::from(&event));
        if let Some(state) = event.new_event_state() {
            self.events_enabled.store(state != 0, Ordering::Release);
        }
        for (_, handler) in self.registry.event_handlers() {
            handler(self, &event);
        }
        if event.ack_required {
            self.ack_event(&event);
        }

        let keep = event.is_continuation();
        if !keep {
            let mut retained = lock(&self.event_frame);
            if *retained == Some(index) {
                *retained = None;
            }
        }
        !keep
    }

    fn ack_event(&self, event: &EventNotificationReply) {
        let handle = match self.acquire_frame(self.base_cb) {
            Ok(handle) => handle,
            Err(busy) => {
                tracing::warn!(ioc = %self.name, event = event.event, %busy, "no frame for event ack");
                return;
            }
        };
        let request = EventAckRequest {
            event: event.event,
            event_context: event.event_context,
            msg_context: 0,
        };
        let loaded = match self.frame(handle) {
            Ok(mut frame) => frame.load(&request.to_bytes()),
            Err(err) => {
                tracing::warn!(ioc = %self.name, %err, "event ack frame vanished");
                return;
            }
        };
        if let Err(err) = loaded {
            tracing::warn!(ioc = %self.name, %err, "event ack not sent");
            self.release_quietly(handle);
            return;
        }
        if let Err(busy) = self.submit(handle) {
            tracing::warn!(ioc = %self.name, %busy, "event ack not sent");
            self.release_quietly(handle);
        }
    }
}
