//! A software Fusion-MPT controller.
//!
//! [`SimIoc`] implements the engine's [`Hardware`] trait on top of an in-process model of the
//! system interface: the doorbell (including the handshake), the host diagnostic register with
//! its write-sequence lock, the request and reply FIFOs, and a window of DMA memory. Requests are
//! executed synchronously when they are posted, so replies are waiting in the reply FIFO by the
//! time the host looks.
//!
//! Supported messages:
//! - Handshake: IOC facts, port facts, IOC init, port enable, firmware upload, task management
//!   (send-only; the reply is posted to the reply FIFO)
//! - Request FIFO: SCSI I/O (turbo reply, SGL walked), port enable, event notification, event
//!   ack, RAID action, task management
//!
//! Anything else is answered with `INVALID_FUNCTION`.
//!
//! Failure injection (faults, silent doorbells, held or swallowed requests, resets that never
//! complete) is exposed through setters so tests can drive the engine's error paths.

use std::sync::{Mutex, MutexGuard};

use mpt_engine::{DmaError, DmaRegion, Hardware};
use mpt_protocol::{IocState, MsgContext, PortFactsReply, Register, WhoInit};

mod controller;
pub mod memory;
mod messages;

use controller::SimController;

/// Fault code reported when a downloaded image does not match the firmware.
pub const FAULT_BAD_IMAGE: u16 = 0x0d0c;

/// Static personality of the simulated controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub request_frame_dwords: u16,
    pub global_credits: u16,
    pub reply_queue_depth: u16,
    pub max_chain_depth: u8,
    /// One entry per port: its port type.
    pub ports: Vec<u8>,
    pub fw_version: u32,
    /// When set, the controller boots from a host-provided image and reports this one as its
    /// running firmware.
    pub firmware: Option<Vec<u8>>,
    pub initial_state: IocState,
    pub initial_who_init: WhoInit,
    pub dma_address_bits: u8,
    pub memory_base: u64,
    pub memory_limit: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            request_frame_dwords: 32,
            global_credits: 64,
            reply_queue_depth: 64,
            max_chain_depth: 8,
            ports: vec![PortFactsReply::PORT_TYPE_SCSI],
            fw_version: 0x0112_0300,
            firmware: None,
            initial_state: IocState::Ready,
            initial_who_init: WhoInit::NoOne,
            dma_address_bits: 32,
            memory_base: 0x1000_0000,
            memory_limit: 16 << 20,
        }
    }
}

/// What the controller has been asked to do so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimStats {
    pub handshakes: u64,
    pub requests: u64,
    pub message_unit_resets: u64,
    pub io_unit_resets: u64,
    pub hard_resets: u64,
    pub download_boots: u64,
    pub ioc_inits: u64,
    pub port_enables: u64,
    pub event_notifications: u64,
    pub event_acks: u64,
    pub fw_uploads: u64,
    pub task_mgmt: u64,
    pub raid_actions: u64,
    pub scsi_io: u64,
    /// Address replies lost because no reply frame was posted.
    pub dropped_replies: u64,
    /// Requests posted while the controller was not operational.
    pub ignored_requests: u64,
}

/// The scatter-gather list of the last SCSI I/O, as the controller walked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRecord {
    pub context: MsgContext,
    pub elements: usize,
    pub bytes: u64,
    pub chains: usize,
    /// Whether the walk reached an end-of-list element.
    pub terminated: bool,
}

pub struct SimIoc {
    inner: Mutex<SimController>,
}

fn lock(m: &Mutex<SimController>) -> MutexGuard<'_, SimController> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Default for SimIoc {
    fn default() -> Self {
        SimIoc::new(SimConfig::default())
    }
}

impl SimIoc {
    pub fn new(config: SimConfig) -> Self {
        SimIoc {
            inner: Mutex::new(SimController::new(config)),
        }
    }

    pub fn state(&self) -> IocState {
        lock(&self.inner).state
    }

    pub fn stats(&self) -> SimStats {
        lock(&self.inner).stats
    }

    /// Event notification state the firmware currently holds (non-zero means on).
    pub fn event_state(&self) -> u8 {
        lock(&self.inner).event_state
    }

    pub fn last_io(&self) -> Option<IoRecord> {
        lock(&self.inner).last_io
    }

    /// Reply frames posted by the host and not yet used.
    pub fn free_reply_frames(&self) -> usize {
        lock(&self.inner).reply_free.len()
    }

    /// Reply frame size the host asked for in IOC init.
    pub fn reply_frame_size(&self) -> u16 {
        lock(&self.inner).reply_frame_size
    }

    pub fn held_requests(&self) -> usize {
        lock(&self.inner).held.len()
    }

    /// Whether the engine gave up on the controller and detached it.
    pub fn is_removed(&self) -> bool {
        lock(&self.inner).removed
    }

    pub fn dma_bytes_used(&self) -> usize {
        lock(&self.inner).memory.used()
    }

    /// Puts the firmware into the FAULT state with `code`.
    pub fn inject_fault(&self, code: u16) {
        lock(&self.inner).fault(code);
    }

    /// Swallows handshake requests without replying.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.inner).silent = silent;
    }

    /// Queues posted requests instead of executing them until [`SimIoc::release_held`].
    pub fn set_hold_requests(&self, hold: bool) {
        lock(&self.inner).hold_requests = hold;
    }

    /// Executes every held request. Returns how many ran.
    pub fn release_held(&self) -> usize {
        lock(&self.inner).release_held()
    }

    /// Accepts posted requests and never answers them.
    pub fn set_drop_requests(&self, drop: bool) {
        lock(&self.inner).drop_requests = drop;
    }

    /// Makes firmware upload report an image size different from the one requested.
    pub fn set_fw_size_mismatch(&self, mismatch: bool) {
        lock(&self.inner).fw_size_mismatch = mismatch;
    }

    /// Makes the adapter reset bit stick, so a hard reset never completes.
    pub fn set_reset_hangs(&self, hangs: bool) {
        lock(&self.inner).reset_hangs = hangs;
    }

    /// Pushes a raw descriptor onto the reply FIFO.
    pub fn push_descriptor(&self, raw: u32) {
        lock(&self.inner).reply_fifo.push_back(raw);
    }

    /// Posts an address reply carrying `reply` into the next free reply frame.
    pub fn post_reply(&self, reply: &[u8]) -> bool {
        lock(&self.inner).address_reply(reply)
    }

    /// Raises an event on the host's event notification frame. Returns `false` if event
    /// notification is off or no reply frame is free.
    pub fn post_event(&self, event: u32, data: &[u32], ack_required: bool) -> bool {
        lock(&self.inner).post_event(event, data, ack_required)
    }
}

impl Hardware for SimIoc {
    fn read_reg(&self, reg: Register) -> u32 {
        lock(&self.inner).read_reg(reg)
    }

    fn write_reg(&self, reg: Register, value: u32) {
        lock(&self.inner).write_reg(reg, value)
    }

    fn alloc_dma(&self, len: usize, align: usize) -> Result<DmaRegion, DmaError> {
        lock(&self.inner).memory.alloc(len, align)
    }

    fn write_dma(&self, addr: u64, data: &[u8]) {
        let mut ctl = lock(&self.inner);
        if !ctl.memory.write(addr, data) {
            tracing::warn!(addr = format_args!("{addr:#x}"), len = data.len(), "sim: DMA write outside memory");
        }
    }

    fn read_dma(&self, addr: u64, buf: &mut [u8]) {
        let ctl = lock(&self.inner);
        if !ctl.memory.read(addr, buf) {
            tracing::warn!(addr = format_args!("{addr:#x}"), len = buf.len(), "sim: DMA read outside memory");
        }
    }

    fn dma_address_bits(&self) -> u8 {
        lock(&self.inner).config.dma_address_bits
    }

    fn remove_device(&self) {
        lock(&self.inner).removed = true;
    }
}
