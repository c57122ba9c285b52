use std::collections::VecDeque;

use mpt_protocol::header::FUNCTION_BYTE;
use mpt_protocol::regs::{
    HostDiagnostic, HostInterruptStatus, DOORBELL_ACTIVE, DOORBELL_ADD_DWORDS_SHIFT, DOORBELL_FUNCTION_SHIFT,
    DOORBELL_WHO_INIT_SHIFT, REPLY_FIFO_EMPTY, WRITE_SEQUENCE_KEYS,
};
use mpt_protocol::{DoorbellFunction, Function, IocState, Register, WhoInit};

use crate::memory::DmaMemory;
use crate::{IoRecord, SimConfig, SimStats, FAULT_BAD_IMAGE};

/// Doorbell handshake progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Handshake {
    Idle,
    /// Started; waiting for the host to clear the doorbell interrupt.
    Announced { dwords: usize },
    Receiving { left: usize, words: Vec<u32> },
    Replying { words: VecDeque<u16> },
    /// Every reply word consumed; the next interrupt clear ends the handshake.
    Final,
}

pub(crate) struct SimController {
    pub(crate) config: SimConfig,
    pub(crate) memory: DmaMemory,

    pub(crate) state: IocState,
    pub(crate) who_init: WhoInit,
    pub(crate) fault_code: u16,

    // Registers.
    pub(crate) handshake: Handshake,
    pub(crate) doorbell_int: bool,
    pub(crate) host_interrupt_mask: u32,
    pub(crate) diag: HostDiagnostic,
    pub(crate) sequence: usize,
    pub(crate) diag_rw_addr: u32,
    pub(crate) downloaded: Vec<u8>,

    // Firmware state.
    pub(crate) reply_frame_size: u16,
    pub(crate) event_state: u8,
    pub(crate) event_frame: Option<u32>,
    pub(crate) event_context: u32,
    pub(crate) reply_free: VecDeque<u32>,
    pub(crate) reply_fifo: VecDeque<u32>,
    pub(crate) held: VecDeque<u32>,
    pub(crate) last_io: Option<IoRecord>,

    // Failure injection.
    pub(crate) silent: bool,
    pub(crate) hold_requests: bool,
    pub(crate) drop_requests: bool,
    pub(crate) fw_size_mismatch: bool,
    pub(crate) reset_hangs: bool,

    pub(crate) removed: bool,
    pub(crate) stats: SimStats,
}

impl SimController {
    pub(crate) fn new(config: SimConfig) -> Self {
        SimController {
            memory: DmaMemory::new(config.memory_base, config.memory_limit),
            state: config.initial_state,
            who_init: config.initial_who_init,
            fault_code: 0,
            handshake: Handshake::Idle,
            doorbell_int: false,
            host_interrupt_mask: 0,
            diag: HostDiagnostic::empty(),
            sequence: 0,
            diag_rw_addr: 0,
            downloaded: Vec::new(),
            reply_frame_size: 0,
            event_state: 0,
            event_frame: None,
            event_context: 0,
            reply_free: VecDeque::new(),
            reply_fifo: VecDeque::new(),
            held: VecDeque::new(),
            last_io: None,
            silent: false,
            hold_requests: false,
            drop_requests: false,
            fw_size_mismatch: false,
            reset_hangs: false,
            removed: false,
            stats: SimStats::default(),
            config,
        }
    }

    pub(crate) fn read_reg(&mut self, reg: Register) -> u32 {
        match reg {
            Register::Doorbell => self.doorbell(),
            Register::HostInterruptStatus => {
                let mut his = HostInterruptStatus::empty();
                if self.doorbell_int {
                    his |= HostInterruptStatus::DOORBELL_INTERRUPT;
                }
                if !self.reply_fifo.is_empty() {
                    his |= HostInterruptStatus::REPLY_INTERRUPT;
                }
                his.bits()
            }
            Register::HostInterruptMask => self.host_interrupt_mask,
            Register::HostDiagnostic => self.diag.bits(),
            Register::DiagRwAddress => self.diag_rw_addr,
            Register::ReplyQueue => self.reply_fifo.pop_front().unwrap_or(REPLY_FIFO_EMPTY),
            _ => 0,
        }
    }

    pub(crate) fn write_reg(&mut self, reg: Register, value: u32) {
        match reg {
            Register::Doorbell => self.write_doorbell(value),
            Register::HostInterruptStatus => self.clear_doorbell_int(),
            Register::HostInterruptMask => self.host_interrupt_mask = value,
            Register::WriteSequence => self.write_sequence(value),
            Register::HostDiagnostic => self.write_diag(HostDiagnostic::from_bits_retain(value)),
            Register::DiagRwAddress => self.diag_rw_addr = value,
            Register::DiagRwData => self.write_diag_data(value),
            Register::RequestQueue => self.post_request(value),
            Register::ReplyQueue => self.reply_free.push_back(value),
            Register::TestBase | Register::HighPriorityQueue => {}
        }
    }

    fn doorbell(&self) -> u32 {
        let mut raw = self.state.bits() | ((self.who_init as u32) << DOORBELL_WHO_INIT_SHIFT);
        if self.handshake != Handshake::Idle {
            raw |= DOORBELL_ACTIVE;
        }
        match &self.handshake {
            Handshake::Replying { words } => raw | words.front().copied().unwrap_or(0) as u32,
            _ if self.state == IocState::Fault => raw | self.fault_code as u32,
            _ => raw,
        }
    }

    fn write_doorbell(&mut self, value: u32) {
        match &mut self.handshake {
            Handshake::Idle => {
                let function = (value >> DOORBELL_FUNCTION_SHIFT) as u8;
                let dwords = ((value >> DOORBELL_ADD_DWORDS_SHIFT) & 0xff) as usize;
                match DoorbellFunction::from_u8(function) {
                    Some(DoorbellFunction::MessageUnitReset) => self.message_unit_reset(),
                    Some(DoorbellFunction::IoUnitReset) => self.io_unit_reset(),
                    Some(DoorbellFunction::Handshake) if self.state != IocState::Fault && dwords > 0 => {
                        self.stats.handshakes += 1;
                        self.handshake = Handshake::Announced { dwords };
                        self.doorbell_int = true;
                    }
                    _ => tracing::debug!(value = format_args!("{value:#010x}"), "sim: doorbell write ignored"),
                }
            }
            Handshake::Receiving { left, words } => {
                words.push(value);
                *left -= 1;
                if *left == 0 {
                    let words = std::mem::take(words);
                    self.finish_handshake(words);
                }
            }
            _ => {}
        }
    }

    fn clear_doorbell_int(&mut self) {
        self.doorbell_int = false;
        match &mut self.handshake {
            Handshake::Announced { dwords } => {
                let dwords = *dwords;
                self.handshake = Handshake::Receiving {
                    left: dwords,
                    words: Vec::with_capacity(dwords),
                };
            }
            Handshake::Replying { words } => {
                words.pop_front();
                if words.is_empty() {
                    self.handshake = Handshake::Final;
                }
                self.doorbell_int = true;
            }
            Handshake::Final => self.handshake = Handshake::Idle,
            _ => {}
        }
    }

    fn finish_handshake(&mut self, words: Vec<u32>) {
        let request: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        if self.silent {
            tracing::debug!("sim: handshake swallowed");
            self.handshake = Handshake::Idle;
            return;
        }
        let function = request.get(FUNCTION_BYTE).copied().unwrap_or(0xff);
        if function == Function::ScsiTaskMgmt as u8 {
            self.handshake = Handshake::Final;
            self.doorbell_int = true;
            self.execute(&request);
            return;
        }

        let reply = self.handshake_reply(function, &request);
        self.handshake = Handshake::Replying {
            words: reply
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        };
        self.doorbell_int = true;
    }

    pub(crate) fn fault(&mut self, code: u16) {
        tracing::debug!(code = format_args!("{code:#06x}"), "sim: firmware fault");
        self.state = IocState::Fault;
        self.fault_code = code;
        self.handshake = Handshake::Idle;
        self.doorbell_int = false;
    }

    fn clear_queues(&mut self) {
        self.reply_free.clear();
        self.reply_fifo.clear();
        self.held.clear();
        self.handshake = Handshake::Idle;
        self.doorbell_int = false;
    }

    /// Returns to READY keeping the event notification state.
    fn message_unit_reset(&mut self) {
        self.stats.message_unit_resets += 1;
        if self.state == IocState::Fault {
            return;
        }
        self.clear_queues();
        self.state = IocState::Ready;
    }

    fn io_unit_reset(&mut self) {
        self.stats.io_unit_resets += 1;
        if self.state == IocState::Fault {
            return;
        }
        self.clear_queues();
        self.event_state = 0;
        self.event_frame = None;
        self.state = IocState::Ready;
    }

    fn write_sequence(&mut self, value: u32) {
        if WRITE_SEQUENCE_KEYS.get(self.sequence) == Some(&value) {
            self.sequence += 1;
            if self.sequence == WRITE_SEQUENCE_KEYS.len() {
                self.diag |= HostDiagnostic::DRWE;
            }
            return;
        }
        self.diag -= HostDiagnostic::DRWE;
        self.sequence = usize::from(value == WRITE_SEQUENCE_KEYS[0]);
    }

    fn write_diag(&mut self, value: HostDiagnostic) {
        if !self.diag.contains(HostDiagnostic::DRWE) {
            tracing::debug!("sim: host diagnostic write while locked");
            return;
        }
        if value.contains(HostDiagnostic::RESET_ADAPTER) {
            self.hard_reset(value.contains(HostDiagnostic::DISABLE_ARM));
            return;
        }

        let held = self.diag.contains(HostDiagnostic::DISABLE_ARM);
        let kept = HostDiagnostic::DRWE | HostDiagnostic::RESET_HISTORY | HostDiagnostic::RESET_ADAPTER;
        let writable = HostDiagnostic::DISABLE_ARM
            | HostDiagnostic::PREVENT_IOC_BOOT
            | HostDiagnostic::DIAG_MEM_ENABLE
            | HostDiagnostic::CLEAR_FLASH_BAD_SIG;
        let mut next = (self.diag & kept) | (value & writable);
        if !value.contains(HostDiagnostic::RESET_HISTORY) {
            next -= HostDiagnostic::RESET_HISTORY;
        }
        self.diag = next;

        if held && !next.contains(HostDiagnostic::DISABLE_ARM) {
            self.boot_downloaded();
        }
    }

    fn hard_reset(&mut self, hold_arm: bool) {
        self.stats.hard_resets += 1;
        tracing::debug!(hold_arm, "sim: adapter reset");
        self.clear_queues();
        self.event_state = 0;
        self.event_frame = None;
        self.fault_code = 0;
        self.who_init = WhoInit::NoOne;
        self.downloaded.clear();

        self.diag = HostDiagnostic::DRWE | HostDiagnostic::RESET_HISTORY;
        if self.reset_hangs {
            self.diag |= HostDiagnostic::RESET_ADAPTER;
            self.state = IocState::Reset;
            return;
        }
        if hold_arm {
            self.diag |= HostDiagnostic::DISABLE_ARM;
            self.state = IocState::Reset;
        } else {
            self.state = IocState::Ready;
        }
    }

    fn write_diag_data(&mut self, value: u32) {
        if !self.diag.contains(HostDiagnostic::DRWE) {
            return;
        }
        let at = self.diag_rw_addr as usize;
        if self.downloaded.len() < at + 4 {
            self.downloaded.resize(at + 4, 0);
        }
        self.downloaded[at..at + 4].copy_from_slice(&value.to_le_bytes());
        self.diag_rw_addr = self.diag_rw_addr.wrapping_add(4);
    }

    fn boot_downloaded(&mut self) {
        let Some(image) = self.config.firmware.as_deref() else {
            self.state = IocState::Ready;
            return;
        };
        let matches = self.downloaded.len() >= image.len()
            && &self.downloaded[..image.len()] == image
            && self.downloaded[image.len()..].iter().all(|&b| b == 0);
        if matches {
            self.stats.download_boots += 1;
            self.state = IocState::Ready;
        } else {
            self.fault(FAULT_BAD_IMAGE);
        }
    }
}
