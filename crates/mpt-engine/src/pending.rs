//! Records for commands a thread is blocked on.
//!
//! Each command class has one record, so at most one command per class is outstanding. The
//! issuing thread holds the record's issue lock for the whole exchange and sleeps on its condvar;
//! the reply dispatcher fills in the reply and wakes it. A reset wakes it with `ResetOccurred`.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mpt_protocol::IocStatus;

use crate::error::CommandError;
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Configuration and passthrough commands.
    Base,
    TaskManagement,
    /// Commands the engine issues for itself (RAID actions, firmware upload).
    Internal,
}

impl CommandClass {
    pub const ALL: [CommandClass; 3] = [
        CommandClass::Base,
        CommandClass::TaskManagement,
        CommandClass::Internal,
    ];

    pub(crate) fn slot(self) -> usize {
        match self {
            CommandClass::Base => 0,
            CommandClass::TaskManagement => 1,
            CommandClass::Internal => 2,
        }
    }
}

/// Scratch copy of a command's reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub bytes: Vec<u8>,
    pub ioc_status: IocStatus,
    pub log_info: u32,
}

impl CommandReply {
    /// A reply known only by its turbo descriptor: success with no payload.
    pub fn turbo() -> Self {
        CommandReply {
            bytes: Vec::new(),
            ioc_status: IocStatus::from_code(IocStatus::SUCCESS),
            log_info: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandState {
    Idle,
    Pending { frame: u16 },
    Completed(CommandReply),
    ResetOccurred,
}

pub struct PendingCommand {
    issue: Mutex<()>,
    state: Mutex<CommandState>,
    cond: Condvar,
}

impl Default for PendingCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCommand {
    pub fn new() -> Self {
        PendingCommand {
            issue: Mutex::new(()),
            state: Mutex::new(CommandState::Idle),
            cond: Condvar::new(),
        }
    }

    /// Serializes issuers of this class.
    pub fn issue_lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.issue)
    }

    pub fn begin(&self, frame: u16) {
        *lock(&self.state) = CommandState::Pending { frame };
    }

    /// Frame of the outstanding command, if any.
    pub fn pending_frame(&self) -> Option<u16> {
        match *lock(&self.state) {
            CommandState::Pending { frame } => Some(frame),
            _ => None,
        }
    }

    /// Completes the outstanding command if it was issued on `frame`.
    pub fn complete_if_matches(&self, frame: u16, reply: CommandReply) -> bool {
        let mut state = lock(&self.state);
        if *state != (CommandState::Pending { frame }) {
            return false;
        }
        *state = CommandState::Completed(reply);
        self.cond.notify_all();
        true
    }

    /// Wakes the waiter, if any, with `ResetOccurred`.
    pub fn reset_occurred(&self) -> bool {
        let mut state = lock(&self.state);
        if !matches!(*state, CommandState::Pending { .. }) {
            return false;
        }
        *state = CommandState::ResetOccurred;
        self.cond.notify_all();
        true
    }

    /// Drops any outstanding command without waking anyone.
    pub fn abandon(&self) {
        *lock(&self.state) = CommandState::Idle;
    }

    /// Waits up to `timeout` for the outstanding command. `poll` runs between waits of at most
    /// `slice`; it is how a waiter without an interrupt context drains replies itself.
    pub fn wait(
        &self,
        timeout: Duration,
        slice: Duration,
        mut poll: impl FnMut(),
    ) -> Result<CommandReply, CommandError> {
        let deadline = Instant::now() + timeout;
        loop {
            poll();

            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, CommandState::Idle) {
                CommandState::Completed(reply) => return Ok(reply),
                CommandState::ResetOccurred => return Err(CommandError::ResetOccurred),
                CommandState::Idle => return Err(CommandError::Timeout(timeout)),
                pending @ CommandState::Pending { .. } => *state = pending,
            }

            let now = Instant::now();
            if now >= deadline {
                *state = CommandState::Idle;
                return Err(CommandError::Timeout(timeout));
            }
            let nap = slice.min(deadline - now);
            let (guard, _) = self
                .cond
                .wait_timeout(state, nap)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            drop(guard);
        }
    }
}
