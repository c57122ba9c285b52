//! Request frame arena.
//!
//! All request frames are carved out of one contiguous DMA region at `base + index * frame_size`,
//! so a frame's index, its bus address and its `MsgContext` request index are the same thing.
//! Each frame keeps a host copy of its bytes; the copy is pushed to DMA memory on submission.
//!
//! The free list is a FIFO: `release` appends to the tail and `acquire` takes the head. With
//! nothing else in flight, the frame returned after a release is the oldest free one.
//!
//! Lock order is free list, then frame. `acquire` and `release` hold the free-list lock while
//! they stamp the frame so no other thread can observe a half-initialized slot.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use mpt_protocol::header::{self, MSG_CONTEXT_OFFSET};
use mpt_protocol::MsgContext;

use crate::error::{CommandError, ReleaseError, Unavailable};
use crate::registry::CallbackIndex;
use crate::sync::lock;

/// Written into a frame's context word on release.
pub const RELEASED_SENTINEL: u32 = 0xdead_beaf;

pub type FrameGuard<'a> = MutexGuard<'a, Frame>;

/// One request frame: its identity plus the host copy of its bytes.
#[derive(Debug)]
pub struct Frame {
    index: u16,
    bus_addr: u64,
    data: Box<[u8]>,
}

impl Frame {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn context(&self) -> MsgContext {
        MsgContext::from_u32(self.context_word())
    }

    pub fn function(&self) -> u8 {
        self.data[header::FUNCTION_BYTE]
    }

    fn context_word(&self) -> u32 {
        let c = &self.data[MSG_CONTEXT_OFFSET..MSG_CONTEXT_OFFSET + 4];
        u32::from_le_bytes([c[0], c[1], c[2], c[3]])
    }

    /// Copies a request into the frame and re-stamps the frame's own context over whatever the
    /// request carried. The frame is left untouched if the request does not fit.
    pub fn load(&mut self, request: &[u8]) -> Result<(), CommandError> {
        if request.len() > self.data.len() {
            return Err(CommandError::RequestTooLarge {
                len: request.len(),
                frame_size: self.data.len(),
            });
        }
        let ctx = self.context();
        self.data.fill(0);
        self.data[..request.len()].copy_from_slice(request);
        header::stamp_context(&mut self.data, ctx);
        Ok(())
    }
}

/// Lightweight reference to an acquired frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    index: u16,
    callback: CallbackIndex,
}

impl FrameHandle {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn callback(&self) -> CallbackIndex {
        self.callback
    }

    pub fn context(&self) -> MsgContext {
        MsgContext::new(self.index, self.callback.get())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Held by a consumer, not yet handed to the controller.
    Owned(CallbackIndex),
    /// Posted to the controller; a reply is expected.
    Submitted(CallbackIndex),
}

impl SlotState {
    pub fn owner(self) -> Option<CallbackIndex> {
        match self {
            SlotState::Free => None,
            SlotState::Owned(cb) | SlotState::Submitted(cb) => Some(cb),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    pub total: usize,
    pub free: usize,
    pub owned: usize,
    pub submitted: usize,
}

struct FreeList {
    active: bool,
    free: VecDeque<u16>,
    states: Vec<SlotState>,
}

pub struct FrameArena {
    base: u64,
    frame_size: usize,
    frames: Vec<Mutex<Frame>>,
    list: Mutex<FreeList>,
}

impl FrameArena {
    /// Creates `depth` frames of `frame_size` bytes starting at bus address `base`. The arena
    /// starts inactive.
    pub fn new(base: u64, frame_size: usize, depth: u16) -> Self {
        let frames = (0..depth)
            .map(|index| {
                let mut data = vec![0u8; frame_size].into_boxed_slice();
                data[MSG_CONTEXT_OFFSET..MSG_CONTEXT_OFFSET + 4]
                    .copy_from_slice(&RELEASED_SENTINEL.to_le_bytes());
                Mutex::new(Frame {
                    index,
                    bus_addr: base + index as u64 * frame_size as u64,
                    data,
                })
            })
            .collect();
        FrameArena {
            base,
            frame_size,
            frames,
            list: Mutex::new(FreeList {
                active: false,
                free: (0..depth).collect(),
                states: vec![SlotState::Free; depth as usize],
            }),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn depth(&self) -> u16 {
        self.frames.len() as u16
    }

    pub fn set_active(&self, active: bool) {
        lock(&self.list).active = active;
    }

    pub fn is_active(&self) -> bool {
        lock(&self.list).active
    }

    pub fn acquire(&self, callback: CallbackIndex) -> Result<FrameHandle, Unavailable> {
        let mut list = lock(&self.list);
        if !list.active {
            return Err(Unavailable::Inactive);
        }
        let index = list.free.pop_front().ok_or(Unavailable::Exhausted)?;
        list.states[index as usize] = SlotState::Owned(callback);

        let mut frame = lock(&self.frames[index as usize]);
        frame.data.fill(0);
        header::stamp_context(&mut frame.data, MsgContext::new(index, callback.get()));
        Ok(FrameHandle { index, callback })
    }

    /// Returns a frame to the tail of the free list.
    pub fn release(&self, index: u16) -> Result<(), ReleaseError> {
        let mut list = lock(&self.list);
        let state = list
            .states
            .get(index as usize)
            .copied()
            .ok_or(ReleaseError::OutOfRange(index))?;
        if state == SlotState::Free {
            return Err(ReleaseError::DoubleRelease(index));
        }
        {
            let mut frame = lock(&self.frames[index as usize]);
            frame.data[MSG_CONTEXT_OFFSET..MSG_CONTEXT_OFFSET + 4]
                .copy_from_slice(&RELEASED_SENTINEL.to_le_bytes());
        }
        list.states[index as usize] = SlotState::Free;
        list.free.push_back(index);
        Ok(())
    }

    pub(crate) fn mark_submitted(&self, index: u16) -> Option<CallbackIndex> {
        let mut list = lock(&self.list);
        match list.states.get(index as usize).copied()? {
            SlotState::Owned(cb) | SlotState::Submitted(cb) => {
                list.states[index as usize] = SlotState::Submitted(cb);
                Some(cb)
            }
            SlotState::Free => None,
        }
    }

    /// Takes a submitted frame back from the controller without releasing it.
    pub(crate) fn mark_owned(&self, index: u16) {
        let mut list = lock(&self.list);
        if let Some(SlotState::Submitted(cb)) = list.states.get(index as usize).copied() {
            list.states[index as usize] = SlotState::Owned(cb);
        }
    }

    pub fn state(&self, index: u16) -> Option<SlotState> {
        lock(&self.list).states.get(index as usize).copied()
    }

    /// Locks a frame without checking its state.
    pub(crate) fn lock_frame(&self, index: u16) -> Option<FrameGuard<'_>> {
        self.frames.get(index as usize).map(|f| lock(f))
    }

    /// Whether the frame's context word holds the release sentinel.
    pub fn is_marked_released(&self, index: u16) -> bool {
        self.lock_frame(index)
            .map(|f| f.context_word() == RELEASED_SENTINEL)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> ArenaStats {
        let list = lock(&self.list);
        let mut stats = ArenaStats {
            total: list.states.len(),
            free: list.free.len(),
            ..ArenaStats::default()
        };
        for state in &list.states {
            match state {
                SlotState::Free => {}
                SlotState::Owned(_) => stats.owned += 1,
                SlotState::Submitted(_) => stats.submitted += 1,
            }
        }
        stats
    }

    /// Frames currently held by the controller.
    pub fn in_flight(&self) -> Vec<(u16, CallbackIndex)> {
        let list = lock(&self.list);
        list.states
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match *s {
                SlotState::Submitted(cb) => Some((i as u16, cb)),
                _ => None,
            })
            .collect()
    }
}
