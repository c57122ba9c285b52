//! Mapping between reply contexts, frame indices and bus addresses.
//!
//! There is no table to keep in sync: a context index is the frame's position in the arena, so
//! resolving one is a bounds check plus a state check.

use std::fmt;

use crate::arena::{FrameArena, FrameGuard, SlotState};
use crate::error::ContextError;
use crate::registry::CallbackIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextIndex(pub u16);

impl fmt::Display for ContextIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FrameArena {
    fn check(&self, index: ContextIndex) -> Result<SlotState, ContextError> {
        let depth = self.depth();
        if index.0 >= depth {
            return Err(ContextError::OutOfRange {
                index: index.0,
                depth,
            });
        }
        match self.state(index.0) {
            Some(SlotState::Free) | None => Err(ContextError::NotInUse(index.0)),
            Some(state) => Ok(state),
        }
    }

    /// Locks the frame a reply refers to. Fails for indices beyond the request depth and for
    /// frames that are free.
    pub fn resolve(&self, index: ContextIndex) -> Result<FrameGuard<'_>, ContextError> {
        self.check(index)?;
        self.lock_frame(index.0)
            .ok_or(ContextError::NotInUse(index.0))
    }

    /// As [`FrameArena::resolve`], additionally requiring that `claimed` owns the frame.
    pub fn resolve_owned(
        &self,
        index: ContextIndex,
        claimed: CallbackIndex,
    ) -> Result<FrameGuard<'_>, ContextError> {
        let state = self.check(index)?;
        match state.owner() {
            Some(owner) if owner == claimed => {}
            Some(owner) => {
                return Err(ContextError::WrongOwner {
                    index: index.0,
                    owner: owner.get(),
                    claimed: claimed.get(),
                })
            }
            None => return Err(ContextError::NotInUse(index.0)),
        }
        self.lock_frame(index.0)
            .ok_or(ContextError::NotInUse(index.0))
    }

    /// As [`FrameArena::resolve_owned`], additionally requiring that the frame is with the
    /// controller. Replies naming a frame the consumer still holds are stale.
    pub fn resolve_submitted(
        &self,
        index: ContextIndex,
        claimed: CallbackIndex,
    ) -> Result<FrameGuard<'_>, ContextError> {
        if let SlotState::Owned(_) = self.check(index)? {
            return Err(ContextError::NotSubmitted(index.0));
        }
        self.resolve_owned(index, claimed)
    }

    pub fn index_of(&self, bus_addr: u64) -> Result<ContextIndex, ContextError> {
        let offset = bus_addr
            .checked_sub(self.base())
            .ok_or(ContextError::BadAddress(bus_addr))?;
        let size = self.frame_size() as u64;
        if offset % size != 0 || offset / size >= self.depth() as u64 {
            return Err(ContextError::BadAddress(bus_addr));
        }
        Ok(ContextIndex((offset / size) as u16))
    }

    pub fn bus_addr_of(&self, index: ContextIndex) -> Option<u64> {
        (index.0 < self.depth())
            .then(|| self.base() + index.0 as u64 * self.frame_size() as u64)
    }
}
