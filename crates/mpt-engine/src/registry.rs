//! Consumer registry.
//!
//! Upper-layer drivers (SCSI host, target mode, LAN, management) register a reply callback and
//! get back a [`CallbackIndex`]. The index travels inside every request's `MsgContext`, so a
//! reply can be routed back to whoever submitted the frame without any lookup table.
//!
//! The registry is a fixed array of [`MAX_CONSUMERS`] slots behind one mutex. Slot 0 is never
//! handed out (a zero index in a reply is always a protocol error); a new registration takes the
//! lowest free slot, so indices freed by `deregister` are reused first. Handlers are cloned out
//! of the lock before they run.

use std::fmt;
use std::sync::{Arc, Mutex};

use mpt_protocol::EventNotificationReply;

use crate::arena::Frame;
use crate::dispatch::ReplyFrame;
use crate::error::RegistryError;
use crate::ioc::Ioc;
use crate::sync::lock;

pub const MAX_CONSUMERS: usize = 16;

/// Index of a registered consumer, `1..MAX_CONSUMERS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackIndex(u8);

impl CallbackIndex {
    pub fn new(raw: u8) -> Option<Self> {
        if raw == 0 || raw as usize >= MAX_CONSUMERS {
            None
        } else {
            Some(CallbackIndex(raw))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for CallbackIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerClass {
    /// The engine's own consumer: facts, events, internal commands.
    Base,
    ScsiInitiator,
    ScsiTarget,
    Lan,
    Control,
    Raid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetPhase {
    /// Stop issuing new work.
    Setup,
    /// The reset is committed; in-flight work is gone.
    Pre,
    /// The controller is operational again.
    Post,
}

/// Called for every reply to a frame the consumer submitted. `reply` is `None` for turbo
/// (context-only) replies. Returning `true` releases the frame; `false` keeps it with the
/// controller, as for event notifications that will be answered again.
///
/// The callback must not release `frame` itself.
pub type ReplyCallback = Arc<dyn Fn(&Ioc, &mut Frame, Option<&ReplyFrame>) -> bool + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&Ioc, &EventNotificationReply) + Send + Sync>;
pub type ResetHandler = Arc<dyn Fn(&Ioc, ResetPhase) + Send + Sync>;

#[derive(Clone)]
struct Consumer {
    class: ConsumerClass,
    reply: ReplyCallback,
    event: Option<EventHandler>,
    reset: Option<ResetHandler>,
}

pub struct Registry {
    slots: Mutex<Vec<Option<Consumer>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            slots: Mutex::new(vec![None; MAX_CONSUMERS]),
        }
    }

    pub fn register(
        &self,
        class: ConsumerClass,
        reply: ReplyCallback,
    ) -> Result<CallbackIndex, RegistryError> {
        let mut slots = lock(&self.slots);
        let idx = (1..MAX_CONSUMERS)
            .find(|&i| slots[i].is_none())
            .ok_or(RegistryError::Full)?;
        slots[idx] = Some(Consumer {
            class,
            reply,
            event: None,
            reset: None,
        });
        Ok(CallbackIndex(idx as u8))
    }

    pub fn deregister(&self, idx: CallbackIndex) -> Result<(), RegistryError> {
        let mut slots = lock(&self.slots);
        match slots[idx.0 as usize].take() {
            Some(_) => Ok(()),
            None => Err(RegistryError::NotRegistered(idx.0)),
        }
    }

    fn update(
        &self,
        idx: CallbackIndex,
        f: impl FnOnce(&mut Consumer),
    ) -> Result<(), RegistryError> {
        let mut slots = lock(&self.slots);
        let consumer = slots[idx.0 as usize]
            .as_mut()
            .ok_or(RegistryError::NotRegistered(idx.0))?;
        f(consumer);
        Ok(())
    }

    pub fn set_event_handler(
        &self,
        idx: CallbackIndex,
        handler: Option<EventHandler>,
    ) -> Result<(), RegistryError> {
        self.update(idx, |c| c.event = handler)
    }

    pub fn set_reset_handler(
        &self,
        idx: CallbackIndex,
        handler: Option<ResetHandler>,
    ) -> Result<(), RegistryError> {
        self.update(idx, |c| c.reset = handler)
    }

    pub fn class_of(&self, idx: CallbackIndex) -> Option<ConsumerClass> {
        lock(&self.slots)[idx.0 as usize].as_ref().map(|c| c.class)
    }

    pub fn reply_callback(&self, idx: CallbackIndex) -> Option<ReplyCallback> {
        lock(&self.slots)[idx.0 as usize]
            .as_ref()
            .map(|c| c.reply.clone())
    }

    pub fn event_handlers(&self) -> Vec<(CallbackIndex, EventHandler)> {
        let slots = lock(&self.slots);
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let handler = c.as_ref()?.event.clone()?;
                Some((CallbackIndex(i as u8), handler))
            })
            .collect()
    }

    pub fn reset_handlers(&self) -> Vec<(CallbackIndex, ResetHandler)> {
        let slots = lock(&self.slots);
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let handler = c.as_ref()?.reset.clone()?;
                Some((CallbackIndex(i as u8), handler))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ReplyCallback {
        Arc::new(|_: &Ioc, _: &mut Frame, _: Option<&ReplyFrame>| true)
    }

    #[test]
    fn zero_and_out_of_range_indices_are_invalid() {
        assert_eq!(CallbackIndex::new(0), None);
        assert_eq!(CallbackIndex::new(MAX_CONSUMERS as u8), None);
        assert_eq!(CallbackIndex::new(1).map(CallbackIndex::get), Some(1));
    }

    #[test]
    fn registration_takes_lowest_free_slot() {
        let reg = Registry::new();
        let a = reg.register(ConsumerClass::Base, noop()).unwrap();
        let b = reg.register(ConsumerClass::ScsiInitiator, noop()).unwrap();
        let c = reg.register(ConsumerClass::Lan, noop()).unwrap();
        assert_eq!((a.get(), b.get(), c.get()), (1, 2, 3));

        reg.deregister(b).unwrap();
        assert_eq!(reg.deregister(b), Err(RegistryError::NotRegistered(2)));
        let d = reg.register(ConsumerClass::Control, noop()).unwrap();
        assert_eq!(d, b);
        assert_eq!(reg.class_of(d), Some(ConsumerClass::Control));
    }

    #[test]
    fn registry_is_bounded() {
        let reg = Registry::new();
        for _ in 1..MAX_CONSUMERS {
            reg.register(ConsumerClass::ScsiInitiator, noop()).unwrap();
        }
        assert_eq!(reg.len(), MAX_CONSUMERS - 1);
        assert_eq!(
            reg.register(ConsumerClass::ScsiInitiator, noop()),
            Err(RegistryError::Full)
        );
    }

    #[test]
    fn handlers_are_snapshotted_per_slot() {
        let reg = Registry::new();
        let a = reg.register(ConsumerClass::Base, noop()).unwrap();
        let b = reg.register(ConsumerClass::ScsiInitiator, noop()).unwrap();
        reg.set_reset_handler(b, Some(Arc::new(|_: &Ioc, _: ResetPhase| {})))
            .unwrap();
        reg.set_event_handler(a, Some(Arc::new(|_: &Ioc, _: &EventNotificationReply| {})))
            .unwrap();

        let resets = reg.reset_handlers();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].0, b);
        assert_eq!(reg.event_handlers()[0].0, a);

        reg.deregister(b).unwrap();
        assert!(reg.reset_handlers().is_empty());
        assert_eq!(
            reg.set_reset_handler(b, None),
            Err(RegistryError::NotRegistered(b.get()))
        );
    }
}
