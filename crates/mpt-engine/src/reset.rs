//! Hard reset and recovery.
//!
//! A hard reset goes through the host diagnostic register, which is locked behind a write
//! sequence. If the controller boots from a host-provided image, the cached image is pushed back
//! through the diagnostic read/write window before the controller is released from reset.
//!
//! Recovery wraps a hard reset with the consumer notifications and the bookkeeping that makes
//! in-flight work disappear cleanly, then reruns the bring-up pass. If that pass fails the
//! controller is declared dead.

use std::sync::atomic::Ordering;

use mpt_protocol::regs::{HostDiagnostic, WRITE_SEQUENCE_KEYS, WRITE_SEQUENCE_LOCK};
use mpt_protocol::Register;

use crate::bringup::Phase;
use crate::error::BringUpError;
use crate::ioc::{Ioc, Queues};
use crate::poll::{poll_until, retry};
use crate::registry::ResetPhase;
use crate::sync::lock;

impl Ioc {
    fn host_diag(&self) -> HostDiagnostic {
        HostDiagnostic::from_bits_retain(self.hw.read_reg(Register::HostDiagnostic))
    }

    fn unlock_diag(&self) -> Result<(), BringUpError> {
        retry(self.config.write_sequence_retries, self.register_poll(), |attempt| {
            self.hw.write_reg(Register::WriteSequence, WRITE_SEQUENCE_LOCK);
            for key in WRITE_SEQUENCE_KEYS {
                self.hw.write_reg(Register::WriteSequence, key);
            }
            if self.host_diag().contains(HostDiagnostic::DRWE) {
                Ok(())
            } else {
                tracing::debug!(ioc = %self.name, attempt, "diagnostic write enable not set yet");
                Err(BringUpError::ResetFailed("diagnostic write enable never set"))
            }
        })
    }

    /// Resets the adapter through the diagnostic register and waits for READY.
    pub(crate) fn hard_reset(&self) -> Result<(), BringUpError> {
        tracing::info!(ioc = %self.name, "hard reset");
        self.unlock_diag()?;

        let firmware = self.cached_firmware();
        let mut diag = self.host_diag() | HostDiagnostic::RESET_ADAPTER;
        if firmware.is_some() {
            diag |= HostDiagnostic::DISABLE_ARM;
        }
        self.hw.write_reg(Register::HostDiagnostic, diag.bits());

        poll_until(
            self.config.reset_poll_interval(),
            self.config.reset_timeout(),
            || (!self.host_diag().contains(HostDiagnostic::RESET_ADAPTER)).then_some(()),
        )
        .map_err(|_| BringUpError::ResetFailed("adapter reset did not complete"))?;

        if let Some(image) = firmware {
            self.download_boot(&image);
        }

        let diag = self.host_diag() - HostDiagnostic::RESET_HISTORY;
        self.hw.write_reg(Register::HostDiagnostic, diag.bits());
        self.hw.write_reg(Register::WriteSequence, WRITE_SEQUENCE_LOCK);

        self.wait_ready()
    }

    /// Pushes the cached firmware image through the diagnostic window and lets the
    /// controller boot it.
    fn download_boot(&self, image: &[u8]) {
        tracing::info!(ioc = %self.name, bytes = image.len(), "download boot");
        self.hw.write_reg(Register::DiagRwAddress, 0);
        for chunk in image.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.hw.write_reg(Register::DiagRwData, u32::from_le_bytes(word));
        }
        let diag = self.host_diag() - (HostDiagnostic::DISABLE_ARM | HostDiagnostic::PREVENT_IOC_BOOT);
        self.hw.write_reg(Register::HostDiagnostic, diag.bits());
    }

    /// Returns every frame the controller holds, except `retain`, to the free list. A waiter
    /// whose command was on one of them is woken with `ResetOccurred`.
    pub(crate) fn reclaim_in_flight(&self, q: &Queues, retain: Option<u16>) -> usize {
        let mut reclaimed = 0;
        for (index, cb) in q.arena.in_flight() {
            if Some(index) == retain {
                continue;
            }
            for record in &self.pending {
                if record.pending_frame() == Some(index) {
                    record.reset_occurred();
                }
            }
            q.chains.release_for_request(index);
            if let Err(err) = q.arena.release(index) {
                tracing::warn!(ioc = %self.name, %err, "reclaim");
                continue;
            }
            tracing::debug!(ioc = %self.name, req_idx = index, cb_idx = cb.get(), "reclaimed frame");
            reclaimed += 1;
        }
        reclaimed
    }

    fn notify_reset(&self, phase: ResetPhase) {
        for (cb, handler) in self.registry.reset_handlers() {
            tracing::trace!(ioc = %self.name, cb_idx = cb.get(), ?phase, "reset handler");
            handler(self, phase);
        }
    }

    /// Resets the controller and brings it back to OPERATIONAL.
    ///
    /// Concurrent callers coalesce: a caller that waited on another recovery returns that
    /// recovery's outcome instead of resetting again.
    pub fn recover(&self, reason: &str) -> Result<(), BringUpError> {
        let seen = self.generation.load(Ordering::Acquire);
        let _serial = lock(&self.recovery_lock);
        if self.phase() == Phase::Dead {
            return Err(BringUpError::Dead);
        }
        if self.generation.load(Ordering::Acquire) != seen {
            tracing::debug!(ioc = %self.name, reason, "recovery already done by another caller");
            return Ok(());
        }

        tracing::warn!(ioc = %self.name, reason, "recovering controller");
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.set_phase(Phase::Recovering);
        self.resetting.store(true, Ordering::Release);
        self.notify_reset(ResetPhase::Setup);

        if let Some(q) = self.queues.get() {
            q.arena.set_active(false);
        }
        let reset = self.hard_reset();

        self.notify_reset(ResetPhase::Pre);
        for record in &self.pending {
            record.reset_occurred();
        }
        if let Some(q) = self.queues.get() {
            let _order = lock(&self.dispatch_lock);
            let reclaimed = self.reclaim_in_flight(q, None);
            tracing::debug!(ioc = %self.name, reclaimed, "in-flight frames reclaimed");
        }
        lock(&self.event_frame).take();
        self.events_enabled.store(false, Ordering::Release);

        let res = reset.and_then(|()| self.bring_up_pass());
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.resetting.store(false, Ordering::Release);

        match res {
            Ok(()) => {
                self.notify_reset(ResetPhase::Post);
                tracing::info!(ioc = %self.name, "recovery complete");
                Ok(())
            }
            Err(err) => {
                tracing::error!(ioc = %self.name, %err, "recovery failed; controller is dead");
                self.set_phase(Phase::Dead);
                if let Some(q) = self.queues.get() {
                    q.arena.set_active(false);
                }
                for record in &self.pending {
                    record.reset_occurred();
                }
                self.hw.remove_device();
                Err(err)
            }
        }
    }
}
