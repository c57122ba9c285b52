//! Background threads: the periodic health check and the reply worker.
//!
//! Both hold only a weak reference to the controller, so dropping the last [`Arc<Ioc>`] ends
//! them too. [`MonitorHandle::stop`] stops one explicitly.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mpt_protocol::{DoorbellStatus, IocState, Register};

use crate::bringup::Phase;
use crate::error::BringUpError;
use crate::ioc::Ioc;
use crate::sync::lock;

pub struct MonitorHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    fn spawn(name: String, interval: Duration, mut tick: impl FnMut() -> bool + Send + 'static) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new().name(name).spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if !tick() {
                        break;
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        Ok(MonitorHandle {
            stop: Some(tx),
            thread: Some(thread),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Ioc {
    /// Checks the doorbell for a firmware fault and recovers if one is found. Returns the
    /// controller state after any recovery.
    pub fn health_check(&self) -> Result<IocState, BringUpError> {
        if self.phase() == Phase::Dead {
            return Err(BringUpError::Dead);
        }
        if self.is_resetting() {
            return Ok(self.ioc_state());
        }
        let db = DoorbellStatus::decode(self.hw.read_reg(Register::Doorbell));
        if db.state != IocState::Fault {
            return Ok(db.state);
        }

        let code = db.fault_code();
        *lock(&self.last_fault) = Some(code);
        tracing::error!(ioc = %self.name, code = format_args!("{code:#06x}"), "controller fault detected");
        self.set_phase(Phase::Faulted);
        self.recover("firmware fault")?;
        Ok(self.ioc_state())
    }

    /// Runs [`Ioc::health_check`] every `health_check_interval`. The thread exits once the
    /// controller is dead.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> std::io::Result<MonitorHandle> {
        let ioc: Weak<Ioc> = Arc::downgrade(self);
        let name = format!("{}-health", self.name);
        MonitorHandle::spawn(name, self.config.health_check_interval(), move || {
            let Some(ioc) = ioc.upgrade() else {
                return false;
            };
            match ioc.health_check() {
                Ok(_) => true,
                Err(BringUpError::Dead) => false,
                Err(err) => {
                    tracing::error!(ioc = %ioc.name, %err, "health check");
                    ioc.phase() != Phase::Dead
                }
            }
        })
    }

    /// Drains the reply FIFO every `interval`, standing in for the interrupt handler.
    pub fn spawn_reply_worker(self: &Arc<Self>, interval: Duration) -> std::io::Result<MonitorHandle> {
        let ioc: Weak<Ioc> = Arc::downgrade(self);
        let name = format!("{}-replies", self.name);
        MonitorHandle::spawn(name, interval, move || {
            let Some(ioc) = ioc.upgrade() else {
                return false;
            };
            ioc.process_replies();
            true
        })
    }
}
